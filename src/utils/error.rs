//! Customized unified error type.

use std::fmt;
use std::io;
use std::net;

/// Customized error type for viewkv.
#[derive(Debug, PartialEq, Eq, Clone)]
pub struct ViewKvError(pub String);

impl ViewKvError {
    /// Constructs an error out of anything that can be turned into a string.
    pub fn msg(m: impl ToString) -> Self {
        ViewKvError(m.to_string())
    }
}

impl fmt::Display for ViewKvError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.0) // do not display literal quotes
    }
}

impl std::error::Error for ViewKvError {}

// Helper macro for saving boiler-plate `impl From<T>`s for transparent
// conversion from various common error types to `ViewKvError`.
macro_rules! impl_from_error {
    ($error:ty) => {
        impl From<$error> for ViewKvError {
            fn from(e: $error) -> Self {
                // just store the source error's string representation
                ViewKvError(e.to_string())
            }
        }
    };
}

impl_from_error!(io::Error);
impl_from_error!(net::AddrParseError);
impl_from_error!(rmp_serde::encode::Error);
impl_from_error!(rmp_serde::decode::Error);
impl_from_error!(toml::de::Error);
impl_from_error!(tokio::time::error::Elapsed);
impl_from_error!(tokio::task::JoinError);
impl_from_error!(tokio::sync::oneshot::error::RecvError);

impl<T> From<tokio::sync::mpsc::error::SendError<T>> for ViewKvError {
    fn from(e: tokio::sync::mpsc::error::SendError<T>) -> Self {
        ViewKvError(e.to_string())
    }
}

impl<T> From<tokio::sync::watch::error::SendError<T>> for ViewKvError {
    fn from(e: tokio::sync::watch::error::SendError<T>) -> Self {
        ViewKvError(e.to_string())
    }
}
