//! View type published by the view authority.

use std::fmt;

use serde::{Deserialize, Serialize};

/// View number type. Views form a total order by number.
pub type ViewNum = u64;

/// An immutable configuration value: who is primary and who is backup at a
/// given point of the view sequence. View 0 is the distinguished initial
/// value naming nobody; primaries exist only at view number >= 1.
#[derive(Debug, PartialEq, Eq, Clone, Serialize, Deserialize)]
pub struct View {
    /// View number, incremented by exactly 1 on every change.
    pub number: ViewNum,

    /// Address of the replica serving reads and writes, if any.
    pub primary: Option<String>,

    /// Address of the replica receiving forwarded writes, if any.
    pub backup: Option<String>,
}

impl View {
    /// The initial empty view.
    pub fn initial() -> Self {
        View {
            number: 0,
            primary: None,
            backup: None,
        }
    }

    /// True if the given server is this view's primary.
    pub fn primary_is(&self, server: &str) -> bool {
        self.primary.as_deref() == Some(server)
    }

    /// True if the given server is this view's backup.
    pub fn backup_is(&self, server: &str) -> bool {
        self.backup.as_deref() == Some(server)
    }
}

impl fmt::Display for View {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(
            f,
            "({}, p={}, b={})",
            self.number,
            self.primary.as_deref().unwrap_or("-"),
            self.backup.as_deref().unwrap_or("-")
        )
    }
}
