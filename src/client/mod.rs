//! Client functionality modules.

mod apistub;
mod client;
mod ctrlstub;

pub use client::{ClientConfig, KvClient};

pub(crate) use apistub::ApiStub;
pub(crate) use ctrlstub::CtrlStub;
