//! Public interface to the viewkv core library, linked by the view authority,
//! replica server, and client executables.

#[macro_use]
mod utils;

mod authority;
mod client;
mod server;

pub use authority::{
    AuthorityConfig, CtrlReply, CtrlRequest, View, ViewAuthority, ViewNum,
};
pub use client::{ClientConfig, KvClient};
pub use server::{
    ApiReply, ApiRequest, KvReplica, ReplicaConfig, Role, StoreDump,
};
pub use utils::{logger_init, ViewKvError};
