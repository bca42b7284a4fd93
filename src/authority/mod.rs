//! The view authority: failure detection and view management.

mod service;
mod tracker;
mod view;

pub use service::{AuthorityConfig, CtrlReply, CtrlRequest, ViewAuthority};
pub use view::{View, ViewNum};

pub(crate) use tracker::ViewTracker;
