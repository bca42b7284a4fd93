//! Replica-facing request/reply wire types.

use std::collections::HashMap;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::authority::{View, ViewNum};

/// Role a replica currently holds, as dictated by its known view.
#[derive(Debug, PartialEq, Eq, Clone, Copy, Serialize, Deserialize)]
pub enum Role {
    /// Serves client reads and writes.
    Primary,

    /// Receives forwarded writes and full-store installs.
    Backup,

    /// Known to the authority but serving nothing.
    Idle,
}

impl Role {
    /// Derives the role the given view dictates for the named replica.
    pub(crate) fn of(view: &View, me: &str) -> Role {
        if view.primary_is(me) {
            Role::Primary
        } else if view.backup_is(me) {
            Role::Backup
        } else {
            Role::Idle
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Role::Primary => write!(f, "primary"),
            Role::Backup => write!(f, "backup"),
            Role::Idle => write!(f, "idle"),
        }
    }
}

/// Request to a replica, from clients or from the primary peer.
#[derive(Debug, PartialEq, Eq, Clone, Serialize, Deserialize)]
pub enum ApiRequest {
    /// Client read of one key. Served by the primary only.
    Get { key: String },

    /// Client write of one key. Served by the primary only.
    Put { key: String, value: String },

    /// Primary -> backup relay of one accepted write.
    ForwardUpdate { key: String, value: String },

    /// Primary -> backup wholesale store install. The view number is
    /// informational, for diagnostics.
    SyncState {
        data: HashMap<String, String>,
        view_num: ViewNum,
    },

    /// Diagnostics: report the replica's view, role, and store contents.
    Dump,
}

/// Diagnostics snapshot of one replica.
#[derive(Debug, PartialEq, Eq, Clone, Serialize, Deserialize)]
pub struct StoreDump {
    /// The replica's latest known view.
    pub view: View,

    /// The role that view dictates for the replica.
    pub role: Role,

    /// True while a store transfer to a new backup is in flight.
    pub syncing: bool,

    /// Copy of the replica's key-value store.
    pub store: HashMap<String, String>,
}

/// Reply from a replica.
#[derive(Debug, PartialEq, Eq, Clone, Serialize, Deserialize)]
pub enum ApiReply {
    /// Successful `Get`.
    Value { value: String },

    /// Successful `Put`, `ForwardUpdate`, or `SyncState`.
    Ok,

    /// `Get` of an absent key.
    NoKey,

    /// The replica does not hold the role the request requires.
    NotPrimary,

    /// Reply to `Dump`.
    Dump(StoreDump),
}

#[cfg(test)]
mod api_tests {
    use super::*;

    #[test]
    fn role_derivation() {
        let view = View {
            number: 4,
            primary: Some("p".into()),
            backup: Some("b".into()),
        };
        assert_eq!(Role::of(&view, "p"), Role::Primary);
        assert_eq!(Role::of(&view, "b"), Role::Backup);
        assert_eq!(Role::of(&view, "x"), Role::Idle);
        assert_eq!(Role::of(&View::initial(), "p"), Role::Idle);
    }
}
