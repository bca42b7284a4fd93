//! The local volatile key-value store, owned by the replica's event loop.

use std::collections::HashMap;

/// In-memory key -> value mapping. Lives from process start to process exit;
/// replaced wholesale when a transferred snapshot is installed.
#[derive(Debug, Default)]
pub(crate) struct Store {
    data: HashMap<String, String>,
}

impl Store {
    /// Creates a new empty store.
    pub(crate) fn new() -> Self {
        Store {
            data: HashMap::new(),
        }
    }

    /// Looks up the value of a key.
    pub(crate) fn get(&self, key: &str) -> Option<&String> {
        self.data.get(key)
    }

    /// Writes a key, last-writer-wins.
    pub(crate) fn put(&mut self, key: String, value: String) {
        self.data.insert(key, value);
    }

    /// Replaces the entire contents with the given snapshot.
    pub(crate) fn install(&mut self, data: HashMap<String, String>) {
        self.data = data;
    }

    /// Copies the full contents out, for transfer or diagnostics.
    pub(crate) fn snapshot(&self) -> HashMap<String, String> {
        self.data.clone()
    }

    /// Number of keys held.
    pub(crate) fn len(&self) -> usize {
        self.data.len()
    }
}
