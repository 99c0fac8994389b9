//! Persistence Side Channel
//!
//! Cells created with a storage key seed their initial value from a
//! [`Storage`] backend and write every committed plain value back through
//! it. The channel is best-effort by contract: a backend failure or an
//! unmarshallable stored value is logged and skipped, it never fails the
//! commit or the cell construction.
//!
//! Values cross the boundary as strings. The engine builder installs a
//! marshal/unmarshal pair; [`json_marshaller`] builds the default pair for
//! any serde-capable value type.

use std::sync::Arc;

use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::debug;

/// A key-value backend for persisted cells.
pub trait Storage: Send + Sync {
    /// Read a previously stored value. `None` when absent or unreadable.
    fn get(&self, key: &str) -> Option<String>;
    /// Store a value. Failures must be swallowed by the implementation.
    fn set(&self, key: &str, value: &str);
}

pub type MarshalFn<V> = Arc<dyn Fn(&V) -> Option<String> + Send + Sync>;
pub type UnmarshalFn<V> = Arc<dyn Fn(&str) -> Option<V> + Send + Sync>;

/// The default JSON marshal/unmarshal pair.
pub fn json_marshaller<V>() -> (MarshalFn<V>, UnmarshalFn<V>)
where
    V: Serialize + DeserializeOwned + 'static,
{
    let marshal: MarshalFn<V> = Arc::new(|v| match serde_json::to_string(v) {
        Ok(s) => Some(s),
        Err(err) => {
            debug!(%err, "value not marshallable, skipping storage write");
            None
        }
    });
    let unmarshal: UnmarshalFn<V> = Arc::new(|s| match serde_json::from_str(s) {
        Ok(v) => Some(v),
        Err(err) => {
            debug!(%err, "stored value not unmarshallable, ignoring");
            None
        }
    });
    (marshal, unmarshal)
}

/// In-memory backend, mainly for tests.
#[derive(Default)]
pub struct MemoryStorage {
    map: parking_lot::Mutex<std::collections::HashMap<String, String>>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Storage for MemoryStorage {
    fn get(&self, key: &str) -> Option<String> {
        self.map.lock().get(key).cloned()
    }

    fn set(&self, key: &str, value: &str) {
        self.map.lock().insert(key.to_string(), value.to_string());
    }
}
