use dashmap::DashMap;
use serde_json::Value;
use std::sync::Arc;

/// Data shared between the tasks of one graph execution.
///
/// Values round-trip through JSON, so any `Serialize`/`Deserialize` type can
/// cross task boundaries. Cloning is cheap and shares the underlying map.
///
/// The synchronous accessors are the real implementation; the async variants
/// exist so task code reads uniformly at await points, and edge conditions
/// (which run outside the async executor path) use the `_sync` forms.
#[derive(Clone, Debug, Default)]
pub struct Context {
    data: Arc<DashMap<String, Value>>,
}

impl Context {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store a value under `key`, replacing any previous one.
    ///
    /// A value that cannot be represented as JSON is a bug in the task that
    /// produced it, so this panics rather than dropping data silently.
    pub fn set_sync(&self, key: impl Into<String>, value: impl serde::Serialize) {
        let key = key.into();
        match serde_json::to_value(value) {
            Ok(value) => {
                self.data.insert(key, value);
            }
            Err(e) => panic!("context value for key {key:?} is not JSON-representable: {e}"),
        }
    }

    /// Fetch and deserialize the value under `key`.
    ///
    /// Returns `None` both for a missing key and for a stored value that no
    /// longer matches the requested type.
    pub fn get_sync<T: serde::de::DeserializeOwned>(&self, key: &str) -> Option<T> {
        self.data
            .get(key)
            .and_then(|v| serde_json::from_value(v.clone()).ok())
    }

    pub async fn set(&self, key: impl Into<String>, value: impl serde::Serialize) {
        self.set_sync(key, value);
    }

    pub async fn get<T: serde::de::DeserializeOwned>(&self, key: &str) -> Option<T> {
        self.get_sync(key)
    }
}
