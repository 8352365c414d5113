use std::collections::HashMap;

use parking_lot::Mutex;
use serde_json::Value;

/// Durable key-value store backing preference scopes and configuration overrides.
///
/// Implementations must be safe for concurrent use; the engine issues writes
/// from whichever thread committed the change.
pub trait Preferences: Send + Sync {
    fn object(&self, key: &str) -> Option<Value>;

    /// Stores `value` under `key`, removing the entry for `None`.
    fn set(&self, key: &str, value: Option<Value>);

    /// Read-modify-write of a single entry.
    fn transaction(&self, key: &str, update: &mut dyn FnMut(&mut Option<Value>)) {
        let mut object = self.object(key);
        update(&mut object);
        self.set(key, object);
    }
}

/// Process-local preferences, lost on drop.
#[derive(Debug, Default)]
pub struct MemoryPreferences {
    entries: Mutex<HashMap<String, Value>>,
}

impl MemoryPreferences {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seeds the store, e.g. with what a previous run persisted.
    pub fn with(self, key: impl Into<String>, value: Value) -> Self {
        self.entries.lock().insert(key.into(), value);
        self
    }

    pub fn keys(&self) -> Vec<String> {
        self.entries.lock().keys().cloned().collect()
    }
}

impl Preferences for MemoryPreferences {
    fn object(&self, key: &str) -> Option<Value> {
        self.entries.lock().get(key).cloned()
    }

    fn set(&self, key: &str, value: Option<Value>) {
        let mut entries = self.entries.lock();
        match value {
            Some(value) => {
                entries.insert(key.to_string(), value);
            }
            None => {
                entries.remove(key);
            }
        }
    }

    fn transaction(&self, key: &str, update: &mut dyn FnMut(&mut Option<Value>)) {
        let mut entries = self.entries.lock();
        let mut object = entries.get(key).cloned();
        update(&mut object);
        match object {
            Some(value) => {
                entries.insert(key.to_string(), value);
            }
            None => {
                entries.remove(key);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn transaction_updates_in_place() {
        let preferences = MemoryPreferences::new().with("scopes", json!({ "a": 1 }));
        preferences.transaction("scopes", &mut |object| {
            if let Some(Value::Object(map)) = object {
                map.insert("b".to_string(), json!(2));
            }
        });
        assert_eq!(preferences.object("scopes"), Some(json!({ "a": 1, "b": 2 })));

        preferences.transaction("scopes", &mut |object| *object = None);
        assert_eq!(preferences.object("scopes"), None);
    }
}
