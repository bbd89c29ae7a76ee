use std::collections::HashMap;

use parking_lot::Mutex;

use crate::error::LicenseError;

/// Shared key-value storage reachable from every instance of a deployment.
///
/// Every operation is a single-key write or read; callers never need
/// multi-key transactions.
pub trait KeyValueStore: Send + Sync {
    fn get(&self, key: &str) -> Result<Option<String>, LicenseError>;

    fn set(&self, key: &str, value: &str) -> Result<(), LicenseError>;

    fn delete(&self, key: &str) -> Result<(), LicenseError>;

    /// Read one field of the hash stored at `key`.
    fn hget(&self, key: &str, field: &str) -> Result<Option<String>, LicenseError>;

    fn hset(&self, key: &str, field: &str, value: &str) -> Result<(), LicenseError>;

    fn get_bool(&self, key: &str) -> Result<Option<bool>, LicenseError> {
        match self.get(key)? {
            Some(v) => v
                .parse::<bool>()
                .map(Some)
                .map_err(|_| LicenseError::Store(format!("{} holds non-boolean {:?}", key, v))),
            None => Ok(None),
        }
    }

    fn set_bool(&self, key: &str, value: bool) -> Result<(), LicenseError> {
        self.set(key, if value { "true" } else { "false" })
    }
}

/// Process-local store, for tests and single-instance deployments.
#[derive(Debug, Default)]
pub struct MemoryStore {
    values: Mutex<HashMap<String, String>>,
    hashes: Mutex<HashMap<String, HashMap<String, String>>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl KeyValueStore for MemoryStore {
    fn get(&self, key: &str) -> Result<Option<String>, LicenseError> {
        Ok(self.values.lock().get(key).cloned())
    }

    fn set(&self, key: &str, value: &str) -> Result<(), LicenseError> {
        self.values.lock().insert(key.to_string(), value.to_string());
        Ok(())
    }

    fn delete(&self, key: &str) -> Result<(), LicenseError> {
        self.values.lock().remove(key);
        self.hashes.lock().remove(key);
        Ok(())
    }

    fn hget(&self, key: &str, field: &str) -> Result<Option<String>, LicenseError> {
        Ok(self
            .hashes
            .lock()
            .get(key)
            .and_then(|h| h.get(field))
            .cloned())
    }

    fn hset(&self, key: &str, field: &str, value: &str) -> Result<(), LicenseError> {
        self.hashes
            .lock()
            .entry(key.to_string())
            .or_default()
            .insert(field.to_string(), value.to_string());
        Ok(())
    }
}
