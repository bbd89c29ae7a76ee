use std::sync::Arc;

use parking_lot::Mutex;
use tollgate_core::{LicenseError, LicenseInfo};

/// A verified license together with its signature.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConfiguredLicense {
    pub info: LicenseInfo,
    /// Identifies the license across key renewals with the same terms.
    pub signature: String,
}

struct CacheEntry {
    key_text: String,
    license: Arc<ConfiguredLicense>,
}

/// Remembers the last successfully verified key so signature verification
/// only runs when the configured key text changes.
///
/// Failures are never cached: a broken key is re-parsed on every call until
/// it is fixed.
#[derive(Default)]
pub struct LicenseCache {
    last: Mutex<Option<CacheEntry>>,
}

impl LicenseCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get_or_parse<F>(
        &self,
        key_text: &str,
        parse: F,
    ) -> Result<Arc<ConfiguredLicense>, LicenseError>
    where
        F: FnOnce(&str) -> Result<ConfiguredLicense, LicenseError>,
    {
        let mut last = self.last.lock();
        if let Some(entry) = last.as_ref() {
            if entry.key_text == key_text {
                return Ok(Arc::clone(&entry.license));
            }
        }

        let license = Arc::new(parse(key_text)?);
        *last = Some(CacheEntry {
            key_text: key_text.to_string(),
            license: Arc::clone(&license),
        });
        Ok(license)
    }

    pub fn invalidate(&self) {
        *self.last.lock() = None;
    }
}
