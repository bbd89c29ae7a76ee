use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tollgate_core::crypto::PRODUCTION_PUBLIC_KEY_PEM;
use tollgate_core::LicenseError;

/// Endpoint of the remote licensing authority.
pub const DEFAULT_LICENSE_CHECK_URL: &str = "https://licensing.tollgate.dev/v1/license/check";

pub const DEFAULT_CHECK_INTERVAL: Duration = Duration::from_secs(12 * 60 * 60);
pub const DEFAULT_MAX_USERS_INTERVAL: Duration = Duration::from_secs(6 * 60 * 60);
pub const DEFAULT_HTTP_TIMEOUT: Duration = Duration::from_secs(30);

pub const ENV_GENERATION_KEY: &str = "TOLLGATE_LICENSE_GENERATION_KEY";
pub const ENV_ENFORCE_TIERS: &str = "TOLLGATE_ENFORCE_TIERS";
pub const ENV_LICENSE_CHECK_URL: &str = "TOLLGATE_LICENSE_CHECK_URL";

/// The site-wide settings the licensing engine reads. Changes at runtime.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SiteConfig {
    /// Signed license key. Absent means no license (free tier).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub license_key: Option<String>,
    /// Identifies this instance to the licensing authority.
    #[serde(rename = "siteID", default)]
    pub site_id: String,
}

impl SiteConfig {
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self, LicenseError> {
        let content = std::fs::read_to_string(path)?;
        Ok(serde_json::from_str(&content)?)
    }

    /// The configured key text, treating blank values as unset.
    pub fn license_key(&self) -> Option<&str> {
        self.license_key
            .as_deref()
            .map(str::trim)
            .filter(|k| !k.is_empty())
    }
}

/// Live view of the site configuration.
pub type ConfigWatch = watch::Receiver<SiteConfig>;

/// Create a config channel seeded with `initial`. The sender publishes
/// changes; every receiver observes the latest value.
pub fn config_channel(initial: SiteConfig) -> (watch::Sender<SiteConfig>, ConfigWatch) {
    watch::channel(initial)
}

/// Settings fixed for the lifetime of the engine.
#[derive(Debug, Clone)]
pub struct LicensingOptions {
    pub production_public_key_pem: String,
    /// Public key for verifying self-issued licenses outside production.
    pub generation_public_key_pem: Option<String>,
    /// Reject licenses naming plans this build does not know.
    pub strict_plan_enforcement: bool,
    pub license_check_url: String,
    pub check_interval: Duration,
    pub max_users_interval: Duration,
    pub http_timeout: Duration,
}

impl Default for LicensingOptions {
    fn default() -> Self {
        Self {
            production_public_key_pem: PRODUCTION_PUBLIC_KEY_PEM.to_string(),
            generation_public_key_pem: None,
            strict_plan_enforcement: false,
            license_check_url: DEFAULT_LICENSE_CHECK_URL.to_string(),
            check_interval: DEFAULT_CHECK_INTERVAL,
            max_users_interval: DEFAULT_MAX_USERS_INTERVAL,
            http_timeout: DEFAULT_HTTP_TIMEOUT,
        }
    }
}

impl LicensingOptions {
    /// Defaults overlaid with the `TOLLGATE_*` environment variables.
    pub fn from_env() -> Self {
        Self::default().with_env(|name| std::env::var(name).ok())
    }

    fn with_env(mut self, lookup: impl Fn(&str) -> Option<String>) -> Self {
        if let Some(pem) = lookup(ENV_GENERATION_KEY).filter(|v| !v.trim().is_empty()) {
            self.generation_public_key_pem = Some(pem);
        }
        if let Some(flag) = lookup(ENV_ENFORCE_TIERS) {
            self.strict_plan_enforcement = matches!(flag.trim(), "1" | "true" | "TRUE" | "yes");
        }
        if let Some(url) = lookup(ENV_LICENSE_CHECK_URL).filter(|v| !v.trim().is_empty()) {
            self.license_check_url = url;
        }
        self
    }
}
