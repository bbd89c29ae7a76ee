//! Entitlement engine embedded in every instance.
//!
//! [`Licensing`] answers "is this feature usable right now" for the
//! configured license, enforces the licensed user count, and owns the durable
//! licensing state that the background workers in [`worker`] keep current.

pub mod cache;
pub mod config;
pub mod error;
pub mod remote;
pub mod users;
pub mod validity;
pub mod worker;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;
use tollgate_core::crypto::public_key_from_pem;
use tollgate_core::{
    CompositeFeature, Feature, FeatureNotActivated, Grant, KeyValueStore, KeyVerifier,
    LicenseError, Limit, VerificationMode,
};

pub use cache::{ConfiguredLicense, LicenseCache};
pub use config::{config_channel, ConfigWatch, LicensingOptions, SiteConfig};
pub use error::{
    is_feature_not_activated, AlreadyRunning, CheckError, RemoteCheckError, UserCreationError,
};
pub use remote::{HttpAuthority, ValidityAuthority};
pub use users::{UserCounter, NO_LICENSE_MAXIMUM_ALLOWED_USER_COUNT};
pub use validity::{CheckOutcome, ValidityChecker};
pub use worker::LicenseWorkers;

/// Replaces every feature check, so tests can run without real keys.
pub type CheckOverride = Arc<dyn Fn(&Feature) -> Result<Grant, CheckError> + Send + Sync>;

/// An override that grants every feature without limits.
pub fn allow_all_features() -> CheckOverride {
    Arc::new(|feature: &Feature| -> Result<Grant, CheckError> {
        Ok(match feature {
            Feature::Basic(_) => Grant::Enabled,
            Feature::Composite(CompositeFeature::BatchChanges) => {
                Grant::BatchChanges(Limit::Unrestricted)
            }
            Feature::Composite(CompositeFeature::PrivateRepositories) => {
                Grant::PrivateRepositories(Limit::Unrestricted)
            }
        })
    })
}

/// Process-wide licensing state. Construct once at startup and share it
/// behind an `Arc` with every call site.
pub struct Licensing {
    config: ConfigWatch,
    options: LicensingOptions,
    verifier: KeyVerifier,
    cache: LicenseCache,
    store: Arc<dyn KeyValueStore>,
    max_users: users::MaxUserTracker,
    check_override: RwLock<Option<CheckOverride>>,
    workers_running: AtomicBool,
}

impl Licensing {
    pub fn new(
        config: ConfigWatch,
        store: Arc<dyn KeyValueStore>,
        options: LicensingOptions,
    ) -> Result<Self, LicenseError> {
        let mut verifier = KeyVerifier::new(public_key_from_pem(&options.production_public_key_pem)?);
        if let Some(pem) = &options.generation_public_key_pem {
            verifier = verifier.with_generation_key(public_key_from_pem(pem)?);
        }

        Ok(Self {
            config,
            options,
            verifier,
            cache: LicenseCache::new(),
            max_users: users::MaxUserTracker::new(Arc::clone(&store)),
            store,
            check_override: RwLock::new(None),
            workers_running: AtomicBool::new(false),
        })
    }

    pub fn options(&self) -> &LicensingOptions {
        &self.options
    }

    pub fn store(&self) -> &Arc<dyn KeyValueStore> {
        &self.store
    }

    pub fn site_config(&self) -> SiteConfig {
        self.config.borrow().clone()
    }

    /// A fresh receiver for configuration change notifications.
    pub fn subscribe_config(&self) -> ConfigWatch {
        self.config.clone()
    }

    /// Verify a key with the generation key when one is configured, otherwise
    /// with the production key.
    pub fn parse_license_key(&self, key_text: &str) -> Result<ConfiguredLicense, LicenseError> {
        let (info, signature) = self
            .verifier
            .parse(key_text, VerificationMode::PreferGeneration)?;
        if self.options.strict_plan_enforcement {
            info.has_unknown_plan()?;
        }
        Ok(ConfiguredLicense { info, signature })
    }

    /// The license currently configured for the site, or `None` when no key
    /// is set. Verification only runs when the key text changed since the
    /// last successful call.
    pub fn configured_license(&self) -> Result<Option<Arc<ConfiguredLicense>>, LicenseError> {
        let key_text = match self.config.borrow().license_key() {
            Some(k) => k.to_string(),
            None => return Ok(None),
        };
        self.license_for_key(&key_text).map(Some)
    }

    /// Cached verification of a specific key text.
    pub(crate) fn license_for_key(
        &self,
        key_text: &str,
    ) -> Result<Arc<ConfiguredLicense>, LicenseError> {
        self.cache
            .get_or_parse(key_text, |k| self.parse_license_key(k))
    }

    /// Config validation: rejects anything about the key that would make it
    /// untrusted. Runs uncached so it always reflects the submitted config.
    pub fn validate_config(&self, config: &SiteConfig) -> Result<(), LicenseError> {
        let Some(key_text) = config.license_key() else {
            return Ok(());
        };
        self.parse_license_key(key_text).map(|_| ())
    }

    pub fn set_check_override(&self, check: CheckOverride) {
        *self.check_override.write() = Some(check);
    }

    pub fn clear_check_override(&self) {
        *self.check_override.write() = None;
    }

    /// Whether `feature` may be used right now, and with which allowance.
    pub fn check(&self, feature: impl Into<Feature>) -> Result<Grant, CheckError> {
        let feature = feature.into();
        let check_override = self.check_override.read().clone();
        if let Some(check) = check_override {
            return check(&feature);
        }

        let Some(license) = self.configured_license()? else {
            return Err(FeatureNotActivated::no_license(feature.as_str()).into());
        };
        Ok(feature.check(&license.info)?)
    }

    /// Fails open on anything except an explicit "not in your license".
    /// A broken key or store never disables features through this path.
    pub fn is_feature_enabled_lenient(&self, feature: impl Into<Feature>) -> bool {
        match self.check(feature) {
            Ok(_) => true,
            Err(err) => !err.is_feature_not_activated(),
        }
    }

    /// Changeset allowance for batch changes.
    pub fn batch_changes(&self) -> Result<Limit, CheckError> {
        match self.check(CompositeFeature::BatchChanges)? {
            Grant::BatchChanges(limit) => Ok(limit),
            _ => Ok(Limit::Unrestricted),
        }
    }

    pub fn private_repositories(&self) -> Result<Limit, CheckError> {
        match self.check(CompositeFeature::PrivateRepositories)? {
            Grant::PrivateRepositories(limit) => Ok(limit),
            _ => Ok(Limit::Unrestricted),
        }
    }

    fn claim_workers(&self) -> bool {
        self.workers_running
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    fn release_workers(&self) {
        self.workers_running.store(false, Ordering::Release);
    }
}

#[cfg(test)]
pub(crate) mod testutil {
    use std::sync::OnceLock;

    use chrono::{Duration, Utc};
    use rsa::{RsaPrivateKey, RsaPublicKey};
    use tokio::sync::watch;
    use tollgate_core::crypto::{generate_keypair, generate_signed_key, public_key_to_pem};
    use tollgate_core::{LicenseInfo, MemoryStore};

    use super::*;

    pub fn keypair() -> &'static (RsaPrivateKey, RsaPublicKey) {
        static KEYPAIR: OnceLock<(RsaPrivateKey, RsaPublicKey)> = OnceLock::new();
        KEYPAIR.get_or_init(|| generate_keypair(2048).unwrap())
    }

    pub fn info(tags: &[&str], user_count: u32) -> LicenseInfo {
        let mut info = LicenseInfo::new(
            tags.iter().map(|t| t.to_string()).collect(),
            user_count,
            Utc::now() + Duration::days(365),
        );
        info.subscription_id = Some("sub-test".to_string());
        info
    }

    pub fn sign(info: &LicenseInfo) -> String {
        generate_signed_key(info, &keypair().0).unwrap()
    }

    pub fn options() -> LicensingOptions {
        LicensingOptions {
            production_public_key_pem: public_key_to_pem(&keypair().1).unwrap(),
            ..LicensingOptions::default()
        }
    }

    pub fn site(key: Option<String>) -> SiteConfig {
        SiteConfig {
            license_key: key,
            site_id: "site-1234".to_string(),
        }
    }

    /// Engine over an in-memory store with the test key as production key.
    pub fn licensing(key: Option<String>) -> (Arc<Licensing>, watch::Sender<SiteConfig>) {
        licensing_with(key, options())
    }

    pub fn licensing_with(
        key: Option<String>,
        options: LicensingOptions,
    ) -> (Arc<Licensing>, watch::Sender<SiteConfig>) {
        let (tx, rx) = config_channel(site(key));
        let licensing = Licensing::new(rx, Arc::new(MemoryStore::new()), options).unwrap();
        (Arc::new(licensing), tx)
    }
}

#[cfg(test)]
mod tests {
    use super::testutil::*;
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use tollgate_core::crypto::{generate_keypair, generate_signed_key, public_key_to_pem};
    use tollgate_core::BasicFeature;

    fn with_tags(tags: &[&str]) -> Arc<Licensing> {
        licensing(Some(sign(&info(tags, 10)))).0
    }

    #[test]
    fn test_no_license_denies() {
        let (licensing, _tx) = licensing(None);
        let err = licensing.check(BasicFeature::Sso).unwrap_err();
        assert!(err.is_feature_not_activated());
        assert!(err.to_string().contains("requires a valid license"));
        assert!(licensing.configured_license().unwrap().is_none());
    }

    #[test]
    fn test_feature_gating_table() {
        assert!(with_tags(&[]).check(BasicFeature::Sso).is_ok());
        assert!(with_tags(&["plan:business-0"]).check(BasicFeature::Sso).is_ok());
        assert!(with_tags(&["plan:team-0"]).check(BasicFeature::Sso).is_ok());

        let err = with_tags(&["plan:enterprise-0"])
            .check(BasicFeature::Acls)
            .unwrap_err();
        assert!(is_feature_not_activated(&err));

        assert!(with_tags(&["plan:enterprise-0", "acls"])
            .check(BasicFeature::Acls)
            .is_ok());
    }

    #[test]
    fn test_explicit_tag_with_trailing_space() {
        let licensing = with_tags(&["plan:free-0", "code-insights "]);
        assert!(licensing.check(BasicFeature::CodeInsights).is_ok());
        assert!(licensing.check(BasicFeature::Sso).is_err());
    }

    #[test]
    fn test_expired_license_generic_path_ignores_expired_features() {
        let mut expired = info(&["plan:free-0"], 10);
        expired.expires_at = chrono::Utc::now() - chrono::Duration::days(3);
        let (licensing, _tx) = licensing(Some(sign(&expired)));

        // Plan membership alone decides; expiry is handled by the call site.
        assert!(licensing.check(BasicFeature::Monitoring).is_ok());
        assert_eq!(
            licensing.batch_changes().unwrap(),
            Limit::Max(tollgate_core::plan::DEFAULT_MAX_CHANGESETS)
        );
    }

    #[test]
    fn test_composite_grants() {
        let licensing = with_tags(&["plan:free-1"]);
        assert_eq!(licensing.private_repositories().unwrap(), Limit::Max(1));
        assert_eq!(licensing.batch_changes().unwrap(), Limit::Max(10));

        let licensing = with_tags(&["plan:enterprise-1"]);
        assert_eq!(licensing.batch_changes().unwrap(), Limit::Unrestricted);
    }

    #[test]
    fn test_lenient_check() {
        // Broken key: fail open.
        let (licensing, _tx) = licensing(Some("garbage".to_string()));
        assert!(matches!(
            licensing.check(BasicFeature::Acls),
            Err(CheckError::License(LicenseError::MalformedKey(_)))
        ));
        assert!(licensing.is_feature_enabled_lenient(BasicFeature::Acls));

        // Valid key without the feature: fail closed.
        let licensing = with_tags(&["plan:enterprise-0"]);
        assert!(!licensing.is_feature_enabled_lenient(BasicFeature::Acls));
        assert!(licensing.is_feature_enabled_lenient(BasicFeature::Sso));

        // No license: fail closed.
        let (licensing, _tx) = super::testutil::licensing(None);
        assert!(!licensing.is_feature_enabled_lenient(BasicFeature::Sso));
    }

    #[test]
    fn test_check_override() {
        let (licensing, _tx) = licensing(None);
        licensing.set_check_override(allow_all_features());
        assert_eq!(licensing.check(BasicFeature::Acls).unwrap(), Grant::Enabled);
        assert_eq!(licensing.batch_changes().unwrap(), Limit::Unrestricted);

        let seen = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&seen);
        let deny: CheckOverride = Arc::new(move |feature: &Feature| -> Result<Grant, CheckError> {
            counter.fetch_add(1, Ordering::SeqCst);
            Err(FeatureNotActivated::not_in_license(feature.as_str()).into())
        });
        licensing.set_check_override(deny);
        assert!(licensing.check(BasicFeature::Sso).is_err());
        assert_eq!(seen.load(Ordering::SeqCst), 1);

        licensing.clear_check_override();
        assert!(licensing.check(BasicFeature::Sso).is_err());
        assert_eq!(seen.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_configured_license_follows_config_changes() {
        let first = sign(&info(&["plan:team-0"], 10));
        let (licensing, tx) = licensing(Some(first));
        let a = licensing.configured_license().unwrap().unwrap();
        let b = licensing.configured_license().unwrap().unwrap();
        assert!(Arc::ptr_eq(&a, &b));

        tx.send_replace(site(Some(sign(&info(&["plan:business-0"], 20)))));
        let c = licensing.configured_license().unwrap().unwrap();
        assert_eq!(c.info.plan(), tollgate_core::Plan::Business0);
        assert_ne!(a.signature, c.signature);

        tx.send_replace(site(None));
        assert!(licensing.configured_license().unwrap().is_none());
    }

    #[test]
    fn test_unknown_plan_strict_and_lenient() {
        let key = sign(&info(&["plan:xyz"], 10));

        let (lenient, _tx) = licensing(Some(key.clone()));
        let license = lenient.configured_license().unwrap().unwrap();
        assert_eq!(license.info.plan(), tollgate_core::Plan::OldEnterprise);
        assert!(lenient.validate_config(&site(Some(key.clone()))).is_ok());

        let options = LicensingOptions {
            strict_plan_enforcement: true,
            ..options()
        };
        let (strict, _tx) = licensing_with(Some(key.clone()), options);
        assert!(matches!(
            strict.configured_license(),
            Err(LicenseError::UnknownPlan(_))
        ));
        assert!(matches!(
            strict.validate_config(&site(Some(key))),
            Err(LicenseError::UnknownPlan(_))
        ));
        // Infrastructure-style error, not an upsell.
        assert!(!strict.check(BasicFeature::Sso).unwrap_err().is_feature_not_activated());
    }

    #[test]
    fn test_validate_config() {
        let (licensing, _tx) = licensing(None);
        assert!(licensing.validate_config(&site(None)).is_ok());
        assert!(licensing
            .validate_config(&site(Some(sign(&info(&[], 1)))))
            .is_ok());
        assert!(matches!(
            licensing.validate_config(&site(Some("garbage".to_string()))),
            Err(LicenseError::MalformedKey(_))
        ));
    }

    #[test]
    fn test_generation_key_preferred_when_configured() {
        let (generation_private, generation_public) = generate_keypair(2048).unwrap();
        let self_issued = generate_signed_key(&info(&["plan:team-0"], 5), &generation_private).unwrap();

        // Without a generation key, self-issued licenses are rejected.
        let (licensing, _tx) = licensing(Some(self_issued.clone()));
        assert!(matches!(
            licensing.configured_license(),
            Err(LicenseError::InvalidSignature)
        ));

        let options = LicensingOptions {
            generation_public_key_pem: Some(public_key_to_pem(&generation_public).unwrap()),
            ..options()
        };
        let (licensing, _tx) = licensing_with(Some(self_issued), options);
        assert!(licensing.configured_license().unwrap().is_some());
    }

    #[test]
    fn test_bad_production_key_fails_construction() {
        let options = LicensingOptions {
            production_public_key_pem: "not a pem".to_string(),
            ..LicensingOptions::default()
        };
        let (_tx, rx) = config_channel(SiteConfig::default());
        assert!(matches!(
            Licensing::new(rx, Arc::new(tollgate_core::MemoryStore::new()), options),
            Err(LicenseError::Pem(_))
        ));
    }
}
