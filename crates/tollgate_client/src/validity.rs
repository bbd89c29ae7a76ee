//! Reconciles the local validity verdict with the licensing authority.
//!
//! State lives in the shared [`KeyValueStore`] so every process of a
//! deployment sees the same verdict. All writes are single keys and a repeated
//! check with the same inputs stores the same values.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tollgate_core::{BasicFeature, KeyValueStore, LicenseError};

use crate::error::RemoteCheckError;
use crate::remote::{license_hash, license_token, ValidityAuthority};
use crate::Licensing;

pub const LAST_CALLED_AT_KEY: &str = "licensing:last_called_at";
pub const IS_LICENSE_VALID_KEY: &str = "licensing:is_license_valid";
pub const PREV_LICENSE_HASH_KEY: &str = "licensing:prev_license_hash";

/// What a single validity check concluded.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CheckOutcome {
    /// Nothing to check.
    NoLicense,
    /// The license allows running without contacting the authority.
    AirGapped,
    /// The key predates subscription ids; the authority cannot identify it.
    LegacyKey,
    Verdict { is_valid: bool, reason: Option<String> },
}

fn parse_timestamp(key: &str, value: &str) -> Result<DateTime<Utc>, LicenseError> {
    DateTime::parse_from_rfc3339(value.trim())
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| LicenseError::Store(format!("invalid timestamp in {}: {}", key, e)))
}

impl Licensing {
    /// The stored verdict. A license that was never checked is valid.
    pub fn is_license_valid(&self) -> Result<bool, LicenseError> {
        Ok(self.store.get_bool(IS_LICENSE_VALID_KEY)?.unwrap_or(true))
    }

    /// When a validity check was last attempted, successful or not.
    pub fn last_validity_check(&self) -> Result<Option<DateTime<Utc>>, LicenseError> {
        self.store
            .get(LAST_CALLED_AT_KEY)?
            .map(|v| parse_timestamp(LAST_CALLED_AT_KEY, &v))
            .transpose()
    }

    /// Token of the configured key, `None` without a license.
    pub fn current_license_token(&self) -> Option<String> {
        self.config.borrow().license_key().map(license_token)
    }
}

pub struct ValidityChecker<A> {
    licensing: Arc<Licensing>,
    authority: Arc<A>,
}

impl<A: ValidityAuthority> ValidityChecker<A> {
    pub fn new(licensing: Arc<Licensing>, authority: Arc<A>) -> Self {
        Self {
            licensing,
            authority,
        }
    }

    fn store(&self) -> &dyn KeyValueStore {
        self.licensing.store.as_ref()
    }

    /// Check the configured license once.
    ///
    /// The attempt time is always recorded. On any error the previous
    /// verdict is left untouched so an unreachable authority never
    /// invalidates a license.
    pub async fn run_once(&self) -> Result<CheckOutcome, RemoteCheckError> {
        self.store()
            .set(LAST_CALLED_AT_KEY, &Utc::now().to_rfc3339())?;

        let site = self.licensing.site_config();
        let Some(key_text) = site.license_key() else {
            log::debug!("no license configured, skipping validity check");
            return Ok(CheckOutcome::NoLicense);
        };

        let license = self.licensing.license_for_key(key_text)?;
        if BasicFeature::AllowAirGapped.check(&license.info).is_ok() {
            self.store().set_bool(IS_LICENSE_VALID_KEY, true)?;
            return Ok(CheckOutcome::AirGapped);
        }
        if license.info.subscription_id.is_none() {
            log::debug!("license has no subscription id, skipping validity check");
            self.store().set_bool(IS_LICENSE_VALID_KEY, true)?;
            return Ok(CheckOutcome::LegacyKey);
        }

        let data = self
            .authority
            .check(&site.site_id, &license_token(key_text))
            .await?;
        self.store().set_bool(IS_LICENSE_VALID_KEY, data.is_valid)?;

        if data.is_valid {
            log::info!("license is valid");
        } else {
            log::warn!(
                "license is not valid: {}",
                data.reason.as_deref().unwrap_or("no reason given")
            );
        }
        Ok(CheckOutcome::Verdict {
            is_valid: data.is_valid,
            reason: data.reason,
        })
    }

    /// How long to wait before the first check for `key_text`.
    ///
    /// A key different from the last one seen resets the attempt time and is
    /// checked immediately. The stored verdict is kept until the authority
    /// answers for the new key. Otherwise the check waits out whatever remains
    /// of `interval` since the last attempt.
    pub fn first_check_delay(
        &self,
        key_text: &str,
        interval: Duration,
    ) -> Result<Duration, LicenseError> {
        let store = self.store();
        let hash = license_hash(key_text);
        if store.get(PREV_LICENSE_HASH_KEY)?.as_deref() != Some(hash.as_str()) {
            log::info!("license key changed, checking the new key now");
            store.delete(LAST_CALLED_AT_KEY)?;
            store.set(PREV_LICENSE_HASH_KEY, &hash)?;
            return Ok(Duration::ZERO);
        }

        let Some(last) = self.licensing.last_validity_check()? else {
            return Ok(Duration::ZERO);
        };
        let elapsed = (Utc::now() - last).to_std().unwrap_or(Duration::ZERO);
        Ok(interval.saturating_sub(elapsed))
    }
}


#[cfg(test)]
mod tests {
    use super::fake::*;
    use super::*;
    use crate::testutil::*;

    fn checker(key: Option<String>) -> (ValidityChecker<FakeAuthority>, Arc<FakeAuthority>) {
        let (licensing, _tx) = licensing(key);
        let authority = Arc::new(FakeAuthority::default());
        (
            ValidityChecker::new(licensing, Arc::clone(&authority)),
            authority,
        )
    }

    #[tokio::test]
    async fn test_no_license_only_records_attempt() {
        let (checker, authority) = checker(None);
        assert_eq!(checker.run_once().await.unwrap(), CheckOutcome::NoLicense);
        assert_eq!(authority.call_count(), 0);
        assert!(checker.licensing.last_validity_check().unwrap().is_some());
        assert_eq!(checker.store().get(IS_LICENSE_VALID_KEY).unwrap(), None);
        assert!(checker.licensing.is_license_valid().unwrap());
    }

    #[tokio::test]
    async fn test_verdict_is_stored() {
        let key = sign(&info(&["plan:team-0"], 10));
        let (checker, authority) = checker(Some(key.clone()));

        authority.push(verdict(false));
        assert_eq!(
            checker.run_once().await.unwrap(),
            CheckOutcome::Verdict {
                is_valid: false,
                reason: Some("revoked".to_string())
            }
        );
        assert!(!checker.licensing.is_license_valid().unwrap());

        assert!(matches!(
            checker.run_once().await.unwrap(),
            CheckOutcome::Verdict { is_valid: true, .. }
        ));
        assert!(checker.licensing.is_license_valid().unwrap());

        let calls = authority.calls.lock().clone();
        assert_eq!(calls.len(), 2);
        assert_eq!(calls[0].0, "site-1234");
        assert_eq!(calls[0].1, license_token(&key));
    }

    #[tokio::test]
    async fn test_repeated_checks_are_idempotent() {
        let (checker, authority) = checker(Some(sign(&info(&[], 10))));
        authority.push(verdict(false));
        authority.push(verdict(false));

        checker.run_once().await.unwrap();
        let first = checker.store().get(IS_LICENSE_VALID_KEY).unwrap();
        let first_called = checker.licensing.last_validity_check().unwrap().unwrap();

        let stale = "2000-01-01T00:00:00+00:00";
        checker.store().set(LAST_CALLED_AT_KEY, stale).unwrap();
        checker.run_once().await.unwrap();
        assert_eq!(checker.store().get(IS_LICENSE_VALID_KEY).unwrap(), first);
        assert_eq!(first.as_deref(), Some("false"));

        // Both runs record their attempt.
        let second_called = checker.licensing.last_validity_check().unwrap().unwrap();
        assert_ne!(checker.store().get(LAST_CALLED_AT_KEY).unwrap().as_deref(), Some(stale));
        assert!(second_called >= first_called);
    }

    #[tokio::test]
    async fn test_authority_failure_keeps_verdict() {
        let (checker, authority) = checker(Some(sign(&info(&[], 10))));

        // Never checked: still valid after a failure.
        authority.push(Err(RemoteCheckError::Status {
            status: 500,
            body: "boom".to_string(),
        }));
        assert!(checker.run_once().await.is_err());
        assert!(checker.licensing.is_license_valid().unwrap());
        assert!(checker.licensing.last_validity_check().unwrap().is_some());

        // Valid stays valid.
        authority.push(verdict(true));
        authority.push(Err(RemoteCheckError::Status {
            status: 500,
            body: "boom".to_string(),
        }));
        checker.run_once().await.unwrap();
        assert!(checker.run_once().await.is_err());
        assert_eq!(checker.store().get_bool(IS_LICENSE_VALID_KEY).unwrap(), Some(true));

        // Invalid stays invalid.
        authority.push(verdict(false));
        authority.push(Err(RemoteCheckError::MissingData));
        checker.run_once().await.unwrap();
        assert!(checker.run_once().await.is_err());
        assert!(!checker.licensing.is_license_valid().unwrap());
    }

    #[tokio::test]
    async fn test_air_gapped_and_legacy_keys_skip_authority() {
        let (checker, authority) =
            checker(Some(sign(&info(&["plan:enterprise-air-gap-0"], 10))));
        checker.store().set_bool(IS_LICENSE_VALID_KEY, false).unwrap();
        assert_eq!(checker.run_once().await.unwrap(), CheckOutcome::AirGapped);
        assert!(checker.licensing.is_license_valid().unwrap());
        assert_eq!(authority.call_count(), 0);

        let mut legacy = info(&["plan:team-0"], 10);
        legacy.subscription_id = None;
        let (checker, authority) = checker_for(sign(&legacy));
        assert_eq!(checker.run_once().await.unwrap(), CheckOutcome::LegacyKey);
        assert_eq!(authority.call_count(), 0);
    }

    fn checker_for(key: String) -> (ValidityChecker<FakeAuthority>, Arc<FakeAuthority>) {
        checker(Some(key))
    }

    #[tokio::test]
    async fn test_broken_key_is_an_error() {
        let (checker, authority) = checker(Some("garbage".to_string()));
        assert!(matches!(
            checker.run_once().await,
            Err(RemoteCheckError::License(LicenseError::MalformedKey(_)))
        ));
        assert_eq!(authority.call_count(), 0);
    }

    #[tokio::test]
    async fn test_rotation_during_outage_keeps_revoked_verdict() {
        let revoked = sign(&info(&["plan:team-0"], 10));
        let rotated = sign(&info(&["plan:business-0"], 10));
        let (checker, authority) = checker(Some(rotated.clone()));
        let store = checker.store();
        store.set(PREV_LICENSE_HASH_KEY, &license_hash(&revoked)).unwrap();
        store.set_bool(IS_LICENSE_VALID_KEY, false).unwrap();

        let interval = Duration::from_secs(12 * 60 * 60);
        assert_eq!(checker.first_check_delay(&rotated, interval).unwrap(), Duration::ZERO);

        authority.push(Err(RemoteCheckError::Status {
            status: 500,
            body: "boom".to_string(),
        }));
        assert!(checker.run_once().await.is_err());
        assert!(!checker.licensing.is_license_valid().unwrap());

        // The authority's answer for the new key replaces it.
        authority.push(verdict(true));
        checker.run_once().await.unwrap();
        assert!(checker.licensing.is_license_valid().unwrap());
    }

    #[test]
    fn test_first_check_delay_on_rotation() {
        let interval = Duration::from_secs(12 * 60 * 60);
        let (checker, _) = checker(None);
        let store = checker.store();

        store.set_bool(IS_LICENSE_VALID_KEY, false).unwrap();
        store
            .set(LAST_CALLED_AT_KEY, &Utc::now().to_rfc3339())
            .unwrap();

        // New key: check now, verdict kept.
        assert_eq!(checker.first_check_delay("key-a", interval).unwrap(), Duration::ZERO);
        assert_eq!(store.get_bool(IS_LICENSE_VALID_KEY).unwrap(), Some(false));
        assert_eq!(store.get(LAST_CALLED_AT_KEY).unwrap(), None);
        assert_eq!(
            store.get(PREV_LICENSE_HASH_KEY).unwrap(),
            Some(license_hash("key-a"))
        );

        // Same key, never checked: check now.
        assert_eq!(checker.first_check_delay("key-a", interval).unwrap(), Duration::ZERO);

        // Same key, checked an hour ago: wait out the rest of the interval.
        let hour_ago = Utc::now() - chrono::Duration::hours(1);
        store.set(LAST_CALLED_AT_KEY, &hour_ago.to_rfc3339()).unwrap();
        store.set_bool(IS_LICENSE_VALID_KEY, false).unwrap();
        let delay = checker.first_check_delay("key-a", interval).unwrap();
        assert!(delay <= Duration::from_secs(11 * 60 * 60));
        assert!(delay > Duration::from_secs(11 * 60 * 60 - 60));
        assert_eq!(store.get_bool(IS_LICENSE_VALID_KEY).unwrap(), Some(false));

        // Same key, checked long ago: check now.
        let long_ago = Utc::now() - chrono::Duration::days(2);
        store.set(LAST_CALLED_AT_KEY, &long_ago.to_rfc3339()).unwrap();
        assert_eq!(checker.first_check_delay("key-a", interval).unwrap(), Duration::ZERO);
    }

    #[test]
    fn test_current_license_token() {
        let (licensing, tx) = licensing(None);
        assert_eq!(licensing.current_license_token(), None);
        tx.send_replace(site(Some("abc".to_string())));
        assert_eq!(licensing.current_license_token(), Some(license_token("abc")));
    }
}
