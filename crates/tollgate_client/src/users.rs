use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use tollgate_core::{KeyValueStore, LicenseError, TRUE_UP_USER_COUNT_TAG};

use crate::error::UserCreationError;
use crate::Licensing;

/// Signups allowed on an instance without a license.
pub const NO_LICENSE_MAXIMUM_ALLOWED_USER_COUNT: u32 = 10;

pub const MAX_USERS_KEY: &str = "license_user_count:max";
pub const MAX_USERS_TIME_KEY: &str = "license_user_count:max_time";

/// Source of the active user count, implemented by the consuming system.
pub trait UserCounter: Send + Sync {
    fn count_active_users(&self) -> Result<u32, LicenseError>;
}

/// Highest user count ever observed per license signature.
pub struct MaxUserTracker {
    store: Arc<dyn KeyValueStore>,
    write: Mutex<()>,
}

impl MaxUserTracker {
    pub fn new(store: Arc<dyn KeyValueStore>) -> Self {
        Self {
            store,
            write: Mutex::new(()),
        }
    }

    /// Store `count` if it exceeds the recorded maximum. Returns whether the
    /// record changed.
    pub fn record(&self, signature: &str, count: u32) -> Result<bool, LicenseError> {
        let _guard = self.write.lock();
        if count <= self.max_users(signature)? {
            return Ok(false);
        }

        // Count first: a failed write never leaves a timestamp for a count
        // that was not recorded.
        self.store
            .hset(MAX_USERS_KEY, signature, &count.to_string())?;
        self.store
            .hset(MAX_USERS_TIME_KEY, signature, &Utc::now().to_rfc3339())?;
        Ok(true)
    }

    pub fn max_users(&self, signature: &str) -> Result<u32, LicenseError> {
        match self.store.hget(MAX_USERS_KEY, signature)? {
            Some(value) => value.trim().parse().map_err(|_| {
                LicenseError::Store(format!("invalid max user count {:?}", value))
            }),
            None => Ok(0),
        }
    }

    pub fn max_users_time(&self, signature: &str) -> Result<Option<DateTime<Utc>>, LicenseError> {
        match self.store.hget(MAX_USERS_TIME_KEY, signature)? {
            Some(value) => DateTime::parse_from_rfc3339(value.trim())
                .map(|t| Some(t.with_timezone(&Utc)))
                .map_err(|e| LicenseError::Store(format!("invalid max user time {:?}: {}", value, e))),
            None => Ok(None),
        }
    }
}

impl Licensing {
    /// Gate a signup on the licensed user count.
    ///
    /// Without a license at most [`NO_LICENSE_MAXIMUM_ALLOWED_USER_COUNT`]
    /// users may exist. A license with a user count of 0 is unlimited. A
    /// license tagged `true-up` lets the instance grow past its count and is
    /// billed for the overflow later.
    pub fn pre_create_user(&self, users: &dyn UserCounter) -> Result<(), UserCreationError> {
        let license = self.configured_license()?;
        let active = users.count_active_users()?;

        let Some(license) = license else {
            if active >= NO_LICENSE_MAXIMUM_ALLOWED_USER_COUNT {
                return Err(UserCreationError::LicenseRequired {
                    max: NO_LICENSE_MAXIMUM_ALLOWED_USER_COUNT,
                    current: active,
                });
            }
            return Ok(());
        };

        let licensed = license.info.user_count;
        if licensed == 0 || active < licensed {
            return Ok(());
        }

        if license.info.has_tag(TRUE_UP_USER_COUNT_TAG) {
            log::warn!(
                "licensed user count ({}) exceeded with {} active users; \
                 allowing signup under true-up, overflow will be billed",
                licensed,
                active.saturating_add(1)
            );
            return Ok(());
        }

        Err(UserCreationError::UserLimitReached {
            licensed,
            current: active,
        })
    }

    /// Sample the active user count into the max-user record of the
    /// configured license. Does nothing without a license.
    pub fn record_max_users(&self, users: &dyn UserCounter) -> Result<(), LicenseError> {
        let Some(license) = self.configured_license()? else {
            return Ok(());
        };
        let count = users.count_active_users()?;
        if self.max_users.record(&license.signature, count)? {
            log::info!("new maximum user count {} for the configured license", count);
        }
        Ok(())
    }

    /// Highest user count observed under the configured license, 0 without one.
    pub fn actual_user_count(&self) -> Result<u32, LicenseError> {
        match self.configured_license()? {
            Some(license) => self.max_users.max_users(&license.signature),
            None => Ok(0),
        }
    }

    /// When [`Licensing::actual_user_count`] was reached.
    pub fn actual_user_count_date(&self) -> Result<Option<DateTime<Utc>>, LicenseError> {
        match self.configured_license()? {
            Some(license) => self.max_users.max_users_time(&license.signature),
            None => Ok(None),
        }
    }
}
