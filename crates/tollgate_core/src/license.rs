use std::fmt;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use crate::error::LicenseError;
use crate::plan::{Plan, PLAN_TAG_PREFIX};

/// Tag allowing the instance to exceed its licensed user count. The customer
/// is billed for the overage afterwards.
pub const TRUE_UP_USER_COUNT_TAG: &str = "true-up";

/// Tag carried by licenses issued before plans existed for the starter tier.
pub const LEGACY_STARTER_TAG: &str = "starter";

/// How long past `expires_at` a license is still considered within grace.
pub const EXPIRY_GRACE_DAYS: i64 = 7;

/// The payload that gets signed into a license key.
///
/// Field names are kept short on the wire because the payload is embedded in
/// every key string.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LicenseInfo {
    /// Plan selection (`plan:<name>`) and ad-hoc feature or opt-in tags.
    #[serde(rename = "t")]
    pub tags: Vec<String>,
    /// Licensed number of users. `0` means unlimited.
    #[serde(rename = "u")]
    pub user_count: u32,
    #[serde(rename = "e")]
    pub expires_at: DateTime<Utc>,
    #[serde(rename = "sf_sub_id", default, skip_serializing_if = "Option::is_none")]
    pub subscription_id: Option<String>,
    #[serde(rename = "sf_opp_id", default, skip_serializing_if = "Option::is_none")]
    pub opportunity_id: Option<String>,
}

impl LicenseInfo {
    pub fn new(tags: Vec<String>, user_count: u32, expires_at: DateTime<Utc>) -> Self {
        Self {
            tags,
            user_count,
            expires_at,
            subscription_id: None,
            opportunity_id: None,
        }
    }

    pub fn is_expired(&self) -> bool {
        Utc::now() > self.expires_at
    }

    pub fn is_expired_with_grace_period(&self) -> bool {
        Utc::now() > self.expires_at + Duration::days(EXPIRY_GRACE_DAYS)
    }

    /// Tags have historically shipped with stray whitespace, so both sides
    /// are trimmed before comparing.
    pub fn has_tag(&self, tag: &str) -> bool {
        let tag = tag.trim();
        self.tags.iter().any(|t| t.trim() == tag)
    }

    /// The plan this license is for.
    ///
    /// The first `plan:` tag naming a registered plan wins. Licenses without
    /// one predate plans: a bare `starter` tag selects the old starter plan,
    /// and anything else is grandfathered onto the old enterprise plan.
    pub fn plan(&self) -> Plan {
        for tag in &self.tags {
            if let Some(name) = tag.trim().strip_prefix(PLAN_TAG_PREFIX) {
                if let Some(plan) = Plan::from_name(name) {
                    return plan;
                }
            }
        }

        if self.has_tag(LEGACY_STARTER_TAG) {
            return Plan::OldEnterpriseStarter;
        }
        Plan::OldEnterprise
    }

    /// Reports the first `plan:` tag that names a plan this build does not
    /// know about.
    pub fn has_unknown_plan(&self) -> Result<(), LicenseError> {
        for tag in &self.tags {
            if let Some(name) = tag.trim().strip_prefix(PLAN_TAG_PREFIX) {
                if Plan::from_name(name).is_none() {
                    return Err(LicenseError::UnknownPlan(name.to_string()));
                }
            }
        }
        Ok(())
    }
}

impl fmt::Display for LicenseInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "license(tags=[{}], userCount={}, expiresAt={})",
            self.tags.join(", "),
            self.user_count,
            self.expires_at.to_rfc3339()
        )
    }
}
