use std::fmt;
use std::str::FromStr;

use thiserror::Error;

use crate::license::LicenseInfo;
use crate::plan::DEFAULT_MAX_CHANGESETS;

/// A plain on/off capability. Granted by the license's plan or by a license
/// tag spelling its name.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BasicFeature {
    Sso,
    Acls,
    ExplicitPermissionsApi,
    PrivateExtensionRegistry,
    RemoteExtensionsAllowDisallow,
    Branding,
    /// Deprecated name of batch changes. Still honoured as a grant.
    Campaigns,
    Monitoring,
    BackupAndRestore,
    CodeInsights,
    /// Exempts the instance from remote license validity checks.
    AllowAirGapped,
}

impl BasicFeature {
    pub const ALL: [BasicFeature; 11] = [
        BasicFeature::Sso,
        BasicFeature::Acls,
        BasicFeature::ExplicitPermissionsApi,
        BasicFeature::PrivateExtensionRegistry,
        BasicFeature::RemoteExtensionsAllowDisallow,
        BasicFeature::Branding,
        BasicFeature::Campaigns,
        BasicFeature::Monitoring,
        BasicFeature::BackupAndRestore,
        BasicFeature::CodeInsights,
        BasicFeature::AllowAirGapped,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            BasicFeature::Sso => "sso",
            BasicFeature::Acls => "acls",
            BasicFeature::ExplicitPermissionsApi => "explicit-permissions-api",
            BasicFeature::PrivateExtensionRegistry => "private-extension-registry",
            BasicFeature::RemoteExtensionsAllowDisallow => "remote-extensions-allow-disallow",
            BasicFeature::Branding => "branding",
            BasicFeature::Campaigns => "campaigns",
            BasicFeature::Monitoring => "monitoring",
            BasicFeature::BackupAndRestore => "backup-and-restore",
            BasicFeature::CodeInsights => "code-insights",
            BasicFeature::AllowAirGapped => "allow-air-gapped",
        }
    }

    pub fn from_name(name: &str) -> Option<BasicFeature> {
        let name = name.trim();
        BasicFeature::ALL.into_iter().find(|f| f.as_str() == name)
    }

    /// Granted by the plan, or explicitly by a tag of the same name.
    pub fn check(&self, info: &LicenseInfo) -> Result<Grant, FeatureNotActivated> {
        if info.plan().has_feature(*self) || info.has_tag(self.as_str()) {
            return Ok(Grant::Enabled);
        }
        Err(FeatureNotActivated::not_in_license(self.as_str()))
    }
}

impl fmt::Display for BasicFeature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A numeric allowance carried by a composite feature grant.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Limit {
    Unrestricted,
    Max(u32),
}

impl Limit {
    pub fn allows(&self, count: u32) -> bool {
        match self {
            Limit::Unrestricted => true,
            Limit::Max(max) => count <= *max,
        }
    }
}

impl fmt::Display for Limit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Limit::Unrestricted => f.write_str("unrestricted"),
            Limit::Max(max) => write!(f, "max {}", max),
        }
    }
}

/// Features whose grant depends on more than membership: they compute a
/// per-license allowance themselves.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CompositeFeature {
    BatchChanges,
    PrivateRepositories,
}

impl CompositeFeature {
    pub const ALL: [CompositeFeature; 2] =
        [CompositeFeature::BatchChanges, CompositeFeature::PrivateRepositories];

    pub fn as_str(&self) -> &'static str {
        match self {
            CompositeFeature::BatchChanges => "batch-changes",
            CompositeFeature::PrivateRepositories => "private-repositories",
        }
    }

    pub fn from_name(name: &str) -> Option<CompositeFeature> {
        let name = name.trim();
        CompositeFeature::ALL.into_iter().find(|f| f.as_str() == name)
    }

    pub fn check(&self, info: &LicenseInfo) -> Result<Grant, FeatureNotActivated> {
        match self {
            CompositeFeature::BatchChanges => check_batch_changes(info).map(Grant::BatchChanges),
            CompositeFeature::PrivateRepositories => {
                check_private_repositories(info).map(Grant::PrivateRepositories)
            }
        }
    }
}

impl fmt::Display for CompositeFeature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

fn check_batch_changes(info: &LicenseInfo) -> Result<Limit, FeatureNotActivated> {
    let name = CompositeFeature::BatchChanges.as_str();
    let expired = info.is_expired();

    // Licenses sold before the rename carry the campaigns tag instead.
    let tagged = info.has_tag(name) || info.has_tag(BasicFeature::Campaigns.as_str());
    if tagged && !expired {
        return Ok(Limit::Unrestricted);
    }

    match info.plan().details().batch_changes {
        Some(_) if expired => Ok(Limit::Max(DEFAULT_MAX_CHANGESETS)),
        Some(limit) => Ok(limit),
        None => Err(FeatureNotActivated::not_in_license(name)),
    }
}

fn check_private_repositories(info: &LicenseInfo) -> Result<Limit, FeatureNotActivated> {
    let name = CompositeFeature::PrivateRepositories.as_str();
    if info.has_tag(name) && !info.is_expired() {
        return Ok(Limit::Unrestricted);
    }

    match info.plan().details().private_repositories {
        Limit::Max(0) => Err(FeatureNotActivated::not_in_license(name)),
        limit => Ok(limit),
    }
}

/// Anything a call site can gate on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Feature {
    Basic(BasicFeature),
    Composite(CompositeFeature),
}

impl Feature {
    pub fn as_str(&self) -> &'static str {
        match self {
            Feature::Basic(f) => f.as_str(),
            Feature::Composite(f) => f.as_str(),
        }
    }

    pub fn check(&self, info: &LicenseInfo) -> Result<Grant, FeatureNotActivated> {
        match self {
            Feature::Basic(f) => f.check(info),
            Feature::Composite(f) => f.check(info),
        }
    }
}

impl From<BasicFeature> for Feature {
    fn from(f: BasicFeature) -> Self {
        Feature::Basic(f)
    }
}

impl From<CompositeFeature> for Feature {
    fn from(f: CompositeFeature) -> Self {
        Feature::Composite(f)
    }
}

impl FromStr for Feature {
    type Err = UnknownFeature;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if let Some(f) = CompositeFeature::from_name(s) {
            return Ok(Feature::Composite(f));
        }
        BasicFeature::from_name(s)
            .map(Feature::Basic)
            .ok_or_else(|| UnknownFeature(s.trim().to_string()))
    }
}

impl fmt::Display for Feature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("unknown feature {0:?}")]
pub struct UnknownFeature(pub String);

/// What a successful check hands back to the call site.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Grant {
    Enabled,
    /// Changesets allowed per batch change.
    BatchChanges(Limit),
    PrivateRepositories(Limit),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NotActivatedReason {
    /// No license is configured at all.
    NoLicense,
    /// The license is valid but does not include the feature.
    NotInLicense,
}

/// A well-formed license simply does not grant the feature. Meant to be shown
/// to users as an upgrade prompt rather than a failure.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{message}")]
pub struct FeatureNotActivated {
    pub feature: String,
    pub reason: NotActivatedReason,
    message: String,
}

impl FeatureNotActivated {
    pub fn no_license(feature: &str) -> Self {
        Self {
            feature: feature.to_string(),
            reason: NotActivatedReason::NoLicense,
            message: format!(
                "The feature {:?} is not activated because it requires a valid license. \
                 Purchase a subscription to activate this feature.",
                feature
            ),
        }
    }

    pub fn not_in_license(feature: &str) -> Self {
        Self {
            feature: feature.to_string(),
            reason: NotActivatedReason::NotInLicense,
            message: format!(
                "The feature {:?} is not activated in your license. \
                 Upgrade your subscription to use this feature.",
                feature
            ),
        }
    }

    pub fn message(&self) -> &str {
        &self.message
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, Utc};

    fn info(tags: &[&str]) -> LicenseInfo {
        LicenseInfo::new(
            tags.iter().map(|t| t.to_string()).collect(),
            0,
            Utc::now() + Duration::days(30),
        )
    }

    fn expired(tags: &[&str]) -> LicenseInfo {
        let mut info = info(tags);
        info.expires_at = Utc::now() - Duration::days(1);
        info
    }

    #[test]
    fn test_feature_from_str_trims() {
        assert_eq!(" sso ".parse::<Feature>(), Ok(Feature::Basic(BasicFeature::Sso)));
        assert_eq!(
            "batch-changes\n".parse::<Feature>(),
            Ok(Feature::Composite(CompositeFeature::BatchChanges))
        );
        assert_eq!(
            "nope".parse::<Feature>(),
            Err(UnknownFeature("nope".to_string()))
        );
    }

    #[test]
    fn test_basic_feature_plan_or_tag() {
        assert_eq!(BasicFeature::Sso.check(&info(&["plan:team-0"])), Ok(Grant::Enabled));

        let err = BasicFeature::Acls.check(&info(&["plan:enterprise-0"])).unwrap_err();
        assert_eq!(err.reason, NotActivatedReason::NotInLicense);
        assert_eq!(err.feature, "acls");

        assert_eq!(
            BasicFeature::Acls.check(&info(&["plan:enterprise-0", "acls "])),
            Ok(Grant::Enabled)
        );
    }

    #[test]
    fn test_batch_changes_limits() {
        let limit = |tags: &[&str]| CompositeFeature::BatchChanges.check(&info(tags));

        assert_eq!(limit(&["plan:enterprise-1"]), Ok(Grant::BatchChanges(Limit::Unrestricted)));
        assert_eq!(
            limit(&["plan:team-0"]),
            Ok(Grant::BatchChanges(Limit::Max(DEFAULT_MAX_CHANGESETS)))
        );
        assert_eq!(
            limit(&["plan:team-0", "batch-changes"]),
            Ok(Grant::BatchChanges(Limit::Unrestricted))
        );
        // Legacy tag.
        assert_eq!(
            limit(&["plan:free-0", "campaigns"]),
            Ok(Grant::BatchChanges(Limit::Unrestricted))
        );
        assert!(limit(&["starter"]).is_err());
    }

    #[test]
    fn test_batch_changes_after_expiry() {
        let grant = CompositeFeature::BatchChanges.check(&expired(&["plan:enterprise-1"]));
        assert_eq!(grant, Ok(Grant::BatchChanges(Limit::Max(DEFAULT_MAX_CHANGESETS))));

        let grant = CompositeFeature::BatchChanges.check(&expired(&["plan:free-0", "batch-changes"]));
        assert_eq!(grant, Ok(Grant::BatchChanges(Limit::Max(DEFAULT_MAX_CHANGESETS))));
    }

    #[test]
    fn test_private_repositories() {
        let check = |tags: &[&str]| CompositeFeature::PrivateRepositories.check(&info(tags));

        assert_eq!(check(&["plan:free-1"]), Ok(Grant::PrivateRepositories(Limit::Max(1))));
        assert_eq!(
            check(&["plan:free-1", "private-repositories"]),
            Ok(Grant::PrivateRepositories(Limit::Unrestricted))
        );
        assert_eq!(
            check(&["plan:business-0"]),
            Ok(Grant::PrivateRepositories(Limit::Unrestricted))
        );
    }

    #[test]
    fn test_limit_allows() {
        assert!(Limit::Unrestricted.allows(u32::MAX));
        assert!(Limit::Max(10).allows(10));
        assert!(!Limit::Max(10).allows(11));
    }

    #[test]
    fn test_not_activated_messages() {
        let err = FeatureNotActivated::no_license("sso");
        assert!(err.message().contains("requires a valid license"));
        let err = FeatureNotActivated::not_in_license("sso");
        assert!(err.to_string().contains("Upgrade your subscription"));
    }
}
