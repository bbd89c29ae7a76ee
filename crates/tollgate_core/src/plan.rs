use std::fmt;

use crate::feature::{BasicFeature, Limit};

/// Prefix of the license tag that selects a plan, e.g. `plan:enterprise-1`.
pub const PLAN_TAG_PREFIX: &str = "plan:";

/// A pricing tier. Every plan a license can name is listed here; a `plan:`
/// tag outside this registry is an unknown plan.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Plan {
    /// Licenses tagged `starter` before plans existed.
    OldEnterpriseStarter,
    /// Licenses without any plan tag. These predate plans and keep
    /// everything they were sold with.
    OldEnterprise,
    Team0,
    Enterprise0,
    Business0,
    Enterprise1,
    EnterpriseAirGap0,
    Free0,
    Free1,
}

/// Entitlements of one plan.
#[derive(Debug, Clone, Copy)]
pub struct PlanDetails {
    pub title: &'static str,
    /// Granted while the license is unexpired.
    pub features: &'static [BasicFeature],
    /// Still granted after expiry so admins are not locked out of their
    /// instance.
    pub expired_features: &'static [BasicFeature],
    /// Changesets per batch change, `None` when the plan has no batch changes.
    pub batch_changes: Option<Limit>,
    pub private_repositories: Limit,
}

use BasicFeature::*;

const OLD_STARTER_FEATURES: &[BasicFeature] = &[Sso, Monitoring, BackupAndRestore];

const OLD_ENTERPRISE_FEATURES: &[BasicFeature] = &[
    Sso,
    Acls,
    ExplicitPermissionsApi,
    PrivateExtensionRegistry,
    RemoteExtensionsAllowDisallow,
    Branding,
    Campaigns,
    Monitoring,
    BackupAndRestore,
    CodeInsights,
];

const TEAM_FEATURES: &[BasicFeature] = &[Sso, Monitoring, BackupAndRestore];

const ENTERPRISE_0_FEATURES: &[BasicFeature] = &[
    Sso,
    PrivateExtensionRegistry,
    RemoteExtensionsAllowDisallow,
    Branding,
    Monitoring,
    BackupAndRestore,
];

const BUSINESS_FEATURES: &[BasicFeature] = &[
    Sso,
    Acls,
    ExplicitPermissionsApi,
    Monitoring,
    BackupAndRestore,
    CodeInsights,
];

const ENTERPRISE_1_FEATURES: &[BasicFeature] = &[
    Sso,
    Acls,
    ExplicitPermissionsApi,
    PrivateExtensionRegistry,
    RemoteExtensionsAllowDisallow,
    Branding,
    Monitoring,
    BackupAndRestore,
    CodeInsights,
];

const ENTERPRISE_AIR_GAP_FEATURES: &[BasicFeature] = &[
    Sso,
    Acls,
    ExplicitPermissionsApi,
    PrivateExtensionRegistry,
    RemoteExtensionsAllowDisallow,
    Branding,
    Monitoring,
    BackupAndRestore,
    CodeInsights,
    AllowAirGapped,
];

const FREE_FEATURES: &[BasicFeature] = &[Monitoring];

const SSO_ONLY: &[BasicFeature] = &[Sso];
const SSO_AND_ACLS: &[BasicFeature] = &[Sso, Acls];
const ENTERPRISE_EXPIRED_FEATURES: &[BasicFeature] = &[Sso, Acls, ExplicitPermissionsApi];

/// Changesets per batch change on plans that do not sell unrestricted batch
/// changes, and on any plan once the license has expired.
pub const DEFAULT_MAX_CHANGESETS: u32 = 10;

impl Plan {
    pub const ALL: [Plan; 9] = [
        Plan::OldEnterpriseStarter,
        Plan::OldEnterprise,
        Plan::Team0,
        Plan::Enterprise0,
        Plan::Business0,
        Plan::Enterprise1,
        Plan::EnterpriseAirGap0,
        Plan::Free0,
        Plan::Free1,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Plan::OldEnterpriseStarter => "old-starter-0",
            Plan::OldEnterprise => "old-enterprise-0",
            Plan::Team0 => "team-0",
            Plan::Enterprise0 => "enterprise-0",
            Plan::Business0 => "business-0",
            Plan::Enterprise1 => "enterprise-1",
            Plan::EnterpriseAirGap0 => "enterprise-air-gap-0",
            Plan::Free0 => "free-0",
            Plan::Free1 => "free-1",
        }
    }

    pub fn from_name(name: &str) -> Option<Plan> {
        let name = name.trim();
        Plan::ALL.into_iter().find(|p| p.as_str() == name)
    }

    /// The license tag that selects this plan.
    pub fn tag(&self) -> String {
        format!("{}{}", PLAN_TAG_PREFIX, self.as_str())
    }

    pub fn details(&self) -> PlanDetails {
        match self {
            Plan::OldEnterpriseStarter => PlanDetails {
                title: "Enterprise Starter",
                features: OLD_STARTER_FEATURES,
                expired_features: SSO_ONLY,
                batch_changes: None,
                private_repositories: Limit::Unrestricted,
            },
            Plan::OldEnterprise => PlanDetails {
                title: "Enterprise",
                features: OLD_ENTERPRISE_FEATURES,
                expired_features: SSO_AND_ACLS,
                batch_changes: Some(Limit::Unrestricted),
                private_repositories: Limit::Unrestricted,
            },
            Plan::Team0 => PlanDetails {
                title: "Team",
                features: TEAM_FEATURES,
                expired_features: SSO_ONLY,
                batch_changes: Some(Limit::Max(DEFAULT_MAX_CHANGESETS)),
                private_repositories: Limit::Unrestricted,
            },
            Plan::Enterprise0 => PlanDetails {
                title: "Enterprise",
                features: ENTERPRISE_0_FEATURES,
                expired_features: SSO_ONLY,
                batch_changes: Some(Limit::Max(DEFAULT_MAX_CHANGESETS)),
                private_repositories: Limit::Unrestricted,
            },
            Plan::Business0 => PlanDetails {
                title: "Business",
                features: BUSINESS_FEATURES,
                expired_features: SSO_AND_ACLS,
                batch_changes: Some(Limit::Unrestricted),
                private_repositories: Limit::Unrestricted,
            },
            Plan::Enterprise1 => PlanDetails {
                title: "Enterprise",
                features: ENTERPRISE_1_FEATURES,
                expired_features: ENTERPRISE_EXPIRED_FEATURES,
                batch_changes: Some(Limit::Unrestricted),
                private_repositories: Limit::Unrestricted,
            },
            Plan::EnterpriseAirGap0 => PlanDetails {
                title: "Enterprise (air-gapped)",
                features: ENTERPRISE_AIR_GAP_FEATURES,
                expired_features: ENTERPRISE_EXPIRED_FEATURES,
                batch_changes: Some(Limit::Unrestricted),
                private_repositories: Limit::Unrestricted,
            },
            Plan::Free0 => PlanDetails {
                title: "Free",
                features: FREE_FEATURES,
                expired_features: &[],
                batch_changes: Some(Limit::Max(DEFAULT_MAX_CHANGESETS)),
                private_repositories: Limit::Unrestricted,
            },
            Plan::Free1 => PlanDetails {
                title: "Free",
                features: FREE_FEATURES,
                expired_features: &[],
                batch_changes: Some(Limit::Max(DEFAULT_MAX_CHANGESETS)),
                private_repositories: Limit::Max(1),
            },
        }
    }

    /// Membership in the plan's active feature list. Expiry is the caller's
    /// concern.
    pub fn has_feature(&self, feature: BasicFeature) -> bool {
        self.details().features.contains(&feature)
    }

    pub fn has_expired_feature(&self, feature: BasicFeature) -> bool {
        self.details().expired_features.contains(&feature)
    }
}

impl fmt::Display for Plan {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
