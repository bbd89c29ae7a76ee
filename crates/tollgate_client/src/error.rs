use thiserror::Error;
use tollgate_core::{FeatureNotActivated, LicenseError};

/// Why a feature check did not grant the feature.
#[derive(Debug, Error)]
pub enum CheckError {
    /// The license is fine, it just does not include the feature.
    #[error(transparent)]
    NotActivated(#[from] FeatureNotActivated),

    /// The configured license could not be read or trusted.
    #[error(transparent)]
    License(#[from] LicenseError),
}

impl CheckError {
    pub fn is_feature_not_activated(&self) -> bool {
        matches!(self, CheckError::NotActivated(_))
    }
}

/// Distinguishes an upsell-worthy denial from every other failure.
pub fn is_feature_not_activated(err: &CheckError) -> bool {
    err.is_feature_not_activated()
}

#[derive(Debug, Error)]
pub enum UserCreationError {
    #[error(
        "Unable to create user account: a subscription is required to exceed {max} users \
         (this instance now has {current} users). Contact sales to learn more."
    )]
    LicenseRequired { max: u32, current: u32 },

    #[error(
        "Unable to create user account: the subscription's maximum user count ({licensed}) \
         has been reached. A site admin must upgrade the subscription to allow for more users."
    )]
    UserLimitReached { licensed: u32, current: u32 },

    #[error(transparent)]
    License(#[from] LicenseError),
}

impl UserCreationError {
    /// Whether the message is meant to be shown to the person signing up.
    pub fn is_presentable(&self) -> bool {
        !matches!(self, UserCreationError::License(_))
    }
}

#[derive(Debug, Error)]
pub enum RemoteCheckError {
    #[error("license check request failed: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("license check returned HTTP {status}: {body}")]
    Status { status: u16, body: String },

    #[error("license check returned an error: {0}")]
    Remote(String),

    #[error("license check response has no data")]
    MissingData,

    #[error("invalid license check response: {0}")]
    Decode(#[from] serde_json::Error),

    #[error(transparent)]
    License(#[from] LicenseError),
}

#[derive(Debug, Error)]
#[error("license workers are already running in this process")]
pub struct AlreadyRunning;
