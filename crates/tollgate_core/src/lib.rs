pub mod crypto;
#[cfg(feature = "db")]
pub mod db;
pub mod error;
pub mod feature;
pub mod license;
pub mod plan;
pub mod store;

pub use crypto::{
    decode_unverified, generate_keypair, generate_signed_key, parse_signed_key, KeyVerifier,
    VerificationMode,
};
#[cfg(feature = "db")]
pub use db::SqliteStore;
pub use error::LicenseError;
pub use feature::{
    BasicFeature, CompositeFeature, Feature, FeatureNotActivated, Grant, Limit,
    NotActivatedReason,
};
pub use license::{LicenseInfo, TRUE_UP_USER_COUNT_TAG};
pub use plan::{Plan, PlanDetails};
pub use store::{KeyValueStore, MemoryStore};
