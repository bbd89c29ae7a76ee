use thiserror::Error;

#[derive(Debug, Error)]
pub enum LicenseError {
    /// The key envelope could not be split or decoded.
    #[error("malformed license key: {0}")]
    MalformedKey(String),

    #[error("invalid license key signature")]
    InvalidSignature,

    /// The signature verified but the payload is not a license.
    #[error("malformed license payload: {0}")]
    MalformedPayload(String),

    #[error("license names an unknown plan {0:?}")]
    UnknownPlan(String),

    #[error("RSA error: {0}")]
    Rsa(#[from] rsa::Error),

    #[error("PEM error: {0}")]
    Pem(String),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("store error: {0}")]
    Store(String),
}
