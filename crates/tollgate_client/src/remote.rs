//! Client side of the remote licensing authority.

use std::future::Future;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::config::LicensingOptions;
use crate::error::RemoteCheckError;

const LICENSE_TOKEN_PREFIX: &str = "tlk_";

/// Hex SHA-256 of the key text. Stored to detect license rotation.
pub fn license_hash(key_text: &str) -> String {
    hex::encode(Sha256::digest(key_text.trim().as_bytes()))
}

/// Bearer token identifying a license to the authority without sending the
/// key itself.
pub fn license_token(key_text: &str) -> String {
    format!("{}{}", LICENSE_TOKEN_PREFIX, license_hash(key_text))
}

#[derive(Debug, Serialize)]
struct LicenseCheckRequest<'a> {
    #[serde(rename = "siteID")]
    site_id: &'a str,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct LicenseCheckData {
    pub is_valid: bool,
    #[serde(default)]
    pub reason: Option<String>,
}

#[derive(Debug, Deserialize)]
struct LicenseCheckResponse {
    #[serde(default)]
    error: Option<String>,
    #[serde(default)]
    data: Option<LicenseCheckData>,
}

/// Turn a raw authority response into a verdict.
pub fn interpret_response(status: u16, body: &[u8]) -> Result<LicenseCheckData, RemoteCheckError> {
    if !(200..300).contains(&status) {
        return Err(RemoteCheckError::Status {
            status,
            body: String::from_utf8_lossy(body).trim().to_string(),
        });
    }

    let response: LicenseCheckResponse = serde_json::from_slice(body)?;
    if let Some(error) = response.error.filter(|e| !e.is_empty()) {
        return Err(RemoteCheckError::Remote(error));
    }
    response.data.ok_or(RemoteCheckError::MissingData)
}

/// Decides whether a license is still valid.
pub trait ValidityAuthority: Send + Sync + 'static {
    fn check(
        &self,
        site_id: &str,
        token: &str,
    ) -> impl Future<Output = Result<LicenseCheckData, RemoteCheckError>> + Send;
}

/// The licensing authority reached over HTTPS.
#[derive(Debug, Clone)]
pub struct HttpAuthority {
    client: reqwest::Client,
    url: String,
}

impl HttpAuthority {
    pub fn new(url: impl Into<String>, timeout: Duration) -> Result<Self, RemoteCheckError> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            client,
            url: url.into(),
        })
    }

    pub fn from_options(options: &LicensingOptions) -> Result<Self, RemoteCheckError> {
        Self::new(options.license_check_url.clone(), options.http_timeout)
    }
}

impl ValidityAuthority for HttpAuthority {
    async fn check(&self, site_id: &str, token: &str) -> Result<LicenseCheckData, RemoteCheckError> {
        let response = self
            .client
            .post(&self.url)
            .bearer_auth(token)
            .json(&LicenseCheckRequest { site_id })
            .send()
            .await?;

        let status = response.status().as_u16();
        let body = response.bytes().await?;
        interpret_response(status, &body)
    }
}
