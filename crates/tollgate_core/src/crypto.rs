use base64::{
    engine::general_purpose::{STANDARD as BASE64, URL_SAFE_NO_PAD},
    Engine,
};
use pkcs8::{DecodePrivateKey, DecodePublicKey, EncodePrivateKey, EncodePublicKey, LineEnding};
use rsa::sha2::Sha256;
use rsa::signature::{SignatureEncoding, Signer, Verifier};
use rsa::{
    pkcs1v15::{SigningKey, VerifyingKey},
    RsaPrivateKey, RsaPublicKey,
};
use serde::{Deserialize, Serialize};

use crate::error::LicenseError;
use crate::license::LicenseInfo;

/// Public half of the key that signs every production license.
pub const PRODUCTION_PUBLIC_KEY_PEM: &str = "-----BEGIN PUBLIC KEY-----
MIIBIjANBgkqhkiG9w0BAQEFAAOCAQ8AMIIBCgKCAQEAnhUtgUCN9Wdd2MFdvLnl
BMyZClx0y95kwb0k3tO4bzVCaMmurzmDsHbR6zFidsTos+viwO3ixFpV4XAJea+S
PZN9abk1ca6H/xQ0dl/C4NklnoDUs2ARLFQHGf+O6S1jnEyBgZGRHCE9oR2d+Bod
py+10F82c5pmQkJUt0AnAnB39o97EMDp3lIlNUOWEUHkKAsZRbk1X6Gtko2rLJGD
l9sCVL0lWDxewOwDBlEFwmMskjxCgVk6Kqx10mYNqWSEZf3CzBamTcFMfQobRac8
lWfkNEUnhK/XbU6MbKxJ5e6vEapfVPNj+3/cTjSKPj4pf4s7Sjiaf0qwC4iojIbl
CQIDAQAB
-----END PUBLIC KEY-----
";

/// Generate an RSA keypair with the given bit size (2048 or 4096).
pub fn generate_keypair(bits: usize) -> Result<(RsaPrivateKey, RsaPublicKey), LicenseError> {
    let mut rng = rand::thread_rng();
    let private_key = RsaPrivateKey::new(&mut rng, bits)?;
    let public_key = RsaPublicKey::from(&private_key);
    Ok((private_key, public_key))
}

/// Export a private key as PEM string.
pub fn private_key_to_pem(key: &RsaPrivateKey) -> Result<String, LicenseError> {
    key.to_pkcs8_pem(LineEnding::LF)
        .map(|s| s.to_string())
        .map_err(|e| LicenseError::Pem(e.to_string()))
}

/// Export a public key as PEM string.
pub fn public_key_to_pem(key: &RsaPublicKey) -> Result<String, LicenseError> {
    key.to_public_key_pem(LineEnding::LF)
        .map_err(|e| LicenseError::Pem(e.to_string()))
}

/// Import a private key from PEM string.
pub fn private_key_from_pem(pem: &str) -> Result<RsaPrivateKey, LicenseError> {
    RsaPrivateKey::from_pkcs8_pem(pem).map_err(|e| LicenseError::Pem(e.to_string()))
}

/// Import a public key from PEM string.
pub fn public_key_from_pem(pem: &str) -> Result<RsaPublicKey, LicenseError> {
    RsaPublicKey::from_public_key_pem(pem.trim()).map_err(|e| LicenseError::Pem(e.to_string()))
}

/// The outer layer of a license key: signature and signed bytes side by side.
#[derive(Debug, Serialize, Deserialize)]
struct Envelope {
    /// Base64 RSA-SHA256 signature of the decoded `info` bytes.
    sig: String,
    /// Base64 of the JSON-serialized `LicenseInfo`.
    info: String,
}

/// Sign `info` and pack payload and signature into a single key string.
pub fn generate_signed_key(
    info: &LicenseInfo,
    private_key: &RsaPrivateKey,
) -> Result<String, LicenseError> {
    let payload = serde_json::to_vec(info)?;
    let signing_key = SigningKey::<Sha256>::new(private_key.clone());
    let signature = signing_key.sign(&payload);

    let envelope = Envelope {
        sig: BASE64.encode(signature.to_bytes()),
        info: BASE64.encode(&payload),
    };
    Ok(URL_SAFE_NO_PAD.encode(serde_json::to_vec(&envelope)?))
}

fn open_envelope(key: &str) -> Result<(Vec<u8>, Vec<u8>), LicenseError> {
    let raw = URL_SAFE_NO_PAD
        .decode(key.trim())
        .map_err(|e| LicenseError::MalformedKey(e.to_string()))?;
    let envelope: Envelope =
        serde_json::from_slice(&raw).map_err(|e| LicenseError::MalformedKey(e.to_string()))?;

    let signature = BASE64
        .decode(&envelope.sig)
        .map_err(|e| LicenseError::MalformedKey(format!("signature: {}", e)))?;
    let payload = BASE64
        .decode(&envelope.info)
        .map_err(|e| LicenseError::MalformedKey(format!("payload: {}", e)))?;
    Ok((signature, payload))
}

/// Verify a license key against `public_key` and decode its payload.
///
/// Returns the license and its signature (base64), which identifies the
/// license independently of its contents.
pub fn parse_signed_key(
    key: &str,
    public_key: &RsaPublicKey,
) -> Result<(LicenseInfo, String), LicenseError> {
    let (signature_bytes, payload) = open_envelope(key)?;

    let verifying_key = VerifyingKey::<Sha256>::new(public_key.clone());
    let signature = rsa::pkcs1v15::Signature::try_from(signature_bytes.as_slice())
        .map_err(|_| LicenseError::InvalidSignature)?;
    verifying_key
        .verify(&payload, &signature)
        .map_err(|_| LicenseError::InvalidSignature)?;

    let info: LicenseInfo = serde_json::from_slice(&payload)
        .map_err(|e| LicenseError::MalformedPayload(e.to_string()))?;
    Ok((info, BASE64.encode(&signature_bytes)))
}

/// Decode a key's payload without checking its signature. Only for
/// inspecting keys, never for granting anything.
pub fn decode_unverified(key: &str) -> Result<LicenseInfo, LicenseError> {
    let (_, payload) = open_envelope(key)?;
    serde_json::from_slice(&payload).map_err(|e| LicenseError::MalformedPayload(e.to_string()))
}

/// Which key a license must be signed with.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VerificationMode {
    /// Only the production key is accepted.
    Production,
    /// Use the operator's generation key if one is configured, otherwise the
    /// production key. For verifying self-issued licenses outside production.
    PreferGeneration,
}

#[derive(Debug, Clone)]
pub struct KeyVerifier {
    production: RsaPublicKey,
    generation: Option<RsaPublicKey>,
}

impl KeyVerifier {
    pub fn new(production: RsaPublicKey) -> Self {
        Self {
            production,
            generation: None,
        }
    }

    /// Verifier for the embedded production key.
    pub fn production() -> Result<Self, LicenseError> {
        Ok(Self::new(public_key_from_pem(PRODUCTION_PUBLIC_KEY_PEM)?))
    }

    pub fn with_generation_key(mut self, key: RsaPublicKey) -> Self {
        self.generation = Some(key);
        self
    }

    pub fn has_generation_key(&self) -> bool {
        self.generation.is_some()
    }

    pub fn parse(
        &self,
        key: &str,
        mode: VerificationMode,
    ) -> Result<(LicenseInfo, String), LicenseError> {
        let public_key = match (mode, &self.generation) {
            (VerificationMode::PreferGeneration, Some(generation)) => generation,
            _ => &self.production,
        };
        parse_signed_key(key, public_key)
    }
}
