//! Request signing.
//!
//! ```text
//! toSign    = "POST\n" + path + "\n" + ts + "\n" + nonce + "\n" + hex(SHA256(body))
//! key       = ascii(hex(SHA256(device_secret)))
//! signature = hex(HMAC_SHA256(key, toSign))
//! ```

use hmac::digest::InvalidLength;
use hmac::{Hmac, Mac};
use sha2::{Digest, Sha256};
use uuid::Uuid;

use crate::error::{ApiError, ApiResult};

type HmacSha256 = Hmac<Sha256>;

pub const METHOD_POST: &str = "POST";

/// Lowercase hex SHA-256 of the UTF-8 bytes of `value`.
pub fn sha256_hex(value: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(value.as_bytes());
    hex::encode(hasher.finalize())
}

/// Lowercase hex HMAC-SHA256 of `payload` under `key`.
pub fn hmac_sha256_hex(key: &[u8], payload: &str) -> Result<String, InvalidLength> {
    let mut mac = HmacSha256::new_from_slice(key)?;
    mac.update(payload.as_bytes());
    Ok(hex::encode(mac.finalize().into_bytes()))
}

pub fn canonical_string(method: &str, path: &str, ts: &str, nonce: &str, body_hash: &str) -> String {
    format!("{method}\n{path}\n{ts}\n{nonce}\n{body_hash}")
}

/// The secret is hashed first; its hex digest is the HMAC key.
pub fn sign(secret: &str, canonical: &str) -> Result<String, InvalidLength> {
    let key = sha256_hex(secret);
    hmac_sha256_hex(key.as_bytes(), canonical)
}

/// Headers binding one request to its path, time, nonce, and body.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestSignature {
    pub timestamp: String,
    pub nonce: String,
    pub signature: String,
}

impl RequestSignature {
    pub fn compute(
        path: &str,
        body: &str,
        secret: &str,
        timestamp: String,
        nonce: String,
    ) -> ApiResult<Self> {
        let body_hash = sha256_hex(body);
        let canonical = canonical_string(METHOD_POST, path, &timestamp, &nonce, &body_hash);
        let signature = sign(secret, &canonical)
            .map_err(|e| ApiError::Protocol(format!("cannot sign request: {e}")))?;
        Ok(Self {
            timestamp,
            nonce,
            signature,
        })
    }

    /// Signature with the current Unix time in milliseconds and a new v4 nonce.
    pub fn fresh(path: &str, body: &str, secret: &str) -> ApiResult<Self> {
        let timestamp = chrono::Utc::now().timestamp_millis().to_string();
        let nonce = Uuid::new_v4().to_string();
        Self::compute(path, body, secret, timestamp, nonce)
    }
}
