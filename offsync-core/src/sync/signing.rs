//! HMAC request signing
//!
//! The signing string is `METHOD:PATH:TIMESTAMP:BODY` where `BODY` is the
//! exact request body sent on the wire. The signature is the lowercase hex
//! HMAC-SHA256 of that string keyed with the device token.

use hmac::{Hmac, Mac};
use sha2::Sha256;

use crate::error::{Error, Result};

type HmacSha256 = Hmac<Sha256>;

/// Path samples are posted to, as signed
pub const INGEST_PATH: &str = "/ingest/locations";

/// Headers carrying a request signature.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SignedHeaders {
    /// Unix milliseconds, `x-timestamp`
    pub timestamp: String,
    /// Lowercase hex digest, `x-signature`
    pub signature: String,
}

/// Build the canonical string fed into the HMAC.
pub fn signing_string(method: &str, path: &str, timestamp_ms: i64, body: &str) -> String {
    format!(
        "{}:{}:{}:{}",
        method.to_ascii_uppercase(),
        path,
        timestamp_ms,
        body
    )
}

/// Lowercase hex HMAC-SHA256 of `message` keyed with `key`.
pub fn hmac_sha256_hex(key: &str, message: &str) -> Result<String> {
    let mut mac = HmacSha256::new_from_slice(key.as_bytes())
        .map_err(|e| Error::Signature(format!("invalid HMAC key: {}", e)))?;
    mac.update(message.as_bytes());
    Ok(hex::encode(mac.finalize().into_bytes()))
}

/// Sign an ingest POST carrying `body`.
pub fn sign_ingest(device_token: &str, timestamp_ms: i64, body: &str) -> Result<SignedHeaders> {
    let message = signing_string("POST", INGEST_PATH, timestamp_ms, body);
    let signature = hmac_sha256_hex(device_token, &message)?;
    Ok(SignedHeaders {
        timestamp: timestamp_ms.to_string(),
        signature,
    })
}
