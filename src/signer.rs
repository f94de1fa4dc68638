//! HMAC-SHA256 signing and verification for heartbeat payloads.
//!
//! Two modes cover the two transports:
//!
//! - **Structured**: the HTTP heartbeat is signed over a canonical JSON
//!   object with a fixed key set and order ([`CanonicalHeartbeat`]).
//! - **Raw**: the SMS heartbeat is signed over the message bytes preceding
//!   the `;sig=` suffix.
//!
//! Verification goes through the `Mac` API, which compares in constant
//! time. The active secret is process configuration; rotation is out of
//! scope.

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use hmac::{Hmac, Mac};
use serde::Serialize;
use sha2::Sha256;

use crate::model::CellInfo;

type HmacSha256 = Hmac<Sha256>;

/// Canonical signing form of a heartbeat.
///
/// Key order is fixed by field declaration order; absent battery/speed
/// serialize as `null`. Clients must produce byte-identical JSON, so this
/// struct is the single source of truth for the signed form.
#[derive(Debug, Clone, Serialize)]
pub struct CanonicalHeartbeat {
    pub user_id: String,
    /// Unix seconds
    pub timestamp: i64,
    pub lat: f64,
    pub lng: f64,
    pub accuracy_m: u32,
    pub cell_info: CellInfo,
    pub battery_pct: Option<u8>,
    pub speed: Option<f64>,
    pub last_gasp: bool,
}

/// Signs and verifies payloads with the process-wide HMAC secret.
#[derive(Clone)]
pub struct Signer {
    secret: Vec<u8>,
}

impl Signer {
    pub fn new(secret: impl Into<String>) -> Self {
        Self {
            secret: secret.into().into_bytes(),
        }
    }

    /// Sign the canonical JSON form of a heartbeat, returning base64.
    pub fn sign_structured(&self, payload: &CanonicalHeartbeat) -> Result<String, SignerError> {
        let json = serde_json::to_vec(payload)
            .map_err(|e| SignerError::Serialization(e.to_string()))?;
        Ok(self.sign_raw(&json))
    }

    /// Sign raw bytes, returning base64.
    pub fn sign_raw(&self, data: &[u8]) -> String {
        let mut mac = HmacSha256::new_from_slice(&self.secret)
            .expect("HMAC accepts keys of any length");
        mac.update(data);
        BASE64.encode(mac.finalize().into_bytes())
    }

    /// Verify a structured signature.
    pub fn verify_structured(
        &self,
        payload: &CanonicalHeartbeat,
        signature: &str,
    ) -> Result<(), SignerError> {
        let json = serde_json::to_vec(payload)
            .map_err(|e| SignerError::Serialization(e.to_string()))?;
        self.verify_raw(&json, signature)
    }

    /// Verify a raw signature in constant time.
    pub fn verify_raw(&self, data: &[u8], signature: &str) -> Result<(), SignerError> {
        let expected = BASE64
            .decode(signature)
            .map_err(|_| SignerError::InvalidSignature)?;

        let mut mac = HmacSha256::new_from_slice(&self.secret)
            .expect("HMAC accepts keys of any length");
        mac.update(data);
        mac.verify_slice(&expected)
            .map_err(|_| SignerError::InvalidSignature)
    }
}

impl std::fmt::Debug for Signer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // Never print the secret.
        f.debug_struct("Signer").finish_non_exhaustive()
    }
}

/// Signer error types.
#[derive(Debug, PartialEq, Eq)]
pub enum SignerError {
    /// Signature bytes differ from the expected MAC
    InvalidSignature,
    /// Payload could not be serialized to its canonical form
    Serialization(String),
}

impl std::fmt::Display for SignerError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SignerError::InvalidSignature => write!(f, "invalid signature"),
            SignerError::Serialization(msg) => write!(f, "canonical serialization failed: {msg}"),
        }
    }
}

impl std::error::Error for SignerError {}
