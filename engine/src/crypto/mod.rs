//! Scheduler signature verification
//!
//! Every continuation request delivered by the external scheduler carries a
//! signature header of the form
//!
//! ```text
//! x-scheduler-signature: t=<unix-seconds>,v1=<hex ed25519 signature>[,v1=...]
//! ```
//!
//! The signed message is `"<t>." + sha256_hex(raw_body)`. A request is
//! accepted when any `v1` signature verifies under the current or the next
//! verifying key and the timestamp lies within the tolerance window. Holding
//! two keys lets the scheduler rotate its signing key while requests signed
//! with the old one are still in flight.
//!
//! # Security
//!
//! - Verification runs over the raw bytes, before any JSON parsing
//! - Failures are logged with their cause and reported as `false`, never
//!   raised past this module
//! - Keys are never logged
//! - There is no nonce cache: the scheduler redelivers at-least-once and a
//!   replayed delivery is absorbed by the step-index check

use ed25519_dalek::{
    Signature, Signer, SigningKey, Verifier, VerifyingKey, PUBLIC_KEY_LENGTH, SECRET_KEY_LENGTH,
    SIGNATURE_LENGTH,
};
use sdk::errors::EngineError;
use sdk::handles::VerifierHandleImpl;
use sha2::{Digest, Sha256};

use crate::config::SigningConfig;

/// Which configured key produced a match
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeySlot {
    Current,
    Next,
}

/// Parsed signature header
#[derive(Debug)]
struct SignatureHeader {
    timestamp: i64,
    signatures: Vec<Signature>,
}

/// Verifies scheduler signatures against a current/next key pair
///
/// # Examples
///
/// ```
/// use ed25519_dalek::SigningKey;
/// use waypoint_engine::crypto::{sign_payload, SignatureVerifier};
///
/// let signing_key = SigningKey::from_bytes(&[7u8; 32]);
/// let verifier = SignatureVerifier::new(Some(signing_key.verifying_key()), None, 300);
///
/// let body = br#"{"operationId":"op-1"}"#;
/// let header = sign_payload(&signing_key, body, 1_700_000_000);
/// assert!(verifier.verify_at(body, Some(&header), 1_700_000_010));
/// ```
pub struct SignatureVerifier {
    current: Option<VerifyingKey>,
    next: Option<VerifyingKey>,
    tolerance_secs: u64,
    header: String,
}

impl SignatureVerifier {
    /// Create a verifier from already-parsed keys
    pub fn new(
        current: Option<VerifyingKey>,
        next: Option<VerifyingKey>,
        tolerance_secs: u64,
    ) -> Self {
        Self {
            current,
            next,
            tolerance_secs,
            header: "x-scheduler-signature".to_string(),
        }
    }

    /// Build a verifier from the `[signing]` config section
    ///
    /// # Errors
    ///
    /// Returns `EngineError::Config` if a configured key is not a valid
    /// 32-byte hex ed25519 public key.
    pub fn from_config(config: &SigningConfig) -> Result<Self, EngineError> {
        let current = config.current_key.as_deref().map(parse_verifying_key).transpose()?;
        let next = config.next_key.as_deref().map(parse_verifying_key).transpose()?;

        if current.is_none() && next.is_none() {
            tracing::warn!("No scheduler signing keys configured, signature checks are disabled");
        } else {
            tracing::info!(
                "Scheduler signature verification enabled (current: {}, next: {})",
                current.is_some(),
                next.is_some()
            );
        }

        Ok(Self {
            current,
            next,
            tolerance_secs: config.tolerance_secs,
            header: config.header.to_ascii_lowercase(),
        })
    }

    /// Verifier with no keys, enforcement skipped
    pub fn disabled() -> Self {
        Self::new(None, None, 300)
    }

    pub fn is_enabled(&self) -> bool {
        self.current.is_some() || self.next.is_some()
    }

    /// Verify against the current wall clock
    pub fn verify(&self, raw_body: &[u8], signature_header: Option<&str>) -> bool {
        self.verify_at(raw_body, signature_header, chrono::Utc::now().timestamp())
    }

    /// Verify as if the current time were `now` (unix seconds)
    pub fn verify_at(&self, raw_body: &[u8], signature_header: Option<&str>, now: i64) -> bool {
        if !self.is_enabled() {
            return false;
        }

        let Some(header) = signature_header else {
            tracing::warn!("Rejected request without {} header", self.header);
            return false;
        };

        match self.check(raw_body, header, now) {
            Ok(slot) => {
                tracing::debug!("Scheduler signature verified with {:?} key", slot);
                true
            }
            Err(e) => {
                tracing::warn!("Scheduler signature rejected: {}", e);
                false
            }
        }
    }

    fn check(&self, raw_body: &[u8], header: &str, now: i64) -> Result<KeySlot, EngineError> {
        let parsed = parse_header(header)?;

        let skew = now.saturating_sub(parsed.timestamp).unsigned_abs();
        if skew > self.tolerance_secs {
            return Err(EngineError::Validation(format!(
                "timestamp outside tolerance ({}s skew)",
                skew
            )));
        }

        let message = signed_message(parsed.timestamp, raw_body);
        let keys = [
            (KeySlot::Current, self.current.as_ref()),
            (KeySlot::Next, self.next.as_ref()),
        ];

        for signature in &parsed.signatures {
            for (slot, key) in keys {
                if let Some(key) = key {
                    if key.verify(message.as_bytes(), signature).is_ok() {
                        return Ok(slot);
                    }
                }
            }
        }

        Err(EngineError::InvalidSignature)
    }
}

impl VerifierHandleImpl for SignatureVerifier {
    fn is_enabled(&self) -> bool {
        SignatureVerifier::is_enabled(self)
    }

    fn header_name(&self) -> &str {
        &self.header
    }

    fn verify(&self, raw_body: &[u8], signature: Option<&str>) -> bool {
        SignatureVerifier::verify(self, raw_body, signature)
    }
}

/// Produce a signature header value for `body` at `timestamp`
pub fn sign_payload(signing_key: &SigningKey, body: &[u8], timestamp: i64) -> String {
    let message = signed_message(timestamp, body);
    let signature = signing_key.sign(message.as_bytes());
    format!("t={},v1={}", timestamp, hex::encode(signature.to_bytes()))
}

/// Parse a hex ed25519 verifying key
pub fn parse_verifying_key(key_hex: &str) -> Result<VerifyingKey, EngineError> {
    let bytes: [u8; PUBLIC_KEY_LENGTH] = decode_fixed(key_hex)
        .ok_or_else(|| EngineError::Config("Invalid verifying key: expected 32 hex bytes".to_string()))?;

    VerifyingKey::from_bytes(&bytes)
        .map_err(|e| EngineError::Config(format!("Invalid verifying key: {}", e)))
}

/// Parse a hex ed25519 signing key seed
pub fn parse_signing_key(seed_hex: &str) -> Result<SigningKey, EngineError> {
    let bytes: [u8; SECRET_KEY_LENGTH] = decode_fixed(seed_hex)
        .ok_or_else(|| EngineError::Config("Invalid signing key: expected 32 hex bytes".to_string()))?;

    Ok(SigningKey::from_bytes(&bytes))
}

fn decode_fixed<const N: usize>(value: &str) -> Option<[u8; N]> {
    hex::decode(value.trim()).ok()?.try_into().ok()
}

fn signed_message(timestamp: i64, body: &[u8]) -> String {
    format!("{}.{}", timestamp, hex::encode(Sha256::digest(body)))
}

/// Parse `t=<unix>,v1=<hex>[,v1=<hex>...]`. Unknown keys are ignored.
fn parse_header(header: &str) -> Result<SignatureHeader, EngineError> {
    let mut timestamp = None;
    let mut signatures = Vec::new();

    for part in header.split(',') {
        let Some((key, value)) = part.trim().split_once('=') else {
            continue;
        };
        match key.trim() {
            "t" => {
                timestamp = Some(value.trim().parse::<i64>().map_err(|_| {
                    EngineError::Validation("signature timestamp is not an integer".to_string())
                })?);
            }
            "v1" => signatures.push(parse_signature(value.trim())?),
            _ => {}
        }
    }

    let timestamp = timestamp
        .ok_or_else(|| EngineError::Validation("signature header has no timestamp".to_string()))?;
    if signatures.is_empty() {
        return Err(EngineError::Validation(
            "signature header has no v1 signature".to_string(),
        ));
    }

    Ok(SignatureHeader {
        timestamp,
        signatures,
    })
}

fn parse_signature(sig_hex: &str) -> Result<Signature, EngineError> {
    let bytes = hex::decode(sig_hex).map_err(|e| {
        tracing::debug!("Failed to decode signature hex: {}", e);
        EngineError::InvalidSignature
    })?;

    let sig_bytes: [u8; SIGNATURE_LENGTH] = bytes.try_into().map_err(|b: Vec<u8>| {
        tracing::debug!(
            "Invalid signature length: expected {}, got {}",
            SIGNATURE_LENGTH,
            b.len()
        );
        EngineError::InvalidSignature
    })?;

    Ok(Signature::from_bytes(&sig_bytes))
}
