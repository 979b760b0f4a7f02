//! Webhook signature verification.
//!
//! The provider signs each delivery with `t=<unix>,v1=<hex>` where the hex
//! digest is HMAC-SHA256 over `"{t}.{raw body}"`. Verification must use a
//! constant-time comparison and reject stale timestamps.

use hmac::{Hmac, Mac};
use sha2::Sha256;
use std::fmt;

type HmacSha256 = Hmac<Sha256>;

/// Default tolerated clock skew between the signature timestamp and now.
pub const DEFAULT_TOLERANCE_SECS: i64 = 300;

/// Why a signature was rejected. Always a 4xx-category outcome; never retried.
#[derive(Debug, PartialEq, Eq)]
pub enum SignatureError {
    /// Header missing, malformed, or carrying no `v1` candidate.
    Malformed,
    /// Timestamp outside the tolerance window.
    Stale { timestamp: i64, now: i64 },
    /// No `v1` candidate matched the expected digest.
    Mismatch,
}

impl fmt::Display for SignatureError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SignatureError::Malformed => write!(f, "malformed signature header"),
            SignatureError::Stale { timestamp, now } => {
                write!(f, "stale signature timestamp {timestamp} (now {now})")
            }
            SignatureError::Mismatch => write!(f, "signature mismatch"),
        }
    }
}

impl std::error::Error for SignatureError {}

/// Parsed `t=…,v1=…` header. Multiple `v1` entries are legal (secret roll).
#[derive(Debug)]
pub struct ParsedSignature {
    pub timestamp: i64,
    pub v1_candidates: Vec<String>,
}

/// Parse the signature header into timestamp + v1 candidates.
pub fn parse_signature_header(header: &str) -> Result<ParsedSignature, SignatureError> {
    let mut timestamp = None;
    let mut v1_candidates = Vec::new();

    for part in header.split(',') {
        let Some((key, value)) = part.trim().split_once('=') else {
            continue;
        };
        match key {
            "t" => timestamp = value.parse::<i64>().ok(),
            "v1" => v1_candidates.push(value.to_string()),
            _ => {} // ignore v0 and future schemes
        }
    }

    match (timestamp, v1_candidates.is_empty()) {
        (Some(timestamp), false) => Ok(ParsedSignature {
            timestamp,
            v1_candidates,
        }),
        _ => Err(SignatureError::Malformed),
    }
}

/// Compute the expected `v1` digest for a payload at a given timestamp.
///
/// Exposed so tests (and the live-stream ack path) can construct valid
/// signed deliveries.
pub fn sign_payload(secret: &str, timestamp: i64, payload: &[u8]) -> String {
    let mut mac =
        HmacSha256::new_from_slice(secret.as_bytes()).expect("hmac accepts any key length");
    mac.update(timestamp.to_string().as_bytes());
    mac.update(b".");
    mac.update(payload);
    hex::encode(mac.finalize().into_bytes())
}

/// Verify a signed delivery against the raw request body.
///
/// `now_unix` is injected by the caller so the tolerance window is testable;
/// production callers pass `chrono::Utc::now().timestamp()`.
pub fn verify_signature(
    payload: &[u8],
    header: &str,
    secret: &str,
    tolerance_secs: i64,
    now_unix: i64,
) -> Result<i64, SignatureError> {
    let parsed = parse_signature_header(header)?;

    if (now_unix - parsed.timestamp).abs() > tolerance_secs {
        return Err(SignatureError::Stale {
            timestamp: parsed.timestamp,
            now: now_unix,
        });
    }

    for candidate in &parsed.v1_candidates {
        let Ok(candidate_bytes) = hex::decode(candidate) else {
            continue;
        };
        let mut mac =
            HmacSha256::new_from_slice(secret.as_bytes()).expect("hmac accepts any key length");
        mac.update(parsed.timestamp.to_string().as_bytes());
        mac.update(b".");
        mac.update(payload);
        // verify_slice is constant-time.
        if mac.verify_slice(&candidate_bytes).is_ok() {
            return Ok(parsed.timestamp);
        }
    }

    Err(SignatureError::Mismatch)
}
