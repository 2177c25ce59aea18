//! HMAC-SHA256 payload signing.
//!
//! The current scheme signs `"<timestamp>.<payload>"` and is sent as
//! `t=<timestamp>,v1=<hex>`. The legacy scheme signs the bare payload and is
//! sent as `sha256=<hex>` for receivers that predate timestamps.

use hmac::{digest::KeyInit, Hmac, Mac};
use sha2::Sha256;

type HmacSha256 = Hmac<Sha256>;

/// Header carrying the timestamped signature.
pub const SIGNATURE_HEADER: &str = "X-Webhook-Signature";

/// Header carrying the legacy payload-only digest.
pub const LEGACY_SIGNATURE_HEADER: &str = "X-Hub-Signature-256";

/// Header carrying the unix timestamp used in the signature.
pub const TIMESTAMP_HEADER: &str = "X-Webhook-Timestamp";

/// Signature header values for one payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SignatureHeaders {
    /// `t=<timestamp>,v1=<hex>`
    pub current: String,
    /// `sha256=<hex>`
    pub legacy: String,
    /// Unix timestamp in seconds.
    pub timestamp: i64,
}

/// Keyed MAC for `secret`.
///
/// # Panics
///
/// Never in practice: HMAC pads or hashes keys of any length.
#[allow(clippy::expect_used)]
fn mac(secret: &str) -> HmacSha256 {
    <HmacSha256 as KeyInit>::new_from_slice(secret.as_bytes())
        .expect("HMAC accepts keys of any length")
}

fn timestamped_mac(payload: &[u8], secret: &str, timestamp: i64) -> HmacSha256 {
    let mut mac = mac(secret);
    mac.update(timestamp.to_string().as_bytes());
    mac.update(b".");
    mac.update(payload);
    mac
}

/// Signs `payload` with `secret` at `timestamp`.
pub fn sign(payload: &[u8], secret: &str, timestamp: i64) -> SignatureHeaders {
    let current = hex::encode(timestamped_mac(payload, secret, timestamp).finalize().into_bytes());

    let mut legacy = mac(secret);
    legacy.update(payload);
    let legacy = hex::encode(legacy.finalize().into_bytes());

    SignatureHeaders {
        current: format!("t={timestamp},v1={current}"),
        legacy: format!("sha256={legacy}"),
        timestamp,
    }
}

/// Verifies a `t=<ts>,v1=<hex>` header against `payload` in constant time.
///
/// Returns false for malformed headers.
pub fn verify(payload: &[u8], secret: &str, header: &str) -> bool {
    let mut timestamp = None;
    let mut signature = None;
    for part in header.split(',') {
        match part.trim().split_once('=') {
            Some(("t", value)) => timestamp = value.parse::<i64>().ok(),
            Some(("v1", value)) => signature = hex::decode(value).ok(),
            _ => {},
        }
    }

    let (Some(timestamp), Some(signature)) = (timestamp, signature) else {
        return false;
    };

    timestamped_mac(payload, secret, timestamp).verify_slice(&signature).is_ok()
}

/// Verifies a `sha256=<hex>` legacy header in constant time.
pub fn verify_legacy(payload: &[u8], secret: &str, header: &str) -> bool {
    let Some(signature) = header.strip_prefix("sha256=").and_then(|h| hex::decode(h).ok()) else {
        return false;
    };
    let mut mac = mac(secret);
    mac.update(payload);
    mac.verify_slice(&signature).is_ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn signature_format() {
        let headers = sign(b"{}", "secret", 1_700_000_000);
        assert!(headers.current.starts_with("t=1700000000,v1="));
        assert_eq!(headers.current.len(), "t=1700000000,v1=".len() + 64);
        assert!(headers.legacy.starts_with("sha256="));
        assert_eq!(headers.timestamp, 1_700_000_000);
    }

    #[test]
    fn known_vector_matches_manual_hmac() {
        let mut mac = <HmacSha256 as KeyInit>::new_from_slice(b"key").unwrap();
        mac.update(b"42.hello");
        let expected = hex::encode(mac.finalize().into_bytes());

        assert_eq!(sign(b"hello", "key", 42).current, format!("t=42,v1={expected}"));
    }

    #[test]
    fn verify_accepts_own_signature_and_rejects_tampering() {
        let headers = sign(b"payload", "s3cret", 100);
        assert!(verify(b"payload", "s3cret", &headers.current));
        assert!(verify_legacy(b"payload", "s3cret", &headers.legacy));

        assert!(!verify(b"payload!", "s3cret", &headers.current));
        assert!(!verify(b"payload", "other", &headers.current));
        assert!(!verify(b"payload", "s3cret", "t=100"));
        assert!(!verify_legacy(b"payload", "s3cret", "md5=abc"));
    }

    #[test]
    fn timestamp_is_bound_into_signature() {
        let a = sign(b"x", "k", 1);
        let b = sign(b"x", "k", 2);
        assert_ne!(a.current, b.current);
        assert_eq!(a.legacy, b.legacy);
    }

    #[test]
    fn empty_and_oversized_secrets_sign_and_verify() {
        let long = "k".repeat(200);
        for secret in ["", long.as_str()] {
            let headers = sign(b"body", secret, 7);
            assert!(verify(b"body", secret, &headers.current));
            assert!(verify_legacy(b"body", secret, &headers.legacy));
        }
    }
}
