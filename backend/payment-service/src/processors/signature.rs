//! Webhook signature schemes.
//!
//! Both processors sign with HMAC-SHA256; comparisons go through
//! `Mac::verify_slice`, which is constant time.

use super::{ProcessorError, ProcessorResult};
use hmac::{Hmac, Mac};
use sha2::Sha256;

type HmacSha256 = Hmac<Sha256>;

fn mac(secret: &[u8]) -> HmacSha256 {
    // HMAC accepts keys of any length
    HmacSha256::new_from_slice(secret).unwrap_or_else(|_| unreachable!())
}

/// Hex HMAC-SHA256 of `payload`
pub fn sign_hex(secret: &str, payload: &[u8]) -> String {
    let mut mac = mac(secret.as_bytes());
    mac.update(payload);
    hex::encode(mac.finalize().into_bytes())
}

/// Verify a hex HMAC-SHA256 signature over the raw payload
pub fn verify_hex(secret: &str, payload: &[u8], signature_hex: &str) -> ProcessorResult<()> {
    let expected = hex::decode(signature_hex.trim()).map_err(|_| ProcessorError::SignatureInvalid)?;
    let mut mac = mac(secret.as_bytes());
    mac.update(payload);
    mac.verify_slice(&expected)
        .map_err(|_| ProcessorError::SignatureInvalid)
}

/// Build a `Stripe-Signature` header value for `payload` at `timestamp`
pub fn stripe_header(secret: &str, payload: &[u8], timestamp: i64) -> String {
    let mut signed = format!("{}.", timestamp).into_bytes();
    signed.extend_from_slice(payload);
    format!("t={},v1={}", timestamp, sign_hex(secret, &signed))
}

/// Verify a `Stripe-Signature: t=<unix>,v1=<hex>[,v1=<hex>...]` header.
///
/// The signed message is `"{t}.{body}"`. Deliveries whose timestamp is more
/// than `tolerance_secs` away from `now` are rejected.
pub fn verify_stripe_header(
    secret: &str,
    payload: &[u8],
    header: &str,
    tolerance_secs: i64,
    now: i64,
) -> ProcessorResult<()> {
    let mut timestamp: Option<i64> = None;
    let mut candidates = Vec::new();

    for part in header.split(',') {
        match part.trim().split_once('=') {
            Some(("t", value)) => timestamp = value.parse().ok(),
            Some(("v1", value)) => candidates.push(value),
            _ => {}
        }
    }

    let timestamp = timestamp.ok_or(ProcessorError::SignatureInvalid)?;
    // The timestamp is attacker-controlled; an overflowing skew is just stale
    let fresh = now
        .checked_sub(timestamp)
        .map(i64::unsigned_abs)
        .is_some_and(|skew| skew <= tolerance_secs.max(0) as u64);
    if candidates.is_empty() || !fresh {
        return Err(ProcessorError::SignatureInvalid);
    }

    let mut signed = format!("{}.", timestamp).into_bytes();
    signed.extend_from_slice(payload);

    if candidates
        .iter()
        .any(|candidate| verify_hex(secret, &signed, candidate).is_ok())
    {
        Ok(())
    } else {
        Err(ProcessorError::SignatureInvalid)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SECRET: &str = "whsec_test";

    #[test]
    fn test_hex_signature() {
        let body = br#"{"eventType":"RenewalSuccess"}"#;
        let sig = sign_hex(SECRET, body);
        assert!(verify_hex(SECRET, body, &sig).is_ok());
        assert!(verify_hex("other", body, &sig).is_err());
        assert!(verify_hex(SECRET, b"tampered", &sig).is_err());
        assert!(verify_hex(SECRET, body, "not-hex").is_err());
    }

    #[test]
    fn test_stripe_header_accepts_fresh_signature() {
        let body = br#"{"id":"evt_1"}"#;
        let header = stripe_header(SECRET, body, 1_700_000_000);
        assert!(verify_stripe_header(SECRET, body, &header, 300, 1_700_000_100).is_ok());
    }

    #[test]
    fn test_stripe_header_rejects_stale_or_tampered() {
        let body = br#"{"id":"evt_1"}"#;
        let header = stripe_header(SECRET, body, 1_700_000_000);

        assert!(verify_stripe_header(SECRET, body, &header, 300, 1_700_000_301).is_err());
        assert!(verify_stripe_header(SECRET, br#"{"id":"evt_2"}"#, &header, 300, 1_700_000_000).is_err());
        assert!(verify_stripe_header(SECRET, body, "v1=abcd", 300, 1_700_000_000).is_err());
    }

    #[test]
    fn test_stripe_header_rejects_extreme_timestamps() {
        let body = b"{}";
        for header in [
            "t=-9223372036854775808,v1=00",
            "t=9223372036854775807,v1=00",
        ] {
            assert!(matches!(
                verify_stripe_header(SECRET, body, header, 300, 1_700_000_000),
                Err(ProcessorError::SignatureInvalid)
            ));
        }
        assert!(verify_stripe_header(SECRET, body, "t=0,v1=00", 300, i64::MIN).is_err());
    }

    #[test]
    fn test_stripe_header_with_rotated_secrets() {
        let body = br#"{"id":"evt_1"}"#;
        let fresh = stripe_header(SECRET, body, 1_700_000_000);
        let old_sig = sign_hex("whsec_old", b"1700000000.{\"id\":\"evt_1\"}");
        let header = format!("{},v1={}", fresh, old_sig);
        assert!(verify_stripe_header(SECRET, body, &header, 300, 1_700_000_000).is_ok());
    }
}
