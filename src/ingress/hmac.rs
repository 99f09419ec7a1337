// =============================================================================
// Webhook HMAC verification
// =============================================================================
//
// Same byte-xor comparison discipline as `api::auth::constant_time_eq`,
// extended to cover the webhook signature check: canonicalize the signed
// material as `"{timestamp}.{raw_body}"`, accept the header value with an
// optional `sha256=` or `hmac-sha256=` prefix (or no prefix at all, since
// some alert senders post the bare hex digest), and reject anything
// outside the configured replay window.

use chrono::Utc;
use hmac::{Hmac, Mac};
use sha2::Sha256;

use crate::errors::EngineError;

type HmacSha256 = Hmac<Sha256>;

fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    let mut diff = 0u8;
    for (x, y) in a.iter().zip(b.iter()) {
        diff |= x ^ y;
    }
    diff == 0
}

fn strip_known_prefix(header_value: &str) -> &str {
    header_value
        .strip_prefix("sha256=")
        .or_else(|| header_value.strip_prefix("hmac-sha256="))
        .unwrap_or(header_value)
}

/// Verify a webhook delivery's signature and timestamp.
///
/// `timestamp_sec` is the sender-provided Unix timestamp (from a header or
/// the payload body, depending on provider); `tolerance_sec` is the
/// configured replay window half-width.
pub fn verify(
    secret: &str,
    raw_body: &[u8],
    header_signature: &str,
    timestamp_sec: i64,
    tolerance_sec: i64,
) -> Result<(), EngineError> {
    let now = Utc::now().timestamp();
    if (now - timestamp_sec).abs() > tolerance_sec {
        return Err(EngineError::Replay);
    }

    let mut mac = HmacSha256::new_from_slice(secret.as_bytes()).expect("HMAC accepts any key size");
    mac.update(timestamp_sec.to_string().as_bytes());
    mac.update(b".");
    mac.update(raw_body);
    let expected = hex::encode(mac.finalize().into_bytes());

    let provided = strip_known_prefix(header_signature.trim());
    if !constant_time_eq(expected.as_bytes(), provided.as_bytes()) {
        return Err(EngineError::SignatureInvalid);
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sign(secret: &str, body: &[u8], ts: i64) -> String {
        let mut mac = HmacSha256::new_from_slice(secret.as_bytes()).unwrap();
        mac.update(ts.to_string().as_bytes());
        mac.update(b".");
        mac.update(body);
        hex::encode(mac.finalize().into_bytes())
    }

    #[test]
    fn accepts_valid_signature_within_window() {
        let now = Utc::now().timestamp();
        let sig = sign("secret", b"{\"a\":1}", now);
        assert!(verify("secret", b"{\"a\":1}", &sig, now, 300).is_ok());
    }

    #[test]
    fn accepts_prefixed_signature_variants() {
        let now = Utc::now().timestamp();
        let sig = sign("secret", b"body", now);
        assert!(verify("secret", b"body", &format!("sha256={sig}"), now, 300).is_ok());
        assert!(verify("secret", b"body", &format!("hmac-sha256={sig}"), now, 300).is_ok());
    }

    #[test]
    fn rejects_wrong_secret() {
        let now = Utc::now().timestamp();
        let sig = sign("secret", b"body", now);
        assert!(matches!(
            verify("other-secret", b"body", &sig, now, 300),
            Err(EngineError::SignatureInvalid)
        ));
    }

    #[test]
    fn rejects_timestamp_outside_replay_window() {
        let old = Utc::now().timestamp() - 10_000;
        let sig = sign("secret", b"body", old);
        assert!(matches!(
            verify("secret", b"body", &sig, old, 300),
            Err(EngineError::Replay)
        ));
    }

    #[test]
    fn constant_time_eq_rejects_length_mismatch() {
        assert!(!constant_time_eq(b"abc", b"ab"));
    }
}
