//! Magic-link token codec (spec §4.B).
//!
//! `token = base64url(JSON{intentId, iat, exp, nonce}) || "." || base64url(HMAC-SHA256(secret, payloadB64))`

use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine};
use hmac::{Hmac, Mac};
use rand::Rng;
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use subtle::ConstantTimeEq;
use time::OffsetDateTime;

use crate::error::{GatewayError, GatewayResult};
use crate::model::IntentId;

type HmacSha256 = Hmac<Sha256>;

const NONCE_LEN: usize = 21;
const NONCE_ALPHABET: &[u8] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz0123456789_-";

/// The JSON payload embedded in a magic-link token (spec §4.B).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct TokenPayload {
    pub intent_id: IntentId,
    /// Issued-at, Unix seconds.
    pub iat: i64,
    /// Expiry, Unix seconds.
    pub exp: i64,
    /// 21-char random identifier; exists only to prevent collisions between
    /// tokens for the same intent issued within the same second (spec §4.B).
    pub nonce: String,
}

impl TokenPayload {
    pub fn is_expired_at(&self, now: OffsetDateTime) -> bool {
        now.unix_timestamp() >= self.exp
    }
}

/// Generates a 21-character, URL-safe random nonce.
fn gen_nonce() -> String {
    let mut rng = rand::thread_rng();
    (0..NONCE_LEN)
        .map(|_| {
            let idx = rng.gen_range(0..NONCE_ALPHABET.len());
            NONCE_ALPHABET[idx] as char
        })
        .collect()
}

/// Issues a signed token for `intent_id`, valid for `ttl_seconds` from `now`.
pub fn issue(intent_id: IntentId, secret: &[u8], ttl_seconds: i64, now: OffsetDateTime) -> GatewayResult<String> {
    if ttl_seconds <= 0 {
        return Err(GatewayError::Validation(
            "ttlSeconds must be > 0".to_string(),
        ));
    }

    let payload = TokenPayload {
        intent_id,
        iat: now.unix_timestamp(),
        exp: now.unix_timestamp() + ttl_seconds,
        nonce: gen_nonce(),
    };

    let payload_json = serde_json::to_vec(&payload)?;
    let payload_b64 = URL_SAFE_NO_PAD.encode(payload_json);

    let mut mac = HmacSha256::new_from_slice(secret)
        .map_err(|e| GatewayError::Fatal(format!("bad HMAC key: {e}")))?;
    mac.update(payload_b64.as_bytes());
    let sig = mac.finalize().into_bytes();
    let sig_b64 = URL_SAFE_NO_PAD.encode(sig);

    Ok(format!("{payload_b64}.{sig_b64}"))
}

/// Verifies `token` against `secret`. Splits on the final `.`, recomputes the
/// HMAC, compares in constant time, and rejects if the signature is absent,
/// mismatched, or `now >= exp` (spec §4.B). Returns the decoded payload on
/// success.
///
/// Note this function does *not* consult storage -- whether the token row
/// exists, and whether it has been consumed, is the caller's (`redeemToken`,
/// spec §4.I) concern.
pub fn verify(token: &str, secret: &[u8], now: OffsetDateTime) -> GatewayResult<TokenPayload> {
    let (payload_b64, sig_b64) = token
        .rsplit_once('.')
        .ok_or_else(|| GatewayError::Auth("InvalidToken: malformed token".to_string()))?;

    let expected_sig = {
        let mut mac = HmacSha256::new_from_slice(secret)
            .map_err(|e| GatewayError::Fatal(format!("bad HMAC key: {e}")))?;
        mac.update(payload_b64.as_bytes());
        mac.finalize().into_bytes()
    };

    let given_sig = URL_SAFE_NO_PAD
        .decode(sig_b64)
        .map_err(|_| GatewayError::Auth("InvalidToken: malformed signature".to_string()))?;

    // Constant-time compare over raw bytes (spec §4.B), not just length- or
    // short-circuit equality, to avoid leaking timing information about how
    // many leading bytes matched.
    let equal: bool = if given_sig.len() == expected_sig.len() {
        given_sig.as_slice().ct_eq(expected_sig.as_slice()).into()
    } else {
        false
    };
    if !equal {
        return Err(GatewayError::Auth("InvalidToken: signature mismatch".to_string()));
    }

    let payload_json = URL_SAFE_NO_PAD
        .decode(payload_b64)
        .map_err(|_| GatewayError::Auth("InvalidToken: malformed payload".to_string()))?;
    let payload: TokenPayload = serde_json::from_slice(&payload_json)
        .map_err(|_| GatewayError::Auth("InvalidToken: malformed payload".to_string()))?;

    if payload.is_expired_at(now) {
        return Err(GatewayError::Expired("TokenExpired".to_string()));
    }

    Ok(payload)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn now() -> OffsetDateTime {
        OffsetDateTime::now_utc()
    }

    #[test]
    fn round_trips() {
        let secret = b"0123456789abcdef0123456789abcdef";
        let intent_id = IntentId::new_v4();
        let token = issue(intent_id, secret, 3600, now()).unwrap();
        let payload = verify(&token, secret, now()).unwrap();
        assert_eq!(payload.intent_id, intent_id);
    }

    #[test]
    fn accepted_repeatedly_until_expiry() {
        let secret = b"0123456789abcdef0123456789abcdef";
        let intent_id = IntentId::new_v4();
        let token = issue(intent_id, secret, 1, now()).unwrap();
        assert!(verify(&token, secret, now()).is_ok());
        assert!(verify(&token, secret, now()).is_ok());
    }

    #[test]
    fn rejected_after_expiry() {
        let secret = b"0123456789abcdef0123456789abcdef";
        let intent_id = IntentId::new_v4();
        let past = now() - Duration::from_secs(120);
        let token = issue(intent_id, secret, 60, past).unwrap();
        let err = verify(&token, secret, now()).unwrap_err();
        assert!(matches!(err, GatewayError::Expired(_)));
    }

    #[test]
    fn signature_isolation() {
        let secret = b"0123456789abcdef0123456789abcdef";
        let other_secret = b"fedcba9876543210fedcba9876543210";
        let intent_id = IntentId::new_v4();
        let token = issue(intent_id, secret, 3600, now()).unwrap();
        let err = verify(&token, other_secret, now()).unwrap_err();
        assert!(matches!(err, GatewayError::Auth(_)));
    }

    #[test]
    fn rejects_malformed_token() {
        let secret = b"0123456789abcdef0123456789abcdef";
        assert!(verify("not-a-token", secret, now()).is_err());
        assert!(verify("abc.def", secret, now()).is_err());
    }

    #[test]
    fn two_tokens_for_same_intent_differ() {
        let secret = b"0123456789abcdef0123456789abcdef";
        let intent_id = IntentId::new_v4();
        let t1 = issue(intent_id, secret, 3600, now()).unwrap();
        let t2 = issue(intent_id, secret, 3600, now()).unwrap();
        assert_ne!(t1, t2);
    }
}
