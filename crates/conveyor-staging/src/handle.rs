use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use chrono::{DateTime, TimeZone, Utc};
use hmac::{Hmac, Mac};
use sha2::Sha256;

type HmacSha256 = Hmac<Sha256>;

/// Signs and verifies expiring staging-handle tokens.
///
/// A token covers the access verb, the object key, and the expiry second:
/// `base64url(expiry) . hex(hmac_sha256(secret, "verb:key:expiry"))`.
/// Tampering with any covered part or using a token past its expiry fails
/// verification.
#[derive(Clone)]
pub struct HandleSigner {
    secret: Vec<u8>,
}

impl HandleSigner {
    /// Create a signer over the given shared secret.
    pub fn new(secret: impl Into<Vec<u8>>) -> Self {
        Self {
            secret: secret.into(),
        }
    }

    fn mac(&self, verb: &str, key: &str, expiry_ts: i64) -> String {
        #[allow(clippy::expect_used)]
        let mut mac = HmacSha256::new_from_slice(&self.secret)
            .expect("HMAC accepts keys of any length");
        mac.update(format!("{verb}:{key}:{expiry_ts}").as_bytes());
        hex::encode(mac.finalize().into_bytes())
    }

    /// Sign a token for `verb` access to `key` until `expires_at`.
    pub fn sign(&self, verb: &str, key: &str, expires_at: DateTime<Utc>) -> String {
        let ts = expires_at.timestamp();
        let prefix = URL_SAFE_NO_PAD.encode(ts.to_string());
        format!("{prefix}.{}", self.mac(verb, key, ts))
    }

    /// Verify a token grants `verb` access to `key` at `now`.
    pub fn verify(&self, verb: &str, key: &str, token: &str, now: DateTime<Utc>) -> bool {
        let Some((prefix, sig)) = token.split_once('.') else {
            return false;
        };
        let Ok(raw) = URL_SAFE_NO_PAD.decode(prefix) else {
            return false;
        };
        let Ok(ts) = String::from_utf8(raw).map(|s| s.parse::<i64>()) else {
            return false;
        };
        let Ok(ts) = ts else {
            return false;
        };
        let Some(expires_at) = Utc.timestamp_opt(ts, 0).single() else {
            return false;
        };
        if now > expires_at {
            return false;
        }
        sig == self.mac(verb, key, ts)
    }
}
