//! Gateway authentication: bearer JWT on first contact, opaque session
//! cookie afterwards.
//!
//! The JWT is HS256 over base64url segments with `{sub, sid, exp}`
//! claims. Verification uses the HMAC's constant-time comparison; a
//! token without exactly three parts, with a non-HS256 header, or with
//! `exp` in the past is rejected. On success the gateway mints a
//! 32-byte-hex session token held in memory with a 15-minute TTL, so
//! asset requests never carry the JWT in URLs.

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine as _;
use hmac::{Hmac, Mac};
use parking_lot::Mutex;
use serde::Deserialize;
use sha2::Sha256;
use std::collections::HashMap;
use std::time::{Duration, Instant};

type HmacSha256 = Hmac<Sha256>;

pub const SESSION_COOKIE: &str = "gateway_session";
pub const SESSION_TTL: Duration = Duration::from_secs(900);

#[derive(Debug, Deserialize)]
struct JwtHeader {
    alg: String,
}

#[derive(Debug, Deserialize)]
pub struct JwtClaims {
    pub sub: String,
    pub sid: String,
    /// Unix seconds.
    pub exp: i64,
}

/// Verify an HS256 JWT and return its claims.
pub fn verify_jwt(token: &str, secret: &[u8], now_unix: i64) -> Option<JwtClaims> {
    let mut parts = token.split('.');
    let (Some(header_b64), Some(payload_b64), Some(signature_b64), None) =
        (parts.next(), parts.next(), parts.next(), parts.next())
    else {
        return None;
    };

    let header: JwtHeader =
        serde_json::from_slice(&URL_SAFE_NO_PAD.decode(header_b64).ok()?).ok()?;
    if header.alg != "HS256" {
        return None;
    }

    let signature = URL_SAFE_NO_PAD.decode(signature_b64).ok()?;
    let mut mac = HmacSha256::new_from_slice(secret).ok()?;
    mac.update(header_b64.as_bytes());
    mac.update(b".");
    mac.update(payload_b64.as_bytes());
    mac.verify_slice(&signature).ok()?;

    let claims: JwtClaims =
        serde_json::from_slice(&URL_SAFE_NO_PAD.decode(payload_b64).ok()?).ok()?;
    if claims.exp <= now_unix {
        return None;
    }
    Some(claims)
}

/// Sign an HS256 JWT (used by the platform when handing out gateway
/// links, and by tests).
pub fn sign_jwt(sub: &str, sid: &str, exp: i64, secret: &[u8]) -> String {
    let header = URL_SAFE_NO_PAD.encode(br#"{"alg":"HS256","typ":"JWT"}"#);
    let payload = URL_SAFE_NO_PAD.encode(
        serde_json::json!({"sub": sub, "sid": sid, "exp": exp}).to_string(),
    );
    let mut mac = HmacSha256::new_from_slice(secret).expect("hmac accepts any key length");
    mac.update(header.as_bytes());
    mac.update(b".");
    mac.update(payload.as_bytes());
    let signature = URL_SAFE_NO_PAD.encode(mac.finalize().into_bytes());
    format!("{header}.{payload}.{signature}")
}

struct SessionEntry {
    expires_at: Instant,
}

/// In-memory session-token table, private to one gateway process.
#[derive(Default)]
pub struct SessionTokens {
    tokens: Mutex<HashMap<String, SessionEntry>>,
}

impl SessionTokens {
    pub fn new() -> Self {
        SessionTokens::default()
    }

    /// Mint a fresh opaque token.
    pub fn mint(&self) -> String {
        let bytes: [u8; 32] = rand::random();
        let token = hex::encode(bytes);
        self.tokens.lock().insert(
            token.clone(),
            SessionEntry {
                expires_at: Instant::now() + SESSION_TTL,
            },
        );
        token
    }

    pub fn is_valid(&self, token: &str) -> bool {
        let mut tokens = self.tokens.lock();
        match tokens.get(token) {
            Some(entry) if entry.expires_at > Instant::now() => true,
            Some(_) => {
                tokens.remove(token);
                false
            }
            None => false,
        }
    }

    /// The Set-Cookie header value for a newly minted token.
    pub fn cookie_for(token: &str) -> String {
        format!(
            "{SESSION_COOKIE}={token}; Path=/; Max-Age={}; SameSite=None; Secure",
            SESSION_TTL.as_secs()
        )
    }

    /// Pull the session token out of a Cookie header value.
    pub fn from_cookie_header(header: &str) -> Option<&str> {
        header.split(';').find_map(|pair| {
            let (name, value) = pair.trim().split_once('=')?;
            (name == SESSION_COOKIE).then_some(value)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SECRET: &[u8] = b"gateway-secret";

    fn now() -> i64 {
        time::OffsetDateTime::now_utc().unix_timestamp()
    }

    #[test]
    fn signed_jwt_verifies() {
        let token = sign_jwt("u1", "s1", now() + 60, SECRET);
        let claims = verify_jwt(&token, SECRET, now()).unwrap();
        assert_eq!(claims.sub, "u1");
        assert_eq!(claims.sid, "s1");
    }

    #[test]
    fn expired_jwt_is_rejected() {
        let token = sign_jwt("u1", "s1", now() - 1, SECRET);
        assert!(verify_jwt(&token, SECRET, now()).is_none());
    }

    #[test]
    fn tampered_payload_is_rejected() {
        let token = sign_jwt("u1", "s1", now() + 60, SECRET);
        let mut parts: Vec<&str> = token.split('.').collect();
        let forged = URL_SAFE_NO_PAD.encode(
            serde_json::json!({"sub": "intruder", "sid": "s1", "exp": now() + 60}).to_string(),
        );
        parts[1] = &forged;
        let forged_token = parts.join(".");
        assert!(verify_jwt(&forged_token, SECRET, now()).is_none());
    }

    #[test]
    fn wrong_secret_and_wrong_alg_are_rejected() {
        let token = sign_jwt("u1", "s1", now() + 60, SECRET);
        assert!(verify_jwt(&token, b"other", now()).is_none());

        // alg: none style downgrade.
        let header = URL_SAFE_NO_PAD.encode(br#"{"alg":"none"}"#);
        let payload = URL_SAFE_NO_PAD
            .encode(serde_json::json!({"sub": "u", "sid": "s", "exp": now() + 60}).to_string());
        let downgraded = format!("{header}.{payload}.");
        assert!(verify_jwt(&downgraded, SECRET, now()).is_none());
    }

    #[test]
    fn two_part_tokens_are_rejected() {
        assert!(verify_jwt("a.b", SECRET, now()).is_none());
        assert!(verify_jwt("a.b.c.d", SECRET, now()).is_none());
    }

    #[test]
    fn session_tokens_mint_validate_and_format() {
        let tokens = SessionTokens::new();
        let token = tokens.mint();
        assert_eq!(token.len(), 64);
        assert!(tokens.is_valid(&token));
        assert!(!tokens.is_valid("unknown"));

        let cookie = SessionTokens::cookie_for(&token);
        assert!(cookie.starts_with("gateway_session="));
        assert!(cookie.contains("Max-Age=900"));
        assert!(cookie.contains("SameSite=None"));
        assert!(cookie.contains("Secure"));
    }

    #[test]
    fn cookie_header_parsing() {
        assert_eq!(
            SessionTokens::from_cookie_header("other=1; gateway_session=abc; x=2"),
            Some("abc")
        );
        assert_eq!(SessionTokens::from_cookie_header("other=1"), None);
    }
}
