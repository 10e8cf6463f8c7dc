//! Session resolution for hub entry points.
//!
//! A session token is a short-lived HS256 JWT minted by the surrounding
//! platform. Claims carry everything the hub needs to admit a connection:
//! user id, line (device) id, and platform. The signing key is 256-bit
//! random, stored as raw bytes in the data dir.

use chrono::Utc;
use jsonwebtoken::{decode, encode, DecodingKey, EncodingKey, Header, Validation};
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Session token lifetime in seconds (15 minutes).
const SESSION_TOKEN_TTL: i64 = 900;

/// Claims carried by a session token.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionClaims {
    /// User id — the hub registry key.
    pub sub: String,
    /// Line (device/tab) id, unique per user. Empty means "let the
    /// gateway pick one".
    #[serde(default)]
    pub line: String,
    /// Client platform string (web/ios/android/desktop).
    #[serde(default)]
    pub platform: String,
    pub iat: i64,
    pub exp: i64,
}

/// Load or generate the session-token signing key (256-bit random secret).
/// The key is stored as raw bytes in `data_dir/session_secret`.
pub fn load_or_generate_session_secret(
    data_dir: &str,
) -> Result<Vec<u8>, Box<dyn std::error::Error>> {
    let key_path = Path::new(data_dir).join("session_secret");

    if key_path.exists() {
        let key = std::fs::read(&key_path)?;
        if key.len() == 32 {
            tracing::info!("Session signing key loaded from {}", key_path.display());
            return Ok(key);
        }
        tracing::warn!("Session key file has wrong size ({}), regenerating", key.len());
    }

    let key: [u8; 32] = rand::rng().random();
    std::fs::write(&key_path, key)?;
    tracing::info!("Session signing key generated at {}", key_path.display());
    Ok(key.to_vec())
}

/// Issue a session token for one connection slot.
pub fn issue_session_token(
    secret: &[u8],
    user_id: &str,
    line_id: &str,
    platform: &str,
) -> Result<String, jsonwebtoken::errors::Error> {
    let now = Utc::now().timestamp();
    let claims = SessionClaims {
        sub: user_id.to_string(),
        line: line_id.to_string(),
        platform: platform.to_string(),
        iat: now,
        exp: now + SESSION_TOKEN_TTL,
    };

    encode(
        &Header::default(), // HS256
        &claims,
        &EncodingKey::from_secret(secret),
    )
}

/// Validate a session token and return its claims.
pub fn validate_session_token(
    secret: &[u8],
    token: &str,
) -> Result<SessionClaims, jsonwebtoken::errors::Error> {
    let data = decode::<SessionClaims>(
        token,
        &DecodingKey::from_secret(secret),
        &Validation::default(),
    )?;
    Ok(data.claims)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_token_roundtrip() {
        let secret = [3u8; 32];
        let token = issue_session_token(&secret, "alice", "phone", "ios").unwrap();
        let claims = validate_session_token(&secret, &token).unwrap();
        assert_eq!(claims.sub, "alice");
        assert_eq!(claims.line, "phone");
        assert_eq!(claims.platform, "ios");
    }

    #[test]
    fn test_wrong_secret_rejected() {
        let token = issue_session_token(&[1u8; 32], "alice", "phone", "ios").unwrap();
        assert!(validate_session_token(&[2u8; 32], &token).is_err());
    }
}
