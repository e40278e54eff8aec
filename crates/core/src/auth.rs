use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as B64;
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Event identifier embedded in every token; tokens minted for a different
/// deployment are rejected.
pub const EVENT_IDENTIFIER: &str = "cardforge-event-kiosk";

/// Token lifetime.
pub const TOKEN_EXPIRY_HOURS: i64 = 24;

const PERMISSIONS: [&str; 2] = ["card_generation", "video_animation"];

/// Decoded token contents.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct TokenPayload {
    /// Authenticated username.
    pub username: String,
    /// Opaque per-login session token (unrelated to quota sessions).
    pub session_id: String,
    /// Deployment identifier; must equal [`EVENT_IDENTIFIER`].
    pub event: String,
    /// Issue time, ISO-8601 UTC.
    pub issued_at: String,
    /// Expiry time, ISO-8601 UTC.
    pub expires_at: String,
    /// Granted permissions.
    pub permissions: Vec<String>,
}

/// Token rejection reasons, each mapped to 401 by the API layer.
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum AuthError {
    /// The token is not valid base64-encoded JSON.
    #[error("malformed authentication token")]
    Malformed,
    /// The token expiry is in the past.
    #[error("authentication token has expired")]
    Expired,
    /// The token was minted for a different event.
    #[error("token event identifier does not match")]
    WrongEvent,
    /// The token names a username this deployment does not know.
    #[error("unknown username in token")]
    UnknownUser,
}

/// Validates event credentials and mints/verifies bearer tokens.
///
/// Tokens are unsigned base64(JSON) documents, acceptable for trusted-network
/// event deployments; swap in signed tokens at this boundary for anything
/// hostile.
#[derive(Debug, Clone)]
pub struct Authenticator {
    username: String,
    password: String,
}

impl Authenticator {
    /// Build an authenticator for the configured event credentials.
    pub fn new(username: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            password: password.into(),
        }
    }

    /// Check a login attempt against the event credentials.
    pub fn validate_login(&self, username: &str, password: &str) -> bool {
        username == self.username && password == self.password
    }

    /// Mint a fresh token for a validated username.
    pub fn issue_token(&self, username: &str) -> String {
        let now = Utc::now();
        let payload = TokenPayload {
            username: username.to_string(),
            session_id: Uuid::new_v4().simple().to_string(),
            event: EVENT_IDENTIFIER.to_string(),
            issued_at: now.to_rfc3339(),
            expires_at: (now + Duration::hours(TOKEN_EXPIRY_HOURS)).to_rfc3339(),
            permissions: PERMISSIONS.iter().map(|p| p.to_string()).collect(),
        };
        // TokenPayload has no non-serializable fields, so encoding cannot fail.
        let json = serde_json::to_string(&payload).unwrap_or_default();
        B64.encode(json.as_bytes())
    }

    /// Verify a bearer token and return its payload.
    pub fn verify(&self, token: &str) -> Result<TokenPayload, AuthError> {
        let raw = B64.decode(token.as_bytes()).map_err(|_| AuthError::Malformed)?;
        let payload: TokenPayload =
            serde_json::from_slice(&raw).map_err(|_| AuthError::Malformed)?;

        let expires_at = DateTime::parse_from_rfc3339(&payload.expires_at)
            .map_err(|_| AuthError::Malformed)?
            .with_timezone(&Utc);
        if Utc::now() > expires_at {
            return Err(AuthError::Expired);
        }
        if payload.event != EVENT_IDENTIFIER {
            return Err(AuthError::WrongEvent);
        }
        if payload.username != self.username {
            return Err(AuthError::UnknownUser);
        }
        Ok(payload)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn auth() -> Authenticator {
        Authenticator::new("host", "secret")
    }

    #[test]
    fn issued_tokens_verify() {
        let token = auth().issue_token("host");
        let payload = auth().verify(&token).expect("token should verify");
        assert_eq!(payload.username, "host");
        assert_eq!(payload.event, EVENT_IDENTIFIER);
        assert!(payload.permissions.contains(&"card_generation".to_string()));
    }

    #[test]
    fn expired_tokens_are_rejected() {
        let now = Utc::now();
        let payload = TokenPayload {
            username: "host".to_string(),
            session_id: "s".to_string(),
            event: EVENT_IDENTIFIER.to_string(),
            issued_at: (now - Duration::hours(48)).to_rfc3339(),
            expires_at: (now - Duration::hours(24)).to_rfc3339(),
            permissions: Vec::new(),
        };
        let token = B64.encode(serde_json::to_string(&payload).unwrap());
        assert_eq!(auth().verify(&token), Err(AuthError::Expired));
    }

    #[test]
    fn wrong_event_is_rejected() {
        let now = Utc::now();
        let payload = TokenPayload {
            username: "host".to_string(),
            session_id: "s".to_string(),
            event: "some-other-event".to_string(),
            issued_at: now.to_rfc3339(),
            expires_at: (now + Duration::hours(1)).to_rfc3339(),
            permissions: Vec::new(),
        };
        let token = B64.encode(serde_json::to_string(&payload).unwrap());
        assert_eq!(auth().verify(&token), Err(AuthError::WrongEvent));
    }

    #[test]
    fn garbage_tokens_are_malformed() {
        assert_eq!(auth().verify("not base64!!"), Err(AuthError::Malformed));
        let token = B64.encode(b"{\"not\": \"a token\"}");
        assert_eq!(auth().verify(&token), Err(AuthError::Malformed));
    }

    #[test]
    fn unknown_usernames_are_rejected() {
        let token = Authenticator::new("other", "pw").issue_token("other");
        assert_eq!(auth().verify(&token), Err(AuthError::UnknownUser));
    }
}
