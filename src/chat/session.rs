// Long-lived session credentials

use crate::chat::clock::{duration_millis, now_millis};
use crate::chat::token;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Name of the cookie carrying the session token
pub const SESSION_COOKIE: &str = "mochat_session";

/// Default session lifetime (7 days)
pub const DEFAULT_SESSION_TTL: Duration = Duration::from_secs(60 * 60 * 24 * 7);

/// Signed body of a session token
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionPayload {
    /// Issue time, ms since the Unix epoch
    pub issued_at: u64,
    /// Last valid instant, ms since the Unix epoch (inclusive)
    pub expires_at: u64,
}

impl SessionPayload {
    /// Whether the session is still valid at `now`
    pub fn is_valid_at(&self, now: u64) -> bool {
        now <= self.expires_at
    }
}

/// Issues and validates session tokens
#[derive(Clone)]
pub struct SessionManager {
    secret: Vec<u8>,
    ttl: Duration,
}

impl SessionManager {
    pub fn new(secret: impl Into<Vec<u8>>, ttl: Duration) -> Self {
        Self {
            secret: secret.into(),
            ttl,
        }
    }

    /// Configured session lifetime
    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    /// Issue a token valid for the configured lifetime
    pub fn issue(&self) -> String {
        self.issue_at(now_millis(), self.ttl)
    }

    /// Issue a token valid for `ttl` starting at `now`
    pub fn issue_at(&self, now: u64, ttl: Duration) -> String {
        // expiresAt must stay strictly after issuedAt
        let ttl_ms = duration_millis(ttl).max(1);
        let payload = SessionPayload {
            issued_at: now,
            expires_at: now.saturating_add(ttl_ms),
        };
        self.sign(&payload)
    }

    /// Sign an explicit payload
    pub fn sign(&self, payload: &SessionPayload) -> String {
        // Serializing two integers cannot fail
        let body = serde_json::to_vec(payload).unwrap_or_default();
        token::sign(&body, &self.secret)
    }

    /// Decode a token if it verifies, regardless of expiry
    pub fn decode(&self, token: &str) -> Option<SessionPayload> {
        let body = token::verify(token, &self.secret).ok()?;
        serde_json::from_slice(&body).ok()
    }

    /// Validate a token against the current time
    pub fn validate(&self, token: &str) -> bool {
        self.validate_at(token, now_millis())
    }

    /// Validate a token at an explicit instant
    ///
    /// Absent, malformed, tampered and expired tokens are all just `false`.
    pub fn validate_at(&self, token: &str, now: u64) -> bool {
        match self.decode(token) {
            Some(payload) => payload.is_valid_at(now),
            None => {
                tracing::debug!("Rejected session token");
                false
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn manager() -> SessionManager {
        SessionManager::new("session-secret", DEFAULT_SESSION_TTL)
    }

    #[test]
    fn test_issue_and_validate() {
        let sessions = manager();
        let token = sessions.issue();
        assert!(sessions.validate(&token));

        let payload = sessions.decode(&token).unwrap();
        assert_eq!(
            payload.expires_at - payload.issued_at,
            DEFAULT_SESSION_TTL.as_millis() as u64
        );
    }

    #[test]
    fn test_expiry_boundary_inclusive() {
        let sessions = manager();
        let now = 1_700_000_000_000;
        let token = sessions.sign(&SessionPayload {
            issued_at: now - 1000,
            expires_at: now,
        });

        assert!(sessions.validate_at(&token, now));
        assert!(!sessions.validate_at(&token, now + 1));
    }

    #[test]
    fn test_zero_ttl_still_expires_after_issue() {
        let sessions = manager();
        let token = sessions.issue_at(1000, Duration::ZERO);
        let payload = sessions.decode(&token).unwrap();
        assert!(payload.expires_at > payload.issued_at);
    }

    #[test]
    fn test_payload_wire_format() {
        let payload = SessionPayload {
            issued_at: 1,
            expires_at: 2,
        };
        let json = serde_json::to_string(&payload).unwrap();
        assert_eq!(json, r#"{"issuedAt":1,"expiresAt":2}"#);
    }

    #[test]
    fn test_rejects_foreign_and_garbage_tokens() {
        let sessions = manager();
        let other = SessionManager::new("other-secret", DEFAULT_SESSION_TTL);

        assert!(!sessions.validate(&other.issue()));
        assert!(!sessions.validate(""));
        assert!(!sessions.validate("not-a-token"));
        // Correctly signed but not a session payload
        assert!(!sessions.validate(&token::sign(b"8", b"session-secret")));
    }
}
