// Verification step: rate limit, challenge, secret code, then a session
//
// Failures are deliberately coarse. A wrong challenge never says whether the
// token or the answer was at fault, and a wrong secret code only yields a
// redirect destination.

use crate::chat::challenge::ChallengeManager;
use crate::chat::error::{ChatError, ChatResult};
use crate::chat::rate_limit::{RateLimitPolicy, RateLimiter};
use crate::chat::session::SessionManager;
use serde::Deserialize;
use std::sync::Arc;
use subtle::ConstantTimeEq;

/// Client identity used when no forwarded address is present
pub const UNKNOWN_CLIENT: &str = "unknown";

/// scrypt cost parameters (N = 2^14, r = 8, p = 1, 64-byte output)
const SCRYPT_LOG_N: u8 = 14;
const SCRYPT_R: u32 = 8;
const SCRYPT_P: u32 = 1;
const SCRYPT_LEN: usize = 64;

/// Hex-encoded scrypt hash of a secret code
pub fn hash_secret(code: &str, salt: &str) -> Option<String> {
    let params = scrypt::Params::new(SCRYPT_LOG_N, SCRYPT_R, SCRYPT_P, SCRYPT_LEN).ok()?;
    let mut output = [0u8; SCRYPT_LEN];
    scrypt::scrypt(code.as_bytes(), salt.as_bytes(), &params, &mut output).ok()?;
    Some(hex::encode(output))
}

/// The shared secret code, stored only as salt and hash
#[derive(Clone)]
pub struct SecretCode {
    salt: String,
    hash: String,
}

impl SecretCode {
    pub fn new(salt: impl Into<String>, hash: impl Into<String>) -> Self {
        Self {
            salt: salt.into(),
            hash: hash.into().trim().to_ascii_lowercase(),
        }
    }

    /// Whether a code has been configured at all
    pub fn is_configured(&self) -> bool {
        !self.hash.is_empty()
    }

    /// Constant-time check of a candidate code
    pub fn matches(&self, candidate: &str) -> bool {
        if !self.is_configured() {
            return false;
        }
        let Some(candidate_hash) = hash_secret(candidate, &self.salt) else {
            return false;
        };
        candidate_hash.len() == self.hash.len()
            && bool::from(candidate_hash.as_bytes().ct_eq(self.hash.as_bytes()))
    }
}

/// Body of a verification request
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VerifyRequest {
    #[serde(default, alias = "captcha")]
    pub captcha_answer: String,
    #[serde(default, alias = "code")]
    pub secret_code: String,
}

/// Client identity from an `X-Forwarded-For` value
pub fn client_key(forwarded_for: Option<&str>) -> String {
    forwarded_for
        .and_then(|value| value.split(',').next())
        .map(str::trim)
        .filter(|ip| !ip.is_empty())
        .unwrap_or(UNKNOWN_CLIENT)
        .to_string()
}

/// Guards session issuance
pub struct AccessGate {
    limiter: Arc<RateLimiter>,
    policy: RateLimitPolicy,
    challenges: ChallengeManager,
    sessions: SessionManager,
    secret: SecretCode,
    wrong_code_redirect: String,
}

impl AccessGate {
    pub fn new(
        limiter: Arc<RateLimiter>,
        policy: RateLimitPolicy,
        challenges: ChallengeManager,
        sessions: SessionManager,
        secret: SecretCode,
        wrong_code_redirect: impl Into<String>,
    ) -> Self {
        Self {
            limiter,
            policy,
            challenges,
            sessions,
            secret,
            wrong_code_redirect: wrong_code_redirect.into(),
        }
    }

    /// Check a verification attempt and issue a session token on success
    pub fn verify(
        &self,
        client: &str,
        request: &VerifyRequest,
        challenge_token: Option<&str>,
    ) -> ChatResult<String> {
        let decision = self.limiter.check(client, self.policy);
        if !decision.allowed {
            tracing::warn!("Verification rate limit hit for {}", client);
            return Err(ChatError::RateLimited);
        }

        if !self.challenges.verify(&request.captcha_answer, challenge_token) {
            tracing::info!("Challenge failed for {}", client);
            return Err(ChatError::ChallengeIncorrect);
        }

        if !self.secret.matches(request.secret_code.trim()) {
            tracing::info!("Secret code rejected for {}", client);
            return Err(ChatError::SecretCodeIncorrect {
                redirect: self.wrong_code_redirect.clone(),
            });
        }

        tracing::info!("Session issued for {}", client);
        Ok(self.sessions.issue())
    }
}
