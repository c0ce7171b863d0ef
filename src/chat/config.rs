// Runtime configuration for the chat server

use crate::chat::challenge::CHALLENGE_TTL;
use crate::chat::error::ConfigError;
use crate::chat::events::DEFAULT_SUBSCRIBER_CAPACITY;
use crate::chat::rate_limit::RateLimitPolicy;
use crate::chat::session::DEFAULT_SESSION_TTL;
use crate::chat::stream::HEARTBEAT_INTERVAL;
use crate::chat::upload::DEFAULT_MAX_UPLOAD_BYTES;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

/// Placeholder session secret; a warning is logged when it is in use
pub const DEFAULT_SESSION_SECRET: &str = "session-secret-change-me";

/// Placeholder challenge secret; a warning is logged when it is in use
pub const DEFAULT_CHALLENGE_SECRET: &str = "captcha-secret-change-me";

pub const DEFAULT_WRONG_CODE_REDIRECT: &str = "https://example.com";
pub const DEFAULT_LISTEN_ADDR: &str = "127.0.0.1:3000";

/// Everything the server needs to start
#[derive(Debug, Clone)]
pub struct ChatConfig {
    pub session_ttl: Duration,
    pub challenge_ttl: Duration,
    pub rate_limit: RateLimitPolicy,
    pub max_upload_bytes: u64,
    pub secret_code_salt: String,
    pub secret_code_hash: String,
    pub session_secret: String,
    pub challenge_secret: String,
    pub wrong_code_redirect: String,
    pub database_path: PathBuf,
    pub uploads_dir: PathBuf,
    pub listen: String,
    pub heartbeat: Duration,
    pub subscriber_capacity: usize,
}

impl Default for ChatConfig {
    fn default() -> Self {
        Self {
            session_ttl: DEFAULT_SESSION_TTL,
            challenge_ttl: CHALLENGE_TTL,
            rate_limit: RateLimitPolicy::default(),
            max_upload_bytes: DEFAULT_MAX_UPLOAD_BYTES,
            secret_code_salt: String::new(),
            secret_code_hash: String::new(),
            session_secret: DEFAULT_SESSION_SECRET.to_string(),
            challenge_secret: DEFAULT_CHALLENGE_SECRET.to_string(),
            wrong_code_redirect: DEFAULT_WRONG_CODE_REDIRECT.to_string(),
            database_path: PathBuf::from("mochat.db"),
            uploads_dir: PathBuf::from("uploads"),
            listen: DEFAULT_LISTEN_ADDR.to_string(),
            heartbeat: HEARTBEAT_INTERVAL,
            subscriber_capacity: DEFAULT_SUBSCRIBER_CAPACITY,
        }
    }
}

impl ChatConfig {
    /// Reject values the server cannot run with
    pub fn validate(&self) -> Result<(), ConfigError> {
        let zero_checks = [
            ("session ttl", self.session_ttl.is_zero()),
            ("challenge ttl", self.challenge_ttl.is_zero()),
            ("rate limit", self.rate_limit.limit == 0),
            ("rate limit window", self.rate_limit.window.is_zero()),
            ("max upload size", self.max_upload_bytes == 0),
            ("heartbeat interval", self.heartbeat.is_zero()),
            ("subscriber capacity", self.subscriber_capacity == 0),
        ];
        if let Some((name, _)) = zero_checks.iter().find(|(_, zero)| *zero) {
            return Err(ConfigError::Zero(name));
        }

        self.listen_addr()?;
        Ok(())
    }

    /// Parsed listen address
    pub fn listen_addr(&self) -> Result<SocketAddr, ConfigError> {
        self.listen
            .parse()
            .map_err(|_| ConfigError::ListenAddr(self.listen.clone()))
    }

    /// Log warnings for insecure defaults
    pub fn warn_insecure_defaults(&self) {
        if self.session_secret == DEFAULT_SESSION_SECRET {
            tracing::warn!("SESSION_SECRET is not set, using the built-in placeholder");
        }
        if self.challenge_secret == DEFAULT_CHALLENGE_SECRET {
            tracing::warn!("CAPTCHA_SECRET is not set, using the built-in placeholder");
        }
        if self.secret_code_hash.trim().is_empty() {
            tracing::warn!("SECRET_CODE_HASH is not set, every verification will be rejected");
        }
    }
}
