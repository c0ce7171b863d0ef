// CLI commands for the chat server

use crate::chat::config::{
    ChatConfig, DEFAULT_CHALLENGE_SECRET, DEFAULT_LISTEN_ADDR, DEFAULT_SESSION_SECRET,
    DEFAULT_WRONG_CODE_REDIRECT,
};
use crate::chat::error::ConfigError;
use crate::chat::rate_limit::RateLimitPolicy;
use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;
use std::time::Duration;

/// mochat CLI
#[derive(Debug, Parser)]
#[command(name = "mochat", version)]
#[command(about = "Private two-party chat gated by a challenge and a shared secret code")]
pub struct MochatCli {
    #[command(subcommand)]
    pub command: MochatCommand,
}

/// mochat subcommands
#[derive(Debug, Subcommand)]
pub enum MochatCommand {
    /// Run the HTTP server
    Serve(ServeArgs),

    /// Print the hash to configure as SECRET_CODE_HASH
    HashCode {
        /// The secret code participants will enter
        #[arg(short, long)]
        code: String,

        /// Salt, the same value as SECRET_CODE_SALT
        #[arg(short, long, env = "SECRET_CODE_SALT")]
        salt: String,
    },
}

/// Server options; every flag falls back to an environment variable
#[derive(Debug, Clone, Args)]
pub struct ServeArgs {
    /// Address to listen on
    #[arg(long, env = "LISTEN_ADDR", default_value = DEFAULT_LISTEN_ADDR)]
    pub listen: String,

    /// SQLite database holding the conversation
    #[arg(long, env = "DATABASE_PATH", default_value = "mochat.db")]
    pub database: PathBuf,

    /// Directory for uploaded files
    #[arg(long, env = "UPLOADS_DIR", default_value = "uploads")]
    pub uploads_dir: PathBuf,

    /// Key for signing session tokens
    #[arg(long, env = "SESSION_SECRET", default_value = DEFAULT_SESSION_SECRET, hide_env_values = true, hide_default_value = true)]
    pub session_secret: String,

    /// Key for signing challenge tokens
    #[arg(long, env = "CAPTCHA_SECRET", default_value = DEFAULT_CHALLENGE_SECRET, hide_env_values = true, hide_default_value = true)]
    pub captcha_secret: String,

    /// Salt the secret code hash was computed with
    #[arg(long, env = "SECRET_CODE_SALT", default_value = "", hide_env_values = true)]
    pub secret_code_salt: String,

    /// Hex scrypt hash of the secret code (see `hash-code`)
    #[arg(long, env = "SECRET_CODE_HASH", default_value = "", hide_env_values = true)]
    pub secret_code_hash: String,

    /// Where clients entering a wrong secret code are sent
    #[arg(long, env = "WRONG_CODE_REDIRECT", default_value = DEFAULT_WRONG_CODE_REDIRECT)]
    pub wrong_code_redirect: String,

    /// Upload size limit in MiB
    #[arg(long, env = "MAX_FILE_SIZE_MB", default_value = "20")]
    pub max_file_size_mb: u64,

    /// Verification attempts allowed per window
    #[arg(long, env = "RATE_LIMIT", default_value = "6")]
    pub rate_limit: u32,

    /// Rate limit window in milliseconds
    #[arg(long, env = "RATE_WINDOW_MS", default_value = "60000")]
    pub rate_window_ms: u64,

    /// Session lifetime in seconds
    #[arg(long, env = "SESSION_TTL_SECS", default_value = "604800")]
    pub session_ttl_secs: u64,

    /// Challenge lifetime in seconds
    #[arg(long, env = "CHALLENGE_TTL_SECS", default_value = "300")]
    pub challenge_ttl_secs: u64,

    /// Interval between stream heartbeats in milliseconds
    #[arg(long, default_value = "15000")]
    pub heartbeat_ms: u64,

    /// Queued events per stream before new ones are dropped
    #[arg(long, default_value = "256")]
    pub subscriber_capacity: usize,
}

impl ServeArgs {
    /// Build and validate the server configuration
    pub fn into_config(self) -> Result<ChatConfig, ConfigError> {
        let config = ChatConfig {
            session_ttl: Duration::from_secs(self.session_ttl_secs),
            challenge_ttl: Duration::from_secs(self.challenge_ttl_secs),
            rate_limit: RateLimitPolicy {
                limit: self.rate_limit,
                window: Duration::from_millis(self.rate_window_ms),
            },
            max_upload_bytes: self.max_file_size_mb.saturating_mul(1024 * 1024),
            secret_code_salt: self.secret_code_salt,
            secret_code_hash: self.secret_code_hash,
            session_secret: self.session_secret,
            challenge_secret: self.captcha_secret,
            wrong_code_redirect: self.wrong_code_redirect,
            database_path: self.database,
            uploads_dir: self.uploads_dir,
            listen: self.listen,
            heartbeat: Duration::from_millis(self.heartbeat_ms),
            subscriber_capacity: self.subscriber_capacity,
        };
        config.validate()?;
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn serve_args(extra: &[&str]) -> ServeArgs {
        let mut args = vec!["mochat", "serve"];
        args.extend_from_slice(extra);
        match MochatCli::try_parse_from(args).unwrap().command {
            MochatCommand::Serve(args) => args,
            other => panic!("unexpected command {other:?}"),
        }
    }

    #[test]
    fn test_cli_parsing() {
        let args = serve_args(&[
            "--listen",
            "0.0.0.0:8080",
            "--max-file-size-mb",
            "5",
            "--rate-limit",
            "3",
        ]);
        let config = args.into_config().unwrap();
        assert_eq!(config.listen, "0.0.0.0:8080");
        assert_eq!(config.max_upload_bytes, 5 * 1024 * 1024);
        assert_eq!(config.rate_limit.limit, 3);

        let cli = MochatCli::try_parse_from(["mochat", "hash-code", "--code", "c", "--salt", "s"]);
        assert!(cli.is_ok());
    }

    #[test]
    fn test_invalid_values_rejected() {
        let args = serve_args(&["--rate-window-ms", "0"]);
        assert!(matches!(
            args.into_config(),
            Err(ConfigError::Zero("rate limit window"))
        ));

        assert!(MochatCli::try_parse_from(["mochat", "serve", "--rate-limit", "-1"]).is_err());
    }
}
