// Error types shared by the chat components

use thiserror::Error;

/// Failure to verify a signed token
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum TokenError {
    /// Separator missing, an empty segment, or an undecodable payload
    #[error("malformed token")]
    Malformed,
    /// Signature does not match the payload under the given secret
    #[error("invalid token signature")]
    InvalidSignature,
}

/// Configuration rejected at startup
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("{0} must be greater than zero")]
    Zero(&'static str),
    #[error("invalid listen address '{0}'")]
    ListenAddr(String),
}

/// Errors surfaced by request handling
///
/// Every variant maps to a coarse client-facing response; details of
/// `Storage`, `Io` and `Json` are only logged.
#[derive(Debug, Error)]
pub enum ChatError {
    /// Missing, malformed, tampered or expired session
    #[error("unauthorized")]
    Unauthorized,

    #[error("too many attempts")]
    RateLimited,

    /// Wrong answer or bad challenge token, indistinguishably
    #[error("challenge incorrect")]
    ChallengeIncorrect,

    /// Wrong secret code; the client is sent elsewhere
    #[error("secret code incorrect")]
    SecretCodeIncorrect { redirect: String },

    #[error("invalid payload: {0}")]
    InvalidPayload(String),

    #[error("no file provided")]
    NoFile,

    #[error("file too large")]
    FileTooLarge,

    #[error("unsupported file type: {0}")]
    UnsupportedFileType(String),

    #[error("not found")]
    NotFound,

    #[error("storage error: {0}")]
    Storage(#[from] rusqlite::Error),

    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
}

pub type ChatResult<T> = std::result::Result<T, ChatError>;
