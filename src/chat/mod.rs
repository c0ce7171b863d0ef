// Two-party chat relay
//
// Access is gated by an arithmetic challenge and a shared secret code, after
// which a signed session cookie authorizes the message API and the push
// stream. Events fan out in-process; consumers that lose the stream poll.

pub mod challenge;
pub mod cli;
pub mod client;
pub mod clock;
pub mod commands;
pub mod config;
pub mod delivery;
pub mod error;
pub mod events;
pub mod gate;
pub mod message;
pub mod rate_limit;
pub mod server;
pub mod session;
pub mod storage;
pub mod stream;
pub mod token;
pub mod upload;

pub use challenge::{Challenge, ChallengeManager};
pub use cli::{MochatCli, MochatCommand};
pub use client::{FeedMode, SseEvent, SseParser, Timeline};
pub use commands::execute_command;
pub use config::ChatConfig;
pub use delivery::{AckOutcome, DeliveryTracker};
pub use error::{ChatError, ChatResult, ConfigError, TokenError};
pub use events::{EventHub, HubEvent, Subscription, Topic};
pub use gate::{AccessGate, SecretCode, VerifyRequest};
pub use message::{Message, MessageKind, MessageStatus, NewMessage, StatusUpdate};
pub use rate_limit::{RateDecision, RateLimitPolicy, RateLimiter};
pub use server::{handle, ChatState};
pub use session::{SessionManager, SessionPayload};
pub use storage::{MessageStore, SqliteMessageStore};
pub use stream::{CloseReason, StreamSession, StreamState};
pub use upload::{StoredFile, UploadStore};
