//! mochat - private two-party chat behind a challenge and a shared secret code
//!
//! This library provides the signed-token credentials, the verification rate
//! limiter, the in-process event hub with delivery acknowledgments, and the
//! push stream sessions served by the `mochat` binary.

pub mod chat;

pub use chat::{ChatConfig, ChatError, ChatState, EventHub, SessionManager};
