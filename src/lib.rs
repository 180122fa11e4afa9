//! Telegram chat relay for a conversational AI backend.
//!
//! Inbound chat messages are routed to one backend session per chat, with
//! machine translation between the user's language and the backend's.

pub mod backend;
pub mod config;
pub mod iam;
pub mod locale;
pub mod metrics;
pub mod registry;
pub mod retry;
pub mod router;
pub mod session;
pub mod telegram;
pub mod translator;
pub mod transport;

#[cfg(test)]
pub(crate) mod test_support;

/// Telegram chat id.
pub type ChatId = i64;
