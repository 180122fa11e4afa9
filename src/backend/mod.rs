//! Conversational AI backend contract.
//!
//! A connection is opened per chat. User text goes in through
//! [`Connection::send_text`]; streamed replies, control signals and the
//! terminal error come back on the connection's own event channel.

mod credentials;
mod http;

pub use credentials::{
    ChatCredentials, CredentialExchange, CredentialSupplier, SessionCredential, SessionIdCache,
    TokenEndpoint,
};
pub use http::HttpBackend;

use crate::ChatId;
use serde::Serialize;
use std::sync::Arc;
use tokio::sync::mpsc;

/// One unit of streamed backend output.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Packet {
    /// Incremental reply text
    Text(String),
    Control(ControlSignal),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ControlSignal {
    /// The current reply is complete
    InteractionEnd,
    Other(String),
}

#[derive(Debug, thiserror::Error)]
pub enum BackendError {
    #[error("credential exchange failed: {0}")]
    Credentials(String),
    #[error("backend request failed: {0}")]
    Transport(#[from] reqwest::Error),
    #[error("backend returned {status}: {body}")]
    Status { status: u16, body: String },
}

#[derive(Debug)]
pub enum ConnectionEvent {
    Packet(Packet),
    /// Terminal: the connection is no longer usable
    Error(BackendError),
}

/// Output channels the backend should produce. The relay only handles text.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Capabilities {
    pub audio: bool,
    pub emotions: bool,
}

impl Capabilities {
    pub fn text_only() -> Self {
        Self {
            audio: false,
            emotions: false,
        }
    }
}

pub struct OpenRequest {
    pub chat_id: ChatId,
    pub user_name: Option<String>,
    pub capabilities: Capabilities,
    pub credentials: Arc<dyn CredentialSupplier>,
}

pub struct OpenedConnection {
    pub connection: Arc<dyn Connection>,
    pub events: mpsc::UnboundedReceiver<ConnectionEvent>,
}

pub trait Backend: Send + Sync {
    /// Open a connection scoped to the backend's scene. Must not block.
    fn open(&self, request: OpenRequest) -> OpenedConnection;
}

pub trait Connection: Send + Sync {
    /// Queue text for the backend; replies arrive on the event channel.
    fn send_text(&self, text: String);
    fn is_active(&self) -> bool;
    fn close(&self);
}
