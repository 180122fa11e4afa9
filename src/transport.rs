//! Chat transport boundary: inbound events and outbound calls.

use crate::ChatId;
use anyhow::Result;
use async_trait::async_trait;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChatKind {
    /// One-to-one conversation with a user
    Direct,
    Group,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChatInfo {
    pub id: ChatId,
    pub kind: ChatKind,
    pub user_name: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChatEvent {
    /// Explicit conversation entry (`/start`)
    Start(ChatInfo),
    Text(ChatInfo, String),
}

impl ChatEvent {
    pub fn chat(&self) -> &ChatInfo {
        match self {
            Self::Start(chat) | Self::Text(chat, _) => chat,
        }
    }
}

#[async_trait]
pub trait ChatTransport: Send + Sync {
    async fn send_text(&self, chat_id: ChatId, text: &str) -> Result<()>;
    async fn send_typing(&self, chat_id: ChatId) -> Result<()>;
}
