//! Telegram Bot API transport.
//!
//! Updates arrive either by long polling (`getUpdates`) or on a webhook;
//! both paths turn them into [`ChatEvent`]s with [`update_to_event`].
//! Replies go out through [`TelegramClient`].
//! Docs: <https://core.telegram.org/bots/api>

mod polling;
mod webhook;

pub use polling::spawn_polling;
pub use webhook::{serve, webhook_router, WebhookState, SECRET_HEADER};

use crate::transport::{ChatEvent, ChatInfo, ChatKind, ChatTransport};
use crate::ChatId;
use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::sync::OnceLock;
use std::time::Duration;
use tracing::debug;

pub const DEFAULT_API_URL: &str = "https://api.telegram.org";

/// Seconds the Bot API holds a `getUpdates` request open.
pub const POLL_TIMEOUT_SECS: u64 = 30;

// Telegram update types
#[derive(Debug, Deserialize)]
pub struct Update {
    pub update_id: i64,
    pub message: Option<Message>,
}

#[derive(Debug, Deserialize)]
pub struct Message {
    pub message_id: i64,
    pub from: Option<User>,
    pub chat: Chat,
    pub text: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct User {
    pub id: i64,
    #[serde(default)]
    pub first_name: String,
    pub last_name: Option<String>,
    pub username: Option<String>,
}

impl User {
    /// First name, else last name, else username.
    pub fn display_name(&self) -> Option<String> {
        [
            Some(self.first_name.as_str()),
            self.last_name.as_deref(),
            self.username.as_deref(),
        ]
        .into_iter()
        .flatten()
        .map(str::trim)
        .find(|name| !name.is_empty())
        .map(str::to_string)
    }
}

#[derive(Debug, Deserialize)]
pub struct Chat {
    pub id: i64,
    pub r#type: String,
}

#[derive(Debug, Deserialize)]
struct ApiResponse<T> {
    ok: bool,
    result: Option<T>,
    description: Option<String>,
}

#[derive(Debug, Serialize)]
struct SendMessageRequest<'a> {
    chat_id: ChatId,
    text: &'a str,
}

#[derive(Debug, Serialize)]
struct ChatActionRequest<'a> {
    chat_id: ChatId,
    action: &'a str,
}

#[derive(Debug, Serialize)]
struct SetWebhookRequest<'a> {
    url: &'a str,
    secret_token: &'a str,
    allowed_updates: [&'a str; 1],
}

fn is_start_command(text: &str) -> bool {
    static START: OnceLock<Regex> = OnceLock::new();
    START
        .get_or_init(|| Regex::new(r"^/start(@\w+)?(\s|$)").expect("start command pattern"))
        .is_match(text.trim_start())
}

/// Convert an update into a chat event. Non-text updates yield `None`.
pub fn update_to_event(update: Update) -> Option<ChatEvent> {
    let message = update.message?;
    let text = message.text?;

    let chat = ChatInfo {
        id: message.chat.id,
        kind: if message.chat.r#type == "private" {
            ChatKind::Direct
        } else {
            ChatKind::Group
        },
        user_name: message.from.as_ref().and_then(User::display_name),
    };

    if is_start_command(&text) {
        Some(ChatEvent::Start(chat))
    } else {
        Some(ChatEvent::Text(chat, text))
    }
}

/// Bot API client bound to one bot token.
#[derive(Clone)]
pub struct TelegramClient {
    client: reqwest::Client,
    base_url: String,
}

impl TelegramClient {
    pub fn new(client: reqwest::Client, api_url: &str, bot_token: &str) -> Self {
        Self {
            client,
            base_url: format!("{}/bot{}", api_url.trim_end_matches('/'), bot_token),
        }
    }

    async fn call<B: Serialize + ?Sized>(&self, method: &str, body: &B) -> Result<()> {
        let response = self
            .client
            .post(format!("{}/{}", self.base_url, method))
            .json(body)
            .send()
            .await
            .with_context(|| format!("Failed to send {} request to Telegram API", method))?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            bail!("Telegram API error on {} ({}): {}", method, status, body);
        }

        Ok(())
    }

    /// Plain-text message, no parse mode.
    pub async fn send_message(&self, chat_id: ChatId, text: &str) -> Result<()> {
        self.call("sendMessage", &SendMessageRequest { chat_id, text })
            .await
    }

    pub async fn send_chat_action(&self, chat_id: ChatId, action: &str) -> Result<()> {
        self.call("sendChatAction", &ChatActionRequest { chat_id, action })
            .await
    }

    /// Register the webhook endpoint and the secret Telegram must echo back.
    pub async fn set_webhook(&self, url: &str, secret: &str) -> Result<()> {
        self.call(
            "setWebhook",
            &SetWebhookRequest {
                url,
                secret_token: secret,
                allowed_updates: ["message"],
            },
        )
        .await
        .context("Failed to register webhook")
    }

    /// Long-poll for updates after `offset`.
    pub async fn get_updates(&self, offset: Option<i64>) -> Result<Vec<Update>> {
        let mut url = format!("{}/getUpdates?timeout={}", self.base_url, POLL_TIMEOUT_SECS);
        if let Some(offset) = offset {
            url.push_str(&format!("&offset={}", offset));
        }

        let response: ApiResponse<Vec<Update>> = self
            .client
            .get(&url)
            .timeout(Duration::from_secs(POLL_TIMEOUT_SECS + 5))
            .send()
            .await
            .context("Failed to poll Telegram updates")?
            .json()
            .await
            .context("Failed to parse getUpdates response")?;

        if !response.ok {
            bail!(
                "Telegram getUpdates failed: {}",
                response.description.unwrap_or_default()
            );
        }

        let updates = response.result.unwrap_or_default();
        debug!("Received {} update(s)", updates.len());
        Ok(updates)
    }
}

#[async_trait]
impl ChatTransport for TelegramClient {
    async fn send_text(&self, chat_id: ChatId, text: &str) -> Result<()> {
        self.send_message(chat_id, text).await
    }

    async fn send_typing(&self, chat_id: ChatId) -> Result<()> {
        self.send_chat_action(chat_id, "typing").await
    }
}
