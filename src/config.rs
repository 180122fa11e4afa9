use crate::router::DEFAULT_GREETING;
use crate::telegram;
use anyhow::{bail, Context, Result};
use std::time::Duration;

/// How inbound Telegram updates reach the relay.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportMode {
    /// Long-poll `getUpdates`
    Polling,
    /// Receive updates on an HTTP endpoint
    Webhook,
}

impl TransportMode {
    fn parse(value: &str) -> Result<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "polling" => Ok(Self::Polling),
            "webhook" => Ok(Self::Webhook),
            other => bail!("Unknown TRANSPORT_MODE '{}'. Expected 'polling' or 'webhook'", other),
        }
    }
}

#[derive(Debug, Clone)]
pub struct Config {
    // Telegram
    pub telegram_bot_token: String,
    pub telegram_api_url: String,
    pub transport_mode: TransportMode,
    pub webhook_url: Option<String>,
    pub telegram_webhook_secret: Option<String>,
    pub port: u16,

    // Conversational backend
    pub inworld_key: String,
    pub inworld_secret: String,
    pub inworld_scene: String,
    pub inworld_api_url: String,

    // Languages
    pub backend_language: String,
    pub default_user_locale: String,

    // Yandex Cloud
    pub yandex_key_file: String,
    pub yandex_folder_id: Option<String>,
    pub yandex_iam_url: String,
    pub yandex_translate_url: String,
    pub glossary_file: String,
    pub iam_refresh_hours: u64,

    // Conversation behaviour
    pub typing_interval_ms: u64,
    pub greeting_text: String,
}

impl Config {
    pub fn from_env() -> Result<Self> {
        Self::from_source(|key| std::env::var(key).ok())
    }

    /// Build a config from any key lookup. `from_env` passes the process environment.
    pub fn from_source<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let required = |key: &str| -> Result<String> {
            lookup(key)
                .filter(|v| !v.trim().is_empty())
                .with_context(|| format!("{} is not defined", key))
        };
        let or_default = |key: &str, default: &str| -> String {
            lookup(key)
                .filter(|v| !v.trim().is_empty())
                .unwrap_or_else(|| default.to_string())
        };
        let optional = |key: &str| -> Option<String> { lookup(key).filter(|v| !v.trim().is_empty()) };

        let transport_mode = TransportMode::parse(&or_default("TRANSPORT_MODE", "polling"))?;
        let telegram_webhook_secret = optional("TELEGRAM_WEBHOOK_SECRET");
        if transport_mode == TransportMode::Webhook && telegram_webhook_secret.is_none() {
            bail!("TELEGRAM_WEBHOOK_SECRET must be set when TRANSPORT_MODE=webhook");
        }

        Ok(Self {
            // Telegram
            telegram_bot_token: required("TG_BOT_TOKEN")?,
            telegram_api_url: or_default("TELEGRAM_API_URL", telegram::DEFAULT_API_URL),
            transport_mode,
            webhook_url: optional("WEBHOOK_URL"),
            telegram_webhook_secret,
            port: lookup("PORT")
                .and_then(|v| v.parse().ok())
                .unwrap_or(8080),

            // Conversational backend
            inworld_key: required("INWORLD_KEY")?,
            inworld_secret: required("INWORLD_SECRET")?,
            inworld_scene: required("INWORLD_SCENE")?,
            inworld_api_url: or_default("INWORLD_API_URL", "https://api.inworld.ai"),

            // Languages
            backend_language: or_default("BACKEND_LANGUAGE", "en"),
            default_user_locale: or_default("DEFAULT_USER_LOCALE", "ru"),

            // Yandex Cloud
            yandex_key_file: or_default("YANDEX_KEY_FILE", "authorized_key.json"),
            yandex_folder_id: optional("YANDEX_FOLDER_ID"),
            yandex_iam_url: or_default(
                "YANDEX_IAM_URL",
                "https://iam.api.cloud.yandex.net/iam/v1/tokens",
            ),
            yandex_translate_url: or_default(
                "YANDEX_TRANSLATE_URL",
                "https://translate.api.cloud.yandex.net/translate/v2/translate",
            ),
            glossary_file: or_default("GLOSSARY_FILE", "glossary.json"),
            iam_refresh_hours: lookup("IAM_REFRESH_HOURS")
                .and_then(|v| v.parse().ok())
                .filter(|h| *h > 0)
                .unwrap_or(6),

            // Conversation behaviour
            typing_interval_ms: lookup("TYPING_INTERVAL_MS")
                .and_then(|v| v.parse().ok())
                .unwrap_or(1000),
            greeting_text: or_default("GREETING_TEXT", DEFAULT_GREETING),
        })
    }

    pub fn iam_refresh_interval(&self) -> Duration {
        Duration::from_secs(self.iam_refresh_hours * 60 * 60)
    }

    pub fn typing_interval(&self) -> Duration {
        Duration::from_millis(self.typing_interval_ms)
    }
}
