use crate::retry::{with_retry, RetryConfig};
use crate::ChatId;
use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use tracing::debug;

/// Short-lived credential for one backend session.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionCredential {
    pub session_id: String,
    pub token: String,
    pub expiration_time: DateTime<Utc>,
    #[serde(rename = "type")]
    pub kind: String,
}

impl SessionCredential {
    /// True if the credential expires within `margin` of `now`.
    pub fn expires_within(&self, margin: chrono::Duration, now: DateTime<Utc>) -> bool {
        self.expiration_time - margin <= now
    }

    /// `Authorization` header value.
    pub fn authorization(&self) -> String {
        format!("{} {}", self.kind, self.token)
    }
}

/// Yields a credential on demand; called by the connection, not by the relay.
#[async_trait]
pub trait CredentialSupplier: Send + Sync {
    async fn credential(&self) -> Result<SessionCredential>;
}

/// Remote exchange of API credentials for a session credential.
#[async_trait]
pub trait CredentialExchange: Send + Sync {
    async fn exchange(&self, session_id: Option<&str>) -> Result<SessionCredential>;
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct GenerateTokenRequest<'a> {
    key: &'a str,
    scene: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    session_id: Option<&'a str>,
}

/// `sessions:generateToken` endpoint of the conversational backend.
pub struct TokenEndpoint {
    client: reqwest::Client,
    url: String,
    key: String,
    secret: String,
    scene: String,
    retry: RetryConfig,
}

impl TokenEndpoint {
    pub fn new(
        client: reqwest::Client,
        api_url: &str,
        key: impl Into<String>,
        secret: impl Into<String>,
        scene: impl Into<String>,
    ) -> Self {
        Self {
            client,
            url: format!("{}/v1/sessions:generateToken", api_url.trim_end_matches('/')),
            key: key.into(),
            secret: secret.into(),
            scene: scene.into(),
            retry: RetryConfig::token_exchange(),
        }
    }

    pub fn with_retry(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }
}

#[async_trait]
impl CredentialExchange for TokenEndpoint {
    async fn exchange(&self, session_id: Option<&str>) -> Result<SessionCredential> {
        let request = GenerateTokenRequest {
            key: &self.key,
            scene: &self.scene,
            session_id,
        };

        with_retry(&self.retry, "Session token exchange", || async {
            let response = self
                .client
                .post(&self.url)
                .basic_auth(&self.key, Some(&self.secret))
                .json(&request)
                .send()
                .await
                .context("Failed to send request to session token endpoint")?;

            if !response.status().is_success() {
                let status = response.status();
                let body = response.text().await.unwrap_or_default();
                anyhow::bail!("Session token API error ({}): {}", status, body);
            }

            response
                .json::<SessionCredential>()
                .await
                .context("Failed to parse session token response")
        })
        .await
    }
}

/// Session ids per chat. Outlives sessions, so a recreated session keeps its id.
#[derive(Debug, Clone, Default)]
pub struct SessionIdCache {
    ids: Arc<Mutex<HashMap<ChatId, String>>>,
}

impl SessionIdCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, chat_id: ChatId) -> Option<String> {
        self.ids
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&chat_id)
            .cloned()
    }

    /// Store `session_id` unless the chat already has one; returns the id in effect.
    pub fn get_or_insert(&self, chat_id: ChatId, session_id: String) -> String {
        self.ids
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(chat_id)
            .or_insert(session_id)
            .clone()
    }
}

/// Credential supplier bound to one chat.
pub struct ChatCredentials {
    chat_id: ChatId,
    exchange: Arc<dyn CredentialExchange>,
    cache: SessionIdCache,
}

impl ChatCredentials {
    pub fn new(chat_id: ChatId, exchange: Arc<dyn CredentialExchange>, cache: SessionIdCache) -> Self {
        Self {
            chat_id,
            exchange,
            cache,
        }
    }
}

#[async_trait]
impl CredentialSupplier for ChatCredentials {
    async fn credential(&self) -> Result<SessionCredential> {
        let cached = self.cache.get(self.chat_id);
        let mut credential = self.exchange.exchange(cached.as_deref()).await?;

        // The first id issued for a chat sticks for the chat's lifetime
        credential.session_id = self
            .cache
            .get_or_insert(self.chat_id, credential.session_id);
        debug!(
            "Issued credential for chat {} (session {}, expires {})",
            self.chat_id, credential.session_id, credential.expiration_time
        );

        Ok(credential)
    }
}
