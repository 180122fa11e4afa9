use crate::iam::IamToken;
use crate::metrics::RelayMetrics;
use crate::retry::{is_retryable_status, with_retry_if, RetryConfig};
use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Machine translation that never fails the caller.
///
/// Implementations return the original `text` when translation is impossible.
#[async_trait]
pub trait TextTranslator: Send + Sync {
    async fn translate(&self, text: &str, source: &str, target: &str) -> String;
}

/// Forced term substitutions sent with every translation request.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Glossary {
    // BTreeMap keeps request bodies stable between calls
    pairs: BTreeMap<String, String>,
}

impl Glossary {
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn from_pairs<I, K, V>(pairs: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        Self {
            pairs: pairs
                .into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
        }
    }

    /// Load a flat JSON object of `"term": "forced translation"` pairs.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read glossary file {}", path.display()))?;
        let pairs: BTreeMap<String, String> = serde_json::from_str(&content)
            .with_context(|| format!("Glossary {} is not a flat JSON object", path.display()))?;
        Ok(Self { pairs })
    }

    /// Like [`Glossary::load`], but a missing file yields an empty glossary.
    pub fn load_if_exists(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        if !path.exists() {
            debug!("No glossary at {}, glossary disabled", path.display());
            return Ok(Self::empty());
        }
        let glossary = Self::load(path)?;
        info!("Loaded {} glossary terms from {}", glossary.len(), path.display());
        Ok(glossary)
    }

    pub fn is_empty(&self) -> bool {
        self.pairs.is_empty()
    }

    pub fn len(&self) -> usize {
        self.pairs.len()
    }

    fn to_config(&self) -> Option<GlossaryConfig> {
        if self.is_empty() {
            return None;
        }
        Some(GlossaryConfig {
            glossary_data: GlossaryData {
                glossary_pairs: self
                    .pairs
                    .iter()
                    .map(|(source, translated)| GlossaryPair {
                        source_text: source.clone(),
                        translated_text: translated.clone(),
                    })
                    .collect(),
            },
        })
    }
}

// Yandex Translate v2 request/response types
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct TranslateRequest<'a> {
    source_language_code: &'a str,
    target_language_code: &'a str,
    texts: Vec<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    folder_id: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    glossary_config: Option<GlossaryConfig>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct GlossaryConfig {
    glossary_data: GlossaryData,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct GlossaryData {
    glossary_pairs: Vec<GlossaryPair>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct GlossaryPair {
    source_text: String,
    translated_text: String,
}

#[derive(Debug, Deserialize)]
struct TranslateResponse {
    translations: Vec<Translation>,
}

#[derive(Debug, Deserialize)]
struct Translation {
    text: String,
}

#[derive(Debug, thiserror::Error)]
enum TranslateError {
    #[error("translation API error ({0}): {1}")]
    Status(reqwest::StatusCode, String),
    #[error("translation request failed: {0}")]
    Transport(#[from] reqwest::Error),
    #[error("translation response contained no translations")]
    Empty,
}

impl TranslateError {
    fn is_retryable(&self) -> bool {
        match self {
            Self::Status(status, _) => is_retryable_status(*status),
            Self::Transport(_) => true,
            Self::Empty => false,
        }
    }
}

/// Yandex Cloud Translate client authenticated with the shared IAM token.
pub struct YandexTranslator {
    client: reqwest::Client,
    url: String,
    folder_id: Option<String>,
    token: IamToken,
    glossary: Glossary,
    retry: RetryConfig,
    metrics: Arc<RelayMetrics>,
}

impl YandexTranslator {
    pub fn new(
        client: reqwest::Client,
        url: impl Into<String>,
        token: IamToken,
        metrics: Arc<RelayMetrics>,
    ) -> Self {
        Self {
            client,
            url: url.into(),
            folder_id: None,
            token,
            glossary: Glossary::empty(),
            retry: RetryConfig::translation(),
            metrics,
        }
    }

    pub fn with_folder_id(mut self, folder_id: Option<String>) -> Self {
        self.folder_id = folder_id;
        self
    }

    pub fn with_glossary(mut self, glossary: Glossary) -> Self {
        self.glossary = glossary;
        self
    }

    pub fn with_retry(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }

    async fn request(&self, text: &str, source: &str, target: &str) -> Result<String, TranslateError> {
        let body = TranslateRequest {
            source_language_code: source,
            target_language_code: target,
            texts: vec![text],
            folder_id: self.folder_id.as_deref(),
            glossary_config: self.glossary.to_config(),
        };

        with_retry_if(
            &self.retry,
            &format!("Translation {}->{}", source, target),
            || async {
                let response = self
                    .client
                    .post(&self.url)
                    .bearer_auth(self.token.get())
                    .json(&body)
                    .send()
                    .await?;

                let status = response.status();
                if !status.is_success() {
                    let body = response.text().await.unwrap_or_default();
                    return Err(TranslateError::Status(status, body));
                }

                let parsed: TranslateResponse = response.json().await?;
                parsed
                    .translations
                    .into_iter()
                    .next()
                    .map(|t| t.text)
                    .ok_or(TranslateError::Empty)
            },
            TranslateError::is_retryable,
        )
        .await
    }
}

#[async_trait]
impl TextTranslator for YandexTranslator {
    async fn translate(&self, text: &str, source: &str, target: &str) -> String {
        if source == target || text.trim().is_empty() {
            return text.to_string();
        }

        self.metrics.record_translation_call();
        match self.request(text, source, target).await {
            Ok(translated) => translated,
            Err(e) => {
                self.metrics.record_translation_fallback();
                warn!(
                    source,
                    target,
                    error = %e,
                    "translation failed, forwarding original text"
                );
                text.to_string()
            }
        }
    }
}
