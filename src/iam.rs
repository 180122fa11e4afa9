//! Yandex Cloud IAM token provider.
//!
//! A service account key signs a short-lived JWT assertion which is exchanged
//! for a bearer token. The token lives in a shared [`IamToken`] cell that
//! translation calls read at call time. A repeating job re-signs and
//! re-exchanges well inside the token's lifetime.

use crate::metrics::RelayMetrics;
use crate::retry::{with_retry, RetryConfig};
use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use jsonwebtoken::{Algorithm, EncodingKey, Header};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{error, info};

/// Validity window of a signed assertion.
pub const ASSERTION_TTL_SECS: i64 = 3600;

/// Process-wide bearer token. Clones share the same cell; the last refresh wins.
#[derive(Debug, Clone, Default)]
pub struct IamToken(Arc<RwLock<String>>);

impl IamToken {
    pub fn new(token: impl Into<String>) -> Self {
        Self(Arc::new(RwLock::new(token.into())))
    }

    pub fn get(&self) -> String {
        self.0.read().unwrap_or_else(PoisonError::into_inner).clone()
    }

    pub fn set(&self, token: String) {
        *self.0.write().unwrap_or_else(PoisonError::into_inner) = token;
    }

    pub fn is_empty(&self) -> bool {
        self.0.read().unwrap_or_else(PoisonError::into_inner).is_empty()
    }
}

/// Authorized key file as downloaded from the Yandex Cloud console.
#[derive(Debug, Clone, Deserialize)]
pub struct ServiceAccountKey {
    pub id: String,
    pub service_account_id: String,
    pub private_key: String,
}

impl ServiceAccountKey {
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read service account key {}", path.display()))?;
        serde_json::from_str(&content)
            .with_context(|| format!("Invalid service account key file {}", path.display()))
    }

    /// The private key PEM without the banner line Yandex prepends to it.
    fn pem(&self) -> &str {
        match self.private_key.find("-----BEGIN") {
            Some(start) => &self.private_key[start..],
            None => &self.private_key,
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct AssertionClaims {
    aud: String,
    iss: String,
    iat: i64,
    exp: i64,
}

/// Sign a PS256 assertion for `audience`, valid for [`ASSERTION_TTL_SECS`] from `now`.
pub fn sign_assertion(key: &ServiceAccountKey, audience: &str, now: DateTime<Utc>) -> Result<String> {
    let mut header = Header::new(Algorithm::PS256);
    header.kid = Some(key.id.clone());

    let issued_at = now.timestamp();
    let claims = AssertionClaims {
        aud: audience.to_string(),
        iss: key.service_account_id.clone(),
        iat: issued_at,
        exp: issued_at + ASSERTION_TTL_SECS,
    };

    let encoding_key = EncodingKey::from_rsa_pem(key.pem().as_bytes())
        .context("Service account private key is not a valid RSA PEM")?;

    jsonwebtoken::encode(&header, &claims, &encoding_key).context("Failed to sign IAM assertion")
}

#[derive(Debug, Serialize)]
struct IamTokenRequest<'a> {
    jwt: &'a str,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct IamTokenResponse {
    iam_token: String,
    expires_at: Option<DateTime<Utc>>,
}

pub struct IamTokenProvider {
    client: reqwest::Client,
    key: ServiceAccountKey,
    url: String,
    token: IamToken,
    retry: RetryConfig,
    metrics: Arc<RelayMetrics>,
}

impl IamTokenProvider {
    pub fn new(
        client: reqwest::Client,
        key: ServiceAccountKey,
        url: impl Into<String>,
        metrics: Arc<RelayMetrics>,
    ) -> Self {
        Self {
            client,
            key,
            url: url.into(),
            token: IamToken::default(),
            retry: RetryConfig::token_exchange(),
            metrics,
        }
    }

    pub fn with_retry(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }

    /// Handle to the shared token cell.
    pub fn token(&self) -> IamToken {
        self.token.clone()
    }

    /// First exchange. Startup must abort if this fails.
    pub async fn init(&self) -> Result<()> {
        self.exchange()
            .await
            .context("Initial IAM token exchange failed")
    }

    /// Scheduled exchange. Failures are logged and the previous token stays in place.
    pub async fn refresh(&self) {
        if let Err(e) = self.exchange().await {
            self.metrics.record_iam_refresh_failure();
            error!(error = %format!("{:#}", e), "IAM token refresh failed, keeping previous token");
        }
    }

    async fn exchange(&self) -> Result<()> {
        // Each assertion expires, so sign a fresh one per exchange
        let jwt = sign_assertion(&self.key, &self.url, Utc::now())?;
        let request = IamTokenRequest { jwt: &jwt };

        let response: IamTokenResponse = with_retry(&self.retry, "IAM token exchange", || async {
            let response = self
                .client
                .post(&self.url)
                .json(&request)
                .send()
                .await
                .context("Failed to send request to IAM endpoint")?;

            if !response.status().is_success() {
                let status = response.status();
                let body = response.text().await.unwrap_or_default();
                anyhow::bail!("IAM API error ({}): {}", status, body);
            }

            response
                .json::<IamTokenResponse>()
                .await
                .context("Failed to parse IAM token response")
        })
        .await?;

        self.token.set(response.iam_token);
        match response.expires_at {
            Some(expires_at) => info!("IAM token updated (expires at {})", expires_at),
            None => info!("IAM token updated"),
        }

        Ok(())
    }

    /// Start a repeating refresh job every `interval`.
    pub async fn start_refresh_schedule(self: Arc<Self>, interval: Duration) -> Result<JobScheduler> {
        let scheduler = JobScheduler::new().await?;

        let job = Job::new_repeated_async(interval, move |_uuid, _lock| {
            let provider = Arc::clone(&self);
            Box::pin(async move {
                info!("⏰ Scheduled IAM token refresh");
                provider.refresh().await;
            })
        })?;

        scheduler.add(job).await?;
        scheduler.start().await?;
        info!("✓ IAM refresh scheduled every {:?}", interval);

        Ok(scheduler)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use jsonwebtoken::{DecodingKey, Validation};
    use wiremock::{
        matchers::{method, path},
        Mock, MockServer, ResponseTemplate,
    };

    const TEST_PRIVATE_KEY: &str = include_str!("../tests/fixtures/test_rsa_key.pem");
    const TEST_PUBLIC_KEY: &str = include_str!("../tests/fixtures/test_rsa_pub.pem");

    fn test_key() -> ServiceAccountKey {
        ServiceAccountKey {
            id: "ajekey123".to_string(),
            service_account_id: "ajesa456".to_string(),
            private_key: format!(
                "PLEASE DO NOT REMOVE THIS LINE! Yandex.Cloud SA Key ID <ajekey123>\n{}",
                TEST_PRIVATE_KEY
            ),
        }
    }

    fn provider_for(server: &MockServer) -> IamTokenProvider {
        IamTokenProvider::new(
            reqwest::Client::new(),
            test_key(),
            format!("{}/iam/v1/tokens", server.uri()),
            Arc::new(RelayMetrics::new()),
        )
        .with_retry(RetryConfig::no_retry())
    }

    // ==================== Token Cell Tests ====================

    #[test]
    fn test_iam_token_shared_between_clones() {
        let token = IamToken::default();
        assert!(token.is_empty());

        let clone = token.clone();
        clone.set("t1".to_string());
        assert_eq!(token.get(), "t1");
    }

    // ==================== Key File Tests ====================

    #[test]
    fn test_load_key_file() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("authorized_key.json");
        let key = test_key();
        let json = serde_json::json!({
            "id": key.id,
            "service_account_id": key.service_account_id,
            "created_at": "2023-01-01T00:00:00Z",
            "key_algorithm": "RSA_2048",
            "public_key": "-----BEGIN PUBLIC KEY-----\n...",
            "private_key": key.private_key,
        });
        std::fs::write(&path, json.to_string()).expect("write");

        let loaded = ServiceAccountKey::load(&path).expect("Should load");
        assert_eq!(loaded.id, "ajekey123");
        assert_eq!(loaded.service_account_id, "ajesa456");
        assert!(loaded.pem().starts_with("-----BEGIN"));
    }

    #[test]
    fn test_load_missing_key_file_fails() {
        let err = ServiceAccountKey::load("/nonexistent/authorized_key.json").unwrap_err();
        assert!(err.to_string().contains("authorized_key.json"));
    }

    #[test]
    fn test_pem_without_banner_is_unchanged() {
        let key = ServiceAccountKey {
            private_key: TEST_PRIVATE_KEY.to_string(),
            ..test_key()
        };
        assert_eq!(key.pem(), TEST_PRIVATE_KEY);
    }

    // ==================== Assertion Tests ====================

    #[test]
    fn test_sign_assertion_verifies_with_public_key() {
        let audience = "https://iam.api.cloud.yandex.net/iam/v1/tokens";
        let now = Utc::now();
        let jwt = sign_assertion(&test_key(), audience, now).expect("Should sign");

        let header = jsonwebtoken::decode_header(&jwt).expect("Should decode header");
        assert_eq!(header.alg, Algorithm::PS256);
        assert_eq!(header.kid.as_deref(), Some("ajekey123"));

        let mut validation = Validation::new(Algorithm::PS256);
        validation.set_audience(&[audience]);
        let decoded = jsonwebtoken::decode::<AssertionClaims>(
            &jwt,
            &DecodingKey::from_rsa_pem(TEST_PUBLIC_KEY.as_bytes()).expect("public key"),
            &validation,
        )
        .expect("Should verify");

        assert_eq!(decoded.claims.iss, "ajesa456");
        assert_eq!(decoded.claims.iat, now.timestamp());
        assert_eq!(decoded.claims.exp - decoded.claims.iat, ASSERTION_TTL_SECS);
    }

    #[test]
    fn test_sign_assertion_rejects_garbage_key() {
        let key = ServiceAccountKey {
            private_key: "not a key".to_string(),
            ..test_key()
        };
        assert!(sign_assertion(&key, "aud", Utc::now()).is_err());
    }

    // ==================== Exchange Tests ====================

    #[tokio::test]
    async fn test_init_stores_token() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/iam/v1/tokens"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "iamToken": "t1.9euelZq",
                "expiresAt": "2030-01-01T12:00:00.123456Z"
            })))
            .expect(1)
            .mount(&server)
            .await;

        let provider = provider_for(&server);
        provider.init().await.expect("Should exchange");
        assert_eq!(provider.token().get(), "t1.9euelZq");

        let requests = server.received_requests().await.expect("recording enabled");
        let body: serde_json::Value = serde_json::from_slice(&requests[0].body).expect("json body");
        let jwt = body["jwt"].as_str().expect("jwt field");
        assert_eq!(jwt.split('.').count(), 3);
    }

    #[tokio::test]
    async fn test_init_failure_is_fatal() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(401).set_body_string("bad assertion"))
            .mount(&server)
            .await;

        let provider = provider_for(&server);
        let err = provider.init().await.unwrap_err();
        assert!(format!("{:#}", err).contains("401"));
        assert!(provider.token().is_empty());
    }

    #[tokio::test]
    async fn test_refresh_failure_keeps_previous_token() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "iamToken": "first"
            })))
            .up_to_n_times(1)
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(503))
            .mount(&server)
            .await;

        let metrics = Arc::new(RelayMetrics::new());
        let provider = IamTokenProvider::new(
            reqwest::Client::new(),
            test_key(),
            server.uri(),
            metrics.clone(),
        )
        .with_retry(RetryConfig::no_retry());

        provider.init().await.expect("first exchange");
        provider.refresh().await;

        assert_eq!(provider.token().get(), "first");
        assert_eq!(metrics.report().iam_refresh_failures, 1);
    }

    #[tokio::test]
    async fn test_refresh_signs_fresh_assertion_each_time() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "iamToken": "rotated"
            })))
            .expect(2)
            .mount(&server)
            .await;

        let provider = provider_for(&server);
        provider.init().await.expect("first exchange");
        provider.refresh().await;

        let requests = server.received_requests().await.expect("recording enabled");
        assert_eq!(requests.len(), 2);
        assert_ne!(requests[0].body, requests[1].body);
    }
}
