//! Authenticated Google API client shared by the storage and warehouse
//! collaborators.
//!
//! Owns the access token cache, transient-failure retries with the configured
//! backoff schedule and one circuit breaker per service.

use parking_lot::RwLock;
use reqwest::{Client, Method, StatusCode};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::Value;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

use crate::circuit_breaker::{CircuitBreaker, CircuitBreakerConfig};
use crate::config::ClientConfig;
use crate::error::{ApiError, Error};
use crate::Result;

const METADATA_TOKEN_URL: &str =
    "http://metadata.google.internal/computeMetadata/v1/instance/service-accounts/default/token";

/// Google API a request is addressed to. Each has its own circuit breaker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Service {
    Storage,
    BigQuery,
    Connection,
}

impl Service {
    pub fn name(&self) -> &'static str {
        match self {
            Service::Storage => "cloud-storage",
            Service::BigQuery => "bigquery",
            Service::Connection => "bigquery-connection",
        }
    }
}

/// Retry schedule for transient failures.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub backoff_ms: Vec<u64>,
}

impl RetryPolicy {
    /// Delay before retry number `attempt` (0-based). The last value repeats.
    pub fn delay(&self, attempt: u32) -> Duration {
        let ms = self
            .backoff_ms
            .get(attempt as usize)
            .or(self.backoff_ms.last())
            .copied()
            .unwrap_or(0);
        Duration::from_millis(ms)
    }

    /// Whether a response status is worth retrying.
    pub fn is_retryable(status: StatusCode) -> bool {
        status == StatusCode::TOO_MANY_REQUESTS
            || status == StatusCode::REQUEST_TIMEOUT
            || status.is_server_error()
    }
}

/// Where access tokens come from.
#[derive(Debug, Clone)]
enum Credentials {
    /// Fixed token from configuration or environment
    Static(String),
    /// GCE/GKE metadata server
    MetadataServer,
}

/// Cached access token with expiry.
#[derive(Debug, Clone)]
struct CachedToken {
    token: String,
    expires_at: Instant,
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
    #[serde(default)]
    expires_in: Option<u64>,
}

/// Response with its body already read.
#[derive(Debug, Clone)]
pub struct ApiResponse {
    pub status: StatusCode,
    pub body: String,
}

impl ApiResponse {
    pub fn is_success(&self) -> bool {
        self.status.is_success()
    }

    /// Decode the body as JSON.
    pub fn json<T: DeserializeOwned>(&self) -> Result<T> {
        Ok(serde_json::from_str(&self.body)?)
    }

    /// Error message from a Google API error body, or the raw body.
    pub fn error_message(&self) -> String {
        serde_json::from_str::<Value>(&self.body)
            .ok()
            .and_then(|v| {
                v.pointer("/error/message")
                    .and_then(Value::as_str)
                    .map(str::to_string)
            })
            .unwrap_or_else(|| self.body.trim().to_string())
    }
}

/// Authenticated client for Google Cloud REST APIs.
pub struct GoogleApiClient {
    client: Client,
    credentials: Credentials,
    token: RwLock<Option<CachedToken>>,
    retry: RetryPolicy,
    storage_breaker: CircuitBreaker,
    bigquery_breaker: CircuitBreaker,
    connection_breaker: CircuitBreaker,
}

impl GoogleApiClient {
    /// Create a client from configuration.
    pub fn new(config: &ClientConfig) -> Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(config.request_timeout_seconds))
            .build()
            .map_err(|e| Error::Config(format!("Failed to create HTTP client: {}", e)))?;

        let credentials = match &config.access_token {
            Some(token) => Credentials::Static(token.clone()),
            None => Credentials::MetadataServer,
        };

        let breaker = |service: Service| {
            CircuitBreaker::new(
                CircuitBreakerConfig::new(service.name())
                    .with_failure_threshold(config.circuit_failure_threshold)
                    .with_reset_timeout(Duration::from_secs(config.circuit_reset_seconds))
                    .with_success_threshold(2),
            )
        };

        info!(
            static_token = matches!(credentials, Credentials::Static(_)),
            max_retries = config.max_retries,
            "Google API client initialized"
        );

        Ok(Self {
            client,
            credentials,
            token: RwLock::new(None),
            retry: RetryPolicy {
                max_retries: config.max_retries,
                backoff_ms: config.retry_backoff_ms.clone(),
            },
            storage_breaker: breaker(Service::Storage),
            bigquery_breaker: breaker(Service::BigQuery),
            connection_breaker: breaker(Service::Connection),
        })
    }

    fn breaker(&self, service: Service) -> &CircuitBreaker {
        match service {
            Service::Storage => &self.storage_breaker,
            Service::BigQuery => &self.bigquery_breaker,
            Service::Connection => &self.connection_breaker,
        }
    }

    /// Current access token, refreshed from the metadata server when expired.
    pub async fn access_token(&self) -> Result<String> {
        let url = match &self.credentials {
            Credentials::Static(token) => return Ok(token.clone()),
            Credentials::MetadataServer => METADATA_TOKEN_URL,
        };

        if let Some(cached) = self.token.read().as_ref() {
            if Instant::now() < cached.expires_at {
                return Ok(cached.token.clone());
            }
        }

        let response = self
            .client
            .get(url)
            .header("Metadata-Flavor", "Google")
            .send()
            .await
            .map_err(|e| ApiError::Auth(format!("metadata server unreachable: {}", e)))?;

        if !response.status().is_success() {
            return Err(ApiError::Auth(format!(
                "metadata server returned {}",
                response.status()
            ))
            .into());
        }

        let token: TokenResponse = response
            .json()
            .await
            .map_err(|e| ApiError::Auth(e.to_string()))?;

        // Refresh 60s early
        let expires_in = token.expires_in.unwrap_or(3600).saturating_sub(60);
        *self.token.write() = Some(CachedToken {
            token: token.access_token.clone(),
            expires_at: Instant::now() + Duration::from_secs(expires_in),
        });

        debug!(expires_in, "Access token refreshed");
        Ok(token.access_token)
    }

    /// Send a request, retrying transient failures.
    ///
    /// Non-retryable error statuses are returned as responses so callers can
    /// interpret 404/409 themselves.
    pub async fn send(
        &self,
        service: Service,
        method: Method,
        url: &str,
        body: Option<&Value>,
    ) -> Result<ApiResponse> {
        let breaker = self.breaker(service);
        let mut attempt = 0;

        loop {
            breaker.check()?;

            let token = self.access_token().await?;
            let mut request = self
                .client
                .request(method.clone(), url)
                .bearer_auth(token)
                .header("Accept", "application/json");
            if let Some(body) = body {
                request = request.json(body);
            }

            match request.send().await {
                Ok(response) => {
                    let status = response.status();
                    if RetryPolicy::is_retryable(status) {
                        breaker.record_failure();
                    } else {
                        // Client errors are not the service's fault
                        breaker.record_success();
                    }

                    let body = response.text().await.unwrap_or_default();
                    if RetryPolicy::is_retryable(status) && attempt < self.retry.max_retries {
                        let delay = self.retry.delay(attempt);
                        warn!(
                            service = service.name(),
                            %status,
                            attempt,
                            delay_ms = delay.as_millis() as u64,
                            "Transient API error, retrying"
                        );
                        tokio::time::sleep(delay).await;
                        attempt += 1;
                        continue;
                    }

                    debug!(service = service.name(), %method, url, %status, "API call finished");
                    return Ok(ApiResponse { status, body });
                }
                Err(e) => {
                    breaker.record_failure();
                    if attempt < self.retry.max_retries {
                        let delay = self.retry.delay(attempt);
                        warn!(
                            service = service.name(),
                            error = %e,
                            attempt,
                            "Request failed, retrying"
                        );
                        tokio::time::sleep(delay).await;
                        attempt += 1;
                        continue;
                    }
                    return Err(ApiError::Request(e.to_string()).into());
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retry_delay_repeats_last() {
        let policy = RetryPolicy {
            max_retries: 5,
            backoff_ms: vec![100, 500],
        };
        assert_eq!(policy.delay(0), Duration::from_millis(100));
        assert_eq!(policy.delay(1), Duration::from_millis(500));
        assert_eq!(policy.delay(4), Duration::from_millis(500));

        let immediate = RetryPolicy {
            max_retries: 1,
            backoff_ms: vec![],
        };
        assert_eq!(immediate.delay(0), Duration::ZERO);
    }

    #[test]
    fn test_retryable_statuses() {
        assert!(RetryPolicy::is_retryable(StatusCode::TOO_MANY_REQUESTS));
        assert!(RetryPolicy::is_retryable(StatusCode::SERVICE_UNAVAILABLE));
        assert!(!RetryPolicy::is_retryable(StatusCode::NOT_FOUND));
        assert!(!RetryPolicy::is_retryable(StatusCode::CONFLICT));
    }

    #[test]
    fn test_error_message_extraction() {
        let response = ApiResponse {
            status: StatusCode::FORBIDDEN,
            body: r#"{"error":{"code":403,"message":"Access Denied: Dataset"}}"#.into(),
        };
        assert_eq!(response.error_message(), "Access Denied: Dataset");

        let response = ApiResponse {
            status: StatusCode::BAD_GATEWAY,
            body: "upstream failed\n".into(),
        };
        assert_eq!(response.error_message(), "upstream failed");
    }

    #[tokio::test]
    async fn test_static_token() {
        let config = ClientConfig {
            access_token: Some("ya29.static".into()),
            ..ClientConfig::default()
        };
        let client = GoogleApiClient::new(&config).unwrap();
        assert_eq!(client.access_token().await.unwrap(), "ya29.static");
    }
}
