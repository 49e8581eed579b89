//! Typed HTTP client over the store's `/lease` and `/report` endpoints.
//!
//! Shares a single pooled `reqwest::Client` the way `hook-worker`'s
//! `build_http_client` does, and retries transient store errors with a fixed
//! exponential backoff local to this client (the delivery engine's jittered
//! retry policy, governed by `immediateRetryMax`, is a separate concern).

use std::time::Duration;

use tracing::warn;

use crate::config::Config;
use crate::error::StoreError;
use crate::types::{ApiError, LeaseRequest, LeaseResponse, ReportRequest, ReportResponse};

const TRANSIENT_RETRY_BASE_MS: u64 = 100;
const TRANSIENT_RETRY_MAX_ADDITIONAL_ATTEMPTS: u32 = 5;

pub struct StoreClient {
    client: reqwest::Client,
    base_url: String,
    token: Option<String>,
}

impl StoreClient {
    pub fn new(client: reqwest::Client, config: &Config) -> Self {
        Self {
            client,
            base_url: config.internal_api_base_url.trim_end_matches('/').to_string(),
            token: config.internal_api_token.clone(),
        }
    }

    pub async fn lease(&self, limit: u32, lease_ms: u64, worker_id: &str) -> Result<LeaseResponse, StoreError> {
        let body = LeaseRequest {
            limit,
            lease_ms,
            worker_id: worker_id.to_string(),
        };
        let url = format!("{}/internal/dispatcher/lease", self.base_url);
        self.post_with_retry(&url, &body).await
    }

    pub async fn report(&self, request: &ReportRequest) -> Result<ReportResponse, StoreError> {
        let url = format!("{}/internal/dispatcher/report", self.base_url);
        self.post_with_retry(&url, request).await
    }

    /// Send one POST request, retrying on transient `ApiError` codes
    /// (`rate_limited | database | internal`) with exponential backoff: base 100ms, up to 5
    /// additional attempts (six total). `NetworkError` and `ParseError` are not retried here.
    async fn post_with_retry<B, R>(&self, url: &str, body: &B) -> Result<R, StoreError>
    where
        B: serde::Serialize,
        R: serde::de::DeserializeOwned,
    {
        let mut attempt: u32 = 0;
        loop {
            match self.post_once(url, body).await {
                Ok(value) => return Ok(value),
                Err(StoreError::Api(api_error))
                    if api_error.code.is_transient()
                        && attempt < TRANSIENT_RETRY_MAX_ADDITIONAL_ATTEMPTS =>
                {
                    let delay = Duration::from_millis(TRANSIENT_RETRY_BASE_MS * 2u64.pow(attempt));
                    warn!(
                        attempt,
                        code = ?api_error.code,
                        "transient store error, retrying after {:?}",
                        delay
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(other) => return Err(other),
            }
        }
    }

    async fn post_once<B, R>(&self, url: &str, body: &B) -> Result<R, StoreError>
    where
        B: serde::Serialize,
        R: serde::de::DeserializeOwned,
    {
        let mut request = self
            .client
            .post(url)
            .header(reqwest::header::CONTENT_TYPE, "application/json")
            .header(reqwest::header::ACCEPT, "application/json")
            .json(body);

        if let Some(token) = &self.token {
            request = request.bearer_auth(token);
        }

        let response = request.send().await?;
        let status = response.status();
        let text = response.text().await?;

        if status.as_u16() >= 400 {
            return match serde_json::from_str::<ApiError>(&text) {
                Ok(api_error) => Err(StoreError::Api(api_error)),
                Err(_) => Err(StoreError::Parse(format!(
                    "store returned status {status} with an undecodable error body: {text}"
                ))),
            };
        }

        serde_json::from_str::<R>(&text)
            .map_err(|e| StoreError::Parse(format!("failed to decode store response: {e}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{ApiErrorCode, Event, LeasedEvent};
    use httpmock::prelude::*;
    use std::collections::HashMap;

    fn test_config(base_url: &str) -> Config {
        Config {
            worker_id: "w1".to_string(),
            internal_api_base_url: base_url.to_string(),
            internal_api_token: Some("secret-token".to_string()),
            poll_interval_ms: 5000,
            batch_size: 50,
            concurrency: 10,
            lease_ms: 30000,
            request_timeout_ms: 10000,
            immediate_retry_max: 2,
            max_attempts: 10,
        }
    }

    fn sample_event() -> LeasedEvent {
        LeasedEvent {
            event: Event {
                id: "e1".to_string(),
                endpoint_id: "ep1".to_string(),
                provider: "stripe".to_string(),
                headers: HashMap::new(),
                payload: "{}".to_string(),
                attempts: 0,
                status: serde_json::Value::Null,
                received_at: serde_json::Value::Null,
                next_attempt_at: serde_json::Value::Null,
                lease_expires_at: serde_json::Value::Null,
                leased_by: serde_json::Value::Null,
                last_error: serde_json::Value::Null,
            },
            target_url: "http://example.invalid/hook".to_string(),
            lease_expires_at: "2026-01-01T00:00:00.000Z".to_string(),
            circuit: serde_json::Value::Null,
        }
    }

    #[tokio::test]
    async fn lease_succeeds_and_sends_auth_header() {
        let server = MockServer::start_async().await;
        let event = sample_event();
        let mock = server
            .mock_async(|when, then| {
                when.method(POST)
                    .path("/internal/dispatcher/lease")
                    .header("authorization", "Bearer secret-token");
                then.status(200)
                    .header("content-type", "application/json")
                    .json_body(serde_json::json!({ "events": [event] }));
            })
            .await;

        let client = StoreClient::new(reqwest::Client::new(), &test_config(&server.base_url()));
        let response = client.lease(50, 30000, "w1").await.expect("lease failed");

        mock.assert_async().await;
        assert_eq!(response.events.len(), 1);
        assert_eq!(response.events[0].event.id, "e1");
    }

    #[tokio::test]
    async fn non_transient_api_error_is_not_retried() {
        let server = MockServer::start_async().await;
        let mock = server
            .mock_async(|when, then| {
                when.method(POST).path("/internal/dispatcher/lease");
                then.status(422).json_body(serde_json::json!({
                    "code": "validation",
                    "message": "limit must be positive"
                }));
            })
            .await;

        let client = StoreClient::new(reqwest::Client::new(), &test_config(&server.base_url()));
        let err = client.lease(0, 30000, "w1").await.unwrap_err();

        mock.assert_hits_async(1).await;
        match err {
            StoreError::Api(api_error) => assert_eq!(api_error.code, ApiErrorCode::Validation),
            other => panic!("expected ApiError, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn transient_api_error_is_retried_then_succeeds() {
        let server = MockServer::start_async().await;
        let failing_mock = server
            .mock_async(|when, then| {
                when.method(POST).path("/internal/dispatcher/report");
                then.status(503).json_body(serde_json::json!({
                    "code": "database",
                    "message": "connection pool exhausted"
                }));
            })
            .await;

        // httpmock serves the same mock until we delete it; simulate "eventually succeeds" by
        // asserting the retry path is exercised (bounded, not infinite) against a server that
        // always fails, and that the bound is exactly six total attempts.
        let client = StoreClient::new(reqwest::Client::new(), &test_config(&server.base_url()));
        let report = sample_report_request();
        let err = client.report(&report).await.unwrap_err();

        failing_mock.assert_hits_async(6).await;
        match err {
            StoreError::Api(api_error) => assert_eq!(api_error.code, ApiErrorCode::Database),
            other => panic!("expected ApiError, got {other:?}"),
        }
    }

    fn sample_report_request() -> ReportRequest {
        use crate::types::{AttemptRecord, Outcome};

        ReportRequest {
            worker_id: "w1".to_string(),
            event_id: "e1".to_string(),
            outcome: Outcome::Delivered,
            retryable: false,
            next_attempt_at: None,
            attempt: AttemptRecord {
                started_at: "2026-01-01T00:00:00.000Z".to_string(),
                finished_at: "2026-01-01T00:00:00.050Z".to_string(),
                request_headers: HashMap::new(),
                request_body: "{}".to_string(),
                response_status: Some(200),
                response_headers: Some(HashMap::new()),
                response_body: Some("OK".to_string()),
                error_kind: None,
                error_message: None,
            },
        }
    }
}
