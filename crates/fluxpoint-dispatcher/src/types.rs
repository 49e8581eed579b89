//! Wire and data-model types shared by the store client and delivery engine.

use std::collections::HashMap;

use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};

/// Format a timestamp the way every `AttemptRecord` field is reported: UTC, millisecond
/// precision, RFC 3339.
pub fn format_timestamp(ts: DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Millis, true)
}

/// The event payload as leased from the store, nested inside `LeasedEvent`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Event {
    pub id: String,
    pub endpoint_id: String,
    pub provider: String,
    pub headers: HashMap<String, String>,
    pub payload: String,
    pub attempts: u32,
    pub status: serde_json::Value,
    pub received_at: serde_json::Value,
    pub next_attempt_at: serde_json::Value,
    pub lease_expires_at: serde_json::Value,
    pub leased_by: serde_json::Value,
    pub last_error: serde_json::Value,
}

/// A single event leased from the store for delivery.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct LeasedEvent {
    pub event: Event,
    pub target_url: String,
    pub lease_expires_at: String,
    pub circuit: serde_json::Value,
}

/// Response body of `POST /internal/dispatcher/lease`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LeaseResponse {
    pub events: Vec<LeasedEvent>,
}

/// Request body of `POST /internal/dispatcher/lease`.
#[derive(Debug, Clone, Serialize)]
pub struct LeaseRequest {
    pub limit: u32,
    pub lease_ms: u64,
    pub worker_id: String,
}

/// The worker's classification of a delivery result.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Outcome {
    Delivered,
    Retry,
    Dead,
}

/// Classification of a transport/timeout failure (never set alongside a response status).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Timeout,
    Network,
    InvalidResponse,
    Unexpected,
}

/// Per-attempt record constructed by the worker and sent as part of `ReportRequest`.
///
/// Invariant: exactly one of `response_status` / `error_kind` is `Some`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AttemptRecord {
    pub started_at: String,
    pub finished_at: String,
    pub request_headers: HashMap<String, String>,
    pub request_body: String,
    pub response_status: Option<u16>,
    pub response_headers: Option<HashMap<String, String>>,
    pub response_body: Option<String>,
    pub error_kind: Option<ErrorKind>,
    pub error_message: Option<String>,
}

/// Request body of `POST /internal/dispatcher/report`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ReportRequest {
    pub worker_id: String,
    pub event_id: String,
    pub outcome: Outcome,
    pub retryable: bool,
    pub next_attempt_at: Option<String>,
    pub attempt: AttemptRecord,
}

/// Response body of `POST /internal/dispatcher/report`. The circuit value is logged only.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReportResponse {
    pub circuit: Option<serde_json::Value>,
}

/// `code` field of a store `{code, message}` error body.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ApiErrorCode {
    Validation,
    Unauthorized,
    RateLimited,
    NotFound,
    Conflict,
    Database,
    Internal,
}

impl ApiErrorCode {
    /// Transient store errors are retried in-process by `StoreClient`.
    pub fn is_transient(self) -> bool {
        matches!(
            self,
            ApiErrorCode::RateLimited | ApiErrorCode::Database | ApiErrorCode::Internal
        )
    }
}

/// `{code, message}` error body returned by the store on any `status >= 400`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiError {
    pub code: ApiErrorCode,
    pub message: String,
}
