//! Per-event delivery pipeline: build the outgoing request, execute it with a per-attempt
//! timeout and bounded jittered-exponential-backoff retry, and assemble the `AttemptRecord`
//! reported back to the store.
//!
//! Request construction follows `hook-worker/src/worker.rs::send_webhook`; the retry loop adds
//! the jittered backoff and attempt cap this spec requires (the teacher's queue-backed worker
//! instead relies on the store to re-enqueue a retry as a brand new job). Every suspension point
//! (the HTTP send and the backoff sleep) is raced against the shutdown `CancellationToken`: a
//! delivery cancelled mid-flight returns without reporting, per the drain contract in
//! `shutdown.rs`.

use std::collections::HashMap;
use std::time::Duration;

use chrono::Utc;
use rand::Rng;
use reqwest::{Client, StatusCode};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::classifier::{classify_error, is_retryable, is_retryable_status, resolve_outcome};
use crate::config::Config;
use crate::store_client::StoreClient;
use crate::types::{format_timestamp, AttemptRecord, ErrorKind, LeasedEvent, ReportRequest};

const BACKOFF_BASE_MS: u64 = 1000;
const BACKOFF_JITTER_FRACTION: f64 = 0.2;

/// Outcome of a single HTTP attempt, before it is known whether the overall delivery retries.
enum Attempt {
    Response {
        status: StatusCode,
        headers: HashMap<String, String>,
        body: Option<String>,
    },
    Failed {
        kind: ErrorKind,
        message: String,
    },
}

/// The candidate final result threaded through the retry loop; each iteration overwrites it.
enum FinalResult {
    Response {
        status: StatusCode,
        headers: HashMap<String, String>,
        body: Option<String>,
    },
    Failed {
        kind: ErrorKind,
        message: String,
    },
}

pub struct DeliveryEngine {
    client: Client,
    config: Config,
}

impl DeliveryEngine {
    pub fn new(client: Client, config: Config) -> Self {
        Self { client, config }
    }

    /// Run the full delivery pipeline for one leased event and submit its report. Report
    /// failures are logged and swallowed: the delivery to the target already happened, and the
    /// store will re-lease the event on lease expiry if no report arrives. If `shutdown` cancels
    /// mid-delivery, the event is not reported at all — the store's lease expiry is what
    /// recovers it.
    pub async fn process(&self, leased: &LeasedEvent, store: &StoreClient, shutdown: &CancellationToken) {
        let Some(report) = self.deliver(leased, shutdown).await else {
            debug!(event_id = %leased.event.id, "delivery cancelled on shutdown, skipping report");
            return;
        };

        if let Err(e) = store.report(&report).await {
            warn!(
                event_id = %leased.event.id,
                error = %e,
                "failed to report delivery outcome to the store"
            );
        }
    }

    /// Execute the attempt-and-retry sequence for one event and build its `ReportRequest`.
    /// Exposed separately from `process` so tests can assert on the constructed report without
    /// needing a store double. Returns `None` if `shutdown` cancels at a suspension point (the
    /// HTTP send or the backoff sleep), in which case no report should be sent.
    pub async fn deliver(&self, leased: &LeasedEvent, shutdown: &CancellationToken) -> Option<ReportRequest> {
        let started_at = Utc::now();
        let max_attempts_total = self.config.immediate_retry_max + 1;

        let mut attempt_index: u32 = 0;
        let mut result: FinalResult;

        loop {
            attempt_index += 1;

            result = match self.attempt_once(leased, shutdown).await? {
                Attempt::Response {
                    status,
                    headers,
                    body,
                } => FinalResult::Response {
                    status,
                    headers,
                    body,
                },
                Attempt::Failed { kind, message } => FinalResult::Failed { kind, message },
            };

            let should_retry = match &result {
                FinalResult::Response { status, .. } => is_retryable_status(*status),
                FinalResult::Failed { kind, .. } => crate::classifier::is_retryable_error_kind(*kind),
            };

            if !should_retry || attempt_index >= max_attempts_total {
                break;
            }

            let delay = backoff_with_jitter(attempt_index);
            debug!(
                event_id = %leased.event.id,
                attempt = attempt_index,
                delay_ms = delay.as_millis() as u64,
                "retrying delivery after backoff"
            );
            tokio::select! {
                _ = shutdown.cancelled() => {
                    debug!(event_id = %leased.event.id, "shutdown cancelled delivery during backoff");
                    return None;
                }
                _ = tokio::time::sleep(delay) => {}
            }
        }

        let finished_at = Utc::now();

        let (status_opt, response_headers, response_body, error_kind, error_message) = match result
        {
            FinalResult::Response {
                status,
                headers,
                body,
            } => (Some(status), Some(headers), body, None, None),
            FinalResult::Failed { kind, message } => (None, None, None, Some(kind), Some(message)),
        };

        let outcome = resolve_outcome(
            status_opt,
            error_kind,
            leased.event.attempts,
            self.config.max_attempts,
        );
        let retryable = is_retryable(status_opt, error_kind);

        let outcome_label = match outcome {
            crate::types::Outcome::Delivered => "delivered",
            crate::types::Outcome::Retry => "retry",
            crate::types::Outcome::Dead => "dead",
        };
        metrics::counter!("dispatcher_delivery_attempts_total", &[("outcome", outcome_label)])
            .increment(1);
        metrics::histogram!("dispatcher_delivery_duration_seconds")
            .record((finished_at - started_at).num_milliseconds() as f64 / 1_000.0);

        let attempt = AttemptRecord {
            started_at: format_timestamp(started_at),
            finished_at: format_timestamp(finished_at),
            request_headers: leased.event.headers.clone(),
            request_body: leased.event.payload.clone(),
            response_status: status_opt.map(|s| s.as_u16()),
            response_headers,
            response_body,
            error_kind,
            error_message,
        };

        Some(ReportRequest {
            worker_id: self.config.worker_id.clone(),
            event_id: leased.event.id.clone(),
            outcome,
            retryable,
            next_attempt_at: None,
            attempt,
        })
    }

    /// Execute a single HTTP attempt bounded by `requestTimeoutMs`. Returns `None` if `shutdown`
    /// cancels before the attempt completes.
    async fn attempt_once(&self, leased: &LeasedEvent, shutdown: &CancellationToken) -> Option<Attempt> {
        let url = leased.target_url.clone();
        let headers = build_header_map(&leased.event.headers);
        let body = leased.event.payload.clone();
        let timeout = Duration::from_millis(self.config.request_timeout_ms);

        let send = self.client.post(&url).headers(headers).body(body).send();

        let outcome = tokio::select! {
            _ = shutdown.cancelled() => return None,
            result = tokio::time::timeout(timeout, send) => result,
        };

        Some(match outcome {
            Ok(Ok(response)) => {
                let status = response.status();
                let headers = collect_string_headers(response.headers());
                let body = response.text().await.ok();
                Attempt::Response {
                    status,
                    headers,
                    body,
                }
            }
            Ok(Err(error)) => Attempt::Failed {
                kind: classify_error(&error),
                message: short_error_message(&error),
            },
            Err(_) => Attempt::Failed {
                kind: ErrorKind::Timeout,
                message: "Request timed out".to_string(),
            },
        })
    }
}

fn collect_string_headers(headers: &reqwest::header::HeaderMap) -> HashMap<String, String> {
    headers
        .iter()
        .filter_map(|(name, value)| {
            value
                .to_str()
                .ok()
                .map(|v| (name.as_str().to_string(), v.to_string()))
        })
        .collect()
}

/// Build the outgoing header map: the event's headers verbatim, with `Content-Type:
/// application/json` applied only when the event headers do not already set one.
fn build_header_map(headers: &HashMap<String, String>) -> reqwest::header::HeaderMap {
    let mut map = reqwest::header::HeaderMap::new();
    let has_content_type = headers
        .keys()
        .any(|k| k.eq_ignore_ascii_case("content-type"));
    if !has_content_type {
        map.insert(
            reqwest::header::CONTENT_TYPE,
            reqwest::header::HeaderValue::from_static("application/json"),
        );
    }
    for (name, value) in headers {
        if let (Ok(name), Ok(value)) = (
            reqwest::header::HeaderName::from_bytes(name.as_bytes()),
            reqwest::header::HeaderValue::from_str(value),
        ) {
            map.insert(name, value);
        }
    }
    map
}

/// `base_delay * 2^(k-1) +/- jitter`, jitter uniform in `[-0.2*base, +0.2*base]` of the current
/// base delay (not of the grown interval), per the retry schedule in the spec.
fn backoff_with_jitter(retry_index: u32) -> Duration {
    let base = BACKOFF_BASE_MS as f64 * 2f64.powi(retry_index as i32 - 1);
    let jitter_bound = BACKOFF_BASE_MS as f64 * BACKOFF_JITTER_FRACTION;
    let jitter = rand::thread_rng().gen_range(-jitter_bound..=jitter_bound);
    let millis = (base + jitter).max(0.0) as u64;
    Duration::from_millis(millis)
}

fn short_error_message(error: &reqwest::Error) -> String {
    error.to_string()
}
