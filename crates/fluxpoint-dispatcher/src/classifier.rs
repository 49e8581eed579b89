//! Pure functions mapping an HTTP status or transport/timeout error to an outcome,
//! a retryable flag and an error kind. No I/O.
//!
//! Modeled on `hook-worker/src/worker.rs::is_retryable_status` (a bare `fn`, not a method).

use http::StatusCode;

use crate::types::{ErrorKind, Outcome};

/// Classify a final HTTP response status into a delivery outcome.
pub fn classify_status(status: StatusCode) -> Outcome {
    if status.is_success() {
        Outcome::Delivered
    } else if is_retryable_status(status) {
        Outcome::Retry
    } else {
        Outcome::Dead
    }
}

/// True iff `classify_status(status) == Outcome::Retry`: 408, 429, or any 5xx.
pub fn is_retryable_status(status: StatusCode) -> bool {
    status == StatusCode::REQUEST_TIMEOUT
        || status == StatusCode::TOO_MANY_REQUESTS
        || status.is_server_error()
}

/// True iff an `error_kind` is retryable in isolation (ignoring attempt-count promotion to
/// `dead`): timeouts, network failures and malformed response framing all qualify.
pub fn is_retryable_error_kind(kind: ErrorKind) -> bool {
    matches!(
        kind,
        ErrorKind::Timeout | ErrorKind::Network | ErrorKind::InvalidResponse
    )
}

/// Classify a transport/timeout failure from the underlying `reqwest::Error`.
pub fn classify_error(error: &reqwest::Error) -> ErrorKind {
    if error.is_timeout() {
        ErrorKind::Timeout
    } else if error.is_connect() {
        ErrorKind::Network
    } else if error.is_decode() || error.is_body() {
        ErrorKind::InvalidResponse
    } else if error.is_request() {
        ErrorKind::Network
    } else {
        ErrorKind::Unexpected
    }
}

/// The final outcome of a delivery sequence, given the attempt count carried into the lease
/// and the configured lifetime attempt cap.
///
/// `current_attempts` is `event.attempts` (the lifetime attempt count *before* this lease).
pub fn resolve_outcome(
    status: Option<StatusCode>,
    error_kind: Option<ErrorKind>,
    current_attempts: u32,
    max_attempts: u32,
) -> Outcome {
    match status {
        Some(status) => classify_status(status),
        None => {
            let kind = error_kind.expect("resolve_outcome requires status or error_kind");
            if !is_retryable_error_kind(kind) {
                Outcome::Dead
            } else if current_attempts + 1 >= max_attempts {
                Outcome::Dead
            } else {
                Outcome::Retry
            }
        }
    }
}

/// `retryable` is true iff the final result is a retryable-status response or a retryable
/// transport/timeout failure, regardless of whether `resolve_outcome` promoted to `dead` for
/// attempt-count reasons.
pub fn is_retryable(status: Option<StatusCode>, error_kind: Option<ErrorKind>) -> bool {
    match status {
        Some(status) => is_retryable_status(status),
        None => {
            let kind = error_kind.expect("is_retryable requires status or error_kind");
            is_retryable_error_kind(kind)
        }
    }
}
