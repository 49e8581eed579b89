//! Closed-set error taxonomies for the store client and config loader.
//!
//! Modeled on `hook-worker/src/error.rs`'s tagged-union style: a small `thiserror`
//! enum per concern, with `#[from]` only on the transparent transport-error case.

use thiserror::Error;

use crate::types::ApiError;

/// Errors surfaced by `StoreClient::lease`/`StoreClient::report`.
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("network error reaching the store: {0}")]
    Network(#[from] reqwest::Error),
    #[error("store returned an API error: {0:?}")]
    Api(ApiError),
    #[error("failed to parse store response: {0}")]
    Parse(String),
}

/// Errors that prevent the process from starting.
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("missing or invalid environment configuration: {0}")]
    Invalid(String),
}
