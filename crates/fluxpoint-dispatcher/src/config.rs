//! Process configuration, loaded once at startup from the environment.
//!
//! Field/default shape follows `hook-janitor/src/config.rs`'s `envconfig::Envconfig`
//! style; the optional bearer token follows `cyclotron-janitor/src/config.rs`'s
//! `Option<String>`-without-default pattern.

use envconfig::Envconfig;

use crate::error::ConfigError;

#[derive(Envconfig, Clone, Debug)]
pub struct Config {
    #[envconfig(from = "FLUXPOINT_WORKER_ID")]
    pub worker_id: String,

    #[envconfig(from = "FLUXPOINT_RUST_API_BASE_URL")]
    pub internal_api_base_url: String,

    #[envconfig(from = "FLUXPOINT_RUST_API_TOKEN")]
    pub internal_api_token: Option<String>,

    #[envconfig(from = "FLUXPOINT_DISPATCH_POLL_INTERVAL_MS", default = "5000")]
    pub poll_interval_ms: u64,

    #[envconfig(from = "FLUXPOINT_DISPATCH_BATCH_SIZE", default = "50")]
    pub batch_size: u32,

    #[envconfig(from = "FLUXPOINT_DISPATCH_CONCURRENCY", default = "10")]
    pub concurrency: usize,

    #[envconfig(from = "FLUXPOINT_DISPATCH_LEASE_MS", default = "30000")]
    pub lease_ms: u64,

    #[envconfig(from = "FLUXPOINT_DISPATCH_REQUEST_TIMEOUT_MS", default = "10000")]
    pub request_timeout_ms: u64,

    #[envconfig(from = "FLUXPOINT_DISPATCH_IMMEDIATE_RETRY_MAX", default = "2")]
    pub immediate_retry_max: u32,

    #[envconfig(from = "FLUXPOINT_DISPATCH_MAX_ATTEMPTS", default = "10")]
    pub max_attempts: u32,
}

impl Config {
    /// Validate constraints `envconfig`'s parsing alone cannot express (non-empty strings,
    /// absolute URLs, `>= 1` lower bounds). Called once right after `init_from_env`.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.worker_id.trim().is_empty() {
            return Err(ConfigError::Invalid(
                "FLUXPOINT_WORKER_ID must not be empty".to_string(),
            ));
        }

        let parsed = url::Url::parse(&self.internal_api_base_url).map_err(|e| {
            ConfigError::Invalid(format!(
                "FLUXPOINT_RUST_API_BASE_URL is not an absolute URL: {e}"
            ))
        })?;
        if !parsed.has_host() {
            return Err(ConfigError::Invalid(
                "FLUXPOINT_RUST_API_BASE_URL is not an absolute URL".to_string(),
            ));
        }

        if self.batch_size < 1 {
            return Err(ConfigError::Invalid(
                "FLUXPOINT_DISPATCH_BATCH_SIZE must be >= 1".to_string(),
            ));
        }
        if self.concurrency < 1 {
            return Err(ConfigError::Invalid(
                "FLUXPOINT_DISPATCH_CONCURRENCY must be >= 1".to_string(),
            ));
        }
        if self.lease_ms < 1 {
            return Err(ConfigError::Invalid(
                "FLUXPOINT_DISPATCH_LEASE_MS must be >= 1".to_string(),
            ));
        }
        if self.request_timeout_ms < 1 {
            return Err(ConfigError::Invalid(
                "FLUXPOINT_DISPATCH_REQUEST_TIMEOUT_MS must be >= 1".to_string(),
            ));
        }
        if self.max_attempts < 1 {
            return Err(ConfigError::Invalid(
                "FLUXPOINT_DISPATCH_MAX_ATTEMPTS must be >= 1".to_string(),
            ));
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base_config() -> Config {
        Config {
            worker_id: "w1".to_string(),
            internal_api_base_url: "https://store.internal".to_string(),
            internal_api_token: None,
            poll_interval_ms: 5000,
            batch_size: 50,
            concurrency: 10,
            lease_ms: 30000,
            request_timeout_ms: 10000,
            immediate_retry_max: 2,
            max_attempts: 10,
        }
    }

    #[test]
    fn valid_config_passes() {
        assert!(base_config().validate().is_ok());
    }

    #[test]
    fn empty_worker_id_rejected() {
        let mut config = base_config();
        config.worker_id = "   ".to_string();
        assert!(config.validate().is_err());
    }

    #[test]
    fn relative_base_url_rejected() {
        let mut config = base_config();
        config.internal_api_base_url = "/not-absolute".to_string();
        assert!(config.validate().is_err());
    }

    #[test]
    fn zero_batch_size_rejected() {
        let mut config = base_config();
        config.batch_size = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn zero_concurrency_rejected() {
        let mut config = base_config();
        config.concurrency = 0;
        assert!(config.validate().is_err());
    }
}
