//! Outer poll loop: lease a batch from the store, fan the batch out across a bounded pool of
//! concurrent deliveries, and repeat on `pollIntervalMs ± 20%` jitter until told to shut down.
//!
//! Batch fan-out follows `hook-worker/src/worker.rs::WebhookWorker::run`: a semaphore bounds
//! concurrency, one task is spawned per event, and `join_all` awaits the batch.

use std::sync::Arc;
use std::time::Duration;

use health::HealthHandle;
use rand::Rng;
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use crate::config::Config;
use crate::delivery::DeliveryEngine;
use crate::store_client::StoreClient;

pub struct Dispatcher {
    store: Arc<StoreClient>,
    delivery: Arc<DeliveryEngine>,
    config: Config,
    liveness: HealthHandle,
}

impl Dispatcher {
    pub fn new(
        store: Arc<StoreClient>,
        delivery: Arc<DeliveryEngine>,
        config: Config,
        liveness: HealthHandle,
    ) -> Self {
        Self {
            store,
            delivery,
            config,
            liveness,
        }
    }

    /// Run the poll loop until `shutdown` is cancelled.
    pub async fn run(self: Arc<Self>, shutdown: CancellationToken) {
        loop {
            if shutdown.is_cancelled() {
                info!("dispatcher poll loop stopping on shutdown signal");
                return;
            }

            self.liveness.report_healthy().await;
            metrics::counter!("dispatcher_poll_cycles_total").increment(1);

            match self.run_once(&shutdown).await {
                Ok(leased) => {
                    metrics::counter!("dispatcher_leased_events_total").increment(leased as u64);
                }
                Err(e) => {
                    let labels = [("kind", store_error_kind(&e))];
                    metrics::counter!("dispatcher_store_errors_total", &labels).increment(1);
                    error!(error = %e, "failed to lease events from the store");
                }
            }

            tokio::select! {
                _ = shutdown.cancelled() => {
                    info!("dispatcher poll loop stopping on shutdown signal");
                    return;
                }
                _ = tokio::time::sleep(poll_sleep_duration(self.config.poll_interval_ms)) => {}
            }
        }
    }

    /// Lease one batch and process it to completion. Returns the number of events leased.
    ///
    /// `batchSize` and `concurrency` are independent knobs (a batch may be larger than the
    /// worker pool), so permits are acquired one per task rather than all at once for the whole
    /// batch — acquiring `batch_len` permits up front from a semaphore whose total capacity is
    /// `concurrency` would deadlock whenever the batch outgrows the pool.
    ///
    /// `shutdown` is threaded into every per-event delivery (each one cancels at its own
    /// suspension points) and is also raced against the whole batch here: if it cancels while
    /// deliveries are still in flight, this returns immediately instead of waiting for the
    /// cancelled futures to unwind on their own.
    pub async fn run_once(&self, shutdown: &CancellationToken) -> Result<usize, crate::error::StoreError> {
        let leased = self
            .store
            .lease(self.config.batch_size, self.config.lease_ms, &self.config.worker_id)
            .await?;

        let batch_len = leased.events.len();
        if batch_len == 0 {
            return Ok(0);
        }

        let semaphore = Arc::new(Semaphore::new(self.config.concurrency));

        let mut futures = Vec::with_capacity(batch_len);
        for event in leased.events {
            let delivery = self.delivery.clone();
            let store = self.store.clone();
            let semaphore = semaphore.clone();
            let shutdown = shutdown.clone();
            futures.push(async move {
                let _permit = semaphore.acquire_owned().await.expect("semaphore has been closed");
                delivery.process(&event, &store, &shutdown).await
            });
        }

        tokio::select! {
            _ = shutdown.cancelled() => {
                info!("shutdown requested mid-batch, not waiting for remaining deliveries");
            }
            _ = futures::future::join_all(futures) => {}
        }

        Ok(batch_len)
    }
}

fn store_error_kind(error: &crate::error::StoreError) -> &'static str {
    match error {
        crate::error::StoreError::Network(_) => "network",
        crate::error::StoreError::Api(_) => "api",
        crate::error::StoreError::Parse(_) => "parse",
    }
}

/// `pollIntervalMs ± 20% jitter`, the same jitter rule used for retry backoff in `delivery.rs`.
fn poll_sleep_duration(poll_interval_ms: u64) -> Duration {
    let base = poll_interval_ms as f64;
    let jitter_bound = base * 0.2;
    let jitter = rand::thread_rng().gen_range(-jitter_bound..=jitter_bound);
    Duration::from_millis((base + jitter).max(0.0) as u64)
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::extract::State;
    use axum::routing::post;
    use axum::Router;
    use httpmock::prelude::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn poll_sleep_duration_stays_within_twenty_percent() {
        let base = 5000.0;
        let bound = base * 0.2;
        for _ in 0..20 {
            let delay = poll_sleep_duration(5000).as_millis() as f64;
            assert!(delay >= base - bound);
            assert!(delay <= base + bound);
        }
    }

    struct ConcurrencyTracker {
        current: AtomicUsize,
        max_observed: AtomicUsize,
    }

    /// A `concurrency=2` batch of 4 slow events must never run more than 2 deliveries at once.
    #[tokio::test]
    async fn run_once_bounds_concurrency_to_the_configured_pool_size() {
        let tracker = Arc::new(ConcurrencyTracker {
            current: AtomicUsize::new(0),
            max_observed: AtomicUsize::new(0),
        });

        let app = Router::new()
            .route(
                "/hook",
                post(|State(tracker): State<Arc<ConcurrencyTracker>>| async move {
                    let now = tracker.current.fetch_add(1, Ordering::SeqCst) + 1;
                    tracker.max_observed.fetch_max(now, Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_millis(100)).await;
                    tracker.current.fetch_sub(1, Ordering::SeqCst);
                    axum::http::StatusCode::OK
                }),
            )
            .with_state(tracker.clone());

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let target_addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        let store = MockServer::start_async().await;
        let events: Vec<_> = (0..4)
            .map(|i| {
                serde_json::json!({
                    "event": {
                        "id": format!("e{i}"),
                        "endpoint_id": "ep1",
                        "provider": "stripe",
                        "headers": {},
                        "payload": "{}",
                        "attempts": 0,
                        "status": null,
                        "received_at": null,
                        "next_attempt_at": null,
                        "lease_expires_at": null,
                        "leased_by": null,
                        "last_error": null
                    },
                    "target_url": format!("http://{target_addr}/hook"),
                    "lease_expires_at": "2026-01-01T00:00:00.000Z",
                    "circuit": null
                })
            })
            .collect();

        let lease_mock = store
            .mock_async(move |when, then| {
                when.method(POST).path("/internal/dispatcher/lease");
                then.status(200)
                    .header("content-type", "application/json")
                    .json_body(serde_json::json!({ "events": events }));
            })
            .await;
        let report_mock = store
            .mock_async(|when, then| {
                when.method(POST).path("/internal/dispatcher/report");
                then.status(200)
                    .header("content-type", "application/json")
                    .json_body(serde_json::json!({ "circuit": null }));
            })
            .await;

        let config = crate::config::Config {
            worker_id: "w1".to_string(),
            internal_api_base_url: store.base_url(),
            internal_api_token: None,
            poll_interval_ms: 5000,
            batch_size: 4,
            concurrency: 2,
            lease_ms: 30000,
            request_timeout_ms: 5000,
            immediate_retry_max: 0,
            max_attempts: 10,
        };

        let client = reqwest::Client::new();
        let store_client = Arc::new(StoreClient::new(client.clone(), &config));
        let delivery = Arc::new(DeliveryEngine::new(client, config.clone()));
        let liveness = health::HealthRegistry::new("test")
            .register("dispatcher".to_string(), std::time::Duration::from_secs(60))
            .await;
        let dispatcher = Dispatcher::new(store_client, delivery, config, liveness);

        let shutdown = CancellationToken::new();
        let leased_count = dispatcher
            .run_once(&shutdown)
            .await
            .expect("run_once failed");

        assert_eq!(leased_count, 4);
        lease_mock.assert_hits_async(1).await;
        report_mock.assert_hits_async(4).await;
        assert_eq!(tracker.max_observed.load(Ordering::SeqCst), 2);
    }
}
