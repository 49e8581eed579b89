use std::sync::Arc;
use std::time::Duration;

use envconfig::Envconfig;
use health::HealthRegistry;
use tokio_util::sync::CancellationToken;

mod classifier;
mod config;
mod delivery;
mod dispatcher;
mod error;
mod ops;
mod shutdown;
mod store_client;
mod types;

use config::Config;
use delivery::DeliveryEngine;
use dispatcher::Dispatcher;
use store_client::StoreClient;

#[tokio::main]
async fn main() {
    let json_logs = std::env::var("FLUXPOINT_LOG_FORMAT")
        .map(|v| v.eq_ignore_ascii_case("json"))
        .unwrap_or(false);

    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env());
    if json_logs {
        subscriber.json().init();
    } else {
        subscriber.init();
    }

    let config = Config::init_from_env().expect("failed to load configuration from env");
    if let Err(e) = config.validate() {
        tracing::error!(error = %e, "invalid configuration");
        std::process::exit(1);
    }

    let client = build_http_client(&config).expect("failed to construct reqwest client");
    let store = Arc::new(StoreClient::new(client.clone(), &config));
    let delivery = Arc::new(DeliveryEngine::new(client, config.clone()));

    let liveness = HealthRegistry::new("liveness");
    let dispatch_liveness = liveness
        .register(
            "dispatcher".to_string(),
            time::Duration::seconds(config.poll_interval_ms as i64 * 3 / 1000 + 30),
        )
        .await;

    let dispatcher = Arc::new(Dispatcher::new(
        store,
        delivery,
        config.clone(),
        dispatch_liveness,
    ));

    let shutdown = CancellationToken::new();

    let ops_app = ops::app(liveness);
    let ops_listener = tokio::net::TcpListener::bind("0.0.0.0:3305")
        .await
        .expect("failed to bind ops listener");

    let ops_shutdown = shutdown.clone();
    let mut ops_server = tokio::spawn(async move {
        axum::serve(ops_listener, ops_app)
            .with_graceful_shutdown(async move { ops_shutdown.cancelled().await })
            .await
    });

    let dispatch_shutdown = shutdown.clone();
    let mut dispatch_task = tokio::spawn(async move { dispatcher.run(dispatch_shutdown).await });

    tokio::spawn(shutdown::wait_for_shutdown_signal(shutdown.clone()));

    // Run until a shutdown signal cancels the token, or either background task exits on its
    // own (a bug, since both are meant to run for the life of the process).
    tokio::select! {
        _ = shutdown.cancelled() => {
            tracing::info!("shutdown requested, draining in-flight deliveries");
        }
        res = &mut ops_server => {
            tracing::error!(?res, "ops http server task exited unexpectedly");
            shutdown.cancel();
        }
        res = &mut dispatch_task => {
            tracing::error!(?res, "dispatcher task exited unexpectedly");
            shutdown.cancel();
        }
    }

    let drain_deadline = Duration::from_millis(config.request_timeout_ms) + Duration::from_secs(1);
    shutdown::with_drain_deadline(drain_deadline, async {
        let _ = dispatch_task.await;
        let _ = ops_server.await;
    })
    .await;

    tracing::info!("shutdown complete");
}

fn build_http_client(config: &Config) -> reqwest::Result<reqwest::Client> {
    reqwest::Client::builder()
        .user_agent("fluxpoint-dispatcher")
        .timeout(Duration::from_millis(config.request_timeout_ms))
        .build()
}
