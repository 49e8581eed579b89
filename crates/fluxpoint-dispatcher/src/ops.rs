//! Ops HTTP surface: `/_liveness`, `/_readiness` and `/metrics`. Named `ops` rather than
//! `metrics` to keep this module out of the way of the `metrics` crate's `counter!`/
//! `histogram!` macros used elsewhere in the binary.
//!
//! Ported from `hook-janitor/src/handlers/app.rs` (the liveness/readiness routes) and
//! `common/metrics::setup_metrics_routes` (the Prometheus exposition and request-timing
//! middleware), combined into a single router for this worker's single ops listener.

use std::future::ready;
use std::time::Instant;

use axum::{
    body::Body,
    extract::MatchedPath,
    http::Request,
    middleware::{self, Next},
    response::IntoResponse,
    routing::get,
    Router,
};
use health::HealthRegistry;
use metrics_exporter_prometheus::PrometheusBuilder;

const HISTOGRAM_BUCKETS: &[f64] = &[
    1.0, 5.0, 10.0, 50.0, 100.0, 250.0, 500.0, 1000.0, 2000.0, 5000.0, 10000.0,
];

pub fn app(liveness: HealthRegistry) -> Router {
    let recorder_handle = PrometheusBuilder::new()
        .set_buckets(HISTOGRAM_BUCKETS)
        .expect("invalid histogram buckets")
        .install_recorder()
        .expect("failed to install prometheus recorder");

    let liveness_for_health = liveness.clone();

    Router::new()
        .route("/", get(index))
        .route("/health", get(move || ready(liveness_for_health.get_status())))
        .route("/_readiness", get(index))
        .route("/_liveness", get(move || ready(liveness.get_status())))
        .route(
            "/metrics",
            get(move || std::future::ready(recorder_handle.render())),
        )
        .layer(middleware::from_fn(track_metrics))
}

async fn track_metrics(req: Request<Body>, next: Next) -> impl IntoResponse {
    let start = Instant::now();
    let path = req
        .extensions()
        .get::<MatchedPath>()
        .map(|p| p.as_str().to_owned())
        .unwrap_or_else(|| req.uri().path().to_owned());
    let method = req.method().clone();

    let response = next.run(req).await;

    let labels = [
        ("method", method.to_string()),
        ("path", path),
        ("status", response.status().as_u16().to_string()),
    ];
    metrics::counter!("http_requests_total", &labels).increment(1);
    metrics::histogram!("http_requests_duration_seconds", &labels)
        .record(start.elapsed().as_secs_f64());

    response
}

async fn index() -> &'static str {
    "fluxpoint dispatcher"
}
