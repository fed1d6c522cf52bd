use axum::{Router, routing::get};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing::info;

use crate::config::MetricsConfig;

#[derive(Default)]
pub struct Metrics {
    pub requests_total: AtomicU64,
    pub rate_limited_total: AtomicU64,
    pub predictions_total: AtomicU64,
    pub predictions_failed: AtomicU64,
    pub images_fetched: AtomicU64,
}

impl Metrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn inc_requests(&self) {
        self.requests_total.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_rate_limited(&self) {
        self.rate_limited_total.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_predictions(&self) {
        self.predictions_total.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_failed(&self) {
        self.predictions_failed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_images_fetched(&self) {
        self.images_fetched.fetch_add(1, Ordering::Relaxed);
    }

    pub fn format_prometheus(&self) -> String {
        format!(
            "# HELP snaprate_requests_total Total HTTP requests\n\
             # TYPE snaprate_requests_total counter\n\
             snaprate_requests_total {}\n\
             # HELP snaprate_rate_limited_total Requests rejected by the rate limiter\n\
             # TYPE snaprate_rate_limited_total counter\n\
             snaprate_rate_limited_total {}\n\
             # HELP snaprate_predictions_total Successful predictions\n\
             # TYPE snaprate_predictions_total counter\n\
             snaprate_predictions_total {}\n\
             # HELP snaprate_predictions_failed Rejected or failed prediction requests\n\
             # TYPE snaprate_predictions_failed counter\n\
             snaprate_predictions_failed {}\n\
             # HELP snaprate_images_fetched Images downloaded from URLs\n\
             # TYPE snaprate_images_fetched counter\n\
             snaprate_images_fetched {}\n",
            self.requests_total.load(Ordering::Relaxed),
            self.rate_limited_total.load(Ordering::Relaxed),
            self.predictions_total.load(Ordering::Relaxed),
            self.predictions_failed.load(Ordering::Relaxed),
            self.images_fetched.load(Ordering::Relaxed),
        )
    }
}

pub async fn run_metrics_server(config: MetricsConfig, metrics: Arc<Metrics>) {
    if !config.enable {
        return;
    }

    let path = config.path.clone();
    let app = Router::new()
        .route(&path, get(move || {
            let m = metrics.clone();
            async move { m.format_prometheus() }
        }));

    let addr: std::net::SocketAddr = match config.bind_addr.parse() {
        Ok(a) => a,
        Err(e) => {
            tracing::error!("Invalid metrics bind address: {}", e);
            return;
        }
    };

    info!("Metrics server listening on {}{}", addr, path);

    match TcpListener::bind(addr).await {
        Ok(listener) => {
            if let Err(e) = axum::serve(listener, app).await {
                tracing::error!("Metrics server stopped: {}", e);
            }
        }
        Err(e) => tracing::error!("Failed to bind metrics server: {}", e),
    }
}
