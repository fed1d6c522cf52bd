use anyhow::Result;
use tracing::info;
use std::sync::Arc;

mod config;
mod error;
mod imaging;
mod input;
mod metrics;
mod middleware;
mod models;
mod predictor;
mod ratelimit;
mod server;
mod token_bucket;

use metrics::Metrics;
use ratelimit::RateLimitStore;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("snaprate_api=info".parse()?)
        )
        .init();

    let config = Arc::new(config::load_config()?);
    info!("Starting {} v{}", config.server.app_name, server::VERSION);
    info!("Environment: {}", config.server.environment.as_str());
    if config.server.environment.is_development() {
        info!("Configuration: {:?}", config);
    }

    let metrics = Arc::new(Metrics::new());
    let store = Arc::new(RateLimitStore::new(config.rate_limit.clone()));
    if config.rate_limit.enabled {
        store.spawn_cleanup();
        info!(
            "Rate limiting: {}/burst, {}/minute, {}/hour",
            config.rate_limit.burst_limit,
            config.rate_limit.requests_per_minute,
            config.rate_limit.requests_per_hour
        );
    }

    let metrics_config = config.metrics.clone();
    let metrics_clone = metrics.clone();
    tokio::spawn(async move {
        metrics::run_metrics_server(metrics_config, metrics_clone).await;
    });

    let result = server::run(config, store.clone(), metrics).await;
    store.shutdown();
    result
}
