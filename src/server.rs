use anyhow::{Context, Result};
use axum::{
    body::Bytes,
    extract::{DefaultBodyLimit, Multipart, Request, State},
    http::{HeaderName, HeaderValue, Method, StatusCode},
    middleware::{from_fn_with_state, Next},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde_json::{json, Map, Value};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;
use tower_http::compression::predicate::{And, DefaultPredicate, Predicate, SizeAbove};
use tower_http::compression::CompressionLayer;
use tower_http::cors::{AllowOrigin, Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::Config;
use crate::error::AppError;
use crate::input::{validate_title, ImageProcessor};
use crate::metrics::Metrics;
use crate::middleware::{rate_limit, trusted_host, RateLimitState, TrustedHosts, HEALTH_CHECK_PATH};
use crate::models::{HealthResponse, PredictionMode, PredictionResponse};
use crate::predictor::Predictor;
use crate::ratelimit::{
    RateLimitStore, HEADER_LIMIT, HEADER_REMAINING_HOUR, HEADER_REMAINING_MINUTE,
    HEADER_RETRY_AFTER, HEADER_WINDOW,
};

pub const VERSION: &str = env!("CARGO_PKG_VERSION");
pub const PROCESS_TIME_HEADER: &str = "x-process-time";

/// Responses smaller than this are sent uncompressed.
const GZIP_MIN_SIZE: u16 = 1000;

/// Room for multipart framing and the text fields on top of the image itself.
const FORM_OVERHEAD: usize = 1024 * 1024;

#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub predictor: Arc<Predictor>,
    pub images: Arc<ImageProcessor>,
    pub metrics: Arc<Metrics>,
}

pub fn router(
    config: Arc<Config>,
    store: Arc<RateLimitStore>,
    metrics: Arc<Metrics>,
) -> Result<Router> {
    let images = ImageProcessor::new(config.images.clone()).context("Failed to build HTTP client")?;
    let state = AppState {
        config: config.clone(),
        predictor: Arc::new(Predictor::new()),
        images: Arc::new(images),
        metrics: metrics.clone(),
    };

    let mut app = Router::new()
        .route("/", get(root))
        .route(HEALTH_CHECK_PATH, get(health_check))
        .route("/api/v1/predict", post(predict))
        .route("/api/v1/predict/modes", get(prediction_modes))
        .route("/api/v1/predict/health", get(prediction_health))
        .layer(DefaultBodyLimit::max(config.images.max_file_size + FORM_OVERHEAD))
        .with_state(state.clone());

    if config.rate_limit.enabled {
        let limiter = RateLimitState::new(store, metrics);
        app = app.layer(from_fn_with_state(limiter, rate_limit));
    } else {
        warn!("Rate limiting is disabled");
    }

    // Checked before the limiter so foreign hosts never spend a client's quota.
    if !config.server.environment.is_development() {
        let hosts = TrustedHosts::new(config.server.trusted_hosts.clone());
        app = app.layer(from_fn_with_state(hosts, trusted_host));
    }

    Ok(app
        .layer(from_fn_with_state(state, track_requests))
        .layer(TraceLayer::new_for_http())
        .layer(compression_layer())
        .layer(cors_layer(&config)))
}

fn compression_layer() -> CompressionLayer<And<DefaultPredicate, SizeAbove>> {
    CompressionLayer::new().compress_when(DefaultPredicate::new().and(SizeAbove::new(GZIP_MIN_SIZE)))
}

fn cors_layer(config: &Config) -> CorsLayer {
    let origins = &config.server.cors_origins;
    let allow_origin = if origins.iter().any(|o| o == "*") {
        AllowOrigin::from(Any)
    } else {
        let values: Vec<HeaderValue> = origins
            .iter()
            .filter_map(|o| match HeaderValue::from_str(o) {
                Ok(v) => Some(v),
                Err(_) => {
                    warn!("Ignoring invalid CORS origin: {}", o);
                    None
                }
            })
            .collect();
        AllowOrigin::list(values)
    };

    let exposed: Vec<HeaderName> = [
        HEADER_REMAINING_MINUTE,
        HEADER_REMAINING_HOUR,
        HEADER_LIMIT,
        HEADER_WINDOW,
        HEADER_RETRY_AFTER,
        PROCESS_TIME_HEADER,
    ]
    .iter()
    .filter_map(|name| HeaderName::from_bytes(name.as_bytes()).ok())
    .collect();

    CorsLayer::new()
        .allow_origin(allow_origin)
        .allow_methods([Method::GET, Method::POST, Method::OPTIONS])
        .allow_headers(Any)
        .expose_headers(exposed)
}

pub async fn run(config: Arc<Config>, store: Arc<RateLimitStore>, metrics: Arc<Metrics>) -> Result<()> {
    let app = router(config.clone(), store, metrics)?;

    let addr: SocketAddr = config
        .server
        .bind_addr
        .parse()
        .with_context(|| format!("Invalid bind address: {}", config.server.bind_addr))?;
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("Failed to bind {}", addr))?;
    info!("{} listening on {}", config.server.app_name, addr);

    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown_signal())
    .await?;

    info!("Shutting down {}", config.server.app_name);
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!("Failed to install signal handler: {}", e);
        std::future::pending::<()>().await;
    }
    info!("Shutdown signal received");
}

/// Stamps `X-Process-Time` and logs the request outcome.
async fn track_requests(State(state): State<AppState>, req: Request, next: Next) -> Response {
    let start = Instant::now();
    let method = req.method().clone();
    let path = req.uri().path().to_string();
    state.metrics.inc_requests();

    let mut response = next.run(req).await;

    let elapsed = start.elapsed().as_secs_f64();
    if let Ok(value) = HeaderValue::from_str(&format!("{:.6}", elapsed)) {
        response
            .headers_mut()
            .insert(HeaderName::from_static(PROCESS_TIME_HEADER), value);
    }

    let status = response.status().as_u16();
    if state.config.server.environment.is_development() {
        info!("{} {} - {} - {:.4}s", method, path, status, elapsed);
    } else if status >= 400 {
        warn!("{} {} - {} - {:.4}s", method, path, status, elapsed);
    }
    response
}

fn timestamp() -> String {
    chrono::Utc::now().to_rfc3339()
}

async fn root(State(state): State<AppState>) -> Json<Value> {
    Json(json!({
        "message": format!("{} is running", state.config.server.app_name),
        "version": VERSION,
        "environment": state.config.server.environment.as_str(),
    }))
}

async fn health_check() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "healthy".into(),
        version: VERSION.into(),
        timestamp: timestamp(),
    })
}

struct Upload {
    bytes: Bytes,
    content_type: Option<String>,
}

#[derive(Default)]
struct PredictForm {
    title: Option<String>,
    image: Option<Upload>,
    image_url: Option<String>,
    mode: Option<String>,
}

fn non_blank(value: String) -> Option<String> {
    let trimmed = value.trim();
    (!trimmed.is_empty()).then(|| trimmed.to_string())
}

async fn read_form(multipart: &mut Multipart) -> Result<PredictForm, AppError> {
    let mut form = PredictForm::default();

    while let Some(field) = multipart.next_field().await? {
        let Some(name) = field.name().map(str::to_owned) else {
            continue;
        };
        match name.as_str() {
            "title" => form.title = Some(field.text().await?),
            "image_url" => form.image_url = non_blank(field.text().await?),
            "mode" => form.mode = non_blank(field.text().await?),
            "image" => {
                let content_type = field.content_type().map(str::to_owned);
                let bytes = field.bytes().await?;
                // An empty file part is what browsers send when nothing was picked.
                if !bytes.is_empty() {
                    form.image = Some(Upload {
                        bytes,
                        content_type,
                    });
                }
            }
            other => debug!("Ignoring form field {}", other),
        }
    }
    Ok(form)
}

async fn predict(
    State(state): State<AppState>,
    mut multipart: Multipart,
) -> Result<Json<PredictionResponse>, AppError> {
    let request_id = Uuid::new_v4();
    match run_prediction(&state, &mut multipart, request_id).await {
        Ok(prediction) => {
            state.metrics.inc_predictions();
            info!(
                %request_id,
                rating = prediction.rating,
                confidence = prediction.confidence,
                "Prediction generated"
            );
            Ok(Json(prediction))
        }
        Err(e) => {
            state.metrics.inc_failed();
            warn!(%request_id, status = e.status().as_u16(), "Prediction rejected: {}", e);
            Err(e)
        }
    }
}

async fn run_prediction(
    state: &AppState,
    multipart: &mut Multipart,
    request_id: Uuid,
) -> Result<PredictionResponse, AppError> {
    let form = read_form(multipart).await?;

    let raw_title = form
        .title
        .and_then(non_blank)
        .ok_or_else(|| AppError::BadRequest("Title is required and cannot be empty".into()))?;

    if form.image.is_some() && form.image_url.is_some() {
        return Err(AppError::BadRequest(
            "Please provide either an image file or image URL, not both".into(),
        ));
    }

    let mode = match form.mode.as_deref() {
        Some(raw) => raw.parse::<PredictionMode>().map_err(AppError::BadRequest)?,
        None => PredictionMode::Auto,
    };

    let title = validate_title(&raw_title)?;
    let preview: String = title.chars().take(50).collect();
    info!(%request_id, %mode, title = %preview, "Prediction request");

    let sample = match (form.image, form.image_url) {
        (Some(upload), _) => Some(
            state
                .images
                .process_upload(upload.bytes, upload.content_type.as_deref())
                .await?,
        ),
        (None, Some(url)) => {
            let sample = state.images.fetch(&url).await?;
            state.metrics.inc_images_fetched();
            Some(sample)
        }
        (None, None) => {
            debug!(%request_id, "No image provided, predicting from title only");
            None
        }
    };
    if let Some(sample) = &sample {
        info!(
            %request_id,
            format = sample.format_name(),
            width = sample.width,
            height = sample.height,
            "Image accepted"
        );
    }

    Ok(state.predictor.predict(&title, sample.as_ref(), mode))
}

async fn prediction_modes(State(state): State<AppState>) -> Json<Value> {
    let ai_available = state.predictor.ai_available();
    let mut modes = Map::new();
    for mode in PredictionMode::ALL {
        let mut entry = json!({
            "description": mode.description(),
            "recommended": mode != PredictionMode::RuleBased,
        });
        if mode.needs_ai() {
            entry["available"] = json!(ai_available);
        }
        modes.insert(mode.as_str().to_string(), entry);
    }

    Json(json!({
        "modes": modes,
        "default": PredictionMode::Auto.as_str(),
        "ai_available": ai_available,
    }))
}

async fn prediction_health(State(state): State<AppState>) -> impl IntoResponse {
    let probe = state.predictor.rule_based().predict("Test Product", None);
    let healthy = probe.rating.is_finite() && (1.0..=5.0).contains(&probe.rating);
    let status = if healthy { "healthy" } else { "unhealthy" };
    let ai_available = state.predictor.ai_available();

    let code = if healthy {
        StatusCode::OK
    } else {
        StatusCode::INTERNAL_SERVER_ERROR
    };
    let body = json!({
        "status": status,
        "services": {
            "rule_based_predictor": status,
            "ai_predictor": if ai_available { status } else { "disabled" },
            "ensemble_predictor": status,
        },
        "ai_mode_available": ai_available,
        "timestamp": timestamp(),
    });
    (code, Json(body))
}
