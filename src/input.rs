use axum::body::Bytes;
use futures::StreamExt;
use reqwest::header::CONTENT_TYPE;
use reqwest::{Client, Url};
use std::time::Duration;
use tracing::{debug, warn};

use crate::config::ImageConfig;
use crate::error::AppError;
use crate::imaging::{self, ImageSample};

pub const MIN_TITLE_LENGTH: usize = 3;
pub const MAX_TITLE_LENGTH: usize = 200;

/// Trims the title and collapses whitespace runs, then checks its length in characters.
pub fn validate_title(raw: &str) -> Result<String, AppError> {
    let cleaned = raw.split_whitespace().collect::<Vec<_>>().join(" ");
    if cleaned.is_empty() {
        return Err(AppError::BadRequest("Title cannot be empty".into()));
    }

    let len = cleaned.chars().count();
    if len < MIN_TITLE_LENGTH {
        return Err(AppError::BadRequest(format!(
            "Title must be at least {} characters long",
            MIN_TITLE_LENGTH
        )));
    }
    if len > MAX_TITLE_LENGTH {
        return Err(AppError::BadRequest(format!(
            "Title must be no more than {} characters long",
            MAX_TITLE_LENGTH
        )));
    }
    Ok(cleaned)
}

fn normalize_content_type(raw: &str) -> String {
    raw.split(';').next().unwrap_or("").trim().to_ascii_lowercase()
}

fn human_size(bytes: usize) -> String {
    const MB: usize = 1024 * 1024;
    if bytes >= MB {
        format!("{}MB", bytes / MB)
    } else {
        format!("{} bytes", bytes)
    }
}

/// Validates uploaded or downloaded images and decodes them for scoring.
pub struct ImageProcessor {
    client: Client,
    config: ImageConfig,
}

impl ImageProcessor {
    pub fn new(config: ImageConfig) -> Result<Self, reqwest::Error> {
        let client = Client::builder()
            .timeout(Duration::from_millis(config.fetch_timeout_ms))
            .build()?;
        Ok(Self { client, config })
    }

    fn is_allowed_type(&self, content_type: &str) -> bool {
        self.config.allowed_types.iter().any(|t| t.eq_ignore_ascii_case(content_type))
    }

    fn supported_types(&self) -> String {
        self.config.allowed_types.join(", ")
    }

    pub async fn process_upload(
        &self,
        bytes: Bytes,
        content_type: Option<&str>,
    ) -> Result<ImageSample, AppError> {
        if bytes.len() > self.config.max_file_size {
            return Err(AppError::PayloadTooLarge(format!(
                "Image file size exceeds maximum allowed size of {}",
                human_size(self.config.max_file_size)
            )));
        }

        let content_type = content_type.map(normalize_content_type).unwrap_or_default();
        if !self.is_allowed_type(&content_type) {
            return Err(AppError::BadRequest(format!(
                "Unsupported image format. Supported formats: {}",
                self.supported_types()
            )));
        }

        self.decode_checked(bytes).await
    }

    pub async fn fetch(&self, url: &str) -> Result<ImageSample, AppError> {
        let parsed = Url::parse(url.trim())
            .map_err(|e| AppError::BadRequest(format!("Invalid image URL: {}", e)))?;
        if !matches!(parsed.scheme(), "http" | "https") {
            return Err(AppError::BadRequest(
                "Invalid image URL: only http and https are supported".into(),
            ));
        }

        debug!("Fetching image from {}", parsed);
        let response = self
            .client
            .get(parsed)
            .send()
            .await
            .and_then(|r| r.error_for_status())
            .map_err(|e| {
                warn!("Image download failed: {}", e);
                AppError::ImageFetch(e.to_string())
            })?;

        let content_type = response
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map(normalize_content_type)
            .unwrap_or_default();
        if !self.is_allowed_type(&content_type) {
            return Err(AppError::BadRequest(format!(
                "Unsupported image format from URL: {}",
                if content_type.is_empty() { "unknown" } else { &content_type }
            )));
        }

        let too_large = || {
            AppError::PayloadTooLarge(format!(
                "Image from URL exceeds maximum allowed size of {}",
                human_size(self.config.max_file_size)
            ))
        };
        if response
            .content_length()
            .map_or(false, |len| len > self.config.max_file_size as u64)
        {
            return Err(too_large());
        }

        let mut body = Vec::new();
        let mut stream = response.bytes_stream();
        while let Some(chunk) = stream.next().await {
            let chunk = chunk.map_err(|e| AppError::ImageFetch(e.to_string()))?;
            if body.len() + chunk.len() > self.config.max_file_size {
                return Err(too_large());
            }
            body.extend_from_slice(&chunk);
        }

        self.decode_checked(Bytes::from(body)).await
    }

    fn check_dimensions(&self, width: u32, height: u32) -> Result<(), AppError> {
        let c = &self.config;
        if width < c.min_width || height < c.min_height {
            return Err(AppError::BadRequest(format!(
                "Image dimensions too small: {}x{} (minimum {}x{})",
                width, height, c.min_width, c.min_height
            )));
        }
        if width > c.max_width || height > c.max_height {
            return Err(AppError::BadRequest(format!(
                "Image dimensions too large: {}x{} (maximum {}x{})",
                width, height, c.max_width, c.max_height
            )));
        }
        Ok(())
    }

    async fn decode_checked(&self, bytes: Bytes) -> Result<ImageSample, AppError> {
        let (width, height) = imaging::dimensions(&bytes)
            .map_err(|e| AppError::BadRequest(format!("Invalid image file: {}", e)))?;
        self.check_dimensions(width, height)?;

        tokio::task::spawn_blocking(move || imaging::decode(&bytes))
            .await
            .map_err(|e| AppError::Internal(format!("Image decode task failed: {}", e)))?
            .map_err(|e| AppError::BadRequest(format!("Invalid image file: {}", e)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::imaging::fixtures::png_rgb;
    use axum::{http::header, routing::get, Router};
    use std::net::SocketAddr;

    fn processor() -> ImageProcessor {
        ImageProcessor::new(ImageConfig::default()).unwrap()
    }

    #[test]
    fn title_is_trimmed_and_collapsed() {
        assert_eq!(
            validate_title("  Premium   Wireless\tHeadphones ").unwrap(),
            "Premium Wireless Headphones"
        );
    }

    #[test]
    fn title_length_bounds() {
        assert!(matches!(validate_title(""), Err(AppError::BadRequest(_))));
        assert!(matches!(validate_title("   \n "), Err(AppError::BadRequest(_))));

        let err = validate_title("ab").unwrap_err();
        assert!(err.to_string().contains("at least 3"));

        let err = validate_title(&"x".repeat(201)).unwrap_err();
        assert!(err.to_string().contains("no more than 200"));

        assert!(validate_title(&"é".repeat(200)).is_ok());
    }

    #[tokio::test]
    async fn accepts_valid_upload() {
        let sample = processor()
            .process_upload(Bytes::from(png_rgb(300, 300, [200, 30, 30])), Some("image/png"))
            .await
            .unwrap();
        assert_eq!((sample.width, sample.height), (300, 300));
    }

    #[tokio::test]
    async fn rejects_unsupported_content_type() {
        let err = processor()
            .process_upload(Bytes::from(png_rgb(300, 300, [0, 0, 0])), Some("application/pdf"))
            .await
            .unwrap_err();
        assert_eq!(err.status(), axum::http::StatusCode::BAD_REQUEST);
        assert!(err.to_string().contains("Unsupported image format"));
    }

    #[tokio::test]
    async fn rejects_oversized_upload() {
        let config = ImageConfig {
            max_file_size: 1024,
            ..ImageConfig::default()
        };
        let err = ImageProcessor::new(config)
            .unwrap()
            .process_upload(Bytes::from(vec![0u8; 2048]), Some("image/png"))
            .await
            .unwrap_err();
        assert_eq!(err.status(), axum::http::StatusCode::PAYLOAD_TOO_LARGE);
    }

    #[tokio::test]
    async fn rejects_bad_dimensions() {
        let p = processor();
        let err = p
            .process_upload(Bytes::from(png_rgb(50, 50, [0, 0, 255])), Some("image/png"))
            .await
            .unwrap_err();
        assert!(err.to_string().contains("too small"));

        let err = p
            .process_upload(Bytes::from(png_rgb(4001, 120, [0, 255, 0])), Some("image/png"))
            .await
            .unwrap_err();
        assert!(err.to_string().contains("too large"));
    }

    #[tokio::test]
    async fn rejects_corrupt_upload() {
        let err = processor()
            .process_upload(Bytes::from_static(b"not really a png"), Some("image/png"))
            .await
            .unwrap_err();
        assert!(err.to_string().contains("Invalid image file"));
    }

    async fn serve_images() -> SocketAddr {
        let app = Router::new()
            .route(
                "/image.png",
                get(|| async { ([(header::CONTENT_TYPE, "image/png")], png_rgb(300, 300, [90, 90, 90])) }),
            )
            .route(
                "/page.html",
                get(|| async { ([(header::CONTENT_TYPE, "text/html; charset=utf-8")], "<html></html>") }),
            );
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        addr
    }

    #[tokio::test]
    async fn fetches_image_from_url() {
        let addr = serve_images().await;
        let sample = processor()
            .fetch(&format!("http://{}/image.png", addr))
            .await
            .unwrap();
        assert_eq!((sample.width, sample.height), (300, 300));
    }

    #[tokio::test]
    async fn url_with_non_image_content_is_rejected() {
        let addr = serve_images().await;
        let err = processor()
            .fetch(&format!("http://{}/page.html", addr))
            .await
            .unwrap_err();
        assert!(err.to_string().contains("Unsupported image format from URL"));
    }

    #[tokio::test]
    async fn missing_url_target_is_a_download_failure() {
        let addr = serve_images().await;
        let err = processor()
            .fetch(&format!("http://{}/missing.png", addr))
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::ImageFetch(_)));
        assert!(err.to_string().starts_with("Failed to download image from URL"));
    }

    #[tokio::test]
    async fn oversized_url_body_is_rejected() {
        let addr = serve_images().await;
        let config = ImageConfig {
            max_file_size: 64,
            ..ImageConfig::default()
        };
        let err = ImageProcessor::new(config)
            .unwrap()
            .fetch(&format!("http://{}/image.png", addr))
            .await
            .unwrap_err();
        assert_eq!(err.status(), axum::http::StatusCode::PAYLOAD_TOO_LARGE);
        assert!(err.to_string().contains("exceeds maximum allowed size"));
    }

    #[tokio::test]
    async fn non_http_scheme_is_rejected() {
        let err = processor().fetch("file:///etc/passwd").await.unwrap_err();
        assert_eq!(err.status(), axum::http::StatusCode::BAD_REQUEST);
    }
}
