use serde::Deserialize;
use std::fs;
use std::env;
use std::path::Path;
use anyhow::{bail, Context, Result};
use tracing::warn;

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Config {
    pub server: ServerConfig,
    pub rate_limit: RateLimitConfig,
    pub images: ImageConfig,
    pub metrics: MetricsConfig,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Environment {
    #[default]
    Development,
    Staging,
    Production,
}

impl Environment {
    pub fn as_str(&self) -> &'static str {
        match self {
            Environment::Development => "development",
            Environment::Staging => "staging",
            Environment::Production => "production",
        }
    }

    pub fn is_development(&self) -> bool {
        *self == Environment::Development
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub bind_addr: String,
    pub app_name: String,
    pub environment: Environment,
    pub cors_origins: Vec<String>,
    /// Host names accepted outside development. `*` accepts any host and
    /// `*.example.com` accepts its subdomains.
    pub trusted_hosts: Vec<String>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: "0.0.0.0:8000".to_string(),
            app_name: "SnapRate API".to_string(),
            environment: Environment::Development,
            cors_origins: vec!["*".to_string()],
            trusted_hosts: vec!["localhost".to_string(), "127.0.0.1".to_string()],
        }
    }
}

/// How the burst policy counts near-simultaneous requests.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BurstMode {
    /// Shortest sliding window, counted like the minute and hour windows.
    #[default]
    Window,
    /// Token bucket holding `burst_limit` permits, refilled over `burst_window_secs`.
    Bucket,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RateLimitConfig {
    pub enabled: bool,
    pub requests_per_minute: u32,
    pub requests_per_hour: u32,
    pub burst_limit: u32,
    pub burst_window_secs: u64,
    pub burst_mode: BurstMode,
    /// Seconds between background sweeps of stale client history.
    pub cleanup_interval: u64,
    pub excluded_paths: Vec<String>,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            requests_per_minute: 60,
            requests_per_hour: 1000,
            burst_limit: 10,
            burst_window_secs: 1,
            burst_mode: BurstMode::Window,
            cleanup_interval: 300,
            excluded_paths: vec!["/healthcheck".to_string()],
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ImageConfig {
    pub max_file_size: usize,
    pub allowed_types: Vec<String>,
    pub min_width: u32,
    pub min_height: u32,
    pub max_width: u32,
    pub max_height: u32,
    pub fetch_timeout_ms: u64,
}

impl Default for ImageConfig {
    fn default() -> Self {
        Self {
            max_file_size: 10 * 1024 * 1024,
            allowed_types: vec![
                "image/jpeg".to_string(),
                "image/jpg".to_string(),
                "image/png".to_string(),
                "image/webp".to_string(),
            ],
            min_width: 100,
            min_height: 100,
            max_width: 4000,
            max_height: 4000,
            fetch_timeout_ms: 10_000,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct MetricsConfig {
    pub enable: bool,
    pub bind_addr: String,
    pub path: String,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            enable: false,
            bind_addr: "0.0.0.0:9090".to_string(),
            path: "/metrics".to_string(),
        }
    }
}

impl Config {
    pub fn validate(&self) -> Result<()> {
        let rl = &self.rate_limit;
        if rl.requests_per_minute == 0 || rl.requests_per_hour == 0 || rl.burst_limit == 0 {
            bail!("rate_limit limits must be positive");
        }
        if rl.burst_window_secs == 0 {
            bail!("rate_limit.burst_window_secs must be positive");
        }
        if rl.cleanup_interval == 0 {
            bail!("rate_limit.cleanup_interval must be positive");
        }
        if rl.requests_per_hour < rl.requests_per_minute {
            warn!(
                "requests_per_hour ({}) is below requests_per_minute ({})",
                rl.requests_per_hour, rl.requests_per_minute
            );
        }

        let img = &self.images;
        if img.max_file_size == 0 {
            bail!("images.max_file_size must be positive");
        }
        if img.min_width > img.max_width || img.min_height > img.max_height {
            bail!("images dimension bounds are inverted");
        }
        Ok(())
    }
}

pub fn load_config() -> Result<Config> {
    let config_path = env::var("CONFIG_PATH").unwrap_or_else(|_| "config.toml".to_string());

    if !Path::new(&config_path).exists() {
        warn!("Config file {} not found, using defaults", config_path);
        return Ok(Config::default());
    }

    let config_content = fs::read_to_string(&config_path)
        .with_context(|| format!("Failed to read config file: {}", config_path))?;

    parse_config(&config_content)
}

pub fn parse_config(content: &str) -> Result<Config> {
    let config: Config = toml::from_str(content)
        .with_context(|| "Failed to parse configuration")?;
    config.validate()?;
    Ok(config)
}
