use axum::http::StatusCode;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub status_code: u16,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<serde_json::Value>,
}

impl ErrorResponse {
    pub fn new(status: StatusCode, message: impl Into<String>) -> Self {
        Self {
            status_code: status.as_u16(),
            message: message.into(),
            details: None,
        }
    }

    pub fn with_details(mut self, details: serde_json::Value) -> Self {
        self.details = Some(details);
        self
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PredictionResponse {
    pub rating: f64,
    pub confidence: f64,
    pub explanation: String,
}

impl PredictionResponse {
    /// Clamps to the valid ranges and rounds both figures to one decimal.
    pub fn new(rating: f64, confidence: f64, explanation: String) -> Self {
        Self {
            rating: round1(rating.clamp(1.0, 5.0)),
            confidence: round1(confidence.clamp(0.0, 100.0)),
            explanation: explanation.trim().to_string(),
        }
    }
}

fn round1(v: f64) -> f64 {
    (v * 10.0).round() / 10.0
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: String,
    pub version: String,
    pub timestamp: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PredictionMode {
    Auto,
    RuleBased,
    Ai,
    Ensemble,
}

impl PredictionMode {
    pub const ALL: [PredictionMode; 4] = [
        PredictionMode::Auto,
        PredictionMode::RuleBased,
        PredictionMode::Ai,
        PredictionMode::Ensemble,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            PredictionMode::Auto => "auto",
            PredictionMode::RuleBased => "rule_based",
            PredictionMode::Ai => "ai",
            PredictionMode::Ensemble => "ensemble",
        }
    }

    pub fn description(&self) -> &'static str {
        match self {
            PredictionMode::Auto => "Automatically selects the best available prediction method",
            PredictionMode::RuleBased => "Uses rule-based heuristics for prediction",
            PredictionMode::Ai => "Uses AI models for more accurate predictions",
            PredictionMode::Ensemble => "Combines rule-based and AI predictions for best results",
        }
    }

    pub fn needs_ai(&self) -> bool {
        matches!(self, PredictionMode::Ai | PredictionMode::Ensemble)
    }
}

impl fmt::Display for PredictionMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for PredictionMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        PredictionMode::ALL
            .into_iter()
            .find(|m| m.as_str() == s)
            .ok_or_else(|| {
                let names: Vec<_> = PredictionMode::ALL.iter().map(|m| m.as_str()).collect();
                format!("Invalid mode. Must be one of: {}", names.join(", "))
            })
    }
}
