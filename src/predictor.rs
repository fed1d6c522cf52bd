use once_cell::sync::Lazy;
use rand::Rng;
use std::collections::HashSet;
use tracing::{debug, info};

use crate::imaging::ImageSample;
use crate::models::{PredictionMode, PredictionResponse};

static POSITIVE_KEYWORDS: Lazy<HashSet<&'static str>> = Lazy::new(|| {
    [
        "premium", "luxury", "professional", "high-quality", "deluxe", "advanced",
        "superior", "excellent", "top-rated", "bestseller", "award-winning",
        "certified", "authentic", "original", "branded", "flagship",
    ]
    .into_iter()
    .collect()
});

static NEGATIVE_KEYWORDS: Lazy<HashSet<&'static str>> = Lazy::new(|| {
    [
        "cheap", "basic", "simple", "budget", "economy", "generic",
        "knockoff", "imitation", "replica", "used", "refurbished",
    ]
    .into_iter()
    .collect()
});

static TECH_KEYWORDS: Lazy<HashSet<&'static str>> = Lazy::new(|| {
    [
        "wireless", "bluetooth", "smart", "digital", "hd", "4k", "led",
        "rechargeable", "waterproof", "durable", "ergonomic", "portable",
    ]
    .into_iter()
    .collect()
});

static BRAND_KEYWORDS: Lazy<HashSet<&'static str>> = Lazy::new(|| {
    ["apple", "samsung", "sony", "nike", "adidas", "canon", "nikon"]
        .into_iter()
        .collect()
});

const STANDARD_RATIOS: [f64; 5] = [1.0, 4.0 / 3.0, 3.0 / 2.0, 16.0 / 9.0, 16.0 / 10.0];
const CONTRAST_SAMPLE: usize = 1000;
const BASE_RATING: f64 = 3.0;
pub const RATING_JITTER: f64 = 0.15;

/// Substring hits, so "hd" also counts inside "hdmi".
fn count_hits(haystack: &str, keywords: &HashSet<&'static str>) -> usize {
    keywords.iter().filter(|k| haystack.contains(*k)).count()
}

fn has_double_capital(title: &str) -> bool {
    title
        .as_bytes()
        .windows(2)
        .any(|w| w[0].is_ascii_uppercase() && w[1].is_ascii_uppercase())
}

#[derive(Debug, Clone, PartialEq)]
pub struct TitleAnalysis {
    pub length: f64,
    pub positive: f64,
    pub tech: f64,
    pub brand: f64,
    pub penalty: f64,
    pub pattern: f64,
    pub word_count: usize,
}

impl TitleAnalysis {
    pub fn of(title: &str) -> Self {
        let lower = title.to_lowercase();
        let positive = count_hits(&lower, &POSITIVE_KEYWORDS) as f64;
        let negative = count_hits(&lower, &NEGATIVE_KEYWORDS) as f64;
        let tech = count_hits(&lower, &TECH_KEYWORDS) as f64;
        let brand = count_hits(&lower, &BRAND_KEYWORDS) as f64;

        let has_digit = title.chars().any(|c| c.is_ascii_digit());
        let pattern = 0.1 * (has_digit as u8 + has_double_capital(title) as u8) as f64;

        Self {
            length: (title.chars().count() as f64 / 50.0).min(1.0),
            positive: (positive * 0.3).min(1.0),
            tech: (tech * 0.2).min(0.8),
            brand: (brand * 0.4).min(1.0),
            penalty: (negative * 0.4).min(1.0),
            pattern,
            word_count: title.split_whitespace().count(),
        }
    }

    pub fn score(&self) -> f64 {
        self.length * 0.15 + self.positive * 0.35 + self.tech * 0.25 + self.brand * 0.25
            + self.pattern * 0.15
            - self.penalty * 0.4
    }

    fn indicators(&self) -> f64 {
        self.positive + self.tech + self.brand + self.pattern
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ImageAnalysis {
    pub resolution: f64,
    pub aspect: f64,
    pub brightness: f64,
    pub contrast: f64,
}

impl ImageAnalysis {
    /// Neutral-to-low scores used when no image was supplied.
    pub const ABSENT: ImageAnalysis = ImageAnalysis {
        resolution: 0.4,
        aspect: 0.5,
        brightness: 0.5,
        contrast: 0.4,
    };

    pub fn of(image: Option<&ImageSample>) -> Self {
        let Some(sample) = image else {
            return Self::ABSENT;
        };
        if sample.width == 0 || sample.height == 0 {
            return Self::ABSENT;
        }

        let resolution = (sample.pixel_count() as f64 / 1_000_000.0).min(1.0);
        let ratio = sample.width as f64 / sample.height as f64;
        let closest = STANDARD_RATIOS
            .iter()
            .map(|r| (ratio - r).abs())
            .fold(f64::INFINITY, f64::min);
        let aspect = (1.0 - closest).max(0.5);

        // RGBA images are scored flat; everything else is read from its luma.
        let (brightness, contrast) = if sample.is_rgba || sample.luma.is_empty() {
            (0.7, 0.7)
        } else {
            let mean = sample.luma.iter().map(|&p| p as f64).sum::<f64>() / sample.luma.len() as f64;
            let head = &sample.luma[..sample.luma.len().min(CONTRAST_SAMPLE)];
            let variance =
                head.iter().map(|&p| (p as f64 - mean).powi(2)).sum::<f64>() / head.len() as f64;
            (1.0 - (mean - 128.0).abs() / 128.0, (variance / 2000.0).min(1.0))
        };

        Self {
            resolution,
            aspect,
            brightness,
            contrast,
        }
    }

    pub fn score(&self) -> f64 {
        self.resolution * 0.3 + self.aspect * 0.2 + self.brightness * 0.25 + self.contrast * 0.25
    }

    fn mean(&self) -> f64 {
        (self.resolution + self.aspect + self.brightness + self.contrast) / 4.0
    }
}

fn explain(title: &TitleAnalysis, image: &ImageAnalysis, rating: f64) -> String {
    let mut notes = Vec::new();

    if title.positive > 0.2 {
        notes.push("The title includes premium quality indicators");
    }
    if title.tech > 0.1 {
        notes.push("Technical features mentioned suggest good functionality");
    }
    if title.brand > 0.2 {
        notes.push("Recognizable brand name adds credibility");
    }
    if title.penalty > 0.2 {
        notes.push("Some keywords suggest budget positioning");
    }

    if image.resolution > 0.7 {
        notes.push("High-resolution image suggests professional presentation");
    } else if image.resolution < 0.3 {
        notes.push("Low image resolution may impact perceived quality");
    }
    if image.brightness > 0.7 {
        notes.push("Well-lit product photo enhances appeal");
    }

    let summary = if rating >= 4.5 {
        "This product shows strong indicators of high customer satisfaction"
    } else if rating >= 4.0 {
        "This product appears likely to receive positive customer ratings"
    } else if rating >= 3.5 {
        "This product shows moderate appeal to customers"
    } else if rating >= 3.0 {
        "This product has average market appeal"
    } else {
        "This product may face challenges in customer satisfaction"
    };

    if notes.is_empty() {
        format!("{} based on general product presentation", summary)
    } else {
        format!("{}. {}", notes.join(". "), summary)
    }
}

/// Heuristic rating from title keywords and basic image statistics.
#[derive(Debug, Default, Clone, Copy)]
pub struct RuleBasedPredictor;

impl RuleBasedPredictor {
    pub fn new() -> Self {
        Self
    }

    /// Deterministic core of [`predict`](Self::predict); `jitter` is added to the raw rating.
    pub fn score(&self, title: &str, image: Option<&ImageSample>, jitter: f64) -> PredictionResponse {
        let title_analysis = TitleAnalysis::of(title);
        let image_analysis = ImageAnalysis::of(image);

        let combined = title_analysis.score() * 0.4 + image_analysis.score() * 0.6;
        let rating = (BASE_RATING + combined * 2.5 + jitter).clamp(1.0, 5.0);

        let confidence =
            ((title_analysis.indicators() * 0.4 + image_analysis.mean() * 0.6) * 100.0).clamp(60.0, 95.0);

        debug!(
            words = title_analysis.word_count,
            title_score = title_analysis.score(),
            image_score = image_analysis.score(),
            rating,
            confidence,
            "Scored product"
        );

        let explanation = explain(&title_analysis, &image_analysis, rating);
        PredictionResponse::new(rating, confidence, explanation)
    }

    pub fn predict(&self, title: &str, image: Option<&ImageSample>) -> PredictionResponse {
        let jitter = rand::rng().random_range(-RATING_JITTER..=RATING_JITTER);
        self.score(title, image, jitter)
    }
}

/// Dispatches a prediction mode to an available predictor.
#[derive(Debug, Default, Clone)]
pub struct Predictor {
    rule_based: RuleBasedPredictor,
}

impl Predictor {
    pub fn new() -> Self {
        Self::default()
    }

    /// No model-backed predictor is wired in, so AI modes are never available.
    pub fn ai_available(&self) -> bool {
        false
    }

    pub fn rule_based(&self) -> &RuleBasedPredictor {
        &self.rule_based
    }

    pub fn predict(
        &self,
        title: &str,
        image: Option<&ImageSample>,
        mode: PredictionMode,
    ) -> PredictionResponse {
        if mode.needs_ai() && !self.ai_available() {
            info!(mode = %mode, "AI prediction unavailable, using rule-based predictor");
        }
        self.rule_based.predict(title, image)
    }
}
