//! Page complexity analysis.
//!
//! Scores how difficult a page image is expected to be for OCR, as a pure
//! function of its pixels. Five sub-metrics are each normalized to [0, 100],
//! combined as a configurable weighted sum, and mapped to a classification
//! band that drives backend routing.

use std::collections::HashMap;

use image::GrayImage;
use serde::{Deserialize, Serialize};

use crate::config::ComplexityConfig;
use crate::error::PageError;
use crate::model::PageImage;

/// Classification bands partition [0, 100]: `< simple_threshold` is Simple,
/// `>= complex_threshold` is Complex, everything between is Moderate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Classification {
    Simple,
    Moderate,
    Complex,
}

impl std::fmt::Display for Classification {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Classification::Simple => "simple",
            Classification::Moderate => "moderate",
            Classification::Complex => "complex",
        };
        write!(f, "{}", s)
    }
}

/// Result of analyzing one page. Computed once per page; immutable.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ComplexityScore {
    /// Weighted overall score, clamped to [0, 100].
    pub overall: f64,
    /// Per-metric scores, each in [0, 100], keyed by metric name.
    pub metrics: HashMap<String, f64>,
    pub classification: Classification,
}

/// Stateless analyzer parameterized by weights and thresholds.
#[derive(Debug, Clone)]
pub struct ComplexityAnalyzer {
    config: ComplexityConfig,
}

/// Gradient magnitude above which a pixel counts as an edge.
const EDGE_GRADIENT_THRESHOLD: i32 = 40;
/// Edge density that maps to the maximum layout contribution (~5% of pixels).
const EDGE_DENSITY_CEILING: f64 = 0.05;
/// Ink coverage band that scores zero text-density complexity.
const INK_BAND_LOW: f64 = 0.15;
const INK_BAND_HIGH: f64 = 0.35;
/// Megapixel band that scores zero resolution complexity.
const MEGAPIXEL_BAND_LOW: f64 = 2.0;
const MEGAPIXEL_BAND_HIGH: f64 = 5.0;
/// Megapixels at which over-resolution saturates to the maximum score.
const MEGAPIXEL_CEILING: f64 = 20.0;

impl ComplexityAnalyzer {
    pub fn new(config: ComplexityConfig) -> Self {
        Self { config }
    }

    /// Score one page. Fails only on malformed input.
    pub fn analyze(&self, page: &PageImage) -> Result<ComplexityScore, PageError> {
        let img = &page.gray;
        if img.width() == 0 || img.height() == 0 {
            return Err(PageError::InvalidImage(format!(
                "empty image ({}x{})",
                img.width(),
                img.height()
            )));
        }

        let mut metrics = HashMap::new();
        metrics.insert("image_quality".to_string(), image_quality_score(img));
        metrics.insert("layout".to_string(), layout_score(img));
        metrics.insert("text_density".to_string(), text_density_score(img));
        metrics.insert("noise".to_string(), noise_score(img));
        metrics.insert("resolution".to_string(), resolution_score(img));

        let w = &self.config.weights;
        let weighted = w.image_quality * metrics["image_quality"]
            + w.layout * metrics["layout"]
            + w.text_density * metrics["text_density"]
            + w.noise * metrics["noise"]
            + w.resolution * metrics["resolution"];
        let overall = (weighted / w.total()).clamp(0.0, 100.0);

        Ok(ComplexityScore {
            overall,
            metrics,
            classification: self.classify(overall),
        })
    }

    /// Map an overall score to its classification band.
    pub fn classify(&self, overall: f64) -> Classification {
        if overall < self.config.simple_threshold {
            Classification::Simple
        } else if overall < self.config.complex_threshold {
            Classification::Moderate
        } else {
            Classification::Complex
        }
    }
}

/// Combined contrast and sharpness metric. Washed-out or blurry scans score
/// high complexity.
fn image_quality_score(img: &GrayImage) -> f64 {
    let n = (img.width() as u64 * img.height() as u64) as f64;

    let mut sum = 0.0;
    for p in img.pixels() {
        sum += p.0[0] as f64;
    }
    let mean = sum / n;

    let mut var_sum = 0.0;
    for p in img.pixels() {
        let d = p.0[0] as f64 - mean;
        var_sum += d * d;
    }
    let std_dev = (var_sum / n).sqrt();
    // A std-dev of 64+ on an 8-bit page is comfortably bimodal ink-on-paper.
    let contrast = (std_dev / 64.0).min(1.0);

    let sharpness = (mean_abs_laplacian(img) / 16.0).min(1.0);

    (1.0 - (contrast + sharpness) / 2.0) * 100.0
}

/// Mean absolute response of the 4-neighbor Laplacian over interior pixels.
fn mean_abs_laplacian(img: &GrayImage) -> f64 {
    let (w, h) = (img.width(), img.height());
    if w < 3 || h < 3 {
        return 0.0;
    }
    let mut total = 0.0;
    for y in 1..h - 1 {
        for x in 1..w - 1 {
            let c = img.get_pixel(x, y).0[0] as i32;
            let lap = img.get_pixel(x - 1, y).0[0] as i32
                + img.get_pixel(x + 1, y).0[0] as i32
                + img.get_pixel(x, y - 1).0[0] as i32
                + img.get_pixel(x, y + 1).0[0] as i32
                - 4 * c;
            total += lap.abs() as f64;
        }
    }
    total / ((w - 2) as f64 * (h - 2) as f64)
}

/// Edge-pixel density as a proxy for layout complexity. Tables, figures,
/// and multi-column layouts produce dense edges.
fn layout_score(img: &GrayImage) -> f64 {
    let (w, h) = (img.width(), img.height());
    if w < 2 || h < 2 {
        return 0.0;
    }
    let mut edges = 0u64;
    for y in 0..h - 1 {
        for x in 0..w - 1 {
            let c = img.get_pixel(x, y).0[0] as i32;
            let dx = (img.get_pixel(x + 1, y).0[0] as i32 - c).abs();
            let dy = (img.get_pixel(x, y + 1).0[0] as i32 - c).abs();
            if dx + dy > EDGE_GRADIENT_THRESHOLD {
                edges += 1;
            }
        }
    }
    let density = edges as f64 / ((w - 1) as f64 * (h - 1) as f64);
    (density / EDGE_DENSITY_CEILING).min(1.0) * 100.0
}

/// U-shaped ink coverage penalty: both near-blank and ink-flooded pages are
/// hard; an ordinary typed page sits in the 15-35% band.
fn text_density_score(img: &GrayImage) -> f64 {
    let n = (img.width() as u64 * img.height() as u64) as f64;
    let mut sum = 0u64;
    for p in img.pixels() {
        sum += p.0[0] as u64;
    }
    let mean = sum as f64 / n;
    // Binarize against a threshold relative to the page's own brightness.
    let threshold = (mean * 0.75).min(200.0);

    let mut dark = 0u64;
    for p in img.pixels() {
        if (p.0[0] as f64) < threshold {
            dark += 1;
        }
    }
    let coverage = dark as f64 / n;

    if coverage < INK_BAND_LOW {
        (INK_BAND_LOW - coverage) / INK_BAND_LOW * 100.0
    } else if coverage > INK_BAND_HIGH {
        ((coverage - INK_BAND_HIGH) / (1.0 - INK_BAND_HIGH) * 100.0).min(100.0)
    } else {
        0.0
    }
}

/// Salt-and-pepper noise estimate: mean absolute difference between the
/// image and its 3x3 median filter.
fn noise_score(img: &GrayImage) -> f64 {
    let (w, h) = (img.width(), img.height());
    if w < 3 || h < 3 {
        return 0.0;
    }
    let mut total = 0.0;
    let mut window = [0u8; 9];
    for y in 1..h - 1 {
        for x in 1..w - 1 {
            let mut i = 0;
            for dy in 0..3 {
                for dx in 0..3 {
                    window[i] = img.get_pixel(x + dx - 1, y + dy - 1).0[0];
                    i += 1;
                }
            }
            window.sort_unstable();
            let median = window[4];
            let c = img.get_pixel(x, y).0[0];
            total += (c as i32 - median as i32).abs() as f64;
        }
    }
    let mean_diff = total / ((w - 2) as f64 * (h - 2) as f64);
    (mean_diff / 24.0).min(1.0) * 100.0
}

/// Banded resolution penalty: under-resolved text is unreadable, heavily
/// over-resolved scans blow up engine memory and latency.
fn resolution_score(img: &GrayImage) -> f64 {
    let mp = img.width() as f64 * img.height() as f64 / 1_000_000.0;
    if mp < MEGAPIXEL_BAND_LOW {
        (MEGAPIXEL_BAND_LOW - mp) / MEGAPIXEL_BAND_LOW * 100.0
    } else if mp > MEGAPIXEL_BAND_HIGH {
        ((mp - MEGAPIXEL_BAND_HIGH) / (MEGAPIXEL_CEILING - MEGAPIXEL_BAND_HIGH) * 100.0).min(100.0)
    } else {
        0.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::Luma;

    fn analyzer() -> ComplexityAnalyzer {
        ComplexityAnalyzer::new(ComplexityConfig::default())
    }

    fn flat_page(w: u32, h: u32, value: u8) -> PageImage {
        let img = GrayImage::from_pixel(w, h, Luma([value]));
        PageImage::from_gray(0, img, 300)
    }

    /// A page with crisp text-like strokes: white background, dark rows.
    fn striped_page(w: u32, h: u32) -> PageImage {
        let img = GrayImage::from_fn(w, h, |_, y| {
            if y % 8 < 2 {
                Luma([10u8])
            } else {
                Luma([245u8])
            }
        });
        PageImage::from_gray(0, img, 300)
    }

    #[test]
    fn rejects_empty_image() {
        let page = flat_page(0, 0, 128);
        assert!(matches!(
            analyzer().analyze(&page),
            Err(PageError::InvalidImage(_))
        ));
    }

    #[test]
    fn overall_always_in_bounds() {
        for page in [
            flat_page(64, 64, 0),
            flat_page(64, 64, 255),
            flat_page(2048, 1536, 128),
            striped_page(200, 200),
        ] {
            let score = analyzer().analyze(&page).unwrap();
            assert!((0.0..=100.0).contains(&score.overall), "{}", score.overall);
            for (name, value) in &score.metrics {
                assert!((0.0..=100.0).contains(value), "{name}: {value}");
            }
        }
    }

    #[test]
    fn classification_bands_partition_range() {
        let a = analyzer();
        assert_eq!(a.classify(0.0), Classification::Simple);
        assert_eq!(a.classify(29.999), Classification::Simple);
        assert_eq!(a.classify(30.0), Classification::Moderate);
        assert_eq!(a.classify(59.999), Classification::Moderate);
        assert_eq!(a.classify(60.0), Classification::Complex);
        assert_eq!(a.classify(100.0), Classification::Complex);
    }

    #[test]
    fn blank_page_scores_high_quality_complexity() {
        // Flat gray: no contrast, no sharpness, no edges.
        let score = analyzer().analyze(&flat_page(100, 100, 128)).unwrap();
        assert_eq!(score.metrics["image_quality"], 100.0);
        assert_eq!(score.metrics["layout"], 0.0);
    }

    #[test]
    fn striped_page_scores_better_quality_than_blank() {
        let blank = analyzer().analyze(&flat_page(200, 200, 128)).unwrap();
        let striped = analyzer().analyze(&striped_page(200, 200)).unwrap();
        assert!(striped.metrics["image_quality"] < blank.metrics["image_quality"]);
    }

    #[test]
    fn text_density_penalty_is_u_shaped() {
        // Near-blank page: almost no ink, high penalty.
        let blank = analyzer().analyze(&flat_page(100, 100, 250)).unwrap();
        assert!(blank.metrics["text_density"] > 80.0);

        // Striped page: 25% ink coverage sits inside the optimal band.
        let striped = analyzer().analyze(&striped_page(100, 100)).unwrap();
        assert_eq!(striped.metrics["text_density"], 0.0);
    }

    #[test]
    fn resolution_band_is_u_shaped() {
        // Tiny thumbnail: far under-resolved.
        let tiny = analyzer().analyze(&flat_page(100, 100, 128)).unwrap();
        assert!(tiny.metrics["resolution"] > 90.0);

        // ~3 MP page sits in the target band.
        let normal = analyzer().analyze(&flat_page(2048, 1536, 128)).unwrap();
        assert_eq!(normal.metrics["resolution"], 0.0);
    }

    #[test]
    fn analysis_is_deterministic() {
        let page = striped_page(150, 150);
        let a = analyzer().analyze(&page).unwrap();
        let b = analyzer().analyze(&page).unwrap();
        assert_eq!(a.overall, b.overall);
        assert_eq!(a.classification, b.classification);
    }

    #[test]
    fn custom_thresholds_shift_bands() {
        let a = ComplexityAnalyzer::new(ComplexityConfig {
            simple_threshold: 10.0,
            complex_threshold: 20.0,
            ..ComplexityConfig::default()
        });
        assert_eq!(a.classify(15.0), Classification::Moderate);
        assert_eq!(a.classify(25.0), Classification::Complex);
    }
}
