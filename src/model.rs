//! Core data model: page images, OCR attempts, and resolved page results.

use std::collections::HashMap;
use std::time::Duration;

use chrono::{DateTime, Utc};
use image::{DynamicImage, GrayImage};
use serde::{Deserialize, Serialize};

use crate::error::PageError;

/// A preprocessed page image handed to the orchestrator.
///
/// Produced by an external preprocessing stage (deskew, denoise, format
/// conversion are not this crate's concern). Immutable for the duration of
/// one orchestration call; the orchestrator never persists it.
#[derive(Debug, Clone)]
pub struct PageImage {
    /// Zero-based page index within the document.
    pub page_number: u32,
    /// Grayscale pixel data.
    pub gray: GrayImage,
    /// Source scan resolution in dots per inch.
    pub dpi: u32,
}

impl PageImage {
    /// Build a page image from any decoded image, converting to grayscale.
    pub fn from_dynamic(page_number: u32, img: &DynamicImage, dpi: u32) -> Self {
        Self {
            page_number,
            gray: img.to_luma8(),
            dpi,
        }
    }

    /// Build a page image directly from grayscale pixels.
    pub fn from_gray(page_number: u32, gray: GrayImage, dpi: u32) -> Self {
        Self {
            page_number,
            gray,
            dpi,
        }
    }

    pub fn width(&self) -> u32 {
        self.gray.width()
    }

    pub fn height(&self) -> u32 {
        self.gray.height()
    }
}

/// Outcome of a single attempt against one backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AttemptOutcome {
    Success,
    Timeout,
    Error,
}

/// One (page, backend, retry) attempt record. Append-only, kept for audit.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OcrAttempt {
    /// Backend that ran this attempt.
    pub backend_id: String,
    pub started_at: DateTime<Utc>,
    pub duration: Duration,
    pub outcome: AttemptOutcome,
    /// Confidence score in [0, 1]. Zero for failed attempts.
    pub confidence: f32,
    /// Extracted text. Empty for failed attempts.
    pub text: String,
    /// Engine-specific structured output (key/value fields), if any.
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub structured_fields: HashMap<String, String>,
    /// Error detail for failed attempts.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl OcrAttempt {
    pub fn succeeded(&self) -> bool {
        self.outcome == AttemptOutcome::Success
    }
}

/// Merged output when multiple backends ran the same page.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EnsembleResult {
    pub text: String,
    /// Aggregate confidence in [0, 1], down-weighted under disagreement.
    pub confidence: f32,
    /// Backend ids whose attempts contributed to the vote.
    pub contributing_backends: Vec<String>,
    /// Similarity between the winning text and the runner-up, in [0, 1].
    pub agreement_score: f32,
}

/// How a page ultimately resolved.
#[derive(Debug, Clone)]
pub enum PageOutcome {
    /// A single backend's attempt won (Auto/Explicit routing, or a hybrid
    /// page where only one ensemble member survived).
    Single {
        backend_id: String,
        text: String,
        confidence: f32,
        structured_fields: HashMap<String, String>,
    },
    /// Reconciled output from two or more backends.
    Ensemble(EnsembleResult),
    /// Terminal failure after exhausting the routing plan.
    Failed(PageError),
}

impl PageOutcome {
    pub fn is_success(&self) -> bool {
        !matches!(self, PageOutcome::Failed(_))
    }
}

/// The resolved outcome for one page. Finalized at most once; late-arriving
/// attempts after finalization are discarded by the execution engine.
#[derive(Debug, Clone)]
pub struct PageResult {
    pub page_number: u32,
    pub outcome: PageOutcome,
    /// Full attempt history for this page, in dispatch order.
    pub attempts: Vec<OcrAttempt>,
    /// Set when the resolved confidence fell below the review floor.
    /// Flagged pages are for manual review, not automatic retry.
    pub needs_review: bool,
}

impl PageResult {
    /// Resolved text, if the page succeeded.
    pub fn text(&self) -> Option<&str> {
        match &self.outcome {
            PageOutcome::Single { text, .. } => Some(text),
            PageOutcome::Ensemble(e) => Some(&e.text),
            PageOutcome::Failed(_) => None,
        }
    }

    /// Resolved confidence, if the page succeeded.
    pub fn confidence(&self) -> Option<f32> {
        match &self.outcome {
            PageOutcome::Single { confidence, .. } => Some(*confidence),
            PageOutcome::Ensemble(e) => Some(e.confidence),
            PageOutcome::Failed(_) => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn page_outcome_success_classification() {
        let single = PageOutcome::Single {
            backend_id: "fast".into(),
            text: "hello".into(),
            confidence: 0.9,
            structured_fields: HashMap::new(),
        };
        assert!(single.is_success());

        let failed = PageOutcome::Failed(PageError::Cancelled);
        assert!(!failed.is_success());
    }

    #[test]
    fn page_result_text_accessor() {
        let result = PageResult {
            page_number: 0,
            outcome: PageOutcome::Ensemble(EnsembleResult {
                text: "merged".into(),
                confidence: 0.85,
                contributing_backends: vec!["a".into(), "b".into()],
                agreement_score: 0.97,
            }),
            attempts: Vec::new(),
            needs_review: false,
        };
        assert_eq!(result.text(), Some("merged"));
        assert_eq!(result.confidence(), Some(0.85));
    }
}
