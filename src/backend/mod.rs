//! OCR backend abstraction.
//!
//! Each engine implements a single `recognize` capability and is registered
//! by id in the backend registry; routing and the execution engine only ever
//! see the trait. Engine internals (model loading, device placement) belong
//! to the implementations, not this crate.

mod command;

pub use command::CommandBackend;

use std::collections::HashMap;

use async_trait::async_trait;

use crate::error::AttemptError;
use crate::model::PageImage;

/// Raw output of one successful backend run.
#[derive(Debug, Clone)]
pub struct BackendOutput {
    pub text: String,
    /// Confidence in [0, 1].
    pub confidence: f32,
    /// Engine-specific structured fields, if the engine produces any.
    pub structured_fields: HashMap<String, String>,
}

impl BackendOutput {
    pub fn plain(text: String, confidence: f32) -> Self {
        Self {
            text,
            confidence,
            structured_fields: HashMap::new(),
        }
    }
}

/// Trait for OCR engines.
///
/// Implementations must be cancellation-safe: the execution engine drops the
/// `recognize` future on timeout or job cancellation.
#[async_trait]
pub trait OcrBackend: Send + Sync {
    /// Check whether this backend can run (binaries present, models loaded).
    fn is_available(&self) -> bool {
        true
    }

    /// What is needed to make this backend available.
    fn availability_hint(&self) -> String {
        "available".to_string()
    }

    /// Run recognition on one page. The caller enforces the per-attempt
    /// timeout; implementations should not retry internally.
    async fn recognize(&self, page: &PageImage) -> Result<BackendOutput, AttemptError>;
}
