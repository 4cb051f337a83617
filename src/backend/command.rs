//! Subprocess OCR backend.
//!
//! Runs a command-line OCR engine (tesseract-style) against a temp PNG of
//! the page and reads text from stdout. Engines that report no confidence
//! get an estimate from the recognizable-character ratio of their output, so
//! ensemble weighting still has something to work with.

use std::path::{Path, PathBuf};
use std::process::Stdio;

use async_trait::async_trait;
use tokio::process::Command;

use super::{BackendOutput, OcrBackend};
use crate::error::AttemptError;
use crate::model::PageImage;

/// OCR backend that shells out to an external binary.
pub struct CommandBackend {
    program: String,
    /// Argument template; `{image}` expands to the page's temp file path.
    args: Vec<String>,
}

impl CommandBackend {
    /// Tesseract-compatible invocation: `<program> <image> stdout -l eng`.
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: vec![
                "{image}".to_string(),
                "stdout".to_string(),
                "-l".to_string(),
                "eng".to_string(),
            ],
        }
    }

    pub fn with_args(program: impl Into<String>, args: Vec<String>) -> Self {
        Self {
            program: program.into(),
            args,
        }
    }

    fn expand_args(&self, image_path: &Path) -> Vec<String> {
        self.args
            .iter()
            .map(|a| a.replace("{image}", &image_path.to_string_lossy()))
            .collect()
    }

    fn binary_path(&self) -> Option<PathBuf> {
        which::which(&self.program).ok()
    }
}

#[async_trait]
impl OcrBackend for CommandBackend {
    fn is_available(&self) -> bool {
        self.binary_path().is_some()
    }

    fn availability_hint(&self) -> String {
        match self.binary_path() {
            Some(path) => format!("{} found at {}", self.program, path.display()),
            None => format!("install {} and ensure it is in PATH", self.program),
        }
    }

    async fn recognize(&self, page: &PageImage) -> Result<BackendOutput, AttemptError> {
        let dir = tempfile::tempdir()
            .map_err(|e| AttemptError::Execution(format!("temp dir: {}", e)))?;
        let image_path = dir.path().join(format!("page-{}.png", page.page_number));
        page.gray
            .save(&image_path)
            .map_err(|e| AttemptError::Execution(format!("write page image: {}", e)))?;

        let output = Command::new(&self.program)
            .args(self.expand_args(&image_path))
            .stdin(Stdio::null())
            .output()
            .await;

        match output {
            Ok(output) if output.status.success() => {
                let text = String::from_utf8_lossy(&output.stdout).trim().to_string();
                let confidence = estimate_confidence(&text);
                Ok(BackendOutput::plain(text, confidence))
            }
            Ok(output) => {
                let stderr = String::from_utf8_lossy(&output.stderr);
                Err(AttemptError::Execution(format!(
                    "{} exited with {}: {}",
                    self.program,
                    output.status,
                    stderr.trim()
                )))
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Err(AttemptError::Execution(
                format!("{} not found in PATH", self.program),
            )),
            Err(e) => Err(AttemptError::Execution(format!(
                "failed to run {}: {}",
                self.program, e
            ))),
        }
    }
}

/// Cheap confidence proxy for engines that report none: the fraction of
/// output characters that look like recognized text rather than garbage.
fn estimate_confidence(text: &str) -> f32 {
    if text.is_empty() {
        return 0.0;
    }
    let total = text.chars().count();
    let clean = text
        .chars()
        .filter(|c| c.is_alphanumeric() || c.is_whitespace() || c.is_ascii_punctuation())
        .count();
    clean as f32 / total as f32
}
