//! textmill - complexity-driven OCR orchestration.
//!
//! Scores each incoming page for processing difficulty, selects one or more
//! OCR backends under VRAM/CPU capacity constraints, dispatches work with
//! bounded concurrency, per-attempt timeouts, and retry/fallback
//! escalation, and reconciles parallel backend outputs into a single result
//! via confidence-weighted voting.
//!
//! The orchestrator consumes preprocessed page images and produces OCR
//! results; ingestion, storage, and notification belong to the caller.
//!
//! ## Pipeline
//!
//! Complexity Analyzer -> Backend Router -> Execution Engine
//! (-> Ensemble Reconciler in hybrid mode) -> Job State Machine.
//!
//! ```no_run
//! use textmill::config::OrchestratorConfig;
//! use textmill::orchestrator::{DocumentRequest, Orchestrator};
//! use textmill::registry::BackendRegistry;
//! use textmill::router::RoutingMode;
//! use tokio_util::sync::CancellationToken;
//!
//! # async fn example(pages: Vec<textmill::model::PageImage>) {
//! let config = OrchestratorConfig::default();
//! let registry = BackendRegistry::new(config.health.clone());
//! // ... register backends ...
//! let orchestrator = Orchestrator::new(config, registry);
//!
//! let (events, _rx) = tokio::sync::mpsc::channel(64);
//! let job = orchestrator
//!     .process_document(
//!         DocumentRequest {
//!             document_id: "doc-42".into(),
//!             pages,
//!             mode: RoutingMode::Auto,
//!             doc_type_hint: None,
//!         },
//!         CancellationToken::new(),
//!         events,
//!     )
//!     .await;
//! # }
//! ```

pub mod backend;
pub mod cli;
pub mod complexity;
pub mod config;
pub mod ensemble;
pub mod error;
pub mod execution;
pub mod job;
pub mod model;
pub mod orchestrator;
pub mod registry;
pub mod router;

pub use complexity::{Classification, ComplexityAnalyzer, ComplexityScore};
pub use config::OrchestratorConfig;
pub use error::{AttemptError, PageError};
pub use job::{JobEvent, JobStatus, ProcessingJob};
pub use model::{EnsembleResult, OcrAttempt, PageImage, PageOutcome, PageResult};
pub use orchestrator::{DocumentRequest, Orchestrator};
pub use registry::BackendRegistry;
pub use router::{RoutingMode, RoutingPlan};
