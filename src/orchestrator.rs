//! Orchestration facade.
//!
//! One call per document: a finite, ordered set of page images in, a
//! finalized `ProcessingJob` out. Pages are analyzed, routed, and executed
//! concurrently (bounded by the resource pools); the caller owns persistence
//! and notification of the returned aggregate.

use std::sync::Arc;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::complexity::ComplexityAnalyzer;
use crate::config::OrchestratorConfig;
use crate::error::PageError;
use crate::execution::ExecutionEngine;
use crate::job::{JobEvent, JobTracker, ProcessingJob};
use crate::model::{PageImage, PageOutcome, PageResult};
use crate::registry::BackendRegistry;
use crate::router::{BackendRouter, RoutingMode};

/// One document's worth of work.
pub struct DocumentRequest {
    pub document_id: String,
    /// Ordered page images. Page count is known up front; this is one call,
    /// not a stream.
    pub pages: Vec<PageImage>,
    pub mode: RoutingMode,
    /// Optional document-type hint consulted by Auto routing.
    pub doc_type_hint: Option<String>,
}

/// Top-level orchestrator wiring analyzer, router, engine, and job state.
pub struct Orchestrator {
    analyzer: ComplexityAnalyzer,
    router: Arc<BackendRouter>,
    engine: Arc<ExecutionEngine>,
    registry: Arc<BackendRegistry>,
}

impl Orchestrator {
    /// Build from configuration and a populated registry.
    pub fn new(config: OrchestratorConfig, registry: BackendRegistry) -> Self {
        let config = Arc::new(config);
        let registry = Arc::new(registry);
        let router = Arc::new(BackendRouter::new(
            registry.clone(),
            config.routing.clone(),
            config.ensemble.clone(),
            config.pools.clone(),
        ));
        let engine = Arc::new(ExecutionEngine::new(registry.clone(), config.clone()));
        Self {
            analyzer: ComplexityAnalyzer::new(config.complexity.clone()),
            router,
            engine,
            registry,
        }
    }

    pub fn registry(&self) -> &Arc<BackendRegistry> {
        &self.registry
    }

    /// Process one document to completion (or cancellation).
    ///
    /// Pages run concurrently, bounded by the per-resource-class pools.
    /// Cancelling the token cancels every outstanding page attempt for this
    /// document and releases their pool slots; pages already finalized are
    /// retained in the returned job.
    pub async fn process_document(
        &self,
        request: DocumentRequest,
        cancel: CancellationToken,
        event_tx: mpsc::Sender<JobEvent>,
    ) -> ProcessingJob {
        let tracker = Arc::new(JobTracker::new(&request.document_id, request.pages.len()));
        info!(
            document_id = %request.document_id,
            pages = request.pages.len(),
            mode = ?request.mode,
            "processing document"
        );
        let _ = event_tx
            .send(JobEvent::JobStarted {
                document_id: request.document_id.clone(),
                total_pages: request.pages.len(),
            })
            .await;
        tracker.start();

        let mut handles = Vec::with_capacity(request.pages.len());
        for page in request.pages {
            let analyzer = self.analyzer.clone();
            let router = self.router.clone();
            let engine = self.engine.clone();
            let tracker = tracker.clone();
            let cancel = cancel.clone();
            let event_tx = event_tx.clone();
            let mode = request.mode.clone();
            let hint = request.doc_type_hint.clone();

            handles.push(tokio::spawn(async move {
                let page_number = page.page_number;
                let _ = event_tx.send(JobEvent::PageStarted { page_number }).await;

                let result =
                    process_page(&analyzer, &router, &engine, page, &mode, hint, &cancel).await;

                // A cancelled page never finalized; it is not recorded and
                // leaves no result behind.
                if matches!(result.outcome, PageOutcome::Failed(PageError::Cancelled)) {
                    return;
                }
                let event = match &result.outcome {
                    PageOutcome::Failed(e) => JobEvent::PageFailed {
                        page_number,
                        error: e.to_string(),
                    },
                    _ => JobEvent::PageCompleted {
                        page_number,
                        needs_review: result.needs_review,
                    },
                };
                tracker.record_page(result);
                let _ = event_tx.send(event).await;
            }));
        }

        for handle in handles {
            let _ = handle.await;
        }

        if cancel.is_cancelled() {
            tracker.mark_cancelled();
        }
        let job = tracker.finalize();
        info!(
            document_id = %job.document_id,
            status = ?job.status,
            pages = job.pages.len(),
            "document finalized"
        );
        let _ = event_tx
            .send(JobEvent::JobFinalized {
                document_id: job.document_id.clone(),
                status: job.status,
            })
            .await;
        job
    }
}

/// Analyze, route, and execute one page. Every terminal error becomes the
/// page's outcome; nothing propagates as a panic or early return past here.
async fn process_page(
    analyzer: &ComplexityAnalyzer,
    router: &BackendRouter,
    engine: &ExecutionEngine,
    page: PageImage,
    mode: &RoutingMode,
    doc_type_hint: Option<String>,
    cancel: &CancellationToken,
) -> PageResult {
    let score = match analyzer.analyze(&page) {
        Ok(score) => score,
        // Malformed input is terminal immediately; no retry can fix it.
        Err(e) => {
            return PageResult {
                page_number: page.page_number,
                outcome: PageOutcome::Failed(e),
                attempts: Vec::new(),
                needs_review: false,
            }
        }
    };
    debug!(
        page = page.page_number,
        overall = score.overall,
        classification = %score.classification,
        "page analyzed"
    );

    let plan = match router.route(&score, doc_type_hint.as_deref(), mode) {
        Ok(plan) => plan,
        // Explicit-mode unavailability fails fast, no substitution.
        Err(e) => {
            return PageResult {
                page_number: page.page_number,
                outcome: PageOutcome::Failed(e),
                attempts: Vec::new(),
                needs_review: false,
            }
        }
    };

    engine.execute(&page, &plan, cancel).await
}
