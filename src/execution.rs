//! Execution engine: dispatches pages to backends under resource limits.
//!
//! Each resource class has one bounded pool. GPU pools are VRAM-weighted
//! semaphores: the semaphore holds the device's budget in MB and an attempt
//! acquires its backend's per-job requirement, so concurrency per backend is
//! exactly budget divided by requirement. The CPU pool holds one permit per
//! worker.
//!
//! Auto/Explicit plans are tried strictly in order: bounded retries with
//! exponential backoff and jitter on the same backend, immediate fallback to
//! the next backend (recovery here is latency-bounded, so there is nothing
//! to be polite to). Hybrid plans dispatch every ensemble member
//! concurrently and reconcile whatever survives. All suspension points
//! (pool acquisition, backoff sleeps, attempts in flight) honor
//! cancellation.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::config::{BackendSpec, OrchestratorConfig, ResourceClass};
use crate::ensemble::EnsembleReconciler;
use crate::error::{AttemptError, PageError};
use crate::model::{AttemptOutcome, OcrAttempt, PageImage, PageOutcome, PageResult};
use crate::registry::{BackendRegistry, RegisteredBackend};
use crate::router::RoutingPlan;

/// One bounded semaphore per resource class.
pub struct ResourcePools {
    gpu_a: Arc<Semaphore>,
    gpu_b: Arc<Semaphore>,
    cpu: Arc<Semaphore>,
}

impl ResourcePools {
    pub fn new(config: &crate::config::PoolConfig) -> Self {
        Self {
            gpu_a: Arc::new(Semaphore::new(config.gpu_a_vram_mb as usize)),
            gpu_b: Arc::new(Semaphore::new(config.gpu_b_vram_mb as usize)),
            cpu: Arc::new(Semaphore::new(config.effective_cpu_workers() as usize)),
        }
    }

    /// Wait for capacity for one attempt. GPU attempts hold their VRAM
    /// requirement in permits for the duration of the attempt.
    async fn acquire(&self, spec: &BackendSpec) -> OwnedSemaphorePermit {
        match spec.resource_class {
            ResourceClass::Cpu => self
                .cpu
                .clone()
                .acquire_owned()
                .await
                .expect("cpu pool closed"),
            ResourceClass::GpuA => self
                .gpu_a
                .clone()
                .acquire_many_owned(spec.vram_required_mb)
                .await
                .expect("gpu_a pool closed"),
            ResourceClass::GpuB => self
                .gpu_b
                .clone()
                .acquire_many_owned(spec.vram_required_mb)
                .await
                .expect("gpu_b pool closed"),
        }
    }

    /// Free permits currently available for a class (diagnostics).
    pub fn available(&self, class: ResourceClass) -> usize {
        match class {
            ResourceClass::GpuA => self.gpu_a.available_permits(),
            ResourceClass::GpuB => self.gpu_b.available_permits(),
            ResourceClass::Cpu => self.cpu.available_permits(),
        }
    }
}

/// Dispatches routing plans against registered backends.
pub struct ExecutionEngine {
    registry: Arc<BackendRegistry>,
    reconciler: EnsembleReconciler,
    pools: ResourcePools,
    config: Arc<OrchestratorConfig>,
}

impl ExecutionEngine {
    pub fn new(registry: Arc<BackendRegistry>, config: Arc<OrchestratorConfig>) -> Self {
        Self {
            reconciler: EnsembleReconciler::new(config.ensemble.clone()),
            pools: ResourcePools::new(&config.pools),
            registry,
            config,
        }
    }

    pub fn pools(&self) -> &ResourcePools {
        &self.pools
    }

    /// Execute one page against its routing plan, producing its final
    /// result. Attempt-level failures are absorbed into retry/fallback
    /// decisions here; only terminal conditions surface in the outcome.
    pub async fn execute(
        &self,
        page: &PageImage,
        plan: &RoutingPlan,
        cancel: &CancellationToken,
    ) -> PageResult {
        if plan.ensemble {
            self.run_ensemble(page, plan, cancel).await
        } else {
            self.run_sequential(page, plan, cancel).await
        }
    }

    /// Batch variant: run several pages concurrently. Per-class concurrency
    /// stays bounded by the resource pools regardless of batch size.
    pub async fn execute_batch(
        &self,
        pages: &[PageImage],
        plans: &[RoutingPlan],
        cancel: &CancellationToken,
    ) -> Vec<PageResult> {
        debug_assert_eq!(pages.len(), plans.len());
        let futures = pages
            .iter()
            .zip(plans.iter())
            .map(|(page, plan)| self.execute(page, plan, cancel));
        futures::future::join_all(futures).await
    }

    /// Auto/Explicit: candidates strictly in order, same-backend retries
    /// with backoff, immediate cross-backend fallback.
    async fn run_sequential(
        &self,
        page: &PageImage,
        plan: &RoutingPlan,
        cancel: &CancellationToken,
    ) -> PageResult {
        let mut attempts: Vec<OcrAttempt> = Vec::new();
        let mut last_error = "no candidates in routing plan".to_string();

        for backend_id in &plan.primary_order {
            let Some(backend) = self.registry.get(backend_id) else {
                last_error = format!("{} is not registered", backend_id);
                continue;
            };
            let timeout = self.config.attempt_timeout(&backend.spec);

            for attempt_no in 1..=self.config.retry.max_attempts_per_backend {
                // Backoff only between retries on the same backend.
                if attempt_no > 1 {
                    if let Err(e) = self.backoff(attempt_no, cancel).await {
                        return failed_page(page.page_number, attempts, e);
                    }
                }

                let attempt = match self.attempt_once(backend, page, timeout, cancel).await {
                    Ok(attempt) => attempt,
                    Err(e) => return failed_page(page.page_number, attempts, e),
                };
                let succeeded = attempt.succeeded();
                if !succeeded {
                    last_error = attempt
                        .error
                        .clone()
                        .unwrap_or_else(|| "unknown attempt failure".to_string());
                }
                attempts.push(attempt);

                if succeeded {
                    return self.single_result(page.page_number, attempts);
                }
            }
            debug!(
                page = page.page_number,
                backend = %backend_id,
                "candidate exhausted, falling back"
            );
        }

        failed_page(
            page.page_number,
            attempts,
            PageError::AllCandidatesExhausted { last: last_error },
        )
    }

    /// Hybrid: all ensemble members concurrently, each with its own bounded
    /// retries on its own pool. The page waits for every member to resolve
    /// or time out, then reconciles whatever succeeded.
    async fn run_ensemble(
        &self,
        page: &PageImage,
        plan: &RoutingPlan,
        cancel: &CancellationToken,
    ) -> PageResult {
        let member_runs = plan.primary_order.iter().map(|backend_id| async move {
            let Some(backend) = self.registry.get(backend_id) else {
                return Vec::new();
            };
            let timeout = self.config.attempt_timeout(&backend.spec);
            let mut attempts = Vec::new();
            for attempt_no in 1..=self.config.retry.hybrid_attempts {
                if attempt_no > 1 && self.backoff(attempt_no, cancel).await.is_err() {
                    break;
                }
                match self.attempt_once(backend, page, timeout, cancel).await {
                    Ok(attempt) => {
                        let succeeded = attempt.succeeded();
                        attempts.push(attempt);
                        if succeeded {
                            break;
                        }
                    }
                    Err(_) => break,
                }
            }
            attempts
        });

        let attempts: Vec<OcrAttempt> = futures::future::join_all(member_runs)
            .await
            .into_iter()
            .flatten()
            .collect();

        if cancel.is_cancelled() {
            return failed_page(page.page_number, attempts, PageError::Cancelled);
        }

        let successes: Vec<&OcrAttempt> = attempts.iter().filter(|a| a.succeeded()).collect();
        match successes.len() {
            0 => {
                let last = attempts
                    .last()
                    .and_then(|a| a.error.clone())
                    .unwrap_or_else(|| "no ensemble member produced output".to_string());
                failed_page(
                    page.page_number,
                    attempts,
                    PageError::AllCandidatesExhausted { last },
                )
            }
            // A lone survivor is still a usable result, just not an
            // ensemble one: no agreement score to report.
            1 => self.single_result(page.page_number, attempts),
            _ => {
                let priorities: HashMap<String, u32> = self
                    .registry
                    .all()
                    .map(|b| (b.spec.id.clone(), b.spec.base_priority))
                    .collect();
                let succeeded: Vec<OcrAttempt> =
                    successes.into_iter().cloned().collect();
                let result = self.reconciler.reconcile(&succeeded, &priorities);
                let needs_review = self.reconciler.needs_review(result.confidence);
                PageResult {
                    page_number: page.page_number,
                    outcome: PageOutcome::Ensemble(result),
                    attempts,
                    needs_review,
                }
            }
        }
    }

    /// One attempt: acquire the backend's pool slot, run with a hard
    /// timeout, record the outcome against backend health. Cancellation
    /// releases the slot promptly by dropping the permit and the in-flight
    /// future.
    async fn attempt_once(
        &self,
        backend: &RegisteredBackend,
        page: &PageImage,
        timeout: Duration,
        cancel: &CancellationToken,
    ) -> Result<OcrAttempt, PageError> {
        let permit = tokio::select! {
            _ = cancel.cancelled() => return Err(PageError::Cancelled),
            permit = self.pools.acquire(&backend.spec) => permit,
        };

        let started_at = Utc::now();
        let start = tokio::time::Instant::now();
        let result = tokio::select! {
            _ = cancel.cancelled() => return Err(PageError::Cancelled),
            result = tokio::time::timeout(timeout, backend.engine.recognize(page)) => result,
        };
        drop(permit);
        let duration = start.elapsed();

        let attempt = match result {
            Ok(Ok(output)) => OcrAttempt {
                backend_id: backend.spec.id.clone(),
                started_at,
                duration,
                outcome: AttemptOutcome::Success,
                confidence: output.confidence.clamp(0.0, 1.0),
                text: output.text,
                structured_fields: output.structured_fields,
                error: None,
            },
            Ok(Err(e)) => {
                warn!(
                    backend = %backend.spec.id,
                    page = page.page_number,
                    error = %e,
                    "attempt failed"
                );
                OcrAttempt {
                    backend_id: backend.spec.id.clone(),
                    started_at,
                    duration,
                    outcome: AttemptOutcome::Error,
                    confidence: 0.0,
                    text: String::new(),
                    structured_fields: HashMap::new(),
                    error: Some(e.to_string()),
                }
            }
            Err(_) => {
                warn!(
                    backend = %backend.spec.id,
                    page = page.page_number,
                    timeout_secs = timeout.as_secs(),
                    "attempt timed out"
                );
                OcrAttempt {
                    backend_id: backend.spec.id.clone(),
                    started_at,
                    duration,
                    outcome: AttemptOutcome::Timeout,
                    confidence: 0.0,
                    text: String::new(),
                    structured_fields: HashMap::new(),
                    error: Some(AttemptError::Timeout(timeout).to_string()),
                }
            }
        };

        self.registry.record_outcome(&backend.spec.id, attempt.outcome);
        Ok(attempt)
    }

    /// Cancellable exponential backoff with jitter before attempt
    /// `attempt_no` (>= 2) on the same backend.
    async fn backoff(&self, attempt_no: u32, cancel: &CancellationToken) -> Result<(), PageError> {
        let retry = &self.config.retry;
        let exp = retry
            .backoff_multiplier
            .powi(attempt_no.saturating_sub(2) as i32);
        let base = retry.base_delay_ms as f64 * exp;
        let jitter = if retry.jitter_fraction > 0.0 {
            use rand::Rng;
            1.0 + rand::rng().random_range(-retry.jitter_fraction..=retry.jitter_fraction)
        } else {
            1.0
        };
        let delay = Duration::from_millis((base * jitter).max(0.0) as u64);

        tokio::select! {
            _ = cancel.cancelled() => Err(PageError::Cancelled),
            _ = tokio::time::sleep(delay) => Ok(()),
        }
    }

    /// Finalize a page from its single successful (last) attempt.
    fn single_result(&self, page_number: u32, attempts: Vec<OcrAttempt>) -> PageResult {
        let winner = attempts
            .iter()
            .rfind(|a| a.succeeded())
            .expect("single_result requires a successful attempt");
        let needs_review = self.reconciler.needs_review(winner.confidence);
        PageResult {
            page_number,
            outcome: PageOutcome::Single {
                backend_id: winner.backend_id.clone(),
                text: winner.text.clone(),
                confidence: winner.confidence,
                structured_fields: winner.structured_fields.clone(),
            },
            attempts,
            needs_review,
        }
    }
}

fn failed_page(page_number: u32, attempts: Vec<OcrAttempt>, error: PageError) -> PageResult {
    PageResult {
        page_number,
        outcome: PageOutcome::Failed(error),
        attempts,
        needs_review: false,
    }
}
