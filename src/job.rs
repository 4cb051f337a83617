//! Per-document job state.
//!
//! Thin aggregation layer: page-level completions reported by the execution
//! engine drive every transition; nothing mutates a job from outside.
//! Aggregation is by count, not sequence, since pages resolve in any order.
//! Progress reads are eventually consistent under concurrent updates.

use std::sync::Mutex;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::model::PageResult;

/// Document-level processing state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum JobStatus {
    Queued,
    Running,
    /// Every page resolved successfully.
    Completed,
    /// At least one page failed after exhausting retries, but not all.
    PartiallyFailed,
    /// Every page failed.
    Failed,
    /// Cancelled mid-flight; finalized pages are retained.
    Cancelled,
}

impl JobStatus {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, JobStatus::Queued | JobStatus::Running)
    }
}

/// Progress events emitted while a job runs, for UIs and callers that track
/// long documents.
#[derive(Debug, Clone)]
pub enum JobEvent {
    JobStarted {
        document_id: String,
        total_pages: usize,
    },
    PageStarted {
        page_number: u32,
    },
    PageCompleted {
        page_number: u32,
        needs_review: bool,
    },
    PageFailed {
        page_number: u32,
        error: String,
    },
    JobFinalized {
        document_id: String,
        status: JobStatus,
    },
}

/// Finalized per-document aggregate returned to the caller, which owns
/// persistence and notification.
#[derive(Debug, Clone)]
pub struct ProcessingJob {
    pub id: Uuid,
    pub document_id: String,
    pub total_pages: usize,
    /// Finalized page results, ordered by page number. Under cancellation
    /// this holds only the pages that resolved before the cut.
    pub pages: Vec<PageResult>,
    pub status: JobStatus,
    pub progress_percent: f32,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
}

struct TrackerInner {
    pages: Vec<PageResult>,
    status: JobStatus,
    cancelled: bool,
    finished_at: Option<DateTime<Utc>>,
}

/// Mutable job state shared between in-flight page tasks.
pub struct JobTracker {
    id: Uuid,
    document_id: String,
    total_pages: usize,
    started_at: DateTime<Utc>,
    inner: Mutex<TrackerInner>,
}

impl JobTracker {
    pub fn new(document_id: &str, total_pages: usize) -> Self {
        Self {
            id: Uuid::new_v4(),
            document_id: document_id.to_string(),
            total_pages,
            started_at: Utc::now(),
            inner: Mutex::new(TrackerInner {
                pages: Vec::with_capacity(total_pages),
                status: JobStatus::Queued,
                cancelled: false,
                finished_at: None,
            }),
        }
    }

    pub fn document_id(&self) -> &str {
        &self.document_id
    }

    pub fn start(&self) {
        let mut inner = self.inner.lock().expect("job lock poisoned");
        if inner.status == JobStatus::Queued {
            inner.status = JobStatus::Running;
        }
    }

    /// Record one finalized page. Drives the Running -> terminal transition
    /// when the last pending page resolves.
    pub fn record_page(&self, result: PageResult) {
        let mut inner = self.inner.lock().expect("job lock poisoned");
        inner.pages.push(result);
        if inner.pages.len() >= self.total_pages && !inner.status.is_terminal() {
            inner.status = terminal_status(&inner.pages, self.total_pages, inner.cancelled);
            inner.finished_at = Some(Utc::now());
        }
    }

    /// Mark the job cancelled. Pages already finalized stay; the terminal
    /// status becomes Cancelled once outstanding work unwinds.
    pub fn mark_cancelled(&self) {
        let mut inner = self.inner.lock().expect("job lock poisoned");
        inner.cancelled = true;
    }

    /// Current progress. Transiently stale under concurrent updates, which
    /// readers must tolerate.
    pub fn progress_percent(&self) -> f32 {
        let inner = self.inner.lock().expect("job lock poisoned");
        if self.total_pages == 0 {
            return 100.0;
        }
        inner.pages.len() as f32 / self.total_pages as f32 * 100.0
    }

    /// Snapshot the finalized job. Forces a terminal status for jobs ending
    /// early (cancellation, empty documents).
    pub fn finalize(&self) -> ProcessingJob {
        let mut inner = self.inner.lock().expect("job lock poisoned");
        if !inner.status.is_terminal() {
            inner.status = terminal_status(&inner.pages, self.total_pages, inner.cancelled);
            inner.finished_at = Some(Utc::now());
        }
        let mut pages = inner.pages.clone();
        pages.sort_by_key(|p| p.page_number);
        let progress = if self.total_pages == 0 {
            100.0
        } else {
            pages.len() as f32 / self.total_pages as f32 * 100.0
        };
        ProcessingJob {
            id: self.id,
            document_id: self.document_id.clone(),
            total_pages: self.total_pages,
            pages,
            status: inner.status,
            progress_percent: progress,
            started_at: self.started_at,
            finished_at: inner.finished_at,
        }
    }
}

fn terminal_status(pages: &[PageResult], total_pages: usize, cancelled: bool) -> JobStatus {
    if cancelled && pages.len() < total_pages {
        return JobStatus::Cancelled;
    }
    let succeeded = pages.iter().filter(|p| p.outcome.is_success()).count();
    let failed = pages.len() - succeeded;
    if failed == 0 {
        JobStatus::Completed
    } else if succeeded == 0 {
        JobStatus::Failed
    } else {
        JobStatus::PartiallyFailed
    }
}

impl ProcessingJob {
    /// Pages that failed terminally, for per-page caller handling.
    pub fn failed_pages(&self) -> impl Iterator<Item = &PageResult> {
        self.pages.iter().filter(|p| !p.outcome.is_success())
    }

    /// Pages flagged for manual review.
    pub fn review_pages(&self) -> impl Iterator<Item = &PageResult> {
        self.pages.iter().filter(|p| p.needs_review)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::PageError;
    use crate::model::PageOutcome;

    fn ok_page(n: u32) -> PageResult {
        PageResult {
            page_number: n,
            outcome: PageOutcome::Single {
                backend_id: "fast".into(),
                text: format!("page {}", n),
                confidence: 0.9,
                structured_fields: Default::default(),
            },
            attempts: Vec::new(),
            needs_review: false,
        }
    }

    fn failed_page(n: u32) -> PageResult {
        PageResult {
            page_number: n,
            outcome: PageOutcome::Failed(PageError::AllCandidatesExhausted {
                last: "down".into(),
            }),
            attempts: Vec::new(),
            needs_review: false,
        }
    }

    /// Exhaustive three-page matrix: 0, 1, 2, and 3 failing pages.
    #[test]
    fn three_page_status_matrix() {
        let cases = [
            (0, JobStatus::Completed),
            (1, JobStatus::PartiallyFailed),
            (2, JobStatus::PartiallyFailed),
            (3, JobStatus::Failed),
        ];
        for (failures, expected) in cases {
            let tracker = JobTracker::new("doc", 3);
            tracker.start();
            for n in 0..3u32 {
                if (n as usize) < failures {
                    tracker.record_page(failed_page(n));
                } else {
                    tracker.record_page(ok_page(n));
                }
            }
            let job = tracker.finalize();
            assert_eq!(job.status, expected, "{} failures", failures);
            assert_eq!(job.progress_percent, 100.0);
        }
    }

    #[test]
    fn starts_queued_then_running() {
        let tracker = JobTracker::new("doc", 2);
        assert_eq!(tracker.inner.lock().unwrap().status, JobStatus::Queued);
        tracker.start();
        assert_eq!(tracker.inner.lock().unwrap().status, JobStatus::Running);
    }

    #[test]
    fn progress_tracks_completed_pages() {
        let tracker = JobTracker::new("doc", 4);
        tracker.start();
        assert_eq!(tracker.progress_percent(), 0.0);
        tracker.record_page(ok_page(0));
        assert_eq!(tracker.progress_percent(), 25.0);
        tracker.record_page(ok_page(1));
        tracker.record_page(failed_page(2));
        assert_eq!(tracker.progress_percent(), 75.0);
    }

    #[test]
    fn cancellation_retains_finalized_pages() {
        let tracker = JobTracker::new("doc", 10);
        tracker.start();
        for n in 0..4u32 {
            tracker.record_page(ok_page(n));
        }
        tracker.mark_cancelled();
        let job = tracker.finalize();
        assert_eq!(job.status, JobStatus::Cancelled);
        assert_eq!(job.pages.len(), 4);
        assert_eq!(job.total_pages, 10);
    }

    #[test]
    fn cancellation_after_all_pages_resolved_is_not_cancelled() {
        // The cancel arrived too late to matter; the job already finished.
        let tracker = JobTracker::new("doc", 2);
        tracker.start();
        tracker.record_page(ok_page(0));
        tracker.record_page(ok_page(1));
        tracker.mark_cancelled();
        assert_eq!(tracker.finalize().status, JobStatus::Completed);
    }

    #[test]
    fn pages_sorted_by_number_regardless_of_completion_order() {
        let tracker = JobTracker::new("doc", 3);
        tracker.start();
        tracker.record_page(ok_page(2));
        tracker.record_page(ok_page(0));
        tracker.record_page(ok_page(1));
        let job = tracker.finalize();
        let numbers: Vec<u32> = job.pages.iter().map(|p| p.page_number).collect();
        assert_eq!(numbers, vec![0, 1, 2]);
    }

    #[test]
    fn empty_document_completes_immediately() {
        let tracker = JobTracker::new("doc", 0);
        tracker.start();
        let job = tracker.finalize();
        assert_eq!(job.status, JobStatus::Completed);
        assert_eq!(job.progress_percent, 100.0);
    }
}
