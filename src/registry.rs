//! Backend registry and health tracking.
//!
//! Tracks the fixed set of OCR backends, their resource requirements, and a
//! circuit-style health state per backend: repeated consecutive failures
//! disable a backend, a cool-down later a single probe attempt is admitted,
//! and a successful probe re-enables it. Health is the only state mutated
//! concurrently by in-flight pages, so all updates go through one mutex.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::backend::OcrBackend;
use crate::config::{BackendSpec, HealthConfig, PoolConfig, ResourceClass};
use crate::model::AttemptOutcome;

/// One backend known to the registry.
pub struct RegisteredBackend {
    pub spec: BackendSpec,
    pub engine: Arc<dyn OcrBackend>,
}

#[derive(Debug, Clone)]
enum CircuitState {
    /// Healthy, routable.
    Closed,
    /// Disabled until the cool-down elapses.
    Open { until: Instant, cooldown: Duration },
    /// Cool-down elapsed and one probe attempt has been admitted.
    Probing { since: Instant, cooldown: Duration },
}

#[derive(Debug, Clone)]
struct HealthEntry {
    consecutive_failures: u32,
    last_failure_at: Option<Instant>,
    state: CircuitState,
}

impl HealthEntry {
    fn new() -> Self {
        Self {
            consecutive_failures: 0,
            last_failure_at: None,
            state: CircuitState::Closed,
        }
    }
}

/// Read-only health snapshot for reporting.
#[derive(Debug, Clone)]
pub struct BackendHealth {
    pub consecutive_failures: u32,
    pub last_failure_at: Option<Instant>,
    pub is_disabled: bool,
}

/// Registry of available backends plus their mutable health counters.
pub struct BackendRegistry {
    backends: Vec<RegisteredBackend>,
    health: Mutex<HashMap<String, HealthEntry>>,
    config: HealthConfig,
}

impl BackendRegistry {
    pub fn new(config: HealthConfig) -> Self {
        Self {
            backends: Vec::new(),
            health: Mutex::new(HashMap::new()),
            config,
        }
    }

    /// Register a backend. Backends are registered at startup; the set is
    /// fixed afterwards.
    pub fn register(&mut self, spec: BackendSpec, engine: Arc<dyn OcrBackend>) {
        self.health
            .lock()
            .expect("health lock poisoned")
            .insert(spec.id.clone(), HealthEntry::new());
        self.backends.push(RegisteredBackend { spec, engine });
    }

    pub fn get(&self, id: &str) -> Option<&RegisteredBackend> {
        self.backends.iter().find(|b| b.spec.id == id)
    }

    pub fn all(&self) -> impl Iterator<Item = &RegisteredBackend> {
        self.backends.iter()
    }

    pub fn len(&self) -> usize {
        self.backends.len()
    }

    pub fn is_empty(&self) -> bool {
        self.backends.is_empty()
    }

    /// Health snapshot for one backend.
    pub fn health(&self, id: &str) -> Option<BackendHealth> {
        let health = self.health.lock().expect("health lock poisoned");
        health.get(id).map(|entry| BackendHealth {
            consecutive_failures: entry.consecutive_failures,
            last_failure_at: entry.last_failure_at,
            is_disabled: !matches!(entry.state, CircuitState::Closed),
        })
    }

    /// Admit a backend into a routing plan.
    ///
    /// Closed backends are always admitted. A disabled backend whose
    /// cool-down has elapsed is admitted exactly once as a probe; further
    /// callers are refused until the probe's outcome is recorded. A probe
    /// that never reports (cancelled mid-flight) goes stale after one
    /// cool-down and a new probe is admitted.
    pub fn admit(&self, id: &str) -> bool {
        let now = Instant::now();
        let mut health = self.health.lock().expect("health lock poisoned");
        let Some(entry) = health.get_mut(id) else {
            return false;
        };
        match entry.state {
            CircuitState::Closed => true,
            CircuitState::Open { until, cooldown } => {
                if now >= until {
                    debug!(backend = id, "cool-down elapsed, admitting probe");
                    entry.state = CircuitState::Probing {
                        since: now,
                        cooldown,
                    };
                    true
                } else {
                    false
                }
            }
            CircuitState::Probing { since, cooldown } => {
                if now.duration_since(since) > cooldown {
                    debug!(backend = id, "stale probe, re-admitting");
                    entry.state = CircuitState::Probing {
                        since: now,
                        cooldown,
                    };
                    true
                } else {
                    false
                }
            }
        }
    }

    /// Record an attempt outcome against a backend's health.
    ///
    /// Safe under concurrent calls from multiple in-flight pages. A success
    /// resets the failure counter and closes the circuit atomically; a
    /// failed probe reopens it with a longer cool-down, bounded by the
    /// configured cap.
    pub fn record_outcome(&self, id: &str, outcome: AttemptOutcome) {
        let now = Instant::now();
        let mut health = self.health.lock().expect("health lock poisoned");
        let Some(entry) = health.get_mut(id) else {
            return;
        };

        match outcome {
            AttemptOutcome::Success => {
                if !matches!(entry.state, CircuitState::Closed) {
                    info!(backend = id, "probe succeeded, backend re-enabled");
                }
                entry.consecutive_failures = 0;
                entry.state = CircuitState::Closed;
            }
            AttemptOutcome::Timeout | AttemptOutcome::Error => {
                entry.consecutive_failures += 1;
                entry.last_failure_at = Some(now);
                match entry.state {
                    CircuitState::Closed => {
                        if entry.consecutive_failures >= self.config.disable_threshold {
                            let cooldown = self.config.cooldown();
                            warn!(
                                backend = id,
                                failures = entry.consecutive_failures,
                                cooldown_secs = cooldown.as_secs(),
                                "backend disabled after consecutive failures"
                            );
                            entry.state = CircuitState::Open {
                                until: now + cooldown,
                                cooldown,
                            };
                        }
                    }
                    CircuitState::Probing { cooldown, .. } => {
                        let next = Duration::from_secs_f64(
                            (cooldown.as_secs_f64() * self.config.cooldown_multiplier)
                                .min(self.config.max_cooldown().as_secs_f64()),
                        );
                        warn!(
                            backend = id,
                            cooldown_secs = next.as_secs(),
                            "probe failed, cool-down extended"
                        );
                        entry.state = CircuitState::Open {
                            until: now + next,
                            cooldown: next,
                        };
                    }
                    // Late failure from a concurrent page; circuit already open.
                    CircuitState::Open { .. } => {}
                }
            }
        }
    }

    /// Whether a backend fits its resource class's capacity budget.
    pub fn fits_budget(&self, spec: &BackendSpec, pools: &PoolConfig) -> bool {
        match spec.resource_class {
            ResourceClass::Cpu => true,
            class => spec.vram_required_mb <= pools.vram_budget(class),
        }
    }

    /// Routable candidates under the given capacity budgets, ordered by
    /// descending base priority (id ascending on ties, for determinism).
    /// Disabled backends are excluded; a cooled-down backend appears at
    /// most once, as its probe.
    pub fn candidates(&self, pools: &PoolConfig) -> Vec<&RegisteredBackend> {
        let mut out: Vec<&RegisteredBackend> = self
            .backends
            .iter()
            .filter(|b| self.fits_budget(&b.spec, pools))
            .filter(|b| self.admit(&b.spec.id))
            .collect();
        out.sort_by(|a, b| {
            b.spec
                .base_priority
                .cmp(&a.spec.base_priority)
                .then_with(|| a.spec.id.cmp(&b.spec.id))
        });
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::BackendOutput;
    use crate::error::AttemptError;
    use crate::model::PageImage;
    use async_trait::async_trait;

    struct NullBackend;

    #[async_trait]
    impl OcrBackend for NullBackend {
        async fn recognize(&self, _page: &PageImage) -> Result<BackendOutput, AttemptError> {
            Ok(BackendOutput::plain(String::new(), 0.0))
        }
    }

    fn spec(id: &str, class: ResourceClass, vram: u32, priority: u32) -> BackendSpec {
        BackendSpec {
            id: id.into(),
            resource_class: class,
            vram_required_mb: vram,
            max_batch_size: 1,
            base_priority: priority,
            timeout_secs: None,
            command: None,
        }
    }

    fn registry_with(specs: Vec<BackendSpec>) -> BackendRegistry {
        let mut registry = BackendRegistry::new(HealthConfig::default());
        for s in specs {
            registry.register(s, Arc::new(NullBackend));
        }
        registry
    }

    #[tokio::test]
    async fn success_resets_failure_counter() {
        let registry = registry_with(vec![spec("a", ResourceClass::Cpu, 0, 50)]);
        for _ in 0..5 {
            registry.record_outcome("a", AttemptOutcome::Error);
        }
        assert_eq!(registry.health("a").unwrap().consecutive_failures, 5);

        registry.record_outcome("a", AttemptOutcome::Success);
        let health = registry.health("a").unwrap();
        assert_eq!(health.consecutive_failures, 0);
        assert!(!health.is_disabled);
    }

    #[tokio::test]
    async fn health_snapshot_tracks_last_failure() {
        let registry = registry_with(vec![spec("a", ResourceClass::Cpu, 0, 50)]);
        assert!(registry.health("a").unwrap().last_failure_at.is_none());

        registry.record_outcome("a", AttemptOutcome::Error);
        assert!(registry.health("a").unwrap().last_failure_at.is_some());

        // Success resets the counter but keeps the historical timestamp.
        registry.record_outcome("a", AttemptOutcome::Success);
        let health = registry.health("a").unwrap();
        assert_eq!(health.consecutive_failures, 0);
        assert!(health.last_failure_at.is_some());
    }

    #[tokio::test]
    async fn disables_at_threshold() {
        let registry = registry_with(vec![spec("a", ResourceClass::Cpu, 0, 50)]);
        for _ in 0..9 {
            registry.record_outcome("a", AttemptOutcome::Timeout);
        }
        assert!(!registry.health("a").unwrap().is_disabled);

        registry.record_outcome("a", AttemptOutcome::Timeout);
        assert!(registry.health("a").unwrap().is_disabled);
        assert!(!registry.admit("a"));
    }

    #[tokio::test(start_paused = true)]
    async fn probe_admitted_once_after_cooldown() {
        let registry = registry_with(vec![spec("a", ResourceClass::Cpu, 0, 50)]);
        for _ in 0..10 {
            registry.record_outcome("a", AttemptOutcome::Error);
        }
        assert!(!registry.admit("a"));

        tokio::time::advance(Duration::from_secs(301)).await;
        assert!(registry.admit("a"));
        // Only one probe until its outcome is recorded.
        assert!(!registry.admit("a"));
    }

    #[tokio::test(start_paused = true)]
    async fn successful_probe_reenables_and_resets() {
        let registry = registry_with(vec![spec("a", ResourceClass::Cpu, 0, 50)]);
        for _ in 0..10 {
            registry.record_outcome("a", AttemptOutcome::Error);
        }
        tokio::time::advance(Duration::from_secs(301)).await;
        assert!(registry.admit("a"));

        registry.record_outcome("a", AttemptOutcome::Success);
        let health = registry.health("a").unwrap();
        assert_eq!(health.consecutive_failures, 0);
        assert!(!health.is_disabled);
        assert!(registry.admit("a"));
    }

    #[tokio::test(start_paused = true)]
    async fn failed_probe_extends_cooldown() {
        let registry = registry_with(vec![spec("a", ResourceClass::Cpu, 0, 50)]);
        for _ in 0..10 {
            registry.record_outcome("a", AttemptOutcome::Error);
        }
        tokio::time::advance(Duration::from_secs(301)).await;
        assert!(registry.admit("a"));
        registry.record_outcome("a", AttemptOutcome::Error);

        // Original cool-down (300s) is no longer enough.
        tokio::time::advance(Duration::from_secs(301)).await;
        assert!(!registry.admit("a"));

        // Doubled cool-down (600s) is.
        tokio::time::advance(Duration::from_secs(300)).await;
        assert!(registry.admit("a"));
    }

    #[tokio::test]
    async fn candidates_ordered_and_filtered() {
        let registry = registry_with(vec![
            spec("slow", ResourceClass::Cpu, 0, 10),
            spec("accurate", ResourceClass::GpuA, 8192, 90),
            spec("fast", ResourceClass::Cpu, 0, 60),
            spec("oversized", ResourceClass::GpuA, 65536, 99),
        ]);
        let pools = PoolConfig::default();

        let ids: Vec<&str> = registry
            .candidates(&pools)
            .iter()
            .map(|b| b.spec.id.as_str())
            .collect();
        // oversized exceeds the 16 GB budget and is excluded entirely.
        assert_eq!(ids, vec!["accurate", "fast", "slow"]);
    }

    #[tokio::test]
    async fn disabled_backend_never_in_candidates() {
        let registry = registry_with(vec![
            spec("a", ResourceClass::Cpu, 0, 50),
            spec("b", ResourceClass::Cpu, 0, 40),
        ]);
        for _ in 0..10 {
            registry.record_outcome("a", AttemptOutcome::Error);
        }
        let ids: Vec<&str> = registry
            .candidates(&PoolConfig::default())
            .iter()
            .map(|b| b.spec.id.as_str())
            .collect();
        assert_eq!(ids, vec!["b"]);
    }
}
