//! Orchestrator configuration.
//!
//! Every tuning knob discovered empirically lives here rather than in code:
//! complexity weights and classification thresholds, the backend table,
//! retry/backoff parameters, circuit-breaker thresholds, ensemble
//! membership, and resource-pool budgets. Loaded from a TOML file with
//! per-field defaults so a partial file (or none at all) still yields a
//! working configuration.

use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

/// Default config file name looked up in the working directory.
pub const DEFAULT_CONFIG_FILE: &str = "textmill.toml";

/// Compute class a backend runs on. Each class has its own bounded pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResourceClass {
    /// Primary GPU device.
    GpuA,
    /// Secondary GPU device.
    GpuB,
    /// CPU worker pool.
    Cpu,
}

impl ResourceClass {
    pub fn as_str(&self) -> &'static str {
        match self {
            ResourceClass::GpuA => "gpu_a",
            ResourceClass::GpuB => "gpu_b",
            ResourceClass::Cpu => "cpu",
        }
    }
}

impl std::fmt::Display for ResourceClass {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// One registered OCR backend.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackendSpec {
    /// Unique backend id, used in routing plans and attempt records.
    pub id: String,
    pub resource_class: ResourceClass,
    /// VRAM this backend needs per in-flight job. Zero for CPU backends.
    #[serde(default)]
    pub vram_required_mb: u32,
    #[serde(default = "default_max_batch_size")]
    pub max_batch_size: u32,
    /// Higher priority wins fallback ordering and ensemble weighting.
    #[serde(default = "default_base_priority")]
    pub base_priority: u32,
    /// Per-attempt timeout override. Falls back to `retry.default_timeout_secs`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_secs: Option<u64>,
    /// Subprocess command for command-line backends (CLI use). Library users
    /// register trait implementations directly and leave this unset.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub command: Option<String>,
}

fn default_max_batch_size() -> u32 {
    1
}

fn default_base_priority() -> u32 {
    50
}

/// Weights for the five complexity sub-metrics.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ComplexityWeights {
    pub image_quality: f64,
    pub layout: f64,
    pub text_density: f64,
    pub noise: f64,
    pub resolution: f64,
}

impl Default for ComplexityWeights {
    fn default() -> Self {
        Self {
            image_quality: 0.30,
            layout: 0.25,
            text_density: 0.20,
            noise: 0.15,
            resolution: 0.10,
        }
    }
}

impl ComplexityWeights {
    pub fn total(&self) -> f64 {
        self.image_quality + self.layout + self.text_density + self.noise + self.resolution
    }
}

/// Complexity scoring and classification thresholds.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ComplexityConfig {
    pub weights: ComplexityWeights,
    /// Scores below this classify as Simple.
    pub simple_threshold: f64,
    /// Scores at or above this classify as Complex.
    pub complex_threshold: f64,
}

impl Default for ComplexityConfig {
    fn default() -> Self {
        Self {
            weights: ComplexityWeights::default(),
            simple_threshold: 30.0,
            complex_threshold: 60.0,
        }
    }
}

/// Static routing preferences for Auto mode.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct RoutingConfig {
    /// Backend preferred for Simple pages (fast/lightweight). Unset picks
    /// the lowest-VRAM healthy backend.
    pub fast_backend: Option<String>,
    /// Backend preferred for Moderate/Complex pages (highest accuracy).
    /// Unset picks the highest-priority healthy backend.
    pub accurate_backend: Option<String>,
    /// Document-type hint overrides: hint -> preferred backend id. Applied
    /// in Auto mode when the named backend is healthy; ignored otherwise.
    pub doc_type_overrides: HashMap<String, String>,
}

/// Retry, backoff, and timeout policy.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    /// Attempts per backend before falling back (Auto/Explicit).
    pub max_attempts_per_backend: u32,
    /// Attempts per ensemble member in Hybrid mode.
    pub hybrid_attempts: u32,
    /// Base delay before the second attempt on the same backend.
    pub base_delay_ms: u64,
    pub backoff_multiplier: f64,
    /// Jitter as a fraction of the computed delay, in [0, 1].
    pub jitter_fraction: f64,
    /// Per-attempt timeout when the backend spec has no override.
    pub default_timeout_secs: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts_per_backend: 3,
            hybrid_attempts: 2,
            base_delay_ms: 500,
            backoff_multiplier: 2.0,
            jitter_fraction: 0.25,
            default_timeout_secs: 300,
        }
    }
}

impl RetryConfig {
    pub fn default_timeout(&self) -> Duration {
        Duration::from_secs(self.default_timeout_secs)
    }
}

/// Circuit-style backend disabling.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HealthConfig {
    /// Consecutive failures before a backend is disabled.
    pub disable_threshold: u32,
    /// Initial cool-down before a disabled backend is probed.
    pub cooldown_secs: u64,
    /// Cool-down growth factor after a failed probe.
    pub cooldown_multiplier: f64,
    /// Cool-down cap.
    pub max_cooldown_secs: u64,
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            disable_threshold: 10,
            cooldown_secs: 300,
            cooldown_multiplier: 2.0,
            max_cooldown_secs: 3600,
        }
    }
}

impl HealthConfig {
    pub fn cooldown(&self) -> Duration {
        Duration::from_secs(self.cooldown_secs)
    }

    pub fn max_cooldown(&self) -> Duration {
        Duration::from_secs(self.max_cooldown_secs)
    }
}

/// Hybrid-mode ensemble membership and reconciliation tuning.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EnsembleConfig {
    /// Backend ids to run concurrently in Hybrid mode.
    pub members: Vec<String>,
    /// Aggregate confidence below which a page is flagged for manual review.
    pub min_confidence: f32,
    /// How strongly disagreement discounts the aggregate confidence, in
    /// [0, 1]. The exact weighting is a tuning knob, not a fixed formula.
    pub disagreement_penalty: f32,
}

impl Default for EnsembleConfig {
    fn default() -> Self {
        Self {
            members: Vec::new(),
            min_confidence: 0.8,
            disagreement_penalty: 1.0,
        }
    }
}

/// Per-resource-class capacity budgets.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PoolConfig {
    /// VRAM budget for the primary GPU, in MB. Concurrency on this device
    /// is the budget divided by each job's VRAM requirement.
    pub gpu_a_vram_mb: u32,
    /// VRAM budget for the secondary GPU, in MB. Zero disables the class.
    pub gpu_b_vram_mb: u32,
    /// CPU pool size. Zero sizes it from available parallelism.
    pub cpu_workers: u32,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            gpu_a_vram_mb: 16384,
            gpu_b_vram_mb: 0,
            cpu_workers: 0,
        }
    }
}

impl PoolConfig {
    /// VRAM budget for a GPU class, in MB.
    pub fn vram_budget(&self, class: ResourceClass) -> u32 {
        match class {
            ResourceClass::GpuA => self.gpu_a_vram_mb,
            ResourceClass::GpuB => self.gpu_b_vram_mb,
            ResourceClass::Cpu => 0,
        }
    }

    /// Effective CPU pool size.
    pub fn effective_cpu_workers(&self) -> u32 {
        if self.cpu_workers > 0 {
            self.cpu_workers
        } else {
            std::thread::available_parallelism()
                .map(|n| n.get() as u32)
                .unwrap_or(4)
        }
    }
}

/// Top-level orchestrator configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct OrchestratorConfig {
    pub complexity: ComplexityConfig,
    pub routing: RoutingConfig,
    pub retry: RetryConfig,
    pub health: HealthConfig,
    pub ensemble: EnsembleConfig,
    pub pools: PoolConfig,
    pub backends: Vec<BackendSpec>,
}

impl OrchestratorConfig {
    /// Load configuration from a TOML file.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path)?;
        let config: Self = toml::from_str(&raw)?;
        config.validate()?;
        Ok(config)
    }

    /// Load from an explicit path, or from `textmill.toml` in the working
    /// directory, or fall back to defaults when neither exists.
    pub fn discover(explicit: Option<&Path>) -> Result<Self, ConfigError> {
        if let Some(path) = explicit {
            return Self::load(path);
        }
        let local = Path::new(DEFAULT_CONFIG_FILE);
        if local.exists() {
            return Self::load(local);
        }
        Ok(Self::default())
    }

    /// Reject configurations that cannot route anything sensibly.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.complexity.simple_threshold >= self.complexity.complex_threshold {
            return Err(ConfigError::Invalid(format!(
                "simple_threshold ({}) must be below complex_threshold ({})",
                self.complexity.simple_threshold, self.complexity.complex_threshold
            )));
        }
        if self.complexity.weights.total() <= 0.0 {
            return Err(ConfigError::Invalid(
                "complexity weights must sum to a positive value".into(),
            ));
        }
        if self.retry.max_attempts_per_backend == 0 {
            return Err(ConfigError::Invalid(
                "max_attempts_per_backend must be at least 1".into(),
            ));
        }
        if !(0.0..=1.0).contains(&self.retry.jitter_fraction) {
            return Err(ConfigError::Invalid(
                "jitter_fraction must be in [0, 1]".into(),
            ));
        }
        let mut seen = std::collections::HashSet::new();
        for spec in &self.backends {
            if !seen.insert(spec.id.as_str()) {
                return Err(ConfigError::Invalid(format!(
                    "duplicate backend id: {}",
                    spec.id
                )));
            }
            if spec.resource_class != ResourceClass::Cpu
                && spec.vram_required_mb > self.pools.vram_budget(spec.resource_class)
            {
                return Err(ConfigError::Invalid(format!(
                    "backend {} requires {} MB VRAM but {} has a {} MB budget",
                    spec.id,
                    spec.vram_required_mb,
                    spec.resource_class,
                    self.pools.vram_budget(spec.resource_class)
                )));
            }
        }
        for member in &self.ensemble.members {
            if !self.backends.iter().any(|b| &b.id == member) {
                return Err(ConfigError::Invalid(format!(
                    "ensemble member {} is not a registered backend",
                    member
                )));
            }
        }
        Ok(())
    }

    /// Per-attempt timeout for one backend.
    pub fn attempt_timeout(&self, spec: &BackendSpec) -> Duration {
        spec.timeout_secs
            .map(Duration::from_secs)
            .unwrap_or_else(|| self.retry.default_timeout())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        let config = OrchestratorConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.health.disable_threshold, 10);
        assert_eq!(config.health.cooldown_secs, 300);
        assert_eq!(config.retry.default_timeout_secs, 300);
        assert!((config.complexity.weights.total() - 1.0).abs() < 1e-9);
    }

    #[test]
    fn parses_partial_toml() {
        let raw = r#"
            [complexity]
            simple_threshold = 25.0

            [[backends]]
            id = "fast"
            resource_class = "cpu"

            [[backends]]
            id = "accurate"
            resource_class = "gpu_a"
            vram_required_mb = 8192
            base_priority = 90
        "#;
        let config: OrchestratorConfig = toml::from_str(raw).unwrap();
        assert!(config.validate().is_ok());
        assert_eq!(config.complexity.simple_threshold, 25.0);
        assert_eq!(config.complexity.complex_threshold, 60.0);
        assert_eq!(config.backends.len(), 2);
        assert_eq!(config.backends[1].base_priority, 90);
    }

    #[test]
    fn rejects_inverted_thresholds() {
        let mut config = OrchestratorConfig::default();
        config.complexity.simple_threshold = 70.0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn rejects_backend_over_vram_budget() {
        let mut config = OrchestratorConfig::default();
        config.backends.push(BackendSpec {
            id: "huge".into(),
            resource_class: ResourceClass::GpuA,
            vram_required_mb: 999_999,
            max_batch_size: 1,
            base_priority: 50,
            timeout_secs: None,
            command: None,
        });
        assert!(config.validate().is_err());
    }

    #[test]
    fn rejects_unknown_ensemble_member() {
        let mut config = OrchestratorConfig::default();
        config.ensemble.members.push("ghost".into());
        assert!(config.validate().is_err());
    }
}
