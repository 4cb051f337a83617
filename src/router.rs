//! Per-page backend routing.
//!
//! Turns a complexity classification, an optional document-type hint, and
//! the current registry state into an ordered candidate list (primary plus
//! fallbacks) or an ensemble set for hybrid mode. Routing is recomputed per
//! page, since classification varies page-to-page within one document.

use std::sync::Arc;

use tracing::{debug, warn};

use crate::complexity::{Classification, ComplexityScore};
use crate::config::{EnsembleConfig, PoolConfig, RoutingConfig};
use crate::error::PageError;
use crate::registry::BackendRegistry;

/// How backend selection is made for a job.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RoutingMode {
    /// Complexity-driven selection with automatic fallbacks.
    Auto,
    /// Run the configured ensemble set concurrently and reconcile.
    Hybrid,
    /// Caller-pinned backend, no fallbacks, fail fast if unavailable.
    Explicit(String),
}

/// Ordered plan for one page.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RoutingPlan {
    /// Candidate backend ids. In ensemble mode these run concurrently;
    /// otherwise they are tried in order.
    pub primary_order: Vec<String>,
    /// Whether the candidates form an ensemble to reconcile.
    pub ensemble: bool,
    /// Set when a hybrid set was reduced below its configured membership.
    pub degraded: bool,
}

impl RoutingPlan {
    pub fn is_empty(&self) -> bool {
        self.primary_order.is_empty()
    }
}

/// Stateless router over a shared registry.
pub struct BackendRouter {
    registry: Arc<BackendRegistry>,
    routing: RoutingConfig,
    ensemble: EnsembleConfig,
    pools: PoolConfig,
}

impl BackendRouter {
    pub fn new(
        registry: Arc<BackendRegistry>,
        routing: RoutingConfig,
        ensemble: EnsembleConfig,
        pools: PoolConfig,
    ) -> Self {
        Self {
            registry,
            routing,
            ensemble,
            pools,
        }
    }

    /// Produce a routing plan for one page.
    ///
    /// An empty Auto/Hybrid plan is a valid output (no healthy backends
    /// right now); the execution engine turns it into the page's terminal
    /// failure. Explicit mode fails fast instead of silently substituting.
    pub fn route(
        &self,
        score: &ComplexityScore,
        doc_type_hint: Option<&str>,
        mode: &RoutingMode,
    ) -> Result<RoutingPlan, PageError> {
        match mode {
            RoutingMode::Explicit(id) => self.route_explicit(id),
            RoutingMode::Hybrid => Ok(self.route_hybrid()),
            RoutingMode::Auto => Ok(self.route_auto(score, doc_type_hint)),
        }
    }

    fn route_explicit(&self, id: &str) -> Result<RoutingPlan, PageError> {
        let backend = self
            .registry
            .get(id)
            .ok_or_else(|| PageError::BackendUnavailable(format!("{} is not registered", id)))?;
        if !self.registry.fits_budget(&backend.spec, &self.pools) {
            return Err(PageError::BackendUnavailable(format!(
                "{} exceeds the {} capacity budget",
                id, backend.spec.resource_class
            )));
        }
        if !self.registry.admit(id) {
            return Err(PageError::BackendUnavailable(format!("{} is disabled", id)));
        }
        Ok(RoutingPlan {
            primary_order: vec![id.to_string()],
            ensemble: false,
            degraded: false,
        })
    }

    fn route_hybrid(&self) -> RoutingPlan {
        let members: Vec<String> = self
            .ensemble
            .members
            .iter()
            .filter(|id| match self.registry.get(id) {
                Some(b) => {
                    self.registry.fits_budget(&b.spec, &self.pools) && self.registry.admit(id)
                }
                None => false,
            })
            .cloned()
            .collect();

        let degraded = members.len() < self.ensemble.members.len() || members.len() < 2;
        if degraded {
            warn!(
                configured = self.ensemble.members.len(),
                usable = members.len(),
                "hybrid ensemble reduced"
            );
        }
        RoutingPlan {
            ensemble: members.len() >= 2,
            degraded,
            primary_order: members,
        }
    }

    fn route_auto(&self, score: &ComplexityScore, doc_type_hint: Option<&str>) -> RoutingPlan {
        let candidates = self.registry.candidates(&self.pools);
        if candidates.is_empty() {
            return RoutingPlan {
                primary_order: Vec::new(),
                ensemble: false,
                degraded: false,
            };
        }

        let candidate_ids: Vec<String> =
            candidates.iter().map(|b| b.spec.id.clone()).collect();

        // Document-type hint overrides the classification preference when
        // the named backend is currently routable.
        let hinted = doc_type_hint
            .and_then(|hint| self.routing.doc_type_overrides.get(hint))
            .filter(|id| candidate_ids.iter().any(|c| c == *id))
            .cloned();

        let primary = hinted.unwrap_or_else(|| match score.classification {
            Classification::Simple => self.preferred_fast(&candidates),
            Classification::Moderate | Classification::Complex => {
                self.preferred_accurate(&candidate_ids)
            }
        });

        let mut primary_order = vec![primary.clone()];
        // Remaining healthy candidates, already in descending priority
        // order, become the fallback chain.
        primary_order.extend(candidate_ids.into_iter().filter(|id| *id != primary));

        debug!(
            classification = %score.classification,
            primary = %primary_order[0],
            fallbacks = primary_order.len() - 1,
            "auto routing"
        );
        RoutingPlan {
            primary_order,
            ensemble: false,
            degraded: false,
        }
    }

    /// Fast/lightweight preference for Simple pages: the configured fast
    /// backend if routable, otherwise the lightest candidate by VRAM need.
    fn preferred_fast(&self, candidates: &[&crate::registry::RegisteredBackend]) -> String {
        if let Some(fast) = &self.routing.fast_backend {
            if candidates.iter().any(|b| &b.spec.id == fast) {
                return fast.clone();
            }
        }
        candidates
            .iter()
            .min_by_key(|b| (b.spec.vram_required_mb, b.spec.id.clone()))
            .map(|b| b.spec.id.clone())
            .expect("candidates checked non-empty")
    }

    /// Highest-accuracy preference for Moderate/Complex pages: the
    /// configured accurate backend if routable, otherwise the highest
    /// priority candidate.
    fn preferred_accurate(&self, candidate_ids: &[String]) -> String {
        if let Some(accurate) = &self.routing.accurate_backend {
            if candidate_ids.iter().any(|id| id == accurate) {
                return accurate.clone();
            }
        }
        candidate_ids[0].clone()
    }
}
