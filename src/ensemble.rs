//! Ensemble reconciliation.
//!
//! Merges the outputs of multiple backends that ran the same page into one
//! result via confidence-weighted voting. Tie-breaking is deterministic
//! (backend id ascending), so reconciling the same attempt set twice yields
//! an identical result regardless of arrival order.

use std::collections::HashMap;

use tracing::debug;

use crate::config::EnsembleConfig;
use crate::model::{EnsembleResult, OcrAttempt};

/// Confidence-weighted voting over successful attempts.
pub struct EnsembleReconciler {
    config: EnsembleConfig,
}

impl EnsembleReconciler {
    pub fn new(config: EnsembleConfig) -> Self {
        Self { config }
    }

    /// Whether a resolved confidence falls below the manual-review floor.
    /// Flagged pages go to a human, not back into the retry loop; retrying
    /// does not fix ambiguous source material.
    pub fn needs_review(&self, confidence: f32) -> bool {
        confidence < self.config.min_confidence
    }

    /// Merge two or more successful attempts into one result.
    ///
    /// `priorities` maps backend id to its configured base priority, which
    /// weighs both the vote and the aggregate confidence.
    pub fn reconcile(
        &self,
        attempts: &[OcrAttempt],
        priorities: &HashMap<String, u32>,
    ) -> EnsembleResult {
        debug_assert!(attempts.len() >= 2, "reconcile needs at least 2 attempts");

        let mut contributing: Vec<&OcrAttempt> =
            attempts.iter().filter(|a| a.succeeded()).collect();
        // Canonical order makes the whole computation order-insensitive.
        contributing.sort_by(|a, b| a.backend_id.cmp(&b.backend_id));

        let priority_of =
            |a: &OcrAttempt| *priorities.get(&a.backend_id).unwrap_or(&1) as f64;
        let vote_weight = |a: &OcrAttempt| a.confidence as f64 * priority_of(a);

        let all_agree = contributing
            .windows(2)
            .all(|w| normalize(&w[0].text) == normalize(&w[1].text));

        let (winner, agreement) = if all_agree {
            // Identical after normalization: highest individual confidence
            // wins, agreement is total.
            let winner = contributing
                .iter()
                .max_by(|a, b| {
                    a.confidence
                        .partial_cmp(&b.confidence)
                        .unwrap_or(std::cmp::Ordering::Equal)
                        .then_with(|| b.backend_id.cmp(&a.backend_id))
                })
                .expect("contributing is non-empty");
            (*winner, 1.0f32)
        } else {
            // Confidence-weighted vote; agreement is the similarity between
            // the winning text and the runner-up.
            let winner = contributing
                .iter()
                .max_by(|a, b| {
                    vote_weight(a)
                        .partial_cmp(&vote_weight(b))
                        .unwrap_or(std::cmp::Ordering::Equal)
                        .then_with(|| b.backend_id.cmp(&a.backend_id))
                })
                .expect("contributing is non-empty");
            let runner_up = contributing
                .iter()
                .filter(|a| a.backend_id != winner.backend_id)
                .max_by(|a, b| {
                    vote_weight(a)
                        .partial_cmp(&vote_weight(b))
                        .unwrap_or(std::cmp::Ordering::Equal)
                        .then_with(|| b.backend_id.cmp(&a.backend_id))
                })
                .expect("at least two contributors");
            let similarity = strsim::normalized_levenshtein(
                &normalize(&winner.text),
                &normalize(&runner_up.text),
            ) as f32;
            (*winner, similarity)
        };

        let weight_sum: f64 = contributing.iter().map(|a| priority_of(a)).sum();
        let weighted_confidence: f64 = contributing
            .iter()
            .map(|a| a.confidence as f64 * priority_of(a))
            .sum::<f64>()
            / weight_sum.max(f64::EPSILON);

        // Disagreement discounts the aggregate so a confident-but-lonely
        // outlier cannot produce a falsely high score.
        let discount = 1.0 - self.config.disagreement_penalty * (1.0 - agreement);
        let confidence = (weighted_confidence as f32 * discount).clamp(0.0, 1.0);

        debug!(
            winner = %winner.backend_id,
            agreement,
            confidence,
            contributors = contributing.len(),
            "ensemble reconciled"
        );

        EnsembleResult {
            text: winner.text.clone(),
            confidence,
            contributing_backends: contributing
                .iter()
                .map(|a| a.backend_id.clone())
                .collect(),
            agreement_score: agreement,
        }
    }
}

/// Whitespace/case-insensitive canonical form for comparison.
fn normalize(text: &str) -> String {
    text.split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .to_lowercase()
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use chrono::Utc;

    use super::*;
    use crate::model::AttemptOutcome;

    fn attempt(backend_id: &str, text: &str, confidence: f32) -> OcrAttempt {
        OcrAttempt {
            backend_id: backend_id.into(),
            started_at: Utc::now(),
            duration: Duration::from_millis(100),
            outcome: AttemptOutcome::Success,
            confidence,
            text: text.into(),
            structured_fields: HashMap::new(),
            error: None,
        }
    }

    fn priorities() -> HashMap<String, u32> {
        HashMap::from([
            ("fast".to_string(), 60),
            ("accurate".to_string(), 90),
        ])
    }

    fn reconciler() -> EnsembleReconciler {
        EnsembleReconciler::new(EnsembleConfig::default())
    }

    #[test]
    fn identical_texts_give_full_agreement() {
        let attempts = vec![
            attempt("fast", "Hello  World", 0.7),
            attempt("accurate", "hello world", 0.9),
        ];
        let result = reconciler().reconcile(&attempts, &priorities());
        assert_eq!(result.agreement_score, 1.0);
        // Highest individual confidence wins the returned text verbatim.
        assert_eq!(result.text, "hello world");
        assert_eq!(result.contributing_backends, vec!["accurate", "fast"]);
    }

    #[test]
    fn disagreement_picks_weighted_winner() {
        // fast: 0.9 * 60 = 54; accurate: 0.8 * 90 = 72.
        let attempts = vec![
            attempt("fast", "rn hello", 0.9),
            attempt("accurate", "m hello", 0.8),
        ];
        let result = reconciler().reconcile(&attempts, &priorities());
        assert_eq!(result.text, "m hello");
        assert!(result.agreement_score < 1.0);
        assert!(result.agreement_score > 0.5);
    }

    #[test]
    fn disagreement_discounts_confidence() {
        let agree = reconciler().reconcile(
            &[
                attempt("fast", "same text", 0.9),
                attempt("accurate", "same text", 0.9),
            ],
            &priorities(),
        );
        let disagree = reconciler().reconcile(
            &[
                attempt("fast", "completely different words", 0.9),
                attempt("accurate", "nothing alike at all", 0.9),
            ],
            &priorities(),
        );
        assert!(disagree.confidence < agree.confidence);
    }

    #[test]
    fn aggregate_confidence_is_priority_weighted_mean() {
        let mut priorities = priorities();
        priorities.insert("slow".to_string(), 10);
        let attempts = vec![
            attempt("fast", "same text", 0.6),
            attempt("accurate", "same text", 0.9),
            attempt("slow", "same text", 0.3),
        ];
        let result = reconciler().reconcile(&attempts, &priorities);
        // (0.6*60 + 0.9*90 + 0.3*10) / (60 + 90 + 10) = 0.75, no discount.
        assert!((result.confidence - 0.75).abs() < 1e-6);
        assert_eq!(result.agreement_score, 1.0);
    }

    #[test]
    fn reconcile_is_order_insensitive_and_idempotent() {
        let a = attempt("fast", "first variant", 0.85);
        let b = attempt("accurate", "second variant", 0.80);

        let forward = reconciler().reconcile(&[a.clone(), b.clone()], &priorities());
        let reversed = reconciler().reconcile(&[b, a], &priorities());
        assert_eq!(forward, reversed);

        let again = reconciler().reconcile(
            &[
                attempt("fast", "first variant", 0.85),
                attempt("accurate", "second variant", 0.80),
            ],
            &priorities(),
        );
        assert_eq!(forward, again);
    }

    #[test]
    fn equal_weights_break_ties_by_backend_id() {
        let mut equal = HashMap::new();
        equal.insert("a".to_string(), 50);
        equal.insert("b".to_string(), 50);
        let result = reconciler().reconcile(
            &[attempt("b", "text bee", 0.8), attempt("a", "text ayy", 0.8)],
            &equal,
        );
        assert_eq!(result.text, "text ayy");
    }

    #[test]
    fn review_floor_uses_configured_minimum() {
        let r = EnsembleReconciler::new(EnsembleConfig {
            min_confidence: 0.8,
            ..EnsembleConfig::default()
        });
        assert!(r.needs_review(0.79));
        assert!(!r.needs_review(0.8));
    }
}
