//! Failure classifier: category, impact and recommended strategy
//!
//! Rules are matched in order and the first match wins:
//! 1. network or timeout errors
//! 2. out-of-memory
//! 3. validation errors
//! 4. authentication errors
//! 5. messages matching the rate-limit pattern
//! 6. free disk below the configured threshold
//! 7. anything else

use crate::config::ClassifierConfig;
use crate::error::{EngineResult, RecoveryError};
use crate::ledger::StrategyLedger;
use chrono::Utc;
use provenant_dag::ProvenanceStore;
use provenant_types::{
    ExecutionContext, FailureAnalysis, FailureCategory, FailureId, FailureKind, ImpactAssessment,
    NodeId, RecoveryCost, RecoveryStrategy, StepFailure, StrategyKind, SystemMetrics,
};
use regex::{Regex, RegexBuilder};
use std::sync::Arc;
use std::time::Duration;

const PATTERN_SIZE_LIMIT: usize = 1024 * 1024;

/// Turns step failures into [`FailureAnalysis`] values
#[derive(Debug)]
pub struct FailureClassifier {
    config: ClassifierConfig,
    rate_limit: Regex,
    provenance: Arc<ProvenanceStore>,
    ledger: Arc<StrategyLedger>,
}

impl FailureClassifier {
    /// # Errors
    /// `InvalidPattern` if the rate-limit pattern does not compile
    pub fn new(
        config: ClassifierConfig,
        provenance: Arc<ProvenanceStore>,
        ledger: Arc<StrategyLedger>,
    ) -> EngineResult<Self> {
        let rate_limit = RegexBuilder::new(&config.rate_limit_pattern)
            .size_limit(PATTERN_SIZE_LIMIT)
            .build()
            .map_err(|e| RecoveryError::InvalidPattern(e.to_string()))?;
        Ok(Self {
            config,
            rate_limit,
            provenance,
            ledger,
        })
    }

    #[inline]
    #[must_use]
    pub fn config(&self) -> &ClassifierConfig {
        &self.config
    }

    #[inline]
    #[must_use]
    pub fn ledger(&self) -> &Arc<StrategyLedger> {
        &self.ledger
    }

    /// Category of a failure
    #[must_use]
    pub fn categorize(&self, error: &StepFailure, system: &SystemMetrics) -> FailureCategory {
        match &error.kind {
            FailureKind::Network | FailureKind::Timeout => FailureCategory::NetworkFailure,
            FailureKind::OutOfMemory => FailureCategory::ResourceExhaustion,
            FailureKind::Validation => FailureCategory::DataValidationFailure,
            FailureKind::Authentication => FailureCategory::AuthenticationFailure,
            _ if self.rate_limit.is_match(&error.message) => FailureCategory::RateLimitFailure,
            _ if system.available_disk_bytes < self.config.min_disk_bytes => {
                FailureCategory::DiskSpaceFailure
            }
            _ => FailureCategory::UnknownFailure,
        }
    }

    fn strategy_of_kind(&self, kind: StrategyKind, category: FailureCategory) -> RecoveryStrategy {
        match kind {
            StrategyKind::Retry => {
                let delay = if category == FailureCategory::RateLimitFailure {
                    self.config.rate_limit_retry_delay_ms
                } else {
                    self.config.network_retry_delay_ms
                };
                RecoveryStrategy::retry(self.config.retry_attempts, Duration::from_millis(delay))
            }
            StrategyKind::Rollback => RecoveryStrategy::rollback(),
            StrategyKind::Skip => RecoveryStrategy::skip(),
            StrategyKind::Manual => RecoveryStrategy::manual(),
        }
    }

    /// Strategy a category gets without ledger input
    #[must_use]
    pub fn default_strategy(&self, category: FailureCategory) -> RecoveryStrategy {
        match category {
            FailureCategory::NetworkFailure | FailureCategory::RateLimitFailure => {
                self.strategy_of_kind(StrategyKind::Retry, category)
            }
            FailureCategory::ResourceExhaustion | FailureCategory::DiskSpaceFailure => {
                let rollback = self.strategy_of_kind(StrategyKind::Rollback, category);
                rollback
                    .clone()
                    .with_fallback(RecoveryStrategy::manual())
                    .unwrap_or(rollback)
            }
            FailureCategory::DataValidationFailure
            | FailureCategory::AuthenticationFailure
            | FailureCategory::UnknownFailure => RecoveryStrategy::manual(),
        }
    }

    /// Strategy recommended for a category, preferring the ledger's recent winner
    ///
    /// The default strategy becomes the fallback of a preferred one.
    #[must_use]
    pub fn recommend(&self, category: FailureCategory) -> RecoveryStrategy {
        let default = self.default_strategy(category);
        if !self.config.adaptive {
            return default;
        }
        match self.ledger.preferred(category) {
            Some(kind) if kind != default.kind => {
                let preferred = self.strategy_of_kind(kind, category);
                preferred
                    .clone()
                    .with_fallback(default)
                    .unwrap_or(preferred)
            }
            _ => default,
        }
    }

    /// Classify a step failure at its DAG position
    #[tracing::instrument(skip(self, error, context, system), fields(dag_id = %context.dag_id, node_id = %context.node_id))]
    pub fn classify(
        &self,
        error: &StepFailure,
        context: &ExecutionContext,
        system: &SystemMetrics,
    ) -> FailureAnalysis {
        let category = self.categorize(error, system);
        let recommended_strategy = self.recommend(category);
        let (impact, estimated_cost) = self.assess(context, recommended_strategy.kind);

        metrics::counter!("provenant_failures_classified_total", "category" => category.to_string())
            .increment(1);
        tracing::info!(
            %category,
            strategy = %recommended_strategy.kind,
            affected = impact.affected_count(),
            "failure classified"
        );

        FailureAnalysis {
            id: FailureId::new(),
            timestamp: Utc::now(),
            context: context.clone(),
            error: error.clone(),
            category,
            impact,
            recommended_strategy,
            estimated_cost,
        }
    }

    /// Downstream impact and the cost of re-running what the strategy re-runs
    fn assess(&self, context: &ExecutionContext, kind: StrategyKind) -> (ImpactAssessment, RecoveryCost) {
        let Ok(dag) = self.provenance.snapshot(context.dag_id) else {
            tracing::warn!(dag_id = %context.dag_id, "failure in unknown dag, impact not assessed");
            return (
                ImpactAssessment::from_affected(Vec::new()),
                RecoveryCost {
                    recompute_nodes: 0,
                    estimated_ms: 0,
                },
            );
        };

        let affected: Vec<NodeId> = dag.descendants(context.node_id).into_iter().collect();
        let recompute: Vec<NodeId> = match kind {
            StrategyKind::Skip => Vec::new(),
            _ => std::iter::once(context.node_id)
                .chain(affected.iter().copied())
                .collect(),
        };
        let estimated_ms = recompute
            .iter()
            .map(|id| {
                dag.node(*id)
                    .and_then(|n| n.metadata.duration_ms)
                    .unwrap_or(self.config.default_node_duration_ms)
            })
            .fold(0u64, u64::saturating_add);

        (
            ImpactAssessment::from_affected(affected),
            RecoveryCost {
                recompute_nodes: recompute.len(),
                estimated_ms,
            },
        )
    }
}
