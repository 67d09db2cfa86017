//! Recovery strategies and their fallback chains
//!
//! A strategy owns at most one fallback, forming a singly-linked chain.
//! [`RecoveryStrategy::with_fallback`] rejects a chain that would revisit a
//! strategy instance already in it.

use crate::ids::StrategyId;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fmt;
use std::time::Duration;

/// Strategy tag
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StrategyKind {
    Retry,
    Rollback,
    Skip,
    Manual,
}

impl fmt::Display for StrategyKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Retry => "retry",
            Self::Rollback => "rollback",
            Self::Skip => "skip",
            Self::Manual => "manual",
        };
        f.write_str(name)
    }
}

/// Condition that must hold before a strategy is attempted
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum Precondition {
    /// A restorable checkpoint exists for the failure
    CheckpointAvailable,
    /// The failed node is registered in its DAG
    NodeExists,
    /// At least this many bytes of free disk
    MinDiskBytes(u64),
    /// At least this many bytes of free memory
    MinMemoryBytes(u64),
}

/// How to recover from a failure
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecoveryStrategy {
    pub id: StrategyId,
    pub kind: StrategyKind,
    pub max_attempts: u32,
    /// Base delay between attempts; doubled after each failed attempt
    #[serde(with = "duration_ms")]
    pub retry_delay: Duration,
    fallback: Option<Box<RecoveryStrategy>>,
    pub preconditions: Vec<Precondition>,
}

impl RecoveryStrategy {
    /// New strategy with one attempt and no delay
    #[must_use]
    pub fn new(kind: StrategyKind) -> Self {
        Self {
            id: StrategyId::new(),
            kind,
            max_attempts: 1,
            retry_delay: Duration::ZERO,
            fallback: None,
            preconditions: Vec::new(),
        }
    }

    /// Retry with exponential backoff starting at `delay`
    #[must_use]
    pub fn retry(max_attempts: u32, delay: Duration) -> Self {
        Self::new(StrategyKind::Retry)
            .with_attempts(max_attempts)
            .with_delay(delay)
    }

    /// Restore the nearest preceding checkpoint, then re-run the step
    #[must_use]
    pub fn rollback() -> Self {
        Self::new(StrategyKind::Rollback).with_precondition(Precondition::CheckpointAvailable)
    }

    #[must_use]
    pub fn skip() -> Self {
        Self::new(StrategyKind::Skip).with_precondition(Precondition::NodeExists)
    }

    #[must_use]
    pub fn manual() -> Self {
        Self::new(StrategyKind::Manual)
    }

    #[must_use]
    pub fn with_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts.max(1);
        self
    }

    #[must_use]
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.retry_delay = delay;
        self
    }

    #[must_use]
    pub fn with_precondition(mut self, precondition: Precondition) -> Self {
        if !self.preconditions.contains(&precondition) {
            self.preconditions.push(precondition);
        }
        self
    }

    /// Append `fallback` at the end of this chain
    ///
    /// # Errors
    /// Returns [`FallbackChainError::Revisit`] if any strategy instance in
    /// `fallback`'s chain is already part of this chain.
    pub fn with_fallback(mut self, fallback: RecoveryStrategy) -> Result<Self, FallbackChainError> {
        let seen: HashSet<StrategyId> = self.chain().map(|s| s.id).collect();
        if let Some(repeat) = fallback.chain().find(|s| seen.contains(&s.id)) {
            return Err(FallbackChainError::Revisit {
                strategy: repeat.id,
                kind: repeat.kind,
            });
        }

        self.push_tail(fallback);
        Ok(self)
    }

    fn push_tail(&mut self, fallback: RecoveryStrategy) {
        match self.fallback {
            Some(ref mut next) => next.push_tail(fallback),
            None => self.fallback = Some(Box::new(fallback)),
        }
    }

    /// Immediate fallback
    #[must_use]
    pub fn fallback(&self) -> Option<&RecoveryStrategy> {
        self.fallback.as_deref()
    }

    /// Detach the fallback, leaving this strategy without one
    pub fn take_fallback(&mut self) -> Option<RecoveryStrategy> {
        self.fallback.take().map(|b| *b)
    }

    /// This strategy followed by every fallback, in order
    pub fn chain(&self) -> impl Iterator<Item = &RecoveryStrategy> {
        std::iter::successors(Some(self), |s| s.fallback())
    }

    /// Number of strategies in the chain
    #[must_use]
    pub fn chain_len(&self) -> usize {
        self.chain().count()
    }

    /// Delay before attempt number `attempt` (0-based), exponential backoff
    #[must_use]
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let factor = 1u32.checked_shl(attempt.min(16)).unwrap_or(u32::MAX);
        self.retry_delay.saturating_mul(factor)
    }
}

/// Invalid fallback chain
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum FallbackChainError {
    #[error("fallback chain revisits {kind} strategy {strategy}")]
    Revisit {
        strategy: StrategyId,
        kind: StrategyKind,
    },
}

mod duration_ms {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub(super) fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(u64::try_from(d.as_millis()).unwrap_or(u64::MAX))
    }

    pub(super) fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        u64::deserialize(d).map(Duration::from_millis)
    }
}
