//! Win/loss record of recovery strategies per failure category

use dashmap::DashMap;
use provenant_types::{FailureCategory, StrategyKind};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};

/// Outcomes of one strategy kind for one category
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StrategyRecord {
    pub wins: u64,
    pub losses: u64,
    /// Ledger clock value of the last win
    pub last_win: Option<u64>,
}

impl StrategyRecord {
    #[must_use]
    pub fn total(&self) -> u64 {
        self.wins + self.losses
    }
}

/// Shared strategy ledger
///
/// The preferred kind for a category is the one that won most recently,
/// as long as it has not lost more often than it won.
#[derive(Debug, Default)]
pub struct StrategyLedger {
    records: DashMap<(FailureCategory, StrategyKind), StrategyRecord>,
    clock: AtomicU64,
}

impl StrategyLedger {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&self, category: FailureCategory, kind: StrategyKind, success: bool) {
        let tick = self.clock.fetch_add(1, Ordering::Relaxed) + 1;
        let mut entry = self.records.entry((category, kind)).or_default();
        if success {
            entry.wins += 1;
            entry.last_win = Some(tick);
        } else {
            entry.losses += 1;
        }
        tracing::debug!(%category, %kind, success, "strategy outcome recorded");
    }

    #[must_use]
    pub fn record_for(&self, category: FailureCategory, kind: StrategyKind) -> StrategyRecord {
        self.records
            .get(&(category, kind))
            .map(|r| *r.value())
            .unwrap_or_default()
    }

    #[must_use]
    pub fn preferred(&self, category: FailureCategory) -> Option<StrategyKind> {
        self.records
            .iter()
            .filter(|e| e.key().0 == category && e.value().wins >= e.value().losses)
            .filter_map(|e| e.value().last_win.map(|tick| (tick, e.key().1)))
            .max()
            .map(|(_, kind)| kind)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn most_recent_winner_is_preferred() {
        let ledger = StrategyLedger::new();
        let cat = FailureCategory::ResourceExhaustion;
        assert_eq!(ledger.preferred(cat), None);

        ledger.record(cat, StrategyKind::Rollback, true);
        ledger.record(cat, StrategyKind::Retry, true);
        assert_eq!(ledger.preferred(cat), Some(StrategyKind::Retry));

        ledger.record(cat, StrategyKind::Retry, false);
        ledger.record(cat, StrategyKind::Retry, false);
        assert_eq!(ledger.preferred(cat), Some(StrategyKind::Rollback));
        assert_eq!(ledger.preferred(FailureCategory::NetworkFailure), None);

        let retry = ledger.record_for(cat, StrategyKind::Retry);
        assert_eq!((retry.wins, retry.losses, retry.total()), (1, 2, 3));
    }
}
