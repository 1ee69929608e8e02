use std::sync::Arc;

use parking_lot::RwLock;

/// Counters for orphan reconciliation
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ReconcileStats {
    /// Orphan entities picked up from the store
    pub entities_seen: u64,
    /// (entity, query) membership checks issued
    pub pairs_checked: u64,
    pub linked: u64,
    pub unlinked: u64,
    /// Checks that failed and left membership untouched
    pub failed: u64,
}

impl ReconcileStats {
    pub fn new() -> Self {
        Self::default()
    }
}

/// Thread-safe wrapper for reconcile stats
#[derive(Debug, Clone, Default)]
pub struct SharedReconcileStats {
    inner: Arc<RwLock<ReconcileStats>>,
}

impl SharedReconcileStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_entity(&self) {
        self.inner.write().entities_seen += 1;
    }

    pub fn record_pair(&self, outcome: PairOutcome) {
        let mut stats = self.inner.write();
        stats.pairs_checked += 1;
        match outcome {
            PairOutcome::Linked => stats.linked += 1,
            PairOutcome::Unlinked => stats.unlinked += 1,
            PairOutcome::Unchanged => {}
            PairOutcome::Failed => stats.failed += 1,
        }
    }

    pub fn snapshot(&self) -> ReconcileStats {
        self.inner.read().clone()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PairOutcome {
    Linked,
    Unlinked,
    Unchanged,
    Failed,
}
