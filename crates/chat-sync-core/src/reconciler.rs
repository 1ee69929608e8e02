use std::sync::Arc;

use futures::future::join_all;
use parking_lot::Mutex;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;

use crate::diagnostics::DiagnosticsSink;
use crate::filter::FilterHash;
use crate::models::{EntityId, EntityKind};
use crate::registry::QueryRegistry;
use crate::stats::{PairOutcome, SharedReconcileStats};
use crate::store::{ChangeScope, ChangeSubscription, Observation};
use crate::updater::{ListUpdater, MembershipChange};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReconcilerState {
    /// Not subscribed to the store.
    Idle,
    /// Waiting for orphan entities.
    Observing,
    /// Checking orphans against the registered queries.
    Reconciling,
}

struct Inner {
    kind: EntityKind,
    updater: ListUpdater,
    registry: QueryRegistry,
    sink: Arc<dyn DiagnosticsSink>,
    stats: SharedReconcileStats,
    state: Mutex<ReconcilerState>,
}

struct Running {
    stop: oneshot::Sender<()>,
    task: JoinHandle<()>,
}

/// Links entities that reached the store without any query linkage.
///
/// Every orphan of `kind` is checked against every registered query of that
/// kind with a remote identity lookup. A failed check is reported to the sink
/// and leaves that one membership untouched. It is not retried.
///
/// Stopping only unsubscribes. Checks that already started keep running until
/// their fetch and store write finish.
pub struct OrphanReconciler {
    inner: Arc<Inner>,
    running: Mutex<Option<Running>>,
}

impl OrphanReconciler {
    pub fn new(
        kind: EntityKind,
        updater: ListUpdater,
        registry: QueryRegistry,
        sink: Arc<dyn DiagnosticsSink>,
        stats: SharedReconcileStats,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                kind,
                updater,
                registry,
                sink,
                stats,
                state: Mutex::new(ReconcilerState::Idle),
            }),
            running: Mutex::new(None),
        }
    }

    pub fn kind(&self) -> EntityKind {
        self.inner.kind
    }

    pub fn state(&self) -> ReconcilerState {
        match self.running.lock().as_ref() {
            Some(running) if !running.task.is_finished() => *self.inner.state.lock(),
            _ => ReconcilerState::Idle,
        }
    }

    pub fn stats(&self) -> SharedReconcileStats {
        self.inner.stats.clone()
    }

    /// Subscribe to orphans and start reconciling. Does nothing if already running.
    ///
    /// Orphans already in the store arrive with the first batch and are
    /// reconciled right away. Must be called from within a tokio runtime.
    pub fn ensure_started(&self) {
        let mut running = self.running.lock();
        if running.as_ref().is_some_and(|r| !r.task.is_finished()) {
            return;
        }

        let subscription = self
            .inner
            .updater
            .store()
            .subscribe(Observation::new(self.inner.kind, ChangeScope::Unlinked));
        self.inner.set_state(ReconcilerState::Observing);
        tracing::info!(kind = %self.inner.kind, "Orphan reconciler started");

        let (stop, stop_rx) = oneshot::channel();
        let task = tokio::spawn(self.inner.clone().run(subscription, stop_rx));
        *running = Some(Running { stop, task });
    }

    /// Unsubscribe without waiting. Checks already in flight finish in the background.
    pub fn stop(&self) {
        drop(self.signal_stop());
    }

    /// Unsubscribe and wait for in-flight checks to finish.
    pub async fn shutdown(&self) {
        if let Some(task) = self.signal_stop() {
            if let Err(e) = task.await {
                tracing::error!(kind = %self.inner.kind, error = %e, "Orphan reconciler task failed");
            }
        }
    }

    fn signal_stop(&self) -> Option<JoinHandle<()>> {
        let Running { stop, task } = self.running.lock().take()?;
        // The task may already have finished on its own.
        let _ = stop.send(());
        tracing::info!(kind = %self.inner.kind, "Orphan reconciler stopped");
        Some(task)
    }

    /// Check one entity against every registered query of this reconciler's kind.
    pub async fn reconcile_entity(&self, id: &EntityId) -> Vec<(FilterHash, PairOutcome)> {
        self.inner.reconcile(id).await
    }
}

impl Inner {
    fn set_state(&self, state: ReconcilerState) {
        *self.state.lock() = state;
    }

    async fn run(
        self: Arc<Self>,
        mut subscription: ChangeSubscription,
        mut stop: oneshot::Receiver<()>,
    ) {
        loop {
            // A dropped sender counts as a stop request.
            let batch = tokio::select! {
                biased;
                _ = &mut stop => return,
                batch = subscription.next() => match batch {
                    Some(batch) => batch,
                    None => return,
                },
            };
            let orphans: Vec<EntityId> = batch.inserted().map(|e| e.id.clone()).collect();
            if orphans.is_empty() {
                continue;
            }

            self.set_state(ReconcilerState::Reconciling);
            let checks = self.reconcile_all(&orphans);
            tokio::pin!(checks);
            let stopped = tokio::select! {
                _ = &mut checks => false,
                _ = &mut stop => true,
            };
            if stopped {
                drop(subscription);
                checks.await;
                return;
            }
            self.set_state(ReconcilerState::Observing);
        }
    }

    async fn reconcile_all(&self, orphans: &[EntityId]) {
        for id in orphans {
            self.reconcile(id).await;
        }
    }

    async fn reconcile(&self, id: &EntityId) -> Vec<(FilterHash, PairOutcome)> {
        self.stats.record_entity();
        let queries = self.registry.registered_queries(self.kind);
        tracing::debug!(
            kind = %self.kind,
            entity_id = %id,
            queries = queries.len(),
            "Reconciling orphan"
        );

        let checks = queries.iter().map(|record| async move {
            let outcome = match self.updater.update_membership(record, id).await {
                Ok(MembershipChange::Linked) => PairOutcome::Linked,
                Ok(MembershipChange::Unlinked) => PairOutcome::Unlinked,
                Ok(MembershipChange::Unchanged) => PairOutcome::Unchanged,
                Err(e) => {
                    let context = format!(
                        "reconcile {} {} against query {}",
                        self.kind, id, record.filter_hash
                    );
                    self.sink.warn(&context, &e);
                    PairOutcome::Failed
                }
            };
            self.stats.record_pair(outcome);
            (record.filter_hash.clone(), outcome)
        });

        join_all(checks).await
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::diagnostics::testing::RecordingSink;
    use crate::error::NetworkError;
    use crate::filter::FilterExpression;
    use crate::models::Entity;
    use crate::query::{ListQuery, UpdatePolicy};
    use crate::remote::testing::{FakeBackend, GatedFetcher};
    use crate::remote::RemoteFetcher;
    use crate::store::LocalStore;

    struct Harness {
        store: LocalStore,
        backend: Arc<FakeBackend>,
        sink: Arc<RecordingSink>,
        reconciler: OrphanReconciler,
    }

    fn harness(backend: FakeBackend) -> Harness {
        let backend = Arc::new(backend);
        harness_with(backend.clone(), backend)
    }

    fn gated_harness(backend: FakeBackend) -> (Harness, Arc<GatedFetcher>) {
        let backend = Arc::new(backend);
        let gate = Arc::new(GatedFetcher::new(backend.clone()));
        (harness_with(backend, gate.clone()), gate)
    }

    fn harness_with(backend: Arc<FakeBackend>, fetcher: Arc<dyn RemoteFetcher>) -> Harness {
        let store = LocalStore::open_in_memory().unwrap();
        let sink = Arc::new(RecordingSink::default());
        let updater = ListUpdater::new(store.clone(), fetcher);
        let reconciler = OrphanReconciler::new(
            EntityKind::User,
            updater,
            QueryRegistry::new(store.clone()),
            sink.clone(),
            SharedReconcileStats::new(),
        );
        Harness {
            store,
            backend,
            sink,
            reconciler,
        }
    }

    fn role_query(role: &str) -> ListQuery {
        ListQuery::users(FilterExpression::equal("role", role).unwrap())
    }

    async fn register(store: &LocalStore, queries: Vec<ListQuery>) {
        store
            .write(move |s| {
                for query in &queries {
                    s.save_query_record(query, Vec::new(), UpdatePolicy::Merge)?;
                }
                Ok(())
            })
            .await
            .unwrap();
    }

    async fn wait_until(mut condition: impl FnMut() -> bool) {
        for _ in 0..200 {
            if condition() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("condition not reached");
    }

    #[tokio::test]
    async fn test_new_orphan_is_linked_only_to_matching_query() {
        let h = harness(FakeBackend::with_entities([
            Entity::new(EntityKind::User, "C").with_attribute("role", "admin")
        ]));
        let q1 = role_query("admin");
        let q2 = role_query("guest");
        register(&h.store, vec![q1.clone(), q2.clone()]).await;

        h.reconciler.ensure_started();
        assert_ne!(h.reconciler.state(), ReconcilerState::Idle);

        h.store
            .write(|s| s.upsert_entity(Entity::new(EntityKind::User, "C")))
            .await
            .unwrap();

        let stats = h.reconciler.stats();
        wait_until(|| stats.snapshot().pairs_checked == 2).await;

        let c = EntityId::new("C");
        assert!(h.store.query_record(&q1.filter_hash()).unwrap().contains(&c));
        assert!(!h.store.query_record(&q2.filter_hash()).unwrap().contains(&c));
        let stored = h.store.entity(EntityKind::User, &c).unwrap();
        assert_eq!(stored.str_attr("role"), Some("admin"));
        assert!(h.sink.reports.lock().is_empty());
    }

    #[tokio::test]
    async fn test_existing_orphans_are_swept_on_start() {
        let h = harness(FakeBackend::with_entities([
            Entity::new(EntityKind::User, "old").with_attribute("role", "admin")
        ]));
        let q1 = role_query("admin");
        register(&h.store, vec![q1.clone()]).await;
        h.store
            .write(|s| s.upsert_entity(Entity::new(EntityKind::User, "old")))
            .await
            .unwrap();

        h.reconciler.ensure_started();

        let store = h.store.clone();
        let hash = q1.filter_hash();
        wait_until(move || {
            store
                .query_record(&hash)
                .is_some_and(|r| r.contains(&EntityId::new("old")))
        })
        .await;
    }

    #[tokio::test]
    async fn test_failing_pair_does_not_block_others() {
        let h = harness(FakeBackend::with_entities([Entity::new(EntityKind::User, "E")
            .with_attribute("role", "admin")
            .with_attribute("name", "Eve")]));
        let q1 = role_query("admin");
        let q2 = ListQuery::users(FilterExpression::exists("name", true).unwrap());
        register(&h.store, vec![q1.clone(), q2.clone()]).await;
        h.store
            .write(|s| s.upsert_entity(Entity::new(EntityKind::User, "E")))
            .await
            .unwrap();

        let admin = q1.filter.clone();
        h.backend.fail_when(
            move |request| request.filter.to_json().to_string().contains(&admin.to_json().to_string()),
            NetworkError::Timeout,
        );

        let outcomes = h.reconciler.reconcile_entity(&EntityId::new("E")).await;

        assert!(outcomes.contains(&(q1.filter_hash(), PairOutcome::Failed)));
        assert!(outcomes.contains(&(q2.filter_hash(), PairOutcome::Linked)));
        let e = EntityId::new("E");
        assert!(!h.store.query_record(&q1.filter_hash()).unwrap().contains(&e));
        assert!(h.store.query_record(&q2.filter_hash()).unwrap().contains(&e));

        let reports = h.sink.reports.lock();
        assert_eq!(reports.len(), 1);
        assert!(reports[0].0.contains(q1.filter_hash().as_str()));

        let stats = h.reconciler.stats().snapshot();
        assert_eq!(stats.failed, 1);
        assert_eq!(stats.linked, 1);
    }

    #[tokio::test]
    async fn test_unobserved_queries_are_skipped() {
        let h = harness(FakeBackend::with_entities([
            Entity::new(EntityKind::User, "C").with_attribute("role", "admin")
        ]));
        let hidden = role_query("admin").observed(false);
        register(&h.store, vec![hidden]).await;

        let outcomes = h.reconciler.reconcile_entity(&EntityId::new("C")).await;
        assert!(outcomes.is_empty());
        assert!(h.backend.requests().is_empty());
    }

    #[tokio::test]
    async fn test_stop_returns_to_idle() {
        let h = harness(FakeBackend::default());
        h.reconciler.ensure_started();
        h.reconciler.ensure_started();
        h.reconciler.stop();
        assert_eq!(h.reconciler.state(), ReconcilerState::Idle);
    }

    #[tokio::test]
    async fn test_stop_lets_in_flight_check_finish() {
        let (h, gate) = gated_harness(FakeBackend::with_entities([
            Entity::new(EntityKind::User, "C").with_attribute("role", "admin")
        ]));
        let q1 = role_query("admin");
        register(&h.store, vec![q1.clone()]).await;
        h.reconciler.ensure_started();
        h.store
            .write(|s| s.upsert_entity(Entity::new(EntityKind::User, "C")))
            .await
            .unwrap();

        gate.fetch_started().await;
        assert_eq!(h.reconciler.state(), ReconcilerState::Reconciling);

        h.reconciler.stop();
        assert_eq!(h.reconciler.state(), ReconcilerState::Idle);
        gate.release(1);

        let store = h.store.clone();
        let hash = q1.filter_hash();
        wait_until(move || {
            store
                .query_record(&hash)
                .is_some_and(|r| r.contains(&EntityId::new("C")))
        })
        .await;
        assert_eq!(h.reconciler.stats().snapshot().linked, 1);

        // Unsubscribed: a later orphan is left alone.
        gate.release(10);
        h.store
            .write(|s| s.upsert_entity(Entity::new(EntityKind::User, "D")))
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(h.backend.requests().len(), 1);
    }

    #[tokio::test]
    async fn test_shutdown_waits_for_in_flight_check() {
        let (h, gate) = gated_harness(FakeBackend::with_entities([
            Entity::new(EntityKind::User, "C").with_attribute("role", "admin")
        ]));
        let q1 = role_query("admin");
        register(&h.store, vec![q1.clone()]).await;
        h.reconciler.ensure_started();
        h.store
            .write(|s| s.upsert_entity(Entity::new(EntityKind::User, "C")))
            .await
            .unwrap();
        gate.fetch_started().await;

        let releaser = gate.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            releaser.release(1);
        });
        h.reconciler.shutdown().await;

        let record = h.store.query_record(&q1.filter_hash()).unwrap();
        assert!(record.contains(&EntityId::new("C")));
        assert_eq!(h.reconciler.state(), ReconcilerState::Idle);
    }
}
