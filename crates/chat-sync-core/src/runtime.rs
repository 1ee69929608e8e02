use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::sync::mpsc;
use tokio::task::JoinSet;

use crate::config::CoreConfig;
use crate::diagnostics::{DiagnosticsSink, TracingSink};
use crate::error::{StorageError, SyncError};
use crate::events::CoreEvent;
use crate::filter::FilterHash;
use crate::models::{ChatChannel, ChatMessage, ChatUser};
use crate::query::{ListQuery, UpdatePolicy};
use crate::reconciler::OrphanReconciler;
use crate::registry::QueryRegistry;
use crate::remote::{HttpFetcher, RemoteFetcher};
use crate::stats::SharedReconcileStats;
use crate::store::{ChangeScope, ChangeSubscription, ListOrder, LocalStore, Observation};
use crate::updater::ListUpdater;

/// Intents accepted by the runtime.
#[derive(Debug, Clone)]
pub enum SyncCommand {
    Update {
        query: ListQuery,
        policy: UpdatePolicy,
    },
    /// Re-run a stored query, replacing its members with the fresh page.
    Refresh {
        filter_hash: FilterHash,
    },
    Shutdown,
}

#[derive(Clone)]
pub struct CoreHandle {
    command_tx: mpsc::UnboundedSender<SyncCommand>,
}

impl CoreHandle {
    pub fn send(&self, command: SyncCommand) -> Result<(), mpsc::error::SendError<SyncCommand>> {
        self.command_tx.send(command)
    }

    pub fn update(&self, query: ListQuery, policy: UpdatePolicy) -> Result<(), mpsc::error::SendError<SyncCommand>> {
        self.send(SyncCommand::Update { query, policy })
    }

    pub fn refresh(&self, filter_hash: FilterHash) -> Result<(), mpsc::error::SendError<SyncCommand>> {
        self.send(SyncCommand::Refresh { filter_hash })
    }
}

/// Wires store, fetcher, updater and reconcilers together and serves intents.
pub struct SyncRuntime {
    store: LocalStore,
    updater: ListUpdater,
    registry: QueryRegistry,
    reconcilers: Vec<OrphanReconciler>,
    reconcile_stats: SharedReconcileStats,
    handle: CoreHandle,
    command_rx: Option<mpsc::UnboundedReceiver<SyncCommand>>,
    event_tx: mpsc::UnboundedSender<CoreEvent>,
    event_rx: Option<mpsc::UnboundedReceiver<CoreEvent>>,
}

impl SyncRuntime {
    /// Open the store under `config.data_dir` and talk to `config.api` over HTTP.
    pub fn new(config: CoreConfig) -> Result<Self> {
        std::fs::create_dir_all(&config.data_dir).with_context(|| {
            format!("Failed to create data dir: {}", config.data_dir.display())
        })?;
        let store = LocalStore::open(config.database_path())
            .with_context(|| format!("Failed to open store in {}", config.data_dir.display()))?;
        let fetcher = HttpFetcher::new(&config.api).context("Failed to build HTTP client")?;
        Ok(Self::with_parts(
            &config,
            store,
            Arc::new(fetcher),
            Arc::new(TracingSink),
        ))
    }

    pub fn with_parts(
        config: &CoreConfig,
        store: LocalStore,
        fetcher: Arc<dyn RemoteFetcher>,
        sink: Arc<dyn DiagnosticsSink>,
    ) -> Self {
        let updater = ListUpdater::new(store.clone(), fetcher);
        let registry = QueryRegistry::new(store.clone());
        let reconcile_stats = SharedReconcileStats::new();

        let mut kinds = config.reconcile_kinds.clone();
        kinds.sort();
        kinds.dedup();
        let reconcilers = kinds
            .into_iter()
            .map(|kind| {
                OrphanReconciler::new(
                    kind,
                    updater.clone(),
                    registry.clone(),
                    sink.clone(),
                    reconcile_stats.clone(),
                )
            })
            .collect();

        let (command_tx, command_rx) = mpsc::unbounded_channel();
        let (event_tx, event_rx) = mpsc::unbounded_channel();

        Self {
            store,
            updater,
            registry,
            reconcilers,
            reconcile_stats,
            handle: CoreHandle { command_tx },
            command_rx: Some(command_rx),
            event_tx,
            event_rx: Some(event_rx),
        }
    }

    pub fn handle(&self) -> CoreHandle {
        self.handle.clone()
    }

    pub fn store(&self) -> &LocalStore {
        &self.store
    }

    pub fn updater(&self) -> &ListUpdater {
        &self.updater
    }

    pub fn registry(&self) -> &QueryRegistry {
        &self.registry
    }

    pub fn reconcile_stats(&self) -> SharedReconcileStats {
        self.reconcile_stats.clone()
    }

    pub fn reconcilers(&self) -> &[OrphanReconciler] {
        &self.reconcilers
    }

    pub fn take_event_rx(&mut self) -> Option<mpsc::UnboundedReceiver<CoreEvent>> {
        self.event_rx.take()
    }

    /// Start every configured reconciler that is not running yet.
    pub fn start_reconcilers(&self) {
        for reconciler in &self.reconcilers {
            reconciler.ensure_started();
        }
    }

    /// Members of a user query, in the query's sort order.
    pub fn users(&self, filter_hash: &FilterHash) -> Vec<ChatUser> {
        self.store
            .snapshot()
            .members(filter_hash)
            .iter()
            .filter_map(ChatUser::from_entity)
            .collect()
    }

    pub fn channels(&self, filter_hash: &FilterHash) -> Vec<ChatChannel> {
        self.store
            .snapshot()
            .members(filter_hash)
            .iter()
            .filter_map(ChatChannel::from_entity)
            .collect()
    }

    pub fn messages(&self, filter_hash: &FilterHash) -> Vec<ChatMessage> {
        self.store
            .snapshot()
            .members(filter_hash)
            .iter()
            .filter_map(ChatMessage::from_entity)
            .collect()
    }

    /// Observe the members of a stored query. `None` if the query is unknown.
    pub fn observe_query(
        &self,
        filter_hash: &FilterHash,
        order: ListOrder,
    ) -> Option<ChangeSubscription> {
        let record = self.store.query_record(filter_hash)?;
        let observation =
            Observation::new(record.kind, ChangeScope::QueryMembers(record.filter_hash))
                .ordered(order);
        Some(self.store.subscribe(observation))
    }

    /// Serve commands until `Shutdown`.
    ///
    /// Updates run concurrently and are not coalesced. Each write commits in
    /// the order it reaches the store's queue. In-flight updates and orphan
    /// checks are awaited before returning.
    pub async fn run(&mut self) {
        let Some(mut command_rx) = self.command_rx.take() else {
            tracing::warn!("Sync runtime is already running");
            return;
        };
        let mut in_flight = JoinSet::new();

        while let Some(command) = command_rx.recv().await {
            let (query, policy) = match command {
                SyncCommand::Update { query, policy } => (query, policy),
                SyncCommand::Refresh { filter_hash } => match self.store.query_record(&filter_hash) {
                    Some(record) => (record.to_query(), UpdatePolicy::Replace),
                    None => {
                        let error = SyncError::Storage(StorageError::Constraint(format!(
                            "no query record {filter_hash}"
                        )));
                        let _ = self.event_tx.send(CoreEvent::UpdateFailed { filter_hash, error });
                        continue;
                    }
                },
                SyncCommand::Shutdown => {
                    tracing::info!("Shutdown requested");
                    break;
                }
            };

            self.start_reconcilers();
            self.spawn_update(&mut in_flight, query, policy);

            // Reap finished tasks so the set does not grow unbounded.
            while in_flight.try_join_next().is_some() {}
        }

        while in_flight.join_next().await.is_some() {}
        for reconciler in &self.reconcilers {
            reconciler.shutdown().await;
        }
        tracing::info!("Sync runtime stopped");
    }

    fn spawn_update(&self, in_flight: &mut JoinSet<()>, query: ListQuery, policy: UpdatePolicy) {
        let filter_hash = query.filter_hash();
        let kind = query.kind;
        let events = self.event_tx.clone();
        let updater = self.updater.clone();
        in_flight.spawn(async move {
            let event = match updater.update(&query, policy).await {
                Ok(record) => CoreEvent::QueryUpdated {
                    filter_hash,
                    kind,
                    members: record.member_ids.len(),
                },
                Err(error) => CoreEvent::UpdateFailed { filter_hash, error },
            };
            let _ = events.send(event);
        });
    }
}
