use std::collections::BTreeSet;
use std::future::Future;
use std::path::Path;
use std::sync::mpsc as std_mpsc;
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use rusqlite::Connection;
use tokio::sync::{mpsc, oneshot};

use crate::error::StorageError;
use crate::filter::FilterHash;
use crate::models::{Entity, EntityId, EntityKind};
use crate::query::{ListQuery, QueryRecord, UpdatePolicy};

use super::changes::{collect, diff, ChangeSubscription, DiffBatch, Observation};
use super::db::{self, Database};
use super::snapshot::Snapshot;

type WriteJob = Box<dyn FnOnce(&mut Connection) + Send>;

struct Observer {
    observation: Observation,
    tx: mpsc::UnboundedSender<DiffBatch>,
}

struct Shared {
    snapshot: RwLock<Arc<Snapshot>>,
    observers: Mutex<Vec<Observer>>,
}

/// Transactional entity cache.
///
/// Writes run one at a time, in submission order, on a dedicated writer thread
/// that owns the SQLite connection. Reads go against the last committed
/// [`Snapshot`] and never wait for a write.
#[derive(Clone)]
pub struct LocalStore {
    shared: Arc<Shared>,
    writer: std_mpsc::Sender<WriteJob>,
}

impl LocalStore {
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, StorageError> {
        Self::start(Database::open(path)?)
    }

    pub fn open_in_memory() -> Result<Self, StorageError> {
        Self::start(Database::open_in_memory()?)
    }

    fn start(db: Database) -> Result<Self, StorageError> {
        let snapshot = db.load_snapshot()?;
        tracing::info!(
            version = snapshot.version(),
            entities = snapshot.entities().count(),
            queries = snapshot.query_records().count(),
            "Loaded local store"
        );

        let shared = Arc::new(Shared {
            snapshot: RwLock::new(Arc::new(snapshot)),
            observers: Mutex::new(Vec::new()),
        });

        let (writer, jobs) = std_mpsc::channel::<WriteJob>();
        let mut conn = db.into_connection();
        std::thread::Builder::new()
            .name("chat-sync-writer".to_string())
            .spawn(move || {
                for job in jobs {
                    job(&mut conn);
                }
                tracing::debug!("Store writer stopped");
            })
            .map_err(|e| StorageError::Sqlite(format!("spawn writer thread: {e}")))?;

        Ok(Self { shared, writer })
    }

    /// Queue a write transaction.
    ///
    /// The job is queued when this is called, not when the future is first
    /// polled. The future resolves once the transaction has committed and the
    /// new snapshot is visible to readers, or with the error that rolled it back.
    pub fn write<T, F>(
        &self,
        mutation: F,
    ) -> impl Future<Output = Result<T, StorageError>> + Send + 'static
    where
        T: Send + 'static,
        F: FnOnce(&mut WriteSession<'_>) -> Result<T, StorageError> + Send + 'static,
    {
        let (done_tx, done_rx) = oneshot::channel();
        let shared = self.shared.clone();
        let job: WriteJob = Box::new(move |conn: &mut Connection| {
            let result = run_transaction(&shared, conn, mutation);
            if let Err(e) = &result {
                tracing::warn!(error = %e, "Write transaction rolled back");
            }
            let _ = done_tx.send(result);
        });
        let queued = self.writer.send(job).is_ok();

        async move {
            if !queued {
                return Err(StorageError::WriterClosed);
            }
            done_rx.await.unwrap_or(Err(StorageError::WriterClosed))
        }
    }

    /// Latest committed state.
    pub fn snapshot(&self) -> Arc<Snapshot> {
        self.shared.snapshot.read().clone()
    }

    pub fn entity(&self, kind: EntityKind, id: &EntityId) -> Option<Entity> {
        self.snapshot().entity(kind, id).cloned()
    }

    pub fn query_record(&self, hash: &FilterHash) -> Option<QueryRecord> {
        self.snapshot().query_record(hash).cloned()
    }

    /// Observe a list of entities. The first batch carries the current list as inserts.
    pub fn subscribe(&self, observation: Observation) -> ChangeSubscription {
        let (tx, rx) = mpsc::unbounded_channel();

        // Holding the observer lock keeps a commit from slipping between the
        // initial batch and registration.
        let mut observers = self.shared.observers.lock();
        let current = self.snapshot();
        let changes = diff(&[], &collect(&current, &observation));
        let _ = tx.send(DiffBatch {
            version: current.version(),
            changes,
        });
        observers.push(Observer { observation, tx });

        ChangeSubscription::new(rx)
    }
}

fn run_transaction<T, F>(
    shared: &Shared,
    conn: &mut Connection,
    mutation: F,
) -> Result<T, StorageError>
where
    F: FnOnce(&mut WriteSession<'_>) -> Result<T, StorageError>,
{
    // Only the writer thread replaces the snapshot, so it cannot move under us.
    let before = shared.snapshot.read().clone();
    let tx = conn.transaction()?;

    let mut session = WriteSession {
        conn: &tx,
        working: (*before).clone(),
        version: before.version() + 1,
        changed: false,
    };
    let value = mutation(&mut session)?;
    let WriteSession {
        mut working,
        version,
        changed,
        ..
    } = session;

    if changed {
        db::save_version_row(&tx, version)?;
    }
    tx.commit()?;

    if changed {
        working.set_version(version);
        publish(shared, &before, working);
    }
    Ok(value)
}

fn publish(shared: &Shared, before: &Snapshot, after: Snapshot) {
    let after = Arc::new(after);
    let mut observers = shared.observers.lock();
    *shared.snapshot.write() = after.clone();

    observers.retain(|observer| {
        let changes = diff(
            &collect(before, &observer.observation),
            &collect(&after, &observer.observation),
        );
        if changes.is_empty() {
            return !observer.tx.is_closed();
        }
        observer
            .tx
            .send(DiffBatch {
                version: after.version(),
                changes,
            })
            .is_ok()
    });
}

/// Mutation handle passed to a write transaction.
///
/// Changes go to the database transaction and to a private copy of the
/// snapshot. Both are discarded if the mutation returns an error.
pub struct WriteSession<'a> {
    conn: &'a Connection,
    working: Snapshot,
    version: u64,
    changed: bool,
}

impl WriteSession<'_> {
    /// Version this transaction commits as.
    pub fn version(&self) -> u64 {
        self.version
    }

    pub fn entity(&self, kind: EntityKind, id: &EntityId) -> Option<&Entity> {
        self.working.entity(kind, id)
    }

    pub fn query_record(&self, hash: &FilterHash) -> Option<&QueryRecord> {
        self.working.query_record(hash)
    }

    /// Insert or merge an entity. Non-null incoming attributes overwrite stored ones.
    ///
    /// Returns whether anything changed.
    pub fn upsert_entity(&mut self, incoming: Entity) -> Result<bool, StorageError> {
        let mut entity = match self.working.entity(incoming.kind, &incoming.id) {
            Some(existing) => {
                let mut merged = existing.clone();
                if !merged.merge_from(&incoming) {
                    return Ok(false);
                }
                merged
            }
            None => {
                let mut fresh = incoming;
                fresh.attributes.retain(|_, value| !value.is_null());
                fresh
            }
        };
        entity.version = self.version;

        db::upsert_entity_row(self.conn, &entity)?;
        self.working.insert_entity(entity);
        self.changed = true;
        Ok(true)
    }

    /// Remove an entity and every membership pointing at it.
    pub fn delete_entity(&mut self, kind: EntityKind, id: &EntityId) -> Result<bool, StorageError> {
        if self.working.entity(kind, id).is_none() {
            return Ok(false);
        }
        db::delete_entity_row(self.conn, kind, id)?;
        self.working.remove_entity(kind, id);

        let linked: Vec<QueryRecord> = self
            .working
            .query_records()
            .filter(|q| q.kind == kind && q.contains(id))
            .cloned()
            .collect();
        for mut record in linked {
            record.member_ids.remove(id);
            self.working.put_query(record);
        }

        self.changed = true;
        Ok(true)
    }

    /// Create or update the query record for `query` with the given members.
    ///
    /// Every id must already have an entity row of the query's kind.
    pub fn save_query_record(
        &mut self,
        query: &ListQuery,
        ids: impl IntoIterator<Item = EntityId>,
        policy: UpdatePolicy,
    ) -> Result<QueryRecord, StorageError> {
        let ids: BTreeSet<EntityId> = ids.into_iter().collect();
        for id in &ids {
            self.require_entity(query.kind, id)?;
        }

        let hash = query.filter_hash();
        let existing = self.working.query_record(&hash).cloned();
        if let Some(existing) = &existing {
            if existing.kind != query.kind {
                return Err(StorageError::Conflict(format!(
                    "query {hash} is registered for {} not {}",
                    existing.kind, query.kind
                )));
            }
        }

        let previous = existing
            .as_ref()
            .map(|r| r.member_ids.clone())
            .unwrap_or_default();
        let mut record = QueryRecord::from_query(query);
        record.member_ids = match policy {
            UpdatePolicy::Merge => previous.union(&ids).cloned().collect(),
            UpdatePolicy::Replace => ids,
        };

        if existing.as_ref() == Some(&record) {
            return Ok(record);
        }

        db::upsert_query_row(self.conn, &record)?;
        for id in record.member_ids.difference(&previous) {
            db::insert_member_row(self.conn, &hash, id)?;
        }
        for id in previous.difference(&record.member_ids) {
            db::delete_member_row(self.conn, &hash, id)?;
        }

        tracing::debug!(
            filter_hash = %hash,
            kind = %query.kind,
            members = record.member_ids.len(),
            ?policy,
            "Saved query record"
        );
        self.working.put_query(record.clone());
        self.changed = true;
        Ok(record)
    }

    /// Add one member to an existing query record.
    pub fn link(&mut self, hash: &FilterHash, id: &EntityId) -> Result<bool, StorageError> {
        let mut record = self.require_query(hash)?;
        self.require_entity(record.kind, id)?;
        if !record.member_ids.insert(id.clone()) {
            return Ok(false);
        }
        db::insert_member_row(self.conn, hash, id)?;
        self.working.put_query(record);
        self.changed = true;
        Ok(true)
    }

    /// Remove one member from an existing query record. The entity stays cached.
    pub fn unlink(&mut self, hash: &FilterHash, id: &EntityId) -> Result<bool, StorageError> {
        let mut record = self.require_query(hash)?;
        if !record.member_ids.remove(id) {
            return Ok(false);
        }
        db::delete_member_row(self.conn, hash, id)?;
        self.working.put_query(record);
        self.changed = true;
        Ok(true)
    }

    fn require_entity(&self, kind: EntityKind, id: &EntityId) -> Result<(), StorageError> {
        match self.working.entity(kind, id) {
            Some(_) => Ok(()),
            None => Err(StorageError::Constraint(format!("no {kind} entity with id {id}"))),
        }
    }

    fn require_query(&self, hash: &FilterHash) -> Result<QueryRecord, StorageError> {
        self.working
            .query_record(hash)
            .cloned()
            .ok_or_else(|| StorageError::Constraint(format!("no query record {hash}")))
    }
}
