use crate::models::EntityKind;
use crate::query::QueryRecord;
use crate::store::LocalStore;

/// Read path over the local store listing the queries this device tracks.
#[derive(Clone)]
pub struct QueryRegistry {
    store: LocalStore,
}

impl QueryRegistry {
    pub fn new(store: LocalStore) -> Self {
        Self { store }
    }

    /// Query records of `kind` that are observed in the background, ordered by filter hash.
    pub fn registered_queries(&self, kind: EntityKind) -> Vec<QueryRecord> {
        self.store
            .snapshot()
            .query_records()
            .filter(|q| q.kind == kind && q.observe_in_background)
            .cloned()
            .collect()
    }

    /// Every query record regardless of kind or observation flag.
    pub fn all_queries(&self) -> Vec<QueryRecord> {
        self.store.snapshot().query_records().cloned().collect()
    }
}
