use std::sync::Arc;

use tokio::task::JoinHandle;

use crate::error::{NetworkError, StorageError, SyncError};
use crate::filter::FilterExpression;
use crate::models::EntityId;
use crate::query::{ListQuery, Pagination, QueryRecord, UpdatePolicy};
use crate::remote::{ListRequest, Page, RemoteFetcher};
use crate::store::LocalStore;

/// Result of re-checking one entity against one query.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MembershipChange {
    Linked,
    Unlinked,
    Unchanged,
}

/// Fetches a list query and applies the page to the local store.
#[derive(Clone)]
pub struct ListUpdater {
    store: LocalStore,
    fetcher: Arc<dyn RemoteFetcher>,
}

impl ListUpdater {
    pub fn new(store: LocalStore, fetcher: Arc<dyn RemoteFetcher>) -> Self {
        Self { store, fetcher }
    }

    pub fn store(&self) -> &LocalStore {
        &self.store
    }

    pub async fn fetch(&self, query: &ListQuery) -> Result<Page, NetworkError> {
        self.fetcher.fetch(&ListRequest::from_query(query)).await
    }

    /// Fetch `query` and store the page under `policy`.
    ///
    /// Resolves only after the write has committed. On a fetch error nothing is
    /// written, so a query that did not exist before still does not exist.
    pub async fn update(
        &self,
        query: &ListQuery,
        policy: UpdatePolicy,
    ) -> Result<QueryRecord, SyncError> {
        let filter_hash = query.filter_hash();
        let page = self.fetch(query).await.map_err(|e| {
            tracing::warn!(%filter_hash, error = %e, "List fetch failed");
            e
        })?;
        let fetched = page.entities.len();

        let query = query.clone();
        let record = self
            .store
            .write(move |session| {
                let mut ids = Vec::with_capacity(page.entities.len());
                for entity in page.entities {
                    if entity.kind != query.kind {
                        return Err(StorageError::Conflict(format!(
                            "{} {} returned for a {} query",
                            entity.kind, entity.id, query.kind
                        )));
                    }
                    ids.push(entity.id.clone());
                    session.upsert_entity(entity)?;
                }
                session.save_query_record(&query, ids, policy)
            })
            .await?;

        tracing::info!(
            %filter_hash,
            kind = %record.kind,
            fetched,
            members = record.member_ids.len(),
            ?policy,
            "Query updated"
        );
        Ok(record)
    }

    /// Run [`update`](Self::update) on a task and hand the outcome to `completion`.
    pub fn update_with_completion<F>(
        &self,
        query: ListQuery,
        policy: UpdatePolicy,
        completion: F,
    ) -> JoinHandle<()>
    where
        F: FnOnce(Result<QueryRecord, SyncError>) + Send + 'static,
    {
        let updater = self.clone();
        tokio::spawn(async move {
            let result = updater.update(&query, policy).await;
            completion(result);
        })
    }

    /// Ask the backend whether `entity_id` matches `record`'s filter and link or
    /// unlink it accordingly. Other members of the record are left alone.
    pub async fn update_membership(
        &self,
        record: &QueryRecord,
        entity_id: &EntityId,
    ) -> Result<MembershipChange, SyncError> {
        let check = ListQuery::new(
            record.kind,
            record
                .filter
                .and(FilterExpression::id_equals(record.kind, entity_id)),
        )
        .with_pagination(Pagination {
            limit: 1,
            cursor: None,
        });

        let page = self.fetch(&check).await?;
        let found = page
            .entities
            .into_iter()
            .find(|e| e.kind == record.kind && &e.id == entity_id);

        let hash = record.filter_hash.clone();
        let id = entity_id.clone();
        let change = self
            .store
            .write(move |session| match found {
                Some(entity) => {
                    session.upsert_entity(entity)?;
                    Ok(if session.link(&hash, &id)? {
                        MembershipChange::Linked
                    } else {
                        MembershipChange::Unchanged
                    })
                }
                None => Ok(if session.unlink(&hash, &id)? {
                    MembershipChange::Unlinked
                } else {
                    MembershipChange::Unchanged
                }),
            })
            .await?;

        tracing::debug!(
            filter_hash = %record.filter_hash,
            entity_id = %entity_id,
            ?change,
            "Membership checked"
        );
        Ok(change)
    }
}
