use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::{Notify, Semaphore};

use crate::error::NetworkError;
use crate::models::Entity;
use crate::query::sort_entities;

use super::{ListRequest, Page, RemoteFetcher};

type FailurePredicate = Box<dyn Fn(&ListRequest) -> bool + Send + Sync>;

/// In-memory backend that answers requests by evaluating the filter locally.
#[derive(Default)]
pub struct FakeBackend {
    dataset: Mutex<Vec<Entity>>,
    failures: Mutex<Vec<(FailurePredicate, NetworkError)>>,
    requests: Mutex<Vec<ListRequest>>,
}

impl FakeBackend {
    pub fn with_entities(entities: impl IntoIterator<Item = Entity>) -> Self {
        let backend = Self::default();
        backend.dataset.lock().extend(entities);
        backend
    }

    pub fn insert(&self, entity: Entity) {
        let mut dataset = self.dataset.lock();
        dataset.retain(|e| !(e.kind == entity.kind && e.id == entity.id));
        dataset.push(entity);
    }

    /// Fail every request matching `predicate` with `error`.
    pub fn fail_when(
        &self,
        predicate: impl Fn(&ListRequest) -> bool + Send + Sync + 'static,
        error: NetworkError,
    ) {
        self.failures.lock().push((Box::new(predicate), error));
    }

    pub fn requests(&self) -> Vec<ListRequest> {
        self.requests.lock().clone()
    }
}

#[async_trait]
impl RemoteFetcher for FakeBackend {
    async fn fetch(&self, request: &ListRequest) -> Result<Page, NetworkError> {
        self.requests.lock().push(request.clone());

        let failure = self
            .failures
            .lock()
            .iter()
            .find(|(predicate, _)| predicate(request))
            .map(|(_, error)| error.clone());
        if let Some(error) = failure {
            return Err(error);
        }

        let mut entities: Vec<Entity> = self
            .dataset
            .lock()
            .iter()
            .filter(|e| e.kind == request.kind && request.filter.matches(e))
            .cloned()
            .collect();
        sort_entities(&mut entities, &request.sort);
        entities.truncate(request.pagination.limit as usize);

        Ok(Page {
            entities,
            next_cursor: None,
        })
    }
}

/// Holds every fetch until [`release`](Self::release) lets it through, then
/// answers from the wrapped backend. Fetches are released in arrival order.
pub struct GatedFetcher {
    backend: Arc<FakeBackend>,
    started: Notify,
    gate: Semaphore,
}

impl GatedFetcher {
    pub fn new(backend: Arc<FakeBackend>) -> Self {
        Self {
            backend,
            started: Notify::new(),
            gate: Semaphore::new(0),
        }
    }

    /// Resolves once a fetch is waiting at the gate.
    pub async fn fetch_started(&self) {
        self.started.notified().await;
    }

    pub fn release(&self, fetches: usize) {
        self.gate.add_permits(fetches);
    }
}

#[async_trait]
impl RemoteFetcher for GatedFetcher {
    async fn fetch(&self, request: &ListRequest) -> Result<Page, NetworkError> {
        self.started.notify_one();
        let permit = self
            .gate
            .acquire()
            .await
            .map_err(|e| NetworkError::Transport(e.to_string()))?;
        permit.forget();
        self.backend.fetch(request).await
    }
}
