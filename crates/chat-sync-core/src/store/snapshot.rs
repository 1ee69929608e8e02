use std::collections::HashSet;

use crate::filter::FilterHash;
use crate::models::{Entity, EntityId, EntityKind};
use crate::query::{sort_entities, QueryRecord};

/// Immutable view of committed store state.
///
/// Backed by persistent maps, so cloning is cheap and a write transaction can
/// work on its own copy without disturbing concurrent readers.
#[derive(Debug, Clone, Default)]
pub struct Snapshot {
    version: u64,
    entities: im::OrdMap<(EntityKind, EntityId), Entity>,
    queries: im::OrdMap<FilterHash, QueryRecord>,
}

impl Snapshot {
    /// Monotonic commit counter. Bumped once per write transaction that changed something.
    pub fn version(&self) -> u64 {
        self.version
    }

    pub fn entity(&self, kind: EntityKind, id: &EntityId) -> Option<&Entity> {
        self.entities.get(&(kind, id.clone()))
    }

    pub fn entities(&self) -> impl Iterator<Item = &Entity> {
        self.entities.values()
    }

    pub fn entities_of(&self, kind: EntityKind) -> impl Iterator<Item = &Entity> {
        self.entities.values().filter(move |e| e.kind == kind)
    }

    pub fn query_record(&self, hash: &FilterHash) -> Option<&QueryRecord> {
        self.queries.get(hash)
    }

    pub fn query_records(&self) -> impl Iterator<Item = &QueryRecord> {
        self.queries.values()
    }

    /// Whether any query record of the entity's kind lists it as a member.
    pub fn is_linked(&self, kind: EntityKind, id: &EntityId) -> bool {
        self.queries
            .values()
            .any(|q| q.kind == kind && q.member_ids.contains(id))
    }

    pub fn linked_ids(&self, kind: EntityKind) -> HashSet<EntityId> {
        self.queries
            .values()
            .filter(|q| q.kind == kind)
            .flat_map(|q| q.member_ids.iter().cloned())
            .collect()
    }

    /// Member entities of a query, ordered by the query's sort keys.
    pub fn members(&self, hash: &FilterHash) -> Vec<Entity> {
        let Some(record) = self.queries.get(hash) else {
            return Vec::new();
        };
        let mut members: Vec<Entity> = record
            .member_ids
            .iter()
            .filter_map(|id| self.entity(record.kind, id).cloned())
            .collect();
        sort_entities(&mut members, &record.sort);
        members
    }

    pub(crate) fn insert_entity(&mut self, entity: Entity) {
        self.entities
            .insert((entity.kind, entity.id.clone()), entity);
    }

    pub(crate) fn remove_entity(&mut self, kind: EntityKind, id: &EntityId) -> Option<Entity> {
        self.entities.remove(&(kind, id.clone()))
    }

    pub(crate) fn put_query(&mut self, record: QueryRecord) {
        self.queries.insert(record.filter_hash.clone(), record);
    }

    pub(crate) fn set_version(&mut self, version: u64) {
        self.version = version;
    }
}
