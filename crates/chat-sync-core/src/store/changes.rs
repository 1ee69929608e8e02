use std::collections::{HashMap, HashSet};

use tokio::sync::mpsc;

use crate::filter::FilterHash;
use crate::models::{Entity, EntityId, EntityKind};

use super::snapshot::Snapshot;

/// Which entities of a kind an observer is interested in.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChangeScope {
    All,
    /// Entities not linked to any query record of their kind.
    Unlinked,
    /// Members of one query record.
    QueryMembers(FilterHash),
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum ListOrder {
    #[default]
    ById,
    /// Most recently changed first, ties broken by id.
    RecentlyUpdated,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Observation {
    pub kind: EntityKind,
    pub scope: ChangeScope,
    pub order: ListOrder,
}

impl Observation {
    pub fn new(kind: EntityKind, scope: ChangeScope) -> Self {
        Self {
            kind,
            scope,
            order: ListOrder::ById,
        }
    }

    pub fn ordered(mut self, order: ListOrder) -> Self {
        self.order = order;
        self
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum ListChange {
    Insert { entity: Entity, index: usize },
    Update { entity: Entity, index: usize },
    Delete { entity: Entity, index: usize },
    Move { entity: Entity, from: usize, to: usize },
}

impl ListChange {
    pub fn entity(&self) -> &Entity {
        match self {
            ListChange::Insert { entity, .. }
            | ListChange::Update { entity, .. }
            | ListChange::Delete { entity, .. }
            | ListChange::Move { entity, .. } => entity,
        }
    }
}

/// All changes one commit made to an observed list.
#[derive(Debug, Clone, PartialEq)]
pub struct DiffBatch {
    pub version: u64,
    pub changes: Vec<ListChange>,
}

impl DiffBatch {
    pub fn inserted(&self) -> impl Iterator<Item = &Entity> {
        self.changes.iter().filter_map(|change| match change {
            ListChange::Insert { entity, .. } => Some(entity),
            _ => None,
        })
    }
}

/// Receiving end of a store observation. Dropping it unsubscribes.
///
/// Batches are queued without bound, so a slow consumer never loses one.
pub struct ChangeSubscription {
    rx: mpsc::UnboundedReceiver<DiffBatch>,
}

impl ChangeSubscription {
    pub(crate) fn new(rx: mpsc::UnboundedReceiver<DiffBatch>) -> Self {
        Self { rx }
    }

    pub async fn next(&mut self) -> Option<DiffBatch> {
        self.rx.recv().await
    }

    pub fn try_next(&mut self) -> Option<DiffBatch> {
        self.rx.try_recv().ok()
    }
}

/// The observed list as of `snapshot`, in observation order.
pub(crate) fn collect(snapshot: &Snapshot, observation: &Observation) -> Vec<Entity> {
    let mut items: Vec<Entity> = match &observation.scope {
        ChangeScope::All => snapshot.entities_of(observation.kind).cloned().collect(),
        ChangeScope::Unlinked => {
            let linked = snapshot.linked_ids(observation.kind);
            snapshot
                .entities_of(observation.kind)
                .filter(|e| !linked.contains(&e.id))
                .cloned()
                .collect()
        }
        ChangeScope::QueryMembers(hash) => match snapshot.query_record(hash) {
            Some(record) if record.kind == observation.kind => record
                .member_ids
                .iter()
                .filter_map(|id| snapshot.entity(observation.kind, id).cloned())
                .collect(),
            _ => Vec::new(),
        },
    };

    match observation.order {
        ListOrder::ById => items.sort_by(|a, b| a.id.cmp(&b.id)),
        ListOrder::RecentlyUpdated => {
            items.sort_by(|a, b| b.version.cmp(&a.version).then_with(|| a.id.cmp(&b.id)))
        }
    }
    items
}

/// Deterministic diff between two ordered lists.
///
/// Deletes carry their old index, inserts and updates their new index. Among
/// items present in both lists, the longest run of unchanged items that kept
/// their relative order stays put. Everything else is a move, except changed
/// items that still sit between their stationary neighbours, which are updates.
pub(crate) fn diff(old: &[Entity], new: &[Entity]) -> Vec<ListChange> {
    let old_index: HashMap<&EntityId, usize> =
        old.iter().enumerate().map(|(i, e)| (&e.id, i)).collect();
    let new_index: HashMap<&EntityId, usize> =
        new.iter().enumerate().map(|(i, e)| (&e.id, i)).collect();

    let mut changes = Vec::new();

    for (index, entity) in old.iter().enumerate() {
        if !new_index.contains_key(&entity.id) {
            changes.push(ListChange::Delete {
                entity: entity.clone(),
                index,
            });
        }
    }

    for (index, entity) in new.iter().enumerate() {
        if !old_index.contains_key(&entity.id) {
            changes.push(ListChange::Insert {
                entity: entity.clone(),
                index,
            });
        }
    }

    // Surviving items in new order, with their old position and whether their content changed.
    let surviving: Vec<(&Entity, usize, bool)> = new
        .iter()
        .filter_map(|e| {
            let from = *old_index.get(&e.id)?;
            Some((e, from, old[from] != *e))
        })
        .collect();

    // Unchanged items on the longest run that kept its relative order stay put.
    let unchanged: Vec<usize> = (0..surviving.len())
        .filter(|&i| !surviving[i].2)
        .collect();
    let kept: HashSet<usize> = longest_increasing(&unchanged, |i| surviving[i].1)
        .into_iter()
        .collect();

    let mut next_kept = vec![None; surviving.len()];
    let mut upcoming = None;
    for i in (0..surviving.len()).rev() {
        next_kept[i] = upcoming;
        if kept.contains(&i) {
            upcoming = Some(surviving[i].1);
        }
    }

    let mut previous_kept: Option<usize> = None;
    for (i, &(entity, from, changed)) in surviving.iter().enumerate() {
        let to = new_index[&entity.id];
        if kept.contains(&i) {
            previous_kept = Some(from);
            continue;
        }
        let in_place = changed
            && previous_kept.map_or(true, |p| p < from)
            && next_kept[i].map_or(true, |n| from < n);
        if in_place {
            changes.push(ListChange::Update {
                entity: entity.clone(),
                index: to,
            });
        } else {
            changes.push(ListChange::Move {
                entity: entity.clone(),
                from,
                to,
            });
        }
    }

    changes
}

/// Longest subsequence of `items` whose keys strictly increase.
fn longest_increasing(items: &[usize], key: impl Fn(usize) -> usize) -> Vec<usize> {
    let mut tails: Vec<usize> = Vec::new();
    let mut previous: Vec<Option<usize>> = vec![None; items.len()];

    for pos in 0..items.len() {
        let k = key(items[pos]);
        let slot = tails.partition_point(|&t| key(items[t]) < k);
        previous[pos] = slot.checked_sub(1).map(|s| tails[s]);
        if slot == tails.len() {
            tails.push(pos);
        } else {
            tails[slot] = pos;
        }
    }

    let mut result = Vec::with_capacity(tails.len());
    let mut cursor = tails.last().copied();
    while let Some(pos) = cursor {
        result.push(items[pos]);
        cursor = previous[pos];
    }
    result.reverse();
    result
}

#[cfg(test)]
mod tests {
    use super::*;

    fn user(id: &str, version: u64) -> Entity {
        let mut entity = Entity::new(EntityKind::User, id);
        entity.version = version;
        entity
    }

    #[test]
    fn test_diff_reports_insert_and_delete_indices() {
        let old = vec![user("a", 1), user("b", 1)];
        let new = vec![user("b", 1), user("c", 2)];
        let changes = diff(&old, &new);
        assert_eq!(
            changes,
            vec![
                ListChange::Delete {
                    entity: user("a", 1),
                    index: 0
                },
                ListChange::Insert {
                    entity: user("c", 2),
                    index: 1
                },
            ]
        );
    }

    #[test]
    fn test_diff_reports_update_in_place() {
        let old = vec![user("a", 1), user("b", 1)];
        let new = vec![user("a", 1), user("b", 2).with_attribute("name", "Bee")];
        let changes = diff(&old, &new);
        assert_eq!(changes.len(), 1);
        assert!(matches!(changes[0], ListChange::Update { index: 1, .. }));
    }

    #[test]
    fn test_diff_reports_move_when_rank_changes() {
        let old = vec![user("a", 2), user("b", 1)];
        let new = vec![user("b", 3), user("a", 2)];
        let changes = diff(&old, &new);
        assert_eq!(
            changes,
            vec![ListChange::Move {
                entity: user("b", 3),
                from: 1,
                to: 0
            }]
        );
    }

    #[test]
    fn test_diff_of_identical_lists_is_empty() {
        let list = vec![user("a", 1), user("b", 1)];
        assert!(diff(&list, &list).is_empty());
    }

    #[test]
    fn test_collect_orders_recently_updated_first() {
        let mut snapshot = Snapshot::default();
        snapshot.insert_entity(user("a", 1));
        snapshot.insert_entity(user("b", 5));
        snapshot.insert_entity(user("c", 3));
        let observation =
            Observation::new(EntityKind::User, ChangeScope::All).ordered(ListOrder::RecentlyUpdated);
        let ids: Vec<String> = collect(&snapshot, &observation)
            .into_iter()
            .map(|e| e.id.to_string())
            .collect();
        assert_eq!(ids, vec!["b", "c", "a"]);
    }
}
