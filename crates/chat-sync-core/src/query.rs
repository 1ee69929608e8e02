use std::cmp::Ordering;
use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::constants::default_page_size;
use crate::filter::{FilterExpression, FilterHash};
use crate::models::{Entity, EntityId, EntityKind};

/// How a fresh page is applied to a query's existing members.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UpdatePolicy {
    /// Union of existing members and the page.
    #[default]
    Merge,
    /// Members become exactly the page. Dropped members stay cached, only unlinked.
    Replace,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Cursor(String);

impl Cursor {
    pub fn new(cursor: impl Into<String>) -> Self {
        Self(cursor.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Pagination {
    pub limit: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cursor: Option<Cursor>,
}

impl Pagination {
    pub fn first_page(kind: EntityKind) -> Self {
        Self {
            limit: default_page_size(kind),
            cursor: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SortDirection {
    Ascending,
    Descending,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Sorting {
    pub field: String,
    pub direction: SortDirection,
}

impl Sorting {
    pub fn ascending(field: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            direction: SortDirection::Ascending,
        }
    }

    pub fn descending(field: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            direction: SortDirection::Descending,
        }
    }

    /// Backend encoding: `{"field": "...", "direction": 1 | -1}`.
    pub fn to_json(&self) -> Value {
        let direction = match self.direction {
            SortDirection::Ascending => 1,
            SortDirection::Descending => -1,
        };
        serde_json::json!({ "field": self.field, "direction": direction })
    }
}

/// A server-driven list query.
#[derive(Debug, Clone, PartialEq)]
pub struct ListQuery {
    pub kind: EntityKind,
    pub filter: FilterExpression,
    pub sort: Vec<Sorting>,
    pub pagination: Pagination,
    pub observe_in_background: bool,
    explicit_hash: Option<FilterHash>,
}

impl ListQuery {
    pub fn new(kind: EntityKind, filter: FilterExpression) -> Self {
        Self {
            kind,
            filter,
            sort: Vec::new(),
            pagination: Pagination::first_page(kind),
            observe_in_background: true,
            explicit_hash: None,
        }
    }

    pub fn users(filter: FilterExpression) -> Self {
        Self::new(EntityKind::User, filter)
    }

    pub fn channels(filter: FilterExpression) -> Self {
        Self::new(EntityKind::Channel, filter)
    }

    pub fn with_sort(mut self, sort: Vec<Sorting>) -> Self {
        self.sort = sort;
        self
    }

    pub fn with_pagination(mut self, pagination: Pagination) -> Self {
        self.pagination = pagination;
        self
    }

    /// Pin the identity key instead of deriving it from the filter.
    pub fn with_explicit_hash(mut self, hash: FilterHash) -> Self {
        self.explicit_hash = Some(hash);
        self
    }

    /// Queries that are not observed are skipped by the reconciler.
    pub fn observed(mut self, observe_in_background: bool) -> Self {
        self.observe_in_background = observe_in_background;
        self
    }

    pub fn filter_hash(&self) -> FilterHash {
        self.explicit_hash
            .clone()
            .unwrap_or_else(|| self.filter.hash())
    }
}

/// Persisted association between a filter and the entity ids believed to match it.
#[derive(Debug, Clone, PartialEq)]
pub struct QueryRecord {
    pub filter_hash: FilterHash,
    pub kind: EntityKind,
    pub filter: FilterExpression,
    pub sort: Vec<Sorting>,
    pub observe_in_background: bool,
    pub member_ids: BTreeSet<EntityId>,
}

impl QueryRecord {
    pub fn from_query(query: &ListQuery) -> Self {
        Self {
            filter_hash: query.filter_hash(),
            kind: query.kind,
            filter: query.filter.clone(),
            sort: query.sort.clone(),
            observe_in_background: query.observe_in_background,
            member_ids: BTreeSet::new(),
        }
    }

    pub fn contains(&self, id: &EntityId) -> bool {
        self.member_ids.contains(id)
    }

    /// Rebuild the list query this record was saved from.
    pub fn to_query(&self) -> ListQuery {
        ListQuery::new(self.kind, self.filter.clone())
            .with_sort(self.sort.clone())
            .with_explicit_hash(self.filter_hash.clone())
            .observed(self.observe_in_background)
    }
}

/// Order entities by the given sort keys, falling back to id. Missing fields sort last.
pub fn sort_entities(entities: &mut [Entity], sort: &[Sorting]) {
    entities.sort_by(|a, b| {
        for key in sort {
            let ordering = match (a.field(&key.field), b.field(&key.field)) {
                (Some(x), Some(y)) => match key.direction {
                    SortDirection::Ascending => compare_values(&x, &y),
                    SortDirection::Descending => compare_values(&y, &x),
                },
                (Some(_), None) => Ordering::Less,
                (None, Some(_)) => Ordering::Greater,
                (None, None) => Ordering::Equal,
            };
            if ordering != Ordering::Equal {
                return ordering;
            }
        }
        a.id.cmp(&b.id)
    });
}

fn compare_values(a: &Value, b: &Value) -> Ordering {
    match (a, b) {
        (Value::Number(x), Value::Number(y)) => x
            .as_f64()
            .partial_cmp(&y.as_f64())
            .unwrap_or(Ordering::Equal),
        (Value::String(x), Value::String(y)) => x.cmp(y),
        (Value::Bool(x), Value::Bool(y)) => x.cmp(y),
        _ => a.to_string().cmp(&b.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_explicit_hash_overrides_filter_hash() {
        let filter = FilterExpression::equal("id", "Luke").unwrap();
        let query = ListQuery::users(filter.clone());
        assert_eq!(query.filter_hash(), filter.hash());

        let pinned = query.with_explicit_hash(FilterHash::new("pinned"));
        assert_eq!(pinned.filter_hash(), FilterHash::new("pinned"));
    }

    #[test]
    fn test_default_pagination_depends_on_kind() {
        let filter = FilterExpression::exists("id", true).unwrap();
        assert_eq!(ListQuery::users(filter.clone()).pagination.limit, 30);
        assert_eq!(ListQuery::channels(filter).pagination.limit, 20);
    }

    #[test]
    fn test_sort_entities_by_field_then_id() {
        let mut entities = vec![
            Entity::new(EntityKind::User, "c").with_attribute("age", 20),
            Entity::new(EntityKind::User, "a").with_attribute("age", 30),
            Entity::new(EntityKind::User, "b").with_attribute("age", 30),
            Entity::new(EntityKind::User, "d"),
        ];
        sort_entities(&mut entities, &[Sorting::descending("age")]);
        let ids: Vec<&str> = entities.iter().map(|e| e.id.as_str()).collect();
        assert_eq!(ids, vec!["a", "b", "c", "d"]);
    }

    #[test]
    fn test_record_round_trips_to_query() {
        let query = ListQuery::users(FilterExpression::equal("role", "admin").unwrap())
            .with_sort(vec![Sorting::ascending("name")])
            .observed(false);
        let record = QueryRecord::from_query(&query);
        let rebuilt = record.to_query();
        assert_eq!(rebuilt.filter_hash(), query.filter_hash());
        assert_eq!(rebuilt.sort, query.sort);
        assert!(!rebuilt.observe_in_background);
    }
}
