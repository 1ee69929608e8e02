pub mod http;
pub mod payload;
#[cfg(test)]
pub(crate) mod testing;

use async_trait::async_trait;
use serde_json::Value;

use crate::error::NetworkError;
use crate::filter::FilterExpression;
use crate::models::{Entity, EntityKind};
use crate::query::{Cursor, ListQuery, Pagination, Sorting};

pub use http::HttpFetcher;

/// One paginated "list entities matching filter" request.
#[derive(Debug, Clone, PartialEq)]
pub struct ListRequest {
    pub kind: EntityKind,
    pub filter: FilterExpression,
    pub sort: Vec<Sorting>,
    pub pagination: Pagination,
}

impl ListRequest {
    pub fn from_query(query: &ListQuery) -> Self {
        Self {
            kind: query.kind,
            filter: query.filter.clone(),
            sort: query.sort.clone(),
            pagination: query.pagination.clone(),
        }
    }

    /// Body of the `payload` parameter.
    pub fn to_payload(&self) -> Value {
        let mut payload = serde_json::json!({
            "filter_conditions": self.filter.to_json(),
            "sort": self.sort.iter().map(Sorting::to_json).collect::<Vec<_>>(),
            "limit": self.pagination.limit,
        });
        if let Some(cursor) = &self.pagination.cursor {
            payload["next"] = Value::String(cursor.as_str().to_string());
        }
        payload
    }
}

/// A page of results. Transient, never stored as such.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Page {
    pub entities: Vec<Entity>,
    pub next_cursor: Option<Cursor>,
}

/// Issues list requests against the backend.
///
/// One logical request per call and no retries. Errors are returned as-is.
#[async_trait]
pub trait RemoteFetcher: Send + Sync {
    async fn fetch(&self, request: &ListRequest) -> Result<Page, NetworkError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_payload_carries_filter_sort_and_cursor() {
        let query = ListQuery::users(FilterExpression::equal("id", "Luke").unwrap())
            .with_sort(vec![Sorting::descending("last_active")])
            .with_pagination(Pagination {
                limit: 10,
                cursor: Some(Cursor::new("abc")),
            });
        let payload = ListRequest::from_query(&query).to_payload();
        assert_eq!(
            payload,
            serde_json::json!({
                "filter_conditions": {"id": {"$eq": "Luke"}},
                "sort": [{"field": "last_active", "direction": -1}],
                "limit": 10,
                "next": "abc",
            })
        );
    }

    #[test]
    fn test_first_page_has_no_cursor() {
        let query = ListQuery::channels(FilterExpression::exists("name", true).unwrap());
        let payload = ListRequest::from_query(&query).to_payload();
        assert_eq!(payload["limit"], 20);
        assert!(payload.get("next").is_none());
    }
}
