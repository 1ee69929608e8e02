use crate::error::SyncError;
use crate::filter::FilterHash;
use crate::models::EntityKind;

#[derive(Debug, Clone, PartialEq)]
pub enum CoreEvent {
    /// An update or refresh committed.
    QueryUpdated {
        filter_hash: FilterHash,
        kind: EntityKind,
        members: usize,
    },
    /// An update or refresh failed. The query record is as it was before.
    UpdateFailed {
        filter_hash: FilterHash,
        error: SyncError,
    },
}
