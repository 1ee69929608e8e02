/// Raised while building or parsing a filter expression. Never produced at evaluation time.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum FilterError {
    #[error("Filter field name must not be empty")]
    EmptyField,
    #[error("Filter group {0} needs at least one child")]
    EmptyGroup(&'static str),
    #[error("Filter operator {0} needs at least one value")]
    EmptyValues(&'static str),
    #[error("Unknown filter operator: {0}")]
    UnknownOperator(String),
    #[error("Malformed filter: {0}")]
    Malformed(String),
}

/// Failure of a single remote list request. Surfaced verbatim to the caller.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum NetworkError {
    #[error("Request timed out")]
    Timeout,
    #[error("Server error ({code}): {message}")]
    Server { code: u16, message: String },
    #[error("Failed to decode response: {0}")]
    Decode(String),
    #[error("Transport error: {0}")]
    Transport(String),
}

impl From<reqwest::Error> for NetworkError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            NetworkError::Timeout
        } else if err.is_decode() {
            NetworkError::Decode(err.to_string())
        } else if let Some(status) = err.status() {
            NetworkError::Server {
                code: status.as_u16(),
                message: err.to_string(),
            }
        } else {
            NetworkError::Transport(err.to_string())
        }
    }
}

/// Failure of a write transaction. The transaction is rolled back in full.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StorageError {
    #[error("Write conflict: {0}")]
    Conflict(String),
    #[error("Constraint violation: {0}")]
    Constraint(String),
    #[error("Encoding error: {0}")]
    Encode(String),
    #[error("Database error: {0}")]
    Sqlite(String),
    #[error("Store writer is closed")]
    WriterClosed,
}

impl From<rusqlite::Error> for StorageError {
    fn from(err: rusqlite::Error) -> Self {
        if let rusqlite::Error::SqliteFailure(ref failure, _) = err {
            if failure.code == rusqlite::ErrorCode::ConstraintViolation {
                return StorageError::Constraint(err.to_string());
            }
        }
        StorageError::Sqlite(err.to_string())
    }
}

impl From<serde_json::Error> for StorageError {
    fn from(err: serde_json::Error) -> Self {
        StorageError::Encode(err.to_string())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SyncError {
    #[error(transparent)]
    Filter(#[from] FilterError),
    #[error(transparent)]
    Network(#[from] NetworkError),
    #[error(transparent)]
    Storage(#[from] StorageError),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sync_error_wraps_network_error_verbatim() {
        let err: SyncError = NetworkError::Timeout.into();
        assert_eq!(err, SyncError::Network(NetworkError::Timeout));
        assert_eq!(err.to_string(), "Request timed out");
    }

    #[test]
    fn test_sqlite_constraint_maps_to_constraint() {
        let conn = rusqlite::Connection::open_in_memory().unwrap();
        conn.execute_batch("CREATE TABLE t (id TEXT PRIMARY KEY); INSERT INTO t VALUES ('a');")
            .unwrap();
        let err = conn
            .execute("INSERT INTO t VALUES ('a')", [])
            .map_err(StorageError::from)
            .unwrap_err();
        assert!(matches!(err, StorageError::Constraint(_)));
    }
}
