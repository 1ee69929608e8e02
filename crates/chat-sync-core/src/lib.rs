pub mod config;
pub mod constants;
pub mod diagnostics;
pub mod error;
pub mod events;
pub mod filter;
pub mod models;
pub mod query;
pub mod reconciler;
pub mod registry;
pub mod remote;
pub mod runtime;
pub mod stats;
pub mod store;
pub mod tracing_setup;
pub mod updater;

pub use config::{ApiConfig, CoreConfig};
pub use error::{FilterError, NetworkError, StorageError, SyncError};
pub use events::CoreEvent;
pub use filter::{FilterExpression, FilterHash};
pub use query::{ListQuery, QueryRecord, UpdatePolicy};
pub use runtime::{CoreHandle, SyncCommand, SyncRuntime};
