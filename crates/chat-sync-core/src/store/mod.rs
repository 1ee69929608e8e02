pub mod changes;
pub mod db;
pub mod local_store;
pub mod snapshot;

pub use changes::{ChangeScope, ChangeSubscription, DiffBatch, ListChange, ListOrder, Observation};
pub use db::Database;
pub use local_store::{LocalStore, WriteSession};
pub use snapshot::Snapshot;
