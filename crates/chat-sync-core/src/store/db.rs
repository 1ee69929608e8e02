use std::collections::BTreeMap;
use std::path::Path;

use rusqlite::{params, Connection, OptionalExtension};

use crate::error::StorageError;
use crate::filter::{FilterExpression, FilterHash};
use crate::models::{Entity, EntityId, EntityKind};
use crate::query::{QueryRecord, Sorting};

use super::snapshot::Snapshot;

const VERSION_KEY: &str = "version";

const SCHEMA: &str = r#"
    CREATE TABLE IF NOT EXISTS entities (
        kind TEXT NOT NULL,
        id TEXT NOT NULL,
        attributes TEXT NOT NULL,
        version INTEGER NOT NULL,
        PRIMARY KEY (kind, id)
    );
    CREATE TABLE IF NOT EXISTS list_queries (
        filter_hash TEXT PRIMARY KEY,
        kind TEXT NOT NULL,
        filter_json TEXT NOT NULL,
        sort_json TEXT NOT NULL DEFAULT '[]',
        observe_in_background INTEGER NOT NULL DEFAULT 1
    );
    CREATE TABLE IF NOT EXISTS list_query_members (
        filter_hash TEXT NOT NULL REFERENCES list_queries(filter_hash) ON DELETE CASCADE,
        entity_id TEXT NOT NULL,
        PRIMARY KEY (filter_hash, entity_id)
    );
    CREATE TABLE IF NOT EXISTS store_meta (
        key TEXT PRIMARY KEY,
        value INTEGER NOT NULL
    );
    CREATE INDEX IF NOT EXISTS idx_members_entity ON list_query_members(entity_id);
    CREATE INDEX IF NOT EXISTS idx_queries_kind ON list_queries(kind);
"#;

/// Owns the SQLite connection backing the local store.
pub struct Database {
    conn: Connection,
}

impl Database {
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, StorageError> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| StorageError::Sqlite(format!("create {}: {e}", parent.display())))?;
        }
        let conn = Connection::open(path)?;
        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA synchronous=NORMAL;")?;
        Self::init(conn)
    }

    /// Used in tests and by callers that do not need durability across restarts.
    pub fn open_in_memory() -> Result<Self, StorageError> {
        Self::init(Connection::open_in_memory()?)
    }

    fn init(conn: Connection) -> Result<Self, StorageError> {
        conn.execute_batch("PRAGMA foreign_keys = ON;")?;
        conn.execute_batch(SCHEMA)?;
        Ok(Self { conn })
    }

    /// Rebuild the committed in-memory state from disk.
    pub fn load_snapshot(&self) -> Result<Snapshot, StorageError> {
        let mut snapshot = Snapshot::default();

        let mut stmt = self
            .conn
            .prepare("SELECT kind, id, attributes, version FROM entities")?;
        let rows = stmt.query_map([], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, String>(2)?,
                row.get::<_, i64>(3)?,
            ))
        })?;
        for row in rows {
            let (kind, id, attributes, version) = row?;
            let Some(kind) = EntityKind::parse(&kind) else {
                tracing::warn!(kind = %kind, id = %id, "Skipping entity row with unknown kind");
                continue;
            };
            let attributes: BTreeMap<String, serde_json::Value> =
                serde_json::from_str(&attributes)?;
            snapshot.insert_entity(Entity {
                kind,
                id: EntityId::new(id),
                attributes,
                version: version.max(0) as u64,
            });
        }

        let mut stmt = self.conn.prepare(
            "SELECT filter_hash, kind, filter_json, sort_json, observe_in_background FROM list_queries",
        )?;
        let rows = stmt.query_map([], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, String>(2)?,
                row.get::<_, String>(3)?,
                row.get::<_, bool>(4)?,
            ))
        })?;
        for row in rows {
            let (hash, kind, filter_json, sort_json, observe_in_background) = row?;
            let Some(kind) = EntityKind::parse(&kind) else {
                tracing::warn!(filter_hash = %hash, "Skipping query row with unknown kind");
                continue;
            };
            let filter: FilterExpression = match serde_json::from_str(&filter_json) {
                Ok(filter) => filter,
                Err(e) => {
                    tracing::error!(filter_hash = %hash, error = %e, "Failed to decode stored filter");
                    continue;
                }
            };
            let sort: Vec<Sorting> = serde_json::from_str(&sort_json)?;
            snapshot.put_query(QueryRecord {
                filter_hash: FilterHash::new(hash),
                kind,
                filter,
                sort,
                observe_in_background,
                member_ids: Default::default(),
            });
        }

        let mut stmt = self
            .conn
            .prepare("SELECT filter_hash, entity_id FROM list_query_members")?;
        let rows = stmt.query_map([], |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
        })?;
        for row in rows {
            let (hash, entity_id) = row?;
            let hash = FilterHash::new(hash);
            if let Some(mut record) = snapshot.query_record(&hash).cloned() {
                record.member_ids.insert(EntityId::new(entity_id));
                snapshot.put_query(record);
            }
        }

        let committed: Option<i64> = self
            .conn
            .query_row(
                "SELECT value FROM store_meta WHERE key = ?1",
                params![VERSION_KEY],
                |row| row.get(0),
            )
            .optional()?;
        let entity_max = snapshot.entities().map(|e| e.version).max().unwrap_or(0);
        snapshot.set_version(entity_max.max(committed.unwrap_or(0).max(0) as u64));
        Ok(snapshot)
    }

    pub(crate) fn into_connection(self) -> Connection {
        self.conn
    }
}

pub(crate) fn save_version_row(conn: &Connection, version: u64) -> Result<(), StorageError> {
    conn.execute(
        "INSERT INTO store_meta (key, value) VALUES (?1, ?2)
         ON CONFLICT(key) DO UPDATE SET value = excluded.value",
        params![VERSION_KEY, version as i64],
    )?;
    Ok(())
}

pub(crate) fn upsert_entity_row(conn: &Connection, entity: &Entity) -> Result<(), StorageError> {
    let attributes = serde_json::to_string(&entity.attributes)?;
    conn.execute(
        "INSERT INTO entities (kind, id, attributes, version) VALUES (?1, ?2, ?3, ?4)
         ON CONFLICT(kind, id) DO UPDATE SET attributes = excluded.attributes, version = excluded.version",
        params![
            entity.kind.as_str(),
            entity.id.as_str(),
            attributes,
            entity.version as i64
        ],
    )?;
    Ok(())
}

pub(crate) fn delete_entity_row(
    conn: &Connection,
    kind: EntityKind,
    id: &EntityId,
) -> Result<(), StorageError> {
    conn.execute(
        "DELETE FROM list_query_members WHERE entity_id = ?1
         AND filter_hash IN (SELECT filter_hash FROM list_queries WHERE kind = ?2)",
        params![id.as_str(), kind.as_str()],
    )?;
    conn.execute(
        "DELETE FROM entities WHERE kind = ?1 AND id = ?2",
        params![kind.as_str(), id.as_str()],
    )?;
    Ok(())
}

pub(crate) fn upsert_query_row(conn: &Connection, record: &QueryRecord) -> Result<(), StorageError> {
    let filter_json = serde_json::to_string(&record.filter)?;
    let sort_json = serde_json::to_string(&record.sort)?;
    conn.execute(
        "INSERT INTO list_queries (filter_hash, kind, filter_json, sort_json, observe_in_background)
         VALUES (?1, ?2, ?3, ?4, ?5)
         ON CONFLICT(filter_hash) DO UPDATE SET
            filter_json = excluded.filter_json,
            sort_json = excluded.sort_json,
            observe_in_background = excluded.observe_in_background",
        params![
            record.filter_hash.as_str(),
            record.kind.as_str(),
            filter_json,
            sort_json,
            record.observe_in_background
        ],
    )?;
    Ok(())
}

pub(crate) fn insert_member_row(
    conn: &Connection,
    hash: &FilterHash,
    id: &EntityId,
) -> Result<(), StorageError> {
    conn.execute(
        "INSERT OR IGNORE INTO list_query_members (filter_hash, entity_id) VALUES (?1, ?2)",
        params![hash.as_str(), id.as_str()],
    )?;
    Ok(())
}

pub(crate) fn delete_member_row(
    conn: &Connection,
    hash: &FilterHash,
    id: &EntityId,
) -> Result<(), StorageError> {
    conn.execute(
        "DELETE FROM list_query_members WHERE filter_hash = ?1 AND entity_id = ?2",
        params![hash.as_str(), id.as_str()],
    )?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::query::ListQuery;
    use tempfile::tempdir;

    #[test]
    fn test_database_creation() {
        let db = Database::open_in_memory().unwrap();
        let snapshot = db.load_snapshot().unwrap();
        assert_eq!(snapshot.version(), 0);
        assert_eq!(snapshot.entities().count(), 0);
    }

    #[test]
    fn test_rows_reload_into_snapshot() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("store.db");
        {
            let db = Database::open(&path).unwrap();
            let mut entity = Entity::new(EntityKind::User, "luke").with_attribute("name", "Luke");
            entity.version = 4;
            upsert_entity_row(&db.conn, &entity).unwrap();

            let query = ListQuery::users(FilterExpression::equal("id", "luke").unwrap());
            let record = QueryRecord::from_query(&query);
            upsert_query_row(&db.conn, &record).unwrap();
            insert_member_row(&db.conn, &record.filter_hash, &entity.id).unwrap();
        }

        let snapshot = Database::open(&path).unwrap().load_snapshot().unwrap();
        assert_eq!(snapshot.version(), 4);
        let luke = snapshot
            .entity(EntityKind::User, &EntityId::new("luke"))
            .unwrap();
        assert_eq!(luke.str_attr("name"), Some("Luke"));

        let records: Vec<_> = snapshot.query_records().collect();
        assert_eq!(records.len(), 1);
        assert!(records[0].contains(&EntityId::new("luke")));
    }

    #[test]
    fn test_saved_version_outranks_entity_versions() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("store.db");
        {
            let db = Database::open(&path).unwrap();
            let mut entity = Entity::new(EntityKind::User, "luke");
            entity.version = 2;
            upsert_entity_row(&db.conn, &entity).unwrap();
            save_version_row(&db.conn, 7).unwrap();
        }

        let snapshot = Database::open(&path).unwrap().load_snapshot().unwrap();
        assert_eq!(snapshot.version(), 7);
    }
}
