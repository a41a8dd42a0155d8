//! Durable process registry backed by SQLite.
//!
//! Three tables, one per namespace:
//!
//! ```text
//! procs   (id INTEGER PRIMARY KEY AUTOINCREMENT, metadata JSON, status JSON)
//! by_name (name PRIMARY KEY, ids JSON array)
//! by_tag  (tag  PRIMARY KEY, ids JSON array)
//! ```
//!
//! Every public operation runs in exactly one transaction, so an index is
//! never observed out of step with the primary table. `AUTOINCREMENT` keeps
//! the id sequence growing across deletes; ids are never reused.
//!
//! The store is synchronous. The registry actor owns it and calls it from a
//! blocking thread.

use std::path::Path;

use parking_lot::Mutex;
use rusqlite::{params, Connection, OptionalExtension, Transaction};
use thiserror::Error;
use tracing::debug;

use pm_core::{ProcId, ProcMetadata, ProcRecord, ProcStatus};

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS procs (
    id       INTEGER PRIMARY KEY AUTOINCREMENT,
    metadata TEXT NOT NULL,
    status   TEXT NOT NULL
);
CREATE TABLE IF NOT EXISTS by_name (
    name TEXT PRIMARY KEY,
    ids  TEXT NOT NULL
);
CREATE TABLE IF NOT EXISTS by_tag (
    tag TEXT PRIMARY KEY,
    ids TEXT NOT NULL
);
"#;

// ============================================================================
// Errors
// ============================================================================

/// Errors returned by [`ProcessStore`].
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("process not found: {0}")]
    NotFound(ProcId),

    #[error("storage error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("corrupt record: {0}")]
    Codec(#[from] serde_json::Error),
}

pub type StoreResult<T> = Result<T, StoreError>;

// ============================================================================
// Secondary indices
// ============================================================================

#[derive(Debug, Clone, Copy)]
enum Index {
    Name,
    Tag,
}

impl Index {
    fn select_sql(self) -> &'static str {
        match self {
            Self::Name => "SELECT ids FROM by_name WHERE name = ?1",
            Self::Tag => "SELECT ids FROM by_tag WHERE tag = ?1",
        }
    }

    fn upsert_sql(self) -> &'static str {
        match self {
            Self::Name => {
                "INSERT INTO by_name (name, ids) VALUES (?1, ?2)
                 ON CONFLICT(name) DO UPDATE SET ids = excluded.ids"
            }
            Self::Tag => {
                "INSERT INTO by_tag (tag, ids) VALUES (?1, ?2)
                 ON CONFLICT(tag) DO UPDATE SET ids = excluded.ids"
            }
        }
    }

    fn delete_sql(self) -> &'static str {
        match self {
            Self::Name => "DELETE FROM by_name WHERE name = ?1",
            Self::Tag => "DELETE FROM by_tag WHERE tag = ?1",
        }
    }
}

fn read_index(conn: &Connection, index: Index, key: &str) -> StoreResult<Vec<ProcId>> {
    let raw: Option<String> = conn
        .query_row(index.select_sql(), params![key], |row| row.get(0))
        .optional()?;
    match raw {
        Some(raw) => Ok(serde_json::from_str(&raw)?),
        None => Ok(Vec::new()),
    }
}

fn append_to_index(tx: &Transaction<'_>, index: Index, key: &str, id: ProcId) -> StoreResult<()> {
    let mut ids = read_index(tx, index, key)?;
    if !ids.contains(&id) {
        ids.push(id);
    }
    tx.execute(index.upsert_sql(), params![key, serde_json::to_string(&ids)?])?;
    Ok(())
}

/// Filters `id` out of the list under `key`; an emptied list is removed.
fn remove_from_index(tx: &Transaction<'_>, index: Index, key: &str, id: ProcId) -> StoreResult<()> {
    let mut ids = read_index(tx, index, key)?;
    ids.retain(|other| *other != id);
    if ids.is_empty() {
        tx.execute(index.delete_sql(), params![key])?;
    } else {
        tx.execute(index.upsert_sql(), params![key, serde_json::to_string(&ids)?])?;
    }
    Ok(())
}

// ============================================================================
// Row helpers
// ============================================================================

fn to_sql_id(id: ProcId) -> i64 {
    i64::try_from(id.get()).unwrap_or(i64::MAX)
}

fn from_sql_id(id: i64) -> ProcId {
    ProcId::new(u64::try_from(id).unwrap_or_default())
}

fn decode_row(id: i64, metadata: &str, status: &str) -> StoreResult<ProcRecord> {
    Ok(ProcRecord {
        id: from_sql_id(id),
        metadata: serde_json::from_str(metadata)?,
        status: serde_json::from_str(status)?,
    })
}

fn fetch(conn: &Connection, id: ProcId) -> StoreResult<Option<ProcRecord>> {
    let row: Option<(i64, String, String)> = conn
        .query_row(
            "SELECT id, metadata, status FROM procs WHERE id = ?1",
            params![to_sql_id(id)],
            |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
        )
        .optional()?;
    row.map(|(id, metadata, status)| decode_row(id, &metadata, &status))
        .transpose()
}

/// Inserts the primary row and every index entry inside `tx`.
///
/// Nothing is visible until the caller commits.
fn insert_proc(tx: &Transaction<'_>, metadata: &ProcMetadata) -> StoreResult<ProcId> {
    tx.execute(
        "INSERT INTO procs (metadata, status) VALUES (?1, ?2)",
        params![
            serde_json::to_string(metadata)?,
            serde_json::to_string(&ProcStatus::Invalid)?
        ],
    )?;
    let id = from_sql_id(tx.last_insert_rowid());

    append_to_index(tx, Index::Name, &metadata.name, id)?;
    for tag in &metadata.tags {
        append_to_index(tx, Index::Tag, tag, id)?;
    }
    Ok(id)
}

// ============================================================================
// Process Store
// ============================================================================

/// Persistent map of process records with name and tag indices.
pub struct ProcessStore {
    conn: Mutex<Connection>,
}

impl ProcessStore {
    /// Opens (creating if needed) the database at `path`.
    pub fn open(path: impl AsRef<Path>) -> StoreResult<Self> {
        let conn = Connection::open(path.as_ref())?;
        // WAL is a best-effort durability improvement; some filesystems refuse it.
        conn.pragma_update(None, "journal_mode", "WAL").ok();
        Self::with_connection(conn)
    }

    /// Opens a private in-memory database.
    pub fn open_in_memory() -> StoreResult<Self> {
        Self::with_connection(Connection::open_in_memory()?)
    }

    fn with_connection(conn: Connection) -> StoreResult<Self> {
        conn.execute_batch(SCHEMA)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Registers a new process with status `Invalid`.
    pub fn create(&self, metadata: &ProcMetadata) -> StoreResult<ProcId> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;
        let id = insert_proc(&tx, metadata)?;
        tx.commit()?;

        debug!(id = %id, name = %metadata.name, "Stored process");
        Ok(id)
    }

    /// Snapshot of every record, ordered by id.
    pub fn list(&self) -> StoreResult<Vec<ProcRecord>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare("SELECT id, metadata, status FROM procs ORDER BY id")?;
        let rows = stmt.query_map([], |row| {
            Ok((
                row.get::<_, i64>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, String>(2)?,
            ))
        })?;

        let mut records = Vec::new();
        for row in rows {
            let (id, metadata, status) = row?;
            records.push(decode_row(id, &metadata, &status)?);
        }
        Ok(records)
    }

    /// Returns a single record, if present.
    pub fn get(&self, id: ProcId) -> StoreResult<Option<ProcRecord>> {
        let conn = self.conn.lock();
        fetch(&conn, id)
    }

    /// Fetches every id in order. Fails with `NotFound` on the first missing id.
    pub fn get_procs(&self, ids: &[ProcId]) -> StoreResult<Vec<ProcRecord>> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;
        let mut records = Vec::with_capacity(ids.len());
        for &id in ids {
            records.push(fetch(&tx, id)?.ok_or(StoreError::NotFound(id))?);
        }
        Ok(records)
    }

    /// Replaces the status of `id`. Metadata is never touched.
    pub fn set_status(&self, id: ProcId, status: &ProcStatus) -> StoreResult<()> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;
        let changed = tx.execute(
            "UPDATE procs SET status = ?1 WHERE id = ?2",
            params![serde_json::to_string(status)?, to_sql_id(id)],
        )?;
        if changed == 0 {
            return Err(StoreError::NotFound(id));
        }
        tx.commit()?;
        Ok(())
    }

    /// Removes `id` together with its name and tag index entries.
    pub fn delete(&self, id: ProcId) -> StoreResult<ProcRecord> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;
        let record = fetch(&tx, id)?.ok_or(StoreError::NotFound(id))?;

        tx.execute("DELETE FROM procs WHERE id = ?1", params![to_sql_id(id)])?;
        remove_from_index(&tx, Index::Name, &record.metadata.name, id)?;
        for tag in &record.metadata.tags {
            remove_from_index(&tx, Index::Tag, tag, id)?;
        }
        tx.commit()?;

        debug!(id = %id, "Deleted process");
        Ok(record)
    }

    /// Ids registered under `name`; empty when none.
    pub fn ids_by_name(&self, name: &str) -> StoreResult<Vec<ProcId>> {
        let conn = self.conn.lock();
        read_index(&conn, Index::Name, name)
    }

    /// Ids carrying `tag`; empty when none.
    pub fn ids_by_tag(&self, tag: &str) -> StoreResult<Vec<ProcId>> {
        let conn = self.conn.lock();
        read_index(&conn, Index::Tag, tag)
    }

    /// Finds the record currently Running with OS pid `pid`.
    pub fn find_running(&self, pid: u32) -> StoreResult<Option<ProcId>> {
        let conn = self.conn.lock();
        let id: Option<i64> = conn
            .query_row(
                "SELECT id FROM procs
                 WHERE json_extract(status, '$.state') = 'running'
                   AND json_extract(status, '$.pid') = ?1
                 ORDER BY id LIMIT 1",
                params![i64::from(pid)],
                |row| row.get(0),
            )
            .optional()?;
        Ok(id.map(from_sql_id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn store() -> ProcessStore {
        ProcessStore::open_in_memory().unwrap()
    }

    fn svc(name: &str, tags: &[&str]) -> ProcMetadata {
        ProcMetadata::new(name, "sleep 1000").with_tags(tags.iter().copied())
    }

    #[test]
    fn test_create_assigns_increasing_ids() {
        let store = store();
        let a = store.create(&svc("a", &[])).unwrap();
        let b = store.create(&svc("b", &[])).unwrap();
        assert_eq!(a, ProcId::new(1));
        assert_eq!(b, ProcId::new(2));

        let record = store.get(a).unwrap().unwrap();
        assert_eq!(record.status, ProcStatus::Invalid);
        assert_eq!(record.metadata.name, "a");
    }

    #[test]
    fn test_ids_never_reused() {
        let store = store();
        let a = store.create(&svc("a", &[])).unwrap();
        store.delete(a).unwrap();
        let b = store.create(&svc("a", &[])).unwrap();
        assert!(b > a);
    }

    #[test]
    fn test_indices_follow_create_and_delete() {
        let store = store();
        let a = store.create(&svc("svc", &["web", "api"])).unwrap();
        let b = store.create(&svc("svc", &["web"])).unwrap();

        assert_eq!(store.ids_by_name("svc").unwrap(), vec![a, b]);
        assert_eq!(store.ids_by_tag("web").unwrap(), vec![a, b]);
        assert_eq!(store.ids_by_tag("api").unwrap(), vec![a]);

        store.delete(a).unwrap();
        assert_eq!(store.ids_by_name("svc").unwrap(), vec![b]);
        assert_eq!(store.ids_by_tag("web").unwrap(), vec![b]);
        assert!(store.ids_by_tag("api").unwrap().is_empty());

        store.delete(b).unwrap();
        assert!(store.ids_by_name("svc").unwrap().is_empty());
        assert!(store.ids_by_tag("web").unwrap().is_empty());
    }

    #[test]
    fn test_every_indexed_id_exists() {
        let store = store();
        let ids: Vec<_> = (0..5)
            .map(|i| store.create(&svc(&format!("p{}", i % 2), &["t"])).unwrap())
            .collect();
        store.delete(ids[1]).unwrap();
        store.delete(ids[4]).unwrap();

        for name in ["p0", "p1"] {
            for id in store.ids_by_name(name).unwrap() {
                assert!(store.get(id).unwrap().is_some());
            }
        }
        for id in store.ids_by_tag("t").unwrap() {
            assert!(store.get(id).unwrap().is_some());
        }
    }

    #[test]
    fn test_delete_missing_is_not_found() {
        let store = store();
        let id = store.create(&svc("a", &[])).unwrap();
        store.delete(id).unwrap();
        assert!(matches!(store.delete(id), Err(StoreError::NotFound(missing)) if missing == id));
        assert!(store.list().unwrap().is_empty());
    }

    #[test]
    fn test_get_procs_all_or_nothing() {
        let store = store();
        let a = store.create(&svc("a", &[])).unwrap();
        let b = store.create(&svc("b", &[])).unwrap();

        let records = store.get_procs(&[b, a]).unwrap();
        assert_eq!(records[0].id, b);
        assert_eq!(records[1].id, a);

        let err = store.get_procs(&[a, ProcId::new(99)]).unwrap_err();
        assert!(matches!(err, StoreError::NotFound(id) if id == ProcId::new(99)));
    }

    #[test]
    fn test_set_status_and_find_running() {
        let store = store();
        let a = store.create(&svc("a", &[])).unwrap();
        let b = store.create(&svc("b", &[])).unwrap();

        store.set_status(a, &ProcStatus::running(4242, Utc::now())).unwrap();
        assert_eq!(store.find_running(4242).unwrap(), Some(a));
        assert_eq!(store.find_running(1).unwrap(), None);

        store.set_status(a, &ProcStatus::Stopped).unwrap();
        assert_eq!(store.find_running(4242).unwrap(), None);
        assert_eq!(store.get(b).unwrap().unwrap().status, ProcStatus::Invalid);

        let err = store.set_status(ProcId::new(77), &ProcStatus::Stopped).unwrap_err();
        assert!(matches!(err, StoreError::NotFound(_)));
    }

    #[test]
    fn test_create_is_atomic() {
        let store = store();
        {
            let mut conn = store.conn.lock();
            let tx = conn.transaction().unwrap();
            insert_proc(&tx, &svc("ghost", &["web"])).unwrap();
            // dropped without commit
        }

        assert!(store.list().unwrap().is_empty());
        assert!(store.ids_by_name("ghost").unwrap().is_empty());
        assert!(store.ids_by_tag("web").unwrap().is_empty());
    }

    #[test]
    fn test_list_ordered_and_persistent() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("pm.db");
        {
            let store = ProcessStore::open(&path).unwrap();
            store.create(&svc("first", &[])).unwrap();
            store.create(&svc("second", &["x"])).unwrap();
        }

        let store = ProcessStore::open(&path).unwrap();
        let names: Vec<_> = store
            .list()
            .unwrap()
            .into_iter()
            .map(|r| r.metadata.name)
            .collect();
        assert_eq!(names, vec!["first", "second"]);
        assert_eq!(store.ids_by_tag("x").unwrap(), vec![ProcId::new(2)]);
    }
}
