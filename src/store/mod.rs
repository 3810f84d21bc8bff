//! Durable relational persistence for all sync state.
//!
//! One SQLite file holds the four entity kinds: objects, shadows, cache
//! records (plus their chunk sets) and the action queue. Every logical
//! worker opens its own [`Store`] on the same path; within one handle a
//! mutex fronts the connection so writes serialize, and a busy timeout
//! covers contention between handles.

mod queue;

pub use queue::{
    Action, ActionKind, ActionMeta, ActionStatus, Direction, FailOutcome, Intent, PRIO_HIGH,
    PRIO_NORMAL, PRIO_PIN,
};

use crate::object::{
    CacheRecord, CloudState, LocalState, Object, ObjectKind, Origin, Presence, Shadow,
    ShadowPatch, SyncState, DRIVE_ROOT_ID, ROOT_ID,
};
use crate::remote::RemoteItem;
use crate::util;
use rusqlite::{params, Connection, OptionalExtension as _, Row};
use std::{
    path::{Path, PathBuf},
    sync::Mutex,
    time::Duration,
};

const BUSY_TIMEOUT: Duration = Duration::from_secs(30);

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS objects (
    id TEXT PRIMARY KEY,
    kind TEXT NOT NULL,
    parent_id TEXT,

    name TEXT NOT NULL,
    extension TEXT,
    size INTEGER NOT NULL DEFAULT 0,

    cloud_id TEXT,
    cloud_parent_id TEXT,
    etag TEXT,
    revision TEXT,
    origin TEXT NOT NULL DEFAULT 'local',
    missing_from_cloud INTEGER NOT NULL DEFAULT 0,

    local_modified_at INTEGER NOT NULL DEFAULT 0,
    cloud_modified_at INTEGER NOT NULL DEFAULT 0,
    last_synced INTEGER NOT NULL DEFAULT 0,

    sync_state TEXT NOT NULL DEFAULT 'synced',
    dirty INTEGER NOT NULL DEFAULT 0,
    deleted INTEGER NOT NULL DEFAULT 0
);

CREATE TABLE IF NOT EXISTS shadows (
    object_id TEXT PRIMARY KEY,
    cloud_id TEXT,
    parent_id TEXT,
    name TEXT,
    etag TEXT,
    file_hash TEXT,
    modified_at INTEGER NOT NULL DEFAULT 0
);

CREATE TABLE IF NOT EXISTS cache_records (
    object_id TEXT PRIMARY KEY,
    local_path TEXT,
    size INTEGER NOT NULL DEFAULT 0,
    present TEXT NOT NULL DEFAULT 'missing',
    pinned INTEGER NOT NULL DEFAULT 0,
    last_accessed INTEGER NOT NULL DEFAULT 0,
    open_count INTEGER NOT NULL DEFAULT 0
);

CREATE TABLE IF NOT EXISTS cache_chunks (
    object_id TEXT NOT NULL,
    chunk_index INTEGER NOT NULL,
    PRIMARY KEY (object_id, chunk_index)
);

CREATE TABLE IF NOT EXISTS actions (
    action_id INTEGER PRIMARY KEY AUTOINCREMENT,
    kind TEXT NOT NULL,
    target_id TEXT NOT NULL,
    direction TEXT NOT NULL,
    destination TEXT,
    metadata TEXT,
    priority INTEGER NOT NULL DEFAULT 0,
    created_at INTEGER NOT NULL,
    status TEXT NOT NULL DEFAULT 'pending',
    retry_count INTEGER NOT NULL DEFAULT 0,
    last_error TEXT
);

CREATE INDEX IF NOT EXISTS idx_objects_parent ON objects (parent_id);
CREATE INDEX IF NOT EXISTS idx_objects_cloud ON objects (cloud_id);
CREATE INDEX IF NOT EXISTS idx_actions_status ON actions (status);
CREATE INDEX IF NOT EXISTS idx_actions_target ON actions (target_id);
"#;

pub struct Store {
    conn: Mutex<Connection>,
    path: PathBuf,
}

impl Store {
    /// Open (creating if needed) the store at `path`. Schema statements are
    /// idempotent; the two root rows are bootstrapped, and any action left
    /// in `processing` by a crash is reset to `pending`.
    pub fn open(path: &Path) -> rusqlite::Result<Self> {
        if let Some(parent) = path.parent() {
            // ignore failure here; Connection::open reports it with context
            let _ = std::fs::create_dir_all(parent);
        }
        let conn = Connection::open(path)?;
        conn.busy_timeout(BUSY_TIMEOUT)?;
        let _: String = conn.query_row("PRAGMA journal_mode=WAL", [], |row| row.get(0))?;
        conn.execute_batch(SCHEMA)?;
        conn.execute(
            "INSERT OR IGNORE INTO objects (id, kind, name, parent_id) VALUES (?1, 'folder', 'root', NULL)",
            params![ROOT_ID],
        )?;
        conn.execute(
            "INSERT OR IGNORE INTO objects (id, kind, name, parent_id) VALUES (?1, 'folder', 'Drive', ?2)",
            params![DRIVE_ROOT_ID, ROOT_ID],
        )?;
        conn.execute(
            "UPDATE actions SET status = 'pending' WHERE status = 'processing'",
            [],
        )?;
        Ok(Self {
            conn: Mutex::new(conn),
            path: path.to_owned(),
        })
    }

    /// A second handle with its own connection, for another logical worker.
    pub fn reopen(&self) -> rusqlite::Result<Self> {
        Self::open(&self.path)
    }

    pub(crate) fn with_conn<T>(
        &self,
        f: impl FnOnce(&Connection) -> rusqlite::Result<T>,
    ) -> rusqlite::Result<T> {
        let conn = self.conn.lock().unwrap();
        f(&conn)
    }

    pub(crate) fn with_tx<T>(
        &self,
        f: impl FnOnce(&rusqlite::Transaction<'_>) -> rusqlite::Result<T>,
    ) -> rusqlite::Result<T> {
        let mut conn = self.conn.lock().unwrap();
        let tx = conn.transaction()?;
        let out = f(&tx)?;
        tx.commit()?;
        Ok(out)
    }

    // ---- objects ----

    pub fn object(&self, id: &str) -> rusqlite::Result<Option<Object>> {
        self.with_conn(|conn| {
            conn.query_row(
                "SELECT * FROM objects WHERE id = ?1",
                params![id],
                object_from_row,
            )
            .optional()
        })
    }

    pub fn object_by_cloud_id(&self, cloud_id: &str) -> rusqlite::Result<Option<Object>> {
        self.with_conn(|conn| {
            conn.query_row(
                "SELECT * FROM objects WHERE cloud_id = ?1",
                params![cloud_id],
                object_from_row,
            )
            .optional()
        })
    }

    /// Extension-aware child lookup: a file named `report` with extension
    /// `pdf` matches both `report.pdf` and (when no exact sibling exists)
    /// `report`.
    pub fn child_by_name(&self, parent_id: &str, name: &str) -> rusqlite::Result<Option<Object>> {
        self.with_conn(|conn| {
            let exact = conn
                .query_row(
                    "SELECT * FROM objects
                     WHERE parent_id = ?1 AND deleted = 0 AND name = ?2 AND extension IS NULL",
                    params![parent_id, name],
                    object_from_row,
                )
                .optional()?;
            if exact.is_some() {
                return Ok(exact);
            }
            if let Some(idx) = name.rfind('.') {
                if idx > 0 && idx + 1 < name.len() {
                    let (base, ext) = (&name[..idx], &name[idx + 1..]);
                    let split = conn
                        .query_row(
                            "SELECT * FROM objects
                             WHERE parent_id = ?1 AND deleted = 0 AND name = ?2 AND extension = ?3",
                            params![parent_id, base, ext],
                            object_from_row,
                        )
                        .optional()?;
                    if split.is_some() {
                        return Ok(split);
                    }
                }
            }
            // files whose stored name carries the dot itself
            conn.query_row(
                "SELECT * FROM objects
                 WHERE parent_id = ?1 AND deleted = 0 AND name = ?2",
                params![parent_id, name],
                object_from_row,
            )
            .optional()
        })
    }

    /// Non-deleted children, readdir order.
    pub fn children(&self, parent_id: &str) -> rusqlite::Result<Vec<Object>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT * FROM objects WHERE parent_id = ?1 AND deleted = 0 ORDER BY name",
            )?;
            let rows = stmt.query_map(params![parent_id], object_from_row)?;
            rows.collect()
        })
    }

    pub fn has_live_children(&self, parent_id: &str) -> rusqlite::Result<bool> {
        self.with_conn(|conn| {
            conn.query_row(
                "SELECT 1 FROM objects WHERE parent_id = ?1 AND deleted = 0 LIMIT 1",
                params![parent_id],
                |_| Ok(()),
            )
            .optional()
            .map(|row| row.is_some())
        })
    }

    /// Children that have been confirmed by the remote at least once.
    pub fn children_with_cloud_id(&self, parent_id: &str) -> rusqlite::Result<Vec<Object>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT * FROM objects
                 WHERE parent_id = ?1 AND cloud_id IS NOT NULL AND deleted = 0",
            )?;
            let rows = stmt.query_map(params![parent_id], object_from_row)?;
            rows.collect()
        })
    }

    /// New locally created file; dirty from birth, awaiting its first push.
    pub fn insert_local_file(
        &self,
        parent_id: &str,
        name: &str,
        extension: Option<&str>,
        now: i64,
    ) -> rusqlite::Result<Object> {
        let id = Object::new_file_id();
        self.with_conn(|conn| {
            conn.execute(
                "INSERT INTO objects
                   (id, kind, name, extension, parent_id, size, local_modified_at, dirty, sync_state)
                 VALUES (?1, 'file', ?2, ?3, ?4, 0, ?5, 1, 'pending_push')",
                params![id, name, extension, parent_id, now],
            )?;
            Ok(())
        })?;
        Ok(self.object(&id)?.expect("row just inserted"))
    }

    pub fn insert_local_folder(
        &self,
        parent_id: &str,
        name: &str,
        now: i64,
    ) -> rusqlite::Result<Object> {
        let id = Object::new_folder_id();
        self.with_conn(|conn| {
            conn.execute(
                "INSERT INTO objects
                   (id, kind, name, parent_id, local_modified_at, dirty, sync_state)
                 VALUES (?1, 'folder', ?2, ?3, ?4, 1, 'pending_push')",
                params![id, name, parent_id, now],
            )?;
            Ok(())
        })?;
        Ok(self.object(&id)?.expect("row just inserted"))
    }

    /// Reconciler insert for an item first seen on the remote. The shadow is
    /// created in the same transaction; files also get an empty cache record.
    pub fn insert_cloud_object(
        &self,
        parent_id: &str,
        item: &RemoteItem,
        _now: i64,
    ) -> rusqlite::Result<String> {
        let id = if item.is_file() {
            Object::new_file_id()
        } else {
            Object::new_folder_id()
        };
        let kind = if item.is_file() { "file" } else { "folder" };
        self.with_tx(|tx| {
            // last_synced stays 0: a discovered folder still owes its own
            // first listing, which the adapter's readdir will request
            tx.execute(
                "INSERT INTO objects
                   (id, kind, name, extension, parent_id, size, cloud_id, cloud_parent_id,
                    etag, origin, cloud_modified_at, sync_state)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, 'cloud', ?10, 'synced')",
                params![
                    id,
                    kind,
                    item.name,
                    item.extension,
                    parent_id,
                    item.size,
                    item.cloud_id,
                    item.parent_cloud_id,
                    item.etag,
                    item.modified_at,
                ],
            )?;
            tx.execute(
                "INSERT INTO shadows (object_id, cloud_id, parent_id, name, etag, modified_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                params![
                    id,
                    item.cloud_id,
                    parent_id,
                    item.display_name(),
                    item.etag,
                    item.modified_at
                ],
            )?;
            if item.is_file() {
                tx.execute(
                    "INSERT INTO cache_records (object_id, size, present) VALUES (?1, 0, 'missing')",
                    params![id],
                )?;
            }
            Ok(())
        })?;
        Ok(id)
    }

    /// Persist local metadata mutations: name, extension, parent. Bumps
    /// local-modified-time, marks dirty and pending-push.
    pub fn commit_local(&self, obj: &Object) -> rusqlite::Result<()> {
        self.with_conn(|conn| {
            conn.execute(
                "UPDATE objects SET
                    name = ?1, extension = ?2, parent_id = ?3, size = ?4,
                    local_modified_at = ?5, dirty = 1, sync_state = 'pending_push'
                 WHERE id = ?6",
                params![
                    obj.local.name,
                    obj.local.extension,
                    obj.local.parent_id,
                    obj.local.size,
                    util::unix_now(),
                    obj.id,
                ],
            )?;
            Ok(())
        })
    }

    /// Content write bookkeeping: new size, dirty, pending-push.
    pub fn mark_local_write(&self, id: &str, size: i64, now: i64) -> rusqlite::Result<()> {
        self.with_conn(|conn| {
            conn.execute(
                "UPDATE objects SET size = ?1, local_modified_at = ?2, dirty = 1,
                        sync_state = 'pending_push'
                 WHERE id = ?3",
                params![size, now, id],
            )?;
            Ok(())
        })
    }

    pub fn set_deleted(&self, id: &str) -> rusqlite::Result<()> {
        self.with_conn(|conn| {
            conn.execute("UPDATE objects SET deleted = 1 WHERE id = ?1", params![id])?;
            Ok(())
        })
    }

    /// Remote side no longer has the item; tombstone it locally.
    pub fn mark_remote_deleted(&self, id: &str) -> rusqlite::Result<()> {
        self.with_conn(|conn| {
            conn.execute(
                "UPDATE objects SET deleted = 1, sync_state = 'synced' WHERE id = ?1",
                params![id],
            )?;
            Ok(())
        })
    }

    /// Remove every trace of an object after remote confirmation.
    pub fn hard_delete(&self, id: &str) -> rusqlite::Result<()> {
        self.with_tx(|tx| {
            tx.execute("DELETE FROM actions WHERE target_id = ?1", params![id])?;
            tx.execute("DELETE FROM cache_chunks WHERE object_id = ?1", params![id])?;
            tx.execute("DELETE FROM cache_records WHERE object_id = ?1", params![id])?;
            tx.execute("DELETE FROM shadows WHERE object_id = ?1", params![id])?;
            tx.execute("DELETE FROM objects WHERE id = ?1", params![id])?;
            Ok(())
        })
    }

    pub fn mark_synced(&self, id: &str, now: i64) -> rusqlite::Result<()> {
        self.with_conn(|conn| {
            conn.execute(
                "UPDATE objects SET dirty = 0, sync_state = 'synced', last_synced = ?1
                 WHERE id = ?2",
                params![now, id],
            )?;
            Ok(())
        })
    }

    pub fn set_sync_state(&self, id: &str, state: SyncState) -> rusqlite::Result<()> {
        self.with_conn(|conn| {
            conn.execute(
                "UPDATE objects SET sync_state = ?1 WHERE id = ?2",
                params![state.as_str(), id],
            )?;
            Ok(())
        })
    }

    pub fn set_missing_from_cloud(&self, id: &str, missing: bool) -> rusqlite::Result<()> {
        self.with_conn(|conn| {
            conn.execute(
                "UPDATE objects SET missing_from_cloud = ?1 WHERE id = ?2",
                params![missing as i64, id],
            )?;
            Ok(())
        })
    }

    /// Bookkeeping after a successful upload or content update: the remote
    /// assigned (or kept) the cloud id and stamped a fresh etag.
    pub fn apply_push_result(
        &self,
        id: &str,
        item: &RemoteItem,
        now: i64,
    ) -> rusqlite::Result<()> {
        self.with_conn(|conn| {
            conn.execute(
                "UPDATE objects SET
                    cloud_id = ?1, cloud_parent_id = ?2, etag = ?3,
                    name = ?4, extension = ?5, size = ?6,
                    cloud_modified_at = ?7, missing_from_cloud = 0,
                    dirty = 0, sync_state = 'synced', last_synced = ?8
                 WHERE id = ?9",
                params![
                    item.cloud_id,
                    item.parent_cloud_id,
                    item.etag,
                    item.name,
                    item.extension,
                    item.size,
                    item.modified_at,
                    now,
                    id,
                ],
            )?;
            Ok(())
        })
    }

    /// Reconciler update for a clean local row whose remote etag moved.
    pub fn apply_remote_update(
        &self,
        id: &str,
        parent_id: &str,
        item: &RemoteItem,
        _now: i64,
    ) -> rusqlite::Result<()> {
        self.with_conn(|conn| {
            conn.execute(
                "UPDATE objects SET
                    etag = ?1, name = ?2, extension = ?3, size = ?4,
                    parent_id = ?5, cloud_parent_id = ?6, cloud_modified_at = ?7,
                    missing_from_cloud = 0, sync_state = 'pending_pull'
                 WHERE id = ?8",
                params![
                    item.etag,
                    item.name,
                    item.extension,
                    item.size,
                    parent_id,
                    item.parent_cloud_id,
                    item.modified_at,
                    id,
                ],
            )?;
            Ok(())
        })
    }

    /// Bookkeeping after a full download landed in the cache.
    pub fn apply_download(&self, id: &str, etag: &str, size: i64, now: i64) -> rusqlite::Result<()> {
        self.with_conn(|conn| {
            conn.execute(
                "UPDATE objects SET etag = ?1, size = ?2, missing_from_cloud = 0,
                        dirty = 0, sync_state = 'synced', last_synced = ?3
                 WHERE id = ?4",
                params![etag, size, now, id],
            )?;
            Ok(())
        })
    }

    /// Bookkeeping after a confirmed remote move.
    pub fn apply_move(
        &self,
        id: &str,
        parent_id: &str,
        parent_cloud_id: &str,
    ) -> rusqlite::Result<()> {
        self.with_conn(|conn| {
            conn.execute(
                "UPDATE objects SET parent_id = ?1, cloud_parent_id = ?2 WHERE id = ?3",
                params![parent_id, parent_cloud_id, id],
            )?;
            Ok(())
        })
    }

    pub fn touch_last_synced(&self, id: &str, now: i64) -> rusqlite::Result<()> {
        self.with_conn(|conn| {
            conn.execute(
                "UPDATE objects SET last_synced = ?1 WHERE id = ?2",
                params![now, id],
            )?;
            Ok(())
        })
    }

    // ---- shadows ----

    pub fn shadow(&self, object_id: &str) -> rusqlite::Result<Option<Shadow>> {
        self.with_conn(|conn| {
            conn.query_row(
                "SELECT object_id, cloud_id, parent_id, name, etag, file_hash, modified_at
                 FROM shadows WHERE object_id = ?1",
                params![object_id],
                |row| {
                    Ok(Shadow {
                        object_id: row.get(0)?,
                        cloud_id: row.get(1)?,
                        parent_id: row.get(2)?,
                        name: row.get(3)?,
                        etag: row.get(4)?,
                        file_hash: row.get(5)?,
                        modified_at: row.get(6)?,
                    })
                },
            )
            .optional()
        })
    }

    /// Insert-or-merge on a partial patch; absent fields keep their value.
    pub fn update_shadow(&self, object_id: &str, patch: &ShadowPatch) -> rusqlite::Result<()> {
        self.with_conn(|conn| {
            conn.execute(
                "INSERT INTO shadows (object_id, cloud_id, parent_id, name, etag, file_hash, modified_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, COALESCE(?7, 0))
                 ON CONFLICT (object_id) DO UPDATE SET
                    cloud_id = COALESCE(excluded.cloud_id, cloud_id),
                    parent_id = COALESCE(excluded.parent_id, parent_id),
                    name = COALESCE(excluded.name, name),
                    etag = COALESCE(excluded.etag, etag),
                    file_hash = COALESCE(excluded.file_hash, file_hash),
                    modified_at = COALESCE(?7, modified_at)",
                params![
                    object_id,
                    patch.cloud_id,
                    patch.parent_id,
                    patch.name,
                    patch.etag,
                    patch.file_hash,
                    patch.modified_at,
                ],
            )?;
            Ok(())
        })
    }

    // ---- cache records ----

    pub fn cache_record(&self, object_id: &str) -> rusqlite::Result<Option<CacheRecord>> {
        self.with_conn(|conn| {
            conn.query_row(
                "SELECT object_id, local_path, size, present, pinned, last_accessed, open_count
                 FROM cache_records WHERE object_id = ?1",
                params![object_id],
                cache_record_from_row,
            )
            .optional()
        })
    }

    pub fn ensure_cache_record(&self, object_id: &str, local_path: &str) -> rusqlite::Result<()> {
        self.with_conn(|conn| {
            conn.execute(
                "INSERT INTO cache_records (object_id, local_path) VALUES (?1, ?2)
                 ON CONFLICT (object_id) DO UPDATE SET local_path = excluded.local_path",
                params![object_id, local_path],
            )?;
            Ok(())
        })
    }

    pub fn set_present(&self, object_id: &str, present: Presence, size: i64) -> rusqlite::Result<()> {
        self.with_tx(|tx| {
            tx.execute(
                "UPDATE cache_records SET present = ?1, size = ?2 WHERE object_id = ?3",
                params![present.as_str(), size, object_id],
            )?;
            if present != Presence::Partial {
                tx.execute(
                    "DELETE FROM cache_chunks WHERE object_id = ?1",
                    params![object_id],
                )?;
            }
            Ok(())
        })
    }

    pub fn set_cache_size(&self, object_id: &str, size: i64) -> rusqlite::Result<()> {
        self.with_conn(|conn| {
            conn.execute(
                "UPDATE cache_records SET size = ?1 WHERE object_id = ?2",
                params![size, object_id],
            )?;
            Ok(())
        })
    }

    /// Adjust open-count by `delta`, returning the new count.
    pub fn add_open(&self, object_id: &str, delta: i64, now: i64) -> rusqlite::Result<i64> {
        self.with_tx(|tx| {
            tx.execute(
                "UPDATE cache_records
                 SET open_count = MAX(0, open_count + ?1), last_accessed = ?2
                 WHERE object_id = ?3",
                params![delta, now, object_id],
            )?;
            let count = tx
                .query_row(
                    "SELECT open_count FROM cache_records WHERE object_id = ?1",
                    params![object_id],
                    |row| row.get(0),
                )
                .optional()?;
            Ok(count.unwrap_or(0))
        })
    }

    pub fn set_pinned(&self, object_id: &str, pinned: bool) -> rusqlite::Result<()> {
        self.with_conn(|conn| {
            conn.execute(
                "UPDATE cache_records SET pinned = ?1 WHERE object_id = ?2",
                params![pinned as i64, object_id],
            )?;
            Ok(())
        })
    }

    // ---- chunk sets ----

    pub fn present_chunks(&self, object_id: &str) -> rusqlite::Result<Vec<u64>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT chunk_index FROM cache_chunks WHERE object_id = ?1 ORDER BY chunk_index",
            )?;
            let rows = stmt.query_map(params![object_id], |row| row.get::<_, i64>(0))?;
            rows.map(|r| r.map(|v| v as u64)).collect()
        })
    }

    pub fn add_chunk(&self, object_id: &str, index: u64) -> rusqlite::Result<()> {
        self.with_conn(|conn| {
            conn.execute(
                "INSERT OR IGNORE INTO cache_chunks (object_id, chunk_index) VALUES (?1, ?2)",
                params![object_id, index as i64],
            )?;
            Ok(())
        })
    }

    pub fn chunk_count_present(&self, object_id: &str) -> rusqlite::Result<u64> {
        self.with_conn(|conn| {
            conn.query_row(
                "SELECT COUNT(*) FROM cache_chunks WHERE object_id = ?1",
                params![object_id],
                |row| row.get::<_, i64>(0),
            )
            .map(|v| v as u64)
        })
    }

    // ---- conflict resolution (surfaced by the control panel) ----

    /// Keep the local bytes: queue a content push for the conflicted row.
    pub fn resolve_conflict_keep_local(&self, object_id: &str) -> rusqlite::Result<()> {
        self.set_sync_state(object_id, SyncState::PendingPush)?;
        self.enqueue(Intent::update_content(object_id, None, None))
    }

    /// Keep the cloud bytes: drop the cached content and queue a re-pull.
    pub fn resolve_conflict_keep_cloud(&self, object_id: &str) -> rusqlite::Result<()> {
        self.with_conn(|conn| {
            conn.execute(
                "UPDATE objects SET dirty = 0, sync_state = 'pending_pull' WHERE id = ?1",
                params![object_id],
            )?;
            Ok(())
        })?;
        self.set_present(object_id, Presence::Missing, 0)?;
        self.enqueue(Intent::download(object_id).with_priority(PRIO_HIGH))
    }
}

fn object_from_row(row: &Row<'_>) -> rusqlite::Result<Object> {
    Ok(Object {
        id: row.get("id")?,
        kind: ObjectKind::parse(&row.get::<_, String>("kind")?),
        local: LocalState {
            parent_id: row.get("parent_id")?,
            name: row.get("name")?,
            extension: row.get("extension")?,
            size: row.get("size")?,
            modified_at: row.get("local_modified_at")?,
            dirty: row.get::<_, i64>("dirty")? != 0,
        },
        cloud: CloudState {
            id: row.get("cloud_id")?,
            parent_id: row.get("cloud_parent_id")?,
            etag: row.get("etag")?,
            revision: row.get("revision")?,
            modified_at: row.get("cloud_modified_at")?,
        },
        origin: Origin::parse(&row.get::<_, String>("origin")?),
        sync_state: SyncState::parse(&row.get::<_, String>("sync_state")?),
        missing_from_cloud: row.get::<_, i64>("missing_from_cloud")? != 0,
        deleted: row.get::<_, i64>("deleted")? != 0,
        last_synced: row.get("last_synced")?,
    })
}

fn cache_record_from_row(row: &Row<'_>) -> rusqlite::Result<CacheRecord> {
    Ok(CacheRecord {
        object_id: row.get(0)?,
        local_path: row.get(1)?,
        size: row.get(2)?,
        present: Presence::parse(&row.get::<_, String>(3)?),
        pinned: row.get::<_, i64>(4)? != 0,
        last_accessed: row.get(5)?,
        open_count: row.get(6)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn mem_store() -> Store {
        Store::open(Path::new(":memory:")).unwrap()
    }

    fn item(cloud_id: &str, name: &str, ext: Option<&str>) -> RemoteItem {
        RemoteItem {
            cloud_id: cloud_id.into(),
            parent_cloud_id: crate::remote::DRIVE_ROOT_CLOUD_ID.into(),
            name: name.into(),
            extension: ext.map(Into::into),
            size: 3,
            etag: "e1".into(),
            kind: crate::remote::RemoteItemKind::File,
            modified_at: 100,
        }
    }

    #[test]
    fn roots_are_bootstrapped() {
        let store = mem_store();
        let root = store.object(ROOT_ID).unwrap().unwrap();
        assert!(root.is_folder());
        let drive = store.object(DRIVE_ROOT_ID).unwrap().unwrap();
        assert_eq!(drive.local.parent_id.as_deref(), Some(ROOT_ID));
        assert_eq!(drive.local.name, "Drive");
    }

    #[test]
    fn child_lookup_is_extension_aware() {
        let store = mem_store();
        let obj = store
            .insert_local_file(DRIVE_ROOT_ID, "a", Some("txt"), 1)
            .unwrap();
        assert_eq!(
            store
                .child_by_name(DRIVE_ROOT_ID, "a.txt")
                .unwrap()
                .unwrap()
                .id,
            obj.id
        );
        // fallback for files addressed without their extension
        assert_eq!(
            store.child_by_name(DRIVE_ROOT_ID, "a").unwrap().unwrap().id,
            obj.id
        );
        assert!(store.child_by_name(DRIVE_ROOT_ID, "b.txt").unwrap().is_none());
    }

    #[test]
    fn cloud_insert_creates_shadow_and_cache_record() {
        let store = mem_store();
        let id = store
            .insert_cloud_object(DRIVE_ROOT_ID, &item("c1", "a", Some("txt")), 50)
            .unwrap();
        let obj = store.object(&id).unwrap().unwrap();
        assert_eq!(obj.cloud.id.as_deref(), Some("c1"));
        assert_eq!(obj.sync_state, SyncState::Synced);
        let shadow = store.shadow(&id).unwrap().unwrap();
        assert_eq!(shadow.etag.as_deref(), Some("e1"));
        assert_eq!(shadow.name.as_deref(), Some("a.txt"));
        let record = store.cache_record(&id).unwrap().unwrap();
        assert_eq!(record.present, Presence::Missing);
    }

    #[test]
    fn shadow_patch_merges_partially() {
        let store = mem_store();
        let obj = store.insert_local_file(DRIVE_ROOT_ID, "a", None, 1).unwrap();
        store
            .update_shadow(
                &obj.id,
                &ShadowPatch {
                    etag: Some("e1".into()),
                    file_hash: Some("h1".into()),
                    modified_at: Some(10),
                    ..Default::default()
                },
            )
            .unwrap();
        store
            .update_shadow(
                &obj.id,
                &ShadowPatch {
                    etag: Some("e2".into()),
                    ..Default::default()
                },
            )
            .unwrap();
        let shadow = store.shadow(&obj.id).unwrap().unwrap();
        assert_eq!(shadow.etag.as_deref(), Some("e2"));
        assert_eq!(shadow.file_hash.as_deref(), Some("h1"));
        assert_eq!(shadow.modified_at, 10);
    }

    #[test]
    fn hard_delete_removes_the_whole_triad() {
        let store = mem_store();
        let id = store
            .insert_cloud_object(DRIVE_ROOT_ID, &item("c1", "a", None), 50)
            .unwrap();
        store.add_chunk(&id, 0).unwrap();
        store.enqueue(Intent::delete(&id)).unwrap();
        store.hard_delete(&id).unwrap();
        assert!(store.object(&id).unwrap().is_none());
        assert!(store.shadow(&id).unwrap().is_none());
        assert!(store.cache_record(&id).unwrap().is_none());
        assert_eq!(store.chunk_count_present(&id).unwrap(), 0);
        assert!(store.actions_for_target(&id).unwrap().is_empty());
    }

    #[test]
    fn full_presence_clears_chunk_rows() {
        let store = mem_store();
        let id = store
            .insert_cloud_object(DRIVE_ROOT_ID, &item("c1", "big", None), 50)
            .unwrap();
        store.add_chunk(&id, 0).unwrap();
        store.add_chunk(&id, 1).unwrap();
        store.set_present(&id, Presence::Full, 123).unwrap();
        assert_eq!(store.chunk_count_present(&id).unwrap(), 0);
        let record = store.cache_record(&id).unwrap().unwrap();
        assert_eq!(record.present, Presence::Full);
        assert_eq!(record.size, 123);
    }

    #[test]
    fn open_count_never_goes_negative() {
        let store = mem_store();
        let id = store
            .insert_cloud_object(DRIVE_ROOT_ID, &item("c1", "a", None), 50)
            .unwrap();
        assert_eq!(store.add_open(&id, 1, 1).unwrap(), 1);
        assert_eq!(store.add_open(&id, -1, 2).unwrap(), 0);
        assert_eq!(store.add_open(&id, -1, 3).unwrap(), 0);
    }
}
