//! Durable intent queue with structural coalescing.
//!
//! Enqueue folds the new intent into the newest compatible row for the same
//! target instead of letting semantically redundant work pile up; dequeue is
//! two-tier: pending rows first (FIFO within priority), then failed rows
//! whose exponential backoff has elapsed.

use super::Store;
use rusqlite::{params, OptionalExtension as _, Row};
use serde::{Deserialize, Serialize};

pub const PRIO_NORMAL: i64 = 0;
pub const PRIO_HIGH: i64 = 1;
pub const PRIO_PIN: i64 = 2;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ActionKind {
    Upload,
    UpdateContent,
    Rename,
    Move,
    Delete,
    Download,
    EnsureLatest,
    ListChildren,
    DownloadChunk,
}

impl ActionKind {
    pub fn as_str(self) -> &'static str {
        match self {
            ActionKind::Upload => "upload",
            ActionKind::UpdateContent => "update_content",
            ActionKind::Rename => "rename",
            ActionKind::Move => "move",
            ActionKind::Delete => "delete",
            ActionKind::Download => "download",
            ActionKind::EnsureLatest => "ensure_latest",
            ActionKind::ListChildren => "list_children",
            ActionKind::DownloadChunk => "download_chunk",
        }
    }

    pub fn parse(s: &str) -> Self {
        match s {
            "upload" => ActionKind::Upload,
            "update_content" => ActionKind::UpdateContent,
            "rename" => ActionKind::Rename,
            "move" => ActionKind::Move,
            "delete" => ActionKind::Delete,
            "download" => ActionKind::Download,
            "ensure_latest" => ActionKind::EnsureLatest,
            "download_chunk" => ActionKind::DownloadChunk,
            _ => ActionKind::ListChildren,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Push,
    Pull,
}

impl Direction {
    pub fn as_str(self) -> &'static str {
        match self {
            Direction::Push => "push",
            Direction::Pull => "pull",
        }
    }

    pub fn parse(s: &str) -> Self {
        match s {
            "pull" => Direction::Pull,
            _ => Direction::Push,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ActionStatus {
    Pending,
    Processing,
    Failed,
}

impl ActionStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            ActionStatus::Pending => "pending",
            ActionStatus::Processing => "processing",
            ActionStatus::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Self {
        match s {
            "processing" => ActionStatus::Processing,
            "failed" => ActionStatus::Failed,
            _ => ActionStatus::Pending,
        }
    }
}

/// Opaque per-action payload, JSON in the row.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActionMeta {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file_hash: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub from_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub to_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub original_parent_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub chunk_index: Option<u64>,
}

impl ActionMeta {
    fn to_column(&self) -> Option<String> {
        if *self == ActionMeta::default() {
            None
        } else {
            serde_json::to_string(self).ok()
        }
    }

    fn from_column(raw: Option<String>) -> Self {
        match raw {
            Some(s) => serde_json::from_str(&s).unwrap_or_else(|err| {
                log::warn!("Dropping unreadable action metadata: {}", err);
                ActionMeta::default()
            }),
            None => ActionMeta::default(),
        }
    }
}

/// A new intent, before it hits the queue.
#[derive(Debug, Clone)]
pub struct Intent {
    pub kind: ActionKind,
    pub target_id: String,
    pub direction: Direction,
    pub destination: Option<String>,
    pub meta: ActionMeta,
    pub priority: i64,
}

impl Intent {
    fn new(kind: ActionKind, target_id: &str, direction: Direction) -> Self {
        Self {
            kind,
            target_id: target_id.to_owned(),
            direction,
            destination: None,
            meta: ActionMeta::default(),
            priority: PRIO_NORMAL,
        }
    }

    pub fn upload(target_id: &str, display_name: &str) -> Self {
        let mut intent = Self::new(ActionKind::Upload, target_id, Direction::Push);
        intent.meta.name = Some(display_name.to_owned());
        intent
    }

    pub fn update_content(
        target_id: &str,
        file_hash: Option<String>,
        name: Option<String>,
    ) -> Self {
        let mut intent = Self::new(ActionKind::UpdateContent, target_id, Direction::Push);
        intent.meta.file_hash = file_hash;
        intent.meta.name = name;
        intent
    }

    pub fn rename(target_id: &str, from: &str, to: &str) -> Self {
        let mut intent = Self::new(ActionKind::Rename, target_id, Direction::Push);
        intent.destination = Some(to.to_owned());
        intent.meta.from_name = Some(from.to_owned());
        intent.meta.to_name = Some(to.to_owned());
        intent
    }

    pub fn mv(target_id: &str, new_parent_id: &str, original_parent_id: &str) -> Self {
        let mut intent = Self::new(ActionKind::Move, target_id, Direction::Push);
        intent.destination = Some(new_parent_id.to_owned());
        intent.meta.original_parent_id = Some(original_parent_id.to_owned());
        intent
    }

    pub fn delete(target_id: &str) -> Self {
        Self::new(ActionKind::Delete, target_id, Direction::Push)
    }

    pub fn download(target_id: &str) -> Self {
        Self::new(ActionKind::Download, target_id, Direction::Pull)
    }

    pub fn ensure_latest(target_id: &str) -> Self {
        Self::new(ActionKind::EnsureLatest, target_id, Direction::Pull)
    }

    pub fn list_children(target_id: &str) -> Self {
        Self::new(ActionKind::ListChildren, target_id, Direction::Pull)
    }

    pub fn download_chunk(target_id: &str, index: u64) -> Self {
        let mut intent = Self::new(ActionKind::DownloadChunk, target_id, Direction::Pull);
        intent.meta.chunk_index = Some(index);
        intent
    }

    pub fn with_priority(mut self, priority: i64) -> Self {
        self.priority = priority;
        self
    }
}

/// One queued row.
#[derive(Debug, Clone)]
pub struct Action {
    pub id: i64,
    pub kind: ActionKind,
    pub target_id: String,
    pub direction: Direction,
    pub destination: Option<String>,
    pub meta: ActionMeta,
    pub priority: i64,
    pub created_at: i64,
    pub status: ActionStatus,
    pub retry_count: i64,
    pub last_error: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailOutcome {
    /// Transient fault: row is pending again with no backoff.
    Requeued,
    /// Row marked failed; eligible again once the backoff elapses.
    RetryScheduled,
    /// Retry cap exceeded: row dropped, object flagged with error state.
    GaveUp,
}

impl Store {
    /// Enqueue an intent, folding it into existing non-completed work for
    /// the same target where the new intent is semantically redundant.
    /// Rows that are folded into while failed come back as pending with
    /// their retry count cleared.
    pub fn enqueue(&self, intent: Intent) -> rusqlite::Result<()> {
        let now = crate::util::unix_now();
        self.with_tx(|tx| {
            let existing = {
                let mut stmt = tx.prepare(
                    "SELECT * FROM actions
                     WHERE target_id = ?1 AND status IN ('pending', 'processing', 'failed')
                     ORDER BY created_at DESC, action_id DESC",
                )?;
                let rows = stmt.query_map(params![intent.target_id], action_from_row)?;
                rows.collect::<rusqlite::Result<Vec<Action>>>()?
            };

            match intent.kind {
                ActionKind::Delete => {
                    // the delete supersedes everything not already in flight
                    tx.execute(
                        "DELETE FROM actions WHERE target_id = ?1 AND status != 'processing'",
                        params![intent.target_id],
                    )?;
                    return insert_action(tx, &intent, now);
                }
                ActionKind::ListChildren
                | ActionKind::Upload
                | ActionKind::Download
                | ActionKind::EnsureLatest => {
                    if let Some(prev) = existing.iter().find(|a| a.kind == intent.kind) {
                        if prev.priority < intent.priority {
                            tx.execute(
                                "UPDATE actions SET priority = ?1 WHERE action_id = ?2",
                                params![intent.priority, prev.id],
                            )?;
                        }
                        if prev.status == ActionStatus::Failed {
                            revive_action(tx, prev.id)?;
                        }
                        return Ok(());
                    }
                }
                ActionKind::DownloadChunk => {
                    if let Some(prev) = existing.iter().find(|a| {
                        a.kind == ActionKind::DownloadChunk
                            && a.meta.chunk_index == intent.meta.chunk_index
                    }) {
                        if prev.status == ActionStatus::Failed {
                            revive_action(tx, prev.id)?;
                        }
                        return Ok(());
                    }
                }
                ActionKind::Rename => {
                    for prev in &existing {
                        if prev.status == ActionStatus::Processing {
                            break;
                        }
                        match prev.kind {
                            ActionKind::Rename => {
                                let mut meta = prev.meta.clone();
                                meta.to_name = intent.meta.to_name.clone();
                                return fold_into(tx, prev, intent.destination.as_deref(), &meta);
                            }
                            ActionKind::Upload | ActionKind::UpdateContent => {
                                let mut meta = prev.meta.clone();
                                meta.name = intent.destination.clone();
                                return fold_into(tx, prev, prev.destination.as_deref(), &meta);
                            }
                            // a queued move commutes with the new rename
                            ActionKind::Move => continue,
                            _ => break,
                        }
                    }
                }
                ActionKind::Move => {
                    for prev in &existing {
                        if prev.status == ActionStatus::Processing {
                            break;
                        }
                        match prev.kind {
                            ActionKind::Move => {
                                // keep the original parent recorded by the first move:
                                // the remote is still there
                                return fold_into(
                                    tx,
                                    prev,
                                    intent.destination.as_deref(),
                                    &prev.meta,
                                );
                            }
                            ActionKind::Rename => continue,
                            _ => break,
                        }
                    }
                }
                ActionKind::UpdateContent => {
                    for prev in &existing {
                        if prev.status == ActionStatus::Processing {
                            break;
                        }
                        match prev.kind {
                            ActionKind::UpdateContent | ActionKind::Upload => {
                                let mut meta = prev.meta.clone();
                                if intent.meta.file_hash.is_some() {
                                    meta.file_hash = intent.meta.file_hash.clone();
                                }
                                if intent.meta.name.is_some() {
                                    meta.name = intent.meta.name.clone();
                                }
                                return fold_into(tx, prev, prev.destination.as_deref(), &meta);
                            }
                            ActionKind::Rename | ActionKind::Move => continue,
                            _ => break,
                        }
                    }
                }
            }

            insert_action(tx, &intent, now)
        })
    }

    /// Two-tier selection. Tier A: pending rows, highest priority first,
    /// FIFO within a priority. Tier B: failed rows whose
    /// `created_at + base · 2^retry` has passed. The winner atomically
    /// moves to processing.
    pub fn next_action(&self, now: i64, base_backoff_secs: i64) -> rusqlite::Result<Option<Action>> {
        self.with_tx(|tx| {
            let mut row = tx
                .query_row(
                    "SELECT * FROM actions WHERE status = 'pending'
                     ORDER BY priority DESC, created_at ASC, action_id ASC LIMIT 1",
                    [],
                    action_from_row,
                )
                .optional()?;
            if row.is_none() {
                row = tx
                    .query_row(
                        "SELECT * FROM actions WHERE status = 'failed'
                           AND created_at + (?1 * (1 << MIN(retry_count, 16))) <= ?2
                         ORDER BY created_at + (?1 * (1 << MIN(retry_count, 16))) ASC,
                                  action_id ASC
                         LIMIT 1",
                        params![base_backoff_secs, now],
                        action_from_row,
                    )
                    .optional()?;
            }
            if let Some(action) = &mut row {
                tx.execute(
                    "UPDATE actions SET status = 'processing' WHERE action_id = ?1",
                    params![action.id],
                )?;
                action.status = ActionStatus::Processing;
            }
            Ok(row)
        })
    }

    pub fn complete_action(&self, action_id: i64) -> rusqlite::Result<()> {
        self.with_conn(|conn| {
            conn.execute("DELETE FROM actions WHERE action_id = ?1", params![action_id])?;
            Ok(())
        })
    }

    /// Record a handler failure. Transient faults requeue immediately with
    /// no backoff; anything else burns a retry, and past the cap the row is
    /// dropped and the object parked in the error state.
    pub fn fail_action(
        &self,
        action_id: i64,
        target_id: &str,
        error: &str,
        transient: bool,
        max_retries: i64,
    ) -> rusqlite::Result<FailOutcome> {
        self.with_tx(|tx| {
            if transient {
                tx.execute(
                    "UPDATE actions SET status = 'pending', last_error = ?1 WHERE action_id = ?2",
                    params![error, action_id],
                )?;
                return Ok(FailOutcome::Requeued);
            }
            tx.execute(
                "UPDATE actions SET status = 'failed', last_error = ?1,
                        retry_count = retry_count + 1
                 WHERE action_id = ?2",
                params![error, action_id],
            )?;
            let retries: i64 = tx
                .query_row(
                    "SELECT retry_count FROM actions WHERE action_id = ?1",
                    params![action_id],
                    |row| row.get(0),
                )
                .optional()?
                .unwrap_or(0);
            if retries > max_retries {
                tx.execute(
                    "UPDATE objects SET sync_state = 'error' WHERE id = ?1",
                    params![target_id],
                )?;
                tx.execute("DELETE FROM actions WHERE action_id = ?1", params![action_id])?;
                return Ok(FailOutcome::GaveUp);
            }
            Ok(FailOutcome::RetryScheduled)
        })
    }

    /// All queued rows for a target, oldest first.
    pub fn actions_for_target(&self, target_id: &str) -> rusqlite::Result<Vec<Action>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT * FROM actions WHERE target_id = ?1
                 ORDER BY created_at ASC, action_id ASC",
            )?;
            let rows = stmt.query_map(params![target_id], action_from_row)?;
            rows.collect()
        })
    }

    pub fn all_actions(&self) -> rusqlite::Result<Vec<Action>> {
        self.with_conn(|conn| {
            let mut stmt =
                conn.prepare("SELECT * FROM actions ORDER BY created_at ASC, action_id ASC")?;
            let rows = stmt.query_map([], action_from_row)?;
            rows.collect()
        })
    }

    /// Hash recorded on the newest queued content push for this target, if
    /// any. Release uses this to avoid queueing the same bytes twice.
    pub fn last_content_push_hash(&self, target_id: &str) -> rusqlite::Result<Option<String>> {
        self.with_conn(|conn| {
            let raw: Option<Option<String>> = conn
                .query_row(
                    "SELECT metadata FROM actions
                     WHERE target_id = ?1 AND kind IN ('upload', 'update_content')
                       AND status IN ('pending', 'processing', 'failed')
                     ORDER BY created_at DESC, action_id DESC LIMIT 1",
                    params![target_id],
                    |row| row.get(0),
                )
                .optional()?;
            Ok(raw.and_then(|col| ActionMeta::from_column(col).file_hash))
        })
    }
}

fn insert_action(
    tx: &rusqlite::Transaction<'_>,
    intent: &Intent,
    now: i64,
) -> rusqlite::Result<()> {
    tx.execute(
        "INSERT INTO actions
           (kind, target_id, direction, destination, metadata, priority, created_at, status)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, 'pending')",
        params![
            intent.kind.as_str(),
            intent.target_id,
            intent.direction.as_str(),
            intent.destination,
            intent.meta.to_column(),
            intent.priority,
            now,
        ],
    )?;
    Ok(())
}

fn revive_action(tx: &rusqlite::Transaction<'_>, action_id: i64) -> rusqlite::Result<()> {
    tx.execute(
        "UPDATE actions SET status = 'pending', retry_count = 0, last_error = NULL
         WHERE action_id = ?1",
        params![action_id],
    )?;
    Ok(())
}

fn fold_into(
    tx: &rusqlite::Transaction<'_>,
    prev: &Action,
    destination: Option<&str>,
    meta: &ActionMeta,
) -> rusqlite::Result<()> {
    tx.execute(
        "UPDATE actions SET destination = ?1, metadata = ?2 WHERE action_id = ?3",
        params![destination, meta.to_column(), prev.id],
    )?;
    if prev.status == ActionStatus::Failed {
        revive_action(tx, prev.id)?;
    }
    Ok(())
}

fn action_from_row(row: &Row<'_>) -> rusqlite::Result<Action> {
    Ok(Action {
        id: row.get("action_id")?,
        kind: ActionKind::parse(&row.get::<_, String>("kind")?),
        target_id: row.get("target_id")?,
        direction: Direction::parse(&row.get::<_, String>("direction")?),
        destination: row.get("destination")?,
        meta: ActionMeta::from_column(row.get("metadata")?),
        priority: row.get("priority")?,
        created_at: row.get("created_at")?,
        status: ActionStatus::parse(&row.get::<_, String>("status")?),
        retry_count: row.get("retry_count")?,
        last_error: row.get("last_error")?,
    })
}
