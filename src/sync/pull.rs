//! Pull-direction intent handlers: remote reconciliation and materialization.

use super::SyncEngine;
use crate::object::{Object, Presence, ShadowPatch, SyncState, DRIVE_ROOT_ID};
use crate::remote::{RemoteItem, RemoteItemKind, DRIVE_ROOT_CLOUD_ID};
use crate::store::Action;
use crate::util;
use anyhow::{anyhow, Result};
use std::collections::HashSet;

impl SyncEngine {
    /// Reconcile one folder against the remote listing. Dirty local rows
    /// keep priority; a dirty row whose remote etag moved is a conflict and
    /// is left for explicit resolution.
    pub(super) fn handle_list_children(&mut self, action: &Action) -> Result<()> {
        let folder_local = action.target_id.as_str();
        let Some(folder) = self.store.object(folder_local)? else {
            return Ok(());
        };
        let cloud_folder = if folder_local == DRIVE_ROOT_ID {
            DRIVE_ROOT_CLOUD_ID.to_owned()
        } else {
            folder
                .cloud
                .id
                .clone()
                .ok_or_else(|| anyhow!("folder '{}' has no cloud id yet", folder_local))?
        };

        let items = self.remote.list_directory(&cloud_folder)?;
        let now = util::unix_now();
        let mut seen: HashSet<String> = HashSet::with_capacity(items.len());
        for item in &items {
            seen.insert(item.cloud_id.clone());
            self.reconcile_item(folder_local, item, now)?;
        }

        // anything we track under this folder that the listing no longer
        // returns was deleted remotely
        for child in self.store.children_with_cloud_id(folder_local)? {
            let child_cloud = child.cloud.id.as_deref().unwrap_or_default();
            if seen.contains(child_cloud) {
                continue;
            }
            if child.local.dirty && !child.missing_from_cloud {
                log::warn!(
                    "Conflict: '{}' changed locally but vanished remotely",
                    child.display_name()
                );
                self.store.set_sync_state(&child.id, SyncState::Conflict)?;
            } else {
                log::info!("Remote deletion of '{}'", child.display_name());
                self.store.mark_remote_deleted(&child.id)?;
            }
        }

        self.store.touch_last_synced(folder_local, now)?;
        log::debug!("Listed {} ({} items)", folder_local, items.len());
        Ok(())
    }

    fn reconcile_item(&mut self, parent_local: &str, item: &RemoteItem, now: i64) -> Result<()> {
        let existing = match self.store.object_by_cloud_id(&item.cloud_id)? {
            Some(obj) => Some(obj),
            // a row we pushed whose id assignment we never saw (e.g. folder
            // creation interrupted before bookkeeping): match it by name
            None => self
                .store
                .child_by_name(parent_local, &item.display_name())?
                .filter(|obj| {
                    obj.cloud.id.is_none()
                        && obj.is_folder() == (item.kind == RemoteItemKind::Folder)
                }),
        };

        let Some(existing) = existing else {
            let id = self.store.insert_cloud_object(parent_local, item, now)?;
            log::debug!("New remote item '{}' -> {}", item.display_name(), id);
            return Ok(());
        };

        if existing.deleted {
            // local delete already queued; the push direction wins
            return Ok(());
        }

        if existing.cloud.id.is_none() {
            log::debug!(
                "Adopting cloud identity {} for local row {}",
                item.cloud_id,
                existing.id
            );
            self.store.apply_push_result(&existing.id, item, now)?;
            self.store.update_shadow(
                &existing.id,
                &ShadowPatch {
                    cloud_id: Some(item.cloud_id.clone()),
                    parent_id: Some(parent_local.to_owned()),
                    name: Some(item.display_name()),
                    etag: Some(item.etag.clone()),
                    modified_at: Some(now),
                    ..Default::default()
                },
            )?;
            return Ok(());
        }

        let etag_changed = existing.cloud.etag.as_deref() != Some(item.etag.as_str());
        if existing.local.dirty {
            if etag_changed {
                log::warn!(
                    "Conflict: '{}' is dirty locally and changed remotely",
                    existing.display_name()
                );
                self.store.set_sync_state(&existing.id, SyncState::Conflict)?;
            }
            // same etag: the local change keeps priority until pushed
            return Ok(());
        }

        if etag_changed {
            let was_present = self
                .store
                .cache_record(&existing.id)?
                .map(|r| r.present != Presence::Missing)
                .unwrap_or(false);
            self.store
                .apply_remote_update(&existing.id, parent_local, item, now)?;
            if existing.is_file() && was_present {
                // stale body; next read re-fetches
                self.cache.invalidate(&self.store, &existing.id)?;
            }
            log::debug!(
                "Remote change on '{}' (etag {} -> {})",
                item.display_name(),
                existing.cloud.etag.as_deref().unwrap_or("-"),
                item.etag
            );
        } else if existing.missing_from_cloud {
            self.store.set_missing_from_cloud(&existing.id, false)?;
        }
        Ok(())
    }

    /// Whole-file fetch via a staging `.part` file and atomic rename.
    pub(super) fn handle_download(&mut self, action: &Action) -> Result<()> {
        let Some(obj) = self.store.object(&action.target_id)? else {
            return Ok(());
        };
        if obj.deleted || obj.is_folder() || obj.cloud.id.is_none() {
            return Ok(());
        }
        if obj.local.dirty {
            log::warn!(
                "Skipping download of '{}': local changes take priority",
                obj.display_name()
            );
            return Ok(());
        }
        let cloud_id = obj.cloud.id.clone().unwrap();
        let parent_cloud = self.pull_parent_cloud_id(&obj)?;
        let Some(meta_item) = self.remote.get_metadata(&cloud_id, &parent_cloud)? else {
            log::warn!("{} missing from cloud during download", obj.display_name());
            self.store.set_missing_from_cloud(&obj.id, true)?;
            return Ok(());
        };
        self.fetch_full(&obj, &meta_item)
    }

    /// Freshness check before serving content: a recently listed parent
    /// vouches for the stamped etag, otherwise the parent is listed for a
    /// fresh one. Downloads only when the cache cannot be trusted.
    pub(super) fn handle_ensure_latest(&mut self, action: &Action) -> Result<()> {
        let Some(obj) = self.store.object(&action.target_id)? else {
            return Ok(());
        };
        if obj.deleted || obj.is_folder() || obj.cloud.id.is_none() {
            return Ok(());
        }
        if obj.local.dirty {
            // never clobber unsynced bytes
            return Ok(());
        }
        let cloud_id = obj.cloud.id.clone().unwrap();
        let now = util::unix_now();

        let parent_fresh = match obj.local.parent_id.as_deref() {
            Some(parent_id) => self
                .store
                .object(parent_id)?
                .map(|p| {
                    p.last_synced != 0
                        && now - p.last_synced
                            <= self.config.metadata_fresh_window.as_secs() as i64
                })
                .unwrap_or(false),
            None => false,
        };

        let (cloud_etag, meta_item) = if parent_fresh && obj.cloud.etag.is_some() {
            (obj.cloud.etag.clone().unwrap(), None)
        } else {
            let parent_cloud = self.pull_parent_cloud_id(&obj)?;
            match self.remote.get_metadata(&cloud_id, &parent_cloud)? {
                Some(item) => (item.etag.clone(), Some(item)),
                None => {
                    log::warn!(
                        "{} missing from cloud during ensure_latest",
                        obj.display_name()
                    );
                    self.store.set_missing_from_cloud(&obj.id, true)?;
                    return Ok(());
                }
            }
        };

        let present_full = self
            .store
            .cache_record(&obj.id)?
            .map(|r| r.present == Presence::Full)
            .unwrap_or(false);
        let shadow_etag = self.store.shadow(&obj.id)?.and_then(|s| s.etag);
        if present_full && shadow_etag.as_deref() == Some(cloud_etag.as_str()) {
            self.store.mark_synced(&obj.id, now)?;
            return Ok(());
        }

        let item = match meta_item {
            Some(item) => item,
            None => synthesize_item(&obj, &cloud_etag),
        };
        self.fetch_full(&obj, &item)
    }

    /// One byte range into the sparse file. Completing the chunk set flips
    /// the record to full and drops the (now meaningless) chunk rows.
    pub(super) fn handle_download_chunk(&mut self, action: &Action) -> Result<()> {
        let Some(obj) = self.store.object(&action.target_id)? else {
            return Ok(());
        };
        if obj.deleted || obj.is_folder() || obj.cloud.id.is_none() {
            return Ok(());
        }
        let index = action
            .meta
            .chunk_index
            .ok_or_else(|| anyhow!("chunk intent without an index"))?;
        let record = self.store.cache_record(&obj.id)?;
        if record.as_ref().map(|r| r.present) == Some(Presence::Full) {
            return Ok(());
        }
        let have = self.store.present_chunks(&obj.id)?;
        if have.contains(&index) {
            return Ok(());
        }
        if !self.cache.path_for(&obj.id).exists() {
            self.cache
                .create_sparse_placeholder(&self.store, &obj.id, obj.local.size)?;
        }

        let file_size = obj.local.size.max(0) as u64;
        let (offset, len) = self.cache.chunk_span(index, file_size);
        if len == 0 {
            log::debug!("Dropping out-of-range chunk {} for {}", index, obj.id);
            return Ok(());
        }
        let cloud_id = obj.cloud.id.clone().unwrap();
        let bytes = self.remote.download_range(&cloud_id, offset, len)?;
        self.cache.write_at_raw(&obj.id, offset, &bytes)?;
        self.store.add_chunk(&obj.id, index)?;

        let total = self.cache.chunk_count(obj.local.size);
        let have = self.store.present_chunks(&obj.id)?;
        if total > 0 && have.len() as u64 >= total {
            self.store
                .set_present(&obj.id, Presence::Full, obj.local.size)?;
            log::debug!("'{}' fully materialized by chunks", obj.display_name());
        } else {
            let cached: u64 = have
                .iter()
                .map(|&i| self.cache.chunk_span(i, file_size).1)
                .sum();
            self.store
                .set_present(&obj.id, Presence::Partial, cached as i64)?;
            log::trace!(
                "Chunk {}/{} of '{}' landed ({} B cached)",
                index,
                total,
                obj.display_name(),
                cached
            );
        }
        Ok(())
    }

    // ---- shared helpers ----

    fn pull_parent_cloud_id(&self, obj: &Object) -> Result<String> {
        if let Some(id) = obj.cloud.parent_id.clone() {
            return Ok(id);
        }
        let parent_local = obj
            .local
            .parent_id
            .clone()
            .ok_or_else(|| anyhow!("object {} has no parent", obj.id))?;
        self.resolve_cloud_id(&parent_local)?
            .ok_or_else(|| anyhow!("parent '{}' has no cloud id yet", parent_local))
    }

    fn fetch_full(&mut self, obj: &Object, item: &RemoteItem) -> Result<()> {
        let cloud_id = obj
            .cloud
            .id
            .clone()
            .ok_or_else(|| anyhow!("download without a cloud id"))?;
        let dest = self.cache.path_for(&obj.id);
        let part = self.cache.part_path_for(&obj.id);
        let size = self.remote.download(&cloud_id, &part)?;
        let file_hash = util::sha256_file(&part)?;
        std::fs::rename(&part, &dest)?;

        let now = util::unix_now();
        self.store
            .ensure_cache_record(&obj.id, &dest.to_string_lossy())?;
        self.store
            .apply_download(&obj.id, &item.etag, size as i64, now)?;
        self.store.set_present(&obj.id, Presence::Full, size as i64)?;
        self.store.update_shadow(
            &obj.id,
            &ShadowPatch {
                cloud_id: Some(cloud_id),
                parent_id: obj.local.parent_id.clone(),
                name: Some(item.display_name()),
                etag: Some(item.etag.clone()),
                file_hash: Some(file_hash),
                modified_at: Some(now),
            },
        )?;
        log::info!("Downloaded '{}' ({} B)", item.display_name(), size);
        Ok(())
    }
}

/// When a fresh listing already stamped the etag, the row itself carries
/// everything a download needs.
fn synthesize_item(obj: &Object, etag: &str) -> RemoteItem {
    RemoteItem {
        cloud_id: obj.cloud.id.clone().unwrap_or_default(),
        parent_cloud_id: obj.cloud.parent_id.clone().unwrap_or_default(),
        name: obj.local.name.clone(),
        extension: obj.local.extension.clone(),
        size: obj.local.size,
        etag: etag.to_owned(),
        kind: RemoteItemKind::File,
        modified_at: obj.cloud.modified_at,
    }
}
