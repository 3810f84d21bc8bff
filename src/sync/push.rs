//! Push-direction intent handlers.

use super::SyncEngine;
use crate::object::{Object, Presence, ShadowPatch};
use crate::remote::{RemoteError, RemoteItem};
use crate::store::{Action, Intent};
use crate::util;
use anyhow::{anyhow, bail, Result};
use std::path::PathBuf;

impl SyncEngine {
    /// First push of a locally created object. Files get a name-collision
    /// probe first (local wins); folders are created remotely and the parent
    /// re-listed to converge the assigned ids.
    pub(super) fn handle_upload(&mut self, action: &Action) -> Result<()> {
        let Some(obj) = self.store.object(&action.target_id)? else {
            log::warn!("Object {} vanished before upload", action.target_id);
            return Ok(());
        };
        if obj.deleted {
            log::debug!("Skipping upload of deleted object {}", obj.id);
            return Ok(());
        }
        let parent_local = obj
            .local
            .parent_id
            .clone()
            .ok_or_else(|| anyhow!("object {} has no parent", obj.id))?;
        let parent_cloud = self
            .resolve_cloud_id(&parent_local)?
            .ok_or_else(|| anyhow!("parent '{}' has no cloud id yet", parent_local))?;
        let full_name = action
            .meta
            .name
            .clone()
            .unwrap_or_else(|| obj.display_name());

        if obj.is_folder() {
            log::info!("Creating remote folder '{}'", full_name);
            let item = self.remote.create_folder(&parent_cloud, &full_name)?;
            self.store.apply_push_result(&obj.id, &item, util::unix_now())?;
            self.store.update_shadow(
                &obj.id,
                &ShadowPatch {
                    cloud_id: Some(item.cloud_id.clone()),
                    parent_id: Some(parent_local.clone()),
                    name: Some(item.display_name()),
                    etag: Some(item.etag.clone()),
                    modified_at: Some(util::unix_now()),
                    ..Default::default()
                },
            )?;
            // pick up anything else the remote knows about the parent
            self.store.enqueue(Intent::list_children(&parent_local))?;
            return Ok(());
        }

        let Some(path) = self.local_content(&obj)? else {
            return Ok(());
        };
        log::info!(
            "Uploading '{}' ({} B) into {}",
            full_name,
            obj.local.size,
            parent_local
        );
        self.delete_name_collision(&parent_cloud, &full_name, obj.cloud.id.as_deref())?;
        let item = match self.remote.upload(&path, &full_name, &parent_cloud) {
            Ok(item) => item,
            Err(RemoteError::Precondition(msg)) => {
                log::warn!(
                    "Upload of '{}' hit a precondition ({}); probing again",
                    full_name,
                    msg
                );
                self.delete_name_collision(&parent_cloud, &full_name, obj.cloud.id.as_deref())?;
                self.remote.upload(&path, &full_name, &parent_cloud)?
            }
            Err(err) => return Err(err.into()),
        };
        self.finish_content_push(&obj, action, &item)
    }

    /// Re-push of changed bytes: delete-then-reupload against the freshest
    /// etag the parent listing reports.
    pub(super) fn handle_update_content(&mut self, action: &Action) -> Result<()> {
        let Some(obj) = self.store.object(&action.target_id)? else {
            return Ok(());
        };
        if obj.deleted || obj.is_folder() {
            return Ok(());
        }
        let Some(cloud_id) = obj.cloud.id.clone() else {
            // never pushed: the upload path owns the first transfer
            return self.handle_upload(action);
        };
        let Some(path) = self.local_content(&obj)? else {
            return Ok(());
        };
        let parent_cloud = self.parent_cloud_id(&obj)?;
        let Some(meta_item) = self.remote.get_metadata(&cloud_id, &parent_cloud)? else {
            log::warn!(
                "{} missing from cloud during update_content",
                obj.display_name()
            );
            self.store.set_missing_from_cloud(&obj.id, true)?;
            return Ok(());
        };
        let full_name = action
            .meta
            .name
            .clone()
            .unwrap_or_else(|| obj.display_name());
        log::info!("Updating remote content of '{}'", full_name);
        self.remote.delete(&cloud_id, &meta_item.etag)?;
        let item = self
            .remote
            .upload(&path, &full_name, &meta_item.parent_cloud_id)?;
        self.finish_content_push(&obj, action, &item)
    }

    pub(super) fn handle_rename(&mut self, action: &Action) -> Result<()> {
        let Some(obj) = self.store.object(&action.target_id)? else {
            return Ok(());
        };
        if obj.deleted {
            return Ok(());
        }
        let dest = action
            .destination
            .clone()
            .ok_or_else(|| anyhow!("rename intent without destination"))?;
        let Some(cloud_id) = obj.cloud.id.clone() else {
            // never pushed: the queued upload already carries the new name
            return Ok(());
        };
        if let Some(shadow) = self.store.shadow(&obj.id)? {
            if shadow.name.as_deref() == Some(dest.as_str()) {
                // folded back to the synced name; nothing to tell the remote
                self.store.mark_synced(&obj.id, util::unix_now())?;
                return Ok(());
            }
        }
        let parent_cloud = self.parent_cloud_id(&obj)?;
        let Some(meta_item) = self.remote.get_metadata(&cloud_id, &parent_cloud)? else {
            log::warn!("{} missing from cloud during rename", obj.display_name());
            self.store.set_missing_from_cloud(&obj.id, true)?;
            return Ok(());
        };
        log::info!("Renaming '{}' to '{}'", meta_item.display_name(), dest);
        self.remote.rename(&cloud_id, &meta_item.etag, &dest)?;
        let now = util::unix_now();
        self.store.update_shadow(
            &obj.id,
            &ShadowPatch {
                name: Some(dest),
                modified_at: Some(now),
                ..Default::default()
            },
        )?;
        self.store.mark_synced(&obj.id, now)?;
        Ok(())
    }

    /// The local row has already moved, so the fresh-etag lookup must go
    /// through the original parent carried in the intent metadata.
    pub(super) fn handle_move(&mut self, action: &Action) -> Result<()> {
        let Some(obj) = self.store.object(&action.target_id)? else {
            return Ok(());
        };
        if obj.deleted {
            return Ok(());
        }
        let dest_parent_local = action
            .destination
            .clone()
            .ok_or_else(|| anyhow!("move intent without destination"))?;
        let Some(cloud_id) = obj.cloud.id.clone() else {
            // the pending upload resolves its parent at dispatch time
            return Ok(());
        };

        let original_parent_cloud = match obj.cloud.parent_id.clone() {
            Some(id) => id,
            None => {
                let original_local = action
                    .meta
                    .original_parent_id
                    .clone()
                    .ok_or_else(|| anyhow!("move intent lost its original parent"))?;
                self.resolve_cloud_id(&original_local)?.ok_or_else(|| {
                    anyhow!("original parent '{}' has no cloud id", original_local)
                })?
            }
        };
        let Some(meta_item) = self.remote.get_metadata(&cloud_id, &original_parent_cloud)? else {
            log::warn!("{} missing from cloud during move", obj.display_name());
            self.store.set_missing_from_cloud(&obj.id, true)?;
            return Ok(());
        };
        let target_cloud = self
            .resolve_cloud_id(&dest_parent_local)?
            .ok_or_else(|| anyhow!("target parent '{}' has no cloud id yet", dest_parent_local))?;
        log::info!(
            "Moving '{}' to folder {}",
            obj.display_name(),
            dest_parent_local
        );
        self.remote
            .move_item(&cloud_id, &meta_item.etag, &target_cloud)?;
        self.store
            .apply_move(&obj.id, &dest_parent_local, &target_cloud)?;
        let now = util::unix_now();
        self.store.update_shadow(
            &obj.id,
            &ShadowPatch {
                parent_id: Some(dest_parent_local),
                modified_at: Some(now),
                ..Default::default()
            },
        )?;
        self.store.mark_synced(&obj.id, now)?;
        Ok(())
    }

    /// Remote delete (when the object ever reached the cloud), then the
    /// local rows and cached bytes go away for good.
    pub(super) fn handle_delete(&mut self, action: &Action) -> Result<()> {
        let Some(obj) = self.store.object(&action.target_id)? else {
            return Ok(());
        };
        if let Some(cloud_id) = obj.cloud.id.clone() {
            if !obj.missing_from_cloud {
                let etag = obj.cloud.etag.clone().unwrap_or_default();
                log::info!("Deleting '{}' from cloud", obj.display_name());
                match self.remote.delete(&cloud_id, &etag) {
                    Ok(()) => {}
                    Err(RemoteError::NotFound(_)) => {
                        log::debug!("{} already gone remotely", obj.display_name());
                    }
                    Err(RemoteError::Precondition(_)) => {
                        // stale etag: look the current one up via the parent
                        let parent_cloud = self.parent_cloud_id(&obj)?;
                        if let Some(meta_item) =
                            self.remote.get_metadata(&cloud_id, &parent_cloud)?
                        {
                            self.remote.delete(&cloud_id, &meta_item.etag)?;
                        }
                    }
                    Err(err) => return Err(err.into()),
                }
            }
        }
        self.store.hard_delete(&obj.id)?;
        self.cache.remove(&obj.id)?;
        Ok(())
    }

    // ---- shared helpers ----

    /// The cache path for an upload, or `None` when the upload became moot
    /// (object deleted under us, typical editor temp-file churn).
    fn local_content(&self, obj: &Object) -> Result<Option<PathBuf>> {
        let path = self.cache.path_for(&obj.id);
        if path.exists() {
            return Ok(Some(path));
        }
        match self.store.object(&obj.id)? {
            None => Ok(None),
            Some(fresh) if fresh.deleted => Ok(None),
            Some(_) => bail!("cache file missing for push of {}", obj.id),
        }
    }

    fn parent_cloud_id(&self, obj: &Object) -> Result<String> {
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

    /// Local-wins collision policy: any remote sibling wearing our name
    /// that is not us gets deleted before the upload.
    fn delete_name_collision(
        &self,
        parent_cloud: &str,
        name: &str,
        own_cloud_id: Option<&str>,
    ) -> Result<()> {
        let children = self.remote.list_directory(parent_cloud)?;
        if let Some(collider) = children
            .into_iter()
            .find(|i| i.display_name() == name && Some(i.cloud_id.as_str()) != own_cloud_id)
        {
            log::info!(
                "Deleting remote collider {} to make room for '{}'",
                collider.cloud_id,
                name
            );
            self.remote.delete(&collider.cloud_id, &collider.etag)?;
        }
        Ok(())
    }

    /// Common bookkeeping after content reached the remote: row, shadow and
    /// cache record all reflect the confirmed state.
    fn finish_content_push(
        &self,
        obj: &Object,
        action: &Action,
        item: &RemoteItem,
    ) -> Result<()> {
        let now = util::unix_now();
        let file_hash = match &action.meta.file_hash {
            Some(hash) => hash.clone(),
            None => self.cache.hash(&obj.id)?,
        };
        self.store.apply_push_result(&obj.id, item, now)?;
        self.store.update_shadow(
            &obj.id,
            &ShadowPatch {
                cloud_id: Some(item.cloud_id.clone()),
                parent_id: obj.local.parent_id.clone(),
                name: Some(item.display_name()),
                etag: Some(item.etag.clone()),
                file_hash: Some(file_hash),
                modified_at: Some(now),
            },
        )?;
        self.store
            .ensure_cache_record(&obj.id, &self.cache.path_for(&obj.id).to_string_lossy())?;
        self.store.set_present(&obj.id, Presence::Full, item.size)?;
        log::info!(
            "Pushed '{}' ({} B, etag {})",
            item.display_name(),
            item.size,
            item.etag
        );
        Ok(())
    }
}
