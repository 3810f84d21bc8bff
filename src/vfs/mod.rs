//! Filesystem adapter core.
//!
//! Every kernel operation lands here as a plain result-returning method;
//! the fuser glue in [`crate::fs`] only maps errors to POSIX codes. The
//! adapter never talks to the remote: it mutates local state, serves the
//! content cache and enqueues intents, blocking only on bounded store-backed
//! polls while the engine fills the cache.

pub mod inode;

use crate::cache::ContentCache;
use crate::config::AdapterConfig;
use crate::error::{Error, Result};
use crate::object::{split_display_name, Object, Presence, SyncState, ROOT_ID};
use crate::store::{Intent, Store, PRIO_HIGH, PRIO_PIN};
use crate::util;
use inode::InodeMap;
use lru_cache::LruCache;
use std::{
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc, Mutex,
    },
    time::{Duration, Instant},
};

pub const XATTR_STATUS: &str = "user.orchard.status";
pub const XATTR_PINNED: &str = "user.orchard.pinned";

const NAME_CACHE_SIZE: usize = 1024;

pub struct Vfs {
    store: Arc<Store>,
    cache: ContentCache,
    config: AdapterConfig,
    inodes: Mutex<InodeMap>,
    /// (parent id, display name) -> child id, invalidated on every mutation
    /// that could change the binding.
    name_cache: Mutex<LruCache<(String, String), String>>,
    next_fh: AtomicU64,
}

impl Vfs {
    pub fn new(store: Arc<Store>, cache: ContentCache, config: AdapterConfig) -> Self {
        Self {
            store,
            cache,
            config,
            inodes: Mutex::new(InodeMap::new()),
            name_cache: Mutex::new(LruCache::new(NAME_CACHE_SIZE)),
            next_fh: AtomicU64::new(1),
        }
    }

    pub fn store(&self) -> &Store {
        &self.store
    }

    pub fn ino_for(&self, id: &str) -> u64 {
        self.inodes.lock().unwrap().get_or_assign(id)
    }

    fn alloc_fh(&self) -> u64 {
        self.next_fh.fetch_add(1, Ordering::Relaxed)
    }

    /// Resolve an inode to a live (non-deleted) object.
    pub fn resolve(&self, ino: u64) -> Result<Object> {
        let id = self
            .inodes
            .lock()
            .unwrap()
            .id_of(ino)
            .map(str::to_owned)
            .ok_or(Error::NotFound)?;
        match self.store.object(&id)? {
            Some(obj) if !obj.deleted => Ok(obj),
            _ => Err(Error::NotFound),
        }
    }

    fn child(&self, parent: &Object, name: &str) -> Result<Object> {
        if !parent.is_folder() {
            return Err(Error::NotADirectory);
        }
        let key = (parent.id.clone(), name.to_owned());
        let cached = self.name_cache.lock().unwrap().get_mut(&key).cloned();
        if let Some(id) = cached {
            match self.store.object(&id)? {
                // a reconciled rename can leave the binding stale
                Some(obj)
                    if !obj.deleted
                        && (obj.display_name() == name || obj.local.name == name) =>
                {
                    return Ok(obj)
                }
                _ => {
                    self.name_cache.lock().unwrap().remove(&key);
                }
            }
        }
        let obj = self
            .store
            .child_by_name(&parent.id, name)?
            .ok_or(Error::NotFound)?;
        self.name_cache.lock().unwrap().insert(key, obj.id.clone());
        Ok(obj)
    }

    fn uncache_name(&self, parent_id: &str, name: &str) {
        self.name_cache
            .lock()
            .unwrap()
            .remove(&(parent_id.to_owned(), name.to_owned()));
    }

    /// Bounded poll of the store; true once `pred` holds, false on timeout.
    fn wait_until(&self, timeout: Duration, mut pred: impl FnMut() -> Result<bool>) -> Result<bool> {
        let deadline = Instant::now() + timeout;
        loop {
            if pred()? {
                return Ok(true);
            }
            if Instant::now() >= deadline {
                return Ok(false);
            }
            std::thread::sleep(self.config.poll_interval);
        }
    }

    // ---- operations ----

    pub fn lookup(&self, parent_ino: u64, name: &str) -> Result<(u64, Object)> {
        let parent = self.resolve(parent_ino)?;
        let obj = self.child(&parent, name)?;
        Ok((self.ino_for(&obj.id), obj))
    }

    pub fn getattr(&self, ino: u64) -> Result<Object> {
        self.resolve(ino)
    }

    /// Enumerate a folder. A stale folder gets a refresh queued; a folder
    /// that has never been listed blocks (bounded) for its first pull.
    pub fn readdir(&self, ino: u64) -> Result<Vec<(u64, Object)>> {
        let obj = self.resolve(ino)?;
        if !obj.is_folder() {
            return Err(Error::NotADirectory);
        }

        if obj.id != ROOT_ID {
            let now = util::unix_now();
            if obj.last_synced == 0 {
                self.store
                    .enqueue(Intent::list_children(&obj.id).with_priority(PRIO_HIGH))?;
                let id = obj.id.clone();
                self.wait_until(self.config.first_sync_wait, || {
                    Ok(self
                        .store
                        .object(&id)?
                        .map(|o| o.last_synced != 0)
                        .unwrap_or(true))
                })?;
                // on timeout we fall through and return what is present
            } else if now - obj.last_synced > self.config.readdir_stale_after.as_secs() as i64 {
                self.store
                    .enqueue(Intent::list_children(&obj.id).with_priority(PRIO_HIGH))?;
            }
        }

        let children = self.store.children(&obj.id)?;
        Ok(children
            .into_iter()
            .map(|child| (self.ino_for(&child.id), child))
            .collect())
    }

    pub fn create(&self, parent_ino: u64, name: &str) -> Result<(u64, Object, u64)> {
        let parent = self.resolve(parent_ino)?;
        if !parent.is_folder() {
            return Err(Error::NotADirectory);
        }
        if self.store.child_by_name(&parent.id, name)?.is_some() {
            return Err(Error::Exists);
        }
        let (base, ext) = split_display_name(name);
        let obj = self
            .store
            .insert_local_file(&parent.id, &base, ext.as_deref(), util::unix_now())?;
        self.cache.create_placeholder(&self.store, &obj.id)?;
        // queue the upload right away; release folds the content hash (and
        // any rename folds the final name) into this same action
        self.store.enqueue(Intent::upload(&obj.id, name))?;
        self.store.add_open(&obj.id, 1, util::unix_now())?;
        self.name_cache
            .lock()
            .unwrap()
            .insert((parent.id.clone(), name.to_owned()), obj.id.clone());
        let ino = self.ino_for(&obj.id);
        Ok((ino, obj, self.alloc_fh()))
    }

    pub fn open(&self, ino: u64) -> Result<u64> {
        let obj = self.resolve(ino)?;
        if obj.is_folder() {
            return Err(Error::IsADirectory);
        }
        self.store
            .ensure_cache_record(&obj.id, &self.cache.path_for(&obj.id).to_string_lossy())?;
        let record = self.store.cache_record(&obj.id)?;
        let present = record.as_ref().map(|r| r.present).unwrap_or(Presence::Missing);
        match present {
            Presence::Full => {
                if self.config.refresh_on_open && obj.cloud.id.is_some() {
                    self.store
                        .enqueue(Intent::ensure_latest(&obj.id).with_priority(PRIO_HIGH))?;
                }
            }
            Presence::Partial => {}
            Presence::Missing => {
                if obj.cloud.id.is_some() {
                    if self.cache.uses_chunks(obj.local.size) {
                        self.cache
                            .create_sparse_placeholder(&self.store, &obj.id, obj.local.size)?;
                    } else {
                        self.store
                            .enqueue(Intent::download(&obj.id).with_priority(PRIO_HIGH))?;
                    }
                } else {
                    // local-origin file whose cache was never materialized
                    self.cache.create_placeholder(&self.store, &obj.id)?;
                }
            }
        }
        self.store.add_open(&obj.id, 1, util::unix_now())?;
        Ok(self.alloc_fh())
    }

    /// Serve a read, materializing on demand. Blacklisted caller identities
    /// are denied before anything is fetched.
    pub fn read(&self, ino: u64, offset: u64, size: usize, pid: u32) -> Result<Vec<u8>> {
        let obj = self.resolve(ino)?;
        if obj.is_folder() {
            return Err(Error::IsADirectory);
        }
        let record = self.store.cache_record(&obj.id)?;
        let present = record.as_ref().map(|r| r.present).unwrap_or(Presence::Missing);

        if present != Presence::Full {
            if self.is_blacklisted(pid) {
                return Err(Error::AccessDenied);
            }
            if self.cache.uses_chunks(obj.local.size) {
                self.read_wait_chunks(&obj, offset, size)?;
            } else {
                self.store
                    .enqueue(Intent::ensure_latest(&obj.id).with_priority(PRIO_HIGH))?;
                let id = obj.id.clone();
                let arrived = self.wait_until(self.config.read_wait, || {
                    Ok(self
                        .store
                        .cache_record(&id)?
                        .map(|r| r.present == Presence::Full)
                        .unwrap_or(false))
                })?;
                if !arrived {
                    return Err(Error::WaitTimeout);
                }
            }
        }
        Ok(self.cache.read(&obj.id, offset, size)?)
    }

    /// Queue fetches for the chunks intersecting the range and wait until
    /// they all landed (or the file flipped to full).
    fn read_wait_chunks(&self, obj: &Object, offset: u64, size: usize) -> Result<()> {
        if !self.cache.path_for(&obj.id).exists() {
            self.cache
                .create_sparse_placeholder(&self.store, &obj.id, obj.local.size)?;
        }
        let needed = self
            .cache
            .chunks_for_range(offset, size as u64, obj.local.size.max(0) as u64);
        let have: std::collections::HashSet<u64> =
            self.store.present_chunks(&obj.id)?.into_iter().collect();
        for &index in needed.iter().filter(|i| !have.contains(i)) {
            self.store
                .enqueue(Intent::download_chunk(&obj.id, index).with_priority(PRIO_HIGH))?;
        }
        let id = obj.id.clone();
        let arrived = self.wait_until(self.config.read_wait, || {
            let record = self.store.cache_record(&id)?;
            if record.map(|r| r.present == Presence::Full).unwrap_or(false) {
                return Ok(true);
            }
            let have: std::collections::HashSet<u64> =
                self.store.present_chunks(&id)?.into_iter().collect();
            Ok(needed.iter().all(|i| have.contains(i)))
        })?;
        if arrived {
            Ok(())
        } else {
            Err(Error::WaitTimeout)
        }
    }

    pub fn write(&self, ino: u64, offset: u64, data: &[u8]) -> Result<u32> {
        let obj = self.resolve(ino)?;
        if obj.is_folder() {
            return Err(Error::IsADirectory);
        }
        let present = self
            .store
            .cache_record(&obj.id)?
            .map(|r| r.present)
            .unwrap_or(Presence::Missing);
        if present == Presence::Missing {
            self.cache.create_placeholder(&self.store, &obj.id)?;
        }
        let written = self.cache.write(&self.store, &obj.id, offset, data)?;
        Ok(written as u32)
    }

    pub fn truncate(&self, ino: u64, len: u64) -> Result<()> {
        let obj = self.resolve(ino)?;
        if obj.is_folder() {
            return Err(Error::IsADirectory);
        }
        self.cache.truncate(&self.store, &obj.id, len)
    }

    /// Close bookkeeping. The last closer of a dirty, fully present,
    /// non-temp file hashes the content and queues one content push,
    /// unless the bytes already match the shadow or an already-queued push.
    pub fn release(&self, ino: u64) -> Result<()> {
        let obj = match self.resolve(ino) {
            Ok(obj) => obj,
            Err(_) => return Ok(()),
        };
        if obj.is_folder() {
            return Ok(());
        }
        let open_count = self.store.add_open(&obj.id, -1, util::unix_now())?;
        if open_count > 0 {
            return Ok(());
        }
        if !obj.local.dirty {
            return Ok(());
        }
        let record = self.store.cache_record(&obj.id)?;
        if record.map(|r| r.present) != Some(Presence::Full) {
            return Ok(());
        }
        let display = obj.display_name();
        if self
            .config
            .temp_name_prefixes
            .iter()
            .any(|p| display.starts_with(p.as_str()))
        {
            return Ok(());
        }
        if !self.cache.path_for(&obj.id).exists() {
            return Ok(());
        }

        let file_hash = self.cache.hash(&obj.id)?;
        if let Some(shadow) = self.store.shadow(&obj.id)? {
            if shadow.file_hash.as_deref() == Some(file_hash.as_str()) {
                // content is back to the last synced bytes
                self.store.mark_synced(&obj.id, obj.last_synced)?;
                return Ok(());
            }
        }
        if self.store.last_content_push_hash(&obj.id)?.as_deref() == Some(file_hash.as_str()) {
            return Ok(());
        }
        self.store.enqueue(Intent::update_content(
            &obj.id,
            Some(file_hash),
            Some(display),
        ))?;
        Ok(())
    }

    pub fn mkdir(&self, parent_ino: u64, name: &str) -> Result<(u64, Object)> {
        let parent = self.resolve(parent_ino)?;
        if !parent.is_folder() {
            return Err(Error::NotADirectory);
        }
        if self.store.child_by_name(&parent.id, name)?.is_some() {
            return Err(Error::Exists);
        }
        let obj = self
            .store
            .insert_local_folder(&parent.id, name, util::unix_now())?;
        self.store.enqueue(Intent::upload(&obj.id, name))?;
        let ino = self.ino_for(&obj.id);
        Ok((ino, obj))
    }

    pub fn unlink(&self, parent_ino: u64, name: &str) -> Result<()> {
        let parent = self.resolve(parent_ino)?;
        let obj = self.child(&parent, name)?;
        if obj.is_folder() {
            return Err(Error::IsADirectory);
        }
        self.soft_delete(&obj)?;
        self.uncache_name(&parent.id, name);
        Ok(())
    }

    pub fn rmdir(&self, parent_ino: u64, name: &str) -> Result<()> {
        let parent = self.resolve(parent_ino)?;
        let obj = self.child(&parent, name)?;
        if !obj.is_folder() {
            return Err(Error::NotADirectory);
        }
        if self.store.has_live_children(&obj.id)? {
            return Err(Error::NotEmpty);
        }
        self.soft_delete(&obj)?;
        self.uncache_name(&parent.id, name);
        Ok(())
    }

    fn soft_delete(&self, obj: &Object) -> Result<()> {
        self.store.set_deleted(&obj.id)?;
        self.store.enqueue(Intent::delete(&obj.id))?;
        if obj.is_file() {
            self.cache.invalidate(&self.store, &obj.id)?;
        }
        Ok(())
    }

    /// Detects pure-rename, pure-move and combined; mutates the local row
    /// immediately and queues the matching remote intents.
    pub fn rename(
        &self,
        parent_ino: u64,
        name: &str,
        new_parent_ino: u64,
        new_name: &str,
    ) -> Result<()> {
        let parent = self.resolve(parent_ino)?;
        let mut obj = self.child(&parent, name)?;
        let dest_parent = self.resolve(new_parent_ino)?;
        if !dest_parent.is_folder() {
            return Err(Error::NotADirectory);
        }

        // an existing non-folder target at the destination is soft-deleted
        if let Some(target) = self.store.child_by_name(&dest_parent.id, new_name)? {
            if target.id != obj.id {
                if target.is_folder() {
                    return Err(Error::Exists);
                }
                self.soft_delete(&target)?;
                self.uncache_name(&dest_parent.id, new_name);
            }
        }

        let old_display = obj.display_name();
        let original_parent = obj.local.parent_id.clone();
        let is_move = original_parent.as_deref() != Some(dest_parent.id.as_str());
        let is_rename = old_display != new_name;

        if obj.is_file() {
            let (base, ext) = split_display_name(new_name);
            obj.local.name = base;
            obj.local.extension = ext;
        } else {
            obj.local.name = new_name.to_owned();
            obj.local.extension = None;
        }
        obj.local.parent_id = Some(dest_parent.id.clone());
        self.store.commit_local(&obj)?;

        if is_move {
            let original = original_parent.as_deref().unwrap_or(ROOT_ID);
            self.store
                .enqueue(Intent::mv(&obj.id, &dest_parent.id, original))?;
        }
        if is_rename {
            self.store
                .enqueue(Intent::rename(&obj.id, &old_display, new_name))?;
        }

        self.uncache_name(&parent.id, name);
        self.name_cache
            .lock()
            .unwrap()
            .insert((dest_parent.id, new_name.to_owned()), obj.id.clone());
        Ok(())
    }

    // ---- pseudo-xattrs ----

    pub fn getxattr(&self, ino: u64, name: &str) -> Result<Vec<u8>> {
        let obj = self.resolve(ino)?;
        match name {
            XATTR_STATUS => Ok(self.status_of(&obj)?.as_bytes().to_vec()),
            XATTR_PINNED => {
                let pinned = self
                    .store
                    .cache_record(&obj.id)?
                    .map(|r| r.pinned)
                    .unwrap_or(false);
                Ok(if pinned { b"1".to_vec() } else { b"0".to_vec() })
            }
            other => Err(Error::NoXattr(other.to_owned())),
        }
    }

    pub fn setxattr(&self, ino: u64, name: &str, value: &[u8]) -> Result<()> {
        let obj = self.resolve(ino)?;
        match name {
            XATTR_PINNED => {
                let pin = std::str::from_utf8(value)
                    .map(|s| s.trim() == "1" || s.trim().eq_ignore_ascii_case("true"))
                    .unwrap_or(false);
                self.store.set_pinned(&obj.id, pin)?;
                if pin {
                    self.store
                        .enqueue(Intent::ensure_latest(&obj.id).with_priority(PRIO_PIN))?;
                } else {
                    // an evict refused because the file is dirty or open is
                    // not an error for the caller
                    match self.cache.evict(&self.store, &obj.id) {
                        Ok(()) | Err(Error::CacheBusy(_)) => {}
                        Err(err) => return Err(err),
                    }
                }
                Ok(())
            }
            XATTR_STATUS => Err(Error::ReadOnlyXattr(name.to_owned())),
            other => Err(Error::NoXattr(other.to_owned())),
        }
    }

    pub fn listxattr(&self) -> Vec<&'static str> {
        vec![XATTR_STATUS, XATTR_PINNED]
    }

    /// Status string surfaced to the file manager, derived from the
    /// {dirty, presence, sync-state} triad.
    fn status_of(&self, obj: &Object) -> Result<&'static str> {
        if obj.sync_state == SyncState::Conflict {
            return Ok("conflict");
        }
        if obj.local.dirty {
            return Ok("modified");
        }
        if obj.is_folder() {
            return Ok("local");
        }
        let present = self
            .store
            .cache_record(&obj.id)?
            .map(|r| r.present)
            .unwrap_or(Presence::Missing);
        Ok(match present {
            Presence::Full => "local",
            Presence::Partial => "partial",
            Presence::Missing => "cloud",
        })
    }

    // ---- caller identity ----

    /// Indexers and thumbnailers must never trigger remote fetches. When
    /// the platform cannot name the caller, the gate degrades to allow.
    fn is_blacklisted(&self, pid: u32) -> bool {
        let Some(cmdline) = caller_command_line(pid) else {
            return false;
        };
        let exe = cmdline.split(' ').next().unwrap_or("");
        let base = exe.rsplit('/').next().unwrap_or(exe);
        self.config
            .process_blacklist
            .iter()
            .any(|p| base.contains(p.as_str()) || cmdline.contains(p.as_str()))
    }
}

#[cfg(target_os = "linux")]
fn caller_command_line(pid: u32) -> Option<String> {
    let raw = std::fs::read(format!("/proc/{}/cmdline", pid)).ok()?;
    let joined = String::from_utf8_lossy(&raw).replace('\0', " ");
    let trimmed = joined.trim();
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed.to_owned())
    }
}

#[cfg(not(target_os = "linux"))]
fn caller_command_line(_pid: u32) -> Option<String> {
    None
}
