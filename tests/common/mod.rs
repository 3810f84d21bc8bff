//! Shared test harness: an in-memory scripted remote drive plus a fully
//! wired store / cache / adapter / engine fixture.
#![allow(dead_code)]

use orchard_fuse::{
    cache::ContentCache,
    config::{AdapterConfig, CacheConfig, SyncConfig},
    object::{split_display_name, DRIVE_ROOT_ID},
    remote::{RemoteDrive, RemoteError, RemoteItem, RemoteItemKind, DRIVE_ROOT_CLOUD_ID},
    store::{Intent, Store},
    sync::{SyncEngine, Tick},
    vfs::Vfs,
};
use std::{
    collections::HashMap,
    path::Path,
    sync::{Arc, Mutex},
    time::Duration,
};

#[derive(Debug, Clone)]
pub struct MockItem {
    pub parent: String,
    pub display: String,
    pub etag: String,
    pub kind: RemoteItemKind,
    pub data: Vec<u8>,
}

#[derive(Debug, Default)]
pub struct MockState {
    pub connected: bool,
    /// While true, every call (including connect) refuses like a dead link.
    pub offline: bool,
    /// Remaining operations that fail with a transient error before the
    /// fault clears.
    pub fail_next_ops: usize,
    /// Remaining uploads that bounce with 412 Precondition Failed.
    pub precondition_uploads: usize,
    pub items: HashMap<String, MockItem>,
    pub next_id: u64,
    pub list_calls: usize,
    pub upload_calls: usize,
    pub download_calls: usize,
    pub rename_calls: usize,
    pub move_calls: usize,
    pub delete_calls: usize,
}

impl MockState {
    fn alloc(&mut self) -> u64 {
        self.next_id += 1;
        self.next_id
    }

    fn gate(&mut self) -> Result<(), RemoteError> {
        if self.offline {
            return Err(RemoteError::Api("connection refused".into()));
        }
        if self.fail_next_ops > 0 {
            self.fail_next_ops -= 1;
            return Err(RemoteError::Api("connection reset by peer".into()));
        }
        Ok(())
    }

    fn to_remote(&self, cloud_id: &str, item: &MockItem) -> RemoteItem {
        let (name, extension) = split_display_name(&item.display);
        RemoteItem {
            cloud_id: cloud_id.to_owned(),
            parent_cloud_id: item.parent.clone(),
            name,
            extension,
            size: item.data.len() as i64,
            etag: item.etag.clone(),
            kind: item.kind,
            modified_at: 1000,
        }
    }
}

#[derive(Clone)]
pub struct MockRemote(pub Arc<Mutex<MockState>>);

impl MockRemote {
    pub fn new() -> Self {
        Self(Arc::new(Mutex::new(MockState {
            connected: false,
            ..Default::default()
        })))
    }

    pub fn state(&self) -> std::sync::MutexGuard<'_, MockState> {
        self.0.lock().unwrap()
    }

    pub fn add_file(&self, parent: &str, display: &str, data: &[u8]) -> (String, String) {
        let mut state = self.state();
        let n = state.alloc();
        let (cloud_id, etag) = (format!("c{}", n), format!("e{}", n));
        state.items.insert(
            cloud_id.clone(),
            MockItem {
                parent: parent.to_owned(),
                display: display.to_owned(),
                etag: etag.clone(),
                kind: RemoteItemKind::File,
                data: data.to_vec(),
            },
        );
        (cloud_id, etag)
    }

    pub fn add_folder(&self, parent: &str, display: &str) -> (String, String) {
        let mut state = self.state();
        let n = state.alloc();
        let (cloud_id, etag) = (format!("c{}", n), format!("e{}", n));
        state.items.insert(
            cloud_id.clone(),
            MockItem {
                parent: parent.to_owned(),
                display: display.to_owned(),
                etag: etag.clone(),
                kind: RemoteItemKind::Folder,
                data: Vec::new(),
            },
        );
        (cloud_id, etag)
    }

    /// Simulate an edit on another device: new bytes, new etag.
    pub fn mutate_file(&self, cloud_id: &str, data: &[u8]) -> String {
        let mut state = self.state();
        let n = state.alloc();
        let etag = format!("e{}", n);
        let item = state.items.get_mut(cloud_id).expect("unknown mock item");
        item.data = data.to_vec();
        item.etag = etag.clone();
        etag
    }

    pub fn remove(&self, cloud_id: &str) {
        self.state().items.remove(cloud_id);
    }

    pub fn item(&self, cloud_id: &str) -> Option<MockItem> {
        self.state().items.get(cloud_id).cloned()
    }

    pub fn find_by_name(&self, parent: &str, display: &str) -> Option<(String, MockItem)> {
        self.state()
            .items
            .iter()
            .find(|(_, item)| item.parent == parent && item.display == display)
            .map(|(id, item)| (id.clone(), item.clone()))
    }
}

impl RemoteDrive for MockRemote {
    fn is_healthy(&self) -> bool {
        let state = self.state();
        state.connected && !state.offline
    }

    fn connect(&mut self) -> Result<(), RemoteError> {
        let mut state = self.state();
        if state.offline {
            return Err(RemoteError::Api("connection refused".into()));
        }
        state.connected = true;
        Ok(())
    }

    fn disconnect(&mut self) {
        self.state().connected = false;
    }

    fn list_directory(&self, folder_cloud_id: &str) -> Result<Vec<RemoteItem>, RemoteError> {
        let mut state = self.state();
        state.gate()?;
        state.list_calls += 1;
        if folder_cloud_id != DRIVE_ROOT_CLOUD_ID && !state.items.contains_key(folder_cloud_id) {
            return Err(RemoteError::NotFound(folder_cloud_id.to_owned()));
        }
        let mut children: Vec<RemoteItem> = state
            .items
            .iter()
            .filter(|(_, item)| item.parent == folder_cloud_id)
            .map(|(id, item)| state.to_remote(id, item))
            .collect();
        children.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(children)
    }

    fn download(&self, cloud_id: &str, dest: &Path) -> Result<u64, RemoteError> {
        let mut state = self.state();
        state.gate()?;
        state.download_calls += 1;
        let item = state
            .items
            .get(cloud_id)
            .ok_or_else(|| RemoteError::NotFound(cloud_id.to_owned()))?;
        std::fs::write(dest, &item.data).map_err(|e| RemoteError::Api(e.to_string()))?;
        Ok(item.data.len() as u64)
    }

    fn download_range(
        &self,
        cloud_id: &str,
        offset: u64,
        len: u64,
    ) -> Result<Vec<u8>, RemoteError> {
        let mut state = self.state();
        state.gate()?;
        state.download_calls += 1;
        let item = state
            .items
            .get(cloud_id)
            .ok_or_else(|| RemoteError::NotFound(cloud_id.to_owned()))?;
        let start = (offset as usize).min(item.data.len());
        let end = (start + len as usize).min(item.data.len());
        Ok(item.data[start..end].to_vec())
    }

    fn upload(
        &self,
        local: &Path,
        name: &str,
        parent_cloud_id: &str,
    ) -> Result<RemoteItem, RemoteError> {
        let mut state = self.state();
        state.gate()?;
        if state.precondition_uploads > 0 {
            state.precondition_uploads -= 1;
            return Err(RemoteError::Precondition("item version moved".into()));
        }
        state.upload_calls += 1;
        let data = std::fs::read(local).map_err(|e| RemoteError::Api(e.to_string()))?;
        let n = state.alloc();
        let (cloud_id, etag) = (format!("c{}", n), format!("e{}", n));
        let item = MockItem {
            parent: parent_cloud_id.to_owned(),
            display: name.to_owned(),
            etag,
            kind: RemoteItemKind::File,
            data,
        };
        let remote = state.to_remote(&cloud_id, &item);
        state.items.insert(cloud_id, item);
        Ok(remote)
    }

    fn create_folder(&self, parent_cloud_id: &str, name: &str) -> Result<RemoteItem, RemoteError> {
        let mut state = self.state();
        state.gate()?;
        let n = state.alloc();
        let (cloud_id, etag) = (format!("c{}", n), format!("e{}", n));
        let item = MockItem {
            parent: parent_cloud_id.to_owned(),
            display: name.to_owned(),
            etag,
            kind: RemoteItemKind::Folder,
            data: Vec::new(),
        };
        let remote = state.to_remote(&cloud_id, &item);
        state.items.insert(cloud_id, item);
        Ok(remote)
    }

    fn rename(&self, cloud_id: &str, etag: &str, new_name: &str) -> Result<(), RemoteError> {
        let mut state = self.state();
        state.gate()?;
        state.rename_calls += 1;
        let n = state.alloc();
        let fresh = format!("e{}", n);
        let item = state
            .items
            .get_mut(cloud_id)
            .ok_or_else(|| RemoteError::NotFound(cloud_id.to_owned()))?;
        if item.etag != etag {
            return Err(RemoteError::Precondition(format!(
                "etag {} does not match {}",
                etag, item.etag
            )));
        }
        item.display = new_name.to_owned();
        item.etag = fresh;
        Ok(())
    }

    fn move_item(
        &self,
        cloud_id: &str,
        etag: &str,
        new_parent_cloud_id: &str,
    ) -> Result<(), RemoteError> {
        let mut state = self.state();
        state.gate()?;
        state.move_calls += 1;
        let n = state.alloc();
        let fresh = format!("e{}", n);
        let item = state
            .items
            .get_mut(cloud_id)
            .ok_or_else(|| RemoteError::NotFound(cloud_id.to_owned()))?;
        if item.etag != etag {
            return Err(RemoteError::Precondition(format!(
                "etag {} does not match {}",
                etag, item.etag
            )));
        }
        item.parent = new_parent_cloud_id.to_owned();
        item.etag = fresh;
        Ok(())
    }

    fn delete(&self, cloud_id: &str, etag: &str) -> Result<(), RemoteError> {
        let mut state = self.state();
        state.gate()?;
        state.delete_calls += 1;
        let item = state
            .items
            .get(cloud_id)
            .ok_or_else(|| RemoteError::NotFound(cloud_id.to_owned()))?;
        if !etag.is_empty() && item.etag != etag {
            return Err(RemoteError::Precondition(format!(
                "etag {} does not match {}",
                etag, item.etag
            )));
        }
        state.items.remove(cloud_id);
        // folders take their subtree with them
        let orphans: Vec<String> = state
            .items
            .iter()
            .filter(|(_, item)| item.parent == cloud_id)
            .map(|(id, _)| id.clone())
            .collect();
        for id in orphans {
            state.items.remove(&id);
        }
        Ok(())
    }
}

pub struct Harness {
    pub _dir: tempfile::TempDir,
    pub store: Arc<Store>,
    pub cache: ContentCache,
    pub vfs: Arc<Vfs>,
    pub engine: SyncEngine,
    pub remote: MockRemote,
}

pub fn test_adapter_config() -> AdapterConfig {
    AdapterConfig {
        readdir_stale_after: Duration::from_secs(60),
        first_sync_wait: Duration::from_millis(0),
        read_wait: Duration::from_secs(5),
        poll_interval: Duration::from_millis(10),
        refresh_on_open: false,
        process_blacklist: Vec::new(),
        temp_name_prefixes: vec![".~".into(), "~$".into(), ".goutputstream-".into()],
    }
}

pub fn test_cache_config() -> CacheConfig {
    CacheConfig {
        partial_threshold: 64,
        chunk_size: 16,
    }
}

impl Harness {
    pub fn new() -> Self {
        Self::with_adapter(test_adapter_config())
    }

    pub fn with_adapter(adapter: AdapterConfig) -> Self {
        let dir = tempfile::tempdir().unwrap();
        let db_path = dir.path().join("orchard.db");
        let store = Arc::new(Store::open(&db_path).unwrap());
        let cache = ContentCache::new(&dir.path().join("objects"), &test_cache_config()).unwrap();
        let remote = MockRemote::new();
        let engine = SyncEngine::new(
            Store::open(&db_path).unwrap(),
            cache.clone(),
            Box::new(remote.clone()),
            SyncConfig::default(),
        );
        let vfs = Arc::new(Vfs::new(Arc::clone(&store), cache.clone(), adapter));
        Self {
            _dir: dir,
            store,
            cache,
            vfs,
            engine,
            remote,
        }
    }

    /// Run the engine until the queue is drained (or the session drops).
    pub fn drain(&mut self) {
        let mut guard = 0;
        while self.engine.tick() == Tick::Worked {
            guard += 1;
            assert!(guard < 1000, "engine did not drain");
        }
    }

    /// Pull the drive root listing into the store.
    pub fn list_drive(&mut self) {
        self.store
            .enqueue(Intent::list_children(DRIVE_ROOT_ID))
            .unwrap();
        self.drain();
    }

    pub fn drive_ino(&self) -> u64 {
        self.vfs
            .lookup(orchard_fuse::vfs::inode::ROOT_INO, "Drive")
            .unwrap()
            .0
    }
}
