//! Interface boundary to the cloud drive client.
//!
//! The authenticated HTTP session, keyring handling and endpoint plumbing
//! live outside this crate; the sync engine only ever talks to a
//! [`RemoteDrive`]. The engine owns the session exclusively and re-connects
//! it whenever a tick finds it unhealthy.

use std::path::Path;
use thiserror::Error;

/// Sentinel cloud id of the drive root folder. The drive root's local row
/// never stores a cloud id; resolution substitutes this constant instead.
pub const DRIVE_ROOT_CLOUD_ID: &str = "FOLDER::root";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RemoteItemKind {
    File,
    Folder,
}

/// One entry of a remote directory listing.
#[derive(Debug, Clone)]
pub struct RemoteItem {
    pub cloud_id: String,
    pub parent_cloud_id: String,
    /// Base name without the extension.
    pub name: String,
    pub extension: Option<String>,
    pub size: i64,
    pub etag: String,
    pub kind: RemoteItemKind,
    /// Remote modification time, seconds since epoch.
    pub modified_at: i64,
}

impl RemoteItem {
    pub fn display_name(&self) -> String {
        match &self.extension {
            Some(ext) => format!("{}.{}", self.name, ext),
            None => self.name.clone(),
        }
    }

    pub fn is_file(&self) -> bool {
        self.kind == RemoteItemKind::File
    }
}

#[derive(Debug, Error)]
pub enum RemoteError {
    #[error("remote session is not established")]
    NotConnected,
    /// The remote rejected a write because its version token moved (412).
    #[error("precondition failed: {0}")]
    Precondition(String),
    #[error("remote item not found: {0}")]
    NotFound(String),
    #[error("remote api error: {0}")]
    Api(String),
}

impl RemoteError {
    /// Message markers of network or transient remote unavailability. A
    /// transient failure resets the action to pending and drops the session
    /// so the next tick reconnects.
    pub fn is_transient(&self) -> bool {
        const MARKERS: &[&str] = &["connection", "timeout", "timed out", "503", "409", "socket"];
        match self {
            RemoteError::NotConnected => true,
            RemoteError::Api(msg) => {
                let msg = msg.to_ascii_lowercase();
                MARKERS.iter().any(|m| msg.contains(m))
            }
            _ => false,
        }
    }
}

/// Operations the sync engine needs from the cloud client.
///
/// The by-id metadata endpoint of the backing service is unreliable, so the
/// authoritative "current etag of X" procedure is: list X's parent and match
/// by cloud id. `get_metadata` encodes that discipline as a default method;
/// every engine handler that needs a fresh etag resolves the parent's cloud
/// id first and passes it here.
pub trait RemoteDrive: Send {
    fn is_healthy(&self) -> bool;

    fn connect(&mut self) -> Result<(), RemoteError>;

    /// Drop the session so the next [`connect`](Self::connect) starts clean.
    fn disconnect(&mut self);

    fn list_directory(&self, folder_cloud_id: &str) -> Result<Vec<RemoteItem>, RemoteError>;

    fn get_metadata(
        &self,
        cloud_id: &str,
        parent_cloud_id: &str,
    ) -> Result<Option<RemoteItem>, RemoteError> {
        Ok(self
            .list_directory(parent_cloud_id)?
            .into_iter()
            .find(|item| item.cloud_id == cloud_id))
    }

    /// Fetch full content into `dest`, returning the byte count.
    fn download(&self, cloud_id: &str, dest: &Path) -> Result<u64, RemoteError>;

    /// Fetch `len` bytes starting at `offset`. The tail range of a file may
    /// return fewer bytes than requested.
    fn download_range(&self, cloud_id: &str, offset: u64, len: u64)
        -> Result<Vec<u8>, RemoteError>;

    /// Upload `local` under `name` into the given folder, returning the
    /// item the remote created.
    fn upload(&self, local: &Path, name: &str, parent_cloud_id: &str)
        -> Result<RemoteItem, RemoteError>;

    fn create_folder(&self, parent_cloud_id: &str, name: &str) -> Result<RemoteItem, RemoteError>;

    fn rename(&self, cloud_id: &str, etag: &str, new_name: &str) -> Result<(), RemoteError>;

    fn move_item(
        &self,
        cloud_id: &str,
        etag: &str,
        new_parent_cloud_id: &str,
    ) -> Result<(), RemoteError>;

    fn delete(&self, cloud_id: &str, etag: &str) -> Result<(), RemoteError>;
}

/// Stand-in used until the external auth subsystem hands over a session.
///
/// Never healthy, never connects. With this in place the mount still comes
/// up, every captured intent stays queued in the store, and the engine
/// retries the session each tick, which is exactly the offline behavior.
#[derive(Debug, Default)]
pub struct OfflineDrive;

impl RemoteDrive for OfflineDrive {
    fn is_healthy(&self) -> bool {
        false
    }

    fn connect(&mut self) -> Result<(), RemoteError> {
        Err(RemoteError::NotConnected)
    }

    fn disconnect(&mut self) {}

    fn list_directory(&self, _folder_cloud_id: &str) -> Result<Vec<RemoteItem>, RemoteError> {
        Err(RemoteError::NotConnected)
    }

    fn download(&self, _cloud_id: &str, _dest: &Path) -> Result<u64, RemoteError> {
        Err(RemoteError::NotConnected)
    }

    fn download_range(
        &self,
        _cloud_id: &str,
        _offset: u64,
        _len: u64,
    ) -> Result<Vec<u8>, RemoteError> {
        Err(RemoteError::NotConnected)
    }

    fn upload(
        &self,
        _local: &Path,
        _name: &str,
        _parent_cloud_id: &str,
    ) -> Result<RemoteItem, RemoteError> {
        Err(RemoteError::NotConnected)
    }

    fn create_folder(
        &self,
        _parent_cloud_id: &str,
        _name: &str,
    ) -> Result<RemoteItem, RemoteError> {
        Err(RemoteError::NotConnected)
    }

    fn rename(&self, _cloud_id: &str, _etag: &str, _new_name: &str) -> Result<(), RemoteError> {
        Err(RemoteError::NotConnected)
    }

    fn move_item(
        &self,
        _cloud_id: &str,
        _etag: &str,
        _new_parent_cloud_id: &str,
    ) -> Result<(), RemoteError> {
        Err(RemoteError::NotConnected)
    }

    fn delete(&self, _cloud_id: &str, _etag: &str) -> Result<(), RemoteError> {
        Err(RemoteError::NotConnected)
    }
}
