//! Typed view over store rows.
//!
//! An [`Object`] is one node of the logical tree, split into the two named
//! state views: `local` is what the adapter observes right now, `cloud` is
//! what the remote last confirmed. The optional [`CacheRecord`] and
//! [`Shadow`] complete the triad.

use crate::util;

/// Synthetic filesystem root. Always present, never synced.
pub const ROOT_ID: &str = "root";
/// The drive root, sole child of [`ROOT_ID`].
pub const DRIVE_ROOT_ID: &str = "drive_root";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ObjectKind {
    File,
    Folder,
}

impl ObjectKind {
    pub fn as_str(self) -> &'static str {
        match self {
            ObjectKind::File => "file",
            ObjectKind::Folder => "folder",
        }
    }

    pub fn parse(s: &str) -> Self {
        match s {
            "file" => ObjectKind::File,
            _ => ObjectKind::Folder,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Origin {
    Local,
    Cloud,
}

impl Origin {
    pub fn as_str(self) -> &'static str {
        match self {
            Origin::Local => "local",
            Origin::Cloud => "cloud",
        }
    }

    pub fn parse(s: &str) -> Self {
        match s {
            "cloud" => Origin::Cloud,
            _ => Origin::Local,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncState {
    Synced,
    PendingPush,
    PendingPull,
    Conflict,
    Error,
}

impl SyncState {
    pub fn as_str(self) -> &'static str {
        match self {
            SyncState::Synced => "synced",
            SyncState::PendingPush => "pending_push",
            SyncState::PendingPull => "pending_pull",
            SyncState::Conflict => "conflict",
            SyncState::Error => "error",
        }
    }

    pub fn parse(s: &str) -> Self {
        match s {
            "pending_push" => SyncState::PendingPush,
            "pending_pull" => SyncState::PendingPull,
            "conflict" => SyncState::Conflict,
            "error" => SyncState::Error,
            _ => SyncState::Synced,
        }
    }
}

/// What the adapter observes now.
#[derive(Debug, Clone)]
pub struct LocalState {
    pub parent_id: Option<String>,
    pub name: String,
    pub extension: Option<String>,
    pub size: i64,
    pub modified_at: i64,
    pub dirty: bool,
}

/// What the remote last confirmed.
#[derive(Debug, Clone)]
pub struct CloudState {
    pub id: Option<String>,
    pub parent_id: Option<String>,
    pub etag: Option<String>,
    pub revision: Option<String>,
    pub modified_at: i64,
}

#[derive(Debug, Clone)]
pub struct Object {
    pub id: String,
    pub kind: ObjectKind,
    pub local: LocalState,
    pub cloud: CloudState,
    pub origin: Origin,
    pub sync_state: SyncState,
    pub missing_from_cloud: bool,
    pub deleted: bool,
    pub last_synced: i64,
}

impl Object {
    pub fn is_file(&self) -> bool {
        self.kind == ObjectKind::File
    }

    pub fn is_folder(&self) -> bool {
        self.kind == ObjectKind::Folder
    }

    /// Presentation name: `name` plus the optional `.ext`.
    pub fn display_name(&self) -> String {
        match &self.local.extension {
            Some(ext) => format!("{}.{}", self.local.name, ext),
            None => self.local.name.clone(),
        }
    }

    pub fn new_file_id() -> String {
        format!("file-{}", util::rand_hex(16))
    }

    pub fn new_folder_id() -> String {
        format!("folder-{}", util::rand_hex(8))
    }
}

/// Split a display name into (base, extension). A leading dot alone does
/// not start an extension, so dotfiles keep their full name.
pub fn split_display_name(name: &str) -> (String, Option<String>) {
    match name.rfind('.') {
        Some(idx) if idx > 0 && idx + 1 < name.len() => (
            name[..idx].to_string(),
            Some(name[idx + 1..].to_string()),
        ),
        _ => (name.to_string(), None),
    }
}

/// Last-known-synced state of an object: the anchor for change detection.
#[derive(Debug, Clone)]
pub struct Shadow {
    pub object_id: String,
    pub cloud_id: Option<String>,
    pub parent_id: Option<String>,
    pub name: Option<String>,
    pub etag: Option<String>,
    pub file_hash: Option<String>,
    pub modified_at: i64,
}

/// Partial shadow update; `None` fields keep their stored value.
#[derive(Debug, Clone, Default)]
pub struct ShadowPatch {
    pub cloud_id: Option<String>,
    pub parent_id: Option<String>,
    pub name: Option<String>,
    pub etag: Option<String>,
    pub file_hash: Option<String>,
    pub modified_at: Option<i64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Presence {
    Missing,
    Partial,
    Full,
}

impl Presence {
    pub fn as_str(self) -> &'static str {
        match self {
            Presence::Missing => "missing",
            Presence::Partial => "partial",
            Presence::Full => "full",
        }
    }

    pub fn parse(s: &str) -> Self {
        match s {
            "full" => Presence::Full,
            "partial" => Presence::Partial,
            _ => Presence::Missing,
        }
    }
}

/// Per-file materialization state.
#[derive(Debug, Clone)]
pub struct CacheRecord {
    pub object_id: String,
    pub local_path: Option<String>,
    pub size: i64,
    pub present: Presence,
    pub pinned: bool,
    pub last_accessed: i64,
    pub open_count: i64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_name_split_round_trips() {
        assert_eq!(split_display_name("a.txt"), ("a".into(), Some("txt".into())));
        assert_eq!(split_display_name("archive.tar.gz"), ("archive.tar".into(), Some("gz".into())));
        assert_eq!(split_display_name("README"), ("README".into(), None));
        assert_eq!(split_display_name(".hidden"), (".hidden".into(), None));
        assert_eq!(split_display_name("trailing."), ("trailing.".into(), None));
    }

    #[test]
    fn state_strings_round_trip() {
        for state in [
            SyncState::Synced,
            SyncState::PendingPush,
            SyncState::PendingPull,
            SyncState::Conflict,
            SyncState::Error,
        ] {
            assert_eq!(SyncState::parse(state.as_str()), state);
        }
        for p in [Presence::Missing, Presence::Partial, Presence::Full] {
            assert_eq!(Presence::parse(p.as_str()), p);
        }
    }
}
