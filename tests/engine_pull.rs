//! Pull-direction scenarios: reconciliation, conflicts, materialization.

mod common;

use common::Harness;
use orchard_fuse::{
    object::{ObjectKind, Presence, SyncState, DRIVE_ROOT_ID},
    remote::DRIVE_ROOT_CLOUD_ID,
    store::{ActionKind, Intent},
    util::sha256_bytes,
};

#[test]
fn listing_materializes_the_remote_tree_lazily() {
    let mut h = Harness::new();
    h.remote.add_file(DRIVE_ROOT_CLOUD_ID, "a.txt", b"body");
    let (folder_cloud, _) = h.remote.add_folder(DRIVE_ROOT_CLOUD_ID, "Documents");
    h.remote.add_file(&folder_cloud, "inner.txt", b"inner");

    h.list_drive();

    let children = h.store.children(DRIVE_ROOT_ID).unwrap();
    assert_eq!(children.len(), 2);
    let file = children.iter().find(|c| c.kind == ObjectKind::File).unwrap();
    assert_eq!(file.display_name(), "a.txt");
    assert_eq!(file.sync_state, SyncState::Synced);
    assert!(h.store.shadow(&file.id).unwrap().is_some());
    assert_eq!(
        h.store.cache_record(&file.id).unwrap().unwrap().present,
        Presence::Missing
    );

    // folders discovered by a listing are not recursed into eagerly; their
    // own first readdir pulls them
    let folder = children.iter().find(|c| c.kind == ObjectKind::Folder).unwrap();
    assert_eq!(folder.last_synced, 0);
    assert!(h.store.children(&folder.id).unwrap().is_empty());

    let drive = h.store.object(DRIVE_ROOT_ID).unwrap().unwrap();
    assert!(drive.last_synced > 0);
}

#[test]
fn dirty_local_row_with_remote_change_is_a_conflict() {
    let mut h = Harness::new();
    let (cloud_id, _) = h.remote.add_file(DRIVE_ROOT_CLOUD_ID, "a.txt", b"v1");
    h.list_drive();
    let drive = h.drive_ino();
    let (ino, obj) = h.vfs.lookup(drive, "a.txt").unwrap();

    // local edit, still open (no release yet)
    h.vfs.write(ino, 0, b"local edit").unwrap();
    // the same file moves remotely
    h.remote.mutate_file(&cloud_id, b"remote edit");

    let downloads_before = h.remote.state().download_calls;
    h.list_drive();

    let obj = h.store.object(&obj.id).unwrap().unwrap();
    assert_eq!(obj.sync_state, SyncState::Conflict);
    // both sides stay intact: no download, no upload, shadow untouched
    assert_eq!(h.remote.state().download_calls, downloads_before);
    assert_eq!(h.remote.state().upload_calls, 0);
    assert_eq!(
        h.store.shadow(&obj.id).unwrap().unwrap().etag.as_deref(),
        Some("e1")
    );
    assert_eq!(h.cache.read(&obj.id, 0, 64).unwrap(), b"local edit");
}

#[test]
fn clean_remote_change_invalidates_the_cached_body() {
    let mut h = Harness::new();
    let (cloud_id, _) = h.remote.add_file(DRIVE_ROOT_CLOUD_ID, "a.txt", b"v1");
    h.list_drive();
    let drive = h.drive_ino();
    let (ino, obj) = h.vfs.lookup(drive, "a.txt").unwrap();

    // materialize, then converge
    h.vfs.open(ino).unwrap();
    h.store.enqueue(Intent::download(&obj.id)).unwrap();
    h.drain();
    h.vfs.release(ino).unwrap();
    assert_eq!(
        h.store.cache_record(&obj.id).unwrap().unwrap().present,
        Presence::Full
    );

    let new_etag = h.remote.mutate_file(&cloud_id, b"v2 body");
    h.list_drive();

    let obj = h.store.object(&obj.id).unwrap().unwrap();
    assert_eq!(obj.cloud.etag.as_deref(), Some(new_etag.as_str()));
    assert_eq!(
        h.store.cache_record(&obj.id).unwrap().unwrap().present,
        Presence::Missing
    );
}

#[test]
fn remote_deletion_tombstones_clean_rows_and_flags_dirty_ones() {
    let mut h = Harness::new();
    let (gone_id, _) = h.remote.add_file(DRIVE_ROOT_CLOUD_ID, "clean.txt", b"1");
    let (edited_id, _) = h.remote.add_file(DRIVE_ROOT_CLOUD_ID, "edited.txt", b"2");
    h.list_drive();
    let drive = h.drive_ino();
    let (clean_ino, clean) = h.vfs.lookup(drive, "clean.txt").unwrap();
    let (edited_ino, edited) = h.vfs.lookup(drive, "edited.txt").unwrap();
    let _ = clean_ino;
    h.vfs.write(edited_ino, 0, b"local work").unwrap();

    h.remote.remove(&gone_id);
    h.remote.remove(&edited_id);
    h.list_drive();

    let clean = h.store.object(&clean.id).unwrap().unwrap();
    assert!(clean.deleted);
    let edited = h.store.object(&edited.id).unwrap().unwrap();
    assert!(!edited.deleted);
    assert_eq!(edited.sync_state, SyncState::Conflict);
}

#[test]
fn ensure_latest_downloads_once_then_trusts_the_fresh_listing() {
    let mut h = Harness::new();
    h.remote.add_file(DRIVE_ROOT_CLOUD_ID, "a.txt", b"payload");
    h.list_drive();
    let drive = h.drive_ino();
    let (_, obj) = h.vfs.lookup(drive, "a.txt").unwrap();

    h.store.enqueue(Intent::ensure_latest(&obj.id)).unwrap();
    h.drain();
    assert_eq!(h.remote.state().download_calls, 1);
    let record = h.store.cache_record(&obj.id).unwrap().unwrap();
    assert_eq!(record.present, Presence::Full);
    assert_eq!(
        h.store
            .shadow(&obj.id)
            .unwrap()
            .unwrap()
            .file_hash
            .as_deref(),
        Some(sha256_bytes(b"payload").as_str())
    );

    // content is present and the parent listing is fresh: no second fetch
    h.store.enqueue(Intent::ensure_latest(&obj.id)).unwrap();
    h.drain();
    assert_eq!(h.remote.state().download_calls, 1);
    assert_eq!(
        h.store.object(&obj.id).unwrap().unwrap().sync_state,
        SyncState::Synced
    );
}

#[test]
fn download_goes_through_a_part_file_and_lands_atomically() {
    let mut h = Harness::new();
    h.remote.add_file(DRIVE_ROOT_CLOUD_ID, "a.txt", b"the body");
    h.list_drive();
    let drive = h.drive_ino();
    let (_, obj) = h.vfs.lookup(drive, "a.txt").unwrap();

    h.store.enqueue(Intent::download(&obj.id)).unwrap();
    h.drain();

    assert!(!h.cache.part_path_for(&obj.id).exists());
    assert_eq!(h.cache.read(&obj.id, 0, 64).unwrap(), b"the body");
    let obj = h.store.object(&obj.id).unwrap().unwrap();
    assert_eq!(obj.sync_state, SyncState::Synced);
    assert_eq!(obj.local.size, 8);
}

#[test]
fn chunk_downloads_flip_to_full_and_drop_chunk_rows() {
    let mut h = Harness::new();
    // 80 B at chunk size 16: five chunks, above the 64 B partial threshold
    let body: Vec<u8> = (0..80u8).collect();
    h.remote.add_file(DRIVE_ROOT_CLOUD_ID, "big.bin", &body);
    h.list_drive();
    let drive = h.drive_ino();
    let (ino, obj) = h.vfs.lookup(drive, "big.bin").unwrap();
    h.vfs.open(ino).unwrap();

    for index in 0..5 {
        h.store
            .enqueue(Intent::download_chunk(&obj.id, index))
            .unwrap();
    }
    h.drain();

    let record = h.store.cache_record(&obj.id).unwrap().unwrap();
    assert_eq!(record.present, Presence::Full);
    assert_eq!(h.store.present_chunks(&obj.id).unwrap().len(), 0);
    assert_eq!(h.cache.read(&obj.id, 0, 80).unwrap(), body);
}

#[test]
fn locally_created_folder_is_adopted_by_the_listing_not_duplicated() {
    let mut h = Harness::new();
    // a folder row that was pushed but whose bookkeeping never landed
    let folder = h
        .store
        .insert_local_folder(DRIVE_ROOT_ID, "Documents", 1)
        .unwrap();
    h.remote.add_folder(DRIVE_ROOT_CLOUD_ID, "Documents");

    h.list_drive();

    let children = h.store.children(DRIVE_ROOT_ID).unwrap();
    assert_eq!(children.len(), 1);
    let adopted = h.store.object(&folder.id).unwrap().unwrap();
    assert!(adopted.cloud.id.is_some());
    assert_eq!(adopted.sync_state, SyncState::Synced);
    assert!(h.store.shadow(&folder.id).unwrap().is_some());
}

#[test]
fn conflict_resolution_keep_cloud_repulls_the_remote_body() {
    let mut h = Harness::new();
    let (cloud_id, _) = h.remote.add_file(DRIVE_ROOT_CLOUD_ID, "a.txt", b"v1");
    h.list_drive();
    let drive = h.drive_ino();
    let (ino, obj) = h.vfs.lookup(drive, "a.txt").unwrap();
    h.vfs.write(ino, 0, b"local").unwrap();
    h.remote.mutate_file(&cloud_id, b"remote");
    h.list_drive();
    assert_eq!(
        h.store.object(&obj.id).unwrap().unwrap().sync_state,
        SyncState::Conflict
    );

    h.store.resolve_conflict_keep_cloud(&obj.id).unwrap();
    h.drain();

    let obj = h.store.object(&obj.id).unwrap().unwrap();
    assert_eq!(obj.sync_state, SyncState::Synced);
    assert_eq!(h.cache.read(&obj.id, 0, 64).unwrap(), b"remote");
}

#[test]
fn conflict_resolution_keep_local_pushes_the_local_body() {
    let mut h = Harness::new();
    let (cloud_id, _) = h.remote.add_file(DRIVE_ROOT_CLOUD_ID, "a.txt", b"v1");
    h.list_drive();
    let drive = h.drive_ino();
    let (ino, obj) = h.vfs.lookup(drive, "a.txt").unwrap();
    h.vfs.write(ino, 0, b"local").unwrap();
    h.remote.mutate_file(&cloud_id, b"remote");
    h.list_drive();

    h.store.resolve_conflict_keep_local(&obj.id).unwrap();
    let actions = h.store.actions_for_target(&obj.id).unwrap();
    assert_eq!(actions.len(), 1);
    assert_eq!(actions[0].kind, ActionKind::UpdateContent);
    h.drain();

    let (_, item) = h.remote.find_by_name(DRIVE_ROOT_CLOUD_ID, "a.txt").unwrap();
    assert_eq!(item.data, b"local");
    assert_eq!(
        h.store.object(&obj.id).unwrap().unwrap().sync_state,
        SyncState::Synced
    );
}
