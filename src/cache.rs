//! Content-addressed local blob storage.
//!
//! One file per object, named by the object id; the path is stable for the
//! object's lifetime. Small files are cached whole; files at or above the
//! partial threshold are backed by a sparse file whose materialized ranges
//! are tracked as a chunk set in the store.

use crate::config::CacheConfig;
use crate::error::{Error, Result};
use crate::object::Presence;
use crate::store::Store;
use crate::util;
use std::{
    fs::{self, File, OpenOptions},
    io::{self, Read as _, Seek as _, SeekFrom, Write as _},
    path::{Path, PathBuf},
};

#[derive(Debug, Clone)]
pub struct ContentCache {
    dir: PathBuf,
    chunk_size: u64,
    partial_threshold: u64,
}

impl ContentCache {
    pub fn new(dir: &Path, config: &CacheConfig) -> io::Result<Self> {
        fs::create_dir_all(dir)?;
        Ok(Self {
            dir: dir.to_owned(),
            chunk_size: config.chunk_size.max(1),
            partial_threshold: config.partial_threshold,
        })
    }

    pub fn path_for(&self, id: &str) -> PathBuf {
        self.dir.join(id)
    }

    /// Staging path for whole-file downloads, renamed over the real path
    /// once complete.
    pub fn part_path_for(&self, id: &str) -> PathBuf {
        self.dir.join(format!("{}.part", id))
    }

    // ---- chunk geometry ----

    pub fn chunk_size(&self) -> u64 {
        self.chunk_size
    }

    /// Whole-file caching below the threshold, chunked at or above it.
    pub fn uses_chunks(&self, file_size: i64) -> bool {
        file_size as u64 >= self.partial_threshold
    }

    pub fn chunk_count(&self, file_size: i64) -> u64 {
        let size = file_size.max(0) as u64;
        (size + self.chunk_size - 1) / self.chunk_size
    }

    /// Chunk indices intersecting `[offset, offset + len)`, clamped to the
    /// file's end.
    pub fn chunks_for_range(&self, offset: u64, len: u64, file_size: u64) -> Vec<u64> {
        if len == 0 || offset >= file_size {
            return Vec::new();
        }
        let end = file_size.min(offset + len);
        let first = offset / self.chunk_size;
        let last = (end - 1) / self.chunk_size;
        (first..=last).collect()
    }

    /// Byte span of one chunk, with the tail chunk cut to the file size.
    pub fn chunk_span(&self, index: u64, file_size: u64) -> (u64, u64) {
        let offset = index * self.chunk_size;
        let len = self.chunk_size.min(file_size.saturating_sub(offset));
        (offset, len)
    }

    // ---- materialization ----

    /// Empty file for a freshly created object: present in full at size 0.
    pub fn create_placeholder(&self, store: &Store, id: &str) -> Result<()> {
        let path = self.path_for(id);
        File::create(&path)?;
        store.ensure_cache_record(id, &path.to_string_lossy())?;
        store.set_present(id, Presence::Full, 0)?;
        Ok(())
    }

    /// Sparse file of the declared cloud size; nothing materialized yet.
    pub fn create_sparse_placeholder(&self, store: &Store, id: &str, cloud_size: i64) -> Result<()> {
        let path = self.path_for(id);
        let file = File::create(&path)?;
        file.set_len(cloud_size.max(0) as u64)?;
        store.ensure_cache_record(id, &path.to_string_lossy())?;
        store.set_present(id, Presence::Partial, 0)?;
        Ok(())
    }

    /// Callers have already ensured the required ranges are present.
    pub fn read(&self, id: &str, offset: u64, len: usize) -> io::Result<Vec<u8>> {
        let mut file = File::open(self.path_for(id))?;
        let file_len = file.metadata()?.len();
        if offset >= file_len || len == 0 {
            return Ok(Vec::new());
        }
        let want = len.min((file_len - offset) as usize);
        let mut buf = vec![0u8; want];
        file.seek(SeekFrom::Start(offset))?;
        file.read_exact(&mut buf)?;
        Ok(buf)
    }

    /// User write: lands in the cache file and dirties the object.
    pub fn write(&self, store: &Store, id: &str, offset: u64, data: &[u8]) -> Result<usize> {
        let path = self.path_for(id);
        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .open(&path)?;
        file.seek(SeekFrom::Start(offset))?;
        file.write_all(data)?;
        let new_size = file.metadata()?.len() as i64;
        store.ensure_cache_record(id, &path.to_string_lossy())?;
        store.set_cache_size(id, new_size)?;
        store.mark_local_write(id, new_size, util::unix_now())?;
        Ok(data.len())
    }

    /// Engine write for a downloaded chunk: positions bytes without
    /// touching the dirty flag.
    pub fn write_at_raw(&self, id: &str, offset: u64, data: &[u8]) -> io::Result<()> {
        let mut file = OpenOptions::new()
            .write(true)
            .open(self.path_for(id))?;
        file.seek(SeekFrom::Start(offset))?;
        file.write_all(data)?;
        Ok(())
    }

    pub fn truncate(&self, store: &Store, id: &str, len: u64) -> Result<()> {
        let path = self.path_for(id);
        if !path.exists() {
            File::create(&path)?;
            store.ensure_cache_record(id, &path.to_string_lossy())?;
            store.set_present(id, Presence::Full, 0)?;
        }
        let file = OpenOptions::new().write(true).open(&path)?;
        file.set_len(len)?;
        store.set_cache_size(id, len as i64)?;
        store.mark_local_write(id, len as i64, util::unix_now())?;
        Ok(())
    }

    /// Drop cached content. Refused while the object is dirty or open.
    pub fn evict(&self, store: &Store, id: &str) -> Result<()> {
        let obj = store.object(id)?.ok_or(Error::NotFound)?;
        if obj.local.dirty {
            return Err(Error::CacheBusy("object has unsynced changes"));
        }
        if let Some(record) = store.cache_record(id)? {
            if record.open_count > 0 {
                return Err(Error::CacheBusy("object is open"));
            }
        }
        let path = self.path_for(id);
        if path.exists() {
            let file = OpenOptions::new().write(true).open(&path)?;
            file.set_len(0)?;
        }
        store.set_present(id, Presence::Missing, 0)?;
        Ok(())
    }

    /// Remote content moved under us: the cached body is stale.
    pub fn invalidate(&self, store: &Store, id: &str) -> Result<()> {
        let path = self.path_for(id);
        if path.exists() {
            let file = OpenOptions::new().write(true).open(&path)?;
            file.set_len(0)?;
        }
        store.set_present(id, Presence::Missing, 0)?;
        Ok(())
    }

    /// Remove the on-disk file entirely (hard delete).
    pub fn remove(&self, id: &str) -> io::Result<()> {
        for path in [self.path_for(id), self.part_path_for(id)] {
            match fs::remove_file(&path) {
                Ok(()) => {}
                Err(err) if err.kind() == io::ErrorKind::NotFound => {}
                Err(err) => return Err(err),
            }
        }
        Ok(())
    }

    pub fn file_size(&self, id: &str) -> io::Result<u64> {
        Ok(fs::metadata(self.path_for(id))?.len())
    }

    pub fn hash(&self, id: &str) -> io::Result<String> {
        util::sha256_file(&self.path_for(id))
    }
}
