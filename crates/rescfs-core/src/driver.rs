//! Storage drivers behind leaf resources.
//!
//! A leaf hands every physical operation to a [`StorageDriver`]. The in-memory
//! [`MemoryDriver`] stores files in a [`MemoryVolume`] that several leaves can
//! share, which lets stage and sync move bytes between a cache vault and an
//! archive vault without touching disk.

use std::collections::{BTreeSet, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{debug, trace};

use crate::error::{ResourceError, ResourceResult};
use crate::hierarchy::HierarchyPath;
use crate::operation::{AccessMode, FileStat, Whence};

/// Arguments for copying an archive replica into the cache.
#[derive(Debug, Clone, PartialEq)]
pub struct StageRequest {
    /// Destination path in the cache vault.
    pub cache_path: String,
    /// Hierarchy of the cache replica.
    pub hierarchy: HierarchyPath,
    /// Source path in the archive.
    pub source_path: String,
    /// Logical path of the object.
    pub object_path: String,
    /// Bytes to copy.
    pub size: u64,
    /// Permission bits for the cache copy.
    pub mode: u32,
}

/// Arguments for copying a cache replica into the archive.
#[derive(Debug, Clone, PartialEq)]
pub struct SyncRequest {
    /// Destination path in the archive.
    pub dest_path: String,
    /// Hierarchy of the archive replica.
    pub hierarchy: HierarchyPath,
    /// Logical path of the object.
    pub object_path: String,
    /// Source path in the cache vault.
    pub cache_path: String,
    /// Bytes to copy.
    pub size: u64,
    /// Permission bits for the archive copy.
    pub mode: u32,
}

/// Physical operations a leaf resource performs.
pub trait StorageDriver: Send + Sync {
    /// Creates (or truncates) `path` and opens it read-write.
    fn create(&self, path: &str, mode: u32) -> ResourceResult<u64>;
    /// Opens an existing file.
    fn open(&self, path: &str, access: AccessMode) -> ResourceResult<u64>;
    /// Reads up to `len` bytes from the current offset.
    fn read(&self, fd: u64, len: usize) -> ResourceResult<Vec<u8>>;
    /// Writes `data` at the current offset.
    fn write(&self, fd: u64, data: &[u8]) -> ResourceResult<usize>;
    /// Closes a descriptor.
    fn close(&self, fd: u64) -> ResourceResult<()>;
    /// Removes a file.
    fn unlink(&self, path: &str) -> ResourceResult<()>;
    /// Stats a file or directory.
    fn stat(&self, path: &str) -> ResourceResult<FileStat>;
    /// Repositions a descriptor.
    fn lseek(&self, fd: u64, offset: i64, whence: Whence) -> ResourceResult<u64>;
    /// Creates a directory.
    fn mkdir(&self, path: &str, mode: u32) -> ResourceResult<()>;
    /// Removes an empty directory.
    fn rmdir(&self, path: &str) -> ResourceResult<()>;
    /// Opens a directory for listing.
    fn opendir(&self, path: &str) -> ResourceResult<u64>;
    /// Returns the next entry name, or `None` at the end.
    fn readdir(&self, handle: u64) -> ResourceResult<Option<String>>;
    /// Closes a directory handle.
    fn closedir(&self, handle: u64) -> ResourceResult<()>;
    /// Moves a file.
    fn rename(&self, from: &str, to: &str) -> ResourceResult<()>;
    /// Sets a file's length.
    fn truncate(&self, path: &str, len: u64) -> ResourceResult<()>;
    /// Free bytes.
    fn freespace(&self) -> ResourceResult<u64>;
    /// Copies archive bytes into the cache.
    fn stage_to_cache(&self, request: &StageRequest) -> ResourceResult<()>;
    /// Copies cache bytes into the archive; returns the path actually written
    /// when the driver chose a different one.
    fn sync_to_arch(&self, request: &SyncRequest) -> ResourceResult<Option<String>>;
}

/// Operation counters for a [`MemoryVolume`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct VolumeStats {
    /// Files created.
    pub creates: u64,
    /// Files opened.
    pub opens: u64,
    /// Descriptors closed.
    pub closes: u64,
    /// Stage copies performed.
    pub stages: u64,
    /// Sync copies performed.
    pub syncs: u64,
    /// Files removed.
    pub unlinks: u64,
}

#[derive(Debug, Clone)]
struct MemoryFile {
    data: Vec<u8>,
    mode: u32,
}

#[derive(Debug, Clone)]
struct OpenHandle {
    path: String,
    pos: u64,
    access: AccessMode,
}

/// Shared in-memory file table.
pub struct MemoryVolume {
    files: DashMap<String, MemoryFile>,
    dirs: DashMap<String, u32>,
    handles: DashMap<u64, OpenHandle>,
    listings: DashMap<u64, VecDeque<String>>,
    failing: DashMap<String, String>,
    next_handle: AtomicU64,
    capacity: u64,
    stats: Mutex<VolumeStats>,
}

impl MemoryVolume {
    /// Creates a volume with `capacity` bytes of space.
    pub fn new(capacity: u64) -> Self {
        Self {
            files: DashMap::new(),
            dirs: DashMap::new(),
            handles: DashMap::new(),
            listings: DashMap::new(),
            failing: DashMap::new(),
            next_handle: AtomicU64::new(3),
            capacity,
            stats: Mutex::new(VolumeStats::default()),
        }
    }

    /// Stores `data` at `path` directly.
    pub fn put(&self, path: &str, data: &[u8]) {
        self.files.insert(
            path.to_string(),
            MemoryFile {
                data: data.to_vec(),
                mode: 0o600,
            },
        );
    }

    /// Contents of `path`.
    pub fn get(&self, path: &str) -> Option<Vec<u8>> {
        self.files.get(path).map(|f| f.data.clone())
    }

    /// Whether `path` holds a file.
    pub fn exists(&self, path: &str) -> bool {
        self.files.contains_key(path)
    }

    /// Makes opens and creates of `path` fail with `msg`.
    pub fn fail_path(&self, path: &str, msg: &str) {
        self.failing.insert(path.to_string(), msg.to_string());
    }

    /// Number of descriptors currently open.
    pub fn open_handles(&self) -> usize {
        self.handles.len()
    }

    /// Operation counters.
    pub fn stats(&self) -> VolumeStats {
        self.stats.lock().clone()
    }

    fn used(&self) -> u64 {
        self.files.iter().map(|f| f.data.len() as u64).sum()
    }

    fn check_failing(&self, path: &str) -> ResourceResult<()> {
        match self.failing.get(path) {
            Some(msg) => Err(driver_error(path, msg.value())),
            None => Ok(()),
        }
    }

    fn allocate(&self, handle: OpenHandle) -> u64 {
        let fd = self.next_handle.fetch_add(1, Ordering::Relaxed);
        self.handles.insert(fd, handle);
        fd
    }

    fn copy(&self, from: &str, to: &str, mode: u32) -> ResourceResult<u64> {
        self.check_failing(to)?;
        let data = self
            .files
            .get(from)
            .map(|f| f.data.clone())
            .ok_or_else(|| driver_error(from, "no such file"))?;
        let len = data.len() as u64;
        self.files.insert(to.to_string(), MemoryFile { data, mode });
        Ok(len)
    }
}

impl Default for MemoryVolume {
    fn default() -> Self {
        Self::new(u64::MAX)
    }
}

fn driver_error(path: &str, msg: &str) -> ResourceError {
    ResourceError::Driver {
        path: path.to_string(),
        msg: msg.to_string(),
    }
}

/// [`StorageDriver`] over a shared [`MemoryVolume`].
#[derive(Clone)]
pub struct MemoryDriver {
    volume: Arc<MemoryVolume>,
    renames_on_sync: bool,
    sync_counter: Arc<AtomicU64>,
}

impl MemoryDriver {
    /// A driver writing into `volume`.
    pub fn new(volume: Arc<MemoryVolume>) -> Self {
        Self {
            volume,
            renames_on_sync: false,
            sync_counter: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Makes sync write to a driver-chosen path instead of the requested one.
    pub fn with_server_paths(mut self) -> Self {
        self.renames_on_sync = true;
        self
    }

    /// The backing volume.
    pub fn volume(&self) -> &Arc<MemoryVolume> {
        &self.volume
    }
}

impl StorageDriver for MemoryDriver {
    fn create(&self, path: &str, mode: u32) -> ResourceResult<u64> {
        self.volume.check_failing(path)?;
        self.volume.files.insert(
            path.to_string(),
            MemoryFile {
                data: Vec::new(),
                mode,
            },
        );
        self.volume.stats.lock().creates += 1;
        let fd = self.volume.allocate(OpenHandle {
            path: path.to_string(),
            pos: 0,
            access: AccessMode::ReadWrite,
        });
        trace!(path, fd, "Memory create");
        Ok(fd)
    }

    fn open(&self, path: &str, access: AccessMode) -> ResourceResult<u64> {
        self.volume.check_failing(path)?;
        if !self.volume.files.contains_key(path) {
            return Err(driver_error(path, "no such file"));
        }
        self.volume.stats.lock().opens += 1;
        let fd = self.volume.allocate(OpenHandle {
            path: path.to_string(),
            pos: 0,
            access,
        });
        trace!(path, fd, ?access, "Memory open");
        Ok(fd)
    }

    fn read(&self, fd: u64, len: usize) -> ResourceResult<Vec<u8>> {
        let mut handle = self
            .volume
            .handles
            .get_mut(&fd)
            .ok_or_else(|| driver_error(&fd.to_string(), "bad descriptor"))?;
        if !handle.access.readable() {
            return Err(driver_error(&handle.path, "descriptor not readable"));
        }
        let file = self
            .volume
            .files
            .get(&handle.path)
            .ok_or_else(|| driver_error(&handle.path, "no such file"))?;
        let start = (handle.pos as usize).min(file.data.len());
        let end = start.saturating_add(len).min(file.data.len());
        let out = file.data[start..end].to_vec();
        drop(file);
        handle.pos = end as u64;
        Ok(out)
    }

    fn write(&self, fd: u64, data: &[u8]) -> ResourceResult<usize> {
        let mut handle = self
            .volume
            .handles
            .get_mut(&fd)
            .ok_or_else(|| driver_error(&fd.to_string(), "bad descriptor"))?;
        if !handle.access.writable() {
            return Err(driver_error(&handle.path, "descriptor not writable"));
        }
        let mut file = self
            .volume
            .files
            .get_mut(&handle.path)
            .ok_or_else(|| driver_error(&handle.path, "no such file"))?;
        let start = handle.pos as usize;
        let end = start + data.len();
        if file.data.len() < end {
            file.data.resize(end, 0);
        }
        file.data[start..end].copy_from_slice(data);
        drop(file);
        handle.pos = end as u64;
        Ok(data.len())
    }

    fn close(&self, fd: u64) -> ResourceResult<()> {
        self.volume
            .handles
            .remove(&fd)
            .ok_or_else(|| driver_error(&fd.to_string(), "bad descriptor"))?;
        self.volume.stats.lock().closes += 1;
        Ok(())
    }

    fn unlink(&self, path: &str) -> ResourceResult<()> {
        self.volume
            .files
            .remove(path)
            .ok_or_else(|| driver_error(path, "no such file"))?;
        self.volume.stats.lock().unlinks += 1;
        Ok(())
    }

    fn stat(&self, path: &str) -> ResourceResult<FileStat> {
        if let Some(file) = self.volume.files.get(path) {
            return Ok(FileStat {
                size: file.data.len() as u64,
                mode: file.mode,
                is_dir: false,
            });
        }
        match self.volume.dirs.get(path) {
            Some(mode) => Ok(FileStat {
                size: 0,
                mode: *mode,
                is_dir: true,
            }),
            None => Err(driver_error(path, "no such file or directory")),
        }
    }

    fn lseek(&self, fd: u64, offset: i64, whence: Whence) -> ResourceResult<u64> {
        let mut handle = self
            .volume
            .handles
            .get_mut(&fd)
            .ok_or_else(|| driver_error(&fd.to_string(), "bad descriptor"))?;
        let size = self
            .volume
            .files
            .get(&handle.path)
            .map(|f| f.data.len() as i64)
            .unwrap_or(0);
        let base = match whence {
            Whence::Start => 0,
            Whence::Current => handle.pos as i64,
            Whence::End => size,
        };
        let target = base + offset;
        if target < 0 {
            return Err(driver_error(&handle.path, "seek before start of file"));
        }
        handle.pos = target as u64;
        Ok(handle.pos)
    }

    fn mkdir(&self, path: &str, mode: u32) -> ResourceResult<()> {
        if self.volume.dirs.contains_key(path) || self.volume.files.contains_key(path) {
            return Err(driver_error(path, "already exists"));
        }
        self.volume.dirs.insert(path.to_string(), mode);
        Ok(())
    }

    fn rmdir(&self, path: &str) -> ResourceResult<()> {
        let prefix = format!("{}/", path.trim_end_matches('/'));
        if self.volume.files.iter().any(|f| f.key().starts_with(&prefix)) {
            return Err(driver_error(path, "directory not empty"));
        }
        self.volume
            .dirs
            .remove(path)
            .map(|_| ())
            .ok_or_else(|| driver_error(path, "no such directory"))
    }

    fn opendir(&self, path: &str) -> ResourceResult<u64> {
        let prefix = format!("{}/", path.trim_end_matches('/'));
        let mut entries = BTreeSet::new();
        for key in self
            .volume
            .files
            .iter()
            .map(|f| f.key().clone())
            .chain(self.volume.dirs.iter().map(|d| d.key().clone()))
        {
            if let Some(rest) = key.strip_prefix(&prefix) {
                if let Some(name) = rest.split('/').next().filter(|n| !n.is_empty()) {
                    entries.insert(name.to_string());
                }
            }
        }
        if entries.is_empty() && !self.volume.dirs.contains_key(path) {
            return Err(driver_error(path, "no such directory"));
        }
        let handle = self.volume.next_handle.fetch_add(1, Ordering::Relaxed);
        self.volume
            .listings
            .insert(handle, entries.into_iter().collect());
        Ok(handle)
    }

    fn readdir(&self, handle: u64) -> ResourceResult<Option<String>> {
        let mut listing = self
            .volume
            .listings
            .get_mut(&handle)
            .ok_or_else(|| driver_error(&handle.to_string(), "bad directory handle"))?;
        Ok(listing.pop_front())
    }

    fn closedir(&self, handle: u64) -> ResourceResult<()> {
        self.volume
            .listings
            .remove(&handle)
            .map(|_| ())
            .ok_or_else(|| driver_error(&handle.to_string(), "bad directory handle"))
    }

    fn rename(&self, from: &str, to: &str) -> ResourceResult<()> {
        let (_, file) = self
            .volume
            .files
            .remove(from)
            .ok_or_else(|| driver_error(from, "no such file"))?;
        self.volume.files.insert(to.to_string(), file);
        Ok(())
    }

    fn truncate(&self, path: &str, len: u64) -> ResourceResult<()> {
        let mut file = self
            .volume
            .files
            .get_mut(path)
            .ok_or_else(|| driver_error(path, "no such file"))?;
        file.data.resize(len as usize, 0);
        Ok(())
    }

    fn freespace(&self) -> ResourceResult<u64> {
        Ok(self.volume.capacity.saturating_sub(self.volume.used()))
    }

    fn stage_to_cache(&self, request: &StageRequest) -> ResourceResult<()> {
        let copied = self
            .volume
            .copy(&request.source_path, &request.cache_path, request.mode)?;
        self.volume.stats.lock().stages += 1;
        debug!(
            object = %request.object_path,
            from = %request.source_path,
            to = %request.cache_path,
            bytes = copied,
            "Staged to cache"
        );
        Ok(())
    }

    fn sync_to_arch(&self, request: &SyncRequest) -> ResourceResult<Option<String>> {
        let target = if self.renames_on_sync {
            let n = self.sync_counter.fetch_add(1, Ordering::Relaxed);
            format!("{}.{}", request.dest_path, n)
        } else {
            request.dest_path.clone()
        };
        let copied = self
            .volume
            .copy(&request.cache_path, &target, request.mode)?;
        self.volume.stats.lock().syncs += 1;
        debug!(
            object = %request.object_path,
            from = %request.cache_path,
            to = %target,
            bytes = copied,
            "Synced to archive"
        );
        Ok(self.renames_on_sync.then_some(target))
    }
}
