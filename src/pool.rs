//! Low-level pool handle: the backing file, its memory mapping, and raw
//! byte-range access to the header, transaction log, and block regions.
//!
//! Everything above "give me the bytes for this block id" and "persist this
//! range" lives in [`crate::store`]; this module only knows about file
//! geometry and durability.

use std::fs::{File, OpenOptions};
use std::io;
use std::path::Path;

use memmap2::MmapMut;
use tracing::{debug, warn};

use crate::block::{data_block_size, meta_block_size, BlockId, Region};
use crate::config::{PoolOptions, SyncMode};
use crate::error::{Error, Result};
use crate::layout::Layout;
use crate::txlog::compute_tx_slot_size;

/// The open backing file plus its memory mapping and resolved geometry.
pub struct Pool {
    file: File,
    mmap: MmapMut,
    layout: Layout,
    sync_type: SyncMode,
    /// True the pool file did not exist before this open and was freshly
    /// initialized — callers use this to decide whether to run recovery or
    /// just seed the free-id allocators from scratch.
    freshly_created: bool,
}

impl Pool {
    /// Opens (creating if requested and absent) the backing file at
    /// `opts.path`, maps it, and validates or writes its header.
    pub fn open(opts: &PoolOptions) -> Result<Pool> {
        opts.validate()?;
        let tx_slot_size = compute_tx_slot_size(opts);
        let wanted = Layout::from_options(opts, tx_slot_size);

        let exists = opts.path.exists();
        if !exists && !opts.create {
            return Err(Error::Io(io::Error::new(
                io::ErrorKind::NotFound,
                format!("pool file {:?} does not exist", opts.path),
            )));
        }

        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(opts.create)
            .open(&opts.path)
            .map_err(|e| Error::CreateFailed(e.to_string()))?;

        lock_exclusive(&file)?;

        let freshly_created = !exists;
        let layout = if freshly_created {
            file.set_len(wanted.total_size)
                .map_err(|e| Error::SuperblockWriteFailed(e.to_string()))?;
            let mut mmap =
                unsafe { MmapMut::map_mut(&file) }.map_err(|e| Error::Io(e))?;
            wanted.encode(&mut mmap[..Layout::HEADER_SIZE_USIZE]);
            mmap.flush_range(0, Layout::HEADER_SIZE_USIZE)
                .map_err(|e| Error::SuperblockWriteFailed(e.to_string()))?;
            debug!(path = ?opts.path, size = wanted.total_size, "initialized new pool");
            return Ok(Pool {
                file,
                mmap,
                layout: wanted,
                sync_type: opts.sync_type,
                freshly_created,
            });
        } else {
            let mmap =
                unsafe { MmapMut::map_mut(&file) }.map_err(|e| Error::Io(e))?;
            let stored = Layout::decode(&mmap[..Layout::HEADER_SIZE_USIZE])?;
            wanted.verify_matches_stored(&stored)?;
            wanted
        };

        let min_size = layout.total_size;
        let actual_size = file
            .metadata()
            .map_err(|e| Error::Io(e))?
            .len();
        if actual_size < min_size {
            return Err(Error::SuperblockCorrupt);
        }

        let mmap = unsafe { MmapMut::map_mut(&file) }.map_err(|e| Error::Io(e))?;
        debug!(path = ?opts.path, size = layout.total_size, "opened existing pool");
        Ok(Pool {
            file,
            mmap,
            layout,
            sync_type: opts.sync_type,
            freshly_created,
        })
    }

    pub fn layout(&self) -> &Layout {
        &self.layout
    }

    pub fn sync_type(&self) -> SyncMode {
        self.sync_type
    }

    pub fn freshly_created(&self) -> bool {
        self.freshly_created
    }

    /// Byte size of one block in `region`.
    pub fn block_size(&self, region: Region) -> u64 {
        match region {
            Region::Data => data_block_size(self.layout.max_key_len, self.layout.max_val_len),
            Region::Meta => {
                meta_block_size(self.layout.meta_max_key_len, self.layout.meta_max_val_len)
            }
        }
    }

    /// Number of addressable blocks in `region`.
    pub fn block_count(&self, region: Region) -> u64 {
        match region {
            Region::Data => self.layout.data_nlba,
            Region::Meta => self.layout.meta_nlba,
        }
    }

    /// Resolves a [`BlockId`] to the region it belongs to, or `None` if it
    /// is out of range (including id `0`, which is never valid).
    pub fn classify(&self, id: BlockId) -> Option<Region> {
        if id == 0 {
            return None;
        }
        if id <= self.layout.data_nlba {
            Some(Region::Data)
        } else if id <= self.layout.data_nlba + self.layout.meta_nlba {
            Some(Region::Meta)
        } else {
            None
        }
    }

    /// Absolute byte offset of block `id` in `region`, for callers that need
    /// to pass an exact `[offset, offset+len)` range to [`Pool::persist`].
    pub(crate) fn byte_offset(&self, region: Region, id: BlockId) -> u64 {
        match region {
            Region::Data => self.layout.data_offset + (id - 1) * self.block_size(region),
            Region::Meta => {
                let meta_id = id - self.layout.data_nlba;
                self.layout.meta_offset + (meta_id - 1) * self.block_size(region)
            }
        }
    }

    /// Raw mutable bytes for block `id` in `region`. Panics if `id` is
    /// outside `region`'s range — callers must `classify` first.
    ///
    /// Takes `&self`, not `&mut self`: like every pmem/mmap store in this
    /// family, the pool hands out short-lived pointer-arithmetic views into
    /// one shared mapping rather than funneling every access through a
    /// single exclusive borrow. Callers are responsible for the aliasing
    /// discipline the concurrency model requires — two overlapping views of
    /// the same id must never be held concurrently.
    pub fn block_bytes(&self, region: Region, id: BlockId) -> &mut [u8] {
        let off = self.byte_offset(region, id) as usize;
        let size = self.block_size(region) as usize;
        unsafe {
            let ptr = self.mmap.as_ptr().add(off) as *mut u8;
            std::slice::from_raw_parts_mut(ptr, size)
        }
    }

    /// Absolute byte offset of transaction slot `id` (1-based).
    pub(crate) fn tx_slot_offset(&self, id: u64) -> u64 {
        self.layout.tx_log_offset + (id - 1) * self.layout.tx_slot_size as u64
    }

    /// Raw mutable bytes for transaction slot `id` (1-based). Same aliasing
    /// contract as [`Pool::block_bytes`]: exclusive to whichever caller
    /// currently owns that slot.
    pub fn tx_slot_bytes(&self, id: u64) -> &mut [u8] {
        let off = self.tx_slot_offset(id) as usize;
        let size = self.layout.tx_slot_size as usize;
        unsafe {
            let ptr = self.mmap.as_ptr().add(off) as *mut u8;
            std::slice::from_raw_parts_mut(ptr, size)
        }
    }

    /// Read-only view of transaction slot `id`, for recovery's sequential
    /// scan.
    pub fn tx_slot_bytes_ro(&self, id: u64) -> &[u8] {
        let off = self.layout.tx_log_offset as usize
            + ((id - 1) * self.layout.tx_slot_size as u64) as usize;
        let size = self.layout.tx_slot_size as usize;
        &self.mmap[off..off + size]
    }

    /// Persists `[offset, offset+len)` according to this pool's configured
    /// [`SyncMode`]. `NoSync` and `ThSync` are both no-ops here: the former
    /// never persists, the latter relies on the background flush thread
    /// instead of persisting inline.
    pub fn persist(&self, offset: usize, len: usize) -> Result<()> {
        match self.sync_type {
            SyncMode::Sync => self.mmap.flush().map_err(Error::Io),
            SyncMode::SelSync => self.mmap.flush_range(offset, len).map_err(Error::Io),
            SyncMode::Async => self.mmap.flush_async().map_err(Error::Io),
            SyncMode::ThSync | SyncMode::NoSync => Ok(()),
        }
    }

    /// Persists the whole mapping, regardless of `SyncMode`. Used by the
    /// background `ThSync` thread and on explicit `close`.
    pub fn persist_all(&self) -> Result<()> {
        self.mmap.flush().map_err(Error::Io)
    }

    /// Borrows the full mapping for recovery's sequential block scan.
    pub fn mmap_ro(&self) -> &[u8] {
        &self.mmap[..]
    }
}

impl Drop for Pool {
    fn drop(&mut self) {
        if let Err(e) = self.persist_all() {
            warn!(error = %e, "failed to flush pool mapping on drop");
        }
    }
}

#[cfg(unix)]
fn lock_exclusive(file: &File) -> Result<()> {
    use std::os::unix::io::AsRawFd;
    let rc = unsafe { libc::flock(file.as_raw_fd(), libc::LOCK_EX | libc::LOCK_NB) };
    if rc != 0 {
        return Err(Error::Io(io::Error::last_os_error()));
    }
    Ok(())
}

#[cfg(not(unix))]
fn lock_exclusive(_file: &File) -> Result<()> {
    Ok(())
}

impl Layout {
    pub(crate) const HEADER_SIZE_USIZE: usize = crate::layout::HEADER_SIZE as usize;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PoolOptions;
    use tempfile::tempdir;

    fn small_opts(dir: &Path) -> PoolOptions {
        PoolOptions::new(dir.join("pool.bin"))
            .data_size(256 * 1024)
            .meta_size(256 * 1024)
            .tx_slots(4)
            .max_key_len(32)
            .max_val_len(256)
            .meta_max_key_len(16)
            .meta_max_val_len(64)
    }

    #[test]
    fn create_then_reopen_agrees_on_geometry() {
        let dir = tempdir().unwrap();
        let opts = small_opts(dir.path());
        let pool = Pool::open(&opts).unwrap();
        assert!(pool.freshly_created());
        let data_nlba = pool.block_count(Region::Data);
        drop(pool);

        let reopened = Pool::open(&opts.clone().create(false)).unwrap();
        assert!(!reopened.freshly_created());
        assert_eq!(reopened.block_count(Region::Data), data_nlba);
    }

    #[test]
    fn mismatched_reopen_options_are_rejected() {
        let dir = tempdir().unwrap();
        let opts = small_opts(dir.path());
        drop(Pool::open(&opts).unwrap());

        let bad = opts.clone().create(false).max_key_len(64);
        assert!(Pool::open(&bad).is_err());
    }

    #[test]
    fn classify_resolves_data_and_meta_ranges() {
        let dir = tempdir().unwrap();
        let opts = small_opts(dir.path());
        let pool = Pool::open(&opts).unwrap();
        assert_eq!(pool.classify(0), None);
        assert_eq!(pool.classify(1), Some(Region::Data));
        let data_nlba = pool.block_count(Region::Data);
        assert_eq!(pool.classify(data_nlba + 1), Some(Region::Meta));
        let meta_nlba = pool.block_count(Region::Meta);
        assert_eq!(pool.classify(data_nlba + meta_nlba + 1), None);
    }
}
