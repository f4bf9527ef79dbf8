//! Typed, validated pool-open options.
//!
//! Replaces the raw `pmb_opts` C struct with a consuming builder, the way
//! most of this corpus configures a storage engine before opening it.

use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::{Error, Result};

/// Durability policy applied to every block write, selected at open time and
/// persisted in the pool header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum SyncMode {
    /// Every block write triggers a whole-pool `msync`.
    Sync = 0,
    /// Every block write triggers an async, best-effort flush.
    Async = 1,
    /// Every block write triggers a `msync` of just that block's range.
    SelSync = 2,
    /// No inline persistence; a background thread flushes on a timer.
    ThSync = 3,
    /// No persistence at all. Intended for tests only.
    NoSync = 4,
}

impl SyncMode {
    pub(crate) fn from_u8(v: u8) -> Option<SyncMode> {
        match v {
            0 => Some(SyncMode::Sync),
            1 => Some(SyncMode::Async),
            2 => Some(SyncMode::SelSync),
            3 => Some(SyncMode::ThSync),
            4 => Some(SyncMode::NoSync),
            _ => None,
        }
    }
}

/// Default number of transaction slots when unspecified.
pub const DEFAULT_TX_SLOTS: u8 = 16;
/// Hard cap on the number of transaction slots: the slot count is a single
/// byte on media.
pub const MAX_TX_SLOTS: u8 = 255;
/// Minimum total file size, matching pmem-oriented pools that always carve
/// out room for a header and a handful of slots even for a tiny data set.
pub const MIN_POOL_SIZE: u64 = 20 * 1024 * 1024;
/// Default background-flush interval for [`SyncMode::ThSync`].
pub const DEFAULT_THSYNC_INTERVAL: Duration = Duration::from_secs(5);

/// Validated options used to create or open a [`crate::Store`].
#[derive(Debug, Clone)]
pub struct PoolOptions {
    pub(crate) path: PathBuf,
    pub(crate) create: bool,
    pub(crate) data_size: u64,
    pub(crate) meta_size: u64,
    pub(crate) tx_slots: u8,
    pub(crate) max_key_len: u32,
    pub(crate) max_val_len: u32,
    pub(crate) meta_max_key_len: u32,
    pub(crate) meta_max_val_len: u32,
    pub(crate) sync_type: SyncMode,
    pub(crate) thsync_interval: Duration,
}

impl PoolOptions {
    /// Starts a new builder for the pool at `path`.
    pub fn new<P: AsRef<Path>>(path: P) -> Self {
        PoolOptions {
            path: path.as_ref().to_path_buf(),
            create: true,
            data_size: MIN_POOL_SIZE,
            meta_size: MIN_POOL_SIZE,
            tx_slots: DEFAULT_TX_SLOTS,
            max_key_len: 128,
            max_val_len: 16 * 1024,
            meta_max_key_len: 64,
            meta_max_val_len: 256,
            sync_type: SyncMode::Sync,
            thsync_interval: DEFAULT_THSYNC_INTERVAL,
        }
    }

    /// Whether to create the backing file if it does not already exist.
    /// Defaults to `true`. Opening an existing pool (`create(false)`) skips
    /// header initialization and instead verifies the on-disk header
    /// against these options.
    pub fn create(mut self, create: bool) -> Self {
        self.create = create;
        self
    }

    /// Size in bytes of the data region. Rounded up to a whole number of
    /// data blocks at open time.
    pub fn data_size(mut self, bytes: u64) -> Self {
        self.data_size = bytes;
        self
    }

    /// Size in bytes of the meta region. Rounded up to a whole number of
    /// meta blocks at open time.
    pub fn meta_size(mut self, bytes: u64) -> Self {
        self.meta_size = bytes;
        self
    }

    /// Number of transaction slots (`1..=255`).
    pub fn tx_slots(mut self, count: u8) -> Self {
        self.tx_slots = count;
        self
    }

    /// Maximum key length accepted by `put` against the data region.
    pub fn max_key_len(mut self, len: u32) -> Self {
        self.max_key_len = len;
        self
    }

    /// Maximum value length accepted by `put` against the data region.
    pub fn max_val_len(mut self, len: u32) -> Self {
        self.max_val_len = len;
        self
    }

    /// Maximum key length accepted by `put_meta`.
    pub fn meta_max_key_len(mut self, len: u32) -> Self {
        self.meta_max_key_len = len;
        self
    }

    /// Maximum value length accepted by `put_meta`.
    pub fn meta_max_val_len(mut self, len: u32) -> Self {
        self.meta_max_val_len = len;
        self
    }

    /// Durability policy for block writes.
    pub fn sync_type(mut self, mode: SyncMode) -> Self {
        self.sync_type = mode;
        self
    }

    /// Flush interval used when `sync_type` is [`SyncMode::ThSync`].
    pub fn thsync_interval(mut self, interval: Duration) -> Self {
        self.thsync_interval = interval;
        self
    }

    /// Validates the option set, independent of whether the path exists.
    pub(crate) fn validate(&self) -> Result<()> {
        if self.tx_slots == 0 {
            return Err(Error::BadArgs("tx_slots must be at least 1"));
        }
        if self.max_key_len == 0 {
            return Err(Error::BadArgs("max_key_len must be non-zero"));
        }
        if self.meta_max_key_len == 0 {
            return Err(Error::BadArgs("meta_max_key_len must be non-zero"));
        }
        if self.data_size == 0 || self.meta_size == 0 {
            return Err(Error::BadArgs("data_size and meta_size must be non-zero"));
        }
        Ok(())
    }
}
