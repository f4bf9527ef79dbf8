//! The transaction log: a fixed array of slots recording, for each
//! in-flight transaction, the block-level operations it intends to apply.
//!
//! Each slot is a self-contained state machine:
//!
//! ```text
//! EMPTY -> PROCESSING -> COMMITTED -> EMPTY      (normal execute path)
//! EMPTY -> PROCESSING -> ABORTED   -> EMPTY      (abort path)
//!          PROCESSING -> ABORTED   -> EMPTY      (abort before commit)
//! ```
//!
//! Entries are appended to the slot's on-disk bytes as operations are
//! recorded, before the slot is marked `COMMITTED` — that ordering is what
//! lets recovery redo a committed transaction's effects without needing any
//! other record of what it intended to do.

use crc::{Crc, CRC_64_XZ};

use crate::config::PoolOptions;
use crate::error::{Error, Result};
use crate::range::RangeAllocator;

static CRC64: Crc<u64> = Crc::<u64>::new(&CRC_64_XZ);

/// Upper bound on operations recorded per transaction. Fixed so that a tx
/// slot has a constant on-disk size. Sized comfortably above the largest
/// single-transaction batch this crate's own end-to-end scenarios exercise
/// (128 puts in one transaction) rather than the much smaller number a
/// one-object-at-a-time caller would ever hit in practice.
pub const MAX_TX_ENTRIES: usize = 256;

/// Fixed size of one encoded [`TxEntry`], not counting its payload:
/// `kind(1) + old_id(8) + new_id(8) + offset(4) + size(4)`.
const ENTRY_HEADER_SIZE: usize = 25;

const OFF_CHECKSUM: usize = 0;
const OFF_STATUS: usize = 8;
const OFF_SIZE: usize = 9;
const OFF_ENTRIES: usize = 13;

/// Size in bytes of the `{status, size}` pair the slot checksum starts from;
/// a slot's `size` field tracks this plus every entry appended so far.
const SLOT_HEADER_SIZE: u32 = 5;

/// Lifecycle state of a transaction slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum TxStatus {
    Empty = 0,
    Processing = 1,
    Committed = 2,
    Aborted = 3,
}

impl TxStatus {
    fn from_u8(v: u8) -> Result<TxStatus> {
        match v {
            0 => Ok(TxStatus::Empty),
            1 => Ok(TxStatus::Processing),
            2 => Ok(TxStatus::Committed),
            3 => Ok(TxStatus::Aborted),
            _ => Err(Error::SuperblockCorrupt),
        }
    }
}

/// What kind of block-level effect a logged entry describes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum TxOpKind {
    /// Sentinel: "no entry here", also the implicit terminator.
    None = 0,
    /// A brand-new block was allocated and written.
    Write = 1,
    /// An existing block was replaced by a new one (old retired on commit).
    Update = 2,
    /// An existing block is to be retired.
    Remove = 3,
    /// An existing block's value is overwritten in place.
    UpdInPlace = 4,
}

impl TxOpKind {
    fn from_u8(v: u8) -> Result<TxOpKind> {
        match v {
            0 => Ok(TxOpKind::None),
            1 => Ok(TxOpKind::Write),
            2 => Ok(TxOpKind::Update),
            3 => Ok(TxOpKind::Remove),
            4 => Ok(TxOpKind::UpdInPlace),
            _ => Err(Error::SuperblockCorrupt),
        }
    }
}

/// One logged operation. `offset`/`size` and `payload` are only meaningful
/// for [`TxOpKind::UpdInPlace`]; `size` there is the true value length
/// (`size` and `offset` are otherwise the `size<<32|offset` pair from the
/// wire format, split out for clarity).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TxEntry {
    pub kind: TxOpKind,
    pub old_id: u64,
    pub new_id: u64,
    pub offset: u32,
    pub size: u32,
    pub payload: Vec<u8>,
}

impl TxEntry {
    pub fn write(new_id: u64) -> TxEntry {
        TxEntry {
            kind: TxOpKind::Write,
            old_id: 0,
            new_id,
            offset: 0,
            size: 0,
            payload: Vec::new(),
        }
    }

    pub fn update(old_id: u64, new_id: u64) -> TxEntry {
        TxEntry {
            kind: TxOpKind::Update,
            old_id,
            new_id,
            offset: 0,
            size: 0,
            payload: Vec::new(),
        }
    }

    pub fn remove(old_id: u64) -> TxEntry {
        TxEntry {
            kind: TxOpKind::Remove,
            old_id,
            new_id: 0,
            offset: 0,
            size: 0,
            payload: Vec::new(),
        }
    }

    pub fn upd_in_place(target_id: u64, offset: u32, payload: Vec<u8>) -> TxEntry {
        let size = payload.len() as u32;
        TxEntry {
            kind: TxOpKind::UpdInPlace,
            old_id: target_id,
            new_id: 0,
            offset,
            size,
            payload,
        }
    }
}

/// Maximum size in bytes of a value eligible for the small-update
/// (in-place) path: anything under half of `max_val_len`.
pub fn small_update_threshold(max_val_len: u32) -> u32 {
    max_val_len / 2
}

/// Computes the fixed on-disk size of one transaction slot for a given pool
/// configuration: a status byte, `MAX_TX_ENTRIES` entries (each carrying
/// enough payload capacity for a small-update value), plus one implicit
/// terminator entry's worth of header so a full slot can still be
/// unambiguously walked to its end.
pub fn compute_tx_slot_size(opts: &PoolOptions) -> u32 {
    let payload_cap = small_update_threshold(opts.max_val_len) as usize;
    let entry_size = ENTRY_HEADER_SIZE + payload_cap;
    (OFF_ENTRIES + (MAX_TX_ENTRIES + 1) * entry_size) as u32
}

/// A read/write view of one transaction slot's raw bytes.
pub struct TxSlotView<'a> {
    bytes: &'a mut [u8],
    payload_cap: usize,
}

impl<'a> TxSlotView<'a> {
    pub fn new(bytes: &'a mut [u8], payload_cap: u32) -> Self {
        TxSlotView {
            bytes,
            payload_cap: payload_cap as usize,
        }
    }

    fn entry_size(&self) -> usize {
        ENTRY_HEADER_SIZE + self.payload_cap
    }

    fn entry_offset(&self, i: usize) -> usize {
        OFF_ENTRIES + i * self.entry_size()
    }

    pub fn status(&self) -> Result<TxStatus> {
        TxStatus::from_u8(self.bytes[OFF_STATUS])
    }

    pub fn set_status(&mut self, status: TxStatus) {
        self.bytes[OFF_STATUS] = status as u8;
    }

    pub fn checksum(&self) -> u64 {
        u64::from_le_bytes(self.bytes[OFF_CHECKSUM..OFF_CHECKSUM + 8].try_into().unwrap())
    }

    fn set_checksum(&mut self, v: u64) {
        self.bytes[OFF_CHECKSUM..OFF_CHECKSUM + 8].copy_from_slice(&v.to_le_bytes());
    }

    fn size(&self) -> u32 {
        u32::from_le_bytes(self.bytes[OFF_SIZE..OFF_SIZE + 4].try_into().unwrap())
    }

    fn set_size(&mut self, v: u32) {
        self.bytes[OFF_SIZE..OFF_SIZE + 4].copy_from_slice(&v.to_le_bytes());
    }

    /// Recomputes `size` (`payload_bytes`) from the entries actually present,
    /// keeping the persisted field in lock-step with the entry array instead
    /// of trusting incremental bookkeeping to stay correct across restarts.
    fn recompute_size(&self) -> Result<u32> {
        let mut size = SLOT_HEADER_SIZE;
        for i in 0..MAX_TX_ENTRIES {
            match self.read_entry(i)? {
                Some(e) => size += ENTRY_HEADER_SIZE as u32 + e.payload.len() as u32,
                None => break,
            }
        }
        Ok(size)
    }

    /// Computes the checksum over `[status..status+size)`, i.e. everything
    /// the slot currently claims to hold, explicitly excluding the leading
    /// checksum field itself.
    fn compute_checksum(&self) -> u64 {
        let size = self.size() as usize;
        let end = (OFF_STATUS + size).min(self.bytes.len());
        let mut digest = CRC64.digest();
        digest.update(&self.bytes[OFF_STATUS..end]);
        digest.finalize()
    }

    /// Recomputes and installs the checksum over the slot's current
    /// `status`/`size`/entries. Must be the last write before a caller
    /// persists the slot, per the commit/abort protocol.
    pub fn install_checksum(&mut self) {
        let sum = self.compute_checksum();
        self.set_checksum(sum);
    }

    /// Whether this slot is both `COMMITTED` and has a stored checksum
    /// matching its recomputed one — the sole criterion recovery uses to
    /// decide whether a transaction's effects should be redone or undone.
    pub fn is_committed(&self) -> bool {
        matches!(self.status(), Ok(TxStatus::Committed))
            && self.checksum() == self.compute_checksum()
    }

    /// Zeroes the whole slot, returning it to the `EMPTY` state with no
    /// entries.
    pub fn reset(&mut self) {
        for b in self.bytes.iter_mut() {
            *b = 0;
        }
    }

    /// Decodes the entry at index `i`. `Ok(None)` means the slot's entry
    /// list ends here (an all-zero `None`-kind entry).
    pub fn read_entry(&self, i: usize) -> Result<Option<TxEntry>> {
        let off = self.entry_offset(i);
        let kind = TxOpKind::from_u8(self.bytes[off])?;
        if kind == TxOpKind::None {
            return Ok(None);
        }
        let old_id = u64::from_le_bytes(self.bytes[off + 1..off + 9].try_into().unwrap());
        let new_id = u64::from_le_bytes(self.bytes[off + 9..off + 17].try_into().unwrap());
        let offset = u32::from_le_bytes(self.bytes[off + 17..off + 21].try_into().unwrap());
        let size = u32::from_le_bytes(self.bytes[off + 21..off + 25].try_into().unwrap());
        let payload = if kind == TxOpKind::UpdInPlace {
            let start = off + ENTRY_HEADER_SIZE;
            self.bytes[start..start + size as usize].to_vec()
        } else {
            Vec::new()
        };
        Ok(Some(TxEntry {
            kind,
            old_id,
            new_id,
            offset,
            size,
            payload,
        }))
    }

    /// Iterates entries from index 0 until the implicit terminator.
    pub fn entries(&self) -> Result<Vec<TxEntry>> {
        let mut out = Vec::new();
        for i in 0..MAX_TX_ENTRIES {
            match self.read_entry(i)? {
                Some(e) => out.push(e),
                None => break,
            }
        }
        Ok(out)
    }

    fn write_entry(&mut self, i: usize, entry: &TxEntry) {
        let off = self.entry_offset(i);
        self.bytes[off] = entry.kind as u8;
        self.bytes[off + 1..off + 9].copy_from_slice(&entry.old_id.to_le_bytes());
        self.bytes[off + 9..off + 17].copy_from_slice(&entry.new_id.to_le_bytes());
        self.bytes[off + 17..off + 21].copy_from_slice(&entry.offset.to_le_bytes());
        self.bytes[off + 21..off + 25].copy_from_slice(&entry.size.to_le_bytes());
        if entry.kind == TxOpKind::UpdInPlace {
            let start = off + ENTRY_HEADER_SIZE;
            self.bytes[start..start + entry.payload.len()].copy_from_slice(&entry.payload);
        }
    }

    /// Appends `entry` after the current last entry, keeping the implicit
    /// `(0,0)` terminator intact. Returns the appended entry's index.
    ///
    /// Fails with [`Error::Generic`] if the slot already holds
    /// `MAX_TX_ENTRIES` entries, or if `entry`'s payload exceeds this pool's
    /// small-update payload capacity.
    pub fn append(&mut self, entry: &TxEntry) -> Result<usize> {
        if entry.payload.len() > self.payload_cap {
            return Err(Error::BadArgs("small-update payload exceeds capacity"));
        }
        let mut i = 0;
        while i < MAX_TX_ENTRIES {
            if self.read_entry(i)?.is_none() {
                break;
            }
            i += 1;
        }
        if i >= MAX_TX_ENTRIES {
            return Err(Error::Generic);
        }
        self.write_entry(i, entry);
        let size = self.recompute_size()?;
        self.set_size(size);
        Ok(i)
    }
}

/// Owns the transaction slot geometry and the free-slot allocator. Does not
/// own the slots' bytes — those live in the pool's mapping and are handed
/// out as `&mut [u8]` borrows per slot.
#[derive(Debug)]
pub struct TxLog {
    free_slots: RangeAllocator,
    slot_count: u8,
    slot_size: u32,
    payload_cap: u32,
}

impl TxLog {
    /// Builds a fresh log over `slot_count` slots, all initially free.
    pub fn new(slot_count: u8, slot_size: u32, max_val_len: u32) -> TxLog {
        let free_slots = RangeAllocator::new(1, slot_count as u64)
            .expect("slot_count validated non-zero by PoolOptions::validate");
        TxLog {
            free_slots,
            slot_count,
            slot_size,
            payload_cap: small_update_threshold(max_val_len),
        }
    }

    pub fn slot_count(&self) -> u8 {
        self.slot_count
    }

    pub fn slot_size(&self) -> u32 {
        self.slot_size
    }

    pub fn payload_cap(&self) -> u32 {
        self.payload_cap
    }

    /// Byte offset of slot `id` (1-based) within the transaction-log
    /// region.
    pub fn slot_byte_offset(&self, id: u64) -> u64 {
        (id - 1) * self.slot_size as u64
    }

    /// Reserves a free slot id, or `None` if every slot is in use.
    pub fn acquire_slot(&self) -> Option<u64> {
        self.free_slots.pop()
    }

    /// Returns a slot id to the free list. Called once a slot has been
    /// fully reset to `EMPTY`.
    pub fn release_slot(&self, id: u64) {
        self.free_slots.push(id);
    }

    /// Marks slot `id` as permanently in use (used by recovery when a live
    /// `PROCESSING`/`COMMITTED` slot is found and must not be handed out
    /// again until it's been resolved and reset).
    pub fn mark_in_use(&self, id: u64) {
        // Pop is a no-op if the id is already outside the free list.
        let _ = self.free_slots.pop_id(id);
    }
}

/// A reserved transaction slot. Records operations as they happen and
/// drives the slot's status transitions; applying the recorded effects to
/// the data/meta regions is the caller's responsibility (see
/// `crate::store`), since that requires access to the pool's block regions
/// and free-id allocators that this module deliberately knows nothing
/// about.
pub struct TxHandle<'a> {
    slot_id: u64,
    view: TxSlotView<'a>,
}

impl<'a> TxHandle<'a> {
    /// Begins a new transaction in a freshly reserved, zeroed slot.
    pub fn begin(slot_id: u64, bytes: &'a mut [u8], payload_cap: u32) -> TxHandle<'a> {
        let mut view = TxSlotView::new(bytes, payload_cap);
        view.reset();
        view.set_status(TxStatus::Processing);
        view.set_size(SLOT_HEADER_SIZE);
        TxHandle { slot_id, view }
    }

    pub fn slot_id(&self) -> u64 {
        self.slot_id
    }

    pub fn status(&self) -> Result<TxStatus> {
        self.view.status()
    }

    pub fn entries(&self) -> Result<Vec<TxEntry>> {
        self.view.entries()
    }

    fn require_status(&self, expected: TxStatus) -> Result<()> {
        if self.status()? != expected {
            return Err(Error::Generic);
        }
        Ok(())
    }

    /// Records one more operation against this (still-`PROCESSING`)
    /// transaction.
    pub fn record(&mut self, entry: TxEntry) -> Result<()> {
        self.require_status(TxStatus::Processing)?;
        self.view.append(&entry)?;
        Ok(())
    }

    /// Marks the transaction committed. Callers must persist the slot's
    /// bytes before returning success to the application, and must persist
    /// them again (as `EMPTY`) after `execute` finishes applying effects.
    pub fn commit(&mut self) -> Result<()> {
        self.require_status(TxStatus::Processing)?;
        self.view.set_status(TxStatus::Committed);
        self.view.install_checksum();
        Ok(())
    }

    /// Marks the transaction aborted. Valid from either `PROCESSING` (no
    /// effects were ever visible) or `COMMITTED` (effects must be undone by
    /// the caller before the slot is reset).
    pub fn abort(&mut self) -> Result<()> {
        let status = self.status()?;
        if status != TxStatus::Processing && status != TxStatus::Committed {
            return Err(Error::Generic);
        }
        self.view.set_status(TxStatus::Aborted);
        self.view.install_checksum();
        Ok(())
    }

    /// Resets the slot to `EMPTY` with no entries. Called once the caller
    /// has finished applying (or undoing) every recorded entry.
    pub fn finish(mut self, log: &TxLog) {
        self.view.reset();
        log.release_slot(self.slot_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn make_slot(payload_cap: u32) -> Vec<u8> {
        let entry_size = ENTRY_HEADER_SIZE + payload_cap as usize;
        vec![0u8; OFF_ENTRIES + (MAX_TX_ENTRIES + 1) * entry_size]
    }

    #[test]
    fn fresh_slot_is_empty_with_no_entries() {
        let mut buf = make_slot(64);
        let view = TxSlotView::new(&mut buf, 64);
        assert_eq!(view.status().unwrap(), TxStatus::Empty);
        assert!(view.entries().unwrap().is_empty());
    }

    #[test]
    fn append_and_read_roundtrip() {
        let mut buf = make_slot(64);
        let mut view = TxSlotView::new(&mut buf, 64);
        view.append(&TxEntry::write(5)).unwrap();
        view.append(&TxEntry::update(5, 6)).unwrap();
        view.append(&TxEntry::upd_in_place(6, 24, b"hello".to_vec()))
            .unwrap();
        let entries = view.entries().unwrap();
        assert_eq!(entries.len(), 3);
        assert_eq!(entries[0], TxEntry::write(5));
        assert_eq!(entries[1], TxEntry::update(5, 6));
        assert_eq!(entries[2].payload, b"hello");
    }

    #[test]
    fn append_rejects_oversized_payload() {
        let mut buf = make_slot(4);
        let mut view = TxSlotView::new(&mut buf, 4);
        let big = TxEntry::upd_in_place(1, 0, vec![0u8; 5]);
        assert!(view.append(&big).is_err());
    }

    #[test]
    fn append_rejects_beyond_capacity() {
        let mut buf = make_slot(0);
        let mut view = TxSlotView::new(&mut buf, 0);
        for i in 0..MAX_TX_ENTRIES {
            view.append(&TxEntry::write(i as u64 + 1)).unwrap();
        }
        assert!(view.append(&TxEntry::write(999)).is_err());
    }

    #[test]
    fn handle_state_machine_execute_path() {
        let mut buf = make_slot(64);
        let mut handle = TxHandle::begin(1, &mut buf, 64);
        assert_eq!(handle.status().unwrap(), TxStatus::Processing);
        handle.record(TxEntry::write(1)).unwrap();
        handle.commit().unwrap();
        assert_eq!(handle.status().unwrap(), TxStatus::Committed);
        let log = TxLog::new(4, compute_test_slot_size(64), 128);
        log.mark_in_use(1);
        handle.finish(&log);
    }

    #[test]
    fn handle_rejects_commit_twice() {
        let mut buf = make_slot(64);
        let mut handle = TxHandle::begin(1, &mut buf, 64);
        handle.commit().unwrap();
        assert!(handle.commit().is_err());
    }

    #[test]
    fn handle_abort_from_committed_is_allowed() {
        let mut buf = make_slot(64);
        let mut handle = TxHandle::begin(1, &mut buf, 64);
        handle.commit().unwrap();
        handle.abort().unwrap();
        assert_eq!(handle.status().unwrap(), TxStatus::Aborted);
    }

    fn compute_test_slot_size(payload_cap: u32) -> u32 {
        (OFF_ENTRIES + (MAX_TX_ENTRIES + 1) * (ENTRY_HEADER_SIZE + payload_cap as usize)) as u32
    }
}
