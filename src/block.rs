//! Block addressing and the checksum-guarded liveness protocol.
//!
//! A block is a fixed-size, self-describing region: an 8-byte checksum
//! followed by a small header (`version`, `id_tag`, `key_len`, `val_len`)
//! and then the key and value bytes themselves. The checksum is installed
//! last on write and is the sole witness of liveness — a block whose stored
//! checksum does not match its recomputed checksum is, by definition, dead.

use crc::{Crc, CRC_64_XZ};

/// Size, in bytes, of the fixed block header that precedes key/value bytes:
/// `checksum(8) + version(4) + id_tag(4) + key_len(4) + val_len(4)`.
pub const BLOCK_HEADER_SIZE: usize = 24;

const OFF_CHECKSUM: usize = 0;
const OFF_VERSION: usize = 8;
const OFF_ID_TAG: usize = 12;
const OFF_KEY_LEN: usize = 16;
const OFF_VAL_LEN: usize = 20;
const OFF_KEY: usize = BLOCK_HEADER_SIZE;

static CRC64: Crc<u64> = Crc::<u64>::new(&CRC_64_XZ);

/// A 1-based dense block identifier. `0` means "no such block".
pub type BlockId = u64;

/// Which half of the address space a [`BlockId`] falls into.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Region {
    /// `[1, data_nlba]` — variable-length values up to `max_val_len`.
    Data,
    /// `(data_nlba, data_nlba + meta_nlba]` — small metadata records.
    Meta,
}

/// A read/write view of one block's bytes, scoped to the duration of a
/// single operation. Never outlives the borrow of the pool mapping it comes
/// from.
pub struct BlockView<'a> {
    bytes: &'a mut [u8],
}

/// Reads `block_id`/`version`/`key_len`/etc. straight out of a `&[u8]`
/// slice, without wrapping it in a [`BlockView`]. [`Store::get`] and the
/// iterator use these directly so the returned [`Pair`][crate::store::Pair]
/// can borrow from the mapping for the caller's lifetime instead of a
/// short-lived view's.
#[inline]
pub fn checksum_of(bytes: &[u8]) -> u64 {
    u64::from_le_bytes(bytes[OFF_CHECKSUM..OFF_CHECKSUM + 8].try_into().unwrap())
}

#[inline]
pub fn version_of(bytes: &[u8]) -> u32 {
    u32::from_le_bytes(bytes[OFF_VERSION..OFF_VERSION + 4].try_into().unwrap())
}

#[inline]
pub fn id_tag_of(bytes: &[u8]) -> u32 {
    u32::from_le_bytes(bytes[OFF_ID_TAG..OFF_ID_TAG + 4].try_into().unwrap())
}

#[inline]
pub fn key_len_of(bytes: &[u8]) -> u32 {
    u32::from_le_bytes(bytes[OFF_KEY_LEN..OFF_KEY_LEN + 4].try_into().unwrap())
}

#[inline]
pub fn val_len_of(bytes: &[u8]) -> u32 {
    u32::from_le_bytes(bytes[OFF_VAL_LEN..OFF_VAL_LEN + 4].try_into().unwrap())
}

/// Computes the checksum of `bytes` the same way [`BlockView::install_checksum`]
/// does, over `[version..key_end]` then `[val_offset..val_offset+val_len)`.
pub fn compute_checksum_of(bytes: &[u8], val_offset: usize) -> u64 {
    let key_len = key_len_of(bytes) as usize;
    let val_len = val_len_of(bytes) as usize;
    let mut digest = CRC64.digest();
    digest.update(&bytes[OFF_VERSION..OFF_KEY]);
    digest.update(&bytes[OFF_KEY..OFF_KEY + key_len]);
    digest.update(&bytes[val_offset..val_offset + val_len]);
    digest.finalize()
}

/// Whether `bytes` holds a live block: non-zero stored checksum matching the
/// recomputed one.
pub fn is_live(bytes: &[u8], val_offset: usize) -> bool {
    let stored = checksum_of(bytes);
    stored != 0 && stored == compute_checksum_of(bytes, val_offset)
}

impl<'a> BlockView<'a> {
    /// Wraps a block-sized byte slice. Callers are responsible for handing
    /// in exactly `block_size` bytes starting at the block's base address.
    pub fn new(bytes: &'a mut [u8]) -> Self {
        BlockView { bytes }
    }

    #[inline]
    pub fn checksum(&self) -> u64 {
        u64::from_le_bytes(self.bytes[OFF_CHECKSUM..OFF_CHECKSUM + 8].try_into().unwrap())
    }

    #[inline]
    fn set_checksum(&mut self, v: u64) {
        self.bytes[OFF_CHECKSUM..OFF_CHECKSUM + 8].copy_from_slice(&v.to_le_bytes());
    }

    #[inline]
    pub fn version(&self) -> u32 {
        u32::from_le_bytes(self.bytes[OFF_VERSION..OFF_VERSION + 4].try_into().unwrap())
    }

    #[inline]
    pub fn set_version(&mut self, v: u32) {
        self.bytes[OFF_VERSION..OFF_VERSION + 4].copy_from_slice(&v.to_le_bytes());
    }

    #[inline]
    pub fn id_tag(&self) -> u32 {
        u32::from_le_bytes(self.bytes[OFF_ID_TAG..OFF_ID_TAG + 4].try_into().unwrap())
    }

    #[inline]
    pub fn set_id_tag(&mut self, v: u32) {
        self.bytes[OFF_ID_TAG..OFF_ID_TAG + 4].copy_from_slice(&v.to_le_bytes());
    }

    #[inline]
    pub fn key_len(&self) -> u32 {
        u32::from_le_bytes(self.bytes[OFF_KEY_LEN..OFF_KEY_LEN + 4].try_into().unwrap())
    }

    #[inline]
    pub fn set_key_len(&mut self, v: u32) {
        self.bytes[OFF_KEY_LEN..OFF_KEY_LEN + 4].copy_from_slice(&v.to_le_bytes());
    }

    #[inline]
    pub fn val_len(&self) -> u32 {
        u32::from_le_bytes(self.bytes[OFF_VAL_LEN..OFF_VAL_LEN + 4].try_into().unwrap())
    }

    #[inline]
    pub fn set_val_len(&mut self, v: u32) {
        self.bytes[OFF_VAL_LEN..OFF_VAL_LEN + 4].copy_from_slice(&v.to_le_bytes());
    }

    /// Key bytes, fixed at `key_start..key_start + key_len`.
    #[inline]
    pub fn key(&self) -> &[u8] {
        let len = self.key_len() as usize;
        &self.bytes[OFF_KEY..OFF_KEY + len]
    }

    #[inline]
    pub fn key_mut(&mut self) -> &mut [u8] {
        let len = self.key_len() as usize;
        &mut self.bytes[OFF_KEY..OFF_KEY + len]
    }

    /// Value bytes, at an offset that depends on the region layout: a fixed
    /// `max_key_len` slot in the data region (so values stay aligned for
    /// in-place updates), or immediately after the actual key bytes in the
    /// meta region.
    #[inline]
    pub fn val(&self, val_offset: usize) -> &[u8] {
        let len = self.val_len() as usize;
        &self.bytes[val_offset..val_offset + len]
    }

    #[inline]
    pub fn val_mut(&mut self, val_offset: usize) -> &mut [u8] {
        let len = self.val_len() as usize;
        &mut self.bytes[val_offset..val_offset + len]
    }

    /// Raw bytes from `val_offset` onward, ignoring the recorded `val_len` —
    /// used by the small-update path to write into a region larger than the
    /// block's currently recorded value.
    #[inline]
    pub fn raw_from(&mut self, val_offset: usize) -> &mut [u8] {
        &mut self.bytes[val_offset..]
    }

    /// Copies `payload` to `val_offset + offset`, leaving `val_len`/`version`
    /// untouched. Execute's small-update path calls this as entries are
    /// walked, then re-fingerprints the block (bumping `version`, extending
    /// `val_len`, reinstalling the checksum) once per touched id after all
    /// of a transaction's entries have been applied — matching the deferred
    /// bookkeeping a small update's target block goes through.
    pub fn write_raw_at(&mut self, val_offset: usize, offset: u32, payload: &[u8]) {
        let start = val_offset + offset as usize;
        self.bytes[start..start + payload.len()].copy_from_slice(payload);
    }

    /// Whether the block is live: its stored checksum matches the
    /// recomputed checksum over its declared payload.
    pub fn is_live(&self, val_offset: usize) -> bool {
        is_live(self.bytes, val_offset)
    }

    /// Computes the checksum over `[version..end_of_declared_payload]`,
    /// explicitly skipping the 8-byte checksum field itself.
    fn compute_checksum(&self, val_offset: usize) -> u64 {
        compute_checksum_of(self.bytes, val_offset)
    }

    /// Installs the checksum over the block's current header/key/value
    /// contents. Must be the last write performed on a block before it is
    /// considered live.
    pub fn install_checksum(&mut self, val_offset: usize) {
        let sum = self.compute_checksum(val_offset);
        self.set_checksum(sum);
    }

    /// Zeroes the checksum field, retiring the block regardless of its
    /// other contents.
    pub fn retire(&mut self) {
        self.set_checksum(0);
    }

    /// Zeroes the whole block. Used by recovery and by `execute`/`abort`
    /// when a block's former contents must not linger on media.
    pub fn zero(&mut self) {
        for b in self.bytes.iter_mut() {
            *b = 0;
        }
    }
}

/// Computes `key_start + max_key_len` — the fixed value offset used in the
/// data region.
#[inline]
pub const fn data_val_offset(max_key_len: u32) -> usize {
    BLOCK_HEADER_SIZE + max_key_len as usize
}

/// Computes `key_start + key_len` — the value offset used in the meta
/// region, where values are packed immediately after the actual key.
#[inline]
pub fn meta_val_offset(key_len: u32) -> usize {
    BLOCK_HEADER_SIZE + key_len as usize
}

/// Rounds `n` up to the next multiple of 4 KiB.
pub const fn round_up_4k(n: u64) -> u64 {
    let page = 4096u64;
    (n + page - 1) / page * page
}

/// Block size for the data region: header + max key + max value, rounded up
/// to a 4 KiB multiple.
pub const fn data_block_size(max_key_len: u32, max_val_len: u32) -> u64 {
    round_up_4k(BLOCK_HEADER_SIZE as u64 + max_key_len as u64 + max_val_len as u64)
}

/// Block size for the meta region: header + meta max key + meta max value,
/// rounded up to a 4 KiB multiple.
pub const fn meta_block_size(meta_max_key_len: u32, meta_max_val_len: u32) -> u64 {
    round_up_4k(BLOCK_HEADER_SIZE as u64 + meta_max_key_len as u64 + meta_max_val_len as u64)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn make_block(size: usize) -> Vec<u8> {
        vec![0u8; size]
    }

    #[test]
    fn zeroed_block_is_dead() {
        let mut buf = make_block(256);
        let view = BlockView::new(&mut buf);
        assert!(!view.is_live(24 + 16));
    }

    #[test]
    fn checksum_roundtrip() {
        let max_key_len = 16u32;
        let mut buf = make_block(256);
        let val_offset = data_val_offset(max_key_len);
        {
            let mut view = BlockView::new(&mut buf);
            view.set_version(1);
            view.set_id_tag(7);
            view.set_key_len(3);
            view.set_val_len(5);
            view.key_mut()[..3].copy_from_slice(b"abc");
            view.val_mut(val_offset)[..5].copy_from_slice(b"hello");
            view.install_checksum(val_offset);
        }
        let view = BlockView::new(&mut buf);
        assert!(view.is_live(val_offset));
        assert_eq!(view.key(), b"abc");
        assert_eq!(view.val(val_offset), b"hello");
    }

    #[test]
    fn tampering_breaks_liveness() {
        let max_key_len = 16u32;
        let mut buf = make_block(256);
        let val_offset = data_val_offset(max_key_len);
        {
            let mut view = BlockView::new(&mut buf);
            view.set_key_len(3);
            view.set_val_len(1);
            view.key_mut()[..3].copy_from_slice(b"abc");
            view.val_mut(val_offset)[0] = 9;
            view.install_checksum(val_offset);
        }
        buf[val_offset] = 10;
        let view = BlockView::new(&mut buf);
        assert!(!view.is_live(val_offset));
    }

    #[test]
    fn block_sizes_are_4k_aligned() {
        assert_eq!(data_block_size(128, 16 * 1024) % 4096, 0);
        assert_eq!(meta_block_size(64, 256) % 4096, 0);
    }
}
