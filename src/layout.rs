//! On-media layout: the pool header and the derived region geometry.
//!
//! Everything below offset `HEADER_SIZE` is computed, never stored
//! redundantly. That includes `data_nlba`/`meta_nlba`: `data_size`/`meta_size`
//! are supplied by the caller on every open (not read back from the file) and
//! the header is used only to verify that the caller's request matches what
//! was persisted at create time.

use crate::block::{data_block_size, meta_block_size, round_up_4k};
use crate::config::{PoolOptions, SyncMode};
use crate::error::{Error, Result};

/// 8-byte magic identifying this file format.
pub const SIGNATURE: &[u8; 8] = b"PMBACKEN";

/// Current format version triple. An `incompat` mismatch on open is fatal;
/// `ro_compat` mismatches are accepted (reserved for a future
/// forwards-compatible subset).
pub const FORMAT_MAJOR: u32 = 1;
pub const FORMAT_COMPAT: u32 = 0;
pub const FORMAT_INCOMPAT: u32 = 0;
pub const FORMAT_RO_COMPAT: u32 = 0;

/// Size of the header region, padded to one 4 KiB page.
pub const HEADER_SIZE: u64 = 4096;

const OFF_SIGNATURE: usize = 0;
const OFF_MAJOR: usize = 8;
const OFF_COMPAT: usize = 12;
const OFF_INCOMPAT: usize = 16;
const OFF_RO_COMPAT: usize = 20;
const OFF_DATA_BSIZE: usize = 24;
const OFF_META_BSIZE: usize = 28;
const OFF_MAX_KEY_LEN: usize = 32;
const OFF_MAX_VAL_LEN: usize = 36;
const OFF_META_MAX_KEY_LEN: usize = 40;
const OFF_META_MAX_VAL_LEN: usize = 44;
const OFF_TX_SLOTS_COUNT: usize = 48;
const OFF_TX_SLOT_SIZE: usize = 49;
const OFF_SYNC_TYPE: usize = 53;

/// The fully decoded pool header plus the geometry derived from it.
#[derive(Debug, Clone, Copy)]
pub struct Layout {
    pub major: u32,
    pub compat: u32,
    pub incompat: u32,
    pub ro_compat: u32,
    pub data_bsize: u64,
    pub meta_bsize: u64,
    pub max_key_len: u32,
    pub max_val_len: u32,
    pub meta_max_key_len: u32,
    pub meta_max_val_len: u32,
    pub tx_slots_count: u8,
    pub tx_slot_size: u32,
    pub sync_type: SyncMode,

    // Derived, not stored:
    pub tx_log_offset: u64,
    pub data_offset: u64,
    pub meta_offset: u64,
    pub data_nlba: u64,
    pub meta_nlba: u64,
    pub total_size: u64,
}

impl Layout {
    /// Computes the full layout from validated pool options plus the
    /// derived transaction-slot size. Used both to initialize a fresh pool
    /// and to recompute the expected geometry when opening an existing one.
    pub fn from_options(opts: &PoolOptions, tx_slot_size: u32) -> Layout {
        let data_bsize = data_block_size(opts.max_key_len, opts.max_val_len);
        let meta_bsize = meta_block_size(opts.meta_max_key_len, opts.meta_max_val_len);

        let tx_log_offset = HEADER_SIZE;
        let tx_log_bytes = opts.tx_slots as u64 * tx_slot_size as u64;
        let data_offset = tx_log_offset + round_up_4k(tx_log_bytes);

        let data_bytes = round_up_4k(opts.data_size).max(data_bsize);
        let data_nlba = data_bytes / data_bsize;
        let meta_offset = data_offset + data_nlba * data_bsize;

        let meta_bytes = round_up_4k(opts.meta_size).max(meta_bsize);
        let meta_nlba = meta_bytes / meta_bsize;

        let total_size = meta_offset + meta_nlba * meta_bsize;

        Layout {
            major: FORMAT_MAJOR,
            compat: FORMAT_COMPAT,
            incompat: FORMAT_INCOMPAT,
            ro_compat: FORMAT_RO_COMPAT,
            data_bsize,
            meta_bsize,
            max_key_len: opts.max_key_len,
            max_val_len: opts.max_val_len,
            meta_max_key_len: opts.meta_max_key_len,
            meta_max_val_len: opts.meta_max_val_len,
            tx_slots_count: opts.tx_slots,
            tx_slot_size,
            sync_type: opts.sync_type,
            tx_log_offset,
            data_offset,
            meta_offset,
            data_nlba,
            meta_nlba,
            total_size,
        }
    }

    /// Encodes the header into the first `HEADER_SIZE` bytes of `buf`.
    pub fn encode(&self, buf: &mut [u8]) {
        debug_assert!(buf.len() as u64 >= HEADER_SIZE);
        for b in buf[..HEADER_SIZE as usize].iter_mut() {
            *b = 0;
        }
        buf[OFF_SIGNATURE..OFF_SIGNATURE + 8].copy_from_slice(SIGNATURE);
        buf[OFF_MAJOR..OFF_MAJOR + 4].copy_from_slice(&self.major.to_le_bytes());
        buf[OFF_COMPAT..OFF_COMPAT + 4].copy_from_slice(&self.compat.to_le_bytes());
        buf[OFF_INCOMPAT..OFF_INCOMPAT + 4].copy_from_slice(&self.incompat.to_le_bytes());
        buf[OFF_RO_COMPAT..OFF_RO_COMPAT + 4].copy_from_slice(&self.ro_compat.to_le_bytes());
        buf[OFF_DATA_BSIZE..OFF_DATA_BSIZE + 4]
            .copy_from_slice(&(self.data_bsize as u32).to_le_bytes());
        buf[OFF_META_BSIZE..OFF_META_BSIZE + 4]
            .copy_from_slice(&(self.meta_bsize as u32).to_le_bytes());
        buf[OFF_MAX_KEY_LEN..OFF_MAX_KEY_LEN + 4].copy_from_slice(&self.max_key_len.to_le_bytes());
        buf[OFF_MAX_VAL_LEN..OFF_MAX_VAL_LEN + 4].copy_from_slice(&self.max_val_len.to_le_bytes());
        buf[OFF_META_MAX_KEY_LEN..OFF_META_MAX_KEY_LEN + 4]
            .copy_from_slice(&self.meta_max_key_len.to_le_bytes());
        buf[OFF_META_MAX_VAL_LEN..OFF_META_MAX_VAL_LEN + 4]
            .copy_from_slice(&self.meta_max_val_len.to_le_bytes());
        buf[OFF_TX_SLOTS_COUNT] = self.tx_slots_count;
        buf[OFF_TX_SLOT_SIZE..OFF_TX_SLOT_SIZE + 4].copy_from_slice(&self.tx_slot_size.to_le_bytes());
        buf[OFF_SYNC_TYPE] = self.sync_type as u8;
    }

    /// Decodes the pool header fields stored in `buf`. Region offsets/nlba
    /// counts are not part of this — callers re-derive them with
    /// [`Layout::from_options`] and compare against these stored fields via
    /// [`Layout::verify_matches_stored`].
    pub fn decode(buf: &[u8]) -> Result<Layout> {
        if (buf.len() as u64) < HEADER_SIZE {
            return Err(Error::SuperblockCorrupt);
        }
        if &buf[OFF_SIGNATURE..OFF_SIGNATURE + 8] != SIGNATURE {
            return Err(Error::SuperblockInvalid("bad signature".into()));
        }
        let major = u32::from_le_bytes(buf[OFF_MAJOR..OFF_MAJOR + 4].try_into().unwrap());
        let compat = u32::from_le_bytes(buf[OFF_COMPAT..OFF_COMPAT + 4].try_into().unwrap());
        let incompat = u32::from_le_bytes(buf[OFF_INCOMPAT..OFF_INCOMPAT + 4].try_into().unwrap());
        let ro_compat = u32::from_le_bytes(buf[OFF_RO_COMPAT..OFF_RO_COMPAT + 4].try_into().unwrap());
        if incompat != FORMAT_INCOMPAT {
            return Err(Error::SuperblockInvalid(format!(
                "incompatible format version {} (expected {})",
                incompat, FORMAT_INCOMPAT
            )));
        }

        let data_bsize =
            u32::from_le_bytes(buf[OFF_DATA_BSIZE..OFF_DATA_BSIZE + 4].try_into().unwrap()) as u64;
        let meta_bsize =
            u32::from_le_bytes(buf[OFF_META_BSIZE..OFF_META_BSIZE + 4].try_into().unwrap()) as u64;
        let max_key_len =
            u32::from_le_bytes(buf[OFF_MAX_KEY_LEN..OFF_MAX_KEY_LEN + 4].try_into().unwrap());
        let max_val_len =
            u32::from_le_bytes(buf[OFF_MAX_VAL_LEN..OFF_MAX_VAL_LEN + 4].try_into().unwrap());
        let meta_max_key_len = u32::from_le_bytes(
            buf[OFF_META_MAX_KEY_LEN..OFF_META_MAX_KEY_LEN + 4]
                .try_into()
                .unwrap(),
        );
        let meta_max_val_len = u32::from_le_bytes(
            buf[OFF_META_MAX_VAL_LEN..OFF_META_MAX_VAL_LEN + 4]
                .try_into()
                .unwrap(),
        );
        let tx_slots_count = buf[OFF_TX_SLOTS_COUNT];
        let tx_slot_size =
            u32::from_le_bytes(buf[OFF_TX_SLOT_SIZE..OFF_TX_SLOT_SIZE + 4].try_into().unwrap());
        let sync_type = SyncMode::from_u8(buf[OFF_SYNC_TYPE]).ok_or(Error::SuperblockCorrupt)?;

        if data_bsize == 0 || meta_bsize == 0 || tx_slots_count == 0 {
            return Err(Error::SuperblockCorrupt);
        }

        let tx_log_offset = HEADER_SIZE;
        let tx_log_bytes = tx_slots_count as u64 * tx_slot_size as u64;
        let data_offset = tx_log_offset + round_up_4k(tx_log_bytes);

        Ok(Layout {
            major,
            compat,
            incompat,
            ro_compat,
            data_bsize,
            meta_bsize,
            max_key_len,
            max_val_len,
            meta_max_key_len,
            meta_max_val_len,
            tx_slots_count,
            tx_slot_size,
            sync_type,
            tx_log_offset,
            data_offset,
            meta_offset: 0,
            data_nlba: 0,
            meta_nlba: 0,
            total_size: 0,
        })
    }

    /// Verifies that a header decoded from disk (`stored`) matches the
    /// layout recomputed from the caller's requested options. A mismatch
    /// here means the caller asked to open the pool with different
    /// key/value limits or slot counts than it was created with.
    pub fn verify_matches_stored(&self, stored: &Layout) -> Result<()> {
        let fields_match = self.data_bsize == stored.data_bsize
            && self.meta_bsize == stored.meta_bsize
            && self.max_key_len == stored.max_key_len
            && self.max_val_len == stored.max_val_len
            && self.meta_max_key_len == stored.meta_max_key_len
            && self.meta_max_val_len == stored.meta_max_val_len
            && self.tx_slots_count == stored.tx_slots_count
            && self.tx_slot_size == stored.tx_slot_size;
        if !fields_match {
            return Err(Error::SuperblockInvalid(
                "open options do not match the pool's stored header".into(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PoolOptions;

    #[test]
    fn encode_decode_roundtrip() {
        let opts = PoolOptions::new("x")
            .data_size(8 * 1024 * 1024)
            .meta_size(4 * 1024 * 1024)
            .tx_slots(8)
            .max_key_len(64)
            .max_val_len(1024);
        let layout = Layout::from_options(&opts, 512);
        let mut buf = vec![0u8; HEADER_SIZE as usize];
        layout.encode(&mut buf);
        let decoded = Layout::decode(&buf).unwrap();
        assert_eq!(decoded.max_key_len, layout.max_key_len);
        assert_eq!(decoded.max_val_len, layout.max_val_len);
        assert_eq!(decoded.data_bsize, layout.data_bsize);
        assert_eq!(decoded.tx_slots_count, layout.tx_slots_count);
        layout.verify_matches_stored(&decoded).unwrap();
    }

    #[test]
    fn mismatched_options_rejected() {
        let opts = PoolOptions::new("x").max_key_len(64).max_val_len(1024);
        let layout = Layout::from_options(&opts, 512);
        let mut buf = vec![0u8; HEADER_SIZE as usize];
        layout.encode(&mut buf);
        let reopened_opts = PoolOptions::new("x").max_key_len(128).max_val_len(1024);
        let reopened_layout = Layout::from_options(&reopened_opts, 512);
        let stored = Layout::decode(&buf).unwrap();
        assert!(reopened_layout.verify_matches_stored(&stored).is_err());
    }

    #[test]
    fn bad_signature_rejected() {
        let buf = vec![0u8; HEADER_SIZE as usize];
        assert!(Layout::decode(&buf).is_err());
    }
}
