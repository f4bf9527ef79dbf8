//! Crash recovery, run once at [`crate::Store::open`] time for any pool that
//! was not freshly created.
//!
//! Two phases, in order: R1 replays the transaction log single-threaded,
//! redoing committed effects and undoing uncommitted ones directly against
//! block bytes; R2 then throws away any notion of "what the log said" and
//! rebuilds the free/live allocators purely from which blocks verify their
//! own checksum. R1 never touches an allocator — there is nothing yet to
//! touch — which is what lets R2 run as a blind, parallel, idempotent scan.

use std::collections::HashMap;
use std::thread;

use tracing::{debug, info};

use crate::block::{self, data_val_offset, meta_val_offset, BlockId, BlockView, Region};
use crate::error::Result;
use crate::pool::Pool;
use crate::range::RangeAllocator;
use crate::txlog::{TxEntry, TxLog, TxOpKind, TxSlotView, TxStatus};

/// Allocator state rebuilt by [`run`], ready to be installed into a
/// [`crate::store::Store`].
pub struct RecoveredState {
    pub free_data: RangeAllocator,
    pub free_meta: RangeAllocator,
    pub live_data: RangeAllocator,
    pub live_meta: RangeAllocator,
}

/// Runs both recovery phases against an already-opened, already-mapped pool.
pub fn run(pool: &Pool, txlog: &TxLog) -> Result<RecoveredState> {
    replay_tx_log(pool, txlog)?;
    let (free_data, free_meta, live_data, live_meta) = scan_live_set(pool);
    info!(
        free_data = free_data.size(),
        free_meta = free_meta.size(),
        live_data = live_data.size(),
        live_meta = live_meta.size(),
        "recovery complete"
    );
    Ok(RecoveredState {
        free_data,
        free_meta,
        live_data,
        live_meta,
    })
}

/// Phase R1: walks every transaction slot once, redoing or undoing its
/// recorded entries depending on whether the slot committed, then resets the
/// slot to `EMPTY`.
fn replay_tx_log(pool: &Pool, txlog: &TxLog) -> Result<()> {
    let slot_count = txlog.slot_count();
    info!(slot_count, "phase R1: replaying transaction log");

    for slot_id in 1..=slot_count as u64 {
        let bytes = pool.tx_slot_bytes(slot_id);
        let mut view = TxSlotView::new(bytes, txlog.payload_cap());
        if view.status()? == TxStatus::Empty {
            continue;
        }

        let committed = view.is_committed();
        let entries = view.entries()?;
        debug!(
            slot_id,
            committed,
            entries = entries.len(),
            "replaying transaction slot"
        );
        replay_entries(pool, &entries, committed)?;

        view.reset();
        pool.persist(pool.tx_slot_offset(slot_id) as usize, txlog.slot_size() as usize)?;
    }
    Ok(())
}

/// Applies one slot's recorded entries directly to block bytes, matching
/// `execute`'s redo semantics when `committed` and `abort`'s undo semantics
/// otherwise. Does not touch any allocator: R2 rebuilds both from scratch.
fn replay_entries(pool: &Pool, entries: &[TxEntry], committed: bool) -> Result<()> {
    let val_offset = data_val_offset(pool.layout().max_key_len);
    let mut deferred: HashMap<BlockId, (u32, u32)> = HashMap::new();

    for entry in entries {
        match entry.kind {
            TxOpKind::Write => {
                if !committed {
                    zero_block(pool, entry.new_id)?;
                }
            }
            TxOpKind::Update => {
                let losing = if committed { entry.old_id } else { entry.new_id };
                zero_block(pool, losing)?;
            }
            TxOpKind::Remove => {
                if committed {
                    zero_block(pool, entry.old_id)?;
                }
            }
            TxOpKind::UpdInPlace => {
                if committed {
                    let bytes = pool.block_bytes(Region::Data, entry.old_id);
                    let mut view = BlockView::new(bytes);
                    view.write_raw_at(val_offset, entry.offset, &entry.payload);
                    let base = deferred
                        .entry(entry.old_id)
                        .or_insert_with(|| (view.version(), view.val_len()));
                    base.0 += 1;
                    base.1 = base.1.max(entry.offset + entry.size);
                }
            }
            TxOpKind::None => {}
        }
    }

    for (id, (version, val_len)) in deferred {
        let bytes = pool.block_bytes(Region::Data, id);
        let mut view = BlockView::new(bytes);
        view.set_version(version);
        view.set_val_len(val_len);
        view.install_checksum(val_offset);
        pool.persist(
            pool.byte_offset(Region::Data, id) as usize,
            pool.block_size(Region::Data) as usize,
        )?;
    }
    Ok(())
}

fn zero_block(pool: &Pool, id: BlockId) -> Result<()> {
    if id == 0 {
        return Ok(());
    }
    if let Some(region) = pool.classify(id) {
        BlockView::new(pool.block_bytes(region, id)).zero();
        pool.persist(
            pool.byte_offset(region, id) as usize,
            pool.block_size(region) as usize,
        )?;
    }
    Ok(())
}

/// Phase R2: scans every block id once, sharded across `num_cpus::get()`
/// worker threads (capped to the block count), and classifies it as live or
/// free purely from whether its stored checksum verifies.
fn scan_live_set(pool: &Pool) -> (RangeAllocator, RangeAllocator, RangeAllocator, RangeAllocator) {
    let data_nlba = pool.layout().data_nlba;
    let meta_nlba = pool.layout().meta_nlba;
    let total = data_nlba + meta_nlba;

    let free_data = RangeAllocator::empty();
    let free_meta = RangeAllocator::empty();
    let live_data = RangeAllocator::empty();
    let live_meta = RangeAllocator::empty();

    if total == 0 {
        return (free_data, free_meta, live_data, live_meta);
    }

    let shard_count = (num_cpus::get() as u64).clamp(1, total);
    let shard_len = (total + shard_count - 1) / shard_count;
    info!(total, shard_count, "phase R2: scanning live set");

    thread::scope(|scope| {
        for shard in 0..shard_count {
            let begin = 1 + shard * shard_len;
            if begin > total {
                break;
            }
            let end = ((shard + 1) * shard_len).min(total);
            let free_data = &free_data;
            let free_meta = &free_meta;
            let live_data = &live_data;
            let live_meta = &live_meta;
            scope.spawn(move || {
                for id in begin..=end {
                    let region = pool
                        .classify(id)
                        .expect("ids in [1, data_nlba+meta_nlba] always classify");
                    let bytes = pool.block_bytes(region, id);
                    let val_offset = match region {
                        Region::Data => data_val_offset(pool.layout().max_key_len),
                        Region::Meta => meta_val_offset(block::key_len_of(bytes)),
                    };
                    let (live, free) = match region {
                        Region::Data => (live_data, free_data),
                        Region::Meta => (live_meta, free_meta),
                    };
                    if block::is_live(bytes, val_offset) {
                        live.push(id);
                    } else {
                        free.push(id);
                    }
                }
            });
        }
    });

    (free_data, free_meta, live_data, live_meta)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PoolOptions;
    use crate::txlog::compute_tx_slot_size;
    use tempfile::tempdir;

    fn small_opts(dir: &std::path::Path) -> PoolOptions {
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
    fn empty_pool_scan_finds_no_live_blocks() {
        let dir = tempdir().unwrap();
        let opts = small_opts(dir.path());
        let pool = Pool::open(&opts).unwrap();
        let (free_data, free_meta, live_data, live_meta) = scan_live_set(&pool);
        assert_eq!(live_data.size(), 0);
        assert_eq!(live_meta.size(), 0);
        assert_eq!(free_data.size(), pool.block_count(Region::Data));
        assert_eq!(free_meta.size(), pool.block_count(Region::Meta));
    }

    #[test]
    fn scan_finds_one_installed_block() {
        let dir = tempdir().unwrap();
        let opts = small_opts(dir.path());
        let pool = Pool::open(&opts).unwrap();
        let max_key_len = pool.layout().max_key_len;
        let val_offset = data_val_offset(max_key_len);
        {
            let bytes = pool.block_bytes(Region::Data, 1);
            let mut view = BlockView::new(bytes);
            view.set_version(1);
            view.set_key_len(3);
            view.set_val_len(2);
            view.key_mut()[..3].copy_from_slice(b"abc");
            view.val_mut(val_offset)[..2].copy_from_slice(b"hi");
            view.install_checksum(val_offset);
        }
        let (free_data, _free_meta, live_data, _live_meta) = scan_live_set(&pool);
        assert_eq!(live_data.size(), 1);
        assert_eq!(free_data.size(), pool.block_count(Region::Data) - 1);
    }

    #[test]
    fn replay_redoes_committed_write() {
        let dir = tempdir().unwrap();
        let opts = small_opts(dir.path());
        let pool = Pool::open(&opts).unwrap();
        let tx_slot_size = compute_tx_slot_size(&opts);
        let txlog = TxLog::new(opts.tx_slots, tx_slot_size, opts.max_val_len);

        let max_key_len = pool.layout().max_key_len;
        let val_offset = data_val_offset(max_key_len);
        {
            let bytes = pool.block_bytes(Region::Data, 1);
            let mut view = BlockView::new(bytes);
            view.set_version(1);
            view.set_key_len(3);
            view.set_val_len(2);
            view.key_mut()[..3].copy_from_slice(b"abc");
            view.val_mut(val_offset)[..2].copy_from_slice(b"hi");
            view.install_checksum(val_offset);
        }

        let slot_id = txlog.acquire_slot().unwrap();
        {
            let bytes = pool.tx_slot_bytes(slot_id);
            let mut handle = crate::txlog::TxHandle::begin(slot_id, bytes, txlog.payload_cap());
            handle.record(TxEntry::write(1)).unwrap();
            handle.commit().unwrap();
            // Deliberately dropped without `execute`, simulating a crash.
        }

        replay_tx_log(&pool, &txlog).unwrap();
        let bytes = pool.block_bytes(Region::Data, 1);
        assert!(block::is_live(bytes, val_offset));
        let slot_bytes = pool.tx_slot_bytes(slot_id);
        let view = TxSlotView::new(slot_bytes, txlog.payload_cap());
        assert_eq!(view.status().unwrap(), crate::txlog::TxStatus::Empty);
    }
}
