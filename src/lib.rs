//! An embedded, crash-consistent key-value storage engine over a single
//! memory-mapped file.
//!
//! Callers open a [`Store`], begin a [`TxHandle`] transaction, issue
//! [`Store::put`]/[`Store::put_meta`]/[`Store::delete`] against it, then
//! [`Store::commit`] and [`Store::execute`] (or [`Store::abort`]).
//! Durability comes from per-block checksums, a small fixed array of
//! transaction slots recorded in the mapped file, and a recovery pass that
//! rebuilds the free/live id sets on reopen.
//!
//! ```no_run
//! use pmstore::{PoolOptions, Store, PutRequest, Region};
//!
//! # fn main() -> pmstore::Result<()> {
//! let store = Store::open(PoolOptions::new("/tmp/example.pool"))?;
//! let mut tx = store.tx_begin()?;
//! let id = store.put(&mut tx, PutRequest::new(b"key", b"value"))?;
//! store.commit(&mut tx)?;
//! store.execute(tx)?;
//!
//! let pair = store.get(id)?;
//! assert_eq!(pair.val, b"value");
//! assert_eq!(store.nfree(Region::Data), store.ntotal(Region::Data) - 1);
//! # Ok(())
//! # }
//! ```

mod block;
mod config;
mod error;
mod layout;
mod pool;
mod range;
mod recovery;
mod store;
mod txlog;

pub use block::{BlockId, Region};
pub use config::{PoolOptions, SyncMode, DEFAULT_TX_SLOTS, DEFAULT_THSYNC_INTERVAL, MAX_TX_SLOTS, MIN_POOL_SIZE};
pub use error::{Error, Result, STATUS_OK};
pub use store::{LiveIter, Pair, PutRequest, Store};
pub use txlog::{TxHandle, TxStatus};
