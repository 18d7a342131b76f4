//! chainstore: an embedded crash-consistent key/value storage engine.
//!
//! chainstore is a single-writer store built for blockchain client workloads:
//!
//! - **Fixed-size keys**: each index declares its key width up front
//! - **Multiple indexes**: independent order-64 B-trees over one value heap
//! - **Two-level overlay**: mutations buffer in memory (current, then
//!   staged) and reach disk in batched atomic commits
//! - **Pre-image journal**: every commit can be rolled back after a crash
//! - **Space reuse**: freed value sections feed later allocations; values
//!   are never moved or compacted
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────┐
//! │                 Store API                    │
//! │  (open, write, read, remove, rename, range) │
//! └────────────────┬────────────────────────────┘
//!                  │
//! ┌────────────────▼────────────────────────────┐
//! │            Transaction Overlay               │
//! │      (current level, staged level)          │
//! └────────────────┬────────────────────────────┘
//!                  │
//! ┌────────────────▼───────────┬────────────────┐
//! │       B-Tree Indexes       │   Value Heap   │
//! │  (find, insert, tombstone) │  + Free List   │
//! └────────────────┬───────────┴────────────────┘
//!                  │
//! ┌────────────────▼────────────────────────────┐
//! │         Pager + Commit Journal               │
//! │   (positional I/O, pre-image recording)     │
//! └─────────────────────────────────────────────┘
//! ```
//!
//! ## Quick Start
//!
//! ```no_run
//! use chainstore::{Store, StoreConfig};
//!
//! let store = Store::open("./chain-data", StoreConfig::default())?;
//! let txs = store.load_index(1, 32, 1 << 20)?;
//!
//! store.write(txs, &[0u8; 32], b"raw transaction")?;
//! store.stage()?;
//! store.commit()?;
//!
//! assert!(store.read(txs, &[0u8; 32])?.is_some());
//! # Ok::<(), chainstore::Error>(())
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]
#![warn(clippy::all)]
// All unwraps in this crate are infallible:
// - try_into().unwrap() on slices with pre-validated sizes
// - pop().unwrap() on vectors whose length was just established
#![allow(clippy::disallowed_methods)]

mod btree;
pub mod db;
pub mod error;
mod free_list;
mod journal;
mod overlay;
mod pager;
pub mod range;
mod types;

pub use db::{Store, StoreConfig};
pub use error::{Error, Result};
pub use range::RangeCursor;
pub use types::{IndexId, OVERWRITE};
