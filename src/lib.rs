#![deny(missing_docs, clippy::all)]

//! Fixed-capacity sharded lock-free map.
//!
//! # [`LockFreeMap`]
//! A concurrent map from string keys to values of a single type. Keys are routed to a fixed
//! number of shards, and each shard is a singly linked chain of entries modified solely
//! through compare-and-swap operations. Memory of deleted entries is reclaimed by the
//! epoch-based collector of [`sdd`].
//!
//! ```
//! use lfm::LockFreeMap;
//!
//! let map: LockFreeMap<u64> = LockFreeMap::new(4);
//! map.store("a", 1);
//! map.store("b", 2);
//! assert_eq!(map.load("a"), Some(1));
//! assert!(map.delete("a"));
//! assert!(map.load("a").is_none());
//! assert_eq!(map.len(), 1);
//! ```
//!
//! # Features
//!
//! * `loom`: runs the reclamation layer on [`loom`](https://crates.io/crates/loom) primitives.
//! * `serde`: implements `Serialize` and `Deserialize` for [`LockFreeMap`].
//! * `tracing`: emits diagnostic events on construction and on contended paths.

/// Emits a [`tracing`](https://crates.io/crates/tracing) event if the `tracing` feature is
/// enabled.
#[cfg(feature = "tracing")]
macro_rules! trace_event {
    ($level:ident, $($arg:tt)+) => {
        tracing::$level!($($arg)+)
    };
}

/// Emits a [`tracing`](https://crates.io/crates/tracing) event if the `tracing` feature is
/// enabled.
#[cfg(not(feature = "tracing"))]
macro_rules! trace_event {
    ($level:ident, $($arg:tt)+) => {};
}

mod chain;
mod router;

pub mod lock_free_map;
pub use lock_free_map::{LockFreeMap, DEFAULT_NUM_SHARDS};

pub use sdd::Guard;

#[cfg(feature = "serde")]
mod serde;

#[cfg(test)]
mod tests;
