//! # keel-cache: set-associative caching for hot-path lookups
//!
//! A fixed-capacity, power-of-two set-associative cache with CLOCK
//! second-chance eviction, designed for single-owner use on hot paths:
//!
//! - No allocation and no failure after construction
//! - Bit-packed per-slot age counters and per-set clock hands, so the
//!   metadata for a whole set fits in a handful of cache lines
//! - Short hash tags that short-circuit most key comparisons
//!
//! ## Key components
//!
//! - [`SetAssociativeCache`]: the cache itself
//! - [`CacheContext`]: binds key/value types, key extraction, and hashing
//! - [`PackedIntArray`]: the bit-packed backing store for counters and
//!   clock hands
//!
//! ## Example
//!
//! ```
//! use keel_cache::{CacheContext, SetAssociativeCache};
//!
//! struct Squares;
//!
//! impl CacheContext for Squares {
//!     type Key = u64;
//!     type Value = [u64; 2];
//!
//!     fn key_from_value(value: &[u64; 2]) -> u64 {
//!         value[0]
//!     }
//!
//!     fn hash(key: u64) -> u64 {
//!         // Identity hashing is fine for dense keys; real embedders
//!         // supply a mixing hash.
//!         key
//!     }
//! }
//!
//! let mut cache = SetAssociativeCache::<Squares>::new(4096);
//! cache.put([12, 144]);
//! assert_eq!(cache.get(12), Some(&[12, 144]));
//! assert_eq!(cache.get(13), None);
//! ```

pub mod cache;
pub mod packed;

pub use cache::{CacheContext, Metrics, PutKind, PutResult, SetAssociativeCache, Tag};
pub use packed::PackedIntArray;
