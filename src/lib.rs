//! A lock-free, cache-line-aware concurrent hash table.
//!
//! `scalemap` provides [`Map`], a concurrent hash table that grows by
//! incremental migration instead of stopping the world: once a generation's
//! slots approach capacity, a larger successor is allocated and every thread
//! that subsequently touches the table helps copy a slice of slots into it,
//! a few at a time, until the old generation is empty and retired.
//!
//! # Overview
//!
//! A [`Map`] stores key/value pairs keyed by any type implementing
//! [`Payload`] — unsigned integers directly, `Box<T>` for arbitrary owned
//! types. Reads and writes never block on a global lock; the only mutex in
//! the whole design guards the once-per-generation decision to allocate a
//! successor.
//!
//! # Usage
//!
//! ```
//! use scalemap::Map;
//!
//! let map: Map<u64, u64> = Map::new();
//!
//! assert!(map.put_if_absent(1, 100));
//! assert_eq!(map.get(&1), Some(100));
//! assert!(!map.put_if_absent(1, 200));
//! assert!(map.put_if_exists(1, 200));
//! assert_eq!(map.get(&1), Some(200));
//! assert!(map.delete(1));
//! assert_eq!(map.get(&1), None);
//! ```
//!
//! # Configuration
//!
//! Initial size and target load factor are runtime values, validated and
//! clamped by [`Config`]:
//!
//! ```
//! use scalemap::Config;
//!
//! let map = Config::new().initial_size(1024).density(0.6).build::<u64, u64>();
//! assert_eq!(map.size(), 0);
//! ```
//!
//! # Concurrency
//!
//! Every operation on [`Map`] is thread-safe and lock-free outside the
//! successor-allocation mutex. Multiple threads can concurrently put, get,
//! and delete without blocking each other.
//!
//! ```no_run
//! use scalemap::Map;
//! use std::sync::Arc;
//! use std::thread;
//!
//! let map: Arc<Map<u64, u64>> = Arc::new(Map::new());
//!
//! let handles: Vec<_> = (0..4)
//!   .map(|thread_id| {
//!     let map = Arc::clone(&map);
//!     thread::spawn(move || {
//!       for i in 0..100 {
//!         map.put(thread_id * 1000 + i, i);
//!       }
//!       map.forget_thread();
//!     })
//!   })
//!   .collect();
//!
//! for handle in handles {
//!   handle.join().unwrap();
//! }
//! ```
//!
//! ## Memory Reclamation
//!
//! Retired generations are reclaimed through a hand-rolled epoch scheme: each
//! thread that touches a map claims a guard record from the map's internal
//! guard list, publishing the oldest generation it might still be
//! dereferencing. A generation is only freed once every claimed record has
//! moved past it.
//!
//! # Memory Layout
//!
//! Guard records and per-generation counters are cache-line padded to avoid
//! false sharing between threads pinning concurrently, and slot storage is
//! allocated on a cache line boundary.
//!
//! # Non-goals
//!
//! Ordered iteration, persistence, cryptographic hashing, shrinking on
//! delete, multi-key transactions, and wait-freedom are all out of scope.
//! [`Map::iter`] is a weakly-consistent, single-threaded snapshot, not an
//! ordered traversal.

mod alloc;
mod array;
mod condition;
mod config;
mod guard;
mod iter;
mod map;
mod padded;
mod payload;
mod sentinel;
mod sync;
mod table;

pub use self::condition::Condition;
pub use self::config::Config;
pub use self::config::Density;
pub use self::iter::Iter;
pub use self::map::Map;
pub use self::map::ScopedPin;
pub use self::payload::Payload;
pub use self::sentinel::Pointer;
pub use self::sentinel::Sentinel;
pub use self::sentinel::Word;
