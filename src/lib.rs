//! A single-threaded buddy system pool allocator, and a bounded
//! second-chance (clock) object cache built on top of it.
//!
//! The two pieces compose leaves-first: [`cache::Cache`] asks a pluggable
//! allocator capability (for example [`pool::PoolAllocator`]) to construct
//! and destroy the objects it stores, but the allocator itself has no
//! knowledge of the cache.
//!
//! Neither type provides internal synchronization; wrap them in your own
//! mutual exclusion if you need to share one across threads.

mod cache;
mod error;
mod pool;

pub use cache::{ArenaHandle, Cache, FromKey, KeyProvider, ObjectAllocator};
pub use error::AllocError;
pub use pool::PoolAllocator;
