//! Error type shared by the pool allocator and the cache.

use thiserror::Error;

/// Failure modes of [`crate::pool::PoolAllocator::allocate`] and of cache
/// construction through it.
///
/// Deallocation and cache eviction have no recoverable failure modes of
/// their own (see the crate-level docs); misuse there is a programming
/// error and is caught with `debug_assert!` rather than reported here.
#[derive(Debug, Error, PartialEq, Eq, Clone, Copy)]
pub enum AllocError {
    /// No free leaf of sufficient power exists in the tree right now.
    #[error("out of memory: no free block of power >= {target_power} for a {requested}-byte request")]
    OutOfMemory {
        requested: usize,
        target_power: u32,
    },

    /// The request can never be satisfied by this allocator, regardless of
    /// fragmentation: it exceeds the whole arena.
    #[error("request of {requested} bytes exceeds the arena (2^{max_p} bytes)")]
    RequestTooLarge { requested: usize, max_p: u32 },
}
