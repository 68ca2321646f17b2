//! Buddy system pool allocator.
//!
//! [`PoolAllocator`] carves a single fixed-size byte arena into power-of-two
//! blocks. Blocks are tracked by a binary split tree stored flat in a
//! `Vec`, indexed by [`NodeId`] rather than linked through parent/child
//! pointers, the same arena-and-index discipline this crate's earlier
//! lock-free tree used for its node slots, just without the atomics: there
//! is exactly one writer, so a plain `&mut self` and ordinary recursion
//! stand in for the CAS loops.

use std::alloc::{self, Layout};
use std::ptr::NonNull;

use crate::error::AllocError;

/// Index of a node in the flat tree arena. The root is always `NodeId(0)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct NodeId(u32);

impl NodeId {
    const ROOT: NodeId = NodeId(0);

    #[inline]
    fn index(self) -> usize {
        self.0 as usize
    }
}

/// A node in the split tree. No parent link is stored: callers reconstruct
/// the path to a node by walking down from the root, carrying `(power,
/// offset)` as they go, and let recursion unwind to walk back up when
/// coalescing.
#[derive(Debug, Clone, Copy)]
enum Node {
    Leaf { used: bool },
    Internal { left: NodeId, right: NodeId },
}

/// Flat, index-addressed storage for tree nodes, with a free list so that
/// coalesced internal nodes and their retired leaf children can be recycled
/// instead of growing the backing `Vec` forever.
#[derive(Debug)]
struct Tree {
    nodes: Vec<Node>,
    free: Vec<NodeId>,
}

impl Tree {
    fn new() -> Self {
        Tree {
            nodes: vec![Node::Leaf { used: false }],
            free: Vec::new(),
        }
    }

    #[inline]
    fn get(&self, id: NodeId) -> Node {
        self.nodes[id.index()]
    }

    #[inline]
    fn set(&mut self, id: NodeId, node: Node) {
        self.nodes[id.index()] = node;
    }

    fn alloc_slot(&mut self, node: Node) -> NodeId {
        if let Some(id) = self.free.pop() {
            self.set(id, node);
            id
        } else {
            self.nodes.push(node);
            NodeId((self.nodes.len() - 1) as u32)
        }
    }

    fn free_slot(&mut self, id: NodeId) {
        self.free.push(id);
    }
}

/// Owned, fixed-size backing storage for the arena, allocated with an
/// explicit alignment rather than through `Vec<u8>` (which only promises
/// byte alignment).
///
/// Cached objects are placed at `base + offset`, and `offset` is always a
/// multiple of `2^min_p`; that only bounds the absolute alignment of
/// `base + offset` if `base` itself is aligned to `2^min_p`. Allocating the
/// buffer at that alignment is what makes "raise `min_p` to cover a type's
/// alignment" (see [`crate::cache::ObjectAllocator`]) an actual fix rather
/// than advice that cannot be acted on.
struct Arena {
    ptr: NonNull<u8>,
    layout: Layout,
}

impl Arena {
    fn new(size: usize, align: usize) -> Self {
        let layout = Layout::from_size_align(size, align)
            .expect("arena size/alignment must form a valid Layout");

        // SAFETY: `layout` has non-zero size, since `size == 1 << max_p`
        // with `max_p >= min_p >= 1`.
        let raw = unsafe { alloc::alloc_zeroed(layout) };
        let ptr = NonNull::new(raw).unwrap_or_else(|| alloc::handle_alloc_error(layout));

        Arena { ptr, layout }
    }

    fn as_ptr(&self) -> *const u8 {
        self.ptr.as_ptr()
    }

    fn as_mut_ptr(&mut self) -> *mut u8 {
        self.ptr.as_ptr()
    }

    fn len(&self) -> usize {
        self.layout.size()
    }
}

impl Drop for Arena {
    fn drop(&mut self) {
        // SAFETY: `ptr`/`layout` are exactly what `alloc_zeroed` returned in
        // `new`, and `Arena` is the sole owner of this allocation.
        unsafe { alloc::dealloc(self.ptr.as_ptr(), self.layout) };
    }
}

impl std::fmt::Debug for Arena {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Arena")
            .field("size", &self.layout.size())
            .field("align", &self.layout.align())
            .finish()
    }
}

/// Single-threaded buddy system allocator over a fixed `2^max_p`-byte
/// arena.
///
/// `min_p` is the smallest block power served (requests are rounded up to
/// it); `max_p` is the power of the whole arena. See the crate-level docs
/// for the invariants this type upholds between public calls.
#[derive(Debug)]
pub struct PoolAllocator {
    arena: Arena,
    tree: Tree,
    min_p: u32,
    max_p: u32,
}

impl PoolAllocator {
    /// Creates a new allocator over a freshly-allocated `2^max_p`-byte
    /// arena, starting out as a single free block.
    ///
    /// # Panics
    ///
    /// Panics (via `debug_assert!` in debug builds) if `min_p == 0`,
    /// `min_p > max_p`, or `max_p` is not less than the machine word
    /// width (these are caller preconditions, not runtime failures).
    pub fn new(min_p: u32, max_p: u32) -> Self {
        debug_assert!(min_p > 0, "min_p must be at least 1");
        debug_assert!(min_p <= max_p, "min_p must not exceed max_p");
        debug_assert!(
            (max_p as usize) < usize::BITS as usize,
            "max_p must be smaller than the machine word width"
        );

        let size = 1usize << max_p;
        let align = 1usize << min_p;
        log::debug!("creating pool allocator: {size} byte arena (min_p={min_p}, max_p={max_p})");

        PoolAllocator {
            arena: Arena::new(size, align),
            tree: Tree::new(),
            min_p,
            max_p,
        }
    }

    /// Total size of the arena in bytes.
    pub fn capacity(&self) -> usize {
        self.arena.len()
    }

    pub fn min_p(&self) -> u32 {
        self.min_p
    }

    pub fn max_p(&self) -> u32 {
        self.max_p
    }

    fn upper_power(n: usize) -> u32 {
        n.max(1).next_power_of_two().trailing_zeros()
    }

    /// Allocates a block able to hold `n` bytes (rounded up to a power of
    /// two no smaller than `2^min_p`), returning a pointer into the arena.
    ///
    /// `n == 0` is treated as `n == 1`.
    pub fn allocate(&mut self, n: usize) -> Result<NonNull<u8>, AllocError> {
        let target_power = Self::upper_power(n).max(self.min_p);

        if target_power > self.max_p {
            log::debug!("allocate({n}) too large for a 2^{} arena", self.max_p);
            return Err(AllocError::RequestTooLarge {
                requested: n,
                max_p: self.max_p,
            });
        }

        let (mut id, mut power, offset) = self
            .find_best(NodeId::ROOT, self.max_p, 0, target_power)
            .ok_or(AllocError::OutOfMemory {
                requested: n,
                target_power,
            })?;

        while power > target_power {
            id = self.split(id, offset);
            power -= 1;
        }

        self.tree.set(id, Node::Leaf { used: true });
        log::trace!("allocated {n} bytes at offset {offset} (power {target_power})");

        // SAFETY: `offset` was derived from a leaf that tiles `[0, 2^max_p)`,
        // so it is within `self.arena`.
        let ptr = unsafe { self.arena.as_mut_ptr().add(offset) };
        Ok(unsafe { NonNull::new_unchecked(ptr) })
    }

    /// Searches for the smallest free leaf whose power is `>= k`, biasing
    /// toward an exact match and, failing that, toward the globally
    /// smallest sufficient free block (not merely "whichever subtree has
    /// any candidate").
    fn find_best(
        &self,
        id: NodeId,
        power: u32,
        offset: usize,
        k: u32,
    ) -> Option<(NodeId, u32, usize)> {
        if power < k {
            return None;
        }

        match self.tree.get(id) {
            Node::Leaf { used } => {
                if used {
                    None
                } else {
                    Some((id, power, offset))
                }
            }
            Node::Internal { left, right } => {
                let half = 1usize << (power - 1);

                let lo = self.find_best(left, power - 1, offset, k);
                if matches!(lo, Some((_, p, _)) if p == k) {
                    return lo;
                }

                let ro = self.find_best(right, power - 1, offset + half, k);
                if matches!(ro, Some((_, p, _)) if p == k) {
                    return ro;
                }

                match (lo, ro) {
                    (Some(l), Some(r)) => Some(if l.1 <= r.1 { l } else { r }),
                    (Some(l), None) => Some(l),
                    (None, Some(r)) => Some(r),
                    (None, None) => None,
                }
            }
        }
    }

    /// Splits the free leaf at `id` (covering `offset`) into an internal
    /// node with two free leaf children one power lower, and returns the
    /// id of the left child.
    fn split(&mut self, id: NodeId, offset: usize) -> NodeId {
        debug_assert!(
            matches!(self.tree.get(id), Node::Leaf { used: false }),
            "split() requires a free leaf"
        );

        let left = self.tree.alloc_slot(Node::Leaf { used: false });
        let right = self.tree.alloc_slot(Node::Leaf { used: false });
        self.tree.set(id, Node::Internal { left, right });

        log::trace!("split block at offset {offset}");
        left
    }

    /// Releases a pointer previously returned by [`Self::allocate`] and not
    /// already deallocated. Passing any other pointer is undefined
    /// behavior; debug builds catch the common mistakes with
    /// `debug_assert!`.
    pub fn deallocate(&mut self, ptr: NonNull<u8>) {
        let base = self.arena.as_ptr();
        // SAFETY: caller guarantees `ptr` was handed out by `allocate` on
        // this arena.
        let offset = unsafe { ptr.as_ptr().offset_from(base) };
        debug_assert!(offset >= 0, "pointer does not belong to this arena");
        let offset = offset as usize;
        debug_assert!(offset < self.arena.len(), "pointer out of arena bounds");

        log::trace!("deallocating block at offset {offset}");
        self.dealloc_rec(NodeId::ROOT, self.max_p, 0, offset);
    }

    fn dealloc_rec(&mut self, id: NodeId, power: u32, offset: usize, target: usize) {
        match self.tree.get(id) {
            Node::Leaf { used } => {
                debug_assert_eq!(offset, target, "offset/leaf mismatch during deallocate");
                debug_assert!(used, "double free of block at offset {offset}");
                self.tree.set(id, Node::Leaf { used: false });
            }
            Node::Internal { left, right } => {
                let half = 1usize << (power - 1);
                if target >= offset + half {
                    self.dealloc_rec(right, power - 1, offset + half, target);
                } else {
                    self.dealloc_rec(left, power - 1, offset, target);
                }
                self.try_coalesce(id, left, right, offset);
            }
        }
    }

    fn try_coalesce(&mut self, id: NodeId, left: NodeId, right: NodeId, offset: usize) {
        let both_free = matches!(self.tree.get(left), Node::Leaf { used: false })
            && matches!(self.tree.get(right), Node::Leaf { used: false });

        if both_free {
            self.tree.free_slot(left);
            self.tree.free_slot(right);
            self.tree.set(id, Node::Leaf { used: false });
            log::trace!("coalesced siblings back into block at offset {offset}");
        }
    }

    /// `true` once the arena has coalesced back to a single free block,
    /// used by tests to check the round-trip invariants in the crate's
    /// property tests.
    #[cfg(test)]
    fn is_pristine(&self) -> bool {
        matches!(self.tree.get(NodeId::ROOT), Node::Leaf { used: false })
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn exact_fit_round_trip() {
        // S1: min_p=4, max_p=10 (1 KiB arena, 16-byte minimum).
        let mut pool = PoolAllocator::new(4, 10);
        let p1 = pool.allocate(16).unwrap();
        assert_eq!(unsafe { p1.as_ptr().offset_from(pool.arena.as_ptr()) }, 0);

        pool.deallocate(p1);
        assert!(pool.is_pristine());
    }

    #[test]
    fn fragmentation_scenario() {
        // S2: min_p=1, max_p=3 (8-byte arena).
        let mut pool = PoolAllocator::new(1, 3);
        let base = pool.arena.as_ptr();

        let p1 = pool.allocate(4).unwrap();
        assert_eq!(unsafe { p1.as_ptr().offset_from(base) }, 0);

        let p2 = pool.allocate(2).unwrap();
        assert_eq!(unsafe { p2.as_ptr().offset_from(base) }, 4);

        let p3 = pool.allocate(2).unwrap();
        assert_eq!(unsafe { p3.as_ptr().offset_from(base) }, 6);

        assert_eq!(
            pool.allocate(1),
            Err(AllocError::OutOfMemory {
                requested: 1,
                target_power: 1
            })
        );

        pool.deallocate(p2);
        pool.deallocate(p3);
        pool.deallocate(p1);

        assert!(pool.is_pristine());
    }

    #[test]
    fn lifo_round_trip_restores_initial_state() {
        let mut pool = PoolAllocator::new(2, 6);
        let mut ptrs = Vec::new();

        for _ in 0..8 {
            ptrs.push(pool.allocate(4).unwrap());
        }

        while let Some(p) = ptrs.pop() {
            pool.deallocate(p);
        }

        assert!(pool.is_pristine());
    }

    #[test]
    fn arbitrary_order_round_trip_restores_initial_state() {
        let mut pool = PoolAllocator::new(2, 6);
        let mut ptrs = Vec::new();

        for _ in 0..8 {
            ptrs.push(pool.allocate(4).unwrap());
        }

        // Free in a non-LIFO order.
        for i in [3, 0, 7, 1, 6, 2, 5, 4] {
            pool.deallocate(ptrs[i]);
        }

        assert!(pool.is_pristine());
    }

    #[test]
    fn monotone_failure() {
        let mut pool = PoolAllocator::new(1, 3);
        let _p1 = pool.allocate(4).unwrap();
        let _p2 = pool.allocate(2).unwrap();
        let _p3 = pool.allocate(2).unwrap();

        assert!(pool.allocate(1).is_err());
        // No deallocate happened: any request of size >= 1 still fails.
        assert!(pool.allocate(2).is_err());
        assert!(pool.allocate(8).is_err());
    }

    #[test]
    fn zero_sized_request_rounds_up_to_one() {
        let mut pool = PoolAllocator::new(1, 3);
        let p0 = pool.allocate(0).unwrap();
        let p1 = pool.allocate(1).unwrap();
        assert_ne!(p0.as_ptr(), p1.as_ptr());
    }

    #[test]
    fn request_larger_than_arena_fails() {
        let mut pool = PoolAllocator::new(1, 3);
        assert_eq!(
            pool.allocate(1 << 10),
            Err(AllocError::RequestTooLarge {
                requested: 1 << 10,
                max_p: 3
            })
        );
    }
}
