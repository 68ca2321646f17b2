//! Bounded, second-chance (clock) object cache.
//!
//! [`Cache`] maps keys to previously constructed objects. On a miss it asks
//! a pluggable [`ObjectAllocator`] to construct the object; when the cache
//! is full it evicts with a single-bit clock sweep before inserting. The
//! cache never inspects the concrete type of what it stores; every entry
//! is reached through a small hand-rolled vtable (the "tagged-variant enum
//! or vtable-style dispatch" the allocator capability's doc calls for),
//! the same flavor of dispatch `core::task::RawWaker` uses, so no unstable
//! `CoerceUnsized` machinery is needed to erase the concrete type.

use std::any::TypeId;
use std::collections::VecDeque;
use std::fmt;
use std::ptr::NonNull;

use crate::error::AllocError;
use crate::pool::PoolAllocator;

/// Capability for comparing a constructed object against a candidate key.
///
/// Every type stored in a [`Cache`] must implement this for the cache's key
/// type `K`.
pub trait KeyProvider<K> {
    /// Does `self` describe `key`?
    fn matches(&self, key: &K) -> bool;
}

/// Capability for constructing a value of `Self` from a reference to the
/// key it will be stored under. Paired with [`ObjectAllocator::create`] to
/// answer `spec`'s "construct<T>(key)".
pub trait FromKey<K> {
    fn from_key(key: &K) -> Self;
}

/// Manual vtable for a type-erased cached object. Function pointers are
/// always `Copy` regardless of `K`, so this (and [`ArenaHandle`]) can be
/// `Copy`/plain-data without requiring `K: Copy`.
struct ObjectVTable<K> {
    matches: unsafe fn(*const u8, &K) -> bool,
    drop_in_place: unsafe fn(*mut u8),
    fmt: unsafe fn(*const u8, &mut fmt::Formatter<'_>) -> fmt::Result,
    type_id: fn() -> TypeId,
}

impl<K> Clone for ObjectVTable<K> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<K> Copy for ObjectVTable<K> {}

unsafe fn matches_impl<K, T: KeyProvider<K>>(ptr: *const u8, key: &K) -> bool {
    (*(ptr as *const T)).matches(key)
}

unsafe fn drop_impl<T>(ptr: *mut u8) {
    std::ptr::drop_in_place(ptr as *mut T);
}

unsafe fn fmt_impl<T: fmt::Display>(ptr: *const u8, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    fmt::Display::fmt(&*(ptr as *const T), f)
}

fn type_id_impl<T: 'static>() -> TypeId {
    TypeId::of::<T>()
}

impl<K> ObjectVTable<K> {
    fn new<T>() -> Self
    where
        T: KeyProvider<K> + fmt::Display + 'static,
    {
        ObjectVTable {
            matches: matches_impl::<K, T>,
            drop_in_place: drop_impl::<T>,
            fmt: fmt_impl::<T>,
            type_id: type_id_impl::<T>,
        }
    }
}

/// A type-erased handle to an object constructed by an [`ObjectAllocator`]
/// and owned by whoever holds this handle. There is no `Drop` impl: lifetime
/// is managed explicitly through [`ObjectAllocator::destroy`], mirroring the
/// "cache delegates destruction to the allocator" contract instead of
/// Rust's usual drop-on-scope-exit.
pub struct ArenaHandle<K> {
    ptr: NonNull<u8>,
    vtable: ObjectVTable<K>,
}

impl<K> ArenaHandle<K> {
    fn matches(&self, key: &K) -> bool {
        unsafe { (self.vtable.matches)(self.ptr.as_ptr(), key) }
    }

    fn downcast_ref<T: 'static>(&self) -> Option<&T> {
        if (self.vtable.type_id)() == TypeId::of::<T>() {
            Some(unsafe { &*(self.ptr.as_ptr() as *const T) })
        } else {
            None
        }
    }
}

impl<K> fmt::Display for ArenaHandle<K> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        unsafe { (self.vtable.fmt)(self.ptr.as_ptr(), f) }
    }
}

/// The allocator capability the cache is generic over: construct an object
/// of a chosen concrete type bound to a key, and destroy it again later.
///
/// [`PoolAllocator`] is the reference implementation, placing each object
/// directly in its buddy-managed arena.
pub trait ObjectAllocator<K> {
    fn create<T>(&mut self, key: &K) -> Result<ArenaHandle<K>, AllocError>
    where
        T: KeyProvider<K> + FromKey<K> + fmt::Display + 'static;

    fn destroy(&mut self, handle: ArenaHandle<K>);
}

impl<K> ObjectAllocator<K> for PoolAllocator {
    fn create<T>(&mut self, key: &K) -> Result<ArenaHandle<K>, AllocError>
    where
        T: KeyProvider<K> + FromKey<K> + fmt::Display + 'static,
    {
        let size = std::mem::size_of::<T>().max(1);
        let ptr = self.allocate(size)?;

        debug_assert!(
            (ptr.as_ptr() as usize) % std::mem::align_of::<T>() == 0,
            "pool block under-aligned for this type; raise min_p to cover its alignment"
        );

        // SAFETY: `ptr` points at a freshly-allocated, big-enough, used
        // block that nothing else observes yet.
        unsafe {
            ptr.as_ptr().cast::<T>().write(T::from_key(key));
        }

        Ok(ArenaHandle {
            ptr,
            vtable: ObjectVTable::new::<T>(),
        })
    }

    fn destroy(&mut self, handle: ArenaHandle<K>) {
        // SAFETY: `handle.ptr` was constructed by `create` above and is
        // still live (the cache never destroys the same handle twice).
        unsafe {
            (handle.vtable.drop_in_place)(handle.ptr.as_ptr());
        }
        self.deallocate(handle.ptr);
    }
}

struct CacheEntry<K> {
    handle: ArenaHandle<K>,
    recently_used: bool,
}

/// Bounded cache of capacity `N`, keyed by `K`, backed by allocator
/// capability `A`.
///
/// Entries are kept in a most-recent-first order list. On a miss at
/// capacity, entries are evicted with a second-chance (clock) sweep: an
/// entry with its recently-used bit set survives one sweep (the bit is
/// cleared and it moves to the front) before becoming eligible again.
pub struct Cache<K, A: ObjectAllocator<K>> {
    capacity: usize,
    backend: A,
    entries: VecDeque<CacheEntry<K>>,
}

impl<K, A: ObjectAllocator<K>> Cache<K, A> {
    /// Creates an empty cache of the given capacity, taking ownership of
    /// an already-constructed allocator capability.
    pub fn new(capacity: usize, backend: A) -> Self {
        debug_assert!(capacity >= 1, "cache capacity must be at least 1");
        Cache {
            capacity,
            backend,
            entries: VecDeque::new(),
        }
    }

    pub fn size(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Looks up `key`. On a hit, marks the entry recently-used and moves it
    /// to the front. On a miss, evicts (if at capacity) and constructs a
    /// fresh `T` bound to `key` through the allocator capability.
    pub fn get<T>(&mut self, key: &K) -> Result<&T, AllocError>
    where
        T: KeyProvider<K> + FromKey<K> + fmt::Display + 'static,
    {
        if let Some(pos) = self.entries.iter().position(|e| e.handle.matches(key)) {
            log::trace!("cache hit");
            let mut entry = self
                .entries
                .remove(pos)
                .expect("position came from this same deque");
            entry.recently_used = true;
            self.entries.push_front(entry);
        } else {
            log::trace!("cache miss");
            while self.entries.len() >= self.capacity {
                self.evict_one();
            }

            let handle = self.backend.create::<T>(key)?;
            self.entries.push_front(CacheEntry {
                handle,
                recently_used: false,
            });
        }

        let front = self
            .entries
            .front()
            .expect("an entry was just inserted or promoted to the front");

        Ok(front.handle.downcast_ref::<T>().expect(
            "get::<T> must be called with the same T used to construct this key's entry",
        ))
    }

    /// One step of the second-chance sweep: give the back entry a second
    /// chance if its bit is set, otherwise destroy and drop it.
    fn evict_one(&mut self) {
        let back_is_recently_used = self
            .entries
            .back()
            .expect("evict_one is only called while at capacity")
            .recently_used;

        let mut entry = self
            .entries
            .pop_back()
            .expect("evict_one is only called while at capacity");

        if back_is_recently_used {
            entry.recently_used = false;
            log::debug!("second chance: sparing entry, clearing its bit");
            self.entries.push_front(entry);
        } else {
            log::debug!("evicting entry");
            self.backend.destroy(entry.handle);
        }
    }

    /// Writes every entry, front-to-back, separated by single spaces.
    pub fn print<W: fmt::Write>(&self, out: &mut W) -> fmt::Result {
        let mut first = true;
        for entry in &self.entries {
            if !first {
                write!(out, " ")?;
            }
            write!(out, "{}", entry.handle)?;
            first = false;
        }
        Ok(())
    }
}

impl<K, A: ObjectAllocator<K>> fmt::Display for Cache<K, A> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.print(f)
    }
}

impl<K, A: ObjectAllocator<K>> Drop for Cache<K, A> {
    fn drop(&mut self) {
        while let Some(entry) = self.entries.pop_back() {
            self.backend.destroy(entry.handle);
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[derive(Debug)]
    struct Val {
        key: i32,
    }

    impl KeyProvider<i32> for Val {
        fn matches(&self, key: &i32) -> bool {
            self.key == *key
        }
    }

    impl FromKey<i32> for Val {
        fn from_key(key: &i32) -> Self {
            Val { key: *key }
        }
    }

    impl fmt::Display for Val {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            write!(f, "{}", self.key)
        }
    }

    fn pool() -> PoolAllocator {
        PoolAllocator::new(4, 12)
    }

    #[test]
    fn hit_returns_same_object_and_sets_bit() {
        // S3
        let mut cache = Cache::<i32, _>::new(2, pool());
        let v1 = cache.get::<Val>(&1).unwrap().key;
        assert_eq!(v1, 1);
        let v2 = cache.get::<Val>(&1).unwrap().key;
        assert_eq!(v2, 1);
        let mut out = String::new();
        cache.print(&mut out).unwrap();
        assert_eq!(out, "1");
    }

    #[test]
    fn clock_eviction() {
        // S4
        let mut cache = Cache::<i32, _>::new(2, pool());
        cache.get::<Val>(&1).unwrap();
        cache.get::<Val>(&2).unwrap();

        let mut out = String::new();
        cache.print(&mut out).unwrap();
        assert_eq!(out, "2 1");

        cache.get::<Val>(&1).unwrap();
        out.clear();
        cache.print(&mut out).unwrap();
        assert_eq!(out, "1 2");

        cache.get::<Val>(&3).unwrap();
        out.clear();
        cache.print(&mut out).unwrap();
        assert_eq!(out, "3 1");
    }

    #[test]
    fn second_chance_before_eviction() {
        // S5
        let mut cache = Cache::<i32, _>::new(1, pool());
        cache.get::<Val>(&1).unwrap();
        cache.get::<Val>(&1).unwrap();
        cache.get::<Val>(&2).unwrap();

        let mut out = String::new();
        cache.print(&mut out).unwrap();
        assert_eq!(out, "2");
        assert_eq!(cache.size(), 1);
    }

    #[test]
    fn size_never_exceeds_capacity() {
        let mut cache = Cache::<i32, _>::new(3, pool());
        for k in 0..20 {
            cache.get::<Val>(&k).unwrap();
            assert!(cache.size() <= 3);
        }
    }

    #[test]
    fn idempotent_get() {
        let mut cache = Cache::<i32, _>::new(4, pool());
        let first = cache.get::<Val>(&7).unwrap().key;
        let second = cache.get::<Val>(&7).unwrap().key;
        assert_eq!(first, second);
    }
}
