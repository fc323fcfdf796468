//! Per-thread magazine cache.
//!
//! Each thread keeps a small stack of recently freed blocks per size class so
//! that the common allocate/free cycle never touches a pool lock. Caches are
//! registered with their allocator in a [`CacheRegistry`] and drained back to
//! the pools when the thread exits, when the thread asks for it, or when the
//! allocator is torn down.
//!
//! The owning thread reaches its cache through a [`CacheSlot`] that it only
//! ever `try_lock`s. The lock is contended solely while a drain is running,
//! and the owner then treats the attempt as a miss.

use std::cell::RefCell;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::thread::ThreadId;

use parking_lot::Mutex;

use crate::block::BlockRef;

/// Stack of cached blocks for one size class.
#[derive(Debug, Clone)]
struct Magazine {
    blocks: Vec<BlockRef>,
    capacity: usize,
}

impl Magazine {
    fn new(capacity: usize) -> Self {
        Self {
            blocks: Vec::new(),
            capacity,
        }
    }

    fn pop(&mut self) -> Option<BlockRef> {
        self.blocks.pop()
    }

    /// Hands the block back when the magazine is full.
    fn push(&mut self, block: BlockRef) -> Result<(), BlockRef> {
        if self.blocks.len() < self.capacity {
            self.blocks.push(block);
            Ok(())
        } else {
            Err(block)
        }
    }

    fn is_full(&self) -> bool {
        self.blocks.len() >= self.capacity
    }

    fn drain(&mut self) -> Vec<BlockRef> {
        std::mem::take(&mut self.blocks)
    }
}

/// One magazine per size class.
#[derive(Debug)]
pub struct ThreadCache {
    magazines: Vec<Magazine>,
    total_cached: usize,
}

impl ThreadCache {
    #[must_use]
    pub fn new(classes: usize, capacity: usize) -> Self {
        Self {
            magazines: (0..classes).map(|_| Magazine::new(capacity)).collect(),
            total_cached: 0,
        }
    }

    /// Pops a cached block for `class`, or `None` when the magazine is empty
    /// (caller falls back to the pool).
    pub fn try_take(&mut self, class: usize) -> Option<BlockRef> {
        let block = self.magazines.get_mut(class)?.pop();
        if block.is_some() {
            self.total_cached -= 1;
        }
        block
    }

    /// Caches a released block. A full magazine rejects it and the caller
    /// returns it to the pool.
    pub fn try_put(&mut self, class: usize, block: BlockRef) -> Result<(), BlockRef> {
        let Some(magazine) = self.magazines.get_mut(class) else {
            return Err(block);
        };
        magazine.push(block)?;
        self.total_cached += 1;
        Ok(())
    }

    #[must_use]
    pub fn is_full(&self, class: usize) -> bool {
        self.magazines.get(class).is_none_or(Magazine::is_full)
    }

    #[must_use]
    pub fn total_cached(&self) -> usize {
        self.total_cached
    }

    /// Empties every magazine, returning `(class, blocks)` for each
    /// non-empty one.
    pub fn drain(&mut self) -> Vec<(usize, Vec<BlockRef>)> {
        self.total_cached = 0;
        self.magazines
            .iter_mut()
            .enumerate()
            .filter_map(|(class, magazine)| {
                let blocks = magazine.drain();
                (!blocks.is_empty()).then_some((class, blocks))
            })
            .collect()
    }
}

/// A registered cache and the thread that owns it.
#[derive(Debug)]
pub struct CacheSlot {
    thread: ThreadId,
    cache: Mutex<ThreadCache>,
    retired: AtomicBool,
}

impl CacheSlot {
    fn new(thread: ThreadId, classes: usize, capacity: usize) -> Self {
        Self {
            thread,
            cache: Mutex::new(ThreadCache::new(classes, capacity)),
            retired: AtomicBool::new(false),
        }
    }

    #[must_use]
    pub fn thread(&self) -> ThreadId {
        self.thread
    }

    #[must_use]
    pub fn is_retired(&self) -> bool {
        self.retired.load(Ordering::Acquire)
    }

    /// Runs `f` on the cache if it can be had without waiting and has not
    /// been retired.
    pub fn with_cache<R>(&self, f: impl FnOnce(&mut ThreadCache) -> R) -> Option<R> {
        let mut cache = self.cache.try_lock()?;
        if self.is_retired() {
            return None;
        }
        Some(f(&mut cache))
    }

    /// Marks the slot dead and empties it. Later `with_cache` calls see the
    /// retired flag and fall through to the pools.
    pub fn retire(&self) -> Vec<(usize, Vec<BlockRef>)> {
        self.retired.store(true, Ordering::Release);
        self.cache.lock().drain()
    }
}

/// Thread-id keyed set of live caches for one allocator.
#[derive(Debug)]
pub struct CacheRegistry {
    slots: Mutex<HashMap<ThreadId, Arc<CacheSlot>>>,
    classes: usize,
    capacity: usize,
}

impl CacheRegistry {
    #[must_use]
    pub fn new(classes: usize, capacity: usize) -> Self {
        Self {
            slots: Mutex::new(HashMap::new()),
            classes,
            capacity,
        }
    }

    /// Creates and records a slot for `thread`, replacing any previous one.
    pub fn register(&self, thread: ThreadId) -> Arc<CacheSlot> {
        let slot = Arc::new(CacheSlot::new(thread, self.classes, self.capacity));
        self.slots.lock().insert(thread, Arc::clone(&slot));
        slot
    }

    /// Removes `slot` if it is still the registered one for its thread.
    pub fn unregister(&self, slot: &Arc<CacheSlot>) -> bool {
        let mut slots = self.slots.lock();
        match slots.get(&slot.thread) {
            Some(current) if Arc::ptr_eq(current, slot) => {
                slots.remove(&slot.thread);
                true
            }
            _ => false,
        }
    }

    /// Removes every slot. Used at teardown.
    pub fn take_all(&self) -> Vec<Arc<CacheSlot>> {
        self.slots.lock().drain().map(|(_, slot)| slot).collect()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.slots.lock().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// The allocator side of a thread-local cache entry.
pub trait CacheOwner: Send + Sync {
    /// Retires `slot` and returns its blocks to the pools.
    fn release_slot(&self, slot: &Arc<CacheSlot>);
}

struct LocalEntry {
    allocator_id: u64,
    slot: Arc<CacheSlot>,
    owner: Weak<dyn CacheOwner>,
}

#[derive(Default)]
struct LocalCaches {
    entries: Vec<LocalEntry>,
}

impl Drop for LocalCaches {
    fn drop(&mut self) {
        for entry in self.entries.drain(..) {
            if let Some(owner) = entry.owner.upgrade() {
                owner.release_slot(&entry.slot);
            }
        }
    }
}

thread_local! {
    static LOCAL_CACHES: RefCell<LocalCaches> = RefCell::new(LocalCaches::default());
}

/// Finds (or registers) the calling thread's slot for `allocator_id`.
///
/// Returns `None` during thread teardown, on re-entrant use, or when the
/// caller declines to register (`register` returns `None`).
pub fn local_slot(
    allocator_id: u64,
    register: impl FnOnce() -> Option<(Arc<CacheSlot>, Weak<dyn CacheOwner>)>,
) -> Option<Arc<CacheSlot>> {
    LOCAL_CACHES
        .try_with(|local| {
            let mut local = local.try_borrow_mut().ok()?;
            if let Some(entry) = local
                .entries
                .iter()
                .find(|entry| entry.allocator_id == allocator_id && !entry.slot.is_retired())
            {
                return Some(Arc::clone(&entry.slot));
            }
            local
                .entries
                .retain(|entry| entry.owner.strong_count() > 0 && !entry.slot.is_retired());
            let (slot, owner) = register()?;
            local.entries.push(LocalEntry {
                allocator_id,
                slot: Arc::clone(&slot),
                owner,
            });
            Some(slot)
        })
        .ok()
        .flatten()
}

/// Drops the calling thread's entry for `allocator_id`, returning its slot
/// so the caller can drain it.
pub fn forget_local_slot(allocator_id: u64) -> Option<Arc<CacheSlot>> {
    LOCAL_CACHES
        .try_with(|local| {
            let mut local = local.try_borrow_mut().ok()?;
            let index = local
                .entries
                .iter()
                .position(|entry| entry.allocator_id == allocator_id)?;
            Some(local.entries.swap_remove(index).slot)
        })
        .ok()
        .flatten()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::block::{BlockHeader, PoolId};
    use std::sync::atomic::AtomicUsize;

    const CLASSES: usize = 8;
    const CAPACITY: usize = 16;

    fn block(addr: usize) -> BlockRef {
        let pool = PoolId {
            allocator: 0,
            class: 0,
        };
        BlockRef {
            addr,
            header: Arc::new(BlockHeader::pooled(pool, 8, 8)),
        }
    }

    #[test]
    fn new_cache_empty() {
        let mut cache = ThreadCache::new(CLASSES, CAPACITY);
        assert_eq!(cache.total_cached(), 0);
        assert!(cache.try_take(0).is_none());
        assert!(cache.try_take(5).is_none());
    }

    #[test]
    fn put_and_take_lifo() {
        let mut cache = ThreadCache::new(CLASSES, CAPACITY);
        assert!(cache.try_put(0, block(0x1000)).is_ok());
        assert!(cache.try_put(0, block(0x2000)).is_ok());
        assert_eq!(cache.total_cached(), 2);

        assert_eq!(cache.try_take(0).map(|b| b.addr), Some(0x2000));
        assert_eq!(cache.try_take(0).map(|b| b.addr), Some(0x1000));
        assert!(cache.try_take(0).is_none());
        assert_eq!(cache.total_cached(), 0);
    }

    #[test]
    fn classes_are_independent() {
        let mut cache = ThreadCache::new(CLASSES, CAPACITY);
        assert!(cache.try_put(0, block(0x1000)).is_ok());
        assert!(cache.try_put(5, block(0x2000)).is_ok());
        assert_eq!(cache.try_take(0).map(|b| b.addr), Some(0x1000));
        assert!(cache.try_take(0).is_none());
        assert_eq!(cache.try_take(5).map(|b| b.addr), Some(0x2000));
    }

    #[test]
    fn full_magazine_rejects() {
        let mut cache = ThreadCache::new(CLASSES, CAPACITY);
        for i in 0..CAPACITY {
            assert!(cache.try_put(0, block(i * 8)).is_ok());
        }
        assert!(cache.is_full(0));
        let rejected = cache.try_put(0, block(0x9990)).unwrap_err();
        assert_eq!(rejected.addr, 0x9990);
        assert_eq!(cache.total_cached(), CAPACITY);
    }

    #[test]
    fn out_of_range_class() {
        let mut cache = ThreadCache::new(CLASSES, CAPACITY);
        assert!(cache.try_take(CLASSES).is_none());
        assert!(cache.try_put(CLASSES, block(0x1000)).is_err());
        assert!(cache.is_full(CLASSES));
    }

    #[test]
    fn drain_returns_everything() {
        let mut cache = ThreadCache::new(CLASSES, CAPACITY);
        cache.try_put(3, block(0x1000)).unwrap();
        cache.try_put(3, block(0x2000)).unwrap();
        cache.try_put(6, block(0x3000)).unwrap();

        let drained = cache.drain();
        assert_eq!(drained.len(), 2);
        assert_eq!(drained[0].0, 3);
        assert_eq!(drained[0].1.len(), 2);
        assert_eq!(drained[1].0, 6);
        assert_eq!(cache.total_cached(), 0);
        assert!(cache.try_take(3).is_none());
    }

    #[test]
    fn retired_slot_refuses_access() {
        let registry = CacheRegistry::new(CLASSES, CAPACITY);
        let slot = registry.register(std::thread::current().id());
        slot.with_cache(|cache| cache.try_put(1, block(0x40)).unwrap())
            .unwrap();
        let drained = slot.retire();
        assert_eq!(drained.len(), 1);
        assert!(slot.with_cache(|_| ()).is_none());
        assert!(registry.unregister(&slot));
        assert!(!registry.unregister(&slot));
        assert!(registry.is_empty());
    }

    #[test]
    fn busy_slot_is_a_miss() {
        let registry = CacheRegistry::new(CLASSES, CAPACITY);
        let slot = registry.register(std::thread::current().id());
        let guard = slot.cache.lock();
        assert!(slot.with_cache(|_| ()).is_none());
        drop(guard);
        assert!(slot.with_cache(|_| ()).is_some());
    }

    struct Recorder {
        released: AtomicUsize,
    }

    impl CacheOwner for Recorder {
        fn release_slot(&self, slot: &Arc<CacheSlot>) {
            slot.retire();
            self.released.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[test]
    fn thread_exit_releases_slot() {
        let owner = Arc::new(Recorder {
            released: AtomicUsize::new(0),
        });
        let registry = Arc::new(CacheRegistry::new(CLASSES, CAPACITY));
        let (o, r) = (Arc::clone(&owner), Arc::clone(&registry));
        std::thread::spawn(move || {
            let weak: Weak<dyn CacheOwner> = Arc::downgrade(&o) as Weak<dyn CacheOwner>;
            let first = local_slot(42, || Some((r.register(std::thread::current().id()), weak)));
            assert!(first.is_some());
            // Second lookup hits the existing entry without registering.
            let again = local_slot(42, || None);
            assert!(Arc::ptr_eq(first.as_ref().unwrap(), again.as_ref().unwrap()));
        })
        .join()
        .unwrap();
        assert_eq!(owner.released.load(Ordering::SeqCst), 1);
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn forget_removes_entry() {
        let registry = CacheRegistry::new(CLASSES, CAPACITY);
        let owner: Arc<dyn CacheOwner> = Arc::new(Recorder {
            released: AtomicUsize::new(0),
        });
        let slot = local_slot(99, || {
            Some((registry.register(std::thread::current().id()), Arc::downgrade(&owner)))
        })
        .unwrap();
        let forgotten = forget_local_slot(99).unwrap();
        assert!(Arc::ptr_eq(&slot, &forgotten));
        assert!(forget_local_slot(99).is_none());
    }
}
