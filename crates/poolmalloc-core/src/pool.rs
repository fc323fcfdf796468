//! Fixed-size block pool for one size class.
//!
//! Each pool carves blocks of its class size from the platform allocator and
//! recycles released blocks through a FIFO free list. Released blocks go to
//! the back and allocation pops the front, so the front is always the block
//! that has been idle longest.
//!
//! Thread-safe via one `parking_lot::Mutex` per pool. The platform allocator
//! is called outside the lock.

use std::alloc::Layout;
use std::collections::VecDeque;
use std::ptr::NonNull;
use std::sync::Arc;
use std::time::Instant;

use parking_lot::Mutex;

use crate::block::{BlockHeader, BlockRef, BlockTable, Owner, PoolId};
use crate::platform::PlatformAllocator;
use crate::stats::PoolStats;

#[derive(Debug)]
struct FreeBlock {
    block: BlockRef,
    idle_since: Instant,
}

#[derive(Debug, Default)]
struct PoolState {
    free: VecDeque<FreeBlock>,
    in_use: usize,
    total_carved: u64,
    evicted: u64,
}

/// A block handed out by [`SizeClassPool::allocate`].
#[derive(Debug)]
pub struct PoolBlock {
    pub block: BlockRef,
    /// `false` when the block came off the free list.
    pub fresh: bool,
}

/// Blocks returned to the platform by one eviction.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Eviction {
    pub blocks: usize,
    pub bytes: usize,
}

impl Eviction {
    pub fn merge(&mut self, other: Eviction) {
        self.blocks += other.blocks;
        self.bytes += other.bytes;
    }
}

/// Free list and counters for one size class.
pub struct SizeClassPool {
    id: PoolId,
    class_size: usize,
    layout: Layout,
    platform: Arc<dyn PlatformAllocator>,
    table: Arc<BlockTable>,
    state: Mutex<PoolState>,
}

impl SizeClassPool {
    /// Creates an empty pool. Returns `None` if `class_size` and `alignment`
    /// do not form a valid layout.
    pub fn new(
        id: PoolId,
        class_size: usize,
        alignment: usize,
        platform: Arc<dyn PlatformAllocator>,
        table: Arc<BlockTable>,
    ) -> Option<Self> {
        let layout = Layout::from_size_align(class_size, alignment).ok()?;
        Some(Self {
            id,
            class_size,
            layout,
            platform,
            table,
            state: Mutex::new(PoolState::default()),
        })
    }

    #[must_use]
    pub fn id(&self) -> PoolId {
        self.id
    }

    #[must_use]
    pub fn class_size(&self) -> usize {
        self.class_size
    }

    /// Hands out a block holding `requested` bytes.
    ///
    /// Reuses the oldest free block if there is one, otherwise carves a new
    /// block from the platform allocator and registers its header. Returns
    /// `None` only when the platform allocator refuses.
    pub fn allocate(&self, requested: usize) -> Option<PoolBlock> {
        {
            let mut state = self.state.lock();
            if let Some(free) = state.free.pop_front() {
                state.in_use += 1;
                drop(state);
                free.block.header.acquire(requested);
                return Some(PoolBlock {
                    block: free.block,
                    fresh: false,
                });
            }
        }

        let ptr = self.platform.allocate(self.layout)?;
        let addr = ptr.as_ptr() as usize;
        let header = Arc::new(BlockHeader::pooled(self.id, self.class_size, requested));
        self.table.insert(addr, Arc::clone(&header));

        let mut state = self.state.lock();
        state.in_use += 1;
        state.total_carved += 1;
        Some(PoolBlock {
            block: BlockRef { addr, header },
            fresh: true,
        })
    }

    /// Validates and releases a block straight into the free list.
    ///
    /// A block that does not belong to this pool, or is not in use, is left
    /// untouched and `false` is returned.
    pub fn deallocate(&self, block: BlockRef) -> bool {
        if !block.header.release(Owner::Pool(self.id)) {
            return false;
        }
        self.push_released(block);
        true
    }

    /// Appends a block whose header has already been released.
    pub fn push_released(&self, block: BlockRef) {
        debug_assert!(!block.header.is_in_use());
        let mut state = self.state.lock();
        state.in_use = state.in_use.saturating_sub(1);
        state.free.push_back(FreeBlock {
            block,
            idle_since: Instant::now(),
        });
    }

    /// Takes back blocks drained from a thread cache.
    pub fn reclaim(&self, blocks: Vec<BlockRef>) {
        if blocks.is_empty() {
            return;
        }
        let now = Instant::now();
        let mut state = self.state.lock();
        state.in_use = state.in_use.saturating_sub(blocks.len());
        state.free.extend(blocks.into_iter().map(|block| FreeBlock {
            block,
            idle_since: now,
        }));
    }

    /// Returns free blocks idle since `cutoff` or earlier to the platform.
    pub fn evict_idle(&self, cutoff: Instant) -> Eviction {
        let evicted: Vec<BlockRef> = {
            let mut state = self.state.lock();
            let mut kept = VecDeque::with_capacity(state.free.len());
            let mut evicted = Vec::new();
            for free in state.free.drain(..) {
                if free.idle_since <= cutoff {
                    evicted.push(free.block);
                } else {
                    kept.push_back(free);
                }
            }
            state.free = kept;
            state.evicted += evicted.len() as u64;
            evicted
        };
        self.release_to_platform(evicted)
    }

    /// Shrinks the free list to at most `keep` blocks, oldest first.
    pub fn trim(&self, keep: usize) -> Eviction {
        let evicted: Vec<BlockRef> = {
            let mut state = self.state.lock();
            let excess = state.free.len().saturating_sub(keep);
            let evicted: Vec<BlockRef> = state.free.drain(..excess).map(|f| f.block).collect();
            state.evicted += evicted.len() as u64;
            evicted
        };
        self.release_to_platform(evicted)
    }

    fn release_to_platform(&self, blocks: Vec<BlockRef>) -> Eviction {
        let outcome = Eviction {
            blocks: blocks.len(),
            bytes: blocks.len() * self.class_size,
        };
        for block in blocks {
            self.table.remove(block.addr);
            if let Some(ptr) = NonNull::new(block.addr as *mut u8) {
                // SAFETY: the block was carved by this pool's platform with
                // self.layout and has just left the free list, so no caller
                // or cache references it.
                unsafe { self.platform.deallocate(ptr, self.layout) };
            }
        }
        outcome
    }

    #[must_use]
    pub fn snapshot(&self) -> PoolStats {
        let state = self.state.lock();
        PoolStats {
            class_size: self.class_size,
            in_use: state.in_use,
            free: state.free.len(),
            total_carved: state.total_carved,
            evicted: state.evicted,
        }
    }

    /// Idle bytes on the free list.
    #[must_use]
    pub fn free_bytes(&self) -> usize {
        self.state.lock().free.len() * self.class_size
    }
}

impl Drop for SizeClassPool {
    fn drop(&mut self) {
        // Blocks still held by callers are leaked; only the free list goes back.
        let free = std::mem::take(&mut self.state.get_mut().free);
        let blocks = free.into_iter().map(|f| f.block).collect();
        self.release_to_platform(blocks);
    }
}

impl std::fmt::Debug for SizeClassPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SizeClassPool")
            .field("id", &self.id)
            .field("class_size", &self.class_size)
            .field("stats", &self.snapshot())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::platform::SystemAllocator;
    use std::time::Duration;

    const ID: PoolId = PoolId {
        allocator: 7,
        class: 2,
    };

    fn pool(class_size: usize) -> (SizeClassPool, Arc<BlockTable>) {
        let table = Arc::new(BlockTable::new());
        let pool = SizeClassPool::new(
            ID,
            class_size,
            8,
            Arc::new(SystemAllocator),
            Arc::clone(&table),
        )
        .unwrap();
        (pool, table)
    }

    #[test]
    fn fresh_block_is_registered() {
        let (pool, table) = pool(32);
        let got = pool.allocate(20).unwrap();
        assert!(got.fresh);
        assert_eq!(got.block.addr % 8, 0);
        let header = table.get(got.block.addr).unwrap();
        assert_eq!(header.owner(), Owner::Pool(ID));
        assert_eq!(header.requested_size(), 20);
        assert_eq!(header.class_size(), 32);
        assert!(header.is_in_use());
        assert_eq!(pool.snapshot().in_use, 1);
        assert_eq!(pool.snapshot().total_carved, 1);
    }

    #[test]
    fn freed_block_is_reused_fifo() {
        let (pool, _table) = pool(32);
        let a = pool.allocate(32).unwrap().block;
        let b = pool.allocate(32).unwrap().block;
        assert!(pool.deallocate(a.clone()));
        assert!(pool.deallocate(b.clone()));

        let first = pool.allocate(8).unwrap();
        assert!(!first.fresh);
        assert_eq!(first.block.addr, a.addr);
        assert_eq!(first.block.header.requested_size(), 8);
        let second = pool.allocate(8).unwrap();
        assert_eq!(second.block.addr, b.addr);
        assert_eq!(pool.snapshot().total_carved, 2);
    }

    #[test]
    fn double_deallocate_is_ignored() {
        let (pool, _table) = pool(16);
        let block = pool.allocate(16).unwrap().block;
        assert!(pool.deallocate(block.clone()));
        let before = pool.snapshot();
        assert!(!pool.deallocate(block));
        assert_eq!(pool.snapshot(), before);
        assert_eq!(before.free, 1);
        assert_eq!(before.in_use, 0);
    }

    #[test]
    fn foreign_owner_is_rejected() {
        let (pool, _table) = pool(16);
        let header = Arc::new(BlockHeader::pooled(
            PoolId {
                allocator: 7,
                class: 0,
            },
            16,
            16,
        ));
        let before = pool.snapshot();
        assert!(!pool.deallocate(BlockRef {
            addr: 0xdead_0000,
            header: Arc::clone(&header),
        }));
        assert!(header.is_in_use());
        assert_eq!(pool.snapshot(), before);
    }

    #[test]
    fn evict_idle_returns_blocks_to_platform() {
        let (pool, table) = pool(64);
        let before = Instant::now();
        std::thread::sleep(Duration::from_millis(2));
        let blocks: Vec<_> = (0..4).map(|_| pool.allocate(64).unwrap().block).collect();
        for block in &blocks {
            assert!(pool.deallocate(block.clone()));
        }
        assert_eq!(table.len(), 4);

        let none = pool.evict_idle(before);
        assert_eq!(none, Eviction::default());

        let all = pool.evict_idle(Instant::now());
        assert_eq!(all, Eviction { blocks: 4, bytes: 256 });
        assert!(table.is_empty());
        let snap = pool.snapshot();
        assert_eq!(snap.free, 0);
        assert_eq!(snap.evicted, 4);
    }

    #[test]
    fn trim_keeps_newest() {
        let (pool, _table) = pool(8);
        let blocks: Vec<_> = (0..5).map(|_| pool.allocate(8).unwrap().block).collect();
        for block in &blocks {
            assert!(pool.deallocate(block.clone()));
        }
        let outcome = pool.trim(2);
        assert_eq!(outcome.blocks, 3);
        assert_eq!(pool.snapshot().free, 2);
        assert_eq!(pool.allocate(8).unwrap().block.addr, blocks[3].addr);
    }

    #[test]
    fn reclaim_moves_blocks_onto_free_list() {
        let (pool, _table) = pool(8);
        let blocks: Vec<_> = (0..3).map(|_| pool.allocate(8).unwrap().block).collect();
        for block in &blocks {
            assert!(block.header.release(Owner::Pool(ID)));
        }
        pool.reclaim(blocks);
        let snap = pool.snapshot();
        assert_eq!(snap.in_use, 0);
        assert_eq!(snap.free, 3);
        assert_eq!(pool.free_bytes(), 24);
    }
}
