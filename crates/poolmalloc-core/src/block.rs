//! Block metadata side table.
//!
//! Every block the allocator hands out (pooled or fallback) has a
//! [`BlockHeader`] registered under its address. Deallocation and
//! reallocation look the header up by address instead of reading memory in
//! front of the payload, so a foreign pointer is recognised without ever
//! dereferencing it.
//!
//! Thread-safe via sharded `parking_lot::RwLock`. A shard lock is held only
//! for one map operation; state transitions happen on the header's atomics.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use parking_lot::RwLock;

/// Number of table shards (power of 2).
const NUM_SHARDS: usize = 64;

/// Identity of one size-class pool inside one allocator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PoolId {
    pub allocator: u64,
    pub class: usize,
}

/// Who gets the block back on release.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Owner {
    Pool(PoolId),
    /// Served straight from the platform allocator.
    Platform,
}

/// Metadata for one live or pooled block.
#[derive(Debug)]
pub struct BlockHeader {
    requested_size: AtomicUsize,
    class_size: usize,
    in_use: AtomicBool,
    owner: Owner,
}

impl BlockHeader {
    /// Header for a freshly carved pool block, already in use.
    #[must_use]
    pub fn pooled(pool: PoolId, class_size: usize, requested_size: usize) -> Self {
        Self {
            requested_size: AtomicUsize::new(requested_size),
            class_size,
            in_use: AtomicBool::new(true),
            owner: Owner::Pool(pool),
        }
    }

    /// Header for a platform-fallback block. Its class size is the raw size.
    #[must_use]
    pub fn fallback(size: usize) -> Self {
        Self {
            requested_size: AtomicUsize::new(size),
            class_size: size,
            in_use: AtomicBool::new(true),
            owner: Owner::Platform,
        }
    }

    #[must_use]
    pub fn requested_size(&self) -> usize {
        self.requested_size.load(Ordering::Acquire)
    }

    pub fn set_requested_size(&self, size: usize) {
        self.requested_size.store(size, Ordering::Release);
    }

    #[must_use]
    pub fn class_size(&self) -> usize {
        self.class_size
    }

    #[must_use]
    pub fn owner(&self) -> Owner {
        self.owner
    }

    #[must_use]
    pub fn is_in_use(&self) -> bool {
        self.in_use.load(Ordering::Acquire)
    }

    /// Hands a pooled block back out with a new requested size.
    pub fn acquire(&self, requested_size: usize) {
        self.requested_size.store(requested_size, Ordering::Relaxed);
        self.in_use.store(true, Ordering::Release);
    }

    /// Flips `in_use` to false if the block belongs to `expected` and is
    /// currently live. Exactly one of several racing releases succeeds.
    pub fn release(&self, expected: Owner) -> bool {
        if self.owner != expected {
            return false;
        }
        self.in_use
            .compare_exchange(true, false, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }
}

/// A block address paired with its header, as moved between pools and
/// thread caches.
#[derive(Debug, Clone)]
pub struct BlockRef {
    pub addr: usize,
    pub header: Arc<BlockHeader>,
}

type Shard = RwLock<HashMap<usize, Arc<BlockHeader>>>;

/// Address-keyed map from block address to header.
pub struct BlockTable {
    shards: Box<[Shard]>,
}

impl BlockTable {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn shard_for(&self, addr: usize) -> &Shard {
        // Neighbouring small blocks differ only in low bits; fold page bits in.
        let key = (addr >> 4) ^ (addr >> 12);
        &self.shards[key % NUM_SHARDS]
    }

    /// Records the header for a freshly handed-out block.
    pub fn insert(&self, addr: usize, header: Arc<BlockHeader>) {
        self.shard_for(addr).write().insert(addr, header);
    }

    /// Header for `addr`, if this table tracks it.
    #[must_use]
    pub fn get(&self, addr: usize) -> Option<Arc<BlockHeader>> {
        self.shard_for(addr).read().get(&addr).cloned()
    }

    /// Forgets `addr`. Used when a block goes back to the platform.
    pub fn remove(&self, addr: usize) -> Option<Arc<BlockHeader>> {
        self.shard_for(addr).write().remove(&addr)
    }

    /// Number of tracked blocks across all shards.
    #[must_use]
    pub fn len(&self) -> usize {
        self.shards.iter().map(|shard| shard.read().len()).sum()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for BlockTable {
    fn default() -> Self {
        Self {
            shards: (0..NUM_SHARDS)
                .map(|_| RwLock::new(HashMap::new()))
                .collect(),
        }
    }
}

impl std::fmt::Debug for BlockTable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BlockTable")
            .field("shards", &NUM_SHARDS)
            .field("blocks", &self.len())
            .finish()
    }
}
