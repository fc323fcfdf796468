//! Atomic allocator counters and their snapshots.
//!
//! All counters use relaxed ordering. They are advisory, not
//! synchronization: a reader may see `current_used` drop before
//! `current_free` rises. Gauges are raised before a block becomes visible to
//! other threads and lowered after it is taken, so they never wrap.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

use serde::{Deserialize, Serialize};

/// Live counters shared by every thread using one allocator.
#[derive(Debug, Default)]
pub struct AllocatorCounters {
    /// Requested bytes ever handed out.
    pub total_allocated: AtomicU64,
    /// Requested bytes ever returned.
    pub total_freed: AtomicU64,
    /// Requested bytes currently held by callers.
    pub current_used: AtomicU64,
    /// Class bytes idle in pool free lists and thread caches.
    pub current_free: AtomicU64,
    /// Non-zero allocation requests accepted while running.
    pub alloc_count: AtomicU64,
    /// Successful deallocations.
    pub free_count: AtomicU64,
    pub failed_allocations: AtomicU64,
    /// Double frees and unknown pointers that were ignored.
    pub invalid_frees: AtomicU64,
    pub thread_cache_hits: AtomicU64,
    pub thread_cache_misses: AtomicU64,
    /// Blocks currently parked in thread caches.
    pub cached_blocks: AtomicU64,
    pub fallback_blocks: AtomicU64,
    /// Platform layout bytes held by oversized blocks. An in-place shrink
    /// leaves this unchanged since the layout does not change.
    pub fallback_bytes: AtomicU64,
    pub in_place_reallocs: AtomicU64,
    pub maintenance_passes: AtomicU64,
    pub evicted_blocks: AtomicU64,
    pub evicted_bytes: AtomicU64,
    /// Latest fragmentation estimate, in permille.
    pub fragmentation_permille: AtomicU64,
}

impl AllocatorCounters {
    #[must_use]
    pub const fn new() -> Self {
        Self {
            total_allocated: AtomicU64::new(0),
            total_freed: AtomicU64::new(0),
            current_used: AtomicU64::new(0),
            current_free: AtomicU64::new(0),
            alloc_count: AtomicU64::new(0),
            free_count: AtomicU64::new(0),
            failed_allocations: AtomicU64::new(0),
            invalid_frees: AtomicU64::new(0),
            thread_cache_hits: AtomicU64::new(0),
            thread_cache_misses: AtomicU64::new(0),
            cached_blocks: AtomicU64::new(0),
            fallback_blocks: AtomicU64::new(0),
            fallback_bytes: AtomicU64::new(0),
            in_place_reallocs: AtomicU64::new(0),
            maintenance_passes: AtomicU64::new(0),
            evicted_blocks: AtomicU64::new(0),
            evicted_bytes: AtomicU64::new(0),
            fragmentation_permille: AtomicU64::new(0),
        }
    }

    /// Adds one.
    pub fn inc(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    /// Adds `amount`.
    pub fn add(counter: &AtomicU64, amount: usize) {
        counter.fetch_add(amount as u64, Ordering::Relaxed);
    }

    /// Subtracts `amount`.
    pub fn sub(counter: &AtomicU64, amount: usize) {
        counter.fetch_sub(amount as u64, Ordering::Relaxed);
    }

    /// Current value.
    pub fn get(counter: &AtomicU64) -> u64 {
        counter.load(Ordering::Relaxed)
    }

    /// Records a block handed to a caller.
    pub fn record_alloc(&self, requested: usize) {
        Self::add(&self.total_allocated, requested);
        Self::add(&self.current_used, requested);
    }

    /// Records a block returned by a caller.
    pub fn record_free(&self, requested: usize) {
        Self::add(&self.total_freed, requested);
        Self::sub(&self.current_used, requested);
        Self::inc(&self.free_count);
    }

    /// Reads every counter. Pool detail is attached by the allocator.
    #[must_use]
    pub fn snapshot(&self, pools: Vec<PoolStats>, thread_caches: usize) -> AllocatorStats {
        AllocatorStats {
            total_allocated: Self::get(&self.total_allocated),
            total_freed: Self::get(&self.total_freed),
            current_used: Self::get(&self.current_used),
            current_free: Self::get(&self.current_free),
            alloc_count: Self::get(&self.alloc_count),
            free_count: Self::get(&self.free_count),
            failed_allocations: Self::get(&self.failed_allocations),
            invalid_frees: Self::get(&self.invalid_frees),
            thread_cache_hits: Self::get(&self.thread_cache_hits),
            thread_cache_misses: Self::get(&self.thread_cache_misses),
            cached_blocks: Self::get(&self.cached_blocks),
            fallback_blocks: Self::get(&self.fallback_blocks),
            fallback_bytes: Self::get(&self.fallback_bytes),
            in_place_reallocs: Self::get(&self.in_place_reallocs),
            maintenance_passes: Self::get(&self.maintenance_passes),
            evicted_blocks: Self::get(&self.evicted_blocks),
            evicted_bytes: Self::get(&self.evicted_bytes),
            fragmentation_permille: Self::get(&self.fragmentation_permille),
            thread_caches,
            pools,
        }
    }
}

/// Point-in-time view of one size-class pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PoolStats {
    pub class_size: usize,
    /// Blocks not on the free list (held by callers or thread caches).
    pub in_use: usize,
    pub free: usize,
    /// Blocks ever carved from the platform allocator.
    pub total_carved: u64,
    /// Blocks returned to the platform allocator by maintenance.
    pub evicted: u64,
}

impl PoolStats {
    /// Blocks this pool currently owns.
    #[must_use]
    pub fn total(&self) -> usize {
        self.in_use + self.free
    }
}

/// Point-in-time snapshot of an allocator.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AllocatorStats {
    pub total_allocated: u64,
    pub total_freed: u64,
    pub current_used: u64,
    pub current_free: u64,
    pub alloc_count: u64,
    pub free_count: u64,
    pub failed_allocations: u64,
    pub invalid_frees: u64,
    pub thread_cache_hits: u64,
    pub thread_cache_misses: u64,
    pub cached_blocks: u64,
    pub fallback_blocks: u64,
    pub fallback_bytes: u64,
    pub in_place_reallocs: u64,
    pub maintenance_passes: u64,
    pub evicted_blocks: u64,
    pub evicted_bytes: u64,
    pub fragmentation_permille: u64,
    /// Registered thread caches.
    pub thread_caches: usize,
    pub pools: Vec<PoolStats>,
}

impl AllocatorStats {
    /// Bytes the allocator is holding: live plus idle.
    #[must_use]
    pub fn footprint(&self) -> u64 {
        self.current_used + self.current_free
    }
}

impl fmt::Display for AllocatorStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Memory Pool Stats:")?;
        writeln!(f, "  Total Allocated: {} bytes", self.total_allocated)?;
        writeln!(f, "  Total Freed: {} bytes", self.total_freed)?;
        writeln!(f, "  Current Used: {} bytes", self.current_used)?;
        writeln!(f, "  Current Free: {} bytes", self.current_free)?;
        writeln!(f, "  Alloc Count: {}", self.alloc_count)?;
        writeln!(f, "  Free Count: {}", self.free_count)?;
        writeln!(f, "  Failed Allocations: {}", self.failed_allocations)?;
        writeln!(f, "  Invalid Frees: {}", self.invalid_frees)?;
        writeln!(
            f,
            "  Thread Caches: {} ({} blocks cached, {} hits, {} misses)",
            self.thread_caches, self.cached_blocks, self.thread_cache_hits, self.thread_cache_misses
        )?;
        writeln!(
            f,
            "  Fallback: {} blocks, {} bytes",
            self.fallback_blocks, self.fallback_bytes
        )?;
        writeln!(
            f,
            "  Fragmentation: {}.{}%",
            self.fragmentation_permille / 10,
            self.fragmentation_permille % 10
        )?;
        for (i, pool) in self.pools.iter().enumerate() {
            writeln!(
                f,
                "  Pool[{i}] (Block Size: {}): Used={}, Free={}, Total={}",
                pool.class_size,
                pool.in_use,
                pool.free,
                pool.total()
            )?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn alloc_then_free_balances() {
        let counters = AllocatorCounters::new();
        counters.record_alloc(64);
        counters.record_alloc(10);
        counters.record_free(64);
        let snap = counters.snapshot(Vec::new(), 0);
        assert_eq!(snap.total_allocated, 74);
        assert_eq!(snap.total_freed, 64);
        assert_eq!(snap.current_used, 10);
        assert_eq!(snap.free_count, 1);
    }

    #[test]
    fn display_lists_pools() {
        let counters = AllocatorCounters::new();
        counters.record_alloc(8);
        AllocatorCounters::add(&counters.fragmentation_permille, 125);
        let pools = vec![
            PoolStats {
                class_size: 8,
                in_use: 1,
                free: 3,
                total_carved: 4,
                evicted: 0,
            },
            PoolStats {
                class_size: 16,
                in_use: 0,
                free: 0,
                total_carved: 0,
                evicted: 0,
            },
        ];
        let text = counters.snapshot(pools, 1).to_string();
        assert!(text.starts_with("Memory Pool Stats:\n"));
        assert!(text.contains("  Total Allocated: 8 bytes"));
        assert!(text.contains("  Fragmentation: 12.5%"));
        assert!(text.contains("  Pool[0] (Block Size: 8): Used=1, Free=3, Total=4"));
        assert!(text.contains("  Pool[1] (Block Size: 16): Used=0, Free=0, Total=0"));
    }

    #[test]
    fn snapshot_serializes() {
        let counters = AllocatorCounters::new();
        counters.record_alloc(32);
        let snap = counters.snapshot(Vec::new(), 2);
        let json = serde_json::to_value(&snap).unwrap();
        assert_eq!(json["current_used"], 32);
        assert_eq!(json["thread_caches"], 2);
        assert!(json["pools"].as_array().unwrap().is_empty());
        assert_eq!(snap.footprint(), 32);
    }
}
