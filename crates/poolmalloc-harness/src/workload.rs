//! Deterministic allocate/free churn across threads.

use std::collections::HashSet;
use std::time::Instant;

use parking_lot::Mutex;
use poolmalloc_core::Allocator;
use serde::{Deserialize, Serialize};

use crate::HarnessError;
use crate::report::StressReport;

/// Small xorshift generator; the same seed always yields the same workload.
#[derive(Debug, Clone, Copy)]
pub struct XorShift64 {
    state: u64,
}

impl XorShift64 {
    #[must_use]
    pub fn new(seed: u64) -> Self {
        Self {
            state: seed.max(1),
        }
    }

    pub fn next_u64(&mut self) -> u64 {
        let mut x = self.state;
        x ^= x >> 12;
        x ^= x << 25;
        x ^= x >> 27;
        self.state = x;
        x.wrapping_mul(0x2545_F491_4F6C_DD1D)
    }

    /// Uniform-ish value in `low..=high`.
    pub fn gen_range(&mut self, low: usize, high: usize) -> usize {
        let span = (high - low) as u64 + 1;
        low + (self.next_u64() % span) as usize
    }
}

/// Shape of a stress run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StressConfig {
    pub threads: usize,
    /// Allocations per thread.
    pub iterations: usize,
    pub min_size: usize,
    pub max_size: usize,
    pub seed: u64,
    /// Leave one live block allocated every `keep_every` iterations. Zero
    /// frees everything.
    pub keep_every: usize,
    /// Upper bound on blocks a thread holds before it is forced to free.
    pub max_live: usize,
}

impl Default for StressConfig {
    fn default() -> Self {
        Self {
            threads: 4,
            iterations: 10_000,
            min_size: 1,
            max_size: 2048,
            seed: 0xDEAD_BEEF,
            keep_every: 0,
            max_live: 64,
        }
    }
}

impl StressConfig {
    pub fn validate(&self) -> Result<(), HarnessError> {
        if self.threads == 0 {
            return Err(HarnessError::InvalidArgument("threads must be at least 1".into()));
        }
        if self.min_size == 0 || self.min_size > self.max_size {
            return Err(HarnessError::InvalidArgument(format!(
                "size range {}..={} is empty or starts at zero",
                self.min_size, self.max_size
            )));
        }
        if self.max_live == 0 {
            return Err(HarnessError::InvalidArgument("max_live must be at least 1".into()));
        }
        Ok(())
    }

    fn thread_seed(&self, thread: usize) -> u64 {
        self.seed ^ (thread as u64 + 1).wrapping_mul(0x9E37_79B9_7F4A_7C15)
    }
}

#[derive(Debug, Default)]
struct ThreadTally {
    allocations: u64,
    frees: u64,
    failed: u64,
    aliased: u64,
    corrupted: u64,
    kept_blocks: u64,
    kept_bytes: u64,
}

impl ThreadTally {
    fn merge(&mut self, other: &Self) {
        self.allocations += other.allocations;
        self.frees += other.frees;
        self.failed += other.failed;
        self.aliased += other.aliased;
        self.corrupted += other.corrupted;
        self.kept_blocks += other.kept_blocks;
        self.kept_bytes += other.kept_bytes;
    }
}

/// Blocks live across all workers, keyed by address.
type LiveSet = Mutex<HashSet<usize>>;

fn release(
    allocator: &Allocator,
    live_set: &LiveSet,
    tally: &mut ThreadTally,
    tag: u8,
    (addr, size): (usize, usize),
) {
    // SAFETY: `addr` is a live block of `size` bytes that only this thread
    // has touched since stamping it.
    let bytes = unsafe { std::slice::from_raw_parts(addr as *const u8, size) };
    if bytes.iter().any(|&b| b != tag) {
        tally.corrupted += 1;
    }
    live_set.lock().remove(&addr);
    // SAFETY: the block is ours and is not used after this point.
    unsafe { allocator.deallocate(addr as *mut u8) };
    tally.frees += 1;
}

fn worker(
    allocator: &Allocator,
    config: &StressConfig,
    live_set: &LiveSet,
    thread: usize,
) -> ThreadTally {
    let mut rng = XorShift64::new(config.thread_seed(thread));
    let tag = (thread % 255) as u8 + 1;
    let mut tally = ThreadTally::default();
    let mut live: Vec<(usize, usize)> = Vec::with_capacity(config.max_live + 1);

    for cycle in 0..config.iterations {
        let size = rng.gen_range(config.min_size, config.max_size);
        let Some(ptr) = allocator.allocate(size) else {
            tally.failed += 1;
            continue;
        };
        tally.allocations += 1;
        let addr = ptr.as_ptr() as usize;
        if !live_set.lock().insert(addr) {
            tally.aliased += 1;
        }
        // SAFETY: freshly allocated block of at least `size` bytes.
        unsafe { std::ptr::write_bytes(ptr.as_ptr(), tag, size) };
        live.push((addr, size));

        if live.len() > config.max_live || rng.next_u64() % 3 == 0 {
            let victim = rng.gen_range(0, live.len() - 1);
            release(allocator, live_set, &mut tally, tag, live.swap_remove(victim));
        }

        if config.keep_every > 0 && (cycle + 1) % config.keep_every == 0 {
            if let Some((_, size)) = live.pop() {
                tally.kept_blocks += 1;
                tally.kept_bytes += size as u64;
            }
        }
    }

    for block in live {
        release(allocator, live_set, &mut tally, tag, block);
    }
    tally
}

/// Runs `config` against `allocator` on scoped threads and reports what
/// happened. Kept blocks stay allocated.
pub fn run_stress(
    allocator: &Allocator,
    config: &StressConfig,
) -> Result<StressReport, HarnessError> {
    config.validate()?;
    let baseline_used = allocator.stats().current_used;
    let live_set = LiveSet::default();
    let started = Instant::now();

    let tallies: Vec<ThreadTally> = std::thread::scope(|scope| {
        let handles: Vec<_> = (0..config.threads)
            .map(|thread| {
                let live_set = &live_set;
                scope.spawn(move || worker(allocator, config, live_set, thread))
            })
            .collect();
        handles
            .into_iter()
            .map(|handle| {
                handle
                    .join()
                    .unwrap_or_else(|panic| std::panic::resume_unwind(panic))
            })
            .collect()
    });
    let elapsed_us = started.elapsed().as_micros() as u64;

    let mut total = ThreadTally::default();
    for tally in &tallies {
        total.merge(tally);
    }
    let stats = allocator.stats();
    let balanced = stats.current_used == baseline_used + total.kept_bytes;

    Ok(StressReport {
        config: config.clone(),
        elapsed_us,
        allocations: total.allocations,
        frees: total.frees,
        failed_allocations: total.failed,
        aliasing_violations: total.aliased,
        corrupted_blocks: total.corrupted,
        kept_blocks: total.kept_blocks,
        kept_bytes: total.kept_bytes,
        balanced,
        stats,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn xorshift_is_deterministic() {
        let mut a = XorShift64::new(42);
        let mut b = XorShift64::new(42);
        let first: Vec<u64> = (0..16).map(|_| a.next_u64()).collect();
        let second: Vec<u64> = (0..16).map(|_| b.next_u64()).collect();
        assert_eq!(first, second);
        assert_ne!(first[0], first[1]);
    }

    #[test]
    fn zero_seed_still_advances() {
        let mut rng = XorShift64::new(0);
        assert_ne!(rng.next_u64(), rng.next_u64());
    }

    #[test]
    fn gen_range_stays_in_bounds() {
        let mut rng = XorShift64::new(7);
        for _ in 0..1000 {
            let v = rng.gen_range(3, 9);
            assert!((3..=9).contains(&v));
        }
        assert_eq!(rng.gen_range(5, 5), 5);
    }

    #[test]
    fn thread_seeds_differ() {
        let config = StressConfig::default();
        assert_ne!(config.thread_seed(0), config.thread_seed(1));
    }

    #[test]
    fn validation_rejects_degenerate_shapes() {
        let bad = [
            StressConfig {
                threads: 0,
                ..StressConfig::default()
            },
            StressConfig {
                min_size: 0,
                ..StressConfig::default()
            },
            StressConfig {
                min_size: 100,
                max_size: 10,
                ..StressConfig::default()
            },
            StressConfig {
                max_live: 0,
                ..StressConfig::default()
            },
        ];
        for config in bad {
            assert!(matches!(
                config.validate(),
                Err(HarnessError::InvalidArgument(_))
            ));
        }
        assert!(StressConfig::default().validate().is_ok());
    }
}
