//! Background maintenance.
//!
//! A maintenance pass runs an ordered list of [`MaintenanceStep`]s against a
//! [`MaintenanceContext`]. The allocator runs a pass from its worker thread
//! every `cleanup_interval` and on demand from `cleanup()`. Passes never run
//! concurrently with each other.
//!
//! Steps only see pool free lists. Blocks parked in thread caches stay
//! there until their thread releases them.

use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};
use serde::Serialize;

use crate::config::AllocatorConfig;
use crate::pool::{Eviction, SizeClassPool};
use crate::stats::{AllocatorCounters, PoolStats};

/// What a step did.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct StepReport {
    pub step: &'static str,
    pub evicted_blocks: usize,
    pub evicted_bytes: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub fragmentation_permille: Option<u64>,
}

impl StepReport {
    #[must_use]
    pub fn new(step: &'static str) -> Self {
        Self {
            step,
            ..Self::default()
        }
    }

    #[must_use]
    pub fn with_eviction(mut self, eviction: Eviction) -> Self {
        self.evicted_blocks += eviction.blocks;
        self.evicted_bytes += eviction.bytes;
        self
    }
}

/// Outcome of one maintenance pass.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct MaintenanceReport {
    /// 1-based pass number for this allocator.
    pub pass: u64,
    pub duration_us: u64,
    pub evicted_blocks: usize,
    pub evicted_bytes: usize,
    pub steps: Vec<StepReport>,
}

/// One pluggable unit of maintenance work.
pub trait MaintenanceStep: Send + Sync {
    fn name(&self) -> &'static str;

    fn run(&self, cx: &MaintenanceContext<'_>) -> StepReport;
}

/// The allocator state a step may inspect or reclaim.
pub struct MaintenanceContext<'a> {
    now: Instant,
    config: &'a AllocatorConfig,
    pools: &'a [SizeClassPool],
    counters: &'a AllocatorCounters,
}

impl<'a> MaintenanceContext<'a> {
    pub(crate) fn new(
        config: &'a AllocatorConfig,
        pools: &'a [SizeClassPool],
        counters: &'a AllocatorCounters,
    ) -> Self {
        Self {
            now: Instant::now(),
            config,
            pools,
            counters,
        }
    }

    #[must_use]
    pub fn now(&self) -> Instant {
        self.now
    }

    #[must_use]
    pub fn config(&self) -> &AllocatorConfig {
        self.config
    }

    #[must_use]
    pub fn pool_stats(&self) -> Vec<PoolStats> {
        self.pools.iter().map(SizeClassPool::snapshot).collect()
    }

    #[must_use]
    pub fn used_bytes(&self) -> u64 {
        AllocatorCounters::get(&self.counters.current_used)
    }

    /// Idle bytes in pools and thread caches.
    #[must_use]
    pub fn free_bytes(&self) -> u64 {
        AllocatorCounters::get(&self.counters.current_free)
    }

    /// Bytes held from the platform on behalf of callers or as idle capacity.
    #[must_use]
    pub fn footprint(&self) -> u64 {
        self.used_bytes() + self.free_bytes()
    }

    /// Evicts pool free blocks that have been idle for at least `idle_for`.
    pub fn evict_idle(&self, idle_for: Duration) -> Eviction {
        let Some(cutoff) = self.now.checked_sub(idle_for) else {
            return Eviction::default();
        };
        self.account(self.pools.iter().map(|pool| pool.evict_idle(cutoff)))
    }

    /// Caps every pool's free list at `keep` blocks.
    pub fn trim_free_lists(&self, keep: usize) -> Eviction {
        self.account(self.pools.iter().map(|pool| pool.trim(keep)))
    }

    pub fn set_fragmentation_permille(&self, permille: u64) {
        self.counters
            .fragmentation_permille
            .store(permille.min(1000), std::sync::atomic::Ordering::Relaxed);
    }

    fn account(&self, evictions: impl Iterator<Item = Eviction>) -> Eviction {
        let mut total = Eviction::default();
        for eviction in evictions {
            total.merge(eviction);
        }
        AllocatorCounters::sub(&self.counters.current_free, total.bytes);
        AllocatorCounters::add(&self.counters.evicted_blocks, total.blocks);
        AllocatorCounters::add(&self.counters.evicted_bytes, total.bytes);
        total
    }
}

/// Returns pool blocks idle past `idle_timeout` to the platform.
#[derive(Debug, Default, Clone, Copy)]
pub struct IdleEviction;

impl MaintenanceStep for IdleEviction {
    fn name(&self) -> &'static str {
        "idle_eviction"
    }

    fn run(&self, cx: &MaintenanceContext<'_>) -> StepReport {
        let eviction = cx.evict_idle(cx.config().idle_timeout);
        StepReport::new(self.name()).with_eviction(eviction)
    }
}

/// Trims free lists to `pressure_free_list_cap` while the footprint exceeds
/// `max_total_memory`.
#[derive(Debug, Default, Clone, Copy)]
pub struct PressureTrim;

impl MaintenanceStep for PressureTrim {
    fn name(&self) -> &'static str {
        "pressure_trim"
    }

    fn run(&self, cx: &MaintenanceContext<'_>) -> StepReport {
        let report = StepReport::new(self.name());
        if cx.footprint() <= cx.config().max_total_memory as u64 {
            return report;
        }
        report.with_eviction(cx.trim_free_lists(cx.config().pressure_free_list_cap))
    }
}

/// Placeholder estimator: always reports zero fragmentation.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopFragmentation;

impl MaintenanceStep for NoopFragmentation {
    fn name(&self) -> &'static str {
        "noop_fragmentation"
    }

    fn run(&self, cx: &MaintenanceContext<'_>) -> StepReport {
        cx.set_fragmentation_permille(0);
        StepReport {
            fragmentation_permille: Some(0),
            ..StepReport::new(self.name())
        }
    }
}

/// Estimates fragmentation as the idle share of the footprint.
#[derive(Debug, Default, Clone, Copy)]
pub struct FreeRatioFragmentation;

impl MaintenanceStep for FreeRatioFragmentation {
    fn name(&self) -> &'static str {
        "free_ratio_fragmentation"
    }

    fn run(&self, cx: &MaintenanceContext<'_>) -> StepReport {
        let footprint = cx.footprint();
        let permille = if footprint == 0 {
            0
        } else {
            cx.free_bytes().saturating_mul(1000) / footprint
        };
        cx.set_fragmentation_permille(permille);
        StepReport {
            fragmentation_permille: Some(permille.min(1000)),
            ..StepReport::new(self.name())
        }
    }
}

/// Steps installed when the builder is given none.
#[must_use]
pub fn default_steps() -> Vec<Box<dyn MaintenanceStep>> {
    vec![
        Box::new(IdleEviction),
        Box::new(PressureTrim),
        Box::new(NoopFragmentation),
    ]
}

/// Runs `steps` in order.
pub(crate) fn run_pass(
    steps: &[Box<dyn MaintenanceStep>],
    cx: &MaintenanceContext<'_>,
    pass: u64,
) -> MaintenanceReport {
    let started = Instant::now();
    let mut report = MaintenanceReport {
        pass,
        ..MaintenanceReport::default()
    };
    for step in steps {
        let outcome = step.run(cx);
        report.evicted_blocks += outcome.evicted_blocks;
        report.evicted_bytes += outcome.evicted_bytes;
        report.steps.push(outcome);
    }
    report.duration_us = started.elapsed().as_micros() as u64;
    report
}

/// Wake-up channel between the allocator and its maintenance thread.
#[derive(Debug, Default)]
pub(crate) struct WorkerSignal {
    shutdown: Mutex<bool>,
    wake: Condvar,
}

impl WorkerSignal {
    /// Sleeps for up to `interval`. Returns `true` once shutdown has been
    /// requested.
    pub(crate) fn wait(&self, interval: Duration) -> bool {
        let mut shutdown = self.shutdown.lock();
        if !*shutdown {
            match Instant::now().checked_add(interval) {
                Some(deadline) => {
                    while !*shutdown {
                        if self.wake.wait_until(&mut shutdown, deadline).timed_out() {
                            break;
                        }
                    }
                }
                // Past the clock's range: sleep until shutdown.
                None => {
                    while !*shutdown {
                        self.wake.wait(&mut shutdown);
                    }
                }
            }
        }
        *shutdown
    }

    pub(crate) fn request_shutdown(&self) {
        *self.shutdown.lock() = true;
        self.wake.notify_all();
    }
}
