//! The dispatching allocator.
//!
//! Small requests are classified into a size class and served, in order,
//! from the calling thread's cache, then the class pool. Requests above the
//! largest class go straight to the platform allocator. Every block the
//! allocator hands out is recorded in its [`BlockTable`], which is how frees
//! find their owner and how double frees and unknown pointers are spotted.
//!
//! Misuse (double free, unknown pointer) is ignored: nothing is returned to
//! the caller, the `invalid_frees` counter is bumped, and a `warn` event is
//! emitted.

use std::alloc::Layout;
use std::ptr::NonNull;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::thread::JoinHandle;

use parking_lot::Mutex;
use serde_json::json;

use crate::block::{BlockHeader, BlockRef, BlockTable, Owner, PoolId};
use crate::config::AllocatorConfig;
use crate::error::{BuildError, ConfigError};
use crate::events::{EventEmitter, EventLevel, EventSink, NullSink};
use crate::maintenance::{
    MaintenanceContext, MaintenanceReport, MaintenanceStep, WorkerSignal, default_steps, run_pass,
};
use crate::platform::{PlatformAllocator, SystemAllocator};
use crate::pool::SizeClassPool;
use crate::size_class::SizeClassTable;
use crate::stats::{AllocatorCounters, AllocatorStats};
use crate::thread_cache::{self, CacheOwner, CacheRegistry, CacheSlot};

static NEXT_ALLOCATOR_ID: AtomicU64 = AtomicU64::new(1);

struct Inner {
    id: u64,
    config: AllocatorConfig,
    classes: SizeClassTable,
    registry: CacheRegistry,
    pools: Vec<SizeClassPool>,
    table: Arc<BlockTable>,
    platform: Arc<dyn PlatformAllocator>,
    counters: AllocatorCounters,
    events: EventEmitter,
    steps: Vec<Box<dyn MaintenanceStep>>,
    maintenance: Mutex<()>,
    signal: WorkerSignal,
    shutdown: AtomicBool,
}

impl Inner {
    fn run_maintenance(&self) -> MaintenanceReport {
        let _serialized = self.maintenance.lock();
        let pass = self.counters.maintenance_passes.fetch_add(1, Ordering::Relaxed) + 1;
        let cx = MaintenanceContext::new(&self.config, &self.pools, &self.counters);
        let report = run_pass(&self.steps, &cx, pass);
        self.events.emit(EventLevel::Debug, "maintenance_pass", || {
            serde_json::to_value(&report).unwrap_or_default()
        });
        report
    }

    fn maintenance_loop(&self) {
        while !self.signal.wait(self.config.cleanup_interval) {
            self.run_maintenance();
        }
    }

    /// Returns drained cache contents to their pools.
    fn reclaim(&self, drained: Vec<(usize, Vec<BlockRef>)>) -> usize {
        let mut total = 0;
        for (class, blocks) in drained {
            total += blocks.len();
            AllocatorCounters::sub(&self.counters.cached_blocks, blocks.len());
            if let Some(pool) = self.pools.get(class) {
                pool.reclaim(blocks);
            }
        }
        total
    }

    fn invalid_free(&self, addr: usize, reason: &'static str) {
        AllocatorCounters::inc(&self.counters.invalid_frees);
        self.events.emit(EventLevel::Warn, "invalid_free", || {
            json!({ "addr": format!("{addr:#x}"), "reason": reason })
        });
    }

    fn allocation_failed(&self, size: usize) -> Option<NonNull<u8>> {
        AllocatorCounters::inc(&self.counters.failed_allocations);
        self.events
            .emit(EventLevel::Warn, "allocation_failed", || json!({ "size": size }));
        None
    }
}

impl CacheOwner for Inner {
    fn release_slot(&self, slot: &Arc<CacheSlot>) {
        self.registry.unregister(slot);
        let blocks = self.reclaim(slot.retire());
        self.events.emit(EventLevel::Debug, "thread_cache_drained", || {
            json!({ "thread": format!("{:?}", slot.thread()), "blocks": blocks })
        });
    }
}

impl Drop for Inner {
    fn drop(&mut self) {
        // Runs on whichever thread drops the last reference, possibly inside a
        // thread-local destructor, so it must not touch thread-locals.
        for slot in self.registry.take_all() {
            let drained = slot.retire();
            self.reclaim(drained);
        }
    }
}

/// Configures and constructs an [`Allocator`].
pub struct AllocatorBuilder {
    config: AllocatorConfig,
    platform: Arc<dyn PlatformAllocator>,
    sink: Arc<dyn EventSink>,
    steps: Option<Vec<Box<dyn MaintenanceStep>>>,
    background_maintenance: bool,
}

impl AllocatorBuilder {
    #[must_use]
    pub fn new(config: AllocatorConfig) -> Self {
        Self {
            config,
            platform: Arc::new(SystemAllocator),
            sink: Arc::new(NullSink),
            steps: None,
            background_maintenance: true,
        }
    }

    /// Memory source for pool carving and oversized requests.
    #[must_use]
    pub fn platform(mut self, platform: Arc<dyn PlatformAllocator>) -> Self {
        self.platform = platform;
        self
    }

    #[must_use]
    pub fn event_sink(mut self, sink: Arc<dyn EventSink>) -> Self {
        self.sink = sink;
        self
    }

    /// Replaces the default maintenance steps (idle eviction, pressure trim,
    /// no-op fragmentation estimate).
    #[must_use]
    pub fn maintenance_steps(mut self, steps: Vec<Box<dyn MaintenanceStep>>) -> Self {
        self.steps = Some(steps);
        self
    }

    /// Whether to start the periodic maintenance thread. `cleanup()` works
    /// either way.
    #[must_use]
    pub fn background_maintenance(mut self, enabled: bool) -> Self {
        self.background_maintenance = enabled;
        self
    }

    pub fn build(self) -> Result<Allocator, BuildError> {
        self.config.validate()?;
        let classes = SizeClassTable::new(&self.config.size_classes, self.config.alignment)?;
        let id = NEXT_ALLOCATOR_ID.fetch_add(1, Ordering::Relaxed);
        let table = Arc::new(BlockTable::new());

        let pools = (0..classes.len())
            .map(|class| {
                let size = classes.class_size(class);
                SizeClassPool::new(
                    PoolId { allocator: id, class },
                    size,
                    classes.alignment(),
                    Arc::clone(&self.platform),
                    Arc::clone(&table),
                )
                .ok_or(ConfigError::ClassTooLarge {
                    size,
                    alignment: classes.alignment(),
                })
            })
            .collect::<Result<Vec<_>, _>>()?;

        let inner = Arc::new(Inner {
            id,
            registry: CacheRegistry::new(classes.len(), self.config.thread_cache_capacity),
            classes,
            pools,
            table,
            platform: self.platform,
            counters: AllocatorCounters::new(),
            events: EventEmitter::new(id, self.sink),
            steps: self.steps.unwrap_or_else(default_steps),
            maintenance: Mutex::new(()),
            signal: WorkerSignal::default(),
            shutdown: AtomicBool::new(false),
            config: self.config,
        });

        let worker = if self.background_maintenance {
            let worker_inner = Arc::clone(&inner);
            let handle = std::thread::Builder::new()
                .name(format!("poolmalloc-maintenance-{id}"))
                .spawn(move || worker_inner.maintenance_loop())?;
            Some(handle)
        } else {
            None
        };

        inner.events.emit(EventLevel::Info, "allocator_started", || {
            json!({
                "size_classes": inner.classes.sizes(),
                "alignment": inner.classes.alignment(),
                "thread_cache": inner.config.enable_thread_cache,
                "background_maintenance": worker.is_some(),
            })
        });

        Ok(Allocator {
            inner,
            worker: Mutex::new(worker),
        })
    }
}

/// Thread-aware size-class allocator.
///
/// Share it between threads by reference or inside an `Arc`. Dropping it
/// shuts it down, joins the maintenance thread, and returns every idle block
/// to the platform; blocks still held by callers are leaked.
pub struct Allocator {
    inner: Arc<Inner>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl Allocator {
    /// Builds an allocator with the system heap and no event sink.
    pub fn new(config: AllocatorConfig) -> Result<Self, BuildError> {
        AllocatorBuilder::new(config).build()
    }

    #[must_use]
    pub fn builder(config: AllocatorConfig) -> AllocatorBuilder {
        AllocatorBuilder::new(config)
    }

    /// Process-unique identity of this allocator.
    #[must_use]
    pub fn id(&self) -> u64 {
        self.inner.id
    }

    /// Size class index for `size`, or `None` for platform-served sizes.
    #[must_use]
    pub fn classify(&self, size: usize) -> Option<usize> {
        self.inner.classes.classify(size)
    }

    /// Returns a block of at least `size` bytes aligned to the configured
    /// alignment.
    ///
    /// `None` for a zero size, after shutdown, or when the platform allocator
    /// refuses.
    #[must_use]
    pub fn allocate(&self, size: usize) -> Option<NonNull<u8>> {
        let inner = &*self.inner;
        if size == 0 || self.is_shutdown() {
            return None;
        }
        AllocatorCounters::inc(&inner.counters.alloc_count);
        match inner.classes.classify(size) {
            Some(class) => self.allocate_pooled(class, size),
            None => self.allocate_fallback(size),
        }
    }

    fn allocate_pooled(&self, class: usize, size: usize) -> Option<NonNull<u8>> {
        let inner = &*self.inner;
        let class_size = inner.classes.class_size(class);

        if inner.config.enable_thread_cache {
            let cached = self
                .local_slot()
                .and_then(|slot| slot.with_cache(|cache| cache.try_take(class)))
                .flatten();
            if let Some(block) = cached {
                AllocatorCounters::inc(&inner.counters.thread_cache_hits);
                AllocatorCounters::sub(&inner.counters.cached_blocks, 1);
                AllocatorCounters::sub(&inner.counters.current_free, class_size);
                block.header.acquire(size);
                inner.counters.record_alloc(size);
                return NonNull::new(block.addr as *mut u8);
            }
            AllocatorCounters::inc(&inner.counters.thread_cache_misses);
        }

        let Some(got) = inner.pools[class].allocate(size) else {
            return inner.allocation_failed(size);
        };
        if !got.fresh {
            AllocatorCounters::sub(&inner.counters.current_free, class_size);
        }
        inner.counters.record_alloc(size);
        NonNull::new(got.block.addr as *mut u8)
    }

    fn allocate_fallback(&self, size: usize) -> Option<NonNull<u8>> {
        let inner = &*self.inner;
        let Ok(layout) = Layout::from_size_align(size, inner.classes.alignment()) else {
            return inner.allocation_failed(size);
        };
        let Some(ptr) = inner.platform.allocate(layout) else {
            return inner.allocation_failed(size);
        };
        inner
            .table
            .insert(ptr.as_ptr() as usize, Arc::new(BlockHeader::fallback(size)));
        AllocatorCounters::inc(&inner.counters.fallback_blocks);
        AllocatorCounters::add(&inner.counters.fallback_bytes, size);
        inner.counters.record_alloc(size);
        Some(ptr)
    }

    /// Returns a block to the allocator.
    ///
    /// Null is ignored. So are pointers this allocator never handed out and
    /// blocks that are already free; those are counted in `invalid_frees`.
    ///
    /// # Safety
    ///
    /// If `ptr` is a live block from this allocator, nothing may access it
    /// after this call.
    pub unsafe fn deallocate(&self, ptr: *mut u8) {
        let Some(ptr) = NonNull::new(ptr) else {
            return;
        };
        let inner = &*self.inner;
        let addr = ptr.as_ptr() as usize;
        let Some(header) = inner.table.get(addr) else {
            inner.invalid_free(addr, "unknown_pointer");
            return;
        };

        match header.owner() {
            Owner::Platform => {
                let requested = header.requested_size();
                if !header.release(Owner::Platform) {
                    inner.invalid_free(addr, "double_free");
                    return;
                }
                inner.table.remove(addr);
                let size = header.class_size();
                if let Ok(layout) = Layout::from_size_align(size, inner.classes.alignment()) {
                    // SAFETY: the block was allocated by this platform with
                    // exactly this layout in `allocate_fallback`, and the
                    // successful release makes this the only free of it.
                    unsafe { inner.platform.deallocate(ptr, layout) };
                }
                AllocatorCounters::sub(&inner.counters.fallback_blocks, 1);
                AllocatorCounters::sub(&inner.counters.fallback_bytes, size);
                inner.counters.record_free(requested);
            }
            Owner::Pool(id) => {
                let requested = header.requested_size();
                let class_size = header.class_size();
                AllocatorCounters::add(&inner.counters.current_free, class_size);
                if !self.release_pooled(id.class, BlockRef { addr, header }) {
                    AllocatorCounters::sub(&inner.counters.current_free, class_size);
                    inner.invalid_free(addr, "double_free");
                    return;
                }
                inner.counters.record_free(requested);
            }
        }
    }

    /// Releases a pooled block into the calling thread's cache, or into its
    /// pool when the cache cannot take it. Returns `false` if the
    /// block was not in use.
    fn release_pooled(&self, class: usize, block: BlockRef) -> bool {
        let inner = &*self.inner;
        let pool = &inner.pools[class];
        let slot = if inner.config.enable_thread_cache {
            self.local_slot()
        } else {
            None
        };
        let Some(slot) = slot else {
            return pool.deallocate(block);
        };
        if !block.header.release(Owner::Pool(pool.id())) {
            return false;
        }
        let mut pending = Some(block);
        slot.with_cache(|cache| {
            if let Some(block) = pending.take() {
                match cache.try_put(class, block) {
                    Ok(()) => AllocatorCounters::inc(&inner.counters.cached_blocks),
                    Err(block) => pending = Some(block),
                }
            }
        });
        if let Some(block) = pending {
            pool.push_released(block);
        }
        true
    }

    /// Resizes a block.
    ///
    /// A null `ptr` behaves like [`Allocator::allocate`]. When
    /// `old / 2 < new_size <= old` the same pointer comes back with its
    /// recorded size updated. Otherwise a new block is allocated, the first
    /// `min(old, new_size)` bytes are copied, and the old block is freed.
    ///
    /// Returns `None`, leaving the old block valid and untouched, when
    /// `new_size` is zero, the new allocation fails, or `ptr` is not a live
    /// block of this allocator.
    ///
    /// # Safety
    ///
    /// `ptr` must be null or a block from this allocator that no other thread
    /// is accessing. On a `Some` result other than `ptr` itself, `ptr` must
    /// no longer be used.
    pub unsafe fn reallocate(&self, ptr: *mut u8, new_size: usize) -> Option<NonNull<u8>> {
        let Some(old) = NonNull::new(ptr) else {
            return self.allocate(new_size);
        };
        let inner = &*self.inner;
        let header = inner.table.get(old.as_ptr() as usize)?;
        if !header.is_in_use() || new_size == 0 {
            return None;
        }

        let old_size = header.requested_size();
        if new_size <= old_size && new_size > old_size / 2 {
            let shrink = old_size - new_size;
            header.set_requested_size(new_size);
            AllocatorCounters::sub(&inner.counters.current_used, shrink);
            AllocatorCounters::add(&inner.counters.total_freed, shrink);
            AllocatorCounters::inc(&inner.counters.in_place_reallocs);
            return Some(old);
        }

        let new = self.allocate(new_size)?;
        // SAFETY: `old` is live for `old_size` bytes and `new` for `new_size`;
        // they are distinct blocks so the ranges cannot overlap.
        unsafe {
            std::ptr::copy_nonoverlapping(old.as_ptr(), new.as_ptr(), old_size.min(new_size));
            self.deallocate(old.as_ptr());
        }
        Some(new)
    }

    /// Usable size recorded for a live block.
    #[must_use]
    pub fn usable_size(&self, ptr: *const u8) -> Option<usize> {
        let header = self.inner.table.get(ptr as usize)?;
        header.is_in_use().then(|| header.requested_size())
    }

    /// Snapshot of the global counters and every pool.
    #[must_use]
    pub fn stats(&self) -> AllocatorStats {
        let inner = &*self.inner;
        let pools = inner.pools.iter().map(SizeClassPool::snapshot).collect();
        inner.counters.snapshot(pools, inner.registry.len())
    }

    /// Configuration the allocator was built with.
    #[must_use]
    pub fn config(&self) -> AllocatorConfig {
        self.inner.config.clone()
    }

    /// Runs a maintenance pass now, waiting for any pass already running.
    pub fn cleanup(&self) -> MaintenanceReport {
        self.inner.run_maintenance()
    }

    /// Drains the calling thread's cache back into the pools and forgets it.
    /// The next cached operation on this thread registers a fresh cache.
    pub fn release_thread_cache(&self) {
        if let Some(slot) = thread_cache::forget_local_slot(self.inner.id) {
            self.inner.release_slot(&slot);
        }
    }

    #[must_use]
    pub fn is_shutdown(&self) -> bool {
        self.inner.shutdown.load(Ordering::Acquire)
    }

    /// Stops accepting allocations and joins the maintenance thread.
    ///
    /// Frees are still honoured afterwards. Calling it again does nothing.
    pub fn shutdown(&self) {
        if self.inner.shutdown.swap(true, Ordering::AcqRel) {
            return;
        }
        self.inner.signal.request_shutdown();
        if let Some(handle) = self.worker.lock().take() {
            if handle.join().is_err() {
                self.inner
                    .events
                    .emit(EventLevel::Error, "maintenance_worker_panicked", || json!({}));
            }
        }
        let stats = self.stats();
        self.inner.events.emit(EventLevel::Info, "allocator_shutdown", || {
            json!({
                "current_used": stats.current_used,
                "alloc_count": stats.alloc_count,
                "free_count": stats.free_count,
                "maintenance_passes": stats.maintenance_passes,
            })
        });
    }

    fn local_slot(&self) -> Option<Arc<CacheSlot>> {
        let inner = &self.inner;
        thread_cache::local_slot(inner.id, || {
            if self.is_shutdown() {
                return None;
            }
            let slot = inner.registry.register(std::thread::current().id());
            let owner: Weak<dyn CacheOwner> = Arc::downgrade(inner) as Weak<dyn CacheOwner>;
            Some((slot, owner))
        })
    }
}

impl Drop for Allocator {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl std::fmt::Debug for Allocator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Allocator")
            .field("id", &self.inner.id)
            .field("size_classes", &self.inner.classes.sizes())
            .field("shutdown", &self.is_shutdown())
            .finish()
    }
}
