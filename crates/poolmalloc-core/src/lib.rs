//! # poolmalloc-core
//!
//! A thread-aware allocator that serves small requests from fixed size-class
//! pools and hands anything larger to the platform allocator.
//!
//! Requests flow through three tiers:
//! 1. the calling thread's [`thread_cache`] (never waits on other threads),
//! 2. the matching [`pool::SizeClassPool`] (one lock per class),
//! 3. the [`platform::PlatformAllocator`] for oversized requests.
//!
//! Block metadata lives in an address-keyed side table ([`block::BlockTable`]),
//! never in front of the payload. Raw memory handling is confined to the
//! modules that opt back into `unsafe`.

#![deny(unsafe_code)]

#[allow(unsafe_code)]
pub mod allocator;
pub mod block;
pub mod config;
pub mod error;
pub mod events;
#[allow(unsafe_code)]
pub mod handle;
pub mod maintenance;
#[allow(unsafe_code)]
pub mod platform;
#[allow(unsafe_code)]
pub mod pool;
pub mod size_class;
pub mod stats;
pub mod thread_cache;

pub use allocator::{Allocator, AllocatorBuilder};
pub use config::AllocatorConfig;
pub use error::{AllocError, BuildError, ConfigError};
pub use events::{AllocatorEvent, EventLevel, EventSink, JsonLinesSink, MemorySink, NullSink};
pub use handle::ScopedHandle;
pub use maintenance::{
    FreeRatioFragmentation, IdleEviction, MaintenanceContext, MaintenanceReport, MaintenanceStep,
    NoopFragmentation, PressureTrim, StepReport,
};
pub use platform::{PlatformAllocator, SystemAllocator};
pub use stats::{AllocatorStats, PoolStats};
