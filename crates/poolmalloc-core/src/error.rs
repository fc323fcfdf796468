//! Error types for configuration, construction, and scoped allocation.
//!
//! The allocation hot path never returns these: `allocate` and friends
//! signal failure with `None`. Only construction and [`crate::ScopedHandle`]
//! turn failures into values.

use thiserror::Error;

/// Rejected configuration values.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    #[error("alignment {0} is not a power of two")]
    AlignmentNotPowerOfTwo(usize),
    #[error("size class table is empty")]
    NoSizeClasses,
    #[error("size class {index} has zero size")]
    ZeroSizeClass { index: usize },
    #[error("size classes must be strictly ascending: {previous} then {next}")]
    NotAscending { previous: usize, next: usize },
    #[error("size class {size} cannot be laid out at alignment {alignment}")]
    ClassTooLarge { size: usize, alignment: usize },
    #[error("thread cache capacity must be at least 1")]
    ZeroCacheCapacity,
    #[error("cleanup interval must be non-zero")]
    ZeroCleanupInterval,
    #[error("invalid value {value:?} for {key}")]
    InvalidOverride { key: &'static str, value: String },
}

/// Failure to construct an [`crate::Allocator`].
#[derive(Debug, Error)]
pub enum BuildError {
    #[error("invalid configuration: {0}")]
    InvalidConfig(#[from] ConfigError),
    #[error("failed to spawn maintenance thread: {0}")]
    SpawnWorker(#[from] std::io::Error),
}

/// Failure surfaced by [`crate::ScopedHandle::new`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum AllocError {
    #[error("zero-sized allocation requested")]
    ZeroSize,
    #[error("allocator is shut down")]
    ShutDown,
    #[error("allocation of {size} bytes failed")]
    Exhausted { size: usize },
}
