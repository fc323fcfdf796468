//! Stress tooling for poolmalloc.
//!
//! This crate provides:
//! - A deterministic multi-threaded allocate/free workload with alias and
//!   overwrite detection
//! - Report generation: human-readable markdown + machine-readable JSON
//! - The `harness` CLI wrapping both

#![deny(unsafe_code)]

pub mod report;
#[allow(unsafe_code)]
pub mod workload;

pub use report::StressReport;
pub use workload::{StressConfig, XorShift64, run_stress};

use poolmalloc_core::BuildError;

/// Failures surfaced by the harness.
#[derive(Debug, thiserror::Error)]
pub enum HarnessError {
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("could not build allocator: {0}")]
    Build(#[from] BuildError),
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
}
