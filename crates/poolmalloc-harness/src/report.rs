//! Report generation for stress runs.

use poolmalloc_core::AllocatorStats;
use serde::{Deserialize, Serialize};

use crate::workload::StressConfig;

/// Outcome of one stress run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StressReport {
    pub config: StressConfig,
    pub elapsed_us: u64,
    pub allocations: u64,
    pub frees: u64,
    pub failed_allocations: u64,
    /// Times an address was handed out while another worker still held it.
    pub aliasing_violations: u64,
    /// Blocks whose stamp changed between allocation and free.
    pub corrupted_blocks: u64,
    pub kept_blocks: u64,
    pub kept_bytes: u64,
    /// Whether `current_used` grew by exactly the kept bytes.
    pub balanced: bool,
    /// Allocator snapshot taken after the workers joined.
    pub stats: AllocatorStats,
}

impl StressReport {
    /// No aliasing, no overwritten blocks, and usage accounted for.
    #[must_use]
    pub fn is_clean(&self) -> bool {
        self.aliasing_violations == 0 && self.corrupted_blocks == 0 && self.balanced
    }

    #[must_use]
    pub fn ops_per_sec(&self) -> f64 {
        if self.elapsed_us == 0 {
            return 0.0;
        }
        (self.allocations + self.frees) as f64 * 1_000_000.0 / self.elapsed_us as f64
    }

    /// Render the report as markdown.
    #[must_use]
    pub fn to_markdown(&self) -> String {
        let mut out = String::new();
        out.push_str("# poolmalloc stress report\n\n");
        out.push_str(&format!(
            "- Status: {}\n",
            if self.is_clean() { "CLEAN" } else { "FAILED" }
        ));
        out.push_str(&format!(
            "- Workload: {} threads x {} iterations, sizes {}..={}, seed {:#x}\n",
            self.config.threads,
            self.config.iterations,
            self.config.min_size,
            self.config.max_size,
            self.config.seed
        ));
        out.push_str(&format!("- Elapsed: {} us\n", self.elapsed_us));
        out.push_str(&format!("- Throughput: {:.0} ops/s\n\n", self.ops_per_sec()));

        out.push_str("| Check | Value |\n");
        out.push_str("|-------|-------|\n");
        let rows = [
            ("allocations", self.allocations.to_string()),
            ("frees", self.frees.to_string()),
            ("failed allocations", self.failed_allocations.to_string()),
            ("aliasing violations", self.aliasing_violations.to_string()),
            ("corrupted blocks", self.corrupted_blocks.to_string()),
            (
                "kept",
                format!("{} blocks / {} bytes", self.kept_blocks, self.kept_bytes),
            ),
            ("balanced", self.balanced.to_string()),
            (
                "thread cache hit/miss",
                format!(
                    "{}/{}",
                    self.stats.thread_cache_hits, self.stats.thread_cache_misses
                ),
            ),
        ];
        for (check, value) in rows {
            out.push_str(&format!("| {check} | {value} |\n"));
        }

        out.push_str("\n```text\n");
        out.push_str(&self.stats.to_string());
        out.push_str("```\n");
        out
    }

    /// Render the report as JSON.
    #[must_use]
    pub fn to_json(&self) -> String {
        serde_json::to_string_pretty(self).unwrap_or_else(|e| format!("{{\"error\": \"{e}\"}}"))
    }
}
