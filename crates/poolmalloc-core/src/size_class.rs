//! Size class table for small allocations.
//!
//! Classes come from configuration, each rounded up to the block alignment.
//! A request maps to the smallest class that can hold it; anything above the
//! largest class goes to the platform allocator.

use crate::error::ConfigError;

/// Ascending table of block sizes, all multiples of the alignment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SizeClassTable {
    sizes: Vec<usize>,
    alignment: usize,
}

/// Rounds `size` up to the next multiple of `alignment` (a power of two).
///
/// Returns `None` on overflow.
#[must_use]
pub fn round_up(size: usize, alignment: usize) -> Option<usize> {
    let mask = alignment - 1;
    size.checked_add(mask).map(|s| s & !mask)
}

impl SizeClassTable {
    /// Builds the table from raw class sizes.
    ///
    /// Classes that collapse onto the same rounded size are rejected so that
    /// every class index names a distinct pool.
    pub fn new(raw_sizes: &[usize], alignment: usize) -> Result<Self, ConfigError> {
        if !alignment.is_power_of_two() {
            return Err(ConfigError::AlignmentNotPowerOfTwo(alignment));
        }
        if raw_sizes.is_empty() {
            return Err(ConfigError::NoSizeClasses);
        }
        let mut sizes = Vec::with_capacity(raw_sizes.len());
        for (index, &raw) in raw_sizes.iter().enumerate() {
            if raw == 0 {
                return Err(ConfigError::ZeroSizeClass { index });
            }
            let rounded = round_up(raw, alignment).ok_or(ConfigError::ClassTooLarge {
                size: raw,
                alignment,
            })?;
            if let Some(&previous) = sizes.last() {
                if rounded <= previous {
                    return Err(ConfigError::NotAscending {
                        previous,
                        next: rounded,
                    });
                }
            }
            sizes.push(rounded);
        }
        Ok(Self { sizes, alignment })
    }

    /// Index of the smallest class holding `size` bytes, or `None` when the
    /// request belongs to the platform allocator.
    ///
    /// A zero-byte request maps to the first class; callers reject zero
    /// before classifying.
    #[must_use]
    pub fn classify(&self, size: usize) -> Option<usize> {
        // Linear scan is fine for the handful of classes configured in practice.
        self.sizes.iter().position(|&class| size <= class)
    }

    /// Block size of class `index`, or 0 when out of range.
    #[must_use]
    pub fn class_size(&self, index: usize) -> usize {
        self.sizes.get(index).copied().unwrap_or(0)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.sizes.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.sizes.is_empty()
    }

    #[must_use]
    pub fn alignment(&self) -> usize {
        self.alignment
    }

    /// Largest size served from a pool.
    #[must_use]
    pub fn max_class_size(&self) -> usize {
        self.sizes.last().copied().unwrap_or(0)
    }

    pub fn sizes(&self) -> &[usize] {
        &self.sizes
    }
}
