//! Boundary to the underlying heap.
//!
//! Pools carve fresh blocks here and oversized requests bypass the pools
//! entirely. Implementations must be thread-safe; the allocator calls them
//! from any thread without extra locking.

use std::alloc::Layout;
use std::ptr::NonNull;

/// Raw memory source backing the allocator.
pub trait PlatformAllocator: Send + Sync {
    /// Returns a block satisfying `layout`, or `None` when the heap refuses.
    fn allocate(&self, layout: Layout) -> Option<NonNull<u8>>;

    /// Returns a block to the heap.
    ///
    /// # Safety
    ///
    /// `ptr` must have come from [`PlatformAllocator::allocate`] on this same
    /// instance with exactly `layout`, and must not be used afterwards.
    unsafe fn deallocate(&self, ptr: NonNull<u8>, layout: Layout);
}

/// The process-wide global allocator (`std::alloc`).
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemAllocator;

impl PlatformAllocator for SystemAllocator {
    fn allocate(&self, layout: Layout) -> Option<NonNull<u8>> {
        if layout.size() == 0 {
            return None;
        }
        // SAFETY: layout has a non-zero size.
        let raw = unsafe { std::alloc::alloc(layout) };
        NonNull::new(raw)
    }

    unsafe fn deallocate(&self, ptr: NonNull<u8>, layout: Layout) {
        // SAFETY: caller guarantees ptr was produced by `allocate` with this layout.
        unsafe { std::alloc::dealloc(ptr.as_ptr(), layout) }
    }
}
