//! Scope-bound ownership of a single allocation.

use std::marker::PhantomData;
use std::mem::MaybeUninit;
use std::ptr::NonNull;

use crate::allocator::Allocator;
use crate::error::AllocError;

/// Owns one block from an [`Allocator`] and frees it when dropped.
///
/// Not `Clone`, and neither `Send` nor `Sync`: the block is released through
/// the creating thread's cache.
pub struct ScopedHandle<'a> {
    allocator: &'a Allocator,
    ptr: NonNull<u8>,
    size: usize,
    _not_send: PhantomData<*mut u8>,
}

impl<'a> ScopedHandle<'a> {
    /// Allocates `size` bytes from `allocator`.
    pub fn new(allocator: &'a Allocator, size: usize) -> Result<Self, AllocError> {
        if size == 0 {
            return Err(AllocError::ZeroSize);
        }
        if allocator.is_shutdown() {
            return Err(AllocError::ShutDown);
        }
        let ptr = allocator
            .allocate(size)
            .ok_or(AllocError::Exhausted { size })?;
        Ok(Self {
            allocator,
            ptr,
            size,
            _not_send: PhantomData,
        })
    }

    #[must_use]
    pub fn as_ptr(&self) -> *mut u8 {
        self.ptr.as_ptr()
    }

    #[must_use]
    pub fn size(&self) -> usize {
        self.size
    }

    /// The block's bytes, which start out uninitialized.
    pub fn as_uninit_slice_mut(&mut self) -> &mut [MaybeUninit<u8>] {
        // SAFETY: the block is live for `size` bytes while self exists and
        // only this handle can reach it.
        unsafe { std::slice::from_raw_parts_mut(self.ptr.as_ptr().cast(), self.size) }
    }

    /// Gives up ownership without freeing. The caller becomes responsible for
    /// passing the pointer to [`Allocator::deallocate`].
    #[must_use]
    pub fn into_raw(self) -> NonNull<u8> {
        let ptr = self.ptr;
        std::mem::forget(self);
        ptr
    }
}

impl Drop for ScopedHandle<'_> {
    fn drop(&mut self) {
        // SAFETY: the handle owns the block and is going away.
        unsafe { self.allocator.deallocate(self.ptr.as_ptr()) };
    }
}

impl std::fmt::Debug for ScopedHandle<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ScopedHandle")
            .field("ptr", &self.ptr)
            .field("size", &self.size)
            .finish()
    }
}
