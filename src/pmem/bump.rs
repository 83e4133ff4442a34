//! Bootstrap bump allocator.
//!
//! Hands out zero-filled memory from a fixed heap span, monotonically and
//! never reclaimed. It exists only to carve out the frame allocator's own
//! bookkeeping tables before any other allocator is available.

use super::alloc::{align_up, Error, Result};
use core::{mem, ptr, slice};

/// A monotonic allocator over a raw heap span.
pub struct BumpAllocator {
    start: usize,
    size: usize,
    offset: usize,
}

impl BumpAllocator {
    /// Create a bump allocator over the span `start..start + size`.
    ///
    /// # Safety
    ///
    /// The span must be valid for reads and writes, exclusively owned by
    /// this allocator, and must stay valid forever, because the handed-out
    /// slices have a `'static` lifetime.
    pub unsafe fn new(start: *mut u8, size: usize) -> Self {
        Self {
            start: start as usize,
            size,
            offset: 0,
        }
    }

    /// Carve a zero-filled slice of `len` elements out of the heap span.
    ///
    /// The cursor is aligned up to `T`'s alignment before the cut, so the
    /// returned slice is always properly aligned.
    ///
    /// # Safety
    ///
    /// `T` must be a type for which the all-zero bit pattern is a valid
    /// value.
    pub unsafe fn alloc_slice<T>(&mut self, len: usize) -> Result<&'static mut [T]> {
        let offset = align_up(self.start + self.offset, mem::align_of::<T>()) - self.start;
        let bytes = len
            .checked_mul(mem::size_of::<T>())
            .ok_or(Error::HeapExhausted)?;

        let end = offset.checked_add(bytes).ok_or(Error::HeapExhausted)?;
        if end > self.size {
            return Err(Error::HeapExhausted);
        }
        self.offset = end;

        let ptr = (self.start + offset) as *mut T;
        ptr::write_bytes(ptr as *mut u8, 0, bytes);
        Ok(slice::from_raw_parts_mut(ptr, len))
    }

    /// The byte span consumed so far, as `(start, end)` addresses.
    ///
    /// Used after initialization to reserve the frames holding the
    /// bookkeeping tables.
    pub fn consumed_span(&self) -> (usize, usize) {
        (self.start, self.start + self.offset)
    }
}
