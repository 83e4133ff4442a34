//! Interaction with physical memory.

pub mod alloc;
pub mod bump;
pub mod linked_list;

pub use self::alloc::{AllocStats, Error, FrameAllocator, Result, FRAME_SIZE, MAX_ORDER};
pub use bump::BumpAllocator;

use self::alloc::{align_down, align_up, order_for_frames};
use log::info;
use spin::Mutex;

/// The kernel-facing handle around the frame allocator.
///
/// Constructed once at boot by [`Pmem::init`] and then threaded by
/// reference into every subsystem that needs frames. The lock only
/// serializes the bounded table updates of a single operation, nothing
/// inside it ever blocks.
pub struct Pmem {
    inner: Mutex<FrameAllocator>,
}

impl Pmem {
    /// Initialize physical memory management.
    ///
    /// `total_bytes` is the installed RAM size as reported by the
    /// device-tree walker, `base` the address where it starts. The
    /// allocator's bookkeeping tables are carved out of the bootstrap heap
    /// at `heap_start..heap_start + heap_size`, and the frames spanned by
    /// those tables are reserved before the handle is returned, so they can
    /// never be handed out.
    ///
    /// A reservation failure here means the boot memory layout is
    /// misconfigured; the caller is expected to halt.
    ///
    /// # Safety
    ///
    /// The heap span must be valid for reads and writes for the rest of the
    /// kernel's lifetime, exclusively owned by this allocator, and must lie
    /// inside the managed region `base..base + total_bytes`.
    pub unsafe fn init(
        base: usize,
        total_bytes: usize,
        heap_start: *mut u8,
        heap_size: usize,
    ) -> Result<Self> {
        info!("memory size: {}", crate::unit::bytes(total_bytes));

        let mut bump = BumpAllocator::new(heap_start, heap_size);
        let mut allocator = FrameAllocator::new(base, total_bytes, &mut bump)?;

        // reserve the frames holding the tables the bump allocator just
        // handed out, widened to frame boundaries
        let (tables_start, tables_end) = bump.consumed_span();
        let start = align_down(tables_start, FRAME_SIZE);
        let end = align_up(tables_end, FRAME_SIZE);
        let first = allocator.addr_to_frame(start)?;
        allocator.reserve(first, (end - start) / FRAME_SIZE)?;

        info!("frame allocator initialized");
        Ok(Self {
            inner: Mutex::new(allocator),
        })
    }

    /// Allocate exactly one frame and return its physical address.
    pub fn get_free_page(&self) -> Result<usize> {
        let mut allocator = self.inner.lock();
        let frame = allocator.allocate(0)?;
        Ok(allocator.frame_to_addr(frame))
    }

    /// Allocate the smallest power-of-two block with at least `count`
    /// frames.
    ///
    /// Returns the physical address and the order actually granted, so the
    /// caller knows the true size of the block. A `count` of zero still
    /// allocates a single frame.
    pub fn get_contiguous_pages(&self, count: usize) -> Result<(usize, usize)> {
        let order = order_for_frames(count);
        let mut allocator = self.inner.lock();
        let frame = allocator.allocate(order)?;
        Ok((allocator.frame_to_addr(frame), order))
    }

    /// Free a previously allocated block by the physical address of its
    /// head frame.
    pub fn return_page(&self, addr: usize) -> Result<()> {
        let mut allocator = self.inner.lock();
        let frame = allocator.addr_to_frame(addr)?;
        allocator.free(frame)
    }

    /// Permanently carve the frame range `[start, start + count)` out of
    /// the free pool. Initialization-time use only, see
    /// [`FrameAllocator::reserve`](alloc::BuddyAllocator::reserve).
    pub fn reserve(&self, start: usize, count: usize) -> Result<()> {
        self.inner.lock().reserve(start, count)
    }

    /// Return the statistics of the frame allocator.
    pub fn stats(&self) -> AllocStats {
        self.inner.lock().stats()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::unit::MIB;
    use std::alloc::{alloc_zeroed, Layout};

    /// A frame-aligned host arena that stands in for the start of physical
    /// memory. The managed region extends past it conceptually; only the
    /// bookkeeping tables are real memory.
    fn boot_arena(size: usize) -> *mut u8 {
        let layout = Layout::from_size_align(size, FRAME_SIZE).unwrap();
        unsafe { alloc_zeroed(layout) }
    }

    fn init_pmem() -> (Pmem, usize) {
        let heap = boot_arena(64 * 1024);
        let base = heap as usize;
        let pmem = unsafe { Pmem::init(base, MIB, heap, 64 * 1024).unwrap() };
        (pmem, base)
    }

    #[test]
    fn init_reserves_the_bookkeeping_tables() {
        let (pmem, base) = init_pmem();

        // 256 frames of tables fit into one frame, which must be reserved
        let stats = pmem.stats();
        assert_eq!(stats.total, MIB);
        assert_eq!(stats.allocated, FRAME_SIZE);

        // the reserved frame is never handed out
        let mut handed = Vec::new();
        while let Ok(addr) = pmem.get_free_page() {
            assert_ne!(addr, base);
            handed.push(addr);
        }
        assert_eq!(handed.len(), MIB / FRAME_SIZE - 1);
    }

    #[test]
    fn page_round_trip() {
        let (pmem, base) = init_pmem();

        let addr = pmem.get_free_page().unwrap();
        assert_eq!(addr, base + FRAME_SIZE);
        assert_eq!(addr % FRAME_SIZE, 0);

        pmem.return_page(addr).unwrap();
        assert_eq!(pmem.stats().allocated, FRAME_SIZE);
        // the same page is available again
        assert_eq!(pmem.get_free_page().unwrap(), addr);
    }

    #[test]
    fn contiguous_pages_report_the_granted_order() {
        let (pmem, base) = init_pmem();

        let (addr, order) = pmem.get_contiguous_pages(3).unwrap();
        assert_eq!(order, 2);
        // blocks are aligned to their size relative to the memory base
        assert_eq!((addr - base) % (4 * FRAME_SIZE), 0);
        pmem.return_page(addr).unwrap();

        let (_, order) = pmem.get_contiguous_pages(128).unwrap();
        assert_eq!(order, 7);

        // more frames than the maximal block can hold
        assert_eq!(
            pmem.get_contiguous_pages(129).unwrap_err(),
            Error::InvalidOrder
        );
    }

    #[test]
    fn return_page_rejects_bad_addresses() {
        let (pmem, base) = init_pmem();
        let addr = pmem.get_free_page().unwrap();

        assert_eq!(
            pmem.return_page(addr + 1).unwrap_err(),
            Error::MisalignedAddress
        );
        assert_eq!(
            pmem.return_page(base + 2 * MIB).unwrap_err(),
            Error::MisalignedAddress
        );
        assert_eq!(
            pmem.return_page(base.wrapping_sub(FRAME_SIZE)).unwrap_err(),
            Error::MisalignedAddress
        );
    }

    #[test]
    fn boot_time_reservation_through_the_handle() {
        let (pmem, base) = init_pmem();

        // carve out a pretend boot image at frames 100..103
        pmem.reserve(100, 3).unwrap();
        let mut handed = Vec::new();
        while let Ok(addr) = pmem.get_free_page() {
            handed.push((addr - base) / FRAME_SIZE);
        }
        assert!(handed.iter().all(|frame| !(100..103).contains(frame)));
    }
}
