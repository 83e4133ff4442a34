//! Frame allocation APIs.

pub mod buddy;
pub use buddy::BuddyAllocator;

use crate::unit::{self, KIB};
use core::fmt;
use displaydoc_lite::displaydoc;

/// The size of a single physical frame.
///
/// This is also the order-0 block size inside the buddy allocator.
pub const FRAME_SIZE: usize = 4 * KIB;

/// The maximum order of the buddy allocator (inclusive).
///
/// The largest block is `2^MAX_ORDER` frames, 512 KiB with 4 KiB frames.
pub const MAX_ORDER: usize = 7;

/// The production frame allocator, at the kernel's maximum order.
pub type FrameAllocator = BuddyAllocator<MAX_ORDER>;

/// Result for every frame allocation operation.
pub type Result<T, E = Error> = core::result::Result<T, E>;

/// Aligns the given `addr` upwards to `align`.
///
/// `align` must be a power of two.
pub fn align_up(addr: usize, align: usize) -> usize {
    (addr + align - 1) & !(align - 1)
}

/// Aligns the given `addr` downwards to `align`.
///
/// `align` must be a power of two.
pub fn align_down(addr: usize, align: usize) -> usize {
    addr & !(align - 1)
}

/// The size in bytes of a block of the given order.
pub fn size_for_order(order: usize) -> usize {
    (1 << order) * FRAME_SIZE
}

/// The smallest order whose block holds at least `count` frames.
///
/// The returned order may be larger than [`MAX_ORDER`], in which case no
/// single block can satisfy the request.
pub fn order_for_frames(count: usize) -> usize {
    count.next_power_of_two().trailing_zeros() as usize
}

displaydoc! {
    /// Any error that can happen while allocating, freeing or reserving
    /// frames.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub enum Error {
        /// the requested order is outside the supported range
        InvalidOrder,
        /// no free block is large enough to satisfy the request
        OutOfMemory,
        /// the frame is not the head of a live allocation
        NotAllocated,
        /// the address is not frame aligned or outside the managed region
        MisalignedAddress,
        /// the reservation target is not entirely free memory
        InvalidReservation,
        /// the bootstrap heap has no room left for the allocator tables
        HeapExhausted,
    }
}

/// Statistics for a frame allocator.
#[derive(Debug, Clone)]
pub struct AllocStats {
    /// The name of the allocator that collected these stats.
    pub name: &'static str,
    /// The number of bytes currently allocated.
    pub allocated: usize,
    /// The number of bytes that are left for allocation.
    pub free: usize,
    /// The total number of bytes this allocator manages.
    pub total: usize,
}

impl AllocStats {
    /// Create a new [`AllocStats`] instance for the given allocator name.
    pub const fn with_name(name: &'static str) -> Self {
        Self {
            name,
            allocated: 0,
            free: 0,
            total: 0,
        }
    }
}

impl fmt::Display for AllocStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "{}", self.name)?;
        self.name.chars().try_for_each(|_| write!(f, "~"))?;
        writeln!(f, "\nAllocated: {}", unit::bytes(self.allocated))?;
        writeln!(f, "Free: {}", unit::bytes(self.free))?;
        writeln!(f, "Total: {}", unit::bytes(self.total))?;
        Ok(())
    }
}
