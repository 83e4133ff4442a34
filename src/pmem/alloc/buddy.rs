//! Implementation of the buddy allocator that manages all physical frames.
//!
//! Frames are identified by their zero-based index relative to the managed
//! memory base. Free blocks are tracked in one intrusive list per order; a
//! tag per frame records whether the frame heads a free block, heads an
//! allocation, or sits inside one. Two blocks of order `k` are buddies when
//! their indices differ exactly in bit `k`, so the buddy of any block is
//! found with a single XOR and freed buddies can be merged back greedily.
//!
//! The engine never dereferences the memory it manages. All of its state
//! lives in tables carved from the bootstrap [`BumpAllocator`] once, at
//! construction, and only ever re-tagged afterwards.

use super::{AllocStats, Error, Result, FRAME_SIZE};
use crate::pmem::{
    bump::BumpAllocator,
    linked_list::{FreeLists, LinkNode},
};
use log::{debug, trace};

/// Per-frame state, packed into one byte.
///
/// Non-negative values mark the frame as the head of a *free* block of that
/// order. Negative values are [`FREE_BODY`](FrameTag::FREE_BODY) for frames
/// absorbed into a larger free block, [`ALLOCATED`](FrameTag::ALLOCATED) for
/// the non-head frames of an allocation (and for reserved frames, which are
/// never freeable), and `-3 - order` for the head of an allocated block.
/// Recording the order in the head tag is what lets [`BuddyAllocator::free`]
/// return the entire block and reject non-head frames.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(transparent)]
pub struct FrameTag(i8);

impl FrameTag {
    /// A frame inside a larger free block, not the head.
    pub const FREE_BODY: FrameTag = FrameTag(-1);
    /// A frame inside an allocation, or a permanently reserved frame.
    pub const ALLOCATED: FrameTag = FrameTag(-2);

    /// The head of a free block of the given order.
    pub fn free(order: usize) -> Self {
        FrameTag(order as i8)
    }

    /// The head of an allocated block of the given order.
    pub fn allocated_head(order: usize) -> Self {
        FrameTag(-3 - order as i8)
    }

    /// The order of the free block this frame heads, if it heads one.
    pub fn free_order(self) -> Option<usize> {
        if self.0 >= 0 {
            Some(self.0 as usize)
        } else {
            None
        }
    }

    /// The order of the allocated block this frame heads, if it heads one.
    pub fn allocated_order(self) -> Option<usize> {
        if self.0 <= -3 {
            Some((-3 - self.0) as usize)
        } else {
            None
        }
    }
}

/// The central structure that manages every physical frame using the buddy
/// algorithm.
///
/// `MAX_ORDER` is the largest supported order (inclusive); the production
/// instantiation is [`FrameAllocator`](super::FrameAllocator).
pub struct BuddyAllocator<const MAX_ORDER: usize> {
    tags: &'static mut [FrameTag],
    lists: FreeLists,
    base: usize,
    frames: usize,
    stats: AllocStats,
}

impl<const MAX_ORDER: usize> BuddyAllocator<MAX_ORDER> {
    /// Create the allocator for the physical region starting at `base` and
    /// spanning `total_bytes`, carving its bookkeeping tables out of `bump`.
    ///
    /// Every aligned run of `2^MAX_ORDER` frames is registered as one free
    /// block of the maximum order. A trailing region smaller than one
    /// maximal block is never registered and stays unusable; memory sizes
    /// are expected to be a multiple of the maximal block size.
    ///
    /// Note that this does *not* reserve the frames occupied by the tables
    /// themselves. The caller knows where the bump heap lives and must
    /// follow up with [`reserve`](Self::reserve), as [`Pmem::init`] does.
    ///
    /// [`Pmem::init`]: crate::pmem::Pmem::init
    pub fn new(base: usize, total_bytes: usize, bump: &mut BumpAllocator) -> Result<Self> {
        let frames = total_bytes / FRAME_SIZE;

        // The all-zero pattern is a valid value for every table element.
        let tags = unsafe { bump.alloc_slice::<FrameTag>(frames)? };
        let nodes = unsafe { bump.alloc_slice::<LinkNode>(frames)? };
        let heads = unsafe { bump.alloc_slice::<u32>(MAX_ORDER + 1)? };
        let tails = unsafe { bump.alloc_slice::<u32>(MAX_ORDER + 1)? };

        for tag in tags.iter_mut() {
            *tag = FrameTag::FREE_BODY;
        }
        let mut lists = FreeLists::new(nodes, heads, tails);

        let step = 1 << MAX_ORDER;
        let mut index = 0;
        while index + step <= frames {
            tags[index] = FrameTag::free(MAX_ORDER);
            lists.push(MAX_ORDER, index as u32);
            index += step;
        }

        let mut stats = AllocStats::with_name("Frame Allocator");
        stats.total = index * FRAME_SIZE;
        stats.free = index * FRAME_SIZE;

        debug!(
            "frame allocator manages {} frames ({}) at {:#x}",
            index,
            crate::unit::bytes(stats.total),
            base
        );

        Ok(Self {
            tags,
            lists,
            base,
            frames,
            stats,
        })
    }

    /// The base address of the managed region.
    pub fn base(&self) -> usize {
        self.base
    }

    /// The number of managed frames.
    pub fn frames(&self) -> usize {
        self.frames
    }

    /// Return a copy of the statistics for this allocator.
    pub fn stats(&self) -> AllocStats {
        self.stats.clone()
    }

    /// Translate a frame index into the physical address of its first byte.
    pub fn frame_to_addr(&self, index: usize) -> usize {
        self.base + index * FRAME_SIZE
    }

    /// Translate a physical address into its frame index.
    ///
    /// Fails with [`Error::MisalignedAddress`] if the address is not frame
    /// aligned or lies outside the managed region.
    pub fn addr_to_frame(&self, addr: usize) -> Result<usize> {
        let offset = addr
            .checked_sub(self.base)
            .ok_or(Error::MisalignedAddress)?;
        if offset % FRAME_SIZE != 0 {
            return Err(Error::MisalignedAddress);
        }

        let index = offset / FRAME_SIZE;
        if index >= self.frames {
            return Err(Error::MisalignedAddress);
        }
        Ok(index)
    }

    /// Allocate a block of `2^order` frames and return the index of its
    /// head.
    ///
    /// If no block of the requested order is free, the first larger free
    /// block is split in halves until one matches. Every half that is not
    /// taken stays registered as a free block of its own.
    pub fn allocate(&mut self, order: usize) -> Result<usize> {
        if order > MAX_ORDER {
            return Err(Error::InvalidOrder);
        }

        if self.lists.is_empty(order) {
            // take the smallest larger block and halve it down to `order`
            let mut upper = (order + 1..=MAX_ORDER)
                .find(|&k| !self.lists.is_empty(k))
                .ok_or(Error::OutOfMemory)?;

            while upper > order {
                let head = self.lists.pop(upper).ok_or(Error::OutOfMemory)? as usize;
                upper -= 1;
                let half = head + (1 << upper);

                self.tags[head] = FrameTag::free(upper);
                self.tags[half] = FrameTag::free(upper);
                self.lists.push(upper, head as u32);
                self.lists.push(upper, half as u32);
                trace!(
                    "split order {} block at frame {} into {} and {}",
                    upper + 1,
                    head,
                    head,
                    half
                );
            }
        }

        let head = self.lists.pop(order).ok_or(Error::OutOfMemory)? as usize;
        self.tags[head] = FrameTag::allocated_head(order);
        for tag in self.tags[head + 1..head + (1 << order)].iter_mut() {
            *tag = FrameTag::ALLOCATED;
        }

        let size = (1 << order) * FRAME_SIZE;
        self.stats.allocated += size;
        self.stats.free -= size;

        debug!("allocated frame {} (order {}, {})", head, order, crate::unit::bytes(size));
        Ok(head)
    }

    /// Return the block headed by `index` to the free pool and merge it
    /// with its buddies as far as possible.
    ///
    /// Fails with [`Error::NotAllocated`] if `index` does not head a live
    /// allocation: double frees, frames inside a block, reserved frames and
    /// out-of-range indices are all rejected.
    pub fn free(&mut self, index: usize) -> Result<()> {
        let order = self
            .tags
            .get(index)
            .and_then(|tag| tag.allocated_order())
            .ok_or(Error::NotAllocated)?;

        debug!("freeing frame {} (order {})", index, order);
        self.tags[index] = FrameTag::free(order);
        self.lists.push(order, index as u32);

        let mut head = index;
        for k in order..MAX_ORDER {
            let buddy = head ^ (1 << k);
            if self.tags.get(buddy) != Some(&FrameTag::free(k)) {
                break;
            }

            trace!("merging frames {} and {} into order {}", head, buddy, k + 1);
            self.lists.remove(k, head as u32);
            self.lists.remove(k, buddy as u32);

            let merged = head.min(buddy);
            self.tags[head.max(buddy)] = FrameTag::FREE_BODY;
            self.tags[merged] = FrameTag::free(k + 1);
            self.lists.push(k + 1, merged as u32);
            head = merged;
        }

        let size = (1 << order) * FRAME_SIZE;
        self.stats.allocated -= size;
        self.stats.free += size;
        Ok(())
    }

    /// Permanently mark the frames `[start, start + count)` as allocated,
    /// regardless of buddy alignment, splitting free blocks as needed.
    ///
    /// Used during initialization to carve out ranges that are already
    /// occupied, like the allocator's own tables or a boot image. The range
    /// must be entirely free: reserving allocated territory or reaching
    /// past the end of managed memory fails with
    /// [`Error::InvalidReservation`], which during boot indicates a
    /// misconfigured memory layout and is fatal to the caller. A failure
    /// partway through the range is not rolled back: the frames carved so
    /// far stay allocated, and the statistics are only charged once the
    /// whole range has been reserved.
    pub fn reserve(&mut self, start: usize, count: usize) -> Result<()> {
        let end = start
            .checked_add(count)
            .filter(|&end| end <= self.frames)
            .ok_or(Error::InvalidReservation)?;
        debug!("reserving frames {}..{}", start, end);

        let mut start = start;
        while start < end {
            let (head, order) = self.covering_block(start)?;
            let block_end = head + (1 << order);

            self.reserve_in_block(head, order, start, block_end.min(end));
            start = block_end;
        }

        let size = count * FRAME_SIZE;
        self.stats.allocated += size;
        self.stats.free -= size;
        Ok(())
    }

    /// Find the head and order of the free block containing `start`.
    ///
    /// Walks up the possible alignments of `start`, clearing one bit at a
    /// time, until a frame tagged as a free head is found. Every frame
    /// belongs to exactly one current block, so if the found block does not
    /// actually contain `start`, the frame is not free territory.
    fn covering_block(&self, start: usize) -> Result<(usize, usize)> {
        let mut head = start;
        let mut walked = 0;
        let order = loop {
            if let Some(order) = self.tags[head].free_order() {
                break order;
            }
            if walked >= MAX_ORDER {
                return Err(Error::InvalidReservation);
            }
            head &= !(1 << walked);
            walked += 1;
        };

        if head + (1 << order) <= start {
            // a free head was found, but its block ends before `start`:
            // the frame itself sits in allocated territory
            return Err(Error::InvalidReservation);
        }
        Ok((head, order))
    }

    /// Reserve `[l, r)` inside the free block of `order` headed by `head`,
    /// bisecting the block until the reserved range is covered exactly.
    ///
    /// Both halves of every split are re-registered as free blocks one
    /// order down; the recursion then descends into whichever half(s)
    /// intersect the target, with the interval clipped to the half's
    /// bounds. Depth is bounded by `MAX_ORDER`.
    fn reserve_in_block(&mut self, head: usize, order: usize, l: usize, r: usize) {
        if l >= r {
            return;
        }

        self.lists.remove(order, head as u32);
        let block_end = head + (1 << order);
        if head == l && block_end == r {
            for tag in self.tags[l..r].iter_mut() {
                *tag = FrameTag::ALLOCATED;
            }
            return;
        }

        let mid = head + (1 << (order - 1));
        self.tags[head] = FrameTag::free(order - 1);
        self.tags[mid] = FrameTag::free(order - 1);
        self.lists.push(order - 1, head as u32);
        self.lists.push(order - 1, mid as u32);

        if mid >= r {
            self.reserve_in_block(head, order - 1, l, r);
        } else {
            self.reserve_in_block(head, order - 1, l, mid.min(r));
            self.reserve_in_block(mid, order - 1, l.max(mid), r);
        }
    }

    #[cfg(test)]
    fn tag(&self, index: usize) -> FrameTag {
        self.tags[index]
    }

    #[cfg(test)]
    fn free_blocks(&self, order: usize) -> Vec<usize> {
        self.lists.iter(order).map(|index| index as usize).collect()
    }
}
