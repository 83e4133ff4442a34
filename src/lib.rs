//! Physical memory management for the Mistral kernel.
//!
//! All usable RAM is partitioned into fixed-size frames which are handed out
//! by a buddy allocator: free blocks are tracked per power-of-two order, a
//! large block is split in halves until it matches a request, and freed
//! blocks are merged with their address-buddy back into larger ones.
//!
//! The allocator never touches the memory it manages. Its bookkeeping (one
//! tag per frame plus intrusive free-list links) lives in tables carved out
//! of a bootstrap bump heap at [`pmem::Pmem::init`] time, and the range
//! occupied by those tables is immediately reserved so it can never be
//! handed out as a frame.
#![cfg_attr(not(test), no_std)]

pub mod pmem;
pub mod unit;

pub use pmem::{alloc::Error, Pmem};
