//! # Kernel Memory Allocation
//!
//! The three allocation layers of the kernel, leaf-first:
//!
//! ```text
//! ┌─────────────────────────────────────────────────────┐
//! │                Kernel Heap ([`heap`])               │
//! │    • byte-granular kmalloc/kfree                    │
//! │    • carves one region obtained at boot             │
//! └─────────────────┬───────────────────────────────────┘
//!                   │ (once, at init)
//! ┌─────────────────▼───────────────────────────────────┐
//! │            Region Allocator ([`region`])            │
//! │    • per-address-space virtual page accounting      │
//! │    • cross-context aliasing, fork-time copies       │
//! └─────────────────┬───────────────────────────────────┘
//!                   │
//! ┌─────────────────▼───────────────────────────────────┐
//! │            Frame Allocator ([`frame`])              │
//! │    • bitmap over all physical page frames           │
//! │    • first-fit contiguous runs                      │
//! └─────────────────────────────────────────────────────┘
//! ```
//!
//! The heap talks to the region allocator exactly once, at boot, to obtain
//! its backing arena; afterwards it never touches the lower layers again.
//! Every other subsystem that needs page-granular memory with its own
//! lifetime (task stacks, binary images, mapped files) allocates straight
//! from the region allocator.
//!
//! Nothing here is a hidden global: each allocator is an explicit object, so
//! the kernel wires up one set at boot and the tests build isolated
//! instances at will. The kernel's own address space is an ordinary
//! [`region::AddressSpace`] handed around via [`region::VmEnv`].

#![cfg_attr(not(any(test, doctest)), no_std)]
#![allow(unsafe_code)]

pub mod frame;
pub mod heap;
pub mod region;

pub use frame::{FrameAllocator, FrameError};
pub use heap::{HeapError, KernelHeap};
pub use region::{AddressSpace, AllocAt, VmAllocation, VmEnv, VmError, VmFlags};

/// Byte-granular usage snapshot reported by all three layers.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct MemStats {
    pub total: u64,
    pub used: u64,
}
