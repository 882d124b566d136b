//! Memory management module
//!
//! The display path consumes physical memory through the [`PageAllocator`]
//! trait only. Devices are handed [`PhysicalAddress`]es; the driver touches
//! the same bytes through [`PageAllocator::phys_to_virt`], which is the
//! identity mapping unless the allocator says otherwise.

pub mod frame_allocator;

use core::ptr::{self, NonNull};

pub use frame_allocator::BumpFrameAllocator;

use crate::error::{KernelError, KernelResult};

/// Size of one physical page frame in bytes.
pub const FRAME_SIZE: usize = 4096;

/// Physical memory address
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct PhysicalAddress(u64);

impl PhysicalAddress {
    pub const fn new(addr: u64) -> Self {
        Self(addr)
    }

    pub const fn as_u64(&self) -> u64 {
        self.0
    }

    /// Address `bytes` past this one.
    pub const fn offset(&self, bytes: usize) -> Self {
        Self(self.0 + bytes as u64)
    }

    pub const fn is_page_aligned(&self) -> bool {
        self.0 % FRAME_SIZE as u64 == 0
    }

    /// Kernel pointer to the memory at this address (identity mapping).
    pub fn as_mut_ptr<T>(&self) -> *mut T {
        self.0 as usize as *mut T
    }
}

/// Source of physically contiguous, page-aligned memory.
///
/// Returned pages are not guaranteed to be zeroed. Allocations are never
/// freed by the display path: everything it allocates lives until the
/// kernel halts.
pub trait PageAllocator {
    /// Allocate `count` contiguous pages and return the address of the first.
    fn alloc_pages(&self, count: usize) -> KernelResult<PhysicalAddress>;

    /// Kernel pointer to memory previously returned by
    /// [`alloc_pages`](Self::alloc_pages).
    fn phys_to_virt(&self, phys: PhysicalAddress) -> *mut u8 {
        phys.as_mut_ptr()
    }
}

impl<A: PageAllocator + ?Sized> PageAllocator for &A {
    fn alloc_pages(&self, count: usize) -> KernelResult<PhysicalAddress> {
        (**self).alloc_pages(count)
    }

    fn phys_to_virt(&self, phys: PhysicalAddress) -> *mut u8 {
        (**self).phys_to_virt(phys)
    }
}

/// Zeroed pages shared with a device.
#[derive(Debug, Clone, Copy)]
pub struct DmaRegion {
    /// Address the device is given
    pub phys: PhysicalAddress,
    /// Kernel pointer to the same bytes
    pub virt: NonNull<u8>,
    /// Length in bytes (whole frames)
    pub len: usize,
}

/// Allocate `count` zeroed, page-aligned frames for device use.
pub fn alloc_dma<A: PageAllocator + ?Sized>(allocator: &A, count: usize) -> KernelResult<DmaRegion> {
    let phys = allocator.alloc_pages(count)?;
    if !phys.is_page_aligned() {
        return Err(KernelError::InvalidState {
            expected: "page-aligned allocation",
            actual: "unaligned allocation",
        });
    }
    let len = count * FRAME_SIZE;
    let virt = NonNull::new(allocator.phys_to_virt(phys)).ok_or(KernelError::InvalidState {
        expected: "mapped allocation",
        actual: "null kernel address",
    })?;

    // SAFETY: the allocator handed out `count` contiguous frames at `phys`,
    // mapped at `virt`; nothing references them yet.
    unsafe { ptr::write_bytes(virt.as_ptr(), 0, len) };

    Ok(DmaRegion { phys, virt, len })
}

/// Align `value` up to the next multiple of `align` (a power of two).
pub const fn align_up(value: usize, align: usize) -> usize {
    (value + align - 1) & !(align - 1)
}

/// Number of whole frames needed to hold `bytes`.
pub const fn frames_for(bytes: usize) -> usize {
    bytes.div_ceil(FRAME_SIZE)
}
