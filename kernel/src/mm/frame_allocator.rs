//! Bump frame allocator
//!
//! Hands out physically contiguous frames from a single `[start, end)` RAM
//! window, front to back, and never reclaims them. This matches how the boot
//! path uses memory: the virtqueue, the command buffer and the framebuffer
//! are all allocated once and live until the kernel halts.

use spin::Mutex;

use super::{align_up, PageAllocator, PhysicalAddress, FRAME_SIZE};
use crate::error::{KernelError, KernelResult};

struct BumpState {
    /// Next free frame address (always frame aligned)
    next: u64,
    /// One past the last usable byte
    end: u64,
}

/// Frame allocator over one contiguous region of free RAM.
pub struct BumpFrameAllocator {
    state: Mutex<BumpState>,
}

impl BumpFrameAllocator {
    /// Create an allocator over `[start, end)`.
    ///
    /// `start` is rounded up to a frame boundary. The region must be unused
    /// RAM that is identity mapped in the kernel's address space; the
    /// allocator itself never touches the memory.
    pub const fn new(start: u64, end: u64) -> Self {
        let aligned = align_up(start as usize, FRAME_SIZE) as u64;
        Self {
            state: Mutex::new(BumpState {
                next: aligned,
                end,
            }),
        }
    }

    /// Bytes still available for allocation.
    pub fn remaining(&self) -> usize {
        let state = self.state.lock();
        state.end.saturating_sub(state.next) as usize
    }
}

impl PageAllocator for BumpFrameAllocator {
    fn alloc_pages(&self, count: usize) -> KernelResult<PhysicalAddress> {
        let requested = count.checked_mul(FRAME_SIZE).unwrap_or(usize::MAX);
        let mut state = self.state.lock();
        let available = state.end.saturating_sub(state.next) as usize;

        if count == 0 || requested > available {
            return Err(KernelError::OutOfMemory {
                requested,
                available,
            });
        }

        let paddr = state.next;
        state.next += requested as u64;
        Ok(PhysicalAddress::new(paddr))
    }
}
