//! Virtqueue implementation
//!
//! Implements the split virtqueue used by legacy virtio-mmio devices. A
//! virtqueue consists of three regions in one physically contiguous
//! allocation:
//!
//! 1. **Descriptor table** -- array of [`VirtqDesc`] entries describing data
//!    buffers
//! 2. **Available ring** -- driver-to-device: ring of descriptor chain heads
//! 3. **Used ring** -- device-to-driver: ring of completed descriptor chain
//!    heads
//!
//! Memory layout follows the legacy virtio contract: descriptors at the base,
//! available ring immediately after, used ring on the next page boundary.
//!
//! # In-flight requests
//!
//! The queue supports exactly one request in flight. [`VirtQueue::kick`]
//! advances the local completion cursor as soon as the request is published,
//! so [`VirtQueue::is_busy`] reports `true` until the device has advanced the
//! used index by one. Two kicks without an intervening completion leave the
//! cursor ahead of the device by two, and the caller then cannot tell which
//! request finished. Callers must wait for `!is_busy()` before kicking again.

use core::{
    hint,
    ptr::{self, addr_of, addr_of_mut, NonNull},
    sync::atomic::{self, Ordering},
};

use bitflags::bitflags;
use bytemuck::{Pod, Zeroable};

use super::mmio::{RegisterWindow, VirtioMmioTransport};
use crate::{
    arch::barriers::memory_fence,
    error::{KernelError, KernelResult},
    mm::{alloc_dma, frames_for, PageAllocator, PhysicalAddress},
};

/// Number of descriptors (and ring slots) in every queue this driver creates.
pub const QUEUE_SIZE: u16 = 16;

bitflags! {
    /// Descriptor flags.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct DescFlags: u16 {
        /// Buffer continues via the `next` field
        const NEXT = 1;
        /// Buffer is device-writable (device writes, driver reads)
        const WRITE = 2;
    }
}

/// Virtqueue descriptor table entry.
///
/// Each descriptor points to a physically contiguous buffer in guest memory.
/// Descriptors are chained via the `next` field when [`DescFlags::NEXT`] is
/// set in `flags`.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Pod, Zeroable)]
pub struct VirtqDesc {
    /// Physical address of the guest buffer
    pub addr: u64,
    /// Length of the guest buffer in bytes
    pub len: u32,
    /// Descriptor flags (NEXT, WRITE)
    pub flags: u16,
    /// Index of the next descriptor in the chain (valid if NEXT is set)
    pub next: u16,
}

impl VirtqDesc {
    pub fn flags(&self) -> DescFlags {
        DescFlags::from_bits_truncate(self.flags)
    }
}

/// Available ring: driver writes descriptor chain heads here for the device to
/// consume.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Pod, Zeroable)]
pub struct VirtqAvail {
    pub flags: u16,
    /// Free-running count of heads published by the driver
    pub idx: u16,
    pub ring: [u16; QUEUE_SIZE as usize],
}

/// Element in the used ring, returned by the device after processing.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Pod, Zeroable)]
pub struct VirtqUsedElem {
    /// Index of the start of the used descriptor chain
    pub id: u32,
    /// Total bytes written into the descriptor chain buffers by the device
    pub len: u32,
}

/// Used ring: device writes completed descriptor chain heads here.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Pod, Zeroable)]
pub struct VirtqUsed {
    pub flags: u16,
    /// Free-running count of chains completed by the device
    pub idx: u16,
    pub ring: [VirtqUsedElem; QUEUE_SIZE as usize],
}

#[repr(C, align(4096))]
#[allow(dead_code)] // only viewed through the ring pointer
struct PageAligned<T>(T);

/// The whole ring allocation as the device sees it.
#[repr(C)]
#[allow(dead_code)] // only viewed through the ring pointer
struct VirtqLayout {
    desc: [VirtqDesc; QUEUE_SIZE as usize],
    avail: VirtqAvail,
    used: PageAligned<VirtqUsed>,
}

/// Byte offset of the available ring from the start of the queue memory.
pub const AVAIL_OFFSET: usize = core::mem::offset_of!(VirtqLayout, avail);
/// Byte offset of the used ring from the start of the queue memory.
pub const USED_OFFSET: usize = core::mem::offset_of!(VirtqLayout, used);

/// Limit on how long a caller spins waiting for the device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PollBudget {
    /// Spin until the device completes. A device that never answers hangs
    /// the caller.
    #[default]
    Unbounded,
    /// Give up with [`KernelError::Timeout`] after this many busy polls.
    Spins(u64),
}

/// One buffer of a descriptor chain.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChainBuffer {
    pub addr: PhysicalAddress,
    pub len: u32,
    /// The device writes this buffer (a response) instead of reading it.
    pub device_writable: bool,
}

impl ChainBuffer {
    pub fn readable(addr: PhysicalAddress, len: usize) -> Self {
        Self {
            addr,
            len: len as u32,
            device_writable: false,
        }
    }

    pub fn writable(addr: PhysicalAddress, len: usize) -> Self {
        Self {
            addr,
            len: len as u32,
            device_writable: true,
        }
    }
}

/// A split virtqueue with [`QUEUE_SIZE`] entries.
///
/// Owns the physical memory backing all three rings. The memory is never
/// returned: the queue lives until the kernel halts.
pub struct VirtQueue {
    /// Kernel mapping of the ring memory
    ring: NonNull<VirtqLayout>,

    /// Device-written used index, read through volatile loads only
    used_idx: NonNull<u16>,

    /// Physical base address of the queue allocation
    phys_base: PhysicalAddress,

    /// Index of this queue on the device (QUEUE_SEL / QUEUE_NOTIFY value)
    queue_index: u16,

    /// Used index we expect once every published request has completed
    last_used_idx: u16,
}

impl VirtQueue {
    /// Allocate the ring memory and hand it to the device as queue
    /// `queue_index`.
    ///
    /// The allocation is zeroed before the device learns its address. The
    /// legacy PFN register is 32 bits wide, so ring memory the allocator
    /// places at or above 4 GiB is refused before any register is written.
    pub fn init<W: RegisterWindow, A: PageAllocator>(
        transport: &VirtioMmioTransport<W>,
        allocator: &A,
        queue_index: u16,
    ) -> KernelResult<Self> {
        let region = alloc_dma(allocator, frames_for(core::mem::size_of::<VirtqLayout>()))?;
        let phys_base = region.phys;
        let pfn = u32::try_from(phys_base.as_u64()).map_err(|_| {
            log::error!(
                "[VIRTQ] ring memory at {:#x} is out of reach of QUEUE_PFN",
                phys_base.as_u64()
            );
            KernelError::InvalidState {
                expected: "ring memory below 4 GiB",
                actual: "ring address wider than 32 bits",
            }
        })?;

        let ring = region.virt.cast::<VirtqLayout>();

        // SAFETY: `ring` points to a live, zeroed VirtqLayout; the field
        // projection stays inside it.
        let used_idx = unsafe { NonNull::new_unchecked(addr_of_mut!((*ring.as_ptr()).used.0.idx)) };

        transport.select_queue(queue_index);
        transport.set_queue_size(QUEUE_SIZE);
        transport.set_queue_align(0);
        transport.set_queue_pfn(pfn);

        log::debug!(
            "[VIRTQ] queue {} at {:#x} ({} entries, used ring at +{:#x})",
            queue_index,
            phys_base.as_u64(),
            QUEUE_SIZE,
            USED_OFFSET
        );

        Ok(Self {
            ring,
            used_idx,
            phys_base,
            queue_index,
            last_used_idx: 0,
        })
    }

    pub fn queue_index(&self) -> u16 {
        self.queue_index
    }

    pub fn phys_desc(&self) -> PhysicalAddress {
        self.phys_base
    }

    pub fn phys_used(&self) -> PhysicalAddress {
        self.phys_base.offset(USED_OFFSET)
    }

    /// Local completion cursor.
    pub fn last_used_idx(&self) -> u16 {
        self.last_used_idx
    }

    /// Write a descriptor's fields.
    pub fn set_desc(&mut self, idx: u16, desc: VirtqDesc) {
        let slot = idx as usize % QUEUE_SIZE as usize;
        // SAFETY: `slot` is reduced into the descriptor table; the ring
        // memory is owned by this queue.
        unsafe {
            ptr::write_volatile(addr_of_mut!((*self.ring.as_ptr()).desc[slot]), desc);
        }
    }

    /// Read back a descriptor.
    pub fn desc(&self, idx: u16) -> VirtqDesc {
        let slot = idx as usize % QUEUE_SIZE as usize;
        // SAFETY: see `set_desc`.
        unsafe { ptr::read_volatile(addr_of!((*self.ring.as_ptr()).desc[slot])) }
    }

    /// Write `buffers` as one chain starting at descriptor `head`.
    ///
    /// Every link but the last gets [`DescFlags::NEXT`] and points at the
    /// following index (mod [`QUEUE_SIZE`]); device-writable buffers get
    /// [`DescFlags::WRITE`]. The chain shape is the caller's responsibility.
    pub fn write_chain(&mut self, head: u16, buffers: &[ChainBuffer]) {
        debug_assert!(!buffers.is_empty() && buffers.len() <= QUEUE_SIZE as usize);

        let last = buffers.len().saturating_sub(1);
        for (i, buffer) in buffers.iter().enumerate() {
            let idx = (head as usize + i) % QUEUE_SIZE as usize;
            let mut flags = DescFlags::empty();
            let mut next = 0;
            if i != last {
                flags |= DescFlags::NEXT;
                next = ((idx + 1) % QUEUE_SIZE as usize) as u16;
            }
            if buffer.device_writable {
                flags |= DescFlags::WRITE;
            }

            self.set_desc(
                idx as u16,
                VirtqDesc {
                    addr: buffer.addr.as_u64(),
                    len: buffer.len,
                    flags: flags.bits(),
                    next,
                },
            );
        }
    }

    /// Publish the chain at `head` and notify the device.
    ///
    /// Advances the local completion cursor immediately; see the module
    /// documentation for the single in-flight request rule.
    pub fn kick<W: RegisterWindow>(&mut self, transport: &VirtioMmioTransport<W>, head: u16) {
        let avail = self.avail_ptr();

        // SAFETY: `avail` points into ring memory owned by this queue. The
        // device only reads the available ring, so volatile accesses from
        // this single thread of control cannot race with another writer.
        unsafe {
            let idx = ptr::read_volatile(addr_of!((*avail).idx));
            let slot = idx as usize % QUEUE_SIZE as usize;
            ptr::write_volatile(addr_of_mut!((*avail).ring[slot]), head);

            // The ring entry must be visible before the index that covers it.
            atomic::fence(Ordering::Release);

            ptr::write_volatile(addr_of_mut!((*avail).idx), idx.wrapping_add(1));
        }

        // The device must never observe the doorbell before the ring update.
        memory_fence();

        transport.notify_queue(self.queue_index);
        self.last_used_idx = self.last_used_idx.wrapping_add(1);
    }

    /// True while the device has not caught up with every published request.
    pub fn is_busy(&self) -> bool {
        // SAFETY: `used_idx` points at the used ring index inside memory owned
        // by this queue; the volatile read observes the device's latest write.
        let used_idx = unsafe { ptr::read_volatile(self.used_idx.as_ptr()) };
        self.last_used_idx != used_idx
    }

    /// Busy-poll [`Self::is_busy`] until the device catches up.
    pub fn wait_idle(&self, budget: PollBudget, operation: &'static str) -> KernelResult<()> {
        match budget {
            PollBudget::Unbounded => {
                while self.is_busy() {
                    hint::spin_loop();
                }
            }
            PollBudget::Spins(max) => {
                let mut spins = 0u64;
                while self.is_busy() {
                    if spins >= max {
                        log::error!("[VIRTQ] {} did not complete after {} polls", operation, spins);
                        return Err(KernelError::Timeout { operation, spins });
                    }
                    spins += 1;
                    hint::spin_loop();
                }
            }
        }
        Ok(())
    }

    /// Driver-side view of the available ring.
    pub fn avail(&self) -> VirtqAvail {
        // SAFETY: the available ring is written only by this queue.
        unsafe { ptr::read_volatile(self.avail_ptr()) }
    }

    fn avail_ptr(&self) -> *mut VirtqAvail {
        // SAFETY: field projection inside the live ring allocation.
        unsafe { addr_of_mut!((*self.ring.as_ptr()).avail) }
    }
}
