//! Virtio MMIO transport (legacy interface, version 1)
//!
//! Implements the subset of the virtio-over-MMIO register set that a legacy
//! split-virtqueue driver needs: device identification, queue programming
//! through the page-frame-number register, and the notify doorbell.
//!
//! # Register window
//!
//! All raw pointer arithmetic lives in [`MmioWindow`]. Everything else talks
//! to the [`RegisterWindow`] trait, which is also what a scripted device
//! implements in the host-side tests.
//!
//! | Offset | Name        | Access |
//! |--------|-------------|--------|
//! | 0x000  | MAGIC       | R      |
//! | 0x004  | VERSION     | R      |
//! | 0x008  | DEVICE_ID   | R      |
//! | 0x030  | QUEUE_SEL   | W      |
//! | 0x038  | QUEUE_NUM   | W      |
//! | 0x03c  | QUEUE_ALIGN | W      |
//! | 0x040  | QUEUE_PFN   | RW     |
//! | 0x050  | QUEUE_NOTIFY| W      |

use core::ptr;

use crate::error::{KernelResult, VirtioError};

/// First virtio-mmio slot on QEMU's RISC-V `virt` machine.
pub const DEFAULT_BASE: usize = 0x1000_1000;

/// "virt" in little-endian.
pub const VIRTIO_MMIO_MAGIC: u32 = 0x7472_6976;

/// Legacy virtio-mmio interface revision.
pub const LEGACY_VERSION: u32 = 1;

/// MMIO register offsets (per virtio spec 4.2.4, legacy interface).
pub mod regs {
    pub const MAGIC: usize = 0x000; // Magic value "virt"
    pub const VERSION: usize = 0x004; // 1 = legacy
    pub const DEVICE_ID: usize = 0x008;
    pub const QUEUE_SEL: usize = 0x030;
    pub const QUEUE_NUM: usize = 0x038;
    pub const QUEUE_ALIGN: usize = 0x03c;
    pub const QUEUE_PFN: usize = 0x040;
    pub const QUEUE_NOTIFY: usize = 0x050;
}

/// Register-level access to one device's MMIO window.
///
/// Offsets are relative to the window base. Implementations must not cache
/// or reorder accesses: every call is one device access.
pub trait RegisterWindow {
    fn read32(&self, offset: usize) -> u32;
    fn read64(&self, offset: usize) -> u64;
    fn write32(&self, offset: usize, value: u32);

    /// Read-modify-write that sets `value`'s bits in the register.
    fn fetch_or32(&self, offset: usize, value: u32) {
        self.write32(offset, self.read32(offset) | value);
    }
}

impl<W: RegisterWindow + ?Sized> RegisterWindow for &W {
    fn read32(&self, offset: usize) -> u32 {
        (**self).read32(offset)
    }

    fn read64(&self, offset: usize) -> u64 {
        (**self).read64(offset)
    }

    fn write32(&self, offset: usize, value: u32) {
        (**self).write32(offset, value)
    }
}

/// Handle for a memory-mapped register window.
///
/// # Safety Invariant
///
/// `base` must point to a device register region that stays mapped for the
/// lifetime of this handle. All accesses use volatile reads/writes so the
/// compiler can neither reorder nor elide them.
#[derive(Debug, Clone, Copy)]
pub struct MmioWindow {
    base: usize,
}

impl MmioWindow {
    /// Wrap the register region at `base`.
    ///
    /// # Safety
    ///
    /// `base` must be the address of a mapped MMIO region large enough for
    /// every offset in [`regs`], suitably aligned for 32-bit and 64-bit
    /// accesses, and not aliased by any Rust reference.
    pub const unsafe fn new(base: usize) -> Self {
        Self { base }
    }
}

impl RegisterWindow for MmioWindow {
    #[inline]
    fn read32(&self, offset: usize) -> u32 {
        // SAFETY: base + offset lies in the register region guaranteed by
        // `MmioWindow::new`.
        unsafe { ptr::read_volatile((self.base + offset) as *const u32) }
    }

    #[inline]
    fn read64(&self, offset: usize) -> u64 {
        // SAFETY: base + offset lies in the register region guaranteed by
        // `MmioWindow::new`.
        unsafe { ptr::read_volatile((self.base + offset) as *const u64) }
    }

    #[inline]
    fn write32(&self, offset: usize, value: u32) {
        // SAFETY: base + offset lies in the register region guaranteed by
        // `MmioWindow::new`.
        unsafe { ptr::write_volatile((self.base + offset) as *mut u32, value) }
    }
}

/// Typed accessors over a virtio-mmio [`RegisterWindow`].
#[derive(Debug, Clone, Copy)]
pub struct VirtioMmioTransport<W> {
    window: W,
}

impl<W: RegisterWindow> VirtioMmioTransport<W> {
    pub fn new(window: W) -> Self {
        Self { window }
    }

    pub fn window(&self) -> &W {
        &self.window
    }

    /// Check the identity registers against a legacy virtio device of type
    /// `device_id`. Called exactly once, before any other register access.
    pub fn probe(&self, device_id: u32) -> KernelResult<()> {
        let magic = self.window.read32(regs::MAGIC);
        let version = self.window.read32(regs::VERSION);
        let actual_device = self.window.read32(regs::DEVICE_ID);

        log::info!(
            "[VIRTIO] magic={:#x}, version={}, device={}",
            magic,
            version,
            actual_device
        );

        expect_reg("magic", VIRTIO_MMIO_MAGIC, magic)?;
        expect_reg("version", LEGACY_VERSION, version)?;
        expect_reg("device id", device_id, actual_device)?;
        Ok(())
    }

    pub fn select_queue(&self, idx: u16) {
        self.window.write32(regs::QUEUE_SEL, idx as u32);
    }

    pub fn set_queue_size(&self, size: u16) {
        self.window.write32(regs::QUEUE_NUM, size as u32);
    }

    /// Used-ring alignment. Zero leaves the device's default (one page).
    pub fn set_queue_align(&self, align: u32) {
        self.window.write32(regs::QUEUE_ALIGN, align);
    }

    /// Hand the ring memory to the device.
    ///
    /// The guest page size register is never programmed, so the device
    /// applies its reset shift of zero and the value is the ring's physical
    /// byte address.
    pub fn set_queue_pfn(&self, pfn: u32) {
        self.window.write32(regs::QUEUE_PFN, pfn);
    }

    pub fn notify_queue(&self, idx: u16) {
        self.window.write32(regs::QUEUE_NOTIFY, idx as u32);
    }
}

fn expect_reg(register: &'static str, expected: u32, actual: u32) -> KernelResult<()> {
    if expected != actual {
        log::error!(
            "[VIRTIO] invalid {}: {:#x} (expected {:#x})",
            register,
            actual,
            expected
        );
        return Err(VirtioError::ProbeMismatch {
            register,
            expected,
            actual,
        }
        .into());
    }
    Ok(())
}
