//! Virtio GPU boot display library
//!
//! Drives a legacy virtio-mmio GPU from power-on to a visible framebuffer
//! during kernel startup: the virtio split-virtqueue transport, the six-phase
//! virtio-gpu bring-up state machine, and a color-band boot test pattern.
//!
//! The crate is `no_std` and allocation-free. Host builds used for unit tests
//! link `std` so the device can be stood in for by a scripted mock.

#![cfg_attr(not(test), no_std)]

pub mod arch;
pub mod bootstrap;
pub mod drivers;
pub mod error;
pub mod graphics;
pub mod log_service;
pub mod mm;

#[cfg(test)]
mod testing;

pub use drivers::virtio_gpu::{Framebuffer, GpuConfig, GpuPhase, VirtioGpu};
pub use error::{KernelError, KernelResult};
pub use mm::{BumpFrameAllocator, PageAllocator, PhysicalAddress, FRAME_SIZE};
