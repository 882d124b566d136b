//! Virtio subsystem -- transport layer and shared queue machinery.
//!
//! Only the legacy (version 1) virtio-mmio transport is supported, as exposed
//! by QEMU's RISC-V `virt` machine. Devices are driven by polling: the kernel
//! never installs a virtio interrupt handler.
//!
//! # Architecture
//!
//! ```text
//!   VirtioMmioTransport (mmio.rs)   -- identity check, queue registers, doorbell
//!     |
//!     +-- VirtQueue (queue.rs)      -- split virtqueue, one request in flight
//!     +-- VirtioGpu (virtio_gpu/)   -- 2D display device driver
//! ```

pub mod mmio;
pub mod queue;

pub use mmio::{MmioWindow, RegisterWindow, VirtioMmioTransport};
pub use queue::{ChainBuffer, PollBudget, VirtQueue, QUEUE_SIZE};

/// Virtio device type: GPU
pub const VIRTIO_DEVICE_GPU: u32 = 16;
