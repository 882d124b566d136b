//! Device drivers module
//!
//! Contains the virtio transport and the virtio-gpu display driver.

pub mod virtio;
pub mod virtio_gpu;

pub use virtio_gpu::{GpuConfig, GpuPhase, VirtioGpu};
