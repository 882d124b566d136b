//! Graphics subsystem
//!
//! Drawing routines that operate on a plain 32-bit pixel buffer, such as the
//! one exposed by the virtio-gpu [`Framebuffer`](crate::drivers::virtio_gpu::Framebuffer).

pub mod color_bands;
