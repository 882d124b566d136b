//! Bootstrap module for display initialization
//!
//! Brings the virtio-gpu display up during boot and hands the ready driver
//! back to the kernel. Failure here is fatal: [`init_display_or_halt`] logs
//! the error and panics, which is the kernel's halt path.

use crate::{
    drivers::{
        virtio::mmio::{MmioWindow, RegisterWindow, VirtioMmioTransport},
        virtio_gpu::{GpuConfig, VirtioGpu},
    },
    error::KernelResult,
    graphics::color_bands,
    mm::PageAllocator,
};

/// Initialize the display behind `window` and show the boot test pattern.
///
/// Either every bring-up phase succeeds and the returned driver is
/// [`Ready`](crate::drivers::virtio_gpu::GpuPhase::Ready), or the first
/// failure is returned and nothing is handed out.
pub fn init_display<W: RegisterWindow, A: PageAllocator>(
    window: W,
    allocator: A,
    config: GpuConfig,
) -> KernelResult<VirtioGpu<W, A>> {
    log::info!("[BOOTSTRAP] Display: probing virtio-gpu");

    let mut gpu = VirtioGpu::new(VirtioMmioTransport::new(window), allocator, config);
    gpu.run(color_bands::paint_test_pattern)?;

    if let Some(display) = gpu.display() {
        log::info!(
            "[BOOTSTRAP] Display: {}x{} on scanout {}",
            display.width,
            display.height,
            display.scanout_id
        );
    }
    Ok(gpu)
}

/// Initialize the display at `config.mmio_base`, halting the kernel on any
/// failure.
///
/// # Safety
///
/// `config.mmio_base` must be the physical (identity-mapped) base of a
/// virtio-mmio register window that stays mapped for the kernel's lifetime
/// and is not accessed by anything else.
pub unsafe fn init_display_or_halt<A: PageAllocator>(
    allocator: A,
    config: GpuConfig,
) -> VirtioGpu<MmioWindow, A> {
    // SAFETY: forwarded from this function's contract.
    let window = unsafe { MmioWindow::new(config.mmio_base) };

    match init_display(window, allocator, config) {
        Ok(gpu) => gpu,
        Err(e) => {
            log::error!("[BOOTSTRAP] Display initialization failed: {}", e);
            panic!("virtio-gpu initialization failed: {}", e);
        }
    }
}
