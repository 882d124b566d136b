//! VirtIO GPU Driver
//!
//! Brings a paravirtualized 2D display up during boot and hands the caller a
//! framebuffer that is visible on screen.
//!
//! ## Initialization
//!
//! Bring-up is a strictly sequential state machine with one phase per GPU
//! command. A phase advances only when the device confirms it with the
//! expected response type. Any error moves the driver to the terminal
//! [`GpuPhase::Failed`], from which nothing is ever sent to the device again.
//!
//! ```text
//!   Probe -> GetDisplayInfo -> Create2d -> AttachBacking -> SetScanout
//!         -> TransferToHost -> Flush -> Ready
//!
//!   any phase --error--> Failed
//! ```
//!
//! Every phase follows the same pattern: stage a [`GpuRequest`] in the
//! command buffer, write a 2-3 descriptor chain at descriptor 0, kick the
//! control queue, poll until the device completes, then check the response
//! header. Only one request is ever in flight.
//!
//! ## Resources
//!
//! The driver manages a single 2D resource ([`FRAMEBUFFER_RESOURCE_ID`])
//! backed by one physically contiguous framebuffer allocation. The control
//! queue, the command buffer and the framebuffer are allocated once and are
//! never freed.

pub mod command;
pub mod protocol;

use core::{ptr::NonNull, slice};

pub use command::{CommandBuffer, GpuRequest, StagedCommand};
use protocol::*;

use crate::{
    drivers::virtio::{
        mmio::{self, RegisterWindow, VirtioMmioTransport},
        queue::{PollBudget, VirtQueue},
        VIRTIO_DEVICE_GPU,
    },
    error::{KernelError, KernelResult, VirtioError},
    mm::{alloc_dma, frames_for, PageAllocator, PhysicalAddress, FRAME_SIZE},
};

/// Resource id of the scanout framebuffer. The driver creates no other
/// resources.
pub const FRAMEBUFFER_RESOURCE_ID: u32 = 42;

/// Bytes per framebuffer pixel (B8G8R8A8).
pub const BYTES_PER_PIXEL: usize = 4;

/// Driver configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GpuConfig {
    /// Physical base of the device's virtio-mmio window
    pub mmio_base: usize,
    /// Control queue index
    pub queue_index: u16,
    pub resource_id: u32,
    /// Pixel format passed to RESOURCE_CREATE_2D
    pub format: u32,
    /// How long to wait for each command to complete
    pub poll_budget: PollBudget,
}

impl Default for GpuConfig {
    fn default() -> Self {
        Self {
            mmio_base: mmio::DEFAULT_BASE,
            queue_index: 0,
            resource_id: FRAMEBUFFER_RESOURCE_ID,
            format: FORMAT_B8G8R8A8_UNORM,
            poll_budget: PollBudget::Unbounded,
        }
    }
}

/// Bring-up phase. Each phase names the command it issues next.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GpuPhase {
    Probe,
    GetDisplayInfo,
    Create2d,
    AttachBacking,
    SetScanout,
    TransferToHost,
    Flush,
    /// Terminal: the framebuffer is on screen.
    Ready,
    /// Terminal: a phase failed and the device is abandoned.
    Failed,
}

/// The scanout chosen from GET_DISPLAY_INFO.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DisplayMode {
    pub scanout_id: u32,
    pub width: u32,
    pub height: u32,
}

impl DisplayMode {
    /// The full display rectangle at the origin.
    pub fn rect(&self) -> VirtioGpuRect {
        VirtioGpuRect::new(0, 0, self.width, self.height)
    }

    /// Bytes of pixel memory backing this mode.
    ///
    /// Fails for an empty mode, and for one whose page-rounded backing
    /// would not fit the 32-bit length of a memory entry.
    pub fn framebuffer_len(&self) -> KernelResult<u32> {
        if self.width == 0 || self.height == 0 {
            return Err(VirtioError::EmptyDisplayMode {
                scanout_id: self.scanout_id,
                width: self.width,
                height: self.height,
            }
            .into());
        }
        let len = self
            .width
            .checked_mul(self.height)
            .and_then(|pixels| pixels.checked_mul(BYTES_PER_PIXEL as u32))
            .filter(|len| len.checked_next_multiple_of(FRAME_SIZE as u32).is_some());
        len.ok_or(KernelError::InvalidState {
            expected: "framebuffer below 4 GiB",
            actual: "oversized display mode",
        })
    }
}

/// Pick the first enabled scanout, in index order.
///
/// The chosen mode must be backable; see [`DisplayMode::framebuffer_len`].
pub fn select_scanout(info: &VirtioGpuRespDisplayInfo) -> KernelResult<DisplayMode> {
    let display = info
        .pmodes
        .iter()
        .enumerate()
        .find(|(_, mode)| mode.enabled != 0)
        .map(|(index, mode)| DisplayMode {
            scanout_id: index as u32,
            width: mode.rect.width,
            height: mode.rect.height,
        })
        .ok_or(KernelError::from(VirtioError::NoEnabledScanout))?;
    display.framebuffer_len()?;
    Ok(display)
}

/// Pixel memory backing the scanout resource.
///
/// The memory is owned exclusively by the driver; it holds `width * height`
/// 32-bit B8G8R8A8 pixels in row-major order.
pub struct Framebuffer {
    phys: PhysicalAddress,
    pixels: NonNull<u32>,
    width: u32,
    height: u32,
    size_bytes: usize,
}

impl Framebuffer {
    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    pub fn phys_addr(&self) -> PhysicalAddress {
        self.phys
    }

    /// Size in bytes as attached to the resource.
    pub fn size_bytes(&self) -> usize {
        self.size_bytes
    }

    pub fn pixels(&self) -> &[u32] {
        // SAFETY: `pixels` maps `size_bytes` bytes of page-aligned memory
        // that only this Framebuffer hands out.
        unsafe { slice::from_raw_parts(self.pixels.as_ptr(), self.pixel_count()) }
    }

    pub fn pixels_mut(&mut self) -> &mut [u32] {
        // SAFETY: as in `pixels`; `&mut self` makes the borrow exclusive.
        unsafe { slice::from_raw_parts_mut(self.pixels.as_ptr(), self.pixel_count()) }
    }

    fn pixel_count(&self) -> usize {
        self.size_bytes / BYTES_PER_PIXEL
    }
}

struct ControlQueue {
    queue: VirtQueue,
    commands: CommandBuffer,
}

/// VirtIO GPU driver context.
///
/// Owned by the caller; every operation goes through `&mut self`.
pub struct VirtioGpu<W, A> {
    transport: VirtioMmioTransport<W>,
    allocator: A,
    config: GpuConfig,
    phase: GpuPhase,
    control: Option<ControlQueue>,
    display: Option<DisplayMode>,
    framebuffer: Option<Framebuffer>,
}

impl<W: RegisterWindow, A: PageAllocator> VirtioGpu<W, A> {
    /// Create a driver in the [`GpuPhase::Probe`] phase. No device access
    /// happens until the first [`step`](Self::step).
    pub fn new(transport: VirtioMmioTransport<W>, allocator: A, config: GpuConfig) -> Self {
        Self {
            transport,
            allocator,
            config,
            phase: GpuPhase::Probe,
            control: None,
            display: None,
            framebuffer: None,
        }
    }

    pub fn phase(&self) -> GpuPhase {
        self.phase
    }

    pub fn is_ready(&self) -> bool {
        self.phase == GpuPhase::Ready
    }

    /// Selected display, once GET_DISPLAY_INFO has succeeded.
    pub fn display(&self) -> Option<DisplayMode> {
        self.display
    }

    pub fn framebuffer(&self) -> Option<&Framebuffer> {
        self.framebuffer.as_ref()
    }

    pub fn framebuffer_mut(&mut self) -> Option<&mut Framebuffer> {
        self.framebuffer.as_mut()
    }

    /// Drive bring-up to [`GpuPhase::Ready`].
    ///
    /// `paint` runs once, right before the initial TRANSFER_TO_HOST_2D, so
    /// whatever it draws is what first appears on screen. Calling `run`
    /// again after a failure returns an error without touching the device.
    pub fn run<F: FnOnce(&mut Framebuffer)>(&mut self, paint: F) -> KernelResult<()> {
        let mut paint = Some(paint);
        while self.phase != GpuPhase::Ready {
            if self.phase == GpuPhase::TransferToHost {
                if let (Some(paint), Some(fb)) = (paint.take(), self.framebuffer.as_mut()) {
                    paint(fb);
                }
            }
            self.step()?;
        }
        Ok(())
    }

    /// Execute the current phase and advance on success.
    ///
    /// Returns the new phase. On error the driver enters
    /// [`GpuPhase::Failed`] and every later step fails immediately. Stepping
    /// in [`GpuPhase::Ready`] does nothing.
    pub fn step(&mut self) -> KernelResult<GpuPhase> {
        let phase = self.phase;
        let result = match phase {
            GpuPhase::Probe => self.probe().map(|()| GpuPhase::GetDisplayInfo),
            GpuPhase::GetDisplayInfo => self.get_display_info().map(|()| GpuPhase::Create2d),
            GpuPhase::Create2d => self.create_resource_2d().map(|()| GpuPhase::AttachBacking),
            GpuPhase::AttachBacking => self.attach_backing().map(|()| GpuPhase::SetScanout),
            GpuPhase::SetScanout => self.set_scanout().map(|()| GpuPhase::TransferToHost),
            GpuPhase::TransferToHost => self.transfer_to_host_2d().map(|()| GpuPhase::Flush),
            GpuPhase::Flush => self.resource_flush().map(|()| {
                log::info!("[VIRTIO-GPU] Display ready");
                GpuPhase::Ready
            }),
            GpuPhase::Ready => Ok(GpuPhase::Ready),
            GpuPhase::Failed => return Err(Self::already_failed()),
        };
        self.settle(phase, result)
    }

    /// Push the current framebuffer contents to the screen again.
    ///
    /// Only valid once bring-up has reached [`GpuPhase::Ready`]. A failure
    /// here is as fatal as one during bring-up.
    pub fn present(&mut self) -> KernelResult<()> {
        match self.phase {
            GpuPhase::Ready => {}
            GpuPhase::Failed => return Err(Self::already_failed()),
            _ => {
                return Err(KernelError::InvalidState {
                    expected: "ready display",
                    actual: "display still initializing",
                })
            }
        }
        let result = self
            .transfer_to_host_2d()
            .and_then(|()| self.resource_flush())
            .map(|()| GpuPhase::Ready);
        self.settle(GpuPhase::Ready, result).map(|_| ())
    }

    /// Record the outcome of work done in `phase`.
    fn settle(&mut self, phase: GpuPhase, result: KernelResult<GpuPhase>) -> KernelResult<GpuPhase> {
        match result {
            Ok(next) => self.phase = next,
            Err(e) => {
                log::error!("[VIRTIO-GPU] {:?} failed, abandoning device: {}", phase, e);
                self.phase = GpuPhase::Failed;
            }
        }
        result
    }

    fn already_failed() -> KernelError {
        KernelError::InvalidState {
            expected: "usable display",
            actual: "device abandoned after a failure",
        }
    }

    // ---- Phases ----

    fn probe(&mut self) -> KernelResult<()> {
        self.transport.probe(VIRTIO_DEVICE_GPU)?;

        let queue = VirtQueue::init(&self.transport, &self.allocator, self.config.queue_index)?;
        let commands = CommandBuffer::new(&self.allocator)?;
        log::info!(
            "[VIRTIO-GPU] Control queue {} ready, command buffer at {:#x}",
            queue.queue_index(),
            commands.phys_addr().as_u64()
        );

        self.control = Some(ControlQueue { queue, commands });
        Ok(())
    }

    fn get_display_info(&mut self) -> KernelResult<()> {
        let staged = self.submit(GpuRequest::GetDisplayInfo)?;
        let info = self.control()?.commands.display_info(&staged)?;

        let display = select_scanout(&info)?;
        log::info!(
            "[VIRTIO-GPU] Scanout {}: {}x{}",
            display.scanout_id,
            display.width,
            display.height
        );

        self.display = Some(display);
        Ok(())
    }

    fn create_resource_2d(&mut self) -> KernelResult<()> {
        let display = self.selected_display()?;
        self.submit(GpuRequest::ResourceCreate2d {
            resource_id: self.config.resource_id,
            format: self.config.format,
            width: display.width,
            height: display.height,
        })?;
        log::info!(
            "[VIRTIO-GPU] Created resource {} ({}x{}, format {})",
            self.config.resource_id,
            display.width,
            display.height,
            self.config.format
        );
        Ok(())
    }

    fn attach_backing(&mut self) -> KernelResult<()> {
        let display = self.selected_display()?;
        let length = display.framebuffer_len()?;

        let region = alloc_dma(&self.allocator, frames_for(length as usize))?;
        self.submit(GpuRequest::AttachBacking {
            resource_id: self.config.resource_id,
            addr: region.phys,
            length,
        })?;
        log::info!(
            "[VIRTIO-GPU] Framebuffer at {:#x}, {} bytes",
            region.phys.as_u64(),
            length
        );

        self.framebuffer = Some(Framebuffer {
            phys: region.phys,
            pixels: region.virt.cast::<u32>(),
            width: display.width,
            height: display.height,
            size_bytes: length as usize,
        });
        Ok(())
    }

    fn set_scanout(&mut self) -> KernelResult<()> {
        let display = self.selected_display()?;
        self.submit(GpuRequest::SetScanout {
            scanout_id: display.scanout_id,
            resource_id: self.config.resource_id,
            rect: display.rect(),
        })?;
        log::info!(
            "[VIRTIO-GPU] Resource {} bound to scanout {}",
            self.config.resource_id,
            display.scanout_id
        );
        Ok(())
    }

    fn transfer_to_host_2d(&mut self) -> KernelResult<()> {
        let display = self.selected_display()?;
        self.submit(GpuRequest::TransferToHost2d {
            resource_id: self.config.resource_id,
            rect: display.rect(),
        })?;
        log::debug!("[VIRTIO-GPU] Transferred {}x{}", display.width, display.height);
        Ok(())
    }

    fn resource_flush(&mut self) -> KernelResult<()> {
        let display = self.selected_display()?;
        self.submit(GpuRequest::ResourceFlush {
            resource_id: self.config.resource_id,
            rect: display.rect(),
        })?;
        log::debug!("[VIRTIO-GPU] Flushed resource {}", self.config.resource_id);
        Ok(())
    }

    // ---- Command submission ----

    /// Issue one command and wait for its confirmation.
    fn submit(&mut self, request: GpuRequest) -> KernelResult<StagedCommand> {
        let budget = self.config.poll_budget;
        let control = self.control.as_mut().ok_or(KernelError::InvalidState {
            expected: "probed device",
            actual: "no control queue",
        })?;

        debug_assert!(
            !control.queue.is_busy(),
            "virtio-gpu: request submitted while another is in flight"
        );

        let staged = control.commands.stage(&request);
        control.queue.write_chain(0, staged.chain());
        control.queue.kick(&self.transport, 0);
        control.queue.wait_idle(budget, request.name())?;

        let actual = control.commands.response_header(&staged).hdr_type;
        let expected = request.expected_response();
        if actual != expected {
            log::error!(
                "[VIRTIO-GPU] {} failed: {} ({:#x})",
                request.name(),
                code_name(actual),
                actual
            );
            return Err(VirtioError::CommandRejected {
                command: request.name(),
                expected,
                actual,
            }
            .into());
        }

        Ok(staged)
    }

    fn control(&self) -> KernelResult<&ControlQueue> {
        self.control.as_ref().ok_or(KernelError::InvalidState {
            expected: "probed device",
            actual: "no control queue",
        })
    }

    fn selected_display(&self) -> KernelResult<DisplayMode> {
        self.display.ok_or(KernelError::InvalidState {
            expected: "selected scanout",
            actual: "no display info",
        })
    }
}
