//! Typed GPU requests and the command buffer they are staged in.
//!
//! The driver owns one page-allocated command buffer for its whole life.
//! Each submission is described by a [`GpuRequest`] variant, which knows the
//! exact structure(s) it serializes, the response it expects and the shape of
//! its descriptor chain. Nothing outside this module reinterprets the buffer.

use core::{mem::size_of, ptr};

use super::protocol::*;
use crate::{
    drivers::virtio::queue::ChainBuffer,
    error::{KernelError, KernelResult},
    mm::{alloc_dma, align_up, frames_for, DmaRegion, PageAllocator, PhysicalAddress},
};

/// One GPU control command.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GpuRequest {
    GetDisplayInfo,
    ResourceCreate2d {
        resource_id: u32,
        format: u32,
        width: u32,
        height: u32,
    },
    /// Attach a single contiguous backing region.
    AttachBacking {
        resource_id: u32,
        addr: PhysicalAddress,
        length: u32,
    },
    SetScanout {
        scanout_id: u32,
        resource_id: u32,
        rect: VirtioGpuRect,
    },
    TransferToHost2d {
        resource_id: u32,
        rect: VirtioGpuRect,
    },
    ResourceFlush {
        resource_id: u32,
        rect: VirtioGpuRect,
    },
}

impl GpuRequest {
    /// Wire command code.
    pub fn command_type(&self) -> u32 {
        match self {
            Self::GetDisplayInfo => VIRTIO_GPU_CMD_GET_DISPLAY_INFO,
            Self::ResourceCreate2d { .. } => VIRTIO_GPU_CMD_RESOURCE_CREATE_2D,
            Self::AttachBacking { .. } => VIRTIO_GPU_CMD_RESOURCE_ATTACH_BACKING,
            Self::SetScanout { .. } => VIRTIO_GPU_CMD_SET_SCANOUT,
            Self::TransferToHost2d { .. } => VIRTIO_GPU_CMD_TRANSFER_TO_HOST_2D,
            Self::ResourceFlush { .. } => VIRTIO_GPU_CMD_RESOURCE_FLUSH,
        }
    }

    pub fn name(&self) -> &'static str {
        code_name(self.command_type())
    }

    /// Response type that confirms success.
    pub fn expected_response(&self) -> u32 {
        match self {
            Self::GetDisplayInfo => VIRTIO_GPU_RESP_OK_DISPLAY_INFO,
            _ => VIRTIO_GPU_RESP_OK_NODATA,
        }
    }

    /// Bytes the device may write back.
    pub fn response_len(&self) -> usize {
        match self {
            Self::GetDisplayInfo => size_of::<VirtioGpuRespDisplayInfo>(),
            _ => size_of::<VirtioGpuCtrlHdr>(),
        }
    }
}

/// Where a staged request's response will land.
#[derive(Debug, Clone, Copy)]
pub struct StagedCommand {
    chain: [ChainBuffer; 3],
    chain_len: usize,
    response_offset: usize,
}

impl StagedCommand {
    /// Descriptor chain: request segment(s) then the response buffer.
    pub fn chain(&self) -> &[ChainBuffer] {
        &self.chain[..self.chain_len]
    }
}

/// Request area size; the response follows at this (8-byte aligned) offset.
const MAX_REQUEST_BYTES: usize = 64;
const BUFFER_BYTES: usize = MAX_REQUEST_BYTES + size_of::<VirtioGpuRespDisplayInfo>();

/// Page-allocated region shared with the device for control commands.
pub struct CommandBuffer {
    region: DmaRegion,
}

impl CommandBuffer {
    pub fn new<A: PageAllocator>(allocator: &A) -> KernelResult<Self> {
        let region = alloc_dma(allocator, frames_for(BUFFER_BYTES))?;
        Ok(Self { region })
    }

    pub fn phys_addr(&self) -> PhysicalAddress {
        self.region.phys
    }

    /// Serialize `request` into the buffer and describe its chain.
    ///
    /// The response area is zeroed first, so a device that completes without
    /// writing leaves a response type of 0.
    pub fn stage(&mut self, request: &GpuRequest) -> StagedCommand {
        let (request_len, entry) = match *request {
            GpuRequest::GetDisplayInfo => {
                let hdr = VirtioGpuCtrlHdr::new(VIRTIO_GPU_CMD_GET_DISPLAY_INFO);
                (self.put(0, &hdr), None)
            }
            GpuRequest::ResourceCreate2d {
                resource_id,
                format,
                width,
                height,
            } => {
                let cmd = VirtioGpuResourceCreate2d {
                    hdr: VirtioGpuCtrlHdr::new(VIRTIO_GPU_CMD_RESOURCE_CREATE_2D),
                    resource_id,
                    format,
                    width,
                    height,
                };
                (self.put(0, &cmd), None)
            }
            GpuRequest::AttachBacking {
                resource_id,
                addr,
                length,
            } => {
                let cmd = VirtioGpuResourceAttachBacking {
                    hdr: VirtioGpuCtrlHdr::new(VIRTIO_GPU_CMD_RESOURCE_ATTACH_BACKING),
                    resource_id,
                    nr_entries: 1,
                };
                let len = self.put(0, &cmd);
                let entry = VirtioGpuMemEntry {
                    addr: addr.as_u64(),
                    length,
                    padding: 0,
                };
                let entry_len = self.put(len, &entry);
                (len, Some((len, entry_len)))
            }
            GpuRequest::SetScanout {
                scanout_id,
                resource_id,
                rect,
            } => {
                let cmd = VirtioGpuSetScanout {
                    hdr: VirtioGpuCtrlHdr::new(VIRTIO_GPU_CMD_SET_SCANOUT),
                    rect,
                    scanout_id,
                    resource_id,
                };
                (self.put(0, &cmd), None)
            }
            GpuRequest::TransferToHost2d { resource_id, rect } => {
                let cmd = VirtioGpuTransferToHost2d {
                    hdr: VirtioGpuCtrlHdr::new(VIRTIO_GPU_CMD_TRANSFER_TO_HOST_2D),
                    rect,
                    offset: 0,
                    resource_id,
                    padding: 0,
                };
                (self.put(0, &cmd), None)
            }
            GpuRequest::ResourceFlush { resource_id, rect } => {
                let cmd = VirtioGpuResourceFlush {
                    hdr: VirtioGpuCtrlHdr::new(VIRTIO_GPU_CMD_RESOURCE_FLUSH),
                    rect,
                    resource_id,
                    padding: 0,
                };
                (self.put(0, &cmd), None)
            }
        };

        let response_offset = MAX_REQUEST_BYTES;
        let response_len = request.response_len();
        self.zero(response_offset, response_len);

        let base = self.region.phys;
        let mut chain = [ChainBuffer::readable(base, request_len); 3];
        let mut chain_len = 1;
        if let Some((offset, len)) = entry {
            chain[chain_len] = ChainBuffer::readable(base.offset(offset), len);
            chain_len += 1;
        }
        chain[chain_len] = ChainBuffer::writable(base.offset(response_offset), response_len);
        chain_len += 1;

        StagedCommand {
            chain,
            chain_len,
            response_offset,
        }
    }

    /// Header of the response the device wrote for `staged`.
    pub fn response_header(&self, staged: &StagedCommand) -> VirtioGpuCtrlHdr {
        self.get(staged.response_offset)
    }

    /// Full GET_DISPLAY_INFO payload for `staged`.
    pub fn display_info(&self, staged: &StagedCommand) -> KernelResult<VirtioGpuRespDisplayInfo> {
        if staged.chain().last().map(|b| b.len as usize)
            != Some(size_of::<VirtioGpuRespDisplayInfo>())
        {
            return Err(KernelError::InvalidState {
                expected: "GET_DISPLAY_INFO response",
                actual: "header-only response",
            });
        }
        Ok(self.get(staged.response_offset))
    }

    /// Write `value` at `offset`, returning its length.
    fn put<T: bytemuck::Pod>(&mut self, offset: usize, value: &T) -> usize {
        let bytes = bytemuck::bytes_of(value);
        debug_assert!(offset + bytes.len() <= MAX_REQUEST_BYTES);
        // SAFETY: the region spans at least BUFFER_BYTES of mapped memory
        // owned by this CommandBuffer; the range is in bounds.
        unsafe {
            ptr::copy_nonoverlapping(bytes.as_ptr(), self.at(offset), bytes.len());
        }
        bytes.len()
    }

    fn zero(&mut self, offset: usize, len: usize) {
        debug_assert!(offset + len <= self.region.len);
        // SAFETY: see `put`.
        unsafe {
            ptr::write_bytes(self.at(offset), 0, len);
        }
    }

    fn get<T: bytemuck::Pod>(&self, offset: usize) -> T {
        debug_assert_eq!(align_up(offset, 8), offset);
        // SAFETY: the response area lies inside the buffer, is 8-byte aligned
        // (page base + MAX_REQUEST_BYTES) and was written by the device; the
        // volatile read keeps the load after the completion poll.
        unsafe { ptr::read_volatile(self.at(offset).cast::<T>()) }
    }

    fn at(&self, offset: usize) -> *mut u8 {
        self.region.virt.as_ptr().wrapping_add(offset)
    }
}
