//! Host-side stand-ins for the hardware the display path drives.
//!
//! [`HostMemory`] plays physical RAM and the page allocator, [`RegisterFile`]
//! is a passive register window, and [`MockGpuDevice`] is a scripted legacy
//! virtio-gpu that walks the control queue synchronously whenever the driver
//! rings the doorbell.

use core::{
    cell::{Cell, RefCell},
    mem::size_of,
    ptr,
};
use std::{
    alloc::{self, Layout},
    collections::BTreeMap,
    sync::Mutex,
};

use bytemuck::Pod;
use log::{Level, LevelFilter};

use crate::{
    drivers::{
        virtio::{
            mmio::{regs, RegisterWindow, LEGACY_VERSION, VIRTIO_MMIO_MAGIC},
            queue::{DescFlags, VirtqDesc, VirtqUsedElem, QUEUE_SIZE},
            VIRTIO_DEVICE_GPU,
        },
        virtio_gpu::protocol::*,
    },
    error::{KernelError, KernelResult},
    log_service::{self, LogEntry},
    mm::{align_up, PageAllocator, PhysicalAddress, FRAME_SIZE},
};

/// Every entry recorded since [`capture_logs`] first ran, as
/// (level, subsystem, message).
static CAPTURED: Mutex<Vec<(Level, String, String)>> = Mutex::new(Vec::new());

fn capture(entry: &LogEntry) {
    CAPTURED
        .lock()
        .unwrap_or_else(|poisoned| poisoned.into_inner())
        .push((entry.level, entry.subsystem().to_string(), entry.message().to_string()));
}

/// Install the log service at trace level with a sink that keeps every
/// entry. The ring buffer is shared by all tests running in parallel and
/// overwrites old entries; the capture never does.
pub fn capture_logs() {
    log_service::log_init(LevelFilter::Trace);
    log_service::set_console(capture);
}

pub fn captured() -> Vec<(Level, String, String)> {
    CAPTURED
        .lock()
        .unwrap_or_else(|poisoned| poisoned.into_inner())
        .clone()
}

/// Fill pattern for fresh pages, so code that forgets to zero shows up.
const POISON: u8 = 0xa5;

/// Physical address of the first arena page: the RAM base of QEMU's RISC-V
/// `virt` machine.
pub const GUEST_RAM_BASE: u64 = 0x8000_0000;

/// A page-aligned arena of host memory handed out front to back.
///
/// Pages are given guest physical addresses starting at a chosen base and
/// reached through [`PageAllocator::phys_to_virt`], the way a kernel with a
/// fixed physical-memory offset would.
pub struct HostMemory {
    base: *mut u8,
    layout: Layout,
    phys_base: u64,
    next_page: Cell<usize>,
}

impl HostMemory {
    /// Arena of `pages` frames at [`GUEST_RAM_BASE`].
    pub fn new(pages: usize) -> Self {
        Self::at(GUEST_RAM_BASE, pages)
    }

    /// Arena of `pages` frames whose first physical address is `phys_base`.
    pub fn at(phys_base: u64, pages: usize) -> Self {
        assert!(pages > 0 && phys_base % FRAME_SIZE as u64 == 0);
        let layout = Layout::from_size_align(pages * FRAME_SIZE, FRAME_SIZE).unwrap();
        // SAFETY: layout has a non-zero size.
        let base = unsafe { alloc::alloc(layout) };
        assert!(!base.is_null(), "host allocation failed");
        // SAFETY: `base` is a fresh allocation of `layout.size()` bytes.
        unsafe { ptr::write_bytes(base, POISON, layout.size()) };

        Self {
            base,
            layout,
            phys_base,
            next_page: Cell::new(0),
        }
    }

    fn pages(&self) -> usize {
        self.layout.size() / FRAME_SIZE
    }

    pub fn contains(&self, addr: u64, len: usize) -> bool {
        let end = self.phys_base + self.layout.size() as u64;
        addr >= self.phys_base && addr + len as u64 <= end
    }

    fn host_ptr(&self, addr: u64, len: usize) -> *mut u8 {
        assert!(
            self.contains(addr, len),
            "access outside guest memory: {:#x}+{}",
            addr,
            len
        );
        self.base.wrapping_add((addr - self.phys_base) as usize)
    }

    pub fn read(&self, addr: u64, len: usize) -> Vec<u8> {
        let src = self.host_ptr(addr, len);
        let mut out = vec![0u8; len];
        // SAFETY: `host_ptr` checked the range lies inside the arena.
        unsafe { ptr::copy_nonoverlapping(src, out.as_mut_ptr(), len) };
        out
    }

    pub fn write(&self, addr: u64, data: &[u8]) {
        let dst = self.host_ptr(addr, data.len());
        // SAFETY: `host_ptr` checked the range lies inside the arena.
        unsafe { ptr::copy_nonoverlapping(data.as_ptr(), dst, data.len()) };
    }

    pub fn load<T: Pod>(&self, addr: u64) -> T {
        bytemuck::pod_read_unaligned(&self.read(addr, size_of::<T>()))
    }

    pub fn store<T: Pod>(&self, addr: u64, value: &T) {
        self.write(addr, bytemuck::bytes_of(value));
    }
}

impl PageAllocator for HostMemory {
    fn alloc_pages(&self, count: usize) -> KernelResult<PhysicalAddress> {
        let next = self.next_page.get();
        let available = (self.pages() - next) * FRAME_SIZE;
        if count == 0 || count * FRAME_SIZE > available {
            return Err(KernelError::OutOfMemory {
                requested: count * FRAME_SIZE,
                available,
            });
        }
        self.next_page.set(next + count);
        Ok(PhysicalAddress::new(self.phys_base + (next * FRAME_SIZE) as u64))
    }

    fn phys_to_virt(&self, phys: PhysicalAddress) -> *mut u8 {
        self.host_ptr(phys.as_u64(), 0)
    }
}

impl Drop for HostMemory {
    fn drop(&mut self) {
        // SAFETY: allocated in `new` with the same layout.
        unsafe { alloc::dealloc(self.base, self.layout) };
    }
}

/// Passive register window: writes are stored, reads return the last write.
#[derive(Default)]
pub struct RegisterFile {
    regs: RefCell<BTreeMap<usize, u32>>,
}

impl RegisterFile {
    /// Window answering the identity probe of a legacy virtio-gpu.
    pub fn gpu() -> Self {
        Self::identity(VIRTIO_MMIO_MAGIC, LEGACY_VERSION, VIRTIO_DEVICE_GPU)
    }

    pub fn identity(magic: u32, version: u32, device_id: u32) -> Self {
        let file = Self::default();
        file.write32(regs::MAGIC, magic);
        file.write32(regs::VERSION, version);
        file.write32(regs::DEVICE_ID, device_id);
        file
    }
}

impl RegisterWindow for RegisterFile {
    fn read32(&self, offset: usize) -> u32 {
        self.regs.borrow().get(&offset).copied().unwrap_or(0)
    }

    fn read64(&self, offset: usize) -> u64 {
        self.read32(offset) as u64 | (self.read32(offset + 4) as u64) << 32
    }

    fn write32(&self, offset: usize, value: u32) {
        self.regs.borrow_mut().insert(offset, value);
    }
}

/// Device-side view of the single 2D resource.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MockResource {
    pub id: u32,
    pub format: u32,
    pub width: u32,
    pub height: u32,
    /// (address, length) of the attached backing entry
    pub backing: Option<(u64, u32)>,
    pub scanout: Option<u32>,
    /// Host copy filled by TRANSFER_TO_HOST_2D
    pub pixels: Vec<u32>,
}

#[derive(Default)]
struct DeviceState {
    last_avail: u16,
    commands: Vec<u32>,
    chain_lengths: Vec<usize>,
    resource: Option<MockResource>,
    displayed: Vec<u32>,
    flush_count: usize,
    notify_count: usize,
}

/// Scripted legacy virtio-gpu.
///
/// Every QUEUE_NOTIFY write processes all newly published chains before the
/// write returns, unless the device is [`stalled`](Self::stalled).
pub struct MockGpuDevice<'m> {
    memory: &'m HostMemory,
    regs: RegisterFile,
    scanouts: [VirtioGpuDisplayOne; VIRTIO_GPU_MAX_SCANOUTS],
    rejections: Vec<(u32, u32)>,
    stalled: bool,
    state: RefCell<DeviceState>,
}

impl<'m> MockGpuDevice<'m> {
    /// A device with one enabled 800x600 scanout at index 0.
    pub fn new(memory: &'m HostMemory) -> Self {
        Self {
            memory,
            regs: RegisterFile::gpu(),
            scanouts: [VirtioGpuDisplayOne::default(); VIRTIO_GPU_MAX_SCANOUTS],
            rejections: Vec::new(),
            stalled: false,
            state: RefCell::new(DeviceState::default()),
        }
        .with_scanouts(&[(0, 800, 600)])
    }

    pub fn with_device_id(self, device_id: u32) -> Self {
        self.regs.write32(regs::DEVICE_ID, device_id);
        self
    }

    /// Replace the display table with these enabled (index, width, height)
    /// scanouts.
    pub fn with_scanouts(mut self, enabled: &[(usize, u32, u32)]) -> Self {
        self.scanouts = [VirtioGpuDisplayOne::default(); VIRTIO_GPU_MAX_SCANOUTS];
        for &(index, width, height) in enabled {
            self.scanouts[index] = VirtioGpuDisplayOne {
                rect: VirtioGpuRect::new(0, 0, width, height),
                enabled: 1,
                flags: 0,
            };
        }
        self
    }

    /// Answer `command` with `response` instead of executing it.
    pub fn rejecting(mut self, command: u32, response: u32) -> Self {
        self.rejections.push((command, response));
        self
    }

    /// Never complete any request.
    pub fn stalled(mut self) -> Self {
        self.stalled = true;
        self
    }

    pub fn register(&self, offset: usize) -> u32 {
        self.regs.read32(offset)
    }

    /// Command types received, in order.
    pub fn commands(&self) -> Vec<u32> {
        self.state.borrow().commands.clone()
    }

    /// Descriptor count of every processed chain, in order.
    pub fn chain_lengths(&self) -> Vec<usize> {
        self.state.borrow().chain_lengths.clone()
    }

    pub fn resource(&self) -> Option<MockResource> {
        self.state.borrow().resource.clone()
    }

    /// Pixels presented by the latest RESOURCE_FLUSH.
    pub fn displayed(&self) -> Vec<u32> {
        self.state.borrow().displayed.clone()
    }

    pub fn flush_count(&self) -> usize {
        self.state.borrow().flush_count
    }

    /// QUEUE_NOTIFY writes seen, including those a stalled device ignored.
    pub fn notify_count(&self) -> usize {
        self.state.borrow().notify_count
    }

    /// Walk the queue the way a legacy device does: the ring address is the
    /// QUEUE_PFN value itself (page shift 0) and the used ring sits on the
    /// first page boundary after the available ring.
    fn process_queue(&self) {
        let num = self.regs.read32(regs::QUEUE_NUM) as usize;
        assert_eq!(num, QUEUE_SIZE as usize, "queue size not programmed");
        let desc_base = self.regs.read32(regs::QUEUE_PFN) as u64;
        let avail_base = desc_base + (size_of::<VirtqDesc>() * num) as u64;
        let used_base = align_up(avail_base as usize + 4 + 2 * num, FRAME_SIZE) as u64;

        let mut state = self.state.borrow_mut();
        let avail_idx: u16 = self.memory.load(avail_base + 2);

        while state.last_avail != avail_idx {
            let slot = state.last_avail as usize % num;
            let head: u16 = self.memory.load(avail_base + 4 + 2 * slot as u64);

            let mut request = Vec::new();
            let mut response = None;
            let mut links = 0;
            let mut idx = head;
            loop {
                let desc: VirtqDesc = self.memory.load(desc_base + 16 * idx as u64);
                links += 1;
                assert!(links <= num, "descriptor chain loops");
                if desc.flags().contains(DescFlags::WRITE) {
                    assert!(response.is_none(), "more than one response descriptor");
                    response = Some((desc.addr, desc.len as usize));
                } else {
                    assert!(response.is_none(), "readable descriptor after response");
                    request.extend(self.memory.read(desc.addr, desc.len as usize));
                }
                if !desc.flags().contains(DescFlags::NEXT) {
                    break;
                }
                idx = desc.next;
            }

            let (resp_addr, resp_len) = response.expect("chain has no device-writable descriptor");
            let reply = self.execute(&mut state, &request);
            assert!(reply.len() <= resp_len, "response buffer too small");
            self.memory.write(resp_addr, &reply);

            let used_idx: u16 = self.memory.load(used_base + 2);
            let elem = VirtqUsedElem {
                id: head as u32,
                len: reply.len() as u32,
            };
            self.memory
                .store(used_base + 4 + 8 * (used_idx as usize % num) as u64, &elem);
            self.memory.store(used_base + 2, &used_idx.wrapping_add(1));

            state.chain_lengths.push(links);
            state.last_avail = state.last_avail.wrapping_add(1);
        }
    }

    fn execute(&self, state: &mut DeviceState, request: &[u8]) -> Vec<u8> {
        let hdr: VirtioGpuCtrlHdr = decode(request);
        state.commands.push(hdr.hdr_type);

        if let Some(&(_, code)) = self.rejections.iter().find(|(c, _)| *c == hdr.hdr_type) {
            return bytemuck::bytes_of(&VirtioGpuCtrlHdr::new(code)).to_vec();
        }

        let result = match hdr.hdr_type {
            VIRTIO_GPU_CMD_GET_DISPLAY_INFO => return self.cmd_get_display_info(),
            VIRTIO_GPU_CMD_RESOURCE_CREATE_2D => Self::cmd_resource_create_2d(state, request),
            VIRTIO_GPU_CMD_RESOURCE_ATTACH_BACKING => {
                Self::cmd_resource_attach_backing(state, request)
            }
            VIRTIO_GPU_CMD_SET_SCANOUT => Self::cmd_set_scanout(state, request),
            VIRTIO_GPU_CMD_TRANSFER_TO_HOST_2D => self.cmd_transfer_to_host_2d(state, request),
            VIRTIO_GPU_CMD_RESOURCE_FLUSH => Self::cmd_resource_flush(state, request),
            _ => Err(VIRTIO_GPU_RESP_ERR_UNSPEC),
        };

        let code = result.err().unwrap_or(VIRTIO_GPU_RESP_OK_NODATA);
        bytemuck::bytes_of(&VirtioGpuCtrlHdr::new(code)).to_vec()
    }

    fn cmd_get_display_info(&self) -> Vec<u8> {
        let resp = VirtioGpuRespDisplayInfo {
            hdr: VirtioGpuCtrlHdr::new(VIRTIO_GPU_RESP_OK_DISPLAY_INFO),
            pmodes: self.scanouts,
        };
        bytemuck::bytes_of(&resp).to_vec()
    }

    fn cmd_resource_create_2d(state: &mut DeviceState, request: &[u8]) -> Result<(), u32> {
        let cmd: VirtioGpuResourceCreate2d = decode(request);
        if cmd.resource_id == 0 || cmd.width == 0 || cmd.height == 0 {
            return Err(VIRTIO_GPU_RESP_ERR_INVALID_PARAMETER);
        }
        state.resource = Some(MockResource {
            id: cmd.resource_id,
            format: cmd.format,
            width: cmd.width,
            height: cmd.height,
            backing: None,
            scanout: None,
            pixels: vec![0; cmd.width as usize * cmd.height as usize],
        });
        Ok(())
    }

    fn cmd_resource_attach_backing(state: &mut DeviceState, request: &[u8]) -> Result<(), u32> {
        let cmd: VirtioGpuResourceAttachBacking = decode(request);
        if cmd.nr_entries != 1 {
            return Err(VIRTIO_GPU_RESP_ERR_INVALID_PARAMETER);
        }
        let entry: VirtioGpuMemEntry = decode(&request[size_of::<VirtioGpuResourceAttachBacking>()..]);
        let resource = lookup(state, cmd.resource_id)?;
        resource.backing = Some((entry.addr, entry.length));
        Ok(())
    }

    fn cmd_set_scanout(state: &mut DeviceState, request: &[u8]) -> Result<(), u32> {
        let cmd: VirtioGpuSetScanout = decode(request);
        if cmd.scanout_id as usize >= VIRTIO_GPU_MAX_SCANOUTS {
            return Err(VIRTIO_GPU_RESP_ERR_INVALID_SCANOUT_ID);
        }
        let resource = lookup(state, cmd.resource_id)?;
        resource.scanout = Some(cmd.scanout_id);
        Ok(())
    }

    fn cmd_transfer_to_host_2d(&self, state: &mut DeviceState, request: &[u8]) -> Result<(), u32> {
        let cmd: VirtioGpuTransferToHost2d = decode(request);
        let resource = lookup(state, cmd.resource_id)?;
        let (backing, length) = resource.backing.ok_or(VIRTIO_GPU_RESP_ERR_UNSPEC)?;

        let rect = cmd.rect;
        if rect.x + rect.width > resource.width || rect.y + rect.height > resource.height {
            return Err(VIRTIO_GPU_RESP_ERR_INVALID_PARAMETER);
        }

        let stride = resource.width as u64 * 4;
        for y in rect.y..rect.y + rect.height {
            let offset = cmd.offset + y as u64 * stride + rect.x as u64 * 4;
            let row_bytes = rect.width as usize * 4;
            if offset + row_bytes as u64 > length as u64 {
                return Err(VIRTIO_GPU_RESP_ERR_INVALID_PARAMETER);
            }
            let row = self.memory.read(backing + offset, row_bytes);
            let start = (y * resource.width + rect.x) as usize;
            for (dst, src) in resource.pixels[start..start + rect.width as usize]
                .iter_mut()
                .zip(row.chunks_exact(4))
            {
                *dst = bytemuck::pod_read_unaligned(src);
            }
        }
        Ok(())
    }

    fn cmd_resource_flush(state: &mut DeviceState, request: &[u8]) -> Result<(), u32> {
        let cmd: VirtioGpuResourceFlush = decode(request);
        let pixels = lookup(state, cmd.resource_id)?.pixels.clone();
        state.displayed = pixels;
        state.flush_count += 1;
        Ok(())
    }
}

impl RegisterWindow for MockGpuDevice<'_> {
    fn read32(&self, offset: usize) -> u32 {
        self.regs.read32(offset)
    }

    fn read64(&self, offset: usize) -> u64 {
        self.regs.read64(offset)
    }

    fn write32(&self, offset: usize, value: u32) {
        self.regs.write32(offset, value);
        if offset == regs::QUEUE_NOTIFY {
            self.state.borrow_mut().notify_count += 1;
            if !self.stalled {
                self.process_queue();
            }
        }
    }
}

fn decode<T: Pod>(bytes: &[u8]) -> T {
    bytemuck::pod_read_unaligned(&bytes[..size_of::<T>()])
}

fn lookup(state: &mut DeviceState, resource_id: u32) -> Result<&mut MockResource, u32> {
    state
        .resource
        .as_mut()
        .filter(|r| r.id == resource_id)
        .ok_or(VIRTIO_GPU_RESP_ERR_INVALID_RESOURCE_ID)
}
