//! VirtIO GPU wire protocol
//!
//! Command/response codes and the fixed-layout structures the device reads
//! from and writes into guest memory. Every structure derives
//! [`bytemuck::Pod`], which refuses to compile if the layout has implicit
//! padding, so the Rust layout is the wire layout. Byte order is the
//! platform's native order.

use bytemuck::{Pod, Zeroable};

// ============================================================================
// VirtIO GPU Protocol Constants
// ============================================================================

// --- Command types ---

/// Get display info (returns display modes for all scanouts)
pub const VIRTIO_GPU_CMD_GET_DISPLAY_INFO: u32 = 0x100;
/// Create a 2D resource (host-side texture)
pub const VIRTIO_GPU_CMD_RESOURCE_CREATE_2D: u32 = 0x101;
/// Set scanout (bind resource to display output)
pub const VIRTIO_GPU_CMD_SET_SCANOUT: u32 = 0x103;
/// Flush resource to display
pub const VIRTIO_GPU_CMD_RESOURCE_FLUSH: u32 = 0x104;
/// Transfer data from guest to host resource
pub const VIRTIO_GPU_CMD_TRANSFER_TO_HOST_2D: u32 = 0x105;
/// Attach backing store pages to a resource
pub const VIRTIO_GPU_CMD_RESOURCE_ATTACH_BACKING: u32 = 0x106;

// --- Response types ---

/// Success, no data payload
pub const VIRTIO_GPU_RESP_OK_NODATA: u32 = 0x1100;
/// Success, display info payload
pub const VIRTIO_GPU_RESP_OK_DISPLAY_INFO: u32 = 0x1101;

/// Error: unspecified
pub const VIRTIO_GPU_RESP_ERR_UNSPEC: u32 = 0x1200;
/// Error: out of memory on host
pub const VIRTIO_GPU_RESP_ERR_OUT_OF_MEMORY: u32 = 0x1201;
/// Error: invalid scanout ID
pub const VIRTIO_GPU_RESP_ERR_INVALID_SCANOUT_ID: u32 = 0x1202;
/// Error: invalid resource ID
pub const VIRTIO_GPU_RESP_ERR_INVALID_RESOURCE_ID: u32 = 0x1203;
/// Error: invalid context ID
pub const VIRTIO_GPU_RESP_ERR_INVALID_CONTEXT_ID: u32 = 0x1204;
/// Error: invalid parameter
pub const VIRTIO_GPU_RESP_ERR_INVALID_PARAMETER: u32 = 0x1205;

// --- Pixel formats ---

/// B8G8R8A8 (BGRA with alpha, native for many displays)
pub const FORMAT_B8G8R8A8_UNORM: u32 = 1;

/// Max scanouts reported by GET_DISPLAY_INFO
pub const VIRTIO_GPU_MAX_SCANOUTS: usize = 16;

/// Human-readable name of a command or response code, for diagnostics.
pub fn code_name(code: u32) -> &'static str {
    match code {
        VIRTIO_GPU_CMD_GET_DISPLAY_INFO => "GET_DISPLAY_INFO",
        VIRTIO_GPU_CMD_RESOURCE_CREATE_2D => "RESOURCE_CREATE_2D",
        VIRTIO_GPU_CMD_SET_SCANOUT => "SET_SCANOUT",
        VIRTIO_GPU_CMD_RESOURCE_FLUSH => "RESOURCE_FLUSH",
        VIRTIO_GPU_CMD_TRANSFER_TO_HOST_2D => "TRANSFER_TO_HOST_2D",
        VIRTIO_GPU_CMD_RESOURCE_ATTACH_BACKING => "RESOURCE_ATTACH_BACKING",
        VIRTIO_GPU_RESP_OK_NODATA => "OK_NODATA",
        VIRTIO_GPU_RESP_OK_DISPLAY_INFO => "OK_DISPLAY_INFO",
        VIRTIO_GPU_RESP_ERR_UNSPEC => "ERR_UNSPEC",
        VIRTIO_GPU_RESP_ERR_OUT_OF_MEMORY => "ERR_OUT_OF_MEMORY",
        VIRTIO_GPU_RESP_ERR_INVALID_SCANOUT_ID => "ERR_INVALID_SCANOUT_ID",
        VIRTIO_GPU_RESP_ERR_INVALID_RESOURCE_ID => "ERR_INVALID_RESOURCE_ID",
        VIRTIO_GPU_RESP_ERR_INVALID_CONTEXT_ID => "ERR_INVALID_CONTEXT_ID",
        VIRTIO_GPU_RESP_ERR_INVALID_PARAMETER => "ERR_INVALID_PARAMETER",
        _ => "UNKNOWN",
    }
}

// ============================================================================
// VirtIO GPU Protocol Structures
// ============================================================================

/// VirtIO GPU control header -- common prefix for all commands and responses.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Pod, Zeroable)]
pub struct VirtioGpuCtrlHdr {
    /// Command or response type
    pub hdr_type: u32,
    /// Flags (e.g. VIRTIO_GPU_FLAG_FENCE)
    pub flags: u32,
    /// Fence ID for synchronization
    pub fence_id: u64,
    /// 3D rendering context ID (0 for 2D)
    pub ctx_id: u32,
    pub padding: u32,
}

impl VirtioGpuCtrlHdr {
    /// Create a new command header with the given type.
    pub fn new(hdr_type: u32) -> Self {
        Self {
            hdr_type,
            ..Self::default()
        }
    }
}

/// Rectangle structure for GPU commands.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Pod, Zeroable)]
pub struct VirtioGpuRect {
    /// X coordinate
    pub x: u32,
    /// Y coordinate
    pub y: u32,
    /// Width in pixels
    pub width: u32,
    /// Height in pixels
    pub height: u32,
}

impl VirtioGpuRect {
    /// Create a new rectangle.
    pub fn new(x: u32, y: u32, width: u32, height: u32) -> Self {
        Self {
            x,
            y,
            width,
            height,
        }
    }
}

/// Display mode information for one scanout.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Pod, Zeroable)]
pub struct VirtioGpuDisplayOne {
    /// Active display rectangle (position and size)
    pub rect: VirtioGpuRect,
    /// Whether this scanout is enabled
    pub enabled: u32,
    /// Scanout flags
    pub flags: u32,
}

/// Response to GET_DISPLAY_INFO command.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Pod, Zeroable)]
pub struct VirtioGpuRespDisplayInfo {
    /// Response header
    pub hdr: VirtioGpuCtrlHdr,
    /// Display modes for up to 16 scanouts
    pub pmodes: [VirtioGpuDisplayOne; VIRTIO_GPU_MAX_SCANOUTS],
}

/// RESOURCE_CREATE_2D command structure.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Pod, Zeroable)]
pub struct VirtioGpuResourceCreate2d {
    pub hdr: VirtioGpuCtrlHdr,
    /// Unique resource identifier
    pub resource_id: u32,
    /// Pixel format (FORMAT_B8G8R8A8_UNORM etc.)
    pub format: u32,
    pub width: u32,
    pub height: u32,
}

/// RESOURCE_ATTACH_BACKING command structure.
///
/// Followed in the descriptor chain by `nr_entries` [`VirtioGpuMemEntry`]
/// elements.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Pod, Zeroable)]
pub struct VirtioGpuResourceAttachBacking {
    pub hdr: VirtioGpuCtrlHdr,
    /// Resource to attach backing to
    pub resource_id: u32,
    /// Number of memory entries following this struct
    pub nr_entries: u32,
}

/// A single memory entry for RESOURCE_ATTACH_BACKING.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Pod, Zeroable)]
pub struct VirtioGpuMemEntry {
    /// Physical address of the backing memory
    pub addr: u64,
    /// Length in bytes
    pub length: u32,
    pub padding: u32,
}

/// SET_SCANOUT command structure.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Pod, Zeroable)]
pub struct VirtioGpuSetScanout {
    pub hdr: VirtioGpuCtrlHdr,
    /// Rectangle within the resource to display
    pub rect: VirtioGpuRect,
    /// Scanout index (display output)
    pub scanout_id: u32,
    /// Resource to display
    pub resource_id: u32,
}

/// TRANSFER_TO_HOST_2D command structure.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Pod, Zeroable)]
pub struct VirtioGpuTransferToHost2d {
    pub hdr: VirtioGpuCtrlHdr,
    /// Rectangle within the resource to transfer
    pub rect: VirtioGpuRect,
    /// Byte offset within the resource backing store
    pub offset: u64,
    pub resource_id: u32,
    pub padding: u32,
}

/// RESOURCE_FLUSH command structure.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Pod, Zeroable)]
pub struct VirtioGpuResourceFlush {
    pub hdr: VirtioGpuCtrlHdr,
    /// Rectangle to flush to display
    pub rect: VirtioGpuRect,
    pub resource_id: u32,
    pub padding: u32,
}
