//! Error types for the virtio-gpu boot path
//!
//! Every failure in this crate is fatal at the layer that detects it: the
//! error is propagated with `?` up to the boot entry point, which logs it and
//! halts. There is no retryable category.

use core::fmt;

/// Main kernel error type
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KernelError {
    /// Memory-related errors
    OutOfMemory {
        requested: usize,
        available: usize,
    },

    /// Operation attempted in the wrong driver phase
    InvalidState {
        expected: &'static str,
        actual: &'static str,
    },

    /// Virtio transport or device protocol errors
    VirtioError(VirtioError),

    /// A bounded poll ran out of spins before the device completed
    Timeout {
        operation: &'static str,
        spins: u64,
    },
}

/// Virtio-specific errors
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VirtioError {
    /// An identity register did not hold the expected virtio-gpu value.
    ProbeMismatch {
        register: &'static str,
        expected: u32,
        actual: u32,
    },
    /// The device answered a command with an unexpected response type.
    CommandRejected {
        command: &'static str,
        expected: u32,
        actual: u32,
    },
    /// GET_DISPLAY_INFO reported no enabled scanout.
    NoEnabledScanout,
    /// The selected scanout has no pixels to back.
    EmptyDisplayMode {
        scanout_id: u32,
        width: u32,
        height: u32,
    },
}

/// Result type alias for kernel operations
pub type KernelResult<T> = Result<T, KernelError>;

impl fmt::Display for KernelError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::OutOfMemory {
                requested,
                available,
            } => {
                write!(
                    f,
                    "Out of memory: requested {} bytes, {} available",
                    requested, available
                )
            }
            Self::InvalidState { expected, actual } => {
                write!(f, "Invalid state: expected {}, got {}", expected, actual)
            }
            Self::VirtioError(e) => write!(f, "virtio: {}", e),
            Self::Timeout { operation, spins } => {
                write!(f, "Timeout during {}: {} spins", operation, spins)
            }
        }
    }
}

impl fmt::Display for VirtioError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ProbeMismatch {
                register,
                expected,
                actual,
            } => write!(
                f,
                "invalid {}: expected {:#x}, read {:#x}",
                register, expected, actual
            ),
            Self::CommandRejected {
                command,
                expected,
                actual,
            } => write!(
                f,
                "{} rejected: expected response {:#06x}, got {:#06x}",
                command, expected, actual
            ),
            Self::NoEnabledScanout => write!(f, "no display found"),
            Self::EmptyDisplayMode {
                scanout_id,
                width,
                height,
            } => write!(
                f,
                "scanout {} reports an empty {}x{} mode",
                scanout_id, width, height
            ),
        }
    }
}

impl From<VirtioError> for KernelError {
    fn from(err: VirtioError) -> Self {
        Self::VirtioError(err)
    }
}
