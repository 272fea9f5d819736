use crate::host::module::ModuleId;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum HostError {
    #[error("I/O Error: {0}")]
    Io(#[from] std::io::Error),

    #[error("{op} ioctl failed: {source}")]
    Ioctl {
        op: &'static str,
        #[source]
        source: std::io::Error,
    },

    #[error("Out of memory")]
    OutOfMemory,

    #[error("Access denied")]
    AccessDenied,

    #[error("Unsupported module: {0:?}")]
    UnsupportedModule(ModuleId),

    #[error("Kernel driver not found: {0}")]
    KernelDriverNotFound(String),

    #[error("Operation timed out")]
    WaitTimeout,

    #[error("Invalid state: {0}")]
    InvalidState(&'static str),

    #[error("Bad parameter: {0}")]
    BadParameter(String),

    #[error("Invalid alignment {0:#x}: not a power of two")]
    InvalidAlignment(u32),

    #[error("Malformed register descriptor: {0}")]
    MalformedDescriptor(String),

    #[error("Not initialized")]
    NotInitialized,
}

/// Coarse grouping of [`HostError`] used by callers to pick a recovery policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// Memory, device or permission exhaustion. Caller may fall back.
    Resource,
    /// Timeouts. Caller may retry.
    Timing,
    /// Kernel communication failures and bad descriptors. Not retried here.
    Protocol,
    /// Violated preconditions.
    Programmer,
}

impl HostError {
    pub(crate) fn ioctl(op: &'static str, source: std::io::Error) -> Self {
        Self::Ioctl { op, source }
    }

    #[must_use]
    pub const fn class(&self) -> ErrorClass {
        match self {
            Self::OutOfMemory
            | Self::AccessDenied
            | Self::UnsupportedModule(_)
            | Self::KernelDriverNotFound(_) => ErrorClass::Resource,
            Self::WaitTimeout => ErrorClass::Timing,
            Self::Io(_) | Self::Ioctl { .. } | Self::MalformedDescriptor(_) => {
                ErrorClass::Protocol
            }
            Self::InvalidState(_)
            | Self::BadParameter(_)
            | Self::InvalidAlignment(_)
            | Self::NotInitialized => ErrorClass::Programmer,
        }
    }

    /// The raw OS error behind an I/O or ioctl failure, if any.
    #[must_use]
    pub fn raw_os_error(&self) -> Option<i32> {
        match self {
            Self::Io(e) | Self::Ioctl { source: e, .. } => e.raw_os_error(),
            _ => None,
        }
    }
}

// A convenient alias
pub type HostResult<T> = Result<T, HostError>;
