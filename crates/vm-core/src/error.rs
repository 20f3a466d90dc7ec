use std::io;

use thiserror::Error;

use crate::Location;

/// Error classes used for logging aggregation and caller policy decisions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Deserialize, serde::Serialize))]
pub enum ErrorClass {
    /// Guest/host address conversion or range violation.
    Address,
    /// No room for a requested allocation or mapping.
    Allocation,
    /// Page permission or reservation policy violation.
    Permission,
    /// Release of memory that is not (or no longer) allocated.
    Deallocation,
    /// Malformed size, alignment, or configuration argument.
    Argument,
    /// Session initialization/teardown ordering violation.
    Lifecycle,
    /// Host operating system refused a backing-store request.
    Host,
}

/// Error taxonomy for every fallible operation of the memory core.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum VmError {
    /// A host pointer does not belong to the guest mapping.
    #[error("not a guest memory pointer ({ptr:#x})")]
    ForeignPointer {
        /// Offending host address.
        ptr: usize,
    },
    /// A guest range falls outside the configured address space.
    #[error("guest range {addr:#010x}+{size:#x} is outside the address space")]
    OutOfRange {
        /// Start of the range.
        addr: u32,
        /// Length of the range in bytes.
        size: u64,
    },
    /// Address is not aligned to the required boundary.
    #[error("address {addr:#010x} is not aligned to {align:#x}")]
    Misaligned {
        /// Offending address.
        addr: u32,
        /// Required alignment in bytes.
        align: u32,
    },
    /// Size is zero or exceeds the containing area.
    #[error("invalid size {size:#x}")]
    InvalidSize {
        /// Offending size.
        size: u32,
    },
    /// Alignment is not a power of two or is below page granularity.
    #[error("invalid alignment {align:#x}")]
    InvalidAlignment {
        /// Offending alignment.
        align: u32,
    },
    /// Configuration values are inconsistent.
    #[error("invalid configuration: {reason}")]
    InvalidConfig {
        /// Human-readable reason.
        reason: &'static str,
    },
    /// No sufficiently large aligned gap exists.
    #[error("out of memory allocating {size:#x} bytes")]
    OutOfMemory {
        /// Requested size in bytes (page-rounded).
        size: u32,
    },
    /// The requested range overlaps an existing allocation or block.
    #[error("range {addr:#010x}+{size:#x} is already occupied")]
    Occupied {
        /// Start of the requested range.
        addr: u32,
        /// Length of the requested range.
        size: u32,
    },
    /// No block backs the requested address.
    #[error("no memory block contains {addr:#010x}")]
    NoBlock {
        /// Queried address.
        addr: u32,
    },
    /// A named location has no block and one could not be created.
    #[error("memory location {location:?} is unavailable")]
    LocationUnavailable {
        /// Queried location.
        location: Location,
    },
    /// No allocation starts exactly at the given address.
    #[error("no allocation starts at {addr:#010x}")]
    NotAllocated {
        /// Queried address.
        addr: u32,
    },
    /// Block still holds live allocations.
    #[error("block at {addr:#010x} still has {used:#x} bytes allocated")]
    BlockNotEmpty {
        /// Block start address.
        addr: u32,
        /// Bytes still allocated.
        used: u32,
    },
    /// Block was removed from the registry and can no longer allocate.
    #[error("block at {addr:#010x} has been unmapped")]
    BlockUnmapped {
        /// Block start address.
        addr: u32,
    },
    /// The page is flagged as having reservations disabled.
    #[error("reservations are disabled for the page at {addr:#010x}")]
    ReservationsDisabled {
        /// Queried address.
        addr: u32,
    },
    /// A process-wide session already exists.
    #[error("memory session is already initialized")]
    AlreadyInitialized,
    /// No process-wide session exists.
    #[error("memory session is not initialized")]
    NotInitialized,
    /// The host refused to create the backing mapping.
    #[error("failed to map {len:#x} bytes of host memory: {kind}")]
    HostMapping {
        /// Requested mapping length.
        len: u64,
        /// Host error category.
        kind: io::ErrorKind,
    },
}

/// Result alias for memory-core operations.
pub type VmResult<T> = Result<T, VmError>;

impl VmError {
    /// Returns the coarse class for this error.
    #[must_use]
    pub const fn class(&self) -> ErrorClass {
        match self {
            Self::ForeignPointer { .. } | Self::OutOfRange { .. } => ErrorClass::Address,
            Self::OutOfMemory { .. }
            | Self::Occupied { .. }
            | Self::NoBlock { .. }
            | Self::LocationUnavailable { .. } => ErrorClass::Allocation,
            Self::ReservationsDisabled { .. } => ErrorClass::Permission,
            Self::NotAllocated { .. } | Self::BlockNotEmpty { .. } | Self::BlockUnmapped { .. } => {
                ErrorClass::Deallocation
            }
            Self::Misaligned { .. }
            | Self::InvalidSize { .. }
            | Self::InvalidAlignment { .. }
            | Self::InvalidConfig { .. } => ErrorClass::Argument,
            Self::AlreadyInitialized | Self::NotInitialized => ErrorClass::Lifecycle,
            Self::HostMapping { .. } => ErrorClass::Host,
        }
    }

    /// Errors that indicate host/guest pointer confusion rather than a guest
    /// runtime condition. Callers abort the current operation on these.
    #[must_use]
    pub const fn is_fatal(&self) -> bool {
        matches!(self, Self::ForeignPointer { .. })
    }
}

impl From<(u64, io::Error)> for VmError {
    fn from((len, err): (u64, io::Error)) -> Self {
        Self::HostMapping {
            len,
            kind: err.kind(),
        }
    }
}
