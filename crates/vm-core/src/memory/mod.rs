//! Guest address primitives, fixed location layout and host backing store.

/// Range and alignment validation helpers.
pub mod access;
/// Host backing mapping and guest/host address translation.
pub mod host;
/// Named memory locations and their fixed layout.
pub mod location;

pub use access::{align_up, page_span, validate_alignment, validate_page_range, validate_range};
pub use host::HostMemory;
pub use location::{
    decode_location, Location, LocationDescriptor, COMPACT_LOCATIONS, DEFAULT_LOCATIONS,
    LOCATION_COUNT,
};

/// Size in bytes of one guest page.
pub const PAGE_SIZE: u32 = 4096;
/// `log2(PAGE_SIZE)`.
pub const PAGE_SHIFT: u32 = 12;
/// Size in bytes of one reservation lock line.
pub const LOCK_LINE_SIZE: u32 = 128;
/// Number of lock lines in one page.
pub const LOCK_LINES_PER_PAGE: usize = (PAGE_SIZE / LOCK_LINE_SIZE) as usize;
/// Size in bytes of the full 32-bit guest address space (4 GiB).
pub const FULL_ADDRESS_SPACE: u64 = 1 << 32;
/// Size in bytes of the reduced address space used by [`crate::VmConfig::compact`].
pub const COMPACT_ADDRESS_SPACE: u64 = 0x1000_0000;

/// Opaque 32-bit guest address.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
#[cfg_attr(feature = "serde", derive(serde::Deserialize, serde::Serialize))]
pub struct GuestAddr(pub u32);

impl GuestAddr {
    /// The null guest address.
    pub const NULL: Self = Self(0);

    /// Returns the raw address value.
    #[must_use]
    pub const fn get(self) -> u32 {
        self.0
    }

    /// Returns the index of the page containing this address.
    #[must_use]
    pub const fn page_index(self) -> usize {
        (self.0 >> PAGE_SHIFT) as usize
    }

    /// Returns the lock-line index of this address within its page.
    #[must_use]
    pub const fn line_index(self) -> usize {
        ((self.0 & (PAGE_SIZE - 1)) / LOCK_LINE_SIZE) as usize
    }

    /// Returns the start address of the lock line containing this address.
    #[must_use]
    pub const fn line_base(self) -> Self {
        Self(self.0 & !(LOCK_LINE_SIZE - 1))
    }

    /// Returns `true` when the address is page-aligned.
    #[must_use]
    pub const fn is_page_aligned(self) -> bool {
        self.0 % PAGE_SIZE == 0
    }
}

impl From<u32> for GuestAddr {
    fn from(addr: u32) -> Self {
        Self(addr)
    }
}

impl From<GuestAddr> for u32 {
    fn from(addr: GuestAddr) -> Self {
        addr.0
    }
}

impl std::fmt::Display for GuestAddr {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:#010x}", self.0)
    }
}
