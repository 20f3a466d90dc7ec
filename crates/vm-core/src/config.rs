use crate::memory::location::layout_problem;
use crate::memory::{
    LocationDescriptor, COMPACT_ADDRESS_SPACE, COMPACT_LOCATIONS, DEFAULT_LOCATIONS,
    FULL_ADDRESS_SPACE, LOCATION_COUNT, PAGE_SIZE,
};
use crate::{Location, PageFlags, VmError, VmResult};

/// Session configuration supplied to [`crate::Vm::new`] and [`crate::global::init`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Deserialize, serde::Serialize))]
pub struct VmConfig {
    /// Size in bytes of the emulated guest address space.
    pub address_space_size: u64,
    /// Bounds of the named memory locations, in slot order.
    pub locations: [LocationDescriptor; LOCATION_COUNT],
    /// Page flags applied to freshly allocated memory (besides `ALLOCATED`).
    pub default_page_flags: PageFlags,
}

impl Default for VmConfig {
    fn default() -> Self {
        Self {
            address_space_size: FULL_ADDRESS_SPACE,
            locations: DEFAULT_LOCATIONS,
            default_page_flags: PageFlags::READ_WRITE,
        }
    }
}

impl VmConfig {
    /// A 256 MiB address space with proportionally smaller locations.
    #[must_use]
    pub fn compact() -> Self {
        Self {
            address_space_size: COMPACT_ADDRESS_SPACE,
            locations: COMPACT_LOCATIONS,
            ..Self::default()
        }
    }

    /// Returns the descriptor of `location`.
    #[must_use]
    pub const fn descriptor(&self, location: Location) -> LocationDescriptor {
        self.locations[location.index()]
    }

    /// Checks that the configuration describes a usable address space.
    ///
    /// # Errors
    ///
    /// Returns [`VmError::InvalidConfig`] naming the first problem found.
    pub fn validate(&self) -> VmResult<()> {
        let reason = if self.address_space_size == 0 {
            Some("address space cannot be empty")
        } else if self.address_space_size > FULL_ADDRESS_SPACE {
            Some("address space cannot exceed 4 GiB")
        } else if self.address_space_size % u64::from(PAGE_SIZE) != 0 {
            Some("address space size must be a whole number of pages")
        } else if self.default_page_flags.contains(PageFlags::ALLOCATED) {
            Some("default page flags cannot include ALLOCATED")
        } else {
            layout_problem(&self.locations, self.address_space_size)
        };
        reason.map_or(Ok(()), |reason| Err(VmError::InvalidConfig { reason }))
    }
}
