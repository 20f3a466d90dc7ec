//! Named memory locations and their fixed address layout.

/// Number of named memory locations.
pub const LOCATION_COUNT: usize = 4;

/// Named, fixed guest memory area.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Deserialize, serde::Serialize))]
pub enum Location {
    /// Main memory holding executable images and heaps.
    Main,
    /// Area reserved for user-space mappings.
    UserSpace,
    /// Video memory window.
    Video,
    /// Thread stacks.
    Stack,
}

impl Location {
    /// All named locations in slot order.
    pub const ALL: [Self; LOCATION_COUNT] = [Self::Main, Self::UserSpace, Self::Video, Self::Stack];

    /// Returns the registry slot index for this location.
    #[must_use]
    pub const fn index(self) -> usize {
        self as usize
    }
}

/// Address bounds governing one named location.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Deserialize, serde::Serialize))]
pub struct LocationDescriptor {
    /// Location classification.
    pub location: Location,
    /// Inclusive start address.
    pub start: u32,
    /// Length in bytes.
    pub size: u32,
}

impl LocationDescriptor {
    /// Creates a descriptor.
    #[must_use]
    pub const fn new(location: Location, start: u32, size: u32) -> Self {
        Self {
            location,
            start,
            size,
        }
    }

    /// Exclusive end address as a 64-bit value.
    #[must_use]
    pub const fn end(self) -> u64 {
        self.start as u64 + self.size as u64
    }

    /// Returns `true` when `addr` lies inside this location.
    #[must_use]
    pub const fn contains(self, addr: u32) -> bool {
        addr >= self.start && (addr as u64) < self.end()
    }

    /// Returns `true` when `[start, start+size)` intersects this location.
    #[must_use]
    pub const fn overlaps(self, start: u32, size: u32) -> bool {
        (start as u64) < self.end() && (self.start as u64) < start as u64 + size as u64
    }
}

/// Layout of the full 4 GiB address space.
pub const DEFAULT_LOCATIONS: [LocationDescriptor; LOCATION_COUNT] = [
    LocationDescriptor::new(Location::Main, 0x0001_0000, 0x1FFF_0000),
    LocationDescriptor::new(Location::UserSpace, 0x2000_0000, 0x1000_0000),
    LocationDescriptor::new(Location::Video, 0xC000_0000, 0x1000_0000),
    LocationDescriptor::new(Location::Stack, 0xD000_0000, 0x1000_0000),
];

/// Layout of the reduced 256 MiB address space.
///
/// `0x0400_0000..0x0800_0000` and the tails after video and stack stay free
/// for explicit mappings.
pub const COMPACT_LOCATIONS: [LocationDescriptor; LOCATION_COUNT] = [
    LocationDescriptor::new(Location::Main, 0x0001_0000, 0x01FF_0000),
    LocationDescriptor::new(Location::UserSpace, 0x0200_0000, 0x0200_0000),
    LocationDescriptor::new(Location::Video, 0x0800_0000, 0x0200_0000),
    LocationDescriptor::new(Location::Stack, 0x0C00_0000, 0x0200_0000),
];

const _: () = assert!(
    layout_problem(&DEFAULT_LOCATIONS, super::FULL_ADDRESS_SPACE).is_none(),
    "invalid default location layout"
);
const _: () = assert!(
    layout_problem(&COMPACT_LOCATIONS, super::COMPACT_ADDRESS_SPACE).is_none(),
    "invalid compact location layout"
);

/// Returns `Some(message)` when `layout` is not a valid layout for `space`.
pub(crate) const fn layout_problem(
    layout: &[LocationDescriptor; LOCATION_COUNT],
    space: u64,
) -> Option<&'static str> {
    let mut index = 0;
    while index < LOCATION_COUNT {
        let descriptor = layout[index];
        if descriptor.location as usize != index {
            return Some("locations must be listed in slot order");
        }
        if descriptor.size == 0 {
            return Some("location cannot be empty");
        }
        if descriptor.start % super::PAGE_SIZE != 0 || descriptor.size % super::PAGE_SIZE != 0 {
            return Some("location bounds must be page-aligned");
        }
        if descriptor.end() > space {
            return Some("location must fit in the address space");
        }
        if index > 0 && layout[index - 1].end() > descriptor.start as u64 {
            return Some("locations must be ascending and disjoint");
        }
        index += 1;
    }
    None
}

/// Decodes a guest address into the named location that governs it.
#[must_use]
pub fn decode_location(
    layout: &[LocationDescriptor; LOCATION_COUNT],
    addr: u32,
) -> Option<Location> {
    layout
        .iter()
        .find(|descriptor| descriptor.contains(addr))
        .map(|descriptor| descriptor.location)
}
