use bitflags::bitflags;

bitflags! {
    /// Per-page permission and state bits.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    #[cfg_attr(feature = "serde", derive(serde::Deserialize, serde::Serialize))]
    pub struct PageFlags: u8 {
        /// Guest may read the page.
        const READABLE = 1 << 0;
        /// Guest may write the page.
        const WRITABLE = 1 << 1;
        /// Guest may execute from the page.
        const EXECUTABLE = 1 << 2;
        /// Accesses raise a fault notification.
        const FAULT_NOTIFICATION = 1 << 3;
        /// Reservations are disabled (device-mapped memory).
        const NO_RESERVATIONS = 1 << 4;
        /// Page belongs to a 64 KiB aggregate.
        const PAGE_64K = 1 << 5;
        /// Page belongs to a 1 MiB aggregate.
        const PAGE_1M = 1 << 6;
        /// Page is backed by an allocation.
        const ALLOCATED = 1 << 7;

        /// Default accessibility of freshly allocated memory.
        const READ_WRITE = Self::READABLE.bits() | Self::WRITABLE.bits();
    }
}

bitflags! {
    /// Creation-time options of a memory block.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    #[cfg_attr(feature = "serde", derive(serde::Deserialize, serde::Serialize))]
    pub struct BlockFlags: u64 {
        /// Fixed-address allocations are 64 KiB aggregates.
        const PAGE_64K = 0x100;
        /// Fixed-address allocations are 1 MiB aggregates.
        const PAGE_1M = 0x200;
    }
}

impl BlockFlags {
    /// Page aggregate bits applied to fixed-address allocations in the block.
    #[must_use]
    pub const fn page_size_flags(self) -> PageFlags {
        if self.contains(Self::PAGE_1M) {
            PageFlags::PAGE_1M
        } else if self.contains(Self::PAGE_64K) {
            PageFlags::PAGE_64K
        } else {
            PageFlags::empty()
        }
    }
}

impl PageFlags {
    /// Page aggregate bits implied by an allocation alignment.
    #[must_use]
    pub const fn for_alignment(align: u32) -> Self {
        if align >= 0x10_0000 {
            Self::PAGE_1M
        } else if align >= 0x1_0000 {
            Self::PAGE_64K
        } else {
            Self::empty()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::{BlockFlags, PageFlags};

    #[test]
    fn bit_layout_is_stable() {
        assert_eq!(PageFlags::READABLE.bits(), 0x01);
        assert_eq!(PageFlags::NO_RESERVATIONS.bits(), 0x10);
        assert_eq!(PageFlags::ALLOCATED.bits(), 0x80);
        assert_eq!(PageFlags::READ_WRITE.bits(), 0x03);
    }

    #[test]
    fn aggregate_bits_follow_alignment() {
        assert_eq!(PageFlags::for_alignment(0x1000), PageFlags::empty());
        assert_eq!(PageFlags::for_alignment(0x1_0000), PageFlags::PAGE_64K);
        assert_eq!(PageFlags::for_alignment(0x10_0000), PageFlags::PAGE_1M);
        assert_eq!(
            (BlockFlags::PAGE_64K | BlockFlags::PAGE_1M).page_size_flags(),
            PageFlags::PAGE_1M
        );
        assert_eq!(BlockFlags::empty().page_size_flags(), PageFlags::empty());
    }
}
