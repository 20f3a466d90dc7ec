//! Page table: per-page permission flags and per-line reservation stamps.

/// Page and block flag sets.
pub mod flags;
/// Lazily created reservation counters and the stamp clock.
pub mod reservation;

use std::sync::atomic::Ordering;

pub use flags::{BlockFlags, PageFlags};
pub use reservation::ReservationLines;

use crate::memory::{page_span, validate_page_range, validate_range, GuestAddr, PAGE_SIZE};
use crate::{VmResult, WriterLock};
use reservation::{read_stamp, LineLock, Page, StampClock};

/// Flags and reservation counters for every page of the guest address space.
#[derive(Debug)]
pub struct PageTable {
    pages: Box<[Page]>,
    space: u64,
    clock: StampClock,
}

impl PageTable {
    /// Creates a table with every page unallocated and no reservation arrays.
    ///
    /// `space` is rounded down to whole pages.
    #[must_use]
    pub fn new(space: u64) -> Self {
        let count = usize::try_from(space / u64::from(PAGE_SIZE)).unwrap_or(0);
        let pages = (0..count).map(|_| Page::default()).collect();
        Self {
            pages,
            space: count as u64 * u64::from(PAGE_SIZE),
            clock: StampClock::new(),
        }
    }

    /// Number of pages covered by the table.
    #[must_use]
    pub fn page_count(&self) -> usize {
        self.pages.len()
    }

    /// Size in bytes of the covered address space.
    #[must_use]
    pub const fn space(&self) -> u64 {
        self.space
    }

    fn page(&self, addr: GuestAddr) -> Option<&Page> {
        self.pages.get(addr.page_index())
    }

    /// Current flags of the page containing `addr` (empty outside the space).
    #[must_use]
    pub fn flags(&self, addr: GuestAddr) -> PageFlags {
        self.page(addr).map_or(PageFlags::empty(), |page| {
            PageFlags::from_bits_retain(page.flags.load(Ordering::Acquire))
        })
    }

    /// Returns `true` when every page touched by `[addr, addr+size)` has all
    /// `required` bits set.
    ///
    /// Lock-free. Empty and out-of-range queries are `false`.
    #[must_use]
    pub fn check_range(&self, addr: GuestAddr, size: u64, required: PageFlags) -> bool {
        if size == 0 || validate_range(self.space, addr.0, size).is_err() {
            return false;
        }
        self.pages[page_span(addr.0, size)].iter().all(|page| {
            PageFlags::from_bits_retain(page.flags.load(Ordering::Acquire)).contains(required)
        })
    }

    /// Returns `true` when no page of `[addr, addr+size)` carries any flag.
    pub(crate) fn is_free(&self, addr: GuestAddr, size: u64) -> bool {
        validate_range(self.space, addr.0, size).is_ok()
            && self.pages[page_span(addr.0, size)]
                .iter()
                .all(|page| page.flags.load(Ordering::Acquire) == 0)
    }

    /// All-or-nothing permission update over a page-aligned range.
    ///
    /// Every page must be allocated and carry `test`; otherwise nothing changes
    /// and `Ok(false)` is returned. Bits in both `set` and `clear` are toggled.
    ///
    /// # Errors
    ///
    /// Returns an argument error for empty, unaligned or out-of-range requests.
    pub fn protect(
        &self,
        _lock: &WriterLock<'_>,
        addr: GuestAddr,
        size: u32,
        test: PageFlags,
        set: PageFlags,
        clear: PageFlags,
    ) -> VmResult<bool> {
        validate_page_range(self.space, addr.0, size)?;
        let test = test | PageFlags::ALLOCATED;
        let pages = &self.pages[page_span(addr.0, u64::from(size))];

        let passes = pages.iter().all(|page| {
            PageFlags::from_bits_retain(page.flags.load(Ordering::Acquire)).contains(test)
        });
        if !passes {
            return Ok(false);
        }

        let toggle = set & clear;
        let set = set - toggle;
        let clear = clear - toggle;
        if toggle.is_empty() && set.is_empty() && clear.is_empty() {
            return Ok(true);
        }

        for page in pages {
            let current = PageFlags::from_bits_retain(page.flags.load(Ordering::Acquire));
            let updated = ((current | set) - clear) ^ toggle;
            page.flags.store(updated.bits(), Ordering::Release);
        }
        log::debug!(
            "protect {addr}+{size:#x}: set {set:?} clear {clear:?} toggle {toggle:?}"
        );
        Ok(true)
    }

    /// Marks a free page-aligned range as allocated with `flags`.
    pub(crate) fn map_pages(
        &self,
        _lock: &WriterLock<'_>,
        addr: GuestAddr,
        size: u32,
        flags: PageFlags,
    ) {
        let flags = flags | PageFlags::ALLOCATED;
        for page in &self.pages[page_span(addr.0, u64::from(size))] {
            debug_assert_eq!(page.flags.load(Ordering::Relaxed), 0, "page already mapped");
            page.flags.store(flags.bits(), Ordering::Release);
        }
    }

    /// Clears every flag of a page-aligned range.
    pub(crate) fn unmap_pages(&self, _lock: &WriterLock<'_>, addr: GuestAddr, size: u32) {
        for page in &self.pages[page_span(addr.0, u64::from(size))] {
            debug_assert_ne!(page.flags.load(Ordering::Relaxed), 0, "page not mapped");
            page.flags.store(0, Ordering::Release);
        }
    }

    /// Reads the reservation stamp of the lock line containing `addr`.
    ///
    /// Lock-free; a line that was never updated reads as `0`. Waits while a
    /// store-conditional owns the line.
    ///
    /// # Errors
    ///
    /// Returns [`crate::VmError::OutOfRange`] outside the address space.
    pub fn reservation_acquire(&self, addr: GuestAddr) -> VmResult<u64> {
        let page = self.checked_page(addr)?;
        Ok(page
            .lines()
            .map_or(0, |lines| read_stamp(&lines[addr.line_index()])))
    }

    /// Publishes a fresh stamp for the lock line containing `addr`.
    ///
    /// Returns the new stamp, which is strictly greater than the previous one.
    ///
    /// # Errors
    ///
    /// Returns [`crate::VmError::OutOfRange`] outside the address space.
    pub fn reservation_update(&self, addr: GuestAddr) -> VmResult<u64> {
        let page = self.checked_page(addr)?;
        Ok(self.clock.publish(&page.lines_or_init()[addr.line_index()]))
    }

    /// Takes ownership of the lock line containing `addr` if its stamp still
    /// equals `stamp`.
    ///
    /// Returns `Ok(None)` when the line was updated or is owned by another
    /// store-conditional.
    ///
    /// # Errors
    ///
    /// Returns [`crate::VmError::OutOfRange`] outside the address space.
    pub(crate) fn reservation_lock(
        &self,
        addr: GuestAddr,
        stamp: u64,
    ) -> VmResult<Option<LineLock<'_>>> {
        let page = self.checked_page(addr)?;
        let line = &page.lines_or_init()[addr.line_index()];
        Ok(LineLock::try_lock(line, &self.clock, stamp))
    }

    /// Returns `true` when the page containing `addr` has a counter array.
    #[must_use]
    pub fn has_reservations(&self, addr: GuestAddr) -> bool {
        self.page(addr).is_some_and(Page::has_lines)
    }

    fn checked_page(&self, addr: GuestAddr) -> VmResult<&Page> {
        validate_range(self.space, addr.0, 1)?;
        Ok(&self.pages[addr.page_index()])
    }
}

#[cfg(test)]
mod tests {
    use super::{PageFlags, PageTable};
    use crate::{Gate, GuestAddr, VmError};

    const SPACE: u64 = 0x100_0000;

    #[test]
    fn new_table_has_no_flags_and_no_arrays() {
        let table = PageTable::new(SPACE);
        assert_eq!(table.page_count(), 0x1000);
        assert_eq!(table.flags(GuestAddr(0x5000)), PageFlags::empty());
        assert!(!table.has_reservations(GuestAddr(0x5000)));
        assert!(!table.check_range(GuestAddr(0x5000), 1, PageFlags::ALLOCATED));
    }

    #[test]
    fn check_range_spans_every_touched_page() {
        let gate = Gate::new();
        let table = PageTable::new(SPACE);
        let lock = gate.writer_lock();
        table.map_pages(&lock, GuestAddr(0x1000), 0x2000, PageFlags::READ_WRITE);

        assert!(table.check_range(GuestAddr(0x1000), 0x2000, PageFlags::ALLOCATED));
        assert!(table.check_range(GuestAddr(0x2FFF), 1, PageFlags::READ_WRITE));
        assert!(!table.check_range(GuestAddr(0x2FFF), 2, PageFlags::ALLOCATED));
        assert!(!table.check_range(GuestAddr(0x1000), 0, PageFlags::ALLOCATED));
        assert!(!table.check_range(GuestAddr(0x1000), 0x1000, PageFlags::EXECUTABLE));
        assert!(!table.check_range(GuestAddr(0xFF_F000), 0x2000, PageFlags::empty()));
    }

    #[test]
    fn protect_is_all_or_nothing() {
        let gate = Gate::new();
        let table = PageTable::new(SPACE);
        let lock = gate.writer_lock();
        table.map_pages(&lock, GuestAddr(0x1000), 0x1000, PageFlags::READ_WRITE);
        table.map_pages(&lock, GuestAddr(0x2000), 0x1000, PageFlags::READABLE);

        let applied = table.protect(
            &lock,
            GuestAddr(0x1000),
            0x2000,
            PageFlags::WRITABLE,
            PageFlags::EXECUTABLE,
            PageFlags::empty(),
        );
        assert_eq!(applied, Ok(false));
        assert_eq!(
            table.flags(GuestAddr(0x1000)),
            PageFlags::READ_WRITE | PageFlags::ALLOCATED
        );
        assert_eq!(
            table.flags(GuestAddr(0x2000)),
            PageFlags::READABLE | PageFlags::ALLOCATED
        );
    }

    #[test]
    fn protect_sets_clears_and_toggles() {
        let gate = Gate::new();
        let table = PageTable::new(SPACE);
        let lock = gate.writer_lock();
        table.map_pages(&lock, GuestAddr(0x4000), 0x2000, PageFlags::READ_WRITE);

        let applied = table.protect(
            &lock,
            GuestAddr(0x4000),
            0x2000,
            PageFlags::READABLE,
            PageFlags::EXECUTABLE | PageFlags::NO_RESERVATIONS,
            PageFlags::WRITABLE | PageFlags::NO_RESERVATIONS,
        );
        assert_eq!(applied, Ok(true));
        assert_eq!(
            table.flags(GuestAddr(0x5000)),
            PageFlags::READABLE
                | PageFlags::EXECUTABLE
                | PageFlags::NO_RESERVATIONS
                | PageFlags::ALLOCATED
        );
    }

    #[test]
    fn protect_requires_allocated_pages_and_aligned_ranges() {
        let gate = Gate::new();
        let table = PageTable::new(SPACE);
        let lock = gate.writer_lock();
        assert_eq!(
            table.protect(
                &lock,
                GuestAddr(0x1000),
                0x1000,
                PageFlags::empty(),
                PageFlags::READABLE,
                PageFlags::empty()
            ),
            Ok(false)
        );
        assert_eq!(
            table.protect(
                &lock,
                GuestAddr(0x1000),
                0x10,
                PageFlags::empty(),
                PageFlags::READABLE,
                PageFlags::empty()
            ),
            Err(VmError::InvalidSize { size: 0x10 })
        );
    }

    #[test]
    fn unmap_clears_all_flags() {
        let gate = Gate::new();
        let table = PageTable::new(SPACE);
        let lock = gate.writer_lock();
        table.map_pages(&lock, GuestAddr(0x8000), 0x1000, PageFlags::READ_WRITE);
        assert!(!table.is_free(GuestAddr(0x8000), 0x1000));
        table.unmap_pages(&lock, GuestAddr(0x8000), 0x1000);
        assert!(table.is_free(GuestAddr(0x8000), 0x1000));
    }

    #[test]
    fn reservation_update_is_line_local() {
        let table = PageTable::new(SPACE);
        assert_eq!(table.reservation_acquire(GuestAddr(0x3000)), Ok(0));

        let stamp = table
            .reservation_update(GuestAddr(0x3010))
            .expect("in range");
        assert!(stamp > 0);
        assert_eq!(table.reservation_acquire(GuestAddr(0x307F)), Ok(stamp));
        assert_eq!(table.reservation_acquire(GuestAddr(0x3080)), Ok(0));
        assert!(table.has_reservations(GuestAddr(0x3FFF)));

        let next = table
            .reservation_update(GuestAddr(0x3000))
            .expect("in range");
        assert!(next > stamp);
    }

    #[test]
    fn reservations_outside_the_space_are_rejected() {
        let table = PageTable::new(SPACE);
        let outside = GuestAddr(u32::try_from(SPACE).expect("fits"));
        assert!(matches!(
            table.reservation_acquire(outside),
            Err(VmError::OutOfRange { .. })
        ));
        assert!(table.reservation_update(outside).is_err());
    }
}
