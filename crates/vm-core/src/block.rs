//! Interval allocator over one mapped area of the guest address space.
//!
//! A block owns the ordered set of its allocations (start to length) and an
//! optional 32-bit tag per allocation. Page flags and allocation records always
//! change together under the writer lock: an allocation is recorded before its
//! pages are marked, and pages are cleared before the record disappears from
//! readers' view.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use crate::memory::{align_up, validate_alignment, PAGE_SIZE};
use crate::space::AddressSpace;
use crate::{BlockFlags, GuestAddr, PageFlags, VmError, VmResult, WriterLock};

/// Result of releasing one allocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Deallocation {
    /// Size in bytes that was released.
    pub size: u32,
    /// Supplementary tag that was recorded for the allocation.
    pub sup: Option<u32>,
}

/// One live allocation inside a block.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Allocation {
    /// Start address.
    pub addr: GuestAddr,
    /// Length in bytes (whole pages).
    pub size: u32,
    /// Supplementary tag, when one was recorded.
    pub sup: Option<u32>,
}

#[derive(Debug, Default)]
struct BlockState {
    ranges: BTreeMap<u32, u32>,
    sup: HashMap<u32, u32>,
    unmapped: bool,
}

/// Allocator over `[addr, addr+size)`.
#[derive(Debug)]
pub struct Block {
    addr: GuestAddr,
    size: u32,
    flags: BlockFlags,
    space: Arc<AddressSpace>,
    state: Mutex<BlockState>,
}

impl Block {
    pub(crate) fn new(
        space: Arc<AddressSpace>,
        addr: GuestAddr,
        size: u32,
        flags: BlockFlags,
    ) -> Self {
        Self {
            addr,
            size,
            flags,
            space,
            state: Mutex::new(BlockState::default()),
        }
    }

    /// First address of the block.
    #[must_use]
    pub const fn addr(&self) -> GuestAddr {
        self.addr
    }

    /// Size of the block in bytes.
    #[must_use]
    pub const fn size(&self) -> u32 {
        self.size
    }

    /// Creation flags.
    #[must_use]
    pub const fn flags(&self) -> BlockFlags {
        self.flags
    }

    /// Exclusive end address.
    #[must_use]
    pub const fn end(&self) -> u64 {
        self.addr.0 as u64 + self.size as u64
    }

    /// Returns `true` when `addr` lies inside the block.
    #[must_use]
    pub const fn contains(&self, addr: GuestAddr) -> bool {
        addr.0 >= self.addr.0 && (addr.0 as u64) < self.end()
    }

    pub(crate) const fn overlaps(&self, addr: u32, size: u32) -> bool {
        (addr as u64) < self.end() && (self.addr.0 as u64) < addr as u64 + size as u64
    }

    fn state(&self) -> MutexGuard<'_, BlockState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn ensure_mapped(&self, state: &BlockState) -> VmResult<()> {
        if state.unmapped {
            Err(VmError::BlockUnmapped { addr: self.addr.0 })
        } else {
            Ok(())
        }
    }

    /// Returns `true` once the block has been removed from its registry.
    #[must_use]
    pub fn is_unmapped(&self) -> bool {
        self.state().unmapped
    }

    fn page_rounded(&self, size: u32) -> VmResult<u32> {
        if size == 0 {
            return Err(VmError::InvalidSize { size });
        }
        let rounded = align_up(u64::from(size), u64::from(PAGE_SIZE));
        match u32::try_from(rounded) {
            Ok(rounded) if rounded <= self.size => Ok(rounded),
            _ => Err(VmError::OutOfMemory {
                size: u32::try_from(rounded).unwrap_or(u32::MAX),
            }),
        }
    }

    /// Allocates `size` bytes (rounded up to pages) at the lowest free
    /// `align`-aligned address.
    ///
    /// `init` is copied to the start of the allocation; `sup` is stored as its
    /// tag.
    ///
    /// # Errors
    ///
    /// Returns an argument error for a zero size, a bad alignment or an
    /// oversized `init`, and [`VmError::OutOfMemory`] when no gap fits.
    pub fn alloc(
        &self,
        size: u32,
        align: u32,
        init: Option<&[u8]>,
        sup: Option<u32>,
    ) -> VmResult<GuestAddr> {
        let lock = self.space.gate.writer_lock();
        self.alloc_locked(&lock, size, align, init, sup)
    }

    pub(crate) fn alloc_locked(
        &self,
        lock: &WriterLock<'_>,
        size: u32,
        align: u32,
        init: Option<&[u8]>,
        sup: Option<u32>,
    ) -> VmResult<GuestAddr> {
        validate_alignment(align)?;
        let size = self.page_rounded(size)?;
        check_init(init, size)?;

        let mut state = self.state();
        self.ensure_mapped(&state)?;
        let addr = self
            .find_gap(&state, size, align)
            .ok_or(VmError::OutOfMemory { size })?;
        let flags = self.space.default_flags | PageFlags::for_alignment(align);
        self.reserve(lock, &mut state, addr, size, flags, init, sup)
    }

    fn find_gap(&self, state: &BlockState, size: u32, align: u32) -> Option<GuestAddr> {
        let align = u64::from(align);
        let size = u64::from(size);
        let mut candidate = align_up(u64::from(self.addr.0), align);
        for (&start, &len) in &state.ranges {
            if candidate + size <= u64::from(start) {
                break;
            }
            candidate = candidate.max(align_up(u64::from(start) + u64::from(len), align));
        }
        if candidate + size > self.end() {
            return None;
        }
        u32::try_from(candidate).ok().map(GuestAddr)
    }

    /// Allocates `size` bytes (rounded up to pages) at the fixed address `addr`.
    ///
    /// # Errors
    ///
    /// Returns [`VmError::Misaligned`] for an unaligned address,
    /// [`VmError::OutOfRange`] when the range leaves the block and
    /// [`VmError::Occupied`] when it overlaps an allocation.
    pub fn falloc(
        &self,
        addr: GuestAddr,
        size: u32,
        init: Option<&[u8]>,
        sup: Option<u32>,
    ) -> VmResult<GuestAddr> {
        let lock = self.space.gate.writer_lock();
        self.falloc_locked(&lock, addr, size, init, sup)
    }

    pub(crate) fn falloc_locked(
        &self,
        lock: &WriterLock<'_>,
        addr: GuestAddr,
        size: u32,
        init: Option<&[u8]>,
        sup: Option<u32>,
    ) -> VmResult<GuestAddr> {
        let size = self.page_rounded(size)?;
        if !addr.is_page_aligned() {
            return Err(VmError::Misaligned {
                addr: addr.0,
                align: PAGE_SIZE,
            });
        }
        if addr.0 < self.addr.0 || u64::from(addr.0) + u64::from(size) > self.end() {
            return Err(VmError::OutOfRange {
                addr: addr.0,
                size: u64::from(size),
            });
        }
        check_init(init, size)?;

        let mut state = self.state();
        self.ensure_mapped(&state)?;
        let end = u64::from(addr.0) + u64::from(size);
        let occupied = state
            .ranges
            .range(..=addr.0.saturating_add(size - 1))
            .next_back()
            .is_some_and(|(&start, &len)| {
                u64::from(start) + u64::from(len) > u64::from(addr.0) && u64::from(start) < end
            });
        if occupied {
            return Err(VmError::Occupied {
                addr: addr.0,
                size,
            });
        }
        let flags = self.space.default_flags | self.flags.page_size_flags();
        self.reserve(lock, &mut state, addr, size, flags, init, sup)
    }

    #[allow(clippy::too_many_arguments)]
    fn reserve(
        &self,
        lock: &WriterLock<'_>,
        state: &mut BlockState,
        addr: GuestAddr,
        size: u32,
        flags: PageFlags,
        init: Option<&[u8]>,
        sup: Option<u32>,
    ) -> VmResult<GuestAddr> {
        state.ranges.insert(addr.0, size);
        self.space.commit(lock, addr, size, flags);
        if let Some(init) = init {
            if let Err(err) = self.space.host.write_bytes(addr, init) {
                state.ranges.remove(&addr.0);
                self.space.decommit(lock, addr, size)?;
                return Err(err);
            }
        }
        if let Some(sup) = sup {
            state.sup.insert(addr.0, sup);
        }
        log::debug!("allocated {addr}+{size:#x} in block {}", self.addr);
        Ok(addr)
    }

    /// Releases the allocation starting exactly at `addr`.
    ///
    /// When `data_out` is given, the allocation's bytes are copied into it
    /// (up to its length) before the pages are unmapped and zeroed.
    ///
    /// # Errors
    ///
    /// Returns [`VmError::NotAllocated`] when no allocation starts at `addr`.
    pub fn dealloc(
        &self,
        addr: GuestAddr,
        data_out: Option<&mut [u8]>,
    ) -> VmResult<Deallocation> {
        let lock = self.space.gate.writer_lock();
        self.dealloc_locked(&lock, addr, data_out)
    }

    pub(crate) fn dealloc_locked(
        &self,
        lock: &WriterLock<'_>,
        addr: GuestAddr,
        data_out: Option<&mut [u8]>,
    ) -> VmResult<Deallocation> {
        let mut state = self.state();
        self.ensure_mapped(&state)?;
        let size = state
            .ranges
            .get(&addr.0)
            .copied()
            .ok_or(VmError::NotAllocated { addr: addr.0 })?;

        if let Some(out) = data_out {
            let len = out.len().min(size as usize);
            self.space.host.read_bytes(addr, &mut out[..len])?;
        }

        state.ranges.remove(&addr.0);
        let sup = state.sup.remove(&addr.0);
        self.space.decommit(lock, addr, size)?;
        log::debug!("released {addr}+{size:#x} in block {}", self.addr);
        Ok(Deallocation { size, sup })
    }

    /// Total bytes currently allocated, read under shared access.
    #[must_use]
    pub fn used(&self) -> u32 {
        let _shared = self.space.gate.reader_lock();
        self.used_unguarded()
    }

    /// Same as [`Self::used`] for callers that already hold the writer lock.
    pub(crate) fn used_locked(&self, _lock: &WriterLock<'_>) -> u32 {
        self.used_unguarded()
    }

    fn used_unguarded(&self) -> u32 {
        self.state().ranges.values().sum()
    }

    /// Supplementary tag of the allocation starting at `addr`.
    #[must_use]
    pub fn sup(&self, addr: GuestAddr) -> Option<u32> {
        self.state().sup.get(&addr.0).copied()
    }

    /// Snapshot of all live allocations in address order.
    #[must_use]
    pub fn allocations(&self) -> Vec<Allocation> {
        let _shared = self.space.gate.reader_lock();
        let state = self.state();
        state
            .ranges
            .iter()
            .map(|(&addr, &size)| Allocation {
                addr: GuestAddr(addr),
                size,
                sup: state.sup.get(&addr).copied(),
            })
            .collect()
    }

    pub(crate) fn find_tagged_locked(
        &self,
        _lock: &WriterLock<'_>,
        tag: u32,
    ) -> Option<(GuestAddr, u32)> {
        let state = self.state();
        state
            .sup
            .iter()
            .filter(|(_, sup)| **sup == tag)
            .filter_map(|(&addr, _)| state.ranges.get(&addr).map(|&size| (GuestAddr(addr), size)))
            .min_by_key(|(addr, _)| *addr)
    }

    /// Releases every allocation and marks the block unmapped.
    ///
    /// Returns the number of allocations that were released.
    pub(crate) fn release_all(&self, lock: &WriterLock<'_>) -> VmResult<usize> {
        let mut state = self.state();
        state.unmapped = true;
        state.sup.clear();
        let ranges = std::mem::take(&mut state.ranges);
        for (&addr, &size) in &ranges {
            self.space.decommit(lock, GuestAddr(addr), size)?;
        }
        if !ranges.is_empty() {
            log::debug!(
                "released {} allocation(s) of unmapped block {}",
                ranges.len(),
                self.addr
            );
        }
        Ok(ranges.len())
    }
}

fn check_init(init: Option<&[u8]>, size: u32) -> VmResult<()> {
    match init {
        Some(init) if init.len() as u64 > u64::from(size) => Err(VmError::InvalidSize {
            size: u32::try_from(init.len()).unwrap_or(u32::MAX),
        }),
        _ => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use rstest::rstest;

    use super::{Allocation, Block, Deallocation};
    use crate::space::AddressSpace;
    use crate::{BlockFlags, GuestAddr, PageFlags, VmConfig, VmError};

    const BASE: u32 = 0x0400_0000;
    const SIZE: u32 = 0x0010_0000;

    fn block(flags: BlockFlags) -> Block {
        let space = Arc::new(AddressSpace::new(&VmConfig::compact()).expect("address space"));
        Block::new(space, GuestAddr(BASE), SIZE, flags)
    }

    fn page_flags(block: &Block, addr: u32) -> PageFlags {
        block.space.pages.flags(GuestAddr(addr))
    }

    #[test]
    fn alloc_is_first_fit_and_page_rounded() {
        let block = block(BlockFlags::empty());
        let first = block.alloc(1, 0x1000, None, None).expect("first");
        let second = block.alloc(0x1800, 0x1000, None, None).expect("second");
        assert_eq!(first, GuestAddr(BASE));
        assert_eq!(second, GuestAddr(BASE + 0x1000));
        assert_eq!(block.used(), 0x3000);

        block.dealloc(first, None).expect("dealloc");
        let third = block.alloc(0x1000, 0x1000, None, None).expect("reuse");
        assert_eq!(third, GuestAddr(BASE));
    }

    #[test]
    fn alloc_marks_pages_with_alignment_flags() {
        let block = block(BlockFlags::empty());
        let addr = block.alloc(0x1000, 0x1_0000, None, None).expect("alloc");
        assert_eq!(addr.0 % 0x1_0000, 0);
        assert_eq!(
            page_flags(&block, addr.0),
            PageFlags::READ_WRITE | PageFlags::PAGE_64K | PageFlags::ALLOCATED
        );
        assert_eq!(page_flags(&block, addr.0 + 0x1000), PageFlags::empty());
    }

    #[test]
    fn alloc_copies_init_data_and_records_tag() {
        let block = block(BlockFlags::empty());
        let addr = block
            .alloc(0x1000, 0x1000, Some(&[1, 2, 3]), Some(0xABCD))
            .expect("alloc");
        assert_eq!(block.space.host.read8(GuestAddr(addr.0 + 2)), Ok(3));
        assert_eq!(block.sup(addr), Some(0xABCD));
        assert_eq!(
            block.allocations(),
            vec![Allocation {
                addr,
                size: 0x1000,
                sup: Some(0xABCD)
            }]
        );
    }

    #[rstest]
    #[case(0, 0x1000, VmError::InvalidSize { size: 0 })]
    #[case(0x1000, 0x1800, VmError::InvalidAlignment { align: 0x1800 })]
    #[case(0x1000, 0x800, VmError::InvalidAlignment { align: 0x800 })]
    #[case(SIZE + 1, 0x1000, VmError::OutOfMemory { size: SIZE + 0x1000 })]
    fn alloc_rejects_bad_arguments(
        #[case] size: u32,
        #[case] align: u32,
        #[case] expected: VmError,
    ) {
        let block = block(BlockFlags::empty());
        assert_eq!(block.alloc(size, align, None, None), Err(expected));
        assert_eq!(block.used(), 0);
    }

    #[test]
    fn alloc_reports_exhaustion() {
        let block = block(BlockFlags::empty());
        block.alloc(SIZE, 0x1000, None, None).expect("whole block");
        assert_eq!(
            block.alloc(0x1000, 0x1000, None, None),
            Err(VmError::OutOfMemory { size: 0x1000 })
        );
    }

    #[test]
    fn falloc_rejects_overlaps_and_out_of_block_ranges() {
        let block = block(BlockFlags::PAGE_64K);
        let addr = GuestAddr(BASE + 0x2000);
        assert_eq!(block.falloc(addr, 0x2000, None, None), Ok(addr));
        assert_eq!(
            page_flags(&block, addr.0),
            PageFlags::READ_WRITE | PageFlags::PAGE_64K | PageFlags::ALLOCATED
        );

        assert_eq!(
            block.falloc(GuestAddr(BASE + 0x1000), 0x2000, None, None),
            Err(VmError::Occupied {
                addr: BASE + 0x1000,
                size: 0x2000
            })
        );
        assert_eq!(
            block.falloc(GuestAddr(BASE + 0x3000), 0x1000, None, None),
            Err(VmError::Occupied {
                addr: BASE + 0x3000,
                size: 0x1000
            })
        );
        assert_eq!(
            block.falloc(GuestAddr(BASE + 0x1000), 0x1000, None, None),
            Ok(GuestAddr(BASE + 0x1000))
        );
        assert_eq!(
            block.falloc(GuestAddr(BASE + SIZE - 0x1000), 0x2000, None, None),
            Err(VmError::OutOfRange {
                addr: BASE + SIZE - 0x1000,
                size: 0x2000
            })
        );
        assert_eq!(
            block.falloc(GuestAddr(BASE + 0x10), 0x1000, None, None),
            Err(VmError::Misaligned {
                addr: BASE + 0x10,
                align: 0x1000
            })
        );
    }

    #[test]
    fn dealloc_copies_out_then_clears_pages() {
        let block = block(BlockFlags::empty());
        let addr = block
            .alloc(0x2000, 0x1000, Some(&[9; 8]), Some(5))
            .expect("alloc");
        let mut out = [0_u8; 4];
        assert_eq!(
            block.dealloc(addr, Some(&mut out)),
            Ok(Deallocation {
                size: 0x2000,
                sup: Some(5)
            })
        );
        assert_eq!(out, [9; 4]);
        assert_eq!(page_flags(&block, addr.0), PageFlags::empty());
        assert_eq!(block.space.host.read8(addr), Ok(0));
        assert_eq!(block.sup(addr), None);
        assert_eq!(
            block.dealloc(addr, None),
            Err(VmError::NotAllocated { addr: addr.0 })
        );
    }

    #[test]
    fn dealloc_requires_exact_start() {
        let block = block(BlockFlags::empty());
        let addr = block.alloc(0x2000, 0x1000, None, None).expect("alloc");
        assert_eq!(
            block.dealloc(GuestAddr(addr.0 + 0x1000), None),
            Err(VmError::NotAllocated {
                addr: addr.0 + 0x1000
            })
        );
        assert_eq!(block.used(), 0x2000);
    }

    #[test]
    fn released_block_refuses_further_work() {
        let block = block(BlockFlags::empty());
        let addr = block.alloc(0x1000, 0x1000, None, None).expect("alloc");
        let lock = block.space.gate.writer_lock();
        assert_eq!(block.release_all(&lock), Ok(1));
        drop(lock);

        assert!(block.is_unmapped());
        assert_eq!(block.used(), 0);
        assert_eq!(page_flags(&block, addr.0), PageFlags::empty());
        assert_eq!(
            block.alloc(0x1000, 0x1000, None, None),
            Err(VmError::BlockUnmapped { addr: BASE })
        );
    }

    #[test]
    fn tagged_lookup_finds_lowest_match() {
        let block = block(BlockFlags::empty());
        block.alloc(0x1000, 0x1000, None, Some(1)).expect("untagged");
        let tagged = block.alloc(0x3000, 0x1000, None, Some(7)).expect("tagged");
        let lock = block.space.gate.writer_lock();
        assert_eq!(block.find_tagged_locked(&lock, 7), Some((tagged, 0x3000)));
        assert_eq!(block.find_tagged_locked(&lock, 8), None);
        assert_eq!(block.used_locked(&lock), 0x4000);
    }
}
