//! Range and alignment validation shared by the page table and allocators.

use std::ops::Range;

use super::{PAGE_SHIFT, PAGE_SIZE};
use crate::{VmError, VmResult};

/// Rounds `value` up to the next multiple of `align` (a power of two).
#[must_use]
pub const fn align_up(value: u64, align: u64) -> u64 {
    (value + align - 1) & !(align - 1)
}

/// Returns the indexes of every page touched by `[addr, addr+size)`.
///
/// An empty range touches no pages.
#[must_use]
pub fn page_span(addr: u32, size: u64) -> Range<usize> {
    if size == 0 {
        return 0..0;
    }
    let first = u64::from(addr) >> PAGE_SHIFT;
    let last = (u64::from(addr) + size - 1) >> PAGE_SHIFT;
    to_index(first)..to_index(last) + 1
}

#[allow(clippy::cast_possible_truncation)]
const fn to_index(page: u64) -> usize {
    page as usize
}

/// Validates an allocation alignment.
///
/// # Errors
///
/// Returns [`VmError::InvalidAlignment`] unless `align` is a power of two no
/// smaller than [`PAGE_SIZE`].
pub const fn validate_alignment(align: u32) -> VmResult<()> {
    if align >= PAGE_SIZE && align.is_power_of_two() {
        Ok(())
    } else {
        Err(VmError::InvalidAlignment { align })
    }
}

/// Validates that `[addr, addr+size)` lies inside an address space of `space` bytes.
///
/// # Errors
///
/// Returns [`VmError::OutOfRange`] when the range ends past `space`.
pub const fn validate_range(space: u64, addr: u32, size: u64) -> VmResult<()> {
    if addr as u64 + size <= space {
        Ok(())
    } else {
        Err(VmError::OutOfRange { addr, size })
    }
}

/// Validates a non-empty, page-aligned range inside the address space.
///
/// # Errors
///
/// Returns [`VmError::InvalidSize`] for an empty or unaligned size,
/// [`VmError::Misaligned`] for an unaligned start and [`VmError::OutOfRange`]
/// when the range does not fit.
pub const fn validate_page_range(space: u64, addr: u32, size: u32) -> VmResult<()> {
    if size == 0 || size % PAGE_SIZE != 0 {
        return Err(VmError::InvalidSize { size });
    }
    if addr % PAGE_SIZE != 0 {
        return Err(VmError::Misaligned {
            addr,
            align: PAGE_SIZE,
        });
    }
    validate_range(space, addr, size as u64)
}
