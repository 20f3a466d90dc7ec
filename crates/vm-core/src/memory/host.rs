//! Host backing store for the guest address space.
//!
//! The whole guest space is one anonymous host mapping, so a guest address is
//! translated by adding it to a single fixed base. Pages the guest never touches
//! are never committed by the host. All accessors go through the bounds checks
//! here; raw host pointers never leave this module.
//!
//! Guest bytes are shared between host threads without a lock, so every access
//! is an atomic access of the matching width.
#![allow(unsafe_code)]

use std::ptr::NonNull;
use std::sync::atomic::{AtomicU32, AtomicU64, AtomicU8, Ordering};

#[cfg(unix)]
use memmap2::UncheckedAdvice;
use memmap2::{MmapMut, MmapOptions};

use super::{validate_range, GuestAddr};
use crate::{VmError, VmResult};

/// Anonymous host mapping that backs every guest byte.
pub struct HostMemory {
    // Keeps the mapping alive for as long as `base` is handed out.
    #[cfg_attr(not(unix), allow(dead_code))]
    map: MmapMut,
    base: NonNull<u8>,
    len: u64,
}

// SAFETY: `base` points into `map`, which is owned by this value and never
// remapped; all access through it is atomic.
unsafe impl Send for HostMemory {}
// SAFETY: see `Send`; shared access only produces atomic views.
unsafe impl Sync for HostMemory {}

impl std::fmt::Debug for HostMemory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HostMemory")
            .field("base", &self.base)
            .field("len", &self.len)
            .finish()
    }
}

impl HostMemory {
    /// Reserves `len` bytes of zeroed host memory.
    ///
    /// # Errors
    ///
    /// Returns [`VmError::InvalidConfig`] when `len` is zero or not addressable
    /// on this host, and [`VmError::HostMapping`] when the host refuses the
    /// mapping.
    pub fn new(len: u64) -> VmResult<Self> {
        let size = usize::try_from(len)
            .ok()
            .filter(|size| *size > 0)
            .ok_or(VmError::InvalidConfig {
                reason: "address space size is not mappable on this host",
            })?;
        let mut map = MmapOptions::new()
            .len(size)
            .map_anon()
            .map_err(|err| VmError::from((len, err)))?;
        let base = NonNull::new(map.as_mut_ptr()).ok_or(VmError::HostMapping {
            len,
            kind: std::io::ErrorKind::Other,
        })?;
        log::debug!("reserved {len:#x} bytes of guest memory at {base:p}");

        Ok(Self {
            map,
            base,
            len,
        })
    }

    /// Size of the backing mapping in bytes.
    #[must_use]
    pub const fn len(&self) -> u64 {
        self.len
    }

    /// Returns `true` when the mapping holds no bytes.
    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Converts a host pointer back into a guest address.
    ///
    /// A null pointer converts to [`GuestAddr::NULL`].
    ///
    /// # Errors
    ///
    /// Returns [`VmError::ForeignPointer`] when `ptr` does not point into the
    /// guest mapping. This is fatal for the caller.
    pub fn get_addr(&self, ptr: *const u8) -> VmResult<GuestAddr> {
        if ptr.is_null() {
            return Ok(GuestAddr::NULL);
        }
        let base = self.base.as_ptr() as usize;
        let diff = (ptr as usize).wrapping_sub(base);
        match u32::try_from(diff) {
            Ok(addr) if (ptr as usize) >= base && u64::from(addr) < self.len => Ok(GuestAddr(addr)),
            _ => {
                log::error!("not a guest memory pointer ({ptr:p})");
                Err(VmError::ForeignPointer { ptr: ptr as usize })
            }
        }
    }

    /// Returns the host pointer for `[addr, addr+size)` after bounds checking.
    pub(crate) fn host_ptr(&self, addr: GuestAddr, size: u64) -> VmResult<NonNull<u8>> {
        validate_range(self.len, addr.0, size)?;
        let offset = usize::try_from(addr.0).map_err(|_| VmError::OutOfRange {
            addr: addr.0,
            size,
        })?;
        // SAFETY: `offset + size <= len`, so the result stays inside the mapping
        // and cannot be null.
        Ok(unsafe { NonNull::new_unchecked(self.base.as_ptr().add(offset)) })
    }

    fn byte(&self, ptr: NonNull<u8>, index: usize) -> &AtomicU8 {
        // SAFETY: callers obtained `ptr` from `host_ptr` for a range covering
        // `index`; the mapping outlives `&self` and `AtomicU8` has alignment 1.
        unsafe { AtomicU8::from_ptr(ptr.as_ptr().add(index)) }
    }

    fn word32(&self, addr: GuestAddr) -> VmResult<&AtomicU32> {
        let ptr = self.aligned_ptr(addr, 4)?;
        // SAFETY: in range and 4-byte aligned (the mapping base is page-aligned).
        Ok(unsafe { AtomicU32::from_ptr(ptr.as_ptr().cast()) })
    }

    fn word64(&self, addr: GuestAddr) -> VmResult<&AtomicU64> {
        let ptr = self.aligned_ptr(addr, 8)?;
        // SAFETY: in range and 8-byte aligned (the mapping base is page-aligned).
        Ok(unsafe { AtomicU64::from_ptr(ptr.as_ptr().cast()) })
    }

    fn aligned_ptr(&self, addr: GuestAddr, width: u32) -> VmResult<NonNull<u8>> {
        if addr.0 % width != 0 {
            return Err(VmError::Misaligned {
                addr: addr.0,
                align: width,
            });
        }
        self.host_ptr(addr, u64::from(width))
    }

    /// Reads one byte.
    ///
    /// # Errors
    ///
    /// Returns [`VmError::OutOfRange`] outside the address space.
    pub fn read8(&self, addr: GuestAddr) -> VmResult<u8> {
        let ptr = self.host_ptr(addr, 1)?;
        Ok(self.byte(ptr, 0).load(Ordering::Relaxed))
    }

    /// Writes one byte.
    ///
    /// # Errors
    ///
    /// Returns [`VmError::OutOfRange`] outside the address space.
    pub fn write8(&self, addr: GuestAddr, value: u8) -> VmResult<()> {
        let ptr = self.host_ptr(addr, 1)?;
        self.byte(ptr, 0).store(value, Ordering::Relaxed);
        Ok(())
    }

    /// Copies guest bytes starting at `addr` into `out`.
    ///
    /// # Errors
    ///
    /// Returns [`VmError::OutOfRange`] when the range does not fit.
    pub fn read_bytes(&self, addr: GuestAddr, out: &mut [u8]) -> VmResult<()> {
        let ptr = self.host_ptr(addr, out.len() as u64)?;
        for (index, slot) in out.iter_mut().enumerate() {
            *slot = self.byte(ptr, index).load(Ordering::Relaxed);
        }
        Ok(())
    }

    /// Copies `data` into guest memory starting at `addr`.
    ///
    /// # Errors
    ///
    /// Returns [`VmError::OutOfRange`] when the range does not fit.
    pub fn write_bytes(&self, addr: GuestAddr, data: &[u8]) -> VmResult<()> {
        let ptr = self.host_ptr(addr, data.len() as u64)?;
        for (index, value) in data.iter().enumerate() {
            self.byte(ptr, index).store(*value, Ordering::Relaxed);
        }
        Ok(())
    }

    /// Returns `size` bytes at the page-aligned address `addr` to the host.
    ///
    /// The range reads as zero afterwards and holds no resident memory until
    /// it is touched again.
    pub(crate) fn decommit_pages(&self, addr: GuestAddr, size: u32) -> VmResult<()> {
        debug_assert!(addr.is_page_aligned() && size % super::PAGE_SIZE == 0);
        self.host_ptr(addr, u64::from(size))?;
        self.discard(addr, size)
            .map_err(|err| VmError::from((u64::from(size), err)))
    }

    #[cfg(unix)]
    fn discard(&self, addr: GuestAddr, size: u32) -> std::io::Result<()> {
        // SAFETY: the range is inside the private anonymous mapping, which the
        // host refills with zero pages on the next access. Guest bytes are
        // only reached through atomics, so no reference observes the swap.
        unsafe {
            self.map.unchecked_advise_range(
                UncheckedAdvice::DontNeed,
                addr.0 as usize,
                size as usize,
            )
        }
    }

    #[cfg(not(unix))]
    fn discard(&self, addr: GuestAddr, size: u32) -> std::io::Result<()> {
        for offset in (0..size).step_by(8) {
            if let Ok(word) = self.word64(GuestAddr(addr.0 + offset)) {
                word.store(0, Ordering::Relaxed);
            }
        }
        Ok(())
    }

    /// Atomically loads a naturally aligned 32-bit word.
    ///
    /// # Errors
    ///
    /// Returns [`VmError::Misaligned`] or [`VmError::OutOfRange`].
    pub fn load_u32(&self, addr: GuestAddr) -> VmResult<u32> {
        Ok(self.word32(addr)?.load(Ordering::Acquire))
    }

    /// Atomically loads a naturally aligned 64-bit word.
    ///
    /// # Errors
    ///
    /// Returns [`VmError::Misaligned`] or [`VmError::OutOfRange`].
    pub fn load_u64(&self, addr: GuestAddr) -> VmResult<u64> {
        Ok(self.word64(addr)?.load(Ordering::Acquire))
    }

    /// Atomically stores a naturally aligned 32-bit word.
    ///
    /// # Errors
    ///
    /// Returns [`VmError::Misaligned`] or [`VmError::OutOfRange`].
    pub fn store_u32(&self, addr: GuestAddr, value: u32) -> VmResult<()> {
        self.word32(addr)?.store(value, Ordering::Release);
        Ok(())
    }

    /// Atomically stores a naturally aligned 64-bit word.
    ///
    /// # Errors
    ///
    /// Returns [`VmError::Misaligned`] or [`VmError::OutOfRange`].
    pub fn store_u64(&self, addr: GuestAddr, value: u64) -> VmResult<()> {
        self.word64(addr)?.store(value, Ordering::Release);
        Ok(())
    }

    /// Host compare-and-swap on a naturally aligned 32-bit word.
    ///
    /// Returns `Ok(Ok(previous))` when the swap happened and `Ok(Err(actual))`
    /// when the word did not hold `current`.
    ///
    /// # Errors
    ///
    /// Returns [`VmError::Misaligned`] or [`VmError::OutOfRange`].
    pub fn compare_exchange_u32(
        &self,
        addr: GuestAddr,
        current: u32,
        new: u32,
    ) -> VmResult<Result<u32, u32>> {
        Ok(self
            .word32(addr)?
            .compare_exchange(current, new, Ordering::AcqRel, Ordering::Acquire))
    }

    /// Host compare-and-swap on a naturally aligned 64-bit word.
    ///
    /// # Errors
    ///
    /// Returns [`VmError::Misaligned`] or [`VmError::OutOfRange`].
    pub fn compare_exchange_u64(
        &self,
        addr: GuestAddr,
        current: u64,
        new: u64,
    ) -> VmResult<Result<u64, u64>> {
        Ok(self
            .word64(addr)?
            .compare_exchange(current, new, Ordering::AcqRel, Ordering::Acquire))
    }
}
