//! Lazily published per-page reservation counters.
//!
//! A page's counter array is created by the first thread that needs it:
//! it allocates speculatively, publishes with a compare-and-set and frees its
//! copy if another thread won. Readers never take a lock.
//!
//! A line counter holds an even stamp. Bit 0 is set while a store-conditional
//! owns the line, between its stamp check and the publication of the next
//! stamp.
#![allow(unsafe_code)]

use std::ptr;
use std::sync::atomic::{AtomicPtr, AtomicU64, AtomicU8, Ordering};
use std::time::Instant;

use crate::memory::LOCK_LINES_PER_PAGE;

/// One stamp counter per lock line of a page.
pub type ReservationLines = [AtomicU64; LOCK_LINES_PER_PAGE];

/// Page table entry: permission flags plus the optional counter array.
#[derive(Debug, Default)]
pub(crate) struct Page {
    pub(crate) flags: AtomicU8,
    reservations: AtomicPtr<ReservationLines>,
}

impl Page {
    /// Returns the counter array if some thread already created it.
    pub(crate) fn lines(&self) -> Option<&ReservationLines> {
        let ptr = self.reservations.load(Ordering::Acquire);
        // SAFETY: a non-null pointer was published by `lines_or_init` from a
        // leaked `Box` and is only reclaimed in `Drop`, which needs `&mut self`.
        unsafe { ptr.as_ref() }
    }

    /// Returns the counter array, creating it on first use.
    pub(crate) fn lines_or_init(&self) -> &ReservationLines {
        if let Some(lines) = self.lines() {
            return lines;
        }

        let fresh: Box<ReservationLines> = Box::new(std::array::from_fn(|_| AtomicU64::new(0)));
        let fresh = Box::into_raw(fresh);
        match self.reservations.compare_exchange(
            ptr::null_mut(),
            fresh,
            Ordering::AcqRel,
            Ordering::Acquire,
        ) {
            // SAFETY: `fresh` is now owned by this page until `Drop`.
            Ok(_) => unsafe { &*fresh },
            Err(existing) => {
                // SAFETY: `fresh` lost the race and was never shared.
                drop(unsafe { Box::from_raw(fresh) });
                // SAFETY: `existing` is non-null and owned by this page.
                unsafe { &*existing }
            }
        }
    }

    /// Returns `true` when the counter array has been created.
    pub(crate) fn has_lines(&self) -> bool {
        !self.reservations.load(Ordering::Acquire).is_null()
    }
}

impl Drop for Page {
    fn drop(&mut self) {
        let ptr = *self.reservations.get_mut();
        if !ptr.is_null() {
            // SAFETY: exclusive access; the pointer came from `Box::into_raw`.
            drop(unsafe { Box::from_raw(ptr) });
        }
    }
}

/// Counter bit held by the store-conditional that owns the line.
pub(crate) const LINE_LOCKED: u64 = 1;

/// Reads the stamp of `line`, waiting out a store-conditional that owns it.
pub(crate) fn read_stamp(line: &AtomicU64) -> u64 {
    let mut spins = 0_u32;
    loop {
        let value = line.load(Ordering::Acquire);
        if value & LINE_LOCKED == 0 {
            return value;
        }
        if spins < 64 {
            spins += 1;
            std::hint::spin_loop();
        } else {
            std::thread::yield_now();
        }
    }
}

/// Source of reservation stamps.
///
/// Stamps are even nanosecond counts since the clock was created, bumped so
/// that a line's stamp always strictly increases.
#[derive(Debug)]
pub(crate) struct StampClock {
    epoch: Instant,
}

impl StampClock {
    pub(crate) fn new() -> Self {
        Self {
            epoch: Instant::now(),
        }
    }

    fn now(&self) -> u64 {
        u64::try_from(self.epoch.elapsed().as_nanos()).unwrap_or(u64::MAX)
    }

    /// Stores a fresh stamp into `line` and returns it.
    ///
    /// The lock bit of an owned line is kept; its owner clears it.
    pub(crate) fn publish(&self, line: &AtomicU64) -> u64 {
        self.store_next(line, true)
    }

    fn store_next(&self, line: &AtomicU64, keep_lock: bool) -> u64 {
        let now = self.now();
        let next = |old: u64| now.max((old & !LINE_LOCKED).saturating_add(2)) & !LINE_LOCKED;
        let update = |old: u64| {
            let lock = if keep_lock { old & LINE_LOCKED } else { 0 };
            next(old) | lock
        };
        match line.fetch_update(Ordering::AcqRel, Ordering::Acquire, |old| Some(update(old))) {
            Ok(old) | Err(old) => next(old),
        }
    }
}

/// Exclusive ownership of one lock line for the duration of a
/// store-conditional.
///
/// Dropping the lock restores the line without publishing a new stamp.
#[derive(Debug)]
pub(crate) struct LineLock<'a> {
    line: &'a AtomicU64,
    clock: &'a StampClock,
}

impl<'a> LineLock<'a> {
    /// Locks `line` if its counter still equals `stamp`.
    pub(crate) fn try_lock(
        line: &'a AtomicU64,
        clock: &'a StampClock,
        stamp: u64,
    ) -> Option<Self> {
        if stamp & LINE_LOCKED != 0 {
            return None;
        }
        line.compare_exchange(
            stamp,
            stamp | LINE_LOCKED,
            Ordering::AcqRel,
            Ordering::Relaxed,
        )
        .ok()
        .map(|_| Self { line, clock })
    }

    /// Publishes the next stamp and releases the line.
    pub(crate) fn publish(self) -> u64 {
        let stamp = self.clock.store_next(self.line, false);
        std::mem::forget(self);
        stamp
    }
}

impl Drop for LineLock<'_> {
    fn drop(&mut self) {
        self.line.fetch_and(!LINE_LOCKED, Ordering::Release);
    }
}
