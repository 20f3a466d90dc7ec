//! Session facade: the location registry plus every page-level operation.

use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::Duration;

use crate::memory::{
    align_up, validate_alignment, validate_page_range, HostMemory, LOCATION_COUNT,
    LOCK_LINE_SIZE, PAGE_SIZE,
};
use crate::space::AddressSpace;
use crate::wait::{WaitQueue, Waiter};
use crate::{
    Block, BlockFlags, Deallocation, Gate, GuestAddr, Location, PageFlags, ThreadCtl, VmConfig,
    VmError, VmResult, WriterLock,
};

/// Alignment of shared-memory imports.
const SHARED_IMPORT_ALIGN: u32 = 0x1_0000;

/// Lowest address considered by [`Vm::find_map`].
const FIND_MAP_FLOOR: u64 = 0x1_0000;

/// State captured by a reserved load, consumed by the matching conditional store.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Reservation {
    addr: GuestAddr,
    stamp: u64,
    value: u64,
}

impl Reservation {
    /// Reserved address.
    #[must_use]
    pub const fn addr(&self) -> GuestAddr {
        self.addr
    }

    /// Stamp of the lock line when the reservation began.
    #[must_use]
    pub const fn stamp(&self) -> u64 {
        self.stamp
    }

    /// Value observed by the reserved load.
    #[must_use]
    pub const fn value(&self) -> u64 {
        self.value
    }
}

/// How a [`Vm::wait`] call ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum WaitOutcome {
    /// The line had already changed when the waiter was inserted.
    Changed,
    /// A notification covering the line arrived.
    Notified,
    /// The timeout elapsed first.
    TimedOut,
}

#[derive(Debug, Default)]
struct Registry {
    located: [Option<Arc<Block>>; LOCATION_COUNT],
    blocks: Vec<Arc<Block>>,
}

impl Registry {
    fn containing(&self, addr: GuestAddr) -> Option<&Arc<Block>> {
        self.blocks.iter().find(|block| block.contains(addr))
    }

    fn lookup(&self, location: Option<Location>, addr: GuestAddr) -> Option<&Arc<Block>> {
        match location {
            Some(location) => self.located[location.index()].as_ref(),
            None => self.containing(addr),
        }
    }
}

/// One emulation session: guest memory, page table, blocks, gate and waiters.
#[derive(Debug)]
pub struct Vm {
    space: Arc<AddressSpace>,
    registry: RwLock<Registry>,
    config: VmConfig,
}

impl Vm {
    /// Creates a session with no blocks mapped.
    ///
    /// # Errors
    ///
    /// Returns [`VmError::InvalidConfig`] for an invalid configuration and
    /// [`VmError::HostMapping`] when the backing store cannot be reserved.
    pub fn new(config: VmConfig) -> VmResult<Self> {
        let space = Arc::new(AddressSpace::new(&config)?);
        log::debug!(
            "memory session created: {:#x} bytes, {} pages",
            config.address_space_size,
            space.pages.page_count()
        );
        Ok(Self {
            space,
            registry: RwLock::new(Registry::default()),
            config,
        })
    }

    /// Configuration the session was created with.
    #[must_use]
    pub const fn config(&self) -> &VmConfig {
        &self.config
    }

    /// Host backing store.
    #[must_use]
    pub fn memory(&self) -> &HostMemory {
        &self.space.host
    }

    /// Concurrency gate of the session.
    #[must_use]
    pub fn gate(&self) -> &Gate {
        &self.space.gate
    }

    /// Waiter queue of the session.
    #[must_use]
    pub fn waiters(&self) -> &WaitQueue {
        &self.space.waiters
    }

    /// Converts a host pointer into guest memory back to a guest address.
    ///
    /// # Errors
    ///
    /// Returns the fatal [`VmError::ForeignPointer`] for pointers outside
    /// guest memory.
    pub fn get_addr(&self, ptr: *const u8) -> VmResult<GuestAddr> {
        self.space.host.get_addr(ptr)
    }

    fn registry(&self) -> RwLockReadGuard<'_, Registry> {
        self.registry.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn registry_mut(&self) -> RwLockWriteGuard<'_, Registry> {
        self.registry.write().unwrap_or_else(PoisonError::into_inner)
    }

    // Page table

    /// Returns `true` when every page of `[addr, addr+size)` carries `flags`.
    #[must_use]
    pub fn check_addr(&self, addr: GuestAddr, size: u32, flags: PageFlags) -> bool {
        self.space.pages.check_range(addr, u64::from(size), flags)
    }

    /// Current flags of the page containing `addr`.
    #[must_use]
    pub fn page_flags(&self, addr: GuestAddr) -> PageFlags {
        self.space.pages.flags(addr)
    }

    /// All-or-nothing permission change over a page-aligned range.
    ///
    /// Returns `Ok(false)` without changing anything when some page is not
    /// allocated or lacks a `test` bit. Bits in both `set` and `clear` toggle.
    ///
    /// # Errors
    ///
    /// Returns an argument error for empty, unaligned or out-of-range requests.
    pub fn page_protect(
        &self,
        addr: GuestAddr,
        size: u32,
        test: PageFlags,
        set: PageFlags,
        clear: PageFlags,
    ) -> VmResult<bool> {
        let lock = self.space.gate.writer_lock();
        let applied = self
            .space
            .pages
            .protect(&lock, addr, size, test, set, clear)?;
        if applied {
            self.space.waiters.notify(addr, size);
        }
        Ok(applied)
    }

    // Reservations

    /// Current stamp of the lock line containing `addr`.
    ///
    /// # Errors
    ///
    /// Returns [`VmError::OutOfRange`] outside the address space.
    pub fn reservation_acquire(&self, addr: GuestAddr) -> VmResult<u64> {
        self.space.pages.reservation_acquire(addr)
    }

    /// Publishes a fresh stamp for the lock line containing `addr`.
    ///
    /// # Errors
    ///
    /// Returns [`VmError::OutOfRange`] outside the address space.
    pub fn reservation_update(&self, addr: GuestAddr) -> VmResult<u64> {
        self.space.pages.reservation_update(addr)
    }

    fn begin_reservation(&self, addr: GuestAddr) -> VmResult<u64> {
        if self
            .space
            .pages
            .flags(addr)
            .contains(PageFlags::NO_RESERVATIONS)
        {
            return Err(VmError::ReservationsDisabled { addr: addr.0 });
        }
        self.space.pages.reservation_acquire(addr)
    }

    /// Loads a 32-bit word and begins a reservation on its line.
    ///
    /// # Errors
    ///
    /// Returns [`VmError::ReservationsDisabled`] on device pages and an
    /// address error for unaligned or out-of-range words.
    pub fn load_reserved_u32(&self, addr: GuestAddr) -> VmResult<(u32, Reservation)> {
        let stamp = self.begin_reservation(addr)?;
        let value = self.space.host.load_u32(addr)?;
        Ok((
            value,
            Reservation {
                addr,
                stamp,
                value: u64::from(value),
            },
        ))
    }

    /// Loads a 64-bit word and begins a reservation on its line.
    ///
    /// # Errors
    ///
    /// Same as [`Self::load_reserved_u32`].
    pub fn load_reserved_u64(&self, addr: GuestAddr) -> VmResult<(u64, Reservation)> {
        let stamp = self.begin_reservation(addr)?;
        let value = self.space.host.load_u64(addr)?;
        Ok((value, Reservation { addr, stamp, value }))
    }

    /// Stores `new` if the line was not updated since `reservation` began.
    ///
    /// Returns `Ok(false)` when the reservation was lost, including to a
    /// concurrent store-conditional on another word of the same line.
    ///
    /// # Errors
    ///
    /// Returns an address error for unaligned or out-of-range words.
    pub fn store_conditional_u32(&self, reservation: &Reservation, new: u32) -> VmResult<bool> {
        let Ok(expected) = u32::try_from(reservation.value) else {
            return Ok(false);
        };
        self.store_conditional(reservation, |host| {
            Ok(host
                .compare_exchange_u32(reservation.addr, expected, new)?
                .is_ok())
        })
    }

    /// Stores `new` if the line was not updated since `reservation` began.
    ///
    /// # Errors
    ///
    /// Same as [`Self::store_conditional_u32`].
    pub fn store_conditional_u64(&self, reservation: &Reservation, new: u64) -> VmResult<bool> {
        self.store_conditional(reservation, |host| {
            Ok(host
                .compare_exchange_u64(reservation.addr, reservation.value, new)?
                .is_ok())
        })
    }

    fn store_conditional(
        &self,
        reservation: &Reservation,
        swap: impl FnOnce(&HostMemory) -> VmResult<bool>,
    ) -> VmResult<bool> {
        let addr = reservation.addr;
        let Some(line) = self.space.pages.reservation_lock(addr, reservation.stamp)? else {
            return Ok(false);
        };
        // A failed swap drops `line`, releasing it with its stamp unchanged.
        if !swap(&self.space.host)? {
            return Ok(false);
        }
        line.publish();
        self.space.waiters.notify(addr.line_base(), LOCK_LINE_SIZE);
        Ok(true)
    }

    // Wait/notify

    /// Wakes waiters on every lock line intersecting `[addr, addr+size)`.
    pub fn notify(&self, addr: GuestAddr, size: u32) -> usize {
        self.space.waiters.notify(addr, size)
    }

    /// Wakes every waiter.
    pub fn notify_all(&self) -> usize {
        self.space.waiters.notify_all()
    }

    /// Blocks until the lock line containing `addr` is notified, or until
    /// `timeout` elapses.
    ///
    /// A passive caller passes its `ctl` so that writers are not held up while
    /// it sleeps. Returns [`WaitOutcome::Changed`] without blocking when the
    /// line's stamp or bytes changed between the snapshot and the insertion.
    ///
    /// # Errors
    ///
    /// Returns [`VmError::OutOfRange`] outside the address space.
    pub fn wait(
        &self,
        ctl: Option<&ThreadCtl>,
        addr: GuestAddr,
        timeout: Option<Duration>,
    ) -> VmResult<WaitOutcome> {
        let line = addr.line_base();
        let stamp = self.reservation_acquire(line)?;
        let mut before = [0_u8; LOCK_LINE_SIZE as usize];
        self.space.host.read_bytes(line, &mut before)?;

        let mut waiter = Waiter::new(&self.space.waiters, line, stamp, 0);
        waiter.insert();

        let mut after = [0_u8; LOCK_LINE_SIZE as usize];
        self.space.host.read_bytes(line, &mut after)?;
        if self.reservation_acquire(line)? != stamp || before != after {
            return Ok(WaitOutcome::Changed);
        }

        let notified = match ctl {
            Some(ctl) => self.space.gate.unlocked(ctl, || waiter.wait(timeout)),
            None => waiter.wait(timeout),
        };
        Ok(if notified {
            WaitOutcome::Notified
        } else {
            WaitOutcome::TimedOut
        })
    }

    // Registry

    /// Maps a new block at a fixed page-aligned address.
    ///
    /// A range equal to a location's descriptor becomes that location's block.
    ///
    /// # Errors
    ///
    /// Returns an argument error for unaligned or out-of-range ranges and
    /// [`VmError::Occupied`] when the range overlaps a block.
    pub fn map(&self, addr: GuestAddr, size: u32, flags: BlockFlags) -> VmResult<Arc<Block>> {
        let lock = self.space.gate.writer_lock();
        let mut registry = self.registry_mut();
        self.map_locked(&lock, &mut registry, addr, size, flags)
    }

    fn map_locked(
        &self,
        _lock: &WriterLock<'_>,
        registry: &mut Registry,
        addr: GuestAddr,
        size: u32,
        flags: BlockFlags,
    ) -> VmResult<Arc<Block>> {
        validate_page_range(self.space.pages.space(), addr.0, size)?;
        let occupied = registry
            .blocks
            .iter()
            .any(|block| block.overlaps(addr.0, size))
            || !self.space.pages.is_free(addr, u64::from(size));
        if occupied {
            return Err(VmError::Occupied {
                addr: addr.0,
                size,
            });
        }

        let block = Arc::new(Block::new(Arc::clone(&self.space), addr, size, flags));
        let index = registry
            .blocks
            .partition_point(|existing| existing.addr() < addr);
        registry.blocks.insert(index, Arc::clone(&block));

        if let Some(descriptor) = self
            .config
            .locations
            .iter()
            .find(|descriptor| descriptor.start == addr.0 && descriptor.size == size)
        {
            registry.located[descriptor.location.index()] = Some(Arc::clone(&block));
        }
        log::debug!("mapped block {addr}+{size:#x} ({flags:?})");
        Ok(block)
    }

    /// Maps a block of `size` bytes at the lowest free `align`-aligned address
    /// outside every named location.
    ///
    /// # Errors
    ///
    /// Returns an argument error for a zero size or bad alignment and
    /// [`VmError::OutOfMemory`] when no such range exists.
    pub fn find_map(&self, size: u32, align: u32, flags: BlockFlags) -> VmResult<Arc<Block>> {
        validate_alignment(align)?;
        if size == 0 {
            return Err(VmError::InvalidSize { size });
        }
        let rounded = align_up(u64::from(size), u64::from(PAGE_SIZE));
        let oversized = VmError::OutOfMemory {
            size: u32::try_from(rounded).unwrap_or(u32::MAX),
        };
        let size = u32::try_from(rounded).map_err(|_| oversized.clone())?;

        let lock = self.space.gate.writer_lock();
        let mut registry = self.registry_mut();
        let align = u64::from(align);
        let mut candidate = align_up(FIND_MAP_FLOOR, align);
        loop {
            let end = candidate + u64::from(size);
            if end > self.space.pages.space() {
                return Err(oversized);
            }
            let conflict_end = registry
                .blocks
                .iter()
                .map(|block| (u64::from(block.addr().0), block.end()))
                .chain(
                    self.config
                        .locations
                        .iter()
                        .map(|descriptor| (u64::from(descriptor.start), descriptor.end())),
                )
                .filter(|&(start, stop)| start < end && candidate < stop)
                .map(|(_, stop)| stop)
                .max();
            match conflict_end {
                Some(stop) => candidate = align_up(stop, align),
                None => break,
            }
        }

        let addr = GuestAddr(u32::try_from(candidate).map_err(|_| oversized)?);
        self.map_locked(&lock, &mut registry, addr, size, flags)
    }

    /// Maps the whole descriptor of `location` as its block.
    ///
    /// # Errors
    ///
    /// Returns [`VmError::Occupied`] when the location already has a block or
    /// overlaps another mapping.
    pub fn map_location(&self, location: Location, flags: BlockFlags) -> VmResult<Arc<Block>> {
        let descriptor = self.config.descriptor(location);
        self.map(GuestAddr(descriptor.start), descriptor.size, flags)
    }

    /// Removes the block starting at `addr` and releases all its allocations.
    ///
    /// # Errors
    ///
    /// Returns [`VmError::NoBlock`] when no block starts at `addr` and
    /// [`VmError::BlockNotEmpty`] when `must_be_empty` is set and allocations
    /// remain.
    pub fn unmap(&self, addr: GuestAddr, must_be_empty: bool) -> VmResult<Arc<Block>> {
        let lock = self.space.gate.writer_lock();
        let mut registry = self.registry_mut();
        let index = registry
            .blocks
            .iter()
            .position(|block| block.addr() == addr)
            .ok_or(VmError::NoBlock { addr: addr.0 })?;

        if must_be_empty {
            let used = registry.blocks[index].used_locked(&lock);
            if used > 0 {
                return Err(VmError::BlockNotEmpty { addr: addr.0, used });
            }
        }

        let block = registry.blocks.remove(index);
        for slot in &mut registry.located {
            if slot.as_ref().is_some_and(|located| Arc::ptr_eq(located, &block)) {
                *slot = None;
            }
        }
        let released = block.release_all(&lock)?;
        self.space.waiters.notify(addr, block.size());
        log::debug!(
            "unmapped block {addr}+{:#x}, released {released} allocation(s)",
            block.size()
        );
        Ok(block)
    }

    /// Looks up a block: the named location's block, or (for `None`) the
    /// block containing `addr`.
    #[must_use]
    pub fn get(&self, location: Option<Location>, addr: GuestAddr) -> Option<Arc<Block>> {
        let _shared = self.space.gate.reader_lock();
        self.registry().lookup(location, addr).cloned()
    }

    fn location_block(
        &self,
        lock: &WriterLock<'_>,
        registry: &mut Registry,
        location: Location,
    ) -> VmResult<Arc<Block>> {
        if let Some(block) = &registry.located[location.index()] {
            return Ok(Arc::clone(block));
        }
        let descriptor = self.config.descriptor(location);
        self.map_locked(
            lock,
            registry,
            GuestAddr(descriptor.start),
            descriptor.size,
            BlockFlags::empty(),
        )
        .map_err(|err| {
            log::warn!("cannot create block for {location:?}: {err}");
            VmError::LocationUnavailable { location }
        })
    }

    fn target_block(
        &self,
        lock: &WriterLock<'_>,
        registry: &mut Registry,
        location: Option<Location>,
        addr: GuestAddr,
    ) -> VmResult<Arc<Block>> {
        match location {
            Some(location) => self.location_block(lock, registry, location),
            None => registry
                .containing(addr)
                .cloned()
                .ok_or(VmError::NoBlock { addr: addr.0 }),
        }
    }

    /// Allocates inside a named location, creating its block on first use.
    ///
    /// # Errors
    ///
    /// Returns [`VmError::LocationUnavailable`] when the location's block
    /// cannot be created, plus every error of [`Block::alloc`].
    pub fn alloc(
        &self,
        size: u32,
        location: Location,
        align: u32,
        sup: Option<u32>,
    ) -> VmResult<GuestAddr> {
        let lock = self.space.gate.writer_lock();
        let mut registry = self.registry_mut();
        let block = self.location_block(&lock, &mut registry, location)?;
        block.alloc_locked(&lock, size, align, None, sup)
    }

    /// Allocates at a fixed address, in the named location or (for `None`) in
    /// whichever block contains `addr`.
    ///
    /// # Errors
    ///
    /// Returns [`VmError::NoBlock`] when no block contains `addr`, plus every
    /// error of [`Block::falloc`].
    pub fn falloc(
        &self,
        addr: GuestAddr,
        size: u32,
        location: Option<Location>,
        sup: Option<u32>,
    ) -> VmResult<GuestAddr> {
        let lock = self.space.gate.writer_lock();
        let mut registry = self.registry_mut();
        let block = self.target_block(&lock, &mut registry, location, addr)?;
        block.falloc_locked(&lock, addr, size, None, sup)
    }

    /// Releases the allocation starting at `addr`.
    ///
    /// # Errors
    ///
    /// Returns [`VmError::NoBlock`] when no block is found and
    /// [`VmError::NotAllocated`] when no allocation starts at `addr`.
    pub fn dealloc(&self, addr: GuestAddr, location: Option<Location>) -> VmResult<Deallocation> {
        let lock = self.space.gate.writer_lock();
        let block = self
            .registry()
            .lookup(location, addr)
            .cloned()
            .ok_or(VmError::NoBlock { addr: addr.0 })?;
        block.dealloc_locked(&lock, addr, None)
    }

    /// Like [`Self::dealloc`] but never fails: failures are logged and
    /// reported as a released size of zero.
    pub fn dealloc_or_log(&self, addr: GuestAddr, location: Option<Location>) -> u32 {
        match self.dealloc(addr, location) {
            Ok(released) => released.size,
            Err(err) => {
                log::warn!("dealloc({addr}) failed: {err}");
                0
            }
        }
    }

    /// Returns the allocation in `location` tagged with `tag`, allocating a new
    /// tagged one of `size` bytes when none exists.
    ///
    /// Returns the address and the (page-rounded) size.
    ///
    /// # Errors
    ///
    /// Same as [`Self::alloc`].
    pub fn import_shared(
        &self,
        location: Location,
        size: u32,
        tag: u32,
    ) -> VmResult<(GuestAddr, u32)> {
        let lock = self.space.gate.writer_lock();
        let mut registry = self.registry_mut();
        let block = self.location_block(&lock, &mut registry, location)?;
        if let Some(existing) = block.find_tagged_locked(&lock, tag) {
            return Ok(existing);
        }
        let addr = block.alloc_locked(&lock, size, SHARED_IMPORT_ALIGN, None, Some(tag))?;
        let size = u32::try_from(align_up(u64::from(size), u64::from(PAGE_SIZE)))
            .map_err(|_| VmError::InvalidSize { size })?;
        Ok((addr, size))
    }

    /// Blocks currently mapped, in address order.
    #[must_use]
    pub fn blocks(&self) -> Vec<Arc<Block>> {
        let _shared = self.space.gate.reader_lock();
        self.registry().blocks.clone()
    }

    /// Unmaps every block and releases every allocation.
    ///
    /// Returns the number of blocks that were unmapped.
    pub fn close(&self) -> usize {
        let lock = self.space.gate.writer_lock();
        let mut registry = self.registry_mut();
        registry.located = Default::default();
        let blocks = std::mem::take(&mut registry.blocks);
        for block in &blocks {
            if let Err(err) = block.release_all(&lock) {
                log::warn!("releasing block {} failed: {err}", block.addr());
            }
        }
        self.space.waiters.notify_all();
        log::debug!("memory session closed, {} block(s) unmapped", blocks.len());
        blocks.len()
    }
}
