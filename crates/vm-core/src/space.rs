//! State shared by every block of one session.

use crate::memory::HostMemory;
use crate::page::PageTable;
use crate::wait::WaitQueue;
use crate::{Gate, GuestAddr, PageFlags, VmConfig, VmResult, WriterLock};

/// Backing memory, page table, gate and waiters of one address space.
#[derive(Debug)]
pub(crate) struct AddressSpace {
    pub(crate) host: HostMemory,
    pub(crate) pages: PageTable,
    pub(crate) gate: Gate,
    pub(crate) waiters: WaitQueue,
    pub(crate) default_flags: PageFlags,
}

impl AddressSpace {
    pub(crate) fn new(config: &VmConfig) -> VmResult<Self> {
        config.validate()?;
        Ok(Self {
            host: HostMemory::new(config.address_space_size)?,
            pages: PageTable::new(config.address_space_size),
            gate: Gate::new(),
            waiters: WaitQueue::new(),
            default_flags: config.default_page_flags,
        })
    }

    /// Marks a free page-aligned range as allocated.
    pub(crate) fn commit(
        &self,
        lock: &WriterLock<'_>,
        addr: GuestAddr,
        size: u32,
        flags: PageFlags,
    ) {
        self.pages.map_pages(lock, addr, size, flags);
    }

    /// Unmaps a committed range, returns its host memory and wakes its waiters.
    pub(crate) fn decommit(
        &self,
        lock: &WriterLock<'_>,
        addr: GuestAddr,
        size: u32,
    ) -> VmResult<()> {
        self.pages.unmap_pages(lock, addr, size);
        self.host.decommit_pages(addr, size)?;
        self.waiters.notify(addr, size);
        Ok(())
    }
}
