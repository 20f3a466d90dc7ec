//! Guest 32-bit address space and memory-consistency core.
//!
//! The crate maps a guest address space onto one host mapping, tracks per-page
//! permissions, allocates regions inside named memory locations and emulates
//! load-reserve/store-conditional on 128-byte lock lines. Structural changes are
//! serialized by a [`Gate`] that cooperates with long-lived execution threads.

/// Guest address primitives, location layout and host backing store.
pub mod memory;
pub use memory::{
    GuestAddr, HostMemory, Location, LocationDescriptor, FULL_ADDRESS_SPACE, LOCK_LINE_SIZE,
    PAGE_SIZE,
};

/// Page table with permission flags and reservation stamps.
pub mod page;
pub use page::{BlockFlags, PageFlags, PageTable};

/// Error taxonomy shared by every operation.
pub mod error;
pub use error::{ErrorClass, VmError, VmResult};

/// Session configuration.
pub mod config;
pub use config::VmConfig;

/// Per-thread gate participation state.
pub mod state;
pub use state::LockState;

/// Shared/exclusive concurrency gate.
pub mod gate;
pub use gate::{Gate, ReaderLock, ThreadCtl, WriterLock};

/// Address-keyed wait/notify.
pub mod wait;
pub use wait::{WaitQueue, Waiter};

/// Region allocator over one mapped area.
pub mod block;
pub use block::{Allocation, Block, Deallocation};

mod space;

/// Session facade and location registry.
pub mod vm;
pub use vm::{Reservation, Vm, WaitOutcome};

/// Process-wide session.
pub mod global;

#[cfg(test)]
use proptest as _;
