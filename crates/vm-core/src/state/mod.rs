//! Per-thread participation state for the concurrency gate.

/// Lock participation states of a registered thread.
pub mod lock_state;

pub use lock_state::LockState;
