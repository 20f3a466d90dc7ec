//! Process-wide memory session with explicit `init`/`close`.
//!
//! Components that cannot carry a [`Vm`] handle reach the active session
//! through [`instance`]. Handles obtained before [`close`] stay usable, but the
//! session they point to has no blocks left.

use std::sync::{Arc, PoisonError, RwLock};

use crate::{Vm, VmConfig, VmError, VmResult};

static SESSION: RwLock<Option<Arc<Vm>>> = RwLock::new(None);

/// Creates the process-wide session.
///
/// # Errors
///
/// Returns [`VmError::AlreadyInitialized`] when a session exists, and any
/// error of [`Vm::new`].
pub fn init(config: VmConfig) -> VmResult<Arc<Vm>> {
    let mut session = SESSION.write().unwrap_or_else(PoisonError::into_inner);
    if session.is_some() {
        return Err(VmError::AlreadyInitialized);
    }
    let vm = Arc::new(Vm::new(config)?);
    *session = Some(Arc::clone(&vm));
    log::debug!("process memory session initialized");
    Ok(vm)
}

/// Returns the process-wide session.
///
/// # Errors
///
/// Returns [`VmError::NotInitialized`] when no session exists.
pub fn instance() -> VmResult<Arc<Vm>> {
    SESSION
        .read()
        .unwrap_or_else(PoisonError::into_inner)
        .clone()
        .ok_or(VmError::NotInitialized)
}

/// Returns `true` while a process-wide session exists.
#[must_use]
pub fn is_initialized() -> bool {
    SESSION
        .read()
        .unwrap_or_else(PoisonError::into_inner)
        .is_some()
}

/// Releases every block of the process-wide session and forgets it.
///
/// # Errors
///
/// Returns [`VmError::NotInitialized`] when no session exists.
pub fn close() -> VmResult<()> {
    let vm = SESSION
        .write()
        .unwrap_or_else(PoisonError::into_inner)
        .take()
        .ok_or(VmError::NotInitialized)?;
    vm.close();
    log::debug!("process memory session closed");
    Ok(())
}
