//! Global shared/exclusive protocol between execution threads and mutators.
//!
//! Execution threads hold the gate *passively*: they register a [`ThreadCtl`]
//! and keep running without touching any lock on the hot path. A mutator that
//! takes the writer lock raises the safepoint request on every passive record
//! and waits until each owner has checked in (or stepped aside with
//! [`Gate::temporary_unlock`]) and no transient reader is left.
//!
//! Every state transition happens under one mutex; threads wait on a single
//! condition variable that is signalled on every release.

use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::thread::{self, ThreadId};

use crate::LockState;

/// Per-thread participation record shared between its owner and the gate.
#[derive(Debug)]
pub struct ThreadCtl {
    owner: ThreadId,
    state: AtomicU8,
    safepoint: AtomicBool,
}

impl ThreadCtl {
    /// Creates an unlocked record owned by the calling thread.
    #[must_use]
    pub fn new() -> Self {
        Self {
            owner: thread::current().id(),
            state: AtomicU8::new(LockState::Unlocked.as_u8()),
            safepoint: AtomicBool::new(false),
        }
    }

    /// Thread that owns this record.
    #[must_use]
    pub const fn owner(&self) -> ThreadId {
        self.owner
    }

    /// Current participation state.
    #[must_use]
    pub fn state(&self) -> LockState {
        LockState::from_u8(self.state.load(Ordering::Acquire))
    }

    /// Returns `true` when a writer is waiting for this thread to check in.
    #[must_use]
    pub fn safepoint_requested(&self) -> bool {
        self.safepoint.load(Ordering::Acquire)
    }

    fn set_state(&self, state: LockState) {
        self.state.store(state.as_u8(), Ordering::Release);
    }
}

impl Default for ThreadCtl {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum WriterState {
    Idle,
    Pending,
    Held,
}

#[derive(Debug)]
struct GateInner {
    writer: WriterState,
    readers: usize,
    threads: Vec<Arc<ThreadCtl>>,
}

impl GateInner {
    fn any_passive(&self) -> bool {
        self.threads
            .iter()
            .any(|ctl| ctl.state().blocks_writer())
    }

    fn own_passive(&self) -> Option<Arc<ThreadCtl>> {
        let me = thread::current().id();
        self.threads
            .iter()
            .find(|ctl| ctl.owner == me && ctl.state() == LockState::Passive)
            .cloned()
    }

    fn position(&self, ctl: &ThreadCtl) -> Option<usize> {
        self.threads
            .iter()
            .position(|registered| std::ptr::eq(Arc::as_ptr(registered), ctl))
    }
}

/// Shared/exclusive gate guarding structural changes to the address space.
#[derive(Debug)]
pub struct Gate {
    inner: Mutex<GateInner>,
    changed: Condvar,
}

impl Default for Gate {
    fn default() -> Self {
        Self::new()
    }
}

impl Gate {
    /// Creates an idle gate with no registered threads.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            inner: Mutex::new(GateInner {
                writer: WriterState::Idle,
                readers: 0,
                threads: Vec::new(),
            }),
            changed: Condvar::new(),
        }
    }

    fn lock(&self) -> MutexGuard<'_, GateInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn wait_while<'g>(
        &self,
        guard: MutexGuard<'g, GateInner>,
        condition: impl FnMut(&mut GateInner) -> bool,
    ) -> MutexGuard<'g, GateInner> {
        self.changed
            .wait_while(guard, condition)
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// Number of threads currently registered with the gate.
    #[must_use]
    pub fn registered_threads(&self) -> usize {
        self.lock().threads.len()
    }

    /// Takes shared access. Blocks only while a writer holds the gate.
    ///
    /// Must not be called by a thread that already holds the writer lock.
    pub fn reader_lock(&self) -> ReaderLock<'_> {
        let mut inner = self.wait_while(self.lock(), |inner| {
            inner.writer == WriterState::Held
        });
        inner.readers += 1;
        ReaderLock { gate: self }
    }

    /// Takes shared access unless a writer holds the gate.
    #[must_use]
    pub fn try_reader_lock(&self) -> Option<ReaderLock<'_>> {
        let mut inner = self.lock();
        if inner.writer == WriterState::Held {
            return None;
        }
        inner.readers += 1;
        Some(ReaderLock { gate: self })
    }

    /// Takes exclusive access.
    ///
    /// Announces the writer, raises the safepoint request on every passive
    /// thread and waits until no reader is left and no other registered thread
    /// is passive. A passive caller steps aside for the duration of the wait.
    pub fn writer_lock(&self) -> WriterLock<'_> {
        let mut inner = self.lock();
        let own = inner.own_passive();
        if let Some(ctl) = &own {
            ctl.set_state(LockState::TemporarilyUnlocked);
            self.changed.notify_all();
        }

        inner = self.wait_while(inner, |inner| inner.writer != WriterState::Idle);
        inner.writer = WriterState::Pending;
        for ctl in &inner.threads {
            if ctl.state() == LockState::Passive {
                ctl.safepoint.store(true, Ordering::Release);
            }
        }

        inner = self.wait_while(inner, |inner| inner.readers > 0 || inner.any_passive());
        inner.writer = WriterState::Held;
        if let Some(ctl) = own {
            ctl.set_state(LockState::Passive);
        }
        log::trace!("writer lock acquired");
        WriterLock { gate: self }
    }

    /// Takes exclusive access only if nobody would have to be waited for.
    #[must_use]
    pub fn try_writer_lock(&self) -> Option<WriterLock<'_>> {
        let mut inner = self.lock();
        let me = thread::current().id();
        let blocked = inner.writer != WriterState::Idle
            || inner.readers > 0
            || inner
                .threads
                .iter()
                .any(|ctl| ctl.owner != me && ctl.state().blocks_writer());
        if blocked {
            return None;
        }
        inner.writer = WriterState::Held;
        log::trace!("writer lock acquired without waiting");
        Some(WriterLock { gate: self })
    }

    /// Registers `ctl` as a passive holder.
    ///
    /// Waits for any pending or active writer first. Must not be called while
    /// the calling thread holds the writer lock. Returns at once for a record
    /// that is already registered and passive.
    pub fn passive_lock(&self, ctl: &Arc<ThreadCtl>) {
        let inner = self.lock();
        if ctl.state() == LockState::Passive && inner.position(ctl).is_some() {
            return;
        }
        let mut inner = self.wait_while(inner, |inner| inner.writer != WriterState::Idle);
        if inner.position(ctl).is_none() {
            inner.threads.push(Arc::clone(ctl));
        }
        ctl.safepoint.store(false, Ordering::Release);
        ctl.set_state(LockState::Passive);
        log::trace!("thread {:?} is now passive", ctl.owner);
    }

    /// Unregisters the calling thread's record.
    pub fn passive_unlock(&self, ctl: &ThreadCtl) {
        self.release(ctl);
        log::trace!("thread {:?} left the gate", ctl.owner);
    }

    /// Unregisters a record on behalf of a thread that is gone.
    ///
    /// Safe to call from any thread and for records that are not registered.
    pub fn cleanup_unlock(&self, ctl: &ThreadCtl) {
        if self.release(ctl) {
            log::trace!("cleaned up gate record of thread {:?}", ctl.owner);
        }
    }

    fn release(&self, ctl: &ThreadCtl) -> bool {
        let mut inner = self.lock();
        let removed = inner.position(ctl).map(|index| inner.threads.swap_remove(index));
        ctl.safepoint.store(false, Ordering::Release);
        ctl.set_state(LockState::Unlocked);
        self.changed.notify_all();
        removed.is_some()
    }

    /// Steps aside before a blocking call so writers need not wait for `ctl`.
    pub fn temporary_unlock(&self, ctl: &ThreadCtl) {
        let _inner = self.lock();
        if ctl.state() == LockState::Passive {
            ctl.set_state(LockState::TemporarilyUnlocked);
            self.changed.notify_all();
        }
    }

    /// Returns to passive participation after [`Self::temporary_unlock`].
    ///
    /// Waits for any pending or active writer to finish first.
    pub fn resume(&self, ctl: &ThreadCtl) {
        let inner = self.lock();
        if ctl.state() != LockState::TemporarilyUnlocked {
            return;
        }
        let _inner = self.wait_while(inner, |inner| inner.writer != WriterState::Idle);
        ctl.safepoint.store(false, Ordering::Release);
        ctl.set_state(LockState::Passive);
    }

    /// Safepoint poll for passive threads.
    ///
    /// Returns immediately when no writer is waiting. Otherwise steps aside,
    /// waits for the writer to finish and resumes; returns `true` in that case.
    pub fn check_in(&self, ctl: &ThreadCtl) -> bool {
        if !ctl.safepoint_requested() {
            return false;
        }
        let inner = self.lock();
        if ctl.state() != LockState::Passive {
            ctl.safepoint.store(false, Ordering::Release);
            return false;
        }
        ctl.set_state(LockState::TemporarilyUnlocked);
        self.changed.notify_all();
        log::trace!("thread {:?} yielding to writer", ctl.owner);

        let _inner = self.wait_while(inner, |inner| inner.writer != WriterState::Idle);
        ctl.safepoint.store(false, Ordering::Release);
        ctl.set_state(LockState::Passive);
        true
    }

    /// Runs `f` with `ctl` temporarily unlocked and resumes afterwards, also
    /// when `f` unwinds.
    pub fn unlocked<R>(&self, ctl: &ThreadCtl, f: impl FnOnce() -> R) -> R {
        struct Resume<'a> {
            gate: &'a Gate,
            ctl: &'a ThreadCtl,
        }

        impl Drop for Resume<'_> {
            fn drop(&mut self) {
                self.gate.resume(self.ctl);
            }
        }

        self.temporary_unlock(ctl);
        let _resume = Resume { gate: self, ctl };
        f()
    }
}

/// Shared access to the gate; released on drop.
#[derive(Debug)]
#[must_use = "the gate is released when the guard is dropped"]
pub struct ReaderLock<'a> {
    gate: &'a Gate,
}

impl Drop for ReaderLock<'_> {
    fn drop(&mut self) {
        let mut inner = self.gate.lock();
        inner.readers -= 1;
        if inner.readers == 0 {
            self.gate.changed.notify_all();
        }
    }
}

/// Exclusive access to the gate; released on drop.
///
/// Internal operations take `&WriterLock<'_>` as proof that the caller holds it.
#[derive(Debug)]
#[must_use = "the gate is released when the guard is dropped"]
pub struct WriterLock<'a> {
    gate: &'a Gate,
}

impl Drop for WriterLock<'_> {
    fn drop(&mut self) {
        let mut inner = self.gate.lock();
        inner.writer = WriterState::Idle;
        for ctl in &inner.threads {
            ctl.safepoint.store(false, Ordering::Release);
        }
        self.gate.changed.notify_all();
        log::trace!("writer lock released");
    }
}
