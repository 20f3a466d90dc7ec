//! Address-keyed blocking and waking.
//!
//! A [`Waiter`] is inserted into the queue before its thread blocks and is
//! removed exactly once, either by a matching notification or by the waiter
//! itself (explicitly or on drop).

use std::sync::atomic::{fence, AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::thread::{self, ThreadId};
use std::time::Duration;

use crate::memory::LOCK_LINE_SIZE;
use crate::GuestAddr;

#[derive(Debug)]
struct WaitEntry {
    owner: ThreadId,
    addr: GuestAddr,
    stamp: u64,
    data: u64,
    inserted: AtomicBool,
    signaled: Mutex<bool>,
    wake: Condvar,
}

impl WaitEntry {
    fn watches(&self, start: u64, end: u64) -> bool {
        let line = u64::from(self.addr.line_base().0);
        line < end && start < line + u64::from(LOCK_LINE_SIZE)
    }

    fn signal(&self) {
        *self.signaled.lock().unwrap_or_else(PoisonError::into_inner) = true;
        self.wake.notify_one();
    }
}

/// Queue of blocked waiters keyed by guest address.
#[derive(Debug, Default)]
pub struct WaitQueue {
    entries: Mutex<Vec<Arc<WaitEntry>>>,
    len: AtomicUsize,
}

impl WaitQueue {
    /// Creates an empty queue.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn entries(&self) -> MutexGuard<'_, Vec<Arc<WaitEntry>>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Number of inserted waiters.
    #[must_use]
    pub fn len(&self) -> usize {
        self.len.load(Ordering::Acquire)
    }

    /// Returns `true` when nobody is waiting.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Wakes every waiter whose lock line intersects `[addr, addr+size)`.
    ///
    /// Returns the number of waiters woken.
    pub fn notify(&self, addr: GuestAddr, size: u32) -> usize {
        // Pairs with the fence in `Waiter::insert`: either the waiter sees the
        // caller's earlier stores or this sees the waiter.
        fence(Ordering::SeqCst);
        if self.is_empty() || size == 0 {
            return 0;
        }
        let start = u64::from(addr.0);
        let end = start + u64::from(size);
        self.wake_where(|entry| entry.watches(start, end))
    }

    /// Wakes every waiter.
    pub fn notify_all(&self) -> usize {
        fence(Ordering::SeqCst);
        if self.is_empty() {
            return 0;
        }
        self.wake_where(|_| true)
    }

    fn wake_where(&self, mut matches: impl FnMut(&WaitEntry) -> bool) -> usize {
        let mut entries = self.entries();
        let mut woken = 0;
        entries.retain(|entry| {
            if !matches(entry) {
                return true;
            }
            entry.inserted.store(false, Ordering::Release);
            entry.signal();
            woken += 1;
            false
        });
        self.len.store(entries.len(), Ordering::Release);
        if woken > 0 {
            log::trace!("woke {woken} waiter(s)");
        }
        woken
    }
}

/// A registration of the current thread waiting on one lock line.
#[derive(Debug)]
pub struct Waiter<'q> {
    queue: &'q WaitQueue,
    entry: Arc<WaitEntry>,
}

impl<'q> Waiter<'q> {
    /// Creates a waiter owned by the calling thread. Not yet inserted.
    #[must_use]
    pub fn new(queue: &'q WaitQueue, addr: GuestAddr, stamp: u64, data: u64) -> Self {
        Self {
            queue,
            entry: Arc::new(WaitEntry {
                owner: thread::current().id(),
                addr,
                stamp,
                data,
                inserted: AtomicBool::new(false),
                signaled: Mutex::new(false),
                wake: Condvar::new(),
            }),
        }
    }

    /// Thread that created the waiter.
    #[must_use]
    pub fn owner(&self) -> ThreadId {
        self.entry.owner
    }

    /// Watched address.
    #[must_use]
    pub fn addr(&self) -> GuestAddr {
        self.entry.addr
    }

    /// Reservation stamp observed before waiting.
    #[must_use]
    pub fn stamp(&self) -> u64 {
        self.entry.stamp
    }

    /// Opaque caller payload.
    #[must_use]
    pub fn data(&self) -> u64 {
        self.entry.data
    }

    /// Returns `true` while the waiter sits in the queue.
    #[must_use]
    pub fn is_inserted(&self) -> bool {
        self.entry.inserted.load(Ordering::Acquire)
    }

    /// Inserts the waiter into the queue. No-op when already inserted.
    ///
    /// Memory the caller reads after this returns is at least as new as what
    /// a notifier that missed the waiter had stored before notifying.
    pub fn insert(&mut self) {
        let mut entries = self.queue.entries();
        if self.entry.inserted.swap(true, Ordering::AcqRel) {
            return;
        }
        *self
            .entry
            .signaled
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = false;
        entries.push(Arc::clone(&self.entry));
        self.queue.len.store(entries.len(), Ordering::Release);
        drop(entries);
        fence(Ordering::SeqCst);
    }

    /// Removes the waiter from the queue. No-op when it was already removed.
    pub fn remove(&mut self) {
        let mut entries = self.queue.entries();
        if !self.entry.inserted.swap(false, Ordering::AcqRel) {
            return;
        }
        entries.retain(|entry| !Arc::ptr_eq(entry, &self.entry));
        self.queue.len.store(entries.len(), Ordering::Release);
    }

    /// Blocks until notified or until `timeout` elapses.
    ///
    /// Returns `true` when a notification arrived. A waiter that is not
    /// inserted returns immediately.
    pub fn wait(&self, timeout: Option<Duration>) -> bool {
        let signaled = self
            .entry
            .signaled
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if !*signaled && !self.is_inserted() {
            return false;
        }
        match timeout {
            None => {
                let signaled = self
                    .entry
                    .wake
                    .wait_while(signaled, |signaled| !*signaled)
                    .unwrap_or_else(PoisonError::into_inner);
                *signaled
            }
            Some(timeout) => {
                let (signaled, _) = self
                    .entry
                    .wake
                    .wait_timeout_while(signaled, timeout, |signaled| !*signaled)
                    .unwrap_or_else(PoisonError::into_inner);
                *signaled
            }
        }
    }
}

impl Drop for Waiter<'_> {
    fn drop(&mut self) {
        self.remove();
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::{Arc, Barrier};
    use std::thread;
    use std::time::Duration;

    use super::{WaitQueue, Waiter};
    use crate::GuestAddr;

    #[test]
    fn insert_and_remove_happen_once() {
        let queue = WaitQueue::new();
        let mut waiter = Waiter::new(&queue, GuestAddr(0x1000), 7, 42);
        assert!(!waiter.is_inserted());
        waiter.insert();
        waiter.insert();
        assert_eq!(queue.len(), 1);
        assert_eq!(waiter.stamp(), 7);
        assert_eq!(waiter.data(), 42);
        assert_eq!(waiter.owner(), thread::current().id());

        waiter.remove();
        waiter.remove();
        assert!(queue.is_empty());
    }

    #[test]
    fn notify_only_wakes_overlapping_lines() {
        let queue = WaitQueue::new();
        let mut near = Waiter::new(&queue, GuestAddr(0x1010), 0, 0);
        let mut far = Waiter::new(&queue, GuestAddr(0x1080), 0, 0);
        near.insert();
        far.insert();

        assert_eq!(queue.notify(GuestAddr(0x1000), 0x80), 1);
        assert!(!near.is_inserted());
        assert!(far.is_inserted());
        assert!(near.wait(Some(Duration::from_millis(1))));

        assert_eq!(queue.notify(GuestAddr(0x10FF), 1), 1);
        assert!(queue.is_empty());
        assert_eq!(queue.notify(GuestAddr(0x1000), 0x1000), 0);
    }

    #[test]
    fn dropped_waiter_leaves_the_queue() {
        let queue = WaitQueue::new();
        {
            let mut waiter = Waiter::new(&queue, GuestAddr(0x2000), 0, 0);
            waiter.insert();
            assert_eq!(queue.len(), 1);
        }
        assert!(queue.is_empty());
        assert_eq!(queue.notify_all(), 0);
    }

    #[test]
    fn wait_times_out_without_notification() {
        let queue = WaitQueue::new();
        let mut waiter = Waiter::new(&queue, GuestAddr(0x3000), 0, 0);
        waiter.insert();
        assert!(!waiter.wait(Some(Duration::from_millis(10))));
        assert!(waiter.is_inserted());
    }

    #[test]
    fn blocked_thread_is_woken_by_notify_all() {
        let queue = Arc::new(WaitQueue::new());
        let blocked = {
            let queue = Arc::clone(&queue);
            thread::spawn(move || {
                let mut waiter = Waiter::new(&queue, GuestAddr(0x4000), 0, 0);
                waiter.insert();
                waiter.wait(None)
            })
        };
        while queue.is_empty() {
            thread::yield_now();
        }
        assert_eq!(queue.notify_all(), 1);
        assert!(blocked.join().expect("waiter thread"));
    }

    #[test]
    fn waiter_sees_either_the_store_or_the_notification() {
        let queue = Arc::new(WaitQueue::new());
        for _ in 0..2_000 {
            let changed = Arc::new(AtomicBool::new(false));
            let barrier = Arc::new(Barrier::new(2));
            let sleeper = {
                let queue = Arc::clone(&queue);
                let changed = Arc::clone(&changed);
                let barrier = Arc::clone(&barrier);
                thread::spawn(move || {
                    let mut waiter = Waiter::new(&queue, GuestAddr(0x5000), 0, 0);
                    barrier.wait();
                    waiter.insert();
                    changed.load(Ordering::Relaxed) || waiter.wait(Some(Duration::from_secs(5)))
                })
            };
            barrier.wait();
            changed.store(true, Ordering::Relaxed);
            queue.notify(GuestAddr(0x5000), 1);
            assert!(sleeper.join().expect("sleeper"));
        }
        assert!(queue.is_empty());
    }
}
