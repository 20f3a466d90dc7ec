//! Wait/notify suite: wakeups from stores, deallocation and protection changes.

#![allow(clippy::pedantic, clippy::nursery)]

use std::sync::Arc;
use std::thread;
use std::time::Duration;

use bitflags as _;
use log as _;
use memmap2 as _;
use proptest as _;
use rstest::rstest;
#[cfg(feature = "serde")]
use serde as _;
use thiserror as _;
use vm_core::{GuestAddr, Location, PageFlags, Vm, VmConfig, WaitOutcome};

const LONG: Option<Duration> = Some(Duration::from_secs(10));

fn session_with_page() -> (Arc<Vm>, GuestAddr) {
    let vm = Vm::new(VmConfig::compact()).expect("compact session");
    let addr = vm
        .alloc(0x2000, Location::Main, 0x1000, None)
        .expect("alloc");
    (Arc::new(vm), addr)
}

fn spawn_waiter(vm: &Arc<Vm>, addr: GuestAddr) -> thread::JoinHandle<WaitOutcome> {
    let vm = Arc::clone(vm);
    thread::spawn(move || vm.wait(None, addr, LONG).expect("wait"))
}

fn wait_for_waiters(vm: &Vm, count: usize) {
    while vm.waiters().len() < count {
        thread::yield_now();
    }
}

#[derive(Debug, Clone, Copy)]
enum Wake {
    StoreConditional,
    Dealloc,
    Protect,
    NotifyAll,
}

#[rstest]
#[case(Wake::StoreConditional)]
#[case(Wake::Dealloc)]
#[case(Wake::Protect)]
#[case(Wake::NotifyAll)]
fn structural_and_data_changes_wake_waiters(#[case] wake: Wake) {
    let (vm, addr) = session_with_page();
    let waiter = spawn_waiter(&vm, GuestAddr(addr.0 + 0x40));
    wait_for_waiters(&vm, 1);

    match wake {
        Wake::StoreConditional => {
            let (_, reservation) = vm.load_reserved_u32(addr).expect("load");
            assert_eq!(vm.store_conditional_u32(&reservation, 1), Ok(true));
        }
        Wake::Dealloc => {
            vm.dealloc(addr, Some(Location::Main)).expect("dealloc");
        }
        Wake::Protect => {
            assert_eq!(
                vm.page_protect(
                    addr,
                    0x1000,
                    PageFlags::empty(),
                    PageFlags::EXECUTABLE,
                    PageFlags::empty()
                ),
                Ok(true)
            );
        }
        Wake::NotifyAll => {
            assert_eq!(vm.notify_all(), 1);
        }
    }

    let outcome = waiter.join().expect("waiter");
    match wake {
        // The store may land between insertion and the waiter's re-check.
        Wake::StoreConditional => assert!(matches!(
            outcome,
            WaitOutcome::Notified | WaitOutcome::Changed
        )),
        Wake::Dealloc | Wake::Protect | Wake::NotifyAll => {
            assert_eq!(outcome, WaitOutcome::Notified);
        }
    }
    assert!(vm.waiters().is_empty());
}

#[test]
fn notify_on_another_line_leaves_waiter_blocked() {
    let (vm, addr) = session_with_page();
    let waiter = spawn_waiter(&vm, addr);
    wait_for_waiters(&vm, 1);

    assert_eq!(vm.notify(GuestAddr(addr.0 + 0x80), 0x80), 0);
    assert_eq!(vm.waiters().len(), 1);

    assert_eq!(vm.notify(GuestAddr(addr.0 + 0x7F), 1), 1);
    assert_eq!(waiter.join().expect("waiter"), WaitOutcome::Notified);
}

#[test]
fn one_notification_wakes_every_waiter_on_the_line() {
    let (vm, addr) = session_with_page();
    let waiters: Vec<_> = (0..3)
        .map(|offset| spawn_waiter(&vm, GuestAddr(addr.0 + offset * 8)))
        .collect();
    wait_for_waiters(&vm, 3);

    assert_eq!(vm.notify(addr, 4), 3);
    for waiter in waiters {
        assert_eq!(waiter.join().expect("waiter"), WaitOutcome::Notified);
    }
}

#[test]
fn wait_times_out_when_nothing_happens() {
    let (vm, addr) = session_with_page();
    assert_eq!(
        vm.wait(None, addr, Some(Duration::from_millis(20))),
        Ok(WaitOutcome::TimedOut)
    );
    assert!(vm.waiters().is_empty());
}
