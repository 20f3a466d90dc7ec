//! Reservation engine suite: stamp ordering, conflicts and contended updates.

#![allow(clippy::pedantic, clippy::nursery)]

use std::sync::{Arc, Barrier};
use std::thread;

use bitflags as _;
use log as _;
use memmap2 as _;
use proptest::prelude::*;
use rstest as _;
#[cfg(feature = "serde")]
use serde as _;
use thiserror as _;
use vm_core::{GuestAddr, Location, Vm, VmConfig};

fn session_with_page() -> (Vm, GuestAddr) {
    let vm = Vm::new(VmConfig::compact()).expect("compact session");
    let addr = vm
        .alloc(0x4000, Location::Main, 0x1000, None)
        .expect("alloc");
    (vm, addr)
}

#[test]
fn concurrent_acquirers_detect_a_single_update() {
    let (vm, addr) = session_with_page();
    let first = vm.reservation_acquire(addr).expect("first");
    let second = vm.reservation_acquire(addr).expect("second");
    assert_eq!(first, second);

    let updated = vm.reservation_update(addr).expect("update");
    assert!(updated > first);
    assert_ne!(vm.reservation_acquire(addr).expect("fresh"), second);
}

#[test]
fn racing_store_conditionals_have_one_winner() {
    let (vm, addr) = session_with_page();
    let vm = Arc::new(vm);
    let barrier = Arc::new(Barrier::new(4));

    let (_, reservation) = vm.load_reserved_u64(addr).expect("load");
    let handles: Vec<_> = (1..=4_u64)
        .map(|value| {
            let vm = Arc::clone(&vm);
            let barrier = Arc::clone(&barrier);
            thread::spawn(move || {
                barrier.wait();
                vm.store_conditional_u64(&reservation, value).expect("store")
            })
        })
        .collect();
    let winners = handles
        .into_iter()
        .map(|handle| handle.join().expect("writer"))
        .filter(|won| *won)
        .count();
    assert_eq!(winners, 1);
    assert_ne!(vm.memory().load_u64(addr), Ok(0));
}

#[test]
fn store_conditionals_on_one_line_have_one_winner_per_round() {
    const ROUNDS: usize = 20_000;

    let (vm, addr) = session_with_page();
    let vm = Arc::new(vm);
    let barrier = Arc::new(Barrier::new(2));
    let handles: Vec<_> = [0_u32, 8]
        .into_iter()
        .map(|offset| {
            let vm = Arc::clone(&vm);
            let barrier = Arc::clone(&barrier);
            thread::spawn(move || {
                let word = GuestAddr(addr.0 + offset);
                (0..ROUNDS)
                    .map(|_| {
                        let (value, reservation) = vm.load_reserved_u64(word).expect("load");
                        barrier.wait();
                        let won = vm
                            .store_conditional_u64(&reservation, value + 1)
                            .expect("store");
                        barrier.wait();
                        (reservation.stamp(), won)
                    })
                    .collect::<Vec<_>>()
            })
        })
        .collect();
    let mut results = handles
        .into_iter()
        .map(|handle| handle.join().expect("writer"));
    let first = results.next().expect("first writer");
    let second = results.next().expect("second writer");

    for (round, ((stamp_a, won_a), (stamp_b, won_b))) in first.iter().zip(&second).enumerate() {
        assert_eq!(stamp_a, stamp_b, "round {round} reserved different stamps");
        assert!(won_a ^ won_b, "round {round}: won {won_a} and {won_b}");
    }
    let total = vm.memory().load_u64(addr).expect("first word")
        + vm.memory().load_u64(GuestAddr(addr.0 + 8)).expect("second word");
    assert_eq!(total, ROUNDS as u64);
}

#[test]
fn contended_increments_are_never_lost() {
    const THREADS: u32 = 4;
    const INCREMENTS: u32 = 500;

    let (vm, addr) = session_with_page();
    let vm = Arc::new(vm);
    let handles: Vec<_> = (0..THREADS)
        .map(|_| {
            let vm = Arc::clone(&vm);
            thread::spawn(move || {
                for _ in 0..INCREMENTS {
                    loop {
                        let (value, reservation) = vm.load_reserved_u32(addr).expect("load");
                        if vm
                            .store_conditional_u32(&reservation, value + 1)
                            .expect("store")
                        {
                            break;
                        }
                    }
                }
            })
        })
        .collect();
    for handle in handles {
        handle.join().expect("incrementer");
    }
    assert_eq!(vm.memory().load_u32(addr), Ok(THREADS * INCREMENTS));
}

#[test]
fn reservations_require_aligned_words() {
    let (vm, addr) = session_with_page();
    assert!(vm.load_reserved_u32(GuestAddr(addr.0 + 2)).is_err());
    assert!(vm.load_reserved_u64(GuestAddr(addr.0 + 4)).is_err());
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    #[test]
    fn updates_are_line_local_and_increasing(target in 0_u32..0x4000, other in 0_u32..0x4000) {
        let (vm, base) = session_with_page();
        let target = GuestAddr(base.0 + target);
        let other = GuestAddr(base.0 + other);
        let observed = vm.reservation_acquire(target).expect("acquire");

        let bumped = vm.reservation_update(other).expect("update other");
        let same_line = target.line_base() == other.line_base();
        if same_line {
            prop_assert_eq!(vm.reservation_acquire(target).expect("reacquire"), bumped);
        } else {
            prop_assert_eq!(vm.reservation_acquire(target).expect("reacquire"), observed);
        }

        let before = vm.reservation_acquire(target).expect("before");
        let stamp = vm.reservation_update(target).expect("update");
        prop_assert!(stamp > before);
        prop_assert_eq!(vm.reservation_acquire(target).expect("after"), stamp);
    }
}
