//! Throughput harness for the reservation engine and the concurrency gate.
//!
//! Measures load-reserve/store-conditional throughput with and without
//! contention, and allocation churn while passive execution threads keep
//! polling their safepoint.
//!
//! ## Usage
//!
//! ```sh
//! cargo run -p vm-core --release --example reservation_contention
//! ```
//!
//! ## Metrics
//!
//! - Successful conditional stores per second
//! - Failed conditional stores (lost reservations) per second
//! - Allocation/deallocation pairs per second under passive load

#![allow(clippy::pedantic)]

use bitflags as _;
use log as _;
use memmap2 as _;
use proptest as _;
use rstest as _;
#[cfg(feature = "serde")]
use serde as _;
use thiserror as _;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{mpsc, Arc};
use std::thread;
use std::time::{Duration, Instant};

use vm_core::{GuestAddr, Location, ThreadCtl, Vm, VmConfig};

const NUM_THREADS: usize = 4;

#[derive(Debug, Clone, Copy)]
struct BenchmarkResult {
    name: &'static str,
    successes_per_second: f64,
    failures_per_second: f64,
}

fn session() -> (Arc<Vm>, GuestAddr) {
    let vm = Vm::new(VmConfig::compact()).expect("compact session");
    let base = vm
        .alloc(0x1_0000, Location::Main, 0x1000, None)
        .expect("benchmark pages");
    (Arc::new(vm), base)
}

fn benchmark_reservations(
    name: &'static str,
    duration: Duration,
    word_for_thread: fn(GuestAddr, usize) -> GuestAddr,
) -> BenchmarkResult {
    let (vm, base) = session();
    let (tx, rx) = mpsc::channel();

    let handles: Vec<_> = (0..NUM_THREADS)
        .map(|index| {
            let tx = tx.clone();
            let vm = Arc::clone(&vm);
            thread::spawn(move || {
                let word = word_for_thread(base, index);
                let mut successes = 0u64;
                let mut failures = 0u64;
                let start = Instant::now();

                while start.elapsed() < duration {
                    let (value, reservation) = vm.load_reserved_u64(word).expect("load");
                    if vm
                        .store_conditional_u64(&reservation, value.wrapping_add(1))
                        .expect("store")
                    {
                        successes += 1;
                    } else {
                        failures += 1;
                    }
                }

                tx.send((successes, failures)).ok();
            })
        })
        .collect();

    for h in handles {
        h.join().ok();
    }
    drop(tx);

    let (successes, failures) = rx
        .into_iter()
        .fold((0u64, 0u64), |(s, f), (ds, df)| (s + ds, f + df));
    let elapsed_secs = duration.as_secs_f64();

    BenchmarkResult {
        name,
        successes_per_second: successes as f64 / elapsed_secs,
        failures_per_second: failures as f64 / elapsed_secs,
    }
}

fn private_lines(base: GuestAddr, index: usize) -> GuestAddr {
    GuestAddr(base.0 + 0x1000 * index as u32)
}

fn shared_line(base: GuestAddr, index: usize) -> GuestAddr {
    GuestAddr(base.0 + 8 * index as u32)
}

fn benchmark_alloc_churn(duration: Duration) -> BenchmarkResult {
    let (vm, base) = session();
    let stop = Arc::new(AtomicBool::new(false));

    let passive: Vec<_> = (0..NUM_THREADS - 1)
        .map(|index| {
            let vm = Arc::clone(&vm);
            let stop = Arc::clone(&stop);
            thread::spawn(move || {
                let ctl = Arc::new(ThreadCtl::new());
                vm.gate().passive_lock(&ctl);
                let word = private_lines(base, index);
                while !stop.load(Ordering::Acquire) {
                    let (value, reservation) = vm.load_reserved_u64(word).expect("load");
                    vm.store_conditional_u64(&reservation, value.wrapping_add(1))
                        .expect("store");
                    vm.gate().check_in(&ctl);
                }
                vm.gate().passive_unlock(&ctl);
            })
        })
        .collect();

    let mut pairs = 0u64;
    let start = Instant::now();
    while start.elapsed() < duration {
        let addr = vm
            .alloc(0x1000, Location::UserSpace, 0x1000, None)
            .expect("alloc");
        vm.dealloc(addr, Some(Location::UserSpace)).expect("dealloc");
        pairs += 1;
    }

    stop.store(true, Ordering::Release);
    for h in passive {
        h.join().ok();
    }

    BenchmarkResult {
        name: "alloc_churn",
        successes_per_second: pairs as f64 / duration.as_secs_f64(),
        failures_per_second: 0.0,
    }
}

fn format_number(n: f64) -> String {
    if n >= 1_000_000.0 {
        format!("{:.2}M", n / 1_000_000.0)
    } else if n >= 1_000.0 {
        format!("{:.2}K", n / 1_000.0)
    } else {
        format!("{:.2}", n)
    }
}

fn print_results(results: &[BenchmarkResult]) {
    println!("\n╔═══════════════════════════════════════════════════════╗");
    println!("║           VM-CORE RESERVATION HARNESS                 ║");
    println!("╠═══════════════════════════════════════════════════════╣");
    println!(
        "║   Threads: {:>5}                                      ║",
        NUM_THREADS
    );
    println!("╠═══════════════════════════════════════════════════════╣");
    println!(
        "║ {:16} │ {:>15} │ {:>16} ║",
        "Benchmark", "Success/sec", "Lost/sec"
    );
    println!("╟──────────────────┼─────────────────┼──────────────────╢");

    for result in results {
        println!(
            "║ {:16} │ {:>15} │ {:>16} ║",
            result.name,
            format_number(result.successes_per_second),
            format_number(result.failures_per_second)
        );
    }

    println!("╚═══════════════════════════════════════════════════════╝");
}

fn main() {
    let warmup = Duration::from_millis(500);
    let benchmark_duration = Duration::from_secs(3);

    println!("Running warmup for {:?}...", warmup);
    let _ = benchmark_reservations("warmup", warmup, private_lines);

    println!("Running benchmarks for {:?} each...\n", benchmark_duration);

    let private = benchmark_reservations("private_lines", benchmark_duration, private_lines);
    let shared = benchmark_reservations("shared_line", benchmark_duration, shared_line);
    let churn = benchmark_alloc_churn(benchmark_duration);

    print_results(&[private, shared, churn]);
}
