//! Concurrency demo: event threads score traffic while a maintenance
//! thread decays, and readers never block.
//!
//! Run with `cargo run --release --example concurrent`.

use ipscore_core::ScoreEngine;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

fn main() {
    let engine = Arc::new(ScoreEngine::new().expect("engine"));
    let stop = Arc::new(AtomicBool::new(false));
    let writer_threads = num_cpus::get().max(2) - 1;

    // Event ingestion: each thread scores its own slice of address space
    // plus a contended hot key.
    let mut workers = Vec::new();
    for t in 0..writer_threads {
        let engine = Arc::clone(&engine);
        let stop = Arc::clone(&stop);
        workers.push(thread::spawn(move || {
            let mut ops = 0u64;
            let base = 0x0A000000u32 | ((t as u32) << 16);
            while !stop.load(Ordering::Relaxed) {
                let key = base | (ops as u32 & 0xFFFF);
                engine.increment(key, 1);
                engine.increment(0xC0A80001, 1); // hot key, saturates
                let _ = engine.get(key ^ 0x40000000); // guaranteed miss
                ops += 3;
            }
            ops
        }));
    }

    // Maintenance: decay every 100 ms while the writers run.
    let sweeper = {
        let engine = Arc::clone(&engine);
        let stop = Arc::clone(&stop);
        thread::spawn(move || {
            let mut sweeps = 0u32;
            while !stop.load(Ordering::Relaxed) {
                thread::sleep(Duration::from_millis(100));
                engine.decay(0.95, 1);
                sweeps += 1;
            }
            sweeps
        })
    };

    let started = Instant::now();
    thread::sleep(Duration::from_secs(2));
    stop.store(true, Ordering::Relaxed);

    let total_ops: u64 = workers.into_iter().map(|h| h.join().unwrap()).sum();
    let sweeps = sweeper.join().unwrap();
    let secs = started.elapsed().as_secs_f64();

    println!(
        "{writer_threads} writer threads, {total_ops} ops in {secs:.2}s ({:.1} M ops/s)",
        total_ops as f64 / secs / 1e6
    );
    println!("{sweeps} decay sweeps ran alongside");
    println!(
        "hot key 192.168.0.1 = {} (saturated), {} active scores in {} blocks, {:.1} MiB",
        engine.get(0xC0A80001),
        engine.count(),
        engine.block_count(),
        engine.memory_usage() as f64 / (1024.0 * 1024.0)
    );
}
