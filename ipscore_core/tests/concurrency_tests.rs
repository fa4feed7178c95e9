use ipscore_core::{parse_ipv4, ScoreEngine};
use std::ops::ControlFlow;
use std::sync::{Arc, Barrier};
use std::thread;

#[test]
fn concurrent_increments_on_one_key_linearize() {
    const THREADS: usize = 8;
    const OPS_PER_THREAD: usize = 1_000;

    let engine = Arc::new(ScoreEngine::new().unwrap());
    let barrier = Arc::new(Barrier::new(THREADS));
    let key = parse_ipv4("203.0.113.7").unwrap();

    let mut handles = vec![];
    for _ in 0..THREADS {
        let engine = Arc::clone(&engine);
        let barrier = Arc::clone(&barrier);
        handles.push(thread::spawn(move || {
            barrier.wait();
            for _ in 0..OPS_PER_THREAD {
                engine.increment(key, 1);
            }
        }));
    }
    for h in handles {
        h.join().expect("thread failed");
    }

    assert_eq!(engine.get(key), (THREADS * OPS_PER_THREAD) as i16);
    assert_eq!(engine.count(), 1);
}

#[test]
fn concurrent_increments_saturate_at_max() {
    const THREADS: usize = 8;
    const OPS_PER_THREAD: usize = 5_000; // 40k raw, saturates at 32767

    let engine = Arc::new(ScoreEngine::new().unwrap());
    let barrier = Arc::new(Barrier::new(THREADS));
    let key = parse_ipv4("203.0.113.8").unwrap();

    let mut handles = vec![];
    for _ in 0..THREADS {
        let engine = Arc::clone(&engine);
        let barrier = Arc::clone(&barrier);
        handles.push(thread::spawn(move || {
            barrier.wait();
            for _ in 0..OPS_PER_THREAD {
                engine.increment(key, 1);
            }
        }));
    }
    for h in handles {
        h.join().expect("thread failed");
    }

    assert_eq!(engine.get(key), 32767);
}

#[test]
fn stress_mixed_readers_and_writers() {
    let threads = num_cpus::get().max(4);
    let ops_per_thread = 10_000;
    let engine = Arc::new(ScoreEngine::new().unwrap());
    // random /16 so repeated runs exercise different stripes
    let scatter = (rand::random::<u16>() as u32) << 16;

    let mut handles = vec![];
    for t in 0..threads {
        let engine = Arc::clone(&engine);
        handles.push(thread::spawn(move || {
            // each thread works a disjoint /24 plus a shared hot block
            let base = scatter | ((t as u32) << 8);
            for i in 0..ops_per_thread {
                let key = base | (i % 256) as u32;
                engine.increment(key, 1);
                let _ = engine.get(key);
                // shared miss path: the opposite /16 half is never written
                let _ = engine.get(key ^ 0x8000_0000);
                if i % 3 == 0 {
                    engine.delete(key);
                }
            }
        }));
    }
    for h in handles {
        h.join().expect("thread failed");
    }

    // the aggregate counter must agree with a full walk
    let walked = engine.for_each(|_, _| ControlFlow::Continue(()));
    assert_eq!(walked, engine.count());
}

#[test]
fn contended_allocation_publishes_each_block_once() {
    let threads = 8;
    let engine = Arc::new(ScoreEngine::new().unwrap());
    let barrier = Arc::new(Barrier::new(threads));

    let mut handles = vec![];
    for t in 0..threads {
        let engine = Arc::clone(&engine);
        let barrier = Arc::clone(&barrier);
        handles.push(thread::spawn(move || {
            barrier.wait();
            // all threads race the same 64 fresh /24 blocks
            for b in 0..64u32 {
                engine.set(0x55000000 | (b << 8) | t as u32, 1);
            }
        }));
    }
    for h in handles {
        h.join().expect("thread failed");
    }

    assert_eq!(engine.block_count(), 64);
    assert_eq!(engine.count(), (threads * 64) as u64);
}

#[test]
fn decay_races_writers_without_corrupting_counts() {
    let engine = Arc::new(ScoreEngine::new().unwrap());
    for i in 0..4096u32 {
        engine.set(0x0A000000 + i, 100);
    }

    let writer = {
        let engine = Arc::clone(&engine);
        thread::spawn(move || {
            for i in 0..4096u32 {
                engine.increment(0x0B000000 + i, 50);
            }
        })
    };
    let sweeper = {
        let engine = Arc::clone(&engine);
        thread::spawn(move || {
            for _ in 0..8 {
                engine.decay(0.9, 2);
            }
        })
    };
    writer.join().unwrap();
    sweeper.join().unwrap();

    let walked = engine.for_each(|_, _| ControlFlow::Continue(()));
    assert_eq!(walked, engine.count());
}

#[test]
fn bulk_load_runs_concurrently_with_queries() {
    let engine = Arc::new(ScoreEngine::new().unwrap());
    let mut feed = Vec::new();
    for i in 0..20_000u32 {
        feed.extend_from_slice(
            format!("10.{}.{}.{},+1\n", (i >> 16) & 0xFF, (i >> 8) & 0xFF, i & 0xFF).as_bytes(),
        );
    }

    let loader = {
        let engine = Arc::clone(&engine);
        thread::spawn(move || engine.bulk_load_buffer(&feed))
    };
    let reader = {
        let engine = Arc::clone(&engine);
        thread::spawn(move || {
            let mut nonzero = 0u64;
            for i in 0..20_000u32 {
                if engine.get(0x0A000000 | i) != 0 {
                    nonzero += 1;
                }
            }
            nonzero
        })
    };

    let result = loader.join().unwrap();
    let _ = reader.join().unwrap();
    assert_eq!(result.lines_processed, 20_000);
    assert_eq!(result.parse_errors, 0);
    assert_eq!(engine.count(), 20_000);
}
