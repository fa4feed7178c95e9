//! Minimal tour of the scoring engine: set, increment, decay, persist.
//!
//! Run with `cargo run --example basic`.

use ipscore_core::{ScoreEngine, Error};
use std::ops::ControlFlow;

fn main() -> Result<(), Error> {
    let engine = ScoreEngine::new()?;

    // Score a few addresses the way a detection pipeline would.
    engine.set_str("192.168.1.100", 50);
    engine.incr_str("192.168.1.100", 25);
    engine.incr_str("10.0.0.5", 10);
    engine.set_str("203.0.113.9", -40); // allow-listed peer

    println!("192.168.1.100 -> {}", engine.get_str("192.168.1.100"));
    println!("10.0.0.5      -> {}", engine.get_str("10.0.0.5"));
    println!("unknown host  -> {}", engine.get_str("198.51.100.1"));

    // Feed a small threat-intel batch.
    let feed = b"198.51.100.7,500\n198.51.100.8,+250\n# stale entry below\nbad line\n";
    let result = engine.bulk_load_buffer(feed);
    println!(
        "bulk: {} lines, {} sets, {} updates, {} errors",
        result.lines_processed, result.sets, result.updates, result.parse_errors
    );

    // Periodic maintenance: fade everything by 10%, drop the noise floor.
    let modified = engine.decay(0.9, 5);
    println!("decay touched {modified} scores, {} remain", engine.count());

    // Snapshot, then prove the restart path round-trips.
    let path = std::env::temp_dir().join("ipscore-basic.bin");
    engine.save(&path)?;

    let restored = ScoreEngine::new()?;
    restored.load(&path)?;
    println!("restored {} scores:", restored.count());
    restored.for_each(|ip, score| {
        println!("  {} = {}", ipscore_core::format_ipv4(ip), score);
        ControlFlow::Continue(())
    });

    let _ = std::fs::remove_file(&path);
    Ok(())
}
