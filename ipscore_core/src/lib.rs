//! Concurrent in-memory scoring engine for IPv4 addresses.
//!
//! Keys are 32-bit IPv4 addresses, values are saturating signed 16-bit
//! scores. The store is tuned for a sparse key population and a high miss
//! rate: a 2 MiB bitmap rejects most lookups on a single acquire load, and
//! hits resolve through two pointer hops into a cache-line-aligned /24
//! block. Reads never lock; writes serialize per block.

pub mod archive;
pub mod bulk;
pub mod constants;
pub mod errors;
pub mod helpers;
pub mod lock;
pub mod platform;
pub mod telemetry;
pub mod types;

pub use bulk::BulkResult;
pub use errors::{Error, ErrorCode};
pub use helpers::{format_ipv4, format_ipv4_into, parse_ipv4};
pub use types::ScoreEngine;

use crate::constants::*;
use crate::helpers::{block_idx, compose_ip, host_idx, prefix16, prefix24, sat_add};
use crate::types::{Bitmap, Block, BlockRow};
use log::{debug, info, warn};
use metrics::{counter, gauge};
use once_cell::sync::OnceCell;
use std::alloc::{alloc, dealloc, Layout};
use std::mem::size_of;
use std::ops::ControlFlow;
use std::ptr::{self, NonNull};
use std::sync::atomic::{AtomicPtr, AtomicU64, AtomicUsize, Ordering};

/// Semantic version of the library.
pub fn version() -> &'static str {
    env!("CARGO_PKG_VERSION")
}

// ===== Compile-time assertions for the block geometry =====
const _: () = assert!(std::mem::align_of::<Block>() % CACHE_LINE == 0);
const _: () = assert!(std::mem::size_of::<Block>() % CACHE_LINE == 0);
const _: () = assert!(BITMAP_BITS == PREFIX16_COUNT * BLOCKS_PER_ROW);

/// Move `value` to a fresh heap allocation without aborting on failure.
///
/// Returns `None` when the allocator refuses, so steady-state OOM degrades
/// write operations into no-ops instead of killing the process.
fn alloc_published<T>(value: T) -> Option<NonNull<T>> {
    let layout = Layout::new::<T>();
    // SAFETY: T is sized and non-zero-sized (Block / BlockRow).
    let raw = unsafe { alloc(layout) as *mut T };
    let ptr = NonNull::new(raw)?;
    // SAFETY: raw is valid for writes of T.
    unsafe { ptr.as_ptr().write(value) };
    Some(ptr)
}

impl ScoreEngine {
    // ---- logging bootstrapper ------------------------------------------
    fn ensure_logging() {
        static INIT: OnceCell<()> = OnceCell::new();
        INIT.get_or_init(|| {
            // Fallback: plain env_logger unless the host already installed
            // a logger.
            let _ = env_logger::builder()
                .format_timestamp(None)
                .is_test(std::env::var("RUST_TEST_THREADS").is_ok())
                .try_init();
        });
    }

    /// Create an empty engine.
    ///
    /// Allocates the bitmap and the row-pointer directory up front (~2.5
    /// MiB); blocks come later, on first write into their /24.
    pub fn new() -> Result<Self, Error> {
        Self::ensure_logging();

        let bitmap = Bitmap::new()?;

        let mut rows = Vec::new();
        rows.try_reserve_exact(PREFIX16_COUNT)
            .map_err(|_| Error::OutOfMemory)?;
        rows.resize_with(PREFIX16_COUNT, || AtomicPtr::new(ptr::null_mut()));

        let mut locks = Vec::with_capacity(ALLOC_LOCK_STRIPES);
        locks.resize_with(ALLOC_LOCK_STRIPES, || crate::lock::BlockLock::new(()));

        let baseline = size_of::<Self>()
            + BITMAP_BYTES
            + PREFIX16_COUNT * size_of::<AtomicPtr<BlockRow>>();
        debug!("score engine created, {} KiB baseline", baseline / 1024);

        Ok(Self {
            bitmap,
            rows: rows.into_boxed_slice(),
            alloc_locks: locks.into_boxed_slice(),
            score_count: AtomicU64::new(0),
            block_count: AtomicU64::new(0),
            memory_used: AtomicUsize::new(baseline),
        })
    }

    // ---- directory traversal -------------------------------------------

    #[inline]
    pub(crate) fn row(&self, p16: u16) -> Option<&BlockRow> {
        let ptr = self.rows[p16 as usize].load(Ordering::Acquire);
        if ptr.is_null() {
            None
        } else {
            // SAFETY: published rows are freed only in Drop (&mut self), so
            // they outlive any &self borrow.
            Some(unsafe { &*ptr })
        }
    }

    /// Bitmap-gated lookup of the /24 block for `ip`. Never allocates,
    /// never locks.
    #[inline]
    pub(crate) fn block_for(&self, ip: u32) -> Option<&Block> {
        if !self.bitmap.test(prefix24(ip)) {
            return None;
        }
        let row = self.row(prefix16(ip))?;
        let ptr = row.blocks[block_idx(ip) as usize].load(Ordering::Acquire);
        if ptr.is_null() {
            None
        } else {
            // SAFETY: as in `row`; blocks live until Drop.
            Some(unsafe { &*ptr })
        }
    }

    /// Find or allocate the /24 block for `ip`.
    ///
    /// Fast path is two acquire loads; the slow path serializes on the /16
    /// stripe lock and double-checks both levels before publishing.
    /// Returns `None` only on allocation failure.
    fn get_or_alloc_block(&self, ip: u32) -> Option<&Block> {
        let p16 = prefix16(ip);
        let b_idx = block_idx(ip) as usize;
        let p24 = prefix24(ip);

        if let Some(row) = self.row(p16) {
            let ptr = row.blocks[b_idx].load(Ordering::Acquire);
            if !ptr.is_null() {
                // Re-assert the bitmap bit; decay or clear may have dropped
                // it. Test first so the common case stays a read.
                if !self.bitmap.test(p24) {
                    self.bitmap.set(p24);
                }
                // SAFETY: blocks live until Drop.
                return Some(unsafe { &*ptr });
            }
        }

        let stripe = &self.alloc_locks[p16 as usize % ALLOC_LOCK_STRIPES];
        let _stripe_guard = stripe.lock();

        // Re-check the row under the stripe lock.
        let row_slot = &self.rows[p16 as usize];
        let mut row_ptr = row_slot.load(Ordering::Acquire);
        if row_ptr.is_null() {
            let fresh = alloc_published(BlockRow::new())?;
            self.memory_used
                .fetch_add(size_of::<BlockRow>(), Ordering::Relaxed);
            row_slot.store(fresh.as_ptr(), Ordering::Release);
            row_ptr = fresh.as_ptr();
            debug!("allocated /16 row {:#06x}", p16);
        }
        // SAFETY: row_ptr is non-null and was published above or earlier.
        let row = unsafe { &*row_ptr };

        // Re-check the block slot.
        let slot = &row.blocks[b_idx];
        let mut block_ptr = slot.load(Ordering::Acquire);
        if block_ptr.is_null() {
            let fresh = alloc_published(Block::new())?;
            self.block_count.fetch_add(1, Ordering::Relaxed);
            self.memory_used
                .fetch_add(size_of::<Block>(), Ordering::Relaxed);
            counter!("ipscore_blocks_allocated_total").increment(1);
            slot.store(fresh.as_ptr(), Ordering::Release);
            block_ptr = fresh.as_ptr();
        }
        self.bitmap.set(p24);

        // SAFETY: block_ptr is non-null; blocks live until Drop.
        Some(unsafe { &*block_ptr })
    }

    // ---- score operations (u32 keys) -----------------------------------

    /// Current score for `ip`, zero when absent.
    #[inline]
    pub fn get(&self, ip: u32) -> i16 {
        match self.block_for(ip) {
            Some(block) => block.scores[host_idx(ip) as usize].load(Ordering::Acquire),
            None => 0,
        }
    }

    /// Like [`get`](Self::get) but distinguishes "stored score" from
    /// "absent or zero": `None` means no non-zero score exists for `ip`.
    pub fn get_present(&self, ip: u32) -> Option<i16> {
        let block = self.block_for(ip)?;
        let score = block.scores[host_idx(ip) as usize].load(Ordering::Acquire);
        if score == 0 {
            None
        } else {
            Some(score)
        }
    }

    /// Store `score` for `ip`, returning the previous value (zero for a new
    /// entry). A zero store is equivalent to a delete. Values below the
    /// score floor clamp to it so -32768 is never observable.
    pub fn set(&self, ip: u32, score: i16) -> i16 {
        let score = score.max(SCORE_MIN);
        let Some(block) = self.get_or_alloc_block(ip) else {
            warn!("set: block allocation failed, dropping write for {ip:#010x}");
            return 0;
        };
        let host = host_idx(ip) as usize;

        let _guard = block.lock.lock();
        let old = block.scores[host].load(Ordering::Relaxed);
        block.scores[host].store(score, Ordering::Release);
        if old == 0 && score != 0 {
            block.active_count.fetch_add(1, Ordering::Relaxed);
            self.score_count.fetch_add(1, Ordering::Relaxed);
        } else if old != 0 && score == 0 {
            block.active_count.fetch_sub(1, Ordering::Relaxed);
            self.score_count.fetch_sub(1, Ordering::Relaxed);
        }
        old
    }

    /// Add `delta` to the score for `ip` (saturating), returning the new
    /// value. Delta zero degenerates to a plain read and never allocates.
    pub fn increment(&self, ip: u32, delta: i16) -> i16 {
        if delta == 0 {
            return self.get(ip);
        }
        let Some(block) = self.get_or_alloc_block(ip) else {
            warn!("increment: block allocation failed, dropping write for {ip:#010x}");
            return 0;
        };
        let host = host_idx(ip) as usize;

        let _guard = block.lock.lock();
        let old = block.scores[host].load(Ordering::Relaxed);
        let new = sat_add(old, delta);
        block.scores[host].store(new, Ordering::Release);
        if old == 0 && new != 0 {
            block.active_count.fetch_add(1, Ordering::Relaxed);
            self.score_count.fetch_add(1, Ordering::Relaxed);
        } else if old != 0 && new == 0 {
            block.active_count.fetch_sub(1, Ordering::Relaxed);
            self.score_count.fetch_sub(1, Ordering::Relaxed);
        }
        new
    }

    /// Subtract `delta` from the score for `ip` (saturating).
    ///
    /// Defined as `increment(ip, -delta)`; the one unrepresentable negation
    /// (`delta == i16::MIN`) maps to the maximum increment instead.
    #[inline]
    pub fn decrement(&self, ip: u32, delta: i16) -> i16 {
        if delta == i16::MIN {
            self.increment(ip, SCORE_MAX)
        } else {
            self.increment(ip, -delta)
        }
    }

    /// Zero the score for `ip`. Deleting an absent key is a no-op. The
    /// block and its bitmap bit stay behind; the next decay sweep clears
    /// the bit if the block emptied.
    pub fn delete(&self, ip: u32) {
        let Some(block) = self.block_for(ip) else {
            return;
        };
        let host = host_idx(ip) as usize;

        let _guard = block.lock.lock();
        let old = block.scores[host].load(Ordering::Relaxed);
        if old != 0 {
            block.scores[host].store(0, Ordering::Release);
            block.active_count.fetch_sub(1, Ordering::Relaxed);
            self.score_count.fetch_sub(1, Ordering::Relaxed);
        }
    }

    /// Apply [`increment`](Self::increment) to every `(ip, delta)` pair.
    /// Not atomic across keys; observers may see partial progress. Returns
    /// the number of entries attempted.
    pub fn incr_batch(&self, entries: &[(u32, i16)]) -> usize {
        for &(ip, delta) in entries {
            self.increment(ip, delta);
        }
        entries.len()
    }

    // ---- score operations (string keys) --------------------------------

    /// String-keyed [`get`](Self::get); an unparseable address reads as
    /// zero, indistinguishable from an absent key.
    pub fn get_str(&self, ip: &str) -> i16 {
        match helpers::parse_ipv4(ip) {
            Some(key) => self.get(key),
            None => 0,
        }
    }

    /// String-keyed [`set`](Self::set); returns zero for an unparseable
    /// address as well as for a previously absent key.
    pub fn set_str(&self, ip: &str, score: i16) -> i16 {
        match helpers::parse_ipv4(ip) {
            Some(key) => self.set(key, score),
            None => 0,
        }
    }

    /// String-keyed [`increment`](Self::increment).
    pub fn incr_str(&self, ip: &str, delta: i16) -> i16 {
        match helpers::parse_ipv4(ip) {
            Some(key) => self.increment(key, delta),
            None => 0,
        }
    }

    /// String-keyed [`decrement`](Self::decrement).
    pub fn decr_str(&self, ip: &str, delta: i16) -> i16 {
        match helpers::parse_ipv4(ip) {
            Some(key) => self.decrement(key, delta),
            None => 0,
        }
    }

    /// String-keyed [`delete`](Self::delete); unlike the scalar getters
    /// this one reports an unparseable address.
    pub fn delete_str(&self, ip: &str) -> Result<(), Error> {
        let key = helpers::parse_ipv4(ip).ok_or(Error::InvalidArgument)?;
        self.delete(key);
        Ok(())
    }

    // ---- maintenance ---------------------------------------------------

    /// Zero every score and clear every bitmap bit. Blocks and rows stay
    /// allocated for reuse.
    pub fn clear(&self) {
        for p16 in 0..PREFIX16_COUNT {
            let Some(row) = self.row(p16 as u16) else {
                continue;
            };
            for b_idx in 0..BLOCKS_PER_ROW {
                let ptr = row.blocks[b_idx].load(Ordering::Acquire);
                if ptr.is_null() {
                    continue;
                }
                // SAFETY: blocks live until Drop.
                let block = unsafe { &*ptr };
                {
                    let _guard = block.lock.lock();
                    for slot in block.scores.iter() {
                        slot.store(0, Ordering::Relaxed);
                    }
                    block.active_count.store(0, Ordering::Release);
                }
                self.bitmap.clear(((p16 as u32) << 8) | b_idx as u32);
            }
        }
        self.score_count.store(0, Ordering::Release);
        counter!("ipscore_clears_total").increment(1);
        info!("store cleared");
    }

    /// Visit every non-zero score in lexicographic key order.
    ///
    /// The callback returns [`ControlFlow::Break`] to stop early. Slots are
    /// acquire-loaded without block locks, so a concurrent writer's update
    /// may or may not be observed. Do not call back into the engine from
    /// the callback. Returns the number of invocations, including a
    /// breaking one.
    pub fn for_each<F>(&self, mut callback: F) -> u64
    where
        F: FnMut(u32, i16) -> ControlFlow<()>,
    {
        let mut invoked = 0u64;
        for p16 in 0..PREFIX16_COUNT {
            let Some(row) = self.row(p16 as u16) else {
                continue;
            };
            for b_idx in 0..BLOCKS_PER_ROW {
                let prefix = ((p16 as u32) << 8) | b_idx as u32;
                if !self.bitmap.test(prefix) {
                    continue;
                }
                let ptr = row.blocks[b_idx].load(Ordering::Acquire);
                if ptr.is_null() {
                    continue;
                }
                // SAFETY: blocks live until Drop.
                let block = unsafe { &*ptr };
                if block.active_count.load(Ordering::Acquire) == 0 {
                    continue;
                }
                for host in 0..SCORES_PER_BLOCK {
                    let score = block.scores[host].load(Ordering::Acquire);
                    if score == 0 {
                        continue;
                    }
                    invoked += 1;
                    let ip = compose_ip(p16 as u16, b_idx as u8, host as u8);
                    if callback(ip, score).is_break() {
                        return invoked;
                    }
                }
            }
        }
        invoked
    }

    /// Multiply every non-zero score by `factor` (truncating toward zero)
    /// and zero any result whose magnitude is at or below `deadzone`.
    ///
    /// Emptied blocks get their bitmap bit cleared, restoring the fast
    /// negative path. One block lock is held at a time; readers racing the
    /// sweep see pre- or post-decay values per key. A factor outside
    /// [0, 1] is rejected with no effect. Returns the number of modified
    /// slots.
    pub fn decay(&self, factor: f32, deadzone: i16) -> u64 {
        if !(0.0..=1.0).contains(&factor) {
            warn!("decay: factor {factor} outside [0, 1], ignoring sweep");
            return 0;
        }
        let deadzone = deadzone.saturating_abs();
        let mut modified = 0u64;

        for p16 in 0..PREFIX16_COUNT {
            let Some(row) = self.row(p16 as u16) else {
                continue;
            };
            for b_idx in 0..BLOCKS_PER_ROW {
                let prefix = ((p16 as u32) << 8) | b_idx as u32;
                if !self.bitmap.test(prefix) {
                    continue;
                }
                let ptr = row.blocks[b_idx].load(Ordering::Acquire);
                if ptr.is_null() {
                    continue;
                }
                // SAFETY: blocks live until Drop.
                let block = unsafe { &*ptr };

                // Stale bit over an empty block: just re-condition it.
                if block.active_count.load(Ordering::Relaxed) == 0 {
                    self.bitmap.clear(prefix);
                    continue;
                }

                let _guard = block.lock.lock();
                for slot in block.scores.iter() {
                    let old = slot.load(Ordering::Relaxed);
                    if old == 0 {
                        continue;
                    }
                    // f32 → i16 truncates toward zero; the product of an
                    // in-range score and factor ≤ 1 stays in range.
                    let mut new = (old as f32 * factor) as i16;
                    if new.abs() <= deadzone {
                        new = 0;
                    }
                    if new != old {
                        slot.store(new, Ordering::Release);
                        modified += 1;
                        if new == 0 {
                            block.active_count.fetch_sub(1, Ordering::Relaxed);
                            self.score_count.fetch_sub(1, Ordering::Relaxed);
                        }
                    }
                }
                if block.active_count.load(Ordering::Relaxed) == 0 {
                    self.bitmap.clear(prefix);
                }
            }
        }

        counter!("ipscore_decay_modified_total").increment(modified);
        gauge!("ipscore_active_scores").set(self.count() as f64);
        debug!("decay factor={factor} deadzone={deadzone}: {modified} slots modified");
        modified
    }

    // ---- statistics ----------------------------------------------------

    /// Total non-zero scores in the store.
    pub fn count(&self) -> u64 {
        self.score_count.load(Ordering::Relaxed)
    }

    /// Total allocated /24 blocks (blocks are never freed before drop, so
    /// this can exceed the number of currently active blocks).
    pub fn block_count(&self) -> u64 {
        self.block_count.load(Ordering::Relaxed)
    }

    /// Accounted memory in bytes: engine, bitmap, rows, and blocks.
    pub fn memory_usage(&self) -> usize {
        self.memory_used.load(Ordering::Relaxed)
    }
}

impl std::fmt::Debug for ScoreEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ScoreEngine")
            .field("score_count", &self.count())
            .field("block_count", &self.block_count())
            .field("memory_used", &self.memory_usage())
            .finish_non_exhaustive()
    }
}

impl Drop for ScoreEngine {
    fn drop(&mut self) {
        for slot in self.rows.iter() {
            let row_ptr = slot.load(Ordering::Acquire);
            if row_ptr.is_null() {
                continue;
            }
            {
                // SAFETY: exclusive access (&mut self); pointers were
                // created by alloc_published with the matching layouts.
                let row = unsafe { &*row_ptr };
                for block_slot in row.blocks.iter() {
                    let block_ptr = block_slot.load(Ordering::Acquire);
                    if block_ptr.is_null() {
                        continue;
                    }
                    unsafe {
                        ptr::drop_in_place(block_ptr);
                        dealloc(block_ptr as *mut u8, Layout::new::<Block>());
                    }
                }
            }
            unsafe {
                ptr::drop_in_place(row_ptr);
                dealloc(row_ptr as *mut u8, Layout::new::<BlockRow>());
            }
        }
    }
}
