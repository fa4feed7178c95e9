//! Block-write-lock primitive.
//!
//! Writers serialize per /24 block; readers never touch these locks. The
//! default primitive is a raw spinlock (critical sections are a handful of
//! atomic ops). The `adaptive-mutex` feature substitutes parking_lot's
//! adaptive mutex for virtualized hosts where a preempted spinlock holder
//! stalls every writer behind it. Both go through `lock_api`, so the choice
//! never shows on the data path.

use lock_api::{GuardSend, RawMutex};
use std::sync::atomic::{AtomicBool, Ordering};

/// Test-and-test-and-set spinlock.
pub struct RawSpinLock {
    locked: AtomicBool,
}

unsafe impl RawMutex for RawSpinLock {
    #[allow(clippy::declare_interior_mutable_const)]
    const INIT: RawSpinLock = RawSpinLock {
        locked: AtomicBool::new(false),
    };

    type GuardMarker = GuardSend;

    #[inline]
    fn lock(&self) {
        while !self.try_lock() {
            // Spin on a plain load so contending cores stay in shared state
            // until the lock is actually released.
            while self.locked.load(Ordering::Relaxed) {
                std::hint::spin_loop();
            }
        }
    }

    #[inline]
    fn try_lock(&self) -> bool {
        self.locked
            .compare_exchange(false, true, Ordering::Acquire, Ordering::Relaxed)
            .is_ok()
    }

    #[inline]
    unsafe fn unlock(&self) {
        self.locked.store(false, Ordering::Release);
    }
}

#[cfg(not(feature = "adaptive-mutex"))]
pub type RawBlockLock = RawSpinLock;

#[cfg(feature = "adaptive-mutex")]
pub type RawBlockLock = parking_lot::RawMutex;

/// The lock guarding writes to one /24 block (and, separately, one
/// allocation stripe). Holds no data; the protected state is the block's
/// atomic score cells.
pub type BlockLock = lock_api::Mutex<RawBlockLock, ()>;

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn try_lock_excludes() {
        let lock = BlockLock::new(());
        let g = lock.lock();
        assert!(lock.try_lock().is_none());
        drop(g);
        assert!(lock.try_lock().is_some());
    }

    #[test]
    fn spinlock_serializes_counter() {
        let lock = Arc::new(BlockLock::new(()));
        let counter = Arc::new(std::sync::atomic::AtomicU64::new(0));
        let mut handles = vec![];
        for _ in 0..4 {
            let lock = Arc::clone(&lock);
            let counter = Arc::clone(&counter);
            handles.push(thread::spawn(move || {
                for _ in 0..10_000 {
                    let _g = lock.lock();
                    let v = counter.load(Ordering::Relaxed);
                    counter.store(v + 1, Ordering::Relaxed);
                }
            }));
        }
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(counter.load(Ordering::Relaxed), 40_000);
    }
}
