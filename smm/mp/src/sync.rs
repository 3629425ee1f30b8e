//! Synchronization primitives
//!
//! The raw building blocks of the rendezvous protocol: three compare-exchange
//! operations over a shared 32-bit counter, and a test-and-set spin lock.
//! All orderings are sequentially consistent, every retry issues a CPU pause
//! hint.

use core::sync::atomic::{AtomicU32, Ordering};

/// Sentinel stored by [`lockdown_semaphore`]. A locked-down counter rejects
/// further check-ins until the BSP resets it.
pub const SEMAPHORE_LOCKED: u32 = u32::MAX;

/// Properties of the spin locks handed out by this module: each lock wants a
/// private cache line.
pub fn spin_lock_properties() -> usize {
    crate::config::CACHE_LINE_SIZE
}

/// Busy-waits until the semaphore is non-zero, then decrements it.
///
/// Returns the decremented value.
pub fn wait_for_semaphore(sem: &AtomicU32) -> u32 {
    loop {
        let value = sem.load(Ordering::SeqCst);
        if value != 0
            && sem
                .compare_exchange(value, value - 1, Ordering::SeqCst, Ordering::SeqCst)
                .is_ok()
        {
            return value - 1;
        }

        core::hint::spin_loop();
    }
}

/// Increments the semaphore, unless it is locked down.
///
/// Returns the incremented value, or 0 when the semaphore holds the lock-down
/// sentinel: the increment must not wrap into [`SEMAPHORE_LOCKED`], so a
/// locked semaphore is left untouched and the wrapped value 0 tells the
/// caller that enrollment is over.
pub fn release_semaphore(sem: &AtomicU32) -> u32 {
    loop {
        let value = sem.load(Ordering::SeqCst);
        if value.wrapping_add(1) == 0 {
            return 0;
        }
        if sem
            .compare_exchange(value, value + 1, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
        {
            return value + 1;
        }

        core::hint::spin_loop();
    }
}

/// Unconditionally swaps the semaphore to [`SEMAPHORE_LOCKED`].
///
/// Returns the previous value.
pub fn lockdown_semaphore(sem: &AtomicU32) -> u32 {
    loop {
        let value = sem.load(Ordering::SeqCst);
        if sem
            .compare_exchange(value, SEMAPHORE_LOCKED, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
        {
            return value;
        }

        core::hint::spin_loop();
    }
}

// ———————————————————————————————— Spin Lock ———————————————————————————————— //

const RELEASED: u32 = 0;
const HELD: u32 = 1;

/// A test-and-set spin lock.
///
/// Unlike a mutex this lock guards no data: the rendezvous protocol uses it
/// as a cross-processor flag (a CPU's `busy` lock is held exactly while a
/// dispatch is in flight on it), so acquire and release may happen on
/// different processors. The all-zero bit pattern is a valid released lock,
/// which the semaphore pool relies on.
#[derive(Default)]
pub struct SpinLock(AtomicU32);

impl SpinLock {
    pub const fn new() -> Self {
        Self(AtomicU32::new(RELEASED))
    }

    pub fn acquire(&self) {
        while !self.try_acquire() {
            core::hint::spin_loop();
        }
    }

    pub fn try_acquire(&self) -> bool {
        self.0
            .compare_exchange(RELEASED, HELD, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
    }

    pub fn release(&self) {
        self.0.store(RELEASED, Ordering::SeqCst);
    }

    pub fn is_held(&self) -> bool {
        self.0.load(Ordering::SeqCst) == HELD
    }

    /// Forces the lock back to the released state, regardless of any owner.
    ///
    /// Used when a processor checks in for a new SMI and its `busy` lock may
    /// still carry the state of the previous run.
    pub fn reset(&self) {
        self.0.store(RELEASED, Ordering::SeqCst);
    }
}

// ————————————————————————————————— Tests —————————————————————————————————— //

#[cfg(test)]
mod test {
    use std::sync::Arc;

    use super::*;

    #[test]
    fn release_then_wait_round_trips() {
        let sem = AtomicU32::new(0);
        assert_eq!(release_semaphore(&sem), 1);
        assert_eq!(release_semaphore(&sem), 2);
        assert_eq!(wait_for_semaphore(&sem), 1);
        assert_eq!(wait_for_semaphore(&sem), 0);
    }

    #[test]
    fn release_on_locked_semaphore_returns_zero_and_keeps_sentinel() {
        let sem = AtomicU32::new(SEMAPHORE_LOCKED);
        assert_eq!(release_semaphore(&sem), 0);
        assert_eq!(sem.load(Ordering::SeqCst), SEMAPHORE_LOCKED);
    }

    #[test]
    fn lockdown_returns_previous_value() {
        let sem = AtomicU32::new(3);
        assert_eq!(lockdown_semaphore(&sem), 3);
        assert_eq!(sem.load(Ordering::SeqCst), SEMAPHORE_LOCKED);
    }

    #[test]
    fn wait_blocks_until_released() {
        let sem = Arc::new(AtomicU32::new(0));
        let releaser = {
            let sem = Arc::clone(&sem);
            std::thread::spawn(move || {
                std::thread::sleep(std::time::Duration::from_millis(20));
                release_semaphore(&sem);
            })
        };

        assert_eq!(wait_for_semaphore(&sem), 0);
        releaser.join().unwrap();
    }

    #[test]
    fn spin_lock_is_exclusive() {
        let lock = SpinLock::new();
        assert!(!lock.is_held());
        assert!(lock.try_acquire());
        assert!(lock.is_held());
        assert!(!lock.try_acquire());
        lock.release();
        assert!(lock.try_acquire());
        lock.reset();
        assert!(!lock.is_held());
    }
}
