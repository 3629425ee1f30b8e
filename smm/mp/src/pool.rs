//! Semaphore Pool
//!
//! One contiguous allocation holding every counter, flag, and lock the
//! rendezvous protocol spins on. Slots are spaced one cache line apart so
//! that processors hammering their own semaphores do not falsely share lines
//! with their neighbors.
//!
//! Layout: 5 global slots (check-in counter, `inside_smm`, `all_cpus_in_sync`
//! and two platform locks), then the per-CPU `busy` locks, then the per-CPU
//! `run` semaphores, then the per-CPU `present` flags.

use core::sync::atomic::{AtomicBool, AtomicU32};

use arena::StrideArena;

use crate::sync::{spin_lock_properties, SpinLock};

const COUNTER: usize = 0;
const INSIDE_SMM: usize = 1;
const ALL_CPUS_IN_SYNC: usize = 2;
const PAGE_FAULT_LOCK: usize = 3;
const CODE_ACCESS_CHECK_LOCK: usize = 4;
const GLOBAL_SLOTS: usize = 5;
const CPU_SLOTS: usize = 3;

pub struct SemaphorePool {
    arena: StrideArena,
    cpus: usize,
}

impl SemaphorePool {
    pub fn new(cpus: usize) -> Self {
        let stride = core::cmp::max(1, spin_lock_properties());
        let slots = GLOBAL_SLOTS + CPU_SLOTS * cpus;
        let arena = StrideArena::new(slots, stride);
        log::info!(
            "SmmCpu: semaphore stride = {:#x}, pool size = {:#x}",
            stride,
            slots * stride
        );
        Self { arena, cpus }
    }

    // All slot types are zero-initialized atomics (or locks built on one), so
    // the zeroed arena starts every semaphore in its idle state.

    pub fn counter(&self) -> &AtomicU32 {
        unsafe { self.arena.slot(COUNTER) }
    }

    pub fn inside_smm(&self) -> &AtomicBool {
        unsafe { self.arena.slot(INSIDE_SMM) }
    }

    pub fn all_cpus_in_sync(&self) -> &AtomicBool {
        unsafe { self.arena.slot(ALL_CPUS_IN_SYNC) }
    }

    /// Lock serializing the SMM page fault handler.
    pub fn page_fault_lock(&self) -> &SpinLock {
        unsafe { self.arena.slot(PAGE_FAULT_LOCK) }
    }

    /// Lock serializing the code access check configuration.
    pub fn code_access_check_lock(&self) -> &SpinLock {
        unsafe { self.arena.slot(CODE_ACCESS_CHECK_LOCK) }
    }

    /// Held while a dispatch is in flight on `cpu`.
    pub fn busy(&self, cpu: usize) -> &SpinLock {
        assert!(cpu < self.cpus);
        unsafe { self.arena.slot(GLOBAL_SLOTS + cpu) }
    }

    /// Ping-pong semaphore between the BSP and `cpu`.
    pub fn run(&self, cpu: usize) -> &AtomicU32 {
        assert!(cpu < self.cpus);
        unsafe { self.arena.slot(GLOBAL_SLOTS + self.cpus + cpu) }
    }

    /// True between the check-in of `cpu` and its final cleanup.
    pub fn present(&self, cpu: usize) -> &AtomicBool {
        assert!(cpu < self.cpus);
        unsafe { self.arena.slot(GLOBAL_SLOTS + 2 * self.cpus + cpu) }
    }
}

// ————————————————————————————————— Tests —————————————————————————————————— //

#[cfg(test)]
mod test {
    use core::sync::atomic::Ordering;

    use super::*;

    #[test]
    fn slots_start_idle() {
        let pool = SemaphorePool::new(2);
        assert_eq!(pool.counter().load(Ordering::SeqCst), 0);
        assert!(!pool.inside_smm().load(Ordering::SeqCst));
        assert!(!pool.all_cpus_in_sync().load(Ordering::SeqCst));
        for cpu in 0..2 {
            assert!(!pool.busy(cpu).is_held());
            assert_eq!(pool.run(cpu).load(Ordering::SeqCst), 0);
            assert!(!pool.present(cpu).load(Ordering::SeqCst));
        }
    }

    #[test]
    fn per_cpu_slots_are_independent() {
        let pool = SemaphorePool::new(4);
        pool.run(1).store(7, Ordering::SeqCst);
        pool.present(2).store(true, Ordering::SeqCst);
        pool.busy(3).acquire();

        assert_eq!(pool.run(0).load(Ordering::SeqCst), 0);
        assert_eq!(pool.run(1).load(Ordering::SeqCst), 7);
        assert!(!pool.present(1).load(Ordering::SeqCst));
        assert!(pool.present(2).load(Ordering::SeqCst));
        assert!(!pool.busy(2).is_held());
        assert!(pool.busy(3).is_held());
    }

    #[test]
    fn slots_are_cache_line_spaced() {
        let pool = SemaphorePool::new(2);
        let a = pool.busy(0) as *const _ as usize;
        let b = pool.busy(1) as *const _ as usize;
        assert_eq!(b - a, spin_lock_properties());
    }
}
