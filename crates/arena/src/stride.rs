//! Stride Arena
//!
//! A single zeroed allocation viewed as an array of fixed-stride slots. Each
//! slot is wide enough to keep its content on a private cache line, which is
//! what the rendezvous semaphores need to avoid false sharing.

use alloc::alloc::{alloc_zeroed, dealloc, handle_alloc_error, Layout};
use core::ptr::NonNull;

pub struct StrideArena {
    ptr: NonNull<u8>,
    layout: Layout,
    stride: usize,
    slots: usize,
}

impl StrideArena {
    /// Allocates a zeroed arena of `slots` slots, `stride` bytes each.
    ///
    /// The stride must be a power of two so that it can double as the
    /// allocation alignment.
    pub fn new(slots: usize, stride: usize) -> Self {
        assert!(slots > 0, "Stride arena must have at least one slot");
        assert!(
            stride.is_power_of_two(),
            "Stride must be a power of two, got {}",
            stride
        );

        let layout = Layout::from_size_align(slots * stride, stride)
            .expect("Invalid stride arena layout");
        let raw = unsafe { alloc_zeroed(layout) };
        let Some(ptr) = NonNull::new(raw) else {
            handle_alloc_error(layout);
        };

        Self {
            ptr,
            layout,
            stride,
            slots,
        }
    }

    pub fn stride(&self) -> usize {
        self.stride
    }

    pub fn slots(&self) -> usize {
        self.slots
    }

    /// Returns a typed view of the slot at `idx`.
    ///
    /// ## Safety
    ///
    /// The caller must only instantiate `T` with types for which the all-zero
    /// bit pattern is a valid value (the arena is zero-initialized), and must
    /// use the same `T` for every access to a given slot. Types with interior
    /// mutability (atomics, locks built on them) are the intended use; plain
    /// types must not be accessed concurrently.
    pub unsafe fn slot<T>(&self, idx: usize) -> &T {
        assert!(idx < self.slots, "Slot index {} out of bounds", idx);
        assert!(core::mem::size_of::<T>() <= self.stride);
        assert!(core::mem::align_of::<T>() <= self.stride);
        &*(self.ptr.as_ptr().add(idx * self.stride) as *const T)
    }
}

// SAFETY: the arena is an owned allocation, all accesses go through shared
// references to interior-mutable slot types as required by `slot`.
unsafe impl Send for StrideArena {}
unsafe impl Sync for StrideArena {}

impl Drop for StrideArena {
    fn drop(&mut self) {
        unsafe { dealloc(self.ptr.as_ptr(), self.layout) };
    }
}

// ————————————————————————————————— Tests —————————————————————————————————— //

#[cfg(test)]
mod test {
    use core::sync::atomic::{AtomicU32, Ordering};

    use super::*;

    #[test]
    fn slots_are_zeroed_and_disjoint() {
        let arena = StrideArena::new(4, 64);

        let a = unsafe { arena.slot::<AtomicU32>(0) };
        let b = unsafe { arena.slot::<AtomicU32>(1) };
        assert_eq!(a.load(Ordering::SeqCst), 0);
        assert_eq!(b.load(Ordering::SeqCst), 0);

        a.store(7, Ordering::SeqCst);
        assert_eq!(b.load(Ordering::SeqCst), 0);

        let a_addr = a as *const _ as usize;
        let b_addr = b as *const _ as usize;
        assert_eq!(b_addr - a_addr, 64);
    }

    #[test]
    #[should_panic]
    fn out_of_bounds_slot_panics() {
        let arena = StrideArena::new(2, 64);
        let _ = unsafe { arena.slot::<AtomicU32>(2) };
    }
}
