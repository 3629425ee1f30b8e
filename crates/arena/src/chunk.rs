//! Chunked List
//!
//! Append-only storage that grows one fixed-size chunk at a time. Elements
//! are indexed by a flat position and never move once allocated, so a
//! position handed out as a handle stays valid across growth.

use alloc::boxed::Box;
use alloc::vec::Vec;
use core::iter;

use spin::RwLock;

pub struct ChunkList<T> {
    chunks: RwLock<Vec<Box<[T]>>>,
    chunk_size: usize,
}

impl<T: Default> ChunkList<T> {
    pub fn new(chunk_size: usize) -> Self {
        assert!(chunk_size > 0, "Chunk size must be non-zero");
        Self {
            chunks: RwLock::new(Vec::new()),
            chunk_size,
        }
    }

    pub fn chunk_size(&self) -> usize {
        self.chunk_size
    }

    /// Total number of elements currently allocated.
    pub fn capacity(&self) -> usize {
        self.chunks.read().len() * self.chunk_size
    }

    /// Appends one chunk of default-initialized elements and returns the new
    /// capacity. Existing elements keep their address.
    pub fn grow(&self) -> usize {
        let chunk: Box<[T]> = iter::repeat_with(T::default)
            .take(self.chunk_size)
            .collect::<Vec<_>>()
            .into_boxed_slice();

        let mut chunks = self.chunks.write();
        chunks.push(chunk);
        chunks.len() * self.chunk_size
    }

    /// Runs `f` against the element at `idx`.
    ///
    /// Concurrent readers are fine, growth briefly excludes them. Panics on
    /// out-of-bounds access.
    pub fn with<R>(&self, idx: usize, f: impl FnOnce(&T) -> R) -> R {
        let chunks = self.chunks.read();
        let chunk = idx / self.chunk_size;
        let slot = idx % self.chunk_size;
        assert!(chunk < chunks.len(), "Chunk list index {} out of bounds", idx);
        f(&chunks[chunk][slot])
    }
}

// ————————————————————————————————— Tests —————————————————————————————————— //

#[cfg(test)]
mod test {
    use core::sync::atomic::{AtomicU32, Ordering};

    use super::*;

    #[test]
    fn grows_by_whole_chunks() {
        let list: ChunkList<AtomicU32> = ChunkList::new(4);
        assert_eq!(list.capacity(), 0);
        assert_eq!(list.grow(), 4);
        assert_eq!(list.grow(), 8);
        assert_eq!(list.capacity(), 8);
    }

    #[test]
    fn elements_do_not_move_on_growth() {
        let list: ChunkList<AtomicU32> = ChunkList::new(2);
        list.grow();

        list.with(1, |c| c.store(42, Ordering::SeqCst));
        let before = list.with(1, |c| c as *const _ as usize);

        for _ in 0..16 {
            list.grow();
        }

        let after = list.with(1, |c| c as *const _ as usize);
        assert_eq!(before, after);
        assert_eq!(list.with(1, |c| c.load(Ordering::SeqCst)), 42);
    }

    #[test]
    #[should_panic]
    fn out_of_bounds_access_panics() {
        let list: ChunkList<AtomicU32> = ChunkList::new(2);
        list.grow();
        list.with(2, |_| ());
    }
}
