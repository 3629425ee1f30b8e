//! Procedure Tokens
//!
//! A token represents one outstanding non-blocking dispatch. Its spin lock is
//! acquired when the token is handed out and released when the last target AP
//! completes; callers probe the lock to learn whether their dispatch has
//! drained. Tokens live in chunked storage and are recycled wholesale at SMI
//! exit by rewinding the `first_free` cursor, so no per-token free is needed.

use core::sync::atomic::{AtomicU32, AtomicUsize, Ordering};

use arena::ChunkList;

use crate::sync::SpinLock;
use crate::MpError;

#[derive(Default)]
struct ProcedureToken {
    spin_lock: SpinLock,
    running_ap_count: AtomicU32,
}

/// Index of a token in the list. Stays valid until the BSP rewinds the list
/// at SMI exit.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct TokenHandle(usize);

pub struct TokenList {
    tokens: ChunkList<ProcedureToken>,
    /// Tokens below this index are in use, tokens at or above it are free.
    first_free: AtomicUsize,
}

impl TokenList {
    pub fn new(token_count_per_chunk: u32) -> Self {
        assert!(
            token_count_per_chunk != 0,
            "Token count per chunk must not be zero"
        );
        log::info!(
            "SmmCpu: token count per chunk = {:#x}",
            token_count_per_chunk
        );

        let tokens = ChunkList::new(token_count_per_chunk as usize);
        tokens.grow();
        Self {
            tokens,
            first_free: AtomicUsize::new(0),
        }
    }

    /// Takes the first free token, arming it for `running_ap_count`
    /// completions. Grows the list by one chunk when the free suffix is
    /// empty. Only the BSP allocates.
    pub fn get_free_token(&self, running_ap_count: u32) -> TokenHandle {
        let idx = self.first_free.load(Ordering::SeqCst);
        if idx == self.tokens.capacity() {
            self.tokens.grow();
        }
        self.first_free.store(idx + 1, Ordering::SeqCst);

        self.tokens.with(idx, |token| {
            token
                .running_ap_count
                .store(running_ap_count, Ordering::SeqCst);
            let acquired = token.spin_lock.try_acquire();
            assert!(acquired, "Free token with a held lock");
        });

        TokenHandle(idx)
    }

    /// Counts one completion; the last completion releases the token's lock.
    pub fn release(&self, handle: TokenHandle) {
        self.tokens.with(handle.0, |token| {
            if token.running_ap_count.fetch_sub(1, Ordering::SeqCst) == 1 {
                token.spin_lock.release();
            }
        });
    }

    /// Whether the handle refers to a token in the used prefix.
    pub fn is_in_use(&self, handle: TokenHandle) -> bool {
        handle.0 < self.first_free.load(Ordering::SeqCst)
    }

    /// Probes the token's lock: acquirable means every target AP completed.
    pub fn is_ready(&self, handle: TokenHandle) -> Result<(), MpError> {
        self.tokens.with(handle.0, |token| {
            if token.spin_lock.try_acquire() {
                token.spin_lock.release();
                Ok(())
            } else {
                Err(MpError::NotReady)
            }
        })
    }

    /// Rewinds the list, returning every token to the free suffix. The
    /// caller must have drained all in-flight dispatches first.
    pub fn reset(&self) {
        let used = self.first_free.load(Ordering::SeqCst);
        for idx in 0..used {
            self.tokens.with(idx, |token| {
                assert!(
                    token.running_ap_count.load(Ordering::SeqCst) == 0,
                    "Token {} recycled with running APs",
                    idx
                );
                assert!(!token.spin_lock.is_held(), "Token {} recycled while held", idx);
            });
        }
        self.first_free.store(0, Ordering::SeqCst);
    }

    pub fn first_free(&self) -> usize {
        self.first_free.load(Ordering::SeqCst)
    }

    pub fn capacity(&self) -> usize {
        self.tokens.capacity()
    }
}

// ————————————————————————————————— Tests —————————————————————————————————— //

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn allocation_advances_the_cursor() {
        let list = TokenList::new(2);
        assert_eq!(list.first_free(), 0);
        assert_eq!(list.capacity(), 2);

        let a = list.get_free_token(1);
        let b = list.get_free_token(1);
        assert_eq!(list.first_free(), 2);
        assert!(list.is_in_use(a));
        assert!(list.is_in_use(b));

        // The third allocation grows a new chunk.
        let c = list.get_free_token(1);
        assert_eq!(list.capacity(), 4);
        assert!(list.is_in_use(c));
    }

    #[test]
    fn last_completion_releases_the_lock() {
        let list = TokenList::new(4);
        let token = list.get_free_token(3);

        assert_eq!(list.is_ready(token), Err(MpError::NotReady));
        list.release(token);
        list.release(token);
        assert_eq!(list.is_ready(token), Err(MpError::NotReady));
        list.release(token);
        assert_eq!(list.is_ready(token), Ok(()));
    }

    #[test]
    fn reset_rewinds_to_the_head() {
        let list = TokenList::new(2);
        let a = list.get_free_token(1);
        list.release(a);
        list.reset();
        assert_eq!(list.first_free(), 0);
        assert!(!list.is_in_use(a));

        // The recycled token can be armed again.
        let b = list.get_free_token(1);
        assert_eq!(b, a);
        assert_eq!(list.is_ready(b), Err(MpError::NotReady));
        list.release(b);
    }

    #[test]
    #[should_panic]
    fn reset_with_running_aps_is_fatal() {
        let list = TokenList::new(2);
        let _ = list.get_free_token(2);
        list.reset();
    }

    #[test]
    #[should_panic]
    fn zero_chunk_size_is_fatal() {
        let _ = TokenList::new(0);
    }
}
