//! Dispatch status slots
//!
//! A status slot is the mailbox through which an AP reports the outcome of a
//! scheduled procedure. The engine writes `NotReady` when the dispatch is
//! scheduled and the final result when the procedure returns, so the caller
//! of a non-blocking dispatch can poll the slot it kept.

use core::sync::atomic::{AtomicU32, Ordering};

use crate::MpError;

const UNSET: u32 = 0;
const SUCCESS: u32 = 1;
const INVALID_PARAMETER: u32 = 2;
const NOT_READY: u32 = 3;
const NOT_STARTED: u32 = 4;
const TIMEOUT: u32 = 5;

pub struct StatusSlot(AtomicU32);

impl StatusSlot {
    pub const fn new() -> Self {
        Self(AtomicU32::new(UNSET))
    }

    pub fn set(&self, status: Result<(), MpError>) {
        self.0.store(encode(status), Ordering::SeqCst);
    }

    /// The last status written, or `None` if the slot was never written.
    pub fn get(&self) -> Option<Result<(), MpError>> {
        decode(self.0.load(Ordering::SeqCst))
    }
}

impl Default for StatusSlot {
    fn default() -> Self {
        Self::new()
    }
}

fn encode(status: Result<(), MpError>) -> u32 {
    match status {
        Ok(()) => SUCCESS,
        Err(MpError::InvalidParameter) => INVALID_PARAMETER,
        Err(MpError::NotReady) => NOT_READY,
        Err(MpError::NotStarted) => NOT_STARTED,
        Err(MpError::Timeout) => TIMEOUT,
    }
}

fn decode(code: u32) -> Option<Result<(), MpError>> {
    match code {
        UNSET => None,
        SUCCESS => Some(Ok(())),
        INVALID_PARAMETER => Some(Err(MpError::InvalidParameter)),
        NOT_READY => Some(Err(MpError::NotReady)),
        NOT_STARTED => Some(Err(MpError::NotStarted)),
        TIMEOUT => Some(Err(MpError::Timeout)),
        _ => unreachable!("Corrupted status slot"),
    }
}

// ————————————————————————————————— Tests —————————————————————————————————— //

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn round_trips_every_status() {
        let slot = StatusSlot::new();
        assert_eq!(slot.get(), None);

        for status in [
            Ok(()),
            Err(MpError::InvalidParameter),
            Err(MpError::NotReady),
            Err(MpError::NotStarted),
            Err(MpError::Timeout),
        ] {
            slot.set(status);
            assert_eq!(slot.get(), Some(status));
        }
    }
}
