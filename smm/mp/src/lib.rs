//! SMM Multi-Processor Rendezvous
//!
//! The synchronization engine that coordinates every logical processor of an
//! x86 system while a system management interrupt is being handled. Each
//! processor traps into [`MpRendezvous::smi_rendezvous`]; the engine elects a
//! single coordinator (the BSP), gathers the remaining processors (the APs),
//! serializes the shared global work, services per-AP work items scheduled by
//! the coordinator, and releases all processors synchronously.
//!
//! Everything the engine needs from the surrounding firmware is abstracted
//! behind [`platform::Platform`], so the whole protocol can be driven by a
//! simulated machine in tests.
#![cfg_attr(not(test), no_std)]

extern crate alloc;

mod ap;
mod arrival;
mod bsp;
mod context;
mod entry;
pub mod platform;
mod pool;
mod services;
mod status;
pub mod sync;
mod token;

#[cfg(target_arch = "x86_64")]
pub mod hw;

use alloc::sync::Arc;
use core::any::Any;

pub use context::{MpConfig, MpRendezvous, SmmEntryContext, SyncMode};
pub use services::TokenMode;
pub use status::StatusSlot;
pub use token::TokenHandle;

/// Configuration for the static rendezvous engine sizing.
pub mod config {
    /// Stride separating semaphores in the pool, one cache line.
    pub const CACHE_LINE_SIZE: usize = 64;

    /// Number of procedure tokens allocated per chunk.
    pub const DEFAULT_TOKEN_COUNT_PER_CHUNK: u32 = 64;
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MpError {
    InvalidParameter,
    NotReady,
    NotStarted,
    Timeout,
}

/// Opaque argument handed to a scheduled procedure.
pub type ProcedureArg = Arc<dyn Any + Send + Sync>;

/// A procedure that can be scheduled on an application processor.
pub type Procedure =
    Arc<dyn Fn(Option<&ProcedureArg>) -> Result<(), MpError> + Send + Sync>;

/// The dispatcher entry point registered by the SMM foundation. Invoked on
/// the BSP once per SMI with the scheduling API and the entry context.
pub type SmmEntryPoint<P> =
    Arc<dyn Fn(&MpRendezvous<P>, &SmmEntryContext) + Send + Sync>;
