//! Scheduling services
//!
//! The API the dispatcher uses from inside its entry point: schedule a
//! procedure on one AP or on all of them, blocking or tracked by a token,
//! and register the dispatcher and startup hooks in the first place.
//!
//! A CPU's `busy` lock is the single source of truth for "dispatch in flight
//! on this CPU": it is acquired here before the work slot is written and
//! released by the AP after the procedure returns.

use alloc::sync::Arc;
use core::sync::atomic::Ordering;

use crate::context::{MpRendezvous, SyncMode};
use crate::platform::Platform;
use crate::status::StatusSlot;
use crate::sync::release_semaphore;
use crate::token::TokenHandle;
use crate::{MpError, Procedure, ProcedureArg, SmmEntryPoint};

/// How the caller wants a dispatch tracked.
pub enum TokenMode<'a> {
    /// Do not return until the procedure completed.
    Blocking,
    /// Return immediately; completion is only observable through the
    /// target's `busy` lock draining.
    FireAndForget,
    /// Return immediately and arm a token the caller can poll with
    /// [`MpRendezvous::is_ap_ready`].
    Tracked(&'a mut Option<TokenHandle>),
}

impl<P: Platform> MpRendezvous<P> {
    /// Registers the SMM foundation entry point invoked on the BSP each SMI.
    pub fn register_smm_entry(&self, entry: SmmEntryPoint<P>) {
        *self.core_entry.lock() = Some(entry);
    }

    /// Registers (or clears, with `None`) the procedure every processor runs
    /// when it enters the SMI, before the rendezvous starts.
    pub fn register_startup_procedure(
        &self,
        procedure: Option<Procedure>,
        args: Option<ProcedureArg>,
    ) -> Result<(), MpError> {
        if procedure.is_none() && args.is_some() {
            return Err(MpError::InvalidParameter);
        }

        *self.startup_procedure.lock() = procedure.map(|procedure| (procedure, args));
        Ok(())
    }

    /// Schedules `procedure` on `cpu`. Blocking or fire-and-forget depending
    /// on the `block_startup_this_ap` configuration.
    pub fn startup_this_ap(
        &self,
        procedure: Procedure,
        cpu: usize,
        args: Option<ProcedureArg>,
    ) -> Result<(), MpError> {
        let mode = if self.config.block_startup_this_ap {
            TokenMode::Blocking
        } else {
            TokenMode::FireAndForget
        };
        self.internal_startup_this_ap(procedure, cpu, args, mode, 0, None)
    }

    /// Schedules `procedure` on `cpu` and waits for its completion.
    pub fn blocking_startup_this_ap(
        &self,
        procedure: Procedure,
        cpu: usize,
        args: Option<ProcedureArg>,
    ) -> Result<(), MpError> {
        self.internal_startup_this_ap(procedure, cpu, args, TokenMode::Blocking, 0, None)
    }

    /// Whether the dispatch behind `token` has completed on every target AP.
    pub fn is_ap_ready(&self, token: TokenHandle) -> Result<(), MpError> {
        self.tokens.is_ready(token)
    }

    /// Whether `token` still belongs to the current SMI's used prefix.
    pub fn is_token_in_use(&self, token: TokenHandle) -> bool {
        self.tokens.is_in_use(token)
    }

    /// Schedules `procedure` on the AP `cpu`.
    pub fn internal_startup_this_ap(
        &self,
        procedure: Procedure,
        cpu: usize,
        args: Option<ProcedureArg>,
        token: TokenMode,
        timeout_us: u64,
        status: Option<Arc<StatusSlot>>,
    ) -> Result<(), MpError> {
        if cpu >= self.number_of_cpus() {
            log::error!(
                "CPU index {} above the processor count {}",
                cpu,
                self.number_of_cpus()
            );
            return Err(MpError::InvalidParameter);
        }

        if cpu
            == self
                .entry_context
                .currently_executing_cpu
                .load(Ordering::SeqCst)
        {
            log::error!("CPU {} is the currently executing processor", cpu);
            return Err(MpError::InvalidParameter);
        }

        if !self.processor_info(cpu).is_valid() {
            return Err(MpError::InvalidParameter);
        }

        if !self.pool.present(cpu).load(Ordering::SeqCst) {
            if self.effective_sync_mode == SyncMode::Traditional {
                log::error!("CPU {} did not check in for this SMI", cpu);
            }
            return Err(MpError::InvalidParameter);
        }

        if self.removal_pending[cpu].load(Ordering::SeqCst) {
            if !self.config.hot_plug_support {
                log::error!("CPU {} is pending removal", cpu);
            }
            return Err(MpError::InvalidParameter);
        }

        if timeout_us != 0 && !self.config.timeout_supported {
            return Err(MpError::InvalidParameter);
        }

        let blocking = matches!(token, TokenMode::Blocking);

        self.pool.busy(cpu).acquire();

        {
            let mut slot = self.cpu_data[cpu].work.lock();
            slot.procedure = Some(procedure);
            slot.parameter = args;
            slot.token = None;

            if let TokenMode::Tracked(out) = token {
                let handle = self.tokens.get_free_token(1);
                slot.token = Some(handle);
                *out = Some(handle);
            }

            if let Some(status) = &status {
                status.set(Err(MpError::NotReady));
            }
            slot.status = status;
        }

        release_semaphore(self.pool.run(cpu));

        if blocking {
            self.pool.busy(cpu).acquire();
            self.pool.busy(cpu).release();
        }

        Ok(())
    }

    /// Schedules `procedure` on every present AP.
    ///
    /// `status` must hold one slot per processor; excluded slots (the BSP and
    /// processors that never checked in) receive `NotStarted`.
    pub fn startup_all_aps(
        &self,
        procedure: Procedure,
        timeout_us: u64,
        args: Option<ProcedureArg>,
        token: TokenMode,
        status: Option<&[Arc<StatusSlot>]>,
    ) -> Result<(), MpError> {
        if timeout_us != 0 && !self.config.timeout_supported {
            return Err(MpError::InvalidParameter);
        }

        if let Some(status) = status {
            if status.len() < self.max_number_of_cpus() {
                log::error!("Status array smaller than the processor table");
                return Err(MpError::InvalidParameter);
            }
        }

        // Every target must be idle before anything is scheduled, otherwise
        // nothing is.
        let mut cpu_count = 0;
        for cpu in 0..self.max_number_of_cpus() {
            if !self.is_present_ap(cpu) {
                continue;
            }
            cpu_count += 1;

            if self.removal_pending[cpu].load(Ordering::SeqCst) {
                return Err(MpError::InvalidParameter);
            }

            if !self.pool.busy(cpu).try_acquire() {
                return Err(MpError::NotReady);
            }
            self.pool.busy(cpu).release();
        }

        if cpu_count == 0 {
            return Err(MpError::NotStarted);
        }

        let blocking = matches!(token, TokenMode::Blocking);
        let handle = match token {
            TokenMode::Blocking => None,
            TokenMode::FireAndForget => {
                Some(self.tokens.get_free_token(self.max_number_of_cpus() as u32))
            }
            TokenMode::Tracked(out) => {
                let handle = self.tokens.get_free_token(self.max_number_of_cpus() as u32);
                *out = Some(handle);
                Some(handle)
            }
        };

        // All targets were just seen idle and only this processor schedules,
        // so the plain acquire cannot block for long.
        for cpu in 0..self.max_number_of_cpus() {
            if self.is_present_ap(cpu) {
                self.pool.busy(cpu).acquire();
            }
        }

        for cpu in 0..self.max_number_of_cpus() {
            if self.is_present_ap(cpu) {
                let mut slot = self.cpu_data[cpu].work.lock();
                slot.procedure = Some(procedure.clone());
                slot.parameter = args.clone();
                slot.token = handle;
                slot.status = status.map(|status| {
                    status[cpu].set(Err(MpError::NotReady));
                    Arc::clone(&status[cpu])
                });
            } else {
                // Excluded slots report NotStarted and count as completed on
                // the token, they will never release it themselves.
                if let Some(status) = status {
                    status[cpu].set(Err(MpError::NotStarted));
                }
                if let Some(handle) = handle {
                    self.tokens.release(handle);
                }
            }
        }

        self.release_all_aps();

        if blocking {
            self.wait_for_all_aps_not_busy(true);
        }

        Ok(())
    }
}

// ————————————————————————————————— Tests —————————————————————————————————— //
