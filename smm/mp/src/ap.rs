//! AP handler
//!
//! The follower side of an SMI run: wait for the coordinator to show up
//! (nudging it with a directed SMI if it never does), check in, take part in
//! the MTRR barriers, then serve scheduled procedures until the coordinator
//! signals the exit.

use core::sync::atomic::Ordering;

use crate::context::{MpRendezvous, SyncMode, BSP_UNELECTED};
use crate::platform::Platform;
use crate::sync::{release_semaphore, wait_for_semaphore};

impl<P: Platform> MpRendezvous<P> {
    pub(crate) fn ap_handler(&self, cpu_index: usize) {
        let configure_mtrrs = self.platform.need_configure_mtrrs();

        let timer = self.platform.start_sync_timer();
        while !self.platform.is_sync_timer_timeout(timer)
            && !self.pool.inside_smm().load(Ordering::SeqCst)
        {
            core::hint::spin_loop();
        }

        if !self.pool.inside_smm().load(Ordering::SeqCst) {
            let bsp = self.bsp_index.load(Ordering::SeqCst);
            if bsp != BSP_UNELECTED {
                assert_ne!(cpu_index as u32, bsp);

                // A BSP is elected but not in SMM yet, bring it in and give
                // it one more timer round.
                self.platform
                    .send_smi_ipi(self.processor_info(bsp as usize).apic_id);

                let timer = self.platform.start_sync_timer();
                while !self.platform.is_sync_timer_timeout(timer)
                    && !self.pool.inside_smm().load(Ordering::SeqCst)
                {
                    core::hint::spin_loop();
                }
            }

            if !self.pool.inside_smm().load(Ordering::SeqCst) {
                // The BSP never made it. Take this processor's check-in back
                // and leave quietly.
                wait_for_semaphore(self.pool.counter());
                return;
            }
        }

        let bsp_index = self.bsp_index.load(Ordering::SeqCst) as usize;
        assert_ne!(cpu_index, bsp_index);

        // Mark this processor's presence.
        self.pool.present(cpu_index).store(true, Ordering::SeqCst);

        if self.effective_sync_mode == SyncMode::Traditional || configure_mtrrs {
            // Notify the BSP of arrival.
            release_semaphore(self.pool.run(bsp_index));
        }

        let mut os_mtrrs = None;
        if configure_mtrrs {
            // Backup phase.
            wait_for_semaphore(self.pool.run(cpu_index));
            os_mtrrs = Some(self.platform.mtrr_get_all(cpu_index));
            release_semaphore(self.pool.run(bsp_index));

            // Program phase.
            wait_for_semaphore(self.pool.run(cpu_index));
            self.replace_os_mtrrs(cpu_index);
            release_semaphore(self.pool.run(bsp_index));
        }

        loop {
            wait_for_semaphore(self.pool.run(cpu_index));

            if !self.pool.inside_smm().load(Ordering::SeqCst) {
                break;
            }

            // The BUSY lock was acquired by the scheduling call.
            debug_assert!(self.pool.busy(cpu_index).is_held());

            self.run_scheduled_procedure(cpu_index);

            self.pool.busy(cpu_index).release();
        }

        if configure_mtrrs {
            release_semaphore(self.pool.run(bsp_index));
            wait_for_semaphore(self.pool.run(cpu_index));
            self.platform.reenable_smrr(cpu_index);
            if let Some(mtrrs) = &os_mtrrs {
                self.platform.mtrr_set_all(cpu_index, mtrrs);
            }
        }

        // Staged exit: ready to reset, reset, ready to leave.
        release_semaphore(self.pool.run(bsp_index));
        wait_for_semaphore(self.pool.run(cpu_index));
        self.pool.present(cpu_index).store(false, Ordering::SeqCst);
        release_semaphore(self.pool.run(bsp_index));
    }

    /// Runs the procedure stored in the work slot, reports its status, and
    /// settles the token binding.
    fn run_scheduled_procedure(&self, cpu_index: usize) {
        let (procedure, parameter, status, token) = {
            let slot = self.cpu_data[cpu_index].work.lock();
            (
                slot.procedure.clone(),
                slot.parameter.clone(),
                slot.status.clone(),
                slot.token,
            )
        };

        let Some(procedure) = procedure else {
            log::error!("CPU {} woken without a scheduled procedure", cpu_index);
            return;
        };

        let result = (*procedure)(parameter.as_ref());

        if let Some(status) = status {
            status.set(result);
        }

        if let Some(token) = token {
            self.tokens.release(token);
            self.cpu_data[cpu_index].work.lock().token = None;
        }
    }
}
