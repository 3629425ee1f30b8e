//! BSP handler
//!
//! The coordinator side of an SMI run. In Traditional mode (or whenever
//! MTRRs must be reprogrammed) the APs are gathered before the dispatcher
//! runs; in Relaxed mode they are gathered only at exit and later arrivals
//! run through freely.

use core::sync::atomic::Ordering;

use crate::context::{MpRendezvous, SyncMode, BSP_UNELECTED};
use crate::platform::Platform;
use crate::sync::lockdown_semaphore;

impl<P: Platform> MpRendezvous<P> {
    pub(crate) fn bsp_handler(&self, cpu_index: usize) {
        assert_eq!(cpu_index as u32, self.bsp_index.load(Ordering::SeqCst));

        let sync_mode = self.effective_sync_mode;
        let configure_mtrrs = self.platform.need_configure_mtrrs();
        let mut ap_count = 0;
        let mut os_mtrrs = None;

        // Flag the BSP's presence.
        self.pool.inside_smm().store(true, Ordering::SeqCst);

        if self.config.smm_debug {
            self.platform.debug_agent_enter();
        }

        // Mark this processor's presence.
        self.pool.present(cpu_index).store(true, Ordering::SeqCst);

        // Clear the top level SMI status before any handler runs: clearing
        // it afterwards would lose an SMI arriving in between.
        let cleared = self.platform.clear_top_level_smi_status();
        assert!(cleared, "Failed to clear the top level SMI status");

        self.entry_context
            .currently_executing_cpu
            .store(cpu_index, Ordering::SeqCst);

        if sync_mode == SyncMode::Traditional || configure_mtrrs {
            self.smm_wait_for_ap_arrival();

            // Close enrollment and learn how many APs joined.
            self.pool.all_cpus_in_sync().store(true, Ordering::SeqCst);
            ap_count = lockdown_semaphore(self.pool.counter()) as usize - 1;

            self.wait_for_all_aps(ap_count);

            if configure_mtrrs {
                // Hyper-threads share one MTRR set, so every thread backs up
                // before any thread programs: two fully separated phases.
                self.release_all_aps();
                os_mtrrs = Some(self.platform.mtrr_get_all(cpu_index));
                self.wait_for_all_aps(ap_count);

                self.release_all_aps();
                self.replace_os_mtrrs(cpu_index);
                self.wait_for_all_aps(ap_count);
            }
        }

        // The coordinator's BUSY lock is held for the whole dispatch phase.
        self.pool.busy(cpu_index).acquire();

        self.platform.perform_pre_tasks();

        // Invoke the SMM foundation entry point.
        let entry = self.core_entry.lock().clone();
        if let Some(entry) = entry {
            (*entry)(self, &self.entry_context);
        } else {
            log::warn!("No SMM entry point registered, skipping dispatch");
        }

        // Drain every pending non-blocking dispatch.
        self.wait_for_all_aps_not_busy(true);

        self.platform.perform_remaining_tasks();

        if sync_mode != SyncMode::Traditional && !configure_mtrrs {
            self.pool.all_cpus_in_sync().store(true, Ordering::SeqCst);
            ap_count = lockdown_semaphore(self.pool.counter()) as usize - 1;

            // An AP may have checked in right before the lockdown without
            // having raised its present flag yet; wait it out.
            while self.present_count() <= ap_count {
                core::hint::spin_loop();
            }
        }

        // Notify all APs to exit the work loop.
        self.pool.inside_smm().store(false, Ordering::SeqCst);
        self.release_all_aps();
        self.wait_for_all_aps(ap_count);

        if configure_mtrrs {
            // Signal the APs to restore their OS MTRRs, restore our own.
            self.release_all_aps();
            self.platform.reenable_smrr(cpu_index);
            if let Some(mtrrs) = &os_mtrrs {
                self.platform.mtrr_set_all(cpu_index, mtrrs);
            }
            self.wait_for_all_aps(ap_count);
        }

        if self.config.smm_debug {
            self.platform.debug_agent_exit();
        }

        // Let the APs reset their per-processor state.
        self.release_all_aps();

        self.platform.hot_plug_update();

        self.pool.present(cpu_index).store(false, Ordering::SeqCst);

        // Gather the APs one last time. Their present flags are cleared by
        // now, the completion counter does not depend on them.
        self.wait_for_all_aps(ap_count);

        self.platform
            .migrate_perf_records(self.number_of_cpus(), cpu_index);

        self.tokens.reset();

        if self.config.enable_bsp_election {
            self.bsp_index.store(BSP_UNELECTED, Ordering::SeqCst);
        }

        // Allow check-ins from this point on.
        self.pool.counter().store(0, Ordering::SeqCst);
        self.pool.all_cpus_in_sync().store(false, Ordering::SeqCst);
        self.all_ap_arrived_with_exception
            .store(false, Ordering::SeqCst);
    }
}
