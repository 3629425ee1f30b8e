//! Rendezvous entry
//!
//! The per-CPU SMI entry point and the BSP election. Every processor lands
//! here from the hardware vector, checks in on the shared counter, and takes
//! either the coordinator or the follower path.

use core::sync::atomic::Ordering;

use crate::context::{MpRendezvous, BSP_UNELECTED};
use crate::platform::Platform;
use crate::sync::release_semaphore;

impl<P: Platform> MpRendezvous<P> {
    /// Per-CPU SMI entry, called by the hardware stub on every processor
    /// that traps into SMM.
    pub fn smi_rendezvous(&self, cpu_index: usize) {
        assert!(cpu_index < self.max_number_of_cpus());

        // A page fault taken inside SMM may clobber CR2; preserve the
        // interrupted context's value across the whole run.
        let cr2 = self.platform.save_cr2();

        self.rendezvous(cpu_index);

        self.platform.restore_cr2(cr2);
    }

    fn rendezvous(&self, cpu_index: usize) {
        // The first SMI of a relocated processor runs the per-processor init
        // handler instead of joining a rendezvous.
        if self.config.smm_relocated && !self.smm_initialized[cpu_index].load(Ordering::SeqCst) {
            self.platform.smm_init_handler(cpu_index);
            self.smm_initialized[cpu_index].store(true, Ordering::SeqCst);
            return;
        }

        // The user registered startup procedure runs first.
        let startup = self.startup_procedure.lock().clone();
        if let Some((procedure, args)) = startup {
            let _ = (*procedure)(args.as_ref());
        }

        self.platform.rendezvous_entry(cpu_index);

        // Sample the valid-SMI probe before the in-progress flag: the BSP
        // clears the SMI source after checking in, so the two reads in this
        // order distinguish a stale source from a truly spurious SMI.
        let valid_smi = self.platform.valid_smi();
        let bsp_in_progress = self.pool.inside_smm().load(Ordering::SeqCst);

        if !bsp_in_progress && !valid_smi {
            // Spurious SMI, or a run that has already wound down. Nothing to
            // do either way.
            self.platform.rendezvous_exit(cpu_index);
            return;
        }

        // Signal the presence of this processor. A zero return means the BSP
        // has locked enrollment down and this processor is too late.
        if release_semaphore(self.pool.counter()) == 0 {
            while self.pool.all_cpus_in_sync().load(Ordering::SeqCst) {
                core::hint::spin_loop();
            }

            self.platform.rendezvous_exit(cpu_index);
            return;
        }

        // Reset the BUSY lock early: with the Relaxed flow the BSP may
        // schedule onto this processor as soon as its present flag rises.
        self.pool.busy(cpu_index).reset();

        if self.config.profile_enable {
            self.platform.activate_profile(cpu_index);
        }

        if bsp_in_progress {
            // A BSP is already running. Follow the AP path regardless of the
            // probe result, the BSP may have cleared the SMI source.
            self.ap_handler(cpu_index);
        } else {
            self.elect_and_run(cpu_index);
        }

        debug_assert_eq!(self.pool.run(cpu_index).load(Ordering::SeqCst), 0);

        // Wait for the BSP's signal to leave the SMI.
        while self.pool.all_cpus_in_sync().load(Ordering::SeqCst) {
            core::hint::spin_loop();
        }

        self.platform.rendezvous_exit(cpu_index);
    }

    /// BSP election on a valid SMI with no coordinator yet.
    fn elect_and_run(&self, cpu_index: usize) {
        if self.config.enable_bsp_election {
            let switch_pending = self.switch_bsp.load(Ordering::SeqCst);
            if !switch_pending || self.candidate_bsp[cpu_index].load(Ordering::SeqCst) {
                match self.platform.bsp_election() {
                    Ok(is_bsp) => {
                        if is_bsp {
                            self.bsp_index.store(cpu_index as u32, Ordering::SeqCst);
                        }
                    }
                    Err(_) => {
                        // The platform cannot decide, the first processor to
                        // claim the slot wins.
                        let _ = self.bsp_index.compare_exchange(
                            BSP_UNELECTED,
                            cpu_index as u32,
                            Ordering::SeqCst,
                            Ordering::SeqCst,
                        );
                    }
                }
            }
        }

        if self.bsp_index.load(Ordering::SeqCst) == cpu_index as u32 {
            // The election consumed any pending switch request.
            if self.switch_bsp.load(Ordering::SeqCst) {
                self.switch_bsp.store(false, Ordering::SeqCst);
                for candidate in &self.candidate_bsp {
                    candidate.store(false, Ordering::SeqCst);
                }
            }

            if self.config.profile_enable {
                self.platform.record_smi_number();
            }

            self.bsp_handler(cpu_index);
        } else {
            self.ap_handler(cpu_index);
        }
    }
}
