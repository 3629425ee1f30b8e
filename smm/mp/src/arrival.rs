//! AP arrival protocol
//!
//! The BSP side of gathering the machine: poll the check-in counter against
//! the processor count, discounting processors the platform reports as
//! blocked or disabled, and nudge the stragglers with a directed SMI once the
//! first timer round expires. The second round guarantees that a processor
//! leaving the blocked or delayed state has an SMI pending and cannot run
//! normal-mode code while handlers are active.

use core::sync::atomic::Ordering;

use crate::context::MpRendezvous;
use crate::platform::{Platform, SmmRegister};

impl<P: Platform> MpRendezvous<P> {
    /// Delayed, blocked, and disabled thread counts, read once per package
    /// through the first thread of each package.
    fn smm_delayed_blocked_disabled_count(&self) -> (u32, u32, u32) {
        let mut delayed = 0;
        let mut blocked = 0;
        let mut disabled = 0;

        for cpu in 0..self.number_of_cpus() {
            if self.is_package_first_thread(cpu) {
                delayed += self.platform.smm_register(cpu, SmmRegister::SmmDelayed) as u32;
                blocked += self.platform.smm_register(cpu, SmmRegister::SmmBlocked) as u32;
                disabled += self.platform.smm_register(cpu, SmmRegister::SmmEnable) as u32;
            }
        }

        (delayed, blocked, disabled)
    }

    /// Whether every CPU except blocked and disabled ones has checked in.
    pub(crate) fn all_cpus_in_smm_except_blocked_disabled(&self) -> bool {
        let counter = self.pool.counter().load(Ordering::SeqCst) as usize;
        assert!(
            counter <= self.number_of_cpus(),
            "Check-in counter above the processor count"
        );

        if counter == self.number_of_cpus() {
            return true;
        }

        let (_, blocked, disabled) = self.smm_delayed_blocked_disabled_count();

        // APs keep checking in while this runs, so the sum may exceed the
        // processor count; the comparison only answers whether anyone is
        // still missing.
        counter + blocked as usize + disabled as usize >= self.number_of_cpus()
    }

    /// Waits for the APs: one timer round, a directed SMI to every processor
    /// not yet present, then a second timer round. Returns with
    /// `all_ap_arrived_with_exception` reflecting the outcome; the caller
    /// proceeds either way.
    pub(crate) fn smm_wait_for_ap_arrival(&self) {
        assert!(
            (self.pool.counter().load(Ordering::SeqCst) as usize) <= self.number_of_cpus(),
            "Check-in counter above the processor count"
        );

        // A pending local machine check bypasses the first round: the
        // processor it targets will not arrive.
        let lmce = self.machine_check_supported
            && self.platform.lmce_os_enabled()
            && self.platform.lmce_signaled();

        let timer = self.platform.start_sync_timer();
        while !self.platform.is_sync_timer_timeout(timer) && !lmce {
            let arrived = self.all_cpus_in_smm_except_blocked_disabled();
            self.all_ap_arrived_with_exception
                .store(arrived, Ordering::SeqCst);
            if arrived {
                break;
            }

            core::hint::spin_loop();
        }

        if (self.pool.counter().load(Ordering::SeqCst) as usize) < self.number_of_cpus() {
            // Missing processors may be about to leave the delayed or
            // blocked state. Pend an SMI on each of them so none can execute
            // normal-mode code before joining the run.
            for cpu in 0..self.max_number_of_cpus() {
                let info = self.processor_info(cpu);
                if !self.pool.present(cpu).load(Ordering::SeqCst) && info.is_valid() {
                    self.platform.send_smi_ipi(info.apic_id);
                }
            }

            let timer = self.platform.start_sync_timer();
            while !self.platform.is_sync_timer_timeout(timer) {
                let arrived = self.all_cpus_in_smm_except_blocked_disabled();
                self.all_ap_arrived_with_exception
                    .store(arrived, Ordering::SeqCst);
                if arrived {
                    break;
                }

                core::hint::spin_loop();
            }
        }

        if !self.all_ap_arrived_with_exception.load(Ordering::SeqCst) {
            let (delayed, blocked, _) = self.smm_delayed_blocked_disabled_count();
            log::info!(
                "SmmWaitForApArrival: delayed AP count = {}, blocked AP count = {}",
                delayed,
                blocked
            );
        }
    }
}
