//! Platform interface
//!
//! Everything the rendezvous engine consumes from the surrounding firmware:
//! the SMI probe, the BSP election oracle, per-CPU SMM state registers, MTRR
//! access, the directed SMI IPI, the sync timer, and the machine check MSRs.
//! Pure notification hooks default to no-ops.

use crate::MpError;

/// APIC id marking a processor slot as absent.
pub const INVALID_APIC_ID: u64 = u64::MAX;

/// Per-CPU SMM state registers maintained by the platform.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SmmRegister {
    /// The processor is delaying its SMM entry.
    SmmDelayed,
    /// The processor cannot enter SMM right now.
    SmmBlocked,
    /// SMM delivery is disabled on the processor.
    SmmEnable,
}

/// Identity and topology of one logical processor.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ProcessorInfo {
    pub apic_id: u64,
    pub package: u32,
}

impl ProcessorInfo {
    pub const fn invalid() -> Self {
        Self {
            apic_id: INVALID_APIC_ID,
            package: 0,
        }
    }

    pub fn is_valid(&self) -> bool {
        self.apic_id != INVALID_APIC_ID
    }
}

pub trait Platform: Send + Sync + 'static {
    /// Per-processor MTRR state. Opaque to the engine, which only saves and
    /// restores it around the SMI run.
    type Mtrrs: Default + Send + Sync;

    /// Whether a valid SMI source is pending on this platform.
    fn valid_smi(&self) -> bool;

    /// Platform BSP election. `Ok(true)` elects the calling processor,
    /// `Err` makes the engine fall back to first-come-first-elected.
    fn bsp_election(&self) -> Result<bool, MpError>;

    /// Clears the top level SMI status bit. Must report success.
    fn clear_top_level_smi_status(&self) -> bool;

    /// Reads the per-CPU SMM state register, as a count contribution.
    fn smm_register(&self, cpu: usize, register: SmmRegister) -> u64;

    /// Whether MTRRs must be reprogrammed for SMM on this platform.
    fn need_configure_mtrrs(&self) -> bool;

    fn mtrr_get_all(&self, cpu: usize) -> Self::Mtrrs;
    fn mtrr_set_all(&self, cpu: usize, mtrrs: &Self::Mtrrs);

    /// Sends a directed SMI to the processor with the given APIC id.
    fn send_smi_ipi(&self, apic_id: u64);

    fn start_sync_timer(&self) -> u64;
    fn is_sync_timer_timeout(&self, timer: u64) -> bool;

    /// Whether the processor reports machine check architecture support.
    fn machine_check_supported(&self) -> bool;

    /// Whether the OS armed local machine check exceptions.
    fn lmce_os_enabled(&self) -> bool;

    /// Whether a local machine check exception is currently signaled.
    fn lmce_signaled(&self) -> bool;

    // ————————————————————————— Notification hooks ————————————————————————— //

    fn disable_smrr(&self, _cpu: usize) {}
    fn reenable_smrr(&self, _cpu: usize) {}
    fn rendezvous_entry(&self, _cpu: usize) {}
    fn rendezvous_exit(&self, _cpu: usize) {}
    fn save_cr2(&self) -> usize {
        0
    }
    fn restore_cr2(&self, _cr2: usize) {}

    /// First-SMI initialization of a relocated processor.
    fn smm_init_handler(&self, _cpu: usize) {}

    fn debug_agent_enter(&self) {}
    fn debug_agent_exit(&self) {}
    fn activate_profile(&self, _cpu: usize) {}
    fn record_smi_number(&self) {}

    /// Applies pending hot-plug bookkeeping at the end of the SMI.
    fn hot_plug_update(&self) {}

    fn perform_pre_tasks(&self) {}
    fn perform_remaining_tasks(&self) {}
    fn migrate_perf_records(&self, _number_of_cpus: usize, _bsp_index: usize) {}
}

// ————————————————————————————— Test platform —————————————————————————————— //

#[cfg(test)]
pub(crate) mod testing {
    use super::*;

    /// Inert platform for unit tests that never take an SMI.
    pub(crate) struct NullPlatform;

    impl Platform for NullPlatform {
        type Mtrrs = u64;

        fn valid_smi(&self) -> bool {
            true
        }

        fn bsp_election(&self) -> Result<bool, MpError> {
            Err(MpError::NotReady)
        }

        fn clear_top_level_smi_status(&self) -> bool {
            true
        }

        fn smm_register(&self, _cpu: usize, _register: SmmRegister) -> u64 {
            0
        }

        fn need_configure_mtrrs(&self) -> bool {
            false
        }

        fn mtrr_get_all(&self, _cpu: usize) -> u64 {
            0
        }

        fn mtrr_set_all(&self, _cpu: usize, _mtrrs: &u64) {}

        fn send_smi_ipi(&self, _apic_id: u64) {}

        fn start_sync_timer(&self) -> u64 {
            0
        }

        fn is_sync_timer_timeout(&self, _timer: u64) -> bool {
            true
        }

        fn machine_check_supported(&self) -> bool {
            false
        }

        fn lmce_os_enabled(&self) -> bool {
            false
        }

        fn lmce_signaled(&self) -> bool {
            false
        }
    }
}
