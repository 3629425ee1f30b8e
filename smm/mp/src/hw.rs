//! Hardware platform
//!
//! The [`Platform`] implementation for real x86_64 machines: MSR-backed
//! machine check probes, TSC-based sync timer, x2APIC directed SMIs, and raw
//! MTRR snapshots. Chipset specific concerns (the valid-SMI probe, the top
//! level SMI status, the per-CPU SMM state registers) have no architectural
//! home and keep their neutral defaults here; platforms with such registers
//! wrap this type.

use log::LevelFilter;
use msr::mtrr::MtrrSnapshot;
use msr::{
    FeatureControl, McgCap, McgExtCtl, McgStatus, IA32_APIC_BASE, IA32_FEATURE_CONTROL,
    IA32_MCG_CAP, IA32_MCG_EXT_CTL, IA32_MCG_STATUS, IA32_SMRR_PHYSMASK,
};

use crate::platform::{Platform, SmmRegister};
use crate::MpError;

/// Valid bit of IA32_SMRR_PHYSMASK.
const SMRR_VALID: u64 = 1 << 11;

/// BSP flag of IA32_APIC_BASE.
const APIC_BASE_BSP: u64 = 1 << 8;

pub struct HwPlatform {
    /// TSC ticks granted to one sync timer round.
    sync_timeout_ticks: u64,
}

impl HwPlatform {
    pub fn new(sync_timeout_ticks: u64, log_level: LevelFilter) -> Self {
        logger::init(log_level);
        Self { sync_timeout_ticks }
    }
}

fn rdtsc() -> u64 {
    unsafe { core::arch::x86_64::_rdtsc() }
}

impl Platform for HwPlatform {
    type Mtrrs = MtrrSnapshot;

    fn valid_smi(&self) -> bool {
        // No chipset probe available, treat every SMI as valid.
        true
    }

    fn bsp_election(&self) -> Result<bool, MpError> {
        // Elect the hardware bootstrap processor.
        let apic_base = unsafe { IA32_APIC_BASE.read() };
        Ok(apic_base & APIC_BASE_BSP != 0)
    }

    fn clear_top_level_smi_status(&self) -> bool {
        // The top level status lives in chipset PM space, nothing
        // architectural to clear.
        true
    }

    fn smm_register(&self, _cpu: usize, _register: SmmRegister) -> u64 {
        // The delayed/blocked/enable registers are model specific; report
        // none so the arrival protocol relies on its timer alone.
        0
    }

    fn need_configure_mtrrs(&self) -> bool {
        true
    }

    fn mtrr_get_all(&self, _cpu: usize) -> MtrrSnapshot {
        unsafe { MtrrSnapshot::save() }
    }

    fn mtrr_set_all(&self, _cpu: usize, mtrrs: &MtrrSnapshot) {
        unsafe { mtrrs.restore() }
    }

    fn disable_smrr(&self, _cpu: usize) {
        unsafe {
            let mut mask = IA32_SMRR_PHYSMASK;
            let value = mask.read();
            mask.write(value & !SMRR_VALID);
        }
    }

    fn reenable_smrr(&self, _cpu: usize) {
        unsafe {
            let mut mask = IA32_SMRR_PHYSMASK;
            let value = mask.read();
            mask.write(value | SMRR_VALID);
        }
    }

    fn send_smi_ipi(&self, apic_id: u64) {
        x2apic::send_smi_ipi(apic_id as u32);
    }

    fn start_sync_timer(&self) -> u64 {
        rdtsc().wrapping_add(self.sync_timeout_ticks)
    }

    fn is_sync_timer_timeout(&self, timer: u64) -> bool {
        rdtsc() >= timer
    }

    fn machine_check_supported(&self) -> bool {
        // CPUID.01H:EDX.MCA
        let cpuid = unsafe { core::arch::x86_64::__cpuid(0x01) };
        cpuid.edx & (1 << 14) != 0
    }

    fn lmce_os_enabled(&self) -> bool {
        let cap = McgCap::from_bits_truncate(unsafe { IA32_MCG_CAP.read() });
        if !cap.contains(McgCap::LMCE_P) {
            return false;
        }

        let control = FeatureControl::from_bits_truncate(unsafe { IA32_FEATURE_CONTROL.read() });
        if !control.contains(FeatureControl::LMCE_ON) {
            return false;
        }

        let ext = McgExtCtl::from_bits_truncate(unsafe { IA32_MCG_EXT_CTL.read() });
        ext.contains(McgExtCtl::LMCE_EN)
    }

    fn lmce_signaled(&self) -> bool {
        let status = McgStatus::from_bits_truncate(unsafe { IA32_MCG_STATUS.read() });
        status.contains(McgStatus::LMCE_S)
    }

    fn save_cr2(&self) -> usize {
        let cr2: usize;
        unsafe {
            core::arch::asm!(
                "mov {}, cr2",
                out(reg) cr2,
                options(nomem, nostack, preserves_flags),
            );
        }
        cr2
    }

    fn restore_cr2(&self, cr2: usize) {
        unsafe {
            core::arch::asm!(
                "mov cr2, {}",
                in(reg) cr2,
                options(nomem, nostack, preserves_flags),
            );
        }
    }
}
