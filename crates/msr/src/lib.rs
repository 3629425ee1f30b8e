//! Model Specific Registers
//!
//! A collection of the model specific registers the rendezvous engine cares
//! about: machine check banks, MTRRs, SMRR, and the x2APIC register range.
#![cfg_attr(not(test), no_std)]

#[cfg(target_arch = "x86_64")]
use core::arch::asm;

use bitflags::bitflags;

pub mod mtrr;

// ——————————————————————————————— Known MSRs ——————————————————————————————— //

pub const IA32_APIC_BASE: Msr = Msr::new(0x1B);
pub const IA32_FEATURE_CONTROL: Msr = Msr::new(0x3A);
pub const IA32_MTRRCAP: Msr = Msr::new(0xFE);
pub const IA32_MCG_CAP: Msr = Msr::new(0x179);
pub const IA32_MCG_STATUS: Msr = Msr::new(0x17A);
pub const IA32_SMRR_PHYSBASE: Msr = Msr::new(0x1F2);
pub const IA32_SMRR_PHYSMASK: Msr = Msr::new(0x1F3);
pub const IA32_MTRR_PHYSBASE0: Msr = Msr::new(0x200);
pub const IA32_MTRR_DEF_TYPE: Msr = Msr::new(0x2FF);
pub const IA32_MCG_EXT_CTL: Msr = Msr::new(0x4D0);

// Fixed range MTRRs
pub const IA32_MTRR_FIX64K_00000: Msr = Msr::new(0x250);
pub const IA32_MTRR_FIX16K_80000: Msr = Msr::new(0x258);
pub const IA32_MTRR_FIX16K_A0000: Msr = Msr::new(0x259);
pub const IA32_MTRR_FIX4K_C0000: Msr = Msr::new(0x268);
pub const IA32_MTRR_FIX4K_C8000: Msr = Msr::new(0x269);
pub const IA32_MTRR_FIX4K_D0000: Msr = Msr::new(0x26A);
pub const IA32_MTRR_FIX4K_D8000: Msr = Msr::new(0x26B);
pub const IA32_MTRR_FIX4K_E0000: Msr = Msr::new(0x26C);
pub const IA32_MTRR_FIX4K_E8000: Msr = Msr::new(0x26D);
pub const IA32_MTRR_FIX4K_F0000: Msr = Msr::new(0x26E);
pub const IA32_MTRR_FIX4K_F8000: Msr = Msr::new(0x26F);

// X2APIC
pub const IA32_X2APIC_APICID: Msr = Msr::new(0x802);
pub const IA32_X2APIC_VERSION: Msr = Msr::new(0x803);
pub const IA32_X2APIC_EOI: Msr = Msr::new(0x80b);
pub const IA32_X2APIC_SIVR: Msr = Msr::new(0x80f);
pub const IA32_X2APIC_ICR: Msr = Msr::new(0x830);
pub const IA32_X2APIC_SELF_IPI: Msr = Msr::new(0x83f);

// —————————————————————————————————— MSR ——————————————————————————————————— //

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Msr(u32);

impl Msr {
    /// Creates a new MSR from it's address.
    pub const fn new(reg: u32) -> Self {
        Self(reg)
    }

    /// Returns the address of this MSR.
    pub const fn address(self) -> u32 {
        self.0
    }

    /// Reads 64 bits MSR register.
    ///
    /// ## Safety
    ///
    /// The caller must ensure that this read operation has no unsafe side
    /// effects.
    #[inline]
    #[cfg(target_arch = "x86_64")]
    pub unsafe fn read(&self) -> u64 {
        let (high, low): (u32, u32);
        asm!(
            "rdmsr",
            in("ecx") self.0,
            out("eax") low, out("edx") high,
            options(nomem, nostack, preserves_flags),
        );
        ((high as u64) << 32) | (low as u64)
    }

    /// Writes 64 bits to MSR register.
    ///
    /// ## Safety
    ///
    /// The caller must ensure that this write operation has no unsafe side
    /// effects.
    #[inline]
    #[cfg(target_arch = "x86_64")]
    pub unsafe fn write(&mut self, value: u64) {
        let low = value as u32;
        let high = (value >> 32) as u32;

        asm!(
            "wrmsr",
            in("ecx") self.0,
            in("eax") low, in("edx") high,
            options(nostack, preserves_flags),
        );
    }

    #[inline]
    #[cfg(not(target_arch = "x86_64"))]
    pub unsafe fn read(&self) -> u64 {
        unimplemented!("rdmsr is only available on x86_64");
    }

    #[inline]
    #[cfg(not(target_arch = "x86_64"))]
    pub unsafe fn write(&mut self, _value: u64) {
        unimplemented!("wrmsr is only available on x86_64");
    }
}

// ——————————————————————————— Machine Check Bits ——————————————————————————— //

bitflags! {
    /// IA32_MCG_CAP, global machine check capabilities.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct McgCap: u64 {
        /// Threshold-based error status is present.
        const TES_P = 1 << 11;
        /// Local machine check exceptions are supported.
        const LMCE_P = 1 << 27;
    }
}

bitflags! {
    /// IA32_MCG_STATUS, global machine check status.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct McgStatus: u64 {
        /// Restart IP is valid.
        const RIPV = 1 << 0;
        /// Error IP is valid.
        const EIPV = 1 << 1;
        /// A machine check is in progress.
        const MCIP = 1 << 2;
        /// The current machine check event was delivered to this logical
        /// processor only.
        const LMCE_S = 1 << 3;
    }
}

bitflags! {
    /// IA32_FEATURE_CONTROL.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct FeatureControl: u64 {
        const LOCKED = 1 << 0;
        const LMCE_ON = 1 << 20;
    }
}

bitflags! {
    /// IA32_MCG_EXT_CTL.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct McgExtCtl: u64 {
        const LMCE_EN = 1 << 0;
    }
}

// ————————————————————————————————— Tests —————————————————————————————————— //

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn machine_check_bits() {
        let cap = McgCap::from_bits_truncate(1 << 27);
        assert!(cap.contains(McgCap::LMCE_P));

        let status = McgStatus::from_bits_truncate(0b1000);
        assert!(status.contains(McgStatus::LMCE_S));
        assert!(!status.contains(McgStatus::MCIP));

        let ctrl = FeatureControl::from_bits_truncate((1 << 20) | 1);
        assert!(ctrl.contains(FeatureControl::LMCE_ON | FeatureControl::LOCKED));
    }
}
