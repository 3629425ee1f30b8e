#![no_std]

use bit_field::BitField;
use msr::{IA32_APIC_BASE, IA32_X2APIC_APICID, IA32_X2APIC_ICR};

// An x2apic interrupt command interface, just enough to direct SMIs.

/// ICR delivery mode for a system management interrupt.
const DELIVERY_MODE_SMI: u64 = 0b010;

/// Returns whether the local APIC runs in x2APIC mode.
pub fn x2apic_enabled() -> bool {
    let apic_base = unsafe { IA32_APIC_BASE.read() };
    apic_base.get_bit(10) && apic_base.get_bit(11)
}

/// APIC id of the executing processor, read from the x2APIC id register.
pub fn apic_id() -> u32 {
    unsafe { IA32_X2APIC_APICID.read() as u32 }
}

/// Sends a directed SMI to the processor with the given APIC id.
///
/// The write uses fixed physical destination mode, edge triggered, vector 0.
/// An SMI is delivered on the SMI pin semantics: if the target is already in
/// SMM the interrupt stays pending and is taken on the next RSM.
pub fn send_smi_ipi(apic_id: u32) {
    let mut icr: u64 = 0;
    icr.set_bits(32..64, apic_id as u64);
    icr.set_bits(8..11, DELIVERY_MODE_SMI);
    unsafe {
        let mut reg = IA32_X2APIC_ICR;
        reg.write(icr);
    }
}

/// Initial APIC id of the executing processor via CPUID, usable before the
/// x2APIC is enabled.
#[cfg(target_arch = "x86_64")]
pub fn pcpu_id() -> u32 {
    let cpuid = unsafe { core::arch::x86_64::__cpuid(0x01) };
    ((cpuid.ebx & 0xffffffff) >> 24) as u32
}
