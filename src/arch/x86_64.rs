use bit_field::BitField;
use x86::msr::{IA32_APIC_BASE, rdmsr};

use crate::HostPhysAddr;

/// Reads the local APIC base from `IA32_APIC_BASE` (bits 12..52).
pub(crate) fn read_apic_base() -> HostPhysAddr {
    let msr = unsafe { rdmsr(IA32_APIC_BASE) };
    HostPhysAddr::from_usize((msr.get_bits(12..52) << 12) as usize)
}

pub(crate) fn read_cr3() -> u64 {
    unsafe { x86::controlregs::cr3() }
}
