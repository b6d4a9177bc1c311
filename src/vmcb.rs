//! The slice of the VMCB the nested paging handlers read and write.

use bit_field::BitField;
use bitflags::bitflags;

use crate::{GuestPhysAddr, GuestVirtAddr, HostPhysAddr};

bitflags! {
    /// #NPF EXITINFO1 error code. (APM Vol. 2, Section 15.25.6)
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct NpfExitInfo: u64 {
        /// The nested translation was present; clear on a nested table miss.
        const VALID =       1 << 0;
        /// The access was a write.
        const WRITE =       1 << 1;
        /// The access was a user access.
        const USER =        1 << 2;
        /// A reserved bit was set in a nested entry.
        const RESERVED =    1 << 3;
        /// The access was an instruction fetch.
        const EXECUTE =     1 << 4;
        /// The fault happened on the final guest physical address.
        const FINAL_GPA =   1 << 32;
        /// The fault happened while walking the guest page tables.
        const GUEST_TABLE = 1 << 33;
    }
}

/// VMCB clean bit covering nCR3 and the nested paging controls.
const VMCB_CLEAN_NP: usize = 4;
/// TLB_CONTROL: flush the entire TLB on the next VMRUN.
const TLB_CONTROL_FLUSH_ALL: u8 = 1;
/// RFLAGS.TF.
const RFLAGS_TF: usize = 8;
/// DEBUGCTL.BTF, single-step on branches instead of instructions.
const DEBUGCTL_BTF: usize = 1;
/// EVENTINJ.TYPE for exceptions.
const EVENT_TYPE_EXCEPTION: u64 = 3;

/// Per-CPU view of the guest VMCB used by the exit handlers.
///
/// The exit loop copies these fields out of the VMCB before calling into this
/// crate and writes them back afterwards. A handler only ever touches the
/// state of the CPU that took the exit.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct VcpuState {
    /// Active nested page table root.
    pub ncr3: u64,
    /// EXITINFO1 of the current exit.
    pub exit_info1: u64,
    /// EXITINFO2 of the current exit (faulting GPA for #NPF).
    pub exit_info2: u64,
    /// VMCB clean bits.
    pub vmcb_clean: u32,
    /// TLB_CONTROL.
    pub tlb_control: u8,
    /// EVENTINJ.
    pub event_inj: u64,
    /// Guest RIP.
    pub rip: u64,
    /// Guest RFLAGS.
    pub rflags: u64,
    /// Guest CR3.
    pub cr3: u64,
    /// Guest DEBUGCTL.
    pub debugctl: u64,
}

impl VcpuState {
    /// Root of the nested page table currently loaded for this CPU.
    pub fn active_root(&self) -> HostPhysAddr {
        HostPhysAddr::from_usize(self.ncr3 as usize)
    }

    /// Loads a new nested page table root. Takes effect on the next VMRUN.
    pub fn set_active_root(&mut self, root: HostPhysAddr) {
        self.ncr3 = root.as_usize() as u64;
    }

    /// Decoded #NPF error code.
    pub fn npf_exit_info(&self) -> NpfExitInfo {
        NpfExitInfo::from_bits_truncate(self.exit_info1)
    }

    /// Faulting guest physical address of a #NPF exit.
    pub fn fault_gpa(&self) -> GuestPhysAddr {
        GuestPhysAddr::from_usize(self.exit_info2 as usize)
    }

    /// Guest instruction pointer.
    pub fn guest_rip(&self) -> GuestVirtAddr {
        GuestVirtAddr::from_usize(self.rip as usize)
    }

    /// Marks nCR3 dirty and requests a full TLB flush on the next VMRUN.
    pub fn flush_nested_translations(&mut self) {
        self.vmcb_clean.set_bit(VMCB_CLEAN_NP, false);
        self.tlb_control = TLB_CONTROL_FLUSH_ALL;
    }

    /// Whether the nested paging clean bit is still set.
    pub fn nested_paging_clean(&self) -> bool {
        self.vmcb_clean.get_bit(VMCB_CLEAN_NP)
    }

    /// Whether RFLAGS.TF is set.
    pub fn trap_flag(&self) -> bool {
        self.rflags.get_bit(RFLAGS_TF)
    }

    /// Sets or clears RFLAGS.TF.
    pub fn set_trap_flag(&mut self, value: bool) {
        self.rflags.set_bit(RFLAGS_TF, value);
    }

    /// Whether DEBUGCTL.BTF is set.
    pub fn branch_trap(&self) -> bool {
        self.debugctl.get_bit(DEBUGCTL_BTF)
    }

    /// Sets or clears DEBUGCTL.BTF.
    pub fn set_branch_trap(&mut self, value: bool) {
        self.debugctl.set_bit(DEBUGCTL_BTF, value);
    }

    /// Queues an exception for delivery to the guest on the next VMRUN.
    pub fn inject_exception(&mut self, vector: u8, error_code: Option<u32>) {
        let mut event = 0u64;
        event.set_bits(0..8, vector as u64);
        event.set_bits(8..11, EVENT_TYPE_EXCEPTION);
        if let Some(code) = error_code {
            event.set_bit(11, true);
            event.set_bits(32..64, code as u64);
        }
        event.set_bit(31, true);
        self.event_inj = event;
    }

    /// Vector of the pending injected event, if any.
    pub fn pending_event(&self) -> Option<u8> {
        self.event_inj
            .get_bit(31)
            .then(|| self.event_inj.get_bits(0..8) as u8)
    }
}
