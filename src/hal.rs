use alloc::vec::Vec;

use page_table_multiarch::PagingHandler;

use crate::{GuestPhysAddr, GuestVirtAddr, HostPhysAddr, arch, guest};

/// A contiguous run of host RAM as reported by the platform.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PhysMemRange {
    /// First byte of the run.
    pub base: HostPhysAddr,
    /// Length of the run in bytes.
    pub size: usize,
}

impl PhysMemRange {
    /// Creates a new range starting at `base` spanning `size` bytes.
    pub const fn new(base: usize, size: usize) -> Self {
        Self {
            base: HostPhysAddr::from_usize(base),
            size,
        }
    }
}

/// Platform services the nested paging core relies on.
///
/// Frame allocation and the physical-to-virtual translation come from
/// [`PagingHandler`]; everything here is what the fault handlers additionally
/// need from the host. All methods may be called from a VM-exit context and
/// must not block.
pub trait NptHal: PagingHandler + Sized {
    /// Enumerates the physical RAM ranges of the machine.
    fn physical_memory_ranges() -> Vec<PhysMemRange>;

    /// Physical base of the local APIC register page.
    fn apic_base() -> HostPhysAddr {
        arch::read_apic_base()
    }

    /// The host's own CR3, i.e. the root of the system address space.
    fn system_cr3() -> u64 {
        arch::read_cr3()
    }

    /// Identifier of the thread currently running on this processor. Never 0.
    fn current_thread_id() -> usize;

    /// Index of the logical processor executing the caller.
    fn current_processor_id() -> usize;

    /// Restricts the current thread to the processors in `mask`.
    fn set_thread_affinity(mask: usize);

    /// Translates `gva` through the guest page tables rooted at `guest_cr3`.
    fn guest_virt_to_phys(guest_cr3: u64, gva: GuestVirtAddr) -> Option<GuestPhysAddr> {
        guest::walk_guest::<Self>(guest_cr3, gva)
    }

    /// Copies guest memory at `gva` into `buf`, stopping at the first unmapped
    /// page. Returns the number of bytes copied.
    fn read_guest_virt(guest_cr3: u64, gva: GuestVirtAddr, buf: &mut [u8]) -> usize {
        guest::read_guest_code::<Self>(guest_cr3, gva, buf)
    }
}
