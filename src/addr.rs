use memory_addr::{PhysAddr, VirtAddr, def_usize_addr, def_usize_addr_formatter};

pub(crate) use memory_addr::PAGE_SIZE_4K as PAGE_SIZE;

/// Host virtual address.
pub type HostVirtAddr = VirtAddr;
/// Host physical address.
pub type HostPhysAddr = PhysAddr;

def_usize_addr! {
    /// Guest virtual address.
    pub type GuestVirtAddr;
    /// Guest physical address.
    pub type GuestPhysAddr;
}

/// Note: This is just a conversion in number and has no semantic meaning.
///
/// Every view maps guest physical memory 1:1 onto host physical memory, so the
/// two address kinds share the same numeric value for mapped pages.
impl From<PhysAddr> for GuestPhysAddr {
    fn from(addr: PhysAddr) -> Self {
        Self::from_usize(addr.into())
    }
}

def_usize_addr_formatter! {
    GuestVirtAddr = "GVA:{}";
    GuestPhysAddr = "GPA:{}";
}

/// Returns the 4 KiB page containing `gpa`.
pub fn gpa_page(gpa: GuestPhysAddr) -> GuestPhysAddr {
    GuestPhysAddr::from_usize(gpa.as_usize() & !(PAGE_SIZE - 1))
}

/// Returns the 4 KiB page containing `gva`.
pub fn gva_page(gva: GuestVirtAddr) -> GuestVirtAddr {
    GuestVirtAddr::from_usize(gva.as_usize() & !(PAGE_SIZE - 1))
}

/// Host physical address backing `gpa` under the identity mapping.
pub(crate) fn identity_hpa(gpa: GuestPhysAddr) -> HostPhysAddr {
    HostPhysAddr::from_usize(gpa.as_usize())
}
