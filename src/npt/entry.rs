use core::fmt;

use bitflags::bitflags;
use page_table_entry::{GenericPTE, MappingFlags};

use crate::HostPhysAddr;

bitflags! {
    /// AMD64 nested page table entry flags. (APM Vol. 2, Section 15.25.5)
    ///
    /// Nested tables use the legacy long-mode format; every guest access is
    /// treated as a user access, so `USER` is set on all live entries.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct NptFlags: u64 {
        /// The entry is valid.
        const PRESENT =         1 << 0;
        /// Writes are allowed.
        const WRITABLE =        1 << 1;
        /// User-mode (guest) accesses are allowed.
        const USER =            1 << 2;
        /// Write-through caching.
        const WRITE_THROUGH =   1 << 3;
        /// Caching disabled.
        const NO_CACHE =        1 << 4;
        /// Set by the processor on access.
        const ACCESSED =        1 << 5;
        /// Set by the processor on write.
        const DIRTY =           1 << 6;
        /// Maps a 2M or 1G page. Only allowed in PDPT and PD entries.
        const HUGE_PAGE =       1 << 7;
        /// Global page.
        const GLOBAL =          1 << 8;
        /// Instruction fetches are not allowed.
        const NO_EXECUTE =      1 << 63;
    }
}

impl From<MappingFlags> for NptFlags {
    fn from(f: MappingFlags) -> Self {
        let mut ret = Self::USER;
        if f.contains(MappingFlags::READ) {
            ret |= Self::PRESENT;
        }
        if f.contains(MappingFlags::WRITE) {
            ret |= Self::WRITABLE;
        }
        if !f.contains(MappingFlags::EXECUTE) {
            ret |= Self::NO_EXECUTE;
        }
        if f.intersects(MappingFlags::DEVICE | MappingFlags::UNCACHED) {
            ret |= Self::NO_CACHE | Self::WRITE_THROUGH;
        }
        ret
    }
}

impl From<NptFlags> for MappingFlags {
    fn from(f: NptFlags) -> Self {
        let mut ret = MappingFlags::empty();
        if !f.contains(NptFlags::PRESENT) {
            return ret;
        }
        ret |= Self::READ;
        if f.contains(NptFlags::WRITABLE) {
            ret |= Self::WRITE;
        }
        if !f.contains(NptFlags::NO_EXECUTE) {
            ret |= Self::EXECUTE;
        }
        if f.contains(NptFlags::NO_CACHE) {
            ret |= Self::UNCACHED;
        }
        ret
    }
}

/// An AMD64 nested page table entry.
#[derive(Clone, Copy, PartialEq, Eq)]
#[repr(transparent)]
pub struct NptEntry(u64);

impl NptEntry {
    const PHYS_ADDR_MASK: u64 = 0x000f_ffff_ffff_f000; // bits 12..52

    /// An unused (all-zero) entry.
    pub const fn empty() -> Self {
        Self(0)
    }

    /// Raw entry flags.
    pub fn npt_flags(&self) -> NptFlags {
        NptFlags::from_bits_truncate(self.0)
    }

    /// Frame number the entry points at.
    pub fn pfn(&self) -> usize {
        ((self.0 & Self::PHYS_ADDR_MASK) >> 12) as usize
    }

    /// Whether writes through this entry are allowed.
    pub fn is_writable(&self) -> bool {
        self.npt_flags().contains(NptFlags::WRITABLE)
    }

    /// Whether the guest-access bit (bit 2) is set.
    pub fn is_user(&self) -> bool {
        self.npt_flags().contains(NptFlags::USER)
    }

    /// Whether instruction fetches through this entry are allowed.
    pub fn is_executable(&self) -> bool {
        !self.npt_flags().contains(NptFlags::NO_EXECUTE)
    }

    /// Sets or clears the execute-disable bit, leaving everything else alone.
    pub fn set_executable(&mut self, executable: bool) {
        if executable {
            self.0 &= !NptFlags::NO_EXECUTE.bits();
        } else {
            self.0 |= NptFlags::NO_EXECUTE.bits();
        }
    }
}

impl GenericPTE for NptEntry {
    fn new_page(paddr: HostPhysAddr, flags: MappingFlags, is_huge: bool) -> Self {
        let mut flags = NptFlags::from(flags);
        if is_huge {
            flags |= NptFlags::HUGE_PAGE;
        }
        Self(flags.bits() | (paddr.as_usize() as u64 & Self::PHYS_ADDR_MASK))
    }
    fn new_table(paddr: HostPhysAddr) -> Self {
        let flags = NptFlags::PRESENT | NptFlags::WRITABLE | NptFlags::USER;
        Self(flags.bits() | (paddr.as_usize() as u64 & Self::PHYS_ADDR_MASK))
    }
    fn paddr(&self) -> HostPhysAddr {
        HostPhysAddr::from((self.0 & Self::PHYS_ADDR_MASK) as usize)
    }
    fn flags(&self) -> MappingFlags {
        self.npt_flags().into()
    }
    fn set_paddr(&mut self, paddr: HostPhysAddr) {
        self.0 = (self.0 & !Self::PHYS_ADDR_MASK) | (paddr.as_usize() as u64 & Self::PHYS_ADDR_MASK)
    }
    fn set_flags(&mut self, flags: MappingFlags, is_huge: bool) {
        let mut flags = NptFlags::from(flags);
        if is_huge {
            flags |= NptFlags::HUGE_PAGE;
        }
        self.0 = (self.0 & Self::PHYS_ADDR_MASK) | flags.bits()
    }
    fn is_unused(&self) -> bool {
        self.0 == 0
    }
    fn is_present(&self) -> bool {
        self.npt_flags().contains(NptFlags::PRESENT)
    }
    fn is_huge(&self) -> bool {
        self.npt_flags().contains(NptFlags::HUGE_PAGE)
    }
    fn clear(&mut self) {
        self.0 = 0
    }

    fn bits(self) -> usize {
        self.0 as usize
    }
}

impl fmt::Debug for NptEntry {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("NptEntry")
            .field("raw", &self.0)
            .field("hpaddr", &self.paddr())
            .field("flags", &self.npt_flags())
            .finish()
    }
}
