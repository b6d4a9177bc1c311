use alloc::collections::BTreeMap;

use axerrno::{AxResult, ax_err_type};
use page_table_entry::{GenericPTE, MappingFlags};

use super::{ENTRY_COUNT, NptEntry, npt_indices};
use crate::{
    GuestPhysAddr, HostPhysAddr, NptHal, PhysFrame, PhysMemRange,
    addr::{PAGE_SIZE, gpa_page, identity_hpa},
};

type Table = [NptEntry; ENTRY_COUNT];

/// A 4-level nested page table hierarchy (nPML4 -> nPDPT -> nPD -> nPT).
///
/// Every table page of the hierarchy is owned by the table itself and indexed
/// by its physical frame number; the walker only follows links into frames it
/// owns. Leaves always map 4 KiB pages 1:1 (guest physical == host physical).
pub struct NestedPageTable<H: NptHal> {
    root_paddr: HostPhysAddr,
    tables: BTreeMap<usize, PhysFrame<H>>,
}

impl<H: NptHal> NestedPageTable<H> {
    /// Creates an empty hierarchy with a freshly allocated root table.
    pub fn try_new() -> AxResult<Self> {
        let root = Self::allocate_table()?;
        let root_paddr = root.start_paddr();
        let mut tables = BTreeMap::new();
        tables.insert(root.pfn(), root);
        Ok(Self { root_paddr, tables })
    }

    /// Physical address of the nPML4, i.e. the value loaded into nCR3.
    pub const fn root_paddr(&self) -> HostPhysAddr {
        self.root_paddr
    }

    /// Number of table pages (all levels) owned by this hierarchy.
    pub fn table_count(&self) -> usize {
        self.tables.len()
    }

    /// Allocates one zeroed table page.
    ///
    /// Failure means no translation can be provided, which the callers treat
    /// as fatal.
    fn allocate_table() -> AxResult<PhysFrame<H>> {
        PhysFrame::alloc_zero().map_err(|err| {
            error!("failed to allocate a nested page table: {err:?}");
            err
        })
    }

    fn table(&self, pfn: usize) -> Option<&Table> {
        self.tables
            .get(&pfn)
            .map(|frame| unsafe { &*(frame.as_mut_ptr() as *const Table) })
    }

    fn table_mut(&mut self, pfn: usize) -> Option<&mut Table> {
        self.tables
            .get_mut(&pfn)
            .map(|frame| unsafe { &mut *(frame.as_mut_ptr() as *mut Table) })
    }

    fn root_pfn(&self) -> usize {
        self.root_paddr.as_usize() / PAGE_SIZE
    }

    /// Follows `table[index]` to the next level, allocating and linking the
    /// next-level table if the entry is absent.
    fn next_table_or_alloc(&mut self, pfn: usize, index: usize) -> AxResult<usize> {
        let entry = self
            .table(pfn)
            .ok_or_else(|| ax_err_type!(BadState, "walk reached a table not owned by this view"))?
            [index];
        if entry.is_present() {
            return Ok(entry.pfn());
        }

        let frame = Self::allocate_table()?;
        let next_pfn = frame.pfn();
        let next_paddr = frame.start_paddr();
        self.tables.insert(next_pfn, frame);
        if let Some(table) = self.table_mut(pfn) {
            table[index] = NptEntry::new_table(next_paddr);
        }
        Ok(next_pfn)
    }

    /// Locates the leaf slot of `gpa` as (table pfn, index), without allocating.
    fn leaf_slot(&self, gpa: GuestPhysAddr) -> Option<(usize, usize)> {
        let [l4, l3, l2, l1] = npt_indices(gpa);
        let mut pfn = self.root_pfn();
        for index in [l4, l3, l2] {
            let entry = self.table(pfn)?[index];
            if !entry.is_present() {
                return None;
            }
            pfn = entry.pfn();
        }
        Some((pfn, l1))
    }

    /// Maps the 4 KiB page containing `gpa` onto itself with `flags`.
    ///
    /// Missing intermediate tables are allocated on the way down; an existing
    /// leaf is overwritten in place. `READ` selects the present bit, `WRITE`
    /// the writable bit and a missing `EXECUTE` sets execute-disable.
    pub fn assign(&mut self, gpa: GuestPhysAddr, flags: MappingFlags) -> AxResult<NptEntry> {
        let [l4, l3, l2, l1] = npt_indices(gpa);
        let mut pfn = self.root_pfn();
        for index in [l4, l3, l2] {
            pfn = self.next_table_or_alloc(pfn, index)?;
        }

        let entry = NptEntry::new_page(identity_hpa(gpa_page(gpa)), flags, false);
        let table = self
            .table_mut(pfn)
            .ok_or_else(|| ax_err_type!(BadState, "leaf table not owned by this view"))?;
        table[l1] = entry;
        Ok(entry)
    }

    /// Returns the leaf entry for `gpa`, or `None` if no leaf was ever assigned.
    pub fn lookup(&self, gpa: GuestPhysAddr) -> Option<NptEntry> {
        let (pfn, index) = self.leaf_slot(gpa)?;
        let entry = self.table(pfn)?[index];
        (!entry.is_unused()).then_some(entry)
    }

    /// Whether `gpa` is mapped and instruction fetches from it are allowed.
    pub fn is_executable(&self, gpa: GuestPhysAddr) -> bool {
        self.lookup(gpa)
            .is_some_and(|e| e.is_present() && e.is_executable())
    }

    /// Applies `f` to the existing leaf entry of `gpa` and returns the result.
    ///
    /// Returns `None` without calling `f` if `gpa` has no leaf.
    pub fn update(
        &mut self,
        gpa: GuestPhysAddr,
        f: impl FnOnce(&mut NptEntry),
    ) -> Option<NptEntry> {
        let (pfn, index) = self.leaf_slot(gpa)?;
        let entry = &mut self.table_mut(pfn)?[index];
        if entry.is_unused() {
            return None;
        }
        f(entry);
        Some(*entry)
    }

    /// Identity-maps every page of `ranges` plus the local APIC page.
    ///
    /// The APIC register page lies outside the RAM ranges but the guest still
    /// has to reach it. Returns the root physical address.
    pub fn build_identity(
        &mut self,
        ranges: &[PhysMemRange],
        apic_base: HostPhysAddr,
        flags: MappingFlags,
    ) -> AxResult<HostPhysAddr> {
        debug!(
            "building nested page table {:#x} over {} ranges with {:?}",
            self.root_paddr,
            ranges.len(),
            flags
        );
        for range in ranges {
            let first = range.base.as_usize() / PAGE_SIZE;
            let count = range.size / PAGE_SIZE;
            for pfn in first..first + count {
                self.assign(GuestPhysAddr::from_usize(pfn * PAGE_SIZE), flags)?;
            }
        }
        self.assign(GuestPhysAddr::from(apic_base), flags)?;
        Ok(self.root_paddr)
    }
}
