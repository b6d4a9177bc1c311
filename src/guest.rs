//! Guest virtual address translation through the guest's own page tables.
//!
//! The host runs with guest physical memory identity-mapped, so the guest
//! paging structures are reachable through [`PagingHandler::phys_to_virt`].

use bit_field::BitField;
use page_table_multiarch::PagingHandler;

use crate::{
    GuestPhysAddr, GuestVirtAddr, HostPhysAddr, NptHal,
    addr::{PAGE_SIZE, identity_hpa},
};

const ENTRY_ADDR_MASK: usize = 0x000f_ffff_ffff_f000;
const LEVEL_SHIFTS: [usize; 4] = [39, 30, 21, 12];

fn read_entry<H: NptHal>(table: usize, index: usize) -> u64 {
    let base = <H as PagingHandler>::phys_to_virt(HostPhysAddr::from_usize(table));
    unsafe { (base.as_ptr() as *const u64).add(index).read_volatile() }
}

/// Walks the 4-level guest page tables rooted at `guest_cr3` for `gva`.
///
/// 1 GiB and 2 MiB pages are honoured. Returns `None` if any level is not
/// present.
pub fn walk_guest<H: NptHal>(guest_cr3: u64, gva: GuestVirtAddr) -> Option<GuestPhysAddr> {
    let addr = gva.as_usize();
    let mut table = guest_cr3 as usize & ENTRY_ADDR_MASK;

    for (level, &shift) in LEVEL_SHIFTS.iter().enumerate() {
        let entry = read_entry::<H>(table, addr.get_bits(shift..shift + 9));
        if !entry.get_bit(0) {
            return None;
        }
        let frame = entry as usize & ENTRY_ADDR_MASK;
        let is_leaf = shift == 12 || ((level == 1 || level == 2) && entry.get_bit(7));
        if is_leaf {
            let page_mask = (1usize << shift) - 1;
            return Some(GuestPhysAddr::from_usize(
                (frame & !page_mask) | (addr & page_mask),
            ));
        }
        table = frame;
    }
    None
}

/// Copies guest memory at `gva` into `buf` page by page.
///
/// Stops at the first page that does not translate and returns the number of
/// bytes copied so far.
pub fn read_guest_code<H: NptHal>(guest_cr3: u64, gva: GuestVirtAddr, buf: &mut [u8]) -> usize {
    let mut copied = 0;
    while copied < buf.len() {
        let current = gva.as_usize().wrapping_add(copied);
        let Some(gpa) = H::guest_virt_to_phys(guest_cr3, GuestVirtAddr::from_usize(current))
        else {
            break;
        };

        let in_page = PAGE_SIZE - (current & (PAGE_SIZE - 1));
        let chunk = in_page.min(buf.len() - copied);
        let src = <H as PagingHandler>::phys_to_virt(identity_hpa(gpa));
        unsafe {
            core::ptr::copy_nonoverlapping(src.as_ptr(), buf[copied..].as_mut_ptr(), chunk);
        }
        copied += chunk;
    }
    copied
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::test_utils::{MockHal, mock_hal_test};
    use crate::{MappingFlags, NestedPageTable, PhysFrame};
    use axin::axin;

    const RX: MappingFlags = MappingFlags::READ.union(MappingFlags::EXECUTE);

    #[test]
    #[axin(decorator(mock_hal_test))]
    fn test_walk_identity_tables() {
        let mut pt = NestedPageTable::<MockHal>::try_new().unwrap();
        pt.assign(GuestPhysAddr::from_usize(0x20_0000), RX).unwrap();
        let cr3 = pt.root_paddr().as_usize() as u64;

        assert_eq!(
            walk_guest::<MockHal>(cr3, GuestVirtAddr::from_usize(0x20_0123)),
            Some(GuestPhysAddr::from_usize(0x20_0123))
        );
        assert_eq!(
            walk_guest::<MockHal>(cr3, GuestVirtAddr::from_usize(0x20_1000)),
            None
        );
    }

    #[test]
    #[axin(decorator(mock_hal_test))]
    fn test_walk_honours_2m_pages() {
        let pml4 = PhysFrame::<MockHal>::alloc_zero().unwrap();
        let pdpt = PhysFrame::<MockHal>::alloc_zero().unwrap();
        let pd = PhysFrame::<MockHal>::alloc_zero().unwrap();
        unsafe {
            let p4 = pml4.as_mut_ptr() as *mut u64;
            *p4 = pdpt.start_paddr().as_usize() as u64 | 0x3;
            let p3 = pdpt.as_mut_ptr() as *mut u64;
            *p3 = pd.start_paddr().as_usize() as u64 | 0x3;
            let p2 = pd.as_mut_ptr() as *mut u64;
            // PD[1] maps the 2 MiB page at 0x4060_0000 (PS set).
            *p2.add(1) = 0x4060_0000 | 0x83;
        }
        let cr3 = pml4.start_paddr().as_usize() as u64;

        assert_eq!(
            walk_guest::<MockHal>(cr3, GuestVirtAddr::from_usize(0x2a_bcde)),
            Some(GuestPhysAddr::from_usize(0x406a_bcde))
        );
    }

    #[test]
    #[axin(decorator(mock_hal_test))]
    fn test_read_guest_code_across_pages() {
        let first = PhysFrame::<MockHal>::alloc().unwrap();
        let mut second = PhysFrame::<MockHal>::alloc().unwrap();
        let first_addr = first.start_paddr().as_usize();
        assert_eq!(second.start_paddr().as_usize(), first_addr + PAGE_SIZE);
        unsafe { core::ptr::write_bytes(first.as_mut_ptr(), 0x90, PAGE_SIZE) };
        second.fill(0xcc);

        let mut pt = NestedPageTable::<MockHal>::try_new().unwrap();
        pt.assign(GuestPhysAddr::from_usize(first_addr), RX).unwrap();
        let cr3 = pt.root_paddr().as_usize() as u64;

        let start = GuestVirtAddr::from_usize(first_addr + PAGE_SIZE - 3);
        let mut buf = [0u8; 8];
        // Second page not mapped yet: the copy stops at the boundary.
        assert_eq!(read_guest_code::<MockHal>(cr3, start, &mut buf), 3);

        pt.assign(GuestPhysAddr::from_usize(first_addr + PAGE_SIZE), RX)
            .unwrap();
        assert_eq!(read_guest_code::<MockHal>(cr3, start, &mut buf), 8);
        assert_eq!(buf, [0x90, 0x90, 0x90, 0xcc, 0xcc, 0xcc, 0xcc, 0xcc]);
    }
}
