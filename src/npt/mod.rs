//! AMD64 nested page tables.

use bit_field::BitField;

use crate::GuestPhysAddr;

mod entry;
mod table;

pub use entry::{NptEntry, NptFlags};
pub use table::NestedPageTable;

/// Number of entries in one table page.
pub(crate) const ENTRY_COUNT: usize = 512;

/// Splits `gpa` into its (PML4, PDPT, PD, PT) table indices.
pub fn npt_indices(gpa: GuestPhysAddr) -> [usize; 4] {
    let addr = gpa.as_usize();
    [
        addr.get_bits(39..48),
        addr.get_bits(30..39),
        addr.get_bits(21..30),
        addr.get_bits(12..21),
    ]
}
