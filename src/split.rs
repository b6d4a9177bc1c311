//! Instructions whose bytes straddle two pages.
//!
//! When the guest crosses into or out of a hooked page in the middle of an
//! instruction, the second page may be execute-disabled in the view the CPU
//! is about to run in, and the instruction would fault again halfway through.
//! Both pages are therefore made executable in that view first.

use crate::{
    GuestVirtAddr, NptAction, NptContext, NptFault, NptHal, ViewKind,
    addr::{gpa_page, gva_page},
    decode::MAX_INSTRUCTION_LEN,
};

/// Outcome of the split-instruction check for one execute fault.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SplitDecision {
    /// Whether the fault handler should change the active view.
    pub switch_view: bool,
    /// Pages to expose before resuming, if the instruction is split.
    pub expose: Option<NptAction>,
}

impl SplitDecision {
    const NOT_SPLIT: Self = Self {
        switch_view: true,
        expose: None,
    };
}

impl<H: NptHal> NptContext<H> {
    /// Checks whether the instruction at `fault.rip` ends on another page,
    /// i.e. whether `rip + len` lies on a different page than `rip`.
    ///
    /// Entering a hooked page forces the switch to Shadow and exposes both
    /// pages there. Leaving a hooked page suppresses the switch until the
    /// instruction has retired and exposes both pages in the active view.
    pub(crate) fn split_instruction(&self, fault: &NptFault, hooked: bool) -> SplitDecision {
        let mut bytes = [0u8; MAX_INSTRUCTION_LEN];
        let fetched = H::read_guest_virt(fault.guest_cr3, fault.rip, &mut bytes);
        let Some(len) = self
            .decoder
            .instruction_length(&bytes[..fetched], fault.rip.as_usize() as u64)
        else {
            warn!(
                "cannot decode instruction at {:?} ({} bytes readable)",
                fault.rip, fetched
            );
            return SplitDecision::NOT_SPLIT;
        };

        let end = GuestVirtAddr::from_usize(fault.rip.as_usize().wrapping_add(len));
        if gva_page(end) == gva_page(fault.rip) {
            return SplitDecision::NOT_SPLIT;
        }

        let (switch_view, view) = if hooked {
            trace!("split instruction at {:?} entering hooked page", fault.rip);
            (true, ViewKind::Shadow)
        } else {
            trace!("split instruction at {:?} leaving hooked page", fault.rip);
            (false, fault.active)
        };
        let second = H::guest_virt_to_phys(fault.guest_cr3, end).map(gpa_page);
        if second.is_none() {
            warn!("second page of split instruction at {:?} is not mapped", fault.rip);
        }

        SplitDecision {
            switch_view,
            expose: Some(NptAction::ExposeSplit {
                view,
                first: gpa_page(fault.gpa),
                second,
            }),
        }
    }
}
