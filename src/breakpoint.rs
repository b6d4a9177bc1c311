use axerrno::AxResult;

use crate::{NptContext, NptHal, VcpuState};

/// `#BP` exception vector.
const BREAKPOINT_VECTOR: u8 = 3;

/// What the `#BP` handler did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BreakpointOutcome {
    /// The breakpoint armed the branch tracer.
    TracerArmed,
    /// The breakpoint was not ours and was re-injected into the guest.
    Reinjected,
}

impl<H: NptHal> NptContext<H> {
    /// Handles a `#BP` intercept.
    ///
    /// A breakpoint at the tracer's start address arms tracing exactly once:
    /// the hook that planted it is removed, the tracer starts on this CPU and
    /// the current thread is bound to the tracer and pinned to this processor.
    /// Any other breakpoint is handed back to the guest unchanged.
    pub fn handle_breakpoint(&self, vcpu: &mut VcpuState) -> AxResult<BreakpointOutcome> {
        let rip = vcpu.guest_rip();
        let state = &self.tracer_state;
        trace!("#BP at {:?}", rip);

        let eligible = state.is_initialized()
            && rip == state.start_address()
            && state.thread_id().is_none();
        if !eligible {
            return Ok(Self::reinject_breakpoint(vcpu));
        }

        // Hooks go first so a failed removal leaves the tracer unbound.
        self.remove_npt_hook(rip)?;
        if !state.try_bind_thread(H::current_thread_id()) {
            return Ok(Self::reinject_breakpoint(vcpu));
        }
        self.tracer.start(state, vcpu);

        // NOTE: the thread is assumed to stay on this processor for the whole
        // session; migrations are not followed.
        let processor = H::current_processor_id();
        match 1usize.checked_shl(processor as u32) {
            Some(mask) => H::set_thread_affinity(mask),
            None => warn!("processor {processor} does not fit in an affinity mask"),
        }
        info!(
            "branch tracer armed at {:?}: thread {:?}, processor {}",
            rip,
            state.thread_id(),
            processor
        );
        Ok(BreakpointOutcome::TracerArmed)
    }

    fn reinject_breakpoint(vcpu: &mut VcpuState) -> BreakpointOutcome {
        vcpu.inject_exception(BREAKPOINT_VECTOR, None);
        BreakpointOutcome::Reinjected
    }
}
