//! Branch tracer state and the single-step tracer driving it.

use core::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use axerrno::{AxResult, ax_err};

use crate::{GuestVirtAddr, VcpuState};

/// Tracer state shared by every CPU.
///
/// Written by the CPU that takes the arming `#BP` and read by whichever CPU
/// later handles execute faults in the traced range. The traced thread is
/// pinned to one processor, so reads and writes for a session come from the
/// same CPU.
#[derive(Debug)]
pub struct TracerState {
    initialized: AtomicBool,
    start_address: AtomicUsize,
    thread_id: AtomicUsize,
    range_base: AtomicUsize,
    range_size: AtomicUsize,
    paused: AtomicBool,
}

impl TracerState {
    /// Creates an uninitialized tracer.
    pub const fn new() -> Self {
        Self {
            initialized: AtomicBool::new(false),
            start_address: AtomicUsize::new(0),
            thread_id: AtomicUsize::new(0),
            range_base: AtomicUsize::new(0),
            range_size: AtomicUsize::new(0),
            paused: AtomicBool::new(false),
        }
    }

    /// One-shot initialization: tracing arms when the guest hits a `#BP` at
    /// `start_address` and covers `[range_base, range_base + range_size)`.
    pub fn init(
        &self,
        start_address: GuestVirtAddr,
        range_base: GuestVirtAddr,
        range_size: usize,
    ) -> AxResult {
        if self.initialized.load(Ordering::Acquire) {
            return ax_err!(AlreadyExists, "branch tracer already initialized");
        }
        if range_size == 0 || range_base.as_usize().checked_add(range_size).is_none() {
            return ax_err!(InvalidInput, "traced range is empty or wraps the address space");
        }
        self.start_address
            .store(start_address.as_usize(), Ordering::Relaxed);
        self.range_base.store(range_base.as_usize(), Ordering::Relaxed);
        self.range_size.store(range_size, Ordering::Relaxed);
        self.initialized.store(true, Ordering::Release);
        info!(
            "branch tracer initialized: start {:?}, range [{:?}, +{:#x})",
            start_address, range_base, range_size
        );
        Ok(())
    }

    /// Whether [`init`](Self::init) has run.
    pub fn is_initialized(&self) -> bool {
        self.initialized.load(Ordering::Acquire)
    }

    /// Guest address whose `#BP` arms the tracer.
    pub fn start_address(&self) -> GuestVirtAddr {
        GuestVirtAddr::from_usize(self.start_address.load(Ordering::Relaxed))
    }

    /// The traced thread, once armed.
    pub fn thread_id(&self) -> Option<usize> {
        match self.thread_id.load(Ordering::Acquire) {
            0 => None,
            id => Some(id),
        }
    }

    /// Binds the tracer to `thread_id` unless a thread is already bound.
    /// Returns whether this call performed the binding.
    pub(crate) fn try_bind_thread(&self, thread_id: usize) -> bool {
        self.thread_id
            .compare_exchange(0, thread_id, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    /// Whether `rip` lies inside the traced range.
    pub fn in_range(&self, rip: GuestVirtAddr) -> bool {
        let base = self.range_base.load(Ordering::Relaxed);
        let size = self.range_size.load(Ordering::Relaxed);
        let rip = rip.as_usize();
        rip >= base && rip - base < size
    }

    /// Whether tracing is suspended.
    pub fn is_paused(&self) -> bool {
        self.paused.load(Ordering::Acquire)
    }

    /// Marks tracing suspended or running.
    pub fn set_paused(&self, paused: bool) {
        self.paused.store(paused, Ordering::Release);
    }
}

impl Default for TracerState {
    fn default() -> Self {
        Self::new()
    }
}

/// The tracer component driven by the exit handlers.
pub trait BranchTracer: Send + Sync {
    /// Begins tracing on this CPU.
    fn start(&self, state: &TracerState, vcpu: &mut VcpuState);
    /// Suspends tracing, e.g. while a sandboxed access is single-stepped.
    fn pause(&self, state: &TracerState, vcpu: &mut VcpuState);
    /// Re-arms tracing after a view switch.
    fn resume(&self, state: &TracerState, vcpu: &mut VcpuState);
}

/// Traces branches with RFLAGS.TF plus DEBUGCTL.BTF, so the guest takes a
/// `#DB` on every taken branch.
#[derive(Debug, Default, Clone, Copy)]
pub struct SingleStepTracer;

impl BranchTracer for SingleStepTracer {
    fn start(&self, state: &TracerState, vcpu: &mut VcpuState) {
        vcpu.set_trap_flag(true);
        vcpu.set_branch_trap(true);
        state.set_paused(false);
        debug!("branch tracing started at {:?}", vcpu.guest_rip());
    }

    fn pause(&self, state: &TracerState, vcpu: &mut VcpuState) {
        vcpu.set_branch_trap(false);
        vcpu.set_trap_flag(false);
        state.set_paused(true);
    }

    fn resume(&self, state: &TracerState, vcpu: &mut VcpuState) {
        // Nothing to re-arm before the arming #BP bound a thread.
        if state.thread_id().is_none() {
            return;
        }
        vcpu.set_trap_flag(true);
        vcpu.set_branch_trap(true);
        state.set_paused(false);
    }
}
