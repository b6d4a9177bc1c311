use crate::VcpuState;

/// Instrumentation callbacks raised from the fault handlers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallbackKind {
    /// Sandboxed code is executing outside the sandbox.
    SandboxExecute,
}

/// Receives instrumentation callbacks.
///
/// Invoked from the VM-exit context of the faulting CPU; implementations may
/// redirect guest execution by editing `vcpu`.
pub trait InstrumentationSink: Send + Sync {
    /// `system_context` is `true` when the guest was running on the system
    /// (host) CR3 rather than a process address space.
    fn invoke(&self, vcpu: &mut VcpuState, kind: CallbackKind, system_context: bool);
}
