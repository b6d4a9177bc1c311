//! Nested page fault (#NPF) dispatch.
//!
//! Each exit is handled in two steps: [`NptContext::decide`] inspects the
//! fault, the views and the registries and produces an ordered [`NpfPlan`];
//! [`NptContext::apply`] then carries the plan out against the views and the
//! faulting CPU's state.

use axerrno::{AxResult, ax_err_type};
use page_table_entry::MappingFlags;

use crate::{
    CallbackKind, GuestPhysAddr, GuestVirtAddr, NpfExitInfo, NptContext, NptHal, VcpuState,
    ViewKind, addr::gpa_page,
};

const MAX_ACTIONS: usize = 4;

const RWX: MappingFlags = MappingFlags::READ
    .union(MappingFlags::WRITE)
    .union(MappingFlags::EXECUTE);

/// The fault being handled, as read from the faulting CPU.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NptFault {
    /// Faulting guest physical address.
    pub gpa: GuestPhysAddr,
    /// #NPF error code.
    pub info: NpfExitInfo,
    /// Guest instruction pointer.
    pub rip: GuestVirtAddr,
    /// Guest CR3.
    pub guest_cr3: u64,
    /// View that was active when the fault happened.
    pub active: ViewKind,
}

/// One step of handling a nested page fault.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NptAction {
    /// Demand-map the page RWX into `view`.
    MapMissing {
        view: ViewKind,
        gpa: GuestPhysAddr,
    },
    /// Pause the tracer, set the trap flag and move to SandboxSingleStep so a
    /// single sandboxed access can execute.
    ArmSingleStep,
    /// Re-arm the branch tracer after a view switch.
    ResumeTracer,
    /// Raise an instrumentation callback.
    Callback {
        kind: CallbackKind,
        system_context: bool,
    },
    /// Clear execute-disable on both pages of a page-straddling instruction.
    ExposeSplit {
        view: ViewKind,
        first: GuestPhysAddr,
        second: Option<GuestPhysAddr>,
    },
    /// Load the root of another view.
    SwitchView(ViewKind),
    /// Nothing to do.
    NoAction,
}

/// Ordered actions for one #NPF exit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NpfPlan {
    actions: [NptAction; MAX_ACTIONS],
    len: usize,
}

impl NpfPlan {
    const fn new() -> Self {
        Self {
            actions: [NptAction::NoAction; MAX_ACTIONS],
            len: 0,
        }
    }

    fn push(&mut self, action: NptAction) {
        debug_assert!(self.len < MAX_ACTIONS);
        self.actions[self.len] = action;
        self.len += 1;
    }

    /// The actions, in execution order. Never empty.
    pub fn actions(&self) -> &[NptAction] {
        &self.actions[..self.len]
    }

    /// The view this plan finally switches to, if any.
    pub fn switches_to(&self) -> Option<ViewKind> {
        self.actions().iter().rev().find_map(|a| match a {
            NptAction::SwitchView(kind) => Some(*kind),
            NptAction::ArmSingleStep => Some(ViewKind::SandboxSingleStep),
            _ => None,
        })
    }
}

impl<H: NptHal> NptContext<H> {
    /// Reads the fault out of `vcpu`. Fails if nCR3 selects none of the views.
    pub fn read_fault(&self, vcpu: &VcpuState) -> AxResult<NptFault> {
        let active = self.views.kind_of(vcpu.active_root()).ok_or_else(|| {
            error!("#NPF with unknown nCR3 {:#x}", vcpu.ncr3);
            ax_err_type!(BadState, "nCR3 does not belong to any view")
        })?;
        Ok(NptFault {
            gpa: vcpu.fault_gpa(),
            info: vcpu.npf_exit_info(),
            rip: vcpu.guest_rip(),
            guest_cr3: vcpu.cr3,
            active,
        })
    }

    /// Decides how to handle `fault` without changing any state.
    pub fn decide(&self, fault: &NptFault) -> NpfPlan {
        let mut plan = NpfPlan::new();

        if !fault.info.contains(NpfExitInfo::VALID) {
            let page = gpa_page(fault.gpa);
            let denied = self
                .sandbox_pages
                .find_first(|p| p.unreadable && p.guest_physical == page)
                .is_some();
            if denied && fault.active == ViewKind::Sandbox {
                plan.push(NptAction::ArmSingleStep);
            } else {
                plan.push(NptAction::MapMissing {
                    view: fault.active,
                    gpa: fault.gpa,
                });
            }
            return plan;
        }

        if fault.info.contains(NpfExitInfo::EXECUTE) {
            if self.tracer_state.in_range(fault.rip) {
                plan.push(NptAction::ResumeTracer);
            }

            if fault.active == ViewKind::Sandbox {
                plan.push(NptAction::Callback {
                    kind: CallbackKind::SandboxExecute,
                    system_context: fault.guest_cr3 == H::system_cr3(),
                });
            }

            if self.views.is_executable(ViewKind::Sandbox, fault.gpa) {
                plan.push(NptAction::SwitchView(ViewKind::Sandbox));
                return plan;
            }

            let hooked = self.views.is_executable(ViewKind::Shadow, fault.gpa);
            let split = self.split_instruction(fault, hooked);
            if let Some(expose) = split.expose {
                plan.push(expose);
            }
            if split.switch_view {
                plan.push(NptAction::SwitchView(if hooked {
                    ViewKind::Shadow
                } else {
                    ViewKind::Primary
                }));
            }
        }

        if plan.len == 0 {
            plan.push(NptAction::NoAction);
        }
        plan
    }

    /// Carries out `plan` for the faulting CPU.
    ///
    /// A failed demand mapping leaves the guest without a translation and is
    /// returned as `NoMemory`; the caller must not resume the guest.
    pub fn apply(&self, vcpu: &mut VcpuState, plan: &NpfPlan) -> AxResult {
        for action in plan.actions() {
            match *action {
                NptAction::MapMissing { view, gpa } => {
                    self.views.with(view, |npt| npt.assign(gpa, RWX))?;
                }
                NptAction::ArmSingleStep => {
                    trace!("single-stepping sandboxed access at {:?}", vcpu.guest_rip());
                    self.tracer.pause(&self.tracer_state, vcpu);
                    vcpu.set_trap_flag(true);
                    vcpu.set_active_root(self.views.root(ViewKind::SandboxSingleStep));
                }
                NptAction::ResumeTracer => self.tracer.resume(&self.tracer_state, vcpu),
                NptAction::Callback {
                    kind,
                    system_context,
                } => self.sink.invoke(vcpu, kind, system_context),
                NptAction::ExposeSplit {
                    view,
                    first,
                    second,
                } => {
                    for page in [Some(first), second].into_iter().flatten() {
                        let exposed = self
                            .views
                            .with(view, |npt| npt.update(page, |e| e.set_executable(true)));
                        if exposed.is_none() {
                            warn!(
                                "split instruction page {:?} not mapped in {:?}",
                                page, view
                            );
                        }
                    }
                }
                NptAction::SwitchView(kind) => {
                    vcpu.set_active_root(self.views.root(kind));
                }
                NptAction::NoAction => {}
            }
        }
        Ok(())
    }

    /// Handles one #NPF exit on the CPU described by `vcpu`.
    pub fn handle_npf(&self, vcpu: &mut VcpuState) -> AxResult<NpfPlan> {
        vcpu.flush_nested_translations();

        let fault = self.read_fault(vcpu)?;
        trace!(
            "#NPF {:?} at {:?}, rip {:?}, view {:?}",
            fault.info, fault.gpa, fault.rip, fault.active
        );

        let plan = self.decide(&fault);
        self.apply(vcpu, &plan)?;
        if let Some(kind) = plan.switches_to() {
            debug!("view {:?} -> {:?} at {:?}", fault.active, kind, fault.rip);
        }
        Ok(plan)
    }
}
