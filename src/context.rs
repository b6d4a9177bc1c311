use alloc::boxed::Box;

use axerrno::AxResult;
use page_table_entry::MappingFlags;

use crate::{
    BranchTracer, GuestPhysAddr, GuestVirtAddr, HookRegistry, InstructionDecoder,
    InstrumentationSink, NptHal, NptHook, SandboxPage, TracerState, VIEW_COUNT, ViewKind,
    ViewSet, addr::gpa_page,
};

const RWX: MappingFlags = MappingFlags::READ
    .union(MappingFlags::WRITE)
    .union(MappingFlags::EXECUTE);
const RW: MappingFlags = MappingFlags::READ.union(MappingFlags::WRITE);

/// Where the branch tracer arms and what it covers.
#[derive(Debug, Clone, Copy)]
pub struct TracerConfig {
    /// A `#BP` at this address starts tracing.
    pub start_address: GuestVirtAddr,
    /// First traced address.
    pub range_base: GuestVirtAddr,
    /// Size of the traced range in bytes.
    pub range_size: usize,
}

/// Construction-time settings of an [`NptContext`].
#[derive(Debug, Clone)]
pub struct NptConfig {
    /// Permission policy each view is built with, indexed by [`ViewKind`].
    pub view_policies: [MappingFlags; VIEW_COUNT],
    /// Tracer to initialize right away, if any.
    pub tracer: Option<TracerConfig>,
}

impl Default for NptConfig {
    fn default() -> Self {
        Self {
            view_policies: [RWX, RW, RW, RWX],
            tracer: None,
        }
    }
}

impl NptConfig {
    fn policy(&self, kind: ViewKind) -> MappingFlags {
        self.view_policies[kind as usize]
    }
}

/// Everything the nested paging exit handlers share: the views, the hook
/// registries, the tracer state and the external collaborators.
///
/// One context serves every CPU; per-CPU state travels in [`VcpuState`](crate::VcpuState).
pub struct NptContext<H: NptHal> {
    pub(crate) config: NptConfig,
    pub(crate) views: ViewSet<H>,
    pub(crate) tracer_state: TracerState,
    pub(crate) npt_hooks: HookRegistry<NptHook>,
    pub(crate) sandbox_pages: HookRegistry<SandboxPage>,
    pub(crate) tracer: Box<dyn BranchTracer>,
    pub(crate) sink: Box<dyn InstrumentationSink>,
    pub(crate) decoder: Box<dyn InstructionDecoder>,
}

impl<H: NptHal> NptContext<H> {
    /// Builds every view and initializes the tracer if configured.
    pub fn new(
        config: NptConfig,
        tracer: Box<dyn BranchTracer>,
        sink: Box<dyn InstrumentationSink>,
        decoder: Box<dyn InstructionDecoder>,
    ) -> AxResult<Self> {
        let views = ViewSet::build(&config.view_policies)?;
        let tracer_state = TracerState::new();
        if let Some(tc) = config.tracer {
            tracer_state.init(tc.start_address, tc.range_base, tc.range_size)?;
        }
        Ok(Self {
            config,
            views,
            tracer_state,
            npt_hooks: HookRegistry::new(),
            sandbox_pages: HookRegistry::new(),
            tracer,
            sink,
            decoder,
        })
    }

    /// The nested page table views.
    pub fn views(&self) -> &ViewSet<H> {
        &self.views
    }

    /// Shared branch tracer state.
    pub fn tracer_state(&self) -> &TracerState {
        &self.tracer_state
    }

    /// Installed NPT hooks.
    pub fn npt_hooks(&self) -> &HookRegistry<NptHook> {
        &self.npt_hooks
    }

    /// Sandboxed and access-denied pages.
    pub fn sandbox_pages(&self) -> &HookRegistry<SandboxPage> {
        &self.sandbox_pages
    }

    /// Sets the execute permission of `gpa` in `kind`, mapping the page with
    /// the view's policy first if it was never assigned.
    fn set_executable(&self, kind: ViewKind, gpa: GuestPhysAddr, executable: bool) -> AxResult {
        let policy = self.config.policy(kind);
        self.views.with(kind, |npt| {
            if npt.update(gpa, |e| e.set_executable(executable)).is_none() {
                let flags = if executable {
                    policy | MappingFlags::EXECUTE
                } else {
                    policy - MappingFlags::EXECUTE
                };
                npt.assign(gpa, flags)?;
            }
            Ok(())
        })
    }

    /// Puts `gpa` back to the permissions its view was built with.
    fn restore_policy(&self, kind: ViewKind, gpa: GuestPhysAddr) -> AxResult {
        let policy = self.config.policy(kind);
        self.views.with(kind, |npt| npt.assign(gpa, policy).map(|_| ()))
    }

    /// Installs an execution hook at `address`, whose code lives in the page
    /// `guest_physical`.
    ///
    /// The page becomes executable only in the Shadow view, so the guest exits
    /// with #NPF when it starts executing it from the Primary view.
    pub fn install_npt_hook(
        &self,
        address: GuestVirtAddr,
        guest_physical: GuestPhysAddr,
    ) -> AxResult {
        let page = gpa_page(guest_physical);
        self.set_executable(ViewKind::Shadow, page, true)?;
        self.set_executable(ViewKind::Primary, page, false)?;
        self.npt_hooks.insert(NptHook {
            address,
            guest_physical: page,
        });
        debug!("NPT hook installed at {:?} ({:?})", address, page);
        Ok(())
    }

    /// Removes every hook planted at `address`. Returns how many were removed.
    pub fn remove_npt_hook(&self, address: GuestVirtAddr) -> AxResult<usize> {
        let removed = self.npt_hooks.remove_where(|h| h.address == address);
        for hook in &removed {
            let page = hook.guest_physical;
            if self.npt_hooks.contains(|h| h.guest_physical == page) {
                continue;
            }
            self.restore_policy(ViewKind::Shadow, page)?;
            if !self.sandbox_pages.contains(|p| p.guest_physical == page) {
                self.restore_policy(ViewKind::Primary, page)?;
            }
            debug!("NPT hook removed at {:?} ({:?})", address, page);
        }
        Ok(removed.len())
    }

    /// Moves the code page `gpa` into the sandbox: executable in the Sandbox
    /// view and execute-disabled in Primary and Shadow.
    pub fn sandbox_page(&self, gpa: GuestPhysAddr) -> AxResult {
        let page = gpa_page(gpa);
        self.set_executable(ViewKind::Sandbox, page, true)?;
        self.set_executable(ViewKind::Primary, page, false)?;
        self.set_executable(ViewKind::Shadow, page, false)?;
        self.sandbox_pages.insert(SandboxPage {
            guest_physical: page,
            unreadable: false,
        });
        debug!("sandboxed {:?}", page);
        Ok(())
    }

    /// Makes `gpa` unreachable from the Sandbox view, so every access from
    /// sandboxed code misses and is single-stepped in SandboxSingleStep.
    pub fn deny_sandbox_access(&self, gpa: GuestPhysAddr) -> AxResult {
        let page = gpa_page(gpa);
        self.views
            .with(ViewKind::Sandbox, |npt| npt.assign(page, MappingFlags::empty()))?;
        self.sandbox_pages.insert(SandboxPage {
            guest_physical: page,
            unreadable: true,
        });
        debug!("sandbox access to {:?} denied", page);
        Ok(())
    }

    /// Undoes [`sandbox_page`](Self::sandbox_page) and
    /// [`deny_sandbox_access`](Self::deny_sandbox_access) for `gpa`.
    pub fn release_sandbox_page(&self, gpa: GuestPhysAddr) -> AxResult<usize> {
        let page = gpa_page(gpa);
        let removed = self.sandbox_pages.remove_where(|p| p.guest_physical == page);
        if removed.is_empty() {
            return Ok(0);
        }
        self.restore_policy(ViewKind::Sandbox, page)?;
        if !self.npt_hooks.contains(|h| h.guest_physical == page) {
            self.restore_policy(ViewKind::Primary, page)?;
            self.restore_policy(ViewKind::Shadow, page)?;
        }
        Ok(removed.len())
    }
}
