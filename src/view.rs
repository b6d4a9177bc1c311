use axerrno::AxResult;
use page_table_entry::MappingFlags;
use spin::Mutex;

use crate::{GuestPhysAddr, HostPhysAddr, NestedPageTable, NptHal, addr::PAGE_SIZE};

numeric_enum_macro::numeric_enum! {
    #[repr(u8)]
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    /// One of the parallel nested page table hierarchies.
    pub enum ViewKind {
        /// Normal execution; NPT-hooked and sandboxed pages are execute-disabled.
        Primary = 0,
        /// Only NPT-hooked pages are executable.
        Shadow = 1,
        /// Only sandboxed pages are executable.
        Sandbox = 2,
        /// Everything accessible, used to single-step one sandboxed access.
        SandboxSingleStep = 3,
    }
}

/// Number of views.
pub const VIEW_COUNT: usize = 4;

impl ViewKind {
    /// All views, in index order.
    pub const ALL: [ViewKind; VIEW_COUNT] = [
        ViewKind::Primary,
        ViewKind::Shadow,
        ViewKind::Sandbox,
        ViewKind::SandboxSingleStep,
    ];

    const fn index(self) -> usize {
        self as usize
    }
}

/// The nested page tables of every view.
///
/// Each hierarchy sits behind its own lock so that CPUs faulting in different
/// views never contend; handlers never hold two view locks at once.
pub struct ViewSet<H: NptHal> {
    views: [Mutex<NestedPageTable<H>>; VIEW_COUNT],
    roots: [HostPhysAddr; VIEW_COUNT],
}

impl<H: NptHal> ViewSet<H> {
    /// Builds all views over the platform's physical memory, each with the
    /// permission policy at its index in `policies`.
    pub fn build(policies: &[MappingFlags; VIEW_COUNT]) -> AxResult<Self> {
        let ranges = H::physical_memory_ranges();
        let apic_base = H::apic_base();
        let build = |kind: ViewKind| -> AxResult<NestedPageTable<H>> {
            let mut npt = NestedPageTable::try_new()?;
            npt.build_identity(&ranges, apic_base, policies[kind.index()])?;
            info!(
                "{:?} view ready: nCR3 {:#x}, {} tables",
                kind,
                npt.root_paddr(),
                npt.table_count()
            );
            Ok(npt)
        };

        let views = [
            build(ViewKind::Primary)?,
            build(ViewKind::Shadow)?,
            build(ViewKind::Sandbox)?,
            build(ViewKind::SandboxSingleStep)?,
        ];
        let roots = views.each_ref().map(|npt| npt.root_paddr());
        Ok(Self {
            views: views.map(Mutex::new),
            roots,
        })
    }

    /// Root physical address of `kind`.
    pub fn root(&self, kind: ViewKind) -> HostPhysAddr {
        self.roots[kind.index()]
    }

    /// Resolves an nCR3 value to the view it selects.
    pub fn kind_of(&self, root: HostPhysAddr) -> Option<ViewKind> {
        let root = root.as_usize() & !(PAGE_SIZE - 1);
        ViewKind::ALL
            .into_iter()
            .find(|kind| self.roots[kind.index()].as_usize() == root)
    }

    /// Runs `f` with exclusive access to the table of `kind`.
    pub fn with<R>(&self, kind: ViewKind, f: impl FnOnce(&mut NestedPageTable<H>) -> R) -> R {
        f(&mut self.views[kind.index()].lock())
    }

    /// Whether `gpa` is mapped executable in `kind`.
    pub fn is_executable(&self, kind: ViewKind, gpa: GuestPhysAddr) -> bool {
        self.views[kind.index()].lock().is_executable(gpa)
    }
}
