//! [ArceOS-Hypervisor](https://github.com/arceos-hypervisor/) nested page table views for AMD SVM.
//!
//! The crate keeps several second-level page-table hierarchies ("views") over the
//! same guest physical address space and moves the guest between them on nested
//! page faults. Execute-disable differences between the views are used to
//! intercept code execution for NPT hooks and sandboxed pages, and a guest `#BP`
//! arms a single-step branch tracer.

#![no_std]

#[macro_use]
extern crate log;
extern crate alloc;

mod addr;
mod arch;
mod breakpoint;
mod callback;
mod context;
mod decode;
mod frame;
mod guest;
mod hal;
mod hook;
mod npf;
mod npt;
mod split;
mod tracer;
mod view;
mod vmcb;

#[cfg(test)]
pub(crate) mod test_utils;

pub use addr::*;
pub use breakpoint::BreakpointOutcome;
pub use callback::{CallbackKind, InstrumentationSink};
pub use context::{NptConfig, NptContext, TracerConfig};
pub use decode::{IcedDecoder, InstructionDecoder, MAX_INSTRUCTION_LEN};
pub use frame::PhysFrame;
pub use guest::{read_guest_code, walk_guest};
pub use hal::{NptHal, PhysMemRange};
pub use hook::{HookRegistry, NptHook, SandboxPage};
pub use npf::{NpfPlan, NptAction, NptFault};
pub use npt::{NestedPageTable, NptEntry, NptFlags, npt_indices};
pub use split::SplitDecision;
pub use tracer::{BranchTracer, SingleStepTracer, TracerState};
pub use view::{VIEW_COUNT, ViewKind, ViewSet};
pub use vmcb::{NpfExitInfo, VcpuState};

pub use page_table_entry::MappingFlags;
