use crate::{
    CallbackKind, GuestPhysAddr, GuestVirtAddr, HostPhysAddr, IcedDecoder,
    InstrumentationSink, NptConfig, NptContext, NptHal, PhysMemRange, SingleStepTracer,
    VcpuState, guest,
};
use alloc::{boxed::Box, collections::BTreeMap, vec, vec::Vec};
use core::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use lazy_static::lazy_static;
use memory_addr::{PhysAddr, VirtAddr};
use page_table_multiarch::PagingHandler;
use spin::Mutex;

use memory_addr::PAGE_SIZE_4K as PAGE_SIZE;

/// The starting physical address for the simulated memory region in tests.
/// This offset is used to map simulated physical addresses to the `MEMORY` array's virtual address space.
pub(crate) const BASE_PADDR: usize = 0x1000;

/// Static variables to simulate global state of a memory allocator in tests.
pub(crate) static NEXT_PADDR: AtomicUsize = AtomicUsize::new(BASE_PADDR);

/// Total length of the simulated physical memory block for testing, in bytes.
/// Four fully built views plus a few hooks fit comfortably.
pub(crate) const MEMORY_LEN: usize = 0x40000;

/// Local APIC base reported by [`MockHal`].
pub(crate) const TEST_APIC_BASE: usize = 0xfee0_0000;
/// Host CR3 reported by [`MockHal`].
pub(crate) const TEST_SYSTEM_CR3: u64 = 0x1ad000;
pub(crate) const TEST_THREAD_ID: usize = 0x1c4;
pub(crate) const TEST_PROCESSOR_ID: usize = 2;

// Use #[repr(align(4096))] to ensure 4KB alignment
#[repr(align(4096))]
pub(crate) struct AlignedMemory([u8; MEMORY_LEN]);

impl Default for AlignedMemory {
    fn default() -> Self {
        Self([0; MEMORY_LEN])
    }
}

lazy_static! {
    /// Simulates the actual physical memory block used for allocation.
    pub(crate) static ref MEMORY: Mutex<AlignedMemory> = Mutex::new(AlignedMemory::default());

    /// Global mutex to enforce serial execution for tests that modify shared state.
    /// This ensures test isolation and prevents race conditions between tests.
    pub(crate) static ref TEST_MUTEX: Mutex<()> = Mutex::new(());

    /// Guest code bytes visible through the flat guest address space, by address.
    static ref GUEST_CODE: Mutex<BTreeMap<usize, u8>> = Mutex::new(BTreeMap::new());

    /// Callbacks delivered to [`RecordingSink`], in order.
    static ref CALLBACKS: Mutex<Vec<RecordedCallback>> = Mutex::new(Vec::new());
}

/// Counter to track the number of allocations.
pub(crate) static ALLOC_COUNT: AtomicUsize = AtomicUsize::new(0);

/// Counter to track the number of deallocations.
pub(crate) static DEALLOC_COUNT: AtomicUsize = AtomicUsize::new(0);

/// Flag to simulate memory allocation failures for testing error handling.
pub(crate) static ALLOC_SHOULD_FAIL: AtomicBool = AtomicBool::new(false);

/// When set, guest virtual addresses translate 1:1 and guest memory reads
/// come from `GUEST_CODE` instead of walking real guest page tables.
static GUEST_FLAT: AtomicBool = AtomicBool::new(false);

/// Last mask passed to `set_thread_affinity`, or 0 if none.
static LAST_AFFINITY: AtomicUsize = AtomicUsize::new(0);

#[derive(Debug)]
/// A mock implementation of NptHal for testing purposes.
/// It simulates memory allocation and deallocation without actual hardware interaction.
///
/// The `Debug` trait is derived because `assert_matches!` on `Result<PhysFrame<MockHal>, _>`
/// requires `PhysFrame<MockHal>` (the `T` type) to implement `Debug` for diagnostic output on assertion failure.
pub(crate) struct MockHal {}

impl PagingHandler for MockHal {
    fn alloc_frame() -> Option<PhysAddr> {
        Self::mock_alloc_frame()
    }

    fn dealloc_frame(_paddr: PhysAddr) {
        Self::mock_dealloc_frame(_paddr)
    }

    fn phys_to_virt(paddr: PhysAddr) -> VirtAddr {
        Self::mock_phys_to_virt(paddr)
    }
}

impl NptHal for MockHal {
    fn physical_memory_ranges() -> Vec<PhysMemRange> {
        test_ranges()
    }

    fn apic_base() -> HostPhysAddr {
        HostPhysAddr::from_usize(TEST_APIC_BASE)
    }

    fn system_cr3() -> u64 {
        TEST_SYSTEM_CR3
    }

    fn current_thread_id() -> usize {
        TEST_THREAD_ID
    }

    fn current_processor_id() -> usize {
        TEST_PROCESSOR_ID
    }

    fn set_thread_affinity(mask: usize) {
        LAST_AFFINITY.store(mask, Ordering::SeqCst);
    }

    fn guest_virt_to_phys(guest_cr3: u64, gva: GuestVirtAddr) -> Option<GuestPhysAddr> {
        if GUEST_FLAT.load(Ordering::SeqCst) {
            return Some(GuestPhysAddr::from_usize(gva.as_usize()));
        }
        guest::walk_guest::<Self>(guest_cr3, gva)
    }

    fn read_guest_virt(guest_cr3: u64, gva: GuestVirtAddr, buf: &mut [u8]) -> usize {
        if !GUEST_FLAT.load(Ordering::SeqCst) {
            return guest::read_guest_code::<Self>(guest_cr3, gva, buf);
        }
        let code = GUEST_CODE.lock();
        let mut copied = 0;
        for (i, byte) in buf.iter_mut().enumerate() {
            match code.get(&gva.as_usize().wrapping_add(i)) {
                Some(b) => *byte = *b,
                None => break,
            }
            copied += 1;
        }
        copied
    }
}

/// An [`InstrumentationSink`] that remembers every callback it receives.
pub(crate) struct RecordingSink;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct RecordedCallback {
    pub kind: CallbackKind,
    pub system_context: bool,
    pub rip: u64,
}

impl InstrumentationSink for RecordingSink {
    fn invoke(&self, vcpu: &mut VcpuState, kind: CallbackKind, system_context: bool) {
        CALLBACKS.lock().push(RecordedCallback {
            kind,
            system_context,
            rip: vcpu.rip,
        });
    }
}

/// Two small RAM runs: 8 pages at 1 MiB and 4 pages at 2 MiB.
pub(crate) fn test_ranges() -> Vec<PhysMemRange> {
    vec![
        PhysMemRange::new(0x10_0000, 8 * PAGE_SIZE),
        PhysMemRange::new(0x20_0000, 4 * PAGE_SIZE),
    ]
}

/// Switches the guest to the flat address space and places `bytes` at `addr`.
pub(crate) fn set_guest_code(addr: usize, bytes: &[u8]) {
    GUEST_FLAT.store(true, Ordering::SeqCst);
    let mut code = GUEST_CODE.lock();
    for (i, b) in bytes.iter().enumerate() {
        code.insert(addr.wrapping_add(i), *b);
    }
}

pub(crate) fn recorded_callbacks() -> Vec<RecordedCallback> {
    CALLBACKS.lock().clone()
}

pub(crate) fn last_affinity() -> Option<usize> {
    match LAST_AFFINITY.load(Ordering::SeqCst) {
        0 => None,
        mask => Some(mask),
    }
}

/// Builds a context over [`MockHal`] with the single-step tracer, the
/// recording sink and the iced decoder.
pub(crate) fn mock_context(config: NptConfig) -> NptContext<MockHal> {
    NptContext::new(
        config,
        Box::new(SingleStepTracer),
        Box::new(RecordingSink),
        Box::new(IcedDecoder),
    )
    .unwrap()
}

/// A utility decorator for test functions that require the MockHal state to be reset before execution.
pub(crate) fn mock_hal_test<F, R>(test_fn: F) -> R
where
    F: FnOnce() -> R,
{
    let _guard = TEST_MUTEX.lock();
    MockHal::reset_state();
    test_fn()
}

/// A utility function to verify the number of deallocations performed by the MockHal.
pub(crate) fn test_dealloc_count(expected: usize) {
    let actual_dealloc_count = DEALLOC_COUNT.load(Ordering::SeqCst);
    assert_eq!(
        actual_dealloc_count, expected,
        "Expected {expected} deallocations, but found {actual_dealloc_count}"
    );
}

impl MockHal {
    /// Simulates the allocation of a single physical frame.
    fn mock_alloc_frame() -> Option<PhysAddr> {
        if ALLOC_SHOULD_FAIL.load(Ordering::SeqCst) {
            return None;
        }

        let paddr = NEXT_PADDR.fetch_add(PAGE_SIZE, Ordering::SeqCst);
        if paddr >= MEMORY_LEN + BASE_PADDR {
            return None;
        }
        ALLOC_COUNT.fetch_add(1, Ordering::SeqCst);
        Some(PhysAddr::from_usize(paddr))
    }

    /// Simulates the deallocation of a single physical frame.
    fn mock_dealloc_frame(_paddr: PhysAddr) {
        DEALLOC_COUNT.fetch_add(1, Ordering::SeqCst);
    }

    /// In this test mock, the "virtual address" is simply a direct pointer
    /// to the corresponding location within the `MEMORY` array.
    fn mock_phys_to_virt(paddr: PhysAddr) -> VirtAddr {
        let paddr_usize = paddr.as_usize();
        assert!(
            paddr_usize >= BASE_PADDR && paddr_usize < BASE_PADDR + MEMORY_LEN,
            "Physical address {:#x} out of bounds",
            paddr_usize
        );
        let offset = paddr_usize - BASE_PADDR;
        VirtAddr::from_usize(MEMORY.lock().0.as_ptr() as usize + offset)
    }

    /// Helper function to control the simulated allocation failure.
    pub(crate) fn set_alloc_fail(fail: bool) {
        ALLOC_SHOULD_FAIL.store(fail, Ordering::SeqCst);
    }

    /// Resets all static state of the MockHal to its initial, clean state.
    /// This is crucial for ensuring test isolation between individual test functions.
    pub(crate) fn reset_state() {
        NEXT_PADDR.store(BASE_PADDR, Ordering::SeqCst);
        ALLOC_SHOULD_FAIL.store(false, Ordering::SeqCst);
        ALLOC_COUNT.store(0, Ordering::SeqCst);
        DEALLOC_COUNT.store(0, Ordering::SeqCst);
        GUEST_FLAT.store(false, Ordering::SeqCst);
        LAST_AFFINITY.store(0, Ordering::SeqCst);
        GUEST_CODE.lock().clear();
        CALLBACKS.lock().clear();
        // Lock and clear the simulated memory.
        MEMORY.lock().0.fill(0);
    }
}
