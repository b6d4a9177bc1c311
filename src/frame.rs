use core::marker::PhantomData;

use axerrno::{AxResult, ax_err_type};

use crate::{HostPhysAddr, NptHal, addr::PAGE_SIZE};

/// A physical frame which will be automatically deallocated when dropped.
///
/// Nested page tables keep every table page they own as a [`PhysFrame`], so a
/// view releases its whole hierarchy when it is dropped.
#[derive(Debug)]
pub struct PhysFrame<H: NptHal> {
    start_paddr: HostPhysAddr,
    _marker: PhantomData<H>,
}

impl<H: NptHal> PhysFrame<H> {
    /// Allocate a [`PhysFrame`].
    pub fn alloc() -> AxResult<Self> {
        let start_paddr = H::alloc_frame()
            .ok_or_else(|| ax_err_type!(NoMemory, "allocate physical frame failed"))?;
        assert_ne!(start_paddr.as_usize(), 0);
        Ok(Self {
            start_paddr,
            _marker: PhantomData,
        })
    }

    /// Allocate a [`PhysFrame`] and fill it with zeros.
    pub fn alloc_zero() -> AxResult<Self> {
        let mut f = Self::alloc()?;
        f.fill(0);
        Ok(f)
    }

    /// Get the starting physical address of the frame.
    pub fn start_paddr(&self) -> HostPhysAddr {
        self.start_paddr
    }

    /// Physical frame number of the frame.
    pub fn pfn(&self) -> usize {
        self.start_paddr.as_usize() / PAGE_SIZE
    }

    /// Get a mutable pointer to the frame.
    pub fn as_mut_ptr(&self) -> *mut u8 {
        H::phys_to_virt(self.start_paddr).as_mut_ptr()
    }

    /// Fill the frame with a byte.
    pub fn fill(&mut self, byte: u8) {
        unsafe { core::ptr::write_bytes(self.as_mut_ptr(), byte, PAGE_SIZE) }
    }
}

impl<H: NptHal> Drop for PhysFrame<H> {
    fn drop(&mut self) {
        H::dealloc_frame(self.start_paddr);
        trace!("deallocated PhysFrame({:#x})", self.start_paddr);
    }
}
