use alloc::vec::Vec;

use spin::Mutex;

use crate::{GuestPhysAddr, GuestVirtAddr};

/// An execution hook backed by the Shadow view.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NptHook {
    /// Guest virtual address the hook was planted at.
    pub address: GuestVirtAddr,
    /// Page containing the hooked code.
    pub guest_physical: GuestPhysAddr,
}

/// A page whose code runs in the Sandbox view.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SandboxPage {
    /// The sandboxed page.
    pub guest_physical: GuestPhysAddr,
    /// Reads and writes of this page from sandboxed code are single-stepped.
    pub unreadable: bool,
}

/// An ordered set of hook entries shared by every CPU.
pub struct HookRegistry<T> {
    entries: Mutex<Vec<T>>,
}

impl<T> HookRegistry<T> {
    /// Creates an empty registry.
    pub const fn new() -> Self {
        Self {
            entries: Mutex::new(Vec::new()),
        }
    }

    /// Appends `entry`.
    pub fn insert(&self, entry: T) {
        self.entries.lock().push(entry);
    }

    /// Removes every entry matching `predicate` and returns them in order.
    pub fn remove_where(&self, mut predicate: impl FnMut(&T) -> bool) -> Vec<T> {
        let mut entries = self.entries.lock();
        let mut removed = Vec::new();
        let mut index = 0;
        while index < entries.len() {
            if predicate(&entries[index]) {
                removed.push(entries.remove(index));
            } else {
                index += 1;
            }
        }
        removed
    }

    /// Whether any entry matches `predicate`.
    pub fn contains(&self, predicate: impl FnMut(&T) -> bool) -> bool {
        self.entries.lock().iter().any(predicate)
    }

    /// Number of entries.
    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    /// Whether the registry has no entries.
    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }
}

impl<T: Clone> HookRegistry<T> {
    /// Returns the first entry matching `predicate`, in insertion order.
    pub fn find_first(&self, mut predicate: impl FnMut(&T) -> bool) -> Option<T> {
        self.entries.lock().iter().find(|e| predicate(e)).cloned()
    }
}

impl<T> Default for HookRegistry<T> {
    fn default() -> Self {
        Self::new()
    }
}
