//! Privileged register access used by the default [`NptHal`](crate::NptHal) methods.

cfg_if::cfg_if! {
    if #[cfg(target_arch = "x86_64")] {
        mod x86_64;
        pub(crate) use self::x86_64::*;
    } else {
        use crate::HostPhysAddr;

        pub(crate) fn read_apic_base() -> HostPhysAddr {
            warn!("local APIC base is only available on x86_64");
            HostPhysAddr::from_usize(0)
        }

        pub(crate) fn read_cr3() -> u64 {
            0
        }
    }
}
