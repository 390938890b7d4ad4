//! Cycle counter for the statistics block

/// Read the CPU cycle counter. Returns 0 on targets without a cheap
/// monotonic counter; the statistics degrade to pure event counts there.
#[inline]
pub fn now() -> u64 {
    #[cfg(target_arch = "x86_64")]
    {
        unsafe { core::arch::x86_64::_rdtsc() }
    }
    #[cfg(not(target_arch = "x86_64"))]
    {
        0
    }
}
