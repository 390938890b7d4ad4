//! Local interrupt window control
//!
//! The queue-binding probe runs inside the NMI handler but must walk guest
//! page tables, which can fault and therefore needs maskable interrupts
//! enabled. The handler opens a window through this trait and closes it
//! before resuming; the host decides what that means on its platform.

pub trait LocalIrq: Sync {
    /// Enable maskable interrupts on the calling CPU.
    fn irq_enable(&self);

    /// Disable maskable interrupts on the calling CPU.
    fn irq_disable(&self);
}

/// Direct flag manipulation for hosts that run the monitor on bare metal.
#[derive(Debug, Default, Clone, Copy)]
pub struct NativeIrq;

impl LocalIrq for NativeIrq {
    #[inline]
    fn irq_enable(&self) {
        #[cfg(target_arch = "x86_64")]
        x86_64::instructions::interrupts::enable();
    }

    #[inline]
    fn irq_disable(&self) {
        #[cfg(target_arch = "x86_64")]
        x86_64::instructions::interrupts::disable();
    }
}
