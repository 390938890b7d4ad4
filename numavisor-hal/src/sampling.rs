//! Hardware access-sampling abstraction
//!
//! A sample source is a hardware facility (AMD IBS, Intel PEBS) that tags a
//! fraction of executed operations and reports the addresses they touched
//! through an NMI. The monitor does not care which facility is active; it
//! programs the source through this trait and receives `SampleRecord`s
//! through the registered handler.
//!
//! Handler contract: the handler is invoked at NMI priority on the CPU that
//! took the sample, with maskable interrupts disabled. It must not block and
//! must not allocate.

use bitflags::bitflags;
use crate::{PhysicalAddress, VirtualAddress};

bitflags! {
    /// Validity and classification flags of one sample record.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct RecordMode: u32 {
        /// The sample describes a retired micro-op (not an instruction fetch).
        const OP = 1 << 0;
        /// The linear-address field is valid.
        const DATA_LINEAR = 1 << 1;
        /// The physical-address field is valid.
        const DATA_PHYS = 1 << 2;
    }
}

/// One access sample, delivered at NMI priority.
#[derive(Debug, Clone, Copy)]
pub struct SampleRecord {
    pub mode: RecordMode,
    /// Logical id of the CPU that took the sample.
    pub cpu: u32,
    /// Guest-linear address of the sampled data access.
    pub linear: VirtualAddress,
    /// Host-physical address of the sampled data access.
    pub phys: PhysicalAddress,
}

/// Callback registered with a source; see the module docs for the contract.
pub type SampleHandler = fn(&SampleRecord);

/// Event class a source is programmed to sample.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SampleEvent {
    /// Data-memory operations (loads and stores).
    MemoryOps,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SourceError {
    /// The facility is absent or disabled on this CPU.
    Unsupported,
    /// The facility is owned by another client.
    Busy,
    /// The hardware rejected the requested programming.
    HardwareFault,
}

/// Driver interface for one sampling facility.
pub trait SampleSource: Sync {
    fn name(&self) -> &'static str;

    /// Whether the facility exists on this machine. Cheap; may be polled.
    fn capable(&self) -> bool;

    /// Claim exclusive ownership of the facility.
    fn acquire(&self) -> Result<(), SourceError>;

    /// Give the facility back. Only valid after a successful `acquire`.
    fn release(&self);

    fn set_event(&self, event: SampleEvent);

    /// Sampling period, in implementation-defined units (typically retired
    /// ops between samples).
    fn set_rate(&self, period: u64);

    fn set_handler(&self, handler: SampleHandler);

    fn enable(&self);

    /// Stop sampling. Must return only once no handler invocation is still
    /// running on any CPU; callers rely on this to tear down handler state.
    fn disable(&self);
}
