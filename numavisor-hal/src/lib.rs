#![cfg_attr(not(test), no_std)]
#![deny(unsafe_op_in_unsafe_fn)]

//! Host interface layer for the Numavisor page-migration monitor
//!
//! This crate defines the contracts between the monitor and the surrounding
//! hypervisor: the hardware sample sources, the page allocator, the guest
//! physmap, the NUMA topology and the guest execution context. The monitor
//! core only ever talks to these traits, which keeps it portable across
//! hosts and testable against software fakes.

pub mod arch;
pub mod cycles;
pub mod guest;
pub mod host;
pub mod irq;
pub mod pages;
pub mod physmap;
pub mod sampling;
pub mod topology;

use static_assertions::const_assert;

/// Machine frame number: host-physical page frame identifier.
pub type Mfn = u64;

/// Guest frame number: a page in a guest's physical address space.
pub type Gfn = u64;

/// Host-physical byte address.
pub type PhysicalAddress = u64;

/// Guest-linear byte address.
pub type VirtualAddress = u64;

/// NUMA node identifier, in `[0, MAX_NODES)`.
pub type NodeId = u32;

pub const PAGE_SHIFT: u32 = 12;
pub const PAGE_SIZE: usize = 1 << PAGE_SHIFT;

/// Sentinel for an empty or unresolvable frame number.
pub const INVALID_MFN: Mfn = Mfn::MAX;
pub const INVALID_GFN: Gfn = Gfn::MAX;

const_assert!(PAGE_SIZE == 4096);

/// A frame number is usable iff it is not the sentinel.
#[inline]
pub fn mfn_valid(mfn: Mfn) -> bool {
    mfn != INVALID_MFN
}

#[inline]
pub fn mfn_to_paddr(mfn: Mfn) -> PhysicalAddress {
    mfn << PAGE_SHIFT
}

#[inline]
pub fn paddr_to_mfn(paddr: PhysicalAddress) -> Mfn {
    paddr >> PAGE_SHIFT
}

// Re-export core traits
pub use guest::{ActiveGuest, DomainId, GuestContext, GuestType, DOMID_FIRST_RESERVED};
pub use host::HostServices;
pub use irq::{LocalIrq, NativeIrq};
pub use pages::{MemFlags, PageAllocator};
pub use physmap::{GuestPhysmap, MapAccess, MapKind, PhysmapEntry};
pub use sampling::{
    RecordMode, SampleEvent, SampleHandler, SampleRecord, SampleSource, SourceError,
};
pub use topology::{NodeInfo, Topology, MAX_NODES};
