//! Aggregated host interface
//!
//! `start_monitoring` takes one object implementing every host-side concern;
//! the blanket impl lets hosts compose the traits on a single type.

use crate::guest::GuestContext;
use crate::irq::LocalIrq;
use crate::pages::PageAllocator;
use crate::physmap::GuestPhysmap;
use crate::topology::Topology;

pub trait HostServices:
    Topology + PageAllocator + GuestPhysmap + GuestContext + LocalIrq + Send + Sync
{
}

impl<T> HostServices for T where
    T: Topology + PageAllocator + GuestPhysmap + GuestContext + LocalIrq + Send + Sync
{
}
