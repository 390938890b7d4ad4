//! Host page-allocator interface
//!
//! Mirrors the small slice of the host allocator the move protocol needs:
//! node-exact allocation, reference stealing and bare re-assignment.

use bitflags::bitflags;
use crate::{guest::DomainId, Mfn, NodeId};

bitflags! {
    /// Allocation and ownership-transfer flags.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct MemFlags: u32 {
        /// Transfer the page without touching the domain's allocation count.
        const NO_REFCOUNT = 1 << 0;
        /// Fail rather than fall back to another node.
        const EXACT_NODE = 1 << 1;
    }
}

pub trait PageAllocator: Sync {
    /// Allocate one free page on `node`. With `EXACT_NODE`, `None` means the
    /// node has no free page; without it the allocator may spill elsewhere.
    fn alloc_page_on_node(&self, node: NodeId, flags: MemFlags) -> Option<Mfn>;

    /// Return a never-assigned page to the free pool.
    fn free_page(&self, mfn: Mfn);

    /// Strip `domain`'s last reference to `mfn` while leaving the caller a
    /// raw reference. Returns false when the page is still in use elsewhere
    /// or no longer belongs to the domain.
    fn steal_page(&self, domain: DomainId, mfn: Mfn, flags: MemFlags) -> bool;

    /// Hand a page to `domain` as a bare page. Returns false when the domain
    /// is dying or over quota.
    fn assign_page(&self, domain: DomainId, mfn: Mfn, flags: MemFlags) -> bool;

    /// Drop the caller's raw reference; the last drop frees the page.
    fn put_page(&self, mfn: Mfn);
}
