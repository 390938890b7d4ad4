//! Guest physmap interface
//!
//! The physmap binds guest frame numbers to machine frames for one domain.
//! The monitor reads it to resolve proposals and rewrites single entries
//! during a page move. Implementations carry their own locking; the move
//! protocol performs its only allocation before the first mutation here and
//! never calls back into the allocator between `set_entry` and `add_page`,
//! so `add_page` is always entered with no physmap lock held by the caller.

use crate::{guest::DomainId, Gfn, Mfn};

/// Classification of a physmap entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MapKind {
    /// Ordinary guest RAM.
    Ram,
    /// Deduplicated page shared between domains.
    Shared,
    /// Paged-out or otherwise absent backing.
    Paged,
    /// No entry at all.
    Unmapped,
}

/// Access applied when rewriting an entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MapAccess {
    /// Read-only, with guest writes raising a fault the host handler sees
    /// (never a silent hardware drop). Used to fence a page while its
    /// contents are copied.
    ReadOnlyFaulting,
    ReadWrite,
}

#[derive(Debug, Clone, Copy)]
pub struct PhysmapEntry {
    pub mfn: Mfn,
    pub kind: MapKind,
}

pub trait GuestPhysmap: Sync {
    /// Current binding of `gfn`, without taking a reference.
    fn query(&self, domain: DomainId, gfn: Gfn) -> PhysmapEntry;

    /// Rewrite the entry in place with the given access. Does not flush
    /// translation caches; callers pair it with `flush_gfn`.
    fn set_entry(&self, domain: DomainId, gfn: Gfn, mfn: Mfn, access: MapAccess);

    /// Install `mfn` at `gfn` with full access, replacing any prior binding.
    fn add_page(&self, domain: DomainId, gfn: Gfn, mfn: Mfn);

    /// Invalidate every host translation cache entry covering `gfn`.
    fn flush_gfn(&self, domain: DomainId, gfn: Gfn);

    /// Copy one page of contents from `src` to `dst`.
    fn copy_page(&self, dst: Mfn, src: Mfn);

    /// Whether the domain runs on a translated physmap (HVM) rather than
    /// managing machine frames itself.
    fn is_translated(&self, domain: DomainId) -> bool;

    /// Update the machine-to-guest reverse map for a non-translated domain.
    fn set_reverse_map(&self, mfn: Mfn, gfn: Gfn);
}
