//! Transparent page-move protocol
//!
//! Replaces the machine page backing one guest frame with a fresh page on a
//! target node without the guest observing torn state or losing writes. The
//! attempt walks idle → stolen → allocated → assigned → protected → copied
//! → remapped → released; every failure unwinds through compensations that
//! restore the guest exactly as it was. The compensations live in the drop
//! glue of `StolenPage` and `FreshPage`, so no failure arm can forget one.
//!
//! While the frame is protected (read-only, pre-remap), a concurrent guest
//! write parks on the fault-protection cell; reads stay legal because the
//! copy happens with writes fenced off.

use numavisor_hal::{
    mfn_valid, DomainId, Gfn, HostServices, MapAccess, MapKind, MemFlags, Mfn, NodeId,
};

use crate::fault::MovedGfnCell;

/// Per-proposal failure classes; each aborts one attempt and nothing else.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MoveError {
    /// The gfn is unresolvable or not backed by ordinary RAM.
    InvalidMapping,
    /// Deduplicated pages are never moved.
    SharedPage,
    /// The last domain reference could not be stripped.
    StealFailed,
    /// No free page on the target node.
    AllocFailed,
    /// The domain would not accept the replacement page.
    AssignFailed,
}

/// A page stripped from its domain. Until `release`, dropping it hands the
/// page back, undoing the steal.
struct StolenPage<'a> {
    host: &'a dyn HostServices,
    domain: DomainId,
    mfn: Mfn,
    armed: bool,
}

impl<'a> StolenPage<'a> {
    fn steal(
        host: &'a dyn HostServices,
        domain: DomainId,
        gfn: Gfn,
    ) -> Result<Self, MoveError> {
        let entry = host.query(domain, gfn);
        match entry.kind {
            MapKind::Ram => {}
            MapKind::Shared => return Err(MoveError::SharedPage),
            MapKind::Paged | MapKind::Unmapped => return Err(MoveError::InvalidMapping),
        }
        if !mfn_valid(entry.mfn) {
            return Err(MoveError::InvalidMapping);
        }
        if !host.steal_page(domain, entry.mfn, MemFlags::NO_REFCOUNT) {
            return Err(MoveError::StealFailed);
        }
        Ok(Self {
            host,
            domain,
            mfn: entry.mfn,
            armed: true,
        })
    }

    fn mfn(&self) -> Mfn {
        self.mfn
    }

    fn release(mut self) -> Mfn {
        self.armed = false;
        self.mfn
    }
}

impl Drop for StolenPage<'_> {
    fn drop(&mut self) {
        if self.armed {
            // Compensation: the guest keeps its original page on any abort.
            let _ = self
                .host
                .assign_page(self.domain, self.mfn, MemFlags::NO_REFCOUNT);
        }
    }
}

/// A page fresh off the target node's free list; freed again on drop unless
/// the move completes.
struct FreshPage<'a> {
    host: &'a dyn HostServices,
    mfn: Mfn,
    armed: bool,
}

impl<'a> FreshPage<'a> {
    fn alloc(host: &'a dyn HostServices, node: NodeId) -> Result<Self, MoveError> {
        let mfn = host
            .alloc_page_on_node(node, MemFlags::EXACT_NODE)
            .ok_or(MoveError::AllocFailed)?;
        Ok(Self {
            host,
            mfn,
            armed: true,
        })
    }

    fn mfn(&self) -> Mfn {
        self.mfn
    }

    fn release(mut self) -> Mfn {
        self.armed = false;
        self.mfn
    }
}

impl Drop for FreshPage<'_> {
    fn drop(&mut self) {
        if self.armed {
            self.host.free_page(self.mfn);
        }
    }
}

/// Move the page backing (domain, gfn) to `node`. On success returns the
/// new machine frame; the old one has been returned to the allocator.
pub fn move_page(
    host: &dyn HostServices,
    cell: &MovedGfnCell,
    domain: DomainId,
    gfn: Gfn,
    node: NodeId,
) -> Result<Mfn, MoveError> {
    let old = StolenPage::steal(host, domain, gfn)?;
    let new = FreshPage::alloc(host, node)?;

    if !host.assign_page(domain, new.mfn(), MemFlags::NO_REFCOUNT) {
        // Drop order frees the new page first, then re-assigns the old one.
        return Err(MoveError::AssignFailed);
    }

    {
        let _gate = cell.begin(domain, gfn);

        // Revoke write access with a faulting read-only type and drop stale
        // writable translations. Guest reads continue against the old page.
        host.set_entry(domain, gfn, old.mfn(), MapAccess::ReadOnlyFaulting);
        host.flush_gfn(domain, gfn);

        host.copy_page(new.mfn(), old.mfn());

        // Swing the physmap to the new frame with full access restored.
        host.add_page(domain, gfn, new.mfn());
        host.flush_gfn(domain, gfn);

        // Gate drops here: parked write-faulters retry against the new frame.
    }

    let old_mfn = old.release();
    host.put_page(old_mfn);

    let new_mfn = new.release();
    if !host.is_translated(domain) {
        host.set_reverse_map(new_mfn, gfn);
    }
    Ok(new_mfn)
}
