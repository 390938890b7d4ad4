//! Migration queue
//!
//! Bounded set of pending migrations. The decider fills it from a freshly
//! popped migration buffer; NMI-side samplers attach a guest-frame binding
//! to entries whose machine page they happen to sample again; the next
//! decider pass drains every entry, either enacting the move, retiring an
//! entry whose page already landed on its target node, or aborting after
//! `maxtries` passes without a binding.
//!
//! Slots are all-atomic: the slot key (mfn) is published last on fill, and
//! bindings are installed with a single compare-and-set so at most one
//! sampler's translation wins.

use alloc::boxed::Box;
use alloc::vec::Vec;
use core::sync::atomic::{AtomicU16, AtomicU32, AtomicU64, Ordering};

use numavisor_hal::{
    cycles, mfn_to_paddr, ActiveGuest, HostServices, Mfn, NodeId, VirtualAddress, INVALID_GFN,
    INVALID_MFN,
};

use crate::engine::{MigrationBuffer, MigrationEngine};
use crate::fault::MovedGfnCell;
use crate::page_move;
use crate::stats::Stats;
use crate::MonitorError;

struct QueueSlot {
    mfn: AtomicU64,
    node: AtomicU32,
    gfn: AtomicU64,
    domain: AtomicU16,
    tries: AtomicU32,
}

impl QueueSlot {
    fn new() -> Self {
        Self {
            mfn: AtomicU64::new(INVALID_MFN),
            node: AtomicU32::new(0),
            gfn: AtomicU64::new(INVALID_GFN),
            domain: AtomicU16::new(0),
            tries: AtomicU32::new(0),
        }
    }

    fn clear(&self) {
        self.gfn.store(INVALID_GFN, Ordering::Relaxed);
        self.domain.store(0, Ordering::Relaxed);
        self.tries.store(0, Ordering::Relaxed);
        self.mfn.store(INVALID_MFN, Ordering::Release);
    }
}

pub struct MigrationQueue {
    slots: Box<[QueueSlot]>,
}

impl MigrationQueue {
    pub fn alloc(enqueued: usize) -> Result<Self, MonitorError> {
        let mut slots = Vec::new();
        slots
            .try_reserve_exact(enqueued)
            .map_err(|_| MonitorError::ResourceExhausted)?;
        for _ in 0..enqueued {
            slots.push(QueueSlot::new());
        }
        Ok(Self {
            slots: slots.into_boxed_slice(),
        })
    }

    pub fn init(&self) {
        for slot in self.slots.iter() {
            slot.clear();
        }
    }

    pub fn depth(&self) -> usize {
        self.slots.len()
    }

    pub fn len(&self) -> usize {
        self.slots
            .iter()
            .filter(|s| s.mfn.load(Ordering::Acquire) != INVALID_MFN)
            .count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Pending (mfn, target node) of slot `index`, for inspection.
    pub fn entry(&self, index: usize) -> Option<(Mfn, NodeId)> {
        let slot = self.slots.get(index)?;
        let mfn = slot.mfn.load(Ordering::Acquire);
        if mfn == INVALID_MFN {
            return None;
        }
        Some((mfn, slot.node.load(Ordering::Relaxed)))
    }

    /// Adopt a decision round's proposals. Proposals already queued are
    /// skipped, the rest land in the first empty slots; when the queue is
    /// full the remainder is dropped silently.
    pub fn fill(&self, buffer: &MigrationBuffer, stats: &Stats) {
        for proposal in buffer.as_slice() {
            let mut empty = None;
            let mut duplicate = false;
            for (index, slot) in self.slots.iter().enumerate() {
                let occupant = slot.mfn.load(Ordering::Acquire);
                if occupant == proposal.mfn {
                    duplicate = true;
                    break;
                }
                if occupant == INVALID_MFN && empty.is_none() {
                    empty = Some(index);
                }
            }
            if duplicate {
                continue;
            }
            stats.account_migration_plan();
            let Some(index) = empty else {
                break;
            };
            let slot = &self.slots[index];
            slot.gfn.store(INVALID_GFN, Ordering::Relaxed);
            slot.domain.store(0, Ordering::Relaxed);
            slot.tries.store(0, Ordering::Relaxed);
            slot.node.store(proposal.node, Ordering::Relaxed);
            // Publish the key last: a sampler probing by mfn must never see
            // a half-initialized slot.
            slot.mfn.store(proposal.mfn, Ordering::Release);
        }
    }

    /// NMI-side binding probe. For every queued entry matching the sampled
    /// machine frame and still unbound, translate the sampled linear address
    /// and install the result — translation failures included, so the entry
    /// stays unbound and a later sample retries. Runs with the calling
    /// CPU's sampler token held; the translation itself needs interrupts
    /// back on, hence the window around it.
    pub fn probe(
        &self,
        mfn: Mfn,
        vaddr: VirtualAddress,
        guest: ActiveGuest,
        host: &dyn HostServices,
    ) {
        for slot in self.slots.iter() {
            if slot.mfn.load(Ordering::Acquire) != mfn {
                continue;
            }
            if slot.gfn.load(Ordering::Acquire) != INVALID_GFN {
                continue;
            }

            host.irq_enable();
            let gfn = host.translate_gva(guest.domain, vaddr);
            host.irq_disable();

            if slot
                .gfn
                .compare_exchange(INVALID_GFN, gfn, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                slot.domain.store(guest.domain, Ordering::Release);
            }
        }
    }

    /// Decider-side sweep, run before each refill.
    pub fn drain(
        &self,
        host: &dyn HostServices,
        cell: &MovedGfnCell,
        engine: &MigrationEngine,
        maxtries: u32,
        stats: &Stats,
    ) {
        for slot in self.slots.iter() {
            let mfn = slot.mfn.load(Ordering::Acquire);
            if mfn == INVALID_MFN {
                continue;
            }

            let node = slot.node.load(Ordering::Relaxed);
            if host.node_of_phys(mfn_to_paddr(mfn)) == node {
                // Already home, whether by our doing or someone else's.
                engine.register_page_moved(mfn);
                slot.clear();
                continue;
            }

            let gfn = slot.gfn.load(Ordering::Acquire);
            if gfn == INVALID_GFN {
                let tries = slot.tries.fetch_add(1, Ordering::Relaxed) + 1;
                if tries >= maxtries {
                    slot.clear();
                    stats.account_migration_abort();
                }
                continue;
            }

            let domain = slot.domain.load(Ordering::Acquire);
            let begin = cycles::now();
            let moved = page_move::move_page(host, cell, domain, gfn, node);
            stats.add_migration_time(cycles::now().wrapping_sub(begin));
            stats.account_migration_try(moved.is_ok());

            engine.register_page_moved(mfn);
            slot.clear();
        }
    }
}
