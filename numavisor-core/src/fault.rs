//! Fault-protection cell
//!
//! Single-slot rendezvous between the page mover and the host page-fault
//! handler. While one guest frame is being copied, its write access is
//! revoked; a guest write that faults in that window parks on the waiter
//! gate until the mover finishes the remap. At most one (domain, gfn) pair
//! is ever protected at a time.
//!
//! Two locks back the cell: an inner spinlock over the identity fields and
//! the waiter gate itself, held by the mover for the whole protected window
//! and released exactly once per move.

use numavisor_hal::{DomainId, Gfn};
use spin::{Mutex, MutexGuard};

pub struct MovedGfnCell {
    inner: Mutex<Option<(DomainId, Gfn)>>,
    waiter: Mutex<()>,
}

/// Exclusive hold of the cell for one move; clearing and gate release
/// happen on drop, after the remap is visible.
pub struct MoveGate<'a> {
    cell: &'a MovedGfnCell,
    _gate: MutexGuard<'a, ()>,
}

impl MovedGfnCell {
    pub const fn new() -> Self {
        Self {
            inner: Mutex::new(None),
            waiter: Mutex::new(()),
        }
    }

    /// Install (domain, gfn) as the in-flight move and close the gate.
    /// The cell must be empty; moves are serialized by the decider.
    pub fn begin(&self, domain: DomainId, gfn: Gfn) -> MoveGate<'_> {
        let mut inner = self.inner.lock();
        debug_assert!(inner.is_none());
        *inner = Some((domain, gfn));
        // Take the gate while the identity is still locked so a faulter can
        // never observe the pair without the gate being closed.
        let gate = self.waiter.lock();
        drop(inner);
        MoveGate {
            cell: self,
            _gate: gate,
        }
    }

    /// Fault-handler predicate: does the cell hold (domain, gfn)? With
    /// `wait`, additionally park on the gate until the move completes.
    pub fn is_moving(&self, domain: DomainId, gfn: Gfn, wait: bool) -> bool {
        {
            let inner = self.inner.lock();
            match *inner {
                Some((d, g)) if d == domain && g == gfn => {}
                _ => return false,
            }
        }
        if wait {
            // Blocks until the mover's gate guard drops, then releases
            // immediately so other parked faulters continue too.
            drop(self.waiter.lock());
        }
        true
    }
}

impl Default for MovedGfnCell {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for MoveGate<'_> {
    fn drop(&mut self) {
        let mut inner = self.cell.inner.lock();
        *inner = None;
        // The gate guard drops after this body, waking parked faulters only
        // once the identity is cleared.
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;
    use std::time::Duration;

    #[test]
    fn empty_cell_matches_nothing() {
        let cell = MovedGfnCell::new();
        assert!(!cell.is_moving(1, 0x10, false));
        assert!(!cell.is_moving(1, 0x10, true));
    }

    #[test]
    fn gate_identifies_only_the_inflight_pair() {
        let cell = MovedGfnCell::new();
        let gate = cell.begin(1, 0x10);
        assert!(cell.is_moving(1, 0x10, false));
        assert!(!cell.is_moving(1, 0x11, false));
        assert!(!cell.is_moving(2, 0x10, false));
        drop(gate);
        assert!(!cell.is_moving(1, 0x10, false));
    }

    #[test]
    fn waiting_faulter_parks_until_the_move_completes() {
        let cell = Arc::new(MovedGfnCell::new());
        let unblocked = Arc::new(AtomicBool::new(false));

        let gate = cell.begin(3, 0x77);

        let faulter = {
            let cell = Arc::clone(&cell);
            let unblocked = Arc::clone(&unblocked);
            std::thread::spawn(move || {
                assert!(cell.is_moving(3, 0x77, true));
                unblocked.store(true, Ordering::Release);
            })
        };

        std::thread::sleep(Duration::from_millis(20));
        assert!(!unblocked.load(Ordering::Acquire));

        drop(gate);
        faulter.join().unwrap();
        assert!(unblocked.load(Ordering::Acquire));
        assert!(!cell.is_moving(3, 0x77, false));
    }
}
