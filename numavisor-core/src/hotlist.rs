//! Access-frequency hotlist
//!
//! Bounded LFU-style scoring of machine pages, fed from NMI context. Pages
//! climb through three tiers: *observed* (not stored anywhere), *tracked*
//! (score only) and *candidate* (score plus a per-node access vector used
//! to pick a migration target). Both tables are fixed-capacity arrays of
//! all-atomic cells so that `register_access` stays wait-free with respect
//! to samplers on other CPUs and never allocates.
//!
//! Samplers resolve races between themselves with per-cell CAS; a lost race
//! drops the update, which is acceptable for approximate accounting. The
//! maintenance work that needs a consistent view (decay, duplicate repair)
//! runs only while the decider owns every per-CPU token.

use alloc::boxed::Box;
use alloc::vec::Vec;
use core::sync::atomic::{AtomicU32, AtomicU64, Ordering};

use numavisor_hal::{Mfn, NodeId, INVALID_MFN, MAX_NODES};
use static_assertions::const_assert;

use crate::MonitorError;

const_assert!(MAX_NODES > 0 && MAX_NODES <= 64);

/// Key of a slot mid-initialization. No sampled frame number matches it, so
/// lookups skip the slot until its fields are settled and the real key is
/// published; publishing the key is always the last store into a slot.
const CLAIMED_MFN: Mfn = INVALID_MFN - 1;

const_assert!(CLAIMED_MFN != INVALID_MFN);

/// Scoring parameters, updatable while sampling runs.
struct ScoreParams {
    enter: AtomicU32,
    increment: AtomicU32,
    decrement: AtomicU32,
    maximum: AtomicU32,
    promote: AtomicU32,
}

struct TrackedCell {
    mfn: AtomicU64,
    score: AtomicU32,
    /// Monotonic insertion stamp; breaks eviction ties toward the entry
    /// inserted longest ago.
    stamp: AtomicU64,
}

impl TrackedCell {
    fn new() -> Self {
        Self {
            mfn: AtomicU64::new(INVALID_MFN),
            score: AtomicU32::new(0),
            stamp: AtomicU64::new(0),
        }
    }
}

struct CandidateCell {
    mfn: AtomicU64,
    score: AtomicU32,
    nodes: [AtomicU32; MAX_NODES],
}

impl CandidateCell {
    fn new() -> Self {
        Self {
            mfn: AtomicU64::new(INVALID_MFN),
            score: AtomicU32::new(0),
            nodes: [const { AtomicU32::new(0) }; MAX_NODES],
        }
    }

    fn clear(&self) {
        for lane in self.nodes.iter() {
            lane.store(0, Ordering::Relaxed);
        }
        self.score.store(0, Ordering::Relaxed);
        self.mfn.store(INVALID_MFN, Ordering::Release);
    }
}

/// Which tier an MFN currently occupies.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Tier {
    Tracked,
    Candidate,
}

pub struct Hotlist {
    tracked: Box<[TrackedCell]>,
    candidates: Box<[CandidateCell]>,
    params: ScoreParams,
    next_stamp: AtomicU64,
}

fn alloc_cells<T>(count: usize, make: impl Fn() -> T) -> Result<Box<[T]>, MonitorError> {
    let mut cells = Vec::new();
    cells
        .try_reserve_exact(count)
        .map_err(|_| MonitorError::ResourceExhausted)?;
    for _ in 0..count {
        cells.push(make());
    }
    Ok(cells.into_boxed_slice())
}

impl Hotlist {
    pub fn alloc(tracked: usize, candidate: usize) -> Result<Self, MonitorError> {
        Ok(Self {
            tracked: alloc_cells(tracked, TrackedCell::new)?,
            candidates: alloc_cells(candidate, CandidateCell::new)?,
            params: ScoreParams {
                enter: AtomicU32::new(1),
                increment: AtomicU32::new(1),
                decrement: AtomicU32::new(1),
                maximum: AtomicU32::new(u32::MAX),
                promote: AtomicU32::new(u32::MAX),
            },
            next_stamp: AtomicU64::new(0),
        })
    }

    /// Reset every cell to the observed (empty) state.
    pub fn init(&self) {
        for cell in self.tracked.iter() {
            cell.score.store(0, Ordering::Relaxed);
            cell.stamp.store(0, Ordering::Relaxed);
            cell.mfn.store(INVALID_MFN, Ordering::Release);
        }
        for cell in self.candidates.iter() {
            cell.clear();
        }
    }

    pub fn param_lists(
        &self,
        enter: u32,
        increment: u32,
        decrement: u32,
        maximum: u32,
    ) -> Result<(), MonitorError> {
        if enter > maximum {
            return Err(MonitorError::InvalidParameters);
        }
        self.params.enter.store(enter, Ordering::Relaxed);
        self.params.increment.store(increment, Ordering::Relaxed);
        self.params.decrement.store(decrement, Ordering::Relaxed);
        self.params.maximum.store(maximum, Ordering::Relaxed);
        Ok(())
    }

    /// Score at which a tracked entry moves to the candidate tier. Setting
    /// it to the score maximum effectively disables promotion.
    pub fn param_promote(&self, threshold: u32) {
        self.params.promote.store(threshold, Ordering::Relaxed);
    }

    /// Account one sampled access of `mfn` taken on a CPU of `node`.
    /// NMI-safe: wait-free against other samplers, no allocation, no locks.
    pub fn register_access(&self, mfn: Mfn, node: NodeId) {
        // Rejects the empty sentinel and the claim key with it; no physical
        // frame reaches either value.
        if mfn >= CLAIMED_MFN {
            return;
        }
        let node = (node as usize).min(MAX_NODES - 1);
        if self.bump_candidate(mfn, node) {
            return;
        }
        if let Some(score) = self.bump_tracked(mfn) {
            if score >= self.params.promote.load(Ordering::Relaxed) {
                self.try_promote(mfn, score, node);
            }
            return;
        }
        self.insert_tracked(mfn);
    }

    fn bump_candidate(&self, mfn: Mfn, node: usize) -> bool {
        for cell in self.candidates.iter() {
            if cell.mfn.load(Ordering::Acquire) != mfn {
                continue;
            }
            // The vector moves by exactly the amount the clamped score
            // accepted, so sum(vector) tracks the score until decay.
            let (_, delta) = self.raise_score(&cell.score);
            if delta > 0 {
                cell.nodes[node].fetch_add(delta, Ordering::Relaxed);
            }
            return true;
        }
        false
    }

    fn bump_tracked(&self, mfn: Mfn) -> Option<u32> {
        for cell in self.tracked.iter() {
            if cell.mfn.load(Ordering::Acquire) != mfn {
                continue;
            }
            let (score, _) = self.raise_score(&cell.score);
            return Some(score);
        }
        None
    }

    /// Saturating-at-maximum score bump; returns (new value, applied delta).
    fn raise_score(&self, score: &AtomicU32) -> (u32, u32) {
        let increment = self.params.increment.load(Ordering::Relaxed);
        let maximum = self.params.maximum.load(Ordering::Relaxed);
        let mut current = score.load(Ordering::Relaxed);
        loop {
            let next = current.saturating_add(increment).min(maximum);
            if next == current {
                return (current, 0);
            }
            match score.compare_exchange_weak(current, next, Ordering::Relaxed, Ordering::Relaxed)
            {
                Ok(_) => return (next, next - current),
                Err(seen) => current = seen,
            }
        }
    }

    /// Move `mfn` from tracked to candidate. The whole accumulated score is
    /// attributed to the promoting node, so the per-node vector starts in
    /// balance with the score. The tracked slot is released only after the
    /// candidate copy is visible; `register_access` checks candidates first,
    /// so a racing sampler lands on the surviving copy.
    fn try_promote(&self, mfn: Mfn, score: u32, node: usize) {
        let Some(cell) = self.claim_candidate_slot(score) else {
            return;
        };
        // The slot is keyed CLAIMED_MFN, so no concurrent bump can land on
        // it. Settle the fields first, publish the real key last.
        for (lane, value) in cell.nodes.iter().enumerate() {
            value.store(if lane == node { score } else { 0 }, Ordering::Relaxed);
        }
        cell.score.store(score, Ordering::Relaxed);
        cell.mfn.store(mfn, Ordering::Release);
        self.remove_tracked(mfn);
    }

    /// Reserve a candidate slot: a free one, or the weakest occupant when it
    /// scores below the newcomer. The slot comes back keyed `CLAIMED_MFN`;
    /// the caller settles score and vector before publishing the real key.
    fn claim_candidate_slot(&self, score: u32) -> Option<&CandidateCell> {
        for cell in self.candidates.iter() {
            if cell
                .mfn
                .compare_exchange(INVALID_MFN, CLAIMED_MFN, Ordering::AcqRel, Ordering::Relaxed)
                .is_ok()
            {
                return Some(cell);
            }
        }
        // No room: displace the weakest candidate, but only for a stronger
        // newcomer. Slots mid-claim by another promoter are not victims.
        let mut weakest: Option<(&CandidateCell, Mfn, u32)> = None;
        for cell in self.candidates.iter() {
            let occupant = cell.mfn.load(Ordering::Acquire);
            if occupant == INVALID_MFN || occupant == CLAIMED_MFN {
                continue;
            }
            let occupant_score = cell.score.load(Ordering::Relaxed);
            let beats = match weakest {
                None => true,
                Some((_, _, best)) => occupant_score < best,
            };
            if beats {
                weakest = Some((cell, occupant, occupant_score));
            }
        }
        let (cell, occupant, occupant_score) = weakest?;
        if occupant_score >= score {
            return None;
        }
        cell.mfn
            .compare_exchange(occupant, CLAIMED_MFN, Ordering::AcqRel, Ordering::Relaxed)
            .ok()
            .map(|_| cell)
    }

    fn insert_tracked(&self, mfn: Mfn) {
        let enter = self.params.enter.load(Ordering::Relaxed);
        let stamp = self.next_stamp.fetch_add(1, Ordering::Relaxed) + 1;

        for cell in self.tracked.iter() {
            if cell
                .mfn
                .compare_exchange(INVALID_MFN, CLAIMED_MFN, Ordering::AcqRel, Ordering::Relaxed)
                .is_ok()
            {
                cell.score.store(enter, Ordering::Relaxed);
                cell.stamp.store(stamp, Ordering::Relaxed);
                cell.mfn.store(mfn, Ordering::Release);
                return;
            }
        }

        // Table full: evict the lowest score, oldest insertion on ties.
        let mut victim: Option<(&TrackedCell, Mfn, u32, u64)> = None;
        for cell in self.tracked.iter() {
            let occupant = cell.mfn.load(Ordering::Acquire);
            if occupant == INVALID_MFN || occupant == CLAIMED_MFN {
                continue;
            }
            let score = cell.score.load(Ordering::Relaxed);
            let age = cell.stamp.load(Ordering::Relaxed);
            let beats = match victim {
                None => true,
                Some((_, _, best_score, best_age)) => {
                    score < best_score || (score == best_score && age < best_age)
                }
            };
            if beats {
                victim = Some((cell, occupant, score, age));
            }
        }
        if let Some((cell, occupant, _, _)) = victim {
            if cell
                .mfn
                .compare_exchange(occupant, CLAIMED_MFN, Ordering::AcqRel, Ordering::Relaxed)
                .is_ok()
            {
                cell.score.store(enter, Ordering::Relaxed);
                cell.stamp.store(stamp, Ordering::Relaxed);
                cell.mfn.store(mfn, Ordering::Release);
            }
            // A lost race means another sampler claimed the slot first; the
            // access is dropped, which register_access is allowed to do.
        }
    }

    fn remove_tracked(&self, mfn: Mfn) {
        for cell in self.tracked.iter() {
            let _ = cell
                .mfn
                .compare_exchange(mfn, INVALID_MFN, Ordering::AcqRel, Ordering::Relaxed);
        }
    }

    /// Forget `mfn` entirely so a freshly moved page is not re-proposed.
    pub fn register_page_moved(&self, mfn: Mfn) {
        self.remove_tracked(mfn);
        for cell in self.candidates.iter() {
            if cell.mfn.load(Ordering::Acquire) == mfn {
                cell.clear();
            }
        }
    }

    /// Periodic decay and table repair. Must run with every per-CPU token
    /// held by the decider; cells are rewritten non-atomically here.
    pub fn decay(&self) {
        let decrement = self.params.decrement.load(Ordering::Relaxed);
        for cell in self.tracked.iter() {
            if cell.mfn.load(Ordering::Relaxed) == INVALID_MFN {
                continue;
            }
            let score = cell.score.load(Ordering::Relaxed);
            if score <= decrement {
                cell.score.store(0, Ordering::Relaxed);
                cell.stamp.store(0, Ordering::Relaxed);
                cell.mfn.store(INVALID_MFN, Ordering::Release);
            } else {
                cell.score.store(score - decrement, Ordering::Relaxed);
            }
        }
        for cell in self.candidates.iter() {
            if cell.mfn.load(Ordering::Relaxed) == INVALID_MFN {
                continue;
            }
            let score = cell.score.load(Ordering::Relaxed);
            if score <= decrement {
                cell.clear();
            } else {
                cell.score.store(score - decrement, Ordering::Relaxed);
            }
        }
        self.repair_duplicates();
    }

    // Sampler insert races can leave one MFN in two cells; keep the
    // candidate copy (respectively the first tracked copy) and drop the rest.
    fn repair_duplicates(&self) {
        for cell in self.candidates.iter() {
            let mfn = cell.mfn.load(Ordering::Relaxed);
            if mfn != INVALID_MFN {
                self.remove_tracked(mfn);
            }
        }
        for (i, cell) in self.tracked.iter().enumerate() {
            let mfn = cell.mfn.load(Ordering::Relaxed);
            if mfn == INVALID_MFN {
                continue;
            }
            for later in self.tracked.iter().skip(i + 1) {
                let _ = later.mfn.compare_exchange(
                    mfn,
                    INVALID_MFN,
                    Ordering::AcqRel,
                    Ordering::Relaxed,
                );
            }
        }
    }

    /// Visit every candidate with a snapshot of its score and node vector.
    pub fn fold_candidates(&self, mut visit: impl FnMut(Mfn, u32, [u32; MAX_NODES])) {
        for cell in self.candidates.iter() {
            let mfn = cell.mfn.load(Ordering::Acquire);
            if mfn >= CLAIMED_MFN {
                continue;
            }
            let score = cell.score.load(Ordering::Relaxed);
            let mut nodes = [0u32; MAX_NODES];
            for (snapshot, lane) in nodes.iter_mut().zip(cell.nodes.iter()) {
                *snapshot = lane.load(Ordering::Relaxed);
            }
            visit(mfn, score, nodes);
        }
    }

    /// Drop all candidate state (the flush-after-refill policy).
    pub fn clear_candidates(&self) {
        for cell in self.candidates.iter() {
            cell.clear();
        }
    }

    pub fn tier_of(&self, mfn: Mfn) -> Option<Tier> {
        for cell in self.candidates.iter() {
            if cell.mfn.load(Ordering::Acquire) == mfn {
                return Some(Tier::Candidate);
            }
        }
        for cell in self.tracked.iter() {
            if cell.mfn.load(Ordering::Acquire) == mfn {
                return Some(Tier::Tracked);
            }
        }
        None
    }

    pub fn score_of(&self, mfn: Mfn) -> Option<u32> {
        for cell in self.candidates.iter() {
            if cell.mfn.load(Ordering::Acquire) == mfn {
                return Some(cell.score.load(Ordering::Relaxed));
            }
        }
        for cell in self.tracked.iter() {
            if cell.mfn.load(Ordering::Acquire) == mfn {
                return Some(cell.score.load(Ordering::Relaxed));
            }
        }
        None
    }

    #[cfg(test)]
    fn occurrences(&self, mfn: Mfn) -> usize {
        let tracked = self
            .tracked
            .iter()
            .filter(|c| c.mfn.load(Ordering::Relaxed) == mfn)
            .count();
        let candidates = self
            .candidates
            .iter()
            .filter(|c| c.mfn.load(Ordering::Relaxed) == mfn)
            .count();
        tracked + candidates
    }

    #[cfg(test)]
    fn node_vector_of(&self, mfn: Mfn) -> Option<[u32; MAX_NODES]> {
        for cell in self.candidates.iter() {
            if cell.mfn.load(Ordering::Relaxed) != mfn {
                continue;
            }
            let mut nodes = [0u32; MAX_NODES];
            for (snapshot, lane) in nodes.iter_mut().zip(cell.nodes.iter()) {
                *snapshot = lane.load(Ordering::Relaxed);
            }
            return Some(nodes);
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn sample_list(tracked: usize, candidate: usize) -> Hotlist {
        let list = Hotlist::alloc(tracked, candidate).unwrap();
        list.init();
        list.param_lists(4, 6, 4, 75).unwrap();
        list
    }

    #[test]
    fn scores_accumulate_in_the_tracked_tier() {
        let list = sample_list(8, 4);
        list.param_promote(75);

        list.register_access(42, 0);
        list.register_access(23, 0);
        list.register_access(42, 0);
        list.register_access(42, 0);
        list.register_access(42, 0);

        assert_eq!(list.tier_of(42), Some(Tier::Tracked));
        assert_eq!(list.score_of(42), Some(4 + 6 + 6 + 6));
        assert_eq!(list.tier_of(23), Some(Tier::Tracked));
        assert_eq!(list.score_of(23), Some(4));
    }

    #[test]
    fn scores_clamp_at_the_maximum() {
        let list = sample_list(4, 2);
        list.param_promote(75);
        for _ in 0..100 {
            list.register_access(7, 0);
        }
        assert_eq!(list.score_of(7), Some(75));
    }

    #[test]
    fn second_access_promotes_and_attributes_history() {
        let list = sample_list(4, 4);
        list.param_promote(8);

        list.register_access(18, 1);
        assert_eq!(list.tier_of(18), Some(Tier::Tracked));
        list.register_access(18, 3);
        assert_eq!(list.tier_of(18), Some(Tier::Candidate));

        // The promoting access carries the whole score onto its node.
        let nodes = list.node_vector_of(18).unwrap();
        assert_eq!(nodes[3], 10);
        assert_eq!(nodes[1], 0);
        assert_eq!(list.score_of(18), Some(10));
    }

    #[test]
    fn node_vector_stays_in_balance_with_the_score_until_decay() {
        let list = sample_list(4, 4);
        list.param_promote(8);

        for _ in 0..5 {
            list.register_access(9, 2);
        }
        let nodes = list.node_vector_of(9).unwrap();
        let total: u32 = nodes.iter().sum();
        assert_eq!(Some(total), list.score_of(9));

        list.decay();
        let nodes = list.node_vector_of(9).unwrap();
        let total: u32 = nodes.iter().sum();
        assert_ne!(Some(total), list.score_of(9));
    }

    #[test]
    fn full_tracked_tier_evicts_the_weakest() {
        let list = sample_list(2, 2);
        list.param_promote(75);

        list.register_access(1, 0);
        list.register_access(1, 0); // score 10
        list.register_access(2, 0); // score 4
        list.register_access(3, 0); // evicts 2 (lowest score)

        assert_eq!(list.tier_of(1), Some(Tier::Tracked));
        assert_eq!(list.tier_of(2), None);
        assert_eq!(list.tier_of(3), Some(Tier::Tracked));
    }

    #[test]
    fn eviction_ties_break_toward_the_oldest() {
        let list = sample_list(2, 2);
        list.param_promote(75);

        list.register_access(1, 0);
        list.register_access(2, 0); // both score 4; 1 is older
        list.register_access(3, 0);

        assert_eq!(list.tier_of(1), None);
        assert_eq!(list.tier_of(2), Some(Tier::Tracked));
        assert_eq!(list.tier_of(3), Some(Tier::Tracked));
    }

    #[test]
    fn stronger_newcomer_displaces_the_weakest_candidate() {
        let list = sample_list(2, 1);
        list.param_promote(8);

        list.register_access(1, 2);
        list.register_access(1, 2); // promoted, score 10
        assert_eq!(list.tier_of(1), Some(Tier::Candidate));

        list.register_access(2, 3);
        list.register_access(2, 3); // score 10: no better than the occupant
        assert_eq!(list.tier_of(1), Some(Tier::Candidate));
        assert_eq!(list.tier_of(2), Some(Tier::Tracked));

        list.register_access(2, 3); // score 16: takes the slot
        assert_eq!(list.tier_of(1), None);
        assert_eq!(list.tier_of(2), Some(Tier::Candidate));
        assert_eq!(list.score_of(2), Some(16));
        let nodes = list.node_vector_of(2).unwrap();
        assert_eq!(nodes[3], 16);
        assert_eq!(nodes[2], 0);
    }

    #[test]
    fn decay_removes_entries_that_reach_zero() {
        let list = sample_list(4, 4);
        list.param_promote(75);
        list.register_access(5, 0); // score 4 == decrement
        list.decay();
        assert_eq!(list.tier_of(5), None);
    }

    #[test]
    fn moved_pages_vanish_from_every_tier() {
        let list = sample_list(4, 4);
        list.param_promote(8);
        list.register_access(11, 0);
        list.register_access(11, 0); // promoted
        list.register_access(12, 1);

        list.register_page_moved(11);
        list.register_page_moved(12);
        assert_eq!(list.tier_of(11), None);
        assert_eq!(list.tier_of(12), None);
    }

    #[test]
    fn rejects_enter_above_maximum() {
        let list = Hotlist::alloc(2, 2).unwrap();
        assert_eq!(
            list.param_lists(80, 6, 4, 75),
            Err(MonitorError::InvalidParameters)
        );
    }

    proptest! {
        #[test]
        fn tiers_stay_exclusive_and_clamped(
            stream in proptest::collection::vec((0u64..24, 0u32..4), 0..300)
        ) {
            let list = sample_list(6, 3);
            list.param_promote(8);
            for &(mfn, node) in stream.iter() {
                list.register_access(mfn, node);
            }
            for mfn in 0..24u64 {
                prop_assert!(list.occurrences(mfn) <= 1);
                if let Some(score) = list.score_of(mfn) {
                    prop_assert!(score <= 75);
                }
            }
        }
    }
}
