#![no_std]

//! Numavisor — NUMA-aware page-migration monitor
//!
//! Observes guest memory accesses through hardware sampling (AMD IBS or
//! Intel PEBS), scores machine pages by access frequency and node affinity,
//! and transparently re-homes pages that concentrate their accesses on a
//! remote NUMA node. The host embeds the monitor by implementing the
//! `numavisor_hal` traits and wiring three entry points: the sample-source
//! NMI dispatch, the periodic `decide_migration` tick and the
//! `is_gfn_being_moved` predicate in its page-fault handler.

pub use numavisor_core::{
    decide_migration, is_gfn_being_moved, set_candidate, set_criteria, set_enqueued,
    set_promote, set_rules, set_scores, set_tracked, start_monitoring, stop_monitoring,
    MonitorError, MoveError,
};

pub use numavisor_hal as hal;
