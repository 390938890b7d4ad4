//! Monitoring statistics
//!
//! Counters and cycle totals for the three pipeline stages: per-CPU
//! sampling (count, total time, accounting and probing shares), decision
//! rounds, and migrations (planned, tried, succeeded, aborted). Samplers
//! update only their own CPU's cells; everything else belongs to the
//! decider, so plain relaxed atomics suffice throughout. The summary is
//! written to the log when monitoring stops.

use alloc::vec::Vec;
use core::sync::atomic::{AtomicU64, Ordering};

use numavisor_hal::cycles;

use crate::MonitorError;

#[derive(Default)]
struct CpuStats {
    sampling_count: AtomicU64,
    sampling_time: AtomicU64,
    accounting_time: AtomicU64,
    probing_time: AtomicU64,
}

pub struct Stats {
    per_cpu: Vec<CpuStats>,
    started_at: AtomicU64,
    stopped_at: AtomicU64,
    decision_count: AtomicU64,
    decision_time: AtomicU64,
    migration_time: AtomicU64,
    migration_planned: AtomicU64,
    migration_tries: AtomicU64,
    migration_succeeded: AtomicU64,
    migration_aborted: AtomicU64,
}

impl Stats {
    pub fn alloc(nr_cpus: u32) -> Result<Self, MonitorError> {
        let mut per_cpu = Vec::new();
        per_cpu
            .try_reserve_exact(nr_cpus as usize)
            .map_err(|_| MonitorError::ResourceExhausted)?;
        for _ in 0..nr_cpus {
            per_cpu.push(CpuStats::default());
        }
        Ok(Self {
            per_cpu,
            started_at: AtomicU64::new(0),
            stopped_at: AtomicU64::new(0),
            decision_count: AtomicU64::new(0),
            decision_time: AtomicU64::new(0),
            migration_time: AtomicU64::new(0),
            migration_planned: AtomicU64::new(0),
            migration_tries: AtomicU64::new(0),
            migration_succeeded: AtomicU64::new(0),
            migration_aborted: AtomicU64::new(0),
        })
    }

    pub fn mark_start(&self) {
        self.started_at.store(cycles::now(), Ordering::Relaxed);
    }

    pub fn mark_stop(&self) {
        self.stopped_at.store(cycles::now(), Ordering::Relaxed);
    }

    pub fn account_sample(&self, cpu: u32, total: u64, accounting: u64, probing: u64) {
        let Some(slot) = self.per_cpu.get(cpu as usize) else {
            return;
        };
        slot.sampling_count.fetch_add(1, Ordering::Relaxed);
        slot.sampling_time.fetch_add(total, Ordering::Relaxed);
        slot.accounting_time.fetch_add(accounting, Ordering::Relaxed);
        slot.probing_time.fetch_add(probing, Ordering::Relaxed);
    }

    pub fn account_decision(&self, time: u64) {
        self.decision_count.fetch_add(1, Ordering::Relaxed);
        self.decision_time.fetch_add(time, Ordering::Relaxed);
    }

    pub fn add_migration_time(&self, time: u64) {
        self.migration_time.fetch_add(time, Ordering::Relaxed);
    }

    pub fn account_migration_plan(&self) {
        self.migration_planned.fetch_add(1, Ordering::Relaxed);
    }

    pub fn account_migration_try(&self, succeeded: bool) {
        self.migration_tries.fetch_add(1, Ordering::Relaxed);
        if succeeded {
            self.migration_succeeded.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn account_migration_abort(&self) {
        self.migration_aborted.fetch_add(1, Ordering::Relaxed);
    }

    pub fn migration_planned(&self) -> u64 {
        self.migration_planned.load(Ordering::Relaxed)
    }

    pub fn migration_tries(&self) -> u64 {
        self.migration_tries.load(Ordering::Relaxed)
    }

    pub fn migration_succeeded(&self) -> u64 {
        self.migration_succeeded.load(Ordering::Relaxed)
    }

    pub fn migration_aborted(&self) -> u64 {
        self.migration_aborted.load(Ordering::Relaxed)
    }

    pub fn sample_count(&self) -> u64 {
        self.per_cpu
            .iter()
            .map(|c| c.sampling_count.load(Ordering::Relaxed))
            .sum()
    }

    fn min_max_avg(&self, pick: impl Fn(&CpuStats) -> u64) -> (u64, u64, u64) {
        let mut min = u64::MAX;
        let mut max = 0;
        let mut sum = 0;
        for cpu in self.per_cpu.iter() {
            let value = pick(cpu);
            min = min.min(value);
            max = max.max(value);
            sum += value;
        }
        if self.per_cpu.is_empty() {
            (0, 0, 0)
        } else {
            (min, max, sum / self.per_cpu.len() as u64)
        }
    }

    /// Emit the end-of-run summary. Per-CPU lines are min/max/avg across
    /// online CPUs; times are cycle-counter deltas.
    pub fn display(&self) {
        let elapsed = self
            .stopped_at
            .load(Ordering::Relaxed)
            .wrapping_sub(self.started_at.load(Ordering::Relaxed));
        crate::log!("numavisor: statistics over {} cycles", elapsed);

        let (min, max, avg) = self.min_max_avg(|c| c.sampling_count.load(Ordering::Relaxed));
        crate::log!("sampling count           {}/{}/{}", min, max, avg);
        let (min, max, avg) = self.min_max_avg(|c| c.sampling_time.load(Ordering::Relaxed));
        crate::log!("sampling time            {}/{}/{} cycles", min, max, avg);
        let (min, max, avg) = self.min_max_avg(|c| c.accounting_time.load(Ordering::Relaxed));
        crate::log!("accounting time          {}/{}/{} cycles", min, max, avg);
        let (min, max, avg) = self.min_max_avg(|c| c.probing_time.load(Ordering::Relaxed));
        crate::log!("probing time             {}/{}/{} cycles", min, max, avg);

        crate::log!(
            "decisions                {} in {} cycles",
            self.decision_count.load(Ordering::Relaxed),
            self.decision_time.load(Ordering::Relaxed)
        );
        crate::log!(
            "migration time           {} cycles",
            self.migration_time.load(Ordering::Relaxed)
        );
        crate::log!("migration planned        {}", self.migration_planned());
        crate::log!("migration tries          {}", self.migration_tries());
        crate::log!("migration succeeded      {}", self.migration_succeeded());
        crate::log!("migration aborted        {}", self.migration_aborted());
    }
}
