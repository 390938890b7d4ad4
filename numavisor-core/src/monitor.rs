//! Monitor lifecycle, sample intake and decision driver
//!
//! Glues the pipeline together: starting allocates the engine and queue,
//! publishes the owner object and arms the first capable sample source;
//! every hardware sample funnels through `sample_entry` under the sampling
//! CPU's engine-owner token; the periodic `decide_migration` tick claims
//! all tokens, drains the queue and refills it from a fresh decision round.
//! Stopping quiesces the source, prints the statistics and frees
//! everything again.

use core::sync::atomic::{AtomicU32, Ordering};

use alloc::boxed::Box;

use numavisor_hal::{
    cycles, paddr_to_mfn, ActiveGuest, DomainId, Gfn, GuestType, HostServices, RecordMode,
    SampleEvent, SampleRecord, SampleSource, DOMID_FIRST_RESERVED,
};
use spin::Mutex;
use static_assertions::const_assert;

use crate::engine::MigrationEngine;
use crate::fault::MovedGfnCell;
use crate::owner::OwnerTable;
use crate::queue::MigrationQueue;
use crate::registry;
use crate::stats::Stats;
use crate::MonitorError;

const DEFAULT_TRACKED: usize = 256;
const DEFAULT_CANDIDATE: usize = 64;
const DEFAULT_ENQUEUED: usize = 16;
const DEFAULT_ENTER: u32 = 4;
const DEFAULT_INCREMENT: u32 = 6;
const DEFAULT_DECREMENT: u32 = 4;
const DEFAULT_MAXIMUM: u32 = 75;
const DEFAULT_PROMOTE: u32 = 8;
const DEFAULT_MIN_NODE_SCORE: u32 = 8;
const DEFAULT_MIN_NODE_RATE: u32 = 75;
const DEFAULT_MAXTRIES: u32 = 4;

/// Retired ops between samples.
const SAMPLE_PERIOD: u64 = 0x100_0000;

const_assert!(DEFAULT_ENTER <= DEFAULT_MAXIMUM);
const_assert!(DEFAULT_PROMOTE <= DEFAULT_MAXIMUM);

/// Parameter block behind the control surface. Capacities only take effect
/// across a restart; everything else is pushed to a running monitor.
#[derive(Debug, Clone, Copy)]
pub struct MonitorConfig {
    pub tracked: usize,
    pub candidate: usize,
    pub enqueued: usize,
    pub enter: u32,
    pub increment: u32,
    pub decrement: u32,
    pub maximum: u32,
    pub promote: u32,
    pub min_node_score: u32,
    pub min_node_rate: u32,
    pub flush_after_refill: bool,
    pub maxtries: u32,
}

impl MonitorConfig {
    pub const DEFAULT: MonitorConfig = MonitorConfig {
        tracked: DEFAULT_TRACKED,
        candidate: DEFAULT_CANDIDATE,
        enqueued: DEFAULT_ENQUEUED,
        enter: DEFAULT_ENTER,
        increment: DEFAULT_INCREMENT,
        decrement: DEFAULT_DECREMENT,
        maximum: DEFAULT_MAXIMUM,
        promote: DEFAULT_PROMOTE,
        min_node_score: DEFAULT_MIN_NODE_SCORE,
        min_node_rate: DEFAULT_MIN_NODE_RATE,
        flush_after_refill: false,
        maxtries: DEFAULT_MAXTRIES,
    };
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self::DEFAULT
    }
}

static CONFIG: Mutex<MonitorConfig> = Mutex::new(MonitorConfig::DEFAULT);

#[derive(Clone, Copy)]
struct Bindings {
    host: &'static dyn HostServices,
    sources: &'static [&'static dyn SampleSource],
}

/// Host and sources of the most recent start, kept so the capacity setters
/// can bounce the monitor.
static BINDINGS: Mutex<Option<Bindings>> = Mutex::new(None);

/// The owner object: everything the monitor touches hangs off this, and it
/// is reachable from interrupt context only through the registration table.
pub struct Monitor {
    host: &'static dyn HostServices,
    source: &'static dyn SampleSource,
    pub(crate) engine: MigrationEngine,
    pub(crate) queue: MigrationQueue,
    pub(crate) owner: OwnerTable,
    pub(crate) moved: MovedGfnCell,
    pub(crate) stats: Stats,
    maxtries: AtomicU32,
}

impl Monitor {
    fn build(
        host: &'static dyn HostServices,
        source: &'static dyn SampleSource,
        cfg: &MonitorConfig,
    ) -> Result<Box<Monitor>, MonitorError> {
        let engine = MigrationEngine::alloc(cfg.tracked, cfg.candidate, cfg.enqueued)?;
        engine.init();
        engine.param_lists(cfg.enter, cfg.increment, cfg.decrement, cfg.maximum)?;
        engine.param_promote(cfg.promote);
        engine.param_engine(cfg.min_node_score, cfg.min_node_rate, cfg.flush_after_refill);

        let queue = MigrationQueue::alloc(cfg.enqueued)?;
        queue.init();

        let owner = OwnerTable::alloc(host.nr_cpus())?;
        let stats = Stats::alloc(host.nr_cpus())?;

        Ok(Box::new(Monitor {
            host,
            source,
            engine,
            queue,
            owner,
            moved: MovedGfnCell::new(),
            stats,
            maxtries: AtomicU32::new(cfg.maxtries),
        }))
    }

    /// Admission filter for one sample: data-memory operation with a valid
    /// physical address, taken inside an unprivileged HVM guest.
    fn admit(&self, record: &SampleRecord) -> Option<ActiveGuest> {
        if !record.mode.contains(RecordMode::OP | RecordMode::DATA_PHYS) {
            return None;
        }
        let guest = self.host.current(record.cpu)?;
        if guest.domain >= DOMID_FIRST_RESERVED {
            return None;
        }
        if guest.kind != GuestType::Hvm {
            return None;
        }
        Some(guest)
    }

    fn on_sample(&self, record: &SampleRecord) {
        if !self.owner.try_acquire_sampler(record.cpu) {
            return;
        }
        let sample_begin = cycles::now();
        let mut accounting = 0;
        let mut probing = 0;

        if let Some(guest) = self.admit(record) {
            let mfn = paddr_to_mfn(record.phys);

            let probe_begin = cycles::now();
            self.queue.probe(mfn, record.linear, guest, self.host);
            probing = cycles::now().wrapping_sub(probe_begin);

            let account_begin = cycles::now();
            self.engine
                .register_access(mfn, self.host.node_of_cpu(record.cpu));
            accounting = cycles::now().wrapping_sub(account_begin);
        }

        self.stats.account_sample(
            record.cpu,
            cycles::now().wrapping_sub(sample_begin),
            accounting,
            probing,
        );
        self.owner.release_sampler(record.cpu);
    }

    fn decide(&self) {
        self.owner.acquire_decider();

        self.queue.drain(
            self.host,
            &self.moved,
            &self.engine,
            self.maxtries.load(Ordering::Relaxed),
            &self.stats,
        );

        let begin = cycles::now();
        {
            let buffer = self.engine.refill_migration_buffer(self.host);
            self.queue.fill(&buffer, &self.stats);
        }
        self.engine.decay();
        self.stats
            .account_decision(cycles::now().wrapping_sub(begin));

        self.owner.release_decider();
    }
}

/// Registered with the active sample source; must stay NMI-clean.
fn sample_entry(record: &SampleRecord) {
    registry::with_active(|monitor| monitor.on_sample(record));
}

fn start_with(
    host: &'static dyn HostServices,
    sources: &'static [&'static dyn SampleSource],
) -> Result<(), MonitorError> {
    if registry::is_active() {
        return Err(MonitorError::AlreadyRunning);
    }
    let cfg = *CONFIG.lock();

    // Capability chain: first source that exists and can be claimed wins.
    let mut claimed = None;
    for source in sources.iter() {
        if source.capable() && source.acquire().is_ok() {
            claimed = Some(*source);
            break;
        }
    }
    let source = claimed.ok_or(MonitorError::SourceUnavailable)?;

    let monitor = match Monitor::build(host, source, &cfg) {
        Ok(monitor) => monitor,
        Err(err) => {
            source.release();
            return Err(err);
        }
    };
    monitor.stats.mark_start();

    if registry::publish(monitor).is_err() {
        source.release();
        return Err(MonitorError::AlreadyRunning);
    }

    // Arm the hardware last so the first callback finds the monitor.
    source.set_event(SampleEvent::MemoryOps);
    source.set_rate(SAMPLE_PERIOD);
    source.set_handler(sample_entry);
    source.enable();

    crate::log!("numavisor: monitoring started ({})", source.name());
    Ok(())
}

/// Start monitoring against `host`, sampling with the first capable source.
/// The bindings are remembered so capacity setters can restart the monitor.
pub fn start_monitoring(
    host: &'static dyn HostServices,
    sources: &'static [&'static dyn SampleSource],
) -> Result<(), MonitorError> {
    *BINDINGS.lock() = Some(Bindings { host, sources });
    start_with(host, sources)
}

/// Stop monitoring, print statistics and release every resource. A stopped
/// monitor is a no-op.
pub fn stop_monitoring() {
    let Some(monitor) = registry::unpublish() else {
        return;
    };
    // New callbacks already miss the registration; disabling the source
    // additionally waits out any handler still running, and the token sweep
    // below is the belt to that suspender.
    monitor.source.disable();
    monitor.source.release();
    monitor.owner.acquire_decider();

    monitor.stats.mark_stop();
    monitor.stats.display();
    crate::log!("numavisor: monitoring stopped");
    drop(monitor);
}

/// Periodic decision tick. Fails when monitoring is not running.
pub fn decide_migration() -> Result<(), MonitorError> {
    registry::with_active(|monitor| monitor.decide()).ok_or(MonitorError::NotRunning)
}

/// Fault-handler predicate: is (domain, gfn) mid-move? With `wait`, parks
/// until the move finishes. Hosts call this for guest writes faulting on
/// read-only physmap entries of the monitor's access type.
pub fn is_gfn_being_moved(domain: DomainId, gfn: Gfn, wait: bool) -> bool {
    registry::with_active(|monitor| monitor.moved.is_moving(domain, gfn, wait)).unwrap_or(false)
}

fn update_capacity(apply: impl FnOnce(&mut MonitorConfig)) -> Result<(), MonitorError> {
    let restart = registry::is_active();
    stop_monitoring();
    apply(&mut *CONFIG.lock());
    if restart {
        let bindings = (*BINDINGS.lock()).ok_or(MonitorError::NotRunning)?;
        start_with(bindings.host, bindings.sources)?;
    }
    Ok(())
}

/// Resize the tracked tier. Stops and restarts a running monitor.
pub fn set_tracked(tracked: usize) -> Result<(), MonitorError> {
    update_capacity(|cfg| cfg.tracked = tracked)
}

/// Resize the candidate tier. Stops and restarts a running monitor.
pub fn set_candidate(candidate: usize) -> Result<(), MonitorError> {
    update_capacity(|cfg| cfg.candidate = candidate)
}

/// Resize the migration queue and buffer. Stops and restarts a running
/// monitor.
pub fn set_enqueued(enqueued: usize) -> Result<(), MonitorError> {
    update_capacity(|cfg| cfg.enqueued = enqueued)
}

/// Update the scoring parameters, live when monitoring runs.
pub fn set_scores(
    enter: u32,
    increment: u32,
    decrement: u32,
    maximum: u32,
) -> Result<(), MonitorError> {
    if enter > maximum {
        return Err(MonitorError::InvalidParameters);
    }
    {
        let mut cfg = CONFIG.lock();
        cfg.enter = enter;
        cfg.increment = increment;
        cfg.decrement = decrement;
        cfg.maximum = maximum;
    }
    registry::with_active(|monitor| {
        monitor
            .engine
            .param_lists(enter, increment, decrement, maximum)
    })
    .transpose()?;
    Ok(())
}

/// Update the promotion threshold, live when monitoring runs.
pub fn set_promote(threshold: u32) -> Result<(), MonitorError> {
    CONFIG.lock().promote = threshold;
    registry::with_active(|monitor| monitor.engine.param_promote(threshold));
    Ok(())
}

/// Update the decision criteria, live when monitoring runs.
pub fn set_criteria(
    min_node_score: u32,
    min_node_rate: u32,
    flush_after_refill: bool,
) -> Result<(), MonitorError> {
    {
        let mut cfg = CONFIG.lock();
        cfg.min_node_score = min_node_score;
        cfg.min_node_rate = min_node_rate;
        cfg.flush_after_refill = flush_after_refill;
    }
    registry::with_active(|monitor| {
        monitor
            .engine
            .param_engine(min_node_score, min_node_rate, flush_after_refill)
    });
    Ok(())
}

/// Update the binding-timeout rule, live when monitoring runs.
pub fn set_rules(maxtries: u32) -> Result<(), MonitorError> {
    CONFIG.lock().maxtries = maxtries;
    registry::with_active(|monitor| monitor.maxtries.store(maxtries, Ordering::Relaxed));
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testhost::TestHost;

    fn leaked_host() -> &'static TestHost {
        Box::leak(Box::new(TestHost::new(4, 4)))
    }

    fn record(cpu: u32, phys: u64) -> SampleRecord {
        SampleRecord {
            mode: RecordMode::OP | RecordMode::DATA_LINEAR | RecordMode::DATA_PHYS,
            cpu,
            linear: 0x1000,
            phys,
        }
    }

    fn direct_monitor(host: &'static TestHost) -> Box<Monitor> {
        static SILENT: crate::testhost::TestSource = crate::testhost::TestSource::new(true);
        Monitor::build(host, &SILENT, &MonitorConfig::DEFAULT).unwrap()
    }

    #[test]
    fn admit_requires_an_unprivileged_hvm_guest() {
        let host = leaked_host();
        let monitor = direct_monitor(host);

        host.set_current_guest(0, Some((1, GuestType::Hvm)));
        assert!(monitor.admit(&record(0, 0x42000)).is_some());

        host.set_current_guest(0, Some((1, GuestType::Pv)));
        assert!(monitor.admit(&record(0, 0x42000)).is_none());

        host.set_current_guest(0, Some((DOMID_FIRST_RESERVED, GuestType::Hvm)));
        assert!(monitor.admit(&record(0, 0x42000)).is_none());

        host.set_current_guest(0, None);
        assert!(monitor.admit(&record(0, 0x42000)).is_none());
    }

    #[test]
    fn admit_requires_valid_mode_flags() {
        let host = leaked_host();
        host.set_current_guest(0, Some((1, GuestType::Hvm)));
        let monitor = direct_monitor(host);

        let mut r = record(0, 0x42000);
        r.mode = RecordMode::OP; // no physical address
        assert!(monitor.admit(&r).is_none());
        r.mode = RecordMode::DATA_PHYS; // fetch sample, not an op
        assert!(monitor.admit(&r).is_none());
    }

    #[test]
    fn samples_are_dropped_while_the_decider_runs() {
        let host = leaked_host();
        host.set_current_guest(0, Some((1, GuestType::Hvm)));
        let monitor = direct_monitor(host);

        monitor.owner.acquire_decider();
        monitor.on_sample(&record(0, 0x7000));
        monitor.owner.release_decider();
        assert_eq!(monitor.stats.sample_count(), 0);

        monitor.on_sample(&record(0, 0x7000));
        assert_eq!(monitor.stats.sample_count(), 1);
        assert_eq!(monitor.engine.hotlist().score_of(0x7), Some(DEFAULT_ENTER));
    }

    #[test]
    fn default_config_is_coherent() {
        let cfg = MonitorConfig::default();
        assert!(cfg.enter <= cfg.maximum);
        assert!(cfg.promote <= cfg.maximum);
        assert!(cfg.min_node_rate <= 100);
        assert!(cfg.enqueued > 0);
    }
}
