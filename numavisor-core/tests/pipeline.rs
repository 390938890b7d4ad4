//! End-to-end pipeline exercise against a software host: samples flow in
//! through the registered handler, decision ticks fill and drain the
//! migration queue, and one page ends up transparently re-homed.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Mutex;

use numavisor_core::{
    decide_migration, is_gfn_being_moved, set_candidate, set_criteria, set_enqueued,
    set_promote, set_rules, set_scores, set_tracked, start_monitoring, stop_monitoring,
    MonitorError,
};
use numavisor_hal::{
    paddr_to_mfn, ActiveGuest, DomainId, Gfn, GuestContext, GuestPhysmap, GuestType, LocalIrq,
    MapAccess, MapKind, MemFlags, Mfn, NodeId, PageAllocator, PhysicalAddress, PhysmapEntry,
    RecordMode, SampleEvent, SampleHandler, SampleRecord, SampleSource, SourceError, Topology,
    VirtualAddress, INVALID_GFN, INVALID_MFN, PAGE_SHIFT,
};

const DOM: DomainId = 7;
const MOVED_GFN: Gfn = 0x88;

/// Host fake: identity cpu→node topology, serial-number allocator, hash-map
/// physmap. Fresh pages take frame numbers from 0x10000 upward.
struct PipelineHost {
    nr_cpus: u32,
    home: Mutex<HashMap<Mfn, NodeId>>,
    physmap: Mutex<HashMap<(DomainId, Gfn), (Mfn, MapKind)>>,
    translations: Mutex<HashMap<(DomainId, VirtualAddress), Gfn>>,
    next_alloc: AtomicU64,
    alloc_count: AtomicU64,
    freed: Mutex<Vec<Mfn>>,
    copies: Mutex<Vec<(Mfn, Mfn)>>,
    fences: Mutex<Vec<(DomainId, Gfn)>>,
    /// Result of querying the move predicate from inside the copy window.
    moving_during_copy: AtomicBool,
}

impl PipelineHost {
    fn new(nr_cpus: u32) -> Self {
        Self {
            nr_cpus,
            home: Mutex::new(HashMap::new()),
            physmap: Mutex::new(HashMap::new()),
            translations: Mutex::new(HashMap::new()),
            next_alloc: AtomicU64::new(0),
            alloc_count: AtomicU64::new(0),
            freed: Mutex::new(Vec::new()),
            copies: Mutex::new(Vec::new()),
            fences: Mutex::new(Vec::new()),
            moving_during_copy: AtomicBool::new(false),
        }
    }

    fn home_node_of(&self, mfn: Mfn) -> NodeId {
        self.home.lock().unwrap().get(&mfn).copied().unwrap_or(0)
    }

    fn mapped_mfn(&self, domain: DomainId, gfn: Gfn) -> Mfn {
        self.physmap
            .lock()
            .unwrap()
            .get(&(domain, gfn))
            .map(|&(mfn, _)| mfn)
            .unwrap_or(INVALID_MFN)
    }
}

impl Topology for PipelineHost {
    fn nr_cpus(&self) -> u32 {
        self.nr_cpus
    }

    fn nr_nodes(&self) -> u32 {
        self.nr_cpus
    }

    fn node_of_cpu(&self, cpu: u32) -> NodeId {
        cpu
    }

    fn node_of_phys(&self, paddr: PhysicalAddress) -> NodeId {
        self.home_node_of(paddr_to_mfn(paddr))
    }
}

impl PageAllocator for PipelineHost {
    fn alloc_page_on_node(&self, node: NodeId, _flags: MemFlags) -> Option<Mfn> {
        let mfn = 0x10_000 + self.next_alloc.fetch_add(1, Ordering::Relaxed);
        self.alloc_count.fetch_add(1, Ordering::Relaxed);
        self.home.lock().unwrap().insert(mfn, node);
        Some(mfn)
    }

    fn free_page(&self, mfn: Mfn) {
        self.freed.lock().unwrap().push(mfn);
    }

    fn steal_page(&self, _domain: DomainId, _mfn: Mfn, _flags: MemFlags) -> bool {
        true
    }

    fn assign_page(&self, _domain: DomainId, _mfn: Mfn, _flags: MemFlags) -> bool {
        true
    }

    fn put_page(&self, mfn: Mfn) {
        self.freed.lock().unwrap().push(mfn);
    }
}

impl GuestPhysmap for PipelineHost {
    fn query(&self, domain: DomainId, gfn: Gfn) -> PhysmapEntry {
        match self.physmap.lock().unwrap().get(&(domain, gfn)) {
            Some(&(mfn, kind)) => PhysmapEntry { mfn, kind },
            None => PhysmapEntry {
                mfn: INVALID_MFN,
                kind: MapKind::Unmapped,
            },
        }
    }

    fn set_entry(&self, domain: DomainId, gfn: Gfn, mfn: Mfn, access: MapAccess) {
        if access == MapAccess::ReadOnlyFaulting {
            self.fences.lock().unwrap().push((domain, gfn));
        }
        self.physmap
            .lock()
            .unwrap()
            .insert((domain, gfn), (mfn, MapKind::Ram));
    }

    fn add_page(&self, domain: DomainId, gfn: Gfn, mfn: Mfn) {
        self.physmap
            .lock()
            .unwrap()
            .insert((domain, gfn), (mfn, MapKind::Ram));
    }

    fn flush_gfn(&self, _domain: DomainId, _gfn: Gfn) {}

    fn copy_page(&self, dst: Mfn, src: Mfn) {
        // A write fault arriving right now must see the move in flight.
        if is_gfn_being_moved(DOM, MOVED_GFN, false) {
            self.moving_during_copy.store(true, Ordering::Release);
        }
        self.copies.lock().unwrap().push((dst, src));
    }

    fn is_translated(&self, _domain: DomainId) -> bool {
        true
    }

    fn set_reverse_map(&self, _mfn: Mfn, _gfn: Gfn) {}
}

impl GuestContext for PipelineHost {
    fn current(&self, _cpu: u32) -> Option<ActiveGuest> {
        Some(ActiveGuest {
            domain: DOM,
            kind: GuestType::Hvm,
        })
    }

    fn translate_gva(&self, domain: DomainId, vaddr: VirtualAddress) -> Gfn {
        self.translations
            .lock()
            .unwrap()
            .get(&(domain, vaddr))
            .copied()
            .unwrap_or(INVALID_GFN)
    }
}

impl LocalIrq for PipelineHost {
    fn irq_enable(&self) {}

    fn irq_disable(&self) {}
}

struct PipelineSource {
    capable: bool,
    enabled: AtomicBool,
    handler: Mutex<Option<SampleHandler>>,
}

impl PipelineSource {
    const fn new(capable: bool) -> Self {
        Self {
            capable,
            enabled: AtomicBool::new(false),
            handler: Mutex::new(None),
        }
    }

    fn inject(&self, cpu: u32, mfn: Mfn, linear: VirtualAddress) {
        assert!(self.enabled.load(Ordering::Acquire), "source not armed");
        let handler = (*self.handler.lock().unwrap()).expect("no handler registered");
        handler(&SampleRecord {
            mode: RecordMode::OP | RecordMode::DATA_LINEAR | RecordMode::DATA_PHYS,
            cpu,
            linear,
            phys: mfn << PAGE_SHIFT,
        });
    }

    fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::Acquire)
    }
}

impl SampleSource for PipelineSource {
    fn name(&self) -> &'static str {
        "fake"
    }

    fn capable(&self) -> bool {
        self.capable
    }

    fn acquire(&self) -> Result<(), SourceError> {
        if self.capable {
            Ok(())
        } else {
            Err(SourceError::Unsupported)
        }
    }

    fn release(&self) {}

    fn set_event(&self, _event: SampleEvent) {}

    fn set_rate(&self, _period: u64) {}

    fn set_handler(&self, handler: SampleHandler) {
        *self.handler.lock().unwrap() = Some(handler);
    }

    fn enable(&self) {
        self.enabled.store(true, Ordering::Release);
    }

    fn disable(&self) {
        self.enabled.store(false, Ordering::Release);
    }
}

// One test drives the whole scenario: the monitor state is process-global,
// so the stages must not interleave with other tests.
#[test]
fn samples_become_migrations() {
    let host: &'static PipelineHost = Box::leak(Box::new(PipelineHost::new(4)));
    let source: &'static PipelineSource = Box::leak(Box::new(PipelineSource::new(true)));
    let sources: &'static [&'static dyn SampleSource] =
        Box::leak(Box::new([source as &'static dyn SampleSource]));

    // Nothing is running yet.
    assert_eq!(decide_migration(), Err(MonitorError::NotRunning));
    assert!(!is_gfn_being_moved(DOM, MOVED_GFN, false));

    // A machine with no usable sample source refuses to start.
    let unsupported: &'static PipelineSource = Box::leak(Box::new(PipelineSource::new(false)));
    let no_sources: &'static [&'static dyn SampleSource] =
        Box::leak(Box::new([unsupported as &'static dyn SampleSource]));
    assert_eq!(
        start_monitoring(host, no_sources),
        Err(MonitorError::SourceUnavailable)
    );

    // Small capacities and the scoring used throughout the unit tests.
    set_tracked(4).unwrap();
    set_candidate(6).unwrap();
    set_enqueued(4).unwrap();
    set_scores(4, 6, 4, 75).unwrap();
    set_promote(8).unwrap();
    set_criteria(8, 75, false).unwrap();
    set_rules(2).unwrap();

    start_monitoring(host, sources).unwrap();
    assert!(source.is_enabled());
    assert_eq!(
        start_monitoring(host, sources),
        Err(MonitorError::AlreadyRunning)
    );

    // Access stream: pages 18 and 23 concentrate on node 3, page 42 is
    // spread between nodes 0 and 2, page 17 is touched once.
    for &(mfn, cpu) in &[
        (42u64, 0u32),
        (23, 0),
        (42, 0),
        (42, 0),
        (18, 1),
        (17, 2),
        (42, 2),
        (18, 3),
        (18, 3),
        (18, 3),
        (23, 3),
        (23, 3),
        (23, 3),
    ] {
        source.inject(cpu, mfn, 0xA000_0000 + (mfn << PAGE_SHIFT));
    }

    // First tick: the decision round enqueues 18→3 and 23→3.
    decide_migration().unwrap();
    assert_eq!(host.alloc_count.load(Ordering::Relaxed), 0);

    // The guest touches page 18 again; this sample carries the linear
    // address that lets the probe bind the queue entry to a guest frame.
    host.physmap
        .lock()
        .unwrap()
        .insert((DOM, MOVED_GFN), (18, MapKind::Ram));
    host.translations
        .lock()
        .unwrap()
        .insert((DOM, 0xDEAD_B000), MOVED_GFN);
    source.inject(1, 18, 0xDEAD_B000);

    // Second tick: the bound entry is moved, the unbound one keeps waiting.
    decide_migration().unwrap();

    let new_mfn = host.mapped_mfn(DOM, MOVED_GFN);
    assert_ne!(new_mfn, 18, "the gfn still points at the old frame");
    assert_eq!(host.home_node_of(new_mfn), 3);
    assert!(host.freed.lock().unwrap().contains(&18));
    assert!(host.copies.lock().unwrap().contains(&(new_mfn, 18)));
    assert!(host.fences.lock().unwrap().contains(&(DOM, MOVED_GFN)));
    assert!(host.moving_during_copy.load(Ordering::Acquire));
    assert!(!is_gfn_being_moved(DOM, MOVED_GFN, false));
    assert_eq!(host.alloc_count.load(Ordering::Relaxed), 1);

    // Page 23 never gets a binding. Raise the score floor so it is not
    // re-proposed, then let the binding timeout retire it: no further
    // allocation may happen.
    set_criteria(100, 75, false).unwrap();
    decide_migration().unwrap();
    decide_migration().unwrap();
    assert_eq!(host.alloc_count.load(Ordering::Relaxed), 1);

    stop_monitoring();
    assert!(!source.is_enabled());
    assert_eq!(decide_migration(), Err(MonitorError::NotRunning));
    // Stopping twice is harmless.
    stop_monitoring();
}
