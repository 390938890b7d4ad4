//! Software host used by the unit tests
//!
//! Implements every host-side trait over hash maps and counters so the
//! pipeline can run end to end in a test process: a striped topology with
//! one CPU per node, an allocator that hands out fresh frame numbers per
//! node, a recording physmap and a table-driven guest context.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Mutex;

use numavisor_hal::{
    paddr_to_mfn, ActiveGuest, DomainId, Gfn, GuestContext, GuestPhysmap, GuestType, LocalIrq,
    MapAccess, MapKind, MemFlags, Mfn, NodeId, PhysicalAddress, PhysmapEntry, SampleEvent,
    SampleHandler, SampleRecord, SampleSource, SourceError, Topology, VirtualAddress,
    INVALID_GFN,
};

/// Frame numbers handed out by the fake allocator start here, per node, so
/// tests can tell fresh pages from seeded ones at a glance.
const ALLOC_BASE: Mfn = 0x10_000;
const ALLOC_NODE_STRIDE: Mfn = 0x1_000;

pub struct TestHost {
    nr_cpus: u32,
    nr_nodes: u32,
    home: Mutex<HashMap<Mfn, NodeId>>,
    physmap: Mutex<HashMap<(DomainId, Gfn), (Mfn, MapKind)>>,
    translations: Mutex<HashMap<(DomainId, VirtualAddress), Gfn>>,
    guests: Mutex<HashMap<u32, (DomainId, GuestType)>>,
    translated: Mutex<HashMap<DomainId, bool>>,
    next_alloc: AtomicU64,
    fail_alloc: AtomicBool,
    fail_steal: AtomicBool,
    fail_assign: AtomicBool,
    alloc_count: AtomicU64,
    freed: Mutex<Vec<Mfn>>,
    assigns: Mutex<Vec<(DomainId, Mfn)>>,
    copies: Mutex<Vec<(Mfn, Mfn)>>,
    readonly_fences: Mutex<Vec<(DomainId, Gfn, Mfn)>>,
    reverse_maps: Mutex<Vec<(Mfn, Gfn)>>,
}

impl TestHost {
    pub fn new(nr_cpus: u32, nr_nodes: u32) -> Self {
        Self {
            nr_cpus,
            nr_nodes,
            home: Mutex::new(HashMap::new()),
            physmap: Mutex::new(HashMap::new()),
            translations: Mutex::new(HashMap::new()),
            guests: Mutex::new(HashMap::new()),
            translated: Mutex::new(HashMap::new()),
            next_alloc: AtomicU64::new(0),
            fail_alloc: AtomicBool::new(false),
            fail_steal: AtomicBool::new(false),
            fail_assign: AtomicBool::new(false),
            alloc_count: AtomicU64::new(0),
            freed: Mutex::new(Vec::new()),
            assigns: Mutex::new(Vec::new()),
            copies: Mutex::new(Vec::new()),
            readonly_fences: Mutex::new(Vec::new()),
            reverse_maps: Mutex::new(Vec::new()),
        }
    }

    pub fn set_home_node(&self, mfn: Mfn, node: NodeId) {
        self.home.lock().unwrap().insert(mfn, node);
    }

    pub fn home_node_of(&self, mfn: Mfn) -> NodeId {
        self.home.lock().unwrap().get(&mfn).copied().unwrap_or(0)
    }

    pub fn map_guest_page(&self, domain: DomainId, gfn: Gfn, mfn: Mfn, kind: MapKind) {
        self.physmap.lock().unwrap().insert((domain, gfn), (mfn, kind));
    }

    pub fn register_translation(&self, domain: DomainId, vaddr: VirtualAddress, gfn: Gfn) {
        self.translations.lock().unwrap().insert((domain, vaddr), gfn);
    }

    pub fn set_current_guest(&self, cpu: u32, guest: Option<(DomainId, GuestType)>) {
        let mut guests = self.guests.lock().unwrap();
        match guest {
            Some(g) => guests.insert(cpu, g),
            None => guests.remove(&cpu),
        };
    }

    pub fn set_translated(&self, domain: DomainId, translated: bool) {
        self.translated.lock().unwrap().insert(domain, translated);
    }

    pub fn fail_next_alloc(&self) {
        self.fail_alloc.store(true, Ordering::Relaxed);
    }

    pub fn fail_next_steal(&self) {
        self.fail_steal.store(true, Ordering::Relaxed);
    }

    pub fn fail_next_assign(&self) {
        self.fail_assign.store(true, Ordering::Relaxed);
    }

    pub fn alloc_count(&self) -> u64 {
        self.alloc_count.load(Ordering::Relaxed)
    }

    pub fn freed_pages(&self) -> Vec<Mfn> {
        self.freed.lock().unwrap().clone()
    }

    pub fn page_is_free(&self, mfn: Mfn) -> bool {
        self.freed.lock().unwrap().contains(&mfn)
    }

    /// Successful page assignments recorded for `domain`.
    pub fn assigns_of(&self, domain: DomainId) -> Vec<Mfn> {
        self.assigns
            .lock()
            .unwrap()
            .iter()
            .filter(|(d, _)| *d == domain)
            .map(|&(_, mfn)| mfn)
            .collect()
    }

    pub fn copies(&self) -> Vec<(Mfn, Mfn)> {
        self.copies.lock().unwrap().clone()
    }

    /// Whether (domain, gfn) was ever fenced with the faulting read-only
    /// access type.
    pub fn saw_readonly_fence(&self, domain: DomainId, gfn: Gfn) -> bool {
        self.readonly_fences
            .lock()
            .unwrap()
            .iter()
            .any(|&(d, g, _)| d == domain && g == gfn)
    }

    pub fn reverse_maps(&self) -> Vec<(Mfn, Gfn)> {
        self.reverse_maps.lock().unwrap().clone()
    }
}

impl Topology for TestHost {
    fn nr_cpus(&self) -> u32 {
        self.nr_cpus
    }

    fn nr_nodes(&self) -> u32 {
        self.nr_nodes
    }

    fn node_of_cpu(&self, cpu: u32) -> NodeId {
        cpu % self.nr_nodes
    }

    fn node_of_phys(&self, paddr: PhysicalAddress) -> NodeId {
        self.home_node_of(paddr_to_mfn(paddr))
    }
}

impl numavisor_hal::PageAllocator for TestHost {
    fn alloc_page_on_node(&self, node: NodeId, _flags: MemFlags) -> Option<Mfn> {
        if self.fail_alloc.swap(false, Ordering::Relaxed) {
            return None;
        }
        let serial = self.next_alloc.fetch_add(1, Ordering::Relaxed);
        let mfn = ALLOC_BASE + node as Mfn * ALLOC_NODE_STRIDE + serial;
        self.alloc_count.fetch_add(1, Ordering::Relaxed);
        self.set_home_node(mfn, node);
        Some(mfn)
    }

    fn free_page(&self, mfn: Mfn) {
        self.freed.lock().unwrap().push(mfn);
    }

    fn steal_page(&self, _domain: DomainId, _mfn: Mfn, _flags: MemFlags) -> bool {
        !self.fail_steal.swap(false, Ordering::Relaxed)
    }

    fn assign_page(&self, domain: DomainId, mfn: Mfn, _flags: MemFlags) -> bool {
        if self.fail_assign.swap(false, Ordering::Relaxed) {
            return false;
        }
        self.assigns.lock().unwrap().push((domain, mfn));
        true
    }

    fn put_page(&self, mfn: Mfn) {
        self.freed.lock().unwrap().push(mfn);
    }
}

impl GuestPhysmap for TestHost {
    fn query(&self, domain: DomainId, gfn: Gfn) -> PhysmapEntry {
        match self.physmap.lock().unwrap().get(&(domain, gfn)) {
            Some(&(mfn, kind)) => PhysmapEntry { mfn, kind },
            None => PhysmapEntry {
                mfn: numavisor_hal::INVALID_MFN,
                kind: MapKind::Unmapped,
            },
        }
    }

    fn set_entry(&self, domain: DomainId, gfn: Gfn, mfn: Mfn, access: MapAccess) {
        if access == MapAccess::ReadOnlyFaulting {
            self.readonly_fences.lock().unwrap().push((domain, gfn, mfn));
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
        self.copies.lock().unwrap().push((dst, src));
    }

    fn is_translated(&self, domain: DomainId) -> bool {
        self.translated
            .lock()
            .unwrap()
            .get(&domain)
            .copied()
            .unwrap_or(true)
    }

    fn set_reverse_map(&self, mfn: Mfn, gfn: Gfn) {
        self.reverse_maps.lock().unwrap().push((mfn, gfn));
    }
}

impl GuestContext for TestHost {
    fn current(&self, cpu: u32) -> Option<ActiveGuest> {
        self.guests
            .lock()
            .unwrap()
            .get(&cpu)
            .map(|&(domain, kind)| ActiveGuest { domain, kind })
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

impl LocalIrq for TestHost {
    fn irq_enable(&self) {}

    fn irq_disable(&self) {}
}

/// Sample source driven by tests: capability is fixed at construction and
/// the registered handler can be fetched back to inject records.
pub struct TestSource {
    capable: bool,
    acquired: AtomicBool,
    enabled: AtomicBool,
    handler: Mutex<Option<SampleHandler>>,
    rate: AtomicU64,
}

impl TestSource {
    pub const fn new(capable: bool) -> Self {
        Self {
            capable,
            acquired: AtomicBool::new(false),
            enabled: AtomicBool::new(false),
            handler: Mutex::new(None),
            rate: AtomicU64::new(0),
        }
    }

    pub fn handler(&self) -> Option<SampleHandler> {
        *self.handler.lock().unwrap()
    }

    /// Deliver one record the way the hardware would, through the
    /// registered handler, if sampling is enabled.
    pub fn inject(&self, record: &SampleRecord) {
        if !self.enabled.load(Ordering::Acquire) {
            return;
        }
        if let Some(handler) = self.handler() {
            handler(record);
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::Acquire)
    }
}

impl SampleSource for TestSource {
    fn name(&self) -> &'static str {
        "test"
    }

    fn capable(&self) -> bool {
        self.capable
    }

    fn acquire(&self) -> Result<(), SourceError> {
        if !self.capable {
            return Err(SourceError::Unsupported);
        }
        if self.acquired.swap(true, Ordering::AcqRel) {
            return Err(SourceError::Busy);
        }
        Ok(())
    }

    fn release(&self) {
        self.acquired.store(false, Ordering::Release);
    }

    fn set_event(&self, _event: SampleEvent) {}

    fn set_rate(&self, period: u64) {
        self.rate.store(period, Ordering::Relaxed);
    }

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
