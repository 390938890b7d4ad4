//! Intel Precise Event-Based Sampling
//!
//! PEBS records carry the data *linear* address only; the physical-address
//! lane of the record never validates, so under virtualization the monitor
//! cannot attribute PEBS samples to machine frames and quietly drops them.
//! The driver is kept for bare-metal hosts and capability-chain symmetry
//! with IBS.
//!
//! `enable`/`disable` program per-CPU MSRs and must run on every online CPU.

use core::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};

use x86_64::registers::model_specific::Msr;

use crate::sampling::{
    RecordMode, SampleEvent, SampleHandler, SampleRecord, SampleSource, SourceError,
};

const MSR_IA32_PEBS_ENABLE: u32 = 0x3F1;
const MSR_IA32_PERFEVTSEL0: u32 = 0x186;
const MSR_IA32_PMC0: u32 = 0xC1;

// PERFEVTSEL: MEM_INST_RETIRED.ALL_LOADS, user+os, enabled.
const EVTSEL_MEM_LOADS: u64 = 0x81D0 | (0x3 << 16) | (1 << 22);

const DEFAULT_PERIOD: u64 = 0x1_0000;

/// Memory layout of one PEBS record as written to the DS buffer
/// (Nehalem-and-later base group, truncated to the fields consumed here).
#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct PebsRecordRaw {
    pub rflags: u64,
    pub rip: u64,
    pub applicable_counters: u64,
    pub data_linear_address: u64,
    pub data_source: u64,
    pub latency: u64,
}

pub struct PebsSource {
    owned: AtomicBool,
    period: AtomicU64,
    handler: AtomicUsize,
}

pub static PEBS: PebsSource = PebsSource::new();

impl PebsSource {
    pub const fn new() -> Self {
        Self {
            owned: AtomicBool::new(false),
            period: AtomicU64::new(DEFAULT_PERIOD),
            handler: AtomicUsize::new(0),
        }
    }

    /// PMI-side entry: forward one decoded DS-buffer record. The linear
    /// address is the only data address PEBS latches, so the record is
    /// tagged accordingly and the physical lane stays invalid.
    pub fn handle_record(&self, cpu: u32, raw: &PebsRecordRaw) {
        let record = SampleRecord {
            mode: RecordMode::OP | RecordMode::DATA_LINEAR,
            cpu,
            linear: raw.data_linear_address,
            phys: 0,
        };
        let handler = self.handler.load(Ordering::Acquire);
        if handler != 0 {
            let f: SampleHandler = unsafe { core::mem::transmute(handler) };
            f(&record);
        }
    }
}

impl SampleSource for PebsSource {
    fn name(&self) -> &'static str {
        "pebs"
    }

    fn capable(&self) -> bool {
        // GenuineIntel with a debug store.
        if !super::vendor_is(0x756E_6547, 0x4965_6E69, 0x6C65_746E) {
            return false;
        }
        let r = unsafe { core::arch::x86_64::__cpuid(0x1) };
        r.edx & (1 << 21) != 0
    }

    fn acquire(&self) -> Result<(), SourceError> {
        if !self.capable() {
            return Err(SourceError::Unsupported);
        }
        if self.owned.swap(true, Ordering::AcqRel) {
            return Err(SourceError::Busy);
        }
        Ok(())
    }

    fn release(&self) {
        self.owned.store(false, Ordering::Release);
    }

    fn set_event(&self, _event: SampleEvent) {}

    fn set_rate(&self, period: u64) {
        self.period.store(period, Ordering::Relaxed);
    }

    fn set_handler(&self, handler: SampleHandler) {
        self.handler.store(handler as usize, Ordering::Release);
    }

    fn enable(&self) {
        let period = self.period.load(Ordering::Relaxed);
        unsafe {
            Msr::new(MSR_IA32_PMC0).write(period.wrapping_neg() & 0xFFFF_FFFF_FFFF);
            Msr::new(MSR_IA32_PERFEVTSEL0).write(EVTSEL_MEM_LOADS);
            Msr::new(MSR_IA32_PEBS_ENABLE).write(1);
        }
    }

    fn disable(&self) {
        unsafe {
            Msr::new(MSR_IA32_PEBS_ENABLE).write(0);
            Msr::new(MSR_IA32_PERFEVTSEL0).write(0);
        }
        self.handler.store(0, Ordering::Release);
    }
}
