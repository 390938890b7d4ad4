//! AMD Instruction-Based Sampling (op mode)
//!
//! IBS tags one retired micro-op every `period` ops and latches the data
//! linear and physical address it touched, then raises an NMI. Because the
//! physical address is a host-physical address even while a guest runs,
//! IBS is the preferred source for NUMA accounting under virtualization.
//!
//! The platform NMI dispatcher must call `IBS.handle_nmi(cpu)` for
//! performance NMIs on each CPU, and run `enable`/`disable` on every online
//! CPU (they program per-CPU MSRs).

use core::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};

use x86_64::registers::model_specific::Msr;

use crate::sampling::{
    RecordMode, SampleEvent, SampleHandler, SampleRecord, SampleSource, SourceError,
};

const MSR_IBS_OP_CTL: u32 = 0xC001_1033;
const MSR_IBS_OP_DATA3: u32 = 0xC001_1037;
const MSR_IBS_DC_LIN_AD: u32 = 0xC001_1038;
const MSR_IBS_DC_PHYS_AD: u32 = 0xC001_1039;

const IBS_OP_ENABLE: u64 = 1 << 17;
const IBS_OP_VALID: u64 = 1 << 18;

const DATA3_LD_OP: u64 = 1 << 0;
const DATA3_ST_OP: u64 = 1 << 1;
const DATA3_LIN_ADDR_VALID: u64 = 1 << 17;
const DATA3_PHYS_ADDR_VALID: u64 = 1 << 18;

const DEFAULT_PERIOD: u64 = 0x100_0000;

pub struct IbsSource {
    owned: AtomicBool,
    period: AtomicU64,
    handler: AtomicUsize,
}

pub static IBS: IbsSource = IbsSource::new();

impl IbsSource {
    pub const fn new() -> Self {
        Self {
            owned: AtomicBool::new(false),
            period: AtomicU64::new(DEFAULT_PERIOD),
            handler: AtomicUsize::new(0),
        }
    }

    // IbsOpMaxCnt is stored divided by 16, split over bits [15:0] and
    // [26:20] of IBS_OP_CTL.
    fn op_ctl_value(&self) -> u64 {
        let max_cnt = self.period.load(Ordering::Relaxed) >> 4;
        (max_cnt & 0xFFFF) | (((max_cnt >> 16) & 0x7F) << 20) | IBS_OP_ENABLE
    }

    /// NMI-side entry. Returns whether the NMI was an IBS op sample; when it
    /// was, the registers are re-armed for the next sample before returning.
    pub fn handle_nmi(&self, cpu: u32) -> bool {
        let mut op_ctl = Msr::new(MSR_IBS_OP_CTL);
        let ctl = unsafe { op_ctl.read() };
        if ctl & IBS_OP_VALID == 0 {
            return false;
        }

        let data3 = unsafe { Msr::new(MSR_IBS_OP_DATA3).read() };
        if data3 & (DATA3_LD_OP | DATA3_ST_OP) != 0 {
            let mut mode = RecordMode::OP;
            let mut linear = 0;
            let mut phys = 0;
            if data3 & DATA3_LIN_ADDR_VALID != 0 {
                mode |= RecordMode::DATA_LINEAR;
                linear = unsafe { Msr::new(MSR_IBS_DC_LIN_AD).read() };
            }
            if data3 & DATA3_PHYS_ADDR_VALID != 0 {
                mode |= RecordMode::DATA_PHYS;
                phys = unsafe { Msr::new(MSR_IBS_DC_PHYS_AD).read() };
            }
            let record = SampleRecord { mode, cpu, linear, phys };
            let handler = self.handler.load(Ordering::Acquire);
            if handler != 0 {
                let f: SampleHandler = unsafe { core::mem::transmute(handler) };
                f(&record);
            }
        }

        unsafe { op_ctl.write(self.op_ctl_value()) };
        true
    }
}

impl SampleSource for IbsSource {
    fn name(&self) -> &'static str {
        "ibs"
    }

    fn capable(&self) -> bool {
        let r = unsafe { core::arch::x86_64::__cpuid(0x8000_0001) };
        r.ecx & (1 << 10) != 0
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

    fn set_event(&self, _event: SampleEvent) {
        // Op sampling already covers exactly the data-memory operations the
        // monitor wants; nothing further to program.
    }

    fn set_rate(&self, period: u64) {
        self.period.store(period, Ordering::Relaxed);
    }

    fn set_handler(&self, handler: SampleHandler) {
        self.handler.store(handler as usize, Ordering::Release);
    }

    fn enable(&self) {
        let mut op_ctl = Msr::new(MSR_IBS_OP_CTL);
        unsafe { op_ctl.write(self.op_ctl_value()) };
    }

    fn disable(&self) {
        let mut op_ctl = Msr::new(MSR_IBS_OP_CTL);
        unsafe { op_ctl.write(0) };
        // Handler teardown is safe once this returns on every CPU: with the
        // enable bit clear the hardware raises no further sample NMIs.
        self.handler.store(0, Ordering::Release);
    }
}
