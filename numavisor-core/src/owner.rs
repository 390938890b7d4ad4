//! Per-CPU engine-owner tokens
//!
//! All engine state is shared between NMI-context samplers and the periodic
//! decider. Each CPU carries a three-state token: a sampler may only claim
//! its own CPU's token, the decider claims every token in ascending CPU
//! order. Holding all tokens therefore excludes every sampler, while a
//! sampler only ever contends with a decider mid-acquisition.

use alloc::vec::Vec;
use core::sync::atomic::{AtomicU8, Ordering};

use crate::MonitorError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Owner {
    None = 0,
    Sampler = 1,
    Decider = 2,
}

impl Owner {
    fn from_raw(raw: u8) -> Owner {
        match raw {
            1 => Owner::Sampler,
            2 => Owner::Decider,
            _ => Owner::None,
        }
    }
}

pub struct OwnerTable {
    tokens: Vec<AtomicU8>,
}

impl OwnerTable {
    pub fn alloc(nr_cpus: u32) -> Result<Self, MonitorError> {
        let mut tokens = Vec::new();
        tokens
            .try_reserve_exact(nr_cpus as usize)
            .map_err(|_| MonitorError::ResourceExhausted)?;
        for _ in 0..nr_cpus {
            tokens.push(AtomicU8::new(Owner::None as u8));
        }
        Ok(Self { tokens })
    }

    pub fn nr_cpus(&self) -> u32 {
        self.tokens.len() as u32
    }

    /// Claim `cpu`'s token for its sampler. Fails silently when the decider
    /// owns it (or the CPU is unknown); the sample is simply dropped.
    pub fn try_acquire_sampler(&self, cpu: u32) -> bool {
        let Some(token) = self.tokens.get(cpu as usize) else {
            return false;
        };
        token
            .compare_exchange(
                Owner::None as u8,
                Owner::Sampler as u8,
                Ordering::AcqRel,
                Ordering::Relaxed,
            )
            .is_ok()
    }

    pub fn release_sampler(&self, cpu: u32) {
        if let Some(token) = self.tokens.get(cpu as usize) {
            let _ = token.compare_exchange(
                Owner::Sampler as u8,
                Owner::None as u8,
                Ordering::AcqRel,
                Ordering::Relaxed,
            );
        }
    }

    /// Claim every CPU's token, spinning out any in-flight samplers. Always
    /// acquires in ascending CPU order so concurrent deciders cannot
    /// interleave their claims.
    pub fn acquire_decider(&self) {
        for token in self.tokens.iter() {
            while token
                .compare_exchange(
                    Owner::None as u8,
                    Owner::Decider as u8,
                    Ordering::AcqRel,
                    Ordering::Relaxed,
                )
                .is_err()
            {
                core::hint::spin_loop();
            }
        }
    }

    pub fn release_decider(&self) {
        for token in self.tokens.iter() {
            let _ = token.compare_exchange(
                Owner::Decider as u8,
                Owner::None as u8,
                Ordering::AcqRel,
                Ordering::Relaxed,
            );
        }
    }

    pub fn owner_of(&self, cpu: u32) -> Owner {
        self.tokens
            .get(cpu as usize)
            .map(|t| Owner::from_raw(t.load(Ordering::Acquire)))
            .unwrap_or(Owner::None)
    }
}
