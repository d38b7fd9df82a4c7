//! Fault injection for the chunk store
//!
//! Chunk stores consult an injected [`FaultInjector`] before touching their
//! backing storage. Production code passes [`NoFaults`]; tests pass
//! [`MonkeyFaults`] (random failures) or [`ScriptedFaults`] (deterministic
//! failures) to exercise the retry paths.

use fake::rand;
use std::fmt::Debug;
use std::sync::atomic::{AtomicUsize, Ordering};
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChunkOp {
    Put,
    Get,
    Delete,
    List,
}

/// A failure that may succeed when the call is repeated.
#[derive(Debug, Error)]
#[error("transient chunk store fault during {op:?}")]
pub struct TransientFault {
    pub op: ChunkOp,
}

pub trait FaultInjector: Send + Sync + Debug {
    fn before(&self, op: ChunkOp) -> Result<(), TransientFault>;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct NoFaults;

impl FaultInjector for NoFaults {
    fn before(&self, _op: ChunkOp) -> Result<(), TransientFault> {
        Ok(())
    }
}

/// Fails each call independently with probability `rate`.
#[derive(Debug, Clone, Copy)]
pub struct MonkeyFaults {
    rate: f64,
}

impl MonkeyFaults {
    pub fn new(rate: f64) -> Self {
        MonkeyFaults {
            rate: rate.clamp(0.0, 1.0),
        }
    }
}

impl FaultInjector for MonkeyFaults {
    fn before(&self, op: ChunkOp) -> Result<(), TransientFault> {
        if rand::random::<f64>() < self.rate {
            return Err(TransientFault { op });
        }
        Ok(())
    }
}

/// Fails the next `n` calls, then lets everything through.
#[derive(Debug, Default)]
pub struct ScriptedFaults {
    remaining: AtomicUsize,
    injected: AtomicUsize,
}

impl ScriptedFaults {
    pub fn failing(n: usize) -> Self {
        ScriptedFaults {
            remaining: AtomicUsize::new(n),
            injected: AtomicUsize::new(0),
        }
    }

    /// Arm another `n` failures.
    pub fn fail_next(&self, n: usize) {
        self.remaining.store(n, Ordering::SeqCst);
    }

    pub fn injected(&self) -> usize {
        self.injected.load(Ordering::SeqCst)
    }
}

impl FaultInjector for ScriptedFaults {
    fn before(&self, op: ChunkOp) -> Result<(), TransientFault> {
        let armed = self
            .remaining
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |left| left.checked_sub(1))
            .is_ok();
        if armed {
            self.injected.fetch_add(1, Ordering::SeqCst);
            return Err(TransientFault { op });
        }
        Ok(())
    }
}
