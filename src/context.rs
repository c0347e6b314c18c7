//! Shared run context: cooperative interruption and coarse progress.
//!
//! A [`RunContext`] is created once by the embedder and passed by reference
//! into every job; it is safe to reuse across sequential jobs and to observe
//! from another thread. Cancellation is cooperative: hot loops poll the
//! interrupt flag at per-atom or per-dot granularity and abort at the next
//! poll point. Progress is a side-effecting, non-blocking write with no
//! synchronization semantics; consumers may read or ignore it.

use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};

use tracing::debug;

/// Pipeline stage reported through [`RunContext::stage`].
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Stage {
    /// Solvent dot generation.
    DotGeneration = 0,
    /// Dot refinement: trimming, gap filling, collapsing.
    Refinement = 1,
    /// Mesh triangulation.
    Triangulation = 2,
}

/// Interrupt flag and progress counters shared with the embedder.
#[derive(Debug, Default)]
pub struct RunContext {
    interrupt: AtomicBool,
    stage: AtomicU8,
    percent: AtomicU8,
}

impl RunContext {
    /// Create a context with the interrupt flag cleared and no progress.
    pub fn new() -> Self {
        Self::default()
    }

    /// Request cooperative cancellation of any in-flight job.
    pub fn request_interrupt(&self) {
        self.interrupt.store(true, Ordering::Relaxed);
    }

    /// Clear the interrupt flag before starting the next job.
    pub fn clear_interrupt(&self) {
        self.interrupt.store(false, Ordering::Relaxed);
    }

    /// True when cancellation has been requested.
    #[inline]
    pub fn interrupted(&self) -> bool {
        self.interrupt.load(Ordering::Relaxed)
    }

    /// Last stage entered by the running job.
    pub fn stage(&self) -> u8 {
        self.stage.load(Ordering::Relaxed)
    }

    /// Coarse progress of the current stage, 0..=100.
    pub fn percent(&self) -> u8 {
        self.percent.load(Ordering::Relaxed)
    }

    pub(crate) fn enter_stage(&self, stage: Stage) {
        debug!(stage = ?stage, "entering stage");
        self.stage.store(stage as u8, Ordering::Relaxed);
        self.percent.store(0, Ordering::Relaxed);
    }

    pub(crate) fn report_progress(&self, done: usize, total: usize) {
        let pct = if total == 0 {
            100
        } else {
            ((done * 100) / total).min(100) as u8
        };
        self.percent.store(pct, Ordering::Relaxed);
    }
}
