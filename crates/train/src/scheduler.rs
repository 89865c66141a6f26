//! Learning rate schedule.
//!
//! Linear warmup to the peak rate, then a decay towards `lr_min` that ends at
//! the run's step budget. The budget is resolved from whichever of
//! `max_steps` / `max_epochs` bounds the run (see [`step_budget`]).

use std::str::FromStr;

/// Decay shape after warmup.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LrDecay {
    Cosine,
    Linear,
    None,
}

impl LrDecay {
    /// Fraction of the `lr - lr_min` span still applied at `progress ∈ [0, 1]`.
    fn remaining(self, progress: f64) -> f64 {
        match self {
            Self::Cosine => 0.5 * (1.0 + (std::f64::consts::PI * progress).cos()),
            Self::Linear => 1.0 - progress,
            Self::None => 1.0,
        }
    }
}

impl FromStr for LrDecay {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> anyhow::Result<Self> {
        match s {
            "cosine" => Ok(Self::Cosine),
            "linear" => Ok(Self::Linear),
            "none" => Ok(Self::None),
            other => anyhow::bail!("unknown lr decay {other:?} (expected cosine, linear or none)"),
        }
    }
}

/// Total optimiser steps of a run; 0 when unbounded.
///
/// An epoch limit contributes `max_epochs × steps_per_epoch`; when both
/// limits are set the smaller one wins.
pub fn step_budget(max_steps: usize, max_epochs: usize, steps_per_epoch: usize) -> usize {
    let by_epochs = max_epochs.saturating_mul(steps_per_epoch);
    match (max_steps, by_epochs) {
        (0, e) => e,
        (s, 0) => s,
        (s, e) => s.min(e),
    }
}

/// Warmup followed by decay over a fixed step budget.
#[derive(Clone, Debug)]
pub struct LrScheduler {
    lr: f64,
    lr_min: f64,
    warmup_steps: usize,
    /// 0 = no known end; the rate stays at `lr` after warmup.
    total_steps: usize,
    decay: LrDecay,
    step: usize,
}

impl LrScheduler {
    pub fn new(lr: f64, lr_min: f64, warmup_steps: usize, total_steps: usize, decay: LrDecay) -> Self {
        Self {
            lr,
            lr_min,
            warmup_steps,
            total_steps,
            decay,
            step: 0,
        }
    }

    /// Same schedule and position, decaying over `total_steps` instead.
    pub fn with_total_steps(self, total_steps: usize) -> Self {
        Self { total_steps, ..self }
    }

    pub fn total_steps(&self) -> usize {
        self.total_steps
    }

    /// Rate at an arbitrary step.
    pub fn lr_at(&self, step: usize) -> f64 {
        if step < self.warmup_steps {
            return self.lr * (step + 1) as f64 / self.warmup_steps as f64;
        }
        if self.total_steps <= self.warmup_steps {
            return self.lr;
        }
        let span = (self.total_steps - self.warmup_steps) as f64;
        let progress = ((step - self.warmup_steps) as f64 / span).min(1.0);
        self.lr_min + (self.lr - self.lr_min) * self.decay.remaining(progress)
    }

    pub fn current_lr(&self) -> f64 {
        self.lr_at(self.step)
    }

    pub fn advance(&mut self) {
        self.step += 1;
    }

    pub fn step(&self) -> usize {
        self.step
    }
}

// ── Tests ───────────────────────────────────────────────────────────────────
