//! Warm-start gradient reversal.
//!
//! Forward is the identity; backward multiplies the incoming gradient by
//! `-λ(i)` where
//!
//! λ(i) = 2(hi − lo) / (1 + exp(−α · i / N)) − (hi − lo) + lo
//!
//! rises smoothly from `lo` at i = 0 toward `hi` as i grows past N.

use std::sync::atomic::{AtomicU64, Ordering};

use candle_core::Tensor;
use tracing::debug;

use regda_core::{GradientScheduleConfig, Result};

/// Warm-start coefficient schedule
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct WarmStartSchedule {
    pub alpha: f64,
    pub lo: f64,
    pub hi: f64,
    pub max_iters: u64,
}

impl Default for WarmStartSchedule {
    fn default() -> Self {
        Self::from(&GradientScheduleConfig::default())
    }
}

impl From<&GradientScheduleConfig> for WarmStartSchedule {
    fn from(config: &GradientScheduleConfig) -> Self {
        Self {
            alpha: config.alpha,
            lo: config.lo,
            hi: config.hi,
            max_iters: config.max_iters,
        }
    }
}

impl WarmStartSchedule {
    pub fn coefficient(&self, iter: u64) -> f64 {
        let span = self.hi - self.lo;
        let progress = self.alpha * iter as f64 / self.max_iters.max(1) as f64;
        2.0 * span / (1.0 + (-progress).exp()) - span + self.lo
    }
}

/// Gradient reversal layer whose strength follows a [`WarmStartSchedule`].
#[derive(Debug)]
pub struct WarmStartGradientReverseLayer {
    schedule: WarmStartSchedule,
    iter_num: AtomicU64,
    auto_step: bool,
}

impl WarmStartGradientReverseLayer {
    pub fn new(schedule: WarmStartSchedule, auto_step: bool) -> Self {
        Self {
            schedule,
            iter_num: AtomicU64::new(0),
            auto_step,
        }
    }

    pub fn from_config(config: &GradientScheduleConfig) -> Self {
        Self::new(WarmStartSchedule::from(config), config.auto_step)
    }

    /// Identity on values, `-λ` on gradients.
    pub fn forward(&self, x: &Tensor) -> Result<Tensor> {
        let coeff = self.coefficient();
        if self.auto_step {
            self.step();
        }
        reverse_gradient(x, coeff)
    }

    /// Current reversal strength λ.
    pub fn coefficient(&self) -> f64 {
        self.schedule.coefficient(self.iter_num.load(Ordering::Relaxed))
    }

    /// Advance the schedule by one iteration.
    pub fn step(&self) {
        let iter = self.iter_num.fetch_add(1, Ordering::Relaxed) + 1;
        debug!(iter, coefficient = self.schedule.coefficient(iter), "Gradient reversal step");
    }

    pub fn iteration(&self) -> u64 {
        self.iter_num.load(Ordering::Relaxed)
    }

    pub fn reset(&self) {
        self.iter_num.store(0, Ordering::Relaxed);
    }

    pub fn schedule(&self) -> &WarmStartSchedule {
        &self.schedule
    }
}

impl Default for WarmStartGradientReverseLayer {
    fn default() -> Self {
        Self::new(WarmStartSchedule::default(), false)
    }
}

/// `x` in the forward pass, `-coeff * grad` in the backward pass.
pub fn reverse_gradient(x: &Tensor, coeff: f64) -> Result<Tensor> {
    let constant = x.detach();
    // (x - x.detach()) is exactly zero but carries d/dx = 1
    let reversed = ((x - &constant)? * -coeff)?;
    Ok((constant + reversed)?)
}
