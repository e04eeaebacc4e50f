//! Learning rate schedulers.
//!
//! Multipliers match the `transformers` schedule functions: linear warmup
//! from zero, then constant, linear or half-cosine decay to zero at
//! `total_steps`.

use crate::config::LrSchedulerType;
use crate::optimizer::AdamWOptimizer;

/// Number of warmup steps for `warmup_ratio` of `total_steps`, rounded up.
#[must_use]
#[allow(
    clippy::cast_possible_truncation,
    clippy::cast_sign_loss,
    clippy::cast_precision_loss
)]
pub fn warmup_steps(warmup_ratio: f64, total_steps: usize) -> usize {
    (warmup_ratio * total_steps as f64).ceil() as usize
}

/// Learning rate scheduler.
#[derive(Debug, Clone)]
pub struct LRScheduler {
    kind: LrSchedulerType,
    base_lr: f64,
    warmup_steps: usize,
    total_steps: usize,
    current_step: usize,
}

impl LRScheduler {
    /// Create a new scheduler.
    #[must_use]
    pub fn new(kind: LrSchedulerType, base_lr: f64, warmup_steps: usize, total_steps: usize) -> Self {
        Self {
            kind,
            base_lr,
            warmup_steps,
            total_steps,
            current_step: 0,
        }
    }

    /// Optimizer steps taken so far.
    #[must_use]
    pub fn current_step(&self) -> usize {
        self.current_step
    }

    /// Multiplier applied to the base rate at `step`.
    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn factor(&self, step: usize) -> f64 {
        let warmup = self.warmup_steps;
        let in_warmup = step < warmup;
        let warmup_factor = step as f64 / warmup.max(1) as f64;
        let progress = || {
            step.saturating_sub(warmup) as f64 / self.total_steps.saturating_sub(warmup).max(1) as f64
        };

        match self.kind {
            LrSchedulerType::Constant => 1.0,
            LrSchedulerType::ConstantWithWarmup => {
                if in_warmup {
                    warmup_factor
                } else {
                    1.0
                }
            }
            LrSchedulerType::Linear => {
                if in_warmup {
                    warmup_factor
                } else {
                    (1.0 - progress()).max(0.0)
                }
            }
            LrSchedulerType::Cosine => {
                if in_warmup {
                    warmup_factor
                } else {
                    (0.5 * (1.0 + (std::f64::consts::PI * progress()).cos())).max(0.0)
                }
            }
        }
    }

    /// Learning rate for the current step.
    #[must_use]
    pub fn get_lr(&self) -> f64 {
        self.base_lr * self.factor(self.current_step)
    }

    /// Step the scheduler and update optimizer.
    pub fn step(&mut self, optimizer: &mut AdamWOptimizer) {
        self.current_step += 1;
        optimizer.set_learning_rate(self.get_lr());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn at(kind: LrSchedulerType, step: usize) -> f64 {
        let mut scheduler = LRScheduler::new(kind, 1e-3, 100, 1000);
        scheduler.current_step = step;
        scheduler.get_lr()
    }

    #[test]
    fn test_warmup_steps_round_up() {
        assert_eq!(warmup_steps(0.03, 100), 3);
        assert_eq!(warmup_steps(0.03, 10), 1);
        assert_eq!(warmup_steps(0.0, 10), 0);
    }

    #[test]
    fn test_constant_ignores_warmup() {
        assert_eq!(at(LrSchedulerType::Constant, 0), 1e-3);
        assert_eq!(at(LrSchedulerType::Constant, 999), 1e-3);
    }

    #[test]
    fn test_constant_with_warmup() {
        assert_eq!(at(LrSchedulerType::ConstantWithWarmup, 0), 0.0);
        assert!((at(LrSchedulerType::ConstantWithWarmup, 50) - 5e-4).abs() < 1e-12);
        assert_eq!(at(LrSchedulerType::ConstantWithWarmup, 900), 1e-3);
    }

    #[test]
    fn test_linear_warmup_and_decay() {
        assert_eq!(at(LrSchedulerType::Linear, 0), 0.0);
        assert!((at(LrSchedulerType::Linear, 50) - 5e-4).abs() < 1e-12);
        assert!((at(LrSchedulerType::Linear, 100) - 1e-3).abs() < 1e-12);
        assert!((at(LrSchedulerType::Linear, 550) - 5e-4).abs() < 1e-12);
        assert_eq!(at(LrSchedulerType::Linear, 1000), 0.0);
        assert_eq!(at(LrSchedulerType::Linear, 1200), 0.0);
    }

    #[test]
    fn test_cosine_decay() {
        assert!((at(LrSchedulerType::Cosine, 50) - 5e-4).abs() < 1e-12);
        assert!((at(LrSchedulerType::Cosine, 100) - 1e-3).abs() < 1e-12);
        assert!((at(LrSchedulerType::Cosine, 550) - 5e-4).abs() < 1e-12);
        assert!(at(LrSchedulerType::Cosine, 1000) < 1e-12);
    }

    #[test]
    fn test_no_warmup_no_total_does_not_divide_by_zero() {
        let scheduler = LRScheduler::new(LrSchedulerType::Cosine, 1e-3, 0, 0);
        assert!(scheduler.get_lr().is_finite());
        assert_eq!(scheduler.get_lr(), 1e-3);
    }
}
