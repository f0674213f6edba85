//! Per-epoch learning-rate schedules.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum LrSchedule {
    /// `(1 - x / E) * (1 - lrf) + lrf`
    Linear { lrf: f64, epochs: usize },
    /// One-cycle cosine: `((1 - cos(pi * x / E)) / 2) * (lrf - 1) + 1`
    Cosine { lrf: f64, epochs: usize },
    /// `gamma ^ x`
    Exponential { gamma: f64 },
}

impl LrSchedule {
    pub fn factor(&self, epoch: usize) -> f64 {
        let x = epoch as f64;
        match *self {
            LrSchedule::Linear { lrf, epochs } => {
                (1.0 - x / epochs.max(1) as f64) * (1.0 - lrf) + lrf
            }
            LrSchedule::Cosine { lrf, epochs } => {
                let c = (x * std::f64::consts::PI / epochs.max(1) as f64).cos();
                ((1.0 - c) / 2.0) * (lrf - 1.0) + 1.0
            }
            LrSchedule::Exponential { gamma } => gamma.powi(epoch as i32),
        }
    }
}

/// A base LR, its schedule, and the epoch it is currently at.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EpochScheduler {
    base_lr: f64,
    schedule: LrSchedule,
    epoch: usize,
}

impl EpochScheduler {
    pub fn new(base_lr: f64, schedule: LrSchedule) -> Self {
        Self {
            base_lr,
            schedule,
            epoch: 0,
        }
    }

    pub fn base_lr(&self) -> f64 {
        self.base_lr
    }

    pub fn epoch(&self) -> usize {
        self.epoch
    }

    pub fn factor(&self, epoch: usize) -> f64 {
        self.schedule.factor(epoch)
    }

    pub fn lr(&self) -> f64 {
        self.base_lr * self.schedule.factor(self.epoch)
    }

    pub fn step(&mut self) {
        self.epoch += 1;
    }

    /// Positions the schedule at `epoch`, e.g. when resuming.
    pub fn set_epoch(&mut self, epoch: usize) {
        self.epoch = epoch;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn linear_and_cosine_end_at_lrf() {
        for s in [
            LrSchedule::Linear { lrf: 0.01, epochs: 50 },
            LrSchedule::Cosine { lrf: 0.01, epochs: 50 },
        ] {
            assert!((s.factor(0) - 1.0).abs() < 1e-12);
            assert!((s.factor(50) - 0.01).abs() < 1e-12);
            assert!(s.factor(10) > s.factor(40));
        }
        let cos = LrSchedule::Cosine { lrf: 0.01, epochs: 50 };
        assert!((cos.factor(25) - 0.505).abs() < 1e-9);
    }

    #[test]
    fn scheduler_steps_through_exponential_decay() {
        let mut s = EpochScheduler::new(1e-3, LrSchedule::Exponential { gamma: 0.95 });
        assert_eq!(s.lr(), 1e-3);
        s.step();
        s.step();
        assert!((s.lr() - 1e-3 * 0.9025).abs() < 1e-15);
        s.set_epoch(0);
        assert_eq!(s.epoch(), 0);
    }

    #[test]
    fn state_survives_json() {
        let mut s = EpochScheduler::new(0.01, LrSchedule::Cosine { lrf: 0.1, epochs: 10 });
        s.step();
        let json = serde_json::to_string(&s).unwrap();
        let back: EpochScheduler = serde_json::from_str(&json).unwrap();
        assert_eq!(back, s);
    }
}
