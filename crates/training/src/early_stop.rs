//! Patience-based early stopping on validation fitness.
//!
//! The state is serialized into checkpoints so a resumed run keeps counting from
//! the best epoch it had already seen.

use serde::{Deserialize, Serialize};

/// Stops training once fitness has not improved for `patience` epochs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EarlyStopping {
    best_fitness: f64,
    best_epoch: usize,
    /// 0 means never stop.
    patience: usize,
    possible_stop: bool,
}

impl EarlyStopping {
    pub fn new(patience: usize) -> Self {
        Self {
            best_fitness: 0.0,
            best_epoch: 0,
            patience,
            possible_stop: false,
        }
    }

    pub fn best_fitness(&self) -> f64 {
        self.best_fitness
    }

    pub fn best_epoch(&self) -> usize {
        self.best_epoch
    }

    /// True when the next epoch without improvement will stop the run.
    pub fn possible_stop(&self) -> bool {
        self.possible_stop
    }

    /// Records `fitness` for `epoch`; returns whether to stop.
    pub fn step(&mut self, epoch: usize, fitness: f64) -> bool {
        if fitness >= self.best_fitness {
            self.best_epoch = epoch;
            self.best_fitness = fitness;
        }
        if self.patience == 0 {
            return false;
        }
        let delta = epoch.saturating_sub(self.best_epoch);
        self.possible_stop = delta + 1 >= self.patience;
        let stop = delta >= self.patience;
        if stop {
            log::info!(
                "stopping early: no improvement in {} epochs, best epoch {} (fitness {:.5})",
                self.patience,
                self.best_epoch,
                self.best_fitness
            );
        }
        stop
    }
}
