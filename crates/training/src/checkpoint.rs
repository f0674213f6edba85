//! Checkpoint directories.
//!
//! ```text
//! <run_dir>/weights/<marker>/
//!   state.json           epoch, fitness, EMA updates, scaler, schedules, config
//!   detector.bin         detector_ema.bin
//!   control.bin          control_ema.bin
//!   detector_optim.bin   control_optim.bin   (absent once stripped)
//! ```
//! Markers are `last`, `best` and `epoch{n}`.

use std::path::{Path, PathBuf};

use burn::module::Module;
use burn::record::{BinFileRecorder, FullPrecisionSettings, HalfPrecisionSettings, Record, Recorder};
use burn::tensor::backend::Backend;
use serde::{Deserialize, Serialize};

use crate::config::{CheckpointPrecision, TrainConfig};
use crate::early_stop::EarlyStopping;
use crate::grads::GradScaler;
use crate::schedule::EpochScheduler;
use crate::{TrainError, TrainResult};

pub const STATE_FILE: &str = "state.json";
pub const DETECTOR: &str = "detector";
pub const DETECTOR_EMA: &str = "detector_ema";
pub const CONTROL: &str = "control";
pub const CONTROL_EMA: &str = "control_ema";
pub const DETECTOR_OPTIM: &str = "detector_optim";
pub const CONTROL_OPTIM: &str = "control_optim";

/// Scalar training state stored next to the weight records.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CheckpointState {
    pub epoch: usize,
    pub best_fitness: f64,
    pub detector_ema_updates: u64,
    pub control_ema_updates: u64,
    pub scaler: GradScaler,
    pub detector_schedule: EpochScheduler,
    pub control_schedule: EpochScheduler,
    pub early_stop: EarlyStopping,
    pub iteration: usize,
    pub finished: bool,
    pub optimizer_stripped: bool,
    pub config: TrainConfig,
    /// RFC 3339.
    pub timestamp: String,
}

impl CheckpointState {
    pub fn write(&self, dir: &Path) -> TrainResult<()> {
        std::fs::create_dir_all(dir).map_err(|e| TrainError::io(dir, e))?;
        let path = dir.join(STATE_FILE);
        let json = serde_json::to_string_pretty(self).map_err(|source| TrainError::Json {
            path: path.clone(),
            source,
        })?;
        std::fs::write(&path, json).map_err(|e| TrainError::io(&path, e))
    }

    pub fn read(dir: &Path) -> TrainResult<Self> {
        let path = dir.join(STATE_FILE);
        let raw = std::fs::read(&path).map_err(|e| TrainError::io(&path, e))?;
        serde_json::from_slice(&raw).map_err(|source| TrainError::Json { path, source })
    }
}

pub fn checkpoint_dir(run_dir: &Path, marker: &str) -> PathBuf {
    run_dir.join("weights").join(marker)
}

pub fn epoch_marker(epoch: usize) -> String {
    format!("epoch{epoch}")
}

/// File the binary recorder writes for `path`.
pub fn record_file(path: &Path) -> PathBuf {
    path.with_extension("bin")
}

fn recorder_error(path: &Path, e: impl std::fmt::Display) -> TrainError {
    TrainError::Recorder {
        path: record_file(path),
        msg: e.to_string(),
    }
}

pub fn save_record<B: Backend, R: Record<B>>(
    record: R,
    path: &Path,
    precision: CheckpointPrecision,
) -> TrainResult<()> {
    let result = match precision {
        CheckpointPrecision::Full => Recorder::<B>::record(
            &BinFileRecorder::<FullPrecisionSettings>::new(),
            record,
            path.to_path_buf(),
        ),
        CheckpointPrecision::Half => Recorder::<B>::record(
            &BinFileRecorder::<HalfPrecisionSettings>::new(),
            record,
            path.to_path_buf(),
        ),
    };
    result.map_err(|e| recorder_error(path, e))
}

pub fn load_record<B: Backend, R: Record<B>>(
    path: &Path,
    precision: CheckpointPrecision,
    device: &B::Device,
) -> TrainResult<R> {
    let result = match precision {
        CheckpointPrecision::Full => Recorder::<B>::load(
            &BinFileRecorder::<FullPrecisionSettings>::new(),
            path.to_path_buf(),
            device,
        ),
        CheckpointPrecision::Half => Recorder::<B>::load(
            &BinFileRecorder::<HalfPrecisionSettings>::new(),
            path.to_path_buf(),
            device,
        ),
    };
    result.map_err(|e| recorder_error(path, e))
}

pub fn save_module<B: Backend, M: Module<B>>(
    module: &M,
    path: &Path,
    precision: CheckpointPrecision,
) -> TrainResult<()> {
    save_record(module.clone().into_record(), path, precision)
}

pub fn load_module<B: Backend, M: Module<B>>(
    module: M,
    path: &Path,
    precision: CheckpointPrecision,
    device: &B::Device,
) -> TrainResult<M> {
    let record = load_record::<B, M::Record>(path, precision, device)?;
    Ok(module.load_record(record))
}

/// Like [`load_module`] but keeps `module` (with a warning) when the record is absent.
pub fn load_module_or_keep<B: Backend, M: Module<B>>(
    module: M,
    path: &Path,
    precision: CheckpointPrecision,
    device: &B::Device,
) -> TrainResult<(M, bool)> {
    if !record_file(path).is_file() {
        log::warn!(
            "checkpoint has no {}; starting it from fresh weights",
            record_file(path).display()
        );
        return Ok((module, false));
    }
    Ok((load_module(module, path, precision, device)?, true))
}

/// Removes optimizer records so the checkpoint only carries weights.
pub fn strip_optimizer(dir: &Path) -> TrainResult<()> {
    for name in [DETECTOR_OPTIM, CONTROL_OPTIM] {
        let file = record_file(&dir.join(name));
        if file.is_file() {
            std::fs::remove_file(&file).map_err(|e| TrainError::io(&file, e))?;
        }
    }
    let mut state = CheckpointState::read(dir)?;
    state.optimizer_stripped = true;
    state.write(dir)?;
    log::info!("optimizer stripped from {}", dir.display());
    Ok(())
}

pub fn timestamp() -> String {
    chrono::Utc::now().to_rfc3339()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schedule::LrSchedule;

    fn state() -> CheckpointState {
        CheckpointState {
            epoch: 3,
            best_fitness: 0.42,
            detector_ema_updates: 17,
            control_ema_updates: 17,
            scaler: GradScaler::new(true),
            detector_schedule: EpochScheduler::new(0.01, LrSchedule::Linear { lrf: 0.01, epochs: 10 }),
            control_schedule: EpochScheduler::new(1e-5, LrSchedule::Exponential { gamma: 0.95 }),
            early_stop: EarlyStopping::new(100),
            iteration: 120,
            finished: false,
            optimizer_stripped: false,
            config: TrainConfig::default(),
            timestamp: timestamp(),
        }
    }

    #[test]
    fn state_round_trips_through_json() {
        let dir = tempfile::tempdir().unwrap();
        let s = state();
        s.write(dir.path()).unwrap();
        assert_eq!(CheckpointState::read(dir.path()).unwrap(), s);
        assert!(chrono::DateTime::parse_from_rfc3339(&s.timestamp).is_ok());
    }

    #[test]
    fn strip_removes_optimizer_files() {
        let dir = tempfile::tempdir().unwrap();
        state().write(dir.path()).unwrap();
        let optim = record_file(&dir.path().join(DETECTOR_OPTIM));
        std::fs::write(&optim, b"x").unwrap();
        strip_optimizer(dir.path()).unwrap();
        assert!(!optim.exists());
        assert!(CheckpointState::read(dir.path()).unwrap().optimizer_stripped);
    }

    #[test]
    fn markers() {
        let dir = checkpoint_dir(Path::new("runs/exp"), &epoch_marker(7));
        assert_eq!(dir, PathBuf::from("runs/exp/weights/epoch7"));
    }
}
