//! Everything a run carries between iterations, and its checkpoint round trip.

use std::path::Path;

use burn::module::AutodiffModule;
use burn::optim::{GradientsAccumulator, Optimizer};
use burn::tensor::backend::AutodiffBackend;
use models::{ControlModule, DetectionModel};

use crate::checkpoint::{
    load_module, load_module_or_keep, load_record, record_file, save_module, save_record,
    CheckpointState, CONTROL, CONTROL_EMA, CONTROL_OPTIM, DETECTOR, DETECTOR_EMA, DETECTOR_OPTIM,
};
use crate::config::TrainConfig;
use crate::early_stop::EarlyStopping;
use crate::ema::ModelEma;
use crate::grads::GradScaler;
use crate::optim::SgdMomentum;
use crate::schedule::{EpochScheduler, LrSchedule};
use crate::{TrainError, TrainResult};

/// Detector `D` and control network `C` on the autodiff backend `B`, the SGD for
/// the detector and an arbitrary burn optimizer `O` for the control head.
pub struct TrainingState<B, D, C, O>
where
    B: AutodiffBackend,
    D: DetectionModel<B> + AutodiffModule<B>,
    C: ControlModule<B> + AutodiffModule<B>,
    O: Optimizer<C, B>,
{
    pub detector: D,
    pub control: C,
    pub detector_optim: SgdMomentum<B>,
    pub control_optim: O,
    pub detector_schedule: EpochScheduler,
    pub control_schedule: EpochScheduler,
    pub detector_ema: ModelEma<B::InnerBackend, D::InnerModule>,
    pub control_ema: ModelEma<B::InnerBackend, C::InnerModule>,
    pub scaler: GradScaler,
    pub early_stop: EarlyStopping,
    /// Epoch currently being trained (0-based).
    pub epoch: usize,
    pub best_fitness: f64,
    /// Global iteration counter `ni` across epochs.
    pub iteration: usize,
    pub(crate) last_opt_step: i64,
    pub(crate) detector_accum: GradientsAccumulator<D>,
    pub(crate) control_accum: GradientsAccumulator<C>,
}

impl<B, D, C, O> TrainingState<B, D, C, O>
where
    B: AutodiffBackend,
    D: DetectionModel<B> + AutodiffModule<B>,
    C: ControlModule<B> + AutodiffModule<B>,
    O: Optimizer<C, B>,
{
    pub fn new(detector: D, control: C, control_optim: O, cfg: &TrainConfig) -> Self {
        let detector_schedule = if cfg.cos_lr {
            LrSchedule::Cosine {
                lrf: cfg.hyp.lrf,
                epochs: cfg.epochs,
            }
        } else {
            LrSchedule::Linear {
                lrf: cfg.hyp.lrf,
                epochs: cfg.epochs,
            }
        };
        let detector_optim = SgdMomentum::new(cfg.hyp.momentum, cfg.scaled_weight_decay())
            .with_norm_scales(detector.norm_scales());
        Self {
            detector_ema: ModelEma::new(detector.valid(), cfg.ema_decay, cfg.ema_tau),
            control_ema: ModelEma::new(control.valid(), cfg.ema_decay, cfg.ema_tau),
            detector,
            control,
            detector_optim,
            control_optim,
            detector_schedule: EpochScheduler::new(cfg.hyp.lr0, detector_schedule),
            control_schedule: EpochScheduler::new(
                cfg.control_lr(),
                LrSchedule::Exponential {
                    gamma: cfg.hyp.control_gamma,
                },
            ),
            scaler: GradScaler::new(cfg.amp),
            early_stop: EarlyStopping::new(cfg.patience),
            epoch: 0,
            best_fitness: 0.0,
            iteration: 0,
            last_opt_step: -1,
            detector_accum: GradientsAccumulator::new(),
            control_accum: GradientsAccumulator::new(),
        }
    }

    /// Iteration of the most recent optimizer step, if any.
    pub fn last_opt_step(&self) -> Option<usize> {
        usize::try_from(self.last_opt_step).ok()
    }

    /// Steps both LR schedules at the end of an epoch.
    pub fn end_epoch(&mut self) {
        self.detector_schedule.step();
        self.control_schedule.step();
    }

    pub fn checkpoint_state(&self, config: &TrainConfig, finished: bool) -> CheckpointState {
        CheckpointState {
            epoch: self.epoch,
            best_fitness: self.best_fitness,
            detector_ema_updates: self.detector_ema.updates(),
            control_ema_updates: self.control_ema.updates(),
            scaler: self.scaler.clone(),
            detector_schedule: self.detector_schedule.clone(),
            control_schedule: self.control_schedule.clone(),
            early_stop: self.early_stop.clone(),
            iteration: self.iteration,
            finished,
            optimizer_stripped: false,
            config: config.clone(),
            timestamp: crate::checkpoint::timestamp(),
        }
    }

    /// Writes weights, EMA shadows, optimizer records and `state.json` into `dir`.
    pub fn save(&self, dir: &Path, config: &TrainConfig, finished: bool) -> TrainResult<()> {
        let precision = config.checkpoint_precision;
        std::fs::create_dir_all(dir).map_err(|e| TrainError::io(dir, e))?;
        save_module(&self.detector, &dir.join(DETECTOR), precision)?;
        save_module(&self.control, &dir.join(CONTROL), precision)?;
        save_module(self.detector_ema.module(), &dir.join(DETECTOR_EMA), precision)?;
        save_module(self.control_ema.module(), &dir.join(CONTROL_EMA), precision)?;
        self.detector_optim.save(&dir.join(DETECTOR_OPTIM), precision)?;
        save_record::<B, O::Record>(
            self.control_optim.to_record(),
            &dir.join(CONTROL_OPTIM),
            precision,
        )?;
        self.checkpoint_state(config, finished).write(dir)?;
        log::debug!("saved checkpoint {}", dir.display());
        Ok(())
    }

    /// Restores from `dir` and positions the state at the epoch after the saved one.
    ///
    /// A missing control record keeps the freshly built control network, its EMA
    /// and its optimizer. A finished run cannot be resumed.
    pub fn resume(
        mut self,
        dir: &Path,
        cfg: &TrainConfig,
        device: &B::Device,
    ) -> TrainResult<(Self, CheckpointState)> {
        let state = CheckpointState::read(dir)?;
        if state.finished || state.optimizer_stripped {
            return Err(TrainError::Config(format!(
                "{} is a finished run; nothing to resume",
                dir.display()
            )));
        }
        let precision = state.config.checkpoint_precision;

        self.detector = load_module(self.detector, &dir.join(DETECTOR), precision, device)?;
        let detector_ema = load_module(
            self.detector_ema.into_module(),
            &dir.join(DETECTOR_EMA),
            precision,
            device,
        )?;
        self.detector_ema = ModelEma::new(detector_ema, cfg.ema_decay, cfg.ema_tau)
            .with_updates(state.detector_ema_updates);
        self.detector_optim = load_optional(
            self.detector_optim,
            &dir.join(DETECTOR_OPTIM),
            |optim, path| optim.load(path, precision, device),
        )?;

        let (control, restored) =
            load_module_or_keep(self.control, &dir.join(CONTROL), precision, device)?;
        self.control = control.refreeze();
        if restored {
            let (control_ema, _) = load_module_or_keep(
                self.control_ema.into_module(),
                &dir.join(CONTROL_EMA),
                precision,
                device,
            )?;
            self.control_ema = ModelEma::new(control_ema, cfg.ema_decay, cfg.ema_tau)
                .with_updates(state.control_ema_updates);
            self.control_optim = load_optional(
                self.control_optim,
                &dir.join(CONTROL_OPTIM),
                |optim, path| {
                    let record = load_record::<B, O::Record>(path, precision, device)?;
                    Ok(optim.load_record(record))
                },
            )?;
        } else {
            self.control_ema = ModelEma::new(self.control.valid(), cfg.ema_decay, cfg.ema_tau);
        }

        self.scaler = state.scaler.clone();
        self.detector_schedule = state.detector_schedule.clone();
        self.control_schedule = state.control_schedule.clone();
        self.early_stop = state.early_stop.clone();
        self.best_fitness = state.best_fitness;
        self.iteration = state.iteration;
        self.epoch = state.epoch + 1;
        log::info!(
            "resumed from {} at epoch {} (best fitness {:.5})",
            dir.display(),
            self.epoch,
            self.best_fitness
        );
        Ok((self, state))
    }
}

fn load_optional<T>(
    value: T,
    path: &Path,
    load: impl FnOnce(T, &Path) -> TrainResult<T>,
) -> TrainResult<T> {
    if record_file(path).is_file() {
        load(value, path)
    } else {
        log::warn!("{} missing; optimizer state starts fresh", record_file(path).display());
        Ok(value)
    }
}
