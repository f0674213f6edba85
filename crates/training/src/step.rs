//! The joint training iteration.
//!
//! One call to [`train_step`] runs warmup bookkeeping, the forward pass through
//! control network, codec surrogate, bit estimator and detector, a single backward
//! pass, and (every `accumulate` iterations) the optimizer step for both networks.

use burn::module::AutodiffModule;
use burn::optim::{GradientsParams, Optimizer};
use burn::tensor::backend::{AutodiffBackend, Backend};
use burn::tensor::{ElementConversion, Tensor};
use models::{BitEstimator, ControlModule, DetectionLoss, DetectionModel, LossGains};
use serde::{Deserialize, Serialize};
use transforms::CodecSurrogate;

use crate::config::{DetectorGradient, LossWeights, RateTerm, TrainConfig};
use crate::dataset::DetectionBatch;
use crate::grads::{clip_grad_norm, scale_grads};
use crate::optim::GroupLr;
use crate::state::TrainingState;
use crate::{TrainError, TrainResult};

/// Per-run constants the step needs, derived once from the config.
#[derive(Debug, Clone)]
pub struct StepSettings {
    pub batch_size: usize,
    pub nbs: usize,
    /// Steady-state accumulation count.
    pub accumulate: usize,
    /// `None` disables warmup.
    pub warmup_iters: Option<usize>,
    pub warmup_bias_lr: f64,
    pub warmup_momentum: f64,
    pub momentum: f64,
    pub weights: LossWeights,
    pub rate_term: RateTerm,
    pub detector_gradient: DetectorGradient,
    pub gains: LossGains,
    pub max_grad_norm: f64,
    pub world_size: usize,
    pub is_main: bool,
}

impl StepSettings {
    pub fn from_config(cfg: &TrainConfig, batches_per_epoch: usize, is_main: bool) -> Self {
        let warmup_iters = (cfg.hyp.warmup_epochs > 0.0).then(|| {
            ((cfg.hyp.warmup_epochs * batches_per_epoch as f64).round() as usize).max(100)
        });
        Self {
            batch_size: cfg.batch_size,
            nbs: cfg.nbs,
            accumulate: cfg.accumulate(),
            warmup_iters,
            warmup_bias_lr: cfg.hyp.warmup_bias_lr,
            warmup_momentum: cfg.hyp.warmup_momentum,
            momentum: cfg.hyp.momentum,
            weights: cfg.loss_weights(),
            rate_term: cfg.rate_term(),
            detector_gradient: cfg.detector_gradient,
            gains: cfg.hyp.gains(),
            max_grad_norm: cfg.max_grad_norm as f64,
            world_size: cfg.world_size,
            is_main,
        }
    }
}

/// Frozen collaborators shared by every step.
pub struct StepContext<'a, B: Backend> {
    pub estimator: &'a BitEstimator<B>,
    pub codec: &'a CodecSurrogate<B>,
    pub settings: StepSettings,
}

/// `rate_weight * rate + detection_weight * detection`.
pub fn combined_loss<B: Backend>(
    rate: Tensor<B, 1>,
    detection: Tensor<B, 1>,
    weights: LossWeights,
) -> Tensor<B, 1> {
    rate.mul_scalar(weights.rate) + detection.mul_scalar(weights.detection)
}

/// Result of the joint forward pass, still attached to the graph.
#[derive(Debug, Clone)]
pub struct JointLoss<B: Backend> {
    pub total: Tensor<B, 1>,
    /// Detection loss already multiplied by the world size.
    pub detection: DetectionLoss<B>,
    pub rate: Tensor<B, 1>,
    pub bpp: Tensor<B, 1>,
    pub params: Tensor<B, 2>,
}

/// control parameters -> apply -> codec -> estimator and detector -> combined loss.
pub fn joint_forward<B, D, C>(
    detector: &D,
    control: &C,
    estimator: &BitEstimator<B>,
    codec: &CodecSurrogate<B>,
    batch: DetectionBatch<B>,
    settings: &StepSettings,
) -> TrainResult<JointLoss<B>>
where
    B: Backend,
    D: DetectionModel<B>,
    C: ControlModule<B>,
{
    let params = control.predict_parameters(batch.images.clone())?;
    let degraded = control.apply(batch.images, params.clone())?;
    let coded = codec.round_trip(degraded)?;
    let bpp = estimator.bits_per_pixel(&coded);
    let preds = detector.forward(coded.reconstructed);
    let mut detection =
        detector.compute_loss(&preds, &batch.targets, settings.gains, Some(params.clone()))?;
    if settings.world_size > 1 {
        detection.total = detection.total.mul_scalar(settings.world_size as f32);
    }
    let rate = match settings.rate_term {
        RateTerm::Estimator => bpp.clone(),
        RateTerm::InverseScale => control.rate_proxy(params.clone()).ok_or_else(|| {
            TrainError::Config(format!("{} control has no rate proxy", control.kind()))
        })?,
    };
    let total = combined_loss(rate.clone(), detection.total.clone(), settings.weights);
    Ok(JointLoss {
        total,
        detection,
        rate,
        bpp,
        params,
    })
}

/// Detached scalars of one iteration.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct LossItems {
    #[serde(rename = "box")]
    pub box_loss: f64,
    #[serde(rename = "obj")]
    pub obj_loss: f64,
    #[serde(rename = "cls")]
    pub cls_loss: f64,
    pub total: f64,
    pub bpp: f64,
}

impl<B: Backend> JointLoss<B> {
    pub fn items(&self) -> LossItems {
        LossItems {
            box_loss: scalar(self.detection.box_loss.clone()),
            obj_loss: scalar(self.detection.obj_loss.clone()),
            cls_loss: scalar(self.detection.cls_loss.clone()),
            total: scalar(self.total.clone()),
            bpp: scalar(self.bpp.clone()),
        }
    }
}

pub(crate) fn scalar<B: Backend>(t: Tensor<B, 1>) -> f64 {
    t.into_scalar().elem::<f64>()
}

/// Running means `m = (m * i + x) / (i + 1)` over an epoch.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct RunningMeans {
    count: usize,
    means: LossItems,
}

impl RunningMeans {
    pub fn push(&mut self, x: &LossItems) {
        let i = self.count as f64;
        let avg = |m: f64, v: f64| (m * i + v) / (i + 1.0);
        self.means = LossItems {
            box_loss: avg(self.means.box_loss, x.box_loss),
            obj_loss: avg(self.means.obj_loss, x.obj_loss),
            cls_loss: avg(self.means.cls_loss, x.cls_loss),
            total: avg(self.means.total, x.total),
            bpp: avg(self.means.bpp, x.bpp),
        };
        self.count += 1;
    }

    pub fn means(&self) -> LossItems {
        self.means
    }

    pub fn count(&self) -> usize {
        self.count
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct StepOutcome {
    pub items: LossItems,
    /// Both optimizers stepped this iteration.
    pub stepped: bool,
    /// The loss or the gradients were not finite; nothing was applied.
    pub skipped: bool,
}

/// Linear interpolation of `x` in `[0, x1]` onto `[y0, y1]`, clamped at the ends.
fn ramp(x: usize, x1: usize, y0: f64, y1: f64) -> f64 {
    if x1 == 0 {
        return y1;
    }
    let t = (x as f64 / x1 as f64).clamp(0.0, 1.0);
    y0 + t * (y1 - y0)
}

/// One iteration at global index `ni`.
pub fn train_step<B, D, C, O>(
    state: &mut TrainingState<B, D, C, O>,
    ctx: &StepContext<'_, B>,
    batch: DetectionBatch<B>,
    ni: usize,
) -> TrainResult<StepOutcome>
where
    B: AutodiffBackend,
    D: DetectionModel<B> + AutodiffModule<B>,
    C: ControlModule<B> + AutodiffModule<B>,
    O: Optimizer<C, B>,
{
    let s = &ctx.settings;
    state.iteration = ni;

    let target_lr = state.detector_schedule.lr();
    let mut accumulate = s.accumulate;
    let mut lr = GroupLr::uniform(target_lr);
    if let Some(nw) = s.warmup_iters.filter(|nw| ni <= *nw) {
        let nominal = s.nbs as f64 / s.batch_size.max(1) as f64;
        accumulate = (ramp(ni, nw, 1.0, nominal).round() as usize).max(1);
        lr = GroupLr {
            weights: ramp(ni, nw, 0.0, target_lr),
            biases: ramp(ni, nw, s.warmup_bias_lr, target_lr),
        };
        state
            .detector_optim
            .set_momentum(ramp(ni, nw, s.warmup_momentum, s.momentum));
    }

    let joint = joint_forward(
        &state.detector,
        &state.control,
        ctx.estimator,
        ctx.codec,
        batch,
        s,
    )?;
    let items = joint.items();
    if !items.total.is_finite() {
        log::warn!("non-finite loss {} at iteration {ni}; skipping", items.total);
        return Ok(StepOutcome {
            items,
            stepped: false,
            skipped: true,
        });
    }

    let mut grads = joint
        .total
        .mul_scalar(state.scaler.scale())
        .backward();
    let detector_grads = GradientsParams::from_module(&mut grads, &state.detector);
    let control_grads = GradientsParams::from_module(&mut grads, &state.control);
    state.detector_accum.accumulate(&state.detector, detector_grads);
    state.control_accum.accumulate(&state.control, control_grads);

    if (ni as i64 - state.last_opt_step) < accumulate as i64 {
        return Ok(StepOutcome {
            items,
            stepped: false,
            skipped: false,
        });
    }
    state.last_opt_step = ni as i64;

    let unscale = 1.0 / state.scaler.scale();
    let detector_factor = match s.detector_gradient {
        DetectorGradient::Combined => unscale,
        DetectorGradient::DetectionOnly => unscale / s.weights.detection as f64,
    };
    let detector_grads = scale_grads(&state.detector, state.detector_accum.grads(), detector_factor);
    let control_grads = scale_grads(&state.control, state.control_accum.grads(), unscale);
    let (detector_grads, detector_norm) =
        clip_grad_norm(&state.detector, detector_grads, s.max_grad_norm);
    let (control_grads, control_norm) =
        clip_grad_norm(&state.control, control_grads, s.max_grad_norm);

    let found_inf = !detector_norm.is_finite() || !control_norm.is_finite();
    state.scaler.update(found_inf);
    if found_inf {
        log::warn!(
            "non-finite gradients at iteration {ni} (detector {detector_norm}, control {control_norm}); skipping step"
        );
        return Ok(StepOutcome {
            items,
            stepped: false,
            skipped: true,
        });
    }

    state.detector = state
        .detector_optim
        .step(lr, state.detector.clone(), detector_grads);
    state.control = state
        .control_optim
        .step(state.control_schedule.lr(), state.control.clone(), control_grads)
        .refreeze();
    if s.is_main {
        state.detector_ema.update(state.detector.valid());
        state.control_ema.update(state.control.valid());
    }
    log::trace!("optimizer step at iteration {ni} (accumulate {accumulate})");

    Ok(StepOutcome {
        items,
        stepped: true,
        skipped: false,
    })
}
