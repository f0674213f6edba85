//! Gradient bookkeeping between backward and the optimizer step: norms, scaling,
//! clipping and the dynamic loss scaler.

use burn::module::{AutodiffModule, ModuleVisitor, ParamId};
use burn::optim::GradientsParams;
use burn::tensor::backend::AutodiffBackend;
use burn::tensor::{ElementConversion, Tensor};
use serde::{Deserialize, Serialize};

struct NormVisitor<'a> {
    grads: &'a GradientsParams,
    sum_sq: f64,
}

impl<B: AutodiffBackend> ModuleVisitor<B> for NormVisitor<'_> {
    fn visit_float<const D: usize>(&mut self, id: ParamId, _tensor: &Tensor<B, D>) {
        if let Some(g) = self.grads.get::<B::InnerBackend, D>(id) {
            let sq: f64 = g.powf_scalar(2.0).sum().into_scalar().elem();
            self.sum_sq += sq;
        }
    }
}

/// L2 norm over every gradient belonging to `module`. NaN/inf propagate.
pub fn global_norm<B: AutodiffBackend, M: AutodiffModule<B>>(module: &M, grads: &GradientsParams) -> f64 {
    let mut visitor = NormVisitor { grads, sum_sq: 0.0 };
    module.visit(&mut visitor);
    visitor.sum_sq.sqrt()
}

struct ScaleVisitor<'a> {
    grads: &'a mut GradientsParams,
    factor: f64,
}

impl<B: AutodiffBackend> ModuleVisitor<B> for ScaleVisitor<'_> {
    fn visit_float<const D: usize>(&mut self, id: ParamId, _tensor: &Tensor<B, D>) {
        if let Some(g) = self.grads.remove::<B::InnerBackend, D>(id) {
            self.grads.register::<B::InnerBackend, D>(id, g.mul_scalar(self.factor));
        }
    }
}

pub fn scale_grads<B: AutodiffBackend, M: AutodiffModule<B>>(
    module: &M,
    mut grads: GradientsParams,
    factor: f64,
) -> GradientsParams {
    if factor == 1.0 {
        return grads;
    }
    let mut visitor = ScaleVisitor {
        grads: &mut grads,
        factor,
    };
    module.visit(&mut visitor);
    grads
}

/// Rescales so the global norm is at most `max_norm`; returns the pre-clip norm.
pub fn clip_grad_norm<B: AutodiffBackend, M: AutodiffModule<B>>(
    module: &M,
    grads: GradientsParams,
    max_norm: f64,
) -> (GradientsParams, f64) {
    let norm = global_norm(module, &grads);
    if norm.is_finite() && norm > max_norm {
        (scale_grads(module, grads, max_norm / (norm + 1e-6)), norm)
    } else {
        (grads, norm)
    }
}

/// Dynamic loss scaling: grow after a run of clean steps, back off on overflow.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GradScaler {
    enabled: bool,
    scale: f64,
    growth_factor: f64,
    backoff_factor: f64,
    growth_interval: usize,
    clean_steps: usize,
}

impl GradScaler {
    pub fn new(enabled: bool) -> Self {
        Self {
            enabled,
            scale: 65536.0,
            growth_factor: 2.0,
            backoff_factor: 0.5,
            growth_interval: 2000,
            clean_steps: 0,
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    /// Multiplier applied to the loss before backward.
    pub fn scale(&self) -> f64 {
        if self.enabled {
            self.scale
        } else {
            1.0
        }
    }

    /// Records the outcome of one optimizer step.
    pub fn update(&mut self, found_inf: bool) {
        if !self.enabled {
            return;
        }
        if found_inf {
            self.scale *= self.backoff_factor;
            self.clean_steps = 0;
            log::debug!("grad scaler backoff to {}", self.scale);
        } else {
            self.clean_steps += 1;
            if self.clean_steps >= self.growth_interval {
                self.scale *= self.growth_factor;
                self.clean_steps = 0;
            }
        }
    }
}

impl Default for GradScaler {
    fn default() -> Self {
        Self::new(false)
    }
}
