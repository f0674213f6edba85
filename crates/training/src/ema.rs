//! Exponential moving average of model weights.
//!
//! The shadow lives on the inner (non-autodiff) backend. Each update rebuilds it
//! from the current model: every float tensor the module visits, batch-norm
//! running statistics included, becomes `d * shadow + (1 - d) * current`. Tensors
//! the shadow has no entry for are taken from the current model as they are.

use std::collections::HashMap;
use std::marker::PhantomData;

use burn::module::{Module, ModuleMapper, ModuleVisitor, ParamId};
use burn::tensor::{backend::Backend, Tensor};

#[derive(Debug, Clone)]
pub struct ModelEma<B: Backend, M: Module<B>> {
    module: M,
    updates: u64,
    decay: f64,
    tau: f64,
    _backend: PhantomData<B>,
}

impl<B: Backend, M: Module<B>> ModelEma<B, M> {
    pub fn new(module: M, decay: f64, tau: f64) -> Self {
        Self {
            module: module.no_grad(),
            updates: 0,
            decay,
            tau,
            _backend: PhantomData,
        }
    }

    pub fn with_updates(mut self, updates: u64) -> Self {
        self.updates = updates;
        self
    }

    pub fn module(&self) -> &M {
        &self.module
    }

    pub fn into_module(self) -> M {
        self.module
    }

    pub fn updates(&self) -> u64 {
        self.updates
    }

    /// `decay * (1 - exp(-updates / tau))`; a zero tau gives the fixed decay.
    pub fn decay_at(&self, updates: u64) -> f64 {
        if self.tau <= 0.0 {
            self.decay
        } else {
            self.decay * (1.0 - (-(updates as f64) / self.tau).exp())
        }
    }

    /// Folds `current` (same architecture, same parameter ids) into the shadow.
    pub fn update(&mut self, current: M) {
        self.updates += 1;
        let d = self.decay_at(self.updates);
        let mut collect = Collect::<B> {
            params: HashMap::new(),
        };
        self.module.visit(&mut collect);
        let mut blend = Blend {
            shadow: collect.params,
            decay: d,
        };
        self.module = current.map(&mut blend).no_grad();
    }
}

struct Collect<B: Backend> {
    params: HashMap<ParamId, Tensor<B, 1>>,
}

impl<B: Backend> ModuleVisitor<B> for Collect<B> {
    fn visit_float<const D: usize>(&mut self, id: ParamId, tensor: &Tensor<B, D>) {
        let numel: usize = tensor.dims().iter().product();
        self.params.insert(id, tensor.clone().reshape([numel]));
    }
}

struct Blend<B: Backend> {
    shadow: HashMap<ParamId, Tensor<B, 1>>,
    decay: f64,
}

impl<B: Backend> ModuleMapper<B> for Blend<B> {
    fn map_float<const D: usize>(&mut self, id: ParamId, tensor: Tensor<B, D>) -> Tensor<B, D> {
        match self.shadow.remove(&id) {
            Some(old) => {
                let dims = tensor.dims();
                old.reshape(dims).mul_scalar(self.decay) + tensor.mul_scalar(1.0 - self.decay)
            }
            None => tensor,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use burn::backend::NdArray;
    use burn::nn::{BatchNorm, BatchNormConfig, Linear, LinearConfig};

    type TestBackend = NdArray<f32>;

    #[derive(Module, Debug)]
    struct Tiny<B: Backend> {
        fc: Linear<B>,
    }

    fn values(m: &Tiny<TestBackend>) -> Vec<f32> {
        m.fc.weight.val().into_data().to_vec::<f32>().unwrap()
    }

    #[test]
    fn fixed_decay_update_matches_formula() {
        let device = Default::default();
        let model = Tiny::<TestBackend> {
            fc: LinearConfig::new(3, 2).init(&device),
        };
        let old = values(&model);
        let mut ema = ModelEma::new(model.clone(), 0.9, 0.0);

        // shift every weight by +1
        let moved = Tiny {
            fc: Linear {
                weight: model.fc.weight.clone().map(|w| w.add_scalar(1.0)),
                bias: model.fc.bias.clone(),
            },
        };
        let new = values(&moved);
        ema.update(moved);
        assert_eq!(ema.updates(), 1);
        for ((o, n), e) in old.iter().zip(new.iter()).zip(values(ema.module()).iter()) {
            assert!((0.9 * o + 0.1 * n - e).abs() < 1e-6);
        }
    }

    #[test]
    fn ramped_decay_starts_small_and_approaches_target() {
        let device = Default::default();
        let model = Tiny::<TestBackend> {
            fc: LinearConfig::new(3, 2).init(&device),
        };
        let ema = ModelEma::new(model, 0.9999, 2000.0);
        assert!(ema.decay_at(1) < 0.001);
        assert!((ema.decay_at(100_000) - 0.9999).abs() < 1e-6);
        assert!(ema.decay_at(10) < ema.decay_at(1000));
    }

    #[derive(Module, Debug)]
    struct Normed<B: Backend> {
        fc: Linear<B>,
        norm: BatchNorm<B, 1>,
    }

    struct Shift;

    impl ModuleMapper<TestBackend> for Shift {
        fn map_float<const D: usize>(
            &mut self,
            _id: ParamId,
            tensor: Tensor<TestBackend, D>,
        ) -> Tensor<TestBackend, D> {
            tensor.add_scalar(1.0)
        }
    }

    #[test]
    fn running_statistics_are_blended_too() {
        let device = Default::default();
        let model = Normed::<TestBackend> {
            fc: LinearConfig::new(3, 2).init(&device),
            norm: BatchNormConfig::new(2).init(&device),
        };
        let mut ema = ModelEma::new(model.clone(), 0.9, 0.0);
        ema.update(model.map(&mut Shift));

        let stats = |t: Tensor<TestBackend, 1>| t.into_data().to_vec::<f32>().unwrap();
        let norm = &ema.module().norm;
        // fresh running mean is 0 and running var is 1; both moved by +1
        for m in stats(norm.running_mean.value()) {
            assert!((m - 0.1).abs() < 1e-6, "{m}");
        }
        for v in stats(norm.running_var.value()) {
            assert!((v - 1.1).abs() < 1e-6, "{v}");
        }
        for g in stats(norm.gamma.val()) {
            assert!((g - 1.1).abs() < 1e-6, "{g}");
        }
    }
}
