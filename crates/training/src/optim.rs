//! Nesterov SGD with YOLO-style parameter groups.
//!
//! Weights (rank >= 2) get decoupled-into-gradient weight decay. Rank-1 tensors
//! get none: norm scales follow the weight learning rate, biases may run at their
//! own during warmup. Norm scales are registered by id since rank alone cannot
//! tell them from biases.
//! Momentum is a plain field so warmup can ramp it per iteration, which burn's
//! stock optimizers do not expose.

use std::collections::{HashMap, HashSet};
use std::path::Path;

use burn::module::{AutodiffModule, ModuleMapper, ParamId};
use burn::optim::GradientsParams;
use burn::tensor::backend::{AutodiffBackend, Backend};
use burn::tensor::Tensor;

use crate::checkpoint::{load_record, save_record};
use crate::config::CheckpointPrecision;
use crate::TrainResult;

/// Learning rates for the two parameter groups.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct GroupLr {
    pub weights: f64,
    pub biases: f64,
}

impl GroupLr {
    pub fn uniform(lr: f64) -> Self {
        Self {
            weights: lr,
            biases: lr,
        }
    }
}

#[derive(Debug, Clone)]
pub struct SgdMomentum<B: AutodiffBackend> {
    momentum: f64,
    weight_decay: f64,
    nesterov: bool,
    norm_scales: HashSet<ParamId>,
    buffers: HashMap<ParamId, Tensor<B::InnerBackend, 1>>,
}

impl<B: AutodiffBackend> SgdMomentum<B> {
    pub fn new(momentum: f64, weight_decay: f64) -> Self {
        Self {
            momentum,
            weight_decay,
            nesterov: true,
            norm_scales: HashSet::new(),
            buffers: HashMap::new(),
        }
    }

    /// Moves these rank-1 parameters from the bias group to the no-decay weight group.
    pub fn with_norm_scales(mut self, ids: impl IntoIterator<Item = ParamId>) -> Self {
        self.norm_scales.extend(ids);
        self
    }

    pub fn momentum(&self) -> f64 {
        self.momentum
    }

    pub fn set_momentum(&mut self, momentum: f64) {
        self.momentum = momentum;
    }

    pub fn weight_decay(&self) -> f64 {
        self.weight_decay
    }

    pub fn is_norm_scale(&self, id: &ParamId) -> bool {
        self.norm_scales.contains(id)
    }

    pub fn num_buffers(&self) -> usize {
        self.buffers.len()
    }

    /// Momentum buffer for one parameter, flattened.
    pub fn buffer(&self, id: &ParamId) -> Option<&Tensor<B::InnerBackend, 1>> {
        self.buffers.get(id)
    }

    pub fn step<M: AutodiffModule<B>>(&mut self, lr: GroupLr, module: M, mut grads: GradientsParams) -> M {
        let mut mapper = SgdMapper {
            optim: self,
            lr,
            grads: &mut grads,
        };
        module.map(&mut mapper)
    }

    pub fn to_record(&self) -> SgdRecord<B::InnerBackend> {
        let mut entries: Vec<SgdEntry<B::InnerBackend>> = self
            .buffers
            .iter()
            .map(|(id, buffer)| SgdEntry {
                id: id.serialize(),
                buffer: buffer.clone(),
            })
            .collect();
        entries.sort_by(|a, b| a.id.cmp(&b.id));
        SgdRecord {
            momentum: self.momentum,
            entries,
        }
    }

    pub fn load_record(mut self, record: SgdRecord<B::InnerBackend>) -> Self {
        self.momentum = record.momentum;
        self.buffers = record
            .entries
            .into_iter()
            .map(|entry| (ParamId::deserialize(&entry.id), entry.buffer))
            .collect();
        self
    }

    pub fn save(&self, path: &Path, precision: CheckpointPrecision) -> TrainResult<()> {
        save_record(self.to_record(), path, precision)
    }

    pub fn load(
        self,
        path: &Path,
        precision: CheckpointPrecision,
        device: &<B::InnerBackend as Backend>::Device,
    ) -> TrainResult<Self> {
        let record = load_record::<B::InnerBackend, SgdRecord<B::InnerBackend>>(path, precision, device)?;
        Ok(self.load_record(record))
    }
}

#[derive(burn::record::Record)]
pub struct SgdRecord<B: Backend> {
    pub momentum: f64,
    pub entries: Vec<SgdEntry<B>>,
}

#[derive(burn::record::Record)]
pub struct SgdEntry<B: Backend> {
    pub id: String,
    pub buffer: Tensor<B, 1>,
}

struct SgdMapper<'a, B: AutodiffBackend> {
    optim: &'a mut SgdMomentum<B>,
    lr: GroupLr,
    grads: &'a mut GradientsParams,
}

impl<B: AutodiffBackend> ModuleMapper<B> for SgdMapper<'_, B> {
    fn map_float<const D: usize>(&mut self, id: ParamId, tensor: Tensor<B, D>) -> Tensor<B, D> {
        let Some(grad) = self.grads.remove::<B::InnerBackend, D>(id) else {
            return tensor;
        };
        let dims = grad.dims();
        let numel: usize = dims.iter().product();
        let is_weight = D >= 2;
        let param = tensor.inner();

        let grad = if is_weight && self.optim.weight_decay > 0.0 {
            grad + param.clone().mul_scalar(self.optim.weight_decay)
        } else {
            grad
        };
        let grad = grad.reshape([numel]);
        let momentum = self.optim.momentum;
        let buffer = match self.optim.buffers.remove(&id) {
            Some(buf) => buf.mul_scalar(momentum) + grad.clone(),
            None => grad.clone(),
        };
        let update = if self.optim.nesterov {
            grad + buffer.clone().mul_scalar(momentum)
        } else {
            buffer.clone()
        };
        self.optim.buffers.insert(id, buffer);

        let lr = if is_weight || self.optim.is_norm_scale(&id) {
            self.lr.weights
        } else {
            self.lr.biases
        };
        let next = param - update.reshape(dims).mul_scalar(lr);
        Tensor::from_inner(next).require_grad()
    }
}
