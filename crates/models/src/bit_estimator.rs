//! Learned coefficient-block code-length estimator.
//!
//! Each block's 64 features (DC delta first, then 63 AC values in zigzag order) are
//! split into a DC path (small MLP) and an AC path (bidirectional LSTM over the 63
//! values, flattened into an MLP). The block's estimated length in bits is the sum.
//! The estimator is trained elsewhere; here it is only loaded and kept frozen.

use std::path::Path;

use burn::module::Module;
use burn::nn::{BiLstm, BiLstmConfig, Linear, LinearConfig};
use burn::tensor::activation::relu;
use burn::tensor::{backend::Backend, Tensor};
use transforms::{CodecOutput, COEFFS_PER_BLOCK};

use crate::weights::{load_weights, save_weights};
use crate::ModelResult;

const AC_COEFFS: usize = COEFFS_PER_BLOCK - 1;

#[derive(Debug, Clone)]
pub struct BitEstimatorConfig {
    pub hidden: usize,
    pub rnn_hidden: usize,
}

impl Default for BitEstimatorConfig {
    fn default() -> Self {
        Self {
            hidden: 16,
            rnn_hidden: 16,
        }
    }
}

/// Linear layers with ReLU between them (none after the last).
#[derive(Module, Debug)]
pub struct Mlp<B: Backend> {
    layers: Vec<Linear<B>>,
}

impl<B: Backend> Mlp<B> {
    pub fn new(dims: &[usize], device: &B::Device) -> Self {
        let layers = dims
            .windows(2)
            .map(|w| LinearConfig::new(w[0], w[1]).init(device))
            .collect();
        Self { layers }
    }

    pub fn forward(&self, input: Tensor<B, 2>) -> Tensor<B, 2> {
        let last = self.layers.len().saturating_sub(1);
        let mut x = input;
        for (i, layer) in self.layers.iter().enumerate() {
            x = layer.forward(x);
            if i < last {
                x = relu(x);
            }
        }
        x
    }
}

#[derive(Module, Debug)]
pub struct BitEstimator<B: Backend> {
    dc: Mlp<B>,
    ac_rnn: BiLstm<B>,
    ac: Mlp<B>,
}

impl<B: Backend> BitEstimator<B> {
    pub fn new(cfg: BitEstimatorConfig, device: &B::Device) -> Self {
        let h = cfg.hidden;
        Self {
            dc: Mlp::new(&[1, h, h, h, 1], device),
            ac_rnn: BiLstmConfig::new(1, cfg.rnn_hidden, true).init(device),
            ac: Mlp::new(&[2 * cfg.rnn_hidden * AC_COEFFS, h, h, h, 1], device),
        }
    }

    /// Loads trained weights and freezes them. A missing file is an error, never a
    /// silently random estimator.
    pub fn load(cfg: BitEstimatorConfig, path: &Path, device: &B::Device) -> ModelResult<Self> {
        let estimator = load_weights(Self::new(cfg, device), path, device)?;
        log::info!("loaded bit estimator from {}", path.display());
        Ok(estimator.no_grad())
    }

    pub fn save(&self, path: &Path) -> ModelResult<()> {
        save_weights(self.clone(), path)
    }

    /// Features `[N, 64]` to per-block code lengths `[N, 1]`.
    pub fn forward(&self, features: Tensor<B, 2>) -> Tensor<B, 2> {
        let [n, _] = features.dims();
        let dc = self.dc.forward(features.clone().narrow(1, 0, 1));
        let ac = features.narrow(1, 1, AC_COEFFS).reshape([n, AC_COEFFS, 1]);
        let (seq, _) = self.ac_rnn.forward(ac, None);
        let [_, steps, width] = seq.dims();
        let ac = self.ac.forward(seq.reshape([n, steps * width]));
        dc + ac
    }

    /// Mean bits per coded element over the batch, `[1]`.
    pub fn bits_per_pixel(&self, codec: &CodecOutput<B>) -> Tensor<B, 1> {
        let lengths = self.forward(codec.features.clone());
        bits_per_pixel(lengths, codec.batch_size(), codec.coded_elements())
    }
}

/// Per-block lengths `[N, 1]` (N = batch * blocks per image) to mean bits per element.
pub fn bits_per_pixel<B: Backend>(
    lengths: Tensor<B, 2>,
    batch: usize,
    coded_elements: usize,
) -> Tensor<B, 1> {
    let [n, _] = lengths.dims();
    let per_image = lengths.reshape([batch, n / batch.max(1)]).sum_dim(1);
    per_image.mean().div_scalar(coded_elements.max(1) as f32)
}
