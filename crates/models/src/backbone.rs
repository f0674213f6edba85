//! Frozen convolutional feature extractor shared by the control networks.

use std::path::Path;

use burn::module::Module;
use burn::nn::conv::{Conv2d, Conv2dConfig};
use burn::nn::PaddingConfig2d;
use burn::tensor::activation::relu;
use burn::tensor::{backend::Backend, Tensor};
use serde::{Deserialize, Serialize};

use crate::weights::load_weights;
use crate::ModelResult;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FeatureExtractorConfig {
    /// Output channels of each stride-2 3x3 stage.
    pub channels: Vec<usize>,
}

impl Default for FeatureExtractorConfig {
    fn default() -> Self {
        Self {
            channels: vec![16, 32, 64, 128],
        }
    }
}

impl FeatureExtractorConfig {
    pub fn feature_dim(&self) -> usize {
        self.channels.last().copied().unwrap_or(3)
    }
}

/// Strided conv stages followed by global average pooling: `[B, 3, H, W] -> [B, F]`.
#[derive(Module, Debug)]
pub struct FeatureExtractor<B: Backend> {
    stages: Vec<Conv2d<B>>,
}

impl<B: Backend> FeatureExtractor<B> {
    /// Builds the extractor with gradients disabled on every parameter.
    pub fn new(cfg: &FeatureExtractorConfig, device: &B::Device) -> Self {
        let mut stages = Vec::with_capacity(cfg.channels.len());
        let mut in_ch = 3;
        for &out_ch in &cfg.channels {
            stages.push(
                Conv2dConfig::new([in_ch, out_ch], [3, 3])
                    .with_stride([2, 2])
                    .with_padding(PaddingConfig2d::Explicit(1, 1))
                    .init(device),
            );
            in_ch = out_ch;
        }
        Self { stages }.no_grad()
    }

    /// Replaces the random initialisation with pretrained weights; still frozen.
    pub fn with_pretrained(self, path: &Path, device: &B::Device) -> ModelResult<Self> {
        let loaded = load_weights(self, path, device)?;
        log::info!("loaded pretrained feature extractor from {}", path.display());
        Ok(loaded.no_grad())
    }

    pub fn forward(&self, images: Tensor<B, 4>) -> Tensor<B, 2> {
        let mut x = images;
        for stage in &self.stages {
            x = relu(stage.forward(x));
        }
        let [batch, channels, _, _] = x.dims();
        x.mean_dim(3).mean_dim(2).reshape([batch, channels])
    }
}
