use burn::module::Module;
use burn::nn::{Dropout, DropoutConfig, LayerNorm, LayerNormConfig, Linear};
use burn::tensor::activation::{relu, tanh};
use burn::tensor::{backend::Backend, Tensor};
use transforms::resize_bilinear;

use crate::backbone::FeatureExtractor;
use crate::control::{check_parameters, head_linear, host_values, ControlConfig, ControlKind, ControlModule};
use crate::ModelResult;

pub const MIN_FACTOR: f32 = 1.0;
pub const MAX_FACTOR: f32 = 4.0;

/// Predicts one downscale factor in [1, 4] per image.
#[derive(Module, Debug)]
pub struct DownscaleNet<B: Backend> {
    extractor: FeatureExtractor<B>,
    fc1: Linear<B>,
    norm1: LayerNorm<B>,
    fc2: Linear<B>,
    norm2: LayerNorm<B>,
    fc3: Linear<B>,
    out: Linear<B>,
    dropout: Dropout,
    input_size: usize,
}

impl<B: Backend> DownscaleNet<B> {
    pub fn new(cfg: &ControlConfig, device: &B::Device) -> ModelResult<Self> {
        cfg.validate()?;
        let feat = cfg.backbone.feature_dim();
        Ok(Self {
            extractor: FeatureExtractor::new(&cfg.backbone, device),
            fc1: head_linear(feat, 256).init(device),
            norm1: LayerNormConfig::new(256).init(device),
            fc2: head_linear(256, 128).init(device),
            norm2: LayerNormConfig::new(128).init(device),
            fc3: head_linear(128, 64).init(device),
            out: head_linear(64, 1).init(device),
            dropout: DropoutConfig::new(cfg.dropout).init(),
            input_size: cfg.input_size,
        })
    }

    pub fn extractor(&self) -> &FeatureExtractor<B> {
        &self.extractor
    }

    pub fn with_extractor(mut self, extractor: FeatureExtractor<B>) -> Self {
        self.extractor = extractor.no_grad();
        self
    }
}

/// Maps unbounded head outputs onto [MIN_FACTOR, MAX_FACTOR].
pub fn factor_from_logits<B: Backend>(logits: Tensor<B, 2>) -> Tensor<B, 2> {
    tanh(logits)
        .add_scalar(1.0)
        .div_scalar(2.0)
        .mul_scalar(MAX_FACTOR - MIN_FACTOR)
        .add_scalar(MIN_FACTOR)
}

impl<B: Backend> ControlModule<B> for DownscaleNet<B> {
    fn kind(&self) -> ControlKind {
        ControlKind::Downscale
    }

    fn predict_parameters(&self, images: Tensor<B, 4>) -> ModelResult<Tensor<B, 2>> {
        let x = resize_bilinear(images, self.input_size, self.input_size)?;
        let x = self.extractor.forward(x);
        let x = self.dropout.forward(self.norm1.forward(relu(self.fc1.forward(x))));
        let x = self.dropout.forward(self.norm2.forward(relu(self.fc2.forward(x))));
        let x = self.dropout.forward(relu(self.fc3.forward(x)));
        Ok(factor_from_logits(self.out.forward(x)))
    }

    fn apply(&self, images: Tensor<B, 4>, params: Tensor<B, 2>) -> ModelResult<Tensor<B, 4>> {
        let [batch, _, height, width] = images.dims();
        check_parameters(&params, batch, 1)?;
        let factors = host_values(params.reshape([batch]))?;
        let mut out = Vec::with_capacity(batch);
        for (i, factor) in factors.into_iter().enumerate() {
            let factor = factor.clamp(MIN_FACTOR, MAX_FACTOR);
            let small_h = ((height as f32 / factor).floor() as usize).max(1);
            let small_w = ((width as f32 / factor).floor() as usize).max(1);
            let image = images.clone().narrow(0, i, 1);
            let small = resize_bilinear(image, small_h, small_w)?;
            out.push(resize_bilinear(small, height, width)?);
        }
        Ok(Tensor::cat(out, 0))
    }

    /// Mean inverse factor: 1 for untouched images, 0.25 at the strongest downscale.
    fn rate_proxy(&self, params: Tensor<B, 2>) -> Option<Tensor<B, 1>> {
        Some(params.recip().mean())
    }

    fn refreeze(mut self) -> Self {
        self.extractor = self.extractor.no_grad();
        self
    }
}
