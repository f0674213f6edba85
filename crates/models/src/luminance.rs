use burn::module::Module;
use burn::nn::{BatchNorm, BatchNormConfig, Dropout, DropoutConfig, Linear};
use burn::tensor::activation::{relu, sigmoid};
use burn::tensor::{backend::Backend, Tensor};
use transforms::{blur_kernel_size, gaussian_blur, reinhard_tone_map, resize_bilinear};

use crate::backbone::FeatureExtractor;
use crate::control::{check_parameters, head_linear, host_values, ControlConfig, ControlKind, ControlModule};
use crate::ModelResult;

/// Hard bounds applied to both weights before they touch the image.
pub const WEIGHT_CLAMP: (f32, f32) = (0.0, 5.0);

/// Linear, batch norm, ReLU.
#[derive(Module, Debug)]
pub struct NormBlock<B: Backend> {
    linear: Linear<B>,
    norm: BatchNorm<B, 1>,
}

impl<B: Backend> NormBlock<B> {
    fn new(d_in: usize, d_out: usize, device: &B::Device) -> Self {
        Self {
            linear: head_linear(d_in, d_out).init(device),
            norm: BatchNormConfig::new(d_out).init(device),
        }
    }

    fn forward(&self, x: Tensor<B, 2>) -> Tensor<B, 2> {
        let x = self.linear.forward(x);
        let [n, c] = x.dims();
        relu(self.norm.forward(x.reshape([n, c, 1])).reshape([n, c]))
    }
}

/// Predicts a tone-mapping white point and a blur sigma per image, both in [0.5, 1].
#[derive(Module, Debug)]
pub struct LuminanceBlurNet<B: Backend> {
    extractor: FeatureExtractor<B>,
    blocks: Vec<NormBlock<B>>,
    out: Linear<B>,
    dropout: Dropout,
    input_size: usize,
}

impl<B: Backend> LuminanceBlurNet<B> {
    pub fn new(cfg: &ControlConfig, device: &B::Device) -> ModelResult<Self> {
        cfg.validate()?;
        let widths = [cfg.backbone.feature_dim(), 512, 128, 64];
        let blocks = widths
            .windows(2)
            .map(|w| NormBlock::new(w[0], w[1], device))
            .collect();
        Ok(Self {
            extractor: FeatureExtractor::new(&cfg.backbone, device),
            blocks,
            out: head_linear(64, 2).init(device),
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

pub fn weights_from_logits<B: Backend>(logits: Tensor<B, 2>) -> Tensor<B, 2> {
    sigmoid(logits).mul_scalar(0.5).add_scalar(0.5)
}

impl<B: Backend> ControlModule<B> for LuminanceBlurNet<B> {
    fn kind(&self) -> ControlKind {
        ControlKind::LuminanceBlur
    }

    fn predict_parameters(&self, images: Tensor<B, 4>) -> ModelResult<Tensor<B, 2>> {
        let x = resize_bilinear(images, self.input_size, self.input_size)?;
        let mut x = self.extractor.forward(x);
        for block in &self.blocks {
            x = self.dropout.forward(block.forward(x));
        }
        Ok(weights_from_logits(self.out.forward(x)))
    }

    /// Column 0 is the white point, column 1 the blur sigma.
    fn apply(&self, images: Tensor<B, 4>, params: Tensor<B, 2>) -> ModelResult<Tensor<B, 4>> {
        let [batch, _, _, _] = images.dims();
        check_parameters(&params, batch, 2)?;
        let params = params.clamp(WEIGHT_CLAMP.0, WEIGHT_CLAMP.1);
        let white = params.clone().narrow(1, 0, 1).reshape([batch]);
        let sigma = params.narrow(1, 1, 1).reshape([batch]);
        let toned = reinhard_tone_map(images, white)?;

        let sizes = host_values(sigma.clone())?;
        let mut out = Vec::with_capacity(batch);
        for (i, s) in sizes.into_iter().enumerate() {
            out.push(gaussian_blur(
                toned.clone().narrow(0, i, 1),
                sigma.clone().narrow(0, i, 1),
                blur_kernel_size(s),
            ));
        }
        Ok(Tensor::cat(out, 0))
    }

    fn refreeze(mut self) -> Self {
        self.extractor = self.extractor.no_grad();
        self
    }
}
