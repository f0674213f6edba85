//! Differentiable JPEG round trip at a fixed quality.
//!
//! Forward: RGB -> YCbCr -> `x * 255 - 128` -> 8x8 DCT -> divide by the IJG table ->
//! straight-through round. Backward half: multiply by the table -> IDCT -> `(x + 128) / 255`
//! -> RGB -> clamp to [0, 1]. No chroma subsampling.

use burn::tensor::{backend::Backend, Tensor};

use crate::blocks::{self, blockify, deblockify, ensure_block_aligned, pad_to_block};
use crate::color::{rgb_to_ycbcr, ycbcr_to_rgb};
use crate::dct::Dct8;
use crate::features::estimator_features;
use crate::quant::{round_ste, QuantTables};
use crate::TransformResult;

const PIXEL_SCALE: f32 = 255.0;
const LEVEL_SHIFT: f32 = 128.0;

#[derive(Debug, Clone)]
pub struct CodecOutput<B: Backend> {
    /// Dequantized image `[B, 3, H, W]` in [0, 1], cropped back to the input size.
    pub reconstructed: Tensor<B, 4>,
    /// Quantized coefficients `[B, 3, N, 64]`, row-major within each tile.
    pub coefficients: Tensor<B, 4>,
    /// Estimator input `[B * 3 * N, 64]`.
    pub features: Tensor<B, 2>,
    /// Size of the coded (possibly padded) planes.
    pub coded_size: (usize, usize),
}

impl<B: Backend> CodecOutput<B> {
    /// `C * H * W` of the coded planes, the bpp normaliser.
    pub fn coded_elements(&self) -> usize {
        let [_, channels, _, _] = self.coefficients.dims();
        channels * self.coded_size.0 * self.coded_size.1
    }

    pub fn batch_size(&self) -> usize {
        self.coefficients.dims()[0]
    }
}

#[derive(Debug, Clone)]
pub struct CodecSurrogate<B: Backend> {
    tables: QuantTables,
    table: Tensor<B, 4>,
    dct: Dct8<B>,
    pad_to_block: bool,
}

impl<B: Backend> CodecSurrogate<B> {
    pub fn new(quality: u32, device: &B::Device) -> TransformResult<Self> {
        let tables = QuantTables::for_quality(quality)?;
        Ok(Self {
            table: tables.to_tensor(device),
            tables,
            dct: Dct8::new(device),
            pad_to_block: false,
        })
    }

    /// Replicate-pad misaligned inputs instead of rejecting them.
    pub fn with_padding(mut self, pad_to_block: bool) -> Self {
        self.pad_to_block = pad_to_block;
        self
    }

    pub fn quality(&self) -> u32 {
        self.tables.quality()
    }

    pub fn tables(&self) -> &QuantTables {
        &self.tables
    }

    /// RGB `[B, 3, H, W]` to quantized coefficient tiles plus the coded size.
    pub fn compress(&self, rgb: Tensor<B, 4>) -> TransformResult<(Tensor<B, 4>, (usize, usize))> {
        let rgb = if self.pad_to_block {
            pad_to_block(rgb).0
        } else {
            rgb
        };
        let [_, _, height, width] = rgb.dims();
        ensure_block_aligned(height, width)?;
        let shifted = rgb_to_ycbcr(rgb)?
            .mul_scalar(PIXEL_SCALE)
            .sub_scalar(LEVEL_SHIFT);
        let coeffs = self.dct.forward(blockify(shifted)?);
        let quantized = round_ste(coeffs / self.table.clone());
        Ok((quantized, (height, width)))
    }

    /// Quantized tiles back to an RGB image of `coded_size`, clamped to [0, 1].
    pub fn decompress(
        &self,
        quantized: Tensor<B, 4>,
        coded_size: (usize, usize),
    ) -> TransformResult<Tensor<B, 4>> {
        let spatial = self.dct.inverse(quantized * self.table.clone());
        let ycbcr = deblockify(spatial, coded_size)?
            .add_scalar(LEVEL_SHIFT)
            .div_scalar(PIXEL_SCALE);
        Ok(ycbcr_to_rgb(ycbcr)?.clamp(0.0, 1.0))
    }

    pub fn round_trip(&self, rgb: Tensor<B, 4>) -> TransformResult<CodecOutput<B>> {
        let [_, _, height, width] = rgb.dims();
        let (coefficients, coded_size) = self.compress(rgb)?;
        let reconstructed = blocks::crop(
            self.decompress(coefficients.clone(), coded_size)?,
            (height, width),
        );
        let features = estimator_features(coefficients.clone());
        Ok(CodecOutput {
            reconstructed,
            coefficients,
            features,
            coded_size,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::TransformError;
    use burn::backend::{Autodiff, NdArray};
    use burn::tensor::Distribution;

    type TestBackend = NdArray<f32>;

    fn smooth_image(device: &<TestBackend as Backend>::Device) -> Tensor<TestBackend, 4> {
        let ramp = Tensor::<TestBackend, 1, burn::tensor::Int>::arange(0..16, device)
            .float()
            .div_scalar(16.0)
            .reshape([1, 1, 1, 16]);
        let row = Tensor::cat(
            vec![ramp.clone(), ramp.clone().mul_scalar(0.5), ramp.neg().add_scalar(1.0)],
            1,
        );
        Tensor::cat(vec![row; 16], 2)
    }

    #[test]
    fn high_quality_round_trip_is_close() {
        let device = Default::default();
        let codec = CodecSurrogate::<TestBackend>::new(95, &device).unwrap();
        let img = smooth_image(&device);
        let out = codec.round_trip(img.clone()).unwrap();
        assert_eq!(out.reconstructed.dims(), [1, 3, 16, 16]);
        assert_eq!(out.coefficients.dims(), [1, 3, 4, 64]);
        assert_eq!(out.features.dims(), [12, 64]);
        assert_eq!(out.coded_elements(), 3 * 16 * 16);
        let a = img.into_data().to_vec::<f32>().unwrap();
        let b = out.reconstructed.into_data().to_vec::<f32>().unwrap();
        let mae = a.iter().zip(b.iter()).map(|(p, q)| (p - q).abs()).sum::<f32>() / a.len() as f32;
        assert!(mae < 0.02, "mae {mae}");
    }

    #[test]
    fn coefficients_are_integers() {
        let device = Default::default();
        let codec = CodecSurrogate::<TestBackend>::new(80, &device).unwrap();
        let img = Tensor::<TestBackend, 4>::random([2, 3, 8, 16], Distribution::Uniform(0.0, 1.0), &device);
        let out = codec.round_trip(img).unwrap();
        for v in out.coefficients.into_data().to_vec::<f32>().unwrap() {
            assert_eq!(v, v.round());
        }
    }

    #[test]
    fn lower_quality_zeroes_more_coefficients() {
        let device = Default::default();
        let img = Tensor::<TestBackend, 4>::random([1, 3, 16, 16], Distribution::Uniform(0.0, 1.0), &device);
        let zeros = |q: u32| {
            CodecSurrogate::<TestBackend>::new(q, &device)
                .unwrap()
                .round_trip(img.clone())
                .unwrap()
                .coefficients
                .into_data()
                .to_vec::<f32>()
                .unwrap()
                .iter()
                .filter(|v| **v == 0.0)
                .count()
        };
        assert!(zeros(10) > zeros(90));
    }

    #[test]
    fn misaligned_input_needs_explicit_padding() {
        let device = Default::default();
        let img = Tensor::<TestBackend, 4>::full([1, 3, 12, 20], 0.5, &device);
        let codec = CodecSurrogate::<TestBackend>::new(80, &device).unwrap();
        assert!(matches!(
            codec.round_trip(img.clone()),
            Err(TransformError::NotBlockAligned { height: 12, width: 20, .. })
        ));
        let out = codec.with_padding(true).round_trip(img).unwrap();
        assert_eq!(out.coded_size, (16, 24));
        assert_eq!(out.reconstructed.dims(), [1, 3, 12, 20]);
    }

    #[test]
    fn gradients_reach_the_input() {
        type AD = Autodiff<NdArray<f32>>;
        let device = Default::default();
        let codec = CodecSurrogate::<AD>::new(80, &device).unwrap();
        let img = Tensor::<AD, 4>::random([1, 3, 8, 8], Distribution::Uniform(0.2, 0.8), &device)
            .require_grad();
        let out = codec.round_trip(img.clone()).unwrap();
        let loss = out.features.sum() + out.reconstructed.sum();
        let grads = loss.backward();
        let g = img.grad(&grads).unwrap().into_data().to_vec::<f32>().unwrap();
        assert!(g.iter().all(|v| v.is_finite()));
        assert!(g.iter().any(|v| *v != 0.0));
    }
}
