//! IJG quantization tables and a straight-through rounding operator.

use burn::tensor::{backend::Backend, Tensor, TensorData};

use crate::blocks::COEFFS_PER_BLOCK;
use crate::{TransformError, TransformResult};

/// Annex K luminance table, natural (row-major) order.
pub const LUMA_BASE: [u16; 64] = [
    16, 11, 10, 16, 24, 40, 51, 61, //
    12, 12, 14, 19, 26, 58, 60, 55, //
    14, 13, 16, 24, 40, 57, 69, 56, //
    14, 17, 22, 29, 51, 87, 80, 62, //
    18, 22, 37, 56, 68, 109, 103, 77, //
    24, 35, 55, 64, 81, 104, 113, 92, //
    49, 64, 78, 87, 103, 121, 120, 101, //
    72, 92, 95, 98, 112, 100, 103, 99,
];

/// Annex K chrominance table, natural (row-major) order.
pub const CHROMA_BASE: [u16; 64] = [
    17, 18, 24, 47, 99, 99, 99, 99, //
    18, 21, 26, 66, 99, 99, 99, 99, //
    24, 26, 56, 99, 99, 99, 99, 99, //
    47, 66, 99, 99, 99, 99, 99, 99, //
    99, 99, 99, 99, 99, 99, 99, 99, //
    99, 99, 99, 99, 99, 99, 99, 99, //
    99, 99, 99, 99, 99, 99, 99, 99, //
    99, 99, 99, 99, 99, 99, 99, 99,
];

/// Quality-scaled luma/chroma step sizes.
///
/// Channel 0 (Y) always uses the luma table, channels 1 and 2 (Cb, Cr) the chroma
/// table; [`QuantTables::to_tensor`] lays them out in that order.
#[derive(Debug, Clone, PartialEq)]
pub struct QuantTables {
    quality: u32,
    luma: [f32; 64],
    chroma: [f32; 64],
}

impl QuantTables {
    pub fn for_quality(quality: u32) -> TransformResult<Self> {
        if !(1..=100).contains(&quality) {
            return Err(TransformError::InvalidQuality(quality));
        }
        Ok(Self {
            quality,
            luma: scale_table(&LUMA_BASE, quality),
            chroma: scale_table(&CHROMA_BASE, quality),
        })
    }

    pub fn quality(&self) -> u32 {
        self.quality
    }

    pub fn luma(&self) -> &[f32; 64] {
        &self.luma
    }

    pub fn chroma(&self) -> &[f32; 64] {
        &self.chroma
    }

    /// `[1, 3, 1, 64]`, broadcastable against `[B, 3, N, 64]` coefficient tiles.
    pub fn to_tensor<B: Backend>(&self, device: &B::Device) -> Tensor<B, 4> {
        let mut values = Vec::with_capacity(3 * COEFFS_PER_BLOCK);
        values.extend_from_slice(&self.luma);
        values.extend_from_slice(&self.chroma);
        values.extend_from_slice(&self.chroma);
        Tensor::from_data(TensorData::new(values, [1, 3, 1, COEFFS_PER_BLOCK]), device)
    }
}

/// IJG `jpeg_quality_scaling` followed by baseline clamping to `1..=255`.
pub fn scale_table(base: &[u16; 64], quality: u32) -> [f32; 64] {
    let quality = quality.clamp(1, 100);
    let scale = if quality < 50 {
        5000 / quality
    } else {
        200 - quality * 2
    };
    let mut out = [0.0f32; 64];
    for (dst, &b) in out.iter_mut().zip(base.iter()) {
        let v = (u32::from(b) * scale + 50) / 100;
        *dst = v.clamp(1, 255) as f32;
    }
    out
}

/// Rounds in the forward pass, identity in the backward pass.
pub fn round_ste<B: Backend, const D: usize>(x: Tensor<B, D>) -> Tensor<B, D> {
    let residual = (x.clone().round() - x.clone()).detach();
    x + residual
}
