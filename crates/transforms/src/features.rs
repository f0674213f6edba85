//! Bit-estimator input features built from quantized DCT tiles.

use burn::tensor::{backend::Backend, Tensor};

use crate::blocks::COEFFS_PER_BLOCK;
use crate::delta::delta_encode;
use crate::numerics::LN_2;
use crate::zigzag::zigzag;

/// `log2(|x| + 1)`; the argument is never below one so no epsilon is needed.
pub fn log_magnitude<B: Backend, const D: usize>(x: Tensor<B, D>) -> Tensor<B, D> {
    x.abs().add_scalar(1.0).log().div_scalar(LN_2)
}

/// Quantized coefficient tiles `[B, C, N, 64]` (row-major within a tile) to the
/// estimator input `[B * C * N, 64]`: DC delta, zigzag order, log magnitude.
pub fn estimator_features<B: Backend>(quantized: Tensor<B, 4>) -> Tensor<B, 2> {
    let [batch, channels, count, _] = quantized.dims();
    let scanned = zigzag(delta_encode(quantized));
    log_magnitude(scanned).reshape([batch * channels * count, COEFFS_PER_BLOCK])
}
