//! Conventional JPEG zigzag scan.

use burn::tensor::{backend::Backend, Int, Tensor, TensorData};

use crate::blocks::COEFFS_PER_BLOCK;

/// `ZIGZAG[k]` is the row-major index of the k-th coefficient in scan order.
pub const ZIGZAG: [usize; 64] = [
    0, 1, 8, 16, 9, 2, 3, 10, //
    17, 24, 32, 25, 18, 11, 4, 5, //
    12, 19, 26, 33, 40, 48, 41, 34, //
    27, 20, 13, 6, 7, 14, 21, 28, //
    35, 42, 49, 56, 57, 50, 43, 36, //
    29, 22, 15, 23, 30, 37, 44, 51, //
    58, 59, 52, 45, 38, 31, 39, 46, //
    53, 60, 61, 54, 47, 55, 62, 63,
];

/// Maps a row-major index to its scan position.
pub fn inverse_zigzag() -> [usize; 64] {
    let mut inv = [0usize; 64];
    for (pos, &natural) in ZIGZAG.iter().enumerate() {
        inv[natural] = pos;
    }
    inv
}

/// Reorders the last axis of `[B, C, N, 64]` from row-major to scan order.
pub fn zigzag<B: Backend>(blocks: Tensor<B, 4>) -> Tensor<B, 4> {
    let device = blocks.device();
    blocks.select(3, index_tensor::<B>(&ZIGZAG, &device))
}

/// Inverse of [`zigzag`].
pub fn unzigzag<B: Backend>(blocks: Tensor<B, 4>) -> Tensor<B, 4> {
    let device = blocks.device();
    blocks.select(3, index_tensor::<B>(&inverse_zigzag(), &device))
}

fn index_tensor<B: Backend>(order: &[usize; 64], device: &B::Device) -> Tensor<B, 1, Int> {
    let values: Vec<i64> = order.iter().map(|&i| i as i64).collect();
    Tensor::from_data(TensorData::new(values, [COEFFS_PER_BLOCK]), device)
}
