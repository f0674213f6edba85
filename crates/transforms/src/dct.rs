//! Orthonormal 8x8 DCT-II.
//!
//! A 2-D DCT on a row-major flattened tile is a single 64x64 matrix (the Kronecker
//! product of the 1-D basis with itself), so the transform is one matmul on
//! `[B * C * N, 64]` and is differentiable for free.

use burn::tensor::{backend::Backend, Tensor, TensorData};

use crate::blocks::{BLOCK_SIZE, COEFFS_PER_BLOCK};

#[derive(Debug, Clone)]
pub struct Dct8<B: Backend> {
    /// `K^T`, applied on the right of row vectors.
    forward: Tensor<B, 2>,
    /// `K`, the inverse of `K^T` since `K` is orthonormal.
    inverse: Tensor<B, 2>,
}

impl<B: Backend> Dct8<B> {
    pub fn new(device: &B::Device) -> Self {
        let kron = kronecker_basis();
        let inverse =
            Tensor::<B, 2>::from_data(TensorData::new(kron, [COEFFS_PER_BLOCK, COEFFS_PER_BLOCK]), device);
        let forward = inverse.clone().transpose();
        Self { forward, inverse }
    }

    /// Spatial tiles `[B, C, N, 64]` to coefficients of the same shape.
    pub fn forward(&self, blocks: Tensor<B, 4>) -> Tensor<B, 4> {
        apply(blocks, self.forward.clone())
    }

    /// Coefficients `[B, C, N, 64]` back to spatial tiles.
    pub fn inverse(&self, coeffs: Tensor<B, 4>) -> Tensor<B, 4> {
        apply(coeffs, self.inverse.clone())
    }
}

fn apply<B: Backend>(x: Tensor<B, 4>, matrix: Tensor<B, 2>) -> Tensor<B, 4> {
    let [batch, channels, count, coeffs] = x.dims();
    x.reshape([batch * channels * count, coeffs])
        .matmul(matrix)
        .reshape([batch, channels, count, coeffs])
}

/// 1-D basis `D[u][i] = a(u) cos((2i + 1) u pi / 16)`.
pub fn dct_basis() -> [[f32; BLOCK_SIZE]; BLOCK_SIZE] {
    let n = BLOCK_SIZE as f64;
    let mut basis = [[0.0f32; BLOCK_SIZE]; BLOCK_SIZE];
    for (u, row) in basis.iter_mut().enumerate() {
        let alpha = if u == 0 { (1.0 / n).sqrt() } else { (2.0 / n).sqrt() };
        for (i, value) in row.iter_mut().enumerate() {
            let angle = (2.0 * i as f64 + 1.0) * u as f64 * std::f64::consts::PI / (2.0 * n);
            *value = (alpha * angle.cos()) as f32;
        }
    }
    basis
}

fn kronecker_basis() -> Vec<f32> {
    let d = dct_basis();
    let mut k = vec![0.0f32; COEFFS_PER_BLOCK * COEFFS_PER_BLOCK];
    for u in 0..BLOCK_SIZE {
        for v in 0..BLOCK_SIZE {
            let row = u * BLOCK_SIZE + v;
            for i in 0..BLOCK_SIZE {
                for j in 0..BLOCK_SIZE {
                    let col = i * BLOCK_SIZE + j;
                    k[row * COEFFS_PER_BLOCK + col] = d[u][i] * d[v][j];
                }
            }
        }
    }
    k
}
