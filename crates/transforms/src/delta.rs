//! DC delta coding along the block sequence.
//!
//! Within each `(batch, channel)` plane the DC coefficient (index 0) of every block
//! except the first is replaced by its difference from the previous block's DC.
//! AC coefficients pass through untouched.

use burn::tensor::{backend::Backend, Tensor};

pub fn delta_encode<B: Backend>(blocks: Tensor<B, 4>) -> Tensor<B, 4> {
    let [_, _, count, coeffs] = blocks.dims();
    let dc = blocks.clone().narrow(3, 0, 1);
    let dc = if count > 1 {
        let first = dc.clone().narrow(2, 0, 1);
        let diff = dc.clone().narrow(2, 1, count - 1) - dc.narrow(2, 0, count - 1);
        Tensor::cat(vec![first, diff], 2)
    } else {
        dc
    };
    with_dc(dc, blocks, coeffs)
}

pub fn delta_decode<B: Backend>(blocks: Tensor<B, 4>) -> Tensor<B, 4> {
    let [_, _, _, coeffs] = blocks.dims();
    let dc = prefix_sum(blocks.clone().narrow(3, 0, 1));
    with_dc(dc, blocks, coeffs)
}

fn with_dc<B: Backend>(dc: Tensor<B, 4>, blocks: Tensor<B, 4>, coeffs: usize) -> Tensor<B, 4> {
    if coeffs <= 1 {
        return dc;
    }
    let ac = blocks.narrow(3, 1, coeffs - 1);
    Tensor::cat(vec![dc, ac], 3)
}

/// Inclusive prefix sum over axis 2 by log-step doubling.
fn prefix_sum<B: Backend>(x: Tensor<B, 4>) -> Tensor<B, 4> {
    let count = x.dims()[2];
    let mut out = x;
    let mut shift = 1;
    while shift < count {
        let head = out.clone().narrow(2, 0, shift);
        let tail = out.clone().narrow(2, shift, count - shift) + out.narrow(2, 0, count - shift);
        out = Tensor::cat(vec![head, tail], 2);
        shift *= 2;
    }
    out
}
