//! JPEG full-range colour conversion at unit data range.

use burn::tensor::{backend::Backend, Tensor};

use crate::{TransformError, TransformResult};

/// Offset applied to Cb/Cr so neutral chroma sits at 128/255.
pub const CHROMA_OFFSET: f32 = 128.0 / 255.0;

const RGB_TO_YCBCR: [[f32; 3]; 3] = [
    [0.299, 0.587, 0.114],
    [-0.168_735_9, -0.331_264_1, 0.5],
    [0.5, -0.418_687_6, -0.081_312_4],
];

const YCBCR_TO_RGB: [[f32; 3]; 3] = [
    [1.0, 0.0, 1.402],
    [1.0, -0.344_136_3, -0.714_136_3],
    [1.0, 1.772, 0.0],
];

pub fn rgb_to_ycbcr<B: Backend>(rgb: Tensor<B, 4>) -> TransformResult<Tensor<B, 4>> {
    ensure_three_channels(&rgb)?;
    Ok(mix(rgb, &RGB_TO_YCBCR, [0.0; 3], [0.0, CHROMA_OFFSET, CHROMA_OFFSET]))
}

pub fn ycbcr_to_rgb<B: Backend>(ycbcr: Tensor<B, 4>) -> TransformResult<Tensor<B, 4>> {
    ensure_three_channels(&ycbcr)?;
    Ok(mix(
        ycbcr,
        &YCBCR_TO_RGB,
        [0.0, -CHROMA_OFFSET, -CHROMA_OFFSET],
        [0.0; 3],
    ))
}

pub(crate) fn ensure_three_channels<B: Backend>(x: &Tensor<B, 4>) -> TransformResult<()> {
    let channels = x.dims()[1];
    if channels != 3 {
        return Err(TransformError::ChannelMismatch {
            expected: 3,
            actual: channels,
        });
    }
    Ok(())
}

/// `out[row] = sum_k m[row][k] * (x[k] + pre[k]) + post[row]`
fn mix<B: Backend>(
    x: Tensor<B, 4>,
    m: &[[f32; 3]; 3],
    pre: [f32; 3],
    post: [f32; 3],
) -> Tensor<B, 4> {
    let planes: Vec<Tensor<B, 4>> = (0..3)
        .map(|k| x.clone().narrow(1, k, 1).add_scalar(pre[k]))
        .collect();
    let rows = m
        .iter()
        .zip(post)
        .map(|(coeffs, offset)| {
            planes[0].clone().mul_scalar(coeffs[0])
                + planes[1].clone().mul_scalar(coeffs[1])
                + planes[2].clone().mul_scalar(coeffs[2]).add_scalar(offset)
        })
        .collect();
    Tensor::cat(rows, 1)
}
