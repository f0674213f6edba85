//! Parameterised image degradations applied by the control networks.

use burn::tensor::module::conv2d;
use burn::tensor::ops::ConvOptions;
use burn::tensor::{backend::Backend, Tensor, TensorData};

use crate::color::ensure_three_channels;
use crate::numerics::{LUMA_EPS, SIGMA_EPS};
use crate::{TransformError, TransformResult};

/// Reinhard tone mapping with a per-image white point `white: [B]`.
///
/// `lum = .2126 R + .7152 G + .0722 B`, `ldr = lum / (1 + lum / white)`,
/// output `img * ldr / lum`. Both divisions carry [`LUMA_EPS`], so black pixels map
/// to black instead of NaN.
pub fn reinhard_tone_map<B: Backend>(
    img: Tensor<B, 4>,
    white: Tensor<B, 1>,
) -> TransformResult<Tensor<B, 4>> {
    ensure_three_channels(&img)?;
    let [batch, _, _, _] = img.dims();
    let [count] = white.dims();
    if count != batch {
        return Err(TransformError::ParameterMismatch {
            expected: batch,
            actual: count,
        });
    }
    let lum = img.clone().narrow(1, 0, 1).mul_scalar(0.2126)
        + img.clone().narrow(1, 1, 1).mul_scalar(0.7152)
        + img.clone().narrow(1, 2, 1).mul_scalar(0.0722);
    let white = white.reshape([batch, 1, 1, 1]).add_scalar(LUMA_EPS);
    let ldr = lum.clone() / (lum.clone() / white).add_scalar(1.0);
    let scale = ldr / lum.add_scalar(LUMA_EPS);
    Ok(img * scale)
}

/// Kernel size used for a given blur weight.
pub fn blur_kernel_size(sigma: f32) -> usize {
    if sigma >= 0.8 {
        5
    } else {
        3
    }
}

/// Normalised `size x size` Gaussian built from a `[1]` sigma tensor, so the
/// kernel (and everything blurred with it) is differentiable in sigma.
pub fn gaussian_kernel<B: Backend>(sigma: Tensor<B, 1>, size: usize) -> Tensor<B, 2> {
    let device = sigma.device();
    let radius = (size / 2) as f32;
    let mut sq = Vec::with_capacity(size * size);
    for y in 0..size {
        for x in 0..size {
            let dy = y as f32 - radius;
            let dx = x as f32 - radius;
            sq.push(dx * dx + dy * dy);
        }
    }
    let sq = Tensor::<B, 2>::from_data(TensorData::new(sq, [size, size]), &device);
    let sigma = sigma.reshape([1, 1]);
    let two_var = (sigma.clone() * sigma).mul_scalar(2.0).add_scalar(SIGMA_EPS);
    let kernel = (sq.neg() / two_var).exp();
    let total = kernel.clone().sum().reshape([1, 1]);
    kernel / total
}

/// Depthwise Gaussian blur with `padding = size / 2` (output keeps the input size).
pub fn gaussian_blur<B: Backend>(img: Tensor<B, 4>, sigma: Tensor<B, 1>, size: usize) -> Tensor<B, 4> {
    let [_, channels, _, _] = img.dims();
    let pad = size / 2;
    let kernel = gaussian_kernel(sigma, size).reshape([1, 1, size, size]);
    let weight = Tensor::cat(vec![kernel; channels], 0);
    conv2d(
        img,
        weight,
        None,
        ConvOptions::new([1, 1], [pad, pad], [1, 1], channels),
    )
}

/// Bilinear resize with half-pixel centres (no antialiasing), written as two
/// matmuls so it stays differentiable with respect to the image.
pub fn resize_bilinear<B: Backend>(
    img: Tensor<B, 4>,
    out_h: usize,
    out_w: usize,
) -> TransformResult<Tensor<B, 4>> {
    if out_h == 0 || out_w == 0 {
        return Err(TransformError::EmptyResize {
            height: out_h,
            width: out_w,
        });
    }
    let [batch, channels, height, width] = img.dims();
    if height == out_h && width == out_w {
        return Ok(img);
    }
    let device = img.device();
    let cols = interp_matrix::<B>(out_w, width, &device).transpose();
    let rows = interp_matrix::<B>(out_h, height, &device).transpose();

    let x = img
        .reshape([batch * channels * height, width])
        .matmul(cols)
        .reshape([batch, channels, height, out_w])
        .swap_dims(2, 3)
        .reshape([batch * channels * out_w, height])
        .matmul(rows)
        .reshape([batch, channels, out_w, out_h])
        .swap_dims(2, 3);
    Ok(x)
}

/// `[out, inp]` interpolation weights.
fn interp_matrix<B: Backend>(out: usize, inp: usize, device: &B::Device) -> Tensor<B, 2> {
    let mut m = vec![0.0f32; out * inp];
    let ratio = inp as f32 / out as f32;
    for o in 0..out {
        let src = ((o as f32 + 0.5) * ratio - 0.5).max(0.0);
        let i0 = (src.floor() as usize).min(inp - 1);
        let i1 = (i0 + 1).min(inp - 1);
        let w1 = src - i0 as f32;
        m[o * inp + i0] += 1.0 - w1;
        m[o * inp + i1] += w1;
    }
    Tensor::from_data(TensorData::new(m, [out, inp]), device)
}

#[cfg(test)]
mod tests {
    use super::*;
    use burn::backend::{Autodiff, NdArray};
    use burn::tensor::Distribution;

    type TestBackend = NdArray<f32>;

    #[test]
    fn tone_map_keeps_black_finite() {
        let device = Default::default();
        let img = Tensor::<TestBackend, 4>::zeros([2, 3, 8, 8], &device);
        let white = Tensor::<TestBackend, 1>::from_floats([0.5, 0.0], &device);
        let out = reinhard_tone_map(img, white).unwrap();
        let values = out.into_data().to_vec::<f32>().unwrap();
        assert!(values.iter().all(|v| v.is_finite() && *v == 0.0));
    }

    #[test]
    fn tone_map_compresses_highlights() {
        let device = Default::default();
        let img = Tensor::<TestBackend, 4>::full([1, 3, 1, 1], 1.0, &device);
        let white = Tensor::<TestBackend, 1>::from_floats([1.0], &device);
        let out = reinhard_tone_map(img, white).unwrap();
        let values = out.into_data().to_vec::<f32>().unwrap();
        // lum = 1, ldr = 1 / (1 + 1) = 0.5
        for v in values {
            assert!((v - 0.5).abs() < 1e-4);
        }
    }

    #[test]
    fn tone_map_rejects_wrong_weight_count() {
        let device = Default::default();
        let img = Tensor::<TestBackend, 4>::zeros([2, 3, 8, 8], &device);
        let white = Tensor::<TestBackend, 1>::from_floats([0.5], &device);
        assert!(matches!(
            reinhard_tone_map(img, white),
            Err(TransformError::ParameterMismatch { expected: 2, actual: 1 })
        ));
    }

    #[test]
    fn kernel_is_normalised_and_survives_zero_sigma() {
        let device = Default::default();
        for sigma in [0.0f32, 0.5, 1.0] {
            let s = Tensor::<TestBackend, 1>::from_floats([sigma], &device);
            let k = gaussian_kernel(s, 5).into_data().to_vec::<f32>().unwrap();
            assert!(k.iter().all(|v| v.is_finite()));
            assert!((k.iter().sum::<f32>() - 1.0).abs() < 1e-5);
            // centre tap is the largest
            assert!(k.iter().all(|v| *v <= k[12] + 1e-7));
        }
    }

    #[test]
    fn blur_preserves_constant_interior_and_shape() {
        let device = Default::default();
        let img = Tensor::<TestBackend, 4>::full([1, 3, 16, 16], 0.25, &device);
        let sigma = Tensor::<TestBackend, 1>::from_floats([0.9], &device);
        let out = gaussian_blur(img, sigma, blur_kernel_size(0.9));
        assert_eq!(out.dims(), [1, 3, 16, 16]);
        let v = out.into_data().to_vec::<f32>().unwrap();
        // interior pixel (8, 8) of channel 0
        assert!((v[8 * 16 + 8] - 0.25).abs() < 1e-5);
    }

    #[test]
    fn blur_is_differentiable_in_sigma() {
        type AD = Autodiff<NdArray<f32>>;
        let device = Default::default();
        let img = Tensor::<AD, 4>::random([1, 3, 8, 8], Distribution::Uniform(0.0, 1.0), &device);
        let sigma = Tensor::<AD, 1>::from_floats([0.7], &device).require_grad();
        let loss = gaussian_blur(img, sigma.clone(), 3).powf_scalar(2.0).sum();
        let grads = loss.backward();
        let g = sigma.grad(&grads).unwrap().into_data().to_vec::<f32>().unwrap();
        assert!(g[0].is_finite() && g[0] != 0.0);
    }

    #[test]
    fn kernel_size_switches_at_point_eight() {
        assert_eq!(blur_kernel_size(0.79), 3);
        assert_eq!(blur_kernel_size(0.8), 5);
    }

    #[test]
    fn resize_down_then_up_keeps_shape_and_constants() {
        let device = Default::default();
        let img = Tensor::<TestBackend, 4>::full([2, 3, 32, 24], 0.6, &device);
        let small = resize_bilinear(img, 13, 9).unwrap();
        assert_eq!(small.dims(), [2, 3, 13, 9]);
        let back = resize_bilinear(small, 32, 24).unwrap();
        assert_eq!(back.dims(), [2, 3, 32, 24]);
        for v in back.into_data().to_vec::<f32>().unwrap() {
            assert!((v - 0.6).abs() < 1e-5);
        }
    }

    #[test]
    fn resize_halving_averages_pairs() {
        let device = Default::default();
        let img = Tensor::<TestBackend, 4>::from_data(
            TensorData::new(vec![0.0f32, 1.0, 2.0, 3.0], [1, 1, 1, 4]),
            &device,
        );
        let out = resize_bilinear(img, 1, 2).unwrap().into_data().to_vec::<f32>().unwrap();
        assert!((out[0] - 0.5).abs() < 1e-6);
        assert!((out[1] - 2.5).abs() < 1e-6);
    }
}
