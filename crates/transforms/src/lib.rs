//! Differentiable image transforms for bit-rate-aware detection training.
//!
//! Everything here is a pure tensor function over a burn [`Backend`](burn::tensor::backend::Backend),
//! so gradients flow from the bit-rate surrogate and the detector back into whatever
//! produced the input image (tone-mapping weights, blur sigma, ...).
//!
//! Layers, leaf to root:
//! - [`color`]: RGB <-> YCbCr (JPEG full range).
//! - [`blocks`]: 8x8 tiling (`[B, C, H, W]` <-> `[B, C, N, 64]`).
//! - [`dct`]: orthonormal 8x8 DCT-II on flattened tiles.
//! - [`quant`]: IJG quantization tables and straight-through rounding.
//! - [`delta`], [`zigzag`], [`features`]: the feature layout the bit estimator expects.
//! - [`codec`]: the full quantize/dequantize round trip.
//! - [`filters`]: tone mapping, Gaussian blur, bilinear resize.
//!
//! Shapes that are not block-aligned are rejected with [`TransformError::NotBlockAligned`]
//! unless the caller pads explicitly via [`blocks::pad_to_block`].

pub mod blocks;
pub mod codec;
pub mod color;
pub mod dct;
pub mod delta;
pub mod error;
pub mod features;
pub mod filters;
pub mod numerics;
pub mod quant;
pub mod zigzag;

pub use blocks::{blockify, deblockify, pad_to_block, BLOCK_SIZE, COEFFS_PER_BLOCK};
pub use codec::{CodecOutput, CodecSurrogate};
pub use color::{rgb_to_ycbcr, ycbcr_to_rgb};
pub use dct::Dct8;
pub use delta::{delta_decode, delta_encode};
pub use error::{TransformError, TransformResult};
pub use features::{estimator_features, log_magnitude};
pub use filters::{blur_kernel_size, gaussian_blur, reinhard_tone_map, resize_bilinear};
pub use quant::{round_ste, QuantTables};
pub use zigzag::{unzigzag, zigzag, ZIGZAG};
