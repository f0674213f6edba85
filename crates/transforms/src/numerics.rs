//! Stabilising constants used at every division/log site.
//!
//! These are applied silently: a zero-luminance pixel or a zero blur sigma never
//! raises, it produces a finite (possibly degenerate) value instead. Tests in
//! [`crate::filters`] pin that behaviour down.

/// Added to luminance and to the tone-mapping white point before dividing.
pub const LUMA_EPS: f32 = 1e-6;

/// Added to `2 * sigma^2` when building a Gaussian kernel.
pub const SIGMA_EPS: f32 = 1e-6;

/// Probability clamp for binary cross-entropy terms.
pub const BCE_EPS: f32 = 1e-6;

/// `ln(2)`, used to turn natural logs into bit counts.
pub const LN_2: f32 = std::f32::consts::LN_2;
