//! Burn modules for bit-rate-aware detection training.
//!
//! - [`BitEstimator`]: frozen per-block code-length predictor over codec features.
//! - [`FeatureExtractor`]: frozen conv stack shared by the control networks.
//! - [`ControlModule`] with [`DownscaleNet`] and [`LuminanceBlurNet`]: trainable
//!   heads that choose per-image degradation parameters.
//! - [`DetectionModel`] with [`GridDetector`]: the detector trained on the
//!   degraded, codec round-tripped images.
//!
//! These are plain Burn modules; the `training` crate wires them into the joint loop.

pub mod backbone;
pub mod bit_estimator;
pub mod control;
pub mod detector;
pub mod downscale;
pub mod error;
pub mod grid_detector;
pub mod luminance;
pub mod weights;

pub use backbone::{FeatureExtractor, FeatureExtractorConfig};
pub use bit_estimator::{bits_per_pixel, BitEstimator, BitEstimatorConfig};
pub use control::{ControlConfig, ControlKind, ControlModule};
pub use detector::{
    iou, nms, Detection, DetectionLoss, DetectionModel, DetectionTargets, LossGains, TargetBox,
};
pub use downscale::DownscaleNet;
pub use error::{ModelError, ModelResult};
pub use grid_detector::{GridDetector, GridDetectorConfig, GridOutput, GRID_STRIDE};
pub use luminance::LuminanceBlurNet;
pub use weights::{load_weights, save_weights, weights_file, WeightRecorder};

pub mod prelude {
    pub use super::{
        BitEstimator, ControlKind, ControlModule, DetectionModel, DownscaleNet, GridDetector,
        LuminanceBlurNet,
    };
}
