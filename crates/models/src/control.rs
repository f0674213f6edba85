//! Control networks: small trainable heads over a frozen extractor that pick
//! per-image degradation parameters.

use burn::module::Module;
use burn::nn::{Initializer, LinearConfig};
use burn::tensor::{backend::Backend, Tensor};
use serde::{Deserialize, Serialize};

use crate::backbone::FeatureExtractorConfig;
use crate::{ModelError, ModelResult};

/// Which control network a run trains.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ControlKind {
    Downscale,
    LuminanceBlur,
}

impl ControlKind {
    pub fn num_parameters(self) -> usize {
        match self {
            ControlKind::Downscale => 1,
            ControlKind::LuminanceBlur => 2,
        }
    }

    /// `(rate_weight, detection_weight)` used when the config leaves them unset.
    pub fn default_loss_weights(self) -> (f32, f32) {
        match self {
            ControlKind::Downscale => (40.0, 1.0),
            ControlKind::LuminanceBlur => (1.0, 8.0),
        }
    }

    pub fn default_learning_rate(self) -> f64 {
        match self {
            ControlKind::Downscale => 1e-3,
            ControlKind::LuminanceBlur => 1e-5,
        }
    }
}

impl std::fmt::Display for ControlKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ControlKind::Downscale => write!(f, "downscale"),
            ControlKind::LuminanceBlur => write!(f, "luminance_blur"),
        }
    }
}

impl std::str::FromStr for ControlKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "downscale" => Ok(ControlKind::Downscale),
            "luminance_blur" | "luminance" => Ok(ControlKind::LuminanceBlur),
            other => Err(format!("unknown control variant '{other}'")),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ControlConfig {
    /// Square size images are resampled to before the extractor.
    pub input_size: usize,
    pub dropout: f64,
    pub backbone: FeatureExtractorConfig,
}

impl Default for ControlConfig {
    fn default() -> Self {
        Self {
            input_size: 224,
            dropout: 0.5,
            backbone: FeatureExtractorConfig::default(),
        }
    }
}

impl ControlConfig {
    pub fn validate(&self) -> ModelResult<()> {
        if self.input_size == 0 {
            return Err(ModelError::InvalidConfig("control input_size must be > 0".into()));
        }
        if !(0.0..1.0).contains(&self.dropout) {
            return Err(ModelError::InvalidConfig(format!(
                "control dropout {} outside [0, 1)",
                self.dropout
            )));
        }
        if self.backbone.channels.is_empty() {
            return Err(ModelError::InvalidConfig("backbone needs at least one stage".into()));
        }
        Ok(())
    }
}

pub trait ControlModule<B: Backend>: Module<B> {
    fn kind(&self) -> ControlKind;

    fn num_parameters(&self) -> usize {
        self.kind().num_parameters()
    }

    /// Images `[B, 3, H, W]` to parameters `[B, k]`.
    fn predict_parameters(&self, images: Tensor<B, 4>) -> ModelResult<Tensor<B, 2>>;

    /// Degrades `images` with `params`; the output keeps the input shape.
    fn apply(&self, images: Tensor<B, 4>, params: Tensor<B, 2>) -> ModelResult<Tensor<B, 4>>;

    /// Differentiable stand-in for the rate when the degradation itself is not
    /// differentiable in the parameters.
    fn rate_proxy(&self, _params: Tensor<B, 2>) -> Option<Tensor<B, 1>> {
        None
    }

    /// Re-disables gradients on the extractor, e.g. after loading a record.
    fn refreeze(self) -> Self;
}

pub(crate) fn check_parameters<B: Backend>(
    params: &Tensor<B, 2>,
    batch: usize,
    expected: usize,
) -> ModelResult<()> {
    let [rows, cols] = params.dims();
    if cols != expected {
        return Err(ModelError::ParameterShape {
            expected,
            actual: cols,
        });
    }
    if rows != batch {
        return Err(ModelError::ParameterShape {
            expected: batch,
            actual: rows,
        });
    }
    Ok(())
}

/// Kaiming-uniform linear layer used by the heads.
pub(crate) fn head_linear(d_in: usize, d_out: usize) -> LinearConfig {
    LinearConfig::new(d_in, d_out).with_initializer(Initializer::KaimingUniform {
        gain: std::f64::consts::SQRT_2,
        fan_out_only: false,
    })
}

/// Reads a small tensor back to the host.
pub(crate) fn host_values<B: Backend, const D: usize>(t: Tensor<B, D>) -> ModelResult<Vec<f32>> {
    t.into_data()
        .convert::<f32>()
        .to_vec::<f32>()
        .map_err(|e| ModelError::TensorData(format!("{e:?}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kind_parses_and_prints() {
        for kind in [ControlKind::Downscale, ControlKind::LuminanceBlur] {
            assert_eq!(kind.to_string().parse::<ControlKind>().unwrap(), kind);
        }
        assert!("sharpen".parse::<ControlKind>().is_err());
    }

    #[test]
    fn variant_defaults() {
        assert_eq!(ControlKind::Downscale.default_loss_weights(), (40.0, 1.0));
        assert_eq!(ControlKind::LuminanceBlur.default_loss_weights(), (1.0, 8.0));
        assert_eq!(ControlKind::LuminanceBlur.num_parameters(), 2);
    }

    #[test]
    fn config_validation() {
        assert!(ControlConfig::default().validate().is_ok());
        let bad = ControlConfig {
            dropout: 1.0,
            ..Default::default()
        };
        assert!(bad.validate().is_err());
    }
}
