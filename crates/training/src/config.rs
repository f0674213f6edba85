//! Run configuration: TOML file merged over defaults, then CLI overrides.

use std::path::{Path, PathBuf};

use models::{ControlConfig, ControlKind, GridDetectorConfig, LossGains};
use serde::{Deserialize, Serialize};

use crate::{TrainError, TrainResult};

/// Environment variable naming a config file when `--config` is not given.
pub const CONFIG_ENV: &str = "JOINT_TRAIN_CONFIG";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Hyperparameters {
    pub lr0: f64,
    /// Final LR as a fraction of `lr0`.
    pub lrf: f64,
    pub momentum: f64,
    pub weight_decay: f64,
    pub warmup_epochs: f64,
    pub warmup_momentum: f64,
    pub warmup_bias_lr: f64,
    pub box_gain: f32,
    pub obj_gain: f32,
    pub cls_gain: f32,
    /// Adam LR for the control head; variant default when unset.
    pub control_lr: Option<f64>,
    /// Per-epoch exponential decay of the control LR.
    pub control_gamma: f64,
}

impl Default for Hyperparameters {
    fn default() -> Self {
        Self {
            lr0: 0.01,
            lrf: 0.01,
            momentum: 0.937,
            weight_decay: 5e-4,
            warmup_epochs: 3.0,
            warmup_momentum: 0.8,
            warmup_bias_lr: 0.1,
            box_gain: 0.05,
            obj_gain: 1.0,
            cls_gain: 0.5,
            control_lr: None,
            control_gamma: 0.95,
        }
    }
}

impl Hyperparameters {
    pub fn gains(&self) -> LossGains {
        LossGains {
            box_gain: self.box_gain,
            obj_gain: self.obj_gain,
            cls_gain: self.cls_gain,
        }
    }
}

/// What the rate half of the combined loss measures.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RateTerm {
    /// Bits per pixel from the estimator on the codec features.
    Estimator,
    /// The control module's own proxy (mean inverse downscale factor).
    InverseScale,
}

/// Which loss the detector's gradients come from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum DetectorGradient {
    #[default]
    Combined,
    DetectionOnly,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum CheckpointPrecision {
    #[default]
    Full,
    Half,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct LossWeights {
    pub rate: f32,
    pub detection: f32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TrainConfig {
    pub epochs: usize,
    pub batch_size: usize,
    /// Nominal batch size the LR and weight decay are tuned for.
    pub nbs: usize,
    pub imgsz: usize,
    pub quality: u32,
    pub variant: ControlKind,
    pub rate_term: Option<RateTerm>,
    pub detector_gradient: DetectorGradient,
    pub loss_weights: Option<LossWeights>,
    pub cos_lr: bool,
    /// Epochs without fitness improvement before stopping; 0 disables.
    pub patience: usize,
    /// Extra `epoch{n}` snapshot every n epochs; 0 disables.
    pub save_period: usize,
    pub seed: u64,
    /// Dynamic loss scaling for reduced-precision backends.
    pub amp: bool,
    pub max_grad_norm: f32,
    pub pad_to_block: bool,
    pub world_size: usize,
    pub ema_decay: f64,
    pub ema_tau: f64,
    pub conf_thresh: f32,
    pub iou_thresh: f32,
    pub max_boxes: usize,
    pub workers: usize,
    pub show_progress: bool,
    pub checkpoint_precision: CheckpointPrecision,
    pub run_dir: PathBuf,
    pub data: PathBuf,
    pub bit_estimator: PathBuf,
    pub backbone_weights: Option<PathBuf>,
    pub hyp: Hyperparameters,
    pub control: ControlConfig,
    pub detector: GridDetectorConfig,
}

impl Default for TrainConfig {
    fn default() -> Self {
        Self {
            epochs: 100,
            batch_size: 16,
            nbs: 64,
            imgsz: 640,
            quality: 80,
            variant: ControlKind::LuminanceBlur,
            rate_term: None,
            detector_gradient: DetectorGradient::Combined,
            loss_weights: None,
            cos_lr: false,
            patience: 100,
            save_period: 0,
            seed: 0,
            amp: false,
            max_grad_norm: 10.0,
            pad_to_block: false,
            world_size: 1,
            ema_decay: 0.9999,
            ema_tau: 2000.0,
            conf_thresh: 0.001,
            iou_thresh: 0.6,
            max_boxes: 64,
            workers: 0,
            show_progress: true,
            checkpoint_precision: CheckpointPrecision::Full,
            run_dir: PathBuf::from("runs/train"),
            data: PathBuf::from("data/dataset.toml"),
            bit_estimator: PathBuf::from("weights/bit_estimator"),
            backbone_weights: None,
            hyp: Hyperparameters::default(),
            control: ControlConfig::default(),
            detector: GridDetectorConfig::default(),
        }
    }
}

impl TrainConfig {
    pub fn from_path(path: &Path) -> TrainResult<Self> {
        let raw = std::fs::read_to_string(path).map_err(|e| TrainError::io(path, e))?;
        toml::from_str(&raw).map_err(|source| TrainError::Toml {
            path: path.to_path_buf(),
            source,
        })
    }

    /// `path`, else the file named by [`CONFIG_ENV`], else the defaults.
    pub fn load(path: Option<&Path>) -> TrainResult<Self> {
        if let Some(path) = path {
            return Self::from_path(path);
        }
        match std::env::var_os(CONFIG_ENV) {
            Some(p) if !p.is_empty() => Self::from_path(Path::new(&p)),
            _ => Ok(Self::default()),
        }
    }

    pub fn validate(&self) -> TrainResult<()> {
        if self.batch_size == 0 || self.nbs == 0 {
            return Err(TrainError::Config("batch_size and nbs must be > 0".into()));
        }
        if !(1..=100).contains(&self.quality) {
            return Err(TrainError::Config(format!(
                "quality {} outside 1..=100",
                self.quality
            )));
        }
        if self.imgsz == 0 {
            return Err(TrainError::Config("imgsz must be > 0".into()));
        }
        if !self.pad_to_block && self.imgsz % transforms::BLOCK_SIZE != 0 {
            return Err(TrainError::Config(format!(
                "imgsz {} is not a multiple of {}; set pad_to_block = true to pad",
                self.imgsz,
                transforms::BLOCK_SIZE
            )));
        }
        if self.world_size == 0 {
            return Err(TrainError::Config("world_size must be >= 1".into()));
        }
        if self.max_grad_norm <= 0.0 {
            return Err(TrainError::Config("max_grad_norm must be positive".into()));
        }
        if !(0.0..1.0).contains(&self.ema_decay) {
            return Err(TrainError::Config(format!(
                "ema_decay {} outside [0, 1)",
                self.ema_decay
            )));
        }
        let weights = self.loss_weights();
        if self.detector_gradient == DetectorGradient::DetectionOnly && weights.detection == 0.0 {
            return Err(TrainError::Config(
                "detection_only gradients need a non-zero detection weight".into(),
            ));
        }
        if self.rate_term() == RateTerm::InverseScale && self.variant != ControlKind::Downscale {
            return Err(TrainError::Config(format!(
                "inverse_scale rate term needs the downscale variant, got {}",
                self.variant
            )));
        }
        self.control.validate()?;
        Ok(())
    }

    pub fn rate_term(&self) -> RateTerm {
        self.rate_term.unwrap_or(match self.variant {
            ControlKind::Downscale => RateTerm::InverseScale,
            ControlKind::LuminanceBlur => RateTerm::Estimator,
        })
    }

    pub fn loss_weights(&self) -> LossWeights {
        self.loss_weights.unwrap_or_else(|| {
            let (rate, detection) = self.variant.default_loss_weights();
            LossWeights { rate, detection }
        })
    }

    pub fn control_lr(&self) -> f64 {
        self.hyp
            .control_lr
            .unwrap_or_else(|| self.variant.default_learning_rate())
    }

    /// Optimizer steps are taken every `accumulate` batches.
    pub fn accumulate(&self) -> usize {
        ((self.nbs as f64 / self.batch_size as f64).round() as usize).max(1)
    }

    /// Weight decay rescaled to the effective batch.
    pub fn scaled_weight_decay(&self) -> f64 {
        self.hyp.weight_decay * (self.batch_size * self.accumulate()) as f64 / self.nbs as f64
    }
}
