#![recursion_limit = "256"]
//! Joint training of a detector and an image control network against a
//! differentiable codec and a frozen bit-rate estimator.
//!
//! [`train_step`] is the whole per-iteration state machine; [`util::run_train`]
//! drives epochs, validation, checkpoints and early stopping around it.

pub mod checkpoint;
pub mod collective;
pub mod config;
pub mod dataset;
pub mod early_stop;
pub mod ema;
pub mod error;
pub mod grads;
pub mod metrics;
pub mod optim;
pub mod schedule;
pub mod state;
pub mod step;
pub mod util;
pub mod validate;

pub use checkpoint::{checkpoint_dir, strip_optimizer, CheckpointState};
pub use collective::{Collective, LocalGroup, LocalHub, SingleProcess};
pub use config::{
    CheckpointPrecision, DetectorGradient, Hyperparameters, LossWeights, RateTerm, TrainConfig,
};
pub use dataset::{DataLoader, DetectionBatch, DetectionDataset, HostBatch, LoaderConfig, Sample};
pub use early_stop::EarlyStopping;
pub use ema::ModelEma;
pub use error::{TrainError, TrainResult};
pub use grads::GradScaler;
pub use optim::{GroupLr, SgdMomentum};
pub use schedule::{EpochScheduler, LrSchedule};
pub use state::TrainingState;
pub use step::{
    combined_loss, joint_forward, train_step, LossItems, RunningMeans, StepContext, StepOutcome,
    StepSettings,
};
pub use util::{run_train, TrainArgs};
pub use validate::{validate, ValidationReport, ValidationSettings};

/// Backend alias for training/eval (NdArray by default; WGPU if enabled).
#[cfg(feature = "backend-wgpu")]
pub type TrainBackend = burn_wgpu::Wgpu<f32>;
#[cfg(not(feature = "backend-wgpu"))]
pub type TrainBackend = burn_ndarray::NdArray<f32>;
