#![allow(dead_code)]

use std::path::{Path, PathBuf};

use burn::backend::{Autodiff, NdArray};
use burn::module::{Module, ModuleVisitor, ParamId};
use burn::tensor::backend::{AutodiffBackend, Backend};
use burn::tensor::{Distribution, ElementConversion, Tensor};
use image::{Rgb, RgbImage};
use models::{
    BitEstimator, BitEstimatorConfig, ControlConfig, DetectionTargets, FeatureExtractorConfig,
    GridDetectorConfig, TargetBox,
};
use training::config::Hyperparameters;
use training::{DetectionBatch, TrainConfig};

pub type AD = Autodiff<NdArray<f32>>;

/// Small networks, no warmup, one optimizer step per batch of two.
pub fn small_config() -> TrainConfig {
    TrainConfig {
        epochs: 2,
        batch_size: 2,
        nbs: 2,
        imgsz: 64,
        show_progress: false,
        hyp: Hyperparameters {
            warmup_epochs: 0.0,
            control_lr: Some(1e-3),
            ..Default::default()
        },
        control: ControlConfig {
            input_size: 32,
            dropout: 0.0,
            backbone: FeatureExtractorConfig {
                channels: vec![4, 8],
            },
        },
        detector: GridDetectorConfig {
            num_classes: 1,
            width: 8,
        },
        ..Default::default()
    }
}

/// Two 64x64 images with one box each.
pub fn synthetic_batch(device: &<AD as Backend>::Device) -> DetectionBatch<AD> {
    let images = Tensor::<AD, 4>::random([2, 3, 64, 64], Distribution::Uniform(0.0, 1.0), device);
    let targets = vec![
        vec![TargetBox {
            bbox: [0.1, 0.2, 0.5, 0.6],
            class_id: 0,
        }],
        vec![TargetBox {
            bbox: [0.4, 0.4, 0.9, 0.8],
            class_id: 0,
        }],
    ];
    DetectionBatch {
        images,
        targets: DetectionTargets::from_host(&targets, 4, device),
        names: vec!["a".into(), "b".into()],
    }
}

pub fn frozen_estimator(device: &<AD as Backend>::Device) -> BitEstimator<AD> {
    BitEstimator::new(BitEstimatorConfig::default(), device).no_grad()
}

/// Every float tensor of a module, in visit order.
pub struct Values {
    pub tensors: Vec<(ParamId, bool, Vec<f32>)>,
}

impl<B: Backend> ModuleVisitor<B> for Values {
    fn visit_float<const D: usize>(&mut self, id: ParamId, tensor: &Tensor<B, D>) {
        let values = tensor.to_data().convert::<f32>().to_vec::<f32>().unwrap();
        self.tensors.push((id, tensor.is_require_grad(), values));
    }
}

pub fn values<B: Backend, M: Module<B>>(module: &M) -> Vec<(ParamId, bool, Vec<f32>)> {
    let mut visitor = Values {
        tensors: Vec::new(),
    };
    module.visit(&mut visitor);
    visitor.tensors
}

/// Gradient presence and magnitude per tensor.
pub struct GradTally<'a, B: AutodiffBackend> {
    pub grads: &'a B::Gradients,
    /// (requires grad, has grad, sum of |grad|)
    pub seen: Vec<(bool, bool, f32)>,
}

impl<B: AutodiffBackend> ModuleVisitor<B> for GradTally<'_, B> {
    fn visit_float<const D: usize>(&mut self, _id: ParamId, tensor: &Tensor<B, D>) {
        let grad = tensor.grad(self.grads);
        let magnitude = grad
            .as_ref()
            .map(|g| g.clone().abs().sum().into_scalar().elem::<f32>())
            .unwrap_or(0.0);
        self.seen
            .push((tensor.is_require_grad(), grad.is_some(), magnitude));
    }
}

pub fn write_png(path: &Path, size: (u32, u32), color: [u8; 3]) {
    RgbImage::from_fn(size.0, size.1, |x, y| {
        if (x + y) % 7 == 0 {
            Rgb([255 - color[0], color[1], color[2]])
        } else {
            Rgb(color)
        }
    })
    .save(path)
    .unwrap();
}

/// Writes `n` PNGs, train/val manifests and a descriptor; returns the descriptor path.
pub fn write_dataset(dir: &Path, n: usize, size: (u32, u32)) -> PathBuf {
    std::fs::create_dir_all(dir.join("images")).unwrap();
    let mut records = Vec::new();
    for i in 0..n {
        let name = format!("images/img{i}.png");
        write_png(&dir.join(&name), size, [(40 * i) as u8, 120, 200]);
        records.push(format!(
            r#"{{"image":"{name}","labels":[{{"class_id":0,"bbox_norm":[0.2,0.2,0.7,0.8]}}]}}"#
        ));
    }
    let manifest = format!(r#"{{"images":[{}]}}"#, records.join(","));
    std::fs::write(dir.join("train.json"), &manifest).unwrap();
    std::fs::write(dir.join("val.json"), &manifest).unwrap();
    let descriptor = dir.join("data.toml");
    std::fs::write(
        &descriptor,
        "train = \"train.json\"\nval = \"val.json\"\nnc = 1\nnames = [\"polyp\"]\n",
    )
    .unwrap();
    descriptor
}

/// Saves a randomly initialised estimator; returns the path the loader expects.
pub fn write_estimator(dir: &Path) -> PathBuf {
    let path = dir.join("bit_estimator");
    BitEstimator::<NdArray<f32>>::new(BitEstimatorConfig::default(), &Default::default())
        .save(&path)
        .unwrap();
    path
}
