//! Validation of the (EMA) networks on the held-out manifest.

use burn::tensor::backend::Backend;
use models::{BitEstimator, ControlModule, DetectionModel, LossGains};
use serde::{Deserialize, Serialize};
use transforms::CodecSurrogate;

use crate::dataset::DataLoader;
use crate::metrics::{fitness, ApSummary, DetectionStats};
use crate::step::{scalar, LossItems, RunningMeans};
use crate::TrainResult;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ValidationSettings {
    pub conf_thresh: f32,
    pub iou_thresh: f32,
    pub max_boxes: usize,
    pub gains: LossGains,
}

impl ValidationSettings {
    pub fn from_config(cfg: &crate::TrainConfig) -> Self {
        Self {
            conf_thresh: cfg.conf_thresh,
            iou_thresh: cfg.iou_thresh,
            max_boxes: cfg.max_boxes,
            gains: cfg.hyp.gains(),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct ValidationReport {
    pub precision: f64,
    pub recall: f64,
    pub map50: f64,
    pub map: f64,
    #[serde(rename = "box")]
    pub box_loss: f64,
    #[serde(rename = "obj")]
    pub obj_loss: f64,
    #[serde(rename = "cls")]
    pub cls_loss: f64,
    pub bpp: f64,
    pub images: usize,
}

impl ValidationReport {
    pub fn summary(&self) -> ApSummary {
        ApSummary {
            precision: self.precision,
            recall: self.recall,
            map50: self.map50,
            map: self.map,
        }
    }

    /// `0.1 * mAP@0.5 + 0.9 * mAP@0.5:0.95`.
    pub fn fitness(&self) -> f64 {
        fitness(&self.summary())
    }
}

/// Runs every batch of `loader` through control, codec, estimator and detector.
///
/// Intended for the inner (non-autodiff) backend, where dropout is inactive and
/// batch norm uses its running statistics.
pub fn validate<B, D, C>(
    detector: &D,
    control: &C,
    estimator: &BitEstimator<B>,
    codec: &CodecSurrogate<B>,
    loader: &DataLoader,
    settings: &ValidationSettings,
    device: &B::Device,
) -> TrainResult<ValidationReport>
where
    B: Backend,
    D: DetectionModel<B>,
    C: ControlModule<B>,
{
    let mut stats = DetectionStats::default();
    let mut means = RunningMeans::default();
    let mut images = 0;
    for host in loader.epoch(0) {
        let host = host?;
        let targets = host.targets.clone();
        let batch = host.to_device::<B>(settings.max_boxes, device);

        let params = control.predict_parameters(batch.images.clone())?;
        let degraded = control.apply(batch.images, params.clone())?;
        let coded = codec.round_trip(degraded)?;
        let bpp = estimator.bits_per_pixel(&coded);
        let preds = detector.forward(coded.reconstructed);
        let loss = detector.compute_loss(&preds, &batch.targets, settings.gains, Some(params))?;
        let detections = detector.decode(&preds, settings.conf_thresh, settings.iou_thresh)?;

        for (dets, gts) in detections.iter().zip(targets.iter()) {
            stats.add_image(dets, gts);
        }
        images += targets.len();
        means.push(&LossItems {
            box_loss: scalar(loss.box_loss),
            obj_loss: scalar(loss.obj_loss),
            cls_loss: scalar(loss.cls_loss),
            total: scalar(loss.total),
            bpp: scalar(bpp),
        });
    }

    let summary = stats.summarize();
    let losses = means.means();
    let report = ValidationReport {
        precision: summary.precision,
        recall: summary.recall,
        map50: summary.map50,
        map: summary.map,
        box_loss: losses.box_loss,
        obj_loss: losses.obj_loss,
        cls_loss: losses.cls_loss,
        bpp: losses.bpp,
        images,
    };
    log::info!(
        "val: {} images, {} targets, P {:.4} R {:.4} mAP50 {:.4} mAP50-95 {:.4} bpp {:.4}",
        images,
        stats.num_targets(),
        report.precision,
        report.recall,
        report.map50,
        report.map,
        report.bpp
    );
    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fitness_weights_strict_map() {
        let report = ValidationReport {
            map50: 0.8,
            map: 0.5,
            ..Default::default()
        };
        assert!((report.fitness() - 0.53).abs() < 1e-12);
        assert_eq!(report.summary().map50, 0.8);
    }
}
