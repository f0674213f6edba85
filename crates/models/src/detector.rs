//! Detection backbone interface plus the host-side helpers shared by decoders.

use burn::module::{Module, ParamId};
use burn::tensor::{backend::Backend, Tensor, TensorData};
use transforms::numerics::BCE_EPS;

use crate::control::host_values;
use crate::ModelResult;

/// Ground truth for a batch, padded to `max_boxes` per image.
#[derive(Debug, Clone)]
pub struct DetectionTargets<B: Backend> {
    /// `[B, M, 4]` normalized `x0, y0, x1, y1`.
    pub boxes: Tensor<B, 3>,
    /// `[B, M]` class ids stored as floats.
    pub classes: Tensor<B, 2>,
    /// `[B, M]`, 1 where the slot holds a real box.
    pub mask: Tensor<B, 2>,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TargetBox {
    pub bbox: [f32; 4],
    pub class_id: usize,
}

impl<B: Backend> DetectionTargets<B> {
    pub fn from_host(targets: &[Vec<TargetBox>], max_boxes: usize, device: &B::Device) -> Self {
        let batch = targets.len();
        let m = max_boxes.max(1);
        let mut boxes = vec![0.0f32; batch * m * 4];
        let mut classes = vec![0.0f32; batch * m];
        let mut mask = vec![0.0f32; batch * m];
        for (b, image) in targets.iter().enumerate() {
            for (j, target) in image.iter().take(m).enumerate() {
                let slot = b * m + j;
                boxes[slot * 4..slot * 4 + 4].copy_from_slice(&target.bbox);
                classes[slot] = target.class_id as f32;
                mask[slot] = 1.0;
            }
        }
        Self {
            boxes: Tensor::from_data(TensorData::new(boxes, [batch, m, 4]), device),
            classes: Tensor::from_data(TensorData::new(classes, [batch, m]), device),
            mask: Tensor::from_data(TensorData::new(mask, [batch, m]), device),
        }
    }

    pub fn batch_size(&self) -> usize {
        self.mask.dims()[0]
    }

    /// Per-image list of the real (unmasked) boxes.
    pub fn to_host(&self) -> ModelResult<Vec<Vec<TargetBox>>> {
        let [batch, m] = self.mask.dims();
        let boxes = host_values(self.boxes.clone())?;
        let classes = host_values(self.classes.clone())?;
        let mask = host_values(self.mask.clone())?;
        let mut out = vec![Vec::new(); batch];
        for (b, image) in out.iter_mut().enumerate() {
            for j in 0..m {
                let slot = b * m + j;
                if mask[slot] <= 0.0 {
                    continue;
                }
                image.push(TargetBox {
                    bbox: [
                        boxes[slot * 4],
                        boxes[slot * 4 + 1],
                        boxes[slot * 4 + 2],
                        boxes[slot * 4 + 3],
                    ],
                    class_id: classes[slot].round().max(0.0) as usize,
                });
            }
        }
        Ok(out)
    }
}

/// Loss with its detached breakdown.
#[derive(Debug, Clone)]
pub struct DetectionLoss<B: Backend> {
    /// Scalar to backpropagate, `[1]`.
    pub total: Tensor<B, 1>,
    pub box_loss: Tensor<B, 1>,
    pub obj_loss: Tensor<B, 1>,
    pub cls_loss: Tensor<B, 1>,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Detection {
    pub bbox: [f32; 4],
    pub score: f32,
    pub class_id: usize,
}

/// Loss gains applied to the three terms.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LossGains {
    pub box_gain: f32,
    pub obj_gain: f32,
    pub cls_gain: f32,
}

impl Default for LossGains {
    fn default() -> Self {
        Self {
            box_gain: 0.05,
            obj_gain: 1.0,
            cls_gain: 0.5,
        }
    }
}

pub trait DetectionModel<B: Backend>: Module<B> {
    type Output: Clone;

    fn num_classes(&self) -> usize;

    fn forward(&self, images: Tensor<B, 4>) -> Self::Output;

    /// `aux_weights`, when given, are the control parameters `[B, k]` of the batch;
    /// models may use them to reweight per-image terms.
    fn compute_loss(
        &self,
        preds: &Self::Output,
        targets: &DetectionTargets<B>,
        gains: LossGains,
        aux_weights: Option<Tensor<B, 2>>,
    ) -> ModelResult<DetectionLoss<B>>;

    fn decode(
        &self,
        preds: &Self::Output,
        conf_thresh: f32,
        iou_thresh: f32,
    ) -> ModelResult<Vec<Vec<Detection>>>;

    /// Ids of normalization scales: rank-1 tensors that train without weight decay
    /// but follow the weight learning rate rather than the bias one.
    fn norm_scales(&self) -> Vec<ParamId> {
        Vec::new()
    }
}

/// Elementwise binary cross-entropy on probabilities.
pub fn binary_cross_entropy<B: Backend, const D: usize>(
    prob: Tensor<B, D>,
    target: Tensor<B, D>,
) -> Tensor<B, D> {
    let pos = target.clone() * prob.clone().add_scalar(BCE_EPS).log();
    let neg = target.neg().add_scalar(1.0) * prob.neg().add_scalar(1.0 + BCE_EPS).log();
    (pos + neg).neg()
}

/// Elementwise Huber loss with delta 1.
pub fn huber<B: Backend, const D: usize>(pred: Tensor<B, D>, target: Tensor<B, D>) -> Tensor<B, D> {
    let diff = (pred - target).abs();
    let small = diff.clone().lower_elem(1.0).float();
    let quadratic = diff.clone().powf_scalar(2.0).mul_scalar(0.5);
    let linear = diff.sub_scalar(0.5);
    quadratic * small.clone() + linear * small.neg().add_scalar(1.0)
}

pub fn iou(a: &[f32; 4], b: &[f32; 4]) -> f32 {
    let x0 = a[0].max(b[0]);
    let y0 = a[1].max(b[1]);
    let x1 = a[2].min(b[2]);
    let y1 = a[3].min(b[3]);
    let inter = (x1 - x0).max(0.0) * (y1 - y0).max(0.0);
    let area_a = (a[2] - a[0]).max(0.0) * (a[3] - a[1]).max(0.0);
    let area_b = (b[2] - b[0]).max(0.0) * (b[3] - b[1]).max(0.0);
    let union = area_a + area_b - inter + 1e-6;
    inter / union
}

/// Greedy per-class NMS; returns kept detections by descending score.
pub fn nms(mut dets: Vec<Detection>, iou_thresh: f32) -> Vec<Detection> {
    dets.sort_by(|a, b| b.score.partial_cmp(&a.score).unwrap_or(std::cmp::Ordering::Equal));
    let mut keep: Vec<Detection> = Vec::new();
    for det in dets {
        let suppressed = keep
            .iter()
            .any(|k| k.class_id == det.class_id && iou(&k.bbox, &det.bbox) > iou_thresh);
        if !suppressed {
            keep.push(det);
        }
    }
    keep
}

#[cfg(test)]
mod tests {
    use super::*;
    use burn::backend::NdArray;

    type TestBackend = NdArray<f32>;

    fn det(bbox: [f32; 4], score: f32, class_id: usize) -> Detection {
        Detection { bbox, score, class_id }
    }

    #[test]
    fn nms_keeps_highest_and_respects_classes() {
        let kept = nms(
            vec![
                det([0.1, 0.1, 0.5, 0.5], 0.6, 0),
                det([0.1, 0.1, 0.5, 0.5], 0.9, 0),
                det([0.1, 0.1, 0.5, 0.5], 0.5, 1),
                det([0.6, 0.6, 0.9, 0.9], 0.4, 0),
            ],
            0.5,
        );
        assert_eq!(kept.len(), 3);
        assert_eq!(kept[0].score, 0.9);
        assert!(kept.iter().any(|d| d.class_id == 1));
    }

    #[test]
    fn iou_of_identical_and_disjoint_boxes() {
        let a = [0.0, 0.0, 0.5, 0.5];
        assert!((iou(&a, &a) - 1.0).abs() < 1e-4);
        assert_eq!(iou(&a, &[0.6, 0.6, 1.0, 1.0]), 0.0);
    }

    #[test]
    fn targets_round_trip_through_tensors() {
        let device = Default::default();
        let host = vec![
            vec![TargetBox { bbox: [0.1, 0.2, 0.3, 0.4], class_id: 2 }],
            vec![],
        ];
        let targets = DetectionTargets::<TestBackend>::from_host(&host, 4, &device);
        assert_eq!(targets.boxes.dims(), [2, 4, 4]);
        assert_eq!(targets.to_host().unwrap(), host);
    }

    #[test]
    fn losses_are_finite_at_saturation() {
        let device = Default::default();
        let p = Tensor::<TestBackend, 1>::from_floats([0.0, 1.0, 0.5], &device);
        let t = Tensor::<TestBackend, 1>::from_floats([1.0, 0.0, 1.0], &device);
        let bce = binary_cross_entropy(p, t).into_data().to_vec::<f32>().unwrap();
        assert!(bce.iter().all(|v| v.is_finite() && *v > 0.0));
        let h = huber(
            Tensor::<TestBackend, 1>::from_floats([0.0, 3.0], &device),
            Tensor::<TestBackend, 1>::from_floats([0.5, 0.0], &device),
        )
        .into_data()
        .to_vec::<f32>()
        .unwrap();
        assert!((h[0] - 0.125).abs() < 1e-6);
        assert!((h[1] - 2.5).abs() < 1e-6);
    }
}
