//! Small anchor-free grid detector.
//!
//! Shapes (normalized coords):
//! - Input images: `[B, 3, H, W]`
//! - Objectness logits: `[B, 1, H/8, W/8]`
//! - Box logits: `[B, 4, H/8, W/8]` (sigmoid gives `x0, y0, x1, y1` in 0..1)
//! - Class logits: `[B, nc, H/8, W/8]`

use burn::module::{Ignored, Module, ParamId};
use burn::nn::conv::{Conv2d, Conv2dConfig};
use burn::nn::{BatchNorm, BatchNormConfig, PaddingConfig2d};
use burn::tensor::activation::{relu, sigmoid};
use burn::tensor::{backend::Backend, Tensor, TensorData};
use serde::{Deserialize, Serialize};

use crate::control::host_values;
use crate::detector::{
    binary_cross_entropy, huber, nms, Detection, DetectionLoss, DetectionModel, DetectionTargets,
    LossGains, TargetBox,
};
use crate::{ModelError, ModelResult};

pub const GRID_STRIDE: usize = 8;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GridDetectorConfig {
    pub num_classes: usize,
    pub width: usize,
}

impl Default for GridDetectorConfig {
    fn default() -> Self {
        Self {
            num_classes: 1,
            width: 32,
        }
    }
}

#[derive(Debug, Clone)]
pub struct GridOutput<B: Backend> {
    pub obj_logits: Tensor<B, 4>,
    pub box_logits: Tensor<B, 4>,
    pub cls_logits: Tensor<B, 4>,
}

#[derive(Module, Debug)]
pub struct GridDetector<B: Backend> {
    stem: Conv2d<B>,
    stem_norm: BatchNorm<B, 2>,
    down1: Conv2d<B>,
    down2: Conv2d<B>,
    head_obj: Conv2d<B>,
    head_box: Conv2d<B>,
    head_cls: Conv2d<B>,
    pub config: Ignored<GridDetectorConfig>,
}

fn conv3x3(in_ch: usize, out_ch: usize, stride: usize) -> Conv2dConfig {
    Conv2dConfig::new([in_ch, out_ch], [3, 3])
        .with_stride([stride, stride])
        .with_padding(PaddingConfig2d::Explicit(1, 1))
}

fn conv1x1(in_ch: usize, out_ch: usize) -> Conv2dConfig {
    Conv2dConfig::new([in_ch, out_ch], [1, 1]).with_padding(PaddingConfig2d::Valid)
}

impl<B: Backend> GridDetector<B> {
    pub fn new(config: GridDetectorConfig, device: &B::Device) -> ModelResult<Self> {
        if config.num_classes == 0 || config.width == 0 {
            return Err(ModelError::InvalidConfig(format!(
                "grid detector needs nc > 0 and width > 0, got nc={} width={}",
                config.num_classes, config.width
            )));
        }
        let w = config.width;
        Ok(Self {
            stem: conv3x3(3, w, 2).init(device),
            stem_norm: BatchNormConfig::new(w).init(device),
            down1: conv3x3(w, 2 * w, 2).init(device),
            down2: conv3x3(2 * w, 2 * w, 2).init(device),
            head_obj: conv1x1(2 * w, 1).init(device),
            head_box: conv1x1(2 * w, 4).init(device),
            head_cls: conv1x1(2 * w, config.num_classes).init(device),
            config: Ignored(config),
        })
    }
}

/// Assigns each box to the cell holding its centre. Returns per-cell objectness
/// `[gh * gw]`, box targets `[4, gh * gw]` (channel-major), and class ids per cell.
pub fn assign_targets_to_grid(
    boxes: &[TargetBox],
    grid_h: usize,
    grid_w: usize,
) -> (Vec<f32>, Vec<f32>, Vec<Option<usize>>) {
    let cells = grid_h * grid_w;
    let mut obj = vec![0.0f32; cells];
    let mut tgt = vec![0.0f32; cells * 4];
    let mut cls = vec![None; cells];

    for b in boxes {
        let cx = (b.bbox[0] + b.bbox[2]) * 0.5;
        let cy = (b.bbox[1] + b.bbox[3]) * 0.5;
        let gx = (cx * grid_w as f32).clamp(0.0, (grid_w - 1) as f32) as usize;
        let gy = (cy * grid_h as f32).clamp(0.0, (grid_h - 1) as f32) as usize;
        let idx = gy * grid_w + gx;
        obj[idx] = 1.0;
        for (c, v) in b.bbox.iter().enumerate() {
            tgt[c * cells + idx] = *v;
        }
        cls[idx] = Some(b.class_id);
    }

    (obj, tgt, cls)
}

impl<B: Backend> DetectionModel<B> for GridDetector<B> {
    type Output = GridOutput<B>;

    fn num_classes(&self) -> usize {
        self.config.num_classes
    }

    fn forward(&self, images: Tensor<B, 4>) -> GridOutput<B> {
        let x = relu(self.stem_norm.forward(self.stem.forward(images)));
        let x = relu(self.down1.forward(x));
        let x = relu(self.down2.forward(x));
        GridOutput {
            obj_logits: self.head_obj.forward(x.clone()),
            box_logits: self.head_box.forward(x.clone()),
            cls_logits: self.head_cls.forward(x),
        }
    }

    /// Objectness BCE over every cell, Huber boxes and class BCE on positive cells.
    /// The weighted sum is scaled by the batch size. Control parameters are not used.
    fn compute_loss(
        &self,
        preds: &GridOutput<B>,
        targets: &DetectionTargets<B>,
        gains: LossGains,
        _aux_weights: Option<Tensor<B, 2>>,
    ) -> ModelResult<DetectionLoss<B>> {
        let [batch, _, gh, gw] = preds.obj_logits.dims();
        let nc = self.num_classes();
        let cells = gh * gw;
        let device = preds.obj_logits.device();
        let host = targets.to_host()?;
        if host.len() != batch {
            return Err(ModelError::ParameterShape {
                expected: batch,
                actual: host.len(),
            });
        }

        let mut obj_t = Vec::with_capacity(batch * cells);
        let mut box_t = Vec::with_capacity(batch * cells * 4);
        let mut cls_t = vec![0.0f32; batch * nc * cells];
        for (b, boxes) in host.iter().enumerate() {
            let (obj, tgt, cls) = assign_targets_to_grid(boxes, gh, gw);
            obj_t.extend_from_slice(&obj);
            box_t.extend_from_slice(&tgt);
            for (idx, class) in cls.iter().enumerate() {
                if let Some(c) = class {
                    if *c < nc {
                        cls_t[(b * nc + c) * cells + idx] = 1.0;
                    }
                }
            }
        }
        let obj_t = Tensor::<B, 4>::from_data(TensorData::new(obj_t, [batch, 1, gh, gw]), &device);
        let box_t = Tensor::<B, 4>::from_data(TensorData::new(box_t, [batch, 4, gh, gw]), &device);
        let cls_t = Tensor::<B, 4>::from_data(TensorData::new(cls_t, [batch, nc, gh, gw]), &device);
        let positives = obj_t.clone().sum().add_scalar(1e-6);

        let obj_loss = binary_cross_entropy(sigmoid(preds.obj_logits.clone()), obj_t.clone()).mean();

        let box_loss = (huber(sigmoid(preds.box_logits.clone()), box_t) * obj_t.clone()).sum()
            / positives.clone().mul_scalar(4.0);

        let cls_loss = (binary_cross_entropy(sigmoid(preds.cls_logits.clone()), cls_t) * obj_t).sum()
            / positives.mul_scalar(nc as f32);

        let box_loss = box_loss.mul_scalar(gains.box_gain);
        let obj_loss = obj_loss.mul_scalar(gains.obj_gain);
        let cls_loss = cls_loss.mul_scalar(gains.cls_gain);
        let total = (box_loss.clone() + obj_loss.clone() + cls_loss.clone()).mul_scalar(batch as f32);

        Ok(DetectionLoss {
            total,
            box_loss: box_loss.detach(),
            obj_loss: obj_loss.detach(),
            cls_loss: cls_loss.detach(),
        })
    }

    fn decode(
        &self,
        preds: &GridOutput<B>,
        conf_thresh: f32,
        iou_thresh: f32,
    ) -> ModelResult<Vec<Vec<Detection>>> {
        let [batch, _, gh, gw] = preds.obj_logits.dims();
        let nc = self.num_classes();
        let cells = gh * gw;
        let obj = host_values(sigmoid(preds.obj_logits.clone()))?;
        let boxes = host_values(sigmoid(preds.box_logits.clone()))?;
        let cls = host_values(sigmoid(preds.cls_logits.clone()))?;

        let mut out = Vec::with_capacity(batch);
        for b in 0..batch {
            let mut dets = Vec::new();
            for idx in 0..cells {
                let (class_id, class_p) = (0..nc)
                    .map(|c| (c, cls[(b * nc + c) * cells + idx]))
                    .fold((0, f32::MIN), |best, cur| if cur.1 > best.1 { cur } else { best });
                let score = obj[b * cells + idx] * class_p;
                if score < conf_thresh {
                    continue;
                }
                let base = b * 4 * cells + idx;
                let (a0, a1) = (boxes[base], boxes[base + 2 * cells]);
                let (c0, c1) = (boxes[base + cells], boxes[base + 3 * cells]);
                dets.push(Detection {
                    bbox: [a0.min(a1), c0.min(c1), a0.max(a1), c0.max(c1)],
                    score,
                    class_id,
                });
            }
            out.push(nms(dets, iou_thresh));
        }
        Ok(out)
    }

    fn norm_scales(&self) -> Vec<ParamId> {
        vec![self.stem_norm.gamma.id]
    }
}
