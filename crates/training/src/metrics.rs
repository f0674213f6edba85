//! Host-side detection metrics: per-class average precision at IoU 0.50:0.95.

use models::{iou, Detection, TargetBox};

/// IoU thresholds 0.50, 0.55, ..., 0.95.
pub const IOU_THRESHOLDS: [f32; 10] = [0.5, 0.55, 0.6, 0.65, 0.7, 0.75, 0.8, 0.85, 0.9, 0.95];

#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct ApSummary {
    pub precision: f64,
    pub recall: f64,
    pub map50: f64,
    pub map: f64,
}

/// Accumulates matched predictions over a validation pass.
#[derive(Debug, Clone, Default)]
pub struct DetectionStats {
    correct: Vec<[bool; 10]>,
    conf: Vec<f32>,
    pred_cls: Vec<usize>,
    target_cls: Vec<usize>,
}

impl DetectionStats {
    pub fn add_image(&mut self, detections: &[Detection], targets: &[TargetBox]) {
        self.target_cls.extend(targets.iter().map(|t| t.class_id));
        let mut order: Vec<usize> = (0..detections.len()).collect();
        order.sort_by(|&a, &b| {
            detections[b]
                .score
                .partial_cmp(&detections[a].score)
                .unwrap_or(std::cmp::Ordering::Equal)
        });

        let mut correct = vec![[false; 10]; detections.len()];
        for (t, thresh) in IOU_THRESHOLDS.iter().enumerate() {
            let mut taken = vec![false; targets.len()];
            for &d in &order {
                let det = &detections[d];
                let best = targets
                    .iter()
                    .enumerate()
                    .filter(|(j, gt)| !taken[*j] && gt.class_id == det.class_id)
                    .map(|(j, gt)| (j, iou(&det.bbox, &gt.bbox)))
                    .filter(|(_, v)| v >= thresh)
                    .max_by(|a, b| a.1.partial_cmp(&b.1).unwrap_or(std::cmp::Ordering::Equal));
                if let Some((j, _)) = best {
                    taken[j] = true;
                    correct[d][t] = true;
                }
            }
        }
        for (det, c) in detections.iter().zip(correct) {
            self.correct.push(c);
            self.conf.push(det.score);
            self.pred_cls.push(det.class_id);
        }
    }

    pub fn num_targets(&self) -> usize {
        self.target_cls.len()
    }

    /// Means over the classes present in the targets. P and R are taken at each
    /// class's max-F1 point at IoU 0.5.
    pub fn summarize(&self) -> ApSummary {
        let mut classes: Vec<usize> = self.target_cls.clone();
        classes.sort_unstable();
        classes.dedup();
        if classes.is_empty() {
            return ApSummary::default();
        }

        let mut order: Vec<usize> = (0..self.conf.len()).collect();
        order.sort_by(|&a, &b| {
            self.conf[b]
                .partial_cmp(&self.conf[a])
                .unwrap_or(std::cmp::Ordering::Equal)
        });

        let (mut p_sum, mut r_sum, mut ap50_sum, mut ap_sum) = (0.0, 0.0, 0.0, 0.0);
        for &c in &classes {
            let n_gt = self.target_cls.iter().filter(|&&t| t == c).count() as f64;
            let preds: Vec<usize> = order
                .iter()
                .copied()
                .filter(|&i| self.pred_cls[i] == c)
                .collect();
            if preds.is_empty() {
                continue;
            }
            for t in 0..IOU_THRESHOLDS.len() {
                let (recall, precision) = pr_curve(&preds, |i| self.correct[i][t], n_gt);
                let ap = average_precision(&recall, &precision);
                ap_sum += ap;
                if t == 0 {
                    ap50_sum += ap;
                    let (p, r) = max_f1_point(&recall, &precision);
                    p_sum += p;
                    r_sum += r;
                }
            }
        }
        let n = classes.len() as f64;
        ApSummary {
            precision: p_sum / n,
            recall: r_sum / n,
            map50: ap50_sum / n,
            map: ap_sum / (n * IOU_THRESHOLDS.len() as f64),
        }
    }
}

/// Cumulative recall and precision along predictions sorted by confidence.
fn pr_curve(preds: &[usize], is_tp: impl Fn(usize) -> bool, n_gt: f64) -> (Vec<f64>, Vec<f64>) {
    let mut tp = 0.0;
    let mut fp = 0.0;
    let mut recall = Vec::with_capacity(preds.len());
    let mut precision = Vec::with_capacity(preds.len());
    for &i in preds {
        if is_tp(i) {
            tp += 1.0;
        } else {
            fp += 1.0;
        }
        recall.push(tp / (n_gt + 1e-16));
        precision.push(tp / (tp + fp));
    }
    (recall, precision)
}

fn max_f1_point(recall: &[f64], precision: &[f64]) -> (f64, f64) {
    let mut best = (0.0, 0.0, -1.0);
    for (&r, &p) in recall.iter().zip(precision) {
        let f1 = 2.0 * p * r / (p + r + 1e-16);
        if f1 > best.2 {
            best = (p, r, f1);
        }
    }
    (best.0, best.1)
}

/// Area under the precision envelope, 101-point interpolated.
pub fn average_precision(recall: &[f64], precision: &[f64]) -> f64 {
    let mut mrec = Vec::with_capacity(recall.len() + 2);
    mrec.push(0.0);
    mrec.extend_from_slice(recall);
    mrec.push(1.0);
    let mut mpre = Vec::with_capacity(precision.len() + 2);
    mpre.push(1.0);
    mpre.extend_from_slice(precision);
    mpre.push(0.0);
    for i in (0..mpre.len() - 1).rev() {
        mpre[i] = mpre[i].max(mpre[i + 1]);
    }

    let xs: Vec<f64> = (0..101).map(|i| i as f64 / 100.0).collect();
    let ys: Vec<f64> = xs.iter().map(|&x| interp(x, &mrec, &mpre)).collect();
    xs.windows(2)
        .zip(ys.windows(2))
        .map(|(x, y)| (x[1] - x[0]) * (y[0] + y[1]) / 2.0)
        .sum()
}

/// Piecewise-linear interpolation over non-decreasing `xp`.
fn interp(x: f64, xp: &[f64], fp: &[f64]) -> f64 {
    if x <= xp[0] {
        return fp[0];
    }
    for i in 1..xp.len() {
        if x <= xp[i] {
            let span = xp[i] - xp[i - 1];
            if span <= 0.0 {
                return fp[i];
            }
            let w = (x - xp[i - 1]) / span;
            return fp[i - 1] + w * (fp[i] - fp[i - 1]);
        }
    }
    fp[fp.len() - 1]
}

/// Weighted combination used to rank checkpoints.
pub fn fitness(summary: &ApSummary) -> f64 {
    0.1 * summary.map50 + 0.9 * summary.map
}
