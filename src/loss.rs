//! The Tacotron2 training loss: mean squared error on the mel frames (decoder and postnet
//! outputs both count) plus binary cross entropy on the gate logits with a configurable
//! positive-class weight. Keep `pos_weight` high or clips tend to stretch on instead of
//! stopping.
use crate::model::{ModelOutputs, ModelTargets};
use ndarray::{Array1, Array3};

#[derive(Debug, Clone)]
pub struct LossBreakdown {
    /// Batch-mean mel reconstruction loss.
    pub mel_loss: f32,
    /// Batch-mean gate loss.
    pub gate_loss: f32,
    /// Per-example mel losses, `[batch]`. Process-local diagnostics, never reduced across
    /// workers.
    pub mel_loss_per_item: Array1<f32>,
    /// Per-example gate losses, `[batch]`.
    pub gate_loss_per_item: Array1<f32>,
}

#[derive(Debug, Clone)]
pub struct Tacotron2Loss {
    pos_weight: f32,
}

impl Tacotron2Loss {
    pub fn new(pos_weight: f32) -> Self {
        Self { pos_weight }
    }

    pub fn pos_weight(&self) -> f32 {
        self.pos_weight
    }

    pub fn compute(&self, y_pred: &ModelOutputs, y: &ModelTargets) -> anyhow::Result<LossBreakdown> {
        if y_pred.mel.shape() != y.mel.shape() {
            anyhow::bail!(
                "predicted mel shape {:?} does not match target {:?}",
                y_pred.mel.shape(),
                y.mel.shape()
            );
        }
        if y_pred.gate.shape() != y.gate.shape() {
            anyhow::bail!(
                "predicted gate shape {:?} does not match target {:?}",
                y_pred.gate.shape(),
                y.gate.shape()
            );
        }

        let batch = y.mel.shape()[0];
        let mut mel_loss_per_item = mse_per_item(&y_pred.mel, &y.mel);
        if let Some(postnet) = &y_pred.mel_postnet {
            if postnet.shape() != y.mel.shape() {
                anyhow::bail!(
                    "postnet mel shape {:?} does not match target {:?}",
                    postnet.shape(),
                    y.mel.shape()
                );
            }
            mel_loss_per_item = mel_loss_per_item + mse_per_item(postnet, &y.mel);
        }

        let mut gate_loss_per_item = Array1::zeros(batch);
        let frames = y.gate.shape()[1];
        for b in 0..batch {
            let mut total = 0.0f32;
            for t in 0..frames {
                total += bce_with_logits(y_pred.gate[[b, t]], y.gate[[b, t]], self.pos_weight);
            }
            gate_loss_per_item[b] = total / frames as f32;
        }

        let mel_loss = mel_loss_per_item.mean().unwrap_or(0.0);
        let gate_loss = gate_loss_per_item.mean().unwrap_or(0.0);
        Ok(LossBreakdown {
            mel_loss,
            gate_loss,
            mel_loss_per_item,
            gate_loss_per_item,
        })
    }
}

fn mse_per_item(pred: &Array3<f32>, target: &Array3<f32>) -> Array1<f32> {
    let batch = pred.shape()[0];
    let per_item_elems = (pred.len() / batch.max(1)) as f32;
    let mut out = Array1::zeros(batch);
    for b in 0..batch {
        let diff = &pred.index_axis(ndarray::Axis(0), b) - &target.index_axis(ndarray::Axis(0), b);
        out[b] = diff.mapv(|x| x * x).sum() / per_item_elems;
    }
    out
}

fn softplus(x: f32) -> f32 {
    x.max(0.0) + (-x.abs()).exp().ln_1p()
}

/// Numerically stable weighted BCE on a single logit.
pub fn bce_with_logits(logit: f32, target: f32, pos_weight: f32) -> f32 {
    pos_weight * target * softplus(-logit) + (1.0 - target) * (logit + softplus(-logit))
}

/// Derivative of [`bce_with_logits`] with respect to the logit. Exposed so hand-differentiated
/// model implementations agree with the loss exactly.
pub fn bce_with_logits_grad(logit: f32, target: f32, pos_weight: f32) -> f32 {
    let sigmoid = 1.0 / (1.0 + (-logit).exp());
    -pos_weight * target * (1.0 - sigmoid) + (1.0 - target) * sigmoid
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::{Array2, Array3};

    fn outputs(mel: Array3<f32>, gate: Array2<f32>) -> ModelOutputs {
        ModelOutputs {
            mel,
            mel_postnet: None,
            gate,
            alignments: None,
        }
    }

    #[test]
    fn perfect_prediction_has_zero_mel_loss() {
        let mel = Array3::from_elem((2, 3, 4), 0.5);
        let gate = Array2::zeros((2, 4));
        let y = ModelTargets {
            mel: mel.clone(),
            gate: gate.clone(),
        };
        let breakdown = Tacotron2Loss::new(10.0)
            .compute(&outputs(mel, gate), &y)
            .unwrap();
        assert_eq!(breakdown.mel_loss, 0.0);
        // Gate logit 0 against target 0: ln 2.
        assert!((breakdown.gate_loss - 2.0f32.ln()).abs() < 1e-6);
    }

    #[test]
    fn aggregate_is_mean_of_per_item() {
        let mut mel_pred = Array3::zeros((2, 2, 2));
        mel_pred.index_axis_mut(ndarray::Axis(0), 1).fill(1.0);
        let target = ModelTargets {
            mel: Array3::zeros((2, 2, 2)),
            gate: Array2::zeros((2, 2)),
        };
        let breakdown = Tacotron2Loss::new(1.0)
            .compute(&outputs(mel_pred, Array2::zeros((2, 2))), &target)
            .unwrap();
        assert_eq!(breakdown.mel_loss_per_item[0], 0.0);
        assert_eq!(breakdown.mel_loss_per_item[1], 1.0);
        assert!((breakdown.mel_loss - 0.5).abs() < 1e-6);
        assert!(
            (breakdown.gate_loss
                - breakdown.gate_loss_per_item.mean().unwrap())
            .abs()
                < 1e-6
        );
    }

    #[test]
    fn postnet_output_counts_twice() {
        let target = ModelTargets {
            mel: Array3::zeros((1, 2, 2)),
            gate: Array2::zeros((1, 2)),
        };
        let mut pred = outputs(Array3::from_elem((1, 2, 2), 1.0), Array2::zeros((1, 2)));
        let single = Tacotron2Loss::new(1.0).compute(&pred, &target).unwrap();
        pred.mel_postnet = Some(Array3::from_elem((1, 2, 2), 1.0));
        let double = Tacotron2Loss::new(1.0).compute(&pred, &target).unwrap();
        assert!((double.mel_loss - 2.0 * single.mel_loss).abs() < 1e-6);
    }

    #[test]
    fn pos_weight_scales_positive_class_only() {
        let base = bce_with_logits(0.3, 1.0, 1.0);
        assert!((bce_with_logits(0.3, 1.0, 5.0) - 5.0 * base).abs() < 1e-6);
        assert_eq!(
            bce_with_logits(0.3, 0.0, 1.0),
            bce_with_logits(0.3, 0.0, 5.0)
        );
    }

    #[test]
    fn gradient_matches_finite_difference() {
        let eps = 1e-3f32;
        for (logit, target, pw) in [(0.7, 1.0, 4.0), (-1.2, 0.0, 4.0), (0.0, 1.0, 1.0)] {
            let analytic = bce_with_logits_grad(logit, target, pw);
            let numeric = (bce_with_logits(logit + eps, target, pw)
                - bce_with_logits(logit - eps, target, pw))
                / (2.0 * eps);
            assert!(
                (analytic - numeric).abs() < 1e-2,
                "logit {logit}: {analytic} vs {numeric}"
            );
        }
    }

    #[test]
    fn shape_mismatch_rejected() {
        let y = ModelTargets {
            mel: Array3::zeros((1, 2, 2)),
            gate: Array2::zeros((1, 2)),
        };
        let bad = outputs(Array3::zeros((1, 2, 3)), Array2::zeros((1, 2)));
        assert!(Tacotron2Loss::new(1.0).compute(&bad, &y).is_err());
    }
}
