//! Optimisation: Adam with decoupled weight decay, global gradient-norm clipping and the
//! dynamic loss scaler used for mixed-precision runs. The optimizer talks to models purely
//! through the [`TrainableModel`] visitor methods so its moment buffers stay keyed by parameter
//! name and survive checkpointing.
use crate::model::TrainableModel;
use ndarray::ArrayD;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use tracing::warn;

/// Adam moment buffers, serialised into checkpoints alongside the model weights.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AdamState {
    pub step: u64,
    pub exp_avg: BTreeMap<String, ArrayD<f32>>,
    pub exp_avg_sq: BTreeMap<String, ArrayD<f32>>,
}

#[derive(Debug, Clone)]
pub struct Adam {
    pub learning_rate: f32,
    pub weight_decay: f32,
    beta1: f32,
    beta2: f32,
    eps: f32,
    state: AdamState,
}

impl Adam {
    pub fn new(learning_rate: f32, weight_decay: f32) -> Self {
        Self {
            learning_rate,
            weight_decay,
            beta1: 0.9,
            beta2: 0.999,
            eps: 1e-8,
            state: AdamState::default(),
        }
    }

    pub fn state(&self) -> &AdamState {
        &self.state
    }

    pub fn load_state(&mut self, state: AdamState) {
        self.state = state;
    }

    /// One optimisation step over every parameter the model exposes. Moment buffers for
    /// parameters seen for the first time are zero initialised lazily.
    pub fn step(&mut self, model: &mut dyn TrainableModel) {
        self.state.step += 1;
        let step = self.state.step;
        let bias1 = 1.0 - self.beta1.powi(step as i32);
        let bias2 = 1.0 - self.beta2.powi(step as i32);
        let lr = self.learning_rate;
        let wd = self.weight_decay;
        let (beta1, beta2, eps) = (self.beta1, self.beta2, self.eps);
        let state = &mut self.state;

        model.visit_parameters(&mut |name, param, grad| {
            let m = state
                .exp_avg
                .entry(name.to_string())
                .or_insert_with(|| ArrayD::zeros(grad.raw_dim()));
            let v = state
                .exp_avg_sq
                .entry(name.to_string())
                .or_insert_with(|| ArrayD::zeros(grad.raw_dim()));

            ndarray::Zip::from(param)
                .and(m)
                .and(v)
                .and(grad)
                .for_each(|p, m, v, &g| {
                    // Decoupled weight decay, applied to the parameter not the gradient.
                    let g = g + wd * *p;
                    *m = beta1 * *m + (1.0 - beta1) * g;
                    *v = beta2 * *v + (1.0 - beta2) * g * g;
                    let m_hat = *m / bias1;
                    let v_hat = *v / bias2;
                    *p -= lr * m_hat / (v_hat.sqrt() + eps);
                });
        });
    }
}

/// Clip gradients to a maximum global L2 norm, returning the norm before clipping.
pub fn clip_grad_norm(model: &mut dyn TrainableModel, max_norm: f32) -> f32 {
    let mut sum_sq = 0.0f64;
    model.visit_gradients(&mut |_, grad| {
        sum_sq += grad.iter().map(|&g| (g as f64) * (g as f64)).sum::<f64>();
    });
    let total_norm = (sum_sq.sqrt()) as f32;
    if total_norm > max_norm && total_norm.is_finite() && total_norm > 0.0 {
        let scale = max_norm / total_norm;
        model.visit_gradients(&mut |_, grad| grad.mapv_inplace(|g| g * scale));
    }
    total_norm
}

const SCALER_INIT: f32 = 65536.0;
const SCALER_GROWTH_FACTOR: f32 = 2.0;
const SCALER_BACKOFF_FACTOR: f32 = 0.5;
const SCALER_GROWTH_INTERVAL: u64 = 2000;

/// Dynamic loss scaling for reduced-precision training. Gradients are computed on the scaled
/// loss; the scaler unscales them, skips the step if any were non-finite, and adapts the scale.
#[derive(Debug, Clone)]
pub struct GradScaler {
    scale: f32,
    good_steps: u64,
}

impl Default for GradScaler {
    fn default() -> Self {
        Self {
            scale: SCALER_INIT,
            good_steps: 0,
        }
    }
}

impl GradScaler {
    pub fn scale(&self) -> f32 {
        self.scale
    }

    /// Unscale gradients in place. Returns false when a non-finite gradient turned up, in which
    /// case the caller must skip the optimizer step.
    pub fn unscale(&self, model: &mut dyn TrainableModel) -> bool {
        let inv = 1.0 / self.scale;
        let mut finite = true;
        model.visit_gradients(&mut |_, grad| {
            grad.mapv_inplace(|g| g * inv);
            if !grad.iter().all(|g| g.is_finite()) {
                finite = false;
            }
        });
        finite
    }

    pub fn update(&mut self, step_was_finite: bool) {
        if step_was_finite {
            self.good_steps += 1;
            if self.good_steps >= SCALER_GROWTH_INTERVAL {
                self.scale *= SCALER_GROWTH_FACTOR;
                self.good_steps = 0;
            }
        } else {
            self.scale = (self.scale * SCALER_BACKOFF_FACTOR).max(1.0);
            self.good_steps = 0;
        }
    }
}

/// How one optimisation step runs after `backward`: plain, or guarded by a loss scaler.
pub trait StepStrategy {
    /// Factor applied to the loss before gradients are taken.
    fn loss_scale(&self) -> f32 {
        1.0
    }

    /// Clip and step. Returns the pre-clip gradient norm, or `None` if the step was skipped.
    fn step(
        &mut self,
        model: &mut dyn TrainableModel,
        optimizer: &mut Adam,
        grad_clip_thresh: f32,
    ) -> Option<f32>;
}

#[derive(Debug, Default)]
pub struct PlainStep;

impl StepStrategy for PlainStep {
    fn step(
        &mut self,
        model: &mut dyn TrainableModel,
        optimizer: &mut Adam,
        grad_clip_thresh: f32,
    ) -> Option<f32> {
        let norm = clip_grad_norm(model, grad_clip_thresh);
        optimizer.step(model);
        Some(norm)
    }
}

#[derive(Debug, Default)]
pub struct ScaledStep {
    scaler: GradScaler,
}

impl StepStrategy for ScaledStep {
    fn loss_scale(&self) -> f32 {
        self.scaler.scale()
    }

    fn step(
        &mut self,
        model: &mut dyn TrainableModel,
        optimizer: &mut Adam,
        grad_clip_thresh: f32,
    ) -> Option<f32> {
        let finite = self.scaler.unscale(model);
        let result = if finite {
            let norm = clip_grad_norm(model, grad_clip_thresh);
            optimizer.step(model);
            Some(norm)
        } else {
            warn!(
                "Non-finite gradients, skipping step and dropping loss scale to {}",
                self.scaler.scale() * SCALER_BACKOFF_FACTOR
            );
            None
        };
        self.scaler.update(finite);
        result
    }
}
