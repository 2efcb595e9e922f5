//! Capability contracts between the training orchestrator and the neural networks it drives.
//!
//! The orchestrator never looks inside a network. It talks to an [`AcousticModel`] for the
//! forward pass, a [`TrainableModel`] for gradients and parameters, a [`Vocoder`] to turn mel
//! frames into audio, and a [`MelSampler`] for diagnostic synthesis. Anything satisfying the
//! traits plugs in, which is also how the test suite drives the loop with a hand-differentiated
//! model instead of a real network.
use ndarray::{Array1, Array2, Array3, ArrayD, ArrayView2};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// A collated batch fresh out of the data loader, before the model has split it into inputs and
/// targets and moved it wherever it wants it.
#[derive(Debug, Clone)]
pub struct RawBatch {
    /// `[batch, max_input_len]` symbol ids, zero padded.
    pub text_padded: Array2<i64>,
    pub input_lengths: Array1<i64>,
    /// `[batch, n_mel_channels, max_output_len]`, zero padded, length a multiple of the current
    /// frames-per-step.
    pub mel_padded: Array3<f32>,
    /// `[batch, max_output_len]`, 1.0 from each clip's final real frame onwards.
    pub gate_padded: Array2<f32>,
    pub output_lengths: Array1<i64>,
    pub speaker_ids: Array1<i64>,
    /// Optional pitch conditioning, `[batch, 1, max_output_len]`.
    pub f0: Option<Array3<f32>>,
}

/// Teacher-forced model inputs.
#[derive(Debug, Clone)]
pub struct ModelInputs {
    pub text_padded: Array2<i64>,
    pub input_lengths: Array1<i64>,
    /// Ground-truth mel frames fed to the decoder during teacher forcing.
    pub mel_padded: Array3<f32>,
    pub max_output_len: usize,
    pub output_lengths: Array1<i64>,
    pub speaker_ids: Array1<i64>,
    pub f0: Option<Array3<f32>>,
}

#[derive(Debug, Clone)]
pub struct ModelTargets {
    pub mel: Array3<f32>,
    pub gate: Array2<f32>,
}

/// Teacher-forced predictions.
#[derive(Debug, Clone)]
pub struct ModelOutputs {
    /// Decoder output, `[batch, n_mel_channels, frames]`.
    pub mel: Array3<f32>,
    /// Postnet-refined output where the model has one.
    pub mel_postnet: Option<Array3<f32>>,
    /// Gate logits, `[batch, frames]`.
    pub gate: Array2<f32>,
    /// Attention alignments, `[batch, frames, input_len]`.
    pub alignments: Option<Array3<f32>>,
}

#[derive(Debug, Clone)]
pub struct InferenceInputs {
    pub text: Array2<i64>,
    pub lengths: Array1<i64>,
    pub speaker_ids: Array1<i64>,
    pub f0: Option<Array3<f32>>,
}

#[derive(Debug, Clone)]
pub struct InferenceOutputs {
    pub mel: Array3<f32>,
    pub gate: Array2<f32>,
    pub alignments: Array3<f32>,
    /// Frames actually produced per utterance before padding.
    pub lengths: Array1<i64>,
}

/// Named parameter tensors, the unit of checkpoint exchange.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ModelState(pub BTreeMap<String, ArrayD<f32>>);

/// Autoregressive text-to-mel synthesis.
pub trait MelSynthesizer {
    fn inference(&self, input: &InferenceInputs) -> anyhow::Result<InferenceOutputs>;
}

/// The teacher-forced training surface of an acoustic model.
pub trait AcousticModel: MelSynthesizer {
    /// Split a raw batch into inputs and targets, placing tensors wherever the implementation
    /// computes. The default split covers models with no device placement of their own.
    fn parse_batch(&self, raw: RawBatch) -> (ModelInputs, ModelTargets) {
        let max_output_len = raw.mel_padded.shape()[2];
        let inputs = ModelInputs {
            text_padded: raw.text_padded,
            input_lengths: raw.input_lengths,
            mel_padded: raw.mel_padded.clone(),
            max_output_len,
            output_lengths: raw.output_lengths,
            speaker_ids: raw.speaker_ids,
            f0: raw.f0,
        };
        let targets = ModelTargets {
            mel: raw.mel_padded,
            gate: raw.gate_padded,
        };
        (inputs, targets)
    }

    fn forward(&mut self, x: &ModelInputs) -> anyhow::Result<ModelOutputs>;

    /// Switch decoding granularity: how many mel frames one decoder step emits.
    fn set_current_frames_per_step(&mut self, n: usize);

    /// Toggle training-only behaviours (dropout and friends).
    fn set_train(&mut self, training: bool);
}

/// Gradient access on top of [`AcousticModel`]. How the gradients are computed is the model's
/// business; the trainer only scales, clips and hands them to the optimizer.
pub trait TrainableModel: AcousticModel {
    fn zero_grad(&mut self);

    /// Accumulate gradients of the training loss (scaled by `loss_scale`) into the model.
    fn backward(
        &mut self,
        x: &ModelInputs,
        y_pred: &ModelOutputs,
        y: &ModelTargets,
        loss_scale: f32,
    ) -> anyhow::Result<()>;

    /// Visit every gradient tensor mutably, in a stable order.
    fn visit_gradients(&mut self, f: &mut dyn FnMut(&str, &mut ArrayD<f32>));

    /// Visit every parameter with its gradient, in the same stable order.
    fn visit_parameters(&mut self, f: &mut dyn FnMut(&str, &mut ArrayD<f32>, &ArrayD<f32>));

    fn state_dict(&self) -> ModelState;

    fn load_state_dict(&mut self, state: &ModelState) -> anyhow::Result<()>;
}

/// Alignment-constrained synthesis for rhythm transfer: derive a forced alignment from a
/// reference mel, then re-synthesise the same text pinned to that alignment.
pub trait RhythmSynthesizer {
    /// Forced alignment between the text and a reference mel, `[frames, input_len]`.
    fn align(
        &self,
        text: &Array2<i64>,
        lengths: &Array1<i64>,
        reference_mel: &Array2<f32>,
        speaker_ids: &Array1<i64>,
    ) -> anyhow::Result<Array2<f32>>;

    /// Synthesis with the attention fixed to the supplied alignment rather than computed.
    fn inference_with_alignment(
        &self,
        text: &Array2<i64>,
        lengths: &Array1<i64>,
        speaker_ids: &Array1<i64>,
        alignment: &Array2<f32>,
    ) -> anyhow::Result<Array2<f32>>;
}

/// Mel frames to waveform.
pub trait Vocoder {
    /// `mel` is `[n_mel_channels, frames]`; the result is mono samples in [-1, 1].
    fn infer(&self, mel: ArrayView2<f32>) -> anyhow::Result<Vec<f32>>;
}

/// Mel-to-audio capability for sampling diagnostics. Separate from [`Vocoder`] so a trainer can
/// be handed a cheap approximation while the real vocoder trains elsewhere.
pub trait MelSampler {
    fn sample(&self, mel: ArrayView2<f32>) -> anyhow::Result<Vec<f32>>;
}

impl<V: Vocoder> MelSampler for V {
    fn sample(&self, mel: ArrayView2<f32>) -> anyhow::Result<Vec<f32>> {
        self.infer(mel)
    }
}
