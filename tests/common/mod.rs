//! Shared fixtures for the training-loop tests: a hand-differentiated toy model, an in-memory
//! logger and dataset builders. The model predicts one bias per mel channel and a single gate
//! bias, so its gradients are exact and the optimizer trajectory is fully deterministic.
use ndarray::{Array1, Array2, Array3, ArrayD, Axis, IxDyn};
use polyvox::audio::{MelConfig, MelExtractor};
use polyvox::logging::TrainingLogger;
use polyvox::loss::bce_with_logits_grad;
use polyvox::model::{
    AcousticModel, InferenceInputs, InferenceOutputs, MelSampler, MelSynthesizer, ModelInputs,
    ModelOutputs, ModelState, ModelTargets, TrainableModel,
};
use polyvox::text::TextFrontend;

pub const N_MELS: usize = 4;
const INFERENCE_FRAMES: usize = 20;

/// Predicts `mel[b, c, t] = mel_bias[c]` and `gate[b, t] = gate_bias`. The training loss over
/// these predictions is differentiable by hand, which is what `backward` implements.
#[derive(Debug, Clone)]
pub struct BiasModel {
    mel_bias: ArrayD<f32>,
    gate_bias: ArrayD<f32>,
    mel_grad: ArrayD<f32>,
    gate_grad: ArrayD<f32>,
    pos_weight: f32,
    pub current_frames_per_step: usize,
    pub training: bool,
    pub fail_inference: bool,
}

impl BiasModel {
    pub fn new(pos_weight: f32) -> Self {
        Self {
            mel_bias: ArrayD::zeros(IxDyn(&[N_MELS])),
            gate_bias: ArrayD::zeros(IxDyn(&[1])),
            mel_grad: ArrayD::zeros(IxDyn(&[N_MELS])),
            gate_grad: ArrayD::zeros(IxDyn(&[1])),
            pos_weight,
            current_frames_per_step: 1,
            training: false,
            fail_inference: false,
        }
    }
}

impl MelSynthesizer for BiasModel {
    fn inference(&self, input: &InferenceInputs) -> anyhow::Result<InferenceOutputs> {
        if self.fail_inference {
            anyhow::bail!("inference unavailable");
        }
        let batch = input.text.shape()[0];
        let input_len = input.text.shape()[1];
        let mut mel = Array3::zeros((batch, N_MELS, INFERENCE_FRAMES));
        for c in 0..N_MELS {
            mel.index_axis_mut(Axis(1), c).fill(self.mel_bias[c]);
        }
        Ok(InferenceOutputs {
            mel,
            gate: Array2::from_elem((batch, INFERENCE_FRAMES), self.gate_bias[0]),
            alignments: Array3::zeros((batch, INFERENCE_FRAMES, input_len)),
            lengths: Array1::from_elem(batch, INFERENCE_FRAMES as i64),
        })
    }
}

impl AcousticModel for BiasModel {
    fn forward(&mut self, x: &ModelInputs) -> anyhow::Result<ModelOutputs> {
        let batch = x.mel_padded.shape()[0];
        let frames = x.mel_padded.shape()[2];
        let mut mel = Array3::zeros((batch, N_MELS, frames));
        for c in 0..N_MELS {
            mel.index_axis_mut(Axis(1), c).fill(self.mel_bias[c]);
        }
        Ok(ModelOutputs {
            mel,
            mel_postnet: None,
            gate: Array2::from_elem((batch, frames), self.gate_bias[0]),
            alignments: None,
        })
    }

    fn set_current_frames_per_step(&mut self, n: usize) {
        self.current_frames_per_step = n;
    }

    fn set_train(&mut self, training: bool) {
        self.training = training;
    }
}

impl TrainableModel for BiasModel {
    fn zero_grad(&mut self) {
        self.mel_grad.fill(0.0);
        self.gate_grad.fill(0.0);
    }

    fn backward(
        &mut self,
        _x: &ModelInputs,
        y_pred: &ModelOutputs,
        y: &ModelTargets,
        loss_scale: f32,
    ) -> anyhow::Result<()> {
        let batch = y.mel.shape()[0];
        let frames = y.mel.shape()[2];

        // d/d mel_bias[c] of the batch-mean MSE: mean over items and frames of
        // 2 * (bias[c] - target) / n_mels.
        for c in 0..N_MELS {
            let mut grad = 0.0f32;
            for b in 0..batch {
                for t in 0..frames {
                    grad += 2.0 * (y_pred.mel[[b, c, t]] - y.mel[[b, c, t]]);
                }
            }
            self.mel_grad[c] +=
                loss_scale * grad / (batch * frames * N_MELS) as f32;
        }

        let mut gate_grad = 0.0f32;
        for b in 0..batch {
            for t in 0..frames {
                gate_grad +=
                    bce_with_logits_grad(y_pred.gate[[b, t]], y.gate[[b, t]], self.pos_weight);
            }
        }
        self.gate_grad[0] += loss_scale * gate_grad / (batch * frames) as f32;
        Ok(())
    }

    fn visit_gradients(&mut self, f: &mut dyn FnMut(&str, &mut ArrayD<f32>)) {
        f("gate_bias", &mut self.gate_grad);
        f("mel_bias", &mut self.mel_grad);
    }

    fn visit_parameters(&mut self, f: &mut dyn FnMut(&str, &mut ArrayD<f32>, &ArrayD<f32>)) {
        f("gate_bias", &mut self.gate_bias, &self.gate_grad);
        f("mel_bias", &mut self.mel_bias, &self.mel_grad);
    }

    fn state_dict(&self) -> ModelState {
        let mut map = std::collections::BTreeMap::new();
        map.insert("mel_bias".to_string(), self.mel_bias.clone());
        map.insert("gate_bias".to_string(), self.gate_bias.clone());
        ModelState(map)
    }

    fn load_state_dict(&mut self, state: &ModelState) -> anyhow::Result<()> {
        for (name, slot) in [
            ("mel_bias", &mut self.mel_bias),
            ("gate_bias", &mut self.gate_bias),
        ] {
            let tensor = state
                .0
                .get(name)
                .ok_or_else(|| anyhow::anyhow!("checkpoint is missing {name}"))?;
            if tensor.shape() != slot.shape() {
                anyhow::bail!(
                    "{name} has shape {:?}, expected {:?}",
                    tensor.shape(),
                    slot.shape()
                );
            }
            slot.assign(tensor);
        }
        Ok(())
    }
}

/// Captures everything logged so tests can assert on tags and values.
#[derive(Debug, Default)]
pub struct VecLogger {
    pub scalars: Vec<(String, u64, f32)>,
    pub audio_tags: Vec<(String, u64)>,
    pub image_tags: Vec<(String, u64)>,
}

impl VecLogger {
    pub fn scalar_values(&self, tag: &str) -> Vec<f32> {
        self.scalars
            .iter()
            .filter(|(t, _, _)| t == tag)
            .map(|(_, _, v)| *v)
            .collect()
    }
}

impl TrainingLogger for VecLogger {
    fn scalar(&mut self, tag: &str, step: u64, value: f32) {
        self.scalars.push((tag.to_string(), step, value));
    }

    fn audio(&mut self, tag: &str, step: u64, _samples: &[f32], _sample_rate: u32) {
        self.audio_tags.push((tag.to_string(), step));
    }

    fn image(&mut self, tag: &str, step: u64, _data: ndarray::ArrayView2<f32>) {
        self.image_tags.push((tag.to_string(), step));
    }
}

/// A vocoder stand-in that maps each mel frame to one sample.
pub struct FrameSampler;

impl MelSampler for FrameSampler {
    fn sample(&self, mel: ndarray::ArrayView2<f32>) -> anyhow::Result<Vec<f32>> {
        Ok(mel.row(0).to_vec())
    }
}

pub fn frontend() -> TextFrontend {
    TextFrontend::new(vec!["english_cleaners".to_string()]).unwrap()
}

/// An in-memory dataset of `n` items with deterministic, distinct targets.
pub fn toy_dataset(n: usize, frames: usize) -> polyvox::dataset::TextMelDataset {
    let items = (0..n)
        .map(|i| polyvox::dataset::DatasetItem {
            sequence: vec![12, 38, 11, 40 + i as i64],
            mel: Array2::from_elem((N_MELS, frames), i as f32 * 0.1),
            speaker_id: (i % 2) as i64,
        })
        .collect();
    polyvox::dataset::TextMelDataset::from_items(
        items,
        frontend(),
        MelExtractor::new(MelConfig::default()),
    )
}
