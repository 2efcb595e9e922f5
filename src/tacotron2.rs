//! Tacotron2 ONNX inference.
//!
//! The model ships as three graphs exported from the NVIDIA reference implementation with
//! `export_tacotron2_onnx.py`: an encoder, a single-step decoder and a postnet. The decoder
//! graph does one autoregressive step per run, so the loop here feeds each run's state outputs
//! straight back in as the next run's inputs and watches the gate logit for the stop signal.
//!
//! The exported graphs are single speaker and have no pitch input, so the speaker ids and f0 of
//! [`InferenceInputs`] are ignored. They also carry a fixed input window of 100 symbols (torch
//! JIT baked the dynamic length into a constant), hence the chunking in [`Tacotron2::inference`].
use crate::model::{InferenceInputs, InferenceOutputs, MelSynthesizer};
use anyhow::Context;
use ndarray::{concatenate, prelude::*};
use ort::{inputs, CPUExecutionProvider, GraphOptimizationLevel, Session, Tensor};
use std::path::Path;
use tracing::debug;

/// Fixed input window of the exported encoder graph.
const MAX_CHUNK: usize = 100;
const GATE_THRESHOLD: f32 = 0.6;
const MAX_DECODER_STEPS: usize = 1000;
const N_MEL_CHANNELS: usize = 80;

/// Sigmoid function, would have been done by the network but the ONNX split meant it was no
/// longer part of the graph.
fn sigmoid(x: f32) -> f32 {
    if x >= 0.0 {
        let x = -x;
        1.0 / (1.0 + x.exp())
    } else {
        x.exp() / (1.0 + x.exp())
    }
}

/// One chunk's worth of decoding before batch assembly.
struct ChunkOutput {
    /// `[n_mel_channels, frames]` after the postnet.
    mel: Array2<f32>,
    /// Raw gate logit per decoder step.
    gate: Vec<f32>,
    /// `[frames, chunk_len]` attention weights per step.
    alignment: Array2<f32>,
}

/// Handle to the tacotron2 ONNX graphs.
pub struct Tacotron2 {
    /// Encoder part of the transformer
    encoder: Session,
    /// Decoder update part
    decoder: Session,
    /// A post network to adjust the outputs
    postnet: Session,
}

/// The decoder state ran through each update step. The mask is false for every element of the
/// input sequence and true once the end is hit, so padded batches stop at their own sequence
/// end. The rest is LSTM hidden/cell state plus the attention bookkeeping that encourages the
/// model to move forward consistently through the input.
struct DecoderState {
    decoder_input: Array2<f32>,
    attention_hidden: Array2<f32>,
    attention_cell: Array2<f32>,
    decoder_hidden: Array2<f32>,
    decoder_cell: Array2<f32>,
    attention_weights: Array2<f32>,
    attention_weights_cum: Array2<f32>,
    attention_context: Array2<f32>,
    mask: Array2<bool>,
}

impl DecoderState {
    /// Creates a new decoder state given the output of the encoder network and the length of
    /// the sequence before padding.
    fn new(memory: &ArrayViewD<f32>, unpadded_len: usize) -> Self {
        let bs = memory.shape()[0];
        let seq_len = memory.shape()[1];
        let attention_rnn_dim = 1024;
        let decoder_rnn_dim = 1024;
        let encoder_embedding_dim = 512;

        let mut mask = Array2::from_elem((bs, seq_len), false);
        mask.slice_mut(s![.., unpadded_len..]).fill(true);

        Self {
            decoder_input: Array2::zeros((bs, N_MEL_CHANNELS)),
            attention_hidden: Array2::zeros((bs, attention_rnn_dim)),
            attention_cell: Array2::zeros((bs, attention_rnn_dim)),
            decoder_hidden: Array2::zeros((bs, decoder_rnn_dim)),
            decoder_cell: Array2::zeros((bs, decoder_rnn_dim)),
            attention_weights: Array2::zeros((bs, seq_len)),
            attention_weights_cum: Array2::zeros((bs, seq_len)),
            attention_context: Array2::zeros((bs, encoder_embedding_dim)),
            mask,
        }
    }
}

impl Tacotron2 {
    /// Load a tacotron2 model from a folder containing `encoder.onnx`, `decoder_iter.onnx` and
    /// `postnet.onnx`.
    pub fn load(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        // ort calls into a C++ library with its own global initialisation. It can be called
        // multiple times so loading two models doesn't need any coordination.
        ort::init()
            .with_name("polyvox")
            .with_execution_providers(&[CPUExecutionProvider::default().build()])
            .commit()?;

        let encoder = Session::builder()?
            .with_optimization_level(GraphOptimizationLevel::Level1)?
            .with_model_from_file(path.as_ref().join("encoder.onnx"))
            .context("converting encoder to runnable model")?;

        let decoder = Session::builder()?
            .with_optimization_level(GraphOptimizationLevel::Level1)?
            .with_model_from_file(path.as_ref().join("decoder_iter.onnx"))
            .context("converting decoder_iter to runnable model")?;

        let postnet = Session::builder()?
            .with_optimization_level(GraphOptimizationLevel::Level1)?
            .with_model_from_file(path.as_ref().join("postnet.onnx"))
            .context("converting postnet to runnable model")?;

        Ok(Self {
            encoder,
            decoder,
            postnet,
        })
    }

    /// Run the decoder stage of the network. This function would be fairly small if not for the
    /// amount of state that needs to be extracted from the model and fed back into it.
    fn run_decoder(
        &self,
        memory: &Array<f32, IxDyn>,
        processed_memory: &Array<f32, IxDyn>,
        unpadded_len: usize,
        state: &mut DecoderState,
    ) -> anyhow::Result<ChunkOutput> {
        let mut inputs = inputs![
            "decoder_input" => state.decoder_input.view(),
            "attention_hidden" => state.attention_hidden.view(),
            "attention_cell" => state.attention_cell.view(),
            "decoder_hidden" => state.decoder_hidden.view(),
            "decoder_cell" => state.decoder_cell.view(),
            "attention_weights" => state.attention_weights.view(),
            "attention_weights_cum" => state.attention_weights_cum.view(),
            "attention_context" => state.attention_context.view(),
            "memory" => memory.view(),
            "processed_memory" => processed_memory.view(),
            "mask" => state.mask.view()
        ]?;

        let mut mel_spec = Array2::zeros((0, 0));
        let mut gate = Vec::new();
        let mut alignment_rows: Vec<Array1<f32>> = Vec::new();

        // Always broken out of, but a hard upper bound keeps a model that never fires its gate
        // from looping forever.
        for i in 0..MAX_DECODER_STEPS {
            let mut infer = self.decoder.run(inputs)?;

            let gate_logit = {
                let gate_prediction = infer["gate_prediction"].extract_tensor::<f32>()?;
                gate_prediction.view()[[0, 0]]
            };
            gate.push(gate_logit);
            debug!("Gate: {}", gate_logit);

            {
                let mel_output = infer["decoder_output"].extract_tensor::<f32>()?;
                let mel_output = mel_output.view().clone().into_dimensionality()?;
                if i == 0 {
                    mel_spec = mel_output.to_owned();
                } else {
                    mel_spec = concatenate(Axis(0), &[mel_spec.view(), mel_output])
                        .context("Joining decoder iter output")?;
                }
                let weights = infer["out_attention_weights"].extract_tensor::<f32>()?;
                let weights = weights.view();
                alignment_rows.push(
                    weights
                        .index_axis(Axis(0), 0)
                        .slice(s![..unpadded_len])
                        .to_owned(),
                );
            }

            if sigmoid(gate_logit) > GATE_THRESHOLD || i + 1 == MAX_DECODER_STEPS {
                debug!("Stopping after {} steps", i);
                break;
            }
            // Prepare the inputs for the next run. The state tensors are moved out of the
            // inference output rather than copied.
            inputs = inputs![
                "memory" => memory.view(),
                "processed_memory" => processed_memory.view(),
                "mask" => state.mask.view(),
            ]?;
            inputs.insert("decoder_input", infer.remove("decoder_output").unwrap());
            inputs.insert(
                "attention_hidden",
                infer.remove("out_attention_hidden").unwrap(),
            );
            inputs.insert(
                "attention_cell",
                infer.remove("out_attention_cell").unwrap(),
            );
            inputs.insert(
                "decoder_hidden",
                infer.remove("out_decoder_hidden").unwrap(),
            );
            inputs.insert("decoder_cell", infer.remove("out_decoder_cell").unwrap());
            inputs.insert(
                "attention_weights",
                infer.remove("out_attention_weights").unwrap(),
            );
            inputs.insert(
                "attention_weights_cum",
                infer.remove("out_attention_weights_cum").unwrap(),
            );
            inputs.insert(
                "attention_context",
                infer.remove("out_attention_context").unwrap(),
            );
        }

        let frames = mel_spec.shape()[0];
        let mut alignment = Array2::zeros((frames, unpadded_len));
        for (row, weights) in alignment_rows.into_iter().enumerate() {
            alignment.row_mut(row).assign(&weights);
        }

        // Transpose and add a batch dimension for the postnet.
        let mel_spec = mel_spec.t().insert_axis(Axis(0));
        let post = self.postnet.run(inputs![mel_spec.view()]?)?;
        let mel = post["mel_outputs_postnet"]
            .extract_tensor::<f32>()?
            .view()
            .clone()
            .remove_axis(Axis(0))
            .into_dimensionality()?
            .into_owned();

        Ok(ChunkOutput {
            mel,
            gate,
            alignment,
        })
    }

    /// Run one chunk of at most [`MAX_CHUNK`] symbol ids through all three graphs.
    fn infer_chunk(&self, mut ids: Vec<i64>) -> anyhow::Result<ChunkOutput> {
        let units_len = ids.len();
        if units_len > MAX_CHUNK {
            anyhow::bail!("chunk of {} symbols exceeds the model window", units_len);
        }
        // The encoder LSTM fails below its baked-in sequence length, so pad up to the window.
        if ids.len() < MAX_CHUNK {
            ids.resize(MAX_CHUNK, 0);
        }

        let plen = arr1(&[ids.len() as i64]);
        let ids = Array2::from_shape_vec((1, ids.len()), ids).context("invalid dimensions")?;

        let encoder_outputs = self.encoder.run(inputs![ids, plen]?)?;
        // The outputs in order are: memory, processed_memory, lens.
        let memory: Tensor<f32> = encoder_outputs[0].extract_tensor()?;
        let processed_memory: Tensor<f32> = encoder_outputs[1].extract_tensor()?;

        let mut decoder_state = DecoderState::new(&memory.view(), units_len);
        let memory = memory.view().to_owned();
        let processed_memory = processed_memory.view().to_owned();

        self.run_decoder(&memory, &processed_memory, units_len, &mut decoder_state)
    }

    /// Run one utterance, splitting it into window-sized chunks and stitching the outputs back
    /// together. Alignment columns are offset by each chunk's start so the stitched matrix still
    /// maps decoder frames onto the full input sequence.
    fn infer_utterance(&self, ids: &[i64]) -> anyhow::Result<ChunkOutput> {
        let mut mel = Array2::zeros((N_MEL_CHANNELS, 0));
        let mut gate = Vec::new();
        let mut alignment = Array2::zeros((0, ids.len()));

        for (chunk_idx, chunk) in ids.chunks(MAX_CHUNK).enumerate() {
            let offset = chunk_idx * MAX_CHUNK;
            let out = self.infer_chunk(chunk.to_vec())?;

            mel = concatenate(Axis(1), &[mel.view(), out.mel.view()])
                .context("Joining inference chunk output")?;
            gate.extend(out.gate);

            let frames = out.alignment.shape()[0];
            let mut padded = Array2::zeros((frames, ids.len()));
            padded
                .slice_mut(s![.., offset..offset + chunk.len()])
                .assign(&out.alignment);
            alignment = concatenate(Axis(0), &[alignment.view(), padded.view()])
                .context("Joining chunk alignments")?;
        }
        Ok(ChunkOutput {
            mel,
            gate,
            alignment,
        })
    }
}

impl MelSynthesizer for Tacotron2 {
    /// Batched inference done one utterance at a time; the graphs were exported with batch size
    /// one. Outputs are padded to the longest utterance, `lengths` holds the real frame counts.
    fn inference(&self, input: &InferenceInputs) -> anyhow::Result<InferenceOutputs> {
        let batch = input.text.shape()[0];
        if batch == 0 {
            anyhow::bail!("empty inference batch");
        }
        let mut per_utterance = Vec::with_capacity(batch);
        for b in 0..batch {
            let len = input.lengths[b] as usize;
            let ids: Vec<i64> = input.text.slice(s![b, ..len]).to_vec();
            per_utterance.push(self.infer_utterance(&ids)?);
        }

        let max_frames = per_utterance
            .iter()
            .map(|o| o.mel.shape()[1])
            .max()
            .unwrap_or(0);
        let max_input = input.text.shape()[1];

        let mut mel = Array3::zeros((batch, N_MEL_CHANNELS, max_frames));
        let mut gate = Array2::zeros((batch, max_frames));
        let mut alignments = Array3::zeros((batch, max_frames, max_input));
        let mut lengths = Array1::zeros(batch);
        for (b, out) in per_utterance.into_iter().enumerate() {
            let frames = out.mel.shape()[1];
            lengths[b] = frames as i64;
            mel.slice_mut(s![b, .., ..frames]).assign(&out.mel);
            for (t, &logit) in out.gate.iter().enumerate() {
                gate[[b, t]] = logit;
            }
            alignments
                .slice_mut(s![b, ..out.alignment.shape()[0], ..out.alignment.shape()[1]])
                .assign(&out.alignment);
        }

        Ok(InferenceOutputs {
            mel,
            gate,
            alignments,
            lengths,
        })
    }
}
