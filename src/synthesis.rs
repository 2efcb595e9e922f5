//! End-to-end synthesis drivers: plain text-to-speech and rhythm transfer. Both are thin
//! orchestrations over the capability traits so any acoustic model / vocoder pairing works,
//! ONNX-backed or otherwise.
use crate::audio::MelExtractor;
use crate::model::{InferenceInputs, MelSynthesizer, RhythmSynthesizer, Vocoder};
use crate::text::{prepare_input_sequence, TextFrontend};
use ndarray::{concatenate, s, Array2, Axis};
use rand::Rng;
use tracing::info;

/// Synthesize `lines` of text into one continuous waveform.
///
/// The lines are batched through the model together, each utterance's mel trimmed to its
/// predicted length, and the mels concatenated back in the caller's line order before a single
/// vocoder pass. Output samples are scaled by `max_wav_value`.
pub fn tts<M, V, R, S>(
    lines: &[S],
    model: &M,
    vocoder: &V,
    frontend: &TextFrontend,
    speaker_id: i64,
    max_wav_value: f32,
    rng: &mut R,
) -> anyhow::Result<Vec<f32>>
where
    M: MelSynthesizer + ?Sized,
    V: Vocoder + ?Sized,
    R: Rng,
    S: AsRef<str>,
{
    let prepared = prepare_input_sequence(lines, frontend, rng)?;
    let batch = prepared.sequences.shape()[0];
    let speaker_ids = ndarray::Array1::from_elem(batch, speaker_id);
    let outputs = model.inference(&InferenceInputs {
        text: prepared.sequences,
        lengths: prepared.lengths,
        speaker_ids,
        f0: None,
    })?;

    // Rows come back sorted by input length; put the utterances back in line order.
    let mut row_of_line = vec![0usize; batch];
    for (row, &line) in prepared.order.iter().enumerate() {
        row_of_line[line] = row;
    }
    let n_mels = outputs.mel.shape()[1];
    let mut mel = Array2::zeros((n_mels, 0));
    for &row in &row_of_line {
        let frames = outputs.lengths[row] as usize;
        let trimmed = outputs.mel.slice(s![row, .., ..frames]);
        mel = concatenate(Axis(1), &[mel.view(), trimmed])?;
    }
    info!("Synthesized {} mel frames from {} lines", mel.shape()[1], batch);

    let audio = vocoder.infer(mel.view())?;
    Ok(audio.iter().map(|s| s * max_wav_value).collect())
}

/// Re-synthesize `text` in the model's voice while keeping the timing of `original_audio`.
///
/// The original audio's mel is force aligned against the text, then the model decodes the same
/// text pinned to that alignment. Single utterance only; the inputs are one clip and one
/// transcript by construction.
pub fn rhythm_transfer<M, V, R>(
    original_audio: &[f32],
    text: &str,
    model: &M,
    vocoder: &V,
    frontend: &TextFrontend,
    extractor: &MelExtractor,
    speaker_id: i64,
    max_wav_value: f32,
    rng: &mut R,
) -> anyhow::Result<Vec<f32>>
where
    M: RhythmSynthesizer + ?Sized,
    V: Vocoder + ?Sized,
    R: Rng,
{
    let prepared = prepare_input_sequence(&[text], frontend, rng)?;
    let reference_mel = extractor.mel_spectrogram(original_audio);
    let speaker_ids = ndarray::arr1(&[speaker_id]);

    let alignment = model.align(
        &prepared.sequences,
        &prepared.lengths,
        &reference_mel,
        &speaker_ids,
    )?;
    let mel = model.inference_with_alignment(
        &prepared.sequences,
        &prepared.lengths,
        &speaker_ids,
        &alignment,
    )?;
    info!(
        "Transferred rhythm across {} reference frames",
        reference_mel.shape()[1]
    );

    let audio = vocoder.infer(mel.view())?;
    Ok(audio.iter().map(|s| s * max_wav_value).collect())
}
