//! Audio IO and mel-spectrogram extraction.
//!
//! The STFT is a plain Hann-windowed, centre-padded transform and the filterbank follows the
//! slaney mel scale with area normalisation, matching what the Tacotron2 training recipes use.
//! Getting these parameters wrong doesn't error, it produces pitch shifted or demonic sounding
//! audio, so the defaults here are the published Tacotron2 ones.
use anyhow::Context;
use hound::{SampleFormat, WavReader, WavSpec, WavWriter};
use ndarray::Array2;
use rustfft::num_complex::Complex32;
use rustfft::{Fft, FftPlanner};
use std::path::Path;
use std::sync::Arc;

/// Floor applied before the log so silence doesn't become negative infinity.
const LOG_CLAMP: f32 = 1e-5;

#[derive(Debug, Clone, PartialEq)]
pub struct MelConfig {
    pub sampling_rate: u32,
    pub filter_length: usize,
    pub hop_length: usize,
    pub win_length: usize,
    pub n_mel_channels: usize,
    pub mel_fmin: f32,
    pub mel_fmax: f32,
}

impl Default for MelConfig {
    fn default() -> Self {
        Self {
            sampling_rate: 22050,
            filter_length: 1024,
            hop_length: 256,
            win_length: 1024,
            n_mel_channels: 80,
            mel_fmin: 0.0,
            mel_fmax: 8000.0,
        }
    }
}

pub struct MelExtractor {
    config: MelConfig,
    fft: Arc<dyn Fft<f32>>,
    window: Vec<f32>,
    mel_basis: Array2<f32>,
}

impl std::fmt::Debug for MelExtractor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MelExtractor")
            .field("config", &self.config)
            .finish()
    }
}

impl Clone for MelExtractor {
    fn clone(&self) -> Self {
        Self::new(self.config.clone())
    }
}

impl MelExtractor {
    pub fn new(config: MelConfig) -> Self {
        let mut planner = FftPlanner::new();
        let fft = planner.plan_fft_forward(config.filter_length);
        let window = hann_window(config.win_length);
        let mel_basis = mel_filter_bank(
            config.sampling_rate as f32,
            config.filter_length,
            config.n_mel_channels,
            config.mel_fmin,
            config.mel_fmax,
        );
        Self {
            config,
            fft,
            window,
            mel_basis,
        }
    }

    pub fn config(&self) -> &MelConfig {
        &self.config
    }

    /// Log mel spectrogram of a mono signal, shaped `[n_mel_channels, frames]`.
    pub fn mel_spectrogram(&self, audio: &[f32]) -> Array2<f32> {
        let n_fft = self.config.filter_length;
        let hop = self.config.hop_length;
        let win = self.config.win_length;
        let n_bins = n_fft / 2 + 1;

        // Centre the first window on sample zero by reflect padding.
        let pad = n_fft / 2;
        let mut padded = Vec::with_capacity(audio.len() + 2 * pad);
        for i in (1..=pad).rev() {
            padded.push(*audio.get(i).unwrap_or(&0.0));
        }
        padded.extend_from_slice(audio);
        for i in 1..=pad {
            let idx = audio.len().saturating_sub(i + 1);
            padded.push(*audio.get(idx).unwrap_or(&0.0));
        }

        let n_frames = if padded.len() < win {
            1
        } else {
            1 + (padded.len() - win) / hop
        };

        let mut magnitudes = Array2::zeros((n_bins, n_frames));
        let mut buffer = vec![Complex32::default(); n_fft];
        for frame in 0..n_frames {
            let start = frame * hop;
            for (i, slot) in buffer.iter_mut().enumerate() {
                let sample = if i < win {
                    padded.get(start + i).copied().unwrap_or(0.0) * self.window[i]
                } else {
                    0.0
                };
                *slot = Complex32::new(sample, 0.0);
            }
            self.fft.process(&mut buffer);
            for bin in 0..n_bins {
                magnitudes[[bin, frame]] = buffer[bin].norm();
            }
        }

        let mut mel = self.mel_basis.dot(&magnitudes);
        mel.mapv_inplace(|x| x.max(LOG_CLAMP).ln());
        mel
    }
}

fn hann_window(len: usize) -> Vec<f32> {
    (0..len)
        .map(|i| {
            let x = (std::f32::consts::PI * i as f32 / len as f32).sin();
            x * x
        })
        .collect()
}

// Slaney mel scale: linear below 1 kHz, logarithmic above.
fn hz_to_mel(f: f32) -> f32 {
    const MIN_LOG_HZ: f32 = 1000.0;
    const MIN_LOG_MEL: f32 = 15.0;
    if f < MIN_LOG_HZ {
        f * 3.0 / 200.0
    } else {
        MIN_LOG_MEL + (f / MIN_LOG_HZ).ln() * 27.0 / 6.4f32.ln()
    }
}

fn mel_to_hz(mel: f32) -> f32 {
    const MIN_LOG_MEL: f32 = 15.0;
    if mel < MIN_LOG_MEL {
        mel * 200.0 / 3.0
    } else {
        1000.0 * ((mel - MIN_LOG_MEL) * 6.4f32.ln() / 27.0).exp()
    }
}

/// Triangular, area normalised mel filterbank shaped `[n_mels, n_fft / 2 + 1]`.
pub fn mel_filter_bank(
    sampling_rate: f32,
    n_fft: usize,
    n_mels: usize,
    fmin: f32,
    fmax: f32,
) -> Array2<f32> {
    let n_bins = n_fft / 2 + 1;
    let fft_freqs: Vec<f32> = (0..n_bins)
        .map(|i| i as f32 * sampling_rate / n_fft as f32)
        .collect();

    let mel_min = hz_to_mel(fmin);
    let mel_max = hz_to_mel(fmax);
    let band_edges: Vec<f32> = (0..n_mels + 2)
        .map(|i| mel_to_hz(mel_min + (mel_max - mel_min) * i as f32 / (n_mels + 1) as f32))
        .collect();

    let mut weights = Array2::zeros((n_mels, n_bins));
    for m in 0..n_mels {
        let (lower, centre, upper) = (band_edges[m], band_edges[m + 1], band_edges[m + 2]);
        let norm = 2.0 / (upper - lower);
        for (bin, &freq) in fft_freqs.iter().enumerate() {
            let rising = (freq - lower) / (centre - lower);
            let falling = (upper - freq) / (upper - centre);
            let weight = rising.min(falling).max(0.0);
            weights[[m, bin]] = weight * norm;
        }
    }
    weights
}

/// Read a WAV file as mono f32 samples in [-1, 1] plus its sample rate. Multi-channel audio is
/// mixed down by averaging.
pub fn read_wav(path: impl AsRef<Path>) -> anyhow::Result<(Vec<f32>, u32)> {
    let reader = WavReader::open(path.as_ref())
        .with_context(|| format!("opening {}", path.as_ref().display()))?;
    let spec = reader.spec();
    let channels = spec.channels as usize;
    let samples: Vec<f32> = match spec.sample_format {
        SampleFormat::Int => {
            let max = (1i64 << (spec.bits_per_sample - 1)) as f32;
            reader
                .into_samples::<i32>()
                .map(|s| s.map(|v| v as f32 / max))
                .collect::<Result<_, _>>()?
        }
        SampleFormat::Float => reader
            .into_samples::<f32>()
            .collect::<Result<_, _>>()?,
    };
    if channels <= 1 {
        return Ok((samples, spec.sample_rate));
    }
    let mono = samples
        .chunks(channels)
        .map(|frame| frame.iter().sum::<f32>() / channels as f32)
        .collect();
    Ok((mono, spec.sample_rate))
}

/// Write mono 16-bit WAV from floats in [-1, 1].
pub fn write_wav(path: impl AsRef<Path>, samples: &[f32], sample_rate: u32) -> anyhow::Result<()> {
    let spec = WavSpec {
        channels: 1,
        sample_rate,
        bits_per_sample: 16,
        sample_format: SampleFormat::Int,
    };
    let mut writer = WavWriter::create(path.as_ref(), spec)
        .with_context(|| format!("creating {}", path.as_ref().display()))?;
    for sample in samples {
        writer.write_sample((sample.clamp(-1.0, 1.0) * i16::MAX as f32) as i16)?;
    }
    writer.finalize()?;
    Ok(())
}

/// Frames the extractor will produce for a signal of the given sample count.
pub fn frames_for_samples(config: &MelConfig, samples: usize) -> usize {
    let padded = samples + config.filter_length;
    if padded < config.win_length {
        1
    } else {
        1 + (padded - config.win_length) / config.hop_length
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn filterbank_covers_band() {
        let basis = mel_filter_bank(22050.0, 1024, 80, 0.0, 8000.0);
        assert_eq!(basis.shape(), &[80, 513]);
        // Every filter has some support.
        for m in 0..80 {
            let total: f32 = basis.row(m).sum();
            assert!(total > 0.0, "filter {m} is empty");
        }
        // Bins above fmax stay silent.
        let top_bin = 512;
        for m in 0..80 {
            assert_eq!(basis[[m, top_bin]], 0.0);
        }
    }

    #[test]
    fn sine_concentrates_energy() {
        let config = MelConfig::default();
        let extractor = MelExtractor::new(config.clone());
        let freq = 440.0f32;
        let audio: Vec<f32> = (0..22050)
            .map(|i| (2.0 * std::f32::consts::PI * freq * i as f32 / 22050.0).sin())
            .collect();
        let mel = extractor.mel_spectrogram(&audio);
        assert_eq!(mel.shape()[0], 80);
        assert_eq!(mel.shape()[1], frames_for_samples(&config, audio.len()));

        // The per-channel mean should peak in a low channel for a 440 Hz tone.
        let means: Vec<f32> = (0..80).map(|m| mel.row(m).mean().unwrap()).collect();
        let peak = means
            .iter()
            .enumerate()
            .max_by(|a, b| a.1.partial_cmp(b.1).unwrap())
            .unwrap()
            .0;
        assert!(peak < 20, "expected a low-channel peak, got {peak}");
    }

    #[test]
    fn silence_hits_log_floor() {
        let extractor = MelExtractor::new(MelConfig::default());
        let mel = extractor.mel_spectrogram(&vec![0.0; 4096]);
        let floor = LOG_CLAMP.ln();
        for v in mel.iter() {
            assert!((v - floor).abs() < 1e-4);
        }
    }

    #[test]
    fn wav_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("tone.wav");
        let samples: Vec<f32> = (0..100).map(|i| (i as f32 / 100.0).sin()).collect();
        write_wav(&path, &samples, 22050).unwrap();
        let (back, rate) = read_wav(&path).unwrap();
        assert_eq!(rate, 22050);
        assert_eq!(back.len(), samples.len());
        for (a, b) in back.iter().zip(samples.iter()) {
            assert!((a - b).abs() < 1e-3);
        }
    }
}
