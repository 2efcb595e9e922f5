//! Training configuration. Loaded from JSON, validated up front so a bad run dies before it
//! allocates a dataset or a model.
use crate::error::Error;
use serde::{Deserialize, Serialize};
use std::fs::File;
use std::io::BufReader;
use std::path::{Path, PathBuf};

/// One entry of the frames-per-step curriculum. The entry is active until `until_step`, an unset
/// `until_step` means active for the rest of training.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReductionWindow {
    pub until_step: Option<u64>,
    pub n_frames_per_step: usize,
    pub batch_size: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TrainingConfig {
    /// Filelist of `audio path|transcript|speaker id` lines used for training.
    pub audiopaths_and_text: PathBuf,
    /// Held-out filelist for validation.
    pub validation_audiopaths_and_text: Option<PathBuf>,
    /// Directory checkpoints are written into.
    pub checkpoint_path: PathBuf,
    pub epochs: usize,
    pub epochs_per_checkpoint: usize,
    pub sampling_rate: u32,
    pub filter_length: usize,
    pub hop_length: usize,
    pub win_length: usize,
    pub mel_fmin: f32,
    pub mel_fmax: f32,
    pub n_mel_channels: usize,
    pub max_wav_value: f32,
    pub text_cleaners: Vec<String>,
    /// Probability a known word is fed to the model as ARPA phones rather than characters.
    pub p_arpabet: f32,
    /// Positive-class weight of the gate loss. Keep above 5 or clips tend to stretch on.
    pub pos_weight: f32,
    pub batch_size: usize,
    pub learning_rate: f32,
    pub weight_decay: f32,
    pub grad_clip_thresh: f32,
    pub fp16_run: bool,
    pub distributed_run: bool,
    /// Debug mode skips validation entirely so the loop can be iterated on quickly.
    pub debug: bool,
    pub n_frames_per_step_initial: usize,
    pub reduction_window_schedule: Vec<ReductionWindow>,
    /// Checkpoint to warm start from. Missing optional fields in it keep their defaults.
    pub warm_start_name: Option<PathBuf>,
    pub n_speakers: usize,
    /// Pool sample inference picks speakers from. Empty means any speaker id.
    pub sample_inference_speaker_ids: Vec<i64>,
    pub include_f0: bool,
    pub seed: u64,
}

impl Default for TrainingConfig {
    fn default() -> Self {
        Self {
            audiopaths_and_text: PathBuf::new(),
            validation_audiopaths_and_text: None,
            checkpoint_path: PathBuf::from("checkpoints"),
            epochs: 500,
            epochs_per_checkpoint: 10,
            sampling_rate: 22050,
            filter_length: 1024,
            hop_length: 256,
            win_length: 1024,
            mel_fmin: 0.0,
            mel_fmax: 8000.0,
            n_mel_channels: 80,
            max_wav_value: 32768.0,
            text_cleaners: vec!["english_cleaners".to_string()],
            p_arpabet: 0.0,
            pos_weight: 10.0,
            batch_size: 32,
            learning_rate: 1e-3,
            weight_decay: 1e-6,
            grad_clip_thresh: 1.0,
            fp16_run: false,
            distributed_run: false,
            debug: false,
            n_frames_per_step_initial: 1,
            reduction_window_schedule: vec![],
            warm_start_name: None,
            n_speakers: 1,
            sample_inference_speaker_ids: vec![],
            include_f0: false,
            seed: 1234,
        }
    }
}

impl TrainingConfig {
    pub fn open(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let file = File::open(path.as_ref())?;
        let config: Self = serde_json::from_reader(BufReader::new(file))?;
        config.validate()?;
        Ok(config)
    }

    /// Fail-fast check of the hyperparameters the trainer requires. Mirrors the required list of
    /// the checkpoint trainer plus well-formedness of the curriculum schedule.
    pub fn validate(&self) -> Result<(), Error> {
        if self.audiopaths_and_text.as_os_str().is_empty() {
            return Err(Error::Config("audiopaths_and_text is required".into()));
        }
        if self.checkpoint_path.as_os_str().is_empty() {
            return Err(Error::Config("checkpoint_path is required".into()));
        }
        if self.epochs == 0 {
            return Err(Error::Config("epochs must be at least 1".into()));
        }
        if self.epochs_per_checkpoint == 0 {
            return Err(Error::Config("epochs_per_checkpoint must be at least 1".into()));
        }
        if self.n_mel_channels == 0 {
            return Err(Error::Config("n_mel_channels must be at least 1".into()));
        }
        if self.mel_fmin >= self.mel_fmax {
            return Err(Error::Config(format!(
                "mel_fmin ({}) must be below mel_fmax ({})",
                self.mel_fmin, self.mel_fmax
            )));
        }
        if self.text_cleaners.is_empty() {
            return Err(Error::Config("at least one text cleaner is required".into()));
        }
        if !(0.0..=1.0).contains(&self.p_arpabet) {
            return Err(Error::Config("p_arpabet must be within [0, 1]".into()));
        }
        if self.pos_weight <= 0.0 {
            return Err(Error::Config("pos_weight must be positive".into()));
        }
        if self.batch_size == 0 {
            return Err(Error::Config("batch_size must be at least 1".into()));
        }
        if self.learning_rate <= 0.0 {
            return Err(Error::Config("learning_rate must be positive".into()));
        }
        if self.grad_clip_thresh <= 0.0 {
            return Err(Error::Config("grad_clip_thresh must be positive".into()));
        }
        if self.n_frames_per_step_initial == 0 {
            return Err(Error::Config("n_frames_per_step_initial must be at least 1".into()));
        }
        if self.n_speakers == 0 {
            return Err(Error::Config("n_speakers must be at least 1".into()));
        }
        self.validate_schedule()
    }

    fn validate_schedule(&self) -> Result<(), Error> {
        let schedule = &self.reduction_window_schedule;
        let mut last_until = None;
        for (i, entry) in schedule.iter().enumerate() {
            if entry.n_frames_per_step == 0 {
                return Err(Error::Config(format!(
                    "reduction window {i} has n_frames_per_step of 0"
                )));
            }
            if entry.batch_size == 0 {
                return Err(Error::Config(format!("reduction window {i} has batch_size of 0")));
            }
            match (last_until, entry.until_step) {
                // Only the final entry may leave until_step unset.
                (None, _) if i > 0 => {
                    return Err(Error::Config(format!(
                        "reduction window {} follows an open-ended entry",
                        i
                    )));
                }
                (Some(prev), Some(until)) if until <= prev => {
                    return Err(Error::Config(format!(
                        "reduction window {i} until_step {until} does not increase on {prev}"
                    )));
                }
                _ => {}
            }
            last_until = entry.until_step;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base() -> TrainingConfig {
        TrainingConfig {
            audiopaths_and_text: PathBuf::from("filelist.txt"),
            ..TrainingConfig::default()
        }
    }

    #[test]
    fn defaults_validate_once_filelist_set() {
        assert!(base().validate().is_ok());
        assert!(TrainingConfig::default().validate().is_err());
    }

    #[test]
    fn schedule_must_increase() {
        let mut config = base();
        config.reduction_window_schedule = vec![
            ReductionWindow {
                until_step: Some(1000),
                n_frames_per_step: 3,
                batch_size: 32,
            },
            ReductionWindow {
                until_step: Some(500),
                n_frames_per_step: 2,
                batch_size: 32,
            },
        ];
        assert!(config.validate().is_err());

        config.reduction_window_schedule[1].until_step = Some(2000);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn open_ended_entry_must_be_last() {
        let mut config = base();
        config.reduction_window_schedule = vec![
            ReductionWindow {
                until_step: None,
                n_frames_per_step: 3,
                batch_size: 32,
            },
            ReductionWindow {
                until_step: Some(1000),
                n_frames_per_step: 1,
                batch_size: 64,
            },
        ];
        assert!(config.validate().is_err());
    }

    #[test]
    fn round_trips_through_json() {
        let mut config = base();
        config.reduction_window_schedule = vec![ReductionWindow {
            until_step: Some(1000),
            n_frames_per_step: 3,
            batch_size: 32,
        }];
        let json = serde_json::to_string(&config).unwrap();
        let back: TrainingConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(back.reduction_window_schedule, config.reduction_window_schedule);
        assert_eq!(back.epochs, config.epochs);
    }
}
