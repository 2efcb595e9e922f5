//! The training orchestrator. Owns the epoch/step loop, the frames-per-step curriculum, the
//! checkpoint cadence and the per-epoch validation and sample-inference diagnostics. Models,
//! vocoders and the distributed fabric all arrive as trait objects; the orchestrator holds the
//! only mutable [`TrainingState`] and everything else mutates through it.
pub mod checkpoint;
pub mod schedule;

use crate::audio::{MelConfig, MelExtractor};
use crate::config::TrainingConfig;
use crate::dataset::TextMelDataset;
use crate::distributed::{AverageReducer, Collective, IdentityReducer, LossReducer};
use crate::error::Error;
use crate::loader::{DataLoader, EpochSampler, TextMelCollate};
use crate::logging::TrainingLogger;
use crate::loss::Tacotron2Loss;
use crate::model::{AcousticModel, InferenceInputs, MelSampler, TrainableModel};
use crate::optim::{Adam, PlainStep, ScaledStep, StepStrategy};
use crate::text::{prepare_input_sequence, random_utterance, TextFrontend};
use checkpoint::Checkpoint;
use ndarray::Array3;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::sync::Arc;
use std::time::Instant;
use tracing::{info, warn};

/// Frames of zero pitch conditioning handed to sample inference when `include_f0` is set.
const SAMPLE_F0_FRAMES: usize = 200;

/// Mutable per-run bookkeeping. Owned by the trainer, snapshotted into checkpoints.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TrainingState {
    pub global_step: u64,
    pub epoch: usize,
    pub reduction_window_idx: usize,
    pub current_frames_per_step: usize,
    pub batch_size: usize,
}

/// Aggregates of one validation pass. The per-item vectors cover the whole validation set in
/// batch order, paired with their speaker ids for per-speaker analysis downstream.
#[derive(Debug, Clone)]
pub struct ValidationReport {
    pub mel_loss: f32,
    pub gate_loss: f32,
    pub mel_loss_per_item: Vec<f32>,
    pub gate_loss_per_item: Vec<f32>,
    pub speaker_ids: Vec<i64>,
}

/// Load the training set and, when configured, the held-out validation set named by the config.
pub fn load_datasets(
    config: &TrainingConfig,
) -> anyhow::Result<(TextMelDataset, Option<TextMelDataset>)> {
    let frontend = TextFrontend::new(config.text_cleaners.clone())?;
    let extractor = MelExtractor::new(MelConfig {
        sampling_rate: config.sampling_rate,
        filter_length: config.filter_length,
        hop_length: config.hop_length,
        win_length: config.win_length,
        n_mel_channels: config.n_mel_channels,
        mel_fmin: config.mel_fmin,
        mel_fmax: config.mel_fmax,
    });
    let train = TextMelDataset::from_filelist(
        &config.audiopaths_and_text,
        frontend.clone(),
        extractor.clone(),
        config.seed,
    )?;
    let val = match &config.validation_audiopaths_and_text {
        Some(path) => Some(TextMelDataset::from_filelist(
            path,
            frontend,
            extractor,
            config.seed,
        )?),
        None => None,
    };
    Ok((train, val))
}

pub struct Trainer<L> {
    config: TrainingConfig,
    state: TrainingState,
    logger: L,
    reducer: Box<dyn LossReducer>,
    rank: usize,
    world_size: usize,
    mel_sampler: Option<Box<dyn MelSampler>>,
    frontend: TextFrontend,
    rng: StdRng,
}

impl<L: TrainingLogger> Trainer<L> {
    pub fn new(config: TrainingConfig, logger: L) -> anyhow::Result<Self> {
        config.validate()?;
        if config.distributed_run {
            anyhow::bail!("distributed_run is set, construct the trainer with a collective");
        }
        Self::build(config, logger, None)
    }

    /// A trainer participating in a distributed run through the given collective.
    pub fn distributed(
        config: TrainingConfig,
        logger: L,
        comm: Arc<dyn Collective>,
    ) -> anyhow::Result<Self> {
        config.validate()?;
        Self::build(config, logger, Some(comm))
    }

    fn build(
        config: TrainingConfig,
        logger: L,
        comm: Option<Arc<dyn Collective>>,
    ) -> anyhow::Result<Self> {
        let frontend = TextFrontend::new(config.text_cleaners.clone())?;
        let (rank, world_size, reducer): (usize, usize, Box<dyn LossReducer>) = match &comm {
            Some(comm) => (
                comm.rank(),
                comm.world_size(),
                Box::new(AverageReducer::new(Arc::clone(comm))),
            ),
            None => (0, 1, Box::new(IdentityReducer)),
        };
        let state = TrainingState {
            global_step: 0,
            epoch: 0,
            reduction_window_idx: 0,
            current_frames_per_step: config.n_frames_per_step_initial,
            batch_size: config.batch_size,
        };
        let rng = StdRng::seed_from_u64(config.seed);
        Ok(Self {
            config,
            state,
            logger,
            reducer,
            rank,
            world_size,
            mel_sampler: None,
            frontend,
            rng,
        })
    }

    /// Attach a mel-to-audio capability for sample-inference diagnostics. Without one the
    /// diagnostics still log images, just no audio.
    pub fn with_mel_sampler(mut self, sampler: Box<dyn MelSampler>) -> Self {
        self.mel_sampler = Some(sampler);
        self
    }

    /// Replace the text frontend, e.g. to attach a pronunciation dictionary.
    pub fn with_frontend(mut self, frontend: TextFrontend) -> Self {
        self.frontend = frontend;
        self
    }

    pub fn state(&self) -> &TrainingState {
        &self.state
    }

    pub fn logger(&self) -> &L {
        &self.logger
    }

    /// Run the full training loop over the configured number of epochs.
    pub fn train<M: TrainableModel>(
        &mut self,
        model: &mut M,
        train_set: &TextMelDataset,
        val_set: Option<&TextMelDataset>,
    ) -> anyhow::Result<()> {
        let criterion = Tacotron2Loss::new(self.config.pos_weight);
        let mut optimizer = Adam::new(self.config.learning_rate, self.config.weight_decay);
        let mut strategy: Box<dyn StepStrategy> = if self.config.fp16_run {
            Box::new(ScaledStep::default())
        } else {
            Box::new(PlainStep)
        };

        if let Some(name) = self.config.warm_start_name.clone() {
            self.warm_start(model, &mut optimizer, &name)?;
        }
        model.set_current_frames_per_step(self.state.current_frames_per_step);
        model.set_train(true);

        let start_epoch = self.state.epoch;
        for epoch in start_epoch..self.config.epochs {
            self.state.epoch = epoch;
            self.adjust_frames_per_step(model)?;

            let sampler = self.train_sampler(train_set.len());
            let collate = TextMelCollate::new(
                self.state.current_frames_per_step,
                self.config.include_f0,
            );
            let loader = DataLoader::new(
                train_set,
                &sampler,
                epoch as u64,
                self.state.batch_size,
                collate,
            );
            info!(epoch, batches = loader.len(), "Starting epoch");

            for batch in loader {
                let started = Instant::now();
                self.state.global_step += 1;
                model.zero_grad();
                let (x, y) = model.parse_batch(batch?);
                let y_pred = model.forward(&x)?;
                let losses = criterion.compute(&y_pred, &y)?;
                let reduced_mel = self.reducer.reduce(losses.mel_loss)?;
                let reduced_gate = self.reducer.reduce(losses.gate_loss)?;
                let reduced_loss = reduced_mel + reduced_gate;
                model.backward(&x, &y_pred, &y, strategy.loss_scale())?;
                let grad_norm =
                    strategy.step(model, &mut optimizer, self.config.grad_clip_thresh);
                let duration = started.elapsed().as_secs_f32();

                let step = self.state.global_step;
                self.logger.scalar("Loss/train", step, reduced_loss);
                self.logger.scalar("Loss/mel", step, reduced_mel);
                self.logger.scalar("Loss/gate", step, reduced_gate);
                if let Some(norm) = grad_norm {
                    self.logger.scalar("GradNorm", step, norm);
                }
                self.logger
                    .scalar("LearningRate", step, optimizer.learning_rate);
                self.logger.scalar("StepDuration", step, duration);
            }

            // Unconditional cadence, debug mode included.
            if (epoch + 1) % self.config.epochs_per_checkpoint == 0 {
                self.save_checkpoint(model, &optimizer)?;
            }
            if self.config.debug {
                continue;
            }
            if let Some(val_set) = val_set {
                let report = self.validate(model, val_set)?;
                let step = self.state.global_step;
                self.logger.scalar("Loss/val_mel", step, report.mel_loss);
                self.logger.scalar("Loss/val_gate", step, report.gate_loss);
                info!(
                    epoch,
                    mel_loss = report.mel_loss,
                    gate_loss = report.gate_loss,
                    "Validation complete"
                );
            }
            self.sample_inference(model)?;
        }
        self.state.epoch = self.config.epochs;
        Ok(())
    }

    fn train_sampler(&self, len: usize) -> EpochSampler {
        if self.world_size > 1 {
            EpochSampler::sharded(len, true, self.config.seed, self.rank, self.world_size)
        } else {
            EpochSampler::local(len, true, self.config.seed)
        }
    }

    /// Move the curriculum cursor forward if `global_step` has crossed into a later window.
    /// Several windows can be crossed at once after a warm start.
    fn adjust_frames_per_step<M: TrainableModel>(&mut self, model: &mut M) -> Result<(), Error> {
        let schedule = &self.config.reduction_window_schedule;
        if schedule.is_empty() {
            return Ok(());
        }
        let index = schedule::advance(
            schedule,
            self.state.reduction_window_idx,
            self.state.global_step,
        )?;
        if index != self.state.reduction_window_idx {
            let window = &schedule[index];
            info!(
                "Adjusting frames per step from {} to {}",
                self.state.current_frames_per_step, window.n_frames_per_step
            );
            self.state.reduction_window_idx = index;
            self.state.current_frames_per_step = window.n_frames_per_step;
            self.state.batch_size = window.batch_size;
            model.set_current_frames_per_step(window.n_frames_per_step);
        } else if self.state.global_step == 0 {
            // Fresh runs take their initial granularity from the first window.
            let window = &schedule[index];
            self.state.current_frames_per_step = window.n_frames_per_step;
            self.state.batch_size = window.batch_size;
            model.set_current_frames_per_step(window.n_frames_per_step);
        }
        Ok(())
    }

    /// One pass over the held-out set. No shuffling so a checkpoint always validates on the
    /// same batches; training mode is restored before returning whatever the outcome. In a
    /// distributed run the batch losses are reduced across workers so every rank reports the
    /// same means; the per-item vectors stay local to the rank's shard.
    pub fn validate<M: TrainableModel>(
        &mut self,
        model: &mut M,
        val_set: &TextMelDataset,
    ) -> anyhow::Result<ValidationReport> {
        model.set_train(false);
        let result = self.validation_pass(model, val_set);
        model.set_train(true);
        result
    }

    fn validation_pass<M: TrainableModel>(
        &mut self,
        model: &mut M,
        val_set: &TextMelDataset,
    ) -> anyhow::Result<ValidationReport> {
        let criterion = Tacotron2Loss::new(self.config.pos_weight);
        let sampler = if self.world_size > 1 {
            EpochSampler::sharded(val_set.len(), false, self.config.seed, self.rank, self.world_size)
        } else {
            EpochSampler::local(val_set.len(), false, self.config.seed)
        };
        let collate = TextMelCollate::new(
            self.state.current_frames_per_step,
            self.config.include_f0,
        );
        let loader = DataLoader::new(val_set, &sampler, 0, self.state.batch_size, collate);

        let mut mel_sum = 0.0f32;
        let mut gate_sum = 0.0f32;
        let mut total_steps = 0usize;
        let mut mel_loss_per_item = Vec::new();
        let mut gate_loss_per_item = Vec::new();
        let mut speaker_ids = Vec::new();

        for batch in loader {
            let batch = batch?;
            speaker_ids.extend(batch.speaker_ids.iter().copied());
            let (x, y) = model.parse_batch(batch);
            let y_pred = model.forward(&x)?;
            let losses = criterion.compute(&y_pred, &y)?;
            mel_sum += self.reducer.reduce(losses.mel_loss)?;
            gate_sum += self.reducer.reduce(losses.gate_loss)?;
            total_steps += 1;
            mel_loss_per_item.extend(losses.mel_loss_per_item.iter().copied());
            gate_loss_per_item.extend(losses.gate_loss_per_item.iter().copied());
        }

        if total_steps == 0 {
            return Err(Error::EmptyValidationSet.into());
        }
        Ok(ValidationReport {
            mel_loss: mel_sum / total_steps as f32,
            gate_loss: gate_sum / total_steps as f32,
            mel_loss_per_item,
            gate_loss_per_item,
            speaker_ids,
        })
    }

    /// Synthesize one utterance end to end and log what came out. Primary worker only, and a
    /// failure anywhere in here is logged, never propagated: diagnostics must not kill a run.
    pub fn sample_inference<M: AcousticModel>(&mut self, model: &M) -> anyhow::Result<()> {
        if self.rank != 0 {
            return Ok(());
        }
        let utterance = random_utterance(&mut self.rng);
        let prepared = prepare_input_sequence(&[utterance], &self.frontend, &mut self.rng)?;
        let speaker_id = if self.config.sample_inference_speaker_ids.is_empty() {
            self.rng.gen_range(0..self.config.n_speakers as i64)
        } else {
            let pool = &self.config.sample_inference_speaker_ids;
            pool[self.rng.gen_range(0..pool.len())]
        };
        let f0 = self
            .config
            .include_f0
            .then(|| Array3::zeros((1, 1, SAMPLE_F0_FRAMES)));
        let inputs = InferenceInputs {
            text: prepared.sequences,
            lengths: prepared.lengths,
            speaker_ids: ndarray::arr1(&[speaker_id]),
            f0,
        };

        let step = self.state.global_step;
        let outputs = match model.inference(&inputs) {
            Ok(outputs) => outputs,
            Err(e) => {
                warn!("Sample inference failed for speaker {}: {}", speaker_id, e);
                return Ok(());
            }
        };
        let mel = outputs.mel.index_axis(ndarray::Axis(0), 0);
        let gate = outputs.gate.index_axis(ndarray::Axis(0), 0);
        let alignment = outputs.alignments.index_axis(ndarray::Axis(0), 0);

        self.logger.image("Attention", step, alignment);
        self.logger.image("MelPredicted", step, mel);
        self.logger
            .image("Gate", step, gate.insert_axis(ndarray::Axis(0)));

        if let Some(sampler) = &self.mel_sampler {
            match sampler.sample(mel) {
                Ok(audio) => {
                    self.logger
                        .audio("SampleAudio", step, &audio, self.config.sampling_rate);
                }
                Err(e) => {
                    warn!(
                        "Mel-to-audio sampling failed on mel of shape {:?}: {}",
                        mel.shape(),
                        e
                    );
                }
            }
        }
        Ok(())
    }

    /// Persist a checkpoint tagged with the current epoch. Only the primary worker writes.
    fn save_checkpoint<M: TrainableModel>(
        &self,
        model: &M,
        optimizer: &Adam,
    ) -> anyhow::Result<()> {
        if self.rank != 0 {
            return Ok(());
        }
        let path = self
            .config
            .checkpoint_path
            .join(format!("mellotron_{}", self.state.epoch));
        let checkpoint = Checkpoint {
            model: model.state_dict(),
            optimizer: Some(optimizer.state().clone()),
            iteration: Some(self.state.epoch),
            learning_rate: Some(optimizer.learning_rate),
            global_step: Some(self.state.global_step),
        };
        checkpoint.save(&path)?;
        info!(
            "Saved checkpoint {} at step {}",
            path.display(),
            self.state.global_step
        );
        Ok(())
    }

    /// Initialise model and bookkeeping from a prior checkpoint. Missing optional fields keep
    /// their configured defaults, so weights-only exports warm start fine.
    fn warm_start<M: TrainableModel>(
        &mut self,
        model: &mut M,
        optimizer: &mut Adam,
        name: &std::path::Path,
    ) -> anyhow::Result<()> {
        let checkpoint = Checkpoint::load(name)?;
        model.load_state_dict(&checkpoint.model)?;
        if let Some(state) = checkpoint.optimizer {
            optimizer.load_state(state);
        }
        if let Some(lr) = checkpoint.learning_rate {
            optimizer.learning_rate = lr;
        }
        if let Some(iteration) = checkpoint.iteration {
            self.state.epoch = iteration;
        }
        if let Some(global_step) = checkpoint.global_step {
            self.state.global_step = global_step;
        }
        info!(
            "Warm started from {} at epoch {} step {}",
            name.display(),
            self.state.epoch,
            self.state.global_step
        );
        Ok(())
    }
}
