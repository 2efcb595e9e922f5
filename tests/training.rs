//! End-to-end exercises of the training orchestrator: checkpoint round trips, validation
//! aggregation, the frames-per-step curriculum, diagnostics resilience and single-process vs
//! two-worker equivalence.
mod common;

use common::{toy_dataset, BiasModel, FrameSampler, VecLogger, N_MELS};
use ndarray::{arr1, Array2};
use polyvox::config::{ReductionWindow, TrainingConfig};
use polyvox::distributed::{Collective, GradSync, ThreadGroup};
use polyvox::model::{InferenceInputs, MelSynthesizer, TrainableModel};
use polyvox::trainer::checkpoint::Checkpoint;
use polyvox::trainer::{load_datasets, Trainer};
use polyvox::Error;
use std::path::PathBuf;
use std::sync::Arc;

const POS_WEIGHT: f32 = 10.0;

fn base_config(checkpoint_path: PathBuf) -> TrainingConfig {
    TrainingConfig {
        audiopaths_and_text: PathBuf::from("unused_filelist.txt"),
        checkpoint_path,
        epochs: 2,
        epochs_per_checkpoint: 2,
        n_mel_channels: N_MELS,
        pos_weight: POS_WEIGHT,
        batch_size: 2,
        learning_rate: 0.05,
        weight_decay: 0.0,
        grad_clip_thresh: 10.0,
        debug: true,
        n_speakers: 2,
        seed: 99,
        ..TrainingConfig::default()
    }
}

fn fixed_inference_input() -> InferenceInputs {
    InferenceInputs {
        text: Array2::from_shape_vec((1, 3), vec![12, 38, 11]).unwrap(),
        lengths: arr1(&[3]),
        speaker_ids: arr1(&[0]),
        f0: None,
    }
}

#[test]
fn checkpoint_round_trip_restores_run() {
    let dir = tempfile::tempdir().unwrap();
    let train_set = toy_dataset(4, 6);

    let config = base_config(dir.path().to_path_buf());
    let mut trainer = Trainer::new(config.clone(), VecLogger::default()).unwrap();
    let mut model = BiasModel::new(POS_WEIGHT);
    trainer.train(&mut model, &train_set, None).unwrap();

    // 4 items, batch size 2, 2 epochs.
    assert_eq!(trainer.state().global_step, 4);
    let checkpoint_path = dir.path().join("mellotron_1");
    let saved = Checkpoint::load(&checkpoint_path).unwrap();
    assert_eq!(saved.global_step, Some(4));
    assert_eq!(saved.iteration, Some(1));
    assert_eq!(saved.learning_rate, Some(config.learning_rate));
    assert_eq!(saved.model, model.state_dict());

    // Warm start into a fresh trainer with no epochs left to run: the restored state must match
    // the run exactly.
    let mut resumed_config = base_config(dir.path().join("second_run"));
    resumed_config.warm_start_name = Some(checkpoint_path);
    resumed_config.epochs = 1;
    let mut resumed = Trainer::new(resumed_config, VecLogger::default()).unwrap();
    let mut restored = BiasModel::new(POS_WEIGHT);
    resumed.train(&mut restored, &train_set, None).unwrap();

    assert_eq!(resumed.state().global_step, 4);
    assert_eq!(resumed.state().epoch, 1);
    assert_eq!(restored.state_dict(), model.state_dict());

    let a = model.inference(&fixed_inference_input()).unwrap();
    let b = restored.inference(&fixed_inference_input()).unwrap();
    assert_eq!(a.mel, b.mel);
    assert_eq!(a.gate, b.gate);
}

#[test]
fn validation_means_and_empty_guard() {
    let dir = tempfile::tempdir().unwrap();
    let mut trainer =
        Trainer::new(base_config(dir.path().to_path_buf()), VecLogger::default()).unwrap();
    let mut model = BiasModel::new(POS_WEIGHT);
    let val_set = toy_dataset(4, 6);

    let report = trainer.validate(&mut model, &val_set).unwrap();
    assert_eq!(report.mel_loss_per_item.len(), 4);
    assert_eq!(report.gate_loss_per_item.len(), 4);
    assert_eq!(report.speaker_ids.len(), 4);
    // Equal-sized batches, so the mean of batch means equals the overall item mean.
    let item_mean: f32 =
        report.mel_loss_per_item.iter().sum::<f32>() / report.mel_loss_per_item.len() as f32;
    assert!((report.mel_loss - item_mean).abs() < 1e-5);
    assert!(report.gate_loss > 0.0);
    // Training mode restored after the pass.
    assert!(model.training);

    let empty = toy_dataset(0, 6);
    let err = trainer.validate(&mut model, &empty).unwrap_err();
    assert!(matches!(
        err.downcast_ref::<Error>(),
        Some(Error::EmptyValidationSet)
    ));
}

#[test]
fn two_workers_report_identical_validation_means() {
    let reports: Vec<_> = ThreadGroup::new(2)
        .into_iter()
        .map(|group| {
            std::thread::spawn(move || {
                let dir = tempfile::tempdir().unwrap();
                let mut config = base_config(dir.path().to_path_buf());
                config.distributed_run = true;
                let comm: Arc<dyn Collective> = Arc::new(group);
                let val_set = toy_dataset(4, 6);
                let mut model = BiasModel::new(POS_WEIGHT);
                let mut trainer =
                    Trainer::distributed(config, VecLogger::default(), comm).unwrap();
                trainer.validate(&mut model, &val_set).unwrap()
            })
        })
        .collect::<Vec<_>>()
        .into_iter()
        .map(|h| h.join().unwrap())
        .collect();

    // The shards hold different items, but the reduced means agree on every rank.
    assert_eq!(reports[0].mel_loss, reports[1].mel_loss);
    assert_eq!(reports[0].gate_loss, reports[1].gate_loss);
    // Per-item diagnostics stay local to each rank's shard.
    assert_eq!(reports[0].mel_loss_per_item.len(), 2);
    assert_eq!(reports[1].mel_loss_per_item.len(), 2);
    assert_ne!(reports[0].speaker_ids, reports[1].speaker_ids);
}

#[test]
fn load_datasets_reads_training_and_validation_filelists() {
    let dir = tempfile::tempdir().unwrap();
    let wav = dir.path().join("tone.wav");
    polyvox::audio::write_wav(&wav, &vec![0.1; 2048], 22050).unwrap();
    let train_list = dir.path().join("train.txt");
    std::fs::write(
        &train_list,
        format!("{0}|first clip|0\n{0}|second clip|1\n", wav.display()),
    )
    .unwrap();
    let val_list = dir.path().join("val.txt");
    std::fs::write(&val_list, format!("{}|held out|0\n", wav.display())).unwrap();

    let mut config = base_config(dir.path().to_path_buf());
    config.audiopaths_and_text = train_list;
    config.validation_audiopaths_and_text = Some(val_list);

    let (train, val) = load_datasets(&config).unwrap();
    assert_eq!(train.len(), 2);
    let val = val.unwrap();
    assert_eq!(val.len(), 1);
    // The extractor picks up the config's mel geometry.
    assert_eq!(val.get(0).unwrap().mel.shape()[0], N_MELS);

    config.validation_audiopaths_and_text = None;
    let (_, none) = load_datasets(&config).unwrap();
    assert!(none.is_none());
}

#[test]
fn training_reduces_loss_and_logs_scalars() {
    let dir = tempfile::tempdir().unwrap();
    let mut config = base_config(dir.path().to_path_buf());
    config.epochs = 10;
    config.epochs_per_checkpoint = 100;
    let train_set = toy_dataset(4, 6);

    let mut trainer = Trainer::new(config, VecLogger::default()).unwrap();
    let mut model = BiasModel::new(POS_WEIGHT);
    trainer.train(&mut model, &train_set, None).unwrap();

    let losses = trainer.logger().scalar_values("Loss/train");
    assert_eq!(losses.len(), 20);
    assert!(losses.iter().all(|l| l.is_finite()));
    assert!(
        losses.last().unwrap() < losses.first().unwrap(),
        "loss did not fall: {losses:?}"
    );
    assert_eq!(trainer.logger().scalar_values("GradNorm").len(), 20);
    assert_eq!(trainer.logger().scalar_values("StepDuration").len(), 20);
}

#[test]
fn fp16_run_trains_through_the_scaler() {
    let dir = tempfile::tempdir().unwrap();
    let mut config = base_config(dir.path().to_path_buf());
    config.fp16_run = true;
    config.epochs = 4;
    config.epochs_per_checkpoint = 100;
    let train_set = toy_dataset(4, 6);

    let mut trainer = Trainer::new(config, VecLogger::default()).unwrap();
    let mut model = BiasModel::new(POS_WEIGHT);
    trainer.train(&mut model, &train_set, None).unwrap();

    assert_eq!(trainer.state().global_step, 8);
    let losses = trainer.logger().scalar_values("Loss/train");
    assert!(losses.iter().all(|l| l.is_finite()));
    assert!(losses.last().unwrap() < losses.first().unwrap());
}

#[test]
fn debug_mode_skips_validation_but_checkpoints() {
    let dir = tempfile::tempdir().unwrap();
    let mut config = base_config(dir.path().to_path_buf());
    config.epochs = 1;
    config.epochs_per_checkpoint = 1;
    config.debug = true;
    let train_set = toy_dataset(4, 6);
    let val_set = toy_dataset(2, 6);

    let mut trainer = Trainer::new(config, VecLogger::default()).unwrap();
    let mut model = BiasModel::new(POS_WEIGHT);
    trainer
        .train(&mut model, &train_set, Some(&val_set))
        .unwrap();

    assert!(trainer.logger().scalar_values("Loss/val_mel").is_empty());
    assert!(dir.path().join("mellotron_0").exists());
}

#[test]
fn validation_runs_each_epoch_outside_debug() {
    let dir = tempfile::tempdir().unwrap();
    let mut config = base_config(dir.path().to_path_buf());
    config.debug = false;
    config.epochs = 2;
    config.epochs_per_checkpoint = 100;
    let train_set = toy_dataset(4, 6);
    let val_set = toy_dataset(2, 6);

    let mut trainer = Trainer::new(config, VecLogger::default()).unwrap();
    let mut model = BiasModel::new(POS_WEIGHT);
    trainer
        .train(&mut model, &train_set, Some(&val_set))
        .unwrap();

    assert_eq!(trainer.logger().scalar_values("Loss/val_mel").len(), 2);
    assert_eq!(trainer.logger().scalar_values("Loss/val_gate").len(), 2);
    // Sample inference ran too, logging its diagnostic images.
    assert!(trainer
        .logger()
        .image_tags
        .iter()
        .any(|(tag, _)| tag == "Attention"));
}

#[test]
fn frames_per_step_curriculum_applies_mid_run() {
    let dir = tempfile::tempdir().unwrap();
    let mut config = base_config(dir.path().to_path_buf());
    config.epochs = 2;
    config.epochs_per_checkpoint = 100;
    config.n_frames_per_step_initial = 4;
    config.reduction_window_schedule = vec![
        ReductionWindow {
            until_step: Some(2),
            n_frames_per_step: 2,
            batch_size: 2,
        },
        ReductionWindow {
            until_step: None,
            n_frames_per_step: 1,
            batch_size: 1,
        },
    ];
    let train_set = toy_dataset(4, 6);

    let mut trainer = Trainer::new(config, VecLogger::default()).unwrap();
    let mut model = BiasModel::new(POS_WEIGHT);
    trainer.train(&mut model, &train_set, None).unwrap();

    // Epoch 0 runs the first window (2 batches of 2), epoch 1 the second (4 batches of 1).
    assert_eq!(trainer.state().global_step, 6);
    assert_eq!(trainer.state().current_frames_per_step, 1);
    assert_eq!(trainer.state().batch_size, 1);
    assert_eq!(model.current_frames_per_step, 1);
}

#[test]
fn exhausted_schedule_fails_the_run() {
    let dir = tempfile::tempdir().unwrap();
    let mut config = base_config(dir.path().to_path_buf());
    config.epochs = 3;
    config.epochs_per_checkpoint = 100;
    config.reduction_window_schedule = vec![ReductionWindow {
        until_step: Some(2),
        n_frames_per_step: 2,
        batch_size: 2,
    }];
    let train_set = toy_dataset(4, 6);

    let mut trainer = Trainer::new(config, VecLogger::default()).unwrap();
    let mut model = BiasModel::new(POS_WEIGHT);
    let err = trainer.train(&mut model, &train_set, None).unwrap_err();
    assert!(matches!(
        err.downcast_ref::<Error>(),
        Some(Error::ScheduleExhausted { .. })
    ));
}

#[test]
fn sample_inference_failure_never_aborts() {
    let dir = tempfile::tempdir().unwrap();
    let mut trainer = Trainer::new(base_config(dir.path().to_path_buf()), VecLogger::default())
        .unwrap()
        .with_mel_sampler(Box::new(FrameSampler));
    let mut model = BiasModel::new(POS_WEIGHT);
    model.fail_inference = true;

    trainer.sample_inference(&model).unwrap();
    assert!(trainer.logger().image_tags.is_empty());
    assert!(trainer.logger().audio_tags.is_empty());

    model.fail_inference = false;
    trainer.sample_inference(&model).unwrap();
    let tags: Vec<&str> = trainer
        .logger()
        .image_tags
        .iter()
        .map(|(t, _)| t.as_str())
        .collect();
    assert!(tags.contains(&"Attention"));
    assert!(tags.contains(&"MelPredicted"));
    assert!(tags.contains(&"Gate"));
    assert_eq!(trainer.logger().audio_tags.len(), 1);
}

#[test]
fn two_workers_match_single_process_training() {
    let frames = 6;
    let epochs = 3;

    // Single process, one batch of four per epoch.
    let dir = tempfile::tempdir().unwrap();
    let mut single_config = base_config(dir.path().to_path_buf());
    single_config.epochs = epochs;
    single_config.epochs_per_checkpoint = 100;
    single_config.batch_size = 4;
    let train_set = toy_dataset(4, frames);
    let mut single_trainer = Trainer::new(single_config, VecLogger::default()).unwrap();
    let mut single_model = BiasModel::new(POS_WEIGHT);
    single_trainer
        .train(&mut single_model, &train_set, None)
        .unwrap();
    let single_losses = single_trainer.logger().scalar_values("Loss/train");

    // Two workers, each one batch of two per epoch, gradients averaged through the collective.
    let workers: Vec<_> = ThreadGroup::new(2)
        .into_iter()
        .map(|group| {
            std::thread::spawn(move || {
                let dir = tempfile::tempdir().unwrap();
                let mut config = base_config(dir.path().to_path_buf());
                config.epochs = epochs;
                config.epochs_per_checkpoint = 100;
                config.batch_size = 2;
                config.distributed_run = true;
                let comm: Arc<dyn Collective> = Arc::new(group);
                let train_set = toy_dataset(4, frames);
                let mut model =
                    GradSync::new(BiasModel::new(POS_WEIGHT), Arc::clone(&comm));
                let mut trainer =
                    Trainer::distributed(config, VecLogger::default(), comm).unwrap();
                trainer.train(&mut model, &train_set, None).unwrap();
                let losses = trainer.logger().scalar_values("Loss/train");
                (model.into_inner().state_dict(), losses)
            })
        })
        .collect::<Vec<_>>()
        .into_iter()
        .map(|h| h.join().unwrap())
        .collect();

    let (rank0_state, rank0_losses) = &workers[0];
    let (rank1_state, _) = &workers[1];
    // Both workers hold identical weights after gradient averaging.
    assert_eq!(rank0_state, rank1_state);

    assert_eq!(single_losses.len(), rank0_losses.len());
    for (a, b) in single_losses.iter().zip(rank0_losses.iter()) {
        assert!((a - b).abs() < 1e-5, "loss diverged: {a} vs {b}");
    }
    let single_state = single_model.state_dict();
    for (name, tensor) in &single_state.0 {
        let other = &rank0_state.0[name];
        for (x, y) in tensor.iter().zip(other.iter()) {
            assert!((x - y).abs() < 1e-5, "{name} diverged: {x} vs {y}");
        }
    }
}
