//! Training telemetry. The trainer emits scalars, audio clips and images (attention maps, mel
//! plots) keyed by tag and global step; where they go is the logger's business. [`DiskLogger`]
//! writes a JSONL scalar stream plus WAV and `.npy` artefacts under the checkpoint directory,
//! which is enough to graph a run without any dashboard infrastructure.
use anyhow::Context;
use ndarray::ArrayView2;
use serde::Serialize;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use tracing::info;

pub trait TrainingLogger {
    fn scalar(&mut self, tag: &str, step: u64, value: f32);
    fn audio(&mut self, tag: &str, step: u64, samples: &[f32], sample_rate: u32);
    fn image(&mut self, tag: &str, step: u64, data: ArrayView2<f32>);
}

/// Swallows everything. Non-zero ranks log through this.
#[derive(Debug, Default)]
pub struct NullLogger;

impl TrainingLogger for NullLogger {
    fn scalar(&mut self, _: &str, _: u64, _: f32) {}
    fn audio(&mut self, _: &str, _: u64, _: &[f32], _: u32) {}
    fn image(&mut self, _: &str, _: u64, _: ArrayView2<f32>) {}
}

#[derive(Serialize)]
struct ScalarRecord<'a> {
    tag: &'a str,
    step: u64,
    value: f32,
}

pub struct DiskLogger {
    root: PathBuf,
    scalars: fs::File,
}

impl DiskLogger {
    pub fn new(root: impl AsRef<Path>) -> anyhow::Result<Self> {
        let root = root.as_ref().to_path_buf();
        fs::create_dir_all(&root)
            .with_context(|| format!("creating log directory {}", root.display()))?;
        let scalars = fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(root.join("scalars.jsonl"))?;
        Ok(Self { root, scalars })
    }

    fn artefact_path(&self, tag: &str, step: u64, extension: &str) -> PathBuf {
        let tag = tag.replace('/', "_");
        self.root.join(format!("{tag}_{step}.{extension}"))
    }
}

impl TrainingLogger for DiskLogger {
    fn scalar(&mut self, tag: &str, step: u64, value: f32) {
        let record = ScalarRecord { tag, step, value };
        match serde_json::to_string(&record) {
            Ok(line) => {
                if let Err(e) = writeln!(self.scalars, "{line}") {
                    info!("Failed to log scalar {}: {}", tag, e);
                }
            }
            Err(e) => info!("Failed to serialise scalar {}: {}", tag, e),
        }
    }

    fn audio(&mut self, tag: &str, step: u64, samples: &[f32], sample_rate: u32) {
        let path = self.artefact_path(tag, step, "wav");
        if let Err(e) = crate::audio::write_wav(&path, samples, sample_rate) {
            info!("Failed to log audio {}: {}", path.display(), e);
        }
    }

    fn image(&mut self, tag: &str, step: u64, data: ArrayView2<f32>) {
        let path = self.artefact_path(tag, step, "npy");
        if let Err(e) = ndarray_npy::write_npy(&path, &data.to_owned()) {
            info!("Failed to log image {}: {}", path.display(), e);
        }
    }
}
