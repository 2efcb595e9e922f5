//! Filelist-backed training data.
//!
//! A filelist is the pipe-delimited `path|transcript|speaker` format common to the Tacotron2
//! training recipes; the speaker column is optional for single-speaker sets. Items are loaded
//! lazily so huge corpora never sit in memory: `get` reads the WAV, extracts the mel and encodes
//! the transcript on demand.
pub mod catalogue;

use crate::audio::{read_wav, MelExtractor};
use crate::text::TextFrontend;
use anyhow::Context;
use ndarray::Array2;
use rand::rngs::StdRng;
use rand::SeedableRng;
use std::collections::HashSet;
use std::fs::File;
use std::io;
use std::path::{Path, PathBuf};
use tracing::{error, info};

/// One training example after loading: encoded transcript, log mel and speaker.
#[derive(Debug, Clone)]
pub struct DatasetItem {
    pub sequence: Vec<i64>,
    pub mel: Array2<f32>,
    pub speaker_id: i64,
}

#[derive(Debug, Clone)]
pub struct FilelistEntry {
    pub audio_path: PathBuf,
    pub text: String,
    pub speaker_id: i64,
}

pub struct TextMelDataset {
    entries: Vec<FilelistEntry>,
    frontend: TextFrontend,
    extractor: MelExtractor,
    /// Seed for the per-item arpabet coin flips, kept fixed so an item is deterministic given
    /// its index.
    seed: u64,
    /// Pre-extracted mels for datasets built in memory (tests, mostly).
    preloaded: Option<Vec<DatasetItem>>,
}

impl TextMelDataset {
    pub fn from_filelist(
        path: impl AsRef<Path>,
        frontend: TextFrontend,
        extractor: MelExtractor,
        seed: u64,
    ) -> anyhow::Result<Self> {
        let entries = read_filelist(path.as_ref())?;
        Ok(Self {
            entries,
            frontend,
            extractor,
            seed,
            preloaded: None,
        })
    }

    /// A dataset over items already in memory, bypassing disk entirely.
    pub fn from_items(items: Vec<DatasetItem>, frontend: TextFrontend, extractor: MelExtractor) -> Self {
        Self {
            entries: Vec::new(),
            frontend,
            extractor,
            seed: 0,
            preloaded: Some(items),
        }
    }

    pub fn len(&self) -> usize {
        match &self.preloaded {
            Some(items) => items.len(),
            None => self.entries.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn entries(&self) -> &[FilelistEntry] {
        &self.entries
    }

    /// Load item `index`: read the audio, extract its mel and encode the transcript.
    pub fn get(&self, index: usize) -> anyhow::Result<DatasetItem> {
        if let Some(items) = &self.preloaded {
            return items
                .get(index)
                .cloned()
                .with_context(|| format!("index {index} out of bounds"));
        }
        let entry = self
            .entries
            .get(index)
            .with_context(|| format!("index {index} out of bounds"))?;
        let (audio, sample_rate) = read_wav(&entry.audio_path)?;
        let expected = self.extractor.config().sampling_rate;
        if sample_rate != expected {
            anyhow::bail!(
                "{} is {} Hz, dataset expects {} Hz",
                entry.audio_path.display(),
                sample_rate,
                expected
            );
        }
        let mel = self.extractor.mel_spectrogram(&audio);
        let mut rng = StdRng::seed_from_u64(self.seed.wrapping_add(index as u64));
        let sequence = self.frontend.text_to_sequence(&entry.text, &mut rng)?;
        if sequence.is_empty() {
            anyhow::bail!(
                "{} transcript produced no input symbols: {:?}",
                entry.audio_path.display(),
                entry.text
            );
        }
        Ok(DatasetItem {
            sequence,
            mel,
            speaker_id: entry.speaker_id,
        })
    }

    /// Validates there's nothing wrong with the dataset. Will log any errors it finds and
    /// return false.
    pub fn validate(&self) -> bool {
        info!("Validating dataset");
        let mut paths = HashSet::new();
        let mut success = true;
        let mut rng = StdRng::seed_from_u64(self.seed);
        for entry in &self.entries {
            if entry.text.trim().is_empty() {
                error!("Transcript for {} is empty", entry.audio_path.display());
                success = false;
            }
            match self.frontend.text_to_sequence(&entry.text, &mut rng) {
                Ok(seq) if seq.is_empty() => {
                    error!(
                        "{} transcript '{}' encodes to an empty sequence",
                        entry.audio_path.display(),
                        entry.text
                    );
                    success = false;
                }
                Err(e) => {
                    error!(
                        "{} transcript failed to encode: {}",
                        entry.audio_path.display(),
                        e
                    );
                    success = false;
                }
                Ok(_) => {}
            }
            if !entry.audio_path.exists() {
                error!("Missing audio file: {}", entry.audio_path.display());
                success = false;
            }
            if !paths.insert(entry.audio_path.as_path()) {
                error!("Duplicate audio path: {}", entry.audio_path.display());
                success = false;
            }
            if entry.speaker_id < 0 {
                error!(
                    "{} has a negative speaker id: {}",
                    entry.audio_path.display(),
                    entry.speaker_id
                );
                success = false;
            }
        }
        info!("Validation complete");
        success
    }
}

fn read_filelist(path: &Path) -> anyhow::Result<Vec<FilelistEntry>> {
    let f = File::open(path).with_context(|| format!("opening filelist {}", path.display()))?;
    let reader = io::BufReader::new(f);
    let mut rdr = csv::ReaderBuilder::new()
        .has_headers(false)
        .delimiter(b'|')
        .quoting(false)
        .flexible(true)
        .from_reader(reader);

    let mut entries = vec![];
    for result in rdr.records() {
        let record = result?;
        match (record.get(0), record.get(1)) {
            (Some(audio_path), Some(text)) => {
                let speaker_id = match record.get(2) {
                    Some(s) => s
                        .trim()
                        .parse::<i64>()
                        .with_context(|| format!("bad speaker id in record {record:?}"))?,
                    None => 0,
                };
                entries.push(FilelistEntry {
                    audio_path: PathBuf::from(audio_path),
                    text: text.to_string(),
                    speaker_id,
                });
            }
            _ => error!("Incomplete record: {:?}", record),
        }
    }
    Ok(entries)
}
