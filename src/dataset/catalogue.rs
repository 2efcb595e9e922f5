//! The filelist catalogue: a small persistent registry of speaker filelists that training
//! filelists get assembled from. Each record remembers where a speaker's transcript filelist
//! lives and how its relative audio paths resolve; exporting stitches any subset of records
//! into a single multi-speaker filelist with densely renumbered speaker ids.
use anyhow::Context;
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::fs;
use std::io::{BufRead, Write};
use std::path::{Path, PathBuf};
use tracing::{info, warn};

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct FilelistRecord {
    pub id: String,
    /// Filelist filename, relative to `dir_path`/`rel_path`.
    pub filelist_path: String,
    pub speaker_name: String,
    /// Root directory the record was catalogued from.
    pub dir_path: PathBuf,
    /// Speaker subdirectory under `dir_path`, empty for single-speaker layouts.
    pub rel_path: String,
    pub dataset_name: String,
}

impl FilelistRecord {
    fn filelist_location(&self) -> PathBuf {
        self.dir_path.join(&self.rel_path).join(&self.filelist_path)
    }
}

#[derive(Debug, Default, Serialize, Deserialize)]
pub struct Catalogue {
    records: Vec<FilelistRecord>,
}

fn random_id<R: Rng>(rng: &mut R) -> String {
    let bytes: [u8; 16] = rng.gen();
    bytes.iter().map(|b| format!("{b:02x}")).collect()
}

impl Catalogue {
    /// Open the catalogue file, or start empty if it doesn't exist yet.
    pub fn open(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let path = path.as_ref();
        if !path.exists() {
            return Ok(Self::default());
        }
        let data = fs::read_to_string(path)
            .with_context(|| format!("reading catalogue {}", path.display()))?;
        let catalogue = serde_json::from_str(&data)
            .with_context(|| format!("parsing catalogue {}", path.display()))?;
        Ok(catalogue)
    }

    /// Persist atomically: write a sibling temp file then rename over the target.
    pub fn save(&self, path: impl AsRef<Path>) -> anyhow::Result<()> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let tmp = path.with_extension("tmp");
        fs::write(&tmp, serde_json::to_string_pretty(self)?)?;
        fs::rename(&tmp, path)
            .with_context(|| format!("replacing catalogue {}", path.display()))?;
        Ok(())
    }

    pub fn records(&self) -> &[FilelistRecord] {
        &self.records
    }

    pub fn get(&self, id: &str) -> Option<&FilelistRecord> {
        self.records.iter().find(|r| r.id == id)
    }

    /// Add one record, replacing any previous record for the same filelist location.
    pub fn record(
        &mut self,
        rng: &mut impl Rng,
        filelist_path: String,
        speaker_name: String,
        dir_path: PathBuf,
        rel_path: String,
        dataset_name: String,
    ) -> String {
        let id = random_id(rng);
        let record = FilelistRecord {
            id: id.clone(),
            filelist_path,
            speaker_name,
            dir_path,
            rel_path,
            dataset_name,
        };
        self.records
            .retain(|r| r.filelist_location() != record.filelist_location());
        self.records.push(record);
        id
    }

    /// Catalogue a single-speaker layout: every `.txt` filelist directly under `root`.
    pub fn add_singlespeaker(
        &mut self,
        rng: &mut impl Rng,
        root: impl AsRef<Path>,
        speaker_name: &str,
        dataset_name: &str,
    ) -> anyhow::Result<Vec<String>> {
        let root = root.as_ref();
        self.add_speaker_dir(rng, root, "", speaker_name, dataset_name)
    }

    /// Catalogue a multi-speaker layout: each subdirectory of `root` is one speaker holding its
    /// own `.txt` filelists. Hidden directories are skipped.
    pub fn add_multispeaker(
        &mut self,
        rng: &mut impl Rng,
        root: impl AsRef<Path>,
        dataset_name: &str,
    ) -> anyhow::Result<Vec<String>> {
        let root = root.as_ref();
        let mut ids = Vec::new();
        let mut speakers: Vec<_> = fs::read_dir(root)
            .with_context(|| format!("reading {}", root.display()))?
            .collect::<Result<_, _>>()?;
        speakers.sort_by_key(|e| e.file_name());
        for entry in speakers {
            let name = entry.file_name().to_string_lossy().into_owned();
            if !entry.path().is_dir() || name.starts_with('.') {
                continue;
            }
            ids.extend(self.add_speaker_dir(rng, root, &name, &name, dataset_name)?);
        }
        info!("Catalogued {} filelists under {}", ids.len(), root.display());
        Ok(ids)
    }

    fn add_speaker_dir(
        &mut self,
        rng: &mut impl Rng,
        dir_path: &Path,
        rel_path: &str,
        speaker_name: &str,
        dataset_name: &str,
    ) -> anyhow::Result<Vec<String>> {
        let speaker_dir = dir_path.join(rel_path);
        let mut filelists: Vec<_> = fs::read_dir(&speaker_dir)
            .with_context(|| format!("reading {}", speaker_dir.display()))?
            .collect::<Result<_, _>>()?;
        filelists.sort_by_key(|e| e.file_name());
        let mut ids = Vec::new();
        for entry in filelists {
            let name = entry.file_name().to_string_lossy().into_owned();
            if !name.ends_with(".txt") {
                continue;
            }
            ids.push(self.record(
                rng,
                name,
                speaker_name.to_string(),
                dir_path.to_path_buf(),
                rel_path.to_string(),
                dataset_name.to_string(),
            ));
        }
        if ids.is_empty() {
            warn!("No filelists found under {}", speaker_dir.display());
        }
        Ok(ids)
    }

    /// Assemble a training filelist from the given records. Audio paths are resolved against
    /// each record's directory and speakers are renumbered densely in the order given.
    pub fn export_filelist(
        &self,
        ids: &[String],
        out: impl AsRef<Path>,
    ) -> anyhow::Result<()> {
        let out = out.as_ref();
        if let Some(parent) = out.parent() {
            fs::create_dir_all(parent)?;
        }
        let mut f_out = fs::File::create(out)
            .with_context(|| format!("creating filelist {}", out.display()))?;
        for (speaker_id, id) in ids.iter().enumerate() {
            let record = self
                .get(id)
                .with_context(|| format!("no catalogue record with id {id}"))?;
            let location = record.filelist_location();
            let f_in = fs::File::open(&location)
                .with_context(|| format!("opening filelist {}", location.display()))?;
            for line in std::io::BufReader::new(f_in).lines() {
                let line = line?;
                if line.trim().is_empty() {
                    continue;
                }
                let (line_path, line_txn) = line
                    .split_once('|')
                    .with_context(|| format!("malformed filelist line: {line:?}"))?;
                // Anything after a second pipe (an old speaker column) is dropped.
                let line_txn = line_txn.split('|').next().unwrap_or(line_txn);
                let audio = record.dir_path.join(&record.rel_path).join(line_path);
                writeln!(f_out, "{}|{}|{}", audio.display(), line_txn, speaker_id)?;
            }
        }
        Ok(())
    }

    /// Dump every record as CSV for eyeballing in a spreadsheet.
    pub fn export_csv(&self, out: impl AsRef<Path>) -> anyhow::Result<()> {
        let mut writer = csv::Writer::from_path(out.as_ref())?;
        writer.write_record([
            "id",
            "filelist_path",
            "speaker_name",
            "dir_path",
            "rel_path",
            "dataset_name",
        ])?;
        for r in &self.records {
            writer.write_record([
                r.id.as_str(),
                r.filelist_path.as_str(),
                r.speaker_name.as_str(),
                &r.dir_path.display().to_string(),
                r.rel_path.as_str(),
                r.dataset_name.as_str(),
            ])?;
        }
        writer.flush()?;
        Ok(())
    }
}
