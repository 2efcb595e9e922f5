//! Batching: epoch sampling (with optional sharding across workers) and the collate step that
//! pads variable-length items into dense tensors.
use crate::dataset::{DatasetItem, TextMelDataset};
use crate::model::RawBatch;
use ndarray::{Array1, Array2, Array3};
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;

/// Produces the index order for each epoch. Shuffling is keyed off `seed + epoch` so every
/// worker of a distributed run deals the same deck and then takes its own interleaved share.
#[derive(Debug, Clone)]
pub struct EpochSampler {
    len: usize,
    shuffle: bool,
    seed: u64,
    rank: usize,
    world_size: usize,
}

impl EpochSampler {
    pub fn local(len: usize, shuffle: bool, seed: u64) -> Self {
        Self {
            len,
            shuffle,
            seed,
            rank: 0,
            world_size: 1,
        }
    }

    pub fn sharded(len: usize, shuffle: bool, seed: u64, rank: usize, world_size: usize) -> Self {
        Self {
            len,
            shuffle,
            seed,
            rank,
            world_size,
        }
    }

    /// This worker's indices for the given epoch. When the dataset doesn't split evenly the
    /// order is padded by wrapping around, so every worker sees the same number of items.
    pub fn indices(&self, epoch: u64) -> Vec<usize> {
        let mut order: Vec<usize> = (0..self.len).collect();
        if self.shuffle {
            let mut rng = StdRng::seed_from_u64(self.seed.wrapping_add(epoch));
            order.shuffle(&mut rng);
        }
        if self.world_size > 1 {
            let remainder = order.len() % self.world_size;
            if remainder != 0 {
                let pad = self.world_size - remainder;
                let padding: Vec<usize> = order.iter().copied().cycle().take(pad).collect();
                order.extend(padding);
            }
        }
        order
            .into_iter()
            .skip(self.rank)
            .step_by(self.world_size)
            .collect()
    }
}

/// Pads a batch of items into dense tensors. Mel lengths are rounded up to a multiple of the
/// current frames-per-step so the decoder's step count divides evenly.
#[derive(Debug, Clone)]
pub struct TextMelCollate {
    pub n_frames_per_step: usize,
    pub include_f0: bool,
}

impl TextMelCollate {
    pub fn new(n_frames_per_step: usize, include_f0: bool) -> Self {
        Self {
            n_frames_per_step,
            include_f0,
        }
    }

    pub fn collate(&self, mut items: Vec<DatasetItem>) -> anyhow::Result<RawBatch> {
        if items.is_empty() {
            anyhow::bail!("cannot collate an empty batch");
        }
        items.sort_by_key(|item| std::cmp::Reverse(item.sequence.len()));

        let batch = items.len();
        let n_mels = items[0].mel.shape()[0];
        let max_input_len = items[0].sequence.len();
        let mut max_target_len = items
            .iter()
            .map(|item| item.mel.shape()[1])
            .max()
            .unwrap_or(0);
        if max_target_len % self.n_frames_per_step != 0 {
            max_target_len += self.n_frames_per_step - max_target_len % self.n_frames_per_step;
        }

        let mut text_padded = Array2::zeros((batch, max_input_len));
        let mut input_lengths = Array1::zeros(batch);
        let mut mel_padded = Array3::zeros((batch, n_mels, max_target_len));
        let mut gate_padded = Array2::zeros((batch, max_target_len));
        let mut output_lengths = Array1::zeros(batch);
        let mut speaker_ids = Array1::zeros(batch);

        for (b, item) in items.iter().enumerate() {
            if item.mel.shape()[0] != n_mels {
                anyhow::bail!(
                    "item has {} mel channels where the batch has {}",
                    item.mel.shape()[0],
                    n_mels
                );
            }
            input_lengths[b] = item.sequence.len() as i64;
            for (i, &id) in item.sequence.iter().enumerate() {
                text_padded[[b, i]] = id;
            }
            let frames = item.mel.shape()[1];
            mel_padded
                .slice_mut(ndarray::s![b, .., ..frames])
                .assign(&item.mel);
            // Stop token on from the final real frame through the padding.
            for t in frames.saturating_sub(1)..max_target_len {
                gate_padded[[b, t]] = 1.0;
            }
            output_lengths[b] = frames as i64;
            speaker_ids[b] = item.speaker_id;
        }

        let f0 = self
            .include_f0
            .then(|| Array3::zeros((batch, 1, max_target_len)));

        Ok(RawBatch {
            text_padded,
            input_lengths,
            mel_padded,
            gate_padded,
            output_lengths,
            speaker_ids,
            f0,
        })
    }
}

/// Iterates a dataset in collated batches for one epoch. The trailing partial batch is kept,
/// matching drop_last = false semantics.
pub struct DataLoader<'a> {
    dataset: &'a TextMelDataset,
    indices: Vec<usize>,
    collate: TextMelCollate,
    batch_size: usize,
    cursor: usize,
}

impl<'a> DataLoader<'a> {
    pub fn new(
        dataset: &'a TextMelDataset,
        sampler: &EpochSampler,
        epoch: u64,
        batch_size: usize,
        collate: TextMelCollate,
    ) -> Self {
        Self {
            dataset,
            indices: sampler.indices(epoch),
            collate,
            batch_size,
            cursor: 0,
        }
    }

    /// Batches this loader will yield.
    pub fn len(&self) -> usize {
        self.indices.len().div_ceil(self.batch_size)
    }

    pub fn is_empty(&self) -> bool {
        self.indices.is_empty()
    }
}

impl Iterator for DataLoader<'_> {
    type Item = anyhow::Result<RawBatch>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.cursor >= self.indices.len() {
            return None;
        }
        let end = (self.cursor + self.batch_size).min(self.indices.len());
        let batch_indices = &self.indices[self.cursor..end];
        self.cursor = end;

        let mut items = Vec::with_capacity(batch_indices.len());
        for &i in batch_indices {
            match self.dataset.get(i) {
                Ok(item) => items.push(item),
                Err(e) => return Some(Err(e)),
            }
        }
        Some(self.collate.collate(items))
    }
}
