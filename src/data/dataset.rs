use std::{num::NonZeroUsize, path::PathBuf};

use rand::{seq::SliceRandom, Rng};
use serde::{Deserialize, Serialize};

use crate::{NetErr, Result};

/// A volume file and its class.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VolumeEntry {
    pub path: PathBuf,
    pub label: usize,
}

/// The volumes of a training run. Only the paths are kept in memory, every batch is read
/// from disk when needed.
#[derive(Debug, Clone)]
pub struct LabeledVolumes {
    entries: Vec<VolumeEntry>,
}

impl LabeledVolumes {
    /// Creates a new `LabeledVolumes`.
    ///
    /// # Arguments
    /// * `entries` - The volumes and their labels.
    /// * `classes` - The amount of classes every label must be below.
    ///
    /// # Returns
    /// The dataset or an error if it's empty or a label is out of range.
    pub fn new(entries: Vec<VolumeEntry>, classes: usize) -> Result<Self> {
        if entries.is_empty() {
            return Err(NetErr::EmptyDataset);
        }

        if let Some(entry) = entries.iter().find(|e| e.label >= classes) {
            return Err(NetErr::LabelOutOfRange {
                label: entry.label,
                classes,
            });
        }

        Ok(Self { entries })
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn entries(&self) -> &[VolumeEntry] {
        &self.entries
    }

    pub fn shuffle<R: Rng>(&mut self, rng: &mut R) {
        self.entries.shuffle(rng);
    }

    /// Splits the dataset in batches of `batch_size` entries, the last one possibly shorter.
    /// A trailing single entry joins the batch before it.
    pub fn batches(&self, batch_size: NonZeroUsize) -> impl Iterator<Item = &[VolumeEntry]> {
        let size = batch_size.get();
        let len = self.entries.len();
        let nbatches = if len % size == 1 && len > size {
            len / size
        } else {
            len.div_ceil(size)
        };

        (0..nbatches).map(move |i| {
            let start = i * size;
            let end = if i + 1 == nbatches { len } else { start + size };
            &self.entries[start..end]
        })
    }
}
