use std::sync::Arc;

use ndarray::Array2;
use rand::{SeedableRng, rngs::StdRng, seq::SliceRandom};

use super::{Dataset, ShardSpec};
use crate::{MlErr, Result};

/// One batch of inputs and targets, one sample per row.
#[derive(Debug, Clone, PartialEq)]
pub struct Batch {
    pub x: Array2<f32>,
    pub y: Array2<f32>,
}

/// Shard-aware data loader.
///
/// Every epoch the whole dataset is permuted with a seed shared by all shards, then each
/// shard takes its contiguous part of the permutation, so shards never overlap and all of
/// them yield the same amount of batches.
#[derive(Debug, Clone)]
pub struct DataLoader {
    dataset: Arc<Dataset>,
    shard: ShardSpec,
    batch_size: usize,
    shuffle: bool,
    drop_last: bool,
    seed: u64,
    epoch: u64,
}

impl DataLoader {
    /// Creates a new `DataLoader` over the whole dataset, without shuffling.
    ///
    /// # Arguments
    /// * `dataset` - The samples, shared between loaders.
    /// * `batch_size` - The maximum amount of samples per batch.
    pub fn new(dataset: Arc<Dataset>, batch_size: usize) -> Result<Self> {
        if batch_size == 0 {
            return Err(MlErr::InvalidInput("batch size must be positive".into()));
        }

        Ok(Self {
            dataset,
            shard: ShardSpec::whole(),
            batch_size,
            shuffle: false,
            drop_last: false,
            seed: 0,
            epoch: 0,
        })
    }

    pub fn shuffle(mut self, shuffle: bool) -> Self {
        self.shuffle = shuffle;
        self
    }

    /// Drops the samples that don't fill a whole batch, and the ones left over after an even
    /// split between shards.
    pub fn drop_last(mut self, drop_last: bool) -> Self {
        self.drop_last = drop_last;
        self
    }

    pub fn seed(mut self, seed: u64) -> Self {
        self.seed = seed;
        self
    }

    /// Restricts the loader to the given shard.
    pub fn with_shard(mut self, shard: ShardSpec) -> Self {
        self.shard = shard;
        self
    }

    pub fn shard(&self) -> ShardSpec {
        self.shard
    }

    pub fn batch_size(&self) -> usize {
        self.batch_size
    }

    pub fn dataset(&self) -> &Arc<Dataset> {
        &self.dataset
    }

    pub fn epoch(&self) -> u64 {
        self.epoch
    }

    pub fn set_epoch(&mut self, epoch: u64) {
        self.epoch = epoch;
    }

    /// The dataset indices this shard visits in the current epoch, in order.
    pub fn indices(&self) -> Vec<usize> {
        let mut permutation: Vec<usize> = (0..self.dataset.len()).collect();

        if self.shuffle {
            let mut rng = StdRng::seed_from_u64(self.seed.wrapping_add(self.epoch));
            permutation.shuffle(&mut rng);
        }

        if self.drop_last {
            let even = permutation.len() / self.shard.num_shards() * self.shard.num_shards();
            permutation.truncate(even);
        }

        self.shard.select(&permutation)
    }

    /// The amount of batches per epoch.
    pub fn len(&self) -> usize {
        let total = self.dataset.len();
        let samples = if self.drop_last {
            total / self.shard.num_shards()
        } else {
            self.shard.per_shard(total)
        };

        if self.drop_last {
            samples / self.batch_size
        } else {
            samples.div_ceil(self.batch_size)
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Yields the batches of the current epoch and moves on to the next one.
    pub fn iter(&mut self) -> Batches {
        let indices = self.indices();
        self.epoch += 1;

        Batches {
            dataset: Arc::clone(&self.dataset),
            indices,
            batch_size: self.batch_size,
            drop_last: self.drop_last,
            cursor: 0,
        }
    }
}

/// The batches of one epoch.
#[derive(Debug)]
pub struct Batches {
    dataset: Arc<Dataset>,
    indices: Vec<usize>,
    batch_size: usize,
    drop_last: bool,
    cursor: usize,
}

impl Iterator for Batches {
    type Item = Batch;

    fn next(&mut self) -> Option<Self::Item> {
        let remaining = self.indices.len() - self.cursor;

        if remaining == 0 || (self.drop_last && remaining < self.batch_size) {
            return None;
        }

        let end = self.cursor + remaining.min(self.batch_size);
        let (x, y) = self.dataset.gather(&self.indices[self.cursor..end]);
        self.cursor = end;

        Some(Batch { x, y })
    }
}

#[cfg(test)]
mod tests {
    use std::{collections::HashSet, num::NonZeroUsize};

    use super::*;

    fn dataset(n: usize) -> Arc<Dataset> {
        let data = (0..n).flat_map(|i| [i as f32, i as f32 + 100.0]).collect();
        Arc::new(Dataset::new(data, 1, 1).unwrap())
    }

    fn shard(rank: usize, n: usize) -> ShardSpec {
        ShardSpec::new(rank, NonZeroUsize::new(n).unwrap()).unwrap()
    }

    fn firsts(batch: &Batch) -> Vec<f32> {
        batch.x.column(0).to_vec()
    }

    #[test]
    fn sequential_batches_keep_order() {
        let mut dl = DataLoader::new(dataset(5), 2).unwrap();
        let batches: Vec<_> = dl.iter().collect();

        assert_eq!(batches.len(), 3);
        assert_eq!(firsts(&batches[0]), vec![0.0, 1.0]);
        assert_eq!(firsts(&batches[2]), vec![4.0]);
        assert_eq!(batches[1].y.column(0).to_vec(), vec![102.0, 103.0]);
        assert_eq!(dl.len(), 3);
    }

    #[test]
    fn drop_last_skips_partial_batch() {
        let mut dl = DataLoader::new(dataset(5), 2).unwrap().drop_last(true);

        assert_eq!(dl.iter().count(), 2);
        assert_eq!(dl.len(), 2);
    }

    #[test]
    fn shuffled_shards_are_disjoint_and_balanced() {
        let ds = dataset(20);
        let mut seen = HashSet::new();

        for rank in 0..4 {
            let mut dl = DataLoader::new(Arc::clone(&ds), 2)
                .unwrap()
                .shuffle(true)
                .seed(7)
                .with_shard(shard(rank, 4));

            let batches: Vec<_> = dl.iter().collect();
            assert_eq!(batches.len(), 3);

            for v in batches.iter().flat_map(firsts) {
                assert!(seen.insert(v as usize));
            }
        }

        assert_eq!(seen.len(), 20);
    }

    #[test]
    fn epochs_reshuffle_deterministically() {
        let build = || {
            DataLoader::new(dataset(32), 32)
                .unwrap()
                .shuffle(true)
                .seed(1)
        };

        let (mut a, mut b) = (build(), build());
        let first = a.iter().next().unwrap();
        let second = a.iter().next().unwrap();

        assert_eq!(first, b.iter().next().unwrap());
        assert_ne!(first, second);
        assert_eq!(a.epoch(), 2);
    }

    #[test]
    fn zero_batch_size_is_rejected() {
        assert!(DataLoader::new(dataset(3), 0).is_err());
    }
}
