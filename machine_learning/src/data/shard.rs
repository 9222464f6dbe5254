use std::{num::NonZeroUsize, ops::Range};

use crate::{MlErr, Result};

/// The slice of every epoch's sample permutation that one data-parallel rank consumes.
///
/// Shards are contiguous, disjoint and of equal length: when the amount of samples isn't a
/// multiple of the amount of shards, the permutation is padded by wrapping around so that
/// every rank yields the same amount of batches.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ShardSpec {
    rank: usize,
    num_shards: NonZeroUsize,
}

impl ShardSpec {
    /// Creates a new `ShardSpec`.
    ///
    /// # Arguments
    /// * `rank` - This shard's index, in `[0, num_shards)`.
    /// * `num_shards` - The amount of shards the data is split in.
    pub fn new(rank: usize, num_shards: NonZeroUsize) -> Result<Self> {
        if rank >= num_shards.get() {
            return Err(MlErr::InvalidInput(format!(
                "shard rank {rank} out of range for {num_shards} shards"
            )));
        }

        Ok(Self { rank, num_shards })
    }

    /// The shard that covers the whole dataset.
    pub fn whole() -> Self {
        Self {
            rank: 0,
            num_shards: NonZeroUsize::MIN,
        }
    }

    pub fn rank(&self) -> usize {
        self.rank
    }

    pub fn num_shards(&self) -> usize {
        self.num_shards.get()
    }

    /// The amount of samples each shard gets out of `total`.
    pub fn per_shard(&self, total: usize) -> usize {
        total.div_ceil(self.num_shards.get())
    }

    /// The positions of the padded permutation this shard takes.
    pub fn range(&self, total: usize) -> Range<usize> {
        let per_shard = self.per_shard(total);
        let start = self.rank * per_shard;
        start..start + per_shard
    }

    /// Picks this shard's samples out of a permutation of `[0, total)`.
    pub fn select(&self, permutation: &[usize]) -> Vec<usize> {
        let total = permutation.len();
        if total == 0 {
            return Vec::new();
        }

        self.range(total).map(|i| permutation[i % total]).collect()
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;

    use super::*;

    fn shards(n: usize) -> Vec<ShardSpec> {
        let num = NonZeroUsize::new(n).unwrap();
        (0..n).map(|r| ShardSpec::new(r, num).unwrap()).collect()
    }

    #[test]
    fn even_split_is_disjoint_and_covers() {
        let perm: Vec<usize> = (0..12).rev().collect();
        let mut seen = HashSet::new();

        for shard in shards(4) {
            let picked = shard.select(&perm);
            assert_eq!(picked.len(), 3);
            assert!(picked.into_iter().all(|i| seen.insert(i)));
        }

        assert_eq!(seen.len(), 12);
    }

    #[test]
    fn uneven_split_pads_by_wrapping() {
        let perm: Vec<usize> = (0..10).collect();
        let all = shards(4);

        assert_eq!(all[0].select(&perm), vec![0, 1, 2]);
        assert_eq!(all[3].select(&perm), vec![9, 0, 1]);
        assert!(all.iter().all(|s| s.select(&perm).len() == 3));
    }

    #[test]
    fn rank_out_of_range_is_rejected() {
        assert!(ShardSpec::new(2, NonZeroUsize::new(2).unwrap()).is_err());
    }
}
