use ndarray::Array2;
use rand::Rng;
use rand_distr::{Distribution, Normal};

use crate::{MlErr, Result};

/// An in-memory supervised dataset.
///
/// Samples are stored row by row in a flat buffer: the `x_size` input features followed by
/// the `y_size` target values.
#[derive(Debug, Clone)]
pub struct Dataset {
    data: Vec<f32>,
    x_size: usize,
    y_size: usize,
    len: usize,
}

impl Dataset {
    /// Creates a new `Dataset`.
    ///
    /// # Arguments
    /// * `data` - The flat rows.
    /// * `x_size` - The amount of input features per sample.
    /// * `y_size` - The amount of target values per sample.
    pub fn new(data: Vec<f32>, x_size: usize, y_size: usize) -> Result<Self> {
        let row = x_size + y_size;

        if x_size == 0 || y_size == 0 {
            return Err(MlErr::InvalidInput(
                "samples need at least one feature and one target".into(),
            ));
        }

        if data.is_empty() || data.len() % row != 0 {
            return Err(MlErr::InvalidInput(format!(
                "{} values can't be split in rows of {row}",
                data.len()
            )));
        }

        Ok(Self {
            len: data.len() / row,
            data,
            x_size,
            y_size,
        })
    }

    /// Builds a classification dataset with one-hot targets.
    ///
    /// # Arguments
    /// * `features` - `labels.len()` rows of `x_size` features.
    /// * `labels` - The class of every sample.
    /// * `x_size` - The amount of features per sample.
    /// * `classes` - The amount of classes.
    pub fn classification(
        features: &[f32],
        labels: &[usize],
        x_size: usize,
        classes: usize,
    ) -> Result<Self> {
        MlErr::check_size("features", features.len(), labels.len() * x_size)?;

        let mut data = Vec::with_capacity(labels.len() * (x_size + classes));

        for (x, &label) in features.chunks_exact(x_size.max(1)).zip(labels) {
            if label >= classes {
                return Err(MlErr::InvalidInput(format!(
                    "label {label} out of range for {classes} classes"
                )));
            }

            data.extend_from_slice(x);
            data.extend((0..classes).map(|c| if c == label { 1. } else { 0. }));
        }

        Self::new(data, x_size, classes)
    }

    /// Samples a dataset of gaussian blobs, one per class, around random centers.
    ///
    /// # Arguments
    /// * `samples` - The amount of samples.
    /// * `x_size` - The amount of features per sample.
    /// * `classes` - The amount of classes, labels are assigned round robin.
    /// * `rng` - The random source, seed it to get the same data on every rank.
    pub fn synthetic_classification<R: Rng>(
        samples: usize,
        x_size: usize,
        classes: usize,
        rng: &mut R,
    ) -> Result<Self> {
        let noise = Normal::new(0.0f32, 0.5)
            .map_err(|e| MlErr::InvalidInput(format!("noise distribution: {e}")))?;

        let centers: Vec<f32> = (0..classes * x_size)
            .map(|_| rng.random_range(-2.0..2.0))
            .collect();

        let labels: Vec<usize> = (0..samples).map(|i| i % classes.max(1)).collect();
        let features: Vec<f32> = labels
            .iter()
            .flat_map(|&label| {
                let center = &centers[label * x_size..(label + 1) * x_size];
                center.iter().map(|c| c + noise.sample(rng)).collect::<Vec<_>>()
            })
            .collect();

        Self::classification(&features, &labels, x_size, classes)
    }

    /// Returns the amount of samples.
    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn x_size(&self) -> usize {
        self.x_size
    }

    pub fn y_size(&self) -> usize {
        self.y_size
    }

    /// Returns the input features and targets of the `idx`-th sample.
    pub fn sample(&self, idx: usize) -> (&[f32], &[f32]) {
        let row = self.x_size + self.y_size;
        let start = idx * row;
        self.data[start..start + row].split_at(self.x_size)
    }

    /// Copies the given samples into an input and a target matrix.
    pub fn gather(&self, indices: &[usize]) -> (Array2<f32>, Array2<f32>) {
        let mut x = Array2::zeros((indices.len(), self.x_size));
        let mut y = Array2::zeros((indices.len(), self.y_size));

        for (i, &idx) in indices.iter().enumerate() {
            let (xs, ys) = self.sample(idx);
            x.row_mut(i)
                .iter_mut()
                .zip(xs)
                .for_each(|(dst, src)| *dst = *src);
            y.row_mut(i)
                .iter_mut()
                .zip(ys)
                .for_each(|(dst, src)| *dst = *src);
        }

        (x, y)
    }
}

#[cfg(test)]
mod tests {
    use rand::{SeedableRng, rngs::StdRng};

    use super::*;

    #[test]
    fn rows_split_into_features_and_targets() {
        let ds = Dataset::new(vec![1.0, 2.0, 3.0, 4.0, 5.0, 6.0], 2, 1).unwrap();

        assert_eq!(ds.len(), 2);
        assert_eq!(ds.sample(1), (&[4.0, 5.0][..], &[6.0][..]));
    }

    #[test]
    fn rejects_ragged_buffers() {
        assert!(Dataset::new(vec![1.0, 2.0, 3.0, 4.0], 2, 1).is_err());
        assert!(Dataset::new(vec![], 2, 1).is_err());
    }

    #[test]
    fn classification_is_one_hot() {
        let ds = Dataset::classification(&[0.5, -0.5], &[2, 0], 1, 3).unwrap();
        let (x, y) = ds.gather(&[0, 1]);

        assert_eq!(x.column(0).to_vec(), vec![0.5, -0.5]);
        assert_eq!(y.row(0).to_vec(), vec![0.0, 0.0, 1.0]);
        assert_eq!(y.row(1).to_vec(), vec![1.0, 0.0, 0.0]);
    }

    #[test]
    fn synthetic_data_is_reproducible() {
        let a = Dataset::synthetic_classification(40, 4, 10, &mut StdRng::seed_from_u64(9)).unwrap();
        let b = Dataset::synthetic_classification(40, 4, 10, &mut StdRng::seed_from_u64(9)).unwrap();

        assert_eq!(a.len(), 40);
        assert_eq!(a.y_size(), 10);
        assert_eq!(a.gather(&[5, 17]), b.gather(&[5, 17]));
    }
}
