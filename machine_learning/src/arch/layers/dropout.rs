use ndarray::{Array2, ArrayView2};
use rand::{Rng, SeedableRng, rngs::StdRng};

use crate::{MlErr, Result};

/// Inverted dropout: while training, zeroes each activation with probability `p` and
/// scales the survivors by `1 / (1 - p)`. Evaluation is the identity.
#[derive(Debug, Clone)]
pub struct Dropout {
    p: f32,
    training: bool,
    mask: Option<Array2<f32>>,
    rng: StdRng,
}

impl Dropout {
    /// Creates a new `Dropout` layer.
    ///
    /// # Arguments
    /// * `p` - The drop probability, in `[0, 1)`.
    /// * `seed` - Seed for the mask sampling.
    pub fn new(p: f32, seed: u64) -> Result<Self> {
        if !(0.0..1.0).contains(&p) {
            return Err(MlErr::InvalidInput(format!(
                "dropout probability must be in [0, 1), got {p}"
            )));
        }

        Ok(Self {
            p,
            training: true,
            mask: None,
            rng: StdRng::seed_from_u64(seed),
        })
    }

    pub fn set_training(&mut self, training: bool) {
        self.training = training;
    }

    pub fn forward(&mut self, x: ArrayView2<f32>) -> Array2<f32> {
        if !self.training || self.p == 0. {
            self.mask = None;
            return x.to_owned();
        }

        let keep = 1. - self.p;
        let rng = &mut self.rng;
        let mask = Array2::from_shape_fn(x.raw_dim(), |_| {
            if rng.random::<f32>() < keep { 1. / keep } else { 0. }
        });

        let out = &x * &mask;
        self.mask = Some(mask);
        out
    }

    pub fn backward(&mut self, d: Array2<f32>) -> Array2<f32> {
        match &self.mask {
            Some(mask) => d * mask,
            None => d,
        }
    }
}

#[cfg(test)]
mod tests {
    use ndarray::array;

    use super::*;

    #[test]
    fn evaluation_is_identity() {
        let mut dropout = Dropout::new(0.5, 7).unwrap();
        dropout.set_training(false);

        let x = array![[1.0, 2.0], [3.0, 4.0]];
        assert_eq!(dropout.forward(x.view()), x);
    }

    #[test]
    fn training_masks_and_rescales() {
        let mut dropout = Dropout::new(0.5, 7).unwrap();
        let x = Array2::ones((8, 16));

        let y = dropout.forward(x.view());
        assert!(y.iter().all(|&v| v == 0.0 || v == 2.0));
        assert!(y.iter().any(|&v| v == 0.0));

        let d = dropout.backward(Array2::ones((8, 16)));
        assert_eq!(d, y);
    }

    #[test]
    fn rejects_probability_one() {
        assert!(Dropout::new(1.0, 0).is_err());
    }
}
