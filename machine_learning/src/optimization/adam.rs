use rayon::prelude::*;

use super::Optimizer;
use crate::{MlErr, Result};

/// Adaptive moment estimation with bias corrected moments.
#[derive(Debug, Clone)]
pub struct Adam {
    lr: f32,
    betas: (f32, f32),
    eps: f32,
    /// Updates applied so far.
    t: i32,
    /// First and second moment estimates, one pair per parameter.
    moments: Vec<(f32, f32)>,
}

impl Adam {
    /// Creates a new `Adam` optimizer.
    ///
    /// # Arguments
    /// * `len` - The amount of parameters to optimize.
    /// * `lr` - The learning rate.
    /// * `beta1` - Decay of the first moment estimate.
    /// * `beta2` - Decay of the second moment estimate.
    /// * `eps` - Added to the denominator to keep it away from zero.
    pub fn new(len: usize, lr: f32, beta1: f32, beta2: f32, eps: f32) -> Self {
        Self {
            lr,
            betas: (beta1, beta2),
            eps,
            t: 0,
            moments: vec![(0., 0.); len],
        }
    }

    /// Adam with the usual `0.9`, `0.999` and `1e-8` hyperparameters.
    pub fn with_learning_rate(len: usize, lr: f32) -> Self {
        Self::new(len, lr, 0.9, 0.999, 1e-8)
    }
}

impl Optimizer for Adam {
    fn update_params(&mut self, params: &mut [f32], grad: &[f32]) -> Result<()> {
        MlErr::check_size("gradient", grad.len(), params.len())?;
        MlErr::check_size("adam moments", self.moments.len(), params.len())?;

        self.t = self.t.saturating_add(1);
        let (b1, b2) = self.betas;
        let eps = self.eps;
        let correction1 = 1. - b1.powi(self.t);
        let correction2 = 1. - b2.powi(self.t);
        let step = self.lr * correction2.sqrt() / correction1;

        params
            .par_iter_mut()
            .zip(grad)
            .zip(self.moments.par_iter_mut())
            .for_each(|((p, &g), (m, v))| {
                *m = b1 * *m + (1. - b1) * g;
                *v = b2 * *v + (1. - b2) * g * g;
                *p -= step * *m / (v.sqrt() + eps);
            });

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn first_step_moves_by_learning_rate() {
        let mut adam = Adam::with_learning_rate(2, 0.1);
        let mut params = [1.0, -1.0];

        adam.update_params(&mut params, &[0.5, -3.0]).unwrap();

        assert!((params[0] - 0.9).abs() < 1e-4);
        assert!((params[1] + 0.9).abs() < 1e-4);
    }

    #[test]
    fn zero_gradient_keeps_params() {
        let mut adam = Adam::with_learning_rate(1, 0.1);
        let mut params = [0.25];

        adam.update_params(&mut params, &[0.0]).unwrap();
        assert_eq!(params, [0.25]);
    }

    #[test]
    fn rejects_mismatched_lengths() {
        let mut adam = Adam::with_learning_rate(2, 0.1);
        assert!(adam.update_params(&mut [0.0; 3], &[0.0; 3]).is_err());
    }
}
