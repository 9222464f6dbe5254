use rayon::prelude::*;

use super::Optimizer;
use crate::{MlErr, Result};

/// Gradient descent with classical (heavy ball) momentum.
#[derive(Debug, Clone)]
pub struct GradientDescentWithMomentum {
    lr: f32,
    mu: f32,
    velocity: Vec<f32>,
}

impl GradientDescentWithMomentum {
    /// Creates a new `GradientDescentWithMomentum`.
    ///
    /// # Arguments
    /// * `len` - The amount of parameters to optimize.
    /// * `lr` - The learning rate.
    /// * `mu` - How much of the previous velocity carries over, in `[0, 1)`.
    pub fn new(len: usize, lr: f32, mu: f32) -> Self {
        Self {
            lr,
            mu,
            velocity: vec![0.; len],
        }
    }
}

impl Optimizer for GradientDescentWithMomentum {
    fn update_params(&mut self, params: &mut [f32], grad: &[f32]) -> Result<()> {
        MlErr::check_size("gradient", grad.len(), params.len())?;
        MlErr::check_size("velocity", self.velocity.len(), params.len())?;

        let (lr, mu) = (self.lr, self.mu);

        self.velocity
            .par_iter_mut()
            .zip(grad)
            .zip(params.par_iter_mut())
            .for_each(|((v, &g), p)| {
                *v = mu * *v + g;
                *p -= lr * *v;
            });

        Ok(())
    }
}
