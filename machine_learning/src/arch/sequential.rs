use ndarray::{Array2, ArrayView2};
use rand::Rng;

use super::{Model, layers::Layer};
use crate::{MlErr, Result};

/// A sequential model: information flows forward when computing an output and backward when
/// computing the *deltas* of its layers.
#[derive(Debug, Clone)]
pub struct Sequential {
    layers: Vec<Layer>,
}

impl Sequential {
    /// Creates a new `Sequential`.
    ///
    /// # Arguments
    /// * `layers` - The layers the sequential is composed of.
    ///
    /// # Returns
    /// A new `Sequential` instance.
    pub fn new<I>(layers: I) -> Self
    where
        I: IntoIterator<Item = Layer>,
    {
        Self {
            layers: layers.into_iter().collect(),
        }
    }

    pub fn layers(&self) -> &[Layer] {
        &self.layers
    }
}

impl Model for Sequential {
    fn size(&self) -> usize {
        self.layers.iter().map(Layer::size).sum()
    }

    fn set_training(&mut self, training: bool) {
        self.layers
            .iter_mut()
            .for_each(|layer| layer.set_training(training));
    }

    fn forward(&mut self, params: &[f32], x: ArrayView2<f32>) -> Result<Array2<f32>> {
        MlErr::check_size("model parameters", params.len(), self.size())?;

        let mut a = x.to_owned();
        let mut start = 0;

        for layer in self.layers.iter_mut() {
            let end = start + layer.size();
            a = layer.forward(&params[start..end], a.view())?;
            start = end;
        }

        Ok(a)
    }

    fn backward(&mut self, params: &[f32], grad: &mut [f32], mut d: Array2<f32>) -> Result<()> {
        let size = self.size();
        MlErr::check_size("model parameters", params.len(), size)?;
        MlErr::check_size("model gradient", grad.len(), size)?;

        let mut end = size;

        for layer in self.layers.iter_mut().rev() {
            let start = end - layer.size();
            d = layer.backward(&params[start..end], &mut grad[start..end], d)?;
            end = start;
        }

        Ok(())
    }

    fn init_params<R: Rng>(&self, rng: &mut R) -> Vec<f32> {
        let mut params = vec![0.; self.size()];
        let mut start = 0;

        for layer in &self.layers {
            let end = start + layer.size();
            layer.init_params(&mut params[start..end], rng);
            start = end;
        }

        params
    }
}
