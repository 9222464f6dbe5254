use ndarray::{Array2, ArrayView2};
use rand::Rng;

use crate::Result;

/// A differentiable model whose parameters live outside of it, in a flat buffer.
///
/// Keeping the parameters flat lets callers reduce, scale, clip and update them as a
/// single slice regardless of the model's shape.
pub trait Model: Send {
    /// Returns the amount of parameters in the model.
    fn size(&self) -> usize;

    /// Switches between training and evaluation behavior.
    fn set_training(&mut self, training: bool);

    /// Makes a forward pass, caching whatever `backward` needs.
    ///
    /// # Arguments
    /// * `params` - The model's parameters, `size()` long.
    /// * `x` - A batch of inputs, one sample per row.
    ///
    /// # Returns
    /// The model's output for the batch.
    fn forward(&mut self, params: &[f32], x: ArrayView2<f32>) -> Result<Array2<f32>>;

    /// Back-propagates `d`, the gradient of the loss with respect to the last output, and
    /// writes the gradient with respect to `params` into `grad`.
    ///
    /// `grad` is overwritten, not accumulated into.
    fn backward(&mut self, params: &[f32], grad: &mut [f32], d: Array2<f32>) -> Result<()>;

    /// Samples a fresh set of parameters.
    fn init_params<R: Rng>(&self, rng: &mut R) -> Vec<f32>;
}
