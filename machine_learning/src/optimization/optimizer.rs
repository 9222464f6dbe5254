use crate::Result;

/// An update rule for a flat parameter buffer.
pub trait Optimizer: Send {
    /// Applies one update to `params` using `grad`.
    ///
    /// # Arguments
    /// * `params` - The parameters that are going to be modified.
    /// * `grad` - The gradient used for taking the step.
    ///
    /// # Returns
    /// A size mismatch error if `params`, `grad` and the optimizer's state disagree in length.
    fn update_params(&mut self, params: &mut [f32], grad: &[f32]) -> Result<()>;
}
