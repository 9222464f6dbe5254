use ndarray::prelude::*;
use rand::Rng;

use crate::{MlErr, Result, arch::activations::ActFn};

/// A fully connected layer: `a = act_fn(x · w + b)`.
///
/// Its parameters are laid out as the `dim.0 x dim.1` weight matrix in row major order
/// followed by the `dim.1` biases, the gradient uses the same layout.
#[derive(Debug, Clone)]
pub struct Dense {
    dim: (usize, usize),
    act_fn: Option<ActFn>,
    size: usize,

    // Forward metadata
    x: Option<Array2<f32>>,
    z: Array2<f32>,
}

impl Dense {
    /// Creates a new `Dense` layer.
    ///
    /// # Arguments
    /// * `dim` - The amount of input and output features.
    /// * `act_fn` - An optional activation function.
    ///
    /// # Returns
    /// A new `Dense` instance.
    pub fn new(dim: (usize, usize), act_fn: Option<ActFn>) -> Self {
        Self {
            dim,
            size: (dim.0 + 1) * dim.1,
            act_fn,
            x: None,
            z: Array2::zeros((0, dim.1)),
        }
    }

    /// Returns the amount of parameters this layer has.
    pub fn size(&self) -> usize {
        self.size
    }

    /// Returns the amount of input and output features.
    pub fn dim(&self) -> (usize, usize) {
        self.dim
    }

    pub fn forward(&mut self, params: &[f32], x: ArrayView2<f32>) -> Result<Array2<f32>> {
        MlErr::check_size("dense input features", x.ncols(), self.dim.0)?;
        let (w, b) = self.view_params(params)?;

        let z = x.dot(&w) + &b;
        let a = match &self.act_fn {
            Some(act_fn) => z.mapv(|z| act_fn.f(z)),
            None => z.clone(),
        };

        self.x = Some(x.to_owned());
        self.z = z;
        Ok(a)
    }

    /// Writes this layer's gradient into `grad` and returns the gradient with respect to its
    /// input.
    ///
    /// # Arguments
    /// * `params` - This layer's parameters.
    /// * `grad` - This layer's slice of the gradient, overwritten.
    /// * `d` - The gradient of the loss with respect to this layer's output.
    pub fn backward(
        &mut self,
        params: &[f32],
        grad: &mut [f32],
        mut d: Array2<f32>,
    ) -> Result<Array2<f32>> {
        let Some(x) = &self.x else {
            return Err(MlErr::InvalidInput(
                "dense backward called before forward".into(),
            ));
        };

        MlErr::check_size("dense delta rows", d.nrows(), x.nrows())?;
        MlErr::check_size("dense delta columns", d.ncols(), self.dim.1)?;

        if let Some(act_fn) = &self.act_fn {
            d.zip_mut_with(&self.z, |d, &z| *d *= act_fn.df(z));
        }

        let (w, _) = self.view_params(params)?;
        let (mut dw, mut db) = self.view_grad(grad)?;
        dw.assign(&x.t().dot(&d));
        db.assign(&d.sum_axis(Axis(0)));

        Ok(d.dot(&w.t()))
    }

    /// Fills `params` with uniform weights scaled to the fan in (and fan out for saturating
    /// activations) and zero biases.
    pub fn init_params<R: Rng>(&self, params: &mut [f32], rng: &mut R) {
        let (fan_in, fan_out) = self.dim;
        let limit = match self.act_fn {
            Some(ActFn::Relu(_)) => (6. / fan_in as f32).sqrt(),
            _ => (6. / (fan_in + fan_out) as f32).sqrt(),
        };

        let w_size = self.size - fan_out;
        let (w, b) = params.split_at_mut(w_size.min(params.len()));

        w.iter_mut()
            .for_each(|w| *w = rng.random_range(-limit..limit));
        b.fill(0.);
    }

    /// Gives a view of the raw gradient slice as the delta weights and delta biases of this layer.
    fn view_grad<'a>(
        &self,
        grad: &'a mut [f32],
    ) -> Result<(ArrayViewMut2<'a, f32>, ArrayViewMut1<'a, f32>)> {
        MlErr::check_size("dense gradient", grad.len(), self.size)?;

        let w_size = self.size - self.dim.1;
        let (dw_raw, db_raw) = grad.split_at_mut(w_size);
        let dw = ArrayViewMut2::from_shape(self.dim, dw_raw).map_err(Self::shape_err)?;
        let db = ArrayViewMut1::from_shape(self.dim.1, db_raw).map_err(Self::shape_err)?;
        Ok((dw, db))
    }

    /// Gives a view of the raw parameter slice as the weights and biases of this layer.
    fn view_params<'a>(&self, params: &'a [f32]) -> Result<(ArrayView2<'a, f32>, ArrayView1<'a, f32>)> {
        MlErr::check_size("dense parameters", params.len(), self.size)?;

        let w_size = self.size - self.dim.1;
        let (w_raw, b_raw) = params.split_at(w_size);
        let w = ArrayView2::from_shape(self.dim, w_raw).map_err(Self::shape_err)?;
        let b = ArrayView1::from_shape(self.dim.1, b_raw).map_err(Self::shape_err)?;
        Ok((w, b))
    }

    fn shape_err(e: ndarray::ShapeError) -> MlErr {
        MlErr::InvalidInput(format!("dense layer shape: {e}"))
    }
}
