//! Automatic mixed precision: dynamic loss scaling, half precision storage and gradient
//! clipping.

mod clip;
mod precision;
mod scaler;

pub use clip::{clip_grad_norm, grad_norm};
pub use precision::Precision;
pub use scaler::GradScaler;
