//! Mixed precision, data parallel training on top of a distributed process group.

pub mod amp;
mod engine;
mod error;
mod initialize;

pub use engine::{Engine, Loss, Output, Phase, StepReport};
pub use error::{EngineErr, Result, UsageErr};
pub use initialize::initialize;
