pub mod arch;
pub mod data;
pub mod error;
pub mod optimization;

pub use error::{MlErr, Result};
