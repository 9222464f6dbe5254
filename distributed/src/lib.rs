//! Process group bootstrap: rendezvous of the ranks of a training job, the parallel group
//! layout they form and the collectives they run over those groups.

mod communicator;
mod config;
mod context;
mod error;
mod hub;
mod launch;
mod layout;

pub use config::{
    Config, Fp16Config, Fp16Mode, ParallelConfig, PipelineConfig, TensorConfig, TensorMode,
};
pub use context::{Context, ReduceOp};
pub use error::{ConfigErr, DistErr, InitErr, Result};
pub use launch::{Backend, LaunchOptions, free_port, launch, launch_with};
pub use layout::{Group, ParallelLayout, ParallelMode};
