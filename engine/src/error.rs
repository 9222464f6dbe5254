use std::{
    error::Error,
    fmt::{self, Display},
};

use distributed::{ConfigErr, DistErr};
use machine_learning::MlErr;

/// The result type of the engine module.
pub type Result<T> = std::result::Result<T, EngineErr>;

/// Calls made out of order. They point at a bug in the training loop and are never
/// recovered from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UsageErr {
    /// A training step must start with `zero_grad`.
    MissingZeroGrad,
    /// The loss doesn't come from a forward pass whose activations are still available.
    BackwardWithoutForward,
    /// The loss comes from an older forward pass than the latest one.
    StaleForward { forward: u64, latest: u64 },
    StepWithoutBackward,
    /// Backward passes need the model in training mode.
    NotTraining,
    /// The distributed context was destroyed.
    Destroyed,
}

impl Display for UsageErr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::MissingZeroGrad => write!(f, "zero_grad must be called before a training pass"),
            Self::BackwardWithoutForward => {
                write!(f, "backward needs a loss computed from the latest forward pass")
            }
            Self::StaleForward { forward, latest } => write!(
                f,
                "the loss comes from forward pass {forward} but the latest one is {latest}"
            ),
            Self::StepWithoutBackward => write!(f, "step must follow a backward pass"),
            Self::NotTraining => write!(f, "the engine is in evaluation mode"),
            Self::Destroyed => write!(f, "the distributed context was destroyed"),
        }
    }
}

impl Error for UsageErr {}

/// The engine's error type.
#[derive(Debug)]
pub enum EngineErr {
    Dist(DistErr),
    Config(ConfigErr),
    Usage(UsageErr),
    Ml(MlErr),
}

impl Display for EngineErr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Dist(e) => write!(f, "distributed error: {e}"),
            Self::Config(e) => write!(f, "{e}"),
            Self::Usage(e) => write!(f, "usage error: {e}"),
            Self::Ml(e) => write!(f, "machine learning error: {e}"),
        }
    }
}

impl Error for EngineErr {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            Self::Dist(e) => Some(e),
            Self::Config(e) => Some(e),
            Self::Usage(e) => Some(e),
            Self::Ml(e) => Some(e),
        }
    }
}

impl From<DistErr> for EngineErr {
    fn from(e: DistErr) -> Self {
        match e {
            DistErr::Destroyed => Self::Usage(UsageErr::Destroyed),
            DistErr::Config(e) => Self::Config(e),
            e => Self::Dist(e),
        }
    }
}

impl From<ConfigErr> for EngineErr {
    fn from(e: ConfigErr) -> Self {
        Self::Config(e)
    }
}

impl From<UsageErr> for EngineErr {
    fn from(e: UsageErr) -> Self {
        Self::Usage(e)
    }
}

impl From<MlErr> for EngineErr {
    fn from(e: MlErr) -> Self {
        Self::Ml(e)
    }
}
