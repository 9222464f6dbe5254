use std::{
    error::Error,
    fmt::{self, Display},
    io,
    time::Duration,
};

/// The result type of the distributed module.
pub type Result<T> = std::result::Result<T, DistErr>;

/// Failures while bringing up the process group. All of them are fatal.
#[derive(Debug)]
pub enum InitErr {
    UnsupportedBackend(String),
    InvalidRank { rank: usize, world_size: usize },
    PortInUse(String),
    Timeout(Duration),
    Rejected(String),
    Io(io::Error),
}

impl Display for InitErr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::UnsupportedBackend(name) => write!(f, "unsupported backend {name:?}"),
            Self::InvalidRank { rank, world_size } => {
                write!(f, "rank {rank} is not valid for a world of size {world_size}")
            }
            Self::PortInUse(addr) => write!(f, "rendezvous address {addr} is already in use"),
            Self::Timeout(after) => write!(f, "rendezvous timed out after {after:?}"),
            Self::Rejected(reason) => write!(f, "rendezvous rejected this rank: {reason}"),
            Self::Io(e) => write!(f, "io error: {e}"),
        }
    }
}

impl Error for InitErr {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            Self::Io(e) => Some(e),
            _ => None,
        }
    }
}

impl From<io::Error> for InitErr {
    fn from(e: io::Error) -> Self {
        Self::Io(e)
    }
}

/// An invalid training configuration, detected before any step runs.
#[derive(Debug, Clone, PartialEq)]
pub enum ConfigErr {
    Parse(String),
    Indivisible {
        world_size: usize,
        pipeline: usize,
        tensor: usize,
    },
    TensorMode(String),
    Invalid(String),
}

impl Display for ConfigErr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Parse(detail) => write!(f, "failed to parse config: {detail}"),
            Self::Indivisible {
                world_size,
                pipeline,
                tensor,
            } => write!(
                f,
                "world size {world_size} is not divisible by pipeline size {pipeline} times tensor size {tensor}"
            ),
            Self::TensorMode(detail) => write!(f, "invalid tensor parallel setup: {detail}"),
            Self::Invalid(detail) => write!(f, "invalid config: {detail}"),
        }
    }
}

impl Error for ConfigErr {}

/// Errors of an established process group.
#[derive(Debug)]
pub enum DistErr {
    Init(InitErr),
    Config(ConfigErr),
    /// A collective call failed or was rejected by the hub.
    Collective(String),
    /// The context was used after `destroy`.
    Destroyed,
    Io(io::Error),
}

impl Display for DistErr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Init(e) => write!(f, "{e}"),
            Self::Config(e) => write!(f, "{e}"),
            Self::Collective(detail) => write!(f, "collective failed: {detail}"),
            Self::Destroyed => write!(f, "the distributed context was already destroyed"),
            Self::Io(e) => write!(f, "io error: {e}"),
        }
    }
}

impl Error for DistErr {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            Self::Init(e) => Some(e),
            Self::Config(e) => Some(e),
            Self::Io(e) => Some(e),
            _ => None,
        }
    }
}

impl From<InitErr> for DistErr {
    fn from(e: InitErr) -> Self {
        Self::Init(e)
    }
}

impl From<ConfigErr> for DistErr {
    fn from(e: ConfigErr) -> Self {
        Self::Config(e)
    }
}

impl From<io::Error> for DistErr {
    fn from(e: io::Error) -> Self {
        Self::Io(e)
    }
}
