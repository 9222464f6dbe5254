use std::io;

use comms::msg::Reduction;
use log::{info, warn};
use tokio::{sync::Mutex, task::JoinHandle};

use crate::{
    Backend, Config, ConfigErr, DistErr, Group, ParallelLayout, ParallelMode, Result,
    communicator::Communicator,
};

/// Element-wise operations available to `Context::all_reduce`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReduceOp {
    Sum,
    Avg,
    Max,
    Min,
}

impl From<ReduceOp> for Reduction {
    fn from(op: ReduceOp) -> Self {
        match op {
            ReduceOp::Sum => Reduction::Sum,
            ReduceOp::Avg => Reduction::Avg,
            ReduceOp::Max => Reduction::Max,
            ReduceOp::Min => Reduction::Min,
        }
    }
}

/// A rank's membership in the process group of a training job.
///
/// Created by `launch` and shared behind an `Arc`, it stays usable until `destroy`.
pub struct Context {
    rank: usize,
    world_size: usize,
    config: Config,
    backend: Backend,
    comm: Mutex<Option<Communicator>>,
    hub: Mutex<Option<JoinHandle<io::Result<()>>>>,
}

impl Context {
    pub(crate) fn new(
        config: Config,
        rank: usize,
        world_size: usize,
        backend: Backend,
        comm: Communicator,
        hub: Option<JoinHandle<io::Result<()>>>,
    ) -> Self {
        Self {
            rank,
            world_size,
            config,
            backend,
            comm: Mutex::new(Some(comm)),
            hub: Mutex::new(hub),
        }
    }

    pub fn rank(&self) -> usize {
        self.rank
    }

    pub fn world_size(&self) -> usize {
        self.world_size
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn backend(&self) -> Backend {
        self.backend
    }

    /// Validates the config against the world and returns the layout it describes.
    pub fn layout(&self) -> std::result::Result<ParallelLayout, ConfigErr> {
        self.config.validate(self.world_size)
    }

    /// The group of the given kind this rank belongs to.
    pub fn group(&self, mode: ParallelMode) -> Result<Group> {
        Ok(self.layout()?.group(mode, self.rank))
    }

    /// Whether `destroy` was already called.
    pub async fn is_destroyed(&self) -> bool {
        self.comm.lock().await.is_none()
    }

    /// Combines `data` element-wise with the same call of every other member of `group`.
    ///
    /// Blocks until every member made the call. Every member ends up with the same values.
    pub async fn all_reduce(&self, group: &Group, data: &mut [f32], op: ReduceOp) -> Result<()> {
        self.collective(group, data, op.into()).await
    }

    /// Overwrites `data` on every member of `group` with the values of global rank `root`.
    pub async fn broadcast(&self, group: &Group, data: &mut [f32], root: usize) -> Result<()> {
        if !group.contains(root) {
            return Err(DistErr::Collective(format!(
                "broadcast root {root} is not part of the group"
            )));
        }

        let reduction = Reduction::Broadcast { root: root as u32 };
        self.collective(group, data, reduction).await
    }

    /// Blocks until every member of `group` reaches the barrier.
    pub async fn barrier(&self, group: &Group) -> Result<()> {
        self.collective(group, &mut [], Reduction::Sum).await
    }

    async fn collective(&self, group: &Group, data: &mut [f32], reduction: Reduction) -> Result<()> {
        let mut comm = self.comm.lock().await;
        let comm = comm.as_mut().ok_or(DistErr::Destroyed)?;

        if !group.contains(self.rank) {
            return Err(DistErr::Collective(format!(
                "rank {} is not a member of group {}",
                self.rank,
                group.id()
            )));
        }

        if group.size() == 1 {
            return Ok(());
        }

        comm.collective(group, data, reduction).await
    }

    /// Leaves the process group.
    ///
    /// Returns once every rank left. Rank 0 also waits for the hub to wind down. Calling it
    /// again is a no-op.
    pub async fn destroy(&self) -> Result<()> {
        let Some(mut comm) = self.comm.lock().await.take() else {
            return Ok(());
        };

        comm.leave().await?;

        if let Some(hub) = self.hub.lock().await.take() {
            match hub.await {
                Ok(res) => res?,
                Err(e) => warn!("the hub task failed: {e}"),
            }
        }

        info!(rank = self.rank; "left the process group");
        Ok(())
    }
}
