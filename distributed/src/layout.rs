use crate::ConfigErr;

/// The kinds of process groups a parallel layout is made of.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ParallelMode {
    /// Every rank of the job.
    Global = 0,
    /// Ranks that hold a replica of the same model shard and average their gradients.
    Data = 1,
    /// Ranks that together hold one full replica of the model.
    Model = 2,
    /// Ranks that split the layers of a pipeline stage.
    Tensor = 3,
    /// Ranks that hold consecutive stages of the pipeline.
    Pipeline = 4,
}

/// A set of ranks that run collectives together.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Group {
    mode: ParallelMode,
    index: usize,
    ranks: Vec<usize>,
}

impl Group {
    /// Identifies the group on the wire, unique within a job.
    pub fn id(&self) -> u32 {
        ((self.mode as u32) << 16) | self.index as u32
    }

    pub fn mode(&self) -> ParallelMode {
        self.mode
    }

    /// The member ranks, in ascending order.
    pub fn ranks(&self) -> &[usize] {
        &self.ranks
    }

    pub fn size(&self) -> usize {
        self.ranks.len()
    }

    pub fn contains(&self, rank: usize) -> bool {
        self.ranks.binary_search(&rank).is_ok()
    }

    /// The position of the global `rank` inside the group.
    pub fn local_rank(&self, rank: usize) -> Option<usize> {
        self.ranks.binary_search(&rank).ok()
    }
}

/// How the ranks of a job are arranged in data, tensor and pipeline parallel groups.
///
/// Tensor groups are runs of consecutive ranks, pipeline stages are consecutive blocks of
/// `world_size / pipeline` ranks and data groups pick the ranks with the same tensor rank
/// within a stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ParallelLayout {
    world_size: usize,
    pipeline: usize,
    tensor: usize,
}

impl ParallelLayout {
    /// Creates a new `ParallelLayout`.
    ///
    /// # Arguments
    /// * `world_size` - The amount of ranks.
    /// * `pipeline` - The amount of pipeline stages.
    /// * `tensor` - The amount of ranks in each tensor group.
    pub fn new(world_size: usize, pipeline: usize, tensor: usize) -> Result<Self, ConfigErr> {
        if world_size == 0 || pipeline == 0 || tensor == 0 {
            return Err(ConfigErr::Invalid(format!(
                "parallel sizes must be positive, got world {world_size}, pipeline {pipeline} and tensor {tensor}"
            )));
        }

        let Some(model) = pipeline.checked_mul(tensor) else {
            return Err(ConfigErr::Invalid(format!(
                "pipeline {pipeline} times tensor {tensor} doesn't fit in a rank count"
            )));
        };

        if world_size % model != 0 {
            return Err(ConfigErr::Indivisible {
                world_size,
                pipeline,
                tensor,
            });
        }

        Ok(Self {
            world_size,
            pipeline,
            tensor,
        })
    }

    pub fn world_size(&self) -> usize {
        self.world_size
    }

    pub fn pipeline_size(&self) -> usize {
        self.pipeline
    }

    pub fn tensor_size(&self) -> usize {
        self.tensor
    }

    pub fn data_size(&self) -> usize {
        self.world_size / (self.pipeline * self.tensor)
    }

    fn stage_size(&self) -> usize {
        self.world_size / self.pipeline
    }

    /// Returns the group of the given mode that `rank` belongs to.
    ///
    /// # Arguments
    /// * `mode` - The kind of group.
    /// * `rank` - A global rank, in `[0, world_size)`.
    pub fn group(&self, mode: ParallelMode, rank: usize) -> Group {
        let (stage_size, tensor) = (self.stage_size(), self.tensor);
        let stage = rank / stage_size;
        let tensor_rank = rank % tensor;
        let data_rank = (rank % stage_size) / tensor;

        let (index, ranks): (usize, Vec<usize>) = match mode {
            ParallelMode::Global => (0, (0..self.world_size).collect()),
            ParallelMode::Tensor => {
                let index = rank / tensor;
                (index, (index * tensor..(index + 1) * tensor).collect())
            }
            ParallelMode::Pipeline => {
                let index = rank % stage_size;
                let ranks = (0..self.pipeline).map(|s| s * stage_size + index).collect();
                (index, ranks)
            }
            ParallelMode::Data => {
                let ranks = (0..self.data_size())
                    .map(|d| stage * stage_size + d * tensor + tensor_rank)
                    .collect();
                (stage * tensor + tensor_rank, ranks)
            }
            ParallelMode::Model => {
                let mut ranks: Vec<usize> = (0..self.pipeline)
                    .flat_map(|s| (0..tensor).map(move |t| s * stage_size + data_rank * tensor + t))
                    .collect();
                ranks.sort_unstable();
                (data_rank, ranks)
            }
        };

        Group { mode, index, ranks }
    }
}
