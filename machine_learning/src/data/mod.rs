mod dataloader;
mod dataset;
mod shard;

pub use dataloader::{Batch, Batches, DataLoader};
pub use dataset::Dataset;
pub use shard::ShardSpec;
