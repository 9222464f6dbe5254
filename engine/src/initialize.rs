use std::{num::NonZeroUsize, sync::Arc};

use distributed::{Context, ParallelMode};
use log::info;
use machine_learning::{
    MlErr,
    arch::{Model, loss::LossFn},
    data::{DataLoader, ShardSpec},
    optimization::Optimizer,
};

use crate::{Engine, Result, amp::Precision};

/// Builds the training engine of this rank.
///
/// Validates the config against the world, makes every data parallel replica start from
/// the parameters of the first rank of its group, shards the loaders between the replicas
/// and picks the precision policy the config asks for.
///
/// # Arguments
/// * `ctx` - This rank's distributed context.
/// * `model` - The model to train.
/// * `params` - The model's initial parameters, `model.size()` long.
/// * `optimizer` - The update rule for the parameters.
/// * `criterion` - The loss function.
/// * `train_loader` - The training data, sharded on return.
/// * `test_loader` - The evaluation data, sharded on return.
///
/// # Returns
/// The engine and the sharded loaders.
pub async fn initialize<M, O, L>(
    ctx: Arc<Context>,
    model: M,
    mut params: Vec<f32>,
    optimizer: O,
    criterion: L,
    train_loader: DataLoader,
    test_loader: Option<DataLoader>,
) -> Result<(Engine<M, O, L>, DataLoader, Option<DataLoader>)>
where
    M: Model,
    O: Optimizer,
    L: LossFn,
{
    let layout = ctx.layout()?;

    if params.len() != model.size() {
        return Err(MlErr::SizeMismatch {
            what: "initial parameters",
            got: params.len(),
            expected: model.size(),
        }
        .into());
    }

    let rank = ctx.rank();
    let data_group = layout.group(ParallelMode::Data, rank);
    let model_group = layout.group(ParallelMode::Model, rank);

    if data_group.size() > 1 {
        let root = data_group.ranks()[0];
        ctx.broadcast(&data_group, &mut params, root).await?;
    }

    let num_shards = NonZeroUsize::new(data_group.size()).unwrap_or(NonZeroUsize::MIN);
    let shard = ShardSpec::new(data_group.local_rank(rank).unwrap_or_default(), num_shards)?;
    let train_loader = train_loader.with_shard(shard);
    let test_loader = test_loader.map(|loader| loader.with_shard(shard));

    let precision = Precision::from_config(ctx.config());

    info!(
        rank = rank,
        data_parallel = data_group.size(),
        pipeline_parallel = layout.pipeline_size(),
        tensor_parallel = layout.tensor_size();
        "engine initialized with {} precision",
        precision.name()
    );

    let engine = Engine::new(
        ctx,
        model,
        params,
        optimizer,
        criterion,
        precision,
        data_group,
        model_group,
    );

    Ok((engine, train_loader, test_loader))
}
