use std::{env, io, str::FromStr, sync::Arc};

use distributed::{Config, Context, free_port, launch};
use engine::initialize;
use log::{error, info, warn};
use machine_learning::{
    arch::{Model, Sequential, activations::ActFn, layers::Layer, loss::CrossEntropy},
    data::{Batch, DataLoader, Dataset},
    optimization::Adam,
};
use rand::{SeedableRng, rngs::StdRng};
use tokio::{process::Command, signal, task::JoinSet};

const DEFAULT_HOST: &str = "127.0.0.1";
const DEFAULT_BACKEND: &str = "tcp";
const FEATURES: usize = 32;
const HIDDEN: usize = 64;
const CLASSES: usize = 10;
const LEARNING_RATE: f32 = 0.001;
const SEED: u64 = 42;

#[tokio::main]
async fn main() -> io::Result<()> {
    env_logger::init();

    match (env::var("NPROCS"), env::var("RANK")) {
        (Ok(nprocs), Err(_)) => {
            let nprocs = nprocs.parse().map_err(io::Error::other)?;
            spawn_ranks(nprocs).await
        }
        _ => run_rank().await,
    }
}

/// Reads and parses an environment variable, falling back to `default` when it's unset.
fn var<T>(name: &str, default: Option<T>) -> io::Result<T>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match (env::var(name), default) {
        (Ok(value), _) => value
            .parse()
            .map_err(|e| io::Error::other(format!("invalid {name} {value:?}: {e}"))),
        (Err(_), Some(default)) => Ok(default),
        (Err(e), None) => Err(io::Error::other(format!("{name}: {e}"))),
    }
}

/// Runs `nprocs` copies of this binary as the ranks of one local job.
async fn spawn_ranks(nprocs: usize) -> io::Result<()> {
    let exe = env::current_exe()?;
    let port = free_port()?;
    let mut children = JoinSet::new();

    info!(nprocs = nprocs, port = port; "spawning ranks");

    for rank in 0..nprocs {
        let mut child = Command::new(&exe)
            .env_remove("NPROCS")
            .env("RANK", rank.to_string())
            .env("WORLD_SIZE", nprocs.to_string())
            .env("PORT", port.to_string())
            .spawn()?;

        children.spawn(async move { (rank, child.wait().await) });
    }

    let mut failed = Vec::new();
    while let Some(res) = children.join_next().await {
        let (rank, status) = res.map_err(io::Error::other)?;

        match status {
            Ok(status) if status.success() => {}
            Ok(status) => {
                error!(rank = rank; "rank exited with {status}");
                failed.push(rank);
            }
            Err(e) => {
                error!(rank = rank; "failed to wait for rank: {e}");
                failed.push(rank);
            }
        }
    }

    if !failed.is_empty() {
        failed.sort_unstable();
        return Err(io::Error::other(format!("ranks {failed:?} failed")));
    }

    Ok(())
}

async fn run_rank() -> io::Result<()> {
    let rank: usize = var("RANK", None)?;
    let world_size: usize = var("WORLD_SIZE", None)?;
    let host: String = var("HOST", Some(DEFAULT_HOST.to_string()))?;
    let port: u16 = var("PORT", None)?;
    let backend: String = var("BACKEND", Some(DEFAULT_BACKEND.to_string()))?;
    let steps: usize = var("STEPS", Some(1))?;
    let batch_size: usize = var("BATCH_SIZE", Some(128))?;

    let config = match env::var("CONFIG") {
        Ok(path) => Config::from_path(path).map_err(io::Error::other)?,
        Err(_) => Config::default(),
    };

    let ctx = launch(config, rank, world_size, &host, port, &backend)
        .await
        .map_err(io::Error::other)?;

    tokio::select! {
        ret = train(Arc::clone(&ctx), steps, batch_size) => {
            let loss = ret?;
            info!("rank {rank} returns: {loss}");
        }
        _ = signal::ctrl_c() => {
            warn!("received SIGINT, leaving without finishing");
            return Ok(());
        }
    }

    ctx.destroy().await.map_err(io::Error::other)
}

/// Trains the demo classifier for `steps` steps.
///
/// # Returns
/// The loss of the last step.
async fn train(ctx: Arc<Context>, steps: usize, batch_size: usize) -> io::Result<f32> {
    let world_size = ctx.world_size();
    let mut rng = StdRng::seed_from_u64(SEED);

    let samples = world_size * batch_size * steps.max(1);
    let dataset = Dataset::synthetic_classification(samples, FEATURES, CLASSES, &mut rng)
        .map_err(io::Error::other)?;

    let loader = DataLoader::new(Arc::new(dataset), batch_size)
        .map_err(io::Error::other)?
        .shuffle(true)
        .seed(SEED);

    let model = Sequential::new([
        Layer::dense((FEATURES, HIDDEN), Some(ActFn::relu())),
        Layer::dropout(0.1, SEED + ctx.rank() as u64).map_err(io::Error::other)?,
        Layer::dense((HIDDEN, CLASSES), None),
    ]);
    let params = model.init_params(&mut rng);
    let optimizer = Adam::with_learning_rate(params.len(), LEARNING_RATE);

    let (mut engine, mut train_loader, _) = initialize(
        ctx,
        model,
        params,
        optimizer,
        CrossEntropy::new(),
        loader,
        None,
    )
    .await
    .map_err(io::Error::other)?;

    engine.train();

    let mut loss = f32::NAN;
    let mut batches = train_loader.iter();

    for _ in 0..steps {
        let Batch { x, y } = match batches.next() {
            Some(batch) => batch,
            None => {
                batches = train_loader.iter();
                batches
                    .next()
                    .ok_or_else(|| io::Error::other("the training loader is empty"))?
            }
        };

        engine.zero_grad();
        let out = engine.forward(x.view()).map_err(io::Error::other)?;
        let step_loss = engine.criterion(&out, y.view()).map_err(io::Error::other)?;
        engine.backward(&step_loss).await.map_err(io::Error::other)?;
        let report = engine.step().await.map_err(io::Error::other)?;

        loss = step_loss.item();
        info!(
            step = engine.steps(),
            skipped = report.skipped,
            loss_scale = report.loss_scale;
            "loss {loss}"
        );
    }

    Ok(loss)
}
