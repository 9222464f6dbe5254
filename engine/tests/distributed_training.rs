mod common;

use distributed::{Config, free_port, launch};
use engine::initialize;
use machine_learning::{data::Batch, optimization::Adam};
use tokio::task::JoinSet;

use common::{criterion, loader, model};

const WORLD_SIZE: usize = 4;
const BATCH_SIZE: usize = 128;
const LEARNING_RATE: f32 = 1e-3;

/// What a rank saw during its single training step.
struct RankStep {
    loss: f32,
    skipped: bool,
    loss_scale: f32,
    initial: Vec<f32>,
    trained: Vec<f32>,
}

/// Runs one training step on every rank of a local world and returns each rank's view of it.
///
/// # Arguments
/// * `config` - The job's configuration.
/// * `corrupt` - A rank whose first label is replaced by NaN, if any.
async fn train_one_step(config: Config, corrupt: Option<usize>) -> Vec<RankStep> {
    let port = free_port().unwrap();
    let mut ranks = JoinSet::new();

    for rank in 0..WORLD_SIZE {
        let config = config.clone();

        ranks.spawn(async move {
            let ctx = launch(config, rank, WORLD_SIZE, "127.0.0.1", port, "tcp")
                .await
                .unwrap();

            // Every rank samples its own parameters, initialize must align them.
            let (m, params) = model(rank as u64);
            let optimizer = Adam::with_learning_rate(params.len(), LEARNING_RATE);
            let train = loader(WORLD_SIZE * BATCH_SIZE, BATCH_SIZE).drop_last(true);

            let (mut engine, mut train, _) =
                initialize(ctx.clone(), m, params, optimizer, criterion(), train, None)
                    .await
                    .unwrap();
            let initial = engine.params().to_vec();

            let Batch { x, mut y } = train.iter().next().unwrap();
            assert_eq!(x.nrows(), BATCH_SIZE);

            if corrupt == Some(rank) {
                y[[0, 0]] = f32::NAN;
            }

            engine.train();
            engine.zero_grad();
            let out = engine.forward(x.view()).unwrap();
            let loss = engine.criterion(&out, y.view()).unwrap();
            engine.backward(&loss).await.unwrap();
            let report = engine.step().await.unwrap();

            let step = RankStep {
                loss: loss.item(),
                skipped: report.skipped,
                loss_scale: report.loss_scale,
                initial,
                trained: engine.params().to_vec(),
            };

            ctx.destroy().await.unwrap();
            (rank, step)
        });
    }

    let mut outs = ranks.join_all().await;
    outs.sort_by_key(|(rank, _)| *rank);
    outs.into_iter().map(|(_, out)| out).collect()
}

fn assert_replicas_agree(outs: &[RankStep]) {
    assert_eq!(outs.len(), WORLD_SIZE);

    for step in outs {
        assert!(step.loss.is_finite());
        assert!(!step.skipped);
        assert_eq!(step.initial, outs[0].initial);
        assert_eq!(step.trained, outs[0].trained);
    }
}

#[tokio::test(flavor = "multi_thread")]
async fn naive_amp_over_four_ranks() {
    let config = Config::from_json(
        r#"{
            "parallel": {"pipeline": {"size": 1}, "tensor": {"size": 1, "mode": null}},
            "fp16": {"mode": "naive", "clip_grad": 1.0}
        }"#,
    )
    .unwrap();

    assert_replicas_agree(&train_one_step(config, None).await);
}

#[tokio::test(flavor = "multi_thread")]
async fn full_precision_over_four_ranks_updates_every_replica() {
    let outs = train_one_step(Config::default(), None).await;

    assert_replicas_agree(&outs);
    assert_ne!(outs[0].initial, outs[0].trained);
}

#[tokio::test(flavor = "multi_thread")]
async fn pipeline_layout_shares_overflow_decisions() {
    // Stages {0, 1} and {2, 3}, model groups {0, 2} and {1, 3}. The NaN reaches rank 1
    // through the data group and ranks 2 and 3 only through their model groups.
    let config = Config::from_json(
        r#"{"parallel": {"pipeline": {"size": 2}}, "fp16": {"mode": "torch"}}"#,
    )
    .unwrap();

    let outs = train_one_step(config, Some(0)).await;
    assert_eq!(outs.len(), WORLD_SIZE);

    for step in &outs {
        assert!(step.skipped);
        assert_eq!(step.loss_scale, 32768.);

        let before: Vec<u32> = step.initial.iter().map(|p| p.to_bits()).collect();
        let after: Vec<u32> = step.trained.iter().map(|p| p.to_bits()).collect();
        assert_eq!(before, after);
    }

    assert!(outs[2].loss.is_finite());
    assert!(outs[3].loss.is_finite());
}
