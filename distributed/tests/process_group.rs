use std::{sync::Arc, time::Duration};

use distributed::{
    Config, Context, DistErr, InitErr, LaunchOptions, ParallelMode, ReduceOp, free_port, launch,
    launch_with,
};
use tokio::task::JoinSet;

async fn world<F, Fut, T>(world_size: usize, config: Config, body: F) -> Vec<T>
where
    F: Fn(Arc<Context>) -> Fut + Clone + Send + 'static,
    Fut: Future<Output = T> + Send,
    T: Send + 'static,
{
    let port = free_port().unwrap();
    let mut ranks = JoinSet::new();

    for rank in 0..world_size {
        let (config, body) = (config.clone(), body.clone());

        ranks.spawn(async move {
            let ctx = launch(config, rank, world_size, "127.0.0.1", port, "tcp")
                .await
                .unwrap();

            let out = body(Arc::clone(&ctx)).await;
            ctx.destroy().await.unwrap();
            (rank, out)
        });
    }

    let mut outs: Vec<(usize, T)> = ranks.join_all().await;
    outs.sort_by_key(|(rank, _)| *rank);
    outs.into_iter().map(|(_, out)| out).collect()
}

#[tokio::test(flavor = "multi_thread")]
async fn all_reduce_over_four_ranks() {
    let outs = world(4, Config::default(), |ctx| async move {
        let group = ctx.group(ParallelMode::Global).unwrap();
        let rank = ctx.rank() as f32;

        let mut sum = vec![rank, 1.0];
        ctx.all_reduce(&group, &mut sum, ReduceOp::Sum).await.unwrap();

        let mut avg = vec![rank];
        ctx.all_reduce(&group, &mut avg, ReduceOp::Avg).await.unwrap();

        let mut max = vec![rank, -rank];
        ctx.all_reduce(&group, &mut max, ReduceOp::Max).await.unwrap();

        (sum, avg, max)
    })
    .await;

    for (sum, avg, max) in outs {
        assert_eq!(sum, vec![6.0, 4.0]);
        assert_eq!(avg, vec![1.5]);
        assert_eq!(max, vec![3.0, 0.0]);
    }
}

#[tokio::test(flavor = "multi_thread")]
async fn broadcast_and_barrier() {
    let outs = world(3, Config::default(), |ctx| async move {
        let group = ctx.group(ParallelMode::Global).unwrap();
        let mut data = vec![ctx.rank() as f32; 3];

        ctx.broadcast(&group, &mut data, 2).await.unwrap();
        ctx.barrier(&group).await.unwrap();
        data
    })
    .await;

    assert!(outs.iter().all(|data| data == &[2.0; 3]));
}

#[tokio::test(flavor = "multi_thread")]
async fn subgroups_reduce_independently() {
    let config = Config::from_json(r#"{"parallel": {"pipeline": {"size": 2}}}"#).unwrap();

    let outs = world(4, config, |ctx| async move {
        // Two stages of two ranks: data groups are {0, 1} and {2, 3}.
        let group = ctx.group(ParallelMode::Data).unwrap();
        let mut data = vec![ctx.rank() as f32];

        ctx.all_reduce(&group, &mut data, ReduceOp::Sum).await.unwrap();
        data[0]
    })
    .await;

    assert_eq!(outs, vec![1.0, 1.0, 5.0, 5.0]);
}

#[tokio::test(flavor = "multi_thread")]
async fn mismatched_lengths_fail_on_every_member() {
    let outs = world(2, Config::default(), |ctx| async move {
        let group = ctx.group(ParallelMode::Global).unwrap();
        let mut data = vec![0.0; ctx.rank() + 1];

        ctx.all_reduce(&group, &mut data, ReduceOp::Sum).await
    })
    .await;

    assert!(
        outs.iter()
            .all(|res| matches!(res, Err(DistErr::Collective(_))))
    );
}

#[tokio::test(flavor = "multi_thread")]
async fn destroyed_context_refuses_collectives() {
    let port = free_port().unwrap();
    let ctx = launch(Config::default(), 0, 1, "127.0.0.1", port, "tcp")
        .await
        .unwrap();

    let group = ctx.group(ParallelMode::Global).unwrap();
    ctx.destroy().await.unwrap();
    ctx.destroy().await.unwrap();

    assert!(ctx.is_destroyed().await);
    assert!(matches!(
        ctx.all_reduce(&group, &mut [1.0], ReduceOp::Sum).await,
        Err(DistErr::Destroyed)
    ));
}

#[tokio::test(flavor = "multi_thread")]
async fn unsupported_backend() {
    let res = launch(Config::default(), 0, 1, "127.0.0.1", 1, "nccl").await;
    assert!(matches!(res, Err(InitErr::UnsupportedBackend(_))));
}

#[tokio::test(flavor = "multi_thread")]
async fn rank_out_of_range() {
    let res = launch(Config::default(), 2, 2, "127.0.0.1", 1, "tcp").await;
    assert!(matches!(
        res,
        Err(InitErr::InvalidRank {
            rank: 2,
            world_size: 2
        })
    ));
}

#[tokio::test(flavor = "multi_thread")]
async fn port_already_in_use() {
    let taken = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    let port = taken.local_addr().unwrap().port();

    let res = launch(Config::default(), 0, 2, "127.0.0.1", port, "tcp").await;
    assert!(matches!(res, Err(InitErr::PortInUse(_))));
}

#[tokio::test(flavor = "multi_thread")]
async fn missing_ranks_time_out() {
    let port = free_port().unwrap();
    let options = LaunchOptions {
        timeout: Duration::from_millis(300),
    };

    let lonely_root =
        launch_with(Config::default(), 0, 2, "127.0.0.1", port, "tcp", options).await;
    assert!(matches!(lonely_root, Err(InitErr::Timeout(_))));

    let port = free_port().unwrap();
    let no_hub = launch_with(Config::default(), 1, 2, "127.0.0.1", port, "tcp", options).await;
    assert!(matches!(no_hub, Err(InitErr::Timeout(_))));
}

#[tokio::test(flavor = "multi_thread")]
async fn lonely_root_always_times_out() {
    let options = LaunchOptions {
        timeout: Duration::from_millis(100),
    };

    for _ in 0..20 {
        let port = free_port().unwrap();
        let res = launch_with(Config::default(), 0, 2, "127.0.0.1", port, "tcp", options).await;
        assert!(matches!(res, Err(InitErr::Timeout(_))), "{:?}", res.err());
    }
}

#[tokio::test(flavor = "multi_thread")]
async fn joined_ranks_learn_of_the_timeout() {
    let port = free_port().unwrap();
    let options = LaunchOptions {
        timeout: Duration::from_millis(400),
    };

    let root = tokio::spawn(async move {
        launch_with(Config::default(), 0, 3, "127.0.0.1", port, "tcp", options).await
    });
    let first = launch_with(Config::default(), 1, 3, "127.0.0.1", port, "tcp", options).await;

    assert!(matches!(first, Err(InitErr::Timeout(_))));
    assert!(matches!(root.await.unwrap(), Err(InitErr::Timeout(_))));
}

#[tokio::test(flavor = "multi_thread")]
async fn conflicting_joins_are_rejected() {
    let port = free_port().unwrap();
    let options = LaunchOptions {
        timeout: Duration::from_secs(5),
    };
    let join = move |rank, world_size| {
        launch_with(
            Config::default(),
            rank,
            world_size,
            "127.0.0.1",
            port,
            "tcp",
            options,
        )
    };

    let root = tokio::spawn(join(0, 3));
    let first = tokio::spawn(join(1, 3));

    // Let both join before the conflicting ones show up.
    tokio::time::sleep(Duration::from_millis(300)).await;

    assert!(matches!(join(1, 3).await, Err(InitErr::Rejected(_))));
    assert!(matches!(join(2, 4).await, Err(InitErr::Rejected(_))));

    root.abort();
    first.abort();
}
