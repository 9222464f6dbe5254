#![allow(dead_code)]

use std::sync::Arc;

use distributed::{Config, Context, free_port, launch};
use machine_learning::{
    arch::{
        Model, Sequential,
        activations::ActFn,
        layers::Layer,
        loss::CrossEntropy,
    },
    data::{DataLoader, Dataset},
    optimization::GradientDescent,
};
use rand::{SeedableRng, rngs::StdRng};

pub const FEATURES: usize = 8;
pub const CLASSES: usize = 10;

pub async fn single(config: Config) -> Arc<Context> {
    let port = free_port().unwrap();
    launch(config, 0, 1, "127.0.0.1", port, "tcp").await.unwrap()
}

pub fn model(seed: u64) -> (Sequential, Vec<f32>) {
    let model = Sequential::new([
        Layer::dense((FEATURES, 16), Some(ActFn::relu())),
        Layer::dropout(0.1, seed).unwrap(),
        Layer::dense((16, CLASSES), None),
    ]);

    let params = model.init_params(&mut StdRng::seed_from_u64(seed));
    (model, params)
}

pub fn loader(samples: usize, batch_size: usize) -> DataLoader {
    let mut rng = StdRng::seed_from_u64(42);
    let dataset = Dataset::synthetic_classification(samples, FEATURES, CLASSES, &mut rng).unwrap();

    DataLoader::new(Arc::new(dataset), batch_size)
        .unwrap()
        .shuffle(true)
        .seed(42)
}

pub fn optimizer() -> GradientDescent {
    GradientDescent::new(0.1)
}

pub fn criterion() -> CrossEntropy {
    CrossEntropy::new()
}
