use std::{fs, path::Path};

use serde::{Deserialize, Serialize};

use crate::{ConfigErr, ParallelLayout};

/// The training job configuration shared by every rank.
///
/// ```json
/// {
///     "parallel": { "pipeline": { "size": 1 }, "tensor": { "size": 1, "mode": null } },
///     "fp16": { "mode": "naive", "clip_grad": 1.0 }
/// }
/// ```
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub parallel: ParallelConfig,
    /// Mixed precision settings, `None` trains in full precision.
    pub fp16: Option<Fp16Config>,
    /// Gradient clipping threshold for full precision training, `0` disables it.
    pub clip_grad_norm: f32,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ParallelConfig {
    pub pipeline: PipelineConfig,
    pub tensor: TensorConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    pub size: usize,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self { size: 1 }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TensorConfig {
    pub size: usize,
    pub mode: Option<TensorMode>,
    /// Only meaningful for the `2.5d` mode.
    pub depth: usize,
}

impl Default for TensorConfig {
    fn default() -> Self {
        Self {
            size: 1,
            mode: None,
            depth: 1,
        }
    }
}

/// The ways a layer can be split between the ranks of a tensor group.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TensorMode {
    #[serde(rename = "1d")]
    OneD,
    #[serde(rename = "2d")]
    TwoD,
    #[serde(rename = "2.5d")]
    TwoPointFiveD,
    #[serde(rename = "3d")]
    ThreeD,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Fp16Mode {
    /// Half precision working copy of the model with full precision master weights.
    #[default]
    Naive,
    /// Full precision model, only the loss is dynamically scaled.
    Torch,
}

/// Mixed precision and dynamic loss scaling settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Fp16Config {
    pub mode: Fp16Mode,
    /// Gradient clipping threshold, `0` disables it.
    pub clip_grad: f32,
    pub initial_scale: f32,
    pub min_scale: f32,
    pub max_scale: f32,
    pub growth_factor: f32,
    pub backoff_factor: f32,
    /// Clean steps needed before the scale grows.
    pub growth_interval: u32,
    /// Overflows tolerated before the scale backs off.
    pub hysteresis: u32,
}

impl Default for Fp16Config {
    fn default() -> Self {
        Self {
            mode: Fp16Mode::Naive,
            clip_grad: 0.,
            initial_scale: 65536.,
            min_scale: 1.,
            max_scale: 16_777_216.,
            growth_factor: 2.,
            backoff_factor: 0.5,
            growth_interval: 2000,
            hysteresis: 1,
        }
    }
}

impl Config {
    /// Parses a config from its json representation, missing fields take their defaults.
    pub fn from_json(json: &str) -> Result<Self, ConfigErr> {
        serde_json::from_str(json).map_err(|e| ConfigErr::Parse(e.to_string()))
    }

    /// Reads and parses a json config file.
    pub fn from_path<P: AsRef<Path>>(path: P) -> Result<Self, ConfigErr> {
        let path = path.as_ref();
        let json = fs::read_to_string(path)
            .map_err(|e| ConfigErr::Parse(format!("reading {}: {e}", path.display())))?;

        Self::from_json(&json)
    }

    /// Checks the config against the size of the world.
    ///
    /// # Arguments
    /// * `world_size` - The amount of ranks in the job.
    ///
    /// # Returns
    /// The parallel layout the config describes, or the reason it's invalid.
    pub fn validate(&self, world_size: usize) -> Result<ParallelLayout, ConfigErr> {
        self.parallel.tensor.validate()?;

        if !(self.clip_grad_norm.is_finite() && self.clip_grad_norm >= 0.) {
            return Err(ConfigErr::Invalid(format!(
                "clip_grad_norm must be a non negative number, got {}",
                self.clip_grad_norm
            )));
        }

        if let Some(fp16) = &self.fp16 {
            fp16.validate()?;
        }

        ParallelLayout::new(
            world_size,
            self.parallel.pipeline.size,
            self.parallel.tensor.size,
        )
    }
}

impl TensorConfig {
    fn validate(&self) -> Result<(), ConfigErr> {
        let size = self.size;

        let ok = match self.mode {
            None => size == 1,
            Some(TensorMode::OneD) => true,
            Some(TensorMode::TwoD) => exact_root(size, 2).is_some(),
            Some(TensorMode::TwoPointFiveD) => {
                self.depth > 0
                    && size % self.depth == 0
                    && exact_root(size / self.depth, 2).is_some()
            }
            Some(TensorMode::ThreeD) => exact_root(size, 3).is_some(),
        };

        if ok {
            return Ok(());
        }

        let reason = match self.mode {
            None => format!("tensor size {size} requires a tensor mode"),
            Some(TensorMode::TwoPointFiveD) => format!(
                "tensor size {size} must be depth {} times a perfect square",
                self.depth
            ),
            Some(mode) => format!("tensor size {size} doesn't fit the {mode:?} layout"),
        };

        Err(ConfigErr::TensorMode(reason))
    }
}

impl Fp16Config {
    fn validate(&self) -> Result<(), ConfigErr> {
        let invalid = |detail: String| Err(ConfigErr::Invalid(detail));

        if !(self.min_scale > 0. && self.min_scale <= self.max_scale && self.max_scale.is_finite()) {
            return invalid(format!(
                "loss scale bounds [{}, {}] are not valid",
                self.min_scale, self.max_scale
            ));
        }

        if !(self.min_scale..=self.max_scale).contains(&self.initial_scale) {
            return invalid(format!(
                "initial scale {} is out of [{}, {}]",
                self.initial_scale, self.min_scale, self.max_scale
            ));
        }

        if !(self.growth_factor > 1. && self.growth_factor.is_finite()) {
            return invalid(format!("growth factor {} must be above 1", self.growth_factor));
        }

        if !(self.backoff_factor > 0. && self.backoff_factor < 1.) {
            return invalid(format!(
                "backoff factor {} must be in (0, 1)",
                self.backoff_factor
            ));
        }

        if self.growth_interval == 0 || self.hysteresis == 0 {
            return invalid("growth interval and hysteresis must be positive".into());
        }

        if !(self.clip_grad.is_finite() && self.clip_grad >= 0.) {
            return invalid(format!("clip_grad must be non negative, got {}", self.clip_grad));
        }

        Ok(())
    }
}

/// Returns `r` such that `r^exp == n`, if there's one.
fn exact_root(n: usize, exp: u32) -> Option<usize> {
    if n == 0 {
        return None;
    }

    let (mut lo, mut hi) = (1, n);
    while lo <= hi {
        let mid = lo + (hi - lo) / 2;
        match mid.checked_pow(exp) {
            Some(p) if p == n => return Some(mid),
            Some(p) if p < n => lo = mid + 1,
            _ => hi = mid - 1,
        }
    }

    None
}
