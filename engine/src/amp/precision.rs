use distributed::{Config, Fp16Mode};
use half::f16;
use ndarray::{Array2, ArrayView2};

use super::GradScaler;

/// How the engine stores and scales values, chosen once from the config.
#[derive(Debug, Clone, PartialEq)]
pub enum Precision {
    /// Full precision everywhere, no loss scaling.
    Fp32 { clip: f32 },
    /// The model runs on a half precision copy of the f32 master weights and gradients are
    /// stored in half precision, so overflowing gradients become infinities.
    Naive { scaler: GradScaler, clip: f32 },
    /// Full precision model and gradients with dynamic loss scaling.
    Torch { scaler: GradScaler, clip: f32 },
}

impl Precision {
    pub fn from_config(config: &Config) -> Self {
        match &config.fp16 {
            None => Self::Fp32 {
                clip: config.clip_grad_norm,
            },
            Some(fp16) => {
                let scaler = GradScaler::new(fp16);
                let clip = fp16.clip_grad;

                match fp16.mode {
                    Fp16Mode::Naive => Self::Naive { scaler, clip },
                    Fp16Mode::Torch => Self::Torch { scaler, clip },
                }
            }
        }
    }

    /// A short name of the mode, for logs.
    pub fn name(&self) -> &'static str {
        match self {
            Self::Fp32 { .. } => "fp32",
            Self::Naive { .. } => "naive fp16",
            Self::Torch { .. } => "torch fp16",
        }
    }

    pub fn scaler(&self) -> Option<&GradScaler> {
        match self {
            Self::Fp32 { .. } => None,
            Self::Naive { scaler, .. } | Self::Torch { scaler, .. } => Some(scaler),
        }
    }

    /// The current loss scale, `1` without scaling.
    pub fn loss_scale(&self) -> f32 {
        self.scaler().map(GradScaler::scale).unwrap_or(1.)
    }

    /// The gradient clipping threshold, `0` when disabled.
    pub fn clip(&self) -> f32 {
        match *self {
            Self::Fp32 { clip } | Self::Naive { clip, .. } | Self::Torch { clip, .. } => clip,
        }
    }

    fn is_half(&self) -> bool {
        matches!(self, Self::Naive { .. })
    }

    /// Copies the master weights into the weights the model runs on.
    pub fn cast_params(&self, master: &[f32], working: &mut [f32]) {
        if self.is_half() {
            working
                .iter_mut()
                .zip(master)
                .for_each(|(w, &m)| *w = round_half(m));
        } else {
            working.copy_from_slice(master);
        }
    }

    /// Converts a batch of inputs to the precision the model runs in.
    pub fn cast_input(&self, x: ArrayView2<f32>) -> Array2<f32> {
        if self.is_half() {
            x.mapv(round_half)
        } else {
            x.to_owned()
        }
    }

    /// Rounds freshly computed gradients to their storage precision.
    pub fn store_grads(&self, grads: &mut [f32]) {
        if self.is_half() {
            grads.iter_mut().for_each(|g| *g = round_half(*g));
        }
    }

    /// Removes the loss scale from the gradients.
    ///
    /// # Returns
    /// Whether any gradient is infinite or nan, in which case the step must be skipped.
    pub fn unscale_and_check(&self, grads: &mut [f32]) -> bool {
        match self.scaler() {
            Some(scaler) => scaler.unscale_and_check(grads),
            None => grads.iter().any(|g| !g.is_finite()),
        }
    }

    /// Feeds the outcome of a step to the loss scaler.
    pub fn update(&mut self, overflow: bool) {
        match self {
            Self::Fp32 { .. } => {}
            Self::Naive { scaler, .. } | Self::Torch { scaler, .. } => scaler.update(overflow),
        }
    }
}

/// Rounds to the nearest half precision value, out of range values become infinite.
fn round_half(v: f32) -> f32 {
    f16::from_f32(v).to_f32()
}

#[cfg(test)]
mod tests {
    use distributed::Fp16Config;

    use super::*;

    fn with_fp16(mode: Fp16Mode) -> Config {
        Config {
            fp16: Some(Fp16Config {
                mode,
                clip_grad: 1.0,
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    #[test]
    fn mode_follows_the_config() {
        let fp32 = Config {
            clip_grad_norm: 2.0,
            ..Default::default()
        };

        assert_eq!(Precision::from_config(&fp32), Precision::Fp32 { clip: 2.0 });
        assert!(matches!(
            Precision::from_config(&with_fp16(Fp16Mode::Naive)),
            Precision::Naive { clip, .. } if clip == 1.0
        ));
        assert!(matches!(
            Precision::from_config(&with_fp16(Fp16Mode::Torch)),
            Precision::Torch { .. }
        ));
    }

    #[test]
    fn naive_storage_overflows_to_infinity() {
        let naive = Precision::from_config(&with_fp16(Fp16Mode::Naive));
        let mut grads = [1e6, 0.1];
        naive.store_grads(&mut grads);

        assert!(grads[0].is_infinite());
        assert!((grads[1] - 0.1).abs() < 1e-4);
        assert!(naive.unscale_and_check(&mut grads));
    }

    #[test]
    fn torch_storage_keeps_full_precision() {
        let torch = Precision::from_config(&with_fp16(Fp16Mode::Torch));
        let mut grads = [1e6, 0.1];
        torch.store_grads(&mut grads);

        assert_eq!(grads, [1e6, 0.1]);
        assert_eq!(torch.loss_scale(), 65536.);
    }

    #[test]
    fn naive_working_weights_are_rounded() {
        let naive = Precision::from_config(&with_fp16(Fp16Mode::Naive));
        let master = [0.1f32, 1.0];
        let mut working = [0.0; 2];
        naive.cast_params(&master, &mut working);

        assert_ne!(working[0], master[0]);
        assert_eq!(working[1], 1.0);
    }

    #[test]
    fn fp32_checks_without_scaling() {
        let fp32 = Precision::from_config(&Config::default());
        let mut grads = [2.0, 3.0];

        assert!(!fp32.unscale_and_check(&mut grads));
        assert_eq!(grads, [2.0, 3.0]);
        assert!(fp32.unscale_and_check(&mut [f32::NAN]));
        assert_eq!(fp32.loss_scale(), 1.);
    }
}
