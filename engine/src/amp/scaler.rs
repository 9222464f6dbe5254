use distributed::Fp16Config;

/// Dynamic loss scaler.
///
/// The loss is multiplied by the scale before back-propagation so that small gradients
/// survive half precision storage. Overflowing steps shrink the scale, long runs of clean
/// steps grow it back.
#[derive(Debug, Clone, PartialEq)]
pub struct GradScaler {
    scale: f32,
    min_scale: f32,
    max_scale: f32,
    growth_factor: f32,
    backoff_factor: f32,
    growth_interval: u32,
    hysteresis: u32,
    /// Clean steps since the last change of scale.
    growth_tracker: u32,
    /// Overflows since the last back off.
    hysteresis_tracker: u32,
    consecutive_overflows: u32,
}

impl Default for GradScaler {
    fn default() -> Self {
        Self::new(&Fp16Config::default())
    }
}

impl GradScaler {
    /// Creates a new `GradScaler` from the fp16 section of the config.
    pub fn new(config: &Fp16Config) -> Self {
        Self {
            scale: config.initial_scale.clamp(config.min_scale, config.max_scale),
            min_scale: config.min_scale,
            max_scale: config.max_scale,
            growth_factor: config.growth_factor,
            backoff_factor: config.backoff_factor,
            growth_interval: config.growth_interval.max(1),
            hysteresis: config.hysteresis.max(1),
            growth_tracker: 0,
            hysteresis_tracker: 0,
            consecutive_overflows: 0,
        }
    }

    pub fn scale(&self) -> f32 {
        self.scale
    }

    pub fn consecutive_overflows(&self) -> u32 {
        self.consecutive_overflows
    }

    pub fn scale_loss(&self, loss: f32) -> f32 {
        loss * self.scale
    }

    /// Divides the gradients by the scale in place.
    ///
    /// # Returns
    /// Whether any gradient is infinite or nan.
    pub fn unscale_and_check(&self, grads: &mut [f32]) -> bool {
        let inv_scale = 1. / self.scale;
        let mut overflow = false;

        for g in grads.iter_mut() {
            overflow |= !g.is_finite();
            *g *= inv_scale;
        }

        overflow
    }

    /// Adjusts the scale after a step.
    ///
    /// # Arguments
    /// * `overflow` - Whether the step's gradients overflowed.
    pub fn update(&mut self, overflow: bool) {
        if overflow {
            self.consecutive_overflows += 1;
            self.growth_tracker = 0;
            self.hysteresis_tracker += 1;

            if self.hysteresis_tracker >= self.hysteresis {
                self.scale = (self.scale * self.backoff_factor).max(self.min_scale);
                self.hysteresis_tracker = 0;
            }

            return;
        }

        self.consecutive_overflows = 0;
        self.growth_tracker += 1;

        if self.growth_tracker >= self.growth_interval {
            self.scale = (self.scale * self.growth_factor).min(self.max_scale);
            self.growth_tracker = 0;
            self.hysteresis_tracker = 0;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn scaler(f: impl FnOnce(&mut Fp16Config)) -> GradScaler {
        let mut config = Fp16Config::default();
        f(&mut config);
        GradScaler::new(&config)
    }

    #[test]
    fn defaults() {
        let scaler = GradScaler::default();

        assert_eq!(scaler.scale(), 65536.);
        assert_eq!(scaler.scale_loss(0.5), 32768.);
    }

    #[test]
    fn unscales_and_detects_non_finite_values() {
        let scaler = scaler(|c| c.initial_scale = 4.);

        let mut grads = [4.0, -8.0];
        assert!(!scaler.unscale_and_check(&mut grads));
        assert_eq!(grads, [1.0, -2.0]);

        assert!(scaler.unscale_and_check(&mut [1.0, f32::INFINITY]));
        assert!(scaler.unscale_and_check(&mut [f32::NAN]));
    }

    #[test]
    fn overflow_halves_the_scale_once() {
        let mut scaler = GradScaler::default();
        scaler.update(true);

        assert_eq!(scaler.scale(), 32768.);
        assert_eq!(scaler.consecutive_overflows(), 1);
    }

    #[test]
    fn grows_exactly_at_the_interval() {
        let mut scaler = scaler(|c| c.growth_interval = 5);

        for _ in 0..4 {
            scaler.update(false);
            assert_eq!(scaler.scale(), 65536.);
        }

        scaler.update(false);
        assert_eq!(scaler.scale(), 131072.);
    }

    #[test]
    fn default_interval_doubles_at_step_2000() {
        let mut scaler = GradScaler::default();

        for step in 1..2000 {
            scaler.update(false);
            assert_eq!(scaler.scale(), 65536., "grew early at step {step}");
        }

        scaler.update(false);
        assert_eq!(scaler.scale(), 131072.);
    }

    #[test]
    fn overflow_resets_growth() {
        let mut scaler = scaler(|c| c.growth_interval = 3);

        scaler.update(false);
        scaler.update(false);
        scaler.update(true);
        scaler.update(false);
        scaler.update(false);
        assert_eq!(scaler.scale(), 32768.);
        assert_eq!(scaler.consecutive_overflows(), 0);

        scaler.update(false);
        assert_eq!(scaler.scale(), 65536.);
    }

    #[test]
    fn hysteresis_tolerates_overflows() {
        let mut scaler = scaler(|c| c.hysteresis = 2);

        scaler.update(true);
        assert_eq!(scaler.scale(), 65536.);
        scaler.update(true);
        assert_eq!(scaler.scale(), 32768.);
    }

    #[test]
    fn stays_within_bounds() {
        let mut scaler = scaler(|c| {
            c.initial_scale = 4.;
            c.min_scale = 1.;
            c.max_scale = 8.;
            c.growth_interval = 1;
        });

        for _ in 0..10 {
            scaler.update(true);
            assert!(scaler.scale() >= 1.);
        }
        assert_eq!(scaler.scale(), 1.);

        for _ in 0..10 {
            scaler.update(false);
            assert!(scaler.scale() <= 8.);
        }
        assert_eq!(scaler.scale(), 8.);
    }
}
