use rayon::prelude::*;

/// The global L2 norm of the gradients.
///
/// Accumulated sequentially in f64 so every replica computes exactly the same norm.
pub fn grad_norm(grads: &[f32]) -> f32 {
    grads
        .iter()
        .map(|&g| f64::from(g) * f64::from(g))
        .sum::<f64>()
        .sqrt() as f32
}

/// Rescales the gradients so that their global L2 norm is at most `max_norm`.
///
/// # Arguments
/// * `grads` - The gradients, modified in place.
/// * `max_norm` - The threshold, clipping is disabled when it's not positive.
///
/// # Returns
/// The norm of the gradients before clipping.
pub fn clip_grad_norm(grads: &mut [f32], max_norm: f32) -> f32 {
    let norm = grad_norm(grads);

    if max_norm > 0. && norm > max_norm {
        let coef = max_norm / norm;
        grads.par_iter_mut().for_each(|g| *g *= coef);
    }

    norm
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn norm_of_a_pythagorean_triple() {
        assert_eq!(grad_norm(&[3.0, 4.0]), 5.0);
    }

    #[test]
    fn clips_above_the_threshold() {
        let mut grads = [3.0, 4.0];
        let norm = clip_grad_norm(&mut grads, 1.0);

        assert_eq!(norm, 5.0);
        assert!((grads[0] - 0.6).abs() < 1e-6);
        assert!((grads[1] - 0.8).abs() < 1e-6);
        assert!((grad_norm(&grads) - 1.0).abs() < 1e-6);
    }

    #[test]
    fn leaves_small_or_unclipped_gradients_alone() {
        let mut grads = [0.3, 0.4];
        clip_grad_norm(&mut grads, 1.0);
        assert_eq!(grads, [0.3, 0.4]);

        let mut grads = [30.0, 40.0];
        clip_grad_norm(&mut grads, 0.0);
        assert_eq!(grads, [30.0, 40.0]);
    }
}
