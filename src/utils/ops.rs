//! Small tensor utilities: initialization, dropout, timing signal,
//! categorical sampling.

use libm::{cosf, expf, sinf};
use ndarray::{s, Array1, Array2, Array3, Array4};
use ndarray_rand::rand_distr::Uniform;
use ndarray_rand::RandomExt;
use rand::rngs::StdRng;
use rand::Rng;

/// Glorot-uniform initialized `[fan_in, fan_out]` matrix.
pub fn glorot_uniform(fan_in: usize, fan_out: usize, rng: &mut StdRng) -> Array2<f32> {
    let limit = (6.0 / (fan_in + fan_out) as f32).sqrt();
    Array2::random_using((fan_in, fan_out), Uniform::new(-limit, limit), rng)
}

/// Uniform unit-scaling initializer for embedding-like tables.
pub fn uniform_unit_scaling(rows: usize, cols: usize, rng: &mut StdRng) -> Array2<f32> {
    let limit = (3.0_f32 / cols as f32).sqrt();
    Array2::random_using((rows, cols), Uniform::new(-limit, limit), rng)
}

/// Inverted dropout: zero each element with probability `rate` and scale
/// survivors by `1 / (1 - rate)`. Callers apply it in train mode only.
pub fn dropout_3d(x: &mut Array3<f32>, rate: f32, rng: &mut StdRng) {
    if rate <= 0.0 {
        return;
    }
    let keep = 1.0 - rate;
    for v in x.iter_mut() {
        if rng.gen::<f32>() < rate {
            *v = 0.0;
        } else {
            *v /= keep;
        }
    }
}

pub fn dropout_4d(x: &mut Array4<f32>, rate: f32, rng: &mut StdRng) {
    if rate <= 0.0 {
        return;
    }
    let keep = 1.0 - rate;
    for v in x.iter_mut() {
        if rng.gen::<f32>() < rate {
            *v = 0.0;
        } else {
            *v /= keep;
        }
    }
}

/// Add the sinusoidal position signal to `[batch, length, hidden]` states.
pub fn add_timing_signal(x: &mut Array3<f32>) {
    let (_batch, length, hidden) = x.dim();
    let num_timescales = (hidden / 2).max(1);
    let log_increment = (1.0e4_f32).ln() / (num_timescales.saturating_sub(1).max(1)) as f32;

    let mut signal = Array2::<f32>::zeros((length, hidden));
    for pos in 0..length {
        for i in 0..num_timescales {
            let inv_timescale = expf(-(i as f32) * log_increment);
            let scaled = pos as f32 * inv_timescale;
            signal[[pos, i]] = sinf(scaled);
            if num_timescales + i < hidden {
                signal[[pos, num_timescales + i]] = cosf(scaled);
            }
        }
    }

    for mut row in x.outer_iter_mut() {
        row += &signal;
    }
}

/// Shift a `[batch, length, hidden]` tensor one step to the right along
/// the length axis, inserting zeros at position 0.
pub fn shift_right_3d(x: &Array3<f32>) -> Array3<f32> {
    let (batch, length, hidden) = x.dim();
    let mut out = Array3::<f32>::zeros((batch, length, hidden));
    if length > 1 {
        out.slice_mut(s![.., 1.., ..])
            .assign(&x.slice(s![.., ..length - 1, ..]));
    }
    out
}

/// Index of the maximum element of a probability/logit row.
pub fn argmax_row(row: &Array1<f32>) -> usize {
    row.iter()
        .enumerate()
        .max_by(|(_, a), (_, b)| a.partial_cmp(b).unwrap())
        .map(|(idx, _)| idx)
        .unwrap_or(0)
}

/// Draw one index from a normalized probability row.
pub fn sample_from_probs(probs: &Array1<f32>, rng: &mut StdRng) -> usize {
    let uniform: f32 = rng.gen();
    let mut cumulative = 0.0;
    for (idx, &prob) in probs.iter().enumerate() {
        cumulative += prob;
        if cumulative >= uniform {
            return idx;
        }
    }
    probs.len() - 1
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::array;
    use rand::SeedableRng;

    #[test]
    fn test_dropout_zero_rate_is_identity() {
        let mut rng = StdRng::seed_from_u64(1);
        let mut x = Array3::<f32>::ones((1, 4, 4));
        dropout_3d(&mut x, 0.0, &mut rng);
        assert!(x.iter().all(|&v| v == 1.0));
    }

    #[test]
    fn test_dropout_scales_survivors() {
        let mut rng = StdRng::seed_from_u64(7);
        let mut x = Array3::<f32>::ones((1, 32, 32));
        dropout_3d(&mut x, 0.5, &mut rng);
        for &v in x.iter() {
            assert!(v == 0.0 || (v - 2.0).abs() < 1e-6);
        }
        // Some of both should appear at this size.
        assert!(x.iter().any(|&v| v == 0.0));
        assert!(x.iter().any(|&v| v != 0.0));
    }

    #[test]
    fn test_timing_signal_position_zero() {
        let mut x = Array3::<f32>::zeros((1, 3, 8));
        add_timing_signal(&mut x);
        // sin(0) = 0 for the first half, cos(0) = 1 for the second half.
        for c in 0..4 {
            assert!((x[[0, 0, c]]).abs() < 1e-6);
            assert!((x[[0, 0, 4 + c]] - 1.0).abs() < 1e-6);
        }
        // Position 1 differs from position 0.
        assert!((x[[0, 1, 0]] - x[[0, 0, 0]]).abs() > 1e-3);
    }

    #[test]
    fn test_shift_right() {
        let x = Array3::from_shape_vec((1, 3, 1), vec![1.0, 2.0, 3.0]).unwrap();
        let shifted = shift_right_3d(&x);
        assert_eq!(shifted[[0, 0, 0]], 0.0);
        assert_eq!(shifted[[0, 1, 0]], 1.0);
        assert_eq!(shifted[[0, 2, 0]], 2.0);
    }

    #[test]
    fn test_argmax_row() {
        assert_eq!(argmax_row(&array![0.1, 0.7, 0.2]), 1);
    }

    #[test]
    fn test_sample_from_probs_deterministic() {
        let mut rng = StdRng::seed_from_u64(3);
        let probs = array![0.0, 0.0, 1.0, 0.0];
        for _ in 0..10 {
            assert_eq!(sample_from_probs(&probs, &mut rng), 2);
        }
    }

    #[test]
    fn test_glorot_bounds() {
        let mut rng = StdRng::seed_from_u64(11);
        let w = glorot_uniform(64, 64, &mut rng);
        let limit = (6.0 / 128.0_f32).sqrt();
        assert!(w.iter().all(|&v| v.abs() <= limit));
    }
}
