//! Stochastic masking between true targets and latent reconstructions.
//!
//! During training the blend follows a time-decayed schedule: early on
//! nearly every position keeps the ground truth (the decoder trains as a
//! plain language model), and as the bottleneck warms up more positions
//! read the reconstruction. At inference the blend weight is the
//! externally supplied `predict_mask`: 1.0 keeps the ground truth
//! (decoder-only behavior), 0.0 uses the full reconstruction.

use ndarray::{Array3, Array4, Zip};
use rand::rngs::StdRng;
use rand::Rng;

use crate::config::{AeConfig, Mode};
use crate::schedules::{inverse_exp_decay, inverse_lin_decay};

pub struct MaskingPolicy {
    mask_startup_steps: u64,
    unmasked_percentage: f32,
    do_refine: bool,
    use_predict_mask: bool,
}

impl MaskingPolicy {
    pub fn new(cfg: &AeConfig) -> Self {
        Self {
            mask_startup_steps: cfg.mask_startup_steps,
            unmasked_percentage: cfg.unmasked_percentage,
            do_refine: cfg.do_refine,
            use_predict_mask: cfg.use_predict_mask,
        }
    }

    /// The schedule weight: probability that a position reads the
    /// reconstruction instead of the true target. Always in `[0, 1]`.
    pub fn masking_weight(&self, step: u64, rng: &mut StdRng) -> f32 {
        let mut masking = inverse_lin_decay(self.mask_startup_steps, step)
            * inverse_exp_decay(self.mask_startup_steps / 4, step);
        if !self.do_refine {
            masking -= rng.gen::<f32>() * self.unmasked_percentage;
        }
        masking.clamp(0.0, 1.0)
    }

    /// Blend `targets` and `reconstruction` elementwise:
    /// `out = mask · target + (1 − mask) · reconstruction`.
    ///
    /// Returns the blended tensor and the per-position keep mask
    /// `[batch, length, width]` (1.0 = kept the true target).
    pub fn blend(
        &self,
        targets: &Array4<f32>,
        reconstruction: &Array4<f32>,
        mode: Mode,
        step: u64,
        predict_mask: f32,
        rng: &mut StdRng,
    ) -> (Array4<f32>, Array3<f32>) {
        let (batch, length, width, _hidden) = targets.dim();
        assert_eq!(
            targets.dim(),
            reconstruction.dim(),
            "targets and reconstruction must have matching shapes"
        );

        let forced = mode.is_predict() || (self.use_predict_mask && !mode.is_train());
        let mask = if forced {
            Array3::<f32>::from_elem((batch, length, width), predict_mask.clamp(0.0, 1.0))
        } else {
            let weight = self.masking_weight(step, rng);
            let mut mask = Array3::<f32>::zeros((batch, length, width));
            for v in mask.iter_mut() {
                *v = if rng.gen::<f32>() > weight { 1.0 } else { 0.0 };
            }
            mask
        };

        let mut out = targets.clone();
        Zip::indexed(&mut out).for_each(|(b, l, w, h), v| {
            let m = mask[[b, l, w]];
            *v = m * *v + (1.0 - m) * reconstruction[[b, l, w, h]];
        });
        (out, mask)
    }
}
