//! Latent-code prediction: logits heads, mixed-radix factorization,
//! cross-entropy loss and categorical sampling.

use anyhow::{bail, Result};
use ndarray::{Array2, Array3};
use rand::rngs::StdRng;

use crate::activations::{log_softmax_1d, softmax_1d_inplace};
use crate::bottleneck::LatentCode;
use crate::config::AeConfig;
use crate::linear::Linear;
use crate::utils::ops::{argmax_row, sample_from_probs};

/// Combine per-block digits into one scalar code per position:
/// `value = Σ digit_k · block_vocab^k`.
pub fn combine_code(code: &LatentCode, block_vocab: u64) -> Array2<u64> {
    let (batch, len, blocks) = code.dim();
    let mut out = Array2::<u64>::zeros((batch, len));
    for b in 0..batch {
        for l in 0..len {
            let mut value: u64 = 0;
            let mut radix: u64 = 1;
            for k in 0..blocks {
                value += code[[b, l, k]] as u64 * radix;
                radix *= block_vocab;
            }
            out[[b, l]] = value;
        }
    }
    out
}

/// Inverse of [`combine_code`]: split scalar codes back into digits.
pub fn split_code(code: &Array2<u64>, block_vocab: u64, num_blocks: usize) -> LatentCode {
    let (batch, len) = code.dim();
    let mut out = Array3::<u32>::zeros((batch, len, num_blocks));
    for b in 0..batch {
        for l in 0..len {
            let mut rest = code[[b, l]];
            for k in 0..num_blocks {
                out[[b, l, k]] = (rest % block_vocab) as u32;
                rest /= block_vocab;
            }
        }
    }
    out
}

/// Predicts the discrete latent code from decoder states.
///
/// In multi-block mode the `2^z_size` vocabulary factors into
/// `num_decode_blocks` digits of `block_vocab` values each, one
/// classifier head per digit.
pub struct LatentPredictor {
    heads: Vec<Linear>,
    vocab_size: usize,
    block_vocab: usize,
    num_blocks: usize,
    logit_normalization: bool,
    sampling_temp: f32,
}

impl LatentPredictor {
    pub fn new(cfg: &AeConfig, rng: &mut StdRng) -> Result<Self> {
        let bits = cfg.z_size as usize;
        let num_blocks = cfg.num_decode_blocks;
        if bits % num_blocks != 0 {
            bail!(
                "latent vocabulary bits ({}) not divisible by num_decode_blocks ({})",
                bits,
                num_blocks
            );
        }
        let vocab_size = 1usize << bits;
        let block_vocab = 1usize << (bits / num_blocks);

        let heads = if num_blocks < 2 {
            vec![Linear::new(cfg.hidden_size, vocab_size, rng)]
        } else {
            (0..num_blocks)
                .map(|_| Linear::new(cfg.hidden_size, block_vocab, rng))
                .collect()
        };

        Ok(Self {
            heads,
            vocab_size,
            block_vocab,
            num_blocks,
            logit_normalization: cfg.logit_normalization,
            sampling_temp: cfg.sampling_temp,
        })
    }

    #[inline]
    pub fn vocab_size(&self) -> usize {
        self.vocab_size
    }

    #[inline]
    pub fn block_vocab(&self) -> u64 {
        self.block_vocab as u64
    }

    #[inline]
    pub fn num_blocks(&self) -> usize {
        self.num_blocks
    }

    /// Per-block logits over the latent vocabulary,
    /// `[batch, latent_len, vocab]` each.
    pub fn logits(&self, pred: &Array3<f32>) -> Vec<Array3<f32>> {
        self.heads
            .iter()
            .map(|head| {
                let mut logits = head.forward(pred);
                if self.num_blocks < 2 && self.logit_normalization {
                    let mean_sq = logits.mapv(|v| v * v).mean().unwrap_or(0.0);
                    let scale = 1.0 / (1e-8 + mean_sq).sqrt();
                    logits.mapv_inplace(|v| v * scale);
                }
                logits
            })
            .collect()
    }

    /// Cross-entropy of the true code under the predicted logits,
    /// per position `[batch, latent_len]`, summed across blocks.
    ///
    /// With `soft_targets` (soft-EM mode, single block) the loss is the
    /// soft cross-entropy against the assignment distribution.
    pub fn loss(
        &self,
        logits: &[Array3<f32>],
        targets: &Array2<u64>,
        soft_targets: Option<&Array3<f32>>,
    ) -> Array2<f32> {
        let (batch, len) = targets.dim();
        let mut loss = Array2::<f32>::zeros((batch, len));

        if let Some(soft) = soft_targets {
            let block = &logits[0];
            for b in 0..batch {
                for l in 0..len {
                    let row = block.slice(ndarray::s![b, l, ..]).to_owned();
                    let log_probs = log_softmax_1d(&row);
                    let mut ce = 0.0;
                    for (v, &p) in log_probs.iter().enumerate() {
                        ce -= soft[[b, l, v]] * p;
                    }
                    loss[[b, l]] = ce;
                }
            }
            return loss;
        }

        for (k, block) in logits.iter().enumerate() {
            let radix = (self.block_vocab as u64).pow(k as u32);
            for b in 0..batch {
                for l in 0..len {
                    let digit =
                        ((targets[[b, l]] / radix) % self.block_vocab as u64) as usize;
                    let row = block.slice(ndarray::s![b, l, ..]).to_owned();
                    let log_probs = log_softmax_1d(&row);
                    loss[[b, l]] -= log_probs[digit];
                }
            }
        }
        loss
    }

    /// Sample a scalar code per position: per-block multinomial at
    /// positive temperature, argmax at zero.
    pub fn sample(&self, logits: &[Array3<f32>], rng: &mut StdRng) -> Array2<u64> {
        let (batch, len, _) = logits[0].dim();
        let mut out = Array2::<u64>::zeros((batch, len));

        for (k, block) in logits.iter().enumerate() {
            let radix = (self.block_vocab as u64).pow(k as u32);
            for b in 0..batch {
                for l in 0..len {
                    let row = block.slice(ndarray::s![b, l, ..]).to_owned();
                    let digit = if self.sampling_temp > 0.0 {
                        let mut probs = row / self.sampling_temp;
                        softmax_1d_inplace(&mut probs);
                        sample_from_probs(&probs, rng) as u64
                    } else {
                        argmax_row(&row) as u64
                    };
                    out[[b, l]] += digit * radix;
                }
            }
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::Array3;
    use rand::SeedableRng;

    fn tiny_config() -> AeConfig {
        let mut cfg = AeConfig::small();
        cfg.hidden_size = 8;
        cfg.z_size = 6;
        cfg.num_decode_blocks = 1;
        cfg
    }

    #[test]
    fn test_mixed_radix_bijection() {
        // Every digit tuple survives compose → decompose.
        let block_vocab = 8u64;
        for d0 in 0..8u32 {
            for d1 in 0..8u32 {
                for d2 in 0..8u32 {
                    let mut code = Array3::<u32>::zeros((1, 1, 3));
                    code[[0, 0, 0]] = d0;
                    code[[0, 0, 1]] = d1;
                    code[[0, 0, 2]] = d2;
                    let combined = combine_code(&code, block_vocab);
                    assert_eq!(
                        combined[[0, 0]],
                        d0 as u64 + 8 * d1 as u64 + 64 * d2 as u64
                    );
                    let split = split_code(&combined, block_vocab, 3);
                    assert_eq!(split, code);
                }
            }
        }
    }

    #[test]
    fn test_single_block_logits_shape() {
        let cfg = tiny_config();
        let mut rng = StdRng::seed_from_u64(0);
        let predictor = LatentPredictor::new(&cfg, &mut rng).unwrap();
        let pred = Array3::<f32>::ones((2, 4, 8));
        let logits = predictor.logits(&pred);
        assert_eq!(logits.len(), 1);
        assert_eq!(logits[0].dim(), (2, 4, 64));
    }

    #[test]
    fn test_multi_block_logits_shape() {
        let mut cfg = tiny_config();
        cfg.num_decode_blocks = 3;
        let mut rng = StdRng::seed_from_u64(1);
        let predictor = LatentPredictor::new(&cfg, &mut rng).unwrap();
        let pred = Array3::<f32>::ones((1, 4, 8));
        let logits = predictor.logits(&pred);
        assert_eq!(logits.len(), 3);
        for block in &logits {
            assert_eq!(block.dim(), (1, 4, 4));
        }
    }

    #[test]
    fn test_block_mismatch_rejected() {
        let mut cfg = tiny_config();
        cfg.z_size = 7;
        cfg.num_decode_blocks = 2;
        let mut rng = StdRng::seed_from_u64(2);
        assert!(LatentPredictor::new(&cfg, &mut rng).is_err());
    }

    #[test]
    fn test_loss_prefers_correct_code() {
        let cfg = tiny_config();
        let mut rng = StdRng::seed_from_u64(3);
        let predictor = LatentPredictor::new(&cfg, &mut rng).unwrap();

        // Force logits that put weight on code 5.
        let mut logits = Array3::<f32>::zeros((1, 1, 64));
        logits[[0, 0, 5]] = 10.0;

        let mut right = Array2::<u64>::zeros((1, 1));
        right[[0, 0]] = 5;
        let mut wrong = Array2::<u64>::zeros((1, 1));
        wrong[[0, 0]] = 9;

        let loss_right = predictor.loss(&[logits.clone()], &right, None);
        let loss_wrong = predictor.loss(&[logits], &wrong, None);
        assert!(loss_right[[0, 0]] < loss_wrong[[0, 0]]);
    }

    #[test]
    fn test_multi_block_loss_sums_blocks() {
        let mut cfg = tiny_config();
        cfg.num_decode_blocks = 2;
        let mut rng = StdRng::seed_from_u64(4);
        let predictor = LatentPredictor::new(&cfg, &mut rng).unwrap();

        // Uniform logits: each block contributes ln(block_vocab).
        let logits = vec![
            Array3::<f32>::zeros((1, 1, 8)),
            Array3::<f32>::zeros((1, 1, 8)),
        ];
        let targets = Array2::<u64>::zeros((1, 1));
        let loss = predictor.loss(&logits, &targets, None);
        let expected = 2.0 * (8.0f32).ln();
        assert!((loss[[0, 0]] - expected).abs() < 1e-4);
    }

    #[test]
    fn test_greedy_sample_composes_argmax_digits() {
        let mut cfg = tiny_config();
        cfg.num_decode_blocks = 2;
        cfg.sampling_temp = 0.0;
        let mut rng = StdRng::seed_from_u64(5);
        let predictor = LatentPredictor::new(&cfg, &mut rng).unwrap();

        let mut block0 = Array3::<f32>::zeros((1, 1, 8));
        block0[[0, 0, 3]] = 5.0;
        let mut block1 = Array3::<f32>::zeros((1, 1, 8));
        block1[[0, 0, 6]] = 5.0;

        let sample = predictor.sample(&[block0, block1], &mut rng);
        assert_eq!(sample[[0, 0]], 3 + 6 * 8);
    }

    #[test]
    fn test_soft_target_loss_matches_hard_when_peaked() {
        let cfg = tiny_config();
        let mut rng = StdRng::seed_from_u64(6);
        let predictor = LatentPredictor::new(&cfg, &mut rng).unwrap();

        let mut logits = Array3::<f32>::zeros((1, 1, 64));
        logits[[0, 0, 7]] = 3.0;

        let mut hard = Array2::<u64>::zeros((1, 1));
        hard[[0, 0]] = 7;
        let mut soft = Array3::<f32>::zeros((1, 1, 64));
        soft[[0, 0, 7]] = 1.0;

        let l_hard = predictor.loss(&[logits.clone()], &hard, None);
        let l_soft = predictor.loss(&[logits], &hard, Some(&soft));
        assert!((l_hard[[0, 0]] - l_soft[[0, 0]]).abs() < 1e-5);
    }
}
