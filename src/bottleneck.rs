//! Discretization bottlenecks: map compressed dense vectors to a
//! discrete latent code and back.
//!
//! Every strategy exposes the same surface: [`Bottleneck::forward`]
//! returns the dense reconstruction, the discrete code (when one
//! exists) and the auxiliary losses; [`Bottleneck::embed`] is the pure
//! inverse that rebuilds a dense tensor from a code, usable both with
//! teacher-forced codes during training and with sampled codes at
//! inference.

use anyhow::{anyhow, bail, Result};
use ndarray::{s, Array1, Array2, Array3, Array4, Axis};
use ndarray_rand::rand_distr::{Distribution, Normal};
use rand::rngs::StdRng;
use rand::Rng;

use crate::activations::{relu_scalar, saturating_sigmoid_scalar, softmax_rows};
use crate::config::{AeConfig, BottleneckConfig, Mode, ReshapeMethod};
use crate::linear::Linear;
use crate::schedules::inverse_exp_decay;
use crate::utils::linear_algebra::matmul_2d;
use crate::utils::ops::{argmax_row, sample_from_probs, uniform_unit_scaling};

/// Discrete latent code, `[batch, latent_len, num_blocks]`, each value in
/// `[0, block_vocab)`.
pub type LatentCode = Array3<u32>;

/// Result of one bottleneck application.
pub struct BottleneckOutput {
    /// Dense reconstruction `[batch, latent_len, 1, hidden]`.
    pub dense: Array4<f32>,
    /// Discrete code; `None` for continuous strategies.
    pub discrete: Option<LatentCode>,
    /// Soft assignment distribution `[batch, latent_len, vocab]`, present
    /// only in soft-EM mode for the soft cross-entropy loss.
    pub soft_assignments: Option<Array3<f32>>,
    /// Commitment / KL penalty.
    pub extra_loss: f32,
    /// Negative entropy of the assignment distribution.
    pub neg_q_entropy: f32,
}

enum Strategy {
    Dense {
        down: Linear,
        up1: Linear,
        up2: Linear,
    },
    Vae {
        mean: Linear,
        logvar: Linear,
        up1: Linear,
        up2: Linear,
        noise: Normal<f32>,
    },
    Semhash {
        proj: Linear,
        embed_a: Linear,
        embed_b: Linear,
        out: Linear,
        noise: Normal<f32>,
        discrete_mix: f32,
    },
    Gumbel {
        logits: Linear,
        embedding: Array2<f32>,
        hard: bool,
        temperature_warmup_steps: u64,
    },
    Dvq {
        /// Codebook means, one `[num_blocks, block_vocab, block_dim]`
        /// table per residual stage.
        means: Vec<Array3<f32>>,
        /// Per-stage projections `[num_blocks, hidden, block_dim]`, only
        /// with the `project` reshape method.
        projections: Option<Vec<Array3<f32>>>,
        ema_count: Vec<Array2<f32>>,
        ema_means: Vec<Array3<f32>>,
        num_blocks: usize,
        num_residuals: usize,
        block_dim: usize,
        block_vocab: usize,
        beta: f32,
        decay: f32,
        epsilon: f32,
        ema: bool,
        random_top_k: usize,
        soft_em: bool,
        num_samples: usize,
    },
}

/// The discretization layer.
pub struct Bottleneck {
    strategy: Strategy,
    hidden_size: usize,
    z_size: u32,
}

impl Bottleneck {
    pub fn new(cfg: &AeConfig, rng: &mut StdRng) -> Result<Self> {
        let h = cfg.hidden_size;
        let z = cfg.z_size as usize;
        let filter = cfg.compress_filter_size;
        let vocab = cfg.latent_vocab_size();

        let strategy = match &cfg.bottleneck {
            BottleneckConfig::Dense => Strategy::Dense {
                down: Linear::new(h, z, rng),
                up1: Linear::new(z, filter, rng),
                up2: Linear::new(filter, h, rng),
            },
            BottleneckConfig::Vae { noise_dev } => Strategy::Vae {
                mean: Linear::new(h, z, rng),
                logvar: Linear::new(h, z, rng),
                up1: Linear::new(z, filter, rng),
                up2: Linear::new(filter, h, rng),
                noise: Normal::new(0.0, noise_dev.max(1e-6))
                    .map_err(|e| anyhow!("invalid vae noise deviation: {}", e))?,
            },
            BottleneckConfig::Semhash {
                noise_dev,
                discrete_mix,
            } => Strategy::Semhash {
                proj: Linear::new(h, z, rng),
                embed_a: Linear::new(z, filter, rng),
                embed_b: Linear::new(z, filter, rng),
                out: Linear::new(filter, h, rng),
                noise: Normal::new(0.0, noise_dev.max(1e-6))
                    .map_err(|e| anyhow!("invalid semhash noise deviation: {}", e))?,
                discrete_mix: *discrete_mix,
            },
            BottleneckConfig::GumbelSoftmax {
                hard,
                temperature_warmup_steps,
            } => Strategy::Gumbel {
                logits: Linear::new(h, vocab, rng),
                embedding: uniform_unit_scaling(vocab, h, rng),
                hard: *hard,
                temperature_warmup_steps: *temperature_warmup_steps,
            },
            BottleneckConfig::Dvq {
                num_blocks,
                num_residuals,
                reshape_method,
                beta,
                decay,
                epsilon,
                ema,
                random_top_k,
                soft_em,
                num_samples,
            } => {
                let block_dim = h / num_blocks;
                let bits = z / (num_residuals * num_blocks);
                let block_vocab = 1usize << bits;

                let means: Vec<Array3<f32>> = (0..*num_residuals)
                    .map(|_| {
                        let flat =
                            uniform_unit_scaling(num_blocks * block_vocab, block_dim, rng);
                        flat.into_shape_with_order((*num_blocks, block_vocab, block_dim))
                            .unwrap()
                    })
                    .collect();

                let projections = match reshape_method {
                    ReshapeMethod::Slice => None,
                    ReshapeMethod::Project => Some(
                        (0..*num_residuals)
                            .map(|_| {
                                let flat = uniform_unit_scaling(num_blocks * h, block_dim, rng);
                                flat.into_shape_with_order((*num_blocks, h, block_dim))
                                    .unwrap()
                            })
                            .collect(),
                    ),
                };

                let ema_count = (0..*num_residuals)
                    .map(|_| Array2::<f32>::zeros((*num_blocks, block_vocab)))
                    .collect();
                let ema_means = means.clone();

                Strategy::Dvq {
                    means,
                    projections,
                    ema_count,
                    ema_means,
                    num_blocks: *num_blocks,
                    num_residuals: *num_residuals,
                    block_dim,
                    block_vocab,
                    beta: *beta,
                    decay: *decay,
                    epsilon: *epsilon,
                    ema: *ema,
                    random_top_k: *random_top_k,
                    soft_em: *soft_em,
                    num_samples: *num_samples,
                }
            }
        };

        Ok(Self {
            strategy,
            hidden_size: h,
            z_size: cfg.z_size,
        })
    }

    /// Number of code blocks per position in the discrete output.
    pub fn code_blocks(&self) -> usize {
        match &self.strategy {
            Strategy::Dvq { num_blocks, .. } => *num_blocks,
            _ => 1,
        }
    }

    /// Vocabulary of one code block; the scalar code per position lives
    /// in `[0, code_block_vocab ^ code_blocks)`.
    pub fn code_block_vocab(&self) -> u64 {
        match &self.strategy {
            Strategy::Dvq { block_vocab, .. } => *block_vocab as u64,
            _ => 1u64 << self.z_size,
        }
    }

    /// Discretize `x` (`[batch, latent_len, 1, hidden]`).
    ///
    /// EMA codebook statistics are updated exactly once per call in train
    /// mode and left untouched otherwise.
    pub fn forward(
        &mut self,
        x: &Array4<f32>,
        mode: Mode,
        step: u64,
        rng: &mut StdRng,
    ) -> Result<BottleneckOutput> {
        let (batch, latent_len, _one, hidden) = x.dim();
        assert_eq!(hidden, self.hidden_size, "hidden size mismatch");
        let n = batch * latent_len;
        let flat = x
            .as_standard_layout()
            .to_owned()
            .into_shape_with_order((n, hidden))?;

        if matches!(self.strategy, Strategy::Dvq { .. }) {
            return self.dvq_forward(&flat, batch, latent_len, mode, rng);
        }

        match &mut self.strategy {
            Strategy::Dense { down, up1, up2 } => {
                let mut c = down.forward_2d(&flat);
                c.mapv_inplace(|v| v.tanh());
                let mut h1 = up1.forward_2d(&c);
                h1.mapv_inplace(relu_scalar);
                let dense = up2.forward_2d(&h1);
                Ok(BottleneckOutput {
                    dense: dense.into_shape_with_order((batch, latent_len, 1, hidden))?,
                    discrete: None,
                    soft_assignments: None,
                    extra_loss: 0.0,
                    neg_q_entropy: 0.0,
                })
            }

            Strategy::Vae {
                mean,
                logvar,
                up1,
                up2,
                noise,
            } => {
                let mu = mean.forward_2d(&flat);
                let lv = logvar.forward_2d(&flat);

                let z = if mode.is_train() {
                    let mut z = mu.clone();
                    for (zi, (&m, &l)) in
                        z.iter_mut().zip(mu.iter().zip(lv.iter()))
                    {
                        let eps: f32 = noise.sample(rng);
                        *zi = m + (0.5 * l).exp() * eps;
                    }
                    z
                } else {
                    mu.clone()
                };

                // KL(N(mu, sigma) || N(0, 1)).
                let mut kl = 0.0;
                for (&m, &l) in mu.iter().zip(lv.iter()) {
                    kl += -0.5 * (1.0 + l - m * m - l.exp());
                }
                kl /= (n * mu.shape()[1]) as f32;

                let mut h1 = up1.forward_2d(&z);
                h1.mapv_inplace(relu_scalar);
                let dense = up2.forward_2d(&h1);
                Ok(BottleneckOutput {
                    dense: dense.into_shape_with_order((batch, latent_len, 1, hidden))?,
                    discrete: None,
                    soft_assignments: None,
                    extra_loss: kl,
                    neg_q_entropy: 0.0,
                })
            }

            Strategy::Semhash {
                proj,
                embed_a,
                embed_b,
                out,
                noise,
                discrete_mix,
            } => {
                let z_bits = proj.out_features();
                let mut v = proj.forward_2d(&flat);
                if mode.is_train() {
                    for vi in v.iter_mut() {
                        let eps: f32 = noise.sample(rng);
                        *vi += eps;
                    }
                }

                let mut bits = Array2::<f32>::zeros((n, z_bits));
                for (b, &vi) in bits.iter_mut().zip(v.iter()) {
                    *b = if vi > 0.0 { 1.0 } else { 0.0 };
                }

                // Mix hard bits and the saturating-sigmoid relaxation
                // while the hashing layer warms up.
                let c = if mode.is_train() {
                    let mut c = Array2::<f32>::zeros((n, z_bits));
                    for ((ci, &vi), &bi) in c.iter_mut().zip(v.iter()).zip(bits.iter()) {
                        if rng.gen::<f32>() < *discrete_mix {
                            *ci = bi;
                        } else {
                            *ci = saturating_sigmoid_scalar(vi);
                        }
                    }
                    c
                } else {
                    bits.clone()
                };

                let dense = semhash_embed(&c, embed_a, embed_b, out);

                let mut code = Array3::<u32>::zeros((batch, latent_len, 1));
                for row in 0..n {
                    let mut value: u32 = 0;
                    for bit in 0..z_bits {
                        if bits[[row, bit]] > 0.5 {
                            value |= 1 << bit;
                        }
                    }
                    code[[row / latent_len, row % latent_len, 0]] = value;
                }

                Ok(BottleneckOutput {
                    dense: dense.into_shape_with_order((batch, latent_len, 1, hidden))?,
                    discrete: Some(code),
                    soft_assignments: None,
                    extra_loss: 0.0,
                    neg_q_entropy: 0.0,
                })
            }

            Strategy::Gumbel {
                logits,
                embedding,
                hard,
                temperature_warmup_steps,
            } => {
                let raw = logits.forward_2d(&flat);
                let probs = softmax_rows(&raw);

                // Negative entropy of q, averaged over positions.
                let mut neg_entropy = 0.0;
                for &p in probs.iter() {
                    if p > 0.0 {
                        neg_entropy += p * p.ln();
                    }
                }
                neg_entropy /= n as f32;

                // Anneal from soft (1.0) toward hard (0.5) samples.
                let temperature =
                    (1.0 - 0.5 * inverse_exp_decay(*temperature_warmup_steps, step)).max(0.5);

                let vocab = raw.shape()[1];
                let mut y = Array2::<f32>::zeros((n, vocab));
                if mode.is_train() {
                    let mut noisy = raw.clone();
                    for v in noisy.iter_mut() {
                        let u: f32 = rng.gen::<f32>().max(1e-20);
                        let g = -(-u.ln()).ln();
                        *v = (*v + g) / temperature;
                    }
                    y.assign(&softmax_rows(&noisy));
                } else {
                    for (row, raw_row) in raw.outer_iter().enumerate() {
                        y[[row, argmax_row(&raw_row.to_owned())]] = 1.0;
                    }
                }

                let mut code = Array3::<u32>::zeros((batch, latent_len, 1));
                for (row, y_row) in y.outer_iter().enumerate() {
                    let idx = argmax_row(&y_row.to_owned());
                    code[[row / latent_len, row % latent_len, 0]] = idx as u32;
                }

                if *hard {
                    let hard_y = {
                        let mut hard_y = Array2::<f32>::zeros((n, vocab));
                        for (row, y_row) in y.outer_iter().enumerate() {
                            hard_y[[row, argmax_row(&y_row.to_owned())]] = 1.0;
                        }
                        hard_y
                    };
                    y = hard_y;
                }

                let dense = matmul_2d(&y.view(), &embedding.view());
                Ok(BottleneckOutput {
                    dense: dense.into_shape_with_order((batch, latent_len, 1, hidden))?,
                    discrete: Some(code),
                    soft_assignments: None,
                    extra_loss: 0.0,
                    neg_q_entropy: neg_entropy,
                })
            }

            Strategy::Dvq { .. } => unreachable!("handled above"),
        }
    }

    /// Rebuild a dense tensor from a discrete code.
    ///
    /// This is a pure function of the current parameters: it never
    /// mutates codebooks and is identical in train and predict modes.
    pub fn embed(&self, code: &LatentCode) -> Result<Array4<f32>> {
        let (batch, latent_len, blocks) = code.dim();
        let n = batch * latent_len;
        let h = self.hidden_size;

        match &self.strategy {
            Strategy::Dense { .. } | Strategy::Vae { .. } => {
                bail!("continuous bottlenecks have no discrete code to embed")
            }

            Strategy::Semhash {
                embed_a,
                embed_b,
                out,
                proj,
                ..
            } => {
                assert_eq!(blocks, 1, "semhash codes have one block");
                let z_bits = proj.out_features();
                let mut bits = Array2::<f32>::zeros((n, z_bits));
                for b in 0..batch {
                    for l in 0..latent_len {
                        let value = code[[b, l, 0]];
                        for bit in 0..z_bits {
                            bits[[b * latent_len + l, bit]] =
                                ((value >> bit) & 1) as f32;
                        }
                    }
                }
                let dense = semhash_embed(&bits, embed_a, embed_b, out);
                Ok(dense.into_shape_with_order((batch, latent_len, 1, h))?)
            }

            Strategy::Gumbel { embedding, .. } => {
                assert_eq!(blocks, 1, "gumbel codes have one block");
                let mut dense = Array2::<f32>::zeros((n, h));
                for b in 0..batch {
                    for l in 0..latent_len {
                        let idx = code[[b, l, 0]] as usize;
                        dense
                            .row_mut(b * latent_len + l)
                            .assign(&embedding.row(idx));
                    }
                }
                Ok(dense.into_shape_with_order((batch, latent_len, 1, h))?)
            }

            Strategy::Dvq {
                means,
                num_blocks,
                block_dim,
                ..
            } => {
                assert_eq!(blocks, *num_blocks, "code block count mismatch");
                let mut dense = Array2::<f32>::zeros((n, h));
                // Codes index the primary (stage-0) codebook.
                let stage0 = &means[0];
                for b in 0..batch {
                    for l in 0..latent_len {
                        for k in 0..*num_blocks {
                            let idx = code[[b, l, k]] as usize;
                            dense
                                .slice_mut(s![
                                    b * latent_len + l,
                                    k * block_dim..(k + 1) * block_dim
                                ])
                                .assign(&stage0.slice(s![k, idx, ..]));
                        }
                    }
                }
                Ok(dense.into_shape_with_order((batch, latent_len, 1, h))?)
            }
        }
    }

    fn dvq_forward(
        &mut self,
        flat: &Array2<f32>,
        batch: usize,
        latent_len: usize,
        mode: Mode,
        rng: &mut StdRng,
    ) -> Result<BottleneckOutput> {
        let n = flat.shape()[0];
        let h = self.hidden_size;
        let Strategy::Dvq {
            means,
            projections,
            ema_count,
            ema_means,
            num_blocks,
            num_residuals,
            block_dim,
            block_vocab,
            beta,
            decay,
            epsilon,
            ema,
            random_top_k,
            soft_em,
            num_samples,
        } = &mut self.strategy
        else {
            unreachable!("dvq_forward called on a non-dvq strategy");
        };
        let (nb, nr, bd, bv) = (*num_blocks, *num_residuals, *block_dim, *block_vocab);

        let mut quantized_total = Array2::<f32>::zeros((n, h));
        let mut stage0_codes = Array3::<u32>::zeros((batch, latent_len, nb));
        let mut soft_assignments = None;
        let mut neg_q_entropy = 0.0;

        // Residual stages run sequentially: each quantizes whatever the
        // previous stages left unexplained.
        for r in 0..nr {
            let residual_input = flat - &quantized_total;
            let mut quantized_r = Array2::<f32>::zeros((n, h));

            for k in 0..nb {
                // Block view of the residual, sliced or projected.
                let xb: Array2<f32> = match projections {
                    None => residual_input
                        .slice(s![.., k * bd..(k + 1) * bd])
                        .to_owned(),
                    Some(projs) => {
                        let p = projs[r].slice(s![k, .., ..]).to_owned();
                        matmul_2d(&residual_input.view(), &p.view())
                    }
                };

                let codebook = means[r].slice(s![k, .., ..]).to_owned();
                let distances = pairwise_sq_distances(&xb, &codebook);

                let mut assigned = Array1::<usize>::zeros(n);
                if *soft_em {
                    let probs = softmax_rows(&distances.mapv(|d| -d));
                    for &p in probs.iter() {
                        if p > 0.0 {
                            neg_q_entropy += p * p.ln();
                        }
                    }
                    let mut soft = Array2::<f32>::zeros((n, bv));
                    for (row, p_row) in probs.outer_iter().enumerate() {
                        let p = p_row.to_owned();
                        let mut counts = Array1::<f32>::zeros(bv);
                        for _ in 0..*num_samples {
                            counts[sample_from_probs(&p, rng)] += 1.0;
                        }
                        counts /= *num_samples as f32;
                        soft.row_mut(row).assign(&counts);
                        assigned[row] = argmax_row(&counts);
                    }
                    if r == 0 && nb == 1 {
                        soft_assignments = Some(
                            soft.clone()
                                .into_shape_with_order((batch, latent_len, bv))?,
                        );
                    }
                } else {
                    for (row, d_row) in distances.outer_iter().enumerate() {
                        let pick = if mode.is_train() && *random_top_k > 1 {
                            let mut indexed: Vec<(usize, f32)> =
                                d_row.iter().cloned().enumerate().collect();
                            indexed.sort_by(|a, b| a.1.partial_cmp(&b.1).unwrap());
                            let k_cap = (*random_top_k).min(indexed.len());
                            indexed[rng.gen_range(0..k_cap)].0
                        } else {
                            let mut best = 0;
                            let mut best_d = f32::INFINITY;
                            for (i, &d) in d_row.iter().enumerate() {
                                if d < best_d {
                                    best_d = d;
                                    best = i;
                                }
                            }
                            best
                        };
                        assigned[row] = pick;
                    }
                }

                if r == 0 {
                    for row in 0..n {
                        stage0_codes[[row / latent_len, row % latent_len, k]] =
                            assigned[row] as u32;
                    }
                }

                // Write the selected codebook vectors back into the
                // hidden layout (always the sliced layout, so the sum of
                // stages lives in the same space as the input).
                for row in 0..n {
                    let mean_vec = codebook.slice(s![assigned[row], ..]);
                    quantized_r
                        .slice_mut(s![row, k * bd..(k + 1) * bd])
                        .assign(&mean_vec);
                }

                // EMA updates, exactly once per training step.
                if mode.is_train() && *ema {
                    let mut batch_count = Array1::<f32>::zeros(bv);
                    let mut batch_sum = Array2::<f32>::zeros((bv, bd));
                    for row in 0..n {
                        let a = assigned[row];
                        batch_count[a] += 1.0;
                        let xb_row = xb.row(row);
                        let mut sum_row = batch_sum.row_mut(a);
                        sum_row += &xb_row;
                    }

                    for v in 0..bv {
                        ema_count[r][[k, v]] =
                            ema_count[r][[k, v]] * *decay + (1.0 - *decay) * batch_count[v];
                    }
                    let total: f32 = ema_count[r].slice(s![k, ..]).sum();
                    for v in 0..bv {
                        let mut em = ema_means[r].slice_mut(s![k, v, ..]);
                        let update = batch_sum.row(v).mapv(|x| x * (1.0 - *decay));
                        em.zip_mut_with(&update, |m, &u| *m = *m * *decay + u);

                        // Laplace-smoothed count keeps unused codes alive.
                        let smoothed = (ema_count[r][[k, v]] + *epsilon)
                            / (total + bv as f32 * *epsilon)
                            * total.max(1.0);
                        let em_snapshot = ema_means[r].slice(s![k, v, ..]).to_owned();
                        means[r]
                            .slice_mut(s![k, v, ..])
                            .assign(&em_snapshot.mapv(|m| m / smoothed.max(1e-6)));
                    }
                }
            }

            quantized_total = quantized_total + quantized_r;
        }

        if *soft_em {
            neg_q_entropy /= n as f32;
        }

        // Commitment term; with EMA the codebook side is learned by the
        // moving averages rather than this loss.
        let diff = flat - &quantized_total;
        let commitment = diff.mapv(|d| d * d).mean().unwrap_or(0.0);
        let extra_loss = if *ema {
            *beta * commitment
        } else {
            (1.0 + *beta) * commitment
        };

        Ok(BottleneckOutput {
            dense: quantized_total.into_shape_with_order((batch, latent_len, 1, h))?,
            discrete: Some(stage0_codes),
            soft_assignments,
            extra_loss,
            neg_q_entropy,
        })
    }

    /// Bits per position in the combined latent vocabulary.
    pub fn z_size(&self) -> u32 {
        self.z_size
    }
}

fn semhash_embed(
    bits: &Array2<f32>,
    embed_a: &Linear,
    embed_b: &Linear,
    out: &Linear,
) -> Array2<f32> {
    let complement = bits.mapv(|b| 1.0 - b);
    let mut h1 = embed_a.forward_2d(bits) + embed_b.forward_2d(&complement);
    h1.mapv_inplace(relu_scalar);
    out.forward_2d(&h1)
}

/// Squared euclidean distances between rows of `x` and rows of `m`.
fn pairwise_sq_distances(x: &Array2<f32>, m: &Array2<f32>) -> Array2<f32> {
    let x_sq = x.mapv(|v| v * v).sum_axis(Axis(1));
    let m_sq = m.mapv(|v| v * v).sum_axis(Axis(1));
    let m_t = m.t().as_standard_layout().to_owned();
    let dot = matmul_2d(&x.view(), &m_t.view());

    let mut out = dot;
    for (mut row, &xs) in out.outer_iter_mut().zip(x_sq.iter()) {
        for (v, &ms) in row.iter_mut().zip(m_sq.iter()) {
            *v = xs + ms - 2.0 * *v;
        }
    }
    out
}
