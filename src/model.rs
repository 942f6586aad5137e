//! The autoencoder transformer: orchestration of encoder, compression,
//! bottleneck, latent prediction/sampling, decompression, masking and
//! the base decoder.

use std::collections::BTreeMap;

use anyhow::{bail, Result};
use ndarray::{s, Array2, Array3, Array4};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use crate::bottleneck::Bottleneck;
use crate::compress::{Compressor, Decompressor};
use crate::config::{AeConfig, Mode};
use crate::latent::{combine_code, split_code, LatentPredictor};
use crate::masking::MaskingPolicy;
use crate::sampler::LatentSampler;
use crate::schedules::{inverse_exp_decay, inverse_lin_decay};
use crate::transformer::{TransformerDecoder, TransformerEncoder};
use crate::utils::masks::attention_bias_ignore_padding;
use crate::utils::ops::{add_timing_signal, dropout_3d, uniform_unit_scaling};

/// Scalar latent codes reused across incremental decoding calls.
///
/// Owned by one decoding session; created lazily on the first predict
/// pass and handed back on every subsequent call.
pub type Cache = Array2<u64>;

/// The three losses of one forward pass. Each defaults to zero when its
/// branch does not apply.
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct Losses {
    /// Bottleneck commitment / KL penalty.
    pub extra: f32,
    /// Latent-prediction loss (cross-entropy, or scaled squared error
    /// for continuous bottlenecks).
    pub latent_pred: f32,
    /// Entropy bonus of the assignment distribution.
    pub neg_q_entropy: f32,
}

impl Losses {
    pub fn total(&self) -> f32 {
        self.extra + self.latent_pred + self.neg_q_entropy
    }
}

/// Scalar statistics recorded during a forward pass when the
/// configuration asks for them. Replaces any process-wide summary state:
/// the value is returned to the caller and owned by it.
#[derive(Clone, Debug, Default)]
pub struct Summary {
    enabled: bool,
    scalars: BTreeMap<String, f32>,
}

impl Summary {
    pub fn new(enabled: bool) -> Self {
        Self {
            enabled,
            scalars: BTreeMap::new(),
        }
    }

    pub fn record(&mut self, name: &str, value: f32) {
        if self.enabled {
            self.scalars.insert(name.to_string(), value);
        }
    }

    pub fn get(&self, name: &str) -> Option<f32> {
        self.scalars.get(name).copied()
    }

    pub fn scalars(&self) -> &BTreeMap<String, f32> {
        &self.scalars
    }
}

/// Everything one forward pass returns.
pub struct ForwardOutput {
    /// Decoder output `[batch, target_len, 1, hidden]`, truncated back to
    /// the caller's (unpadded) target length.
    pub output: Array4<f32>,
    pub losses: Losses,
    pub cache: Option<Cache>,
    /// Length of the decoded output.
    pub data_len: usize,
    /// Length of the compressed latent sequence.
    pub latent_len: usize,
    pub summary: Summary,
}

/// Average nats and bits per data dimension given the reconstruction and
/// prior losses.
pub fn nats_and_bits_per_dim(
    data_dim: usize,
    latent_dim: usize,
    average_reconstruction: f32,
    average_prior: f32,
) -> (f32, f32) {
    let data_dim = data_dim.max(1) as f32;
    let nats = (average_reconstruction * data_dim + average_prior * latent_dim as f32) / data_dim;
    (nats, nats / std::f32::consts::LN_2)
}

/// Autoencoder-augmented transformer.
pub struct AeTransformer {
    cfg: AeConfig,
    target_space_embedding: Array2<f32>,
    target_positions: Array2<f32>,
    latent_positions: Array2<f32>,
    encoder: TransformerEncoder,
    refine_encoder: Option<TransformerEncoder>,
    decoder: TransformerDecoder,
    latent_decoder: TransformerDecoder,
    dense_decoder: Option<TransformerDecoder>,
    compressor: Compressor,
    decompressor: Decompressor,
    bottleneck: Bottleneck,
    predictor: LatentPredictor,
    sampler: LatentSampler,
    masking: MaskingPolicy,
    rng: StdRng,
}

impl AeTransformer {
    pub fn new(cfg: AeConfig) -> Result<Self> {
        cfg.validate()?;
        let mut rng = StdRng::seed_from_u64(cfg.seed);

        let target_space_embedding =
            uniform_unit_scaling(cfg.target_space_vocab, cfg.hidden_size, &mut rng);
        let target_positions = uniform_unit_scaling(cfg.max_length, cfg.hidden_size, &mut rng);
        let latent_positions = uniform_unit_scaling(cfg.max_length, cfg.hidden_size, &mut rng);

        let encoder = TransformerEncoder::new(&cfg, &mut rng);
        let refine_encoder = (cfg.do_mask && cfg.do_refine)
            .then(|| TransformerEncoder::new(&cfg, &mut rng));
        let decoder = TransformerDecoder::new(&cfg, &mut rng);
        let latent_decoder = TransformerDecoder::new(&cfg, &mut rng);
        let dense_decoder = (!cfg.bottleneck.is_discrete())
            .then(|| TransformerDecoder::new(&cfg, &mut rng));

        let compressor = Compressor::new(&cfg, &mut rng);
        let decompressor = Decompressor::new(&cfg, &mut rng);
        let bottleneck = Bottleneck::new(&cfg, &mut rng)?;
        let predictor = LatentPredictor::new(&cfg, &mut rng)?;
        let sampler = LatentSampler::new(&cfg);
        let masking = MaskingPolicy::new(&cfg);

        Ok(Self {
            cfg,
            target_space_embedding,
            target_positions,
            latent_positions,
            encoder,
            refine_encoder,
            decoder,
            latent_decoder,
            dense_decoder,
            compressor,
            decompressor,
            bottleneck,
            predictor,
            sampler,
            masking,
            rng,
        })
    }

    pub fn config(&self) -> &AeConfig {
        &self.cfg
    }

    /// One full forward pass.
    ///
    /// `inputs` is the already-embedded conditioning sequence
    /// `[batch, input_len, hidden]` (or `None` for unconditional runs),
    /// `targets` is `[batch, target_len, 1, hidden]`. `step` is the
    /// global training step driving the warm-up schedules. `cache`
    /// carries sampled latent codes between incremental predict calls;
    /// `predict_mask` is the inference blend weight (1.0 keeps the
    /// ground truth, 0.0 decodes from the full reconstruction).
    pub fn forward(
        &mut self,
        inputs: Option<&Array3<f32>>,
        targets: &Array4<f32>,
        target_space: usize,
        mode: Mode,
        step: u64,
        cache: Option<Cache>,
        predict_mask: f32,
    ) -> Result<ForwardOutput> {
        let (batch, original_len, width, hidden) = targets.dim();
        if hidden != self.cfg.hidden_size {
            bail!(
                "target hidden size {} does not match configured {}",
                hidden,
                self.cfg.hidden_size
            );
        }

        let mut summary = Summary::new(self.cfg.summarize);
        let mut losses = Losses::default();
        let mut cache = cache;

        // Encoder over the conditioning inputs.
        let encoded = match inputs {
            Some(inputs) => Some(self.encode_inputs(inputs, target_space, mode)?),
            None => None,
        };
        let enc = encoded.as_ref().map(|(e, _)| e);
        let enc_bias = encoded.as_ref().map(|(_, b)| b);

        let (res, latent_len) = if self.cfg.do_ae {
            // Pad targets so compression divides evenly; conditional
            // generation reserves up to twice the input length.
            let bound = match inputs {
                Some(inputs) => inputs.shape()[1] * 2,
                None => original_len,
            };
            let factor = self.cfg.compress_factor();
            let padded_len = round_up(original_len.max(bound), factor);

            let mut targets_shuffled = targets.clone();
            if mode.is_train() && self.cfg.word_shuffle > 0.0 {
                log::info!("using word shuffle with rate = {}", self.cfg.word_shuffle);
                targets_shuffled =
                    shuffle_positions(&targets_shuffled, self.cfg.word_shuffle, &mut self.rng);
            }
            let mut targets_padded = pad_length(&targets_shuffled, padded_len);

            add_position_table(&mut targets_padded, &self.target_positions)?;

            let targets_noisy = if mode.is_train() && self.cfg.word_dropout > 0.0 {
                let mut noisy = targets_padded.clone();
                for v in noisy.iter_mut() {
                    if self.rng.gen::<f32>() < self.cfg.word_dropout {
                        *v = 0.0;
                    }
                }
                noisy
            } else {
                targets_padded.clone()
            };

            let targets_c =
                self.compressor
                    .forward(&targets_noisy, enc, mode, &mut self.rng)?;
            let latent_len = targets_c.shape()[1];

            let mut latents_dense;
            if !mode.is_predict() {
                latents_dense = self.train_eval_latents(
                    &targets_c,
                    enc,
                    enc_bias,
                    mode,
                    step,
                    batch,
                    &mut losses,
                    &mut summary,
                )?;
            } else {
                latents_dense = self.predict_latents(
                    &targets_c,
                    enc,
                    enc_bias,
                    &mut cache,
                    batch,
                    latent_len,
                )?;
            }

            add_position_table(&mut latents_dense, &self.latent_positions)?;

            let d = self
                .decompressor
                .forward(&latents_dense, enc, mode, &mut self.rng)?;

            let (blended, mask) = if self.cfg.do_mask {
                let (blended, mask) = self.masking.blend(
                    &targets_padded,
                    &d,
                    mode,
                    step,
                    predict_mask,
                    &mut self.rng,
                );
                (blended, Some(mask))
            } else {
                (d, None)
            };

            let mut res = self.decode_targets(&blended, enc, enc_bias, mode)?;

            // Rows where no position kept the ground truth get one
            // refinement pass through a dedicated encoder.
            if self.refine_encoder.is_some() {
                if let Some(mask) = &mask {
                    res = self.refine_rows(res, mask, target_space, mode)?;
                }
            }

            // The latent prior only trains once masking has ramped up.
            if step <= self.cfg.mask_startup_steps {
                losses.latent_pred = 0.0;
            }

            (res, latent_len)
        } else {
            let res = self.decode_targets(targets, enc, enc_bias, mode)?;
            (res, 0)
        };

        // Padding added above would disturb loss shapes downstream, so
        // cut the output (flattened to `[batch, len · width, 1, hidden]`
        // by the decoder) back to the caller's length.
        let res = res
            .slice(s![.., ..original_len * width, .., ..])
            .to_owned();
        let data_len = res.shape()[1];

        Ok(ForwardOutput {
            output: res,
            losses,
            cache,
            data_len,
            latent_len,
            summary,
        })
    }

    /// Produce predictions for `inputs` alone.
    ///
    /// Runs one predict pass over zero targets to sample the latent
    /// cache, then decodes from the full latent reconstruction.
    pub fn infer(&mut self, inputs: &Array3<f32>, target_space: usize) -> Result<ForwardOutput> {
        let (batch, input_len, hidden) = inputs.dim();
        let target_len = round_up(input_len * 2, self.cfg.compress_factor());
        let targets = Array4::<f32>::zeros((batch, target_len, 1, hidden));

        let first = self.forward(
            Some(inputs),
            &targets,
            target_space,
            Mode::Predict,
            0,
            None,
            1.0,
        )?;

        self.forward(
            Some(inputs),
            &targets,
            target_space,
            Mode::Predict,
            0,
            first.cache,
            0.0,
        )
    }

    fn encode_inputs(
        &mut self,
        inputs: &Array3<f32>,
        target_space: usize,
        mode: Mode,
    ) -> Result<(Array3<f32>, Array4<f32>)> {
        if target_space >= self.cfg.target_space_vocab {
            bail!(
                "target space id {} outside vocabulary of {}",
                target_space,
                self.cfg.target_space_vocab
            );
        }
        let bias = attention_bias_ignore_padding(inputs);

        let mut x = inputs.clone();
        let space = self.target_space_embedding.row(target_space);
        for mut row in x.outer_iter_mut() {
            for mut pos in row.outer_iter_mut() {
                pos += &space;
            }
        }
        add_timing_signal(&mut x);
        if mode.is_train() {
            dropout_3d(&mut x, self.cfg.dropout, &mut self.rng);
        }

        let out = self.encoder.forward(&x, Some(&bias), mode, &mut self.rng)?;
        Ok((out, bias))
    }

    /// Training/eval latent path: bottleneck plus the warm-up gate, and
    /// the latent-prediction loss.
    #[allow(clippy::too_many_arguments)]
    fn train_eval_latents(
        &mut self,
        targets_c: &Array4<f32>,
        enc: Option<&Array3<f32>>,
        enc_bias: Option<&Array4<f32>>,
        mode: Mode,
        step: u64,
        batch: usize,
        losses: &mut Losses,
        summary: &mut Summary,
    ) -> Result<Array4<f32>> {
        let out = self
            .bottleneck
            .forward(targets_c, mode, step, &mut self.rng)?;

        if let Some(code) = &out.discrete {
            let first_position = code.slice(s![.., 0, ..]);
            let mean = first_position.iter().map(|&c| c as f32).sum::<f32>()
                / first_position.len().max(1) as f32;
            summary.record("latent_code_b0_mean", mean);
        }

        // Stochastic warm-up gate: rows bypass the bottleneck until the
        // schedule ramps up.
        let pc = if mode.is_train() {
            inverse_exp_decay(self.cfg.startup_steps, step)
        } else {
            1.0
        };
        let cond: Vec<bool> = (0..batch).map(|_| self.rng.gen::<f32>() < pc).collect();
        let cond_frac =
            cond.iter().filter(|&&c| c).count() as f32 / batch.max(1) as f32;

        let mut latents_dense = out.dense.clone();
        for (b, &keep) in cond.iter().enumerate() {
            if !keep {
                latents_dense
                    .slice_mut(s![b, .., .., ..])
                    .assign(&targets_c.slice(s![b, .., .., ..]));
            }
        }
        losses.extra = out.extra_loss * cond_frac;

        if self.cfg.bottleneck.is_discrete() {
            let code = out
                .discrete
                .as_ref()
                .expect("discrete bottlenecks always produce a code");

            // Predict the (gradient-stopped) code from the encoder
            // context alone.
            let embedded = self.bottleneck.embed(code)?;
            let states = self.latent_decoder.decode(
                &flatten_inner(&embedded),
                enc,
                enc_bias,
                true,
                mode,
                &mut self.rng,
            )?;
            let logits = self.predictor.logits(&states);
            let scalar_code = combine_code(code, self.bottleneck.code_block_vocab());
            let mut pred_loss =
                self.predictor
                    .loss(&logits, &scalar_code, out.soft_assignments.as_ref());

            summary.record(
                "latent_pred_loss_mean",
                pred_loss.mean().unwrap_or(0.0),
            );

            if self.cfg.sum_over_latents {
                let row_sums = pred_loss.sum_axis(ndarray::Axis(1));
                let mut collapsed = Array2::<f32>::zeros((batch, 1));
                for b in 0..batch {
                    collapsed[[b, 0]] = row_sums[b];
                }
                pred_loss = collapsed;
            }

            // Only gated rows contribute to the prior loss.
            let mut gated = 0.0;
            for b in 0..batch {
                if cond[b] {
                    gated += pred_loss.slice(s![b, ..]).sum();
                }
            }
            let denom = (batch * pred_loss.shape()[1]).max(1) as f32;
            losses.latent_pred = gated / denom * self.cfg.prior_scale;
            losses.neg_q_entropy = out.neg_q_entropy * self.cfg.entropy_scale;
        } else {
            // Continuous bottlenecks train the latent decoder as a
            // reconstruction model instead of a code prior.
            let dense_decoder = self
                .dense_decoder
                .as_ref()
                .expect("continuous bottlenecks build a dense decoder");
            let states = dense_decoder.decode(
                &flatten_inner(targets_c),
                enc,
                enc_bias,
                true,
                mode,
                &mut self.rng,
            )?;
            let inputs_c = unflatten_inner(&states);

            let diff = &inputs_c - targets_c;
            losses.latent_pred = diff.mapv(|d| d * d).mean().unwrap_or(0.0) * 20.0;

            let bn = self
                .bottleneck
                .forward(&inputs_c, mode, step, &mut self.rng)?;

            let ptc = if mode.is_train() {
                1.0 - inverse_lin_decay(200_000, step) * 0.5
            } else {
                1.0
            };
            for b in 0..batch {
                if self.rng.gen::<f32>() >= ptc {
                    latents_dense
                        .slice_mut(s![b, .., .., ..])
                        .assign(&bn.dense.slice(s![b, .., .., ..]));
                }
            }
        }

        Ok(latents_dense)
    }

    /// Predict-mode latent path: reuse the cache or sample fresh codes.
    fn predict_latents(
        &mut self,
        targets_c: &Array4<f32>,
        enc: Option<&Array3<f32>>,
        enc_bias: Option<&Array4<f32>>,
        cache: &mut Option<Cache>,
        batch: usize,
        latent_len: usize,
    ) -> Result<Array4<f32>> {
        if !self.cfg.bottleneck.is_discrete() {
            let dense_decoder = self
                .dense_decoder
                .as_ref()
                .expect("continuous bottlenecks build a dense decoder");
            let states = dense_decoder.decode(
                &flatten_inner(targets_c),
                enc,
                enc_bias,
                true,
                Mode::Predict,
                &mut self.rng,
            )?;
            let inputs_c = unflatten_inner(&states);
            let bn = self
                .bottleneck
                .forward(&inputs_c, Mode::Predict, 0, &mut self.rng)?;
            return Ok(bn.dense);
        }

        if cache.is_none() {
            let Self {
                ref latent_decoder,
                ref bottleneck,
                ref predictor,
                ref sampler,
                ref mut rng,
                ..
            } = *self;

            // The latent decoder itself is deterministic in predict
            // mode; this rng only feeds positive-temperature sampling.
            let mut decode_rng = StdRng::seed_from_u64(rng.gen());

            let mut decode_fn = |dense: &Array4<f32>| -> Result<Array3<f32>> {
                latent_decoder.decode(
                    &flatten_inner(dense),
                    enc,
                    enc_bias,
                    true,
                    Mode::Predict,
                    &mut decode_rng,
                )
            };
            let mut embed_fn = |codes: &Array2<u64>| -> Result<Array4<f32>> {
                let blocks =
                    split_code(codes, bottleneck.code_block_vocab(), bottleneck.code_blocks());
                bottleneck.embed(&blocks)
            };

            let codes = sampler.sample(
                batch,
                latent_len,
                &mut decode_fn,
                &mut embed_fn,
                predictor,
                rng,
            )?;
            *cache = Some(codes);
        }

        let codes = cache.as_ref().expect("cache was just filled");
        if codes.dim() != (batch, latent_len) {
            bail!(
                "cached latent codes of shape {:?} do not match ({}, {})",
                codes.dim(),
                batch,
                latent_len
            );
        }
        let blocks = split_code(
            codes,
            self.bottleneck.code_block_vocab(),
            self.bottleneck.code_blocks(),
        );
        self.bottleneck.embed(&blocks)
    }

    fn decode_targets(
        &mut self,
        targets: &Array4<f32>,
        enc: Option<&Array3<f32>>,
        enc_bias: Option<&Array4<f32>>,
        mode: Mode,
    ) -> Result<Array4<f32>> {
        let states = self.decoder.decode(
            &flatten_inner(targets),
            enc,
            enc_bias,
            self.cfg.causal_decoder,
            mode,
            &mut self.rng,
        )?;
        Ok(unflatten_inner(&states))
    }

    /// Re-encode rows whose mask kept no ground-truth position at all.
    fn refine_rows(
        &mut self,
        res: Array4<f32>,
        mask: &Array3<f32>,
        target_space: usize,
        mode: Mode,
    ) -> Result<Array4<f32>> {
        let needs_refine: Vec<bool> = mask
            .outer_iter()
            .map(|row| row.sum() < 0.1)
            .collect();
        if !needs_refine.iter().any(|&r| r) {
            return Ok(res);
        }

        let refine_encoder = self
            .refine_encoder
            .as_ref()
            .expect("refine_rows is only called when the refine encoder exists");

        let mut x = flatten_inner(&res);
        let space = self.target_space_embedding.row(target_space);
        for mut row in x.outer_iter_mut() {
            for mut pos in row.outer_iter_mut() {
                pos += &space;
            }
        }
        add_timing_signal(&mut x);
        let refined = refine_encoder.forward(&x, None, mode, &mut self.rng)?;
        let refined = unflatten_inner(&refined);

        let mut out = res;
        for (b, &refine) in needs_refine.iter().enumerate() {
            if refine {
                out.slice_mut(s![b, .., .., ..])
                    .assign(&refined.slice(s![b, .., .., ..]));
            }
        }
        Ok(out)
    }
}

#[inline]
fn round_up(value: usize, factor: usize) -> usize {
    value.div_ceil(factor) * factor
}

/// `[batch, len, width, hidden]` → `[batch, len · width, hidden]`.
fn flatten_inner(x: &Array4<f32>) -> Array3<f32> {
    let (b, l, w, h) = x.dim();
    x.as_standard_layout()
        .to_owned()
        .into_shape_with_order((b, l * w, h))
        .expect("contiguous reshape")
}

/// `[batch, len, hidden]` → `[batch, len, 1, hidden]`.
fn unflatten_inner(x: &Array3<f32>) -> Array4<f32> {
    let (b, l, h) = x.dim();
    x.as_standard_layout()
        .to_owned()
        .into_shape_with_order((b, l, 1, h))
        .expect("contiguous reshape")
}

/// Zero-pad the length axis up to `new_len`.
fn pad_length(x: &Array4<f32>, new_len: usize) -> Array4<f32> {
    let (b, l, w, h) = x.dim();
    if new_len <= l {
        return x.clone();
    }
    let mut out = Array4::<f32>::zeros((b, new_len, w, h));
    out.slice_mut(s![.., ..l, .., ..]).assign(x);
    out
}

/// Locally shuffle positions by sorting noisy indices; one permutation
/// shared by the whole batch.
fn shuffle_positions(x: &Array4<f32>, rate: f32, rng: &mut StdRng) -> Array4<f32> {
    let len = x.shape()[1];
    let mut keys: Vec<(f32, usize)> = (0..len)
        .map(|i| (i as f32 + rng.gen::<f32>() * (1.0 + rate), i))
        .collect();
    keys.sort_by(|a, b| a.0.partial_cmp(&b.0).unwrap());

    let mut out = x.clone();
    for (dst, &(_, src)) in keys.iter().enumerate() {
        out.slice_mut(s![.., dst, .., ..])
            .assign(&x.slice(s![.., src, .., ..]));
    }
    out
}

/// Add the first `len` rows of a learned position table.
fn add_position_table(x: &mut Array4<f32>, table: &Array2<f32>) -> Result<()> {
    let (_, len, width, hidden) = x.dim();
    if len > table.shape()[0] {
        bail!(
            "sequence length {} exceeds the position table of {}",
            len,
            table.shape()[0]
        );
    }
    for mut batch_row in x.outer_iter_mut() {
        for l in 0..len {
            for w in 0..width {
                for h in 0..hidden {
                    batch_row[[l, w, h]] += table[[l, h]];
                }
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::BottleneckConfig;

    fn tiny_config() -> AeConfig {
        let _ = env_logger::builder().is_test(true).try_init();
        let mut cfg = AeConfig::small_no_attend();
        cfg.hidden_size = 8;
        cfg.filter_size = 16;
        cfg.compress_filter_size = 16;
        cfg.num_heads = 2;
        cfg.num_hidden_layers = 1;
        cfg.max_length = 64;
        cfg.num_compress_steps = 2;
        cfg.z_size = 4;
        cfg.startup_steps = 100;
        cfg.mask_startup_steps = 200;
        cfg.word_shuffle = 0.0;
        cfg.latent_sample_iters = 2;
        cfg.seed = 42;
        cfg
    }

    fn inputs(batch: usize, len: usize) -> Array3<f32> {
        Array3::from_shape_fn((batch, len, 8), |(b, l, h)| {
            ((b * 31 + l * 7 + h) as f32 * 0.17).sin()
        })
    }

    fn targets(batch: usize, len: usize) -> Array4<f32> {
        Array4::from_shape_fn((batch, len, 1, 8), |(b, l, _, h)| {
            ((b * 13 + l * 5 + h) as f32 * 0.23).cos()
        })
    }

    #[test]
    fn test_train_forward_shapes_and_losses() {
        let mut model = AeTransformer::new(tiny_config()).unwrap();
        let x = inputs(2, 6);
        let t = targets(2, 10);

        let out = model
            .forward(Some(&x), &t, 0, Mode::Train, 1_000, None, 1.0)
            .unwrap();

        assert_eq!(out.output.dim(), (2, 10, 1, 8));
        assert_eq!(out.data_len, 10);
        // 12 padded (2·input_len = 12, divisible by 4), compressed by 4.
        assert_eq!(out.latent_len, 3);
        assert!(out.losses.extra >= 0.0);
        assert!(out.losses.latent_pred >= 0.0);
        assert!(out.losses.total().is_finite());
    }

    #[test]
    fn test_output_truncated_to_original_length() {
        let mut model = AeTransformer::new(tiny_config()).unwrap();
        let x = inputs(1, 5);
        // 7 is not divisible by 4; padding must not leak out.
        let t = targets(1, 7);
        let out = model
            .forward(Some(&x), &t, 0, Mode::Eval, 0, None, 1.0)
            .unwrap();
        assert_eq!(out.output.shape()[1], 7);
    }

    #[test]
    fn test_latent_pred_loss_gated_before_mask_startup() {
        let mut model = AeTransformer::new(tiny_config()).unwrap();
        let x = inputs(1, 4);
        let t = targets(1, 8);

        // Before mask_startup_steps the prior loss is forced to zero.
        let early = model
            .forward(Some(&x), &t, 0, Mode::Train, 10, None, 1.0)
            .unwrap();
        assert_eq!(early.losses.latent_pred, 0.0);

        let late = model
            .forward(Some(&x), &t, 0, Mode::Train, 100_000, None, 1.0)
            .unwrap();
        assert!(late.losses.latent_pred > 0.0);
    }

    #[test]
    fn test_dense_bottleneck_uses_squared_error_and_no_entropy() {
        let mut cfg = tiny_config();
        cfg.bottleneck = BottleneckConfig::Dense;
        let mut model = AeTransformer::new(cfg).unwrap();
        let x = inputs(1, 4);
        let t = targets(1, 8);

        let out = model
            .forward(Some(&x), &t, 0, Mode::Train, 100_000, None, 1.0)
            .unwrap();
        assert_eq!(out.losses.neg_q_entropy, 0.0);
        // The squared-difference loss is scaled by 20 and is strictly
        // positive for a random untrained decoder.
        assert!(out.losses.latent_pred > 0.0);
    }

    #[test]
    fn test_predict_fills_and_reuses_cache() {
        let mut model = AeTransformer::new(tiny_config()).unwrap();
        let x = inputs(1, 4);
        let t = targets(1, 8);

        let first = model
            .forward(Some(&x), &t, 0, Mode::Predict, 0, None, 1.0)
            .unwrap();
        let cache = first.cache.expect("predict pass must fill the cache");
        assert_eq!(cache.dim(), (1, first.latent_len));

        let second = model
            .forward(Some(&x), &t, 0, Mode::Predict, 0, Some(cache.clone()), 0.0)
            .unwrap();
        assert_eq!(second.cache.as_ref().unwrap(), &cache);
        assert_eq!(second.output.dim(), (1, 8, 1, 8));
    }

    #[test]
    fn test_predict_mask_changes_decoding_not_cache() {
        let mut model = AeTransformer::new(tiny_config()).unwrap();
        let x = inputs(1, 4);
        let t = targets(1, 8);

        let first = model
            .forward(Some(&x), &t, 0, Mode::Predict, 0, None, 1.0)
            .unwrap();
        let cache = first.cache.unwrap();

        let gt = model
            .forward(Some(&x), &t, 0, Mode::Predict, 0, Some(cache.clone()), 1.0)
            .unwrap();
        let recon = model
            .forward(Some(&x), &t, 0, Mode::Predict, 0, Some(cache), 0.0)
            .unwrap();

        let mut differs = false;
        for (a, b) in gt.output.iter().zip(recon.output.iter()) {
            if (a - b).abs() > 1e-6 {
                differs = true;
                break;
            }
        }
        assert!(differs, "blend weight should steer the decoder input");
    }

    #[test]
    fn test_infer_output_shape() {
        let mut model = AeTransformer::new(tiny_config()).unwrap();
        let x = inputs(1, 4);
        let out = model.infer(&x, 0).unwrap();
        assert_eq!(out.output.dim(), (1, 8, 1, 8));
        assert!(out.cache.is_some());
    }

    #[test]
    fn test_no_ae_path_plain_decoding() {
        let mut cfg = tiny_config();
        cfg.do_ae = false;
        let mut model = AeTransformer::new(cfg).unwrap();
        let x = inputs(1, 4);
        let t = targets(1, 6);

        let out = model
            .forward(Some(&x), &t, 0, Mode::Eval, 0, None, 1.0)
            .unwrap();
        assert_eq!(out.output.dim(), (1, 6, 1, 8));
        assert_eq!(out.latent_len, 0);
        assert_eq!(out.losses, Losses::default());
    }

    #[test]
    fn test_unconditional_forward() {
        let mut model = AeTransformer::new(tiny_config()).unwrap();
        let t = targets(2, 8);
        let out = model
            .forward(None, &t, 0, Mode::Train, 1_000, None, 1.0)
            .unwrap();
        assert_eq!(out.output.dim(), (2, 8, 1, 8));
        assert_eq!(out.latent_len, 2);
    }

    #[test]
    fn test_summary_only_when_enabled() {
        let mut cfg = tiny_config();
        cfg.summarize = true;
        let mut model = AeTransformer::new(cfg).unwrap();
        let x = inputs(1, 4);
        let t = targets(1, 8);
        let out = model
            .forward(Some(&x), &t, 0, Mode::Train, 1_000, None, 1.0)
            .unwrap();
        assert!(out.summary.get("latent_pred_loss_mean").is_some());

        let mut model = AeTransformer::new(tiny_config()).unwrap();
        let out = model
            .forward(Some(&x), &t, 0, Mode::Train, 1_000, None, 1.0)
            .unwrap();
        assert!(out.summary.get("latent_pred_loss_mean").is_none());
    }

    #[test]
    fn test_invalid_target_space_rejected() {
        let mut model = AeTransformer::new(tiny_config()).unwrap();
        let x = inputs(1, 4);
        let t = targets(1, 8);
        assert!(model
            .forward(Some(&x), &t, 999, Mode::Eval, 0, None, 1.0)
            .is_err());
    }

    #[test]
    fn test_stale_cache_shape_rejected() {
        let mut model = AeTransformer::new(tiny_config()).unwrap();
        let x = inputs(1, 4);
        let t = targets(1, 8);
        let bad_cache = Array2::<u64>::zeros((1, 17));
        assert!(model
            .forward(Some(&x), &t, 0, Mode::Predict, 0, Some(bad_cache), 1.0)
            .is_err());
    }

    #[test]
    fn test_nats_and_bits_per_dim() {
        let (nats, bits) = nats_and_bits_per_dim(100, 25, 2.0, 4.0);
        assert!((nats - 3.0).abs() < 1e-6);
        assert!((bits - 3.0 / std::f32::consts::LN_2).abs() < 1e-6);
    }
}
