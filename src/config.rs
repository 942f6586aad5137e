//! Run configuration for the autoencoder transformer.
//!
//! A configuration is built once per run from a preset, optionally
//! adjusted through the `with_*` methods (each returns a new value),
//! validated eagerly with [`AeConfig::validate`], and never mutated
//! afterwards. Every component of one forward pass reads the same
//! configuration.

use std::fmt;
use std::str::FromStr;

use anyhow::{bail, Result};
use serde::{Deserialize, Serialize};

/// Execution mode of a forward pass.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Mode {
    Train,
    Eval,
    Predict,
}

impl Mode {
    #[inline]
    pub fn is_train(self) -> bool {
        self == Mode::Train
    }

    #[inline]
    pub fn is_predict(self) -> bool {
        self == Mode::Predict
    }
}

/// How the quantizer splits a hidden vector into blocks.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReshapeMethod {
    /// Slice the hidden dimension into contiguous blocks.
    Slice,
    /// Project the full hidden vector into each block with a learned matrix.
    Project,
}

impl FromStr for ReshapeMethod {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "slice" => Ok(ReshapeMethod::Slice),
            "project" => Ok(ReshapeMethod::Project),
            other => bail!("unknown reshape method: {}", other),
        }
    }
}

impl fmt::Display for ReshapeMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ReshapeMethod::Slice => write!(f, "slice"),
            ReshapeMethod::Project => write!(f, "project"),
        }
    }
}

/// The discretization strategy and its parameters, resolved once at
/// configuration-build time.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "kebab-case")]
pub enum BottleneckConfig {
    /// Continuous passthrough, no discrete code.
    Dense,
    /// Gaussian variational bottleneck with a KL penalty.
    Vae { noise_dev: f32 },
    /// Locality-sensitive hashing into binary codes.
    Semhash { noise_dev: f32, discrete_mix: f32 },
    /// Gumbel-softmax relaxation over the full latent vocabulary.
    GumbelSoftmax {
        hard: bool,
        temperature_warmup_steps: u64,
    },
    /// Vector quantization with a learned codebook.
    Dvq {
        num_blocks: usize,
        num_residuals: usize,
        reshape_method: ReshapeMethod,
        /// Commitment loss weight.
        beta: f32,
        /// EMA smoothing factor for codebook updates.
        decay: f32,
        /// Laplace smoothing of EMA counts.
        epsilon: f32,
        ema: bool,
        /// Sample the code among the `k` nearest candidates (1 = nearest).
        random_top_k: usize,
        soft_em: bool,
        num_samples: usize,
    },
}

impl BottleneckConfig {
    /// Default vector-quantization setup shared by the presets.
    pub fn dvq() -> Self {
        BottleneckConfig::Dvq {
            num_blocks: 1,
            num_residuals: 1,
            reshape_method: ReshapeMethod::Slice,
            beta: 0.25,
            decay: 0.999,
            epsilon: 1e-5,
            ema: true,
            random_top_k: 1,
            soft_em: false,
            num_samples: 10,
        }
    }

    /// Whether the strategy produces a discrete code that a latent
    /// predictor can be trained against.
    pub fn is_discrete(&self) -> bool {
        !matches!(
            self,
            BottleneckConfig::Dense | BottleneckConfig::Vae { .. }
        )
    }
}

/// Configuration consumed by every component of the model.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct AeConfig {
    // Model sizes.
    pub hidden_size: usize,
    pub filter_size: usize,
    pub compress_filter_size: usize,
    pub num_heads: usize,
    pub num_hidden_layers: usize,
    /// 0 means "same as num_hidden_layers".
    pub num_decoder_layers: usize,
    pub max_length: usize,
    pub target_space_vocab: usize,

    // Dropout rates.
    pub dropout: f32,
    pub attention_dropout: f32,
    pub relu_dropout: f32,
    pub layer_prepostprocess_dropout: f32,

    // Autoencoder toggles.
    pub do_ae: bool,
    pub do_mask: bool,
    pub do_refine: bool,
    pub use_predict_mask: bool,
    pub do_attend_compress: bool,
    pub do_attend_decompress: bool,
    pub do_residual_compress: bool,
    pub num_compress_steps: usize,
    pub is_2d: bool,
    pub causal_decoder: bool,

    // Latent code.
    /// The latent vocabulary is `2^z_size`.
    pub z_size: u32,
    pub num_decode_blocks: usize,
    pub sampling_temp: f32,
    pub logit_normalization: bool,
    pub sum_over_latents: bool,
    pub prior_scale: f32,
    pub entropy_scale: f32,
    pub latent_sample_iters: usize,

    // Schedules and input noise.
    pub startup_steps: u64,
    pub mask_startup_steps: u64,
    pub unmasked_percentage: f32,
    pub word_dropout: f32,
    pub word_shuffle: f32,

    pub bottleneck: BottleneckConfig,

    /// Record scalar statistics into the per-forward summary.
    pub summarize: bool,
    /// Seed for parameter initialization and stochastic draws.
    pub seed: u64,
}

impl AeConfig {
    /// Small research configuration (the semhash baseline).
    pub fn small() -> Self {
        Self {
            hidden_size: 384,
            filter_size: 2048,
            compress_filter_size: 2048 * 2,
            num_heads: 8,
            num_hidden_layers: 3,
            num_decoder_layers: 0,
            max_length: 256,
            target_space_vocab: 32,
            dropout: 0.1,
            attention_dropout: 0.1,
            relu_dropout: 0.1,
            layer_prepostprocess_dropout: 0.1,
            do_ae: true,
            do_mask: true,
            do_refine: false,
            use_predict_mask: true,
            do_attend_compress: false,
            do_attend_decompress: true,
            do_residual_compress: false,
            num_compress_steps: 3,
            is_2d: false,
            causal_decoder: true,
            z_size: 14,
            num_decode_blocks: 1,
            sampling_temp: 0.0,
            logit_normalization: true,
            sum_over_latents: false,
            prior_scale: 1.0,
            entropy_scale: 0.0,
            latent_sample_iters: 16,
            startup_steps: 10_000,
            mask_startup_steps: 50_000,
            unmasked_percentage: 0.1,
            word_dropout: 0.0,
            word_shuffle: 0.5,
            bottleneck: BottleneckConfig::Semhash {
                noise_dev: 0.5,
                discrete_mix: 0.5,
            },
            summarize: false,
            seed: 0,
        }
    }

    /// Base configuration: wider and deeper than [`AeConfig::small`].
    pub fn base() -> Self {
        Self {
            hidden_size: 512,
            filter_size: 4096,
            num_hidden_layers: 6,
            ..Self::small()
        }
    }

    /// Base configuration with vector quantization and no decompressor
    /// attention.
    pub fn base_no_attend() -> Self {
        Self {
            z_size: 12,
            bottleneck: BottleneckConfig::dvq(),
            do_attend_decompress: false,
            ..Self::base()
        }
    }

    /// Small configuration with vector quantization and no decompressor
    /// attention.
    pub fn small_no_attend() -> Self {
        Self {
            hidden_size: 512,
            z_size: 12,
            bottleneck: BottleneckConfig::dvq(),
            do_attend_decompress: false,
            ..Self::small()
        }
    }

    /// Ablation: soft expectation-maximization assignments.
    pub fn base_ablation_1() -> Self {
        let mut cfg = Self::base_no_attend();
        if let BottleneckConfig::Dvq { ref mut soft_em, .. } = cfg.bottleneck {
            *soft_em = true;
        }
        cfg
    }

    /// Ablation: soft EM plus an entropy bonus.
    pub fn base_ablation_2() -> Self {
        Self {
            entropy_scale: 0.1,
            ..Self::base_ablation_1()
        }
    }

    /// Ablation: reduced prior weight.
    pub fn base_ablation_3() -> Self {
        Self {
            prior_scale: 0.1,
            ..Self::base_ablation_2()
        }
    }

    /// Ablation: hard Gumbel-softmax discretization.
    pub fn base_ablation_4() -> Self {
        Self {
            entropy_scale: 0.0,
            prior_scale: 1.0,
            bottleneck: BottleneckConfig::GumbelSoftmax {
                hard: true,
                temperature_warmup_steps: 150_000,
            },
            ..Self::base_ablation_3()
        }
    }

    /// Ablation: soft Gumbel-softmax discretization.
    pub fn base_ablation_5() -> Self {
        let mut cfg = Self::base_ablation_4();
        if let BottleneckConfig::GumbelSoftmax { ref mut hard, .. } = cfg.bottleneck {
            *hard = false;
        }
        cfg
    }

    /// Two-dimensional variant for image-shaped targets.
    pub fn image_2d() -> Self {
        Self {
            filter_size: 512,
            hidden_size: 512,
            num_hidden_layers: 6,
            is_2d: true,
            dropout: 0.0,
            attention_dropout: 0.0,
            relu_dropout: 0.0,
            layer_prepostprocess_dropout: 0.0,
            do_attend_compress: false,
            do_attend_decompress: false,
            bottleneck: BottleneckConfig::dvq(),
            ..Self::small()
        }
    }

    // Builder-style overrides; each returns a new value.

    pub fn with_bottleneck(mut self, bottleneck: BottleneckConfig) -> Self {
        self.bottleneck = bottleneck;
        self
    }

    pub fn with_compress_steps(mut self, steps: usize) -> Self {
        self.num_compress_steps = steps;
        self
    }

    pub fn with_z_size(mut self, z_size: u32) -> Self {
        self.z_size = z_size;
        self
    }

    pub fn with_decode_blocks(mut self, blocks: usize) -> Self {
        self.num_decode_blocks = blocks;
        self
    }

    pub fn with_sampling_temp(mut self, temp: f32) -> Self {
        self.sampling_temp = temp;
        self
    }

    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = seed;
        self
    }

    pub fn with_summarize(mut self, summarize: bool) -> Self {
        self.summarize = summarize;
        self
    }

    /// Size of the full latent vocabulary, `2^z_size`.
    #[inline]
    pub fn latent_vocab_size(&self) -> usize {
        1usize << self.z_size
    }

    /// Vocabulary of one decode block in the mixed-radix factorization.
    #[inline]
    pub fn decode_block_vocab(&self) -> usize {
        1usize << (self.z_size as usize / self.num_decode_blocks)
    }

    /// Effective decoder depth.
    #[inline]
    pub fn decoder_layers(&self) -> usize {
        if self.num_decoder_layers == 0 {
            self.num_hidden_layers
        } else {
            self.num_decoder_layers
        }
    }

    /// Length-divisibility factor imposed by compression.
    #[inline]
    pub fn compress_factor(&self) -> usize {
        1usize << self.num_compress_steps
    }

    /// Check every precondition eagerly, before any computation.
    pub fn validate(&self) -> Result<()> {
        if self.hidden_size == 0 || self.max_length == 0 {
            bail!("hidden_size and max_length must be positive");
        }
        if self.hidden_size % self.num_heads != 0 {
            bail!(
                "hidden_size {} not divisible by num_heads {}",
                self.hidden_size,
                self.num_heads
            );
        }
        if self.num_compress_steps == 0 {
            bail!("num_compress_steps must be at least 1");
        }
        if self.num_decode_blocks == 0 {
            bail!("num_decode_blocks must be at least 1");
        }
        if self.z_size as usize % self.num_decode_blocks != 0 {
            bail!(
                "latent vocabulary bits ({}) not divisible by num_decode_blocks ({})",
                self.z_size,
                self.num_decode_blocks
            );
        }
        for (name, rate) in [
            ("dropout", self.dropout),
            ("attention_dropout", self.attention_dropout),
            ("relu_dropout", self.relu_dropout),
            ("layer_prepostprocess_dropout", self.layer_prepostprocess_dropout),
            ("unmasked_percentage", self.unmasked_percentage),
            ("word_dropout", self.word_dropout),
        ] {
            if !(0.0..=1.0).contains(&rate) {
                bail!("{} must lie in [0, 1], got {}", name, rate);
            }
        }
        if let BottleneckConfig::Dvq {
            num_blocks,
            num_residuals,
            decay,
            random_top_k,
            ..
        } = self.bottleneck
        {
            if num_blocks == 0 || num_residuals == 0 {
                bail!("dvq num_blocks and num_residuals must be at least 1");
            }
            if self.z_size as usize % num_residuals != 0 {
                bail!(
                    "latent vocabulary bits ({}) not divisible by num_residuals ({})",
                    self.z_size,
                    num_residuals
                );
            }
            let bits_per_residual = self.z_size as usize / num_residuals;
            if bits_per_residual % num_blocks != 0 {
                bail!(
                    "per-residual bits ({}) not divisible by num_blocks ({})",
                    bits_per_residual,
                    num_blocks
                );
            }
            if self.hidden_size % num_blocks != 0 {
                bail!(
                    "hidden_size {} not divisible by dvq num_blocks {}",
                    self.hidden_size,
                    num_blocks
                );
            }
            if !(0.0..1.0).contains(&decay) {
                bail!("dvq decay must lie in [0, 1), got {}", decay);
            }
            if random_top_k == 0 {
                bail!("dvq random_top_k must be at least 1");
            }
        }
        Ok(())
    }
}

impl Default for AeConfig {
    fn default() -> Self {
        Self::small()
    }
}
