//! Transformer encoder and decoder stacks.
//!
//! Layers follow the pre-norm residual scheme: each sublayer reads a
//! layer-normalized input and its output is dropout-regularized and
//! added back to the residual stream. A final normalization closes the
//! stack.

use anyhow::Result;
use ndarray::{Array3, Array4};
use rand::rngs::StdRng;

use crate::attention::MultiHeadAttention;
use crate::config::{AeConfig, Mode};
use crate::feedforward::FeedForward;
use crate::normalization::LayerNorm;
use crate::utils::ops::{add_timing_signal, dropout_3d, shift_right_3d};

struct EncoderLayer {
    self_attn_norm: LayerNorm,
    self_attn: MultiHeadAttention,
    ffn_norm: LayerNorm,
    ffn: FeedForward,
}

impl EncoderLayer {
    fn new(cfg: &AeConfig, rng: &mut StdRng) -> Self {
        Self {
            self_attn_norm: LayerNorm::new(cfg.hidden_size),
            self_attn: MultiHeadAttention::new(cfg.hidden_size, cfg.num_heads, rng),
            ffn_norm: LayerNorm::new(cfg.hidden_size),
            ffn: FeedForward::new(cfg.hidden_size, cfg.filter_size, rng),
        }
    }
}

struct DecoderLayer {
    self_attn_norm: LayerNorm,
    self_attn: MultiHeadAttention,
    cross_attn_norm: LayerNorm,
    cross_attn: MultiHeadAttention,
    ffn_norm: LayerNorm,
    ffn: FeedForward,
}

impl DecoderLayer {
    fn new(cfg: &AeConfig, rng: &mut StdRng) -> Self {
        Self {
            self_attn_norm: LayerNorm::new(cfg.hidden_size),
            self_attn: MultiHeadAttention::new(cfg.hidden_size, cfg.num_heads, rng),
            cross_attn_norm: LayerNorm::new(cfg.hidden_size),
            cross_attn: MultiHeadAttention::new(cfg.hidden_size, cfg.num_heads, rng),
            ffn_norm: LayerNorm::new(cfg.hidden_size),
            ffn: FeedForward::new(cfg.hidden_size, cfg.filter_size, rng),
        }
    }
}

/// Self-attention encoder stack.
pub struct TransformerEncoder {
    layers: Vec<EncoderLayer>,
    final_norm: LayerNorm,
    attention_dropout: f32,
    relu_dropout: f32,
    residual_dropout: f32,
}

impl TransformerEncoder {
    pub fn new(cfg: &AeConfig, rng: &mut StdRng) -> Self {
        let layers = (0..cfg.num_hidden_layers)
            .map(|_| EncoderLayer::new(cfg, rng))
            .collect();
        Self {
            layers,
            final_norm: LayerNorm::new(cfg.hidden_size),
            attention_dropout: cfg.attention_dropout,
            relu_dropout: cfg.relu_dropout,
            residual_dropout: cfg.layer_prepostprocess_dropout,
        }
    }

    pub fn forward(
        &self,
        x: &Array3<f32>,
        bias: Option<&Array4<f32>>,
        mode: Mode,
        rng: &mut StdRng,
    ) -> Result<Array3<f32>> {
        let train = mode.is_train();
        let mut x = x.clone();

        for layer in &self.layers {
            let normed = layer.self_attn_norm.forward_3d(&x);
            let mut y = layer.self_attn.forward(
                &normed,
                None,
                bias,
                false,
                if train { self.attention_dropout } else { 0.0 },
                if train { Some(&mut *rng) } else { None },
            )?;
            if train {
                dropout_3d(&mut y, self.residual_dropout, rng);
            }
            x = x + y;

            let normed = layer.ffn_norm.forward_3d(&x);
            let mut y = layer.ffn.forward(
                &normed,
                if train { self.relu_dropout } else { 0.0 },
                if train { Some(&mut *rng) } else { None },
            );
            if train {
                dropout_3d(&mut y, self.residual_dropout, rng);
            }
            x = x + y;
        }

        Ok(self.final_norm.forward_3d(&x))
    }
}

/// Decoder stack with cross-attention into an encoder memory.
pub struct TransformerDecoder {
    layers: Vec<DecoderLayer>,
    final_norm: LayerNorm,
    attention_dropout: f32,
    relu_dropout: f32,
    residual_dropout: f32,
}

impl TransformerDecoder {
    pub fn new(cfg: &AeConfig, rng: &mut StdRng) -> Self {
        let layers = (0..cfg.decoder_layers())
            .map(|_| DecoderLayer::new(cfg, rng))
            .collect();
        Self {
            layers,
            final_norm: LayerNorm::new(cfg.hidden_size),
            attention_dropout: cfg.attention_dropout,
            relu_dropout: cfg.relu_dropout,
            residual_dropout: cfg.layer_prepostprocess_dropout,
        }
    }

    /// Run the decoder stack on already-prepared inputs.
    pub fn forward(
        &self,
        x: &Array3<f32>,
        encoder_output: Option<&Array3<f32>>,
        encoder_bias: Option<&Array4<f32>>,
        causal: bool,
        mode: Mode,
        rng: &mut StdRng,
    ) -> Result<Array3<f32>> {
        let train = mode.is_train();
        let mut x = x.clone();

        for layer in &self.layers {
            let normed = layer.self_attn_norm.forward_3d(&x);
            let mut y = layer.self_attn.forward(
                &normed,
                None,
                None,
                causal,
                if train { self.attention_dropout } else { 0.0 },
                if train { Some(&mut *rng) } else { None },
            )?;
            if train {
                dropout_3d(&mut y, self.residual_dropout, rng);
            }
            x = x + y;

            if let Some(memory) = encoder_output {
                let normed = layer.cross_attn_norm.forward_3d(&x);
                let mut y = layer.cross_attn.forward(
                    &normed,
                    Some(memory),
                    encoder_bias,
                    false,
                    if train { self.attention_dropout } else { 0.0 },
                    if train { Some(&mut *rng) } else { None },
                )?;
                if train {
                    dropout_3d(&mut y, self.residual_dropout, rng);
                }
                x = x + y;
            }

            let normed = layer.ffn_norm.forward_3d(&x);
            let mut y = layer.ffn.forward(
                &normed,
                if train { self.relu_dropout } else { 0.0 },
                if train { Some(&mut *rng) } else { None },
            );
            if train {
                dropout_3d(&mut y, self.residual_dropout, rng);
            }
            x = x + y;
        }

        Ok(self.final_norm.forward_3d(&x))
    }

    /// Shift targets right, add the position signal and decode.
    ///
    /// With `causal` false the decoder sees the whole target sequence at
    /// once, which is how latent codes are refined non-causally.
    pub fn decode(
        &self,
        targets: &Array3<f32>,
        encoder_output: Option<&Array3<f32>>,
        encoder_bias: Option<&Array4<f32>>,
        causal: bool,
        mode: Mode,
        rng: &mut StdRng,
    ) -> Result<Array3<f32>> {
        let mut decoder_input = shift_right_3d(targets);
        add_timing_signal(&mut decoder_input);
        if mode.is_train() {
            dropout_3d(&mut decoder_input, self.residual_dropout, rng);
        }
        self.forward(&decoder_input, encoder_output, encoder_bias, causal, mode, rng)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;

    fn tiny_config() -> AeConfig {
        let mut cfg = AeConfig::small();
        cfg.hidden_size = 16;
        cfg.filter_size = 32;
        cfg.num_heads = 2;
        cfg.num_hidden_layers = 2;
        cfg
    }

    #[test]
    fn test_encoder_shape() {
        let cfg = tiny_config();
        let mut rng = StdRng::seed_from_u64(0);
        let enc = TransformerEncoder::new(&cfg, &mut rng);
        let x = Array3::<f32>::ones((2, 6, 16));
        let y = enc.forward(&x, None, Mode::Eval, &mut rng).unwrap();
        assert_eq!(y.dim(), (2, 6, 16));
    }

    #[test]
    fn test_decoder_shape_with_memory() {
        let cfg = tiny_config();
        let mut rng = StdRng::seed_from_u64(1);
        let dec = TransformerDecoder::new(&cfg, &mut rng);
        let targets = Array3::<f32>::ones((2, 4, 16));
        let memory = Array3::<f32>::ones((2, 6, 16));
        let y = dec
            .decode(&targets, Some(&memory), None, true, Mode::Eval, &mut rng)
            .unwrap();
        assert_eq!(y.dim(), (2, 4, 16));
    }

    #[test]
    fn test_causal_decode_ignores_future_targets() {
        let cfg = tiny_config();
        let mut rng = StdRng::seed_from_u64(2);
        let dec = TransformerDecoder::new(&cfg, &mut rng);

        let a = Array3::<f32>::from_elem((1, 5, 16), 0.3);
        let mut b = a.clone();
        // Lands at decoder-input position 4 after the right shift.
        b[[0, 3, 0]] = 9.0;

        let ya = dec.decode(&a, None, None, true, Mode::Eval, &mut rng).unwrap();
        let yb = dec.decode(&b, None, None, true, Mode::Eval, &mut rng).unwrap();

        // Position 1 reads only shifted targets 0..=0, so it must agree.
        for h in 0..16 {
            assert!((ya[[0, 1, h]] - yb[[0, 1, h]]).abs() < 1e-5);
        }
    }

    #[test]
    fn test_noncausal_decode_sees_whole_sequence() {
        let cfg = tiny_config();
        let mut rng = StdRng::seed_from_u64(3);
        let dec = TransformerDecoder::new(&cfg, &mut rng);

        let a = Array3::<f32>::from_elem((1, 5, 16), 0.3);
        let mut b = a.clone();
        b[[0, 3, 0]] = 9.0;

        let ya = dec.decode(&a, None, None, false, Mode::Eval, &mut rng).unwrap();
        let yb = dec.decode(&b, None, None, false, Mode::Eval, &mut rng).unwrap();

        let mut differs = false;
        for h in 0..16 {
            if (ya[[0, 1, h]] - yb[[0, 1, h]]).abs() > 1e-6 {
                differs = true;
            }
        }
        assert!(differs, "non-causal decoding should propagate future edits");
    }
}
