//! Convolutional compression and decompression of target sequences.
//!
//! The compressor halves the length axis once per step through strided
//! convolutions; the decompressor inverts each step with a
//! channel-expanding convolution followed by depth-to-space (2-D) or a
//! reshape-based length doubling (1-D).

use anyhow::Result;
use ndarray::{Array3, Array4};
use rand::rngs::StdRng;

use crate::attention::MultiHeadAttention;
use crate::config::{AeConfig, Mode};
use crate::conv::{depth_to_space, ConvBlock, Padding};
use crate::normalization::LayerNorm;
use crate::utils::ops::{add_timing_signal, dropout_3d, dropout_4d};

/// A stack of convolution blocks with residual connections.
pub struct ResidualConv {
    repeats: Vec<(LayerNorm, ConvBlock)>,
    dropout: f32,
}

impl ResidualConv {
    pub fn new(repeat: usize, kernel: (usize, usize), cfg: &AeConfig, rng: &mut StdRng) -> Self {
        let h = cfg.hidden_size;
        let repeats = (0..repeat)
            .map(|_| {
                let norm = LayerNorm::new(h);
                let block = ConvBlock::new(
                    &[(kernel, h, h), (kernel, h, h), (kernel, h, h)],
                    true,
                    rng,
                );
                (norm, block)
            })
            .collect();
        Self {
            repeats,
            dropout: cfg.dropout,
        }
    }

    pub fn forward(&self, x: &Array4<f32>, mode: Mode, rng: &mut StdRng) -> Array4<f32> {
        let mut x = x.clone();
        for (norm, block) in &self.repeats {
            let mut y = block.forward(&norm.forward_4d(&x), (1, 1), Padding::Same);
            if mode.is_train() {
                dropout_4d(&mut y, self.dropout, rng);
            }
            x = x + y;
        }
        x
    }
}

/// Attention from a compressed stream into the encoder output.
pub struct AttendLayer {
    norm: LayerNorm,
    attention: MultiHeadAttention,
    attention_dropout: f32,
    residual_dropout: f32,
}

impl AttendLayer {
    pub fn new(cfg: &AeConfig, rng: &mut StdRng) -> Self {
        Self {
            norm: LayerNorm::new(cfg.hidden_size),
            attention: MultiHeadAttention::new(cfg.hidden_size, cfg.num_heads, rng),
            attention_dropout: cfg.attention_dropout,
            residual_dropout: cfg.layer_prepostprocess_dropout,
        }
    }

    /// Flattens `[batch, len, width, hidden]` to a sequence, attends to
    /// `source` (with a fresh timing signal) and restores the shape.
    pub fn forward(
        &self,
        x: &Array4<f32>,
        source: &Array3<f32>,
        mode: Mode,
        rng: &mut StdRng,
    ) -> Result<Array4<f32>> {
        let (b, l, w, h) = x.dim();
        let flat = x
            .as_standard_layout()
            .to_owned()
            .into_shape_with_order((b, l * w, h))?;

        let mut source = source.clone();
        add_timing_signal(&mut source);

        let train = mode.is_train();
        let mut y = self.attention.forward(
            &self.norm.forward_3d(&flat),
            Some(&source),
            None,
            false,
            if train { self.attention_dropout } else { 0.0 },
            if train { Some(&mut *rng) } else { None },
        )?;
        if train {
            dropout_3d(&mut y, self.residual_dropout, rng);
        }
        let res = flat + y;
        Ok(res.into_shape_with_order((b, l, w, h))?)
    }
}

/// Downsamples targets by `2^num_compress_steps` along the length axis.
pub struct Compressor {
    pre_residual: ResidualConv,
    attend: Option<AttendLayer>,
    step_residuals: Vec<ResidualConv>,
    step_convs: Vec<ConvBlock>,
    stride: (usize, usize),
}

impl Compressor {
    pub fn new(cfg: &AeConfig, rng: &mut StdRng) -> Self {
        let h = cfg.hidden_size;
        let k1 = if cfg.is_2d { (3, 3) } else { (3, 1) };
        let k2 = if cfg.is_2d { (2, 2) } else { (2, 1) };

        let pre_residual = ResidualConv::new(cfg.num_compress_steps, k1, cfg, rng);
        let attend = cfg.do_attend_compress.then(|| AttendLayer::new(cfg, rng));

        let mut step_residuals = Vec::new();
        let mut step_convs = Vec::with_capacity(cfg.num_compress_steps);
        for _ in 0..cfg.num_compress_steps {
            if cfg.do_residual_compress {
                step_residuals.push(ResidualConv::new(cfg.num_compress_steps, k1, cfg, rng));
            }
            step_convs.push(ConvBlock::new(&[(k2, h, h)], true, rng));
        }

        Self {
            pre_residual,
            attend,
            step_residuals,
            step_convs,
            stride: k2,
        }
    }

    pub fn forward(
        &self,
        x: &Array4<f32>,
        conditioning: Option<&Array3<f32>>,
        mode: Mode,
        rng: &mut StdRng,
    ) -> Result<Array4<f32>> {
        let mut cur = self.pre_residual.forward(x, mode, rng);

        if let (Some(attend), Some(source)) = (&self.attend, conditioning) {
            cur = attend.forward(&cur, source, mode, rng)?;
        }

        for (i, conv) in self.step_convs.iter().enumerate() {
            if let Some(residual) = self.step_residuals.get(i) {
                cur = residual.forward(&cur, mode, rng);
            }
            cur = conv.forward(&cur, self.stride, Padding::Same);
        }
        Ok(cur)
    }
}

/// One inverse compression stage.
struct DecompressStage {
    residual: ResidualConv,
    attend: Option<AttendLayer>,
    conv: ConvBlock,
    is_2d: bool,
}

impl DecompressStage {
    fn forward(
        &self,
        d: &Array4<f32>,
        conditioning: Option<&Array3<f32>>,
        mode: Mode,
        rng: &mut StdRng,
    ) -> Result<Array4<f32>> {
        let mut d = self.residual.forward(d, mode, rng);
        if let (Some(attend), Some(source)) = (&self.attend, conditioning) {
            d = attend.forward(&d, source, mode, rng)?;
        }

        let thicker = self.conv.forward(&d, (1, 1), Padding::Same);
        if self.is_2d {
            Ok(depth_to_space(&thicker))
        } else {
            // [batch, len, 1, 2h] reads out as [batch, 2·len, 1, h] in
            // row-major order.
            let (b, l, _w, c2) = thicker.dim();
            Ok(thicker
                .as_standard_layout()
                .to_owned()
                .into_shape_with_order((b, l * 2, 1, c2 / 2))?)
        }
    }
}

/// Upsamples a dense latent back to full target resolution.
pub struct Decompressor {
    stages: Vec<DecompressStage>,
}

impl Decompressor {
    pub fn new(cfg: &AeConfig, rng: &mut StdRng) -> Self {
        let h = cfg.hidden_size;
        let multiplier = if cfg.is_2d { 4 } else { 2 };
        let stages = (0..cfg.num_compress_steps)
            .map(|i| DecompressStage {
                residual: ResidualConv::new(1, (3, 1), cfg, rng),
                attend: cfg.do_attend_decompress.then(|| AttendLayer::new(cfg, rng)),
                conv: ConvBlock::new(&[((1, 1), h, h * multiplier)], i > 0, rng),
                is_2d: cfg.is_2d,
            })
            .collect();
        Self { stages }
    }

    pub fn forward(
        &self,
        d: &Array4<f32>,
        conditioning: Option<&Array3<f32>>,
        mode: Mode,
        rng: &mut StdRng,
    ) -> Result<Array4<f32>> {
        let mut d = d.clone();
        for stage in &self.stages {
            d = stage.forward(&d, conditioning, mode, rng)?;
        }
        Ok(d)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;

    fn tiny_config() -> AeConfig {
        let mut cfg = AeConfig::small();
        cfg.hidden_size = 8;
        cfg.filter_size = 16;
        cfg.num_heads = 2;
        cfg.num_compress_steps = 2;
        cfg.do_attend_compress = false;
        cfg.do_attend_decompress = false;
        cfg
    }

    #[test]
    fn test_compress_halves_length_per_step() {
        let cfg = tiny_config();
        let mut rng = StdRng::seed_from_u64(0);
        let compressor = Compressor::new(&cfg, &mut rng);

        let x = Array4::<f32>::ones((2, 16, 1, 8));
        let y = compressor.forward(&x, None, Mode::Eval, &mut rng).unwrap();
        assert_eq!(y.dim(), (2, 4, 1, 8));
    }

    #[test]
    fn test_compress_then_decompress_round_trips_length() {
        let cfg = tiny_config();
        let mut rng = StdRng::seed_from_u64(1);
        let compressor = Compressor::new(&cfg, &mut rng);
        let decompressor = Decompressor::new(&cfg, &mut rng);

        for len in [8usize, 16, 32] {
            let x = Array4::<f32>::ones((1, len, 1, 8));
            let compressed = compressor.forward(&x, None, Mode::Eval, &mut rng).unwrap();
            assert_eq!(compressed.shape()[1], len / 4);
            let restored = decompressor
                .forward(&compressed, None, Mode::Eval, &mut rng)
                .unwrap();
            assert_eq!(restored.dim(), (1, len, 1, 8));
        }
    }

    #[test]
    fn test_compress_with_attention_to_encoder() {
        let mut cfg = tiny_config();
        cfg.do_attend_compress = true;
        let mut rng = StdRng::seed_from_u64(2);
        let compressor = Compressor::new(&cfg, &mut rng);

        let x = Array4::<f32>::ones((1, 8, 1, 8));
        let enc = Array3::<f32>::ones((1, 5, 8));
        let y = compressor
            .forward(&x, Some(&enc), Mode::Eval, &mut rng)
            .unwrap();
        assert_eq!(y.dim(), (1, 2, 1, 8));
    }

    #[test]
    fn test_decompress_2d_mode_doubles_both_axes() {
        let mut cfg = tiny_config();
        cfg.is_2d = true;
        cfg.num_compress_steps = 1;
        let mut rng = StdRng::seed_from_u64(3);
        let decompressor = Decompressor::new(&cfg, &mut rng);

        let d = Array4::<f32>::ones((1, 3, 2, 8));
        let y = decompressor.forward(&d, None, Mode::Eval, &mut rng).unwrap();
        assert_eq!(y.dim(), (1, 6, 4, 8));
    }

    #[test]
    fn test_residual_conv_keeps_shape() {
        let cfg = tiny_config();
        let mut rng = StdRng::seed_from_u64(4);
        let rc = ResidualConv::new(2, (3, 1), &cfg, &mut rng);
        let x = Array4::<f32>::ones((1, 6, 1, 8));
        let y = rc.forward(&x, Mode::Eval, &mut rng);
        assert_eq!(y.dim(), (1, 6, 1, 8));
    }
}
