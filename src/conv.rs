//! Convolution primitives over `[batch, length, width, channels]` tensors.
//!
//! The layout is channels-last; 1-D sequences use `width == 1`.

use ndarray::{Array1, Array4, Zip};
use rand::rngs::StdRng;

use crate::activations::relu_scalar;
use crate::utils::ops::glorot_uniform;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Padding {
    /// Pad so the output length equals `ceil(len / stride)`.
    Same,
    /// No padding.
    Valid,
}

/// A single 2-D convolution, weights `[kh, kw, in_ch, out_ch]`.
pub struct Conv2d {
    pub weight: Array4<f32>,
    pub bias: Array1<f32>,
    pub kernel: (usize, usize),
}

impl Conv2d {
    pub fn new(
        kernel: (usize, usize),
        in_channels: usize,
        out_channels: usize,
        rng: &mut StdRng,
    ) -> Self {
        let (kh, kw) = kernel;
        let flat = glorot_uniform(kh * kw * in_channels, out_channels, rng);
        let weight = flat
            .into_shape_with_order((kh, kw, in_channels, out_channels))
            .unwrap();
        Self {
            weight,
            bias: Array1::zeros(out_channels),
            kernel,
        }
    }

    pub fn out_channels(&self) -> usize {
        self.weight.shape()[3]
    }

    pub fn forward(&self, x: &Array4<f32>, stride: (usize, usize), padding: Padding) -> Array4<f32> {
        let (batch, len, width, in_ch) = x.dim();
        let (kh, kw) = self.kernel;
        let (sh, sw) = stride;
        let out_ch = self.out_channels();
        assert_eq!(
            in_ch,
            self.weight.shape()[2],
            "input channels do not match kernel"
        );

        let (out_len, out_width, pad_top, pad_left) = match padding {
            Padding::Same => {
                let out_len = (len + sh - 1) / sh;
                let out_width = (width + sw - 1) / sw;
                let pad_h = ((out_len - 1) * sh + kh).saturating_sub(len);
                let pad_w = ((out_width - 1) * sw + kw).saturating_sub(width);
                (out_len, out_width, pad_h / 2, pad_w / 2)
            }
            Padding::Valid => {
                let out_len = (len.saturating_sub(kh)) / sh + 1;
                let out_width = (width.saturating_sub(kw)) / sw + 1;
                (out_len, out_width, 0, 0)
            }
        };

        let mut output = Array4::<f32>::zeros((batch, out_len, out_width, out_ch));

        Zip::from(output.outer_iter_mut())
            .and(x.outer_iter())
            .par_for_each(|mut out_b, x_b| {
                for i in 0..out_len {
                    for j in 0..out_width {
                        for o in 0..out_ch {
                            let mut acc = self.bias[o];
                            for di in 0..kh {
                                let src_i = (i * sh + di) as isize - pad_top as isize;
                                if src_i < 0 || src_i >= len as isize {
                                    continue;
                                }
                                for dj in 0..kw {
                                    let src_j = (j * sw + dj) as isize - pad_left as isize;
                                    if src_j < 0 || src_j >= width as isize {
                                        continue;
                                    }
                                    for c in 0..in_ch {
                                        acc += x_b[[src_i as usize, src_j as usize, c]]
                                            * self.weight[[di, dj, c, o]];
                                    }
                                }
                            }
                            out_b[[i, j, o]] = acc;
                        }
                    }
                }
            });

        output
    }
}

/// A stack of convolutions with ReLU between them.
///
/// `first_relu` controls whether the input is rectified before the first
/// convolution; every later convolution always reads rectified input.
pub struct ConvBlock {
    pub convs: Vec<Conv2d>,
    pub first_relu: bool,
}

impl ConvBlock {
    /// Build a block from `(kernel, in_ch, out_ch)` specs applied in order.
    pub fn new(specs: &[((usize, usize), usize, usize)], first_relu: bool, rng: &mut StdRng) -> Self {
        let convs = specs
            .iter()
            .map(|&(kernel, in_ch, out_ch)| Conv2d::new(kernel, in_ch, out_ch, rng))
            .collect();
        Self { convs, first_relu }
    }

    pub fn forward(&self, x: &Array4<f32>, stride: (usize, usize), padding: Padding) -> Array4<f32> {
        let mut cur = x.clone();
        for (counter, conv) in self.convs.iter().enumerate() {
            if self.first_relu || counter > 0 {
                cur.mapv_inplace(relu_scalar);
            }
            cur = conv.forward(&cur, stride, padding);
        }
        cur
    }
}

/// Rearrange `[batch, len, width, 4 * ch]` into `[batch, 2 * len, 2 * width, ch]`.
pub fn depth_to_space(x: &Array4<f32>) -> Array4<f32> {
    let (batch, len, width, channels) = x.dim();
    assert_eq!(channels % 4, 0, "depth_to_space needs 4n channels");
    let out_ch = channels / 4;

    let mut out = Array4::<f32>::zeros((batch, len * 2, width * 2, out_ch));
    for b in 0..batch {
        for i in 0..len {
            for j in 0..width {
                for di in 0..2 {
                    for dj in 0..2 {
                        for c in 0..out_ch {
                            out[[b, 2 * i + di, 2 * j + dj, c]] =
                                x[[b, i, j, (di * 2 + dj) * out_ch + c]];
                        }
                    }
                }
            }
        }
    }
    out
}
