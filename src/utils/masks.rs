//! Attention bias construction and masking of attention scores.

use ndarray::{s, Array3, Array4, Axis, Zip};

pub const MASK_VALUE: f32 = -1e9;

/// Bias tensor `[batch, 1, 1, length]` that sends padded key positions to
/// [`MASK_VALUE`]. A position counts as padding when its embedded vector
/// is entirely zero.
pub fn attention_bias_ignore_padding(embedded: &Array3<f32>) -> Array4<f32> {
    let (batch, length, _hidden) = embedded.dim();
    let mut bias = Array4::<f32>::zeros((batch, 1, 1, length));
    for b in 0..batch {
        for t in 0..length {
            let magnitude: f32 = embedded.slice(s![b, t, ..]).iter().map(|v| v.abs()).sum();
            if magnitude == 0.0 {
                bias[[b, 0, 0, t]] = MASK_VALUE;
            }
        }
    }
    bias
}

/// Add a `[batch, 1, 1, key_len]` bias onto `[batch, heads, q_len, key_len]`
/// attention scores.
pub fn apply_attention_bias(scores: &mut Array4<f32>, bias: &Array4<f32>) {
    let (batch, heads, seq_q, seq_k) = scores.dim();
    assert_eq!(bias.shape()[0], batch, "bias batch size mismatch");
    assert_eq!(bias.shape()[3], seq_k, "bias key length mismatch");

    let bias_b = bias
        .view()
        .into_shape_with_order((batch, seq_k))
        .unwrap()
        .insert_axis(Axis(1))
        .insert_axis(Axis(1));
    if let Some(broadcast) = bias_b.broadcast((batch, heads, seq_q, seq_k)) {
        Zip::from(scores).and(&broadcast).for_each(|s, &b| *s += b);
    }
}

/// Forbid attending to future positions: position `i` sees only `0..=i`.
pub fn apply_causal_mask(scores: &mut Array4<f32>) {
    let (_, _, seq_q, seq_k) = scores.dim();
    for i in 0..seq_q {
        for j in 0..seq_k {
            if j > i {
                scores.slice_mut(s![.., .., i, j]).fill(MASK_VALUE);
            }
        }
    }
}
