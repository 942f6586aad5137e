//! Multi-head attention for self- and cross-attention.

use anyhow::Result;
use ndarray::{Array1, Array2, Array3};
use rand::rngs::StdRng;

use crate::activations::softmax;
use crate::utils::linear_algebra::{matmul_3d_2d, matmul_4d};
use crate::utils::masks::{apply_attention_bias, apply_causal_mask};
use crate::utils::ops::{dropout_4d, glorot_uniform};

/// Multi-head attention mechanism.
///
/// Weights are stored as `[in_features, out_features]` for efficient
/// matmul.
pub struct MultiHeadAttention {
    pub q_weight: Array2<f32>,
    pub q_bias: Array1<f32>,
    pub k_weight: Array2<f32>,
    pub k_bias: Array1<f32>,
    pub v_weight: Array2<f32>,
    pub v_bias: Array1<f32>,
    pub output_weight: Array2<f32>,
    pub output_bias: Array1<f32>,

    pub num_heads: usize,
    pub head_dim: usize,
    pub scale_factor: f32,
}

impl MultiHeadAttention {
    pub fn new(hidden_size: usize, num_heads: usize, rng: &mut StdRng) -> Self {
        let head_dim = hidden_size / num_heads;
        let scale_factor = 1.0 / (head_dim as f32).sqrt();

        Self {
            q_weight: glorot_uniform(hidden_size, hidden_size, rng),
            q_bias: Array1::zeros(hidden_size),
            k_weight: glorot_uniform(hidden_size, hidden_size, rng),
            k_bias: Array1::zeros(hidden_size),
            v_weight: glorot_uniform(hidden_size, hidden_size, rng),
            v_bias: Array1::zeros(hidden_size),
            output_weight: glorot_uniform(hidden_size, hidden_size, rng),
            output_bias: Array1::zeros(hidden_size),
            num_heads,
            head_dim,
            scale_factor,
        }
    }

    /// Attend from `query` to `memory` (or to `query` itself when no
    /// memory is given).
    ///
    /// # Arguments
    /// * `query`: `[batch, q_len, hidden]`.
    /// * `memory`: optional cross-attention antecedent `[batch, kv_len, hidden]`.
    /// * `bias`: optional additive key bias `[batch, 1, 1, kv_len]`.
    /// * `causal`: forbid attending to future positions.
    /// * `dropout`: attention-weight dropout rate, active only when an
    ///   `rng` is supplied.
    pub fn forward(
        &self,
        query: &Array3<f32>,
        memory: Option<&Array3<f32>>,
        bias: Option<&ndarray::Array4<f32>>,
        causal: bool,
        dropout: f32,
        rng: Option<&mut StdRng>,
    ) -> Result<Array3<f32>> {
        let batch_size = query.shape()[0];
        let q_len = query.shape()[1];
        let kv_source = memory.unwrap_or(query);
        let kv_len = kv_source.shape()[1];

        assert_eq!(
            query.shape()[0],
            kv_source.shape()[0],
            "Batch sizes of query and memory must match."
        );

        // 1. Project Q, K, V.
        let q_proj = matmul_3d_2d(query, &self.q_weight) + &self.q_bias;
        let k_proj = matmul_3d_2d(kv_source, &self.k_weight) + &self.k_bias;
        let v_proj = matmul_3d_2d(kv_source, &self.v_weight) + &self.v_bias;

        // 2. Reshape to [batch, num_heads, seq, head_dim].
        let q_reshaped = q_proj
            .into_shape_with_order((batch_size, q_len, self.num_heads, self.head_dim))?
            .permuted_axes([0, 2, 1, 3]);
        let k_reshaped = k_proj
            .into_shape_with_order((batch_size, kv_len, self.num_heads, self.head_dim))?
            .permuted_axes([0, 2, 1, 3]);
        let v_reshaped = v_proj
            .into_shape_with_order((batch_size, kv_len, self.num_heads, self.head_dim))?
            .permuted_axes([0, 2, 1, 3]);

        // 3. Attention scores.
        let q_contiguous = q_reshaped.as_standard_layout().to_owned();
        let k_transposed = k_reshaped.permuted_axes([0, 1, 3, 2]);
        let k_transposed_contiguous = k_transposed.as_standard_layout().to_owned();

        let mut scores = matmul_4d(&q_contiguous, &k_transposed_contiguous);
        scores *= self.scale_factor;

        // 4. Masks.
        if let Some(bias) = bias {
            apply_attention_bias(&mut scores, bias);
        }
        if causal {
            apply_causal_mask(&mut scores);
        }

        // 5. Weights and context.
        let mut weights = softmax(&scores);
        if dropout > 0.0 {
            if let Some(rng) = rng {
                dropout_4d(&mut weights, dropout, rng);
            }
        }
        let v_contiguous = v_reshaped.as_standard_layout().to_owned();
        let context = matmul_4d(&weights, &v_contiguous);

        // 6. Back to [batch, seq, hidden] and output projection.
        let context_reshaped = context
            .permuted_axes([0, 2, 1, 3])
            .as_standard_layout()
            .to_owned()
            .into_shape_with_order((batch_size, q_len, self.num_heads * self.head_dim))?;

        let output = matmul_3d_2d(&context_reshaped, &self.output_weight) + &self.output_bias;
        Ok(output)
    }
}
