//! Layer normalization.

use ndarray::{Array1, Array3, Array4, ArrayView3, Axis};

/// Layer normalization over the hidden axis.
pub struct LayerNorm {
    pub weight: Array1<f32>,
    pub bias: Array1<f32>,
    pub eps: f32,
}

impl LayerNorm {
    pub fn new(hidden_size: usize) -> Self {
        Self {
            weight: Array1::ones(hidden_size),
            bias: Array1::zeros(hidden_size),
            eps: 1e-6,
        }
    }

    /// Apply layer norm to a 3-D tensor of activations.
    #[inline]
    pub fn forward(&self, hidden_states: &ArrayView3<f32>) -> Array3<f32> {
        let mean = hidden_states.mean_axis(Axis(2)).unwrap();
        let variance = hidden_states.var_axis(Axis(2), 0.0);

        let mean_expanded = mean.insert_axis(Axis(2));
        let var_expanded = variance.insert_axis(Axis(2));

        let inv_std = (&var_expanded + self.eps).mapv(|x| 1.0 / x.sqrt());
        let normalized_hidden = (hidden_states.to_owned() - &mean_expanded) * &inv_std;

        normalized_hidden * &self.weight + &self.bias
    }

    pub fn forward_3d(&self, hidden: &Array3<f32>) -> Array3<f32> {
        self.forward(&hidden.view())
    }

    /// Normalize a `[batch, length, inner, hidden]` tensor by flattening
    /// the middle axes.
    pub fn forward_4d(&self, hidden: &Array4<f32>) -> Array4<f32> {
        let (b, l, w, h) = hidden.dim();
        let flat = hidden
            .as_standard_layout()
            .to_owned()
            .into_shape_with_order((b, l * w, h))
            .unwrap();
        self.forward_3d(&flat)
            .into_shape_with_order((b, l, w, h))
            .unwrap()
    }
}
