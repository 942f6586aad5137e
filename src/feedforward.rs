//! Position-wise feed-forward network.

use ndarray::Array3;
use rand::rngs::StdRng;

use crate::activations::relu_scalar;
use crate::linear::Linear;
use crate::utils::ops::dropout_3d;

/// Two dense layers with a ReLU in between.
pub struct FeedForward {
    pub intermediate: Linear,
    pub output: Linear,
}

impl FeedForward {
    pub fn new(hidden_size: usize, filter_size: usize, rng: &mut StdRng) -> Self {
        Self {
            intermediate: Linear::new(hidden_size, filter_size, rng),
            output: Linear::new(filter_size, hidden_size, rng),
        }
    }

    pub fn forward(
        &self,
        hidden: &Array3<f32>,
        relu_dropout: f32,
        rng: Option<&mut StdRng>,
    ) -> Array3<f32> {
        let mut inner = self.intermediate.forward(hidden);
        inner.mapv_inplace(relu_scalar);
        if relu_dropout > 0.0 {
            if let Some(rng) = rng {
                dropout_3d(&mut inner, relu_dropout, rng);
            }
        }
        self.output.forward(&inner)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;

    #[test]
    fn test_forward_shape() {
        let mut rng = StdRng::seed_from_u64(0);
        let ffn = FeedForward::new(8, 32, &mut rng);
        let x = Array3::<f32>::ones((2, 4, 8));
        let y = ffn.forward(&x, 0.0, None);
        assert_eq!(y.dim(), (2, 4, 8));
    }

    #[test]
    fn test_zero_input_maps_to_bias_only() {
        let mut rng = StdRng::seed_from_u64(1);
        let ffn = FeedForward::new(4, 8, &mut rng);
        let x = Array3::<f32>::zeros((1, 1, 4));
        let y = ffn.forward(&x, 0.0, None);
        // Zero biases throughout, so the output must be exactly zero.
        assert!(y.iter().all(|&v| v == 0.0));
    }
}
