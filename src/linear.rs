//! Dense projection layer.

use ndarray::{Array1, Array2, Array3};
use rand::rngs::StdRng;

use crate::utils::linear_algebra::{matmul_2d, matmul_3d_2d};
use crate::utils::ops::glorot_uniform;

/// A dense layer with weights stored as `[in_features, out_features]`.
pub struct Linear {
    pub weight: Array2<f32>,
    pub bias: Array1<f32>,
}

impl Linear {
    pub fn new(in_features: usize, out_features: usize, rng: &mut StdRng) -> Self {
        Self {
            weight: glorot_uniform(in_features, out_features, rng),
            bias: Array1::zeros(out_features),
        }
    }

    #[inline]
    pub fn in_features(&self) -> usize {
        self.weight.shape()[0]
    }

    #[inline]
    pub fn out_features(&self) -> usize {
        self.weight.shape()[1]
    }

    pub fn forward(&self, x: &Array3<f32>) -> Array3<f32> {
        matmul_3d_2d(x, &self.weight) + &self.bias
    }

    pub fn forward_2d(&self, x: &Array2<f32>) -> Array2<f32> {
        matmul_2d(&x.view(), &self.weight.view()) + &self.bias
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::Array3;
    use rand::SeedableRng;

    #[test]
    fn test_forward_shape() {
        let mut rng = StdRng::seed_from_u64(0);
        let layer = Linear::new(8, 16, &mut rng);
        let x = Array3::<f32>::ones((2, 5, 8));
        let y = layer.forward(&x);
        assert_eq!(y.dim(), (2, 5, 16));
    }

    #[test]
    fn test_identity_weight() {
        let mut rng = StdRng::seed_from_u64(0);
        let mut layer = Linear::new(3, 3, &mut rng);
        layer.weight = Array2::eye(3);
        layer.bias = Array1::from_vec(vec![1.0, 0.0, -1.0]);

        let x = Array3::from_shape_vec((1, 1, 3), vec![2.0, 4.0, 6.0]).unwrap();
        let y = layer.forward(&x);
        assert_eq!(y[[0, 0, 0]], 3.0);
        assert_eq!(y[[0, 0, 1]], 4.0);
        assert_eq!(y[[0, 0, 2]], 5.0);
    }
}
