//! Batched matrix multiplication for transformer layers.

use faer::Parallelism;
use ndarray::{Array2, Array3, Array4, ArrayView2, Zip};

#[inline]
pub fn matmul_2d(a: &ArrayView2<f32>, b: &ArrayView2<f32>) -> Array2<f32> {
    let (m, k) = a.dim();
    let (k2, n) = b.dim();
    assert_eq!(k, k2, "Dim mismatch");

    let mut c = Array2::<f32>::zeros((m, n));
    let a_s = a.as_standard_layout();
    let a_sl = a_s.as_slice().unwrap();
    let b_s = b.as_standard_layout();
    let b_sl = b_s.as_slice().unwrap();
    let c_sl = c.as_slice_mut().unwrap();

    faer::linalg::matmul::matmul(
        faer::mat::from_row_major_slice_mut(c_sl, m, n),
        faer::mat::from_row_major_slice(a_sl, m, k),
        faer::mat::from_row_major_slice(b_sl, k, n),
        None,
        1.0,
        Parallelism::Rayon(0),
    );
    c
}

/// Multiply every batch row of a 3-D tensor by a shared `[in, out]` matrix.
#[inline]
pub fn matmul_3d_2d(a: &Array3<f32>, b: &Array2<f32>) -> Array3<f32> {
    let (batch, m, k) = a.dim();
    let (k2, n) = b.dim();
    assert_eq!(k, k2);
    let a_std = a.as_standard_layout().to_owned();
    let a_flat = a_std.view().into_shape_with_order((batch * m, k)).unwrap();
    let b_view = b.view();
    let c_flat = matmul_2d(&a_flat, &b_view);
    c_flat.into_shape_with_order((batch, m, n)).unwrap()
}

/// Per-(batch, head) matrix multiplication of 4-D tensors.
#[inline]
pub fn matmul_4d(a: &Array4<f32>, b: &Array4<f32>) -> Array4<f32> {
    let (batch, heads, seq1, dim) = a.dim();
    let seq2 = b.shape()[3];

    let mut output = Array4::<f32>::zeros((batch, heads, seq1, seq2));

    Zip::from(output.outer_iter_mut())
        .and(a.outer_iter())
        .and(b.outer_iter())
        .par_for_each(|mut out_b, a_b, b_b| {
            Zip::from(out_b.outer_iter_mut())
                .and(a_b.outer_iter())
                .and(b_b.outer_iter())
                .for_each(|mut out_h, a_h, b_h| {
                    let a_s = a_h.as_standard_layout();
                    let b_s = b_h.as_standard_layout();
                    let o_s = out_h
                        .as_slice_mut()
                        .expect("Output buffer must be contiguous");

                    faer::linalg::matmul::matmul(
                        faer::mat::from_row_major_slice_mut(o_s, seq1, seq2),
                        faer::mat::from_row_major_slice(a_s.as_slice().unwrap(), seq1, dim),
                        faer::mat::from_row_major_slice(b_s.as_slice().unwrap(), dim, seq2),
                        None,
                        1.0,
                        Parallelism::None, // already parallel over batches
                    );
                });
        });

    output
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::{s, Array2, Array3, Array4};

    fn assert_close(a: &[f32], b: &[f32], tol: f32, msg: &str) {
        assert_eq!(a.len(), b.len(), "{}: length mismatch", msg);
        for (i, (&x, &y)) in a.iter().zip(b.iter()).enumerate() {
            let diff = (x - y).abs();
            assert!(
                diff <= tol,
                "{}: mismatch at {}: {} vs {} (diff: {})",
                msg,
                i,
                x,
                y,
                diff
            );
        }
    }

    fn reference_matmul_2d(a: &Array2<f32>, b: &Array2<f32>) -> Array2<f32> {
        let (m, k) = a.dim();
        let (k2, n) = b.dim();
        assert_eq!(k, k2);
        let mut c = Array2::<f32>::zeros((m, n));
        for i in 0..m {
            for j in 0..n {
                let mut sum = 0.0;
                for l in 0..k {
                    sum += a[[i, l]] * b[[l, j]];
                }
                c[[i, j]] = sum;
            }
        }
        c
    }

    #[test]
    fn test_matmul_2d_simple() {
        let a = Array2::from_shape_vec((2, 3), vec![1.0, 2.0, 3.0, 4.0, 5.0, 6.0]).unwrap();
        let b = Array2::from_shape_vec((3, 2), vec![1.0, 2.0, 3.0, 4.0, 5.0, 6.0]).unwrap();

        let result = matmul_2d(&a.view(), &b.view());
        let expected = reference_matmul_2d(&a, &b);

        assert_close(
            result.as_slice().unwrap(),
            expected.as_slice().unwrap(),
            1e-5,
            "matmul_2d simple",
        );
    }

    #[test]
    fn test_matmul_2d_large() {
        let a = Array2::from_shape_fn((64, 128), |(i, j)| ((i + j) % 10) as f32 * 0.1);
        let b = Array2::from_shape_fn((128, 32), |(i, j)| ((i * j) % 7) as f32 * 0.1);

        let result = matmul_2d(&a.view(), &b.view());
        let expected = reference_matmul_2d(&a, &b);

        assert_close(
            result.as_slice().unwrap(),
            expected.as_slice().unwrap(),
            1e-4,
            "matmul_2d large",
        );
    }

    #[test]
    fn test_matmul_3d_2d_per_batch() {
        let a = Array3::from_shape_fn((2, 3, 4), |(b, i, j)| (b * 12 + i * 4 + j) as f32);
        let b = Array2::from_shape_fn((4, 5), |(i, j)| (i + j) as f32);

        let result = matmul_3d_2d(&a, &b);
        assert_eq!(result.dim(), (2, 3, 5));

        for batch in 0..2 {
            let a_slice = a.slice(s![batch, .., ..]).to_owned();
            let expected = reference_matmul_2d(&a_slice, &b);
            let result_slice = result.slice(s![batch, .., ..]).to_owned();
            assert_close(
                result_slice.as_slice().unwrap(),
                expected.as_slice().unwrap(),
                1e-4,
                &format!("matmul_3d_2d batch {}", batch),
            );
        }
    }

    #[test]
    fn test_matmul_4d_attention_shape() {
        let (batch, heads, seq, head_dim) = (2, 4, 8, 16);
        let q = Array4::from_shape_fn((batch, heads, seq, head_dim), |(b, h, s, d)| {
            ((b + h + s + d) % 10) as f32 * 0.1
        });
        let k_t = Array4::from_shape_fn((batch, heads, head_dim, seq), |(b, h, d, s)| {
            ((b * h + d + s) % 7) as f32 * 0.1
        });

        let scores = matmul_4d(&q, &k_t);
        assert_eq!(scores.dim(), (batch, heads, seq, seq));

        // Cross-check one entry against a hand computation.
        let mut sum = 0.0;
        for d in 0..head_dim {
            sum += q[[1, 2, 3, d]] * k_t[[1, 2, d, 5]];
        }
        assert!((scores[[1, 2, 3, 5]] - sum).abs() < 1e-4);
    }
}
