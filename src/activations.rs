//! Activation functions and softmax operations.

use libm::{erff, expf};
use ndarray::{Array1, Array2, Array4, ArrayBase, Axis, DataMut, Ix1, Zip};

const SQRT_2_INV: f32 = 0.7071067811865475;

#[inline(always)]
pub fn gelu_scalar(x: f32) -> f32 {
    0.5 * x * (1.0 + erff(x * SQRT_2_INV))
}

#[inline(always)]
pub fn relu_scalar(x: f32) -> f32 {
    x.max(0.0)
}

#[inline(always)]
pub fn sigmoid_scalar(x: f32) -> f32 {
    1.0 / (1.0 + expf(-x))
}

/// Sigmoid stretched to reach exactly 0 and 1 inside a finite range:
/// `max(0, min(1, 1.2 * sigmoid(x) - 0.1))`.
#[inline(always)]
pub fn saturating_sigmoid_scalar(x: f32) -> f32 {
    (1.2 * sigmoid_scalar(x) - 0.1).clamp(0.0, 1.0)
}

/// Numerically stable softmax over the last axis of attention scores.
pub fn softmax(scores: &Array4<f32>) -> Array4<f32> {
    let mut out = scores.clone();
    softmax_4d_inplace(&mut out);
    out
}

pub fn softmax_4d_inplace(scores: &mut Array4<f32>) {
    for mut lane in scores.lanes_mut(Axis(3)) {
        let max = lane.fold(f32::NEG_INFINITY, |a, &b| a.max(b));
        let mut sum = 0.0;
        for v in lane.iter_mut() {
            *v = expf(*v - max);
            sum += *v;
        }
        if sum > 0.0 {
            for v in lane.iter_mut() {
                *v /= sum;
            }
        }
    }
}

/// Softmax over the rows of a 2-D logits matrix.
pub fn softmax_rows(logits: &Array2<f32>) -> Array2<f32> {
    let mut out = logits.clone();
    for mut row in out.outer_iter_mut() {
        let max = row.fold(f32::NEG_INFINITY, |a, &b| a.max(b));
        let mut sum = 0.0;
        for v in row.iter_mut() {
            *v = expf(*v - max);
            sum += *v;
        }
        if sum > 0.0 {
            for v in row.iter_mut() {
                *v /= sum;
            }
        }
    }
    out
}

pub fn softmax_1d_inplace<S>(logits: &mut ArrayBase<S, Ix1>)
where
    S: DataMut<Elem = f32>,
{
    let max = logits.fold(f32::NEG_INFINITY, |a, &b| a.max(b));
    let mut sum = 0.0;
    for v in logits.iter_mut() {
        *v = expf(*v - max);
        sum += *v;
    }
    if sum > 0.0 {
        for v in logits.iter_mut() {
            *v /= sum;
        }
    }
}

pub fn log_softmax_1d(logits: &Array1<f32>) -> Array1<f32> {
    let max_val = logits.fold(f32::NEG_INFINITY, |acc, &x| acc.max(x));
    let scaled_logits = logits - max_val;
    let exp_sum = scaled_logits.mapv(f32::exp).sum();
    scaled_logits - exp_sum.ln()
}

/// Elementwise ReLU.
pub fn relu_2d_inplace(x: &mut Array2<f32>) {
    Zip::from(x).for_each(|v| *v = relu_scalar(*v));
}
