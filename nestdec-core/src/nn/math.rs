//! Scalar helpers shared by the decoders and the searches.

use std::cmp::Ordering;

use ndarray::{Array1, ArrayView1};

pub fn sigmoid(x: f32) -> f32 {
    1.0 / (1.0 + (-x).exp())
}

/// Numerically stable log-softmax.
pub fn log_softmax(logits: ArrayView1<'_, f32>) -> Array1<f32> {
    if logits.is_empty() {
        return Array1::zeros(0);
    }
    let max = logits.fold(f32::NEG_INFINITY, |m, &v| m.max(v));
    let log_z = logits.iter().map(|&v| (v - max).exp()).sum::<f32>().ln();
    logits.mapv(|v| (v - max) - log_z)
}

/// Softmax over the first `len` entries; entries at or beyond `len` are
/// exactly zero. `len == 0` yields all zeros.
pub fn masked_softmax(energies: ArrayView1<'_, f32>, len: usize) -> Array1<f32> {
    let mut out = Array1::zeros(energies.len());
    let len = len.min(energies.len());
    if len == 0 {
        return out;
    }
    let valid = energies.slice(ndarray::s![..len]);
    let max = valid.fold(f32::NEG_INFINITY, |m, &v| m.max(v));
    let mut total = 0.0;
    for (t, &e) in valid.iter().enumerate() {
        let w = (e - max).exp();
        out[t] = w;
        total += w;
    }
    if total > 0.0 {
        out.slice_mut(ndarray::s![..len]).mapv_inplace(|w| w / total);
    }
    out
}

/// `sigmoid(e) / Σ sigmoid(e)` over the first `len` entries, zero elsewhere.
pub fn masked_sigmoid_smoothing(energies: ArrayView1<'_, f32>, len: usize) -> Array1<f32> {
    let mut out = Array1::zeros(energies.len());
    let len = len.min(energies.len());
    let mut total = 0.0;
    for t in 0..len {
        let w = sigmoid(energies[t]);
        out[t] = w;
        total += w;
    }
    if total > 0.0 {
        out.slice_mut(ndarray::s![..len]).mapv_inplace(|w| w / total);
    }
    out
}

/// Descending order on scores; equal scores keep their index order when
/// used with a stable sort.
pub fn by_score_desc(a: f32, b: f32) -> Ordering {
    b.total_cmp(&a)
}

/// The `k` largest entries as `(index, value)`, best first. Ties go to the
/// lowest index.
pub fn top_k(values: ArrayView1<'_, f32>, k: usize) -> Vec<(usize, f32)> {
    let mut indexed: Vec<(usize, f32)> = values.iter().copied().enumerate().collect();
    indexed.sort_by(|a, b| by_score_desc(a.1, b.1));
    indexed.truncate(k);
    indexed
}

/// Largest entry, lowest index on ties. Agrees with `top_k(values, 1)`.
pub fn argmax(values: ArrayView1<'_, f32>) -> Option<(usize, f32)> {
    let mut best: Option<(usize, f32)> = None;
    for (i, &v) in values.iter().enumerate() {
        match best {
            Some((_, b)) if by_score_desc(v, b) != Ordering::Less => {}
            _ => best = Some((i, v)),
        }
    }
    best
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use ndarray::array;

    #[test]
    fn log_softmax_normalizes() {
        let lp = log_softmax(array![1.0, 2.0, 3.0].view());
        let total: f32 = lp.iter().map(|v| v.exp()).sum();
        assert_abs_diff_eq!(total, 1.0, epsilon = 1e-6);
        assert!(lp[2] > lp[1] && lp[1] > lp[0]);
    }

    #[test]
    fn log_softmax_survives_large_logits() {
        let lp = log_softmax(array![1000.0, 1000.0].view());
        assert_abs_diff_eq!(lp[0], -(2.0f32).ln(), epsilon = 1e-5);
        assert!(lp.iter().all(|v| v.is_finite()));
    }

    #[test]
    fn log_softmax_keeps_precision_for_offset_logits() {
        let small = log_softmax(array![0.0f32, 1.0, 2.0].view());
        let large = log_softmax(array![1000.0f32, 1001.0, 1002.0].view());
        for (a, b) in small.iter().zip(large.iter()) {
            assert_abs_diff_eq!(a, b, epsilon = 1e-6);
        }
    }

    #[test]
    fn masked_softmax_zeroes_padding() {
        let w = masked_softmax(array![0.5, 0.1, 9.0, 9.0].view(), 2);
        assert_eq!(w[2], 0.0);
        assert_eq!(w[3], 0.0);
        assert_abs_diff_eq!(w[0] + w[1], 1.0, epsilon = 1e-6);
    }

    #[test]
    fn masked_softmax_empty_is_zero_not_nan() {
        let w = masked_softmax(array![1.0, 2.0].view(), 0);
        assert!(w.iter().all(|&v| v == 0.0));
        let w = masked_sigmoid_smoothing(array![1.0, 2.0].view(), 0);
        assert!(w.iter().all(|&v| v == 0.0));
    }

    #[test]
    fn sigmoid_smoothing_sums_to_one() {
        let w = masked_sigmoid_smoothing(array![-1.0, 0.0, 3.0, 7.0].view(), 3);
        assert_abs_diff_eq!(w.sum(), 1.0, epsilon = 1e-6);
        assert_eq!(w[3], 0.0);
    }

    #[test]
    fn top_k_breaks_ties_by_lowest_index() {
        let picks = top_k(array![0.2, 0.7, 0.7, 0.1].view(), 2);
        assert_eq!(picks, vec![(1, 0.7), (2, 0.7)]);
        assert_eq!(argmax(array![0.2, 0.7, 0.7, 0.1].view()), Some((1, 0.7)));
    }

    #[test]
    fn argmax_agrees_with_top_one() {
        let values = array![-3.0, -1.0, -1.0, -2.0, -1.0];
        assert_eq!(argmax(values.view()), top_k(values.view(), 1).first().copied());
        assert_eq!(argmax(Array1::<f32>::zeros(0).view()), None);
    }
}
