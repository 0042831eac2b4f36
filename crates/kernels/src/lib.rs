//! Row-major `f32` numeric kernels for the decoder runtime, plus the logit
//! filters used by the streaming sampler.
//!
//! All kernels are pure and deterministic up to floating-point
//! associativity. Matrices are row-major with no broadcasting; norms and
//! softmax operate on one row in place.

#![deny(unsafe_code)]

/// Epsilon added to the variance in [`layer_norm_row`].
pub const LAYER_NORM_EPS: f32 = 1e-5;
/// Epsilon added to the mean square in [`rms_norm_row`].
pub const RMS_NORM_EPS: f32 = 1e-6;
/// Temperature floor used by [`softmax_with_temperature`].
pub const TEMPERATURE_FLOOR: f32 = 1e-6;

const GELU_SQRT_2_OVER_PI: f32 = 0.797_884_56;
const GELU_CUBIC: f32 = 0.044_715;

/// `C[M,N] += A[M,K] · B[K,N]`, row-major, accumulating into `c`.
pub fn gemm(a: &[f32], b: &[f32], c: &mut [f32], m: usize, k: usize, n: usize) {
    debug_assert_eq!(a.len(), m * k);
    debug_assert_eq!(b.len(), k * n);
    debug_assert_eq!(c.len(), m * n);
    for i in 0..m {
        let row = &a[i * k..(i + 1) * k];
        let out = &mut c[i * n..(i + 1) * n];
        for (kk, &av) in row.iter().enumerate() {
            let brow = &b[kk * n..(kk + 1) * n];
            for (o, &bv) in out.iter_mut().zip(brow) {
                *o += av * bv;
            }
        }
    }
}

/// `Y = X·W + b` (bias optional), row-major, overwriting `y`.
pub fn affine(
    x: &[f32],
    w: &[f32],
    bias: Option<&[f32]>,
    y: &mut [f32],
    rows: usize,
    in_dim: usize,
    out_dim: usize,
) {
    y.fill(0.0);
    gemm(x, w, y, rows, in_dim, out_dim);
    if let Some(b) = bias {
        debug_assert_eq!(b.len(), out_dim);
        for r in 0..rows {
            for (o, &bv) in y[r * out_dim..(r + 1) * out_dim].iter_mut().zip(b) {
                *o += bv;
            }
        }
    }
}

/// In-place LayerNorm over one row: subtract the mean, divide by
/// `sqrt(var + eps)`, scale by `gamma`, shift by `beta`.
pub fn layer_norm_row(x: &mut [f32], gamma: &[f32], beta: &[f32]) {
    let d = x.len();
    if d == 0 {
        return;
    }
    let mean = x.iter().map(|&v| f64::from(v)).sum::<f64>() / d as f64;
    let var = x.iter().map(|&v| (f64::from(v) - mean).powi(2)).sum::<f64>() / d as f64;
    let inv = 1.0 / ((var as f32) + LAYER_NORM_EPS).sqrt();
    for i in 0..d {
        x[i] = (x[i] - mean as f32) * inv * gamma[i] + beta[i];
    }
}

/// In-place RMSNorm over one row: divide by `sqrt(mean(x²) + eps)` and
/// scale by `weight`.
pub fn rms_norm_row(x: &mut [f32], weight: &[f32]) {
    let d = x.len();
    if d == 0 {
        return;
    }
    let ss = x.iter().map(|&v| f64::from(v) * f64::from(v)).sum::<f64>();
    let inv = 1.0 / (((ss / d as f64) as f32) + RMS_NORM_EPS).sqrt();
    for (xi, &wi) in x.iter_mut().zip(weight) {
        *xi = *xi * inv * wi;
    }
}

/// Numerically stable in-place softmax.
pub fn softmax_in_place(x: &mut [f32]) {
    softmax_scaled(x, None);
}

/// Softmax with `(x - max)` divided by `max(temperature, 1e-6)` before
/// exponentiation.
pub fn softmax_with_temperature(x: &mut [f32], temperature: f32) {
    softmax_scaled(x, Some(temperature));
}

fn softmax_scaled(x: &mut [f32], temperature: Option<f32>) {
    if x.is_empty() {
        return;
    }
    let max = x.iter().copied().fold(f32::NEG_INFINITY, f32::max);
    let inv_t = temperature.map_or(1.0, |t| 1.0 / t.max(TEMPERATURE_FLOOR));
    let mut sum = 0.0f64;
    for v in x.iter_mut() {
        *v = ((*v - max) * inv_t).exp();
        sum += f64::from(*v);
    }
    if sum > 0.0 {
        let inv = (1.0 / sum) as f32;
        for v in x.iter_mut() {
            *v *= inv;
        }
    }
}

/// GELU, tanh approximation.
pub fn gelu(x: f32) -> f32 {
    0.5 * x * (1.0 + (GELU_SQRT_2_OVER_PI * (x + GELU_CUBIC * x * x * x)).tanh())
}

fn sigmoid(x: f32) -> f32 {
    1.0 / (1.0 + (-x).exp())
}

/// SwiGLU gate: `out[i] = a[i] * sigmoid(b[i])` over two parallel
/// projections of equal length.
pub fn swiglu(a: &[f32], b: &[f32], out: &mut [f32]) {
    debug_assert_eq!(a.len(), b.len());
    debug_assert_eq!(a.len(), out.len());
    for ((o, &av), &bv) in out.iter_mut().zip(a).zip(b) {
        *o = av * sigmoid(bv);
    }
}

/// Rotary positional embedding on one head slice at position `pos`.
///
/// Rotates each pair `(i, i + half)` of `q` and `k` by the angle
/// `(pos · freq_scale) · theta_base^(-2i / head_dim)`. Both slices must
/// have the same (even) length.
pub fn rope_rotate(q: &mut [f32], k: &mut [f32], pos: usize, theta_base: f32, freq_scale: f32) {
    debug_assert_eq!(q.len(), k.len());
    let head_dim = q.len();
    let half = head_dim / 2;
    let scaled_pos = pos as f32 * freq_scale;
    for i in 0..half {
        let inv_freq = theta_base.powf(-2.0 * i as f32 / head_dim as f32);
        let ang = scaled_pos * inv_freq;
        let (sin, cos) = ang.sin_cos();

        let (q0, q1) = (q[i], q[i + half]);
        q[i] = q0 * cos - q1 * sin;
        q[i + half] = q0 * sin + q1 * cos;

        let (k0, k1) = (k[i], k[i + half]);
        k[i] = k0 * cos - k1 * sin;
        k[i + half] = k0 * sin + k1 * cos;
    }
}

/// Divide the logits of every id in `recent` by `penalty` (> 1.0).
pub fn apply_repetition_penalty(logits: &mut [f32], recent: &[u32], penalty: f32) {
    if penalty <= 1.0 {
        return;
    }
    for &id in recent {
        if let Some(v) = logits.get_mut(id as usize) {
            *v /= penalty;
        }
    }
}

/// Keep the `k` largest logits and mask the rest to `-inf` so a following
/// softmax zeroes them. `k == 0` disables the filter.
pub fn top_k_filter(logits: &mut [f32], k: usize) {
    let n = logits.len();
    if k == 0 || k >= n {
        return;
    }
    let mut order: Vec<usize> = (0..n).collect();
    // Ties keep the lower index so greedy decoding stays deterministic.
    order.sort_unstable_by(|&a, &b| logits[b].total_cmp(&logits[a]).then(a.cmp(&b)));
    for &i in &order[k..] {
        logits[i] = f32::NEG_INFINITY;
    }
}

/// Nucleus filter over probabilities: keep the smallest
/// descending-probability prefix whose cumulative mass reaches `top_p`,
/// zero the rest, renormalize. Values outside `(0, 1)` disable the filter.
pub fn top_p_filter(probs: &mut [f32], top_p: f32) {
    if top_p <= 0.0 || top_p >= 1.0 {
        return;
    }
    let n = probs.len();
    let mut order: Vec<usize> = (0..n).collect();
    order.sort_unstable_by(|&a, &b| probs[b].total_cmp(&probs[a]).then(a.cmp(&b)));

    let mut cum = 0.0f32;
    let mut keep = n;
    for (rank, &i) in order.iter().enumerate() {
        cum += probs[i];
        if cum >= top_p {
            keep = rank + 1;
            break;
        }
    }
    for &i in &order[keep..] {
        probs[i] = 0.0;
    }
    renormalize(probs);
}

/// Zero out probabilities below `min_prob` and renormalize. A threshold of
/// zero disables the filter.
pub fn min_prob_filter(probs: &mut [f32], min_prob: f32) {
    if min_prob <= 0.0 {
        return;
    }
    for p in probs.iter_mut() {
        if *p < min_prob {
            *p = 0.0;
        }
    }
    renormalize(probs);
}

fn renormalize(probs: &mut [f32]) {
    let sum: f32 = probs.iter().sum();
    if sum > 0.0 {
        let inv = 1.0 / sum;
        for p in probs.iter_mut() {
            *p *= inv;
        }
    }
}

/// Index of the largest value; the first one wins on ties. Empty input
/// yields 0.
pub fn argmax(x: &[f32]) -> usize {
    let mut best = 0;
    let mut best_val = f32::NEG_INFINITY;
    for (i, &v) in x.iter().enumerate() {
        if v > best_val {
            best = i;
            best_val = v;
        }
    }
    best
}

#[cfg(test)]
mod tests {
    use super::*;

    fn close(a: f32, b: f32, tol: f32) -> bool {
        (a - b).abs() <= tol
    }

    #[test]
    fn gemm_known_product_accumulates() {
        // A = [[1,2,3],[4,5,6]], B = [[7,8],[9,10],[11,12]]
        let a = [1.0, 2.0, 3.0, 4.0, 5.0, 6.0];
        let b = [7.0, 8.0, 9.0, 10.0, 11.0, 12.0];
        let mut c = [1.0, 0.0, 0.0, 1.0];
        gemm(&a, &b, &mut c, 2, 3, 2);
        assert_eq!(c, [59.0, 64.0, 139.0, 155.0]);
    }

    #[test]
    fn affine_overwrites_and_adds_bias() {
        let x = [1.0, 2.0];
        let w = [1.0, 0.0, 0.0, 1.0];
        let mut y = [99.0, 99.0];
        affine(&x, &w, Some(&[10.0, 20.0]), &mut y, 1, 2, 2);
        assert_eq!(y, [11.0, 22.0]);
    }

    #[test]
    fn layer_norm_centers_and_scales() {
        let mut x = [1.0, 3.0];
        layer_norm_row(&mut x, &[2.0, 2.0], &[1.0, 1.0]);
        assert!(close(x[0], -1.0, 1e-3), "{x:?}");
        assert!(close(x[1], 3.0, 1e-3), "{x:?}");
    }

    #[test]
    fn rms_norm_zero_row_stays_zero() {
        let mut x = [0.0f32; 16];
        rms_norm_row(&mut x, &[3.0; 16]);
        assert!(x.iter().all(|&v| v == 0.0));
    }

    #[test]
    fn rms_norm_unit_scale() {
        let mut x = [3.0, 4.0];
        rms_norm_row(&mut x, &[1.0, 1.0]);
        // mean square = 12.5, so each element divides by ~3.5355
        assert!(close(x[0], 3.0 / 12.5f32.sqrt(), 1e-4));
        assert!(close(x[1], 4.0 / 12.5f32.sqrt(), 1e-4));
    }

    #[test]
    fn softmax_sums_to_one_and_orders() {
        let mut x = [1.0, 2.0, 3.0];
        softmax_in_place(&mut x);
        let sum: f32 = x.iter().sum();
        assert!(close(sum, 1.0, 1e-5));
        assert!(x[0] < x[1] && x[1] < x[2]);
    }

    #[test]
    fn softmax_low_temperature_sharpens() {
        let mut soft = [1.0, 2.0];
        let mut sharp = [1.0, 2.0];
        softmax_with_temperature(&mut soft, 2.0);
        softmax_with_temperature(&mut sharp, 0.1);
        assert!(sharp[1] > soft[1]);
        // Temperature zero clamps to the floor rather than dividing by zero.
        let mut extreme = [1.0, 2.0];
        softmax_with_temperature(&mut extreme, 0.0);
        assert!(extreme[1] > 0.999);
    }

    #[test]
    fn gelu_reference_points() {
        assert_eq!(gelu(0.0), 0.0);
        assert!(close(gelu(1.0), 0.8412, 1e-3));
        assert!(close(gelu(-1.0), -0.1588, 1e-3));
        assert!(gelu(10.0) > 9.99);
    }

    #[test]
    fn swiglu_gates_by_sigmoid() {
        let mut out = [0.0f32; 2];
        swiglu(&[2.0, 2.0], &[0.0, 100.0], &mut out);
        assert!(close(out[0], 1.0, 1e-6)); // sigmoid(0) = 0.5
        assert!(close(out[1], 2.0, 1e-4)); // sigmoid(100) ~= 1
    }

    #[test]
    fn rope_identity_at_position_zero() {
        let mut q = [0.1, 0.2, 0.3, 0.4];
        let mut k = [0.5, 0.6, 0.7, 0.8];
        rope_rotate(&mut q, &mut k, 0, 10_000.0, 1.0);
        assert_eq!(q, [0.1, 0.2, 0.3, 0.4]);
        assert_eq!(k, [0.5, 0.6, 0.7, 0.8]);
    }

    #[test]
    fn rope_preserves_norm() {
        let mut q = [0.3, -1.2, 0.7, 2.0, -0.5, 0.9, 1.1, -0.2];
        let mut k = q;
        let before: f32 = q.iter().map(|v| v * v).sum::<f32>().sqrt();
        rope_rotate(&mut q, &mut k, 17, 10_000.0, 1.0);
        let after: f32 = q.iter().map(|v| v * v).sum::<f32>().sqrt();
        assert!(close(before, after, 1e-4));
    }

    #[test]
    fn repetition_penalty_divides_named_ids() {
        let mut logits = [4.0, 4.0, 4.0];
        apply_repetition_penalty(&mut logits, &[1, 7], 2.0);
        assert_eq!(logits, [4.0, 2.0, 4.0]);
        // penalty <= 1 is a no-op
        apply_repetition_penalty(&mut logits, &[0], 1.0);
        assert_eq!(logits[0], 4.0);
    }

    #[test]
    fn top_k_keeps_exactly_k() {
        let mut logits = [0.5, 3.0, 1.0, 2.0];
        top_k_filter(&mut logits, 2);
        assert_eq!(logits[1], 3.0);
        assert_eq!(logits[3], 2.0);
        assert_eq!(logits[0], f32::NEG_INFINITY);
        assert_eq!(logits[2], f32::NEG_INFINITY);

        let mut untouched = [1.0, 2.0];
        top_k_filter(&mut untouched, 0);
        assert_eq!(untouched, [1.0, 2.0]);
    }

    #[test]
    fn top_p_keeps_smallest_covering_prefix() {
        let mut probs = [0.5, 0.3, 0.15, 0.05];
        top_p_filter(&mut probs, 0.7);
        // 0.5 alone misses 0.7; 0.5 + 0.3 crosses it.
        assert!(probs[2] == 0.0 && probs[3] == 0.0);
        let sum: f32 = probs.iter().sum();
        assert!(close(sum, 1.0, 1e-6));
        assert!(close(probs[0], 0.625, 1e-6));
    }

    #[test]
    fn min_prob_zeroes_and_renormalizes() {
        let mut probs = [0.6, 0.3, 0.08, 0.02];
        min_prob_filter(&mut probs, 0.1);
        assert_eq!(probs[2], 0.0);
        assert_eq!(probs[3], 0.0);
        let sum: f32 = probs.iter().sum();
        assert!(close(sum, 1.0, 1e-6));
    }

    #[test]
    fn argmax_first_max_wins() {
        assert_eq!(argmax(&[1.0, 5.0, 5.0, 2.0]), 1);
        assert_eq!(argmax(&[]), 0);
        assert_eq!(argmax(&[0.0, 0.0]), 0);
    }
}
