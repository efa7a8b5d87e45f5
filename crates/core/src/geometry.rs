//! Small vector helpers on `[f64; 3]` shared across modules.

/// Compute squared distance between two 3D points.
#[inline(always)]
pub fn distance_squared(p1: &[f64; 3], p2: &[f64; 3]) -> f64 {
    let dx = p1[0] - p2[0];
    let dy = p1[1] - p2[1];
    let dz = p1[2] - p2[2];
    dx * dx + dy * dy + dz * dz
}

#[inline(always)]
pub fn sub(a: &[f64; 3], b: &[f64; 3]) -> [f64; 3] {
    [a[0] - b[0], a[1] - b[1], a[2] - b[2]]
}

#[inline(always)]
pub fn add(a: &[f64; 3], b: &[f64; 3]) -> [f64; 3] {
    [a[0] + b[0], a[1] + b[1], a[2] + b[2]]
}

#[inline(always)]
pub fn dot(a: &[f64; 3], b: &[f64; 3]) -> f64 {
    a[0] * b[0] + a[1] * b[1] + a[2] * b[2]
}

/// Row-major 3x3 matrix times vector.
#[inline(always)]
pub fn mat_vec(m: &[[f64; 3]; 3], v: &[f64; 3]) -> [f64; 3] {
    [
        m[0][0] * v[0] + m[0][1] * v[1] + m[0][2] * v[2],
        m[1][0] * v[0] + m[1][1] * v[1] + m[1][2] * v[2],
        m[2][0] * v[0] + m[2][1] * v[1] + m[2][2] * v[2],
    ]
}

/// Compute centroid of a set of 3D points.
#[inline]
pub fn compute_centroid(points: &[[f64; 3]]) -> [f64; 3] {
    if points.is_empty() {
        return [0.0; 3];
    }
    let n = points.len() as f64;
    let mut sum = [0.0; 3];
    for p in points {
        sum[0] += p[0];
        sum[1] += p[1];
        sum[2] += p[2];
    }
    [sum[0] / n, sum[1] / n, sum[2] / n]
}

/// Weighted centroid. Falls back to the plain centroid when `weights` is `None`.
///
/// The caller guarantees `weights.len() == points.len()` and a positive sum.
#[inline]
pub fn weighted_centroid(points: &[[f64; 3]], weights: Option<&[f64]>) -> [f64; 3] {
    let Some(w) = weights else {
        return compute_centroid(points);
    };
    let mut sum = [0.0; 3];
    let mut total = 0.0;
    for (p, &wi) in points.iter().zip(w) {
        sum[0] += wi * p[0];
        sum[1] += wi * p[1];
        sum[2] += wi * p[2];
        total += wi;
    }
    [sum[0] / total, sum[1] / total, sum[2] / total]
}

/// Plain RMSD between two matched point sets, without any fitting.
///
/// Returns 0.0 for empty input; the caller checks that lengths agree.
pub fn rmsd(a: &[[f64; 3]], b: &[[f64; 3]]) -> f64 {
    if a.is_empty() {
        return 0.0;
    }
    let sum: f64 = a.iter().zip(b).map(|(p, q)| distance_squared(p, q)).sum();
    (sum / a.len() as f64).sqrt()
}
