//! Direct-sum time-correlation functions over unfolded frame streams.
//!
//! C(k) = < a(t) · b(t + k) >, averaged over time origins t and over the
//! vectors held in each frame. Rotational correlations use Legendre
//! polynomials of the angle between unit vectors at t and t + k.

use rayon::prelude::*;

use mdunfold_core::geometry::dot;
use mdunfold_core::UnfoldedFrame;

use crate::error::{AnalysisError, Result};

/// Legendre polynomial order for rotational correlation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LegendreOrder {
    #[default]
    P1,
    P2,
}

impl LegendreOrder {
    #[inline]
    pub fn eval(self, x: f64) -> f64 {
        match self {
            LegendreOrder::P1 => x,
            LegendreOrder::P2 => 1.5 * x * x - 0.5,
        }
    }
}

#[derive(Debug, Clone)]
pub struct CorrelationConfig {
    /// Largest lag in frames. Default: `n_frames - 1`.
    pub max_lag: Option<usize>,
    pub origin_stride: usize,
    /// Divide by C(0).
    pub normalize: bool,
    /// Time between consecutive frames.
    pub dt: f64,
}

impl Default for CorrelationConfig {
    fn default() -> Self {
        Self {
            max_lag: None,
            origin_stride: 1,
            normalize: false,
            dt: 1.0,
        }
    }
}

impl CorrelationConfig {
    pub fn with_max_lag(mut self, max_lag: usize) -> Self {
        self.max_lag = Some(max_lag);
        self
    }

    pub fn with_origin_stride(mut self, stride: usize) -> Self {
        self.origin_stride = stride;
        self
    }

    pub fn with_normalize(mut self, normalize: bool) -> Self {
        self.normalize = normalize;
        self
    }

    pub fn with_dt(mut self, dt: f64) -> Self {
        self.dt = dt;
        self
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Correlation {
    pub times: Vec<f64>,
    pub values: Vec<f64>,
    pub counts: Vec<usize>,
}

impl Correlation {
    /// Trapezoidal integral of the correlation over the whole lag range.
    pub fn integral(&self) -> f64 {
        self.times
            .windows(2)
            .zip(self.values.windows(2))
            .map(|(t, c)| 0.5 * (t[1] - t[0]) * (c[0] + c[1]))
            .sum()
    }
}

fn check_series(a: &[Vec<[f64; 3]>], b: &[Vec<[f64; 3]>], config: &CorrelationConfig) -> Result<usize> {
    if a.is_empty() {
        return Err(AnalysisError::InsufficientFrames { needed: 1, found: 0 });
    }
    if a.len() != b.len() {
        return Err(AnalysisError::InvalidParameter(format!(
            "series differ in length ({} vs {} frames)",
            a.len(),
            b.len()
        )));
    }
    let width = a[0].len();
    if a.iter().chain(b).any(|f| f.len() != width) || width == 0 {
        return Err(AnalysisError::InvalidParameter(
            "every frame must hold the same, non-zero number of vectors".to_string(),
        ));
    }
    if config.origin_stride == 0 {
        return Err(AnalysisError::InvalidParameter(
            "origin_stride must be at least 1".to_string(),
        ));
    }
    if !(config.dt > 0.0) {
        return Err(AnalysisError::InvalidParameter(format!(
            "dt must be positive, got {}",
            config.dt
        )));
    }
    Ok(config.max_lag.unwrap_or(a.len() - 1).min(a.len() - 1))
}

fn correlate<F>(
    a: &[Vec<[f64; 3]>],
    b: &[Vec<[f64; 3]>],
    config: &CorrelationConfig,
    kernel: F,
) -> Result<Correlation>
where
    F: Fn(&[f64; 3], &[f64; 3]) -> f64 + Sync,
{
    let max_lag = check_series(a, b, config)?;
    let n_frames = a.len();
    let width = a[0].len();

    let per_lag: Vec<(f64, usize)> = (0..=max_lag)
        .into_par_iter()
        .map(|lag| {
            let mut sum = 0.0;
            let mut samples = 0usize;
            for t0 in (0..n_frames - lag).step_by(config.origin_stride) {
                for (u, v) in a[t0].iter().zip(&b[t0 + lag]) {
                    sum += kernel(u, v);
                }
                samples += width;
            }
            (sum / samples as f64, samples)
        })
        .collect();

    let mut values: Vec<f64> = per_lag.iter().map(|r| r.0).collect();
    if config.normalize {
        let c0 = values[0];
        if c0 == 0.0 {
            return Err(AnalysisError::InvalidParameter(
                "cannot normalise: C(0) is zero".to_string(),
            ));
        }
        for v in &mut values {
            *v /= c0;
        }
    }

    Ok(Correlation {
        times: (0..=max_lag).map(|k| k as f64 * config.dt).collect(),
        values,
        counts: per_lag.iter().map(|r| r.1).collect(),
    })
}

/// Cross-correlation `< a(t) · b(t + k) >`. Pass the same series twice for
/// an autocorrelation.
pub fn time_correlation(
    a: &[Vec<[f64; 3]>],
    b: &[Vec<[f64; 3]>],
    config: &CorrelationConfig,
) -> Result<Correlation> {
    correlate(a, b, config, |u, v| dot(u, v))
}

pub fn autocorrelation(series: &[Vec<[f64; 3]>], config: &CorrelationConfig) -> Result<Correlation> {
    time_correlation(series, series, config)
}

/// `< P_l(u(t) · u(t + k)) >` for unit vectors `u`. Zero-length vectors are rejected.
pub fn rotational_correlation(
    vectors: &[Vec<[f64; 3]>],
    order: LegendreOrder,
    config: &CorrelationConfig,
) -> Result<Correlation> {
    let units = vectors
        .iter()
        .map(|frame| frame.iter().map(unit).collect::<Result<Vec<_>>>())
        .collect::<Result<Vec<_>>>()?;
    correlate(&units, &units, config, |u, v| order.eval(dot(u, v).clamp(-1.0, 1.0)))
}

fn unit(v: &[f64; 3]) -> Result<[f64; 3]> {
    let n = dot(v, v).sqrt();
    if !(n > 0.0) {
        return Err(AnalysisError::InvalidParameter(
            "orientation vector has zero length".to_string(),
        ));
    }
    Ok([v[0] / n, v[1] / n, v[2] / n])
}

/// Follow body-fixed vectors through the frame-to-frame rotations reported
/// by rigid-body unfolding. The vectors are given in the first frame.
///
/// Returns one entry per frame, each holding the rotated vectors.
pub fn orientation_series(
    frames: &[UnfoldedFrame],
    body_vectors: &[[f64; 3]],
) -> Result<Vec<Vec<[f64; 3]>>> {
    let mut current = body_vectors.to_vec();
    let mut series = Vec::with_capacity(frames.len());
    for (i, frame) in frames.iter().enumerate() {
        if i > 0 {
            let fit = frame.superposition.as_ref().ok_or_else(|| {
                AnalysisError::InvalidParameter(format!(
                    "frame {} carries no superposition; unfold with the rigid-body policy",
                    frame.frame.index()
                ))
            })?;
            current = current.iter().map(|v| fit.rotate(v)).collect();
        }
        series.push(current.clone());
    }
    Ok(series)
}

#[cfg(test)]
mod tests {
    use super::*;
    use mdunfold_core::{CellGeometry, Frame, UnfoldConfig, UnfoldState, Unfolder, WrapPolicy};

    #[test]
    fn test_constant_series() {
        let series = vec![vec![[1.0, 2.0, 2.0]]; 10];
        let c = autocorrelation(&series, &CorrelationConfig::default()).unwrap();
        assert!(c.values.iter().all(|&v| (v - 9.0).abs() < 1e-12));
        let n = autocorrelation(&series, &CorrelationConfig::default().with_normalize(true)).unwrap();
        assert!(n.values.iter().all(|&v| (v - 1.0).abs() < 1e-12));
        assert!((n.integral() - 9.0).abs() < 1e-12);
    }

    #[test]
    fn test_alternating_sign() {
        let series: Vec<Vec<[f64; 3]>> = (0..20)
            .map(|i| vec![[if i % 2 == 0 { 1.0 } else { -1.0 }, 0.0, 0.0]])
            .collect();
        let c = autocorrelation(&series, &CorrelationConfig::default().with_max_lag(5)).unwrap();
        assert_eq!(c.values.len(), 6);
        for (k, v) in c.values.iter().enumerate() {
            let expected = if k % 2 == 0 { 1.0 } else { -1.0 };
            assert!((v - expected).abs() < 1e-12);
        }
        assert_eq!(c.counts[5], 15);
    }

    #[test]
    fn test_cross_correlation_of_delayed_copy_peaks_at_delay() {
        let signal: Vec<f64> = (0..40).map(|i| ((i * 7) % 11) as f64 - 5.0).collect();
        let a: Vec<Vec<[f64; 3]>> = signal.iter().map(|&s| vec![[s, 0.0, 0.0]]).collect();
        let b: Vec<Vec<[f64; 3]>> = (0..40)
            .map(|i| vec![[if i >= 3 { signal[i - 3] } else { 0.0 }, 0.0, 0.0]])
            .collect();
        let c = time_correlation(&a, &b, &CorrelationConfig::default().with_max_lag(8)).unwrap();
        let peak = c
            .values
            .iter()
            .enumerate()
            .max_by(|x, y| x.1.total_cmp(y.1))
            .map(|(k, _)| k)
            .unwrap();
        assert_eq!(peak, 3);
    }

    #[test]
    fn test_rejects_bad_series() {
        let a = vec![vec![[1.0, 0.0, 0.0]]; 3];
        let b = vec![vec![[1.0, 0.0, 0.0]]; 4];
        assert!(time_correlation(&a, &b, &CorrelationConfig::default()).is_err());
        let zero = vec![vec![[0.0; 3]]; 3];
        assert!(autocorrelation(&zero, &CorrelationConfig::default().with_normalize(true)).is_err());
        assert!(rotational_correlation(&zero, LegendreOrder::P1, &CorrelationConfig::default()).is_err());
        assert!(autocorrelation(&a, &CorrelationConfig::default().with_dt(0.0)).is_err());
    }

    #[test]
    fn test_rotational_correlation_of_tracked_spin() {
        let omega: f64 = 0.3;
        let cell = CellGeometry::cubic(50.0).unwrap();
        let body = [[1.0, 0.0, 0.0], [-1.0, 0.0, 0.0], [0.0, 2.0, 0.0], [0.0, -2.0, 0.0]];
        let frames: Vec<Frame> = (0..30u64)
            .map(|i| {
                let (s, c) = (omega * i as f64).sin_cos();
                let pos = body
                    .iter()
                    .map(|b| [25.0 + c * b[0] - s * b[1], 25.0 + s * b[0] + c * b[1], 25.0 + b[2]])
                    .collect();
                Frame::new(i, i as f64, pos, cell)
            })
            .collect();

        let unfolder = Unfolder::new(UnfoldConfig::default().with_policy(WrapPolicy::RigidBody));
        let mut state = UnfoldState::new();
        let unfolded: Vec<UnfoldedFrame> = frames
            .iter()
            .map(|f| unfolder.step(&mut state, f).unwrap())
            .collect();

        let series = orientation_series(&unfolded, &[[1.0, 0.0, 0.0]]).unwrap();
        let config = CorrelationConfig::default().with_max_lag(10);
        let p1 = rotational_correlation(&series, LegendreOrder::P1, &config).unwrap();
        let p2 = rotational_correlation(&series, LegendreOrder::P2, &config).unwrap();
        for k in 0..=10 {
            let cos = (omega * k as f64).cos();
            assert!((p1.values[k] - cos).abs() < 1e-9, "P1 lag {}", k);
            assert!((p2.values[k] - (1.5 * cos * cos - 0.5)).abs() < 1e-9, "P2 lag {}", k);
        }

        let plain = Unfolder::default();
        let mut state = UnfoldState::new();
        let untracked: Vec<UnfoldedFrame> = frames
            .iter()
            .map(|f| plain.step(&mut state, f).unwrap())
            .collect();
        assert!(orientation_series(&untracked, &[[1.0, 0.0, 0.0]]).is_err());
    }
}
