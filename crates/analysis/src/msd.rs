//! Mean-square displacement and Einstein-relation diffusion estimates.
//!
//! The input must already be unfolded: a wrapped trajectory gives a
//! meaningless MSD that saturates at the box size.
//!
//! D = lim_{t→∞} <|r(t) - r(0)|²> / (2 d t), d = number of Cartesian
//! dimensions included.

use rayon::prelude::*;

use mdunfold_core::Trajectory;

use crate::error::{AnalysisError, Result};

/// MSD options.
#[derive(Debug, Clone)]
pub struct MsdConfig {
    /// Largest lag in frames. Default: `n_frames - 1`.
    pub max_lag: Option<usize>,
    /// Spacing between time origins, in frames.
    pub origin_stride: usize,
    /// Cartesian components to include (x, y, z).
    pub dimensions: [bool; 3],
    /// Atom subset. Default: all atoms.
    pub atoms: Option<Vec<usize>>,
}

impl Default for MsdConfig {
    fn default() -> Self {
        Self {
            max_lag: None,
            origin_stride: 1,
            dimensions: [true; 3],
            atoms: None,
        }
    }
}

impl MsdConfig {
    pub fn with_max_lag(mut self, max_lag: usize) -> Self {
        self.max_lag = Some(max_lag);
        self
    }

    pub fn with_origin_stride(mut self, stride: usize) -> Self {
        self.origin_stride = stride;
        self
    }

    pub fn with_dimensions(mut self, dimensions: [bool; 3]) -> Self {
        self.dimensions = dimensions;
        self
    }

    pub fn with_atoms(mut self, atoms: Vec<usize>) -> Self {
        self.atoms = Some(atoms);
        self
    }
}

/// MSD as a function of lag.
#[derive(Debug, Clone, PartialEq)]
pub struct Msd {
    pub lags: Vec<usize>,
    /// Mean elapsed time per lag, from frame timestamps.
    pub times: Vec<f64>,
    pub values: Vec<f64>,
    /// Number of (origin, atom) samples behind each value.
    pub counts: Vec<usize>,
    /// Number of Cartesian components summed into each value.
    pub n_dimensions: usize,
}

/// Linear fit `MSD = slope · t + intercept` and the derived coefficient.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DiffusionFit {
    pub coefficient: f64,
    pub slope: f64,
    pub intercept: f64,
    pub r_squared: f64,
    pub n_points: usize,
}

/// Lag range (inclusive) used for the linear fit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FitWindow {
    pub start_lag: usize,
    pub end_lag: usize,
}

impl FitWindow {
    /// Skip the ballistic start and the noisy tail: middle 10%..50% of the lags.
    pub fn default_for(max_lag: usize) -> Self {
        Self {
            start_lag: (max_lag / 10).max(1),
            end_lag: (max_lag / 2).max(2),
        }
    }
}

pub fn mean_squared_displacement(trajectory: &Trajectory, config: &MsdConfig) -> Result<Msd> {
    let n_frames = trajectory.len();
    if n_frames < 2 {
        return Err(AnalysisError::InsufficientFrames {
            needed: 2,
            found: n_frames,
        });
    }
    if config.origin_stride == 0 {
        return Err(AnalysisError::InvalidParameter(
            "origin_stride must be at least 1".to_string(),
        ));
    }
    let n_dimensions = config.dimensions.iter().filter(|&&d| d).count();
    if n_dimensions == 0 {
        return Err(AnalysisError::InvalidParameter(
            "at least one dimension must be selected".to_string(),
        ));
    }

    let n_atoms = trajectory.n_atoms();
    let atoms: Vec<usize> = match &config.atoms {
        Some(a) => {
            if let Some(&bad) = a.iter().find(|&&i| i >= n_atoms) {
                return Err(AnalysisError::InvalidParameter(format!(
                    "atom index {} out of range ({} atoms)",
                    bad, n_atoms
                )));
            }
            a.clone()
        }
        None => (0..n_atoms).collect(),
    };
    if atoms.is_empty() {
        return Err(AnalysisError::InvalidParameter("no atoms selected".to_string()));
    }

    let max_lag = config.max_lag.unwrap_or(n_frames - 1).min(n_frames - 1);
    let frames = trajectory.frames();
    let dims = config.dimensions;

    let per_lag: Vec<(f64, f64, usize)> = (0..=max_lag)
        .into_par_iter()
        .map(|lag| {
            let mut sum = 0.0;
            let mut elapsed = 0.0;
            let mut origins = 0usize;
            for t0 in (0..n_frames - lag).step_by(config.origin_stride) {
                let p0 = frames[t0].positions();
                let p1 = frames[t0 + lag].positions();
                for &a in &atoms {
                    for d in 0..3 {
                        if dims[d] {
                            let dx = p1[a][d] - p0[a][d];
                            sum += dx * dx;
                        }
                    }
                }
                elapsed += frames[t0 + lag].time() - frames[t0].time();
                origins += 1;
            }
            let samples = origins * atoms.len();
            (sum / samples as f64, elapsed / origins as f64, samples)
        })
        .collect();

    Ok(Msd {
        lags: (0..=max_lag).collect(),
        times: per_lag.iter().map(|r| r.1).collect(),
        values: per_lag.iter().map(|r| r.0).collect(),
        counts: per_lag.iter().map(|r| r.2).collect(),
        n_dimensions,
    })
}

/// Least-squares fit of MSD against time over `window`.
pub fn fit_diffusion(msd: &Msd, window: FitWindow) -> Result<DiffusionFit> {
    let last = msd.lags.len().saturating_sub(1);
    if window.start_lag >= window.end_lag || window.end_lag > last {
        return Err(AnalysisError::InvalidParameter(format!(
            "fit window {}..={} invalid for lags 0..={}",
            window.start_lag, window.end_lag, last
        )));
    }

    let xs = &msd.times[window.start_lag..=window.end_lag];
    let ys = &msd.values[window.start_lag..=window.end_lag];
    let n = xs.len() as f64;
    let mean_x = xs.iter().sum::<f64>() / n;
    let mean_y = ys.iter().sum::<f64>() / n;

    let mut sxx = 0.0;
    let mut sxy = 0.0;
    let mut syy = 0.0;
    for (x, y) in xs.iter().zip(ys) {
        let dx = x - mean_x;
        let dy = y - mean_y;
        sxx += dx * dx;
        sxy += dx * dy;
        syy += dy * dy;
    }
    if sxx <= 0.0 {
        return Err(AnalysisError::InvalidParameter(
            "fit window spans no elapsed time".to_string(),
        ));
    }

    let slope = sxy / sxx;
    let intercept = mean_y - slope * mean_x;
    let r_squared = if syy > 0.0 { sxy * sxy / (sxx * syy) } else { 1.0 };

    Ok(DiffusionFit {
        coefficient: slope / (2.0 * msd.n_dimensions as f64),
        slope,
        intercept,
        r_squared,
        n_points: xs.len(),
    })
}

/// MSD followed by a fit over the default window.
pub fn estimate_diffusion(trajectory: &Trajectory, config: &MsdConfig) -> Result<DiffusionFit> {
    let msd = mean_squared_displacement(trajectory, config)?;
    let max_lag = msd.lags.len() - 1;
    if max_lag < 2 {
        return Err(AnalysisError::InsufficientFrames {
            needed: 3,
            found: max_lag + 1,
        });
    }
    let fit = fit_diffusion(&msd, FitWindow::default_for(max_lag))?;
    log::info!(
        "diffusion coefficient {:.6e} (slope {:.6e}, r² {:.4}, {} points)",
        fit.coefficient,
        fit.slope,
        fit.r_squared,
        fit.n_points
    );
    Ok(fit)
}
