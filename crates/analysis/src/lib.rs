//! Trajectory analyses that consume unfolded frame streams.
//!
//! Provides the mean-square-displacement diffusion estimator and direct-sum
//! time-correlation functions, including rotational correlations driven by
//! rigid-body unfolding.

pub mod correl;
pub mod error;
pub mod msd;

pub use correl::{
    autocorrelation, orientation_series, rotational_correlation, time_correlation, Correlation,
    CorrelationConfig, LegendreOrder,
};
pub use error::{AnalysisError, Result};
pub use msd::{
    estimate_diffusion, fit_diffusion, mean_squared_displacement, DiffusionFit, FitWindow, Msd,
    MsdConfig,
};
