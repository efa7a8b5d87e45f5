//! Error type for the trajectory analyses.

use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Error)]
pub enum AnalysisError {
    /// Invalid input trajectory (ordering, shapes, geometry).
    #[error(transparent)]
    Core(#[from] mdunfold_core::Error),

    #[error("need at least {needed} frames, got {found}")]
    InsufficientFrames { needed: usize, found: usize },

    #[error("invalid parameter: {0}")]
    InvalidParameter(String),
}

pub type Result<T> = std::result::Result<T, AnalysisError>;
