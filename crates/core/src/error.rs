//! Error and warning types shared by the superposition solver and the unfolder.

use thiserror::Error;

/// Fatal conditions. Any of these aborts processing of the affected fragment.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum Error {
    /// Too few points, mismatched lengths or unusable weights for a superposition.
    #[error("degenerate input: {0}")]
    DegenerateInput(String),

    /// The cell edge vectors span no (or negative) volume, or are not finite.
    #[error("invalid cell geometry: {detail} (volume {volume})")]
    InvalidGeometry {
        /// Signed volume of the rejected cell.
        volume: f64,
        /// Description of the problem.
        detail: String,
    },

    /// Frame indices are not strictly increasing.
    #[error("frame index {current} does not follow {previous}: indices must be strictly increasing")]
    NonMonotonicIndex {
        /// Index of the frame processed before.
        previous: u64,
        /// Offending index.
        current: u64,
    },

    /// Atom counts (or other per-frame array lengths) disagree.
    #[error("shape mismatch: expected {expected}, got {found} ({context})")]
    ShapeMismatch {
        expected: usize,
        found: usize,
        context: &'static str,
    },
}

pub type Result<T> = std::result::Result<T, Error>;

/// Non-fatal numeric conditions, recorded next to a result instead of raised.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum NumericWarning {
    /// The cross-covariance matrix is close to rank one; the rotation about
    /// the near-degenerate axis is poorly determined.
    NearSingularCovariance {
        /// Ratio of the second to the largest singular value.
        condition: f64,
    },
}

impl std::fmt::Display for NumericWarning {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            NumericWarning::NearSingularCovariance { condition } => write!(
                f,
                "near-singular covariance (s2/s1 = {:.3e}); rotation may be poorly determined",
                condition
            ),
        }
    }
}
