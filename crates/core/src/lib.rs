//! Core library for mdunfold.
//!
//! Pure Rust implementations with no Python dependencies: optimal rigid-body
//! superposition, periodic cell geometry, frame and trajectory types, and
//! periodic-boundary unfolding of per-fragment trajectories.

pub mod cell;
pub mod error;
pub mod frame;
pub mod geometry;
pub mod superpose;
pub mod unfold;

pub use cell::CellGeometry;
pub use error::{Error, NumericWarning, Result};
pub use frame::{Frame, InMemorySource, Trajectory, TrajectorySource};
pub use superpose::{solve, solve_with, superpose_trajectory, SolverConfig, Superposition};
pub use unfold::{
    split_fragments, unfold_fragments, unfold_system, UnfoldConfig, UnfoldIter, UnfoldState,
    UnfoldedFrame, Unfolder, WrapPolicy,
};
