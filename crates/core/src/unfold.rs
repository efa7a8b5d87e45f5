//! Periodic boundary unfolding for trajectory continuity.
//!
//! Each fragment carries an [`UnfoldState`] owned by the caller. Frames are
//! fed one at a time through [`Unfolder::step`]; the state accumulates the
//! integer lattice shift that turns wrapped coordinates into a continuous
//! path. Fragments never share state, so many of them can be unfolded
//! concurrently (see [`unfold_fragments`] and [`unfold_system`]).

use rayon::prelude::*;

use crate::cell::CellGeometry;
use crate::error::{Error, Result};
use crate::frame::{check_order, Frame, Trajectory};
use crate::geometry::{add, distance_squared, sub, weighted_centroid};
use crate::superpose::{check_weights, solve_with, SolverConfig, Superposition, MIN_POINTS};

/// What the half-cell wrap test is applied to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum WrapPolicy {
    /// Every atom is tested and shifted on its own.
    #[default]
    PerAtom,
    /// The (weighted) centroid is tested; the whole fragment shifts together.
    Centroid,
    /// Like `Centroid`, but each frame is first superposed onto the previous
    /// corrected frame, so only the rotation-free translation is tested and
    /// the frame-to-frame rotation is reported. Always makes the fragment
    /// whole, so atoms may swing further than half a cell between frames.
    RigidBody,
}

/// Unfolding configuration.
#[derive(Debug, Clone, Default)]
pub struct UnfoldConfig {
    pub policy: WrapPolicy,
    /// Per-atom weights (e.g. masses) for the centroid and the superposition.
    pub weights: Option<Vec<f64>>,
    /// Image every atom next to an anchor atom before the fragment-level
    /// test. Used by `Centroid`; `RigidBody` always does it.
    pub make_whole: bool,
    pub solver: SolverConfig,
}

impl UnfoldConfig {
    pub fn with_policy(mut self, policy: WrapPolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn with_weights(mut self, weights: Vec<f64>) -> Self {
        self.weights = Some(weights);
        self
    }

    pub fn with_make_whole(mut self, make_whole: bool) -> Self {
        self.make_whole = make_whole;
        self
    }

    pub fn with_solver(mut self, solver: SolverConfig) -> Self {
        self.solver = solver;
        self
    }
}

/// Sequential state of one fragment.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct UnfoldState {
    last_index: Option<u64>,
    last_corrected: Vec<[f64; 3]>,
    /// Total lattice shift applied to each atom in the last frame.
    image_shifts: Vec<[i64; 3]>,
}

impl UnfoldState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn last_index(&self) -> Option<u64> {
        self.last_index
    }

    pub fn last_corrected(&self) -> &[[f64; 3]] {
        &self.last_corrected
    }

    pub fn image_shifts(&self) -> &[[i64; 3]] {
        &self.image_shifts
    }

    /// Forget everything; the next frame is treated as the first one.
    pub fn reset(&mut self) {
        *self = Self::default();
    }
}

/// Result of one unfold step.
#[derive(Debug, Clone, PartialEq)]
pub struct UnfoldedFrame {
    /// Corrected frame (same index, time and cell as the input).
    pub frame: Frame,
    /// Lattice shift applied to each atom.
    pub shifts: Vec<[i64; 3]>,
    /// Number of atoms whose lattice shift changed in this step.
    pub crossings: usize,
    /// Superposition of the previous corrected frame onto this one
    /// (`RigidBody` only, absent for the first frame).
    pub superposition: Option<Superposition>,
}

#[derive(Debug, Clone, Default)]
pub struct Unfolder {
    config: UnfoldConfig,
}

impl Unfolder {
    pub fn new(config: UnfoldConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &UnfoldConfig {
        &self.config
    }

    /// Advance `state` by one wrapped frame.
    pub fn step(&self, state: &mut UnfoldState, frame: &Frame) -> Result<UnfoldedFrame> {
        check_order(state.last_index, frame.index())?;
        if let Some(w) = &self.config.weights {
            if w.len() != frame.n_atoms() {
                return Err(Error::ShapeMismatch {
                    expected: frame.n_atoms(),
                    found: w.len(),
                    context: "one weight per atom",
                });
            }
            check_weights(w)?;
        }

        let out = if state.last_index.is_none() {
            self.first(frame)
        } else {
            if frame.n_atoms() != state.last_corrected.len() {
                return Err(Error::ShapeMismatch {
                    expected: state.last_corrected.len(),
                    found: frame.n_atoms(),
                    context: "atom count changed between frames",
                });
            }
            match self.config.policy {
                WrapPolicy::PerAtom => self.per_atom(state, frame),
                WrapPolicy::Centroid | WrapPolicy::RigidBody => self.fragment(state, frame)?,
            }
        };

        if out.crossings > 0 {
            log::debug!(
                "frame {}: {} periodic boundary crossing(s)",
                frame.index(),
                out.crossings
            );
        }

        state.last_index = Some(frame.index());
        state.last_corrected = out.frame.positions().to_vec();
        state.image_shifts = out.shifts.clone();
        Ok(out)
    }

    fn makes_whole(&self) -> bool {
        match self.config.policy {
            WrapPolicy::PerAtom => false,
            WrapPolicy::Centroid => self.config.make_whole,
            WrapPolicy::RigidBody => true,
        }
    }

    fn first(&self, frame: &Frame) -> UnfoldedFrame {
        let mut positions = frame.positions().to_vec();
        let mut shifts = vec![[0; 3]; positions.len()];
        if self.makes_whole() {
            let centroid = weighted_centroid(&positions, self.config.weights.as_deref());
            let anchor = nearest_to(&positions, &centroid);
            make_whole(&mut positions, &mut shifts, anchor, frame.cell());
        }
        UnfoldedFrame {
            frame: frame.with_positions(positions),
            shifts,
            crossings: 0,
            superposition: None,
        }
    }

    fn per_atom(&self, state: &UnfoldState, frame: &Frame) -> UnfoldedFrame {
        let cell = frame.cell();
        let mut shifts = state.image_shifts.clone();
        let mut crossings = 0;

        let positions = frame
            .positions()
            .iter()
            .zip(&state.last_corrected)
            .zip(shifts.iter_mut())
            .map(|((curr, prev), shift)| {
                let predicted = shifted(curr, shift, cell);
                let n = cell.wrap_counts(&sub(&predicted, prev));
                if n != [0; 3] {
                    crossings += 1;
                    for axis in 0..3 {
                        shift[axis] -= n[axis];
                    }
                    shifted(curr, shift, cell)
                } else {
                    predicted
                }
            })
            .collect();

        UnfoldedFrame {
            frame: frame.with_positions(positions),
            shifts,
            crossings,
            superposition: None,
        }
    }

    fn fragment(&self, state: &UnfoldState, frame: &Frame) -> Result<UnfoldedFrame> {
        let cell = frame.cell();
        let weights = self.config.weights.as_deref();
        let previous = &state.last_corrected;
        let prev_centroid = weighted_centroid(previous, weights);

        let mut shifts = state.image_shifts.clone();
        let mut positions: Vec<[f64; 3]> = frame
            .positions()
            .iter()
            .zip(&shifts)
            .map(|(p, n)| shifted(p, n, cell))
            .collect();
        if self.makes_whole() {
            let anchor = nearest_to(previous, &prev_centroid);
            make_whole(&mut positions, &mut shifts, anchor, cell);
        }

        let mut superposition = match self.config.policy {
            WrapPolicy::RigidBody => {
                let fit = solve_with(previous, &positions, weights, &self.config.solver)?;
                if let Some(warning) = fit.warning {
                    log::warn!("frame {}: {}", frame.index(), warning);
                }
                if fit.degenerate {
                    log::warn!(
                        "frame {}: degenerate superposition, rotation about the fragment axis is arbitrary",
                        frame.index()
                    );
                }
                Some(fit)
            }
            _ => None,
        };

        // With the rotation taken about the previous centroid, the residual
        // translation of the fit is exactly this centroid displacement.
        let displacement = sub(&weighted_centroid(&positions, weights), &prev_centroid);
        let n = cell.wrap_counts(&displacement);
        if n != [0; 3] {
            if let Some(fit) = superposition.as_mut() {
                fit.translation = sub(&fit.translation, &cell.lattice_shift(&n));
            }
            for shift in shifts.iter_mut() {
                for axis in 0..3 {
                    shift[axis] -= n[axis];
                }
            }
        }
        let positions = frame
            .positions()
            .iter()
            .zip(&shifts)
            .map(|(p, n)| shifted(p, n, cell))
            .collect();

        let crossings = shifts
            .iter()
            .zip(&state.image_shifts)
            .filter(|(now, before)| now != before)
            .count();
        Ok(UnfoldedFrame {
            frame: frame.with_positions(positions),
            shifts,
            crossings,
            superposition,
        })
    }

    /// Unfold a frame sequence from a fresh state.
    pub fn unfold(&self, frames: &[Frame]) -> Result<Vec<Frame>> {
        let mut state = UnfoldState::new();
        frames
            .iter()
            .map(|f| self.step(&mut state, f).map(|out| out.frame))
            .collect()
    }

    pub fn unfold_trajectory(&self, trajectory: &Trajectory) -> Result<Trajectory> {
        Trajectory::new(self.unfold(trajectory.frames())?)
    }

    /// Lazy form of [`Unfolder::unfold`]. The iterator stops after the first error.
    pub fn iter<I>(&self, frames: I) -> UnfoldIter<'_, I::IntoIter>
    where
        I: IntoIterator<Item = Frame>,
    {
        UnfoldIter {
            unfolder: self,
            frames: frames.into_iter(),
            state: UnfoldState::new(),
            failed: false,
        }
    }
}

#[inline]
fn shifted(p: &[f64; 3], n: &[i64; 3], cell: &CellGeometry) -> [f64; 3] {
    if *n == [0; 3] {
        *p
    } else {
        add(p, &cell.lattice_shift(n))
    }
}

/// Image every atom next to `positions[anchor]`, updating its lattice shift.
///
/// Atoms already within half a cell of the anchor are left bit-for-bit alone.
fn make_whole(positions: &mut [[f64; 3]], shifts: &mut [[i64; 3]], anchor: usize, cell: &CellGeometry) {
    let Some(&reference) = positions.get(anchor) else {
        return;
    };
    for (p, shift) in positions.iter_mut().zip(shifts.iter_mut()) {
        let n = cell.wrap_counts(&sub(p, &reference));
        if n != [0; 3] {
            *p = sub(p, &cell.lattice_shift(&n));
            for axis in 0..3 {
                shift[axis] -= n[axis];
            }
        }
    }
}

/// Index of the point closest to `target` (the first one on ties).
fn nearest_to(points: &[[f64; 3]], target: &[f64; 3]) -> usize {
    let mut best = 0;
    let mut best_d2 = f64::INFINITY;
    for (i, p) in points.iter().enumerate() {
        let d2 = distance_squared(p, target);
        if d2 < best_d2 {
            best = i;
            best_d2 = d2;
        }
    }
    best
}

/// Iterator returned by [`Unfolder::iter`].
pub struct UnfoldIter<'a, I> {
    unfolder: &'a Unfolder,
    frames: I,
    state: UnfoldState,
    failed: bool,
}

impl<'a, I> UnfoldIter<'a, I> {
    pub fn state(&self) -> &UnfoldState {
        &self.state
    }
}

impl<'a, I: Iterator<Item = Frame>> Iterator for UnfoldIter<'a, I> {
    type Item = Result<UnfoldedFrame>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.failed {
            return None;
        }
        let frame = self.frames.next()?;
        let out = self.unfolder.step(&mut self.state, &frame);
        self.failed = out.is_err();
        Some(out)
    }
}

/// Unfold independent fragments in parallel. A failing fragment does not
/// affect the others.
pub fn unfold_fragments(unfolder: &Unfolder, fragments: &[Trajectory]) -> Vec<Result<Trajectory>> {
    let results: Vec<Result<Trajectory>> = fragments
        .par_iter()
        .map(|traj| unfolder.unfold_trajectory(traj))
        .collect();
    let failed = results.iter().filter(|r| r.is_err()).count();
    log::info!(
        "unfolded {} fragment(s), {} failed",
        fragments.len() - failed,
        failed
    );
    results
}

/// Split a whole-system trajectory into fragments by per-atom fragment id.
///
/// Returns the fragments ordered by id and, for each, the system atom indices
/// it holds.
pub fn split_fragments(
    trajectory: &Trajectory,
    fragment_ids: &[usize],
) -> Result<(Vec<Trajectory>, Vec<Vec<usize>>)> {
    if fragment_ids.len() != trajectory.n_atoms() {
        return Err(Error::ShapeMismatch {
            expected: trajectory.n_atoms(),
            found: fragment_ids.len(),
            context: "one fragment id per atom",
        });
    }

    let mut ids: Vec<usize> = fragment_ids.to_vec();
    ids.sort_unstable();
    ids.dedup();
    let members: Vec<Vec<usize>> = ids
        .iter()
        .map(|&id| {
            fragment_ids
                .iter()
                .enumerate()
                .filter(|&(_, &f)| f == id)
                .map(|(atom, _)| atom)
                .collect()
        })
        .collect();

    let fragments = members
        .iter()
        .map(|atoms| {
            let frames = trajectory
                .iter()
                .map(|f| {
                    let pos = atoms.iter().map(|&a| f.positions()[a]).collect();
                    f.with_positions(pos)
                })
                .collect();
            Trajectory::new(frames)
        })
        .collect::<Result<Vec<_>>>()?;

    Ok((fragments, members))
}

/// Unfold every fragment of a system in parallel and reassemble the system.
///
/// Per-atom weights in the unfolder config are interpreted per system atom
/// and sliced for each fragment. Under `RigidBody`, fragments too small to
/// superpose (single ions, diatomics) use the `Centroid` test instead.
pub fn unfold_system(
    trajectory: &Trajectory,
    fragment_ids: &[usize],
    config: &UnfoldConfig,
) -> Result<Trajectory> {
    if let Some(w) = &config.weights {
        if w.len() != trajectory.n_atoms() {
            return Err(Error::ShapeMismatch {
                expected: trajectory.n_atoms(),
                found: w.len(),
                context: "one weight per system atom",
            });
        }
    }
    let (fragments, members) = split_fragments(trajectory, fragment_ids)?;

    let unfolded = fragments
        .par_iter()
        .zip(members.par_iter())
        .map(|(fragment, atoms)| {
            let mut cfg = config.clone();
            cfg.weights = config
                .weights
                .as_ref()
                .map(|w| atoms.iter().map(|&a| w[a]).collect());
            if cfg.policy == WrapPolicy::RigidBody && atoms.len() < MIN_POINTS {
                cfg.policy = WrapPolicy::Centroid;
                cfg.make_whole = true;
            }
            Unfolder::new(cfg).unfold_trajectory(fragment)
        })
        .collect::<Result<Vec<_>>>()?;

    let n_atoms = trajectory.n_atoms();
    let frames = trajectory
        .iter()
        .enumerate()
        .map(|(f, frame)| {
            let mut positions = vec![[0.0; 3]; n_atoms];
            for (fragment, atoms) in unfolded.iter().zip(&members) {
                let src = fragment.frames()[f].positions();
                for (k, &a) in atoms.iter().enumerate() {
                    positions[a] = src[k];
                }
            }
            frame.with_positions(positions)
        })
        .collect();
    Trajectory::new(frames)
}
