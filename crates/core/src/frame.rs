//! Frames, validated trajectories and the frame-source seam.

use crate::cell::CellGeometry;
use crate::error::{Error, Result};

/// One sampled configuration of a fragment. Immutable once built.
#[derive(Debug, Clone, PartialEq)]
pub struct Frame {
    index: u64,
    time: f64,
    positions: Vec<[f64; 3]>,
    cell: CellGeometry,
}

impl Frame {
    pub fn new(index: u64, time: f64, positions: Vec<[f64; 3]>, cell: CellGeometry) -> Self {
        Self {
            index,
            time,
            positions,
            cell,
        }
    }

    pub fn index(&self) -> u64 {
        self.index
    }

    pub fn time(&self) -> f64 {
        self.time
    }

    pub fn positions(&self) -> &[[f64; 3]] {
        &self.positions
    }

    pub fn cell(&self) -> &CellGeometry {
        &self.cell
    }

    pub fn n_atoms(&self) -> usize {
        self.positions.len()
    }

    /// Same index, time and cell with new coordinates.
    pub fn with_positions(&self, positions: Vec<[f64; 3]>) -> Self {
        Self {
            index: self.index,
            time: self.time,
            positions,
            cell: self.cell,
        }
    }

    pub fn into_positions(self) -> Vec<[f64; 3]> {
        self.positions
    }
}

/// Check that `current` may follow `previous`.
pub fn check_order(previous: Option<u64>, current: u64) -> Result<()> {
    match previous {
        Some(previous) if current <= previous => Err(Error::NonMonotonicIndex { previous, current }),
        _ => Ok(()),
    }
}

/// Frames of one fragment with strictly increasing indices and a constant
/// atom count.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Trajectory {
    frames: Vec<Frame>,
}

impl Trajectory {
    pub fn new(frames: Vec<Frame>) -> Result<Self> {
        let mut previous = None;
        for frame in &frames {
            check_order(previous, frame.index())?;
            previous = Some(frame.index());
            let expected = frames[0].n_atoms();
            if frame.n_atoms() != expected {
                return Err(Error::ShapeMismatch {
                    expected,
                    found: frame.n_atoms(),
                    context: "atom count changes within trajectory",
                });
            }
        }
        Ok(Self { frames })
    }

    /// Build a trajectory from raw coordinates with frame index = position in
    /// the slice and `time = index * dt`.
    pub fn from_coordinates(
        coordinates: Vec<Vec<[f64; 3]>>,
        cells: &[CellGeometry],
        dt: f64,
    ) -> Result<Self> {
        if cells.len() != coordinates.len() {
            return Err(Error::ShapeMismatch {
                expected: coordinates.len(),
                found: cells.len(),
                context: "one cell per frame",
            });
        }
        let frames = coordinates
            .into_iter()
            .zip(cells)
            .enumerate()
            .map(|(i, (positions, cell))| Frame::new(i as u64, i as f64 * dt, positions, *cell))
            .collect();
        Self::new(frames)
    }

    /// Drain a frame source into a validated trajectory.
    pub fn read_from<S: TrajectorySource + ?Sized>(source: &mut S) -> Result<Self> {
        let mut frames = Vec::new();
        while let Some(frame) = source.read_frame()? {
            frames.push(frame);
        }
        Self::new(frames)
    }

    pub fn frames(&self) -> &[Frame] {
        &self.frames
    }

    pub fn len(&self) -> usize {
        self.frames.len()
    }

    pub fn is_empty(&self) -> bool {
        self.frames.is_empty()
    }

    pub fn n_atoms(&self) -> usize {
        self.frames.first().map_or(0, Frame::n_atoms)
    }

    pub fn iter(&self) -> std::slice::Iter<'_, Frame> {
        self.frames.iter()
    }

    pub fn into_frames(self) -> Vec<Frame> {
        self.frames
    }

    /// Coordinates of one atom across all frames.
    pub fn atom_path(&self, atom: usize) -> Result<Vec<[f64; 3]>> {
        if atom >= self.n_atoms() {
            return Err(Error::ShapeMismatch {
                expected: atom + 1,
                found: self.n_atoms(),
                context: "atom index out of range",
            });
        }
        Ok(self.frames.iter().map(|f| f.positions()[atom]).collect())
    }
}

impl<'a> IntoIterator for &'a Trajectory {
    type Item = &'a Frame;
    type IntoIter = std::slice::Iter<'a, Frame>;

    fn into_iter(self) -> Self::IntoIter {
        self.frames.iter()
    }
}

/// Producer of frames in increasing index order (file readers, simulations).
pub trait TrajectorySource {
    /// Read the next frame. Returns `Ok(None)` at the end of the trajectory.
    fn read_frame(&mut self) -> Result<Option<Frame>>;
}

/// Frame source over frames already held in memory.
#[derive(Debug, Clone)]
pub struct InMemorySource {
    frames: std::vec::IntoIter<Frame>,
}

impl InMemorySource {
    pub fn new(frames: Vec<Frame>) -> Self {
        Self {
            frames: frames.into_iter(),
        }
    }
}

impl TrajectorySource for InMemorySource {
    fn read_frame(&mut self) -> Result<Option<Frame>> {
        Ok(self.frames.next())
    }
}
