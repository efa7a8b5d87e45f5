#![allow(clippy::useless_conversion)]
#![allow(clippy::too_many_arguments)]

use ndarray::{Array2, Array3};
use numpy::{
    PyArray1, PyArray2, PyArray3, PyArrayDescrMethods, PyReadonlyArray1, PyReadonlyArray2,
    PyReadonlyArray3, PyUntypedArrayMethods, ToPyArray,
};
use pyo3::exceptions::PyValueError;
use pyo3::prelude::*;
use pyo3::types::PyDict;

use mdunfold_core::{
    solve, superpose_trajectory, unfold_system, CellGeometry, Frame, Superposition, Trajectory,
    UnfoldConfig, UnfoldState, Unfolder, WrapPolicy,
};

use mdunfold_analysis::correl::{self, CorrelationConfig, LegendreOrder};
use mdunfold_analysis::msd::{self, FitWindow, MsdConfig};

// ============================================================================
// Helpers: numpy <-> coordinate vectors
// ============================================================================

fn array3_to_trajectory(arr: &ndarray::ArrayView3<f64>) -> Vec<Vec<[f64; 3]>> {
    let n_frames = arr.shape()[0];
    let n_atoms = arr.shape()[1];
    let mut traj = Vec::with_capacity(n_frames);
    for i in 0..n_frames {
        let mut frame = Vec::with_capacity(n_atoms);
        for j in 0..n_atoms {
            frame.push([arr[[i, j, 0]], arr[[i, j, 1]], arr[[i, j, 2]]]);
        }
        traj.push(frame);
    }
    traj
}

fn trajectory_to_array3(traj: &[Vec<[f64; 3]>]) -> Array3<f64> {
    let n_frames = traj.len();
    let n_atoms = if n_frames > 0 { traj[0].len() } else { 0 };
    let mut result = Array3::<f64>::zeros((n_frames, n_atoms, 3));
    for (i, frame) in traj.iter().enumerate() {
        for (j, atom) in frame.iter().enumerate() {
            result[[i, j, 0]] = atom[0];
            result[[i, j, 1]] = atom[1];
            result[[i, j, 2]] = atom[2];
        }
    }
    result
}

fn array2_to_coords(arr: &ndarray::ArrayView2<f64>) -> PyResult<Vec<[f64; 3]>> {
    if arr.shape()[1] != 3 {
        return Err(PyValueError::new_err(format!(
            "expected coordinates of shape (n, 3), got (n, {})",
            arr.shape()[1]
        )));
    }
    let n = arr.shape()[0];
    Ok((0..n)
        .map(|i| [arr[[i, 0]], arr[[i, 1]], arr[[i, 2]]])
        .collect())
}

fn matrix_to_array2(m: &[[f64; 3]; 3]) -> Array2<f64> {
    Array2::from_shape_fn((3, 3), |(i, j)| m[i][j])
}

fn to_py_err<E: std::fmt::Display>(e: E) -> PyErr {
    PyValueError::new_err(e.to_string())
}

/// Per-frame cells from either `(n_frames, 3)` orthorhombic edge lengths or
/// `(n_frames, 6)` records `[a, b, c, alpha, beta, gamma]` (degrees).
fn boxes_to_cells(boxes: &ndarray::ArrayView2<f64>, n_frames: usize) -> PyResult<Vec<CellGeometry>> {
    if boxes.shape()[0] != n_frames {
        return Err(PyValueError::new_err(format!(
            "box_dimensions has {} rows for {} frames",
            boxes.shape()[0],
            n_frames
        )));
    }
    (0..n_frames)
        .map(|i| match boxes.shape()[1] {
            3 => CellGeometry::orthorhombic([boxes[[i, 0]], boxes[[i, 1]], boxes[[i, 2]]]),
            6 => CellGeometry::from_lengths_angles([
                boxes[[i, 0]],
                boxes[[i, 1]],
                boxes[[i, 2]],
                boxes[[i, 3]],
                boxes[[i, 4]],
                boxes[[i, 5]],
            ]),
            n => {
                return Err(PyValueError::new_err(format!(
                    "box_dimensions must have 3 or 6 columns, got {}",
                    n
                )))
            }
        }
        .map_err(to_py_err))
        .collect()
}

fn parse_policy(policy: &str) -> PyResult<WrapPolicy> {
    match policy {
        "per_atom" | "atom" => Ok(WrapPolicy::PerAtom),
        "centroid" | "molecule" => Ok(WrapPolicy::Centroid),
        "rigid_body" | "rigid" => Ok(WrapPolicy::RigidBody),
        other => Err(PyValueError::new_err(format!(
            "unknown policy '{}': expected 'per_atom', 'centroid' or 'rigid_body'",
            other
        ))),
    }
}

/// Analyses only read unfolded coordinates, so any valid cell will do.
fn coords_to_trajectory(coords: Vec<Vec<[f64; 3]>>, dt: f64) -> PyResult<Trajectory> {
    let cell = CellGeometry::cubic(1.0).map_err(to_py_err)?;
    let cells = vec![cell; coords.len()];
    Trajectory::from_coordinates(coords, &cells, dt).map_err(to_py_err)
}

fn superposition_to_dict<'py>(py: Python<'py>, fit: &Superposition) -> PyResult<Bound<'py, PyDict>> {
    let result = PyDict::new_bound(py);
    result.set_item("rotation", matrix_to_array2(&fit.rotation).to_pyarray_bound(py))?;
    result.set_item("translation", PyArray1::from_slice_bound(py, &fit.translation))?;
    result.set_item("rmsd", fit.rmsd)?;
    result.set_item("degenerate", fit.degenerate)?;
    result.set_item("warning", fit.warning.as_ref().map(|w| w.to_string()))?;
    Ok(result)
}

// ============================================================================
// SUPERPOSITION
// ============================================================================

/// Optimal proper rotation and translation with `candidate ≈ R · reference + t`.
#[pyfunction]
#[pyo3(signature = (reference, candidate, weights=None))]
fn superpose<'py>(
    py: Python<'py>,
    reference: PyReadonlyArray2<'py, f64>,
    candidate: PyReadonlyArray2<'py, f64>,
    weights: Option<PyReadonlyArray1<'py, f64>>,
) -> PyResult<Bound<'py, PyDict>> {
    let ref_vec = array2_to_coords(&reference.as_array())?;
    let cand_vec = array2_to_coords(&candidate.as_array())?;
    let weight_vec: Option<Vec<f64>> = weights.map(|w| w.as_array().iter().copied().collect());

    let fit = solve(&ref_vec, &cand_vec, weight_vec.as_deref()).map_err(to_py_err)?;
    superposition_to_dict(py, &fit)
}

/// Superpose every frame of a trajectory onto a reference structure.
#[pyfunction]
#[pyo3(name = "superpose_trajectory", signature = (trajectory, reference, align_indices, weights=None))]
fn superpose_trajectory_py<'py>(
    py: Python<'py>,
    trajectory: PyReadonlyArray3<'py, f64>,
    reference: PyReadonlyArray2<'py, f64>,
    align_indices: PyReadonlyArray1<'py, i64>,
    weights: Option<PyReadonlyArray1<'py, f64>>,
) -> PyResult<Bound<'py, PyArray3<f64>>> {
    let traj_vec = array3_to_trajectory(&trajectory.as_array());
    let ref_vec = array2_to_coords(&reference.as_array())?;
    let align_idx = indices_from_array(&align_indices)?;
    let weight_vec: Option<Vec<f64>> = weights.map(|w| w.as_array().iter().copied().collect());

    let aligned = py
        .allow_threads(|| {
            superpose_trajectory(&traj_vec, &ref_vec, &align_idx, weight_vec.as_deref())
        })
        .map_err(to_py_err)?;

    Ok(trajectory_to_array3(&aligned).to_pyarray_bound(py))
}

fn indices_from_array(arr: &PyReadonlyArray1<'_, i64>) -> PyResult<Vec<usize>> {
    arr.as_array()
        .iter()
        .map(|&i| {
            usize::try_from(i).map_err(|_| PyValueError::new_err(format!("negative index {}", i)))
        })
        .collect()
}

// ============================================================================
// UNFOLDING
// ============================================================================

/// Remove periodic wrapping from a trajectory.
///
/// Without `fragment_ids` the whole system is one fragment. `make_whole`
/// applies to the centroid policy; rigid fragments are always made whole and
/// fragments of fewer than three atoms use the centroid test. Accepts float32
/// or float64 coordinates and returns the same dtype.
#[pyfunction]
#[pyo3(
    name = "unfold_trajectory",
    signature = (trajectory, box_dimensions, policy="per_atom", fragment_ids=None, weights=None, make_whole=false)
)]
fn unfold_trajectory_py<'py>(
    py: Python<'py>,
    trajectory: &Bound<'py, numpy::PyUntypedArray>,
    box_dimensions: &Bound<'py, numpy::PyUntypedArray>,
    policy: &str,
    fragment_ids: Option<PyReadonlyArray1<'py, i64>>,
    weights: Option<PyReadonlyArray1<'py, f64>>,
    make_whole: bool,
) -> PyResult<PyObject> {
    let is_f32 = trajectory
        .dtype()
        .is_equiv_to(&numpy::dtype_bound::<f32>(py));

    let traj_f64: PyReadonlyArray3<'py, f64> = if is_f32 {
        let arr = trajectory.call_method1("astype", (numpy::dtype_bound::<f64>(py),))?;
        arr.extract()?
    } else {
        trajectory.extract()?
    };
    let box_f64: PyReadonlyArray2<'py, f64> = box_dimensions
        .call_method1("astype", (numpy::dtype_bound::<f64>(py),))?
        .extract()?;

    let traj_vec = array3_to_trajectory(&traj_f64.as_array());
    let n_atoms = traj_f64.as_array().shape()[1];
    let cells = boxes_to_cells(&box_f64.as_array(), traj_vec.len())?;
    let system = Trajectory::from_coordinates(traj_vec, &cells, 1.0).map_err(to_py_err)?;

    let mut config = UnfoldConfig::default()
        .with_policy(parse_policy(policy)?)
        .with_make_whole(make_whole);
    if let Some(w) = weights {
        config = config.with_weights(w.as_array().iter().copied().collect());
    }
    let ids = match fragment_ids {
        Some(ids) => indices_from_array(&ids)?,
        None => vec![0; n_atoms],
    };

    let unfolded = py
        .allow_threads(|| unfold_system(&system, &ids, &config))
        .map_err(to_py_err)?;
    let coords: Vec<Vec<[f64; 3]>> = unfolded.into_frames().into_iter().map(Frame::into_positions).collect();

    let result_f64 = trajectory_to_array3(&coords).to_pyarray_bound(py);
    if is_f32 {
        let result_f32 = result_f64.call_method1("astype", (numpy::dtype_bound::<f32>(py),))?;
        Ok(result_f32.into())
    } else {
        Ok(result_f64.into())
    }
}

/// Unfold one rigid fragment and report the frame-to-frame superpositions.
///
/// Returns a dict with `coordinates` (n_frames, n_atoms, 3), `rotations`
/// (n_frames, 3, 3), `rmsd` and `degenerate` (n_frames,) and `crossings`.
/// The first frame carries the identity.
#[pyfunction]
#[pyo3(signature = (trajectory, box_dimensions, weights=None))]
fn unfold_rigid_fragment<'py>(
    py: Python<'py>,
    trajectory: PyReadonlyArray3<'py, f64>,
    box_dimensions: PyReadonlyArray2<'py, f64>,
    weights: Option<PyReadonlyArray1<'py, f64>>,
) -> PyResult<Bound<'py, PyDict>> {
    let traj_vec = array3_to_trajectory(&trajectory.as_array());
    let cells = boxes_to_cells(&box_dimensions.as_array(), traj_vec.len())?;
    let fragment = Trajectory::from_coordinates(traj_vec, &cells, 1.0).map_err(to_py_err)?;

    let mut config = UnfoldConfig::default().with_policy(WrapPolicy::RigidBody);
    if let Some(w) = weights {
        config = config.with_weights(w.as_array().iter().copied().collect());
    }
    let unfolder = Unfolder::new(config);
    let mut state = UnfoldState::new();

    let n_frames = fragment.len();
    let mut coords = Vec::with_capacity(n_frames);
    let mut rotations = Array3::<f64>::zeros((n_frames, 3, 3));
    let mut rmsd = Vec::with_capacity(n_frames);
    let mut degenerate = Vec::with_capacity(n_frames);
    let mut crossings = 0usize;
    for (i, frame) in fragment.iter().enumerate() {
        let step = unfolder.step(&mut state, frame).map_err(to_py_err)?;
        let fit = step.superposition.unwrap_or_else(Superposition::identity);
        for r in 0..3 {
            for c in 0..3 {
                rotations[[i, r, c]] = fit.rotation[r][c];
            }
        }
        rmsd.push(fit.rmsd);
        degenerate.push(fit.degenerate);
        crossings += step.crossings;
        coords.push(step.frame.into_positions());
    }

    let result = PyDict::new_bound(py);
    result.set_item("coordinates", trajectory_to_array3(&coords).to_pyarray_bound(py))?;
    result.set_item("rotations", rotations.to_pyarray_bound(py))?;
    result.set_item("rmsd", PyArray1::from_vec_bound(py, rmsd))?;
    result.set_item("degenerate", degenerate)?;
    result.set_item("crossings", crossings)?;
    Ok(result)
}

// ============================================================================
// ANALYSIS
// ============================================================================

/// MSD of an unfolded trajectory. Returns a dict with `lags`, `times`,
/// `msd` and `counts`.
#[pyfunction]
#[pyo3(signature = (trajectory, dt=1.0, max_lag=None, origin_stride=1, atoms=None))]
fn mean_squared_displacement<'py>(
    py: Python<'py>,
    trajectory: PyReadonlyArray3<'py, f64>,
    dt: f64,
    max_lag: Option<usize>,
    origin_stride: usize,
    atoms: Option<PyReadonlyArray1<'py, i64>>,
) -> PyResult<Bound<'py, PyDict>> {
    let traj = coords_to_trajectory(array3_to_trajectory(&trajectory.as_array()), dt)?;
    let config = msd_config(max_lag, origin_stride, atoms)?;

    let result = py
        .allow_threads(|| msd::mean_squared_displacement(&traj, &config))
        .map_err(to_py_err)?;

    let dict = PyDict::new_bound(py);
    let lags: Vec<u64> = result.lags.iter().map(|&l| l as u64).collect();
    let counts: Vec<u64> = result.counts.iter().map(|&c| c as u64).collect();
    dict.set_item("lags", PyArray1::from_vec_bound(py, lags))?;
    dict.set_item("times", PyArray1::from_vec_bound(py, result.times))?;
    dict.set_item("msd", PyArray1::from_vec_bound(py, result.values))?;
    dict.set_item("counts", PyArray1::from_vec_bound(py, counts))?;
    Ok(dict)
}

fn msd_config(
    max_lag: Option<usize>,
    origin_stride: usize,
    atoms: Option<PyReadonlyArray1<'_, i64>>,
) -> PyResult<MsdConfig> {
    let mut config = MsdConfig::default().with_origin_stride(origin_stride);
    if let Some(lag) = max_lag {
        config = config.with_max_lag(lag);
    }
    if let Some(atoms) = atoms {
        config = config.with_atoms(indices_from_array(&atoms)?);
    }
    Ok(config)
}

/// Einstein-relation diffusion coefficient of an unfolded trajectory.
///
/// The fit covers lags `fit_start..=fit_end`, by default 10%..50% of `max_lag`.
#[pyfunction]
#[pyo3(signature = (trajectory, dt=1.0, max_lag=None, fit_start=None, fit_end=None, origin_stride=1))]
fn diffusion_coefficient<'py>(
    py: Python<'py>,
    trajectory: PyReadonlyArray3<'py, f64>,
    dt: f64,
    max_lag: Option<usize>,
    fit_start: Option<usize>,
    fit_end: Option<usize>,
    origin_stride: usize,
) -> PyResult<Bound<'py, PyDict>> {
    let traj = coords_to_trajectory(array3_to_trajectory(&trajectory.as_array()), dt)?;
    let config = msd_config(max_lag, origin_stride, None)?;

    let result = py
        .allow_threads(|| msd::mean_squared_displacement(&traj, &config))
        .map_err(to_py_err)?;
    let resolved_lag = result.lags.last().copied().unwrap_or(0);
    let default_window = FitWindow::default_for(resolved_lag);
    let window = FitWindow {
        start_lag: fit_start.unwrap_or(default_window.start_lag),
        end_lag: fit_end.unwrap_or(default_window.end_lag),
    };
    let fit = msd::fit_diffusion(&result, window).map_err(to_py_err)?;

    let dict = PyDict::new_bound(py);
    dict.set_item("coefficient", fit.coefficient)?;
    dict.set_item("slope", fit.slope)?;
    dict.set_item("intercept", fit.intercept)?;
    dict.set_item("r_squared", fit.r_squared)?;
    dict.set_item("n_points", fit.n_points)?;
    Ok(dict)
}

fn correlation_config(max_lag: Option<usize>, dt: f64, normalize: bool) -> CorrelationConfig {
    let config = CorrelationConfig::default()
        .with_dt(dt)
        .with_normalize(normalize);
    match max_lag {
        Some(lag) => config.with_max_lag(lag),
        None => config,
    }
}

/// `< a(t) · b(t + k) >` over vector series of shape (n_frames, n_vectors, 3).
/// Omitting `b` gives the autocorrelation of `a`.
#[pyfunction]
#[pyo3(signature = (a, b=None, dt=1.0, max_lag=None, normalize=false))]
fn time_correlation<'py>(
    py: Python<'py>,
    a: PyReadonlyArray3<'py, f64>,
    b: Option<PyReadonlyArray3<'py, f64>>,
    dt: f64,
    max_lag: Option<usize>,
    normalize: bool,
) -> PyResult<Bound<'py, PyDict>> {
    let a_vec = array3_to_trajectory(&a.as_array());
    let b_vec = b.map(|b| array3_to_trajectory(&b.as_array()));
    let config = correlation_config(max_lag, dt, normalize);

    let result = py
        .allow_threads(|| match &b_vec {
            Some(b_vec) => correl::time_correlation(&a_vec, b_vec, &config),
            None => correl::autocorrelation(&a_vec, &config),
        })
        .map_err(to_py_err)?;
    correlation_to_dict(py, result)
}

/// Legendre rotational correlation `< P_l(u(t) · u(t + k)) >`, `order` 1 or 2.
#[pyfunction]
#[pyo3(signature = (vectors, order=1, dt=1.0, max_lag=None))]
fn rotational_correlation<'py>(
    py: Python<'py>,
    vectors: PyReadonlyArray3<'py, f64>,
    order: u8,
    dt: f64,
    max_lag: Option<usize>,
) -> PyResult<Bound<'py, PyDict>> {
    let order = match order {
        1 => LegendreOrder::P1,
        2 => LegendreOrder::P2,
        n => {
            return Err(PyValueError::new_err(format!(
                "Legendre order must be 1 or 2, got {}",
                n
            )))
        }
    };
    let series = array3_to_trajectory(&vectors.as_array());
    let config = correlation_config(max_lag, dt, false);

    let result = py
        .allow_threads(|| correl::rotational_correlation(&series, order, &config))
        .map_err(to_py_err)?;
    correlation_to_dict(py, result)
}

fn correlation_to_dict(
    py: Python<'_>,
    result: mdunfold_analysis::Correlation,
) -> PyResult<Bound<'_, PyDict>> {
    let dict = PyDict::new_bound(py);
    let integral = result.integral();
    let counts: Vec<u64> = result.counts.iter().map(|&c| c as u64).collect();
    dict.set_item("times", PyArray1::from_vec_bound(py, result.times))?;
    dict.set_item("values", PyArray1::from_vec_bound(py, result.values))?;
    dict.set_item("counts", PyArray1::from_vec_bound(py, counts))?;
    dict.set_item("integral", integral)?;
    Ok(dict)
}

/// Cell vectors (3, 3) for a box record of 3 lengths or 6 lengths/angles.
#[pyfunction]
fn cell_vectors<'py>(
    py: Python<'py>,
    box_dimensions: PyReadonlyArray1<'py, f64>,
) -> PyResult<Bound<'py, PyArray2<f64>>> {
    let b = box_dimensions.as_array();
    let cell = match b.len() {
        3 => CellGeometry::orthorhombic([b[0], b[1], b[2]]),
        6 => CellGeometry::from_lengths_angles([b[0], b[1], b[2], b[3], b[4], b[5]]),
        n => {
            return Err(PyValueError::new_err(format!(
                "box record must have 3 or 6 entries, got {}",
                n
            )))
        }
    }
    .map_err(to_py_err)?;
    Ok(matrix_to_array2(cell.vectors()).to_pyarray_bound(py))
}

#[pymodule]
fn mdunfold(m: &Bound<'_, PyModule>) -> PyResult<()> {
    // Superposition
    m.add_function(wrap_pyfunction!(superpose, m)?)?;
    m.add_function(wrap_pyfunction!(superpose_trajectory_py, m)?)?;

    // Unfolding
    m.add_function(wrap_pyfunction!(unfold_trajectory_py, m)?)?;
    m.add_function(wrap_pyfunction!(unfold_rigid_fragment, m)?)?;
    m.add_function(wrap_pyfunction!(cell_vectors, m)?)?;

    // Analysis
    m.add_function(wrap_pyfunction!(mean_squared_displacement, m)?)?;
    m.add_function(wrap_pyfunction!(diffusion_coefficient, m)?)?;
    m.add_function(wrap_pyfunction!(time_correlation, m)?)?;
    m.add_function(wrap_pyfunction!(rotational_correlation, m)?)?;

    Ok(())
}
