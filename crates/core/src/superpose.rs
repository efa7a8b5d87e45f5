//! Optimal rigid-body superposition (Kabsch with reflection correction).
//!
//! The solver is a pure function of two matched point sets and optional
//! per-point weights. The result follows the convention
//! `candidate ≈ rotation · reference + translation`.

use nalgebra::{Matrix3, Rotation3, UnitQuaternion, SVD};
use rayon::prelude::*;

use crate::error::{Error, NumericWarning, Result};
use crate::geometry::{add, mat_vec, sub, weighted_centroid};

/// Minimum number of matched points for a determined rotation.
pub const MIN_POINTS: usize = 3;

/// Tolerances used to classify the cross-covariance spectrum.
#[derive(Debug, Clone, Copy)]
pub struct SolverConfig {
    /// Relative size under which a singular value is treated as zero.
    /// Covariance rank below two marks the result degenerate.
    pub degeneracy_tolerance: f64,
    /// Ratio `s2 / s1` under which a non-degenerate result carries a
    /// [`NumericWarning::NearSingularCovariance`].
    pub instability_tolerance: f64,
}

impl Default for SolverConfig {
    fn default() -> Self {
        Self {
            degeneracy_tolerance: 1e-10,
            instability_tolerance: 1e-4,
        }
    }
}

impl SolverConfig {
    pub fn with_degeneracy_tolerance(mut self, tol: f64) -> Self {
        self.degeneracy_tolerance = tol;
        self
    }

    pub fn with_instability_tolerance(mut self, tol: f64) -> Self {
        self.instability_tolerance = tol;
        self
    }
}

/// Proper rotation plus translation mapping the reference onto the candidate.
#[derive(Debug, Clone, PartialEq)]
pub struct Superposition {
    /// Row-major orthonormal matrix with determinant +1.
    pub rotation: [[f64; 3]; 3],
    pub translation: [f64; 3],
    /// Weighted RMSD between `rotation · reference + translation` and the candidate.
    pub rmsd: f64,
    /// Covariance rank < 2 (collinear or coincident points). The rotation about
    /// the degenerate axis is arbitrary but still proper.
    pub degenerate: bool,
    pub warning: Option<NumericWarning>,
}

impl Superposition {
    pub fn identity() -> Self {
        Self {
            rotation: IDENTITY,
            translation: [0.0; 3],
            rmsd: 0.0,
            degenerate: false,
            warning: None,
        }
    }

    /// Map reference-frame points into the candidate frame.
    pub fn apply(&self, points: &[[f64; 3]]) -> Vec<[f64; 3]> {
        points
            .iter()
            .map(|p| add(&mat_vec(&self.rotation, p), &self.translation))
            .collect()
    }

    /// Map candidate-frame points back onto the reference: `Rᵀ (x - t)`.
    pub fn apply_inverse(&self, points: &[[f64; 3]]) -> Vec<[f64; 3]> {
        let rt = transpose(&self.rotation);
        points
            .iter()
            .map(|p| mat_vec(&rt, &sub(p, &self.translation)))
            .collect()
    }

    /// Rotate a single vector (no translation).
    pub fn rotate(&self, v: &[f64; 3]) -> [f64; 3] {
        mat_vec(&self.rotation, v)
    }

    pub fn quaternion(&self) -> UnitQuaternion<f64> {
        UnitQuaternion::from_rotation_matrix(&Rotation3::from_matrix_unchecked(to_matrix(
            &self.rotation,
        )))
    }

    /// Rotation angle in radians, in `[0, π]`.
    pub fn angle(&self) -> f64 {
        let r = &self.rotation;
        let cos = ((r[0][0] + r[1][1] + r[2][2] - 1.0) / 2.0).clamp(-1.0, 1.0);
        cos.acos()
    }

    pub fn determinant(&self) -> f64 {
        to_matrix(&self.rotation).determinant()
    }
}

const IDENTITY: [[f64; 3]; 3] = [[1.0, 0.0, 0.0], [0.0, 1.0, 0.0], [0.0, 0.0, 1.0]];

fn to_matrix(m: &[[f64; 3]; 3]) -> Matrix3<f64> {
    Matrix3::new(
        m[0][0], m[0][1], m[0][2], m[1][0], m[1][1], m[1][2], m[2][0], m[2][1], m[2][2],
    )
}

fn from_matrix(r: &Matrix3<f64>) -> [[f64; 3]; 3] {
    [
        [r[(0, 0)], r[(0, 1)], r[(0, 2)]],
        [r[(1, 0)], r[(1, 1)], r[(1, 2)]],
        [r[(2, 0)], r[(2, 1)], r[(2, 2)]],
    ]
}

fn transpose(m: &[[f64; 3]; 3]) -> [[f64; 3]; 3] {
    [
        [m[0][0], m[1][0], m[2][0]],
        [m[0][1], m[1][1], m[2][1]],
        [m[0][2], m[1][2], m[2][2]],
    ]
}

fn validate(reference: &[[f64; 3]], candidate: &[[f64; 3]], weights: Option<&[f64]>) -> Result<()> {
    if reference.len() != candidate.len() {
        return Err(Error::DegenerateInput(format!(
            "point sets differ in length ({} vs {})",
            reference.len(),
            candidate.len()
        )));
    }
    if reference.len() < MIN_POINTS {
        return Err(Error::DegenerateInput(format!(
            "at least {} points are required, got {}",
            MIN_POINTS,
            reference.len()
        )));
    }
    if let Some(w) = weights {
        if w.len() != reference.len() {
            return Err(Error::DegenerateInput(format!(
                "{} weights given for {} points",
                w.len(),
                reference.len()
            )));
        }
        check_weights(w)?;
    }
    Ok(())
}

/// Weights must be finite, non-negative and not all zero.
pub(crate) fn check_weights(weights: &[f64]) -> Result<()> {
    if weights.iter().any(|&x| !x.is_finite() || x < 0.0) {
        return Err(Error::DegenerateInput(
            "weights must be finite and non-negative".to_string(),
        ));
    }
    if weights.iter().all(|&x| x == 0.0) {
        return Err(Error::DegenerateInput("all weights are zero".to_string()));
    }
    Ok(())
}

/// Solve for the optimal superposition with default tolerances.
pub fn solve(
    reference: &[[f64; 3]],
    candidate: &[[f64; 3]],
    weights: Option<&[f64]>,
) -> Result<Superposition> {
    solve_with(reference, candidate, weights, &SolverConfig::default())
}

/// Solve for the rotation and translation minimising the weighted RMSD
/// between `R · reference + t` and `candidate`.
pub fn solve_with(
    reference: &[[f64; 3]],
    candidate: &[[f64; 3]],
    weights: Option<&[f64]>,
    config: &SolverConfig,
) -> Result<Superposition> {
    validate(reference, candidate, weights)?;

    let ref_centroid = weighted_centroid(reference, weights);
    let cand_centroid = weighted_centroid(candidate, weights);
    let weight = |k: usize| weights.map_or(1.0, |w| w[k]);

    // H = Σ w p qᵀ, p and q centred.
    let mut h = [[0.0f64; 3]; 3];
    let mut ref_spread = 0.0;
    let mut cand_spread = 0.0;
    for k in 0..reference.len() {
        let w = weight(k);
        let p = sub(&reference[k], &ref_centroid);
        let q = sub(&candidate[k], &cand_centroid);
        for i in 0..3 {
            for j in 0..3 {
                h[i][j] += w * p[i] * q[j];
            }
        }
        ref_spread += w * (p[0] * p[0] + p[1] * p[1] + p[2] * p[2]);
        cand_spread += w * (q[0] * q[0] + q[1] * q[1] + q[2] * q[2]);
    }

    let mat = to_matrix(&h);
    let svd = SVD::try_new(mat, true, true, f64::EPSILON, 0).ok_or_else(|| {
        Error::DegenerateInput("singular value decomposition did not converge".to_string())
    })?;
    let u = svd
        .u
        .ok_or_else(|| Error::DegenerateInput("SVD produced no U matrix".to_string()))?;
    let v_t = svd
        .v_t
        .ok_or_else(|| Error::DegenerateInput("SVD produced no Vᵀ matrix".to_string()))?;
    let s = svd.singular_values;

    let mut order = [0usize, 1, 2];
    order.sort_by(|&a, &b| s[b].total_cmp(&s[a]));
    let (s1, s2) = (s[order[0]], s[order[1]]);
    let smallest = order[2];

    // s1 <= sqrt(Σ|p|² Σ|q|²), so this scale makes the tolerances relative.
    let scale = (ref_spread * cand_spread).sqrt();
    let coincident = scale <= 0.0 || s1 <= config.degeneracy_tolerance * scale;
    let collinear = !coincident && s2 <= config.degeneracy_tolerance * s1;

    let rotation = if coincident {
        Matrix3::identity()
    } else {
        let v = v_t.transpose();
        let r = v * u.transpose();
        if r.determinant() < 0.0 {
            let mut v_corrected = v;
            for i in 0..3 {
                v_corrected[(i, smallest)] *= -1.0;
            }
            v_corrected * u.transpose()
        } else {
            r
        }
    };

    let rotation = from_matrix(&rotation);
    let translation = sub(&cand_centroid, &mat_vec(&rotation, &ref_centroid));

    let mut sum_sq = 0.0;
    let mut total = 0.0;
    for k in 0..reference.len() {
        let w = weight(k);
        let mapped = add(&mat_vec(&rotation, &reference[k]), &translation);
        let d = sub(&mapped, &candidate[k]);
        sum_sq += w * (d[0] * d[0] + d[1] * d[1] + d[2] * d[2]);
        total += w;
    }

    let warning = if !coincident && !collinear && s2 < config.instability_tolerance * s1 {
        Some(NumericWarning::NearSingularCovariance { condition: s2 / s1 })
    } else {
        None
    };

    Ok(Superposition {
        rotation,
        translation,
        rmsd: (sum_sq / total).sqrt(),
        degenerate: coincident || collinear,
        warning,
    })
}

/// Align trajectory frames onto a reference structure.
///
/// The superposition is computed from `align_indices` only and applied to
/// every atom of the frame. Frames are processed in parallel.
///
/// # Arguments
/// * `trajectory` - Frames of shape [n_frames][n_atoms]
/// * `reference` - Reference coordinates [n_atoms]
/// * `align_indices` - Atom indices used for fitting (at least three)
/// * `weights` - Optional weights, one per alignment index
pub fn superpose_trajectory(
    trajectory: &[Vec<[f64; 3]>],
    reference: &[[f64; 3]],
    align_indices: &[usize],
    weights: Option<&[f64]>,
) -> Result<Vec<Vec<[f64; 3]>>> {
    let gather = |coords: &[[f64; 3]]| -> Result<Vec<[f64; 3]>> {
        align_indices
            .iter()
            .map(|&idx| {
                coords.get(idx).copied().ok_or(Error::ShapeMismatch {
                    expected: idx + 1,
                    found: coords.len(),
                    context: "alignment index out of range",
                })
            })
            .collect()
    };
    let ref_align = gather(reference)?;

    trajectory
        .par_iter()
        .map(|frame| {
            let mobile_align = gather(frame)?;
            let fit = solve(&ref_align, &mobile_align, weights)?;
            Ok(fit.apply_inverse(frame))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::{Rng, SeedableRng};
    use rand_xoshiro::Xoshiro256PlusPlus;

    fn axis_angle(axis: [f64; 3], angle: f64) -> [[f64; 3]; 3] {
        let r = Rotation3::from_axis_angle(
            &nalgebra::Unit::new_normalize(nalgebra::Vector3::from(axis)),
            angle,
        );
        from_matrix(r.matrix())
    }

    fn random_cloud(rng: &mut Xoshiro256PlusPlus, n: usize) -> Vec<[f64; 3]> {
        (0..n)
            .map(|_| {
                [
                    rng.gen_range(-5.0..5.0),
                    rng.gen_range(-5.0..5.0),
                    rng.gen_range(-5.0..5.0),
                ]
            })
            .collect()
    }

    fn assert_matrix_close(a: &[[f64; 3]; 3], b: &[[f64; 3]; 3], tol: f64) {
        for i in 0..3 {
            for j in 0..3 {
                assert!(
                    (a[i][j] - b[i][j]).abs() < tol,
                    "element ({}, {}) differs: {} vs {}",
                    i,
                    j,
                    a[i][j],
                    b[i][j]
                );
            }
        }
    }

    #[test]
    fn test_self_superposition_is_identity() {
        let mut rng = Xoshiro256PlusPlus::seed_from_u64(7);
        for n in [3, 4, 10, 50] {
            let p = random_cloud(&mut rng, n);
            let fit = solve(&p, &p, None).unwrap();
            assert_matrix_close(&fit.rotation, &IDENTITY, 1e-9);
            assert!(fit.rmsd < 1e-9, "rmsd {}", fit.rmsd);
            for t in fit.translation {
                assert!(t.abs() < 1e-9);
            }
        }
    }

    #[test]
    fn test_recovers_rotation_and_translation() {
        let mut rng = Xoshiro256PlusPlus::seed_from_u64(11);
        for _ in 0..20 {
            let p = random_cloud(&mut rng, 12);
            let axis = [
                rng.gen_range(-1.0..1.0),
                rng.gen_range(-1.0..1.0),
                rng.gen_range(0.1..1.0),
            ];
            let angle = rng.gen_range(0.0..std::f64::consts::PI);
            let r = axis_angle(axis, angle);
            let t = [
                rng.gen_range(-20.0..20.0),
                rng.gen_range(-20.0..20.0),
                rng.gen_range(-20.0..20.0),
            ];
            let q: Vec<[f64; 3]> = p.iter().map(|x| add(&mat_vec(&r, x), &t)).collect();

            let fit = solve(&p, &q, None).unwrap();
            assert_matrix_close(&fit.rotation, &r, 1e-8);
            for i in 0..3 {
                assert!((fit.translation[i] - t[i]).abs() < 1e-7);
            }
            assert!(fit.rmsd < 1e-8);
            assert!(!fit.degenerate);
            assert!((fit.angle() - angle).abs() < 1e-7);
        }
    }

    #[test]
    fn test_mirror_image_never_yields_reflection() {
        let mut rng = Xoshiro256PlusPlus::seed_from_u64(3);
        let p = random_cloud(&mut rng, 8);
        let mirrored: Vec<[f64; 3]> = p.iter().map(|x| [x[0], x[1], -x[2]]).collect();
        let fit = solve(&p, &mirrored, None).unwrap();
        assert!((fit.determinant() - 1.0).abs() < 1e-10);
        assert!(fit.rmsd > 0.0);
    }

    #[test]
    fn test_near_collinear_sets_stay_proper() {
        let p = vec![
            [0.0, 0.0, 0.0],
            [1.0, 0.0, 1e-7],
            [2.0, 1e-7, 0.0],
            [3.0, 0.0, 0.0],
        ];
        let r = axis_angle([0.3, 0.2, 1.0], 1.1);
        let q: Vec<[f64; 3]> = p.iter().map(|x| mat_vec(&r, x)).collect();
        let fit = solve(&p, &q, None).unwrap();
        assert!((fit.determinant() - 1.0).abs() < 1e-10);
        assert!(fit.rmsd < 1e-5);
        assert!(fit.warning.is_some() || fit.degenerate);
    }

    #[test]
    fn test_tolerances_control_warning_and_degeneracy() {
        // Flat in z by 1e-3 relative to the in-plane spread.
        let p = vec![
            [0.0, 0.0, 0.0],
            [4.0, 0.0, 0.0],
            [0.0, 4.0, 1e-3],
            [4.0, 4.0, 0.0],
            [2.0, 1.0, 0.0],
        ];
        let r = axis_angle([0.2, 1.0, 0.4], 0.7);
        let q: Vec<[f64; 3]> = p.iter().map(|x| mat_vec(&r, x)).collect();

        let fit = solve(&p, &q, None).unwrap();
        assert!(fit.warning.is_none());
        assert!(!fit.degenerate);

        // Thin in one direction: second singular value well below the first.
        let thin = vec![
            [0.0, 0.0, 0.0],
            [10.0, 0.0, 0.0],
            [20.0, 1e-3, 0.0],
            [30.0, 0.0, 0.0],
        ];
        let q: Vec<[f64; 3]> = thin.iter().map(|x| mat_vec(&r, x)).collect();
        let strict = SolverConfig::default().with_instability_tolerance(1e-2);
        let fit = solve_with(&thin, &q, None, &strict).unwrap();
        assert!(matches!(
            fit.warning,
            Some(NumericWarning::NearSingularCovariance { .. })
        ));
        assert!(!fit.degenerate);

        let lax = SolverConfig::default().with_instability_tolerance(1e-12);
        assert!(solve_with(&thin, &q, None, &lax).unwrap().warning.is_none());

        let coarse = SolverConfig::default().with_degeneracy_tolerance(1e-2);
        let fit = solve_with(&thin, &q, None, &coarse).unwrap();
        assert!(fit.degenerate);
        assert!(fit.warning.is_none());
        assert!((fit.determinant() - 1.0).abs() < 1e-10);
    }

    #[test]
    fn test_exactly_collinear_is_flagged_not_failed() {
        let p = vec![[0.0, 0.0, 0.0], [1.0, 0.0, 0.0], [2.0, 0.0, 0.0]];
        let q = vec![[5.0, 0.0, 0.0], [5.0, 0.0, 1.0], [5.0, 0.0, 2.0]];
        let fit = solve(&p, &q, None).unwrap();
        assert!(fit.degenerate);
        assert!((fit.determinant() - 1.0).abs() < 1e-10);
        // Any rotation taking the line onto the other line is optimal.
        let mapped = fit.apply(&p);
        for (m, c) in mapped.iter().zip(&q) {
            for i in 0..3 {
                assert!((m[i] - c[i]).abs() < 1e-9);
            }
        }
    }

    #[test]
    fn test_coincident_points_return_identity() {
        let p = vec![[1.0, 2.0, 3.0]; 4];
        let q = vec![[4.0, 5.0, 6.0]; 4];
        let fit = solve(&p, &q, None).unwrap();
        assert!(fit.degenerate);
        assert_eq!(fit.rotation, IDENTITY);
        assert_eq!(fit.translation, [3.0, 3.0, 3.0]);
    }

    #[test]
    fn test_rejects_bad_input() {
        let two = vec![[0.0; 3], [1.0, 0.0, 0.0]];
        assert!(matches!(solve(&two, &two, None), Err(Error::DegenerateInput(_))));

        let p = vec![[0.0, 0.0, 0.0], [1.0, 0.0, 0.0], [0.0, 1.0, 0.0]];
        let q = vec![[0.0, 0.0, 0.0], [1.0, 0.0, 0.0]];
        assert!(matches!(solve(&p, &q, None), Err(Error::DegenerateInput(_))));
        assert!(matches!(
            solve(&p, &p, Some(&[0.0, 0.0, 0.0][..])),
            Err(Error::DegenerateInput(_))
        ));
        assert!(matches!(
            solve(&p, &p, Some(&[1.0, -1.0, 1.0][..])),
            Err(Error::DegenerateInput(_))
        ));
        assert!(matches!(
            solve(&p, &p, Some(&[1.0, 1.0][..])),
            Err(Error::DegenerateInput(_))
        ));
    }

    #[test]
    fn test_weights_ignore_outlier() {
        let p = vec![
            [0.0, 0.0, 0.0],
            [1.0, 0.0, 0.0],
            [0.0, 1.0, 0.0],
            [0.0, 0.0, 1.0],
            [2.0, 2.0, 2.0],
        ];
        let r = axis_angle([0.0, 0.0, 1.0], 0.5);
        let mut q: Vec<[f64; 3]> = p.iter().map(|x| mat_vec(&r, x)).collect();
        q[4] = [-9.0, 4.0, 7.0];
        let fit = solve(&p, &q, Some(&[1.0, 1.0, 1.0, 1.0, 0.0][..])).unwrap();
        assert_matrix_close(&fit.rotation, &r, 1e-9);
        assert!(fit.rmsd < 1e-9);
    }

    #[test]
    fn test_apply_inverse_undoes_apply() {
        let fit = Superposition {
            rotation: axis_angle([1.0, 2.0, 3.0], 0.8),
            translation: [1.0, -2.0, 0.5],
            ..Superposition::identity()
        };
        let pts = vec![[0.3, 0.1, -0.7], [2.0, 1.0, 4.0]];
        let back = fit.apply_inverse(&fit.apply(&pts));
        for (a, b) in back.iter().zip(&pts) {
            for i in 0..3 {
                assert!((a[i] - b[i]).abs() < 1e-12);
            }
        }
        assert!((fit.quaternion().angle() - 0.8).abs() < 1e-12);
    }

    #[test]
    fn test_superpose_trajectory_aligns_frames() {
        let mut rng = Xoshiro256PlusPlus::seed_from_u64(5);
        let reference = random_cloud(&mut rng, 6);
        let traj: Vec<Vec<[f64; 3]>> = (0..4)
            .map(|f| {
                let r = axis_angle([1.0, 0.0, f as f64], 0.3 * f as f64);
                reference
                    .iter()
                    .map(|x| add(&mat_vec(&r, x), &[f as f64, 2.0, -1.0]))
                    .collect()
            })
            .collect();
        let aligned = superpose_trajectory(&traj, &reference, &[0, 1, 2, 3, 4, 5], None).unwrap();
        for frame in &aligned {
            for (a, b) in frame.iter().zip(&reference) {
                for i in 0..3 {
                    assert!((a[i] - b[i]).abs() < 1e-8);
                }
            }
        }

        let err = superpose_trajectory(&traj, &reference, &[0, 1, 9], None).unwrap_err();
        assert!(matches!(err, Error::ShapeMismatch { .. }));
    }
}
