//! Periodic simulation cell (orthorhombic or triclinic).
//!
//! A cell is stored as its three edge vectors `a`, `b`, `c`. Cartesian
//! positions relate to fractional ones through `x = fa·a + fb·b + fc·c`.
//! Construction rejects cells without positive volume, so every
//! `CellGeometry` in circulation is usable for unfolding.

use crate::error::{Error, Result};
use crate::geometry::{dot, mat_vec};

/// Volume below this fraction of `|a||b||c|` counts as degenerate.
const MIN_RELATIVE_VOLUME: f64 = 1e-10;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CellGeometry {
    vectors: [[f64; 3]; 3],
    /// Inverse of the column matrix `[a b c]`, row-major.
    inverse: [[f64; 3]; 3],
    volume: f64,
}

impl CellGeometry {
    /// Rectangular box with edge lengths `[lx, ly, lz]`.
    pub fn orthorhombic(lengths: [f64; 3]) -> Result<Self> {
        Self::from_vectors([
            [lengths[0], 0.0, 0.0],
            [0.0, lengths[1], 0.0],
            [0.0, 0.0, lengths[2]],
        ])
    }

    pub fn cubic(edge: f64) -> Result<Self> {
        Self::orthorhombic([edge; 3])
    }

    /// Cell from edge vectors `[a, b, c]` (one vector per row).
    pub fn from_vectors(vectors: [[f64; 3]; 3]) -> Result<Self> {
        if vectors.iter().flatten().any(|x| !x.is_finite()) {
            return Err(Error::InvalidGeometry {
                volume: f64::NAN,
                detail: "cell vectors must be finite".to_string(),
            });
        }
        let [a, b, c] = vectors;
        let bxc = cross(&b, &c);
        let volume = dot(&a, &bxc);
        let scale = norm(&a) * norm(&b) * norm(&c);
        if !(volume > MIN_RELATIVE_VOLUME * scale) || scale == 0.0 {
            return Err(Error::InvalidGeometry {
                volume,
                detail: "cell vectors must span a positive, right-handed volume".to_string(),
            });
        }

        // Rows of the inverse of [a b c] are the reciprocal vectors.
        let cxa = cross(&c, &a);
        let axb = cross(&a, &b);
        let inverse = [
            [bxc[0] / volume, bxc[1] / volume, bxc[2] / volume],
            [cxa[0] / volume, cxa[1] / volume, cxa[2] / volume],
            [axb[0] / volume, axb[1] / volume, axb[2] / volume],
        ];

        Ok(Self {
            vectors,
            inverse,
            volume,
        })
    }

    /// Cell from the six-number box record `[a, b, c, alpha, beta, gamma]`
    /// (lengths, then angles in degrees), with `a` along x and `b` in the xy plane.
    pub fn from_lengths_angles(params: [f64; 6]) -> Result<Self> {
        let [a, b, c, alpha, beta, gamma] = params;
        let cos_deg = |deg: f64| {
            if (deg - 90.0).abs() < 1e-9 {
                0.0
            } else {
                deg.to_radians().cos()
            }
        };
        let (cos_a, cos_b, cos_g) = (cos_deg(alpha), cos_deg(beta), cos_deg(gamma));
        let sin_g = if (gamma - 90.0).abs() < 1e-9 {
            1.0
        } else {
            gamma.to_radians().sin()
        };
        if sin_g.abs() < f64::EPSILON {
            return Err(Error::InvalidGeometry {
                volume: 0.0,
                detail: format!("gamma = {} degrees collapses the a/b plane", gamma),
            });
        }

        let cy = (cos_a - cos_b * cos_g) / sin_g;
        let cz_sq = 1.0 - cos_b * cos_b - cy * cy;
        if !(cz_sq > 0.0) {
            return Err(Error::InvalidGeometry {
                volume: 0.0,
                detail: format!(
                    "angles ({}, {}, {}) do not describe a real cell",
                    alpha, beta, gamma
                ),
            });
        }

        Self::from_vectors([
            [a, 0.0, 0.0],
            [b * cos_g, b * sin_g, 0.0],
            [c * cos_b, c * cy, c * cz_sq.sqrt()],
        ])
    }

    pub fn vectors(&self) -> &[[f64; 3]; 3] {
        &self.vectors
    }

    pub fn volume(&self) -> f64 {
        self.volume
    }

    /// Edge lengths `|a|, |b|, |c|`.
    pub fn lengths(&self) -> [f64; 3] {
        [
            norm(&self.vectors[0]),
            norm(&self.vectors[1]),
            norm(&self.vectors[2]),
        ]
    }

    pub fn is_orthorhombic(&self) -> bool {
        let v = &self.vectors;
        v[0][1] == 0.0
            && v[0][2] == 0.0
            && v[1][0] == 0.0
            && v[1][2] == 0.0
            && v[2][0] == 0.0
            && v[2][1] == 0.0
    }

    pub fn to_fractional(&self, x: &[f64; 3]) -> [f64; 3] {
        mat_vec(&self.inverse, x)
    }

    pub fn to_cartesian(&self, f: &[f64; 3]) -> [f64; 3] {
        let [a, b, c] = &self.vectors;
        [
            f[0] * a[0] + f[1] * b[0] + f[2] * c[0],
            f[0] * a[1] + f[1] * b[1] + f[2] * c[1],
            f[0] * a[2] + f[1] * b[2] + f[2] * c[2],
        ]
    }

    /// Cartesian offset of an integer lattice translation `n`.
    pub fn lattice_shift(&self, n: &[i64; 3]) -> [f64; 3] {
        self.to_cartesian(&[n[0] as f64, n[1] as f64, n[2] as f64])
    }

    /// Number of whole cell vectors a displacement has crossed along each
    /// lattice axis. A component counts only once it exceeds half a cell.
    pub fn wrap_counts(&self, displacement: &[f64; 3]) -> [i64; 3] {
        let f = self.to_fractional(displacement);
        let count = |x: f64| -> i64 {
            let n = (x.abs() - 0.5).ceil().max(0.0);
            (n * x.signum()) as i64
        };
        [count(f[0]), count(f[1]), count(f[2])]
    }

    /// Minimum-image form of a displacement.
    ///
    /// Reduces the fractional components to `[-0.5, 0.5]`. For strongly
    /// skewed triclinic cells this is not always the shortest image.
    pub fn minimum_image(&self, displacement: &[f64; 3]) -> [f64; 3] {
        let n = self.wrap_counts(displacement);
        let shift = self.lattice_shift(&n);
        [
            displacement[0] - shift[0],
            displacement[1] - shift[1],
            displacement[2] - shift[2],
        ]
    }
}

fn cross(a: &[f64; 3], b: &[f64; 3]) -> [f64; 3] {
    [
        a[1] * b[2] - a[2] * b[1],
        a[2] * b[0] - a[0] * b[2],
        a[0] * b[1] - a[1] * b[0],
    ]
}

fn norm(a: &[f64; 3]) -> f64 {
    dot(a, a).sqrt()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_orthorhombic_volume_and_fractional() {
        let cell = CellGeometry::orthorhombic([10.0, 20.0, 5.0]).unwrap();
        assert!((cell.volume() - 1000.0).abs() < 1e-9);
        assert!(cell.is_orthorhombic());
        assert_eq!(cell.to_fractional(&[5.0, 5.0, 5.0]), [0.5, 0.25, 1.0]);
        assert_eq!(cell.lattice_shift(&[1, -1, 2]), [10.0, -20.0, 10.0]);
    }

    #[test]
    fn test_rejects_degenerate_cells() {
        assert!(matches!(
            CellGeometry::orthorhombic([10.0, 0.0, 10.0]),
            Err(Error::InvalidGeometry { .. })
        ));
        assert!(matches!(
            CellGeometry::orthorhombic([10.0, -1.0, 10.0]),
            Err(Error::InvalidGeometry { .. })
        ));
        // Coplanar edge vectors.
        assert!(CellGeometry::from_vectors([
            [1.0, 0.0, 0.0],
            [0.0, 1.0, 0.0],
            [1.0, 1.0, 0.0]
        ])
        .is_err());
        assert!(CellGeometry::orthorhombic([f64::NAN, 1.0, 1.0]).is_err());
        assert!(CellGeometry::from_lengths_angles([10.0, 10.0, 10.0, 90.0, 90.0, 0.0]).is_err());
        assert!(
            CellGeometry::from_lengths_angles([10.0, 10.0, 10.0, 150.0, 150.0, 150.0]).is_err()
        );
    }

    #[test]
    fn test_lengths_angles_matches_orthorhombic() {
        let a = CellGeometry::from_lengths_angles([10.0, 12.0, 14.0, 90.0, 90.0, 90.0]).unwrap();
        let b = CellGeometry::orthorhombic([10.0, 12.0, 14.0]).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn test_triclinic_round_trip_and_volume() {
        let cell = CellGeometry::from_lengths_angles([10.0, 11.0, 12.0, 80.0, 95.0, 70.0]).unwrap();
        let lengths = cell.lengths();
        assert!((lengths[0] - 10.0).abs() < 1e-12);
        assert!((lengths[1] - 11.0).abs() < 1e-12);
        assert!((lengths[2] - 12.0).abs() < 1e-12);

        let x = [3.0, -4.0, 7.5];
        let back = cell.to_cartesian(&cell.to_fractional(&x));
        for i in 0..3 {
            assert!((back[i] - x[i]).abs() < 1e-12);
        }
        assert!(!cell.is_orthorhombic());
    }

    #[test]
    fn test_wrap_counts_require_more_than_half_a_cell() {
        let cell = CellGeometry::cubic(10.0).unwrap();
        assert_eq!(cell.wrap_counts(&[5.0, -5.0, 4.9]), [0, 0, 0]);
        assert_eq!(cell.wrap_counts(&[5.1, -9.7, 0.0]), [1, -1, 0]);
        assert_eq!(cell.wrap_counts(&[16.0, 0.0, 0.0]), [2, 0, 0]);

        let d = cell.minimum_image(&[-9.7, 0.0, 0.0]);
        assert!((d[0] - 0.3).abs() < 1e-12);
    }
}
