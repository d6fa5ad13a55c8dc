//! Periodic box in reduced (lower-triangular) form.
//!
//! Box vectors are `a = (ax, 0, 0)`, `b = (bx, by, 0)`, `c = (cx, cy, cz)` with positive
//! diagonal entries. All lattice sums and grid mappings in this crate assume that layout.

use serde::{Deserialize, Serialize};

use super::{EwaldError, EwaldResult};

pub type Vec3 = [f64; 3];

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "[Vec3; 3]", into = "[Vec3; 3]")]
pub struct PeriodicBox {
    vectors: [Vec3; 3],
}

impl PeriodicBox {
    pub fn rectangular(x: f64, y: f64, z: f64) -> EwaldResult<Self> {
        Self::triclinic([x, 0.0, 0.0], [0.0, y, 0.0], [0.0, 0.0, z])
    }

    pub fn triclinic(a: Vec3, b: Vec3, c: Vec3) -> EwaldResult<Self> {
        if a[1] != 0.0 || a[2] != 0.0 || b[2] != 0.0 {
            return Err(EwaldError::configuration(
                "BOX.NOT_REDUCED",
                "box vectors must be lower triangular: a = (ax, 0, 0), b = (bx, by, 0)",
            ));
        }
        if !(a[0] > 0.0 && b[1] > 0.0 && c[2] > 0.0) {
            return Err(EwaldError::configuration(
                "BOX.NON_POSITIVE",
                format!(
                    "box diagonal must be positive, got ({}, {}, {})",
                    a[0], b[1], c[2]
                ),
            ));
        }
        if !a.iter().chain(&b).chain(&c).all(|value| value.is_finite()) {
            return Err(EwaldError::configuration(
                "BOX.NON_FINITE",
                "box vectors must be finite",
            ));
        }

        Ok(Self { vectors: [a, b, c] })
    }

    pub const fn vectors(&self) -> &[Vec3; 3] {
        &self.vectors
    }

    /// Edge lengths along the diagonal, used for grid sizing.
    pub const fn diagonal(&self) -> Vec3 {
        [self.vectors[0][0], self.vectors[1][1], self.vectors[2][2]]
    }

    pub fn volume(&self) -> f64 {
        self.vectors[0][0] * self.vectors[1][1] * self.vectors[2][2]
    }

    /// Rows of the inverse box matrix, laid out so that `recip[i][j]` multiplies coordinate `i`
    /// when producing fractional coordinate `j`.
    pub fn reciprocal(&self) -> [Vec3; 3] {
        let [a, b, c] = self.vectors;
        let determinant = a[0] * b[1] * c[2];
        let scale = 1.0 / determinant;

        [
            [1.0 / a[0], 0.0, 0.0],
            [-b[0] / (a[0] * b[1]), 1.0 / b[1], 0.0],
            [
                (b[0] * c[1] - b[1] * c[0]) * scale,
                -a[0] * c[1] * scale,
                a[0] * b[1] * scale,
            ],
        ]
    }

    /// Fractional coordinates of `position`, each wrapped into `[0, 1)`.
    pub fn fractional(&self, position: Vec3, recip: &[Vec3; 3]) -> Vec3 {
        let [x, y, z] = position;
        let raw = [
            x * recip[0][0] + y * recip[1][0] + z * recip[2][0],
            y * recip[1][1] + z * recip[2][1],
            z * recip[2][2],
        ];

        raw.map(|value| {
            let wrapped = value - value.floor();
            if wrapped >= 1.0 { 0.0 } else { wrapped }
        })
    }

    /// Shortest periodic image of a displacement.
    pub fn minimum_image(&self, delta: Vec3) -> Vec3 {
        let [a, b, c] = self.vectors;
        let mut delta = delta;

        let shift = (delta[2] / c[2]).round();
        for axis in 0..3 {
            delta[axis] -= shift * c[axis];
        }
        let shift = (delta[1] / b[1]).round();
        for axis in 0..3 {
            delta[axis] -= shift * b[axis];
        }
        let shift = (delta[0] / a[0]).round();
        delta[0] -= shift * a[0];

        delta
    }
}

impl TryFrom<[Vec3; 3]> for PeriodicBox {
    type Error = EwaldError;

    fn try_from(vectors: [Vec3; 3]) -> Result<Self, Self::Error> {
        let [a, b, c] = vectors;
        Self::triclinic(a, b, c)
    }
}

impl From<PeriodicBox> for [Vec3; 3] {
    fn from(periodic_box: PeriodicBox) -> Self {
        periodic_box.vectors
    }
}

pub fn sub3(lhs: Vec3, rhs: Vec3) -> Vec3 {
    [lhs[0] - rhs[0], lhs[1] - rhs[1], lhs[2] - rhs[2]]
}

pub fn dot3(lhs: Vec3, rhs: Vec3) -> f64 {
    lhs[0] * rhs[0] + lhs[1] * rhs[1] + lhs[2] * rhs[2]
}

pub fn scale3(vector: Vec3, factor: f64) -> Vec3 {
    vector.map(|value| value * factor)
}
