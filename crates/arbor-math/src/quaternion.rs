//! Unit quaternions and the SO(3) exponential map.
//!
//! Rotational joint coordinates are scaled-axis (exponential) vectors; the
//! joint integrators advance them by composing exp(q)·exp(h·ω) on the group
//! and mapping back through the logarithm. Composition is the `*` operator.

use crate::{skew, Mat3, Vec3};

/// sin(x)/x, with the series fallback near zero.
#[inline]
fn sinc(x: f64) -> f64 {
    if x.abs() < 1e-8 {
        1.0 - x * x / 6.0
    } else {
        x.sin() / x
    }
}

/// A rotation stored as scalar part `w` and vector part `v`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Quat {
    pub w: f64,
    pub v: Vec3,
}

impl Quat {
    /// The null rotation.
    pub fn identity() -> Self {
        Self {
            w: 1.0,
            v: Vec3::zeros(),
        }
    }

    /// Rotation of `angle` radians about a unit `axis`.
    pub fn from_axis_angle(axis: &Vec3, angle: f64) -> Self {
        Self::exp(&(*axis * angle))
    }

    /// Exponential map: the rotation by |w| radians about w/|w|.
    /// Well defined for small |w| through the sinc limit.
    pub fn exp(w: &Vec3) -> Self {
        let half = 0.5 * w.norm();
        Self {
            w: half.cos(),
            v: *w * (0.5 * sinc(half)),
        }
    }

    /// Logarithm: the scaled-axis vector this rotation is the exp of.
    pub fn log(&self) -> Vec3 {
        let s = self.v.norm();
        if s < 1e-12 {
            // q ≈ (1, w/2) for small rotations.
            return self.v * 2.0;
        }
        self.v * (2.0 * s.atan2(self.w) / s)
    }

    /// Unit-length copy; degenerate inputs collapse to the identity.
    pub fn normalized(&self) -> Self {
        let n2 = self.w * self.w + self.v.norm_squared();
        if n2 <= f64::EPSILON {
            return Self::identity();
        }
        let inv = 1.0 / n2.sqrt();
        Self {
            w: self.w * inv,
            v: self.v * inv,
        }
    }

    /// The opposite rotation.
    pub fn conjugate(&self) -> Self {
        Self {
            w: self.w,
            v: -self.v,
        }
    }

    /// Rotation matrix: R = (w² − v·v)·E + 2·v·vᵀ + 2·w·[v]×.
    pub fn to_matrix(&self) -> Mat3 {
        let vv = self.v * self.v.transpose();
        Mat3::identity() * (self.w * self.w - self.v.norm_squared())
            + vv * 2.0
            + skew(&self.v) * (2.0 * self.w)
    }

    /// Recover the quaternion of a rotation matrix, reading the largest
    /// component off the diagonal first for stability.
    pub fn from_matrix(m: &Mat3) -> Self {
        // Squared components, up to the common factor 1/4.
        let ww = 1.0 + m[(0, 0)] + m[(1, 1)] + m[(2, 2)];
        let xx = 1.0 + m[(0, 0)] - m[(1, 1)] - m[(2, 2)];
        let yy = 1.0 - m[(0, 0)] + m[(1, 1)] - m[(2, 2)];
        let zz = 1.0 - m[(0, 0)] - m[(1, 1)] + m[(2, 2)];

        let q = if ww >= xx && ww >= yy && ww >= zz {
            let w = 0.5 * ww.sqrt();
            let f = 0.25 / w;
            Self {
                w,
                v: Vec3::new(
                    (m[(2, 1)] - m[(1, 2)]) * f,
                    (m[(0, 2)] - m[(2, 0)]) * f,
                    (m[(1, 0)] - m[(0, 1)]) * f,
                ),
            }
        } else if xx >= yy && xx >= zz {
            let x = 0.5 * xx.sqrt();
            let f = 0.25 / x;
            Self {
                w: (m[(2, 1)] - m[(1, 2)]) * f,
                v: Vec3::new(
                    x,
                    (m[(0, 1)] + m[(1, 0)]) * f,
                    (m[(0, 2)] + m[(2, 0)]) * f,
                ),
            }
        } else if yy >= zz {
            let y = 0.5 * yy.sqrt();
            let f = 0.25 / y;
            Self {
                w: (m[(0, 2)] - m[(2, 0)]) * f,
                v: Vec3::new(
                    (m[(0, 1)] + m[(1, 0)]) * f,
                    y,
                    (m[(1, 2)] + m[(2, 1)]) * f,
                ),
            }
        } else {
            let z = 0.5 * zz.sqrt();
            let f = 0.25 / z;
            Self {
                w: (m[(1, 0)] - m[(0, 1)]) * f,
                v: Vec3::new(
                    (m[(0, 2)] + m[(2, 0)]) * f,
                    (m[(1, 2)] + m[(2, 1)]) * f,
                    z,
                ),
            }
        };
        q.normalized()
    }
}

impl std::ops::Mul for Quat {
    type Output = Quat;

    /// Hamilton product; composes rotations right-to-left.
    fn mul(self, rhs: Quat) -> Quat {
        Quat {
            w: self.w * rhs.w - self.v.dot(&rhs.v),
            v: rhs.v * self.w + self.v * rhs.w + self.v.cross(&rhs.v),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn exp_log_round_trip() {
        for w in [
            Vec3::new(0.1, -0.2, 0.3),
            Vec3::new(2.0, 0.0, -1.0),
            Vec3::new(1e-11, 0.0, 0.0),
        ] {
            assert_relative_eq!(Quat::exp(&w).log(), w, epsilon = 1e-10);
        }
    }

    #[test]
    fn exp_agrees_with_axis_angle() {
        let axis = Vec3::new(1.0, -2.0, 2.0).normalize();
        let q = Quat::from_axis_angle(&axis, 0.8);
        assert_relative_eq!(q.w, (0.4_f64).cos(), epsilon = 1e-12);
        assert_relative_eq!(q.v, axis * (0.4_f64).sin(), epsilon = 1e-12);
    }

    #[test]
    fn product_composes_rotations() {
        let a = Quat::from_axis_angle(&Vec3::z(), 0.7);
        let b = Quat::from_axis_angle(&Vec3::x(), -1.1);
        let prod = (a * b).to_matrix();
        let composed = a.to_matrix() * b.to_matrix();
        assert_relative_eq!(prod, composed, epsilon = 1e-12);
    }

    #[test]
    fn two_quarter_turns_make_a_half_turn() {
        let quarter = Quat::from_axis_angle(&Vec3::z(), std::f64::consts::FRAC_PI_2);
        let half = quarter * quarter;
        assert_relative_eq!(
            half.log(),
            Vec3::z() * std::f64::consts::PI,
            epsilon = 1e-12
        );
    }

    #[test]
    fn matrix_is_orthonormal() {
        let m = Quat::exp(&Vec3::new(0.4, 1.3, -0.6)).to_matrix();
        assert_relative_eq!(m * m.transpose(), Mat3::identity(), epsilon = 1e-12);
        assert_relative_eq!(m.determinant(), 1.0, epsilon = 1e-12);
    }

    #[test]
    fn matrix_rotates_points() {
        // A quarter turn about z carries x onto y.
        let m = Quat::from_axis_angle(&Vec3::z(), std::f64::consts::FRAC_PI_2).to_matrix();
        assert_relative_eq!(m * Vec3::x(), Vec3::y(), epsilon = 1e-12);
    }

    #[test]
    fn from_matrix_round_trips_every_branch() {
        // Small angles read off the trace; near-half-turn rotations about
        // each axis drive the three off-trace branches of the recovery.
        for axis in [Vec3::x(), Vec3::y(), Vec3::z(), Vec3::new(0.6, -0.8, 0.0)] {
            for angle in [0.1, 3.0] {
                let q = Quat::from_axis_angle(&axis, angle);
                let r = Quat::from_matrix(&q.to_matrix());
                let same = (q.w - r.w).abs() < 1e-9 && (q.v - r.v).norm() < 1e-9;
                let flipped = (q.w + r.w).abs() < 1e-9 && (q.v + r.v).norm() < 1e-9;
                assert!(same || flipped, "axis {axis:?}: {q:?} vs {r:?}");
            }
        }
    }

    #[test]
    fn conjugate_undoes_the_rotation() {
        let q = Quat::exp(&Vec3::new(-0.3, 0.9, 0.2));
        assert_relative_eq!((q * q.conjugate()).log(), Vec3::zeros(), epsilon = 1e-12);
    }

    #[test]
    fn normalized_handles_degenerate_input() {
        let q = Quat {
            w: 0.0,
            v: Vec3::zeros(),
        };
        assert_eq!(q.normalized().w, 1.0);
    }
}
