//! Spatial (6D) algebra for articulated-body dynamics.
//!
//! Twists and wrenches are kept as their angular and linear 3-vector parts
//! (Featherstone ordering [angular; linear] when flattened). Frame changes
//! are Plücker transforms stored as a rotation plus an origin offset.

use crate::{skew, Mat3, Mat6, Vec3, Vec6};

/// A 6D motion vector (twist) or force vector (wrench), split into its
/// angular and linear parts.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SpatialVec {
    pub ang: Vec3,
    pub lin: Vec3,
}

impl SpatialVec {
    #[inline]
    pub fn new(angular: Vec3, linear: Vec3) -> Self {
        Self {
            ang: angular,
            lin: linear,
        }
    }

    #[inline]
    pub fn zero() -> Self {
        Self {
            ang: Vec3::zeros(),
            lin: Vec3::zeros(),
        }
    }

    /// Angular part (rows 0..3 of the flattened vector).
    #[inline]
    pub fn angular(&self) -> Vec3 {
        self.ang
    }

    /// Linear part (rows 3..6 of the flattened vector).
    #[inline]
    pub fn linear(&self) -> Vec3 {
        self.lin
    }

    /// Flatten to a stacked 6-vector.
    #[inline]
    pub fn as_vec6(&self) -> Vec6 {
        Vec6::new(
            self.ang.x, self.ang.y, self.ang.z, self.lin.x, self.lin.y, self.lin.z,
        )
    }

    /// Rebuild from a stacked 6-vector.
    #[inline]
    pub fn from_vec6(v: &Vec6) -> Self {
        Self {
            ang: v.fixed_rows::<3>(0).into_owned(),
            lin: v.fixed_rows::<3>(3).into_owned(),
        }
    }

    /// Motion-motion cross product v ×ₘ m, used when propagating velocities.
    pub fn cross_motion(&self, m: &SpatialVec) -> SpatialVec {
        SpatialVec {
            ang: self.ang.cross(&m.ang),
            lin: self.ang.cross(&m.lin) + self.lin.cross(&m.ang),
        }
    }

    /// Motion-force cross product v ×* f, the dual of ×ₘ; carries the
    /// gyroscopic terms of the bias forces.
    pub fn cross_force(&self, f: &SpatialVec) -> SpatialVec {
        SpatialVec {
            ang: self.ang.cross(&f.ang) + self.lin.cross(&f.lin),
            lin: self.ang.cross(&f.lin),
        }
    }

    /// Pairing of a motion with a force vector (instantaneous power).
    #[inline]
    pub fn dot(&self, other: &SpatialVec) -> f64 {
        self.ang.dot(&other.ang) + self.lin.dot(&other.lin)
    }
}

impl std::ops::Add for SpatialVec {
    type Output = SpatialVec;
    #[inline]
    fn add(self, rhs: SpatialVec) -> SpatialVec {
        SpatialVec {
            ang: self.ang + rhs.ang,
            lin: self.lin + rhs.lin,
        }
    }
}

impl std::ops::AddAssign for SpatialVec {
    #[inline]
    fn add_assign(&mut self, rhs: SpatialVec) {
        self.ang += rhs.ang;
        self.lin += rhs.lin;
    }
}

impl std::ops::Sub for SpatialVec {
    type Output = SpatialVec;
    #[inline]
    fn sub(self, rhs: SpatialVec) -> SpatialVec {
        SpatialVec {
            ang: self.ang - rhs.ang,
            lin: self.lin - rhs.lin,
        }
    }
}

impl std::ops::Mul<f64> for SpatialVec {
    type Output = SpatialVec;
    #[inline]
    fn mul(self, rhs: f64) -> SpatialVec {
        SpatialVec {
            ang: self.ang * rhs,
            lin: self.lin * rhs,
        }
    }
}

impl std::ops::Neg for SpatialVec {
    type Output = SpatialVec;
    #[inline]
    fn neg(self) -> SpatialVec {
        SpatialVec {
            ang: -self.ang,
            lin: -self.lin,
        }
    }
}

/// A 6×6 operator on spatial vectors; the articulated inertias and their
/// projections live here.
#[derive(Debug, Clone, Copy)]
pub struct SpatialMat {
    pub data: Mat6,
}

impl SpatialMat {
    #[inline]
    pub fn from_mat6(data: Mat6) -> Self {
        Self { data }
    }

    #[inline]
    pub fn zero() -> Self {
        Self {
            data: Mat6::zeros(),
        }
    }

    /// Rank-one operator a·bᵀ.
    #[inline]
    pub fn outer(a: &SpatialVec, b: &SpatialVec) -> Self {
        Self {
            data: a.as_vec6() * b.as_vec6().transpose(),
        }
    }

    #[inline]
    pub fn mul_vec(&self, v: &SpatialVec) -> SpatialVec {
        SpatialVec::from_vec6(&(self.data * v.as_vec6()))
    }
}

impl std::ops::Add for SpatialMat {
    type Output = SpatialMat;
    #[inline]
    fn add(self, rhs: SpatialMat) -> SpatialMat {
        SpatialMat {
            data: self.data + rhs.data,
        }
    }
}

impl std::ops::AddAssign for SpatialMat {
    #[inline]
    fn add_assign(&mut self, rhs: SpatialMat) {
        self.data += rhs.data;
    }
}

impl std::ops::Sub for SpatialMat {
    type Output = SpatialMat;
    #[inline]
    fn sub(self, rhs: SpatialMat) -> SpatialMat {
        SpatialMat {
            data: self.data - rhs.data,
        }
    }
}

impl std::ops::Mul<f64> for SpatialMat {
    type Output = SpatialMat;
    #[inline]
    fn mul(self, rhs: f64) -> SpatialMat {
        SpatialMat {
            data: self.data * rhs,
        }
    }
}

/// A Plücker coordinate transform between frames.
///
/// `rot` maps A-frame coordinates into B-frame coordinates; `pos` is the
/// origin of B expressed in A. Applying the transform moves spatial vectors
/// from A to B.
#[derive(Debug, Clone, Copy)]
pub struct SpatialTransform {
    pub rot: Mat3,
    pub pos: Vec3,
}

impl SpatialTransform {
    #[inline]
    pub fn new(rot: Mat3, pos: Vec3) -> Self {
        Self { rot, pos }
    }

    pub fn identity() -> Self {
        Self {
            rot: Mat3::identity(),
            pos: Vec3::zeros(),
        }
    }

    /// Pure translation of the frame origin.
    pub fn from_translation(pos: Vec3) -> Self {
        Self {
            rot: Mat3::identity(),
            pos,
        }
    }

    /// Map a point in B coordinates to A coordinates.
    #[inline]
    pub fn point_to_parent(&self, p: &Vec3) -> Vec3 {
        self.pos + self.rot.transpose() * p
    }

    /// self ∘ other, where other is A→B and self is B→C; the result is A→C.
    pub fn compose(&self, other: &SpatialTransform) -> SpatialTransform {
        SpatialTransform {
            rot: self.rot * other.rot,
            pos: other.point_to_parent(&self.pos),
        }
    }

    /// The B→A transform.
    pub fn inverse(&self) -> SpatialTransform {
        SpatialTransform {
            rot: self.rot.transpose(),
            pos: -(self.rot * self.pos),
        }
    }

    /// Move a motion vector from A to B: the linear part loses the moment
    /// of the angular part about the new origin.
    pub fn apply_motion(&self, v: &SpatialVec) -> SpatialVec {
        SpatialVec {
            ang: self.rot * v.ang,
            lin: self.rot * (v.lin - self.pos.cross(&v.ang)),
        }
    }

    /// Move a force vector from A to B; dual to `apply_motion`, so the
    /// torque picks up the moment of the force instead.
    pub fn apply_force(&self, f: &SpatialVec) -> SpatialVec {
        SpatialVec {
            ang: self.rot * (f.ang - self.pos.cross(&f.lin)),
            lin: self.rot * f.lin,
        }
    }

    /// Move a motion vector from B back to A.
    pub fn inv_apply_motion(&self, v: &SpatialVec) -> SpatialVec {
        self.inverse().apply_motion(v)
    }

    /// Move a force vector from B back to A.
    pub fn inv_apply_force(&self, f: &SpatialVec) -> SpatialVec {
        self.inverse().apply_force(f)
    }

    /// The 6×6 matrix acting on flattened motion vectors.
    pub fn to_motion_matrix(&self) -> Mat6 {
        self.plucker(false)
    }

    /// The 6×6 matrix acting on flattened force vectors (the inverse
    /// transpose of the motion form).
    pub fn to_force_matrix(&self) -> Mat6 {
        self.plucker(true)
    }

    fn plucker(&self, dual: bool) -> Mat6 {
        let shift = -self.rot * skew(&self.pos);
        let mut x = Mat6::zeros();
        x.fixed_view_mut::<3, 3>(0, 0).copy_from(&self.rot);
        x.fixed_view_mut::<3, 3>(3, 3).copy_from(&self.rot);
        if dual {
            x.fixed_view_mut::<3, 3>(0, 3).copy_from(&shift);
        } else {
            x.fixed_view_mut::<3, 3>(3, 0).copy_from(&shift);
        }
        x
    }
}

/// The spatial inertia of a rigid body: mass, center of mass, and the
/// rotational inertia about the center of mass.
#[derive(Debug, Clone, Copy)]
pub struct SpatialInertia {
    pub mass: f64,
    pub com: Vec3,
    pub inertia: Mat3,
}

impl SpatialInertia {
    pub fn new(mass: f64, com: Vec3, inertia: Mat3) -> Self {
        Self { mass, com, inertia }
    }

    /// A point mass at `pos` in the body frame.
    pub fn point_mass(mass: f64, pos: Vec3) -> Self {
        Self {
            mass,
            com: pos,
            inertia: Mat3::zeros(),
        }
    }

    /// A uniform rod of the given length along the y axis, centered at the
    /// origin.
    pub fn rod(mass: f64, length: f64) -> Self {
        let i = mass * length * length / 12.0;
        Self {
            mass,
            com: Vec3::zeros(),
            inertia: Mat3::from_diagonal(&Vec3::new(i, 0.0, i)),
        }
    }

    /// A uniform solid sphere centered at the origin.
    pub fn sphere(mass: f64, radius: f64) -> Self {
        let i = 0.4 * mass * radius * radius;
        Self {
            mass,
            com: Vec3::zeros(),
            inertia: Mat3::identity() * i,
        }
    }

    /// A uniform box with the given half extents, centered at the origin.
    pub fn cuboid(mass: f64, half_extents: Vec3) -> Self {
        let s = half_extents.component_mul(&half_extents) * (mass / 3.0);
        Self {
            mass,
            com: Vec3::zeros(),
            inertia: Mat3::from_diagonal(&Vec3::new(s.y + s.z, s.x + s.z, s.x + s.y)),
        }
    }

    /// The 6×6 spatial inertia about the body frame origin, assembled from
    /// the cross matrix of the first moment h = m·c:
    ///
    /// I_spatial = | I_com + [c]×·[h]×ᵀ  [h]× |
    ///             | [h]×ᵀ               m·E  |
    pub fn to_matrix(&self) -> SpatialMat {
        let h = skew(&(self.com * self.mass));
        let top_left = self.inertia + skew(&self.com) * h.transpose();

        let mut m = Mat6::zeros();
        m.fixed_view_mut::<3, 3>(0, 0).copy_from(&top_left);
        m.fixed_view_mut::<3, 3>(0, 3).copy_from(&h);
        m.fixed_view_mut::<3, 3>(3, 0).copy_from(&h.transpose());
        m.fixed_view_mut::<3, 3>(3, 3)
            .copy_from(&(Mat3::identity() * self.mass));
        SpatialMat::from_mat6(m)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Quat;
    use approx::assert_relative_eq;

    fn xf(scaled_axis: Vec3, pos: Vec3) -> SpatialTransform {
        // The coordinate map of a frame rotated by exp(scaled_axis) is the
        // transpose of that rotation.
        SpatialTransform::new(Quat::exp(&scaled_axis).to_matrix().transpose(), pos)
    }

    #[test]
    fn point_mapping_round_trips() {
        let x = xf(Vec3::new(0.3, -0.1, 0.8), Vec3::new(0.5, -1.0, 2.0));
        let p = Vec3::new(0.1, 0.2, 0.3);
        let back = x.inverse().point_to_parent(&x.point_to_parent(&p));
        assert_relative_eq!(back, p, epsilon = 1e-12);
    }

    #[test]
    fn composition_chains_point_maps() {
        let a_to_b = xf(Vec3::new(0.0, 0.4, 0.0), Vec3::new(1.0, 0.0, 0.0));
        let b_to_c = xf(Vec3::new(-0.2, 0.0, 0.9), Vec3::new(0.0, 2.0, -1.0));
        let a_to_c = b_to_c.compose(&a_to_b);

        let p = Vec3::new(-0.7, 0.3, 0.5);
        assert_relative_eq!(
            a_to_c.point_to_parent(&p),
            a_to_b.point_to_parent(&b_to_c.point_to_parent(&p)),
            epsilon = 1e-12
        );
    }

    #[test]
    fn motion_transform_round_trips() {
        let x = xf(Vec3::new(1.1, 0.2, -0.4), Vec3::new(0.3, 0.6, -0.9));
        let v = SpatialVec::new(Vec3::new(0.5, -0.2, 0.1), Vec3::new(1.0, 0.0, -1.0));
        let back = x.inv_apply_motion(&x.apply_motion(&v));
        assert_relative_eq!(back.as_vec6(), v.as_vec6(), epsilon = 1e-12);
    }

    #[test]
    fn translation_shifts_the_linear_part_only() {
        let x = SpatialTransform::from_translation(Vec3::new(0.0, 2.0, 0.0));
        let twist = SpatialVec::new(Vec3::z(), Vec3::zeros());
        let moved = x.apply_motion(&twist);
        // A rotation about the old origin's z, observed at a point offset
        // along +y, sweeps that point toward −x.
        assert_relative_eq!(moved.ang, Vec3::z(), epsilon = 1e-12);
        assert_relative_eq!(moved.lin, Vec3::new(-2.0, 0.0, 0.0), epsilon = 1e-12);
    }

    #[test]
    fn inertia_of_point_mass_matches_particle_energy() {
        // ½·ξᵀ·I·ξ for a point mass must equal ½·m·|v + ω×p|².
        let inertia = SpatialInertia::point_mass(2.5, Vec3::new(0.3, -0.2, 0.7));
        let twist = SpatialVec::new(Vec3::new(0.4, 0.1, -0.9), Vec3::new(-0.5, 1.2, 0.3));
        let spatial_ke = 0.5 * twist.dot(&inertia.to_matrix().mul_vec(&twist));
        let particle_v = twist.lin + twist.ang.cross(&inertia.com);
        assert_relative_eq!(
            spatial_ke,
            0.5 * 2.5 * particle_v.norm_squared(),
            epsilon = 1e-12
        );
    }

    #[test]
    fn shape_inertias_have_the_expected_diagonals() {
        let rod = SpatialInertia::rod(3.0, 2.0);
        assert_relative_eq!(rod.inertia[(0, 0)], 1.0, epsilon = 1e-12);
        assert_relative_eq!(rod.inertia[(1, 1)], 0.0, epsilon = 1e-12);

        let ball = SpatialInertia::sphere(5.0, 0.1);
        assert_relative_eq!(ball.inertia[(2, 2)], 0.02, epsilon = 1e-12);

        let block = SpatialInertia::cuboid(3.0, Vec3::new(1.0, 2.0, 3.0));
        assert_relative_eq!(block.inertia[(0, 0)], 4.0 + 9.0, epsilon = 1e-12);
        assert_relative_eq!(block.inertia[(1, 1)], 1.0 + 9.0, epsilon = 1e-12);
    }
}

#[cfg(test)]
mod prop_tests {
    use super::*;
    use crate::Quat;
    use proptest::prelude::*;

    const EPS: f64 = 1e-9;

    fn arb_vec3() -> impl Strategy<Value = Vec3> {
        (-5.0..5.0_f64, -5.0..5.0_f64, -5.0..5.0_f64).prop_map(|(x, y, z)| Vec3::new(x, y, z))
    }

    fn arb_spatial() -> impl Strategy<Value = SpatialVec> {
        (arb_vec3(), arb_vec3()).prop_map(|(a, l)| SpatialVec::new(a, l))
    }

    fn arb_transform() -> impl Strategy<Value = SpatialTransform> {
        (arb_vec3(), arb_vec3()).prop_map(|(w, p)| {
            SpatialTransform::new(Quat::exp(&w).to_matrix(), p)
        })
    }

    proptest! {
        #[test]
        fn cross_products_are_dual(
            v in arb_spatial(),
            m in arb_spatial(),
            f in arb_spatial(),
        ) {
            // (v ×ₘ m) · f = −m · (v ×* f)
            let lhs = v.cross_motion(&m).dot(&f);
            let rhs = -m.dot(&v.cross_force(&f));
            prop_assert!((lhs - rhs).abs() < 1e-6, "{lhs} vs {rhs}");
        }

        #[test]
        fn power_is_frame_invariant(
            x in arb_transform(),
            v in arb_spatial(),
            f in arb_spatial(),
        ) {
            let before = v.dot(&f);
            let after = x.apply_motion(&v).dot(&x.apply_force(&f));
            prop_assert!((before - after).abs() < 1e-6, "{before} vs {after}");
        }

        #[test]
        fn matrix_forms_match_the_direct_application(
            x in arb_transform(),
            v in arb_spatial(),
        ) {
            let by_matrix = x.to_motion_matrix() * v.as_vec6();
            let direct = x.apply_motion(&v).as_vec6();
            for k in 0..6 {
                prop_assert!((by_matrix[k] - direct[k]).abs() < EPS);
            }

            let by_matrix = x.to_force_matrix() * v.as_vec6();
            let direct = x.apply_force(&v).as_vec6();
            for k in 0..6 {
                prop_assert!((by_matrix[k] - direct[k]).abs() < EPS);
            }
        }

        #[test]
        fn force_form_is_the_inverse_transpose(x in arb_transform()) {
            let product = x.to_force_matrix().transpose() * x.to_motion_matrix();
            let id = Mat6::identity();
            for r in 0..6 {
                for c in 0..6 {
                    prop_assert!((product[(r, c)] - id[(r, c)]).abs() < EPS);
                }
            }
        }

        #[test]
        fn inverse_composes_to_identity(x in arb_transform()) {
            let id = x.compose(&x.inverse());
            for r in 0..3 {
                for c in 0..3 {
                    let expected = if r == c { 1.0 } else { 0.0 };
                    prop_assert!((id.rot[(r, c)] - expected).abs() < EPS);
                }
            }
            prop_assert!(id.pos.norm() < EPS);
        }

        #[test]
        fn inertia_matrix_is_symmetric(
            mass in 0.1..50.0_f64,
            com in arb_vec3(),
        ) {
            let m = SpatialInertia::point_mass(mass, com).to_matrix().data;
            for r in 0..6 {
                for c in 0..6 {
                    prop_assert!((m[(r, c)] - m[(c, r)]).abs() < EPS);
                }
            }
        }
    }
}
