//! Joints: the mapping from a parent body to a child body through a fixed
//! number of degrees of freedom.
//!
//! Each joint owns a contiguous slice of the skeleton's generalized
//! coordinates starting at `index_in_skeleton()`. Rotational coordinates are
//! exponential coordinates; their integrators compose on SO(3) through the
//! quaternion exp/log maps.

use arbor_math::{DVec, Quat, SpatialTransform, SpatialVec, Vec3};

use crate::gencoord::GenCoord;

/// Joint capability variants with their fixed dof counts.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum JointKind {
    /// 0 DOF rigid attachment.
    Fixed,
    /// Single rotational DOF about an axis.
    Revolute { axis: Vec3 },
    /// Single translational DOF along an axis.
    Prismatic { axis: Vec3 },
    /// 3 DOF ball joint (exponential coordinates).
    Ball,
    /// 6 DOF free joint (translation + exponential coordinates).
    Free,
}

/// A joint connecting a parent body (or the world) to a child body.
#[derive(Debug, Clone)]
pub struct Joint {
    name: String,
    kind: JointKind,
    /// Transform from the parent body frame to the joint frame (constant).
    parent_to_joint: SpatialTransform,
    /// Per-dof viscous damping coefficients.
    damping: Vec<f64>,
    /// Per-dof spring stiffnesses.
    spring_stiffness: Vec<f64>,
    /// Per-dof spring rest positions.
    rest_positions: Vec<f64>,
    /// Index of the first owned generalized coordinate; assigned in init.
    index_in_skeleton: usize,

    // Scratch for the articulated recursions: the joint-space total force
    // and total impulse of the current backward pass.
    pub(crate) total_force: DVec,
    pub(crate) total_impulse: DVec,
}

impl Joint {
    fn with_kind(name: impl Into<String>, kind: JointKind, parent_to_joint: SpatialTransform) -> Self {
        let ndof = match kind {
            JointKind::Fixed => 0,
            JointKind::Revolute { .. } | JointKind::Prismatic { .. } => 1,
            JointKind::Ball => 3,
            JointKind::Free => 6,
        };
        Self {
            name: name.into(),
            kind,
            parent_to_joint,
            damping: vec![0.0; ndof],
            spring_stiffness: vec![0.0; ndof],
            rest_positions: vec![0.0; ndof],
            index_in_skeleton: 0,
            total_force: DVec::zeros(ndof),
            total_impulse: DVec::zeros(ndof),
        }
    }

    /// Create a revolute joint about `axis`.
    pub fn revolute(name: impl Into<String>, parent_to_joint: SpatialTransform, axis: Vec3) -> Self {
        Self::with_kind(name, JointKind::Revolute { axis }, parent_to_joint)
    }

    /// Create a prismatic joint along `axis`.
    pub fn prismatic(name: impl Into<String>, parent_to_joint: SpatialTransform, axis: Vec3) -> Self {
        Self::with_kind(name, JointKind::Prismatic { axis }, parent_to_joint)
    }

    /// Create a 3 DOF ball joint.
    pub fn ball(name: impl Into<String>, parent_to_joint: SpatialTransform) -> Self {
        Self::with_kind(name, JointKind::Ball, parent_to_joint)
    }

    /// Create a 6 DOF free joint.
    pub fn free(name: impl Into<String>, parent_to_joint: SpatialTransform) -> Self {
        Self::with_kind(name, JointKind::Free, parent_to_joint)
    }

    /// Create a 0 DOF fixed joint.
    pub fn fixed(name: impl Into<String>, parent_to_joint: SpatialTransform) -> Self {
        Self::with_kind(name, JointKind::Fixed, parent_to_joint)
    }

    #[inline]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[inline]
    pub fn kind(&self) -> &JointKind {
        &self.kind
    }

    /// Number of degrees of freedom of this joint.
    #[inline]
    pub fn num_dofs(&self) -> usize {
        self.damping.len()
    }

    /// Index of the joint's first generalized coordinate in the skeleton.
    #[inline]
    pub fn index_in_skeleton(&self) -> usize {
        self.index_in_skeleton
    }

    pub(crate) fn set_index_in_skeleton(&mut self, index: usize) {
        self.index_in_skeleton = index;
    }

    /// Per-dof damping coefficient.
    #[inline]
    pub fn damping_coefficient(&self, dof: usize) -> f64 {
        self.damping[dof]
    }

    pub fn set_damping_coefficient(&mut self, dof: usize, d: f64) {
        assert!(d >= 0.0, "damping coefficient must be non-negative");
        self.damping[dof] = d;
    }

    /// Per-dof spring stiffness.
    #[inline]
    pub fn spring_stiffness(&self, dof: usize) -> f64 {
        self.spring_stiffness[dof]
    }

    pub fn set_spring_stiffness(&mut self, dof: usize, k: f64) {
        assert!(k >= 0.0, "spring stiffness must be non-negative");
        self.spring_stiffness[dof] = k;
    }

    /// Per-dof spring rest position.
    #[inline]
    pub fn rest_position(&self, dof: usize) -> f64 {
        self.rest_positions[dof]
    }

    pub fn set_rest_position(&mut self, dof: usize, q0: f64) {
        self.rest_positions[dof] = q0;
    }

    /// The joint's coordinate transform for positions `q`, composed from the
    /// configuration-dependent part and the constant parent-to-joint offset.
    /// The result maps parent-frame spatial vectors to child-frame ones.
    pub fn relative_transform(&self, q: &[f64]) -> SpatialTransform {
        self.variable_transform(q).compose(&self.parent_to_joint)
    }

    /// The configuration-dependent part of the joint transform.
    fn variable_transform(&self, q: &[f64]) -> SpatialTransform {
        match self.kind {
            JointKind::Fixed => SpatialTransform::identity(),
            JointKind::Revolute { axis } => {
                // Coordinate map is the inverse of the physical rotation.
                let (s, c) = (-q[0]).sin_cos();
                let ax = arbor_math::skew(&axis);
                let rot = arbor_math::Mat3::identity() + ax * s + ax * ax * (1.0 - c);
                SpatialTransform::new(rot, Vec3::zeros())
            }
            JointKind::Prismatic { axis } => {
                SpatialTransform::from_translation(axis * q[0])
            }
            JointKind::Ball => {
                let w = Vec3::new(q[0], q[1], q[2]);
                SpatialTransform::new(Quat::exp(&-w).to_matrix(), Vec3::zeros())
            }
            JointKind::Free => {
                let pos = Vec3::new(q[0], q[1], q[2]);
                let w = Vec3::new(q[3], q[4], q[5]);
                SpatialTransform::new(Quat::exp(&-w).to_matrix(), pos)
            }
        }
    }

    /// Columns of the motion subspace S, expressed in the child body frame.
    pub fn subspace_columns(&self) -> Vec<SpatialVec> {
        match self.kind {
            JointKind::Fixed => Vec::new(),
            JointKind::Revolute { axis } => vec![SpatialVec::new(axis, Vec3::zeros())],
            JointKind::Prismatic { axis } => vec![SpatialVec::new(Vec3::zeros(), axis)],
            JointKind::Ball => vec![
                SpatialVec::new(Vec3::x(), Vec3::zeros()),
                SpatialVec::new(Vec3::y(), Vec3::zeros()),
                SpatialVec::new(Vec3::z(), Vec3::zeros()),
            ],
            JointKind::Free => vec![
                SpatialVec::new(Vec3::x(), Vec3::zeros()),
                SpatialVec::new(Vec3::y(), Vec3::zeros()),
                SpatialVec::new(Vec3::z(), Vec3::zeros()),
                SpatialVec::new(Vec3::zeros(), Vec3::x()),
                SpatialVec::new(Vec3::zeros(), Vec3::y()),
                SpatialVec::new(Vec3::zeros(), Vec3::z()),
            ],
        }
    }

    /// S·q̇ for this joint.
    pub fn joint_velocity(&self, qd: &[f64]) -> SpatialVec {
        match self.kind {
            JointKind::Fixed => SpatialVec::zero(),
            JointKind::Revolute { axis } => SpatialVec::new(axis * qd[0], Vec3::zeros()),
            JointKind::Prismatic { axis } => SpatialVec::new(Vec3::zeros(), axis * qd[0]),
            JointKind::Ball => {
                SpatialVec::new(Vec3::new(qd[0], qd[1], qd[2]), Vec3::zeros())
            }
            JointKind::Free => SpatialVec::new(
                Vec3::new(qd[0], qd[1], qd[2]),
                Vec3::new(qd[3], qd[4], qd[5]),
            ),
        }
    }

    /// Semi-implicit Euler position update: q ← q ⊞ h·q̇, composing on the
    /// rotation group for rotational coordinates.
    pub fn integrate_positions(&self, h: f64, coords: &mut [GenCoord]) {
        match self.kind {
            JointKind::Fixed => {}
            JointKind::Revolute { .. } | JointKind::Prismatic { .. } => {
                coords[0].pos += h * coords[0].vel;
            }
            JointKind::Ball => {
                let q = Vec3::new(coords[0].pos, coords[1].pos, coords[2].pos);
                let w = Vec3::new(coords[0].vel, coords[1].vel, coords[2].vel);
                let next = (Quat::exp(&q) * Quat::exp(&(w * h))).log();
                for k in 0..3 {
                    coords[k].pos = next[k];
                }
            }
            JointKind::Free => {
                let x = Vec3::new(coords[0].pos, coords[1].pos, coords[2].pos);
                let q = Vec3::new(coords[3].pos, coords[4].pos, coords[5].pos);
                let w = Vec3::new(coords[0].vel, coords[1].vel, coords[2].vel);
                let v = Vec3::new(coords[3].vel, coords[4].vel, coords[5].vel);

                // Linear velocity is expressed in the body frame; rotate it
                // out before translating.
                let rot = Quat::exp(&q);
                let next_x = x + rot.to_matrix() * v * h;
                let next_q = (rot * Quat::exp(&(w * h))).log();
                for k in 0..3 {
                    coords[k].pos = next_x[k];
                    coords[3 + k].pos = next_q[k];
                }
            }
        }
    }

    /// Semi-implicit Euler velocity update: q̇ ← q̇ + h·q̈.
    pub fn integrate_velocities(&self, h: f64, coords: &mut [GenCoord]) {
        for c in coords.iter_mut() {
            c.vel += h * c.acc;
        }
    }

    /// Elastic potential energy stored in the joint springs.
    pub fn potential_energy(&self, coords: &[GenCoord]) -> f64 {
        self.spring_stiffness
            .iter()
            .zip(self.rest_positions.iter())
            .zip(coords.iter())
            .map(|((k, q0), c)| 0.5 * k * (c.pos - q0) * (c.pos - q0))
            .sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    fn coords(n: usize) -> Vec<GenCoord> {
        (0..n).map(GenCoord::new).collect()
    }

    #[test]
    fn revolute_transform_moves_points_the_right_way() {
        // A point on the child's x axis, with the child rotated +90° about z,
        // sits on the parent's y axis.
        let joint = Joint::revolute("j", SpatialTransform::identity(), Vec3::z());
        let xf = joint.relative_transform(&[std::f64::consts::FRAC_PI_2]);
        let p_parent = xf.point_to_parent(&Vec3::x());
        assert_relative_eq!(p_parent, Vec3::y(), epsilon = 1e-12);
    }

    #[test]
    fn free_transform_combines_translation_and_rotation() {
        let joint = Joint::free("j", SpatialTransform::identity());
        let q = [1.0, 2.0, 3.0, 0.0, 0.0, std::f64::consts::FRAC_PI_2];
        let xf = joint.relative_transform(&q);
        assert_relative_eq!(xf.pos, Vec3::new(1.0, 2.0, 3.0), epsilon = 1e-12);
        let p = xf.point_to_parent(&Vec3::x());
        assert_relative_eq!(p, Vec3::new(1.0, 3.0, 3.0), epsilon = 1e-12);
    }

    #[test]
    fn ball_integration_composes_on_the_group() {
        let joint = Joint::ball("j", SpatialTransform::identity());
        let mut cs = coords(3);
        // Quarter turn about x, then integrate a spin about the (rotated) y.
        cs[0].pos = std::f64::consts::FRAC_PI_2;
        cs[1].vel = 1.0;
        joint.integrate_positions(0.5, &mut cs);

        let q = Vec3::new(cs[0].pos, cs[1].pos, cs[2].pos);
        let expected =
            Quat::exp(&(Vec3::x() * std::f64::consts::FRAC_PI_2)) * Quat::exp(&(Vec3::y() * 0.5));
        assert_relative_eq!(q, expected.log(), epsilon = 1e-12);
    }

    #[test]
    fn free_translation_follows_body_frame_velocity() {
        let joint = Joint::free("j", SpatialTransform::identity());
        let mut cs = coords(6);
        // Body yawed 90° about z; forward (body x) velocity should move the
        // body along world y.
        cs[5].pos = std::f64::consts::FRAC_PI_2;
        cs[3].vel = 1.0;
        joint.integrate_positions(0.1, &mut cs);
        assert_relative_eq!(cs[0].pos, 0.0, epsilon = 1e-12);
        assert_relative_eq!(cs[1].pos, 0.1, epsilon = 1e-12);
    }

    #[test]
    fn subspace_matches_joint_velocity() {
        let joint = Joint::free("j", SpatialTransform::identity());
        let qd = [0.1, -0.2, 0.3, 0.4, -0.5, 0.6];
        let direct = joint.joint_velocity(&qd);
        let mut summed = SpatialVec::zero();
        for (k, s) in joint.subspace_columns().iter().enumerate() {
            summed += *s * qd[k];
        }
        assert_relative_eq!(direct.as_vec6(), summed.as_vec6(), epsilon = 1e-12);
    }

    #[test]
    fn spring_energy_uses_rest_position() {
        let mut joint = Joint::revolute("j", SpatialTransform::identity(), Vec3::z());
        joint.set_spring_stiffness(0, 10.0);
        joint.set_rest_position(0, 0.5);
        let mut cs = coords(1);
        cs[0].pos = 1.5;
        assert_relative_eq!(joint.potential_energy(&cs), 5.0, epsilon = 1e-12);
    }
}
