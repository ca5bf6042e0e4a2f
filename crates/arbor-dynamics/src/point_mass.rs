//! Point masses and the soft-body lattice attached to a body node.
//!
//! A point mass is a 3 DOF translational node living in its parent body's
//! frame. Its three generalized coordinates are slots in the skeleton's flat
//! coordinate array; the fields here are the per-node parameters and the
//! constraint-impulse slot used by the impulse recursion.

use arbor_math::Vec3;

use crate::gencoord::GenCoordSystem;

/// One node of a soft body's mass lattice.
#[derive(Debug, Clone)]
pub struct PointMass {
    mass: f64,
    /// Rest position in the parent body frame; the generalized positions are
    /// displacements from it.
    rest_position: Vec3,
    /// Indices of neighbouring point masses within the same soft body.
    connected: Vec<usize>,
    /// Spatial constraint impulse (parent body frame).
    constraint_impulse: Vec3,
    /// Scratch: total impulse captured by the bias-impulse pass, consumed by
    /// the velocity-change pass.
    pub(crate) total_impulse: Vec3,
    /// Index of the first of the three owned coordinate slots.
    index_in_skeleton: usize,
}

impl PointMass {
    pub fn new(mass: f64, rest_position: Vec3) -> Self {
        assert!(mass > 0.0, "point mass must be positive");
        Self {
            mass,
            rest_position,
            connected: Vec::new(),
            constraint_impulse: Vec3::zeros(),
            total_impulse: Vec3::zeros(),
            index_in_skeleton: 0,
        }
    }

    #[inline]
    pub fn mass(&self) -> f64 {
        self.mass
    }

    #[inline]
    pub fn rest_position(&self) -> Vec3 {
        self.rest_position
    }

    #[inline]
    pub fn num_connected(&self) -> usize {
        self.connected.len()
    }

    #[inline]
    pub fn connected(&self) -> &[usize] {
        &self.connected
    }

    pub fn connect(&mut self, neighbour: usize) {
        if !self.connected.contains(&neighbour) {
            self.connected.push(neighbour);
        }
    }

    #[inline]
    pub fn constraint_impulse(&self) -> Vec3 {
        self.constraint_impulse
    }

    pub fn set_constraint_impulse(&mut self, imp: Vec3) {
        self.constraint_impulse = imp;
    }

    pub fn add_constraint_impulse(&mut self, imp: Vec3) {
        self.constraint_impulse += imp;
    }

    #[inline]
    pub fn index_in_skeleton(&self) -> usize {
        self.index_in_skeleton
    }

    pub(crate) fn set_index_in_skeleton(&mut self, index: usize) {
        self.index_in_skeleton = index;
    }

    /// Displacement from the rest position (the generalized positions).
    pub fn displacement(&self, gcs: &GenCoordSystem) -> Vec3 {
        let i = self.index_in_skeleton;
        Vec3::new(
            gcs.coord(i).pos,
            gcs.coord(i + 1).pos,
            gcs.coord(i + 2).pos,
        )
    }

    /// Position in the parent body frame.
    pub fn local_position(&self, gcs: &GenCoordSystem) -> Vec3 {
        self.rest_position + self.displacement(gcs)
    }

    /// Velocity relative to the parent body, in the body frame.
    pub fn local_velocity(&self, gcs: &GenCoordSystem) -> Vec3 {
        let i = self.index_in_skeleton;
        Vec3::new(
            gcs.coord(i).vel,
            gcs.coord(i + 1).vel,
            gcs.coord(i + 2).vel,
        )
    }

    /// Applied generalized force (body frame).
    pub fn local_force(&self, gcs: &GenCoordSystem) -> Vec3 {
        let i = self.index_in_skeleton;
        Vec3::new(
            gcs.coord(i).force,
            gcs.coord(i + 1).force,
            gcs.coord(i + 2).force,
        )
    }
}

/// The deformable part of a soft body node: a lattice of point masses with
/// vertex and edge springs.
#[derive(Debug, Clone)]
pub struct SoftBody {
    point_masses: Vec<PointMass>,
    /// Vertex spring stiffness kv (anchors each point mass to its rest
    /// position).
    vertex_stiffness: f64,
    /// Edge spring stiffness ke (couples neighbouring point masses).
    edge_stiffness: f64,
    /// Lattice damping coefficient.
    damping: f64,
}

impl SoftBody {
    pub fn new(vertex_stiffness: f64, edge_stiffness: f64, damping: f64) -> Self {
        assert!(vertex_stiffness >= 0.0 && edge_stiffness >= 0.0 && damping >= 0.0);
        Self {
            point_masses: Vec::new(),
            vertex_stiffness,
            edge_stiffness,
            damping,
        }
    }

    pub fn add_point_mass(&mut self, pm: PointMass) -> usize {
        self.point_masses.push(pm);
        self.point_masses.len() - 1
    }

    /// Register a spring edge between two point masses (both directions).
    pub fn connect(&mut self, a: usize, b: usize) {
        assert!(a != b && a < self.point_masses.len() && b < self.point_masses.len());
        self.point_masses[a].connect(b);
        self.point_masses[b].connect(a);
    }

    #[inline]
    pub fn num_point_masses(&self) -> usize {
        self.point_masses.len()
    }

    #[inline]
    pub fn point_mass(&self, i: usize) -> &PointMass {
        &self.point_masses[i]
    }

    #[inline]
    pub fn point_mass_mut(&mut self, i: usize) -> &mut PointMass {
        &mut self.point_masses[i]
    }

    #[inline]
    pub fn point_masses(&self) -> &[PointMass] {
        &self.point_masses
    }

    #[inline]
    pub(crate) fn point_masses_mut(&mut self) -> &mut [PointMass] {
        &mut self.point_masses
    }

    #[inline]
    pub fn vertex_stiffness(&self) -> f64 {
        self.vertex_stiffness
    }

    #[inline]
    pub fn edge_stiffness(&self) -> f64 {
        self.edge_stiffness
    }

    #[inline]
    pub fn damping_coefficient(&self) -> f64 {
        self.damping
    }

    /// Total lattice mass.
    pub fn total_mass(&self) -> f64 {
        self.point_masses.iter().map(|pm| pm.mass()).sum()
    }

    /// Effective spring stiffness seen by one point mass: the vertex spring
    /// plus one edge spring per neighbour.
    #[inline]
    pub(crate) fn effective_stiffness(&self, pm: &PointMass) -> f64 {
        self.vertex_stiffness + pm.num_connected() as f64 * self.edge_stiffness
    }

    /// Restoring force of the vertex and edge springs on `pm`, with the
    /// semi-implicit `h`-lookahead on positions.
    pub(crate) fn spring_force(&self, pm: &PointMass, h: f64, gcs: &GenCoordSystem) -> Vec3 {
        let q = pm.displacement(gcs);
        let u = pm.local_velocity(gcs);
        let k_total = self.effective_stiffness(pm);

        let mut f = -(q + u * h) * k_total;
        for &j in pm.connected() {
            let nb = &self.point_masses[j];
            f += (nb.displacement(gcs) + nb.local_velocity(gcs) * h) * self.edge_stiffness;
        }
        f
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    fn two_mass_lattice() -> (SoftBody, GenCoordSystem) {
        let mut soft = SoftBody::new(10.0, 4.0, 0.1);
        let a = soft.add_point_mass(PointMass::new(0.5, Vec3::new(1.0, 0.0, 0.0)));
        let b = soft.add_point_mass(PointMass::new(0.5, Vec3::new(-1.0, 0.0, 0.0)));
        soft.connect(a, b);

        let mut gcs = GenCoordSystem::new();
        let ia = gcs.grow(3);
        let ib = gcs.grow(3);
        soft.point_mass_mut(a).set_index_in_skeleton(ia);
        soft.point_mass_mut(b).set_index_in_skeleton(ib);
        (soft, gcs)
    }

    #[test]
    fn rest_state_has_no_spring_force() {
        let (soft, gcs) = two_mass_lattice();
        for pm in soft.point_masses() {
            assert_relative_eq!(soft.spring_force(pm, 0.001, &gcs), Vec3::zeros());
        }
    }

    #[test]
    fn displaced_mass_is_pulled_back() {
        let (soft, mut gcs) = two_mass_lattice();
        gcs.coord_mut(0).pos = 0.2; // displace pm 0 along +x
        let f = soft.spring_force(soft.point_mass(0), 0.0, &gcs);
        // kv + 1 edge spring: -(10 + 4) * 0.2
        assert_relative_eq!(f.x, -2.8, epsilon = 1e-12);
        // ...and the neighbour is dragged along the edge spring.
        let f_nb = soft.spring_force(soft.point_mass(1), 0.0, &gcs);
        assert_relative_eq!(f_nb.x, 4.0 * 0.2, epsilon = 1e-12);
    }

    #[test]
    fn connectivity_is_symmetric_and_deduplicated() {
        let (mut soft, _) = two_mass_lattice();
        soft.connect(0, 1); // second call is a no-op
        assert_eq!(soft.point_mass(0).num_connected(), 1);
        assert_eq!(soft.point_mass(1).num_connected(), 1);
    }

    #[test]
    fn effective_stiffness_counts_neighbours() {
        let (soft, _) = two_mass_lattice();
        assert_relative_eq!(
            soft.effective_stiffness(soft.point_mass(0)),
            14.0,
            epsilon = 1e-12
        );
    }
}
