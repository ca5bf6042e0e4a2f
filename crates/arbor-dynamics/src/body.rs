//! Rigid body nodes of the skeleton tree.
//!
//! A `BodyNode` carries its identity and tree links, the rigid-body
//! parameters, the kinematic state, and the per-pass scratch fields the
//! recursive algorithms write (articulated inertias, bias force/impulse,
//! column-scan accumulators). The `Skeleton` drives the recursions; every
//! method here computes one body's share of one pass.
//!
//! All spatial quantities are expressed in the body's own frame unless
//! stated otherwise.

use arbor_math::{DMat, DVec, SpatialInertia, SpatialMat, SpatialTransform, SpatialVec, Vec3};

use crate::gencoord::GenCoordSystem;
use crate::joint::Joint;
use crate::marker::Marker;
use crate::point_mass::{PointMass, SoftBody};

/// A rigid body, or the rigid core of a soft body.
#[derive(Debug, Clone)]
pub struct BodyNode {
    name: String,
    index: usize,
    parent: Option<usize>,
    children: Vec<usize>,
    parent_joint: Joint,
    inertia: SpatialInertia,
    gravity_mode: bool,
    is_collidable: bool,
    friction_coeff: f64,
    restitution_coeff: f64,
    markers: Vec<Marker>,
    soft: Option<SoftBody>,

    // Kinematic state.
    world_transform: SpatialTransform,
    rel_transform: SpatialTransform,
    velocity: SpatialVec,
    acceleration: SpatialVec,
    partial_acceleration: SpatialVec,

    // Forces and impulses.
    external_force: SpatialVec,
    transmitted_force: SpatialVec,
    constraint_impulse: SpatialVec,

    // Articulated-body scratch.
    pub(crate) art_inertia: SpatialMat,
    pub(crate) art_inertia_implicit: SpatialMat,
    pub(crate) bias_force: SpatialVec,
    pub(crate) bias_impulse: SpatialVec,
    pub(crate) del_v: SpatialVec,
    pub(crate) imp_transmitted: SpatialVec,

    // Column-scan scratch.
    pub(crate) mm_dv: SpatialVec,
    pub(crate) mm_f: SpatialVec,
    pub(crate) invm_bias: SpatialVec,
    pub(crate) invm_dv: SpatialVec,
    pub(crate) cg_dv: SpatialVec,
    pub(crate) cg_f: SpatialVec,
    pub(crate) g_f: SpatialVec,
    pub(crate) fext_f: SpatialVec,

    // Jacobian caches.
    dependent_gen_coords: Vec<usize>,
    body_jacobian: DMat,
    pub(crate) body_jacobian_dirty: bool,
    body_jacobian_time_deriv: DMat,
    pub(crate) body_jacobian_time_deriv_dirty: bool,
}

impl BodyNode {
    pub fn new(name: impl Into<String>, parent_joint: Joint, inertia: SpatialInertia) -> Self {
        assert!(inertia.mass > 0.0, "body mass must be positive");
        Self {
            name: name.into(),
            index: 0,
            parent: None,
            children: Vec::new(),
            parent_joint,
            inertia,
            gravity_mode: true,
            is_collidable: true,
            friction_coeff: 1.0,
            restitution_coeff: 0.0,
            markers: Vec::new(),
            soft: None,
            world_transform: SpatialTransform::identity(),
            rel_transform: SpatialTransform::identity(),
            velocity: SpatialVec::zero(),
            acceleration: SpatialVec::zero(),
            partial_acceleration: SpatialVec::zero(),
            external_force: SpatialVec::zero(),
            transmitted_force: SpatialVec::zero(),
            constraint_impulse: SpatialVec::zero(),
            art_inertia: SpatialMat::zero(),
            art_inertia_implicit: SpatialMat::zero(),
            bias_force: SpatialVec::zero(),
            bias_impulse: SpatialVec::zero(),
            del_v: SpatialVec::zero(),
            imp_transmitted: SpatialVec::zero(),
            mm_dv: SpatialVec::zero(),
            mm_f: SpatialVec::zero(),
            invm_bias: SpatialVec::zero(),
            invm_dv: SpatialVec::zero(),
            cg_dv: SpatialVec::zero(),
            cg_f: SpatialVec::zero(),
            g_f: SpatialVec::zero(),
            fext_f: SpatialVec::zero(),
            dependent_gen_coords: Vec::new(),
            body_jacobian: DMat::zeros(6, 0),
            body_jacobian_dirty: true,
            body_jacobian_time_deriv: DMat::zeros(6, 0),
            body_jacobian_time_deriv_dirty: true,
        }
    }

    // ── identity and tree links ──────────────────────────────────────────

    #[inline]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Position of this body in the skeleton's BFS body array.
    #[inline]
    pub fn index_in_skeleton(&self) -> usize {
        self.index
    }

    #[inline]
    pub fn parent_index(&self) -> Option<usize> {
        self.parent
    }

    #[inline]
    pub fn child_indices(&self) -> &[usize] {
        &self.children
    }

    #[inline]
    pub fn parent_joint(&self) -> &Joint {
        &self.parent_joint
    }

    #[inline]
    pub fn parent_joint_mut(&mut self) -> &mut Joint {
        &mut self.parent_joint
    }

    pub(crate) fn set_index(&mut self, index: usize) {
        self.index = index;
    }

    pub(crate) fn set_parent(&mut self, parent: Option<usize>) {
        self.parent = parent;
    }

    pub(crate) fn set_children(&mut self, children: Vec<usize>) {
        self.children = children;
    }

    pub(crate) fn add_child(&mut self, child: usize) {
        self.children.push(child);
    }

    // ── parameters ───────────────────────────────────────────────────────

    /// Mass of the rigid core (lattice masses are counted separately).
    #[inline]
    pub fn mass(&self) -> f64 {
        self.inertia.mass
    }

    #[inline]
    pub fn local_com(&self) -> Vec3 {
        self.inertia.com
    }

    #[inline]
    pub fn inertia(&self) -> &SpatialInertia {
        &self.inertia
    }

    #[inline]
    pub fn gravity_mode(&self) -> bool {
        self.gravity_mode
    }

    pub fn set_gravity_mode(&mut self, on: bool) {
        self.gravity_mode = on;
    }

    #[inline]
    pub fn is_collidable(&self) -> bool {
        self.is_collidable
    }

    pub fn set_collidable(&mut self, on: bool) {
        self.is_collidable = on;
    }

    #[inline]
    pub fn friction_coeff(&self) -> f64 {
        self.friction_coeff
    }

    pub fn set_friction_coeff(&mut self, mu: f64) {
        assert!(mu >= 0.0);
        self.friction_coeff = mu;
    }

    #[inline]
    pub fn restitution_coeff(&self) -> f64 {
        self.restitution_coeff
    }

    pub fn set_restitution_coeff(&mut self, e: f64) {
        assert!((0.0..=1.0).contains(&e));
        self.restitution_coeff = e;
    }

    pub fn add_marker(&mut self, marker: Marker) {
        self.markers.push(marker);
    }

    #[inline]
    pub fn num_markers(&self) -> usize {
        self.markers.len()
    }

    #[inline]
    pub fn marker(&self, i: usize) -> &Marker {
        &self.markers[i]
    }

    pub fn markers(&self) -> &[Marker] {
        &self.markers
    }

    /// Turn this body into a soft body by attaching a point-mass lattice.
    pub fn set_soft_body(&mut self, soft: SoftBody) {
        self.soft = Some(soft);
    }

    #[inline]
    pub fn soft_body(&self) -> Option<&SoftBody> {
        self.soft.as_ref()
    }

    #[inline]
    pub fn soft_body_mut(&mut self) -> Option<&mut SoftBody> {
        self.soft.as_mut()
    }

    #[inline]
    pub fn is_soft(&self) -> bool {
        self.soft.is_some()
    }

    // ── kinematic state ──────────────────────────────────────────────────

    /// World-to-body Plücker transform.
    #[inline]
    pub fn world_transform(&self) -> &SpatialTransform {
        &self.world_transform
    }

    /// Parent-to-body Plücker transform.
    #[inline]
    pub fn relative_transform(&self) -> &SpatialTransform {
        &self.rel_transform
    }

    /// Spatial velocity in the body frame.
    #[inline]
    pub fn spatial_velocity(&self) -> &SpatialVec {
        &self.velocity
    }

    /// Spatial acceleration in the body frame.
    #[inline]
    pub fn spatial_acceleration(&self) -> &SpatialVec {
        &self.acceleration
    }

    /// Velocity-product acceleration term.
    #[inline]
    pub fn partial_acceleration(&self) -> &SpatialVec {
        &self.partial_acceleration
    }

    /// Wrench transmitted through the parent joint.
    #[inline]
    pub fn transmitted_force(&self) -> &SpatialVec {
        &self.transmitted_force
    }

    #[inline]
    pub fn external_force(&self) -> &SpatialVec {
        &self.external_force
    }

    pub(crate) fn set_external_force_raw(&mut self, f: SpatialVec) {
        self.external_force = f;
    }

    pub(crate) fn add_external_force_raw(&mut self, f: SpatialVec) {
        self.external_force += f;
    }

    #[inline]
    pub fn constraint_impulse(&self) -> &SpatialVec {
        &self.constraint_impulse
    }

    pub(crate) fn set_constraint_impulse(&mut self, imp: SpatialVec) {
        self.constraint_impulse = imp;
    }

    pub(crate) fn clear_constraint_impulse(&mut self, gcs: &mut GenCoordSystem) {
        self.constraint_impulse = SpatialVec::zero();
        let joint = &self.parent_joint;
        for k in 0..joint.num_dofs() {
            gcs.coord_mut(joint.index_in_skeleton() + k).constraint_impulse = 0.0;
        }
        if let Some(soft) = self.soft.as_mut() {
            for pm in soft.point_masses_mut() {
                pm.set_constraint_impulse(Vec3::zeros());
            }
        }
    }

    /// Indices of all generalized coordinates this body's motion depends on
    /// (the joint dofs along the chain from the root, own joint included).
    #[inline]
    pub fn dependent_gen_coords(&self) -> &[usize] {
        &self.dependent_gen_coords
    }

    pub(crate) fn set_dependent_gen_coords(&mut self, deps: Vec<usize>) {
        let n = deps.len();
        self.dependent_gen_coords = deps;
        self.body_jacobian = DMat::zeros(6, n);
        self.body_jacobian_time_deriv = DMat::zeros(6, n);
        self.body_jacobian_dirty = true;
        self.body_jacobian_time_deriv_dirty = true;
    }

    // ── coordinate slices ────────────────────────────────────────────────

    fn joint_q(&self, gcs: &GenCoordSystem) -> Vec<f64> {
        let j = &self.parent_joint;
        gcs.slice(j.index_in_skeleton(), j.num_dofs())
            .iter()
            .map(|c| c.pos)
            .collect()
    }

    fn joint_qd(&self, gcs: &GenCoordSystem) -> Vec<f64> {
        let j = &self.parent_joint;
        gcs.slice(j.index_in_skeleton(), j.num_dofs())
            .iter()
            .map(|c| c.vel)
            .collect()
    }

    fn joint_qdd(&self, gcs: &GenCoordSystem) -> Vec<f64> {
        let j = &self.parent_joint;
        gcs.slice(j.index_in_skeleton(), j.num_dofs())
            .iter()
            .map(|c| c.acc)
            .collect()
    }

    // ── forward kinematics ───────────────────────────────────────────────

    /// Compose the parent's world transform with the joint transform.
    pub(crate) fn update_transform(
        &mut self,
        parent_world: Option<SpatialTransform>,
        gcs: &GenCoordSystem,
    ) {
        let q = self.joint_q(gcs);
        self.rel_transform = self.parent_joint.relative_transform(&q);
        self.world_transform = match parent_world {
            Some(pw) => self.rel_transform.compose(&pw),
            None => self.rel_transform,
        };
    }

    /// v = X·v_parent + S·q̇.
    pub(crate) fn update_velocity(&mut self, parent_vel: Option<SpatialVec>, gcs: &GenCoordSystem) {
        let qd = self.joint_qd(gcs);
        let v_joint = self.parent_joint.joint_velocity(&qd);
        self.velocity = match parent_vel {
            Some(pv) => self.rel_transform.apply_motion(&pv) + v_joint,
            None => v_joint,
        };
    }

    /// η = v ×ₘ (S·q̇); the joint subspaces are constant in the body frame,
    /// so there is no Ṡ·q̇ term.
    pub(crate) fn update_partial_acceleration(&mut self, gcs: &GenCoordSystem) {
        let qd = self.joint_qd(gcs);
        let v_joint = self.parent_joint.joint_velocity(&qd);
        self.partial_acceleration = self.velocity.cross_motion(&v_joint);
    }

    /// a = X·a_parent + η + S·q̈.
    pub(crate) fn update_acceleration(
        &mut self,
        parent_acc: Option<SpatialVec>,
        gcs: &GenCoordSystem,
    ) {
        let qdd = self.joint_qdd(gcs);
        let a_joint = self.parent_joint.joint_velocity(&qdd);
        let a_in = match parent_acc {
            Some(pa) => self.rel_transform.apply_motion(&pa),
            None => SpatialVec::zero(),
        };
        self.acceleration = a_in + self.partial_acceleration + a_joint;
    }

    // ── gravity and point-mass helpers ───────────────────────────────────

    /// World gravity expressed in the body frame.
    fn gravity_in_body(&self, g_world: &Vec3) -> Vec3 {
        self.world_transform.rot * *g_world
    }

    /// Gravity wrench I·(0; R·g) on the rigid core.
    fn gravity_wrench(&self, g_world: &Vec3) -> SpatialVec {
        if self.gravity_mode {
            let g_b = self.gravity_in_body(g_world);
            self.inertia
                .to_matrix()
                .mul_vec(&SpatialVec::new(Vec3::zeros(), g_b))
        } else {
            SpatialVec::zero()
        }
    }

    /// Implicit joint-space inertia denominator of a point mass:
    /// m + h·d + h²·k, with k the effective spring stiffness.
    fn pm_denominator(soft: &SoftBody, pm: &PointMass, h: f64) -> f64 {
        pm.mass() + h * soft.damping_coefficient() + h * h * soft.effective_stiffness(pm)
    }

    /// Wrench seen by the body when `f` acts at body-frame point `p`.
    #[inline]
    fn wrench_at(p: &Vec3, f: &Vec3) -> SpatialVec {
        SpatialVec::new(p.cross(f), *f)
    }

    /// Linear velocity of the material point at `p` moving with `u`
    /// relative to the body.
    #[inline]
    fn point_velocity(&self, p: &Vec3, u: &Vec3) -> Vec3 {
        let w = self.velocity.angular();
        self.velocity.linear() + w.cross(p) + *u
    }

    // ── joint-space projections ──────────────────────────────────────────

    /// U = I·S and D = SᵀI·S (+ diag(h·d + h²·k) when `implicit_h` is set).
    fn joint_projection(
        &self,
        ia: &SpatialMat,
        implicit_h: Option<f64>,
    ) -> (Vec<SpatialVec>, DMat) {
        let joint = &self.parent_joint;
        let s = joint.subspace_columns();
        let nd = s.len();
        let u: Vec<SpatialVec> = s.iter().map(|sk| ia.mul_vec(sk)).collect();
        let mut d = DMat::zeros(nd, nd);
        for r in 0..nd {
            for c in 0..nd {
                d[(r, c)] = s[r].dot(&u[c]);
            }
        }
        if let Some(h) = implicit_h {
            for k in 0..nd {
                d[(k, k)] += h * joint.damping_coefficient(k)
                    + h * h * joint.spring_stiffness(k);
            }
        }
        (u, d)
    }

    /// I^a = I^A − U·D⁻¹·Uᵀ, transformed into the parent frame.
    fn projected_inertia_to_parent(&self, ia: &SpatialMat, implicit_h: Option<f64>) -> SpatialMat {
        let (u, d) = self.joint_projection(ia, implicit_h);
        let nd = u.len();
        let mut pi = *ia;
        if nd > 0 {
            if let Some(d_inv) = d.try_inverse() {
                for r in 0..nd {
                    for c in 0..nd {
                        pi += SpatialMat::outer(&u[r], &u[c]) * (-d_inv[(r, c)]);
                    }
                }
            }
        }
        let x = self.rel_transform.to_motion_matrix();
        SpatialMat::from_mat6(x.transpose() * pi.data * x)
    }

    // ── composite-rigid-body scan (mass matrix columns) ──────────────────

    /// Forward step: propagate the unit-acceleration velocity
    /// mm_dv = X·mm_dv_parent + S·q̈ and reset the force accumulator.
    pub(crate) fn update_mass_matrix_scratch(
        &mut self,
        parent_dv: Option<SpatialVec>,
        gcs: &GenCoordSystem,
    ) {
        let qdd = self.joint_qdd(gcs);
        let a_joint = self.parent_joint.joint_velocity(&qdd);
        self.mm_dv = match parent_dv {
            Some(pd) => self.rel_transform.apply_motion(&pd) + a_joint,
            None => a_joint,
        };
        self.mm_f = SpatialVec::zero();
    }

    /// Backward step: finalize the spatial force, write this body's rows of
    /// column `col`, and return the contribution to the parent accumulator.
    /// With `aug_h` set, the augmented terms (h·d + h²·k)·q̈ are added.
    pub(crate) fn aggregate_mass_matrix(
        &mut self,
        m: &mut DMat,
        col: usize,
        aug_h: Option<f64>,
        gcs: &GenCoordSystem,
    ) -> SpatialVec {
        self.mm_f += self.inertia.to_matrix().mul_vec(&self.mm_dv);

        if let Some(soft) = self.soft.as_ref() {
            for pm in soft.point_masses() {
                let p = pm.local_position(gcs);
                let i0 = pm.index_in_skeleton();
                let qdd = Vec3::new(
                    gcs.coord(i0).acc,
                    gcs.coord(i0 + 1).acc,
                    gcs.coord(i0 + 2).acc,
                );
                let dv_in = SpatialTransform::from_translation(p).apply_motion(&self.mm_dv);
                let dv_lin = dv_in.linear() + qdd;
                let f = dv_lin * pm.mass();
                for k in 0..3 {
                    m[(i0 + k, col)] = pm.mass() * dv_lin[k];
                    if let Some(h) = aug_h {
                        m[(i0 + k, col)] += (h * soft.damping_coefficient()
                            + h * h * soft.effective_stiffness(pm))
                            * qdd[k];
                    }
                }
                self.mm_f += Self::wrench_at(&p, &f);
            }
        }

        let joint = &self.parent_joint;
        let nd = joint.num_dofs();
        if nd > 0 {
            let istart = joint.index_in_skeleton();
            let qdd = self.joint_qdd(gcs);
            for (k, sk) in joint.subspace_columns().iter().enumerate() {
                m[(istart + k, col)] = sk.dot(&self.mm_f);
                if let Some(h) = aug_h {
                    m[(istart + k, col)] += (h * joint.damping_coefficient(k)
                        + h * h * joint.spring_stiffness(k))
                        * qdd[k];
                }
            }
        }

        self.rel_transform.inv_apply_force(&self.mm_f)
    }

    // ── articulated-body inverse scan (M⁻¹ columns) ──────────────────────

    /// Backward step of the unit-force scan: compute the joint total force
    /// u = τ − Sᵀ·bias and return the bias contribution to the parent.
    /// `implicit_h` selects the augmented articulated inertia.
    pub(crate) fn prepare_inv_mass_matrix(
        &mut self,
        implicit_h: Option<f64>,
        gcs: &GenCoordSystem,
    ) -> SpatialVec {
        // Point masses are leaves: they reflect U·D⁻¹·τ into this body.
        if let Some(soft) = self.soft.as_ref() {
            for pm in soft.point_masses() {
                let p = pm.local_position(gcs);
                let i0 = pm.index_in_skeleton();
                let tau = Vec3::new(
                    gcs.coord(i0).force,
                    gcs.coord(i0 + 1).force,
                    gcs.coord(i0 + 2).force,
                );
                let den = match implicit_h {
                    Some(h) => Self::pm_denominator(soft, pm, h),
                    None => pm.mass(),
                };
                let f = tau * (pm.mass() / den);
                self.invm_bias += Self::wrench_at(&p, &f);
            }
        }

        let ia = match implicit_h {
            Some(_) => self.art_inertia_implicit,
            None => self.art_inertia,
        };
        let joint = &mut self.parent_joint;
        let nd = joint.num_dofs();
        let s = joint.subspace_columns();

        let istart = joint.index_in_skeleton();
        let mut u_vec = DVec::zeros(nd);
        for k in 0..nd {
            u_vec[k] = gcs.coord(istart + k).force - s[k].dot(&self.invm_bias);
        }
        joint.total_force = u_vec.clone();

        let mut out = self.invm_bias;
        if nd > 0 {
            let (u_cols, d) = self.joint_projection(&ia, implicit_h);
            if let Some(d_inv) = d.try_inverse() {
                let coeffs = d_inv * u_vec;
                for (k, uc) in u_cols.iter().enumerate() {
                    out += *uc * coeffs[k];
                }
            }
        }
        self.rel_transform.inv_apply_force(&out)
    }

    /// Forward step of the unit-force scan: solve for this body's
    /// accelerations and write its rows of column `col`.
    pub(crate) fn aggregate_inv_mass_matrix(
        &mut self,
        inv_m: &mut DMat,
        col: usize,
        parent_dv: Option<SpatialVec>,
        implicit_h: Option<f64>,
        gcs: &GenCoordSystem,
    ) {
        let a_in = match parent_dv {
            Some(pd) => self.rel_transform.apply_motion(&pd),
            None => SpatialVec::zero(),
        };

        let ia = match implicit_h {
            Some(_) => self.art_inertia_implicit,
            None => self.art_inertia,
        };
        let joint = &self.parent_joint;
        let nd = joint.num_dofs();
        let istart = joint.index_in_skeleton();
        let s = joint.subspace_columns();

        self.invm_dv = a_in;
        if nd > 0 {
            let (u_cols, d) = self.joint_projection(&ia, implicit_h);
            let mut rhs = joint.total_force.clone();
            for k in 0..nd {
                rhs[k] -= u_cols[k].dot(&a_in);
            }
            if let Some(d_inv) = d.try_inverse() {
                let qdd = d_inv * rhs;
                for k in 0..nd {
                    inv_m[(istart + k, col)] = qdd[k];
                    self.invm_dv += s[k] * qdd[k];
                }
            }
        }

        if let Some(soft) = self.soft.as_ref() {
            for pm in soft.point_masses() {
                let p = pm.local_position(gcs);
                let i0 = pm.index_in_skeleton();
                let tau = Vec3::new(
                    gcs.coord(i0).force,
                    gcs.coord(i0 + 1).force,
                    gcs.coord(i0 + 2).force,
                );
                let den = match implicit_h {
                    Some(h) => Self::pm_denominator(soft, pm, h),
                    None => pm.mass(),
                };
                let a_pm = SpatialTransform::from_translation(p).apply_motion(&self.invm_dv);
                let qdd = (tau - a_pm.linear() * pm.mass()) / den;
                for k in 0..3 {
                    inv_m[(i0 + k, col)] = qdd[k];
                }
            }
        }
    }

    // ── Coriolis / gravity / combined / external aggregation ─────────────

    /// Forward step shared by the Coriolis and combined passes:
    /// cg_dv = X·cg_dv_parent + η.
    pub(crate) fn update_combined_scratch(&mut self, parent_dv: Option<SpatialVec>) {
        self.cg_dv = match parent_dv {
            Some(pd) => self.rel_transform.apply_motion(&pd) + self.partial_acceleration,
            None => self.partial_acceleration,
        };
        self.cg_f = SpatialVec::zero();
    }

    /// Shared force-building step: I·(cg_dv − (0; g_b)) + v ×* (I·v),
    /// plus point-mass terms, into `cg_f`; then the joint rows.
    fn aggregate_velocity_products(
        &mut self,
        out: &mut DVec,
        g_world: Option<&Vec3>,
        gcs: &GenCoordSystem,
    ) -> SpatialVec {
        let g_b = match g_world {
            Some(g) if self.gravity_mode => self.gravity_in_body(g),
            _ => Vec3::zeros(),
        };

        let i_mat = self.inertia.to_matrix();
        let accel = self.cg_dv - SpatialVec::new(Vec3::zeros(), g_b);
        self.cg_f += i_mat.mul_vec(&accel)
            + self.velocity.cross_force(&i_mat.mul_vec(&self.velocity));

        if let Some(soft) = self.soft.as_ref() {
            let w = self.velocity.angular();
            for pm in soft.point_masses() {
                let p = pm.local_position(gcs);
                let u = pm.local_velocity(gcs);
                let i0 = pm.index_in_skeleton();
                let dv_in = SpatialTransform::from_translation(p).apply_motion(&self.cg_dv);
                // ζ = (0; ω×u) is the point mass's own partial acceleration.
                let dv_lin = dv_in.linear() + w.cross(&u);
                let v_pm = self.point_velocity(&p, &u);
                let f = (dv_lin - g_b + w.cross(&v_pm)) * pm.mass();
                for k in 0..3 {
                    out[i0 + k] = f[k];
                }
                self.cg_f += Self::wrench_at(&p, &f);
            }
        }

        let joint = &self.parent_joint;
        let istart = joint.index_in_skeleton();
        for (k, sk) in joint.subspace_columns().iter().enumerate() {
            out[istart + k] = sk.dot(&self.cg_f);
        }

        self.rel_transform.inv_apply_force(&self.cg_f)
    }

    /// Backward step of the Coriolis pass.
    pub(crate) fn aggregate_coriolis(&mut self, c: &mut DVec, gcs: &GenCoordSystem) -> SpatialVec {
        self.aggregate_velocity_products(c, None, gcs)
    }

    /// Backward step of the combined C+g pass.
    pub(crate) fn aggregate_combined(
        &mut self,
        cg: &mut DVec,
        g_world: &Vec3,
        gcs: &GenCoordSystem,
    ) -> SpatialVec {
        self.aggregate_velocity_products(cg, Some(g_world), gcs)
    }

    /// Backward step of the gravity pass; rows are −Sᵀ·F.
    pub(crate) fn aggregate_gravity(
        &mut self,
        g: &mut DVec,
        g_world: &Vec3,
        gcs: &GenCoordSystem,
    ) -> SpatialVec {
        self.g_f += self.gravity_wrench(g_world);

        if let Some(soft) = self.soft.as_ref() {
            let g_b = if self.gravity_mode {
                self.gravity_in_body(g_world)
            } else {
                Vec3::zeros()
            };
            for pm in soft.point_masses() {
                let p = pm.local_position(gcs);
                let f = g_b * pm.mass();
                let i0 = pm.index_in_skeleton();
                for k in 0..3 {
                    g[i0 + k] = -f[k];
                }
                self.g_f += Self::wrench_at(&p, &f);
            }
        }

        let joint = &self.parent_joint;
        let istart = joint.index_in_skeleton();
        for (k, sk) in joint.subspace_columns().iter().enumerate() {
            g[istart + k] = -sk.dot(&self.g_f);
        }

        self.rel_transform.inv_apply_force(&self.g_f)
    }

    /// Backward step of the external-force pass; rows are Sᵀ·F.
    /// (The lattice spring segments are assembled by the skeleton.)
    pub(crate) fn aggregate_external(&mut self, fext: &mut DVec) -> SpatialVec {
        self.fext_f += self.external_force;

        let joint = &self.parent_joint;
        let istart = joint.index_in_skeleton();
        for (k, sk) in joint.subspace_columns().iter().enumerate() {
            fext[istart + k] = sk.dot(&self.fext_f);
        }

        self.rel_transform.inv_apply_force(&self.fext_f)
    }

    // ── articulated-body algorithm ───────────────────────────────────────

    /// Seed the articulated inertias with the rigid inertia plus the
    /// point-mass reflections (children add theirs afterwards).
    pub(crate) fn prepare_art_inertia(&mut self, h: f64, gcs: &GenCoordSystem) {
        let i_mat = self.inertia.to_matrix();
        self.art_inertia = i_mat;
        self.art_inertia_implicit = i_mat;

        if let Some(soft) = self.soft.as_ref() {
            for pm in soft.point_masses() {
                let p = pm.local_position(gcs);
                let m = pm.mass();
                let den = Self::pm_denominator(soft, pm, h);
                // A point mass on a free translational joint reflects
                // nothing; the implicit spring/damper terms leave a reduced
                // mass m·(den − m)/den at the attachment point.
                let m_reflected = m * (den - m) / den;
                if m_reflected > 0.0 {
                    self.art_inertia_implicit +=
                        SpatialInertia::point_mass(m_reflected, p).to_matrix();
                }
            }
        }
    }

    /// Seed the bias force with the gyroscopic, gravity, external and
    /// point-mass terms (children add theirs afterwards).
    pub(crate) fn prepare_bias_force(&mut self, g_world: &Vec3, h: f64, gcs: &GenCoordSystem) {
        let i_mat = self.inertia.to_matrix();
        self.bias_force = self
            .velocity
            .cross_force(&i_mat.mul_vec(&self.velocity))
            - self.external_force
            - self.gravity_wrench(g_world);

        if let Some(soft) = self.soft.as_ref() {
            let w = self.velocity.angular();
            let g_b = if self.gravity_mode {
                self.gravity_in_body(g_world)
            } else {
                Vec3::zeros()
            };
            for pm in soft.point_masses() {
                let p = pm.local_position(gcs);
                let u = pm.local_velocity(gcs);
                let m = pm.mass();
                let den = Self::pm_denominator(soft, pm, h);

                let v_pm = self.point_velocity(&p, &u);
                let bias_lin = w.cross(&v_pm) * m - g_b * m;
                let u_vec = pm.local_force(gcs) + soft.spring_force(pm, h, gcs)
                    - u * soft.damping_coefficient()
                    - bias_lin;
                let zeta_lin = w.cross(&u);
                let m_reflected = m * (den - m) / den;
                let f = bias_lin + zeta_lin * m_reflected + u_vec * (m / den);
                self.bias_force += Self::wrench_at(&p, &f);
            }
        }
    }

    /// The articulated-inertia contributions (plain, implicit) this body
    /// reflects into its parent.
    pub(crate) fn project_art_inertia(&self, h: f64) -> (SpatialMat, SpatialMat) {
        (
            self.projected_inertia_to_parent(&self.art_inertia, None),
            self.projected_inertia_to_parent(&self.art_inertia_implicit, Some(h)),
        )
    }

    /// Compute the joint total force u = τ_eff − Sᵀ·bias and return the bias
    /// contribution X*·(bias + I^a·η + U·D⁻¹·u) for the parent.
    pub(crate) fn update_total_force_and_project_bias(
        &mut self,
        h: f64,
        gcs: &GenCoordSystem,
    ) -> SpatialVec {
        let ia = self.art_inertia_implicit;
        let eta = self.partial_acceleration;
        let (u_cols, d) = self.joint_projection(&ia, Some(h));

        let joint = &mut self.parent_joint;
        let nd = joint.num_dofs();
        let istart = joint.index_in_skeleton();
        let s = joint.subspace_columns();

        let mut u_vec = DVec::zeros(nd);
        for k in 0..nd {
            let c = gcs.coord(istart + k);
            let tau_eff = c.force
                - joint.spring_stiffness(k)
                    * (c.pos + h * c.vel - joint.rest_position(k))
                - joint.damping_coefficient(k) * c.vel;
            u_vec[k] = tau_eff - s[k].dot(&self.bias_force);
        }
        joint.total_force = u_vec.clone();

        // bias + I^a·η + U·D⁻¹·u, with I^a·η = I^A·η − U·D⁻¹·Uᵀ·η folded in.
        let mut out = self.bias_force + ia.mul_vec(&eta);
        if nd > 0 {
            if let Some(d_inv) = d.try_inverse() {
                let mut rhs = u_vec;
                for k in 0..nd {
                    rhs[k] -= u_cols[k].dot(&eta);
                }
                let coeffs = d_inv * rhs;
                for (k, uc) in u_cols.iter().enumerate() {
                    out += *uc * coeffs[k];
                }
            }
        }
        self.rel_transform.inv_apply_force(&out)
    }

    /// Forward ABA step: solve the joint for q̈, set the body acceleration,
    /// and solve the point masses.
    pub(crate) fn update_joint_and_body_acceleration(
        &mut self,
        parent_acc: Option<SpatialVec>,
        g_world: &Vec3,
        h: f64,
        gcs: &mut GenCoordSystem,
    ) {
        let a_in = match parent_acc {
            Some(pa) => self.rel_transform.apply_motion(&pa),
            None => SpatialVec::zero(),
        } + self.partial_acceleration;

        let ia = self.art_inertia_implicit;
        let joint = &self.parent_joint;
        let nd = joint.num_dofs();
        let istart = joint.index_in_skeleton();
        let s = joint.subspace_columns();

        self.acceleration = a_in;
        if nd > 0 {
            let (u_cols, d) = self.joint_projection(&ia, Some(h));
            let mut rhs = joint.total_force.clone();
            for k in 0..nd {
                rhs[k] -= u_cols[k].dot(&a_in);
            }
            if let Some(d_inv) = d.try_inverse() {
                let qdd = d_inv * rhs;
                for k in 0..nd {
                    gcs.coord_mut(istart + k).acc = qdd[k];
                    self.acceleration += s[k] * qdd[k];
                }
            }
        }

        if let Some(soft) = self.soft.as_ref() {
            let w = self.velocity.angular();
            let g_b = if self.gravity_mode {
                self.gravity_in_body(g_world)
            } else {
                Vec3::zeros()
            };
            let a_body = self.acceleration;
            for pm in soft.point_masses() {
                let p = pm.local_position(gcs);
                let u = pm.local_velocity(gcs);
                let m = pm.mass();
                let den = Self::pm_denominator(soft, pm, h);

                let v_pm = self.point_velocity(&p, &u);
                // Same bias and total force the backward pass used.
                let bias_lin = w.cross(&v_pm) * m - g_b * m;
                let u_vec = pm.local_force(gcs) + soft.spring_force(pm, h, gcs)
                    - u * soft.damping_coefficient()
                    - bias_lin;

                let a_pm_in = SpatialTransform::from_translation(p).apply_motion(&a_body);
                let a_lin = a_pm_in.linear() + w.cross(&u);
                let qdd = (u_vec - a_lin * m) / den;
                let i0 = pm.index_in_skeleton();
                for k in 0..3 {
                    gcs.coord_mut(i0 + k).acc = qdd[k];
                }
            }
        }
    }

    /// f = I^A·a + bias (through the parent joint).
    pub(crate) fn update_transmitted_force(&mut self) {
        self.transmitted_force =
            self.art_inertia_implicit.mul_vec(&self.acceleration) + self.bias_force;
    }

    // ── impulse-based forward dynamics ───────────────────────────────────

    /// Seed the bias impulse: −(constraint impulse) plus the lattice
    /// reflections. Each point mass's total impulse is latched here for the
    /// velocity-change pass (the probes may restore the stored impulse
    /// before that pass runs).
    pub(crate) fn begin_bias_impulse(&mut self, gcs: &GenCoordSystem, h: f64) {
        self.bias_impulse = -self.constraint_impulse;

        if let Some(soft) = self.soft.as_mut() {
            let damping = soft.damping_coefficient();
            let edge = soft.edge_stiffness();
            let vertex = soft.vertex_stiffness();
            for pm in soft.point_masses_mut() {
                let p = pm.local_position(gcs);
                let imp = pm.constraint_impulse();
                pm.total_impulse = imp;
                let m = pm.mass();
                let k_eff = vertex + pm.num_connected() as f64 * edge;
                let den = m + h * damping + h * h * k_eff;
                // p_pm = (0; −imp); reflected: p_pm + U·D̃⁻¹·imp.
                let f = imp * (m / den) - imp;
                self.bias_impulse += Self::wrench_at(&p, &f);
            }
        }
    }

    /// The bias-impulse contribution this body reflects into its parent:
    /// X*·(b + U·D̃⁻¹·(imp − Sᵀ·b)).
    pub(crate) fn child_bias_impulse_contribution(
        &self,
        h: f64,
        gcs: &GenCoordSystem,
    ) -> SpatialVec {
        let ia = self.art_inertia_implicit;
        let joint = &self.parent_joint;
        let nd = joint.num_dofs();
        let istart = joint.index_in_skeleton();
        let s = joint.subspace_columns();

        let mut out = self.bias_impulse;
        if nd > 0 {
            let (u_cols, d) = self.joint_projection(&ia, Some(h));
            let mut u_vec = DVec::zeros(nd);
            for k in 0..nd {
                u_vec[k] = gcs.coord(istart + k).constraint_impulse
                    - s[k].dot(&self.bias_impulse);
            }
            if let Some(d_inv) = d.try_inverse() {
                let coeffs = d_inv * u_vec;
                for (k, uc) in u_cols.iter().enumerate() {
                    out += *uc * coeffs[k];
                }
            }
        }
        self.rel_transform.inv_apply_force(&out)
    }

    /// Store the joint total impulse u = imp − Sᵀ·b for the forward pass.
    pub(crate) fn finish_bias_impulse(&mut self, gcs: &GenCoordSystem) {
        let bias = self.bias_impulse;
        let joint = &mut self.parent_joint;
        let nd = joint.num_dofs();
        let istart = joint.index_in_skeleton();
        let s = joint.subspace_columns();
        let mut u_vec = DVec::zeros(nd);
        for k in 0..nd {
            u_vec[k] = gcs.coord(istart + k).constraint_impulse - s[k].dot(&bias);
        }
        joint.total_impulse = u_vec;
    }

    /// Forward impulse step: solve the joint velocity change and propagate
    /// Δv; lattice velocity changes are written to their coordinate slots.
    pub(crate) fn update_joint_velocity_change(
        &mut self,
        parent_del_v: Option<SpatialVec>,
        h: f64,
        gcs: &mut GenCoordSystem,
    ) {
        let dv_in = match parent_del_v {
            Some(pd) => self.rel_transform.apply_motion(&pd),
            None => SpatialVec::zero(),
        };

        let ia = self.art_inertia_implicit;
        let joint = &self.parent_joint;
        let nd = joint.num_dofs();
        let istart = joint.index_in_skeleton();
        let s = joint.subspace_columns();

        self.del_v = dv_in;
        if nd > 0 {
            let (u_cols, d) = self.joint_projection(&ia, Some(h));
            let mut rhs = joint.total_impulse.clone();
            for k in 0..nd {
                rhs[k] -= u_cols[k].dot(&dv_in);
            }
            if let Some(d_inv) = d.try_inverse() {
                let del_qd = d_inv * rhs;
                for k in 0..nd {
                    gcs.coord_mut(istart + k).vel_change = del_qd[k];
                    self.del_v += s[k] * del_qd[k];
                }
            }
        }

        if let Some(soft) = self.soft.as_ref() {
            let del_v = self.del_v;
            for pm in soft.point_masses() {
                let p = pm.local_position(gcs);
                let m = pm.mass();
                let den = Self::pm_denominator(soft, pm, h);
                let dv_pm = SpatialTransform::from_translation(p).apply_motion(&del_v);
                let du = (pm.total_impulse - dv_pm.linear() * m) / den;
                let i0 = pm.index_in_skeleton();
                for k in 0..3 {
                    gcs.coord_mut(i0 + k).vel_change = du[k];
                }
            }
        }
    }

    /// Impulse transmitted through the parent joint: b + I^A·Δv.
    pub(crate) fn update_transmitted_impulse(&mut self) {
        self.imp_transmitted = self.bias_impulse + self.art_inertia_implicit.mul_vec(&self.del_v);
    }

    /// Apply the velocity change: q̇ += Δq̇, q̈ += Δq̇/h, τ += imp/h, and the
    /// transmitted force gains imp/h.
    pub(crate) fn apply_velocity_change(&mut self, h: f64, gcs: &mut GenCoordSystem) {
        let joint = &self.parent_joint;
        let istart = joint.index_in_skeleton();
        let nd = joint.num_dofs();
        for k in 0..nd {
            let c = gcs.coord_mut(istart + k);
            c.vel += c.vel_change;
            c.acc += c.vel_change / h;
            c.force += c.constraint_impulse / h;
        }

        if let Some(soft) = self.soft.as_ref() {
            for pm in soft.point_masses() {
                let imp = pm.constraint_impulse();
                let i0 = pm.index_in_skeleton();
                for k in 0..3 {
                    let c = gcs.coord_mut(i0 + k);
                    c.vel += c.vel_change;
                    c.acc += c.vel_change / h;
                    c.force += imp[k] / h;
                }
            }
        }

        self.velocity += self.del_v;
        self.acceleration += self.del_v * (1.0 / h);
        self.transmitted_force += self.imp_transmitted * (1.0 / h);
    }

    // ── inverse dynamics ─────────────────────────────────────────────────

    /// Net spatial force from this body's own motion plus the sum of the
    /// children's transmitted forces (pulled in by the skeleton's backward
    /// loop).
    pub(crate) fn update_body_force(
        &mut self,
        g_world: &Vec3,
        with_external: bool,
        child_sum: SpatialVec,
        gcs: &GenCoordSystem,
    ) {
        let i_mat = self.inertia.to_matrix();
        self.transmitted_force = child_sum
            + i_mat.mul_vec(&self.acceleration)
            + self
                .velocity
                .cross_force(&i_mat.mul_vec(&self.velocity))
            - self.gravity_wrench(g_world);
        if with_external {
            self.transmitted_force = self.transmitted_force - self.external_force;
        }

        if let Some(soft) = self.soft.as_ref() {
            let w = self.velocity.angular();
            let g_b = if self.gravity_mode {
                self.gravity_in_body(g_world)
            } else {
                Vec3::zeros()
            };
            for pm in soft.point_masses() {
                let p = pm.local_position(gcs);
                let u = pm.local_velocity(gcs);
                let i0 = pm.index_in_skeleton();
                let qdd = Vec3::new(
                    gcs.coord(i0).acc,
                    gcs.coord(i0 + 1).acc,
                    gcs.coord(i0 + 2).acc,
                );
                let a_in =
                    SpatialTransform::from_translation(p).apply_motion(&self.acceleration);
                let a_lin = a_in.linear() + w.cross(&u) + qdd;
                let v_pm = self.point_velocity(&p, &u);
                let f = (a_lin + w.cross(&v_pm) - g_b) * pm.mass();
                self.transmitted_force += Self::wrench_at(&p, &f);
            }
        }
    }

    /// Project the net force onto the joint dofs: τ = Sᵀ·F (+ d·q̇ when
    /// damping is requested), and the lattice rows.
    pub(crate) fn update_generalized_force(
        &self,
        g_world: &Vec3,
        with_damping: bool,
        gcs: &mut GenCoordSystem,
    ) {
        let joint = &self.parent_joint;
        let istart = joint.index_in_skeleton();
        for (k, sk) in joint.subspace_columns().iter().enumerate() {
            let mut tau = sk.dot(&self.transmitted_force);
            if with_damping {
                tau += joint.damping_coefficient(k) * gcs.coord(istart + k).vel;
            }
            gcs.coord_mut(istart + k).force = tau;
        }

        if let Some(soft) = self.soft.as_ref() {
            let w = self.velocity.angular();
            let g_b = if self.gravity_mode {
                self.gravity_in_body(g_world)
            } else {
                Vec3::zeros()
            };
            for pm in soft.point_masses() {
                let p = pm.local_position(gcs);
                let u = pm.local_velocity(gcs);
                let i0 = pm.index_in_skeleton();
                let qdd = Vec3::new(
                    gcs.coord(i0).acc,
                    gcs.coord(i0 + 1).acc,
                    gcs.coord(i0 + 2).acc,
                );
                let a_in =
                    SpatialTransform::from_translation(p).apply_motion(&self.acceleration);
                let a_lin = a_in.linear() + w.cross(&u) + qdd;
                let v_pm = self.point_velocity(&p, &u);
                let mut f = (a_lin + w.cross(&v_pm) - g_b) * pm.mass();
                if with_damping {
                    f += u * soft.damping_coefficient();
                }
                for k in 0..3 {
                    gcs.coord_mut(i0 + k).force = f[k];
                }
            }
        }
    }

    // ── body Jacobians ───────────────────────────────────────────────────

    fn spatial_column(m: &DMat, c: usize) -> SpatialVec {
        SpatialVec::new(
            Vec3::new(m[(0, c)], m[(1, c)], m[(2, c)]),
            Vec3::new(m[(3, c)], m[(4, c)], m[(5, c)]),
        )
    }

    fn write_column(m: &mut DMat, c: usize, v: &SpatialVec) {
        let v6 = v.as_vec6();
        for k in 0..6 {
            m[(k, c)] = v6[k];
        }
    }

    /// J = [X·J_parent | S], 6 × num_dependent.
    pub(crate) fn update_body_jacobian(&mut self, parent_jac: Option<&DMat>, _gcs: &GenCoordSystem) {
        let np = parent_jac.map_or(0, |j| j.ncols());
        if let Some(pj) = parent_jac {
            for c in 0..np {
                let moved = self.rel_transform.apply_motion(&Self::spatial_column(pj, c));
                Self::write_column(&mut self.body_jacobian, c, &moved);
            }
        }
        for (k, sk) in self.parent_joint.subspace_columns().iter().enumerate() {
            Self::write_column(&mut self.body_jacobian, np + k, sk);
        }
        self.body_jacobian_dirty = false;
    }

    /// dJ = [X·dJ_parent − (S·q̇) ×ₘ J_chain | 0].
    pub(crate) fn update_body_jacobian_time_deriv(
        &mut self,
        parent_dj: Option<&DMat>,
        gcs: &GenCoordSystem,
    ) {
        let qd = self.joint_qd(gcs);
        let v_joint = self.parent_joint.joint_velocity(&qd);
        let np = parent_dj.map_or(0, |j| j.ncols());

        self.body_jacobian_time_deriv.fill(0.0);
        if let Some(pdj) = parent_dj {
            for c in 0..np {
                let dcol = Self::spatial_column(pdj, c);
                let jcol = Self::spatial_column(&self.body_jacobian, c);
                let moved = self.rel_transform.apply_motion(&dcol) - v_joint.cross_motion(&jcol);
                Self::write_column(&mut self.body_jacobian_time_deriv, c, &moved);
            }
        }
        self.body_jacobian_time_deriv_dirty = false;
    }

    /// Body Jacobian (6 × num_dependent, body frame). Callers must have
    /// serviced the dirty flag through the skeleton.
    pub(crate) fn body_jacobian(&self) -> &DMat {
        debug_assert!(!self.body_jacobian_dirty);
        &self.body_jacobian
    }

    pub(crate) fn body_jacobian_time_deriv(&self) -> &DMat {
        debug_assert!(!self.body_jacobian_time_deriv_dirty);
        &self.body_jacobian_time_deriv
    }

    // ── per-body aggregate quantities ────────────────────────────────────

    /// World position of the rigid core's center of mass.
    pub fn world_com(&self) -> Vec3 {
        self.world_transform.point_to_parent(&self.inertia.com)
    }

    /// World velocity of the rigid core's center of mass.
    pub fn world_com_velocity(&self) -> Vec3 {
        let r = self.world_transform.rot.transpose();
        let c = self.inertia.com;
        r * (self.velocity.linear() + self.velocity.angular().cross(&c))
    }

    /// World acceleration of the rigid core's center of mass.
    pub fn world_com_acceleration(&self) -> Vec3 {
        let r = self.world_transform.rot.transpose();
        let c = self.inertia.com;
        let w = self.velocity.angular();
        let v_c = self.velocity.linear() + w.cross(&c);
        r * (self.acceleration.linear() + self.acceleration.angular().cross(&c) + w.cross(&v_c))
    }

    /// World position of a point mass of this body's lattice.
    pub fn pm_world_position(&self, pm: &PointMass, gcs: &GenCoordSystem) -> Vec3 {
        self.world_transform
            .point_to_parent(&pm.local_position(gcs))
    }

    /// World velocity of a point mass of this body's lattice.
    pub fn pm_world_velocity(&self, pm: &PointMass, gcs: &GenCoordSystem) -> Vec3 {
        let p = pm.local_position(gcs);
        let u = pm.local_velocity(gcs);
        self.world_transform.rot.transpose() * self.point_velocity(&p, &u)
    }

    /// World acceleration of a point mass of this body's lattice.
    pub fn pm_world_acceleration(&self, pm: &PointMass, gcs: &GenCoordSystem) -> Vec3 {
        let p = pm.local_position(gcs);
        let u = pm.local_velocity(gcs);
        let i0 = pm.index_in_skeleton();
        let qdd = Vec3::new(
            gcs.coord(i0).acc,
            gcs.coord(i0 + 1).acc,
            gcs.coord(i0 + 2).acc,
        );
        let w = self.velocity.angular();
        let v_pm = self.point_velocity(&p, &u);
        let a_b = self.acceleration.linear()
            + self.acceleration.angular().cross(&p)
            + w.cross(&u)
            + qdd;
        self.world_transform.rot.transpose() * (a_b + w.cross(&v_pm))
    }

    /// World position of a marker attached to this body.
    pub fn marker_world_position(&self, marker: &Marker) -> Vec3 {
        self.world_transform
            .point_to_parent(&marker.local_position())
    }

    /// Kinetic energy: ½·vᵀ·I·v plus the lattice share.
    pub fn kinetic_energy(&self, gcs: &GenCoordSystem) -> f64 {
        let mut ke = 0.5
            * self
                .velocity
                .dot(&self.inertia.to_matrix().mul_vec(&self.velocity));
        if let Some(soft) = self.soft.as_ref() {
            for pm in soft.point_masses() {
                let p = pm.local_position(gcs);
                let u = pm.local_velocity(gcs);
                ke += 0.5 * pm.mass() * self.point_velocity(&p, &u).norm_squared();
            }
        }
        ke
    }

    /// Gravitational potential energy (the joint's elastic share is summed
    /// by the skeleton).
    pub fn potential_energy(&self, g_world: &Vec3, gcs: &GenCoordSystem) -> f64 {
        if !self.gravity_mode {
            return 0.0;
        }
        let mut pe = -self.mass() * g_world.dot(&self.world_com());
        if let Some(soft) = self.soft.as_ref() {
            for pm in soft.point_masses() {
                pe -= pm.mass() * g_world.dot(&self.pm_world_position(pm, gcs));
            }
        }
        pe
    }
}
