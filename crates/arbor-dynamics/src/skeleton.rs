//! The skeleton: a rooted tree of body nodes in BFS order, the dirty-flag
//! cache over the joint-space dynamics quantities, and the recursion drivers.
//!
//! A skeleton is single-threaded: every operation runs to completion with
//! exclusive access. Readers of derived quantities service their dirty flag
//! before returning a shared view; writers mutate state and mark the flags.
//! The column scans of the mass matrices temporarily overwrite generalized
//! accelerations or forces and restore them on exit.

use arbor_math::{DMat, DVec, SpatialVec, Vec3};
use tracing::error;

use crate::body::BodyNode;
use crate::gencoord::GenCoordSystem;
use crate::joint::Joint;
use crate::marker::Marker;

/// An articulated rigid/soft multibody system.
#[derive(Debug, Clone)]
pub struct Skeleton {
    name: String,
    enabled_self_collision_check: bool,
    enabled_adjacent_body_check: bool,
    is_mobile: bool,
    time_step: f64,
    gravity: Vec3,
    total_mass: f64,
    initialized: bool,

    bodies: Vec<BodyNode>,
    soft_body_indices: Vec<usize>,
    gcs: GenCoordSystem,

    // Cached joint-space quantities.
    m: DMat,
    aug_m: DMat,
    inv_m: DMat,
    inv_aug_m: DMat,
    cvec: DVec,
    g: DVec,
    cg: DVec,
    fext: DVec,
    fc: DVec,

    // Freshness flags.
    is_articulated_inertia_dirty: bool,
    is_mass_matrix_dirty: bool,
    is_aug_mass_matrix_dirty: bool,
    is_inv_mass_matrix_dirty: bool,
    is_inv_aug_mass_matrix_dirty: bool,
    is_coriolis_vector_dirty: bool,
    is_gravity_force_vector_dirty: bool,
    is_combined_vector_dirty: bool,
    is_external_force_vector_dirty: bool,
    is_impulse_applied: bool,

    // Diagnostics: number of cache rebuilds performed so far.
    recompute_count: u64,

    // Union-find tags for the external constraint grouper.
    union_root: usize,
    union_size: usize,
}

impl Skeleton {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            enabled_self_collision_check: false,
            enabled_adjacent_body_check: false,
            is_mobile: true,
            time_step: 0.001,
            gravity: Vec3::new(0.0, 0.0, -9.81),
            total_mass: 0.0,
            initialized: false,
            bodies: Vec::new(),
            soft_body_indices: Vec::new(),
            gcs: GenCoordSystem::new(),
            m: DMat::zeros(0, 0),
            aug_m: DMat::zeros(0, 0),
            inv_m: DMat::zeros(0, 0),
            inv_aug_m: DMat::zeros(0, 0),
            cvec: DVec::zeros(0),
            g: DVec::zeros(0),
            cg: DVec::zeros(0),
            fext: DVec::zeros(0),
            fc: DVec::zeros(0),
            is_articulated_inertia_dirty: true,
            is_mass_matrix_dirty: true,
            is_aug_mass_matrix_dirty: true,
            is_inv_mass_matrix_dirty: true,
            is_inv_aug_mass_matrix_dirty: true,
            is_coriolis_vector_dirty: true,
            is_gravity_force_vector_dirty: true,
            is_combined_vector_dirty: true,
            is_external_force_vector_dirty: true,
            is_impulse_applied: false,
            recompute_count: 0,
            union_root: 0,
            union_size: 1,
        }
    }

    // ── basic properties ─────────────────────────────────────────────────

    #[inline]
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn set_name(&mut self, name: impl Into<String>) {
        self.name = name.into();
    }

    pub fn enable_self_collision(&mut self, enable_adjacent_body_check: bool) {
        self.enabled_self_collision_check = true;
        self.enabled_adjacent_body_check = enable_adjacent_body_check;
    }

    pub fn disable_self_collision(&mut self) {
        self.enabled_self_collision_check = false;
        self.enabled_adjacent_body_check = false;
    }

    #[inline]
    pub fn is_enabled_self_collision_check(&self) -> bool {
        self.enabled_self_collision_check
    }

    #[inline]
    pub fn is_enabled_adjacent_body_check(&self) -> bool {
        self.enabled_adjacent_body_check
    }

    pub fn set_mobile(&mut self, mobile: bool) {
        self.is_mobile = mobile;
    }

    #[inline]
    pub fn is_mobile(&self) -> bool {
        self.is_mobile
    }

    pub fn set_time_step(&mut self, time_step: f64) {
        assert!(time_step > 0.0, "time step must be positive");
        self.time_step = time_step;
        // The augmented quantities and the lattice springs depend on h.
        self.is_articulated_inertia_dirty = true;
        self.is_aug_mass_matrix_dirty = true;
        self.is_inv_mass_matrix_dirty = true;
        self.is_inv_aug_mass_matrix_dirty = true;
        self.is_external_force_vector_dirty = true;
    }

    #[inline]
    pub fn time_step(&self) -> f64 {
        self.time_step
    }

    pub fn set_gravity(&mut self, gravity: Vec3) {
        self.gravity = gravity;
        self.is_gravity_force_vector_dirty = true;
        self.is_combined_vector_dirty = true;
    }

    #[inline]
    pub fn gravity(&self) -> Vec3 {
        self.gravity
    }

    /// Total mass, lattice masses included. Recomputed only in `init`.
    #[inline]
    pub fn mass(&self) -> f64 {
        self.total_mass
    }

    pub fn set_impulse_applied(&mut self, val: bool) {
        self.is_impulse_applied = val;
    }

    #[inline]
    pub fn is_impulse_applied(&self) -> bool {
        self.is_impulse_applied
    }

    /// Number of cache rebuilds performed so far; lets callers observe
    /// whether a read recomputed or served the cache.
    #[inline]
    pub fn cache_rebuild_count(&self) -> u64 {
        self.recompute_count
    }

    // ── structure ────────────────────────────────────────────────────────

    /// Add a body to the tree. The parent must already be present; only the
    /// first body may be parentless (attached to the world by its joint).
    pub fn add_body_node(&mut self, body: BodyNode, parent: Option<usize>) -> usize {
        assert!(!self.initialized, "structure is frozen after init");
        if self.bodies.is_empty() {
            assert!(parent.is_none(), "the first body is the root");
        } else {
            let p = parent.expect("non-root bodies need a parent");
            assert!(p < self.bodies.len(), "parent must be added first");
        }

        let index = self.bodies.len();
        let mut body = body;
        body.set_index(index);
        body.set_parent(parent);
        if let Some(p) = parent {
            self.bodies[p].add_child(index);
        }
        if body.is_soft() {
            self.soft_body_indices.push(index);
        }
        self.bodies.push(body);
        index
    }

    #[inline]
    pub fn num_body_nodes(&self) -> usize {
        self.bodies.len()
    }

    #[inline]
    pub fn num_rigid_body_nodes(&self) -> usize {
        self.bodies.len() - self.soft_body_indices.len()
    }

    #[inline]
    pub fn num_soft_body_nodes(&self) -> usize {
        self.soft_body_indices.len()
    }

    #[inline]
    pub fn dof(&self) -> usize {
        self.gcs.dof()
    }

    #[inline]
    pub fn root_body_node(&self) -> &BodyNode {
        &self.bodies[0]
    }

    #[inline]
    pub fn body_node(&self, i: usize) -> &BodyNode {
        &self.bodies[i]
    }

    #[inline]
    pub fn body_node_mut(&mut self, i: usize) -> &mut BodyNode {
        &mut self.bodies[i]
    }

    /// First body with the given name, in BFS order.
    pub fn body_node_by_name(&self, name: &str) -> Option<&BodyNode> {
        self.bodies.iter().find(|b| b.name() == name)
    }

    /// The i-th soft body.
    pub fn soft_body_node(&self, i: usize) -> &BodyNode {
        &self.bodies[self.soft_body_indices[i]]
    }

    pub fn soft_body_node_by_name(&self, name: &str) -> Option<&BodyNode> {
        self.soft_body_indices
            .iter()
            .map(|&i| &self.bodies[i])
            .find(|b| b.name() == name)
    }

    /// The joint above body `i`.
    pub fn joint(&self, i: usize) -> &Joint {
        self.bodies[i].parent_joint()
    }

    pub fn joint_by_name(&self, name: &str) -> Option<&Joint> {
        self.bodies
            .iter()
            .map(|b| b.parent_joint())
            .find(|j| j.name() == name)
    }

    /// First marker with the given name, in BFS order.
    pub fn marker_by_name(&self, name: &str) -> Option<&Marker> {
        self.bodies
            .iter()
            .flat_map(|b| b.markers().iter())
            .find(|m| m.name() == name)
    }

    #[inline]
    pub fn gen_coord_system(&self) -> &GenCoordSystem {
        &self.gcs
    }

    /// Freeze the structure: re-sort the bodies into BFS order, wire the
    /// generalized coordinates, size the caches, clear forces, and compute
    /// the total mass.
    pub fn init(&mut self, time_step: f64, gravity: Vec3) {
        assert!(!self.bodies.is_empty(), "cannot init an empty skeleton");
        self.set_time_step(time_step);
        self.set_gravity(gravity);

        // Rearrange the body list with breadth-first traversal from the root.
        let mut order = Vec::with_capacity(self.bodies.len());
        let mut queue = std::collections::VecDeque::new();
        queue.push_back(0);
        while let Some(i) = queue.pop_front() {
            order.push(i);
            for &c in self.bodies[i].child_indices() {
                queue.push_back(c);
            }
        }
        assert_eq!(order.len(), self.bodies.len(), "tree must be connected");

        let mut new_index = vec![0usize; order.len()];
        for (new, &old) in order.iter().enumerate() {
            new_index[old] = new;
        }
        let mut slots: Vec<Option<BodyNode>> =
            std::mem::take(&mut self.bodies).into_iter().map(Some).collect();
        for &old in &order {
            self.bodies.push(slots[old].take().expect("body visited once"));
        }
        for (i, body) in self.bodies.iter_mut().enumerate() {
            body.set_index(i);
            body.set_parent(body.parent_index().map(|p| new_index[p]));
            let children = body
                .child_indices()
                .iter()
                .map(|&c| new_index[c])
                .collect();
            body.set_children(children);
        }
        self.soft_body_indices = self
            .bodies
            .iter()
            .enumerate()
            .filter(|(_, b)| b.is_soft())
            .map(|(i, _)| i)
            .collect();

        // Wire the generalized coordinates: joint dofs, then lattice dofs,
        // per body in BFS order.
        self.gcs.clear();
        for body in self.bodies.iter_mut() {
            let joint = body.parent_joint_mut();
            let nd = joint.num_dofs();
            let start = self.gcs.grow(nd);
            joint.set_index_in_skeleton(start);
            if let Some(soft) = body.soft_body_mut() {
                for pm in soft.point_masses_mut() {
                    let pm_start = self.gcs.grow(3);
                    pm.set_index_in_skeleton(pm_start);
                }
            }
        }

        // Dependent coordinate maps follow the chains from the root.
        for i in 0..self.bodies.len() {
            let mut deps = match self.bodies[i].parent_index() {
                Some(p) => self.bodies[p].dependent_gen_coords().to_vec(),
                None => Vec::new(),
            };
            let joint = self.bodies[i].parent_joint();
            let start = joint.index_in_skeleton();
            deps.extend(start..start + joint.num_dofs());
            self.bodies[i].set_dependent_gen_coords(deps);
        }

        // Transforms, velocities, and partial accelerations.
        self.compute_forward_kinematics(true, true, false);

        let dof = self.gcs.dof();
        self.m = DMat::zeros(dof, dof);
        self.aug_m = DMat::zeros(dof, dof);
        self.inv_m = DMat::zeros(dof, dof);
        self.inv_aug_m = DMat::zeros(dof, dof);
        self.cvec = DVec::zeros(dof);
        self.g = DVec::zeros(dof);
        self.cg = DVec::zeros(dof);
        self.fext = DVec::zeros(dof);
        self.fc = DVec::zeros(dof);

        self.clear_external_forces();
        self.clear_internal_forces();

        self.total_mass = self
            .bodies
            .iter()
            .map(|b| {
                b.mass() + b.soft_body().map_or(0.0, |s| s.total_mass())
            })
            .sum();

        self.initialized = true;
    }

    // ── generalized state ────────────────────────────────────────────────

    pub fn positions(&self) -> DVec {
        self.gcs.positions()
    }

    pub fn set_positions(
        &mut self,
        q: &DVec,
        update_transforms: bool,
        update_vels: bool,
        update_accs: bool,
    ) {
        self.gcs.set_positions(q);
        self.compute_forward_kinematics(update_transforms, update_vels, update_accs);
    }

    pub fn velocities(&self) -> DVec {
        self.gcs.velocities()
    }

    pub fn set_velocities(&mut self, qd: &DVec, update_vels: bool, update_accs: bool) {
        self.gcs.set_velocities(qd);
        self.compute_forward_kinematics(false, update_vels, update_accs);
    }

    pub fn accelerations(&self) -> DVec {
        self.gcs.accelerations()
    }

    pub fn set_accelerations(&mut self, qdd: &DVec, update_accs: bool) {
        self.gcs.set_accelerations(qdd);
        self.compute_forward_kinematics(false, false, update_accs);
    }

    /// Concatenated [q; q̇].
    pub fn state(&self) -> DVec {
        let dof = self.gcs.dof();
        let mut out = DVec::zeros(2 * dof);
        out.rows_mut(0, dof).copy_from(&self.gcs.positions());
        out.rows_mut(dof, dof).copy_from(&self.gcs.velocities());
        out
    }

    pub fn set_state(
        &mut self,
        state: &DVec,
        update_transforms: bool,
        update_vels: bool,
        update_accs: bool,
    ) {
        assert!(state.len() % 2 == 0, "state must stack [q; qdot]");
        let dof = state.len() / 2;
        self.gcs.set_positions(&state.rows(0, dof).into_owned());
        self.gcs.set_velocities(&state.rows(dof, dof).into_owned());
        self.compute_forward_kinematics(update_transforms, update_vels, update_accs);
    }

    pub fn config_segs(&self, ids: &[usize]) -> DVec {
        DVec::from_iterator(ids.len(), ids.iter().map(|&i| self.gcs.coord(i).pos))
    }

    pub fn set_config_segs(
        &mut self,
        ids: &[usize],
        values: &DVec,
        update_transforms: bool,
        update_vels: bool,
        update_accs: bool,
    ) {
        assert_eq!(ids.len(), values.len());
        for (k, &i) in ids.iter().enumerate() {
            self.gcs.coord_mut(i).pos = values[k];
        }
        self.compute_forward_kinematics(update_transforms, update_vels, update_accs);
    }

    pub fn gen_forces(&self) -> DVec {
        self.gcs.forces()
    }

    /// Generalized forces are an input; no cache depends on them.
    pub fn set_gen_forces(&mut self, tau: &DVec) {
        self.gcs.set_forces(tau);
    }

    pub fn internal_force_vector(&self) -> DVec {
        self.gen_forces()
    }

    pub fn set_internal_force_vector(&mut self, forces: &DVec) {
        self.set_gen_forces(forces);
    }

    pub fn min_internal_force_vector(&self) -> DVec {
        self.gcs.forces_min()
    }

    pub fn set_min_internal_force_vector(&mut self, min_forces: &DVec) {
        self.gcs.set_forces_min(min_forces);
    }

    pub fn max_internal_force_vector(&self) -> DVec {
        self.gcs.forces_max()
    }

    pub fn set_max_internal_force_vector(&mut self, max_forces: &DVec) {
        self.gcs.set_forces_max(max_forces);
    }

    pub fn clear_internal_forces(&mut self) {
        let zero = DVec::zeros(self.gcs.dof());
        self.gcs.set_forces(&zero);
    }

    pub fn constraint_force_vector(&self) -> &DVec {
        &self.fc
    }

    pub fn set_constraint_force_vector(&mut self, fc: &DVec) {
        assert_eq!(fc.len(), self.gcs.dof());
        self.fc = fc.clone();
    }

    /// Per-joint semi-implicit Euler position update.
    pub fn integrate_configs(&mut self, dt: f64) {
        for body in self.bodies.iter() {
            let joint = body.parent_joint();
            let slice = self
                .gcs
                .slice_mut(joint.index_in_skeleton(), joint.num_dofs());
            joint.integrate_positions(dt, slice);

            if let Some(soft) = body.soft_body() {
                for pm in soft.point_masses() {
                    let s = self.gcs.slice_mut(pm.index_in_skeleton(), 3);
                    for c in s.iter_mut() {
                        c.pos += dt * c.vel;
                    }
                }
            }
        }
    }

    /// Per-joint semi-implicit Euler velocity update.
    pub fn integrate_gen_vels(&mut self, dt: f64) {
        for body in self.bodies.iter() {
            let joint = body.parent_joint();
            let slice = self
                .gcs
                .slice_mut(joint.index_in_skeleton(), joint.num_dofs());
            joint.integrate_velocities(dt, slice);

            if let Some(soft) = body.soft_body() {
                for pm in soft.point_masses() {
                    let s = self.gcs.slice_mut(pm.index_in_skeleton(), 3);
                    for c in s.iter_mut() {
                        c.vel += dt * c.acc;
                    }
                }
            }
        }
    }

    // ── per-body force state ─────────────────────────────────────────────

    /// Set the external wrench on body `i` (body frame).
    pub fn set_body_external_force(&mut self, i: usize, wrench: SpatialVec) {
        self.bodies[i].set_external_force_raw(wrench);
        self.is_external_force_vector_dirty = true;
    }

    /// Accumulate an external wrench on body `i` (body frame).
    pub fn add_body_external_force(&mut self, i: usize, wrench: SpatialVec) {
        self.bodies[i].add_external_force_raw(wrench);
        self.is_external_force_vector_dirty = true;
    }

    pub fn clear_external_forces(&mut self) {
        for body in self.bodies.iter_mut() {
            body.set_external_force_raw(SpatialVec::zero());
        }
        self.is_external_force_vector_dirty = true;
    }

    /// Set the spatial constraint impulse of body `i` (body frame).
    pub fn set_body_constraint_impulse(&mut self, i: usize, imp: SpatialVec) {
        self.bodies[i].set_constraint_impulse(imp);
    }

    pub fn clear_constraint_impulses(&mut self) {
        for i in 0..self.bodies.len() {
            self.bodies[i].clear_constraint_impulse(&mut self.gcs);
        }
    }

    // ── forward kinematics ───────────────────────────────────────────────

    /// Walk the bodies in BFS order updating transforms, velocities (with
    /// partial accelerations), and accelerations as directed, then mark all
    /// dynamics caches dirty.
    pub fn compute_forward_kinematics(
        &mut self,
        update_transforms: bool,
        update_vels: bool,
        update_accs: bool,
    ) {
        let n = self.bodies.len();

        if update_transforms {
            for i in 0..n {
                let pw = self.bodies[i]
                    .parent_index()
                    .map(|p| *self.bodies[p].world_transform());
                self.bodies[i].update_transform(pw, &self.gcs);
            }
        }

        if update_vels {
            for i in 0..n {
                let pv = self.bodies[i]
                    .parent_index()
                    .map(|p| *self.bodies[p].spatial_velocity());
                self.bodies[i].update_velocity(pv, &self.gcs);
                self.bodies[i].update_partial_acceleration(&self.gcs);
            }
        }

        if update_accs {
            for i in 0..n {
                let pa = self.bodies[i]
                    .parent_index()
                    .map(|p| *self.bodies[p].spatial_acceleration());
                self.bodies[i].update_acceleration(pa, &self.gcs);
            }
        }

        self.dirty_all_caches();
    }

    fn dirty_all_caches(&mut self) {
        self.is_articulated_inertia_dirty = true;
        self.is_mass_matrix_dirty = true;
        self.is_aug_mass_matrix_dirty = true;
        self.is_inv_mass_matrix_dirty = true;
        self.is_inv_aug_mass_matrix_dirty = true;
        self.is_coriolis_vector_dirty = true;
        self.is_gravity_force_vector_dirty = true;
        self.is_combined_vector_dirty = true;
        self.is_external_force_vector_dirty = true;

        for body in self.bodies.iter_mut() {
            body.body_jacobian_dirty = true;
            body.body_jacobian_time_deriv_dirty = true;
        }
    }

    // ── cached dynamics quantities ───────────────────────────────────────

    pub fn mass_matrix(&mut self) -> &DMat {
        if self.is_mass_matrix_dirty {
            self.update_mass_matrix();
        }
        &self.m
    }

    pub fn aug_mass_matrix(&mut self) -> &DMat {
        if self.is_aug_mass_matrix_dirty {
            self.update_aug_mass_matrix();
        }
        &self.aug_m
    }

    pub fn inv_mass_matrix(&mut self) -> &DMat {
        if self.is_inv_mass_matrix_dirty {
            self.update_inv_mass_matrix();
        }
        &self.inv_m
    }

    pub fn inv_aug_mass_matrix(&mut self) -> &DMat {
        if self.is_inv_aug_mass_matrix_dirty {
            self.update_inv_aug_mass_matrix();
        }
        &self.inv_aug_m
    }

    pub fn coriolis_force_vector(&mut self) -> &DVec {
        if self.is_coriolis_vector_dirty {
            self.update_coriolis_force_vector();
        }
        &self.cvec
    }

    pub fn gravity_force_vector(&mut self) -> &DVec {
        if self.is_gravity_force_vector_dirty {
            self.update_gravity_force_vector();
        }
        &self.g
    }

    pub fn combined_vector(&mut self) -> &DVec {
        if self.is_combined_vector_dirty {
            self.update_combined_vector();
        }
        &self.cg
    }

    pub fn external_force_vector(&mut self) -> &DVec {
        if self.is_external_force_vector_dirty {
            self.update_external_force_vector();
        }
        &self.fext
    }

    /// Column-by-column composite-rigid-body assembly: unit accelerations,
    /// lower triangle only, upper mirrored. Generalized accelerations are
    /// snapshotted and restored.
    fn assemble_mass_matrix(
        bodies: &mut [BodyNode],
        gcs: &mut GenCoordSystem,
        target: &mut DMat,
        aug_h: Option<f64>,
    ) {
        let dof = gcs.dof();
        target.fill(0.0);
        let saved = gcs.accelerations();

        let mut e = DVec::zeros(dof);
        for j in 0..dof {
            e[j] = 1.0;
            gcs.set_accelerations(&e);

            for i in 0..bodies.len() {
                let pd = bodies[i].parent_index().map(|p| bodies[p].mm_dv);
                bodies[i].update_mass_matrix_scratch(pd, gcs);
            }
            for i in (0..bodies.len()).rev() {
                let contrib = bodies[i].aggregate_mass_matrix(target, j, aug_h, gcs);
                if let Some(p) = bodies[i].parent_index() {
                    bodies[p].mm_f += contrib;
                }
                let joint = bodies[i].parent_joint();
                let nd = joint.num_dofs();
                if nd > 0 && joint.index_in_skeleton() + nd < j {
                    break;
                }
            }

            e[j] = 0.0;
        }
        target.fill_upper_triangle_with_lower_triangle();

        gcs.set_accelerations(&saved);
    }

    fn update_mass_matrix(&mut self) {
        debug_assert_eq!(self.m.nrows(), self.gcs.dof());
        Self::assemble_mass_matrix(&mut self.bodies, &mut self.gcs, &mut self.m, None);
        self.is_mass_matrix_dirty = false;
        self.recompute_count += 1;
    }

    fn update_aug_mass_matrix(&mut self) {
        debug_assert_eq!(self.aug_m.nrows(), self.gcs.dof());
        let h = self.time_step;
        Self::assemble_mass_matrix(&mut self.bodies, &mut self.gcs, &mut self.aug_m, Some(h));
        self.is_aug_mass_matrix_dirty = false;
        self.recompute_count += 1;
    }

    /// Column-by-column articulated-body inverse: unit forces, upper
    /// triangle only, lower mirrored. Generalized forces are snapshotted
    /// and restored.
    fn assemble_inv_mass_matrix(
        bodies: &mut [BodyNode],
        gcs: &mut GenCoordSystem,
        target: &mut DMat,
        implicit_h: Option<f64>,
    ) {
        let dof = gcs.dof();
        target.fill(0.0);
        let saved = gcs.forces();

        let mut e = DVec::zeros(dof);
        for j in 0..dof {
            e[j] = 1.0;
            gcs.set_forces(&e);

            for body in bodies.iter_mut() {
                body.invm_bias = SpatialVec::zero();
            }
            for i in (0..bodies.len()).rev() {
                let contrib = bodies[i].prepare_inv_mass_matrix(implicit_h, gcs);
                if let Some(p) = bodies[i].parent_index() {
                    bodies[p].invm_bias += contrib;
                }
            }
            for i in 0..bodies.len() {
                let pd = bodies[i].parent_index().map(|p| bodies[p].invm_dv);
                bodies[i].aggregate_inv_mass_matrix(target, j, pd, implicit_h, gcs);
                let joint = bodies[i].parent_joint();
                let nd = joint.num_dofs();
                if nd > 0 && joint.index_in_skeleton() + nd > j {
                    break;
                }
            }

            e[j] = 0.0;
        }
        target.fill_lower_triangle_with_upper_triangle();

        gcs.set_forces(&saved);
    }

    /// Backward pass refreshing both articulated inertias.
    fn refresh_articulated_inertia(&mut self) {
        let h = self.time_step;
        for i in 0..self.bodies.len() {
            self.bodies[i].prepare_art_inertia(h, &self.gcs);
        }
        for i in (0..self.bodies.len()).rev() {
            if let Some(p) = self.bodies[i].parent_index() {
                let (plain, implicit) = self.bodies[i].project_art_inertia(h);
                self.bodies[p].art_inertia += plain;
                self.bodies[p].art_inertia_implicit += implicit;
            }
        }
        self.is_articulated_inertia_dirty = false;
    }

    fn update_inv_mass_matrix(&mut self) {
        debug_assert_eq!(self.inv_m.nrows(), self.gcs.dof());
        if self.is_articulated_inertia_dirty {
            self.refresh_articulated_inertia();
        }
        Self::assemble_inv_mass_matrix(&mut self.bodies, &mut self.gcs, &mut self.inv_m, None);
        self.is_inv_mass_matrix_dirty = false;
        self.recompute_count += 1;
    }

    fn update_inv_aug_mass_matrix(&mut self) {
        debug_assert_eq!(self.inv_aug_m.nrows(), self.gcs.dof());
        if self.is_articulated_inertia_dirty {
            self.refresh_articulated_inertia();
        }
        let h = self.time_step;
        Self::assemble_inv_mass_matrix(
            &mut self.bodies,
            &mut self.gcs,
            &mut self.inv_aug_m,
            Some(h),
        );
        self.is_inv_aug_mass_matrix_dirty = false;
        self.recompute_count += 1;
    }

    fn update_coriolis_force_vector(&mut self) {
        debug_assert_eq!(self.cvec.len(), self.gcs.dof());
        self.cvec.fill(0.0);
        for i in 0..self.bodies.len() {
            let pd = self.bodies[i].parent_index().map(|p| self.bodies[p].cg_dv);
            self.bodies[i].update_combined_scratch(pd);
        }
        for i in (0..self.bodies.len()).rev() {
            let contrib = self.bodies[i].aggregate_coriolis(&mut self.cvec, &self.gcs);
            if let Some(p) = self.bodies[i].parent_index() {
                self.bodies[p].cg_f += contrib;
            }
        }
        self.is_coriolis_vector_dirty = false;
        self.recompute_count += 1;
    }

    fn update_gravity_force_vector(&mut self) {
        debug_assert_eq!(self.g.len(), self.gcs.dof());
        self.g.fill(0.0);
        let g_world = self.gravity;
        for body in self.bodies.iter_mut() {
            body.g_f = SpatialVec::zero();
        }
        for i in (0..self.bodies.len()).rev() {
            let contrib = self.bodies[i].aggregate_gravity(&mut self.g, &g_world, &self.gcs);
            if let Some(p) = self.bodies[i].parent_index() {
                self.bodies[p].g_f += contrib;
            }
        }
        self.is_gravity_force_vector_dirty = false;
        self.recompute_count += 1;
    }

    fn update_combined_vector(&mut self) {
        debug_assert_eq!(self.cg.len(), self.gcs.dof());
        self.cg.fill(0.0);
        let g_world = self.gravity;
        for i in 0..self.bodies.len() {
            let pd = self.bodies[i].parent_index().map(|p| self.bodies[p].cg_dv);
            self.bodies[i].update_combined_scratch(pd);
        }
        for i in (0..self.bodies.len()).rev() {
            let contrib = self.bodies[i].aggregate_combined(&mut self.cg, &g_world, &self.gcs);
            if let Some(p) = self.bodies[i].parent_index() {
                self.bodies[p].cg_f += contrib;
            }
        }
        self.is_combined_vector_dirty = false;
        self.recompute_count += 1;
    }

    fn update_external_force_vector(&mut self) {
        debug_assert_eq!(self.fext.len(), self.gcs.dof());
        self.fext.fill(0.0);
        for body in self.bodies.iter_mut() {
            body.fext_f = SpatialVec::zero();
        }
        for i in (0..self.bodies.len()).rev() {
            let contrib = self.bodies[i].aggregate_external(&mut self.fext);
            if let Some(p) = self.bodies[i].parent_index() {
                self.bodies[p].fext_f += contrib;
            }
        }

        // Lattice spring restoring forces, with the h-implicit lookahead.
        let h = self.time_step;
        for &si in &self.soft_body_indices {
            let soft = self.bodies[si].soft_body().expect("soft index");
            for pm in soft.point_masses() {
                let f = soft.spring_force(pm, h, &self.gcs);
                let i0 = pm.index_in_skeleton();
                for k in 0..3 {
                    self.fext[i0 + k] = f[k];
                }
            }
        }

        self.is_external_force_vector_dirty = false;
        self.recompute_count += 1;
    }

    // ── forward dynamics (articulated-body algorithm) ────────────────────

    /// Featherstone's articulated-body forward dynamics: part A refreshes
    /// the kinematics, part B runs the backward/forward articulated passes.
    pub fn compute_forward_dynamics(&mut self) {
        self.compute_forward_dynamics_recursion_a();
        self.compute_forward_dynamics_recursion_b();
    }

    /// Transforms, velocities, and partial accelerations; all caches dirty.
    pub fn compute_forward_dynamics_recursion_a(&mut self) {
        self.compute_forward_kinematics(true, true, false);
    }

    /// Backward articulated inertia + bias force, then the forward solve.
    pub fn compute_forward_dynamics_recursion_b(&mut self) {
        let h = self.time_step;
        let g_world = self.gravity;
        let n = self.bodies.len();

        for i in 0..n {
            self.bodies[i].prepare_art_inertia(h, &self.gcs);
            self.bodies[i].prepare_bias_force(&g_world, h, &self.gcs);
        }
        for i in (0..n).rev() {
            let bias_contrib = self.bodies[i].update_total_force_and_project_bias(h, &self.gcs);
            if let Some(p) = self.bodies[i].parent_index() {
                let (plain, implicit) = self.bodies[i].project_art_inertia(h);
                self.bodies[p].art_inertia += plain;
                self.bodies[p].art_inertia_implicit += implicit;
                self.bodies[p].bias_force += bias_contrib;
            }
        }
        self.is_articulated_inertia_dirty = false;

        for i in 0..n {
            let pa = self.bodies[i]
                .parent_index()
                .map(|p| *self.bodies[p].spatial_acceleration());
            self.bodies[i].update_joint_and_body_acceleration(pa, &g_world, h, &mut self.gcs);
            self.bodies[i].update_transmitted_force();
        }
    }

    // ── inverse dynamics (recursive Newton-Euler) ────────────────────────

    /// Recursive Newton-Euler inverse dynamics: given (q, q̇, q̈), compute
    /// the joint forces. A no-op for an immobile or 0-dof skeleton.
    pub fn compute_inverse_dynamics(&mut self, with_external_forces: bool, with_damping_forces: bool) {
        self.compute_inverse_dynamics_recursion_a();
        self.compute_inverse_dynamics_recursion_b(with_external_forces, with_damping_forces);
    }

    /// Full forward kinematics (accelerations included); all caches dirty.
    pub fn compute_inverse_dynamics_recursion_a(&mut self) {
        self.compute_forward_kinematics(true, true, true);
    }

    /// Backward force pass projecting onto the joint dofs.
    pub fn compute_inverse_dynamics_recursion_b(
        &mut self,
        with_external_forces: bool,
        with_damping_forces: bool,
    ) {
        if self.gcs.dof() == 0 || !self.is_mobile {
            return;
        }
        let g_world = self.gravity;
        for i in (0..self.bodies.len()).rev() {
            let mut child_sum = SpatialVec::zero();
            for k in 0..self.bodies[i].child_indices().len() {
                let c = self.bodies[i].child_indices()[k];
                child_sum += self.bodies[c]
                    .relative_transform()
                    .inv_apply_force(self.bodies[c].transmitted_force());
            }
            self.bodies[i].update_body_force(&g_world, with_external_forces, child_sum, &self.gcs);
            self.bodies[i].update_generalized_force(&g_world, with_damping_forces, &mut self.gcs);
        }
    }

    // ── hybrid dynamics (reserved) ───────────────────────────────────────

    /// Reserved API; emits a diagnostic and returns without side effects.
    pub fn compute_hybrid_dynamics(&mut self) {
        error!("hybrid dynamics is not implemented");
    }

    /// Reserved API; emits a diagnostic and returns without side effects.
    pub fn compute_hybrid_dynamics_recursion_a(&mut self) {
        error!("hybrid dynamics is not implemented");
    }

    /// Reserved API; emits a diagnostic and returns without side effects.
    pub fn compute_hybrid_dynamics_recursion_b(&mut self) {
        error!("hybrid dynamics is not implemented");
    }

    // ── impulse-based forward dynamics ───────────────────────────────────

    fn recompute_bias_impulse(&mut self, i: usize, h: f64) {
        self.bodies[i].begin_bias_impulse(&self.gcs, h);
        for k in 0..self.bodies[i].child_indices().len() {
            let c = self.bodies[i].child_indices()[k];
            let contrib = self.bodies[c].child_bias_impulse_contribution(h, &self.gcs);
            self.bodies[i].bias_impulse += contrib;
        }
        self.bodies[i].finish_bias_impulse(&self.gcs);
    }

    #[cfg(debug_assertions)]
    fn debug_assert_impulses_clear(&self) {
        for b in self.bodies.iter() {
            debug_assert!(
                *b.constraint_impulse() == SpatialVec::zero(),
                "constraint impulses must be zero before updateBiasImpulse"
            );
        }
    }

    /// Refresh the bias impulses along the path from `body` to the root.
    /// Pre-condition: every body's constraint impulse is zero.
    pub fn update_bias_impulse(&mut self, body: usize) {
        assert!(self.gcs.dof() > 0);
        assert!(body < self.bodies.len());
        #[cfg(debug_assertions)]
        self.debug_assert_impulses_clear();

        if self.is_articulated_inertia_dirty {
            self.refresh_articulated_inertia();
        }
        let h = self.time_step;
        let mut it = Some(body);
        while let Some(i) = it {
            self.recompute_bias_impulse(i, h);
            it = self.bodies[i].parent_index();
        }
    }

    /// Probe the response to a spatial impulse on `body`: set it, refresh the
    /// bias impulses up to the root, and flush the impulse so downstream
    /// calls see a clean state.
    pub fn update_bias_impulse_with(&mut self, body: usize, imp: SpatialVec) {
        assert!(self.gcs.dof() > 0);
        assert!(body < self.bodies.len());
        #[cfg(debug_assertions)]
        self.debug_assert_impulses_clear();

        self.bodies[body].set_constraint_impulse(imp);

        if self.is_articulated_inertia_dirty {
            self.refresh_articulated_inertia();
        }
        let h = self.time_step;
        let mut it = Some(body);
        while let Some(i) = it {
            self.recompute_bias_impulse(i, h);
            it = self.bodies[i].parent_index();
        }

        self.bodies[body].set_constraint_impulse(SpatialVec::zero());
    }

    /// Point-mass variant of the probe; the previous constraint impulse is
    /// restored exactly.
    pub fn update_bias_impulse_point_mass(
        &mut self,
        soft_body: usize,
        point_mass: usize,
        imp: Vec3,
    ) {
        assert!(self.gcs.dof() > 0);
        assert!(self.bodies[soft_body].is_soft());
        #[cfg(debug_assertions)]
        self.debug_assert_impulses_clear();

        let old = {
            let pm = self.bodies[soft_body]
                .soft_body_mut()
                .expect("soft body")
                .point_mass_mut(point_mass);
            let old = pm.constraint_impulse();
            pm.add_constraint_impulse(imp);
            old
        };

        if self.is_articulated_inertia_dirty {
            self.refresh_articulated_inertia();
        }
        let h = self.time_step;
        let mut it = Some(soft_body);
        while let Some(i) = it {
            self.recompute_bias_impulse(i, h);
            it = self.bodies[i].parent_index();
        }

        self.bodies[soft_body]
            .soft_body_mut()
            .expect("soft body")
            .point_mass_mut(point_mass)
            .set_constraint_impulse(old);
    }

    /// Forward pass computing each joint's velocity change from the current
    /// bias impulses.
    pub fn update_velocity_change(&mut self) {
        if self.is_articulated_inertia_dirty {
            self.refresh_articulated_inertia();
        }
        let h = self.time_step;
        for i in 0..self.bodies.len() {
            let pd = self.bodies[i]
                .parent_index()
                .map(|p| self.bodies[p].del_v);
            self.bodies[i].update_joint_velocity_change(pd, h, &mut self.gcs);
        }
    }

    /// Impulse-based forward dynamics: velocity changes from the stored
    /// constraint impulses, applied as q̇ += Δq̇, q̈ += Δq̇/h, τ += imp/h.
    /// A no-op for an immobile or 0-dof skeleton.
    pub fn compute_impulse_forward_dynamics(&mut self) {
        if !self.is_mobile || self.gcs.dof() == 0 {
            return;
        }
        let h = self.time_step;
        let n = self.bodies.len();

        if self.is_articulated_inertia_dirty {
            for i in 0..n {
                self.bodies[i].prepare_art_inertia(h, &self.gcs);
            }
            for i in (0..n).rev() {
                self.recompute_bias_impulse(i, h);
                if let Some(p) = self.bodies[i].parent_index() {
                    let (plain, implicit) = self.bodies[i].project_art_inertia(h);
                    self.bodies[p].art_inertia += plain;
                    self.bodies[p].art_inertia_implicit += implicit;
                }
            }
            self.is_articulated_inertia_dirty = false;
        } else {
            for i in (0..n).rev() {
                self.recompute_bias_impulse(i, h);
            }
        }

        for i in 0..n {
            let pd = self.bodies[i]
                .parent_index()
                .map(|p| self.bodies[p].del_v);
            self.bodies[i].update_joint_velocity_change(pd, h, &mut self.gcs);
            self.bodies[i].update_transmitted_impulse();
        }

        for i in 0..n {
            self.bodies[i].apply_velocity_change(h, &mut self.gcs);
        }

        // Velocities changed; the velocity-dependent caches are stale.
        self.is_coriolis_vector_dirty = true;
        self.is_combined_vector_dirty = true;
        self.is_external_force_vector_dirty = true;
    }

    // ── aggregate reads ──────────────────────────────────────────────────

    /// Mass-weighted world center of mass.
    pub fn world_com(&self) -> Vec3 {
        assert!(self.total_mass != 0.0);
        let mut com = Vec3::zeros();
        for body in self.bodies.iter() {
            com += body.world_com() * body.mass();
            if let Some(soft) = body.soft_body() {
                for pm in soft.point_masses() {
                    com += body.pm_world_position(pm, &self.gcs) * pm.mass();
                }
            }
        }
        com / self.total_mass
    }

    /// Mass-weighted world center-of-mass velocity.
    pub fn world_com_velocity(&self) -> Vec3 {
        assert!(self.total_mass != 0.0);
        let mut vel = Vec3::zeros();
        for body in self.bodies.iter() {
            vel += body.world_com_velocity() * body.mass();
            if let Some(soft) = body.soft_body() {
                for pm in soft.point_masses() {
                    vel += body.pm_world_velocity(pm, &self.gcs) * pm.mass();
                }
            }
        }
        vel / self.total_mass
    }

    /// Mass-weighted world center-of-mass acceleration.
    pub fn world_com_acceleration(&self) -> Vec3 {
        assert!(self.total_mass != 0.0);
        let mut acc = Vec3::zeros();
        for body in self.bodies.iter() {
            acc += body.world_com_acceleration() * body.mass();
            if let Some(soft) = body.soft_body() {
                for pm in soft.point_masses() {
                    acc += body.pm_world_acceleration(pm, &self.gcs) * pm.mass();
                }
            }
        }
        acc / self.total_mass
    }

    /// Service the per-body Jacobian caches in BFS order.
    fn ensure_body_jacobians(&mut self) {
        for i in 0..self.bodies.len() {
            if self.bodies[i].body_jacobian_dirty {
                let pj = self.bodies[i]
                    .parent_index()
                    .map(|p| self.bodies[p].body_jacobian().clone());
                self.bodies[i].update_body_jacobian(pj.as_ref(), &self.gcs);
            }
        }
    }

    fn ensure_body_jacobian_time_derivs(&mut self) {
        self.ensure_body_jacobians();
        for i in 0..self.bodies.len() {
            if self.bodies[i].body_jacobian_time_deriv_dirty {
                let pdj = self.bodies[i]
                    .parent_index()
                    .map(|p| self.bodies[p].body_jacobian_time_deriv().clone());
                self.bodies[i].update_body_jacobian_time_deriv(pdj.as_ref(), &self.gcs);
            }
        }
    }

    /// Body Jacobian of body `i` (6 × num_dependent, body frame), serviced
    /// through its cache.
    pub fn body_jacobian(&mut self, i: usize) -> DMat {
        self.ensure_body_jacobians();
        self.bodies[i].body_jacobian().clone()
    }

    /// Time derivative of the body Jacobian of body `i`.
    pub fn body_jacobian_time_deriv(&mut self, i: usize) -> DMat {
        self.ensure_body_jacobian_time_derivs();
        self.bodies[i].body_jacobian_time_deriv().clone()
    }

    fn jac_column(j: &DMat, c: usize) -> (Vec3, Vec3) {
        let col = j.column(c);
        (
            Vec3::new(col[0], col[1], col[2]),
            Vec3::new(col[3], col[4], col[5]),
        )
    }

    /// 3 × dof Jacobian of the world center of mass.
    pub fn world_com_jacobian(&mut self) -> DMat {
        assert!(self.total_mass != 0.0);
        self.ensure_body_jacobians();

        let dof = self.gcs.dof();
        let mut jac = DMat::zeros(3, dof);
        for body in self.bodies.iter() {
            let r = body.world_transform().rot.transpose();
            let jb = body.body_jacobian();

            let mut scatter = |point: Vec3, mass: f64, jac: &mut DMat| {
                for (ci, &dep) in body.dependent_gen_coords().iter().enumerate() {
                    let (w, v) = Self::jac_column(jb, ci);
                    let contrib = r * (v + w.cross(&point)) * mass;
                    for k in 0..3 {
                        jac[(k, dep)] += contrib[k];
                    }
                }
            };

            scatter(body.local_com(), body.mass(), &mut jac);
            if let Some(soft) = body.soft_body() {
                for pm in soft.point_masses() {
                    scatter(pm.local_position(&self.gcs), pm.mass(), &mut jac);
                    // The lattice's own dofs translate directly in the body
                    // frame.
                    let i0 = pm.index_in_skeleton();
                    for c in 0..3 {
                        for k in 0..3 {
                            jac[(k, i0 + c)] += pm.mass() * r[(k, c)];
                        }
                    }
                }
            }
        }
        jac / self.total_mass
    }

    /// Time derivative of the world center-of-mass Jacobian.
    pub fn world_com_jacobian_time_deriv(&mut self) -> DMat {
        assert!(self.total_mass != 0.0);
        self.ensure_body_jacobian_time_derivs();

        let dof = self.gcs.dof();
        let mut djac = DMat::zeros(3, dof);
        for body in self.bodies.iter() {
            let r = body.world_transform().rot.transpose();
            let w_body = body.spatial_velocity().angular();
            let jb = body.body_jacobian();
            let djb = body.body_jacobian_time_deriv();

            let mut scatter = |point: Vec3, point_vel: Vec3, mass: f64, djac: &mut DMat| {
                for (ci, &dep) in body.dependent_gen_coords().iter().enumerate() {
                    let (w, v) = Self::jac_column(jb, ci);
                    let (dw, dv) = Self::jac_column(djb, ci);
                    let lin = v + w.cross(&point);
                    let dlin = dv + dw.cross(&point) + w.cross(&point_vel);
                    let contrib = r * (w_body.cross(&lin) + dlin) * mass;
                    for k in 0..3 {
                        djac[(k, dep)] += contrib[k];
                    }
                }
            };

            scatter(body.local_com(), Vec3::zeros(), body.mass(), &mut djac);
            if let Some(soft) = body.soft_body() {
                for pm in soft.point_masses() {
                    scatter(
                        pm.local_position(&self.gcs),
                        pm.local_velocity(&self.gcs),
                        pm.mass(),
                        &mut djac,
                    );
                    let i0 = pm.index_in_skeleton();
                    for c in 0..3 {
                        let e = Vec3::new(
                            if c == 0 { 1.0 } else { 0.0 },
                            if c == 1 { 1.0 } else { 0.0 },
                            if c == 2 { 1.0 } else { 0.0 },
                        );
                        let contrib = r * w_body.cross(&e) * pm.mass();
                        for k in 0..3 {
                            djac[(k, i0 + c)] += contrib[k];
                        }
                    }
                }
            }
        }
        djac / self.total_mass
    }

    /// Total kinetic energy; non-negative by construction.
    pub fn kinetic_energy(&self) -> f64 {
        let ke: f64 = self
            .bodies
            .iter()
            .map(|b| b.kinetic_energy(&self.gcs))
            .sum();
        assert!(ke >= 0.0, "kinetic energy should be non-negative");
        ke
    }

    /// Total potential energy: gravitational plus joint elastic.
    pub fn potential_energy(&self) -> f64 {
        let mut pe = 0.0;
        for body in self.bodies.iter() {
            pe += body.potential_energy(&self.gravity, &self.gcs);
            let joint = body.parent_joint();
            pe += joint.potential_energy(
                self.gcs.slice(joint.index_in_skeleton(), joint.num_dofs()),
            );
        }
        pe
    }

    // ── union-find tags for the external constraint grouper ──────────────

    /// Reset this skeleton to a singleton group rooted at `index` (its slot
    /// in the grouper's skeleton slice).
    pub fn reset_union(&mut self, index: usize) {
        self.union_root = index;
        self.union_size = 1;
    }

    #[inline]
    pub fn union_root(&self) -> usize {
        self.union_root
    }

    #[inline]
    pub fn union_size(&self) -> usize {
        self.union_size
    }

    /// Find the root of skeleton `i`'s group, halving paths on the way.
    pub fn find_union_root(skeletons: &mut [Skeleton], i: usize) -> usize {
        let mut r = i;
        while skeletons[r].union_root != r {
            let grandparent = skeletons[skeletons[r].union_root].union_root;
            skeletons[r].union_root = grandparent;
            r = grandparent;
        }
        r
    }

    /// Merge the groups containing skeletons `a` and `b` (union by size).
    pub fn unite(skeletons: &mut [Skeleton], a: usize, b: usize) {
        let ra = Self::find_union_root(skeletons, a);
        let rb = Self::find_union_root(skeletons, b);
        if ra == rb {
            return;
        }
        let (big, small) = if skeletons[ra].union_size >= skeletons[rb].union_size {
            (ra, rb)
        } else {
            (rb, ra)
        };
        skeletons[small].union_root = big;
        skeletons[big].union_size += skeletons[small].union_size;
    }
}
