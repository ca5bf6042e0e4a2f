//! arbor — articulated rigid/soft multibody dynamics engine.
//!
//! This is the umbrella crate: it re-exports the core types from the
//! sub-crates and provides the per-joint semi-implicit Euler stepping
//! driver.

pub use arbor_dynamics::{
    self, BodyNode, GenCoord, GenCoordSystem, Joint, JointKind, Marker, PointMass, Skeleton,
    SoftBody,
};
pub use arbor_math::{
    self, DMat, DVec, Quat, SpatialInertia, SpatialMat, SpatialTransform, SpatialVec, Vec3,
    GRAVITY,
};

/// Pluggable stepping scheme.
///
/// Implementations define how to advance a skeleton by one timestep.
pub trait Solver {
    /// Advance the skeleton by its own timestep.
    fn step(&self, skeleton: &mut Skeleton);
}

/// Semi-implicit Euler: velocities first, then positions on the joint
/// groups, then forward kinematics for the new state.
pub struct SemiImplicitEulerSolver;

impl Solver for SemiImplicitEulerSolver {
    fn step(&self, skeleton: &mut Skeleton) {
        let dt = skeleton.time_step();
        skeleton.compute_forward_dynamics();
        skeleton.integrate_gen_vels(dt);
        skeleton.integrate_configs(dt);
        skeleton.compute_forward_kinematics(true, true, false);
    }
}

/// Main simulation driver.
pub struct Simulator {
    solver: Box<dyn Solver>,
}

impl Simulator {
    /// Create a simulator with the default semi-implicit Euler solver.
    pub fn new() -> Self {
        Self {
            solver: Box::new(SemiImplicitEulerSolver),
        }
    }

    /// Create a simulator with a custom solver.
    pub fn with_solver(solver: Box<dyn Solver>) -> Self {
        Self { solver }
    }

    /// Advance the skeleton by one timestep.
    pub fn step(&self, skeleton: &mut Skeleton) {
        self.solver.step(skeleton);
    }

    /// Run the simulation for `n` steps.
    pub fn simulate(&self, skeleton: &mut Skeleton, n: usize) {
        for _ in 0..n {
            self.step(skeleton);
        }
    }
}

impl Default for Simulator {
    fn default() -> Self {
        Self::new()
    }
}
