//! Articulated rigid/soft multibody dynamics.
//!
//! A `Skeleton` owns a rooted tree of `BodyNode`s connected by `Joint`s,
//! with optional deformable mass lattices (`SoftBody` / `PointMass`). It
//! answers the dynamics queries a simulator needs: forward kinematics, the
//! joint-space mass matrix and its damping-augmented form with both
//! inverses, the Coriolis/gravity/external force vectors, forward dynamics
//! via Featherstone's articulated-body algorithm, inverse dynamics via
//! recursive Newton-Euler, and impulse-based forward dynamics for an
//! external constraint solver.
//!
//! Derived quantities are cached behind per-quantity freshness flags; any
//! state write invalidates the affected caches and the next read recomputes.

pub mod body;
pub mod gencoord;
pub mod joint;
pub mod marker;
pub mod point_mass;
pub mod skeleton;

pub use body::BodyNode;
pub use gencoord::{GenCoord, GenCoordSystem};
pub use joint::{Joint, JointKind};
pub use marker::Marker;
pub use point_mass::{PointMass, SoftBody};
pub use skeleton::Skeleton;
