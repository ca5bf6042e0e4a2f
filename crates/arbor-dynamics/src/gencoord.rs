//! Scalar generalized coordinates and the flat vector view over them.

use arbor_math::DVec;

/// One scalar generalized coordinate: position, velocity, acceleration,
/// force, per-scalar bounds, and the impulse-dynamics slots.
#[derive(Debug, Clone)]
pub struct GenCoord {
    pub pos: f64,
    pub vel: f64,
    pub acc: f64,
    pub force: f64,
    /// Velocity change computed by the impulse recursion.
    pub vel_change: f64,
    /// Generalized constraint impulse fed in by an external solver.
    pub constraint_impulse: f64,
    pub pos_min: f64,
    pub pos_max: f64,
    pub vel_min: f64,
    pub vel_max: f64,
    pub force_min: f64,
    pub force_max: f64,
    index_in_skeleton: usize,
}

impl GenCoord {
    pub fn new(index_in_skeleton: usize) -> Self {
        Self {
            pos: 0.0,
            vel: 0.0,
            acc: 0.0,
            force: 0.0,
            vel_change: 0.0,
            constraint_impulse: 0.0,
            pos_min: f64::NEG_INFINITY,
            pos_max: f64::INFINITY,
            vel_min: f64::NEG_INFINITY,
            vel_max: f64::INFINITY,
            force_min: f64::NEG_INFINITY,
            force_max: f64::INFINITY,
            index_in_skeleton,
        }
    }

    /// Position of this coordinate in the skeleton's flat coordinate array.
    #[inline]
    pub fn index_in_skeleton(&self) -> usize {
        self.index_in_skeleton
    }
}

/// Flat vector view over a skeleton's generalized coordinates.
///
/// All whole-vector accessors copy into/out of `DVec`s; setters assert the
/// argument length against the current dof count.
#[derive(Debug, Clone, Default)]
pub struct GenCoordSystem {
    coords: Vec<GenCoord>,
}

macro_rules! vector_view {
    ($get:ident, $set:ident, $field:ident) => {
        pub fn $get(&self) -> DVec {
            DVec::from_iterator(self.coords.len(), self.coords.iter().map(|c| c.$field))
        }

        pub fn $set(&mut self, values: &DVec) {
            assert_eq!(
                values.len(),
                self.coords.len(),
                concat!(stringify!($set), ": vector size must match dof")
            );
            for (c, v) in self.coords.iter_mut().zip(values.iter()) {
                c.$field = *v;
            }
        }
    };
}

impl GenCoordSystem {
    pub fn new() -> Self {
        Self { coords: Vec::new() }
    }

    /// Number of generalized coordinates.
    #[inline]
    pub fn dof(&self) -> usize {
        self.coords.len()
    }

    /// Grow the flat array by `n` fresh coordinates, returning the index of
    /// the first one.
    pub(crate) fn grow(&mut self, n: usize) -> usize {
        let start = self.coords.len();
        for k in 0..n {
            self.coords.push(GenCoord::new(start + k));
        }
        start
    }

    pub(crate) fn clear(&mut self) {
        self.coords.clear();
    }

    #[inline]
    pub fn coord(&self, i: usize) -> &GenCoord {
        &self.coords[i]
    }

    #[inline]
    pub fn coord_mut(&mut self, i: usize) -> &mut GenCoord {
        &mut self.coords[i]
    }

    #[inline]
    pub fn slice(&self, start: usize, len: usize) -> &[GenCoord] {
        &self.coords[start..start + len]
    }

    #[inline]
    pub fn slice_mut(&mut self, start: usize, len: usize) -> &mut [GenCoord] {
        &mut self.coords[start..start + len]
    }

    vector_view!(positions, set_positions, pos);
    vector_view!(velocities, set_velocities, vel);
    vector_view!(accelerations, set_accelerations, acc);
    vector_view!(forces, set_forces, force);
    vector_view!(vel_changes, set_vel_changes, vel_change);
    vector_view!(
        constraint_impulses,
        set_constraint_impulses,
        constraint_impulse
    );
    vector_view!(forces_min, set_forces_min, force_min);
    vector_view!(forces_max, set_forces_max, force_max);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn grow_assigns_contiguous_indices() {
        let mut gcs = GenCoordSystem::new();
        let a = gcs.grow(3);
        let b = gcs.grow(2);
        assert_eq!(a, 0);
        assert_eq!(b, 3);
        assert_eq!(gcs.dof(), 5);
        for i in 0..5 {
            assert_eq!(gcs.coord(i).index_in_skeleton(), i);
        }
    }

    #[test]
    fn vector_views_round_trip() {
        let mut gcs = GenCoordSystem::new();
        gcs.grow(4);
        let q = DVec::from_vec(vec![1.0, -2.0, 3.0, 0.5]);
        gcs.set_positions(&q);
        assert_eq!(gcs.positions(), q);
        assert_eq!(gcs.velocities(), DVec::zeros(4));
    }

    #[test]
    #[should_panic]
    fn size_mismatch_is_a_precondition_violation() {
        let mut gcs = GenCoordSystem::new();
        gcs.grow(3);
        gcs.set_velocities(&DVec::zeros(2));
    }

    #[test]
    fn default_bounds_are_unbounded() {
        let mut gcs = GenCoordSystem::new();
        gcs.grow(1);
        assert_eq!(gcs.coord(0).force_min, f64::NEG_INFINITY);
        assert_eq!(gcs.coord(0).force_max, f64::INFINITY);
    }
}
