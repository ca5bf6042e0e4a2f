//! Integration tests for the arbor dynamics engine.

use approx::assert_relative_eq;
use arbor::{
    BodyNode, DVec, Joint, Simulator, Skeleton, SpatialInertia, SpatialTransform, SpatialVec,
    Vec3, GRAVITY,
};

fn rod_inertia(mass: f64, length: f64) -> SpatialInertia {
    SpatialInertia::new(
        mass,
        Vec3::new(0.0, -length / 2.0, 0.0),
        arbor::arbor_math::Mat3::from_diagonal(&Vec3::new(
            mass * length * length / 12.0,
            0.0,
            mass * length * length / 12.0,
        )),
    )
}

/// A chain of `n` unit-mass 1 m rods hanging along −y, revolute about z.
fn pendulum(n: usize, dt: f64) -> Skeleton {
    let mut skel = Skeleton::new("pendulum");
    for i in 0..n {
        let offset = if i == 0 {
            SpatialTransform::identity()
        } else {
            SpatialTransform::from_translation(Vec3::new(0.0, -1.0, 0.0))
        };
        let body = BodyNode::new(
            format!("link{i}"),
            Joint::revolute(format!("joint{i}"), offset, Vec3::z()),
            rod_inertia(1.0, 1.0),
        );
        let parent = if i == 0 { None } else { Some(i - 1) };
        skel.add_body_node(body, parent);
    }
    skel.init(dt, Vec3::new(0.0, -GRAVITY, 0.0));
    skel
}

/// A mixed-joint tree: free root, ball child, prismatic grandchild and a
/// revolute sibling. Exercises the multi-dof joint paths.
fn mixed_tree(dt: f64) -> Skeleton {
    let mut skel = Skeleton::new("mixed");
    let root = skel.add_body_node(
        BodyNode::new(
            "root",
            Joint::free("root_joint", SpatialTransform::identity()),
            SpatialInertia::cuboid(2.0, Vec3::new(0.2, 0.1, 0.3)),
        ),
        None,
    );
    let ball = skel.add_body_node(
        BodyNode::new(
            "swing",
            Joint::ball(
                "ball_joint",
                SpatialTransform::from_translation(Vec3::new(0.3, 0.0, 0.0)),
            ),
            rod_inertia(0.8, 0.6),
        ),
        Some(root),
    );
    skel.add_body_node(
        BodyNode::new(
            "slider",
            Joint::prismatic(
                "slide_joint",
                SpatialTransform::from_translation(Vec3::new(0.0, -0.6, 0.0)),
                Vec3::y(),
            ),
            SpatialInertia::sphere(0.5, 0.05),
        ),
        Some(ball),
    );
    skel.add_body_node(
        BodyNode::new(
            "paddle",
            Joint::revolute(
                "rev_joint",
                SpatialTransform::from_translation(Vec3::new(-0.3, 0.0, 0.0)),
                Vec3::x(),
            ),
            rod_inertia(0.4, 0.4),
        ),
        Some(root),
    );
    skel.init(dt, Vec3::new(0.0, 0.0, -GRAVITY));
    skel
}

fn spread_state(skel: &mut Skeleton, seed: f64) {
    let dof = skel.dof();
    let q = DVec::from_fn(dof, |i, _| 0.4 * ((i as f64 + 1.0) * seed).sin());
    let qd = DVec::from_fn(dof, |i, _| 0.3 * ((i as f64 + 2.0) * seed * 1.7).cos());
    skel.set_positions(&q, true, true, false);
    skel.set_velocities(&qd, true, false);
}

#[test]
fn free_body_falls_under_gravity() {
    let dt = 0.001;
    let mut skel = Skeleton::new("ball");
    skel.add_body_node(
        BodyNode::new(
            "ball",
            Joint::free("root", SpatialTransform::identity()),
            SpatialInertia::sphere(1.0, 0.1),
        ),
        None,
    );
    skel.init(dt, Vec3::new(0.0, 0.0, -GRAVITY));

    let sim = Simulator::new();
    sim.simulate(&mut skel, 1000);

    let q = skel.positions();
    assert!((q[0]).abs() < 1e-12);
    assert!((q[1]).abs() < 1e-12);
    assert!(
        (q[2] - (-4.905)).abs() < 5e-3,
        "fell to {} after 1 s, expected about -4.905",
        q[2]
    );
    // No rotation picked up on the way down.
    for k in 3..6 {
        assert!(q[k].abs() < 1e-12);
    }
}

#[test]
fn two_link_pendulum_released_horizontal() {
    let dt = 1e-4;
    let mut skel = pendulum(2, dt);
    // Rotate the whole chain to horizontal and release from rest.
    skel.set_positions(
        &DVec::from_vec(vec![std::f64::consts::FRAC_PI_2, 0.0]),
        true,
        true,
        false,
    );

    let sim = Simulator::new();
    let e0 = skel.kinetic_energy() + skel.potential_energy();

    // Kinetic energy must strictly increase while the chain picks up speed.
    let mut prev_ke = skel.kinetic_energy();
    for _ in 0..1000 {
        sim.step(&mut skel);
        let ke = skel.kinetic_energy();
        assert!(ke > prev_ke, "KE must increase during the first 100 ms");
        prev_ke = ke;
    }

    // Total energy drift stays under 1% of the energy swing over 2 s.
    let swing = 2.0 * GRAVITY; // |PE| of the chain hanging straight down
    let mut max_drift: f64 = 0.0;
    for _ in 0..19_000 {
        sim.step(&mut skel);
        let e = skel.kinetic_energy() + skel.potential_energy();
        max_drift = max_drift.max((e - e0).abs());
    }
    assert!(
        max_drift < 0.01 * swing,
        "energy drift {} exceeds 1% of {}",
        max_drift,
        swing
    );
}

#[test]
fn passive_gravity_free_chain_conserves_energy() {
    let dt = 1e-4;
    let mut skel = pendulum(2, dt);
    skel.set_gravity(Vec3::zeros());
    skel.set_velocities(&DVec::from_vec(vec![1.2, -0.8]), true, false);

    let e0 = skel.kinetic_energy();
    let sim = Simulator::new();
    let mut max_drift: f64 = 0.0;
    for _ in 0..10_000 {
        sim.step(&mut skel);
        max_drift = max_drift.max((skel.kinetic_energy() - e0).abs());
    }
    assert!(
        max_drift / e0 < 0.01,
        "relative drift {} over 1 s",
        max_drift / e0
    );
}

#[test]
fn equation_of_motion_holds() {
    let mut skel = mixed_tree(0.001);
    spread_state(&mut skel, 0.9);

    let dof = skel.dof();
    let tau = DVec::from_fn(dof, |i, _| 0.2 * ((i as f64) - 2.0));
    skel.set_gen_forces(&tau);
    skel.add_body_external_force(
        1,
        SpatialVec::new(Vec3::new(0.1, 0.0, -0.2), Vec3::new(0.0, 0.5, 0.0)),
    );

    skel.compute_forward_dynamics();
    let qdd = skel.accelerations();

    let m = skel.mass_matrix().clone();
    let cg = skel.combined_vector().clone();
    let fext = skel.external_force_vector().clone();

    let residual = &m * &qdd + &cg - &tau - &fext;
    assert!(
        residual.norm() < 1e-8,
        "‖M·q̈ + C + g − τ − f_ext‖ = {}",
        residual.norm()
    );
}

#[test]
fn inverse_dynamics_recovers_forward_torques() {
    let mut skel = mixed_tree(0.001);
    spread_state(&mut skel, 1.3);

    let dof = skel.dof();
    let tau = DVec::from_fn(dof, |i, _| 0.15 * ((i as f64 * 0.7).sin() + 0.5));
    skel.set_gen_forces(&tau);
    skel.compute_forward_dynamics();

    // Re-deriving the forces from the accelerations must reproduce τ.
    skel.compute_inverse_dynamics(false, false);
    let recovered = skel.gen_forces();
    assert_relative_eq!(recovered, tau, epsilon = 1e-8);
}

#[test]
fn mass_matrix_inverses_are_consistent_for_mixed_joints() {
    let mut skel = mixed_tree(0.001);
    for i in 0..skel.num_body_nodes() {
        let joint = skel.body_node_mut(i).parent_joint_mut();
        for k in 0..joint.num_dofs() {
            joint.set_damping_coefficient(k, 0.2);
        }
    }
    spread_state(&mut skel, 0.45);

    let dof = skel.dof();
    let id = arbor::DMat::identity(dof, dof);

    let m = skel.mass_matrix().clone();
    assert_relative_eq!(m.clone(), m.transpose(), epsilon = 1e-9);

    let inv_m = skel.inv_mass_matrix().clone();
    assert_relative_eq!(inv_m.clone(), inv_m.transpose(), epsilon = 1e-9);
    assert_relative_eq!(&m * &inv_m, id, epsilon = 1e-7);

    let aug = skel.aug_mass_matrix().clone();
    let inv_aug = skel.inv_aug_mass_matrix().clone();
    assert_relative_eq!(&aug * &inv_aug, id, epsilon = 1e-7);
}

#[test]
fn com_quantities_follow_the_jacobians() {
    let mut skel = mixed_tree(0.001);
    spread_state(&mut skel, 0.7);

    let qd = skel.velocities();
    let jac = skel.world_com_jacobian();
    let v = &jac * &qd;
    let v_direct = skel.world_com_velocity();
    for k in 0..3 {
        assert_relative_eq!(v[k], v_direct[k], epsilon = 1e-9);
    }

    let qdd = DVec::from_fn(skel.dof(), |i, _| 0.1 * (i as f64 + 1.0));
    skel.set_accelerations(&qdd, true);
    let jac = skel.world_com_jacobian();
    let djac = skel.world_com_jacobian_time_deriv();
    let a = &jac * &qdd + &djac * &qd;
    let a_direct = skel.world_com_acceleration();
    for k in 0..3 {
        assert_relative_eq!(a[k], a_direct[k], epsilon = 1e-8);
    }
}

#[test]
fn ball_joint_pendulum_reaches_equilibrium_state() {
    let dt = 0.001;
    let mut skel = Skeleton::new("spherical");
    skel.add_body_node(
        BodyNode::new(
            "bob",
            Joint::ball("pivot", SpatialTransform::identity()),
            rod_inertia(1.0, 1.0),
        ),
        None,
    );
    skel.init(dt, Vec3::new(0.0, -GRAVITY, 0.0));

    // Hanging straight down is an equilibrium.
    skel.compute_forward_dynamics();
    assert_relative_eq!(skel.accelerations(), DVec::zeros(3), epsilon = 1e-10);

    // Tilted sideways it accelerates back toward the vertical.
    skel.set_positions(&DVec::from_vec(vec![0.0, 0.0, 0.5]), true, true, false);
    skel.compute_forward_dynamics();
    assert!(skel.accelerations()[2] < 0.0);
}

#[test]
fn impulse_response_matches_inverse_inertia() {
    let mut skel = mixed_tree(0.001);
    spread_state(&mut skel, 0.25);
    skel.set_velocities(&DVec::zeros(skel.dof()), true, false);

    // A test impulse on the swing body.
    let imp = SpatialVec::new(Vec3::new(0.0, 0.1, 0.0), Vec3::new(0.4, 0.0, -0.2));
    skel.update_bias_impulse_with(1, imp);
    skel.update_velocity_change();
    let dv = skel.gen_coord_system().vel_changes();
    assert!(dv.norm() > 0.0, "impulse must produce a velocity change");

    // The recursion must agree with the closed form Δq̇ = M̃⁻¹·Jᵀ·imp.
    let jb = skel.body_jacobian(1);
    let deps: Vec<usize> = skel.body_node(1).dependent_gen_coords().to_vec();
    let imp6 = imp.as_vec6();
    let mut gen_imp = DVec::zeros(skel.dof());
    for (ci, &dep) in deps.iter().enumerate() {
        let col = jb.column(ci);
        gen_imp[dep] = (0..6).map(|k| col[k] * imp6[k]).sum();
    }
    let dv_expected = skel.inv_aug_mass_matrix() * &gen_imp;
    assert_relative_eq!(dv, dv_expected, epsilon = 1e-8);
}

#[test]
fn markers_ride_with_their_bodies() {
    let dt = 0.001;
    let mut skel = Skeleton::new("marked");
    let mut body = BodyNode::new(
        "rod",
        Joint::revolute("pivot", SpatialTransform::identity(), Vec3::z()),
        rod_inertia(1.0, 1.0),
    );
    body.add_marker(arbor::Marker::new("tip", Vec3::new(0.0, -1.0, 0.0)));
    skel.add_body_node(body, None);
    skel.init(dt, Vec3::new(0.0, -GRAVITY, 0.0));

    skel.set_positions(
        &DVec::from_vec(vec![std::f64::consts::FRAC_PI_2]),
        true,
        false,
        false,
    );
    let marker = skel.marker_by_name("tip").unwrap().clone();
    let world = skel.body_node(0).marker_world_position(&marker);
    assert_relative_eq!(world, Vec3::new(1.0, 0.0, 0.0), epsilon = 1e-12);
}

mod properties {
    use super::*;
    use proptest::prelude::*;

    fn arb_state(dof: usize) -> impl Strategy<Value = (Vec<f64>, Vec<f64>)> {
        (
            proptest::collection::vec(-1.2..1.2_f64, dof),
            proptest::collection::vec(-1.0..1.0_f64, dof),
        )
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(24))]

        #[test]
        fn mass_matrix_is_symmetric_positive_definite(
            (q, qd) in arb_state(3),
            x in proptest::collection::vec(-1.0..1.0_f64, 3),
        ) {
            let mut skel = pendulum(3, 0.001);
            skel.set_positions(&DVec::from_vec(q), true, true, false);
            skel.set_velocities(&DVec::from_vec(qd), true, false);

            let m = skel.mass_matrix().clone();
            for r in 0..3 {
                for c in 0..3 {
                    prop_assert!((m[(r, c)] - m[(c, r)]).abs() < 1e-10);
                }
            }

            let x = DVec::from_vec(x);
            if x.norm() > 1e-3 {
                let quad = (&x.transpose() * &m * &x)[(0, 0)];
                prop_assert!(quad > 0.0, "xᵀMx = {}", quad);
            }
        }

        #[test]
        fn inverse_is_a_true_inverse((q, qd) in arb_state(3)) {
            let mut skel = pendulum(3, 0.001);
            skel.set_positions(&DVec::from_vec(q), true, true, false);
            skel.set_velocities(&DVec::from_vec(qd), true, false);

            let m = skel.mass_matrix().clone();
            let inv_m = skel.inv_mass_matrix().clone();
            let prod = &m * &inv_m;
            for r in 0..3 {
                for c in 0..3 {
                    let expected = if r == c { 1.0 } else { 0.0 };
                    prop_assert!((prod[(r, c)] - expected).abs() < 1e-8,
                        "M·M⁻¹[{},{}] = {}", r, c, prod[(r, c)]);
                }
            }
        }

        #[test]
        fn forward_inverse_round_trip((q, qd) in arb_state(3)) {
            let mut skel = pendulum(3, 0.001);
            skel.set_positions(&DVec::from_vec(q), true, true, false);
            skel.set_velocities(&DVec::from_vec(qd), true, false);
            let tau = DVec::from_vec(vec![0.3, -0.1, 0.2]);
            skel.set_gen_forces(&tau);

            skel.compute_forward_dynamics();
            skel.compute_inverse_dynamics(false, false);

            let recovered = skel.gen_forces();
            for k in 0..3 {
                prop_assert!((recovered[k] - tau[k]).abs() < 1e-8,
                    "τ[{}]: {} vs {}", k, recovered[k], tau[k]);
            }
        }

        #[test]
        fn com_is_mass_weighted_average((q, _) in arb_state(3)) {
            let mut skel = pendulum(3, 0.001);
            skel.set_positions(&DVec::from_vec(q), true, false, false);

            let mut expected = Vec3::zeros();
            let mut total = 0.0;
            for i in 0..skel.num_body_nodes() {
                let b = skel.body_node(i);
                expected += b.world_com() * b.mass();
                total += b.mass();
            }
            expected /= total;

            let com = skel.world_com();
            for k in 0..3 {
                prop_assert!((com[k] - expected[k]).abs() < 1e-12);
            }
        }
    }
}
