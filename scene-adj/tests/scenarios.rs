//! End-to-end reconstruction scenarios over synthetic projects with known
//! ground truth.

use std::collections::BTreeMap;

use nalgebra::{Point2, Point3, UnitQuaternion, Vector3};
use rand::SeedableRng;
use rand_distr::{Distribution, Normal};

use scene_adj::{optimize, NullHost, OptimizeOptions, OptimizeResult, SolveHost};
use scene_mvg::{extrinsics::look_at, Camera};
use scene_types::{
    Axis, ImagePoint, Line, LineDirection, Project, VanishingLine, Viewpoint, ViewpointId,
    WorldPoint, WorldPointId,
};

/// Project `point` through a ground-truth viewpoint and record the
/// observation.
fn observe(project: &mut Project, vp: ViewpointId, wp: WorldPointId, truth: &Point3<f64>) {
    let camera = Camera::from_viewpoint(project.viewpoints.get(vp).unwrap());
    let uv = camera.project(truth).pixel().expect("point visible");
    project.add_image_point(ImagePoint::new(vp, wp, uv));
}

fn default_options() -> OptimizeOptions {
    OptimizeOptions::default()
}

/// Single camera over four locked planar points, resected with PnP.
fn pnp_scenario() -> (Project, Point3<f64>, UnitQuaternion<f64>) {
    let mut project = Project::new("pnp-scenario");

    let truth_position = Point3::new(0.0, 0.0, -20.0);
    let truth_rotation = UnitQuaternion::identity();

    let mut vp = Viewpoint::new("cam", 1920, 1080);
    vp.intrinsics.focal_length = 1500.0;
    vp.is_focal_locked = true;
    // ground truth pose, used only to synthesize observations
    vp.position = truth_position;
    vp.rotation = truth_rotation;
    let vp_id = project.add_viewpoint(vp);

    let corners = [
        Point3::new(-5.0, -5.0, 0.0),
        Point3::new(5.0, -5.0, 0.0),
        Point3::new(5.0, 5.0, 0.0),
        Point3::new(-5.0, 5.0, 0.0),
    ];
    for (i, corner) in corners.iter().enumerate() {
        let wp = project.add_world_point(
            WorldPoint::new(format!("p{i}")).with_locked([corner.x, corner.y, corner.z]),
        );
        observe(&mut project, vp_id, wp, corner);
    }

    // forget the pose; the solver must recover it
    let vp = project.viewpoints.get_mut(vp_id).unwrap();
    vp.position = Point3::origin();
    vp.rotation = UnitQuaternion::identity();

    (project, truth_position, truth_rotation)
}

#[test]
fn single_camera_pnp_scenario() {
    let (mut project, truth_position, truth_rotation) = pnp_scenario();
    let result = optimize(&mut project, &default_options(), &mut NullHost);

    assert_eq!(result.error, None);
    assert!(result.converged);
    assert!(result.iterations <= 20, "iterations {}", result.iterations);
    let median = result.median_reprojection_error.unwrap();
    assert!(median < 0.5, "median {median}");

    let (_, vp) = project.viewpoint_by_name("cam").unwrap();
    assert!((vp.position - truth_position).norm() < 0.01);
    assert!(vp.rotation.angle_to(&truth_rotation) < 1e-3);
    assert_eq!(result.cameras_initialized, vec!["cam".to_string()]);
}

#[test]
fn locked_axes_do_not_move() {
    let (mut project, _, _) = pnp_scenario();
    let before: Vec<[Option<f64>; 3]> = project
        .world_points
        .iter()
        .map(|(_, p)| p.locked_xyz)
        .collect();

    optimize(&mut project, &default_options(), &mut NullHost);

    let after: Vec<[Option<f64>; 3]> = project
        .world_points
        .iter()
        .map(|(_, p)| p.locked_xyz)
        .collect();
    // bitwise comparison: locked tiers are never touched
    for (b, a) in before.iter().zip(&after) {
        for axis in 0..3 {
            assert_eq!(b[axis].map(f64::to_bits), a[axis].map(f64::to_bits));
        }
    }
}

#[test]
fn quaternions_are_unit_after_solve() {
    let (mut project, _, _) = pnp_scenario();
    optimize(&mut project, &default_options(), &mut NullHost);
    for (_, vp) in project.viewpoints.iter() {
        assert!((vp.rotation.quaternion().norm() - 1.0).abs() < 1e-6);
    }
}

#[test]
fn cheirality_holds_for_non_outlier_observations() {
    let (mut project, _, _) = pnp_scenario();
    let result = optimize(&mut project, &default_options(), &mut NullHost);
    assert_eq!(result.error, None);

    for (_, ip) in project.image_points.iter() {
        let vp = project.viewpoints.get(ip.viewpoint).unwrap();
        let point = project.world_points.get(ip.world_point).unwrap();
        let camera = Camera::from_viewpoint(vp);
        let c = camera.camera_coords(&point.effective_xyz().unwrap());
        assert!(c.z > 0.0, "observation behind camera: depth {}", c.z);
    }
}

#[test]
fn determinism_across_runs() {
    let run = || {
        let (mut project, _, _) = pnp_scenario();
        let result = optimize(&mut project, &default_options(), &mut NullHost);
        (result.residual, result.iterations)
    };
    let (r1, i1) = run();
    let (r2, i2) = run();
    assert_eq!(r1.to_bits(), r2.to_bits());
    assert_eq!(i1, i2);
}

#[test]
fn second_solve_of_solved_project_is_trivial() {
    let (mut project, _, _) = pnp_scenario();
    let first = optimize(&mut project, &default_options(), &mut NullHost);
    assert!(first.converged);

    let second = optimize(&mut project, &default_options(), &mut NullHost);
    assert!(second.converged);
    assert!(second.iterations <= 1, "iterations {}", second.iterations);
}

/// Two-view scenario: eight cube corners, three locked for scale and
/// frame, second camera yawed by π/12 at a baseline of 10.
fn two_view_scenario() -> (Project, ViewpointId, ViewpointId) {
    let mut project = Project::new("two-view");

    let mut vp1 = Viewpoint::new("cam1", 1920, 1080);
    vp1.intrinsics.focal_length = 1920.0;
    vp1.is_focal_locked = true;
    vp1.position = Point3::new(0.0, 0.0, -20.0);
    let vp1_id = project.add_viewpoint(vp1);

    let mut vp2 = Viewpoint::new("cam2", 1920, 1080);
    vp2.intrinsics.focal_length = 1920.0;
    vp2.is_focal_locked = true;
    vp2.position = Point3::new(10.0, 0.0, -20.0);
    vp2.rotation =
        UnitQuaternion::from_axis_angle(&Vector3::y_axis(), std::f64::consts::PI / 12.0);
    let vp2_id = project.add_viewpoint(vp2);

    let corners = [
        Point3::new(-5.0, -5.0, 0.0),
        Point3::new(5.0, -5.0, 0.0),
        Point3::new(5.0, 5.0, 0.0),
        Point3::new(-5.0, 5.0, 0.0),
        Point3::new(-5.0, -5.0, 10.0),
        Point3::new(5.0, -5.0, 10.0),
        Point3::new(5.0, 5.0, 10.0),
        Point3::new(-5.0, 5.0, 10.0),
    ];
    // three locked corners pin scale and frame
    let locked = [0usize, 1, 6];
    for (i, corner) in corners.iter().enumerate() {
        let mut wp = WorldPoint::new(format!("c{i}"));
        if locked.contains(&i) {
            wp = wp.with_locked([corner.x, corner.y, corner.z]);
        }
        let wp_id = project.add_world_point(wp);
        observe(&mut project, vp1_id, wp_id, corner);
        observe(&mut project, vp2_id, wp_id, corner);
    }

    // forget both poses
    for id in [vp1_id, vp2_id] {
        let vp = project.viewpoints.get_mut(id).unwrap();
        vp.position = Point3::origin();
        vp.rotation = UnitQuaternion::identity();
    }

    (project, vp1_id, vp2_id)
}

#[test]
fn essential_matrix_initialization_recovers_baseline() {
    let (mut project, vp1, vp2) = two_view_scenario();

    let plan = scene_adj::CandidatePlan {
        description: "essential seed".into(),
        anchor: Some(vp1),
        kind: scene_adj::PlanKind::Essential { partner: vp2 },
        relax_principal_point: false,
        sign_overrides: BTreeMap::new(),
    };
    let mut rng = scene_mvg::SeededRng::new(0);
    scene_adj::candidates::apply_plan(&mut project, &plan, true, true, &mut rng).unwrap();

    let baseline = (project.viewpoints.get(vp2).unwrap().position
        - project.viewpoints.get(vp1).unwrap().position)
        .norm();
    assert!(
        (baseline - 10.0).abs() < 0.2,
        "baseline after initialization: {baseline}"
    );

    // refine from the initialized poses only
    let options = OptimizeOptions {
        auto_initialize_cameras: false,
        ..default_options()
    };
    let result = optimize(&mut project, &options, &mut NullHost);
    assert_eq!(result.error, None);

    let baseline = (project.viewpoints.get(vp2).unwrap().position
        - project.viewpoints.get(vp1).unwrap().position)
        .norm();
    assert!((baseline - 10.0).abs() < 0.1, "refined baseline {baseline}");
    assert!(result.median_reprojection_error.unwrap() < 1.0);
}

#[test]
fn two_view_scenario_end_to_end() {
    let (mut project, vp1, vp2) = two_view_scenario();
    let result = optimize(&mut project, &default_options(), &mut NullHost);
    assert_eq!(result.error, None);
    assert!(result.converged);

    let baseline = (project.viewpoints.get(vp2).unwrap().position
        - project.viewpoints.get(vp1).unwrap().position)
        .norm();
    assert!((baseline - 10.0).abs() < 0.1, "baseline {baseline}");
    assert!(result.median_reprojection_error.unwrap() < 1.0);
}

#[test]
fn seed_pair_prefers_the_locked_pair() {
    let (project, vp1, vp2) = two_view_scenario();
    let ranked = scene_adj::candidates::rank_seed_pairs(&project);
    assert!(!ranked.is_empty());
    assert_eq!((ranked[0].0, ranked[0].1), (vp1, vp2));
    assert!(ranked[0].2.has_scale);
}

/// Vanishing-line scenario: six axis-tagged lines (three X, three Z) and
/// two locked points.
fn vanishing_point_scenario() -> (Project, UnitQuaternion<f64>) {
    let mut project = Project::new("vp-scenario");

    let truth_position = Point3::new(14.0, 6.0, -16.0);
    let truth_rotation = look_at(&truth_position, &Point3::origin(), &Vector3::y());

    let mut vp = Viewpoint::new("cam", 1920, 1080);
    vp.intrinsics.focal_length = 1500.0;
    vp.position = truth_position;
    vp.rotation = truth_rotation;
    let vp_id = project.add_viewpoint(vp);
    let truth_camera = Camera::from_viewpoint(project.viewpoints.get(vp_id).unwrap());

    // three world segments per axis, projected into vanishing lines
    let anchors = [
        Point3::new(0.0, 0.0, 0.0),
        Point3::new(1.0, 2.0, 1.5),
        Point3::new(-2.0, 1.0, 3.0),
    ];
    for axis in [Axis::X, Axis::Z] {
        for anchor in &anchors {
            let p1 = truth_camera.project(anchor).pixel().unwrap();
            let p2 = truth_camera
                .project(&(anchor + axis.unit() * 4.0))
                .pixel()
                .unwrap();
            project.add_vanishing_line(VanishingLine {
                viewpoint: vp_id,
                axis,
                p1,
                p2,
            });
        }
    }

    for (name, position) in [
        ("origin", Point3::new(0.0, 0.0, 0.0)),
        ("x10", Point3::new(10.0, 0.0, 0.0)),
    ] {
        let wp = project.add_world_point(
            WorldPoint::new(name).with_locked([position.x, position.y, position.z]),
        );
        observe(&mut project, vp_id, wp, &position);
    }

    // forget pose and focal length
    let vp = project.viewpoints.get_mut(vp_id).unwrap();
    vp.position = Point3::origin();
    vp.rotation = UnitQuaternion::identity();
    vp.intrinsics.focal_length = 1920.0;

    (project, truth_rotation)
}

#[test]
fn vanishing_point_scenario_recovers_rotation_and_focal() {
    let (mut project, truth_rotation) = vanishing_point_scenario();
    let result = optimize(&mut project, &default_options(), &mut NullHost);
    assert_eq!(result.error, None);
    assert!(result.converged);

    let (_, vp) = project.viewpoint_by_name("cam").unwrap();
    let focal = vp.intrinsics.focal_length;
    assert!(
        (focal - 1500.0).abs() / 1500.0 < 0.02,
        "recovered focal {focal}"
    );
    let angle = vp.rotation.angle_to(&truth_rotation);
    assert!(angle.to_degrees() < 0.5, "rotation off by {angle} rad");
    // right-handed recovery: the reflection flag stays clear
    assert!(!vp.is_z_reflected);
}

/// Full cube: eight corners joined by twelve axis-aligned edges of length
/// ten, one corner locked, two cameras with partial visibility.
fn cube_scenario() -> Project {
    let mut project = Project::new("cube");

    let corners = [
        Point3::new(0.0, 0.0, 0.0),
        Point3::new(10.0, 0.0, 0.0),
        Point3::new(10.0, 10.0, 0.0),
        Point3::new(0.0, 10.0, 0.0),
        Point3::new(0.0, 0.0, 10.0),
        Point3::new(10.0, 0.0, 10.0),
        Point3::new(10.0, 10.0, 10.0),
        Point3::new(0.0, 10.0, 10.0),
    ];

    let mut corner_ids = Vec::new();
    for (i, corner) in corners.iter().enumerate() {
        let mut wp = WorldPoint::new(format!("c{i}"));
        if i == 0 {
            wp = wp.with_locked([corner.x, corner.y, corner.z]);
        }
        corner_ids.push(project.add_world_point(wp));
    }

    // twelve edges, all oriented from the lesser corner so the default
    // inference branch reproduces the cube
    let edges: [(usize, usize, LineDirection); 12] = [
        (0, 1, LineDirection::X),
        (3, 2, LineDirection::X),
        (4, 5, LineDirection::X),
        (7, 6, LineDirection::X),
        (0, 3, LineDirection::Y),
        (1, 2, LineDirection::Y),
        (4, 7, LineDirection::Y),
        (5, 6, LineDirection::Y),
        (0, 4, LineDirection::Z),
        (1, 5, LineDirection::Z),
        (2, 6, LineDirection::Z),
        (3, 7, LineDirection::Z),
    ];
    for (a, b, direction) in edges {
        project.add_line(
            Line::new(corner_ids[a], corner_ids[b])
                .with_direction(direction)
                .with_target_length(10.0),
        );
    }

    let views = [
        ("cam1", Point3::new(35.0, 18.0, -30.0), [0usize, 1, 2, 3, 4]),
        ("cam2", Point3::new(-20.0, 22.0, -32.0), [3usize, 4, 5, 6, 7]),
    ];
    for (name, position, visible) in views {
        let mut vp = Viewpoint::new(name, 1920, 1080);
        vp.intrinsics.focal_length = 1500.0;
        vp.is_focal_locked = true;
        vp.position = position;
        vp.rotation = look_at(&position, &Point3::new(5.0, 5.0, 5.0), &Vector3::y());
        let vp_id = project.add_viewpoint(vp);
        for i in visible {
            observe(&mut project, vp_id, corner_ids[i], &corners[i]);
        }
        // forget the pose
        let vp = project.viewpoints.get_mut(vp_id).unwrap();
        vp.position = Point3::origin();
        vp.rotation = UnitQuaternion::identity();
    }

    project
}

#[test]
fn cube_scenario_line_lengths() {
    let mut project = cube_scenario();
    let result = optimize(&mut project, &default_options(), &mut NullHost);
    assert_eq!(result.error, None);
    assert!(result.converged);

    for (_, line) in project.lines.iter() {
        let a = project
            .world_points
            .get(line.a)
            .unwrap()
            .effective_xyz()
            .unwrap();
        let b = project
            .world_points
            .get(line.b)
            .unwrap()
            .effective_xyz()
            .unwrap();
        let length = (b - a).norm();
        assert!(
            (length - 10.0).abs() < 0.1,
            "edge length {length} for line {:?} -> {:?}",
            line.a,
            line.b
        );
    }
}

/// Ten depth-varied locked points, one observation perturbed far off.
fn outlier_scenario() -> Project {
    let mut project = Project::new("outliers");

    let mut vp = Viewpoint::new("cam", 1920, 1080);
    vp.intrinsics.focal_length = 1500.0;
    vp.is_focal_locked = true;
    vp.position = Point3::new(0.0, 0.0, -20.0);
    let vp_id = project.add_viewpoint(vp);

    let points = [
        Point3::new(-5.0, -5.0, 0.0),
        Point3::new(5.0, -5.0, 0.0),
        Point3::new(5.0, 5.0, 0.0),
        Point3::new(-5.0, 5.0, 0.0),
        Point3::new(0.0, 0.0, 3.0),
        Point3::new(-3.0, 2.0, 6.0),
        Point3::new(3.0, -2.0, 6.0),
        Point3::new(2.0, 4.0, -4.0),
        Point3::new(-4.0, -2.0, -3.0),
        Point3::new(1.0, -3.0, 9.0),
    ];
    for (i, point) in points.iter().enumerate() {
        let wp = project.add_world_point(
            WorldPoint::new(format!("p{i}")).with_locked([point.x, point.y, point.z]),
        );
        observe(&mut project, vp_id, wp, point);
    }

    // sabotage the last observation
    let last = project.image_points.ids().last().unwrap();
    let ip = project.image_points.get_mut(last).unwrap();
    ip.uv = Point2::new(ip.uv.x + 500.0, ip.uv.y);

    // forget the pose
    let (cam, _) = project.viewpoint_by_name("cam").unwrap();
    let vp = project.viewpoints.get_mut(cam).unwrap();
    vp.position = Point3::origin();
    vp.rotation = UnitQuaternion::identity();

    project
}

#[test]
fn outlier_rejection_recovers_clean_solution() {
    let mut project = outlier_scenario();
    let observations_before = project.image_points.len();
    let result = optimize(&mut project, &default_options(), &mut NullHost);

    assert_eq!(result.error, None);
    assert_eq!(result.outliers.len(), 1, "outliers: {:?}", result.outliers);
    assert_eq!(result.outliers[0].world_point_name, "p9");
    assert_eq!(result.outliers[0].viewpoint_name, "cam");
    assert!(result.outliers[0].error > 100.0);

    assert_eq!(project.image_points.len(), observations_before - 1);
    assert!(result.median_reprojection_error.unwrap() < 1.0);
}

#[test]
fn cancellation_preserves_best_intermediate_state() {
    /// Cancels once three iterations have been observed.
    struct CancelAfterThree {
        iterations_seen: std::cell::Cell<usize>,
    }
    impl SolveHost for CancelAfterThree {
        fn on_iteration(&mut self, report: &scene_adj::IterationReport) {
            self.iterations_seen.set(report.iteration);
        }
        fn should_cancel(&self) -> bool {
            self.iterations_seen.get() >= 3
        }
    }

    // noisy observations keep the solver busy past three iterations
    let mut project = cube_scenario();
    let mut noise_rng = rand::rngs::StdRng::seed_from_u64(7);
    let noise = Normal::new(0.0, 3.0).unwrap();
    let ids: Vec<_> = project.image_points.ids().collect();
    for id in ids {
        let ip = project.image_points.get_mut(id).unwrap();
        ip.uv = Point2::new(
            ip.uv.x + noise.sample(&mut noise_rng),
            ip.uv.y + noise.sample(&mut noise_rng),
        );
    }

    let options = OptimizeOptions {
        tolerance: 1e-14,
        max_attempts: 1,
        detect_outliers: false,
        ..default_options()
    };
    let mut host = CancelAfterThree {
        iterations_seen: std::cell::Cell::new(0),
    };
    let result: OptimizeResult = optimize(&mut project, &options, &mut host);

    assert_eq!(result.error.as_deref(), Some("cancelled"));
    assert!(result.iterations <= 4, "iterations {}", result.iterations);
    // the best accepted state was written back
    for (_, vp) in project.viewpoints.iter() {
        assert!((vp.rotation.quaternion().norm() - 1.0).abs() < 1e-6);
    }
}

#[test]
fn reprojection_round_trip_matches_reported_residuals() {
    let (mut project, _, _) = pnp_scenario();
    let result = optimize(&mut project, &default_options(), &mut NullHost);
    assert_eq!(result.error, None);

    for (_, ip) in project.image_points.iter() {
        let vp = project.viewpoints.get(ip.viewpoint).unwrap();
        let point = project.world_points.get(ip.world_point).unwrap();
        let camera = Camera::from_viewpoint(vp);
        let predicted = camera
            .project(&point.effective_xyz().unwrap())
            .pixel()
            .unwrap();
        let reported = ip.last_residuals.unwrap();
        let actual = [predicted.x - ip.uv.x, predicted.y - ip.uv.y];
        assert!((actual[0] - reported[0]).abs() < 1e-9);
        assert!((actual[1] - reported[1]).abs() < 1e-9);
    }
}
