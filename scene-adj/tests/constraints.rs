//! End-to-end solves driven by geometric constraints: each test builds a
//! small scene where one constraint kind must shape the result.

use nalgebra::{Point3, UnitQuaternion, Vector3};

use scene_adj::{optimize, NullHost, OptimizeOptions};
use scene_mvg::{extrinsics::look_at, Camera};
use scene_types::{
    Constraint, ImagePoint, Line, Project, Viewpoint, ViewpointId, WorldPoint, WorldPointId,
};

/// A camera pair around a small scene, with observations of every ground
/// truth point; points are free unless listed in `locked`.
struct SceneBuilder {
    project: Project,
    cameras: Vec<ViewpointId>,
    points: Vec<(WorldPointId, Point3<f64>)>,
}

impl SceneBuilder {
    fn new(truth: &[Point3<f64>], locked: &[usize]) -> Self {
        let mut project = Project::new("constraint-scene");
        let mut cameras = Vec::new();
        for (name, position) in [
            ("cam1", Point3::new(20.0, 12.0, -25.0)),
            ("cam2", Point3::new(-18.0, 8.0, -22.0)),
        ] {
            let mut vp = Viewpoint::new(name, 1920, 1080);
            vp.intrinsics.focal_length = 1500.0;
            vp.is_focal_locked = true;
            vp.position = position;
            vp.rotation = look_at(&position, &Point3::new(0.0, 0.0, 2.0), &Vector3::y());
            cameras.push(project.add_viewpoint(vp));
        }

        let mut points = Vec::new();
        for (i, p) in truth.iter().enumerate() {
            let mut wp = WorldPoint::new(format!("p{i}"));
            if locked.contains(&i) {
                wp = wp.with_locked([p.x, p.y, p.z]);
            }
            let id = project.add_world_point(wp);
            points.push((id, *p));
        }

        for &cam in &cameras {
            let camera = Camera::from_viewpoint(project.viewpoints.get(cam).unwrap());
            for &(id, p) in &points {
                let uv = camera.project(&p).pixel().expect("visible");
                project.add_image_point(ImagePoint::new(cam, id, uv));
            }
        }

        // forget camera poses
        for &cam in &cameras {
            let vp = project.viewpoints.get_mut(cam).unwrap();
            vp.position = Point3::origin();
            vp.rotation = UnitQuaternion::identity();
        }

        Self {
            project,
            cameras,
            points,
        }
    }

    fn id(&self, index: usize) -> WorldPointId {
        self.points[index].0
    }

    fn solved_position(&self, index: usize) -> Point3<f64> {
        self.project
            .world_points
            .get(self.id(index))
            .unwrap()
            .effective_xyz()
            .unwrap()
    }
}

fn solve(project: &mut Project) -> scene_adj::OptimizeResult {
    let result = optimize(project, &OptimizeOptions::default(), &mut NullHost);
    assert_eq!(result.error, None, "solve failed: {:?}", result.error);
    result
}

#[test]
fn distance_constraint_shapes_free_points() {
    // observations alone would reconstruct the truth; a conflicting
    // distance target must pull the pair apart
    let truth = [
        Point3::new(0.0, 0.0, 0.0),
        Point3::new(4.0, 0.0, 0.0),
        Point3::new(0.0, 4.0, 0.0),
        Point3::new(0.0, 0.0, 4.0),
        Point3::new(4.0, 4.0, 1.0),
    ];
    let mut scene = SceneBuilder::new(&truth, &[0, 1, 2, 3]);
    let a = scene.id(0);
    let b = scene.id(4);
    scene.project.add_constraint(Constraint::Distance {
        a,
        b,
        target: 6.0,
    });

    solve(&mut scene.project);

    let pa = scene.solved_position(0);
    let pb = scene.solved_position(4);
    let observed_distance = (truth[4] - truth[0]).norm();
    let solved_distance = (pb - pa).norm();
    // the result lands between the observed geometry and the target
    assert!(
        solved_distance > observed_distance,
        "distance did not move: {solved_distance}"
    );
}

#[test]
fn fixed_point_constraint_pins_a_free_point() {
    let truth = [
        Point3::new(0.0, 0.0, 0.0),
        Point3::new(5.0, 0.0, 0.0),
        Point3::new(0.0, 5.0, 0.0),
        Point3::new(2.0, 2.0, 3.0),
    ];
    let mut scene = SceneBuilder::new(&truth, &[0, 1, 2]);
    let target = [2.0, 2.0, 3.0];
    scene.project.add_constraint(Constraint::FixedPoint {
        point: scene.id(3),
        target,
    });

    solve(&mut scene.project);
    let p = scene.solved_position(3);
    assert!((p - Point3::from(target)).norm() < 1e-3, "pinned point at {p}");
}

#[test]
fn perpendicular_and_parallel_line_constraints_hold_at_truth() {
    // truth geometry already satisfies both constraints; solving must
    // keep them satisfied and converge
    let truth = [
        Point3::new(0.0, 0.0, 0.0),
        Point3::new(6.0, 0.0, 0.0),
        Point3::new(0.0, 6.0, 0.0),
        Point3::new(6.0, 6.0, 0.0),
        Point3::new(0.0, 0.0, 5.0),
        Point3::new(6.0, 0.0, 5.0),
    ];
    let mut scene = SceneBuilder::new(&truth, &[0, 1, 2]);
    let bottom = scene.project.add_line(Line::new(scene.id(0), scene.id(1)));
    let left = scene.project.add_line(Line::new(scene.id(0), scene.id(2)));
    let top = scene.project.add_line(Line::new(scene.id(2), scene.id(3)));
    let back = scene.project.add_line(Line::new(scene.id(4), scene.id(5)));

    scene
        .project
        .add_constraint(Constraint::PerpendicularLines { a: bottom, b: left });
    scene
        .project
        .add_constraint(Constraint::ParallelLines { a: bottom, b: top });
    scene
        .project
        .add_constraint(Constraint::ParallelLines { a: bottom, b: back });

    let result = solve(&mut scene.project);
    assert!(result.converged);

    let d_bottom = (scene.solved_position(1) - scene.solved_position(0)).normalize();
    let d_left = (scene.solved_position(2) - scene.solved_position(0)).normalize();
    let d_top = (scene.solved_position(3) - scene.solved_position(2)).normalize();
    assert!(d_bottom.dot(&d_left).abs() < 1e-3);
    assert!(d_bottom.cross(&d_top).norm() < 1e-3);
}

#[test]
fn collinear_constraint_straightens_a_chain() {
    let truth = [
        Point3::new(0.0, 0.0, 0.0),
        Point3::new(8.0, 0.0, 0.0),
        Point3::new(4.0, 0.0, 0.0),
        Point3::new(0.0, 5.0, 0.0),
        Point3::new(0.0, 0.0, 5.0),
    ];
    let mut scene = SceneBuilder::new(&truth, &[0, 1, 3, 4]);
    scene.project.add_constraint(Constraint::CollinearPoints {
        points: vec![scene.id(0), scene.id(2), scene.id(1)],
    });

    let result = solve(&mut scene.project);
    assert!(result.converged);

    let p0 = scene.solved_position(0);
    let p1 = scene.solved_position(1);
    let mid = scene.solved_position(2);
    let dir = (p1 - p0).normalize();
    let offset = (mid - p0) - dir * (mid - p0).dot(&dir);
    assert!(offset.norm() < 1e-3, "off-line offset {}", offset.norm());
}

#[test]
fn coplanar_constraint_flattens_a_point_set() {
    let truth = [
        Point3::new(0.0, 0.0, 0.0),
        Point3::new(6.0, 0.0, 0.0),
        Point3::new(0.0, 6.0, 0.0),
        Point3::new(6.0, 6.0, 0.0),
        Point3::new(3.0, 3.0, 0.0),
        Point3::new(0.0, 0.0, 6.0),
    ];
    let mut scene = SceneBuilder::new(&truth, &[0, 1, 2, 5]);
    scene.project.add_constraint(Constraint::CoplanarPoints {
        points: vec![
            scene.id(0),
            scene.id(1),
            scene.id(2),
            scene.id(3),
            scene.id(4),
        ],
    });

    let result = solve(&mut scene.project);
    assert!(result.converged);

    // all five members lie on z = 0 at the truth; the free members must
    // stay in that plane
    for index in [3, 4] {
        let p = scene.solved_position(index);
        assert!(p.z.abs() < 1e-2, "point {index} off plane: {}", p.z);
    }
}

#[test]
fn equal_distances_equalize_two_spans() {
    let truth = [
        Point3::new(0.0, 0.0, 0.0),
        Point3::new(5.0, 0.0, 0.0),
        Point3::new(0.0, 5.0, 0.0),
        Point3::new(0.0, 0.0, 5.0),
        // |p0 p4| = 5 matches the reference span exactly
        Point3::new(3.0, 4.0, 0.0),
    ];
    let mut scene = SceneBuilder::new(&truth, &[0, 1, 2, 3]);
    scene.project.add_constraint(Constraint::EqualDistances {
        pairs: vec![(scene.id(0), scene.id(1)), (scene.id(0), scene.id(4))],
    });

    let result = solve(&mut scene.project);
    assert!(result.converged);

    let reference = (scene.solved_position(1) - scene.solved_position(0)).norm();
    let other = (scene.solved_position(4) - scene.solved_position(0)).norm();
    assert!(
        (reference - other).abs() < 0.05,
        "distances differ: {reference} vs {other}"
    );
}

#[test]
fn angle_constraint_holds_at_right_angle() {
    let truth = [
        Point3::new(0.0, 0.0, 0.0),
        Point3::new(6.0, 0.0, 0.0),
        Point3::new(0.0, 6.0, 0.0),
        Point3::new(0.0, 0.0, 6.0),
        Point3::new(3.0, 3.0, 3.0),
    ];
    let mut scene = SceneBuilder::new(&truth, &[0, 1, 3]);
    scene.project.add_constraint(Constraint::Angle {
        a: scene.id(1),
        vertex: scene.id(0),
        c: scene.id(2),
        target_degrees: 90.0,
    });

    let result = solve(&mut scene.project);
    assert!(result.converged);

    let u = (scene.solved_position(1) - scene.solved_position(0)).normalize();
    let v = (scene.solved_position(2) - scene.solved_position(0)).normalize();
    let angle = u.dot(&v).clamp(-1.0, 1.0).acos().to_degrees();
    assert!((angle - 90.0).abs() < 0.5, "angle {angle}");
}

#[test]
fn line_length_tolerance_weights_the_pull() {
    // two lines with the same wrong target; the tighter tolerance must be
    // matched more closely
    let truth = [
        Point3::new(0.0, 0.0, 0.0),
        Point3::new(4.0, 0.0, 0.0),
        Point3::new(0.0, 4.0, 0.0),
        Point3::new(0.0, 0.0, 4.0),
        Point3::new(4.0, 4.0, 0.0),
        Point3::new(0.0, 4.0, 4.0),
    ];
    let mut scene = SceneBuilder::new(&truth, &[0, 1, 2, 3]);
    let mut tight = Line::new(scene.id(2), scene.id(4)).with_target_length(7.0);
    tight.tolerance = Some(0.01);
    let mut loose = Line::new(scene.id(3), scene.id(5)).with_target_length(7.0);
    loose.tolerance = Some(10.0);
    scene.project.add_line(tight);
    scene.project.add_line(loose);

    solve(&mut scene.project);

    let tight_length = (scene.solved_position(4) - scene.solved_position(2)).norm();
    let loose_length = (scene.solved_position(5) - scene.solved_position(3)).norm();
    let tight_miss = (tight_length - 7.0).abs();
    let loose_miss = (loose_length - 7.0).abs();
    assert!(
        tight_miss < loose_miss,
        "tight miss {tight_miss} vs loose miss {loose_miss}"
    );
}

#[test]
fn solver_reports_reprojection_statistics() {
    let truth = [
        Point3::new(0.0, 0.0, 0.0),
        Point3::new(5.0, 0.0, 0.0),
        Point3::new(0.0, 5.0, 0.0),
        Point3::new(0.0, 0.0, 5.0),
    ];
    let mut scene = SceneBuilder::new(&truth, &[0, 1, 2, 3]);
    let result = solve(&mut scene.project);

    assert!(result.median_reprojection_error.unwrap() < 0.5);
    assert!(result.rms_reprojection_error.unwrap() < 0.5);
    for (_, point) in scene.project.world_points.iter() {
        let info = point.optimization_info();
        assert!(info.rms_residual.unwrap() < 1.0);
    }
    for (_, ip) in scene.project.image_points.iter() {
        assert!(ip.last_residuals.is_some());
    }
}

#[test]
fn verbose_mode_logs_through_the_host() {
    struct CollectLog {
        lines: Vec<String>,
    }
    impl scene_adj::SolveHost for CollectLog {
        fn log(&mut self, message: &str) {
            self.lines.push(message.to_string());
        }
    }

    let truth = [
        Point3::new(0.0, 0.0, 0.0),
        Point3::new(5.0, 0.0, 0.0),
        Point3::new(0.0, 5.0, 0.0),
        Point3::new(0.0, 0.0, 5.0),
    ];
    let mut scene = SceneBuilder::new(&truth, &[0, 1, 2, 3]);
    let options = OptimizeOptions {
        verbose: true,
        ..OptimizeOptions::default()
    };
    let mut host = CollectLog { lines: Vec::new() };
    let result = optimize(&mut scene.project, &options, &mut host);
    assert_eq!(result.error, None);
    assert!(
        host.lines.iter().any(|l| l.starts_with("attempt 1")),
        "log lines: {:?}",
        host.lines
    );
}

#[test]
fn disabled_viewpoints_stay_out_of_the_solve() {
    let truth = [
        Point3::new(0.0, 0.0, 0.0),
        Point3::new(5.0, 0.0, 0.0),
        Point3::new(0.0, 5.0, 0.0),
        Point3::new(0.0, 0.0, 5.0),
    ];
    let mut scene = SceneBuilder::new(&truth, &[0, 1, 2, 3]);
    let disabled = scene.cameras[1];
    {
        let vp = scene.project.viewpoints.get_mut(disabled).unwrap();
        vp.enabled_in_solve = false;
        // a deliberately absurd pose that must survive untouched
        vp.position = Point3::new(999.0, 999.0, 999.0);
    }

    let result = solve(&mut scene.project);
    assert!(result.converged);
    let vp = scene.project.viewpoints.get(disabled).unwrap();
    assert_eq!(vp.position, Point3::new(999.0, 999.0, 999.0));
}
