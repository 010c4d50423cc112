//! Reconstruct a wireframe cube from two synthetic photographs.
//!
//! Builds a project with eight world points, twelve axis-aligned edges of
//! known length, one locked corner, and two viewpoints, then runs the
//! full optimization pipeline and prints the result.

use nalgebra::{Point3, UnitQuaternion, Vector3};

use scene_adj::{optimize, IterationReport, OptimizeOptions, SolveHost};
use scene_mvg::{extrinsics::look_at, Camera};
use scene_types::{ImagePoint, Line, LineDirection, Project, Viewpoint, WorldPoint};

struct PrintHost;

impl SolveHost for PrintHost {
    fn on_iteration(&mut self, report: &IterationReport) {
        println!(
            "  iteration {:3}  residual {:12.6e}  lambda {:8.2e}",
            report.iteration, report.residual, report.lambda
        );
    }
    fn log(&mut self, message: &str) {
        println!("{message}");
    }
}

fn main() {
    let mut project = Project::new("cube demo");

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
    let mut ids = Vec::new();
    for (i, corner) in corners.iter().enumerate() {
        let mut wp = WorldPoint::new(format!("corner-{i}"));
        if i == 0 {
            wp = wp.with_locked([corner.x, corner.y, corner.z]);
        }
        ids.push(project.add_world_point(wp));
    }

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
            Line::new(ids[a], ids[b])
                .with_direction(direction)
                .with_target_length(10.0),
        );
    }

    for (name, position) in [
        ("front-left", Point3::new(35.0, 18.0, -30.0)),
        ("front-right", Point3::new(-20.0, 22.0, -32.0)),
    ] {
        let mut vp = Viewpoint::new(name, 1920, 1080);
        vp.intrinsics.focal_length = 1500.0;
        vp.is_focal_locked = true;
        vp.position = position;
        vp.rotation = look_at(&position, &Point3::new(5.0, 5.0, 5.0), &Vector3::y());
        let vp_id = project.add_viewpoint(vp);

        // synthesize hand-clicked observations from the ground truth pose
        let camera = Camera::from_viewpoint(project.viewpoints.get(vp_id).unwrap());
        for (id, corner) in ids.iter().zip(&corners) {
            if let Some(uv) = camera.project(corner).pixel() {
                project.add_image_point(ImagePoint::new(vp_id, *id, uv));
            }
        }

        // forget the pose again; the solver has to find it
        let vp = project.viewpoints.get_mut(vp_id).unwrap();
        vp.position = Point3::origin();
        vp.rotation = UnitQuaternion::identity();
    }

    let options = OptimizeOptions {
        verbose: true,
        ..OptimizeOptions::default()
    };
    let result = optimize(&mut project, &options, &mut PrintHost);

    println!();
    println!("converged:  {}", result.converged);
    println!("iterations: {}", result.iterations);
    println!("residual:   {:.6e}", result.residual);
    if let Some(median) = result.median_reprojection_error {
        println!("median reprojection error: {median:.4} px");
    }
    for (_, vp) in project.viewpoints.iter() {
        println!(
            "{}: position ({:7.3}, {:7.3}, {:7.3})",
            vp.name, vp.position.x, vp.position.y, vp.position.z
        );
    }
    for (_, point) in project.world_points.iter() {
        if let Some(xyz) = point.effective_xyz() {
            println!(
                "{}: ({:7.3}, {:7.3}, {:7.3})",
                point.name, xyz.x, xyz.y, xyz.z
            );
        }
    }
}
