use nalgebra::DVector;

use scene_types::Project;

use crate::layout::VariableLayout;

mod constraint;
mod line;
mod reprojection;

pub use constraint::{
    AngleProvider, CollinearProvider, CoplanarProvider, DistanceProvider, EqualAnglesProvider,
    EqualDistancesProvider, FixedPointProvider, ParallelLinesProvider, PerpendicularLinesProvider,
};
pub use line::{LineDirectionProvider, LineLengthProvider};
pub use reprojection::ReprojectionProvider;

/// Weight applied to geometric (world-unit) residuals so they compete
/// with pixel-unit reprojection rows.
pub const GEOMETRY_WEIGHT: f64 = 100.0;

/// Weight of the quaternion unit-norm residual.
pub const QUATERNION_UNIT_WEIGHT: f64 = 1000.0;

/// One source of residual rows and their sparse Jacobian entries.
///
/// Providers are evaluated in a fixed order; each contributes
/// `residual_count` consecutive rows. Jacobian entries are emitted as
/// `(row, col, value)` triples relative to `row_base`. Implementations
/// must stay finite: degenerate configurations emit bounded penalty
/// values and zero Jacobian rows instead of NaN.
pub trait ResidualProvider {
    fn name(&self) -> &'static str;
    fn residual_count(&self) -> usize;
    /// Variable slots this provider reads.
    fn slots(&self) -> Vec<usize>;
    /// Append `residual_count` rows to `out`.
    fn compute_residuals(&self, x: &DVector<f64>, out: &mut Vec<f64>);
    /// Emit Jacobian triples for this provider's rows.
    fn compute_jacobian(
        &self,
        x: &DVector<f64>,
        row_base: usize,
        triples: &mut Vec<(usize, usize, f64)>,
    );
}

/// Assemble every provider for a project, in deterministic order:
/// reprojection rows per image point, then line residuals, then
/// constraint residuals, then one unit-norm row per free camera.
pub fn build_providers(
    project: &Project,
    layout: &VariableLayout,
) -> Vec<Box<dyn ResidualProvider>> {
    let mut providers: Vec<Box<dyn ResidualProvider>> = Vec::new();

    for (ip_id, ip) in project.image_points.iter() {
        let Some(vp) = project.viewpoints.get(ip.viewpoint) else {
            continue;
        };
        if !vp.enabled_in_solve {
            continue;
        }
        let camera = layout.camera_ref(ip.viewpoint).expect("camera ref").clone();
        let point = *layout.point_ref(ip.world_point).expect("point ref");
        providers.push(Box::new(ReprojectionProvider::new(
            ip_id, ip.uv, camera, point,
        )));
    }

    for (_, l) in project.lines.iter() {
        let a = *layout.point_ref(l.a).expect("line endpoint");
        let b = *layout.point_ref(l.b).expect("line endpoint");
        if let Some(target) = l.target_length {
            providers.push(Box::new(LineLengthProvider::new(a, b, target, l.weight())));
        }
        if let Some(provider) = LineDirectionProvider::for_line(l, a, b) {
            providers.push(Box::new(provider));
        }
    }

    for (_, c) in project.constraints.iter() {
        build_constraint_providers(project, layout, c, &mut providers);
    }

    for cam in layout.free_cameras() {
        providers.push(Box::new(constraint::QuaternionUnitProvider::new(
            cam.slots.quaternion.expect("free camera"),
        )));
    }

    providers
}

fn build_constraint_providers(
    project: &Project,
    layout: &VariableLayout,
    constraint: &scene_types::Constraint,
    providers: &mut Vec<Box<dyn ResidualProvider>>,
) {
    use scene_types::Constraint as C;
    let point = |id| *layout.point_ref(id).expect("constraint point");
    let line_ends = |id| {
        let l = project.lines.get(id).expect("constraint line");
        (point(l.a), point(l.b))
    };
    match constraint {
        C::Distance { a, b, target } => {
            providers.push(Box::new(DistanceProvider::new(point(*a), point(*b), *target)));
        }
        C::Angle {
            a,
            vertex,
            c,
            target_degrees,
        } => {
            providers.push(Box::new(AngleProvider::new(
                point(*a),
                point(*vertex),
                point(*c),
                target_degrees.to_radians(),
            )));
        }
        C::ParallelLines { a, b } => {
            let (a1, a2) = line_ends(*a);
            let (b1, b2) = line_ends(*b);
            providers.push(Box::new(ParallelLinesProvider::new(a1, a2, b1, b2)));
        }
        C::PerpendicularLines { a, b } => {
            let (a1, a2) = line_ends(*a);
            let (b1, b2) = line_ends(*b);
            providers.push(Box::new(PerpendicularLinesProvider::new(a1, a2, b1, b2)));
        }
        C::FixedPoint { point: p, target } => {
            providers.push(Box::new(FixedPointProvider::new(point(*p), *target)));
        }
        C::CollinearPoints { points } => {
            if points.len() >= 3 {
                let refs = points.iter().map(|&p| point(p)).collect();
                providers.push(Box::new(CollinearProvider::new(refs)));
            }
        }
        C::EqualDistances { pairs } => {
            if pairs.len() >= 2 {
                let refs = pairs.iter().map(|&(a, b)| (point(a), point(b))).collect();
                providers.push(Box::new(EqualDistancesProvider::new(refs)));
            }
        }
        C::EqualAngles { triplets } => {
            if triplets.len() >= 2 {
                let refs = triplets
                    .iter()
                    .map(|&(a, v, c)| (point(a), point(v), point(c)))
                    .collect();
                providers.push(Box::new(EqualAnglesProvider::new(refs)));
            }
        }
        C::CoplanarPoints { points } => {
            if points.len() >= 4 {
                let refs = points.iter().map(|&p| point(p)).collect();
                providers.push(Box::new(CoplanarProvider::new(refs)));
            }
        }
    }
}

/// Total residual rows across `providers`.
pub fn total_rows(providers: &[Box<dyn ResidualProvider>]) -> usize {
    providers.iter().map(|p| p.residual_count()).sum()
}

/// Evaluate the full residual vector.
pub fn assemble_residuals(
    providers: &[Box<dyn ResidualProvider>],
    x: &DVector<f64>,
) -> Vec<f64> {
    let mut out = Vec::with_capacity(total_rows(providers));
    for provider in providers {
        let before = out.len();
        provider.compute_residuals(x, &mut out);
        debug_assert_eq!(out.len() - before, provider.residual_count());
    }
    out
}

/// Evaluate the sparse Jacobian as `(row, col, value)` triples, rows
/// matching [`assemble_residuals`] ordering.
pub fn assemble_jacobian(
    providers: &[Box<dyn ResidualProvider>],
    x: &DVector<f64>,
) -> Vec<(usize, usize, f64)> {
    let mut triples = Vec::new();
    let mut row_base = 0;
    for provider in providers {
        provider.compute_jacobian(x, row_base, &mut triples);
        row_base += provider.residual_count();
    }
    triples
}
