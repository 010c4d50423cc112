use nalgebra::{Matrix3, Point3, Vector3};

use crate::{MvgError, Result};

/// Midpoint triangulation of two rays.
///
/// Finds the closest points on each ray and returns their midpoint.
pub fn midpoint(
    o1: &Point3<f64>,
    d1: &Vector3<f64>,
    o2: &Point3<f64>,
    d2: &Vector3<f64>,
) -> Result<Point3<f64>> {
    let d1 = d1.normalize();
    let d2 = d2.normalize();
    let r = o2 - o1;

    let a = d1.dot(&d2);
    let denom = 1.0 - a * a;
    if denom < 1e-12 {
        return Err(MvgError::DegenerateRays);
    }
    let b1 = d1.dot(&r);
    let b2 = d2.dot(&r);
    let s = (b1 - a * b2) / denom;
    let t = (a * b1 - b2) / denom;

    let p1 = o1 + d1 * s;
    let p2 = o2 + d2 * t;
    Ok(Point3::from((p1.coords + p2.coords) * 0.5))
}

/// Least-squares intersection of two or more rays.
///
/// Minimizes the summed squared perpendicular distance to every ray by
/// solving `Σ (I − d·dᵀ)·x = Σ (I − d·dᵀ)·o`.
pub fn rays_intersection(rays: &[(Point3<f64>, Vector3<f64>)]) -> Result<Point3<f64>> {
    if rays.len() < 2 {
        return Err(MvgError::NotEnoughPoints);
    }
    let mut lhs = Matrix3::<f64>::zeros();
    let mut rhs = Vector3::<f64>::zeros();
    for (origin, dir) in rays {
        let d = dir.normalize();
        let m = Matrix3::identity() - d * d.transpose();
        lhs += m;
        rhs += m * origin.coords;
    }
    let solved = lhs
        .lu()
        .solve(&rhs)
        .ok_or(MvgError::DegenerateRays)?;
    Ok(Point3::from(solved))
}
