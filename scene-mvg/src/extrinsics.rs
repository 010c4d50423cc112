use nalgebra::{DMatrix, DVector, Matrix3, Point2, Point3, UnitQuaternion, Vector3};

use scene_types::Intrinsics;

use crate::{MvgError, Result};

/// World-to-camera rotation that looks from `eye` toward `target` with
/// +y of the camera along `up` (projected). Test and host helper.
pub fn look_at(eye: &Point3<f64>, target: &Point3<f64>, up: &Vector3<f64>) -> UnitQuaternion<f64> {
    let forward = (target - eye).normalize();
    let right = up.cross(&forward).normalize();
    let true_up = forward.cross(&right);
    // rows are the camera axes expressed in world coordinates
    let m = Matrix3::from_rows(&[
        right.transpose(),
        true_up.transpose(),
        forward.transpose(),
    ]);
    UnitQuaternion::from_rotation_matrix(&nalgebra::Rotation3::from_matrix_unchecked(m))
}

/// Recover the camera center from a known rotation, known intrinsics, and
/// at least two (world point, observed pixel) pairs.
///
/// Each observation gives two equations linear in the center `t`:
/// `(r1 − a_u·r3)·t = (r1 − a_u·r3)·p` with `a_u = (u − cx)/fx`, and the
/// matching row for `a_v = (cy − v)/fy`. Solved in the least-squares sense.
pub fn position_from_observations(
    rotation: &UnitQuaternion<f64>,
    intrinsics: &Intrinsics,
    observations: &[(Point3<f64>, Point2<f64>)],
) -> Result<Point3<f64>> {
    if observations.len() < 2 {
        return Err(MvgError::NotEnoughPoints);
    }
    let r = rotation.to_rotation_matrix().into_inner();
    let r1 = r.row(0).transpose();
    let r2 = r.row(1).transpose();
    let r3 = r.row(2).transpose();

    let mut a = DMatrix::<f64>::zeros(observations.len() * 2, 3);
    let mut b = DVector::<f64>::zeros(observations.len() * 2);
    for (i, (p, uv)) in observations.iter().enumerate() {
        let a_u = (uv.x - intrinsics.principal_point.x) / intrinsics.fx();
        let a_v = (intrinsics.principal_point.y - uv.y) / intrinsics.fy();
        let row_u: Vector3<f64> = r1 - r3 * a_u;
        let row_v: Vector3<f64> = r2 - r3 * a_v;
        for k in 0..3 {
            a[(2 * i, k)] = row_u[k];
            a[(2 * i + 1, k)] = row_v[k];
        }
        b[2 * i] = row_u.dot(&p.coords);
        b[2 * i + 1] = row_v.dot(&p.coords);
    }

    let svd = a.svd(true, true);
    let max_sv = svd.singular_values.max();
    if svd.singular_values.iter().any(|&s| s < 1e-10 * max_sv) {
        return Err(MvgError::RankDeficient);
    }
    let t = svd.solve(&b, 1e-12).map_err(|_| MvgError::SvdFailed)?;
    Ok(Point3::new(t[0], t[1], t[2]))
}
