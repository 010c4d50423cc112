use nalgebra::{Matrix3xX, Matrix4, Point2, Point3, UnitQuaternion, Vector3};

use scene_types::Intrinsics;

use crate::align_points::align_points;
use crate::camera::Camera;
use crate::{MvgError, Result};

/// Camera pose recovered by resectioning.
#[derive(Debug, Clone, PartialEq)]
pub struct PnpSolution {
    pub rotation: UnitQuaternion<f64>,
    pub position: Point3<f64>,
    /// Mean reprojection distance over the input observations.
    pub mean_reprojection_error: f64,
}

/// Recover a camera pose from at least three known world points and their
/// pixel observations (perspective-3-point resectioning).
///
/// Solves Grunert's three-point equations for the first non-degenerate
/// point triple, disambiguates the up-to-four pose candidates by
/// reprojection error over all observations, and rejects the result as
/// unreliable when more than half the points land behind the camera.
pub fn resect_camera(
    intrinsics: &Intrinsics,
    observations: &[(Point3<f64>, Point2<f64>)],
) -> Result<PnpSolution> {
    if observations.len() < 3 {
        return Err(MvgError::NotEnoughPoints);
    }

    let bearings: Vec<Vector3<f64>> = observations
        .iter()
        .map(|(_, uv)| bearing(intrinsics, uv))
        .collect();

    let mut best: Option<PnpSolution> = None;
    'triples: for (i, j, k) in triples(observations.len()) {
        let world = [observations[i].0, observations[j].0, observations[k].0];
        if triangle_area(&world) < 1e-9 {
            continue;
        }
        let rays = [bearings[i], bearings[j], bearings[k]];
        let distances = match p3p_distances(&world, &rays) {
            Ok(d) => d,
            Err(_) => continue,
        };

        for [s1, s2, s3] in distances {
            let cam_pts = [rays[0] * s1, rays[1] * s2, rays[2] * s3];
            let Ok(pose) = pose_from_point_pairs(&world, &cam_pts) else {
                continue;
            };
            let error = mean_reprojection(intrinsics, &pose, observations);
            if best
                .as_ref()
                .map(|b| error < b.mean_reprojection_error)
                .unwrap_or(true)
            {
                best = Some(PnpSolution {
                    rotation: pose.0,
                    position: pose.1,
                    mean_reprojection_error: error,
                });
            }
        }

        // one well-conditioned triple is enough
        if best.is_some() {
            break 'triples;
        }
    }

    let solution = best.ok_or(MvgError::NoValidRootFound)?;
    tracing::debug!(
        mean_error = solution.mean_reprojection_error,
        "resection candidate selected"
    );

    let camera = Camera::new(
        intrinsics.clone(),
        solution.position,
        solution.rotation,
        false,
    );
    let behind = observations
        .iter()
        .filter(|(p, _)| camera.project(p).pixel().is_none())
        .count();
    if behind * 2 > observations.len() {
        return Err(MvgError::UnreliablePose(
            "more than half the points are behind the camera",
        ));
    }
    Ok(solution)
}

/// Unit ray through a pixel in camera coordinates.
fn bearing(intrinsics: &Intrinsics, uv: &Point2<f64>) -> Vector3<f64> {
    let y = (intrinsics.principal_point.y - uv.y) / intrinsics.fy();
    let x = (uv.x - intrinsics.principal_point.x - intrinsics.skew * y) / intrinsics.fx();
    Vector3::new(x, y, 1.0).normalize()
}

/// Point-triple enumeration in deterministic lexicographic order.
fn triples(n: usize) -> impl Iterator<Item = (usize, usize, usize)> {
    (0..n).flat_map(move |i| {
        (i + 1..n).flat_map(move |j| (j + 1..n).map(move |k| (i, j, k)))
    })
}

fn triangle_area(p: &[Point3<f64>; 3]) -> f64 {
    (p[1] - p[0]).cross(&(p[2] - p[0])).norm() * 0.5
}

/// Grunert's solution of the three-point resection: camera-to-point
/// distances `[s1, s2, s3]` for every admissible root.
///
/// With side lengths `a = |P2P3|`, `b = |P1P3|`, `c = |P1P2|` and ray
/// angles `cos α/β/γ` opposite them, substituting `s2 = u·s1`,
/// `s3 = v·s1` into the law-of-cosines system eliminates `u` through
/// `u = N(v)/D(v)` and leaves a quartic in `v`, assembled here by
/// polynomial arithmetic rather than expanded coefficients.
fn p3p_distances(
    world: &[Point3<f64>; 3],
    rays: &[Vector3<f64>; 3],
) -> Result<Vec<[f64; 3]>> {
    let a2 = (world[1] - world[2]).norm_squared();
    let b2 = (world[0] - world[2]).norm_squared();
    let c2 = (world[0] - world[1]).norm_squared();
    if a2 < 1e-18 || b2 < 1e-18 || c2 < 1e-18 {
        return Err(MvgError::NotEnoughPoints);
    }
    let cos_alpha = rays[1].dot(&rays[2]);
    let cos_beta = rays[0].dot(&rays[2]);
    let cos_gamma = rays[0].dot(&rays[1]);

    let big_a = (a2 - c2) / b2;
    let k = c2 / b2;

    // u = N(v)/D(v); coefficients ascending in v
    let n_poly = [big_a + 1.0, -2.0 * big_a * cos_beta, big_a - 1.0];
    let d_poly = [2.0 * cos_gamma, -2.0 * cos_alpha];
    // 1 + v² − 2v·cosβ scaled into the c²/b² equation
    let e_poly = [1.0 - k, 2.0 * k * cos_beta, -k];

    let nn = poly_mul(&n_poly, &n_poly);
    let nd = poly_mul(&n_poly, &d_poly);
    let dd = poly_mul(&d_poly, &d_poly);
    let dde = poly_mul(&dd, &e_poly);

    let mut quartic = [0.0f64; 5];
    for (i, q) in quartic.iter_mut().enumerate() {
        let mut value = 0.0;
        if i < nn.len() {
            value += nn[i];
        }
        if i < nd.len() {
            value -= 2.0 * cos_gamma * nd[i];
        }
        if i < dde.len() {
            value += dde[i];
        }
        *q = value;
    }

    let b_len = b2.sqrt();
    let a_len = a2.sqrt();
    let mut out = Vec::new();
    for v in real_roots(&quartic) {
        if v <= 0.0 {
            continue;
        }
        let denom = 2.0 * (cos_gamma - v * cos_alpha);
        if denom.abs() < 1e-12 {
            continue;
        }
        let u = ((big_a - 1.0) * v * v - 2.0 * big_a * cos_beta * v + big_a + 1.0) / denom;
        if u <= 0.0 {
            continue;
        }
        let s1_sq_denom = 1.0 + v * v - 2.0 * v * cos_beta;
        if s1_sq_denom <= 1e-15 {
            continue;
        }
        let s1 = b_len / s1_sq_denom.sqrt();
        let s2 = u * s1;
        let s3 = v * s1;

        // verify against the third law-of-cosines equation
        let a_check = (s2 * s2 + s3 * s3 - 2.0 * s2 * s3 * cos_alpha).sqrt();
        if (a_check - a_len).abs() > 1e-6 * a_len.max(1.0) {
            continue;
        }
        out.push([s1, s2, s3]);
    }
    if out.is_empty() {
        return Err(MvgError::NoValidRootFound);
    }
    Ok(out)
}

/// Ascending-coefficient polynomial product.
fn poly_mul(a: &[f64], b: &[f64]) -> Vec<f64> {
    let mut out = vec![0.0; a.len() + b.len() - 1];
    for (i, &ai) in a.iter().enumerate() {
        for (j, &bj) in b.iter().enumerate() {
            out[i + j] += ai * bj;
        }
    }
    out
}

/// Real roots of a polynomial with ascending coefficients (degree ≤ 4),
/// via eigenvalues of the companion matrix.
fn real_roots(coeffs: &[f64; 5]) -> Vec<f64> {
    // strip negligible leading coefficients
    let scale = coeffs.iter().fold(0.0f64, |m, c| m.max(c.abs()));
    if scale == 0.0 {
        return Vec::new();
    }
    let mut degree = 4;
    while degree > 0 && coeffs[degree].abs() < 1e-14 * scale {
        degree -= 1;
    }

    match degree {
        0 => Vec::new(),
        1 => vec![-coeffs[0] / coeffs[1]],
        2 => {
            let (a, b, c) = (coeffs[2], coeffs[1], coeffs[0]);
            let disc = b * b - 4.0 * a * c;
            if disc < 0.0 {
                Vec::new()
            } else {
                let sq = disc.sqrt();
                vec![(-b + sq) / (2.0 * a), (-b - sq) / (2.0 * a)]
            }
        }
        _ => {
            // companion matrix of the monic polynomial, padded to 4x4 for
            // the cubic case
            let lead = coeffs[degree];
            let mut companion = Matrix4::<f64>::zeros();
            for row in 1..degree {
                companion[(row, row - 1)] = 1.0;
            }
            for row in 0..degree {
                companion[(row, degree - 1)] = -coeffs[row] / lead;
            }
            if degree == 3 {
                // decouple the padding dimension with a far-away real root
                companion[(3, 3)] = 1e12;
            }
            let eigen = companion.complex_eigenvalues();
            let mut roots = Vec::new();
            for e in eigen.iter() {
                if e.im.abs() < 1e-8 * (1.0 + e.re.abs()) && e.re.abs() < 1e11 {
                    roots.push(e.re);
                }
            }
            roots
        }
    }
}

/// Rigid world-to-camera transform from three point pairs; returns the
/// rotation and the camera center.
fn pose_from_point_pairs(
    world: &[Point3<f64>; 3],
    cam: &[Vector3<f64>; 3],
) -> Result<(UnitQuaternion<f64>, Point3<f64>)> {
    let x = Matrix3xX::from_columns(&[world[0].coords, world[1].coords, world[2].coords]);
    let y = Matrix3xX::from_columns(&[cam[0], cam[1], cam[2]]);
    let sim = align_points(&x, &y, false)?;
    let rotation = UnitQuaternion::from_rotation_matrix(
        &nalgebra::Rotation3::from_matrix_unchecked(sim.rotation),
    );
    // c = R·p + t  ⇒  camera center = −Rᵀ·t
    let position = Point3::from(-(sim.rotation.transpose() * sim.translation));
    Ok((rotation, position))
}

fn mean_reprojection(
    intrinsics: &Intrinsics,
    pose: &(UnitQuaternion<f64>, Point3<f64>),
    observations: &[(Point3<f64>, Point2<f64>)],
) -> f64 {
    let camera = Camera::new(intrinsics.clone(), pose.1, pose.0, false);
    let mut total = 0.0;
    for (p, uv) in observations {
        total += camera
            .reprojection_distance(p, uv)
            .unwrap_or(crate::BEHIND_CAMERA_PENALTY);
    }
    total / observations.len() as f64
}
