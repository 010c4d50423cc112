use nalgebra::{DMatrix, Matrix3, Point3, Vector2, Vector3};

use crate::triangulate;
use crate::{MvgError, Result};

/// Relative pose between two calibrated views: `c2 = R·c1 + t` maps
/// camera-1 coordinates to camera-2 coordinates.
#[derive(Debug, Clone, PartialEq)]
pub struct RelativePose {
    pub rotation: Matrix3<f64>,
    pub translation: Vector3<f64>,
}

impl RelativePose {
    /// Center of camera 2 in camera-1 coordinates.
    pub fn camera2_center(&self) -> Point3<f64> {
        Point3::from(-(self.rotation.transpose() * self.translation))
    }
}

/// Estimate the essential matrix from normalized correspondences
/// (`x̂ = ((u − cx)/fx, (cy − v)/fy)` for each view) with the
/// Hartley-normalized eight-point algorithm, then project onto the
/// essential manifold (singular values `(1, 1, 0)`).
pub fn estimate_essential(pairs: &[(Vector2<f64>, Vector2<f64>)]) -> Result<Matrix3<f64>> {
    if pairs.len() < 8 {
        return Err(MvgError::NotEnoughPoints);
    }

    let t1 = conditioning_transform(pairs.iter().map(|(a, _)| *a));
    let t2 = conditioning_transform(pairs.iter().map(|(_, b)| *b));

    let mut a = DMatrix::<f64>::zeros(pairs.len(), 9);
    for (i, (x1, x2)) in pairs.iter().enumerate() {
        let p1 = t1 * Vector3::new(x1.x, x1.y, 1.0);
        let p2 = t2 * Vector3::new(x2.x, x2.y, 1.0);
        let row = [
            p2.x * p1.x,
            p2.x * p1.y,
            p2.x,
            p2.y * p1.x,
            p2.y * p1.y,
            p2.y,
            p1.x,
            p1.y,
            1.0,
        ];
        for (k, v) in row.iter().enumerate() {
            a[(i, k)] = *v;
        }
    }

    let svd = a.svd(false, true);
    let v_t = svd.v_t.ok_or(MvgError::SvdFailed)?;
    let e_vec = v_t.row(v_t.nrows() - 1);
    let e_conditioned = Matrix3::new(
        e_vec[0], e_vec[1], e_vec[2], //
        e_vec[3], e_vec[4], e_vec[5], //
        e_vec[6], e_vec[7], e_vec[8],
    );
    let e = t2.transpose() * e_conditioned * t1;

    // rank-2 projection
    let svd =
        nalgebra::linalg::SVD::try_new(e, true, true, 1e-12, 0).ok_or(MvgError::SvdFailed)?;
    let u = svd.u.ok_or(MvgError::SvdFailed)?;
    let v_t = svd.v_t.ok_or(MvgError::SvdFailed)?;
    Ok(u * Matrix3::from_diagonal(&Vector3::new(1.0, 1.0, 0.0)) * v_t)
}

/// Similarity transform centering the points on the origin with mean
/// distance √2 (Hartley conditioning).
fn conditioning_transform(points: impl Iterator<Item = Vector2<f64>> + Clone) -> Matrix3<f64> {
    let n = points.clone().count() as f64;
    let mean = points.clone().sum::<Vector2<f64>>() / n;
    let mean_dist = points.map(|p| (p - mean).norm()).sum::<f64>() / n;
    let scale = if mean_dist > 1e-12 {
        std::f64::consts::SQRT_2 / mean_dist
    } else {
        1.0
    };
    Matrix3::new(
        scale,
        0.0,
        -scale * mean.x, //
        0.0,
        scale,
        -scale * mean.y, //
        0.0,
        0.0,
        1.0,
    )
}

/// Decompose an essential matrix into the four `(R, t)` candidates and
/// select the one placing the majority of triangulated correspondences in
/// front of both cameras.
pub fn decompose_essential(
    e: &Matrix3<f64>,
    pairs: &[(Vector2<f64>, Vector2<f64>)],
) -> Result<RelativePose> {
    let svd =
        nalgebra::linalg::SVD::try_new(*e, true, true, 1e-12, 0).ok_or(MvgError::SvdFailed)?;
    let mut u = svd.u.ok_or(MvgError::SvdFailed)?;
    let mut v_t = svd.v_t.ok_or(MvgError::SvdFailed)?;
    if u.determinant() < 0.0 {
        u = -u;
    }
    if v_t.determinant() < 0.0 {
        v_t = -v_t;
    }

    let w = Matrix3::new(
        0.0, -1.0, 0.0, //
        1.0, 0.0, 0.0, //
        0.0, 0.0, 1.0,
    );
    let ra = u * w * v_t;
    let rb = u * w.transpose() * v_t;
    let t = u.column(2).into_owned();

    let candidates = [
        RelativePose {
            rotation: ra,
            translation: t,
        },
        RelativePose {
            rotation: ra,
            translation: -t,
        },
        RelativePose {
            rotation: rb,
            translation: t,
        },
        RelativePose {
            rotation: rb,
            translation: -t,
        },
    ];

    let mut best: Option<(usize, RelativePose)> = None;
    for candidate in candidates {
        let n_front = count_in_front(&candidate, pairs);
        match &best {
            Some((count, _)) if *count >= n_front => {}
            _ => best = Some((n_front, candidate.clone())),
        }
    }
    let (count, pose) = best.unwrap();
    tracing::debug!(
        in_front = count,
        total = pairs.len(),
        "essential decomposition cheirality vote"
    );
    if count * 2 <= pairs.len() {
        return Err(MvgError::UnreliablePose(
            "most correspondences triangulate behind the cameras",
        ));
    }
    Ok(pose)
}

/// Number of correspondences whose triangulation lands in front of both
/// cameras under the candidate pose.
fn count_in_front(pose: &RelativePose, pairs: &[(Vector2<f64>, Vector2<f64>)]) -> usize {
    let o1 = Point3::origin();
    let o2 = pose.camera2_center();
    pairs
        .iter()
        .filter(|(x1, x2)| {
            let d1 = Vector3::new(x1.x, x1.y, 1.0);
            let d2 = pose.rotation.transpose() * Vector3::new(x2.x, x2.y, 1.0);
            match triangulate::midpoint(&o1, &d1, &o2, &d2) {
                Ok(p) => {
                    let depth1 = p.coords.z;
                    let depth2 = (pose.rotation * p.coords + pose.translation).z;
                    depth1 > 0.0 && depth2 > 0.0
                }
                Err(_) => false,
            }
        })
        .count()
}

/// Full two-view initialization: estimate, decompose, and scale the
/// translation so the camera baseline has length `baseline`.
pub fn two_view_pose(
    pairs: &[(Vector2<f64>, Vector2<f64>)],
    baseline: f64,
) -> Result<RelativePose> {
    let e = estimate_essential(pairs)?;
    let mut pose = decompose_essential(&e, pairs)?;
    let norm = pose.translation.norm();
    if norm < 1e-12 {
        return Err(MvgError::UnreliablePose("zero baseline"));
    }
    pose.translation *= baseline / norm;
    Ok(pose)
}
