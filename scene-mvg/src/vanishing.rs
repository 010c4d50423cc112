use nalgebra::{DMatrix, Matrix2, Matrix3, Point2, UnitQuaternion, Vector2, Vector3};

use scene_types::Axis;

use crate::{MvgError, Result};

/// Rotation (and optionally focal length / principal point) recovered from
/// axis vanishing points.
#[derive(Debug, Clone, PartialEq)]
pub struct VpRotationInit {
    /// World-to-camera rotation, right-handed (det +1).
    pub rotation: UnitQuaternion<f64>,
    /// Focal length derived from the orthogonality condition; `None` when
    /// the caller supplied a known focal length.
    pub focal_length: Option<f64>,
    /// Principal point from the vanishing-point triangle orthocenter;
    /// only available with three vanishing points.
    pub principal_point: Option<Point2<f64>>,
}

/// Intersect two or more image lines (given as segments) in the
/// least-squares sense, in homogeneous coordinates.
pub fn vanishing_point(segments: &[(Point2<f64>, Point2<f64>)]) -> Result<Point2<f64>> {
    if segments.len() < 2 {
        return Err(MvgError::NotEnoughVanishingLines);
    }

    let homogeneous_line = |(p1, p2): &(Point2<f64>, Point2<f64>)| -> Vector3<f64> {
        let a = Vector3::new(p1.x, p1.y, 1.0);
        let b = Vector3::new(p2.x, p2.y, 1.0);
        a.cross(&b)
    };

    let h = if segments.len() == 2 {
        let l1 = homogeneous_line(&segments[0]);
        let l2 = homogeneous_line(&segments[1]);
        l1.cross(&l2)
    } else {
        // null vector of the stacked line equations
        let mut a = DMatrix::<f64>::zeros(segments.len(), 3);
        for (i, seg) in segments.iter().enumerate() {
            let l = homogeneous_line(seg);
            let n = l.norm();
            if n < 1e-12 {
                return Err(MvgError::DegenerateVanishingPoint);
            }
            for k in 0..3 {
                a[(i, k)] = l[k] / n;
            }
        }
        let svd = a.svd(false, true);
        let v_t = svd.v_t.ok_or(MvgError::SvdFailed)?;
        let row = v_t.row(v_t.nrows() - 1);
        Vector3::new(row[0], row[1], row[2])
    };

    let xy_norm = (h.x * h.x + h.y * h.y).sqrt();
    if h.z.abs() < 1e-9 * xy_norm.max(1.0) {
        // lines are parallel in the image; the vanishing point is at infinity
        return Err(MvgError::DegenerateVanishingPoint);
    }
    Ok(Point2::new(h.x / h.z, h.y / h.z))
}

/// Orthocenter of the triangle spanned by three vanishing points; with an
/// orthogonal axis triad this is the principal point.
pub fn triangle_orthocenter(
    a: &Point2<f64>,
    b: &Point2<f64>,
    c: &Point2<f64>,
) -> Result<Point2<f64>> {
    // (h − a)·(b − c) = 0 and (h − b)·(a − c) = 0
    let bc = b - c;
    let ac = a - c;
    let m = Matrix2::from_rows(&[bc.transpose(), ac.transpose()]);
    let rhs = Vector2::new(a.coords.dot(&bc), b.coords.dot(&ac));
    let h = m
        .lu()
        .solve(&rhs)
        .ok_or(MvgError::DegenerateVanishingPoint)?;
    Ok(Point2::new(h.x, h.y))
}

/// Focal length from two vanishing points of perpendicular axes:
/// `f² = −(va − P)·(vb − P)`.
pub fn focal_from_vanishing_points(
    va: &Point2<f64>,
    vb: &Point2<f64>,
    principal_point: &Point2<f64>,
) -> Result<f64> {
    let da = va - principal_point;
    let db = vb - principal_point;
    let f2 = -da.dot(&db);
    if f2 <= 0.0 {
        return Err(MvgError::VanishingPointsNotOrthogonal);
    }
    Ok(f2.sqrt())
}

/// Recover the camera rotation from two or three axis vanishing points.
///
/// `vps` is indexed by [`Axis::index`]. `axis_signs` selects which of the
/// two possible world directions each vanishing point represents; the
/// candidate layer enumerates flips. With three vanishing points the
/// principal point is recovered from the triangle orthocenter; with two,
/// the supplied one is used. The assembled axis triad is orthonormalized
/// symmetrically (polar decomposition), which distributes measurement
/// error evenly between the observed axes, and the result is always
/// right-handed.
pub fn rotation_from_vanishing_points(
    vps: &[Option<Point2<f64>>; 3],
    principal_point: Point2<f64>,
    known_focal: Option<f64>,
    aspect_ratio: f64,
    axis_signs: [f64; 3],
) -> Result<VpRotationInit> {
    let known: Vec<Axis> = Axis::ALL
        .iter()
        .copied()
        .filter(|a| vps[a.index()].is_some())
        .collect();
    if known.len() < 2 {
        return Err(MvgError::NotEnoughVanishingLines);
    }

    let (pp, derived_pp) = if known.len() == 3 {
        let h = triangle_orthocenter(
            &vps[0].unwrap(),
            &vps[1].unwrap(),
            &vps[2].unwrap(),
        )?;
        (h, Some(h))
    } else {
        (principal_point, None)
    };

    let focal = match known_focal {
        Some(f) if f > 0.0 => f,
        _ => {
            let va = vps[known[0].index()].unwrap();
            let vb = vps[known[1].index()].unwrap();
            focal_from_vanishing_points(&va, &vb, &pp)?
        }
    };

    // camera-frame direction of each observed axis
    let mut columns: [Option<Vector3<f64>>; 3] = [None, None, None];
    for axis in &known {
        let vp = vps[axis.index()].unwrap();
        let d = vp - pp;
        let dir = Vector3::new(d.x / focal, -d.y / (focal * aspect_ratio), 1.0).normalize();
        columns[axis.index()] = Some(dir * axis_signs[axis.index()]);
    }

    // the missing axis completes a right-handed triad
    if known.len() == 2 {
        let [cx, cy, cz] = columns;
        columns = match (cx, cy, cz) {
            (Some(x), Some(y), None) => [Some(x), Some(y), Some(x.cross(&y))],
            (Some(x), None, Some(z)) => [Some(x), Some(z.cross(&x)), Some(z)],
            (None, Some(y), Some(z)) => [Some(y.cross(&z)), Some(y), Some(z)],
            _ => unreachable!(),
        };
    }

    let m = Matrix3::from_columns(&[
        columns[0].unwrap(),
        columns[1].unwrap(),
        columns[2].unwrap(),
    ]);

    let rotation = nearest_rotation(&m)?;
    Ok(VpRotationInit {
        rotation: UnitQuaternion::from_rotation_matrix(
            &nalgebra::Rotation3::from_matrix_unchecked(rotation),
        ),
        focal_length: if known_focal.is_some() {
            None
        } else {
            Some(focal)
        },
        principal_point: derived_pp,
    })
}

/// Nearest rotation matrix (det +1) by polar decomposition.
pub fn nearest_rotation(m: &Matrix3<f64>) -> Result<Matrix3<f64>> {
    let svd =
        nalgebra::linalg::SVD::try_new(*m, true, true, 1e-12, 0).ok_or(MvgError::SvdFailed)?;
    let u = svd.u.ok_or(MvgError::SvdFailed)?;
    let v_t = svd.v_t.ok_or(MvgError::SvdFailed)?;
    let mut s = Matrix3::<f64>::identity();
    if u.determinant() * v_t.determinant() < 0.0 {
        s[(2, 2)] = -1.0;
    }
    Ok(u * s * v_t)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::extrinsics::look_at;
    use crate::Camera;
    use approx::assert_relative_eq;
    use nalgebra::Point3;
    use scene_types::Viewpoint;

    fn rotated_test_camera() -> (Viewpoint, Camera) {
        let mut vp = Viewpoint::new("cam", 1920, 1080);
        vp.intrinsics.focal_length = 1500.0;
        vp.position = Point3::new(14.0, 6.0, -16.0);
        vp.rotation = look_at(&vp.position, &Point3::origin(), &nalgebra::Vector3::y());
        let cam = Camera::from_viewpoint(&vp);
        (vp, cam)
    }

    /// Project a pair of world-space segments parallel to `axis`.
    fn axis_segments(cam: &Camera, axis: Axis) -> Vec<(Point2<f64>, Point2<f64>)> {
        let dir = axis.unit();
        let anchors = [
            Point3::new(0.0, 0.0, 0.0),
            Point3::new(1.0, 2.0, 1.5),
            Point3::new(-2.0, 1.0, 3.0),
        ];
        anchors
            .iter()
            .map(|a| {
                let p1 = cam.project(a).pixel().unwrap();
                let p2 = cam.project(&(a + dir * 4.0)).pixel().unwrap();
                (p1, p2)
            })
            .collect()
    }

    #[test]
    fn vanishing_point_of_exact_lines() {
        let (_vp, cam) = rotated_test_camera();
        let segments = axis_segments(&cam, Axis::X);

        let from_two = vanishing_point(&segments[..2]).unwrap();
        let from_three = vanishing_point(&segments).unwrap();
        assert_relative_eq!(from_two, from_three, epsilon = 1e-5);
    }

    #[test]
    fn parallel_image_lines_have_no_finite_vanishing_point() {
        let segments = vec![
            (Point2::new(0.0, 0.0), Point2::new(10.0, 0.0)),
            (Point2::new(0.0, 5.0), Point2::new(10.0, 5.0)),
        ];
        assert_eq!(
            vanishing_point(&segments),
            Err(MvgError::DegenerateVanishingPoint)
        );
    }

    #[test]
    fn focal_and_rotation_from_two_axes() {
        let (vp, cam) = rotated_test_camera();
        let vx = vanishing_point(&axis_segments(&cam, Axis::X)).unwrap();
        let vz = vanishing_point(&axis_segments(&cam, Axis::Z)).unwrap();

        let init = rotation_from_vanishing_points(
            &[Some(vx), None, Some(vz)],
            vp.intrinsics.principal_point,
            None,
            1.0,
            [1.0, 1.0, 1.0],
        )
        .unwrap();

        let f = init.focal_length.unwrap();
        assert_relative_eq!(f, 1500.0, max_relative = 1e-6);

        // up to the axis-sign ambiguity the rotation matches ground truth
        let truth = vp.rotation;
        let angle = init.rotation.angle_to(&truth);
        assert!(
            angle < 1e-6 || (std::f64::consts::PI - angle) < 1e-6,
            "angle to truth: {angle}"
        );

        let det = init
            .rotation
            .to_rotation_matrix()
            .into_inner()
            .determinant();
        assert_relative_eq!(det, 1.0, epsilon = 1e-12);
    }

    #[test]
    fn three_axes_recover_principal_point() {
        let (vp, cam) = rotated_test_camera();
        let vx = vanishing_point(&axis_segments(&cam, Axis::X)).unwrap();
        let vy = vanishing_point(&axis_segments(&cam, Axis::Y)).unwrap();
        let vz = vanishing_point(&axis_segments(&cam, Axis::Z)).unwrap();

        let init = rotation_from_vanishing_points(
            &[Some(vx), Some(vy), Some(vz)],
            // deliberately wrong principal point; three VPs ignore it
            Point2::new(0.0, 0.0),
            None,
            1.0,
            [1.0, 1.0, 1.0],
        )
        .unwrap();

        let pp = init.principal_point.unwrap();
        assert_relative_eq!(pp, vp.intrinsics.principal_point, epsilon = 1e-3);
        assert_relative_eq!(init.focal_length.unwrap(), 1500.0, max_relative = 1e-4);
    }

    #[test]
    fn same_side_vanishing_points_rejected() {
        // both "vanishing points" on the same side of the principal point
        let result = focal_from_vanishing_points(
            &Point2::new(100.0, 0.0),
            &Point2::new(200.0, 0.0),
            &Point2::new(0.0, 0.0),
        );
        assert_eq!(result, Err(MvgError::VanishingPointsNotOrthogonal));
    }
}
