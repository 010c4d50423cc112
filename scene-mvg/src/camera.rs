use nalgebra::{Matrix3, Point2, Point3, UnitQuaternion, Vector2, Vector3};

use scene_types::{Intrinsics, Viewpoint};

/// Camera-space depth below which a point counts as behind the camera.
pub const NEAR_PLANE: f64 = 0.099;

/// Constant residual emitted for behind-camera observations.
pub const BEHIND_CAMERA_PENALTY: f64 = 1000.0;

/// Outcome of projecting a world point.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Projection {
    /// Pixel coordinates of the projected point.
    Pixel(Point2<f64>),
    /// The point is behind the camera (depth below [`NEAR_PLANE`]).
    BehindCamera,
}

impl Projection {
    pub fn pixel(self) -> Option<Point2<f64>> {
        match self {
            Projection::Pixel(p) => Some(p),
            Projection::BehindCamera => None,
        }
    }
}

/// A projective camera snapshot of a [`Viewpoint`].
///
/// The rotation matrix is cached; build a fresh `Camera` after mutating
/// the viewpoint.
#[derive(Debug, Clone, PartialEq)]
pub struct Camera {
    intrinsics: Intrinsics,
    position: Point3<f64>,
    rotation: Matrix3<f64>,
    z_sign: f64,
}

impl Camera {
    pub fn from_viewpoint(vp: &Viewpoint) -> Self {
        Self::new(
            vp.intrinsics.clone(),
            vp.position,
            vp.rotation,
            vp.is_z_reflected,
        )
    }

    pub fn new(
        intrinsics: Intrinsics,
        position: Point3<f64>,
        rotation: UnitQuaternion<f64>,
        is_z_reflected: bool,
    ) -> Self {
        Self {
            intrinsics,
            position,
            rotation: rotation.to_rotation_matrix().into_inner(),
            z_sign: if is_z_reflected { -1.0 } else { 1.0 },
        }
    }

    #[inline]
    pub fn intrinsics(&self) -> &Intrinsics {
        &self.intrinsics
    }

    #[inline]
    pub fn position(&self) -> Point3<f64> {
        self.position
    }

    #[inline]
    pub fn rotation(&self) -> &Matrix3<f64> {
        &self.rotation
    }

    /// Transform a world point into camera coordinates (z-reflection
    /// applied).
    pub fn camera_coords(&self, p: &Point3<f64>) -> Vector3<f64> {
        self.rotation * (p - self.position) * self.z_sign
    }

    /// Project a world point to pixels, reporting behind-camera points.
    pub fn project(&self, p: &Point3<f64>) -> Projection {
        let c = self.camera_coords(p);
        if c.z < NEAR_PLANE {
            return Projection::BehindCamera;
        }
        Projection::Pixel(self.project_camera_coords(&c))
    }

    /// Pixel position of camera coordinates `c` (no depth check).
    pub fn project_camera_coords(&self, c: &Vector3<f64>) -> Point2<f64> {
        let i = &self.intrinsics;
        let u = i.fx() * c.x / c.z + i.skew * c.y / c.z + i.principal_point.x;
        let v = i.principal_point.y - i.fy() * c.y / c.z;
        Point2::new(u, v)
    }

    /// Reprojection residual `[du, dv]` (predicted minus observed), or the
    /// constant penalty pair for behind-camera points.
    pub fn reprojection_residual(&self, p: &Point3<f64>, observed: &Point2<f64>) -> [f64; 2] {
        match self.project(p) {
            Projection::Pixel(predicted) => {
                [predicted.x - observed.x, predicted.y - observed.y]
            }
            Projection::BehindCamera => [BEHIND_CAMERA_PENALTY, BEHIND_CAMERA_PENALTY],
        }
    }

    /// Reprojection distance in pixels, or `None` behind the camera.
    pub fn reprojection_distance(&self, p: &Point3<f64>, observed: &Point2<f64>) -> Option<f64> {
        self.project(p)
            .pixel()
            .map(|predicted| (predicted - observed).norm())
    }

    /// The world-space ray through a pixel: `(origin, unit direction)`.
    pub fn pixel_ray(&self, uv: &Point2<f64>) -> (Point3<f64>, Vector3<f64>) {
        let d = self.pixel_direction_camera(uv);
        let world = self.rotation.transpose() * (d * self.z_sign);
        (self.position, world.normalize())
    }

    /// Camera-frame direction of the ray through a pixel.
    pub fn pixel_direction_camera(&self, uv: &Point2<f64>) -> Vector3<f64> {
        let i = &self.intrinsics;
        let y = (i.principal_point.y - uv.y) / i.fy();
        let x = (uv.x - i.principal_point.x - i.skew * y) / i.fx();
        Vector3::new(x, y, 1.0)
    }

    /// Apply Brown-Conrady distortion to a pixel position.
    ///
    /// Exposed for hosts that render distorted overlays; the solver's
    /// residuals use the linear model.
    pub fn distort(&self, uv: &Point2<f64>) -> Point2<f64> {
        let i = &self.intrinsics;
        if i.is_linear() {
            return *uv;
        }
        let [k1, k2, k3] = i.radial_distortion;
        let [p1, p2] = i.tangential_distortion;
        let x = (uv.x - i.principal_point.x) / i.fx();
        let y = (uv.y - i.principal_point.y) / i.fy();
        let r2 = x * x + y * y;
        let radial = 1.0 + k1 * r2 + k2 * r2 * r2 + k3 * r2 * r2 * r2;
        let xd = x * radial + 2.0 * p1 * x * y + p2 * (r2 + 2.0 * x * x);
        let yd = y * radial + p1 * (r2 + 2.0 * y * y) + 2.0 * p2 * x * y;
        Point2::new(
            xd * i.fx() + i.principal_point.x,
            yd * i.fy() + i.principal_point.y,
        )
    }

    /// Invert [`Camera::distort`] by fixed-point iteration.
    pub fn undistort(&self, uv: &Point2<f64>) -> Point2<f64> {
        let i = &self.intrinsics;
        if i.is_linear() {
            return *uv;
        }
        let target = Vector2::new(uv.x, uv.y);
        let mut guess = *uv;
        for _ in 0..10 {
            let distorted = self.distort(&guess);
            let err = target - Vector2::new(distorted.x, distorted.y);
            guess += err;
            if err.norm() < 1e-10 {
                break;
            }
        }
        guess
    }
}
