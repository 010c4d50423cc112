use nalgebra::{DVector, Matrix3, Point2, Vector3};

use scene_mvg::{BEHIND_CAMERA_PENALTY, NEAR_PLANE};
use scene_types::ImagePointId;

use crate::layout::{CameraRef, PointRef};
use crate::residual::ResidualProvider;

/// Two residual rows (`du`, `dv`) for one image-point observation.
///
/// The rotation is applied through the quadratic quaternion form
/// `R(q)·d = d + 2w(v×d) + 2v×(v×d)` so the residual and its Jacobian
/// stay consistent for the raw (near-unit) quaternion components the
/// solver iterates on; the unit-norm residual row keeps the drift small
/// and every accepted step renormalizes.
pub struct ReprojectionProvider {
    pub image_point: ImagePointId,
    observed: Point2<f64>,
    camera: CameraRef,
    point: PointRef,
}

struct Projected {
    /// Camera coordinates after the z-reflection sign.
    c: Vector3<f64>,
    /// World offset `p − t`.
    d: Vector3<f64>,
    q: [f64; 4],
    focal: f64,
    principal: Point2<f64>,
}

impl ReprojectionProvider {
    pub fn new(
        image_point: ImagePointId,
        observed: Point2<f64>,
        camera: CameraRef,
        point: PointRef,
    ) -> Self {
        Self {
            image_point,
            observed,
            camera,
            point,
        }
    }

    fn evaluate(&self, x: &DVector<f64>) -> Projected {
        let p = self.point.position(x);
        let t = self.camera.position(x);
        let d = p - t;
        let q = self.camera.quaternion_raw(x);
        let c = rotate(&q, &d) * self.camera.z_sign;
        Projected {
            c,
            d,
            q,
            focal: self.camera.focal(x),
            principal: self.camera.principal_point(x),
        }
    }

    fn pixel(&self, e: &Projected) -> Point2<f64> {
        let fx = e.focal;
        let fy = e.focal * self.camera.aspect_ratio;
        let u = fx * e.c.x / e.c.z + self.camera.skew * e.c.y / e.c.z + e.principal.x;
        let v = e.principal.y - fy * e.c.y / e.c.z;
        Point2::new(u, v)
    }
}

/// `R(q)·d` in the quadratic form valid for unit quaternions.
fn rotate(q: &[f64; 4], d: &Vector3<f64>) -> Vector3<f64> {
    let w = q[0];
    let v = Vector3::new(q[1], q[2], q[3]);
    d + (v.cross(d)) * (2.0 * w) + v.cross(&v.cross(d)) * 2.0
}

fn skew_matrix(v: &Vector3<f64>) -> Matrix3<f64> {
    Matrix3::new(
        0.0, -v.z, v.y, //
        v.z, 0.0, -v.x, //
        -v.y, v.x, 0.0,
    )
}

impl ResidualProvider for ReprojectionProvider {
    fn name(&self) -> &'static str {
        "reprojection"
    }

    fn residual_count(&self) -> usize {
        2
    }

    fn slots(&self) -> Vec<usize> {
        let mut slots: Vec<usize> = self.point.slots.iter().flatten().copied().collect();
        if let Some(base) = self.camera.slots.position {
            slots.extend(base..base + 3);
        }
        if let Some(base) = self.camera.slots.quaternion {
            slots.extend(base..base + 4);
        }
        if let Some(slot) = self.camera.slots.focal {
            slots.push(slot);
        }
        if let Some(base) = self.camera.slots.principal {
            slots.extend(base..base + 2);
        }
        slots
    }

    fn compute_residuals(&self, x: &DVector<f64>, out: &mut Vec<f64>) {
        let e = self.evaluate(x);
        if e.c.z < NEAR_PLANE {
            out.push(BEHIND_CAMERA_PENALTY);
            out.push(BEHIND_CAMERA_PENALTY);
            return;
        }
        let predicted = self.pixel(&e);
        out.push(predicted.x - self.observed.x);
        out.push(predicted.y - self.observed.y);
    }

    fn compute_jacobian(
        &self,
        x: &DVector<f64>,
        row_base: usize,
        triples: &mut Vec<(usize, usize, f64)>,
    ) {
        let e = self.evaluate(x);
        if e.c.z < NEAR_PLANE {
            // constant penalty rows carry no gradient
            return;
        }

        let s = self.camera.z_sign;
        let fx = e.focal;
        let fy = e.focal * self.camera.aspect_ratio;
        let sk = self.camera.skew;
        let (cx, cy, cz) = (e.c.x, e.c.y, e.c.z);

        let du_dc = Vector3::new(fx / cz, sk / cz, -(fx * cx + sk * cy) / (cz * cz));
        let dv_dc = Vector3::new(0.0, -fy / cz, fy * cy / (cz * cz));

        let w = e.q[0];
        let v = Vector3::new(e.q[1], e.q[2], e.q[3]);
        let d = e.d;

        // dc/dd for the quadratic rotation form, times the reflection sign
        let m = (Matrix3::identity() * (1.0 - 2.0 * v.norm_squared())
            + skew_matrix(&v) * (2.0 * w)
            + v * v.transpose() * 2.0)
            * s;

        let mut emit = |col: usize, du: f64, dv: f64| {
            if du != 0.0 {
                triples.push((row_base, col, du));
            }
            if dv != 0.0 {
                triples.push((row_base + 1, col, dv));
            }
        };

        // world point axes
        for (axis, slot) in self.point.slots.iter().enumerate() {
            if let Some(col) = slot {
                let dc = m.column(axis);
                emit(*col, du_dc.dot(&dc), dv_dc.dot(&dc));
            }
        }

        // camera center (d = p − t)
        if let Some(base) = self.camera.slots.position {
            for axis in 0..3 {
                let dc = -m.column(axis);
                emit(base + axis, du_dc.dot(&dc), dv_dc.dot(&dc));
            }
        }

        // quaternion components w, x, y, z
        if let Some(base) = self.camera.slots.quaternion {
            let dc_dw = v.cross(&d) * (2.0 * s);
            emit(base, du_dc.dot(&dc_dw), dv_dc.dot(&dc_dw));

            let dc_dv = (Matrix3::identity() * (2.0 * v.dot(&d)) + v * d.transpose() * 2.0
                - d * v.transpose() * 4.0
                - skew_matrix(&d) * (2.0 * w))
                * s;
            for k in 0..3 {
                let dc = dc_dv.column(k);
                emit(base + 1 + k, du_dc.dot(&dc), dv_dc.dot(&dc));
            }
        }

        if let Some(slot) = self.camera.slots.focal {
            emit(
                slot,
                cx / cz,
                -self.camera.aspect_ratio * cy / cz,
            );
        }

        if let Some(base) = self.camera.slots.principal {
            emit(base, 1.0, 0.0);
            emit(base + 1, 0.0, 1.0);
        }
    }
}
