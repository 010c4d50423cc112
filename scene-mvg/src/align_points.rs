use nalgebra::{Matrix3, Matrix3xX, Vector3};

use crate::{MvgError, Result};

/// A similarity (or rigid) transformation `y ≈ scale·R·x + t`.
#[derive(Debug, Clone, PartialEq)]
pub struct Similarity {
    pub scale: f64,
    pub rotation: Matrix3<f64>,
    pub translation: Vector3<f64>,
}

impl Similarity {
    pub fn apply(&self, x: &Vector3<f64>) -> Vector3<f64> {
        self.rotation * x * self.scale + self.translation
    }
}

/// Kabsch-Umeyama fit of the transformation taking points `x` onto `y`.
///
/// With `with_scale` false the scale is held at one (rigid fit). Needs at
/// least three non-collinear point pairs for a unique rotation.
pub fn align_points(x: &Matrix3xX<f64>, y: &Matrix3xX<f64>, with_scale: bool) -> Result<Similarity> {
    let n = x.ncols();
    if n != y.ncols() || n < 3 {
        return Err(MvgError::NotEnoughPoints);
    }
    let n_f = n as f64;

    let mu_x: Vector3<f64> = x.column_sum() / n_f;
    let mu_y: Vector3<f64> = y.column_sum() / n_f;

    let mut cov = Matrix3::<f64>::zeros();
    let mut var_x = 0.0;
    for i in 0..n {
        let xc = x.column(i) - mu_x;
        let yc = y.column(i) - mu_y;
        cov += yc * xc.transpose();
        var_x += xc.norm_squared();
    }
    cov /= n_f;
    var_x /= n_f;

    let svd = nalgebra::linalg::SVD::try_new(cov, true, true, 1e-12, 0)
        .ok_or(MvgError::SvdFailed)?;
    let u = svd.u.ok_or(MvgError::SvdFailed)?;
    let v_t = svd.v_t.ok_or(MvgError::SvdFailed)?;
    let d = svd.singular_values;

    let mut s = Matrix3::<f64>::identity();
    if u.determinant() * v_t.determinant() < 0.0 {
        s[(2, 2)] = -1.0;
    }

    let rotation = u * s * v_t;
    let scale = if with_scale {
        if var_x < 1e-30 {
            return Err(MvgError::NotEnoughPoints);
        }
        (Matrix3::from_diagonal(&d) * s).trace() / var_x
    } else {
        1.0
    };
    let translation = mu_y - rotation * mu_x * scale;

    Ok(Similarity {
        scale,
        rotation,
        translation,
    })
}
