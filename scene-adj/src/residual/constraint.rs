use nalgebra::{DVector, Matrix3, Vector3};

use crate::layout::PointRef;
use crate::residual::line::endpoint_slots;
use crate::residual::{ResidualProvider, GEOMETRY_WEIGHT, QUATERNION_UNIT_WEIGHT};

/// One row: `‖b − a‖ − target`.
pub struct DistanceProvider {
    a: PointRef,
    b: PointRef,
    target: f64,
}

impl DistanceProvider {
    pub fn new(a: PointRef, b: PointRef, target: f64) -> Self {
        Self { a, b, target }
    }
}

impl ResidualProvider for DistanceProvider {
    fn name(&self) -> &'static str {
        "distance"
    }

    fn residual_count(&self) -> usize {
        1
    }

    fn slots(&self) -> Vec<usize> {
        endpoint_slots(&[self.a, self.b])
    }

    fn compute_residuals(&self, x: &DVector<f64>, out: &mut Vec<f64>) {
        let d = self.b.position(x) - self.a.position(x);
        out.push(GEOMETRY_WEIGHT * (d.norm() - self.target));
    }

    fn compute_jacobian(
        &self,
        x: &DVector<f64>,
        row_base: usize,
        triples: &mut Vec<(usize, usize, f64)>,
    ) {
        emit_distance_gradient(x, &self.a, &self.b, row_base, GEOMETRY_WEIGHT, triples);
    }
}

/// Gradient rows of `‖b − a‖` scaled by `weight`, emitted at `row`.
fn emit_distance_gradient(
    x: &DVector<f64>,
    a: &PointRef,
    b: &PointRef,
    row: usize,
    weight: f64,
    triples: &mut Vec<(usize, usize, f64)>,
) {
    let d = b.position(x) - a.position(x);
    let len = d.norm();
    if len < 1e-12 {
        return;
    }
    let unit = d / len;
    for axis in 0..3 {
        if let Some(col) = b.slots[axis] {
            triples.push((row, col, weight * unit[axis]));
        }
        if let Some(col) = a.slots[axis] {
            triples.push((row, col, -weight * unit[axis]));
        }
    }
}

/// One row: `acos(û·ŵ) − target` at the vertex.
pub struct AngleProvider {
    a: PointRef,
    vertex: PointRef,
    c: PointRef,
    target_radians: f64,
}

impl AngleProvider {
    pub fn new(a: PointRef, vertex: PointRef, c: PointRef, target_radians: f64) -> Self {
        Self {
            a,
            vertex,
            c,
            target_radians,
        }
    }
}

struct AngleEval {
    angle: f64,
    grad_a: Vector3<f64>,
    grad_vertex: Vector3<f64>,
    grad_c: Vector3<f64>,
}

/// Angle at `vertex` and its gradients; degenerate configurations
/// (zero-length rays, angle at 0 or π) get zero gradients and a finite
/// angle.
fn eval_angle(a: &Vector3<f64>, vertex: &Vector3<f64>, c: &Vector3<f64>) -> AngleEval {
    let zero = AngleEval {
        angle: 0.0,
        grad_a: Vector3::zeros(),
        grad_vertex: Vector3::zeros(),
        grad_c: Vector3::zeros(),
    };
    let u = a - vertex;
    let t = c - vertex;
    let lu = u.norm();
    let lt = t.norm();
    if lu < 1e-12 || lt < 1e-12 {
        return zero;
    }
    let uu = u / lu;
    let tt = t / lt;
    let cos_theta = uu.dot(&tt).clamp(-1.0, 1.0);
    let angle = cos_theta.acos();
    let sin_theta = (1.0 - cos_theta * cos_theta).sqrt();
    if sin_theta < 1e-9 {
        return AngleEval { angle, ..zero };
    }
    let dtheta_dcos = -1.0 / sin_theta;
    let grad_a = (tt - uu * cos_theta) * (dtheta_dcos / lu);
    let grad_c = (uu - tt * cos_theta) * (dtheta_dcos / lt);
    AngleEval {
        angle,
        grad_vertex: -(grad_a + grad_c),
        grad_a,
        grad_c,
    }
}

fn emit_point_gradient(
    point: &PointRef,
    grad: &Vector3<f64>,
    row: usize,
    weight: f64,
    triples: &mut Vec<(usize, usize, f64)>,
) {
    for axis in 0..3 {
        if let Some(col) = point.slots[axis] {
            let value = weight * grad[axis];
            if value != 0.0 {
                triples.push((row, col, value));
            }
        }
    }
}

impl ResidualProvider for AngleProvider {
    fn name(&self) -> &'static str {
        "angle"
    }

    fn residual_count(&self) -> usize {
        1
    }

    fn slots(&self) -> Vec<usize> {
        endpoint_slots(&[self.a, self.vertex, self.c])
    }

    fn compute_residuals(&self, x: &DVector<f64>, out: &mut Vec<f64>) {
        let e = eval_angle(
            &self.a.position(x).coords,
            &self.vertex.position(x).coords,
            &self.c.position(x).coords,
        );
        out.push(GEOMETRY_WEIGHT * (e.angle - self.target_radians));
    }

    fn compute_jacobian(
        &self,
        x: &DVector<f64>,
        row_base: usize,
        triples: &mut Vec<(usize, usize, f64)>,
    ) {
        let e = eval_angle(
            &self.a.position(x).coords,
            &self.vertex.position(x).coords,
            &self.c.position(x).coords,
        );
        emit_point_gradient(&self.a, &e.grad_a, row_base, GEOMETRY_WEIGHT, triples);
        emit_point_gradient(&self.vertex, &e.grad_vertex, row_base, GEOMETRY_WEIGHT, triples);
        emit_point_gradient(&self.c, &e.grad_c, row_base, GEOMETRY_WEIGHT, triples);
    }
}

/// Direction pair shared by the parallel / perpendicular providers.
struct DirectionPair {
    ua: Vector3<f64>,
    ub: Vector3<f64>,
    /// `(I − ûûᵀ)/‖d‖` for each line, the unit-direction derivative.
    proj_a: Matrix3<f64>,
    proj_b: Matrix3<f64>,
}

fn eval_directions(
    x: &DVector<f64>,
    a1: &PointRef,
    a2: &PointRef,
    b1: &PointRef,
    b2: &PointRef,
) -> Option<DirectionPair> {
    let da = a2.position(x) - a1.position(x);
    let db = b2.position(x) - b1.position(x);
    let la = da.norm();
    let lb = db.norm();
    if la < 1e-12 || lb < 1e-12 {
        return None;
    }
    let ua = da / la;
    let ub = db / lb;
    Some(DirectionPair {
        proj_a: (Matrix3::identity() - ua * ua.transpose()) / la,
        proj_b: (Matrix3::identity() - ub * ub.transpose()) / lb,
        ua,
        ub,
    })
}

/// One row: `‖ûa × ûb‖`, zero when the lines are parallel.
pub struct ParallelLinesProvider {
    a1: PointRef,
    a2: PointRef,
    b1: PointRef,
    b2: PointRef,
}

impl ParallelLinesProvider {
    pub fn new(a1: PointRef, a2: PointRef, b1: PointRef, b2: PointRef) -> Self {
        Self { a1, a2, b1, b2 }
    }
}

impl ResidualProvider for ParallelLinesProvider {
    fn name(&self) -> &'static str {
        "parallel-lines"
    }

    fn residual_count(&self) -> usize {
        1
    }

    fn slots(&self) -> Vec<usize> {
        endpoint_slots(&[self.a1, self.a2, self.b1, self.b2])
    }

    fn compute_residuals(&self, x: &DVector<f64>, out: &mut Vec<f64>) {
        match eval_directions(x, &self.a1, &self.a2, &self.b1, &self.b2) {
            Some(pair) => out.push(GEOMETRY_WEIGHT * pair.ua.cross(&pair.ub).norm()),
            None => out.push(0.0),
        }
    }

    fn compute_jacobian(
        &self,
        x: &DVector<f64>,
        row_base: usize,
        triples: &mut Vec<(usize, usize, f64)>,
    ) {
        let Some(pair) = eval_directions(x, &self.a1, &self.a2, &self.b1, &self.b2) else {
            return;
        };
        let cross = pair.ua.cross(&pair.ub);
        let len = cross.norm();
        if len < 1e-12 {
            // at the optimum the magnitude is not differentiable
            return;
        }
        let unit_cross = cross / len;
        // ∂‖ûa×ûb‖/∂ûa = ûb×ĉ, ∂/∂ûb = −(ûa×ĉ)
        let grad_a = pair.proj_a * pair.ub.cross(&unit_cross);
        let grad_b = pair.proj_b * (-pair.ua.cross(&unit_cross));
        emit_point_gradient(&self.a2, &grad_a, row_base, GEOMETRY_WEIGHT, triples);
        emit_point_gradient(&self.a1, &(-grad_a), row_base, GEOMETRY_WEIGHT, triples);
        emit_point_gradient(&self.b2, &grad_b, row_base, GEOMETRY_WEIGHT, triples);
        emit_point_gradient(&self.b1, &(-grad_b), row_base, GEOMETRY_WEIGHT, triples);
    }
}

/// One row: `ûa·ûb`, zero when the lines are perpendicular.
pub struct PerpendicularLinesProvider {
    a1: PointRef,
    a2: PointRef,
    b1: PointRef,
    b2: PointRef,
}

impl PerpendicularLinesProvider {
    pub fn new(a1: PointRef, a2: PointRef, b1: PointRef, b2: PointRef) -> Self {
        Self { a1, a2, b1, b2 }
    }
}

impl ResidualProvider for PerpendicularLinesProvider {
    fn name(&self) -> &'static str {
        "perpendicular-lines"
    }

    fn residual_count(&self) -> usize {
        1
    }

    fn slots(&self) -> Vec<usize> {
        endpoint_slots(&[self.a1, self.a2, self.b1, self.b2])
    }

    fn compute_residuals(&self, x: &DVector<f64>, out: &mut Vec<f64>) {
        match eval_directions(x, &self.a1, &self.a2, &self.b1, &self.b2) {
            Some(pair) => out.push(GEOMETRY_WEIGHT * pair.ua.dot(&pair.ub)),
            None => out.push(0.0),
        }
    }

    fn compute_jacobian(
        &self,
        x: &DVector<f64>,
        row_base: usize,
        triples: &mut Vec<(usize, usize, f64)>,
    ) {
        let Some(pair) = eval_directions(x, &self.a1, &self.a2, &self.b1, &self.b2) else {
            return;
        };
        let grad_a = pair.proj_a * pair.ub;
        let grad_b = pair.proj_b * pair.ua;
        emit_point_gradient(&self.a2, &grad_a, row_base, GEOMETRY_WEIGHT, triples);
        emit_point_gradient(&self.a1, &(-grad_a), row_base, GEOMETRY_WEIGHT, triples);
        emit_point_gradient(&self.b2, &grad_b, row_base, GEOMETRY_WEIGHT, triples);
        emit_point_gradient(&self.b1, &(-grad_b), row_base, GEOMETRY_WEIGHT, triples);
    }
}

/// Three rows pinning a point to a target position.
pub struct FixedPointProvider {
    point: PointRef,
    target: [f64; 3],
}

impl FixedPointProvider {
    pub fn new(point: PointRef, target: [f64; 3]) -> Self {
        Self { point, target }
    }
}

impl ResidualProvider for FixedPointProvider {
    fn name(&self) -> &'static str {
        "fixed-point"
    }

    fn residual_count(&self) -> usize {
        3
    }

    fn slots(&self) -> Vec<usize> {
        endpoint_slots(&[self.point])
    }

    fn compute_residuals(&self, x: &DVector<f64>, out: &mut Vec<f64>) {
        for axis in 0..3 {
            out.push(GEOMETRY_WEIGHT * (self.point.axis(x, axis) - self.target[axis]));
        }
    }

    fn compute_jacobian(
        &self,
        _x: &DVector<f64>,
        row_base: usize,
        triples: &mut Vec<(usize, usize, f64)>,
    ) {
        for axis in 0..3 {
            if let Some(col) = self.point.slots[axis] {
                triples.push((row_base + axis, col, GEOMETRY_WEIGHT));
            }
        }
    }
}

/// Perpendicular-offset rows for every interior point of a chain.
///
/// With endpoints `p0`, `pn` and interior point `pi`, the residual block
/// is `(pi − p0) × (pn − p0) / ‖pn − p0‖`, three rows per interior point.
pub struct CollinearProvider {
    points: Vec<PointRef>,
}

impl CollinearProvider {
    pub fn new(points: Vec<PointRef>) -> Self {
        debug_assert!(points.len() >= 3);
        Self { points }
    }

    fn endpoints(&self) -> (&PointRef, &PointRef) {
        (&self.points[0], &self.points[self.points.len() - 1])
    }
}

impl ResidualProvider for CollinearProvider {
    fn name(&self) -> &'static str {
        "collinear-points"
    }

    fn residual_count(&self) -> usize {
        3 * (self.points.len() - 2)
    }

    fn slots(&self) -> Vec<usize> {
        endpoint_slots(&self.points)
    }

    fn compute_residuals(&self, x: &DVector<f64>, out: &mut Vec<f64>) {
        let (first, last) = self.endpoints();
        let p0 = first.position(x);
        let a = last.position(x) - p0;
        let len = a.norm();
        if len < 1e-12 {
            for _ in 0..self.residual_count() {
                out.push(0.0);
            }
            return;
        }
        for interior in &self.points[1..self.points.len() - 1] {
            let u = interior.position(x) - p0;
            let r = u.cross(&a) / len;
            for axis in 0..3 {
                out.push(GEOMETRY_WEIGHT * r[axis]);
            }
        }
    }

    fn compute_jacobian(
        &self,
        x: &DVector<f64>,
        row_base: usize,
        triples: &mut Vec<(usize, usize, f64)>,
    ) {
        let (first, last) = self.endpoints();
        let p0 = first.position(x);
        let a = last.position(x) - p0;
        let len = a.norm();
        if len < 1e-12 {
            return;
        }
        let skew = |v: &Vector3<f64>| {
            Matrix3::new(0.0, -v.z, v.y, v.z, 0.0, -v.x, -v.y, v.x, 0.0)
        };
        let skew_a = skew(&a);

        for (i, interior) in self.points[1..self.points.len() - 1].iter().enumerate() {
            let row = row_base + 3 * i;
            let u = interior.position(x) - p0;
            let cross = u.cross(&a);

            // r = (u × a)/L with u = pi − p0, a = pn − p0
            let d_interior = -skew_a / len;
            let d_last = skew(&u) / len - cross * (a.transpose() / (len * len * len));
            let d_first = -d_interior - d_last;

            for (point, jac) in [
                (interior, &d_interior),
                (last, &d_last),
                (first, &d_first),
            ] {
                for axis_out in 0..3 {
                    for axis_in in 0..3 {
                        if let Some(col) = point.slots[axis_in] {
                            let value = GEOMETRY_WEIGHT * jac[(axis_out, axis_in)];
                            if value != 0.0 {
                                triples.push((row + axis_out, col, value));
                            }
                        }
                    }
                }
            }
        }
    }
}

/// Rows `‖di‖ − ‖d0‖` for every pair after the first.
pub struct EqualDistancesProvider {
    pairs: Vec<(PointRef, PointRef)>,
}

impl EqualDistancesProvider {
    pub fn new(pairs: Vec<(PointRef, PointRef)>) -> Self {
        debug_assert!(pairs.len() >= 2);
        Self { pairs }
    }
}

impl ResidualProvider for EqualDistancesProvider {
    fn name(&self) -> &'static str {
        "equal-distances"
    }

    fn residual_count(&self) -> usize {
        self.pairs.len() - 1
    }

    fn slots(&self) -> Vec<usize> {
        self.pairs
            .iter()
            .flat_map(|(a, b)| endpoint_slots(&[*a, *b]))
            .collect()
    }

    fn compute_residuals(&self, x: &DVector<f64>, out: &mut Vec<f64>) {
        let reference = (self.pairs[0].1.position(x) - self.pairs[0].0.position(x)).norm();
        for (a, b) in &self.pairs[1..] {
            let len = (b.position(x) - a.position(x)).norm();
            out.push(GEOMETRY_WEIGHT * (len - reference));
        }
    }

    fn compute_jacobian(
        &self,
        x: &DVector<f64>,
        row_base: usize,
        triples: &mut Vec<(usize, usize, f64)>,
    ) {
        let (ref_a, ref_b) = &self.pairs[0];
        for (i, (a, b)) in self.pairs[1..].iter().enumerate() {
            let row = row_base + i;
            emit_distance_gradient(x, a, b, row, GEOMETRY_WEIGHT, triples);
            // the reference pair enters negated on every row
            emit_distance_gradient(x, ref_a, ref_b, row, -GEOMETRY_WEIGHT, triples);
        }
    }
}

/// Rows `θi − θ0` for every triplet after the first.
pub struct EqualAnglesProvider {
    triplets: Vec<(PointRef, PointRef, PointRef)>,
}

impl EqualAnglesProvider {
    pub fn new(triplets: Vec<(PointRef, PointRef, PointRef)>) -> Self {
        debug_assert!(triplets.len() >= 2);
        Self { triplets }
    }

    fn eval(&self, x: &DVector<f64>, i: usize) -> AngleEval {
        let (a, v, c) = &self.triplets[i];
        eval_angle(
            &a.position(x).coords,
            &v.position(x).coords,
            &c.position(x).coords,
        )
    }
}

impl ResidualProvider for EqualAnglesProvider {
    fn name(&self) -> &'static str {
        "equal-angles"
    }

    fn residual_count(&self) -> usize {
        self.triplets.len() - 1
    }

    fn slots(&self) -> Vec<usize> {
        self.triplets
            .iter()
            .flat_map(|(a, v, c)| endpoint_slots(&[*a, *v, *c]))
            .collect()
    }

    fn compute_residuals(&self, x: &DVector<f64>, out: &mut Vec<f64>) {
        let reference = self.eval(x, 0).angle;
        for i in 1..self.triplets.len() {
            out.push(GEOMETRY_WEIGHT * (self.eval(x, i).angle - reference));
        }
    }

    fn compute_jacobian(
        &self,
        x: &DVector<f64>,
        row_base: usize,
        triples: &mut Vec<(usize, usize, f64)>,
    ) {
        let reference = self.eval(x, 0);
        let (ref_a, ref_v, ref_c) = &self.triplets[0];
        for i in 1..self.triplets.len() {
            let row = row_base + i - 1;
            let e = self.eval(x, i);
            let (a, v, c) = &self.triplets[i];
            emit_point_gradient(a, &e.grad_a, row, GEOMETRY_WEIGHT, triples);
            emit_point_gradient(v, &e.grad_vertex, row, GEOMETRY_WEIGHT, triples);
            emit_point_gradient(c, &e.grad_c, row, GEOMETRY_WEIGHT, triples);
            emit_point_gradient(ref_a, &reference.grad_a, row, -GEOMETRY_WEIGHT, triples);
            emit_point_gradient(ref_v, &reference.grad_vertex, row, -GEOMETRY_WEIGHT, triples);
            emit_point_gradient(ref_c, &reference.grad_c, row, -GEOMETRY_WEIGHT, triples);
        }
    }
}

/// Signed distance of every member to the best-fit plane of the set.
///
/// The plane is refit at every evaluation (centroid plus smallest
/// principal direction); the Jacobian treats the plane as fixed, the
/// usual Gauss-Newton approximation for eigenvector-valued fits.
pub struct CoplanarProvider {
    points: Vec<PointRef>,
}

impl CoplanarProvider {
    pub fn new(points: Vec<PointRef>) -> Self {
        debug_assert!(points.len() >= 4);
        Self { points }
    }

    fn best_fit_normal(&self, x: &DVector<f64>) -> Option<(Vector3<f64>, Vector3<f64>)> {
        let n = self.points.len() as f64;
        let mut centroid = Vector3::zeros();
        for p in &self.points {
            centroid += p.position(x).coords;
        }
        centroid /= n;

        let mut cov = Matrix3::zeros();
        for p in &self.points {
            let d = p.position(x).coords - centroid;
            cov += d * d.transpose();
        }
        let eigen = nalgebra::linalg::SymmetricEigen::new(cov);
        let mut min_index = 0;
        for k in 1..3 {
            if eigen.eigenvalues[k] < eigen.eigenvalues[min_index] {
                min_index = k;
            }
        }
        let normal = eigen.eigenvectors.column(min_index).into_owned();
        let len = normal.norm();
        if len < 1e-12 {
            return None;
        }
        Some((centroid, normal / len))
    }
}

impl ResidualProvider for CoplanarProvider {
    fn name(&self) -> &'static str {
        "coplanar-points"
    }

    fn residual_count(&self) -> usize {
        self.points.len()
    }

    fn slots(&self) -> Vec<usize> {
        endpoint_slots(&self.points)
    }

    fn compute_residuals(&self, x: &DVector<f64>, out: &mut Vec<f64>) {
        let Some((centroid, normal)) = self.best_fit_normal(x) else {
            for _ in 0..self.points.len() {
                out.push(0.0);
            }
            return;
        };
        for p in &self.points {
            let offset = p.position(x).coords - centroid;
            out.push(GEOMETRY_WEIGHT * normal.dot(&offset));
        }
    }

    fn compute_jacobian(
        &self,
        x: &DVector<f64>,
        row_base: usize,
        triples: &mut Vec<(usize, usize, f64)>,
    ) {
        let Some((_centroid, normal)) = self.best_fit_normal(x) else {
            return;
        };
        let n = self.points.len() as f64;
        for (i, _) in self.points.iter().enumerate() {
            let row = row_base + i;
            for (j, point) in self.points.iter().enumerate() {
                let factor = if i == j { 1.0 - 1.0 / n } else { -1.0 / n };
                let grad = normal * factor;
                emit_point_gradient(point, &grad, row, GEOMETRY_WEIGHT, triples);
            }
        }
    }
}

/// One row per free camera: `‖q‖² − 1`, heavily weighted.
pub struct QuaternionUnitProvider {
    quaternion_base: usize,
}

impl QuaternionUnitProvider {
    pub fn new(quaternion_base: usize) -> Self {
        Self { quaternion_base }
    }
}

impl ResidualProvider for QuaternionUnitProvider {
    fn name(&self) -> &'static str {
        "quaternion-unit"
    }

    fn residual_count(&self) -> usize {
        1
    }

    fn slots(&self) -> Vec<usize> {
        (self.quaternion_base..self.quaternion_base + 4).collect()
    }

    fn compute_residuals(&self, x: &DVector<f64>, out: &mut Vec<f64>) {
        let base = self.quaternion_base;
        let norm_sq =
            x[base] * x[base] + x[base + 1] * x[base + 1] + x[base + 2] * x[base + 2]
                + x[base + 3] * x[base + 3];
        out.push(QUATERNION_UNIT_WEIGHT * (norm_sq - 1.0));
    }

    fn compute_jacobian(
        &self,
        x: &DVector<f64>,
        row_base: usize,
        triples: &mut Vec<(usize, usize, f64)>,
    ) {
        for k in 0..4 {
            let col = self.quaternion_base + k;
            triples.push((row_base, col, QUATERNION_UNIT_WEIGHT * 2.0 * x[col]));
        }
    }
}
