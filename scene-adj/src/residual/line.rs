use nalgebra::{DVector, Vector3};

use scene_types::{Line, LineDirection};

use crate::layout::PointRef;
use crate::residual::{ResidualProvider, GEOMETRY_WEIGHT};

/// One row: `‖b − a‖ − target`, scaled by the line weight.
pub struct LineLengthProvider {
    a: PointRef,
    b: PointRef,
    target: f64,
    weight: f64,
}

impl LineLengthProvider {
    pub fn new(a: PointRef, b: PointRef, target: f64, line_weight: f64) -> Self {
        Self {
            a,
            b,
            target,
            weight: GEOMETRY_WEIGHT * line_weight,
        }
    }
}

impl ResidualProvider for LineLengthProvider {
    fn name(&self) -> &'static str {
        "line-length"
    }

    fn residual_count(&self) -> usize {
        1
    }

    fn slots(&self) -> Vec<usize> {
        endpoint_slots(&[self.a, self.b])
    }

    fn compute_residuals(&self, x: &DVector<f64>, out: &mut Vec<f64>) {
        let d = self.b.position(x) - self.a.position(x);
        out.push(self.weight * (d.norm() - self.target));
    }

    fn compute_jacobian(
        &self,
        x: &DVector<f64>,
        row_base: usize,
        triples: &mut Vec<(usize, usize, f64)>,
    ) {
        let d = self.b.position(x) - self.a.position(x);
        let len = d.norm();
        if len < 1e-12 {
            // coincident endpoints: no usable direction
            return;
        }
        let unit = d / len;
        for axis in 0..3 {
            if let Some(col) = self.b.slots[axis] {
                triples.push((row_base, col, self.weight * unit[axis]));
            }
            if let Some(col) = self.a.slots[axis] {
                triples.push((row_base, col, -self.weight * unit[axis]));
            }
        }
    }
}

/// Off-axis displacement rows for a direction-annotated line.
///
/// An axis direction yields two rows (both perpendicular components of
/// `b − a` pulled to zero); the ground-plane direction yields one row
/// (the y component).
pub struct LineDirectionProvider {
    a: PointRef,
    b: PointRef,
    components: Vec<usize>,
    weight: f64,
}

impl LineDirectionProvider {
    pub fn for_line(line: &Line, a: PointRef, b: PointRef) -> Option<Self> {
        let components = match line.direction {
            LineDirection::Free => return None,
            LineDirection::Plane => vec![1],
            _ => {
                let axis = line.direction.axis().expect("axis direction");
                axis.off_axis_indices().to_vec()
            }
        };
        Some(Self {
            a,
            b,
            components,
            weight: GEOMETRY_WEIGHT * line.weight(),
        })
    }
}

impl ResidualProvider for LineDirectionProvider {
    fn name(&self) -> &'static str {
        "line-direction"
    }

    fn residual_count(&self) -> usize {
        self.components.len()
    }

    fn slots(&self) -> Vec<usize> {
        endpoint_slots(&[self.a, self.b])
    }

    fn compute_residuals(&self, x: &DVector<f64>, out: &mut Vec<f64>) {
        let d: Vector3<f64> = self.b.position(x) - self.a.position(x);
        for &component in &self.components {
            out.push(self.weight * d[component]);
        }
    }

    fn compute_jacobian(
        &self,
        _x: &DVector<f64>,
        row_base: usize,
        triples: &mut Vec<(usize, usize, f64)>,
    ) {
        for (row_offset, &component) in self.components.iter().enumerate() {
            let row = row_base + row_offset;
            if let Some(col) = self.b.slots[component] {
                triples.push((row, col, self.weight));
            }
            if let Some(col) = self.a.slots[component] {
                triples.push((row, col, -self.weight));
            }
        }
    }
}

pub(crate) fn endpoint_slots(points: &[PointRef]) -> Vec<usize> {
    points
        .iter()
        .flat_map(|p| p.slots.iter().flatten().copied())
        .collect()
}
