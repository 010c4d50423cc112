use std::collections::BTreeMap;

use scene_types::{Constraint, LineId, Project, WorldPointId};

/// Upper bound on fixed-point rounds; each round either pins at least one
/// new axis or terminates, so this is never reached in practice.
const MAX_ROUNDS: usize = 32;

/// Deduce coordinates of partially-locked points from axis-aligned lines
/// and point-set constraints, iterating to a fixed point.
///
/// Results land in `inferred_xyz`; locked axes are never overwritten.
/// A line with an axis direction equates the two off-axis coordinates of
/// its endpoints; with a target length and one fully-known endpoint it
/// additionally determines the other endpoint's on-axis coordinate up to
/// sign. The sign defaults to `+1`; `sign_overrides` lets the candidate
/// layer commit the other branch per line. The returned list names every
/// line where such a choice was taken.
pub fn propagate_inferences(
    project: &mut Project,
    sign_overrides: &BTreeMap<LineId, f64>,
) -> Vec<LineId> {
    let mut ambiguous = Vec::new();

    for _ in 0..MAX_ROUNDS {
        let mut changed = false;

        changed |= propagate_lines(project, sign_overrides, &mut ambiguous);
        changed |= propagate_constraints(project);

        if !changed {
            break;
        }
    }
    ambiguous.sort();
    ambiguous.dedup();
    ambiguous
}

fn known_axis(project: &Project, id: WorldPointId, axis: usize) -> Option<f64> {
    let p = project.world_points.get(id)?;
    p.locked_xyz[axis].or(p.inferred_xyz[axis])
}

fn set_inferred(project: &mut Project, id: WorldPointId, axis: usize, value: f64) -> bool {
    let Some(p) = project.world_points.get_mut(id) else {
        return false;
    };
    if p.locked_xyz[axis].is_some() || p.inferred_xyz[axis].is_some() {
        return false;
    }
    p.inferred_xyz[axis] = Some(value);
    true
}

fn fully_known(project: &Project, id: WorldPointId) -> bool {
    (0..3).all(|axis| known_axis(project, id, axis).is_some())
}

fn propagate_lines(
    project: &mut Project,
    sign_overrides: &BTreeMap<LineId, f64>,
    ambiguous: &mut Vec<LineId>,
) -> bool {
    let line_ids: Vec<LineId> = project.lines.ids().collect();
    let mut changed = false;

    for line_id in line_ids {
        let line = project.lines.get(line_id).expect("line id").clone();
        let Some(axis) = line.direction.axis() else {
            if line.direction == scene_types::LineDirection::Plane {
                // in-plane lines equate the y coordinate
                changed |= equate_axis(project, line.a, line.b, 1);
            }
            continue;
        };
        let axis_index = axis.index();

        // off-axis coordinates are equal on both endpoints
        for off in axis.off_axis_indices() {
            changed |= equate_axis(project, line.a, line.b, off);
        }

        // a target length determines the on-axis coordinate up to sign
        if let Some(length) = line.target_length {
            let sign = sign_overrides.get(&line_id).copied().unwrap_or(1.0);
            for (from, to, direction) in [(line.a, line.b, 1.0), (line.b, line.a, -1.0)] {
                if fully_known(project, from) && known_axis(project, to, axis_index).is_none() {
                    let base = known_axis(project, from, axis_index).expect("known endpoint");
                    if set_inferred(
                        project,
                        to,
                        axis_index,
                        base + sign * direction * length,
                    ) {
                        ambiguous.push(line_id);
                        changed = true;
                    }
                }
            }
        }
    }
    changed
}

/// Copy a known coordinate across a pair of points in either direction.
fn equate_axis(project: &mut Project, a: WorldPointId, b: WorldPointId, axis: usize) -> bool {
    let mut changed = false;
    if let Some(value) = known_axis(project, a, axis) {
        changed |= set_inferred(project, b, axis, value);
    }
    if let Some(value) = known_axis(project, b, axis) {
        changed |= set_inferred(project, a, axis, value);
    }
    changed
}

fn propagate_constraints(project: &mut Project) -> bool {
    let constraints: Vec<Constraint> =
        project.constraints.iter().map(|(_, c)| c.clone()).collect();
    let mut changed = false;

    for constraint in constraints {
        match constraint {
            Constraint::FixedPoint { point, target } => {
                for axis in 0..3 {
                    changed |= set_inferred(project, point, axis, target[axis]);
                }
            }
            Constraint::CoplanarPoints { points } => {
                changed |= propagate_axis_plane(project, &points);
            }
            Constraint::CollinearPoints { points } => {
                changed |= propagate_axis_chain(project, &points);
            }
            _ => {}
        }
    }
    changed
}

/// When at least three known members of a coplanar set share one axis
/// coordinate, the plane is axis-aligned and the remaining members
/// inherit that coordinate.
fn propagate_axis_plane(project: &mut Project, points: &[WorldPointId]) -> bool {
    let mut changed = false;
    for axis in 0..3 {
        let known: Vec<f64> = points
            .iter()
            .filter_map(|&p| known_axis(project, p, axis))
            .collect();
        if known.len() < 3 || known.len() == points.len() {
            continue;
        }
        let value = known[0];
        if known.iter().all(|&v| (v - value).abs() < 1e-9) {
            for &p in points {
                changed |= set_inferred(project, p, axis, value);
            }
        }
    }
    changed
}

/// When two known members of a collinear chain differ along exactly one
/// axis, the chain is axis-aligned and every member inherits the two
/// off-axis coordinates.
fn propagate_axis_chain(project: &mut Project, points: &[WorldPointId]) -> bool {
    let known: Vec<(WorldPointId, [f64; 3])> = points
        .iter()
        .filter_map(|&p| {
            let xyz = [
                known_axis(project, p, 0)?,
                known_axis(project, p, 1)?,
                known_axis(project, p, 2)?,
            ];
            Some((p, xyz))
        })
        .collect();
    if known.len() < 2 {
        return false;
    }
    let (_, a) = known[0];
    let (_, b) = known[1];
    let differs: Vec<usize> = (0..3).filter(|&k| (a[k] - b[k]).abs() > 1e-9).collect();
    if differs.len() != 1 {
        return false;
    }
    let mut changed = false;
    for axis in 0..3 {
        if axis == differs[0] {
            continue;
        }
        for &p in points {
            changed |= set_inferred(project, p, axis, a[axis]);
        }
    }
    changed
}
