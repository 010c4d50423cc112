use serde::{Deserialize, Serialize};

use crate::{LineId, WorldPointId};

/// A geometric constraint between world points and lines.
///
/// Each variant maps to one or more residual equations in the solver; the
/// data here is pure structure (ids and targets).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Constraint {
    /// `‖b − a‖` equals `target`.
    Distance {
        a: WorldPointId,
        b: WorldPointId,
        target: f64,
    },
    /// The angle at `vertex` between rays to `a` and `c` equals
    /// `target_degrees`.
    Angle {
        a: WorldPointId,
        vertex: WorldPointId,
        c: WorldPointId,
        target_degrees: f64,
    },
    /// The two lines have parallel directions.
    ParallelLines { a: LineId, b: LineId },
    /// The two lines have perpendicular directions.
    PerpendicularLines { a: LineId, b: LineId },
    /// The point sits at `target`.
    FixedPoint {
        point: WorldPointId,
        target: [f64; 3],
    },
    /// All points lie on one line.
    CollinearPoints { points: Vec<WorldPointId> },
    /// Every pair is the same length as the first pair.
    EqualDistances {
        pairs: Vec<(WorldPointId, WorldPointId)>,
    },
    /// Every `(a, vertex, c)` triplet spans the same angle as the first.
    EqualAngles {
        triplets: Vec<(WorldPointId, WorldPointId, WorldPointId)>,
    },
    /// All points lie on one plane.
    CoplanarPoints { points: Vec<WorldPointId> },
}

impl Constraint {
    /// Every world point referenced by this constraint.
    pub fn world_points(&self) -> Vec<WorldPointId> {
        match self {
            Constraint::Distance { a, b, .. } => vec![*a, *b],
            Constraint::Angle { a, vertex, c, .. } => vec![*a, *vertex, *c],
            Constraint::ParallelLines { .. } | Constraint::PerpendicularLines { .. } => {
                Vec::new()
            }
            Constraint::FixedPoint { point, .. } => vec![*point],
            Constraint::CollinearPoints { points } | Constraint::CoplanarPoints { points } => {
                points.clone()
            }
            Constraint::EqualDistances { pairs } => {
                pairs.iter().flat_map(|&(a, b)| [a, b]).collect()
            }
            Constraint::EqualAngles { triplets } => triplets
                .iter()
                .flat_map(|&(a, v, c)| [a, v, c])
                .collect(),
        }
    }

    /// Every line referenced by this constraint.
    pub fn lines(&self) -> Vec<LineId> {
        match self {
            Constraint::ParallelLines { a, b } | Constraint::PerpendicularLines { a, b } => {
                vec![*a, *b]
            }
            _ => Vec::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn referenced_ids() {
        let c = Constraint::Angle {
            a: WorldPointId(0),
            vertex: WorldPointId(1),
            c: WorldPointId(2),
            target_degrees: 90.0,
        };
        assert_eq!(
            c.world_points(),
            vec![WorldPointId(0), WorldPointId(1), WorldPointId(2)]
        );
        assert!(c.lines().is_empty());

        let c = Constraint::PerpendicularLines {
            a: LineId(3),
            b: LineId(4),
        };
        assert!(c.world_points().is_empty());
        assert_eq!(c.lines(), vec![LineId(3), LineId(4)]);
    }

    #[test]
    fn serde_tagging_round_trip() {
        let c = Constraint::EqualDistances {
            pairs: vec![
                (WorldPointId(0), WorldPointId(1)),
                (WorldPointId(2), WorldPointId(3)),
            ],
        };
        let json = serde_json::to_string(&c).unwrap();
        assert!(json.contains("\"kind\":\"equal_distances\""));
        let back: Constraint = serde_json::from_str(&json).unwrap();
        assert_eq!(back, c);
    }
}
