use serde::{Deserialize, Serialize};

use crate::{
    Arena, Constraint, ConstraintId, ImagePoint, ImagePointId, Line, LineId, VanishingLine,
    VanishingLineId, Viewpoint, ViewpointId, WorldPoint, WorldPointId,
};

/// Structural problem detected by [`Project::check_consistency`].
#[derive(Debug, Clone, thiserror::Error, PartialEq)]
pub enum ProjectError {
    #[error("image point {0} references missing world point {1}")]
    DanglingWorldPoint(ImagePointId, WorldPointId),
    #[error("image point {0} references missing viewpoint {1}")]
    DanglingViewpoint(ImagePointId, ViewpointId),
    #[error("line {0} references a missing endpoint")]
    DanglingLineEndpoint(LineId),
    #[error("vanishing line {0} references missing viewpoint {1}")]
    DanglingVanishingLine(VanishingLineId, ViewpointId),
    #[error("constraint {0} references a missing entity")]
    DanglingConstraint(ConstraintId),
}

/// Root of the entity graph.
///
/// Owns every collection; cross references are arena ids. The solve
/// pipeline treats the structure as immutable (outlier removal of image
/// points excepted) and mutates numeric entity fields only.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct Project {
    pub name: String,
    pub world_points: Arena<WorldPointId, WorldPoint>,
    pub viewpoints: Arena<ViewpointId, Viewpoint>,
    pub image_points: Arena<ImagePointId, ImagePoint>,
    pub vanishing_lines: Arena<VanishingLineId, VanishingLine>,
    pub lines: Arena<LineId, Line>,
    pub constraints: Arena<ConstraintId, Constraint>,
}

impl Project {
    pub fn new<S: Into<String>>(name: S) -> Self {
        Self {
            name: name.into(),
            ..Default::default()
        }
    }

    pub fn add_world_point(&mut self, point: WorldPoint) -> WorldPointId {
        self.world_points.insert(point)
    }

    pub fn add_viewpoint(&mut self, viewpoint: Viewpoint) -> ViewpointId {
        self.viewpoints.insert(viewpoint)
    }

    pub fn add_image_point(&mut self, image_point: ImagePoint) -> ImagePointId {
        self.image_points.insert(image_point)
    }

    pub fn add_vanishing_line(&mut self, vl: VanishingLine) -> VanishingLineId {
        self.vanishing_lines.insert(vl)
    }

    pub fn add_line(&mut self, line: Line) -> LineId {
        self.lines.insert(line)
    }

    pub fn add_constraint(&mut self, constraint: Constraint) -> ConstraintId {
        self.constraints.insert(constraint)
    }

    pub fn world_point_by_name(&self, name: &str) -> Option<(WorldPointId, &WorldPoint)> {
        self.world_points.iter().find(|(_, p)| p.name == name)
    }

    pub fn viewpoint_by_name(&self, name: &str) -> Option<(ViewpointId, &Viewpoint)> {
        self.viewpoints.iter().find(|(_, v)| v.name == name)
    }

    /// Observations made by one viewpoint, in insertion order.
    pub fn observations_of(
        &self,
        viewpoint: ViewpointId,
    ) -> impl Iterator<Item = (ImagePointId, &ImagePoint)> {
        self.image_points
            .iter()
            .filter(move |(_, ip)| ip.viewpoint == viewpoint)
    }

    /// World points observed by both viewpoints, in insertion order.
    pub fn shared_points(&self, a: ViewpointId, b: ViewpointId) -> Vec<WorldPointId> {
        let mut seen_a: Vec<WorldPointId> = Vec::new();
        for (_, ip) in self.observations_of(a) {
            if !seen_a.contains(&ip.world_point) {
                seen_a.push(ip.world_point);
            }
        }
        let mut shared = Vec::new();
        for (_, ip) in self.observations_of(b) {
            if seen_a.contains(&ip.world_point) && !shared.contains(&ip.world_point) {
                shared.push(ip.world_point);
            }
        }
        shared
    }

    /// The observation of `point` from `viewpoint`, if any.
    pub fn observation_of_point(
        &self,
        viewpoint: ViewpointId,
        point: WorldPointId,
    ) -> Option<(ImagePointId, &ImagePoint)> {
        self.observations_of(viewpoint)
            .find(|(_, ip)| ip.world_point == point)
    }

    /// Vanishing lines drawn on one viewpoint.
    pub fn vanishing_lines_of(
        &self,
        viewpoint: ViewpointId,
    ) -> impl Iterator<Item = (VanishingLineId, &VanishingLine)> {
        self.vanishing_lines
            .iter()
            .filter(move |(_, vl)| vl.viewpoint == viewpoint)
    }

    /// Clear all inferred and optimized state, leaving user input intact.
    pub fn reset_optimization_state(&mut self) {
        for (_, p) in self.world_points.iter_mut() {
            p.inferred_xyz = [None; 3];
            p.optimized_xyz = None;
            p.last_rms = None;
        }
        for (_, ip) in self.image_points.iter_mut() {
            ip.last_residuals = None;
        }
    }

    /// Verify every cross reference resolves; warn (but do not fail) on
    /// under-observed cameras.
    pub fn check_consistency(&self) -> Result<(), ProjectError> {
        for (id, ip) in self.image_points.iter() {
            if !self.world_points.contains(ip.world_point) {
                return Err(ProjectError::DanglingWorldPoint(id, ip.world_point));
            }
            if !self.viewpoints.contains(ip.viewpoint) {
                return Err(ProjectError::DanglingViewpoint(id, ip.viewpoint));
            }
        }
        for (id, line) in self.lines.iter() {
            if !self.world_points.contains(line.a) || !self.world_points.contains(line.b) {
                return Err(ProjectError::DanglingLineEndpoint(id));
            }
        }
        for (id, vl) in self.vanishing_lines.iter() {
            if !self.viewpoints.contains(vl.viewpoint) {
                return Err(ProjectError::DanglingVanishingLine(id, vl.viewpoint));
            }
        }
        for (id, c) in self.constraints.iter() {
            let points_ok = c
                .world_points()
                .iter()
                .all(|&p| self.world_points.contains(p));
            let lines_ok = c.lines().iter().all(|&l| self.lines.contains(l));
            if !points_ok || !lines_ok {
                return Err(ProjectError::DanglingConstraint(id));
            }
        }

        for (vp_id, vp) in self.viewpoints.iter() {
            let n = self.observations_of(vp_id).count();
            if vp.enabled_in_solve && n < 2 {
                tracing::warn!(
                    "viewpoint {:?} has observed {} world points",
                    vp.name,
                    n
                );
            }
        }
        Ok(())
    }
}
