//! Entity data model for constraint-driven scene reconstruction.
//!
//! A [`Project`] is the root of an entity graph: named 3D [`WorldPoint`]s,
//! calibrated-or-not [`Viewpoint`]s (camera + image), 2D [`ImagePoint`]
//! observations linking the two, axis-tagged [`VanishingLine`]s, [`Line`]s
//! between world points, and geometric [`Constraint`]s.
//!
//! The graph is cyclic (observations reference both their world point and
//! their viewpoint), so entities live in typed arenas and reference each
//! other through stable integer ids. Arena iteration order is insertion
//! order, which downstream code relies on for reproducible variable-slot
//! assignment.
//!
//! This crate holds data and bookkeeping only; all geometry and
//! optimization lives downstream.

use nalgebra::{Point2, Point3, UnitQuaternion};
use serde::{Deserialize, Serialize};

mod arena;
mod constraint;
mod project;

pub use arena::{Arena, ArenaIndex};
pub use constraint::Constraint;
pub use project::{Project, ProjectError};

/// Internal id-definition helper; ids are transparent `u32` indices.
macro_rules! define_id {
    ($name:ident, $doc:expr) => {
        #[doc = $doc]
        #[derive(
            Debug,
            Clone,
            Copy,
            PartialEq,
            Eq,
            PartialOrd,
            Ord,
            Hash,
            Serialize,
            Deserialize,
        )]
        #[serde(transparent)]
        pub struct $name(pub u32);

        impl $crate::ArenaIndex for $name {
            #[inline]
            fn from_index(index: usize) -> Self {
                $name(index as u32)
            }
            #[inline]
            fn index(self) -> usize {
                self.0 as usize
            }
        }

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                write!(f, "{}#{}", stringify!($name), self.0)
            }
        }
    };
}

define_id!(WorldPointId, "Identifies a [`WorldPoint`] within a project.");
define_id!(ViewpointId, "Identifies a [`Viewpoint`] within a project.");
define_id!(ImagePointId, "Identifies an [`ImagePoint`] within a project.");
define_id!(VanishingLineId, "Identifies a [`VanishingLine`] within a project.");
define_id!(LineId, "Identifies a [`Line`] within a project.");
define_id!(ConstraintId, "Identifies a [`Constraint`] within a project.");

/// One of the three principal scene directions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Axis {
    X,
    Y,
    Z,
}

impl Axis {
    /// All axes, in coordinate order.
    pub const ALL: [Axis; 3] = [Axis::X, Axis::Y, Axis::Z];

    /// Coordinate index of this axis (x → 0, y → 1, z → 2).
    #[inline]
    pub fn index(self) -> usize {
        match self {
            Axis::X => 0,
            Axis::Y => 1,
            Axis::Z => 2,
        }
    }

    /// Unit vector along this axis.
    pub fn unit(self) -> nalgebra::Vector3<f64> {
        match self {
            Axis::X => nalgebra::Vector3::x(),
            Axis::Y => nalgebra::Vector3::y(),
            Axis::Z => nalgebra::Vector3::z(),
        }
    }

    /// The two coordinate indices perpendicular to this axis.
    pub fn off_axis_indices(self) -> [usize; 2] {
        match self {
            Axis::X => [1, 2],
            Axis::Y => [0, 2],
            Axis::Z => [0, 1],
        }
    }
}

/// A named 3D point in scene coordinates.
///
/// Coordinates come in three tiers. `locked_xyz` axes are user-supplied
/// ground truth and never move during a solve. `inferred_xyz` axes are
/// deduced from constraints before solving; the solver seeds its variables
/// there but may move them. `optimized_xyz` is the solver's estimate. The
/// *effective* coordinate per axis is the first present of
/// locked / inferred / optimized.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorldPoint {
    pub name: String,
    /// Display color, RGB. Carried for the host; the core never reads it.
    pub color: [u8; 3],
    pub locked_xyz: [Option<f64>; 3],
    pub inferred_xyz: [Option<f64>; 3],
    pub optimized_xyz: Option<[f64; 3]>,
    /// RMS of this point's per-observation reprojection residuals from the
    /// most recent solve.
    pub last_rms: Option<f64>,
}

impl WorldPoint {
    pub fn new<S: Into<String>>(name: S) -> Self {
        Self {
            name: name.into(),
            color: [255, 255, 255],
            locked_xyz: [None; 3],
            inferred_xyz: [None; 3],
            optimized_xyz: None,
            last_rms: None,
        }
    }

    /// Lock all three axes to `xyz`.
    pub fn with_locked(mut self, xyz: [f64; 3]) -> Self {
        self.locked_xyz = [Some(xyz[0]), Some(xyz[1]), Some(xyz[2])];
        self
    }

    /// Effective coordinate along one axis: locked, else inferred, else
    /// optimized, else `None`.
    pub fn effective_axis(&self, axis: usize) -> Option<f64> {
        self.locked_xyz[axis]
            .or(self.inferred_xyz[axis])
            .or(self.optimized_xyz.map(|p| p[axis]))
    }

    /// Effective position when every axis has a value.
    pub fn effective_xyz(&self) -> Option<Point3<f64>> {
        Some(Point3::new(
            self.effective_axis(0)?,
            self.effective_axis(1)?,
            self.effective_axis(2)?,
        ))
    }

    /// True when all three axes are locked.
    pub fn is_fully_locked(&self) -> bool {
        self.locked_xyz.iter().all(|a| a.is_some())
    }

    /// True when all three axes have a locked or inferred value.
    pub fn is_fully_known(&self) -> bool {
        (0..3).all(|i| self.locked_xyz[i].is_some() || self.inferred_xyz[i].is_some())
    }

    /// Latest solve statistics for this point.
    pub fn optimization_info(&self) -> OptimizationInfo {
        OptimizationInfo {
            rms_residual: self.last_rms,
        }
    }
}

/// Per-point report of the most recent solve.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct OptimizationInfo {
    pub rms_residual: Option<f64>,
}

/// Camera intrinsic parameters.
///
/// `fx = focal_length`, `fy = focal_length * aspect_ratio`. Distortion
/// coefficients follow the Brown-Conrady ordering (k1, k2, k3 radial;
/// p1, p2 tangential) and are carried but typically zero.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Intrinsics {
    pub focal_length: f64,
    pub aspect_ratio: f64,
    pub principal_point: Point2<f64>,
    pub skew: f64,
    pub radial_distortion: [f64; 3],
    pub tangential_distortion: [f64; 2],
}

impl Intrinsics {
    pub fn new(focal_length: f64, principal_point: Point2<f64>) -> Self {
        Self {
            focal_length,
            aspect_ratio: 1.0,
            principal_point,
            skew: 0.0,
            radial_distortion: [0.0; 3],
            tangential_distortion: [0.0; 2],
        }
    }

    #[inline]
    pub fn fx(&self) -> f64 {
        self.focal_length
    }

    #[inline]
    pub fn fy(&self) -> f64 {
        self.focal_length * self.aspect_ratio
    }

    /// True when all five distortion coefficients are zero.
    pub fn is_linear(&self) -> bool {
        self.radial_distortion.iter().all(|&k| k == 0.0)
            && self.tangential_distortion.iter().all(|&p| p == 0.0)
    }
}

/// A camera and its image.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Viewpoint {
    pub name: String,
    pub image_width: u32,
    pub image_height: u32,
    pub intrinsics: Intrinsics,
    /// Camera center in world coordinates.
    pub position: Point3<f64>,
    /// World-to-camera rotation, `[w, x, y, z]`.
    pub rotation: UnitQuaternion<f64>,
    /// Excluded from the solve entirely when false.
    pub enabled_in_solve: bool,
    /// Position and rotation contribute no free variables when true.
    pub is_pose_locked: bool,
    /// Focal length contributes no free variable when true.
    pub is_focal_locked: bool,
    /// The principal point is freed (two extra variables) when true.
    pub is_possibly_cropped: bool,
    /// Compensates a handedness flip baked into the rotation by an
    /// external tool; projection negates camera coordinates when set.
    /// Initialization here always recovers right-handed rotations and
    /// leaves this false.
    pub is_z_reflected: bool,
}

impl Viewpoint {
    pub fn new<S: Into<String>>(name: S, image_width: u32, image_height: u32) -> Self {
        let principal_point =
            Point2::new(image_width as f64 / 2.0, image_height as f64 / 2.0);
        Self {
            name: name.into(),
            image_width,
            image_height,
            intrinsics: Intrinsics::new(image_width as f64, principal_point),
            position: Point3::origin(),
            rotation: UnitQuaternion::identity(),
            enabled_in_solve: true,
            is_pose_locked: false,
            is_focal_locked: false,
            is_possibly_cropped: false,
            is_z_reflected: false,
        }
    }
}

/// A 2D observation of a world point in one image.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ImagePoint {
    pub viewpoint: ViewpointId,
    pub world_point: WorldPointId,
    /// Pixel coordinates of the hand-clicked feature.
    pub uv: Point2<f64>,
    /// The `[du, dv]` residual from the most recent evaluation.
    pub last_residuals: Option<[f64; 2]>,
}

impl ImagePoint {
    pub fn new(viewpoint: ViewpointId, world_point: WorldPointId, uv: Point2<f64>) -> Self {
        Self {
            viewpoint,
            world_point,
            uv,
            last_residuals: None,
        }
    }
}

/// A 2D line segment drawn in an image, tagged with the 3D axis whose
/// parallel lines it belongs to.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VanishingLine {
    pub viewpoint: ViewpointId,
    pub axis: Axis,
    pub p1: Point2<f64>,
    pub p2: Point2<f64>,
}

/// Direction annotation of a [`Line`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LineDirection {
    X,
    Y,
    Z,
    /// No direction constraint.
    #[default]
    Free,
    /// Constrained to lie in the ground plane (zero Y component).
    Plane,
}

impl LineDirection {
    /// The axis this direction pins the line to, if any.
    pub fn axis(self) -> Option<Axis> {
        match self {
            LineDirection::X => Some(Axis::X),
            LineDirection::Y => Some(Axis::Y),
            LineDirection::Z => Some(Axis::Z),
            LineDirection::Free | LineDirection::Plane => None,
        }
    }
}

/// A line between two world points.
///
/// Contributes to inference propagation and, when annotated, to the
/// residual system: a direction pulls the off-axis displacement components
/// to zero, a target length pulls the endpoint distance to it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Line {
    pub a: WorldPointId,
    pub b: WorldPointId,
    pub direction: LineDirection,
    pub target_length: Option<f64>,
    /// Residual tolerance; weights the line's residuals by its inverse.
    pub tolerance: Option<f64>,
}

impl Line {
    pub fn new(a: WorldPointId, b: WorldPointId) -> Self {
        Self {
            a,
            b,
            direction: LineDirection::Free,
            target_length: None,
            tolerance: None,
        }
    }

    pub fn with_direction(mut self, direction: LineDirection) -> Self {
        self.direction = direction;
        self
    }

    pub fn with_target_length(mut self, target_length: f64) -> Self {
        self.target_length = Some(target_length);
        self
    }

    /// Residual weight, `1/tolerance` when a tolerance is set.
    pub fn weight(&self) -> f64 {
        match self.tolerance {
            Some(t) if t > 0.0 => 1.0 / t,
            _ => 1.0,
        }
    }
}
