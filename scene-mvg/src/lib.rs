//! Camera geometry and multi-view initialization algorithms for
//! constraint-driven scene reconstruction.
//!
//! This crate turns [`scene_types`] viewpoints into projective [`Camera`]s
//! and provides the geometric estimators that bootstrap a bundle
//! adjustment: vanishing-point rotation recovery, essential-matrix
//! two-view pose, perspective-3-point resectioning, ray triangulation,
//! and similarity alignment of point sets.
//!
//! ## Pixel convention
//!
//! A world point `p` observed by a camera with rotation `R` (world to
//! camera) and center `t` has camera coordinates `c = R·(p − t)` with the
//! optical axis along +z. Pixels are
//!
//! ```text
//! u = fx·c.x/c.z + skew·c.y/c.z + cx
//! v = cy − fy·c.y/c.z
//! ```
//!
//! so the image v axis grows downward while camera y grows upward. All
//! estimators in this crate use this convention.
#![deny(rust_2018_idioms)]

use thiserror::Error;

pub mod align_points;
pub mod camera;
pub mod essential;
pub mod extrinsics;
pub mod pnp;
pub mod rng;
pub mod triangulate;
pub mod vanishing;

pub use camera::{Camera, Projection, BEHIND_CAMERA_PENALTY, NEAR_PLANE};
pub use rng::SeededRng;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum MvgError {
    #[error("not enough points")]
    NotEnoughPoints,
    #[error("not enough vanishing lines")]
    NotEnoughVanishingLines,
    #[error("degenerate vanishing point")]
    DegenerateVanishingPoint,
    #[error("vanishing points are not consistent with an orthogonal triad")]
    VanishingPointsNotOrthogonal,
    #[error("SVD failed")]
    SvdFailed,
    #[error("rays are parallel or nearly parallel")]
    DegenerateRays,
    #[error("no valid root found")]
    NoValidRootFound,
    #[error("recovered pose is unreliable: {0}")]
    UnreliablePose(&'static str),
    #[error("linear system is rank deficient")]
    RankDeficient,
}

pub type Result<T> = std::result::Result<T, MvgError>;
