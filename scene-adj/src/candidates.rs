use std::collections::BTreeMap;

use itertools::Itertools;
use nalgebra::{Matrix3, Point2, Point3, UnitQuaternion, Vector2, Vector3};

use scene_mvg::{
    essential, extrinsics, pnp, triangulate, vanishing, Camera, MvgError, SeededRng,
};
use scene_types::{Constraint, LineId, Project, ViewpointId, WorldPointId};

use crate::infer::propagate_inferences;

/// Default camera-to-scene distance used when nothing pins the position.
const DEFAULT_VIEW_DISTANCE: f64 = 10.0;
/// Default baseline when no scale information is available.
const DEFAULT_BASELINE: f64 = 10.0;

#[derive(Debug, Clone, thiserror::Error, PartialEq)]
pub enum InitError {
    #[error("anchor viewpoint is missing or disabled")]
    MissingAnchor,
    #[error("vanishing-point initialization failed: {0}")]
    VanishingPoints(MvgError),
    #[error("PnP initialization failed: {0}")]
    Pnp(MvgError),
    #[error("essential-matrix initialization failed: {0}")]
    Essential(MvgError),
}

/// How a candidate bootstraps its anchor camera.
#[derive(Debug, Clone, PartialEq)]
pub enum PlanKind {
    /// Rotation (and possibly focal) from vanishing points; the axis-sign
    /// ambiguity is searched internally by reprojection score.
    VanishingPoints,
    /// Resection from fully-known world points.
    Pnp,
    /// Two-view relative pose against a partner viewpoint.
    Essential { partner: ViewpointId },
    /// No initialization; refine the poses already in the project.
    KeepPoses,
}

/// One concrete initialization plan tried by the orchestrator.
#[derive(Debug, Clone, PartialEq)]
pub struct CandidatePlan {
    pub description: String,
    pub anchor: Option<ViewpointId>,
    pub kind: PlanKind,
    /// Free the anchor's principal point before solving.
    pub relax_principal_point: bool,
    /// Sign branches committed for ambiguous inferred lines.
    pub sign_overrides: BTreeMap<LineId, f64>,
}

/// Seed-pair ranking score, ordered by
/// (scale knowledge, fully-known shared points, shared points).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct SeedScore {
    pub has_scale: bool,
    pub known_shared: usize,
    pub shared: usize,
}

/// What a plan managed to place.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct InitOutcome {
    pub cameras_initialized: Vec<String>,
    pub cameras_excluded: Vec<String>,
}

/// A world point's pre-solve coordinates (locked or inferred tiers only).
fn known_point(project: &Project, id: WorldPointId) -> Option<Point3<f64>> {
    let p = project.world_points.get(id)?;
    let axis = |i: usize| p.locked_xyz[i].or(p.inferred_xyz[i]);
    Some(Point3::new(axis(0)?, axis(1)?, axis(2)?))
}

/// Rank viewpoint pairs for two-view seeding, best first.
pub fn rank_seed_pairs(project: &Project) -> Vec<(ViewpointId, ViewpointId, SeedScore)> {
    let enabled: Vec<ViewpointId> = project
        .viewpoints
        .iter()
        .filter(|(_, vp)| vp.enabled_in_solve)
        .map(|(id, _)| id)
        .collect();

    let mut scored = Vec::new();
    for (&a, &b) in enabled.iter().tuple_combinations() {
        let shared = project.shared_points(a, b);
        if shared.is_empty() {
            continue;
        }
        let known_shared = shared
            .iter()
            .filter(|&&p| known_point(project, p).is_some())
            .count();
        let has_scale = known_shared >= 2 || pair_has_distance_constraint(project, &shared);
        scored.push((
            a,
            b,
            SeedScore {
                has_scale,
                known_shared,
                shared: shared.len(),
            },
        ));
    }
    // stable sort keeps arena order among equals
    scored.sort_by(|x, y| y.2.cmp(&x.2));
    scored
}

fn pair_has_distance_constraint(project: &Project, shared: &[WorldPointId]) -> bool {
    project.constraints.iter().any(|(_, c)| match c {
        Constraint::Distance { a, b, .. } => shared.contains(a) && shared.contains(b),
        _ => false,
    })
}

/// Explicit plus virtual vanishing-line segments of one viewpoint,
/// grouped per axis.
///
/// A virtual vanishing line is an axis-direction world line both of whose
/// endpoints are observed in the viewpoint; the segment between the two
/// image points vanishes toward the same point as the drawn lines.
pub fn vanishing_segments(
    project: &Project,
    viewpoint: ViewpointId,
) -> [Vec<(Point2<f64>, Point2<f64>)>; 3] {
    let mut segments: [Vec<(Point2<f64>, Point2<f64>)>; 3] =
        [Vec::new(), Vec::new(), Vec::new()];

    for (_, vl) in project.vanishing_lines_of(viewpoint) {
        segments[vl.axis.index()].push((vl.p1, vl.p2));
    }
    for (_, line) in project.lines.iter() {
        let Some(axis) = line.direction.axis() else {
            continue;
        };
        let a = project.observation_of_point(viewpoint, line.a);
        let b = project.observation_of_point(viewpoint, line.b);
        if let (Some((_, a)), Some((_, b))) = (a, b) {
            segments[axis.index()].push((a.uv, b.uv));
        }
    }
    segments
}

/// Enumerate initialization plans, best-guess first. The orchestrator
/// truncates to `max_attempts`.
pub fn enumerate_candidates(project: &Project, max_attempts: usize) -> Vec<CandidatePlan> {
    let mut plans = Vec::new();

    // probe inference on a scratch copy to learn the ambiguous branches
    let ambiguous = {
        let mut scratch = project.clone();
        propagate_inferences(&mut scratch, &BTreeMap::new())
    };

    // vanishing-point anchors, most axes first
    let mut vp_anchors: Vec<(ViewpointId, usize, usize)> = project
        .viewpoints
        .iter()
        .filter(|(_, vp)| vp.enabled_in_solve)
        .filter_map(|(id, _)| {
            let segments = vanishing_segments(project, id);
            let axes = segments.iter().filter(|s| s.len() >= 2).count();
            let total: usize = segments.iter().map(|s| s.len()).sum();
            (axes >= 2).then_some((id, axes, total))
        })
        .collect();
    vp_anchors.sort_by(|a, b| (b.1, b.2).cmp(&(a.1, a.2)));

    for (id, _, _) in &vp_anchors {
        let name = &project.viewpoints.get(*id).unwrap().name;
        plans.push(CandidatePlan {
            description: format!("vanishing-point rotation of {name}"),
            anchor: Some(*id),
            kind: PlanKind::VanishingPoints,
            relax_principal_point: false,
            sign_overrides: BTreeMap::new(),
        });
    }

    // PnP anchors, most known points first
    let mut pnp_anchors: Vec<(ViewpointId, usize)> = {
        let mut scratch = project.clone();
        propagate_inferences(&mut scratch, &BTreeMap::new());
        scratch
            .viewpoints
            .iter()
            .filter(|(_, vp)| vp.enabled_in_solve && !vp.is_pose_locked)
            .filter_map(|(id, _)| {
                let known = scratch
                    .observations_of(id)
                    .filter(|(_, ip)| known_point(&scratch, ip.world_point).is_some())
                    .count();
                (known >= 3).then_some((id, known))
            })
            .collect()
    };
    pnp_anchors.sort_by(|a, b| b.1.cmp(&a.1));

    for (id, known) in &pnp_anchors {
        let name = &project.viewpoints.get(*id).unwrap().name;
        plans.push(CandidatePlan {
            description: format!("PnP resection of {name} from {known} known points"),
            anchor: Some(*id),
            kind: PlanKind::Pnp,
            relax_principal_point: false,
            sign_overrides: BTreeMap::new(),
        });
    }

    // best seed pair for essential-matrix bootstrap
    for (a, b, score) in rank_seed_pairs(project) {
        if score.shared < 8 {
            continue;
        }
        let name_a = &project.viewpoints.get(a).unwrap().name;
        let name_b = &project.viewpoints.get(b).unwrap().name;
        plans.push(CandidatePlan {
            description: format!("essential-matrix seed pair {name_a} / {name_b}"),
            anchor: Some(a),
            kind: PlanKind::Essential { partner: b },
            relax_principal_point: false,
            sign_overrides: BTreeMap::new(),
        });
        break;
    }

    plans.push(CandidatePlan {
        description: "refine current poses".into(),
        anchor: None,
        kind: PlanKind::KeepPoses,
        relax_principal_point: false,
        sign_overrides: BTreeMap::new(),
    });

    // branch variants of the most promising plan: the flipped sign of the
    // first ambiguous inferred line, then a relaxed principal point
    let mut variants = Vec::new();
    if let Some(first) = plans.first() {
        if let Some(&line) = ambiguous.first() {
            let mut flipped = first.clone();
            flipped.description = format!("{} (flipped inference branch)", first.description);
            flipped.sign_overrides.insert(line, -1.0);
            variants.push(flipped);
        }
        if first.anchor.is_some() && !matches!(first.kind, PlanKind::KeepPoses) {
            let mut relaxed = first.clone();
            relaxed.description = format!("{} (relaxed principal point)", first.description);
            relaxed.relax_principal_point = true;
            variants.push(relaxed);
        }
    }
    plans.extend(variants);
    plans.truncate(max_attempts.max(1));
    plans
}

/// Apply a plan to the project: propagate inferences, place the anchor
/// (and partner), then bootstrap remaining cameras and world points.
pub fn apply_plan(
    project: &mut Project,
    plan: &CandidatePlan,
    auto_initialize_cameras: bool,
    auto_initialize_world_points: bool,
    rng: &mut SeededRng,
) -> Result<InitOutcome, InitError> {
    propagate_inferences(project, &plan.sign_overrides);

    let mut outcome = InitOutcome::default();
    let mut placed: Vec<ViewpointId> = project
        .viewpoints
        .iter()
        .filter(|(_, vp)| vp.enabled_in_solve && vp.is_pose_locked)
        .map(|(id, _)| id)
        .collect();

    if let (Some(anchor), true) = (plan.anchor, plan.relax_principal_point) {
        if let Some(vp) = project.viewpoints.get_mut(anchor) {
            vp.is_possibly_cropped = true;
        }
    }

    if auto_initialize_cameras {
        match &plan.kind {
            PlanKind::VanishingPoints => {
                let anchor = plan.anchor.ok_or(InitError::MissingAnchor)?;
                initialize_with_vanishing_points(project, anchor)
                    .map_err(InitError::VanishingPoints)?;
                mark_placed(project, anchor, &mut placed, &mut outcome);
            }
            PlanKind::Pnp => {
                let anchor = plan.anchor.ok_or(InitError::MissingAnchor)?;
                initialize_with_pnp(project, anchor).map_err(InitError::Pnp)?;
                mark_placed(project, anchor, &mut placed, &mut outcome);
            }
            PlanKind::Essential { partner } => {
                let anchor = plan.anchor.ok_or(InitError::MissingAnchor)?;
                initialize_with_essential_matrix(project, anchor, *partner)
                    .map_err(InitError::Essential)?;
                mark_placed(project, anchor, &mut placed, &mut outcome);
                mark_placed(project, *partner, &mut placed, &mut outcome);
            }
            PlanKind::KeepPoses => {
                for (id, vp) in project.viewpoints.iter() {
                    if vp.enabled_in_solve && !placed.contains(&id) {
                        placed.push(id);
                    }
                }
            }
        }
    } else {
        for (id, vp) in project.viewpoints.iter() {
            if vp.enabled_in_solve && !placed.contains(&id) {
                placed.push(id);
            }
        }
    }

    if auto_initialize_world_points {
        bootstrap_remaining(project, &mut placed, &mut outcome, rng);
    }

    // enabled cameras that never got a pose cannot contribute residuals
    let unplaced: Vec<ViewpointId> = project
        .viewpoints
        .iter()
        .filter(|(id, vp)| vp.enabled_in_solve && !placed.contains(id))
        .map(|(id, _)| id)
        .collect();
    for id in unplaced {
        let vp = project.viewpoints.get_mut(id).expect("viewpoint");
        vp.enabled_in_solve = false;
        outcome.cameras_excluded.push(vp.name.clone());
    }

    Ok(outcome)
}

fn mark_placed(
    project: &Project,
    id: ViewpointId,
    placed: &mut Vec<ViewpointId>,
    outcome: &mut InitOutcome,
) {
    if !placed.contains(&id) {
        placed.push(id);
        if let Some(vp) = project.viewpoints.get(id) {
            outcome.cameras_initialized.push(vp.name.clone());
        }
    }
}

/// Rotation (and focal) from the anchor's vanishing points, searching the
/// axis-sign ambiguity by reprojection score over known points.
fn initialize_with_vanishing_points(
    project: &mut Project,
    anchor: ViewpointId,
) -> Result<(), MvgError> {
    let segments = vanishing_segments(project, anchor);
    let mut vps: [Option<Point2<f64>>; 3] = [None; 3];
    for axis in 0..3 {
        if segments[axis].len() >= 2 {
            vps[axis] = Some(vanishing::vanishing_point(&segments[axis])?);
        }
    }
    let known_axes: Vec<usize> = (0..3).filter(|&i| vps[i].is_some()).collect();
    if known_axes.len() < 2 {
        return Err(MvgError::NotEnoughVanishingLines);
    }

    let (intrinsics, is_focal_locked) = {
        let vp = project.viewpoints.get(anchor).expect("anchor");
        (vp.intrinsics.clone(), vp.is_focal_locked)
    };
    let known_focal = is_focal_locked.then_some(intrinsics.focal_length);

    let anchored: Vec<(Point3<f64>, Point2<f64>)> = project
        .observations_of(anchor)
        .filter_map(|(_, ip)| known_point(project, ip.world_point).map(|p| (p, ip.uv)))
        .collect();

    // search the 2^k axis-sign combinations; pick the lowest reprojection
    // score (ties keep the earliest combination)
    let mut best: Option<(f64, vanishing::VpRotationInit, Option<Point3<f64>>)> = None;
    let combos = 1usize << known_axes.len();
    for combo in 0..combos {
        let mut signs = [1.0; 3];
        for (bit, &axis) in known_axes.iter().enumerate() {
            if combo & (1 << bit) != 0 {
                signs[axis] = -1.0;
            }
        }
        let Ok(init) = vanishing::rotation_from_vanishing_points(
            &vps,
            intrinsics.principal_point,
            known_focal,
            intrinsics.aspect_ratio,
            signs,
        ) else {
            continue;
        };

        let mut trial_intrinsics = intrinsics.clone();
        if let Some(f) = init.focal_length {
            trial_intrinsics.focal_length = f;
        }
        let position = if anchored.len() >= 2 {
            extrinsics::position_from_observations(&init.rotation, &trial_intrinsics, &anchored)
                .ok()
        } else {
            None
        };
        let score = match position {
            Some(position) => {
                let camera = Camera::new(trial_intrinsics, position, init.rotation, false);
                anchored
                    .iter()
                    .map(|(p, uv)| {
                        camera
                            .reprojection_distance(p, uv)
                            .unwrap_or(scene_mvg::BEHIND_CAMERA_PENALTY)
                    })
                    .sum::<f64>()
            }
            None => combo as f64, // nothing to score against; keep order
        };

        if best.as_ref().map(|(s, _, _)| score < *s).unwrap_or(true) {
            best = Some((score, init, position));
        }
    }

    let (_, init, position) = best.ok_or(MvgError::VanishingPointsNotOrthogonal)?;

    let vp = project.viewpoints.get_mut(anchor).expect("anchor");
    vp.rotation = init.rotation;
    vp.is_z_reflected = false;
    if let Some(f) = init.focal_length {
        vp.intrinsics.focal_length = f;
    }
    if vp.is_possibly_cropped {
        if let Some(pp) = init.principal_point {
            vp.intrinsics.principal_point = pp;
        }
    }
    vp.position = match position {
        Some(p) => p,
        None => {
            // back the camera away from the origin along its optical axis
            let r = vp.rotation.to_rotation_matrix().into_inner();
            Point3::from(-(r.transpose() * Vector3::new(0.0, 0.0, DEFAULT_VIEW_DISTANCE)))
        }
    };
    Ok(())
}

fn initialize_with_pnp(project: &mut Project, anchor: ViewpointId) -> Result<(), MvgError> {
    let observations: Vec<(Point3<f64>, Point2<f64>)> = project
        .observations_of(anchor)
        .filter_map(|(_, ip)| known_point(project, ip.world_point).map(|p| (p, ip.uv)))
        .collect();
    let intrinsics = project
        .viewpoints
        .get(anchor)
        .expect("anchor")
        .intrinsics
        .clone();
    let solution = pnp::resect_camera(&intrinsics, &observations)?;
    let vp = project.viewpoints.get_mut(anchor).expect("anchor");
    vp.rotation = solution.rotation;
    vp.position = solution.position;
    vp.is_z_reflected = false;
    Ok(())
}

/// Two-view bootstrap. The relative reconstruction is carried into the
/// world frame with a Kabsch-Umeyama similarity when at least three
/// shared points are known; otherwise the anchor keeps its pose and only
/// the baseline is scaled (from two known points, or a default).
fn initialize_with_essential_matrix(
    project: &mut Project,
    anchor: ViewpointId,
    partner: ViewpointId,
) -> Result<(), MvgError> {
    let shared = project.shared_points(anchor, partner);
    if shared.len() < 8 {
        return Err(MvgError::NotEnoughPoints);
    }

    let cam_a = Camera::from_viewpoint(project.viewpoints.get(anchor).expect("anchor"));
    let cam_b = Camera::from_viewpoint(project.viewpoints.get(partner).expect("partner"));

    let normalized = |camera: &Camera, uv: &Point2<f64>| -> Vector2<f64> {
        let i = camera.intrinsics();
        Vector2::new(
            (uv.x - i.principal_point.x) / i.fx(),
            (i.principal_point.y - uv.y) / i.fy(),
        )
    };

    let pairs: Vec<(Vector2<f64>, Vector2<f64>)> = shared
        .iter()
        .map(|&p| {
            let (_, a) = project.observation_of_point(anchor, p).expect("shared");
            let (_, b) = project.observation_of_point(partner, p).expect("shared");
            (normalized(&cam_a, &a.uv), normalized(&cam_b, &b.uv))
        })
        .collect();

    let pose = essential::two_view_pose(&pairs, 1.0)?;

    // triangulate the shared points in the anchor camera frame
    let o2 = pose.camera2_center();
    let reconstructed: Vec<Option<Point3<f64>>> = pairs
        .iter()
        .map(|(x1, x2)| {
            let d1 = Vector3::new(x1.x, x1.y, 1.0);
            let d2 = pose.rotation.transpose() * Vector3::new(x2.x, x2.y, 1.0);
            triangulate::midpoint(&Point3::origin(), &d1, &o2, &d2).ok()
        })
        .collect();

    let known: Vec<(Point3<f64>, Point3<f64>)> = shared
        .iter()
        .zip(&reconstructed)
        .filter_map(|(&id, rec)| {
            let world = known_point(project, id)?;
            rec.map(|r| (r, world))
        })
        .collect();

    let r1_old = project
        .viewpoints
        .get(anchor)
        .expect("anchor")
        .rotation
        .to_rotation_matrix()
        .into_inner();
    let t1_old = project.viewpoints.get(anchor).expect("anchor").position;

    let (r1, t1, r2, t2) = if known.len() >= 3 {
        let x = nalgebra::Matrix3xX::from_columns(
            &known.iter().map(|(r, _)| r.coords).collect::<Vec<_>>(),
        );
        let y = nalgebra::Matrix3xX::from_columns(
            &known.iter().map(|(_, w)| w.coords).collect::<Vec<_>>(),
        );
        let sim = scene_mvg::align_points::align_points(&x, &y, true)?;
        if sim.scale <= 0.0 {
            return Err(MvgError::UnreliablePose("negative similarity scale"));
        }
        // world = s·Rw·q + tw  ⇒  anchor extrinsics R1 = Rwᵀ, center tw
        let r1 = sim.rotation.transpose();
        let t1 = Point3::from(sim.translation);
        let r2 = pose.rotation * r1;
        let t2 = Point3::from(t1.coords + sim.rotation * (o2.coords * sim.scale));
        (r1, t1, r2, t2)
    } else {
        // anchor keeps its pose; only the baseline is scaled
        let scale = match known.len() {
            2 => {
                let rec = (known[0].0 - known[1].0).norm();
                let world = (known[0].1 - known[1].1).norm();
                if rec < 1e-12 {
                    return Err(MvgError::DegenerateRays);
                }
                world / rec
            }
            _ => DEFAULT_BASELINE / o2.coords.norm().max(1e-12),
        };
        let r2 = pose.rotation * r1_old;
        let t2 = Point3::from(t1_old.coords + r1_old.transpose() * (o2.coords * scale));
        (r1_old, t1_old, r2, t2)
    };

    let quat = |m: Matrix3<f64>| {
        UnitQuaternion::from_rotation_matrix(&nalgebra::Rotation3::from_matrix_unchecked(m))
    };
    {
        let vp = project.viewpoints.get_mut(anchor).expect("anchor");
        if !vp.is_pose_locked {
            vp.rotation = quat(r1);
            vp.position = t1;
            vp.is_z_reflected = false;
        }
    }
    {
        let vp = project.viewpoints.get_mut(partner).expect("partner");
        if !vp.is_pose_locked {
            vp.rotation = quat(r2);
            vp.position = t2;
            vp.is_z_reflected = false;
        }
    }
    Ok(())
}

/// Triangulate unknown points from placed cameras and resect remaining
/// cameras from known points, iterating until nothing changes.
fn bootstrap_remaining(
    project: &mut Project,
    placed: &mut Vec<ViewpointId>,
    outcome: &mut InitOutcome,
    rng: &mut SeededRng,
) {
    let mut rng = rng.scoped(11);
    loop {
        let mut progressed = false;

        // resect cameras that see enough known points; doing cameras
        // first lets the point pass below triangulate from two views
        // instead of guessing a depth
        let camera_ids: Vec<ViewpointId> = project
            .viewpoints
            .iter()
            .filter(|(id, vp)| vp.enabled_in_solve && !placed.contains(id))
            .map(|(id, _)| id)
            .collect();
        for id in camera_ids {
            let observations: Vec<(Point3<f64>, Point2<f64>)> = project
                .observations_of(id)
                .filter_map(|(_, ip)| {
                    let p = project.world_points.get(ip.world_point)?;
                    p.effective_xyz().map(|w| (w, ip.uv))
                })
                .collect();
            if observations.len() < 3 {
                continue;
            }
            let intrinsics = project.viewpoints.get(id).expect("camera").intrinsics.clone();
            if let Ok(solution) = pnp::resect_camera(&intrinsics, &observations) {
                let vp = project.viewpoints.get_mut(id).expect("camera");
                vp.rotation = solution.rotation;
                vp.position = solution.position;
                vp.is_z_reflected = false;
                mark_placed(project, id, placed, outcome);
                progressed = true;
            }
        }

        // triangulate world points seen by at least two placed cameras;
        // single-view points get a jittered default depth along their ray
        let point_ids: Vec<WorldPointId> = project.world_points.ids().collect();
        for id in &point_ids {
            let point = project.world_points.get(*id).expect("point");
            if point.effective_xyz().is_some() {
                continue;
            }
            let rays: Vec<(Point3<f64>, Vector3<f64>)> = placed
                .iter()
                .filter_map(|&vp_id| {
                    let (_, ip) = project.observation_of_point(vp_id, *id)?;
                    let camera =
                        Camera::from_viewpoint(project.viewpoints.get(vp_id).expect("placed"));
                    Some(camera.pixel_ray(&ip.uv))
                })
                .collect();
            let estimate = match rays.len() {
                0 => None,
                1 => {
                    let (origin, dir) = rays[0];
                    let depth = DEFAULT_VIEW_DISTANCE * rng.range(0.8, 1.2);
                    Some(origin + dir * depth)
                }
                _ => triangulate::rays_intersection(&rays).ok(),
            };
            if let Some(p) = estimate {
                project
                    .world_points
                    .get_mut(*id)
                    .expect("point")
                    .optimized_xyz = Some([p.x, p.y, p.z]);
                progressed = true;
            }
        }

        if !progressed {
            break;
        }
    }
}
