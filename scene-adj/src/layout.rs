use std::collections::BTreeMap;

use nalgebra::{DVector, Point2, Point3, UnitQuaternion};

use scene_mvg::SeededRng;
use scene_types::{Project, ViewpointId, WorldPointId};

/// What one slot of the variable vector holds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlotKey {
    /// One free axis of a world point.
    PointAxis(WorldPointId, usize),
    /// One component of a camera center.
    CameraPosition(ViewpointId, usize),
    /// One quaternion component, ordered `w, x, y, z`.
    CameraQuaternion(ViewpointId, usize),
    CameraFocal(ViewpointId),
    /// Principal point component, `0 = x`, `1 = y`.
    CameraPrincipal(ViewpointId, usize),
}

/// Slot bases of one free camera; each `Some` is the first of a
/// consecutive run (3 position, 4 quaternion, 2 principal point).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct CameraSlots {
    pub position: Option<usize>,
    pub quaternion: Option<usize>,
    pub focal: Option<usize>,
    pub principal: Option<usize>,
}

/// Resolves a world point to either slots or fixed values.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PointRef {
    pub id: WorldPointId,
    pub slots: [Option<usize>; 3],
    pub fixed: [f64; 3],
}

impl PointRef {
    pub fn position(&self, x: &DVector<f64>) -> Point3<f64> {
        Point3::new(self.axis(x, 0), self.axis(x, 1), self.axis(x, 2))
    }

    #[inline]
    pub fn axis(&self, x: &DVector<f64>, i: usize) -> f64 {
        match self.slots[i] {
            Some(slot) => x[slot],
            None => self.fixed[i],
        }
    }
}

/// Resolves a camera's pose and intrinsics to slots or fixed values.
#[derive(Debug, Clone, PartialEq)]
pub struct CameraRef {
    pub id: ViewpointId,
    pub slots: CameraSlots,
    pub fixed_position: Point3<f64>,
    /// `w, x, y, z`.
    pub fixed_quaternion: [f64; 4],
    pub fixed_focal: f64,
    pub fixed_principal: Point2<f64>,
    pub aspect_ratio: f64,
    pub skew: f64,
    /// −1 when the viewpoint is z-reflected.
    pub z_sign: f64,
}

impl CameraRef {
    pub fn position(&self, x: &DVector<f64>) -> Point3<f64> {
        match self.slots.position {
            Some(base) => Point3::new(x[base], x[base + 1], x[base + 2]),
            None => self.fixed_position,
        }
    }

    /// Raw quaternion components `w, x, y, z`; near-unit during a solve
    /// but not renormalized here.
    pub fn quaternion_raw(&self, x: &DVector<f64>) -> [f64; 4] {
        match self.slots.quaternion {
            Some(base) => [x[base], x[base + 1], x[base + 2], x[base + 3]],
            None => self.fixed_quaternion,
        }
    }

    pub fn focal(&self, x: &DVector<f64>) -> f64 {
        match self.slots.focal {
            Some(slot) => x[slot],
            None => self.fixed_focal,
        }
    }

    pub fn principal_point(&self, x: &DVector<f64>) -> Point2<f64> {
        match self.slots.principal {
            Some(base) => Point2::new(x[base], x[base + 1]),
            None => self.fixed_principal,
        }
    }
}

/// Flat variable vector over the free entity fields of a project.
///
/// Slots are appended in arena order: world points first (one slot per
/// non-locked axis), then enabled, non-pose-locked viewpoints (position,
/// quaternion, focal unless locked, principal point iff possibly
/// cropped). Assignment is stable for the lifetime of the layout.
#[derive(Debug, Clone, PartialEq)]
pub struct VariableLayout {
    slots: Vec<SlotKey>,
    point_refs: BTreeMap<WorldPointId, PointRef>,
    camera_refs: BTreeMap<ViewpointId, CameraRef>,
}

impl VariableLayout {
    pub fn build(project: &Project) -> Self {
        let mut slots = Vec::new();
        let mut point_refs = BTreeMap::new();
        let mut camera_refs = BTreeMap::new();

        for (id, point) in project.world_points.iter() {
            let mut point_slots = [None; 3];
            let mut fixed = [0.0; 3];
            for axis in 0..3 {
                if point.locked_xyz[axis].is_some() {
                    fixed[axis] = point.locked_xyz[axis].unwrap();
                } else {
                    point_slots[axis] = Some(slots.len());
                    slots.push(SlotKey::PointAxis(id, axis));
                }
            }
            point_refs.insert(
                id,
                PointRef {
                    id,
                    slots: point_slots,
                    fixed,
                },
            );
        }

        for (id, vp) in project.viewpoints.iter() {
            let mut cam_slots = CameraSlots::default();
            let free_pose = vp.enabled_in_solve && !vp.is_pose_locked;
            if free_pose {
                cam_slots.position = Some(slots.len());
                for i in 0..3 {
                    slots.push(SlotKey::CameraPosition(id, i));
                }
                cam_slots.quaternion = Some(slots.len());
                for i in 0..4 {
                    slots.push(SlotKey::CameraQuaternion(id, i));
                }
                if !vp.is_focal_locked {
                    cam_slots.focal = Some(slots.len());
                    slots.push(SlotKey::CameraFocal(id));
                }
                if vp.is_possibly_cropped {
                    cam_slots.principal = Some(slots.len());
                    for i in 0..2 {
                        slots.push(SlotKey::CameraPrincipal(id, i));
                    }
                }
            }
            let q = vp.rotation.quaternion();
            camera_refs.insert(
                id,
                CameraRef {
                    id,
                    slots: cam_slots,
                    fixed_position: vp.position,
                    fixed_quaternion: [q.w, q.i, q.j, q.k],
                    fixed_focal: vp.intrinsics.focal_length,
                    fixed_principal: vp.intrinsics.principal_point,
                    aspect_ratio: vp.intrinsics.aspect_ratio,
                    skew: vp.intrinsics.skew,
                    z_sign: if vp.is_z_reflected { -1.0 } else { 1.0 },
                },
            );
        }

        Self {
            slots,
            point_refs,
            camera_refs,
        }
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    pub fn slot_key(&self, slot: usize) -> SlotKey {
        self.slots[slot]
    }

    pub fn point_ref(&self, id: WorldPointId) -> Option<&PointRef> {
        self.point_refs.get(&id)
    }

    pub fn camera_ref(&self, id: ViewpointId) -> Option<&CameraRef> {
        self.camera_refs.get(&id)
    }

    pub fn camera_refs(&self) -> impl Iterator<Item = (&ViewpointId, &CameraRef)> {
        self.camera_refs.iter()
    }

    /// Free cameras (those holding quaternion slots), in arena order.
    pub fn free_cameras(&self) -> Vec<&CameraRef> {
        let mut cams: Vec<&CameraRef> = self
            .camera_refs
            .values()
            .filter(|c| c.slots.quaternion.is_some())
            .collect();
        cams.sort_by_key(|c| c.slots.quaternion);
        cams
    }

    /// Initial variable vector from entity state.
    ///
    /// Free point axes read their effective value; axes with no value at
    /// all are jittered near the origin from the layout's RNG stream so a
    /// degenerate start still breaks symmetry deterministically.
    pub fn initial_vector(&self, project: &Project, rng: &mut SeededRng) -> DVector<f64> {
        let mut x = DVector::zeros(self.slots.len());
        for (i, key) in self.slots.iter().enumerate() {
            x[i] = match *key {
                SlotKey::PointAxis(id, axis) => {
                    let point = project.world_points.get(id).expect("layout point");
                    match point.effective_axis(axis) {
                        Some(v) => v,
                        None => rng.range(-1.0, 1.0),
                    }
                }
                SlotKey::CameraPosition(id, k) => {
                    project.viewpoints.get(id).expect("layout camera").position[k]
                }
                SlotKey::CameraQuaternion(id, k) => {
                    let q = project.viewpoints.get(id).expect("layout camera").rotation;
                    let q = q.quaternion();
                    [q.w, q.i, q.j, q.k][k]
                }
                SlotKey::CameraFocal(id) => {
                    project
                        .viewpoints
                        .get(id)
                        .expect("layout camera")
                        .intrinsics
                        .focal_length
                }
                SlotKey::CameraPrincipal(id, k) => {
                    let pp = project
                        .viewpoints
                        .get(id)
                        .expect("layout camera")
                        .intrinsics
                        .principal_point;
                    [pp.x, pp.y][k]
                }
            };
        }
        x
    }

    /// Renormalize every free quaternion in `x` to unit length.
    pub fn normalize_quaternions(&self, x: &mut DVector<f64>) {
        for cam in self.camera_refs.values() {
            if let Some(base) = cam.slots.quaternion {
                let norm = (x[base] * x[base]
                    + x[base + 1] * x[base + 1]
                    + x[base + 2] * x[base + 2]
                    + x[base + 3] * x[base + 3])
                    .sqrt();
                if norm > 1e-12 {
                    for k in 0..4 {
                        x[base + k] /= norm;
                    }
                }
            }
        }
    }

    /// Write the variable vector back into entity fields.
    ///
    /// Every world point receives a complete `optimized_xyz` triple
    /// (locked axes repeat their locked value); free cameras receive
    /// position, unit rotation, and any free intrinsics.
    pub fn write_back(&self, x: &DVector<f64>, project: &mut Project) {
        for point_ref in self.point_refs.values() {
            let p = point_ref.position(x);
            if let Some(point) = project.world_points.get_mut(point_ref.id) {
                point.optimized_xyz = Some([p.x, p.y, p.z]);
            }
        }
        for cam in self.camera_refs.values() {
            let Some(vp) = project.viewpoints.get_mut(cam.id) else {
                continue;
            };
            if cam.slots.position.is_some() {
                vp.position = cam.position(x);
            }
            if cam.slots.quaternion.is_some() {
                let [w, i, j, k] = cam.quaternion_raw(x);
                vp.rotation =
                    UnitQuaternion::from_quaternion(nalgebra::Quaternion::new(w, i, j, k));
            }
            if cam.slots.focal.is_some() {
                vp.intrinsics.focal_length = cam.focal(x);
            }
            if cam.slots.principal.is_some() {
                vp.intrinsics.principal_point = cam.principal_point(x);
            }
        }
    }
}
