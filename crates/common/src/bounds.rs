use glam::{Vec2, Vec3};
use serde::{Deserialize, Serialize};

/// Axis-aligned world-space box.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Aabb {
    pub min: Vec3,
    pub max: Vec3,
}

impl Aabb {
    pub fn new(min: Vec3, max: Vec3) -> Self {
        Self {
            min: min.min(max),
            max: min.max(max),
        }
    }

    pub fn from_center_extent(center: Vec3, extent: Vec3) -> Self {
        Self::new(center - extent, center + extent)
    }

    pub fn center(&self) -> Vec3 {
        (self.min + self.max) * 0.5
    }

    /// Half size along each axis.
    pub fn extent(&self) -> Vec3 {
        (self.max - self.min) * 0.5
    }

    pub fn contains_point(&self, p: Vec3) -> bool {
        p.cmpge(self.min).all() && p.cmple(self.max).all()
    }

    pub fn intersects(&self, other: &Aabb) -> bool {
        self.min.cmple(other.max).all() && self.max.cmpge(other.min).all()
    }

    pub fn distance_squared_to_point(&self, p: Vec3) -> f32 {
        let clamped = p.clamp(self.min, self.max);
        clamped.distance_squared(p)
    }

    /// Box projected on the XZ streaming plane, as (min, max).
    pub fn xz(&self) -> (Vec2, Vec2) {
        (
            Vec2::new(self.min.x, self.min.z),
            Vec2::new(self.max.x, self.max.z),
        )
    }

    /// Squared distance from `p` to the box, ignoring height.
    pub fn distance_squared_xz(&self, p: Vec3) -> f32 {
        let (min, max) = self.xz();
        let q = Vec2::new(p.x, p.z);
        q.clamp(min, max).distance_squared(q)
    }

    /// Whether the vertical span overlaps `[lo, hi]`.
    pub fn overlaps_y(&self, lo: f32, hi: f32) -> bool {
        self.min.y <= hi && self.max.y >= lo
    }
}
