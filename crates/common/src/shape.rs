//! World-space streaming shapes.
//!
//! Shapes are tested on the XZ streaming plane; the height of the center is
//! only used by callers that cull cells vertically.

use glam::{Vec2, Vec3};
use serde::{Deserialize, Serialize};

use crate::bounds::Aabb;

/// A sphere, or a spherical sector (a cone-like wedge used by camera-style
/// sources). `angle` is the full opening angle in degrees.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub enum StreamingShape {
    Sphere {
        center: Vec3,
        radius: f32,
    },
    Sector {
        center: Vec3,
        radius: f32,
        axis: Vec3,
        angle: f32,
    },
}

impl StreamingShape {
    pub fn sphere(center: Vec3, radius: f32) -> Self {
        Self::Sphere {
            center,
            radius: radius.max(0.0),
        }
    }

    /// Sector along `axis`. Angles of 360 degrees or more, or a degenerate
    /// axis, collapse to a sphere.
    pub fn sector(center: Vec3, radius: f32, axis: Vec3, angle: f32) -> Self {
        let axis = Vec2::new(axis.x, axis.z).normalize_or_zero();
        if angle >= 360.0 || axis == Vec2::ZERO {
            return Self::sphere(center, radius);
        }
        Self::Sector {
            center,
            radius: radius.max(0.0),
            axis: Vec3::new(axis.x, 0.0, axis.y),
            angle: angle.max(0.0),
        }
    }

    pub fn center(&self) -> Vec3 {
        match *self {
            Self::Sphere { center, .. } | Self::Sector { center, .. } => center,
        }
    }

    pub fn radius(&self) -> f32 {
        match *self {
            Self::Sphere { radius, .. } | Self::Sector { radius, .. } => radius,
        }
    }

    pub fn is_sector(&self) -> bool {
        matches!(self, Self::Sector { .. })
    }

    /// Box enclosing the shape (full sphere bounds for sectors).
    pub fn bounding_box(&self) -> Aabb {
        Aabb::from_center_extent(self.center(), Vec3::splat(self.radius()))
    }

    pub fn contains_point(&self, p: Vec3) -> bool {
        let c = flat(self.center());
        let q = flat(p);
        if c.distance_squared(q) > self.radius() * self.radius() {
            return false;
        }
        self.within_angle(q)
    }

    /// Whether the shape overlaps the XZ footprint of `b`.
    pub fn intersects_box(&self, b: &Aabb) -> bool {
        let r = self.radius();
        if b.distance_squared_xz(self.center()) > r * r {
            return false;
        }
        let Self::Sector { center, axis, .. } = *self else {
            return true;
        };

        let c = flat(center);
        let (min, max) = b.xz();
        if c.cmpge(min).all() && c.cmple(max).all() {
            return true;
        }

        let corners = [min, Vec2::new(max.x, min.y), max, Vec2::new(min.x, max.y)];
        if corners.iter().any(|&k| self.contains_point(Vec3::new(k.x, 0.0, k.y))) {
            return true;
        }

        let closest = c.clamp(min, max);
        if self.contains_point(Vec3::new(closest.x, 0.0, closest.y)) {
            return true;
        }

        let half = self.half_angle_radians();
        let a = Vec2::new(axis.x, axis.z);
        [a, Vec2::from_angle(half).rotate(a), Vec2::from_angle(-half).rotate(a)]
            .iter()
            .any(|dir| segment_hits_rect(c, c + *dir * r, min, max))
    }

    fn half_angle_radians(&self) -> f32 {
        match *self {
            Self::Sphere { .. } => std::f32::consts::PI,
            Self::Sector { angle, .. } => (angle * 0.5).to_radians(),
        }
    }

    fn within_angle(&self, q: Vec2) -> bool {
        let Self::Sector { center, axis, .. } = *self else {
            return true;
        };
        let to_point = (q - flat(center)).normalize_or_zero();
        if to_point == Vec2::ZERO {
            return true;
        }
        let cos = to_point.dot(Vec2::new(axis.x, axis.z)).clamp(-1.0, 1.0);
        cos.acos() <= self.half_angle_radians() + 1e-5
    }
}

fn flat(v: Vec3) -> Vec2 {
    Vec2::new(v.x, v.z)
}

/// Slab test of segment `a..b` against the rectangle `[min, max]`.
fn segment_hits_rect(a: Vec2, b: Vec2, min: Vec2, max: Vec2) -> bool {
    let d = b - a;
    let mut t0 = 0.0_f32;
    let mut t1 = 1.0_f32;
    for axis in 0..2 {
        if d[axis].abs() < f32::EPSILON {
            if a[axis] < min[axis] || a[axis] > max[axis] {
                return false;
            }
            continue;
        }
        let inv = 1.0 / d[axis];
        let mut near = (min[axis] - a[axis]) * inv;
        let mut far = (max[axis] - a[axis]) * inv;
        if near > far {
            std::mem::swap(&mut near, &mut far);
        }
        t0 = t0.max(near);
        t1 = t1.min(far);
        if t0 > t1 {
            return false;
        }
    }
    true
}
