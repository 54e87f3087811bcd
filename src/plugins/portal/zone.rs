//! Geometry of the trigger volume surrounding a portal.
//!
//! All queries take the portal frame explicitly. In that frame the portal surface is the local XY
//! plane and `forward()` (local -Z) is the inward normal: an object whose signed distance becomes
//! positive has crossed the portal.

use bevy::prelude::*;

/// Volume used to detect objects approaching or crossing a portal plane.
#[derive(Debug, Clone, PartialEq)]
pub enum TriggerShape {
    Box { half_extents: Vec3 },
    /// Arbitrary mesh volume, queried through its local bounding box.
    Mesh { vertices: Vec<Vec3> },
}

impl TriggerShape {
    pub fn cuboid(hx: f32, hy: f32, hz: f32) -> TriggerShape {
        TriggerShape::Box {
            half_extents: Vec3::new(hx, hy, hz),
        }
    }

    /// Local space bounds of the volume.
    pub fn local_bounds(&self) -> (Vec3, Vec3) {
        match self {
            TriggerShape::Box { half_extents } => (-*half_extents, *half_extents),
            TriggerShape::Mesh { vertices } if vertices.is_empty() => (Vec3::ZERO, Vec3::ZERO),
            TriggerShape::Mesh { vertices } => vertices.iter().fold(
                (Vec3::splat(f32::MAX), Vec3::splat(f32::MIN)),
                |(min, max), v| (min.min(*v), max.max(*v)),
            ),
        }
    }

    /// Half size of the portal surface, in the portal plane.
    pub fn surface_half_size(&self) -> Vec2 {
        let (min, max) = self.local_bounds();
        let extents = (max - min) * 0.5;
        Vec2::new(extents.x, extents.y)
    }

    /// Closest point of the portal surface to `point`, in world space.
    pub fn closest_point_on_surface(&self, portal: &Transform, point: Vec3) -> Vec3 {
        let (min, max) = self.local_bounds();
        let center = (min + max) * 0.5;
        let half = self.surface_half_size();
        let local = to_local(portal, point);
        let on_surface = Vec3::new(
            local.x.clamp(center.x - half.x, center.x + half.x),
            local.y.clamp(center.y - half.y, center.y + half.y),
            0.,
        );
        portal.translation + portal.rotation * on_surface
    }

    /// Signed distance from the portal surface along the inward normal. Positive once the point
    /// went through the portal.
    pub fn signed_distance(&self, portal: &Transform, point: Vec3) -> f32 {
        (point - self.closest_point_on_surface(portal, point)).dot(portal.forward())
    }

    pub fn contains(&self, portal: &Transform, point: Vec3) -> bool {
        let (min, max) = self.local_bounds();
        let local = to_local(portal, point);
        local.cmpge(min).all() && local.cmple(max).all()
    }

    /// Sweep a capsule of the given radius and half height (along the portal's vertical axis)
    /// from `start` to `end`, and check whether it overlaps the volume at any point.
    ///
    /// The capsule is approximated by inflating the volume bounds, which errs on the side of
    /// reporting a hit.
    pub fn sweep_hits(
        &self,
        portal: &Transform,
        start: Vec3,
        end: Vec3,
        radius: f32,
        half_height: f32,
    ) -> bool {
        let (min, max) = self.local_bounds();
        let inflate = Vec3::new(radius, radius + half_height, radius);
        segment_intersects_aabb(
            to_local(portal, start),
            to_local(portal, end),
            min - inflate,
            max + inflate,
        )
    }
}

fn to_local(portal: &Transform, point: Vec3) -> Vec3 {
    portal.rotation.inverse() * (point - portal.translation)
}

/// Slab test of the segment `[start, end]` against an axis aligned box.
fn segment_intersects_aabb(start: Vec3, end: Vec3, min: Vec3, max: Vec3) -> bool {
    let dir = end - start;
    let mut t_enter = 0f32;
    let mut t_exit = 1f32;
    for axis in 0..3 {
        let (s, d) = (start[axis], dir[axis]);
        if d.abs() < f32::EPSILON {
            if s < min[axis] || s > max[axis] {
                return false;
            }
            continue;
        }
        let inv = d.recip();
        let (mut t0, mut t1) = ((min[axis] - s) * inv, (max[axis] - s) * inv);
        if t0 > t1 {
            std::mem::swap(&mut t0, &mut t1);
        }
        t_enter = t_enter.max(t0);
        t_exit = t_exit.min(t1);
        if t_enter > t_exit {
            return false;
        }
    }
    true
}
