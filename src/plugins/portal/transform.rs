//! Mapping of points, directions and orientations from one portal's frame to its partner's.
//!
//! Portal frames are expected to have a unit scale, size changes between a pair of portals are
//! expressed with a separate scale factor so the rotation part stays orthonormal.

use std::f32::consts::PI;

use bevy::prelude::*;

/// Half turn around the portal's local vertical axis. Entering through the front of a portal
/// must exit through the front of its partner, not mirrored through its back.
pub fn half_turn() -> Quat {
    Quat::from_rotation_y(PI)
}

/// Change of frame between two linked portals.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PortalTransform {
    from: Transform,
    to: Transform,
    scale_factor: f32,
}

impl PortalTransform {
    pub fn between(from: &Transform, to: &Transform, scale_factor: f32) -> PortalTransform {
        PortalTransform {
            from: *from,
            to: *to,
            scale_factor,
        }
    }

    /// The same mapping, in the opposite direction.
    pub fn inverse(&self) -> PortalTransform {
        PortalTransform {
            from: self.to,
            to: self.from,
            scale_factor: self.scale_factor.recip(),
        }
    }

    pub fn scale_factor(&self) -> f32 {
        self.scale_factor
    }

    pub fn point(&self, point: Vec3) -> Vec3 {
        let local = self.from.rotation.inverse() * (point - self.from.translation);
        let exit_local = half_turn() * local * self.scale_factor;
        self.to.translation + self.to.rotation * exit_local
    }

    /// Directions are rotated only, scaling an object's velocity is up to whoever tracks it.
    pub fn direction(&self, direction: Vec3) -> Vec3 {
        self.rotation_delta() * direction
    }

    pub fn rotation(&self, rotation: Quat) -> Quat {
        (self.rotation_delta() * rotation).normalize()
    }

    /// Transform a whole object, its own scale is multiplied by the pair's scale factor.
    pub fn transform(&self, transform: &Transform) -> Transform {
        Transform {
            translation: self.point(transform.translation),
            rotation: self.rotation(transform.rotation),
            scale: transform.scale * self.scale_factor,
        }
    }

    fn rotation_delta(&self) -> Quat {
        self.to.rotation * half_turn() * self.from.rotation.inverse()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn portal_a() -> Transform {
        Transform::from_xyz(2., 1., -5.).looking_at(Vec3::new(2., 1., -6.), Vec3::Y)
    }

    fn portal_b() -> Transform {
        Transform::from_xyz(-7., 3., 4.)
            .looking_at(Vec3::new(-6., 3., 4.5), Vec3::Y)
            .with_scale(Vec3::ONE)
    }

    #[test]
    fn matches_matrix_composition() {
        let (a, b) = (portal_a(), portal_b());
        let a_to_b = b.compute_matrix() * Mat4::from_rotation_y(PI) * a.compute_matrix().inverse();
        let mapping = PortalTransform::between(&a, &b, 1.);
        for p in [Vec3::ZERO, Vec3::new(1., 2., 3.), Vec3::new(2.3, 0.5, -5.1)] {
            assert!(mapping.point(p).abs_diff_eq(a_to_b.transform_point3(p), 1e-4));
        }
    }

    #[test]
    fn round_trip_through_both_portals() {
        let mapping = PortalTransform::between(&portal_a(), &portal_b(), 2.);
        let back = mapping.inverse();
        for p in [Vec3::new(0.3, -1., 8.), Vec3::new(2., 1.5, -5.2), Vec3::splat(-3.)] {
            assert!(back.point(mapping.point(p)).abs_diff_eq(p, 1e-4));
        }
        let q = Quat::from_euler(EulerRot::YXZ, 0.3, -0.2, 0.1);
        assert!(back.rotation(mapping.rotation(q)).abs_diff_eq(q, 1e-4)
            || back.rotation(mapping.rotation(q)).abs_diff_eq(-q, 1e-4));
    }

    #[test]
    fn walking_in_exits_out_of_the_partner() {
        let (a, b) = (portal_a(), portal_b());
        let mapping = PortalTransform::between(&a, &b, 1.);
        // Just past the plane of A, moving into it.
        let position = a.translation + a.forward() * 0.05;
        let exit = mapping.point(position);
        assert!((exit - b.translation).dot(b.forward()) < 0.);
        assert!(mapping.direction(a.forward()).abs_diff_eq(b.back(), 1e-4));
    }

    #[test]
    fn scale_applies_to_points_not_directions() {
        let (a, b) = (portal_a(), portal_b());
        let mapping = PortalTransform::between(&a, &b, 0.5);
        let offset = a.up() * 2.;
        assert!(((mapping.point(a.translation + offset) - b.translation).length() - 1.).abs() < 1e-4);
        assert!((mapping.direction(offset).length() - 2.).abs() < 1e-4);
        let object = mapping.transform(&Transform::from_translation(a.translation));
        assert!(object.scale.abs_diff_eq(Vec3::splat(0.5), 1e-6));
    }
}
