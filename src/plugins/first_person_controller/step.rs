//! Stair climbing. The controller casts three rays around the player's feet and this module
//! decides, from what they hit, whether the player should be lifted onto a step.
//!
//! Everything is expressed relative to the player's own up axis, which follows gravity and so
//! changes after going through a tilted portal.

use bevy::prelude::*;
use euclid::Angle;

/// Horizontal distance the top ray goes past the obstacle, so it lands on the step.
const STEP_INSET: f32 = 0.05;
/// Extra height the top ray starts from above the maximum step height.
const TOP_RAY_MARGIN: f32 = 0.05;
/// Height of the low ray above the feet, so the ground itself isn't hit.
const LOW_RAY_HEIGHT: f32 = 0.02;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Ray {
    pub origin: Vec3,
    pub direction: Vec3,
    pub max_toi: f32,
}

/// What the top ray hit.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct StepTop {
    pub toi: f32,
    pub normal: Vec3,
}

#[derive(Debug, Clone, Copy)]
pub struct StepSettings {
    pub max_step_height: f32,
    /// How far ahead of the player's body obstacles are looked for.
    pub reach: f32,
    /// Steepest walkable step top.
    pub max_slope: Angle<f32>,
}

impl Default for StepSettings {
    fn default() -> Self {
        StepSettings {
            max_step_height: 0.35,
            reach: 0.15,
            max_slope: Angle::degrees(40.),
        }
    }
}

impl StepSettings {
    /// Ray at the feet, and ray just above the tallest climbable step.
    pub fn forward_rays(&self, feet: Vec3, up: Vec3, direction: Vec3, radius: f32) -> (Ray, Ray) {
        let max_toi = radius + self.reach;
        let low = Ray {
            origin: feet + up * LOW_RAY_HEIGHT,
            direction,
            max_toi,
        };
        let high = Ray {
            origin: feet + up * (self.max_step_height + TOP_RAY_MARGIN),
            direction,
            max_toi,
        };
        (low, high)
    }

    /// Downward ray onto the top of an obstacle the low ray hit at `low_toi`.
    pub fn top_ray(&self, feet: Vec3, up: Vec3, direction: Vec3, low_toi: f32) -> Ray {
        let start_height = self.max_step_height + TOP_RAY_MARGIN;
        Ray {
            origin: feet + up * start_height + direction * (low_toi + STEP_INSET),
            direction: -up,
            max_toi: start_height,
        }
    }

    /// Height the player has to be lifted by, if the rays describe a climbable step.
    pub fn step_height(
        &self,
        up: Vec3,
        low: Option<f32>,
        high: Option<f32>,
        top: Option<StepTop>,
    ) -> Option<f32> {
        // Nothing in the way, or a wall taller than a step.
        if low.is_none() || high.is_some() {
            return None;
        }
        let top = top?;
        if top.normal.dot(up) < self.max_slope.radians.cos() {
            return None;
        }
        let height = self.max_step_height + TOP_RAY_MARGIN - top.toi;
        (height > LOW_RAY_HEIGHT && height <= self.max_step_height).then_some(height)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn settings() -> StepSettings {
        StepSettings::default()
    }

    #[test]
    fn low_obstacle_with_flat_top_is_a_step() {
        let s = settings();
        let toi = s.max_step_height + TOP_RAY_MARGIN - 0.2;
        let height = s.step_height(
            Vec3::Y,
            Some(0.3),
            None,
            Some(StepTop {
                toi,
                normal: Vec3::Y,
            }),
        );
        assert!((height.unwrap() - 0.2).abs() < 1e-5);
    }

    #[test]
    fn walls_and_open_ground_are_not_steps() {
        let s = settings();
        let top = Some(StepTop {
            toi: 0.2,
            normal: Vec3::Y,
        });
        assert_eq!(s.step_height(Vec3::Y, None, None, top), None);
        assert_eq!(s.step_height(Vec3::Y, Some(0.3), Some(0.3), top), None);
        assert_eq!(s.step_height(Vec3::Y, Some(0.3), None, None), None);
    }

    #[test]
    fn steep_tops_are_not_walkable() {
        let s = settings();
        let normal = Quat::from_rotation_x(Angle::<f32>::degrees(60.).radians) * Vec3::Y;
        let top = Some(StepTop { toi: 0.2, normal });
        assert_eq!(s.step_height(Vec3::Y, Some(0.3), None, top), None);
    }

    #[test]
    fn rays_follow_the_player_up_axis() {
        let s = settings();
        let up = Vec3::X;
        let direction = Vec3::Z;
        let feet = Vec3::new(1., 2., 3.);
        let (low, high) = s.forward_rays(feet, up, direction, 0.4);
        assert!((high.origin - low.origin).dot(up) > s.max_step_height);
        assert_eq!(low.direction, direction);
        let top = s.top_ray(feet, up, direction, 0.45);
        assert_eq!(top.direction, -up);
        assert!((top.origin - feet).dot(direction) > 0.45);
    }
}
