//! This module contains the first person controller plugin.
//!
//! The player carries its own gravity vector instead of relying on the physics engine's, so
//! portals can re-orient it. Movement, jumping and stair climbing are all relative to the
//! player's current up axis.

use bevy::{prelude::*, render::camera::Projection};
use bevy_rapier3d::prelude::*;
use euclid::Angle;
use iyes_loopless::prelude::*;
use leafwing_input_manager::prelude::*;

pub mod step;

use step::{Ray, StepSettings, StepTop};

use super::{
    game::GameState,
    input::{default_input_map, Actions},
    physics::*,
    portal::{PortalLabels, PortalTeleport},
};

pub const PLAYER_RADIUS: f32 = 0.4;
/// Half length of the capsule segment, the total height is this plus the radius, doubled.
pub const PLAYER_HALF_HEIGHT: f32 = 0.5;
pub const EYE_HEIGHT: f32 = 1.6;
pub const GRAVITY: f32 = 9.81;

const PLAYER_SPEED: f32 = 3.;
const SPRINT_MULTIPLIER: f32 = 2.;
const JUMP_SPEED: f32 = 4.5;
const MOUSE_SENSITIVITY: f32 = 0.004;
const GROUND_RAY_LENGTH: f32 = 0.1;

#[derive(Debug)]
/// First person controller plugin, which registers the required systems to use the first person
/// controller also provided by this module.
pub struct FirstPersonControllerPlugin;

impl Plugin for FirstPersonControllerPlugin {
    fn build(&self, app: &mut App) {
        app.register_type::<FirstPersonCamera>()
            .register_type::<PlayerGravity>()
            .add_system(spawn_controller.label(FirstPersonLabels::SpawnControllers))
            .add_system(
                process_controller_inputs
                    .run_in_state(GameState::Playing)
                    .label(FirstPersonLabels::ProcessInputs)
                    .before(PortalLabels::Step),
            )
            .add_system(
                climb_steps
                    .run_in_state(GameState::Playing)
                    .label(FirstPersonLabels::ClimbSteps)
                    .after(FirstPersonLabels::ProcessInputs)
                    .before(PortalLabels::Step),
            );
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, SystemLabel)]
/// Labels for the first person controller systems.
pub enum FirstPersonLabels {
    SpawnControllers,
    ProcessInputs,
    ClimbSteps,
}

#[derive(Debug, Component)]
/// First person controller component.
pub struct FirstPersonController {
    pub yaw: Angle<f32>,
    pub pitch: Angle<f32>,
    pub camera_anchor: Entity,
    pub grounded: bool,
    pub steps: StepSettings,
}

#[derive(Debug, Default, Component, Reflect)]
#[reflect(Component)]
/// Marker trait for first person cameras
pub struct FirstPersonCamera;

/// Gravity applied to the player, re-oriented by portals.
#[derive(Debug, Clone, Copy, Component, Reflect)]
#[reflect(Component)]
pub struct PlayerGravity(pub Vec3);

impl Default for PlayerGravity {
    fn default() -> Self {
        PlayerGravity(Vec3::NEG_Y * GRAVITY)
    }
}

#[derive(Debug, Component, Default)]
pub struct FirstPersonControllerSpawner;

#[derive(Debug, Bundle, Default)]
pub struct FirstPersonControllerBundle {
    #[bundle]
    pub spatial: SpatialBundle,
    pub spawner: FirstPersonControllerSpawner,
}

fn spawn_controller(
    mut commands: Commands,
    spawners_query: Query<Entity, With<FirstPersonControllerSpawner>>,
) {
    for id in &spawners_query {
        let camera_offset = Vec3::new(0., EYE_HEIGHT - PLAYER_HALF_HEIGHT - PLAYER_RADIUS, 0.);

        let player_root = commands
            .entity(id)
            .insert(InputManagerBundle {
                action_state: ActionState::default(),
                input_map: default_input_map(),
            })
            .insert((
                RigidBody::Dynamic,
                Collider::capsule_y(PLAYER_HALF_HEIGHT, PLAYER_RADIUS),
                LockedAxes::ROTATION_LOCKED,
                Velocity::default(),
                GravityScale(0.),
                Ccd::enabled(),
                Name::from("Player"),
                CollisionGroups::new(PLAYER_GROUP, ALL_GROUPS),
                ActiveEvents::COLLISION_EVENTS,
            ))
            .insert((
                PlayerGravity::default(),
                PortalTeleport {
                    radius: PLAYER_RADIUS,
                    half_height: PLAYER_HALF_HEIGHT,
                },
            ))
            .id();

        let camera_anchor = commands
            .spawn(SpatialBundle::from(Transform::from_translation(camera_offset)))
            .insert(Name::from("Camera anchor"))
            .id();

        let camera = commands
            .spawn(Camera3dBundle {
                projection: Projection::Perspective(PerspectiveProjection {
                    fov: std::f32::consts::FRAC_PI_4,
                    near: 0.05,
                    far: 1000.,
                    ..default()
                }),
                ..default()
            })
            .insert((Name::from("Player camera"), FirstPersonCamera))
            .id();

        commands.entity(camera_anchor).push_children(&[camera]);

        commands
            .entity(player_root)
            .add_child(camera_anchor)
            .insert(FirstPersonController {
                yaw: Angle::zero(),
                pitch: Angle::zero(),
                camera_anchor,
                grounded: false,
                steps: StepSettings::default(),
            });

        commands.entity(id).remove::<FirstPersonControllerSpawner>();
    }
}

fn feet(transform: &Transform) -> Vec3 {
    transform.translation - transform.up() * (PLAYER_HALF_HEIGHT + PLAYER_RADIUS)
}

fn world_ray_filter(player: Entity) -> QueryFilter<'static> {
    QueryFilter {
        groups: Some(
            CollisionGroups::new(RAYCAST_GROUP, WALLS_GROUP | GROUND_GROUP | PROPS_GROUP).into(),
        ),
        ..default()
    }
    .exclude_rigid_body(player)
}

fn process_controller_inputs(
    time: Res<Time>,
    rapier: Res<RapierContext>,
    mut player_query: Query<(
        Entity,
        &ActionState<Actions>,
        &mut FirstPersonController,
        &mut Velocity,
        &mut Transform,
        &PlayerGravity,
    )>,
    mut camera_query: Query<&mut Transform, Without<FirstPersonController>>,
) {
    for (entity, input_state, mut controller, mut velocity, mut transform, gravity) in
        &mut player_query
    {
        let up = transform.up();
        controller.grounded = rapier
            .cast_ray(
                feet(&transform) + up * (GROUND_RAY_LENGTH / 2.),
                -up,
                GROUND_RAY_LENGTH,
                true,
                world_ray_filter(entity),
            )
            .is_some();

        let k = if input_state.pressed(Actions::Sprint) {
            SPRINT_MULTIPLIER
        } else {
            1.
        };
        let forward = transform.forward();
        let left = transform.left();
        let mut planar = Vec3::ZERO;
        match (
            input_state.pressed(Actions::Forward),
            input_state.pressed(Actions::Backwards),
        ) {
            (true, false) => planar += forward,
            (false, true) => planar -= forward,
            _ => {}
        }
        match (
            input_state.pressed(Actions::StrafeLeft),
            input_state.pressed(Actions::StrafeRight),
        ) {
            (true, false) => planar += left,
            (false, true) => planar -= left,
            _ => {}
        }
        let planar = planar.normalize_or_zero() * PLAYER_SPEED * k;

        // Keep the velocity along the up axis, that's gravity and jumps.
        let mut vertical = velocity.linvel.dot(up);
        if controller.grounded {
            vertical = vertical.max(0.);
            if input_state.just_pressed(Actions::Jump) {
                vertical = JUMP_SPEED;
            }
        }
        velocity.linvel = planar + up * vertical + gravity.0 * time.delta_seconds();

        // Yaw turns the whole body around its up axis, pitch only tilts the camera so the body
        // stays aligned with gravity.
        if let Some(mouse_movement) = input_state.axis_pair(Actions::Aim) {
            let yaw = Angle::radians(-mouse_movement.x() * MOUSE_SENSITIVITY);
            controller.yaw += yaw;
            transform.rotate_axis(up, yaw.radians);

            controller.pitch += Angle::radians(-mouse_movement.y() * MOUSE_SENSITIVITY);
            controller.pitch.radians = controller
                .pitch
                .radians
                .clamp(-std::f32::consts::FRAC_PI_2, std::f32::consts::FRAC_PI_2);
            if let Ok(mut camera_transform) = camera_query.get_mut(controller.camera_anchor) {
                camera_transform.rotation = Quat::from_axis_angle(Vec3::X, controller.pitch.radians);
            }
        }
    }
}

/// Lift the player onto steps in front of it.
fn climb_steps(
    rapier: Res<RapierContext>,
    mut player_query: Query<(Entity, &FirstPersonController, &mut Transform, &Velocity)>,
) {
    for (entity, controller, mut transform, velocity) in &mut player_query {
        if !controller.grounded {
            continue;
        }
        let up = transform.up();
        let planar = velocity.linvel - up * velocity.linvel.dot(up);
        let Some(direction) = planar.try_normalize() else {
            continue;
        };
        let feet = feet(&transform);
        let filter = world_ray_filter(entity);
        let cast = |ray: Ray| {
            rapier.cast_ray_and_get_normal(ray.origin, ray.direction, ray.max_toi, true, filter)
        };

        let (low_ray, high_ray) =
            controller
                .steps
                .forward_rays(feet, up, direction, PLAYER_RADIUS);
        let low = cast(low_ray).map(|(_, hit)| hit.toi);
        let high = cast(high_ray).map(|(_, hit)| hit.toi);
        let top = low.and_then(|low_toi| {
            cast(controller.steps.top_ray(feet, up, direction, low_toi)).map(|(_, hit)| StepTop {
                toi: hit.toi,
                normal: hit.normal,
            })
        });
        if let Some(height) = controller.steps.step_height(up, low, high, top) {
            debug!("Stepping up by {}", height);
            transform.translation += up * height;
        }
    }
}
