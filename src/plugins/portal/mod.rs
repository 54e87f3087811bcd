//! Portal plugin: wires the engine independent [`PortalSystem`] into Bevy and Rapier.
//!
//! Each frame the plugin registers new portals and portalable entities, feeds Rapier sensor
//! events to the portal trigger zones, steps the portal system, then applies render modes and
//! volumetric hulls before forwarding teleport notifications as Bevy events.

use bevy::{prelude::*, utils::HashMap};
use bevy_rapier3d::prelude::*;
use iyes_loopless::prelude::*;

pub mod config;
pub mod error;
mod render;
pub mod system;
pub mod transform;
pub mod volumetric;
pub mod zone;

pub use config::{PortalConfig, PORTAL_CONFIG_PATH};
pub use error::PortalError;
pub use render::{PortalHull, PortalRenderResources, PortalRenderTargets};
pub use system::{
    ObjectKind, PortalDescriptor, PortalEvent, PortalPhysicsMode, PortalRenderMode,
    PortalSaveData, PortalState, PortalSystem, PortalableObject, TriggerEvent,
};
pub use transform::PortalTransform;
pub use volumetric::HullChange;
pub use zone::TriggerShape;

use super::{
    first_person_controller::{FirstPersonCamera, FirstPersonController, PlayerGravity},
    game::GameState,
    physics::*,
};

#[derive(Debug)]
pub struct PortalPlugin;

/// Authoring side of a portal. The live state is owned by [`PortalSystem`].
#[derive(Debug, Clone, Component, Reflect)]
#[reflect(Component)]
pub struct Portal {
    pub linked_portal: Option<Entity>,
    pub scale_factor: f32,
    pub double_sided: bool,
    pub physics_mode: PortalPhysicsMode,
    pub render_mode: PortalRenderMode,
}

impl Default for Portal {
    fn default() -> Self {
        Portal {
            linked_portal: None,
            scale_factor: 1.,
            double_sided: false,
            physics_mode: PortalPhysicsMode::Normal,
            render_mode: PortalRenderMode::Normal,
        }
    }
}

/// Marks a dynamic entity as able to go through portals.
#[derive(Debug, Component, Clone, Reflect)]
#[reflect(Component)]
pub struct PortalTeleport {
    pub radius: f32,
    pub half_height: f32,
}

impl Default for PortalTeleport {
    fn default() -> Self {
        PortalTeleport {
            radius: 0.25,
            half_height: 0.,
        }
    }
}

#[derive(Bundle)]
pub struct PortalBundle {
    #[bundle]
    pub mesh_bundle: PbrBundle,
    pub portal: Portal,
    pub collider: Collider,
    pub active_events: ActiveEvents,
    pub sensor: Sensor,
    pub collision_groups: CollisionGroups,
}

impl Default for PortalBundle {
    fn default() -> Self {
        PortalBundle {
            mesh_bundle: PbrBundle::default(),
            portal: Portal::default(),
            collider: Collider::cuboid(1., 1., 0.3),
            active_events: ActiveEvents::COLLISION_EVENTS,
            sensor: Sensor,
            collision_groups: portal_collision_groups(PortalPhysicsMode::Normal),
        }
    }
}

// Events forwarded to gameplay code.

pub struct BeforeTeleport {
    pub portal: Entity,
    pub object: Entity,
}

pub struct OnTeleport {
    pub portal: Entity,
    pub object: Entity,
}

pub struct BeforePlayerTeleport {
    pub portal: Entity,
}

pub struct PlayerTeleported {
    pub portal: Entity,
}

pub struct TeleportOffset {
    pub object: Entity,
    pub offset: Vec3,
}

pub struct PortalFlipped {
    pub portal: Entity,
    pub partner: Entity,
}

pub struct HullVisibilityChanged {
    pub portal: Entity,
    pub visible: bool,
}

/// Sent by gameplay code to put a portal back in a saved state.
pub struct RestorePortal {
    pub portal: Entity,
    pub data: PortalSaveData,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, SystemLabel)]
pub enum PortalLabels {
    Register,
    Restore,
    SyncAuthoring,
    CollectTriggers,
    Step,
    ApplyRender,
    SyncCameras,
    DispatchEvents,
}

impl Plugin for PortalPlugin {
    fn build(&self, app: &mut App) {
        if !app.world.contains_resource::<PortalConfig>() {
            app.insert_resource(PortalConfig::default());
        }
        let config = app.world.resource::<PortalConfig>().clone();

        app.insert_resource(PortalSystem::new(config))
            .init_resource::<PortalRenderTargets>()
            .register_type::<Portal>()
            .register_type::<PortalTeleport>()
            .add_event::<BeforeTeleport>()
            .add_event::<OnTeleport>()
            .add_event::<BeforePlayerTeleport>()
            .add_event::<PlayerTeleported>()
            .add_event::<TeleportOffset>()
            .add_event::<PortalFlipped>()
            .add_event::<HullVisibilityChanged>()
            .add_event::<RestorePortal>()
            .add_startup_system(render::load_portal_assets)
            .add_system_set(
                SystemSet::new()
                    .label(PortalLabels::Register)
                    .with_system(register_portals)
                    .with_system(register_portalables)
                    .with_system(unregister_removed)
                    .with_system(render::setup_portal_views),
            )
            .add_system_set(
                SystemSet::new()
                    .label(PortalLabels::SyncAuthoring)
                    .after(PortalLabels::Register)
                    .with_system(restore_portals.label(PortalLabels::Restore))
                    .with_system(sync_portal_config)
                    .with_system(sync_portal_authoring.after(PortalLabels::Restore)),
            )
            .add_system(
                collect_trigger_events
                    .run_in_state(GameState::Playing)
                    .label(PortalLabels::CollectTriggers)
                    .after(PortalLabels::SyncAuthoring),
            )
            .add_system(
                step_portals
                    .run_in_state(GameState::Playing)
                    .label(PortalLabels::Step)
                    .after(PortalLabels::CollectTriggers),
            )
            .add_system(
                sync_collision_groups
                    .run_in_state(GameState::Playing)
                    .after(PortalLabels::Step),
            )
            .add_system(apply_portal_physics_mode.after(PortalLabels::Step))
            .add_system_set(
                SystemSet::new()
                    .label(PortalLabels::ApplyRender)
                    .after(PortalLabels::Step)
                    .with_system(render::apply_portal_render)
                    .with_system(render::resize_render_targets),
            )
            .add_system(
                render::sync_portal_cameras
                    .label(PortalLabels::SyncCameras)
                    .after(PortalLabels::ApplyRender),
            )
            .add_system(
                dispatch_portal_events
                    .label(PortalLabels::DispatchEvents)
                    .after(PortalLabels::ApplyRender),
            );
    }
}

/// Trigger zones can only be generated from boxes and meshes.
fn trigger_shape_from_collider(
    portal: Entity,
    collider: &Collider,
) -> Result<TriggerShape, PortalError> {
    if let Some(cuboid) = collider.as_cuboid() {
        return Ok(TriggerShape::Box {
            half_extents: cuboid.half_extents(),
        });
    }
    if let Some(trimesh) = collider.as_trimesh() {
        return Ok(TriggerShape::Mesh {
            vertices: trimesh.vertices().collect(),
        });
    }
    Err(PortalError::UnsupportedTriggerShape {
        portal,
        shape: format!("{:?}", collider.raw.shape_type()),
    })
}

fn register_portals(
    mut portal_system: ResMut<PortalSystem>,
    portal_query: Query<(Entity, &Portal, &Transform, &Collider), Added<Portal>>,
) {
    let mut links = Vec::new();
    for (entity, portal, transform, collider) in &portal_query {
        let trigger = trigger_shape_from_collider(entity, collider);
        let mut descriptor = PortalDescriptor::new(
            *transform,
            trigger.clone().unwrap_or(TriggerShape::cuboid(0., 0., 0.)),
        );
        descriptor.scale_factor = portal.scale_factor;
        descriptor.double_sided = portal.double_sided;
        descriptor.physics_mode = portal.physics_mode;
        descriptor.render_mode = portal.render_mode;
        info!("Registering portal {:?} at {}", entity, transform.translation);
        portal_system.register_portal(entity, descriptor);
        if let Err(err) = trigger {
            portal_system.disable_physics(entity, &err);
        }
        if let Some(other) = portal.linked_portal {
            links.push((entity, other));
        }
    }

    for (portal, other) in links {
        if portal_system.portal(other).is_none() {
            // Linked from the other side once it registers.
            continue;
        }
        if let Err(err) = portal_system.link(portal, other) {
            portal_system.disable_physics(portal, &err);
        }
    }
}

fn sync_portal_config(config: Res<PortalConfig>, mut portal_system: ResMut<PortalSystem>) {
    if config.is_changed() && portal_system.config() != &*config {
        info!("Portal configuration changed");
        portal_system.set_config(config.clone());
    }
}

/// Forward edits of `Portal` components and portal transforms to the portal system. Only fields
/// which changed since the last sync are applied, so modes the system set on its own (a portal
/// disabled for a bad collider) aren't overwritten by unrelated edits.
fn sync_portal_authoring(
    mut portal_system: ResMut<PortalSystem>,
    portal_query: Query<
        (Entity, &Portal, &Transform),
        Or<(Changed<Portal>, Changed<Transform>)>,
    >,
    mut seen: Local<HashMap<Entity, Portal>>,
) {
    seen.retain(|entity, _| portal_system.portal(*entity).is_some());
    for (entity, portal, transform) in &portal_query {
        if portal_system.portal(entity).is_none() {
            continue;
        }
        if portal_system.set_portal_transform(entity, *transform) {
            debug!("Portal {:?} moved to {}", entity, transform.translation);
        }
        let Some(previous) = seen.insert(entity, portal.clone()) else {
            // Just registered with these values.
            continue;
        };
        if previous.physics_mode != portal.physics_mode {
            info!("Portal {:?} physics mode: {:?}", entity, portal.physics_mode);
            portal_system.set_physics_mode(entity, portal.physics_mode);
        }
        if previous.render_mode != portal.render_mode {
            info!("Portal {:?} render mode: {:?}", entity, portal.render_mode);
            portal_system.set_render_mode(entity, portal.render_mode);
        }
        if previous.linked_portal != portal.linked_portal {
            match portal.linked_portal {
                Some(other) if portal_system.portal(other).is_some() => {
                    if let Err(err) = portal_system.link(entity, other) {
                        portal_system.disable_physics(entity, &err);
                    }
                }
                Some(other) => warn!("Portal {:?} linked to unknown portal {:?}", entity, other),
                None => portal_system.unlink(entity),
            }
        }
    }
}

fn restore_portals(
    mut restores: EventReader<RestorePortal>,
    mut portal_system: ResMut<PortalSystem>,
    mut portal_query: Query<&mut Portal>,
) {
    for restore in restores.iter() {
        if portal_system.portal(restore.portal).is_none() {
            warn!("Can't restore unknown portal {:?}", restore.portal);
            continue;
        }
        portal_system.restore(restore.portal, restore.data);
        // Keep the authored component in agreement.
        if let Ok(mut portal) = portal_query.get_mut(restore.portal) {
            portal.physics_mode = restore.data.physics_mode;
            portal.render_mode = restore.data.render_mode;
        }
    }
}

fn register_portalables(
    mut portal_system: ResMut<PortalSystem>,
    objects: Query<
        (
            Entity,
            &PortalTeleport,
            &Transform,
            Option<&FirstPersonController>,
        ),
        Added<PortalTeleport>,
    >,
) {
    for (entity, teleport, transform, controller) in &objects {
        let kind = if controller.is_some() {
            ObjectKind::Player
        } else {
            ObjectKind::Prop
        };
        debug!("Registering {:?} as a portalable {:?}", entity, kind);
        portal_system.register_object(
            entity,
            PortalableObject::new(kind, *transform, teleport.radius, teleport.half_height),
        );
    }
}

fn unregister_removed(
    mut portal_system: ResMut<PortalSystem>,
    removed_portals: RemovedComponents<Portal>,
    removed_objects: RemovedComponents<PortalTeleport>,
) {
    for entity in removed_portals.iter() {
        info!("Portal {:?} removed", entity);
        portal_system.unregister_portal(entity);
    }
    for entity in removed_objects.iter() {
        portal_system.unregister_object(entity);
    }
}

/// Turn Rapier sensor events into trigger zone events.
fn collect_trigger_events(
    mut collisions: EventReader<CollisionEvent>,
    mut portal_system: ResMut<PortalSystem>,
) {
    for collision in collisions.iter() {
        let (a, b, started) = match collision {
            CollisionEvent::Started(a, b, _flags) => (*a, *b, true),
            CollisionEvent::Stopped(a, b, _flags) => (*a, *b, false),
        };
        let (portal, object) = if portal_system.portal(a).is_some() {
            (a, b)
        } else if portal_system.portal(b).is_some() {
            (b, a)
        } else {
            continue;
        };
        if portal_system.object(object).is_none() {
            continue;
        }
        let event = if started {
            TriggerEvent::Enter { portal, object }
        } else {
            TriggerEvent::Exit { portal, object }
        };
        debug!("{:?}", event);
        portal_system.queue_trigger(event);
    }
}

/// Sync portalable entities into the portal system, step it, and write back whatever it moved.
fn step_portals(
    time: Res<Time>,
    mut portal_system: ResMut<PortalSystem>,
    mut objects: Query<
        (
            Entity,
            &mut Transform,
            Option<&mut Velocity>,
            Option<&mut PlayerGravity>,
        ),
        (With<PortalTeleport>, Without<Portal>),
    >,
    camera_query: Query<&GlobalTransform, With<FirstPersonCamera>>,
    mut portal_query: Query<&mut Transform, (With<Portal>, Without<PortalTeleport>)>,
) {
    let view_direction = camera_query.get_single().ok().map(|cam| cam.forward());
    for (entity, transform, velocity, gravity) in &objects {
        if let Some(object) = portal_system.object_mut(entity) {
            object.transform = *transform;
            if let Some(velocity) = velocity {
                object.linear_velocity = velocity.linvel;
                object.angular_velocity = velocity.angvel;
            }
            if let Some(gravity) = gravity {
                object.gravity = gravity.0;
                object.view_direction = view_direction.unwrap_or_else(|| transform.forward());
            }
        }
    }

    portal_system.tick(time.delta_seconds());

    let tick = portal_system.current_tick();
    for (entity, mut transform, velocity, gravity) in &mut objects {
        let Some(object) = portal_system.object(entity) else {
            continue;
        };
        if object.last_teleport_tick() != Some(tick) {
            continue;
        }
        *transform = object.transform;
        if let Some(mut velocity) = velocity {
            velocity.linvel = object.linear_velocity;
            velocity.angvel = object.angular_velocity;
        }
        if let Some(mut gravity) = gravity {
            gravity.0 = object.gravity;
        }
    }

    for (entity, state) in portal_system.portals() {
        if let Ok(mut transform) = portal_query.get_mut(*entity) {
            if transform.rotation != state.transform().rotation {
                transform.rotation = state.transform().rotation;
            }
        }
    }
}

/// While an object is resident in a portal it may go through the wall the portal sits on.
fn sync_collision_groups(
    portal_system: Res<PortalSystem>,
    mut objects: Query<(Entity, &mut CollisionGroups), With<PortalTeleport>>,
) {
    for (entity, mut groups) in &mut objects {
        let resident = portal_system
            .object(entity)
            .and_then(|o| o.resident_in())
            .is_some();
        let filters = portalable_filters(resident);
        if groups.filters != filters {
            debug!("Object {:?} resident in a portal: {}", entity, resident);
            groups.filters = filters;
        }
    }
}

/// Portals in wall mode are solid, portals without physics collide with nothing.
fn apply_portal_physics_mode(
    mut commands: Commands,
    portal_system: Res<PortalSystem>,
    mut portals: Query<(Entity, &mut CollisionGroups), With<Portal>>,
    mut applied: Local<HashMap<Entity, PortalPhysicsMode>>,
) {
    for (entity, mut groups) in &mut portals {
        let Some(mode) = portal_system.portal(entity).map(|p| p.physics_mode()) else {
            continue;
        };
        if applied.get(&entity) == Some(&mode) {
            continue;
        }
        applied.insert(entity, mode);
        if mode == PortalPhysicsMode::Wall {
            commands.entity(entity).remove::<Sensor>();
        } else {
            commands.entity(entity).insert(Sensor);
        }
        *groups = portal_collision_groups(mode);
    }
}

fn dispatch_portal_events(
    mut portal_system: ResMut<PortalSystem>,
    mut before_teleport: EventWriter<BeforeTeleport>,
    mut on_teleport: EventWriter<OnTeleport>,
    mut before_player_teleport: EventWriter<BeforePlayerTeleport>,
    mut player_teleported: EventWriter<PlayerTeleported>,
    mut teleport_offset: EventWriter<TeleportOffset>,
    mut flipped: EventWriter<PortalFlipped>,
    mut hull_changed: EventWriter<HullVisibilityChanged>,
) {
    for event in portal_system.drain_events() {
        match event {
            PortalEvent::BeforeTeleport { portal, object } => {
                before_teleport.send(BeforeTeleport { portal, object })
            }
            PortalEvent::Teleported { portal, object } => {
                on_teleport.send(OnTeleport { portal, object })
            }
            PortalEvent::BeforePlayerTeleport { portal } => {
                before_player_teleport.send(BeforePlayerTeleport { portal })
            }
            PortalEvent::PlayerTeleported { portal } => {
                player_teleported.send(PlayerTeleported { portal })
            }
            PortalEvent::TeleportOffset { object, offset } => {
                teleport_offset.send(TeleportOffset { object, offset })
            }
            PortalEvent::Flipped { portal, partner } => {
                flipped.send(PortalFlipped { portal, partner })
            }
            PortalEvent::HullChanged { portal, change } => {
                hull_changed.send(HullVisibilityChanged {
                    portal,
                    visible: change == HullChange::Enabled,
                })
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn app_with_portal() -> (App, Entity) {
        let mut app = App::new();
        app.insert_resource(PortalSystem::new(PortalConfig::default()))
            .add_event::<RestorePortal>()
            .add_system(restore_portals.label(PortalLabels::Restore))
            .add_system(sync_portal_authoring.after(PortalLabels::Restore));
        let transform = Transform::from_xyz(0., 1., 0.);
        let portal = app.world.spawn((Portal::default(), transform)).id();
        app.world.resource_mut::<PortalSystem>().register_portal(
            portal,
            PortalDescriptor::new(transform, TriggerShape::cuboid(1., 1., 0.3)),
        );
        app.update();
        (app, portal)
    }

    fn state(app: &App, portal: Entity) -> &PortalState {
        app.world.resource::<PortalSystem>().portal(portal).unwrap()
    }

    #[test]
    fn render_mode_edits_reach_the_portal_system() {
        let (mut app, portal) = app_with_portal();
        app.world.get_mut::<Portal>(portal).unwrap().render_mode = PortalRenderMode::Debug;
        app.update();
        assert_eq!(state(&app, portal).render_mode(), PortalRenderMode::Debug);
    }

    #[test]
    fn unrelated_edits_keep_physics_disabled() {
        let (mut app, portal) = app_with_portal();
        app.world.resource_mut::<PortalSystem>().disable_physics(
            portal,
            &PortalError::UnsupportedTriggerShape {
                portal,
                shape: "Ball".to_owned(),
            },
        );
        app.world.get_mut::<Portal>(portal).unwrap().render_mode = PortalRenderMode::Wall;
        app.update();
        assert_eq!(state(&app, portal).physics_mode(), PortalPhysicsMode::None);
        assert_eq!(state(&app, portal).render_mode(), PortalRenderMode::Wall);
    }

    #[test]
    fn moved_portals_are_followed() {
        let (mut app, portal) = app_with_portal();
        app.world.get_mut::<Transform>(portal).unwrap().translation = Vec3::new(4., 1., -2.);
        app.update();
        assert_eq!(
            state(&app, portal).transform().translation,
            Vec3::new(4., 1., -2.)
        );
    }

    #[test]
    fn restoring_updates_the_system_and_the_component() {
        let (mut app, portal) = app_with_portal();
        app.world
            .resource_mut::<Events<RestorePortal>>()
            .send(RestorePortal {
                portal,
                data: PortalSaveData {
                    render_mode: PortalRenderMode::Invisible,
                    physics_mode: PortalPhysicsMode::Wall,
                },
            });
        app.update();
        assert_eq!(state(&app, portal).render_mode(), PortalRenderMode::Invisible);
        assert_eq!(state(&app, portal).physics_mode(), PortalPhysicsMode::Wall);
        let component = app.world.get::<Portal>(portal).unwrap();
        assert_eq!(component.physics_mode, PortalPhysicsMode::Wall);
    }
}
