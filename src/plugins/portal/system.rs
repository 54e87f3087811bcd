//! Engine independent portal bookkeeping.
//!
//! [`PortalSystem`] owns every registered portal and portalable object, and is stepped once per
//! physics tick by the plugin. Within a tick the order is fixed: queued trigger events and
//! resident objects are processed first, then missed crossings are recovered, then double sided
//! portals are flipped. Hull visibility is updated separately by [`PortalSystem::apply_render`]
//! once the tick is over.

use bevy::{
    prelude::*,
    utils::{HashMap, HashSet},
};
use serde::{Deserialize, Serialize};

use super::{
    config::PortalConfig,
    error::PortalError,
    transform::{half_turn, PortalTransform},
    volumetric::{HullChange, VolumetricHull},
    zone::TriggerShape,
};

/// Tolerance on `a.scale_factor * b.scale_factor == 1` for linked portals.
pub const SCALE_EPSILON: f32 = 1e-3;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, Reflect)]
pub enum PortalPhysicsMode {
    #[default]
    Normal,
    /// Solid, nothing goes through.
    Wall,
    None,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, Reflect)]
pub enum PortalRenderMode {
    #[default]
    Normal,
    Debug,
    Invisible,
    Wall,
}

/// The part of a portal's state that survives a save.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PortalSaveData {
    pub render_mode: PortalRenderMode,
    pub physics_mode: PortalPhysicsMode,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Reflect)]
pub enum ObjectKind {
    Player,
    #[default]
    Prop,
}

/// Registration parameters of a portal.
#[derive(Debug, Clone)]
pub struct PortalDescriptor {
    pub transform: Transform,
    pub trigger: TriggerShape,
    pub scale_factor: f32,
    pub double_sided: bool,
    pub physics_mode: PortalPhysicsMode,
    pub render_mode: PortalRenderMode,
}

impl PortalDescriptor {
    pub fn new(transform: Transform, trigger: TriggerShape) -> PortalDescriptor {
        PortalDescriptor {
            transform,
            trigger,
            scale_factor: 1.,
            double_sided: false,
            physics_mode: PortalPhysicsMode::Normal,
            render_mode: PortalRenderMode::Normal,
        }
    }
}

#[derive(Debug, Clone)]
pub struct PortalState {
    transform: Transform,
    start_rotation: Quat,
    flipped_rotation: Quat,
    is_flipped: bool,
    trigger: TriggerShape,
    scale_factor: f32,
    double_sided: bool,
    physics_mode: PortalPhysicsMode,
    render_mode: PortalRenderMode,
    other_portal: Option<Entity>,
    residents: HashSet<Entity>,
    hull: VolumetricHull,
    /// Elapsed time of the last teleport out of this portal.
    last_teleport_time: Option<f32>,
}

impl PortalState {
    fn new(descriptor: PortalDescriptor) -> PortalState {
        let rotation = descriptor.transform.rotation;
        PortalState {
            transform: Transform {
                scale: Vec3::ONE,
                ..descriptor.transform
            },
            start_rotation: rotation,
            flipped_rotation: rotation * half_turn(),
            is_flipped: false,
            trigger: descriptor.trigger,
            scale_factor: descriptor.scale_factor,
            double_sided: descriptor.double_sided,
            physics_mode: descriptor.physics_mode,
            render_mode: descriptor.render_mode,
            other_portal: None,
            residents: HashSet::new(),
            hull: VolumetricHull::default(),
            last_teleport_time: None,
        }
    }

    /// Current frame, flip included.
    pub fn transform(&self) -> &Transform {
        &self.transform
    }

    pub fn trigger(&self) -> &TriggerShape {
        &self.trigger
    }

    pub fn scale_factor(&self) -> f32 {
        self.scale_factor
    }

    pub fn double_sided(&self) -> bool {
        self.double_sided
    }

    pub fn is_flipped(&self) -> bool {
        self.is_flipped
    }

    pub fn physics_mode(&self) -> PortalPhysicsMode {
        self.physics_mode
    }

    pub fn render_mode(&self) -> PortalRenderMode {
        self.render_mode
    }

    pub fn other_portal(&self) -> Option<Entity> {
        self.other_portal
    }

    pub fn residents(&self) -> impl Iterator<Item = &Entity> {
        self.residents.iter()
    }

    pub fn hull(&self) -> &VolumetricHull {
        &self.hull
    }

    pub fn save_data(&self) -> PortalSaveData {
        PortalSaveData {
            render_mode: self.render_mode,
            physics_mode: self.physics_mode,
        }
    }

    fn frame_with_flip(&self, flipped: bool) -> Transform {
        Transform {
            rotation: if flipped {
                self.flipped_rotation
            } else {
                self.start_rotation
            },
            ..self.transform
        }
    }

    fn flip(&mut self) {
        self.is_flipped = !self.is_flipped;
        self.transform = self.frame_with_flip(self.is_flipped);
    }
}

/// A dynamic object which can go through portals.
#[derive(Debug, Clone)]
pub struct PortalableObject {
    pub kind: ObjectKind,
    pub transform: Transform,
    pub linear_velocity: Vec3,
    pub angular_velocity: Vec3,
    pub gravity: Vec3,
    /// Where the object looks, only meaningful for the player.
    pub view_direction: Vec3,
    pub radius: f32,
    pub half_height: f32,
    resident_in: Option<Entity>,
    last_position: Option<Vec3>,
    last_teleport_tick: Option<u64>,
}

impl PortalableObject {
    pub fn new(kind: ObjectKind, transform: Transform, radius: f32, half_height: f32) -> Self {
        PortalableObject {
            kind,
            transform,
            linear_velocity: Vec3::ZERO,
            angular_velocity: Vec3::ZERO,
            gravity: Vec3::ZERO,
            view_direction: transform.forward(),
            radius,
            half_height,
            resident_in: None,
            last_position: None,
            last_teleport_tick: None,
        }
    }

    pub fn prop(transform: Transform, radius: f32) -> Self {
        PortalableObject::new(ObjectKind::Prop, transform, radius, 0.)
    }

    pub fn player(transform: Transform, radius: f32, half_height: f32) -> Self {
        PortalableObject::new(ObjectKind::Player, transform, radius, half_height)
    }

    pub fn with_velocity(mut self, linear_velocity: Vec3) -> Self {
        self.linear_velocity = linear_velocity;
        self
    }

    pub fn with_gravity(mut self, gravity: Vec3) -> Self {
        self.gravity = gravity;
        self
    }

    pub fn resident_in(&self) -> Option<Entity> {
        self.resident_in
    }

    pub fn last_teleport_tick(&self) -> Option<u64> {
        self.last_teleport_tick
    }
}

/// Physics callbacks of a portal's trigger volume.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TriggerEvent {
    Enter { portal: Entity, object: Entity },
    Stay { portal: Entity, object: Entity },
    Exit { portal: Entity, object: Entity },
}

/// Notifications for gameplay code, drained by the plugin after each tick.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum PortalEvent {
    BeforeTeleport { portal: Entity, object: Entity },
    Teleported { portal: Entity, object: Entity },
    BeforePlayerTeleport { portal: Entity },
    PlayerTeleported { portal: Entity },
    TeleportOffset { object: Entity, offset: Vec3 },
    Flipped { portal: Entity, partner: Entity },
    HullChanged { portal: Entity, change: HullChange },
}

/// Owner of all portal state. See the module documentation for the per tick ordering.
#[derive(Debug, Default, Resource)]
pub struct PortalSystem {
    config: PortalConfig,
    portals: HashMap<Entity, PortalState>,
    objects: HashMap<Entity, PortalableObject>,
    pending_triggers: Vec<TriggerEvent>,
    events: Vec<PortalEvent>,
    tick: u64,
    time: f32,
    dt: f32,
    last_player_teleport_tick: Option<u64>,
    last_teleport_tick: Option<u64>,
    teleport_in_progress: Option<Entity>,
    teleported_this_tick: HashSet<Entity>,
}

impl PortalSystem {
    pub fn new(config: PortalConfig) -> PortalSystem {
        PortalSystem {
            config,
            ..default()
        }
    }

    pub fn config(&self) -> &PortalConfig {
        &self.config
    }

    pub fn set_config(&mut self, config: PortalConfig) {
        self.config = config;
    }

    pub fn current_tick(&self) -> u64 {
        self.tick
    }

    pub fn teleport_in_progress(&self) -> Option<Entity> {
        self.teleport_in_progress
    }

    // Registration

    pub fn register_portal(&mut self, portal: Entity, descriptor: PortalDescriptor) {
        if self.portals.contains_key(&portal) {
            self.unregister_portal(portal);
        }
        debug!("Registering portal {:?}", portal);
        self.portals.insert(portal, PortalState::new(descriptor));
    }

    pub fn unregister_portal(&mut self, portal: Entity) {
        self.unlink(portal);
        if let Some(state) = self.portals.remove(&portal) {
            for object in state.residents {
                if let Some(object) = self.objects.get_mut(&object) {
                    object.resident_in = None;
                }
            }
        }
    }

    pub fn register_object(&mut self, entity: Entity, object: PortalableObject) {
        self.unregister_object(entity);
        self.objects.insert(entity, object);
    }

    pub fn unregister_object(&mut self, entity: Entity) {
        self.set_residency(entity, None);
        self.objects.remove(&entity);
    }

    pub fn portal(&self, portal: Entity) -> Option<&PortalState> {
        self.portals.get(&portal)
    }

    pub fn portals(&self) -> impl Iterator<Item = (&Entity, &PortalState)> {
        self.portals.iter()
    }

    pub fn object(&self, entity: Entity) -> Option<&PortalableObject> {
        self.objects.get(&entity)
    }

    /// Mutable access used to sync the object from the physics engine before a tick.
    pub fn object_mut(&mut self, entity: Entity) -> Option<&mut PortalableObject> {
        self.objects.get_mut(&entity)
    }

    // Configuration of portals

    /// Link two portals together, replacing any previous links.
    ///
    /// The scale factors of a pair must be reciprocal, otherwise going back and forth would
    /// change an object's size.
    pub fn link(&mut self, a: Entity, b: Entity) -> Result<(), PortalError> {
        let scale_a = self.portal(a).ok_or(PortalError::UnknownPortal(a))?.scale_factor;
        let scale_b = self.portal(b).ok_or(PortalError::UnknownPortal(b))?.scale_factor;
        if (scale_a * scale_b - 1.).abs() > SCALE_EPSILON {
            let err = PortalError::ScaleMismatch {
                a,
                b,
                scale_a,
                scale_b,
            };
            error!("{}", err);
            return Err(err);
        }
        self.unlink(a);
        self.unlink(b);
        if let Some(portal) = self.portals.get_mut(&a) {
            portal.other_portal = Some(b);
        }
        if let Some(portal) = self.portals.get_mut(&b) {
            portal.other_portal = Some(a);
        }
        info!("Linked portals {:?} and {:?}", a, b);
        Ok(())
    }

    pub fn unlink(&mut self, portal: Entity) {
        let other = self.portals.get_mut(&portal).and_then(|p| p.other_portal.take());
        if let Some(other) = other.and_then(|other| self.portals.get_mut(&other)) {
            other.other_portal = None;
        }
    }

    /// Move a portal. `transform` is its current frame, flip included, and the flip state is
    /// kept. Returns whether anything changed.
    pub fn set_portal_transform(&mut self, portal: Entity, transform: Transform) -> bool {
        let Some(state) = self.portals.get_mut(&portal) else {
            return false;
        };
        if state.transform.translation == transform.translation
            && state.transform.rotation == transform.rotation
        {
            return false;
        }
        let start_rotation = if state.is_flipped {
            transform.rotation * half_turn().inverse()
        } else {
            transform.rotation
        };
        state.transform.translation = transform.translation;
        state.start_rotation = start_rotation;
        state.flipped_rotation = start_rotation * half_turn();
        state.transform = state.frame_with_flip(state.is_flipped);
        true
    }

    pub fn set_physics_mode(&mut self, portal: Entity, mode: PortalPhysicsMode) {
        if let Some(state) = self.portals.get_mut(&portal) {
            state.physics_mode = mode;
        }
    }

    pub fn set_render_mode(&mut self, portal: Entity, mode: PortalRenderMode) {
        if let Some(state) = self.portals.get_mut(&portal) {
            state.render_mode = mode;
        }
    }

    /// Leave a misconfigured portal in place but stop it from teleporting anything.
    pub fn disable_physics(&mut self, portal: Entity, reason: &PortalError) {
        error!("Disabling physics of portal {:?}: {}", portal, reason);
        self.set_physics_mode(portal, PortalPhysicsMode::None);
    }

    pub fn restore(&mut self, portal: Entity, data: PortalSaveData) {
        self.set_render_mode(portal, data.render_mode);
        self.set_physics_mode(portal, data.physics_mode);
    }

    // Frame mapping

    /// Mapping from `portal` to its partner, if it is able to teleport.
    pub fn portal_transform(&self, portal: Entity) -> Result<PortalTransform, PortalError> {
        self.teleport_target(portal).map(|(_, mapping)| mapping)
    }

    pub fn transform_point(&self, portal: Entity, point: Vec3) -> Option<Vec3> {
        self.portal_transform(portal).ok().map(|m| m.point(point))
    }

    pub fn transform_direction(&self, portal: Entity, direction: Vec3) -> Option<Vec3> {
        self.portal_transform(portal).ok().map(|m| m.direction(direction))
    }

    pub fn transform_rotation(&self, portal: Entity, rotation: Quat) -> Option<Quat> {
        self.portal_transform(portal).ok().map(|m| m.rotation(rotation))
    }

    fn teleport_target(&self, portal: Entity) -> Result<(Entity, PortalTransform), PortalError> {
        let state = self.portal(portal).ok_or(PortalError::UnknownPortal(portal))?;
        if state.physics_mode != PortalPhysicsMode::Normal {
            return Err(PortalError::PhysicsDisabled(portal));
        }
        let other = state
            .other_portal
            .ok_or(PortalError::MissingPartner(portal))?;
        let other_state = self.portal(other).ok_or(PortalError::MissingPartner(portal))?;
        if other_state.physics_mode != PortalPhysicsMode::Normal {
            return Err(PortalError::PhysicsDisabled(other));
        }
        Ok((
            other,
            PortalTransform::between(&state.transform, &other_state.transform, state.scale_factor),
        ))
    }

    // Stepping

    pub fn queue_trigger(&mut self, event: TriggerEvent) {
        self.pending_triggers.push(event);
    }

    pub fn drain_events(&mut self) -> Vec<PortalEvent> {
        std::mem::take(&mut self.events)
    }

    /// Advance by one physics step of `dt` seconds.
    pub fn tick(&mut self, dt: f32) {
        self.tick += 1;
        self.time += dt;
        self.dt = dt;
        // Post processing of last tick's teleports is over.
        self.teleport_in_progress = None;
        self.teleported_this_tick.clear();

        for event in std::mem::take(&mut self.pending_triggers) {
            match event {
                TriggerEvent::Enter { portal, object } => self.on_trigger_enter(portal, object),
                TriggerEvent::Stay { portal, object } => self.on_trigger_stay(portal, object),
                TriggerEvent::Exit { portal, object } => self.on_trigger_exit(portal, object),
            }
        }
        let residents = self
            .objects
            .iter()
            .filter_map(|(entity, object)| object.resident_in.map(|portal| (portal, *entity)))
            .collect::<Vec<_>>();
        for (portal, object) in residents {
            self.on_trigger_stay(portal, object);
        }

        self.recover_missed_crossings();
        self.evaluate_flips();

        for object in self.objects.values_mut() {
            object.last_position = Some(object.transform.translation);
        }
    }

    /// Update hull visibility of every portal, to be called once per rendered frame after the
    /// physics step.
    pub fn apply_render(&mut self) {
        let portals = self.portals.keys().copied().collect::<Vec<_>>();
        let threshold = self.config.hull_disable_frames;
        for portal in portals {
            let on = self.hull_on_condition(portal);
            let change = self
                .portals
                .get_mut(&portal)
                .and_then(|state| state.hull.update(on, threshold));
            if let Some(change) = change {
                debug!("Volumetric hull of portal {:?}: {:?}", portal, change);
                self.events.push(PortalEvent::HullChanged { portal, change });
            }
        }
    }

    fn hull_on_condition(&self, portal: Entity) -> bool {
        let Some(state) = self.portals.get(&portal) else {
            return false;
        };
        if self.config.force_volumetric || !state.residents.is_empty() {
            return true;
        }
        match state.other_portal.and_then(|other| self.portals.get(&other)) {
            Some(partner) => {
                !partner.residents.is_empty()
                    || partner.last_teleport_time.map_or(false, |t| {
                        self.time - t <= self.config.recent_teleport_window
                    })
            }
            None => false,
        }
    }

    // Trigger zones

    pub fn on_trigger_enter(&mut self, portal: Entity, object: Entity) {
        if !self.portals.contains_key(&portal) {
            return;
        }
        match self.objects.get(&object) {
            Some(state) if state.resident_in != Some(portal) => {
                self.set_residency(object, Some(portal));
            }
            _ => {}
        }
    }

    pub fn on_trigger_stay(&mut self, portal: Entity, object: Entity) {
        if self.teleported_this_tick.contains(&object) {
            return;
        }
        self.on_trigger_enter(portal, object);
        if self.should_teleport(portal, object) {
            if let Err(err) = self.teleport(portal, object) {
                debug!("Teleport through {:?} refused: {}", portal, err);
            }
        }
    }

    pub fn on_trigger_exit(&mut self, portal: Entity, object: Entity) {
        if self.teleported_this_tick.contains(&object) {
            return;
        }
        if self.objects.get(&object).and_then(|o| o.resident_in) == Some(portal) {
            self.set_residency(object, None);
        }
    }

    pub fn is_resident(&self, portal: Entity, object: Entity) -> bool {
        self.portals
            .get(&portal)
            .map_or(false, |p| p.residents.contains(&object))
    }

    /// Single place where residency changes, so an object is never owned by two portals and
    /// `resident_in` always agrees with the portals' sets.
    fn set_residency(&mut self, object: Entity, portal: Option<Entity>) {
        let Some(state) = self.objects.get_mut(&object) else {
            return;
        };
        let previous = std::mem::replace(&mut state.resident_in, portal);
        if let Some(previous) = previous.and_then(|p| self.portals.get_mut(&p)) {
            previous.residents.remove(&object);
        }
        if let Some(next) = portal.and_then(|p| self.portals.get_mut(&p)) {
            next.residents.insert(object);
        }
    }

    fn should_teleport(&self, portal: Entity, object: Entity) -> bool {
        match (self.portals.get(&portal), self.objects.get(&object)) {
            (Some(state), Some(object)) => {
                self.teleport_target(portal).is_ok()
                    && self.teleport_condition(state, &state.transform, object)
            }
            _ => false,
        }
    }

    /// Whether `object` should go through a portal of the given frame. The player additionally
    /// has to move and look through it, so grazing a portal doesn't teleport.
    fn teleport_condition(
        &self,
        portal: &PortalState,
        frame: &Transform,
        object: &PortalableObject,
    ) -> bool {
        let position = object.transform.translation;
        let inside = portal
            .trigger
            .sweep_hits(frame, position, position, object.radius, object.half_height);
        let crossed = portal.trigger.signed_distance(frame, position) > 0.;
        match object.kind {
            ObjectKind::Prop => inside && crossed,
            ObjectKind::Player => {
                let inward = frame.forward();
                inside
                    && crossed
                    && object.linear_velocity.dot(inward) >= self.config.player_min_inward_speed
                    && object.view_direction.dot(inward) >= self.config.player_facing_threshold
            }
        }
    }

    // Teleportation

    /// Everything a teleport of `object` through `portal` requires, residency aside.
    fn check_teleport(
        &self,
        portal: Entity,
        object: Entity,
    ) -> Result<(Entity, PortalTransform), PortalError> {
        let target = self.teleport_target(portal)?;
        let state = self
            .objects
            .get(&object)
            .ok_or(PortalError::UnknownObject(object))?;
        let is_player = state.kind == ObjectKind::Player;
        if is_player {
            if let Some(in_progress) = self.teleport_in_progress {
                error!("Refusing to teleport the player while a teleport is in progress");
                return Err(PortalError::TeleportInProgress(in_progress));
            }
        }
        let last = if is_player {
            self.last_player_teleport_tick
        } else {
            state.last_teleport_tick
        };
        if let Some(last) = last {
            let ticks_ago = self.tick - last;
            if ticks_ago < self.config.global_teleport_cooldown_ticks {
                return Err(PortalError::TeleportCooldown { object, ticks_ago });
            }
        }
        Ok(target)
    }

    /// Move `object` from `portal` to its partner.
    pub fn teleport(&mut self, portal: Entity, object: Entity) -> Result<(), PortalError> {
        let (partner, mapping) = self.check_teleport(portal, object).map_err(|err| {
            if matches!(err, PortalError::TeleportCooldown { .. }) {
                error!("{}", err);
            }
            err
        })?;
        if self.objects.get(&object).and_then(|o| o.resident_in) != Some(portal) {
            return Err(PortalError::NotResident { portal, object });
        }
        let is_player = self
            .objects
            .get(&object)
            .map_or(false, |o| o.kind == ObjectKind::Player);

        self.events
            .push(PortalEvent::BeforeTeleport { portal, object });
        if is_player {
            self.events.push(PortalEvent::BeforePlayerTeleport { portal });
        }

        let tick = self.tick;
        let Some(state) = self.objects.get_mut(&object) else {
            return Err(PortalError::UnknownObject(object));
        };
        let before = state.transform.translation;
        state.transform = mapping.transform(&state.transform);
        state.linear_velocity = mapping.direction(state.linear_velocity);
        state.angular_velocity = mapping.direction(state.angular_velocity);
        state.view_direction = mapping.direction(state.view_direction);
        state.gravity = if is_player {
            -state.transform.up() * state.gravity.length()
        } else {
            mapping.direction(state.gravity)
        };
        state.last_position = Some(state.transform.translation);
        state.last_teleport_tick = Some(tick);
        let offset = state.transform.translation - before;

        self.set_residency(object, Some(partner));
        if let Some(source) = self.portals.get_mut(&portal) {
            source.last_teleport_time = Some(self.time);
        }
        self.teleported_this_tick.insert(object);
        self.last_teleport_tick = Some(tick);
        if is_player {
            self.last_player_teleport_tick = Some(tick);
            self.teleport_in_progress = Some(object);
        }
        info!(
            "Teleported {:?} from portal {:?} to portal {:?}",
            object, portal, partner
        );

        self.events
            .push(PortalEvent::TeleportOffset { object, offset });
        self.events.push(PortalEvent::Teleported { portal, object });
        if is_player {
            self.events.push(PortalEvent::PlayerTeleported { portal });
        }
        Ok(())
    }

    // Missed crossings

    /// Catch objects which went through a portal between two ticks without ever overlapping its
    /// trigger volume, which happens with fast objects or low frame rates.
    fn recover_missed_crossings(&mut self) {
        let mut missed = Vec::new();
        for (entity, object) in &self.objects {
            if self.teleported_this_tick.contains(entity) {
                continue;
            }
            let Some(previous) = object.last_position else {
                continue;
            };
            if self
                .last_teleport_tick
                .map_or(false, |t| self.tick - t <= self.config.recovery_suppress_ticks)
            {
                continue;
            }
            let current = object.transform.translation;
            let max_displacement = object.linear_velocity.length()
                * self.dt
                * self.config.recovery_displacement_factor;
            if (current - previous).length() > max_displacement {
                continue;
            }
            let crossed = self.portals.iter().find(|(portal, state)| {
                self.missed_crossing(**portal, state, object, previous, current)
            });
            if let Some((portal, _)) = crossed {
                missed.push((*portal, *entity));
            }
        }

        for (portal, object) in missed {
            // Residency only moves once the teleport is known to go through.
            if let Err(err) = self.check_teleport(portal, object) {
                warn!(
                    "Object {:?} crossed portal {:?} between two ticks but can't go through: {}",
                    object, portal, err
                );
                continue;
            }
            warn!(
                "Object {:?} crossed portal {:?} between two ticks, teleporting it",
                object, portal
            );
            let previous = self.objects.get(&object).and_then(|o| o.resident_in);
            self.set_residency(object, Some(portal));
            if let Err(err) = self.teleport(portal, object) {
                warn!("Could not recover missed crossing: {}", err);
                self.set_residency(object, previous);
            }
        }
    }

    fn missed_crossing(
        &self,
        entity: Entity,
        portal: &PortalState,
        object: &PortalableObject,
        previous: Vec3,
        current: Vec3,
    ) -> bool {
        if self.teleport_target(entity).is_err() {
            return false;
        }
        let frame = &portal.transform;
        let trigger = &portal.trigger;
        // Still overlapping, the ordinary trigger logic is in charge.
        if trigger.sweep_hits(frame, current, current, object.radius, object.half_height) {
            return false;
        }
        if object.kind == ObjectKind::Player
            && object.linear_velocity.dot(frame.forward()) < self.config.player_min_inward_speed
        {
            return false;
        }
        trigger.signed_distance(frame, previous) < 0.
            && trigger.signed_distance(frame, current) >= 0.
            && trigger.sweep_hits(frame, previous, current, object.radius, object.half_height)
    }

    // Double sided portals

    /// Whether the player would be teleported right away if `portal` was flipped.
    pub fn flip_would_teleport(&self, portal: Entity) -> bool {
        match (self.portals.get(&portal), self.player()) {
            (Some(state), Some((_, player))) => {
                let flipped = state.frame_with_flip(!state.is_flipped);
                self.teleport_condition(state, &flipped, player)
            }
            _ => false,
        }
    }

    fn player(&self) -> Option<(Entity, &PortalableObject)> {
        self.objects
            .iter()
            .find(|(_, object)| object.kind == ObjectKind::Player)
            .map(|(entity, object)| (*entity, object))
    }

    /// Turn double sided portal pairs around when the player walks to their back side.
    fn evaluate_flips(&mut self) {
        if self.teleport_in_progress.is_some() {
            return;
        }
        if self
            .last_teleport_tick
            .map_or(false, |t| self.tick - t < self.config.flip_cooldown_ticks)
        {
            return;
        }
        let Some((_, player)) = self.player() else {
            return;
        };
        let position = player.transform.translation;

        let mut flips = Vec::new();
        for (entity, portal) in &self.portals {
            if !portal.double_sided {
                continue;
            }
            let Some(other) = portal.other_portal else {
                continue;
            };
            let Some(partner) = self.portals.get(&other) else {
                continue;
            };
            if position.distance(portal.transform.translation)
                >= position.distance(partner.transform.translation)
            {
                continue;
            }
            if portal.trigger.signed_distance(&portal.transform, position) <= 0. {
                continue;
            }
            if self.teleport_condition(portal, &portal.transform, player) {
                continue;
            }
            let flipped = portal.frame_with_flip(!portal.is_flipped);
            if self.teleport_condition(portal, &flipped, player) {
                continue;
            }
            flips.push((*entity, other));
        }

        for (portal, partner) in flips {
            for entity in [portal, partner] {
                if let Some(state) = self.portals.get_mut(&entity) {
                    state.flip();
                }
            }
            info!("Flipped portals {:?} and {:?}", portal, partner);
            self.events.push(PortalEvent::Flipped { portal, partner });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const DT: f32 = 1. / 60.;
    const GRAVITY: f32 = 9.81;

    fn portal_a() -> Entity {
        Entity::from_raw(1)
    }

    fn portal_b() -> Entity {
        Entity::from_raw(2)
    }

    fn player() -> Entity {
        Entity::from_raw(10)
    }

    fn cube() -> Entity {
        Entity::from_raw(11)
    }

    fn frame_a() -> Transform {
        // At the origin, inward normal -Z.
        Transform::from_xyz(0., 1., 0.).looking_at(Vec3::new(0., 1., -1.), Vec3::Y)
    }

    fn frame_b() -> Transform {
        Transform::from_xyz(20., 1., 5.).looking_at(Vec3::new(21., 1., 5.), Vec3::Y)
    }

    fn linked_pair(double_sided: bool) -> PortalSystem {
        let mut system = PortalSystem::new(PortalConfig::default());
        for (entity, frame) in [(portal_a(), frame_a()), (portal_b(), frame_b())] {
            let mut descriptor = PortalDescriptor::new(frame, TriggerShape::cuboid(1., 1.5, 0.3));
            descriptor.double_sided = double_sided;
            system.register_portal(entity, descriptor);
        }
        system.link(portal_a(), portal_b()).unwrap();
        system
    }

    fn count(events: &[PortalEvent], pred: impl Fn(&PortalEvent) -> bool) -> usize {
        events.iter().filter(|e| pred(e)).count()
    }

    fn add_walking_player(system: &mut PortalSystem, position: Vec3) {
        let mut object = PortalableObject::player(Transform::from_translation(position), 0.3, 0.6)
            .with_velocity(Vec3::NEG_Z * 2.)
            .with_gravity(Vec3::NEG_Y * GRAVITY);
        object.view_direction = Vec3::NEG_Z;
        system.register_object(player(), object);
    }

    #[test]
    fn player_walks_through_a_portal() {
        let mut system = linked_pair(false);
        add_walking_player(&mut system, Vec3::new(0., 1., 0.2));
        system.queue_trigger(TriggerEvent::Enter {
            portal: portal_a(),
            object: player(),
        });
        system.tick(DT);
        assert!(system.is_resident(portal_a(), player()));
        assert!(system.drain_events().is_empty());

        let before = Vec3::new(0., 1., -0.05);
        system.object_mut(player()).unwrap().transform.translation = before;
        let mapping = system.portal_transform(portal_a()).unwrap();
        system.tick(DT);

        let object = system.object(player()).unwrap();
        assert!(object.transform.translation.abs_diff_eq(mapping.point(before), 1e-4));
        assert!(object
            .linear_velocity
            .abs_diff_eq(mapping.direction(Vec3::NEG_Z * 2.), 1e-4));
        assert!(object
            .gravity
            .abs_diff_eq(-object.transform.up() * GRAVITY, 1e-4));

        // A few more ticks, the player keeps walking out of portal B.
        system.tick(DT);
        system.tick(DT);
        let events = system.drain_events();
        assert_eq!(
            count(&events, |e| matches!(e, PortalEvent::Teleported { .. })),
            1
        );
        assert_eq!(
            count(&events, |e| matches!(e, PortalEvent::PlayerTeleported { .. })),
            1
        );
        assert_eq!(
            events.first(),
            Some(&PortalEvent::BeforeTeleport {
                portal: portal_a(),
                object: player()
            })
        );
        assert!(events.iter().any(|e| matches!(
            e,
            PortalEvent::TeleportOffset { offset, .. }
                if offset.abs_diff_eq(mapping.point(before) - before, 1e-4)
        )));
    }

    #[test]
    fn residency_moves_to_the_partner_on_teleport() {
        let mut system = linked_pair(false);
        system.register_object(
            cube(),
            PortalableObject::prop(Transform::from_xyz(0., 1., 0.2), 0.25),
        );
        system.on_trigger_enter(portal_a(), cube());
        system.object_mut(cube()).unwrap().transform.translation = Vec3::new(0., 1., -0.1);
        system.tick(DT);

        assert!(!system.is_resident(portal_a(), cube()));
        assert!(system.is_resident(portal_b(), cube()));
        assert_eq!(system.object(cube()).unwrap().resident_in(), Some(portal_b()));
        // Stale exit from the entry portal in the same tick is ignored.
        system.on_trigger_exit(portal_a(), cube());
        assert!(system.is_resident(portal_b(), cube()));
    }

    #[test]
    fn cube_pushed_back_out_is_not_teleported() {
        let mut system = linked_pair(false);
        system.register_object(
            cube(),
            PortalableObject::prop(Transform::from_xyz(0., 1., 0.2), 0.25),
        );
        system.queue_trigger(TriggerEvent::Enter {
            portal: portal_a(),
            object: cube(),
        });
        system.tick(DT);
        system.object_mut(cube()).unwrap().transform.translation = Vec3::new(0., 1., 0.8);
        system.queue_trigger(TriggerEvent::Exit {
            portal: portal_a(),
            object: cube(),
        });
        system.tick(DT);
        assert_eq!(system.object(cube()).unwrap().resident_in(), None);

        system.object_mut(cube()).unwrap().transform.translation = Vec3::new(0., 1., 0.25);
        system.queue_trigger(TriggerEvent::Enter {
            portal: portal_a(),
            object: cube(),
        });
        system.tick(DT);

        assert!(system.is_resident(portal_a(), cube()));
        assert!(!system
            .drain_events()
            .iter()
            .any(|e| matches!(e, PortalEvent::Teleported { .. })));
    }

    #[test]
    fn fast_object_skipping_the_trigger_is_recovered_once() {
        let mut system = linked_pair(false);
        let speed = 90.;
        system.register_object(
            cube(),
            PortalableObject::prop(Transform::from_xyz(0., 1., 1.), 0.1)
                .with_velocity(Vec3::NEG_Z * speed),
        );
        system.tick(DT);
        // 1.5 units in one tick, clean over the 0.6 thick trigger.
        system.object_mut(cube()).unwrap().transform.translation = Vec3::new(0., 1., -0.5);
        system.tick(DT);

        assert!(system.is_resident(portal_b(), cube()));
        let exit_velocity = system.object(cube()).unwrap().linear_velocity;
        for _ in 0..3 {
            let object = system.object_mut(cube()).unwrap();
            object.transform.translation += exit_velocity * DT;
            system.tick(DT);
        }
        let events = system.drain_events();
        assert_eq!(
            count(&events, |e| matches!(e, PortalEvent::Teleported { .. })),
            1
        );
    }

    #[test]
    fn anomalous_jump_is_not_mistaken_for_a_crossing() {
        let mut system = linked_pair(false);
        system.register_object(
            cube(),
            PortalableObject::prop(Transform::from_xyz(0., 1., 1.), 0.1)
                .with_velocity(Vec3::NEG_Z),
        );
        system.tick(DT);
        system.object_mut(cube()).unwrap().transform.translation = Vec3::new(0., 1., -1.);
        system.tick(DT);
        assert_eq!(system.object(cube()).unwrap().resident_in(), None);
        assert!(system.drain_events().is_empty());
    }

    #[test]
    fn crossing_beside_the_portal_is_ignored() {
        let mut system = linked_pair(false);
        system.register_object(
            cube(),
            PortalableObject::prop(Transform::from_xyz(5., 1., 1.), 0.1)
                .with_velocity(Vec3::NEG_Z * 90.),
        );
        system.tick(DT);
        system.object_mut(cube()).unwrap().transform.translation = Vec3::new(5., 1., -0.5);
        system.tick(DT);
        assert!(system.drain_events().is_empty());
    }

    #[test]
    fn double_sided_pair_flips_when_the_player_goes_around() {
        let mut system = linked_pair(true);
        let mut object = PortalableObject::player(Transform::from_xyz(0., 1., -3.), 0.3, 0.6);
        object.view_direction = Vec3::Z;
        system.register_object(player(), object);
        system.tick(DT);

        assert!(system.portal(portal_a()).unwrap().is_flipped());
        assert!(system.portal(portal_b()).unwrap().is_flipped());
        let flipped = system.portal(portal_a()).unwrap().transform();
        assert!(flipped.forward().abs_diff_eq(Vec3::Z, 1e-4));
        // Now in front of the flipped portal, nothing else happens.
        system.tick(DT);
        assert!(system.portal(portal_a()).unwrap().is_flipped());
    }

    #[test]
    fn no_flip_if_the_flipped_portal_would_teleport() {
        let mut system = linked_pair(true);
        // In front of A, inside its trigger, walking away from it: flipping would put the
        // player past the flipped plane moving inward.
        let mut object = PortalableObject::player(Transform::from_xyz(0., 1., 0.1), 0.3, 0.6)
            .with_velocity(Vec3::Z * 2.);
        object.view_direction = Vec3::Z;
        system.register_object(player(), object);
        assert!(system.flip_would_teleport(portal_a()));
        system.tick(DT);
        assert!(!system.portal(portal_a()).unwrap().is_flipped());
    }

    #[test]
    fn no_flip_right_after_a_teleport() {
        let mut system = linked_pair(true);
        add_walking_player(&mut system, Vec3::new(0., 1., -0.05));
        system.on_trigger_enter(portal_a(), player());
        system.tick(DT);
        assert!(system.is_resident(portal_b(), player()));

        // Put the player behind B, as if walking around it.
        let behind_b = frame_b().translation + frame_b().forward() * 3.;
        let object = system.object_mut(player()).unwrap();
        object.transform.translation = behind_b;
        object.linear_velocity = Vec3::ZERO;
        system.tick(DT);
        assert!(!system.portal(portal_b()).unwrap().is_flipped());

        for _ in 0..system.config().flip_cooldown_ticks {
            system.tick(DT);
        }
        assert!(system.portal(portal_b()).unwrap().is_flipped());
    }

    #[test]
    fn player_teleports_are_rate_limited() {
        let mut system = linked_pair(false);
        add_walking_player(&mut system, Vec3::new(0., 1., -0.05));
        system.on_trigger_enter(portal_a(), player());
        system.tick(DT);
        assert_eq!(system.teleport_in_progress(), Some(player()));
        assert_eq!(
            system.teleport(portal_b(), player()),
            Err(PortalError::TeleportInProgress(player()))
        );

        system.tick(DT);
        assert_eq!(system.teleport_in_progress(), None);
        assert_eq!(
            system.teleport(portal_b(), player()),
            Err(PortalError::TeleportCooldown {
                object: player(),
                ticks_ago: 1
            })
        );
        system.tick(DT);
        assert_eq!(system.teleport(portal_b(), player()), Ok(()));
    }

    #[test]
    fn misconfigured_portals_do_not_teleport() {
        let mut system = linked_pair(false);
        let c = Entity::from_raw(3);
        system.register_portal(c, PortalDescriptor::new(frame_a(), TriggerShape::cuboid(1., 1., 0.3)));
        assert_eq!(system.portal_transform(c), Err(PortalError::MissingPartner(c)));
        assert_eq!(system.transform_point(c, Vec3::ZERO), None);

        system.disable_physics(
            portal_a(),
            &PortalError::UnsupportedTriggerShape {
                portal: portal_a(),
                shape: "Ball".to_owned(),
            },
        );
        assert_eq!(
            system.portal_transform(portal_a()),
            Err(PortalError::PhysicsDisabled(portal_a()))
        );
        assert_eq!(
            system.portal_transform(portal_b()),
            Err(PortalError::PhysicsDisabled(portal_a()))
        );
    }

    #[test]
    fn scale_factors_must_be_reciprocal() {
        let mut system = PortalSystem::new(PortalConfig::default());
        let c = Entity::from_raw(3);
        for (entity, scale) in [(portal_a(), 2.), (portal_b(), 0.5), (c, 1.)] {
            let mut descriptor = PortalDescriptor::new(frame_a(), TriggerShape::cuboid(1., 1., 0.3));
            descriptor.scale_factor = scale;
            system.register_portal(entity, descriptor);
        }
        assert!(matches!(
            system.link(portal_a(), c),
            Err(PortalError::ScaleMismatch { .. })
        ));
        assert_eq!(system.portal(portal_a()).unwrap().other_portal(), None);
        assert_eq!(system.link(portal_a(), portal_b()), Ok(()));
        assert_eq!(system.portal(portal_b()).unwrap().other_portal(), Some(portal_a()));
    }

    #[test]
    fn relinking_drops_the_previous_partner() {
        let mut system = linked_pair(false);
        let c = Entity::from_raw(3);
        system.register_portal(c, PortalDescriptor::new(frame_b(), TriggerShape::cuboid(1., 1., 0.3)));
        system.link(portal_a(), c).unwrap();
        assert_eq!(system.portal(portal_b()).unwrap().other_portal(), None);
        assert_eq!(system.portal(c).unwrap().other_portal(), Some(portal_a()));
    }

    #[test]
    fn hull_follows_occupancy_and_recent_teleports() {
        let mut system = linked_pair(false);
        let frames = system.config().hull_disable_frames;
        system.register_object(
            cube(),
            PortalableObject::prop(Transform::from_xyz(0., 1., 0.2), 0.25),
        );
        system.on_trigger_enter(portal_a(), cube());
        system.apply_render();
        assert!(system.portal(portal_a()).unwrap().hull().is_visible());
        assert!(system.portal(portal_b()).unwrap().hull().is_visible());

        system.object_mut(cube()).unwrap().transform.translation = Vec3::new(0., 1., 5.);
        system.on_trigger_exit(portal_a(), cube());
        for _ in 1..frames {
            system.apply_render();
        }
        assert!(system.portal(portal_a()).unwrap().hull().is_visible());
        system.apply_render();
        assert!(!system.portal(portal_a()).unwrap().hull().is_visible());
        let hidden = system
            .drain_events()
            .into_iter()
            .filter(|e| {
                matches!(
                    e,
                    PortalEvent::HullChanged {
                        change: HullChange::Disabled,
                        ..
                    }
                )
            })
            .count();
        assert_eq!(hidden, 2);
    }

    #[test]
    fn unregistering_an_object_clears_residency() {
        let mut system = linked_pair(false);
        system.register_object(
            cube(),
            PortalableObject::prop(Transform::from_xyz(0., 1., 0.2), 0.25),
        );
        system.on_trigger_enter(portal_a(), cube());
        system.unregister_object(cube());
        assert!(!system.is_resident(portal_a(), cube()));
        assert_eq!(system.portal(portal_a()).unwrap().residents().count(), 0);
    }

    #[test]
    fn save_data_round_trip() {
        let mut system = linked_pair(false);
        system.set_render_mode(portal_a(), PortalRenderMode::Debug);
        system.set_physics_mode(portal_a(), PortalPhysicsMode::Wall);
        let json = serde_json::to_string(&system.portal(portal_a()).unwrap().save_data()).unwrap();

        let mut restored = linked_pair(false);
        restored.restore(portal_a(), serde_json::from_str(&json).unwrap());
        let portal = restored.portal(portal_a()).unwrap();
        assert_eq!(portal.render_mode(), PortalRenderMode::Debug);
        assert_eq!(portal.physics_mode(), PortalPhysicsMode::Wall);
    }

    #[test]
    fn disabled_partner_blocks_recovery_without_claiming_residency() {
        let mut system = linked_pair(false);
        system.set_physics_mode(portal_b(), PortalPhysicsMode::Wall);
        system.register_object(
            cube(),
            PortalableObject::prop(Transform::from_xyz(0., 1., 1.), 0.1)
                .with_velocity(Vec3::NEG_Z * 90.),
        );
        system.tick(DT);
        system.object_mut(cube()).unwrap().transform.translation = Vec3::new(0., 1., -0.5);
        system.tick(DT);
        for _ in 0..20 {
            system.object_mut(cube()).unwrap().transform.translation += Vec3::NEG_Z * 1.5;
            system.tick(DT);
        }
        for _ in 0..=system.config().hull_disable_frames {
            system.apply_render();
        }

        assert_eq!(system.object(cube()).unwrap().resident_in(), None);
        assert!(!system.is_resident(portal_a(), cube()));
        assert!(!system.portal(portal_a()).unwrap().hull().is_visible());
        assert!(!system
            .drain_events()
            .iter()
            .any(|e| matches!(e, PortalEvent::Teleported { .. })));
    }

    #[test]
    fn resident_object_does_not_teleport_into_a_disabled_partner() {
        let mut system = linked_pair(false);
        system.set_physics_mode(portal_b(), PortalPhysicsMode::None);
        system.register_object(
            cube(),
            PortalableObject::prop(Transform::from_xyz(0., 1., 0.2), 0.25),
        );
        system.on_trigger_enter(portal_a(), cube());
        system.object_mut(cube()).unwrap().transform.translation = Vec3::new(0., 1., -0.1);
        system.tick(DT);
        assert!(system.is_resident(portal_a(), cube()));
        assert!(system.drain_events().is_empty());
    }

    #[test]
    fn recovery_refused_by_cooldown_leaves_residency_alone() {
        let mut system = linked_pair(false);
        system.set_config(PortalConfig {
            global_teleport_cooldown_ticks: 10,
            ..PortalConfig::default()
        });
        system.register_object(
            cube(),
            PortalableObject::prop(Transform::from_xyz(0., 1., 0.2), 0.1),
        );
        system.on_trigger_enter(portal_a(), cube());
        system.object_mut(cube()).unwrap().transform.translation = Vec3::new(0., 1., -0.1);
        system.tick(DT);
        assert!(system.is_resident(portal_b(), cube()));

        // Carried back in front of A, out of B's zone.
        let object = system.object_mut(cube()).unwrap();
        object.transform.translation = Vec3::new(0., 1., 1.);
        object.linear_velocity = Vec3::NEG_Z * 90.;
        system.queue_trigger(TriggerEvent::Exit {
            portal: portal_b(),
            object: cube(),
        });
        for _ in 0..3 {
            system.tick(DT);
        }
        assert_eq!(system.object(cube()).unwrap().resident_in(), None);

        // Jumps across A while still cooling down.
        system.object_mut(cube()).unwrap().transform.translation = Vec3::new(0., 1., -0.5);
        system.tick(DT);

        assert_eq!(system.object(cube()).unwrap().resident_in(), None);
        assert!(!system.is_resident(portal_a(), cube()));
        let events = system.drain_events();
        assert_eq!(
            count(&events, |e| matches!(e, PortalEvent::Teleported { .. })),
            1
        );
    }

    #[test]
    fn recovery_is_suppressed_right_after_any_teleport() {
        let mut system = linked_pair(false);
        let other = Entity::from_raw(12);
        system.register_object(
            cube(),
            PortalableObject::prop(Transform::from_xyz(0., 1., 0.2), 0.25),
        );
        system.register_object(
            other,
            PortalableObject::prop(Transform::from_xyz(0.5, 1., 1.), 0.1)
                .with_velocity(Vec3::NEG_Z * 90.),
        );
        system.tick(DT);

        // The cube goes through A normally, the other prop skips over A in the same tick.
        system.on_trigger_enter(portal_a(), cube());
        system.object_mut(cube()).unwrap().transform.translation = Vec3::new(0., 1., -0.1);
        system.object_mut(other).unwrap().transform.translation = Vec3::new(0.5, 1., -0.5);
        system.tick(DT);

        assert!(system.is_resident(portal_b(), cube()));
        assert_eq!(system.object(other).unwrap().resident_in(), None);
        let events = system.drain_events();
        assert_eq!(
            count(&events, |e| matches!(e, PortalEvent::Teleported { .. })),
            1
        );
    }

    #[test]
    fn scaled_pair_round_trips_points() {
        let mut system = PortalSystem::new(PortalConfig::default());
        for (entity, frame, scale) in [(portal_a(), frame_a(), 2.), (portal_b(), frame_b(), 0.5)] {
            let mut descriptor = PortalDescriptor::new(frame, TriggerShape::cuboid(1., 1.5, 0.3));
            descriptor.scale_factor = scale;
            system.register_portal(entity, descriptor);
        }
        system.link(portal_a(), portal_b()).unwrap();

        for p in [Vec3::new(0.3, 1.2, -0.1), Vec3::new(-4., 0., 7.), Vec3::splat(2.5)] {
            let there = system.transform_point(portal_a(), p).unwrap();
            let back = system.transform_point(portal_b(), there).unwrap();
            assert!(back.abs_diff_eq(p, 1e-4));
        }
        let offset = frame_a().up();
        let there = system.transform_point(portal_a(), frame_a().translation + offset).unwrap();
        assert!(((there - frame_b().translation).length() - 2.).abs() < 1e-4);
    }

    #[test]
    fn moving_a_flipped_portal_keeps_its_flip() {
        let mut system = linked_pair(true);
        let mut object = PortalableObject::player(Transform::from_xyz(0., 1., -3.), 0.3, 0.6);
        object.view_direction = Vec3::Z;
        system.register_object(player(), object);
        system.tick(DT);
        assert!(system.portal(portal_a()).unwrap().is_flipped());

        // Writing the current frame back is a no-op.
        let current = *system.portal(portal_a()).unwrap().transform();
        assert!(!system.set_portal_transform(portal_a(), current));

        let moved = current.with_translation(Vec3::new(2., 1., 0.));
        assert!(system.set_portal_transform(portal_a(), moved));
        let state = system.portal(portal_a()).unwrap();
        assert!(state.is_flipped());
        assert!(state.transform().forward().abs_diff_eq(Vec3::Z, 1e-4));
        assert!(state.frame_with_flip(false).forward().abs_diff_eq(Vec3::NEG_Z, 1e-4));
    }
}
