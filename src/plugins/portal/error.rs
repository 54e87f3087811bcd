use bevy::prelude::Entity;

/// Everything that can go wrong while linking portals or moving objects through them.
///
/// None of these are fatal: callers log them and the affected portal simply stops teleporting.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum PortalError {
    #[error("portal {0:?} is not registered")]
    UnknownPortal(Entity),

    #[error("object {0:?} is not registered as portalable")]
    UnknownObject(Entity),

    #[error("portal {0:?} has no linked partner")]
    MissingPartner(Entity),

    #[error("portal {0:?} does not teleport in its current physics mode")]
    PhysicsDisabled(Entity),

    #[error("portal {portal:?} uses an unsupported trigger shape ({shape}), only boxes and meshes are supported")]
    UnsupportedTriggerShape { portal: Entity, shape: String },

    #[error("portals {a:?} and {b:?} have non reciprocal scale factors ({scale_a} * {scale_b} != 1)")]
    ScaleMismatch {
        a: Entity,
        b: Entity,
        scale_a: f32,
        scale_b: f32,
    },

    #[error("object {object:?} teleported {ticks_ago} tick(s) ago, still cooling down")]
    TeleportCooldown { object: Entity, ticks_ago: u64 },

    #[error("a teleport of {0:?} is still being processed")]
    TeleportInProgress(Entity),

    #[error("object {object:?} is not resident in portal {portal:?}")]
    NotResident { portal: Entity, object: Entity },
}
