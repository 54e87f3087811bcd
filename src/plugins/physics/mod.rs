//! Rapier setup and the collision groups shared by the game's plugins.

use bevy::prelude::*;
use bevy_rapier3d::prelude::{CollisionGroups, Group, RapierConfiguration, TimestepMode};

use super::portal::PortalPhysicsMode;

pub const WALLS_GROUP: Group = Group::GROUP_1;
pub const PROPS_GROUP: Group = Group::GROUP_2;
pub const PORTAL_GROUP: Group = Group::GROUP_3;
pub const PLAYER_GROUP: Group = Group::GROUP_4;
pub const RAYCAST_GROUP: Group = Group::GROUP_5;
pub const GROUND_GROUP: Group = Group::GROUP_6;
pub const ALL_GROUPS: Group = Group::ALL;

/// Groups of a portal's collider for each physics mode. A portal is a sensor for players and
/// props, a plain wall, or nothing at all.
pub fn portal_collision_groups(mode: PortalPhysicsMode) -> CollisionGroups {
    match mode {
        PortalPhysicsMode::Normal => {
            CollisionGroups::new(PORTAL_GROUP, PLAYER_GROUP | PROPS_GROUP)
        }
        PortalPhysicsMode::Wall => CollisionGroups::new(WALLS_GROUP, ALL_GROUPS),
        PortalPhysicsMode::None => CollisionGroups::new(PORTAL_GROUP, Group::NONE),
    }
}

/// Filters of a portalable object. While resident in a portal it goes through the walls the
/// portal is mounted on.
pub fn portalable_filters(resident: bool) -> Group {
    if resident {
        ALL_GROUPS - WALLS_GROUP
    } else {
        ALL_GROUPS
    }
}

#[derive(Debug)]
pub struct PhysicsPlugin;

impl Plugin for PhysicsPlugin {
    fn build(&self, app: &mut App) {
        app.add_startup_system(configure_rapier);
    }
}

fn configure_rapier(mut config: ResMut<RapierConfiguration>) {
    // Objects come out of portals fast, CCD gets extra substeps
    config.timestep_mode = TimestepMode::Variable {
        max_dt: 1. / 20.,
        time_scale: 1.,
        substeps: 4,
    };
    debug!("Rapier timestep: {:?}", config.timestep_mode);
}
