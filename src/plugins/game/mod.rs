use std::f32::consts::*;

use crate::{
    plugins::{
        first_person_controller::{FirstPersonControllerBundle, FirstPersonControllerPlugin},
        input::InputPlugin,
        physics::PhysicsPlugin,
        portal::{PortalConfig, PortalPlugin, PORTAL_CONFIG_PATH},
    },
    util::scenes::{spawn_portal_pair, spawn_prop, spawn_stairs, Arena},
};

use bevy::prelude::*;
use bevy_rapier3d::prelude::*;
use iyes_loopless::prelude::*;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum GameState {
    Playing,
    Paused,
}

#[derive(Debug)]
/// Main game plugin, responsible for loading the other game plugins and bootstrapping the game.
pub struct GamePlugin;

impl Plugin for GamePlugin {
    fn build(&self, app: &mut App) {
        app.add_plugins(DefaultPlugins.set(WindowPlugin {
            window: WindowDescriptor {
                title: "Portal transit".to_string(),
                width: 1280.,
                height: 720.,
                ..default()
            },
            ..default()
        }));

        #[cfg(feature = "devel")]
        {
            app.add_plugins(crate::plugins::debug::DeveloperPlugins);
        }

        app.add_loopless_state(GameState::Playing)
            .insert_resource(PortalConfig::load_or_default(PORTAL_CONFIG_PATH))
            .add_plugin(RapierPhysicsPlugin::<NoUserData>::default())
            .add_plugin(PhysicsPlugin)
            .add_plugin(InputPlugin)
            .add_plugin(FirstPersonControllerPlugin)
            .add_plugin(PortalPlugin)
            .add_startup_system(setup);
    }
}

/// Perform game initialization
fn setup(
    mut commands: Commands,
    mut meshes: ResMut<Assets<Mesh>>,
    mut materials: ResMut<Assets<StandardMaterial>>,
) {
    let arena = Arena {
        length: 20.,
        height: 3.,
    };
    arena.spawn(&mut commands, &mut meshes, &mut materials);

    // Light
    commands.spawn(DirectionalLightBundle {
        directional_light: DirectionalLight {
            color: Color::ANTIQUE_WHITE,
            illuminance: 20_000.,
            shadows_enabled: true,
            ..default()
        },
        transform: Transform {
            translation: Vec3::Y * 5.,
            rotation: Quat::from_euler(EulerRot::YXZ, FRAC_PI_4, FRAC_PI_4, 0.),
            scale: Vec3::ONE,
        },
        ..default()
    });

    commands.spawn(FirstPersonControllerBundle {
        spatial: SpatialBundle::from(Transform::from_xyz(0., 1., 4.)),
        ..default()
    });

    // A one sided pair on two adjacent walls, the first one ahead of the spawn point.
    spawn_portal_pair(
        &mut commands,
        arena.wall_portal(0, -3., 1.2),
        arena.wall_portal(1, 2., 1.2),
        false,
    );
    // A double sided pair which can be walked around.
    spawn_portal_pair(
        &mut commands,
        Transform::from_xyz(3., 1.2, 3.),
        Transform::from_xyz(-6., 1.2, -6.).with_rotation(Quat::from_rotation_y(PI)),
        true,
    );

    for i in 0..3 {
        spawn_prop(
            &mut commands,
            &mut meshes,
            &mut materials,
            Vec3::new(-3. + i as f32 * 0.6, 0.5, 2.),
            0.4,
        );
    }

    spawn_stairs(
        &mut commands,
        &mut meshes,
        &mut materials,
        Vec3::new(7., 0., 6.),
        5,
        0.2,
    );
}
