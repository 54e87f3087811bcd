use std::f32::consts::FRAC_PI_2;

use bevy::prelude::*;
use bevy_rapier3d::prelude::*;

use crate::plugins::{
    physics::*,
    portal::{Portal, PortalBundle, PortalTeleport},
};

/// A square room of side `length`: ground, ceiling and four walls, with the ground's top at y=0.
///
/// Walls are numbered counter clockwise seen from above, starting with the one on the -Z side.
#[derive(Debug, Clone, Copy)]
pub struct Arena {
    pub length: f32,
    pub height: f32,
}

impl Arena {
    pub const WALL_THICKNESS: f32 = 1.;
    pub const WALLS: usize = 4;

    fn wall_rotation(wall: usize) -> Quat {
        Quat::from_rotation_y((wall % Self::WALLS) as f32 * FRAC_PI_2)
    }

    pub fn wall_transform(&self, wall: usize) -> Transform {
        let rotation = Self::wall_rotation(wall);
        let center = Vec3::new(
            0.,
            self.height / 2.,
            -(self.length + Self::WALL_THICKNESS) / 2.,
        );
        Transform::from_translation(rotation * center).with_rotation(rotation)
    }

    /// Portal set into the inner face of `wall`, `along` to the right of the wall's middle seen
    /// from inside the room and `height` above the ground. Its forward axis points into the
    /// wall, so objects walking into the wall go through.
    pub fn wall_portal(&self, wall: usize, along: f32, height: f32) -> Transform {
        let rotation = Self::wall_rotation(wall);
        Transform::from_translation(rotation * Vec3::new(along, height, -self.length / 2.))
            .with_rotation(rotation)
    }

    pub fn spawn(
        &self,
        commands: &mut Commands,
        meshes: &mut ResMut<Assets<Mesh>>,
        materials: &mut ResMut<Assets<StandardMaterial>>,
    ) {
        let thickness = Self::WALL_THICKNESS;
        // Slabs overlap the walls so the corners are closed.
        let slab_half = self.length / 2. + thickness;
        let slab_mesh = meshes.add(shape::Box::new(slab_half * 2., thickness, slab_half * 2.).into());
        let slab_material = materials.add(StandardMaterial::from(Color::DARK_GRAY));
        for (name, y) in [
            ("Ground", -thickness / 2.),
            ("Ceiling", self.height + thickness / 2.),
        ] {
            commands.spawn((
                PbrBundle {
                    mesh: slab_mesh.clone(),
                    material: slab_material.clone(),
                    transform: Transform::from_xyz(0., y, 0.),
                    ..default()
                },
                Name::from(name),
                RigidBody::Fixed,
                Collider::cuboid(slab_half, thickness / 2., slab_half),
                CollisionGroups::new(GROUND_GROUP, ALL_GROUPS),
            ));
        }

        let wall_mesh =
            meshes.add(shape::Box::new(self.length, self.height, thickness).into());
        let colors = [Color::RED, Color::GREEN, Color::BLUE, Color::ANTIQUE_WHITE];
        for (wall, color) in colors.into_iter().enumerate() {
            commands.spawn((
                PbrBundle {
                    mesh: wall_mesh.clone(),
                    material: materials.add(StandardMaterial::from(color)),
                    transform: self.wall_transform(wall),
                    ..default()
                },
                Name::from(format!("Wall_{}", wall)),
                RigidBody::Fixed,
                Collider::cuboid(self.length / 2., self.height / 2., thickness / 2.),
                // Portalable objects drop this group while resident, so they pass through.
                CollisionGroups::new(WALLS_GROUP, ALL_GROUPS),
            ));
        }
    }
}

/// Spawn two portals linked to each other.
pub fn spawn_portal_pair(
    commands: &mut Commands,
    a: Transform,
    b: Transform,
    double_sided: bool,
) -> (Entity, Entity) {
    let a_id = commands
        .spawn(PortalBundle {
            mesh_bundle: PbrBundle {
                transform: a,
                ..default()
            },
            ..default()
        })
        .insert(Name::from("Portal A"))
        .id();
    let b_id = commands
        .spawn(PortalBundle {
            mesh_bundle: PbrBundle {
                transform: b,
                ..default()
            },
            portal: Portal {
                linked_portal: Some(a_id),
                double_sided,
                ..default()
            },
            ..default()
        })
        .insert(Name::from("Portal B"))
        .id();
    commands.entity(a_id).insert(Portal {
        linked_portal: Some(b_id),
        double_sided,
        ..default()
    });
    (a_id, b_id)
}

/// Spawn a dynamic cube which can go through portals.
pub fn spawn_prop(
    commands: &mut Commands,
    meshes: &mut ResMut<Assets<Mesh>>,
    materials: &mut ResMut<Assets<StandardMaterial>>,
    position: Vec3,
    size: f32,
) -> Entity {
    let half = size / 2.;
    commands
        .spawn(PbrBundle {
            mesh: meshes.add(shape::Cube { size }.into()),
            material: materials.add(StandardMaterial::from(Color::GOLD)),
            transform: Transform::from_translation(position),
            ..default()
        })
        .insert((
            Name::from("Prop"),
            RigidBody::Dynamic,
            Collider::cuboid(half, half, half),
            Velocity::default(),
            Ccd::enabled(),
            ActiveEvents::COLLISION_EVENTS,
            CollisionGroups::new(PROPS_GROUP, ALL_GROUPS),
            PortalTeleport {
                radius: half,
                half_height: 0.,
            },
        ))
        .id()
}

/// A short flight of stairs going up along -Z from `base`.
pub fn spawn_stairs(
    commands: &mut Commands,
    meshes: &mut ResMut<Assets<Mesh>>,
    materials: &mut ResMut<Assets<StandardMaterial>>,
    base: Vec3,
    steps: u32,
    step_height: f32,
) {
    const STEP_WIDTH: f32 = 1.5;
    const STEP_DEPTH: f32 = 0.4;

    let material = materials.add(StandardMaterial::from(Color::SILVER));
    for i in 0..steps {
        let height = step_height * (i + 1) as f32;
        let center = base + Vec3::new(0., height / 2., -STEP_DEPTH * (i as f32 + 0.5));
        commands
            .spawn(PbrBundle {
                mesh: meshes.add(
                    shape::Box::new(STEP_WIDTH, height, STEP_DEPTH).into(),
                ),
                material: material.clone(),
                transform: Transform::from_translation(center),
                ..default()
            })
            .insert((
                Name::from(format!("Step_{}", i)),
                RigidBody::Fixed,
                Collider::cuboid(STEP_WIDTH / 2., height / 2., STEP_DEPTH / 2.),
                CollisionGroups::new(GROUND_GROUP, ALL_GROUPS),
            ));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const ARENA: Arena = Arena {
        length: 20.,
        height: 3.,
    };

    #[test]
    fn wall_portals_sit_on_the_inner_face() {
        for wall in 0..Arena::WALLS {
            let portal = ARENA.wall_portal(wall, 0., 1.2);
            let wall_center = ARENA.wall_transform(wall).translation;
            let depth = (wall_center - portal.translation).dot(portal.forward());
            assert!((depth - Arena::WALL_THICKNESS / 2.).abs() < 1e-4);
            let outward = portal.translation * Vec3::new(1., 0., 1.);
            assert!((outward.length() - ARENA.length / 2.).abs() < 1e-4);
            assert!(portal.forward().abs_diff_eq(outward.normalize(), 1e-4));
        }
    }

    #[test]
    fn along_moves_right_seen_from_the_room() {
        let middle = ARENA.wall_portal(1, 0., 1.);
        let shifted = ARENA.wall_portal(1, 2., 1.);
        assert!((shifted.translation - middle.translation).abs_diff_eq(middle.right() * 2., 1e-4));
        assert!((shifted.translation.y - 1.).abs() < 1e-5);
    }
}
