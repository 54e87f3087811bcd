//! Render side of the portals: per portal render targets and cameras, render modes and hulls.

use bevy::{
    prelude::*,
    render::{
        camera::RenderTarget,
        render_resource::{
            Extent3d, TextureDescriptor, TextureDimension, TextureFormat, TextureUsages,
        },
    },
    utils::HashMap,
    window::WindowResized,
};
use bevy_rapier3d::prelude::Collider;

use super::{
    volumetric::{RenderTargets, RenderTextureAllocator, RenderTexturePair},
    Portal, PortalRenderMode, PortalSystem,
};
use crate::plugins::first_person_controller::FirstPersonCamera;

/// Thickness of the volumetric hull, extruded behind the portal surface.
const HULL_DEPTH: f32 = 0.6;

#[derive(Debug, Resource)]
pub struct PortalRenderResources {
    debug_material: Handle<StandardMaterial>,
    wall_material: Handle<StandardMaterial>,
}

/// Texture pairs of every portal, keyed by portal entity so they can be released once the portal
/// is gone.
#[derive(Debug, Default, Resource)]
pub struct PortalRenderTargets {
    targets: HashMap<Entity, RenderTargets<Handle<Image>>>,
}

impl PortalRenderTargets {
    pub fn color_target(&self, portal: Entity) -> Option<Handle<Image>> {
        self.targets
            .get(&portal)
            .and_then(|t| t.current())
            .map(|pair| pair.color.clone())
    }
}

/// Camera rendering the view through a portal, and the material showing it.
#[derive(Debug, Component)]
pub struct PortalView {
    camera: Entity,
    hull: Entity,
    material: Handle<StandardMaterial>,
}

#[derive(Debug, Default, Component)]
pub struct PortalHull;

#[derive(Debug, Component)]
pub struct PortalCamera {
    portal: Entity,
}

/// Allocates portal textures as image assets.
struct ImageAllocator<'a> {
    images: &'a mut Assets<Image>,
}

impl ImageAllocator<'_> {
    fn image(&mut self, width: u32, height: u32, format: TextureFormat) -> Handle<Image> {
        let size = Extent3d {
            width,
            height,
            ..default()
        };
        let mut image = Image {
            texture_descriptor: TextureDescriptor {
                label: None,
                size,
                mip_level_count: 1,
                sample_count: 1,
                dimension: TextureDimension::D2,
                format,
                usage: TextureUsages::TEXTURE_BINDING
                    | TextureUsages::COPY_DST
                    | TextureUsages::RENDER_ATTACHMENT,
            },
            ..default()
        };
        image.resize(size);
        self.images.add(image)
    }
}

impl RenderTextureAllocator for ImageAllocator<'_> {
    type Handle = Handle<Image>;

    fn allocate(&mut self, width: u32, height: u32) -> RenderTexturePair<Handle<Image>> {
        debug!("Allocating portal render targets ({}x{})", width, height);
        RenderTexturePair {
            color: self.image(width, height, TextureFormat::Bgra8UnormSrgb),
            depth: self.image(width, height, TextureFormat::R32Float),
            width,
            height,
        }
    }

    fn release(&mut self, pair: RenderTexturePair<Handle<Image>>) {
        debug!("Releasing portal render targets ({}x{})", pair.width, pair.height);
        self.images.remove(&pair.color);
        self.images.remove(&pair.depth);
    }
}

fn primary_window_size(windows: &Windows) -> (u32, u32) {
    windows
        .get_primary()
        .map(|w| (w.physical_width(), w.physical_height()))
        .unwrap_or((1280, 720))
}

pub(super) fn load_portal_assets(
    mut commands: Commands,
    mut materials: ResMut<Assets<StandardMaterial>>,
) {
    let debug_material = materials.add(StandardMaterial {
        base_color: Color::PURPLE,
        unlit: true,
        ..default()
    });
    let wall_material = materials.add(Color::DARK_GRAY.into());
    commands.insert_resource(PortalRenderResources {
        debug_material,
        wall_material,
    });
}

/// Give new portals a surface mesh, a hull, a render target and a camera rendering into it.
pub(super) fn setup_portal_views(
    mut commands: Commands,
    portal_query: Query<(Entity, &Collider), Added<Portal>>,
    windows: Res<Windows>,
    mut render_targets: ResMut<PortalRenderTargets>,
    mut images: ResMut<Assets<Image>>,
    mut meshes: ResMut<Assets<Mesh>>,
    mut materials: ResMut<Assets<StandardMaterial>>,
) {
    let (width, height) = primary_window_size(&windows);
    for (entity, collider) in &portal_query {
        let mut targets = RenderTargets::default();
        let pair = targets.create(&mut ImageAllocator { images: &mut *images }, width, height);
        let color = pair.color.clone();
        render_targets.targets.insert(entity, targets);

        let material = materials.add(StandardMaterial {
            base_color_texture: Some(color.clone()),
            unlit: true,
            ..default()
        });
        let half = collider
            .as_cuboid()
            .map(|c| c.half_extents())
            .unwrap_or(Vec3::ONE);

        let camera = commands
            .spawn(Camera3dBundle {
                camera: Camera {
                    // Render before the main camera.
                    priority: -1,
                    target: RenderTarget::Image(color),
                    ..default()
                },
                ..default()
            })
            .insert((Name::from("Portal camera"), PortalCamera { portal: entity }))
            .id();

        let hull = commands
            .spawn(PbrBundle {
                mesh: meshes.add(
                    shape::Box {
                        min_x: -half.x,
                        max_x: half.x,
                        min_y: -half.y,
                        max_y: half.y,
                        min_z: -HULL_DEPTH,
                        max_z: 0.,
                    }
                    .into(),
                ),
                material: material.clone(),
                visibility: Visibility { is_visible: false },
                ..default()
            })
            .insert((Name::from("Portal hull"), PortalHull))
            .id();

        commands
            .entity(entity)
            .insert((
                meshes.add(
                    shape::Quad {
                        size: Vec2::new(half.x * 2., half.y * 2.),
                        flip: false,
                    }
                    .into(),
                ),
                material.clone(),
                PortalView {
                    camera,
                    hull,
                    material,
                },
            ))
            .add_child(hull);
    }
}

/// Apply each portal's render mode and hull visibility.
pub(super) fn apply_portal_render(
    mut portal_system: ResMut<PortalSystem>,
    resources: Res<PortalRenderResources>,
    windows: Res<Windows>,
    mut render_targets: ResMut<PortalRenderTargets>,
    mut images: ResMut<Assets<Image>>,
    mut materials: ResMut<Assets<StandardMaterial>>,
    mut portal_query: Query<
        (
            Entity,
            &PortalView,
            &mut Handle<StandardMaterial>,
            &mut Visibility,
        ),
        Without<PortalHull>,
    >,
    mut hull_query: Query<
        (&mut Visibility, &mut Handle<StandardMaterial>),
        With<PortalHull>,
    >,
    mut camera_query: Query<&mut Camera, With<PortalCamera>>,
) {
    portal_system.apply_render();

    for (entity, view, mut material, mut visibility) in &mut portal_query {
        let Some(state) = portal_system.portal(entity) else {
            continue;
        };
        let mode = state.render_mode();
        let renders_view = mode == PortalRenderMode::Normal;

        // Textures only live while the portal shows what's behind it.
        let targets = render_targets.targets.entry(entity).or_default();
        let mut allocator = ImageAllocator { images: &mut *images };
        if renders_view && targets.current().is_none() {
            let (width, height) = primary_window_size(&windows);
            let color = targets.create(&mut allocator, width, height).color.clone();
            if let Some(view_material) = materials.get_mut(&view.material) {
                view_material.base_color_texture = Some(color.clone());
            }
            if let Ok(mut camera) = camera_query.get_mut(view.camera) {
                camera.target = RenderTarget::Image(color);
            }
        } else if !renders_view {
            targets.release(&mut allocator);
        }
        if let Ok(mut camera) = camera_query.get_mut(view.camera) {
            camera.is_active = renders_view;
        }

        let wanted = match mode {
            PortalRenderMode::Normal | PortalRenderMode::Invisible => view.material.clone(),
            PortalRenderMode::Debug => resources.debug_material.clone(),
            PortalRenderMode::Wall => resources.wall_material.clone(),
        };
        if *material != wanted {
            *material = wanted;
        }
        let visible = mode != PortalRenderMode::Invisible;
        if visibility.is_visible != visible {
            visibility.is_visible = visible;
        }

        if let Ok((mut hull_visibility, mut hull_material)) = hull_query.get_mut(view.hull) {
            let hull_visible = visible && state.hull().is_visible();
            if hull_visible && !hull_visibility.is_visible {
                // Coming back on, pick up the current shared material.
                *hull_material = material.clone();
            }
            if hull_visibility.is_visible != hull_visible {
                hull_visibility.is_visible = hull_visible;
            }
        }
    }
}

/// Recreate render targets when the window size changes.
pub(super) fn resize_render_targets(
    mut resized: EventReader<WindowResized>,
    windows: Res<Windows>,
    mut render_targets: ResMut<PortalRenderTargets>,
    mut images: ResMut<Assets<Image>>,
    mut materials: ResMut<Assets<StandardMaterial>>,
    portal_query: Query<(Entity, &PortalView)>,
    mut camera_query: Query<&mut Camera, With<PortalCamera>>,
) {
    let Some(primary) = windows.get_primary() else {
        return;
    };
    if !resized.iter().any(|event| event.id == primary.id()) {
        return;
    }
    let (width, height) = (primary.physical_width(), primary.physical_height());
    for (entity, view) in &portal_query {
        let Some(targets) = render_targets.targets.get_mut(&entity) else {
            continue;
        };
        if !targets.resize(&mut ImageAllocator { images: &mut *images }, width, height) {
            continue;
        }
        info!("Resized render targets of portal {:?} to {}x{}", entity, width, height);
        let Some(color) = targets.current().map(|pair| pair.color.clone()) else {
            continue;
        };
        if let Some(material) = materials.get_mut(&view.material) {
            material.base_color_texture = Some(color.clone());
        }
        if let Ok(mut camera) = camera_query.get_mut(view.camera) {
            camera.target = RenderTarget::Image(color);
        }
    }
}

/// Place every portal camera behind the partner portal, at the main camera's relative position,
/// and release the targets of portals which no longer exist.
pub(super) fn sync_portal_cameras(
    mut commands: Commands,
    portal_system: Res<PortalSystem>,
    mut render_targets: ResMut<PortalRenderTargets>,
    mut images: ResMut<Assets<Image>>,
    main_camera_query: Query<&GlobalTransform, (With<FirstPersonCamera>, Without<PortalCamera>)>,
    mut portal_cam_query: Query<(Entity, &PortalCamera, &mut Transform)>,
) {
    let stale = render_targets
        .targets
        .keys()
        .filter(|portal| portal_system.portal(**portal).is_none())
        .copied()
        .collect::<Vec<_>>();
    for portal in stale {
        if let Some(mut targets) = render_targets.targets.remove(&portal) {
            targets.release(&mut ImageAllocator { images: &mut *images });
        }
    }

    let main_camera = main_camera_query
        .get_single()
        .ok()
        .map(|cam| cam.compute_transform());
    for (entity, camera, mut transform) in &mut portal_cam_query {
        if portal_system.portal(camera.portal).is_none() {
            commands.entity(entity).despawn_recursive();
            continue;
        }
        let (Some(main_camera), Ok(mapping)) =
            (main_camera, portal_system.portal_transform(camera.portal))
        else {
            continue;
        };
        *transform = mapping.transform(&main_camera).with_scale(Vec3::ONE);
    }
}
