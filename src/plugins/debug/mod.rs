pub mod draw;

use bevy::{app::PluginGroupBuilder, prelude::*};
use bevy_prototype_debug_lines::DebugLinesPlugin;

use crate::plugins::portal::{Portal, PortalLabels, PortalRenderMode};

#[derive(Debug)]
/// Development plugins intended for debug builds use.
pub struct DeveloperPlugins;

impl PluginGroup for DeveloperPlugins {
    fn build(self) -> PluginGroupBuilder {
        PluginGroupBuilder::start::<Self>()
            .add(bevy_editor_pls::prelude::EditorPlugin)
            .add(DebugLinesPlugin::default())
            .add(PortalDebugPlugin)
    }
}

#[derive(Debug)]
/// Draws portal frames, trigger zones and the objects resident in them. F2 cycles render modes.
pub struct PortalDebugPlugin;

impl Plugin for PortalDebugPlugin {
    fn build(&self, app: &mut App) {
        app.add_system(draw::draw_portals.after(PortalLabels::Step))
            .add_system(cycle_render_modes.before(PortalLabels::SyncAuthoring));
    }
}

/// F2 cycles the render mode of every portal.
fn cycle_render_modes(keys: Res<Input<KeyCode>>, mut portals: Query<&mut Portal>) {
    if !keys.just_pressed(KeyCode::F2) {
        return;
    }
    for mut portal in &mut portals {
        portal.render_mode = match portal.render_mode {
            PortalRenderMode::Normal => PortalRenderMode::Debug,
            PortalRenderMode::Debug => PortalRenderMode::Wall,
            PortalRenderMode::Wall => PortalRenderMode::Invisible,
            PortalRenderMode::Invisible => PortalRenderMode::Normal,
        };
    }
}
