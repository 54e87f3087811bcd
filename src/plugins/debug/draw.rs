use bevy::prelude::*;
use bevy_prototype_debug_lines::DebugLines;

use crate::plugins::portal::{PortalState, PortalSystem};

const FRAME_COLOR: Color = Color::CYAN;
const NORMAL_COLOR: Color = Color::YELLOW;
const ZONE_COLOR: Color = Color::ORANGE;
const RESIDENT_COLOR: Color = Color::LIME_GREEN;

fn draw_box(lines: &mut DebugLines, transform: &Transform, min: Vec3, max: Vec3, color: Color) {
    let corner = |x: bool, y: bool, z: bool| {
        transform.transform_point(Vec3::new(
            if x { max.x } else { min.x },
            if y { max.y } else { min.y },
            if z { max.z } else { min.z },
        ))
    };
    for a in [false, true] {
        for b in [false, true] {
            lines.line_colored(corner(false, a, b), corner(true, a, b), 0., color);
            lines.line_colored(corner(a, false, b), corner(a, true, b), 0., color);
            lines.line_colored(corner(a, b, false), corner(a, b, true), 0., color);
        }
    }
}

fn draw_portal(lines: &mut DebugLines, portal: &PortalState) {
    let transform = portal.transform();
    let half = portal.trigger().surface_half_size();
    draw_box(
        lines,
        transform,
        Vec3::new(-half.x, -half.y, 0.),
        Vec3::new(half.x, half.y, 0.),
        FRAME_COLOR,
    );
    // The direction objects have to travel to go through.
    lines.line_colored(
        transform.translation,
        transform.translation + transform.forward(),
        0.,
        NORMAL_COLOR,
    );
    let (min, max) = portal.trigger().local_bounds();
    draw_box(lines, transform, min, max, ZONE_COLOR);
}

pub fn draw_portals(portal_system: Res<PortalSystem>, mut lines: ResMut<DebugLines>) {
    for (_, portal) in portal_system.portals() {
        draw_portal(&mut lines, portal);
        for resident in portal.residents() {
            if let Some(object) = portal_system.object(*resident) {
                lines.line_colored(
                    portal.transform().translation,
                    object.transform.translation,
                    0.,
                    RESIDENT_COLOR,
                );
            }
        }
    }
}
