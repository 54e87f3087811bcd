use bevy::prelude::*;
use iyes_loopless::prelude::*;
use leafwing_input_manager::prelude::*;

use super::game::GameState;

#[derive(Debug)]
pub struct InputPlugin;

#[derive(Actionlike, Debug, PartialEq, Eq, Clone, Copy, Hash)]
pub enum Actions {
    Forward,
    Backwards,
    StrafeLeft,
    StrafeRight,
    Sprint,
    Jump,
    Aim,
    Pause,
}

pub fn default_input_map() -> InputMap<Actions> {
    let mut input_map = InputMap::new([
        (KeyCode::W, Actions::Forward),
        (KeyCode::S, Actions::Backwards),
        (KeyCode::A, Actions::StrafeLeft),
        (KeyCode::D, Actions::StrafeRight),
        (KeyCode::LShift, Actions::Sprint),
        (KeyCode::Space, Actions::Jump),
        (KeyCode::Tab, Actions::Pause),
    ]);
    input_map.insert(DualAxis::mouse_motion(), Actions::Aim);
    input_map
}

impl Plugin for InputPlugin {
    fn build(&self, app: &mut App) {
        app.add_plugin(InputManagerPlugin::<Actions>::default())
            .add_startup_system(capture_on_start)
            .add_system(toggle_pause);
    }
}

fn capture_on_start(mut windows: ResMut<Windows>) {
    if let Some(window) = windows.get_primary_mut() {
        window.set_cursor_visibility(false);
        window.set_cursor_grab_mode(bevy::window::CursorGrabMode::Locked);
    }
}

/// Pausing stops portal processing and releases the mouse.
fn toggle_pause(
    mut commands: Commands,
    mut windows: ResMut<Windows>,
    state: Res<CurrentState<GameState>>,
    actions: Query<&ActionState<Actions>>,
) {
    if !actions.iter().any(|a| a.just_pressed(Actions::Pause)) {
        return;
    }
    let (next, captured) = match state.0 {
        GameState::Playing => (GameState::Paused, false),
        GameState::Paused => (GameState::Playing, true),
    };
    info!("Switching to {:?}", next);
    commands.insert_resource(NextState(next));
    if let Some(window) = windows.get_primary_mut() {
        window.set_cursor_visibility(!captured);
        window.set_cursor_grab_mode(if captured {
            bevy::window::CursorGrabMode::Locked
        } else {
            bevy::window::CursorGrabMode::None
        });
    }
}
