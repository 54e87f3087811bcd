use bevy::prelude::*;

use portal_transit::plugins::game::GamePlugin;

fn main() {
    App::new().add_plugin(GamePlugin).run();
}
