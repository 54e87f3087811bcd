use std::path::Path;

use bevy::prelude::*;
use serde::Deserialize;

/// Location of the optional portal tuning file, relative to the working directory.
pub const PORTAL_CONFIG_PATH: &str = "assets/config/portals.json";

/// Tunables for the portal subsystem.
///
/// Every field has a default so a partial JSON file only overrides what it names.
#[derive(Debug, Clone, PartialEq, Resource, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct PortalConfig {
    /// Minimum number of ticks between two player teleports.
    pub global_teleport_cooldown_ticks: u64,
    /// Ticks after a teleport during which missed crossing recovery stays quiet.
    pub recovery_suppress_ticks: u64,
    /// A displacement longer than `speed * dt * factor` is treated as a jump, not a crossing.
    pub recovery_displacement_factor: f32,
    /// Ticks after any teleport during which double sided portals won't flip.
    pub flip_cooldown_ticks: u64,
    /// Consecutive frames of the off condition before a volumetric hull is hidden.
    pub hull_disable_frames: u32,
    /// Seconds after a teleport through the partner portal during which the hull stays on.
    pub recent_teleport_window: f32,
    /// Minimum speed along the portal's inward normal for the player to be teleported.
    pub player_min_inward_speed: f32,
    /// Minimum dot product between the player view direction and the inward normal.
    pub player_facing_threshold: f32,
    /// Debug switch keeping every volumetric hull visible.
    pub force_volumetric: bool,
}

impl Default for PortalConfig {
    fn default() -> Self {
        PortalConfig {
            global_teleport_cooldown_ticks: 2,
            recovery_suppress_ticks: 2,
            recovery_displacement_factor: 3.,
            flip_cooldown_ticks: 10,
            hull_disable_frames: 4,
            recent_teleport_window: 0.25,
            player_min_inward_speed: 0.05,
            player_facing_threshold: -0.25,
            force_volumetric: false,
        }
    }
}

impl PortalConfig {
    pub fn from_json_str(json: &str) -> Result<PortalConfig, serde_json::Error> {
        serde_json::from_str(json)
    }

    /// Load the configuration from `path`, falling back to the defaults when the file is missing
    /// or malformed.
    pub fn load_or_default<P: AsRef<Path>>(path: P) -> PortalConfig {
        let path = path.as_ref();
        match std::fs::read_to_string(path) {
            Ok(json) => match PortalConfig::from_json_str(&json) {
                Ok(config) => {
                    info!("Loaded portal configuration from {}", path.display());
                    config
                }
                Err(err) => {
                    error!(
                        "Malformed portal configuration {}: {}, using defaults",
                        path.display(),
                        err
                    );
                    PortalConfig::default()
                }
            },
            Err(_) => {
                warn!(
                    "No portal configuration at {}, using defaults",
                    path.display()
                );
                PortalConfig::default()
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn partial_file_keeps_defaults() {
        let config =
            PortalConfig::from_json_str(r#"{ "hull_disable_frames": 8, "force_volumetric": true }"#)
                .unwrap();
        assert_eq!(config.hull_disable_frames, 8);
        assert!(config.force_volumetric);
        assert_eq!(
            config.recovery_displacement_factor,
            PortalConfig::default().recovery_displacement_factor
        );
    }

    #[test]
    fn unknown_fields_are_rejected() {
        assert!(PortalConfig::from_json_str(r#"{ "hull_frames": 8 }"#).is_err());
    }

    #[test]
    fn shipped_config_matches_defaults() {
        let json = include_str!("../../../assets/config/portals.json");
        assert_eq!(
            PortalConfig::from_json_str(json).unwrap(),
            PortalConfig::default()
        );
    }

    #[test]
    fn missing_file_falls_back_to_defaults() {
        let config = PortalConfig::load_or_default("does/not/exist/portals.json");
        assert_eq!(config, PortalConfig::default());
    }
}
