use std::path::Path;

use bevy::prelude::*;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::compute::SkyAtmosphereUniform;

/// Errors raised while loading an atmosphere preset.
#[derive(Debug, Error)]
pub enum PresetError {
    #[error("failed to read atmosphere preset {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse atmosphere preset: {0}")]
    Parse(#[from] ron::error::SpannedError),

    #[error("failed to write atmosphere preset: {0}")]
    Serialize(#[from] ron::Error),
}

/// Artist-facing atmosphere description, placed on a camera.
///
/// Values are in "user" units: scattering and absorption coefficients per
/// megameter, radii and altitudes in kilometers, the light disk size as a
/// multiple of the real solar disk. Out-of-range values are clamped when the
/// parameter block is built, never rejected.
#[derive(Component, Reflect, Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
#[reflect(Component, Default)]
#[require(SkyAtmosphereUniform)]
#[serde(default)]
pub struct AtmosphereParameters {
    /// When false the LUT generation and composite passes are skipped.
    pub active: bool,
    pub aerial_perspective: bool,
    pub ground_radius: f32,
    /// Reflectance of the ground bounce. Packed in linear space, so the
    /// default mid grey reaches the shaders as 0.5.
    pub ground_albedo: Color,
    pub atmosphere_height: f32,
    pub rayleigh_scattering: Vec3,
    /// Rayleigh scale height in kilometers.
    pub rayleigh_exponential_distribution: f32,
    pub mie_scattering: f32,
    pub mie_absorption: f32,
    pub mie_anisotropy: f32,
    /// Mie scale height in kilometers.
    pub mie_exponential_distribution: f32,
    pub ozone_absorption: Vec3,
    pub ozone_absorption_tip_altitude: f32,
    pub ozone_absorption_width: f32,
    pub light_disk_color: Color,
    pub light_disk_size: f32,
}

impl Default for AtmosphereParameters {
    fn default() -> Self {
        Self {
            active: true,
            aerial_perspective: false,
            ground_radius: 6360.0,
            ground_albedo: Color::linear_rgb(0.5, 0.5, 0.5),
            atmosphere_height: 60.0,
            rayleigh_scattering: Vec3::new(5.802, 13.558, 33.1),
            rayleigh_exponential_distribution: 8.0,
            mie_scattering: 3.996,
            mie_absorption: 4.40,
            mie_anisotropy: 0.8,
            mie_exponential_distribution: 1.2,
            ozone_absorption: Vec3::new(0.650, 1.881, 0.085),
            ozone_absorption_tip_altitude: 25.0,
            ozone_absorption_width: 15.0,
            light_disk_color: Color::WHITE,
            light_disk_size: 1.0,
        }
    }
}

impl AtmosphereParameters {
    pub fn is_active(&self) -> bool {
        self.active
    }

    /// Parses a RON preset. Missing fields keep their default value.
    pub fn from_ron(source: &str) -> Result<Self, PresetError> {
        Ok(ron::from_str(source)?)
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self, PresetError> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path).map_err(|source| PresetError::Io {
            path: path.display().to_string(),
            source,
        })?;
        Self::from_ron(&contents)
    }

    pub fn to_ron(&self) -> Result<String, PresetError> {
        Ok(ron::ser::to_string_pretty(self, ron::ser::PrettyConfig::default())?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_describe_earth() {
        let params = AtmosphereParameters::default();
        assert!(params.is_active());
        assert!(!params.aerial_perspective);
        assert_eq!(params.ground_radius, 6360.0);
        assert_eq!(params.atmosphere_height, 60.0);
        assert_eq!(params.light_disk_size, 1.0);
    }

    #[test]
    fn earth_preset_matches_defaults() {
        let preset =
            AtmosphereParameters::from_ron(include_str!("../assets/presets/earth.ron")).unwrap();
        let defaults = AtmosphereParameters::default();

        assert_eq!(preset.ground_radius, defaults.ground_radius);
        assert_eq!(preset.atmosphere_height, defaults.atmosphere_height);
        assert_eq!(preset.rayleigh_scattering, defaults.rayleigh_scattering);
        assert_eq!(preset.mie_anisotropy, defaults.mie_anisotropy);
        assert_eq!(preset.ozone_absorption, defaults.ozone_absorption);
        assert_eq!(preset.ground_albedo, defaults.ground_albedo);
        assert!(preset.aerial_perspective);
    }

    #[test]
    fn partial_preset_keeps_defaults() {
        let params = AtmosphereParameters::from_ron("(atmosphere_height: 100.0)").unwrap();
        assert_eq!(params.atmosphere_height, 100.0);
        assert_eq!(params.ground_radius, 6360.0);
    }

    #[test]
    fn malformed_preset_is_a_parse_error() {
        let err = AtmosphereParameters::from_ron("(ground_radius: \"far\")").unwrap_err();
        assert!(matches!(err, PresetError::Parse(_)));
    }

    #[test]
    fn exported_preset_loads_back() {
        let params = AtmosphereParameters {
            aerial_perspective: true,
            mie_anisotropy: 0.6,
            ..default()
        };
        let source = params.to_ron().unwrap();
        assert_eq!(AtmosphereParameters::from_ron(&source).unwrap(), params);
    }

    #[test]
    fn missing_preset_file_is_an_io_error() {
        let err = AtmosphereParameters::load("does/not/exist.ron").unwrap_err();
        assert!(matches!(err, PresetError::Io { .. }));
    }
}
