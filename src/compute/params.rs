//! Packs [`AtmosphereParameters`] into the 16-slot uniform block read by every
//! sky atmosphere shader.

use std::f32::consts::PI;
use std::ops::RangeInclusive;

use bevy::{
    prelude::*,
    render::{camera::CameraProjection, render_resource::ShaderType},
};

use crate::atmosphere::AtmosphereParameters;
use crate::AtmosphereSunTint;

use super::common::LutId;

/// User coefficients are given per megameter, shaders work per kilometer.
pub const COEFFICIENT_SCALE: f32 = 0.001;
pub const METERS_TO_KILOMETERS: f32 = 0.001;
/// Lower bound of the packed density falloff and of its divisor.
pub const MIN_FALLOFF_SCALE: f32 = 0.001;
/// Angular radius of the sun seen from earth (0.545 degrees diameter).
pub const SUN_ON_EARTH_HALF_ANGLE_RADIANS: f32 = 0.545 * 0.5 * PI / 180.0;
pub const LIGHT_DISK_SIZE_RANGE: RangeInclusive<f32> = 0.1..=20.0;
pub const PARAMETER_SLOTS: usize = 16;

/// The directional light feeding the atmosphere.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct SunLight {
    /// Unit vector pointing toward the sun.
    pub direction: Vec3,
    /// Linear color.
    pub color: Vec3,
    pub illuminance: f32,
}

impl Default for SunLight {
    fn default() -> Self {
        Self {
            direction: Vec3::Y,
            color: Vec3::ONE,
            illuminance: 0.0,
        }
    }
}

impl SunLight {
    /// Lights carrying [`AtmosphereSunTint`] contribute their base color, not
    /// the tinted one, so the tint never feeds back into the sky.
    pub fn from_directional(
        light: &DirectionalLight,
        transform: &GlobalTransform,
        tint: Option<&AtmosphereSunTint>,
    ) -> Self {
        let color = tint.map_or(light.color, |tint| tint.base_color).to_linear();
        Self {
            direction: *transform.back(),
            color: Vec3::new(color.red, color.green, color.blue),
            illuminance: light.illuminance,
        }
    }
}

/// `_SkyAtmosphereParams`, rebuilt every frame for each atmosphere camera.
#[derive(Component, Clone, Copy, Debug, Default, PartialEq, ShaderType)]
pub struct SkyAtmosphereUniform {
    pub params: [Vec4; PARAMETER_SLOTS],
}

impl SkyAtmosphereUniform {
    pub fn build(params: &AtmosphereParameters, far_clip_meters: f32, sun: &SunLight) -> Self {
        let mut p = [Vec4::ZERO; PARAMETER_SLOTS];

        let albedo = params.ground_albedo.to_linear();
        p[0] = Vec4::new(
            albedo.red,
            albedo.green,
            albedo.blue,
            if params.aerial_perspective { 1.0 } else { 0.0 },
        );
        p[1] = (params.rayleigh_scattering * COEFFICIENT_SCALE)
            .extend(falloff_scale(params.rayleigh_exponential_distribution));
        p[2] = Vec4::new(
            params.mie_scattering * COEFFICIENT_SCALE,
            params.mie_absorption * COEFFICIENT_SCALE,
            params.mie_anisotropy.clamp(0.0, 1.0),
            falloff_scale(params.mie_exponential_distribution),
        );
        p[3] = (params.ozone_absorption * COEFFICIENT_SCALE)
            .extend(params.ozone_absorption_tip_altitude);

        let ground_radius = params.ground_radius.max(0.0);
        let top_radius = ground_radius + params.atmosphere_height.max(0.0);
        p[4] = Vec4::new(params.ozone_absorption_width, top_radius, ground_radius, 0.0);

        p[5] = LutId::Transmittance.spec().size_and_inverse();
        p[6] = LutId::MultiScattered.spec().size_and_inverse();
        p[7] = LutId::SkyView.spec().size_and_inverse();
        let volume = LutId::CameraVolume.spec();
        p[8] = volume.inverse_and_depth();

        let disk = params.light_disk_color.to_linear();
        p[9] = Vec4::new(
            disk.red,
            disk.green,
            disk.blue,
            light_disk_cos(params.light_disk_size),
        );

        let slice_km = far_clip_meters.max(0.0) * METERS_TO_KILOMETERS / volume.depth as f32;
        let inverse_slice_km = if slice_km > 0.0 { slice_km.recip() } else { 0.0 };
        p[10] = Vec4::new(slice_km, inverse_slice_km, 0.0, 0.0);

        p[11] = sun.direction.normalize_or(Vec3::Y).extend(sun.illuminance);
        p[12] = sun.color.extend(0.0);

        Self { params: p }
    }

    pub fn aerial_perspective(&self) -> bool {
        self.params[0].w > 0.5
    }

    pub fn ground_radius(&self) -> f32 {
        self.params[4].z
    }

    pub fn top_radius(&self) -> f32 {
        self.params[4].y
    }

    pub fn light_disk_cos(&self) -> f32 {
        self.params[9].w
    }

    pub fn slice_distance_km(&self) -> f32 {
        self.params[10].x
    }

    pub fn inverse_slice_distance_km(&self) -> f32 {
        self.params[10].y
    }

    pub fn volume_depth(&self) -> f32 {
        self.params[8].w
    }

    pub fn inverse_volume_depth(&self) -> f32 {
        self.params[8].z
    }

    pub fn sun_direction(&self) -> Vec3 {
        self.params[11].truncate()
    }
}

/// Reciprocal of a scale height, bounded to `[0.001, 1000]`.
pub fn falloff_scale(exponential_distribution: f32) -> f32 {
    exponential_distribution
        .max(MIN_FALLOFF_SCALE)
        .recip()
        .max(MIN_FALLOFF_SCALE)
}

/// Cosine of the light disk's angular radius.
pub fn light_disk_cos(light_disk_size: f32) -> f32 {
    let size = light_disk_size.clamp(*LIGHT_DISK_SIZE_RANGE.start(), *LIGHT_DISK_SIZE_RANGE.end());
    (size * SUN_ON_EARTH_HALF_ANGLE_RADIANS).cos()
}

/// The sun is the first light carrying [`AtmosphereSunTint`], or the first
/// [`DirectionalLight`] when none is tinted.
pub fn build_parameter_blocks(
    lights: Query<(&DirectionalLight, &GlobalTransform, Option<&AtmosphereSunTint>)>,
    mut cameras: Query<(&AtmosphereParameters, &Projection, &mut SkyAtmosphereUniform)>,
) {
    let sun = lights
        .iter()
        .find(|(_, _, tint)| tint.is_some())
        .or_else(|| lights.iter().next())
        .map(|(light, transform, tint)| SunLight::from_directional(light, transform, tint))
        .unwrap_or_default();

    for (params, projection, mut uniform) in &mut cameras {
        uniform.set_if_neq(SkyAtmosphereUniform::build(params, projection.far(), &sun));
    }
}
