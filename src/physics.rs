//! CPU mirror of the atmosphere model evaluated by the sky atmosphere shaders.
//!
//! Distances are in kilometers with the planet centered at the origin. The
//! functions here follow `sky_atmosphere_common.wgsl` and the composite
//! fragment term for term so the shader math can be checked from tests, and so
//! the sun tint can be evaluated without reading textures back from the GPU.
//! Nothing here runs on the render path.

use std::f32::consts::PI;

use bevy::math::{Vec2, Vec3, Vec4};

use crate::compute::SkyAtmosphereUniform;

pub const TRANSMITTANCE_STEPS: u32 = 40;

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct AtmosphereModel {
    pub bottom_radius: f32,
    pub top_radius: f32,
    pub rayleigh_scattering: Vec3,
    pub rayleigh_falloff: f32,
    pub mie_scattering: f32,
    pub mie_absorption: f32,
    pub mie_anisotropy: f32,
    pub mie_falloff: f32,
    pub ozone_absorption: Vec3,
    pub ozone_tip_altitude: f32,
    pub ozone_width: f32,
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct MediumSample {
    pub rayleigh: Vec3,
    pub mie: Vec3,
    pub scattering: Vec3,
    pub extinction: Vec3,
}

impl AtmosphereModel {
    pub fn from_uniform(uniform: &SkyAtmosphereUniform) -> Self {
        let p = &uniform.params;
        Self {
            bottom_radius: p[4].z,
            top_radius: p[4].y,
            rayleigh_scattering: p[1].truncate(),
            rayleigh_falloff: p[1].w,
            mie_scattering: p[2].x,
            mie_absorption: p[2].y,
            mie_anisotropy: p[2].z,
            mie_falloff: p[2].w,
            ozone_absorption: p[3].truncate(),
            ozone_tip_altitude: p[3].w,
            ozone_width: p[4].x,
        }
    }

    /// Ozone follows a tent profile peaking at the tip altitude.
    pub fn ozone_density(&self, altitude: f32) -> f32 {
        let width = self.ozone_width.max(1e-3);
        (1.0 - (altitude - self.ozone_tip_altitude).abs() / width).max(0.0)
    }

    pub fn sample_medium(&self, altitude: f32) -> MediumSample {
        let altitude = altitude.max(0.0);
        let rayleigh_density = (-altitude * self.rayleigh_falloff).exp();
        let mie_density = (-altitude * self.mie_falloff).exp();

        let rayleigh = self.rayleigh_scattering * rayleigh_density;
        let mie = Vec3::splat(self.mie_scattering * mie_density);
        let mie_extinction = Vec3::splat((self.mie_scattering + self.mie_absorption) * mie_density);
        let ozone = self.ozone_absorption * self.ozone_density(altitude);

        MediumSample {
            rayleigh,
            mie,
            scattering: rayleigh + mie,
            extinction: rayleigh + mie_extinction + ozone,
        }
    }

    /// Transmittance from radius `r` along a ray with zenith cosine `mu` up to
    /// the top of the atmosphere. Rays that hit the ground are fully occluded.
    pub fn transmittance(&self, r: f32, mu: f32, steps: u32) -> Vec3 {
        let origin = Vec3::new(0.0, r, 0.0);
        let direction = Vec3::new((1.0 - mu * mu).max(0.0).sqrt(), mu, 0.0);

        if ray_sphere_intersect(origin, direction, self.bottom_radius).is_some() {
            return Vec3::ZERO;
        }
        let Some(t_max) = ray_sphere_intersect(origin, direction, self.top_radius) else {
            return Vec3::ONE;
        };

        let steps = steps.max(1);
        let dt = t_max / steps as f32;
        let optical_depth = (0..steps).fold(Vec3::ZERO, |depth, i| {
            let position = origin + direction * ((i as f32 + 0.5) * dt);
            let medium = self.sample_medium(position.length() - self.bottom_radius);
            depth + medium.extinction * dt
        });
        (-optical_depth).exp()
    }

    /// Maps `(r, mu)` to transmittance LUT coordinates.
    pub fn transmittance_lut_uv(&self, r: f32, mu: f32) -> Vec2 {
        let (top, bottom) = (self.top_radius, self.bottom_radius);
        let horizon = (top * top - bottom * bottom).max(0.0).sqrt();
        let rho = (r * r - bottom * bottom).max(0.0).sqrt();

        let discriminant = r * r * (mu * mu - 1.0) + top * top;
        let d = (-r * mu + discriminant.max(0.0).sqrt()).max(0.0);
        let d_min = top - r;
        let d_max = rho + horizon;

        let x_mu = if d_max > d_min {
            (d - d_min) / (d_max - d_min)
        } else {
            0.0
        };
        let x_r = if horizon > 0.0 { rho / horizon } else { 0.0 };
        Vec2::new(x_mu, x_r)
    }

    /// Multi-scattering LUT coordinates. A zero height atmosphere maps every
    /// radius to the bottom row.
    pub fn multi_scattering_lut_uv(&self, r: f32, mu_s: f32) -> Vec2 {
        let height = (self.top_radius - self.bottom_radius).max(1e-3);
        Vec2::new(mu_s * 0.5 + 0.5, (r - self.bottom_radius) / height)
            .clamp(Vec2::ZERO, Vec2::ONE)
    }

    /// Inverse of [`Self::transmittance_lut_uv`], returning `(r, mu)`.
    pub fn transmittance_lut_params(&self, uv: Vec2) -> (f32, f32) {
        let (top, bottom) = (self.top_radius, self.bottom_radius);
        let horizon = (top * top - bottom * bottom).max(0.0).sqrt();
        let rho = horizon * uv.y;
        let r = (rho * rho + bottom * bottom).sqrt();

        let d_min = top - r;
        let d_max = rho + horizon;
        let d = d_min + uv.x * (d_max - d_min);
        let mu = if d == 0.0 {
            1.0
        } else {
            ((horizon * horizon - rho * rho - d * d) / (2.0 * r * d)).clamp(-1.0, 1.0)
        };
        (r, mu)
    }
}

/// Nearest non-negative hit of a ray against a sphere centered at the origin.
pub fn ray_sphere_intersect(origin: Vec3, direction: Vec3, radius: f32) -> Option<f32> {
    let b = origin.dot(direction);
    let c = origin.length_squared() - radius * radius;
    let discriminant = b * b - c;
    if discriminant < 0.0 {
        return None;
    }
    let s = discriminant.sqrt();
    [-b - s, -b + s].into_iter().find(|&t| t >= 0.0)
}

pub fn rayleigh_phase(cos_theta: f32) -> f32 {
    3.0 / (16.0 * PI) * (1.0 + cos_theta * cos_theta)
}

/// Cornette-Shanks approximation of the Mie phase function.
pub fn mie_phase(anisotropy: f32, cos_theta: f32) -> f32 {
    let g2 = anisotropy * anisotropy;
    let k = 3.0 / (8.0 * PI) * (1.0 - g2) / (2.0 + g2);
    let denominator = (1.0 + g2 - 2.0 * anisotropy * cos_theta).max(1e-4);
    k * (1.0 + cos_theta * cos_theta) / denominator.powf(1.5)
}

/// Cosine between the sun and view azimuths around `up`, as used to address
/// the sky-view LUT. Straight up or down the view azimuth is undefined and the
/// result is 1.
pub fn light_view_cos(up: Vec3, direction: Vec3, sun: Vec3) -> f32 {
    let mut side = up.cross(direction);
    if side.length_squared() < 1e-8 {
        let axis = if up.x.abs() > 0.9 { Vec3::Z } else { Vec3::X };
        side = up.cross(axis);
    }
    let side = side.normalize();
    let forward = side.cross(up);
    let light_on_plane = Vec2::new(sun.dot(forward), sun.dot(side));
    let view_on_plane = Vec2::new(direction.dot(forward), direction.dot(side));
    let (light_length, view_length) = (light_on_plane.length(), view_on_plane.length());
    if light_length < 1e-5 || view_length < 1e-5 {
        return 1.0;
    }
    light_on_plane.dot(view_on_plane) / (light_length * view_length)
}

/// What the depth buffer holds under a pixel.
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum PixelCoverage {
    /// Nothing was drawn (reverse-Z depth of zero).
    Sky,
    Geometry { distance_km: f32 },
}

/// Where a geometry pixel lands in the camera volume.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct VolumeLookup {
    /// Normalized depth coordinate in the volume.
    pub w: f32,
    /// Fades the first half slice in so the camera position stays clear.
    pub weight: f32,
}

pub fn aerial_perspective_depth(uniform: &SkyAtmosphereUniform, distance_km: f32) -> VolumeLookup {
    let mut slice = distance_km.max(0.0) * uniform.inverse_slice_distance_km();
    let mut weight = 1.0;
    if slice < 0.5 {
        weight = (slice * 2.0).clamp(0.0, 1.0);
        slice = 0.5;
    }
    VolumeLookup {
        w: slice * uniform.inverse_volume_depth(),
        weight,
    }
}

/// Output of the composite fragment for one pixel. `sky` is the sky luminance
/// along the pixel ray and `volume` the camera volume sample at the pixel's
/// depth (in-scattered light and mean transmittance).
pub fn composite_output(
    uniform: &SkyAtmosphereUniform,
    coverage: PixelCoverage,
    sky: Vec3,
    volume: Vec4,
) -> Vec4 {
    match coverage {
        PixelCoverage::Sky => sky.extend(0.0),
        PixelCoverage::Geometry { .. } if !uniform.aerial_perspective() => {
            Vec4::new(0.0, 0.0, 0.0, 1.0)
        }
        PixelCoverage::Geometry { distance_km } => {
            let lookup = aerial_perspective_depth(uniform, distance_km);
            (volume.truncate() * lookup.weight)
                .extend(1.0 - lookup.weight * (1.0 - volume.w))
        }
    }
}

/// Fixed-function blend of the composite pass: `src + dst * src.a` on color,
/// destination alpha kept.
pub fn blend_over(src: Vec4, dst: Vec4) -> Vec4 {
    (src.truncate() + dst.truncate() * src.w).extend(dst.w)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::atmosphere::AtmosphereParameters;
    use crate::compute::SunLight;

    fn earth() -> AtmosphereModel {
        let uniform = SkyAtmosphereUniform::build(
            &AtmosphereParameters::default(),
            1000.0,
            &SunLight::default(),
        );
        AtmosphereModel::from_uniform(&uniform)
    }

    /// Integrates a phase function over the sphere with a midpoint rule.
    fn integrate_phase(phase: impl Fn(f32) -> f32) -> f32 {
        let steps = 4096;
        let d_mu = 2.0 / steps as f32;
        (0..steps)
            .map(|i| {
                let mu = -1.0 + (i as f32 + 0.5) * d_mu;
                phase(mu) * 2.0 * PI * d_mu
            })
            .sum()
    }

    #[test]
    fn zenith_transmittance_reddens_light() {
        let model = earth();
        let t = model.transmittance(model.bottom_radius + 0.5, 1.0, 200);

        assert!(t.x > 0.9, "red transmittance {t}");
        assert!(t.x > t.y && t.y > t.z, "blue must be attenuated most: {t}");
        assert!(t.z > 0.6);
    }

    #[test]
    fn horizon_is_darker_than_zenith() {
        let model = earth();
        let r = model.bottom_radius + 0.5;
        let zenith = model.transmittance(r, 1.0, TRANSMITTANCE_STEPS);
        let grazing = model.transmittance(r, 0.0, TRANSMITTANCE_STEPS);
        assert!(grazing.max_element() < zenith.min_element());
    }

    #[test]
    fn ground_blocks_downward_rays() {
        let model = earth();
        let t = model.transmittance(model.bottom_radius + 1.0, -0.5, TRANSMITTANCE_STEPS);
        assert_eq!(t, Vec3::ZERO);
    }

    #[test]
    fn top_of_atmosphere_is_clear() {
        let model = earth();
        let t = model.transmittance(model.top_radius, 1.0, TRANSMITTANCE_STEPS);
        assert!((t - Vec3::ONE).abs().max_element() < 1e-6);
    }

    #[test]
    fn ozone_peaks_at_tip_altitude() {
        let model = earth();
        assert_eq!(model.ozone_density(25.0), 1.0);
        assert_eq!(model.ozone_density(10.0), 0.0);
        assert_eq!(model.ozone_density(45.0), 0.0);
        assert!((model.ozone_density(32.5) - 0.5).abs() < 1e-6);

        let at_tip = model.sample_medium(25.0);
        let scattering_only = at_tip.rayleigh + Vec3::splat(
            (model.mie_scattering + model.mie_absorption) * (-25.0 * model.mie_falloff).exp(),
        );
        let ozone = at_tip.extinction - scattering_only;
        assert!((ozone - model.ozone_absorption).abs().max_element() < 1e-6);
    }

    #[test]
    fn phase_functions_are_normalized() {
        assert!((integrate_phase(rayleigh_phase) - 1.0).abs() < 1e-3);
        for g in [0.0, 0.5, 0.8] {
            let total = integrate_phase(|mu| mie_phase(g, mu));
            assert!((total - 1.0).abs() < 2e-2, "g = {g}: {total}");
        }
    }

    #[test]
    fn forward_scattering_dominates_for_positive_anisotropy() {
        assert!(mie_phase(0.8, 1.0) > mie_phase(0.8, -1.0));
        assert!((mie_phase(0.0, 1.0) - mie_phase(0.0, -1.0)).abs() < 1e-6);
    }

    #[test]
    fn transmittance_lut_mapping_inverts() {
        let model = earth();
        for uv in [
            Vec2::new(0.25, 0.5),
            Vec2::new(0.9, 0.1),
            Vec2::new(0.5, 0.95),
        ] {
            let (r, mu) = model.transmittance_lut_params(uv);
            let back = model.transmittance_lut_uv(r, mu);
            assert!((back - uv).abs().max_element() < 1e-3, "{uv} -> {back}");
        }
    }

    #[test]
    fn ray_sphere_hits() {
        let origin = Vec3::new(0.0, 10.0, 0.0);
        assert_eq!(ray_sphere_intersect(origin, Vec3::NEG_Y, 5.0), Some(5.0));
        assert_eq!(ray_sphere_intersect(origin, Vec3::Y, 5.0), None);
        assert_eq!(ray_sphere_intersect(Vec3::ZERO, Vec3::X, 5.0), Some(5.0));
    }

    fn block(aerial_perspective: bool) -> SkyAtmosphereUniform {
        SkyAtmosphereUniform::build(
            &AtmosphereParameters {
                aerial_perspective,
                ..Default::default()
            },
            16_000.0,
            &SunLight::default(),
        )
    }

    #[test]
    fn zero_height_atmosphere_has_finite_multi_scattering_uv() {
        let uniform = SkyAtmosphereUniform::build(
            &AtmosphereParameters {
                atmosphere_height: 0.0,
                ..Default::default()
            },
            1000.0,
            &SunLight::default(),
        );
        let model = AtmosphereModel::from_uniform(&uniform);
        assert_eq!(model.top_radius, model.bottom_radius);

        let uv = model.multi_scattering_lut_uv(model.bottom_radius, 0.3);
        assert!(uv.is_finite(), "{uv}");
        assert_eq!(uv.y, 0.0);

        let earth = earth();
        let top = earth.multi_scattering_lut_uv(earth.top_radius, -1.0);
        assert_eq!(top, Vec2::new(0.0, 1.0));
    }

    #[test]
    fn zenith_view_has_a_defined_azimuth() {
        let up = Vec3::Y;
        for sun in [Vec3::Y, Vec3::X, Vec3::new(0.3, 0.4, -0.866).normalize()] {
            for direction in [Vec3::Y, Vec3::NEG_Y] {
                let cos = light_view_cos(up, direction, sun);
                assert!(cos.is_finite(), "{direction} toward {sun}: {cos}");
                assert!((-1.0..=1.0).contains(&cos));
            }
        }
    }

    #[test]
    fn azimuth_cosine_follows_the_sun() {
        let up = Vec3::new(0.0, 1.0, 0.0);
        let sun = Vec3::new(1.0, 0.2, 0.0).normalize();
        let toward = light_view_cos(up, Vec3::new(1.0, 0.5, 0.0).normalize(), sun);
        let away = light_view_cos(up, Vec3::new(-1.0, 0.1, 0.0).normalize(), sun);
        let across = light_view_cos(up, Vec3::new(0.0, 0.3, 1.0).normalize(), sun);
        assert!((toward - 1.0).abs() < 1e-5);
        assert!((away + 1.0).abs() < 1e-5);
        assert!(across.abs() < 1e-5);
    }

    #[test]
    fn sky_pixels_replace_the_background() {
        let sky = Vec3::new(0.2, 0.4, 0.8);
        let out = composite_output(&block(false), PixelCoverage::Sky, sky, Vec4::ZERO);
        assert_eq!(out, sky.extend(0.0));

        let background = Vec4::new(5.0, 5.0, 5.0, 1.0);
        assert_eq!(blend_over(out, background), sky.extend(1.0));
    }

    #[test]
    fn geometry_is_untouched_without_aerial_perspective() {
        let background = Vec4::new(0.3, 0.2, 0.1, 1.0);
        let out = composite_output(
            &block(false),
            PixelCoverage::Geometry { distance_km: 5.0 },
            Vec3::ONE,
            Vec4::new(1.0, 1.0, 1.0, 0.5),
        );
        assert_eq!(blend_over(out, background), background);
    }

    #[test]
    fn aerial_perspective_mixes_in_scattered_light() {
        let volume = Vec4::new(0.5, 0.6, 0.7, 0.25);
        let out = composite_output(
            &block(true),
            PixelCoverage::Geometry { distance_km: 5.0 },
            Vec3::ZERO,
            volume,
        );
        assert_eq!(out, Vec4::new(0.5, 0.6, 0.7, 0.25));

        let blended = blend_over(out, Vec4::new(1.0, 1.0, 1.0, 1.0));
        assert!((blended - Vec4::new(0.75, 0.85, 0.95, 1.0)).abs().max_element() < 1e-6);
    }

    #[test]
    fn first_half_slice_fades_in() {
        let uniform = block(true);

        let at_camera = aerial_perspective_depth(&uniform, 0.0);
        assert_eq!(at_camera.weight, 0.0);
        assert_eq!(at_camera.w, 0.5 / 16.0);

        let quarter = aerial_perspective_depth(&uniform, 0.25);
        assert_eq!(quarter.weight, 0.5);
        assert_eq!(quarter.w, 0.5 / 16.0);

        let far = aerial_perspective_depth(&uniform, 8.0);
        assert_eq!(far.weight, 1.0);
        assert_eq!(far.w, 0.5);

        let out = composite_output(
            &uniform,
            PixelCoverage::Geometry { distance_km: 0.0 },
            Vec3::ZERO,
            Vec4::new(1.0, 1.0, 1.0, 0.0),
        );
        assert_eq!(out, Vec4::new(0.0, 0.0, 0.0, 1.0));
    }
}
