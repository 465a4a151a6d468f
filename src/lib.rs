//! Physically based sky and aerial perspective for Bevy cameras.
//!
//! Put [`AtmosphereParameters`] on an HDR `Camera3d` with `Msaa::Off`. The
//! first [`DirectionalLight`] carrying [`AtmosphereSunTint`] (or else the first
//! directional light) becomes the sun. Every frame four lookup tables
//! are regenerated on the GPU before the opaque pass, then the sky and the
//! aerial perspective are blended over the opaque scene color.

use bevy::{
    core_pipeline::core_3d::Camera3dDepthTextureUsage,
    log,
    prelude::*,
    render::render_resource::TextureUsages,
    transform::TransformSystem,
};

mod atmosphere;
pub mod compute;
mod gui;
pub mod physics;

pub use atmosphere::{AtmosphereParameters, PresetError};
pub use compute::{SkyAtmosphereRenderPlugin, SkyAtmosphereUniform};
pub use gui::{EguiInteractionState, SkyAtmosphereGuiPlugin, SunAngles};

use compute::{build_parameter_blocks, METERS_TO_KILOMETERS};
use physics::{AtmosphereModel, TRANSMITTANCE_STEPS};

pub struct SkyAtmospherePlugin;

impl Plugin for SkyAtmospherePlugin {
    fn build(&self, app: &mut App) {
        app.add_plugins(SkyAtmosphereRenderPlugin)
            .register_type::<AtmosphereSunTint>()
            .add_systems(Update, ensure_depth_texture_binding)
            .add_systems(
                PostUpdate,
                tint_sun_light
                    .after(TransformSystem::TransformPropagate)
                    .after(build_parameter_blocks),
            );
    }
}

/// Colors a directional light by the atmosphere transmittance toward the sun,
/// seen from the first active atmosphere camera.
///
/// `base_color` is the light color above the atmosphere; the light's own
/// color is overwritten every frame.
#[derive(Component, Reflect, Clone, Copy, Debug)]
#[reflect(Component)]
pub struct AtmosphereSunTint {
    pub base_color: Color,
}

impl Default for AtmosphereSunTint {
    fn default() -> Self {
        Self {
            base_color: Color::WHITE,
        }
    }
}

pub fn tint_sun_light(
    cameras: Query<(&AtmosphereParameters, &SkyAtmosphereUniform, &GlobalTransform)>,
    mut lights: Query<(&mut DirectionalLight, &GlobalTransform, &AtmosphereSunTint)>,
) {
    let Some((_, uniform, camera)) = cameras.iter().find(|(params, ..)| params.is_active()) else {
        return;
    };

    let model = AtmosphereModel::from_uniform(uniform);
    let altitude = (camera.translation().y * METERS_TO_KILOMETERS).max(0.0005);
    let r = (model.bottom_radius + altitude).min(model.top_radius);

    for (mut light, transform, tint) in &mut lights {
        let mu = transform.back().y;
        let transmittance = model.transmittance(r, mu, TRANSMITTANCE_STEPS);
        let base = tint.base_color.to_linear();
        let color = Color::linear_rgb(
            base.red * transmittance.x,
            base.green * transmittance.y,
            base.blue * transmittance.z,
        );
        if light.color != color {
            light.color = color;
        }
    }
}

/// The composite pass reads the view depth, so atmosphere cameras need a
/// depth texture that can be bound for sampling.
pub fn ensure_depth_texture_binding(
    mut cameras: Query<&mut Camera3d, Added<AtmosphereParameters>>,
) {
    for mut camera in &mut cameras {
        let usages = TextureUsages::from(camera.depth_texture_usages);
        if !usages.contains(TextureUsages::TEXTURE_BINDING) {
            log::debug!("Enabling depth texture binding for atmosphere camera");
            camera.depth_texture_usages =
                Camera3dDepthTextureUsage::from(usages | TextureUsages::TEXTURE_BINDING);
        }
    }
}
