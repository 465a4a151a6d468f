use bevy::{
    diagnostic::{DiagnosticsStore, FrameTimeDiagnosticsPlugin},
    input::mouse::MouseMotion,
    log,
    prelude::*,
};
use bevy_debug_grid::Grid;
use bevy_egui::{egui, EguiContexts, EguiSet};
use bevy_panorbit_camera::{PanOrbitCamera, PanOrbitCameraSystemSet};

use crate::{atmosphere::AtmosphereParameters, compute::LIGHT_DISK_SIZE_RANGE};

#[derive(Resource, Default)]
pub struct EguiInteractionState {
    pub wants_focus: bool,
    pub is_dragging: bool,
    pub camera_interaction_active: bool,
}

/// Sun position driven from the panel, in degrees.
#[derive(Resource, Clone, Copy, Debug, PartialEq)]
pub struct SunAngles {
    pub elevation: f32,
    pub azimuth: f32,
}

impl Default for SunAngles {
    fn default() -> Self {
        Self {
            elevation: 12.0,
            azimuth: 30.0,
        }
    }
}

impl SunAngles {
    /// Unit vector pointing at the sun.
    pub fn direction(&self) -> Vec3 {
        let (elevation, azimuth) = (self.elevation.to_radians(), self.azimuth.to_radians());
        Vec3::new(
            elevation.cos() * azimuth.sin(),
            elevation.sin(),
            -elevation.cos() * azimuth.cos(),
        )
    }
}

/// Debug panel for tweaking the atmosphere of the first camera at runtime.
pub struct SkyAtmosphereGuiPlugin;

impl Plugin for SkyAtmosphereGuiPlugin {
    fn build(&self, app: &mut App) {
        app.init_resource::<EguiInteractionState>()
            .init_resource::<SunAngles>()
            .add_systems(
                PreUpdate,
                check_egui_wants_focus
                    .after(EguiSet::BeginPass)
                    .before(PanOrbitCameraSystemSet),
            )
            .add_systems(
                Update,
                (
                    ui_system,
                    handle_camera_block.after(ui_system),
                    update_sun_direction.after(ui_system),
                ),
            );
    }
}

fn check_egui_wants_focus(mut state: ResMut<EguiInteractionState>, mut contexts: EguiContexts) {
    let ctx = contexts.ctx_mut();
    let pointer_state = ctx.input(|i| i.pointer.clone());

    if ctx.is_pointer_over_area() && pointer_state.any_pressed() {
        state.is_dragging = true;
    }
    if !pointer_state.any_down() {
        state.is_dragging = false;
    }

    state.wants_focus =
        state.is_dragging || (ctx.is_pointer_over_area() && !state.camera_interaction_active);
}

fn color_edit(ui: &mut egui::Ui, label: &str, color: &mut Color) {
    let srgba = color.to_srgba();
    let mut rgb = [srgba.red, srgba.green, srgba.blue];
    ui.horizontal(|ui| {
        if ui.color_edit_button_rgb(&mut rgb).changed() {
            *color = Color::srgb(rgb[0], rgb[1], rgb[2]);
        }
        ui.label(label);
    });
}

fn vec3_sliders(ui: &mut egui::Ui, label: &str, value: &mut Vec3, range: std::ops::RangeInclusive<f32>) {
    ui.label(label);
    for (axis, component) in ["R", "G", "B"].into_iter().zip(value.as_mut()) {
        ui.add(egui::Slider::new(component, range.clone()).text(axis));
    }
}

fn atmosphere_controls(ui: &mut egui::Ui, params: &mut AtmosphereParameters) {
    ui.checkbox(&mut params.active, "Atmosphere");
    ui.checkbox(&mut params.aerial_perspective, "Aerial Perspective");

    egui::CollapsingHeader::new("Planet").show(ui, |ui| {
        ui.add(egui::Slider::new(&mut params.ground_radius, 1.0..=10000.0).text("Ground Radius (km)"));
        ui.add(
            egui::Slider::new(&mut params.atmosphere_height, 1.0..=200.0).text("Atmosphere Height (km)"),
        );
        color_edit(ui, "Ground Albedo", &mut params.ground_albedo);
    });

    egui::CollapsingHeader::new("Rayleigh").show(ui, |ui| {
        vec3_sliders(ui, "Scattering (1/Mm)", &mut params.rayleigh_scattering, 0.0..=100.0);
        ui.add(
            egui::Slider::new(&mut params.rayleigh_exponential_distribution, 0.1..=20.0)
                .text("Scale Height (km)"),
        );
    });

    egui::CollapsingHeader::new("Mie").show(ui, |ui| {
        ui.add(egui::Slider::new(&mut params.mie_scattering, 0.0..=50.0).text("Scattering (1/Mm)"));
        ui.add(egui::Slider::new(&mut params.mie_absorption, 0.0..=50.0).text("Absorption (1/Mm)"));
        ui.add(egui::Slider::new(&mut params.mie_anisotropy, 0.0..=0.999).text("Anisotropy"));
        ui.add(
            egui::Slider::new(&mut params.mie_exponential_distribution, 0.1..=20.0)
                .text("Scale Height (km)"),
        );
    });

    egui::CollapsingHeader::new("Ozone").show(ui, |ui| {
        vec3_sliders(ui, "Absorption (1/Mm)", &mut params.ozone_absorption, 0.0..=10.0);
        ui.add(
            egui::Slider::new(&mut params.ozone_absorption_tip_altitude, 0.0..=60.0)
                .text("Tip Altitude (km)"),
        );
        ui.add(egui::Slider::new(&mut params.ozone_absorption_width, 0.1..=50.0).text("Width (km)"));
    });

    egui::CollapsingHeader::new("Light Disk").show(ui, |ui| {
        color_edit(ui, "Color", &mut params.light_disk_color);
        ui.add(egui::Slider::new(&mut params.light_disk_size, LIGHT_DISK_SIZE_RANGE).text("Size"));
    });

    ui.horizontal(|ui| {
        if ui.button("Reset").clicked() {
            *params = AtmosphereParameters::default();
        }
        if ui.button("Export").clicked() {
            match params.to_ron() {
                Ok(preset) => log::info!("Atmosphere preset:\n{preset}"),
                Err(err) => log::error!("{err}"),
            }
        }
    });
}

fn ui_system(
    mut contexts: EguiContexts,
    diagnostics: Res<DiagnosticsStore>,
    mut sun: ResMut<SunAngles>,
    mut camera_query: Query<&mut PanOrbitCamera>,
    mut atmosphere_query: Query<&mut AtmosphereParameters>,
    mut grid_query: Query<&mut Visibility, With<Grid>>,
) {
    let ctx = contexts.ctx_mut();

    egui::Window::new("")
        .title_bar(false)
        .default_width(240.0)
        .show(ctx, |ui| {
            if let Some(fps) = diagnostics.get(&FrameTimeDiagnosticsPlugin::FPS) {
                if let Some(fps_value) = fps.smoothed() {
                    ui.label(format!("FPS: {:.1}", fps_value));
                }
            }

            if let Ok(camera) = camera_query.get_single() {
                ui.separator();
                ui.label(format!("Radius: {:.2}", camera.radius.unwrap_or(0.0)));
                ui.label(format!(
                    "Pitch: {:.1}°",
                    camera.pitch.unwrap_or(0.0).to_degrees()
                ));
            }

            ui.horizontal(|ui| {
                if ui.button("Reset Camera").clicked() {
                    if let Ok(mut camera) = camera_query.get_single_mut() {
                        *camera = PanOrbitCamera {
                            focus: Vec3::new(0.0, 2.0, 0.0),
                            radius: Some(20.0),
                            yaw: Some(0.0),
                            pitch: Some(std::f32::consts::PI * 0.03),
                            ..Default::default()
                        };
                    }
                }
            });

            if let Ok(mut grid_visibility) = grid_query.get_single_mut() {
                let mut show_grid = *grid_visibility == Visibility::Visible;
                if ui.checkbox(&mut show_grid, "Show Grid").clicked() {
                    *grid_visibility = if show_grid {
                        Visibility::Visible
                    } else {
                        Visibility::Hidden
                    };
                }
            }

            ui.separator();
            ui.add(egui::Slider::new(&mut sun.elevation, -10.0..=90.0).text("Sun Elevation"));
            ui.add(egui::Slider::new(&mut sun.azimuth, 0.0..=360.0).text("Sun Azimuth"));

            if let Some(mut params) = atmosphere_query.iter_mut().next() {
                ui.separator();
                atmosphere_controls(ui, &mut params);
            }
        });
}

fn update_sun_direction(
    sun: Res<SunAngles>,
    mut light_query: Query<&mut Transform, With<DirectionalLight>>,
) {
    if !sun.is_changed() {
        return;
    }
    if let Ok(mut light_transform) = light_query.get_single_mut() {
        *light_transform = Transform::default().looking_to(-sun.direction(), Vec3::Y);
    }
}

fn handle_camera_block(
    mut state: ResMut<EguiInteractionState>,
    mut mouse_motion: EventReader<MouseMotion>,
    mut camera_query: Query<&mut PanOrbitCamera>,
    mouse_buttons: Res<ButtonInput<MouseButton>>,
) {
    if mouse_buttons.just_pressed(MouseButton::Left) && !state.wants_focus {
        state.camera_interaction_active = true;
    }
    if mouse_buttons.just_released(MouseButton::Left) {
        state.camera_interaction_active = false;
    }

    if state.wants_focus && !state.camera_interaction_active {
        mouse_motion.clear();
        if let Ok(mut camera) = camera_query.get_single_mut() {
            camera.enabled = false;
        }
    } else if let Ok(mut camera) = camera_query.get_single_mut() {
        camera.enabled = true;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sun_angles_point_at_the_sky() {
        let zenith = SunAngles {
            elevation: 90.0,
            azimuth: 0.0,
        };
        assert!((zenith.direction() - Vec3::Y).length() < 1e-6);

        let horizon = SunAngles {
            elevation: 0.0,
            azimuth: 90.0,
        };
        assert!((horizon.direction() - Vec3::X).length() < 1e-6);
    }

    #[test]
    fn light_follows_sun_angles() {
        let mut app = App::new();
        app.init_resource::<SunAngles>()
            .add_systems(Update, update_sun_direction);
        let light = app
            .world_mut()
            .spawn((DirectionalLight::default(), Transform::default()))
            .id();

        app.update();

        let transform = app.world().get::<Transform>(light).unwrap();
        let expected = SunAngles::default().direction();
        assert!((*transform.back() - expected).length() < 1e-5);
    }
}
