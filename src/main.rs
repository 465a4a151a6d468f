use bevy::{
    asset::AssetMetaCheck, core_pipeline::tonemapping::Tonemapping,
    diagnostic::FrameTimeDiagnosticsPlugin, log, prelude::*,
};
use bevy_debug_grid::*;
use bevy_egui::EguiPlugin;
use bevy_panorbit_camera::{PanOrbitCamera, PanOrbitCameraPlugin};
use bevy_sky_atmosphere::{
    AtmosphereParameters, AtmosphereSunTint, SkyAtmosphereGuiPlugin, SkyAtmospherePlugin,
    SunAngles,
};
use wasm_bindgen::prelude::*;

const PRESET_PATH: &str = "assets/presets/earth.ron";
// Raw sunlight above the atmosphere; `RAW_SUNLIGHT_LUX` is not in bevy 0.15.
const RAW_SUNLIGHT_LUX: f32 = 130_000.;

#[wasm_bindgen]
pub fn run() {
    App::new()
        .add_plugins((
            DefaultPlugins.set(AssetPlugin {
                meta_check: AssetMetaCheck::Never,
                ..Default::default()
            }),
            DebugGridPlugin::without_floor_grid(),
            PanOrbitCameraPlugin,
            FrameTimeDiagnosticsPlugin::default(),
            EguiPlugin,
            SkyAtmospherePlugin,
            SkyAtmosphereGuiPlugin,
        ))
        .add_systems(Startup, setup)
        .run();
}

#[cfg(not(target_arch = "wasm32"))]
fn main() {
    run();
}

#[cfg(target_arch = "wasm32")]
fn main() {}

fn load_preset() -> AtmosphereParameters {
    match AtmosphereParameters::load(PRESET_PATH) {
        Ok(params) => params,
        Err(err) => {
            log::warn!("{err}, using default atmosphere");
            AtmosphereParameters {
                aerial_perspective: true,
                ..default()
            }
        }
    }
}

fn setup(
    mut commands: Commands,
    mut meshes: ResMut<Assets<Mesh>>,
    mut materials: ResMut<Assets<StandardMaterial>>,
    sun: Res<SunAngles>,
) {
    commands.spawn((
        Grid {
            spacing: 10.0_f32,
            count: 16,
            ..default()
        },
        SubGrid::default(),
        GridAxis::new_rgb(),
        Transform::default(),
        Visibility::Visible,
    ));

    commands.spawn((
        Mesh3d(meshes.add(Plane3d::default().mesh().size(20_000.0, 20_000.0))),
        MeshMaterial3d(materials.add(Color::srgb(0.3, 0.35, 0.25))),
        Transform::from_xyz(0.0, -0.01, 0.0),
    ));

    // Boxes spread out to a few kilometers to show aerial perspective.
    let cube = meshes.add(Cuboid::new(40.0, 120.0, 40.0));
    let material = materials.add(Color::srgb(0.8, 0.8, 0.8));
    for i in 0..12 {
        let distance = 150.0 * 1.4_f32.powi(i);
        let angle = i as f32 * 0.7;
        commands.spawn((
            Mesh3d(cube.clone()),
            MeshMaterial3d(material.clone()),
            Transform::from_xyz(distance * angle.sin(), 60.0, -distance * angle.cos()),
        ));
    }

    commands.spawn((
        DirectionalLight {
            illuminance: RAW_SUNLIGHT_LUX,
            shadows_enabled: true,
            ..default()
        },
        AtmosphereSunTint::default(),
        Transform::default().looking_to(-sun.direction(), Vec3::Y),
    ));

    commands.spawn((
        Camera3d::default(),
        Camera {
            hdr: true,
            ..default()
        },
        Msaa::Off,
        Projection::Perspective(PerspectiveProjection {
            far: 20_000.0,
            ..default()
        }),
        Tonemapping::AcesFitted,
        Transform::from_xyz(0.0, 2.0, 20.0),
        PanOrbitCamera {
            focus: Vec3::new(0.0, 2.0, 0.0),
            radius: Some(20.0),
            pitch: Some(std::f32::consts::PI * 0.03),
            ..default()
        },
        load_preset(),
    ));
}
