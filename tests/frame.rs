//! Drives whole frames through the parameter, LUT and composite stages with
//! recording hosts in place of the GPU.

use bevy::{prelude::*, render::extract_component::ExtractComponent};
use bevy_sky_atmosphere::{
    compute::{
        build_parameter_blocks, CompositeRecorder, Compositor, LutAllocator, LutCache,
        LutCacheChange, LutGenerator, LutId, LutSpec, LutStage, StageRecorder,
    },
    physics::{blend_over, composite_output, PixelCoverage},
    AtmosphereParameters, SkyAtmosphereUniform,
};
use std::ops::Range;

#[derive(Default)]
struct FrameHost {
    allocated: Vec<LutId>,
    released: Vec<LutId>,
    dispatches: Vec<(LutStage, UVec3)>,
    draws: Vec<(Range<u32>, Range<u32>)>,
}

impl LutAllocator for FrameHost {
    type Texture = LutId;

    fn allocate(&mut self, id: LutId, _spec: &LutSpec) -> LutId {
        self.allocated.push(id);
        id
    }

    fn release(&mut self, id: LutId, _texture: LutId) {
        self.released.push(id);
    }
}

impl StageRecorder for FrameHost {
    fn dispatch(&mut self, stage: LutStage, workgroups: UVec3) -> bool {
        self.dispatches.push((stage, workgroups));
        true
    }
}

impl CompositeRecorder for FrameHost {
    fn draw(&mut self, vertices: Range<u32>, instances: Range<u32>) {
        self.draws.push((vertices, instances));
    }
}

/// Runs the parameter system in a headless app and returns the camera block.
fn build_block(params: AtmosphereParameters) -> SkyAtmosphereUniform {
    let mut app = App::new();
    app.add_systems(Update, build_parameter_blocks);
    let camera = app
        .world_mut()
        .spawn((
            params,
            Projection::Perspective(PerspectiveProjection {
                far: 16_000.0,
                ..default()
            }),
        ))
        .id();
    app.world_mut().spawn((
        DirectionalLight::default(),
        GlobalTransform::from(Transform::default().looking_to(Vec3::new(0.0, -1.0, -1.0), Vec3::Y)),
    ));
    app.update();
    *app.world().get::<SkyAtmosphereUniform>(camera).unwrap()
}

/// One frame as the render world sees it. Returns nothing when the camera is
/// inactive, mirroring extraction, and the LUTs are released like on a frame
/// without atmosphere views.
fn render_frame(
    params: &AtmosphereParameters,
    block: &SkyAtmosphereUniform,
    cache: &mut LutCache<LutId>,
    host: &mut FrameHost,
) -> Option<usize> {
    let extracted = AtmosphereParameters::extract_component((params, block));
    cache.sync(extracted.is_some(), host);
    let extracted = extracted?;
    let dispatched = LutGenerator::record(&extracted, host);
    Compositor::record(host);
    Some(dispatched)
}

const GEOMETRY: PixelCoverage = PixelCoverage::Geometry { distance_km: 4.0 };
const SCENE_COLOR: Vec4 = Vec4::new(0.4, 0.3, 0.2, 1.0);
const VOLUME_SAMPLE: Vec4 = Vec4::new(0.1, 0.2, 0.3, 0.6);

#[test]
fn default_frame_skips_the_camera_volume() {
    let params = AtmosphereParameters::default();
    let block = build_block(params);
    let mut cache = LutCache::default();
    let mut host = FrameHost::default();

    assert_eq!(render_frame(&params, &block, &mut cache, &mut host), Some(3));

    assert_eq!(host.allocated.len(), 4);
    assert!(host
        .dispatches
        .iter()
        .all(|(stage, _)| *stage != LutStage::CameraVolume));
    assert_eq!(host.draws, vec![(0..3, 0..1)]);

    let out = composite_output(&block, GEOMETRY, Vec3::ZERO, VOLUME_SAMPLE);
    assert_eq!(blend_over(out, SCENE_COLOR), SCENE_COLOR);
}

#[test]
fn enabling_aerial_perspective_adds_the_volume_and_tints_geometry() {
    let mut params = AtmosphereParameters::default();
    let mut cache = LutCache::default();
    let mut host = FrameHost::default();

    let block = build_block(params);
    assert_eq!(render_frame(&params, &block, &mut cache, &mut host), Some(3));
    let before = blend_over(
        composite_output(&block, GEOMETRY, Vec3::ZERO, VOLUME_SAMPLE),
        SCENE_COLOR,
    );

    params.aerial_perspective = true;
    let block = build_block(params);
    host.dispatches.clear();
    assert_eq!(render_frame(&params, &block, &mut cache, &mut host), Some(4));
    let after = blend_over(
        composite_output(&block, GEOMETRY, Vec3::ZERO, VOLUME_SAMPLE),
        SCENE_COLOR,
    );

    // The cache was filled on the first frame and reused on the second.
    assert_eq!(host.allocated.len(), 4);
    assert!(host.released.is_empty());

    let stages: Vec<_> = host.dispatches.iter().map(|(stage, _)| *stage).collect();
    assert_eq!(stages, LutStage::ORDER);
    assert_eq!(host.draws.len(), 2);

    assert_ne!(before, after);
    let expected = VOLUME_SAMPLE.truncate() + SCENE_COLOR.truncate() * VOLUME_SAMPLE.w;
    assert!((after.truncate() - expected).abs().max_element() < 1e-6);
}

#[test]
fn inactive_camera_records_no_work() {
    let params = AtmosphereParameters {
        active: false,
        aerial_perspective: true,
        ..default()
    };
    let block = build_block(params);
    let mut cache = LutCache::default();
    let mut host = FrameHost::default();

    assert_eq!(render_frame(&params, &block, &mut cache, &mut host), None);
    assert!(host.allocated.is_empty());
    assert!(host.dispatches.is_empty());
    assert!(host.draws.is_empty());
}

#[test]
fn deactivating_the_camera_frees_the_tables() {
    let mut params = AtmosphereParameters::default();
    let mut cache = LutCache::default();
    let mut host = FrameHost::default();

    let block = build_block(params);
    assert_eq!(render_frame(&params, &block, &mut cache, &mut host), Some(3));

    params.active = false;
    assert_eq!(render_frame(&params, &block, &mut cache, &mut host), None);
    assert_eq!(host.released, LutId::ALL);
    assert!(cache.get(LutId::Transmittance).is_none());
    assert_eq!(cache.sync(false, &mut host), LutCacheChange::Unchanged);

    params.active = true;
    assert_eq!(render_frame(&params, &block, &mut cache, &mut host), Some(3));
    assert_eq!(host.allocated.len(), 8);
}

#[test]
fn sun_direction_reaches_the_block() {
    let block = build_block(AtmosphereParameters::default());
    let expected = Vec3::new(0.0, 1.0, 1.0).normalize();
    assert!((block.sun_direction() - expected).length() < 1e-5);
    assert_eq!(block.slice_distance_km(), 1.0);
}
