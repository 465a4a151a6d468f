use bevy::{
    asset::load_internal_asset,
    core_pipeline::core_3d::graph::{Core3d, Node3d},
    ecs::query::QueryItem,
    prelude::*,
    render::{
        extract_component::{ExtractComponent, ExtractComponentPlugin, UniformComponentPlugin},
        render_graph::{RenderGraphApp, ViewNodeRunner},
        Render, RenderApp, RenderSet,
    },
    transform::TransformSystem,
};

mod atmosphere_luts;
mod common;
mod composite;
mod params;

pub use atmosphere_luts::{
    AtmosphereLutNode, LutGenerator, LutStage, StageBinding, StageRecorder, StageResource,
    LUT_WORKGROUP_SIZE_2D, LUT_WORKGROUP_SIZE_3D,
};
pub use common::{
    lut_descriptor, LutAllocator, LutCache, LutCacheChange, LutId, LutSpec, SkyAtmosphereLabel,
    SkyAtmosphereLuts, COMPOSITE_SPAN_NAME, LUT_FORMAT, LUT_SAMPLER_BINDING, LUT_SPAN_NAME,
    PARAMS_BINDING_NAME,
};
pub use composite::{
    AtmosphereCompositeNode, CompositeRecorder, Compositor, LazyPipeline,
    FULLSCREEN_TRIANGLE_VERTICES,
};
pub use params::{
    build_parameter_blocks, falloff_scale, light_disk_cos, SkyAtmosphereUniform, SunLight,
    COEFFICIENT_SCALE, LIGHT_DISK_SIZE_RANGE, METERS_TO_KILOMETERS, PARAMETER_SLOTS,
};

use atmosphere_luts::AtmosphereLutPipelines;
use common::prepare_atmosphere_luts;
use composite::{configure_compositor, CompositeLayouts};

use crate::atmosphere::AtmosphereParameters;

pub const SKY_ATMOSPHERE_COMMON_SHADER_HANDLE: Handle<Shader> =
    Handle::weak_from_u128(80613552094723190714);
pub const SKY_ATMOSPHERE_LUTS_SHADER_HANDLE: Handle<Shader> =
    Handle::weak_from_u128(80613552094723190715);
pub const SKY_ATMOSPHERE_COMPOSITE_SHADER_HANDLE: Handle<Shader> =
    Handle::weak_from_u128(80613552094723190716);

/// Everything on the GPU side: parameter upload, LUT generation and the
/// composite over the opaque pass.
pub struct SkyAtmosphereRenderPlugin;

impl Plugin for SkyAtmosphereRenderPlugin {
    fn build(&self, app: &mut App) {
        load_internal_asset!(
            app,
            SKY_ATMOSPHERE_COMMON_SHADER_HANDLE,
            "../../assets/shaders/sky_atmosphere_common.wgsl",
            Shader::from_wgsl
        );
        load_internal_asset!(
            app,
            SKY_ATMOSPHERE_LUTS_SHADER_HANDLE,
            "../../assets/shaders/sky_atmosphere_luts.wgsl",
            Shader::from_wgsl
        );
        load_internal_asset!(
            app,
            SKY_ATMOSPHERE_COMPOSITE_SHADER_HANDLE,
            "../../assets/shaders/sky_atmosphere_composite.wgsl",
            Shader::from_wgsl
        );

        app.register_type::<AtmosphereParameters>()
            .add_plugins((
                ExtractComponentPlugin::<AtmosphereParameters>::default(),
                UniformComponentPlugin::<SkyAtmosphereUniform>::default(),
            ))
            .add_systems(
                PostUpdate,
                build_parameter_blocks.after(TransformSystem::TransformPropagate),
            );

        let Some(render_app) = app.get_sub_app_mut(RenderApp) else {
            return;
        };

        render_app
            .init_resource::<SkyAtmosphereLuts>()
            .init_resource::<Compositor>()
            .add_systems(
                Render,
                (
                    prepare_atmosphere_luts.in_set(RenderSet::PrepareResources),
                    configure_compositor.in_set(RenderSet::Prepare),
                ),
            )
            .add_render_graph_node::<ViewNodeRunner<AtmosphereLutNode>>(
                Core3d,
                SkyAtmosphereLabel::Luts,
            )
            .add_render_graph_node::<ViewNodeRunner<AtmosphereCompositeNode>>(
                Core3d,
                SkyAtmosphereLabel::Composite,
            )
            .add_render_graph_edges(
                Core3d,
                (
                    Node3d::StartMainPass,
                    SkyAtmosphereLabel::Luts,
                    Node3d::MainOpaquePass,
                ),
            )
            .add_render_graph_edges(
                Core3d,
                (
                    Node3d::MainOpaquePass,
                    SkyAtmosphereLabel::Composite,
                    Node3d::MainTransmissivePass,
                ),
            );
    }

    fn finish(&self, app: &mut App) {
        let Some(render_app) = app.get_sub_app_mut(RenderApp) else {
            return;
        };
        render_app
            .init_resource::<AtmosphereLutPipelines>()
            .init_resource::<CompositeLayouts>();
    }
}

/// Inactive cameras extract nothing, which drops the parameter block from
/// their render entity and keeps both graph nodes from running for them.
impl ExtractComponent for AtmosphereParameters {
    type QueryData = (&'static AtmosphereParameters, &'static SkyAtmosphereUniform);
    type QueryFilter = ();
    type Out = SkyAtmosphereUniform;

    fn extract_component((params, uniform): QueryItem<'_, Self::QueryData>) -> Option<Self::Out> {
        params.is_active().then_some(*uniform)
    }
}
