use std::ops::Range;

use bevy::{
    core_pipeline::fullscreen_vertex_shader::fullscreen_shader_vertex_state,
    ecs::query::QueryItem,
    log::{self, warn_once},
    prelude::*,
    render::{
        extract_component::{ComponentUniforms, DynamicUniformIndex},
        diagnostic::RecordDiagnostics,
        render_graph::{NodeRunError, RenderGraphContext, ViewNode},
        render_phase::TrackedRenderPass,
        render_resource::{binding_types::*, *},
        renderer::{RenderContext, RenderDevice},
        view::{ViewDepthTexture, ViewTarget, ViewUniformOffset, ViewUniforms},
    },
};

use super::{
    common::{
        atmosphere_view_layout, lut_sampler, LutId, SkyAtmosphereLuts, COMPOSITE_SPAN_NAME,
        PARAMS_BINDING_NAME,
    },
    params::SkyAtmosphereUniform,
    SKY_ATMOSPHERE_COMPOSITE_SHADER_HANDLE,
};

pub const FULLSCREEN_TRIANGLE_VERTICES: Range<u32> = 0..3;

pub trait CompositeRecorder {
    fn draw(&mut self, vertices: Range<u32>, instances: Range<u32>);
}

impl CompositeRecorder for TrackedRenderPass<'_> {
    fn draw(&mut self, vertices: Range<u32>, instances: Range<u32>) {
        TrackedRenderPass::draw(self, vertices, instances);
    }
}

/// Pipeline id created on first use and kept afterwards.
#[derive(Debug)]
pub struct LazyPipeline<P> {
    id: Option<P>,
}

impl<P> Default for LazyPipeline<P> {
    fn default() -> Self {
        Self { id: None }
    }
}

impl<P: Copy> LazyPipeline<P> {
    pub fn get(&self) -> Option<P> {
        self.id
    }

    pub fn get_or_create(&mut self, create: impl FnOnce() -> P) -> P {
        *self.id.get_or_insert_with(create)
    }
}

#[derive(Resource, Default)]
pub struct Compositor {
    pipeline: LazyPipeline<CachedRenderPipelineId>,
}

impl Compositor {
    pub fn pipeline(&self) -> Option<CachedRenderPipelineId> {
        self.pipeline.get()
    }

    /// Draws the fullscreen triangle once. Returns the number of draws issued.
    pub fn record<R: CompositeRecorder>(recorder: &mut R) -> usize {
        recorder.draw(FULLSCREEN_TRIANGLE_VERTICES, 0..1);
        1
    }
}

#[derive(Resource)]
pub struct CompositeLayouts {
    view_layout: BindGroupLayout,
    lut_layout: BindGroupLayout,
    sampler: Sampler,
    descriptor: RenderPipelineDescriptor,
}

impl FromWorld for CompositeLayouts {
    fn from_world(world: &mut World) -> Self {
        let render_device = world.resource::<RenderDevice>();

        let view_layout = atmosphere_view_layout(render_device);
        let lut_layout = render_device.create_bind_group_layout(
            "sky_atmosphere_composite_lut_layout",
            &BindGroupLayoutEntries::sequential(
                ShaderStages::FRAGMENT,
                (
                    texture_2d(TextureSampleType::Float { filterable: true }),
                    texture_2d(TextureSampleType::Float { filterable: true }),
                    texture_3d(TextureSampleType::Float { filterable: true }),
                    sampler(SamplerBindingType::Filtering),
                    texture_depth_2d(),
                ),
            ),
        );
        let sampler = lut_sampler(render_device);

        let descriptor = RenderPipelineDescriptor {
            label: Some("sky_atmosphere_composite_pipeline".into()),
            layout: vec![view_layout.clone(), lut_layout.clone()],
            push_constant_ranges: vec![],
            vertex: fullscreen_shader_vertex_state(),
            primitive: PrimitiveState::default(),
            depth_stencil: None,
            multisample: MultisampleState::default(),
            fragment: Some(FragmentState {
                shader: SKY_ATMOSPHERE_COMPOSITE_SHADER_HANDLE,
                shader_defs: vec![],
                entry_point: "fragment".into(),
                targets: vec![Some(ColorTargetState {
                    format: ViewTarget::TEXTURE_FORMAT_HDR,
                    blend: Some(BlendState {
                        color: BlendComponent {
                            src_factor: BlendFactor::One,
                            dst_factor: BlendFactor::SrcAlpha,
                            operation: BlendOperation::Add,
                        },
                        alpha: BlendComponent {
                            src_factor: BlendFactor::Zero,
                            dst_factor: BlendFactor::One,
                            operation: BlendOperation::Add,
                        },
                    }),
                    write_mask: ColorWrites::ALL,
                })],
            }),
            zero_initialize_workgroup_memory: false,
        };

        Self {
            view_layout,
            lut_layout,
            sampler,
            descriptor,
        }
    }
}

/// Queues the composite pipeline the first time an atmosphere view shows up.
pub fn configure_compositor(
    mut compositor: ResMut<Compositor>,
    layouts: Res<CompositeLayouts>,
    pipeline_cache: Res<PipelineCache>,
    views: Query<(), With<SkyAtmosphereUniform>>,
) {
    if views.is_empty() {
        return;
    }
    compositor.pipeline.get_or_create(|| {
        log::info!("Queueing sky atmosphere composite pipeline");
        pipeline_cache.queue_render_pipeline(layouts.descriptor.clone())
    });
}

/// Blends sky and aerial perspective over the opaque scene color.
#[derive(Default)]
pub struct AtmosphereCompositeNode;

impl ViewNode for AtmosphereCompositeNode {
    type ViewQuery = (
        &'static SkyAtmosphereUniform,
        &'static DynamicUniformIndex<SkyAtmosphereUniform>,
        &'static ViewUniformOffset,
        &'static ViewTarget,
        &'static ViewDepthTexture,
        &'static Msaa,
    );

    fn run<'w>(
        &self,
        _graph: &mut RenderGraphContext,
        render_context: &mut RenderContext<'w>,
        (_, uniform_index, view_offset, view_target, depth, msaa): QueryItem<'w, Self::ViewQuery>,
        world: &'w World,
    ) -> Result<(), NodeRunError> {
        if msaa.samples() > 1 {
            warn_once!("Sky atmosphere needs Msaa::Off on the camera, skipping composite");
            return Ok(());
        }
        if !view_target.is_hdr() {
            warn_once!("Sky atmosphere needs an HDR camera, skipping composite");
            return Ok(());
        }
        if !depth
            .texture
            .usage()
            .contains(TextureUsages::TEXTURE_BINDING)
        {
            warn_once!("Sky atmosphere needs a sampleable depth texture, skipping composite");
            return Ok(());
        }

        let pipeline_cache = world.resource::<PipelineCache>();
        let Some(pipeline) = world
            .resource::<Compositor>()
            .pipeline()
            .and_then(|id| pipeline_cache.get_render_pipeline(id))
        else {
            return Ok(());
        };

        let layouts = world.resource::<CompositeLayouts>();
        let luts = world.resource::<SkyAtmosphereLuts>();
        let (Some(transmittance), Some(sky_view), Some(camera_volume)) = (
            luts.view(LutId::Transmittance),
            luts.view(LutId::SkyView),
            luts.view(LutId::CameraVolume),
        ) else {
            return Ok(());
        };

        let Some(params_binding) = world
            .resource::<ComponentUniforms<SkyAtmosphereUniform>>()
            .binding()
        else {
            log::error!("Sky atmosphere parameter binding not found");
            return Ok(());
        };
        let Some(view_binding) = world.resource::<ViewUniforms>().uniforms.binding() else {
            log::error!("View uniform binding not found");
            return Ok(());
        };

        let diagnostics = render_context.diagnostic_recorder();
        let render_device = render_context.render_device();
        let view_bind_group = render_device.create_bind_group(
            PARAMS_BINDING_NAME,
            &layouts.view_layout,
            &BindGroupEntries::sequential((params_binding, view_binding)),
        );
        let lut_bind_group = render_device.create_bind_group(
            "sky_atmosphere_composite_luts",
            &layouts.lut_layout,
            &BindGroupEntries::sequential((
                transmittance,
                sky_view,
                camera_volume,
                &layouts.sampler,
                depth.view(),
            )),
        );

        let mut pass = render_context.begin_tracked_render_pass(RenderPassDescriptor {
            label: Some("sky_atmosphere_composite"),
            color_attachments: &[Some(view_target.get_color_attachment())],
            depth_stencil_attachment: None,
            timestamp_writes: None,
            occlusion_query_set: None,
        });
        let pass_span = diagnostics.pass_span(&mut pass, COMPOSITE_SPAN_NAME);
        pass.set_render_pipeline(pipeline);
        pass.set_bind_group(
            0,
            &view_bind_group,
            &[uniform_index.index(), view_offset.offset],
        );
        pass.set_bind_group(1, &lut_bind_group, &[]);
        Compositor::record(&mut pass);
        pass_span.end(&mut pass);

        Ok(())
    }
}
