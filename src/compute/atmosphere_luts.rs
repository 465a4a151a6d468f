use std::borrow::Cow;

use bevy::{
    ecs::query::QueryItem,
    log,
    prelude::*,
    render::{
        extract_component::{ComponentUniforms, DynamicUniformIndex},
        diagnostic::RecordDiagnostics,
        render_graph::{NodeRunError, RenderGraphContext, ViewNode},
        render_resource::*,
        renderer::{RenderContext, RenderDevice},
        view::{ViewUniformOffset, ViewUniforms},
    },
};

use binding_types::*;

use super::{
    common::{
        atmosphere_view_layout, lut_sampler, LutId, SkyAtmosphereLuts, LUT_FORMAT,
        LUT_SAMPLER_BINDING, LUT_SPAN_NAME, PARAMS_BINDING_NAME,
    },
    params::SkyAtmosphereUniform,
    SKY_ATMOSPHERE_LUTS_SHADER_HANDLE,
};

pub const LUT_WORKGROUP_SIZE_2D: UVec3 = UVec3::new(8, 8, 1);
pub const LUT_WORKGROUP_SIZE_3D: UVec3 = UVec3::new(4, 4, 4);

/// One compute pass of the LUT generator, listed in dependency order.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum LutStage {
    Transmittance,
    MultiScattering,
    SkyView,
    CameraVolume,
}

impl LutStage {
    pub const ORDER: [LutStage; 4] = [
        LutStage::Transmittance,
        LutStage::MultiScattering,
        LutStage::SkyView,
        LutStage::CameraVolume,
    ];

    pub const fn index(self) -> usize {
        match self {
            LutStage::Transmittance => 0,
            LutStage::MultiScattering => 1,
            LutStage::SkyView => 2,
            LutStage::CameraVolume => 3,
        }
    }

    pub const fn output(self) -> LutId {
        match self {
            LutStage::Transmittance => LutId::Transmittance,
            LutStage::MultiScattering => LutId::MultiScattered,
            LutStage::SkyView => LutId::SkyView,
            LutStage::CameraVolume => LutId::CameraVolume,
        }
    }

    /// Tables sampled by the stage; all are produced by earlier stages.
    pub const fn inputs(self) -> &'static [LutId] {
        match self {
            LutStage::Transmittance => &[],
            LutStage::MultiScattering => &[LutId::Transmittance],
            LutStage::SkyView | LutStage::CameraVolume => {
                &[LutId::Transmittance, LutId::MultiScattered]
            }
        }
    }

    pub const fn entry_point(self) -> &'static str {
        match self {
            LutStage::Transmittance => "transmittance",
            LutStage::MultiScattering => "multi_scattering",
            LutStage::SkyView => "sky_view",
            LutStage::CameraVolume => "camera_volume",
        }
    }

    pub const fn label(self) -> &'static str {
        match self {
            LutStage::Transmittance => "sky_atmosphere_transmittance_lut",
            LutStage::MultiScattering => "sky_atmosphere_multi_scattering_lut",
            LutStage::SkyView => "sky_atmosphere_sky_view_lut",
            LutStage::CameraVolume => "sky_atmosphere_camera_volume_lut",
        }
    }

    pub const fn workgroup_size(self) -> UVec3 {
        match self {
            LutStage::CameraVolume => LUT_WORKGROUP_SIZE_3D,
            _ => LUT_WORKGROUP_SIZE_2D,
        }
    }

    pub fn workgroups(self) -> UVec3 {
        let size = self.output().spec().size();
        let group = self.workgroup_size();
        (size + group - UVec3::ONE) / group
    }

    /// Group 1 of the stage: its sampled inputs, the sampler when there is
    /// anything to sample, then the write target.
    pub fn bindings(self) -> Vec<StageBinding> {
        let inputs = self.inputs();
        let sampled = inputs.iter().filter_map(|&id| {
            id.sampled_binding().map(|binding| StageBinding {
                binding,
                resource: StageResource::Sampled(id),
            })
        });
        let filtering = (!inputs.is_empty()).then_some(StageBinding {
            binding: LUT_SAMPLER_BINDING,
            resource: StageResource::Sampler,
        });
        let output = StageBinding {
            binding: self.output().storage_binding(),
            resource: StageResource::Storage(self.output()),
        };
        sampled.chain(filtering).chain([output]).collect()
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StageResource {
    Sampled(LutId),
    Sampler,
    Storage(LutId),
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct StageBinding {
    pub binding: u32,
    pub resource: StageResource,
}

impl StageBinding {
    fn layout_entry(&self) -> BindGroupLayoutEntry {
        let builder = match self.resource {
            StageResource::Sampled(_) => texture_2d(TextureSampleType::Float { filterable: true }),
            StageResource::Sampler => sampler(SamplerBindingType::Filtering),
            StageResource::Storage(id) => match id.spec().dimension {
                TextureDimension::D3 => {
                    texture_storage_3d(LUT_FORMAT, StorageTextureAccess::WriteOnly)
                }
                _ => texture_storage_2d(LUT_FORMAT, StorageTextureAccess::WriteOnly),
            },
        };
        builder.build(self.binding, ShaderStages::COMPUTE)
    }
}

// `binding_types::texture_storage_3d` is not available in bevy 0.15.
fn texture_storage_3d(
    format: TextureFormat,
    access: StorageTextureAccess,
) -> BindGroupLayoutEntryBuilder {
    BindingType::StorageTexture {
        access,
        format,
        view_dimension: TextureViewDimension::D3,
    }
    .into_bind_group_layout_entry_builder()
}

/// Receives the dispatches issued by [`LutGenerator::record`]. Returns false
/// when the stage could not be recorded.
pub trait StageRecorder {
    fn dispatch(&mut self, stage: LutStage, workgroups: UVec3) -> bool;
}

/// Issues the LUT stages in their fixed order. There is no way to reorder or
/// interleave stages: each one samples what the previous ones wrote.
pub struct LutGenerator;

impl LutGenerator {
    pub fn schedule(aerial_perspective: bool) -> impl Iterator<Item = LutStage> {
        LutStage::ORDER
            .into_iter()
            .filter(move |&stage| stage != LutStage::CameraVolume || aerial_perspective)
    }

    /// Records one frame of LUT work and returns the number of dispatches.
    /// The chain stops at the first stage that fails to record, since every
    /// later stage would sample a stale table.
    pub fn record<R: StageRecorder>(uniform: &SkyAtmosphereUniform, recorder: &mut R) -> usize {
        let mut dispatched = 0;
        for stage in Self::schedule(uniform.aerial_perspective()) {
            if !recorder.dispatch(stage, stage.workgroups()) {
                break;
            }
            dispatched += 1;
        }
        dispatched
    }
}

#[derive(Resource)]
pub struct AtmosphereLutPipelines {
    view_layout: BindGroupLayout,
    stage_layouts: [BindGroupLayout; 4],
    pipelines: [CachedComputePipelineId; 4],
    sampler: Sampler,
}

impl AtmosphereLutPipelines {
    pub fn pipeline(&self, stage: LutStage) -> CachedComputePipelineId {
        self.pipelines[stage.index()]
    }
}

fn stage_layout(render_device: &RenderDevice, stage: LutStage) -> BindGroupLayout {
    let entries: Vec<_> = stage
        .bindings()
        .iter()
        .map(StageBinding::layout_entry)
        .collect();
    render_device.create_bind_group_layout(stage.output().storage_binding_name(), &entries)
}

impl FromWorld for AtmosphereLutPipelines {
    fn from_world(world: &mut World) -> Self {
        let render_device = world.resource::<RenderDevice>();

        let view_layout = atmosphere_view_layout(render_device);
        let stage_layouts = LutStage::ORDER.map(|stage| stage_layout(render_device, stage));
        let sampler = lut_sampler(render_device);

        let pipeline_cache = world.resource::<PipelineCache>();
        let pipelines = LutStage::ORDER.map(|stage| {
            pipeline_cache.queue_compute_pipeline(ComputePipelineDescriptor {
                label: Some(stage.label().into()),
                layout: vec![
                    view_layout.clone(),
                    stage_layouts[stage.index()].clone(),
                ],
                push_constant_ranges: Vec::new(),
                shader: SKY_ATMOSPHERE_LUTS_SHADER_HANDLE,
                shader_defs: vec![],
                entry_point: Cow::from(stage.entry_point()),
                zero_initialize_workgroup_memory: false,
            })
        });

        AtmosphereLutPipelines {
            view_layout,
            stage_layouts,
            pipelines,
            sampler,
        }
    }
}

struct StageBindGroups {
    groups: Vec<BindGroup>,
}

impl StageBindGroups {
    fn new(
        render_device: &RenderDevice,
        pipelines: &AtmosphereLutPipelines,
        luts: &SkyAtmosphereLuts,
    ) -> Option<Self> {
        let mut groups = Vec::with_capacity(LutStage::ORDER.len());
        for stage in LutStage::ORDER {
            let mut entries = Vec::new();
            for binding in stage.bindings() {
                let resource = match binding.resource {
                    StageResource::Sampled(id) | StageResource::Storage(id) => {
                        luts.view(id)?.into_binding()
                    }
                    StageResource::Sampler => (&pipelines.sampler).into_binding(),
                };
                entries.push(BindGroupEntry {
                    binding: binding.binding,
                    resource,
                });
            }
            groups.push(render_device.create_bind_group(
                stage.output().storage_binding_name(),
                &pipelines.stage_layouts[stage.index()],
                &entries,
            ));
        }
        Some(Self { groups })
    }

    fn get(&self, stage: LutStage) -> &BindGroup {
        &self.groups[stage.index()]
    }
}

/// Records each stage into its own compute pass so that the storage writes
/// of one stage are visible to the texture reads of the next.
struct ComputePassRecorder<'a> {
    encoder: &'a mut CommandEncoder,
    pipelines: &'a AtmosphereLutPipelines,
    pipeline_cache: &'a PipelineCache,
    view_bind_group: &'a BindGroup,
    stage_bind_groups: &'a StageBindGroups,
    dynamic_offsets: [u32; 2],
}

impl StageRecorder for ComputePassRecorder<'_> {
    fn dispatch(&mut self, stage: LutStage, workgroups: UVec3) -> bool {
        let Some(compute_pipeline) = self
            .pipeline_cache
            .get_compute_pipeline(self.pipelines.pipeline(stage))
        else {
            log::error!("{} pipeline not found", stage.label());
            return false;
        };

        let mut pass = self.encoder.begin_compute_pass(&ComputePassDescriptor {
            label: Some(stage.label()),
            timestamp_writes: None,
        });

        pass.set_pipeline(compute_pipeline);
        pass.set_bind_group(0, self.view_bind_group, &self.dynamic_offsets);
        pass.set_bind_group(1, self.stage_bind_groups.get(stage), &[]);
        pass.dispatch_workgroups(workgroups.x, workgroups.y, workgroups.z);
        true
    }
}

enum ComputeState {
    Loading,
    Ready,
}

/// Runs before the opaque pass and fills the LUTs for the view.
pub struct AtmosphereLutNode {
    state: ComputeState,
}

impl Default for AtmosphereLutNode {
    fn default() -> Self {
        Self {
            state: ComputeState::Loading,
        }
    }
}

impl ViewNode for AtmosphereLutNode {
    type ViewQuery = (
        &'static SkyAtmosphereUniform,
        &'static DynamicUniformIndex<SkyAtmosphereUniform>,
        &'static ViewUniformOffset,
    );

    fn update(&mut self, world: &mut World) {
        let pipelines = world.resource::<AtmosphereLutPipelines>();
        let pipeline_cache = world.resource::<PipelineCache>();

        if let ComputeState::Loading = self.state {
            let ready = LutStage::ORDER.iter().all(|&stage| {
                matches!(
                    pipeline_cache.get_compute_pipeline_state(pipelines.pipeline(stage)),
                    CachedPipelineState::Ok(_)
                )
            });

            if ready {
                log::info!("Sky atmosphere LUT pipelines ready");
                self.state = ComputeState::Ready;
            }
        }
    }

    fn run<'w>(
        &self,
        _graph: &mut RenderGraphContext,
        render_context: &mut RenderContext<'w>,
        (uniform, uniform_index, view_offset): QueryItem<'w, Self::ViewQuery>,
        world: &'w World,
    ) -> Result<(), NodeRunError> {
        let ComputeState::Ready = self.state else {
            return Ok(());
        };

        let pipelines = world.resource::<AtmosphereLutPipelines>();
        let pipeline_cache = world.resource::<PipelineCache>();
        let luts = world.resource::<SkyAtmosphereLuts>();
        let diagnostics = render_context.diagnostic_recorder();

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

        let render_device = render_context.render_device();
        let Some(stage_bind_groups) = StageBindGroups::new(render_device, pipelines, luts) else {
            log::error!("Sky atmosphere LUT textures not found");
            return Ok(());
        };
        let view_bind_group = render_device.create_bind_group(
            PARAMS_BINDING_NAME,
            &pipelines.view_layout,
            &BindGroupEntries::sequential((params_binding, view_binding)),
        );

        let time_span = diagnostics.time_span(render_context.command_encoder(), LUT_SPAN_NAME);
        let mut recorder = ComputePassRecorder {
            encoder: render_context.command_encoder(),
            pipelines,
            pipeline_cache,
            view_bind_group: &view_bind_group,
            stage_bind_groups: &stage_bind_groups,
            dynamic_offsets: [uniform_index.index(), view_offset.offset],
        };
        let dispatched = LutGenerator::record(uniform, &mut recorder);
        time_span.end(render_context.command_encoder());
        log::trace!("Sky atmosphere recorded {dispatched} LUT dispatch(es)");

        Ok(())
    }
}
