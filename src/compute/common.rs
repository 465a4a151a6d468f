use bevy::{
    log,
    prelude::*,
    render::{
        render_graph::RenderLabel,
        render_resource::{binding_types::uniform_buffer, *},
        renderer::RenderDevice,
        view::ViewUniform,
    },
};

use super::params::SkyAtmosphereUniform;

/// Name of the packed parameter block as seen by the shaders.
pub const PARAMS_BINDING_NAME: &str = "_SkyAtmosphereParams";

/// Storage format shared by every LUT. Half floats are storable without
/// extra device features, unlike the packed 11/11/10 formats.
pub const LUT_FORMAT: TextureFormat = TextureFormat::Rgba16Float;

/// Binding of the shared LUT sampler in the generation stage groups.
pub const LUT_SAMPLER_BINDING: u32 = 2;

/// Diagnostic span around one view's LUT generation.
pub const LUT_SPAN_NAME: &str = "sky_atmosphere";
/// Diagnostic span around the composite pass.
pub const COMPOSITE_SPAN_NAME: &str = "sky_atmosphere_apply";

#[derive(Debug, Hash, PartialEq, Eq, Clone, RenderLabel)]
pub enum SkyAtmosphereLabel {
    Luts,
    Composite,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum LutId {
    Transmittance,
    MultiScattered,
    SkyView,
    CameraVolume,
}

impl LutId {
    pub const ALL: [LutId; 4] = [
        LutId::Transmittance,
        LutId::MultiScattered,
        LutId::SkyView,
        LutId::CameraVolume,
    ];

    pub const fn index(self) -> usize {
        match self {
            LutId::Transmittance => 0,
            LutId::MultiScattered => 1,
            LutId::SkyView => 2,
            LutId::CameraVolume => 3,
        }
    }

    pub const fn spec(self) -> LutSpec {
        match self {
            LutId::Transmittance => LutSpec::TRANSMITTANCE,
            LutId::MultiScattered => LutSpec::MULTI_SCATTERED,
            LutId::SkyView => LutSpec::SKY_VIEW,
            LutId::CameraVolume => LutSpec::CAMERA_VOLUME,
        }
    }

    /// Name under which the finished table is published.
    pub const fn binding_name(self) -> &'static str {
        match self {
            LutId::Transmittance => "_TransmittanceLut",
            LutId::MultiScattered => "_MultiScatteredLut",
            LutId::SkyView => "_SkyViewLut",
            LutId::CameraVolume => "_CameraVolumeLut",
        }
    }

    /// Name of the write target used by the stage producing this table.
    pub const fn storage_binding_name(self) -> &'static str {
        match self {
            LutId::Transmittance => "_RWTransmittanceLut",
            LutId::MultiScattered => "_RWMultiScatteredLut",
            LutId::SkyView => "_RWSkyViewLut",
            LutId::CameraVolume => "_RWCameraVolumeLut",
        }
    }

    /// Group 1 binding where a generation stage samples this table. Only the
    /// tables read by later stages have one.
    pub const fn sampled_binding(self) -> Option<u32> {
        match self {
            LutId::Transmittance => Some(0),
            LutId::MultiScattered => Some(1),
            LutId::SkyView | LutId::CameraVolume => None,
        }
    }

    /// Group 1 binding of this table's write target.
    pub const fn storage_binding(self) -> u32 {
        match self {
            LutId::Transmittance => 3,
            LutId::MultiScattered => 4,
            LutId::SkyView => 5,
            LutId::CameraVolume => 6,
        }
    }
}

/// Fixed description of one lookup table.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct LutSpec {
    pub width: u32,
    pub height: u32,
    pub depth: u32,
    pub dimension: TextureDimension,
    pub format: TextureFormat,
}

impl LutSpec {
    pub const TRANSMITTANCE: Self = Self::d2(256, 64);
    pub const MULTI_SCATTERED: Self = Self::d2(32, 32);
    pub const SKY_VIEW: Self = Self::d2(192, 104);
    pub const CAMERA_VOLUME: Self = Self {
        width: 32,
        height: 32,
        depth: 16,
        dimension: TextureDimension::D3,
        format: LUT_FORMAT,
    };

    pub const fn d2(width: u32, height: u32) -> Self {
        Self {
            width,
            height,
            depth: 1,
            dimension: TextureDimension::D2,
            format: LUT_FORMAT,
        }
    }

    pub fn size(&self) -> UVec3 {
        UVec3::new(self.width, self.height, self.depth)
    }

    pub fn extent(&self) -> Extent3d {
        Extent3d {
            width: self.width,
            height: self.height,
            depth_or_array_layers: self.depth,
        }
    }

    /// `(width, height, 1 / width, 1 / height)` for texel-center sampling.
    pub fn size_and_inverse(&self) -> Vec4 {
        let size = Vec2::new(self.width as f32, self.height as f32);
        Vec4::new(size.x, size.y, size.x.recip(), size.y.recip())
    }

    /// `(1 / width, 1 / height, 1 / depth, depth)` for the volume table.
    pub fn inverse_and_depth(&self) -> Vec4 {
        let depth = self.depth as f32;
        Vec4::new(
            (self.width as f32).recip(),
            (self.height as f32).recip(),
            depth.recip(),
            depth,
        )
    }
}

/// Host side of the LUT cache: hands out and takes back GPU textures.
pub trait LutAllocator {
    type Texture;

    fn allocate(&mut self, id: LutId, spec: &LutSpec) -> Self::Texture;
    fn release(&mut self, id: LutId, texture: Self::Texture);
}

struct CachedLut<T> {
    size: UVec3,
    texture: T,
}

/// Keeps one texture per LUT alive across frames, reallocating only when the
/// requested size differs from the held one.
pub struct LutCache<T> {
    slots: [Option<CachedLut<T>>; 4],
}

impl<T> Default for LutCache<T> {
    fn default() -> Self {
        Self {
            slots: [None, None, None, None],
        }
    }
}

impl<T> LutCache<T> {
    /// Makes sure `id` is backed by a texture of `spec`'s size. Returns true
    /// when a new texture was allocated.
    pub fn fetch<A>(&mut self, id: LutId, spec: &LutSpec, allocator: &mut A) -> bool
    where
        A: LutAllocator<Texture = T>,
    {
        let size = spec.size();
        let slot = &mut self.slots[id.index()];
        if slot.as_ref().is_some_and(|cached| cached.size == size) {
            return false;
        }
        if let Some(stale) = slot.take() {
            allocator.release(id, stale.texture);
        }
        *slot = Some(CachedLut {
            size,
            texture: allocator.allocate(id, spec),
        });
        true
    }

    /// Fetches every LUT at its fixed size, returning how many were allocated.
    pub fn fetch_all<A>(&mut self, allocator: &mut A) -> usize
    where
        A: LutAllocator<Texture = T>,
    {
        LutId::ALL
            .into_iter()
            .filter(|&id| self.fetch(id, &id.spec(), allocator))
            .count()
    }

    pub fn get(&self, id: LutId) -> Option<&T> {
        self.slots[id.index()].as_ref().map(|cached| &cached.texture)
    }

    /// Hands every held texture back to the allocator, returning how many
    /// were released.
    pub fn release_all<A>(&mut self, allocator: &mut A) -> usize
    where
        A: LutAllocator<Texture = T>,
    {
        let mut released = 0;
        for id in LutId::ALL {
            if let Some(cached) = self.slots[id.index()].take() {
                allocator.release(id, cached.texture);
                released += 1;
            }
        }
        released
    }

    /// Keeps every table allocated while some view renders an atmosphere and
    /// frees them all on the first frame without one.
    pub fn sync<A>(&mut self, in_use: bool, allocator: &mut A) -> LutCacheChange
    where
        A: LutAllocator<Texture = T>,
    {
        let count = if in_use {
            self.fetch_all(allocator)
        } else {
            self.release_all(allocator)
        };
        match (count, in_use) {
            (0, _) => LutCacheChange::Unchanged,
            (count, true) => LutCacheChange::Allocated(count),
            (count, false) => LutCacheChange::Released(count),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LutCacheChange {
    Unchanged,
    Allocated(usize),
    Released(usize),
}

/// Texture description of a LUT. The label is the table's published name.
pub fn lut_descriptor(id: LutId, spec: &LutSpec) -> TextureDescriptor<'static> {
    TextureDescriptor {
        label: Some(id.binding_name()),
        size: spec.extent(),
        mip_level_count: 1,
        sample_count: 1,
        dimension: spec.dimension,
        format: spec.format,
        usage: TextureUsages::STORAGE_BINDING | TextureUsages::TEXTURE_BINDING,
        view_formats: &[],
    }
}

pub struct GpuLut {
    pub texture: Texture,
    pub view: TextureView,
}

pub struct RenderDeviceAllocator<'a> {
    render_device: &'a RenderDevice,
}

impl<'a> RenderDeviceAllocator<'a> {
    pub fn new(render_device: &'a RenderDevice) -> Self {
        Self { render_device }
    }
}

impl LutAllocator for RenderDeviceAllocator<'_> {
    type Texture = GpuLut;

    fn allocate(&mut self, id: LutId, spec: &LutSpec) -> GpuLut {
        log::debug!(
            "Allocating {} ({}x{}x{})",
            id.binding_name(),
            spec.width,
            spec.height,
            spec.depth
        );
        let texture = self.render_device.create_texture(&lut_descriptor(id, spec));
        let view = texture.create_view(&TextureViewDescriptor::default());
        GpuLut { texture, view }
    }

    fn release(&mut self, id: LutId, lut: GpuLut) {
        log::debug!("Releasing {}", id.binding_name());
        // wgpu keeps the texture alive until in-flight submissions finish.
        drop(lut);
    }
}

/// Render-world owner of the four LUT textures.
#[derive(Resource, Default)]
pub struct SkyAtmosphereLuts {
    cache: LutCache<GpuLut>,
}

impl SkyAtmosphereLuts {
    pub fn view(&self, id: LutId) -> Option<&TextureView> {
        self.cache.get(id).map(|lut| &lut.view)
    }
}

/// Runs before the render graph, so reallocation never races a pass that
/// samples last frame's texture.
pub fn prepare_atmosphere_luts(
    mut luts: ResMut<SkyAtmosphereLuts>,
    render_device: Res<RenderDevice>,
    views: Query<(), With<SkyAtmosphereUniform>>,
) {
    let mut allocator = RenderDeviceAllocator::new(&render_device);
    match luts.cache.sync(!views.is_empty(), &mut allocator) {
        LutCacheChange::Unchanged => {}
        LutCacheChange::Allocated(count) => {
            log::debug!("Sky atmosphere allocated {count} LUT texture(s)");
        }
        LutCacheChange::Released(count) => {
            log::debug!("No atmosphere views left, released {count} LUT texture(s)");
        }
    }
}

/// Group 0 of every sky atmosphere shader: the parameter block and the view.
pub fn atmosphere_view_layout(render_device: &RenderDevice) -> BindGroupLayout {
    render_device.create_bind_group_layout(
        "sky_atmosphere_view_layout",
        &BindGroupLayoutEntries::sequential(
            ShaderStages::COMPUTE | ShaderStages::FRAGMENT,
            (
                uniform_buffer::<SkyAtmosphereUniform>(true),
                uniform_buffer::<ViewUniform>(true),
            ),
        ),
    )
}

pub fn lut_sampler(render_device: &RenderDevice) -> Sampler {
    render_device.create_sampler(&SamplerDescriptor {
        label: Some("sky_atmosphere_lut_sampler"),
        mag_filter: FilterMode::Linear,
        min_filter: FilterMode::Linear,
        address_mode_u: AddressMode::ClampToEdge,
        address_mode_v: AddressMode::ClampToEdge,
        address_mode_w: AddressMode::ClampToEdge,
        ..default()
    })
}
