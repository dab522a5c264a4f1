//! Graphics pipeline construction and the descriptor-keyed pipeline cache.
//!
//! Every distinct [`PipelineState`] maps to one `vk::Pipeline`, built on
//! first use and kept until the cache is cleared for a swapchain rebuild.
//! Viewport and scissor are dynamic so pipelines survive resizes; only the
//! render pass ties them to the current swapchain.

use std::ffi::CString;
use std::time::{Duration, Instant};

use ash::vk;
use log::debug;

use crate::cache::CacheStore;
use crate::config::RendererConfig;
use crate::error::{GfxError, GfxResult};
use crate::shaders::ShaderSet;
use crate::state::{
    alpha_func, blend_config, color_write_mask, depth_stencil_config, vertex_attributes,
    vertex_bindings, CullFace, PipelineState, StateBits,
};

/// Size of the vertex-stage push constant block (a 4x4 transform).
pub(crate) const PUSH_CONSTANT_BYTES: u32 = 64;

/// Polygon-offset factors for decal-style surfaces.
const DEPTH_BIAS_CONSTANT: f32 = -2.0;
const DEPTH_BIAS_SLOPE: f32 = -1.0;

/// Set and pipeline layouts shared by every pipeline: two single-binding
/// combined-image-sampler sets (one per texture unit) plus the vertex push
/// constant block.
pub(crate) struct DescriptorLayouts {
    device: ash::Device,
    set_layout: vk::DescriptorSetLayout,
    pipeline_layout: vk::PipelineLayout,
}

impl DescriptorLayouts {
    pub(crate) fn new(device: &ash::Device) -> GfxResult<Self> {
        let bindings = [vk::DescriptorSetLayoutBinding::builder()
            .binding(0)
            .descriptor_type(vk::DescriptorType::COMBINED_IMAGE_SAMPLER)
            .descriptor_count(1)
            .stage_flags(vk::ShaderStageFlags::FRAGMENT)
            .build()];
        let set_info = vk::DescriptorSetLayoutCreateInfo::builder().bindings(&bindings);
        let set_layout = unsafe { device.create_descriptor_set_layout(&set_info, None) }
            .map_err(|e| GfxError::api("create_descriptor_set_layout", e))?;

        let set_layouts = [set_layout, set_layout];
        let push_range = vk::PushConstantRange {
            stage_flags: vk::ShaderStageFlags::VERTEX,
            offset: 0,
            size: PUSH_CONSTANT_BYTES,
        };
        let layout_info = vk::PipelineLayoutCreateInfo::builder()
            .set_layouts(&set_layouts)
            .push_constant_ranges(std::slice::from_ref(&push_range));
        let pipeline_layout = unsafe { device.create_pipeline_layout(&layout_info, None) }
            .map_err(|e| GfxError::api("create_pipeline_layout", e))?;

        Ok(Self { device: device.clone(), set_layout, pipeline_layout })
    }

    pub(crate) fn set_layout(&self) -> vk::DescriptorSetLayout {
        self.set_layout
    }

    pub(crate) fn pipeline_layout(&self) -> vk::PipelineLayout {
        self.pipeline_layout
    }
}

impl Drop for DescriptorLayouts {
    fn drop(&mut self) {
        unsafe {
            self.device.destroy_pipeline_layout(self.pipeline_layout, None);
            self.device.destroy_descriptor_set_layout(self.set_layout, None);
        }
    }
}

/// Lifetime counters for pipeline creation. `created` and the build time
/// accumulate across cache clears.
#[derive(Clone, Copy, Debug)]
pub struct PipelineStats {
    pub created: u64,
    pub total_build_time: Duration,
}

pub(crate) struct PipelineCache {
    device: ash::Device,
    layouts: DescriptorLayouts,
    store: CacheStore<PipelineState, vk::Pipeline>,
    build_time: Duration,
}

impl PipelineCache {
    pub(crate) fn new(device: &ash::Device, cfg: &RendererConfig) -> GfxResult<Self> {
        Ok(Self {
            device: device.clone(),
            layouts: DescriptorLayouts::new(device)?,
            store: CacheStore::new("pipeline", cfg.max_pipelines, cfg.cache_overflow),
            build_time: Duration::ZERO,
        })
    }

    pub(crate) fn resolve(
        &mut self,
        shaders: &ShaderSet,
        render_pass: vk::RenderPass,
        state: &PipelineState,
    ) -> GfxResult<vk::Pipeline> {
        let device = &self.device;
        let layout = self.layouts.pipeline_layout();
        let build_time = &mut self.build_time;
        self.store.get_or_insert_with(*state, || {
            let start = Instant::now();
            let pipeline = build_pipeline(device, shaders, layout, render_pass, state)?;
            *build_time += start.elapsed();
            debug!("built pipeline {:?} bits={:#06x}", state.variant, state.bits.bits());
            Ok(pipeline)
        })
    }

    pub(crate) fn stats(&self) -> PipelineStats {
        PipelineStats { created: self.store.created(), total_build_time: self.build_time }
    }

    pub(crate) fn set_layout(&self) -> vk::DescriptorSetLayout {
        self.layouts.set_layout()
    }

    pub(crate) fn pipeline_layout(&self) -> vk::PipelineLayout {
        self.layouts.pipeline_layout()
    }

    /// Destroy every cached pipeline, keeping the lifetime stats. Called
    /// when the render pass they were built against goes away.
    pub(crate) fn clear(&mut self) {
        let mut destroyed = 0usize;
        for (_, pipeline) in self.store.drain() {
            unsafe { self.device.destroy_pipeline(pipeline, None) };
            destroyed += 1;
        }
        if destroyed > 0 {
            debug!("destroyed {destroyed} cached pipelines");
        }
    }
}

impl Drop for PipelineCache {
    fn drop(&mut self) {
        self.clear();
    }
}

fn build_pipeline(
    device: &ash::Device,
    shaders: &ShaderSet,
    layout: vk::PipelineLayout,
    render_pass: vk::RenderPass,
    state: &PipelineState,
) -> GfxResult<vk::Pipeline> {
    let alpha = alpha_func(state.bits)?;
    let blend = blend_config(state.bits)?;
    let ds_cfg = depth_stencil_config(state.bits, state.shadow_phase, state.cull);

    let spec_data = alpha.specialization_value().to_ne_bytes();
    let spec_entries = [vk::SpecializationMapEntry {
        constant_id: 0,
        offset: 0,
        size: 4,
    }];
    let spec_info = vk::SpecializationInfo::builder()
        .map_entries(&spec_entries)
        .data(&spec_data);

    let entry = CString::new("main").unwrap_or_default();
    let pair = shaders.pair(state.variant);
    let stages = [
        vk::PipelineShaderStageCreateInfo::builder()
            .stage(vk::ShaderStageFlags::VERTEX)
            .module(pair.vertex(state.clipping_plane))
            .name(&entry)
            .build(),
        vk::PipelineShaderStageCreateInfo::builder()
            .stage(vk::ShaderStageFlags::FRAGMENT)
            .module(pair.fragment())
            .name(&entry)
            .specialization_info(&spec_info)
            .build(),
    ];

    let vertex_input = vk::PipelineVertexInputStateCreateInfo::builder()
        .vertex_binding_descriptions(vertex_bindings(state.variant))
        .vertex_attribute_descriptions(vertex_attributes(state.variant));

    let topology = if state.line_primitives {
        vk::PrimitiveTopology::LINE_LIST
    } else {
        vk::PrimitiveTopology::TRIANGLE_LIST
    };
    let input_assembly = vk::PipelineInputAssemblyStateCreateInfo::builder().topology(topology);

    // Viewport and scissor are set per frame; only the counts are fixed.
    let viewport_state = vk::PipelineViewportStateCreateInfo::builder()
        .viewport_count(1)
        .scissor_count(1);
    let dynamic_states = [vk::DynamicState::VIEWPORT, vk::DynamicState::SCISSOR];
    let dynamic_state = vk::PipelineDynamicStateCreateInfo::builder().dynamic_states(&dynamic_states);

    let cull_mode = match state.cull {
        CullFace::None => vk::CullModeFlags::NONE,
        CullFace::Front => vk::CullModeFlags::FRONT,
        CullFace::Back => vk::CullModeFlags::BACK,
    };
    // Mirrored views flip the winding instead of swapping cull sides.
    let front_face = if state.mirror {
        vk::FrontFace::COUNTER_CLOCKWISE
    } else {
        vk::FrontFace::CLOCKWISE
    };
    let polygon_mode = if state.bits.contains(StateBits::POLYGON_LINE) {
        vk::PolygonMode::LINE
    } else {
        vk::PolygonMode::FILL
    };
    let raster = vk::PipelineRasterizationStateCreateInfo::builder()
        .polygon_mode(polygon_mode)
        .cull_mode(cull_mode)
        .front_face(front_face)
        .line_width(1.0)
        .depth_bias_enable(state.polygon_offset)
        .depth_bias_constant_factor(DEPTH_BIAS_CONSTANT)
        .depth_bias_slope_factor(DEPTH_BIAS_SLOPE);

    let multisample = vk::PipelineMultisampleStateCreateInfo::builder()
        .rasterization_samples(vk::SampleCountFlags::TYPE_1);

    let mut depth_stencil = vk::PipelineDepthStencilStateCreateInfo::builder()
        .depth_test_enable(ds_cfg.depth_test)
        .depth_write_enable(ds_cfg.depth_write)
        .depth_compare_op(ds_cfg.compare)
        .max_depth_bounds(1.0);
    if let Some(stencil) = ds_cfg.stencil {
        depth_stencil = depth_stencil
            .stencil_test_enable(true)
            .front(stencil)
            .back(stencil);
    }

    let mut attachment = vk::PipelineColorBlendAttachmentState::builder()
        .color_write_mask(color_write_mask(state.shadow_phase))
        .blend_enable(blend.is_some());
    if let Some(b) = blend {
        attachment = attachment
            .src_color_blend_factor(b.src)
            .dst_color_blend_factor(b.dst)
            .color_blend_op(vk::BlendOp::ADD)
            .src_alpha_blend_factor(b.src)
            .dst_alpha_blend_factor(b.dst)
            .alpha_blend_op(vk::BlendOp::ADD);
    }
    let attachments = [attachment.build()];
    let color_blend = vk::PipelineColorBlendStateCreateInfo::builder().attachments(&attachments);

    let info = vk::GraphicsPipelineCreateInfo::builder()
        .stages(&stages)
        .vertex_input_state(&vertex_input)
        .input_assembly_state(&input_assembly)
        .viewport_state(&viewport_state)
        .rasterization_state(&raster)
        .multisample_state(&multisample)
        .depth_stencil_state(&depth_stencil)
        .color_blend_state(&color_blend)
        .dynamic_state(&dynamic_state)
        .layout(layout)
        .render_pass(render_pass)
        .subpass(0)
        .build();
    let pipelines = unsafe {
        device.create_graphics_pipelines(vk::PipelineCache::null(), std::slice::from_ref(&info), None)
    }
    .map_err(|(_, e)| GfxError::api("create_graphics_pipelines", e))?;
    Ok(pipelines[0])
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::OverflowPolicy;
    use crate::state::ShaderVariant;
    use ash::vk::Handle;

    #[test]
    fn push_constants_hold_one_matrix() {
        assert_eq!(PUSH_CONSTANT_BYTES as usize, std::mem::size_of::<[f32; 16]>());
    }

    #[test]
    fn descriptor_changes_produce_distinct_entries() {
        let mut store: CacheStore<PipelineState, vk::Pipeline> =
            CacheStore::new("pipeline", 8, OverflowPolicy::Fatal);
        let base = PipelineState::opaque(ShaderVariant::SingleTexture);
        let mut mirrored = base;
        mirrored.mirror = true;

        let first = store
            .get_or_insert_with(base, || Ok(vk::Pipeline::from_raw(1)))
            .unwrap();
        let again = store
            .get_or_insert_with(base, || Ok(vk::Pipeline::from_raw(2)))
            .unwrap();
        assert_eq!(first, again);
        store
            .get_or_insert_with(mirrored, || Ok(vk::Pipeline::from_raw(3)))
            .unwrap();
        assert_eq!(store.len(), 2);
        assert_eq!(store.created(), 2);
    }

    #[test]
    fn full_store_still_serves_known_descriptors() {
        let mut store: CacheStore<PipelineState, vk::Pipeline> =
            CacheStore::new("pipeline", 1, OverflowPolicy::Fatal);
        let known = PipelineState::opaque(ShaderVariant::SingleTexture);
        let mut other = known;
        other.polygon_offset = true;

        store
            .get_or_insert_with(known, || Ok(vk::Pipeline::from_raw(7)))
            .unwrap();
        let err = store
            .get_or_insert_with(other, || Ok(vk::Pipeline::from_raw(8)))
            .unwrap_err();
        assert!(matches!(err, GfxError::CacheFull { cache: "pipeline", capacity: 1 }));
        let hit = store
            .get_or_insert_with(known, || Ok(vk::Pipeline::from_raw(9)))
            .unwrap();
        assert_eq!(hit, vk::Pipeline::from_raw(7));
    }
}
