//! The renderer facade: owns every component and drives the draw path.

use ash::vk;
use log::info;
use raw_window_handle::{RawDisplayHandle, RawWindowHandle};

use crate::config::{validate_config, RendererConfig};
use crate::context::RenderContext;
use crate::error::{GfxError, GfxResult};
use crate::frame::{BeginOutcome, FrameCycle, FramePhase, PresentOutcome};
use crate::geometry::GeometryStreams;
use crate::pipeline::{PipelineCache, PipelineStats};
use crate::samplers::{SamplerCache, SamplerDesc};
use crate::shaders::{ShaderSet, ShaderSetSources};
use crate::state::PipelineState;
use crate::swapchain::SwapchainBundle;
use crate::upload::{Texture, TextureUploader};

/// One draw call's worth of geometry. Attribute slices must share one
/// length; `tc1` is only read by multitexture descriptors. The transform is
/// a column-major 4x4 matrix pushed to the vertex stage.
pub struct DrawSubmission<'a> {
    pub positions: &'a [[f32; 4]],
    pub colors: &'a [[u8; 4]],
    pub tc0: &'a [[f32; 2]],
    pub tc1: Option<&'a [[f32; 2]]>,
    pub indices: &'a [u32],
    pub transform: [f32; 16],
}

fn push_constant_bytes(transform: &[f32; 16]) -> [u8; 64] {
    let mut out = [0u8; 64];
    for (i, v) in transform.iter().enumerate() {
        out[i * 4..i * 4 + 4].copy_from_slice(&v.to_ne_bytes());
    }
    out
}

/// Owns the device context and every resource layered on it.
///
/// Field order is teardown order: the frame cycle and per-frame buffers go
/// first, the context last.
pub struct Renderer {
    frame: FrameCycle,
    geometry: GeometryStreams,
    uploader: TextureUploader,
    pipelines: PipelineCache,
    samplers: SamplerCache,
    shaders: ShaderSet,
    targets: SwapchainBundle,
    ctx: RenderContext,
    cfg: RendererConfig,
    rebuild_pending: bool,
}

impl Renderer {
    pub fn new(
        display_handle: RawDisplayHandle,
        window_handle: RawWindowHandle,
        cfg: RendererConfig,
        shader_sources: &ShaderSetSources<'_>,
    ) -> GfxResult<Self> {
        validate_config(&cfg)?;
        let ctx = RenderContext::new(display_handle, window_handle, &cfg)?;
        let targets = SwapchainBundle::new(&ctx, cfg.surface.width, cfg.surface.height, cfg.surface.vsync)?;
        let shaders = ShaderSet::new(ctx.device(), shader_sources)?;
        let samplers = SamplerCache::new(ctx.device(), cfg.max_samplers, cfg.cache_overflow);
        let pipelines = PipelineCache::new(ctx.device(), &cfg)?;
        let uploader = TextureUploader::new(&ctx, pipelines.set_layout())?;
        let geometry = GeometryStreams::new(&ctx, cfg.max_vertices, cfg.max_indices)?;
        let frame = FrameCycle::new(&ctx, cfg.fence_timeout)?;
        info!(
            "renderer ready, surface format {:?}, {} vertices / {} indices per frame",
            targets.surface_format(),
            cfg.max_vertices,
            cfg.max_indices
        );
        Ok(Self {
            frame,
            geometry,
            uploader,
            pipelines,
            samplers,
            shaders,
            targets,
            ctx,
            cfg,
            rebuild_pending: false,
        })
    }

    /// Start the next frame. `RebuildNeeded` means the swapchain no longer
    /// matches the surface; call [`Renderer::recreate_swapchain`] and try
    /// again.
    pub fn begin_frame(&mut self) -> GfxResult<BeginOutcome> {
        if self.rebuild_pending {
            return Ok(BeginOutcome::RebuildNeeded);
        }
        let outcome = self.frame.begin_frame(&self.ctx, &self.targets, &mut self.geometry)?;
        if outcome == BeginOutcome::RebuildNeeded {
            self.rebuild_pending = true;
        }
        Ok(outcome)
    }

    /// Clear the color attachment. Valid only while recording.
    pub fn clear_color(&mut self, color: [f32; 4]) -> GfxResult<()> {
        self.frame.clear_color(&self.targets, color)
    }

    /// Record one draw: resolve the pipeline for `state`, stage the
    /// submission's geometry and bind `texture0` (and `texture1` for
    /// multitexture descriptors).
    pub fn draw(
        &mut self,
        state: &PipelineState,
        texture0: &Texture,
        texture1: Option<&Texture>,
        sub: &DrawSubmission<'_>,
    ) -> GfxResult<()> {
        self.frame.require_recording("draw")?;
        let n = sub.positions.len();
        if n == 0 || sub.indices.is_empty() {
            return Err(GfxError::Draw("empty submission"));
        }
        if sub.colors.len() != n || sub.tc0.len() != n {
            return Err(GfxError::Draw("attribute stream lengths differ"));
        }
        let multitexture = state.variant.multitexture();
        let second = if multitexture {
            let tc1 = sub.tc1.ok_or(GfxError::Draw("multitexture draw without tc1"))?;
            if tc1.len() != n {
                return Err(GfxError::Draw("attribute stream lengths differ"));
            }
            Some(texture1.ok_or(GfxError::Draw("multitexture draw without second texture"))?)
        } else {
            None
        };
        if sub.indices.iter().any(|&i| i as usize >= n) {
            return Err(GfxError::Draw("index out of range"));
        }

        let pipeline = self.pipelines.resolve(&self.shaders, self.targets.render_pass(), state)?;
        let vslot = self.geometry.append_vertices(
            sub.positions,
            sub.colors,
            sub.tc0,
            if multitexture { sub.tc1 } else { None },
        )?;
        let islot = self.geometry.append_indices(sub.indices)?;

        let cmd = self.frame.command_buffer();
        let layout = self.pipelines.pipeline_layout();
        let sets = [
            texture0.descriptor_set(),
            second.map(|t| t.descriptor_set()).unwrap_or_default(),
        ];
        let set_count = if second.is_some() { 2 } else { 1 };
        let buffers = [self.geometry.vertex_buffer(); 4];
        let push = push_constant_bytes(&sub.transform);
        unsafe {
            let device = self.ctx.device();
            device.cmd_bind_pipeline(cmd, vk::PipelineBindPoint::GRAPHICS, pipeline);
            device.cmd_bind_vertex_buffers(
                cmd,
                0,
                &buffers[..vslot.stream_count],
                &vslot.offsets[..vslot.stream_count],
            );
            device.cmd_bind_index_buffer(cmd, self.geometry.index_buffer(), islot.offset, vk::IndexType::UINT32);
            device.cmd_bind_descriptor_sets(
                cmd,
                vk::PipelineBindPoint::GRAPHICS,
                layout,
                0,
                &sets[..set_count],
                &[],
            );
            device.cmd_push_constants(cmd, layout, vk::ShaderStageFlags::VERTEX, 0, &push);
            device.cmd_draw_indexed(cmd, islot.count, 1, 0, 0, 0);
        }
        Ok(())
    }

    /// Submit and present the recorded frame.
    pub fn end_frame(&mut self) -> GfxResult<PresentOutcome> {
        let outcome = self.frame.end_frame(&self.ctx, &self.targets)?;
        if outcome == PresentOutcome::RebuildNeeded {
            self.rebuild_pending = true;
        }
        Ok(outcome)
    }

    /// Whether a swapchain rebuild has been requested and not yet done.
    pub fn rebuild_pending(&self) -> bool {
        self.rebuild_pending
    }

    /// Tear down and rebuild the swapchain at the given size. Cached
    /// pipelines are dropped with the render pass they were built against;
    /// samplers and textures survive.
    pub fn recreate_swapchain(&mut self, width: u32, height: u32) -> GfxResult<()> {
        self.frame.require_idle("recreate_swapchain")?;
        self.ctx.wait_idle();
        self.pipelines.clear();
        self.cfg.surface.width = width;
        self.cfg.surface.height = height;
        self.targets.recreate(&self.ctx, width, height, self.cfg.surface.vsync)?;
        self.rebuild_pending = false;
        Ok(())
    }

    pub fn resolve_sampler(&mut self, desc: SamplerDesc) -> GfxResult<vk::Sampler> {
        self.samplers.resolve(desc)
    }

    /// Create an RGBA8 texture bound to `sampler`. Contents are undefined
    /// until uploaded.
    pub fn create_texture(
        &mut self,
        width: u32,
        height: u32,
        mip_chain: bool,
        sampler: vk::Sampler,
    ) -> GfxResult<Texture> {
        self.uploader.create_texture(&self.ctx, width, height, mip_chain, sampler)
    }

    /// Upload all mip levels of `texture` from one packed payload. Must be
    /// called between frames; the transfer completes before returning.
    pub fn upload_texture(&mut self, texture: &Texture, pixels: &[u8]) -> GfxResult<()> {
        self.frame.require_idle("upload_texture")?;
        self.uploader.upload(
            &self.ctx,
            texture.image(),
            texture.width,
            texture.height,
            texture.mip_chain,
            pixels,
            4,
        )
    }

    /// Free a texture. Waits for the device so in-flight frames cannot
    /// still be sampling it.
    pub fn destroy_texture(&mut self, texture: Texture) -> GfxResult<()> {
        self.frame.require_idle("destroy_texture")?;
        self.ctx.wait_idle();
        self.uploader.destroy_texture(texture);
        Ok(())
    }

    pub fn pipeline_stats(&self) -> PipelineStats {
        self.pipelines.stats()
    }

    pub fn sampler_count(&self) -> usize {
        self.samplers.len()
    }

    pub fn frame_phase(&self) -> FramePhase {
        self.frame.phase()
    }
}

impl Drop for Renderer {
    fn drop(&mut self) {
        self.frame.mark_shutdown();
        self.ctx.wait_idle();
        let stats = self.pipelines.stats();
        info!(
            "shutdown: {} pipelines built in {:?}, {} samplers",
            stats.created,
            stats.total_build_time,
            self.samplers.len()
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transform_bytes_keep_order() {
        let mut m = [0.0f32; 16];
        for (i, v) in m.iter_mut().enumerate() {
            *v = i as f32;
        }
        let bytes = push_constant_bytes(&m);
        assert_eq!(bytes.len(), 64);
        assert_eq!(&bytes[0..4], &0.0f32.to_ne_bytes());
        assert_eq!(&bytes[60..64], &15.0f32.to_ne_bytes());
    }
}
