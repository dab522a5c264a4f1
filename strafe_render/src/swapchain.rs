//! The swapchain and everything keyed to its size: image views, the depth
//! attachment, the render pass and the framebuffers.
//!
//! The whole bundle is recreated wholesale when the surface changes. Color
//! attachments load as DONT_CARE because the frame clears color with rects
//! mid-pass; depth and stencil clear on load.

use ash::vk;
use log::{debug, info};

use crate::context::RenderContext;
use crate::error::{GfxError, GfxResult};

/// Depth formats in preference order. Stencil bits are required for the
/// shadow-volume phases.
const DEPTH_FORMAT_CANDIDATES: [vk::Format; 2] =
    [vk::Format::D24_UNORM_S8_UINT, vk::Format::D32_SFLOAT_S8_UINT];

fn choose_surface_format(formats: &[vk::SurfaceFormatKHR]) -> GfxResult<vk::SurfaceFormatKHR> {
    formats
        .iter()
        .copied()
        .find(|f| {
            f.format == vk::Format::B8G8R8A8_SRGB
                && f.color_space == vk::ColorSpaceKHR::SRGB_NONLINEAR
        })
        .or_else(|| formats.first().copied())
        .ok_or(GfxError::NoSurfaceFormat)
}

fn choose_present_mode(modes: &[vk::PresentModeKHR], vsync: bool) -> vk::PresentModeKHR {
    if !vsync && modes.contains(&vk::PresentModeKHR::MAILBOX) {
        vk::PresentModeKHR::MAILBOX
    } else {
        // FIFO is the only mode the implementation must support.
        vk::PresentModeKHR::FIFO
    }
}

fn choose_extent(caps: &vk::SurfaceCapabilitiesKHR, width_hint: u32, height_hint: u32) -> vk::Extent2D {
    if caps.current_extent.width != u32::MAX {
        return caps.current_extent;
    }
    vk::Extent2D {
        width: width_hint.clamp(caps.min_image_extent.width, caps.max_image_extent.width),
        height: height_hint.clamp(caps.min_image_extent.height, caps.max_image_extent.height),
    }
}

fn choose_image_count(caps: &vk::SurfaceCapabilitiesKHR) -> u32 {
    let mut count = caps.min_image_count + 1;
    if caps.max_image_count > 0 {
        count = count.min(caps.max_image_count);
    }
    count
}

fn first_supported_depth_format(supports: impl Fn(vk::Format) -> bool) -> GfxResult<vk::Format> {
    DEPTH_FORMAT_CANDIDATES
        .into_iter()
        .find(|&f| supports(f))
        .ok_or(GfxError::NoDepthFormat)
}

pub(crate) struct SwapchainBundle {
    device: ash::Device,
    loader: ash::extensions::khr::Swapchain,
    swapchain: vk::SwapchainKHR,
    format: vk::SurfaceFormatKHR,
    extent: vk::Extent2D,
    views: Vec<vk::ImageView>,
    depth_image: vk::Image,
    depth_memory: vk::DeviceMemory,
    depth_view: vk::ImageView,
    render_pass: vk::RenderPass,
    framebuffers: Vec<vk::Framebuffer>,
}

impl SwapchainBundle {
    pub(crate) fn new(
        ctx: &RenderContext,
        width_hint: u32,
        height_hint: u32,
        vsync: bool,
    ) -> GfxResult<Self> {
        let device = ctx.device().clone();
        let loader = ctx.swapchain_loader().clone();
        let surface_loader = ctx.surface_loader();
        let (caps, formats, modes) = unsafe {
            (
                surface_loader
                    .get_physical_device_surface_capabilities(ctx.phys(), ctx.surface())
                    .map_err(|e| GfxError::api("get_physical_device_surface_capabilities", e))?,
                surface_loader
                    .get_physical_device_surface_formats(ctx.phys(), ctx.surface())
                    .map_err(|e| GfxError::api("get_physical_device_surface_formats", e))?,
                surface_loader
                    .get_physical_device_surface_present_modes(ctx.phys(), ctx.surface())
                    .map_err(|e| GfxError::api("get_physical_device_surface_present_modes", e))?,
            )
        };
        let format = choose_surface_format(&formats)?;
        let present_mode = choose_present_mode(&modes, vsync);
        let extent = choose_extent(&caps, width_hint, height_hint);
        let image_count = choose_image_count(&caps);

        let swapchain_info = vk::SwapchainCreateInfoKHR::builder()
            .surface(ctx.surface())
            .min_image_count(image_count)
            .image_format(format.format)
            .image_color_space(format.color_space)
            .image_extent(extent)
            .image_array_layers(1)
            .image_usage(vk::ImageUsageFlags::COLOR_ATTACHMENT)
            .image_sharing_mode(vk::SharingMode::EXCLUSIVE)
            .pre_transform(caps.current_transform)
            .composite_alpha(vk::CompositeAlphaFlagsKHR::OPAQUE)
            .present_mode(present_mode)
            .clipped(true);
        let swapchain = unsafe { loader.create_swapchain(&swapchain_info, None) }
            .map_err(|e| GfxError::api("create_swapchain", e))?;
        let images = unsafe { loader.get_swapchain_images(swapchain) }
            .map_err(|e| GfxError::api("get_swapchain_images", e))?;

        let mut views = Vec::with_capacity(images.len());
        for &image in &images {
            let info = vk::ImageViewCreateInfo::builder()
                .image(image)
                .view_type(vk::ImageViewType::TYPE_2D)
                .format(format.format)
                .subresource_range(vk::ImageSubresourceRange {
                    aspect_mask: vk::ImageAspectFlags::COLOR,
                    base_mip_level: 0,
                    level_count: 1,
                    base_array_layer: 0,
                    layer_count: 1,
                });
            let view = unsafe { device.create_image_view(&info, None) }
                .map_err(|e| GfxError::api("create_image_view", e))?;
            views.push(view);
        }

        let depth_format = first_supported_depth_format(|f| {
            let props = unsafe { ctx.instance().get_physical_device_format_properties(ctx.phys(), f) };
            props
                .optimal_tiling_features
                .contains(vk::FormatFeatureFlags::DEPTH_STENCIL_ATTACHMENT)
        })?;
        let (depth_image, depth_memory, depth_view) = {
            let info = vk::ImageCreateInfo::builder()
                .image_type(vk::ImageType::TYPE_2D)
                .format(depth_format)
                .extent(vk::Extent3D { width: extent.width, height: extent.height, depth: 1 })
                .mip_levels(1)
                .array_layers(1)
                .samples(vk::SampleCountFlags::TYPE_1)
                .tiling(vk::ImageTiling::OPTIMAL)
                .usage(vk::ImageUsageFlags::DEPTH_STENCIL_ATTACHMENT)
                .sharing_mode(vk::SharingMode::EXCLUSIVE)
                .initial_layout(vk::ImageLayout::UNDEFINED);
            let image = unsafe { device.create_image(&info, None) }
                .map_err(|e| GfxError::api("create_image", e))?;
            let req = unsafe { device.get_image_memory_requirements(image) };
            let mem_type = ctx.find_memory_type(req.memory_type_bits, vk::MemoryPropertyFlags::DEVICE_LOCAL)?;
            let alloc = vk::MemoryAllocateInfo::builder()
                .allocation_size(req.size)
                .memory_type_index(mem_type);
            let memory = unsafe { device.allocate_memory(&alloc, None) }
                .map_err(|e| GfxError::api("allocate_memory", e))?;
            unsafe { device.bind_image_memory(image, memory, 0) }
                .map_err(|e| GfxError::api("bind_image_memory", e))?;
            let view_info = vk::ImageViewCreateInfo::builder()
                .image(image)
                .view_type(vk::ImageViewType::TYPE_2D)
                .format(depth_format)
                .subresource_range(vk::ImageSubresourceRange {
                    aspect_mask: vk::ImageAspectFlags::DEPTH | vk::ImageAspectFlags::STENCIL,
                    base_mip_level: 0,
                    level_count: 1,
                    base_array_layer: 0,
                    layer_count: 1,
                });
            let view = unsafe { device.create_image_view(&view_info, None) }
                .map_err(|e| GfxError::api("create_image_view", e))?;
            (image, memory, view)
        };

        let attachments = [
            vk::AttachmentDescription {
                format: format.format,
                samples: vk::SampleCountFlags::TYPE_1,
                load_op: vk::AttachmentLoadOp::DONT_CARE,
                store_op: vk::AttachmentStoreOp::STORE,
                stencil_load_op: vk::AttachmentLoadOp::DONT_CARE,
                stencil_store_op: vk::AttachmentStoreOp::DONT_CARE,
                initial_layout: vk::ImageLayout::UNDEFINED,
                final_layout: vk::ImageLayout::PRESENT_SRC_KHR,
                ..Default::default()
            },
            vk::AttachmentDescription {
                format: depth_format,
                samples: vk::SampleCountFlags::TYPE_1,
                load_op: vk::AttachmentLoadOp::CLEAR,
                store_op: vk::AttachmentStoreOp::DONT_CARE,
                stencil_load_op: vk::AttachmentLoadOp::CLEAR,
                stencil_store_op: vk::AttachmentStoreOp::DONT_CARE,
                initial_layout: vk::ImageLayout::UNDEFINED,
                final_layout: vk::ImageLayout::DEPTH_STENCIL_ATTACHMENT_OPTIMAL,
                ..Default::default()
            },
        ];
        let color_ref = vk::AttachmentReference {
            attachment: 0,
            layout: vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL,
        };
        let depth_ref = vk::AttachmentReference {
            attachment: 1,
            layout: vk::ImageLayout::DEPTH_STENCIL_ATTACHMENT_OPTIMAL,
        };
        let subpass = vk::SubpassDescription::builder()
            .pipeline_bind_point(vk::PipelineBindPoint::GRAPHICS)
            .color_attachments(std::slice::from_ref(&color_ref))
            .depth_stencil_attachment(&depth_ref)
            .build();
        let dependency = vk::SubpassDependency {
            src_subpass: vk::SUBPASS_EXTERNAL,
            dst_subpass: 0,
            src_stage_mask: vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT
                | vk::PipelineStageFlags::EARLY_FRAGMENT_TESTS,
            src_access_mask: vk::AccessFlags::empty(),
            dst_stage_mask: vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT
                | vk::PipelineStageFlags::EARLY_FRAGMENT_TESTS,
            dst_access_mask: vk::AccessFlags::COLOR_ATTACHMENT_WRITE
                | vk::AccessFlags::DEPTH_STENCIL_ATTACHMENT_WRITE,
            dependency_flags: vk::DependencyFlags::empty(),
        };
        let pass_info = vk::RenderPassCreateInfo::builder()
            .attachments(&attachments)
            .subpasses(std::slice::from_ref(&subpass))
            .dependencies(std::slice::from_ref(&dependency));
        let render_pass = unsafe { device.create_render_pass(&pass_info, None) }
            .map_err(|e| GfxError::api("create_render_pass", e))?;

        let mut framebuffers = Vec::with_capacity(views.len());
        for &view in &views {
            let fb_attachments = [view, depth_view];
            let info = vk::FramebufferCreateInfo::builder()
                .render_pass(render_pass)
                .attachments(&fb_attachments)
                .width(extent.width)
                .height(extent.height)
                .layers(1);
            let fb = unsafe { device.create_framebuffer(&info, None) }
                .map_err(|e| GfxError::api("create_framebuffer", e))?;
            framebuffers.push(fb);
        }

        info!(
            "swapchain {}x{} {:?} present={:?} images={}",
            extent.width,
            extent.height,
            format.format,
            present_mode,
            views.len()
        );
        debug!("depth attachment {depth_format:?}");

        Ok(Self {
            device,
            loader,
            swapchain,
            format,
            extent,
            views,
            depth_image,
            depth_memory,
            depth_view,
            render_pass,
            framebuffers,
        })
    }

    /// Tear down and rebuild against the current surface state. The caller
    /// must have waited the device idle first.
    pub(crate) fn recreate(
        &mut self,
        ctx: &RenderContext,
        width_hint: u32,
        height_hint: u32,
        vsync: bool,
    ) -> GfxResult<()> {
        unsafe { self.destroy() };
        *self = Self::new(ctx, width_hint, height_hint, vsync)?;
        Ok(())
    }

    pub(crate) fn swapchain(&self) -> vk::SwapchainKHR {
        self.swapchain
    }

    pub(crate) fn render_pass(&self) -> vk::RenderPass {
        self.render_pass
    }

    pub(crate) fn extent(&self) -> vk::Extent2D {
        self.extent
    }

    pub(crate) fn surface_format(&self) -> vk::Format {
        self.format.format
    }

    pub(crate) fn framebuffer(&self, image_index: u32) -> vk::Framebuffer {
        self.framebuffers[image_index as usize]
    }

    unsafe fn destroy(&mut self) {
        for fb in self.framebuffers.drain(..) {
            self.device.destroy_framebuffer(fb, None);
        }
        if self.render_pass != vk::RenderPass::null() {
            self.device.destroy_render_pass(self.render_pass, None);
            self.render_pass = vk::RenderPass::null();
        }
        if self.depth_view != vk::ImageView::null() {
            self.device.destroy_image_view(self.depth_view, None);
            self.device.destroy_image(self.depth_image, None);
            self.device.free_memory(self.depth_memory, None);
            self.depth_view = vk::ImageView::null();
            self.depth_image = vk::Image::null();
            self.depth_memory = vk::DeviceMemory::null();
        }
        for view in self.views.drain(..) {
            self.device.destroy_image_view(view, None);
        }
        if self.swapchain != vk::SwapchainKHR::null() {
            self.loader.destroy_swapchain(self.swapchain, None);
            self.swapchain = vk::SwapchainKHR::null();
        }
    }
}

impl Drop for SwapchainBundle {
    fn drop(&mut self) {
        unsafe { self.destroy() };
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fmt(format: vk::Format, color_space: vk::ColorSpaceKHR) -> vk::SurfaceFormatKHR {
        vk::SurfaceFormatKHR { format, color_space }
    }

    #[test]
    fn srgb_bgra_is_preferred() {
        let formats = [
            fmt(vk::Format::R8G8B8A8_UNORM, vk::ColorSpaceKHR::SRGB_NONLINEAR),
            fmt(vk::Format::B8G8R8A8_SRGB, vk::ColorSpaceKHR::SRGB_NONLINEAR),
        ];
        let chosen = choose_surface_format(&formats).unwrap();
        assert_eq!(chosen.format, vk::Format::B8G8R8A8_SRGB);
    }

    #[test]
    fn first_format_is_the_fallback() {
        let formats = [
            fmt(vk::Format::R8G8B8A8_UNORM, vk::ColorSpaceKHR::SRGB_NONLINEAR),
            fmt(vk::Format::R5G6B5_UNORM_PACK16, vk::ColorSpaceKHR::SRGB_NONLINEAR),
        ];
        let chosen = choose_surface_format(&formats).unwrap();
        assert_eq!(chosen.format, vk::Format::R8G8B8A8_UNORM);
        assert!(matches!(choose_surface_format(&[]), Err(GfxError::NoSurfaceFormat)));
    }

    #[test]
    fn vsync_always_picks_fifo() {
        let modes = [vk::PresentModeKHR::MAILBOX, vk::PresentModeKHR::FIFO];
        assert_eq!(choose_present_mode(&modes, true), vk::PresentModeKHR::FIFO);
        assert_eq!(choose_present_mode(&modes, false), vk::PresentModeKHR::MAILBOX);
        assert_eq!(
            choose_present_mode(&[vk::PresentModeKHR::FIFO], false),
            vk::PresentModeKHR::FIFO
        );
    }

    #[test]
    fn extent_follows_surface_when_fixed() {
        let mut caps = vk::SurfaceCapabilitiesKHR::default();
        caps.current_extent = vk::Extent2D { width: 800, height: 600 };
        let e = choose_extent(&caps, 1920, 1080);
        assert_eq!((e.width, e.height), (800, 600));
    }

    #[test]
    fn extent_clamps_hint_when_flexible() {
        let mut caps = vk::SurfaceCapabilitiesKHR::default();
        caps.current_extent = vk::Extent2D { width: u32::MAX, height: u32::MAX };
        caps.min_image_extent = vk::Extent2D { width: 320, height: 240 };
        caps.max_image_extent = vk::Extent2D { width: 1600, height: 900 };
        let e = choose_extent(&caps, 1920, 100);
        assert_eq!((e.width, e.height), (1600, 240));
    }

    #[test]
    fn image_count_respects_driver_bounds() {
        let mut caps = vk::SurfaceCapabilitiesKHR::default();
        caps.min_image_count = 2;
        caps.max_image_count = 0;
        assert_eq!(choose_image_count(&caps), 3);
        caps.max_image_count = 2;
        assert_eq!(choose_image_count(&caps), 2);
    }

    #[test]
    fn depth_format_prefers_packed_24_bit() {
        let f = first_supported_depth_format(|_| true).unwrap();
        assert_eq!(f, vk::Format::D24_UNORM_S8_UINT);
        let f = first_supported_depth_format(|f| f == vk::Format::D32_SFLOAT_S8_UINT).unwrap();
        assert_eq!(f, vk::Format::D32_SFLOAT_S8_UINT);
        assert!(matches!(
            first_supported_depth_format(|_| false),
            Err(GfxError::NoDepthFormat)
        ));
    }
}
