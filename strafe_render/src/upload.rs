//! Texture image creation and the staged upload path.
//!
//! Pixel bytes travel through a single host-visible staging buffer that is
//! grown by destroy-and-recreate whenever an upload needs more room. One
//! upload is in flight at a time; the recorded transfer is submitted through
//! [`RenderContext::immediate_commands`] and waited on synchronously.
//!
//! Mip content is produced by the caller. The payload holds every level
//! back to back, laid out exactly as [`mip_regions`] describes.

use ash::vk;
use log::debug;

use crate::context::RenderContext;
use crate::error::{GfxError, GfxResult};

const DESCRIPTOR_POOL_CAPACITY: u32 = 1024;

/// One mip level's slice of an upload payload.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct MipRegion {
    pub level: u32,
    pub width: u32,
    pub height: u32,
    /// Byte offset of this level within the payload.
    pub offset: u64,
    pub len: u64,
}

/// Compute the upload regions for an image. With `mip_chain` set the
/// dimensions halve per level (clamped at 1) down to 1x1; otherwise only the
/// base level is produced.
pub fn mip_regions(width: u32, height: u32, mip_chain: bool, bytes_per_pixel: u32) -> Vec<MipRegion> {
    let mut regions = Vec::new();
    let mut w = width.max(1);
    let mut h = height.max(1);
    let mut offset = 0u64;
    let mut level = 0u32;
    loop {
        let len = u64::from(w) * u64::from(h) * u64::from(bytes_per_pixel);
        regions.push(MipRegion { level, width: w, height: h, offset, len });
        if !mip_chain || (w == 1 && h == 1) {
            break;
        }
        w = (w / 2).max(1);
        h = (h / 2).max(1);
        offset += len;
        level += 1;
    }
    regions
}

pub fn mip_level_count(width: u32, height: u32, mip_chain: bool) -> u32 {
    mip_regions(width, height, mip_chain, 1).len() as u32
}

pub(crate) fn payload_size(regions: &[MipRegion]) -> u64 {
    regions.last().map(|r| r.offset + r.len).unwrap_or(0)
}

struct StagingBuffer {
    device: ash::Device,
    buffer: vk::Buffer,
    memory: vk::DeviceMemory,
    ptr: *mut u8,
    capacity: vk::DeviceSize,
}

impl StagingBuffer {
    fn new(device: &ash::Device) -> Self {
        Self {
            device: device.clone(),
            buffer: vk::Buffer::null(),
            memory: vk::DeviceMemory::null(),
            ptr: std::ptr::null_mut(),
            capacity: 0,
        }
    }

    fn ensure_capacity(&mut self, ctx: &RenderContext, needed: vk::DeviceSize) -> GfxResult<()> {
        if needed <= self.capacity {
            return Ok(());
        }
        unsafe {
            self.destroy();
            let info = vk::BufferCreateInfo::builder()
                .size(needed)
                .usage(vk::BufferUsageFlags::TRANSFER_SRC)
                .sharing_mode(vk::SharingMode::EXCLUSIVE);
            let buffer = self
                .device
                .create_buffer(&info, None)
                .map_err(|e| GfxError::api("create_buffer", e))?;
            let req = self.device.get_buffer_memory_requirements(buffer);
            let mem_type = ctx.find_memory_type(
                req.memory_type_bits,
                vk::MemoryPropertyFlags::HOST_VISIBLE | vk::MemoryPropertyFlags::HOST_COHERENT,
            )?;
            let alloc = vk::MemoryAllocateInfo::builder()
                .allocation_size(req.size)
                .memory_type_index(mem_type);
            let memory = self
                .device
                .allocate_memory(&alloc, None)
                .map_err(|e| GfxError::api("allocate_memory", e))?;
            self.device
                .bind_buffer_memory(buffer, memory, 0)
                .map_err(|e| GfxError::api("bind_buffer_memory", e))?;
            let ptr = self
                .device
                .map_memory(memory, 0, needed, vk::MemoryMapFlags::empty())
                .map_err(|e| GfxError::api("map_memory", e))? as *mut u8;
            self.buffer = buffer;
            self.memory = memory;
            self.ptr = ptr;
            self.capacity = needed;
            debug!("staging buffer grown to {needed} bytes");
        }
        Ok(())
    }

    /// Caller must have ensured capacity for `bytes.len()`.
    fn write(&mut self, bytes: &[u8]) {
        debug_assert!(bytes.len() as u64 <= self.capacity);
        unsafe {
            std::ptr::copy_nonoverlapping(bytes.as_ptr(), self.ptr, bytes.len());
        }
    }

    unsafe fn destroy(&mut self) {
        if self.buffer != vk::Buffer::null() {
            self.device.unmap_memory(self.memory);
            self.device.destroy_buffer(self.buffer, None);
            self.device.free_memory(self.memory, None);
            self.buffer = vk::Buffer::null();
            self.memory = vk::DeviceMemory::null();
            self.ptr = std::ptr::null_mut();
            self.capacity = 0;
        }
    }
}

impl Drop for StagingBuffer {
    fn drop(&mut self) {
        unsafe {
            self.destroy();
        }
    }
}

/// A sampled 2D RGBA8 image with its memory, view and the descriptor set
/// that binds it together with a sampler.
pub struct Texture {
    pub width: u32,
    pub height: u32,
    pub mip_levels: u32,
    pub mip_chain: bool,
    image: vk::Image,
    memory: vk::DeviceMemory,
    view: vk::ImageView,
    descriptor_set: vk::DescriptorSet,
}

impl Texture {
    pub fn image(&self) -> vk::Image {
        self.image
    }

    pub(crate) fn descriptor_set(&self) -> vk::DescriptorSet {
        self.descriptor_set
    }
}

pub struct TextureUploader {
    device: ash::Device,
    staging: StagingBuffer,
    descriptor_pool: vk::DescriptorPool,
    set_layout: vk::DescriptorSetLayout,
}

impl TextureUploader {
    pub fn new(ctx: &RenderContext, set_layout: vk::DescriptorSetLayout) -> GfxResult<Self> {
        let device = ctx.device();
        let pool_sizes = [vk::DescriptorPoolSize {
            ty: vk::DescriptorType::COMBINED_IMAGE_SAMPLER,
            descriptor_count: DESCRIPTOR_POOL_CAPACITY,
        }];
        let pool_info = vk::DescriptorPoolCreateInfo::builder()
            .flags(vk::DescriptorPoolCreateFlags::FREE_DESCRIPTOR_SET)
            .max_sets(DESCRIPTOR_POOL_CAPACITY)
            .pool_sizes(&pool_sizes);
        let descriptor_pool = unsafe { device.create_descriptor_pool(&pool_info, None) }
            .map_err(|e| GfxError::api("create_descriptor_pool", e))?;
        Ok(Self {
            device: device.clone(),
            staging: StagingBuffer::new(device),
            descriptor_pool,
            set_layout,
        })
    }

    /// Create the image, bind device-local memory, create the view covering
    /// the whole mip chain and write the combined-image-sampler descriptor.
    pub fn create_texture(
        &mut self,
        ctx: &RenderContext,
        width: u32,
        height: u32,
        mip_chain: bool,
        sampler: vk::Sampler,
    ) -> GfxResult<Texture> {
        let mip_levels = mip_level_count(width, height, mip_chain);
        unsafe {
            let img_info = vk::ImageCreateInfo::builder()
                .image_type(vk::ImageType::TYPE_2D)
                .format(vk::Format::R8G8B8A8_UNORM)
                .extent(vk::Extent3D { width, height, depth: 1 })
                .mip_levels(mip_levels)
                .array_layers(1)
                .samples(vk::SampleCountFlags::TYPE_1)
                .tiling(vk::ImageTiling::OPTIMAL)
                .usage(vk::ImageUsageFlags::SAMPLED | vk::ImageUsageFlags::TRANSFER_DST)
                .sharing_mode(vk::SharingMode::EXCLUSIVE)
                .initial_layout(vk::ImageLayout::UNDEFINED);
            let image = self
                .device
                .create_image(&img_info, None)
                .map_err(|e| GfxError::api("create_image", e))?;
            let req = self.device.get_image_memory_requirements(image);
            let mem_type = ctx
                .find_memory_type(req.memory_type_bits, vk::MemoryPropertyFlags::DEVICE_LOCAL)
                .or_else(|_| ctx.find_memory_type(req.memory_type_bits, vk::MemoryPropertyFlags::empty()))?;
            let alloc = vk::MemoryAllocateInfo::builder()
                .allocation_size(req.size)
                .memory_type_index(mem_type);
            let memory = self
                .device
                .allocate_memory(&alloc, None)
                .map_err(|e| GfxError::api("allocate_memory", e))?;
            self.device
                .bind_image_memory(image, memory, 0)
                .map_err(|e| GfxError::api("bind_image_memory", e))?;

            let sub = vk::ImageSubresourceRange {
                aspect_mask: vk::ImageAspectFlags::COLOR,
                base_mip_level: 0,
                level_count: mip_levels,
                base_array_layer: 0,
                layer_count: 1,
            };
            let view_info = vk::ImageViewCreateInfo::builder()
                .image(image)
                .view_type(vk::ImageViewType::TYPE_2D)
                .format(vk::Format::R8G8B8A8_UNORM)
                .subresource_range(sub);
            let view = self
                .device
                .create_image_view(&view_info, None)
                .map_err(|e| GfxError::api("create_image_view", e))?;

            let layouts = [self.set_layout];
            let set_alloc = vk::DescriptorSetAllocateInfo::builder()
                .descriptor_pool(self.descriptor_pool)
                .set_layouts(&layouts);
            let descriptor_set = self
                .device
                .allocate_descriptor_sets(&set_alloc)
                .map_err(|e| GfxError::api("allocate_descriptor_sets", e))?[0];
            let image_info = [vk::DescriptorImageInfo {
                sampler,
                image_view: view,
                image_layout: vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL,
            }];
            let write = vk::WriteDescriptorSet::builder()
                .dst_set(descriptor_set)
                .dst_binding(0)
                .descriptor_type(vk::DescriptorType::COMBINED_IMAGE_SAMPLER)
                .image_info(&image_info)
                .build();
            self.device.update_descriptor_sets(&[write], &[]);

            Ok(Texture {
                width,
                height,
                mip_levels,
                mip_chain,
                image,
                memory,
                view,
                descriptor_set,
            })
        }
    }

    /// Copy `pixels` into the image, one region per mip level.
    ///
    /// The payload length must match the mip chain exactly. The image ends
    /// up in SHADER_READ_ONLY_OPTIMAL; the call returns once the queue is
    /// idle again.
    pub fn upload(
        &mut self,
        ctx: &RenderContext,
        image: vk::Image,
        width: u32,
        height: u32,
        mip_chain: bool,
        pixels: &[u8],
        bytes_per_pixel: u32,
    ) -> GfxResult<()> {
        let regions = mip_regions(width, height, mip_chain, bytes_per_pixel);
        let expected = payload_size(&regions);
        if pixels.len() as u64 != expected {
            return Err(GfxError::UploadSize { expected, got: pixels.len() as u64 });
        }
        self.staging.ensure_capacity(ctx, expected)?;
        self.staging.write(pixels);

        let sub = vk::ImageSubresourceRange {
            aspect_mask: vk::ImageAspectFlags::COLOR,
            base_mip_level: 0,
            level_count: regions.len() as u32,
            base_array_layer: 0,
            layer_count: 1,
        };
        let staging_buffer = self.staging.buffer;
        ctx.immediate_commands(|cmd| {
            unsafe {
                let device = ctx.device();
                // Host writes to the mapped staging memory must be visible
                // to the transfer stage.
                let host_barrier = vk::MemoryBarrier::builder()
                    .src_access_mask(vk::AccessFlags::HOST_WRITE)
                    .dst_access_mask(vk::AccessFlags::TRANSFER_READ)
                    .build();
                device.cmd_pipeline_barrier(
                    cmd,
                    vk::PipelineStageFlags::HOST,
                    vk::PipelineStageFlags::TRANSFER,
                    vk::DependencyFlags::empty(),
                    std::slice::from_ref(&host_barrier),
                    &[],
                    &[],
                );
                let to_transfer = vk::ImageMemoryBarrier::builder()
                    .old_layout(vk::ImageLayout::UNDEFINED)
                    .new_layout(vk::ImageLayout::TRANSFER_DST_OPTIMAL)
                    .src_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
                    .dst_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
                    .image(image)
                    .subresource_range(sub)
                    .src_access_mask(vk::AccessFlags::empty())
                    .dst_access_mask(vk::AccessFlags::TRANSFER_WRITE)
                    .build();
                device.cmd_pipeline_barrier(
                    cmd,
                    vk::PipelineStageFlags::TOP_OF_PIPE,
                    vk::PipelineStageFlags::TRANSFER,
                    vk::DependencyFlags::empty(),
                    &[],
                    &[],
                    std::slice::from_ref(&to_transfer),
                );
                let copies: Vec<vk::BufferImageCopy> = regions
                    .iter()
                    .map(|r| {
                        vk::BufferImageCopy::builder()
                            .buffer_offset(r.offset)
                            .image_subresource(vk::ImageSubresourceLayers {
                                aspect_mask: vk::ImageAspectFlags::COLOR,
                                mip_level: r.level,
                                base_array_layer: 0,
                                layer_count: 1,
                            })
                            .image_offset(vk::Offset3D { x: 0, y: 0, z: 0 })
                            .image_extent(vk::Extent3D { width: r.width, height: r.height, depth: 1 })
                            .build()
                    })
                    .collect();
                device.cmd_copy_buffer_to_image(
                    cmd,
                    staging_buffer,
                    image,
                    vk::ImageLayout::TRANSFER_DST_OPTIMAL,
                    &copies,
                );
                let to_shader = vk::ImageMemoryBarrier::builder()
                    .old_layout(vk::ImageLayout::TRANSFER_DST_OPTIMAL)
                    .new_layout(vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL)
                    .src_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
                    .dst_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
                    .image(image)
                    .subresource_range(sub)
                    .src_access_mask(vk::AccessFlags::TRANSFER_WRITE)
                    .dst_access_mask(vk::AccessFlags::SHADER_READ)
                    .build();
                device.cmd_pipeline_barrier(
                    cmd,
                    vk::PipelineStageFlags::TRANSFER,
                    vk::PipelineStageFlags::FRAGMENT_SHADER,
                    vk::DependencyFlags::empty(),
                    &[],
                    &[],
                    std::slice::from_ref(&to_shader),
                );
            }
            Ok(())
        })?;
        debug!("uploaded {width}x{height} mips={} bytes={expected}", regions.len());
        Ok(())
    }

    pub fn destroy_texture(&mut self, texture: Texture) {
        unsafe {
            let _ = self
                .device
                .free_descriptor_sets(self.descriptor_pool, &[texture.descriptor_set]);
            self.device.destroy_image_view(texture.view, None);
            self.device.destroy_image(texture.image, None);
            self.device.free_memory(texture.memory, None);
        }
    }
}

impl Drop for TextureUploader {
    fn drop(&mut self) {
        unsafe {
            self.device.destroy_descriptor_pool(self.descriptor_pool, None);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn square_chain_halves_to_one() {
        let regions = mip_regions(256, 256, true, 4);
        assert_eq!(regions.len(), 9);
        assert_eq!(regions[0].width, 256);
        assert_eq!(regions[8].width, 1);
        assert_eq!(regions[8].height, 1);
        for (i, r) in regions.iter().enumerate() {
            assert_eq!(r.level, i as u32);
        }
        // Offsets walk the payload without gaps.
        let mut expected_offset = 0u64;
        for r in &regions {
            assert_eq!(r.offset, expected_offset);
            assert_eq!(r.len, u64::from(r.width) * u64::from(r.height) * 4);
            expected_offset += r.len;
        }
        let total: u64 = regions.iter().map(|r| r.len).sum();
        assert_eq!(total, 349_524);
        assert_eq!(payload_size(&regions), total);
    }

    #[test]
    fn non_square_dimensions_clamp_at_one() {
        let regions = mip_regions(8, 2, true, 4);
        let dims: Vec<(u32, u32)> = regions.iter().map(|r| (r.width, r.height)).collect();
        assert_eq!(dims, vec![(8, 2), (4, 1), (2, 1), (1, 1)]);
        assert_eq!(payload_size(&regions), (16 + 4 + 2 + 1) * 4);
    }

    #[test]
    fn no_chain_gives_single_region() {
        let regions = mip_regions(64, 64, false, 4);
        assert_eq!(regions.len(), 1);
        assert_eq!(regions[0].len, 64 * 64 * 4);
        assert_eq!(mip_level_count(64, 64, false), 1);
        assert_eq!(mip_level_count(64, 64, true), 7);
    }

    #[test]
    fn payload_of_no_regions_is_zero() {
        assert_eq!(payload_size(&[]), 0);
    }
}
