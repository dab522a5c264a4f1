//! Instance, device and queue bring-up.
//!
//! `RenderContext` owns everything that outlives swapchain rebuilds: the
//! Vulkan instance, surface, logical device, the graphics/present queue and
//! the two command pools (one for frame recording, one transient pool for
//! one-shot uploads). Every other component receives a `&RenderContext` at
//! construction time.

use std::ffi::{CStr, CString};

use ash::{vk, Entry, Instance};
use log::{debug, info};
use raw_window_handle::{RawDisplayHandle, RawWindowHandle};

use crate::config::RendererConfig;
use crate::error::{GfxError, GfxResult};

pub struct RenderContext {
    _entry: Entry,
    instance: Instance,
    surface_loader: ash::extensions::khr::Surface,
    surface: vk::SurfaceKHR,
    phys: vk::PhysicalDevice,
    device: ash::Device,
    queue: vk::Queue,
    queue_family_index: u32,
    memory_props: vk::PhysicalDeviceMemoryProperties,
    command_pool: vk::CommandPool,
    transient_pool: vk::CommandPool,
    swapchain_loader: ash::extensions::khr::Swapchain,
}

impl RenderContext {
    pub fn new(
        display_handle: RawDisplayHandle,
        window_handle: RawWindowHandle,
        cfg: &RendererConfig,
    ) -> GfxResult<Self> {
        unsafe {
            // Entry + instance
            let entry = Entry::linked();
            let app_name = CString::new(cfg.app).unwrap_or_default();
            let app_info = vk::ApplicationInfo::builder()
                .application_name(&app_name)
                .application_version(vk::make_api_version(0, 0, 1, 0))
                .engine_name(&app_name)
                .engine_version(vk::make_api_version(0, 0, 1, 0))
                .api_version(vk::API_VERSION_1_2);

            let ext_names = ash_window::enumerate_required_extensions(display_handle)
                .map_err(|e| GfxError::api("enumerate_required_extensions", e))?
                .to_vec();
            let create_info = vk::InstanceCreateInfo::builder()
                .application_info(&app_info)
                .enabled_extension_names(&ext_names);
            let instance = entry
                .create_instance(&create_info, None)
                .map_err(|e| GfxError::api("create_instance", e))?;

            // Surface
            let surface = ash_window::create_surface(&entry, &instance, display_handle, window_handle, None)
                .map_err(|e| GfxError::api("create_surface", e))?;
            let surface_loader = ash::extensions::khr::Surface::new(&entry, &instance);

            // Physical device + queue family with graphics and present
            let phys_devices = instance
                .enumerate_physical_devices()
                .map_err(|e| GfxError::api("enumerate_physical_devices", e))?;
            let candidates: Vec<vk::PhysicalDevice> = match cfg.adapter_index {
                Some(idx) if idx < phys_devices.len() => vec![phys_devices[idx]],
                _ => phys_devices.clone(),
            };
            let (phys, queue_family_index) = {
                let mut chosen: Option<(vk::PhysicalDevice, u32)> = None;
                'outer: for &pd in &candidates {
                    let qfams = instance.get_physical_device_queue_family_properties(pd);
                    for (i, qf) in qfams.iter().enumerate() {
                        let i_u32 = i as u32;
                        let supports_graphics = qf.queue_flags.contains(vk::QueueFlags::GRAPHICS);
                        let present_ok = surface_loader
                            .get_physical_device_surface_support(pd, i_u32, surface)
                            .unwrap_or(false);
                        if supports_graphics && present_ok {
                            chosen = Some((pd, i_u32));
                            break 'outer;
                        }
                    }
                }
                chosen.ok_or_else(|| {
                    GfxError::NoDevice("no queue family with graphics and present support".into())
                })?
            };

            let props = instance.get_physical_device_properties(phys);
            let adapter_name = CStr::from_ptr(props.device_name.as_ptr()).to_string_lossy();
            let device_type_name = match props.device_type {
                vk::PhysicalDeviceType::INTEGRATED_GPU => "IntegratedGPU",
                vk::PhysicalDeviceType::DISCRETE_GPU => "DiscreteGPU",
                vk::PhysicalDeviceType::VIRTUAL_GPU => "VirtualGPU",
                vk::PhysicalDeviceType::CPU => "CPU",
                _ => "Other",
            };
            info!("adapter='{}' type={} queue_family={}", adapter_name, device_type_name, queue_family_index);

            // Logical device + queue (+ swapchain extension). Line-fill mode
            // (wireframe pipelines) and clip distances (portal clip planes)
            // are requested when available.
            let supported = instance.get_physical_device_features(phys);
            let mut features = vk::PhysicalDeviceFeatures::default();
            if supported.fill_mode_non_solid == vk::TRUE {
                features.fill_mode_non_solid = vk::TRUE;
            }
            if supported.shader_clip_distance == vk::TRUE {
                features.shader_clip_distance = vk::TRUE;
            }
            let priorities = [1.0f32];
            let qci = [vk::DeviceQueueCreateInfo::builder()
                .queue_family_index(queue_family_index)
                .queue_priorities(&priorities)
                .build()];
            let device_exts = [ash::extensions::khr::Swapchain::name().as_ptr()];
            let device_info = vk::DeviceCreateInfo::builder()
                .queue_create_infos(&qci)
                .enabled_extension_names(&device_exts)
                .enabled_features(&features);
            let device = instance
                .create_device(phys, &device_info, None)
                .map_err(|e| GfxError::api("create_device", e))?;
            let queue = device.get_device_queue(queue_family_index, 0);
            let memory_props = instance.get_physical_device_memory_properties(phys);
            debug!("memory types: {}", memory_props.memory_type_count);

            // Command pools: frame recording resets its buffer every frame,
            // one-shot recording goes through a transient pool.
            let pool_info = vk::CommandPoolCreateInfo::builder()
                .queue_family_index(queue_family_index)
                .flags(vk::CommandPoolCreateFlags::RESET_COMMAND_BUFFER);
            let command_pool = device
                .create_command_pool(&pool_info, None)
                .map_err(|e| GfxError::api("create_command_pool", e))?;
            let transient_info = vk::CommandPoolCreateInfo::builder()
                .queue_family_index(queue_family_index)
                .flags(vk::CommandPoolCreateFlags::TRANSIENT);
            let transient_pool = device
                .create_command_pool(&transient_info, None)
                .map_err(|e| GfxError::api("create_command_pool", e))?;

            let swapchain_loader = ash::extensions::khr::Swapchain::new(&instance, &device);

            Ok(Self {
                _entry: entry,
                instance,
                surface_loader,
                surface,
                phys,
                device,
                queue,
                queue_family_index,
                memory_props,
                command_pool,
                transient_pool,
                swapchain_loader,
            })
        }
    }

    /// Find a memory type matching the resource's type bits and the
    /// requested property flags.
    pub fn find_memory_type(
        &self,
        type_bits: u32,
        flags: vk::MemoryPropertyFlags,
    ) -> GfxResult<u32> {
        for i in 0..self.memory_props.memory_type_count {
            if (type_bits & (1 << i)) != 0
                && self.memory_props.memory_types[i as usize]
                    .property_flags
                    .contains(flags)
            {
                return Ok(i);
            }
        }
        Err(GfxError::NoMemoryType { type_bits, flags })
    }

    /// Record a command buffer, submit it and block until the queue is idle.
    ///
    /// The buffer is allocated from the transient pool and freed afterwards,
    /// including on error.
    pub fn immediate_commands<R>(
        &self,
        record: impl FnOnce(vk::CommandBuffer) -> GfxResult<R>,
    ) -> GfxResult<R> {
        unsafe {
            let alloc = vk::CommandBufferAllocateInfo::builder()
                .command_pool(self.transient_pool)
                .level(vk::CommandBufferLevel::PRIMARY)
                .command_buffer_count(1);
            let cmd = self
                .device
                .allocate_command_buffers(&alloc)
                .map_err(|e| GfxError::api("allocate_command_buffers", e))?[0];
            let result = self.record_and_submit(cmd, record);
            self.device.free_command_buffers(self.transient_pool, &[cmd]);
            result
        }
    }

    unsafe fn record_and_submit<R>(
        &self,
        cmd: vk::CommandBuffer,
        record: impl FnOnce(vk::CommandBuffer) -> GfxResult<R>,
    ) -> GfxResult<R> {
        let begin = vk::CommandBufferBeginInfo::builder()
            .flags(vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT);
        self.device
            .begin_command_buffer(cmd, &begin)
            .map_err(|e| GfxError::api("begin_command_buffer", e))?;
        let out = record(cmd)?;
        self.device
            .end_command_buffer(cmd)
            .map_err(|e| GfxError::api("end_command_buffer", e))?;
        let submit = vk::SubmitInfo::builder()
            .command_buffers(std::slice::from_ref(&cmd))
            .build();
        self.device
            .queue_submit(self.queue, std::slice::from_ref(&submit), vk::Fence::null())
            .map_err(|e| GfxError::api("queue_submit", e))?;
        self.device
            .queue_wait_idle(self.queue)
            .map_err(|e| GfxError::api("queue_wait_idle", e))?;
        Ok(out)
    }

    pub fn wait_idle(&self) {
        unsafe {
            let _ = self.device.device_wait_idle();
        }
    }

    pub fn device(&self) -> &ash::Device {
        &self.device
    }

    pub fn queue(&self) -> vk::Queue {
        self.queue
    }

    pub fn queue_family_index(&self) -> u32 {
        self.queue_family_index
    }

    pub(crate) fn instance(&self) -> &Instance {
        &self.instance
    }

    pub(crate) fn phys(&self) -> vk::PhysicalDevice {
        self.phys
    }

    pub(crate) fn surface(&self) -> vk::SurfaceKHR {
        self.surface
    }

    pub(crate) fn surface_loader(&self) -> &ash::extensions::khr::Surface {
        &self.surface_loader
    }

    pub(crate) fn swapchain_loader(&self) -> &ash::extensions::khr::Swapchain {
        &self.swapchain_loader
    }

    pub(crate) fn command_pool(&self) -> vk::CommandPool {
        self.command_pool
    }
}

impl Drop for RenderContext {
    fn drop(&mut self) {
        unsafe {
            let _ = self.device.device_wait_idle();
            self.device.destroy_command_pool(self.transient_pool, None);
            self.device.destroy_command_pool(self.command_pool, None);
            self.device.destroy_device(None);
            self.surface_loader.destroy_surface(self.surface, None);
            self.instance.destroy_instance(None);
        }
    }
}
