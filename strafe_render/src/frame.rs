//! Per-frame command recording, synchronization and presentation.
//!
//! One frame is in flight at a time. The cycle is Idle, Acquiring,
//! Recording, Submitted, Presenting and back to Idle; calls made in the
//! wrong phase fail with [`GfxError::FramePhase`] instead of corrupting the
//! command stream. Out-of-date surfaces are reported as a rebuild request,
//! never as a hard error.

use std::time::{Duration, Instant};

use ash::vk;
use log::warn;

use crate::context::RenderContext;
use crate::error::{GfxError, GfxResult};
use crate::geometry::GeometryStreams;
use crate::swapchain::SwapchainBundle;

/// Where the frame cycle currently stands.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum FramePhase {
    Idle,
    Acquiring,
    Recording,
    Submitted,
    Presenting,
    Shutdown,
}

pub(crate) struct PhaseTracker {
    phase: FramePhase,
}

impl PhaseTracker {
    pub(crate) fn new() -> Self {
        Self { phase: FramePhase::Idle }
    }

    pub(crate) fn phase(&self) -> FramePhase {
        self.phase
    }

    pub(crate) fn advance(
        &mut self,
        action: &'static str,
        from: FramePhase,
        to: FramePhase,
    ) -> GfxResult<()> {
        if self.phase != from {
            return Err(GfxError::FramePhase { action, phase: self.phase });
        }
        self.phase = to;
        Ok(())
    }

    pub(crate) fn require(&self, action: &'static str, phase: FramePhase) -> GfxResult<()> {
        if self.phase != phase {
            return Err(GfxError::FramePhase { action, phase: self.phase });
        }
        Ok(())
    }

    pub(crate) fn reset(&mut self) {
        self.phase = FramePhase::Idle;
    }

    pub(crate) fn shutdown(&mut self) {
        self.phase = FramePhase::Shutdown;
    }
}

/// Outcome of starting a frame.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum BeginOutcome {
    /// The frame is recording; draw and present as usual.
    Ready,
    /// The surface changed underneath us; rebuild before trying again.
    RebuildNeeded,
}

/// Outcome of presenting a frame.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum PresentOutcome {
    Presented,
    /// Presented or discarded, but the swapchain no longer matches the
    /// surface and should be rebuilt before the next frame.
    RebuildNeeded,
}

enum AcquireDisposition {
    Acquired(u32),
    Rebuild,
}

fn acquire_disposition(result: Result<(u32, bool), vk::Result>) -> GfxResult<AcquireDisposition> {
    match result {
        // A suboptimal acquire still renders; present will flag the rebuild.
        Ok((index, _suboptimal)) => Ok(AcquireDisposition::Acquired(index)),
        Err(vk::Result::ERROR_OUT_OF_DATE_KHR) => Ok(AcquireDisposition::Rebuild),
        Err(e) => Err(GfxError::api("acquire_next_image", e)),
    }
}

fn present_disposition(result: Result<bool, vk::Result>) -> GfxResult<PresentOutcome> {
    match result {
        Ok(false) => Ok(PresentOutcome::Presented),
        Ok(true) | Err(vk::Result::ERROR_OUT_OF_DATE_KHR) => Ok(PresentOutcome::RebuildNeeded),
        Err(e) => Err(GfxError::api("queue_present", e)),
    }
}

fn fence_disposition(result: Result<(), vk::Result>, waited: Duration) -> GfxResult<()> {
    match result {
        Ok(()) => Ok(()),
        // The previous frame never finished; treat the device as gone.
        Err(vk::Result::TIMEOUT) => Err(GfxError::DeviceLost { waited_ms: waited.as_millis() as u64 }),
        Err(e) => Err(GfxError::api("wait_for_fences", e)),
    }
}

/// Rects for a mid-pass color clear. The area is split into two stacked
/// halves; some drivers reject a single full-frame rect here.
fn split_clear_rects(extent: vk::Extent2D) -> Vec<vk::ClearRect> {
    let half = extent.height / 2;
    let rect = |y: i32, height: u32| vk::ClearRect {
        rect: vk::Rect2D {
            offset: vk::Offset2D { x: 0, y },
            extent: vk::Extent2D { width: extent.width, height },
        },
        base_array_layer: 0,
        layer_count: 1,
    };
    if half == 0 {
        vec![rect(0, extent.height)]
    } else {
        vec![rect(0, half), rect(half as i32, extent.height - half)]
    }
}

struct FrameSync {
    device: ash::Device,
    image_acquired: vk::Semaphore,
    render_finished: vk::Semaphore,
    in_flight: vk::Fence,
}

impl FrameSync {
    fn new(device: &ash::Device) -> GfxResult<Self> {
        unsafe {
            let sem_info = vk::SemaphoreCreateInfo::default();
            let image_acquired = device
                .create_semaphore(&sem_info, None)
                .map_err(|e| GfxError::api("create_semaphore", e))?;
            let render_finished = device
                .create_semaphore(&sem_info, None)
                .map_err(|e| GfxError::api("create_semaphore", e))?;
            // Signaled so the first frame's wait passes immediately.
            let fence_info = vk::FenceCreateInfo::builder().flags(vk::FenceCreateFlags::SIGNALED);
            let in_flight = device
                .create_fence(&fence_info, None)
                .map_err(|e| GfxError::api("create_fence", e))?;
            Ok(Self { device: device.clone(), image_acquired, render_finished, in_flight })
        }
    }
}

impl Drop for FrameSync {
    fn drop(&mut self) {
        unsafe {
            self.device.destroy_semaphore(self.image_acquired, None);
            self.device.destroy_semaphore(self.render_finished, None);
            self.device.destroy_fence(self.in_flight, None);
        }
    }
}

pub(crate) struct FrameCycle {
    device: ash::Device,
    queue: vk::Queue,
    command_pool: vk::CommandPool,
    command_buffer: vk::CommandBuffer,
    sync: FrameSync,
    fence_timeout: Duration,
    tracker: PhaseTracker,
    image_index: u32,
}

impl FrameCycle {
    pub(crate) fn new(ctx: &RenderContext, fence_timeout: Duration) -> GfxResult<Self> {
        let device = ctx.device();
        let alloc = vk::CommandBufferAllocateInfo::builder()
            .command_pool(ctx.command_pool())
            .level(vk::CommandBufferLevel::PRIMARY)
            .command_buffer_count(1);
        let command_buffer = unsafe { device.allocate_command_buffers(&alloc) }
            .map_err(|e| GfxError::api("allocate_command_buffers", e))?[0];
        Ok(Self {
            device: device.clone(),
            queue: ctx.queue(),
            command_pool: ctx.command_pool(),
            command_buffer,
            sync: FrameSync::new(device)?,
            fence_timeout,
            tracker: PhaseTracker::new(),
            image_index: 0,
        })
    }

    pub(crate) fn phase(&self) -> FramePhase {
        self.tracker.phase()
    }

    pub(crate) fn command_buffer(&self) -> vk::CommandBuffer {
        self.command_buffer
    }

    pub(crate) fn require_recording(&self, action: &'static str) -> GfxResult<()> {
        self.tracker.require(action, FramePhase::Recording)
    }

    pub(crate) fn require_idle(&self, action: &'static str) -> GfxResult<()> {
        self.tracker.require(action, FramePhase::Idle)
    }

    pub(crate) fn mark_shutdown(&mut self) {
        self.tracker.shutdown();
    }

    /// Acquire the next image, sync with the previous frame and open the
    /// render pass. Stream cursors rewind here.
    pub(crate) fn begin_frame(
        &mut self,
        ctx: &RenderContext,
        targets: &SwapchainBundle,
        geometry: &mut GeometryStreams,
    ) -> GfxResult<BeginOutcome> {
        self.tracker.advance("begin_frame", FramePhase::Idle, FramePhase::Acquiring)?;
        let acquired = unsafe {
            ctx.swapchain_loader().acquire_next_image(
                targets.swapchain(),
                u64::MAX,
                self.sync.image_acquired,
                vk::Fence::null(),
            )
        };
        match acquire_disposition(acquired)? {
            AcquireDisposition::Acquired(index) => self.image_index = index,
            AcquireDisposition::Rebuild => {
                self.tracker.reset();
                warn!("surface out of date at acquire, rebuild requested");
                return Ok(BeginOutcome::RebuildNeeded);
            }
        }

        let start = Instant::now();
        let waited = unsafe {
            self.device.wait_for_fences(
                &[self.sync.in_flight],
                true,
                self.fence_timeout.as_nanos() as u64,
            )
        };
        fence_disposition(waited, start.elapsed())?;
        unsafe { self.device.reset_fences(&[self.sync.in_flight]) }
            .map_err(|e| GfxError::api("reset_fences", e))?;

        self.tracker.advance("begin_frame", FramePhase::Acquiring, FramePhase::Recording)?;
        geometry.reset();

        unsafe {
            let begin = vk::CommandBufferBeginInfo::builder()
                .flags(vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT);
            self.device
                .begin_command_buffer(self.command_buffer, &begin)
                .map_err(|e| GfxError::api("begin_command_buffer", e))?;

            // This frame's geometry writes happen after recording but before
            // submission; make them visible to vertex input.
            let stream_barriers = [
                vk::BufferMemoryBarrier::builder()
                    .src_access_mask(vk::AccessFlags::HOST_WRITE)
                    .dst_access_mask(vk::AccessFlags::VERTEX_ATTRIBUTE_READ)
                    .src_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
                    .dst_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
                    .buffer(geometry.vertex_buffer())
                    .offset(0)
                    .size(vk::WHOLE_SIZE)
                    .build(),
                vk::BufferMemoryBarrier::builder()
                    .src_access_mask(vk::AccessFlags::HOST_WRITE)
                    .dst_access_mask(vk::AccessFlags::INDEX_READ)
                    .src_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
                    .dst_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
                    .buffer(geometry.index_buffer())
                    .offset(0)
                    .size(vk::WHOLE_SIZE)
                    .build(),
            ];
            self.device.cmd_pipeline_barrier(
                self.command_buffer,
                vk::PipelineStageFlags::HOST,
                vk::PipelineStageFlags::VERTEX_INPUT,
                vk::DependencyFlags::empty(),
                &[],
                &stream_barriers,
                &[],
            );

            let clears = [
                vk::ClearValue::default(),
                vk::ClearValue {
                    depth_stencil: vk::ClearDepthStencilValue { depth: 1.0, stencil: 0 },
                },
            ];
            let extent = targets.extent();
            let pass = vk::RenderPassBeginInfo::builder()
                .render_pass(targets.render_pass())
                .framebuffer(targets.framebuffer(self.image_index))
                .render_area(vk::Rect2D { offset: vk::Offset2D { x: 0, y: 0 }, extent })
                .clear_values(&clears);
            self.device
                .cmd_begin_render_pass(self.command_buffer, &pass, vk::SubpassContents::INLINE);

            let viewport = vk::Viewport {
                x: 0.0,
                y: 0.0,
                width: extent.width as f32,
                height: extent.height as f32,
                min_depth: 0.0,
                max_depth: 1.0,
            };
            self.device.cmd_set_viewport(self.command_buffer, 0, &[viewport]);
            let scissor = vk::Rect2D { offset: vk::Offset2D { x: 0, y: 0 }, extent };
            self.device.cmd_set_scissor(self.command_buffer, 0, &[scissor]);
        }
        Ok(BeginOutcome::Ready)
    }

    /// Clear the color attachment inside the open render pass.
    pub(crate) fn clear_color(&self, targets: &SwapchainBundle, color: [f32; 4]) -> GfxResult<()> {
        self.require_recording("clear_color")?;
        let attachment = vk::ClearAttachment {
            aspect_mask: vk::ImageAspectFlags::COLOR,
            color_attachment: 0,
            clear_value: vk::ClearValue { color: vk::ClearColorValue { float32: color } },
        };
        let rects = split_clear_rects(targets.extent());
        unsafe {
            self.device
                .cmd_clear_attachments(self.command_buffer, &[attachment], &rects);
        }
        Ok(())
    }

    /// Close the pass, submit and present.
    pub(crate) fn end_frame(
        &mut self,
        ctx: &RenderContext,
        targets: &SwapchainBundle,
    ) -> GfxResult<PresentOutcome> {
        self.tracker.advance("end_frame", FramePhase::Recording, FramePhase::Submitted)?;
        unsafe {
            self.device.cmd_end_render_pass(self.command_buffer);
            self.device
                .end_command_buffer(self.command_buffer)
                .map_err(|e| GfxError::api("end_command_buffer", e))?;

            let wait_stages = [vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT];
            let submit = vk::SubmitInfo::builder()
                .wait_semaphores(std::slice::from_ref(&self.sync.image_acquired))
                .wait_dst_stage_mask(&wait_stages)
                .command_buffers(std::slice::from_ref(&self.command_buffer))
                .signal_semaphores(std::slice::from_ref(&self.sync.render_finished))
                .build();
            self.device
                .queue_submit(self.queue, &[submit], self.sync.in_flight)
                .map_err(|e| GfxError::api("queue_submit", e))?;
        }
        self.tracker.advance("end_frame", FramePhase::Submitted, FramePhase::Presenting)?;

        let swapchains = [targets.swapchain()];
        let indices = [self.image_index];
        let present = vk::PresentInfoKHR::builder()
            .wait_semaphores(std::slice::from_ref(&self.sync.render_finished))
            .swapchains(&swapchains)
            .image_indices(&indices);
        let presented = unsafe { ctx.swapchain_loader().queue_present(self.queue, &present) };
        let outcome = present_disposition(presented)?;
        if outcome == PresentOutcome::RebuildNeeded {
            warn!("swapchain stale at present, rebuild requested");
        }
        self.tracker.advance("end_frame", FramePhase::Presenting, FramePhase::Idle)?;
        Ok(outcome)
    }
}

impl Drop for FrameCycle {
    fn drop(&mut self) {
        unsafe {
            self.device
                .free_command_buffers(self.command_pool, &[self.command_buffer]);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cycle_walks_every_phase() {
        let mut t = PhaseTracker::new();
        assert_eq!(t.phase(), FramePhase::Idle);
        t.advance("begin", FramePhase::Idle, FramePhase::Acquiring).unwrap();
        t.advance("begin", FramePhase::Acquiring, FramePhase::Recording).unwrap();
        t.require("draw", FramePhase::Recording).unwrap();
        t.advance("end", FramePhase::Recording, FramePhase::Submitted).unwrap();
        t.advance("end", FramePhase::Submitted, FramePhase::Presenting).unwrap();
        t.advance("end", FramePhase::Presenting, FramePhase::Idle).unwrap();
        assert_eq!(t.phase(), FramePhase::Idle);
    }

    #[test]
    fn out_of_order_calls_name_action_and_phase() {
        let mut t = PhaseTracker::new();
        let err = t
            .advance("end_frame", FramePhase::Recording, FramePhase::Submitted)
            .unwrap_err();
        match err {
            GfxError::FramePhase { action, phase } => {
                assert_eq!(action, "end_frame");
                assert_eq!(phase, FramePhase::Idle);
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn shutdown_blocks_further_frames() {
        let mut t = PhaseTracker::new();
        t.shutdown();
        assert!(t.advance("begin_frame", FramePhase::Idle, FramePhase::Acquiring).is_err());
        assert!(t.require("draw", FramePhase::Recording).is_err());
    }

    #[test]
    fn acquire_out_of_date_requests_rebuild() {
        assert!(matches!(
            acquire_disposition(Ok((3, false))),
            Ok(AcquireDisposition::Acquired(3))
        ));
        assert!(matches!(
            acquire_disposition(Ok((0, true))),
            Ok(AcquireDisposition::Acquired(0))
        ));
        assert!(matches!(
            acquire_disposition(Err(vk::Result::ERROR_OUT_OF_DATE_KHR)),
            Ok(AcquireDisposition::Rebuild)
        ));
        assert!(matches!(
            acquire_disposition(Err(vk::Result::ERROR_DEVICE_LOST)),
            Err(GfxError::Api { op: "acquire_next_image", .. })
        ));
    }

    #[test]
    fn present_suboptimal_requests_rebuild() {
        assert!(matches!(present_disposition(Ok(false)), Ok(PresentOutcome::Presented)));
        assert!(matches!(present_disposition(Ok(true)), Ok(PresentOutcome::RebuildNeeded)));
        assert!(matches!(
            present_disposition(Err(vk::Result::ERROR_OUT_OF_DATE_KHR)),
            Ok(PresentOutcome::RebuildNeeded)
        ));
        assert!(matches!(
            present_disposition(Err(vk::Result::ERROR_SURFACE_LOST_KHR)),
            Err(GfxError::Api { op: "queue_present", .. })
        ));
    }

    #[test]
    fn fence_timeout_is_device_lost() {
        assert!(fence_disposition(Ok(()), Duration::from_millis(1)).is_ok());
        let err = fence_disposition(Err(vk::Result::TIMEOUT), Duration::from_millis(1024)).unwrap_err();
        match err {
            GfxError::DeviceLost { waited_ms } => assert_eq!(waited_ms, 1024),
            other => panic!("unexpected error: {other:?}"),
        }
        assert!(matches!(
            fence_disposition(Err(vk::Result::ERROR_DEVICE_LOST), Duration::ZERO),
            Err(GfxError::Api { op: "wait_for_fences", .. })
        ));
    }

    #[test]
    fn clear_rects_tile_the_full_height() {
        let rects = split_clear_rects(vk::Extent2D { width: 640, height: 481 });
        assert_eq!(rects.len(), 2);
        assert_eq!(rects[0].rect.extent.height, 240);
        assert_eq!(rects[1].rect.offset.y, 240);
        assert_eq!(rects[1].rect.extent.height, 241);
        let covered: u32 = rects.iter().map(|r| r.rect.extent.height).sum();
        assert_eq!(covered, 481);

        let single = split_clear_rects(vk::Extent2D { width: 640, height: 1 });
        assert_eq!(single.len(), 1);
        assert_eq!(single[0].rect.extent.height, 1);
    }
}
