//! Frame orchestration.
//!
//! One frame is: wait for the slot's previous fence, acquire a swapchain
//! image, rewrite the slot's uniform buffer, record the compute dispatch and
//! the blit to the surface, submit, present. CPU lead over the GPU is bounded
//! by the number of frame slots, which matches the swapchain image count.

pub mod buffers;
pub mod context_init;
pub mod descriptors;
pub mod layout;
pub mod pipelines;
pub mod types;

use std::sync::Arc;

use log::{error, info};
use vulkano::buffer::Subbuffer;
use vulkano::command_buffer::allocator::StandardCommandBufferAllocator;
use vulkano::command_buffer::{AutoCommandBufferBuilder, BlitImageInfo, CommandBufferUsage};
use vulkano::descriptor_set::allocator::StandardDescriptorSetAllocator;
use vulkano::descriptor_set::DescriptorSet;
use vulkano::device::{Device, Queue};
use vulkano::image::sampler::Filter;
use vulkano::image::view::ImageView;
use vulkano::image::Image;
use vulkano::memory::allocator::StandardMemoryAllocator;
use vulkano::pipeline::{ComputePipeline, PipelineBindPoint, PipelineLayout};
use vulkano::swapchain::{
    acquire_next_image, Swapchain, SwapchainCreateInfo, SwapchainPresentInfo,
};
use vulkano::sync::GpuFuture;
use vulkano::{sync, Validated, VulkanError};
use winit::dpi::PhysicalSize;
use winit::window::Window;

use buffers::{create_draw_image, SceneResources};
use layout::{ImageLayoutState, ImageLifecycle};
use pipelines::dispatch_groups;

pub use types::{RenderError, RenderParams, SYNC_WAIT_TIMEOUT, WORKGROUP_SIZE};

use types::FrameRing;

/// Everything one frame slot owns: the uniform buffer the CPU rewrites, the
/// descriptor set pointing at it, and the fence of the slot's last
/// submission.
struct FrameSlot {
    uniform: Subbuffer<RenderParams>,
    descriptor_set: Arc<DescriptorSet>,
    fence: Option<Box<dyn GpuFuture>>,
}

pub struct RenderContext {
    device: Arc<Device>,
    queue: Arc<Queue>,
    window: Arc<Window>,
    swapchain: Arc<Swapchain>,
    swapchain_images: Vec<Arc<Image>>,
    surface_lifecycles: Vec<ImageLifecycle>,
    memory_allocator: Arc<StandardMemoryAllocator>,
    command_buffer_allocator: Arc<StandardCommandBufferAllocator>,
    descriptor_set_allocator: Arc<StandardDescriptorSetAllocator>,
    scene: SceneResources,
    pipeline: Arc<ComputePipeline>,
    pipeline_layout: Arc<PipelineLayout>,
    draw_image: Arc<Image>,
    draw_view: Arc<ImageView>,
    draw_lifecycle: ImageLifecycle,
    slots: Vec<FrameSlot>,
    ring: FrameRing,
    recreate_swapchain: bool,
}

impl RenderContext {
    pub fn frames_rendered(&self) -> u64 {
        self.ring.frames_rendered()
    }

    pub fn window(&self) -> &Arc<Window> {
        &self.window
    }

    /// Marks the swapchain stale; the next [`draw`](Self::draw) rebuilds it
    /// before rendering.
    pub fn recreate_swapchain(&mut self) {
        self.recreate_swapchain = true;
    }

    /// Renders and presents one frame.
    pub fn draw(&mut self, params: RenderParams) -> Result<(), RenderError> {
        let window_size = self.window.inner_size();
        // A minimized window has a zero extent no swapchain can match.
        if window_size.width == 0 || window_size.height == 0 {
            return Ok(());
        }
        if self.recreate_swapchain {
            self.rebuild_surface_chain(window_size)?;
        }

        let (slot_idx, must_wait) = self.ring.begin();
        if must_wait {
            self.wait_slot(slot_idx, "frame slot fence")?;
        }

        let (image_index, suboptimal, acquire_future) =
            match acquire_next_image(self.swapchain.clone(), Some(SYNC_WAIT_TIMEOUT)) {
                Ok(result) => result,
                Err(Validated::Error(VulkanError::OutOfDate)) => {
                    self.recreate_swapchain = true;
                    return Ok(());
                }
                Err(Validated::Error(VulkanError::Timeout)) => {
                    return Err(RenderError::SyncTimeout("swapchain image acquire"))
                }
                Err(e) => return Err(e.into()),
            };
        if suboptimal {
            self.recreate_swapchain = true;
        }

        *self.slots[slot_idx].uniform.write()? = params;

        let command_buffer = self.record_frame(slot_idx, image_index)?;

        // The draw image is shared by every frame, and nothing else links
        // this submission to the last one: the slot fence only reaches back
        // N frames, and automatic barriers stop at the command buffer edge.
        // Wait for the frame just submitted so its blit has finished reading
        // the draw image before this frame's dispatch rewrites it.
        if let Some(prev_idx) = self.ring.previous_slot() {
            self.wait_slot(prev_idx, "previous frame fence")?;
        }

        let future = sync::now(self.device.clone())
            .join(acquire_future)
            .then_execute(self.queue.clone(), command_buffer)?
            .then_swapchain_present(
                self.queue.clone(),
                SwapchainPresentInfo::swapchain_image_index(self.swapchain.clone(), image_index),
            )
            .then_signal_fence_and_flush();
        match future {
            Ok(future) => {
                self.slots[slot_idx].fence = Some(future.boxed());
                self.ring.submit(slot_idx);
            }
            Err(Validated::Error(VulkanError::OutOfDate)) => {
                self.recreate_swapchain = true;
            }
            Err(e) => return Err(e.into()),
        }
        self.ring.advance();
        Ok(())
    }

    /// Records one frame's commands: ray-march into the draw image, blit it
    /// onto the acquired swapchain image, leave that image presentable.
    fn record_frame(
        &mut self,
        slot_idx: usize,
        image_index: u32,
    ) -> Result<Arc<vulkano::command_buffer::PrimaryAutoCommandBuffer>, RenderError> {
        let mut builder = AutoCommandBufferBuilder::primary(
            self.command_buffer_allocator.clone(),
            self.queue.queue_family_index(),
            CommandBufferUsage::OneTimeSubmit,
        )?;

        // The shader overwrites every pixel, so last frame's contents are
        // discarded rather than preserved across the transition.
        self.draw_lifecycle.reset();
        self.draw_lifecycle.transition(ImageLayoutState::General)?;
        self.scene
            .volume_lifecycle
            .expect(ImageLayoutState::General)?;

        let [w, h, _] = self.draw_image.extent();
        builder
            .bind_pipeline_compute(self.pipeline.clone())?
            .bind_descriptor_sets(
                PipelineBindPoint::Compute,
                self.pipeline_layout.clone(),
                0,
                self.slots[slot_idx].descriptor_set.clone(),
            )?;
        // Safety: the bound set covers every binding the shader declares and
        // the group count covers the full target.
        unsafe { builder.dispatch(dispatch_groups([w, h]))? };

        self.draw_lifecycle
            .transition(ImageLayoutState::TransferSrc)?;

        let surface = &mut self.surface_lifecycles[image_index as usize];
        // A freshly acquired swapchain image has undefined contents.
        surface.reset();
        surface.transition(ImageLayoutState::TransferDst)?;

        self.draw_lifecycle.expect(ImageLayoutState::TransferSrc)?;
        surface.expect(ImageLayoutState::TransferDst)?;
        builder.blit_image(BlitImageInfo {
            filter: Filter::Linear,
            ..BlitImageInfo::images(
                self.draw_image.clone(),
                self.swapchain_images[image_index as usize].clone(),
            )
        })?;

        surface.transition(ImageLayoutState::Present)?;

        Ok(builder.build()?)
    }

    /// Rebuilds the swapchain and everything sized to it: the draw image,
    /// the surface layout trackers and the per-slot descriptor sets. The
    /// slot count itself never changes.
    fn rebuild_surface_chain(&mut self, extent: PhysicalSize<u32>) -> Result<(), RenderError> {
        self.wait_idle()?;

        let (swapchain, images) = self.swapchain.recreate(SwapchainCreateInfo {
            image_extent: extent.into(),
            ..self.swapchain.create_info()
        })?;
        info!(
            "swapchain rebuilt at {}x{} ({} images)",
            extent.width,
            extent.height,
            images.len()
        );
        self.swapchain = swapchain;
        self.surface_lifecycles = images
            .iter()
            .map(|_| ImageLifecycle::new("swapchain image"))
            .collect();
        self.swapchain_images = images;

        let (draw_image, draw_view, draw_lifecycle) =
            create_draw_image(self.memory_allocator.clone(), extent.into())?;
        self.draw_image = draw_image;
        self.draw_view = draw_view;
        self.draw_lifecycle = draw_lifecycle;

        let (slots, _set_layout) = context_init::build_frame_slots(
            self.device.clone(),
            self.memory_allocator.clone(),
            self.descriptor_set_allocator.clone(),
            &self.scene,
            self.draw_view.clone(),
            self.slots.len(),
        )?;
        self.slots = slots;

        self.recreate_swapchain = false;
        Ok(())
    }

    /// Waits out the slot's stored fence, if any, with the bounded timeout,
    /// and marks the slot idle.
    fn wait_slot(&mut self, idx: usize, what: &'static str) -> Result<(), RenderError> {
        if let Some(prev) = self.slots[idx].fence.take() {
            let fence = prev.then_signal_fence_and_flush()?;
            match fence.wait(Some(SYNC_WAIT_TIMEOUT)) {
                Err(Validated::Error(VulkanError::Timeout)) => {
                    return Err(RenderError::SyncTimeout(what))
                }
                other => other?,
            }
        }
        self.ring.retire(idx);
        Ok(())
    }

    /// Drains every in-flight frame. Required before destroying anything the
    /// GPU may still read.
    fn wait_idle(&mut self) -> Result<(), RenderError> {
        for idx in 0..self.slots.len() {
            self.wait_slot(idx, "teardown fence")?;
        }
        Ok(())
    }
}

impl Drop for RenderContext {
    fn drop(&mut self) {
        if let Err(e) = self.wait_idle() {
            error!("in-flight frames did not drain during teardown: {e}");
        }
        // Everything else is released by Arc drops once the queue is empty.
        if let Err(e) = unsafe { self.device.wait_idle() } {
            error!("device did not go idle during teardown: {e}");
        }
    }
}
