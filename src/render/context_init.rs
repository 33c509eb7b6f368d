//! [`RenderContext`] construction: surface, swapchain, allocators, scene
//! upload, descriptor layout and the compute pipeline.

use std::path::Path;
use std::sync::Arc;

use log::info;
use vulkano::command_buffer::allocator::StandardCommandBufferAllocator;
use vulkano::descriptor_set::allocator::StandardDescriptorSetAllocator;
use vulkano::descriptor_set::layout::DescriptorSetLayout;
use vulkano::device::{Device, Queue};
use vulkano::format::Format;
use vulkano::image::ImageUsage;
use vulkano::instance::Instance;
use vulkano::memory::allocator::StandardMemoryAllocator;
use vulkano::memory::MemoryPropertyFlags;
use vulkano::swapchain::{Surface, Swapchain, SwapchainCreateInfo};
use winit::window::Window;

use crate::vox::{MaterialPalette, VoxelVolume};

use super::buffers::{create_draw_image, create_uniform_buffer, select_memory_type, SceneResources};
use super::descriptors::{BindingDesc, BindingKind, DescriptorBinder};
use super::layout::ImageLifecycle;
use super::pipelines::create_raymarch_pipeline;
use super::types::{FrameRing, RenderError};
use super::{FrameSlot, RenderContext};

// Single descriptor set the ray-march shader sees.
const BINDING_DRAW_IMAGE: u32 = 0;
const BINDING_PARAMS: u32 = 1;
const BINDING_VOLUME: u32 = 2;
const BINDING_PALETTE: u32 = 3;

const BINDINGS: [BindingDesc; 4] = [
    BindingDesc {
        binding: BINDING_DRAW_IMAGE,
        kind: BindingKind::StorageImage,
    },
    BindingDesc {
        binding: BINDING_PARAMS,
        kind: BindingKind::UniformBuffer,
    },
    BindingDesc {
        binding: BINDING_VOLUME,
        kind: BindingKind::StorageImage,
    },
    BindingDesc {
        binding: BINDING_PALETTE,
        kind: BindingKind::StorageBuffer,
    },
];

impl RenderContext {
    pub fn new(
        device: Arc<Device>,
        queue: Arc<Queue>,
        instance: Arc<Instance>,
        window: Arc<Window>,
        volume: &VoxelVolume,
        palette: &MaterialPalette,
        shader_path: &Path,
    ) -> Result<RenderContext, RenderError> {
        // The allocators must stay reachable whenever any in-flight frame may
        // still use memory they handed out, so they live on the context.
        let memory_allocator = Arc::new(StandardMemoryAllocator::new_default(device.clone()));
        let command_buffer_allocator = Arc::new(StandardCommandBufferAllocator::new(
            device.clone(),
            Default::default(),
        ));
        let descriptor_set_allocator = Arc::new(StandardDescriptorSetAllocator::new(
            device.clone(),
            Default::default(),
        ));

        // Fail at startup, not mid-upload, if the device cannot back the
        // allocation patterns every frame depends on.
        let memory_types: Vec<MemoryPropertyFlags> = device
            .physical_device()
            .memory_properties()
            .memory_types
            .iter()
            .map(|t| t.property_flags)
            .collect();
        let full_mask = u32::MAX >> (32 - memory_types.len() as u32);
        select_memory_type(&memory_types, full_mask, MemoryPropertyFlags::DEVICE_LOCAL)?;
        select_memory_type(
            &memory_types,
            full_mask,
            MemoryPropertyFlags::HOST_VISIBLE | MemoryPropertyFlags::HOST_COHERENT,
        )?;

        let surface = Surface::from_window(instance, window.clone())
            .map_err(|e| RenderError::WindowHandle(Box::new(e)))?;
        let window_size = window.inner_size();

        let surface_capabilities = device
            .physical_device()
            .surface_capabilities(&surface, Default::default())?;
        let surface_formats = device
            .physical_device()
            .surface_formats(&surface, Default::default())?;

        let preferred_swapchain_formats = [
            Format::B8G8R8A8_SRGB,
            Format::B8G8R8A8_UNORM,
            Format::R8G8B8A8_SRGB,
            Format::R8G8B8A8_UNORM,
        ];
        let (image_format, image_color_space) = preferred_swapchain_formats
            .iter()
            .find_map(|preferred| {
                surface_formats
                    .iter()
                    .copied()
                    .find(|(fmt, _)| fmt == preferred)
            })
            .or_else(|| {
                surface_formats
                    .iter()
                    .copied()
                    .find(|(fmt, _)| fmt.block_size() == 4)
            })
            .unwrap_or(surface_formats[0]);

        let (swapchain, swapchain_images) = Swapchain::new(
            device.clone(),
            surface,
            SwapchainCreateInfo {
                // Some drivers report a `min_image_count` of 1, but fullscreen
                // mode requires at least 2.
                min_image_count: surface_capabilities.min_image_count.max(2),
                image_format,
                image_color_space,
                image_extent: window_size.into(),
                // Frames arrive by blit, never through a render pass.
                image_usage: ImageUsage::TRANSFER_DST,
                composite_alpha: surface_capabilities
                    .supported_composite_alpha
                    .into_iter()
                    .next()
                    .ok_or(RenderError::NoSuitableDevice)?,
                ..Default::default()
            },
        )?;
        info!(
            "swapchain: {image_format:?}, {} images, {}x{}",
            swapchain_images.len(),
            window_size.width,
            window_size.height
        );

        let scene = SceneResources::upload(
            memory_allocator.clone(),
            command_buffer_allocator.clone(),
            queue.clone(),
            volume,
            palette,
        )?;

        let (draw_image, draw_view, draw_lifecycle) =
            create_draw_image(memory_allocator.clone(), window_size.into())?;

        let slot_count = swapchain_images.len();
        let (slots, set_layout) = build_frame_slots(
            device.clone(),
            memory_allocator.clone(),
            descriptor_set_allocator.clone(),
            &scene,
            draw_view.clone(),
            slot_count,
        )?;

        let (pipeline, pipeline_layout) =
            create_raymarch_pipeline(device.clone(), shader_path, set_layout)?;

        let surface_lifecycles = swapchain_images
            .iter()
            .map(|_| ImageLifecycle::new("swapchain image"))
            .collect();

        Ok(RenderContext {
            device,
            queue,
            window,
            swapchain,
            swapchain_images,
            surface_lifecycles,
            memory_allocator,
            command_buffer_allocator,
            descriptor_set_allocator,
            scene,
            pipeline,
            pipeline_layout,
            draw_image,
            draw_view,
            draw_lifecycle,
            slots,
            ring: FrameRing::new(slot_count),
            recreate_swapchain: false,
        })
    }
}

/// Builds one slot per swapchain image: a host-coherent uniform buffer and a
/// complete descriptor set over the scene, the draw target and that buffer.
/// Also hands back the set layout the slots were written against; rebuilt
/// layouts over the same binding list stay compatible with the pipeline.
pub(super) fn build_frame_slots(
    device: Arc<Device>,
    memory_allocator: Arc<StandardMemoryAllocator>,
    descriptor_set_allocator: Arc<StandardDescriptorSetAllocator>,
    scene: &SceneResources,
    draw_view: Arc<vulkano::image::view::ImageView>,
    slot_count: usize,
) -> Result<(Vec<FrameSlot>, Arc<DescriptorSetLayout>), RenderError> {
    let mut binder = DescriptorBinder::declare(
        device,
        descriptor_set_allocator,
        &BINDINGS,
        slot_count,
    )?;

    let mut slots = Vec::with_capacity(slot_count);
    for _ in 0..slot_count {
        let uniform = create_uniform_buffer(memory_allocator.clone())?;
        let mut writer = binder.writer();
        writer.storage_image(BINDING_DRAW_IMAGE, draw_view.clone())?;
        writer.uniform_buffer(BINDING_PARAMS, uniform.clone())?;
        writer.storage_image(BINDING_VOLUME, scene.volume_view.clone())?;
        writer.storage_buffer(BINDING_PALETTE, scene.palette_buffer.clone())?;
        slots.push(FrameSlot {
            uniform,
            descriptor_set: writer.build()?,
            fence: None,
        });
    }
    Ok((slots, binder.layout().clone()))
}
