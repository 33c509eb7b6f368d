//! Buffer and image ownership.
//!
//! All GPU memory for a scene is created here: the device-local 3D voxel
//! image and palette buffer (filled once through staging buffers), the
//! offscreen draw target, and the per-slot uniform buffers the CPU rewrites
//! every frame.

use std::sync::Arc;

use log::info;
use vulkano::buffer::{Buffer, BufferCreateInfo, BufferUsage, Subbuffer};
use vulkano::command_buffer::allocator::StandardCommandBufferAllocator;
use vulkano::command_buffer::{
    AutoCommandBufferBuilder, CommandBufferUsage, CopyBufferInfo, CopyBufferToImageInfo,
};
use vulkano::device::Queue;
use vulkano::format::{Format, FormatFeatures};
use vulkano::image::view::ImageView;
use vulkano::image::{Image, ImageCreateInfo, ImageType, ImageUsage};
use vulkano::memory::allocator::{AllocationCreateInfo, MemoryTypeFilter, StandardMemoryAllocator};
use vulkano::memory::MemoryPropertyFlags;
use vulkano::sync::GpuFuture;
use vulkano::{sync, Validated, VulkanError};

use crate::vox::{MaterialPalette, VoxelVolume};

use super::layout::{ImageLayoutState, ImageLifecycle};
use super::types::{RenderError, RenderParams, SYNC_WAIT_TIMEOUT};

/// Offscreen draw target format. Wide enough for HDR shading; the present
/// blit converts down to whatever the surface uses.
pub const DRAW_IMAGE_FORMAT: Format = Format::R16G16B16A16_SFLOAT;

/// Voxel volume texel format; one palette index per texel.
pub const VOLUME_FORMAT: Format = Format::R8_UINT;

/// Lowest-indexed memory type whose bit is set in `type_mask` and whose
/// property flags are a superset of `required`. No match means the device
/// cannot satisfy the request at all; that is a configuration error, not a
/// retryable condition.
pub fn select_memory_type(
    types: &[MemoryPropertyFlags],
    type_mask: u32,
    required: MemoryPropertyFlags,
) -> Result<u32, RenderError> {
    types
        .iter()
        .enumerate()
        .find(|(i, flags)| type_mask & (1 << i) != 0 && flags.contains(required))
        .map(|(i, _)| i as u32)
        .ok_or(RenderError::OutOfMemoryType {
            mask: type_mask,
            required,
        })
}

/// Device-resident scene data: the voxel volume as a 3D storage image and
/// the packed palette as a storage buffer. Created once per scene, read by
/// every frame's dispatch, never written again.
pub struct SceneResources {
    pub volume_view: Arc<ImageView>,
    pub volume_lifecycle: ImageLifecycle,
    pub palette_buffer: Subbuffer<[u32]>,
}

impl SceneResources {
    /// Stages the decoded scene into device-local memory and waits for the
    /// copy to drain before the staging buffers are released.
    pub fn upload(
        memory_allocator: Arc<StandardMemoryAllocator>,
        command_buffer_allocator: Arc<StandardCommandBufferAllocator>,
        queue: Arc<Queue>,
        volume: &VoxelVolume,
        palette: &MaterialPalette,
    ) -> Result<Self, RenderError> {
        let physical = queue.device().physical_device();
        let volume_features = physical.format_properties(VOLUME_FORMAT)?;
        if !volume_features
            .optimal_tiling_features
            .contains(FormatFeatures::STORAGE_IMAGE)
        {
            return Err(RenderError::UnsupportedFormat(VOLUME_FORMAT));
        }

        let volume_staging = Buffer::from_iter(
            memory_allocator.clone(),
            BufferCreateInfo {
                usage: BufferUsage::TRANSFER_SRC,
                ..Default::default()
            },
            AllocationCreateInfo {
                memory_type_filter: MemoryTypeFilter::PREFER_HOST
                    | MemoryTypeFilter::HOST_SEQUENTIAL_WRITE,
                ..Default::default()
            },
            volume.voxels().iter().copied(),
        )?;

        let volume_image = Image::new(
            memory_allocator.clone(),
            ImageCreateInfo {
                image_type: ImageType::Dim3d,
                format: VOLUME_FORMAT,
                extent: volume.extent(),
                usage: ImageUsage::TRANSFER_DST | ImageUsage::STORAGE,
                ..Default::default()
            },
            AllocationCreateInfo {
                memory_type_filter: MemoryTypeFilter::PREFER_DEVICE,
                ..Default::default()
            },
        )?;

        let palette_staging = Buffer::from_iter(
            memory_allocator.clone(),
            BufferCreateInfo {
                usage: BufferUsage::TRANSFER_SRC,
                ..Default::default()
            },
            AllocationCreateInfo {
                memory_type_filter: MemoryTypeFilter::PREFER_HOST
                    | MemoryTypeFilter::HOST_SEQUENTIAL_WRITE,
                ..Default::default()
            },
            palette.packed(),
        )?;

        let palette_buffer = Buffer::new_slice::<u32>(
            memory_allocator,
            BufferCreateInfo {
                usage: BufferUsage::STORAGE_BUFFER | BufferUsage::TRANSFER_DST,
                ..Default::default()
            },
            AllocationCreateInfo {
                memory_type_filter: MemoryTypeFilter::PREFER_DEVICE,
                ..Default::default()
            },
            crate::vox::PALETTE_LEN as u64,
        )?;

        let mut volume_lifecycle = ImageLifecycle::new("voxel volume");
        volume_lifecycle.transition(ImageLayoutState::TransferDst)?;

        let mut builder = AutoCommandBufferBuilder::primary(
            command_buffer_allocator,
            queue.queue_family_index(),
            CommandBufferUsage::OneTimeSubmit,
        )?;
        builder
            .copy_buffer_to_image(CopyBufferToImageInfo::buffer_image(
                volume_staging,
                volume_image.clone(),
            ))?
            .copy_buffer(CopyBufferInfo::buffers(
                palette_staging,
                palette_buffer.clone(),
            ))?;
        let upload_cmd = builder.build()?;

        let upload_fence = sync::now(queue.device().clone())
            .then_execute(queue.clone(), upload_cmd)?
            .then_signal_fence_and_flush()?;
        // The staging buffers must outlive the copy; wait before this scope
        // drops them.
        match upload_fence.wait(Some(SYNC_WAIT_TIMEOUT)) {
            Err(Validated::Error(VulkanError::Timeout)) => {
                return Err(RenderError::SyncTimeout("scene upload fence"))
            }
            other => other?,
        }

        volume_lifecycle.transition(ImageLayoutState::General)?;

        let [x, y, z] = volume.extent();
        info!(
            "scene resident: {x}x{y}x{z} volume ({} bytes) + {}-entry palette",
            volume.voxels().len(),
            crate::vox::PALETTE_LEN
        );

        Ok(Self {
            volume_view: ImageView::new_default(volume_image)?,
            volume_lifecycle,
            palette_buffer,
        })
    }
}

/// Offscreen target the compute pass writes and the present blit reads.
pub fn create_draw_image(
    memory_allocator: Arc<StandardMemoryAllocator>,
    extent: [u32; 2],
) -> Result<(Arc<Image>, Arc<ImageView>, ImageLifecycle), RenderError> {
    let image = Image::new(
        memory_allocator,
        ImageCreateInfo {
            image_type: ImageType::Dim2d,
            format: DRAW_IMAGE_FORMAT,
            extent: [extent[0], extent[1], 1],
            usage: ImageUsage::STORAGE | ImageUsage::TRANSFER_SRC,
            ..Default::default()
        },
        AllocationCreateInfo {
            memory_type_filter: MemoryTypeFilter::PREFER_DEVICE,
            ..Default::default()
        },
    )?;
    let view = ImageView::new_default(image.clone())?;
    Ok((image, view, ImageLifecycle::new("draw image")))
}

/// Host-coherent uniform buffer for one frame slot, rewritten wholesale
/// before every submission.
pub fn create_uniform_buffer(
    memory_allocator: Arc<StandardMemoryAllocator>,
) -> Result<Subbuffer<RenderParams>, RenderError> {
    let buffer = Buffer::from_data(
        memory_allocator,
        BufferCreateInfo {
            usage: BufferUsage::UNIFORM_BUFFER,
            ..Default::default()
        },
        AllocationCreateInfo {
            memory_type_filter: MemoryTypeFilter::PREFER_DEVICE
                | MemoryTypeFilter::HOST_SEQUENTIAL_WRITE,
            ..Default::default()
        },
        RenderParams::default(),
    )?;
    Ok(buffer)
}

#[cfg(test)]
mod tests {
    use super::*;

    const HOST: MemoryPropertyFlags = MemoryPropertyFlags::HOST_VISIBLE;
    const DEVICE: MemoryPropertyFlags = MemoryPropertyFlags::DEVICE_LOCAL;

    fn host_coherent() -> MemoryPropertyFlags {
        MemoryPropertyFlags::HOST_VISIBLE | MemoryPropertyFlags::HOST_COHERENT
    }

    #[test]
    fn picks_lowest_matching_index() {
        let types = [DEVICE, host_coherent(), host_coherent()];
        assert_eq!(
            select_memory_type(&types, 0b111, MemoryPropertyFlags::HOST_VISIBLE).unwrap(),
            1
        );
    }

    #[test]
    fn respects_the_type_mask() {
        let types = [host_coherent(), host_coherent()];
        assert_eq!(
            select_memory_type(&types, 0b10, MemoryPropertyFlags::HOST_VISIBLE).unwrap(),
            1
        );
    }

    #[test]
    fn requires_a_property_superset() {
        let types = [HOST, DEVICE];
        assert!(matches!(
            select_memory_type(&types, 0b11, host_coherent()),
            Err(RenderError::OutOfMemoryType { .. })
        ));
        // DEVICE_LOCAL | HOST_VISIBLE superset still matches.
        let types = [DEVICE | HOST | MemoryPropertyFlags::HOST_COHERENT];
        assert_eq!(select_memory_type(&types, 0b1, host_coherent()).unwrap(), 0);
    }

    #[test]
    fn no_match_is_fatal() {
        assert!(matches!(
            select_memory_type(&[], !0, DEVICE),
            Err(RenderError::OutOfMemoryType { .. })
        ));
    }
}
