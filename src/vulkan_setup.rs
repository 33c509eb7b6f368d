use std::sync::Arc;

use log::info;
use vulkano::device::{
    physical::PhysicalDeviceType, Device, DeviceCreateInfo, DeviceExtensions, Queue,
    QueueCreateInfo, QueueFlags,
};
use vulkano::instance::{Instance, InstanceCreateFlags, InstanceCreateInfo};
use vulkano::swapchain::Surface;
use vulkano::VulkanLibrary;
use winit::event_loop::EventLoop;

use crate::render::RenderError;

/// Creates the instance and device, preferring discrete GPUs. The single
/// queue must support compute, transfer and presentation; the whole frame
/// (dispatch, blit, present) is submitted to it.
pub fn vulkan_setup(
    event_loop: &EventLoop<()>,
) -> Result<(Arc<Instance>, Arc<Device>, Arc<Queue>), RenderError> {
    let library = VulkanLibrary::new()?;

    let required_extensions =
        Surface::required_extensions(event_loop)
            .map_err(|e| RenderError::WindowHandle(Box::new(e)))?;

    let instance = Instance::new(
        library,
        InstanceCreateInfo {
            flags: InstanceCreateFlags::ENUMERATE_PORTABILITY,
            enabled_extensions: required_extensions,
            ..Default::default()
        },
    )?;

    let device_extensions = DeviceExtensions {
        khr_swapchain: true,
        ..DeviceExtensions::empty()
    };

    let (physical_device, queue_family_index) = instance
        .enumerate_physical_devices()?
        .filter(|p| p.supported_extensions().contains(&device_extensions))
        .filter_map(|p| {
            p.queue_family_properties()
                .iter()
                .enumerate()
                .position(|(i, q)| {
                    q.queue_flags
                        .contains(QueueFlags::COMPUTE | QueueFlags::TRANSFER)
                        && p.presentation_support(i as u32, event_loop).unwrap_or(false)
                })
                .map(|i| (p, i as u32))
        })
        .min_by_key(|(p, _)| match p.properties().device_type {
            PhysicalDeviceType::DiscreteGpu => 0,
            PhysicalDeviceType::IntegratedGpu => 1,
            PhysicalDeviceType::VirtualGpu => 2,
            PhysicalDeviceType::Cpu => 3,
            PhysicalDeviceType::Other => 4,
            _ => 5,
        })
        .ok_or(RenderError::NoSuitableDevice)?;

    info!(
        "using device: {} (type: {:?})",
        physical_device.properties().device_name,
        physical_device.properties().device_type,
    );

    let (device, mut queues) = Device::new(
        physical_device,
        DeviceCreateInfo {
            enabled_extensions: device_extensions,
            queue_create_infos: vec![QueueCreateInfo {
                queue_family_index,
                ..Default::default()
            }],
            ..Default::default()
        },
    )?;

    let queue = queues.next().ok_or(RenderError::NoSuitableDevice)?;

    Ok((instance, device, queue))
}
