//! Compute pipeline construction.
//!
//! The ray-march shader is a precompiled SPIR-V binary loaded from disk at
//! startup, so a shader rebuild never requires recompiling the viewer.

use std::fs;
use std::path::Path;
use std::sync::Arc;

use vulkano::descriptor_set::layout::DescriptorSetLayout;
use vulkano::device::Device;
use vulkano::pipeline::compute::ComputePipelineCreateInfo;
use vulkano::pipeline::layout::PipelineLayoutCreateInfo;
use vulkano::pipeline::{ComputePipeline, PipelineLayout, PipelineShaderStageCreateInfo};
use vulkano::shader::{ShaderModule, ShaderModuleCreateInfo};

use super::types::{RenderError, WORKGROUP_SIZE};

/// Workgroup counts covering a `width x height` target with the shader's
/// 16x16 local size. Partial edge groups are included; the shader bounds-checks
/// its invocation id.
pub fn dispatch_groups(extent: [u32; 2]) -> [u32; 3] {
    [
        extent[0].div_ceil(WORKGROUP_SIZE),
        extent[1].div_ceil(WORKGROUP_SIZE),
        1,
    ]
}

fn load_shader(device: Arc<Device>, path: &Path) -> Result<Arc<ShaderModule>, RenderError> {
    let spirv = fs::read(path).map_err(|source| RenderError::ShaderRead {
        path: path.to_owned(),
        source,
    })?;
    let words = vulkano::shader::spirv::bytes_to_words(&spirv)
        .map_err(|_| RenderError::BadSpirv {
            path: path.to_owned(),
        })?;
    // Safety: the words came straight from a SPIR-V binary on disk; the
    // validity checks vulkano skips here are the driver's to enforce.
    let module = unsafe { ShaderModule::new(device, ShaderModuleCreateInfo::new(words.as_ref())) }?;
    Ok(module)
}

/// Builds the ray-march compute pipeline over the scene's descriptor layout.
pub fn create_raymarch_pipeline(
    device: Arc<Device>,
    shader_path: &Path,
    set_layout: Arc<DescriptorSetLayout>,
) -> Result<(Arc<ComputePipeline>, Arc<PipelineLayout>), RenderError> {
    let module = load_shader(device.clone(), shader_path)?;
    let entry = module
        .entry_point("main")
        .ok_or(RenderError::MissingEntryPoint)?;

    let pipeline_layout = PipelineLayout::new(
        device.clone(),
        PipelineLayoutCreateInfo {
            set_layouts: vec![set_layout],
            ..Default::default()
        },
    )?;
    let pipeline = ComputePipeline::new(
        device,
        None,
        ComputePipelineCreateInfo::stage_layout(
            PipelineShaderStageCreateInfo::new(entry),
            pipeline_layout.clone(),
        ),
    )?;
    Ok((pipeline, pipeline_layout))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dispatch_covers_exact_multiples() {
        assert_eq!(dispatch_groups([1920, 1088]), [120, 68, 1]);
    }

    #[test]
    fn dispatch_rounds_partial_groups_up() {
        assert_eq!(dispatch_groups([1920, 1080]), [120, 68, 1]);
        assert_eq!(dispatch_groups([1, 1]), [1, 1, 1]);
        assert_eq!(dispatch_groups([17, 16]), [2, 1, 1]);
    }
}
