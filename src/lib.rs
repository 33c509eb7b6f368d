//! Compute ray-marching viewer for PISV voxel scenes.
//!
//! [`vox`] decodes scene files, [`render`] owns the Vulkan frame loop, and
//! [`camera`] turns input into the per-frame shader parameters.

pub mod camera;
pub mod render;
pub mod vox;
pub mod vulkan_setup;
