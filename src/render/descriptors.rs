//! Shader-visible resource layout.
//!
//! A layout is declared once from a binding list; sets are then written
//! through a checked writer that refuses unknown bindings, kind mismatches
//! and double writes, and refuses to build a set while any declared binding
//! is unwritten. The set budget is fixed when the scene is loaded.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use thiserror::Error;
use vulkano::buffer::{BufferContents, Subbuffer};
use vulkano::descriptor_set::allocator::StandardDescriptorSetAllocator;
use vulkano::descriptor_set::layout::{
    DescriptorSetLayout, DescriptorSetLayoutBinding, DescriptorSetLayoutCreateInfo, DescriptorType,
};
use vulkano::descriptor_set::{DescriptorSet, WriteDescriptorSet};
use vulkano::device::Device;
use vulkano::image::sampler::Sampler;
use vulkano::image::view::ImageView;
use vulkano::shader::ShaderStages;

use super::types::RenderError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BindingKind {
    StorageImage,
    SampledImage,
    StorageBuffer,
    UniformBuffer,
}

impl BindingKind {
    fn descriptor_type(self) -> DescriptorType {
        match self {
            Self::StorageImage => DescriptorType::StorageImage,
            Self::SampledImage => DescriptorType::CombinedImageSampler,
            Self::StorageBuffer => DescriptorType::StorageBuffer,
            Self::UniformBuffer => DescriptorType::UniformBuffer,
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct BindingDesc {
    pub binding: u32,
    pub kind: BindingKind,
}

#[derive(Debug, Error)]
pub enum DescriptorError {
    #[error("binding {0} is not declared in the layout")]
    UnknownBinding(u32),
    #[error("binding {binding} is declared as {declared:?}, got {offered:?}")]
    KindMismatch {
        binding: u32,
        declared: BindingKind,
        offered: BindingKind,
    },
    #[error("binding {0} written twice in one set")]
    AlreadyWritten(u32),
    #[error("binding {0} was never written")]
    Incomplete(u32),
    #[error("descriptor set budget of {0} exhausted")]
    CapacityExceeded(usize),
}

/// Pure bookkeeping of which declared bindings a set write has covered.
#[derive(Debug)]
struct BindingLedger<'a> {
    declared: &'a BTreeMap<u32, BindingKind>,
    written: BTreeSet<u32>,
}

impl<'a> BindingLedger<'a> {
    fn new(declared: &'a BTreeMap<u32, BindingKind>) -> Self {
        Self {
            declared,
            written: BTreeSet::new(),
        }
    }

    fn record(&mut self, binding: u32, kind: BindingKind) -> Result<(), DescriptorError> {
        let declared = *self
            .declared
            .get(&binding)
            .ok_or(DescriptorError::UnknownBinding(binding))?;
        if declared != kind {
            return Err(DescriptorError::KindMismatch {
                binding,
                declared,
                offered: kind,
            });
        }
        if !self.written.insert(binding) {
            return Err(DescriptorError::AlreadyWritten(binding));
        }
        Ok(())
    }

    fn finish(&self) -> Result<(), DescriptorError> {
        match self
            .declared
            .keys()
            .find(|binding| !self.written.contains(binding))
        {
            Some(&missing) => Err(DescriptorError::Incomplete(missing)),
            None => Ok(()),
        }
    }
}

/// Fixed allocation budget, sized at scene load. Never grows.
#[derive(Debug)]
struct SetBudget {
    capacity: usize,
    allocated: usize,
}

impl SetBudget {
    fn reserve(&mut self) -> Result<(), DescriptorError> {
        if self.allocated == self.capacity {
            return Err(DescriptorError::CapacityExceeded(self.capacity));
        }
        self.allocated += 1;
        Ok(())
    }
}

pub struct DescriptorBinder {
    allocator: Arc<StandardDescriptorSetAllocator>,
    layout: Arc<DescriptorSetLayout>,
    declared: BTreeMap<u32, BindingKind>,
    budget: SetBudget,
}

impl DescriptorBinder {
    /// Declares the compute-visible layout and fixes the set budget.
    pub fn declare(
        device: Arc<Device>,
        allocator: Arc<StandardDescriptorSetAllocator>,
        bindings: &[BindingDesc],
        capacity: usize,
    ) -> Result<Self, RenderError> {
        let mut declared = BTreeMap::new();
        let mut layout_bindings = BTreeMap::new();
        for desc in bindings {
            declared.insert(desc.binding, desc.kind);
            layout_bindings.insert(
                desc.binding,
                DescriptorSetLayoutBinding {
                    stages: ShaderStages::COMPUTE,
                    ..DescriptorSetLayoutBinding::descriptor_type(desc.kind.descriptor_type())
                },
            );
        }
        let layout = DescriptorSetLayout::new(
            device,
            DescriptorSetLayoutCreateInfo {
                bindings: layout_bindings,
                ..Default::default()
            },
        )?;
        Ok(Self {
            allocator,
            layout,
            declared,
            budget: SetBudget {
                capacity,
                allocated: 0,
            },
        })
    }

    pub fn layout(&self) -> &Arc<DescriptorSetLayout> {
        &self.layout
    }

    pub fn writer(&mut self) -> SetWriter<'_> {
        SetWriter {
            ledger: BindingLedger::new(&self.declared),
            writes: Vec::with_capacity(self.declared.len()),
            allocator: self.allocator.clone(),
            layout: self.layout.clone(),
            budget: &mut self.budget,
        }
    }
}

/// Accumulates one set's writes; building checks completeness and budget.
pub struct SetWriter<'a> {
    ledger: BindingLedger<'a>,
    writes: Vec<WriteDescriptorSet>,
    allocator: Arc<StandardDescriptorSetAllocator>,
    layout: Arc<DescriptorSetLayout>,
    budget: &'a mut SetBudget,
}

impl SetWriter<'_> {
    pub fn storage_image(&mut self, binding: u32, view: Arc<ImageView>) -> Result<(), RenderError> {
        self.ledger.record(binding, BindingKind::StorageImage)?;
        self.writes.push(WriteDescriptorSet::image_view(binding, view));
        Ok(())
    }

    pub fn sampled_image(
        &mut self,
        binding: u32,
        view: Arc<ImageView>,
        sampler: Arc<Sampler>,
    ) -> Result<(), RenderError> {
        self.ledger.record(binding, BindingKind::SampledImage)?;
        self.writes.push(WriteDescriptorSet::image_view_sampler(binding, view, sampler));
        Ok(())
    }

    pub fn storage_buffer<T: BufferContents + ?Sized>(
        &mut self,
        binding: u32,
        buffer: Subbuffer<T>,
    ) -> Result<(), RenderError> {
        self.ledger.record(binding, BindingKind::StorageBuffer)?;
        self.writes.push(WriteDescriptorSet::buffer(binding, buffer));
        Ok(())
    }

    pub fn uniform_buffer<T: BufferContents + ?Sized>(
        &mut self,
        binding: u32,
        buffer: Subbuffer<T>,
    ) -> Result<(), RenderError> {
        self.ledger.record(binding, BindingKind::UniformBuffer)?;
        self.writes.push(WriteDescriptorSet::buffer(binding, buffer));
        Ok(())
    }

    pub fn build(self) -> Result<Arc<DescriptorSet>, RenderError> {
        self.ledger.finish()?;
        self.budget.reserve()?;
        let set = DescriptorSet::new(self.allocator, self.layout, self.writes, [])?;
        Ok(set)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn declared() -> BTreeMap<u32, BindingKind> {
        BTreeMap::from([
            (0, BindingKind::StorageImage),
            (1, BindingKind::UniformBuffer),
            (3, BindingKind::StorageBuffer),
        ])
    }

    #[test]
    fn complete_set_passes() {
        let declared = declared();
        let mut ledger = BindingLedger::new(&declared);
        ledger.record(0, BindingKind::StorageImage).unwrap();
        ledger.record(1, BindingKind::UniformBuffer).unwrap();
        ledger.record(3, BindingKind::StorageBuffer).unwrap();
        assert!(ledger.finish().is_ok());
    }

    #[test]
    fn sampled_image_binding_completes_a_set() {
        let declared = BTreeMap::from([(0, BindingKind::SampledImage)]);
        let mut ledger = BindingLedger::new(&declared);
        assert!(matches!(ledger.finish(), Err(DescriptorError::Incomplete(0))));
        ledger.record(0, BindingKind::SampledImage).unwrap();
        assert!(ledger.finish().is_ok());
    }

    #[test]
    fn unwritten_binding_is_rejected() {
        let declared = declared();
        let mut ledger = BindingLedger::new(&declared);
        ledger.record(0, BindingKind::StorageImage).unwrap();
        ledger.record(3, BindingKind::StorageBuffer).unwrap();
        assert!(matches!(
            ledger.finish(),
            Err(DescriptorError::Incomplete(1))
        ));
    }

    #[test]
    fn unknown_binding_is_rejected() {
        let declared = declared();
        let mut ledger = BindingLedger::new(&declared);
        assert!(matches!(
            ledger.record(2, BindingKind::StorageBuffer),
            Err(DescriptorError::UnknownBinding(2))
        ));
    }

    #[test]
    fn kind_mismatch_is_rejected() {
        let declared = declared();
        let mut ledger = BindingLedger::new(&declared);
        assert!(matches!(
            ledger.record(1, BindingKind::StorageBuffer),
            Err(DescriptorError::KindMismatch { binding: 1, .. })
        ));
    }

    #[test]
    fn double_write_is_rejected() {
        let declared = declared();
        let mut ledger = BindingLedger::new(&declared);
        ledger.record(0, BindingKind::StorageImage).unwrap();
        assert!(matches!(
            ledger.record(0, BindingKind::StorageImage),
            Err(DescriptorError::AlreadyWritten(0))
        ));
    }

    #[test]
    fn budget_is_fixed() {
        let mut budget = SetBudget {
            capacity: 2,
            allocated: 0,
        };
        budget.reserve().unwrap();
        budget.reserve().unwrap();
        assert!(matches!(
            budget.reserve(),
            Err(DescriptorError::CapacityExceeded(2))
        ));
    }
}
