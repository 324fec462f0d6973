//! Descriptor set management.
//!
//! A [`ResourceDescriptor`] owns one layout, one pool and one set per
//! swapchain image. Bindings and write templates are collected first; the
//! binding slot of each write is its position in the list. `finalize`
//! creates the Vulkan objects and updates every set with every write.

use crate::error::{GpuError, Result};
use ash::vk;

/// One slot in the layout.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LayoutBinding {
    pub descriptor_type: vk::DescriptorType,
    pub stages: vk::ShaderStageFlags,
    /// Array length, 1 for plain descriptors.
    pub count: u32,
}

impl LayoutBinding {
    /// Uniform buffer binding.
    pub fn uniform_buffer(stages: vk::ShaderStageFlags) -> Self {
        Self {
            descriptor_type: vk::DescriptorType::UNIFORM_BUFFER,
            stages,
            count: 1,
        }
    }

    /// Combined image sampler binding.
    pub fn combined_image_sampler(stages: vk::ShaderStageFlags) -> Self {
        Self {
            descriptor_type: vk::DescriptorType::COMBINED_IMAGE_SAMPLER,
            stages,
            count: 1,
        }
    }
}

/// What a write points at.
#[derive(Debug, Clone)]
pub enum DescriptorResource {
    /// One buffer per set, indexed by set.
    PerSetBuffers(Vec<vk::DescriptorBufferInfo>),
    /// The same buffer in every set.
    Buffer(vk::DescriptorBufferInfo),
    /// The same image in every set.
    Image(vk::DescriptorImageInfo),
}

/// A write template; the target set and slot are filled in at finalize.
#[derive(Debug, Clone)]
pub struct DescriptorWrite {
    pub descriptor_type: vk::DescriptorType,
    pub resource: DescriptorResource,
}

impl DescriptorWrite {
    /// One uniform buffer per set.
    pub fn per_set_uniform_buffers(buffers: impl IntoIterator<Item = (vk::Buffer, u64)>) -> Self {
        Self {
            descriptor_type: vk::DescriptorType::UNIFORM_BUFFER,
            resource: DescriptorResource::PerSetBuffers(
                buffers
                    .into_iter()
                    .map(|(buffer, range)| {
                        vk::DescriptorBufferInfo::default()
                            .buffer(buffer)
                            .offset(0)
                            .range(range)
                    })
                    .collect(),
            ),
        }
    }

    /// A sampled texture in shader-read-only layout.
    pub fn combined_image_sampler(view: vk::ImageView, sampler: vk::Sampler) -> Self {
        Self {
            descriptor_type: vk::DescriptorType::COMBINED_IMAGE_SAMPLER,
            resource: DescriptorResource::Image(
                vk::DescriptorImageInfo::default()
                    .image_view(view)
                    .sampler(sampler)
                    .image_layout(vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL),
            ),
        }
    }
}

/// Resource of a planned write.
#[derive(Debug, Clone, Copy)]
pub enum PlannedResource {
    Buffer(vk::DescriptorBufferInfo),
    Image(vk::DescriptorImageInfo),
}

/// A write resolved to a concrete set index and binding slot.
#[derive(Debug, Clone, Copy)]
pub struct PlannedWrite {
    pub set: usize,
    pub binding: u32,
    pub descriptor_type: vk::DescriptorType,
    pub resource: PlannedResource,
}

/// Resolve templates into `set_count × writes.len()` concrete writes.
///
/// Each write's binding slot is its position. Fails with `LayoutMismatch`
/// when the write and binding lists disagree in length or type, a binding
/// is an array (a write carries one resource), or a per-set resource does
/// not have one entry per set.
pub fn plan_writes(
    set_count: usize,
    bindings: &[LayoutBinding],
    writes: &[DescriptorWrite],
) -> Result<Vec<PlannedWrite>> {
    if bindings.len() != writes.len() {
        return Err(GpuError::LayoutMismatch(format!(
            "{} layout bindings but {} descriptor writes",
            bindings.len(),
            writes.len()
        )));
    }

    for (slot, (binding, write)) in bindings.iter().zip(writes).enumerate() {
        if binding.descriptor_type != write.descriptor_type {
            return Err(GpuError::LayoutMismatch(format!(
                "binding {slot} is {:?} but its write is {:?}",
                binding.descriptor_type, write.descriptor_type
            )));
        }
        if binding.count != 1 {
            return Err(GpuError::LayoutMismatch(format!(
                "binding {slot} is an array of {} but writes carry one resource",
                binding.count
            )));
        }
        if let DescriptorResource::PerSetBuffers(buffers) = &write.resource {
            if buffers.len() != set_count {
                return Err(GpuError::LayoutMismatch(format!(
                    "binding {slot} has {} buffers for {set_count} sets",
                    buffers.len()
                )));
            }
        }
    }

    let mut planned = Vec::with_capacity(set_count * writes.len());
    for set in 0..set_count {
        for (slot, write) in writes.iter().enumerate() {
            let resource = match &write.resource {
                DescriptorResource::PerSetBuffers(buffers) => PlannedResource::Buffer(buffers[set]),
                DescriptorResource::Buffer(info) => PlannedResource::Buffer(*info),
                DescriptorResource::Image(info) => PlannedResource::Image(*info),
            };
            planned.push(PlannedWrite {
                set,
                binding: slot as u32,
                descriptor_type: write.descriptor_type,
                resource,
            });
        }
    }

    Ok(planned)
}

/// Pool sizes for `set_count` sets of `bindings`, multiplied by `scale`.
pub fn pool_sizes(
    bindings: &[LayoutBinding],
    set_count: u32,
    scale: u32,
) -> Vec<vk::DescriptorPoolSize> {
    let mut sizes: Vec<vk::DescriptorPoolSize> = Vec::new();
    for binding in bindings {
        let count = binding.count * set_count * scale;
        match sizes.iter_mut().find(|s| s.ty == binding.descriptor_type) {
            Some(size) => size.descriptor_count += count,
            None => sizes.push(vk::DescriptorPoolSize {
                ty: binding.descriptor_type,
                descriptor_count: count,
            }),
        }
    }
    sizes
}

const MAX_POOL_GROWTH: u32 = 3;

/// Layout, pool and per-image sets for one group of bindings.
pub struct ResourceDescriptor {
    name: String,
    bindings: Vec<LayoutBinding>,
    writes: Vec<DescriptorWrite>,
    layout: vk::DescriptorSetLayout,
    pool: vk::DescriptorPool,
    sets: Vec<vk::DescriptorSet>,
    written: usize,
}

impl ResourceDescriptor {
    /// Create an empty descriptor.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            bindings: Vec::new(),
            writes: Vec::new(),
            layout: vk::DescriptorSetLayout::null(),
            pool: vk::DescriptorPool::null(),
            sets: Vec::new(),
            written: 0,
        }
    }

    /// Append a layout binding; its slot is its position.
    pub fn add_layout_binding(&mut self, binding: LayoutBinding) -> &mut Self {
        self.bindings.push(binding);
        self
    }

    /// Append a write template for the binding at the same position.
    pub fn add_descriptor_write(&mut self, write: DescriptorWrite) -> &mut Self {
        self.writes.push(write);
        self
    }

    /// Layout bindings.
    pub fn bindings(&self) -> &[LayoutBinding] {
        &self.bindings
    }

    /// Descriptor set layout, null before `finalize`.
    pub fn layout(&self) -> vk::DescriptorSetLayout {
        self.layout
    }

    /// All sets.
    pub fn sets(&self) -> &[vk::DescriptorSet] {
        &self.sets
    }

    /// Set for a swapchain image.
    pub fn set(&self, image_index: u32) -> Option<vk::DescriptorSet> {
        self.sets.get(image_index as usize).copied()
    }

    /// Write templates waiting for the next `finalize`.
    pub fn writes(&self) -> &[DescriptorWrite] {
        &self.writes
    }

    /// Resolve the pending writes against the bindings for `set_count` sets.
    pub fn plan(&self, set_count: u32) -> Result<Vec<PlannedWrite>> {
        plan_writes(set_count as usize, &self.bindings, &self.writes)
    }

    /// Number of descriptor writes applied by the last `finalize`.
    pub fn written_count(&self) -> usize {
        self.written
    }

    /// Create the layout and pool, allocate `set_count` sets and write them.
    ///
    /// If the pool runs out of memory the allocation is retried with a pool
    /// twice as large, a few times, before failing with `PoolExhausted`.
    ///
    /// # Safety
    /// Every resource referenced by the writes must be alive.
    pub unsafe fn finalize(&mut self, device: &ash::Device, set_count: u32) -> Result<()> {
        if self.layout != vk::DescriptorSetLayout::null() {
            return Err(GpuError::InvalidState(format!(
                "descriptor {} finalized twice",
                self.name
            )));
        }

        let planned = self.plan(set_count)?;

        let layout_bindings: Vec<vk::DescriptorSetLayoutBinding> = self
            .bindings
            .iter()
            .enumerate()
            .map(|(slot, binding)| {
                vk::DescriptorSetLayoutBinding::default()
                    .binding(slot as u32)
                    .descriptor_type(binding.descriptor_type)
                    .descriptor_count(binding.count)
                    .stage_flags(binding.stages)
            })
            .collect();
        let layout_info = vk::DescriptorSetLayoutCreateInfo::default().bindings(&layout_bindings);
        self.layout = device.create_descriptor_set_layout(&layout_info, None)?;

        self.sets = self.allocate_sets(device, set_count)?;

        let writes: Vec<vk::WriteDescriptorSet> = planned
            .iter()
            .map(|write| {
                let base = vk::WriteDescriptorSet::default()
                    .dst_set(self.sets[write.set])
                    .dst_binding(write.binding)
                    .dst_array_element(0)
                    .descriptor_type(write.descriptor_type);
                match &write.resource {
                    PlannedResource::Buffer(info) => base.buffer_info(std::slice::from_ref(info)),
                    PlannedResource::Image(info) => base.image_info(std::slice::from_ref(info)),
                }
            })
            .collect();
        device.update_descriptor_sets(&writes, &[]);
        self.written = writes.len();

        tracing::debug!(
            "Descriptor {}: {} sets, {} bindings, {} writes",
            self.name,
            self.sets.len(),
            self.bindings.len(),
            self.written
        );
        Ok(())
    }

    unsafe fn allocate_sets(
        &mut self,
        device: &ash::Device,
        set_count: u32,
    ) -> Result<Vec<vk::DescriptorSet>> {
        let layouts = vec![self.layout; set_count as usize];

        for growth in 0..=MAX_POOL_GROWTH {
            let scale = 1 << growth;
            let sizes = pool_sizes(&self.bindings, set_count, scale);
            let pool_info = vk::DescriptorPoolCreateInfo::default()
                .max_sets(set_count * scale)
                .pool_sizes(&sizes);
            self.pool = device.create_descriptor_pool(&pool_info, None)?;

            let alloc_info = vk::DescriptorSetAllocateInfo::default()
                .descriptor_pool(self.pool)
                .set_layouts(&layouts);
            match device.allocate_descriptor_sets(&alloc_info) {
                Ok(sets) => return Ok(sets),
                Err(vk::Result::ERROR_OUT_OF_POOL_MEMORY | vk::Result::ERROR_FRAGMENTED_POOL) => {
                    tracing::warn!(
                        "Descriptor pool for {} exhausted, retrying with {}x size",
                        self.name,
                        scale * 2
                    );
                    device.destroy_descriptor_pool(self.pool, None);
                    self.pool = vk::DescriptorPool::null();
                }
                Err(e) => return Err(e.into()),
            }
        }

        Err(GpuError::PoolExhausted)
    }

    /// Destroy the pool, sets and layout.
    ///
    /// With `keep_bindings` the layout bindings survive so the descriptor can
    /// be finalized again after new writes are added; the writes are always
    /// dropped since they reference per-swapchain resources.
    ///
    /// # Safety
    /// No set may still be in use by the GPU.
    pub unsafe fn destroy(&mut self, device: &ash::Device, keep_bindings: bool) {
        if self.pool != vk::DescriptorPool::null() {
            device.destroy_descriptor_pool(self.pool, None);
            self.pool = vk::DescriptorPool::null();
        }
        if self.layout != vk::DescriptorSetLayout::null() {
            device.destroy_descriptor_set_layout(self.layout, None);
            self.layout = vk::DescriptorSetLayout::null();
        }
        self.forget_handles(keep_bindings);
    }

    fn forget_handles(&mut self, keep_bindings: bool) {
        self.sets.clear();
        self.writes.clear();
        self.written = 0;
        if !keep_bindings {
            self.bindings.clear();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bindings() -> Vec<LayoutBinding> {
        vec![
            LayoutBinding::uniform_buffer(vk::ShaderStageFlags::VERTEX),
            LayoutBinding::combined_image_sampler(vk::ShaderStageFlags::FRAGMENT),
        ]
    }

    fn writes(set_count: usize) -> Vec<DescriptorWrite> {
        vec![
            DescriptorWrite::per_set_uniform_buffers((0..set_count).map(|_| (vk::Buffer::null(), 64))),
            DescriptorWrite::combined_image_sampler(vk::ImageView::null(), vk::Sampler::null()),
        ]
    }

    #[test]
    fn plan_covers_every_set_and_binding() {
        for set_count in 1..5 {
            let planned = plan_writes(set_count, &bindings(), &writes(set_count)).unwrap();

            assert_eq!(planned.len(), set_count * 2);
            for (index, write) in planned.iter().enumerate() {
                assert_eq!(write.set, index / 2);
                assert_eq!(write.binding as usize, index % 2);
                assert!(write.set < set_count);
            }
        }
    }

    #[test]
    fn binding_index_is_position() {
        let many: Vec<LayoutBinding> = (0..6)
            .map(|_| LayoutBinding::uniform_buffer(vk::ShaderStageFlags::VERTEX))
            .collect();
        let writes: Vec<DescriptorWrite> = (0..6)
            .map(|_| DescriptorWrite::per_set_uniform_buffers([(vk::Buffer::null(), 16)]))
            .collect();

        let planned = plan_writes(1, &many, &writes).unwrap();
        let slots: Vec<u32> = planned.iter().map(|w| w.binding).collect();
        assert_eq!(slots, vec![0, 1, 2, 3, 4, 5]);
    }

    #[test]
    fn count_mismatch_is_layout_error() {
        let result = plan_writes(2, &bindings(), &writes(2)[..1]);
        assert!(matches!(result, Err(GpuError::LayoutMismatch(_))));
    }

    #[test]
    fn type_mismatch_is_layout_error() {
        let mut swapped = writes(2);
        swapped.reverse();
        let result = plan_writes(2, &bindings(), &swapped);
        assert!(matches!(result, Err(GpuError::LayoutMismatch(_))));
    }

    #[test]
    fn per_set_buffers_must_match_set_count() {
        let result = plan_writes(3, &bindings(), &writes(2));
        assert!(matches!(result, Err(GpuError::LayoutMismatch(_))));
    }

    #[test]
    fn array_bindings_are_rejected() {
        let mut layout = bindings();
        layout[1].count = 4;
        let result = plan_writes(2, &layout, &writes(2));
        assert!(matches!(result, Err(GpuError::LayoutMismatch(_))));
    }

    #[test]
    fn kept_bindings_accept_writes_for_a_new_image_count() {
        let mut descriptor = ResourceDescriptor::new("model");
        descriptor
            .add_layout_binding(LayoutBinding::uniform_buffer(vk::ShaderStageFlags::VERTEX))
            .add_layout_binding(LayoutBinding::combined_image_sampler(
                vk::ShaderStageFlags::FRAGMENT,
            ));
        for write in writes(2) {
            descriptor.add_descriptor_write(write);
        }
        assert_eq!(descriptor.plan(2).unwrap().len(), 4);
        let before = descriptor.bindings().to_vec();

        descriptor.forget_handles(true);
        assert_eq!(descriptor.bindings(), before.as_slice());
        assert!(descriptor.writes().is_empty());
        assert!(descriptor.sets().is_empty());

        for write in writes(3) {
            descriptor.add_descriptor_write(write);
        }
        let planned = descriptor.plan(3).unwrap();
        assert_eq!(planned.len(), 6);
        assert_eq!(planned.last().map(|w| w.set), Some(2));
        assert_eq!(descriptor.bindings(), before.as_slice());
    }

    #[test]
    fn dropping_bindings_empties_the_layout() {
        let mut descriptor = ResourceDescriptor::new("model");
        descriptor.add_layout_binding(LayoutBinding::uniform_buffer(vk::ShaderStageFlags::VERTEX));
        descriptor.forget_handles(false);
        assert!(descriptor.bindings().is_empty());
    }

    #[test]
    fn pool_sizes_group_by_type() {
        let mut layout = bindings();
        layout.push(LayoutBinding::uniform_buffer(vk::ShaderStageFlags::FRAGMENT));

        let sizes = pool_sizes(&layout, 3, 2);
        assert_eq!(sizes.len(), 2);

        let uniform = sizes
            .iter()
            .find(|s| s.ty == vk::DescriptorType::UNIFORM_BUFFER)
            .unwrap();
        assert_eq!(uniform.descriptor_count, 12);

        let sampler = sizes
            .iter()
            .find(|s| s.ty == vk::DescriptorType::COMBINED_IMAGE_SAMPLER)
            .unwrap();
        assert_eq!(sampler.descriptor_count, 6);
    }
}
