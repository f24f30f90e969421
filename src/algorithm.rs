//! Compute algorithm: shader + descriptor plumbing + pipeline
//!
//! An [`Algorithm`] owns everything needed to dispatch one compute shader
//! against a list of bound memory objects: descriptor set layout, pool and
//! set (binding i maps to memory i, in order), the shader module, the
//! pipeline layout and pipeline, staged push constants, specialization
//! constants baked at pipeline build, and the dispatch workgroup. All of it
//! can be rebuilt atomically; a failed rebuild leaves the algorithm
//! uninitialized rather than half-built.

use std::io::Cursor;
use std::sync::{Arc, Mutex};

use ash::vk;

use crate::context::DeviceContext;
use crate::error::{ComputeError, Result};
use crate::memory::{DescriptorInfo, SharedMemory};

/// A staged block of constants: raw bytes plus the element count and
/// element byte size the shader expects.
#[derive(Debug, Clone, Default)]
pub struct ConstantBlock {
    data: Vec<u8>,
    count: u32,
    element_size: u32,
}

impl ConstantBlock {
    /// Build from raw bytes; `data.len()` must equal `count * element_size`.
    pub fn new(data: Vec<u8>, count: u32, element_size: u32) -> Result<Self> {
        if data.len() as u64 != count as u64 * element_size as u64 {
            return Err(ComputeError::SizeMismatch(format!(
                "constant block holds {} bytes, expected {} x {}",
                data.len(),
                count,
                element_size
            )));
        }
        Ok(Self {
            data,
            count,
            element_size,
        })
    }

    /// Build from a slice of plain values.
    pub fn from_slice<T: Copy>(values: &[T]) -> Self {
        let bytes = unsafe {
            std::slice::from_raw_parts(values.as_ptr() as *const u8, std::mem::size_of_val(values))
        };
        Self {
            data: bytes.to_vec(),
            count: values.len() as u32,
            element_size: std::mem::size_of::<T>() as u32,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.count == 0
    }

    pub fn bytes(&self) -> &[u8] {
        &self.data
    }

    pub fn count(&self) -> u32 {
        self.count
    }

    pub fn element_size(&self) -> u32 {
        self.element_size
    }

    /// Total byte size of the block.
    pub fn total_size(&self) -> u32 {
        self.count * self.element_size
    }
}

struct AlgoState {
    bindings: Vec<SharedMemory>,
    spirv: Vec<u32>,
    workgroup: [u32; 3],
    spec_consts: ConstantBlock,
    push_consts: ConstantBlock,
    /// Push shape declared in the pipeline layout; pushes must match it.
    built_push_count: u32,
    built_push_size: u32,
    descriptor_set_layout: vk::DescriptorSetLayout,
    descriptor_pool: vk::DescriptorPool,
    descriptor_set: vk::DescriptorSet,
    shader_module: vk::ShaderModule,
    pipeline_layout: vk::PipelineLayout,
    pipeline: vk::Pipeline,
}

pub struct Algorithm {
    ctx: Arc<DeviceContext>,
    state: Mutex<AlgoState>,
}

impl Algorithm {
    pub(crate) fn new(
        ctx: Arc<DeviceContext>,
        bindings: Vec<SharedMemory>,
        spirv: &[u8],
        workgroup: [u32; 3],
        spec_consts: ConstantBlock,
        push_consts: ConstantBlock,
    ) -> Result<Self> {
        ctx.ensure_alive()?;

        let words = parse_spirv(spirv)?;
        let workgroup = resolve_workgroup(workgroup, &bindings)?;

        log::info!(
            "Creating algorithm: {} bindings, workgroup ({}, {}, {}), {} specialization bytes, {} push bytes",
            bindings.len(),
            workgroup[0],
            workgroup[1],
            workgroup[2],
            spec_consts.total_size(),
            push_consts.total_size()
        );

        let built_push_count = push_consts.count();
        let built_push_size = push_consts.element_size();

        let algorithm = Self {
            ctx,
            state: Mutex::new(AlgoState {
                bindings,
                spirv: words,
                workgroup,
                spec_consts,
                push_consts,
                built_push_count,
                built_push_size,
                descriptor_set_layout: vk::DescriptorSetLayout::null(),
                descriptor_pool: vk::DescriptorPool::null(),
                descriptor_set: vk::DescriptorSet::null(),
                shader_module: vk::ShaderModule::null(),
                pipeline_layout: vk::PipelineLayout::null(),
                pipeline: vk::Pipeline::null(),
            }),
        };

        {
            let mut state = algorithm.state.lock().unwrap();
            algorithm.build_locked(&mut state)?;
        }

        Ok(algorithm)
    }

    /// Creates every owned GPU object in build order; on failure destroys
    /// whatever was already created and reports the error.
    fn build_locked(&self, state: &mut AlgoState) -> Result<()> {
        let device = self.ctx.device();

        // Descriptor set layout: binding i <-> memory i, compute stage.
        let layout_bindings: Vec<vk::DescriptorSetLayoutBinding> = state
            .bindings
            .iter()
            .enumerate()
            .map(|(i, memory)| {
                vk::DescriptorSetLayoutBinding::default()
                    .binding(i as u32)
                    .descriptor_type(memory.descriptor_type())
                    .descriptor_count(1)
                    .stage_flags(vk::ShaderStageFlags::COMPUTE)
            })
            .collect();

        let layout_info = vk::DescriptorSetLayoutCreateInfo::default().bindings(&layout_bindings);
        state.descriptor_set_layout =
            match unsafe { device.create_descriptor_set_layout(&layout_info, None) } {
                Ok(layout) => layout,
                Err(e) => return Err(self.fail_build(state, self.ctx.guard(e))),
            };

        // Descriptor pool sized per-type from the actual binding list.
        let storage_buffers = state
            .bindings
            .iter()
            .filter(|b| b.descriptor_type() == vk::DescriptorType::STORAGE_BUFFER)
            .count() as u32;
        let storage_images = state.bindings.len() as u32 - storage_buffers;

        let mut pool_sizes = Vec::new();
        if storage_buffers > 0 {
            pool_sizes.push(vk::DescriptorPoolSize {
                ty: vk::DescriptorType::STORAGE_BUFFER,
                descriptor_count: storage_buffers,
            });
        }
        if storage_images > 0 {
            pool_sizes.push(vk::DescriptorPoolSize {
                ty: vk::DescriptorType::STORAGE_IMAGE,
                descriptor_count: storage_images,
            });
        }
        if pool_sizes.is_empty() {
            pool_sizes.push(vk::DescriptorPoolSize {
                ty: vk::DescriptorType::STORAGE_BUFFER,
                descriptor_count: 1,
            });
        }

        let pool_info = vk::DescriptorPoolCreateInfo::default()
            .pool_sizes(&pool_sizes)
            .max_sets(1);
        state.descriptor_pool = match unsafe { device.create_descriptor_pool(&pool_info, None) } {
            Ok(pool) => pool,
            Err(e) => return Err(self.fail_build(state, self.ctx.guard(e))),
        };

        // Descriptor set, updated with one write per binding.
        let set_layouts = [state.descriptor_set_layout];
        let alloc_info = vk::DescriptorSetAllocateInfo::default()
            .descriptor_pool(state.descriptor_pool)
            .set_layouts(&set_layouts);
        state.descriptor_set = match unsafe { device.allocate_descriptor_sets(&alloc_info) } {
            Ok(sets) => sets[0],
            Err(e) => return Err(self.fail_build(state, self.ctx.guard(e))),
        };

        let infos: Vec<DescriptorInfo> = match state
            .bindings
            .iter()
            .map(|b| b.descriptor_info())
            .collect::<Result<Vec<_>>>()
        {
            Ok(infos) => infos,
            Err(e) => return Err(self.fail_build(state, e)),
        };

        let writes: Vec<vk::WriteDescriptorSet> = infos
            .iter()
            .enumerate()
            .map(|(i, info)| {
                let write = vk::WriteDescriptorSet::default()
                    .dst_set(state.descriptor_set)
                    .dst_binding(i as u32)
                    .dst_array_element(0)
                    .descriptor_type(state.bindings[i].descriptor_type());
                match info {
                    DescriptorInfo::Buffer(buffer_info) => {
                        write.buffer_info(std::slice::from_ref(buffer_info))
                    }
                    DescriptorInfo::Image(image_info) => {
                        write.image_info(std::slice::from_ref(image_info))
                    }
                }
            })
            .collect();

        unsafe { device.update_descriptor_sets(&writes, &[]) };

        // Shader module.
        let shader_info = vk::ShaderModuleCreateInfo::default().code(&state.spirv);
        state.shader_module = match unsafe { device.create_shader_module(&shader_info, None) } {
            Ok(module) => module,
            Err(e) => return Err(self.fail_build(state, self.ctx.guard(e))),
        };

        // Pipeline layout, with a push range only when constants exist.
        let push_size = state.built_push_count * state.built_push_size;
        let push_ranges = if push_size > 0 {
            vec![vk::PushConstantRange::default()
                .stage_flags(vk::ShaderStageFlags::COMPUTE)
                .offset(0)
                .size(push_size)]
        } else {
            vec![]
        };

        let pipeline_layout_info = vk::PipelineLayoutCreateInfo::default()
            .set_layouts(&set_layouts)
            .push_constant_ranges(&push_ranges);
        state.pipeline_layout =
            match unsafe { device.create_pipeline_layout(&pipeline_layout_info, None) } {
                Ok(layout) => layout,
                Err(e) => return Err(self.fail_build(state, self.ctx.guard(e))),
            };

        // Compute pipeline, with specialization constants assembled
        // element-by-element: constant i sits at byte offset i * size.
        let spec_entries: Vec<vk::SpecializationMapEntry> = (0..state.spec_consts.count())
            .map(|i| vk::SpecializationMapEntry {
                constant_id: i,
                offset: i * state.spec_consts.element_size(),
                size: state.spec_consts.element_size() as usize,
            })
            .collect();
        let spec_info = vk::SpecializationInfo::default()
            .map_entries(&spec_entries)
            .data(state.spec_consts.bytes());

        let mut stage_info = vk::PipelineShaderStageCreateInfo::default()
            .stage(vk::ShaderStageFlags::COMPUTE)
            .module(state.shader_module)
            .name(c"main");
        if !state.spec_consts.is_empty() {
            stage_info = stage_info.specialization_info(&spec_info);
        }

        let pipeline_info = vk::ComputePipelineCreateInfo::default()
            .stage(stage_info)
            .layout(state.pipeline_layout);

        state.pipeline = match unsafe {
            device.create_compute_pipelines(vk::PipelineCache::null(), &[pipeline_info], None)
        } {
            Ok(pipelines) => pipelines[0],
            Err((_, e)) => return Err(self.fail_build(state, self.ctx.guard(e))),
        };

        log::info!("Algorithm pipeline created");
        Ok(())
    }

    /// Unwinds a partial build and passes the error through.
    fn fail_build(&self, state: &mut AlgoState, error: ComputeError) -> ComputeError {
        log::warn!("Algorithm build failed: {}", error);
        self.destroy_locked(state);
        error
    }

    fn destroy_locked(&self, state: &mut AlgoState) {
        let device = self.ctx.device();
        unsafe {
            if state.pipeline != vk::Pipeline::null() {
                device.destroy_pipeline(state.pipeline, None);
                state.pipeline = vk::Pipeline::null();
            }
            if state.pipeline_layout != vk::PipelineLayout::null() {
                device.destroy_pipeline_layout(state.pipeline_layout, None);
                state.pipeline_layout = vk::PipelineLayout::null();
            }
            if state.shader_module != vk::ShaderModule::null() {
                device.destroy_shader_module(state.shader_module, None);
                state.shader_module = vk::ShaderModule::null();
            }
            if state.descriptor_pool != vk::DescriptorPool::null() {
                // Frees the descriptor set with it.
                device.destroy_descriptor_pool(state.descriptor_pool, None);
                state.descriptor_pool = vk::DescriptorPool::null();
                state.descriptor_set = vk::DescriptorSet::null();
            }
            if state.descriptor_set_layout != vk::DescriptorSetLayout::null() {
                device.destroy_descriptor_set_layout(state.descriptor_set_layout, None);
                state.descriptor_set_layout = vk::DescriptorSetLayout::null();
            }
        }
    }

    /// Binds the compute pipeline and the descriptor set at set 0.
    pub fn record_bind_core(&self, cb: vk::CommandBuffer) {
        let state = self.state.lock().unwrap();
        let device = self.ctx.device();
        unsafe {
            device.cmd_bind_pipeline(cb, vk::PipelineBindPoint::COMPUTE, state.pipeline);
            device.cmd_bind_descriptor_sets(
                cb,
                vk::PipelineBindPoint::COMPUTE,
                state.pipeline_layout,
                0,
                &[state.descriptor_set],
                &[],
            );
        }
    }

    /// Records the push-constant update at offset 0. The pushed payload
    /// (override if given, else the staged block) must match the shape the
    /// pipeline was built with.
    pub fn record_bind_push(
        &self,
        cb: vk::CommandBuffer,
        push_override: Option<&ConstantBlock>,
    ) -> Result<()> {
        let state = self.state.lock().unwrap();
        let block = push_override.unwrap_or(&state.push_consts);

        if state.built_push_count == 0 && block.is_empty() {
            return Ok(());
        }
        if block.count() != state.built_push_count || block.element_size() != state.built_push_size
        {
            return Err(ComputeError::PushConstantShapeMismatch {
                built_count: state.built_push_count,
                built_size: state.built_push_size,
                pushed_count: block.count(),
                pushed_size: block.element_size(),
            });
        }

        unsafe {
            self.ctx.device().cmd_push_constants(
                cb,
                state.pipeline_layout,
                vk::ShaderStageFlags::COMPUTE,
                0,
                block.bytes(),
            );
        }
        Ok(())
    }

    /// Records the dispatch with the stored workgroup.
    pub fn record_dispatch(&self, cb: vk::CommandBuffer) {
        let state = self.state.lock().unwrap();
        unsafe {
            self.ctx.device().cmd_dispatch(
                cb,
                state.workgroup[0],
                state.workgroup[1],
                state.workgroup[2],
            );
        }
        log::debug!(
            "Recorded dispatch ({}, {}, {})",
            state.workgroup[0],
            state.workgroup[1],
            state.workgroup[2]
        );
    }

    /// Replaces the staged push payload. The shape is checked against the
    /// pipeline on the next bind.
    pub fn set_push_constants(&self, block: ConstantBlock) {
        self.state.lock().unwrap().push_consts = block;
    }

    pub fn get_push_constants(&self) -> ConstantBlock {
        self.state.lock().unwrap().push_consts.clone()
    }

    pub fn get_spec_constants(&self) -> ConstantBlock {
        self.state.lock().unwrap().spec_consts.clone()
    }

    pub fn set_workgroup(&self, workgroup: [u32; 3]) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        state.workgroup = resolve_workgroup(workgroup, &state.bindings)?;
        Ok(())
    }

    pub fn get_workgroup(&self) -> [u32; 3] {
        self.state.lock().unwrap().workgroup
    }

    pub fn get_bindings(&self) -> Vec<SharedMemory> {
        self.state.lock().unwrap().bindings.clone()
    }

    pub fn is_initialized(&self) -> bool {
        let state = self.state.lock().unwrap();
        state.pipeline != vk::Pipeline::null()
            && state.pipeline_layout != vk::PipelineLayout::null()
            && state.shader_module != vk::ShaderModule::null()
            && state.descriptor_pool != vk::DescriptorPool::null()
            && state.descriptor_set_layout != vk::DescriptorSetLayout::null()
    }

    /// Destroys every owned GPU object. The algorithm reports
    /// uninitialized afterwards; `rebuild` brings it back.
    pub fn destroy(&self) {
        log::debug!("Destroying algorithm");
        let mut state = self.state.lock().unwrap();
        self.destroy_locked(&mut state);
    }

    /// Re-parameterizes the algorithm and re-creates all owned GPU objects.
    /// A failed rebuild leaves the algorithm uninitialized.
    pub fn rebuild(
        &self,
        bindings: Vec<SharedMemory>,
        spirv: &[u8],
        workgroup: [u32; 3],
        spec_consts: ConstantBlock,
        push_consts: ConstantBlock,
    ) -> Result<()> {
        self.ctx.ensure_alive()?;

        let words = parse_spirv(spirv)?;
        let workgroup = resolve_workgroup(workgroup, &bindings)?;

        log::info!(
            "Rebuilding algorithm: {} bindings, workgroup ({}, {}, {})",
            bindings.len(),
            workgroup[0],
            workgroup[1],
            workgroup[2]
        );

        let mut state = self.state.lock().unwrap();
        self.destroy_locked(&mut state);

        state.bindings = bindings;
        state.spirv = words;
        state.workgroup = workgroup;
        state.built_push_count = push_consts.count();
        state.built_push_size = push_consts.element_size();
        state.spec_consts = spec_consts;
        state.push_consts = push_consts;

        self.build_locked(&mut state)
    }
}

impl Drop for Algorithm {
    fn drop(&mut self) {
        if let Ok(state) = self.state.get_mut() {
            let mut taken = AlgoState {
                bindings: std::mem::take(&mut state.bindings),
                spirv: std::mem::take(&mut state.spirv),
                workgroup: state.workgroup,
                spec_consts: ConstantBlock::default(),
                push_consts: ConstantBlock::default(),
                built_push_count: 0,
                built_push_size: 0,
                descriptor_set_layout: std::mem::replace(
                    &mut state.descriptor_set_layout,
                    vk::DescriptorSetLayout::null(),
                ),
                descriptor_pool: std::mem::replace(
                    &mut state.descriptor_pool,
                    vk::DescriptorPool::null(),
                ),
                descriptor_set: std::mem::replace(
                    &mut state.descriptor_set,
                    vk::DescriptorSet::null(),
                ),
                shader_module: std::mem::replace(
                    &mut state.shader_module,
                    vk::ShaderModule::null(),
                ),
                pipeline_layout: std::mem::replace(
                    &mut state.pipeline_layout,
                    vk::PipelineLayout::null(),
                ),
                pipeline: std::mem::replace(&mut state.pipeline, vk::Pipeline::null()),
            };
            self.destroy_locked(&mut taken);
        }
    }
}

/// Converts raw SPIR-V bytes into the word stream Vulkan expects.
fn parse_spirv(bytes: &[u8]) -> Result<Vec<u32>> {
    ash::util::read_spv(&mut Cursor::new(bytes))
        .map_err(|e| ComputeError::InvalidShader(e.to_string()))
}

/// Resolves the dispatch workgroup. A zero x dimension defaults to the
/// first bound tensor's element count; zero y/z dimensions default to 1.
fn resolve_workgroup(requested: [u32; 3], bindings: &[SharedMemory]) -> Result<[u32; 3]> {
    if requested[0] >= 1 {
        return Ok([requested[0], requested[1].max(1), requested[2].max(1)]);
    }

    match bindings.first() {
        Some(SharedMemory::Tensor(tensor)) => Ok([tensor.size(), 1, 1]),
        _ => Err(ComputeError::InvalidWorkgroup(
            "x dimension is zero and the first binding is not a tensor".into(),
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_constant_block_from_slice() {
        let block = ConstantBlock::from_slice(&[1.0f32, 2.0, 3.0]);
        assert_eq!(block.count(), 3);
        assert_eq!(block.element_size(), 4);
        assert_eq!(block.total_size(), 12);
        assert!(!block.is_empty());
    }

    #[test]
    fn test_constant_block_rejects_short_payload() {
        let result = ConstantBlock::new(vec![0u8; 10], 3, 4);
        assert!(matches!(result, Err(ComputeError::SizeMismatch(_))));
    }

    #[test]
    fn test_empty_constant_block() {
        let block = ConstantBlock::default();
        assert!(block.is_empty());
        assert_eq!(block.total_size(), 0);
    }

    #[test]
    fn test_workgroup_explicit_dimensions_are_kept() {
        let wg = resolve_workgroup([8, 4, 2], &[]).unwrap();
        assert_eq!(wg, [8, 4, 2]);
    }

    #[test]
    fn test_workgroup_zero_tail_dimensions_default_to_one() {
        let wg = resolve_workgroup([8, 0, 0], &[]).unwrap();
        assert_eq!(wg, [8, 1, 1]);
    }

    #[test]
    fn test_workgroup_zero_x_without_tensor_binding_fails() {
        let result = resolve_workgroup([0, 1, 1], &[]);
        assert!(matches!(result, Err(ComputeError::InvalidWorkgroup(_))));
    }
}
