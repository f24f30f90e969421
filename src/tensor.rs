//! Buffer-backed GPU memory
//!
//! A [`Tensor`] is a linear typed array in a `VkBuffer`. Depending on its
//! memory class it owns a single host-visible buffer, a single device-local
//! buffer, or a device-local primary plus a host-coherent staging mirror
//! used for host transfers. Host mapping is lazy: the first host-side data
//! access maps the visible mirror and the mapping stays alive until the
//! tensor is destroyed or rebuilt.

use std::sync::{Arc, Mutex};

use ash::vk;

use crate::context::DeviceContext;
use crate::error::{ComputeError, Result};
use crate::image::Image;
use crate::memory::{find_memory_type, MemoryClass, TensorDataType, TensorType};

struct TensorState {
    /// Element count; only `rebuild` changes it.
    size: u32,
    primary_buffer: vk::Buffer,
    primary_memory: vk::DeviceMemory,
    staging_buffer: vk::Buffer,
    staging_memory: vk::DeviceMemory,
    /// Host mapping of the visible mirror; null until first access.
    mapped: *mut u8,
}

// The raw mapped pointer is only dereferenced under the state lock.
unsafe impl Send for TensorState {}

pub struct Tensor {
    ctx: Arc<DeviceContext>,
    dtype: TensorDataType,
    class: MemoryClass,
    element_size: u32,
    state: Mutex<TensorState>,
}

impl Tensor {
    /// Create a tensor of `element_count` elements of `dtype`, optionally
    /// seeded with `data` (raw bytes, host-visible classes only).
    pub(crate) fn new(
        ctx: Arc<DeviceContext>,
        data: Option<&[u8]>,
        element_count: u32,
        dtype: TensorDataType,
        class: MemoryClass,
    ) -> Result<Self> {
        ctx.ensure_alive()?;

        let element_size = dtype.element_size();
        let byte_size = element_count as u64 * element_size as u64;

        log::debug!(
            "Creating tensor: {} x {} ({} bytes, class {})",
            element_count,
            dtype,
            byte_size,
            class
        );

        if byte_size < 1 {
            return Err(ComputeError::ZeroSizedResource);
        }
        if let Some(bytes) = data {
            if class == MemoryClass::Storage {
                log::warn!("Storage tensors cannot be seeded with data; ignoring payload");
            } else if bytes.len() as u64 != byte_size {
                return Err(ComputeError::SizeMismatch(format!(
                    "payload is {} bytes but tensor holds {}",
                    bytes.len(),
                    byte_size
                )));
            }
        }

        let mut state = Self::create_resources(&ctx, byte_size, class)?;
        state.size = element_count;

        let tensor = Self {
            ctx,
            dtype,
            class,
            element_size,
            state: Mutex::new(state),
        };

        if let Some(bytes) = data {
            if class != MemoryClass::Storage {
                let mut state = tensor.state.lock().unwrap();
                let ptr = tensor.map_locked(&mut state)?;
                unsafe {
                    std::ptr::copy_nonoverlapping(bytes.as_ptr(), ptr, bytes.len());
                }
            }
        }

        Ok(tensor)
    }

    /// Allocates the primary (and, for `Device`, staging) buffer + memory.
    fn create_resources(
        ctx: &DeviceContext,
        byte_size: u64,
        class: MemoryClass,
    ) -> Result<TensorState> {
        let (primary_buffer, primary_memory) = Self::create_buffer(
            ctx,
            byte_size,
            Self::primary_usage_flags(class),
            Self::primary_property_flags(class),
        )?;

        let (staging_buffer, staging_memory) = if class == MemoryClass::Device {
            match Self::create_buffer(
                ctx,
                byte_size,
                vk::BufferUsageFlags::TRANSFER_SRC | vk::BufferUsageFlags::TRANSFER_DST,
                vk::MemoryPropertyFlags::HOST_VISIBLE | vk::MemoryPropertyFlags::HOST_COHERENT,
            ) {
                Ok(pair) => pair,
                Err(e) => {
                    // Unwind the primary allocation before reporting.
                    unsafe {
                        ctx.device().destroy_buffer(primary_buffer, None);
                        ctx.device().free_memory(primary_memory, None);
                    }
                    return Err(e);
                }
            }
        } else {
            (vk::Buffer::null(), vk::DeviceMemory::null())
        };

        Ok(TensorState {
            size: 0,
            primary_buffer,
            primary_memory,
            staging_buffer,
            staging_memory,
            mapped: std::ptr::null_mut(),
        })
    }

    fn primary_usage_flags(class: MemoryClass) -> vk::BufferUsageFlags {
        match class {
            MemoryClass::Device | MemoryClass::Host | MemoryClass::DeviceAndHost => {
                vk::BufferUsageFlags::STORAGE_BUFFER
                    | vk::BufferUsageFlags::TRANSFER_SRC
                    | vk::BufferUsageFlags::TRANSFER_DST
            }
            MemoryClass::Storage => vk::BufferUsageFlags::STORAGE_BUFFER,
        }
    }

    fn primary_property_flags(class: MemoryClass) -> vk::MemoryPropertyFlags {
        match class {
            MemoryClass::Device | MemoryClass::Storage => vk::MemoryPropertyFlags::DEVICE_LOCAL,
            MemoryClass::Host => {
                vk::MemoryPropertyFlags::HOST_VISIBLE | vk::MemoryPropertyFlags::HOST_COHERENT
            }
            MemoryClass::DeviceAndHost => {
                vk::MemoryPropertyFlags::DEVICE_LOCAL
                    | vk::MemoryPropertyFlags::HOST_VISIBLE
                    | vk::MemoryPropertyFlags::HOST_COHERENT
            }
        }
    }

    /// Creates one buffer and binds freshly allocated memory to it.
    fn create_buffer(
        ctx: &DeviceContext,
        byte_size: u64,
        usage: vk::BufferUsageFlags,
        properties: vk::MemoryPropertyFlags,
    ) -> Result<(vk::Buffer, vk::DeviceMemory)> {
        let device = ctx.device();

        let buffer_info = vk::BufferCreateInfo::default()
            .size(byte_size)
            .usage(usage)
            .sharing_mode(vk::SharingMode::EXCLUSIVE);

        let buffer = unsafe { device.create_buffer(&buffer_info, None) }
            .map_err(|e| ctx.guard(e))?;

        let requirements = unsafe { device.get_buffer_memory_requirements(buffer) };

        let memory_type_index = match find_memory_type(
            ctx.memory_properties(),
            requirements.memory_type_bits,
            properties,
        ) {
            Some(index) => index,
            None => {
                unsafe { device.destroy_buffer(buffer, None) };
                return Err(ComputeError::NoCompatibleMemoryType(format!(
                    "buffer with properties {:?}",
                    properties
                )));
            }
        };

        let alloc_info = vk::MemoryAllocateInfo::default()
            .allocation_size(requirements.size)
            .memory_type_index(memory_type_index);

        let memory = match unsafe { device.allocate_memory(&alloc_info, None) } {
            Ok(memory) => memory,
            Err(e) => {
                unsafe { device.destroy_buffer(buffer, None) };
                return Err(ctx.guard(e));
            }
        };

        if let Err(e) = unsafe { device.bind_buffer_memory(buffer, memory, 0) } {
            unsafe {
                device.destroy_buffer(buffer, None);
                device.free_memory(memory, None);
            }
            return Err(ctx.guard(e));
        }

        log::debug!(
            "Created buffer: {} bytes, usage {:?}, memory type {}",
            byte_size,
            usage,
            memory_type_index
        );

        Ok((buffer, memory))
    }

    /// Element count.
    pub fn size(&self) -> u32 {
        self.state.lock().unwrap().size
    }

    /// Byte size of one element.
    pub fn element_byte_size(&self) -> u32 {
        self.element_size
    }

    /// Total byte size of the tensor's contents.
    pub fn byte_size(&self) -> u64 {
        self.size() as u64 * self.element_size as u64
    }

    pub fn data_type(&self) -> TensorDataType {
        self.dtype
    }

    pub fn memory_class(&self) -> MemoryClass {
        self.class
    }

    pub fn is_initialized(&self) -> bool {
        let state = self.state.lock().unwrap();
        state.primary_buffer != vk::Buffer::null() && state.primary_memory != vk::DeviceMemory::null()
    }

    /// Maps the host-visible mirror if it is not already mapped.
    fn map_locked(&self, state: &mut TensorState) -> Result<*mut u8> {
        if !state.mapped.is_null() {
            return Ok(state.mapped);
        }

        let memory = match self.class {
            MemoryClass::Host | MemoryClass::DeviceAndHost => state.primary_memory,
            MemoryClass::Device => state.staging_memory,
            MemoryClass::Storage => return Err(ComputeError::HostAccessOnStorage),
        };

        let byte_size = state.size as u64 * self.element_size as u64;

        log::debug!("Mapping tensor host mirror ({} bytes)", byte_size);

        // Host-coherent memory, so no invalidation is needed between GPU
        // writes and host reads.
        let ptr = unsafe {
            self.ctx
                .device()
                .map_memory(memory, 0, byte_size, vk::MemoryMapFlags::empty())
        }
        .map_err(|e| self.ctx.guard(e))?;

        state.mapped = ptr as *mut u8;
        Ok(state.mapped)
    }

    /// Flushes and unmaps the host mirror, if mapped.
    fn unmap_locked(&self, state: &mut TensorState) {
        if state.mapped.is_null() {
            return;
        }

        let memory = match self.class {
            MemoryClass::Host | MemoryClass::DeviceAndHost => state.primary_memory,
            MemoryClass::Device => state.staging_memory,
            MemoryClass::Storage => return,
        };

        log::debug!("Unmapping tensor host mirror");

        let range = vk::MappedMemoryRange::default()
            .memory(memory)
            .offset(0)
            .size(vk::WHOLE_SIZE);
        unsafe {
            self.ctx.device().flush_mapped_memory_ranges(&[range]).ok();
            self.ctx.device().unmap_memory(memory);
        }
        state.mapped = std::ptr::null_mut();
    }

    /// Copies the host-visible contents out. Fails on `Storage` tensors.
    pub fn raw_data(&self) -> Result<Vec<u8>> {
        let mut state = self.state.lock().unwrap();
        let ptr = self.map_locked(&mut state)?;
        let byte_size = state.size as usize * self.element_size as usize;

        let mut out = vec![0u8; byte_size];
        unsafe {
            std::ptr::copy_nonoverlapping(ptr as *const u8, out.as_mut_ptr(), byte_size);
        }
        Ok(out)
    }

    /// Overwrites the host-visible contents. Fails on `Storage` tensors.
    pub fn set_raw_data(&self, data: &[u8]) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        let byte_size = state.size as usize * self.element_size as usize;
        if data.len() != byte_size {
            return Err(ComputeError::SizeMismatch(format!(
                "payload is {} bytes but tensor holds {}",
                data.len(),
                byte_size
            )));
        }
        let ptr = self.map_locked(&mut state)?;
        unsafe {
            std::ptr::copy_nonoverlapping(data.as_ptr(), ptr, byte_size);
        }
        Ok(())
    }

    /// Typed view of the host-visible contents. Owned rather than
    /// borrowed: a rebuild can invalidate the underlying mapping, so no
    /// reference into it is handed out.
    pub fn typed_data<T: TensorType>(&self) -> Result<Box<[T]>> {
        self.typed_vector().map(Vec::into_boxed_slice)
    }

    /// Typed copy of the host-visible contents.
    pub fn typed_vector<T: TensorType>(&self) -> Result<Vec<T>> {
        if T::DATA_TYPE != self.dtype {
            return Err(ComputeError::TypeMismatch(format!(
                "tensor holds {} elements, requested {}",
                self.dtype,
                T::DATA_TYPE
            )));
        }

        let mut state = self.state.lock().unwrap();
        let ptr = self.map_locked(&mut state)?;
        let count = state.size as usize;

        let mut out: Vec<T> = Vec::with_capacity(count);
        unsafe {
            std::ptr::copy_nonoverlapping(ptr as *const T, out.as_mut_ptr(), count);
            out.set_len(count);
        }
        Ok(out)
    }

    /// Typed overwrite of the host-visible contents.
    pub fn set_data<T: TensorType>(&self, data: &[T]) -> Result<()> {
        if T::DATA_TYPE != self.dtype {
            return Err(ComputeError::TypeMismatch(format!(
                "tensor holds {} elements, got {}",
                self.dtype,
                T::DATA_TYPE
            )));
        }

        let bytes = unsafe {
            std::slice::from_raw_parts(data.as_ptr() as *const u8, std::mem::size_of_val(data))
        };
        self.set_raw_data(bytes)
    }

    /// Records the staging-to-primary copy. No-op unless class is `Device`.
    pub fn record_copy_staging_to_primary(&self, cb: vk::CommandBuffer) {
        if self.class != MemoryClass::Device {
            return;
        }
        let state = self.state.lock().unwrap();
        let byte_size = state.size as u64 * self.element_size as u64;
        let region = vk::BufferCopy::default().size(byte_size);
        unsafe {
            self.ctx
                .device()
                .cmd_copy_buffer(cb, state.staging_buffer, state.primary_buffer, &[region]);
        }
        log::debug!("Recorded tensor staging->primary copy ({} bytes)", byte_size);
    }

    /// Records the primary-to-staging copy. No-op unless class is `Device`.
    pub fn record_copy_primary_to_staging(&self, cb: vk::CommandBuffer) {
        if self.class != MemoryClass::Device {
            return;
        }
        let state = self.state.lock().unwrap();
        let byte_size = state.size as u64 * self.element_size as u64;
        let region = vk::BufferCopy::default().size(byte_size);
        unsafe {
            self.ctx
                .device()
                .cmd_copy_buffer(cb, state.primary_buffer, state.staging_buffer, &[region]);
        }
        log::debug!("Recorded tensor primary->staging copy ({} bytes)", byte_size);
    }

    /// Records a primary-to-primary copy from another tensor. The copied
    /// range is the smaller of the two byte sizes.
    pub fn record_copy_from(&self, cb: vk::CommandBuffer, source: &Tensor) {
        let byte_size = self.byte_size().min(source.byte_size());
        let region = vk::BufferCopy::default().size(byte_size);
        let src = source.primary_handle();
        let state = self.state.lock().unwrap();
        unsafe {
            self.ctx
                .device()
                .cmd_copy_buffer(cb, src, state.primary_buffer, &[region]);
        }
        log::debug!("Recorded tensor<-tensor copy ({} bytes)", byte_size);
    }

    /// Records an image-to-buffer copy of the source image's full extent
    /// into this tensor's primary buffer.
    pub fn record_copy_from_image(&self, cb: vk::CommandBuffer, source: &Image) {
        source.record_transition_primary_to_general(cb);

        let region = vk::BufferImageCopy::default()
            .image_subresource(
                vk::ImageSubresourceLayers::default()
                    .aspect_mask(vk::ImageAspectFlags::COLOR)
                    .mip_level(0)
                    .base_array_layer(0)
                    .layer_count(1),
            )
            .image_extent(vk::Extent3D {
                width: source.width(),
                height: source.height(),
                depth: 1,
            });

        let src = source.primary_handle();
        let state = self.state.lock().unwrap();
        unsafe {
            self.ctx.device().cmd_copy_image_to_buffer(
                cb,
                src,
                vk::ImageLayout::GENERAL,
                state.primary_buffer,
                &[region],
            );
        }
        log::debug!(
            "Recorded tensor<-image copy ({}x{})",
            source.width(),
            source.height()
        );
    }

    /// Records a buffer memory barrier on the primary buffer.
    pub fn record_primary_barrier(
        &self,
        cb: vk::CommandBuffer,
        src_access: vk::AccessFlags,
        dst_access: vk::AccessFlags,
        src_stage: vk::PipelineStageFlags,
        dst_stage: vk::PipelineStageFlags,
    ) {
        let state = self.state.lock().unwrap();
        self.record_buffer_barrier(
            cb,
            state.primary_buffer,
            state.size,
            src_access,
            dst_access,
            src_stage,
            dst_stage,
        );
    }

    /// Records a buffer memory barrier on the staging buffer. No-op on
    /// classes without a staging mirror.
    pub fn record_staging_barrier(
        &self,
        cb: vk::CommandBuffer,
        src_access: vk::AccessFlags,
        dst_access: vk::AccessFlags,
        src_stage: vk::PipelineStageFlags,
        dst_stage: vk::PipelineStageFlags,
    ) {
        let state = self.state.lock().unwrap();
        if state.staging_buffer == vk::Buffer::null() {
            log::warn!("Staging barrier requested on a tensor without a staging mirror");
            return;
        }
        self.record_buffer_barrier(
            cb,
            state.staging_buffer,
            state.size,
            src_access,
            dst_access,
            src_stage,
            dst_stage,
        );
    }

    #[allow(clippy::too_many_arguments)]
    fn record_buffer_barrier(
        &self,
        cb: vk::CommandBuffer,
        buffer: vk::Buffer,
        size: u32,
        src_access: vk::AccessFlags,
        dst_access: vk::AccessFlags,
        src_stage: vk::PipelineStageFlags,
        dst_stage: vk::PipelineStageFlags,
    ) {
        let barrier = vk::BufferMemoryBarrier::default()
            .buffer(buffer)
            .offset(0)
            .size(size as u64 * self.element_size as u64)
            .src_access_mask(src_access)
            .dst_access_mask(dst_access)
            .src_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
            .dst_queue_family_index(vk::QUEUE_FAMILY_IGNORED);

        unsafe {
            self.ctx.device().cmd_pipeline_barrier(
                cb,
                src_stage,
                dst_stage,
                vk::DependencyFlags::empty(),
                &[],
                &[barrier],
                &[],
            );
        }
    }

    /// Descriptor payload binding the primary buffer at its whole range.
    pub(crate) fn descriptor_buffer_info(&self) -> vk::DescriptorBufferInfo {
        let state = self.state.lock().unwrap();
        vk::DescriptorBufferInfo::default()
            .buffer(state.primary_buffer)
            .offset(0)
            .range(state.size as u64 * self.element_size as u64)
    }

    pub(crate) fn primary_handle(&self) -> vk::Buffer {
        self.state.lock().unwrap().primary_buffer
    }

    /// Destroys and re-creates the GPU resources with a new element count,
    /// optionally seeding the host mirror. A failed rebuild leaves the
    /// tensor uninitialized.
    pub fn rebuild(&self, data: Option<&[u8]>, element_count: u32) -> Result<()> {
        self.ctx.ensure_alive()?;

        let byte_size = element_count as u64 * self.element_size as u64;
        if byte_size < 1 {
            return Err(ComputeError::ZeroSizedResource);
        }
        if let Some(bytes) = data {
            if self.class != MemoryClass::Storage && bytes.len() as u64 != byte_size {
                return Err(ComputeError::SizeMismatch(format!(
                    "payload is {} bytes but rebuilt tensor holds {}",
                    bytes.len(),
                    byte_size
                )));
            }
        }

        log::debug!("Rebuilding tensor with {} elements", element_count);

        let mut state = self.state.lock().unwrap();
        self.destroy_locked(&mut state);

        let mut fresh = Self::create_resources(&self.ctx, byte_size, self.class)?;
        fresh.size = element_count;
        *state = fresh;

        if let Some(bytes) = data {
            if self.class != MemoryClass::Storage {
                let ptr = self.map_locked(&mut state)?;
                unsafe {
                    std::ptr::copy_nonoverlapping(bytes.as_ptr(), ptr, bytes.len());
                }
            }
        }

        Ok(())
    }

    /// Releases all GPU handles: mapping first, then buffers, then memory.
    fn destroy_locked(&self, state: &mut TensorState) {
        self.unmap_locked(state);

        let device = self.ctx.device();
        unsafe {
            if state.primary_buffer != vk::Buffer::null() {
                device.destroy_buffer(state.primary_buffer, None);
                state.primary_buffer = vk::Buffer::null();
            }
            if state.staging_buffer != vk::Buffer::null() {
                device.destroy_buffer(state.staging_buffer, None);
                state.staging_buffer = vk::Buffer::null();
            }
            if state.primary_memory != vk::DeviceMemory::null() {
                device.free_memory(state.primary_memory, None);
                state.primary_memory = vk::DeviceMemory::null();
            }
            if state.staging_memory != vk::DeviceMemory::null() {
                device.free_memory(state.staging_memory, None);
                state.staging_memory = vk::DeviceMemory::null();
            }
        }
        state.size = 0;
    }
}

impl Drop for Tensor {
    fn drop(&mut self) {
        log::debug!("Destroying tensor (class {})", self.class);
        let mut state = match self.state.get_mut() {
            Ok(state) => std::mem::replace(
                state,
                TensorState {
                    size: 0,
                    primary_buffer: vk::Buffer::null(),
                    primary_memory: vk::DeviceMemory::null(),
                    staging_buffer: vk::Buffer::null(),
                    staging_memory: vk::DeviceMemory::null(),
                    mapped: std::ptr::null_mut(),
                },
            ),
            Err(_) => return,
        };
        self.destroy_locked(&mut state);
    }
}
