//! Image-backed GPU memory
//!
//! An [`Image`] is a 2D typed image of 1-4 channels. Like tensors, images
//! pair a primary resource with a host-coherent staging mirror when the
//! memory class is `Device`; the staging image always uses linear tiling.
//! Both the primary and staging images track their current layout: every
//! recorded barrier transitions whatever layout the image holds (initially
//! undefined) to `GENERAL`, the only layout this runtime ever uses.

use std::sync::{Arc, Mutex};

use ash::vk;

use crate::context::DeviceContext;
use crate::error::{ComputeError, Result};
use crate::memory::{find_memory_type, ImageDataType, ImageTiling, ImageType, MemoryClass};
use crate::tensor::Tensor;

struct ImageState {
    primary_image: vk::Image,
    primary_memory: vk::DeviceMemory,
    staging_image: vk::Image,
    staging_memory: vk::DeviceMemory,
    /// View over the primary image; created on first descriptor use.
    primary_view: vk::ImageView,
    primary_layout: vk::ImageLayout,
    staging_layout: vk::ImageLayout,
    /// Host mapping of the visible mirror; null until first access.
    mapped: *mut u8,
}

// The raw mapped pointer is only dereferenced under the state lock.
unsafe impl Send for ImageState {}

pub struct Image {
    ctx: Arc<DeviceContext>,
    dtype: ImageDataType,
    class: MemoryClass,
    width: u32,
    height: u32,
    channels: u32,
    tiling: ImageTiling,
    format: vk::Format,
    element_size: u32,
    state: Mutex<ImageState>,
}

impl Image {
    /// Create a `width` x `height` image with `channels` channels of
    /// `dtype`, optionally seeded with `data` (raw bytes, host-visible
    /// classes only).
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        ctx: Arc<DeviceContext>,
        data: Option<&[u8]>,
        width: u32,
        height: u32,
        channels: u32,
        dtype: ImageDataType,
        class: MemoryClass,
        tiling: ImageTiling,
    ) -> Result<Self> {
        ctx.ensure_alive()?;

        log::debug!(
            "Creating image: {}x{}x{} {} (class {}, tiling {:?})",
            width,
            height,
            channels,
            dtype,
            class,
            tiling
        );

        let format = Self::format_for(dtype, channels);
        if format == vk::Format::UNDEFINED {
            return Err(ComputeError::InvalidImageFormat {
                dtype: dtype.to_string(),
                channels,
            });
        }

        if tiling == ImageTiling::Linear
            && !matches!(class, MemoryClass::Device | MemoryClass::Storage)
        {
            return Err(ComputeError::InvalidTilingForMemoryClass {
                class: class.to_string(),
            });
        }

        let element_size = dtype.element_size();
        let byte_size = width as u64 * height as u64 * channels as u64 * element_size as u64;
        if byte_size < 1 {
            return Err(ComputeError::ZeroSizedResource);
        }
        if let Some(bytes) = data {
            if class == MemoryClass::Storage {
                log::warn!("Storage images cannot be seeded with data; ignoring payload");
            } else if bytes.len() as u64 != byte_size {
                return Err(ComputeError::SizeMismatch(format!(
                    "payload is {} bytes but image holds {}",
                    bytes.len(),
                    byte_size
                )));
            }
        }

        let image = Self {
            ctx,
            dtype,
            class,
            width,
            height,
            channels,
            tiling,
            format,
            element_size,
            state: Mutex::new(ImageState {
                primary_image: vk::Image::null(),
                primary_memory: vk::DeviceMemory::null(),
                staging_image: vk::Image::null(),
                staging_memory: vk::DeviceMemory::null(),
                primary_view: vk::ImageView::null(),
                primary_layout: vk::ImageLayout::UNDEFINED,
                staging_layout: vk::ImageLayout::UNDEFINED,
                mapped: std::ptr::null_mut(),
            }),
        };

        {
            let mut state = image.state.lock().unwrap();
            image.create_resources_locked(&mut state)?;

            if let Some(bytes) = data {
                if class != MemoryClass::Storage {
                    let ptr = image.map_locked(&mut state)?;
                    unsafe {
                        std::ptr::copy_nonoverlapping(bytes.as_ptr(), ptr, bytes.len());
                    }
                }
            }
        }

        Ok(image)
    }

    /// Allocates the primary (and, for `Device`, staging) image + memory.
    fn create_resources_locked(&self, state: &mut ImageState) -> Result<()> {
        let (primary_image, primary_memory) = self.create_image(
            self.primary_usage_flags(),
            Self::primary_property_flags(self.class),
            self.tiling.to_vk(),
        )?;

        state.primary_image = primary_image;
        state.primary_memory = primary_memory;
        state.primary_layout = vk::ImageLayout::UNDEFINED;

        if self.class == MemoryClass::Device {
            // The staging mirror is always linear so the host mapping is
            // byte-addressable.
            match self.create_image(
                vk::ImageUsageFlags::TRANSFER_SRC | vk::ImageUsageFlags::TRANSFER_DST,
                vk::MemoryPropertyFlags::HOST_VISIBLE | vk::MemoryPropertyFlags::HOST_COHERENT,
                vk::ImageTiling::LINEAR,
            ) {
                Ok((staging_image, staging_memory)) => {
                    state.staging_image = staging_image;
                    state.staging_memory = staging_memory;
                    state.staging_layout = vk::ImageLayout::UNDEFINED;
                }
                Err(e) => {
                    self.destroy_locked(state);
                    return Err(e);
                }
            }
        }

        Ok(())
    }

    fn primary_usage_flags(&self) -> vk::ImageUsageFlags {
        match self.class {
            MemoryClass::Device | MemoryClass::Host | MemoryClass::DeviceAndHost => {
                vk::ImageUsageFlags::STORAGE
                    | vk::ImageUsageFlags::TRANSFER_SRC
                    | vk::ImageUsageFlags::TRANSFER_DST
            }
            MemoryClass::Storage => vk::ImageUsageFlags::STORAGE,
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

    /// Creates one 2D image and binds freshly allocated memory to it.
    fn create_image(
        &self,
        usage: vk::ImageUsageFlags,
        properties: vk::MemoryPropertyFlags,
        tiling: vk::ImageTiling,
    ) -> Result<(vk::Image, vk::DeviceMemory)> {
        let device = self.ctx.device();

        let image_info = vk::ImageCreateInfo::default()
            .image_type(vk::ImageType::TYPE_2D)
            .format(self.format)
            .extent(vk::Extent3D {
                width: self.width,
                height: self.height,
                depth: 1,
            })
            .mip_levels(1)
            .array_layers(1)
            .samples(vk::SampleCountFlags::TYPE_1)
            .tiling(tiling)
            .usage(usage)
            .sharing_mode(vk::SharingMode::EXCLUSIVE)
            .initial_layout(vk::ImageLayout::UNDEFINED);

        let image = unsafe { device.create_image(&image_info, None) }
            .map_err(|e| self.ctx.guard(e))?;

        let requirements = unsafe { device.get_image_memory_requirements(image) };

        let memory_type_index = match find_memory_type(
            self.ctx.memory_properties(),
            requirements.memory_type_bits,
            properties,
        ) {
            Some(index) => index,
            None => {
                unsafe { device.destroy_image(image, None) };
                return Err(ComputeError::NoCompatibleMemoryType(format!(
                    "image with properties {:?}",
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
                unsafe { device.destroy_image(image, None) };
                return Err(self.ctx.guard(e));
            }
        };

        if let Err(e) = unsafe { device.bind_image_memory(image, memory, 0) } {
            unsafe {
                device.destroy_image(image, None);
                device.free_memory(memory, None);
            }
            return Err(self.ctx.guard(e));
        }

        log::debug!(
            "Created image: {:?} {}x{}, usage {:?}, memory type {}",
            self.format,
            self.width,
            self.height,
            usage,
            memory_type_index
        );

        Ok((image, memory))
    }

    /// (element type, channel count) -> concrete Vulkan format.
    pub(crate) fn format_for(dtype: ImageDataType, channels: u32) -> vk::Format {
        use vk::Format as F;
        match dtype {
            ImageDataType::S8 => match channels {
                1 => F::R8_SINT,
                2 => F::R8G8_SINT,
                3 => F::R8G8B8_SINT,
                4 => F::R8G8B8A8_SINT,
                _ => F::UNDEFINED,
            },
            ImageDataType::U8 => match channels {
                1 => F::R8_UINT,
                2 => F::R8G8_UINT,
                3 => F::R8G8B8_UINT,
                4 => F::R8G8B8A8_UINT,
                _ => F::UNDEFINED,
            },
            ImageDataType::S16 => match channels {
                1 => F::R16_SINT,
                2 => F::R16G16_SINT,
                3 => F::R16G16B16_SINT,
                4 => F::R16G16B16A16_SINT,
                _ => F::UNDEFINED,
            },
            ImageDataType::U16 => match channels {
                1 => F::R16_UINT,
                2 => F::R16G16_UINT,
                3 => F::R16G16B16_UINT,
                4 => F::R16G16B16A16_UINT,
                _ => F::UNDEFINED,
            },
            ImageDataType::S32 => match channels {
                1 => F::R32_SINT,
                2 => F::R32G32_SINT,
                3 => F::R32G32B32_SINT,
                4 => F::R32G32B32A32_SINT,
                _ => F::UNDEFINED,
            },
            ImageDataType::U32 => match channels {
                1 => F::R32_UINT,
                2 => F::R32G32_UINT,
                3 => F::R32G32B32_UINT,
                4 => F::R32G32B32A32_UINT,
                _ => F::UNDEFINED,
            },
            ImageDataType::F16 => match channels {
                1 => F::R16_SFLOAT,
                2 => F::R16G16_SFLOAT,
                3 => F::R16G16B16_SFLOAT,
                4 => F::R16G16B16A16_SFLOAT,
                _ => F::UNDEFINED,
            },
            ImageDataType::F32 => match channels {
                1 => F::R32_SFLOAT,
                2 => F::R32G32_SFLOAT,
                3 => F::R32G32B32_SFLOAT,
                4 => F::R32G32B32A32_SFLOAT,
                _ => F::UNDEFINED,
            },
        }
    }

    /// Total number of elements: width * height * channels.
    pub fn size(&self) -> u32 {
        self.width * self.height * self.channels
    }

    /// Byte size of one channel element.
    pub fn element_byte_size(&self) -> u32 {
        self.element_size
    }

    /// Total byte size of the image contents.
    pub fn byte_size(&self) -> u64 {
        self.size() as u64 * self.element_size as u64
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    pub fn channels(&self) -> u32 {
        self.channels
    }

    pub fn data_type(&self) -> ImageDataType {
        self.dtype
    }

    pub fn tiling(&self) -> ImageTiling {
        self.tiling
    }

    pub fn memory_class(&self) -> MemoryClass {
        self.class
    }

    pub fn is_initialized(&self) -> bool {
        let state = self.state.lock().unwrap();
        state.primary_image != vk::Image::null() && state.primary_memory != vk::DeviceMemory::null()
    }

    fn map_locked(&self, state: &mut ImageState) -> Result<*mut u8> {
        if !state.mapped.is_null() {
            return Ok(state.mapped);
        }

        let memory = match self.class {
            MemoryClass::Host | MemoryClass::DeviceAndHost => state.primary_memory,
            MemoryClass::Device => state.staging_memory,
            MemoryClass::Storage => return Err(ComputeError::HostAccessOnStorage),
        };

        log::debug!("Mapping image host mirror ({} bytes)", self.byte_size());

        // Host-coherent memory, so no invalidation is needed between GPU
        // writes and host reads.
        let ptr = unsafe {
            self.ctx
                .device()
                .map_memory(memory, 0, self.byte_size(), vk::MemoryMapFlags::empty())
        }
        .map_err(|e| self.ctx.guard(e))?;

        state.mapped = ptr as *mut u8;
        Ok(state.mapped)
    }

    fn unmap_locked(&self, state: &mut ImageState) {
        if state.mapped.is_null() {
            return;
        }

        let memory = match self.class {
            MemoryClass::Host | MemoryClass::DeviceAndHost => state.primary_memory,
            MemoryClass::Device => state.staging_memory,
            MemoryClass::Storage => return,
        };

        log::debug!("Unmapping image host mirror");

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

    /// Copies the host-visible contents out. Fails on `Storage` images.
    pub fn raw_data(&self) -> Result<Vec<u8>> {
        let mut state = self.state.lock().unwrap();
        let ptr = self.map_locked(&mut state)?;
        let byte_size = self.byte_size() as usize;

        let mut out = vec![0u8; byte_size];
        unsafe {
            std::ptr::copy_nonoverlapping(ptr as *const u8, out.as_mut_ptr(), byte_size);
        }
        Ok(out)
    }

    /// Overwrites the host-visible contents. Fails on `Storage` images.
    pub fn set_raw_data(&self, data: &[u8]) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        if data.len() as u64 != self.byte_size() {
            return Err(ComputeError::SizeMismatch(format!(
                "payload is {} bytes but image holds {}",
                data.len(),
                self.byte_size()
            )));
        }
        let ptr = self.map_locked(&mut state)?;
        unsafe {
            std::ptr::copy_nonoverlapping(data.as_ptr(), ptr, data.len());
        }
        Ok(())
    }

    /// Typed view of the host-visible contents. Owned rather than
    /// borrowed: a rebuild can invalidate the underlying mapping, so no
    /// reference into it is handed out.
    pub fn typed_data<T: ImageType>(&self) -> Result<Box<[T]>> {
        self.typed_vector().map(Vec::into_boxed_slice)
    }

    /// Typed copy of the host-visible contents.
    pub fn typed_vector<T: ImageType>(&self) -> Result<Vec<T>> {
        if T::DATA_TYPE != self.dtype {
            return Err(ComputeError::TypeMismatch(format!(
                "image holds {} elements, requested {}",
                self.dtype,
                T::DATA_TYPE
            )));
        }

        let mut state = self.state.lock().unwrap();
        let ptr = self.map_locked(&mut state)?;
        let count = self.size() as usize;

        let mut out: Vec<T> = Vec::with_capacity(count);
        unsafe {
            std::ptr::copy_nonoverlapping(ptr as *const T, out.as_mut_ptr(), count);
            out.set_len(count);
        }
        Ok(out)
    }

    /// Typed overwrite of the host-visible contents.
    pub fn set_data<T: ImageType>(&self, data: &[T]) -> Result<()> {
        if T::DATA_TYPE != self.dtype {
            return Err(ComputeError::TypeMismatch(format!(
                "image holds {} elements, got {}",
                self.dtype,
                T::DATA_TYPE
            )));
        }

        let bytes = unsafe {
            std::slice::from_raw_parts(data.as_ptr() as *const u8, std::mem::size_of_val(data))
        };
        self.set_raw_data(bytes)
    }

    /// Records the staging-to-primary image copy, transitioning either side
    /// to `GENERAL` first if still undefined. No-op unless class is `Device`.
    pub fn record_copy_staging_to_primary(&self, cb: vk::CommandBuffer) {
        if self.class != MemoryClass::Device {
            return;
        }

        let mut state = self.state.lock().unwrap();
        self.transition_to_general_locked(cb, &mut state, true);
        self.transition_to_general_locked(cb, &mut state, false);

        unsafe {
            self.ctx.device().cmd_copy_image(
                cb,
                state.staging_image,
                vk::ImageLayout::GENERAL,
                state.primary_image,
                vk::ImageLayout::GENERAL,
                &[self.full_copy_region()],
            );
        }
        log::debug!(
            "Recorded image staging->primary copy ({}x{})",
            self.width,
            self.height
        );
    }

    /// Records the primary-to-staging image copy, transitioning either side
    /// to `GENERAL` first if still undefined. No-op unless class is `Device`.
    pub fn record_copy_primary_to_staging(&self, cb: vk::CommandBuffer) {
        if self.class != MemoryClass::Device {
            return;
        }

        let mut state = self.state.lock().unwrap();
        self.transition_to_general_locked(cb, &mut state, true);
        self.transition_to_general_locked(cb, &mut state, false);

        unsafe {
            self.ctx.device().cmd_copy_image(
                cb,
                state.primary_image,
                vk::ImageLayout::GENERAL,
                state.staging_image,
                vk::ImageLayout::GENERAL,
                &[self.full_copy_region()],
            );
        }
        log::debug!(
            "Recorded image primary->staging copy ({}x{})",
            self.width,
            self.height
        );
    }

    /// Records a primary-to-primary copy from another image. The two
    /// extents must match.
    pub fn record_copy_from(&self, cb: vk::CommandBuffer, source: &Image) -> Result<()> {
        if source.width != self.width || source.height != self.height {
            return Err(ComputeError::SizeMismatch(format!(
                "cannot copy {}x{} image into {}x{} image",
                source.width, source.height, self.width, self.height
            )));
        }

        source.record_transition_primary_to_general(cb);
        let src = source.primary_handle();

        let mut state = self.state.lock().unwrap();
        self.transition_to_general_locked(cb, &mut state, false);

        unsafe {
            self.ctx.device().cmd_copy_image(
                cb,
                src,
                vk::ImageLayout::GENERAL,
                state.primary_image,
                vk::ImageLayout::GENERAL,
                &[self.full_copy_region()],
            );
        }
        log::debug!(
            "Recorded image<-image copy ({}x{})",
            self.width,
            self.height
        );
        Ok(())
    }

    /// Records a buffer-to-image copy of this image's full extent from the
    /// source tensor's primary buffer.
    pub fn record_copy_from_tensor(&self, cb: vk::CommandBuffer, source: &Tensor) {
        let src = source.primary_handle();

        let mut state = self.state.lock().unwrap();
        self.transition_to_general_locked(cb, &mut state, false);

        let region = vk::BufferImageCopy::default()
            .image_subresource(
                vk::ImageSubresourceLayers::default()
                    .aspect_mask(vk::ImageAspectFlags::COLOR)
                    .mip_level(0)
                    .base_array_layer(0)
                    .layer_count(1),
            )
            .image_extent(vk::Extent3D {
                width: self.width,
                height: self.height,
                depth: 1,
            });

        unsafe {
            self.ctx.device().cmd_copy_buffer_to_image(
                cb,
                src,
                state.primary_image,
                vk::ImageLayout::GENERAL,
                &[region],
            );
        }
        log::debug!(
            "Recorded image<-tensor copy ({}x{})",
            self.width,
            self.height
        );
    }

    fn full_copy_region(&self) -> vk::ImageCopy {
        let layers = vk::ImageSubresourceLayers::default()
            .aspect_mask(vk::ImageAspectFlags::COLOR)
            .mip_level(0)
            .base_array_layer(0)
            .layer_count(1);
        vk::ImageCopy::default()
            .src_subresource(layers)
            .dst_subresource(layers)
            .extent(vk::Extent3D {
                width: self.width,
                height: self.height,
                depth: 1,
            })
    }

    /// Records an image memory barrier on the primary image. The barrier
    /// transitions the tracked layout to `GENERAL`.
    pub fn record_primary_barrier(
        &self,
        cb: vk::CommandBuffer,
        src_access: vk::AccessFlags,
        dst_access: vk::AccessFlags,
        src_stage: vk::PipelineStageFlags,
        dst_stage: vk::PipelineStageFlags,
    ) {
        let mut state = self.state.lock().unwrap();
        let old_layout = state.primary_layout;
        let image = state.primary_image;
        self.record_image_barrier(
            cb, image, old_layout, src_access, dst_access, src_stage, dst_stage,
        );
        state.primary_layout = vk::ImageLayout::GENERAL;
    }

    /// Records an image memory barrier on the staging image. No-op on
    /// classes without a staging mirror.
    pub fn record_staging_barrier(
        &self,
        cb: vk::CommandBuffer,
        src_access: vk::AccessFlags,
        dst_access: vk::AccessFlags,
        src_stage: vk::PipelineStageFlags,
        dst_stage: vk::PipelineStageFlags,
    ) {
        let mut state = self.state.lock().unwrap();
        if state.staging_image == vk::Image::null() {
            log::warn!("Staging barrier requested on an image without a staging mirror");
            return;
        }
        let old_layout = state.staging_layout;
        let image = state.staging_image;
        self.record_image_barrier(
            cb, image, old_layout, src_access, dst_access, src_stage, dst_stage,
        );
        state.staging_layout = vk::ImageLayout::GENERAL;
    }

    /// Transitions the primary image to `GENERAL` if its layout is still
    /// undefined. Copies and descriptor access assume `GENERAL`.
    pub(crate) fn record_transition_primary_to_general(&self, cb: vk::CommandBuffer) {
        let mut state = self.state.lock().unwrap();
        self.transition_to_general_locked(cb, &mut state, false);
    }

    fn transition_to_general_locked(
        &self,
        cb: vk::CommandBuffer,
        state: &mut ImageState,
        staging: bool,
    ) {
        let (image, layout) = if staging {
            (state.staging_image, state.staging_layout)
        } else {
            (state.primary_image, state.primary_layout)
        };

        if layout != vk::ImageLayout::UNDEFINED || image == vk::Image::null() {
            return;
        }

        self.record_image_barrier(
            cb,
            image,
            vk::ImageLayout::UNDEFINED,
            vk::AccessFlags::empty(),
            vk::AccessFlags::TRANSFER_READ | vk::AccessFlags::TRANSFER_WRITE,
            vk::PipelineStageFlags::TOP_OF_PIPE,
            vk::PipelineStageFlags::TRANSFER,
        );

        if staging {
            state.staging_layout = vk::ImageLayout::GENERAL;
        } else {
            state.primary_layout = vk::ImageLayout::GENERAL;
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn record_image_barrier(
        &self,
        cb: vk::CommandBuffer,
        image: vk::Image,
        old_layout: vk::ImageLayout,
        src_access: vk::AccessFlags,
        dst_access: vk::AccessFlags,
        src_stage: vk::PipelineStageFlags,
        dst_stage: vk::PipelineStageFlags,
    ) {
        let barrier = vk::ImageMemoryBarrier::default()
            .image(image)
            .old_layout(old_layout)
            .new_layout(vk::ImageLayout::GENERAL)
            .src_access_mask(src_access)
            .dst_access_mask(dst_access)
            .src_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
            .dst_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
            .subresource_range(
                vk::ImageSubresourceRange::default()
                    .aspect_mask(vk::ImageAspectFlags::COLOR)
                    .base_mip_level(0)
                    .level_count(1)
                    .base_array_layer(0)
                    .layer_count(1),
            );

        unsafe {
            self.ctx.device().cmd_pipeline_barrier(
                cb,
                src_stage,
                dst_stage,
                vk::DependencyFlags::empty(),
                &[],
                &[],
                &[barrier],
            );
        }
    }

    /// Descriptor payload binding the primary image as a storage image.
    /// Creates the image view on first use.
    pub(crate) fn descriptor_image_info(&self) -> Result<vk::DescriptorImageInfo> {
        let mut state = self.state.lock().unwrap();

        if state.primary_view == vk::ImageView::null() {
            let view_info = vk::ImageViewCreateInfo::default()
                .image(state.primary_image)
                .view_type(vk::ImageViewType::TYPE_2D)
                .format(self.format)
                .subresource_range(
                    vk::ImageSubresourceRange::default()
                        .aspect_mask(vk::ImageAspectFlags::COLOR)
                        .base_mip_level(0)
                        .level_count(1)
                        .base_array_layer(0)
                        .layer_count(1),
                );

            state.primary_view = unsafe { self.ctx.device().create_image_view(&view_info, None) }
                .map_err(|e| self.ctx.guard(e))?;
            log::debug!("Created image view ({:?})", self.format);
        }

        Ok(vk::DescriptorImageInfo::default()
            .image_view(state.primary_view)
            .image_layout(vk::ImageLayout::GENERAL))
    }

    pub(crate) fn primary_handle(&self) -> vk::Image {
        self.state.lock().unwrap().primary_image
    }

    /// Destroys and re-creates the GPU resources with the same geometry,
    /// optionally seeding the host mirror. A failed rebuild leaves the
    /// image uninitialized.
    pub fn rebuild(&self, data: Option<&[u8]>) -> Result<()> {
        self.ctx.ensure_alive()?;

        if let Some(bytes) = data {
            if self.class != MemoryClass::Storage && bytes.len() as u64 != self.byte_size() {
                return Err(ComputeError::SizeMismatch(format!(
                    "payload is {} bytes but image holds {}",
                    bytes.len(),
                    self.byte_size()
                )));
            }
        }

        log::debug!(
            "Rebuilding image ({}x{}x{})",
            self.width,
            self.height,
            self.channels
        );

        let mut state = self.state.lock().unwrap();
        self.destroy_locked(&mut state);
        self.create_resources_locked(&mut state)?;

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

    /// Releases all GPU handles: mapping, then view, then images, then
    /// memory.
    fn destroy_locked(&self, state: &mut ImageState) {
        self.unmap_locked(state);

        let device = self.ctx.device();
        unsafe {
            if state.primary_view != vk::ImageView::null() {
                device.destroy_image_view(state.primary_view, None);
                state.primary_view = vk::ImageView::null();
            }
            if state.primary_image != vk::Image::null() {
                device.destroy_image(state.primary_image, None);
                state.primary_image = vk::Image::null();
            }
            if state.staging_image != vk::Image::null() {
                device.destroy_image(state.staging_image, None);
                state.staging_image = vk::Image::null();
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
        state.primary_layout = vk::ImageLayout::UNDEFINED;
        state.staging_layout = vk::ImageLayout::UNDEFINED;
    }
}

impl Drop for Image {
    fn drop(&mut self) {
        log::debug!("Destroying image (class {})", self.class);
        let state = match self.state.get_mut() {
            Ok(state) => state,
            Err(_) => return,
        };
        let mut taken = ImageState {
            primary_image: std::mem::replace(&mut state.primary_image, vk::Image::null()),
            primary_memory: std::mem::replace(&mut state.primary_memory, vk::DeviceMemory::null()),
            staging_image: std::mem::replace(&mut state.staging_image, vk::Image::null()),
            staging_memory: std::mem::replace(&mut state.staging_memory, vk::DeviceMemory::null()),
            primary_view: std::mem::replace(&mut state.primary_view, vk::ImageView::null()),
            primary_layout: state.primary_layout,
            staging_layout: state.staging_layout,
            mapped: std::mem::replace(&mut state.mapped, std::ptr::null_mut()),
        };
        self.destroy_locked(&mut taken);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_format_table() {
        assert_eq!(
            Image::format_for(ImageDataType::F32, 1),
            vk::Format::R32_SFLOAT
        );
        assert_eq!(
            Image::format_for(ImageDataType::F32, 4),
            vk::Format::R32G32B32A32_SFLOAT
        );
        assert_eq!(Image::format_for(ImageDataType::U8, 2), vk::Format::R8G8_UINT);
        assert_eq!(
            Image::format_for(ImageDataType::S16, 3),
            vk::Format::R16G16B16_SINT
        );
        assert_eq!(
            Image::format_for(ImageDataType::F16, 4),
            vk::Format::R16G16B16A16_SFLOAT
        );
    }

    #[test]
    fn test_format_table_rejects_bad_channel_counts() {
        assert_eq!(Image::format_for(ImageDataType::F32, 0), vk::Format::UNDEFINED);
        assert_eq!(Image::format_for(ImageDataType::U8, 5), vk::Format::UNDEFINED);
    }
}
