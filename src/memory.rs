//! Common contract for GPU-addressable memory objects
//!
//! Tensors (buffer-backed) and images (image-backed) share a memory class,
//! an element count / element size, host-visibility rules, and the ability
//! to record barriers and staging transfers. [`SharedMemory`] is the closed
//! sum over the two kinds so that algorithms and operations can bind them
//! interchangeably.

use std::sync::Arc;

use ash::vk;

use crate::error::{ComputeError, Result};
use crate::image::Image;
use crate::tensor::Tensor;

/// Placement and host-visibility class of a memory object.
///
/// `Device` memory pairs a device-local primary resource with a
/// host-coherent staging mirror; `Host` and `DeviceAndHost` are directly
/// mappable; `Storage` is shader-only and never touches the host.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MemoryClass {
    /// Device-local; host transfers go through the staging mirror.
    Device,
    /// Host-visible and host-coherent; directly mappable.
    Host,
    /// Device-local and host-visible, where the device supports it.
    DeviceAndHost,
    /// Device-local, shader storage only. No host transfers.
    Storage,
}

impl MemoryClass {
    /// Whether objects of this class expose a host-visible mapping.
    pub fn is_host_visible(&self) -> bool {
        !matches!(self, MemoryClass::Storage)
    }

    pub(crate) fn name(&self) -> &'static str {
        match self {
            MemoryClass::Device => "Device",
            MemoryClass::Host => "Host",
            MemoryClass::DeviceAndHost => "DeviceAndHost",
            MemoryClass::Storage => "Storage",
        }
    }
}

impl std::fmt::Display for MemoryClass {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// Element type tag for buffer-backed memory.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TensorDataType {
    Bool,
    I8,
    U8,
    I16,
    U16,
    I32,
    U32,
    F32,
    F64,
    /// Caller-defined element with an explicit byte size.
    Custom(u32),
}

impl TensorDataType {
    /// Byte size of a single element of this type.
    pub fn element_size(&self) -> u32 {
        match self {
            TensorDataType::Bool | TensorDataType::I8 | TensorDataType::U8 => 1,
            TensorDataType::I16 | TensorDataType::U16 => 2,
            TensorDataType::I32 | TensorDataType::U32 | TensorDataType::F32 => 4,
            TensorDataType::F64 => 8,
            TensorDataType::Custom(size) => *size,
        }
    }

    pub(crate) fn name(&self) -> &'static str {
        match self {
            TensorDataType::Bool => "bool",
            TensorDataType::I8 => "i8",
            TensorDataType::U8 => "u8",
            TensorDataType::I16 => "i16",
            TensorDataType::U16 => "u16",
            TensorDataType::I32 => "i32",
            TensorDataType::U32 => "u32",
            TensorDataType::F32 => "f32",
            TensorDataType::F64 => "f64",
            TensorDataType::Custom(_) => "custom",
        }
    }
}

impl std::fmt::Display for TensorDataType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// Element type tag for image-backed memory.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ImageDataType {
    S8,
    U8,
    S16,
    U16,
    S32,
    U32,
    F16,
    F32,
}

impl ImageDataType {
    /// Byte size of a single channel element of this type.
    pub fn element_size(&self) -> u32 {
        match self {
            ImageDataType::S8 | ImageDataType::U8 => 1,
            ImageDataType::S16 | ImageDataType::U16 | ImageDataType::F16 => 2,
            ImageDataType::S32 | ImageDataType::U32 | ImageDataType::F32 => 4,
        }
    }

    /// The tensor element type this image type is interchangeable with in
    /// cross-kind copies. `F16` has no tensor counterpart.
    pub fn tensor_data_type(&self) -> Option<TensorDataType> {
        match self {
            ImageDataType::S8 => Some(TensorDataType::I8),
            ImageDataType::U8 => Some(TensorDataType::U8),
            ImageDataType::S16 => Some(TensorDataType::I16),
            ImageDataType::U16 => Some(TensorDataType::U16),
            ImageDataType::S32 => Some(TensorDataType::I32),
            ImageDataType::U32 => Some(TensorDataType::U32),
            ImageDataType::F32 => Some(TensorDataType::F32),
            ImageDataType::F16 => None,
        }
    }

    pub(crate) fn name(&self) -> &'static str {
        match self {
            ImageDataType::S8 => "s8",
            ImageDataType::U8 => "u8",
            ImageDataType::S16 => "s16",
            ImageDataType::U16 => "u16",
            ImageDataType::S32 => "s32",
            ImageDataType::U32 => "u32",
            ImageDataType::F16 => "f16",
            ImageDataType::F32 => "f32",
        }
    }
}

impl std::fmt::Display for ImageDataType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// Tiling of the primary image resource.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ImageTiling {
    #[default]
    Optimal,
    Linear,
}

impl ImageTiling {
    pub(crate) fn to_vk(self) -> vk::ImageTiling {
        match self {
            ImageTiling::Optimal => vk::ImageTiling::OPTIMAL,
            ImageTiling::Linear => vk::ImageTiling::LINEAR,
        }
    }
}

/// Maps a Rust scalar to its tensor element type tag.
pub trait TensorType: Copy + 'static {
    const DATA_TYPE: TensorDataType;
}

impl TensorType for bool {
    const DATA_TYPE: TensorDataType = TensorDataType::Bool;
}
impl TensorType for i8 {
    const DATA_TYPE: TensorDataType = TensorDataType::I8;
}
impl TensorType for u8 {
    const DATA_TYPE: TensorDataType = TensorDataType::U8;
}
impl TensorType for i16 {
    const DATA_TYPE: TensorDataType = TensorDataType::I16;
}
impl TensorType for u16 {
    const DATA_TYPE: TensorDataType = TensorDataType::U16;
}
impl TensorType for i32 {
    const DATA_TYPE: TensorDataType = TensorDataType::I32;
}
impl TensorType for u32 {
    const DATA_TYPE: TensorDataType = TensorDataType::U32;
}
impl TensorType for f32 {
    const DATA_TYPE: TensorDataType = TensorDataType::F32;
}
impl TensorType for f64 {
    const DATA_TYPE: TensorDataType = TensorDataType::F64;
}

/// Maps a Rust scalar to its image element type tag.
pub trait ImageType: Copy + 'static {
    const DATA_TYPE: ImageDataType;
}

impl ImageType for i8 {
    const DATA_TYPE: ImageDataType = ImageDataType::S8;
}
impl ImageType for u8 {
    const DATA_TYPE: ImageDataType = ImageDataType::U8;
}
impl ImageType for i16 {
    const DATA_TYPE: ImageDataType = ImageDataType::S16;
}
impl ImageType for u16 {
    const DATA_TYPE: ImageDataType = ImageDataType::U16;
}
impl ImageType for i32 {
    const DATA_TYPE: ImageDataType = ImageDataType::S32;
}
impl ImageType for u32 {
    const DATA_TYPE: ImageDataType = ImageDataType::U32;
}
impl ImageType for f32 {
    const DATA_TYPE: ImageDataType = ImageDataType::F32;
}

/// Which of a memory object's two resources a barrier applies to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BarrierTarget {
    Primary,
    Staging,
}

/// Descriptor payload for a single binding, produced by a memory object
/// and assembled into `vk::WriteDescriptorSet`s by the algorithm.
#[derive(Debug, Clone, Copy)]
pub enum DescriptorInfo {
    Buffer(vk::DescriptorBufferInfo),
    Image(vk::DescriptorImageInfo),
}

/// A shared reference to either kind of memory object.
///
/// Operations and algorithms take heterogeneous lists of these; kind-specific
/// paths downcast with [`SharedMemory::as_tensor`] / [`SharedMemory::as_image`],
/// which fail with a kind mismatch instead of panicking.
#[derive(Clone)]
pub enum SharedMemory {
    Tensor(Arc<Tensor>),
    Image(Arc<Image>),
}

impl SharedMemory {
    /// Total number of elements.
    pub fn size(&self) -> u32 {
        match self {
            SharedMemory::Tensor(t) => t.size(),
            SharedMemory::Image(i) => i.size(),
        }
    }

    /// Byte size of a single element.
    pub fn element_byte_size(&self) -> u32 {
        match self {
            SharedMemory::Tensor(t) => t.element_byte_size(),
            SharedMemory::Image(i) => i.element_byte_size(),
        }
    }

    /// Total byte size (`size * element_byte_size`).
    pub fn byte_size(&self) -> u64 {
        match self {
            SharedMemory::Tensor(t) => t.byte_size(),
            SharedMemory::Image(i) => i.byte_size(),
        }
    }

    pub fn memory_class(&self) -> MemoryClass {
        match self {
            SharedMemory::Tensor(t) => t.memory_class(),
            SharedMemory::Image(i) => i.memory_class(),
        }
    }

    pub fn is_initialized(&self) -> bool {
        match self {
            SharedMemory::Tensor(t) => t.is_initialized(),
            SharedMemory::Image(i) => i.is_initialized(),
        }
    }

    /// The descriptor type this object binds as.
    pub fn descriptor_type(&self) -> vk::DescriptorType {
        match self {
            SharedMemory::Tensor(_) => vk::DescriptorType::STORAGE_BUFFER,
            SharedMemory::Image(_) => vk::DescriptorType::STORAGE_IMAGE,
        }
    }

    /// Checked downcast to the buffer-backed kind.
    pub fn as_tensor(&self) -> Result<&Arc<Tensor>> {
        match self {
            SharedMemory::Tensor(t) => Ok(t),
            SharedMemory::Image(_) => Err(ComputeError::KindMismatch(
                "expected a tensor, got an image".into(),
            )),
        }
    }

    /// Checked downcast to the image-backed kind.
    pub fn as_image(&self) -> Result<&Arc<Image>> {
        match self {
            SharedMemory::Image(i) => Ok(i),
            SharedMemory::Tensor(_) => Err(ComputeError::KindMismatch(
                "expected an image, got a tensor".into(),
            )),
        }
    }

    /// Copies the host-visible mirror out. Fails on `Storage` memory.
    pub fn raw_data(&self) -> Result<Vec<u8>> {
        match self {
            SharedMemory::Tensor(t) => t.raw_data(),
            SharedMemory::Image(i) => i.raw_data(),
        }
    }

    /// Overwrites the host-visible mirror. Fails on `Storage` memory.
    pub fn set_raw_data(&self, data: &[u8]) -> Result<()> {
        match self {
            SharedMemory::Tensor(t) => t.set_raw_data(data),
            SharedMemory::Image(i) => i.set_raw_data(data),
        }
    }

    /// Records the staging-to-primary transfer. No-op except on `Device`.
    pub fn record_copy_staging_to_primary(&self, cb: vk::CommandBuffer) {
        match self {
            SharedMemory::Tensor(t) => t.record_copy_staging_to_primary(cb),
            SharedMemory::Image(i) => i.record_copy_staging_to_primary(cb),
        }
    }

    /// Records the primary-to-staging transfer. No-op except on `Device`.
    pub fn record_copy_primary_to_staging(&self, cb: vk::CommandBuffer) {
        match self {
            SharedMemory::Tensor(t) => t.record_copy_primary_to_staging(cb),
            SharedMemory::Image(i) => i.record_copy_primary_to_staging(cb),
        }
    }

    /// Records a memory barrier on the primary resource.
    pub fn record_primary_barrier(
        &self,
        cb: vk::CommandBuffer,
        src_access: vk::AccessFlags,
        dst_access: vk::AccessFlags,
        src_stage: vk::PipelineStageFlags,
        dst_stage: vk::PipelineStageFlags,
    ) {
        match self {
            SharedMemory::Tensor(t) => {
                t.record_primary_barrier(cb, src_access, dst_access, src_stage, dst_stage)
            }
            SharedMemory::Image(i) => {
                i.record_primary_barrier(cb, src_access, dst_access, src_stage, dst_stage)
            }
        }
    }

    /// Records a memory barrier on the staging resource, if there is one.
    pub fn record_staging_barrier(
        &self,
        cb: vk::CommandBuffer,
        src_access: vk::AccessFlags,
        dst_access: vk::AccessFlags,
        src_stage: vk::PipelineStageFlags,
        dst_stage: vk::PipelineStageFlags,
    ) {
        match self {
            SharedMemory::Tensor(t) => {
                t.record_staging_barrier(cb, src_access, dst_access, src_stage, dst_stage)
            }
            SharedMemory::Image(i) => {
                i.record_staging_barrier(cb, src_access, dst_access, src_stage, dst_stage)
            }
        }
    }

    /// Produces the descriptor payload for binding this object into a set.
    pub fn descriptor_info(&self) -> Result<DescriptorInfo> {
        match self {
            SharedMemory::Tensor(t) => Ok(DescriptorInfo::Buffer(t.descriptor_buffer_info())),
            SharedMemory::Image(i) => Ok(DescriptorInfo::Image(i.descriptor_image_info()?)),
        }
    }
}

impl From<Arc<Tensor>> for SharedMemory {
    fn from(tensor: Arc<Tensor>) -> Self {
        SharedMemory::Tensor(tensor)
    }
}

impl From<Arc<Image>> for SharedMemory {
    fn from(image: Arc<Image>) -> Self {
        SharedMemory::Image(image)
    }
}

/// Find a memory type compatible with `type_filter` whose property flags
/// are a superset of `properties`. The lowest matching index wins.
pub(crate) fn find_memory_type(
    memory_properties: &vk::PhysicalDeviceMemoryProperties,
    type_filter: u32,
    properties: vk::MemoryPropertyFlags,
) -> Option<u32> {
    for i in 0..memory_properties.memory_type_count {
        if (type_filter & (1 << i)) != 0
            && (memory_properties.memory_types[i as usize].property_flags & properties)
                == properties
        {
            return Some(i);
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_element_sizes() {
        assert_eq!(TensorDataType::Bool.element_size(), 1);
        assert_eq!(TensorDataType::U16.element_size(), 2);
        assert_eq!(TensorDataType::F32.element_size(), 4);
        assert_eq!(TensorDataType::F64.element_size(), 8);
        assert_eq!(TensorDataType::Custom(12).element_size(), 12);

        assert_eq!(ImageDataType::U8.element_size(), 1);
        assert_eq!(ImageDataType::F16.element_size(), 2);
        assert_eq!(ImageDataType::F32.element_size(), 4);
    }

    #[test]
    fn test_image_tensor_type_equivalence() {
        assert_eq!(
            ImageDataType::F32.tensor_data_type(),
            Some(TensorDataType::F32)
        );
        assert_eq!(
            ImageDataType::S32.tensor_data_type(),
            Some(TensorDataType::I32)
        );
        assert_eq!(
            ImageDataType::U8.tensor_data_type(),
            Some(TensorDataType::U8)
        );
        // Half floats have no tensor counterpart
        assert_eq!(ImageDataType::F16.tensor_data_type(), None);
    }

    #[test]
    fn test_host_visibility() {
        assert!(MemoryClass::Device.is_host_visible());
        assert!(MemoryClass::Host.is_host_visible());
        assert!(MemoryClass::DeviceAndHost.is_host_visible());
        assert!(!MemoryClass::Storage.is_host_visible());
    }

    #[test]
    fn test_find_memory_type() {
        let mut props = vk::PhysicalDeviceMemoryProperties::default();
        props.memory_type_count = 2;
        props.memory_types[0].property_flags = vk::MemoryPropertyFlags::DEVICE_LOCAL;
        props.memory_types[1].property_flags =
            vk::MemoryPropertyFlags::HOST_VISIBLE | vk::MemoryPropertyFlags::HOST_COHERENT;

        let result = find_memory_type(
            &props,
            0b11,
            vk::MemoryPropertyFlags::HOST_VISIBLE | vk::MemoryPropertyFlags::HOST_COHERENT,
        );
        assert_eq!(result, Some(1));
    }

    #[test]
    fn test_find_memory_type_prefers_lowest_index() {
        let mut props = vk::PhysicalDeviceMemoryProperties::default();
        props.memory_type_count = 3;
        props.memory_types[0].property_flags = vk::MemoryPropertyFlags::DEVICE_LOCAL;
        props.memory_types[1].property_flags = vk::MemoryPropertyFlags::DEVICE_LOCAL;
        props.memory_types[2].property_flags = vk::MemoryPropertyFlags::DEVICE_LOCAL;

        // Type 0 is filtered out; of the remaining the lowest index wins.
        let result = find_memory_type(&props, 0b110, vk::MemoryPropertyFlags::DEVICE_LOCAL);
        assert_eq!(result, Some(1));
    }

    #[test]
    fn test_find_memory_type_no_match() {
        let mut props = vk::PhysicalDeviceMemoryProperties::default();
        props.memory_type_count = 1;
        props.memory_types[0].property_flags = vk::MemoryPropertyFlags::DEVICE_LOCAL;

        let result = find_memory_type(&props, 0b1, vk::MemoryPropertyFlags::HOST_VISIBLE);
        assert_eq!(result, None);
    }
}
