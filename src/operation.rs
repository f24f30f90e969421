//! Recordable units of work
//!
//! An [`Operation`] is something a sequence can record into its command
//! buffer. Each operation exposes three phases: `pre_eval` runs host-side
//! at record time before any commands are emitted, `record` emits the
//! device commands, and `post_eval` runs host-side after the submitted
//! work has signalled its fence. Operations never own their collaborators;
//! they keep shared references so that memory and algorithms outlive any
//! in-flight sequence that uses them.
//!
//! The set of operations is a closed sum: the sequence's operation list
//! stays monomorphic and re-recording is a plain iteration.

use std::sync::Arc;

use ash::vk;

use crate::algorithm::{Algorithm, ConstantBlock};
use crate::error::{ComputeError, Result};
use crate::image::Image;
use crate::memory::{BarrierTarget, MemoryClass, SharedMemory};
use crate::shaders;
use crate::tensor::Tensor;

pub enum Operation {
    SyncToDevice(OpSyncToDevice),
    SyncToHost(OpSyncToHost),
    TensorCopy(OpTensorCopy),
    ImageCopy(OpImageCopy),
    ImageCopyToTensor(OpImageCopyToTensor),
    TensorCopyToImage(OpTensorCopyToImage),
    MemoryBarrier(OpMemoryBarrier),
    AlgorithmDispatch(OpAlgorithmDispatch),
}

impl Operation {
    /// Stage host-written data onto the device: records the staging-to-
    /// primary transfer for every `Device`-class object; all other classes
    /// are untouched.
    pub fn sync_to_device(objects: Vec<SharedMemory>) -> Result<Self> {
        Ok(Operation::SyncToDevice(OpSyncToDevice::new(objects)?))
    }

    /// Make device-written data readable on the host: for every
    /// `Device`-class object, records a barrier, the primary-to-staging
    /// transfer, and a barrier exposing it to host reads.
    pub fn sync_to_host(objects: Vec<SharedMemory>) -> Result<Self> {
        Ok(Operation::SyncToHost(OpSyncToHost::new(objects)?))
    }

    /// Copy the first tensor into every following tensor.
    pub fn tensor_copy(objects: Vec<SharedMemory>) -> Result<Self> {
        Ok(Operation::TensorCopy(OpTensorCopy::new(objects)?))
    }

    /// Copy the first image into every following image.
    pub fn image_copy(objects: Vec<SharedMemory>) -> Result<Self> {
        Ok(Operation::ImageCopy(OpImageCopy::new(objects)?))
    }

    /// Copy an image (first object) into one or more tensors.
    pub fn image_copy_to_tensor(objects: Vec<SharedMemory>) -> Result<Self> {
        Ok(Operation::ImageCopyToTensor(OpImageCopyToTensor::new(
            objects,
        )?))
    }

    /// Copy a tensor (first object) into one or more images.
    pub fn tensor_copy_to_image(objects: Vec<SharedMemory>) -> Result<Self> {
        Ok(Operation::TensorCopyToImage(OpTensorCopyToImage::new(
            objects,
        )?))
    }

    /// Record an explicit memory barrier on each object's primary or
    /// staging resource.
    pub fn memory_barrier(
        objects: Vec<SharedMemory>,
        src_access: vk::AccessFlags,
        dst_access: vk::AccessFlags,
        src_stage: vk::PipelineStageFlags,
        dst_stage: vk::PipelineStageFlags,
        target: BarrierTarget,
    ) -> Result<Self> {
        Ok(Operation::MemoryBarrier(OpMemoryBarrier::new(
            objects, src_access, dst_access, src_stage, dst_stage, target,
        )?))
    }

    /// Dispatch an algorithm, optionally overriding its staged push
    /// constants for this dispatch only.
    pub fn algorithm_dispatch(
        algorithm: Arc<Algorithm>,
        push_override: Option<ConstantBlock>,
    ) -> Self {
        Operation::AlgorithmDispatch(OpAlgorithmDispatch::new(algorithm, push_override))
    }

    /// Element-wise multiply sample: rebuilds `algorithm` against the
    /// embedded multiply shader over three f32 tensors {a, b, out} and
    /// dispatches it. A smoke test for the whole pipeline rather than a
    /// production kernel.
    pub fn mult(objects: Vec<SharedMemory>, algorithm: Arc<Algorithm>) -> Result<Self> {
        if objects.len() != 3 {
            return Err(ComputeError::TooFewObjects {
                required: 3,
                actual: objects.len(),
            });
        }
        for object in &objects {
            let tensor = object.as_tensor()?;
            if tensor.data_type() != crate::memory::TensorDataType::F32 {
                return Err(ComputeError::TypeMismatch(format!(
                    "multiply sample expects f32 tensors, got {}",
                    tensor.data_type()
                )));
            }
        }

        algorithm.rebuild(
            objects,
            shaders::OP_MULT_SPIRV,
            [0, 0, 0],
            ConstantBlock::default(),
            ConstantBlock::default(),
        )?;

        Ok(Operation::AlgorithmDispatch(OpAlgorithmDispatch::new(
            algorithm, None,
        )))
    }

    /// Host-side hook invoked by the sequence immediately before the
    /// operation is recorded.
    pub fn pre_eval(&self, cb: vk::CommandBuffer) -> Result<()> {
        let _ = cb;
        Ok(())
    }

    /// Emits the operation's device commands.
    pub fn record(&self, cb: vk::CommandBuffer) -> Result<()> {
        match self {
            Operation::SyncToDevice(op) => op.record(cb),
            Operation::SyncToHost(op) => op.record(cb),
            Operation::TensorCopy(op) => op.record(cb),
            Operation::ImageCopy(op) => op.record(cb),
            Operation::ImageCopyToTensor(op) => op.record(cb),
            Operation::TensorCopyToImage(op) => op.record(cb),
            Operation::MemoryBarrier(op) => op.record(cb),
            Operation::AlgorithmDispatch(op) => op.record(cb),
        }
    }

    /// Host-side hook invoked by the sequence after the submitted work has
    /// signalled its fence.
    pub fn post_eval(&self, cb: vk::CommandBuffer) -> Result<()> {
        let _ = cb;
        match self {
            Operation::TensorCopy(op) => op.post_eval(),
            Operation::ImageCopy(op) => op.post_eval(),
            Operation::ImageCopyToTensor(op) => op.post_eval(),
            Operation::TensorCopyToImage(op) => op.post_eval(),
            _ => Ok(()),
        }
    }
}

fn require_at_least(objects: &[SharedMemory], required: usize) -> Result<()> {
    if objects.len() < required {
        return Err(ComputeError::TooFewObjects {
            required,
            actual: objects.len(),
        });
    }
    Ok(())
}

pub struct OpSyncToDevice {
    objects: Vec<SharedMemory>,
}

impl OpSyncToDevice {
    pub fn new(objects: Vec<SharedMemory>) -> Result<Self> {
        require_at_least(&objects, 1)?;
        Ok(Self { objects })
    }

    fn record(&self, cb: vk::CommandBuffer) -> Result<()> {
        log::debug!("Recording sync-to-device for {} objects", self.objects.len());
        for object in &self.objects {
            object.record_copy_staging_to_primary(cb);
        }
        Ok(())
    }
}

pub struct OpSyncToHost {
    objects: Vec<SharedMemory>,
}

impl OpSyncToHost {
    pub fn new(objects: Vec<SharedMemory>) -> Result<Self> {
        require_at_least(&objects, 1)?;
        Ok(Self { objects })
    }

    fn record(&self, cb: vk::CommandBuffer) -> Result<()> {
        log::debug!("Recording sync-to-host for {} objects", self.objects.len());
        for object in &self.objects {
            if object.memory_class() != MemoryClass::Device {
                continue;
            }

            object.record_primary_barrier(
                cb,
                vk::AccessFlags::SHADER_WRITE,
                vk::AccessFlags::TRANSFER_READ,
                vk::PipelineStageFlags::COMPUTE_SHADER,
                vk::PipelineStageFlags::TRANSFER,
            );

            object.record_copy_primary_to_staging(cb);

            object.record_primary_barrier(
                cb,
                vk::AccessFlags::TRANSFER_WRITE,
                vk::AccessFlags::HOST_READ,
                vk::PipelineStageFlags::TRANSFER,
                vk::PipelineStageFlags::HOST,
            );
        }
        Ok(())
    }
}

pub struct OpTensorCopy {
    tensors: Vec<Arc<Tensor>>,
}

impl OpTensorCopy {
    pub fn new(objects: Vec<SharedMemory>) -> Result<Self> {
        require_at_least(&objects, 2)?;

        let tensors = objects
            .iter()
            .map(|o| o.as_tensor().cloned())
            .collect::<Result<Vec<_>>>()?;

        let dtype = tensors[0].data_type();
        let size = tensors[0].size();
        for tensor in &tensors[1..] {
            if tensor.data_type() != dtype {
                return Err(ComputeError::TypeMismatch(format!(
                    "cannot copy {} tensor into {} tensor",
                    dtype,
                    tensor.data_type()
                )));
            }
            if tensor.size() != size {
                return Err(ComputeError::SizeMismatch(format!(
                    "cannot copy tensor of {} elements into tensor of {} elements",
                    size,
                    tensor.size()
                )));
            }
        }

        Ok(Self { tensors })
    }

    fn record(&self, cb: vk::CommandBuffer) -> Result<()> {
        for tensor in &self.tensors[1..] {
            tensor.record_copy_from(cb, &self.tensors[0]);
        }
        Ok(())
    }

    /// Propagates the source's host mirror into every host-visible target
    /// so CPU reads agree without a further sync. If the source is
    /// `Device`-class, the mirror holds whatever the last sync-to-host
    /// captured, which may lag the GPU contents.
    fn post_eval(&self) -> Result<()> {
        if !self.tensors[0].memory_class().is_host_visible() {
            return Ok(());
        }
        let data = self.tensors[0].raw_data()?;
        for tensor in &self.tensors[1..] {
            if !tensor.memory_class().is_host_visible() {
                continue;
            }
            tensor.set_raw_data(&data)?;
        }
        Ok(())
    }
}

pub struct OpImageCopy {
    images: Vec<Arc<Image>>,
}

impl OpImageCopy {
    pub fn new(objects: Vec<SharedMemory>) -> Result<Self> {
        require_at_least(&objects, 2)?;

        let images = objects
            .iter()
            .map(|o| o.as_image().cloned())
            .collect::<Result<Vec<_>>>()?;

        let dtype = images[0].data_type();
        let size = images[0].size();
        for image in &images[1..] {
            if image.data_type() != dtype {
                return Err(ComputeError::TypeMismatch(format!(
                    "cannot copy {} image into {} image",
                    dtype,
                    image.data_type()
                )));
            }
            if image.size() != size {
                return Err(ComputeError::SizeMismatch(format!(
                    "cannot copy image of {} elements into image of {} elements",
                    size,
                    image.size()
                )));
            }
        }

        Ok(Self { images })
    }

    fn record(&self, cb: vk::CommandBuffer) -> Result<()> {
        for image in &self.images[1..] {
            image.record_copy_from(cb, &self.images[0])?;
        }
        Ok(())
    }

    fn post_eval(&self) -> Result<()> {
        if !self.images[0].memory_class().is_host_visible() {
            return Ok(());
        }
        let data = self.images[0].raw_data()?;
        for image in &self.images[1..] {
            if !image.memory_class().is_host_visible() {
                continue;
            }
            image.set_raw_data(&data)?;
        }
        Ok(())
    }
}

pub struct OpImageCopyToTensor {
    image: Arc<Image>,
    tensors: Vec<Arc<Tensor>>,
}

impl OpImageCopyToTensor {
    pub fn new(objects: Vec<SharedMemory>) -> Result<Self> {
        require_at_least(&objects, 2)?;

        let image = objects[0].as_image()?.clone();
        let tensors = objects[1..]
            .iter()
            .map(|o| o.as_tensor().cloned())
            .collect::<Result<Vec<_>>>()?;

        check_cross_kind(&image, &tensors)?;

        Ok(Self { image, tensors })
    }

    fn record(&self, cb: vk::CommandBuffer) -> Result<()> {
        for tensor in &self.tensors {
            tensor.record_copy_from_image(cb, &self.image);
        }
        Ok(())
    }

    fn post_eval(&self) -> Result<()> {
        if !self.image.memory_class().is_host_visible() {
            return Ok(());
        }
        let data = self.image.raw_data()?;
        for tensor in &self.tensors {
            if !tensor.memory_class().is_host_visible() {
                continue;
            }
            tensor.set_raw_data(&data)?;
        }
        Ok(())
    }
}

pub struct OpTensorCopyToImage {
    tensor: Arc<Tensor>,
    images: Vec<Arc<Image>>,
}

impl OpTensorCopyToImage {
    pub fn new(objects: Vec<SharedMemory>) -> Result<Self> {
        require_at_least(&objects, 2)?;

        let tensor = objects[0].as_tensor()?.clone();
        let images = objects[1..]
            .iter()
            .map(|o| o.as_image().cloned())
            .collect::<Result<Vec<_>>>()?;

        for image in &images {
            check_cross_kind(image, std::slice::from_ref(&tensor))?;
        }

        Ok(Self { tensor, images })
    }

    fn record(&self, cb: vk::CommandBuffer) -> Result<()> {
        for image in &self.images {
            image.record_copy_from_tensor(cb, &self.tensor);
        }
        Ok(())
    }

    fn post_eval(&self) -> Result<()> {
        if !self.tensor.memory_class().is_host_visible() {
            return Ok(());
        }
        let data = self.tensor.raw_data()?;
        for image in &self.images {
            if !image.memory_class().is_host_visible() {
                continue;
            }
            image.set_raw_data(&data)?;
        }
        Ok(())
    }
}

/// Element type equivalence and element count checks shared by the two
/// cross-kind copies.
fn check_cross_kind(image: &Image, tensors: &[Arc<Tensor>]) -> Result<()> {
    let tensor_equivalent = image.data_type().tensor_data_type();
    for tensor in tensors {
        match tensor_equivalent {
            Some(equivalent) if equivalent == tensor.data_type() => {}
            _ => {
                return Err(ComputeError::TypeMismatch(format!(
                    "image element type {} has no equivalence with tensor element type {}",
                    image.data_type(),
                    tensor.data_type()
                )));
            }
        }
        if tensor.size() != image.size() {
            return Err(ComputeError::SizeMismatch(format!(
                "image holds {} elements, tensor holds {}",
                image.size(),
                tensor.size()
            )));
        }
    }
    Ok(())
}

pub struct OpMemoryBarrier {
    objects: Vec<SharedMemory>,
    src_access: vk::AccessFlags,
    dst_access: vk::AccessFlags,
    src_stage: vk::PipelineStageFlags,
    dst_stage: vk::PipelineStageFlags,
    target: BarrierTarget,
}

impl OpMemoryBarrier {
    pub fn new(
        objects: Vec<SharedMemory>,
        src_access: vk::AccessFlags,
        dst_access: vk::AccessFlags,
        src_stage: vk::PipelineStageFlags,
        dst_stage: vk::PipelineStageFlags,
        target: BarrierTarget,
    ) -> Result<Self> {
        require_at_least(&objects, 1)?;
        Ok(Self {
            objects,
            src_access,
            dst_access,
            src_stage,
            dst_stage,
            target,
        })
    }

    fn record(&self, cb: vk::CommandBuffer) -> Result<()> {
        for object in &self.objects {
            match self.target {
                BarrierTarget::Primary => object.record_primary_barrier(
                    cb,
                    self.src_access,
                    self.dst_access,
                    self.src_stage,
                    self.dst_stage,
                ),
                BarrierTarget::Staging => object.record_staging_barrier(
                    cb,
                    self.src_access,
                    self.dst_access,
                    self.src_stage,
                    self.dst_stage,
                ),
            }
        }
        Ok(())
    }
}

pub struct OpAlgorithmDispatch {
    algorithm: Arc<Algorithm>,
    push_override: Option<ConstantBlock>,
}

impl OpAlgorithmDispatch {
    pub fn new(algorithm: Arc<Algorithm>, push_override: Option<ConstantBlock>) -> Self {
        Self {
            algorithm,
            push_override,
        }
    }

    fn record(&self, cb: vk::CommandBuffer) -> Result<()> {
        self.algorithm.record_bind_core(cb);
        self.algorithm
            .record_bind_push(cb, self.push_override.as_ref())?;
        self.algorithm.record_dispatch(cb);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sync_requires_one_object() {
        let result = OpSyncToDevice::new(vec![]);
        assert!(matches!(
            result,
            Err(ComputeError::TooFewObjects {
                required: 1,
                actual: 0
            })
        ));

        let result = OpSyncToHost::new(vec![]);
        assert!(matches!(result, Err(ComputeError::TooFewObjects { .. })));
    }

    #[test]
    fn test_copies_require_two_objects() {
        assert!(matches!(
            OpTensorCopy::new(vec![]),
            Err(ComputeError::TooFewObjects {
                required: 2,
                actual: 0
            })
        ));
        assert!(matches!(
            OpImageCopy::new(vec![]),
            Err(ComputeError::TooFewObjects { .. })
        ));
        assert!(matches!(
            OpImageCopyToTensor::new(vec![]),
            Err(ComputeError::TooFewObjects { .. })
        ));
        assert!(matches!(
            OpTensorCopyToImage::new(vec![]),
            Err(ComputeError::TooFewObjects { .. })
        ));
    }

    #[test]
    fn test_barrier_requires_one_object() {
        let result = OpMemoryBarrier::new(
            vec![],
            vk::AccessFlags::SHADER_WRITE,
            vk::AccessFlags::SHADER_READ,
            vk::PipelineStageFlags::COMPUTE_SHADER,
            vk::PipelineStageFlags::COMPUTE_SHADER,
            BarrierTarget::Primary,
        );
        assert!(matches!(result, Err(ComputeError::TooFewObjects { .. })));
    }
}
