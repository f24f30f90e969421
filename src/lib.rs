//! vkcompute — a Vulkan compute runtime
//!
//! Ships precompiled compute shaders, binds them to typed GPU-resident
//! buffers ("tensors") and images, and submits ordered batches of
//! operations to one or more compute queues, synchronously or
//! asynchronously.
//!
//! # Architecture
//!
//! - [`Manager`]: lifetime root; owns instance, device and compute queues
//!   and hands out every other object.
//! - [`Tensor`] / [`Image`]: typed GPU memory with a primary resource and,
//!   for device-local memory, a host-coherent staging mirror.
//! - [`Algorithm`]: descriptor layout, pipeline, push and specialization
//!   constants, dispatch workgroup.
//! - [`Operation`]: recordable unit of work (host syncs, copies, barriers,
//!   dispatches) with host-side pre/post hooks.
//! - [`Sequence`]: command-buffer-backed recorder and submitter with a
//!   fence-based async lifecycle and optional timestamping.
//!
//! # Example
//!
//! ```rust,no_run
//! use vkcompute::{ConstantBlock, Manager, MemoryClass, Operation, SharedMemory};
//!
//! # fn main() -> Result<(), vkcompute::ComputeError> {
//! let mut manager = Manager::new()?;
//!
//! let a = manager.tensor(&[0.0f32, 1.0, 2.0], MemoryClass::Device)?;
//! let b = manager.tensor(&[1.0f32, 2.0, 3.0], MemoryClass::Device)?;
//! let out = manager.tensor(&[0.0f32; 3], MemoryClass::Device)?;
//! let bindings: Vec<SharedMemory> =
//!     vec![a.clone().into(), b.clone().into(), out.clone().into()];
//!
//! let algorithm = manager.algorithm(
//!     bindings.clone(),
//!     vkcompute::shaders::OP_MULT_SPIRV,
//!     [3, 1, 1],
//!     ConstantBlock::default(),
//!     ConstantBlock::default(),
//! )?;
//!
//! let mut sequence = manager.sequence(0, 0)?;
//! sequence.begin()?;
//! sequence.record(Operation::sync_to_device(bindings.clone())?)?;
//! sequence.record(Operation::algorithm_dispatch(algorithm, None))?;
//! sequence.record(Operation::sync_to_host(vec![out.clone().into()])?)?;
//! sequence.end()?;
//! sequence.eval()?;
//!
//! assert_eq!(out.typed_vector::<f32>()?, vec![0.0, 2.0, 6.0]);
//! # Ok(())
//! # }
//! ```

mod algorithm;
mod context;
mod error;
mod image;
mod manager;
mod memory;
mod operation;
mod sequence;
pub mod shaders;
mod tensor;

pub use algorithm::{Algorithm, ConstantBlock};
pub use error::{ComputeError, Result};
pub use image::Image;
pub use manager::{Manager, ManagerConfig};
pub use memory::{
    BarrierTarget, DescriptorInfo, ImageDataType, ImageTiling, ImageType, MemoryClass,
    SharedMemory, TensorDataType, TensorType,
};
pub use operation::{
    OpAlgorithmDispatch, OpImageCopy, OpImageCopyToTensor, OpMemoryBarrier, OpSyncToDevice,
    OpSyncToHost, OpTensorCopy, OpTensorCopyToImage, Operation,
};
pub use sequence::Sequence;
pub use tensor::Tensor;
