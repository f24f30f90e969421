//! Error types for the compute runtime
//!
//! Every fallible operation in the crate returns [`ComputeError`].
//! Constructors that fail part-way release any GPU handles they created
//! before returning the error.

use ash::vk;
use thiserror::Error;

/// Enumeration of all errors surfaced by the compute runtime.
#[derive(Error, Debug)]
pub enum ComputeError {
    /// Vulkan could not be loaded, or the requested physical device index
    /// does not exist / has no compute-capable queue family.
    #[error("no suitable Vulkan device: {0}")]
    DeviceNotFound(String),

    /// No memory type satisfies both the resource's requirements and the
    /// requested property flags.
    #[error("no compatible memory type: {0}")]
    NoCompatibleMemoryType(String),

    /// A requested device extension is not supported.
    #[error("device extension unavailable: {0}")]
    ExtensionUnavailable(String),

    /// Attempted to create a buffer or image with zero bytes.
    #[error("attempted to create a zero-sized GPU resource")]
    ZeroSizedResource,

    /// Linear tiling requested for a memory class that does not allow it.
    #[error("linear tiling is not supported for {class} images")]
    InvalidTilingForMemoryClass { class: String },

    /// The (data type, channel count) pair maps to no Vulkan format.
    #[error("no image format for {dtype} with {channels} channels")]
    InvalidImageFormat { dtype: String, channels: u32 },

    /// Element counts or extents of the operands disagree.
    #[error("size mismatch: {0}")]
    SizeMismatch(String),

    /// Element data types of the operands disagree.
    #[error("data type mismatch: {0}")]
    TypeMismatch(String),

    /// A tensor was passed where an image was required, or vice versa.
    #[error("memory kind mismatch: {0}")]
    KindMismatch(String),

    /// An operation was constructed with fewer memory objects than it needs.
    #[error("operation requires at least {required} memory objects, got {actual}")]
    TooFewObjects { required: usize, actual: usize },

    /// Pushed payload does not match the shape declared at pipeline build.
    #[error(
        "push constant shape mismatch: built with {built_count} x {built_size} bytes, \
         pushed {pushed_count} x {pushed_size} bytes"
    )]
    PushConstantShapeMismatch {
        built_count: u32,
        built_size: u32,
        pushed_count: u32,
        pushed_size: u32,
    },

    /// Dispatch dimensions are invalid and no default could be derived.
    #[error("invalid workgroup: {0}")]
    InvalidWorkgroup(String),

    /// The shader bytecode is not valid SPIR-V.
    #[error("invalid SPIR-V: {0}")]
    InvalidShader(String),

    /// `record` was called on a sequence that is not in the recording state.
    #[error("sequence is not recording")]
    NotRecording,

    /// `eval` was called on a sequence with no recorded command buffer.
    #[error("sequence has not been recorded")]
    NotRecorded,

    /// The sequence has already been submitted and has not completed.
    #[error("sequence is already running")]
    AlreadyRunning,

    /// The fence was not signalled within the await deadline.
    #[error("timed out waiting for fence")]
    FenceTimeout,

    /// Host data access was attempted on storage-only memory.
    #[error("host data access is not supported on storage-only memory")]
    HostAccessOnStorage,

    /// The device was lost; the owning manager is poisoned and every
    /// subsequent call returns this error.
    #[error("Vulkan device lost")]
    DeviceLost,

    /// Any other error reported by the Vulkan API.
    #[error("Vulkan API error: {0:?}")]
    Api(vk::Result),
}

impl From<vk::Result> for ComputeError {
    fn from(result: vk::Result) -> Self {
        match result {
            vk::Result::ERROR_DEVICE_LOST => ComputeError::DeviceLost,
            vk::Result::TIMEOUT => ComputeError::FenceTimeout,
            other => ComputeError::Api(other),
        }
    }
}

/// Convenience alias used across the crate.
pub type Result<T, E = ComputeError> = std::result::Result<T, E>;
