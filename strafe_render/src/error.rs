//! Error type shared across the renderer.
//!
//! Every Vulkan call failure is reported with the operation that failed and
//! the raw result code. Apart from the swapchain-rebuild path (which is
//! signalled through return values, not errors), callers are expected to
//! treat any `GfxError` as fatal and tear the renderer down.

use ash::vk;
use thiserror::Error;

use crate::config::ConfigError;
use crate::frame::FramePhase;

pub type GfxResult<T> = Result<T, GfxError>;

#[derive(Debug, Error)]
pub enum GfxError {
    /// A Vulkan entry point returned an error code.
    #[error("{op}: {result:?}")]
    Api { op: &'static str, result: vk::Result },

    /// No physical device / queue family satisfied the requirements.
    #[error("no suitable GPU: {0}")]
    NoDevice(String),

    /// No memory type matches the requested type bits and property flags.
    #[error("no memory type for bits {type_bits:#x} with {flags:?}")]
    NoMemoryType {
        type_bits: u32,
        flags: vk::MemoryPropertyFlags,
    },

    /// The surface reported no usable formats.
    #[error("surface offers no formats")]
    NoSurfaceFormat,

    /// None of the depth-stencil format candidates is attachable.
    #[error("no supported depth-stencil format")]
    NoDepthFormat,

    /// A lazily filled cache hit its configured entry limit.
    #[error("{cache} cache full at {capacity} entries")]
    CacheFull {
        cache: &'static str,
        capacity: usize,
    },

    /// A per-frame geometry stream ran out of buffer space.
    #[error("{stream} stream overflow: {needed} bytes requested, {remaining} of {capacity} left")]
    StreamOverflow {
        stream: &'static str,
        needed: u64,
        remaining: u64,
        capacity: u64,
    },

    /// Packed render-state bits contain an undefined combination.
    #[error("invalid state bits {bits:#010x}: {reason}")]
    InvalidStateBits { bits: u32, reason: &'static str },

    /// The upload payload does not match the computed mip-chain size.
    #[error("upload payload is {got} bytes, mip chain needs {expected}")]
    UploadSize { expected: u64, got: u64 },

    /// A draw submission violated the stream or texture contract.
    #[error("draw submission: {0}")]
    Draw(&'static str),

    /// The previous frame's fence never signalled within the timeout.
    #[error("frame fence wait exceeded {waited_ms} ms, device assumed lost")]
    DeviceLost { waited_ms: u64 },

    /// A frame-cycle call arrived in the wrong phase.
    #[error("frame cycle: {action} while {phase:?}")]
    FramePhase {
        action: &'static str,
        phase: FramePhase,
    },

    /// Shader byte stream could not be turned into SPIR-V words.
    #[error("shader load: {0}")]
    ShaderLoad(String),

    #[error("shader io: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Config(#[from] ConfigError),
}

impl GfxError {
    pub(crate) fn api(op: &'static str, result: vk::Result) -> Self {
        GfxError::Api { op, result }
    }
}
