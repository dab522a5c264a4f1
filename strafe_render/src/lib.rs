//! Vulkan resource management for an id-Tech-style forward renderer.
//!
//! The crate owns device and surface setup, a descriptor-keyed graphics
//! pipeline cache, sampler and texture caches with staged uploads,
//! persistently mapped per-frame geometry streams, and the
//! acquire/record/submit/present cycle with swapchain rebuilds. All of it
//! sits behind [`Renderer`]; callers describe draws with a
//! [`PipelineState`] plus a [`DrawSubmission`] and never touch raw Vulkan
//! objects except through handles the renderer handed out.
//!
//! Shaders are precompiled SPIR-V supplied as bytes at startup; see the
//! demo crate for a complete window loop.

pub use ash;

pub mod config;
pub mod context;
pub mod error;
pub mod frame;
pub mod renderer;
pub mod samplers;
pub mod shaders;
pub mod state;
pub mod upload;

mod cache;
mod geometry;
mod pipeline;
mod swapchain;

pub use config::{ConfigBuilder, ConfigError, OverflowPolicy, RendererConfig, SurfaceCfg};
pub use context::RenderContext;
pub use error::{GfxError, GfxResult};
pub use frame::{BeginOutcome, FramePhase, PresentOutcome};
pub use pipeline::PipelineStats;
pub use renderer::{DrawSubmission, Renderer};
pub use samplers::{MagFilter, MinFilter, SamplerDesc};
pub use shaders::{read_spirv_file, ShaderPairSources, ShaderSet, ShaderSetSources};
pub use state::{CullFace, PipelineState, ShaderVariant, ShadowPhase, StateBits};
pub use upload::{mip_level_count, mip_regions, MipRegion, Texture};
