//! Renderer configuration and validation.
//!
//! A `RendererConfig` is built once, validated, and handed to
//! [`crate::renderer::Renderer::new`]. Budgets here are hard caps: the
//! geometry streams and the two object caches never grow past them, and
//! overflow handling follows [`OverflowPolicy`].

use std::time::Duration;

use thiserror::Error;

#[derive(Clone, Debug)]
pub struct SurfaceCfg {
    pub width: u32,
    pub height: u32,
    pub vsync: bool,
}

/// What a cache does when a miss would push it past its entry limit.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum OverflowPolicy {
    /// Fail the resolve with [`crate::error::GfxError::CacheFull`].
    Fatal,
    /// Log a warning and keep creating entries.
    Warn,
}

#[derive(Clone, Debug)]
pub struct RendererConfig {
    pub app: &'static str,
    pub surface: SurfaceCfg,
    /// Pick a specific adapter from the enumeration order instead of the
    /// first one with graphics + present support.
    pub adapter_index: Option<usize>,
    pub max_pipelines: usize,
    pub max_samplers: usize,
    pub cache_overflow: OverflowPolicy,
    /// Capacity of the per-frame vertex streams, in vertices.
    pub max_vertices: u32,
    /// Capacity of the per-frame index stream, in indices.
    pub max_indices: u32,
    /// Upper bound on waiting for the previous frame's fence.
    pub fence_timeout: Duration,
}

pub fn validate_config(cfg: &RendererConfig) -> Result<(), ConfigError> {
    if cfg.surface.width == 0 || cfg.surface.height == 0 {
        return Err(ConfigError::ZeroSurfaceExtent);
    }
    if cfg.max_vertices == 0 || cfg.max_indices == 0 {
        return Err(ConfigError::ZeroGeometryBudget);
    }
    if cfg.max_pipelines == 0 || cfg.max_samplers == 0 {
        return Err(ConfigError::ZeroCacheLimit);
    }
    if cfg.fence_timeout.is_zero() {
        return Err(ConfigError::ZeroFenceTimeout);
    }
    Ok(())
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    #[error("surface extent must be non-zero")]
    ZeroSurfaceExtent,
    #[error("geometry budgets must be non-zero")]
    ZeroGeometryBudget,
    #[error("cache limits must be non-zero")]
    ZeroCacheLimit,
    #[error("fence timeout must be non-zero")]
    ZeroFenceTimeout,
}

/// A small, chainable builder to produce a validated RendererConfig.
pub struct ConfigBuilder {
    app: Option<&'static str>,
    surface: Option<SurfaceCfg>,
    adapter_index: Option<usize>,
    max_pipelines: usize,
    max_samplers: usize,
    cache_overflow: OverflowPolicy,
    max_vertices: u32,
    max_indices: u32,
    fence_timeout: Duration,
}

impl ConfigBuilder {
    pub fn new() -> Self {
        Self {
            app: None,
            surface: None,
            adapter_index: None,
            max_pipelines: 1024,
            max_samplers: 32,
            cache_overflow: OverflowPolicy::Fatal,
            max_vertices: 65_536,
            max_indices: 262_144,
            fence_timeout: Duration::from_secs(1),
        }
    }
    pub fn app(mut self, name: &'static str) -> Self { self.app = Some(name); self }
    pub fn surface(mut self, width: u32, height: u32, vsync: bool) -> Self { self.surface = Some(SurfaceCfg { width, height, vsync }); self }
    pub fn adapter_index(mut self, idx: usize) -> Self { self.adapter_index = Some(idx); self }
    pub fn max_pipelines(mut self, n: usize) -> Self { self.max_pipelines = n; self }
    pub fn max_samplers(mut self, n: usize) -> Self { self.max_samplers = n; self }
    pub fn cache_overflow(mut self, policy: OverflowPolicy) -> Self { self.cache_overflow = policy; self }
    pub fn max_vertices(mut self, n: u32) -> Self { self.max_vertices = n; self }
    pub fn max_indices(mut self, n: u32) -> Self { self.max_indices = n; self }
    pub fn fence_timeout(mut self, t: Duration) -> Self { self.fence_timeout = t; self }

    pub fn build(self) -> Result<RendererConfig, ConfigError> {
        let cfg = RendererConfig {
            app: self.app.unwrap_or("strafe"),
            surface: self.surface.unwrap_or(SurfaceCfg { width: 1280, height: 720, vsync: true }),
            adapter_index: self.adapter_index,
            max_pipelines: self.max_pipelines,
            max_samplers: self.max_samplers,
            cache_overflow: self.cache_overflow,
            max_vertices: self.max_vertices,
            max_indices: self.max_indices,
            fence_timeout: self.fence_timeout,
        };
        validate_config(&cfg)?;
        Ok(cfg)
    }
}

impl Default for ConfigBuilder {
    fn default() -> Self { Self::new() }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builder_defaults_validate() {
        let cfg = ConfigBuilder::new().app("demo").build().expect("valid");
        assert_eq!(cfg.surface.width, 1280);
        assert_eq!(cfg.max_pipelines, 1024);
        assert_eq!(cfg.max_samplers, 32);
        assert_eq!(cfg.cache_overflow, OverflowPolicy::Fatal);
    }

    #[test]
    fn zero_extent_rejected() {
        let err = ConfigBuilder::new().surface(0, 720, true).build().unwrap_err();
        assert_eq!(err, ConfigError::ZeroSurfaceExtent);
    }

    #[test]
    fn zero_budgets_rejected() {
        let err = ConfigBuilder::new().max_vertices(0).build().unwrap_err();
        assert_eq!(err, ConfigError::ZeroGeometryBudget);
        let err = ConfigBuilder::new().max_pipelines(0).build().unwrap_err();
        assert_eq!(err, ConfigError::ZeroCacheLimit);
        let err = ConfigBuilder::new().fence_timeout(Duration::ZERO).build().unwrap_err();
        assert_eq!(err, ConfigError::ZeroFenceTimeout);
    }
}
