//! SPIR-V loading and the shader module set the pipeline cache draws from.
//!
//! Modules are created once up front and owned here; pipelines reference
//! them by handle and never destroy them.

use std::path::Path;

use ash::vk;

use crate::error::{GfxError, GfxResult};
use crate::state::ShaderVariant;

const SPIRV_MAGIC: u32 = 0x0723_0203;

/// SPIR-V bytes for one variant: plain vertex, clip-plane vertex, fragment.
#[derive(Clone, Copy)]
pub struct ShaderPairSources<'a> {
    pub vertex: &'a [u8],
    pub vertex_clip: &'a [u8],
    pub fragment: &'a [u8],
}

#[derive(Clone, Copy)]
pub struct ShaderSetSources<'a> {
    pub single: ShaderPairSources<'a>,
    pub multi_mul: ShaderPairSources<'a>,
    pub multi_add: ShaderPairSources<'a>,
}

/// Read a compiled `.spv` file.
pub fn read_spirv_file(path: impl AsRef<Path>) -> GfxResult<Vec<u8>> {
    Ok(std::fs::read(path)?)
}

/// Reinterpret raw bytes as SPIR-V words, checking alignment and magic.
fn spirv_words(name: &'static str, bytes: &[u8]) -> GfxResult<Vec<u32>> {
    if bytes.len() % 4 != 0 {
        return Err(GfxError::ShaderLoad(format!(
            "shader {name}: byte length {} is not a multiple of 4",
            bytes.len()
        )));
    }
    let words: Vec<u32> = bytes
        .chunks_exact(4)
        .map(|c| u32::from_le_bytes([c[0], c[1], c[2], c[3]]))
        .collect();
    match words.first() {
        Some(&SPIRV_MAGIC) => Ok(words),
        Some(&other) => Err(GfxError::ShaderLoad(format!(
            "shader {name}: bad magic {other:#010x}"
        ))),
        None => Err(GfxError::ShaderLoad(format!("shader {name}: empty"))),
    }
}

fn create_module(device: &ash::Device, name: &'static str, bytes: &[u8]) -> GfxResult<vk::ShaderModule> {
    let words = spirv_words(name, bytes)?;
    let info = vk::ShaderModuleCreateInfo::builder().code(&words);
    unsafe { device.create_shader_module(&info, None) }
        .map_err(|e| GfxError::api("create_shader_module", e))
}

pub(crate) struct ShaderPair {
    vertex: vk::ShaderModule,
    vertex_clip: vk::ShaderModule,
    fragment: vk::ShaderModule,
}

impl ShaderPair {
    fn new(device: &ash::Device, name: &'static str, sources: &ShaderPairSources<'_>) -> GfxResult<Self> {
        Ok(Self {
            vertex: create_module(device, name, sources.vertex)?,
            vertex_clip: create_module(device, name, sources.vertex_clip)?,
            fragment: create_module(device, name, sources.fragment)?,
        })
    }

    pub(crate) fn vertex(&self, clipping_plane: bool) -> vk::ShaderModule {
        if clipping_plane {
            self.vertex_clip
        } else {
            self.vertex
        }
    }

    pub(crate) fn fragment(&self) -> vk::ShaderModule {
        self.fragment
    }

    unsafe fn destroy(&self, device: &ash::Device) {
        device.destroy_shader_module(self.vertex, None);
        device.destroy_shader_module(self.vertex_clip, None);
        device.destroy_shader_module(self.fragment, None);
    }
}

pub struct ShaderSet {
    device: ash::Device,
    single: ShaderPair,
    multi_mul: ShaderPair,
    multi_add: ShaderPair,
}

impl ShaderSet {
    pub fn new(device: &ash::Device, sources: &ShaderSetSources<'_>) -> GfxResult<Self> {
        Ok(Self {
            device: device.clone(),
            single: ShaderPair::new(device, "single_texture", &sources.single)?,
            multi_mul: ShaderPair::new(device, "multi_texture_mul", &sources.multi_mul)?,
            multi_add: ShaderPair::new(device, "multi_texture_add", &sources.multi_add)?,
        })
    }

    pub(crate) fn pair(&self, variant: ShaderVariant) -> &ShaderPair {
        match variant {
            ShaderVariant::SingleTexture => &self.single,
            ShaderVariant::MultiTextureMul => &self.multi_mul,
            ShaderVariant::MultiTextureAdd => &self.multi_add,
        }
    }
}

impl Drop for ShaderSet {
    fn drop(&mut self) {
        unsafe {
            self.single.destroy(&self.device);
            self.multi_mul.destroy(&self.device);
            self.multi_add.destroy(&self.device);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn spv(words: &[u32]) -> Vec<u8> {
        words.iter().flat_map(|w| w.to_le_bytes()).collect()
    }

    #[test]
    fn words_round_trip_little_endian() {
        let bytes = spv(&[SPIRV_MAGIC, 0x0001_0000, 42]);
        let words = spirv_words("t", &bytes).unwrap();
        assert_eq!(words, vec![SPIRV_MAGIC, 0x0001_0000, 42]);
    }

    #[test]
    fn misaligned_length_is_rejected() {
        let mut bytes = spv(&[SPIRV_MAGIC]);
        bytes.push(0);
        let err = spirv_words("t", &bytes).unwrap_err();
        assert!(matches!(err, GfxError::ShaderLoad(_)));
        assert!(err.to_string().contains("multiple of 4"));
    }

    #[test]
    fn bad_magic_is_rejected() {
        let bytes = spv(&[0xDEAD_BEEF, 1, 2]);
        let err = spirv_words("t", &bytes).unwrap_err();
        assert!(err.to_string().contains("bad magic"));
    }

    #[test]
    fn empty_input_is_rejected() {
        let err = spirv_words("t", &[]).unwrap_err();
        assert!(err.to_string().contains("empty"));
    }
}
