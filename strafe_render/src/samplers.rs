//! Sampler descriptors and the lazily filled sampler cache.
//!
//! The minification filter carries the mipmapping decision: the two
//! non-mipmap filters clamp the sampler's max LOD to 0.25, which pins
//! sampling to the base level, while the four mipmap filters open the
//! full chain.

use ash::vk;

use crate::cache::CacheStore;
use crate::config::OverflowPolicy;
use crate::error::{GfxError, GfxResult};

/// Max LOD that keeps a sampler on mip level zero.
const MAX_LOD_BASE_ONLY: f32 = 0.25;
/// Max LOD for samplers that walk the whole mip chain.
const MAX_LOD_FULL_CHAIN: f32 = 12.0;

#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub enum MagFilter {
    Nearest,
    Linear,
}

#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub enum MinFilter {
    Nearest,
    Linear,
    NearestMipNearest,
    LinearMipNearest,
    NearestMipLinear,
    LinearMipLinear,
}

impl MinFilter {
    pub fn mipmapped(self) -> bool {
        !matches!(self, MinFilter::Nearest | MinFilter::Linear)
    }
}

/// Full sampler key: address mode plus both filters.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub struct SamplerDesc {
    /// Repeat addressing when true, clamp-to-edge otherwise.
    pub repeat: bool,
    pub mag: MagFilter,
    pub min: MinFilter,
}

#[derive(Clone, Copy, Debug)]
pub(crate) struct SamplerParams {
    pub mag: vk::Filter,
    pub min: vk::Filter,
    pub mipmap_mode: vk::SamplerMipmapMode,
    pub address: vk::SamplerAddressMode,
    pub max_lod: f32,
}

pub(crate) fn sampler_params(desc: &SamplerDesc) -> SamplerParams {
    let mag = match desc.mag {
        MagFilter::Nearest => vk::Filter::NEAREST,
        MagFilter::Linear => vk::Filter::LINEAR,
    };
    let (min, mipmap_mode) = match desc.min {
        MinFilter::Nearest => (vk::Filter::NEAREST, vk::SamplerMipmapMode::NEAREST),
        MinFilter::Linear => (vk::Filter::LINEAR, vk::SamplerMipmapMode::NEAREST),
        MinFilter::NearestMipNearest => (vk::Filter::NEAREST, vk::SamplerMipmapMode::NEAREST),
        MinFilter::LinearMipNearest => (vk::Filter::LINEAR, vk::SamplerMipmapMode::NEAREST),
        MinFilter::NearestMipLinear => (vk::Filter::NEAREST, vk::SamplerMipmapMode::LINEAR),
        MinFilter::LinearMipLinear => (vk::Filter::LINEAR, vk::SamplerMipmapMode::LINEAR),
    };
    SamplerParams {
        mag,
        min,
        mipmap_mode,
        address: if desc.repeat {
            vk::SamplerAddressMode::REPEAT
        } else {
            vk::SamplerAddressMode::CLAMP_TO_EDGE
        },
        max_lod: if desc.min.mipmapped() {
            MAX_LOD_FULL_CHAIN
        } else {
            MAX_LOD_BASE_ONLY
        },
    }
}

pub struct SamplerCache {
    device: ash::Device,
    store: CacheStore<SamplerDesc, vk::Sampler>,
}

impl SamplerCache {
    pub fn new(device: &ash::Device, limit: usize, on_full: OverflowPolicy) -> Self {
        Self {
            device: device.clone(),
            store: CacheStore::new("sampler", limit, on_full),
        }
    }

    /// Return the sampler for `desc`, creating it on first use.
    pub fn resolve(&mut self, desc: SamplerDesc) -> GfxResult<vk::Sampler> {
        self.store.get_or_insert_with(desc, || {
            let p = sampler_params(&desc);
            let info = vk::SamplerCreateInfo::builder()
                .mag_filter(p.mag)
                .min_filter(p.min)
                .mipmap_mode(p.mipmap_mode)
                .address_mode_u(p.address)
                .address_mode_v(p.address)
                .address_mode_w(p.address)
                .mip_lod_bias(0.0)
                .anisotropy_enable(false)
                .max_anisotropy(1.0)
                .compare_enable(false)
                .min_lod(0.0)
                .max_lod(p.max_lod)
                .border_color(vk::BorderColor::FLOAT_TRANSPARENT_BLACK)
                .unnormalized_coordinates(false);
            unsafe { self.device.create_sampler(&info, None) }
                .map_err(|e| GfxError::api("create_sampler", e))
        })
    }

    pub fn len(&self) -> usize {
        self.store.len()
    }

    pub fn is_empty(&self) -> bool {
        self.store.len() == 0
    }

    pub fn created(&self) -> u64 {
        self.store.created()
    }
}

impl Drop for SamplerCache {
    fn drop(&mut self) {
        unsafe {
            for (_, sampler) in self.store.drain() {
                self.device.destroy_sampler(sampler, None);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn non_mipmap_filters_clamp_to_base_level() {
        let p = sampler_params(&SamplerDesc { repeat: true, mag: MagFilter::Linear, min: MinFilter::Linear });
        assert_eq!(p.max_lod, MAX_LOD_BASE_ONLY);
        assert_eq!(p.mipmap_mode, vk::SamplerMipmapMode::NEAREST);
        assert_eq!(p.min, vk::Filter::LINEAR);

        let p = sampler_params(&SamplerDesc { repeat: true, mag: MagFilter::Nearest, min: MinFilter::Nearest });
        assert_eq!(p.max_lod, MAX_LOD_BASE_ONLY);
        assert_eq!(p.min, vk::Filter::NEAREST);
    }

    #[test]
    fn mipmap_filters_open_the_chain() {
        let p = sampler_params(&SamplerDesc { repeat: false, mag: MagFilter::Linear, min: MinFilter::LinearMipLinear });
        assert_eq!(p.max_lod, MAX_LOD_FULL_CHAIN);
        assert_eq!(p.mipmap_mode, vk::SamplerMipmapMode::LINEAR);

        let p = sampler_params(&SamplerDesc { repeat: false, mag: MagFilter::Nearest, min: MinFilter::LinearMipNearest });
        assert_eq!(p.max_lod, MAX_LOD_FULL_CHAIN);
        assert_eq!(p.mipmap_mode, vk::SamplerMipmapMode::NEAREST);
        assert_eq!(p.min, vk::Filter::LINEAR);
    }

    #[test]
    fn address_mode_follows_repeat() {
        let p = sampler_params(&SamplerDesc { repeat: true, mag: MagFilter::Linear, min: MinFilter::Linear });
        assert_eq!(p.address, vk::SamplerAddressMode::REPEAT);
        let p = sampler_params(&SamplerDesc { repeat: false, mag: MagFilter::Linear, min: MinFilter::Linear });
        assert_eq!(p.address, vk::SamplerAddressMode::CLAMP_TO_EDGE);
    }

    #[test]
    fn descriptor_distinguishes_every_field() {
        let mut keys: HashMap<SamplerDesc, u32> = HashMap::new();
        let base = SamplerDesc { repeat: true, mag: MagFilter::Linear, min: MinFilter::LinearMipLinear };
        keys.insert(base, 0);
        keys.insert(SamplerDesc { repeat: false, ..base }, 1);
        keys.insert(SamplerDesc { mag: MagFilter::Nearest, ..base }, 2);
        keys.insert(SamplerDesc { min: MinFilter::Nearest, ..base }, 3);
        assert_eq!(keys.len(), 4);
    }
}
