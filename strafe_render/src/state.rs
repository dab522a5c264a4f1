//! Render-state descriptors and their mapping onto Vulkan pipeline state.
//!
//! A [`PipelineState`] is the full key for a graphics pipeline: shader
//! variant, packed [`StateBits`], cull face, shadow phase and a handful of
//! booleans. Everything here is pure derivation; actual pipeline objects are
//! assembled in [`crate::pipeline`].

use ash::vk;
use bitflags::bitflags;

use crate::error::{GfxError, GfxResult};

bitflags! {
    /// Packed blend/depth/alpha-test state.
    ///
    /// The low byte holds two 4-bit blend subfields (source factor in bits
    /// 0..4, destination factor in bits 4..8). A subfield value of zero on
    /// both sides means blending is disabled; undefined subfield values are
    /// rejected by [`blend_config`].
    #[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
    pub struct StateBits: u32 {
        const SRC_BLEND_ZERO                = 0x0000_0001;
        const SRC_BLEND_ONE                 = 0x0000_0002;
        const SRC_BLEND_DST_COLOR           = 0x0000_0003;
        const SRC_BLEND_ONE_MINUS_DST_COLOR = 0x0000_0004;
        const SRC_BLEND_SRC_ALPHA           = 0x0000_0005;
        const SRC_BLEND_ONE_MINUS_SRC_ALPHA = 0x0000_0006;
        const SRC_BLEND_DST_ALPHA           = 0x0000_0007;
        const SRC_BLEND_ONE_MINUS_DST_ALPHA = 0x0000_0008;
        const SRC_BLEND_ALPHA_SATURATE      = 0x0000_0009;
        const SRC_BLEND_MASK                = 0x0000_000f;

        const DST_BLEND_ZERO                = 0x0000_0010;
        const DST_BLEND_ONE                 = 0x0000_0020;
        const DST_BLEND_SRC_COLOR           = 0x0000_0030;
        const DST_BLEND_ONE_MINUS_SRC_COLOR = 0x0000_0040;
        const DST_BLEND_SRC_ALPHA           = 0x0000_0050;
        const DST_BLEND_ONE_MINUS_SRC_ALPHA = 0x0000_0060;
        const DST_BLEND_DST_ALPHA           = 0x0000_0070;
        const DST_BLEND_ONE_MINUS_DST_ALPHA = 0x0000_0080;
        const DST_BLEND_MASK                = 0x0000_00f0;

        const DEPTH_WRITE        = 0x0000_0100;
        const DEPTH_TEST_DISABLE = 0x0000_0200;
        const DEPTH_FUNC_EQUAL   = 0x0000_0400;
        const POLYGON_LINE       = 0x0000_0800;

        /// Alpha-test bits are mutually exclusive; see [`alpha_func`].
        const ALPHA_GT_ZERO   = 0x0000_1000;
        const ALPHA_LT_HALF   = 0x0000_2000;
        const ALPHA_GE_HALF   = 0x0000_4000;
        const ALPHA_TEST_MASK = 0x0000_7000;
    }
}

impl StateBits {
    fn src_blend_value(self) -> u32 {
        self.bits() & Self::SRC_BLEND_MASK.bits()
    }

    fn dst_blend_value(self) -> u32 {
        self.bits() & Self::DST_BLEND_MASK.bits()
    }
}

/// Which shader pair a pipeline runs and how many vertex streams it binds.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub enum ShaderVariant {
    /// One texture, streams: position, color, texcoord 0.
    SingleTexture,
    /// Two textures combined by multiply; adds the texcoord 1 stream.
    MultiTextureMul,
    /// Two textures combined by add; adds the texcoord 1 stream.
    MultiTextureAdd,
}

impl ShaderVariant {
    pub fn multitexture(self) -> bool {
        !matches!(self, ShaderVariant::SingleTexture)
    }

    pub fn stream_count(self) -> u32 {
        if self.multitexture() { 4 } else { 3 }
    }
}

#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub enum CullFace {
    None,
    Front,
    Back,
}

/// Stencil-shadow rendering phase a pipeline participates in.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub enum ShadowPhase {
    Disabled,
    /// Shadow volume edges: stencil increments or decrements depending on
    /// the cull side, color writes off.
    Edges,
    /// Darkening quad over stencil-marked pixels, no stencil writes.
    FullscreenQuad,
}

/// Complete pipeline key. Two equal descriptors always resolve to the same
/// pipeline object.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub struct PipelineState {
    pub variant: ShaderVariant,
    pub bits: StateBits,
    pub cull: CullFace,
    pub polygon_offset: bool,
    pub clipping_plane: bool,
    pub mirror: bool,
    pub line_primitives: bool,
    pub shadow_phase: ShadowPhase,
}

impl PipelineState {
    /// An opaque, depth-tested, depth-writing baseline for the given variant.
    pub fn opaque(variant: ShaderVariant) -> Self {
        PipelineState {
            variant,
            bits: StateBits::DEPTH_WRITE,
            cull: CullFace::Back,
            polygon_offset: false,
            clipping_plane: false,
            mirror: false,
            line_primitives: false,
            shadow_phase: ShadowPhase::Disabled,
        }
    }
}

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub(crate) struct BlendConfig {
    pub src: vk::BlendFactor,
    pub dst: vk::BlendFactor,
}

/// Decode the two blend subfields. `Ok(None)` means blending disabled;
/// undefined subfield values (including one side set while the other is
/// zero) are errors.
pub(crate) fn blend_config(bits: StateBits) -> GfxResult<Option<BlendConfig>> {
    let s = bits.src_blend_value();
    let d = bits.dst_blend_value();
    if s == 0 && d == 0 {
        return Ok(None);
    }
    let src = match s {
        0x01 => vk::BlendFactor::ZERO,
        0x02 => vk::BlendFactor::ONE,
        0x03 => vk::BlendFactor::DST_COLOR,
        0x04 => vk::BlendFactor::ONE_MINUS_DST_COLOR,
        0x05 => vk::BlendFactor::SRC_ALPHA,
        0x06 => vk::BlendFactor::ONE_MINUS_SRC_ALPHA,
        0x07 => vk::BlendFactor::DST_ALPHA,
        0x08 => vk::BlendFactor::ONE_MINUS_DST_ALPHA,
        0x09 => vk::BlendFactor::SRC_ALPHA_SATURATE,
        _ => {
            return Err(GfxError::InvalidStateBits {
                bits: bits.bits(),
                reason: "undefined source blend factor",
            })
        }
    };
    let dst = match d {
        0x10 => vk::BlendFactor::ZERO,
        0x20 => vk::BlendFactor::ONE,
        0x30 => vk::BlendFactor::SRC_COLOR,
        0x40 => vk::BlendFactor::ONE_MINUS_SRC_COLOR,
        0x50 => vk::BlendFactor::SRC_ALPHA,
        0x60 => vk::BlendFactor::ONE_MINUS_SRC_ALPHA,
        0x70 => vk::BlendFactor::DST_ALPHA,
        0x80 => vk::BlendFactor::ONE_MINUS_DST_ALPHA,
        _ => {
            return Err(GfxError::InvalidStateBits {
                bits: bits.bits(),
                reason: "undefined destination blend factor",
            })
        }
    };
    Ok(Some(BlendConfig { src, dst }))
}

/// Alpha-test comparison selected by the state bits, passed to the fragment
/// stage as specialization constant 0.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub(crate) enum AlphaFunc {
    Disabled,
    GtZero,
    LtHalf,
    GeHalf,
}

impl AlphaFunc {
    pub(crate) fn specialization_value(self) -> u32 {
        match self {
            AlphaFunc::Disabled => 0,
            AlphaFunc::GtZero => 1,
            AlphaFunc::LtHalf => 2,
            AlphaFunc::GeHalf => 3,
        }
    }
}

pub(crate) fn alpha_func(bits: StateBits) -> GfxResult<AlphaFunc> {
    let m = bits & StateBits::ALPHA_TEST_MASK;
    if m == StateBits::empty() {
        Ok(AlphaFunc::Disabled)
    } else if m == StateBits::ALPHA_GT_ZERO {
        Ok(AlphaFunc::GtZero)
    } else if m == StateBits::ALPHA_LT_HALF {
        Ok(AlphaFunc::LtHalf)
    } else if m == StateBits::ALPHA_GE_HALF {
        Ok(AlphaFunc::GeHalf)
    } else {
        Err(GfxError::InvalidStateBits {
            bits: bits.bits(),
            reason: "multiple alpha-test bits set",
        })
    }
}

#[derive(Clone, Copy, Debug)]
pub(crate) struct DepthStencilConfig {
    pub depth_test: bool,
    pub depth_write: bool,
    pub compare: vk::CompareOp,
    pub stencil: Option<vk::StencilOpState>,
}

/// Depth and stencil state for a descriptor. Shadow phases override parts of
/// the packed bits: edge rendering never writes depth, the fullscreen quad
/// never tests it.
pub(crate) fn depth_stencil_config(
    bits: StateBits,
    phase: ShadowPhase,
    cull: CullFace,
) -> DepthStencilConfig {
    let mut cfg = DepthStencilConfig {
        depth_test: !bits.contains(StateBits::DEPTH_TEST_DISABLE),
        depth_write: bits.contains(StateBits::DEPTH_WRITE),
        compare: if bits.contains(StateBits::DEPTH_FUNC_EQUAL) {
            vk::CompareOp::EQUAL
        } else {
            vk::CompareOp::LESS_OR_EQUAL
        },
        stencil: None,
    };
    match phase {
        ShadowPhase::Disabled => {}
        ShadowPhase::Edges => {
            cfg.depth_write = false;
            let pass_op = if cull == CullFace::Back {
                vk::StencilOp::INCREMENT_AND_CLAMP
            } else {
                vk::StencilOp::DECREMENT_AND_CLAMP
            };
            cfg.stencil = Some(vk::StencilOpState {
                fail_op: vk::StencilOp::KEEP,
                pass_op,
                depth_fail_op: vk::StencilOp::KEEP,
                compare_op: vk::CompareOp::ALWAYS,
                compare_mask: 0xff,
                write_mask: 0xff,
                reference: 0,
            });
        }
        ShadowPhase::FullscreenQuad => {
            cfg.depth_test = false;
            cfg.depth_write = false;
            cfg.stencil = Some(vk::StencilOpState {
                fail_op: vk::StencilOp::KEEP,
                pass_op: vk::StencilOp::KEEP,
                depth_fail_op: vk::StencilOp::KEEP,
                compare_op: vk::CompareOp::NOT_EQUAL,
                compare_mask: 0xff,
                write_mask: 0,
                reference: 0,
            });
        }
    }
    cfg
}

pub(crate) fn color_write_mask(phase: ShadowPhase) -> vk::ColorComponentFlags {
    if phase == ShadowPhase::Edges {
        vk::ColorComponentFlags::empty()
    } else {
        vk::ColorComponentFlags::RGBA
    }
}

// Vertex streams: position (binding 0), packed color (1), texcoord 0 (2)
// and, for multitexture variants, texcoord 1 (3). One attribute per stream.

static STREAM_BINDINGS: [vk::VertexInputBindingDescription; 4] = [
    vk::VertexInputBindingDescription { binding: 0, stride: 16, input_rate: vk::VertexInputRate::VERTEX },
    vk::VertexInputBindingDescription { binding: 1, stride: 4, input_rate: vk::VertexInputRate::VERTEX },
    vk::VertexInputBindingDescription { binding: 2, stride: 8, input_rate: vk::VertexInputRate::VERTEX },
    vk::VertexInputBindingDescription { binding: 3, stride: 8, input_rate: vk::VertexInputRate::VERTEX },
];

static STREAM_ATTRIBUTES: [vk::VertexInputAttributeDescription; 4] = [
    vk::VertexInputAttributeDescription { location: 0, binding: 0, format: vk::Format::R32G32B32A32_SFLOAT, offset: 0 },
    vk::VertexInputAttributeDescription { location: 1, binding: 1, format: vk::Format::R8G8B8A8_UNORM, offset: 0 },
    vk::VertexInputAttributeDescription { location: 2, binding: 2, format: vk::Format::R32G32_SFLOAT, offset: 0 },
    vk::VertexInputAttributeDescription { location: 3, binding: 3, format: vk::Format::R32G32_SFLOAT, offset: 0 },
];

pub(crate) fn vertex_bindings(variant: ShaderVariant) -> &'static [vk::VertexInputBindingDescription] {
    &STREAM_BINDINGS[..variant.stream_count() as usize]
}

pub(crate) fn vertex_attributes(variant: ShaderVariant) -> &'static [vk::VertexInputAttributeDescription] {
    &STREAM_ATTRIBUTES[..variant.stream_count() as usize]
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn blend_disabled_when_both_subfields_zero() {
        let cfg = blend_config(StateBits::DEPTH_WRITE).expect("valid");
        assert!(cfg.is_none());
    }

    #[test]
    fn blend_factors_decode() {
        let bits = StateBits::SRC_BLEND_SRC_ALPHA | StateBits::DST_BLEND_ONE_MINUS_SRC_ALPHA;
        let cfg = blend_config(bits).expect("valid").expect("enabled");
        assert_eq!(cfg.src, vk::BlendFactor::SRC_ALPHA);
        assert_eq!(cfg.dst, vk::BlendFactor::ONE_MINUS_SRC_ALPHA);

        let bits = StateBits::SRC_BLEND_ONE | StateBits::DST_BLEND_ONE;
        let cfg = blend_config(bits).expect("valid").expect("enabled");
        assert_eq!(cfg.src, vk::BlendFactor::ONE);
        assert_eq!(cfg.dst, vk::BlendFactor::ONE);
    }

    #[test]
    fn blend_rejects_undefined_subfields() {
        // Destination nibble 0x9 is not a defined factor.
        let bits = StateBits::from_bits_retain(0x0000_0090 | StateBits::SRC_BLEND_ONE.bits());
        assert!(matches!(
            blend_config(bits),
            Err(GfxError::InvalidStateBits { reason: "undefined destination blend factor", .. })
        ));
        // Source set, destination zero is likewise undefined.
        let bits = StateBits::SRC_BLEND_ONE;
        assert!(matches!(
            blend_config(bits),
            Err(GfxError::InvalidStateBits { reason: "undefined destination blend factor", .. })
        ));
    }

    #[test]
    fn alpha_func_selects_one_of_three() {
        assert_eq!(alpha_func(StateBits::empty()).unwrap(), AlphaFunc::Disabled);
        assert_eq!(alpha_func(StateBits::ALPHA_GT_ZERO).unwrap(), AlphaFunc::GtZero);
        assert_eq!(alpha_func(StateBits::ALPHA_LT_HALF).unwrap(), AlphaFunc::LtHalf);
        assert_eq!(alpha_func(StateBits::ALPHA_GE_HALF).unwrap(), AlphaFunc::GeHalf);
        assert_eq!(alpha_func(StateBits::ALPHA_GE_HALF).unwrap().specialization_value(), 3);
    }

    #[test]
    fn alpha_func_rejects_combined_bits() {
        let bits = StateBits::ALPHA_GT_ZERO | StateBits::ALPHA_GE_HALF;
        assert!(matches!(
            alpha_func(bits),
            Err(GfxError::InvalidStateBits { reason: "multiple alpha-test bits set", .. })
        ));
    }

    #[test]
    fn shadow_edges_stencil_follows_cull_side() {
        let cfg = depth_stencil_config(StateBits::DEPTH_WRITE, ShadowPhase::Edges, CullFace::Back);
        assert!(!cfg.depth_write, "edge phase never writes depth");
        let st = cfg.stencil.expect("stencil on");
        assert_eq!(st.pass_op, vk::StencilOp::INCREMENT_AND_CLAMP);
        assert_eq!(st.compare_op, vk::CompareOp::ALWAYS);

        let cfg = depth_stencil_config(StateBits::empty(), ShadowPhase::Edges, CullFace::Front);
        let st = cfg.stencil.expect("stencil on");
        assert_eq!(st.pass_op, vk::StencilOp::DECREMENT_AND_CLAMP);

        assert_eq!(color_write_mask(ShadowPhase::Edges), vk::ColorComponentFlags::empty());
    }

    #[test]
    fn shadow_quad_reads_stencil_without_writing() {
        let cfg = depth_stencil_config(StateBits::empty(), ShadowPhase::FullscreenQuad, CullFace::None);
        assert!(!cfg.depth_test);
        let st = cfg.stencil.expect("stencil on");
        assert_eq!(st.compare_op, vk::CompareOp::NOT_EQUAL);
        assert_eq!(st.write_mask, 0);
        assert_eq!(st.pass_op, vk::StencilOp::KEEP);
        assert_eq!(color_write_mask(ShadowPhase::FullscreenQuad), vk::ColorComponentFlags::RGBA);
    }

    #[test]
    fn depth_bits_decode() {
        let cfg = depth_stencil_config(
            StateBits::DEPTH_FUNC_EQUAL,
            ShadowPhase::Disabled,
            CullFace::Back,
        );
        assert!(cfg.depth_test);
        assert!(!cfg.depth_write);
        assert_eq!(cfg.compare, vk::CompareOp::EQUAL);

        let cfg = depth_stencil_config(
            StateBits::DEPTH_TEST_DISABLE,
            ShadowPhase::Disabled,
            CullFace::Back,
        );
        assert!(!cfg.depth_test);
        assert_eq!(cfg.compare, vk::CompareOp::LESS_OR_EQUAL);
    }

    #[test]
    fn stream_layout_per_variant() {
        assert_eq!(vertex_bindings(ShaderVariant::SingleTexture).len(), 3);
        assert_eq!(vertex_attributes(ShaderVariant::SingleTexture).len(), 3);
        assert_eq!(vertex_bindings(ShaderVariant::MultiTextureMul).len(), 4);
        assert_eq!(vertex_attributes(ShaderVariant::MultiTextureAdd).len(), 4);
        let strides: Vec<u32> = STREAM_BINDINGS.iter().map(|b| b.stride).collect();
        assert_eq!(strides, vec![16, 4, 8, 8]);
    }

    #[test]
    fn descriptor_is_a_stable_map_key() {
        let a = PipelineState::opaque(ShaderVariant::SingleTexture);
        let b = PipelineState::opaque(ShaderVariant::SingleTexture);
        let mut c = a;
        c.bits |= StateBits::SRC_BLEND_ONE | StateBits::DST_BLEND_ONE;

        let mut map: HashMap<PipelineState, u32> = HashMap::new();
        map.insert(a, 1);
        map.insert(b, 2);
        map.insert(c, 3);
        assert_eq!(map.len(), 2);
        assert_eq!(map[&a], 2);
    }
}
