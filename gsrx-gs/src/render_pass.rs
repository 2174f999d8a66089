// SPDX-FileCopyrightText: 2025 gsrx contributors
// SPDX-License-Identifier: GPL-3.0-or-later

//! Render-pass accumulator.
//!
//! Primitives accumulate into a pass sharing one FRAME/ZBUF binding. State
//! vectors and texture descriptors are de-duplicated into small tables the
//! primitives index into; palette uploads are memoized in a sliding ring.
//! The pass flushes on hazards, frame-buffer pointer changes, table
//! overflow, or an explicit request, and is handed to the backend as one
//! [`RenderPass`](crate::backend::RenderPass).

use rustc_hash::FxHashMap;

use crate::backend::{GsBackend, ImageHandle, PaletteUploadDescriptor, RenderPass};
use crate::page_tracker::FlushReason;
use crate::psm::{psm_layout, psm_word_write_mask, PageRect};
use crate::regs::{Frame, Zbuf};
use crate::state::StateDirtyFlags;

// ── Capacity limits ─────────────────────────────────────────────────────────

pub const MAX_PRIMITIVES_PER_FLUSH: u32 = 16 * 1024;
pub const MAX_TEXTURES: u32 = 8 * 1024;
pub const MAX_STATE_VECTORS: u32 = 1024;
/// Palette cache slots on the backend; also bounds pending uploads per pass.
pub const CLUT_INSTANCES: u32 = 1024;
/// Sliding window of memoized palette uploads.
pub const NUM_MEMOIZED_PALETTES: usize = 8;

/// Coarse binning works on 8x8 tiles.
pub const FB_SWIZZLE_WIDTH_LOG2: u32 = 3;
pub const FB_SWIZZLE_HEIGHT_LOG2: u32 = 3;

// ── StateVector bit layout ──────────────────────────────────────────────────

pub const BLEND_MODE_DTHE_BIT: u32 = 1 << 0;
pub const BLEND_MODE_ATE_BIT: u32 = 1 << 1;
pub const BLEND_MODE_ATE_MODE_OFFSET: u32 = 2;
pub const BLEND_MODE_AFAIL_MODE_OFFSET: u32 = 5;
pub const BLEND_MODE_DATE_BIT: u32 = 1 << 7;
pub const BLEND_MODE_DATM_BIT: u32 = 1 << 8;
pub const BLEND_MODE_A_MODE_OFFSET: u32 = 9;
pub const BLEND_MODE_B_MODE_OFFSET: u32 = 11;
pub const BLEND_MODE_C_MODE_OFFSET: u32 = 13;
pub const BLEND_MODE_D_MODE_OFFSET: u32 = 15;
pub const BLEND_MODE_ABE_BIT: u32 = 1 << 17;
pub const BLEND_MODE_PABE_BIT: u32 = 1 << 18;
pub const BLEND_MODE_COLCLAMP_BIT: u32 = 1 << 19;
pub const BLEND_MODE_FB_ALPHA_BIT: u32 = 1 << 20;

pub const COMBINER_TME_BIT: u32 = 1 << 0;
pub const COMBINER_TCC_BIT: u32 = 1 << 1;
pub const COMBINER_MODE_OFFSET: u32 = 2;
pub const COMBINER_FOG_BIT: u32 = 1 << 4;

// ── Per-primitive packed words ──────────────────────────────────────────────

pub const TEX_SAMPLER_MAG_LINEAR_BIT: u32 = 1 << 0;
pub const TEX_SAMPLER_MIN_LINEAR_BIT: u32 = 1 << 1;
pub const TEX_SAMPLER_MIPMAP_LINEAR_BIT: u32 = 1 << 2;
pub const TEX_SAMPLER_CLAMP_S_BIT: u32 = 1 << 3;
pub const TEX_SAMPLER_CLAMP_T_BIT: u32 = 1 << 4;
pub const TEX_MAX_MIP_LEVEL_OFFSET: u32 = 5;
pub const TEX_TEXTURE_INDEX_OFFSET: u32 = 16;
pub const TEX_TEXTURE_INDEX_BITS: u32 = 16;
/// High bit of the texture index marks on-tile feedback sampling.
pub const TEX_FEEDBACK_BIT: u32 = 1 << (TEX_TEXTURE_INDEX_BITS - 1);

pub const TEX2_FIXED_LOD_OFFSET: u32 = 0;
pub const TEX2_L_OFFSET: u32 = 1;
pub const TEX2_K_OFFSET: u32 = 4;

pub const STATE_BIT_Z_TEST: u32 = 0;
pub const STATE_BIT_Z_TEST_GREATER: u32 = 1;
pub const STATE_BIT_Z_WRITE: u32 = 2;
pub const STATE_BIT_OPAQUE: u32 = 3;
pub const STATE_BIT_MULTISAMPLE: u32 = 4;
pub const STATE_BIT_SCANMSK_EVEN: u32 = 5;
pub const STATE_BIT_SCANMSK_ODD: u32 = 6;
pub const STATE_BIT_PERSPECTIVE: u32 = 7;
pub const STATE_BIT_IIP: u32 = 8;
pub const STATE_BIT_FIX: u32 = 9;
pub const STATE_BIT_PARALLELOGRAM: u32 = 10;
pub const STATE_BIT_SPRITE: u32 = 11;
pub const STATE_BIT_LINE: u32 = 12;
pub const STATE_BIT_SNAP_RASTER: u32 = 13;
pub const STATE_INDEX_BIT_OFFSET: u32 = 16;

pub const ALPHA_AFIX_OFFSET: u32 = 0;
pub const ALPHA_AREF_OFFSET: u32 = 8;

/// Compact rasterizer state shared by primitives; equal iff bit-identical.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct StateVector {
    pub blend_mode: u32,
    pub combiner: u32,
    pub dimx: [u32; 2],
}

/// One primitive's packed attribute record.
#[derive(Debug, Clone, Copy, Default)]
#[repr(C)]
pub struct PrimitiveAttribute {
    pub tex: u32,
    pub tex2: u32,
    pub state: u32,
    pub fbmsk: u32,
    pub fogcol: u32,
    pub alpha: u32,
    pub bb: [i16; 4],
}

/// Texture table entry handed to the backend.
#[derive(Debug, Clone)]
pub struct TextureInfo {
    pub image: ImageHandle,
    /// (width, height, 1/view_width, 1/view_height).
    pub sizes: [f32; 4],
    /// Clamp region in texels (x0, y0, x1, y1).
    pub region: [f32; 4],
    /// UV bias from the effective rect origin.
    pub bias: [f32; 2],
}

#[derive(Debug, Clone, Copy, Default)]
pub struct TexMapEntry {
    pub index: u32,
    pub valid: bool,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct MemoizedPalette {
    pub csa_mask: u32,
    pub upload: PaletteUploadDescriptor,
    pub clut_instance: u32,
}

/// The in-flight render pass.
pub struct RenderPassState {
    pub positions: Vec<crate::vertex::VertexPosition>,
    pub attributes: Vec<crate::vertex::VertexAttribute>,
    pub prims: Vec<PrimitiveAttribute>,
    pub primitive_count: u32,

    pub state_vectors: Vec<StateVector>,
    pub state_vector_map: FxHashMap<StateVector, u32>,

    pub tex_infos: Vec<TextureInfo>,
    pub texture_map: FxHashMap<u64, TexMapEntry>,
    pub held_images: Vec<ImageHandle>,

    pub frame: Frame,
    pub zbuf: Zbuf,
    pub fb_page_width_log2: u32,
    pub fb_page_height_log2: u32,
    pub z_page_width_log2: u32,
    pub z_page_height_log2: u32,

    /// Pixel bounding box over all primitives (x0, y0, x1, y1).
    pub bb: [i32; 4],
    pub color_write_mask: u32,

    pub z_sensitive: bool,
    pub z_write: bool,
    pub has_color_feedback: bool,
    pub has_aa1: bool,
    pub has_scanmsk: bool,
    pub is_color_feedback: bool,
    pub is_potential_color_feedback: bool,
    pub is_potential_depth_feedback: bool,
    pub feedback_psm: u32,
    pub feedback_cpsm: u32,

    pub clut_instance: u32,
    pub latest_clut_instance: u32,
    pub pending_palette_updates: u32,
    pub memoized_palettes: [MemoizedPalette; NUM_MEMOIZED_PALETTES],
    pub num_memoized_palettes: usize,

    pub label_key: u64,
}

impl RenderPassState {
    pub fn new() -> Self {
        Self {
            positions: Vec::with_capacity(MAX_PRIMITIVES_PER_FLUSH as usize * 3),
            attributes: Vec::with_capacity(MAX_PRIMITIVES_PER_FLUSH as usize * 3),
            prims: Vec::with_capacity(MAX_PRIMITIVES_PER_FLUSH as usize),
            primitive_count: 0,
            state_vectors: Vec::new(),
            state_vector_map: FxHashMap::default(),
            tex_infos: Vec::new(),
            texture_map: FxHashMap::default(),
            held_images: Vec::new(),
            frame: Frame::default(),
            zbuf: Zbuf::default(),
            fb_page_width_log2: 6,
            fb_page_height_log2: 5,
            z_page_width_log2: 6,
            z_page_height_log2: 5,
            bb: [i32::MAX, i32::MAX, i32::MIN, i32::MIN],
            color_write_mask: 0,
            z_sensitive: false,
            z_write: false,
            has_color_feedback: false,
            has_aa1: false,
            has_scanmsk: false,
            is_color_feedback: false,
            is_potential_color_feedback: false,
            is_potential_depth_feedback: false,
            feedback_psm: 0,
            feedback_cpsm: 0,
            clut_instance: 0,
            latest_clut_instance: 0,
            pending_palette_updates: 0,
            memoized_palettes: [MemoizedPalette::default(); NUM_MEMOIZED_PALETTES],
            num_memoized_palettes: 0,
            label_key: 0,
        }
    }

    /// Cache the FRAME/ZBUF page layouts when the binding changes.
    pub fn bind_frame(&mut self, frame: Frame) {
        let layout = psm_layout(frame.psm());
        self.fb_page_width_log2 = layout.page_width_log2;
        self.fb_page_height_log2 = layout.page_height_log2;
        self.frame = frame;
    }

    pub fn bind_zbuf(&mut self, zbuf: Zbuf) {
        let layout = psm_layout(zbuf.psm());
        self.z_page_width_log2 = layout.page_width_log2;
        self.z_page_height_log2 = layout.page_height_log2;
        self.zbuf = zbuf;
    }

    /// Pages of the frame buffer covered by a pixel bounding box.
    pub fn compute_fb_rect(&self, bb: [i32; 4]) -> PageRect {
        let x0 = bb[0] >> self.fb_page_width_log2;
        let x1 = bb[2] >> self.fb_page_width_log2;
        let y0 = bb[1] >> self.fb_page_height_log2;
        let y1 = bb[3] >> self.fb_page_height_log2;

        let page_stride = self.frame.fbw();
        PageRect {
            base_page: self.frame.fbp() + x0 as u32 + y0 as u32 * page_stride,
            page_width: (x1 - x0 + 1) as u32,
            page_height: (y1 - y0 + 1) as u32,
            page_stride,
            block_mask: u32::MAX,
            write_mask: psm_word_write_mask(self.frame.psm()),
        }
    }

    /// Pages of the depth buffer covered by a pixel bounding box.
    pub fn compute_z_rect(&self, bb: [i32; 4]) -> PageRect {
        let x0 = bb[0] >> self.z_page_width_log2;
        let x1 = bb[2] >> self.z_page_width_log2;
        let y0 = bb[1] >> self.z_page_height_log2;
        let y1 = bb[3] >> self.z_page_height_log2;

        // Z shares the frame buffer stride.
        let page_stride = self.frame.fbw();
        PageRect {
            base_page: self.zbuf.zbp() + x0 as u32 + y0 as u32 * page_stride,
            page_width: (x1 - x0 + 1) as u32,
            page_height: (y1 - y0 + 1) as u32,
            page_stride,
            block_mask: u32::MAX,
            write_mask: psm_word_write_mask(self.zbuf.psm()),
        }
    }
}

impl Default for RenderPassState {
    fn default() -> Self {
        Self::new()
    }
}

/// Tile-size cost function: cost = 8x8-tiles x primitives, three thresholds,
/// biased down one step under vertical super-sampling.
pub fn choose_coarse_tile_size_log2(bb: [i32; 4], num_primitives: u32, rate_y_log2: u32) -> u32 {
    let tile_width = (((bb[2] - bb[0]) as u32) >> FB_SWIZZLE_WIDTH_LOG2) + 1;
    let tile_height = (((bb[3] - bb[1]) as u32) >> FB_SWIZZLE_HEIGHT_LOG2) + 1;
    let binning_cost = tile_width as u64 * tile_height as u64 * num_primitives as u64;

    let mut log2 = if binning_cost < 10_000 {
        3
    } else if binning_cost < 10_000_000 {
        4
    } else if binning_cost < 100_000_000 {
        5
    } else {
        6
    };

    if rate_y_log2 != 0 && log2 > 3 {
        log2 -= 1;
    }
    log2
}

impl<B: GsBackend> crate::interface::GsCore<B> {
    /// Emit the accumulated pass to the backend and reset the accumulator.
    pub fn flush_render_pass(&mut self, reason: FlushReason) {
        if self.render_pass.primitive_count != 0 {
            let label_key = self.render_pass.label_key;
            self.render_pass.label_key += 1;

            let rp_state = &self.render_pass;
            let bb = rp_state.bb;

            let coarse_tile_size_log2 = choose_coarse_tile_size_log2(
                bb,
                rp_state.primitive_count,
                self.sampling_rate_y_log2,
            );

            debug_assert!(
                bb[2] < (rp_state.frame.fbw() * gsrx_common::BUFFER_WIDTH_SCALE) as i32
            );

            let debug_capture_stride = match self.debug_mode.draw_mode {
                gsrx_common::DrawDebugMode::Strided => 16,
                gsrx_common::DrawDebugMode::Full => 1,
                gsrx_common::DrawDebugMode::None => 0,
            };

            let rp = RenderPass {
                positions: &rp_state.positions,
                attributes: &rp_state.attributes,
                prims: &rp_state.prims,
                num_primitives: rp_state.primitive_count,
                states: &rp_state.state_vectors,
                textures: &rp_state.tex_infos,
                frame: rp_state.frame,
                zbuf: rp_state.zbuf,
                base_x: bb[0],
                base_y: bb[1],
                coarse_tile_size_log2,
                coarse_tiles_width: (((bb[2] - bb[0]) as u32) >> coarse_tile_size_log2) + 1,
                coarse_tiles_height: (((bb[3] - bb[1]) as u32) >> coarse_tile_size_log2) + 1,
                feedback_texture: rp_state.has_color_feedback,
                feedback_texture_psm: rp_state.feedback_psm,
                feedback_texture_cpsm: rp_state.feedback_cpsm,
                z_sensitive: rp_state.z_sensitive,
                has_aa1: rp_state.has_aa1,
                has_scanmsk: rp_state.has_scanmsk,
                feedback_color: self.debug_mode.feedback_render_target,
                feedback_depth: self.debug_mode.feedback_render_target && rp_state.z_sensitive,
                sampling_rate_x_log2: self.sampling_rate_x_log2,
                sampling_rate_y_log2: self.sampling_rate_y_log2,
                debug_capture_stride,
                label_key,
                flush_reason: reason,
            };

            self.backend.flush_rendering(&rp);
            log::debug!(
                "render pass flushed: {} prims, {} states, {} textures, bb=({},{})-({},{}), reason={:?}",
                rp.num_primitives,
                rp.states.len(),
                rp.textures.len(),
                bb[0],
                bb[1],
                bb[2],
                bb[3],
                reason
            );
        }

        let rp_state = &mut self.render_pass;
        rp_state.positions.clear();
        rp_state.attributes.clear();
        rp_state.prims.clear();
        rp_state.primitive_count = 0;
        rp_state.state_vectors.clear();
        rp_state.state_vector_map.clear();
        rp_state.tex_infos.clear();
        rp_state.texture_map.clear();
        rp_state.held_images.clear();
        rp_state.pending_palette_updates = 0;
        rp_state.bb = [i32::MAX, i32::MAX, i32::MIN, i32::MIN];
        rp_state.color_write_mask = 0;
        rp_state.z_sensitive = false;
        rp_state.z_write = false;
        rp_state.has_color_feedback = false;
        rp_state.has_aa1 = false;
        rp_state.has_scanmsk = false;

        self.state.dirty_flags = StateDirtyFlags::all();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::psm::PSM_CT32;

    #[test]
    fn test_tile_cost_thresholds() {
        // Tiny pass: 8 px square, one primitive.
        assert_eq!(choose_coarse_tile_size_log2([0, 0, 7, 7], 1, 0), 3);
        // 640x448, enough primitives to land in the middle band.
        assert_eq!(choose_coarse_tile_size_log2([0, 0, 639, 447], 100, 0), 4);
        assert_eq!(choose_coarse_tile_size_log2([0, 0, 639, 447], 4000, 0), 5);
        assert_eq!(choose_coarse_tile_size_log2([0, 0, 639, 447], 40000, 0), 6);
    }

    #[test]
    fn test_tile_cost_super_sampling_bias() {
        assert_eq!(choose_coarse_tile_size_log2([0, 0, 639, 447], 100, 1), 3);
        // Smallest size is never reduced.
        assert_eq!(choose_coarse_tile_size_log2([0, 0, 7, 7], 1, 1), 3);
    }

    #[test]
    fn test_compute_fb_rect_geometry() {
        let mut rp = RenderPassState::new();
        // FBW=10, CT32 at page 0.
        rp.bind_frame(Frame((10u64 << 16) | ((PSM_CT32 as u64) << 24)));

        let rect = rp.compute_fb_rect([0, 0, 639, 447]);
        assert_eq!(rect.base_page, 0);
        assert_eq!(rect.page_width, 10);
        assert_eq!(rect.page_height, 14);
        assert_eq!(rect.page_stride, 10);

        // A box within one page.
        let rect = rp.compute_fb_rect([6, 6, 31, 31]);
        assert_eq!(rect.page_width, 1);
        assert_eq!(rect.page_height, 1);
    }

    #[test]
    fn test_fb_rect_union_property() {
        let mut rp = RenderPassState::new();
        rp.bind_frame(Frame((10u64 << 16) | ((PSM_CT32 as u64) << 24)));

        // compute_fb_rect over a box equals the union over a partition.
        let whole = rp.compute_fb_rect([0, 0, 127, 63]);
        let left = rp.compute_fb_rect([0, 0, 63, 63]);
        let right = rp.compute_fb_rect([64, 0, 127, 63]);
        assert_eq!(whole.base_page, left.base_page);
        assert_eq!(
            whole.page_width,
            left.page_width + right.page_width
        );
        assert_eq!(whole.page_height, left.page_height);
    }
}
