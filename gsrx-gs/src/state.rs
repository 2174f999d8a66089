// SPDX-FileCopyrightText: 2025 gsrx contributors
// SPDX-License-Identifier: GPL-3.0-or-later

//! Derived drawing state: dirty-flag discipline, the degenerate-draw check,
//! state-vector and texture-descriptor commits, and texture-feedback
//! classification.
//!
//! Every register handler ORs a fixed set of dirty bits; every derived-state
//! computation clears exactly its own bit, even when it short-circuits. After
//! any flush the full set is raised again so the next draw rebuilds all
//! derived state.

use std::hash::{Hash, Hasher};

use bitflags::bitflags;
use rustc_hash::FxHasher;

use gsrx_common::{BLOCKS_PER_PAGE, BUFFER_WIDTH_SCALE, PAGE_SIZE_U32, SUBPIXEL_BITS};

use crate::backend::{GsBackend, TextureDescriptor, TextureRect};
use crate::interface::{GsCore, GsInterface};
use crate::page_tracker::FlushReason;
use crate::psm::{
    bits_per_pixel, compute_page_rect, is_palette_format, psm_word_write_mask, swizzle_compat_key,
    PageRect, PSM_CT32, PSM_Z32,
};
use crate::regs::{
    ContextState, Clamp, Prim, PrimType, Tex0, Tex1, ATST_ALWAYS, ATST_NEVER, AFAIL_KEEP,
    BLEND_ALPHA_DEST, BLEND_RGB_DEST, CLAMP_CLAMP, CLAMP_REGION_CLAMP, CLAMP_REGION_REPEAT,
    MMAG_LINEAR, MMIN_LINEAR, MMIN_LINEAR_MIPMAP_LINEAR, MMIN_LINEAR_MIPMAP_NEAREST,
    MMIN_NEAREST_MIPMAP_LINEAR, SCANMSK_SKIP_EVEN, ZTE_ENABLED, ZTE_UNDEFINED, ZTST_GREATER,
    ZTST_NEVER,
};
use crate::render_pass::{
    StateVector, BLEND_MODE_ABE_BIT, BLEND_MODE_AFAIL_MODE_OFFSET, BLEND_MODE_ATE_BIT,
    BLEND_MODE_ATE_MODE_OFFSET, BLEND_MODE_A_MODE_OFFSET, BLEND_MODE_B_MODE_OFFSET,
    BLEND_MODE_COLCLAMP_BIT, BLEND_MODE_C_MODE_OFFSET, BLEND_MODE_DATE_BIT, BLEND_MODE_DATM_BIT,
    BLEND_MODE_DTHE_BIT, BLEND_MODE_D_MODE_OFFSET, BLEND_MODE_FB_ALPHA_BIT, BLEND_MODE_PABE_BIT,
    COMBINER_FOG_BIT, COMBINER_MODE_OFFSET, COMBINER_TCC_BIT, COMBINER_TME_BIT,
    STATE_BIT_FIX, STATE_BIT_IIP, STATE_BIT_MULTISAMPLE, STATE_BIT_OPAQUE, STATE_BIT_PERSPECTIVE,
    STATE_BIT_SCANMSK_EVEN, STATE_BIT_Z_TEST, STATE_BIT_Z_TEST_GREATER, STATE_BIT_Z_WRITE,
    STATE_INDEX_BIT_OFFSET, TEX2_FIXED_LOD_OFFSET, TEX2_K_OFFSET, TEX2_L_OFFSET,
    TEX_FEEDBACK_BIT, TEX_MAX_MIP_LEVEL_OFFSET, TEX_SAMPLER_CLAMP_S_BIT, TEX_SAMPLER_CLAMP_T_BIT,
    TEX_SAMPLER_MAG_LINEAR_BIT, TEX_SAMPLER_MIN_LINEAR_BIT, TEX_SAMPLER_MIPMAP_LINEAR_BIT,
    TEX_TEXTURE_INDEX_OFFSET, TextureInfo, TexMapEntry,
};
use crate::vertex::{Topology, VertexAttribute, VertexPosition};

bitflags! {
    /// Partition of derived-state recomputation.
    #[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
    pub struct StateDirtyFlags: u32 {
        const DEGENERATE = 1 << 0;
        const STATE = 1 << 1;
        const PRIM_TEMPLATE = 1 << 2;
        const TEX = 1 << 3;
        const FB = 1 << 4;
        const FEEDBACK = 1 << 5;
    }
}

/// Packed per-primitive words rebuilt on PRIM_TEMPLATE dirtiness.
#[derive(Debug, Clone, Copy, Default)]
pub struct PrimTemplate {
    pub tex: u32,
    pub tex2: u32,
    pub state: u32,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct TexLevel {
    pub base: u32,
    pub stride: u32,
}

/// Memoized texture-level geometry of the committed descriptor.
#[derive(Debug, Clone, Copy, Default)]
pub struct TexPageState {
    pub rect: TextureRect,
    pub levels: [TexLevel; 7],
    pub page_rects: [PageRect; 7],
}

pub struct StateTracker {
    pub dirty_flags: StateDirtyFlags,
    pub degenerate_draw: bool,
    pub last_state_vector: StateVector,
    pub last_state_index: u32,
    pub last_texture_index: u32,
    pub last_texture_descriptor: TextureDescriptor,
    pub prim_template: PrimTemplate,
    pub tex: TexPageState,
}

impl StateTracker {
    pub fn new() -> Self {
        Self {
            dirty_flags: StateDirtyFlags::all(),
            degenerate_draw: false,
            last_state_vector: StateVector::default(),
            last_state_index: 0,
            last_texture_index: u32::MAX,
            last_texture_descriptor: TextureDescriptor::default(),
            prim_template: PrimTemplate::default(),
            tex: TexPageState::default(),
        }
    }

    /// Returns whether any of `flags` was set, clearing exactly those bits.
    pub fn get_and_clear_dirty_flag(&mut self, flags: StateDirtyFlags) -> bool {
        let ret = self.dirty_flags.intersects(flags);
        if ret {
            self.dirty_flags.remove(flags);
        }
        ret
    }
}

impl Default for StateTracker {
    fn default() -> Self {
        Self::new()
    }
}

/// How a textured draw relates to the frame buffer it renders into.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ColorFeedbackMode {
    None,
    /// Samples map 1:1 onto destination pixels.
    Pixel,
    /// Feedback without an exact mapping; handled by slicing.
    Sliced,
}

// ── Pure helpers ────────────────────────────────────────────────────────────

/// Effective sampling rectangle of a (normalized) texture configuration.
pub fn compute_effective_texture_rect(tex0: Tex0, tex1: Tex1, clamp: Clamp) -> TextureRect {
    let mut x = 0u32;
    let mut y = 0u32;
    let mut width = 1u32 << tex0.tw().min(10);
    let mut height = 1u32 << tex0.th().min(10);

    match clamp.wms() {
        CLAMP_REGION_CLAMP => {
            x = clamp.minu().min(clamp.maxu());
            width = clamp.maxu().saturating_sub(x) + 1;
        }
        CLAMP_REGION_REPEAT => {
            // UMSK in MINU, UFIX in MAXU: the repeat block starts at UFIX.
            x = clamp.maxu();
            width = clamp.minu() + 1;
        }
        _ => {}
    }

    match clamp.wmt() {
        CLAMP_REGION_CLAMP => {
            y = clamp.minv().min(clamp.maxv());
            height = clamp.maxv().saturating_sub(y) + 1;
        }
        CLAMP_REGION_REPEAT => {
            y = clamp.maxv();
            height = clamp.minv() + 1;
        }
        _ => {}
    }

    let mut levels = tex1.mxl() + 1;
    levels = levels.min(7);
    // Do not walk mips below a single texel.
    while levels > 1 && (width >> (levels - 1) == 0 || height >> (levels - 1) == 0) {
        levels -= 1;
    }

    TextureRect {
        x,
        y,
        width,
        height,
        levels,
    }
}

/// Whether a texture whose base differs from FBP may still straddle into the
/// frame buffer or depth buffer (huge TW/TH with no region clamp).
pub fn compute_has_potential_feedback(
    tex0: Tex0,
    fbp: u32,
    zbp: u32,
    vram_pages: u32,
) -> (bool, bool) {
    let tex_base_page = tex0.tbp0() / BLOCKS_PER_PAGE;
    let width = 1u64 << tex0.tw().min(10);
    let height = 1u64 << tex0.th().min(10);
    let bytes = width * height * u64::from(bits_per_pixel(tex0.psm())) / 8;
    let tex_pages = ((bytes + u64::from(PAGE_SIZE_U32) - 1) / u64::from(PAGE_SIZE_U32)).max(1);

    let distance = |base: u32| -> u64 {
        let mut b = base;
        if b <= tex_base_page {
            b += vram_pages;
        }
        u64::from(b - tex_base_page)
    };

    (distance(fbp) < tex_pages, distance(zbp) < tex_pages)
}

/// Classify feedback as Pixel (exact 1:1 UV mapping), or Sliced.
///
/// Pixel mode requires nearest magnification, no perspective variation, and
/// every UV-to-position delta within `[0, 2^SUBPIXEL_BITS)` so NEAREST
/// sampling snaps to the pixel being written.
pub fn deduce_color_feedback_mode(
    pos: &[VertexPosition; 3],
    attr: &[VertexAttribute; 3],
    ctx: &ContextState,
    prim: Prim,
    topo: Topology,
    uv_bb: &mut [i32; 4],
    bb: [i32; 4],
) -> ColorFeedbackMode {
    // Sprites and triangles are fine; points and lines are not.
    let can_feedback = topo.vertices == 3 || (topo.quad && topo.vertices == 2);
    if !can_feedback {
        return ColorFeedbackMode::None;
    }
    let quad = topo.vertices == 2;

    let width = 1i32 << ctx.tex0.tw();
    let height = 1i32 << ctx.tex0.th();
    let fwidth = (width << SUBPIXEL_BITS) as f32;
    let fheight = (height << SUBPIXEL_BITS) as f32;
    let mut needs_perspective = false;

    let mut uv = [[0i32; 2]; 3];
    if prim.fst() {
        for i in 0..if quad { 2 } else { 3 } {
            uv[i] = [attr[i].uv[0] as i32, attr[i].uv[1] as i32];
        }
    } else {
        // With varying Q we cannot assume pixel correctness. Sprites use a
        // flat Q0 anyway.
        if !quad && (attr[0].q != attr[1].q || attr[1].q != attr[2].q) {
            needs_perspective = true;
        }

        for i in 0..if quad { 2 } else { 3 } {
            let inv_q = 1.0 / attr[i].q;
            uv[i] = [
                (fwidth * attr[i].st[0] * inv_q) as i32,
                (fheight * attr[i].st[1] * inv_q) as i32,
            ];
        }
    }

    let n = if quad { 2 } else { 3 };
    let mut uv_min = uv[0];
    let mut uv_max = uv[0];
    for v in uv.iter().take(n).skip(1) {
        uv_min = [uv_min[0].min(v[0]), uv_min[1].min(v[1])];
        uv_max = [uv_max[0].max(v[0]), uv_max[1].max(v[1])];
    }

    // Linear filtering widens the sampled footprint.
    if ctx.tex1.mmag() != 0 {
        uv_min = [
            uv_min[0] - (1 << (SUBPIXEL_BITS - 1)),
            uv_min[1] - (1 << (SUBPIXEL_BITS - 1)),
        ];
        uv_max = [
            uv_max[0] + (1 << SUBPIXEL_BITS) - 1,
            uv_max[1] + (1 << SUBPIXEL_BITS) - 1,
        ];
    }

    // This can safely become a REGION_CLAMP.
    *uv_bb = [
        uv_min[0] >> SUBPIXEL_BITS,
        uv_min[1] >> SUBPIXEL_BITS,
        uv_max[0] >> SUBPIXEL_BITS,
        uv_max[1] >> SUBPIXEL_BITS,
    ];

    if needs_perspective || ctx.tex1.mmag() == MMAG_LINEAR {
        return ColorFeedbackMode::Sliced;
    }

    // If the region clamp contains the whole primitive BB, clamping cannot
    // be observed.
    if ctx.clamp.wms() == CLAMP_REGION_CLAMP {
        let minu = ctx.clamp.minu() as i32;
        let maxu = ctx.clamp.maxu() as i32;
        if bb[0] < minu || bb[2] > maxu {
            return ColorFeedbackMode::Sliced;
        }
    }
    if ctx.clamp.wmt() == CLAMP_REGION_CLAMP {
        let minv = ctx.clamp.minv() as i32;
        let maxv = ctx.clamp.maxv() as i32;
        if bb[1] < minv || bb[3] > maxv {
            return ColorFeedbackMode::Sliced;
        }
    }

    let mut min_delta = i32::MAX;
    let mut max_delta = i32::MIN;
    for i in 0..n {
        let dx = uv[i][0] - pos[i].x;
        let dy = uv[i][1] - pos[i].y;
        min_delta = min_delta.min(dx).min(dy);
        max_delta = max_delta.max(dx).max(dy);
    }

    // The UV offset must be within [0, 2^SUBPIXEL_BITS) so interpolation
    // snaps each pixel center onto its own texel with NEAREST.
    if min_delta < 0 || max_delta >= (1 << SUBPIXEL_BITS) {
        return ColorFeedbackMode::Sliced;
    }

    ColorFeedbackMode::Pixel
}

fn descriptor_hash(desc: &TextureDescriptor) -> u64 {
    let mut hasher = FxHasher::default();
    desc.tex0.hash(&mut hasher);
    desc.tex1.hash(&mut hasher);
    desc.texa.hash(&mut hasher);
    desc.miptbp1.hash(&mut hasher);
    desc.miptbp2.hash(&mut hasher);
    desc.clamp.hash(&mut hasher);
    // The palette bank is part of the key: the same texel data with a
    // different palette must be a different cached image.
    desc.palette_bank.hash(&mut hasher);
    hasher.finish()
}

// ── Core-only derived state ─────────────────────────────────────────────────

impl<B: GsBackend> GsCore<B> {
    pub fn mark_texture_state_dirty(&mut self) {
        self.state.last_texture_index = u32::MAX;
        self.state.dirty_flags |= StateDirtyFlags::PRIM_TEMPLATE | StateDirtyFlags::TEX;
    }

    pub fn state_is_z_sensitive(&self) -> bool {
        let ctx = &self.regs.ctx[self.regs.prim.ctxt()];
        if ctx.test.zte() == ZTE_ENABLED {
            // GEQUAL/GREATER read depth; ZTST_NEVER became a degenerate draw
            // before this point.
            if ctx.test.has_z_test() {
                return true;
            }
            if !ctx.zbuf.zmsk() {
                return true;
            }
        }
        false
    }

    pub(crate) fn draw_is_degenerate(&mut self) -> bool {
        if !self
            .state
            .get_and_clear_dirty_flag(StateDirtyFlags::DEGENERATE)
        {
            return self.state.degenerate_draw;
        }

        let ctx = &self.regs.ctx[self.regs.prim.ctxt()];

        // Degenerate scissor.
        if ctx.scissor.scax0() > ctx.scissor.scax1() || ctx.scissor.scay0() > ctx.scissor.scay1() {
            self.state.degenerate_draw = true;
            return true;
        }

        // The depth test never passes.
        if ctx.test.zte() == ZTE_ENABLED && ctx.test.ztst() == ZTST_NEVER {
            self.state.degenerate_draw = true;
            return true;
        }

        // Alpha test always fails and keeps FB contents: no side effects.
        if ctx.test.ate() && ctx.test.atst() == ATST_NEVER && ctx.test.afail() == AFAIL_KEEP {
            self.state.degenerate_draw = true;
            return true;
        }

        // Undefined ZTE ignores depth completely.
        let read_only_depth = ctx.zbuf.zmsk() || ctx.test.zte() == ZTE_UNDEFINED;
        let read_only_color = ctx.frame.fbmsk() == u32::MAX;
        self.state.degenerate_draw = read_only_color && read_only_depth;
        self.state.degenerate_draw
    }

    pub(crate) fn update_color_feedback_state(&mut self) {
        if !self
            .state
            .get_and_clear_dirty_flag(StateDirtyFlags::FEEDBACK)
        {
            // In feedback every draw has to recheck state; the FB is likely
            // flushed per draw anyway.
            if self.render_pass.is_color_feedback {
                self.state.dirty_flags |= StateDirtyFlags::PRIM_TEMPLATE | StateDirtyFlags::TEX;
            }
            return;
        }

        let prim = self.regs.prim;
        let ctx = self.regs.ctx[prim.ctxt()];
        self.render_pass.is_color_feedback = false;
        self.render_pass.is_potential_color_feedback = false;
        self.render_pass.is_potential_depth_feedback = false;

        if !prim.tme() {
            return;
        }

        // Region repeat is too messy to classify.
        if ctx.clamp.wms() == CLAMP_REGION_REPEAT || ctx.clamp.wmt() == CLAMP_REGION_REPEAT {
            return;
        }

        if ctx.tex1.has_mipmap() {
            return;
        }

        let tex_psm = ctx.tex0.psm();
        let vram_pages = self.vram_size / PAGE_SIZE_U32;

        if ctx.tex0.tbp0() != ctx.frame.fbp() * BLOCKS_PER_PAGE {
            // A texture based elsewhere can still straddle into the frame or
            // depth buffer when its TW/TH are oversized and the game relies
            // on never actually sampling that far.
            let (potential_color, potential_depth) =
                compute_has_potential_feedback(ctx.tex0, ctx.frame.fbp(), ctx.zbuf.zbp(), vram_pages);
            self.render_pass.is_potential_color_feedback = potential_color;
            self.render_pass.is_potential_depth_feedback = potential_depth;

            // z_write is committed later in the kick; derive it from current
            // registers as well.
            let has_z_write =
                self.render_pass.z_write || (self.state_is_z_sensitive() && !ctx.zbuf.zmsk());

            let tex_write_mask = psm_word_write_mask(tex_psm);
            let fb_write_mask = psm_word_write_mask(self.render_pass.frame.psm());
            let z_write_mask = psm_word_write_mask(self.render_pass.zbuf.psm());

            // Aliasing 8H over 24-bit color is fine.
            if tex_write_mask & fb_write_mask == 0 {
                self.render_pass.is_potential_color_feedback = false;
            }
            if tex_write_mask & z_write_mask == 0 || !has_z_write {
                self.render_pass.is_potential_depth_feedback = false;
            }
            return;
        }

        if ctx.tex0.tbw() != ctx.frame.fbw() {
            return;
        }

        // Feedback assumes the same bpp and swizzle family.
        if swizzle_compat_key(tex_psm) != swizzle_compat_key(ctx.frame.psm()) {
            return;
        }

        let width = 1u32 << ctx.tex0.tw();
        let height = 1u32 << ctx.tex0.th();

        // The image must cover the entire frame buffer.
        if ctx.frame.fbw() * BUFFER_WIDTH_SCALE > width {
            return;
        }

        // No frame buffer height exists; deduce it from scissor Y max.
        if ctx.scissor.scay1() >= height {
            return;
        }

        self.render_pass.is_color_feedback = true;
        self.state.dirty_flags |= StateDirtyFlags::PRIM_TEMPLATE | StateDirtyFlags::TEX;
    }

    /// Auto-generate MIPTBP1 from TEX0 when TEX1.MTBA is set.
    pub(crate) fn handle_miptbl_gen(&mut self, ctx_index: usize) {
        let tex0 = self.regs.ctx[ctx_index].tex0;
        let tex1 = self.regs.ctx[ctx_index].tex1;
        if !tex1.mtba() {
            return;
        }

        let mut base = tex0.tbp0();
        let width = 1u32 << tex0.tw();
        let height = 1u32 << tex0.th();
        let mut row_length_64 = width / 64;

        let layout = crate::psm::psm_layout(tex0.psm());
        let mut num_blocks =
            (width >> layout.block_width_log2) * (height >> layout.block_height_log2);
        base += num_blocks;

        let mut miptbp1 = self.regs.ctx[ctx_index].miptbp1;

        num_blocks /= 4;
        row_length_64 /= 2;
        miptbp1 = miptbp1.with_level(0, base, row_length_64);
        base += num_blocks;

        num_blocks /= 4;
        row_length_64 /= 2;
        miptbp1 = miptbp1.with_level(1, base, row_length_64);
        base += num_blocks;

        miptbp1 = miptbp1.with_level(2, base, row_length_64);

        self.regs.ctx[ctx_index].miptbp1 = miptbp1;
        self.state.dirty_flags |= StateDirtyFlags::TEX | StateDirtyFlags::PRIM_TEMPLATE;
    }

    pub(crate) fn find_or_place_unique_state_vector(&mut self, state: StateVector) -> u32 {
        if !self.render_pass.state_vectors.is_empty() && state == self.state.last_state_vector {
            return self.state.last_state_index;
        }

        let state_index = match self.render_pass.state_vector_map.get(&state) {
            Some(&index) => index,
            None => {
                let index = self.render_pass.state_vectors.len() as u32;
                self.render_pass.state_vectors.push(state);
                self.render_pass.state_vector_map.insert(state, index);
                index
            }
        };

        self.state.last_state_vector = state;
        self.state.last_state_index = state_index;
        state_index
    }

    pub(crate) fn drawing_kick_update_state_vector(&mut self) -> u32 {
        if !self.state.get_and_clear_dirty_flag(StateDirtyFlags::STATE) {
            return self.state.last_state_index;
        }

        let prim = self.regs.prim;
        let ctx = self.regs.ctx[prim.ctxt()];
        let mut state = StateVector::default();

        if self.regs.dthe.dthe() {
            state.blend_mode |= BLEND_MODE_DTHE_BIT;
            state.dimx = [self.regs.dimx.low_word(), self.regs.dimx.high_word()];
        }

        // An ALWAYS pass is meaningless.
        if ctx.test.ate() && ctx.test.atst() != ATST_ALWAYS {
            state.blend_mode |= BLEND_MODE_ATE_BIT;
            state.blend_mode |= ctx.test.atst() << BLEND_MODE_ATE_MODE_OFFSET;
            state.blend_mode |= ctx.test.afail() << BLEND_MODE_AFAIL_MODE_OFFSET;
        }

        if ctx.test.date() {
            state.blend_mode |= BLEND_MODE_DATE_BIT;
        }
        if ctx.test.datm() {
            state.blend_mode |= BLEND_MODE_DATM_BIT;
        }

        // AA1 implies alpha blending of some sort.
        if prim.abe() || prim.aa1() {
            state.blend_mode |= ctx.alpha.a() << BLEND_MODE_A_MODE_OFFSET;
            state.blend_mode |= ctx.alpha.b() << BLEND_MODE_B_MODE_OFFSET;
            state.blend_mode |= ctx.alpha.c() << BLEND_MODE_C_MODE_OFFSET;
            state.blend_mode |= ctx.alpha.d() << BLEND_MODE_D_MODE_OFFSET;
        }

        if prim.abe() {
            state.blend_mode |= BLEND_MODE_ABE_BIT;
        }
        if self.regs.pabe.pabe() {
            state.blend_mode |= BLEND_MODE_PABE_BIT;
        }
        if self.regs.colclamp.clamp() {
            state.blend_mode |= BLEND_MODE_COLCLAMP_BIT;
        }
        if ctx.fba.fba() {
            state.blend_mode |= BLEND_MODE_FB_ALPHA_BIT;
        }

        if prim.tme() {
            state.combiner |= COMBINER_TME_BIT;
            if ctx.tex0.tcc() {
                state.combiner |= COMBINER_TCC_BIT;
            }
            state.combiner |= ctx.tex0.tfx() << COMBINER_MODE_OFFSET;
        }

        if prim.fge() {
            state.combiner |= COMBINER_FOG_BIT;
        }

        self.find_or_place_unique_state_vector(state)
    }
}

// ── Tracker-coupled derived state ───────────────────────────────────────────

impl<B: GsBackend> GsInterface<B> {
    pub(crate) fn draw_is_degenerate(&mut self) -> bool {
        self.core.draw_is_degenerate()
    }

    pub(crate) fn update_color_feedback_state(&mut self) {
        self.core.update_color_feedback_state();
    }

    /// Record that this pass samples its own render target. A PSM change in
    /// the feedback chain restarts the pass.
    fn mark_render_pass_has_texture_feedback(&mut self, tex0: Tex0) {
        let rp = &self.core.render_pass;
        if rp.has_color_feedback {
            let psm_mismatch = tex0.psm() != rp.feedback_psm
                || (is_palette_format(rp.feedback_psm) && rp.feedback_cpsm != tex0.cpsm());
            if psm_mismatch {
                self.tracker
                    .flush_render_pass(&mut self.core, FlushReason::TextureHazard);
            }
        }

        let rp = &mut self.core.render_pass;
        if !rp.has_color_feedback {
            rp.has_color_feedback = true;
            rp.feedback_psm = tex0.psm();
            rp.feedback_cpsm = if is_palette_format(rp.feedback_psm) {
                tex0.cpsm()
            } else {
                0
            };
        }
    }

    /// Recompute the committed texture's page rects and mark them read.
    /// Flushes through the tracker if a hazard is found.
    pub(crate) fn update_texture_page_rects_and_read(&mut self) {
        let prim = self.core.regs.prim;
        let ctx = self.core.regs.ctx[prim.ctxt()];
        let psm = ctx.tex0.psm();
        let levels = self.core.state.tex.rect.levels;
        let vram_pages = self.core.vram_size / PAGE_SIZE_U32;

        for level in 0..levels {
            let rect = if self.core.render_pass.is_potential_color_feedback
                || self.core.render_pass.is_potential_depth_feedback
            {
                debug_assert_eq!(levels, 1);
                let tex_base_page = ctx.tex0.tbp0() / BLOCKS_PER_PAGE;

                // Clamp the hazard region so the straddling tail does not
                // falsely invalidate the texture.
                let mut rect = PageRect::whole_pages(tex_base_page, vram_pages);

                if self.core.render_pass.is_potential_color_feedback {
                    let mut fb_base_page = ctx.frame.fbp();
                    if fb_base_page <= tex_base_page {
                        fb_base_page += vram_pages;
                    }
                    rect.page_width = rect.page_width.min(fb_base_page - tex_base_page);
                }
                if self.core.render_pass.is_potential_depth_feedback {
                    let mut z_base_page = ctx.zbuf.zbp();
                    if z_base_page <= tex_base_page {
                        z_base_page += vram_pages;
                    }
                    rect.page_width = rect.page_width.min(z_base_page - tex_base_page);
                }
                rect
            } else {
                let tex = &self.core.state.tex;
                compute_page_rect(
                    tex.levels[level as usize].base,
                    tex.rect.x >> level,
                    tex.rect.y >> level,
                    tex.rect.width >> level,
                    tex.rect.height >> level,
                    tex.levels[level as usize].stride,
                    psm,
                )
            };

            self.core.state.tex.page_rects[level as usize] = rect;
            self.tracker.mark_texture_read(&mut self.core, &rect);
        }
    }

    /// Re-mark the committed texture's page rects as read.
    pub(crate) fn texture_page_rects_read(&mut self) {
        for level in 0..self.core.state.tex.rect.levels {
            let rect = self.core.state.tex.page_rects[level as usize];
            self.tracker.mark_texture_read(&mut self.core, &rect);
        }
    }

    pub(crate) fn drawing_kick_update_texture(
        &mut self,
        feedback_mode: ColorFeedbackMode,
        uv_bb: [i32; 4],
        bb: [i32; 4],
    ) -> u32 {
        if !self
            .core
            .state
            .get_and_clear_dirty_flag(StateDirtyFlags::TEX)
        {
            debug_assert_ne!(self.core.state.last_texture_index, u32::MAX);
            return self.core.state.last_texture_index;
        }

        let prim = self.core.regs.prim;
        let ctx = self.core.regs.ctx[prim.ctxt()];

        if feedback_mode == ColorFeedbackMode::Pixel {
            self.mark_render_pass_has_texture_feedback(ctx.tex0);
            // Sentinel index for on-tile feedback: CLUT instance and CSA fit
            // below the feedback bit.
            return TEX_FEEDBACK_BIT
                | (self.core.render_pass.clut_instance * 32 + ctx.tex0.csa());
        }

        let mut tex0 = ctx.tex0;
        let mut tex1 = ctx.tex1;
        let mut clamp = ctx.clamp;
        let mut texa = 0u64;

        let psm = tex0.psm();
        let cpsm = tex0.cpsm();
        let mut csa_mask = 0u32;
        let mut palette_bank = 0u32;
        let mut latest_palette_bank = 0u32;

        if is_palette_format(psm) {
            palette_bank = self.core.render_pass.clut_instance;
            latest_palette_bank = self.core.render_pass.latest_clut_instance;

            // Only CT32 and CT16(S) are valid CLUT formats; TEXA matters for
            // the 16-bit ones.
            if cpsm != PSM_CT32 {
                texa = self.core.regs.texa.bits();
            }

            csa_mask = if matches!(psm, crate::psm::PSM_T8 | crate::psm::PSM_T8H) {
                0xffff
            } else {
                1
            };
            csa_mask <<= tex0.csa();
            // 32-bit color reads the upper CLUT bank as well.
            if cpsm == PSM_CT32 {
                csa_mask |= csa_mask << 16;
            }
        } else {
            // The palette fields are noise for direct-color formats.
            tex0 = tex0.with_cpsm(0).with_csa(0);
            if psm != PSM_CT32 && psm != PSM_Z32 {
                texa = self.core.regs.texa.bits();
            }
        }

        // Shading-only fields.
        tex0 = tex0.with_tcc(false).with_tfx(0);
        // Upload-only fields.
        tex0 = tex0.with_cbp(0).with_csm(0).with_cld(0);

        // In feedback scenarios where the UV BB overlaps the render BB we
        // suspend caching until the access pattern is provably disjoint.
        let mut cache_texture = true;
        if feedback_mode == ColorFeedbackMode::Sliced {
            if prim.prim_type() == PrimType::Sprite {
                // Sprites are almost always explicit mip blurs; cache those.
                // The case to avoid is heavy triangle soup doing feedback.
                cache_texture = true;
            } else if clamp.wms() == CLAMP_REGION_CLAMP && clamp.wmt() == CLAMP_REGION_CLAMP {
                let clamped = [
                    clamp.minu() as i32,
                    clamp.minv() as i32,
                    clamp.maxu() as i32,
                    clamp.maxv() as i32,
                ];
                let hazard = [
                    clamped[0].max(bb[0]),
                    clamped[1].max(bb[1]),
                    clamped[2].min(bb[2]),
                    clamped[3].min(bb[3]),
                ];
                cache_texture = hazard[0] > hazard[2] || hazard[1] > hazard[3];
            } else {
                // Doing this both correctly and fast needs an exact texture
                // cache model. Uncached slicing holds up in practice.
                cache_texture = false;
            }
        }

        if feedback_mode == ColorFeedbackMode::Sliced
            && cache_texture
            && !clamp.has_horizontal_repeat()
            && !clamp.has_vertical_repeat()
        {
            // Narrow to the UV BB; the texture will be discarded right away,
            // so a smaller upload wins.
            if clamp.wms() == CLAMP_REGION_CLAMP {
                let minu = (clamp.minu() as i32).max(uv_bb[0].min(clamp.maxu() as i32));
                let maxu = (clamp.maxu() as i32).min(uv_bb[2].max(minu));
                clamp = clamp.with_minu(minu as u32).with_maxu(maxu as u32);
            } else {
                clamp = clamp
                    .with_wms(CLAMP_REGION_CLAMP)
                    .with_minu(uv_bb[0].max(0) as u32)
                    .with_maxu(uv_bb[2].max(0) as u32);
            }

            if clamp.wmt() == CLAMP_REGION_CLAMP {
                let minv = (clamp.minv() as i32).max(uv_bb[1].min(clamp.maxv() as i32));
                let maxv = (clamp.maxv() as i32).min(uv_bb[3].max(minv));
                clamp = clamp.with_minv(minv as u32).with_maxv(maxv as u32);
            } else {
                clamp = clamp
                    .with_wmt(CLAMP_REGION_CLAMP)
                    .with_minv(uv_bb[1].max(0) as u32)
                    .with_maxv(uv_bb[3].max(0) as u32);
            }
        } else {
            // Normalize the region fields when region modes are inactive so
            // equivalent configurations share one cached texture.
            if !clamp.has_horizontal_region() {
                clamp = clamp.with_minu(0).with_maxu(0).with_wms(CLAMP_CLAMP);
            }
            if !clamp.has_vertical_region() {
                clamp = clamp.with_minv(0).with_maxv(0).with_wmt(CLAMP_CLAMP);
            }
        }

        // Mips that are never accessed are not uploaded.
        if !tex1.mmin_has_mipmap() {
            tex1 = tex1.with_mxl(0);
        }

        let rect = compute_effective_texture_rect(tex0, tex1, clamp);
        self.core.state.tex.rect = rect;
        self.core.state.tex.levels[0] = TexLevel {
            base: tex0.tbp0(),
            stride: tex0.tbw(),
        };

        let mut miptbp1 = 0u64;
        let mut miptbp2 = 0u64;
        if rect.levels >= 2 {
            let mut m = crate::regs::Miptbp(0);
            for level in 1..rect.levels.min(4) {
                let (base, stride) = self.core.regs.ctx[prim.ctxt()].miptbp1.level(level - 1);
                m = m.with_level(level - 1, base, stride);
                self.core.state.tex.levels[level as usize] = TexLevel { base, stride };
            }
            miptbp1 = m.bits();
        }
        if rect.levels >= 5 {
            let mut m = crate::regs::Miptbp(0);
            for level in 4..rect.levels {
                let (base, stride) = self.core.regs.ctx[prim.ctxt()].miptbp2.level(level - 4);
                m = m.with_level(level - 4, base, stride);
                self.core.state.tex.levels[level as usize] = TexLevel { base, stride };
            }
            miptbp2 = m.bits();
        }

        // Shading-only TEX1 fields.
        tex1 = tex1
            .with_lcm(0)
            .with_mmag(0)
            .with_mmin(0)
            .with_mtba(false)
            .with_l(0)
            .with_k(0);

        let mut desc = TextureDescriptor {
            tex0: tex0.bits(),
            tex1: tex1.bits(),
            clamp: clamp.bits(),
            texa,
            miptbp1,
            miptbp2,
            palette_bank,
            latest_palette_bank,
            rect,
            hash: 0,
        };
        desc.hash = descriptor_hash(&desc);

        // May flush the render pass on a hazard.
        if cache_texture {
            self.update_texture_page_rects_and_read();
        }

        // After a TEXFLUSH-equivalent the last index is poisoned and a full
        // re-check is required.
        if self.core.state.last_texture_index != u32::MAX
            && !self.core.render_pass.tex_infos.is_empty()
            && self.core.state.last_texture_descriptor == desc
        {
            return self.core.state.last_texture_index;
        }

        let cached = self.core.render_pass.texture_map.get(&desc.hash).copied();
        let texture_index = match cached {
            Some(entry) if entry.valid => entry.index,
            _ => {
                // Uncached feedback textures still hazard-check their first
                // read; later reads are self-managed.
                if !cache_texture {
                    self.update_texture_page_rects_and_read();
                }

                let image = match self.tracker.find_cached_texture(desc.hash) {
                    Some(image) => image,
                    None => {
                        let image = self.core.backend.create_cached_texture(&desc);
                        if cache_texture {
                            let levels = rect.levels as usize;
                            let level_rects: Vec<PageRect> =
                                self.core.state.tex.page_rects[..levels].to_vec();
                            self.tracker.register_cached_texture(
                                &level_rects,
                                csa_mask,
                                self.core.render_pass.clut_instance,
                                desc.hash,
                                image.clone(),
                            );
                        }
                        image
                    }
                };

                let index = self.core.render_pass.tex_infos.len() as u32;
                self.core
                    .render_pass
                    .texture_map
                    .insert(desc.hash, TexMapEntry { index, valid: true });

                let width = 1u32 << ctx.tex0.tw();
                let height = 1u32 << ctx.tex0.th();
                let view_w = image.width as f32;
                let view_h = image.height as f32;
                let sizes = [width as f32, height as f32, 1.0 / view_w, 1.0 / view_h];

                let mut region = [0.0f32; 4];
                match clamp.wms() {
                    CLAMP_CLAMP => {
                        region[0] = 0.0;
                        region[2] = view_w - 1.0;
                    }
                    CLAMP_REGION_CLAMP => {
                        region[0] = clamp.minu() as f32;
                        region[2] = clamp.maxu() as f32;
                    }
                    _ => {}
                }
                match clamp.wmt() {
                    CLAMP_CLAMP => {
                        region[1] = 0.0;
                        region[3] = view_h - 1.0;
                    }
                    CLAMP_REGION_CLAMP => {
                        region[1] = clamp.minv() as f32;
                        region[3] = clamp.maxv() as f32;
                    }
                    _ => {}
                }

                let bias = [-(rect.x as f32) * sizes[2], -(rect.y as f32) * sizes[3]];

                self.core.render_pass.tex_infos.push(TextureInfo {
                    image: image.clone(),
                    sizes,
                    region,
                    bias,
                });
                self.core.render_pass.held_images.push(image);
                index
            }
        };

        self.core.state.last_texture_descriptor = desc;
        self.core.state.last_texture_index = texture_index;
        texture_index
    }

    /// Rebuild the packed primitive template: texture index and sampler
    /// flags, state-vector index, and the per-primitive mode bits.
    pub(crate) fn drawing_kick_update_state(
        &mut self,
        feedback_mode: ColorFeedbackMode,
        uv_bb: [i32; 4],
        bb: [i32; 4],
    ) {
        if !self
            .core
            .state
            .get_and_clear_dirty_flag(StateDirtyFlags::PRIM_TEMPLATE)
        {
            return;
        }

        let prim = self.core.regs.prim;
        let mut template = PrimTemplate::default();

        if prim.tme() {
            let tex_index = self.drawing_kick_update_texture(feedback_mode, uv_bb, bb);
            let ctx = self.core.regs.ctx[prim.ctxt()];

            template.tex = tex_index << TEX_TEXTURE_INDEX_OFFSET;
            if ctx.tex1.mmag() == MMAG_LINEAR {
                template.tex |= TEX_SAMPLER_MAG_LINEAR_BIT;
            }
            if ctx.clamp.has_horizontal_clamp() {
                template.tex |= TEX_SAMPLER_CLAMP_S_BIT;
            }
            if ctx.clamp.has_vertical_clamp() {
                template.tex |= TEX_SAMPLER_CLAMP_T_BIT;
            }

            match ctx.tex1.mmin() {
                MMIN_LINEAR | MMIN_LINEAR_MIPMAP_NEAREST => {
                    template.tex |= TEX_SAMPLER_MIN_LINEAR_BIT;
                }
                MMIN_NEAREST_MIPMAP_LINEAR => {
                    template.tex |= TEX_SAMPLER_MIPMAP_LINEAR_BIT;
                }
                MMIN_LINEAR_MIPMAP_LINEAR => {
                    template.tex |=
                        TEX_SAMPLER_MIN_LINEAR_BIT | TEX_SAMPLER_MIPMAP_LINEAR_BIT;
                }
                _ => {}
            }

            template.tex2 = ctx.tex1.lcm() << TEX2_FIXED_LOD_OFFSET;
            template.tex2 |= ctx.tex1.l() << TEX2_L_OFFSET;
            template.tex2 |= ctx.tex1.k() << TEX2_K_OFFSET;
            if ctx.tex1.mmin_has_mipmap() {
                template.tex |= ctx.tex1.mxl() << TEX_MAX_MIP_LEVEL_OFFSET;
            }
        }

        // State commits after texture: a texture read may flush and reset
        // the state-vector table.
        template.state = self.core.drawing_kick_update_state_vector() << STATE_INDEX_BIT_OFFSET;

        let ctx = self.core.regs.ctx[prim.ctxt()];
        if ctx.test.zte() == ZTE_ENABLED {
            if ctx.test.has_z_test() {
                template.state |= 1 << STATE_BIT_Z_TEST;
                if ctx.test.ztst() == ZTST_GREATER {
                    template.state |= 1 << STATE_BIT_Z_TEST_GREATER;
                }
            }
            if !ctx.zbuf.zmsk() {
                template.state |= 1 << STATE_BIT_Z_WRITE;
            }
        }

        let mut color_write_needs_previous_pixels = false;

        if prim.abe() || prim.aa1() {
            // Any blend factor touching destination color breaks opacity.
            if ctx.alpha.a() == BLEND_RGB_DEST
                || ctx.alpha.b() == BLEND_RGB_DEST
                || ctx.alpha.c() == BLEND_ALPHA_DEST
                || ctx.alpha.d() == BLEND_RGB_DEST
            {
                color_write_needs_previous_pixels = true;
            }
        }

        // Any pixel test mode cannot be opaque.
        if (ctx.test.ate() && ctx.test.atst() != ATST_ALWAYS)
            || ctx.test.date()
            || ctx.frame.fbmsk() != 0
        {
            color_write_needs_previous_pixels = true;
        }

        // Feedback sampling essentially becomes blending.
        if self.core.render_pass.is_color_feedback {
            color_write_needs_previous_pixels = true;
        }

        if !color_write_needs_previous_pixels {
            template.state |= 1 << STATE_BIT_OPAQUE;
        }

        if prim.aa1() {
            template.state |= 1 << STATE_BIT_MULTISAMPLE;
            self.core.render_pass.has_aa1 = true;
        }

        if self.core.regs.scanmsk.has_mask() {
            template.state |=
                1 << (STATE_BIT_SCANMSK_EVEN + self.core.regs.scanmsk.msk() - SCANMSK_SKIP_EVEN);
            self.core.render_pass.has_scanmsk = true;
        }

        if !prim.fst() {
            template.state |= 1 << STATE_BIT_PERSPECTIVE;
        }
        if prim.iip() {
            template.state |= 1 << STATE_BIT_IIP;
        }
        if prim.fix() {
            template.state |= 1 << STATE_BIT_FIX;
        }

        self.core.state.prim_template = template;
    }

    /// FRAME/ZBUF recheck: restarts the pass when the binding changed under
    /// accumulated primitives.
    pub(crate) fn check_frame_buffer_state(&mut self) {
        let prim = self.core.regs.prim;
        let ctx = self.core.regs.ctx[prim.ctxt()];

        if !self.core.state.get_and_clear_dirty_flag(StateDirtyFlags::FB) {
            debug_assert_eq!(self.core.render_pass.frame.bits(), ctx.frame.bits());
            return;
        }

        let fb_delta = self.core.render_pass.frame.bits() != ctx.frame.bits();
        let z_delta = self.core.render_pass.zbuf.psm() != ctx.zbuf.psm()
            || self.core.render_pass.zbuf.zbp() != ctx.zbuf.zbp();

        // Z can rebind without a flush while no draw reads or writes it.
        if self.core.render_pass.primitive_count != 0
            && (fb_delta || (self.core.render_pass.z_sensitive && z_delta))
        {
            self.flush_pending_transfer(true);
            self.tracker
                .flush_render_pass(&mut self.core, FlushReason::FBPointer);
        }

        if fb_delta {
            self.core.render_pass.bind_frame(ctx.frame);
        }
        if z_delta {
            self.core.render_pass.bind_zbuf(ctx.zbuf);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::regs::{Clamp, Tex0, Tex1};

    #[test]
    fn test_dirty_flag_get_and_clear() {
        let mut tracker = StateTracker::new();
        assert!(tracker.get_and_clear_dirty_flag(StateDirtyFlags::TEX));
        assert!(!tracker.get_and_clear_dirty_flag(StateDirtyFlags::TEX));
        // Other bits survive.
        assert!(tracker.get_and_clear_dirty_flag(StateDirtyFlags::STATE));
    }

    #[test]
    fn test_effective_rect_plain() {
        let tex0 = Tex0(0).with_tw(8).with_th(7);
        let rect = compute_effective_texture_rect(tex0, Tex1(0), Clamp(0));
        assert_eq!(rect.width, 256);
        assert_eq!(rect.height, 128);
        assert_eq!(rect.levels, 1);
        assert_eq!((rect.x, rect.y), (0, 0));
    }

    #[test]
    fn test_effective_rect_region_clamp() {
        let tex0 = Tex0(0).with_tw(8).with_th(8);
        let clamp = Clamp(0)
            .with_wms(CLAMP_REGION_CLAMP)
            .with_minu(32)
            .with_maxu(95);
        let rect = compute_effective_texture_rect(tex0, Tex1(0), clamp);
        assert_eq!(rect.x, 32);
        assert_eq!(rect.width, 64);
        assert_eq!(rect.height, 256);
    }

    #[test]
    fn test_effective_rect_mip_levels_clamped() {
        let tex0 = Tex0(0).with_tw(3).with_th(3);
        let tex1 = Tex1(0).with_mxl(6).with_mmin(MMIN_NEAREST_MIPMAP_LINEAR);
        let rect = compute_effective_texture_rect(tex0, tex1, Clamp(0));
        // An 8x8 texture has at most 4 levels.
        assert_eq!(rect.levels, 4);
    }

    #[test]
    fn test_potential_feedback_straddle() {
        // 1024x1024 CT32 texture at page 0 covers all of a 4 MiB VRAM.
        let tex0 = Tex0(0).with_tw(10).with_th(10);
        let (color, depth) = compute_has_potential_feedback(tex0, 100, 200, 512);
        assert!(color);
        assert!(depth);

        // A 64x64 texture does not reach a frame buffer 100 pages away.
        let tex0 = Tex0(0).with_tw(6).with_th(6);
        let (color, _) = compute_has_potential_feedback(tex0, 100, 200, 512);
        assert!(!color);
    }

    fn feedback_fixture() -> (
        [VertexPosition; 3],
        [VertexAttribute; 3],
        ContextState,
        Prim,
        Topology,
    ) {
        // 64x64 texture, sprite over (0,0)-(64,64) with UV == XY.
        let mut ctx = ContextState::default();
        ctx.tex0 = Tex0(0).with_tw(6).with_th(6);

        let mut pos = [VertexPosition::default(); 3];
        let mut attr = [VertexAttribute::default(); 3];
        pos[0] = VertexPosition { x: 0, y: 0, z: 0 };
        pos[1] = VertexPosition {
            x: 64 << SUBPIXEL_BITS,
            y: 64 << SUBPIXEL_BITS,
            z: 0,
        };
        attr[0].uv = [0, 0];
        attr[1].uv = [(64 << SUBPIXEL_BITS) as u16, (64 << SUBPIXEL_BITS) as u16];

        // FST (UV addressing).
        let prim = Prim(1 << 8);
        let topo = Topology::of(PrimType::Sprite).unwrap();
        (pos, attr, ctx, prim, topo)
    }

    #[test]
    fn test_feedback_pixel_mode() {
        let (pos, attr, ctx, prim, topo) = feedback_fixture();
        let mut uv_bb = [0i32; 4];
        let mode =
            deduce_color_feedback_mode(&pos, &attr, &ctx, prim, topo, &mut uv_bb, [0, 0, 63, 63]);
        assert_eq!(mode, ColorFeedbackMode::Pixel);
        assert_eq!(uv_bb, [0, 0, 64, 64]);
    }

    #[test]
    fn test_feedback_sliced_on_linear_mag() {
        let (pos, attr, mut ctx, prim, topo) = feedback_fixture();
        ctx.tex1 = Tex1(0).with_mmag(MMAG_LINEAR);
        let mut uv_bb = [0i32; 4];
        let mode =
            deduce_color_feedback_mode(&pos, &attr, &ctx, prim, topo, &mut uv_bb, [0, 0, 63, 63]);
        assert_eq!(mode, ColorFeedbackMode::Sliced);
    }

    #[test]
    fn test_feedback_sliced_on_uv_offset() {
        let (pos, mut attr, ctx, prim, topo) = feedback_fixture();
        // Shift UVs a full pixel off the positions.
        attr[0].uv = [16, 16];
        attr[1].uv = [(64 << SUBPIXEL_BITS) as u16 + 16, (64 << SUBPIXEL_BITS) as u16 + 16];
        let mut uv_bb = [0i32; 4];
        let mode =
            deduce_color_feedback_mode(&pos, &attr, &ctx, prim, topo, &mut uv_bb, [0, 0, 63, 63]);
        assert_eq!(mode, ColorFeedbackMode::Sliced);
    }

    #[test]
    fn test_feedback_none_for_lines() {
        let (pos, attr, ctx, prim, _) = feedback_fixture();
        let topo = Topology::of(PrimType::LineList).unwrap();
        let mut uv_bb = [0i32; 4];
        let mode =
            deduce_color_feedback_mode(&pos, &attr, &ctx, prim, topo, &mut uv_bb, [0, 0, 63, 63]);
        assert_eq!(mode, ColorFeedbackMode::None);
    }

    #[test]
    fn test_sub_pixel_delta_still_pixel_mode() {
        let (pos, mut attr, ctx, prim, topo) = feedback_fixture();
        // A delta inside [0, 16) keeps NEAREST snapping exact.
        attr[0].uv = [8, 8];
        attr[1].uv = [(64 << SUBPIXEL_BITS) as u16 + 8, (64 << SUBPIXEL_BITS) as u16 + 8];
        let mut uv_bb = [0i32; 4];
        let mode =
            deduce_color_feedback_mode(&pos, &attr, &ctx, prim, topo, &mut uv_bb, [0, 0, 63, 63]);
        assert_eq!(mode, ColorFeedbackMode::Pixel);
    }
}
