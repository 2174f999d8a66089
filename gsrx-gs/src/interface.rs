// SPDX-FileCopyrightText: 2025 gsrx contributors
// SPDX-License-Identifier: GPL-3.0-or-later

//! Central GS interface.
//!
//! Owns the register file, the four GIF paths, the vertex queue, the render
//! pass accumulator, the transfer engine, the page tracker, and the backend
//! handle. Register writes and GIF transfers run on the caller's thread;
//! ordering toward the backend is enforced by the page tracker's flush
//! lattice, which this type executes in [`PageTrackerEvents::flush`].

use gsrx_common::{DebugMode, GsOptions, SuperSampling, PAGE_SIZE};

use crate::backend::{
    FlushStats, GsBackend, GsError, ScanoutResult, TimestampType, VSyncInfo,
};
use crate::gif::GifPath;
use crate::page_tracker::{
    FlushFlags, FlushReason, PageTracker, PageTrackerEvents, TIMELINE_HAZARD,
};
use crate::psm::PageRect;
use crate::regs::{
    addr, Prim, PrivRegisterState, Prmodecont, RegisterState, Tex0, Xyz, Xyzf,
};
use crate::render_pass::RenderPassState;
use crate::state::{StateDirtyFlags, StateTracker};
use crate::transfer::TransferState;
use crate::vertex::VertexQueue;

/// Everything except the tracker; this is the tracker's event sink, so the
/// two must be separate borrows.
pub struct GsCore<B: GsBackend> {
    pub regs: RegisterState,
    pub priv_regs: PrivRegisterState,
    pub paths: [GifPath; 4],
    pub vertex_queue: VertexQueue,
    pub state: StateTracker,
    pub render_pass: RenderPassState,
    pub transfer: TransferState,
    pub backend: B,
    pub sync_host_vram_pages: Vec<u32>,
    pub sync_vram_host_pages: Vec<u32>,
    pub page_buffer: Vec<u32>,
    pub sampling_rate_x_log2: u32,
    pub sampling_rate_y_log2: u32,
    pub vram_size: u32,
    pub debug_mode: DebugMode,
    /// Topology selected by the PRIM register.
    pub draw_topology: crate::regs::PrimType,
}

impl<B: GsBackend> GsCore<B> {
    fn drain_page_bitset(bitset: &mut [u32], out: &mut Vec<u32>) {
        out.clear();
        for (i, word) in bitset.iter_mut().enumerate() {
            let mut bits = *word;
            *word = 0;
            while bits != 0 {
                let bit = bits.trailing_zeros();
                bits &= bits - 1;
                out.push((i as u32) * 32 + bit);
            }
        }
    }
}

impl<B: GsBackend> PageTrackerEvents for GsCore<B> {
    fn flush(&mut self, flags: FlushFlags, reason: FlushReason) {
        if flags.contains(FlushFlags::HOST_VRAM_SYNC) {
            let mut pages = std::mem::take(&mut self.page_buffer);
            Self::drain_page_bitset(&mut self.sync_host_vram_pages, &mut pages);
            if !pages.is_empty() {
                self.backend.flush_host_vram_copy(&pages);
            }
            self.page_buffer = pages;
        }

        if flags.contains(FlushFlags::COPY) {
            if flags.intersects(FlushFlags::CACHE | FlushFlags::FB | FlushFlags::WRITE_BACK) {
                self.backend.flush_transfer();
            } else {
                // Nothing beyond copies is flushing: this is a WAW hazard
                // resolved with an execution barrier.
                self.backend.transfer_overlap_barrier();
            }
        }

        if flags.contains(FlushFlags::CACHE) {
            self.backend.flush_cache_upload();
        }

        if flags.contains(FlushFlags::FB) {
            self.flush_render_pass(reason);
        }

        if flags.contains(FlushFlags::WRITE_BACK) {
            let mut pages = std::mem::take(&mut self.page_buffer);
            Self::drain_page_bitset(&mut self.sync_vram_host_pages, &mut pages);
            if !pages.is_empty() {
                self.backend.flush_readback(&pages);
            }
            self.page_buffer = pages;
        }
    }

    fn sync_host_vram_page(&mut self, page_index: u32) {
        self.sync_host_vram_pages[(page_index / 32) as usize] |= 1 << (page_index & 31);
    }

    fn sync_vram_host_page(&mut self, page_index: u32) {
        self.sync_vram_host_pages[(page_index / 32) as usize] |= 1 << (page_index & 31);
    }

    fn invalidate_texture_hash(&mut self, hash: u64, clut: bool) {
        // CLUT-keyed textures carry the palette bank in their hash; the map
        // entry only exists for non-CLUT invalidations.
        if !clut {
            if let Some(entry) = self.render_pass.texture_map.get_mut(&hash) {
                entry.valid = false;
            }
        }
        self.mark_texture_state_dirty();
    }

    fn forget_in_render_pass_memoization(&mut self) {
        self.render_pass.num_memoized_palettes = 0;
        self.mark_texture_state_dirty();
    }
}

/// Update a raw register word, accumulating dirty bits only on change.
fn update_internal_register(
    state: &mut StateTracker,
    reg: &mut u64,
    value: u64,
    flags: StateDirtyFlags,
) {
    if *reg != value {
        *reg = value;
        state.dirty_flags |= flags;
    }
}

/// The GS front end.
pub struct GsInterface<B: GsBackend> {
    pub(crate) core: GsCore<B>,
    pub(crate) tracker: PageTracker,
}

impl<B: GsBackend> GsInterface<B> {
    pub fn new(mut backend: B, options: GsOptions) -> Result<Self, GsError> {
        backend.init(&options)?;

        let vram_size = options.vram_size;
        let num_pages = vram_size / PAGE_SIZE as u32;
        let num_page_words = ((num_pages + 31) / 32) as usize;

        let mut tracker = PageTracker::new();
        tracker.set_num_pages(num_pages);

        let (sampling_rate_x_log2, sampling_rate_y_log2) = options.super_sampling.rate_log2();

        let mut core = GsCore {
            regs: RegisterState {
                internal_q: 1.0,
                ..Default::default()
            },
            priv_regs: PrivRegisterState::default(),
            paths: [GifPath::default(); 4],
            vertex_queue: VertexQueue::default(),
            state: StateTracker::new(),
            render_pass: RenderPassState::new(),
            transfer: TransferState::default(),
            backend,
            sync_host_vram_pages: vec![0; num_page_words],
            sync_vram_host_pages: vec![0; num_page_words],
            page_buffer: Vec::with_capacity(num_page_words * 32),
            sampling_rate_x_log2,
            sampling_rate_y_log2,
            vram_size,
            debug_mode: DebugMode::default(),
            draw_topology: crate::regs::PrimType::Invalid,
        };
        // PRMODE selection defaults to the PRIM register.
        core.regs.prmodecont = Prmodecont(1);

        log::info!(
            "GS interface: {} KiB VRAM, {} pages, super-sampling ({}, {})",
            vram_size / 1024,
            num_pages,
            sampling_rate_x_log2,
            sampling_rate_y_log2
        );

        Ok(Self { core, tracker })
    }

    pub fn set_super_sampling_rate(&mut self, super_sampling: SuperSampling) {
        let (x, y) = super_sampling.rate_log2();
        self.core.sampling_rate_x_log2 = x;
        self.core.sampling_rate_y_log2 = y;
        self.core.backend.invalidate_super_sampling_state();
    }

    pub fn set_debug_mode(&mut self, mode: DebugMode) {
        self.core.debug_mode = mode;
    }

    // ── Register dispatch ───────────────────────────────────────────────

    pub fn write_register(&mut self, address: u32, payload: u64) {
        match address {
            addr::PRIM => self.ad_prim(payload),
            addr::RGBAQ | addr::RGBAQ_ALIAS => self.ad_rgbaq(payload),
            addr::ST => self.ad_st(payload),
            addr::UV => self.ad_uv(payload),
            addr::XYZF2 => self.ad_xyzf2(payload),
            addr::XYZ2 => self.ad_xyz2(payload),
            addr::TEX0_1 => self.ad_tex0(0, payload),
            addr::TEX0_2 => self.ad_tex0(1, payload),
            addr::CLAMP_1 => self.ad_clamp(0, payload),
            addr::CLAMP_2 => self.ad_clamp(1, payload),
            addr::FOG => self.ad_fog(payload),
            addr::XYZF3 => self.ad_xyzf3(payload),
            addr::XYZ3 => self.ad_xyz3(payload),
            addr::TEX1_1 => self.ad_tex1(0, payload),
            addr::TEX1_2 => self.ad_tex1(1, payload),
            addr::TEX2_1 => self.ad_tex2(0, payload),
            addr::TEX2_2 => self.ad_tex2(1, payload),
            addr::XYOFFSET_1 => self.core.regs.ctx[0].xyoffset.0 = payload,
            addr::XYOFFSET_2 => self.core.regs.ctx[1].xyoffset.0 = payload,
            addr::PRMODECONT => self.core.regs.prmodecont.0 = payload,
            addr::PRMODE => self.ad_prmode(payload),
            addr::TEXCLUT => self.core.regs.texclut.0 = payload,
            addr::SCANMSK => update_internal_register(
                &mut self.core.state,
                &mut self.core.regs.scanmsk.0,
                payload,
                StateDirtyFlags::PRIM_TEMPLATE,
            ),
            addr::MIPTBP1_1 => self.ad_miptbp(0, false, payload),
            addr::MIPTBP1_2 => self.ad_miptbp(1, false, payload),
            addr::MIPTBP2_1 => self.ad_miptbp(0, true, payload),
            addr::MIPTBP2_2 => self.ad_miptbp(1, true, payload),
            addr::TEXA => update_internal_register(
                &mut self.core.state,
                &mut self.core.regs.texa.0,
                payload,
                StateDirtyFlags::PRIM_TEMPLATE | StateDirtyFlags::TEX,
            ),
            addr::FOGCOL => self.core.regs.fogcol.0 = payload,
            // TEXFLUSH cannot be relied on; invalidation runs off the
            // tracker's own write bookkeeping instead.
            addr::TEXFLUSH => {}
            addr::SCISSOR_1 => update_internal_register(
                &mut self.core.state,
                &mut self.core.regs.ctx[0].scissor.0,
                payload,
                StateDirtyFlags::DEGENERATE,
            ),
            addr::SCISSOR_2 => update_internal_register(
                &mut self.core.state,
                &mut self.core.regs.ctx[1].scissor.0,
                payload,
                StateDirtyFlags::DEGENERATE,
            ),
            addr::ALPHA_1 => self.ad_alpha(0, payload),
            addr::ALPHA_2 => self.ad_alpha(1, payload),
            addr::DIMX => update_internal_register(
                &mut self.core.state,
                &mut self.core.regs.dimx.0,
                payload,
                StateDirtyFlags::STATE | StateDirtyFlags::PRIM_TEMPLATE,
            ),
            addr::DTHE => update_internal_register(
                &mut self.core.state,
                &mut self.core.regs.dthe.0,
                payload,
                StateDirtyFlags::STATE | StateDirtyFlags::PRIM_TEMPLATE,
            ),
            addr::COLCLAMP => update_internal_register(
                &mut self.core.state,
                &mut self.core.regs.colclamp.0,
                payload,
                StateDirtyFlags::STATE | StateDirtyFlags::PRIM_TEMPLATE,
            ),
            addr::TEST_1 => update_internal_register(
                &mut self.core.state,
                &mut self.core.regs.ctx[0].test.0,
                payload,
                StateDirtyFlags::DEGENERATE
                    | StateDirtyFlags::STATE
                    | StateDirtyFlags::PRIM_TEMPLATE,
            ),
            addr::TEST_2 => update_internal_register(
                &mut self.core.state,
                &mut self.core.regs.ctx[1].test.0,
                payload,
                StateDirtyFlags::DEGENERATE
                    | StateDirtyFlags::STATE
                    | StateDirtyFlags::PRIM_TEMPLATE,
            ),
            addr::PABE => update_internal_register(
                &mut self.core.state,
                &mut self.core.regs.pabe.0,
                payload,
                StateDirtyFlags::STATE | StateDirtyFlags::PRIM_TEMPLATE,
            ),
            addr::FBA_1 => update_internal_register(
                &mut self.core.state,
                &mut self.core.regs.ctx[0].fba.0,
                payload,
                StateDirtyFlags::STATE | StateDirtyFlags::PRIM_TEMPLATE,
            ),
            addr::FBA_2 => update_internal_register(
                &mut self.core.state,
                &mut self.core.regs.ctx[1].fba.0,
                payload,
                StateDirtyFlags::STATE | StateDirtyFlags::PRIM_TEMPLATE,
            ),
            addr::FRAME_1 => update_internal_register(
                &mut self.core.state,
                &mut self.core.regs.ctx[0].frame.0,
                payload,
                StateDirtyFlags::DEGENERATE
                    | StateDirtyFlags::FEEDBACK
                    | StateDirtyFlags::FB
                    | StateDirtyFlags::PRIM_TEMPLATE,
            ),
            addr::FRAME_2 => update_internal_register(
                &mut self.core.state,
                &mut self.core.regs.ctx[1].frame.0,
                payload,
                StateDirtyFlags::DEGENERATE
                    | StateDirtyFlags::FEEDBACK
                    | StateDirtyFlags::FB
                    | StateDirtyFlags::PRIM_TEMPLATE,
            ),
            addr::ZBUF_1 => update_internal_register(
                &mut self.core.state,
                &mut self.core.regs.ctx[0].zbuf.0,
                payload,
                StateDirtyFlags::FEEDBACK
                    | StateDirtyFlags::DEGENERATE
                    | StateDirtyFlags::FB
                    | StateDirtyFlags::PRIM_TEMPLATE,
            ),
            addr::ZBUF_2 => update_internal_register(
                &mut self.core.state,
                &mut self.core.regs.ctx[1].zbuf.0,
                payload,
                StateDirtyFlags::FEEDBACK
                    | StateDirtyFlags::DEGENERATE
                    | StateDirtyFlags::FB
                    | StateDirtyFlags::PRIM_TEMPLATE,
            ),
            addr::BITBLTBUF => self.core.regs.bitbltbuf.0 = payload,
            addr::TRXPOS => self.core.regs.trxpos.0 = payload,
            addr::TRXREG => self.core.regs.trxreg.0 = payload,
            addr::TRXDIR => {
                self.core.regs.trxdir.0 = payload;
                self.init_transfer();
            }
            addr::HWREG => self.hwreg_write(payload),
            // Interrupt signalling registers; no effect on translation.
            addr::SIGNAL | addr::FINISH | addr::LABEL => {}
            _ => log::trace!("ignored write to register 0x{:02X}", address),
        }
    }

    pub(crate) fn ad_prim(&mut self, payload: u64) {
        let prim = Prim(payload);
        let prim_delta = self.core.regs.prim.prim_raw() != prim.prim_raw();

        if self.core.regs.prmodecont.ac() {
            if self.core.regs.prim.ctxt() != prim.ctxt() {
                self.core.state.dirty_flags |= StateDirtyFlags::DEGENERATE
                    | StateDirtyFlags::PRIM_TEMPLATE
                    | StateDirtyFlags::TEX
                    | StateDirtyFlags::FB
                    | StateDirtyFlags::FEEDBACK;
            }

            update_internal_register(
                &mut self.core.state,
                &mut self.core.regs.prim.0,
                payload,
                StateDirtyFlags::FEEDBACK
                    | StateDirtyFlags::PRIM_TEMPLATE
                    | StateDirtyFlags::TEX
                    | StateDirtyFlags::STATE,
            );

            if !self.core.regs.prim.tme() {
                self.core.state.dirty_flags.remove(StateDirtyFlags::TEX);
            }
        } else {
            let merged = self.core.regs.prim.with_prim_raw(prim.prim_raw());
            self.core.regs.prim = merged;
        }

        if prim_delta {
            // A path running a fast handler either ignores PRIM (A+D only)
            // or latched its topology at tag time, so only the generic
            // handler needs the update.
            self.update_draw_handler();
        }

        self.core.reset_vertex_queue();
        self.core.regs.internal_q = 1.0;
    }

    fn ad_prmode(&mut self, payload: u64) {
        if self.core.regs.prmodecont.ac() {
            return;
        }

        let merged = Prim(payload).with_prim_raw(self.core.regs.prim.prim_raw());
        if self.core.regs.prim.ctxt() != merged.ctxt() {
            self.core.state.dirty_flags |= StateDirtyFlags::DEGENERATE
                | StateDirtyFlags::PRIM_TEMPLATE
                | StateDirtyFlags::TEX
                | StateDirtyFlags::FB
                | StateDirtyFlags::FEEDBACK;
        }

        update_internal_register(
            &mut self.core.state,
            &mut self.core.regs.prim.0,
            merged.bits(),
            StateDirtyFlags::FEEDBACK
                | StateDirtyFlags::PRIM_TEMPLATE
                | StateDirtyFlags::TEX
                | StateDirtyFlags::STATE,
        );

        if !self.core.regs.prim.tme() {
            self.core.state.dirty_flags.remove(StateDirtyFlags::TEX);
        }
    }

    pub(crate) fn ad_rgbaq(&mut self, payload: u64) {
        self.core.regs.rgbaq.0 = payload;
    }

    pub(crate) fn ad_st(&mut self, payload: u64) {
        self.core.regs.st.0 = payload;
    }

    pub(crate) fn ad_uv(&mut self, payload: u64) {
        self.core.regs.uv.0 = payload;
    }

    pub(crate) fn ad_fog(&mut self, payload: u64) {
        self.core.regs.fog.0 = payload;
    }

    pub(crate) fn ad_xyzf2(&mut self, payload: u64) {
        self.core.vertex_kick_xyzf(Xyzf(payload));
        self.drawing_kick(false);
    }

    pub(crate) fn ad_xyz2(&mut self, payload: u64) {
        self.core.vertex_kick_xyz(Xyz(payload));
        self.drawing_kick(false);
    }

    pub(crate) fn ad_xyzf3(&mut self, payload: u64) {
        self.core.vertex_kick_xyzf(Xyzf(payload));
    }

    pub(crate) fn ad_xyz3(&mut self, payload: u64) {
        self.core.vertex_kick_xyz(Xyz(payload));
    }

    pub(crate) fn ad_tex0(&mut self, ctx: usize, payload: u64) {
        update_internal_register(
            &mut self.core.state,
            &mut self.core.regs.ctx[ctx].tex0.0,
            payload,
            StateDirtyFlags::FEEDBACK
                | StateDirtyFlags::STATE
                | StateDirtyFlags::PRIM_TEMPLATE
                | StateDirtyFlags::TEX,
        );
        self.handle_tex0_write(ctx);
        self.core.handle_miptbl_gen(ctx);
    }

    /// TEX2 is a partial TEX0 write preserving the geometry/shading fields.
    fn ad_tex2(&mut self, ctx: usize, payload: u64) {
        let preserve = self.core.regs.ctx[ctx].tex0;
        let tex0 = Tex0(payload)
            .with_tbp0(preserve.tbp0())
            .with_tbw(preserve.tbw())
            .with_tw(preserve.tw())
            .with_th(preserve.th())
            .with_tcc(preserve.tcc())
            .with_tfx(preserve.tfx());
        self.ad_tex0(ctx, tex0.bits());
    }

    pub(crate) fn ad_clamp(&mut self, ctx: usize, payload: u64) {
        update_internal_register(
            &mut self.core.state,
            &mut self.core.regs.ctx[ctx].clamp.0,
            payload,
            StateDirtyFlags::FEEDBACK | StateDirtyFlags::PRIM_TEMPLATE | StateDirtyFlags::TEX,
        );
    }

    fn ad_tex1(&mut self, ctx: usize, payload: u64) {
        update_internal_register(
            &mut self.core.state,
            &mut self.core.regs.ctx[ctx].tex1.0,
            payload,
            StateDirtyFlags::FEEDBACK | StateDirtyFlags::PRIM_TEMPLATE | StateDirtyFlags::TEX,
        );
    }

    fn ad_miptbp(&mut self, ctx: usize, high: bool, payload: u64) {
        let reg = if high {
            &mut self.core.regs.ctx[ctx].miptbp2.0
        } else {
            &mut self.core.regs.ctx[ctx].miptbp1.0
        };
        update_internal_register(
            &mut self.core.state,
            reg,
            payload,
            StateDirtyFlags::PRIM_TEMPLATE | StateDirtyFlags::TEX,
        );
    }

    fn ad_alpha(&mut self, ctx: usize, payload: u64) {
        update_internal_register(
            &mut self.core.state,
            &mut self.core.regs.ctx[ctx].alpha.0,
            payload,
            StateDirtyFlags::STATE | StateDirtyFlags::PRIM_TEMPLATE,
        );
    }

    fn update_draw_handler(&mut self) {
        self.core.draw_topology = self.core.regs.prim.prim_type();
    }

    /// External clobber of register state (e.g. save-state load): rebuild
    /// everything derived. Pending GIF tags cannot be trusted either, so the
    /// fast handlers are re-derived per path.
    pub fn clobber_register_state(&mut self) {
        self.core.state.dirty_flags = StateDirtyFlags::all();
        self.update_draw_handler();
        for path_index in 0..4 {
            self.update_fast_gif_handler(path_index);
        }
    }

    // ── Host VRAM access ────────────────────────────────────────────────

    fn byte_range_page_rect(offset: usize, size: usize) -> PageRect {
        let begin_page = (offset / PAGE_SIZE) as u32;
        let end_page = ((offset + size - 1) / PAGE_SIZE) as u32;
        PageRect::whole_pages(begin_page, end_page - begin_page + 1)
    }

    pub fn map_vram_write(&mut self, offset: usize, size: usize) -> &mut [u8] {
        if size == 0 {
            return &mut [];
        }
        let rect = Self::byte_range_page_rect(offset, size);

        let mut timeline = self.tracker.get_host_write_timeline(&rect);
        if timeline == TIMELINE_HAZARD {
            timeline = self.tracker.mark_submission_timeline(&mut self.core);
            self.core.backend.flush_submit(timeline);
        }
        self.core.backend.wait_timeline(timeline);

        &mut self.core.backend.host_vram()[offset..offset + size]
    }

    pub fn end_vram_write(&mut self, offset: usize, size: usize) {
        if size == 0 {
            return;
        }
        let rect = Self::byte_range_page_rect(offset, size);
        self.core.backend.end_host_write_vram_access();
        self.tracker.commit_host_write(&mut self.core, &rect);
    }

    pub fn map_vram_read(&mut self, offset: usize, size: usize) -> &[u8] {
        if size == 0 {
            return &[];
        }
        let rect = Self::byte_range_page_rect(offset, size);

        let mut timeline = self.tracker.get_host_read_timeline(&rect);
        if timeline == TIMELINE_HAZARD {
            timeline = self.tracker.mark_submission_timeline(&mut self.core);
            self.core.backend.flush_submit(timeline);
        }
        self.core.backend.wait_timeline(timeline);

        &self.core.backend.host_vram()[offset..offset + size]
    }

    // ── Frame boundary ──────────────────────────────────────────────────

    /// Flush all batched work and submit.
    pub fn flush(&mut self) {
        self.flush_pending_transfer(true);
        let timeline = self.tracker.mark_submission_timeline(&mut self.core);
        self.core.backend.flush_submit(timeline);
    }

    pub fn vsync(&mut self, info: &VSyncInfo) -> ScanoutResult {
        self.core.backend.vsync(&self.core.priv_regs, info)
    }

    pub fn consume_flush_stats(&mut self) -> FlushStats {
        self.core.backend.consume_flush_stats()
    }

    pub fn get_accumulated_timestamps(&self, ty: TimestampType) -> f64 {
        self.core.backend.get_accumulated_timestamps(ty)
    }

    // ── State access ────────────────────────────────────────────────────

    pub fn write_priv_register(&mut self, address: u32, value: u64) {
        self.core.priv_regs.write(address, value);
    }

    pub fn register_state(&self) -> &RegisterState {
        &self.core.regs
    }

    pub fn register_state_mut(&mut self) -> &mut RegisterState {
        &mut self.core.regs
    }

    pub fn priv_register_state(&self) -> &PrivRegisterState {
        &self.core.priv_regs
    }

    pub fn gif_path(&self, path_index: usize) -> &GifPath {
        &self.core.paths[path_index]
    }

    pub fn backend(&self) -> &B {
        &self.core.backend
    }

    pub fn backend_mut(&mut self) -> &mut B {
        &mut self.core.backend
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{BackendCall, NullBackend};
    use crate::psm::{PSM_CT32, PSM_T8};
    use crate::regs::Xyz;
    use crate::render_pass::{MAX_PRIMITIVES_PER_FLUSH, TEX_FEEDBACK_BIT, TEX_TEXTURE_INDEX_OFFSET};

    fn gs() -> GsInterface<NullBackend> {
        GsInterface::new(NullBackend::new(), GsOptions::default()).unwrap()
    }

    fn frame_bits(fbp: u32, fbw: u32, psm: u32, fbmsk: u32) -> u64 {
        u64::from(fbp) | (u64::from(fbw) << 16) | (u64::from(psm) << 24) | (u64::from(fbmsk) << 32)
    }

    fn scissor_bits(x0: u32, x1: u32, y0: u32, y1: u32) -> u64 {
        u64::from(x0) | (u64::from(x1) << 16) | (u64::from(y0) << 32) | (u64::from(y1) << 48)
    }

    fn tex0_bits(tbp0: u32, tbw: u32, psm: u32, tw: u32, th: u32) -> u64 {
        Tex0(0)
            .with_tbp0(tbp0)
            .with_tbw(tbw)
            .with_tw(tw)
            .with_th(th)
            .bits()
            | (u64::from(psm) << 20)
    }

    /// Environment for a plain untextured sprite pass: FRAME at page 0,
    /// FBW=10, CT32, masked Z.
    fn setup_sprite_env(gs: &mut GsInterface<NullBackend>) {
        gs.write_register(addr::FRAME_1, frame_bits(0, 10, PSM_CT32, 0));
        gs.write_register(addr::ZBUF_1, 1 << 32); // ZMSK
        gs.write_register(addr::TEST_1, 0);
        gs.write_register(addr::SCISSOR_1, scissor_bits(0, 1023, 0, 1023));
        gs.write_register(addr::PRIM, 6); // Sprite, no TME/ABE
    }

    fn kick_sprite(gs: &mut GsInterface<NullBackend>, x0: u32, y0: u32, x1: u32, y1: u32) {
        gs.write_register(addr::XYZ2, Xyz::from_parts(x0, y0, 0).bits());
        gs.write_register(addr::XYZ2, Xyz::from_parts(x1, y1, 0).bits());
    }

    #[test]
    fn test_trivial_sprite_scenario() {
        let mut gs = gs();
        setup_sprite_env(&mut gs);
        kick_sprite(&mut gs, 100, 100, 500, 500);

        let rp = &gs.core.render_pass;
        assert_eq!(rp.primitive_count, 1);
        // Top-left tighten: 100/16 = 6.25 rounds in to pixel 7.
        assert_eq!(rp.bb, [7, 7, 31, 31]);
        assert_eq!(rp.state_vectors.len(), 1);
        assert_eq!(rp.tex_infos.len(), 0);
        assert_eq!(rp.pending_palette_updates, 0);

        gs.flush();
        let backend = gs.backend();
        assert_eq!(
            backend.count_calls(|c| matches!(c, BackendCall::FlushRendering { .. })),
            1
        );
        let render = backend
            .calls
            .iter()
            .find_map(|c| match c {
                BackendCall::FlushRendering {
                    num_primitives,
                    num_states,
                    num_textures,
                    ..
                } => Some((*num_primitives, *num_states, *num_textures)),
                _ => None,
            })
            .unwrap();
        assert_eq!(render, (1, 1, 0));
    }

    #[test]
    fn test_identical_draws_share_state_vector() {
        let mut gs = gs();
        setup_sprite_env(&mut gs);
        kick_sprite(&mut gs, 100, 100, 500, 500);
        kick_sprite(&mut gs, 600, 100, 900, 500);

        let rp = &gs.core.render_pass;
        assert_eq!(rp.primitive_count, 2);
        // Dirty flags were clean for the second draw; the state index must
        // be reproduced, not re-added.
        assert_eq!(rp.state_vectors.len(), 1);
        assert_eq!(rp.prims[0].state, rp.prims[1].state);
        assert!(gs.core.state.dirty_flags.is_empty());
    }

    #[test]
    fn test_feedback_pixel_scenario() {
        let mut gs = gs();
        // 512-wide frame buffer, texture on top of it with matching layout.
        gs.write_register(addr::FRAME_1, frame_bits(0, 8, PSM_CT32, 0));
        gs.write_register(addr::ZBUF_1, 1 << 32);
        gs.write_register(addr::TEST_1, 0);
        gs.write_register(addr::SCISSOR_1, scissor_bits(0, 511, 0, 255));
        gs.write_register(addr::TEX0_1, tex0_bits(0, 8, PSM_CT32, 9, 9));
        // Sprite + TME + FST.
        gs.write_register(addr::PRIM, 6 | (1 << 4) | (1 << 8));

        gs.write_register(addr::UV, 0);
        gs.write_register(addr::XYZ2, Xyz::from_parts(0, 0, 0).bits());
        let max = 64u32 << 4;
        gs.write_register(addr::UV, u64::from(max) | (u64::from(max) << 16));
        gs.write_register(addr::XYZ2, Xyz::from_parts(max, max, 0).bits());

        let rp = &gs.core.render_pass;
        assert_eq!(rp.primitive_count, 1);
        assert!(rp.has_color_feedback);
        assert!(rp.is_color_feedback);
        // The texture index carries the feedback sentinel, not a table slot.
        let tex_index = rp.prims[0].tex >> TEX_TEXTURE_INDEX_OFFSET;
        assert_ne!(tex_index & TEX_FEEDBACK_BIT, 0);
        assert_eq!(rp.tex_infos.len(), 0);
        assert_eq!(
            gs.backend()
                .count_calls(|c| matches!(c, BackendCall::CreateCachedTexture)),
            0
        );
    }

    #[test]
    fn test_copy_hazard_scenario() {
        let mut gs = gs();
        // Frame far away from the transfer destination.
        gs.write_register(addr::FRAME_1, frame_bits(16, 10, PSM_CT32, 0));
        gs.write_register(addr::ZBUF_1, 1 << 32);
        gs.write_register(addr::TEST_1, 0);
        gs.write_register(addr::SCISSOR_1, scissor_bits(0, 1023, 0, 1023));

        // HOST->LOCAL upload of one CT32 page at page 2 (block 64).
        gs.write_register(
            addr::BITBLTBUF,
            (64u64 << 32) | (1u64 << 48) | (u64::from(PSM_CT32) << 56),
        );
        gs.write_register(addr::TRXPOS, 0);
        gs.write_register(addr::TRXREG, 64 | (32u64 << 32));
        gs.write_register(addr::TRXDIR, 0);
        for _ in 0..(64 * 32 * 32 / 64) {
            gs.write_register(addr::HWREG, 0);
        }
        assert_eq!(
            gs.backend().count_calls(|c| matches!(c, BackendCall::CopyVram)),
            1
        );

        // Textured draw sampling the uploaded page.
        gs.write_register(addr::TEX0_1, tex0_bits(64, 1, PSM_CT32, 6, 5));
        gs.write_register(addr::PRIM, 6 | (1 << 4) | (1 << 8));
        gs.write_register(addr::UV, 0);
        gs.write_register(addr::XYZ2, Xyz::from_parts(0, 0, 0).bits());
        gs.write_register(addr::UV, (64u64 << 4) | ((32u64 << 4) << 16));
        gs.write_register(addr::XYZ2, Xyz::from_parts(64 << 4, 32 << 4, 0).bits());

        let calls = &gs.backend().calls;
        let flush_transfer = calls
            .iter()
            .position(|c| matches!(c, BackendCall::FlushTransfer))
            .expect("copy hazard must flush the transfer");
        let flush_cache = calls
            .iter()
            .position(|c| matches!(c, BackendCall::FlushCacheUpload))
            .expect("copy hazard must flush cache uploads");
        let create = calls
            .iter()
            .position(|c| matches!(c, BackendCall::CreateCachedTexture))
            .expect("draw must build the texture");
        assert!(flush_transfer < create);
        assert!(flush_cache < create);

        gs.flush();
        assert_eq!(
            gs.backend()
                .count_calls(|c| matches!(c, BackendCall::FlushRendering { .. })),
            1
        );
    }

    #[test]
    fn test_palette_memoization_scenario() {
        let mut gs = gs();
        gs.write_register(addr::FRAME_1, frame_bits(64, 10, PSM_CT32, 0));
        gs.write_register(addr::ZBUF_1, 1 << 32);
        gs.write_register(addr::TEST_1, 0);
        gs.write_register(addr::SCISSOR_1, scissor_bits(0, 1023, 0, 1023));
        gs.write_register(addr::TEXCLUT, 1);

        // T8 texture at page 2, CLUT at block 96, CLD=1 on every rewrite.
        let tex0 = tex0_bits(64, 2, PSM_T8, 6, 6)
            | (96u64 << 37)
            | (u64::from(crate::regs::CLD_LOAD) << 61);

        gs.write_register(addr::PRIM, 6 | (1 << 4) | (1 << 8));
        for i in 0..3u32 {
            gs.write_register(addr::TEX0_1, tex0);
            gs.write_register(addr::UV, 0);
            gs.write_register(
                addr::XYZ2,
                Xyz::from_parts(i * 1024, 0, 0).bits(),
            );
            gs.write_register(addr::UV, (64u64 << 4) | ((64u64 << 4) << 16));
            gs.write_register(
                addr::XYZ2,
                Xyz::from_parts(i * 1024 + (64 << 4), 64 << 4, 0).bits(),
            );
        }

        // Memoization makes the three identical uploads one backend call.
        assert_eq!(
            gs.backend()
                .count_calls(|c| matches!(c, BackendCall::UpdatePaletteCache)),
            1
        );

        gs.flush();
        let render = gs
            .backend()
            .calls
            .iter()
            .find_map(|c| match c {
                BackendCall::FlushRendering { num_primitives, .. } => Some(*num_primitives),
                _ => None,
            })
            .unwrap();
        assert_eq!(render, 3);
    }

    #[test]
    fn test_render_pass_overflow_scenario() {
        let mut gs = gs();
        setup_sprite_env(&mut gs);

        for _ in 0..MAX_PRIMITIVES_PER_FLUSH + 1 {
            kick_sprite(&mut gs, 100, 100, 500, 500);
        }

        let overflow_flushes: Vec<u32> = gs
            .backend()
            .calls
            .iter()
            .filter_map(|c| match c {
                BackendCall::FlushRendering {
                    num_primitives,
                    reason: FlushReason::Overflow,
                    ..
                } => Some(*num_primitives),
                _ => None,
            })
            .collect();
        assert_eq!(overflow_flushes, vec![MAX_PRIMITIVES_PER_FLUSH]);
        // The N+1th primitive opened a fresh pass.
        assert_eq!(gs.core.render_pass.primitive_count, 1);
    }

    #[test]
    fn test_prmodecont_gating_scenario() {
        let mut gs = gs();

        // AC=0: PRIM writes only update the topology field.
        gs.write_register(addr::PRMODECONT, 0);
        gs.write_register(addr::PRIM, 3 | (1 << 9) | (1 << 4));
        assert_eq!(gs.register_state().prim.prim_raw(), 3);
        assert_eq!(gs.register_state().prim.ctxt(), 0);
        assert!(!gs.register_state().prim.tme());

        // PRMODE now supplies the mode bits, PRIM keeps the topology.
        gs.write_register(addr::PRMODE, (1 << 9) | (1 << 4));
        assert_eq!(gs.register_state().prim.prim_raw(), 3);
        assert_eq!(gs.register_state().prim.ctxt(), 1);
        assert!(gs.register_state().prim.tme());

        // AC=1: PRIM carries everything, PRMODE is ignored.
        gs.write_register(addr::PRMODECONT, 1);
        gs.write_register(addr::PRIM, 6);
        assert_eq!(gs.register_state().prim.ctxt(), 0);
        gs.write_register(addr::PRMODE, 1 << 9);
        assert_eq!(gs.register_state().prim.ctxt(), 0);
    }

    #[test]
    fn test_gif_transfer_split_continuity() {
        // gif_transfer(A) + gif_transfer(B) == gif_transfer(A || B) when
        // split on a quad-word boundary.
        fn packet() -> Vec<u8> {
            // PACKED tag, NLOOP=2, NREG=1, REGS=A+D; two FOGCOL writes.
            let mut data = Vec::new();
            let lo: u64 = 2 | (1 << 60);
            data.extend_from_slice(&lo.to_le_bytes());
            data.extend_from_slice(&0xEu64.to_le_bytes());
            for value in [0x112233u64, 0x445566u64] {
                data.extend_from_slice(&value.to_le_bytes());
                data.extend_from_slice(&u64::from(addr::FOGCOL).to_le_bytes());
            }
            data
        }

        let mut whole = gs();
        whole.gif_transfer(0, &packet());

        let mut split = gs();
        let data = packet();
        split.gif_transfer(0, &data[..32]);
        // Path cursor rests mid-loop between calls.
        assert_eq!(split.gif_path(0).loops, 1);
        split.gif_transfer(0, &data[32..]);

        assert_eq!(
            whole.register_state().fogcol.bits(),
            split.register_state().fogcol.bits()
        );
        assert_eq!(split.register_state().fogcol.bits(), 0x445566);
        assert_eq!(split.gif_path(0).loops, 2);
    }

    #[test]
    fn test_gif_packed_fast_path_matches_generic() {
        // One STQ/RGBAQ/XYZ2 strip loop through the fast path must leave
        // identical state to three A+D-style writes.
        let mut gs = gs();
        setup_sprite_env(&mut gs);
        gs.write_register(addr::PRIM, 6);

        let mut data = Vec::new();
        // Tag: NLOOP=2, NREG=3, PACKED, REGS=ST,RGBAQ,XYZ2.
        let lo: u64 = 2 | (3 << 60);
        data.extend_from_slice(&lo.to_le_bytes());
        data.extend_from_slice(&0x512u64.to_le_bytes());
        for (x, y) in [(100u64, 100u64), (500, 500)] {
            // ST + Q latch.
            data.extend_from_slice(&0u64.to_le_bytes());
            data.extend_from_slice(&1.0f32.to_bits().to_le_bytes());
            data.extend_from_slice(&0u32.to_le_bytes());
            // RGBAQ.
            data.extend_from_slice(&0x80u64.to_le_bytes());
            data.extend_from_slice(&0x80u64.to_le_bytes());
            // XYZ2.
            data.extend_from_slice(&(x | (y << 32)).to_le_bytes());
            data.extend_from_slice(&0u64.to_le_bytes());
        }
        gs.gif_transfer(0, &data);

        assert!(gs.gif_path(0).fast.is_some());
        assert_eq!(gs.core.render_pass.primitive_count, 1);
        assert_eq!(gs.core.render_pass.bb, [7, 7, 31, 31]);
    }

    #[test]
    fn test_host_write_then_read_roundtrip() {
        let mut gs = gs();

        let mapped = gs.map_vram_write(0x4000, 16);
        mapped.copy_from_slice(&[0xAB; 16]);
        gs.end_vram_write(0x4000, 16);

        let read = gs.map_vram_read(0x4000, 16);
        assert_eq!(read, &[0xAB; 16]);
    }

    #[test]
    fn test_fb_write_gates_host_read_on_timeline() {
        let mut gs = gs();
        setup_sprite_env(&mut gs);
        kick_sprite(&mut gs, 100, 100, 500, 500);

        // Mapping the drawn page forces a submit and a wait on its timeline.
        let _ = gs.map_vram_read(0, 16);
        let calls = &gs.backend().calls;
        let submit = calls
            .iter()
            .position(|c| matches!(c, BackendCall::FlushSubmit { .. }))
            .expect("hazard must submit");
        let wait = calls
            .iter()
            .position(|c| matches!(c, BackendCall::WaitTimeline { timeline: 1 }))
            .expect("map must wait the submitted timeline");
        let render = calls
            .iter()
            .position(|c| matches!(c, BackendCall::FlushRendering { .. }))
            .expect("pending pass must flush");
        assert!(render < submit);
        assert!(submit < wait);
    }

    #[test]
    fn test_fb_pointer_change_flushes() {
        let mut gs = gs();
        setup_sprite_env(&mut gs);
        kick_sprite(&mut gs, 100, 100, 500, 500);

        // Re-point the frame buffer and draw again.
        gs.write_register(addr::FRAME_1, frame_bits(32, 10, PSM_CT32, 0));
        kick_sprite(&mut gs, 100, 100, 500, 500);

        let reasons: Vec<FlushReason> = gs
            .backend()
            .calls
            .iter()
            .filter_map(|c| match c {
                BackendCall::FlushRendering { reason, .. } => Some(*reason),
                _ => None,
            })
            .collect();
        assert_eq!(reasons, vec![FlushReason::FBPointer]);
        assert_eq!(gs.core.render_pass.primitive_count, 1);
    }

    #[test]
    fn test_degenerate_draws_are_dropped() {
        let mut gs = gs();
        setup_sprite_env(&mut gs);
        // Scissor with x0 > x1 kills every draw.
        gs.write_register(addr::SCISSOR_1, scissor_bits(100, 0, 0, 1023));
        kick_sprite(&mut gs, 100, 100, 500, 500);
        assert_eq!(gs.core.render_pass.primitive_count, 0);

        // FBMSK all ones with masked Z is equally dead.
        gs.write_register(addr::SCISSOR_1, scissor_bits(0, 1023, 0, 1023));
        gs.write_register(addr::FRAME_1, frame_bits(0, 10, PSM_CT32, 0xffff_ffff));
        kick_sprite(&mut gs, 100, 100, 500, 500);
        assert_eq!(gs.core.render_pass.primitive_count, 0);
    }

    #[test]
    fn test_vsync_and_stats() {
        let mut gs = gs();
        setup_sprite_env(&mut gs);
        kick_sprite(&mut gs, 100, 100, 500, 500);
        gs.flush();

        gs.write_priv_register(crate::regs::priv_addr::BGCOLOR, 0x404040);
        let _ = gs.vsync(&VSyncInfo::default());
        assert_eq!(gs.priv_register_state().bgcolor, 0x404040);

        let stats = gs.consume_flush_stats();
        assert_eq!(stats.num_render_passes, 1);
        assert_eq!(stats.num_primitives, 1);
        assert_eq!(gs.consume_flush_stats(), FlushStats::default());
    }

    #[test]
    fn test_reglist_mode_writes_registers() {
        let mut gs = gs();

        // REGLIST tag: NLOOP=1, NREG=2, REGS = RGBAQ, FOG.
        let mut data = Vec::new();
        let lo: u64 = 1 | (1 << 58) | (2 << 60);
        data.extend_from_slice(&lo.to_le_bytes());
        let regs: u64 = 0x1 | (0xA << 4);
        data.extend_from_slice(&regs.to_le_bytes());
        data.extend_from_slice(&0xDEAD_BEEFu64.to_le_bytes());
        data.extend_from_slice(&(0x42u64 << 56).to_le_bytes());
        gs.gif_transfer(0, &data);

        assert_eq!(gs.register_state().rgbaq.bits(), 0xDEAD_BEEF);
        assert_eq!(gs.register_state().fog.f(), 0x42);
    }

    #[test]
    fn test_image_mode_feeds_transfer() {
        let mut gs = gs();

        // Arm a HOST->LOCAL transfer of 4 CT32 pixels (2 qwords).
        gs.write_register(
            addr::BITBLTBUF,
            (64u64 << 32) | (1u64 << 48) | (u64::from(PSM_CT32) << 56),
        );
        gs.write_register(addr::TRXPOS, 0);
        gs.write_register(addr::TRXREG, 4 | (1u64 << 32));
        gs.write_register(addr::TRXDIR, 0);

        // IMAGE tag with one quad-word of payload followed by the data.
        let mut data = Vec::new();
        let lo: u64 = 1 | (2 << 58);
        data.extend_from_slice(&lo.to_le_bytes());
        data.extend_from_slice(&0u64.to_le_bytes());
        data.extend_from_slice(&0x0102_0304u64.to_le_bytes());
        data.extend_from_slice(&0x0506_0708u64.to_le_bytes());
        gs.gif_transfer(0, &data);

        // 2 qwords == required size: the copy is submitted.
        assert_eq!(
            gs.backend().count_calls(|c| matches!(c, BackendCall::CopyVram)),
            1
        );
        assert!(!gs.core.transfer.host_to_local_active);
    }
}
