// SPDX-FileCopyrightText: 2025 gsrx contributors
// SPDX-License-Identifier: GPL-3.0-or-later

//! CLUT (palette) upload pipeline.
//!
//! Every TEX0 write interprets CLD to decide whether the on-chip CLUT
//! reloads. Redundant uploads are extremely common, so a small ring memoizes
//! recent uploads by (CSA mask, TEX0, TEXCLUT) and reuses their palette
//! instance without touching the backend; this optimization carries real
//! workloads.

use crate::backend::{GsBackend, PaletteUploadDescriptor};
use crate::interface::GsInterface;
use crate::page_tracker::FlushReason;
use crate::psm::{compute_page_rect, PageRectClut, PSM_CT32, PSM_T8, PSM_T8H};
use crate::regs::{
    CLD_COMPARE_LOAD_CBP0, CLD_COMPARE_LOAD_CBP1, CLD_LOAD, CLD_LOAD_WRITE_CBP0,
    CLD_LOAD_WRITE_CBP1, CSM_LAYOUT_LINE, CSM_LAYOUT_RECT, COU_SCALE,
};
use crate::render_pass::{MemoizedPalette, CLUT_INSTANCES, NUM_MEMOIZED_PALETTES};

impl<B: GsBackend> GsInterface<B> {
    pub(crate) fn handle_tex0_write(&mut self, ctx_index: usize) {
        self.handle_clut_upload(ctx_index);
    }

    fn handle_clut_upload(&mut self, ctx_index: usize) {
        let tex0 = self.core.regs.ctx[ctx_index].tex0;
        let cld = tex0.cld();

        let load_clut = match cld {
            CLD_LOAD => true,
            CLD_LOAD_WRITE_CBP0 | CLD_LOAD_WRITE_CBP1 => {
                self.core.regs.cached_cbp[(cld & 1) as usize] = tex0.cbp();
                true
            }
            CLD_COMPARE_LOAD_CBP0 | CLD_COMPARE_LOAD_CBP1 => {
                let slot = (cld & 1) as usize;
                let load = self.core.regs.cached_cbp[slot] != tex0.cbp();
                self.core.regs.cached_cbp[slot] = tex0.cbp();
                load
            }
            _ => false,
        };
        if !load_clut {
            return;
        }

        // A partial transfer in flight may feed this CLUT; the HWREG write
        // should have landed already, so push it out first.
        if self.core.transfer.host_to_local_active
            && self.core.transfer.host_to_local_payload.len()
                > self.core.transfer.last_flushed_qwords
        {
            log::trace!("flushing partial transfer due to palette read");
            self.flush_pending_transfer(true);
        }

        let psm = tex0.psm();
        let cpsm = tex0.cpsm();
        let is_8bit_palette = matches!(psm, PSM_T8 | PSM_T8H);

        let (palette_width, palette_height, mut csa_mask) = if is_8bit_palette {
            if tex0.csm() != CSM_LAYOUT_RECT {
                (256, 1, 0xffffu32)
            } else {
                (16, 16, 0xffffu32)
            }
        } else if tex0.csm() != CSM_LAYOUT_RECT {
            (16, 1, 1u32 << tex0.csa())
        } else {
            (8, 4, 1u32 << tex0.csa())
        };

        // For 32-bit color, the upper CLUT bank is read as well.
        if cpsm == PSM_CT32 {
            csa_mask |= csa_mask << 16;
        }

        let texclut = self.core.regs.texclut;
        let x_offset = if tex0.csm() == CSM_LAYOUT_LINE {
            texclut.cou() * COU_SCALE
        } else {
            0
        };
        let y_offset = if tex0.csm() == CSM_LAYOUT_LINE {
            texclut.cov()
        } else {
            0
        };

        let rect = compute_page_rect(
            tex0.cbp(),
            x_offset,
            y_offset,
            palette_width,
            palette_height,
            texclut.cbw(),
            cpsm,
        );
        let clut_page = PageRectClut { rect, csa_mask };

        self.tracker.mark_texture_read(&mut self.core, &rect);
        self.tracker.register_cached_clut_clobber(&clut_page);

        // Queue up the palette upload with upload-irrelevant fields
        // normalized away.
        let mut upload_tex0 = tex0
            .with_tbp0(0)
            .with_tfx(0)
            .with_tw(0)
            .with_th(0)
            .with_tcc(false)
            .with_tbw(0)
            .with_cld(0);
        // CSA is ignored on upload in 256-color mode.
        if is_8bit_palette {
            upload_tex0 = upload_tex0.with_csa(0);
        }

        let palette_desc = PaletteUploadDescriptor {
            tex0: upload_tex0.bits(),
            texclut: texclut.bits(),
        };

        // Walk the memoization ring newest-first.
        for i in (0..self.core.render_pass.num_memoized_palettes).rev() {
            let memoized = self.core.render_pass.memoized_palettes[i];

            // A later upload wrote something this one did not: diverging
            // history, stop searching.
            if memoized.csa_mask & !clut_page.csa_mask != 0 {
                break;
            }

            if memoized.csa_mask == clut_page.csa_mask && memoized.upload == palette_desc {
                if memoized.clut_instance != self.core.render_pass.clut_instance {
                    self.core.mark_texture_state_dirty();
                }
                self.core.render_pass.clut_instance = memoized.clut_instance;

                // Move to the end of the ring.
                let rp = &mut self.core.render_pass;
                if i + 1 < rp.num_memoized_palettes {
                    rp.memoized_palettes
                        .copy_within(i + 1..rp.num_memoized_palettes, i);
                    let last = rp.num_memoized_palettes - 1;
                    rp.memoized_palettes[last] = MemoizedPalette {
                        csa_mask: clut_page.csa_mask,
                        upload: palette_desc,
                        clut_instance: rp.clut_instance,
                    };
                }
                return;
            }
        }

        let instance = self.core.backend.update_palette_cache(&palette_desc);
        let rp = &mut self.core.render_pass;
        rp.clut_instance = instance;
        rp.latest_clut_instance = instance;
        rp.pending_palette_updates += 1;
        self.core.mark_texture_state_dirty();

        // Maintain the sliding window.
        let rp = &mut self.core.render_pass;
        if rp.num_memoized_palettes == NUM_MEMOIZED_PALETTES {
            rp.memoized_palettes.copy_within(1.., 0);
            rp.num_memoized_palettes -= 1;
        }
        let slot = rp.num_memoized_palettes;
        rp.memoized_palettes[slot] = MemoizedPalette {
            csa_mask: clut_page.csa_mask,
            upload: palette_desc,
            clut_instance: rp.clut_instance,
        };
        rp.num_memoized_palettes += 1;

        if rp.pending_palette_updates >= CLUT_INSTANCES {
            self.tracker
                .flush_render_pass(&mut self.core, FlushReason::Overflow);
        }
    }
}
