// SPDX-FileCopyrightText: 2025 gsrx contributors
// SPDX-License-Identifier: GPL-3.0-or-later

//! Vertex queue and drawing-kick pipeline.
//!
//! Vertex kicks push into a 3-deep queue; a kick that completes a primitive
//! (a drawing kick) runs the per-draw pipeline: degenerate check, feedback
//! classification, bounding box with top-left raster rules, frame-buffer
//! recheck, state/texture commit, and finally appends the primitive to the
//! render pass and damages the covered FB/Z pages.

use gsrx_common::SUBPIXEL_BITS;

use crate::backend::GsBackend;
use crate::interface::GsInterface;
use crate::page_tracker::FlushReason;
use crate::regs::{PrimType, Xyz, Xyzf};
use crate::render_pass::{
    ALPHA_AFIX_OFFSET, ALPHA_AREF_OFFSET, MAX_PRIMITIVES_PER_FLUSH, MAX_STATE_VECTORS,
    MAX_TEXTURES, CLUT_INSTANCES, PrimitiveAttribute, STATE_BIT_FIX, STATE_BIT_LINE,
    STATE_BIT_MULTISAMPLE, STATE_BIT_PARALLELOGRAM, STATE_BIT_SNAP_RASTER, STATE_BIT_SPRITE,
    STATE_BIT_Z_WRITE,
};
use crate::state::{deduce_color_feedback_mode, ColorFeedbackMode, StateDirtyFlags};

/// Vertex position in 12.4 subpixel fixed point. Z stays integer through the
/// whole pipeline; 32-bit depth survives without float rounding.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
#[repr(C)]
pub struct VertexPosition {
    pub x: i32,
    pub y: i32,
    pub z: u32,
}

/// Attributes latched from the register file at vertex-kick time.
#[derive(Debug, Clone, Copy, Default)]
#[repr(C)]
pub struct VertexAttribute {
    pub st: [f32; 2],
    pub q: f32,
    pub rgba: u32,
    pub fog: f32,
    pub uv: [u16; 2],
}

/// Sliding window of up to three vertices.
#[derive(Debug, Clone, Copy, Default)]
pub struct VertexQueue {
    pub pos: [VertexPosition; 3],
    pub attr: [VertexAttribute; 3],
    pub count: usize,
}

/// How a PRIM topology consumes the vertex queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Topology {
    pub list: bool,
    pub fan: bool,
    pub quad: bool,
    pub vertices: usize,
}

impl Topology {
    pub fn of(prim: PrimType) -> Option<Topology> {
        match prim {
            PrimType::Point => Some(Topology {
                list: true,
                fan: false,
                quad: true,
                vertices: 1,
            }),
            PrimType::LineList => Some(Topology {
                list: true,
                fan: false,
                quad: false,
                vertices: 2,
            }),
            PrimType::LineStrip => Some(Topology {
                list: false,
                fan: false,
                quad: false,
                vertices: 2,
            }),
            PrimType::TriangleList => Some(Topology {
                list: true,
                fan: false,
                quad: false,
                vertices: 3,
            }),
            PrimType::TriangleStrip => Some(Topology {
                list: false,
                fan: false,
                quad: false,
                vertices: 3,
            }),
            PrimType::TriangleFan => Some(Topology {
                list: false,
                fan: true,
                quad: false,
                vertices: 3,
            }),
            PrimType::Sprite => Some(Topology {
                list: true,
                fan: false,
                quad: true,
                vertices: 2,
            }),
            PrimType::Invalid => None,
        }
    }

    pub fn is_line(&self) -> bool {
        !self.quad && self.vertices == 2
    }
}

impl<B: GsBackend> crate::interface::GsCore<B> {
    /// Strips keep the two most recent vertices when the queue is full.
    fn shift_vertex_queue(&mut self) {
        let q = &mut self.vertex_queue;
        if q.count == 3 {
            q.pos[0] = q.pos[1];
            q.attr[0] = q.attr[1];
            q.pos[1] = q.pos[2];
            q.attr[1] = q.attr[2];
            q.count = 2;
        }
    }

    pub fn vertex_kick_xyz(&mut self, xyz: Xyz) {
        self.shift_vertex_queue();
        let count = self.vertex_queue.count;
        self.vertex_queue.pos[count] = VertexPosition {
            x: xyz.x() as i32,
            y: xyz.y() as i32,
            z: xyz.z(),
        };
        self.vertex_queue.attr[count] = VertexAttribute {
            st: [self.regs.st.s(), self.regs.st.t()],
            q: self.regs.rgbaq.q(),
            rgba: self.regs.rgbaq.rgba_word(),
            fog: self.regs.fog.f() as f32,
            uv: [self.regs.uv.u() as u16, self.regs.uv.v() as u16],
        };
        self.vertex_queue.count += 1;
    }

    pub fn vertex_kick_xyzf(&mut self, xyzf: Xyzf) {
        self.shift_vertex_queue();
        let count = self.vertex_queue.count;
        self.vertex_queue.pos[count] = VertexPosition {
            x: xyzf.x() as i32,
            y: xyzf.y() as i32,
            z: xyzf.z(),
        };
        self.vertex_queue.attr[count] = VertexAttribute {
            st: [self.regs.st.s(), self.regs.st.t()],
            q: self.regs.rgbaq.q(),
            rgba: self.regs.rgbaq.rgba_word(),
            fog: xyzf.f() as f32,
            uv: [self.regs.uv.u() as u16, self.regs.uv.v() as u16],
        };
        self.vertex_queue.count += 1;
    }

    pub fn reset_vertex_queue(&mut self) {
        self.vertex_queue.count = 0;
    }

    fn drawing_kick_maintain_queue(&mut self, topo: Topology) {
        if topo.fan {
            self.vertex_queue.pos[1] = self.vertex_queue.pos[2];
            self.vertex_queue.attr[1] = self.vertex_queue.attr[2];
            self.vertex_queue.count = 2;
        } else if topo.list {
            self.vertex_queue.count = 0;
        }
        // Strips shift the queue on the next vertex kick.
    }
}

impl<B: GsBackend> GsInterface<B> {
    /// Drawing kick using the topology selected by the PRIM register.
    pub(crate) fn drawing_kick(&mut self, adc: bool) {
        self.drawing_kick_as(self.core.draw_topology, adc);
    }

    /// Drawing kick with an explicit topology (fast-path packet handlers).
    pub(crate) fn drawing_kick_as(&mut self, prim: PrimType, adc: bool) {
        match Topology::of(prim) {
            Some(topo) => self.drawing_kick_primitive(topo, adc),
            None => self.core.vertex_queue.count = 0,
        }
        self.post_draw_kick();
    }

    fn drawing_kick_primitive(&mut self, topo: Topology, adc: bool) {
        if self.core.vertex_queue.count < topo.vertices {
            return;
        }

        if !adc {
            if !self.draw_is_degenerate() {
                self.drawing_kick_append(topo);
            } else {
                log::trace!("degenerate draw dropped");
            }
        }

        // Queue maintenance happens regardless of ADC.
        self.core.drawing_kick_maintain_queue(topo);
    }

    fn drawing_kick_append(&mut self, topo: Topology) {
        let prim = self.core.regs.prim;
        let ctx = self.core.regs.ctx[prim.ctxt()];
        let queue = self.core.vertex_queue;

        let off_x = ctx.xyoffset.ofx() as i32;
        let off_y = ctx.xyoffset.ofy() as i32;

        let mut pos = [VertexPosition::default(); 3];
        let mut attr = [VertexAttribute::default(); 3];

        match topo.vertices {
            1 => {
                pos[0] = queue.pos[queue.count - 1];
                attr[0] = queue.attr[queue.count - 1];

                // A point is a one-pixel parallelogram around its center.
                pos[0].x -= off_x + (1 << (SUBPIXEL_BITS - 1));
                pos[0].y -= off_y + (1 << (SUBPIXEL_BITS - 1));
                pos[1] = pos[0];
                pos[1].x += 1 << SUBPIXEL_BITS;
                pos[1].y += 1 << SUBPIXEL_BITS;
                attr[1] = attr[0];
            }
            2 => {
                for i in 0..2 {
                    pos[i] = queue.pos[queue.count - 1 - i];
                    attr[i] = queue.attr[queue.count - 1 - i];
                    pos[i].x -= off_x;
                    pos[i].y -= off_y;
                }
            }
            _ => {
                for i in 0..3 {
                    pos[i] = queue.pos[2 - i];
                    attr[i] = queue.attr[2 - i];
                    pos[i].x -= off_x;
                    pos[i].y -= off_y;
                }
            }
        }

        let mut lo = [pos[0].x.min(pos[1].x), pos[0].y.min(pos[1].y)];
        let mut hi = [pos[0].x.max(pos[1].x), pos[0].y.max(pos[1].y)];
        let is_line = topo.is_line();

        if !topo.quad && !is_line {
            lo = [lo[0].min(pos[2].x), lo[1].min(pos[2].y)];
            hi = [hi[0].max(pos[2].x), hi[1].max(pos[2].y)];
        }

        hi = [hi[0] - 1, hi[1] - 1];
        // Tighten the lower bound according to top-left raster rules.
        if topo.quad || !prim.aa1() {
            let round = (1 << (SUBPIXEL_BITS - self.core.sampling_rate_y_log2)) - 1;
            lo = [lo[0] + round, lo[1] + round];
        }

        lo = [lo[0] >> SUBPIXEL_BITS, lo[1] >> SUBPIXEL_BITS];
        hi = [hi[0] >> SUBPIXEL_BITS, hi[1] >> SUBPIXEL_BITS];

        // Lines can expand a pixel in any direction.
        if is_line {
            lo = [lo[0] - 1, lo[1] - 1];
            hi = [hi[0] + 1, hi[1] + 1];
        }

        lo = [
            lo[0].max(ctx.scissor.scax0() as i32),
            lo[1].max(ctx.scissor.scay0() as i32),
        ];
        hi = [
            hi[0].min(ctx.scissor.scax1() as i32),
            hi[1].min(ctx.scissor.scay1() as i32),
        ];
        hi[0] = hi[0].min((ctx.frame.fbw() * gsrx_common::BUFFER_WIDTH_SCALE) as i32 - 1);

        let bb = [lo[0], lo[1], hi[0], hi[1]];
        if bb[2] < bb[0] || bb[3] < bb[1] {
            // Scissored away completely.
            return;
        }

        self.update_color_feedback_state();
        let mut uv_bb = [0i32; 4];
        let mut feedback_mode = ColorFeedbackMode::None;
        if self.core.render_pass.is_color_feedback {
            feedback_mode =
                deduce_color_feedback_mode(&pos, &attr, &ctx, prim, topo, &mut uv_bb, bb);
        }

        // A partial host transfer must land before a textured draw can
        // observe it; this can invalidate texture state, so do it before the
        // dirty checks below.
        if prim.tme()
            && self.core.transfer.host_to_local_active
            && self.core.transfer.host_to_local_payload.len()
                > self.core.transfer.last_flushed_qwords
        {
            log::trace!("flushing partial transfer due to texture read");
            self.flush_pending_transfer(true);
        }

        // Even with no state changes, hazards must be considered. A hazard
        // sets dirty bits again, re-triggering the state checks.
        self.check_frame_buffer_state();

        // Re-mark texture reads when the descriptor is clean; a dirty
        // descriptor runs the full hazard check while resolving the index.
        if prim.tme()
            && !self
                .core
                .state
                .dirty_flags
                .contains(StateDirtyFlags::TEX)
        {
            self.texture_page_rects_read();
        }

        self.drawing_kick_update_state(feedback_mode, uv_bb, bb);
        let prim_state = self.core.state.prim_template;

        let mut prim_attr = PrimitiveAttribute {
            tex: prim_state.tex,
            tex2: prim_state.tex2,
            state: prim_state.state,
            fbmsk: ctx.frame.fbmsk(),
            fogcol: self.core.regs.fogcol.word(),
            alpha: (ctx.alpha.fix() << ALPHA_AFIX_OFFSET) | (ctx.test.aref() << ALPHA_AREF_OFFSET),
            bb: [bb[0] as i16, bb[1] as i16, bb[2] as i16, bb[3] as i16],
        };

        if topo.quad {
            prim_attr.state |= 1 << STATE_BIT_PARALLELOGRAM;
            prim_attr.state |= 1 << STATE_BIT_SPRITE;
            prim_attr.state |= 1 << STATE_BIT_SNAP_RASTER;
            prim_attr.state &= !(1 << STATE_BIT_MULTISAMPLE);
        } else if is_line {
            prim_attr.state |= 1 << STATE_BIT_PARALLELOGRAM;
            prim_attr.state |= 1 << STATE_BIT_LINE;
            // Lines never have full coverage; with AA1 they never write Z.
            if prim_attr.state & (1 << STATE_BIT_MULTISAMPLE) != 0 {
                prim_attr.state &= !(1 << STATE_BIT_Z_WRITE);
            }
        }

        if topo.vertices == 1 {
            // Points interpolate nothing, and upscaling cannot split them.
            prim_attr.state |= 1 << STATE_BIT_FIX;
            prim_attr.state |= 1 << STATE_BIT_SNAP_RASTER;
        }

        // Only damage pages when the pass footprint expands; re-marking on
        // every draw would dominate the CPU cost.
        let mut rp_expands = false;
        let is_z_sensitive = self.core.state_is_z_sensitive();

        if !self.core.render_pass.z_sensitive && is_z_sensitive {
            self.core.render_pass.z_sensitive = true;
            rp_expands = true;
        }

        if is_z_sensitive && !ctx.zbuf.zmsk() && !self.core.render_pass.z_write {
            self.core.render_pass.z_write = true;
            // New Z writes can introduce a feedback we did not have before.
            self.core.state.dirty_flags |= StateDirtyFlags::FEEDBACK;
            rp_expands = true;
        }

        let write_mask = !ctx.frame.fbmsk();
        if write_mask & self.core.render_pass.color_write_mask != write_mask {
            self.core.render_pass.color_write_mask |= write_mask;
            rp_expands = true;
        }

        {
            let rp = &mut self.core.render_pass;
            if bb[0] < rp.bb[0] {
                rp.bb[0] = bb[0];
                rp_expands = true;
            }
            if bb[1] < rp.bb[1] {
                rp.bb[1] = bb[1];
                rp_expands = true;
            }
            if bb[2] > rp.bb[2] {
                rp.bb[2] = bb[2];
                rp_expands = true;
            }
            if bb[3] > rp.bb[3] {
                rp.bb[3] = bb[3];
                rp_expands = true;
            }
        }

        if rp_expands {
            let rp_bb = self.core.render_pass.bb;
            let mut fb_rect = self.core.render_pass.compute_fb_rect(rp_bb);
            fb_rect.write_mask &= self.core.render_pass.color_write_mask;
            self.tracker.mark_fb_write(&mut self.core, &fb_rect);

            if self.core.render_pass.z_sensitive {
                let z_rect = self.core.render_pass.compute_z_rect(rp_bb);
                if self.core.render_pass.z_write {
                    self.tracker.mark_fb_write(&mut self.core, &z_rect);
                } else {
                    self.tracker.mark_fb_read(&mut self.core, &z_rect);
                }
            }
        }

        let rp = &mut self.core.render_pass;
        rp.prims.push(prim_attr);
        rp.positions.extend_from_slice(&pos);
        rp.attributes.extend_from_slice(&attr);
        rp.primitive_count += 1;

        // Explicitly clean. If the append path flushed (texture hazard),
        // stray dirty bits would otherwise survive despite the state being
        // freshly rebuilt.
        self.core.state.dirty_flags = StateDirtyFlags::empty();
    }

    pub(crate) fn post_draw_kick(&mut self) {
        let rp = &self.core.render_pass;
        if rp.pending_palette_updates >= CLUT_INSTANCES
            || rp.primitive_count >= MAX_PRIMITIVES_PER_FLUSH
            || rp.tex_infos.len() as u32 >= MAX_TEXTURES
            || rp.state_vectors.len() as u32 >= MAX_STATE_VECTORS
        {
            self.flush_pending_transfer(true);
            self.tracker
                .flush_render_pass(&mut self.core, FlushReason::Overflow);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_topology_table() {
        let sprite = Topology::of(PrimType::Sprite).unwrap();
        assert!(sprite.quad && sprite.list && sprite.vertices == 2);
        assert!(!sprite.is_line());

        let line = Topology::of(PrimType::LineStrip).unwrap();
        assert!(line.is_line() && !line.list);

        let fan = Topology::of(PrimType::TriangleFan).unwrap();
        assert!(fan.fan && fan.vertices == 3);

        assert!(Topology::of(PrimType::Invalid).is_none());
    }
}
