// SPDX-FileCopyrightText: 2025 gsrx contributors
// SPDX-License-Identifier: GPL-3.0-or-later

//! GIF path state machine.
//!
//! Four independent paths each carry a stream of 128-bit quad-words. A tag
//! word opens NLOOP loops of NREG register slots; each following word is
//! interpreted per the tag's FLG:
//!
//! | FLG | Mode    | Word layout |
//! |-----|---------|-------------|
//! | 0   | PACKED  | one register per word, selected by the REGS nibble |
//! | 1   | REGLIST | two 64-bit register payloads per word |
//! | 2/3 | IMAGE   | raw HWREG payload |
//!
//! ## GIFTag (128 bits)
//!
//! | Bits    | Field |
//! |---------|-------|
//! | 14:0    | NLOOP |
//! | 15      | EOP   |
//! | 46      | PRE   |
//! | 57:47   | PRIM  |
//! | 59:58   | FLG   |
//! | 63:60   | NREG (0 means 16) |
//! | 127:64  | REGS, 4 bits per slot |
//!
//! A fast path recognizes the common `(FLG, NREG, REGS, PRIM)` descriptors
//! and executes whole loops per call; falling back to the generic dispatcher
//! is byte-identical.

use byteorder::{ByteOrder, LittleEndian};

use crate::backend::GsBackend;
use crate::interface::GsInterface;
use crate::regs::{gif_addr, Fog, PrimType, Qword, Rgbaq, St, Uv};

/// FLG values.
pub const GIF_FLG_PACKED: u32 = 0;
pub const GIF_FLG_REGLIST: u32 = 1;
pub const GIF_FLG_IMAGE: u32 = 2;

/// A decoded GIF tag (kept as raw halves; fields extracted on demand).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct GifTag {
    pub lo: u64,
    pub hi: u64,
}

impl GifTag {
    #[inline]
    pub fn nloop(self) -> u32 {
        (self.lo & 0x7fff) as u32
    }
    #[inline]
    pub fn eop(self) -> bool {
        self.lo & (1 << 15) != 0
    }
    #[inline]
    pub fn pre(self) -> bool {
        self.lo & (1 << 46) != 0
    }
    #[inline]
    pub fn prim(self) -> u32 {
        ((self.lo >> 47) & 0x7ff) as u32
    }
    #[inline]
    pub fn flg(self) -> u32 {
        ((self.lo >> 58) & 3) as u32
    }
    #[inline]
    pub fn nreg(self) -> u32 {
        ((self.lo >> 60) & 0xf) as u32
    }
    /// NREG with the 0-means-16 rule applied.
    #[inline]
    pub fn effective_nreg(self) -> u32 {
        let nreg = self.nreg();
        if nreg == 0 {
            16
        } else {
            nreg
        }
    }
    #[inline]
    pub fn regs(self) -> u64 {
        self.hi
    }
    #[inline]
    pub fn reg_slot(self, slot: u32) -> u32 {
        ((self.hi >> (4 * slot)) & 0xf) as u32
    }
}

/// Whole-loop handlers for recognized packet descriptors.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FastPacketHandler {
    StqRgbaXyz {
        fog: bool,
        prim: PrimType,
        vertices_per_loop: u32,
    },
    UvRgbaXyz {
        fog: bool,
        prim: PrimType,
        vertices_per_loop: u32,
    },
    SpriteStXyzStRgbaXyz {
        fog: bool,
    },
    AdOnly {
        regs_per_loop: u32,
    },
}

/// One GIF producer stream.
#[derive(Debug, Clone, Copy, Default)]
pub struct GifPath {
    pub tag: GifTag,
    pub loops: u32,
    pub reg: u32,
    pub fast: Option<FastPacketHandler>,
}

// REGS signatures of the recognized descriptors.
const STQ_RGBA_XYZ2: u64 = (gif_addr::ST as u64) | ((gif_addr::RGBAQ as u64) << 4) | ((gif_addr::XYZ2 as u64) << 8);
const STQ_RGBA_XYZF2: u64 =
    (gif_addr::ST as u64) | ((gif_addr::RGBAQ as u64) << 4) | ((gif_addr::XYZF2 as u64) << 8);
const UV_RGBA_XYZ2: u64 = (gif_addr::UV as u64) | ((gif_addr::RGBAQ as u64) << 4) | ((gif_addr::XYZ2 as u64) << 8);
const UV_RGBA_XYZF2: u64 =
    (gif_addr::UV as u64) | ((gif_addr::RGBAQ as u64) << 4) | ((gif_addr::XYZF2 as u64) << 8);
const ST_XYZF_ST_RGBA_XYZF: u64 = (gif_addr::ST as u64)
    | ((gif_addr::XYZF2 as u64) << 4)
    | ((gif_addr::ST as u64) << 8)
    | ((gif_addr::RGBAQ as u64) << 12)
    | ((gif_addr::XYZF2 as u64) << 16);
const ST_XYZ_ST_RGBA_XYZ: u64 = (gif_addr::ST as u64)
    | ((gif_addr::XYZ2 as u64) << 4)
    | ((gif_addr::ST as u64) << 8)
    | ((gif_addr::RGBAQ as u64) << 12)
    | ((gif_addr::XYZ2 as u64) << 16);

/// Match a freshly-loaded tag against the fast-path descriptor table.
pub fn detect_fast_handler(tag: GifTag, prim_raw: u32) -> Option<FastPacketHandler> {
    if tag.flg() != GIF_FLG_PACKED || tag.nloop() == 0 {
        return None;
    }

    let prim = PrimType::from_raw(prim_raw);
    let nreg = tag.nreg();
    let regs = tag.regs();

    let handler = if nreg == 3 && regs & 0xfff == STQ_RGBA_XYZ2 {
        // STQ leads RGBAQ (that is how Q updates correctly) and the XYZ
        // kick closes each vertex.
        FastPacketHandler::StqRgbaXyz {
            fog: false,
            prim,
            vertices_per_loop: 1,
        }
    } else if nreg == 3 && regs & 0xfff == STQ_RGBA_XYZF2 {
        FastPacketHandler::StqRgbaXyz {
            fog: true,
            prim,
            vertices_per_loop: 1,
        }
    } else if nreg == 3 && regs & 0xfff == UV_RGBA_XYZ2 {
        FastPacketHandler::UvRgbaXyz {
            fog: false,
            prim,
            vertices_per_loop: 1,
        }
    } else if nreg == 3 && regs & 0xfff == UV_RGBA_XYZF2 {
        FastPacketHandler::UvRgbaXyz {
            fog: true,
            prim,
            vertices_per_loop: 1,
        }
    } else if nreg == 5 && regs & 0xfffff == ST_XYZF_ST_RGBA_XYZF && prim == PrimType::Sprite {
        // Sprite form that skips the duplicate RGBA.
        FastPacketHandler::SpriteStXyzStRgbaXyz { fog: true }
    } else if nreg == 5 && regs & 0xfffff == ST_XYZ_ST_RGBA_XYZ && prim == PrimType::Sprite {
        FastPacketHandler::SpriteStXyzStRgbaXyz { fog: false }
    } else if nreg == 6
        && regs & 0xff_ffff == STQ_RGBA_XYZ2 | (STQ_RGBA_XYZ2 << 12)
        && prim == PrimType::LineList
    {
        FastPacketHandler::StqRgbaXyz {
            fog: false,
            prim,
            vertices_per_loop: 2,
        }
    } else if nreg == 6
        && regs & 0xff_ffff == STQ_RGBA_XYZF2 | (STQ_RGBA_XYZF2 << 12)
        && prim == PrimType::LineList
    {
        FastPacketHandler::StqRgbaXyz {
            fog: true,
            prim,
            vertices_per_loop: 2,
        }
    } else if nreg == 9
        && regs & 0xf_ffff_ffff == STQ_RGBA_XYZ2 | (STQ_RGBA_XYZ2 << 12) | (STQ_RGBA_XYZ2 << 24)
        && prim == PrimType::TriangleList
    {
        FastPacketHandler::StqRgbaXyz {
            fog: false,
            prim,
            vertices_per_loop: 3,
        }
    } else if nreg == 9
        && regs & 0xf_ffff_ffff == STQ_RGBA_XYZF2 | (STQ_RGBA_XYZF2 << 12) | (STQ_RGBA_XYZF2 << 24)
        && prim == PrimType::TriangleList
    {
        FastPacketHandler::StqRgbaXyz {
            fog: true,
            prim,
            vertices_per_loop: 3,
        }
    } else {
        let effective_nreg = tag.effective_nreg();
        let reg_mask = if effective_nreg == 16 {
            u64::MAX
        } else {
            (1u64 << (effective_nreg * 4)) - 1
        };
        let ad_pattern = 0xEEEE_EEEE_EEEE_EEEEu64 & reg_mask;
        if regs & reg_mask == ad_pattern {
            FastPacketHandler::AdOnly {
                regs_per_loop: effective_nreg,
            }
        } else {
            return None;
        }
    };

    Some(handler)
}

#[inline]
fn read_qword(data: &[u8], index: usize) -> Qword {
    let base = index * 16;
    Qword {
        lo: LittleEndian::read_u64(&data[base..base + 8]),
        hi: LittleEndian::read_u64(&data[base + 8..base + 16]),
    }
}

impl<B: GsBackend> GsInterface<B> {
    /// Feed `data` (a multiple of 16 bytes) into one of the four paths.
    pub fn gif_transfer(&mut self, path_index: usize, data: &[u8]) {
        assert!(path_index < 4);
        if data.len() % 16 != 0 {
            log::warn!("gif_transfer size {} not a multiple of 16", data.len());
        }
        let size = data.len() / 16;
        if size == 0 {
            return;
        }

        let mut i = 0usize;
        while i < size {
            let path = self.core.paths[path_index];
            let needs_tag = path.loops == path.tag.nloop();

            if needs_tag {
                let qword = read_qword(data, i);
                let tag = GifTag {
                    lo: qword.lo,
                    hi: qword.hi,
                };
                self.core.paths[path_index].tag = tag;

                if tag.flg() == GIF_FLG_PACKED && tag.pre() {
                    self.ad_prim(tag.prim() as u64);
                }

                self.update_fast_gif_handler(path_index);
                self.core.paths[path_index].loops = 0;
                self.core.paths[path_index].reg = 0;
                i += 1;
                continue;
            }

            let tag = path.tag;
            let nreg = tag.effective_nreg();

            if tag.flg() == GIF_FLG_PACKED {
                if path.reg == 0 && path.fast.is_some() {
                    let loops_available = (size - i) / nreg as usize;
                    let loops_to_run =
                        loops_available.min((tag.nloop() - path.loops) as usize);
                    if loops_to_run != 0 {
                        self.run_fast_handler(path.fast.unwrap(), data, i, loops_to_run);
                        i += loops_to_run * nreg as usize;
                        self.core.paths[path_index].loops += loops_to_run as u32;
                        continue;
                    }
                    // A loop split across transfers falls back to the
                    // generic dispatcher below.
                }

                let qword = read_qword(data, i);
                let addr = tag.reg_slot(path.reg);
                self.core.paths[path_index].reg += 1;

                if addr == gif_addr::A_D {
                    self.write_register(qword.ad_addr(), qword.ad_payload());
                } else {
                    self.packed_write(addr, qword);
                }

                i += 1;
                let path = &mut self.core.paths[path_index];
                if path.reg == nreg {
                    path.loops += 1;
                    path.reg = 0;
                }
            } else if tag.flg() == GIF_FLG_REGLIST {
                // ceil(NLOOP * NREG / 2) words; loops pack tightly when
                // NREG is odd.
                let qword = read_qword(data, i);
                for payload in [qword.lo, qword.hi] {
                    let path = self.core.paths[path_index];
                    let addr = path.tag.reg_slot(path.reg);
                    self.core.paths[path_index].reg += 1;
                    self.reglist_write(addr, payload);

                    let path = &mut self.core.paths[path_index];
                    if path.reg == nreg {
                        path.loops += 1;
                        path.reg = 0;
                        if path.loops == path.tag.nloop() {
                            break;
                        }
                    }
                }
                i += 1;
            } else {
                // IMAGE: spam HWREG.
                let num_loops = (size - i).min((tag.nloop() - path.loops) as usize);
                let mut payload = Vec::with_capacity(num_loops * 2);
                for q in 0..num_loops {
                    let qword = read_qword(data, i + q);
                    payload.push(qword.lo);
                    payload.push(qword.hi);
                }
                self.hwreg_write_multi(&payload);
                i += num_loops;
                self.core.paths[path_index].loops += num_loops as u32;
            }
        }
    }

    pub(crate) fn update_fast_gif_handler(&mut self, path_index: usize) {
        let tag = self.core.paths[path_index].tag;
        let prim_raw = self.core.regs.prim.prim_raw();
        self.core.paths[path_index].fast = detect_fast_handler(tag, prim_raw);
    }

    fn run_fast_handler(
        &mut self,
        handler: FastPacketHandler,
        data: &[u8],
        base: usize,
        num_loops: usize,
    ) {
        match handler {
            FastPacketHandler::StqRgbaXyz {
                fog,
                prim,
                vertices_per_loop,
            } => {
                let vertices = num_loops * vertices_per_loop as usize;
                for v in 0..vertices {
                    let word = base + v * 3;
                    self.packed_st(read_qword(data, word));
                    self.packed_rgbaq(read_qword(data, word + 1));
                    self.packed_vertex_kick(read_qword(data, word + 2), fog, prim);
                }
            }
            FastPacketHandler::UvRgbaXyz {
                fog,
                prim,
                vertices_per_loop,
            } => {
                let vertices = num_loops * vertices_per_loop as usize;
                for v in 0..vertices {
                    let word = base + v * 3;
                    self.packed_uv(read_qword(data, word));
                    self.packed_rgbaq(read_qword(data, word + 1));
                    self.packed_vertex_kick(read_qword(data, word + 2), fog, prim);
                }
            }
            FastPacketHandler::SpriteStXyzStRgbaXyz { fog } => {
                for l in 0..num_loops {
                    let word = base + l * 5;
                    self.packed_st(read_qword(data, word));
                    self.packed_vertex_kick(read_qword(data, word + 1), fog, PrimType::Sprite);
                    self.packed_st(read_qword(data, word + 2));
                    self.packed_rgbaq(read_qword(data, word + 3));
                    self.packed_vertex_kick(read_qword(data, word + 4), fog, PrimType::Sprite);
                }
            }
            FastPacketHandler::AdOnly { regs_per_loop } => {
                let total = num_loops * regs_per_loop as usize;
                for r in 0..total {
                    let qword = read_qword(data, base + r);
                    self.write_register(qword.ad_addr(), qword.ad_payload());
                }
            }
        }
    }

    // ── Packed handlers ─────────────────────────────────────────────────

    fn packed_st(&mut self, qword: Qword) {
        self.core.regs.st = St::from_raw_parts(qword.packed_s_bits(), qword.packed_t_bits());
        self.core.regs.internal_q = f32::from_bits(qword.packed_q_bits());
    }

    fn packed_rgbaq(&mut self, qword: Qword) {
        self.core.regs.rgbaq = Rgbaq::from_parts(
            qword.packed_r(),
            qword.packed_g(),
            qword.packed_b(),
            qword.packed_a(),
            self.core.regs.internal_q,
        );
    }

    fn packed_uv(&mut self, qword: Qword) {
        self.core.regs.uv = Uv::from_parts(qword.packed_u(), qword.packed_v());
    }

    fn packed_fog(&mut self, qword: Qword) {
        self.core.regs.fog = Fog::from_f(qword.packed_fog());
    }

    /// XYZ/XYZF kick with the topology resolved at detection time.
    fn packed_vertex_kick(&mut self, qword: Qword, fog: bool, prim: PrimType) {
        let adc = qword.packed_adc();
        if fog {
            self.core.vertex_kick_xyzf(qword.packed_xyzf());
        } else {
            self.core.vertex_kick_xyz(qword.packed_xyz());
        }
        self.drawing_kick_as(prim, adc);
    }

    fn packed_xyzf(&mut self, qword: Qword, adc_force: bool) {
        let adc = adc_force || qword.packed_adc();
        self.core.vertex_kick_xyzf(qword.packed_xyzf());
        self.drawing_kick(adc);
    }

    fn packed_xyz(&mut self, qword: Qword, adc_force: bool) {
        let adc = adc_force || qword.packed_adc();
        self.core.vertex_kick_xyz(qword.packed_xyz());
        self.drawing_kick(adc);
    }

    fn packed_write(&mut self, addr: u32, qword: Qword) {
        match addr {
            gif_addr::PRIM => self.ad_prim(qword.lo),
            gif_addr::RGBAQ => self.packed_rgbaq(qword),
            gif_addr::ST => self.packed_st(qword),
            gif_addr::UV => self.packed_uv(qword),
            gif_addr::XYZF2 => self.packed_xyzf(qword, false),
            gif_addr::XYZ2 => self.packed_xyz(qword, false),
            gif_addr::TEX0_1 => self.ad_tex0(0, qword.lo),
            gif_addr::TEX0_2 => self.ad_tex0(1, qword.lo),
            gif_addr::CLAMP_1 => self.ad_clamp(0, qword.lo),
            gif_addr::CLAMP_2 => self.ad_clamp(1, qword.lo),
            gif_addr::FOG => self.packed_fog(qword),
            gif_addr::XYZF3 => self.packed_xyzf(qword, true),
            gif_addr::XYZ3 => self.packed_xyz(qword, true),
            gif_addr::NOP => {}
            _ => log::trace!("packed write to reserved descriptor 0x{:X}", addr),
        }
    }

    fn reglist_write(&mut self, addr: u32, payload: u64) {
        match addr {
            gif_addr::PRIM => self.ad_prim(payload),
            gif_addr::RGBAQ => self.ad_rgbaq(payload),
            gif_addr::ST => self.ad_st(payload),
            gif_addr::UV => self.ad_uv(payload),
            gif_addr::XYZF2 => self.ad_xyzf2(payload),
            gif_addr::XYZ2 => self.ad_xyz2(payload),
            gif_addr::TEX0_1 => self.ad_tex0(0, payload),
            gif_addr::TEX0_2 => self.ad_tex0(1, payload),
            gif_addr::CLAMP_1 => self.ad_clamp(0, payload),
            gif_addr::CLAMP_2 => self.ad_clamp(1, payload),
            gif_addr::FOG => self.ad_fog(payload),
            gif_addr::XYZF3 => self.ad_xyzf3(payload),
            gif_addr::XYZ3 => self.ad_xyz3(payload),
            _ => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tag(nloop: u32, flg: u32, nreg: u32, regs: u64, pre: bool, prim: u32) -> GifTag {
        let mut lo = nloop as u64 & 0x7fff;
        lo |= (pre as u64) << 46;
        lo |= (prim as u64 & 0x7ff) << 47;
        lo |= (flg as u64 & 3) << 58;
        lo |= (nreg as u64 & 0xf) << 60;
        GifTag { lo, hi: regs }
    }

    #[test]
    fn test_tag_fields() {
        let t = tag(0x123, GIF_FLG_REGLIST, 5, 0xABCDE, true, 0x45);
        assert_eq!(t.nloop(), 0x123);
        assert_eq!(t.flg(), GIF_FLG_REGLIST);
        assert_eq!(t.nreg(), 5);
        assert!(t.pre());
        assert_eq!(t.prim(), 0x45);
        assert_eq!(t.reg_slot(0), 0xE);
        assert_eq!(t.reg_slot(4), 0xA);
    }

    #[test]
    fn test_effective_nreg() {
        assert_eq!(tag(1, 0, 0, 0, false, 0).effective_nreg(), 16);
        assert_eq!(tag(1, 0, 7, 0, false, 0).effective_nreg(), 7);
    }

    #[test]
    fn test_detect_stq_rgba_xyz() {
        let t = tag(8, GIF_FLG_PACKED, 3, 0x512, false, 0);
        assert_eq!(
            detect_fast_handler(t, 4),
            Some(FastPacketHandler::StqRgbaXyz {
                fog: false,
                prim: PrimType::TriangleStrip,
                vertices_per_loop: 1,
            })
        );

        // XYZF variant.
        let t = tag(8, GIF_FLG_PACKED, 3, 0x412, false, 0);
        assert_eq!(
            detect_fast_handler(t, 3),
            Some(FastPacketHandler::StqRgbaXyz {
                fog: true,
                prim: PrimType::TriangleList,
                vertices_per_loop: 1,
            })
        );
    }

    #[test]
    fn test_detect_trilist_repeat() {
        let regs = 0x512 | (0x512 << 12) | (0x512 << 24);
        let t = tag(8, GIF_FLG_PACKED, 9, regs, false, 0);
        assert_eq!(
            detect_fast_handler(t, PrimType::TriangleList as u32),
            Some(FastPacketHandler::StqRgbaXyz {
                fog: false,
                prim: PrimType::TriangleList,
                vertices_per_loop: 3,
            })
        );
        // The 9-register repeat only applies to triangle lists.
        assert_eq!(detect_fast_handler(t, PrimType::TriangleStrip as u32), None);
    }

    #[test]
    fn test_detect_sprite_form() {
        let t = tag(4, GIF_FLG_PACKED, 5, ST_XYZF_ST_RGBA_XYZF, false, 0);
        assert_eq!(
            detect_fast_handler(t, PrimType::Sprite as u32),
            Some(FastPacketHandler::SpriteStXyzStRgbaXyz { fog: true })
        );
        assert_eq!(detect_fast_handler(t, PrimType::Point as u32), None);
    }

    #[test]
    fn test_detect_ad_only() {
        let t = tag(4, GIF_FLG_PACKED, 2, 0xEE, false, 0);
        assert_eq!(
            detect_fast_handler(t, 0),
            Some(FastPacketHandler::AdOnly { regs_per_loop: 2 })
        );

        // NREG=0 means 16 A+D slots.
        let t = tag(4, GIF_FLG_PACKED, 0, 0xEEEE_EEEE_EEEE_EEEE, false, 0);
        assert_eq!(
            detect_fast_handler(t, 0),
            Some(FastPacketHandler::AdOnly { regs_per_loop: 16 })
        );

        // A stray non-A+D nibble disables the fast path.
        let t = tag(4, GIF_FLG_PACKED, 2, 0x5E, false, 0);
        assert_eq!(detect_fast_handler(t, 0), None);
    }

    #[test]
    fn test_no_fast_path_for_reglist_or_empty() {
        let t = tag(4, GIF_FLG_REGLIST, 2, 0xEE, false, 0);
        assert_eq!(detect_fast_handler(t, 0), None);
        let t = tag(0, GIF_FLG_PACKED, 2, 0xEE, false, 0);
        assert_eq!(detect_fast_handler(t, 0), None);
    }
}
