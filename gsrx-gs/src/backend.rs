// SPDX-FileCopyrightText: 2025 gsrx contributors
// SPDX-License-Identifier: GPL-3.0-or-later

//! GPU rendering backend abstraction.
//!
//! The translator drives the backend through a small call surface: build a
//! texture from VRAM, upload a palette, execute a render pass, perform VRAM
//! copies, read back, and synchronize on a timeline. Most methods have no-op
//! defaults so backends only override the operations they support. The
//! [`NullBackend`] records calls for tests.

use std::rc::Rc;

use thiserror::Error;

use gsrx_common::GsOptions;

use crate::page_tracker::FlushReason;
use crate::regs::{Bitbltbuf, Frame, PrivRegisterState, Trxdir, Trxpos, Trxreg, Zbuf};
use crate::render_pass::{PrimitiveAttribute, StateVector, TextureInfo};
use crate::vertex::{VertexAttribute, VertexPosition};

#[derive(Debug, Error)]
pub enum GsError {
    #[error("backend initialization failed: {0}")]
    BackendInit(String),
}

/// A cached texture image owned by the backend, shared by reference count
/// between the backend, the page tracker, and the render pass in flight.
#[derive(Debug)]
pub struct GpuImage {
    pub id: u64,
    pub width: u32,
    pub height: u32,
    pub levels: u32,
}

pub type ImageHandle = Rc<GpuImage>;

/// Effective sampling rectangle of a texture descriptor.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct TextureRect {
    pub x: u32,
    pub y: u32,
    pub width: u32,
    pub height: u32,
    pub levels: u32,
}

/// The cacheable portion of texture state. All shading-only and upload-only
/// fields are normalized to zero before this is hashed or compared, so two
/// descriptors are equal iff they name the same VRAM content.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TextureDescriptor {
    pub tex0: u64,
    pub tex1: u64,
    pub clamp: u64,
    pub texa: u64,
    pub miptbp1: u64,
    pub miptbp2: u64,
    pub palette_bank: u32,
    pub latest_palette_bank: u32,
    pub rect: TextureRect,
    pub hash: u64,
}

/// A palette upload: TEX0 (upload-relevant fields only) plus TEXCLUT.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PaletteUploadDescriptor {
    pub tex0: u64,
    pub texclut: u64,
}

/// A VRAM copy in terms of the transfer registers at kick time.
#[derive(Debug, Clone, Copy, Default)]
pub struct CopyDescriptor {
    pub bitbltbuf: Bitbltbuf,
    pub trxpos: Trxpos,
    pub trxreg: Trxreg,
    pub trxdir: Trxdir,
}

/// Byte range of host payload covered by one `copy_vram` call.
#[derive(Debug, Clone, Copy, Default)]
pub struct HostDataRange {
    /// Offset of the first unflushed byte.
    pub offset_bytes: usize,
    /// Bytes available in the payload.
    pub size_bytes: usize,
    /// Bytes the full transfer requires.
    pub required_bytes: usize,
}

/// A batched render pass handed to the backend.
pub struct RenderPass<'a> {
    pub positions: &'a [VertexPosition],
    pub attributes: &'a [VertexAttribute],
    pub prims: &'a [PrimitiveAttribute],
    pub num_primitives: u32,
    pub states: &'a [StateVector],
    pub textures: &'a [TextureInfo],
    pub frame: Frame,
    pub zbuf: Zbuf,
    pub base_x: i32,
    pub base_y: i32,
    pub coarse_tile_size_log2: u32,
    pub coarse_tiles_width: u32,
    pub coarse_tiles_height: u32,
    pub feedback_texture: bool,
    pub feedback_texture_psm: u32,
    pub feedback_texture_cpsm: u32,
    pub z_sensitive: bool,
    pub has_aa1: bool,
    pub has_scanmsk: bool,
    pub feedback_color: bool,
    pub feedback_depth: bool,
    pub sampling_rate_x_log2: u32,
    pub sampling_rate_y_log2: u32,
    pub debug_capture_stride: u32,
    pub label_key: u64,
    pub flush_reason: FlushReason,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct VSyncInfo {
    /// Even/odd field phase for interlaced modes.
    pub phase: u32,
    pub force_progressive: bool,
}

#[derive(Debug, Clone, Default)]
pub struct ScanoutResult {
    pub image: Option<ImageHandle>,
    pub width: u32,
    pub height: u32,
}

/// Counters accumulated between `consume_flush_stats` calls.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FlushStats {
    pub num_render_passes: u64,
    pub num_copies: u64,
    pub num_palette_updates: u64,
    pub num_primitives: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimestampType {
    RenderPass,
    TextureUpload,
    Copy,
    Readback,
}

/// Trait for GPU rendering backends.
pub trait GsBackend {
    fn init(&mut self, options: &GsOptions) -> Result<(), GsError>;

    /// Host-visible VRAM. Valid between timeline waits as negotiated by the
    /// interface; the backend must not touch pages the host has mapped for
    /// write until `end_host_write_vram_access`.
    fn host_vram(&mut self) -> &mut [u8];
    fn end_host_write_vram_access(&mut self) {}

    fn create_cached_texture(&mut self, desc: &TextureDescriptor) -> ImageHandle;
    fn update_palette_cache(&mut self, desc: &PaletteUploadDescriptor) -> u32;
    fn flush_rendering(&mut self, _rp: &RenderPass<'_>) {}
    fn copy_vram(&mut self, _copy: &CopyDescriptor, _host_data: Option<(&[u64], HostDataRange)>) {}
    fn flush_host_vram_copy(&mut self, _pages: &[u32]) {}
    fn flush_readback(&mut self, _pages: &[u32]) {}
    fn flush_transfer(&mut self) {}
    fn flush_cache_upload(&mut self) {}
    fn transfer_overlap_barrier(&mut self) {}
    fn flush_submit(&mut self, _timeline: u64) {}
    fn wait_timeline(&mut self, _timeline: u64) {}
    fn vsync(&mut self, priv_regs: &PrivRegisterState, info: &VSyncInfo) -> ScanoutResult;
    fn invalidate_super_sampling_state(&mut self) {}
    fn consume_flush_stats(&mut self) -> FlushStats;
    fn get_accumulated_timestamps(&self, _ty: TimestampType) -> f64 {
        0.0
    }
}

// ── Null backend ────────────────────────────────────────────────────────────

/// Backend call log entry, recorded in call order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BackendCall {
    CreateCachedTexture,
    UpdatePaletteCache,
    FlushRendering {
        num_primitives: u32,
        num_states: u32,
        num_textures: u32,
        reason: FlushReason,
    },
    CopyVram,
    FlushHostVramCopy { num_pages: u32 },
    FlushReadback { num_pages: u32 },
    FlushTransfer,
    FlushCacheUpload,
    TransferOverlapBarrier,
    FlushSubmit { timeline: u64 },
    WaitTimeline { timeline: u64 },
    Vsync,
    InvalidateSuperSampling,
}

/// Backend that executes nothing and records every call; used for tests and
/// bring-up without a GPU.
#[derive(Default)]
pub struct NullBackend {
    vram: Vec<u8>,
    next_image_id: u64,
    next_clut_instance: u32,
    stats: FlushStats,
    pub calls: Vec<BackendCall>,
}

impl NullBackend {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn count_calls(&self, matches: impl Fn(&BackendCall) -> bool) -> usize {
        self.calls.iter().filter(|c| matches(*c)).count()
    }
}

impl GsBackend for NullBackend {
    fn init(&mut self, options: &GsOptions) -> Result<(), GsError> {
        if !options.vram_size.is_power_of_two() {
            return Err(GsError::BackendInit(format!(
                "vram_size 0x{:X} is not a power of two",
                options.vram_size
            )));
        }
        self.vram = vec![0u8; options.vram_size as usize];
        Ok(())
    }

    fn host_vram(&mut self) -> &mut [u8] {
        &mut self.vram
    }

    fn create_cached_texture(&mut self, desc: &TextureDescriptor) -> ImageHandle {
        self.calls.push(BackendCall::CreateCachedTexture);
        self.next_image_id += 1;
        Rc::new(GpuImage {
            id: self.next_image_id,
            width: desc.rect.width,
            height: desc.rect.height,
            levels: desc.rect.levels,
        })
    }

    fn update_palette_cache(&mut self, _desc: &PaletteUploadDescriptor) -> u32 {
        self.calls.push(BackendCall::UpdatePaletteCache);
        self.stats.num_palette_updates += 1;
        self.next_clut_instance = (self.next_clut_instance + 1) % crate::render_pass::CLUT_INSTANCES;
        self.next_clut_instance
    }

    fn flush_rendering(&mut self, rp: &RenderPass<'_>) {
        self.calls.push(BackendCall::FlushRendering {
            num_primitives: rp.num_primitives,
            num_states: rp.states.len() as u32,
            num_textures: rp.textures.len() as u32,
            reason: rp.flush_reason,
        });
        self.stats.num_render_passes += 1;
        self.stats.num_primitives += u64::from(rp.num_primitives);
    }

    fn copy_vram(&mut self, _copy: &CopyDescriptor, _host_data: Option<(&[u64], HostDataRange)>) {
        self.calls.push(BackendCall::CopyVram);
        self.stats.num_copies += 1;
    }

    fn flush_host_vram_copy(&mut self, pages: &[u32]) {
        self.calls.push(BackendCall::FlushHostVramCopy {
            num_pages: pages.len() as u32,
        });
    }

    fn flush_readback(&mut self, pages: &[u32]) {
        self.calls.push(BackendCall::FlushReadback {
            num_pages: pages.len() as u32,
        });
    }

    fn flush_transfer(&mut self) {
        self.calls.push(BackendCall::FlushTransfer);
    }

    fn flush_cache_upload(&mut self) {
        self.calls.push(BackendCall::FlushCacheUpload);
    }

    fn transfer_overlap_barrier(&mut self) {
        self.calls.push(BackendCall::TransferOverlapBarrier);
    }

    fn flush_submit(&mut self, timeline: u64) {
        self.calls.push(BackendCall::FlushSubmit { timeline });
    }

    fn wait_timeline(&mut self, timeline: u64) {
        self.calls.push(BackendCall::WaitTimeline { timeline });
    }

    fn vsync(&mut self, _priv_regs: &PrivRegisterState, _info: &VSyncInfo) -> ScanoutResult {
        self.calls.push(BackendCall::Vsync);
        ScanoutResult::default()
    }

    fn invalidate_super_sampling_state(&mut self) {
        self.calls.push(BackendCall::InvalidateSuperSampling);
    }

    fn consume_flush_stats(&mut self) -> FlushStats {
        std::mem::take(&mut self.stats)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_null_backend_init_rejects_odd_vram() {
        let mut backend = NullBackend::new();
        let options = GsOptions {
            vram_size: 3 * 1024 * 1024,
            ..Default::default()
        };
        assert!(backend.init(&options).is_err());
    }

    #[test]
    fn test_null_backend_records_calls() {
        let mut backend = NullBackend::new();
        backend.init(&GsOptions::default()).unwrap();
        assert_eq!(backend.host_vram().len(), GsOptions::default().vram_size as usize);

        let image = backend.create_cached_texture(&TextureDescriptor {
            rect: TextureRect {
                width: 64,
                height: 64,
                levels: 1,
                ..Default::default()
            },
            ..Default::default()
        });
        assert_eq!(image.width, 64);
        assert_eq!(backend.calls, vec![BackendCall::CreateCachedTexture]);
    }

    #[test]
    fn test_palette_instances_rotate() {
        let mut backend = NullBackend::new();
        let desc = PaletteUploadDescriptor::default();
        let a = backend.update_palette_cache(&desc);
        let b = backend.update_palette_cache(&desc);
        assert_ne!(a, b);
    }

    #[test]
    fn test_stats_consumed_once() {
        let mut backend = NullBackend::new();
        backend.update_palette_cache(&PaletteUploadDescriptor::default());
        let stats = backend.consume_flush_stats();
        assert_eq!(stats.num_palette_updates, 1);
        assert_eq!(backend.consume_flush_stats(), FlushStats::default());
    }
}
