// SPDX-FileCopyrightText: 2025 gsrx contributors
// SPDX-License-Identifier: GPL-3.0-or-later

//! Transfer engine: HOST->LOCAL upload assembly and LOCAL->LOCAL copies.
//!
//! A TRXDIR write kicks a transfer. Host uploads accumulate HWREG payload
//! until the expected quad-word count arrives; a partial payload is flushed
//! early whenever a later read could observe it (palette upload, textured
//! draw) or when a new TRXDIR supersedes it.

use crate::backend::{CopyDescriptor, GsBackend, HostDataRange};
use crate::interface::GsInterface;
use crate::psm::{bits_per_pixel, compute_page_rect};
use crate::regs::{XDIR_HOST_TO_LOCAL, XDIR_LOCAL_TO_HOST, XDIR_LOCAL_TO_LOCAL};

/// State of the in-flight transfer.
#[derive(Default)]
pub struct TransferState {
    /// Transfer registers latched at TRXDIR time.
    pub copy: CopyDescriptor,
    pub host_to_local_payload: Vec<u64>,
    pub required_qwords: usize,
    pub last_flushed_qwords: usize,
    pub host_to_local_active: bool,
}

impl<B: GsBackend> GsInterface<B> {
    /// TRXDIR write: finish the previous transfer and start the next.
    pub(crate) fn init_transfer(&mut self) {
        self.flush_pending_transfer(false);

        let regs = &self.core.regs;
        let copy = CopyDescriptor {
            bitbltbuf: regs.bitbltbuf,
            trxpos: regs.trxpos,
            trxreg: regs.trxreg,
            trxdir: regs.trxdir,
        };
        self.core.transfer.copy = copy;

        match copy.trxdir.xdir() {
            XDIR_LOCAL_TO_LOCAL => {
                let dst_rect = compute_page_rect(
                    copy.bitbltbuf.dbp(),
                    copy.trxpos.dsax(),
                    copy.trxpos.dsay(),
                    copy.trxreg.rrw(),
                    copy.trxreg.rrh(),
                    copy.bitbltbuf.dbw(),
                    copy.bitbltbuf.dpsm(),
                );
                let src_rect = compute_page_rect(
                    copy.bitbltbuf.sbp(),
                    copy.trxpos.ssax(),
                    copy.trxpos.ssay(),
                    copy.trxreg.rrw(),
                    copy.trxreg.rrh(),
                    copy.bitbltbuf.sbw(),
                    copy.bitbltbuf.spsm(),
                );

                self.tracker
                    .mark_transfer_copy(&mut self.core, &dst_rect, &src_rect);
                let clut_instance = self.core.render_pass.clut_instance;
                if self
                    .tracker
                    .invalidate_texture_cache(&mut self.core, clut_instance)
                {
                    self.core.mark_texture_state_dirty();
                }
                self.core.backend.copy_vram(&copy, None);
            }
            XDIR_HOST_TO_LOCAL => {
                let required_bits = copy.trxreg.rrw() as u64
                    * copy.trxreg.rrh() as u64
                    * u64::from(bits_per_pixel(copy.bitbltbuf.dpsm()));
                self.core.transfer.required_qwords = (required_bits / 64) as usize;
                self.core.transfer.host_to_local_active = self.core.transfer.required_qwords != 0;
                // Await HWREG writes.
            }
            XDIR_LOCAL_TO_HOST => {
                // Local-to-host FIFO reads are not implemented.
                log::trace!("LOCAL->HOST transfer requested, ignored");
            }
            _ => {}
        }
    }

    /// HWREG data: append payload, submit once enough has arrived.
    pub(crate) fn hwreg_write(&mut self, payload: u64) {
        if self.core.transfer.host_to_local_active {
            self.core.transfer.host_to_local_payload.push(payload);
            self.check_pending_transfer();
        }
    }

    /// IMAGE-mode bulk payload.
    pub(crate) fn hwreg_write_multi(&mut self, payload: &[u64]) {
        if self.core.transfer.host_to_local_active {
            self.core
                .transfer
                .host_to_local_payload
                .extend_from_slice(payload);
            self.check_pending_transfer();
        }
    }

    pub(crate) fn check_pending_transfer(&mut self) {
        if self.core.transfer.host_to_local_active
            && self.core.transfer.host_to_local_payload.len() >= self.core.transfer.required_qwords
        {
            self.flush_pending_transfer(false);
        }
    }

    /// Push unflushed payload to the backend as a VRAM write. `keep_alive`
    /// leaves the transfer armed for more HWREG data.
    pub(crate) fn flush_pending_transfer(&mut self, keep_alive: bool) {
        let transfer = &self.core.transfer;
        if transfer.host_to_local_active
            && transfer.host_to_local_payload.len() > transfer.last_flushed_qwords
        {
            let copy = transfer.copy;
            let dst_rect = compute_page_rect(
                copy.bitbltbuf.dbp(),
                copy.trxpos.dsax(),
                copy.trxpos.dsay(),
                copy.trxreg.rrw(),
                copy.trxreg.rrh(),
                copy.bitbltbuf.dbw(),
                copy.bitbltbuf.dpsm(),
            );

            self.tracker.mark_transfer_write(&mut self.core, &dst_rect);
            let clut_instance = self.core.render_pass.clut_instance;
            if self
                .tracker
                .invalidate_texture_cache(&mut self.core, clut_instance)
            {
                self.core.mark_texture_state_dirty();
            }

            let transfer = &mut self.core.transfer;
            let range = HostDataRange {
                offset_bytes: transfer.last_flushed_qwords * 8,
                size_bytes: transfer.host_to_local_payload.len() * 8,
                required_bytes: transfer.required_qwords * 8,
            };
            // Possibly an early flush; more image data may never arrive
            // until the game kicks a new transfer.
            transfer.last_flushed_qwords = transfer.host_to_local_payload.len();

            let payload = std::mem::take(&mut self.core.transfer.host_to_local_payload);
            self.core.backend.copy_vram(&copy, Some((&payload, range)));
            self.core.transfer.host_to_local_payload = payload;
        }

        if !keep_alive {
            let transfer = &mut self.core.transfer;
            transfer.host_to_local_payload.clear();
            transfer.last_flushed_qwords = 0;
            transfer.host_to_local_active = false;
        }
    }
}
