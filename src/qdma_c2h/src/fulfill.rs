/*
Copyright 2026 The QDMA-rs Authors.

Licensed under the Apache License, Version 2.0 (the "License");
you may not use this file except in compliance with the License.
You may obtain a copy of the License at

    http://www.apache.org/licenses/LICENSE-2.0

Unless required by applicable law or agreed to in writing, software
distributed under the License is distributed on an "AS IS" BASIS,
WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
See the License for the specific language governing permissions and
limitations under the License.
*/

//! Copying received bytes into read requests
//!
//! Filled slots sit between the free-list drain index (`pidx_pend`) and the
//! queue producer index. [`Descq::drain_into_request`] walks them and the
//! request's destination segments in lock-step:
//!
//! ```text
//!  free list   │ slot 3 (tail) │ slot 4        │ slot 5  │
//!              └───────┬───────┴───────┬───────┴────┬────┘
//!  request     │ seg 0     │ seg 1             │ seg 2     │
//! ```
//!
//! Both sides can stop mid-buffer. A partially drained slot keeps the rest of
//! its bytes by moving its offset forward; a partially filled request keeps
//! its segment index and offset. The next call resumes from both.

use log::{debug, info};

use crate::access::QueueDevice;
use crate::descq::Descq;
use crate::error::{C2hError, Result};
use crate::flq::SlotFlags;
use crate::request::ReadRequest;
use crate::ring::{ring_idx_decr, ring_idx_delta, ring_idx_incr};

impl<D: QueueDevice> Descq<D> {
    /// Copy filled free-list bytes into `req`.
    ///
    /// Returns the bytes copied by this call, which may be less than
    /// `req.left()` when not enough data has arrived yet.
    ///
    /// With `refill` the fully drained slots are recycled right away; with
    /// `update_pidx` both doorbells are written before returning.
    pub(crate) fn drain_into_request(
        &mut self,
        req: &mut ReadRequest,
        update_pidx: bool,
        refill: bool,
    ) -> Result<usize> {
        let size = self.flq.size();
        let fsgcnt = ring_idx_delta(self.pidx, self.flq.pidx_pend, size);
        if fsgcnt == 0 {
            return Ok(0);
        }
        if req.is_cancelled() {
            return Err(C2hError::Cancelled);
        }

        let mut sg_idx = req.progress.sg_idx;
        let mut sg_off = req.progress.sg_offset;
        let sgl = req.sgl_mut();
        if sg_idx > sgl.len() || (sg_idx < sgl.len() && sg_off > sgl[sg_idx].len()) {
            return Err(C2hError::InvalidArg("request segment cursor out of range"));
        }

        let mut pidx = self.flq.pidx_pend;
        let mut drained = 0;
        let mut foff = 0u32;
        let mut copied = 0usize;
        let mut failure = None;

        'slots: while drained < fsgcnt && sg_idx < sgl.len() {
            let slot = *self.flq.slot(pidx);
            let Some(src) = slot.data_addr() else {
                failure = Some(C2hError::InvalidArg("filled slot has no pages"));
                break;
            };
            let flen = slot.len();
            foff = 0;

            while foff < flen && sg_idx < sgl.len() {
                let seg = &mut sgl[sg_idx];
                let n = ((flen - foff) as usize).min(seg.len() - sg_off);
                let addr = src + foff as u64;

                if self.dev.read(addr, &mut seg[sg_off..sg_off + n]).is_err() {
                    failure = Some(C2hError::MemoryAccess(addr));
                    break 'slots;
                }

                foff += n as u32;
                sg_off += n;
                copied += n;

                if sg_off == seg.len() {
                    sg_idx += 1;
                    sg_off = 0;
                }
            }

            if foff < flen {
                break;
            }

            let info = *self.flq.info(pidx);
            if info.flags.contains(SlotFlags::EOP) {
                self.cidx_wrb_pend = info.cidx;
                self.flq.pkt_cnt = self.flq.pkt_cnt.saturating_sub(1);
            }
            pidx = ring_idx_incr(pidx, 1, size);
            drained += 1;
            foff = 0;
        }

        self.flq.pidx_pend = ring_idx_incr(self.flq.pidx_pend, drained, size);
        if foff > 0 {
            self.flq.slot_mut(pidx).advance(foff);
        }

        if refill && drained > 0 {
            self.rearm(true);
        }

        if update_pidx {
            self.ring_c2h_doorbell();
            self.ring_cmpl_doorbell();
        }

        // skip segments with nothing left to fill
        while sg_idx < sgl.len() && sg_off == sgl[sg_idx].len() {
            sg_idx += 1;
            sg_off = 0;
        }

        req.progress.sg_idx = sg_idx;
        req.progress.sg_offset = sg_off;
        req.progress.left -= copied;
        self.flq.pkt_dlen = self.flq.pkt_dlen.saturating_sub(copied as u64);
        self.stats.bytes_copied += copied as u64;

        match failure {
            Some(e) => Err(e),
            None => Ok(copied),
        }
    }

    /// Consume a zero-length packet at the head of the filled slots, if any.
    pub(crate) fn drain_empty_packet(&mut self) -> bool {
        let size = self.flq.size();
        if ring_idx_delta(self.pidx, self.flq.pidx_pend, size) == 0 {
            return false;
        }

        let head = self.flq.pidx_pend;
        let info = *self.flq.info(head);
        if !self.flq.slot(head).is_empty() || !info.flags.contains(SlotFlags::EOP) {
            return false;
        }

        self.cidx_wrb_pend = info.cidx;
        self.flq.pkt_cnt = self.flq.pkt_cnt.saturating_sub(1);
        self.flq.pidx_pend = ring_idx_incr(head, 1, size);
        true
    }

    /// Serve queued requests in arrival order from the filled slots.
    ///
    /// Stops at the first request that cannot be completed with the data at
    /// hand; later requests never overtake it.
    pub(crate) fn process_pending(&mut self) {
        while let Some(req) = self.work.pop_front() {
            self.pending.push_back(req);
        }

        while let Some(mut req) = self.pending.pop_front() {
            if req.is_cancelled() {
                self.complete(req, Err(C2hError::Cancelled));
                continue;
            }

            if req.count() == 0 {
                info!("{}: request {} pending, zero len", self.cfg.name(), req.tag());
                self.drain_empty_packet();
                self.complete(req, Ok(0));
                continue;
            }

            match self.drain_into_request(&mut req, false, false) {
                Err(e) => {
                    info!("{}: request {} failed: {e}", self.cfg.name(), req.tag());
                    self.complete(req, Err(e));
                }
                Ok(_) if req.left() == 0 => {
                    let count = req.count();
                    self.complete(req, Ok(count));
                }
                Ok(_) => {
                    self.pending.push_front(req);
                    break;
                }
            }
        }
    }

    /// Re-arm drained slots `[pidx_arm, pidx_pend)`.
    ///
    /// Returns whether the armed region grew. Slots that could not be refilled
    /// stay behind `pidx_arm` and are retried on the next call.
    pub(crate) fn rearm(&mut self, recycle: bool) -> bool {
        let backlog = self.flq.backlog();
        if backlog == 0 {
            return false;
        }

        let start = self.flq.pidx_arm;
        let done = self.flq.refill(&self.dev, start, backlog, recycle, false);
        self.flq.pidx_arm = ring_idx_incr(start, done, self.flq.size());
        self.avail += done;

        if done < backlog {
            debug!(
                "{}: re-armed {done}/{backlog} slots, {} waiting for pages",
                self.cfg.name(),
                backlog - done
            );
        }

        done > 0
    }

    /// Announce armed slots: the device may fill up to, not including, the
    /// written index.
    pub(crate) fn ring_c2h_doorbell(&mut self) {
        let pidx = ring_idx_decr(self.flq.pidx_arm, 1, self.flq.size());
        debug!("{}: c2h pidx {pidx}", self.cfg.name());
        self.dev.update_c2h_pidx(self.cfg.qidx(), pidx);
        self.stats.c2h_pidx_updates += 1;
    }

    pub(crate) fn ring_cmpl_doorbell(&mut self) {
        debug!("{}: cmpl cidx {}", self.cfg.name(), self.cidx_wrb_pend);
        self.dev.update_cmpl_cidx(self.cfg.qidx(), self.cidx_wrb_pend);
        self.stats.cmpl_cidx_updates += 1;
    }

    /// Hand a finished request back to its submitter.
    pub(crate) fn complete(&mut self, req: ReadRequest, result: Result<usize>) {
        let (completion, hook) = req.finish(result);
        self.stats.requests_done += 1;
        match hook {
            Some(f) => f(completion),
            None => self.completed.push_back(completion),
        }
    }
}
