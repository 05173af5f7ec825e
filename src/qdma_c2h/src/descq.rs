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

//! Queue state and completion processing
//!
//! [`Descq`] owns everything one C2H stream queue needs: the free list, the
//! completion cursor, the request lists and the device handle. It is a plain
//! state machine driven through `&mut self`; [`C2hQueue`] wraps it in the
//! per-queue lock that every entry point takes.
//!
//! A completion pass ([`Descq::process_completions`]):
//!
//! 1. reads the device producer index from the completion status block,
//! 2. consumes up to `budget` fresh records in ring order, marking packet
//!    slots or handing packets to the handler,
//! 3. serves queued read requests in arrival order,
//! 4. re-arms drained slots and writes both doorbells once.

use alloc::collections::VecDeque;
use alloc::string::String;
use alloc::vec::Vec;
use core::fmt::Write;

use log::{debug, info, warn};
use spin::{Mutex, MutexGuard};
#[cfg(feature = "tracing")]
use tracing::{Span, instrument};

use crate::access::QueueDevice;
use crate::cmpl::{CmplEntry, CmplStatus, hex_dump};
use crate::config::QueueConfig;
use crate::error::{C2hError, Result};
use crate::flq::FreeList;
use crate::layout::RingLayout;
use crate::packet::C2hMode;
use crate::request::{ReadCompletion, ReadRequest};
use crate::ring::{CmplCursor, ring_idx_delta};

/// Snapshot of data received but not yet read.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PeekInfo {
    /// Records that carried user-defined data.
    pub udd_cnt: u32,
    /// Packets with bytes still on the free list.
    pub pkt_cnt: u32,
    /// Bytes still on the free list.
    pub pkt_dlen: u64,
}

/// Per-queue counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct QueueStats {
    pub entries: u64,
    pub packets: u64,
    pub udd_only: u64,
    pub bytes_copied: u64,
    pub requests_done: u64,
    pub c2h_pidx_updates: u64,
    pub cmpl_cidx_updates: u64,
    pub alloc_fail: u64,
    pub mapping_err: u64,
    pub halted: bool,
}

/// One C2H stream queue.
pub struct Descq<D: QueueDevice> {
    pub(crate) dev: D,
    pub(crate) cfg: QueueConfig,
    pub(crate) mode: C2hMode<D>,
    pub(crate) layout: Option<RingLayout>,
    pub(crate) halted: bool,
    /// Next free-list slot the device fills.
    pub(crate) pidx: u32,
    /// Armed slots the device has not filled yet.
    pub(crate) avail: u32,
    pub(crate) cursor: CmplCursor,
    /// Completion index to announce with the next cmpl doorbell.
    pub(crate) cidx_wrb_pend: u32,
    pub(crate) flq: FreeList,
    pub(crate) pending: VecDeque<ReadRequest>,
    /// Submitted requests not yet picked up by a completion pass.
    pub(crate) work: VecDeque<ReadRequest>,
    pub(crate) completed: VecDeque<ReadCompletion>,
    pub(crate) stats: QueueStats,
}

impl<D: QueueDevice> Descq<D> {
    /// Create a stopped queue.
    pub fn new(dev: D, cfg: QueueConfig, mode: C2hMode<D>) -> Result<Self> {
        cfg.validate()?;
        let cursor = CmplCursor::new(cfg.cmpl_ring_size());

        Ok(Self {
            dev,
            cfg,
            mode,
            layout: None,
            halted: false,
            pidx: 0,
            avail: 0,
            cursor,
            cidx_wrb_pend: 0,
            flq: FreeList::default(),
            pending: VecDeque::new(),
            work: VecDeque::new(),
            completed: VecDeque::new(),
            stats: QueueStats::default(),
        })
    }

    /// Bring the queue up on the ring memory at `ring_base`.
    ///
    /// `ring_base` must point at [`RingLayout::query_size`] bytes of memory
    /// shared with the device. Every free-list slot gets pages and a mapping,
    /// all but one slot are announced to the device.
    #[cfg_attr(feature = "tracing", instrument(err(Debug), skip_all, parent = Span::current(), level = "Trace"))]
    pub fn start(&mut self, ring_base: u64) -> Result<()> {
        if self.layout.is_some() {
            return Err(C2hError::AlreadyStarted);
        }
        self.cfg.validate()?;

        let layout = RingLayout::from_base(ring_base, &self.cfg)?;
        let entry_bytes = self.cfg.cmpl_entry_size().bytes();
        let cmpl_bytes = self.cfg.cmpl_ring_size() as usize * entry_bytes + CmplStatus::SIZE;
        self.dev
            .write(layout.cmpl_ring_addr, &alloc::vec![0u8; cmpl_bytes])
            .map_err(|_| C2hError::MemoryAccess(layout.cmpl_ring_addr))?;

        self.flq.alloc_resource(
            &self.dev,
            self.cfg.ring_size(),
            self.cfg.page_order(),
            layout.desc_ring_addr,
        )?;

        self.layout = Some(layout);
        self.halted = false;
        self.pidx = 0;
        self.avail = self.cfg.ring_size() - 1;
        self.cursor = CmplCursor::new(self.cfg.cmpl_ring_size());
        self.cidx_wrb_pend = 0;

        self.ring_c2h_doorbell();
        self.ring_cmpl_doorbell();

        info!(
            "{}: started, {} x {}B buffers, {} completion entries of {}B",
            self.cfg.name(),
            self.cfg.ring_size(),
            self.cfg.buf_size(),
            self.cfg.cmpl_ring_size(),
            self.cfg.cmpl_entry_size().bytes()
        );
        Ok(())
    }

    /// Fail every queued request with [`C2hError::Stopped`] and release the
    /// free list.
    #[cfg_attr(feature = "tracing", instrument(err(Debug), skip_all, parent = Span::current(), level = "Trace"))]
    pub fn stop(&mut self) -> Result<()> {
        if self.layout.is_none() {
            return Err(C2hError::NotStarted);
        }

        self.fail_all(C2hError::Stopped);
        self.flq.free_resource(&self.dev);
        self.layout = None;
        self.avail = 0;

        info!("{}: stopped", self.cfg.name());
        Ok(())
    }

    /// Queue a read request.
    ///
    /// A request the queue cannot take is completed right away with the same
    /// error that is returned, so its buffers always come back through the
    /// completion.
    pub fn submit_read(&mut self, req: ReadRequest) -> Result<()> {
        let refusal = if self.layout.is_none() {
            Some(C2hError::NotStarted)
        } else if self.halted {
            Some(C2hError::Halted)
        } else if self.mode.is_direct() {
            Some(C2hError::InvalidArg("queue delivers packets to a handler"))
        } else {
            None
        };

        if let Some(e) = refusal {
            self.complete(req, Err(e.clone()));
            return Err(e);
        }

        if req.count() == 0 && self.pending.is_empty() && self.work.is_empty() {
            info!("{}: request {} zero len", self.cfg.name(), req.tag());
            self.drain_empty_packet();
            self.complete(req, Ok(0));
            return Ok(());
        }

        self.work.push_back(req);
        Ok(())
    }

    /// Withdraw a queued request; it completes with [`C2hError::Cancelled`].
    pub fn cancel(&mut self, tag: u64) -> Result<()> {
        let req = if let Some(pos) = self.pending.iter().position(|r| r.tag() == tag) {
            self.pending.remove(pos)
        } else if let Some(pos) = self.work.iter().position(|r| r.tag() == tag) {
            self.work.remove(pos)
        } else {
            None
        };

        match req {
            Some(req) => {
                debug!("{}: request {tag} cancelled", self.cfg.name());
                self.complete(req, Err(C2hError::Cancelled));
                Ok(())
            }
            None => Err(C2hError::UnknownRequest(tag)),
        }
    }

    /// Read the record at the consumer position.
    ///
    /// Returns `None` when the record is stale (its color belongs to the
    /// previous traversal). A malformed fresh record halts the queue.
    pub fn parse_entry(&mut self) -> Result<Option<CmplEntry>> {
        let layout = self.layout.ok_or(C2hError::NotStarted)?;
        let entry = CmplEntry::read(
            &self.dev,
            layout.cmpl_ring_addr,
            self.cursor.cidx(),
            self.cfg.cmpl_entry_size(),
        )?;

        if !entry.is_new(self.cursor.color()) {
            return Ok(None);
        }

        if let Err(e) = entry.validate(self.cfg.udd_en()) {
            let mut dump = String::new();
            hex_dump(&mut dump, "cmpl entry: ", entry.raw());
            warn!("{}: {e}, queue halted\n{dump}", self.cfg.name());
            self.halted = true;
            return Err(e.into());
        }

        Ok(Some(entry))
    }

    /// Consume fresh completion records without serving requests.
    ///
    /// Returns how many records were consumed, and why the loop stopped early
    /// if it did.
    pub(crate) fn poll_cmpl(&mut self, budget: u32) -> (usize, Result<()>) {
        let Some(layout) = self.layout else {
            return (0, Err(C2hError::NotStarted));
        };

        let hw_pidx = match CmplStatus::read_pidx(&self.dev, layout.cmpl_status_addr) {
            Ok(p) => p as u32,
            Err(_) => return (0, Err(C2hError::MemoryAccess(layout.cmpl_status_addr))),
        };
        self.dev.read_barrier();

        let size = self.cursor.size();
        let pend = ring_idx_delta(hw_pidx % size, self.cursor.cidx(), size);
        let budget = if budget == 0 || budget > pend {
            pend
        } else {
            budget
        };

        let mut processed = 0;
        while processed < budget as usize {
            let entry = match self.parse_entry() {
                Ok(Some(entry)) => entry,
                // status raced ahead of the record contents
                Ok(None) => break,
                Err(e) => return (processed, Err(e)),
            };

            let res = if entry.desc_used() {
                self.receive_packet(&entry)
            } else {
                self.receive_udd_only(&entry)
            };

            if let Err(e) = res {
                if e.is_fatal() {
                    warn!("{}: {e}, queue halted", self.cfg.name());
                    self.halted = true;
                } else {
                    debug!(
                        "{}: entry {} deferred: {e}",
                        self.cfg.name(),
                        entry.cidx()
                    );
                }
                return (processed, Err(e));
            }

            self.cursor.advance();
            self.stats.entries += 1;
            processed += 1;
        }

        (processed, Ok(()))
    }

    /// Run one completion pass, consuming at most `budget` records (0 means
    /// all that are ready).
    ///
    /// Returns the number of records consumed. A halted queue returns
    /// `Ok(0)` without touching anything; the pass that finds a malformed
    /// record returns its error, fails every queued request with
    /// [`C2hError::Halted`] and leaves the queue halted until restarted.
    #[cfg_attr(feature = "tracing", instrument(err(Debug), skip_all, parent = Span::current(), level = "Trace"))]
    pub fn process_completions(&mut self, budget: u32) -> Result<usize> {
        if self.layout.is_none() {
            return Err(C2hError::NotStarted);
        }
        if self.halted {
            debug!("{}: halted, skipping completions", self.cfg.name());
            return Ok(0);
        }

        let direct = self.mode.is_direct();
        if !direct && self.pending.is_empty() && self.work.is_empty() {
            return Ok(0);
        }

        let pidx_arm = self.flq.pidx_arm;
        let cidx_wrb_pend = self.cidx_wrb_pend;
        let (processed, res) = self.poll_cmpl(budget);

        if processed > 0 || !self.halted {
            if !direct {
                self.process_pending();
            }
            // handlers keep nothing, their slots get fresh pages
            self.rearm(!direct);
            if self.flq.pidx_arm != pidx_arm {
                self.ring_c2h_doorbell();
            }
            // a drain without new records still frees completion entries
            if processed > 0 || self.cidx_wrb_pend != cidx_wrb_pend {
                self.ring_cmpl_doorbell();
            }
        }

        if self.halted {
            self.fail_all(C2hError::Halted);
        }

        res.map(|()| processed)
    }

    /// Read straight into `req` on the caller's thread.
    ///
    /// Consumes any fresh completion records, copies what has arrived and
    /// re-arms and announces the drained slots immediately. Returns the bytes
    /// copied by this call. While other requests are queued this returns
    /// `Ok(0)` so it never overtakes them.
    #[cfg_attr(feature = "tracing", instrument(err(Debug), skip_all, parent = Span::current(), level = "Trace"))]
    pub fn packet_read(&mut self, req: &mut ReadRequest) -> Result<usize> {
        if self.layout.is_none() {
            return Err(C2hError::NotStarted);
        }
        if self.halted {
            return Err(C2hError::Halted);
        }
        if self.mode.is_direct() {
            return Err(C2hError::InvalidArg("queue delivers packets to a handler"));
        }
        if !self.pending.is_empty() || !self.work.is_empty() {
            return Ok(0);
        }

        let (processed, res) = self.poll_cmpl(0);
        if let Err(e) = res {
            if self.halted {
                self.fail_all(C2hError::Halted);
            }
            return Err(e);
        }

        let bells = self.stats.cmpl_cidx_updates;
        let copied = self.drain_into_request(req, true, true)?;
        if processed > 0 && self.stats.cmpl_cidx_updates == bells {
            self.ring_cmpl_doorbell();
        }

        Ok(copied)
    }

    /// Take the completions of requests without a completion hook.
    pub fn take_completed(&mut self) -> Vec<ReadCompletion> {
        self.completed.drain(..).collect()
    }

    pub fn peek(&self) -> PeekInfo {
        PeekInfo {
            udd_cnt: self.flq.udd_cnt,
            pkt_cnt: self.flq.pkt_cnt,
            pkt_dlen: self.flq.pkt_dlen,
        }
    }

    pub fn stats(&self) -> QueueStats {
        QueueStats {
            alloc_fail: self.flq.alloc_fail(),
            mapping_err: self.flq.mapping_err(),
            halted: self.halted,
            ..self.stats
        }
    }

    /// Human readable queue state.
    pub fn dump(&self) -> String {
        let mut out = String::new();
        let _ = writeln!(
            out,
            "{} qidx {}: started {}, halted {}, mode {:?}",
            self.cfg.name(),
            self.cfg.qidx(),
            self.is_started(),
            self.halted,
            self.mode
        );
        let _ = writeln!(
            out,
            "  desc: pidx {}, avail {}, ring {}",
            self.pidx,
            self.avail,
            self.cfg.ring_size()
        );
        let _ = writeln!(
            out,
            "  flq: pidx_pend {}, pidx_arm {}, backlog {}, buf {}B, alloc_fail {}, mapping_err {}",
            self.flq.pidx_pend,
            self.flq.pidx_arm,
            self.flq.backlog(),
            self.cfg.buf_size(),
            self.flq.alloc_fail(),
            self.flq.mapping_err()
        );
        let _ = writeln!(
            out,
            "  cmpl: cidx {}, color {}, cidx_pend {}, ring {} x {}B",
            self.cursor.cidx(),
            self.cursor.color() as u8,
            self.cidx_wrb_pend,
            self.cfg.cmpl_ring_size(),
            self.cfg.cmpl_entry_size().bytes()
        );
        let _ = writeln!(
            out,
            "  data: udd {}, pkt {}, dlen {}; requests pending {}, work {}",
            self.flq.udd_cnt,
            self.flq.pkt_cnt,
            self.flq.pkt_dlen,
            self.pending.len(),
            self.work.len()
        );
        out
    }

    /// Hex dump of completion records `start..end`.
    pub fn dump_cmpl_entries(&self, start: u32, end: u32) -> Result<String> {
        let layout = self.layout.ok_or(C2hError::NotStarted)?;
        if start > end || end > self.cfg.cmpl_ring_size() {
            return Err(C2hError::InvalidArg("completion entry range out of bounds"));
        }

        let mut out = String::new();
        for idx in start..end {
            let entry = CmplEntry::read(
                &self.dev,
                layout.cmpl_ring_addr,
                idx,
                self.cfg.cmpl_entry_size(),
            )?;
            let prefix = alloc::format!("cmpl {idx:4} ");
            hex_dump(&mut out, &prefix, entry.raw());
        }
        Ok(out)
    }

    fn fail_all(&mut self, err: C2hError) {
        while let Some(req) = self.pending.pop_front() {
            self.complete(req, Err(err.clone()));
        }
        while let Some(req) = self.work.pop_front() {
            self.complete(req, Err(err.clone()));
        }
    }

    pub fn config(&self) -> &QueueConfig {
        &self.cfg
    }

    pub fn device(&self) -> &D {
        &self.dev
    }

    pub fn layout(&self) -> Option<RingLayout> {
        self.layout
    }

    pub fn free_list(&self) -> &FreeList {
        &self.flq
    }

    pub fn is_started(&self) -> bool {
        self.layout.is_some()
    }

    pub fn is_halted(&self) -> bool {
        self.halted
    }

    /// Next free-list slot the device fills.
    pub fn pidx(&self) -> u32 {
        self.pidx
    }

    pub fn avail(&self) -> u32 {
        self.avail
    }

    /// Next completion record to consume.
    pub fn cmpl_cidx(&self) -> u32 {
        self.cursor.cidx()
    }

    pub fn color(&self) -> bool {
        self.cursor.color()
    }

    pub fn cidx_wrb_pend(&self) -> u32 {
        self.cidx_wrb_pend
    }

    /// Queued requests, picked up or not.
    pub fn queued(&self) -> usize {
        self.pending.len() + self.work.len()
    }
}

impl<D: QueueDevice> Drop for Descq<D> {
    fn drop(&mut self) {
        self.fail_all(C2hError::Stopped);
        if self.layout.is_some() {
            self.flq.free_resource(&self.dev);
        }
    }
}

/// A [`Descq`] behind its queue lock.
///
/// The completion pass, the direct read path and request submission all
/// serialize on this lock.
pub struct C2hQueue<D: QueueDevice> {
    inner: Mutex<Descq<D>>,
}

impl<D: QueueDevice> C2hQueue<D> {
    pub fn new(dev: D, cfg: QueueConfig, mode: C2hMode<D>) -> Result<Self> {
        Ok(Self::from_descq(Descq::new(dev, cfg, mode)?))
    }

    pub fn from_descq(descq: Descq<D>) -> Self {
        Self {
            inner: Mutex::new(descq),
        }
    }

    /// Take the queue lock.
    pub fn lock(&self) -> MutexGuard<'_, Descq<D>> {
        self.inner.lock()
    }

    pub fn start(&self, ring_base: u64) -> Result<()> {
        self.lock().start(ring_base)
    }

    pub fn stop(&self) -> Result<()> {
        self.lock().stop()
    }

    pub fn submit_read(&self, req: ReadRequest) -> Result<()> {
        self.lock().submit_read(req)
    }

    pub fn cancel(&self, tag: u64) -> Result<()> {
        self.lock().cancel(tag)
    }

    pub fn process_completions(&self, budget: u32) -> Result<usize> {
        self.lock().process_completions(budget)
    }

    pub fn packet_read(&self, req: &mut ReadRequest) -> Result<usize> {
        self.lock().packet_read(req)
    }

    pub fn take_completed(&self) -> Vec<ReadCompletion> {
        self.lock().take_completed()
    }

    pub fn peek(&self) -> PeekInfo {
        self.lock().peek()
    }

    pub fn stats(&self) -> QueueStats {
        self.lock().stats()
    }

    pub fn dump(&self) -> String {
        self.lock().dump()
    }
}

#[cfg(test)]
mod tests {
    use alloc::sync::Arc;

    use super::*;
    use crate::PAGE_SIZE;
    use crate::access::MemOps;
    use crate::cmpl::CmplFlags;
    use crate::config::CmplEntrySize;
    use crate::error::CmplError;
    use crate::test_utils::{Bell, TestDev, TestHw};

    const CAP: u32 = PAGE_SIZE as u32;

    fn cfg() -> QueueConfig {
        let mut cfg = QueueConfig::new("c2h0", 0);
        cfg.set_ring_size(8).set_cmpl_ring_size(8);
        cfg
    }

    fn started(cfg: QueueConfig) -> (Descq<TestDev>, TestHw) {
        let hw = TestHw::new(&cfg);
        let mut q = Descq::new(TestDev::new(), cfg, C2hMode::Buffered).unwrap();
        q.start(TestDev::RING_BASE).unwrap();
        (q, hw)
    }

    #[test]
    fn start_arms_all_but_one_slot() {
        let (q, _hw) = started(cfg());
        assert!(q.is_started());
        assert_eq!(q.avail(), 7);
        assert!(q.color());
        assert_eq!(q.device().live_mappings(), 8);
        assert_eq!(q.device().bells(), [Bell::C2hPidx(7), Bell::CmplCidx(0)]);
    }

    #[test]
    fn start_twice_is_refused() {
        let (mut q, _hw) = started(cfg());
        assert_eq!(q.start(TestDev::RING_BASE), Err(C2hError::AlreadyStarted));
    }

    #[test]
    fn rejects_mm_queue() {
        let mut cfg = cfg();
        cfg.set_mode(true, false);
        assert!(matches!(
            Descq::new(TestDev::new(), cfg, C2hMode::Buffered),
            Err(C2hError::InvalidConfig(_))
        ));
    }

    #[test]
    fn end_to_end_three_packets() {
        let (mut q, mut hw) = started(cfg());
        let want = 3 * CAP as usize + 100;
        q.submit_read(ReadRequest::with_len(1, want)).unwrap();

        hw.push_packet(q.device(), 0, |_| 0);
        hw.push_packet(q.device(), CAP, |i| i as u8);
        hw.push_packet(q.device(), 2 * CAP + 100, |i| (i as u8).wrapping_add(1));

        assert_eq!(q.process_completions(0), Ok(3));

        let done = q.take_completed();
        assert_eq!(done.len(), 1);
        assert_eq!(done[0].result, Ok(want));
        let data = done[0].data();
        assert_eq!(data[0], 0);
        assert_eq!(data[CAP as usize], 1);

        assert_eq!(q.cmpl_cidx(), 3);
        assert!(q.color());
        // zero length + one + three slots
        assert_eq!(q.pidx(), 5);
        assert_eq!(q.free_list().pidx_pend(), 5);
        assert_eq!(q.avail(), 7);
        assert_eq!(q.device().last_c2h_pidx(), Some(4));
        assert_eq!(q.device().last_cmpl_cidx(), Some(3));
        assert_eq!(q.peek(), PeekInfo::default());
    }

    #[test]
    fn idle_queue_ignores_completions() {
        let (mut q, mut hw) = started(cfg());
        hw.push_packet(q.device(), 10, |_| 0);
        assert_eq!(q.process_completions(0), Ok(0));
        assert_eq!(q.cmpl_cidx(), 0);
    }

    #[test]
    fn budget_bounds_the_pass() {
        let (mut q, mut hw) = started(cfg());
        q.submit_read(ReadRequest::with_len(1, 1000)).unwrap();
        for _ in 0..3 {
            hw.push_packet(q.device(), 10, |_| 0);
        }
        assert_eq!(q.process_completions(2), Ok(2));
        assert_eq!(q.cmpl_cidx(), 2);
        assert_eq!(q.process_completions(2), Ok(1));
        assert_eq!(q.cmpl_cidx(), 3);
    }

    #[test]
    fn error_bit_halts() {
        let (mut q, mut hw) = started(cfg());
        q.submit_read(ReadRequest::with_len(1, 10)).unwrap();
        hw.push_word(q.device(), CmplFlags::DESC_USED | CmplFlags::ERR, 10);

        let bells = q.device().bells().len();
        assert_eq!(
            q.process_completions(0),
            Err(C2hError::Completion(CmplError::ErrBit(0)))
        );
        assert!(q.is_halted());
        assert!(q.stats().halted);
        assert_eq!(q.take_completed()[0].result, Err(C2hError::Halted));
        assert_eq!(q.device().bells().len(), bells);
        assert_eq!(q.avail(), 7);

        // later passes are no-ops
        hw.push_packet(q.device(), 10, |_| 0);
        assert_eq!(q.process_completions(0), Ok(0));
        assert_eq!(q.cmpl_cidx(), 0);
        assert_eq!(
            q.submit_read(ReadRequest::with_len(2, 1)),
            Err(C2hError::Halted)
        );
    }

    #[test]
    fn stale_color_stops_the_loop() {
        let (mut q, mut hw) = started(cfg());
        q.submit_read(ReadRequest::with_len(1, 100)).unwrap();
        hw.push_packet(q.device(), 10, |_| 0);
        // status claims two records, the second is not written yet
        let layout = q.layout().unwrap();
        q.device().write_val(layout.cmpl_status_addr, 2u16).unwrap();

        assert_eq!(q.process_completions(0), Ok(1));
        assert_eq!(q.cmpl_cidx(), 1);
    }

    #[test]
    fn restart_clears_halt() {
        let (mut q, mut hw) = started(cfg());
        q.submit_read(ReadRequest::with_len(1, 10)).unwrap();
        hw.push_word(q.device(), CmplFlags::FORMAT, 0);
        assert!(q.process_completions(0).is_err());

        q.stop().unwrap();
        assert_eq!(q.device().live_pages(), 0);
        q.start(TestDev::RING_BASE).unwrap();
        assert!(!q.is_halted());
        assert_eq!(q.cmpl_cidx(), 0);
        assert!(q.color());
    }

    #[test]
    fn stop_fails_queued_requests() {
        let (mut q, _hw) = started(cfg());
        q.submit_read(ReadRequest::with_len(1, 10)).unwrap();
        q.stop().unwrap();
        assert_eq!(q.take_completed()[0].result, Err(C2hError::Stopped));
        assert_eq!(q.stop(), Err(C2hError::NotStarted));
    }

    #[test]
    fn cancel_by_tag() {
        let (mut q, _hw) = started(cfg());
        q.submit_read(ReadRequest::with_len(5, 10)).unwrap();
        assert_eq!(q.cancel(6), Err(C2hError::UnknownRequest(6)));
        q.cancel(5).unwrap();
        assert_eq!(q.take_completed()[0].result, Err(C2hError::Cancelled));
        assert_eq!(q.queued(), 0);
    }

    #[test]
    fn packet_read_direct_path() {
        let (mut q, mut hw) = started(cfg());
        hw.push_packet(q.device(), 300, |i| i as u8);

        let mut req = ReadRequest::with_len(1, 200);
        assert_eq!(q.packet_read(&mut req), Ok(200));
        assert_eq!(req.left(), 0);
        // slot partially drained, nothing to re-arm yet
        assert_eq!(q.free_list().pidx_pend(), 0);

        let mut rest = ReadRequest::with_len(2, 200);
        assert_eq!(q.packet_read(&mut rest), Ok(100));
        assert_eq!(q.avail(), 7);
        assert_eq!(q.device().last_c2h_pidx(), Some(0));
        assert_eq!(q.device().last_cmpl_cidx(), Some(1));
    }

    #[test]
    fn packet_read_waits_behind_queue() {
        let (mut q, mut hw) = started(cfg());
        hw.push_packet(q.device(), 300, |_| 0);
        q.submit_read(ReadRequest::with_len(1, 10)).unwrap();

        let mut req = ReadRequest::with_len(2, 10);
        assert_eq!(q.packet_read(&mut req), Ok(0));
    }

    #[test]
    fn zero_length_request_completes_at_submit() {
        let (mut q, _hw) = started(cfg());
        q.submit_read(ReadRequest::with_len(1, 0)).unwrap();
        assert_eq!(q.take_completed()[0].result, Ok(0));
    }

    #[test]
    fn dump_cmpl_entries_hex() {
        let mut cfg = cfg();
        cfg.set_cmpl_entry_size(CmplEntrySize::B16);
        let (q, mut hw) = started(cfg);
        hw.push_packet(q.device(), 1, |_| 0);

        let dump = q.dump_cmpl_entries(0, 2).unwrap();
        let lines: Vec<_> = dump.lines().collect();
        assert_eq!(lines.len(), 2);
        // DESC_USED | COLOR, length 1
        assert!(lines[0].starts_with("cmpl    0 00000000: 1a 00"));
        assert!(q.dump_cmpl_entries(3, 9).is_err());
        assert!(q.dump().contains("c2h0 qidx 0"));
    }

    #[test]
    fn drop_releases_pages_and_fails_requests() {
        let dev = Arc::new(TestDev::new());
        let mut q = Descq::new(dev.clone(), cfg(), C2hMode::Buffered).unwrap();
        q.start(TestDev::RING_BASE).unwrap();

        let outcome = Arc::new(Mutex::new(None));
        let sink = outcome.clone();
        q.submit_read(
            ReadRequest::with_len(1, 10).on_done(move |c| *sink.lock() = Some(c.result)),
        )
        .unwrap();
        assert_eq!(dev.live_pages(), 8);

        drop(q);
        assert_eq!(dev.live_pages(), 0);
        assert_eq!(dev.live_mappings(), 0);
        assert_eq!(*outcome.lock(), Some(Err(C2hError::Stopped)));
    }
}
