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

//! Packet assembly
//!
//! A data record of `len` bytes covers `ceil(len / buf_size)` consecutive
//! free-list slots starting at the queue producer index (one slot for a
//! zero-length packet). What happens next depends on the queue's
//! [`C2hMode`]:
//!
//! - [`C2hMode::Direct`]: the packet is handed to a [`PacketHandler`] right
//!   away and its slots are released as soon as the handler returns.
//! - [`C2hMode::Buffered`]: the slots are marked (valid, start/end of packet,
//!   completion index to credit) and wait for the read path to drain them.

use alloc::boxed::Box;
use core::fmt;

use log::{debug, info};
use smallvec::SmallVec;

use crate::access::{MemOps, QueueDevice};
use crate::cmpl::{CmplEntry, hex_dump};
use crate::descq::Descq;
use crate::error::{C2hError, CmplError, Result};
use crate::flq::SlotFlags;
use crate::ring::{ring_idx_decr, ring_idx_incr};

/// One free-list slot of a packet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PacketFrag {
    /// Host address of the first byte.
    pub addr: u64,
    /// Bus address of the slot's pages.
    pub dma_addr: u64,
    pub len: u32,
}

/// A received packet as seen by a [`PacketHandler`].
///
/// Only valid for the duration of the handler call; the slots are re-armed
/// afterwards.
pub struct C2hPacket<'a, M: MemOps> {
    qidx: u16,
    len: u32,
    frags: SmallVec<[PacketFrag; 4]>,
    udd: Option<&'a [u8]>,
    mem: &'a M,
}

impl<'a, M: MemOps> C2hPacket<'a, M> {
    pub(crate) fn new(
        mem: &'a M,
        qidx: u16,
        len: u32,
        frags: SmallVec<[PacketFrag; 4]>,
        udd: Option<&'a [u8]>,
    ) -> Self {
        Self {
            qidx,
            len,
            frags,
            udd,
            mem,
        }
    }

    pub fn qidx(&self) -> u16 {
        self.qidx
    }

    /// Packet length in bytes. Zero for records without a descriptor.
    pub fn len(&self) -> u32 {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// The slots holding the payload, in order.
    pub fn frags(&self) -> &[PacketFrag] {
        &self.frags
    }

    /// Number of free-list slots the packet used.
    pub fn slot_count(&self) -> usize {
        self.frags.len()
    }

    /// The raw completion record, when user-defined data is enabled.
    pub fn udd(&self) -> Option<&[u8]> {
        self.udd
    }

    /// Copy the payload into `dst`, returning the number of bytes copied.
    pub fn copy_to(&self, dst: &mut [u8]) -> Result<usize> {
        let mut copied = 0;
        for frag in &self.frags {
            if copied == dst.len() {
                break;
            }
            let n = (frag.len as usize).min(dst.len() - copied);
            self.mem
                .read(frag.addr, &mut dst[copied..copied + n])
                .map_err(|_| C2hError::MemoryAccess(frag.addr))?;
            copied += n;
        }
        Ok(copied)
    }
}

/// Consumer of packets for queues in [`C2hMode::Direct`].
///
/// Called with the queue lock held. An `Err(code)` leaves the completion
/// record unconsumed; the next completion pass offers it again.
pub trait PacketHandler<M: MemOps>: Send {
    fn on_packet(&mut self, pkt: &C2hPacket<'_, M>) -> core::result::Result<(), i32>;
}

impl<M, F> PacketHandler<M> for F
where
    M: MemOps,
    F: FnMut(&C2hPacket<'_, M>) -> core::result::Result<(), i32> + Send,
{
    fn on_packet(&mut self, pkt: &C2hPacket<'_, M>) -> core::result::Result<(), i32> {
        self(pkt)
    }
}

/// How received packets leave the free list. Chosen once per queue.
pub enum C2hMode<M: MemOps> {
    /// Packets wait on the free list for read requests.
    Buffered,
    /// Packets go straight to a handler.
    Direct(Box<dyn PacketHandler<M>>),
}

impl<M: MemOps> C2hMode<M> {
    pub fn direct(handler: impl PacketHandler<M> + 'static) -> Self {
        C2hMode::Direct(Box::new(handler))
    }

    pub fn is_direct(&self) -> bool {
        matches!(self, C2hMode::Direct(_))
    }
}

impl<M: MemOps> fmt::Debug for C2hMode<M> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            C2hMode::Buffered => f.write_str("Buffered"),
            C2hMode::Direct(_) => f.write_str("Direct"),
        }
    }
}

impl<D: QueueDevice> Descq<D> {
    /// Account for a data record: mark its slots or hand them to the handler.
    pub(crate) fn receive_packet(&mut self, entry: &CmplEntry) -> Result<()> {
        let size = self.flq.size();
        let cap = self.flq.buf_size();
        let len = entry.len();
        let fl_nr = if len == 0 { 1 } else { len.div_ceil(cap) };

        if fl_nr > self.avail {
            return Err(CmplError::Overrun {
                cidx: entry.cidx(),
                needed: fl_nr,
                avail: self.avail,
            }
            .into());
        }

        let first = self.pidx;
        let last = ring_idx_incr(first, fl_nr - 1, size);

        if !self.mode.is_direct() {
            for i in 0..fl_nr {
                let idx = ring_idx_incr(first, i, size);
                if self.flq.info(idx).flags.contains(SlotFlags::VALID) {
                    return Err(CmplError::DoubleFill(idx).into());
                }
            }
        }

        // safe to repeat if a handler asks for a retry
        let tail = len % cap;
        if len == 0 {
            self.flq.slot_mut(last).set_len(0);
        } else if tail != 0 {
            self.flq.slot_mut(last).set_len(tail);
        }

        match &mut self.mode {
            C2hMode::Direct(handler) => {
                let mut frags = SmallVec::new();
                for i in 0..fl_nr {
                    let slot = self.flq.slot(ring_idx_incr(first, i, size));
                    let (Some(addr), Some(dma_addr)) = (slot.data_addr(), slot.dma_addr()) else {
                        return Err(CmplError::Overrun {
                            cidx: entry.cidx(),
                            needed: fl_nr,
                            avail: i,
                        }
                        .into());
                    };
                    frags.push(PacketFrag {
                        addr,
                        dma_addr,
                        len: slot.len(),
                    });
                }

                let udd = self.cfg.udd_en().then(|| entry.raw());
                let pkt = C2hPacket::new(&self.dev, self.cfg.qidx(), len, frags, udd);
                handler.on_packet(&pkt).map_err(C2hError::Handler)?;

                self.cidx_wrb_pend = self.cursor.next_cidx();
                self.flq.pidx_pend = ring_idx_incr(last, 1, size);
            }
            C2hMode::Buffered => {
                let cidx_next = self.cursor.next_cidx();
                for i in 0..fl_nr {
                    let info = self.flq.info_mut(ring_idx_incr(first, i, size));
                    info.flags = SlotFlags::VALID;
                    info.cidx = cidx_next;
                }
                self.flq.info_mut(first).flags.insert(SlotFlags::SOP);
                self.flq.info_mut(last).flags.insert(SlotFlags::EOP);

                self.flq.pkt_dlen += len as u64;
                self.flq.pkt_cnt += 1;
                if self.cfg.udd_en() {
                    self.flq.udd_cnt += 1;
                }
            }
        }

        self.avail -= fl_nr;
        self.pidx = ring_idx_incr(last, 1, size);
        self.stats.packets += 1;

        Ok(())
    }

    /// Account for a record that carries user-defined data only.
    pub(crate) fn receive_udd_only(&mut self, entry: &CmplEntry) -> Result<()> {
        info!("{}: udd-only completion {}", self.cfg.name(), entry.cidx());
        if log::log_enabled!(log::Level::Debug) {
            let mut dump = alloc::string::String::new();
            hex_dump(&mut dump, "cmpl entry: ", entry.raw());
            debug!("{dump}");
        }

        match &mut self.mode {
            C2hMode::Direct(handler) => {
                let pkt = C2hPacket::new(
                    &self.dev,
                    self.cfg.qidx(),
                    0,
                    SmallVec::new(),
                    Some(entry.raw()),
                );
                handler.on_packet(&pkt).map_err(C2hError::Handler)?;
                self.cidx_wrb_pend = self.cursor.next_cidx();
            }
            C2hMode::Buffered => {
                self.flq.udd_cnt += 1;
                let cidx_next = self.cursor.next_cidx();
                if self.flq.pidx_pend == self.pidx {
                    self.cidx_wrb_pend = cidx_next;
                } else {
                    // draining the newest packet credits this record too
                    let eop = ring_idx_decr(self.pidx, 1, self.flq.size());
                    self.flq.info_mut(eop).cidx = cidx_next;
                }
            }
        }

        self.stats.udd_only += 1;
        Ok(())
    }
}
