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

//! Free-list ring of receive buffers
//!
//! Slots live in two parallel arenas indexed by ring position: [`FlSlot`]
//! (page, mapping, valid window) and [`SlotInfo`] (packet markers). The free
//! list walks four indices around the ring:
//!
//! ```text
//!            pidx_arm    pidx_pend          descq pidx         doorbell
//!               v           v                   v                 v
//! ┌──────────┬──────────────┬───────────────────┬─────────────────┬───┐
//! │ armed    │ drained, not │ filled by device, │ armed, owned by │gap│
//! │          │ yet re-armed │ not yet drained   │ the device      │   │
//! └──────────┴──────────────┴───────────────────┴─────────────────┴───┘
//! ```
//!
//! Only slots before `pidx_arm` are ever announced to the device. Normally
//! `pidx_arm == pidx_pend`; the two differ only while a refill is short of
//! pages.

use alloc::vec::Vec;

use bitflags::bitflags;
use bytemuck::Zeroable;
use log::debug;

use crate::PAGE_SIZE;
use crate::access::{DmaOps, MemOps};
use crate::error::FillError;
use crate::layout::C2hDesc;
use crate::ring::{ring_idx_delta, ring_idx_incr};

/// One receive buffer.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FlSlot {
    /// Host address of the backing pages, if allocated.
    page: Option<u64>,
    /// Bus address handed to the device, if mapped.
    dma_addr: Option<u64>,
    /// Valid bytes starting at `offset`.
    len: u32,
    offset: u32,
}

impl FlSlot {
    #[inline]
    pub fn page(&self) -> Option<u64> {
        self.page
    }

    #[inline]
    pub fn dma_addr(&self) -> Option<u64> {
        self.dma_addr
    }

    #[inline]
    pub fn len(&self) -> u32 {
        self.len
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    #[inline]
    pub fn offset(&self) -> u32 {
        self.offset
    }

    /// Host address of the first valid byte.
    #[inline]
    pub fn data_addr(&self) -> Option<u64> {
        self.page.map(|p| p + self.offset as u64)
    }

    pub(crate) fn set_len(&mut self, len: u32) {
        self.len = len;
    }

    /// Drop `n` bytes from the front of the valid window.
    pub(crate) fn advance(&mut self, n: u32) {
        self.offset += n;
        self.len -= n;
    }
}

bitflags! {
    /// Packet markers on a filled slot.
    #[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
    pub struct SlotFlags: u8 {
        /// Filled by the device and not yet re-armed.
        const VALID = 1 << 0;
        /// First slot of a packet.
        const SOP   = 1 << 1;
        /// Last slot of a packet.
        const EOP   = 1 << 2;
    }
}

/// Per-slot packet metadata.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SlotInfo {
    pub flags: SlotFlags,
    /// Completion index safe to credit once this slot is drained.
    pub cidx: u32,
}

/// The free-list ring.
#[derive(Debug, Default)]
pub struct FreeList {
    slots: Vec<FlSlot>,
    info: Vec<SlotInfo>,
    page_order: u8,
    desc_ring_addr: u64,
    /// First slot filled by the device and not yet drained.
    pub(crate) pidx_pend: u32,
    /// First drained slot not yet re-armed.
    pub(crate) pidx_arm: u32,
    pub(crate) udd_cnt: u32,
    pub(crate) pkt_cnt: u32,
    pub(crate) pkt_dlen: u64,
    alloc_fail: u64,
    mapping_err: u64,
}

impl FreeList {
    /// Number of slots.
    #[inline]
    pub fn size(&self) -> u32 {
        self.slots.len() as u32
    }

    #[inline]
    pub fn page_order(&self) -> u8 {
        self.page_order
    }

    /// Capacity of one slot in bytes.
    #[inline]
    pub fn buf_size(&self) -> u32 {
        (PAGE_SIZE << self.page_order) as u32
    }

    #[inline]
    pub fn slot(&self, idx: u32) -> &FlSlot {
        &self.slots[idx as usize]
    }

    #[inline]
    pub(crate) fn slot_mut(&mut self, idx: u32) -> &mut FlSlot {
        &mut self.slots[idx as usize]
    }

    #[inline]
    pub fn info(&self, idx: u32) -> &SlotInfo {
        &self.info[idx as usize]
    }

    #[inline]
    pub(crate) fn info_mut(&mut self, idx: u32) -> &mut SlotInfo {
        &mut self.info[idx as usize]
    }

    #[inline]
    pub fn pidx_pend(&self) -> u32 {
        self.pidx_pend
    }

    #[inline]
    pub fn pidx_arm(&self) -> u32 {
        self.pidx_arm
    }

    /// Drained slots still waiting for a page.
    #[inline]
    pub fn backlog(&self) -> u32 {
        if self.slots.is_empty() {
            return 0;
        }
        ring_idx_delta(self.pidx_pend, self.pidx_arm, self.size())
    }

    pub fn alloc_fail(&self) -> u64 {
        self.alloc_fail
    }

    pub fn mapping_err(&self) -> u64 {
        self.mapping_err
    }

    /// Allocate and map `size` slots of `PAGE_SIZE << page_order` bytes and
    /// program their descriptors.
    ///
    /// All or nothing: on failure every slot mapped so far is released again.
    pub fn alloc_resource<D: MemOps + DmaOps>(
        &mut self,
        dev: &D,
        size: u32,
        page_order: u8,
        desc_ring_addr: u64,
    ) -> Result<(), FillError> {
        self.free_resource(dev);

        *self = Self {
            slots: alloc::vec![FlSlot::default(); size as usize],
            info: alloc::vec![SlotInfo::default(); size as usize],
            page_order,
            desc_ring_addr,
            ..Default::default()
        };

        for idx in 0..size {
            if let Err(e) = self.fill_one(dev, idx, true) {
                self.free_resource(dev);
                return Err(e);
            }
        }

        Ok(())
    }

    /// Unmap and release every slot. Safe to call repeatedly and after a
    /// failed [`alloc_resource`](Self::alloc_resource).
    pub fn free_resource<D: MemOps + DmaOps>(&mut self, dev: &D) {
        for idx in 0..self.size() {
            self.free_one(dev, idx);
        }
        self.slots.clear();
        self.info.clear();
        self.pidx_pend = 0;
        self.pidx_arm = 0;
        self.udd_cnt = 0;
        self.pkt_cnt = 0;
        self.pkt_dlen = 0;
    }

    /// Re-arm `count` slots starting at `start` for the next device fill.
    ///
    /// With `recycle` a slot keeps its pages and mapping and only its window
    /// is reset. Otherwise (or when the slot lost its pages) the old mapping
    /// is dropped and fresh pages are allocated and mapped. A failed refill
    /// is counted and stops the loop.
    ///
    /// Returns the number of slots re-armed.
    pub fn refill<D: MemOps + DmaOps>(
        &mut self,
        dev: &D,
        start: u32,
        count: u32,
        recycle: bool,
        can_block: bool,
    ) -> u32 {
        let size = self.size();
        let buf_size = self.buf_size();
        let mut done = 0;

        while done < count {
            let idx = ring_idx_incr(start, done, size);
            let slot = &mut self.slots[idx as usize];

            if recycle && slot.dma_addr.is_some() {
                slot.len = buf_size;
                slot.offset = 0;
            } else {
                self.free_one(dev, idx);
                if let Err(e) = self.fill_one(dev, idx, can_block) {
                    match e {
                        FillError::OutOfMemory(_) => self.alloc_fail += 1,
                        FillError::Mapping => self.mapping_err += 1,
                    }
                    debug!("free list slot {idx}: refill stopped after {done}/{count}: {e}");
                    break;
                }
            }

            self.info[idx as usize] = SlotInfo::default();
            done += 1;
        }

        done
    }

    fn fill_one<D: MemOps + DmaOps>(
        &mut self,
        dev: &D,
        idx: u32,
        can_block: bool,
    ) -> Result<(), FillError> {
        let order = self.page_order;
        let page = dev
            .alloc_pages(order, can_block)
            .ok_or(FillError::OutOfMemory(order))?;

        let dma_addr = match dev.map_page(page, order) {
            Ok(addr) => addr,
            Err(_) => {
                dev.free_pages(page, order);
                return Err(FillError::Mapping);
            }
        };

        let desc = C2hDesc { dst_addr: dma_addr };
        if dev.write_val(self.desc_addr(idx), desc).is_err() {
            dev.unmap_page(dma_addr, order);
            dev.free_pages(page, order);
            return Err(FillError::Mapping);
        }

        self.slots[idx as usize] = FlSlot {
            page: Some(page),
            dma_addr: Some(dma_addr),
            len: self.buf_size(),
            offset: 0,
        };

        Ok(())
    }

    fn unmap_one<D: MemOps + DmaOps>(&mut self, dev: &D, idx: u32) {
        let desc_addr = self.desc_addr(idx);
        let slot = &mut self.slots[idx as usize];

        if let Some(dma_addr) = slot.dma_addr.take() {
            if dev.write_val(desc_addr, C2hDesc::zeroed()).is_err() {
                debug!("free list slot {idx}: failed to clear descriptor");
            }
            dev.unmap_page(dma_addr, self.page_order);
        }
    }

    fn free_one<D: MemOps + DmaOps>(&mut self, dev: &D, idx: u32) {
        self.unmap_one(dev, idx);

        let slot = &mut self.slots[idx as usize];
        if let Some(page) = slot.page.take() {
            dev.free_pages(page, self.page_order);
        }
        slot.len = 0;
        slot.offset = 0;
    }

    #[inline]
    fn desc_addr(&self, idx: u32) -> u64 {
        self.desc_ring_addr + idx as u64 * C2hDesc::SIZE as u64
    }
}
