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

//! A simulated QDMA function for exercising the C2H engine without
//! hardware: host memory, a page allocator with DMA mappings, doorbell
//! capture and a device model that fills buffers and posts completions.

use std::collections::{BTreeMap, HashMap};
use std::sync::Mutex;
use std::sync::atomic::{AtomicU32, Ordering};

use anyhow::{Result, anyhow, bail};
use qdma_c2h::{
    C2hDesc, CmplFlags, CmplStatus, DmaOps, Doorbell, MapError, MemOps, PAGE_SIZE, QueueConfig,
    RingLayout, ring_idx_delta, ring_idx_incr,
};

pub mod simplelogger;

/// Where [`SimDevice`] expects the queue's rings.
pub const RING_BASE: u64 = 0x20_0000;

const PAGE_BASE: u64 = 0x4000_0000;
const DMA_BASE: u64 = 0x8_0000_0000;
const CHUNK: u64 = PAGE_SIZE as u64;

/// A doorbell write seen by the device.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DoorbellWrite {
    C2hPidx { qidx: u16, pidx: u32 },
    CmplCidx { qidx: u16, cidx: u32 },
}

/// A host memory access the simulated bus refused.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BusFault(pub u64);

#[derive(Default)]
struct Pages {
    next: u64,
    live: BTreeMap<u64, u8>,
}

#[derive(Default)]
struct Iommu {
    next: u64,
    live: HashMap<u64, u64>,
}

/// Host side of a simulated function.
pub struct SimDevice {
    mem: Mutex<HashMap<u64, Box<[u8]>>>,
    pages: Mutex<Pages>,
    iommu: Mutex<Iommu>,
    faulty: Mutex<Option<(u64, u64)>>,
    allocs_left: AtomicU32,
    maps_left: AtomicU32,
    doorbells: Mutex<Vec<DoorbellWrite>>,
}

impl Default for SimDevice {
    fn default() -> Self {
        Self::new()
    }
}

impl SimDevice {
    pub fn new() -> Self {
        Self {
            mem: Mutex::new(HashMap::new()),
            pages: Mutex::new(Pages {
                next: PAGE_BASE,
                ..Default::default()
            }),
            iommu: Mutex::new(Iommu {
                next: DMA_BASE,
                ..Default::default()
            }),
            faulty: Mutex::new(None),
            allocs_left: AtomicU32::new(u32::MAX),
            maps_left: AtomicU32::new(u32::MAX),
            doorbells: Mutex::new(Vec::new()),
        }
    }

    /// Let the next `n` page allocations succeed and fail the rest.
    /// `u32::MAX` lifts the limit.
    pub fn fail_alloc_after(&self, n: u32) {
        self.allocs_left.store(n, Ordering::SeqCst);
    }

    /// Same as [`fail_alloc_after`](Self::fail_alloc_after), for mappings.
    pub fn fail_map_after(&self, n: u32) {
        self.maps_left.store(n, Ordering::SeqCst);
    }

    /// Make host accesses to `[addr, addr + len)` fail.
    pub fn poison(&self, addr: u64, len: u64) {
        *self.faulty.lock().unwrap() = Some((addr, addr + len));
    }

    pub fn clear_poison(&self) {
        *self.faulty.lock().unwrap() = None;
    }

    pub fn live_pages(&self) -> usize {
        self.pages.lock().unwrap().live.len()
    }

    pub fn live_mappings(&self) -> usize {
        self.iommu.lock().unwrap().live.len()
    }

    /// Host address behind a DMA address.
    pub fn translate(&self, dma_addr: u64) -> Option<u64> {
        self.iommu.lock().unwrap().live.get(&dma_addr).copied()
    }

    pub fn doorbells(&self) -> Vec<DoorbellWrite> {
        self.doorbells.lock().unwrap().clone()
    }

    pub fn clear_doorbells(&self) {
        self.doorbells.lock().unwrap().clear();
    }

    /// Last free-list producer index announced.
    pub fn c2h_pidx(&self) -> Option<u32> {
        self.doorbells
            .lock()
            .unwrap()
            .iter()
            .rev()
            .find_map(|d| match d {
                DoorbellWrite::C2hPidx { pidx, .. } => Some(*pidx),
                _ => None,
            })
    }

    /// Last completion consumer index announced.
    pub fn cmpl_cidx(&self) -> Option<u32> {
        self.doorbells
            .lock()
            .unwrap()
            .iter()
            .rev()
            .find_map(|d| match d {
                DoorbellWrite::CmplCidx { cidx, .. } => Some(*cidx),
                _ => None,
            })
    }

    fn take(budget: &AtomicU32) -> bool {
        budget
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| match n {
                u32::MAX => Some(n),
                0 => None,
                n => Some(n - 1),
            })
            .is_ok()
    }

    fn check(&self, addr: u64, len: usize) -> Result<(), BusFault> {
        match *self.faulty.lock().unwrap() {
            Some((lo, hi)) if addr < hi && addr + len as u64 > lo => Err(BusFault(addr)),
            _ => Ok(()),
        }
    }
}

impl MemOps for SimDevice {
    type Error = BusFault;

    fn read(&self, addr: u64, dst: &mut [u8]) -> Result<usize, BusFault> {
        self.check(addr, dst.len())?;
        let mem = self.mem.lock().unwrap();
        let mut done = 0;
        while done < dst.len() {
            let a = addr + done as u64;
            let base = a & !(CHUNK - 1);
            let off = (a - base) as usize;
            let n = (PAGE_SIZE - off).min(dst.len() - done);
            match mem.get(&base) {
                Some(chunk) => dst[done..done + n].copy_from_slice(&chunk[off..off + n]),
                None => dst[done..done + n].fill(0),
            }
            done += n;
        }
        Ok(done)
    }

    fn write(&self, addr: u64, src: &[u8]) -> Result<usize, BusFault> {
        self.check(addr, src.len())?;
        let mut mem = self.mem.lock().unwrap();
        let mut done = 0;
        while done < src.len() {
            let a = addr + done as u64;
            let base = a & !(CHUNK - 1);
            let off = (a - base) as usize;
            let n = (PAGE_SIZE - off).min(src.len() - done);
            let chunk = mem
                .entry(base)
                .or_insert_with(|| vec![0u8; PAGE_SIZE].into_boxed_slice());
            chunk[off..off + n].copy_from_slice(&src[done..done + n]);
            done += n;
        }
        Ok(done)
    }

    fn load_acquire(&self, addr: u64) -> Result<u16, BusFault> {
        let mut b = [0u8; 2];
        self.read(addr, &mut b)?;
        Ok(u16::from_le_bytes(b))
    }
}

impl DmaOps for SimDevice {
    fn alloc_pages(&self, order: u8, _can_block: bool) -> Option<u64> {
        if !Self::take(&self.allocs_left) {
            return None;
        }
        let mut pages = self.pages.lock().unwrap();
        let addr = pages.next;
        pages.next += (PAGE_SIZE << order) as u64;
        pages.live.insert(addr, order);
        Some(addr)
    }

    fn free_pages(&self, addr: u64, order: u8) {
        let removed = self.pages.lock().unwrap().live.remove(&addr);
        assert_eq!(removed, Some(order), "free of unknown page {addr:#x}");
        self.mem.lock().unwrap().retain(|&base, _| {
            !(addr..addr + (PAGE_SIZE << order) as u64).contains(&base)
        });
    }

    fn map_page(&self, addr: u64, order: u8) -> Result<u64, MapError> {
        if !Self::take(&self.maps_left) {
            return Err(MapError);
        }
        let mut iommu = self.iommu.lock().unwrap();
        let dma = iommu.next;
        iommu.next += (PAGE_SIZE << order) as u64;
        iommu.live.insert(dma, addr);
        Ok(dma)
    }

    fn unmap_page(&self, dma_addr: u64, _order: u8) {
        let removed = self.iommu.lock().unwrap().live.remove(&dma_addr);
        assert!(removed.is_some(), "unmap of unknown address {dma_addr:#x}");
    }
}

impl Doorbell for SimDevice {
    fn update_c2h_pidx(&self, qidx: u16, pidx: u32) {
        self.doorbells
            .lock()
            .unwrap()
            .push(DoorbellWrite::C2hPidx { qidx, pidx });
    }

    fn update_cmpl_cidx(&self, qidx: u16, cidx: u32) {
        self.doorbells
            .lock()
            .unwrap()
            .push(DoorbellWrite::CmplCidx { qidx, cidx });
    }
}

/// Device side of one C2H stream queue.
///
/// Fills only the descriptors the host has announced, writes whole
/// completion records and publishes the producer index last.
pub struct SimC2hHw {
    layout: RingLayout,
    ring_size: u32,
    cmpl_ring_size: u32,
    entry_bytes: usize,
    buf_size: usize,
    fl_cidx: u32,
    cmpl_pidx: u32,
    color: bool,
}

impl SimC2hHw {
    pub fn new(cfg: &QueueConfig) -> Result<Self> {
        let layout = RingLayout::from_base(RING_BASE, cfg).map_err(|e| anyhow!("{e}"))?;
        Ok(Self {
            layout,
            ring_size: cfg.ring_size(),
            cmpl_ring_size: cfg.cmpl_ring_size(),
            entry_bytes: cfg.cmpl_entry_size().bytes(),
            buf_size: cfg.buf_size(),
            fl_cidx: 0,
            cmpl_pidx: 0,
            color: true,
        })
    }

    /// Next free-list slot the device will fill.
    pub fn fl_cidx(&self) -> u32 {
        self.fl_cidx
    }

    /// Next completion record the device will write.
    pub fn cmpl_pidx(&self) -> u32 {
        self.cmpl_pidx
    }

    pub fn color(&self) -> bool {
        self.color
    }

    /// Free-list slots the host has armed and the device has not used.
    pub fn armed(&self, dev: &SimDevice) -> u32 {
        dev.c2h_pidx()
            .map(|pidx| ring_idx_delta(pidx, self.fl_cidx, self.ring_size))
            .unwrap_or(0)
    }

    /// DMA address programmed into free-list descriptor `idx`.
    pub fn desc_dst(&self, dev: &SimDevice, idx: u32) -> Result<u64> {
        let desc: C2hDesc = dev
            .read_val(self.layout.desc_addr(idx))
            .map_err(|e| anyhow!("descriptor {idx}: {e:?}"))?;
        Ok(desc.dst_addr)
    }

    /// DMA `payload` into the free list and post one data record.
    pub fn push_packet(&mut self, dev: &SimDevice, payload: &[u8]) -> Result<()> {
        self.push_packet_with_udd(dev, payload, &[])
    }

    /// Like [`push_packet`](Self::push_packet), carrying user-defined data
    /// in the record after the first word.
    pub fn push_packet_with_udd(
        &mut self,
        dev: &SimDevice,
        payload: &[u8],
        udd: &[u8],
    ) -> Result<()> {
        let len = u16::try_from(payload.len())?;
        let nr = payload.len().div_ceil(self.buf_size).max(1) as u32;
        let armed = self.armed(dev);
        if nr > armed {
            bail!("packet needs {nr} buffers, only {armed} armed");
        }

        for (i, chunk) in payload.chunks(self.buf_size).enumerate() {
            let idx = ring_idx_incr(self.fl_cidx, i as u32, self.ring_size);
            let dma = self.desc_dst(dev, idx)?;
            let host = dev
                .translate(dma)
                .ok_or_else(|| anyhow!("descriptor {idx} points at unmapped {dma:#x}"))?;
            dev.write(host, chunk).map_err(|e| anyhow!("{e:?}"))?;
        }
        self.fl_cidx = ring_idx_incr(self.fl_cidx, nr, self.ring_size);

        self.post(dev, CmplFlags::DESC_USED, len, udd)
    }

    /// Post a record that consumed no buffer.
    pub fn push_udd_only(&mut self, dev: &SimDevice, udd: &[u8]) -> Result<()> {
        self.post(dev, CmplFlags::empty(), 0, udd)
    }

    /// Post a record with arbitrary flags; the current color is added.
    pub fn push_raw(&mut self, dev: &SimDevice, flags: CmplFlags, len: u16) -> Result<()> {
        self.post(dev, flags, len, &[])
    }

    fn post(&mut self, dev: &SimDevice, flags: CmplFlags, len: u16, udd: &[u8]) -> Result<()> {
        // the device leaves one record free between itself and the host
        let cidx = dev.cmpl_cidx().unwrap_or(0);
        if ring_idx_incr(self.cmpl_pidx, 1, self.cmpl_ring_size) == cidx {
            bail!("completion ring full at {}", self.cmpl_pidx);
        }
        if udd.len() > self.entry_bytes - 8 {
            bail!("{} bytes of udd do not fit a {} byte record", udd.len(), self.entry_bytes);
        }

        let flags = if self.color {
            flags | CmplFlags::COLOR
        } else {
            flags
        };
        let mut raw = vec![0u8; self.entry_bytes];
        raw[..8].copy_from_slice(&CmplStatus::encode_word(flags, len).to_le_bytes());
        raw[8..8 + udd.len()].copy_from_slice(udd);

        let addr = self.layout.cmpl_ring_addr + (self.cmpl_pidx as usize * self.entry_bytes) as u64;
        dev.write(addr, &raw).map_err(|e| anyhow!("{e:?}"))?;

        self.cmpl_pidx = ring_idx_incr(self.cmpl_pidx, 1, self.cmpl_ring_size);
        if self.cmpl_pidx == 0 {
            self.color = !self.color;
        }
        dev.write_val(self.layout.cmpl_status_addr, self.cmpl_pidx as u16)
            .map_err(|e| anyhow!("{e:?}"))?;
        Ok(())
    }
}
