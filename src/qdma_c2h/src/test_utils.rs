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

//! In-crate device double for unit tests.

use alloc::boxed::Box;
use alloc::collections::BTreeMap;
use alloc::vec::Vec;
use core::sync::atomic::{AtomicU32, Ordering};

use spin::Mutex;

use crate::PAGE_SIZE;
use crate::access::{DmaOps, Doorbell, MapError, MemOps};
use crate::cmpl::{CmplFlags, CmplStatus};
use crate::config::QueueConfig;
use crate::layout::{C2hDesc, RingLayout};
use crate::ring::ring_idx_incr;

const CHUNK: u64 = PAGE_SIZE as u64;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Bell {
    C2hPidx(u32),
    CmplCidx(u32),
}

/// Sparse memory, a bump page allocator and a mapping table.
pub struct TestDev {
    mem: Mutex<BTreeMap<u64, Box<[u8; PAGE_SIZE]>>>,
    next_page: Mutex<u64>,
    next_dma: Mutex<u64>,
    pages: Mutex<BTreeMap<u64, u8>>,
    mappings: Mutex<BTreeMap<u64, u64>>,
    allocs_left: AtomicU32,
    maps_left: AtomicU32,
    bells: Mutex<Vec<Bell>>,
}

impl TestDev {
    pub const RING_BASE: u64 = 0x10_0000;

    pub fn new() -> Self {
        Self {
            mem: Mutex::new(BTreeMap::new()),
            next_page: Mutex::new(0x1000_0000),
            next_dma: Mutex::new(0xd000_0000),
            pages: Mutex::new(BTreeMap::new()),
            mappings: Mutex::new(BTreeMap::new()),
            allocs_left: AtomicU32::new(u32::MAX),
            maps_left: AtomicU32::new(u32::MAX),
            bells: Mutex::new(Vec::new()),
        }
    }

    /// Let `n` more allocations succeed, then fail. `u32::MAX` never fails.
    pub fn fail_alloc_after(&self, n: u32) {
        self.allocs_left.store(n, Ordering::Relaxed);
    }

    pub fn fail_map_after(&self, n: u32) {
        self.maps_left.store(n, Ordering::Relaxed);
    }

    pub fn live_pages(&self) -> usize {
        self.pages.lock().len()
    }

    pub fn live_mappings(&self) -> usize {
        self.mappings.lock().len()
    }

    pub fn bells(&self) -> Vec<Bell> {
        self.bells.lock().clone()
    }

    pub fn last_c2h_pidx(&self) -> Option<u32> {
        self.bells.lock().iter().rev().find_map(|b| match b {
            Bell::C2hPidx(p) => Some(*p),
            _ => None,
        })
    }

    pub fn last_cmpl_cidx(&self) -> Option<u32> {
        self.bells.lock().iter().rev().find_map(|b| match b {
            Bell::CmplCidx(c) => Some(*c),
            _ => None,
        })
    }

    fn page_of_dma(&self, dma: u64) -> Option<u64> {
        self.mappings.lock().get(&dma).copied()
    }

    fn take(budget: &AtomicU32) -> bool {
        let left = budget.load(Ordering::Relaxed);
        match left {
            u32::MAX => true,
            0 => false,
            n => {
                budget.store(n - 1, Ordering::Relaxed);
                true
            }
        }
    }
}

impl MemOps for TestDev {
    type Error = ();

    fn read(&self, addr: u64, dst: &mut [u8]) -> Result<usize, ()> {
        let mem = self.mem.lock();
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

    fn write(&self, addr: u64, src: &[u8]) -> Result<usize, ()> {
        let mut mem = self.mem.lock();
        let mut done = 0;
        while done < src.len() {
            let a = addr + done as u64;
            let base = a & !(CHUNK - 1);
            let off = (a - base) as usize;
            let n = (PAGE_SIZE - off).min(src.len() - done);
            let chunk = mem
                .entry(base)
                .or_insert_with(|| Box::new([0u8; PAGE_SIZE]));
            chunk[off..off + n].copy_from_slice(&src[done..done + n]);
            done += n;
        }
        Ok(done)
    }

    fn load_acquire(&self, addr: u64) -> Result<u16, ()> {
        let mut b = [0u8; 2];
        self.read(addr, &mut b)?;
        Ok(u16::from_le_bytes(b))
    }
}

impl DmaOps for TestDev {
    fn alloc_pages(&self, order: u8, _can_block: bool) -> Option<u64> {
        if !Self::take(&self.allocs_left) {
            return None;
        }
        let mut next = self.next_page.lock();
        let addr = *next;
        *next += (PAGE_SIZE << order) as u64;
        self.pages.lock().insert(addr, order);
        Some(addr)
    }

    fn free_pages(&self, addr: u64, order: u8) {
        let removed = self.pages.lock().remove(&addr);
        assert_eq!(removed, Some(order), "bad free of {addr:#x}");
    }

    fn map_page(&self, addr: u64, _order: u8) -> Result<u64, MapError> {
        if !Self::take(&self.maps_left) {
            return Err(MapError);
        }
        let mut next = self.next_dma.lock();
        let dma = *next;
        *next += CHUNK << 4;
        self.mappings.lock().insert(dma, addr);
        Ok(dma)
    }

    fn unmap_page(&self, dma_addr: u64, _order: u8) {
        let removed = self.mappings.lock().remove(&dma_addr);
        assert!(removed.is_some(), "bad unmap of {dma_addr:#x}");
    }
}

impl Doorbell for TestDev {
    fn update_c2h_pidx(&self, _qidx: u16, pidx: u32) {
        self.bells.lock().push(Bell::C2hPidx(pidx));
    }

    fn update_cmpl_cidx(&self, _qidx: u16, cidx: u32) {
        self.bells.lock().push(Bell::CmplCidx(cidx));
    }
}

/// The device side of one queue: writes payload into armed buffers through
/// the descriptor ring and posts completion records.
pub struct TestHw {
    layout: RingLayout,
    ring_size: u32,
    cmpl_ring_size: u32,
    entry_bytes: usize,
    buf_size: u32,
    /// next free-list slot to fill
    pub fl_cidx: u32,
    /// next completion record to write
    pub cmpl_pidx: u32,
    pub color: bool,
}

impl TestHw {
    pub fn new(cfg: &QueueConfig) -> Self {
        Self {
            layout: RingLayout::from_base(TestDev::RING_BASE, cfg).unwrap(),
            ring_size: cfg.ring_size(),
            cmpl_ring_size: cfg.cmpl_ring_size(),
            entry_bytes: cfg.cmpl_entry_size().bytes(),
            buf_size: cfg.buf_size() as u32,
            fl_cidx: 0,
            cmpl_pidx: 0,
            color: true,
        }
    }

    /// Write `len` bytes of `fill(i)` into consecutive slots and post one
    /// data record.
    pub fn push_packet(&mut self, dev: &TestDev, len: u32, fill: impl Fn(usize) -> u8) {
        let nr = if len == 0 { 1 } else { len.div_ceil(self.buf_size) };
        let data: Vec<u8> = (0..len as usize).map(fill).collect();

        for (i, chunk) in data.chunks(self.buf_size as usize).enumerate() {
            let idx = ring_idx_incr(self.fl_cidx, i as u32, self.ring_size);
            let desc: C2hDesc = dev.read_val(self.layout.desc_addr(idx)).unwrap();
            let page = dev.page_of_dma(desc.dst_addr).expect("slot not armed");
            dev.write(page, chunk).unwrap();
        }
        self.fl_cidx = ring_idx_incr(self.fl_cidx, nr, self.ring_size);

        let word = CmplStatus::encode_word(self.flags(CmplFlags::DESC_USED), len as u16);
        self.post(dev, word, &[]);
    }

    /// Post a record that consumed no descriptor.
    pub fn push_udd_only(&mut self, dev: &TestDev, udd: &[u8]) {
        let word = CmplStatus::encode_word(self.flags(CmplFlags::empty()), 0);
        self.post(dev, word, udd);
    }

    /// Post a raw first word, with the current color or'ed in.
    pub fn push_word(&mut self, dev: &TestDev, flags: CmplFlags, len: u16) {
        let word = CmplStatus::encode_word(self.flags(flags), len);
        self.post(dev, word, &[]);
    }

    fn flags(&self, flags: CmplFlags) -> CmplFlags {
        if self.color {
            flags | CmplFlags::COLOR
        } else {
            flags
        }
    }

    fn post(&mut self, dev: &TestDev, word: u64, udd: &[u8]) {
        let addr = self.layout.cmpl_ring_addr + (self.cmpl_pidx as usize * self.entry_bytes) as u64;
        let mut raw = alloc::vec![0u8; self.entry_bytes];
        raw[..8].copy_from_slice(&word.to_le_bytes());
        let n = udd.len().min(self.entry_bytes - 8);
        raw[8..8 + n].copy_from_slice(&udd[..n]);
        dev.write(addr, &raw).unwrap();

        self.cmpl_pidx += 1;
        if self.cmpl_pidx == self.cmpl_ring_size {
            self.cmpl_pidx = 0;
            self.color = !self.color;
        }
        dev.write_val(self.layout.cmpl_status_addr, self.cmpl_pidx as u16)
            .unwrap();
    }
}
