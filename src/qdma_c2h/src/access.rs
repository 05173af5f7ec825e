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

//! Device access traits
//!
//! The engine never touches device memory or registers directly. Everything
//! it needs from the PCIe function is expressed by three small traits:
//!
//! - [`MemOps`]: reads and writes of host memory shared with the device
//!   (coherent ring memory and the contents of receive pages).
//! - [`DmaOps`]: page allocation and streaming DMA mappings.
//! - [`Doorbell`]: producer/consumer index updates for one queue.
//!
//! [`QueueDevice`] is implemented for anything that provides all three.

use alloc::sync::Arc;

use bytemuck::Pod;

/// Host memory shared with the device.
///
/// Addresses are host (kernel virtual) addresses, never bus addresses.
pub trait MemOps {
    type Error: core::fmt::Debug;

    /// Copy `dst.len()` bytes starting at `addr` into `dst`.
    fn read(&self, addr: u64, dst: &mut [u8]) -> Result<usize, Self::Error>;

    /// Copy `src` to memory starting at `addr`.
    fn write(&self, addr: u64, src: &[u8]) -> Result<usize, Self::Error>;

    /// Load a u16 the device publishes (e.g. a status producer index) with
    /// acquire semantics.
    fn load_acquire(&self, addr: u64) -> Result<u16, Self::Error>;

    /// Read barrier between observing a device-written index and reading the
    /// records it covers (`dma_rmb`).
    fn read_barrier(&self) {
        core::sync::atomic::fence(core::sync::atomic::Ordering::Acquire);
    }

    /// Read a Pod value at `addr`.
    fn read_val<T: Pod>(&self, addr: u64) -> Result<T, Self::Error> {
        let mut val = T::zeroed();
        let bytes = bytemuck::bytes_of_mut(&mut val);

        self.read(addr, bytes)?;
        Ok(val)
    }

    /// Write a Pod value at `addr`.
    fn write_val<T: Pod>(&self, addr: u64, val: T) -> Result<(), Self::Error> {
        let bytes = bytemuck::bytes_of(&val);
        self.write(addr, bytes)?;
        Ok(())
    }
}

/// Why a page could not be mapped for device access.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MapError;

/// Page allocation and streaming DMA mapping.
pub trait DmaOps {
    /// Allocate `PAGE_SIZE << order` contiguous bytes and return their host
    /// address. `can_block` is false on the interrupt/poll path.
    fn alloc_pages(&self, order: u8, can_block: bool) -> Option<u64>;

    /// Release pages returned by [`alloc_pages`](Self::alloc_pages).
    fn free_pages(&self, addr: u64, order: u8);

    /// Map pages for device-to-host transfers, returning the bus address.
    fn map_page(&self, addr: u64, order: u8) -> Result<u64, MapError>;

    /// Drop a mapping created by [`map_page`](Self::map_page).
    fn unmap_page(&self, dma_addr: u64, order: u8);
}

/// Queue doorbell registers.
pub trait Doorbell {
    /// Announce the C2H descriptor producer index of queue `qidx`.
    fn update_c2h_pidx(&self, qidx: u16, pidx: u32);

    /// Announce the completion ring consumer index of queue `qidx`.
    fn update_cmpl_cidx(&self, qidx: u16, cidx: u32);
}

/// Everything a C2H queue needs from its device.
pub trait QueueDevice: MemOps + DmaOps + Doorbell {}

impl<T: MemOps + DmaOps + Doorbell + ?Sized> QueueDevice for T {}

impl<T: MemOps + ?Sized> MemOps for Arc<T> {
    type Error = T::Error;

    fn read(&self, addr: u64, dst: &mut [u8]) -> Result<usize, Self::Error> {
        (**self).read(addr, dst)
    }

    fn write(&self, addr: u64, src: &[u8]) -> Result<usize, Self::Error> {
        (**self).write(addr, src)
    }

    fn load_acquire(&self, addr: u64) -> Result<u16, Self::Error> {
        (**self).load_acquire(addr)
    }

    fn read_barrier(&self) {
        (**self).read_barrier()
    }
}

impl<T: DmaOps + ?Sized> DmaOps for Arc<T> {
    fn alloc_pages(&self, order: u8, can_block: bool) -> Option<u64> {
        (**self).alloc_pages(order, can_block)
    }

    fn free_pages(&self, addr: u64, order: u8) {
        (**self).free_pages(addr, order)
    }

    fn map_page(&self, addr: u64, order: u8) -> Result<u64, MapError> {
        (**self).map_page(addr, order)
    }

    fn unmap_page(&self, dma_addr: u64, order: u8) {
        (**self).unmap_page(dma_addr, order)
    }
}

impl<T: Doorbell + ?Sized> Doorbell for Arc<T> {
    fn update_c2h_pidx(&self, qidx: u16, pidx: u32) {
        (**self).update_c2h_pidx(qidx, pidx)
    }

    fn update_cmpl_cidx(&self, qidx: u16, cidx: u32) {
        (**self).update_cmpl_cidx(qidx, cidx)
    }
}
