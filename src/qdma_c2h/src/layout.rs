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

use bytemuck::{Pod, Zeroable};

use crate::cmpl::CmplStatus;
use crate::config::QueueConfig;
use crate::error::C2hError;

/// One C2H stream descriptor: the bus address the device writes into.
#[repr(C)]
#[derive(Clone, Copy, Debug, Pod, Zeroable, PartialEq, Eq)]
pub struct C2hDesc {
    pub dst_addr: u64,
}

const _: () = assert!(core::mem::size_of::<C2hDesc>() == 8);

impl C2hDesc {
    pub const SIZE: usize = core::mem::size_of::<Self>();
}

/// Where the rings of one C2H queue live in coherent host memory.
///
/// ```text
/// base ─> ┌───────────────────────────┐
///         │ descriptor ring           │ ring_size × 8B
///         ├───────────────────────────┤
///         │ descriptor status (hw)    │ 16B
///         ├───────────────────────────┤ <─ aligned to 64B
///         │ completion ring           │ cmpl_ring_size × entry size
///         ├───────────────────────────┤
///         │ completion status         │ 8B (pidx, cidx, color/isr)
///         └───────────────────────────┘
/// ```
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RingLayout {
    pub desc_ring_addr: u64,
    pub cmpl_ring_addr: u64,
    pub cmpl_status_addr: u64,
}

const DESC_STATUS_SIZE: usize = 16;

#[inline]
const fn align_up(val: usize, align: usize) -> usize {
    (val + align - 1) & !(align - 1)
}

impl RingLayout {
    /// Base alignment of the ring memory.
    pub const ALIGN: usize = 64;

    /// Compute the layout for `cfg` starting at `base`.
    ///
    /// The memory starting at `base` must be at least
    /// [`query_size`](Self::query_size) bytes, zeroed, and stay valid for as
    /// long as the queue is started.
    pub fn from_base(base: u64, cfg: &QueueConfig) -> Result<Self, C2hError> {
        if !base.is_multiple_of(Self::ALIGN as u64) {
            return Err(C2hError::InvalidArg("ring memory is not 64-byte aligned"));
        }

        let cmpl_off = Self::cmpl_offset(cfg);
        let status_off = cmpl_off + cfg.cmpl_ring_size() as usize * cfg.cmpl_entry_size().bytes();

        Ok(Self {
            desc_ring_addr: base,
            cmpl_ring_addr: base + cmpl_off as u64,
            cmpl_status_addr: base + status_off as u64,
        })
    }

    fn cmpl_offset(cfg: &QueueConfig) -> usize {
        let desc_size = cfg.ring_size() as usize * C2hDesc::SIZE;
        align_up(desc_size + DESC_STATUS_SIZE, Self::ALIGN)
    }

    /// Bytes of coherent memory needed by a queue configured as `cfg`.
    pub fn query_size(cfg: &QueueConfig) -> usize {
        Self::cmpl_offset(cfg)
            + cfg.cmpl_ring_size() as usize * cfg.cmpl_entry_size().bytes()
            + CmplStatus::SIZE
    }

    /// Host address of descriptor `idx`.
    #[inline]
    pub fn desc_addr(&self, idx: u32) -> u64 {
        self.desc_ring_addr + idx as u64 * C2hDesc::SIZE as u64
    }
}
