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

use alloc::string::String;
use core::cmp::{max, min};

use crate::PAGE_SIZE;
use crate::error::C2hError;

/// Width of one completion ring record.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Default)]
#[cfg_attr(feature = "fuzzing", derive(arbitrary::Arbitrary))]
pub enum CmplEntrySize {
    #[default]
    B8,
    B16,
    B32,
    B64,
}

impl CmplEntrySize {
    /// Record width in bytes.
    pub const fn bytes(self) -> usize {
        match self {
            CmplEntrySize::B8 => 8,
            CmplEntrySize::B16 => 16,
            CmplEntrySize::B32 => 32,
            CmplEntrySize::B64 => 64,
        }
    }
}

/// Configuration of one C2H stream queue.
///
/// Handed to the engine when the queue is created and treated as immutable
/// while the queue is started.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct QueueConfig {
    name: String,
    qidx: u16,
    /// card-to-host direction
    c2h: bool,
    /// streaming (as opposed to memory mapped) mode
    st: bool,
    /// Descriptor ring and free list size.
    ring_size: u32,
    /// Completion ring size.
    cmpl_ring_size: u32,
    cmpl_entry_size: CmplEntrySize,
    /// Free-list slots are `PAGE_SIZE << page_order` bytes.
    page_order: u8,
    /// Completion records may carry user-defined data, possibly without
    /// consuming a descriptor.
    udd_en: bool,
}

impl QueueConfig {
    /// The default descriptor and completion ring size
    pub const DEFAULT_RING_SIZE: u32 = 2048;
    /// The minimum ring size; one slot is always withheld from the device
    pub const MIN_RING_SIZE: u32 = 2;
    /// The maximum ring size, bounded by the 16-bit hardware indices
    pub const MAX_RING_SIZE: u32 = u16::MAX as u32;
    /// The default free-list page order
    pub const DEFAULT_PAGE_ORDER: u8 = 0;
    /// The maximum free-list page order (64KB slots)
    pub const MAX_PAGE_ORDER: u8 = 4;

    /// Create a C2H stream queue configuration with default ring geometry.
    pub fn new(name: impl Into<String>, qidx: u16) -> Self {
        Self {
            name: name.into(),
            qidx,
            c2h: true,
            st: true,
            ring_size: Self::DEFAULT_RING_SIZE,
            cmpl_ring_size: Self::DEFAULT_RING_SIZE,
            cmpl_entry_size: CmplEntrySize::default(),
            page_order: Self::DEFAULT_PAGE_ORDER,
            udd_en: false,
        }
    }

    fn clamp_ring(size: u32) -> u32 {
        match size {
            0 => Self::DEFAULT_RING_SIZE,
            1.. => min(Self::MAX_RING_SIZE, max(size, Self::MIN_RING_SIZE)),
        }
    }

    /// Set the descriptor ring size. 0 selects `DEFAULT_RING_SIZE`, other
    /// values are clamped to `MIN_RING_SIZE..=MAX_RING_SIZE`.
    pub fn set_ring_size(&mut self, size: u32) -> &mut Self {
        self.ring_size = Self::clamp_ring(size);
        self
    }

    /// Set the completion ring size, with the same clamping as
    /// [`set_ring_size`](Self::set_ring_size).
    pub fn set_cmpl_ring_size(&mut self, size: u32) -> &mut Self {
        self.cmpl_ring_size = Self::clamp_ring(size);
        self
    }

    pub fn set_cmpl_entry_size(&mut self, size: CmplEntrySize) -> &mut Self {
        self.cmpl_entry_size = size;
        self
    }

    /// Set the free-list page order, capped at `MAX_PAGE_ORDER`.
    pub fn set_page_order(&mut self, order: u8) -> &mut Self {
        self.page_order = min(order, Self::MAX_PAGE_ORDER);
        self
    }

    pub fn set_udd_en(&mut self, en: bool) -> &mut Self {
        self.udd_en = en;
        self
    }

    /// Select direction and mode. Only C2H streaming queues are accepted by
    /// [`validate`](Self::validate).
    pub fn set_mode(&mut self, c2h: bool, st: bool) -> &mut Self {
        self.c2h = c2h;
        self.st = st;
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn qidx(&self) -> u16 {
        self.qidx
    }

    pub fn ring_size(&self) -> u32 {
        self.ring_size
    }

    pub fn cmpl_ring_size(&self) -> u32 {
        self.cmpl_ring_size
    }

    pub fn cmpl_entry_size(&self) -> CmplEntrySize {
        self.cmpl_entry_size
    }

    pub fn page_order(&self) -> u8 {
        self.page_order
    }

    pub fn udd_en(&self) -> bool {
        self.udd_en
    }

    /// Bytes held by one free-list slot.
    pub fn buf_size(&self) -> usize {
        PAGE_SIZE << self.page_order
    }

    /// Check the combination of settings.
    pub fn validate(&self) -> Result<(), C2hError> {
        if !self.c2h || !self.st {
            return Err(C2hError::InvalidConfig("only C2H stream queues are supported"));
        }
        if self.udd_en && self.cmpl_entry_size == CmplEntrySize::B8 {
            return Err(C2hError::InvalidConfig(
                "user-defined data needs completion entries of at least 16 bytes",
            ));
        }
        Ok(())
    }
}
