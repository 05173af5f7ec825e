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

//! Completion (write-back) ring records
//!
//! The device writes one record per received packet. The first 64-bit word
//! of every record carries the control bits; the rest of a wide record is
//! user-defined data.
//!
//! ```text
//!  63                    20 19            4   3     2     1      0
//! ┌────────────────────────┬───────────────┬─────┬─────┬───────┬────────┐
//! │ user-defined data      │ length        │ DSC │ ERR │ COLOR │ FORMAT │
//! └────────────────────────┴───────────────┴─────┴─────┴───────┴────────┘
//! ```
//!
//! A status block after the last record holds the device's producer index.

use alloc::string::String;
use core::fmt::Write;

use bitflags::bitflags;
use bytemuck::{Pod, Zeroable};
use smallvec::SmallVec;

use crate::access::MemOps;
use crate::config::CmplEntrySize;
use crate::error::{C2hError, CmplError};

bitflags! {
    /// Control bits in the first word of a completion record.
    #[repr(transparent)]
    #[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
    pub struct CmplFlags: u8 {
        /// Format 1 records carry no length field.
        const FORMAT    = 1 << 0;
        /// Flips every traversal of the completion ring.
        const COLOR     = 1 << 1;
        /// The device flagged this record as bad.
        const ERR       = 1 << 2;
        /// The record consumed at least one descriptor.
        const DESC_USED = 1 << 3;
    }
}

const LENGTH_SHIFT: u32 = 4;
const LENGTH_MASK: u64 = 0xFFFF;

/// Completion status block written by the device after each batch of records.
#[repr(C)]
#[derive(Clone, Copy, Debug, Pod, Zeroable, PartialEq, Eq)]
pub struct CmplStatus {
    /// Next record the device will write.
    pub pidx: u16,
    /// Last consumer index the device has seen.
    pub cidx: u16,
    /// bit 0: color, bits 1-2: interrupt state
    pub color_isr_status: u32,
}

const _: () = assert!(core::mem::size_of::<CmplStatus>() == 8);
const _: () = assert!(CmplStatus::PIDX_OFFSET == 0);

impl CmplStatus {
    pub const SIZE: usize = core::mem::size_of::<Self>();
    pub const PIDX_OFFSET: usize = core::mem::offset_of!(Self, pidx);

    /// Load the device producer index with acquire semantics.
    pub fn read_pidx<M: MemOps>(mem: &M, addr: u64) -> Result<u16, M::Error> {
        mem.load_acquire(addr + Self::PIDX_OFFSET as u64)
    }

    /// Build the control word of a data record. Used by simulated devices and
    /// tests to produce records the parser accepts.
    pub fn encode_word(flags: CmplFlags, len: u16) -> u64 {
        flags.bits() as u64 | ((len as u64 & LENGTH_MASK) << LENGTH_SHIFT)
    }
}

/// One decoded completion record.
///
/// Derived from the raw bytes at the consumer position; the raw bytes are
/// kept so they can be handed out as user-defined data.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CmplEntry {
    flags: CmplFlags,
    len: u32,
    cidx: u32,
    raw: SmallVec<[u8; 64]>,
}

impl CmplEntry {
    /// Decode a record without validating it.
    pub fn decode(raw: &[u8], cidx: u32) -> Self {
        let mut word = [0u8; 8];
        let n = raw.len().min(8);
        word[..n].copy_from_slice(&raw[..n]);
        let word = u64::from_le_bytes(word);

        let flags = CmplFlags::from_bits_truncate(word as u8);
        // format 1 records have no length; zero-length transfers are legal
        let len = if !flags.contains(CmplFlags::FORMAT) && flags.contains(CmplFlags::DESC_USED) {
            ((word >> LENGTH_SHIFT) & LENGTH_MASK) as u32
        } else {
            0
        };

        Self {
            flags,
            len,
            cidx,
            raw: SmallVec::from_slice(raw),
        }
    }

    /// Read the record at `cidx` of the ring at `ring_addr`, after a read
    /// barrier.
    pub fn read<M: MemOps>(
        mem: &M,
        ring_addr: u64,
        cidx: u32,
        entry_size: CmplEntrySize,
    ) -> Result<Self, C2hError> {
        let width = entry_size.bytes();
        let addr = ring_addr + cidx as u64 * width as u64;
        let mut raw = [0u8; 64];

        mem.read_barrier();
        mem.read(addr, &mut raw[..width])
            .map_err(|_| C2hError::MemoryAccess(addr))?;

        Ok(Self::decode(&raw[..width], cidx))
    }

    /// Reject records the engine cannot consume.
    pub fn validate(&self, udd_en: bool) -> Result<(), CmplError> {
        if self.flags.contains(CmplFlags::ERR) {
            return Err(CmplError::ErrBit(self.cidx));
        }
        if self.flags.contains(CmplFlags::FORMAT) {
            return Err(CmplError::Format(self.cidx));
        }
        if !self.flags.contains(CmplFlags::DESC_USED) && !udd_en {
            return Err(CmplError::NoDescNoUdd(self.cidx));
        }
        Ok(())
    }

    /// A record is unconsumed when its color matches the expected color of
    /// the current traversal.
    #[inline]
    pub fn is_new(&self, expected_color: bool) -> bool {
        self.color() == expected_color
    }

    #[inline]
    pub fn flags(&self) -> CmplFlags {
        self.flags
    }

    #[inline]
    pub fn color(&self) -> bool {
        self.flags.contains(CmplFlags::COLOR)
    }

    #[inline]
    pub fn desc_used(&self) -> bool {
        self.flags.contains(CmplFlags::DESC_USED)
    }

    /// Packet length in bytes.
    #[inline]
    pub fn len(&self) -> u32 {
        self.len
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    #[inline]
    pub fn cidx(&self) -> u32 {
        self.cidx
    }

    /// The whole raw record, as passed to packet handlers as user-defined data.
    #[inline]
    pub fn raw(&self) -> &[u8] {
        &self.raw
    }
}

/// Format `raw` as offset-prefixed hex lines of 16 bytes.
pub fn hex_dump(out: &mut String, prefix: &str, raw: &[u8]) {
    for (line, chunk) in raw.chunks(16).enumerate() {
        let _ = write!(out, "{prefix}{:08x}:", line * 16);
        for b in chunk {
            let _ = write!(out, " {b:02x}");
        }
        out.push('\n');
    }
}
