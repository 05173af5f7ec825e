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

//! Ring index arithmetic
//!
//! Every ring in the engine (free list, descriptor ring, completion ring) is
//! addressed by plain indices in `0..size`. The helpers here take the ring
//! size explicitly so rings of different sizes can share them.
//!
//! ```text
//!   consumer            producer
//!      v                   v
//! ┌───┬───┬───┬───┬───┬───┬───┬───┐
//! │   │ x │ x │ x │ x │ x │   │   │   delta(producer, consumer) = 5
//! └───┴───┴───┴───┴───┴───┴───┴───┘
//! ```

/// Advance `idx` by `delta` slots, wrapping at `size`.
#[inline]
pub const fn ring_idx_incr(idx: u32, delta: u32, size: u32) -> u32 {
    ((idx as u64 + delta as u64) % size as u64) as u32
}

/// Move `idx` back by `delta` slots, wrapping at `size`.
#[inline]
pub const fn ring_idx_decr(idx: u32, delta: u32, size: u32) -> u32 {
    let delta = delta % size;
    ((idx as u64 + size as u64 - delta as u64) % size as u64) as u32
}

/// Number of slots from `consumer` forward to `producer`.
#[inline]
pub const fn ring_idx_delta(producer: u32, consumer: u32, size: u32) -> u32 {
    ((producer as u64 + size as u64 - consumer as u64) % size as u64) as u32
}

/// Consumer position on the completion ring.
///
/// Tracks the next record to read and the color the device writes during the
/// current traversal. The color flips every time the index wraps, so a record
/// whose color bit differs from [`color`](Self::color) was written during the
/// previous traversal and has already been consumed.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct CmplCursor {
    cidx: u32,
    size: u32,
    color: bool,
}

impl CmplCursor {
    /// A fresh cursor. The ring memory starts zeroed, so the first traversal
    /// expects color 1.
    pub fn new(size: u32) -> Self {
        Self {
            cidx: 0,
            size,
            color: true,
        }
    }

    /// Step past the current record, flipping the color on wrap.
    #[inline]
    pub fn advance(&mut self) {
        self.cidx += 1;
        if self.cidx >= self.size {
            self.cidx = 0;
            self.color = !self.color;
        }
    }

    #[inline]
    pub fn cidx(&self) -> u32 {
        self.cidx
    }

    #[inline]
    pub fn color(&self) -> bool {
        self.color
    }

    #[inline]
    pub fn size(&self) -> u32 {
        self.size
    }

    /// Index of the record after the current one, i.e. the value to credit to
    /// the device once the current record has been consumed.
    #[inline]
    pub fn next_cidx(&self) -> u32 {
        ring_idx_incr(self.cidx, 1, self.size)
    }
}
