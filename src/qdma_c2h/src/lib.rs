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

//! Streaming card-to-host (C2H) completion engine for QDMA queues.
//!
//! A C2H stream queue is driven by two rings that software and the device
//! share without locks:
//!
//! - The **free list** ([`FreeList`]): a ring of page-sized, DMA-mapped
//!   receive buffers. Software arms slots by announcing a producer index,
//!   the device fills them front to back.
//! - The **completion ring** ([`CmplEntry`]): fixed-width records written by
//!   the device, one per received packet (or per user-defined-data only
//!   record). A color bit that flips on every ring traversal tells fresh
//!   records from stale ones.
//!
//! [`Descq`] ties the two together. Each call to
//! [`process_completions`](Descq::process_completions) parses new records,
//! marks packet boundaries on the free list and then copies received bytes
//! into queued [`ReadRequest`]s in arrival order. Alternatively a
//! [`PacketHandler`] can consume packets straight out of the free list.
//!
//! All device interaction goes through the [`QueueDevice`] seam, so the same
//! engine runs against real hardware or a simulated function.

#![cfg_attr(not(any(test, debug_assertions)), warn(clippy::panic))]
#![cfg_attr(not(any(test, debug_assertions)), warn(clippy::expect_used))]
#![cfg_attr(not(any(test, debug_assertions)), warn(clippy::unwrap_used))]
#![cfg_attr(not(feature = "std"), no_std)]

extern crate alloc;

/// Base page size; free-list slots are `PAGE_SIZE << page_order` bytes.
pub const PAGE_SIZE: usize = 0x1_000; // 4KB

mod access;
mod cmpl;
mod config;
mod descq;
mod error;
mod flq;
mod fulfill;
mod layout;
mod packet;
mod request;
mod ring;
#[cfg(test)]
mod test_utils;

/// Blocking read and polling helpers built on top of [`C2hQueue`].
#[cfg(feature = "std")]
pub mod sync;

pub use access::*;
pub use cmpl::*;
pub use config::*;
pub use descq::*;
pub use error::*;
pub use flq::*;
pub use layout::*;
pub use packet::*;
pub use request::*;
pub use ring::*;
