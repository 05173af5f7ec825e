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
#![allow(dead_code)]

use std::sync::Arc;

use qdma_c2h::{C2hMode, C2hQueue, PAGE_SIZE, QueueConfig, ReadCompletion};
use qdma_testing::{RING_BASE, SimC2hHw, SimDevice};

/// Capacity of one free-list slot at page order 0.
pub const CAP: usize = PAGE_SIZE;

pub type Queue = C2hQueue<Arc<SimDevice>>;

/// An 8-entry C2H stream queue config.
pub fn small_cfg(name: &str) -> QueueConfig {
    let mut cfg = QueueConfig::new(name, 3);
    cfg.set_ring_size(8).set_cmpl_ring_size(8);
    cfg
}

/// Creates and starts a queue on a fresh simulated function.
pub fn started(
    cfg: QueueConfig,
    mode: C2hMode<Arc<SimDevice>>,
) -> (Arc<SimDevice>, Queue, SimC2hHw) {
    let hw = SimC2hHw::new(&cfg).unwrap();
    let dev = Arc::new(SimDevice::new());
    let q = C2hQueue::new(dev.clone(), cfg, mode).unwrap();
    q.start(RING_BASE).unwrap();
    (dev, q, hw)
}

/// Creates and starts a buffered 8-entry queue.
pub fn buffered(name: &str) -> (Arc<SimDevice>, Queue, SimC2hHw) {
    started(small_cfg(name), C2hMode::Buffered)
}

/// `len` bytes that differ per `seed`.
pub fn payload(seed: u8, len: usize) -> Vec<u8> {
    (0..len)
        .map(|i| (i as u8).wrapping_mul(7).wrapping_add(seed))
        .collect()
}

/// The one completion the queue is holding for us.
pub fn single_completion(q: &Queue) -> ReadCompletion {
    let mut done = q.take_completed();
    assert_eq!(done.len(), 1, "expected exactly one completion");
    done.remove(0)
}

/// DMA addresses currently programmed into every descriptor.
pub fn desc_dsts(dev: &SimDevice, hw: &SimC2hHw, ring_size: u32) -> Vec<u64> {
    (0..ring_size)
        .map(|idx| hw.desc_dst(dev, idx).unwrap())
        .collect()
}
