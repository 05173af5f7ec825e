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

#![no_main]

use std::sync::Arc;

use arbitrary::Arbitrary;
use libfuzzer_sys::fuzz_target;
use qdma_c2h::{
    C2hError, C2hMode, C2hQueue, CmplEntrySize, CmplFlags, QueueConfig, ReadRequest,
    ring_idx_delta,
};
use qdma_testing::{RING_BASE, SimC2hHw, SimDevice};

const RING: u32 = 16;

#[derive(Arbitrary, Debug)]
enum Op {
    /// A well-formed packet of this many bytes.
    Packet(u16),
    /// Whatever first word the fuzzer likes.
    Raw { flags: u8, len: u16 },
    UddOnly,
    Read(u16),
    ZeroRead,
    Process(u8),
    PacketRead(u16),
    Cancel(u8),
}

#[derive(Arbitrary, Debug)]
struct Input {
    entry_size: CmplEntrySize,
    udd_en: bool,
    ops: Vec<Op>,
}

// Feeds arbitrary device behavior through one queue and checks the buffer
// accounting after every step. Protocol errors are expected; panics and
// broken accounting are not.
fuzz_target!(|input: Input| {
    let mut cfg = QueueConfig::new("fuzz", 0);
    cfg.set_ring_size(RING)
        .set_cmpl_ring_size(RING)
        .set_cmpl_entry_size(input.entry_size)
        .set_udd_en(input.udd_en && input.entry_size != CmplEntrySize::B8);

    let dev = Arc::new(SimDevice::new());
    let Ok(mut hw) = SimC2hHw::new(&cfg) else {
        return;
    };
    let q = C2hQueue::new(dev.clone(), cfg, C2hMode::Buffered).unwrap();
    q.start(RING_BASE).unwrap();

    let mut tag = 0u64;
    for op in input.ops {
        tag += 1;
        match op {
            Op::Packet(len) => {
                let _ = hw.push_packet(&dev, &vec![tag as u8; len as usize]);
            }
            Op::Raw { flags, len } => {
                let _ = hw.push_raw(&dev, CmplFlags::from_bits_truncate(flags), len);
            }
            Op::UddOnly => {
                let _ = hw.push_udd_only(&dev, &[0xee; 8]);
            }
            Op::Read(len) => {
                let _ = q.submit_read(ReadRequest::with_len(tag, len as usize));
            }
            Op::ZeroRead => {
                let _ = q.submit_read(ReadRequest::new(tag, Vec::new()));
            }
            Op::Process(budget) => match q.process_completions(budget as u32) {
                Ok(_) | Err(C2hError::Completion(_)) => {}
                Err(e) => panic!("unexpected completion error: {e}"),
            },
            Op::PacketRead(len) => {
                let _ = q.packet_read(&mut ReadRequest::with_len(tag, len as usize));
            }
            Op::Cancel(back) => {
                let _ = q.cancel(tag.saturating_sub(back as u64));
            }
        }

        let g = q.lock();
        let flq = g.free_list();
        assert!(g.avail() < RING);
        assert_eq!(g.avail() + ring_idx_delta(g.pidx(), flq.pidx_arm(), RING), RING - 1);
        assert!(flq.backlog() <= ring_idx_delta(g.pidx(), flq.pidx_arm(), RING));
        drop(g);

        for c in q.take_completed() {
            if let Ok(n) = c.result {
                assert_eq!(n, c.copied);
            }
        }
    }

    drop(q);
    assert_eq!(dev.live_pages(), 0);
    assert_eq!(dev.live_mappings(), 0);
});
