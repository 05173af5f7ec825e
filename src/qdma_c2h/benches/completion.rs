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

use std::hint::black_box;
use std::sync::Arc;

use criterion::{BenchmarkId, Criterion, Throughput, criterion_group, criterion_main};
use qdma_c2h::{
    C2hMode, C2hPacket, C2hQueue, CmplEntry, CmplFlags, CmplStatus, QueueConfig, ReadRequest,
};
use qdma_testing::{RING_BASE, SimC2hHw, SimDevice};

const RING: u32 = 256;
const BATCH: usize = 32;

// Helper to create a started queue for benchmarking
fn make_queue(
    mode: C2hMode<Arc<SimDevice>>,
) -> (Arc<SimDevice>, C2hQueue<Arc<SimDevice>>, SimC2hHw) {
    let mut cfg = QueueConfig::new("bench", 0);
    cfg.set_ring_size(RING).set_cmpl_ring_size(RING);
    let hw = SimC2hHw::new(&cfg).unwrap();
    let dev = Arc::new(SimDevice::new());
    let q = C2hQueue::new(dev.clone(), cfg, mode).unwrap();
    q.start(RING_BASE).unwrap();
    (dev, q, hw)
}

// Record decode and validation
fn bench_parse(c: &mut Criterion) {
    let mut group = c.benchmark_group("cmpl_parse");
    group.throughput(Throughput::Elements(1));

    let raw = CmplStatus::encode_word(CmplFlags::COLOR | CmplFlags::DESC_USED, 1500).to_le_bytes();
    group.bench_function("decode_validate", |b| {
        b.iter(|| {
            let entry = CmplEntry::decode(black_box(&raw), 0);
            entry.validate(false).unwrap();
            black_box(entry.len())
        });
    });

    group.finish();
}

// Completion pass feeding one read request per batch
fn bench_buffered(c: &mut Criterion) {
    let mut group = c.benchmark_group("buffered_batch");

    for size in [64usize, 1500, 4096, 9000].iter() {
        group.throughput(Throughput::Bytes((size * BATCH) as u64));
        group.bench_with_input(BenchmarkId::from_parameter(size), size, |b, &size| {
            let (dev, q, mut hw) = make_queue(C2hMode::Buffered);
            let payload = vec![0x5au8; size];
            b.iter(|| {
                for _ in 0..BATCH {
                    hw.push_packet(&dev, &payload).unwrap();
                }
                q.submit_read(ReadRequest::with_len(0, size * BATCH)).unwrap();
                let n = q.process_completions(0).unwrap();
                black_box(q.take_completed());
                n
            });
        });
    }

    group.finish();
}

// Same traffic handed to a packet handler
fn bench_direct(c: &mut Criterion) {
    let mut group = c.benchmark_group("direct_batch");

    for size in [64usize, 1500, 4096].iter() {
        group.throughput(Throughput::Bytes((size * BATCH) as u64));
        group.bench_with_input(BenchmarkId::from_parameter(size), size, |b, &size| {
            let mut scratch = vec![0u8; size];
            let mode = C2hMode::direct(move |pkt: &C2hPacket<'_, Arc<SimDevice>>| {
                pkt.copy_to(&mut scratch).map_err(|_| -14)?;
                Ok(())
            });
            let (dev, q, mut hw) = make_queue(mode);
            let payload = vec![0xa5u8; size];
            b.iter(|| {
                for _ in 0..BATCH {
                    hw.push_packet(&dev, &payload).unwrap();
                }
                q.process_completions(0).unwrap()
            });
        });
    }

    group.finish();
}

criterion_group!(benches, bench_parse, bench_buffered, bench_direct);
criterion_main!(benches);
