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

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use bytes::BytesMut;
use crossbeam_channel::{RecvTimeoutError, bounded};
use log::{debug, warn};

use crate::access::QueueDevice;
use crate::descq::C2hQueue;
use crate::error::C2hError;
use crate::request::{ReadCompletion, ReadRequest};

/// How long [`read_blocking`] sleeps between its own completion passes.
pub const POLL_INTERVAL: Duration = Duration::from_millis(1);

/// Submit a read and wait for it, driving completion processing from the
/// calling thread.
///
/// On timeout the request is withdrawn and the completion carries
/// [`C2hError::Timeout`] with the bytes copied so far.
pub fn read_blocking<D: QueueDevice>(
    queue: &C2hQueue<D>,
    tag: u64,
    sgl: Vec<BytesMut>,
    timeout: Duration,
) -> ReadCompletion {
    let (tx, rx) = bounded(1);
    let req = ReadRequest::new(tag, sgl).on_done(move |c| {
        // the waiter may be gone already
        let _ = tx.try_send(c);
    });

    // a refused request still completes through the channel
    let _ = queue.submit_read(req);

    let deadline = Instant::now() + timeout;
    loop {
        if let Err(e) = queue.process_completions(0) {
            debug!("read {tag}: completion pass failed: {e}");
        }

        let now = Instant::now();
        let wait = POLL_INTERVAL.min(deadline.saturating_duration_since(now));
        match rx.recv_timeout(wait) {
            Ok(c) => return c,
            Err(RecvTimeoutError::Timeout) if Instant::now() < deadline => continue,
            Err(RecvTimeoutError::Timeout) => break,
            Err(RecvTimeoutError::Disconnected) => {
                return ReadCompletion {
                    tag,
                    result: Err(C2hError::Stopped),
                    copied: 0,
                    sgl: Vec::new(),
                };
            }
        }
    }

    // lost the race if the request completed in the meantime
    let _ = queue.cancel(tag);
    match rx.recv() {
        Ok(mut c) => {
            if c.result == Err(C2hError::Cancelled) {
                c.result = Err(C2hError::Timeout { copied: c.copied });
            }
            c
        }
        Err(_) => ReadCompletion {
            tag,
            result: Err(C2hError::Timeout { copied: 0 }),
            copied: 0,
            sgl: Vec::new(),
        },
    }
}

/// A thread that runs completion passes on an interval.
pub struct Poller {
    stop: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
}

impl Poller {
    /// Poll `queue` every `interval`, consuming at most `budget` records per
    /// pass.
    pub fn spawn<D>(
        queue: Arc<C2hQueue<D>>,
        budget: u32,
        interval: Duration,
    ) -> std::io::Result<Self>
    where
        D: QueueDevice + Send + 'static,
    {
        let stop = Arc::new(AtomicBool::new(false));
        let flag = stop.clone();
        let name = format!("c2h-poll-{}", queue.lock().config().qidx());

        let handle = thread::Builder::new().name(name).spawn(move || {
            while !flag.load(Ordering::Acquire) {
                match queue.process_completions(budget) {
                    Ok(_) | Err(C2hError::NotStarted) => {}
                    Err(e) => warn!("completion pass failed: {e}"),
                }
                thread::sleep(interval);
            }
        })?;

        Ok(Self {
            stop,
            handle: Some(handle),
        })
    }

    /// Stop the thread and wait for it to exit.
    pub fn stop(mut self) {
        self.shutdown();
    }

    fn shutdown(&mut self) {
        self.stop.store(true, Ordering::Release);
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

impl Drop for Poller {
    fn drop(&mut self) {
        self.shutdown();
    }
}
