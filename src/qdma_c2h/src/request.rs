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

use alloc::boxed::Box;
use alloc::sync::Arc;
use alloc::vec::Vec;
use core::fmt;
use core::sync::atomic::{AtomicBool, Ordering};

use bytes::BytesMut;

use crate::error::C2hError;

/// Cancellation flag shared between a request and its submitter.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::Release);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }
}

/// Where the next copied byte lands.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RequestProgress {
    /// Bytes still wanted.
    pub left: usize,
    /// Destination segment being filled.
    pub sg_idx: usize,
    /// Offset inside that segment.
    pub sg_offset: usize,
}

/// Outcome of a read request, handed back with its buffers.
#[derive(Debug)]
pub struct ReadCompletion {
    pub tag: u64,
    /// Bytes copied on success.
    pub result: Result<usize, C2hError>,
    /// Bytes copied, also on failure.
    pub copied: usize,
    pub sgl: Vec<BytesMut>,
}

type DoneFn = Box<dyn FnOnce(ReadCompletion) + Send>;

/// A scatter-gather read waiting for received data.
///
/// The destination segments are written in order, each up to its current
/// length; the engine never resizes them.
pub struct ReadRequest {
    tag: u64,
    sgl: Vec<BytesMut>,
    count: usize,
    pub(crate) progress: RequestProgress,
    cancel: CancelToken,
    done: Option<DoneFn>,
}

impl ReadRequest {
    pub fn new(tag: u64, sgl: Vec<BytesMut>) -> Self {
        let count = sgl.iter().map(|s| s.len()).sum();
        Self {
            tag,
            sgl,
            count,
            progress: RequestProgress {
                left: count,
                sg_idx: 0,
                sg_offset: 0,
            },
            cancel: CancelToken::new(),
            done: None,
        }
    }

    /// A request for `len` bytes into one zeroed buffer.
    pub fn with_len(tag: u64, len: usize) -> Self {
        Self::new(tag, alloc::vec![BytesMut::zeroed(len)])
    }

    /// Run `f` with the completion instead of queueing it for
    /// [`take_completed`](crate::Descq::take_completed). Runs with the queue
    /// lock held.
    pub fn on_done(mut self, f: impl FnOnce(ReadCompletion) + Send + 'static) -> Self {
        self.done = Some(Box::new(f));
        self
    }

    pub fn with_cancel_token(mut self, token: CancelToken) -> Self {
        self.cancel = token;
        self
    }

    pub fn tag(&self) -> u64 {
        self.tag
    }

    /// Total bytes requested.
    pub fn count(&self) -> usize {
        self.count
    }

    pub fn left(&self) -> usize {
        self.progress.left
    }

    /// Bytes copied so far.
    pub fn copied(&self) -> usize {
        self.count - self.progress.left
    }

    pub fn progress(&self) -> RequestProgress {
        self.progress
    }

    pub fn cancel_token(&self) -> &CancelToken {
        &self.cancel
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    pub fn sgl(&self) -> &[BytesMut] {
        &self.sgl
    }

    pub(crate) fn sgl_mut(&mut self) -> &mut [BytesMut] {
        &mut self.sgl
    }

    /// Give up the buffers and the completion hook.
    pub(crate) fn finish(
        self,
        result: Result<usize, C2hError>,
    ) -> (ReadCompletion, Option<DoneFn>) {
        let copied = self.copied();
        let completion = ReadCompletion {
            tag: self.tag,
            result,
            copied,
            sgl: self.sgl,
        };
        (completion, self.done)
    }

    /// The received bytes, concatenated.
    pub fn to_vec(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.copied());
        for seg in &self.sgl {
            out.extend_from_slice(seg);
        }
        out.truncate(self.copied());
        out
    }
}

impl fmt::Debug for ReadRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ReadRequest")
            .field("tag", &self.tag)
            .field("count", &self.count)
            .field("progress", &self.progress)
            .field("segments", &self.sgl.len())
            .field("cancelled", &self.cancel.is_cancelled())
            .finish()
    }
}

impl ReadCompletion {
    /// The received bytes, concatenated.
    pub fn data(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.copied);
        for seg in &self.sgl {
            out.extend_from_slice(seg);
        }
        out.truncate(self.copied);
        out
    }
}
