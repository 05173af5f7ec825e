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

use thiserror::Error;

/// A malformed completion record. Any of these halts the queue.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum CmplError {
    #[error("completion entry {0} has the error bit set")]
    ErrBit(u32),
    /// Format 1 records carry no length, so the consumed descriptors are unknown.
    #[error("completion entry {0} uses unsupported format 1")]
    Format(u32),
    #[error("completion entry {0} used no descriptor and user-defined data is disabled")]
    NoDescNoUdd(u32),
    #[error("free-list slot {0} filled twice without being drained")]
    DoubleFill(u32),
    #[error("completion entry {cidx} claims {needed} buffers but only {avail} were armed")]
    Overrun { cidx: u32, needed: u32, avail: u32 },
}

/// Refilling a free-list slot failed. Never fatal to a running queue.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum FillError {
    #[error("out of memory allocating order-{0} receive pages")]
    OutOfMemory(u8),
    #[error("failed to map receive page for device access")]
    Mapping,
}

/// The error type for C2H queue operations.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum C2hError {
    /// Protocol error found in the completion ring
    #[error("completion protocol error: {0}")]
    Completion(#[from] CmplError),

    /// Receive buffer setup failed
    #[error("receive buffer setup failed: {0}")]
    Fill(#[from] FillError),

    /// The queue stopped processing after a protocol error
    #[error("queue is halted after a completion error")]
    Halted,

    /// The queue has not been started
    #[error("queue is not started")]
    NotStarted,

    /// `start` called on a running queue
    #[error("queue is already started")]
    AlreadyStarted,

    /// The queue was stopped while the request was outstanding
    #[error("queue was stopped")]
    Stopped,

    /// Caller handed the engine something it cannot use
    #[error("invalid argument: {0}")]
    InvalidArg(&'static str),

    /// Queue configuration rejected
    #[error("invalid queue configuration: {0}")]
    InvalidConfig(&'static str),

    /// The registered packet handler refused a packet
    #[error("packet handler failed with code {0}")]
    Handler(i32),

    /// The request was cancelled by its submitter
    #[error("request was cancelled")]
    Cancelled,

    /// A blocking read ran out of time
    #[error("read timed out after copying {copied} bytes")]
    Timeout { copied: usize },

    /// No queued request carries this tag
    #[error("no outstanding request with tag {0}")]
    UnknownRequest(u64),

    /// Shared memory could not be accessed
    #[error("device memory access failed at {0:#x}")]
    MemoryAccess(u64),
}

impl C2hError {
    /// Protocol errors that leave the queue halted until it is restarted.
    pub fn is_fatal(&self) -> bool {
        matches!(self, C2hError::Completion(_) | C2hError::Halted)
    }
}

pub type Result<T> = core::result::Result<T, C2hError>;
