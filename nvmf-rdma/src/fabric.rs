//! Fabric transport adapter.
//!
//! The queue pair engine does not speak verbs itself. It drives a
//! [`Fabric`] to open a reliable connection and then a [`Connection`] to
//! register memory, post sends and receives, and drain completions.
//!
//! # Correlation
//!
//! Every work request carries a 64-bit `wr_id` that comes back untouched in
//! its [`WorkCompletion`]. The engine tags sends with the command identifier
//! and receives with the receive-slot index.
//!
//! # Polling
//!
//! Completion queue polling state is not shareable across threads in typical
//! RDMA stacks, so each polling thread obtains its own
//! [`Connection::Poller`] through [`Connection::create_poller`] and passes it
//! explicitly to every [`Connection::poll_completions`] call.

use std::fmt;

use crate::dma::{DmaBuf, RegisteredBuf};
use crate::error::Result;
use crate::nvmf::TransportId;

/// Which queue a work completion came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Direction {
    /// Send queue (command capsules)
    Send,
    /// Receive queue (response capsules)
    Receive,
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Direction::Send => f.write_str("send"),
            Direction::Receive => f.write_str("receive"),
        }
    }
}

/// Outcome of a work request as reported by the transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompletionStatus {
    /// Work request completed
    Success,
    /// Work request failed with a transport-specific status code
    Failure(u32),
}

/// One completion queue entry as seen by the engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WorkCompletion {
    /// Correlation value supplied when the work request was posted
    pub wr_id: u64,
    /// Queue the work request was posted to
    pub direction: Direction,
    /// Completion status
    pub status: CompletionStatus,
    /// Bytes transferred (receives only)
    pub byte_len: u32,
}

impl WorkCompletion {
    /// Successful send completion.
    pub fn send(wr_id: u64) -> Self {
        Self {
            wr_id,
            direction: Direction::Send,
            status: CompletionStatus::Success,
            byte_len: 0,
        }
    }

    /// Successful receive completion of `byte_len` bytes.
    pub fn recv(wr_id: u64, byte_len: u32) -> Self {
        Self {
            wr_id,
            direction: Direction::Receive,
            status: CompletionStatus::Success,
            byte_len,
        }
    }

    /// Same completion, marked failed with `code`.
    pub fn failed(mut self, code: u32) -> Self {
        self.status = CompletionStatus::Failure(code);
        self
    }

    /// The failure this completion represents, if any.
    pub fn error(&self) -> Option<CompletionError> {
        match self.status {
            CompletionStatus::Success => None,
            CompletionStatus::Failure(status) => Some(CompletionError {
                direction: self.direction,
                status,
            }),
        }
    }
}

/// A failed work completion, delivered to command and response callbacks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("{direction} work completion failed (status={status})")]
pub struct CompletionError {
    /// Queue the failed work request was posted to
    pub direction: Direction,
    /// Transport-specific status code
    pub status: u32,
}

/// Parameters for opening one connection.
#[derive(Debug, Clone, Copy)]
pub struct ConnectParams<'a> {
    /// Remote endpoint
    pub transport_id: &'a TransportId,
    /// Connection-manager private data sent with the connect request
    pub private_data: &'a [u8],
    /// Send queue depth
    pub send_queue_depth: u32,
    /// Receive queue depth
    pub recv_queue_depth: u32,
    /// Completion queue depth (covers both queues)
    pub completion_queue_depth: u32,
    /// Maximum inline send size in bytes
    pub max_inline_data: u32,
}

/// Factory for connections; one per RDMA device or in-process target.
pub trait Fabric {
    /// Connection type produced by this fabric.
    type Connection: Connection;

    /// Establish a connection, blocking until it is ready or rejected.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Connect`](crate::Error::Connect) on rejection or
    /// transport failure.
    fn connect(&self, params: &ConnectParams<'_>) -> Result<Self::Connection>;
}

/// An established reliable connection.
pub trait Connection: Send + Sync {
    /// Per-thread completion polling state.
    type Poller: Send;

    /// Register a buffer so that work requests and remote peers may use it.
    fn register_memory(&self, buf: DmaBuf) -> Result<RegisteredBuf>;

    /// Undo a registration.
    fn deregister_memory(&self, buf: RegisteredBuf) -> Result<()>;

    /// Post a signaled send of the first `len` bytes of `buf`.
    fn post_send(&self, wr_id: u64, buf: &RegisteredBuf, len: usize) -> Result<()>;

    /// Post `buf` to the receive queue.
    fn post_receive(&self, wr_id: u64, buf: &RegisteredBuf) -> Result<()>;

    /// Create a polling handle that drains at most `max_batch` entries per call.
    fn create_poller(&self, max_batch: usize) -> Result<Self::Poller>;

    /// Drain ready completions into `out` (appending), returning how many
    /// were appended.
    fn poll_completions(
        &self,
        poller: &mut Self::Poller,
        out: &mut Vec<WorkCompletion>,
    ) -> Result<usize>;

    /// Disconnect. Outstanding work requests are flushed or dropped.
    fn close(&self) -> Result<()>;
}
