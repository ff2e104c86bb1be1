//! Commands, responses and their completion callbacks.
//!
//! A [`Command`] wraps a registered command capsule; a [`Response`] is the
//! sink its completion queue entry lands in. Both carry a [`Callback`] that
//! the queue pair drives through `on_start`, then exactly one of
//! `on_complete` / `on_failure`.

use std::fmt;
use std::sync::{Arc, Mutex, PoisonError};

use crate::dma::RegisteredBuf;
use crate::error::{Error, Result};
use crate::fabric::CompletionError;
use crate::nvme::CompletionQueueEntry;

use super::capsule::{SQE_COMMAND_ID_OFFSET, SQE_SIZE};

/// Completion notifications for a command or a response.
///
/// Invoked from whichever thread calls
/// [`QueuePair::submit`](super::QueuePair::submit) (for `on_start`) or
/// [`QueuePair::poll`](super::QueuePair::poll). Never invoked with the queue
/// pair's internal lock held, so implementations may submit or poll again.
pub trait Callback: Send + Sync {
    /// The command is about to be posted.
    fn on_start(&self) {}

    /// The send (or response) completed successfully.
    fn on_complete(&self);

    /// The transport reported a failed work completion.
    fn on_failure(&self, reason: CompletionError);
}

/// A command capsule ready for submission.
pub struct Command {
    capsule: RegisteredBuf,
    len: usize,
    callback: Arc<dyn Callback>,
}

impl Command {
    /// Wrap the first `len` bytes of `capsule` as a command.
    ///
    /// The capsule must already hold the SQE (and any SGLs or in-capsule
    /// data); the queue pair only fills in the command identifier.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidArgument`] if `len` is shorter than an SQE or
    /// longer than the capsule.
    pub fn new(capsule: RegisteredBuf, len: usize, callback: Arc<dyn Callback>) -> Result<Self> {
        if len < SQE_SIZE || len > capsule.len() {
            return Err(Error::InvalidArgument(format!(
                "command length {} outside {}..={}",
                len,
                SQE_SIZE,
                capsule.len()
            )));
        }
        Ok(Self {
            capsule,
            len,
            callback,
        })
    }

    /// The registered capsule buffer.
    pub fn capsule(&self) -> &RegisteredBuf {
        &self.capsule
    }

    /// Bytes of the capsule that are sent.
    pub fn len(&self) -> usize {
        self.len
    }

    /// Always false; a command holds at least an SQE.
    pub fn is_empty(&self) -> bool {
        false
    }

    /// The completion callback.
    pub fn callback(&self) -> &dyn Callback {
        self.callback.as_ref()
    }

    /// The command identifier currently written in the SQE.
    pub fn command_id(&self) -> Result<u16> {
        let mut cid = [0u8; 2];
        self.capsule.buf().read_at(SQE_COMMAND_ID_OFFSET, &mut cid)?;
        Ok(u16::from_le_bytes(cid))
    }

    pub(crate) fn set_command_id(&self, cid: u16) -> Result<()> {
        self.capsule
            .buf()
            .write_at(SQE_COMMAND_ID_OFFSET, &cid.to_le_bytes())
    }
}

impl fmt::Debug for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Command")
            .field("capsule", &self.capsule)
            .field("len", &self.len)
            .finish()
    }
}

/// Sink for the response capsule matching one command.
pub struct Response {
    cqe: Mutex<Option<CompletionQueueEntry>>,
    callback: Arc<dyn Callback>,
}

impl Response {
    /// Create an empty response.
    pub fn new(callback: Arc<dyn Callback>) -> Self {
        Self {
            cqe: Mutex::new(None),
            callback,
        }
    }

    /// The completion callback.
    pub fn callback(&self) -> &dyn Callback {
        self.callback.as_ref()
    }

    /// The last completion queue entry delivered, if any.
    pub fn completion(&self) -> Result<Option<CompletionQueueEntry>> {
        Ok(*self
            .cqe
            .lock()
            .map_err(|_| Error::LockPoisoned("response"))?)
    }

    /// Decode a response capsule into this response.
    pub fn update(&self, capsule: &[u8]) -> Result<()> {
        self.set_completion(CompletionQueueEntry::from_slice(capsule)?);
        Ok(())
    }

    /// Store an already decoded entry. A poisoned slot is overwritten.
    pub(crate) fn set_completion(&self, cqe: CompletionQueueEntry) {
        *self.cqe.lock().unwrap_or_else(PoisonError::into_inner) = Some(cqe);
    }
}

impl fmt::Debug for Response {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Response")
            .field("cqe", &self.cqe.lock().ok().and_then(|g| *g))
            .finish()
    }
}
