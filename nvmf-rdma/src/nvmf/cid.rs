//! Command identifier allocation.
//!
//! ```text
//!   release(cid) ──► [ free FIFO ] ──► allocate()
//!                         ▲   │
//!                         └───┘ command slot still populated:
//!                               requeue at the tail, try the next
//! ```
//!
//! A response can complete before the send completion of the same command
//! has been polled. Its CID is then back in the free FIFO while the command
//! slot is still populated, so the allocator skips it until the send side
//! retires. At most `free.len()` candidates are tried per call.

use std::collections::VecDeque;

use tracing::{debug, warn};

use crate::error::{Error, Result};

/// FIFO of free command identifiers in `0..depth`.
#[derive(Debug, Clone)]
pub struct CidAllocator {
    free: VecDeque<u16>,
    is_free: Vec<bool>,
}

impl CidAllocator {
    /// Create an allocator with every CID in `0..depth` free.
    pub fn new(depth: u16) -> Self {
        Self {
            free: (0..depth).collect(),
            is_free: vec![true; usize::from(depth)],
        }
    }

    /// Number of CIDs this allocator manages.
    pub fn depth(&self) -> usize {
        self.is_free.len()
    }

    /// Number of CIDs currently free.
    pub fn available(&self) -> usize {
        self.free.len()
    }

    /// Whether `cid` is currently free.
    pub fn is_free(&self, cid: u16) -> bool {
        self.is_free.get(usize::from(cid)).copied().unwrap_or(false)
    }

    /// Take a free CID whose command slot is clear.
    ///
    /// `command_pending` reports whether a CID's command slot is still
    /// populated; such CIDs are moved to the tail and skipped.
    ///
    /// # Errors
    ///
    /// Returns [`Error::QueueFull`] if no free CID has a clear command slot.
    pub fn allocate(&mut self, command_pending: impl Fn(u16) -> bool) -> Result<u16> {
        for _ in 0..self.free.len() {
            let Some(cid) = self.free.pop_front() else {
                break;
            };
            if !command_pending(cid) {
                self.is_free[usize::from(cid)] = false;
                return Ok(cid);
            }
            debug!(cid, "command slot still populated, skipping CID");
            self.free.push_back(cid);
        }
        Err(Error::QueueFull)
    }

    /// Return `cid` to the tail of the free FIFO.
    ///
    /// Returns `false` (and changes nothing) if `cid` is out of range or
    /// already free.
    pub fn release(&mut self, cid: u16) -> bool {
        match self.is_free.get_mut(usize::from(cid)) {
            Some(free) if !*free => {
                *free = true;
                self.free.push_back(cid);
                true
            }
            Some(_) => {
                warn!(cid, "CID released twice");
                false
            }
            None => {
                warn!(cid, depth = self.depth(), "CID out of range");
                false
            }
        }
    }

    /// Mark every CID free again, in ascending order.
    pub fn reset(&mut self) {
        self.free = (0..self.depth() as u16).collect();
        self.is_free.fill(true);
    }
}
