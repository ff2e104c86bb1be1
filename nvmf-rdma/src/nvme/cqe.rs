//! Completion queue entry.
//!
//! ```text
//! [0..4]   DW0: command specific
//! [4..8]   DW1: reserved / command specific
//! [8..10]  SQHD: submission queue head pointer
//! [10..12] SQID: submission queue identifier
//! [12..14] CID: command identifier
//! [14..16] status field (phase in bit 0)
//! ```

use crate::error::{Error, Result};

/// Size of a completion queue entry in bytes.
pub const CQE_SIZE: usize = 16;

const DW0_OFFSET: usize = 0;
const DW1_OFFSET: usize = 4;
const SQ_HEAD_OFFSET: usize = 8;
const SQ_ID_OFFSET: usize = 10;
const COMMAND_ID_OFFSET: usize = 12;
const STATUS_OFFSET: usize = 14;

/// Status field of a completion (phase tag included).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Status(u16);

impl Status {
    /// Generic command status: successful completion.
    pub const SUCCESS: Status = Status(0);

    /// Build from a status code type and status code.
    pub fn new(sct: u8, sc: u8) -> Self {
        Self((u16::from(sct & 0x7) << 9) | (u16::from(sc) << 1))
    }

    /// Build from the raw 16-bit field.
    pub const fn from_raw(raw: u16) -> Self {
        Self(raw)
    }

    /// The raw 16-bit field.
    pub fn raw(self) -> u16 {
        self.0
    }

    /// Phase tag.
    pub fn phase(self) -> bool {
        self.0 & 0x1 != 0
    }

    /// Status code (bits 1..8).
    pub fn sc(self) -> u8 {
        ((self.0 >> 1) & 0xff) as u8
    }

    /// Status code type (bits 9..11).
    pub fn sct(self) -> u8 {
        ((self.0 >> 9) & 0x7) as u8
    }

    /// More status information available via Get Log Page.
    pub fn more(self) -> bool {
        self.0 & (1 << 14) != 0
    }

    /// Do not retry.
    pub fn dnr(self) -> bool {
        self.0 & (1 << 15) != 0
    }

    /// Whether SCT and SC are both zero.
    pub fn is_success(self) -> bool {
        self.sct() == 0 && self.sc() == 0
    }

    /// `Ok(())` on success, otherwise [`Error::UnsuccessfulCommand`].
    pub fn check(self) -> Result<()> {
        match Error::from_status(self.sct(), self.sc()) {
            None => Ok(()),
            Some(err) => Err(err),
        }
    }
}

/// Decoded completion queue entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct CompletionQueueEntry {
    /// Command specific dword 0
    pub dw0: u32,
    /// Command specific dword 1
    pub dw1: u32,
    /// Submission queue head pointer
    pub sq_head: u16,
    /// Submission queue identifier
    pub sq_id: u16,
    /// Command identifier
    pub command_id: u16,
    /// Status field
    pub status: Status,
}

impl CompletionQueueEntry {
    /// Decode from the on-wire layout.
    pub fn decode(buf: &[u8; CQE_SIZE]) -> Self {
        let u16_at = |off: usize| u16::from_le_bytes([buf[off], buf[off + 1]]);
        let u32_at =
            |off: usize| u32::from_le_bytes([buf[off], buf[off + 1], buf[off + 2], buf[off + 3]]);

        Self {
            dw0: u32_at(DW0_OFFSET),
            dw1: u32_at(DW1_OFFSET),
            sq_head: u16_at(SQ_HEAD_OFFSET),
            sq_id: u16_at(SQ_ID_OFFSET),
            command_id: u16_at(COMMAND_ID_OFFSET),
            status: Status::from_raw(u16_at(STATUS_OFFSET)),
        }
    }

    /// Decode the entry at the start of `buf`.
    pub fn from_slice(buf: &[u8]) -> Result<Self> {
        let raw: &[u8; CQE_SIZE] = buf
            .get(..CQE_SIZE)
            .and_then(|b| b.try_into().ok())
            .ok_or_else(|| {
                Error::Encoding(format!(
                    "completion entry needs {} bytes, got {}",
                    CQE_SIZE,
                    buf.len()
                ))
            })?;
        Ok(Self::decode(raw))
    }

    /// Encode to the on-wire layout.
    pub fn encode(&self) -> [u8; CQE_SIZE] {
        let mut buf = [0u8; CQE_SIZE];
        buf[DW0_OFFSET..DW0_OFFSET + 4].copy_from_slice(&self.dw0.to_le_bytes());
        buf[DW1_OFFSET..DW1_OFFSET + 4].copy_from_slice(&self.dw1.to_le_bytes());
        buf[SQ_HEAD_OFFSET..SQ_HEAD_OFFSET + 2].copy_from_slice(&self.sq_head.to_le_bytes());
        buf[SQ_ID_OFFSET..SQ_ID_OFFSET + 2].copy_from_slice(&self.sq_id.to_le_bytes());
        buf[COMMAND_ID_OFFSET..COMMAND_ID_OFFSET + 2]
            .copy_from_slice(&self.command_id.to_le_bytes());
        buf[STATUS_OFFSET..STATUS_OFFSET + 2].copy_from_slice(&self.status.raw().to_le_bytes());
        buf
    }
}
