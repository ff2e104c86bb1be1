//! Fabrics connect: the command, its data block, and the RDMA CM private
//! data exchanged before any capsule traffic.

use std::fmt;

use crate::error::{Error, Result};
use crate::nvme::{CompletionQueueEntry, Status};

use super::capsule::{
    KeyedSglDescriptor, SGL_DESCRIPTOR_SIZE, SQE_COMMAND_ID_OFFSET, SQE_SGL1_OFFSET, SQE_SIZE,
};

/// Opcode shared by all fabrics commands.
pub const FABRICS_OPCODE: u8 = 0x7f;

/// Fabrics command type: connect.
pub const FCTYPE_CONNECT: u8 = 0x01;

/// Controller id requesting dynamic allocation (admin queue connect).
pub const DYNAMIC_CONTROLLER_ID: u16 = 0xffff;

/// Size of the connect data block in bytes.
pub const CONNECT_DATA_SIZE: usize = 1024;

/// Size of the RDMA CM request private data in bytes.
pub const PRIVATE_DATA_SIZE: usize = 32;

/// Longest NQN the connect data can carry, excluding the terminator.
pub const MAX_NQN_LEN: usize = 223;

const SGL_FLAGS: u8 = 0x40;
const FCTYPE_OFFSET: usize = 4;
const RECFMT_OFFSET: usize = 40;
const QID_OFFSET: usize = 42;
const SQSIZE_OFFSET: usize = 44;
const CATTR_OFFSET: usize = 46;
const KATO_OFFSET: usize = 48;

const HOSTID_OFFSET: usize = 0;
const CNTLID_OFFSET: usize = 16;
const SUBNQN_OFFSET: usize = 256;
const HOSTNQN_OFFSET: usize = 512;
const NQN_FIELD_SIZE: usize = 256;

/// Queue identifier. Queue 0 is the admin queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct QueueId(u16);

impl QueueId {
    /// The admin queue.
    pub const ADMIN: QueueId = QueueId(0);

    /// Wrap a raw queue id.
    pub const fn new(id: u16) -> Self {
        Self(id)
    }

    /// The raw queue id.
    pub fn get(self) -> u16 {
        self.0
    }

    /// Whether this is the admin queue.
    pub fn is_admin(self) -> bool {
        self.0 == 0
    }
}

impl fmt::Display for QueueId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// RDMA CM request private data.
///
/// ```text
/// [0..2]  RECFMT, 0
/// [2..4]  QID
/// [4..6]  HRQSIZE: host receive queue size
/// [6..8]  HSQSIZE: host send queue size
/// [8..32] reserved, zero
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RdmaCmPrivateData {
    /// Queue the connection is for
    pub queue_id: QueueId,
    /// Host receive queue depth
    pub recv_queue_size: u16,
    /// Host send queue depth
    pub send_queue_size: u16,
}

impl RdmaCmPrivateData {
    /// Private data for a queue of `submission_queue_size` entries.
    ///
    /// The send queue is one shorter than the receive queue.
    pub fn for_queue(queue_id: QueueId, submission_queue_size: u16) -> Self {
        Self {
            queue_id,
            recv_queue_size: submission_queue_size,
            send_queue_size: submission_queue_size.saturating_sub(1),
        }
    }

    /// Encode to the on-wire layout.
    pub fn encode(&self) -> [u8; PRIVATE_DATA_SIZE] {
        let mut buf = [0u8; PRIVATE_DATA_SIZE];
        buf[2..4].copy_from_slice(&self.queue_id.get().to_le_bytes());
        buf[4..6].copy_from_slice(&self.recv_queue_size.to_le_bytes());
        buf[6..8].copy_from_slice(&self.send_queue_size.to_le_bytes());
        buf
    }

    /// Decode from the on-wire layout.
    pub fn decode(buf: &[u8]) -> Result<Self> {
        if buf.len() < PRIVATE_DATA_SIZE {
            return Err(Error::Encoding(format!(
                "private data needs {} bytes, got {}",
                PRIVATE_DATA_SIZE,
                buf.len()
            )));
        }
        let u16_at = |off: usize| u16::from_le_bytes([buf[off], buf[off + 1]]);
        Ok(Self {
            queue_id: QueueId::new(u16_at(2)),
            recv_queue_size: u16_at(4),
            send_queue_size: u16_at(6),
        })
    }
}

/// Connect data block, referenced by SGL1 of the connect command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectData {
    /// Host identifier
    pub host_id: [u8; 16],
    /// Controller id, or [`DYNAMIC_CONTROLLER_ID`]
    pub controller_id: u16,
    /// Subsystem NQN
    pub subsystem_nqn: String,
    /// Host NQN
    pub host_nqn: String,
}

impl ConnectData {
    /// Encode to the on-wire layout.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidArgument`] if an NQN exceeds [`MAX_NQN_LEN`].
    pub fn encode(&self) -> Result<[u8; CONNECT_DATA_SIZE]> {
        let mut buf = [0u8; CONNECT_DATA_SIZE];
        buf[HOSTID_OFFSET..HOSTID_OFFSET + 16].copy_from_slice(&self.host_id);
        buf[CNTLID_OFFSET..CNTLID_OFFSET + 2].copy_from_slice(&self.controller_id.to_le_bytes());
        put_nqn(
            &mut buf[SUBNQN_OFFSET..SUBNQN_OFFSET + NQN_FIELD_SIZE],
            &self.subsystem_nqn,
            "subnqn",
        )?;
        put_nqn(
            &mut buf[HOSTNQN_OFFSET..HOSTNQN_OFFSET + NQN_FIELD_SIZE],
            &self.host_nqn,
            "hostnqn",
        )?;
        Ok(buf)
    }

    /// Decode from the on-wire layout.
    pub fn decode(buf: &[u8; CONNECT_DATA_SIZE]) -> Result<Self> {
        let mut host_id = [0u8; 16];
        host_id.copy_from_slice(&buf[HOSTID_OFFSET..HOSTID_OFFSET + 16]);
        Ok(Self {
            host_id,
            controller_id: u16::from_le_bytes([buf[CNTLID_OFFSET], buf[CNTLID_OFFSET + 1]]),
            subsystem_nqn: get_nqn(&buf[SUBNQN_OFFSET..SUBNQN_OFFSET + NQN_FIELD_SIZE])?,
            host_nqn: get_nqn(&buf[HOSTNQN_OFFSET..HOSTNQN_OFFSET + NQN_FIELD_SIZE])?,
        })
    }
}

fn put_nqn(field: &mut [u8], nqn: &str, name: &str) -> Result<()> {
    let bytes = nqn.as_bytes();
    if bytes.len() > MAX_NQN_LEN {
        return Err(Error::InvalidArgument(format!(
            "{} too long: {} (max {})",
            name,
            bytes.len(),
            MAX_NQN_LEN
        )));
    }
    field[..bytes.len()].copy_from_slice(bytes);
    Ok(())
}

fn get_nqn(field: &[u8]) -> Result<String> {
    let len = field.iter().position(|&c| c == 0).unwrap_or(field.len());
    String::from_utf8(field[..len].to_vec())
        .map_err(|_| Error::Encoding("NQN is not valid UTF-8".to_string()))
}

/// Fabrics connect command (submission queue entry).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConnectCommand {
    /// Queue being connected
    pub queue_id: QueueId,
    /// Submission queue size (1's based; encoded 0's based)
    pub submission_queue_size: u16,
    /// Connect attributes
    pub attributes: u8,
    /// Keep alive timeout in milliseconds (admin queue only)
    pub keep_alive_timeout_ms: u32,
    /// Where the connect data lives
    pub data: KeyedSglDescriptor,
}

impl ConnectCommand {
    /// Encode with the given command identifier.
    pub fn encode(&self, command_id: u16) -> [u8; SQE_SIZE] {
        let mut sqe = [0u8; SQE_SIZE];
        sqe[0] = FABRICS_OPCODE;
        sqe[1] = SGL_FLAGS;
        sqe[SQE_COMMAND_ID_OFFSET..SQE_COMMAND_ID_OFFSET + 2]
            .copy_from_slice(&command_id.to_le_bytes());
        sqe[FCTYPE_OFFSET] = FCTYPE_CONNECT;
        sqe[SQE_SGL1_OFFSET..SQE_SGL1_OFFSET + SGL_DESCRIPTOR_SIZE]
            .copy_from_slice(&self.data.encode());
        sqe[RECFMT_OFFSET..RECFMT_OFFSET + 2].copy_from_slice(&0u16.to_le_bytes());
        sqe[QID_OFFSET..QID_OFFSET + 2].copy_from_slice(&self.queue_id.get().to_le_bytes());
        sqe[SQSIZE_OFFSET..SQSIZE_OFFSET + 2]
            .copy_from_slice(&self.submission_queue_size.saturating_sub(1).to_le_bytes());
        sqe[CATTR_OFFSET] = self.attributes;
        sqe[KATO_OFFSET..KATO_OFFSET + 4]
            .copy_from_slice(&self.keep_alive_timeout_ms.to_le_bytes());
        sqe
    }

    /// Decode a submission queue entry, returning the command and its CID.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Encoding`] if the entry is not a fabrics connect.
    pub fn decode(sqe: &[u8; SQE_SIZE]) -> Result<(Self, u16)> {
        if sqe[0] != FABRICS_OPCODE || sqe[FCTYPE_OFFSET] != FCTYPE_CONNECT {
            return Err(Error::Encoding(format!(
                "not a fabrics connect (opcode {:#x}, fctype {:#x})",
                sqe[0], sqe[FCTYPE_OFFSET]
            )));
        }
        let u16_at = |off: usize| u16::from_le_bytes([sqe[off], sqe[off + 1]]);
        let mut sgl = [0u8; SGL_DESCRIPTOR_SIZE];
        sgl.copy_from_slice(&sqe[SQE_SGL1_OFFSET..SQE_SGL1_OFFSET + SGL_DESCRIPTOR_SIZE]);
        let command = Self {
            queue_id: QueueId::new(u16_at(QID_OFFSET)),
            submission_queue_size: u16_at(SQSIZE_OFFSET).saturating_add(1),
            attributes: sqe[CATTR_OFFSET],
            keep_alive_timeout_ms: u32::from_le_bytes([
                sqe[KATO_OFFSET],
                sqe[KATO_OFFSET + 1],
                sqe[KATO_OFFSET + 2],
                sqe[KATO_OFFSET + 3],
            ]),
            data: KeyedSglDescriptor::decode(&sgl)?,
        };
        Ok((command, u16_at(SQE_COMMAND_ID_OFFSET)))
    }
}

/// Connect response, decoded from its completion queue entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConnectResponse {
    /// Controller id assigned by the target
    pub controller_id: u16,
    /// Completion status
    pub status: Status,
}

impl From<&CompletionQueueEntry> for ConnectResponse {
    fn from(cqe: &CompletionQueueEntry) -> Self {
        Self {
            controller_id: (cqe.dw0 & 0xffff) as u16,
            status: cqe.status,
        }
    }
}
