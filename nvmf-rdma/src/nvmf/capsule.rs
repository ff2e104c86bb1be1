//! Command capsule layout and sizing.
//!
//! A command capsule is a 64-byte submission queue entry, optionally
//! followed by additional SGL descriptors and in-capsule data:
//!
//! ```text
//! ┌───────────┬──────────────────────┬─────────┬──────────────────┐
//! │ SQE (64B) │ additional SGLs × 16 │ padding │ in-capsule data  │
//! └───────────┴──────────────────────┴─────────┴──────────────────┘
//!                                     ▲ ICDOFF from the end of the SGLs
//! ```

use crate::dma::RegisteredBuf;
use crate::error::{Error, Result};

/// Size of a submission queue entry in bytes.
pub const SQE_SIZE: usize = 64;

/// Size of one SGL descriptor in bytes.
pub const SGL_DESCRIPTOR_SIZE: usize = 16;

/// Offset of the command identifier within a submission queue entry.
pub const SQE_COMMAND_ID_OFFSET: usize = 2;

/// Offset of SGL1 within a submission queue entry.
pub const SQE_SGL1_OFFSET: usize = 24;

/// Largest length a keyed SGL descriptor can describe (24 bits).
pub const KEYED_SGL_MAX_LENGTH: u32 = (1 << 24) - 1;

/// SGL identifier: keyed data block descriptor, address subtype.
const KEYED_DATA_BLOCK_ID: u8 = 0x40;

/// Total size of a command capsule.
///
/// With no in-capsule data the offset is irrelevant and the capsule holds
/// just the SQE and its additional SGL descriptors.
///
/// ```
/// use nvmf_rdma::nvmf::capsule::{compute_command_capsule_size, SQE_SIZE};
///
/// assert_eq!(compute_command_capsule_size(0, 0, 0), SQE_SIZE);
/// assert_eq!(compute_command_capsule_size(2, 0, 0), SQE_SIZE + 32);
/// assert_eq!(compute_command_capsule_size(0, 16, 4096), SQE_SIZE + 16 + 4096);
/// ```
pub fn compute_command_capsule_size(
    additional_sgls: usize,
    in_capsule_data_offset: usize,
    in_capsule_data_size: usize,
) -> usize {
    let mut size = SQE_SIZE.saturating_add(additional_sgls.saturating_mul(SGL_DESCRIPTOR_SIZE));
    if in_capsule_data_size > 0 {
        size = size
            .saturating_add(in_capsule_data_offset)
            .saturating_add(in_capsule_data_size);
    }
    size
}

/// Keyed SGL data block descriptor, pointing the target at host memory it
/// reads or writes with RDMA.
///
/// ```text
/// [0..8]   address, u64 LE
/// [8..11]  length, 24-bit LE
/// [11..15] key, u32 LE
/// [15]     SGL identifier (0x40)
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KeyedSglDescriptor {
    /// Remote-accessible address
    pub address: u64,
    /// Length in bytes (at most [`KEYED_SGL_MAX_LENGTH`])
    pub length: u32,
    /// Remote key
    pub key: u32,
}

impl KeyedSglDescriptor {
    /// Describe a registered buffer in full.
    pub fn for_buffer(buf: &RegisteredBuf) -> Result<Self> {
        let key = buf.key();
        if key.length > KEYED_SGL_MAX_LENGTH {
            return Err(Error::InvalidArgument(format!(
                "buffer of {} bytes exceeds keyed SGL limit",
                key.length
            )));
        }
        Ok(Self {
            address: key.addr,
            length: key.length,
            key: key.rkey,
        })
    }

    /// Encode to the on-wire layout.
    pub fn encode(&self) -> [u8; SGL_DESCRIPTOR_SIZE] {
        let mut buf = [0u8; SGL_DESCRIPTOR_SIZE];
        buf[0..8].copy_from_slice(&self.address.to_le_bytes());
        buf[8..11].copy_from_slice(&self.length.to_le_bytes()[..3]);
        buf[11..15].copy_from_slice(&self.key.to_le_bytes());
        buf[15] = KEYED_DATA_BLOCK_ID;
        buf
    }

    /// Decode from the on-wire layout.
    pub fn decode(buf: &[u8; SGL_DESCRIPTOR_SIZE]) -> Result<Self> {
        if buf[15] != KEYED_DATA_BLOCK_ID {
            return Err(Error::Encoding(format!(
                "SGL identifier {:#x} is not a keyed data block",
                buf[15]
            )));
        }
        let mut address = [0u8; 8];
        address.copy_from_slice(&buf[0..8]);
        Ok(Self {
            address: u64::from_le_bytes(address),
            length: u32::from_le_bytes([buf[8], buf[9], buf[10], 0]),
            key: u32::from_le_bytes([buf[11], buf[12], buf[13], buf[14]]),
        })
    }
}
