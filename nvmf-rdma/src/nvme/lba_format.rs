//! LBA format descriptor (Identify Namespace, LBAF0..LBAF63).
//!
//! ```text
//! [0..2] MS:   metadata size, u16 LE
//! [2]    LBADS: data size exponent (2^n bytes)
//! [3]    bits 0..1 RP: relative performance
//! ```

use crate::error::{Error, Result};

use super::pow2::Pow2Size;

/// Size of one LBA format descriptor in bytes.
pub const LBA_FORMAT_SIZE: usize = 4;

const METADATA_SIZE_OFFSET: usize = 0;
const DATA_SIZE_OFFSET: usize = 2;
const RELATIVE_PERFORMANCE_OFFSET: usize = 3;
const RELATIVE_PERFORMANCE_MASK: u8 = 0b11;

/// Relative performance of an LBA format compared to the others a
/// namespace supports.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum RelativePerformance {
    /// Best performance
    Best = 0,
    /// Better performance
    Better = 1,
    /// Good performance
    Good = 2,
    /// Degraded performance
    Degraded = 3,
}

impl RelativePerformance {
    /// Decode a raw field value.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Encoding`] for values outside `0..=3`.
    pub fn from_bits(bits: u8) -> Result<Self> {
        match bits {
            0 => Ok(RelativePerformance::Best),
            1 => Ok(RelativePerformance::Better),
            2 => Ok(RelativePerformance::Good),
            3 => Ok(RelativePerformance::Degraded),
            _ => Err(Error::Encoding(format!(
                "relative performance value {} out of range",
                bits
            ))),
        }
    }

    /// The raw field value.
    #[inline]
    pub fn bits(self) -> u8 {
        self as u8
    }
}

impl TryFrom<u8> for RelativePerformance {
    type Error = Error;

    fn try_from(bits: u8) -> Result<Self> {
        Self::from_bits(bits)
    }
}

/// Decoded LBA format descriptor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LbaFormat {
    metadata_size: u16,
    data_size: Pow2Size,
    relative_performance: RelativePerformance,
}

impl LbaFormat {
    /// Build a descriptor from its fields.
    pub fn new(
        metadata_size: u16,
        data_size: Pow2Size,
        relative_performance: RelativePerformance,
    ) -> Self {
        Self {
            metadata_size,
            data_size,
            relative_performance,
        }
    }

    /// Decode a descriptor. Does not modify `buf`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Encoding`] if the data size exponent does not fit a `u32`.
    pub fn decode(buf: &[u8; LBA_FORMAT_SIZE]) -> Result<Self> {
        let metadata_size = u16::from_le_bytes([
            buf[METADATA_SIZE_OFFSET],
            buf[METADATA_SIZE_OFFSET + 1],
        ]);
        let data_size = Pow2Size::decode(buf[DATA_SIZE_OFFSET])?;
        // The mask keeps the value inside the enum's domain.
        let relative_performance = RelativePerformance::from_bits(
            buf[RELATIVE_PERFORMANCE_OFFSET] & RELATIVE_PERFORMANCE_MASK,
        )?;

        Ok(Self {
            metadata_size,
            data_size,
            relative_performance,
        })
    }

    /// Decode the descriptor at the start of `buf`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidArgument`] if `buf` is shorter than
    /// [`LBA_FORMAT_SIZE`], otherwise as [`decode`](Self::decode).
    pub fn from_slice(buf: &[u8]) -> Result<Self> {
        let raw: &[u8; LBA_FORMAT_SIZE] = buf
            .get(..LBA_FORMAT_SIZE)
            .and_then(|b| b.try_into().ok())
            .ok_or_else(|| {
                Error::InvalidArgument(format!(
                    "LBA format needs {} bytes, got {}",
                    LBA_FORMAT_SIZE,
                    buf.len()
                ))
            })?;
        Self::decode(raw)
    }

    /// Encode to the on-wire layout. Reserved bits are zero.
    pub fn encode(&self) -> [u8; LBA_FORMAT_SIZE] {
        let mut buf = [0u8; LBA_FORMAT_SIZE];
        buf[METADATA_SIZE_OFFSET..METADATA_SIZE_OFFSET + 2]
            .copy_from_slice(&self.metadata_size.to_le_bytes());
        buf[DATA_SIZE_OFFSET] = self.data_size.encode();
        buf[RELATIVE_PERFORMANCE_OFFSET] = self.relative_performance.bits();
        buf
    }

    /// Metadata bytes per LBA.
    pub fn metadata_size(&self) -> u16 {
        self.metadata_size
    }

    /// LBA data size.
    pub fn data_size(&self) -> Pow2Size {
        self.data_size
    }

    /// Relative performance of this format.
    pub fn relative_performance(&self) -> RelativePerformance {
        self.relative_performance
    }
}
