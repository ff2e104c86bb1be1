//! Power-of-two size fields.
//!
//! Several identify structures store sizes as an exponent byte
//! (e.g. LBADS: a value of 9 means 512 bytes).

use std::fmt;

use crate::error::{Error, Result};

/// A size of `2^exponent` bytes, decoded into a `u32`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Pow2Size(u8);

impl Pow2Size {
    /// Largest exponent whose size still fits in a `u32`.
    pub const MAX_EXPONENT: u8 = (u32::BITS - 1) as u8;

    /// Decode an on-wire exponent byte.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Encoding`] if `2^raw` does not fit in a `u32`.
    pub fn decode(raw: u8) -> Result<Self> {
        if raw > Self::MAX_EXPONENT {
            return Err(Error::Encoding(format!(
                "power-of-two exponent {} exceeds {}",
                raw,
                Self::MAX_EXPONENT
            )));
        }
        Ok(Self(raw))
    }

    /// Build from a byte size.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Encoding`] if `size` is not a power of two.
    pub fn from_size(size: u32) -> Result<Self> {
        if !size.is_power_of_two() {
            return Err(Error::Encoding(format!("{} is not a power of two", size)));
        }
        Ok(Self(size.trailing_zeros() as u8))
    }

    /// The on-wire exponent byte.
    #[inline]
    pub fn encode(self) -> u8 {
        self.0
    }

    /// The size in bytes.
    #[inline]
    pub fn to_u32(self) -> u32 {
        1 << self.0
    }
}

impl TryFrom<u8> for Pow2Size {
    type Error = Error;

    fn try_from(raw: u8) -> Result<Self> {
        Self::decode(raw)
    }
}

impl From<Pow2Size> for u32 {
    fn from(size: Pow2Size) -> u32 {
        size.to_u32()
    }
}

impl fmt::Display for Pow2Size {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_u32())
    }
}
