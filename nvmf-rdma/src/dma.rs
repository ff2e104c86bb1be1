//! RDMA-registrable buffer allocation.
//!
//! Capsules, receive slots and caller data all travel through memory the
//! RDMA device can reach. A [`DmaBuf`] is the host-side allocation; once a
//! [`Connection`](crate::fabric::Connection) has registered it, it becomes a
//! [`RegisteredBuf`] carrying the memory keys that SGL descriptors and work
//! requests refer to.
//!
//! # Example
//!
//! ```
//! use nvmf_rdma::DmaBuf;
//!
//! let buf = DmaBuf::alloc(64).unwrap();
//! buf.write_at(2, &7u16.to_le_bytes()).unwrap();
//!
//! let mut cid = [0u8; 2];
//! buf.read_at(2, &mut cid).unwrap();
//! assert_eq!(u16::from_le_bytes(cid), 7);
//! ```

use std::sync::{Arc, Mutex, MutexGuard};

use crate::error::{Error, Result};

/// A zeroed, fixed-length memory buffer that can be registered with a fabric.
///
/// Cloning yields another handle to the same bytes: the engine keeps one
/// handle while the transport (standing in for the device) keeps another
/// for the duration of a posted work request.
///
/// # Thread Safety
///
/// `DmaBuf` is `Send + Sync`; access to the bytes is serialized internally.
#[derive(Clone)]
pub struct DmaBuf {
    bytes: Arc<Mutex<Box<[u8]>>>,
    len: usize,
}

impl DmaBuf {
    /// Allocate a zeroed buffer.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidArgument`] if `size` is zero.
    pub fn alloc(size: usize) -> Result<Self> {
        if size == 0 {
            return Err(Error::InvalidArgument("size must be > 0".to_string()));
        }

        Ok(Self {
            bytes: Arc::new(Mutex::new(vec![0u8; size].into_boxed_slice())),
            len: size,
        })
    }

    /// Get the buffer length in bytes.
    #[inline]
    pub fn len(&self) -> usize {
        self.len
    }

    /// Check if the buffer is empty (zero length).
    ///
    /// Note: Zero-length buffers cannot be created via `alloc()`.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Address of the first byte, as placed into SGL descriptors.
    ///
    /// Stable for the lifetime of the allocation.
    pub fn addr(&self) -> Result<u64> {
        Ok(self.lock()?.as_ptr() as u64)
    }

    /// Copy `src` into the buffer starting at `offset`.
    pub fn write_at(&self, offset: usize, src: &[u8]) -> Result<()> {
        let end = self.check_range(offset, src.len())?;
        self.lock()?[offset..end].copy_from_slice(src);
        Ok(())
    }

    /// Fill `dst` from the buffer starting at `offset`.
    pub fn read_at(&self, offset: usize, dst: &mut [u8]) -> Result<()> {
        let end = self.check_range(offset, dst.len())?;
        dst.copy_from_slice(&self.lock()?[offset..end]);
        Ok(())
    }

    /// Zero the whole buffer.
    pub fn clear(&self) -> Result<()> {
        self.lock()?.fill(0);
        Ok(())
    }

    /// Copy the whole buffer out.
    pub fn to_vec(&self) -> Result<Vec<u8>> {
        Ok(self.lock()?.to_vec())
    }

    /// Whether both handles refer to the same allocation.
    pub fn same_allocation(&self, other: &DmaBuf) -> bool {
        Arc::ptr_eq(&self.bytes, &other.bytes)
    }

    fn check_range(&self, offset: usize, len: usize) -> Result<usize> {
        match offset.checked_add(len) {
            Some(end) if end <= self.len => Ok(end),
            _ => Err(Error::InvalidArgument(format!(
                "range {}+{} exceeds buffer of {} bytes",
                offset, len, self.len
            ))),
        }
    }

    fn lock(&self) -> Result<MutexGuard<'_, Box<[u8]>>> {
        self.bytes
            .lock()
            .map_err(|_| Error::LockPoisoned("dma buffer"))
    }
}

impl std::fmt::Debug for DmaBuf {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DmaBuf").field("len", &self.len).finish()
    }
}

/// Keys and address assigned to a buffer when it is registered.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemoryKey {
    /// Start address of the registered region
    pub addr: u64,
    /// Registered length in bytes
    pub length: u32,
    /// Local key, used in work requests
    pub lkey: u32,
    /// Remote key, used in keyed SGL descriptors
    pub rkey: u32,
}

/// A [`DmaBuf`] that has been registered with a connection.
///
/// Obtained from [`Connection::register_memory`](crate::fabric::Connection::register_memory)
/// and handed back to `deregister_memory` when no longer needed.
#[derive(Debug, Clone)]
pub struct RegisteredBuf {
    buf: DmaBuf,
    key: MemoryKey,
}

impl RegisteredBuf {
    /// Pair a buffer with the keys its registration produced.
    ///
    /// Intended for [`Connection`](crate::fabric::Connection) implementations.
    pub fn new(buf: DmaBuf, key: MemoryKey) -> Self {
        Self { buf, key }
    }

    /// The underlying buffer.
    #[inline]
    pub fn buf(&self) -> &DmaBuf {
        &self.buf
    }

    /// The registration keys.
    #[inline]
    pub fn key(&self) -> MemoryKey {
        self.key
    }

    /// Registered length in bytes.
    #[inline]
    pub fn len(&self) -> usize {
        self.buf.len()
    }

    /// Check if the registered buffer is empty.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }
}
