//! Pool of registered command capsule buffers.

use crossbeam_queue::ArrayQueue;

use crate::dma::{DmaBuf, RegisteredBuf};
use crate::error::Result;

/// Lock-free pool of registered buffers, all `buf_size` bytes.
///
/// Checkout pops a recycled buffer or registers a fresh one. Returned
/// buffers are zeroed; when the pool is full the buffer is handed back to
/// the caller for deregistration.
pub(crate) struct CapsulePool {
    buf_size: usize,
    queue: ArrayQueue<RegisteredBuf>,
}

impl CapsulePool {
    pub(crate) fn new(capacity: usize, buf_size: usize) -> Self {
        Self {
            buf_size,
            queue: ArrayQueue::new(capacity.max(1)),
        }
    }

    /// The size of each buffer in the pool.
    pub(crate) fn buf_size(&self) -> usize {
        self.buf_size
    }

    pub(crate) fn checkout(
        &self,
        register: impl FnOnce(DmaBuf) -> Result<RegisteredBuf>,
    ) -> Result<RegisteredBuf> {
        match self.queue.pop() {
            Some(buf) => Ok(buf),
            None => register(DmaBuf::alloc(self.buf_size)?),
        }
    }

    /// Recycle `buf`. Returns it if it cannot be pooled.
    pub(crate) fn give_back(&self, buf: RegisteredBuf) -> Option<RegisteredBuf> {
        if buf.len() != self.buf_size || buf.buf().clear().is_err() {
            return Some(buf);
        }
        self.queue.push(buf).err()
    }

    /// Empty the pool, returning every buffer for deregistration.
    pub(crate) fn drain(&self) -> Vec<RegisteredBuf> {
        std::iter::from_fn(|| self.queue.pop()).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dma::MemoryKey;

    fn register(buf: DmaBuf) -> Result<RegisteredBuf> {
        let key = MemoryKey {
            addr: buf.addr()?,
            length: buf.len() as u32,
            lkey: 1,
            rkey: 1,
        };
        Ok(RegisteredBuf::new(buf, key))
    }

    #[test]
    fn test_recycles() {
        let pool = CapsulePool::new(2, 64);
        let buf = pool.checkout(register).unwrap();
        assert_eq!(buf.len(), pool.buf_size());
        buf.buf().write_at(0, &[0xff]).unwrap();
        let dma = buf.buf().clone();

        assert!(pool.give_back(buf).is_none());
        let again = pool
            .checkout(|_| panic!("should reuse the pooled buffer"))
            .unwrap();
        assert!(again.buf().same_allocation(&dma));
        assert_eq!(again.buf().to_vec().unwrap()[0], 0);
    }

    #[test]
    fn test_full_or_foreign_handed_back() {
        let pool = CapsulePool::new(1, 64);
        let a = pool.checkout(register).unwrap();
        let b = pool.checkout(register).unwrap();
        assert!(pool.give_back(a).is_none());
        assert!(pool.give_back(b).is_some());

        let foreign = register(DmaBuf::alloc(32).unwrap()).unwrap();
        assert!(pool.give_back(foreign).is_some());
        assert_eq!(pool.drain().len(), 1);
        assert!(pool.drain().is_empty());
    }
}
