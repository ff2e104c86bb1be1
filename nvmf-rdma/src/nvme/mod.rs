//! NVMe on-wire structures.
//!
//! Fixed-layout codecs for the NVMe fields the queue pair reads and writes:
//!
//! ```text
//! ┌──────────────┐   ┌──────────────┐   ┌──────────────────────┐
//! │  Pow2Size    │◄──│  LbaFormat   │   │ CompletionQueueEntry │
//! │ (exponent)   │   │ (4 bytes)    │   │ (16 bytes) + Status  │
//! └──────────────┘   └──────────────┘   └──────────────────────┘
//! ```
//!
//! Decoding never mutates its input and rejects values outside a field's
//! domain with [`Error::Encoding`](crate::Error::Encoding).
//!
//! # Example
//!
//! ```
//! use nvmf_rdma::nvme::{LbaFormat, RelativePerformance};
//!
//! let lbaf = LbaFormat::decode(&[0x00, 0x00, 0x09, 0x01])?;
//! assert_eq!(lbaf.data_size().to_u32(), 512);
//! assert_eq!(lbaf.relative_performance(), RelativePerformance::Better);
//! # Ok::<(), nvmf_rdma::Error>(())
//! ```

mod cqe;
mod lba_format;
mod pow2;

pub use cqe::{CQE_SIZE, CompletionQueueEntry, Status};
pub use lba_format::{LBA_FORMAT_SIZE, LbaFormat, RelativePerformance};
pub use pow2::Pow2Size;
