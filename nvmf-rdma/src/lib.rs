//! Client-side NVMe over Fabrics queue pairs on an RDMA transport.
//!
//! This crate connects NVMe-oF queues, submits command capsules, and matches
//! their completions back to the caller by command identifier, over any
//! transport implementing [`fabric::Connection`].
//!
//! # Quick Start
//!
//! ```
//! use std::sync::Arc;
//!
//! use nvmf_rdma::complete::{block_on, callback_completion};
//! use nvmf_rdma::nvme::Status;
//! use nvmf_rdma::nvmf::loopback::LoopbackFabric;
//! use nvmf_rdma::nvmf::{Command, ControllerInfo, QueuePair, QueuePairOpts, Response, TransportId};
//!
//! # fn main() -> nvmf_rdma::Result<()> {
//! let fabric = LoopbackFabric::new();
//! let trid = TransportId::rdma("10.0.0.1", "4420", "nqn.2024-01.io.spdk:cnode1")?;
//! let ctrl = ControllerInfo::new("nqn.2014-08.org.nvmexpress:uuid:host");
//! let qpair = QueuePair::connect(&fabric, &trid, &QueuePairOpts::io(1), &ctrl.with_controller_id(1))?;
//!
//! let (command_cb, command_done) = callback_completion();
//! let (response_cb, response_done) = callback_completion();
//! let command = Arc::new(Command::new(qpair.allocate_command_capsule()?, 64, command_cb)?);
//! let response = Arc::new(Response::new(response_cb));
//! let cid = qpair.submit(command, response.clone())?;
//!
//! // The loopback target leaves answering to the caller.
//! qpair.connection().complete_send(cid)?;
//! qpair.connection().respond(cid, Status::SUCCESS)?;
//!
//! let mut poller = qpair.poller()?;
//! block_on(async { command_done.await?; response_done.await }, || qpair.poll(&mut poller))??;
//! assert!(response.completion()?.is_some());
//! # Ok(())
//! # }
//! ```
//!
//! # Modules
//!
//! - [`nvmf`] - Queue pairs, connect handshake, capsules, loopback fabric
//! - [`nvme`] - NVMe field codecs (LBA format, power-of-two sizes, CQE)
//! - [`fabric`] - Transport adapter traits
//! - [`dma`] - Registrable buffers
//! - [`complete`] - Callback-to-future utilities
//! - [`poller`] - Queue pair polling for async executors
//! - [`error`] - Error types

pub mod complete;
pub mod dma;
pub mod error;
pub mod fabric;
pub mod nvme;
pub mod nvmf;
pub mod poller;

// Re-exports
pub use complete::{
    CallbackCompletion, CompletionReceiver, CompletionSender, block_on, callback_completion,
    completion,
};
pub use dma::{DmaBuf, MemoryKey, RegisteredBuf};
pub use error::{Error, Result};
pub use fabric::{CompletionError, Connection, Direction, Fabric, WorkCompletion};
pub use nvme::{LbaFormat, Pow2Size, RelativePerformance};
pub use nvmf::{Callback, Command, QueuePair, QueuePairOpts, Response, TransportId};
pub use poller::{run_poller, run_poller_limited};
