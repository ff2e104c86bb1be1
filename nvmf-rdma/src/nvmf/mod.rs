//! NVMe-oF RDMA host queue pairs.
//!
//! A [`QueuePair`] connects one NVMe-oF queue over a [`Fabric`](crate::fabric::Fabric)
//! connection, runs the fabrics connect handshake, and then correlates
//! submitted commands with their completions by command identifier (CID).
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │  QueuePair                                                  │
//! ├─────────────────────────────────────────────────────────────┤
//! │                                                             │
//! │  submit(Command, Response)          poll(CompletionPoller)  │
//! │     │                                      ▲                │
//! │     ▼                                      │                │
//! │  ┌──────────────┐   ┌──────────────────┐   │                │
//! │  │ CidAllocator │◄─►│ Registry         │◄──┘                │
//! │  │ (free FIFO)  │   │ commands[CID]    │                    │
//! │  └──────────────┘   │ responses[CID]   │                    │
//! │                     └──────────────────┘                    │
//! │     │ post_send(wr_id = CID)               ▲ WorkCompletion │
//! ├─────┼──────────────────────────────────────┼────────────────┤
//! │     ▼           Connection (RDMA)          │                │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! Use [`loopback`] for an in-process fabric that answers connect
//! commands and lets tests drive every other completion.

pub mod capsule;
mod cid;
mod command;
pub mod connect;
pub mod loopback;
mod opts;
mod pool;
mod qpair;
mod registry;
mod transport;

pub use capsule::{KeyedSglDescriptor, compute_command_capsule_size};
pub use cid::CidAllocator;
pub use command::{Callback, Command, Response};
pub use connect::QueueId;
pub use opts::{ControllerInfo, QueuePairOpts, QueueRole};
pub use qpair::{CompletionPoller, QueuePair};
pub use transport::{AddressFamily, TransportId};
