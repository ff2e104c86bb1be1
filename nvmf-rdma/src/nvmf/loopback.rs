//! In-process loopback fabric.
//!
//! Stands in for an RDMA device and a remote NVMe-oF target so queue pairs
//! can be exercised without hardware:
//!
//! ```text
//!  QueuePair ──post_send──► LoopbackConnection ──► sent capsules (inspect)
//!      ▲                        │    ▲
//!      │                        │    └── respond / fail_receive / complete_send
//!      └──poll_completions──────┘          (driven by the test)
//! ```
//!
//! Fabrics connect commands are answered automatically: the connection
//! reads the connect data through the SGL key (as the target's RDMA read
//! would), queues a successful send completion, and delivers a response
//! with the configured status and controller id. Every other capsule is
//! only recorded until the test completes or answers it.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};

use crate::dma::{DmaBuf, MemoryKey, RegisteredBuf};
use crate::error::{Error, Result};
use crate::fabric::{ConnectParams, Connection, Fabric, WorkCompletion};
use crate::nvme::{CQE_SIZE, CompletionQueueEntry, Status};

use super::capsule::SQE_SIZE;
use super::connect::{
    CONNECT_DATA_SIZE, ConnectCommand, ConnectData, FABRICS_OPCODE, QueueId, RdmaCmPrivateData,
};

/// Status returned when the connect data cannot be fetched.
const INVALID_FIELD: Status = Status::from_raw(0x02 << 1);

/// A fabrics connect the loopback target accepted or rejected.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectRecord {
    /// CM private data sent with the connection request
    pub private_data: RdmaCmPrivateData,
    /// The connect command
    pub command: ConnectCommand,
    /// The connect data fetched through the command's SGL
    pub data: ConnectData,
}

/// A capsule posted to the send queue.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SentCapsule {
    /// Correlation value of the send
    pub wr_id: u64,
    /// Bytes sent
    pub bytes: Vec<u8>,
}

impl SentCapsule {
    /// Command identifier from the SQE.
    pub fn command_id(&self) -> u16 {
        u16::from_le_bytes([self.bytes[2], self.bytes[3]])
    }
}

#[derive(Debug)]
struct FabricState {
    reject: Option<String>,
    connect_status: Status,
    controller_id: u16,
    connections: usize,
}

/// Loopback [`Fabric`].
#[derive(Debug, Clone)]
pub struct LoopbackFabric {
    state: Arc<Mutex<FabricState>>,
}

impl Default for LoopbackFabric {
    fn default() -> Self {
        Self::new()
    }
}

impl LoopbackFabric {
    /// A fabric whose target accepts every connect and assigns controller id 1.
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(FabricState {
                reject: None,
                connect_status: Status::SUCCESS,
                controller_id: 1,
                connections: 0,
            })),
        }
    }

    /// Reject the next connection request at the transport level.
    pub fn reject_next(&self, reason: impl Into<String>) -> Result<()> {
        self.lock()?.reject = Some(reason.into());
        Ok(())
    }

    /// Status the target answers connect commands with.
    pub fn set_connect_status(&self, status: Status) -> Result<()> {
        self.lock()?.connect_status = status;
        Ok(())
    }

    /// Controller id the target assigns on admin connect.
    pub fn set_controller_id(&self, id: u16) -> Result<()> {
        self.lock()?.controller_id = id;
        Ok(())
    }

    /// Connections opened so far.
    pub fn connections(&self) -> Result<usize> {
        Ok(self.lock()?.connections)
    }

    fn lock(&self) -> Result<MutexGuard<'_, FabricState>> {
        self.state
            .lock()
            .map_err(|_| Error::LockPoisoned("loopback fabric"))
    }
}

impl Fabric for LoopbackFabric {
    type Connection = LoopbackConnection;

    fn connect(&self, params: &ConnectParams<'_>) -> Result<LoopbackConnection> {
        let mut state = self.lock()?;
        if let Some(reason) = state.reject.take() {
            return Err(Error::connect(reason));
        }
        let private_data = RdmaCmPrivateData::decode(params.private_data)
            .map_err(|e| Error::connect_with_source("malformed private data", e))?;
        state.connections += 1;

        Ok(LoopbackConnection {
            shared: Arc::new(Mutex::new(ConnState {
                private_data,
                connect_status: state.connect_status,
                controller_id: state.controller_id,
                recv_queue_depth: params.recv_queue_depth as usize,
                next_key: 1,
                regions: HashMap::new(),
                receives: VecDeque::new(),
                completions: VecDeque::new(),
                sent: Vec::new(),
                connects: Vec::new(),
                auto_complete_sends: false,
                closed: false,
            })),
        })
    }
}

#[derive(Debug)]
struct ConnState {
    private_data: RdmaCmPrivateData,
    connect_status: Status,
    controller_id: u16,
    recv_queue_depth: usize,
    next_key: u32,
    /// rkey -> registered buffer
    regions: HashMap<u32, DmaBuf>,
    receives: VecDeque<(u64, DmaBuf)>,
    completions: VecDeque<WorkCompletion>,
    sent: Vec<SentCapsule>,
    connects: Vec<ConnectRecord>,
    auto_complete_sends: bool,
    closed: bool,
}

impl ConnState {
    fn check_open(&self) -> Result<()> {
        if self.closed {
            return Err(Error::Transport("connection closed".to_string()));
        }
        Ok(())
    }

    fn check_registered(&self, buf: &RegisteredBuf) -> Result<()> {
        match self.regions.get(&buf.key().rkey) {
            Some(region) if region.same_allocation(buf.buf()) => Ok(()),
            _ => Err(Error::Transport("buffer not registered".to_string())),
        }
    }

    /// Write `cqe` into the oldest posted receive and queue its completion.
    fn deliver(&mut self, cqe: &CompletionQueueEntry) -> Result<()> {
        self.deliver_len(cqe, CQE_SIZE as u32)
    }

    /// Like [`deliver`](Self::deliver), reporting `byte_len` bytes received.
    fn deliver_len(&mut self, cqe: &CompletionQueueEntry, byte_len: u32) -> Result<()> {
        let (wr_id, buf) = self
            .receives
            .pop_front()
            .ok_or_else(|| Error::Transport("no receive posted".to_string()))?;
        buf.write_at(0, &cqe.encode())?;
        self.completions
            .push_back(WorkCompletion::recv(wr_id, byte_len));
        Ok(())
    }

    fn answer_connect(&mut self, wr_id: u64, sqe: &[u8; SQE_SIZE]) -> Result<()> {
        let (command, cid) = ConnectCommand::decode(sqe)?;
        let data = self
            .regions
            .get(&command.data.key)
            .filter(|region| {
                command.data.length as usize == CONNECT_DATA_SIZE
                    && region.len() >= CONNECT_DATA_SIZE
            })
            .map(|region| {
                let mut raw = [0u8; CONNECT_DATA_SIZE];
                region.read_at(0, &mut raw)?;
                ConnectData::decode(&raw)
            })
            .transpose()?;

        self.completions.push_back(WorkCompletion::send(wr_id));

        let (status, dw0) = match data {
            Some(data) => {
                let controller_id = if command.queue_id.is_admin() {
                    self.controller_id
                } else {
                    data.controller_id
                };
                self.connects.push(ConnectRecord {
                    private_data: self.private_data,
                    command,
                    data,
                });
                (self.connect_status, u32::from(controller_id))
            }
            None => (INVALID_FIELD, 0),
        };

        self.deliver(&CompletionQueueEntry {
            dw0,
            sq_id: command.queue_id.get(),
            command_id: cid,
            status,
            ..Default::default()
        })
    }
}

/// Loopback [`Connection`] with controls for driving completions.
///
/// Clones share the same connection.
#[derive(Debug, Clone)]
pub struct LoopbackConnection {
    shared: Arc<Mutex<ConnState>>,
}

/// Completion polling handle of a [`LoopbackConnection`].
#[derive(Debug)]
pub struct LoopbackPoller {
    max_batch: usize,
}

impl LoopbackConnection {
    fn lock(&self) -> Result<MutexGuard<'_, ConnState>> {
        self.shared
            .lock()
            .map_err(|_| Error::LockPoisoned("loopback connection"))
    }

    /// Queue a successful send completion immediately for every non-connect
    /// capsule posted from now on.
    pub fn set_auto_complete_sends(&self, enabled: bool) -> Result<()> {
        self.lock()?.auto_complete_sends = enabled;
        Ok(())
    }

    /// Every capsule posted so far, oldest first.
    pub fn sent(&self) -> Result<Vec<SentCapsule>> {
        Ok(self.lock()?.sent.clone())
    }

    /// Connect commands answered so far.
    pub fn connects(&self) -> Result<Vec<ConnectRecord>> {
        Ok(self.lock()?.connects.clone())
    }

    /// Queue id named in the CM private data.
    pub fn queue_id(&self) -> Result<QueueId> {
        Ok(self.lock()?.private_data.queue_id)
    }

    /// Receive queue depth requested at connect.
    pub fn recv_queue_depth(&self) -> Result<usize> {
        Ok(self.lock()?.recv_queue_depth)
    }

    /// Receives currently posted.
    pub fn posted_receives(&self) -> Result<usize> {
        Ok(self.lock()?.receives.len())
    }

    /// Buffers currently registered.
    pub fn registered(&self) -> Result<usize> {
        Ok(self.lock()?.regions.len())
    }

    /// Whether [`close`](Connection::close) has been called.
    pub fn is_closed(&self) -> Result<bool> {
        Ok(self.lock()?.closed)
    }

    /// Queue a successful send completion for `cid`.
    pub fn complete_send(&self, cid: u16) -> Result<()> {
        self.inject(WorkCompletion::send(u64::from(cid)))
    }

    /// Queue a failed send completion for `cid`.
    pub fn fail_send(&self, cid: u16, code: u32) -> Result<()> {
        self.inject(WorkCompletion::send(u64::from(cid)).failed(code))
    }

    /// Deliver a response for `cid` into the oldest posted receive.
    pub fn respond(&self, cid: u16, status: Status) -> Result<()> {
        let mut state = self.lock()?;
        let cqe = CompletionQueueEntry {
            sq_id: state.private_data.queue_id.get(),
            command_id: cid,
            status,
            ..Default::default()
        };
        state.deliver(&cqe)
    }

    /// Deliver an arbitrary completion queue entry.
    pub fn respond_with(&self, cqe: &CompletionQueueEntry) -> Result<()> {
        self.lock()?.deliver(cqe)
    }

    /// Deliver `cqe` but report only `byte_len` bytes received.
    pub fn respond_truncated(&self, cqe: &CompletionQueueEntry, byte_len: u32) -> Result<()> {
        self.lock()?.deliver_len(cqe, byte_len)
    }

    /// Consume the oldest posted receive with a failed completion.
    pub fn fail_receive(&self, code: u32) -> Result<()> {
        let mut state = self.lock()?;
        let (wr_id, _) = state
            .receives
            .pop_front()
            .ok_or_else(|| Error::Transport("no receive posted".to_string()))?;
        state
            .completions
            .push_back(WorkCompletion::recv(wr_id, 0).failed(code));
        Ok(())
    }

    /// Queue an arbitrary work completion.
    pub fn inject(&self, wc: WorkCompletion) -> Result<()> {
        self.lock()?.completions.push_back(wc);
        Ok(())
    }
}

impl Connection for LoopbackConnection {
    type Poller = LoopbackPoller;

    fn register_memory(&self, buf: DmaBuf) -> Result<RegisteredBuf> {
        let mut state = self.lock()?;
        state.check_open()?;
        let length = u32::try_from(buf.len())
            .map_err(|_| Error::InvalidArgument("buffer too large to register".to_string()))?;
        let key = state.next_key;
        state.next_key = state.next_key.wrapping_add(1);
        let mk = MemoryKey {
            addr: buf.addr()?,
            length,
            lkey: key,
            rkey: key,
        };
        state.regions.insert(key, buf.clone());
        Ok(RegisteredBuf::new(buf, mk))
    }

    fn deregister_memory(&self, buf: RegisteredBuf) -> Result<()> {
        let mut state = self.lock()?;
        state.check_registered(&buf)?;
        state.regions.remove(&buf.key().rkey);
        Ok(())
    }

    fn post_send(&self, wr_id: u64, buf: &RegisteredBuf, len: usize) -> Result<()> {
        let mut state = self.lock()?;
        state.check_open()?;
        state.check_registered(buf)?;
        let mut bytes = vec![0u8; len];
        buf.buf().read_at(0, &mut bytes)?;

        let connect_sqe: Option<[u8; SQE_SIZE]> = bytes
            .get(..SQE_SIZE)
            .filter(|sqe| sqe[0] == FABRICS_OPCODE)
            .and_then(|sqe| sqe.try_into().ok());
        state.sent.push(SentCapsule { wr_id, bytes });

        match connect_sqe {
            Some(sqe) => state.answer_connect(wr_id, &sqe),
            None => {
                if state.auto_complete_sends {
                    state.completions.push_back(WorkCompletion::send(wr_id));
                }
                Ok(())
            }
        }
    }

    fn post_receive(&self, wr_id: u64, buf: &RegisteredBuf) -> Result<()> {
        let mut state = self.lock()?;
        state.check_open()?;
        state.check_registered(buf)?;
        if state.receives.len() >= state.recv_queue_depth {
            return Err(Error::Transport("receive queue full".to_string()));
        }
        state.receives.push_back((wr_id, buf.buf().clone()));
        Ok(())
    }

    fn create_poller(&self, max_batch: usize) -> Result<LoopbackPoller> {
        Ok(LoopbackPoller { max_batch })
    }

    fn poll_completions(
        &self,
        poller: &mut LoopbackPoller,
        out: &mut Vec<WorkCompletion>,
    ) -> Result<usize> {
        let mut state = self.lock()?;
        let n = poller.max_batch.min(state.completions.len());
        out.extend(state.completions.drain(..n));
        Ok(n)
    }

    fn close(&self) -> Result<()> {
        let mut state = self.lock()?;
        state.closed = true;
        state.receives.clear();
        state.completions.clear();
        Ok(())
    }
}
