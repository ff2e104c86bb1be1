//! NVMe-oF RDMA queue pair.
//!
//! # Lifecycle
//!
//! ```text
//!  connect() ──► Connecting ──handshake ok──► Ready ──free()──► Closed
//!                    │                                          ▲
//!                    └──────────── handshake failed ────────────┘
//!                                  (connect returns Err)
//! ```
//!
//! # Correlation
//!
//! ```text
//!  submit ─► CID ─► commands[CID], responses[CID] ─► post_send(wr_id = CID)
//!
//!  poll ─► send WC (wr_id = CID)      ─► clear commands[CID]
//!       └► recv WC (wr_id = slot) ─► CQE.CID ─► clear responses[CID]
//!                                             └► repost slot, release CID
//! ```
//!
//! The CID is released only by the response. If a response overtakes its
//! send completion, the allocator skips the CID until the send retires.
//!
//! # Thread Safety
//!
//! `QueuePair` is `Send + Sync` when its connection is. The CID allocator,
//! both slot tables and the receive buffers sit behind one mutex. Callbacks
//! are collected under the lock and invoked after it is released. Each
//! polling thread owns its own [`CompletionPoller`].

use std::sync::{Arc, Mutex, MutexGuard};

use crate::complete::{block_on, callback_completion};
use crate::dma::{DmaBuf, RegisteredBuf};
use crate::error::{Error, Result};
use crate::fabric::{CompletionError, ConnectParams, Connection, Direction, Fabric, WorkCompletion};
use crate::nvme::{CQE_SIZE, CompletionQueueEntry};

use super::capsule::{KeyedSglDescriptor, SQE_SIZE};
use super::cid::CidAllocator;
use super::command::{Command, Response};
use super::connect::{
    CONNECT_DATA_SIZE, ConnectCommand, ConnectData, ConnectResponse, DYNAMIC_CONTROLLER_ID,
    QueueId, RdmaCmPrivateData,
};
use super::opts::{ControllerInfo, QueuePairOpts, QueueRole};
use super::pool::CapsulePool;
use super::registry::Registry;
use super::transport::TransportId;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Connecting,
    Ready,
    Closed,
}

struct Inner {
    state: State,
    cids: CidAllocator,
    registry: Registry,
    receives: Vec<RegisteredBuf>,
}

/// Per-thread completion polling handle.
///
/// Obtain one per polling thread with [`QueuePair::poller`] and pass it to
/// every [`QueuePair::poll`] call made from that thread.
pub struct CompletionPoller<P> {
    handle: P,
    completions: Vec<WorkCompletion>,
}

/// A callback to invoke once the lock is released.
enum Dispatch {
    Command(Arc<Command>, Option<CompletionError>),
    Response(Arc<Response>),
    ResponseFailure(Arc<Response>, CompletionError),
}

impl Dispatch {
    fn fire(self) {
        match self {
            Dispatch::Command(command, None) => command.callback().on_complete(),
            Dispatch::Command(command, Some(reason)) => command.callback().on_failure(reason),
            Dispatch::Response(response) => response.callback().on_complete(),
            Dispatch::ResponseFailure(response, reason) => response.callback().on_failure(reason),
        }
    }
}

/// Client side of one NVMe-oF RDMA queue pair.
///
/// # Example
///
/// ```
/// use nvmf_rdma::nvmf::loopback::LoopbackFabric;
/// use nvmf_rdma::nvmf::{ControllerInfo, QueuePair, QueuePairOpts, TransportId};
///
/// let fabric = LoopbackFabric::new();
/// let trid = TransportId::rdma("10.0.0.1", "4420", "nqn.2024-01.io.spdk:cnode1")?;
/// let ctrl = ControllerInfo::new("nqn.2014-08.org.nvmexpress:uuid:host");
///
/// let admin = QueuePair::connect(&fabric, &trid, &QueuePairOpts::admin(), &ctrl)?;
/// assert!(admin.is_valid());
///
/// admin.free()?;
/// assert!(!admin.is_valid());
/// # Ok::<(), nvmf_rdma::Error>(())
/// ```
pub struct QueuePair<C: Connection> {
    conn: C,
    role: QueueRole,
    submission_queue_size: u16,
    additional_sgls: usize,
    in_capsule_data_size: usize,
    keep_alive_timeout_ms: u32,
    poll_batch_size: usize,
    controller_id: u16,
    capsules: CapsulePool,
    inner: Mutex<Inner>,
}

impl<C: Connection> QueuePair<C> {
    /// Open a connection and run the fabrics connect handshake.
    ///
    /// Blocks until the target has answered the connect command. No queue
    /// pair is returned unless the handshake succeeded.
    ///
    /// # Arguments
    ///
    /// * `fabric` - Transport to open the connection on
    /// * `trid` - Remote endpoint and subsystem
    /// * `opts` - Queue geometry
    /// * `ctrl` - Controller limits, host identity and (for I/O queues) the
    ///   controller id assigned on the admin queue
    ///
    /// # Errors
    ///
    /// - [`Error::InvalidArgument`] if `opts` exceed the controller limits
    /// - [`Error::Connect`] if the transport cannot connect
    /// - [`Error::UnsuccessfulCommand`] if the target rejects the connect command
    pub fn connect<F>(
        fabric: &F,
        trid: &TransportId,
        opts: &QueuePairOpts,
        ctrl: &ControllerInfo,
    ) -> Result<Self>
    where
        F: Fabric<Connection = C>,
    {
        let max_capsule_size = opts.max_command_capsule_size(ctrl)?;
        let queue_id = opts.role.queue_id();
        let depth = opts.submission_queue_size;
        let max_inline_data = u32::try_from(opts.max_inline_size).map_err(|_| {
            Error::InvalidArgument(format!("max inline size {} too large", opts.max_inline_size))
        })?;

        tracing::debug!(
            qid = %queue_id,
            depth,
            max_capsule_size,
            %trid,
            "connecting queue pair"
        );

        let private_data = RdmaCmPrivateData::for_queue(queue_id, depth).encode();
        let conn = fabric.connect(&ConnectParams {
            transport_id: trid,
            private_data: &private_data,
            send_queue_depth: u32::from(depth),
            recv_queue_depth: u32::from(depth),
            completion_queue_depth: 2 * u32::from(depth),
            max_inline_data,
        })?;

        let mut qp = Self {
            conn,
            role: opts.role,
            submission_queue_size: depth,
            additional_sgls: opts.additional_sgls,
            in_capsule_data_size: opts.in_capsule_data_size,
            keep_alive_timeout_ms: opts.keep_alive_timeout_ms,
            poll_batch_size: opts.poll_batch_size,
            controller_id: DYNAMIC_CONTROLLER_ID,
            capsules: CapsulePool::new(usize::from(depth), max_capsule_size),
            inner: Mutex::new(Inner {
                state: State::Connecting,
                cids: CidAllocator::new(depth),
                registry: Registry::new(depth),
                receives: Vec::with_capacity(usize::from(depth)),
            }),
        };

        let connected = qp
            .post_receives()
            .and_then(|()| qp.handshake(trid, ctrl));
        match connected {
            Ok(controller_id) => {
                qp.controller_id = controller_id;
                qp.lock()?.state = State::Ready;
                tracing::debug!(qid = %queue_id, controller_id, "queue pair ready");
                Ok(qp)
            }
            Err(e) => {
                tracing::debug!(qid = %queue_id, "queue pair connect failed: {e}");
                if let Err(free_err) = qp.free() {
                    tracing::warn!(qid = %queue_id, "teardown after failed connect: {free_err}");
                }
                Err(e)
            }
        }
    }

    fn post_receives(&self) -> Result<()> {
        let mut inner = self.lock()?;
        for slot in 0..usize::from(self.submission_queue_size) {
            let buf = self.conn.register_memory(DmaBuf::alloc(CQE_SIZE)?)?;
            // Keep the registration even if the post fails so free() deregisters it.
            inner.receives.push(buf.clone());
            self.conn.post_receive(slot as u64, &buf)?;
        }
        Ok(())
    }

    /// Send the fabrics connect command and wait for its response.
    /// Returns the controller id the target assigned.
    fn handshake(&self, trid: &TransportId, ctrl: &ControllerInfo) -> Result<u16> {
        let (controller_id, keep_alive_timeout_ms) = match self.role {
            QueueRole::Admin => (DYNAMIC_CONTROLLER_ID, self.keep_alive_timeout_ms),
            QueueRole::Io(_) => (ctrl.controller_id, 0),
        };

        let data = ConnectData {
            host_id: ctrl.host_id,
            controller_id,
            subsystem_nqn: trid.subnqn().to_string(),
            host_nqn: ctrl.host_nqn.clone(),
        }
        .encode()?;
        let data_buf = self.register_memory(DmaBuf::alloc(CONNECT_DATA_SIZE)?)?;
        let capsule = match self.allocate_command_capsule() {
            Ok(capsule) => capsule,
            Err(e) => {
                self.conn.deregister_memory(data_buf)?;
                return Err(e);
            }
        };

        let result = self.exchange_connect(&data, &data_buf, &capsule, keep_alive_timeout_ms);

        self.free_command_capsule(capsule)?;
        self.conn.deregister_memory(data_buf)?;
        result
    }

    fn exchange_connect(
        &self,
        data: &[u8; CONNECT_DATA_SIZE],
        data_buf: &RegisteredBuf,
        capsule: &RegisteredBuf,
        keep_alive_timeout_ms: u32,
    ) -> Result<u16> {
        data_buf.buf().write_at(0, data)?;
        let sqe = ConnectCommand {
            queue_id: self.queue_id(),
            submission_queue_size: self.submission_queue_size,
            attributes: 0,
            keep_alive_timeout_ms,
            data: KeyedSglDescriptor::for_buffer(data_buf)?,
        }
        .encode(0);
        capsule.buf().write_at(0, &sqe)?;

        let (command_cb, command_done) = callback_completion();
        let (response_cb, response_done) = callback_completion();
        let command = Arc::new(Command::new(capsule.clone(), SQE_SIZE, command_cb)?);
        let response = Arc::new(Response::new(response_cb));

        self.submit(command, Arc::clone(&response))?;

        let mut poller = self.poller()?;
        block_on(
            async {
                command_done.await?;
                response_done.await
            },
            || self.poll(&mut poller),
        )??;

        let cqe = response
            .completion()?
            .ok_or_else(|| Error::connect("connect response carried no completion"))?;
        let reply = ConnectResponse::from(&cqe);
        reply.status.check()?;
        Ok(reply.controller_id)
    }

    /// Submit a command, pairing it with the response that will receive
    /// its completion. Returns the CID assigned to the command.
    ///
    /// `on_start` is invoked on both callbacks before a CID is allocated.
    ///
    /// # Errors
    ///
    /// - [`Error::QueueFull`] if no CID is available; poll and retry
    /// - [`Error::Closed`] after [`free`](Self::free)
    pub fn submit(&self, command: Arc<Command>, response: Arc<Response>) -> Result<u16> {
        command.callback().on_start();
        response.callback().on_start();

        let mut inner = self.lock()?;
        if inner.state == State::Closed {
            return Err(Error::Closed);
        }

        let Inner { cids, registry, .. } = &mut *inner;
        let cid = cids.allocate(|cid| registry.has_command(cid))?;

        let posted = command.set_command_id(cid).and_then(|()| {
            registry.insert(cid, Arc::clone(&command), response);
            self.conn
                .post_send(u64::from(cid), command.capsule(), command.len())
        });
        if let Err(e) = posted {
            registry.remove(cid);
            cids.release(cid);
            return Err(e);
        }

        tracing::trace!(qid = %self.queue_id(), cid, "command posted");
        Ok(cid)
    }

    /// Create a completion polling handle for the calling thread.
    pub fn poller(&self) -> Result<CompletionPoller<C::Poller>> {
        Ok(CompletionPoller {
            handle: self.conn.create_poller(self.poll_batch_size)?,
            completions: Vec::with_capacity(self.poll_batch_size),
        })
    }

    /// Drain one batch of completions and dispatch them to callbacks.
    ///
    /// Returns the number of work completions drained.
    ///
    /// # Errors
    ///
    /// - [`Error::UnknownCorrelation`] if a completion names a CID with no
    ///   matching slot. The rest of the batch is still processed and its
    ///   callbacks fired; the first such error is returned.
    /// - [`Error::Closed`] after [`free`](Self::free)
    pub fn poll(&self, poller: &mut CompletionPoller<C::Poller>) -> Result<usize> {
        if self.lock()?.state == State::Closed {
            return Err(Error::Closed);
        }

        poller.completions.clear();
        let drained = self
            .conn
            .poll_completions(&mut poller.handle, &mut poller.completions)?;
        if drained == 0 {
            return Ok(0);
        }

        let mut dispatch = Vec::with_capacity(drained);
        let mut first_err = None;
        {
            let mut inner = self.lock()?;
            if inner.state == State::Closed {
                return Err(Error::Closed);
            }
            for wc in &poller.completions {
                tracing::trace!(
                    qid = %self.queue_id(),
                    wr_id = wc.wr_id,
                    direction = %wc.direction,
                    status = ?wc.status,
                    "work completion"
                );
                let handled = match wc.direction {
                    Direction::Send => self.handle_send(&mut inner, wc, &mut dispatch),
                    Direction::Receive => self.handle_receive(&mut inner, wc, &mut dispatch),
                };
                if let Err(e) = handled {
                    tracing::warn!(qid = %self.queue_id(), "completion dropped: {e}");
                    first_err.get_or_insert(e);
                }
            }
        }

        for d in dispatch {
            d.fire();
        }

        match first_err {
            Some(e) => Err(e),
            None => Ok(drained),
        }
    }

    fn handle_send(
        &self,
        inner: &mut Inner,
        wc: &WorkCompletion,
        dispatch: &mut Vec<Dispatch>,
    ) -> Result<()> {
        // Valid CIDs are below the queue depth, so u16::MAX never matches.
        let cid = u16::try_from(wc.wr_id).unwrap_or(u16::MAX);
        let command = inner
            .registry
            .take_command(cid)
            .ok_or(Error::UnknownCorrelation {
                cid,
                direction: Direction::Send,
            })?;
        dispatch.push(Dispatch::Command(command, wc.error()));
        Ok(())
    }

    fn handle_receive(
        &self,
        inner: &mut Inner,
        wc: &WorkCompletion,
        dispatch: &mut Vec<Dispatch>,
    ) -> Result<()> {
        if let Some(reason) = wc.error() {
            // The failed receive cannot be tied to a CID: fail every pending
            // response once and keep their CIDs out of the free set.
            let pending = inner.registry.pending_responses();
            tracing::warn!(
                qid = %self.queue_id(),
                pending = pending.len(),
                "{reason}, failing all pending responses"
            );
            dispatch.extend(
                pending
                    .into_iter()
                    .map(|response| Dispatch::ResponseFailure(response, reason)),
            );
            return Ok(());
        }

        let slot = usize::try_from(wc.wr_id).unwrap_or(usize::MAX);
        let buf = inner.receives.get(slot).cloned().ok_or_else(|| {
            Error::Transport(format!("receive completion for unknown slot {}", wc.wr_id))
        })?;
        // A short receive leaves a stale CQE in the slot.
        if (wc.byte_len as usize) < CQE_SIZE {
            self.conn.post_receive(wc.wr_id, &buf)?;
            return Err(Error::Transport(format!(
                "short receive of {} bytes in slot {}",
                wc.byte_len, wc.wr_id
            )));
        }

        let mut raw = [0u8; CQE_SIZE];
        buf.buf().read_at(0, &mut raw)?;
        let cqe = CompletionQueueEntry::decode(&raw);
        let cid = cqe.command_id;

        let Some(response) = inner.registry.take_response(cid) else {
            self.conn.post_receive(wc.wr_id, &buf)?;
            return Err(Error::UnknownCorrelation {
                cid,
                direction: Direction::Receive,
            });
        };
        // The response is matched once its slot is taken; a failed repost
        // only costs the receive slot.
        response.set_completion(cqe);
        inner.cids.release(cid);
        dispatch.push(Dispatch::Response(response));
        self.conn.post_receive(wc.wr_id, &buf)
    }

    /// Tear down the queue pair.
    ///
    /// Deregisters the receive and capsule buffers, clears both slot
    /// tables without invoking callbacks, and closes the connection.
    /// Calling `free` again is a no-op.
    ///
    /// # Errors
    ///
    /// Returns the first deregistration or close error; teardown still runs
    /// to completion and the queue pair is closed either way.
    pub fn free(&self) -> Result<()> {
        let receives = {
            let mut inner = self.lock()?;
            if inner.state == State::Closed {
                return Ok(());
            }
            inner.state = State::Closed;
            inner.registry.clear();
            inner.cids.reset();
            std::mem::take(&mut inner.receives)
        };

        let mut first_err = None;
        for buf in receives.into_iter().chain(self.capsules.drain()) {
            if let Err(e) = self.conn.deregister_memory(buf) {
                first_err.get_or_insert(e);
            }
        }
        if let Err(e) = self.conn.close() {
            first_err.get_or_insert(e);
        }

        tracing::debug!(qid = %self.queue_id(), "queue pair freed");
        match first_err {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    /// Whether the queue pair is connected and not yet freed.
    pub fn is_valid(&self) -> bool {
        self.lock().map(|inner| inner.state == State::Ready).unwrap_or(false)
    }

    /// Register a caller buffer with this queue pair's connection.
    pub fn register_memory(&self, buf: DmaBuf) -> Result<RegisteredBuf> {
        self.ensure_open()?;
        self.conn.register_memory(buf)
    }

    /// Undo [`register_memory`](Self::register_memory).
    pub fn deregister_memory(&self, buf: RegisteredBuf) -> Result<()> {
        self.conn.deregister_memory(buf)
    }

    /// Take a registered buffer of [`max_command_capsule_size`](Self::max_command_capsule_size)
    /// bytes for building a command capsule.
    pub fn allocate_command_capsule(&self) -> Result<RegisteredBuf> {
        self.ensure_open()?;
        self.capsules
            .checkout(|buf| self.conn.register_memory(buf))
    }

    /// Return a capsule obtained from [`allocate_command_capsule`](Self::allocate_command_capsule).
    pub fn free_command_capsule(&self, capsule: RegisteredBuf) -> Result<()> {
        if self.lock()?.state == State::Closed {
            return self.conn.deregister_memory(capsule);
        }
        match self.capsules.give_back(capsule) {
            Some(buf) => self.conn.deregister_memory(buf),
            None => Ok(()),
        }
    }

    fn ensure_open(&self) -> Result<()> {
        if self.lock()?.state == State::Closed {
            return Err(Error::Closed);
        }
        Ok(())
    }

    /// Admin or I/O.
    pub fn role(&self) -> QueueRole {
        self.role
    }

    /// Queue identifier.
    pub fn queue_id(&self) -> QueueId {
        self.role.queue_id()
    }

    /// Submission queue depth.
    pub fn submission_queue_size(&self) -> u16 {
        self.submission_queue_size
    }

    /// Additional SGL descriptors each capsule has room for.
    pub fn max_additional_sgls(&self) -> usize {
        self.additional_sgls
    }

    /// In-capsule data bytes each capsule has room for.
    pub fn in_capsule_data_size(&self) -> usize {
        self.in_capsule_data_size
    }

    /// Size of the command capsule buffers.
    pub fn max_command_capsule_size(&self) -> usize {
        self.capsules.buf_size()
    }

    /// Controller id returned by the connect response.
    pub fn controller_id(&self) -> u16 {
        self.controller_id
    }

    /// The underlying connection.
    pub fn connection(&self) -> &C {
        &self.conn
    }

    /// Number of CIDs currently free.
    pub fn available_cids(&self) -> Result<usize> {
        Ok(self.lock()?.cids.available())
    }

    /// CIDs with a populated command or response slot, ascending.
    pub fn in_flight(&self) -> Result<Vec<u16>> {
        Ok(self.lock()?.registry.in_flight())
    }

    fn lock(&self) -> Result<MutexGuard<'_, Inner>> {
        self.inner
            .lock()
            .map_err(|_| Error::LockPoisoned("queue pair"))
    }
}

impl<C: Connection> Drop for QueuePair<C> {
    fn drop(&mut self) {
        if let Err(e) = self.free() {
            tracing::warn!(qid = %self.queue_id(), "queue pair teardown failed: {e}");
        }
    }
}

impl<C: Connection> std::fmt::Debug for QueuePair<C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QueuePair")
            .field("qid", &self.queue_id())
            .field("depth", &self.submission_queue_size)
            .field("controller_id", &self.controller_id)
            .field("valid", &self.is_valid())
            .finish()
    }
}
