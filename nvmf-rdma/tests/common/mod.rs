//! Common test utilities for queue pair integration tests.

#![allow(dead_code)]

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use nvmf_rdma::fabric::CompletionError;
use nvmf_rdma::nvmf::loopback::{LoopbackConnection, LoopbackFabric};
use nvmf_rdma::nvmf::{
    Callback, Command, ControllerInfo, QueuePair, QueuePairOpts, Response, TransportId,
};
use nvmf_rdma::Result;

pub type LoopbackQueuePair = QueuePair<LoopbackConnection>;

pub const SUBNQN: &str = "nqn.2024-01.io.spdk:cnode1";
pub const HOSTNQN: &str = "nqn.2014-08.org.nvmexpress:uuid:5a1f0c2e-0000-4000-8000-000000000001";

/// Install a test subscriber honoring `RUST_LOG`. Safe to call repeatedly.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

pub fn trid() -> TransportId {
    TransportId::rdma("10.0.0.1", "4420", SUBNQN).unwrap()
}

pub fn controller() -> ControllerInfo {
    ControllerInfo::new(HOSTNQN)
        .with_controller_id(1)
        .with_max_sgl_data_block_descriptors(4)
        .with_io_command_capsule_size(64 + 8192)
}

/// Connect I/O queue 1 with the given depth on a fresh loopback fabric.
pub fn io_queue(depth: u16) -> Result<(LoopbackFabric, LoopbackQueuePair)> {
    init_tracing();
    let fabric = LoopbackFabric::new();
    let opts = QueuePairOpts::io(1).with_submission_queue_size(depth);
    let qp = QueuePair::connect(&fabric, &trid(), &opts, &controller())?;
    Ok((fabric, qp))
}

/// Records every callback invocation.
#[derive(Debug, Default)]
pub struct Recorder {
    started: AtomicUsize,
    completed: AtomicUsize,
    failures: Mutex<Vec<CompletionError>>,
}

impl Recorder {
    pub fn started(&self) -> usize {
        self.started.load(Ordering::SeqCst)
    }

    pub fn completed(&self) -> usize {
        self.completed.load(Ordering::SeqCst)
    }

    pub fn failures(&self) -> Vec<CompletionError> {
        self.failures.lock().unwrap().clone()
    }

    /// Completions plus failures.
    pub fn finished(&self) -> usize {
        self.completed() + self.failures().len()
    }
}

impl Callback for Recorder {
    fn on_start(&self) {
        self.started.fetch_add(1, Ordering::SeqCst);
    }

    fn on_complete(&self) {
        self.completed.fetch_add(1, Ordering::SeqCst);
    }

    fn on_failure(&self, reason: CompletionError) {
        self.failures.lock().unwrap().push(reason);
    }
}

/// One submitted command with its recorders.
pub struct InFlight {
    pub cid: u16,
    pub command: Arc<Recorder>,
    pub response: Arc<Recorder>,
    pub sink: Arc<Response>,
}

/// Build a command (a bare NVM Flush SQE) with recording callbacks.
pub fn flush_command(
    qp: &LoopbackQueuePair,
) -> Result<(Arc<Command>, Arc<Response>, Arc<Recorder>, Arc<Recorder>)> {
    let capsule = qp.allocate_command_capsule()?;
    let mut sqe = [0u8; 64];
    sqe[0] = 0x00; // Flush
    sqe[4..8].copy_from_slice(&1u32.to_le_bytes()); // NSID
    capsule.buf().write_at(0, &sqe)?;

    let command_rec = Arc::new(Recorder::default());
    let response_rec = Arc::new(Recorder::default());
    let command = Arc::new(Command::new(capsule, 64, command_rec.clone())?);
    let response = Arc::new(Response::new(response_rec.clone()));
    Ok((command, response, command_rec, response_rec))
}

/// Submit a flush command.
pub fn submit_flush(qp: &LoopbackQueuePair) -> Result<InFlight> {
    let (command, sink, command_rec, response_rec) = flush_command(qp)?;
    let cid = qp.submit(command, sink.clone())?;
    Ok(InFlight {
        cid,
        command: command_rec,
        response: response_rec,
        sink,
    })
}

/// Poll once with a fresh poller.
pub fn poll_once(qp: &LoopbackQueuePair) -> Result<usize> {
    let mut poller = qp.poller()?;
    qp.poll(&mut poller)
}
