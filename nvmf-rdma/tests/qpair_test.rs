//! Queue pair integration tests against the loopback fabric.
//!
//! Run with:
//! ```bash
//! RUST_LOG=nvmf_rdma=trace cargo test --package nvmf-rdma --test qpair_test -- --nocapture
//! ```

mod common;

use std::collections::BTreeSet;
use std::sync::{Arc, Mutex, OnceLock, Weak};

use common::{LoopbackQueuePair, controller, io_queue, poll_once, submit_flush, trid};
use nvmf_rdma::fabric::{CompletionError, Direction, WorkCompletion};
use nvmf_rdma::nvme::{CompletionQueueEntry, Status};
use nvmf_rdma::nvmf::connect::DYNAMIC_CONTROLLER_ID;
use nvmf_rdma::nvmf::loopback::LoopbackFabric;
use nvmf_rdma::nvmf::{Callback, QueueId, QueuePair, QueuePairOpts, QueueRole};
use nvmf_rdma::{Error, Result};
use proptest::prelude::*;

// ============================================================================
// Connect
// ============================================================================

#[test]
fn test_connect_admin_queue() -> Result<()> {
    common::init_tracing();
    let fabric = LoopbackFabric::new();
    fabric.set_controller_id(7)?;
    let opts = QueuePairOpts::admin().with_keep_alive_timeout_ms(30_000);

    let qp = QueuePair::connect(&fabric, &trid(), &opts, &controller())?;
    assert!(qp.is_valid());
    assert_eq!(qp.role(), QueueRole::Admin);
    assert_eq!(qp.queue_id(), QueueId::ADMIN);
    assert_eq!(qp.controller_id(), 7);
    assert_eq!(qp.max_command_capsule_size(), 64);

    let conn = qp.connection();
    let connects = conn.connects()?;
    assert_eq!(connects.len(), 1);
    let record = &connects[0];
    assert_eq!(record.private_data.queue_id, QueueId::ADMIN);
    assert_eq!(record.private_data.recv_queue_size, 32);
    assert_eq!(record.private_data.send_queue_size, 31);
    assert_eq!(record.command.submission_queue_size, 32);
    assert_eq!(record.command.keep_alive_timeout_ms, 30_000);
    assert_eq!(record.data.controller_id, DYNAMIC_CONTROLLER_ID);
    assert_eq!(record.data.subsystem_nqn, common::SUBNQN);
    assert_eq!(record.data.host_nqn, common::HOSTNQN);

    // The connect CID is back, its receive reposted, the data buffer gone.
    assert_eq!(qp.available_cids()?, 32);
    assert!(qp.in_flight()?.is_empty());
    assert_eq!(conn.posted_receives()?, 32);
    assert_eq!(conn.registered()?, 32 + 1);
    Ok(())
}

#[test]
fn test_connect_io_queue() -> Result<()> {
    common::init_tracing();
    let fabric = LoopbackFabric::new();
    let opts = QueuePairOpts::io(3)
        .with_submission_queue_size(16)
        .with_additional_sgls(2)
        .with_keep_alive_timeout_ms(5_000);

    let qp = QueuePair::connect(&fabric, &trid(), &opts, &controller().with_controller_id(5))?;
    assert_eq!(qp.queue_id(), QueueId::new(3));
    assert_eq!(qp.controller_id(), 5);
    assert_eq!(qp.submission_queue_size(), 16);
    assert_eq!(qp.max_additional_sgls(), 2);
    assert_eq!(qp.max_command_capsule_size(), 64 + 2 * 16);

    let record = &qp.connection().connects()?[0];
    assert_eq!(record.command.queue_id, QueueId::new(3));
    assert_eq!(record.data.controller_id, 5);
    // Keep-alive is an admin queue setting.
    assert_eq!(record.command.keep_alive_timeout_ms, 0);
    assert_eq!(qp.connection().recv_queue_depth()?, 16);
    Ok(())
}

#[test]
fn test_connect_rejected() {
    common::init_tracing();
    let fabric = LoopbackFabric::new();
    fabric.reject_next("no listener").unwrap();

    let result = QueuePair::connect(&fabric, &trid(), &QueuePairOpts::io(1), &controller());
    assert!(matches!(result, Err(Error::Connect { .. })));
    assert_eq!(fabric.connections().unwrap(), 0);
}

#[test]
fn test_connect_unsuccessful_status() {
    common::init_tracing();
    let fabric = LoopbackFabric::new();
    // Command specific: connect invalid parameters
    fabric.set_connect_status(Status::new(0x1, 0x82)).unwrap();

    let result = QueuePair::connect(&fabric, &trid(), &QueuePairOpts::io(1), &controller());
    assert!(matches!(
        result,
        Err(Error::UnsuccessfulCommand { sct: 0x1, sc: 0x82 })
    ));
}

#[test]
fn test_connect_invalid_geometry() {
    common::init_tracing();
    let fabric = LoopbackFabric::new();

    let too_many_sgls = QueuePairOpts::io(1).with_additional_sgls(4);
    assert!(matches!(
        QueuePair::connect(&fabric, &trid(), &too_many_sgls, &controller()),
        Err(Error::InvalidArgument(_))
    ));

    let too_much_data = QueuePairOpts::io(1).with_in_capsule_data_size(8192 + 1);
    assert!(matches!(
        QueuePair::connect(&fabric, &trid(), &too_much_data, &controller()),
        Err(Error::InvalidArgument(_))
    ));

    // Rejected before the transport is touched.
    assert_eq!(fabric.connections().unwrap(), 0);
}

// ============================================================================
// Submit / poll
// ============================================================================

#[test]
fn test_queue_exhaustion() -> Result<()> {
    let (_fabric, qp) = io_queue(4)?;
    let mut cids = BTreeSet::new();
    for _ in 0..4 {
        cids.insert(submit_flush(&qp)?.cid);
    }
    assert_eq!(cids, (0..4).collect::<BTreeSet<u16>>());
    assert_eq!(qp.available_cids()?, 0);

    let (command, response, command_rec, response_rec) = common::flush_command(&qp)?;
    assert!(matches!(qp.submit(command, response), Err(Error::QueueFull)));
    // on_start precedes allocation.
    assert_eq!(command_rec.started(), 1);
    assert_eq!(response_rec.started(), 1);
    assert_eq!(qp.in_flight()?, vec![0, 1, 2, 3]);
    Ok(())
}

#[test]
fn test_matching_response() -> Result<()> {
    let (_fabric, qp) = io_queue(4)?;
    let cmd = submit_flush(&qp)?;
    assert_eq!(cmd.command.started(), 1);

    let sent = qp.connection().sent()?;
    let last = sent.last().unwrap();
    assert_eq!(last.wr_id, u64::from(cmd.cid));
    assert_eq!(last.command_id(), cmd.cid);

    qp.connection().complete_send(cmd.cid)?;
    qp.connection().respond(cmd.cid, Status::SUCCESS)?;
    assert_eq!(poll_once(&qp)?, 2);

    assert_eq!(cmd.command.completed(), 1);
    assert_eq!(cmd.response.completed(), 1);
    assert!(cmd.response.failures().is_empty());
    let cqe = cmd.sink.completion()?.unwrap();
    assert_eq!(cqe.command_id, cmd.cid);
    assert_eq!(cqe.sq_id, 1);

    assert_eq!(qp.available_cids()?, 4);
    assert!(qp.in_flight()?.is_empty());
    assert_eq!(qp.connection().posted_receives()?, 4);

    // Nothing left to drain.
    assert_eq!(poll_once(&qp)?, 0);
    assert_eq!(cmd.response.completed(), 1);
    Ok(())
}

#[test]
fn test_out_of_order_completions() -> Result<()> {
    let (_fabric, qp) = io_queue(8)?;
    let cmds: Vec<_> = (0..4).map(|_| submit_flush(&qp)).collect::<Result<_>>()?;

    let conn = qp.connection();
    for cmd in cmds.iter().rev() {
        conn.respond(cmd.cid, Status::SUCCESS)?;
    }
    for cmd in &cmds {
        conn.complete_send(cmd.cid)?;
    }
    assert_eq!(poll_once(&qp)?, 8);

    for cmd in &cmds {
        assert_eq!(cmd.command.completed(), 1);
        assert_eq!(cmd.response.completed(), 1);
        assert_eq!(cmd.sink.completion()?.unwrap().command_id, cmd.cid);
    }
    assert_eq!(qp.available_cids()?, 8);
    Ok(())
}

#[test]
fn test_response_before_send_completion() -> Result<()> {
    let (_fabric, qp) = io_queue(2)?;
    let a = submit_flush(&qp)?;
    assert_eq!(a.cid, 0);

    qp.connection().respond(a.cid, Status::SUCCESS)?;
    assert_eq!(poll_once(&qp)?, 1);
    assert_eq!(a.response.completed(), 1);
    assert_eq!(a.command.completed(), 0);
    // Released, but the command slot still holds it.
    assert_eq!(qp.available_cids()?, 2);
    assert_eq!(qp.in_flight()?, vec![0]);

    let b = submit_flush(&qp)?;
    assert_eq!(b.cid, 1);
    // CID 0 is free but its send has not retired.
    assert!(matches!(submit_flush(&qp), Err(Error::QueueFull)));

    qp.connection().complete_send(a.cid)?;
    assert_eq!(poll_once(&qp)?, 1);
    assert_eq!(a.command.completed(), 1);
    assert_eq!(submit_flush(&qp)?.cid, 0);
    Ok(())
}

#[test]
fn test_send_failure() -> Result<()> {
    let (_fabric, qp) = io_queue(4)?;
    let cmd = submit_flush(&qp)?;

    qp.connection().fail_send(cmd.cid, 5)?;
    assert_eq!(poll_once(&qp)?, 1);

    assert_eq!(
        cmd.command.failures(),
        vec![CompletionError {
            direction: Direction::Send,
            status: 5
        }]
    );
    assert_eq!(cmd.command.completed(), 0);
    // The response is still pending, so the CID stays allocated.
    assert_eq!(cmd.response.finished(), 0);
    assert_eq!(qp.available_cids()?, 3);
    assert_eq!(qp.in_flight()?, vec![cmd.cid]);
    Ok(())
}

#[test]
fn test_receive_failure_broadcast() -> Result<()> {
    let (_fabric, qp) = io_queue(4)?;
    let a = submit_flush(&qp)?;
    let b = submit_flush(&qp)?;
    let c = submit_flush(&qp)?;

    // A's response is done; only its command is outstanding.
    qp.connection().respond(a.cid, Status::SUCCESS)?;
    qp.connection().complete_send(b.cid)?;
    assert_eq!(poll_once(&qp)?, 2);

    qp.connection().fail_receive(13)?;
    assert_eq!(poll_once(&qp)?, 1);

    let expected = vec![CompletionError {
        direction: Direction::Receive,
        status: 13,
    }];
    assert_eq!(b.response.failures(), expected);
    assert_eq!(c.response.failures(), expected);
    assert!(a.response.failures().is_empty());
    assert_eq!(a.response.completed(), 1);

    // Commands are untouched.
    assert_eq!(a.command.finished(), 0);
    assert_eq!(b.command.completed(), 1);
    assert_eq!(c.command.finished(), 0);

    // B and C keep their CIDs.
    assert_eq!(qp.available_cids()?, 2);
    assert_eq!(qp.in_flight()?, vec![a.cid, b.cid, c.cid]);
    Ok(())
}

#[test]
fn test_unknown_correlation() -> Result<()> {
    let (_fabric, qp) = io_queue(4)?;

    qp.connection().complete_send(3)?;
    assert!(matches!(
        poll_once(&qp),
        Err(Error::UnknownCorrelation {
            cid: 3,
            direction: Direction::Send
        })
    ));

    qp.connection().respond(2, Status::SUCCESS)?;
    assert!(matches!(
        poll_once(&qp),
        Err(Error::UnknownCorrelation {
            cid: 2,
            direction: Direction::Receive
        })
    ));
    // The receive is reposted regardless.
    assert_eq!(qp.connection().posted_receives()?, 4);
    assert!(qp.is_valid());
    Ok(())
}

#[test]
fn test_unknown_correlation_keeps_batch() -> Result<()> {
    let (_fabric, qp) = io_queue(4)?;
    let cmd = submit_flush(&qp)?;

    qp.connection().complete_send(99)?;
    qp.connection().complete_send(cmd.cid)?;
    assert!(poll_once(&qp).is_err());
    assert_eq!(cmd.command.completed(), 1);
    Ok(())
}

#[test]
fn test_response_survives_failed_repost() -> Result<()> {
    let (_fabric, qp) = io_queue(1)?;
    let cmd = submit_flush(&qp)?;
    assert_eq!(cmd.cid, 0);
    qp.connection().complete_send(cmd.cid)?;
    assert_eq!(poll_once(&qp)?, 1);

    // Slot 0 is still posted and holds the connect response for CID 0, so
    // the response matches and the repost overflows the receive queue.
    qp.connection().inject(WorkCompletion::recv(0, 16))?;
    assert!(matches!(poll_once(&qp), Err(Error::Transport(_))));

    assert_eq!(cmd.response.completed(), 1);
    assert!(cmd.response.failures().is_empty());
    assert_eq!(qp.available_cids()?, 1);
    assert!(qp.in_flight()?.is_empty());
    assert_eq!(submit_flush(&qp)?.cid, 0);
    Ok(())
}

#[test]
fn test_short_receive_rejected() -> Result<()> {
    let (_fabric, qp) = io_queue(4)?;
    let cmd = submit_flush(&qp)?;
    let cqe = CompletionQueueEntry {
        sq_id: 1,
        command_id: cmd.cid,
        ..Default::default()
    };

    qp.connection().respond_truncated(&cqe, 8)?;
    assert!(matches!(poll_once(&qp), Err(Error::Transport(_))));
    assert_eq!(cmd.response.finished(), 0);
    assert_eq!(qp.available_cids()?, 3);
    assert_eq!(qp.connection().posted_receives()?, 4);

    qp.connection().respond(cmd.cid, Status::SUCCESS)?;
    assert_eq!(poll_once(&qp)?, 1);
    assert_eq!(cmd.response.completed(), 1);
    assert_eq!(qp.available_cids()?, 4);
    Ok(())
}

/// Looks at the queue pair from inside a callback.
struct Probe {
    qp: OnceLock<Weak<LoopbackQueuePair>>,
    available: Mutex<Option<usize>>,
}

impl Callback for Probe {
    fn on_complete(&self) {
        if let Some(qp) = self.qp.get().and_then(Weak::upgrade) {
            *self.available.lock().unwrap() = qp.available_cids().ok();
        }
    }

    fn on_failure(&self, _reason: CompletionError) {}
}

#[test]
fn test_callbacks_run_unlocked() -> Result<()> {
    let (_fabric, qp) = io_queue(4)?;
    let qp = Arc::new(qp);

    let probe = Arc::new(Probe {
        qp: OnceLock::new(),
        available: Mutex::new(None),
    });
    let _ = probe.qp.set(Arc::downgrade(&qp));

    let capsule = qp.allocate_command_capsule()?;
    let command = Arc::new(nvmf_rdma::Command::new(
        capsule,
        64,
        Arc::new(common::Recorder::default()),
    )?);
    let response = Arc::new(nvmf_rdma::Response::new(probe.clone()));
    let cid = qp.submit(command, response)?;

    qp.connection().respond(cid, Status::SUCCESS)?;
    poll_once(&qp)?;
    // The CID was released before the callback fired.
    assert_eq!(*probe.available.lock().unwrap(), Some(4));
    Ok(())
}

#[test]
fn test_concurrent_submit_and_poll() -> Result<()> {
    const COMMANDS: usize = 200;
    let (_fabric, qp) = io_queue(8)?;
    qp.connection().set_auto_complete_sends(true)?;

    let responses = std::thread::scope(|s| -> Result<Vec<Arc<common::Recorder>>> {
        let poll_thread = s.spawn(|| -> Result<()> {
            let mut poller = qp.poller()?;
            let mut done = 0;
            while done < 2 * COMMANDS {
                done += qp.poll(&mut poller)?;
            }
            Ok(())
        });

        let mut responses = Vec::with_capacity(COMMANDS);
        while responses.len() < COMMANDS {
            match submit_flush(&qp) {
                Ok(cmd) => {
                    qp.connection().respond(cmd.cid, Status::SUCCESS)?;
                    responses.push(cmd.response);
                }
                Err(Error::QueueFull) => std::thread::yield_now(),
                Err(e) => return Err(e),
            }
        }

        poll_thread.join().unwrap()?;
        Ok(responses)
    })?;

    assert!(responses.iter().all(|r| r.completed() == 1));
    assert_eq!(qp.available_cids()?, 8);
    assert!(qp.in_flight()?.is_empty());
    Ok(())
}

// ============================================================================
// Teardown
// ============================================================================

#[test]
fn test_free_idempotent() -> Result<()> {
    let (_fabric, qp) = io_queue(4)?;
    let pending = submit_flush(&qp)?;
    let conn = qp.connection().clone();

    qp.free()?;
    assert!(!qp.is_valid());
    assert!(conn.is_closed()?);
    // Only the capsule the caller still owns stays registered.
    assert_eq!(conn.registered()?, 1);
    assert!(qp.in_flight()?.is_empty());

    qp.free()?;
    assert!(!qp.is_valid());
    assert_eq!(conn.registered()?, 1);

    assert!(matches!(submit_flush(&qp), Err(Error::Closed)));
    assert!(matches!(poll_once(&qp), Err(Error::Closed)));
    assert!(matches!(qp.allocate_command_capsule(), Err(Error::Closed)));

    // Teardown does not notify pending callbacks.
    assert_eq!(pending.command.finished(), 0);
    assert_eq!(pending.response.finished(), 0);
    Ok(())
}

#[test]
fn test_drop_frees() -> Result<()> {
    let (_fabric, qp) = io_queue(4)?;
    let conn = qp.connection().clone();
    drop(qp);
    assert!(conn.is_closed()?);
    assert_eq!(conn.registered()?, 0);
    Ok(())
}

#[test]
fn test_capsules_recycled() -> Result<()> {
    let (_fabric, qp) = io_queue(4)?;
    let registered = qp.connection().registered()?;

    let capsule = qp.allocate_command_capsule()?;
    assert_eq!(capsule.len(), qp.max_command_capsule_size());
    let dma = capsule.buf().clone();
    qp.free_command_capsule(capsule)?;

    let again = qp.allocate_command_capsule()?;
    assert!(again.buf().same_allocation(&dma));
    assert_eq!(qp.connection().registered()?, registered);
    Ok(())
}

// ============================================================================
// Properties
// ============================================================================

#[derive(Debug, Clone)]
enum Op {
    Submit,
    CompleteSend(usize),
    Respond(usize),
}

fn op() -> impl Strategy<Value = Op> {
    prop_oneof![
        2 => Just(Op::Submit),
        1 => any::<usize>().prop_map(Op::CompleteSend),
        1 => any::<usize>().prop_map(Op::Respond),
    ]
}

fn check_uniqueness(ops: Vec<Op>) -> std::result::Result<(), TestCaseError> {
    const DEPTH: u16 = 4;
    let (_fabric, qp) = io_queue(DEPTH).unwrap();
    let conn = qp.connection().clone();
    let mut poller = qp.poller().unwrap();
    let mut pending_send = BTreeSet::new();
    let mut pending_response = BTreeSet::new();

    for op in ops {
        match op {
            Op::Submit => match submit_flush(&qp) {
                Ok(cmd) => {
                    prop_assert!(!pending_send.contains(&cmd.cid));
                    prop_assert!(!pending_response.contains(&cmd.cid));
                    pending_send.insert(cmd.cid);
                    pending_response.insert(cmd.cid);
                }
                Err(Error::QueueFull) => {}
                Err(e) => return Err(TestCaseError::fail(e.to_string())),
            },
            Op::CompleteSend(pick) => {
                let nth = pick % pending_send.len().max(1);
                if let Some(&cid) = pending_send.iter().nth(nth) {
                    conn.complete_send(cid).unwrap();
                    qp.poll(&mut poller).unwrap();
                    pending_send.remove(&cid);
                }
            }
            Op::Respond(pick) => {
                let nth = pick % pending_response.len().max(1);
                if let Some(&cid) = pending_response.iter().nth(nth) {
                    conn.respond(cid, Status::SUCCESS).unwrap();
                    qp.poll(&mut poller).unwrap();
                    pending_response.remove(&cid);
                }
            }
        }

        let expected: Vec<u16> = pending_send.union(&pending_response).copied().collect();
        prop_assert_eq!(qp.in_flight().unwrap(), expected);
        prop_assert_eq!(
            qp.available_cids().unwrap(),
            usize::from(DEPTH) - pending_response.len()
        );
    }
    Ok(())
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    /// No CID is ever handed out while its command or response is in flight.
    #[test]
    fn prop_cid_uniqueness(ops in proptest::collection::vec(op(), 1..64)) {
        check_uniqueness(ops)?;
    }
}
