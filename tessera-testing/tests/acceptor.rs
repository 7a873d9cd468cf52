//! End-to-end scenarios for the acceptor state machine and its manager.

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;

use tessera_core::{
    Abort, Action, ActionKind, Allocation, BootCount, Message, Outcome, ReplicaId, Txn, TxnId,
    VarId,
};
use tessera_dispatch::Executor;
use tessera_paxos::{
    AcceptorDispatcher, AcceptorManager, Ballot, ConnectionManager, DurableAcceptorState, Vote,
};
use tessera_testing::{MemoryDisk, TestConnection, TestConnectionManager, flush, init_tracing, wait_until};

const V: VarId = VarId([5; 16]);
const SUBMITTER: ReplicaId = ReplicaId(9);

fn txn(id: u8) -> Txn {
    Txn {
        id: TxnId([id; 16]),
        retry: false,
        submitter: SUBMITTER,
        submitter_boot_count: BootCount(1),
        f_inc: 2,
        topology_version: 1,
        actions: vec![Action {
            var: V,
            kind: ActionKind::Write {
                value: Bytes::from_static(b"payload"),
                references: Vec::new(),
            },
        }],
        allocations: vec![
            Allocation {
                replica: ReplicaId(1),
                action_indices: vec![0],
                active: BootCount(5),
            },
            Allocation {
                replica: ReplicaId(2),
                action_indices: vec![0],
                active: BootCount(7),
            },
            Allocation {
                replica: ReplicaId(3),
                action_indices: vec![0],
                active: BootCount(0),
            },
        ],
    }
}

fn commit(round: u32) -> Ballot {
    Ballot {
        round,
        vote: Vote::Commit,
    }
}

fn deadlock(round: u32) -> Ballot {
    Ballot {
        round,
        vote: Vote::AbortDeadlock,
    }
}

struct Cluster {
    cm: Arc<TestConnectionManager>,
    disk: MemoryDisk,
    manager: AcceptorManager,
    conns: Vec<Arc<TestConnection>>,
    submitter_conn: Arc<TestConnection>,
    _worker: tokio::task::JoinHandle<()>,
}

fn cluster() -> Cluster {
    let cm = TestConnectionManager::new();
    let cm_dyn: Arc<dyn ConnectionManager> = cm.clone();
    let conns: Vec<Arc<TestConnection>> = (1..=3)
        .map(|i| {
            let conn = TestConnection::new(ReplicaId(i), BootCount(10 + i));
            cm.establish(ReplicaId(i), conn.clone());
            conn
        })
        .collect();
    let submitter_conn = TestConnection::new(SUBMITTER, BootCount(1));
    cm.establish(SUBMITTER, submitter_conn.clone());

    let disk = MemoryDisk::new();
    let (exe, worker) = Executor::spawn();
    let manager = AcceptorManager::new(exe, Arc::new(disk.clone()), cm_dyn);
    Cluster {
        cm,
        disk,
        manager,
        conns,
        submitter_conn,
        _worker: worker,
    }
}

fn is_two_b(msg: &Message) -> bool {
    matches!(msg, Message::TwoBTxnVotes { .. })
}

fn is_tgc(msg: &Message) -> bool {
    matches!(msg, Message::TxnGloballyComplete { .. })
}

#[tokio::test]
async fn abort_path_notifies_actives_only() {
    let _guard = init_tracing();
    let cluster = cluster();
    let t = txn(1);
    let tid = t.id;

    cluster
        .manager
        .ballot_accepted(ReplicaId(1), tid, V, deadlock(1), t.clone());
    cluster
        .manager
        .ballot_accepted(ReplicaId(2), tid, V, deadlock(1), t.clone());

    wait_until(|| cluster.cm.sender_count() == 1).await;
    assert!(cluster.disk.contains(tid.as_bytes()));

    // 2B goes to the actives only; the passive replica hears nothing.
    for conn in &cluster.conns[..2] {
        let sent = conn.take_sent();
        assert!(
            matches!(
                &sent[..],
                [Message::TwoBTxnVotes {
                    outcome: Outcome::Abort(_),
                    ..
                }]
            ),
            "unexpected messages for {}: {sent:?}",
            conn.replica()
        );
    }
    assert!(cluster.conns[2].sent().is_empty());

    // The submitter receives the resubmit form, without update payloads.
    assert!(matches!(
        &cluster.submitter_conn.take_sent()[..],
        [Message::SubmissionOutcome {
            outcome: Outcome::Abort(Abort::Resubmit),
            ..
        }]
    ));

    // TSC may arrive before the TLCs are drained.
    cluster
        .manager
        .txn_submission_complete_received(tid, SUBMITTER);
    cluster
        .manager
        .txn_locally_complete_received(tid, ReplicaId(1));
    cluster
        .manager
        .txn_locally_complete_received(tid, ReplicaId(2));

    wait_until(|| !cluster.disk.contains(tid.as_bytes())).await;
    wait_until(|| cluster.conns[0].sent().iter().any(is_tgc)).await;
    assert!(cluster.conns[1].sent().iter().any(is_tgc));
    assert!(cluster.conns[2].sent().is_empty());
    assert!(cluster.manager.live_transactions().await.is_empty());
    assert_eq!(cluster.cm.sender_count(), 0);
}

#[tokio::test]
async fn superseded_write_completion_is_dropped() {
    let _guard = init_tracing();
    let cluster = cluster();
    cluster.disk.hold_completions();
    let t = txn(2);
    let tid = t.id;

    cluster
        .manager
        .ballot_accepted(ReplicaId(1), tid, V, commit(1), t.clone());
    cluster
        .manager
        .ballot_accepted(ReplicaId(2), tid, V, commit(1), t.clone());
    wait_until(|| cluster.disk.put_count() == 1).await;

    // Before the commit write completes, an instance changes its mind and
    // the outcome flips to abort, scheduling a second write.
    cluster
        .manager
        .ballot_accepted(ReplicaId(1), tid, V, deadlock(2), t.clone());
    wait_until(|| cluster.disk.put_count() == 2).await;

    // Completing the superseded commit write must not advance the machine.
    assert!(cluster.disk.release_next());
    tokio::time::sleep(Duration::from_millis(50)).await;
    flush(cluster.manager.executor()).await;
    assert_eq!(cluster.cm.sender_count(), 0);
    assert_eq!(cluster.manager.live_transactions().await, vec![tid]);

    // The abort write's completion does.
    assert!(cluster.disk.release_next());
    wait_until(|| cluster.cm.sender_count() == 1).await;

    // The commit attempt made sendToAll sticky, so even the abort 2B
    // reaches the passive replica.
    for conn in &cluster.conns {
        wait_until(|| conn.sent().iter().any(is_two_b)).await;
        assert!(matches!(
            conn.sent().iter().find(|m| is_two_b(m)),
            Some(Message::TwoBTxnVotes {
                outcome: Outcome::Abort(_),
                ..
            })
        ));
    }
}

#[tokio::test]
async fn reconnect_resends_two_b_to_that_recipient_only() {
    let _guard = init_tracing();
    let cluster = cluster();
    let t = txn(3);
    let tid = t.id;

    cluster
        .manager
        .ballot_accepted(ReplicaId(1), tid, V, commit(1), t.clone());
    cluster
        .manager
        .ballot_accepted(ReplicaId(2), tid, V, commit(1), t.clone());
    wait_until(|| cluster.cm.sender_count() == 1).await;

    // Commit: every participant got exactly one 2B.
    for conn in &cluster.conns {
        assert_eq!(conn.take_sent().iter().filter(|m| is_two_b(m)).count(), 1);
    }
    let _ = cluster.submitter_conn.take_sent();

    // Lose and re-establish one recipient: only it gets a resend.
    cluster.cm.lose(ReplicaId(2));
    cluster
        .cm
        .establish(ReplicaId(2), cluster.conns[1].clone());
    let resent = cluster.conns[1].take_sent();
    assert_eq!(resent.iter().filter(|m| is_two_b(m)).count(), 1);
    assert!(cluster.conns[0].sent().is_empty());
    assert!(cluster.conns[2].sent().is_empty());

    // The submitter gets the SubmissionOutcome again on its own reconnect.
    cluster.cm.lose(SUBMITTER);
    cluster
        .cm
        .establish(SUBMITTER, cluster.submitter_conn.clone());
    assert!(matches!(
        &cluster.submitter_conn.take_sent()[..],
        [Message::SubmissionOutcome {
            outcome: Outcome::Commit,
            ..
        }]
    ));
}

#[tokio::test]
async fn reconstructed_acceptor_does_not_rewrite() {
    let _guard = init_tracing();
    let cluster = cluster();
    let t = txn(4);
    let tid = t.id;
    let record = DurableAcceptorState {
        txn: t,
        outcome: Outcome::Commit,
        send_to_all: true,
        instances: Vec::new(),
    };
    cluster.disk.insert(tid.as_bytes(), &record.encode());

    cluster.manager.load_from_disk(tid, &record.encode()).unwrap();
    wait_until(|| cluster.cm.sender_count() == 1).await;
    assert_eq!(cluster.disk.put_count(), 0);

    // TLCs and TSC may arrive immediately after restart.
    cluster
        .manager
        .txn_submission_complete_received(tid, SUBMITTER);
    for i in 1..=3 {
        cluster
            .manager
            .txn_locally_complete_received(tid, ReplicaId(i));
    }
    wait_until(|| !cluster.disk.contains(tid.as_bytes())).await;
    wait_until(|| cluster.conns[2].sent().iter().any(is_tgc)).await;
    assert!(cluster.manager.live_transactions().await.is_empty());
}

#[tokio::test]
async fn disk_failure_halts_the_acceptor() {
    let _guard = init_tracing();
    let cluster = cluster();
    cluster.disk.fail_next();
    let t = txn(5);
    let tid = t.id;

    cluster
        .manager
        .ballot_accepted(ReplicaId(1), tid, V, commit(1), t.clone());
    cluster
        .manager
        .ballot_accepted(ReplicaId(2), tid, V, commit(1), t.clone());

    tokio::time::sleep(Duration::from_millis(50)).await;
    flush(cluster.manager.executor()).await;
    // No durable outcome, no 2B, acceptor still live: recovery happens at
    // the next restart from whatever is on disk.
    assert_eq!(cluster.cm.sender_count(), 0);
    assert!(!cluster.disk.contains(tid.as_bytes()));
    assert_eq!(cluster.manager.live_transactions().await, vec![tid]);
}

#[tokio::test]
async fn tlc_for_finished_acceptor_elicits_tgc() {
    let _guard = init_tracing();
    let cluster = cluster();
    let tid = TxnId([77; 16]);

    cluster
        .manager
        .txn_locally_complete_received(tid, ReplicaId(1));
    wait_until(|| cluster.conns[0].sent().iter().any(is_tgc)).await;
}

#[tokio::test]
async fn dispatcher_shards_transactions_across_managers() {
    let _guard = init_tracing();
    let cm = TestConnectionManager::new();
    let cm_dyn: Arc<dyn ConnectionManager> = cm.clone();
    for i in 1..=3 {
        cm.establish(ReplicaId(i), TestConnection::new(ReplicaId(i), BootCount(1)));
    }
    let disk = MemoryDisk::new();
    let dispatcher = AcceptorDispatcher::new(4, Arc::new(disk.clone()), cm_dyn);

    for id in [11u8, 12] {
        let t = txn(id);
        let tid = t.id;
        let manager = dispatcher.manager_for(&tid);
        manager.ballot_accepted(ReplicaId(1), tid, V, commit(1), t.clone());
        manager.ballot_accepted(ReplicaId(2), tid, V, commit(1), t);
    }

    wait_until(|| disk.put_count() == 2).await;
    dispatcher.shutdown().await;
}
