//! End-to-end scenarios for the transaction submitter.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use bytes::Bytes;

use tessera_client::{SubmitError, TxnCompletion, TxnSubmitter};
use tessera_core::{
    Action, ActionKind, Allocation, BootCount, ClientAction, ClientActionKind, ClientTxn, Message,
    Outcome, Positions, ReplicaId, Topology, Txn, TxnId, VarId,
};
use tessera_dispatch::Executor;
use tessera_paxos::ConnectionManager;
use tessera_testing::{TestConnection, TestConnectionManager, flush, init_tracing};

const LOCAL: ReplicaId = ReplicaId(1);
const V: VarId = VarId([5; 16]);

fn topology() -> Topology {
    Topology {
        all_replicas: vec![ReplicaId(1), ReplicaId(2), ReplicaId(3)],
        f_inc: 2,
        two_f_inc: 3,
        max_replica_count: 3,
        version: 1,
        root: None,
    }
}

fn client_write(id: u8) -> ClientTxn {
    ClientTxn {
        id: TxnId([id; 16]),
        retry: false,
        actions: vec![ClientAction {
            var: V,
            kind: ClientActionKind::Write {
                value: Bytes::from_static(b"payload"),
                references: Vec::new(),
            },
        }],
    }
}

type Outcomes = Arc<Mutex<Vec<(TxnId, Option<Outcome>)>>>;

fn capture() -> (TxnCompletion, Outcomes) {
    let outcomes: Outcomes = Arc::new(Mutex::new(Vec::new()));
    let sink = outcomes.clone();
    let continuation: TxnCompletion = Box::new(move |txn_id, outcome| {
        sink.lock().expect("outcome lock poisoned").push((txn_id, outcome));
    });
    (continuation, outcomes)
}

struct Harness {
    cm: Arc<TestConnectionManager>,
    conns: Vec<Arc<TestConnection>>,
    submitter: TxnSubmitter,
    _worker: tokio::task::JoinHandle<()>,
}

fn harness(topology: Topology) -> Harness {
    let cm = TestConnectionManager::new();
    let cm_dyn: Arc<dyn ConnectionManager> = cm.clone();
    let conns: Vec<Arc<TestConnection>> = (1..=3)
        .map(|i| {
            let conn = TestConnection::new(ReplicaId(i), BootCount(10 + i));
            cm.establish(ReplicaId(i), conn.clone());
            conn
        })
        .collect();
    let (exe, worker) = Executor::spawn();
    let submitter = TxnSubmitter::new(LOCAL, BootCount(1), topology, cm_dyn, exe);
    Harness {
        cm,
        conns,
        submitter,
        _worker: worker,
    }
}

/// Positions [0, 0, 0] resolve to the permutation [RM1, RM2, RM3].
async fn ensure_v(harness: &Harness) {
    harness
        .submitter
        .ensure_positions(HashMap::from([(V, Positions(vec![0, 0, 0]))]));
    flush(harness.submitter.executor()).await;
}

#[tokio::test]
async fn fresh_commit_builds_expected_allocations() {
    let _guard = init_tracing();
    let harness = harness(topology());
    harness
        .submitter
        .topology_change(None, Some(harness.cm.connections()));
    ensure_v(&harness).await;

    let (continuation, _outcomes) = capture();
    harness
        .submitter
        .submit_client_txn(client_write(1), continuation, Duration::ZERO)
        .await
        .unwrap();

    // The repeating sender was registered and the actives already received
    // the submission.
    assert_eq!(harness.cm.sender_count(), 1);
    let sent = harness.conns[0].take_sent();
    let [Message::TxnSubmission(txn)] = &sent[..] else {
        panic!("expected one submission, got {sent:?}");
    };

    assert_eq!(txn.submitter, LOCAL);
    assert_eq!(txn.f_inc, 2);
    assert_eq!(txn.allocations.len(), 3);
    // Every replica in the top-2f+1 permutation covers action 0.
    for alloc in &txn.allocations {
        assert_eq!(alloc.action_indices, vec![0]);
    }
    // Actives first with their observed boot counts, then the passive.
    assert_eq!(txn.allocations[0].replica, ReplicaId(1));
    assert_eq!(txn.allocations[0].active, BootCount(11));
    assert_eq!(txn.allocations[1].replica, ReplicaId(2));
    assert_eq!(txn.allocations[1].active, BootCount(12));
    assert_eq!(txn.allocations[2].replica, ReplicaId(3));
    assert_eq!(txn.allocations[2].active, BootCount(0));

    // The second active got the submission too; the passive did not.
    assert_eq!(harness.conns[1].take_sent().len(), 1);
    assert!(harness.conns[2].sent().is_empty());
}

#[tokio::test]
async fn blank_topology_buffers_until_configured() {
    let _guard = init_tracing();
    let harness = harness(Topology::blank());
    ensure_v(&harness).await;

    let (c1, o1) = capture();
    let (c2, o2) = capture();
    harness
        .submitter
        .submit_client_txn(client_write(1), c1, Duration::ZERO)
        .await
        .unwrap();
    harness
        .submitter
        .submit_client_txn(client_write(2), c2, Duration::ZERO)
        .await
        .unwrap();

    // Nothing dispatched while blank.
    assert_eq!(harness.cm.sender_count(), 0);
    assert!(harness.conns[0].sent().is_empty());

    harness
        .submitter
        .topology_change(Some(topology()), Some(harness.cm.connections()));
    flush(harness.submitter.executor()).await;

    // Both buffered submissions dispatched, in submission order.
    let submissions: Vec<TxnId> = harness.conns[0]
        .take_sent()
        .into_iter()
        .filter_map(|msg| match msg {
            Message::TxnSubmission(txn) => Some(txn.id),
            _ => None,
        })
        .collect();
    assert_eq!(submissions, vec![TxnId([1; 16]), TxnId([2; 16])]);
    assert!(o1.lock().unwrap().is_empty());
    assert!(o2.lock().unwrap().is_empty());
}

#[tokio::test]
async fn roll_on_wrong_leader_fails_without_registering_a_sender() {
    let _guard = init_tracing();
    let harness = harness(topology());
    harness
        .submitter
        .topology_change(None, Some(harness.cm.connections()));
    // Digits [1, 0, 0] make RM2 the leading hash code.
    harness
        .submitter
        .ensure_positions(HashMap::from([(V, Positions(vec![1, 0, 0]))]));

    let (continuation, outcomes) = capture();
    let roll = ClientTxn {
        id: TxnId([3; 16]),
        retry: false,
        actions: vec![ClientAction {
            var: V,
            kind: ClientActionKind::Roll {
                version: TxnId([9; 16]),
                value: Bytes::new(),
                references: Vec::new(),
            },
        }],
    };
    let err = harness
        .submitter
        .submit_client_txn(roll, continuation, Duration::ZERO)
        .await
        .unwrap_err();
    assert_eq!(*err.current_context(), SubmitError::AbortRoll);
    assert_eq!(harness.cm.sender_count(), 0);
    assert!(outcomes.lock().unwrap().is_empty());
}

fn server_txn(id: u8, retry: bool) -> Txn {
    Txn {
        id: TxnId([id; 16]),
        retry,
        submitter: LOCAL,
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
                active: BootCount(11),
            },
            Allocation {
                replica: ReplicaId(2),
                action_indices: vec![0],
                active: BootCount(12),
            },
            Allocation {
                replica: ReplicaId(3),
                action_indices: vec![0],
                active: BootCount(0),
            },
        ],
    }
}

fn tsc_count(conn: &TestConnection) -> usize {
    conn.sent()
        .iter()
        .filter(|m| matches!(m, Message::TxnSubmissionComplete { .. }))
        .count()
}

#[tokio::test]
async fn outcome_quorum_completes_once_and_frees_acceptors() {
    let _guard = init_tracing();
    let harness = harness(topology());
    harness
        .submitter
        .topology_change(None, Some(harness.cm.connections()));

    let txn = server_txn(4, false);
    let tid = txn.id;
    let (continuation, outcomes) = capture();
    harness
        .submitter
        .submit_txn(txn, vec![ReplicaId(1), ReplicaId(2)], continuation, Duration::ZERO);
    flush(harness.submitter.executor()).await;

    harness
        .submitter
        .submission_outcome_received(ReplicaId(1), tid, Outcome::Commit);
    flush(harness.submitter.executor()).await;
    assert!(outcomes.lock().unwrap().is_empty());

    harness
        .submitter
        .submission_outcome_received(ReplicaId(2), tid, Outcome::Commit);
    flush(harness.submitter.executor()).await;
    assert_eq!(
        *outcomes.lock().unwrap(),
        vec![(tid, Some(Outcome::Commit))]
    );
    // TSC went to every acceptor; the repeating sender is gone.
    for conn in &harness.conns {
        assert_eq!(tsc_count(conn), 1);
    }
    assert_eq!(harness.cm.sender_count(), 0);

    // A straggler outcome after completion elicits another TSC for that
    // sender only, and the continuation does not fire twice.
    harness
        .submitter
        .submission_outcome_received(ReplicaId(3), tid, Outcome::Commit);
    flush(harness.submitter.executor()).await;
    assert_eq!(tsc_count(&harness.conns[2]), 2);
    assert_eq!(tsc_count(&harness.conns[0]), 1);
    assert_eq!(outcomes.lock().unwrap().len(), 1);
}

#[tokio::test]
async fn shutdown_fails_continuations_and_aborts_retries() {
    let _guard = init_tracing();
    let harness = harness(topology());
    harness
        .submitter
        .topology_change(None, Some(harness.cm.connections()));

    let txn = server_txn(5, true);
    let tid = txn.id;
    let (continuation, outcomes) = capture();
    harness
        .submitter
        .submit_txn(txn, vec![ReplicaId(1), ReplicaId(2)], continuation, Duration::ZERO);
    flush(harness.submitter.executor()).await;

    harness.submitter.shutdown().await;
    assert_eq!(*outcomes.lock().unwrap(), vec![(tid, None)]);

    // Actives got the abort resubmission; every acceptor got a TSC.
    for conn in &harness.conns[..2] {
        assert!(
            conn.sent()
                .iter()
                .any(|m| matches!(m, Message::TxnSubmissionAbort { .. }))
        );
    }
    assert!(
        !harness.conns[2]
            .sent()
            .iter()
            .any(|m| matches!(m, Message::TxnSubmissionAbort { .. }))
    );
    for conn in &harness.conns {
        assert_eq!(tsc_count(conn), 1);
    }
}

#[tokio::test]
async fn delayed_submission_registers_after_the_delay() {
    let _guard = init_tracing();
    let harness = harness(topology());
    harness
        .submitter
        .topology_change(None, Some(harness.cm.connections()));
    ensure_v(&harness).await;

    let (continuation, _outcomes) = capture();
    harness
        .submitter
        .submit_client_txn(client_write(6), continuation, Duration::from_millis(30))
        .await
        .unwrap();
    assert_eq!(harness.cm.sender_count(), 0);

    tessera_testing::wait_until(|| harness.cm.sender_count() == 1).await;
    assert_eq!(harness.conns[0].sent().len(), 1);
}
