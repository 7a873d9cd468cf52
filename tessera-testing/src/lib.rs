//! In-memory stand-ins for the coordination core's external collaborators,
//! plus small async test helpers. Used by the end-to-end scenario tests in
//! `tests/`.

#![warn(clippy::pedantic)]

use std::collections::{BTreeMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use bytes::Bytes;

use tessera_core::{BootCount, Message, ReplicaId};
use tessera_dispatch::Executor;
use tessera_paxos::{
    Connection, ConnectionManager, Connections, Disk, DiskCompletion, DiskError, DiskFuture,
    RwHandle, RwWork, Sender, Table,
};

/// Initialize tracing for tests. Call at the start of each test and keep
/// the returned guard alive. Uses `RUST_LOG` for filtering.
#[must_use]
pub fn init_tracing() -> impl Sized {
    use tracing::Dispatch;
    use tracing_subscriber::{EnvFilter, fmt};

    let subscriber = fmt::Subscriber::builder()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| {
            EnvFilter::new("tessera_paxos=debug,tessera_client=debug,tessera_dispatch=debug")
        }))
        .with_test_writer()
        .finish();

    let dispatch = Dispatch::new(subscriber);
    tracing::dispatcher::set_default(&dispatch)
}

/// Enqueue a no-op and wait for it: everything enqueued before has run.
pub async fn flush(exe: &Executor) {
    let (tx, rx) = tokio::sync::oneshot::channel();
    assert!(
        exe.enqueue(move || {
            let _ = tx.send(());
        }),
        "executor is shut down"
    );
    rx.await.expect("executor dropped flush work");
}

/// Poll `cond` until it holds, or panic after five seconds.
///
/// # Panics
///
/// Panics if the condition does not hold within the timeout.
pub async fn wait_until(mut cond: impl FnMut() -> bool) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while !cond() {
        assert!(
            tokio::time::Instant::now() < deadline,
            "condition not reached within timeout"
        );
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

// ---------------------------------------------------------------------------
// Connection manager
// ---------------------------------------------------------------------------

/// Records everything sent to one replica.
pub struct TestConnection {
    replica: ReplicaId,
    boot_count: BootCount,
    sent: Mutex<Vec<Bytes>>,
}

impl TestConnection {
    #[must_use]
    pub fn new(replica: ReplicaId, boot_count: BootCount) -> Arc<Self> {
        Arc::new(Self {
            replica,
            boot_count,
            sent: Mutex::new(Vec::new()),
        })
    }

    #[must_use]
    pub fn replica(&self) -> ReplicaId {
        self.replica
    }

    /// Everything sent so far, decoded.
    ///
    /// # Panics
    ///
    /// Panics if any sent bytes fail to decode.
    #[must_use]
    pub fn sent(&self) -> Vec<Message> {
        self.sent
            .lock()
            .expect("connection lock poisoned")
            .iter()
            .map(|bytes| Message::decode(bytes).expect("sent bytes decode"))
            .collect()
    }

    /// Drain and decode everything sent so far.
    ///
    /// # Panics
    ///
    /// Panics if any sent bytes fail to decode.
    #[must_use]
    pub fn take_sent(&self) -> Vec<Message> {
        let drained: Vec<Bytes> = std::mem::take(&mut *self.sent.lock().expect("lock poisoned"));
        drained
            .iter()
            .map(|bytes| Message::decode(bytes).expect("sent bytes decode"))
            .collect()
    }
}

impl Connection for TestConnection {
    fn send(&self, msg: Bytes) {
        self.sent.lock().expect("connection lock poisoned").push(msg);
    }

    fn boot_count(&self) -> BootCount {
        self.boot_count
    }
}

struct CmInner {
    senders: Vec<Arc<dyn Sender>>,
    connections: Connections,
}

/// In-memory connection registry driving sender callbacks synchronously.
pub struct TestConnectionManager {
    inner: Mutex<CmInner>,
}

impl TestConnectionManager {
    #[must_use]
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            inner: Mutex::new(CmInner {
                senders: Vec::new(),
                connections: BTreeMap::new(),
            }),
        })
    }

    /// (Re-)establish a connection and notify every registered sender.
    pub fn establish(&self, replica: ReplicaId, connection: Arc<dyn Connection>) {
        let (senders, connections) = {
            let mut inner = self.inner.lock().expect("cm lock poisoned");
            inner.connections.insert(replica, connection.clone());
            (inner.senders.clone(), inner.connections.clone())
        };
        for sender in senders {
            sender.connection_established(replica, &connection, &connections);
        }
    }

    /// Drop a connection and notify every registered sender.
    pub fn lose(&self, replica: ReplicaId) {
        let (senders, connections) = {
            let mut inner = self.inner.lock().expect("cm lock poisoned");
            inner.connections.remove(&replica);
            (inner.senders.clone(), inner.connections.clone())
        };
        for sender in senders {
            sender.connection_lost(replica, &connections);
        }
    }

    #[must_use]
    pub fn sender_count(&self) -> usize {
        self.inner.lock().expect("cm lock poisoned").senders.len()
    }

    /// Snapshot of the current connections.
    #[must_use]
    pub fn connections(&self) -> Connections {
        self.inner
            .lock()
            .expect("cm lock poisoned")
            .connections
            .clone()
    }
}

impl ConnectionManager for TestConnectionManager {
    fn add_sender(&self, sender: Arc<dyn Sender>) {
        let connections = {
            let mut inner = self.inner.lock().expect("cm lock poisoned");
            inner.senders.push(sender.clone());
            inner.connections.clone()
        };
        // Outside the lock: the callback may re-enter to deregister.
        sender.connected_replicas(&connections);
    }

    fn remove_sender_sync(&self, sender: &Arc<dyn Sender>) {
        self.inner
            .lock()
            .expect("cm lock poisoned")
            .senders
            .retain(|s| !Arc::ptr_eq(s, sender));
    }

    fn remove_sender_async(&self, sender: &Arc<dyn Sender>) {
        self.remove_sender_sync(sender);
    }
}

// ---------------------------------------------------------------------------
// Disk
// ---------------------------------------------------------------------------

struct MemoryDiskInner {
    data: Mutex<BTreeMap<Vec<u8>, Vec<u8>>>,
    held: Mutex<Option<VecDeque<(DiskCompletion, Result<(), DiskError>)>>>,
    puts: AtomicUsize,
    dels: AtomicUsize,
    fail_next: AtomicBool,
}

/// In-memory [`Disk`] with optional completion gating and failure
/// injection.
///
/// Transactions apply immediately (preserving write order); with
/// [`hold_completions`](MemoryDisk::hold_completions) the futures resolve
/// only when released, so tests can interleave events between a write being
/// scheduled and its completion being observed.
#[derive(Clone)]
pub struct MemoryDisk {
    inner: Arc<MemoryDiskInner>,
}

impl MemoryDisk {
    #[must_use]
    pub fn new() -> Self {
        Self {
            inner: Arc::new(MemoryDiskInner {
                data: Mutex::new(BTreeMap::new()),
                held: Mutex::new(None),
                puts: AtomicUsize::new(0),
                dels: AtomicUsize::new(0),
                fail_next: AtomicBool::new(false),
            }),
        }
    }

    /// Stop resolving futures until [`release_next`](Self::release_next).
    pub fn hold_completions(&self) {
        *self.inner.held.lock().expect("disk lock poisoned") = Some(VecDeque::new());
    }

    /// Resolve the oldest held completion. Returns `false` if none is held.
    pub fn release_next(&self) -> bool {
        let next = self
            .inner
            .held
            .lock()
            .expect("disk lock poisoned")
            .as_mut()
            .and_then(VecDeque::pop_front);
        match next {
            Some((completion, result)) => {
                completion.complete(result);
                true
            }
            None => false,
        }
    }

    /// Make the next transaction fail without applying.
    pub fn fail_next(&self) {
        self.inner.fail_next.store(true, Ordering::SeqCst);
    }

    /// Seed a record, as if persisted before a restart.
    pub fn insert(&self, key: &[u8], value: &[u8]) {
        self.inner
            .data
            .lock()
            .expect("disk lock poisoned")
            .insert(key.to_vec(), value.to_vec());
    }

    #[must_use]
    pub fn contains(&self, key: &[u8]) -> bool {
        self.inner
            .data
            .lock()
            .expect("disk lock poisoned")
            .contains_key(key)
    }

    #[must_use]
    pub fn put_count(&self) -> usize {
        self.inner.puts.load(Ordering::SeqCst)
    }

    #[must_use]
    pub fn del_count(&self) -> usize {
        self.inner.dels.load(Ordering::SeqCst)
    }
}

impl Default for MemoryDisk {
    fn default() -> Self {
        Self::new()
    }
}

struct MemoryRwHandle<'a> {
    data: &'a mut BTreeMap<Vec<u8>, Vec<u8>>,
    inner: &'a MemoryDiskInner,
}

impl RwHandle for MemoryRwHandle<'_> {
    fn put(&mut self, _table: Table, key: &[u8], value: &[u8]) -> Result<(), DiskError> {
        self.inner.puts.fetch_add(1, Ordering::SeqCst);
        self.data.insert(key.to_vec(), value.to_vec());
        Ok(())
    }

    fn del(&mut self, _table: Table, key: &[u8]) -> Result<(), DiskError> {
        self.inner.dels.fetch_add(1, Ordering::SeqCst);
        self.data.remove(key);
        Ok(())
    }
}

impl Disk for MemoryDisk {
    fn read_write_transaction(&self, _sync: bool, work: RwWork) -> DiskFuture {
        let (completion, future) = DiskFuture::channel();
        let result = if self.inner.fail_next.swap(false, Ordering::SeqCst) {
            Err(DiskError::Io(std::io::Error::other("injected failure")))
        } else {
            let mut data = self.inner.data.lock().expect("disk lock poisoned");
            let mut handle = MemoryRwHandle {
                data: &mut data,
                inner: &self.inner,
            };
            work(&mut handle)
        };
        let mut held = self.inner.held.lock().expect("disk lock poisoned");
        match held.as_mut() {
            Some(queue) => queue.push_back((completion, result)),
            None => completion.complete(result),
        }
        future
    }
}
