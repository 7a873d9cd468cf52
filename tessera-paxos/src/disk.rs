//! Durable-store collaborator.
//!
//! The on-disk key-value store is external; the acceptor only needs a
//! durable map with future-based read-write transactions. [`DiskFuture`]s
//! must be awaited off the owning executor (the manager spawns a task per
//! write and posts the completion back as a fresh work item).

use std::fmt;
use std::path::Path;
use std::sync::Arc;

use fjall::{Database, Keyspace, KeyspaceCreateOptions, PersistMode};
use tokio::sync::oneshot;
use tracing::trace;

/// Tables used by the coordination core.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Table {
    /// Durable acceptor records, keyed by the 16-byte `TxnId`.
    BallotOutcomes,
}

impl Table {
    #[must_use]
    pub fn name(self) -> &'static str {
        match self {
            Table::BallotOutcomes => "ballot_outcomes",
        }
    }
}

#[derive(Debug)]
pub enum DiskError {
    Io(std::io::Error),
    Store(fjall::Error),
    /// The disk worker dropped the completion without reporting a result.
    Lost,
}

impl fmt::Display for DiskError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DiskError::Io(e) => write!(f, "IO error: {e}"),
            DiskError::Store(e) => write!(f, "store error: {e}"),
            DiskError::Lost => f.write_str("disk worker dropped the completion"),
        }
    }
}

impl std::error::Error for DiskError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            DiskError::Io(e) => Some(e),
            DiskError::Store(e) => Some(e),
            DiskError::Lost => None,
        }
    }
}

impl From<std::io::Error> for DiskError {
    fn from(e: std::io::Error) -> Self {
        DiskError::Io(e)
    }
}

impl From<fjall::Error> for DiskError {
    fn from(e: fjall::Error) -> Self {
        DiskError::Store(e)
    }
}

/// Read-write handle passed to a transaction body.
pub trait RwHandle {
    /// # Errors
    ///
    /// Returns an error if the write cannot be applied.
    fn put(&mut self, table: Table, key: &[u8], value: &[u8]) -> Result<(), DiskError>;

    /// # Errors
    ///
    /// Returns an error if the delete cannot be applied.
    fn del(&mut self, table: Table, key: &[u8]) -> Result<(), DiskError>;
}

/// A deferred read-write transaction body.
pub type RwWork = Box<dyn FnOnce(&mut dyn RwHandle) -> Result<(), DiskError> + Send + 'static>;

/// The durable map.
pub trait Disk: Send + Sync + 'static {
    /// Schedule `work` as a read-write transaction. The returned future
    /// resolves once the transaction is durable (`sync`) or at least
    /// applied (`!sync`).
    fn read_write_transaction(&self, sync: bool, work: RwWork) -> DiskFuture;
}

/// Single-shot handle to a disk transaction's completion.
pub struct DiskFuture {
    rx: oneshot::Receiver<Result<(), DiskError>>,
}

/// Producer half of a [`DiskFuture`].
pub struct DiskCompletion {
    tx: oneshot::Sender<Result<(), DiskError>>,
}

impl DiskCompletion {
    pub fn complete(self, result: Result<(), DiskError>) {
        let _ = self.tx.send(result);
    }
}

impl DiskFuture {
    #[must_use]
    pub fn channel() -> (DiskCompletion, DiskFuture) {
        let (tx, rx) = oneshot::channel();
        (DiskCompletion { tx }, DiskFuture { rx })
    }

    /// Await the transaction's result. Usable once, from any task.
    ///
    /// # Errors
    ///
    /// Returns the transaction's error, or [`DiskError::Lost`] if the worker
    /// died without reporting.
    pub async fn result(self) -> Result<(), DiskError> {
        self.rx.await.unwrap_or(Err(DiskError::Lost))
    }
}

// ---------------------------------------------------------------------------
// Fjall-backed implementation
// ---------------------------------------------------------------------------

struct FjallDiskInner {
    db: Database,
    ballot_outcomes: Keyspace,
}

/// Production [`Disk`] over a fjall database.
///
/// Transaction bodies run on a blocking worker. Every transaction persists
/// with `PersistMode::SyncAll` regardless of the `sync` flag: an acceptor
/// must never announce an outcome that is not durable, so a completed
/// future has to mean the bytes are synced.
#[derive(Clone)]
pub struct FjallDisk {
    inner: Arc<FjallDiskInner>,
}

impl FjallDisk {
    /// # Errors
    ///
    /// Returns an error if the database cannot be opened.
    pub async fn open(path: impl AsRef<Path>) -> Result<Self, DiskError> {
        let path = path.as_ref().to_owned();
        tokio::task::spawn_blocking(move || Self::open_sync(&path))
            .await
            .expect("spawn_blocking panicked")
    }

    fn open_sync(path: &Path) -> Result<Self, DiskError> {
        let db = Database::builder(path).open()?;
        let ballot_outcomes =
            db.keyspace(Table::BallotOutcomes.name(), KeyspaceCreateOptions::default)?;
        Ok(Self {
            inner: Arc::new(FjallDiskInner {
                db,
                ballot_outcomes,
            }),
        })
    }
}

struct FjallRwHandle<'a> {
    inner: &'a FjallDiskInner,
}

impl RwHandle for FjallRwHandle<'_> {
    fn put(&mut self, table: Table, key: &[u8], value: &[u8]) -> Result<(), DiskError> {
        match table {
            Table::BallotOutcomes => self.inner.ballot_outcomes.insert(key, value)?,
        }
        Ok(())
    }

    fn del(&mut self, table: Table, key: &[u8]) -> Result<(), DiskError> {
        match table {
            Table::BallotOutcomes => self.inner.ballot_outcomes.remove(key)?,
        }
        Ok(())
    }
}

impl Disk for FjallDisk {
    fn read_write_transaction(&self, sync: bool, work: RwWork) -> DiskFuture {
        let (completion, future) = DiskFuture::channel();
        let inner = self.inner.clone();
        trace!(sync, "scheduling disk transaction");
        tokio::task::spawn_blocking(move || {
            let mut handle = FjallRwHandle { inner: &inner };
            let result = work(&mut handle)
                .and_then(|()| inner.db.persist(PersistMode::SyncAll).map_err(DiskError::Store));
            completion.complete(result);
        });
        future
    }
}
