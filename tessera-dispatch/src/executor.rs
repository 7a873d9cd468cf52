//! Executor and dispatcher implementation.

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::debug;

/// A deferred computation accepted by an [`Executor`].
pub type Work = Box<dyn FnOnce() + Send + 'static>;

enum Item {
    Apply(Work),
    Shutdown,
}

/// Handle to an unbounded, FIFO, single-consumer work queue.
///
/// Cloning the handle clones the producer side only; all clones feed the
/// same worker.
#[derive(Clone)]
pub struct Executor {
    tx: mpsc::UnboundedSender<Item>,
}

impl Executor {
    /// Spawn a new executor and its worker task.
    #[must_use]
    pub fn spawn() -> (Self, JoinHandle<()>) {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let worker = tokio::spawn(async move {
            while let Some(item) = rx.recv().await {
                match item {
                    Item::Apply(work) => work(),
                    Item::Shutdown => break,
                }
            }
            debug!("executor worker exited");
        });
        (Self { tx }, worker)
    }

    /// Enqueue a work item.
    ///
    /// Returns `true` if the work was accepted. Returns `false` only once
    /// the executor has been shut down; the work is dropped in that case.
    pub fn enqueue(&self, work: impl FnOnce() + Send + 'static) -> bool {
        self.tx.send(Item::Apply(Box::new(work))).is_ok()
    }

    fn send_shutdown(&self) -> bool {
        self.tx.send(Item::Shutdown).is_ok()
    }
}

/// A fixed-size array of executors, sharded by a stable key.
pub struct Dispatcher {
    executors: Vec<Executor>,
    workers: Vec<JoinHandle<()>>,
}

impl Dispatcher {
    /// Spawn `count` executors.
    ///
    /// # Panics
    ///
    /// Panics if `count` is zero.
    #[must_use]
    pub fn new(count: usize) -> Self {
        assert!(count > 0, "dispatcher needs at least one executor");
        let (executors, workers): (Vec<_>, Vec<_>) =
            (0..count).map(|_| Executor::spawn()).unzip();
        Self { executors, workers }
    }

    #[must_use]
    pub fn executor_count(&self) -> usize {
        self.executors.len()
    }

    /// The executor responsible for `key`. The same key always maps to the
    /// same executor.
    #[must_use]
    pub fn executor_for(&self, key: u64) -> &Executor {
        let idx = usize::try_from(key % self.executors.len() as u64).expect("index fits usize");
        &self.executors[idx]
    }

    /// Shut down every executor: submit the shutdown sentinel and wait for
    /// each worker to exit. Works enqueued before the sentinel still run.
    pub async fn shutdown(self) {
        for exe in &self.executors {
            exe.send_shutdown();
        }
        for worker in self.workers {
            let _ = worker.await;
        }
    }
}
