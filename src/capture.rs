//! Transaction capture pipeline
//!
//! Exchanges are queued on a bounded channel and written to the store by a
//! background worker, so store latency never reaches the client path. When
//! the queue is full the transaction is dropped and logged.

use crate::database::TransactionStore;
use crate::model::Transaction;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, warn};

/// Default number of transactions waiting for the store
pub const DEFAULT_QUEUE_CAPACITY: usize = 1024;

/// Handle used by the proxy to submit captured transactions
#[derive(Clone)]
pub struct Capture {
    tx: mpsc::Sender<Transaction>,
    dropped: Arc<AtomicU64>,
}

impl Capture {
    /// Start the background writer for `store`
    pub fn spawn(store: Arc<dyn TransactionStore>, capacity: usize) -> (Self, JoinHandle<()>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        let worker = tokio::spawn(run_worker(store, rx));
        (
            Self {
                tx,
                dropped: Arc::new(AtomicU64::new(0)),
            },
            worker,
        )
    }

    /// Queue a transaction without waiting for the store
    pub fn submit(&self, transaction: Transaction) {
        match self.tx.try_send(transaction) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(transaction)) => {
                self.dropped.fetch_add(1, Ordering::Relaxed);
                warn!(
                    "Capture queue full, dropping {} {}{}",
                    transaction.request.method, transaction.request.host, transaction.request.path
                );
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                self.dropped.fetch_add(1, Ordering::Relaxed);
                error!("Capture worker stopped, transaction dropped");
            }
        }
    }

    /// Transactions dropped because the queue was full or closed
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

async fn run_worker(store: Arc<dyn TransactionStore>, mut rx: mpsc::Receiver<Transaction>) {
    while let Some(transaction) = rx.recv().await {
        let store = store.clone();
        let result = tokio::task::spawn_blocking(move || store.create(transaction)).await;

        match result {
            Ok(Ok(stored)) => debug!(
                "Stored transaction {}",
                stored.id.as_deref().unwrap_or("-")
            ),
            Ok(Err(e)) => error!("Failed to store transaction: {}", e),
            Err(e) => error!("Store task failed: {}", e),
        }
    }
    debug!("Capture worker finished");
}
