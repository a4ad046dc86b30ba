//! Bounded-parallelism frame handling that preserves per-repository order.
//!
//! A fixed pool of workers each owns a bounded mailbox; the producer routes
//! by hashed key, so all work sharing a key lands on the same worker in
//! submission order. A full mailbox backpressures the producer.

use std::future::Future;
use std::hash::{DefaultHasher, Hash, Hasher};

use tokio::sync::mpsc;
use tokio::task::JoinHandle;

pub const DEFAULT_WORKERS: usize = 10;
pub const DEFAULT_QUEUE_DEPTH: usize = 100;

#[derive(Debug, thiserror::Error)]
#[error("scheduler is shut down")]
pub struct Closed;

pub struct Scheduler<T> {
    senders: Vec<mpsc::Sender<T>>,
    workers: Vec<JoinHandle<()>>,
}

impl<T: Send + 'static> Scheduler<T> {
    pub fn new<F, Fut>(workers: usize, depth: usize, handler: F) -> Self
    where
        F: Fn(T) -> Fut + Clone + Send + 'static,
        Fut: Future<Output = ()> + Send,
    {
        let workers = workers.max(1);
        let depth = depth.max(1);

        let mut senders = Vec::with_capacity(workers);
        let mut handles = Vec::with_capacity(workers);
        for _ in 0..workers {
            let (tx, mut rx) = mpsc::channel::<T>(depth);
            let handler = handler.clone();
            handles.push(tokio::spawn(async move {
                while let Some(item) = rx.recv().await {
                    handler(item).await;
                }
            }));
            senders.push(tx);
        }

        Self { senders, workers: handles }
    }

    /// Submits an item for the given key, waiting if the target worker's
    /// mailbox is full.
    pub async fn submit(&self, key: &str, item: T) -> Result<(), Closed> {
        let mut hasher = DefaultHasher::new();
        key.hash(&mut hasher);
        let idx = (hasher.finish() % self.senders.len() as u64) as usize;
        self.senders[idx].send(item).await.map_err(|_| Closed)
    }

    /// Stops accepting work and waits for every worker to drain its mailbox.
    pub async fn shutdown(self) {
        drop(self.senders);
        for worker in self.workers {
            let _ = worker.await;
        }
    }
}
