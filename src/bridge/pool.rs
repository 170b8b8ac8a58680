//! Worker Pool
//!
//! Fixed set of workers sharing one direction's merged queue.

use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::error;

use super::{BridgeWorker, ForwardContext, WorkerStats};
use crate::endpoint::Message;

/// Workers of one direction
pub struct WorkerPool {
    handles: Vec<JoinHandle<WorkerStats>>,
}

impl WorkerPool {
    /// Spawn `workers` workers with ids `1..=workers`
    pub fn spawn(
        workers: usize,
        queue: async_channel::Receiver<Message>,
        context: ForwardContext,
        shutdown: &broadcast::Sender<()>,
    ) -> Self {
        let handles = (1..=workers)
            .map(|id| {
                let worker = BridgeWorker::new(id, queue.clone(), context.clone());
                tokio::spawn(worker.run(shutdown.subscribe()))
            })
            .collect();

        Self { handles }
    }

    /// Number of workers in the pool
    pub fn len(&self) -> usize {
        self.handles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handles.is_empty()
    }

    /// Wait for every worker to stop and sum their counters
    pub async fn join(self) -> WorkerStats {
        let mut total = WorkerStats::default();
        for handle in self.handles {
            match handle.await {
                Ok(stats) => total += stats,
                Err(e) => error!("Bridge worker task failed: {}", e),
            }
        }
        total
    }
}
