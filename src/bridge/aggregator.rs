//! Subscription Aggregator
//!
//! Fan-in of the per-topic subscription streams of one endpoint into a
//! single queue. Every input is drained by its own forwarding task; the
//! tasks share a completion counter and the last one to finish closes the
//! queue, so consumers see the end only after every input has ended.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::debug;

use super::shutdown_signalled;
use crate::endpoint::{Message, MessageStream};

/// Capacity of the merged queue; a forwarding task waits until a worker
/// has taken the previous message
pub const MERGED_QUEUE_CAPACITY: usize = 1;

/// Output of [`SubscriptionAggregator::merge`]
pub struct MergedQueue {
    /// Multi-consumer end shared by the workers of one direction
    pub receiver: async_channel::Receiver<Message>,
    /// One forwarding task per input stream
    pub tasks: Vec<JoinHandle<()>>,
}

/// Merges subscription streams into one queue
pub struct SubscriptionAggregator;

impl SubscriptionAggregator {
    /// Spawn one forwarding task per stream and return the merged queue.
    ///
    /// Order within one stream is preserved; order across streams is
    /// whichever arrives first. With no inputs the queue starts closed.
    pub fn merge(streams: Vec<MessageStream>, shutdown: &broadcast::Sender<()>) -> MergedQueue {
        let (tx, rx) = async_channel::bounded(MERGED_QUEUE_CAPACITY);

        if streams.is_empty() {
            tx.close();
            return MergedQueue {
                receiver: rx,
                tasks: Vec::new(),
            };
        }

        let remaining = Arc::new(AtomicUsize::new(streams.len()));
        let tasks = streams
            .into_iter()
            .map(|stream| {
                let tx = tx.clone();
                let remaining = remaining.clone();
                let shutdown_rx = shutdown.subscribe();
                tokio::spawn(forward(stream, tx, remaining, shutdown_rx))
            })
            .collect();

        MergedQueue {
            receiver: rx,
            tasks,
        }
    }
}

async fn forward(
    mut stream: MessageStream,
    tx: async_channel::Sender<Message>,
    remaining: Arc<AtomicUsize>,
    mut shutdown_rx: broadcast::Receiver<()>,
) {
    loop {
        tokio::select! {
            biased;

            _ = shutdown_signalled(&mut shutdown_rx) => {
                debug!("Subscription {}: stopping on shutdown", stream.filter());
                break;
            }
            message = stream.recv() => {
                let Some(message) = message else {
                    debug!("Subscription {}: stream ended", stream.filter());
                    break;
                };

                tokio::select! {
                    biased;

                    _ = shutdown_signalled(&mut shutdown_rx) => {
                        debug!("Subscription {}: stopping on shutdown", stream.filter());
                        break;
                    }
                    result = tx.send(message) => {
                        if result.is_err() {
                            debug!("Subscription {}: queue closed", stream.filter());
                            break;
                        }
                    }
                }
            }
        }
    }

    // Last forwarding task closes the queue
    if remaining.fetch_sub(1, Ordering::AcqRel) == 1 {
        tx.close();
    }
}
