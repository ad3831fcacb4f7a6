//! Converts the producer queue's stream of single items into a stream of
//! right-sized batches, committing a batch whenever enough items are
//! waiting or enough time has passed since the last commit.

use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use async_stream::stream;
use tokio_stream::Stream;

use crate::queue::MessageQueue;

const CHUNK_COMMIT_INTERVAL: Duration = Duration::from_secs(5);

/// How a queue is carved into batches: commit on `max_chunk_size` items or
/// on `min_chunking_interval` elapsed, whichever happens first.
#[derive(Clone, Copy, Debug)]
pub struct ChunkingPolicy {
    pub max_chunk_size: usize,
    pub min_chunking_interval: Duration,
}

impl ChunkingPolicy {
    /// The policy for a dispatch pipeline that sends `batch_size` records
    /// per request over `max_concurrency` parallel requests: one chunk
    /// feeds one round of requests.
    pub fn for_dispatch(batch_size: usize, max_concurrency: usize) -> Self {
        Self {
            max_chunk_size: batch_size.max(1) * max_concurrency.max(1),
            min_chunking_interval: CHUNK_COMMIT_INTERVAL,
        }
    }
}

/// A stream of non-empty batches drained from a queue. The stream ends
/// once the queue is closed and fully drained; until then a batch is
/// yielded whenever the policy's size or time trigger fires with items
/// waiting.
pub fn chunks<T, Q>(queue: Arc<Q>, policy: ChunkingPolicy) -> Pin<Box<dyn Stream<Item = Vec<T>> + Send>>
where
    T: Send + 'static,
    Q: MessageQueue<T> + ?Sized + 'static,
{
    Box::pin(stream!({
        loop {
            if queue.is_closed_and_empty() {
                break;
            }
            let batch = queue
                .take_batch(policy.max_chunk_size, policy.min_chunking_interval)
                .await;
            if !batch.is_empty() {
                yield batch;
            }
        }
    }))
}
