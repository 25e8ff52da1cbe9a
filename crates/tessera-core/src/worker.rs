use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use futures::future::try_join_all;
use tokio::sync::Semaphore;
use tracing::debug;

use crate::error::TokenError;
use crate::models::{now_millis, TokenComponent, TokenState};

pub type Chunk = HashMap<String, TokenComponent>;

/// Transformation applied to each chunk on a worker thread.
pub type ChunkStep = fn(Chunk) -> Result<TokenState, TokenError>;

/// Split a payload into disjoint chunks of at most `chunk_size` entries.
///
/// Yields `ceil(len / chunk_size)` chunks whose union is the input.
pub fn partition(tokens: HashMap<String, TokenComponent>, chunk_size: usize) -> Vec<Chunk> {
    let chunk_size = chunk_size.max(1);
    let mut chunks = Vec::with_capacity(tokens.len().div_ceil(chunk_size));
    let mut current = Chunk::with_capacity(chunk_size.min(tokens.len()));

    for (id, component) in tokens {
        current.insert(id, component);
        if current.len() == chunk_size {
            chunks.push(std::mem::take(&mut current));
        }
    }
    if !current.is_empty() {
        chunks.push(current);
    }
    chunks
}

/// Stateless worker step: stamp every entry of one chunk as processed.
pub fn process_chunk(chunk: Chunk) -> Result<TokenState, TokenError> {
    let timestamp = now_millis();
    let mut components = HashMap::with_capacity(chunk.len());

    for (id, mut component) in chunk {
        if component.id != id {
            return Err(TokenError::Processing(format!(
                "entry keyed `{id}` carries id `{}`",
                component.id
            )));
        }
        if component.kind.is_empty() {
            return Err(TokenError::Processing(format!("entry `{id}` has no component type")));
        }
        component.processed = true;
        component.timestamp = timestamp;
        components.insert(id, component);
    }

    Ok(TokenState {
        components,
        timestamp,
    })
}

/// Bounded pool running chunk transformations on blocking threads.
#[derive(Clone)]
pub struct WorkerPool {
    permits: Arc<Semaphore>,
    threads: usize,
    timeout: Option<Duration>,
    step: ChunkStep,
}

impl WorkerPool {
    pub fn new(threads: usize, timeout: Option<Duration>) -> Self {
        let threads = threads.max(1);
        Self {
            permits: Arc::new(Semaphore::new(threads)),
            threads,
            timeout,
            step: process_chunk,
        }
    }

    /// Replace the per-chunk step (defaults to [`process_chunk`]).
    pub fn with_step(mut self, step: ChunkStep) -> Self {
        self.step = step;
        self
    }

    pub fn threads(&self) -> usize {
        self.threads
    }

    /// Worker slots not currently held by a running chunk.
    pub fn available(&self) -> usize {
        self.permits.available_permits()
    }

    /// Run one chunk off the async threads.
    pub async fn process(&self, chunk: Chunk) -> Result<TokenState, TokenError> {
        let permit = self
            .permits
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| TokenError::Processing("worker pool closed".into()))?;

        let len = chunk.len();
        let step = self.step;
        // The slot is released when the blocking task ends, even if the
        // caller stopped waiting on it after a timeout.
        let task = tokio::task::spawn_blocking(move || {
            let _permit = permit;
            step(chunk)
        });
        let joined = match self.timeout {
            Some(limit) => tokio::time::timeout(limit, task).await.map_err(|_| {
                TokenError::Processing(format!("chunk of {len} entries timed out after {limit:?}"))
            })?,
            None => task.await,
        };

        joined.map_err(|e| TokenError::Processing(format!("worker task failed: {e}")))?
    }

    /// Dispatch all chunks concurrently; the first failure fails the batch.
    pub async fn process_all(&self, chunks: Vec<Chunk>) -> Result<Vec<TokenState>, TokenError> {
        debug!(chunks = chunks.len(), threads = self.threads, "dispatching token chunks");
        try_join_all(chunks.into_iter().map(|chunk| self.process(chunk))).await
    }
}
