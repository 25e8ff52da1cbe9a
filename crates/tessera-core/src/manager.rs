use std::collections::HashMap;
use std::sync::Arc;

use tracing::{debug, info, warn};

use crate::config::TokenConfig;
use crate::error::TokenError;
use crate::models::{TokenComponent, TokenComponentInput, TokenState};
use crate::scheduler::{SchedulerStats, UpdateScheduler};
use crate::store::TokenStore;
use crate::validation::validate_component;
use crate::worker::{partition, WorkerPool};

pub use crate::scheduler::Subscription;

/// Open the configured store and build the manager.
///
/// Meant to be called once by the application's composition root; the
/// returned handle is then passed (or cloned) to whoever needs it.
pub async fn initialize_token_system(config: &TokenConfig) -> Result<TokenManager, TokenError> {
    let db_path = config.ensure_db_path()?;
    let store = TokenStore::open(&db_path, config.store.write_mode)?;
    info!(path = %db_path.display(), "token system initialized");
    TokenManager::new(config, store)
}

/// Orchestrates chunked processing, write-through persistence and
/// coalesced fan-out to subscribers.
///
/// Cloning is cheap; clones share the same store, pool and scheduler.
#[derive(Clone)]
pub struct TokenManager {
    inner: Arc<Inner>,
}

struct Inner {
    store: TokenStore,
    pool: WorkerPool,
    scheduler: UpdateScheduler,
    chunk_size: usize,
}

impl TokenManager {
    /// Build a manager over an already opened store. Must be called from
    /// within a tokio runtime.
    pub fn new(config: &TokenConfig, store: TokenStore) -> Result<Self, TokenError> {
        let workers = &config.workers;
        let pool = WorkerPool::new(workers.effective_threads(), workers.timeout());
        Self::with_pool(config, store, pool)
    }

    /// Build a manager that runs chunks on the given pool instead of one
    /// sized from `config.workers`.
    pub fn with_pool(
        config: &TokenConfig,
        store: TokenStore,
        pool: WorkerPool,
    ) -> Result<Self, TokenError> {
        let scheduler = UpdateScheduler::spawn(config.scheduler.frame_interval())?;
        Ok(Self {
            inner: Arc::new(Inner {
                store,
                pool,
                scheduler,
                chunk_size: config.workers.chunk_size.max(1),
            }),
        })
    }

    /// Validate, process and merge a token payload.
    ///
    /// On success the merged state has been written through to the store and
    /// handed to the scheduler. On failure neither happens for this payload.
    pub async fn process_tokens(
        &self,
        tokens: HashMap<String, TokenComponentInput>,
    ) -> Result<TokenState, TokenError> {
        for (id, input) in &tokens {
            validate_component(id, input)?;
        }

        let total = tokens.len();
        let components: HashMap<String, TokenComponent> = tokens
            .into_iter()
            .map(|(id, input)| {
                let component = TokenComponent::pending(id.clone(), input);
                (id, component)
            })
            .collect();
        let ids: Vec<String> = components.keys().cloned().collect();

        let chunks = partition(components, self.inner.chunk_size);
        debug!(tokens = total, chunks = chunks.len(), "processing token payload");

        self.inner.scheduler.mark_pending(ids.clone());
        let results = match self.inner.pool.process_all(chunks).await {
            Ok(results) => results,
            Err(e) => {
                warn!("token batch failed: {e}");
                self.inner.scheduler.abandon(ids);
                return Err(e);
            }
        };

        let mut merged = TokenState::empty();
        for result in results {
            merged.merge(result);
        }

        self.publish(merged.clone(), ids).await;
        Ok(merged)
    }

    /// Read cached tokens for the given component types.
    ///
    /// A miss or an unreadable store yields an empty state, never an error.
    pub async fn get_tokens<I, S>(&self, component_types: I) -> TokenState
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let types: Vec<String> = component_types.into_iter().map(Into::into).collect();
        match self.inner.store.get_tokens(types).await {
            Ok(Some(components)) => TokenState::new(components),
            Ok(None) => TokenState::empty(),
            Err(e) => {
                warn!("token store read failed, using defaults: {e}");
                TokenState::empty()
            }
        }
    }

    /// Push cached tokens for the given types to existing subscribers.
    pub async fn preload_tokens<I, S>(&self, component_types: I)
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let cached = self.get_tokens(component_types).await;
        if cached.is_empty() {
            debug!("nothing cached to preload");
            return;
        }
        debug!(tokens = cached.len(), "preloading cached tokens");
        self.inner.scheduler.update(cached);
    }

    /// Receive every flushed snapshot for `component_type`.
    pub fn subscribe<F>(&self, component_type: impl Into<String>, callback: F) -> Subscription
    where
        F: Fn(&TokenState) + Send + 'static,
    {
        self.inner
            .scheduler
            .subscribe(component_type, Box::new(callback))
    }

    /// Deliver any scheduled flush immediately. Returns whether one ran.
    pub async fn flush(&self) -> bool {
        self.inner.scheduler.flush_now().await
    }

    /// Wipe the durable cache. Live subscribers keep their last values.
    pub async fn clear_cache(&self) -> Result<(), TokenError> {
        self.inner.store.clear().await
    }

    pub async fn stats(&self) -> SchedulerStats {
        self.inner.scheduler.stats().await
    }

    pub fn store(&self) -> &TokenStore {
        &self.inner.store
    }

    /// Write through to the store, then schedule notification and release
    /// the batch's pending ids. A failed write is logged; subscribers are
    /// still notified.
    async fn publish(&self, state: TokenState, ids: Vec<String>) {
        if let Err(e) = self.inner.store.set_tokens(state.components.clone()).await {
            warn!("token store write failed, continuing without persistence: {e}");
        }
        self.inner.scheduler.resolve(state, ids);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::WriteMode;
    use crate::storage::Storage;
    use crate::worker::{process_chunk, Chunk, ChunkStep};
    use serde_json::json;
    use std::sync::Mutex;
    use std::time::Duration;

    fn config(chunk_size: usize) -> TokenConfig {
        let mut config = TokenConfig::default();
        config.workers.chunk_size = chunk_size;
        config.workers.threads = 2;
        config.scheduler.frame_interval_ms = 60_000;
        config
    }

    fn manager(chunk_size: usize) -> TokenManager {
        let store = TokenStore::open_memory(WriteMode::Merge).unwrap();
        TokenManager::new(&config(chunk_size), store).unwrap()
    }

    fn manager_with_step(step: ChunkStep, timeout: Option<Duration>) -> TokenManager {
        let store = TokenStore::open_memory(WriteMode::Merge).unwrap();
        let pool = WorkerPool::new(2, timeout).with_step(step);
        TokenManager::with_pool(&config(2), store, pool).unwrap()
    }

    fn broken_store_manager() -> TokenManager {
        let storage = Storage::open_memory(WriteMode::Merge).unwrap();
        storage.break_schema().unwrap();
        let store = TokenStore::spawn(storage).unwrap();
        TokenManager::new(&config(1000), store).unwrap()
    }

    fn failing_step(_: Chunk) -> Result<TokenState, TokenError> {
        Err(TokenError::Processing("worker crashed".into()))
    }

    fn slow_step(chunk: Chunk) -> Result<TokenState, TokenError> {
        std::thread::sleep(Duration::from_millis(200));
        process_chunk(chunk)
    }

    fn counter(m: &TokenManager, kind: &str) -> Arc<Mutex<Vec<TokenState>>> {
        let inbox: Arc<Mutex<Vec<TokenState>>> = Arc::default();
        let sink = inbox.clone();
        let _sub = m.subscribe(kind, move |s| sink.lock().unwrap().push(s.clone()));
        inbox
    }

    fn input(kind: &str, v: i64) -> TokenComponentInput {
        TokenComponentInput::new(
            kind,
            json!({ "radius": { "value": format!("{v}px"), "type": "size", "category": "shape" } }),
        )
    }

    #[tokio::test]
    async fn test_process_marks_everything_processed() {
        let m = manager(3);
        let payload: HashMap<_, _> = (0..10).map(|i| (format!("t{i}"), input("button", i))).collect();
        let state = m.process_tokens(payload).await.unwrap();
        assert_eq!(state.len(), 10);
        assert!(state.components.values().all(|c| c.processed && c.timestamp > 0));
    }

    #[tokio::test]
    async fn test_validation_error_commits_nothing() {
        let m = manager(1000);
        let payload = HashMap::from([
            ("ok".to_string(), input("button", 1)),
            (
                "bad".to_string(),
                TokenComponentInput::new("button", json!({ "v": { "value": "1", "type": "nope", "category": "x" } })),
            ),
        ]);
        let err = m.process_tokens(payload).await.unwrap_err();
        assert!(matches!(err, TokenError::Validation { ref id, .. } if id == "bad"));
        assert!(m.get_tokens(["button"]).await.is_empty());
        assert!(!m.flush().await);
    }

    #[tokio::test]
    async fn test_preload_empty_store_is_quiet() {
        let m = manager(1000);
        let received = Arc::new(Mutex::new(0));
        let counter = received.clone();
        let _sub = m.subscribe("button", move |_| *counter.lock().unwrap() += 1);

        m.preload_tokens(["button"]).await;
        assert!(!m.flush().await);
        assert_eq!(*received.lock().unwrap(), 0);
    }

    #[tokio::test]
    async fn test_stats_track_pending_and_processed() {
        let m = manager(1000);
        m.process_tokens(HashMap::from([("a".to_string(), input("table", 1))]))
            .await
            .unwrap();
        let stats = m.stats().await;
        assert_eq!(stats.pending, 0);
        assert_eq!(stats.tracked, 1);
        assert_eq!(stats.updates_absorbed, 1);
    }

    #[tokio::test]
    async fn test_clones_share_state() {
        let m = manager(1000);
        let other = m.clone();
        other
            .process_tokens(HashMap::from([("a".to_string(), input("table", 1))]))
            .await
            .unwrap();
        assert_eq!(m.get_tokens(["table"]).await.len(), 1);
        tokio::time::timeout(Duration::from_secs(1), m.flush())
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_worker_failure_commits_nothing() {
        let m = manager_with_step(failing_step, None);
        let inbox = counter(&m, "button");
        let payload: HashMap<_, _> = (0..5).map(|i| (format!("t{i}"), input("button", i))).collect();

        let err = m.process_tokens(payload).await.unwrap_err();
        assert!(matches!(err, TokenError::Processing(ref msg) if msg == "worker crashed"));
        assert!(m.get_tokens(["button"]).await.is_empty());
        assert!(!m.flush().await);
        assert!(inbox.lock().unwrap().is_empty());

        let stats = m.stats().await;
        assert_eq!(stats.pending, 0);
        assert_eq!(stats.tracked, 0);
    }

    #[tokio::test]
    async fn test_chunk_timeout_fails_batch() {
        let m = manager_with_step(slow_step, Some(Duration::from_millis(1)));
        let err = m
            .process_tokens(HashMap::from([("a".to_string(), input("button", 1))]))
            .await
            .unwrap_err();
        assert!(matches!(err, TokenError::Processing(ref msg) if msg.contains("timed out")));
        assert!(m.get_tokens(["button"]).await.is_empty());
        assert!(!m.flush().await);
        assert_eq!(m.stats().await.pending, 0);
    }

    #[tokio::test]
    async fn test_broken_store_degrades_to_memory() {
        let m = broken_store_manager();
        let inbox = counter(&m, "button");

        assert!(m.get_tokens(["button"]).await.is_empty());
        let state = m
            .process_tokens(HashMap::from([("a".to_string(), input("button", 1))]))
            .await
            .unwrap();
        assert_eq!(state.len(), 1);
        assert!(m.get_tokens(["button"]).await.is_empty());

        assert!(m.flush().await);
        let inbox = inbox.lock().unwrap();
        assert_eq!(inbox.len(), 1);
        assert!(inbox[0].components.contains_key("a"));
    }

    #[tokio::test]
    async fn test_overlapping_batches_settle_pending() {
        let m = manager(1000);
        let payload = HashMap::from([("a".to_string(), input("button", 1))]);
        let (first, second) = tokio::join!(
            m.process_tokens(payload.clone()),
            m.process_tokens(payload)
        );
        first.unwrap();
        second.unwrap();
        assert_eq!(m.stats().await.pending, 0);
    }
}
