use std::collections::HashMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, oneshot};
use tokio::time::Instant;
use tracing::{debug, error, trace};

use crate::error::TokenError;
use crate::models::{now_millis, TokenComponent, TokenState};

/// Subscriber callback. Receives snapshots filtered to its component type.
pub type Callback = Box<dyn Fn(&TokenState) + Send + 'static>;

/// Scheduler counters, used for diagnostics and coalescing checks.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SchedulerStats {
    pub updates_absorbed: u64,
    pub flushes: u64,
    pub notifications: u64,
    pub pending: usize,
    pub tracked: usize,
    pub subscribers: usize,
}

/// Working memory: ids awaiting processing and the latest value per id.
///
/// `pending` counts in-flight batches per id, so one batch giving up on an id
/// does not clear it while another batch is still processing it.
#[derive(Debug, Default)]
pub(crate) struct VirtualTokenState {
    pending: HashMap<String, usize>,
    processed: HashMap<String, TokenComponent>,
}

impl VirtualTokenState {
    fn mark_pending(&mut self, ids: Vec<String>) {
        for id in ids {
            *self.pending.entry(id).or_default() += 1;
        }
    }

    /// Release one in-flight claim on each id.
    fn settle(&mut self, ids: &[String]) {
        for id in ids {
            if let Some(count) = self.pending.get_mut(id) {
                *count -= 1;
                if *count == 0 {
                    self.pending.remove(id);
                }
            }
        }
    }

    /// Overwrite `processed` with each incoming entry.
    fn absorb(&mut self, state: TokenState) {
        self.processed.extend(state.components);
    }

    fn subset(&self, kind: &str, timestamp: i64) -> TokenState {
        let components = self
            .processed
            .iter()
            .filter(|(_, c)| c.kind == kind)
            .map(|(id, c)| (id.clone(), c.clone()))
            .collect();
        TokenState {
            components,
            timestamp,
        }
    }
}

/// Coalescing fan-out: buffers updates and notifies subscribers once per flush.
pub(crate) struct Dispatcher {
    state: VirtualTokenState,
    subscribers: HashMap<String, Vec<(u64, Callback)>>,
    has_updates: bool,
    stats: SchedulerStats,
}

impl Dispatcher {
    pub(crate) fn new() -> Self {
        Self {
            state: VirtualTokenState::default(),
            subscribers: HashMap::new(),
            has_updates: false,
            stats: SchedulerStats::default(),
        }
    }

    /// Absorb one update and release the batch's claims on `settled`.
    /// Returns whether there is now something to flush.
    pub(crate) fn absorb(&mut self, update: TokenState, settled: &[String]) -> bool {
        self.state.settle(settled);
        if !update.is_empty() {
            self.stats.updates_absorbed += 1;
            self.state.absorb(update);
            self.has_updates = true;
        }
        self.has_updates
    }

    pub(crate) fn abandon(&mut self, ids: &[String]) {
        self.state.settle(ids);
    }

    pub(crate) fn subscribe(&mut self, kind: String, id: u64, callback: Callback) {
        self.subscribers.entry(kind).or_default().push((id, callback));
    }

    pub(crate) fn unsubscribe(&mut self, kind: &str, id: u64) {
        if let Some(list) = self.subscribers.get_mut(kind) {
            list.retain(|(sub_id, _)| *sub_id != id);
            if list.is_empty() {
                self.subscribers.remove(kind);
            }
        }
    }

    /// Deliver each subscribed type's current view to its subscribers.
    ///
    /// All callbacks in one flush observe the same timestamp. Types without
    /// entries are skipped.
    pub(crate) fn flush(&mut self) -> u64 {
        let timestamp = now_millis();
        let mut delivered = 0;
        self.has_updates = false;

        for (kind, callbacks) in &self.subscribers {
            let snapshot = self.state.subset(kind, timestamp);
            if snapshot.is_empty() {
                continue;
            }
            for (id, callback) in callbacks {
                let outcome = catch_unwind(AssertUnwindSafe(|| callback(&snapshot)));
                if outcome.is_err() {
                    error!(kind = %kind, subscriber = id, "token subscriber panicked");
                }
                delivered += 1;
            }
        }

        self.stats.flushes += 1;
        self.stats.notifications += delivered;
        debug!(notifications = delivered, "flushed token updates");
        delivered
    }

    pub(crate) fn stats(&self) -> SchedulerStats {
        SchedulerStats {
            pending: self.state.pending.len(),
            tracked: self.state.processed.len(),
            subscribers: self.subscribers.values().map(Vec::len).sum(),
            ..self.stats.clone()
        }
    }
}

enum SchedulerCommand {
    MarkPending(Vec<String>),
    Abandon(Vec<String>),
    Update {
        state: TokenState,
        settled: Vec<String>,
    },
    Subscribe {
        kind: String,
        id: u64,
        callback: Callback,
    },
    Unsubscribe {
        kind: String,
        id: u64,
    },
    Flush {
        reply: oneshot::Sender<bool>,
    },
    Stats {
        reply: oneshot::Sender<SchedulerStats>,
    },
}

/// Handle to the scheduler task, which owns the working state and the
/// subscriber registry.
#[derive(Clone)]
pub struct UpdateScheduler {
    tx: mpsc::UnboundedSender<SchedulerCommand>,
    next_id: Arc<AtomicU64>,
}

impl UpdateScheduler {
    /// Start the scheduler task on the current tokio runtime.
    pub fn spawn(frame_interval: Duration) -> Result<Self, TokenError> {
        let runtime = tokio::runtime::Handle::try_current()
            .map_err(|e| TokenError::Runtime(e.to_string()))?;
        let (tx, rx) = mpsc::unbounded_channel();
        runtime.spawn(run(Dispatcher::new(), rx, frame_interval));
        Ok(Self {
            tx,
            next_id: Arc::new(AtomicU64::new(1)),
        })
    }

    pub fn mark_pending(&self, ids: Vec<String>) {
        let _ = self.tx.send(SchedulerCommand::MarkPending(ids));
    }

    pub fn abandon(&self, ids: Vec<String>) {
        let _ = self.tx.send(SchedulerCommand::Abandon(ids));
    }

    /// Feed a snapshot into the next flush.
    pub fn update(&self, state: TokenState) {
        self.resolve(state, Vec::new());
    }

    /// Feed a batch result into the next flush, releasing its pending ids in
    /// the same step.
    pub fn resolve(&self, state: TokenState, settled: Vec<String>) {
        let _ = self.tx.send(SchedulerCommand::Update { state, settled });
    }

    pub fn subscribe(&self, kind: impl Into<String>, callback: Callback) -> Subscription {
        let kind = kind.into();
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let _ = self.tx.send(SchedulerCommand::Subscribe {
            kind: kind.clone(),
            id,
            callback,
        });
        Subscription {
            kind,
            id,
            tx: self.tx.clone(),
            active: Arc::new(AtomicBool::new(true)),
        }
    }

    /// Flush now if a flush is scheduled. Returns whether one ran.
    pub async fn flush_now(&self) -> bool {
        let (reply, rx) = oneshot::channel();
        if self.tx.send(SchedulerCommand::Flush { reply }).is_err() {
            return false;
        }
        rx.await.unwrap_or(false)
    }

    pub async fn stats(&self) -> SchedulerStats {
        let (reply, rx) = oneshot::channel();
        if self.tx.send(SchedulerCommand::Stats { reply }).is_err() {
            return SchedulerStats::default();
        }
        rx.await.unwrap_or_default()
    }
}

/// Registration of one callback for one component type.
///
/// Dropping it does not unsubscribe; call [`Subscription::unsubscribe`].
#[derive(Clone)]
pub struct Subscription {
    kind: String,
    id: u64,
    tx: mpsc::UnboundedSender<SchedulerCommand>,
    active: Arc<AtomicBool>,
}

impl Subscription {
    pub fn component_type(&self) -> &str {
        &self.kind
    }

    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::Acquire)
    }

    /// Stop receiving updates. Calling it again is a no-op.
    pub fn unsubscribe(&self) {
        if self.active.swap(false, Ordering::AcqRel) {
            let _ = self.tx.send(SchedulerCommand::Unsubscribe {
                kind: self.kind.clone(),
                id: self.id,
            });
        }
    }
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription")
            .field("kind", &self.kind)
            .field("id", &self.id)
            .field("active", &self.is_active())
            .finish()
    }
}

async fn run(
    mut dispatcher: Dispatcher,
    mut rx: mpsc::UnboundedReceiver<SchedulerCommand>,
    frame_interval: Duration,
) {
    // `Some` while a flush is scheduled for the next frame boundary.
    let mut deadline: Option<Instant> = None;

    loop {
        tokio::select! {
            cmd = rx.recv() => {
                let Some(cmd) = cmd else { break };
                match cmd {
                    SchedulerCommand::MarkPending(ids) => dispatcher.state.mark_pending(ids),
                    SchedulerCommand::Abandon(ids) => dispatcher.abandon(&ids),
                    SchedulerCommand::Update { state, settled } => {
                        if dispatcher.absorb(state, &settled) && deadline.is_none() {
                            trace!("scheduling token flush");
                            deadline = Some(Instant::now() + frame_interval);
                        }
                    }
                    SchedulerCommand::Subscribe { kind, id, callback } => {
                        dispatcher.subscribe(kind, id, callback);
                    }
                    SchedulerCommand::Unsubscribe { kind, id } => dispatcher.unsubscribe(&kind, id),
                    SchedulerCommand::Flush { reply } => {
                        let ran = deadline.take().is_some();
                        if ran {
                            dispatcher.flush();
                        }
                        let _ = reply.send(ran);
                    }
                    SchedulerCommand::Stats { reply } => {
                        let _ = reply.send(dispatcher.stats());
                    }
                }
            }
            _ = frame_boundary(deadline) => {
                deadline = None;
                dispatcher.flush();
            }
        }
    }
    debug!("update scheduler stopped");
}

async fn frame_boundary(deadline: Option<Instant>) {
    match deadline {
        Some(at) => tokio::time::sleep_until(at).await,
        None => std::future::pending().await,
    }
}
