//! Serialized executor for native calls.
//!
//! One dedicated thread owns the [`EngineHandle`] and drains a bounded FIFO
//! queue, running one operation at a time. Callers hold a [`Pending`] that
//! resolves through a oneshot channel, so submission never blocks.
//!
//! A failing or panicking operation resolves its own [`Pending`] with an
//! error and the worker moves on to the next one.

use std::collections::VecDeque;
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::thread;
use std::time::{Duration, Instant};

use tokio::sync::oneshot;
use tracing::{debug, error, warn};

use crate::error::{EngineError, Result};
use crate::handle::EngineHandle;

/// Identifier of a submitted operation, unique per queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct OperationId(u64);

impl fmt::Display for OperationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "op-{}", self.0)
    }
}

/// What an operation does.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OperationKind {
    /// Explicit engine initialization.
    Initialize,
    /// Engine shutdown.
    Shutdown,
    /// Profile preset load.
    LoadPreset,
    /// Model inspection.
    GetModelInfo,
    /// Slicing.
    Slice,
}

impl OperationKind {
    /// Whether the operation counts against the queue capacity when admitted.
    /// Lifecycle operations are always admitted.
    fn is_bounded(self) -> bool {
        !matches!(self, OperationKind::Initialize | OperationKind::Shutdown)
    }
}

trait Task: Send {
    fn run(self: Box<Self>, handle: &mut EngineHandle);
    fn reject(self: Box<Self>, error: EngineError);
}

struct Job<T, F> {
    work: F,
    reply: oneshot::Sender<Result<T>>,
}

impl<T, F> Task for Job<T, F>
where
    T: Send + 'static,
    F: FnOnce(&mut EngineHandle) -> Result<T> + Send + 'static,
{
    fn run(self: Box<Self>, handle: &mut EngineHandle) {
        let Job { work, reply } = *self;
        let result = panic::catch_unwind(AssertUnwindSafe(|| work(handle)))
            .unwrap_or_else(|payload| Err(EngineError::from_panic(payload)));
        if reply.send(result).is_err() {
            debug!("caller stopped waiting; result discarded");
        }
    }

    fn reject(self: Box<Self>, error: EngineError) {
        let _ = self.reply.send(Err(error));
    }
}

struct Entry {
    id: OperationId,
    kind: OperationKind,
    task: Box<dyn Task>,
}

#[derive(Default)]
struct QueueState {
    pending: VecDeque<Entry>,
    running: Option<OperationId>,
    closed: bool,
    next_id: u64,
}

impl QueueState {
    fn depth(&self) -> usize {
        self.pending.len() + usize::from(self.running.is_some())
    }
}

struct Shared {
    state: Mutex<QueueState>,
    ready: Condvar,
    capacity: usize,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, QueueState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn cancel(&self, id: OperationId) -> bool {
        let entry = {
            let mut state = self.lock();
            let position = state.pending.iter().position(|e| e.id == id);
            position.and_then(|p| state.pending.remove(p))
        };
        match entry {
            Some(entry) => {
                debug!(%id, kind = ?entry.kind, "cancelled queued operation");
                entry.task.reject(EngineError::Cancelled);
                true
            }
            None => false,
        }
    }
}

/// Bounded FIFO queue drained by a single engine thread.
pub struct WorkQueue {
    shared: Arc<Shared>,
}

impl WorkQueue {
    /// Spawn the worker thread and hand it the engine.
    pub fn start(handle: EngineHandle, capacity: usize) -> Result<Self> {
        let shared = Arc::new(Shared {
            state: Mutex::new(QueueState::default()),
            ready: Condvar::new(),
            capacity: capacity.max(1),
        });

        let worker_shared = Arc::clone(&shared);
        thread::Builder::new()
            .name("orca-engine".into())
            .spawn(move || worker_loop(worker_shared, handle))
            .map_err(|e| {
                error!(error = %e, "failed to spawn engine worker");
                EngineError::worker_stopped()
            })?;

        Ok(Self { shared })
    }

    /// Queue `work` for execution on the engine thread.
    ///
    /// Fails with [`EngineError::Busy`] when the queue is at capacity.
    pub fn submit<T, F>(&self, kind: OperationKind, work: F) -> Result<Pending<T>>
    where
        T: Send + 'static,
        F: FnOnce(&mut EngineHandle) -> Result<T> + Send + 'static,
    {
        let (reply, rx) = oneshot::channel();
        let id = {
            let mut state = self.shared.lock();
            if state.closed {
                return Err(EngineError::worker_stopped());
            }
            if kind.is_bounded() && state.depth() >= self.shared.capacity {
                warn!(?kind, capacity = self.shared.capacity, "queue full, rejecting operation");
                return Err(EngineError::Busy {
                    capacity: self.shared.capacity,
                });
            }
            state.next_id += 1;
            let id = OperationId(state.next_id);
            state.pending.push_back(Entry {
                id,
                kind,
                task: Box::new(Job { work, reply }),
            });
            debug!(%id, ?kind, depth = state.depth(), "operation queued");
            id
        };
        self.shared.ready.notify_one();

        Ok(Pending {
            id,
            rx,
            shared: Arc::clone(&self.shared),
            submitted: Instant::now(),
            timeout: None,
        })
    }

    /// Cancel a queued operation. Returns `false` if it already started.
    pub fn cancel(&self, id: OperationId) -> bool {
        self.shared.cancel(id)
    }

    /// Operations queued or executing.
    pub fn depth(&self) -> usize {
        self.shared.lock().depth()
    }

    /// Configured bound.
    pub fn capacity(&self) -> usize {
        self.shared.capacity
    }

    fn close(&self) {
        let drained: Vec<Entry> = {
            let mut state = self.shared.lock();
            state.closed = true;
            state.pending.drain(..).collect()
        };
        self.shared.ready.notify_all();
        for entry in drained {
            entry.task.reject(EngineError::Cancelled);
        }
    }
}

impl Drop for WorkQueue {
    fn drop(&mut self) {
        self.close();
    }
}

fn worker_loop(shared: Arc<Shared>, mut handle: EngineHandle) {
    debug!("engine worker started");
    loop {
        let entry = {
            let mut state = shared.lock();
            loop {
                if let Some(entry) = state.pending.pop_front() {
                    state.running = Some(entry.id);
                    break entry;
                }
                if state.closed {
                    drop(state);
                    handle.shutdown();
                    debug!("engine worker stopped");
                    return;
                }
                state = shared.ready.wait(state).unwrap_or_else(PoisonError::into_inner);
            }
        };

        debug!(id = %entry.id, kind = ?entry.kind, "executing operation");
        entry.task.run(&mut handle);
        shared.lock().running = None;
    }
}

/// Result of a submitted operation, not yet available.
pub struct Pending<T> {
    id: OperationId,
    rx: oneshot::Receiver<Result<T>>,
    shared: Arc<Shared>,
    submitted: Instant,
    timeout: Option<Duration>,
}

impl<T> Pending<T> {
    /// Operation identifier.
    pub fn id(&self) -> OperationId {
        self.id
    }

    /// Cancel the operation if it has not started. Awaiting it afterwards
    /// yields [`EngineError::Cancelled`].
    pub fn cancel(&self) -> bool {
        self.shared.cancel(self.id)
    }

    /// Stop waiting once `limit` has elapsed since submission.
    pub fn with_timeout(mut self, limit: Option<Duration>) -> Self {
        self.timeout = limit;
        self
    }

    /// Wait for the outcome.
    ///
    /// When a timeout is set and expires, a still-queued operation is
    /// cancelled; a running one is abandoned and its native call finishes
    /// in the background.
    pub async fn wait(mut self) -> Result<T> {
        let received = match self.timeout {
            None => (&mut self.rx).await,
            Some(limit) => {
                let remaining = limit.saturating_sub(self.submitted.elapsed());
                match tokio::time::timeout(remaining, &mut self.rx).await {
                    Ok(received) => received,
                    Err(_) => {
                        if !self.shared.cancel(self.id) {
                            warn!(id = %self.id, ?limit, "abandoning running operation");
                        }
                        return Err(EngineError::TimedOut(limit));
                    }
                }
            }
        };
        received.unwrap_or_else(|_| Err(EngineError::worker_stopped()))
    }
}

/// Dropping a [`Pending`] that is still queued removes it from the queue.
impl<T> Drop for Pending<T> {
    fn drop(&mut self) {
        self.shared.cancel(self.id);
    }
}

impl<T> fmt::Debug for Pending<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Pending")
            .field("id", &self.id)
            .field("timeout", &self.timeout)
            .finish()
    }
}
