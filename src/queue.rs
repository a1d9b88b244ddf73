//! Bounded-concurrency FIFO queue in front of the external analysis call.
//!
//! A single dispatcher task takes a concurrency slot, then the oldest queued
//! job, and runs that job on its own task. When the job finishes the active
//! count drops, the outcome is delivered to the caller, and the slot is held
//! for a fixed quiescence delay before it is released. The delay applies even
//! with `max_concurrent = 1` so the downstream API never sees back-to-back
//! bursts.
//!
//! The queue never inspects outcomes: a failing job resolves only its own
//! [`JobHandle`] and the next job is started as usual.

use crate::error::QueueError;
use crate::types::QueueStats;
use futures::future::BoxFuture;
use futures::FutureExt;
use log::{debug, info, warn};
use std::collections::VecDeque;
use std::fmt::Display;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::pin::Pin;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::task::{Context, Poll};
use std::time::{Duration, Instant};
use tokio::sync::{oneshot, Notify, Semaphore};
use tokio::task::JoinHandle;
use uuid::Uuid;

pub const DEFAULT_MAX_CONCURRENT: usize = 1;
pub const DEFAULT_JOB_DELAY: Duration = Duration::from_millis(500);

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueConfig {
    pub max_concurrent: usize,
    /// Pause after each completion before its slot is reused.
    pub job_delay: Duration,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            max_concurrent: DEFAULT_MAX_CONCURRENT,
            job_delay: DEFAULT_JOB_DELAY,
        }
    }
}

impl QueueConfig {
    /// `max_concurrent` is raised to 1 if zero.
    pub fn new(max_concurrent: usize, job_delay: Duration) -> Self {
        Self {
            max_concurrent: max_concurrent.max(1),
            job_delay,
        }
    }
}

/// What happens to jobs still waiting when the queue shuts down.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownMode {
    /// Run every job already queued, then stop.
    Drain,
    /// Fail every queued job with [`QueueError::Closed`].
    Reject,
}

// Type-erased unit of work. The typed result travels through the oneshot
// captured by the implementation.
trait Job: Send {
    fn run(self: Box<Self>, id: Uuid, slot: ActiveSlot) -> BoxFuture<'static, ()>;
    fn reject(self: Box<Self>, err: QueueError);
}

struct TypedJob<F, T, E> {
    work: F,
    done: oneshot::Sender<Result<T, E>>,
}

impl<F, Fut, T, E> Job for TypedJob<F, T, E>
where
    F: FnOnce() -> Fut + Send + 'static,
    Fut: Future<Output = Result<T, E>> + Send + 'static,
    T: Send + 'static,
    E: From<QueueError> + Display + Send + 'static,
{
    fn run(self: Box<Self>, id: Uuid, slot: ActiveSlot) -> BoxFuture<'static, ()> {
        let TypedJob { work, done } = *self;
        async move {
            let outcome = work().await;
            drop(slot);
            if let Err(e) = &outcome {
                warn!("queued request {} failed: {}", id, e);
            }
            if done.send(outcome).is_err() {
                debug!("caller for request {} went away before completion", id);
            }
        }
        .boxed()
    }

    fn reject(self: Box<Self>, err: QueueError) {
        let _ = self.done.send(Err(E::from(err)));
    }
}

struct QueuedJob {
    id: Uuid,
    enqueued_at: Instant,
    job: Box<dyn Job>,
}

#[derive(Default)]
struct State {
    jobs: VecDeque<QueuedJob>,
    closing: Option<ShutdownMode>,
}

struct Shared {
    state: Mutex<State>,
    active: AtomicUsize,
    wake: Notify,
    slots: Arc<Semaphore>,
    config: QueueConfig,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn close(&self, mode: ShutdownMode) {
        let rejected: Vec<QueuedJob> = {
            let mut state = self.lock();
            if state.closing != Some(ShutdownMode::Reject) {
                state.closing = Some(mode);
            }
            match state.closing {
                Some(ShutdownMode::Reject) => state.jobs.drain(..).collect(),
                _ => Vec::new(),
            }
        };
        if !rejected.is_empty() {
            info!("request queue closing; rejecting {} queued request(s)", rejected.len());
        }
        for queued in rejected {
            queued.job.reject(QueueError::Closed);
        }
        self.wake.notify_one();
    }
}

// Counts one running job; the count drops when this is dropped, panics included.
struct ActiveSlot {
    shared: Arc<Shared>,
}

impl ActiveSlot {
    fn enter(shared: &Arc<Shared>) -> Self {
        shared.active.fetch_add(1, Ordering::SeqCst);
        Self {
            shared: Arc::clone(shared),
        }
    }
}

impl Drop for ActiveSlot {
    fn drop(&mut self) {
        self.shared.active.fetch_sub(1, Ordering::SeqCst);
    }
}

async fn dispatch(shared: Arc<Shared>) {
    loop {
        let Ok(permit) = Arc::clone(&shared.slots).acquire_owned().await else {
            break;
        };
        let next = loop {
            {
                let mut state = shared.lock();
                if let Some(job) = state.jobs.pop_front() {
                    break Some(job);
                }
                if state.closing.is_some() {
                    break None;
                }
            }
            shared.wake.notified().await;
        };
        let Some(queued) = next else {
            break;
        };

        let slot = ActiveSlot::enter(&shared);
        info!(
            "processing request {} (waited {}ms); active {}/{}",
            queued.id,
            queued.enqueued_at.elapsed().as_millis(),
            shared.active.load(Ordering::SeqCst),
            shared.config.max_concurrent
        );
        let delay = shared.config.job_delay;
        let id = queued.id;
        tokio::spawn(async move {
            // A panic must not skip the delay below.
            if AssertUnwindSafe(queued.job.run(id, slot))
                .catch_unwind()
                .await
                .is_err()
            {
                warn!("queued request {} panicked", id);
            }
            tokio::time::sleep(delay).await;
            drop(permit);
        });
    }

    // Every slot back means nothing is in flight any more.
    let all = u32::try_from(shared.config.max_concurrent).unwrap_or(u32::MAX);
    let _ = shared.slots.acquire_many(all).await;
    debug!("request queue dispatcher stopped");
}

struct Inner {
    shared: Arc<Shared>,
    dispatcher: Mutex<Option<JoinHandle<()>>>,
}

impl Drop for Inner {
    fn drop(&mut self) {
        // Last handle gone: let queued work finish, then the dispatcher exits.
        self.shared.close(ShutdownMode::Drain);
    }
}

/// Process-wide serializer for calls to a scarce external resource.
///
/// Cheap to clone; all clones share one queue.
#[derive(Clone)]
pub struct RequestSerializer {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for RequestSerializer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RequestSerializer")
            .field("stats", &self.stats())
            .finish()
    }
}

impl RequestSerializer {
    /// Start the queue and its dispatcher task. Must be called inside a Tokio runtime.
    pub fn new(config: QueueConfig) -> Self {
        let config = QueueConfig::new(config.max_concurrent, config.job_delay);
        let shared = Arc::new(Shared {
            state: Mutex::new(State::default()),
            active: AtomicUsize::new(0),
            wake: Notify::new(),
            slots: Arc::new(Semaphore::new(config.max_concurrent)),
            config,
        });
        let dispatcher = tokio::spawn(dispatch(Arc::clone(&shared)));
        Self {
            inner: Arc::new(Inner {
                shared,
                dispatcher: Mutex::new(Some(dispatcher)),
            }),
        }
    }

    /// Queue `work` and return a handle resolving to its outcome.
    ///
    /// The job takes its place in line when this is called, not when the
    /// handle is first polled. Dropping the handle does not cancel the job.
    pub fn enqueue<F, Fut, T, E>(&self, work: F) -> JobHandle<T, E>
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = Result<T, E>> + Send + 'static,
        T: Send + 'static,
        E: From<QueueError> + Display + Send + 'static,
    {
        let (done, rx) = oneshot::channel();
        let id = Uuid::new_v4();
        let queued = QueuedJob {
            id,
            enqueued_at: Instant::now(),
            job: Box::new(TypedJob { work, done }),
        };

        let shared = &self.inner.shared;
        let refused = {
            let mut state = shared.lock();
            if state.closing.is_some() {
                Some(queued)
            } else {
                state.jobs.push_back(queued);
                debug!(
                    "request {} queued; queue size {}, active {}",
                    id,
                    state.jobs.len(),
                    shared.active.load(Ordering::SeqCst)
                );
                None
            }
        };
        match refused {
            Some(queued) => queued.job.reject(QueueError::Closed),
            None => shared.wake.notify_one(),
        }
        JobHandle { id, rx }
    }

    pub fn stats(&self) -> QueueStats {
        let shared = &self.inner.shared;
        let queue_size = shared.lock().jobs.len();
        let active_count = shared.active.load(Ordering::SeqCst);
        QueueStats {
            queue_size,
            active_count,
            max_concurrent: shared.config.max_concurrent,
            total_pending: queue_size + active_count,
        }
    }

    pub fn config(&self) -> &QueueConfig {
        &self.inner.shared.config
    }

    pub fn is_closed(&self) -> bool {
        self.inner.shared.lock().closing.is_some()
    }

    /// Stop accepting work and wait for the dispatcher to finish.
    ///
    /// Returns once every in-flight job (and, with [`ShutdownMode::Drain`],
    /// every queued job) has completed. Later calls return immediately.
    pub async fn shutdown(&self, mode: ShutdownMode) {
        self.inner.shared.close(mode);
        let handle = {
            let mut guard = self
                .inner
                .dispatcher
                .lock()
                .unwrap_or_else(PoisonError::into_inner);
            guard.take()
        };
        if let Some(handle) = handle {
            if let Err(e) = handle.await {
                warn!("request queue dispatcher ended abnormally: {}", e);
            }
        }
    }
}

/// Eventual outcome of a queued job.
#[must_use = "the job runs either way; the handle is the only way to see its outcome"]
pub struct JobHandle<T, E> {
    id: Uuid,
    rx: oneshot::Receiver<Result<T, E>>,
}

impl<T, E> JobHandle<T, E> {
    pub fn id(&self) -> Uuid {
        self.id
    }
}

impl<T, E: From<QueueError>> Future for JobHandle<T, E> {
    type Output = Result<T, E>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        match Pin::new(&mut self.rx).poll(cx) {
            Poll::Ready(Ok(outcome)) => Poll::Ready(outcome),
            // Sender dropped without a value: the job panicked.
            Poll::Ready(Err(_)) => Poll::Ready(Err(E::from(QueueError::Abandoned))),
            Poll::Pending => Poll::Pending,
        }
    }
}
