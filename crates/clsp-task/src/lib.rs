//! Shared task-lifecycle primitives for the CLSP session core: abort-on-drop
//! task handles, a watch-based shutdown signal, and a single-shot destroy
//! guard that every `Destroyable` component is built on top of.

use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use tokio::sync::Notify;
use tokio::task::JoinHandle;

/// Aborts the running task when dropped.
/// Also see <https://github.com/tokio-rs/tokio/issues/1830> for some background.
#[must_use]
pub struct ChildTask<T>(JoinHandle<T>);

impl<T> ChildTask<T> {
    pub fn spawn<F>(future: F) -> Self
    where
        F: Future<Output = T> + Send + 'static,
        T: Send + 'static,
    {
        ChildTask(tokio::task::spawn(future))
    }

    pub async fn join(mut self) -> Result<T, tokio::task::JoinError> {
        (&mut self.0).await
    }

    /// Immediately abort the task.
    pub fn abort(&self) {
        self.0.abort()
    }

    /// Drop without aborting the task.
    pub fn detach(self) {
        core::mem::forget(self);
    }
}

impl<T> From<JoinHandle<T>> for ChildTask<T> {
    fn from(value: JoinHandle<T>) -> Self {
        Self(value)
    }
}

impl<T> Drop for ChildTask<T> {
    fn drop(&mut self) {
        self.abort();
    }
}

#[derive(Debug)]
pub struct ShutdownHandle(tokio::sync::watch::Sender<()>);

impl ShutdownHandle {
    pub fn new() -> (Self, ShutdownSignal) {
        let (sender, receiver) = tokio::sync::watch::channel(());
        (Self(sender), ShutdownSignal(receiver))
    }

    pub fn signal(&self) {
        let _ = self.0.send(());
    }

    pub async fn all_closed(&self) {
        self.0.closed().await;
    }
}

#[derive(Clone, Debug)]
pub struct ShutdownSignal(tokio::sync::watch::Receiver<()>);

impl ShutdownSignal {
    pub async fn wait(&mut self) {
        let _ = self.0.changed().await;
    }
}

#[async_trait]
pub trait Task {
    type Output: Send;

    const NAME: &'static str;

    async fn run(self, shutdown_signal: ShutdownSignal) -> Self::Output;
}

pub fn spawn_task<T>(task: T, shutdown_signal: ShutdownSignal) -> ChildTask<T::Output>
where
    T: Task + Send + 'static,
{
    ChildTask::spawn(task.run(shutdown_signal))
}

/// A reusable, idempotent, single-shot "destroy" latch.
///
/// `trigger()` is safe to call concurrently and any number of times: only the
/// first caller gets `true` back (and is therefore the one responsible for
/// running teardown), every other caller (concurrent or later) gets `false`
/// and should treat destruction as already in flight or complete. `wait()`
/// resolves once the first caller has finished (see [`DestroyGuard::complete`]).
#[derive(Clone, Debug)]
pub struct DestroyGuard {
    started: Arc<AtomicBool>,
    completed: Arc<AtomicBool>,
    notify: Arc<Notify>,
}

impl Default for DestroyGuard {
    fn default() -> Self {
        Self::new()
    }
}

impl DestroyGuard {
    pub fn new() -> Self {
        Self {
            started: Arc::new(AtomicBool::new(false)),
            completed: Arc::new(AtomicBool::new(false)),
            notify: Arc::new(Notify::new()),
        }
    }

    /// Returns `true` exactly once: for the caller that should perform teardown.
    pub fn trigger(&self) -> bool {
        self.started
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
    }

    /// Marks teardown as finished and wakes any concurrent waiters.
    pub fn complete(&self) {
        self.completed.store(true, Ordering::SeqCst);
        self.notify.notify_waiters();
    }

    /// Awaits completion if destruction is already in flight elsewhere.
    pub async fn wait(&self) {
        if self.is_complete() {
            return;
        }
        // Register interest before re-checking to avoid missing a concurrent `complete()`.
        let notified = self.notify.notified();
        if self.is_complete() {
            return;
        }
        notified.await;
    }

    pub fn is_started(&self) -> bool {
        self.started.load(Ordering::SeqCst)
    }

    pub fn is_complete(&self) -> bool {
        self.completed.load(Ordering::SeqCst)
    }
}
