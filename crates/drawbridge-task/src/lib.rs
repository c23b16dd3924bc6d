//! Worker plumbing for the gateway: cooperative shutdown and owned task
//! handles.
//!
//! The service spawns connection workers continuously while a shutdown may
//! already be in flight, so the shutdown order is level-triggered: a signal
//! cloned or awaited after the order was given still observes it.

use std::future::Future;

use async_trait::async_trait;
use tokio::task::JoinHandle;

/// A long-running unit of the service: a listener, the session manager, log
/// pruning. Runs until completion or until the shutdown order.
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
    ChildTask::spawn(async move {
        tracing::trace!(task.name = T::NAME, "Task starting");
        let output = task.run(shutdown_signal).await;
        tracing::trace!(task.name = T::NAME, "Task finished");
        output
    })
}

/// Orders every task holding a [`ShutdownSignal`] to wind down.
#[derive(Debug)]
pub struct ShutdownHandle(tokio::sync::watch::Sender<bool>);

impl ShutdownHandle {
    pub fn new() -> (Self, ShutdownSignal) {
        let (sender, receiver) = tokio::sync::watch::channel(false);
        (Self(sender), ShutdownSignal(receiver))
    }

    pub fn signal(&self) {
        let _ = self.0.send(true);
    }

    /// Resolves once every [`ShutdownSignal`] clone has been dropped, which
    /// is how tasks acknowledge the order: by exiting.
    pub async fn all_closed(&self) {
        self.0.closed().await;
    }
}

/// Receiving side of the shutdown order.
#[derive(Clone, Debug)]
pub struct ShutdownSignal(tokio::sync::watch::Receiver<bool>);

impl ShutdownSignal {
    /// Resolves when shutdown has been ordered; immediately if it already
    /// was before this call.
    pub async fn wait(&mut self) {
        let _ = self.0.wait_for(|signaled| *signaled).await;
    }

    /// Non-blocking probe, for loops that check between units of work.
    pub fn is_signaled(&self) -> bool {
        *self.0.borrow()
    }
}

/// Handle owning a spawned worker: aborts it on drop, so a relay or monitor
/// cannot outlive the connection that holds the handle. [`detach`] gives the
/// opposite contract for workers that must finish on their own.
///
/// [`detach`]: ChildTask::detach
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

    pub fn abort(&self) {
        self.0.abort();
    }

    /// Release ownership without aborting; the worker keeps running.
    pub fn detach(self) {
        core::mem::forget(self);
    }
}

impl<T> Drop for ChildTask<T> {
    fn drop(&mut self) {
        self.abort();
    }
}
