use std::{
    borrow::Cow,
    fmt::{self, Display},
    future::Future,
    pin::Pin,
    task::{Context, Poll},
};

use tokio::task::{JoinError, JoinHandle};
use tracing::{debug, error, info, warn, Instrument};

/// The standard way to spawn long-lived futures in this workspace.
///
/// A thin wrapper around [`tokio::task::JoinHandle`] that:
///
/// (1) propagates panics instead of catching them
/// (2) adds the `#[must_use]` lint to ensure that all spawned tasks are
///     joined or explicitly annotated that no joining is required. Use
///     [`Task::detach`] to make it clear that a spawned task is
///     intentionally left running.
///
/// Each task carries a name which is included in its completion log line,
/// so a supervisor log tells you exactly which loop exited and how.
#[must_use]
pub struct Task<T> {
    handle: JoinHandle<T>,
    name: Cow<'static, str>,
}

impl<T> Task<T> {
    /// Spawns a named task which inherits the current tracing span.
    #[allow(clippy::disallowed_methods)]
    pub fn spawn<F>(name: impl Into<Cow<'static, str>>, future: F) -> Task<F::Output>
    where
        F: Future<Output = T> + Send + 'static,
        F::Output: Send + 'static,
    {
        let name = name.into();
        debug!("Spawning task: {name}");
        let span = tracing::Span::current();
        Task {
            handle: tokio::spawn(future.instrument(span)),
            name,
        }
    }

    /// Drop the handle, letting the task run to completion in the
    /// background. Prefer joining; detaching forfeits panic propagation.
    #[inline]
    pub fn detach(self) {
        std::mem::drop(self)
    }

    #[inline]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[inline]
    pub fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }

    #[inline]
    pub fn abort(&self) {
        self.handle.abort();
    }

    /// Await the task, discarding its output and logging how it finished.
    /// Panics inside the task propagate out of this call.
    pub async fn join_and_log(self) {
        let name = self.name.clone();
        let result = self.await;
        let outcome = TaskOutcome {
            name: &name,
            result: result.as_ref().map(|_| ()),
        };
        match &result {
            Ok(_) => info!("{outcome}"),
            Err(_) => warn!("{outcome}"),
        }
    }
}

impl<T> Future for Task<T> {
    type Output = Result<T, JoinError>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let result = match Pin::new(&mut self.handle).poll(cx) {
            Poll::Ready(result) => result,
            Poll::Pending => return Poll::Pending,
        };

        let result = match result {
            Ok(val) => Ok(val),
            Err(join_err) => match join_err.try_into_panic() {
                // If the inner spawned task panicked, propagate the panic
                // to whoever is polling the handle.
                Ok(panic_reason) => {
                    error!("Task '{name}' panicked!", name = self.name());
                    std::panic::resume_unwind(panic_reason)
                }
                Err(join_err) => Err(join_err),
            },
        };

        Poll::Ready(result)
    }
}

/// A [`Display`] impl for the result of a finished task.
struct TaskOutcome<'a> {
    name: &'a str,
    result: Result<(), &'a JoinError>,
}

impl Display for TaskOutcome<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match &self.result {
            Ok(()) => "finished",
            Err(e) if e.is_cancelled() => "cancelled",
            Err(e) if e.is_panic() => "panicked",
            _ => "(unknown join error)",
        };
        let name = self.name;
        write!(f, "Task '{name}' {label}")?;
        if let Err(e) = self.result {
            write!(f, ": {e:#}")?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[tokio::test]
    async fn join_returns_task_output() {
        let task = Task::spawn("adder", async { 2 + 2 });
        assert_eq!(task.await.unwrap(), 4);
    }

    #[tokio::test]
    #[should_panic(expected = "boom")]
    async fn panics_propagate_through_join() {
        let task = Task::spawn("bomb", async { panic!("boom") });
        let _ = task.await;
    }
}
