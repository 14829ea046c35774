use std::io;
use std::time::Duration;

use tokio::runtime::{self, Runtime};
use tokio::sync::mpsc;
use tokio::time;

use crate::message::Envelope;

/// Work handed over by the background worker to the foreground thread.
#[derive(Debug)]
pub(crate) enum DeferredTask {
    /// Run the callback of the consumer the envelope belongs to.
    Deliver(Envelope),
    /// Report a problem of the background link.
    Warning(String),
}

pub(crate) type TaskSender = mpsc::UnboundedSender<DeferredTask>;

/// Receiving end of the deferred tasks, only the foreground thread reads it.
///
/// Timed waits are driven by a current thread runtime, so they must not be called from inside
/// another tokio runtime.
pub(crate) struct TaskQueue {
    rx: mpsc::UnboundedReceiver<DeferredTask>,
    runtime: Runtime,
}

pub(crate) fn task_queue() -> io::Result<(TaskSender, TaskQueue)> {
    let runtime = runtime::Builder::new_current_thread().enable_time().build()?;
    let (tx, rx) = mpsc::unbounded_channel();

    Ok((tx, TaskQueue { rx, runtime }))
}

impl TaskQueue {
    pub(crate) fn try_next(&mut self) -> Option<DeferredTask> {
        self.rx.try_recv().ok()
    }

    /// Wait at most `wait` for a task. Returns `None` on timeout or if the worker is gone.
    pub(crate) fn next_within(&mut self, wait: Duration) -> Option<DeferredTask> {
        let TaskQueue { rx, runtime } = self;

        runtime.block_on(async { time::timeout(wait, rx.recv()).await.ok().flatten() })
    }
}
