//! Consuming on a worker thread.
//!
//! The engine opens its own broker link with the parameters of the foreground connection. A
//! worker thread polls that link and forwards the deliveries as deferred tasks, the callbacks run
//! later on the foreground thread in `run_pending`. The link and the consumer registry are
//! guarded by one mutex, the worker and the foreground (creating and destroying consumers,
//! acking) take it for short sections only. Callbacks never run under the lock.
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread::{self, JoinHandle, ThreadId};
use std::time::Duration;

use anyhow::Result;
use log::{debug, error, info, trace, warn};
use tokio_util::sync::CancellationToken;

use crate::broker::{MethodFrame, RpcError};
use crate::classify::{self, Resolution};
use crate::config::{POLL_INTERVAL, WORKER_IDLE_SLEEP, WORKER_POLL_TIMEOUT};
use crate::consumer::{self, AckMode, ConsumerCallback, ConsumerHandle, ConsumerOptions};
use crate::deferred::{self, DeferredTask, TaskQueue, TaskSender};
use crate::error::{ClientError, ErrorKind};
use crate::message::DeliveredMessage;
use crate::registry::Registry;
use crate::state::{ChannelState, ConnectionState};

/// A consumer of the background registry. Its callback is kept on the foreground side.
#[derive(Debug)]
pub(crate) struct BackgroundConsumer {
    pub(crate) channel: ChannelState,
    pub(crate) queue: String,
    pub(crate) ack_mode: AckMode,
}

/// Everything the worker and the foreground both touch.
struct Shared {
    state: ConnectionState,
    registry: Registry<BackgroundConsumer>,
}

fn lock(shared: &Mutex<Shared>) -> MutexGuard<'_, Shared> {
    // callbacks don't run under the lock, a poisoned lock still has consistent data
    shared.lock().unwrap_or_else(PoisonError::into_inner)
}

pub(crate) struct BackgroundEngine {
    shared: Arc<Mutex<Shared>>,
    cancel: CancellationToken,
    worker: Option<JoinHandle<()>>,
    tasks: TaskQueue,
    callbacks: HashMap<String, ConsumerCallback>,
}

impl BackgroundEngine {
    /// Open a new link with the parameters of `foreground` and start the worker.
    pub(crate) fn start(foreground: &ConnectionState) -> Result<Self> {
        let mut state = foreground.detached();

        if let Err(e) = state.reconnect() {
            let mut ce = e.downcast::<ClientError>()?;
            ce.message = format!("Failed to clone connection. {}", ce.message);

            return Err(anyhow::Error::new(ce));
        }

        let shared = Arc::new(Mutex::new(Shared {
            state,
            registry: Registry::new(),
        }));
        let cancel = CancellationToken::new();
        let (tx, tasks) = deferred::task_queue()?;

        let worker = {
            let shared = shared.clone();
            let cancel = cancel.clone();

            thread::Builder::new()
                .name("metalmq-background".to_string())
                .spawn(move || worker_loop(shared, cancel, tx))?
        };

        info!("Background worker {:?} started", worker.thread().id());

        Ok(BackgroundEngine {
            shared,
            cancel,
            worker: Some(worker),
            tasks,
            callbacks: HashMap::new(),
        })
    }

    /// The engine is usable if its link is alive and the worker is running.
    pub(crate) fn is_running(&self) -> bool {
        let worker_alive = self.worker.as_ref().is_some_and(|w| !w.is_finished());

        worker_alive && lock(&self.shared).state.is_connected()
    }

    pub(crate) fn worker_id(&self) -> Option<ThreadId> {
        self.worker.as_ref().map(|w| w.thread().id())
    }

    pub(crate) fn consumer_tags(&self) -> Vec<String> {
        lock(&self.shared).registry.tags()
    }

    pub(crate) fn create_consumer(
        &mut self,
        queue: &str,
        options: ConsumerOptions,
        callback: ConsumerCallback,
    ) -> Result<ConsumerHandle> {
        let mut guard = lock(&self.shared);
        let Shared { state, registry } = &mut *guard;

        let mut channel = ChannelState::default();
        let consumer_tag = consumer::start_consumer(state, &mut channel, queue, &options)?;

        let key = match registry.insert(
            &consumer_tag,
            BackgroundConsumer {
                channel,
                queue: queue.to_string(),
                ack_mode: options.ack_mode,
            },
        ) {
            Ok(key) => key,
            Err(mut consumer) => {
                state.close_channel(&mut consumer.channel);

                return crate::client_error!(
                    ErrorKind::OperationFailed,
                    Some(channel.id),
                    0,
                    format!("Failed to start a queue consumer. Consumer tag '{consumer_tag}' is already in use."),
                    crate::model::BASIC_CONSUME
                );
            }
        };

        drop(guard);

        debug!("Background consumer {} of queue {} is registered", consumer_tag, queue);

        self.callbacks.insert(consumer_tag.clone(), callback);

        Ok(ConsumerHandle {
            key,
            consumer_tag,
            channel: channel.id,
            background: true,
        })
    }

    /// Cancel the consumer and close its channel. Failures are only logged.
    pub(crate) fn destroy_consumer(&mut self, handle: &ConsumerHandle) {
        let mut guard = lock(&self.shared);
        let Shared { state, registry } = &mut *guard;

        let Some((tag, mut consumer)) = registry.remove(handle.key) else {
            return;
        };

        consumer::stop_consumer(state, &tag, &mut consumer.channel);

        drop(guard);

        self.callbacks.remove(&tag);

        debug!("Background consumer {} of queue {} is destroyed", tag, consumer.queue);
    }

    /// Run the tasks which are already queued. Returns the number of tasks run.
    pub(crate) fn run_pending(&mut self, warnings: &mut Vec<String>) -> usize {
        let mut count = 0;

        while let Some(task) = self.tasks.try_next() {
            self.run_task(task, warnings);
            count += 1;
        }

        count
    }

    /// Wait at most `wait` for the first task, then run all the queued ones.
    pub(crate) fn run_pending_for(&mut self, wait: Duration, warnings: &mut Vec<String>) -> usize {
        match self.tasks.next_within(wait) {
            Some(task) => {
                self.run_task(task, warnings);

                1 + self.run_pending(warnings)
            }
            None => 0,
        }
    }

    /// Drop the queued deliveries and keep the warnings. Used when the engine is retired.
    pub(crate) fn drain_warnings(&mut self, warnings: &mut Vec<String>) {
        while let Some(task) = self.tasks.try_next() {
            if let DeferredTask::Warning(text) = task {
                warnings.push(text);
            }
        }
    }

    fn run_task(&mut self, task: DeferredTask, warnings: &mut Vec<String>) {
        let envelope = match task {
            DeferredTask::Warning(text) => {
                warn!("{}", text);
                warnings.push(text);

                return;
            }
            DeferredTask::Deliver(envelope) => envelope,
        };

        // the consumer may have been destroyed, or its tag reused on a new channel, since the
        // delivery was queued
        let found = lock(&self.shared)
            .registry
            .find(&envelope.consumer_tag)
            .filter(|c| c.channel.is_open && c.channel.id == envelope.channel)
            .map(|c| c.ack_mode);

        let (Some(ack_mode), Some(callback)) = (found, self.callbacks.get_mut(&envelope.consumer_tag)) else {
            debug!(
                "Discard delivery {} of consumer {} on channel {}",
                envelope.delivery_tag, envelope.consumer_tag, envelope.channel
            );

            return;
        };

        let channel_id = envelope.channel;

        let msg = DeliveredMessage::from(envelope);
        let outcome = consumer::invoke(callback, &msg);

        let mut guard = lock(&self.shared);
        let Shared { state, registry } = &mut *guard;

        // the worker may have closed the channel while the callback was running
        let channel = match registry.find(&msg.consumer_tag) {
            Some(c) if c.channel.is_open && c.channel.id == channel_id && state.is_connected() => c.channel,
            _ => {
                consumer::report(&msg, &outcome);

                return;
            }
        };

        let settled = match state.transport() {
            Ok(transport) => consumer::settle(transport, channel.id, ack_mode, &msg, &outcome),
            Err(_) => return,
        };

        if let Err(e) = settled {
            let mut chan = channel;
            let ce = state.absorb(Some(&mut chan), "Failed to acknowledge message.", &e);

            if let Some(c) = registry.find_mut(&msg.consumer_tag) {
                c.channel.is_open = chan.is_open && state.is_connected();
            }

            warn!("{}", ce.message);
            warnings.push(ce.message);
        }
    }
}

impl Drop for BackgroundEngine {
    fn drop(&mut self) {
        self.cancel.cancel();

        if let Some(worker) = self.worker.take() {
            let id = worker.thread().id();

            if worker.join().is_err() {
                error!("Background worker {:?} panicked", id);
            }
        }

        let mut guard = lock(&self.shared);
        let Shared { state, registry } = &mut *guard;

        // closing the connection cancels the consumers too
        for (_, mut consumer) in registry.drain() {
            consumer.channel.is_open = false;
        }

        if let Err(e) = state.disconnect() {
            debug!("Closing background connection failed {:?}", e);
        }

        self.callbacks.clear();

        info!("Background engine is destroyed");
    }
}

/// What the worker does after handling a poll result.
enum Next {
    Continue,
    Stop,
}

fn worker_loop(shared: Arc<Mutex<Shared>>, cancel: CancellationToken, tx: TaskSender) {
    while !cancel.is_cancelled() {
        thread::sleep(WORKER_IDLE_SLEEP);

        let next = {
            let mut guard = lock(&shared);
            let Shared { state, registry } = &mut *guard;

            poll_once(state, registry, &tx)
        };

        if let Next::Stop = next {
            break;
        }
    }

    debug!("Background worker {:?} stopped", thread::current().id());
}

fn poll_once(state: &mut ConnectionState, registry: &mut Registry<BackgroundConsumer>, tx: &TaskSender) -> Next {
    if !state.is_connected() || registry.is_empty() {
        return Next::Continue;
    }

    let polled = match state.transport() {
        Ok(transport) => transport.consume_message(WORKER_POLL_TIMEOUT),
        Err(_) => return Next::Continue,
    };

    let err = match polled {
        Ok(envelope) => {
            trace!("Queue delivery {} of {}", envelope.delivery_tag, envelope.consumer_tag);

            return match tx.send(DeferredTask::Deliver(envelope)) {
                Ok(()) => Next::Continue,
                Err(_) => Next::Stop,
            };
        }
        Err(err) => err,
    };

    match classify::classify(&err) {
        Resolution::None => Next::Continue,
        Resolution::MethodFrame => {
            let frame = match state.transport().map(|t| t.next_frame(POLL_INTERVAL)) {
                Ok(Ok(frame)) => frame,
                Ok(Err(e)) => return link_failure(state, registry, tx, e),
                Err(_) => return Next::Continue,
            };

            handle_frame(state, registry, tx, frame)
        }
        _ => link_failure(state, registry, tx, err),
    }
}

fn handle_frame(
    state: &mut ConnectionState,
    registry: &mut Registry<BackgroundConsumer>,
    tx: &TaskSender,
    frame: MethodFrame,
) -> Next {
    match classify::classify_frame(&frame) {
        Resolution::ConnectionFatal => link_failure(state, registry, tx, RpcError::Server(frame)),
        Resolution::ChannelFatal { channel } => {
            let mut owner = None;

            registry.for_each_mut(|tag, c| {
                if c.channel.is_open && c.channel.id == channel {
                    c.channel.is_open = false;
                    owner = Some(tag.to_string());
                }
            });

            if let Some(tag) = owner {
                let ce = classify::client_error(&format!("Background consumer '{tag}' stopped."), &RpcError::Server(frame));
                let _ = tx.send(DeferredTask::Warning(ce.message));
            }

            Next::Continue
        }
        Resolution::ConsumerFatal { consumer_tag, .. } => {
            if let Some(c) = registry.find_mut(&consumer_tag) {
                state.close_channel(&mut c.channel);
            }

            let _ = tx.send(DeferredTask::Warning(format!(
                "Consumer '{consumer_tag}' was cancelled by the server."
            )));

            Next::Continue
        }
        _ => {
            debug!("Ignore out-of-band method {:08X}", frame.class_method());

            Next::Continue
        }
    }
}

/// The link failed. A fatal error stops the worker, the foreground learns it from a warning.
fn link_failure(
    state: &mut ConnectionState,
    registry: &mut Registry<BackgroundConsumer>,
    tx: &TaskSender,
    err: RpcError,
) -> Next {
    let ce = state.absorb(None, "Background consumer error.", &err);

    if state.is_connected() {
        let _ = tx.send(DeferredTask::Warning(ce.message));

        return Next::Continue;
    }

    registry.for_each_mut(|_, c| c.channel.is_open = false);

    let _ = tx.send(DeferredTask::Warning(format!(
        "{} Background consumers are stopped, they need to be recreated.",
        ce.message
    )));

    Next::Stop
}
