use std::panic::{self, AssertUnwindSafe};

use anyhow::{anyhow, Result};
use log::{debug, warn};

use crate::broker::{BasicConsumeArgs, RpcError, Transport};
use crate::message::DeliveredMessage;
use crate::model::{ChannelNumber, FieldTable};
use crate::registry::SlotKey;
use crate::state::{ChannelState, ConnectionState};

/// Who settles the delivered messages.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum AckMode {
    /// The server considers a message settled as soon as it sends it.
    Auto,
    /// The runtime acks the message after the callback succeeded, and nacks it (with requeue) if
    /// the callback failed.
    #[default]
    Manual,
}

/// Message handler of a consumer. It runs on the thread which calls `listen` or `run_pending`.
pub type ConsumerCallback = Box<dyn FnMut(&DeliveredMessage) -> Result<()> + Send>;

/// Parameters of `Basic.Consume`.
#[derive(Clone, Debug)]
pub struct ConsumerOptions {
    /// Empty tag lets the server generate one.
    pub consumer_tag: String,
    pub ack_mode: AckMode,
    /// Maximum number of unacked messages in manual ack mode, 0 means unlimited.
    pub prefetch_count: u16,
    pub exclusive: bool,
    pub no_local: bool,
    pub args: Option<FieldTable>,
}

impl Default for ConsumerOptions {
    fn default() -> Self {
        ConsumerOptions {
            consumer_tag: String::new(),
            ack_mode: AckMode::Manual,
            prefetch_count: 50,
            exclusive: false,
            no_local: false,
            args: None,
        }
    }
}

impl ConsumerOptions {
    pub fn consumer_tag(mut self, tag: &str) -> Self {
        self.consumer_tag = tag.to_string();
        self
    }

    pub fn ack_mode(mut self, mode: AckMode) -> Self {
        self.ack_mode = mode;
        self
    }

    pub fn prefetch_count(mut self, count: u16) -> Self {
        self.prefetch_count = count;
        self
    }

    pub fn exclusive(mut self, mode: bool) -> Self {
        self.exclusive = mode;
        self
    }

    pub fn no_local(mut self, mode: bool) -> Self {
        self.no_local = mode;
        self
    }

    pub fn args(mut self, args: FieldTable) -> Self {
        self.args = Some(args);
        self
    }

    pub(crate) fn consume_args(&self, queue: &str) -> BasicConsumeArgs {
        let mut args = BasicConsumeArgs::default()
            .queue(queue)
            .consumer_tag(&self.consumer_tag)
            .no_ack(self.ack_mode == AckMode::Auto)
            .exclusive(self.exclusive)
            .no_local(self.no_local);

        args.args = self.args.clone();
        args
    }
}

/// A consumer of the foreground registry.
pub(crate) struct Consumer {
    pub(crate) channel: ChannelState,
    pub(crate) queue: String,
    pub(crate) ack_mode: AckMode,
    pub(crate) callback: ConsumerCallback,
}

/// Identifies a registered consumer. Destroying it twice is harmless.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ConsumerHandle {
    pub(crate) key: SlotKey,
    pub(crate) consumer_tag: String,
    pub(crate) channel: ChannelNumber,
    pub(crate) background: bool,
}

impl ConsumerHandle {
    /// The consumer tag confirmed by the server.
    pub fn consumer_tag(&self) -> &str {
        &self.consumer_tag
    }

    pub fn channel(&self) -> ChannelNumber {
        self.channel
    }

    pub fn is_background(&self) -> bool {
        self.background
    }
}

/// Run the callback, turning a panic into an error.
pub(crate) fn invoke(callback: &mut ConsumerCallback, msg: &DeliveredMessage) -> Result<()> {
    match panic::catch_unwind(AssertUnwindSafe(|| callback(msg))) {
        Ok(result) => result,
        Err(payload) => {
            let reason = payload
                .downcast_ref::<&str>()
                .map(|s| s.to_string())
                .or_else(|| payload.downcast_ref::<String>().cloned())
                .unwrap_or_else(|| "unknown reason".to_string());

            Err(anyhow!("Consumer callback panicked: {reason}"))
        }
    }
}

/// Log the failure of a callback.
pub(crate) fn report(msg: &DeliveredMessage, outcome: &Result<()>) {
    if let Err(e) = outcome {
        warn!(
            "Consumer {} failed to process delivery {}: {:#}",
            msg.consumer_tag, msg.delivery_tag, e
        );
    }
}

/// Settle one delivery by the outcome of its callback. Manual mode acks a success and requeues a
/// failure, auto mode only reports the failure.
pub(crate) fn settle(
    transport: &mut dyn Transport,
    channel: ChannelNumber,
    ack_mode: AckMode,
    msg: &DeliveredMessage,
    outcome: &Result<()>,
) -> Result<(), RpcError> {
    report(msg, outcome);

    match (ack_mode, outcome) {
        (AckMode::Auto, _) => Ok(()),
        (AckMode::Manual, Ok(())) => transport.basic_ack(channel, msg.delivery_tag, false),
        (AckMode::Manual, Err(_)) => transport.basic_nack(channel, msg.delivery_tag, false, true),
    }
}

/// Open a channel, set the prefetch in manual mode and start consuming. The channel is closed if
/// consuming couldn't be started.
pub(crate) fn start_consumer(
    state: &mut ConnectionState,
    channel: &mut ChannelState,
    queue: &str,
    options: &ConsumerOptions,
) -> Result<String> {
    state.ensure_valid_channel(channel)?;

    let result = (|| -> Result<String> {
        if options.ack_mode == AckMode::Manual {
            let prefetch = options.prefetch_count;

            state.call(channel, "Failed to set quality of service.", |t, ch| {
                t.basic_qos(ch, prefetch, false)
            })?;
        }

        let args = options.consume_args(queue);

        state.call(channel, "Failed to start a queue consumer.", |t, ch| t.basic_consume(ch, &args))
    })();

    if result.is_err() {
        state.close_channel(channel);
    }

    result
}

/// Cancel a consumer and close its channel if it is still open.
pub(crate) fn stop_consumer(state: &mut ConnectionState, tag: &str, channel: &mut ChannelState) {
    if !channel.is_open || !state.is_connected() {
        channel.is_open = false;

        return;
    }

    let cancelled = match state.transport() {
        Ok(transport) => transport.basic_cancel(channel.id, tag),
        Err(_) => return,
    };

    if let Err(e) = cancelled {
        let ce = state.absorb(Some(channel), "Failed to cancel the consumer.", &e);
        debug!("{}", ce.message);
    }

    state.close_channel(channel);
}
