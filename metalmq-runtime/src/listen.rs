//! The blocking consume loop of the foreground registry.
use std::time::{Duration, Instant};

use anyhow::Result;
use log::{debug, trace, warn};
use tokio_util::sync::CancellationToken;

use crate::broker::{MethodFrame, RpcError};
use crate::classify::{self, Resolution};
use crate::client_error;
use crate::config::{MAX_LISTEN_WAIT, POLL_INTERVAL};
use crate::consumer::{self, Consumer};
use crate::error::ErrorKind;
use crate::message::{DeliveredMessage, Envelope};
use crate::registry::Registry;
use crate::state::ConnectionState;

const CONTEXT: &str = "Failed to consume messages.";

/// Why `listen` returned normally.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ListenStop {
    /// The wait budget has elapsed.
    Elapsed,
    /// The cancellation token was cancelled.
    Interrupted,
}

/// Poll the connection and dispatch the deliveries to the registered consumers until `max_wait`
/// elapses (capped at [`MAX_LISTEN_WAIT`]) or `interrupt` is cancelled.
///
/// The budget is wall clock time, so slow callbacks count against it. The loop polls with at
/// most [`POLL_INTERVAL`] timeout, that is the granularity of checking the interrupt.
pub(crate) fn listen(
    state: &mut ConnectionState,
    registry: &mut Registry<Consumer>,
    max_wait: Duration,
    interrupt: Option<&CancellationToken>,
) -> Result<ListenStop> {
    if registry.is_empty() {
        return client_error!(
            ErrorKind::OperationFailed,
            None,
            0,
            "No consumers are declared on this connection.",
            0
        );
    }

    let budget = max_wait.min(MAX_LISTEN_WAIT);
    let start = Instant::now();

    loop {
        let elapsed = start.elapsed();
        if elapsed >= budget {
            return Ok(ListenStop::Elapsed);
        }

        let polled = state.transport()?.consume_message(POLL_INTERVAL.min(budget - elapsed));

        match polled {
            Ok(envelope) => dispatch(state, registry, envelope),
            Err(err) => match classify::classify(&err) {
                Resolution::None => trace!("Poll timed out"),
                Resolution::MethodFrame => {
                    let frame = match state.transport()?.next_frame(POLL_INTERVAL) {
                        Ok(frame) => frame,
                        Err(e) => return Err(fail(state, registry, e)),
                    };

                    handle_frame(state, registry, frame)?;
                }
                _ => return Err(fail(state, registry, err)),
            },
        }

        if interrupt.is_some_and(|token| token.is_cancelled()) {
            debug!("Listen is interrupted after {:?}", start.elapsed());

            return Ok(ListenStop::Interrupted);
        }
    }
}

/// Hand over one delivery to the consumer it belongs to.
pub(crate) fn dispatch(state: &mut ConnectionState, registry: &mut Registry<Consumer>, envelope: Envelope) {
    let found = registry
        .find_mut(&envelope.consumer_tag)
        .filter(|c| c.channel.is_open && c.channel.id == envelope.channel);

    let Some(consumer) = found else {
        // in flight to a consumer which has been destroyed, or whose tag is reused since
        debug!(
            "Discard delivery {} of consumer {} on channel {}",
            envelope.delivery_tag, envelope.consumer_tag, envelope.channel
        );

        return;
    };

    let msg = DeliveredMessage::from(envelope);
    let outcome = consumer::invoke(&mut consumer.callback, &msg);

    let settled = match state.transport() {
        Ok(transport) => consumer::settle(transport, consumer.channel.id, consumer.ack_mode, &msg, &outcome),
        Err(_) => return,
    };

    if let Err(e) = settled {
        let ce = state.absorb(Some(&mut consumer.channel), "Failed to acknowledge message.", &e);
        warn!("{}", ce.message);

        if !state.is_connected() {
            close_all(registry);
        }
    }
}

/// Apply an out-of-band method frame. Returns the error if it invalidated a consumer or the
/// connection.
fn handle_frame(state: &mut ConnectionState, registry: &mut Registry<Consumer>, frame: MethodFrame) -> Result<()> {
    let resolution = classify::classify_frame(&frame);

    match resolution {
        Resolution::ConnectionFatal => Err(fail(state, registry, RpcError::Server(frame))),
        Resolution::ChannelFatal { channel } => {
            let mut owner = None;

            registry.for_each_mut(|tag, c| {
                if c.channel.is_open && c.channel.id == channel {
                    c.channel.is_open = false;
                    owner = Some(tag.to_string());
                }
            });

            let Some(tag) = owner else {
                state.channel_closed_by_server(channel);
                debug!("Channel {} was closed by the server", channel);

                return Ok(());
            };

            let mut ce = classify::client_error(CONTEXT, &RpcError::Server(frame));
            ce.consumer_tag = Some(tag);

            Err(anyhow::Error::new(ce))
        }
        Resolution::ConsumerFatal { consumer_tag, .. } => {
            if let Some(consumer) = registry.find_mut(&consumer_tag) {
                state.close_channel(&mut consumer.channel);
            }

            let message = format!("Consumer '{consumer_tag}' was cancelled by the server.");

            Err(anyhow::Error::new(classify::frame_error(message, &frame)))
        }
        _ => {
            debug!("Ignore out-of-band method {:08X}", frame.class_method());

            Ok(())
        }
    }
}

/// Turn a poll failure into an error, invalidating the state it affects.
fn fail(state: &mut ConnectionState, registry: &mut Registry<Consumer>, err: RpcError) -> anyhow::Error {
    let error = state.rpc_error(None, CONTEXT, err);

    if !state.is_connected() {
        close_all(registry);
    }

    error
}

/// The channels of a lost connection are gone, consumers become dormant.
pub(crate) fn close_all(registry: &mut Registry<Consumer>) {
    registry.for_each_mut(|_, c| c.channel.is_open = false);
}
