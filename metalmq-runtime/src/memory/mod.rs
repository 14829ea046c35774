//! An AMQP 0-9-1 broker living in the process.
//!
//! It implements [`Connector`] and [`Transport`] so the runtime can be run without a server. The
//! broker keeps the semantics the runtime relies on: channel and connection errors with the
//! reply codes of the protocol, prefetch limited round robin delivery, requeue of unacked
//! messages and consumer cancel notifications.
//!
//! ```no_run
//! use std::sync::Arc;
//! use metalmq_runtime::{memory::MemoryBroker, Connection, ConnectionConfig};
//!
//! let broker = MemoryBroker::new();
//! let conn = Connection::connect(ConnectionConfig::default(), Arc::new(broker.clone())).unwrap();
//! ```
mod exchange;
mod queue;
mod server;

use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use log::{debug, trace};

use crate::broker::{
    BasicConsumeArgs, BasicPublishFlags, BindArgs, BrokerResult, Connector, ExchangeDeclareArgs, MethodFrame,
    QueueDeclareArgs, QueueDeclareOk, RpcError, Transport,
};
use crate::message::{Content, Envelope, GetMessage};
use crate::model::{self, ChannelNumber, FieldTable};
use queue::ConnId;
use server::ServerState;

#[derive(Debug)]
struct Inner {
    state: Mutex<ServerState>,
    changed: Condvar,
}

impl Inner {
    fn lock(&self) -> MutexGuard<'_, ServerState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Run a mutation, then deliver what became deliverable and wake up the waiting transports.
    fn update<T, F>(&self, f: F) -> T
    where
        F: FnOnce(&mut ServerState) -> T,
    {
        let mut state = self.lock();
        let result = f(&mut state);

        state.pump();
        drop(state);

        self.changed.notify_all();

        result
    }

    /// Wait until `poll` gives a result or the timeout elapses.
    fn wait_for<T, F>(&self, timeout: Duration, mut poll: F) -> Option<T>
    where
        F: FnMut(&mut ServerState) -> Option<T>,
    {
        let deadline = Instant::now() + timeout;
        let mut state = self.lock();

        loop {
            if let Some(result) = poll(&mut state) {
                return Some(result);
            }

            let now = Instant::now();
            if now >= deadline {
                return None;
            }

            state = self
                .changed
                .wait_timeout(state, deadline - now)
                .map(|(guard, _)| guard)
                .unwrap_or_else(|e| e.into_inner().0);
        }
    }
}

/// Handle of an in-memory broker. Clones share the same broker.
#[derive(Clone, Debug)]
pub struct MemoryBroker {
    inner: Arc<Inner>,
}

impl Default for MemoryBroker {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryBroker {
    /// A broker with the `/` virtual host, the `amq.*` exchanges and the `guest` user.
    pub fn new() -> Self {
        MemoryBroker {
            inner: Arc::new(Inner {
                state: Mutex::new(ServerState::new()),
                changed: Condvar::new(),
            }),
        }
    }

    pub fn add_user(&self, username: &str, password: &str) {
        self.inner.update(|s| s.add_user(username, password));
    }

    pub fn add_vhost(&self, name: &str) {
        self.inner.update(|s| s.add_vhost(name));
    }

    /// New connections fail with a socket error while refusing is on.
    pub fn refuse_connections(&self, refuse: bool) {
        self.inner.update(|s| s.refuse = refuse);
    }

    /// Declare a plain queue in the `/` virtual host.
    pub fn declare_queue(&self, name: &str) {
        self.inner.update(|s| s.declare_queue(name));
    }

    /// Publish a message from the server side. Returns the number of queues it was routed to.
    pub fn publish(&self, exchange: &str, routing_key: &str, content: Content) -> usize {
        self.inner.update(|s| s.publish(exchange, routing_key, &content))
    }

    /// Number of ready messages in a queue of the `/` virtual host.
    pub fn message_count(&self, queue: &str) -> Option<u32> {
        self.inner.lock().queue_stats(queue).map(|(messages, _)| messages)
    }

    pub fn consumer_count(&self, queue: &str) -> Option<u32> {
        self.inner.lock().queue_stats(queue).map(|(_, consumers)| consumers)
    }

    pub fn queue_exists(&self, queue: &str) -> bool {
        self.inner.lock().queue_stats(queue).is_some()
    }

    pub fn exchange_exists(&self, exchange: &str) -> bool {
        self.inner.lock().exchange_exists(exchange)
    }

    /// Number of delivered but not yet settled messages on all channels.
    pub fn unacked_count(&self) -> usize {
        self.inner.lock().unacked_count()
    }

    /// Number of open and logged in connections.
    pub fn connection_count(&self) -> usize {
        self.inner.lock().connection_count()
    }

    /// Cancel a consumer from the server side. Connections which support it get a
    /// `Basic.Cancel`.
    pub fn cancel_consumer(&self, consumer_tag: &str) -> bool {
        self.inner.update(|s| s.cancel_consumer(consumer_tag))
    }

    /// Close the channel of a consumer with a channel error.
    pub fn close_consumer_channel(&self, consumer_tag: &str, code: u16, text: &str) -> bool {
        self.inner.update(|s| s.close_consumer_channel(consumer_tag, code, text))
    }

    /// Send `Connection.Close` to every client.
    pub fn close_connections(&self, code: u16, text: &str) {
        self.inner.update(|s| s.close_connections(code, text));
    }

    /// Simulate a network failure on every connection.
    pub fn drop_connections(&self) {
        self.inner.update(|s| s.drop_connections());
    }
}

impl Connector for MemoryBroker {
    fn open(&self, host: &str, port: u16, _timeout: Duration) -> BrokerResult<Box<dyn Transport>> {
        let conn = self.inner.update(|s| s.open())?;

        debug!("Connection {conn} opened to {host}:{port}");

        Ok(Box::new(MemoryTransport {
            broker: Arc::clone(&self.inner),
            conn,
        }))
    }
}

/// The client end of a connection to a [`MemoryBroker`].
#[derive(Debug)]
pub struct MemoryTransport {
    broker: Arc<Inner>,
    conn: ConnId,
}

impl MemoryTransport {
    /// Run a channel method. A channel error closes the channel, a connection error closes the
    /// connection on the server side.
    fn on_channel<T, F>(&mut self, channel: ChannelNumber, cm: model::ClassMethod, f: F) -> BrokerResult<T>
    where
        F: FnOnce(&mut ServerState, ConnId) -> BrokerResult<T>,
    {
        let conn = self.conn;

        self.broker.update(|s| {
            let result = s.check_channel(conn, channel, cm).and_then(|_| f(s, conn));

            match &result {
                Err(RpcError::Server(MethodFrame::ChannelClose { channel, args })) => {
                    trace!("Channel {channel} closed with {} {}", args.code, args.text);

                    s.close_channel(conn, *channel);
                }
                Err(RpcError::Server(MethodFrame::ConnectionClose(args))) => {
                    trace!("Connection {conn} closed with {} {}", args.code, args.text);

                    s.remove_connection(conn);
                }
                _ => (),
            }

            result
        })
    }
}

impl Transport for MemoryTransport {
    fn login(&mut self, vhost: &str, username: &str, password: &str, properties: &FieldTable) -> BrokerResult<()> {
        let conn = self.conn;

        self.broker.update(|s| {
            let result = s.login(conn, vhost, username, password, properties);

            if let Err(RpcError::Server(_)) = result {
                s.remove_connection(conn);
            }

            result
        })
    }

    fn connection_close(&mut self, _code: u16, _text: &str) -> BrokerResult<()> {
        let conn = self.conn;

        self.broker.update(|s| {
            let result = s.check_conn(conn);

            s.remove_connection(conn);

            result
        })
    }

    fn channel_open(&mut self, channel: ChannelNumber) -> BrokerResult<()> {
        let conn = self.conn;

        self.broker.update(|s| {
            let result = s.channel_open(conn, channel);

            if let Err(RpcError::Server(_)) = result {
                s.remove_connection(conn);
            }

            result
        })
    }

    fn channel_close(&mut self, channel: ChannelNumber, _code: u16, _text: &str) -> BrokerResult<()> {
        let conn = self.conn;

        self.broker.update(|s| {
            s.check_conn(conn)?;
            s.close_channel(conn, channel);

            Ok(())
        })
    }

    fn exchange_declare(&mut self, channel: ChannelNumber, args: &ExchangeDeclareArgs) -> BrokerResult<()> {
        self.on_channel(channel, model::EXCHANGE_DECLARE, |s, conn| {
            s.exchange_declare(conn, channel, args)
        })
    }

    fn exchange_delete(&mut self, channel: ChannelNumber, exchange: &str, if_unused: bool) -> BrokerResult<()> {
        self.on_channel(channel, model::EXCHANGE_DELETE, |s, conn| {
            s.exchange_delete(conn, channel, exchange, if_unused)
        })
    }

    fn exchange_bind(&mut self, channel: ChannelNumber, args: &BindArgs) -> BrokerResult<()> {
        self.on_channel(channel, model::EXCHANGE_BIND, |s, conn| {
            s.exchange_bind(conn, channel, args, true)
        })
    }

    fn exchange_unbind(&mut self, channel: ChannelNumber, args: &BindArgs) -> BrokerResult<()> {
        self.on_channel(channel, model::EXCHANGE_UNBIND, |s, conn| {
            s.exchange_bind(conn, channel, args, false)
        })
    }

    fn queue_declare(&mut self, channel: ChannelNumber, args: &QueueDeclareArgs) -> BrokerResult<QueueDeclareOk> {
        self.on_channel(channel, model::QUEUE_DECLARE, |s, conn| {
            s.queue_declare(conn, channel, args)
        })
    }

    fn queue_delete(
        &mut self,
        channel: ChannelNumber,
        queue: &str,
        if_unused: bool,
        if_empty: bool,
    ) -> BrokerResult<u32> {
        self.on_channel(channel, model::QUEUE_DELETE, |s, conn| {
            s.queue_delete(conn, channel, queue, if_unused, if_empty)
        })
    }

    fn queue_bind(&mut self, channel: ChannelNumber, args: &BindArgs) -> BrokerResult<()> {
        self.on_channel(channel, model::QUEUE_BIND, |s, conn| s.queue_bind(conn, channel, args, true))
    }

    fn queue_unbind(&mut self, channel: ChannelNumber, args: &BindArgs) -> BrokerResult<()> {
        self.on_channel(channel, model::QUEUE_UNBIND, |s, conn| {
            s.queue_bind(conn, channel, args, false)
        })
    }

    fn queue_purge(&mut self, channel: ChannelNumber, queue: &str) -> BrokerResult<u32> {
        self.on_channel(channel, model::QUEUE_PURGE, |s, conn| s.queue_purge(conn, channel, queue))
    }

    fn basic_qos(&mut self, channel: ChannelNumber, prefetch_count: u16, _global: bool) -> BrokerResult<()> {
        self.on_channel(channel, model::BASIC_QOS, |s, conn| {
            s.basic_qos(conn, channel, prefetch_count)
        })
    }

    fn basic_publish(
        &mut self,
        channel: ChannelNumber,
        exchange: &str,
        routing_key: &str,
        flags: BasicPublishFlags,
        content: &Content,
    ) -> BrokerResult<()> {
        self.on_channel(channel, model::BASIC_PUBLISH, |s, conn| {
            s.basic_publish(conn, channel, exchange, routing_key, flags, content)
        })
    }

    fn basic_get(&mut self, channel: ChannelNumber, queue: &str, no_ack: bool) -> BrokerResult<Option<GetMessage>> {
        self.on_channel(channel, model::BASIC_GET, |s, conn| {
            s.basic_get(conn, channel, queue, no_ack)
        })
    }

    fn basic_ack(&mut self, channel: ChannelNumber, delivery_tag: u64, multiple: bool) -> BrokerResult<()> {
        self.on_channel(channel, model::BASIC_ACK, |s, conn| {
            s.settle(conn, channel, delivery_tag, multiple, None, model::BASIC_ACK)
        })
    }

    fn basic_nack(
        &mut self,
        channel: ChannelNumber,
        delivery_tag: u64,
        multiple: bool,
        requeue: bool,
    ) -> BrokerResult<()> {
        self.on_channel(channel, model::BASIC_NACK, |s, conn| {
            s.settle(conn, channel, delivery_tag, multiple, Some(requeue), model::BASIC_NACK)
        })
    }

    fn basic_reject(&mut self, channel: ChannelNumber, delivery_tag: u64, requeue: bool) -> BrokerResult<()> {
        self.on_channel(channel, model::BASIC_REJECT, |s, conn| {
            s.settle(conn, channel, delivery_tag, false, Some(requeue), model::BASIC_REJECT)
        })
    }

    fn basic_consume(&mut self, channel: ChannelNumber, args: &BasicConsumeArgs) -> BrokerResult<String> {
        self.on_channel(channel, model::BASIC_CONSUME, |s, conn| {
            s.basic_consume(conn, channel, args)
        })
    }

    fn basic_cancel(&mut self, channel: ChannelNumber, consumer_tag: &str) -> BrokerResult<()> {
        self.on_channel(channel, model::BASIC_CANCEL, |s, conn| s.basic_cancel(conn, consumer_tag))
    }

    fn consume_message(&mut self, timeout: Duration) -> BrokerResult<Envelope> {
        let conn = self.conn;

        self.broker
            .wait_for(timeout, |s| s.poll_delivery(conn))
            .unwrap_or(Err(RpcError::Library(crate::broker::LibraryStatus::Timeout)))
    }

    fn next_frame(&mut self, timeout: Duration) -> BrokerResult<MethodFrame> {
        let conn = self.conn;

        self.broker
            .wait_for(timeout, |s| s.poll_frame(conn))
            .unwrap_or(Err(RpcError::Library(crate::broker::LibraryStatus::Timeout)))
    }
}

impl Drop for MemoryTransport {
    fn drop(&mut self) {
        let conn = self.conn;

        self.broker.update(|s| s.remove_connection(conn));
    }
}
