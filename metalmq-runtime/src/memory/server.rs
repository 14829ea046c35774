//! State of the in-memory broker: virtual hosts, connections and channels.
//!
//! Every method works under the broker lock. Deliveries are pushed into the inbox of the
//! consuming connection by `pump`, which respects the prefetch limit of the channels.
use std::collections::{BTreeMap, HashMap, VecDeque};

use rand::distributions::Alphanumeric;
use rand::Rng;

use super::exchange::{self, Binding, Destination, Exchange};
use super::queue::{ConnId, Queue, QueueConsumer, StoredMessage};
use crate::broker::{
    BasicConsumeArgs, BasicPublishFlags, BindArgs, BrokerResult, CloseArgs, ExchangeDeclareArgs, ExchangeDeclareFlags,
    LibraryStatus, MethodFrame, QueueDeclareArgs, QueueDeclareFlags, QueueDeclareOk, RpcError,
};
use crate::message::{Content, Envelope, GetMessage};
use crate::model::{self, ChannelError, ChannelNumber, ClassMethod, ConnectionError, ExchangeType, FieldTable, FieldValue};

pub(crate) const DEFAULT_VHOST: &str = "/";

fn channel_error(channel: ChannelNumber, code: ChannelError, text: String, cm: ClassMethod) -> RpcError {
    RpcError::Server(MethodFrame::ChannelClose {
        channel,
        args: CloseArgs {
            code: code as u16,
            text,
            class_method: cm,
        },
    })
}

fn connection_error(code: ConnectionError, text: String, cm: ClassMethod) -> RpcError {
    RpcError::Server(MethodFrame::ConnectionClose(CloseArgs {
        code: code as u16,
        text,
        class_method: cm,
    }))
}

fn random_name(prefix: &str) -> String {
    let suffix: String = rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(22)
        .map(char::from)
        .collect();

    format!("{prefix}{suffix}")
}

fn is_reserved(name: &str) -> bool {
    name.is_empty() || name.starts_with("amq.")
}

#[derive(Debug)]
struct Unacked {
    queue: String,
    message: StoredMessage,
}

#[derive(Debug, Default)]
struct Channel {
    prefetch: u16,
    last_delivery_tag: u64,
    unacked: BTreeMap<u64, Unacked>,
}

impl Channel {
    fn next_delivery_tag(&mut self) -> u64 {
        self.last_delivery_tag += 1;
        self.last_delivery_tag
    }
}

#[derive(Debug)]
enum ConnStatus {
    Open,
    /// The server closed the connection, the client hasn't left yet.
    Closed,
    /// The socket is gone.
    Dropped,
}

#[derive(Debug)]
struct Conn {
    /// Set by a successful login.
    vhost: Option<String>,
    cancel_notify: bool,
    status: ConnStatus,
    channels: HashMap<ChannelNumber, Channel>,
    inbox: VecDeque<Envelope>,
    frames: VecDeque<MethodFrame>,
}

#[derive(Debug)]
struct VirtualHost {
    exchanges: HashMap<String, Exchange>,
    queues: HashMap<String, Queue>,
}

impl VirtualHost {
    fn new() -> Self {
        let mut exchanges = HashMap::new();

        exchanges.insert("amq.direct".to_string(), Exchange::new(ExchangeType::Direct));
        exchanges.insert("amq.fanout".to_string(), Exchange::new(ExchangeType::Fanout));
        exchanges.insert("amq.topic".to_string(), Exchange::new(ExchangeType::Topic));
        exchanges.insert("amq.headers".to_string(), Exchange::new(ExchangeType::Headers));

        for ex in exchanges.values_mut() {
            ex.durable = true;
        }

        VirtualHost {
            exchanges,
            queues: HashMap::new(),
        }
    }

    /// The queues a message reaches. The default exchange routes by queue name.
    fn route(&self, exchange: &str, routing_key: &str, headers: Option<&FieldTable>) -> Vec<String> {
        if exchange.is_empty() {
            if self.queues.contains_key(routing_key) {
                return vec![routing_key.to_string()];
            }

            return vec![];
        }

        exchange::route(&self.exchanges, exchange, routing_key, headers)
    }

    fn enqueue(&mut self, queues: &[String], exchange: &str, routing_key: &str, content: &Content) {
        for name in queues {
            if let Some(queue) = self.queues.get_mut(name) {
                queue.messages.push_back(StoredMessage {
                    exchange: exchange.to_string(),
                    routing_key: routing_key.to_string(),
                    properties: content.properties.clone(),
                    body: content.body.clone(),
                    redelivered: false,
                });
            }
        }
    }

    /// Remove a queue with its bindings. Returns the consumers it had and the number of messages.
    fn delete_queue(&mut self, name: &str) -> Option<(Vec<QueueConsumer>, u32)> {
        let queue = self.queues.remove(name)?;
        let destination = Destination::Queue(name.to_string());

        for ex in self.exchanges.values_mut() {
            ex.remove_destination(&destination);
        }

        Some((queue.consumers, queue.messages.len() as u32))
    }

    /// Delete the auto delete queue if its last consumer left.
    fn collect_auto_deleted(&mut self, name: &str) {
        let unused = self
            .queues
            .get(name)
            .is_some_and(|q| q.auto_delete && q.had_consumers && q.consumers.is_empty());

        if unused {
            self.delete_queue(name);
        }
    }
}

#[derive(Debug)]
pub(crate) struct ServerState {
    pub(crate) refuse: bool,
    users: HashMap<String, String>,
    vhosts: HashMap<String, VirtualHost>,
    connections: HashMap<ConnId, Conn>,
    next_conn_id: ConnId,
}

impl ServerState {
    pub(crate) fn new() -> Self {
        let mut users = HashMap::new();
        users.insert("guest".to_string(), "guest".to_string());

        let mut vhosts = HashMap::new();
        vhosts.insert(DEFAULT_VHOST.to_string(), VirtualHost::new());

        ServerState {
            refuse: false,
            users,
            vhosts,
            connections: HashMap::new(),
            next_conn_id: 1,
        }
    }

    pub(crate) fn add_user(&mut self, username: &str, password: &str) {
        self.users.insert(username.to_string(), password.to_string());
    }

    pub(crate) fn add_vhost(&mut self, name: &str) {
        self.vhosts.entry(name.to_string()).or_insert_with(VirtualHost::new);
    }

    // Connection level

    pub(crate) fn open(&mut self) -> BrokerResult<ConnId> {
        if self.refuse {
            return Err(RpcError::Library(LibraryStatus::SocketError));
        }

        let id = self.next_conn_id;
        self.next_conn_id += 1;

        self.connections.insert(
            id,
            Conn {
                vhost: None,
                cancel_notify: false,
                status: ConnStatus::Open,
                channels: HashMap::new(),
                inbox: VecDeque::new(),
                frames: VecDeque::new(),
            },
        );

        Ok(id)
    }

    pub(crate) fn login(
        &mut self,
        conn: ConnId,
        vhost: &str,
        username: &str,
        password: &str,
        client_properties: &FieldTable,
    ) -> BrokerResult<()> {
        self.check_conn(conn)?;

        if self.users.get(username).map(String::as_str) != Some(password) {
            return Err(connection_error(
                ConnectionError::AccessRefused,
                "ACCESS_REFUSED - Login was refused using authentication mechanism PLAIN".to_string(),
                model::CONNECTION_OPEN,
            ));
        }

        if !self.vhosts.contains_key(vhost) {
            return Err(connection_error(
                ConnectionError::NotAllowed,
                format!("NOT_ALLOWED - vhost '{vhost}' not found"),
                model::CONNECTION_OPEN,
            ));
        }

        let cancel_notify = match client_properties.get("capabilities") {
            Some(FieldValue::FieldTable(caps)) => {
                matches!(caps.get("consumer_cancel_notify"), Some(FieldValue::Bool(true)))
            }
            _ => false,
        };

        if let Some(c) = self.connections.get_mut(&conn) {
            c.vhost = Some(vhost.to_string());
            c.cancel_notify = cancel_notify;
        }

        Ok(())
    }

    /// Check that the connection can serve RPCs.
    pub(crate) fn check_conn(&self, conn: ConnId) -> BrokerResult<()> {
        match self.connections.get(&conn).map(|c| &c.status) {
            Some(ConnStatus::Open) => Ok(()),
            Some(ConnStatus::Dropped) => Err(RpcError::Library(LibraryStatus::SocketError)),
            Some(ConnStatus::Closed) | None => Err(RpcError::Library(LibraryStatus::ConnectionClosed)),
        }
    }

    /// Check that the connection is logged in and the channel is open.
    pub(crate) fn check_channel(&self, conn: ConnId, channel: ChannelNumber, cm: ClassMethod) -> BrokerResult<()> {
        self.check_conn(conn)?;

        let c = &self.connections[&conn];

        if c.vhost.is_none() {
            return Err(connection_error(
                ConnectionError::CommandInvalid,
                "COMMAND_INVALID - connection is not open".to_string(),
                cm,
            ));
        }

        if !c.channels.contains_key(&channel) {
            return Err(connection_error(
                ConnectionError::ChannelError,
                format!("CHANNEL_ERROR - expected 'channel.open' on channel {channel}"),
                cm,
            ));
        }

        Ok(())
    }

    /// Forget a connection, requeueing what it didn't ack.
    pub(crate) fn remove_connection(&mut self, conn: ConnId) {
        self.shutdown_connection(conn);
        self.connections.remove(&conn);
    }

    /// Close all the channels of a connection and delete its exclusive queues, the entry itself
    /// is kept.
    fn shutdown_connection(&mut self, conn: ConnId) {
        let Some(c) = self.connections.get(&conn) else {
            return;
        };

        let channels: Vec<ChannelNumber> = c.channels.keys().copied().collect();
        let vhost = c.vhost.clone();

        for ch in channels {
            self.close_channel(conn, ch);
        }

        if let Some(vh) = vhost.and_then(|v| self.vhosts.get_mut(&v)) {
            let exclusive: Vec<String> = vh
                .queues
                .iter()
                .filter(|(_, q)| q.owner == Some(conn))
                .map(|(name, _)| name.clone())
                .collect();

            for name in exclusive {
                if let Some((consumers, _)) = vh.delete_queue(&name) {
                    notify_cancelled(&mut self.connections, &consumers);
                }
            }
        }
    }

    pub(crate) fn connection_count(&self) -> usize {
        self.connections
            .values()
            .filter(|c| matches!(c.status, ConnStatus::Open) && c.vhost.is_some())
            .count()
    }

    pub(crate) fn close_connections(&mut self, code: u16, text: &str) {
        let ids: Vec<ConnId> = self.open_connections();

        for id in ids {
            self.shutdown_connection(id);

            if let Some(c) = self.connections.get_mut(&id) {
                c.status = ConnStatus::Closed;
                c.inbox.clear();
                c.frames.push_back(MethodFrame::ConnectionClose(CloseArgs {
                    code,
                    text: text.to_string(),
                    class_method: 0,
                }));
            }
        }
    }

    pub(crate) fn drop_connections(&mut self) {
        let ids: Vec<ConnId> = self.open_connections();

        for id in ids {
            self.shutdown_connection(id);

            if let Some(c) = self.connections.get_mut(&id) {
                c.status = ConnStatus::Dropped;
                c.inbox.clear();
                c.frames.clear();
            }
        }
    }

    fn open_connections(&self) -> Vec<ConnId> {
        self.connections
            .iter()
            .filter(|(_, c)| matches!(c.status, ConnStatus::Open))
            .map(|(id, _)| *id)
            .collect()
    }

    /// Take the next delivery or the information that a method frame is waiting. `None` means
    /// nothing has arrived yet.
    pub(crate) fn poll_delivery(&mut self, conn: ConnId) -> Option<BrokerResult<Envelope>> {
        let Some(c) = self.connections.get_mut(&conn) else {
            return Some(Err(RpcError::Library(LibraryStatus::ConnectionClosed)));
        };

        if !c.frames.is_empty() {
            return Some(Err(RpcError::Library(LibraryStatus::UnexpectedFrame)));
        }

        match c.status {
            ConnStatus::Open => c.inbox.pop_front().map(Ok),
            ConnStatus::Closed => Some(Err(RpcError::Library(LibraryStatus::ConnectionClosed))),
            ConnStatus::Dropped => Some(Err(RpcError::Library(LibraryStatus::SocketClosed))),
        }
    }

    pub(crate) fn poll_frame(&mut self, conn: ConnId) -> Option<BrokerResult<MethodFrame>> {
        let Some(c) = self.connections.get_mut(&conn) else {
            return Some(Err(RpcError::Library(LibraryStatus::ConnectionClosed)));
        };

        if let Some(frame) = c.frames.pop_front() {
            return Some(Ok(frame));
        }

        match c.status {
            ConnStatus::Open => None,
            ConnStatus::Closed => Some(Err(RpcError::Library(LibraryStatus::ConnectionClosed))),
            ConnStatus::Dropped => Some(Err(RpcError::Library(LibraryStatus::SocketClosed))),
        }
    }

    // Channel level

    pub(crate) fn channel_open(&mut self, conn: ConnId, channel: ChannelNumber) -> BrokerResult<()> {
        self.check_conn(conn)?;

        let c = self
            .connections
            .get_mut(&conn)
            .ok_or(RpcError::Library(LibraryStatus::ConnectionClosed))?;

        if c.vhost.is_none() {
            return Err(connection_error(
                ConnectionError::CommandInvalid,
                "COMMAND_INVALID - connection is not open".to_string(),
                model::CHANNEL_OPEN,
            ));
        }

        if channel == 0 || c.channels.contains_key(&channel) {
            return Err(connection_error(
                ConnectionError::ChannelError,
                format!("CHANNEL_ERROR - second 'channel.open' seen on channel {channel}"),
                model::CHANNEL_OPEN,
            ));
        }

        c.channels.insert(channel, Channel::default());

        Ok(())
    }

    /// Close a channel: cancel its consumers, requeue its unacked messages and drop the deliveries
    /// not yet read.
    pub(crate) fn close_channel(&mut self, conn: ConnId, channel: ChannelNumber) {
        let Some(c) = self.connections.get_mut(&conn) else {
            return;
        };

        let Some(chan) = c.channels.remove(&channel) else {
            return;
        };

        c.inbox.retain(|env| env.channel != channel);
        c.frames.retain(|f| match f {
            MethodFrame::BasicCancel { channel: ch, .. } | MethodFrame::Other { channel: ch, .. } => *ch != channel,
            _ => true,
        });

        let Some(vh) = c.vhost.as_ref().and_then(|v| self.vhosts.get_mut(v)) else {
            return;
        };

        // put them back in reverse order so the queue order is kept
        for (_, unacked) in chan.unacked.into_iter().rev() {
            if let Some(queue) = vh.queues.get_mut(&unacked.queue) {
                queue.requeue(unacked.message);
            }
        }

        let names: Vec<String> = vh.queues.keys().cloned().collect();

        for name in names {
            if let Some(queue) = vh.queues.get_mut(&name) {
                queue.remove_consumers_where(|qc| qc.conn == conn && qc.channel == channel);
            }

            vh.collect_auto_deleted(&name);
        }
    }

    // Helpers for the operations

    fn vhost_name(&self, conn: ConnId) -> BrokerResult<String> {
        self.connections
            .get(&conn)
            .and_then(|c| c.vhost.clone())
            .ok_or(RpcError::Library(LibraryStatus::ConnectionClosed))
    }

    fn vhost_mut(&mut self, conn: ConnId) -> BrokerResult<(String, &mut VirtualHost)> {
        let name = self.vhost_name(conn)?;

        match self.vhosts.get_mut(&name) {
            Some(vh) => Ok((name, vh)),
            None => Err(RpcError::Library(LibraryStatus::ConnectionClosed)),
        }
    }

    fn channel_mut(&mut self, conn: ConnId, channel: ChannelNumber) -> BrokerResult<&mut Channel> {
        self.connections
            .get_mut(&conn)
            .and_then(|c| c.channels.get_mut(&channel))
            .ok_or(RpcError::Library(LibraryStatus::UnexpectedState))
    }

    /// Look up a queue the connection is allowed to use.
    fn usable_queue<'a>(
        vh: &'a mut VirtualHost,
        vhost: &str,
        conn: ConnId,
        channel: ChannelNumber,
        name: &str,
        cm: ClassMethod,
    ) -> BrokerResult<&'a mut Queue> {
        let Some(queue) = vh.queues.get_mut(name) else {
            return Err(channel_error(
                channel,
                ChannelError::NotFound,
                format!("NOT_FOUND - no queue '{name}' in vhost '{vhost}'"),
                cm,
            ));
        };

        if queue.owner.is_some_and(|owner| owner != conn) {
            return Err(channel_error(
                channel,
                ChannelError::ResourceLocked,
                format!("RESOURCE_LOCKED - cannot obtain exclusive access to locked queue '{name}' in vhost '{vhost}'"),
                cm,
            ));
        }

        Ok(queue)
    }

    fn check_exchange(
        vh: &VirtualHost,
        vhost: &str,
        channel: ChannelNumber,
        name: &str,
        cm: ClassMethod,
    ) -> BrokerResult<()> {
        if name.is_empty() {
            return Err(channel_error(
                channel,
                ChannelError::AccessRefused,
                "ACCESS_REFUSED - operation not permitted on the default exchange".to_string(),
                cm,
            ));
        }

        if !vh.exchanges.contains_key(name) {
            return Err(channel_error(
                channel,
                ChannelError::NotFound,
                format!("NOT_FOUND - no exchange '{name}' in vhost '{vhost}'"),
                cm,
            ));
        }

        Ok(())
    }

    // Exchange class

    pub(crate) fn exchange_declare(
        &mut self,
        conn: ConnId,
        channel: ChannelNumber,
        args: &ExchangeDeclareArgs,
    ) -> BrokerResult<()> {
        let cm = model::EXCHANGE_DECLARE;
        let (vhost, vh) = self.vhost_mut(conn)?;
        let name = &args.exchange_name;
        let durable = args.flags.contains(ExchangeDeclareFlags::DURABLE);

        if let Some(ex) = vh.exchanges.get(name) {
            if args.flags.contains(ExchangeDeclareFlags::PASSIVE) {
                return Ok(());
            }

            if ex.exchange_type != args.exchange_type {
                return Err(channel_error(
                    channel,
                    ChannelError::PreconditionFailed,
                    format!(
                        "PRECONDITION_FAILED - inequivalent arg 'type' for exchange '{name}' in vhost '{vhost}': \
                         received '{}' but current is '{}'",
                        args.exchange_type, ex.exchange_type
                    ),
                    cm,
                ));
            }

            if ex.durable != durable {
                return Err(channel_error(
                    channel,
                    ChannelError::PreconditionFailed,
                    format!(
                        "PRECONDITION_FAILED - inequivalent arg 'durable' for exchange '{name}' in vhost '{vhost}': \
                         received '{durable}' but current is '{}'",
                        ex.durable
                    ),
                    cm,
                ));
            }

            return Ok(());
        }

        if args.flags.contains(ExchangeDeclareFlags::PASSIVE) {
            return Err(channel_error(
                channel,
                ChannelError::NotFound,
                format!("NOT_FOUND - no exchange '{name}' in vhost '{vhost}'"),
                cm,
            ));
        }

        if is_reserved(name) {
            return Err(channel_error(
                channel,
                ChannelError::AccessRefused,
                format!("ACCESS_REFUSED - exchange name '{name}' contains reserved prefix 'amq.*'"),
                cm,
            ));
        }

        let mut ex = Exchange::new(args.exchange_type);
        ex.durable = durable;
        ex.auto_delete = args.flags.contains(ExchangeDeclareFlags::AUTO_DELETE);
        ex.internal = args.flags.contains(ExchangeDeclareFlags::INTERNAL);

        vh.exchanges.insert(name.clone(), ex);

        Ok(())
    }

    pub(crate) fn exchange_delete(
        &mut self,
        conn: ConnId,
        channel: ChannelNumber,
        name: &str,
        if_unused: bool,
    ) -> BrokerResult<()> {
        let cm = model::EXCHANGE_DELETE;
        let (vhost, vh) = self.vhost_mut(conn)?;

        if is_reserved(name) {
            return Err(channel_error(
                channel,
                ChannelError::AccessRefused,
                format!("ACCESS_REFUSED - operation not permitted on exchange '{name}'"),
                cm,
            ));
        }

        Self::check_exchange(vh, &vhost, channel, name, cm)?;

        if if_unused && vh.exchanges.get(name).is_some_and(|ex| !ex.bindings.is_empty()) {
            return Err(channel_error(
                channel,
                ChannelError::PreconditionFailed,
                format!("PRECONDITION_FAILED - exchange '{name}' in vhost '{vhost}' in use"),
                cm,
            ));
        }

        vh.exchanges.remove(name);

        let destination = Destination::Exchange(name.to_string());
        for ex in vh.exchanges.values_mut() {
            ex.remove_destination(&destination);
        }

        Ok(())
    }

    pub(crate) fn exchange_bind(
        &mut self,
        conn: ConnId,
        channel: ChannelNumber,
        binding: &BindArgs,
        bind: bool,
    ) -> BrokerResult<()> {
        let cm = if bind { model::EXCHANGE_BIND } else { model::EXCHANGE_UNBIND };
        let (vhost, vh) = self.vhost_mut(conn)?;

        Self::check_exchange(vh, &vhost, channel, &binding.destination, cm)?;
        Self::check_exchange(vh, &vhost, channel, &binding.source, cm)?;

        let destination = Destination::Exchange(binding.destination.clone());

        update_binding(vh, &binding.source, destination, binding, bind);

        Ok(())
    }

    // Queue class

    pub(crate) fn queue_declare(
        &mut self,
        conn: ConnId,
        channel: ChannelNumber,
        args: &QueueDeclareArgs,
    ) -> BrokerResult<QueueDeclareOk> {
        let cm = model::QUEUE_DECLARE;
        let (vhost, vh) = self.vhost_mut(conn)?;

        let passive = args.flags.contains(QueueDeclareFlags::PASSIVE);
        let durable = args.flags.contains(QueueDeclareFlags::DURABLE);
        let exclusive = args.flags.contains(QueueDeclareFlags::EXCLUSIVE);
        let auto_delete = args.flags.contains(QueueDeclareFlags::AUTO_DELETE);

        let name = if args.name.is_empty() && !passive {
            random_name("amq.gen-")
        } else {
            args.name.clone()
        };

        if vh.queues.contains_key(&name) {
            let queue = Self::usable_queue(vh, &vhost, conn, channel, &name, cm)?;

            if !passive {
                let checks = [
                    ("durable", queue.durable, durable),
                    ("exclusive", queue.owner.is_some(), exclusive),
                    ("auto_delete", queue.auto_delete, auto_delete),
                ];

                for (arg, current, received) in checks {
                    if current != received {
                        return Err(channel_error(
                            channel,
                            ChannelError::PreconditionFailed,
                            format!(
                                "PRECONDITION_FAILED - inequivalent arg '{arg}' for queue '{name}' in vhost \
                                 '{vhost}': received '{received}' but current is '{current}'"
                            ),
                            cm,
                        ));
                    }
                }
            }

            return Ok(QueueDeclareOk {
                message_count: queue.messages.len() as u32,
                consumer_count: queue.consumers.len() as u32,
                queue: name,
            });
        }

        if passive {
            return Err(channel_error(
                channel,
                ChannelError::NotFound,
                format!("NOT_FOUND - no queue '{name}' in vhost '{vhost}'"),
                cm,
            ));
        }

        if !args.name.is_empty() && args.name.starts_with("amq.") {
            return Err(channel_error(
                channel,
                ChannelError::AccessRefused,
                format!("ACCESS_REFUSED - queue name '{name}' contains reserved prefix 'amq.*'"),
                cm,
            ));
        }

        vh.queues
            .insert(name.clone(), Queue::new(durable, auto_delete, exclusive.then_some(conn)));

        Ok(QueueDeclareOk {
            queue: name,
            message_count: 0,
            consumer_count: 0,
        })
    }

    pub(crate) fn queue_bind(
        &mut self,
        conn: ConnId,
        channel: ChannelNumber,
        binding: &BindArgs,
        bind: bool,
    ) -> BrokerResult<()> {
        let cm = if bind { model::QUEUE_BIND } else { model::QUEUE_UNBIND };
        let (vhost, vh) = self.vhost_mut(conn)?;

        Self::usable_queue(vh, &vhost, conn, channel, &binding.destination, cm)?;
        Self::check_exchange(vh, &vhost, channel, &binding.source, cm)?;

        let destination = Destination::Queue(binding.destination.clone());

        update_binding(vh, &binding.source, destination, binding, bind);

        Ok(())
    }

    pub(crate) fn queue_purge(&mut self, conn: ConnId, channel: ChannelNumber, name: &str) -> BrokerResult<u32> {
        let (vhost, vh) = self.vhost_mut(conn)?;
        let queue = Self::usable_queue(vh, &vhost, conn, channel, name, model::QUEUE_PURGE)?;
        let count = queue.messages.len() as u32;

        queue.messages.clear();

        Ok(count)
    }

    pub(crate) fn queue_delete(
        &mut self,
        conn: ConnId,
        channel: ChannelNumber,
        name: &str,
        if_unused: bool,
        if_empty: bool,
    ) -> BrokerResult<u32> {
        let cm = model::QUEUE_DELETE;
        let (vhost, vh) = self.vhost_mut(conn)?;
        let queue = Self::usable_queue(vh, &vhost, conn, channel, name, cm)?;

        if if_unused && !queue.consumers.is_empty() {
            return Err(channel_error(
                channel,
                ChannelError::PreconditionFailed,
                format!("PRECONDITION_FAILED - queue '{name}' in vhost '{vhost}' in use"),
                cm,
            ));
        }

        if if_empty && !queue.messages.is_empty() {
            return Err(channel_error(
                channel,
                ChannelError::PreconditionFailed,
                format!("PRECONDITION_FAILED - queue '{name}' in vhost '{vhost}' is not empty"),
                cm,
            ));
        }

        let (consumers, count) = vh.delete_queue(name).unwrap_or_default();

        notify_cancelled(&mut self.connections, &consumers);

        Ok(count)
    }

    // Basic class

    pub(crate) fn basic_qos(&mut self, conn: ConnId, channel: ChannelNumber, prefetch_count: u16) -> BrokerResult<()> {
        self.channel_mut(conn, channel)?.prefetch = prefetch_count;

        Ok(())
    }

    pub(crate) fn basic_publish(
        &mut self,
        conn: ConnId,
        channel: ChannelNumber,
        exchange: &str,
        routing_key: &str,
        flags: BasicPublishFlags,
        content: &Content,
    ) -> BrokerResult<()> {
        let cm = model::BASIC_PUBLISH;
        let (vhost, vh) = self.vhost_mut(conn)?;

        if !exchange.is_empty() {
            match vh.exchanges.get(exchange) {
                None => {
                    return Err(channel_error(
                        channel,
                        ChannelError::NotFound,
                        format!("NOT_FOUND - no exchange '{exchange}' in vhost '{vhost}'"),
                        cm,
                    ))
                }
                Some(ex) if ex.internal => {
                    return Err(channel_error(
                        channel,
                        ChannelError::AccessRefused,
                        format!("ACCESS_REFUSED - cannot publish to internal exchange '{exchange}' in vhost '{vhost}'"),
                        cm,
                    ))
                }
                Some(_) => (),
            }
        }

        let queues = vh.route(exchange, routing_key, content.properties.headers.as_ref());

        vh.enqueue(&queues, exchange, routing_key, content);

        if queues.is_empty() && flags.contains(BasicPublishFlags::MANDATORY) {
            if let Some(c) = self.connections.get_mut(&conn) {
                c.frames.push_back(MethodFrame::Other {
                    channel,
                    class_method: model::BASIC_RETURN,
                });
            }
        }

        Ok(())
    }

    pub(crate) fn basic_get(
        &mut self,
        conn: ConnId,
        channel: ChannelNumber,
        name: &str,
        no_ack: bool,
    ) -> BrokerResult<Option<GetMessage>> {
        let (vhost, vh) = self.vhost_mut(conn)?;
        let queue = Self::usable_queue(vh, &vhost, conn, channel, name, model::BASIC_GET)?;

        let Some(message) = queue.messages.pop_front() else {
            return Ok(None);
        };

        let message_count = queue.messages.len() as u32;
        let chan = self.channel_mut(conn, channel)?;
        let delivery_tag = chan.next_delivery_tag();

        if !no_ack {
            chan.unacked.insert(
                delivery_tag,
                Unacked {
                    queue: name.to_string(),
                    message: message.clone(),
                },
            );
        }

        Ok(Some(GetMessage {
            message: Content {
                channel,
                body: message.body,
                properties: message.properties,
            },
            delivery_tag,
            redelivered: message.redelivered,
            exchange: message.exchange,
            routing_key: message.routing_key,
            message_count,
        }))
    }

    /// Settle unacked messages. Requeued messages go back to the head of their queue.
    pub(crate) fn settle(
        &mut self,
        conn: ConnId,
        channel: ChannelNumber,
        delivery_tag: u64,
        multiple: bool,
        requeue: Option<bool>,
        cm: ClassMethod,
    ) -> BrokerResult<()> {
        let chan = self.channel_mut(conn, channel)?;

        let tags: Vec<u64> = if multiple {
            chan.unacked
                .range(..=if delivery_tag == 0 { u64::MAX } else { delivery_tag })
                .map(|(tag, _)| *tag)
                .collect()
        } else if chan.unacked.contains_key(&delivery_tag) {
            vec![delivery_tag]
        } else {
            vec![]
        };

        if tags.is_empty() && !(multiple && delivery_tag == 0) {
            return Err(channel_error(
                channel,
                ChannelError::PreconditionFailed,
                format!("PRECONDITION_FAILED - unknown delivery tag {delivery_tag}"),
                cm,
            ));
        }

        let settled: Vec<Unacked> = tags.iter().filter_map(|tag| chan.unacked.remove(tag)).collect();

        if requeue == Some(true) {
            let (_, vh) = self.vhost_mut(conn)?;

            for unacked in settled.into_iter().rev() {
                if let Some(queue) = vh.queues.get_mut(&unacked.queue) {
                    queue.requeue(unacked.message);
                }
            }
        }

        Ok(())
    }

    pub(crate) fn basic_consume(
        &mut self,
        conn: ConnId,
        channel: ChannelNumber,
        args: &BasicConsumeArgs,
    ) -> BrokerResult<String> {
        let cm = model::BASIC_CONSUME;
        let (vhost, vh) = self.vhost_mut(conn)?;

        Self::usable_queue(vh, &vhost, conn, channel, &args.queue, cm)?;

        let tag = if args.consumer_tag.is_empty() {
            random_name("amq.ctag-")
        } else {
            args.consumer_tag.clone()
        };

        let reused = vh
            .queues
            .values()
            .any(|q| q.consumers.iter().any(|c| c.conn == conn && c.tag == tag));

        if reused {
            return Err(connection_error(
                ConnectionError::NotAllowed,
                format!("NOT_ALLOWED - attempt to reuse consumer tag '{tag}'"),
                cm,
            ));
        }

        let exclusive = args.flags.contains(crate::broker::BasicConsumeFlags::EXCLUSIVE);
        let queue = Self::usable_queue(vh, &vhost, conn, channel, &args.queue, cm)?;

        if queue.has_exclusive_consumer() || (exclusive && !queue.consumers.is_empty()) {
            return Err(channel_error(
                channel,
                ChannelError::AccessRefused,
                format!("ACCESS_REFUSED - queue '{}' in vhost '{vhost}' in exclusive use", args.queue),
                cm,
            ));
        }

        queue.add_consumer(QueueConsumer {
            tag: tag.clone(),
            conn,
            channel,
            no_ack: args.flags.contains(crate::broker::BasicConsumeFlags::NO_ACK),
            exclusive,
        });

        Ok(tag)
    }

    pub(crate) fn basic_cancel(&mut self, conn: ConnId, consumer_tag: &str) -> BrokerResult<()> {
        let (_, vh) = self.vhost_mut(conn)?;

        let owner = vh
            .queues
            .iter_mut()
            .find_map(|(name, q)| q.remove_consumer(conn, consumer_tag).map(|_| name.clone()));

        if let Some(name) = owner {
            vh.collect_auto_deleted(&name);
        }

        Ok(())
    }

    /// Move messages from the queues to the inboxes of the consumers as long as the prefetch
    /// limits allow.
    pub(crate) fn pump(&mut self) {
        let ServerState {
            vhosts, connections, ..
        } = self;

        for vh in vhosts.values_mut() {
            for (name, queue) in vh.queues.iter_mut() {
                while !queue.messages.is_empty() {
                    let Some(consumer) = queue.next_consumer(|qc| can_take(connections, qc)) else {
                        break;
                    };

                    let Some(message) = queue.messages.pop_front() else {
                        break;
                    };

                    let Some(c) = connections.get_mut(&consumer.conn) else {
                        break;
                    };

                    let Some(chan) = c.channels.get_mut(&consumer.channel) else {
                        break;
                    };

                    let delivery_tag = chan.next_delivery_tag();

                    if !consumer.no_ack {
                        chan.unacked.insert(
                            delivery_tag,
                            Unacked {
                                queue: name.clone(),
                                message: message.clone(),
                            },
                        );
                    }

                    c.inbox.push_back(Envelope {
                        channel: consumer.channel,
                        consumer_tag: consumer.tag.clone(),
                        delivery_tag,
                        redelivered: message.redelivered,
                        exchange: message.exchange,
                        routing_key: message.routing_key,
                        properties: message.properties,
                        body: message.body,
                    });
                }
            }
        }
    }

    // Server side operations

    pub(crate) fn declare_queue(&mut self, name: &str) {
        if let Some(vh) = self.vhosts.get_mut(DEFAULT_VHOST) {
            vh.queues
                .entry(name.to_string())
                .or_insert_with(|| Queue::new(false, false, None));
        }
    }

    pub(crate) fn publish(&mut self, exchange: &str, routing_key: &str, content: &Content) -> usize {
        let Some(vh) = self.vhosts.get_mut(DEFAULT_VHOST) else {
            return 0;
        };

        let queues = vh.route(exchange, routing_key, content.properties.headers.as_ref());
        vh.enqueue(&queues, exchange, routing_key, content);

        queues.len()
    }

    pub(crate) fn queue_stats(&self, name: &str) -> Option<(u32, u32)> {
        let queue = self.vhosts.get(DEFAULT_VHOST)?.queues.get(name)?;

        Some((queue.messages.len() as u32, queue.consumers.len() as u32))
    }

    pub(crate) fn exchange_exists(&self, name: &str) -> bool {
        self.vhosts
            .get(DEFAULT_VHOST)
            .is_some_and(|vh| vh.exchanges.contains_key(name))
    }

    pub(crate) fn unacked_count(&self) -> usize {
        self.connections
            .values()
            .flat_map(|c| c.channels.values())
            .map(|ch| ch.unacked.len())
            .sum()
    }

    /// Cancel a consumer as if its queue had gone away.
    pub(crate) fn cancel_consumer(&mut self, consumer_tag: &str) -> bool {
        let mut removed = vec![];

        for vh in self.vhosts.values_mut() {
            for q in vh.queues.values_mut() {
                removed.extend(q.remove_consumers_where(|c| c.tag == consumer_tag));
            }
        }

        notify_cancelled(&mut self.connections, &removed);

        !removed.is_empty()
    }

    /// Close the channel of a consumer with a channel error.
    pub(crate) fn close_consumer_channel(&mut self, consumer_tag: &str, code: u16, text: &str) -> bool {
        let found = self
            .vhosts
            .values()
            .flat_map(|vh| vh.queues.values())
            .flat_map(|q| q.consumers.iter())
            .find(|c| c.tag == consumer_tag)
            .map(|c| (c.conn, c.channel));

        let Some((conn, channel)) = found else {
            return false;
        };

        self.close_channel(conn, channel);

        if let Some(c) = self.connections.get_mut(&conn) {
            c.frames.push_back(MethodFrame::ChannelClose {
                channel,
                args: CloseArgs {
                    code,
                    text: text.to_string(),
                    class_method: 0,
                },
            });
        }

        true
    }
}

fn can_take(connections: &HashMap<ConnId, Conn>, qc: &QueueConsumer) -> bool {
    let Some(c) = connections.get(&qc.conn) else {
        return false;
    };

    if !matches!(c.status, ConnStatus::Open) {
        return false;
    }

    match c.channels.get(&qc.channel) {
        Some(chan) => qc.no_ack || chan.prefetch == 0 || chan.unacked.len() < chan.prefetch as usize,
        None => false,
    }
}

fn update_binding(vh: &mut VirtualHost, source: &str, destination: Destination, args: &BindArgs, bind: bool) {
    let Some(ex) = vh.exchanges.get_mut(source) else {
        return;
    };

    if bind {
        ex.bind(Binding {
            destination,
            routing_key: args.routing_key.clone(),
            args: args.args.clone(),
        });
    } else {
        ex.unbind(&destination, &args.routing_key);

        if ex.auto_delete && ex.bindings.is_empty() {
            vh.exchanges.remove(source);
        }
    }
}

/// Tell the connections which asked for it that their consumers are cancelled.
fn notify_cancelled(connections: &mut HashMap<ConnId, Conn>, consumers: &[QueueConsumer]) {
    for qc in consumers {
        if let Some(c) = connections.get_mut(&qc.conn) {
            if c.cancel_notify && matches!(c.status, ConnStatus::Open) {
                c.frames.push_back(MethodFrame::BasicCancel {
                    channel: qc.channel,
                    consumer_tag: qc.tag.clone(),
                });
            }
        }
    }
}
