//! The interface of the AMQP protocol collaborator.
//!
//! Framing, method encoding and socket I/O live behind [`Connector`] and [`Transport`]. The
//! runtime only drives these calls and interprets their outcome, so any AMQP 0.9.1 client
//! library can be plugged in here. [`crate::memory::MemoryBroker`] is an in-process
//! implementation.
use std::fmt;
use std::time::Duration;

use bitflags::bitflags;

use crate::message::{Content, Envelope, GetMessage};
use crate::model::{self, ChannelNumber, ClassMethod, ExchangeType, FieldTable};

/// Result of a call to the broker link.
pub type BrokerResult<T> = std::result::Result<T, RpcError>;

/// Status codes reported by the protocol library itself (as opposed to the server).
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LibraryStatus {
    /// Nothing arrived in the given time.
    Timeout,
    /// A method frame arrived while waiting for a delivery, it can be read by `next_frame`.
    UnexpectedFrame,
    /// The server replied with a different method than expected.
    WrongMethod,
    /// The protocol state machine got into a state it cannot continue from.
    UnexpectedState,
    ConnectionClosed,
    SocketClosed,
    SocketError,
    Other(i32),
}

impl fmt::Display for LibraryStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LibraryStatus::Timeout => f.write_str("request timed out"),
            LibraryStatus::UnexpectedFrame => f.write_str("unexpected method frame received"),
            LibraryStatus::WrongMethod => f.write_str("wrong method received"),
            LibraryStatus::UnexpectedState => f.write_str("unexpected protocol state"),
            LibraryStatus::ConnectionClosed => f.write_str("connection closed unexpectedly"),
            LibraryStatus::SocketClosed => f.write_str("socket closed unexpectedly"),
            LibraryStatus::SocketError => f.write_str("a socket error occurred"),
            LibraryStatus::Other(code) => write!(f, "library status {code}"),
        }
    }
}

/// Arguments of a server-sent `Connection.Close` or `Channel.Close`.
#[derive(Clone, Debug, PartialEq)]
pub struct CloseArgs {
    pub code: u16,
    pub text: String,
    pub class_method: ClassMethod,
}

/// A method frame the server sent on its own, outside of an RPC reply.
#[derive(Clone, Debug, PartialEq)]
pub enum MethodFrame {
    ConnectionClose(CloseArgs),
    ChannelClose {
        channel: ChannelNumber,
        args: CloseArgs,
    },
    /// The server cancelled a consumer (queue deleted, node failure, etc.).
    BasicCancel {
        channel: ChannelNumber,
        consumer_tag: String,
    },
    Other {
        channel: ChannelNumber,
        class_method: ClassMethod,
    },
}

impl MethodFrame {
    pub fn class_method(&self) -> ClassMethod {
        match self {
            MethodFrame::ConnectionClose(_) => model::CONNECTION_CLOSE,
            MethodFrame::ChannelClose { .. } => model::CHANNEL_CLOSE,
            MethodFrame::BasicCancel { .. } => model::BASIC_CANCEL,
            MethodFrame::Other { class_method, .. } => *class_method,
        }
    }
}

/// Failure of a call to the broker link.
#[derive(Clone, Debug, PartialEq)]
pub enum RpcError {
    Library(LibraryStatus),
    /// The server answered with a close method instead of the expected reply.
    Server(MethodFrame),
}

impl fmt::Display for RpcError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RpcError::Library(status) => write!(f, "Library error: {status}"),
            RpcError::Server(MethodFrame::ConnectionClose(args)) => {
                write!(f, "Server connection error: {}. Disconnected.", args.text)
            }
            RpcError::Server(MethodFrame::ChannelClose { args, .. }) => {
                write!(f, "Server channel error: {}. Open a new channel.", args.text)
            }
            RpcError::Server(frame) => write!(f, "Unexpected server error: {}.", model::method_name(frame.class_method())),
        }
    }
}

impl std::error::Error for RpcError {}

bitflags! {
    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    pub struct ExchangeDeclareFlags: u8 {
        const PASSIVE = 0b00000001;
        const DURABLE = 0b00000010;
        const AUTO_DELETE = 0b00000100;
        const INTERNAL = 0b00001000;
    }
}

impl Default for ExchangeDeclareFlags {
    fn default() -> Self {
        ExchangeDeclareFlags::empty()
    }
}

bitflags! {
    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    pub struct QueueDeclareFlags: u8 {
        const PASSIVE = 0b00000001;
        const DURABLE = 0b00000010;
        const EXCLUSIVE = 0b00000100;
        const AUTO_DELETE = 0b00001000;
    }
}

impl Default for QueueDeclareFlags {
    fn default() -> Self {
        QueueDeclareFlags::empty()
    }
}

bitflags! {
    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    pub struct BasicConsumeFlags: u8 {
        const NO_LOCAL = 0b00000001;
        const NO_ACK = 0b00000010;
        const EXCLUSIVE = 0b00000100;
    }
}

impl Default for BasicConsumeFlags {
    fn default() -> Self {
        BasicConsumeFlags::empty()
    }
}

bitflags! {
    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    pub struct BasicPublishFlags: u8 {
        const MANDATORY = 0b00000001;
        const IMMEDIATE = 0b00000010;
    }
}

impl Default for BasicPublishFlags {
    fn default() -> Self {
        BasicPublishFlags::empty()
    }
}

#[derive(Clone, Debug, Default)]
pub struct ExchangeDeclareArgs {
    pub exchange_name: String,
    pub exchange_type: ExchangeType,
    pub flags: ExchangeDeclareFlags,
    pub args: Option<FieldTable>,
}

impl ExchangeDeclareArgs {
    pub fn exchange_name(mut self, name: &str) -> Self {
        self.exchange_name = name.to_string();
        self
    }

    pub fn exchange_type(mut self, exchange_type: ExchangeType) -> Self {
        self.exchange_type = exchange_type;
        self
    }

    pub fn passive(mut self, mode: bool) -> Self {
        self.flags.set(ExchangeDeclareFlags::PASSIVE, mode);
        self
    }

    pub fn durable(mut self, mode: bool) -> Self {
        self.flags.set(ExchangeDeclareFlags::DURABLE, mode);
        self
    }

    pub fn auto_delete(mut self, mode: bool) -> Self {
        self.flags.set(ExchangeDeclareFlags::AUTO_DELETE, mode);
        self
    }

    pub fn internal(mut self, mode: bool) -> Self {
        self.flags.set(ExchangeDeclareFlags::INTERNAL, mode);
        self
    }

    pub fn args(mut self, args: FieldTable) -> Self {
        self.args = Some(args);
        self
    }
}

#[derive(Clone, Debug, Default)]
pub struct QueueDeclareArgs {
    pub name: String,
    pub flags: QueueDeclareFlags,
    pub args: Option<FieldTable>,
}

impl QueueDeclareArgs {
    pub fn name(mut self, name: &str) -> Self {
        self.name = name.to_string();
        self
    }

    pub fn passive(mut self, mode: bool) -> Self {
        self.flags.set(QueueDeclareFlags::PASSIVE, mode);
        self
    }

    pub fn durable(mut self, mode: bool) -> Self {
        self.flags.set(QueueDeclareFlags::DURABLE, mode);
        self
    }

    pub fn exclusive(mut self, mode: bool) -> Self {
        self.flags.set(QueueDeclareFlags::EXCLUSIVE, mode);
        self
    }

    pub fn auto_delete(mut self, mode: bool) -> Self {
        self.flags.set(QueueDeclareFlags::AUTO_DELETE, mode);
        self
    }

    pub fn args(mut self, args: FieldTable) -> Self {
        self.args = Some(args);
        self
    }
}

/// Reply of the `Queue.Declare`.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct QueueDeclareOk {
    pub queue: String,
    pub message_count: u32,
    pub consumer_count: u32,
}

/// Binding between an exchange (`source`) and a queue or another exchange (`destination`).
#[derive(Clone, Debug, Default)]
pub struct BindArgs {
    pub destination: String,
    pub source: String,
    pub routing_key: String,
    pub args: Option<FieldTable>,
}

impl BindArgs {
    pub fn new(destination: &str, source: &str, routing_key: &str) -> Self {
        BindArgs {
            destination: destination.to_string(),
            source: source.to_string(),
            routing_key: routing_key.to_string(),
            args: None,
        }
    }

    pub fn args(mut self, args: FieldTable) -> Self {
        self.args = Some(args);
        self
    }
}

#[derive(Clone, Debug, Default)]
pub struct BasicConsumeArgs {
    pub queue: String,
    /// Empty consumer tag asks the server to generate one.
    pub consumer_tag: String,
    pub flags: BasicConsumeFlags,
    pub args: Option<FieldTable>,
}

impl BasicConsumeArgs {
    pub fn queue(mut self, queue: &str) -> Self {
        self.queue = queue.to_string();
        self
    }

    pub fn consumer_tag(mut self, consumer_tag: &str) -> Self {
        self.consumer_tag = consumer_tag.to_string();
        self
    }

    pub fn no_ack(mut self, mode: bool) -> Self {
        self.flags.set(BasicConsumeFlags::NO_ACK, mode);
        self
    }

    pub fn exclusive(mut self, mode: bool) -> Self {
        self.flags.set(BasicConsumeFlags::EXCLUSIVE, mode);
        self
    }

    pub fn no_local(mut self, mode: bool) -> Self {
        self.flags.set(BasicConsumeFlags::NO_LOCAL, mode);
        self
    }
}

/// Opens new broker links.
pub trait Connector: Send + Sync {
    /// Open a socket to the server, waiting at most `timeout`.
    fn open(&self, host: &str, port: u16, timeout: Duration) -> BrokerResult<Box<dyn Transport>>;
}

/// One open broker link (one socket). All the calls are blocking RPCs.
pub trait Transport: Send {
    /// Authenticate and open the virtual host. `client_properties` carries the client
    /// capabilities.
    fn login(&mut self, vhost: &str, username: &str, password: &str, client_properties: &FieldTable) -> BrokerResult<()>;
    fn connection_close(&mut self, code: u16, text: &str) -> BrokerResult<()>;

    fn channel_open(&mut self, channel: ChannelNumber) -> BrokerResult<()>;
    fn channel_close(&mut self, channel: ChannelNumber, code: u16, text: &str) -> BrokerResult<()>;

    fn exchange_declare(&mut self, channel: ChannelNumber, args: &ExchangeDeclareArgs) -> BrokerResult<()>;
    fn exchange_delete(&mut self, channel: ChannelNumber, exchange: &str, if_unused: bool) -> BrokerResult<()>;
    fn exchange_bind(&mut self, channel: ChannelNumber, binding: &BindArgs) -> BrokerResult<()>;
    fn exchange_unbind(&mut self, channel: ChannelNumber, binding: &BindArgs) -> BrokerResult<()>;

    fn queue_declare(&mut self, channel: ChannelNumber, args: &QueueDeclareArgs) -> BrokerResult<QueueDeclareOk>;
    /// Returns the number of messages deleted with the queue.
    fn queue_delete(&mut self, channel: ChannelNumber, queue: &str, if_unused: bool, if_empty: bool)
        -> BrokerResult<u32>;
    fn queue_bind(&mut self, channel: ChannelNumber, binding: &BindArgs) -> BrokerResult<()>;
    fn queue_unbind(&mut self, channel: ChannelNumber, binding: &BindArgs) -> BrokerResult<()>;
    /// Returns the number of purged messages.
    fn queue_purge(&mut self, channel: ChannelNumber, queue: &str) -> BrokerResult<u32>;

    fn basic_qos(&mut self, channel: ChannelNumber, prefetch_count: u16, global: bool) -> BrokerResult<()>;
    fn basic_publish(
        &mut self,
        channel: ChannelNumber,
        exchange: &str,
        routing_key: &str,
        flags: BasicPublishFlags,
        content: &Content,
    ) -> BrokerResult<()>;
    /// `None` means the queue was empty (`Basic.GetEmpty`).
    fn basic_get(&mut self, channel: ChannelNumber, queue: &str, no_ack: bool) -> BrokerResult<Option<GetMessage>>;
    fn basic_ack(&mut self, channel: ChannelNumber, delivery_tag: u64, multiple: bool) -> BrokerResult<()>;
    fn basic_nack(&mut self, channel: ChannelNumber, delivery_tag: u64, multiple: bool, requeue: bool)
        -> BrokerResult<()>;
    fn basic_reject(&mut self, channel: ChannelNumber, delivery_tag: u64, requeue: bool) -> BrokerResult<()>;
    /// Returns the consumer tag confirmed by the server.
    fn basic_consume(&mut self, channel: ChannelNumber, args: &BasicConsumeArgs) -> BrokerResult<String>;
    fn basic_cancel(&mut self, channel: ChannelNumber, consumer_tag: &str) -> BrokerResult<()>;

    /// Wait at most `timeout` for the next delivery on any channel of the link.
    ///
    /// If a method frame arrives instead of a delivery, it returns
    /// `LibraryStatus::UnexpectedFrame` and the frame can be read by `next_frame`.
    fn consume_message(&mut self, timeout: Duration) -> BrokerResult<Envelope>;
    /// Read the pending out-of-band method frame.
    fn next_frame(&mut self, timeout: Duration) -> BrokerResult<MethodFrame>;
}
