use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;

/// AMQP channel number
pub type ChannelNumber = u16;
/// AMQP method class id
pub type ClassId = u16;
/// AMQP class id method id number
pub type ClassMethod = u32;

pub const CONNECTION_OPEN: ClassMethod = 0x000A0028;
pub const CONNECTION_CLOSE: ClassMethod = 0x000A0032;

pub const CHANNEL_OPEN: ClassMethod = 0x0014000A;
pub const CHANNEL_CLOSE: ClassMethod = 0x00140028;

pub const EXCHANGE_DECLARE: ClassMethod = 0x0028000A;
pub const EXCHANGE_DELETE: ClassMethod = 0x00280014;
pub const EXCHANGE_BIND: ClassMethod = 0x0028001E;
pub const EXCHANGE_UNBIND: ClassMethod = 0x00280028;

pub const QUEUE_DECLARE: ClassMethod = 0x0032000A;
pub const QUEUE_BIND: ClassMethod = 0x00320014;
pub const QUEUE_PURGE: ClassMethod = 0x0032001E;
pub const QUEUE_DELETE: ClassMethod = 0x00320028;
pub const QUEUE_UNBIND: ClassMethod = 0x00320032;

pub const BASIC_QOS: ClassMethod = 0x003C000A;
pub const BASIC_CONSUME: ClassMethod = 0x003C0014;
pub const BASIC_CANCEL: ClassMethod = 0x003C001E;
pub const BASIC_PUBLISH: ClassMethod = 0x003C0028;
pub const BASIC_RETURN: ClassMethod = 0x003C0032;
pub const BASIC_DELIVER: ClassMethod = 0x003C003C;
pub const BASIC_GET: ClassMethod = 0x003C0046;
pub const BASIC_ACK: ClassMethod = 0x003C0050;
pub const BASIC_REJECT: ClassMethod = 0x003C005A;
pub const BASIC_NACK: ClassMethod = 0x003C0078;

/// Split class id and method id from `u32` combined code.
pub fn split_class_method(cm: ClassMethod) -> (ClassId, u16) {
    let method_id = (cm & 0x0000FFFF) as u16;
    let class_id = (cm >> 16) as u16;

    (class_id, method_id)
}

/// Combine class id and method id to a single `u32` value
pub fn unify_class_method(class: ClassId, method: u16) -> ClassMethod {
    ((class as u32) << 16) | (method as u32)
}

/// Human readable name of a method, used in error texts.
pub fn method_name(cm: ClassMethod) -> &'static str {
    match cm {
        CONNECTION_OPEN => "connection.open",
        CONNECTION_CLOSE => "connection.close",
        CHANNEL_OPEN => "channel.open",
        CHANNEL_CLOSE => "channel.close",
        EXCHANGE_DECLARE => "exchange.declare",
        EXCHANGE_DELETE => "exchange.delete",
        EXCHANGE_BIND => "exchange.bind",
        EXCHANGE_UNBIND => "exchange.unbind",
        QUEUE_DECLARE => "queue.declare",
        QUEUE_BIND => "queue.bind",
        QUEUE_PURGE => "queue.purge",
        QUEUE_DELETE => "queue.delete",
        QUEUE_UNBIND => "queue.unbind",
        BASIC_QOS => "basic.qos",
        BASIC_CONSUME => "basic.consume",
        BASIC_CANCEL => "basic.cancel",
        BASIC_PUBLISH => "basic.publish",
        BASIC_RETURN => "basic.return",
        BASIC_DELIVER => "basic.deliver",
        BASIC_GET => "basic.get",
        BASIC_ACK => "basic.ack",
        BASIC_REJECT => "basic.reject",
        BASIC_NACK => "basic.nack",
        _ => "unknown method",
    }
}

/// Error codes in connection scope.
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum ConnectionError {
    /// The server forced to close the connection.
    ConnectionForced = 320,
    /// The client tried to work with an invalid virtual host.
    InvalidPath = 402,
    /// The client tried to access a resource it didn't have access.
    AccessRefused = 403,
    /// The client sent an invalid AMQP frame.
    FrameError = 501,
    /// The client sent a frame which contains erroneous data.
    SyntaxError = 502,
    /// The client sent a frame which didn't fit in the normal order.
    CommandInvalid = 503,
    /// The client tried to access a non-existing or not-opened channel.
    ChannelError = 504,
    /// The client sent an unexpected content header or body frame.
    UnexpectedFrame = 505,
    /// The client tried to exceed the limits of the connection agreed during connection tune.
    ResourceError = 506,
    /// The client tried to work with an entity in a way which is not allowed by the server.
    NotAllowed = 530,
    /// The client tried to use a not implemented funcionality.
    NotImplemented = 540,
    /// The server couldn't fulfill the request because of an intermittent error.
    InternalError = 541,
}

/// Error codes in channel scope.
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum ChannelError {
    /// Denotes successful execution like connection or channel closed.
    Success = 200,
    /// The client attempted to transfer a message which exceeded the limits.
    ContentTooLarge = 311,
    /// The mandatory message cannot be routed to queues.
    NoRoute = 312,
    /// The immediate message cannot be delivered to consumers in the absence of consumers.
    NoConsumers = 313,
    /// The client tried to access a resource it didn't have access.
    AccessRefused = 403,
    /// Queue or entity cannot be found.
    NotFound = 404,
    /// The client cannot access a resource because another client is working on what.
    ResourceLocked = 405,
    /// The work on resource is refused mostly because of validation errors.
    PreconditionFailed = 406,
}

/// Reply code of a normal connection or channel close.
pub const REPLY_SUCCESS: u16 = ChannelError::Success as u16;

/// Type of an exchange, it determines how messages are routed to the bound queues.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum ExchangeType {
    #[default]
    Direct,
    Fanout,
    Topic,
    Headers,
}

impl ExchangeType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ExchangeType::Direct => "direct",
            ExchangeType::Fanout => "fanout",
            ExchangeType::Topic => "topic",
            ExchangeType::Headers => "headers",
        }
    }
}

impl fmt::Display for ExchangeType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ExchangeType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "direct" => Ok(ExchangeType::Direct),
            "fanout" => Ok(ExchangeType::Fanout),
            "topic" => Ok(ExchangeType::Topic),
            "headers" => Ok(ExchangeType::Headers),
            other => Err(format!("unknown exchange type {other}")),
        }
    }
}

/// Type alias for argument and header tables.
pub type FieldTable = HashMap<String, FieldValue>;

/// A value of an argument table or of the message headers.
#[derive(Clone, Debug, PartialEq)]
pub enum FieldValue {
    Void,
    Bool(bool),
    I8(i8),
    I16(i16),
    I32(i32),
    I64(i64),
    U8(u8),
    U16(u16),
    U32(u32),
    F32(f32),
    F64(f64),
    Timestamp(u64),
    LongString(String),
    Bytes(Vec<u8>),
    Array(Vec<FieldValue>),
    FieldTable(Box<FieldTable>),
}

impl From<bool> for FieldValue {
    fn from(value: bool) -> Self {
        FieldValue::Bool(value)
    }
}

impl From<i32> for FieldValue {
    fn from(value: i32) -> Self {
        FieldValue::I32(value)
    }
}

impl From<i64> for FieldValue {
    fn from(value: i64) -> Self {
        FieldValue::I64(value)
    }
}

impl From<f64> for FieldValue {
    fn from(value: f64) -> Self {
        FieldValue::F64(value)
    }
}

impl From<&str> for FieldValue {
    fn from(value: &str) -> Self {
        FieldValue::LongString(value.to_string())
    }
}

impl From<String> for FieldValue {
    fn from(value: String) -> Self {
        FieldValue::LongString(value)
    }
}

impl From<FieldTable> for FieldValue {
    fn from(value: FieldTable) -> Self {
        FieldValue::FieldTable(Box::new(value))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn class_method_split_and_unify() {
        let (class_id, method_id) = split_class_method(BASIC_CONSUME);

        assert_eq!(class_id, 60);
        assert_eq!(method_id, 20);
        assert_eq!(unify_class_method(class_id, method_id), BASIC_CONSUME);
        assert_eq!(method_name(CHANNEL_CLOSE), "channel.close");
    }

    #[test]
    fn exchange_type_parses_known_names() {
        assert_eq!("topic".parse::<ExchangeType>(), Ok(ExchangeType::Topic));
        assert!("x-delayed".parse::<ExchangeType>().is_err());
    }
}
