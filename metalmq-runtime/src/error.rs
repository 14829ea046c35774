use crate::model;
use std::fmt;

/// The smallest unit of state a failure invalidates.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ErrorKind {
    /// The connection is unusable, the caller needs to reconnect.
    ConnectionFatal,
    /// The channel is unusable, it is reopened transparently on the next use.
    ChannelFatal,
    /// One consumer got invalidated, the other consumers are unaffected.
    ConsumerFatal,
    /// A one-shot call failed, connection and channel state are unaffected.
    OperationFailed,
}

/// Represents a connection, channel or consumer error. If `channel` is `None` the error doesn't
/// belong to a specific channel.
#[derive(Clone, Debug)]
pub struct ClientError {
    pub kind: ErrorKind,
    pub channel: Option<model::ChannelNumber>,
    pub consumer_tag: Option<String>,
    pub code: u16,
    pub message: String,
    pub class_method: model::ClassMethod,
}

impl ClientError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        ClientError {
            kind,
            channel: None,
            consumer_tag: None,
            code: 0,
            message: message.into(),
            class_method: 0,
        }
    }
}

impl std::fmt::Display for ClientError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClientError")
            .field("kind", &self.kind)
            .field("channel", &self.channel)
            .field("consumer_tag", &self.consumer_tag)
            .field("code", &self.code)
            .field("message", &self.message)
            .field("class_method", &format!("{:08X}", &self.class_method))
            .finish()
    }
}

impl std::error::Error for ClientError {}

/// Shorthand for creating errors.
#[macro_export]
macro_rules! client_error {
    ($kind:expr, $channel:expr, $code:expr, $message:expr, $cm:expr) => {
        ::std::result::Result::Err(anyhow::Error::new($crate::error::ClientError {
            kind: $kind,
            channel: $channel,
            consumer_tag: None,
            code: $code,
            message: ::std::string::String::from($message),
            class_method: $cm,
        }))
    };
}

/// Extract the `ClientError` of a failed result. Panics if the result is not an error or the
/// error is not a `ClientError`, so it is meant for tests.
pub fn to_client_error<T: std::fmt::Debug>(result: anyhow::Result<T>) -> ClientError {
    result.unwrap_err().downcast::<ClientError>().unwrap()
}
