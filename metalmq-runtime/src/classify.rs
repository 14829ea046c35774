//! Map the failures of the broker link to the smallest piece of state they invalidate.
use crate::broker::{CloseArgs, LibraryStatus, MethodFrame, RpcError};
use crate::error::{ClientError, ErrorKind};
use crate::model::ChannelNumber;

#[derive(Clone, Debug, PartialEq)]
pub enum Resolution {
    /// A normal poll outcome, nothing to do.
    None,
    ConnectionFatal,
    ChannelFatal {
        channel: ChannelNumber,
    },
    ConsumerFatal {
        channel: ChannelNumber,
        consumer_tag: String,
    },
    /// The server sent a method frame, it needs to be read and classified on its own.
    MethodFrame,
    /// Nothing we know how to recover from.
    Unexpected,
}

pub fn classify(err: &RpcError) -> Resolution {
    match err {
        RpcError::Library(LibraryStatus::Timeout) => Resolution::None,
        RpcError::Library(LibraryStatus::UnexpectedFrame) => Resolution::MethodFrame,
        RpcError::Library(
            LibraryStatus::WrongMethod
            | LibraryStatus::UnexpectedState
            | LibraryStatus::ConnectionClosed
            | LibraryStatus::SocketClosed
            | LibraryStatus::SocketError,
        ) => Resolution::ConnectionFatal,
        RpcError::Library(LibraryStatus::Other(_)) => Resolution::Unexpected,
        RpcError::Server(frame) => classify_frame(frame),
    }
}

pub fn classify_frame(frame: &MethodFrame) -> Resolution {
    match frame {
        MethodFrame::ConnectionClose(_) => Resolution::ConnectionFatal,
        MethodFrame::ChannelClose { channel, .. } => Resolution::ChannelFatal { channel: *channel },
        MethodFrame::BasicCancel { channel, consumer_tag } => Resolution::ConsumerFatal {
            channel: *channel,
            consumer_tag: consumer_tag.clone(),
        },
        MethodFrame::Other { .. } => Resolution::Unexpected,
    }
}

/// Build the error the caller sees, the text is the `context` followed by the cause.
pub fn client_error(context: &str, err: &RpcError) -> ClientError {
    let message = format!("{context} {err}");

    match err {
        RpcError::Server(frame) => frame_error(message, frame),
        RpcError::Library(status) => {
            let kind = match classify(err) {
                Resolution::ConnectionFatal => ErrorKind::ConnectionFatal,
                _ => ErrorKind::OperationFailed,
            };

            let mut e = ClientError::new(kind, message);
            if let LibraryStatus::Other(code) = status {
                e.code = u16::try_from(*code).unwrap_or_default();
            }
            e
        }
    }
}

/// Build the error of an out-of-band method frame received while consuming.
pub fn frame_error(message: String, frame: &MethodFrame) -> ClientError {
    let (kind, channel, consumer_tag, code) = match frame {
        MethodFrame::ConnectionClose(CloseArgs { code, .. }) => (ErrorKind::ConnectionFatal, None, None, *code),
        MethodFrame::ChannelClose { channel, args } => (ErrorKind::ChannelFatal, Some(*channel), None, args.code),
        MethodFrame::BasicCancel { channel, consumer_tag } => {
            (ErrorKind::ConsumerFatal, Some(*channel), Some(consumer_tag.clone()), 0)
        }
        MethodFrame::Other { channel, .. } => (ErrorKind::OperationFailed, Some(*channel), None, 0),
    };

    // the method which caused the close, or the method itself
    let class_method = match frame {
        MethodFrame::ConnectionClose(args) | MethodFrame::ChannelClose { args, .. } => args.class_method,
        _ => frame.class_method(),
    };

    ClientError {
        kind,
        channel,
        consumer_tag,
        code,
        message,
        class_method,
    }
}
