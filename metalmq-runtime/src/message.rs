use bytes::Bytes;

use crate::model::{ChannelNumber, FieldTable, FieldValue};

/// Standard set of message properties
#[derive(Clone, Debug, Default, PartialEq)]
pub struct MessageProperties {
    pub content_type: Option<String>,
    pub content_encoding: Option<String>,
    pub headers: Option<FieldTable>,
    /// 1 - non-persistent, 2 - persistent
    pub delivery_mode: Option<u8>,
    pub priority: Option<u8>,
    pub correlation_id: Option<String>,
    pub reply_to: Option<String>,
    pub expiration: Option<String>,
    pub message_id: Option<String>,
    pub timestamp: Option<u64>,
    pub message_type: Option<String>,
    pub user_id: Option<String>,
    pub app_id: Option<String>,
    pub cluster_id: Option<String>,
}

/// A message sent to the server or received from the server.
#[derive(Clone, Debug, Default)]
pub struct Content {
    pub channel: ChannelNumber,
    pub body: Bytes,
    pub properties: MessageProperties,
}

/// One message delivered to a consumer together with its routing data, as the broker link
/// returns it from polling.
#[derive(Clone, Debug, Default)]
pub struct Envelope {
    pub channel: ChannelNumber,
    pub consumer_tag: String,
    pub delivery_tag: u64,
    pub redelivered: bool,
    pub exchange: String,
    pub routing_key: String,
    pub properties: MessageProperties,
    pub body: Bytes,
}

/// A delivered message.
///
/// This is the view consumer callbacks get. With the `consumer_tag` and `delivery_tag` one can
/// tell which consumer and which delivery the message belongs to.
#[derive(Clone, Debug, Default)]
pub struct DeliveredMessage {
    pub message: Content,
    pub consumer_tag: String,
    pub delivery_tag: u64,
    pub redelivered: bool,
    pub exchange: String,
    pub routing_key: String,
}

impl DeliveredMessage {
    /// The body as text, invalid UTF-8 sequences are replaced.
    pub fn text(&self) -> std::borrow::Cow<'_, str> {
        String::from_utf8_lossy(&self.message.body)
    }
}

impl From<Envelope> for DeliveredMessage {
    fn from(env: Envelope) -> Self {
        DeliveredMessage {
            message: Content {
                channel: env.channel,
                body: env.body,
                properties: env.properties,
            },
            consumer_tag: env.consumer_tag,
            delivery_tag: env.delivery_tag,
            redelivered: env.redelivered,
            exchange: env.exchange,
            routing_key: env.routing_key,
        }
    }
}

/// A message get by `Basic.Get`.
#[derive(Clone, Debug, Default)]
pub struct GetMessage {
    pub message: Content,
    pub delivery_tag: u64,
    pub redelivered: bool,
    pub exchange: String,
    pub routing_key: String,
    /// Number of messages remained in the queue.
    pub message_count: u32,
}

/// A message published by the client.
#[derive(Clone, Debug, Default)]
pub struct PublishedMessage {
    pub message: Content,
    pub mandatory: bool,
    pub immediate: bool,
}

impl From<&str> for PublishedMessage {
    fn from(value: &str) -> Self {
        PublishedMessage::default().text(value)
    }
}

impl PublishedMessage {
    pub fn text(mut self, value: &str) -> Self {
        self.message.body = Bytes::copy_from_slice(value.as_bytes());
        self
    }

    pub fn body(mut self, value: impl Into<Bytes>) -> Self {
        self.message.body = value.into();
        self
    }

    pub fn content_type(mut self, value: &str) -> Self {
        self.message.properties.content_type = Some(value.to_string());
        self
    }

    pub fn header(mut self, key: &str, value: impl Into<FieldValue>) -> Self {
        self.message
            .properties
            .headers
            .get_or_insert_with(FieldTable::new)
            .insert(key.to_string(), value.into());
        self
    }

    pub fn properties(mut self, properties: MessageProperties) -> Self {
        self.message.properties = properties;
        self
    }

    /// Condition for mandatory publishing. Mandatory messages are failed if the exchange doesn't have
    /// bound queue or if the routing keys are not matched.
    pub fn mandatory(mut self, value: bool) -> Self {
        self.mandatory = value;
        self
    }

    /// Condition for immediate publishing. Immediate messages are received by a server successfully if
    /// they managed to be sent to a consumer immediately.
    pub fn immediate(mut self, value: bool) -> Self {
        self.immediate = value;
        self
    }

    /// Fill the properties the broker expects on every message: plain text content and
    /// non-persistent delivery if the publisher didn't say otherwise.
    pub(crate) fn with_default_properties(mut self) -> Self {
        let props = &mut self.message.properties;

        props.content_type.get_or_insert_with(|| "text/plain".to_string());
        props.delivery_mode.get_or_insert(1);

        self
    }
}
