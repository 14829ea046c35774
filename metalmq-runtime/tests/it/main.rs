mod background;
mod connect;
mod consume;
mod exchange;
mod get;
mod helper;
mod queue;

use metalmq_runtime::*;

pub fn message_from_string(body: &str) -> PublishedMessage {
    use std::time::{SystemTime, UNIX_EPOCH};

    PublishedMessage::default().text(body).properties(MessageProperties {
        content_type: Some("text/plain".into()),
        content_encoding: Some("UTF-8".into()),
        message_id: Some(uuid::Uuid::new_v4().as_hyphenated().to_string()),
        timestamp: Some(SystemTime::now().duration_since(UNIX_EPOCH).unwrap().as_secs()),
        user_id: Some("integration-test".into()),
        app_id: Some("metalmq-runtime-test".into()),
        ..Default::default()
    })
}
